// Categorical encoders fitted alongside the demand model. Each encoder carries its own
// version and fingerprint so a model can check it is paired with the encoders it was
// trained against.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use crate::service_clock::TimeOfDay;

pub const ONEHOT_ENCODER_VERSION: u32 = 1;
pub const TARGET_ENCODER_VERSION: u32 = 1;

/// One-hot encoding of the time-of-day bucket. Categories are fixed at fit time, sorted by
/// label; a bucket not seen during fitting encodes as all zeros.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneHotEncoder {
    pub encoder_version: u32,
    pub fingerprint: Uuid,
    pub categories: Vec<TimeOfDay>,
}

impl OneHotEncoder {
    pub fn fit(values: impl IntoIterator<Item = TimeOfDay>) -> Self {
        let mut categories: Vec<TimeOfDay> = values.into_iter().collect::<BTreeSet<_>>().into_iter().collect();
        categories.sort_by_key(|c| c.label());
        OneHotEncoder {
            encoder_version: ONEHOT_ENCODER_VERSION,
            fingerprint: Uuid::new_v4(),
            categories,
        }
    }

    pub fn transform(&self, value: TimeOfDay) -> Vec<f64> {
        self.categories
            .iter()
            .map(|c| if *c == value { 1.0 } else { 0.0 })
            .collect()
    }

    pub fn feature_names(&self) -> Vec<String> {
        self.categories
            .iter()
            .map(|c| format!("time_of_day_{}", c.label()))
            .collect()
    }
}

/// Smoothed mean-target encoding of route ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetEncoder {
    pub encoder_version: u32,
    pub fingerprint: Uuid,
    pub min_samples_leaf: f64,
    pub smoothing: f64,
    /// Global target mean; also the encoding of unseen routes.
    pub prior: f64,
    pub mapping: BTreeMap<String, f64>,
}

impl TargetEncoder {
    pub const DEFAULT_MIN_SAMPLES_LEAF: f64 = 20.0;
    pub const DEFAULT_SMOOTHING: f64 = 10.0;

    pub fn fit<'a>(keys: impl IntoIterator<Item = &'a str>, targets: &[f64]) -> Self {
        Self::fit_with(
            keys,
            targets,
            Self::DEFAULT_MIN_SAMPLES_LEAF,
            Self::DEFAULT_SMOOTHING,
        )
    }

    pub fn fit_with<'a>(
        keys: impl IntoIterator<Item = &'a str>,
        targets: &[f64],
        min_samples_leaf: f64,
        smoothing: f64,
    ) -> Self {
        let mut sums: BTreeMap<&str, (f64, usize)> = BTreeMap::new();
        for (key, &y) in keys.into_iter().zip(targets) {
            let entry = sums.entry(key).or_insert((0.0, 0));
            entry.0 += y;
            entry.1 += 1;
        }
        let prior = if targets.is_empty() {
            0.0
        } else {
            targets.iter().sum::<f64>() / targets.len() as f64
        };

        let mapping = sums
            .into_iter()
            .map(|(key, (sum, count))| {
                let encoded = if count == 1 {
                    prior
                } else {
                    let weight = 1.0 / (1.0 + (-(count as f64 - min_samples_leaf) / smoothing).exp());
                    prior * (1.0 - weight) + (sum / count as f64) * weight
                };
                (key.to_string(), encoded)
            })
            .collect();

        TargetEncoder {
            encoder_version: TARGET_ENCODER_VERSION,
            fingerprint: Uuid::new_v4(),
            min_samples_leaf,
            smoothing,
            prior,
            mapping,
        }
    }

    pub fn transform(&self, key: &str) -> f64 {
        self.mapping.get(key).copied().unwrap_or(self.prior)
    }
}
