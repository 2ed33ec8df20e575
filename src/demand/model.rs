use chrono::{DateTime, Utc};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tracing::{info, warn};
use uuid::Uuid;

use super::boosting::{BoostingParams, GradientBoostedRegressor};
use super::encoders::{OneHotEncoder, TargetEncoder};
use super::features::{DemandFeatures, FeatureRow};
use crate::error::{InsightError, Result};

pub const ONEHOT_ENCODER_FILE: &str = "onehot_encoder.json";
pub const TARGET_ENCODER_FILE: &str = "target_encoder.json";
pub const MODEL_FILE: &str = "trained_model.json";

/// Numeric columns in the order the model sees them, before the one-hot columns.
pub const BASE_FEATURES: [&str; 10] = [
    "route_id",
    "month",
    "day",
    "weekday",
    "is_weekend",
    "is_peak_hours",
    "TotalStops",
    "AvgDuration",
    "AvgDistance",
    "AvgSpeed",
];

#[derive(Debug, Clone, Copy)]
pub struct TrainingOptions {
    pub boosting: BoostingParams,
    pub test_ratio: f64,
    pub seed: u64,
}

impl Default for TrainingOptions {
    fn default() -> Self {
        TrainingOptions {
            boosting: BoostingParams::default(),
            test_ratio: 0.2,
            seed: 42,
        }
    }
}

/// The persisted model: the regressor plus the identities of the encoders it was fitted with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub bundle_id: Uuid,
    pub onehot_fingerprint: Uuid,
    pub target_fingerprint: Uuid,
    pub feature_names: Vec<String>,
    pub trained_at: DateTime<Utc>,
    pub train_rows: usize,
    pub test_rows: usize,
    pub mse: f64,
    pub mae: f64,
    pub regressor: GradientBoostedRegressor,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeatureImportance {
    #[serde(rename = "Feature")]
    pub feature: String,
    #[serde(rename = "Importance")]
    pub importance: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TrainingReport {
    pub message: String,
    pub mse: f64,
    pub mae: f64,
    pub feature_importance: Vec<FeatureImportance>,
    pub bundle_id: Uuid,
}

/// Encoders and model from one training run. Only ever used together.
#[derive(Debug, Clone)]
pub struct DemandBundle {
    pub onehot: OneHotEncoder,
    pub target: TargetEncoder,
    pub model: TrainedModel,
}

impl DemandBundle {
    pub fn bundle_id(&self) -> Uuid {
        self.model.bundle_id
    }

    pub fn encode(&self, features: &DemandFeatures) -> Vec<f64> {
        encode_with(&self.onehot, &self.target, features)
    }

    /// Predicted trip count, rounded to the nearest integer and never negative.
    pub fn predict(&self, features: &DemandFeatures) -> i64 {
        let raw = self.model.regressor.predict(&self.encode(features));
        raw.round().max(0.0) as i64
    }

    pub fn report(&self) -> TrainingReport {
        let mut importance: Vec<FeatureImportance> = self
            .model
            .feature_names
            .iter()
            .zip(self.model.regressor.feature_importances())
            .map(|(name, value)| FeatureImportance {
                feature: name.clone(),
                importance: (value * 10_000.0).round() / 10_000.0,
            })
            .collect();
        importance.sort_by(|a, b| b.importance.total_cmp(&a.importance));

        TrainingReport {
            message: "Model trained successfully".to_string(),
            mse: self.model.mse,
            mae: self.model.mae,
            feature_importance: importance,
            bundle_id: self.model.bundle_id,
        }
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    /// Writes the three artifacts, each through a temporary file renamed into place.
    pub fn persist(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        write_atomic(&dir.join(ONEHOT_ENCODER_FILE), &self.onehot)?;
        write_atomic(&dir.join(TARGET_ENCODER_FILE), &self.target)?;
        write_atomic(&dir.join(MODEL_FILE), &self.model)?;
        info!(bundle_id = %self.model.bundle_id, dir = %dir.display(), "Persisted demand model bundle");
        Ok(())
    }

    /// Loads and cross-checks a bundle. Any missing artifact means no model is available.
    pub fn load(dir: &Path) -> Result<Self> {
        let paths = [ONEHOT_ENCODER_FILE, TARGET_ENCODER_FILE, MODEL_FILE].map(|f| dir.join(f));
        if paths.iter().any(|p| !p.exists()) {
            return Err(InsightError::ModelNotTrained);
        }
        let onehot: OneHotEncoder = read_json(&paths[0])?;
        let target: TargetEncoder = read_json(&paths[1])?;
        let model: TrainedModel = read_json(&paths[2])?;

        if model.onehot_fingerprint != onehot.fingerprint {
            return Err(InsightError::ModelArtifactMismatch(format!(
                "model {} expects one-hot encoder {}, found {}",
                model.bundle_id, model.onehot_fingerprint, onehot.fingerprint
            )));
        }
        if model.target_fingerprint != target.fingerprint {
            return Err(InsightError::ModelArtifactMismatch(format!(
                "model {} expects target encoder {}, found {}",
                model.bundle_id, model.target_fingerprint, target.fingerprint
            )));
        }
        let expected_width = BASE_FEATURES.len() + onehot.categories.len();
        if model.regressor.n_features != expected_width {
            return Err(InsightError::ModelArtifactMismatch(format!(
                "model {} has {} features, encoders produce {}",
                model.bundle_id, model.regressor.n_features, expected_width
            )));
        }

        Ok(DemandBundle { onehot, target, model })
    }
}

fn encode_with(onehot: &OneHotEncoder, target: &TargetEncoder, f: &DemandFeatures) -> Vec<f64> {
    let mut row = vec![
        target.transform(&f.route_id),
        f.month as f64,
        f.day as f64,
        f.weekday as f64,
        f.is_weekend as u8 as f64,
        f.is_peak_hours as u8 as f64,
        f.total_stops,
        f.avg_duration,
        f.avg_distance,
        f.avg_speed,
    ];
    row.extend(onehot.transform(f.time_of_day));
    row
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension(format!("json.{}.tmp", Uuid::new_v4().simple()));
    fs::write(&tmp, serde_json::to_vec(value)?)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

// ============================================================================
// Training
// ============================================================================

/// Fits encoders and regressor on a seeded shuffled split and scores the held-out part.
pub fn train(rows: &[FeatureRow], options: TrainingOptions) -> Result<DemandBundle> {
    if rows.len() < 2 {
        return Err(InsightError::InvalidInput(format!(
            "need at least 2 feature rows to train, got {}",
            rows.len()
        )));
    }

    let mut indices: Vec<usize> = (0..rows.len()).collect();
    let mut rng = StdRng::seed_from_u64(options.seed);
    indices.shuffle(&mut rng);

    let test_len = ((rows.len() as f64 * options.test_ratio).ceil() as usize).clamp(1, rows.len() - 1);
    let (test_idx, train_idx) = indices.split_at(test_len);

    let onehot = OneHotEncoder::fit(rows.iter().map(|r| r.features.time_of_day));
    let train_targets: Vec<f64> = train_idx.iter().map(|&i| rows[i].total_trips).collect();
    let target = TargetEncoder::fit(
        train_idx.iter().map(|&i| rows[i].features.route_id.as_str()),
        &train_targets,
    );

    let train_matrix: Vec<Vec<f64>> = train_idx
        .iter()
        .map(|&i| encode_with(&onehot, &target, &rows[i].features))
        .collect();
    let regressor = GradientBoostedRegressor::fit(&train_matrix, &train_targets, options.boosting);

    let (mut squared, mut absolute) = (0.0, 0.0);
    for &i in test_idx {
        let predicted = regressor.predict(&encode_with(&onehot, &target, &rows[i].features));
        let err = rows[i].total_trips - predicted;
        squared += err * err;
        absolute += err.abs();
    }
    let mse = squared / test_idx.len() as f64;
    let mae = absolute / test_idx.len() as f64;

    let mut feature_names: Vec<String> = BASE_FEATURES.iter().map(|s| s.to_string()).collect();
    feature_names.extend(onehot.feature_names());

    let model = TrainedModel {
        bundle_id: Uuid::new_v4(),
        onehot_fingerprint: onehot.fingerprint,
        target_fingerprint: target.fingerprint,
        feature_names,
        trained_at: Utc::now(),
        train_rows: train_idx.len(),
        test_rows: test_idx.len(),
        mse,
        mae,
        regressor,
    };
    info!(
        bundle_id = %model.bundle_id,
        train_rows = model.train_rows,
        test_rows = model.test_rows,
        mse,
        mae,
        "Trained demand model"
    );

    Ok(DemandBundle { onehot, target, model })
}

// ============================================================================
// Store
// ============================================================================

/// The bundle currently served, swapped whole after a successful training.
pub struct ModelStore {
    dir: PathBuf,
    current: RwLock<Option<Arc<DemandBundle>>>,
}

impl ModelStore {
    /// Opens the artifact directory, loading a previously persisted bundle if there is one.
    pub fn open(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        let current = match DemandBundle::load(&dir) {
            Ok(bundle) => {
                info!(bundle_id = %bundle.bundle_id(), "Loaded demand model bundle");
                Some(Arc::new(bundle))
            }
            Err(InsightError::ModelNotTrained) => None,
            Err(e) => {
                warn!(error = %e, dir = %dir.display(), "Ignoring unusable model artifacts");
                None
            }
        };
        ModelStore {
            dir,
            current: RwLock::new(current),
        }
    }

    pub fn current(&self) -> Result<Arc<DemandBundle>> {
        let guard = self
            .current
            .read()
            .map_err(|_| InsightError::Internal("model store lock poisoned".into()))?;
        guard.clone().ok_or(InsightError::ModelNotTrained)
    }

    /// Persists the bundle, then makes it the served one. A failed write leaves the
    /// previous bundle in place.
    pub fn install(&self, bundle: DemandBundle) -> Result<Arc<DemandBundle>> {
        bundle.persist(&self.dir)?;
        let bundle = Arc::new(bundle);
        let mut guard = self
            .current
            .write()
            .map_err(|_| InsightError::Internal("model store lock poisoned".into()))?;
        *guard = Some(bundle.clone());
        Ok(bundle)
    }
}
