use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::{InsightError, Result};
use crate::feed::Feed;
use crate::service_clock::{GtfsTime, TimeOfDay, parse_service_date, weekday_index};
use crate::stats::trip_stats::{TripStats, compute_trip_stats};

/// The inputs the demand model sees for one (route, date, time-of-day) cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DemandFeatures {
    pub route_id: String,
    pub month: u32,
    pub day: u32,
    /// 0 = Monday
    pub weekday: u32,
    pub is_weekend: bool,
    pub time_of_day: TimeOfDay,
    pub is_peak_hours: bool,
    pub total_stops: f64,
    /// Hours
    pub avg_duration: f64,
    /// Kilometres
    pub avg_distance: f64,
    /// km/h
    pub avg_speed: f64,
}

impl DemandFeatures {
    /// Calendar and time-of-day fields for a service date and a departure time. The
    /// peak flag comes from the same bucketing the analytics use.
    pub fn at(route_id: &str, date: NaiveDate, start: GtfsTime) -> Self {
        let weekday = weekday_index(date);
        let time_of_day = TimeOfDay::classify(start);
        DemandFeatures {
            route_id: route_id.to_string(),
            month: date.month(),
            day: date.day(),
            weekday,
            is_weekend: weekday >= 5,
            time_of_day,
            is_peak_hours: time_of_day.is_peak(),
            total_stops: 0.0,
            avg_duration: 0.0,
            avg_distance: 0.0,
            avg_speed: 0.0,
        }
    }
}

/// Body of a prediction request.
#[derive(Debug, Clone, Deserialize)]
pub struct PredictionRequest {
    pub route_id: String,
    /// `YYYYMMDD`
    pub date: String,
    /// `HH:MM:SS`, hours may exceed 23
    pub time: String,
    pub total_stops: f64,
    pub avg_speed: f64,
    pub avg_distance: f64,
    pub avg_duration: f64,
}

impl PredictionRequest {
    pub fn to_features(&self) -> Result<DemandFeatures> {
        let date = parse_service_date(&self.date)?;
        let time = GtfsTime::parse(&self.time).ok_or_else(|| {
            InsightError::InvalidInput(format!("time {:?} is not HH:MM:SS", self.time))
        })?;
        if self.route_id.trim().is_empty() {
            return Err(InsightError::MissingParameter("route_id"));
        }

        let mut features = DemandFeatures::at(self.route_id.trim(), date, time);
        features.total_stops = self.total_stops;
        features.avg_speed = self.avg_speed;
        features.avg_distance = self.avg_distance;
        features.avg_duration = self.avg_duration;
        Ok(features)
    }
}

/// One training example: the features of a cell and the number of distinct trips in it.
#[derive(Debug, Clone, Serialize)]
pub struct FeatureRow {
    pub date: NaiveDate,
    #[serde(flatten)]
    pub features: DemandFeatures,
    pub total_trips: f64,
}

#[derive(Default)]
struct Cell<'a> {
    trips: Vec<&'a TripStats>,
}

/// Expands every trip onto the dates its service operates and aggregates per
/// (route, date, time_of_day, is_peak). Rows come out ordered by that key.
pub fn build_feature_table(feed: &Feed) -> Vec<FeatureRow> {
    let service_dates = feed.service_dates();
    let trip_stats = compute_trip_stats(feed);

    let mut cells: BTreeMap<(String, NaiveDate, TimeOfDay, bool), Cell> = BTreeMap::new();
    let mut dropped = 0usize;
    for ts in &trip_stats {
        let Some(trip) = feed.trip(&ts.trip_id) else {
            continue;
        };
        let dates = match service_dates.get(&trip.service_id) {
            Some(dates) if !dates.is_empty() => dates,
            _ => {
                dropped += 1;
                continue;
            }
        };
        let time_of_day = TimeOfDay::classify(ts.start_time);
        for &date in dates {
            cells
                .entry((ts.route_id.clone(), date, time_of_day, time_of_day.is_peak()))
                .or_default()
                .trips
                .push(ts);
        }
    }
    if dropped > 0 {
        debug!(dropped, "Trips without any service date left out of the feature table");
    }

    let rows: Vec<FeatureRow> = cells
        .into_iter()
        .map(|((route_id, date, _, _), cell)| {
            let first = cell.trips[0];
            let n = cell.trips.len() as f64;
            let mut features = DemandFeatures::at(&route_id, date, first.start_time);
            features.total_stops = median(cell.trips.iter().map(|t| t.num_stops as f64).collect());
            features.avg_duration = cell.trips.iter().map(|t| t.duration).sum::<f64>() / n;
            features.avg_distance = cell.trips.iter().map(|t| t.distance).sum::<f64>() / n;
            features.avg_speed = cell.trips.iter().map(|t| t.speed).sum::<f64>() / n;
            FeatureRow {
                date,
                features,
                total_trips: n,
            }
        })
        .collect();

    info!(rows = rows.len(), trips = trip_stats.len(), "Built demand feature table");
    rows
}

fn median(mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_by(f64::total_cmp);
    let mid = values.len() / 2;
    if values.len() % 2 == 0 {
        (values[mid - 1] + values[mid]) / 2.0
    } else {
        values[mid]
    }
}
