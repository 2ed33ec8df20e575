// GTFS static table rows as they are read from a feed archive.
// Field names follow the GTFS reference so rows deserialize straight from the CSV headers
// and serialize back out unchanged for the pass-through endpoints.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Data Structures
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agency {
    pub agency_id: Option<String>,
    pub agency_name: String,
    pub agency_url: Option<String>,
    pub agency_timezone: Option<String>,
    pub agency_phone: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Route {
    pub route_id: String,
    pub agency_id: Option<String>,
    pub route_short_name: Option<String>,
    pub route_long_name: Option<String>,
    pub route_desc: Option<String>,
    pub route_type: i32,
    pub route_color: Option<String>,
    pub route_text_color: Option<String>,
}

impl Route {
    /// Case-insensitive substring match on the short or long name.
    pub fn name_matches(&self, needle: &str) -> bool {
        let needle = needle.to_lowercase();
        [&self.route_short_name, &self.route_long_name]
            .into_iter()
            .flatten()
            .any(|name| name.to_lowercase().contains(&needle))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stop {
    pub stop_id: String,
    pub stop_code: Option<String>,
    #[serde(default)]
    pub stop_name: String,
    pub stop_desc: Option<String>,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
    pub zone_id: Option<String>,
    pub location_type: Option<u8>,
    pub parent_station: Option<String>,
    pub wheelchair_boarding: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Trip {
    pub route_id: String,
    pub service_id: String,
    pub trip_id: String,
    pub trip_headsign: Option<String>,
    pub trip_short_name: Option<String>,
    pub direction_id: Option<u8>,
    pub block_id: Option<String>,
    pub shape_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopTime {
    pub trip_id: String,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub stop_headsign: Option<String>,
    pub pickup_type: Option<u8>,
    pub drop_off_type: Option<u8>,
    pub shape_dist_traveled: Option<f64>,
    pub timepoint: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapePoint {
    pub shape_id: String,
    pub shape_pt_lat: f64,
    pub shape_pt_lon: f64,
    pub shape_pt_sequence: u32,
    pub shape_dist_traveled: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceCalendar {
    pub service_id: String,
    #[serde(deserialize_with = "flag")]
    pub monday: bool,
    #[serde(deserialize_with = "flag")]
    pub tuesday: bool,
    #[serde(deserialize_with = "flag")]
    pub wednesday: bool,
    #[serde(deserialize_with = "flag")]
    pub thursday: bool,
    #[serde(deserialize_with = "flag")]
    pub friday: bool,
    #[serde(deserialize_with = "flag")]
    pub saturday: bool,
    #[serde(deserialize_with = "flag")]
    pub sunday: bool,
    pub start_date: String,
    pub end_date: String,
}

impl ServiceCalendar {
    /// `weekday` counts from Monday = 0.
    pub fn runs_on_weekday(&self, weekday: u32) -> bool {
        match weekday {
            0 => self.monday,
            1 => self.tuesday,
            2 => self.wednesday,
            3 => self.thursday,
            4 => self.friday,
            5 => self.saturday,
            6 => self.sunday,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalendarDate {
    pub service_id: String,
    pub date: String,
    pub exception_type: u8, // 1 = service added, 2 = service removed
}

fn flag<'de, D>(deserializer: D) -> std::result::Result<bool, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    Ok(raw.trim() == "1")
}

// ============================================================================
// Distance units
// ============================================================================

/// Unit of `shape_dist_traveled` in the source feed. Everything downstream is kilometres.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistanceUnit {
    #[default]
    Kilometres,
    Metres,
    Miles,
    Feet,
}

impl DistanceUnit {
    pub fn to_km(self, value: f64) -> f64 {
        match self {
            DistanceUnit::Kilometres => value,
            DistanceUnit::Metres => value / 1000.0,
            DistanceUnit::Miles => value * 1.609_344,
            DistanceUnit::Feet => value * 0.000_304_8,
        }
    }
}

impl FromStr for DistanceUnit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "km" => Ok(DistanceUnit::Kilometres),
            "m" => Ok(DistanceUnit::Metres),
            "mi" => Ok(DistanceUnit::Miles),
            "ft" => Ok(DistanceUnit::Feet),
            other => Err(format!("unknown distance unit '{}', expected km, m, mi or ft", other)),
        }
    }
}
