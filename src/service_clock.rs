// GTFS clock values, service dates and time-of-day classification

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;

use crate::error::{InsightError, Result};

const SECONDS_PER_HOUR: u32 = 3600;
const SECONDS_PER_MINUTE: u32 = 60;
const SECONDS_IN_DAY: u32 = 86400;

/// A GTFS clock value: seconds since the start of the service day.
/// Hours may exceed 23 for trips that run past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GtfsTime(u32);

impl GtfsTime {
    pub const MIDNIGHT_ROLLOVER: GtfsTime = GtfsTime(SECONDS_IN_DAY);

    /// Whole hour of the service day; cannot overflow.
    pub const fn from_hour(hour: u8) -> Self {
        GtfsTime(hour as u32 * SECONDS_PER_HOUR)
    }

    /// `None` when the total does not fit in the clock.
    pub fn from_hms(hours: u32, minutes: u32, seconds: u32) -> Option<Self> {
        hours
            .checked_mul(SECONDS_PER_HOUR)?
            .checked_add(minutes.checked_mul(SECONDS_PER_MINUTE)?)?
            .checked_add(seconds)
            .map(GtfsTime)
    }

    /// Parses `H:MM:SS` or `HH:MM:SS` (hours may be >= 24). `HH:MM` is accepted too.
    /// Embedded whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        let cleaned: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
        let mut parts = cleaned.split(':');
        let hours: u32 = parts.next()?.parse().ok()?;
        let minutes: u32 = parts.next()?.parse().ok()?;
        let seconds: u32 = match parts.next() {
            Some(s) => s.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() || minutes > 59 || seconds > 59 {
            return None;
        }
        Self::from_hms(hours, minutes, seconds)
    }

    /// Hour of day after next-day rollover, always in `0..24`.
    pub fn normalized_hour(self) -> u32 {
        (self.0 % SECONDS_IN_DAY) / SECONDS_PER_HOUR
    }

    pub fn minutes_until(self, later: GtfsTime) -> f64 {
        (later.0 as f64 - self.0 as f64) / SECONDS_PER_MINUTE as f64
    }

    pub fn hours_until(self, later: GtfsTime) -> f64 {
        (later.0 as f64 - self.0 as f64) / SECONDS_PER_HOUR as f64
    }
}

impl fmt::Display for GtfsTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}:{:02}",
            self.0 / SECONDS_PER_HOUR,
            (self.0 % SECONDS_PER_HOUR) / SECONDS_PER_MINUTE,
            self.0 % SECONDS_PER_MINUTE
        )
    }
}

impl Serialize for GtfsTime {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ============================================================================
// Service dates
// ============================================================================

/// Parses a `YYYYMMDD` service date. Anything else is `InvalidDateFormat`.
pub fn parse_service_date(raw: &str) -> Result<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.len() != 8 || !trimmed.bytes().all(|b| b.is_ascii_digit()) {
        return Err(InsightError::InvalidDateFormat(raw.to_string()));
    }
    NaiveDate::parse_from_str(trimmed, "%Y%m%d")
        .map_err(|_| InsightError::InvalidDateFormat(raw.to_string()))
}

pub fn format_service_date(date: NaiveDate) -> String {
    date.format("%Y%m%d").to_string()
}

/// Monday = 0 ... Sunday = 6
pub fn weekday_index(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}

// ============================================================================
// Time of day
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TimeOfDay {
    #[serde(rename = "Morning")]
    Morning,
    #[serde(rename = "Peak Morning")]
    PeakMorning,
    #[serde(rename = "Afternoon")]
    Afternoon,
    #[serde(rename = "Peak Evening")]
    PeakEvening,
    #[serde(rename = "Night")]
    Night,
    #[serde(rename = "Mid Night")]
    MidNight,
}

impl TimeOfDay {
    pub const ALL: [TimeOfDay; 6] = [
        TimeOfDay::Morning,
        TimeOfDay::PeakMorning,
        TimeOfDay::Afternoon,
        TimeOfDay::PeakEvening,
        TimeOfDay::Night,
        TimeOfDay::MidNight,
    ];

    /// Buckets a wall-clock hour (already rolled over past midnight).
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            4..=7 => TimeOfDay::Morning,
            8..=11 => TimeOfDay::PeakMorning,
            12..=15 => TimeOfDay::Afternoon,
            16..=19 => TimeOfDay::PeakEvening,
            20..=23 => TimeOfDay::Night,
            _ => TimeOfDay::MidNight,
        }
    }

    pub fn classify(time: GtfsTime) -> Self {
        Self::from_hour(time.normalized_hour())
    }

    pub fn label(self) -> &'static str {
        match self {
            TimeOfDay::Morning => "Morning",
            TimeOfDay::PeakMorning => "Peak Morning",
            TimeOfDay::Afternoon => "Afternoon",
            TimeOfDay::PeakEvening => "Peak Evening",
            TimeOfDay::Night => "Night",
            TimeOfDay::MidNight => "Mid Night",
        }
    }

    pub fn is_peak(self) -> bool {
        matches!(self, TimeOfDay::PeakMorning | TimeOfDay::PeakEvening)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// The single peak-hour definition used by both the analytics and the demand model:
/// the half-open Peak Morning `[8,12)` and Peak Evening `[16,20)` buckets.
pub fn is_peak_hour(time: GtfsTime) -> bool {
    TimeOfDay::classify(time).is_peak()
}

/// Two-hour bin label such as `"8:00-9:59"`.
pub fn time_period(time: GtfsTime) -> String {
    let start = time.normalized_hour() / 2 * 2;
    format!("{}:00-{}:59", start, start + 1)
}
