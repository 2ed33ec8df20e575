use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};

use super::trip_stats::TripStats;
use crate::feed::Feed;
use crate::service_clock::{GtfsTime, format_service_date};

/// Trip starts inside this window feed the headway figures.
#[derive(Debug, Clone, Copy)]
pub struct HeadwayWindow {
    pub start: GtfsTime,
    pub end: GtfsTime,
}

impl Default for HeadwayWindow {
    fn default() -> Self {
        HeadwayWindow {
            start: GtfsTime::from_hour(7),
            end: GtfsTime::from_hour(19),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteStats {
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_type: Option<i32>,
    pub num_trips: usize,
    pub num_trip_starts: usize,
    pub num_trip_ends: usize,
    pub num_stop_patterns: usize,
    pub is_loop: bool,
    pub is_bidirectional: bool,
    pub start_time: GtfsTime,
    pub end_time: GtfsTime,
    /// Minutes
    pub max_headway: Option<f64>,
    pub min_headway: Option<f64>,
    pub mean_headway: Option<f64>,
    pub peak_num_trips: usize,
    pub peak_start_time: GtfsTime,
    pub peak_end_time: GtfsTime,
    /// Kilometres
    pub service_distance: f64,
    /// Hours
    pub service_duration: f64,
    /// km/h
    pub service_speed: f64,
    pub mean_trip_distance: f64,
    pub mean_trip_duration: f64,
    pub date: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Headways {
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub mean: Option<f64>,
}

/// Aggregates the trip statistics of trips running on `date` into one row per route,
/// ordered by route id. Routes without a running trip get no row.
pub fn compute_route_stats(
    feed: &Feed,
    trip_stats: &[TripStats],
    date: NaiveDate,
    window: HeadwayWindow,
) -> Vec<RouteStats> {
    let date_str = format_service_date(date);

    let mut by_route: BTreeMap<&str, Vec<&TripStats>> = BTreeMap::new();
    for ts in trip_stats {
        let active = feed
            .trip(&ts.trip_id)
            .is_some_and(|trip| feed.is_service_active(&trip.service_id, date));
        if active {
            by_route.entry(ts.route_id.as_str()).or_default().push(ts);
        }
    }

    by_route
        .into_iter()
        .map(|(route_id, trips)| route_row(feed, route_id, &trips, window, &date_str))
        .collect()
}

fn route_row(
    feed: &Feed,
    route_id: &str,
    trips: &[&TripStats],
    window: HeadwayWindow,
    date: &str,
) -> RouteStats {
    let num_trips = trips.len();
    let first = trips[0];

    let directions: HashSet<u8> = trips.iter().map(|t| t.direction_id.unwrap_or(0)).collect();
    let patterns: HashSet<Vec<&str>> = trips
        .iter()
        .map(|t| {
            feed.stop_times_for_trip(&t.trip_id)
                .iter()
                .map(|st| st.stop_id.as_str())
                .collect()
        })
        .collect();

    let service_distance: f64 = trips.iter().map(|t| t.distance).sum();
    let service_duration: f64 = trips.iter().map(|t| t.duration).sum();
    let headways = route_headways(trips, window);
    let (peak_num_trips, peak_start_time, peak_end_time) = peak_concurrency(trips);

    RouteStats {
        route_id: route_id.to_string(),
        route_short_name: first.route_short_name.clone(),
        route_type: first.route_type,
        num_trips,
        num_trip_starts: trips
            .iter()
            .filter(|t| t.start_time < GtfsTime::MIDNIGHT_ROLLOVER)
            .count(),
        num_trip_ends: trips
            .iter()
            .filter(|t| t.end_time < GtfsTime::MIDNIGHT_ROLLOVER)
            .count(),
        num_stop_patterns: patterns.len(),
        is_loop: trips.iter().any(|t| t.is_loop),
        is_bidirectional: directions.len() > 1,
        start_time: trips.iter().map(|t| t.start_time).min().unwrap_or(first.start_time),
        end_time: trips.iter().map(|t| t.end_time).max().unwrap_or(first.end_time),
        max_headway: headways.max,
        min_headway: headways.min,
        mean_headway: headways.mean,
        peak_num_trips,
        peak_start_time,
        peak_end_time,
        service_distance,
        service_duration,
        service_speed: if service_duration > 0.0 {
            service_distance / service_duration
        } else {
            0.0
        },
        mean_trip_distance: service_distance / num_trips as f64,
        mean_trip_duration: service_duration / num_trips as f64,
        date: date.to_string(),
    }
}

/// Headways of the direction with the most trip starts inside the window
/// (ties go to the lower direction id).
fn route_headways(trips: &[&TripStats], window: HeadwayWindow) -> Headways {
    let by_direction = trips
        .iter()
        .filter(|t| t.start_time >= window.start && t.start_time <= window.end)
        .map(|t| (t.direction_id.unwrap_or(0), t.start_time))
        .into_group_map();

    let busiest = by_direction
        .into_iter()
        .sorted_by_key(|(direction, _)| *direction)
        .max_by(|(da, a), (db, b)| a.len().cmp(&b.len()).then(db.cmp(da)));

    match busiest {
        Some((_, starts)) => headways_from_starts(starts),
        None => Headways::default(),
    }
}

/// Minutes between consecutive departures. Fewer than two departures give no headway.
pub fn headways_from_starts(mut starts: Vec<GtfsTime>) -> Headways {
    starts.sort();
    let gaps: Vec<f64> = starts
        .windows(2)
        .map(|pair| pair[0].minutes_until(pair[1]))
        .collect();
    if gaps.is_empty() {
        return Headways::default();
    }
    Headways {
        min: gaps.iter().copied().reduce(f64::min),
        max: gaps.iter().copied().reduce(f64::max),
        mean: Some(gaps.iter().sum::<f64>() / gaps.len() as f64),
    }
}

/// Maximum number of trips running at once, with the first interval reaching it.
/// A trip ending at the instant another starts does not overlap it.
fn peak_concurrency(trips: &[&TripStats]) -> (usize, GtfsTime, GtfsTime) {
    let mut events: Vec<(GtfsTime, i32)> = trips
        .iter()
        .flat_map(|t| [(t.start_time, 1), (t.end_time, -1)])
        .collect();
    events.sort();

    let groups: Vec<(GtfsTime, i32)> = events
        .iter()
        .chunk_by(|(time, _)| *time)
        .into_iter()
        .map(|(time, group)| (time, group.map(|(_, delta)| delta).sum()))
        .collect();

    let mut running = 0i32;
    let mut best = (0usize, trips[0].start_time, trips[0].end_time);
    for (i, (time, delta)) in groups.iter().enumerate() {
        running += delta;
        if running > 0 && running as usize > best.0 {
            let until = groups.get(i + 1).map(|(t, _)| *t).unwrap_or(*time);
            best = (running as usize, *time, until);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::*;
    use crate::stats::trip_stats::compute_trip_stats;

    fn tuesday() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 9, 5).unwrap()
    }

    #[test]
    fn test_headways_from_minute_offsets() {
        let starts = vec![
            GtfsTime::from_hms(8, 0, 0).unwrap(),
            GtfsTime::from_hms(8, 25, 0).unwrap(),
            GtfsTime::from_hms(8, 10, 0).unwrap(),
        ];
        let h = headways_from_starts(starts);
        assert_eq!(h.min, Some(10.0));
        assert_eq!(h.max, Some(15.0));
        assert_eq!(h.mean, Some(12.5));
        assert_eq!(headways_from_starts(vec![GtfsTime::from_hms(9, 0, 0).unwrap()]), Headways::default());
    }

    #[test]
    fn test_route_stats_for_date() {
        let feed = sample_feed();
        let trip_stats = compute_trip_stats(&feed);
        let stats = compute_route_stats(&feed, &trip_stats, tuesday(), HeadwayWindow::default());

        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|r| r.num_trips >= 1));

        let r1 = &stats[0];
        assert_eq!(r1.route_id, "R1");
        assert_eq!(r1.num_trips, 3);
        assert_eq!(r1.min_headway, Some(10.0));
        assert_eq!(r1.max_headway, Some(15.0));
        assert_eq!(r1.num_stop_patterns, 1);
        assert!(!r1.is_bidirectional);
        assert_eq!(r1.start_time, GtfsTime::from_hms(8, 0, 0).unwrap());
        assert_eq!(r1.end_time, GtfsTime::from_hms(8, 45, 0).unwrap());
        assert_eq!(r1.service_distance, 36.0);
        assert!((r1.service_speed - 36.0).abs() < 1e-9);
        assert_eq!(r1.date, "20230905");

        // T1 08:00-08:20, T2 08:10-08:30, T3 08:25-08:45
        assert_eq!(r1.peak_num_trips, 2);
        assert_eq!(r1.peak_start_time, GtfsTime::from_hms(8, 10, 0).unwrap());
        assert_eq!(r1.peak_end_time, GtfsTime::from_hms(8, 20, 0).unwrap());

        let r2 = &stats[1];
        assert_eq!(r2.num_trips, 1);
        assert_eq!(r2.mean_headway, None);
    }

    #[test]
    fn test_route_stats_empty_when_no_service() {
        let feed = sample_feed();
        let trip_stats = compute_trip_stats(&feed);
        let sunday = NaiveDate::from_ymd_opt(2023, 9, 10).unwrap();
        assert!(compute_route_stats(&feed, &trip_stats, sunday, HeadwayWindow::default()).is_empty());
    }

    #[test]
    fn test_route_stats_are_reproducible() {
        let feed = sample_feed();
        let trip_stats = compute_trip_stats(&feed);
        let a = compute_route_stats(&feed, &trip_stats, tuesday(), HeadwayWindow::default());
        let b = compute_route_stats(&feed, &trip_stats, tuesday(), HeadwayWindow::default());
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
