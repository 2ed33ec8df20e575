use chrono::NaiveDate;
use geo::{Distance, Haversine, Point};
use serde::Serialize;

use crate::feed::Feed;
use crate::gtfs_models::{Stop, StopTime, Trip};
use crate::service_clock::GtfsTime;

/// Start and end stops closer than this count as a loop even when the ids differ.
const LOOP_THRESHOLD_KM: f64 = 0.1;

#[derive(Debug, Clone, Serialize)]
pub struct TripStats {
    pub trip_id: String,
    pub route_id: String,
    pub route_short_name: Option<String>,
    pub route_type: Option<i32>,
    pub direction_id: Option<u8>,
    pub shape_id: Option<String>,
    pub num_stops: usize,
    pub start_time: GtfsTime,
    pub end_time: GtfsTime,
    pub start_stop_id: String,
    pub end_stop_id: String,
    pub is_loop: bool,
    /// Hours
    pub duration: f64,
    /// Kilometres
    pub distance: f64,
    /// km/h
    pub speed: f64,
}

/// Statistics for every trip in the feed, in feed order. Trips without timed stops are skipped.
pub fn compute_trip_stats(feed: &Feed) -> Vec<TripStats> {
    feed.trips
        .iter()
        .filter_map(|trip| trip_stats_for(feed, trip))
        .collect()
}

/// Statistics for the trips whose service runs on `date`.
pub fn compute_trip_stats_on(feed: &Feed, date: NaiveDate) -> Vec<TripStats> {
    feed.trips
        .iter()
        .filter(|trip| feed.is_service_active(&trip.service_id, date))
        .filter_map(|trip| trip_stats_for(feed, trip))
        .collect()
}

pub fn trip_stats_for(feed: &Feed, trip: &Trip) -> Option<TripStats> {
    let stop_times = feed.stop_times_for_trip(&trip.trip_id);
    let first = stop_times.iter().find(|st| departure_of(st).is_some())?;
    let last = stop_times.iter().rev().find(|st| arrival_of(st).is_some())?;
    let start_time = departure_of(first)?;
    let end_time = arrival_of(last)?;

    let duration = start_time.hours_until(end_time).max(0.0);
    let distance = trip_distance(feed, trip, stop_times);
    let speed = if duration > 0.0 { distance / duration } else { 0.0 };

    let route = feed.route(&trip.route_id);

    Some(TripStats {
        trip_id: trip.trip_id.clone(),
        route_id: trip.route_id.clone(),
        route_short_name: route.and_then(|r| r.route_short_name.clone()),
        route_type: route.map(|r| r.route_type),
        direction_id: trip.direction_id,
        shape_id: trip.shape_id.clone(),
        num_stops: stop_times.len(),
        start_time,
        end_time,
        start_stop_id: first.stop_id.clone(),
        end_stop_id: last.stop_id.clone(),
        is_loop: is_loop(feed, &first.stop_id, &last.stop_id),
        duration,
        distance,
        speed,
    })
}

pub(crate) fn departure_of(st: &StopTime) -> Option<GtfsTime> {
    st.departure_time
        .as_deref()
        .or(st.arrival_time.as_deref())
        .and_then(GtfsTime::parse)
}

pub(crate) fn arrival_of(st: &StopTime) -> Option<GtfsTime> {
    st.arrival_time
        .as_deref()
        .or(st.departure_time.as_deref())
        .and_then(GtfsTime::parse)
}

/// Cumulative `shape_dist_traveled` when the feed provides it, the shape's great-circle
/// length otherwise.
fn trip_distance(feed: &Feed, trip: &Trip, stop_times: &[StopTime]) -> f64 {
    let first = stop_times.iter().find_map(|st| st.shape_dist_traveled);
    let last = stop_times.iter().rev().find_map(|st| st.shape_dist_traveled);
    if let (Some(first), Some(last)) = (first, last) {
        if last > first {
            return last - first;
        }
    }

    match &trip.shape_id {
        Some(shape_id) => {
            let points: Vec<Point<f64>> = feed
                .shape(shape_id)
                .iter()
                .map(|p| Point::new(p.shape_pt_lon, p.shape_pt_lat))
                .collect();
            points
                .windows(2)
                .map(|pair| Haversine.distance(pair[0], pair[1]))
                .sum::<f64>()
                / 1000.0
        }
        None => 0.0,
    }
}

fn is_loop(feed: &Feed, start_stop_id: &str, end_stop_id: &str) -> bool {
    if start_stop_id == end_stop_id {
        return true;
    }
    match (
        feed.stop(start_stop_id).and_then(stop_point),
        feed.stop(end_stop_id).and_then(stop_point),
    ) {
        (Some(a), Some(b)) => Haversine.distance(a, b) / 1000.0 < LOOP_THRESHOLD_KM,
        _ => false,
    }
}

fn stop_point(stop: &Stop) -> Option<Point<f64>> {
    Some(Point::new(stop.stop_lon?, stop.stop_lat?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::*;
    use crate::feed::FeedTables;
    use crate::gtfs_models::{DistanceUnit, ShapePoint};

    #[test]
    fn test_trip_stats_from_stop_times() {
        let feed = sample_feed();
        let stats = compute_trip_stats(&feed);
        assert_eq!(stats.len(), 4);

        let t1 = stats.iter().find(|s| s.trip_id == "T1").unwrap();
        assert_eq!(t1.num_stops, 3);
        assert_eq!(t1.start_time, GtfsTime::from_hms(8, 0, 0).unwrap());
        assert_eq!(t1.end_time, GtfsTime::from_hms(8, 20, 0).unwrap());
        assert_eq!(t1.start_stop_id, "A");
        assert_eq!(t1.end_stop_id, "C");
        assert!((t1.duration - 20.0 / 60.0).abs() < 1e-9);
        assert_eq!(t1.distance, 12.0);
        assert!((t1.speed - 36.0).abs() < 1e-9);
        assert!(!t1.is_loop);
        assert_eq!(t1.route_short_name.as_deref(), Some("1"));
    }

    #[test]
    fn test_trip_stats_scoped_to_date() {
        let feed = sample_feed();
        let tuesday = NaiveDate::from_ymd_opt(2023, 9, 5).unwrap();
        let saturday = NaiveDate::from_ymd_opt(2023, 9, 9).unwrap();
        assert_eq!(compute_trip_stats_on(&feed, tuesday).len(), 4);
        assert!(compute_trip_stats_on(&feed, saturday).is_empty());
    }

    #[test]
    fn test_distance_falls_back_to_shape_length() {
        let mut tables = FeedTables::default();
        let mut t = trip("T", "R", "S", 0);
        t.shape_id = Some("SH".into());
        tables.trips.push(t);
        tables.stop_times = vec![
            stop_time("T", "A", 1, "10:00:00", None),
            stop_time("T", "B", 2, "10:30:00", None),
        ];
        tables.shapes = vec![
            ShapePoint {
                shape_id: "SH".into(),
                shape_pt_lat: 0.0,
                shape_pt_lon: 0.0,
                shape_pt_sequence: 1,
                shape_dist_traveled: None,
            },
            ShapePoint {
                shape_id: "SH".into(),
                shape_pt_lat: 0.0,
                shape_pt_lon: 0.1,
                shape_pt_sequence: 2,
                shape_dist_traveled: None,
            },
        ];
        let feed = Feed::from_tables(tables, DistanceUnit::Kilometres);
        let stats = compute_trip_stats(&feed);
        // 0.1 degree of longitude at the equator is about 11.1 km
        assert!((stats[0].distance - 11.12).abs() < 0.05);
    }

    #[test]
    fn test_loop_detection_by_stop_id() {
        let mut tables = FeedTables::default();
        tables.trips.push(trip("L", "R", "S", 0));
        tables.stop_times = vec![
            stop_time("L", "A", 1, "06:00:00", Some(0.0)),
            stop_time("L", "B", 2, "06:10:00", Some(2.0)),
            stop_time("L", "A", 3, "06:20:00", Some(4.0)),
        ];
        let feed = Feed::from_tables(tables, DistanceUnit::Kilometres);
        assert!(compute_trip_stats(&feed)[0].is_loop);
    }
}
