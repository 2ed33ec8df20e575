// Resolution of the stop-time slice between two stops of a trip, and of the trips that
// connect two named stops.

use serde::Serialize;
use tracing::debug;

use crate::error::{InsightError, Result};
use crate::feed::Feed;
use crate::service_clock::GtfsTime;
use crate::stats::trip_stats::{TripStats, arrival_of, trip_stats_for};

#[derive(Debug, Clone, Serialize)]
pub struct InBetweenStop {
    pub trip_id: String,
    pub stop_id: String,
    pub stop_sequence: u32,
    pub arrival_time: Option<String>,
    pub departure_time: Option<String>,
    /// Minutes since the previous row of the slice; 0 for the first row.
    pub time_diff: f64,
    /// Cumulative kilometres from the start of the trip.
    pub shape_dist_traveled: f64,
    pub stop_name: Option<String>,
    pub stop_lat: Option<f64>,
    pub stop_lon: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StopInterval {
    pub in_between_stops: Vec<InBetweenStop>,
    /// Kilometres covered between the first and last stop of the slice.
    pub total_distance: f64,
    /// Minutes
    pub expected_duration: f64,
    pub expected_speed_kmph: f64,
}

/// The stop-time rows of `trip_id` from `start_stop_id` to `end_stop_id`, inclusive and in
/// sequence order.
pub fn in_between_stops(
    feed: &Feed,
    trip_id: &str,
    start_stop_id: &str,
    end_stop_id: &str,
) -> Result<StopInterval> {
    if feed.trip(trip_id).is_none() {
        return Err(InsightError::not_found("Trip", trip_id));
    }
    let stop_times = feed.stop_times_for_trip(trip_id);

    let position = |stop_id: &str| {
        stop_times
            .iter()
            .position(|st| st.stop_id == stop_id)
            .ok_or_else(|| InsightError::StopNotOnTrip {
                stop_id: stop_id.to_string(),
                trip_id: trip_id.to_string(),
            })
    };
    let start = position(start_stop_id)?;
    let end = position(end_stop_id)?;
    if end < start {
        return Err(InsightError::NoRouteBetweenStops);
    }

    let slice = &stop_times[start..=end];
    let mut rows = Vec::with_capacity(slice.len());
    let mut previous: Option<GtfsTime> = None;
    for st in slice {
        let arrival = arrival_of(st);
        let time_diff = match (previous, arrival) {
            (Some(prev), Some(current)) => prev.minutes_until(current),
            _ => 0.0,
        };
        if arrival.is_some() {
            previous = arrival;
        }

        let stop = feed.stop(&st.stop_id);
        rows.push(InBetweenStop {
            trip_id: st.trip_id.clone(),
            stop_id: st.stop_id.clone(),
            stop_sequence: st.stop_sequence,
            arrival_time: st.arrival_time.clone(),
            departure_time: st.departure_time.clone(),
            time_diff,
            shape_dist_traveled: st.shape_dist_traveled.unwrap_or(0.0),
            stop_name: stop.map(|s| s.stop_name.clone()),
            stop_lat: stop.and_then(|s| s.stop_lat),
            stop_lon: stop.and_then(|s| s.stop_lon),
        });
    }

    let total_distance = match (rows.first(), rows.last()) {
        (Some(first), Some(last)) => last.shape_dist_traveled - first.shape_dist_traveled,
        _ => 0.0,
    };
    let expected_duration: f64 = rows.iter().map(|r| r.time_diff).sum();
    if expected_duration <= 0.0 {
        return Err(InsightError::DegenerateInterval {
            start_stop_id: start_stop_id.to_string(),
            end_stop_id: end_stop_id.to_string(),
        });
    }

    debug!(trip_id, stops = rows.len(), total_distance, expected_duration, "Resolved stop interval");

    Ok(StopInterval {
        in_between_stops: rows,
        total_distance,
        expected_duration,
        expected_speed_kmph: total_distance / (expected_duration / 60.0),
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct TripRouteInfo {
    #[serde(flatten)]
    pub stats: TripStats,
    pub route_long_name: Option<String>,
    pub route_color: Option<String>,
}

pub fn trip_route_info(feed: &Feed, trip_id: &str) -> Result<TripRouteInfo> {
    let trip = feed
        .trip(trip_id)
        .ok_or_else(|| InsightError::not_found("Trip", trip_id))?;
    let stats = trip_stats_for(feed, trip)
        .ok_or_else(|| InsightError::not_found("Stop times for trip", trip_id))?;
    Ok(join_route(feed, stats))
}

fn join_route(feed: &Feed, stats: TripStats) -> TripRouteInfo {
    let route = feed.route(&stats.route_id);
    TripRouteInfo {
        route_long_name: route.and_then(|r| r.route_long_name.clone()),
        route_color: route.and_then(|r| r.route_color.clone()),
        stats,
    }
}

/// Ordered `[lat, lon]` pairs of a trip's shape; empty when the trip has none.
pub fn trip_shape(feed: &Feed, trip_id: &str) -> Vec<[f64; 2]> {
    feed.trip(trip_id)
        .and_then(|t| t.shape_id.as_deref())
        .map(|shape_id| {
            feed.shape(shape_id)
                .iter()
                .map(|p| [p.shape_pt_lat, p.shape_pt_lon])
                .collect()
        })
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct TripsBetweenStops {
    pub start_stop_name: String,
    pub end_stop_name: String,
    pub start_stop_id: String,
    pub end_stop_id: String,
    pub total_results: usize,
    pub trips_between_stops: Vec<TripRouteInfo>,
}

/// Trips that call at the start stop and later at the end stop, looked up by stop name.
pub fn trips_between_stops(
    feed: &Feed,
    start_stop_name: &str,
    end_stop_name: &str,
) -> Result<TripsBetweenStops> {
    let start_stop_id = feed
        .stop_id_by_name(start_stop_name)
        .ok_or_else(|| InsightError::not_found("Stop", start_stop_name))?;
    let end_stop_id = feed
        .stop_id_by_name(end_stop_name)
        .ok_or_else(|| InsightError::not_found("Stop", end_stop_name))?;

    let mut matches: Vec<TripRouteInfo> = feed
        .trips
        .iter()
        .filter(|trip| {
            let stop_times = feed.stop_times_for_trip(&trip.trip_id);
            let start = stop_times.iter().position(|st| st.stop_id == start_stop_id);
            let end = stop_times.iter().rposition(|st| st.stop_id == end_stop_id);
            matches!((start, end), (Some(s), Some(e)) if s < e)
        })
        .filter_map(|trip| trip_stats_for(feed, trip))
        .map(|stats| join_route(feed, stats))
        .collect();

    if matches.is_empty() {
        return Err(InsightError::NoRouteBetweenStops);
    }
    matches.sort_by(|a, b| a.stats.trip_id.cmp(&b.stats.trip_id));

    Ok(TripsBetweenStops {
        start_stop_name: start_stop_name.to_string(),
        end_stop_name: end_stop_name.to_string(),
        start_stop_id: start_stop_id.to_string(),
        end_stop_id: end_stop_id.to_string(),
        total_results: matches.len(),
        trips_between_stops: matches,
    })
}
