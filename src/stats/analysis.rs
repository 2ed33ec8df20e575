//! Derived analyses behind the `/api/*` statistics endpoints.
//!
//! Every analysis starts from a [`DailyStats`] snapshot: trip statistics for the trips
//! running on the requested date plus the route statistics aggregated from them.

use chrono::NaiveDate;
use itertools::Itertools;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use super::route_stats::{HeadwayWindow, RouteStats, compute_route_stats};
use super::trip_stats::{TripStats, compute_trip_stats_on};
use crate::feed::Feed;
use crate::service_clock::{TimeOfDay, time_period};

const TOP_N: usize = 10;
const LONG_ROUTE_KM: f64 = 15.0;
const SPARSE_ROUTE_TRIPS: usize = 10;

pub const EFFICIENCY_WEIGHT: f64 = 0.225;
pub const HEADWAY_PENALTY: f64 = 0.1;

pub struct DailyStats {
    pub trip_stats: Vec<TripStats>,
    pub route_stats: Vec<RouteStats>,
}

impl DailyStats {
    pub fn compute(feed: &Feed, date: NaiveDate) -> Self {
        let trip_stats = compute_trip_stats_on(feed, date);
        let route_stats = compute_route_stats(feed, &trip_stats, date, HeadwayWindow::default());
        DailyStats {
            trip_stats,
            route_stats,
        }
    }
}

/// A route statistics row joined with the route's display metadata.
#[derive(Debug, Clone, Serialize)]
pub struct RouteStatsRecord {
    #[serde(flatten)]
    pub stats: RouteStats,
    pub route_long_name: Option<String>,
    pub route_color: Option<String>,
}

fn with_route_info(feed: &Feed, stats: RouteStats) -> RouteStatsRecord {
    let route = feed.route(&stats.route_id);
    RouteStatsRecord {
        route_long_name: route.and_then(|r| r.route_long_name.clone()),
        route_color: route.and_then(|r| r.route_color.clone()),
        stats,
    }
}

fn records(feed: &Feed, daily: &DailyStats) -> Vec<RouteStatsRecord> {
    daily
        .route_stats
        .iter()
        .cloned()
        .map(|s| with_route_info(feed, s))
        .collect()
}

pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// Route stats
// ============================================================================

/// Route statistics rounded to two decimals, durations in minutes and missing headways as 0.
pub fn route_stats_report(feed: &Feed, daily: &DailyStats) -> Vec<RouteStatsRecord> {
    daily
        .route_stats
        .iter()
        .cloned()
        .map(|mut s| {
            s.mean_headway = Some(round2(s.mean_headway.unwrap_or(0.0)));
            s.min_headway = Some(s.min_headway.unwrap_or(0.0));
            s.max_headway = Some(s.max_headway.unwrap_or(0.0));
            s.mean_trip_distance = round2(s.mean_trip_distance);
            s.mean_trip_duration = round2(s.mean_trip_duration) * 60.0;
            s.service_distance = round2(s.service_distance);
            s.service_duration = round2(s.service_duration) * 60.0;
            s.service_speed = round2(s.service_speed);
            with_route_info(feed, s)
        })
        .collect()
}

// ============================================================================
// Trip stats by time of day
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TripGroupSummary {
    pub num_trips: usize,
    pub mean_duration: f64,
    pub min_duration: f64,
    pub max_duration: f64,
    pub mean_speed: f64,
    pub min_speed: f64,
    pub max_speed: f64,
}

impl TripGroupSummary {
    fn from_trips(trips: &[&TripStats]) -> Self {
        let n = trips.len() as f64;
        let durations = trips.iter().map(|t| t.duration);
        let speeds = trips.iter().map(|t| t.speed);
        TripGroupSummary {
            num_trips: trips.len(),
            mean_duration: round2(durations.clone().sum::<f64>() / n),
            min_duration: round2(durations.clone().fold(f64::INFINITY, f64::min)),
            max_duration: round2(durations.fold(f64::NEG_INFINITY, f64::max)),
            mean_speed: round2(speeds.clone().sum::<f64>() / n),
            min_speed: round2(speeds.clone().fold(f64::INFINITY, f64::min)),
            max_speed: round2(speeds.fold(f64::NEG_INFINITY, f64::max)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TimeOfDaySummary {
    pub time_of_day: TimeOfDay,
    #[serde(flatten)]
    pub summary: TripGroupSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimePeriodSummary {
    pub period_time: String,
    #[serde(flatten)]
    pub summary: TripGroupSummary,
}

#[derive(Debug, Clone, Serialize)]
pub struct TripStatsReport {
    pub trip_duration_analysis: Vec<TimeOfDaySummary>,
    pub trip_period_analysis: Vec<TimePeriodSummary>,
}

pub fn trip_stats_report(daily: &DailyStats) -> TripStatsReport {
    let mut by_bucket: BTreeMap<TimeOfDay, Vec<&TripStats>> = BTreeMap::new();
    let mut by_period: BTreeMap<(u32, String), Vec<&TripStats>> = BTreeMap::new();
    for ts in &daily.trip_stats {
        by_bucket.entry(TimeOfDay::classify(ts.start_time)).or_default().push(ts);
        let hour = ts.start_time.normalized_hour() / 2 * 2;
        by_period
            .entry((hour, time_period(ts.start_time)))
            .or_default()
            .push(ts);
    }

    TripStatsReport {
        trip_duration_analysis: by_bucket
            .into_iter()
            .map(|(time_of_day, trips)| TimeOfDaySummary {
                time_of_day,
                summary: TripGroupSummary::from_trips(&trips),
            })
            .collect(),
        trip_period_analysis: by_period
            .into_iter()
            .map(|((_, period_time), trips)| TimePeriodSummary {
                period_time,
                summary: TripGroupSummary::from_trips(&trips),
            })
            .collect(),
    }
}

// ============================================================================
// Rankings
// ============================================================================

/// Ascending on present values; missing values sort last.
fn cmp_optional(a: Option<f64>, b: Option<f64>) -> Ordering {
    match (a, b) {
        (Some(x), Some(y)) => x.total_cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

fn top(rows: &[RouteStatsRecord]) -> Vec<RouteStatsRecord> {
    rows.iter().take(TOP_N).cloned().collect()
}

fn bottom_reversed(rows: &[RouteStatsRecord]) -> Vec<RouteStatsRecord> {
    rows.iter().rev().take(TOP_N).cloned().collect()
}

#[derive(Debug, Serialize)]
pub struct FrequentRoutes {
    pub most_frequent_routes: Vec<RouteStatsRecord>,
    pub least_frequent_routes: Vec<RouteStatsRecord>,
}

pub fn frequent_routes(feed: &Feed, daily: &DailyStats) -> FrequentRoutes {
    let mut rows = records(feed, daily);
    rows.sort_by(|a, b| {
        cmp_optional(a.stats.max_headway, b.stats.max_headway)
            .then(cmp_optional(a.stats.min_headway, b.stats.min_headway))
    });
    FrequentRoutes {
        most_frequent_routes: top(&rows),
        least_frequent_routes: bottom_reversed(&rows),
    }
}

#[derive(Debug, Serialize)]
pub struct ShortestLongestRoutes {
    pub shortest_routes: Vec<RouteStatsRecord>,
    pub longest_routes: Vec<RouteStatsRecord>,
}

pub fn shortest_longest_routes(feed: &Feed, daily: &DailyStats) -> ShortestLongestRoutes {
    let mut rows = records(feed, daily);
    for row in &mut rows {
        row.stats.mean_trip_distance = round2(row.stats.mean_trip_distance);
    }
    rows.sort_by(|a, b| a.stats.mean_trip_distance.total_cmp(&b.stats.mean_trip_distance));
    let shortest_routes = top(&rows);
    rows.sort_by(|a, b| b.stats.mean_trip_distance.total_cmp(&a.stats.mean_trip_distance));
    ShortestLongestRoutes {
        shortest_routes,
        longest_routes: top(&rows),
    }
}

#[derive(Debug, Serialize)]
pub struct SlowestFastestRoutes {
    pub slowest_routes: Vec<RouteStatsRecord>,
    pub fastest_routes: Vec<RouteStatsRecord>,
}

pub fn slowest_fastest_routes(feed: &Feed, daily: &DailyStats) -> SlowestFastestRoutes {
    let mut rows = records(feed, daily);
    for row in &mut rows {
        row.stats.service_speed = round2(row.stats.service_speed);
    }
    rows.sort_by(|a, b| a.stats.service_speed.total_cmp(&b.stats.service_speed));
    let slowest_routes = top(&rows);
    rows.sort_by(|a, b| b.stats.service_speed.total_cmp(&a.stats.service_speed));
    SlowestFastestRoutes {
        slowest_routes,
        fastest_routes: top(&rows),
    }
}

// ============================================================================
// Peak hour traffic
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct PeakHourRoute {
    pub num_peak_trips: usize,
    pub time_period: Vec<String>,
    #[serde(flatten)]
    pub route: RouteStatsRecord,
}

#[derive(Debug, Serialize)]
pub struct PeakHourTraffic {
    pub peak_hour_routes: Vec<PeakHourRoute>,
}

pub fn peak_hour_traffic(feed: &Feed, daily: &DailyStats) -> PeakHourTraffic {
    let mut per_route: BTreeMap<&str, (usize, Vec<String>)> = BTreeMap::new();
    for ts in daily
        .trip_stats
        .iter()
        .filter(|ts| TimeOfDay::classify(ts.start_time).is_peak())
    {
        let entry = per_route.entry(ts.route_id.as_str()).or_default();
        entry.0 += 1;
        let period = time_period(ts.start_time);
        if !entry.1.contains(&period) {
            entry.1.push(period);
        }
    }

    let by_id: HashMap<&str, &RouteStats> = daily
        .route_stats
        .iter()
        .map(|r| (r.route_id.as_str(), r))
        .collect();

    let peak_hour_routes = per_route
        .into_iter()
        .filter_map(|(route_id, (count, periods))| {
            let stats = by_id.get(route_id)?;
            Some(PeakHourRoute {
                num_peak_trips: count,
                time_period: periods,
                route: with_route_info(feed, (*stats).clone()),
            })
        })
        .collect();

    PeakHourTraffic { peak_hour_routes }
}

// ============================================================================
// Distance coverage
// ============================================================================

#[derive(Debug, Serialize)]
pub struct DistanceCoverage {
    pub inefficient_routes: Vec<RouteStatsRecord>,
}

/// Long routes with few trips: candidates for coverage optimisation.
pub fn distance_coverage_optimization(feed: &Feed, daily: &DailyStats) -> DistanceCoverage {
    let mut inefficient_routes: Vec<RouteStatsRecord> = records(feed, daily)
        .into_iter()
        .filter(|r| r.stats.mean_trip_distance > LONG_ROUTE_KM && r.stats.num_trips < SPARSE_ROUTE_TRIPS)
        .collect();
    inefficient_routes.sort_by(|a, b| b.stats.mean_trip_distance.total_cmp(&a.stats.mean_trip_distance));
    DistanceCoverage { inefficient_routes }
}

// ============================================================================
// Route efficiency
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EfficiencyInputs {
    pub service_speed: f64,
    pub avg_trip_speed: f64,
    pub num_trips: f64,
    pub avg_stops: f64,
    pub mean_headway: f64,
}

impl EfficiencyInputs {
    fn column_max(rows: &[EfficiencyInputs]) -> EfficiencyInputs {
        rows.iter().fold(EfficiencyInputs::default(), |m, r| EfficiencyInputs {
            service_speed: m.service_speed.max(r.service_speed),
            avg_trip_speed: m.avg_trip_speed.max(r.avg_trip_speed),
            num_trips: m.num_trips.max(r.num_trips),
            avg_stops: m.avg_stops.max(r.avg_stops),
            mean_headway: m.mean_headway.max(r.mean_headway),
        })
    }
}

fn ratio(value: f64, max: f64) -> f64 {
    if max > 0.0 { value / max } else { 0.0 }
}

/// Weighted sum of the normalized service speed, trip speed, trip count and stop count,
/// minus a penalty on the normalized mean headway.
pub fn efficiency_score(x: &EfficiencyInputs, max: &EfficiencyInputs) -> f64 {
    EFFICIENCY_WEIGHT * ratio(x.service_speed, max.service_speed)
        + EFFICIENCY_WEIGHT * ratio(x.avg_trip_speed, max.avg_trip_speed)
        + EFFICIENCY_WEIGHT * ratio(x.num_trips, max.num_trips)
        + EFFICIENCY_WEIGHT * ratio(x.avg_stops, max.avg_stops)
        - HEADWAY_PENALTY * ratio(x.mean_headway, max.mean_headway)
}

#[derive(Debug, Clone, Serialize)]
pub struct RouteEfficiency {
    #[serde(flatten)]
    pub route: RouteStatsRecord,
    pub avg_stops: f64,
    pub avg_trip_speed: f64,
    pub efficiency_score: f64,
}

#[derive(Debug, Serialize)]
pub struct RouteEfficiencyReport {
    pub most_efficient_routes: Vec<RouteEfficiency>,
    pub least_efficient_routes: Vec<RouteEfficiency>,
}

pub fn route_efficiency(feed: &Feed, daily: &DailyStats) -> RouteEfficiencyReport {
    let per_route = daily
        .trip_stats
        .iter()
        .map(|t| (t.route_id.as_str(), t))
        .into_group_map();

    let rows: Vec<(RouteStatsRecord, EfficiencyInputs)> = records(feed, daily)
        .into_iter()
        .filter_map(|record| {
            let trips = per_route.get(record.stats.route_id.as_str())?;
            let n = trips.len() as f64;
            let inputs = EfficiencyInputs {
                service_speed: record.stats.service_speed,
                avg_trip_speed: trips.iter().map(|t| t.speed).sum::<f64>() / n,
                num_trips: record.stats.num_trips as f64,
                avg_stops: trips.iter().map(|t| t.num_stops as f64).sum::<f64>() / n,
                mean_headway: record.stats.mean_headway.unwrap_or(0.0),
            };
            Some((record, inputs))
        })
        .collect();

    let inputs: Vec<EfficiencyInputs> = rows.iter().map(|(_, i)| *i).collect();
    let max = EfficiencyInputs::column_max(&inputs);

    let mut scored: Vec<RouteEfficiency> = rows
        .into_iter()
        .map(|(route, inputs)| RouteEfficiency {
            efficiency_score: efficiency_score(&inputs, &max),
            avg_stops: inputs.avg_stops,
            avg_trip_speed: inputs.avg_trip_speed,
            route,
        })
        .collect();

    scored.sort_by(|a, b| b.efficiency_score.total_cmp(&a.efficiency_score));
    let most_efficient_routes = scored.iter().take(TOP_N).cloned().collect();
    scored.sort_by(|a, b| a.efficiency_score.total_cmp(&b.efficiency_score));
    let least_efficient_routes = scored.iter().take(TOP_N).cloned().collect();

    RouteEfficiencyReport {
        most_efficient_routes,
        least_efficient_routes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::*;

    fn daily() -> (Feed, DailyStats) {
        let feed = sample_feed();
        let date = NaiveDate::from_ymd_opt(2023, 9, 5).unwrap();
        let daily = DailyStats::compute(&feed, date);
        (feed, daily)
    }

    #[test]
    fn test_efficiency_monotone_in_service_speed() {
        let max = EfficiencyInputs {
            service_speed: 40.0,
            avg_trip_speed: 30.0,
            num_trips: 100.0,
            avg_stops: 20.0,
            mean_headway: 30.0,
        };
        let mut x = EfficiencyInputs {
            service_speed: 0.0,
            avg_trip_speed: 15.0,
            num_trips: 50.0,
            avg_stops: 10.0,
            mean_headway: 12.0,
        };
        let mut previous = f64::NEG_INFINITY;
        for speed in [0.0, 5.0, 10.0, 20.0, 39.9, 40.0] {
            x.service_speed = speed;
            let score = efficiency_score(&x, &max);
            assert!(score >= previous);
            previous = score;
        }
    }

    #[test]
    fn test_efficiency_zero_maxima_contribute_nothing() {
        let zero = EfficiencyInputs::default();
        assert_eq!(efficiency_score(&zero, &zero), 0.0);
    }

    #[test]
    fn test_route_stats_report_units() {
        let (feed, daily) = daily();
        let report = route_stats_report(&feed, &daily);
        let r1 = &report[0];
        assert_eq!(r1.route_long_name.as_deref(), Some("Broadway Local"));
        // three trips of 20 minutes each
        assert_eq!(r1.stats.service_duration, 60.0);
        assert_eq!(r1.stats.mean_trip_duration, round2(20.0 / 60.0) * 60.0);
        // single-trip route reports a zero headway instead of nothing
        assert_eq!(report[1].stats.mean_headway, Some(0.0));
    }

    #[test]
    fn test_trip_stats_report_groups() {
        let (_, daily) = daily();
        let report = trip_stats_report(&daily);
        let peak_morning = report
            .trip_duration_analysis
            .iter()
            .find(|s| s.time_of_day == TimeOfDay::PeakMorning)
            .unwrap();
        assert_eq!(peak_morning.summary.num_trips, 3);
        assert_eq!(report.trip_period_analysis[0].period_time, "8:00-9:59");
    }

    #[test]
    fn test_frequent_routes_puts_missing_headways_last() {
        let (feed, daily) = daily();
        let frequent = frequent_routes(&feed, &daily);
        assert_eq!(frequent.most_frequent_routes[0].stats.route_id, "R1");
        assert_eq!(frequent.least_frequent_routes[0].stats.route_id, "R2");
    }

    #[test]
    fn test_rankings() {
        let (feed, daily) = daily();
        let sl = shortest_longest_routes(&feed, &daily);
        assert_eq!(sl.shortest_routes[0].stats.route_id, "R1");
        assert_eq!(sl.longest_routes[0].stats.route_id, "R2");

        let coverage = distance_coverage_optimization(&feed, &daily);
        assert_eq!(coverage.inefficient_routes.len(), 1);
        assert_eq!(coverage.inefficient_routes[0].stats.route_id, "R2");
    }

    #[test]
    fn test_peak_hour_traffic() {
        let (feed, daily) = daily();
        let peak = peak_hour_traffic(&feed, &daily);
        assert_eq!(peak.peak_hour_routes.len(), 2);
        let r1 = &peak.peak_hour_routes[0];
        assert_eq!(r1.num_peak_trips, 3);
        assert_eq!(r1.time_period, vec!["8:00-9:59".to_string()]);
    }

    #[test]
    fn test_route_efficiency_orders_scores() {
        let (feed, daily) = daily();
        let report = route_efficiency(&feed, &daily);
        assert_eq!(report.most_efficient_routes.len(), 2);
        let most = &report.most_efficient_routes;
        assert!(most[0].efficiency_score >= most[1].efficiency_score);
        assert_eq!(
            report.least_efficient_routes[0].route.stats.route_id,
            most[1].route.stats.route_id
        );
    }
}
