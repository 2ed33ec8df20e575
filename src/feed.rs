// In-memory GTFS feed: loading from a zip archive, cleaning, and read-only lookups.
//
// The feed is built once at startup and shared as an immutable `Arc<Feed>`; nothing
// mutates it afterwards.

use bytes::Bytes;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::io::{Cursor, Read};
use std::ops::Range;
use std::path::Path;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::error::{InsightError, Result};
use crate::gtfs_models::{
    Agency, CalendarDate, DistanceUnit, Route, ServiceCalendar, ShapePoint, Stop, StopTime, Trip,
};
use crate::service_clock::{format_service_date, weekday_index};

/// Raw tables as read from the archive, before cleaning and indexing.
#[derive(Debug, Clone, Default)]
pub struct FeedTables {
    pub agencies: Vec<Agency>,
    pub routes: Vec<Route>,
    pub stops: Vec<Stop>,
    pub trips: Vec<Trip>,
    pub stop_times: Vec<StopTime>,
    pub shapes: Vec<ShapePoint>,
    pub calendar: Vec<ServiceCalendar>,
    pub calendar_dates: Vec<CalendarDate>,
}

#[derive(Debug)]
pub struct Feed {
    pub agencies: Vec<Agency>,
    pub routes: Vec<Route>,
    pub stops: Vec<Stop>,
    pub trips: Vec<Trip>,
    /// Sorted by (trip_id, stop_sequence) so each trip's stop times are contiguous.
    pub stop_times: Vec<StopTime>,
    pub shapes: HashMap<String, Vec<ShapePoint>>,
    pub calendar: Vec<ServiceCalendar>,
    pub calendar_dates: Vec<CalendarDate>,
    pub loaded_at: DateTime<Utc>,

    route_index: HashMap<String, usize>,
    stop_index: HashMap<String, usize>,
    trip_index: HashMap<String, usize>,
    stop_time_ranges: HashMap<String, Range<usize>>,
    calendar_index: HashMap<String, usize>,
    exceptions: HashMap<String, Vec<usize>>,
}

impl Feed {
    // ========================================================================
    // Loading
    // ========================================================================

    pub fn load(path: &Path, unit: DistanceUnit) -> Result<Feed> {
        info!(path = %path.display(), "Reading GTFS archive");
        let raw = std::fs::read(path)?;
        let zip_bytes = Bytes::from(raw);
        debug!(size_kb = zip_bytes.len() / 1024, "Archive read, extracting");
        Self::from_zip_bytes(zip_bytes, unit)
    }

    pub fn from_zip_bytes(zip_bytes: Bytes, unit: DistanceUnit) -> Result<Feed> {
        let mut archive = ZipArchive::new(Cursor::new(zip_bytes))?;

        let tables = FeedTables {
            agencies: read_table(&mut archive, "agency.txt", false)?,
            routes: read_table(&mut archive, "routes.txt", true)?,
            stops: read_table(&mut archive, "stops.txt", true)?,
            trips: read_table(&mut archive, "trips.txt", true)?,
            stop_times: read_table(&mut archive, "stop_times.txt", true)?,
            shapes: read_table(&mut archive, "shapes.txt", false)?,
            calendar: read_table(&mut archive, "calendar.txt", false)?,
            calendar_dates: read_table(&mut archive, "calendar_dates.txt", false)?,
        };

        if tables.calendar.is_empty() && tables.calendar_dates.is_empty() {
            return Err(InsightError::Feed(
                "feed has neither calendar.txt nor calendar_dates.txt".to_string(),
            ));
        }

        Ok(Self::from_tables(tables, unit))
    }

    /// Cleans and indexes raw tables.
    ///
    /// Clock strings lose embedded whitespace, routes without any trip are dropped, stop
    /// times are ordered by sequence within each trip and every distance becomes kilometres.
    pub fn from_tables(tables: FeedTables, unit: DistanceUnit) -> Feed {
        let FeedTables {
            agencies,
            mut routes,
            stops,
            trips,
            mut stop_times,
            shapes,
            calendar,
            calendar_dates,
        } = tables;

        for stop_time in &mut stop_times {
            strip_spaces(&mut stop_time.arrival_time);
            strip_spaces(&mut stop_time.departure_time);
            stop_time.shape_dist_traveled = stop_time.shape_dist_traveled.map(|d| unit.to_km(d));
        }
        stop_times.sort_by(|a, b| {
            a.trip_id
                .cmp(&b.trip_id)
                .then(a.stop_sequence.cmp(&b.stop_sequence))
        });

        let routes_with_trips: HashSet<&str> = trips.iter().map(|t| t.route_id.as_str()).collect();
        let before = routes.len();
        routes.retain(|r| routes_with_trips.contains(r.route_id.as_str()));
        if routes.len() < before {
            info!(removed = before - routes.len(), "Removed routes with no trips");
        }

        let mut shapes_map: HashMap<String, Vec<ShapePoint>> = HashMap::new();
        for mut point in shapes {
            point.shape_dist_traveled = point.shape_dist_traveled.map(|d| unit.to_km(d));
            shapes_map.entry(point.shape_id.clone()).or_default().push(point);
        }
        for points in shapes_map.values_mut() {
            points.sort_by_key(|p| p.shape_pt_sequence);
        }

        let mut stop_time_ranges: HashMap<String, Range<usize>> = HashMap::new();
        let mut start = 0;
        for i in 1..=stop_times.len() {
            if i == stop_times.len() || stop_times[i].trip_id != stop_times[start].trip_id {
                stop_time_ranges.insert(stop_times[start].trip_id.clone(), start..i);
                start = i;
            }
        }

        let mut exceptions: HashMap<String, Vec<usize>> = HashMap::new();
        for (i, cd) in calendar_dates.iter().enumerate() {
            exceptions.entry(cd.service_id.clone()).or_default().push(i);
        }

        let feed = Feed {
            route_index: index_by(&routes, |r| &r.route_id),
            stop_index: index_by(&stops, |s| &s.stop_id),
            trip_index: index_by(&trips, |t| &t.trip_id),
            calendar_index: index_by(&calendar, |c| &c.service_id),
            stop_time_ranges,
            exceptions,
            agencies,
            routes,
            stops,
            trips,
            stop_times,
            shapes: shapes_map,
            calendar,
            calendar_dates,
            loaded_at: Utc::now(),
        };

        info!(
            routes = feed.routes.len(),
            stops = feed.stops.len(),
            trips = feed.trips.len(),
            stop_times = feed.stop_times.len(),
            shapes = feed.shapes.len(),
            "GTFS feed loaded"
        );
        feed
    }

    // ========================================================================
    // Lookups
    // ========================================================================

    pub fn route(&self, route_id: &str) -> Option<&Route> {
        self.route_index.get(route_id).map(|&i| &self.routes[i])
    }

    pub fn stop(&self, stop_id: &str) -> Option<&Stop> {
        self.stop_index.get(stop_id).map(|&i| &self.stops[i])
    }

    pub fn trip(&self, trip_id: &str) -> Option<&Trip> {
        self.trip_index.get(trip_id).map(|&i| &self.trips[i])
    }

    /// First stop whose name matches exactly.
    pub fn stop_id_by_name(&self, stop_name: &str) -> Option<&str> {
        self.stops
            .iter()
            .find(|s| s.stop_name == stop_name)
            .map(|s| s.stop_id.as_str())
    }

    /// Stop times of a trip in `stop_sequence` order.
    pub fn stop_times_for_trip(&self, trip_id: &str) -> &[StopTime] {
        match self.stop_time_ranges.get(trip_id) {
            Some(range) => &self.stop_times[range.clone()],
            None => &[],
        }
    }

    pub fn trips_for_route<'a>(&'a self, route_id: &'a str) -> impl Iterator<Item = &'a Trip> + 'a {
        self.trips.iter().filter(move |t| t.route_id == route_id)
    }

    pub fn shape(&self, shape_id: &str) -> &[ShapePoint] {
        self.shapes.get(shape_id).map(Vec::as_slice).unwrap_or(&[])
    }

    // ========================================================================
    // Service calendar
    // ========================================================================

    /// Whether a service runs on a date: a `calendar_dates` exception wins, otherwise the
    /// regular calendar must cover the date and run on its weekday.
    pub fn is_service_active(&self, service_id: &str, date: NaiveDate) -> bool {
        let date_str = format_service_date(date);

        if let Some(indices) = self.exceptions.get(service_id) {
            for &i in indices {
                let exception = &self.calendar_dates[i];
                if exception.date == date_str {
                    return exception.exception_type == 1;
                }
            }
        }

        if let Some(&i) = self.calendar_index.get(service_id) {
            let cal = &self.calendar[i];
            if date_str.as_str() < cal.start_date.as_str() || date_str.as_str() > cal.end_date.as_str() {
                return false;
            }
            return cal.runs_on_weekday(weekday_index(date));
        }

        false
    }

    /// All dates each service operates on, from calendar ranges plus exceptions.
    pub fn service_dates(&self) -> HashMap<String, BTreeSet<NaiveDate>> {
        let mut dates: HashMap<String, BTreeSet<NaiveDate>> = HashMap::new();

        for cal in &self.calendar {
            let (Some(start), Some(end)) = (parse_yyyymmdd(&cal.start_date), parse_yyyymmdd(&cal.end_date)) else {
                warn!(service_id = %cal.service_id, "Calendar row has an unparseable date range");
                continue;
            };
            let entry = dates.entry(cal.service_id.clone()).or_default();
            let mut day = start;
            while day <= end {
                if cal.runs_on_weekday(weekday_index(day)) {
                    entry.insert(day);
                }
                day += Duration::days(1);
            }
        }

        for cd in &self.calendar_dates {
            let Some(day) = parse_yyyymmdd(&cd.date) else {
                continue;
            };
            let entry = dates.entry(cd.service_id.clone()).or_default();
            match cd.exception_type {
                1 => {
                    entry.insert(day);
                }
                2 => {
                    entry.remove(&day);
                }
                _ => {}
            }
        }

        dates
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn read_table<T: DeserializeOwned>(
    archive: &mut ZipArchive<Cursor<Bytes>>,
    name: &str,
    required: bool,
) -> Result<Vec<T>> {
    let mut contents = String::new();
    match archive.by_name(name) {
        Ok(mut file) => {
            file.read_to_string(&mut contents)?;
        }
        Err(e) if required => {
            return Err(InsightError::Feed(format!("{} not found in GTFS archive: {}", name, e)));
        }
        Err(_) => {
            debug!(file = name, "Optional table absent");
            return Ok(Vec::new());
        }
    }

    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_reader(contents.as_bytes());

    let mut rows = Vec::new();
    let mut skipped = 0usize;
    for result in rdr.deserialize::<T>() {
        match result {
            Ok(row) => rows.push(row),
            Err(e) => {
                if skipped == 0 {
                    warn!(file = name, error = %e, "Skipping malformed row");
                }
                skipped += 1;
            }
        }
    }
    if skipped > 0 {
        warn!(file = name, skipped, "Malformed rows skipped");
    }
    debug!(file = name, rows = rows.len(), "Table parsed");
    Ok(rows)
}

fn index_by<T>(rows: &[T], key: impl Fn(&T) -> &String) -> HashMap<String, usize> {
    rows.iter()
        .enumerate()
        .map(|(i, row)| (key(row).clone(), i))
        .collect()
}

fn strip_spaces(value: &mut Option<String>) {
    if let Some(s) = value {
        if s.contains(' ') {
            s.retain(|c| c != ' ');
        }
        if s.is_empty() {
            *value = None;
        }
    }
}

fn parse_yyyymmdd(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y%m%d").ok()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_routes_without_trips_are_pruned() {
        let feed = sample_feed();
        assert!(feed.route("R1").is_some());
        assert!(feed.route("R3").is_none());
        assert_eq!(feed.routes.len(), 2);
    }

    #[test]
    fn test_stop_times_ordered_by_sequence() {
        let mut tables = FeedTables::default();
        tables.trips.push(trip("T", "R", "S", 0));
        tables.stop_times = vec![
            stop_time("T", "C", 3, "08:20:00", None),
            stop_time("T", "A", 1, " 8:00:00", None),
            stop_time("T", "B", 2, "08:10:00", None),
        ];
        let feed = Feed::from_tables(tables, DistanceUnit::Kilometres);
        let seqs: Vec<u32> = feed.stop_times_for_trip("T").iter().map(|s| s.stop_sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(feed.stop_times_for_trip("T")[0].arrival_time.as_deref(), Some("8:00:00"));
        assert!(feed.stop_times_for_trip("missing").is_empty());
    }

    #[test]
    fn test_service_activity_honours_exceptions() {
        let feed = sample_feed();
        assert!(feed.is_service_active("WK", ymd(2023, 9, 5)));
        // Labour day removed by calendar_dates
        assert!(!feed.is_service_active("WK", ymd(2023, 9, 4)));
        // Saturday
        assert!(!feed.is_service_active("WK", ymd(2023, 9, 9)));
        // Outside the calendar range
        assert!(!feed.is_service_active("WK", ymd(2023, 10, 2)));
    }

    #[test]
    fn test_service_dates_expand_calendar() {
        let feed = sample_feed();
        let dates = feed.service_dates();
        let wk = &dates["WK"];
        // 21 weekdays in September 2023, minus the removed Labour Day
        assert_eq!(wk.len(), 20);
        assert!(!wk.contains(&ymd(2023, 9, 4)));
        assert!(wk.contains(&ymd(2023, 9, 29)));
    }

    #[test]
    fn test_distances_converted_to_km() {
        let mut tables = FeedTables::default();
        tables.trips.push(trip("T", "R", "S", 0));
        tables.stop_times = vec![stop_time("T", "A", 1, "08:00:00", Some(2500.0))];
        let feed = Feed::from_tables(tables, DistanceUnit::Metres);
        assert_eq!(feed.stop_times_for_trip("T")[0].shape_dist_traveled, Some(2.5));
    }
}
