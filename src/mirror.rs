// SQLite mirror of the feed and its derived statistics, queried by the chat pipeline.

use chrono::{Datelike, Duration, NaiveDate};
use rusqlite::{Connection, Transaction, params};
use std::path::Path;
use tracing::info;

use crate::error::{InsightError, Result};
use crate::feed::Feed;
use crate::service_clock::{TimeOfDay, format_service_date, weekday_index};
use crate::stats::{HeadwayWindow, compute_route_stats, compute_trip_stats};

const SCHEMA: &str = "
DROP TABLE IF EXISTS RouteStats;
DROP TABLE IF EXISTS TripStats;
DROP TABLE IF EXISTS StopTimes;
DROP TABLE IF EXISTS Trips;
DROP TABLE IF EXISTS Stops;
DROP TABLE IF EXISTS Routes;
DROP TABLE IF EXISTS Agency;

CREATE TABLE Agency (
    agency_id TEXT,
    agency_name TEXT,
    agency_url TEXT,
    agency_timezone TEXT,
    agency_phone TEXT
);

CREATE TABLE Routes (
    route_id TEXT PRIMARY KEY,
    agency_id TEXT,
    route_short_name TEXT,
    route_long_name TEXT,
    route_desc TEXT,
    route_type INTEGER,
    route_color TEXT
);

CREATE TABLE Stops (
    stop_id TEXT PRIMARY KEY,
    stop_code TEXT,
    stop_name TEXT,
    stop_desc TEXT,
    stop_lat REAL,
    stop_lon REAL,
    zone_id TEXT,
    location_type INTEGER,
    parent_station TEXT,
    wheelchair_boarding INTEGER
);

CREATE TABLE Trips (
    trip_id TEXT PRIMARY KEY,
    route_id TEXT REFERENCES Routes (route_id),
    service_id TEXT,
    trip_headsign TEXT,
    trip_short_name TEXT,
    direction_id INTEGER,
    block_id TEXT,
    shape_id TEXT
);

CREATE TABLE StopTimes (
    trip_id TEXT REFERENCES Trips (trip_id),
    arrival_time TEXT,
    departure_time TEXT,
    stop_id TEXT REFERENCES Stops (stop_id),
    stop_sequence INTEGER,
    stop_headsign TEXT,
    pickup_type INTEGER,
    drop_off_type INTEGER,
    shape_dist_traveled REAL,
    timepoint INTEGER
);

CREATE TABLE TripStats (
    trip_id TEXT PRIMARY KEY REFERENCES Trips (trip_id),
    route_id TEXT REFERENCES Routes (route_id),
    route_short_name TEXT,
    route_type INTEGER,
    direction_id INTEGER,
    shape_id TEXT,
    num_stops INTEGER,
    start_time TEXT,
    end_time TEXT,
    start_stop_id TEXT,
    end_stop_id TEXT,
    is_loop INTEGER,
    duration REAL,
    distance REAL,
    speed REAL,
    start_hour INTEGER,
    end_hour INTEGER,
    time_of_day TEXT,
    is_peak_hours INTEGER
);

CREATE TABLE RouteStats (
    route_id TEXT REFERENCES Routes (route_id),
    route_short_name TEXT,
    route_type INTEGER,
    num_trips INTEGER,
    num_trip_starts INTEGER,
    num_trip_ends INTEGER,
    num_stop_patterns INTEGER,
    is_loop INTEGER,
    is_bidirectional INTEGER,
    start_time TEXT,
    end_time TEXT,
    max_headway REAL,
    min_headway REAL,
    mean_headway REAL,
    peak_num_trips INTEGER,
    peak_start_time TEXT,
    peak_end_time TEXT,
    service_distance REAL,
    service_duration REAL,
    service_speed REAL,
    mean_trip_distance REAL,
    mean_trip_duration REAL,
    date TEXT,
    day INTEGER,
    month INTEGER,
    weekday INTEGER,
    is_weekend INTEGER
);

CREATE INDEX idx_stop_times_trip ON StopTimes (trip_id);
CREATE INDEX idx_stop_times_stop ON StopTimes (stop_id);
CREATE INDEX idx_route_stats_date ON RouteStats (route_id, date);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorSummary {
    pub agencies: usize,
    pub routes: usize,
    pub stops: usize,
    pub trips: usize,
    pub stop_times: usize,
    pub route_stat_rows: usize,
    pub dates: usize,
}

/// Rebuilds the mirror at `path` from scratch. Route statistics are written for every
/// date in `start..=end`. The rebuild is one transaction: on failure the previous
/// contents stay in place.
pub fn build_mirror(feed: &Feed, path: &Path, start: NaiveDate, end: NaiveDate) -> Result<MirrorSummary> {
    if end < start {
        return Err(InsightError::InvalidInput(format!(
            "end date {} is before start date {}",
            format_service_date(end),
            format_service_date(start)
        )));
    }

    let mut conn = Connection::open(path)?;
    let tx = conn.transaction()?;
    tx.execute_batch(SCHEMA)?;

    let mut summary = MirrorSummary {
        agencies: insert_agencies(&tx, feed)?,
        routes: insert_routes(&tx, feed)?,
        stops: insert_stops(&tx, feed)?,
        trips: insert_trips(&tx, feed)?,
        stop_times: insert_stop_times(&tx, feed)?,
        route_stat_rows: 0,
        dates: 0,
    };

    let trip_stats = compute_trip_stats(feed);
    {
        let mut stmt = tx.prepare(
            "INSERT INTO TripStats VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
        )?;
        for ts in &trip_stats {
            let time_of_day = TimeOfDay::classify(ts.start_time);
            stmt.execute(params![
                ts.trip_id,
                ts.route_id,
                ts.route_short_name,
                ts.route_type,
                ts.direction_id,
                ts.shape_id,
                ts.num_stops as i64,
                ts.start_time.to_string(),
                ts.end_time.to_string(),
                ts.start_stop_id,
                ts.end_stop_id,
                ts.is_loop,
                ts.duration,
                ts.distance,
                ts.speed,
                ts.start_time.normalized_hour(),
                ts.end_time.normalized_hour(),
                time_of_day.label(),
                time_of_day.is_peak(),
            ])?;
        }
    }

    {
        let mut stmt = tx.prepare(
            "INSERT INTO RouteStats VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26, ?27)",
        )?;
        let mut date = start;
        while date <= end {
            let weekday = weekday_index(date);
            for rs in compute_route_stats(feed, &trip_stats, date, HeadwayWindow::default()) {
                stmt.execute(params![
                    rs.route_id,
                    rs.route_short_name,
                    rs.route_type,
                    rs.num_trips as i64,
                    rs.num_trip_starts as i64,
                    rs.num_trip_ends as i64,
                    rs.num_stop_patterns as i64,
                    rs.is_loop,
                    rs.is_bidirectional,
                    rs.start_time.to_string(),
                    rs.end_time.to_string(),
                    rs.max_headway,
                    rs.min_headway,
                    rs.mean_headway,
                    rs.peak_num_trips as i64,
                    rs.peak_start_time.to_string(),
                    rs.peak_end_time.to_string(),
                    rs.service_distance,
                    rs.service_duration,
                    rs.service_speed,
                    rs.mean_trip_distance,
                    rs.mean_trip_duration,
                    rs.date,
                    date.day(),
                    date.month(),
                    weekday,
                    weekday >= 5,
                ])?;
                summary.route_stat_rows += 1;
            }
            summary.dates += 1;
            date += Duration::days(1);
        }
    }

    tx.commit()?;
    info!(
        path = %path.display(),
        routes = summary.routes,
        trips = summary.trips,
        stop_times = summary.stop_times,
        route_stat_rows = summary.route_stat_rows,
        dates = summary.dates,
        "Built SQLite mirror"
    );
    Ok(summary)
}

fn insert_agencies(tx: &Transaction, feed: &Feed) -> Result<usize> {
    let mut stmt = tx.prepare("INSERT INTO Agency VALUES (?1, ?2, ?3, ?4, ?5)")?;
    for a in &feed.agencies {
        stmt.execute(params![
            a.agency_id,
            a.agency_name,
            a.agency_url,
            a.agency_timezone,
            a.agency_phone,
        ])?;
    }
    Ok(feed.agencies.len())
}

fn insert_routes(tx: &Transaction, feed: &Feed) -> Result<usize> {
    let mut stmt = tx.prepare("INSERT INTO Routes VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)")?;
    for r in &feed.routes {
        stmt.execute(params![
            r.route_id,
            r.agency_id,
            r.route_short_name,
            r.route_long_name,
            r.route_desc,
            r.route_type,
            r.route_color,
        ])?;
    }
    Ok(feed.routes.len())
}

fn insert_stops(tx: &Transaction, feed: &Feed) -> Result<usize> {
    let mut stmt = tx.prepare("INSERT INTO Stops VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)")?;
    for s in &feed.stops {
        stmt.execute(params![
            s.stop_id,
            s.stop_code,
            s.stop_name,
            s.stop_desc,
            s.stop_lat,
            s.stop_lon,
            s.zone_id,
            s.location_type,
            s.parent_station,
            s.wheelchair_boarding,
        ])?;
    }
    Ok(feed.stops.len())
}

fn insert_trips(tx: &Transaction, feed: &Feed) -> Result<usize> {
    let mut stmt = tx.prepare("INSERT INTO Trips VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)")?;
    for t in &feed.trips {
        stmt.execute(params![
            t.trip_id,
            t.route_id,
            t.service_id,
            t.trip_headsign,
            t.trip_short_name,
            t.direction_id,
            t.block_id,
            t.shape_id,
        ])?;
    }
    Ok(feed.trips.len())
}

fn insert_stop_times(tx: &Transaction, feed: &Feed) -> Result<usize> {
    let mut stmt = tx.prepare("INSERT INTO StopTimes VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)")?;
    for st in &feed.stop_times {
        stmt.execute(params![
            st.trip_id,
            st.arrival_time,
            st.departure_time,
            st.stop_id,
            st.stop_sequence,
            st.stop_headsign,
            st.pickup_type,
            st.drop_off_type,
            st.shape_dist_traveled,
            st.timepoint,
        ])?;
    }
    Ok(feed.stop_times.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::fixtures::sample_feed;
    use crate::gtfs_models::Agency;

    fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_mirror_tables_are_populated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtfs.db");
        let summary = build_mirror(&sample_feed(), &path, ymd(2023, 9, 4), ymd(2023, 9, 10)).unwrap();

        assert_eq!(summary.agencies, 0);
        assert_eq!(summary.routes, 2);
        assert_eq!(summary.trips, 4);
        assert_eq!(summary.stop_times, 11);
        assert_eq!(summary.dates, 7);
        // Tue..Fri with two routes each; the 4th is removed and the weekend has no service
        assert_eq!(summary.route_stat_rows, 8);

        let conn = Connection::open(&path).unwrap();
        let peak: i64 = conn
            .query_row("SELECT COUNT(*) FROM TripStats WHERE is_peak_hours = 1", [], |r| r.get(0))
            .unwrap();
        assert_eq!(peak, 4);
        let weekday: i64 = conn
            .query_row(
                "SELECT weekday FROM RouteStats WHERE date = '20230905' AND route_id = 'R1'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(weekday, 1);
    }

    #[test]
    fn test_rebuild_replaces_previous_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtfs.db");
        let feed = sample_feed();
        build_mirror(&feed, &path, ymd(2023, 9, 5), ymd(2023, 9, 5)).unwrap();
        let summary = build_mirror(&feed, &path, ymd(2023, 9, 5), ymd(2023, 9, 5)).unwrap();
        assert_eq!(summary.route_stat_rows, 2);

        let conn = Connection::open(&path).unwrap();
        let routes: i64 = conn.query_row("SELECT COUNT(*) FROM Routes", [], |r| r.get(0)).unwrap();
        assert_eq!(routes, 2);
    }

    #[test]
    fn test_failed_rebuild_keeps_previous_mirror() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtfs.db");
        let feed = sample_feed();
        build_mirror(&feed, &path, ymd(2023, 9, 5), ymd(2023, 9, 5)).unwrap();

        let mut broken = sample_feed();
        let duplicate = broken.routes[0].clone();
        broken.routes.push(duplicate);
        assert!(build_mirror(&broken, &path, ymd(2023, 9, 5), ymd(2023, 9, 5)).is_err());

        let conn = Connection::open(&path).unwrap();
        let routes: i64 = conn.query_row("SELECT COUNT(*) FROM Routes", [], |r| r.get(0)).unwrap();
        assert_eq!(routes, 2);
        let stats: i64 = conn.query_row("SELECT COUNT(*) FROM RouteStats", [], |r| r.get(0)).unwrap();
        assert_eq!(stats, 2);
    }

    #[test]
    fn test_agencies_are_mirrored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gtfs.db");
        let mut feed = sample_feed();
        feed.agencies.push(Agency {
            agency_id: Some("MTA".into()),
            agency_name: "MTA New York City Transit".into(),
            agency_url: Some("http://www.mta.info".into()),
            agency_timezone: Some("America/New_York".into()),
            agency_phone: None,
        });
        let summary = build_mirror(&feed, &path, ymd(2023, 9, 5), ymd(2023, 9, 5)).unwrap();
        assert_eq!(summary.agencies, 1);

        let conn = Connection::open(&path).unwrap();
        let name: String = conn
            .query_row("SELECT agency_name FROM Agency WHERE agency_id = 'MTA'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(name, "MTA New York City Transit");
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let result = build_mirror(&sample_feed(), &dir.path().join("x.db"), ymd(2023, 9, 5), ymd(2023, 9, 1));
        assert!(matches!(result, Err(InsightError::InvalidInput(_))));
    }
}
