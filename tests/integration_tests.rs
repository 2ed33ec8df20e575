use actix_web::http::StatusCode;
use actix_web::{App, test, web};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::NaiveDate;
use serde_json::{Value, json};
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use zip::ZipWriter;
use zip::write::FileOptions;

use gtfs_insights::chat::{ChatHistory, HistoryConfig, LanguageModel, LlmError, QueryResponder, ReadOnlyDatabase, ResponderConfig};
use gtfs_insights::demand::ModelStore;
use gtfs_insights::feed::Feed;
use gtfs_insights::gtfs_models::DistanceUnit;
use gtfs_insights::mirror::build_mirror;
use gtfs_insights::server::{AppState, configure};

// ============================================================================
// Fixtures
// ============================================================================

const TABLES: &[(&str, &str)] = &[
    (
        "agency.txt",
        "agency_id,agency_name,agency_url,agency_timezone
MTA,MTA New York City Transit,http://www.mta.info,America/New_York
",
    ),
    (
        "routes.txt",
        "route_id,agency_id,route_short_name,route_long_name,route_type,route_color
R1,MTA,1,Broadway Local,1,EE352E
R2,MTA,X2,Express Two,3,0039A6
R3,MTA,3,Ghost Line,1,
",
    ),
    (
        "stops.txt",
        "stop_id,stop_name,stop_lat,stop_lon
A,Alpha,40.70,-74.00
B,Bravo,40.72,-74.00
C,Charlie,40.75,-74.00
D,Delta,40.95,-74.00
",
    ),
    (
        "trips.txt",
        "route_id,service_id,trip_id,direction_id,shape_id
R1,WK,T1,0,SH1
R1,WK,T2,0,SH1
R1,WK,T3,0,SH1
R2,WK,T4,0,
",
    ),
    (
        "stop_times.txt",
        "trip_id,arrival_time,departure_time,stop_id,stop_sequence,shape_dist_traveled
T1, 8:00:00, 8:00:00,A,1,0
T1,08:10:00,08:10:00,B,2,5
T1,08:20:00,08:20:00,C,3,12
T2,08:10:00,08:10:00,A,1,0
T2,08:20:00,08:20:00,B,2,5
T2,08:30:00,08:30:00,C,3,12
T3,08:45:00,08:45:00,C,3,12
T3,08:25:00,08:25:00,A,1,0
T3,08:35:00,08:35:00,B,2,5
T4,17:30:00,17:30:00,C,1,0
T4,18:30:00,18:30:00,D,2,30
",
    ),
    (
        "shapes.txt",
        "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence
SH1,40.75,-74.00,3
SH1,40.70,-74.00,1
SH1,40.72,-74.00,2
",
    ),
    (
        "calendar.txt",
        "service_id,monday,tuesday,wednesday,thursday,friday,saturday,sunday,start_date,end_date
WK,1,1,1,1,1,0,0,20230901,20230930
",
    ),
    (
        "calendar_dates.txt",
        "service_id,date,exception_type
WK,20230904,2
",
    ),
];

fn gtfs_zip(tables: &[(&str, &str)]) -> Bytes {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, contents) in tables {
        writer.start_file(*name, FileOptions::default()).unwrap();
        writer.write_all(contents.as_bytes()).unwrap();
    }
    Bytes::from(writer.finish().unwrap().into_inner())
}

fn load_feed() -> Feed {
    Feed::from_zip_bytes(gtfs_zip(TABLES), DistanceUnit::Kilometres).unwrap()
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

/// Replays canned replies in order.
struct ScriptedModel {
    replies: Mutex<VecDeque<Result<String, LlmError>>>,
}

impl ScriptedModel {
    fn new(replies: &[&str]) -> Arc<Self> {
        Arc::new(ScriptedModel {
            replies: Mutex::new(replies.iter().map(|r| Ok(r.to_string())).collect()),
        })
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    async fn complete(&self, _prompt: &str) -> Result<String, LlmError> {
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::Permanent("script exhausted".into())))
    }
}

struct Harness {
    _dir: TempDir,
    state: AppState,
}

fn harness(replies: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let feed = load_feed();
    let db_path = dir.path().join("gtfs.db");
    build_mirror(&feed, &db_path, ymd(2023, 9, 1), ymd(2023, 9, 7)).unwrap();

    let chat = QueryResponder::new(
        ScriptedModel::new(replies),
        ReadOnlyDatabase::new(db_path, Duration::from_secs(5), ReadOnlyDatabase::DEFAULT_ROW_LIMIT),
        ChatHistory::new(HistoryConfig::default()),
        ResponderConfig::default(),
    );
    let models = ModelStore::open(dir.path().join("artifacts"));
    Harness {
        state: AppState::new(feed, models, chat),
        _dir: dir,
    }
}

macro_rules! app {
    ($harness:expr) => {
        test::init_service(
            App::new()
                .app_data(web::Data::new($harness.state.clone()))
                .configure(configure),
        )
        .await
    };
}

// ============================================================================
// Feed loading
// ============================================================================

#[::core::prelude::v1::test]
fn test_feed_from_zip_is_cleaned() {
    let feed = load_feed();
    assert_eq!(feed.routes.len(), 2);
    assert!(feed.route("R3").is_none());
    assert_eq!(feed.agencies.len(), 1);

    let t3: Vec<u32> = feed.stop_times_for_trip("T3").iter().map(|s| s.stop_sequence).collect();
    assert_eq!(t3, vec![1, 2, 3]);
    assert_eq!(feed.stop_times_for_trip("T1")[0].arrival_time.as_deref(), Some("8:00:00"));

    let shape: Vec<u32> = feed.shape("SH1").iter().map(|p| p.shape_pt_sequence).collect();
    assert_eq!(shape, vec![1, 2, 3]);
}

#[::core::prelude::v1::test]
fn test_mirror_carries_agencies() {
    let dir = tempfile::tempdir().unwrap();
    let summary = build_mirror(&load_feed(), &dir.path().join("gtfs.db"), ymd(2023, 9, 5), ymd(2023, 9, 5)).unwrap();
    assert_eq!(summary.agencies, 1);
    assert_eq!(summary.routes, 2);
}

#[::core::prelude::v1::test]
fn test_feed_without_calendars_is_rejected() {
    let tables: Vec<(&str, &str)> = TABLES
        .iter()
        .copied()
        .filter(|(name, _)| !name.starts_with("calendar"))
        .collect();
    assert!(Feed::from_zip_bytes(gtfs_zip(&tables), DistanceUnit::Kilometres).is_err());
}

#[::core::prelude::v1::test]
fn test_feed_load_from_disk_in_metres() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("gtfs.zip");
    std::fs::write(&path, gtfs_zip(TABLES)).unwrap();

    let feed = Feed::load(&path, DistanceUnit::Metres).unwrap();
    let last = feed.stop_times_for_trip("T1").last().unwrap();
    assert_eq!(last.shape_dist_traveled, Some(0.012));
}

// ============================================================================
// Endpoints
// ============================================================================

#[actix_web::test]
async fn test_feed_endpoints() {
    let h = harness(&[]);
    let app = app!(h);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/").to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let routes: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/routes").to_request()).await;
    assert_eq!(routes.as_array().unwrap().len(), 2);

    let route: Value = test::call_and_read_body_json(&app, test::TestRequest::get().uri("/route/R1").to_request()).await;
    assert_eq!(route[0]["route_long_name"], "Broadway Local");

    let resp = test::call_service(&app, test::TestRequest::get().uri("/route/NOPE").to_request()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].as_str().unwrap().contains("NOPE"));

    let found: Value =
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/routes/search/broadway").to_request()).await;
    assert_eq!(found.as_array().unwrap().len(), 1);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/routes/search/zzz").to_request()).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let stop_times: Value =
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/stop_times/trip/T4").to_request()).await;
    assert_eq!(stop_times.as_array().unwrap().len(), 2);

    let resp = test::call_service(&app, test::TestRequest::get().uri("/routes_with_trips").to_request()).await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let with_trips: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/routes_with_trips?route_id=R1").to_request(),
    )
    .await;
    assert_eq!(with_trips["route_id"], "R1");
    assert_eq!(with_trips["trips"].as_array().unwrap().len(), 3);

    let calendar: Value =
        test::call_and_read_body_json(&app, test::TestRequest::get().uri("/calendar_dates").to_request()).await;
    assert_eq!(calendar[0]["service_id"], "WK");
}

#[actix_web::test]
async fn test_analytics_endpoints() {
    let h = harness(&[]);
    let app = app!(h);

    let stats: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/api/route_stats?date=20230905").to_request(),
    )
    .await;
    let rows = stats["route_stats"].as_array().unwrap();
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["route_id"], "R1");
    assert_eq!(rows[0]["num_trips"], 3);
    assert_eq!(rows[0]["route_long_name"], "Broadway Local");

    for bad in ["2023-09-05", "20230231", ""] {
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(&format!("/api/frequent_routes?date={}", bad)).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "date {:?}", bad);
    }

    for endpoint in [
        "trip_stats",
        "frequent_routes",
        "shortest_longest_routes",
        "slowest_fastest_routes",
        "peak_hour_traffic",
        "distance_coverage_optimization",
        "route_efficiency",
    ] {
        let resp = test::call_service(
            &app,
            test::TestRequest::get().uri(&format!("/api/{}?date=20230905", endpoint)).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK, "endpoint {}", endpoint);
    }

    // a Sunday has no service: empty but valid
    let sunday: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get().uri("/api/route_stats?date=20230910").to_request(),
    )
    .await;
    assert!(sunday["route_stats"].as_array().unwrap().is_empty());
}

#[actix_web::test]
async fn test_between_stops_endpoints() {
    let h = harness(&[]);
    let app = app!(h);

    let interval: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri("/api/routes_between_stops?trip_id=T1&start_stop_id=A&end_stop_id=C")
            .to_request(),
    )
    .await;
    assert_eq!(interval["in_between_stops"].as_array().unwrap().len(), 3);
    assert_eq!(interval["total_distance"], 12.0);
    assert_eq!(interval["expected_duration"], 20.0);
    assert_eq!(interval["route_shape"].as_array().unwrap().len(), 3);
    assert_eq!(interval["route_shape"][0], json!([40.70, -74.00]));
    assert_eq!(interval["trip_route_info"][0]["route_long_name"], "Broadway Local");

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/routes_between_stops?trip_id=T1&start_stop_id=A&end_stop_id=D")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    let resp = test::call_service(
        &app,
        test::TestRequest::get()
            .uri("/api/routes_between_stops?trip_id=T1&start_stop_id=B&end_stop_id=B")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);

    let trips: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::get()
            .uri("/api/trips_between_stops?start_stop_name=Alpha&end_stop_name=Charlie")
            .to_request(),
    )
    .await;
    assert_eq!(trips["total_results"], 3);
    assert_eq!(trips["start_stop_id"], "A");

    let resp = test::call_service(
        &app,
        test::TestRequest::get().uri("/api/trips_between_stops?start_stop_name=Alpha").to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_train_then_predict() {
    let h = harness(&[]);
    let app = app!(h);
    let request = json!({
        "route_id": "R1",
        "date": "20230905",
        "time": "08:00:00",
        "total_stops": 3,
        "avg_speed": 36.0,
        "avg_distance": 12.0,
        "avg_duration": 0.3333
    });

    let resp = test::call_service(
        &app,
        test::TestRequest::post().uri("/predict_demand").set_json(&request).to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

    let report: Value =
        test::call_and_read_body_json(&app, test::TestRequest::post().uri("/train_model").to_request()).await;
    assert_eq!(report["message"], "Model trained successfully");
    assert!(report["mse"].as_f64().unwrap() >= 0.0);
    assert!(report["bundle_id"].is_string());
    let importance = report["feature_importance"].as_array().unwrap();
    assert!(importance.iter().all(|f| f["Feature"].is_string() && f["Importance"].is_number()));

    let first: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post().uri("/predict_demand").set_json(&request).to_request(),
    )
    .await;
    let second: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post().uri("/predict_demand").set_json(&request).to_request(),
    )
    .await;
    assert_eq!(first["predicted_demand"], 3);
    assert_eq!(first, second);

    for time in ["eight", "4000000:00:00", "1193047:00:00"] {
        let mut bad_time = request.clone();
        bad_time["time"] = json!(time);
        let resp = test::call_service(
            &app,
            test::TestRequest::post().uri("/predict_demand").set_json(&bad_time).to_request(),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST, "time {:?}", time);
    }

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/predict_demand")
            .insert_header(("content-type", "application/json"))
            .set_payload("{not json")
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_chat_query() {
    let h = harness(&["SELECT COUNT(*) FROM Routes", "There are 2 routes in the network."]);
    let app = app!(h);

    let answer: Value = test::call_and_read_body_json(
        &app,
        test::TestRequest::post()
            .uri("/chat_query")
            .set_json(json!({ "query": "How many routes are there?", "user_id": "rider-1" }))
            .to_request(),
    )
    .await;
    assert_eq!(answer["response"], "There are 2 routes in the network.");

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/chat_query")
            .set_json(json!({ "query": "How many routes are there?" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
}

#[actix_web::test]
async fn test_chat_rejects_writes() {
    let h = harness(&["DELETE FROM Routes"]);
    let app = app!(h);

    let resp = test::call_service(
        &app,
        test::TestRequest::post()
            .uri("/chat_query")
            .set_json(json!({ "query": "remove all routes", "user_id": "rider-2" }))
            .to_request(),
    )
    .await;
    assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = test::read_body_json(resp).await;
    assert!(body["error"].is_string());
}
