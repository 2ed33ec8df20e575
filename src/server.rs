// HTTP API: feed pass-through endpoints, per-date analytics, demand model training and
// prediction, and the chat endpoint.

use actix_cors::Cors;
use actix_web::{App, HttpResponse, HttpServer, middleware, web};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

use crate::between_stops::{TripRouteInfo, StopInterval, in_between_stops, trip_route_info, trip_shape, trips_between_stops};
use crate::chat::QueryResponder;
use crate::demand::{ModelStore, PredictionRequest, TrainingOptions, build_feature_table, train};
use crate::error::{InsightError, Result};
use crate::feed::Feed;
use crate::gtfs_models::Trip;
use crate::service_clock::parse_service_date;
use crate::stats::DailyStats;
use crate::stats::analysis::{
    distance_coverage_optimization, frequent_routes, peak_hour_traffic, route_efficiency,
    route_stats_report, shortest_longest_routes, slowest_fastest_routes, trip_stats_report,
};

#[derive(Clone)]
pub struct AppState {
    pub feed: Arc<Feed>,
    pub models: Arc<ModelStore>,
    pub chat: Arc<QueryResponder>,
}

impl AppState {
    pub fn new(feed: Feed, models: ModelStore, chat: QueryResponder) -> Self {
        AppState {
            feed: Arc::new(feed),
            models: Arc::new(models),
            chat: Arc::new(chat),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct DateQuery {
    date: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct RouteQuery {
    route_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StopNamesQuery {
    start_stop_name: Option<String>,
    end_stop_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct IntervalQuery {
    trip_id: Option<String>,
    start_stop_id: Option<String>,
    end_stop_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    query: Option<String>,
    user_id: Option<String>,
}

#[derive(Serialize)]
struct RoutesWithTrips<'a> {
    route_id: &'a str,
    trips: Vec<&'a Trip>,
}

#[derive(Serialize)]
struct RoutesBetweenStops {
    trip_route_info: Vec<TripRouteInfo>,
    route_shape: Vec<[f64; 2]>,
    #[serde(flatten)]
    interval: StopInterval,
}

fn required(value: Option<String>, name: &'static str) -> Result<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or(InsightError::MissingParameter(name))
}

/// Runs CPU-bound work on the blocking pool.
async fn blocking<T, F>(work: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    web::block(work)
        .await
        .map_err(|e| InsightError::Internal(format!("worker failed: {}", e)))?
}

// ============================================================================
// Feed Routes
// ============================================================================

async fn index() -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "message": "Welcome to the GTFS insights API!"
    }))
}

async fn health_check(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(serde_json::json!({
        "status": "healthy",
        "service": "gtfs_insights",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": state.feed.routes.len(),
        "stops": state.feed.stops.len(),
        "trips": state.feed.trips.len(),
        "feed_loaded_at": state.feed.loaded_at,
        "model_bundle": state.models.current().ok().map(|b| b.bundle_id()),
    }))
}

async fn get_routes(state: web::Data<AppState>) -> HttpResponse {
    debug!(count = state.feed.routes.len(), "Routes requested");
    HttpResponse::Ok().json(&state.feed.routes)
}

async fn get_route_by_id(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let route_id = path.into_inner();
    let route = state
        .feed
        .route(&route_id)
        .ok_or_else(|| InsightError::not_found("Route", &route_id))?;
    Ok(HttpResponse::Ok().json([route]))
}

async fn get_stops(state: web::Data<AppState>) -> HttpResponse {
    debug!(count = state.feed.stops.len(), "Stops requested");
    HttpResponse::Ok().json(&state.feed.stops)
}

async fn get_stop_by_id(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let stop_id = path.into_inner();
    let stop = state
        .feed
        .stop(&stop_id)
        .ok_or_else(|| InsightError::not_found("Stop", &stop_id))?;
    Ok(HttpResponse::Ok().json([stop]))
}

async fn get_trips(state: web::Data<AppState>) -> HttpResponse {
    debug!(count = state.feed.trips.len(), "Trips requested");
    HttpResponse::Ok().json(&state.feed.trips)
}

async fn get_trip_by_id(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let trip_id = path.into_inner();
    let trip = state
        .feed
        .trip(&trip_id)
        .ok_or_else(|| InsightError::not_found("Trip", &trip_id))?;
    Ok(HttpResponse::Ok().json([trip]))
}

async fn get_stop_times_by_trip(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let trip_id = path.into_inner();
    let stop_times = state.feed.stop_times_for_trip(&trip_id);
    if stop_times.is_empty() {
        return Err(InsightError::not_found("Stop times for trip", trip_id));
    }
    Ok(HttpResponse::Ok().json(stop_times))
}

async fn search_routes_by_name(state: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse> {
    let needle = path.into_inner();
    let matches: Vec<_> = state.feed.routes.iter().filter(|r| r.name_matches(&needle)).collect();
    if matches.is_empty() {
        return Err(InsightError::not_found("Route matching", needle));
    }
    debug!(needle = %needle, matches = matches.len(), "Route search");
    Ok(HttpResponse::Ok().json(matches))
}

async fn get_routes_with_trips(state: web::Data<AppState>, query: web::Query<RouteQuery>) -> Result<HttpResponse> {
    let route_id = required(query.into_inner().route_id, "route_id")?;
    let trips: Vec<&Trip> = state.feed.trips_for_route(&route_id).collect();
    if trips.is_empty() {
        return Err(InsightError::not_found("Trips for route", route_id));
    }
    Ok(HttpResponse::Ok().json(RoutesWithTrips {
        route_id: &route_id,
        trips,
    }))
}

async fn get_calendar(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(&state.feed.calendar)
}

// ============================================================================
// Analytics Routes
// ============================================================================

/// Validates the date, then computes the day's statistics and one report from them
/// off the async workers.
async fn daily_report<T, F>(state: &AppState, query: DateQuery, report: F) -> Result<HttpResponse>
where
    F: FnOnce(&Feed, &DailyStats) -> T + Send + 'static,
    T: Serialize + Send + 'static,
{
    let date = parse_service_date(query.date.as_deref().unwrap_or_default())?;
    let feed = state.feed.clone();
    let body = blocking(move || {
        let daily = DailyStats::compute(&feed, date);
        debug!(
            date = %date,
            trips = daily.trip_stats.len(),
            routes = daily.route_stats.len(),
            "Computed daily statistics"
        );
        Ok(report(&feed, &daily))
    })
    .await?;
    Ok(HttpResponse::Ok().json(body))
}

async fn api_route_stats(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), |feed: &Feed, daily: &DailyStats| {
        serde_json::json!({ "route_stats": route_stats_report(feed, daily) })
    })
    .await
}

async fn api_trip_stats(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), |_: &Feed, daily: &DailyStats| trip_stats_report(daily)).await
}

async fn api_frequent_routes(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), frequent_routes).await
}

async fn api_shortest_longest_routes(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), shortest_longest_routes).await
}

async fn api_slowest_fastest_routes(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), slowest_fastest_routes).await
}

async fn api_peak_hour_traffic(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), peak_hour_traffic).await
}

async fn api_distance_coverage(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), distance_coverage_optimization).await
}

async fn api_route_efficiency(state: web::Data<AppState>, query: web::Query<DateQuery>) -> Result<HttpResponse> {
    daily_report(&state, query.into_inner(), route_efficiency).await
}

async fn api_trips_between_stops(state: web::Data<AppState>, query: web::Query<StopNamesQuery>) -> Result<HttpResponse> {
    let query = query.into_inner();
    let start = required(query.start_stop_name, "start_stop_name")?;
    let end = required(query.end_stop_name, "end_stop_name")?;
    let found = trips_between_stops(&state.feed, &start, &end)?;
    debug!(start = %start, end = %end, trips = found.total_results, "Trips between stops");
    Ok(HttpResponse::Ok().json(found))
}

async fn api_routes_between_stops(state: web::Data<AppState>, query: web::Query<IntervalQuery>) -> Result<HttpResponse> {
    let query = query.into_inner();
    let trip_id = required(query.trip_id, "trip_id")?;
    let start = required(query.start_stop_id, "start_stop_id")?;
    let end = required(query.end_stop_id, "end_stop_id")?;

    let interval = in_between_stops(&state.feed, &trip_id, &start, &end)?;
    let info = trip_route_info(&state.feed, &trip_id)?;
    Ok(HttpResponse::Ok().json(RoutesBetweenStops {
        trip_route_info: vec![info],
        route_shape: trip_shape(&state.feed, &trip_id),
        interval,
    }))
}

// ============================================================================
// Demand Model Routes
// ============================================================================

async fn train_model(state: web::Data<AppState>) -> Result<HttpResponse> {
    info!("Demand model training requested");
    let feed = state.feed.clone();
    let models = state.models.clone();
    let report = blocking(move || {
        let rows = build_feature_table(&feed);
        let bundle = train(&rows, TrainingOptions::default())?;
        let installed = models.install(bundle)?;
        Ok(installed.report())
    })
    .await?;
    Ok(HttpResponse::Ok().json(report))
}

async fn predict_demand(state: web::Data<AppState>, body: web::Json<PredictionRequest>) -> Result<HttpResponse> {
    let features = body.into_inner().to_features()?;
    let bundle = state.models.current()?;
    let predicted = bundle.predict(&features);
    debug!(route_id = %features.route_id, predicted, bundle_id = %bundle.bundle_id(), "Demand predicted");
    Ok(HttpResponse::Ok().json(serde_json::json!({ "predicted_demand": predicted })))
}

// ============================================================================
// Chat Route
// ============================================================================

async fn chat_query(state: web::Data<AppState>, body: web::Json<ChatRequest>) -> Result<HttpResponse> {
    let body = body.into_inner();
    let question = required(body.query, "query")?;
    let user_id = required(body.user_id, "user_id")?;
    let response = state.chat.respond(&question, &user_id).await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({ "response": response })))
}

// ============================================================================
// Server Setup
// ============================================================================

/// Registers every endpoint. Shared by the server and the endpoint tests.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.app_data(web::JsonConfig::default().error_handler(|err, _req| {
        InsightError::InvalidInput(format!("malformed JSON body: {}", err)).into()
    }))
    .app_data(web::QueryConfig::default().error_handler(|err, _req| {
        InsightError::InvalidInput(format!("malformed query string: {}", err)).into()
    }))
    .route("/", web::get().to(index))
    .route("/health", web::get().to(health_check))
    .route("/routes", web::get().to(get_routes))
    .route("/route/{id}", web::get().to(get_route_by_id))
    .route("/stops", web::get().to(get_stops))
    .route("/stop/{id}", web::get().to(get_stop_by_id))
    .route("/trips", web::get().to(get_trips))
    .route("/trip/{id}", web::get().to(get_trip_by_id))
    .route("/stop_times/trip/{id}", web::get().to(get_stop_times_by_trip))
    .route("/routes/search/{name}", web::get().to(search_routes_by_name))
    .route("/routes_with_trips", web::get().to(get_routes_with_trips))
    .route("/calendar_dates", web::get().to(get_calendar))
    .service(
        web::scope("/api")
            .route("/route_stats", web::get().to(api_route_stats))
            .route("/trip_stats", web::get().to(api_trip_stats))
            .route("/frequent_routes", web::get().to(api_frequent_routes))
            .route("/shortest_longest_routes", web::get().to(api_shortest_longest_routes))
            .route("/slowest_fastest_routes", web::get().to(api_slowest_fastest_routes))
            .route("/peak_hour_traffic", web::get().to(api_peak_hour_traffic))
            .route("/distance_coverage_optimization", web::get().to(api_distance_coverage))
            .route("/route_efficiency", web::get().to(api_route_efficiency))
            .route("/trips_between_stops", web::get().to(api_trips_between_stops))
            .route("/routes_between_stops", web::get().to(api_routes_between_stops)),
    )
    .route("/train_model", web::post().to(train_model))
    .route("/predict_demand", web::post().to(predict_demand))
    .route("/chat_query", web::post().to(chat_query));
}

pub async fn run_server(state: AppState, bind_addr: &str, port: u16) -> std::io::Result<()> {
    info!(
        bind_addr,
        port,
        routes = state.feed.routes.len(),
        trips = state.feed.trips.len(),
        model_loaded = state.models.current().is_ok(),
        "Starting HTTP server"
    );

    let data = web::Data::new(state);
    HttpServer::new(move || {
        let cors = Cors::permissive();

        App::new()
            .app_data(data.clone())
            .wrap(cors)
            .wrap(middleware::Logger::default())
            .wrap(middleware::Compress::default())
            .configure(configure)
    })
    .bind((bind_addr, port))?
    .run()
    .await
}
