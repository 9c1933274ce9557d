//! REST routes over the metering service

use axum::{
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, Method, StatusCode},
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tally_common::{subject::MATCH_ALL, Event, Meter, Reading, TallyError, VERSION};
use tally_engine::MeteringService;
use tally_store::Entry;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use crate::error::ApiError;

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Build the router
pub fn router(service: MeteringService) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::ACCEPT]);

    Router::new()
        .route("/health", get(health))
        .route("/api/meters", get(list_meters).post(create_meter))
        .route("/api/meters/:key", get(get_meter).delete(delete_meter))
        .route("/api/events", axum::routing::post(publish_event))
        .route("/api/readings", get(list_readings))
        .route("/api/readings/:key", get(get_reading))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(service)
}

fn body<T>(payload: Result<Json<T>, JsonRejection>) -> ApiResult<T> {
    payload
        .map(|Json(value)| value)
        .map_err(|rejection| ApiError(TallyError::Validation(rejection.body_text())))
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy", "version": VERSION }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "status": "error", "message": "route not found" })),
    )
}

async fn create_meter(
    State(service): State<MeteringService>,
    payload: Result<Json<Meter>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Meter>)> {
    let meter = body(payload)?;
    service.register_meter(&meter).await?;
    service.add_meter_to_consume(meter.clone())?;
    Ok((StatusCode::CREATED, Json(meter)))
}

async fn list_meters(State(service): State<MeteringService>) -> ApiResult<Json<Vec<Meter>>> {
    Ok(Json(service.list_meters().await?))
}

async fn get_meter(
    State(service): State<MeteringService>,
    Path(key): Path<String>,
) -> ApiResult<Json<Meter>> {
    Ok(Json(service.get_meter(&key).await?))
}

async fn delete_meter(
    State(service): State<MeteringService>,
    Path(key): Path<String>,
) -> ApiResult<Json<Meter>> {
    let meter = service.delete_meter(&key).await?;
    if let Err(e) = service.remove_meter_from_consume(&meter.hash()) {
        warn!(meter = %key, error = %e, "Meter deleted but consumer not notified");
    }
    Ok(Json(meter))
}

async fn publish_event(
    State(service): State<MeteringService>,
    payload: Result<Json<Event>, JsonRejection>,
) -> ApiResult<(StatusCode, Json<Event>)> {
    let event = service.publish_event(body(payload)?).await?;
    Ok((StatusCode::ACCEPTED, Json(event)))
}

#[derive(Debug, Deserialize)]
struct ReadingsQuery {
    pattern: Option<String>,
}

async fn list_readings(
    State(service): State<MeteringService>,
    Query(query): Query<ReadingsQuery>,
) -> ApiResult<Json<Vec<Entry<Reading>>>> {
    let pattern = query
        .pattern
        .filter(|p| !p.trim().is_empty())
        .unwrap_or_else(|| MATCH_ALL.to_string());
    Ok(Json(service.list_readings(&pattern).await?))
}

async fn get_reading(
    State(service): State<MeteringService>,
    Path(key): Path<String>,
) -> ApiResult<Json<Reading>> {
    Ok(Json(service.get_reading(&key).await?))
}
