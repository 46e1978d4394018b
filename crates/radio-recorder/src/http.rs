use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{delete, get, post};
use axum::Router;
use chrono::NaiveDate;
use radio_core::reconciler::{
    duration_from_minutes, ManualStart, PrepReport, StationStatus, TickReport,
};
use radio_core::resolver::StreamResolver;
use radio_core::station::{Schedule, Station, StationDraft};
use radio_core::RecorderError;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::logging::TallySnapshot;
use crate::service::Service;

pub struct ApiError(RecorderError);

impl From<RecorderError> for ApiError {
    fn from(err: RecorderError) -> Self {
        Self(err)
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            RecorderError::Validation(_) | RecorderError::Resolve(_) => StatusCode::BAD_REQUEST,
            RecorderError::UnknownStation(_) => StatusCode::NOT_FOUND,
            RecorderError::InsufficientDisk { .. } => StatusCode::INSUFFICIENT_STORAGE,
            RecorderError::ProcessControl(_)
            | RecorderError::Store(_)
            | RecorderError::StoreIo { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            error!("HTTP API: {}", self.0);
        } else {
            warn!("HTTP API: {}", self.0);
        }
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

/// Recording window as submitted by an admin form: date plus whole hour.
#[derive(Debug, Deserialize)]
pub struct ScheduleRequest {
    pub start_date: NaiveDate,
    pub start_hour: u32,
    pub end_date: NaiveDate,
    pub end_hour: u32,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AddStationRequest {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub always_on: bool,
    #[serde(default)]
    pub schedule: Option<ScheduleRequest>,
}

impl AddStationRequest {
    fn into_draft(self) -> radio_core::Result<StationDraft> {
        let schedule = self
            .schedule
            .map(|s| Schedule::from_parts(s.start_date, s.start_hour, s.end_date, s.end_hour, s.reason))
            .transpose()?;
        Ok(StationDraft {
            name: self.name,
            source_url: self.url,
            always_on: self.always_on,
            schedule,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TestStreamRequest {
    url: String,
}

#[derive(Serialize)]
struct TestStreamResponse {
    resolved_url: String,
}

#[derive(Debug, Default, Deserialize)]
struct StartRequest {
    #[serde(default)]
    minutes: Option<u64>,
    #[serde(default)]
    encode: bool,
}

#[derive(Serialize)]
struct Stopped {
    stopped: Vec<u32>,
}

#[derive(Serialize)]
struct StatusResponse {
    stations: Vec<StationStatus>,
    last_tick: Option<TickReport>,
    log: TallySnapshot,
}

pub fn router<R>(service: Arc<Service<R>>) -> Router
where
    R: StreamResolver + 'static,
{
    Router::new()
        .route("/api/stations", get(list_stations::<R>).post(add_station::<R>))
        .route("/api/stations/:name", delete(delete_station::<R>))
        .route("/api/stations/:name/start", post(start_station::<R>))
        .route("/api/stations/:name/stop", post(stop_station::<R>))
        .route("/api/stop-all", post(stop_all::<R>))
        .route("/api/test-stream", post(test_stream::<R>))
        .route("/api/tick", post(tick::<R>))
        .route("/api/status", get(status::<R>))
        .route("/api/prep", get(prep::<R>))
        .layer(CorsLayer::permissive())
        .with_state(service)
}

pub fn start_server<R>(
    bind_address: String,
    port: u16,
    service: Arc<Service<R>>,
) -> tokio::task::JoinHandle<()>
where
    R: StreamResolver + 'static,
{
    tokio::spawn(async move {
        let app = router(service);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn list_stations<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
) -> ApiResult<Json<Vec<Station>>> {
    Ok(Json(service.recorder.stations()?))
}

async fn add_station<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
    Json(request): Json<AddStationRequest>,
) -> ApiResult<(StatusCode, Json<Station>)> {
    info!("HTTP API: Add station {}", request.name);
    let draft = request.into_draft()?;
    let station = service.recorder.add_station(draft).await?;
    Ok((StatusCode::CREATED, Json(station)))
}

async fn delete_station<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
    Path(name): Path<String>,
) -> ApiResult<StatusCode> {
    info!("HTTP API: Delete station {}", name);
    service.recorder.delete_station(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_station<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
    Path(name): Path<String>,
    request: Option<Json<StartRequest>>,
) -> ApiResult<Json<ManualStart>> {
    let request = request.map(|Json(r)| r).unwrap_or_default();
    info!("HTTP API: Manual recording of {}", name);
    let duration = request.minutes.map(duration_from_minutes).transpose()?;
    let started = service
        .recorder
        .start_manual(&name, duration, request.encode)
        .await?;
    Ok(Json(started))
}

async fn stop_station<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
    Path(name): Path<String>,
) -> ApiResult<Json<Stopped>> {
    info!("HTTP API: Stop {}", name);
    let stopped = service.recorder.stop_station(&name).await?;
    Ok(Json(Stopped { stopped }))
}

async fn stop_all<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
) -> ApiResult<Json<Stopped>> {
    info!("HTTP API: Stop all");
    let stopped = service.recorder.stop_all().await?;
    Ok(Json(Stopped { stopped }))
}

async fn test_stream<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
    Json(request): Json<TestStreamRequest>,
) -> ApiResult<Json<TestStreamResponse>> {
    info!("HTTP API: Test stream {}", request.url);
    let resolved_url = service.recorder.test_stream(&request.url).await?;
    Ok(Json(TestStreamResponse { resolved_url }))
}

async fn tick<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
) -> ApiResult<Json<TickReport>> {
    info!("HTTP API: Tick");
    Ok(Json(service.tick().await?))
}

async fn status<R: StreamResolver>(
    State(service): State<Arc<Service<R>>>,
) -> ApiResult<Json<StatusResponse>> {
    Ok(Json(StatusResponse {
        stations: service.recorder.status()?,
        last_tick: service.last_tick().await,
        log: service.tally.snapshot(),
    }))
}

async fn prep<R: StreamResolver>(State(service): State<Arc<Service<R>>>) -> Json<PrepReport> {
    Json(service.recorder.prep().await)
}
