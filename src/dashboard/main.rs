//! Browser dashboard for the self-service portal.
//!
//! Serves one embedded page plus a JSON API that mirrors the CLI
//! capability exactly; every handler is a single manager call.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Html,
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tracing::{info, Level};

use opsdesk::prelude::*;

#[derive(Clone)]
struct AppState {
    compute: Arc<ComputeManager<Ec2Compute>>,
    storage: Arc<StorageManager<S3Storage>>,
    dns: Arc<DnsManager<Route53Dns>>,
}

#[derive(Serialize)]
struct ApiMessage {
    success: bool,
    message: String,
}

type ApiError = (StatusCode, Json<ApiMessage>);

fn api_error(err: OpError) -> ApiError {
    let status = match &err {
        OpError::Guard(_) => StatusCode::CONFLICT,
        OpError::AccessDenied => StatusCode::FORBIDDEN,
        OpError::Provider(_) => StatusCode::BAD_GATEWAY,
    };
    (
        status,
        Json(ApiMessage {
            success: false,
            message: err.to_string(),
        }),
    )
}

fn ok_message(message: impl Into<String>) -> Json<ApiMessage> {
    Json(ApiMessage {
        success: true,
        message: message.into(),
    })
}

async fn index() -> Html<&'static str> {
    Html(include_str!("index.html"))
}

async fn list_instances(State(state): State<AppState>) -> Result<Json<Vec<Instance>>, ApiError> {
    state.compute.list().await.map(Json).map_err(api_error)
}

#[derive(Deserialize)]
struct CreateInstanceRequest {
    name: String,
    os: OsImage,
    #[serde(rename = "type")]
    instance_type: String,
}

async fn create_instance(
    State(state): State<AppState>,
    Json(request): Json<CreateInstanceRequest>,
) -> Result<Json<ApiMessage>, ApiError> {
    let spec = LaunchSpec {
        name: request.name,
        os: request.os,
        instance_type: request.instance_type,
    };
    let id = state.compute.create(&spec).await.map_err(api_error)?;
    Ok(ok_message(format!("created instance {id}")))
}

async fn start_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.compute.start(&id).await.map_err(api_error)?;
    Ok(ok_message(format!("start signal sent to {id}")))
}

async fn stop_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.compute.stop(&id).await.map_err(api_error)?;
    Ok(ok_message(format!("stop signal sent to {id}")))
}

async fn terminate_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.compute.terminate(&id).await.map_err(api_error)?;
    Ok(ok_message(format!("instance {id} terminated")))
}

#[derive(Deserialize)]
struct ResizeRequest {
    #[serde(rename = "type")]
    instance_type: String,
}

async fn resize_instance(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<ResizeRequest>,
) -> Result<Json<ApiMessage>, ApiError> {
    state
        .compute
        .resize(&id, &request.instance_type)
        .await
        .map_err(api_error)?;
    Ok(ok_message(format!("instance {id} resized")))
}

async fn list_buckets(State(state): State<AppState>) -> Result<Json<Vec<Bucket>>, ApiError> {
    state.storage.list().await.map(Json).map_err(api_error)
}

#[derive(Deserialize)]
struct CreateBucketRequest {
    name: String,
    #[serde(default)]
    public: bool,
}

async fn create_bucket(
    State(state): State<AppState>,
    Json(request): Json<CreateBucketRequest>,
) -> Result<Json<ApiMessage>, ApiError> {
    state
        .storage
        .create(&request.name, request.public)
        .await
        .map_err(api_error)?;
    Ok(ok_message(format!("bucket {} created", request.name)))
}

async fn delete_bucket(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ApiMessage>, ApiError> {
    state.storage.delete(&name).await.map_err(api_error)?;
    Ok(ok_message(format!("bucket {name} deleted")))
}

async fn list_zones(State(state): State<AppState>) -> Result<Json<Vec<HostedZone>>, ApiError> {
    state.dns.list_zones().await.map(Json).map_err(api_error)
}

#[derive(Deserialize)]
struct CreateZoneRequest {
    name: String,
}

async fn create_zone(
    State(state): State<AppState>,
    Json(request): Json<CreateZoneRequest>,
) -> Result<Json<ApiMessage>, ApiError> {
    let zone = state.dns.create_zone(&request.name).await.map_err(api_error)?;
    Ok(ok_message(format!("zone {} created ({})", zone.name, zone.id)))
}

#[derive(Deserialize)]
struct CreateRecordRequest {
    name: String,
    ip: String,
}

async fn create_record(
    State(state): State<AppState>,
    Path(zone): Path<String>,
    Json(request): Json<CreateRecordRequest>,
) -> Result<Json<ApiMessage>, ApiError> {
    state
        .dns
        .create_record(&zone, &request.name, &request.ip)
        .await
        .map_err(api_error)?;
    Ok(ok_message(format!("record {} -> {}", request.name, request.ip)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    let config = load_config(std::env::var("AWS_REGION").ok()).await;
    let state = AppState {
        compute: Arc::new(ComputeManager::new(&config)),
        storage: Arc::new(StorageManager::new(&config)),
        dns: Arc::new(DnsManager::new(&config)),
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/api/instances", get(list_instances).post(create_instance))
        .route("/api/instances/:id", delete(terminate_instance))
        .route("/api/instances/:id/start", post(start_instance))
        .route("/api/instances/:id/stop", post(stop_instance))
        .route("/api/instances/:id/resize", post(resize_instance))
        .route("/api/buckets", get(list_buckets).post(create_bucket))
        .route("/api/buckets/:name", delete(delete_bucket))
        .route("/api/zones", get(list_zones).post(create_zone))
        .route("/api/zones/:zone/records", post(create_record))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], 8080));
    info!("opsdesk dashboard on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
