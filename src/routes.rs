use std::sync::Arc;

use axum::{
    body::Body,
    extract::{DefaultBodyLimit, MatchedPath, Path, Request, State},
    http::{Method, Response, StatusCode},
    routing::{delete, get, post, put},
    Json,
    Router,
};
use futures::StreamExt;
use prometheus::Encoder;
use state_store::BlobdState;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::http_objects::{BlobdAPIError, HealthzResponse};

#[derive(Clone)]
pub struct RouteState {
    pub blobd_state: Arc<BlobdState>,
    pub registry: Arc<prometheus::Registry>,
    pub metrics: Arc<metrics::api_io_stats::Metrics>,
}

pub fn create_routes(route_state: RouteState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(index))
        .route(
            "/store/{*location}",
            post(create_blob).with_state(route_state.clone()),
        )
        .route(
            "/store/{*location}",
            put(update_blob).with_state(route_state.clone()),
        )
        .route(
            "/store/{*location}",
            get(get_blob).with_state(route_state.clone()),
        )
        .route(
            "/store/{*location}",
            delete(delete_blob).with_state(route_state.clone()),
        )
        .route("/healthz", get(healthz).with_state(route_state.clone()))
        .route(
            "/metrics",
            get(export_metrics).with_state(route_state.clone()),
        )
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(|req: &Request| {
                    let method = req.method();
                    let uri = req.uri();

                    let matched_path = req
                        .extensions()
                        .get::<MatchedPath>()
                        .map(|matched_path| matched_path.as_str());

                    tracing::debug_span!("request", %method, %uri, matched_path)
                })
                .on_failure(()),
        )
        .layer(cors)
        .layer(DefaultBodyLimit::max(usize::MAX))
}

async fn index() -> &'static str {
    "blobd server"
}

async fn create_blob(
    Path(location): Path<String>,
    State(state): State<RouteState>,
    body: Body,
) -> Result<StatusCode, BlobdAPIError> {
    let payload = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(anyhow::Error::from));
    let written = state.blobd_state.create(&location, payload).await?;
    state.metrics.creates.add(1, &[]);
    state.metrics.ingested_bytes.add(written, &[]);
    Ok(StatusCode::NO_CONTENT)
}

async fn update_blob(
    Path(location): Path<String>,
    State(state): State<RouteState>,
    body: Body,
) -> Result<StatusCode, BlobdAPIError> {
    let payload = body
        .into_data_stream()
        .map(|chunk| chunk.map_err(anyhow::Error::from));
    let written = state.blobd_state.update(&location, payload).await?;
    state.metrics.updates.add(1, &[]);
    state.metrics.ingested_bytes.add(written, &[]);
    Ok(StatusCode::NO_CONTENT)
}

async fn get_blob(
    Path(location): Path<String>,
    State(state): State<RouteState>,
) -> Result<Response<Body>, BlobdAPIError> {
    let (_blob, payload) = state.blobd_state.get(&location).await?;
    state.metrics.reads.add(1, &[]);
    let served_bytes = state.metrics.served_bytes.clone();
    let payload = payload.inspect(move |chunk| {
        if let Ok(chunk) = chunk {
            served_bytes.add(chunk.len() as u64, &[]);
        }
    });
    Response::builder()
        .header("Content-Type", "application/octet-stream")
        .body(Body::from_stream(payload))
        .map_err(|e| BlobdAPIError::internal_error_str(&e.to_string()))
}

async fn delete_blob(
    Path(location): Path<String>,
    State(state): State<RouteState>,
) -> Result<StatusCode, BlobdAPIError> {
    state.blobd_state.delete(&location).await?;
    state.metrics.deletes.add(1, &[]);
    Ok(StatusCode::NO_CONTENT)
}

async fn healthz(State(state): State<RouteState>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        status: "ok".to_string(),
        live_blobs: state.blobd_state.live_blobs(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn export_metrics(
    State(state): State<RouteState>,
) -> Result<String, BlobdAPIError> {
    let mut buffer = Vec::new();
    let encoder = prometheus::TextEncoder::new();
    encoder
        .encode(&state.registry.gather(), &mut buffer)
        .map_err(|e| BlobdAPIError::internal_error_str(&e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| BlobdAPIError::internal_error_str(&e.to_string()))
}
