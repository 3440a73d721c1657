//! HTTP control surface.
//!
//! ```text
//! GET  /vm/{id}?types=version,vnc           200 JSON
//! POST /vm/{id}?action=stop&timeout=30      202 text
//! GET  /vm/{id}/wait?state=stopped&timeout=60
//! GET  /metrics
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;
use vmadmd_protocol::{ControlAction, InfoType, SysrqKind};

use super::{ControlDispatcher, ControlError};
use crate::metrics::MetricsRegistry;
use crate::state_waiter::WaitError;

/// Shared state of the control handlers.
pub struct ApiState {
    pub control: ControlDispatcher,
    pub metrics: MetricsRegistry,
}

/// Where the control surface listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddr {
    Unix(PathBuf),
    Tcp(SocketAddr),
}

impl std::fmt::Display for ListenAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unix(path) => write!(f, "unix:{}", path.display()),
            Self::Tcp(addr) => write!(f, "tcp:{}", addr),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct InfoParams {
    types: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ActionParams {
    action: Option<String>,
    timeout: Option<String>,
    request: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WaitParams {
    state: Option<String>,
    timeout: Option<String>,
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            ControlError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ControlError::NotFound(_) | ControlError::UnknownId(_) => StatusCode::NOT_FOUND,
            ControlError::Wait(WaitError::Timeout(..)) => StatusCode::REQUEST_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, format!("{}\n", self)).into_response()
    }
}

pub fn build_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/vm/{id}", get(get_vm).post(post_vm))
        .route("/vm/{id}/wait", get(wait_vm))
        .route("/metrics", get(metrics_handler))
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the control surface until `shutdown` resolves. A stale Unix socket
/// from a previous run is removed first.
pub async fn serve(
    router: Router,
    listen: &ListenAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    match listen {
        ListenAddr::Unix(path) => {
            match tokio::fs::remove_file(path).await {
                Ok(()) => info!(path = %path.display(), "removed stale control socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("removing stale socket {}", path.display()))
                }
            }
            let listener = tokio::net::UnixListener::bind(path)
                .with_context(|| format!("binding control socket {}", path.display()))?;
            info!(addr = %listen, "control surface listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .context("control surface failed")
        }
        ListenAddr::Tcp(addr) => {
            let listener = tokio::net::TcpListener::bind(addr)
                .await
                .with_context(|| format!("binding control surface on {}", addr))?;
            info!(addr = %listen, "control surface listening");
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .context("control surface failed")
        }
    }
}

fn parse_vm_id(id: &str) -> Result<Uuid, ControlError> {
    Uuid::parse_str(id).map_err(|_| ControlError::UnknownId(id.to_string()))
}

fn parse_timeout(raw: Option<&str>) -> Result<Option<u64>, ControlError> {
    raw.map(|t| {
        t.trim()
            .parse::<u64>()
            .map_err(|_| ControlError::BadRequest(format!("invalid timeout \"{}\"", t)))
    })
    .transpose()
}

fn finish<T>(metrics: &MetricsRegistry, action: &str, started: Instant, result: &Result<T, ControlError>) {
    metrics.record_control(action, started.elapsed(), result.is_ok());
    if let Err(e) = result {
        match e {
            ControlError::BadRequest(_) | ControlError::NotFound(_) | ControlError::UnknownId(_) => {}
            other => warn!(action, error = %other, "control request failed"),
        }
    }
}

async fn get_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(params): Query<InfoParams>,
) -> Response {
    let started = Instant::now();
    let result = info(&state.control, &id, &params).await;
    finish(&state.metrics, "info", started, &result);

    match result {
        Ok(info) => (StatusCode::OK, Json(info)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn info(control: &ControlDispatcher, id: &str, params: &InfoParams) -> Result<serde_json::Value, ControlError> {
    let uuid = parse_vm_id(id)?;
    let types = InfoType::parse_list(params.types.as_deref().unwrap_or(""))?;
    control.info(uuid, &types).await
}

async fn post_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(params): Query<ActionParams>,
) -> Response {
    let started = Instant::now();
    let action = match params.action.as_deref() {
        Some(raw) => raw.parse::<ControlAction>().map_err(ControlError::from),
        None => Err(ControlError::BadRequest("missing action".into())),
    };
    let label = action.as_ref().map(|a| a.as_str()).unwrap_or("invalid");

    let result = match action {
        Ok(action) => run_action(&state.control, &id, action, &params).await,
        Err(e) => Err(e),
    };
    finish(&state.metrics, label, started, &result);

    match result {
        Ok(ack) => (StatusCode::ACCEPTED, ack).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn run_action(
    control: &ControlDispatcher,
    id: &str,
    action: ControlAction,
    params: &ActionParams,
) -> Result<String, ControlError> {
    let uuid = parse_vm_id(id)?;
    match action {
        ControlAction::Stop => {
            let timeout = parse_timeout(params.timeout.as_deref())?;
            control.stop(uuid, timeout).await?;
            Ok(format!("Stopped {}\n", uuid))
        }
        ControlAction::Reset => {
            control.reset(uuid).await?;
            Ok(format!("Sent reset to {}\n", uuid))
        }
        ControlAction::Sysrq => {
            let kind: SysrqKind = match params.request.as_deref() {
                Some(raw) => raw.parse()?,
                None => return Err(ControlError::BadRequest("sysrq requires a request".into())),
            };
            control.sysrq(uuid, kind).await?;
            Ok(format!("Sent sysrq to {}\n", uuid))
        }
        ControlAction::ReloadDisplay => {
            control.reload_display(uuid).await?;
            Ok(format!("Reloaded display for {}\n", uuid))
        }
    }
}

async fn wait_vm(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Query(params): Query<WaitParams>,
) -> Response {
    let started = Instant::now();
    let result = wait(&state.control, &id, &params).await;
    finish(&state.metrics, "wait", started, &result);

    match result {
        Ok(body) => (StatusCode::OK, body).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn wait(control: &ControlDispatcher, id: &str, params: &WaitParams) -> Result<String, ControlError> {
    let uuid = parse_vm_id(id)?;
    let Some(target) = params.state.as_deref() else {
        return Err(ControlError::BadRequest("missing state".into()));
    };
    let timeout = parse_timeout(params.timeout.as_deref())?;
    control.wait(uuid, target, timeout).await?;
    Ok(format!("VM {} is {}\n", uuid, target))
}

async fn metrics_handler(State(state): State<Arc<ApiState>>) -> Response {
    match state.metrics.encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "application/openmetrics-text; version=1.0.0; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => (StatusCode::INTERNAL_SERVER_ERROR, format!("failed to encode metrics: {}\n", e)).into_response(),
    }
}

async fn not_found() -> Response {
    (StatusCode::NOT_FOUND, "not found\n").into_response()
}
