//! HTTP driver for sensing sessions.
//!
//! This module provides an HTTP server that:
//! - Reports and refreshes which registered sensor nodes are reachable
//! - Runs a session on request and returns a summary of the collected frames
//! - Lets clients poll the session state and the latest classification
//!
//! # Architecture
//!
//! ```text
//! client ──→ POST /session ──→ SessionController ──→ sensor nodes
//!   │                                 ↓
//!   └──→ GET /session ←──── state + latest classification
//! ```

use crate::config::Profile;
use crate::core::frame::ExportFormat;
use crate::core::inference::{Classification, InferencePlan};
use crate::device::transport::Transport;
use crate::device::types::{DeviceId, DEFAULT_SAMPLE_PERIOD_MS};
use crate::session::{SessionController, SessionError, SessionRequest, SessionState};
use crate::stats::StatsSnapshot;
use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};

/// How long `GET /session` waits for a configuring session to become active.
const AWAIT_START_LIMIT: Duration = Duration::from_secs(5);

/// Server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Port to bind to (0 for random)
    pub port: u16,
    /// Discovery window for `POST /scan`
    pub scan_timeout: Duration,
    /// Sampling period when the request names no profile
    pub sampling_ms: u16,
    /// Named profiles clients can request
    pub profiles: Vec<Profile>,
    /// Classifiers bound to profile names
    pub classifiers: HashMap<String, InferencePlan>,
    /// Directory for frame logs; `None` keeps them in memory only
    pub export_dir: Option<PathBuf>,
    pub export_format: ExportFormat,
}

impl ServerConfig {
    /// Create a new server configuration
    pub fn new(port: u16) -> Self {
        Self {
            port,
            scan_timeout: Duration::from_secs(2),
            sampling_ms: DEFAULT_SAMPLE_PERIOD_MS,
            profiles: Profile::defaults(),
            classifiers: HashMap::new(),
            export_dir: None,
            export_format: ExportFormat::Csv,
        }
    }

    /// Bind `plan` to the profile called `name`.
    pub fn with_classifier(mut self, name: &str, plan: InferencePlan) -> Self {
        self.classifiers.insert(name.to_string(), plan);
        self
    }
}

/// Shared server state
pub struct ServerState<T: Transport> {
    controller: Arc<SessionController<T>>,
    config: ServerConfig,
}

/// Body of `POST /session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartSessionRequest {
    pub devices: Vec<String>,
    pub duration_secs: u64,
    /// Profile name; selects sampling period and classifier
    #[serde(default)]
    pub profile: Option<String>,
    /// Overrides the sampling period for a collect-only session
    #[serde(default)]
    pub sampling_ms: Option<u16>,
}

/// Response of `POST /session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub devices: Vec<String>,
    pub frames: usize,
    pub state: SessionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub export_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest: Option<Classification>,
}

/// Response of `GET /session`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub running: bool,
    pub latest: Option<Classification>,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub stats: StatsSnapshot,
}

/// Error response
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn api_error(status: StatusCode, code: &str, error: impl ToString) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            code: code.to_string(),
        }),
    )
}

impl From<SessionError> for (StatusCode, Json<ErrorResponse>) {
    fn from(e: SessionError) -> Self {
        let status = match &e {
            SessionError::InvalidCommandState(_) => StatusCode::CONFLICT,
            SessionError::NoDevices | SessionError::UnknownDevice(_) => StatusCode::BAD_REQUEST,
            SessionError::ConnectionFailed { .. } | SessionError::ConfigurationTimeout(_) => {
                StatusCode::BAD_GATEWAY
            }
            SessionError::Scan(_) | SessionError::Interrupted => StatusCode::INTERNAL_SERVER_ERROR,
        };
        api_error(status, e.code(), &e)
    }
}

/// GET /health
async fn health<T: Transport>(State(state): State<Arc<ServerState<T>>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        stats: state.controller.stats().stats(),
    })
}

/// GET /devices
///
/// Online status as of the last scan.
async fn devices<T: Transport>(
    State(state): State<Arc<ServerState<T>>>,
) -> Json<BTreeMap<DeviceId, bool>> {
    Json(state.controller.registry().online_status())
}

/// POST /scan
async fn scan<T: Transport>(
    State(state): State<Arc<ServerState<T>>>,
) -> Result<Json<BTreeMap<DeviceId, bool>>, ApiError> {
    let status = state.controller.scan(state.config.scan_timeout).await?;
    Ok(Json(status))
}

/// POST /session
///
/// Runs the session to completion. Poll `GET /session` from another
/// connection to follow it. The session and its export run on their own
/// task, so a client that hangs up does not cut them short.
async fn start_session<T: Transport>(
    State(state): State<Arc<ServerState<T>>>,
    Json(body): Json<StartSessionRequest>,
) -> Result<Json<SessionSummary>, ApiError> {
    let devices: BTreeSet<DeviceId> = body.devices.iter().map(DeviceId::new).collect();
    state
        .controller
        .registry()
        .ensure_selectable(&devices)
        .map_err(|e| api_error(StatusCode::CONFLICT, "DEVICE_UNAVAILABLE", e))?;

    let mut request = SessionRequest::new(devices, Duration::from_secs(body.duration_secs))
        .with_sampling_ms(body.sampling_ms.unwrap_or(state.config.sampling_ms));

    if let Some(name) = &body.profile {
        let profile = state
            .config
            .profiles
            .iter()
            .find(|p| &p.name == name)
            .ok_or_else(|| {
                api_error(
                    StatusCode::BAD_REQUEST,
                    "UNKNOWN_PROFILE",
                    format!("Unknown profile: {name}"),
                )
            })?;
        let plan = state.config.classifiers.get(name).cloned().ok_or_else(|| {
            api_error(
                StatusCode::BAD_REQUEST,
                "NO_CLASSIFIER",
                format!("No classifier bound to profile {name}"),
            )
        })?;
        if plan.mode() != profile.mode {
            return Err(api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PROFILE_MISMATCH",
                format!(
                    "Classifier for {name} expects {}, profile is {}",
                    plan.mode(),
                    profile.mode
                ),
            ));
        }
        request = request.with_sampling_ms(profile.sampling_ms).with_plan(plan);
    }

    let session = tokio::spawn(run_and_export(state.clone(), request));
    let summary = session
        .await
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, "INTERRUPTED", e))??;
    Ok(Json(summary))
}

async fn run_and_export<T: Transport>(
    state: Arc<ServerState<T>>,
    request: SessionRequest,
) -> Result<SessionSummary, SessionError> {
    let log = state.controller.start_session(request).await?;

    let export_path = match &state.config.export_dir {
        Some(dir) => {
            let path = dir.join(log.file_name(state.config.export_format));
            match log.save(&path, state.config.export_format) {
                Ok(()) => Some(path.display().to_string()),
                Err(e) => {
                    tracing::error!("Failed to write frame log: {}", e);
                    None
                }
            }
        }
        None => None,
    };

    Ok(SessionSummary {
        session_id: log.session_id.to_string(),
        devices: log.devices.iter().map(|d| d.to_string()).collect(),
        frames: log.len(),
        state: state.controller.state(),
        export_path,
        latest: state.controller.latest_result().get(),
    })
}

/// GET /session
///
/// While devices are still being configured the answer is held back until
/// collection starts, bounded by [`AWAIT_START_LIMIT`].
async fn session_status<T: Transport>(
    State(state): State<Arc<ServerState<T>>>,
) -> Json<SessionStatus> {
    let mut rx = state.controller.subscribe_state();
    let _ = tokio::time::timeout(
        AWAIT_START_LIMIT,
        rx.wait_for(|s| *s != SessionState::AwaitingStart),
    )
    .await;

    Json(SessionStatus {
        state: state.controller.state(),
        running: state.controller.is_running(),
        latest: state.controller.latest_result().get(),
    })
}

/// POST /session/stop
async fn stop_session<T: Transport>(
    State(state): State<Arc<ServerState<T>>>,
) -> Result<StatusCode, ApiError> {
    if state.controller.stop() {
        Ok(StatusCode::ACCEPTED)
    } else {
        Err(api_error(
            StatusCode::CONFLICT,
            "NO_SESSION",
            "No session is running",
        ))
    }
}

/// Build the router without binding a socket.
pub fn router<T: Transport>(config: ServerConfig, controller: Arc<SessionController<T>>) -> Router {
    let state = Arc::new(ServerState { controller, config });

    Router::new()
        .route("/health", get(health::<T>))
        .route("/devices", get(devices::<T>))
        .route("/scan", post(scan::<T>))
        .route("/session", post(start_session::<T>).get(session_status::<T>))
        .route("/session/stop", post(stop_session::<T>))
        .layer(
            CorsLayer::new()
                .allow_origin([
                    HeaderValue::from_static("http://localhost"),
                    HeaderValue::from_static("http://127.0.0.1"),
                ])
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run the HTTP server
pub async fn run<T: Transport>(
    config: ServerConfig,
    controller: Arc<SessionController<T>>,
) -> anyhow::Result<(SocketAddr, tokio::sync::oneshot::Sender<()>)> {
    let addr = SocketAddr::from(([127, 0, 0, 1], config.port));
    let app = router(config, controller);

    let listener = TcpListener::bind(addr).await?;
    let actual_addr = listener.local_addr()?;

    tracing::info!("Gateway server listening on http://{}", actual_addr);

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                tracing::info!("Server shutdown signal received");
            })
            .await
        {
            tracing::error!("Server error: {}", e);
        }
    });

    Ok((actual_addr, shutdown_tx))
}
