use std::{future::Future, sync::Arc};

use axum::{
    Router,
    extract::{DefaultBodyLimit, Multipart, State, multipart::MultipartRejection},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use printrelay_core::{
    DispatchError, ExecutableLocator, LIVENESS_BANNER, PRINT_ROUTE, ProcessTable,
    SystemProcessTable, supersede_older_instances,
};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

pub mod dispatch;
pub mod host;
pub mod ingest;
pub mod logging;
pub mod settings;

use dispatch::{Dispatcher, ProcessLauncher};
use host::HostError;
use ingest::{IngestError, StagingLedger};
use settings::AgentConfig;

#[derive(Clone)]
pub struct AppState {
    config: Arc<AgentConfig>,
    dispatcher: Arc<Dispatcher>,
    staging: StagingLedger,
}

impl AppState {
    pub fn new(config: AgentConfig, dispatcher: Dispatcher) -> Self {
        Self {
            config: Arc::new(config),
            dispatcher: Arc::new(dispatcher),
            staging: StagingLedger::default(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }
}

/// Everything an execution host drives: the request pipeline plus startup supersession.
pub struct PrintAgent {
    state: AppState,
    processes: Arc<dyn ProcessTable>,
}

impl PrintAgent {
    pub fn new(config: AgentConfig, dispatcher: Dispatcher, processes: Arc<dyn ProcessTable>) -> Self {
        Self {
            state: AppState::new(config, dispatcher),
            processes,
        }
    }

    /// Wires the real process launcher and process table.
    pub fn from_config(config: AgentConfig) -> Self {
        let locator = ExecutableLocator::new(config.reader_path.clone());
        let dispatcher = Dispatcher::new(locator, Arc::new(ProcessLauncher));
        Self::new(config, dispatcher, Arc::new(SystemProcessTable))
    }

    pub fn config(&self) -> &AgentConfig {
        self.state.config()
    }

    pub fn router(&self) -> Router {
        build_router(self.state.clone())
    }

    /// Supersedes older instances once, then binds the listener.
    pub async fn start_listener(&self) -> Result<TcpListener, HostError> {
        let processes = Arc::clone(&self.processes);
        match tokio::task::spawn_blocking(move || supersede_older_instances(processes.as_ref()))
            .await
        {
            Ok(report) if !report.is_noop() => info!(
                "instance supersession finished: {} terminated, {} failed",
                report.terminated.len(),
                report.failed.len()
            ),
            Ok(_) => {}
            Err(err) => warn!("instance supersession did not complete: {}", err),
        }

        let address = self.config().bind_address.clone();
        TcpListener::bind(&address)
            .await
            .map_err(|source| HostError::ListenerStart { address, source })
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("print dispatch task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Ingest(err) if err.is_client_error() => {
                warn!("rejected print request: {}", err);
                (StatusCode::BAD_REQUEST, err.to_string())
            }
            ApiError::Ingest(err) => {
                error!("failed to store uploaded document: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to store the uploaded document".to_owned(),
                )
            }
            ApiError::Dispatch(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("failed to print document: {err}"),
            ),
            ApiError::Task(err) => {
                error!("print dispatch task failed: {}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "failed to print document".to_owned(),
                )
            }
        };
        (status, message).into_response()
    }
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route("/", get(liveness_handler))
        .route(
            PRINT_ROUTE,
            post(print_pdf_handler).fallback(method_not_allowed_handler),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

pub async fn serve<F>(listener: TcpListener, router: Router, shutdown: F) -> Result<(), HostError>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!(
        "print agent listening on {}",
        listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_owned())
    );
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(HostError::Serve)
}

async fn liveness_handler() -> &'static str {
    LIVENESS_BANNER
}

async fn method_not_allowed_handler() -> impl IntoResponse {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        [(header::ALLOW, "POST")],
        "only POST is allowed on this endpoint",
    )
}

async fn print_pdf_handler(
    State(state): State<AppState>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<String, ApiError> {
    info!("received print request");
    let multipart =
        multipart.map_err(|rejection| IngestError::ParseFailure(rejection.body_text()))?;

    let request = ingest::read_print_request(multipart).await?;
    let staged =
        ingest::stage_document(&state.config.staging_dir, &request, &state.staging).await?;

    // Path probing and the spawn are blocking calls.
    let dispatcher = Arc::clone(&state.dispatcher);
    let job = staged.clone();
    let device_name = request.device_name.clone();
    // On failure the staged file stays behind for inspection.
    tokio::task::spawn_blocking(move || dispatcher.dispatch(&job, &device_name)).await??;

    info!(
        "print request for '{}' on '{}' dispatched as {}",
        request.original_file_name,
        request.device_name,
        staged.file_name()
    );
    ingest::discard_staged(staged, state.config.staged_retention, &state.staging).await;
    Ok(format!(
        "Document '{}' was sent to printer '{}'.",
        request.original_file_name, request.device_name
    ))
}
