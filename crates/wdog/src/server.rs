use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::Json;
use axum::Router;
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, Path, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::compression::CompressionLayer;
use tower_http::timeout::TimeoutLayer;
use tracing::{Instrument, error, info, info_span, warn};
use uuid::Uuid;

use crate::builder::BuildError;
use crate::invoke::InvokeError;
use crate::protocol::{RunRequest, RunResult};
use crate::rights::HandoffError;
use crate::sandbox::{CallError, Mode, Sandbox};

/// Slack on top of the function budget before the transport gives up.
const REQUEST_TIMEOUT_SLACK: Duration = Duration::from_secs(30);
const BUILD_REQUEST_TIMEOUT: Duration = Duration::from_secs(600);
const MAX_BODY_LIMIT_BYTES: usize = 16 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub sandbox: Arc<Sandbox>,
}

impl AppState {
    pub fn new(sandbox: Sandbox) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
        }
    }
}

/// Routes for the instance's mode; a run route exists only where a runner
/// can be reached.
pub fn router(state: AppState) -> Router {
    let (routes, timeout) = match state.sandbox.mode() {
        Mode::Run(_) => (
            Router::new()
                .route("/v1/run", post(run_handler))
                .route("/v1/run/{suff}", post(try_handler)),
            state.sandbox.budget() + REQUEST_TIMEOUT_SLACK,
        ),
        Mode::Proxy(_) => (
            Router::new().route("/v1/run", post(run_handler)),
            state.sandbox.budget() + REQUEST_TIMEOUT_SLACK,
        ),
        Mode::Build(_) => (
            Router::new().route("/v1/build", post(build_handler)),
            BUILD_REQUEST_TIMEOUT,
        ),
    };
    routes
        .layer(
            ServiceBuilder::new()
                .layer(DefaultBodyLimit::max(MAX_BODY_LIMIT_BYTES))
                .layer(TimeoutLayer::with_status_code(
                    StatusCode::REQUEST_TIMEOUT,
                    timeout,
                )),
        )
        .route("/v1/ping", get(ping))
        .layer(CompressionLayer::new())
        .layer(middleware::from_fn(log_request_response))
        .with_state(state)
}

async fn ping() -> Response {
    let mut response = StatusCode::OK.into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

async fn log_request_response(request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let uri = request.uri().clone();
    let span = info_span!("request", id = %Uuid::new_v4(), %method, %uri);
    async move {
        let start = Instant::now();
        info!("request");
        let response = next.run(request).await;
        info!(
            status = response.status().as_u16(),
            latency_ms = start.elapsed().as_millis() as u64,
            "response"
        );
        response
    }
    .instrument(span)
    .await
}

async fn run_handler(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_json(rejection),
    };
    respond(state.sandbox.run(request).await)
}

async fn try_handler(
    State(state): State<AppState>,
    Path(suff): Path<String>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_json(rejection),
    };
    respond(state.sandbox.try_run(suff, request).await)
}

async fn build_handler(
    State(state): State<AppState>,
    payload: Result<Json<RunRequest>, JsonRejection>,
) -> Response {
    let request = match payload {
        Ok(Json(request)) => request,
        Err(rejection) => return bad_json(rejection),
    };
    respond(state.sandbox.build(request).await)
}

fn respond(result: Result<RunResult, CallError>) -> Response {
    match result {
        Ok(result) => Json(result).into_response(),
        Err(err) => error_response(err),
    }
}

fn bad_json(rejection: JsonRejection) -> Response {
    warn!(error = %rejection.body_text(), "bad request body");
    (StatusCode::BAD_REQUEST, rejection.body_text()).into_response()
}

fn error_response(err: CallError) -> Response {
    let status = call_status(&err);
    if status.is_server_error() {
        error!(error = %err, "call failed");
    } else {
        warn!(error = %err, "call rejected");
    }
    (status, err.to_string()).into_response()
}

fn call_status(err: &CallError) -> StatusCode {
    match err {
        CallError::Unauthorized => StatusCode::UNAUTHORIZED,
        CallError::Forbidden => StatusCode::FORBIDDEN,
        CallError::BadRequest(_)
        | CallError::Handoff(HandoffError::BadKey(_))
        | CallError::Build(BuildError::InvalidSources(_)) => StatusCode::BAD_REQUEST,
        CallError::Invoke(InvokeError::NotReady) => StatusCode::SERVICE_UNAVAILABLE,
        CallError::Handoff(_) => StatusCode::BAD_GATEWAY,
        CallError::Invoke(_) | CallError::Spawn(_) | CallError::Build(_) | CallError::Aborted(_) => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}
