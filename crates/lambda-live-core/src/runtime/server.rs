use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{any, get, post};
use lambda_live_proto::{Event, FunctionError, FunctionSuccess, Invocation};
use serde_json::Value;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::queue::{InvocationQueue, Next};
use super::{API_VERSION, RuntimeServerError, proxy};
use crate::bus::EventBus;
use crate::workers::{WorkerInfo, WorkerManagerHandle};

const BODY_LIMIT: usize = 10 * 1024 * 1024;

/// Lookup of the workers the server answers for.
#[async_trait]
pub trait WorkerDirectory: Send + Sync + 'static {
    async fn describe(&self, worker_id: &str) -> Option<WorkerInfo>;
}

#[async_trait]
impl WorkerDirectory for WorkerManagerHandle {
    async fn describe(&self, worker_id: &str) -> Option<WorkerInfo> {
        match WorkerManagerHandle::describe(self, worker_id).await {
            Ok(info) => info,
            Err(e) => {
                warn!(worker_id, error = %e, "Worker lookup failed");
                None
            }
        }
    }
}

#[derive(Clone)]
pub struct RuntimeState {
    pub bus: EventBus,
    pub queue: InvocationQueue,
    pub workers: Arc<dyn WorkerDirectory>,
    pub http: reqwest::Client,
}

impl RuntimeState {
    pub fn new(bus: EventBus, queue: InvocationQueue, workers: Arc<dyn WorkerDirectory>) -> Self {
        Self {
            bus,
            queue,
            workers,
            http: reqwest::Client::new(),
        }
    }
}

pub fn router(state: RuntimeState) -> Router {
    let base = format!("/{{worker_id}}/{API_VERSION}/runtime");
    Router::new()
        .route(&format!("{base}/invocation/next"), get(next_invocation))
        .route(
            &format!("{base}/invocation/{{request_id}}/response"),
            post(invocation_response),
        )
        .route(
            &format!("{base}/invocation/{{request_id}}/error"),
            post(invocation_error),
        )
        .route(&format!("{base}/init/error"), post(init_error))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .route("/proxy/{*target}", any(proxy::forward))
        .with_state(state)
}

/// Listener for the runtime API, bound before the session starts so its
/// address can be handed to workers.
pub struct RuntimeServer {
    listener: TcpListener,
    addr: SocketAddr,
}

impl RuntimeServer {
    /// Binds `host:port`, falling back to a free port when it is taken.
    pub async fn bind(host: &str, port: u16) -> Result<Self, RuntimeServerError> {
        let listener = match TcpListener::bind((host, port)).await {
            Ok(listener) => listener,
            Err(e) if port != 0 => {
                debug!(port, error = %e, "Preferred runtime port unavailable");
                TcpListener::bind((host, 0))
                    .await
                    .map_err(|source| RuntimeServerError::Bind {
                        addr: format!("{host}:0"),
                        source,
                    })?
            }
            Err(source) => {
                return Err(RuntimeServerError::Bind {
                    addr: format!("{host}:{port}"),
                    source,
                });
            }
        };
        let addr = listener
            .local_addr()
            .map_err(|source| RuntimeServerError::Bind {
                addr: format!("{host}:{port}"),
                source,
            })?;
        Ok(Self { listener, addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Value for `AWS_LAMBDA_RUNTIME_API`, without the worker segment.
    pub fn runtime_api(&self) -> String {
        self.addr.to_string()
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Serves until `cancel` fires. Pending long polls are released first so
    /// shutdown does not wait on them.
    pub async fn serve(
        self,
        state: RuntimeState,
        cancel: CancellationToken,
    ) -> Result<(), RuntimeServerError> {
        let queue = state.queue.clone();
        info!(url = %self.url(), "Runtime API listening");
        axum::serve(self.listener, router(state))
            .with_graceful_shutdown(async move {
                cancel.cancelled().await;
                queue.close_all();
            })
            .await
            .map_err(RuntimeServerError::Serve)
    }
}

async fn next_invocation(
    State(state): State<RuntimeState>,
    Path(worker_id): Path<String>,
) -> Response {
    debug!(worker_id = %worker_id, "Worker waiting for next invocation");
    let invocation = match state.queue.next(&worker_id) {
        Next::Ready(invocation) => invocation,
        Next::Waiting(rx) => match rx.await {
            Ok(invocation) => invocation,
            Err(_) => {
                debug!(worker_id = %worker_id, "Long poll released");
                return StatusCode::GONE.into_response();
            }
        },
    };
    debug!(worker_id = %worker_id, request_id = %invocation.request_id, "Sending next invocation");
    (
        StatusCode::OK,
        invocation_headers(&invocation),
        Json(invocation.event),
    )
        .into_response()
}

async fn invocation_response(
    State(state): State<RuntimeState>,
    Path((worker_id, request_id)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    let Some(worker) = state.workers.describe(&worker_id).await else {
        warn!(worker_id = %worker_id, request_id = %request_id, "Response from unknown worker");
        return StatusCode::NOT_FOUND;
    };
    debug!(worker_id = %worker_id, request_id = %request_id, "Worker responded");
    state.bus.publish(&Event::FunctionSuccess(FunctionSuccess {
        worker_id,
        function_id: worker.function_id,
        request_id,
        body: response_body(&body),
    }));
    StatusCode::ACCEPTED
}

async fn invocation_error(
    State(state): State<RuntimeState>,
    Path((worker_id, request_id)): Path<(String, String)>,
    body: Bytes,
) -> StatusCode {
    let Some(worker) = state.workers.describe(&worker_id).await else {
        warn!(worker_id = %worker_id, request_id = %request_id, "Error from unknown worker");
        return StatusCode::NOT_FOUND;
    };
    let report = ErrorReport::parse(&body);
    debug!(worker_id = %worker_id, request_id = %request_id, error_type = %report.error_type, "Worker reported an error");
    state
        .bus
        .publish(&report.into_event(worker_id, worker.function_id, request_id));
    StatusCode::ACCEPTED
}

async fn init_error(
    State(state): State<RuntimeState>,
    Path(worker_id): Path<String>,
    body: Bytes,
) -> Response {
    let Some(worker) = state.workers.describe(&worker_id).await else {
        warn!(worker_id = %worker_id, "Init error from unknown worker");
        return StatusCode::NOT_FOUND.into_response();
    };
    let report = ErrorReport::parse(&body);
    warn!(worker_id = %worker_id, error_type = %report.error_type, message = %report.error_message, "Worker failed to initialize");
    match worker.last_request_id {
        Some(request_id) => state
            .bus
            .publish(&report.into_event(worker_id, worker.function_id, request_id)),
        None => debug!(worker_id = %worker_id, "No invocation to fail"),
    }
    Json("ok").into_response()
}

fn invocation_headers(invocation: &Invocation) -> HeaderMap {
    let context = &invocation.context;
    let deadline = now_millis().saturating_add(invocation.deadline);
    let values = [
        ("lambda-runtime-aws-request-id", Some(invocation.request_id.clone())),
        ("lambda-runtime-deadline-ms", Some(deadline.to_string())),
        (
            "lambda-runtime-invoked-function-arn",
            context.invoked_function_arn.clone(),
        ),
        (
            "lambda-runtime-client-context",
            Some(json_or_null(context.client_context.as_ref())),
        ),
        (
            "lambda-runtime-cognito-identity",
            Some(json_or_null(context.identity.as_ref())),
        ),
        ("lambda-runtime-log-group-name", context.log_group_name.clone()),
        ("lambda-runtime-log-stream-name", context.log_stream_name.clone()),
    ];

    let mut headers = HeaderMap::new();
    for (name, value) in values {
        let Some(value) = value else {
            continue;
        };
        match HeaderValue::from_str(&value) {
            Ok(value) => {
                headers.insert(HeaderName::from_static(name), value);
            }
            Err(_) => warn!(header = name, "Skipping header with invalid value"),
        }
    }
    headers
}

fn json_or_null(value: Option<&Value>) -> String {
    value.map_or_else(|| "null".to_string(), Value::to_string)
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Handlers may return any JSON value; non-JSON bodies are kept as text.
fn response_body(body: &[u8]) -> Value {
    if body.is_empty() {
        return Value::Null;
    }
    serde_json::from_slice(body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(body).into_owned()))
}

#[derive(Debug, Default, PartialEq)]
struct ErrorReport {
    error_type: String,
    error_message: String,
    trace: Vec<String>,
}

impl ErrorReport {
    /// Accepts `trace` or `stackTrace`; frames that are not strings are kept
    /// as their JSON text.
    fn parse(body: &[u8]) -> Self {
        let Ok(Value::Object(map)) = serde_json::from_slice::<Value>(body) else {
            return Self {
                error_type: "Unknown".into(),
                error_message: String::from_utf8_lossy(body).into_owned(),
                trace: Vec::new(),
            };
        };
        let text = |key: &str| {
            map.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        let trace = map
            .get("trace")
            .or_else(|| map.get("stackTrace"))
            .and_then(Value::as_array)
            .map(|frames| {
                frames
                    .iter()
                    .map(|frame| match frame {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect()
            })
            .unwrap_or_default();
        Self {
            error_type: text("errorType"),
            error_message: text("errorMessage"),
            trace,
        }
    }

    fn into_event(self, worker_id: String, function_id: String, request_id: String) -> Event {
        Event::FunctionError(FunctionError {
            worker_id,
            function_id,
            request_id,
            error_type: self.error_type,
            error_message: self.error_message,
            trace: self.trace,
        })
    }
}
