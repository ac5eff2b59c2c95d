//! HTTP API server
//!
//! The only server that uses the query pipeline: a query request's body is
//! pushed into a fresh pooler with `append`, the pooler is armed with
//! `start`, and the response body is pulled out with `read_some` on a
//! blocking task. The bounded channel between that task and the response
//! stream is what gives slow clients backpressure.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::query::{QueryError, QueryProcessor, QueryResultsPooler};
use crate::signal::SignalHandler;
use crate::storage::Connection;
use crate::types::{ApiEndpoint, ServerSettings};

use super::Server;

const RESPONSE_CHUNK_SIZE: usize = 4096;
const RESPONSE_CHANNEL_DEPTH: usize = 8;

/// Registry factory for `"HTTP"` settings.
pub(super) fn build(
    _con: Arc<Connection>,
    qproc: Arc<QueryProcessor>,
    settings: &ServerSettings,
) -> Result<Arc<dyn Server>> {
    if settings.protocols.len() != 1 {
        bail!("invalid HTTP server settings: expected exactly one protocol endpoint");
    }
    Ok(Arc::new(HttpServer::new(qproc, settings.protocols[0].addr)))
}

pub struct HttpServer {
    inner: Arc<Inner>,
}

struct Inner {
    qproc: Arc<QueryProcessor>,
    addr: Mutex<SocketAddr>,
    shutdown: broadcast::Sender<()>,
}

impl HttpServer {
    pub fn new(qproc: Arc<QueryProcessor>, addr: SocketAddr) -> Self {
        let (shutdown, _) = broadcast::channel(1);
        Self {
            inner: Arc::new(Inner {
                qproc,
                addr: Mutex::new(addr),
                shutdown,
            }),
        }
    }

    /// Endpoint the server is bound to (available after `start`).
    pub fn local_addr(&self) -> SocketAddr {
        *self.inner.addr.lock()
    }
}

impl Inner {
    fn stop(&self) {
        let _ = self.shutdown.send(());
    }
}

#[async_trait]
impl Server for HttpServer {
    async fn start(&self, sig: &mut SignalHandler, id: u32) -> Result<()> {
        let stopper = self.inner.clone();
        sig.add_action(id, move || stopper.stop());

        let addr = *self.inner.addr.lock();
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("can't bind HTTP socket {}", addr))?;
        let local = listener.local_addr()?;
        *self.inner.addr.lock() = local;

        let app = create_router(self.inner.qproc.clone());
        let mut shutdown = self.inner.shutdown.subscribe();
        tokio::spawn(async move {
            let served = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown.recv().await;
                    info!("HTTP server shutting down");
                })
                .await;
            if let Err(err) = served {
                error!("HTTP server failed: {}", err);
            }
        });
        info!("HTTP server started, endpoint: {}", local);
        Ok(())
    }

    fn stop(&self) {
        self.inner.stop();
    }

    fn name(&self) -> &'static str {
        "HTTP"
    }
}

#[derive(Clone)]
struct AppState {
    qproc: Arc<QueryProcessor>,
}

/// Build the API router. Exposed for in-process testing.
pub fn create_router(qproc: Arc<QueryProcessor>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/query", post(api_query))
        .route("/api/suggest", post(api_suggest))
        .route("/api/search", post(api_search))
        .route("/api/stats", get(api_stats))
        .route("/api/function-names", get(api_function_names))
        .route("/api/version", get(api_version))
        .layer(TraceLayer::new_for_http())
        .with_state(AppState { qproc })
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn api_query(State(state): State<AppState>, body: Bytes) -> Response {
    run_query(state, ApiEndpoint::Query, body).await
}

async fn api_suggest(State(state): State<AppState>, body: Bytes) -> Response {
    run_query(state, ApiEndpoint::Suggest, body).await
}

async fn api_search(State(state): State<AppState>, body: Bytes) -> Response {
    run_query(state, ApiEndpoint::Search, body).await
}

async fn api_stats(State(state): State<AppState>) -> Response {
    let qproc = state.qproc.clone();
    match tokio::task::spawn_blocking(move || qproc.get_all_stats()).await {
        Ok(Ok(stats)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json")],
            stats,
        )
            .into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => task_panic_response(err),
    }
}

async fn api_function_names(State(state): State<AppState>) -> Response {
    resource(state, "function-names").await
}

async fn api_version(State(state): State<AppState>) -> Response {
    resource(state, "version").await
}

async fn resource(state: AppState, name: &'static str) -> Response {
    let qproc = state.qproc.clone();
    match tokio::task::spawn_blocking(move || qproc.get_resource(name)).await {
        Ok(Ok(text)) => (StatusCode::OK, text).into_response(),
        Ok(Err(err)) => error_response(err),
        Err(err) => task_panic_response(err),
    }
}

/// Push the request body through a fresh pooler and stream the formatted
/// results back.
async fn run_query(state: AppState, endpoint: ApiEndpoint, body: Bytes) -> Response {
    let qproc = state.qproc.clone();
    let started = tokio::task::spawn_blocking(move || -> Result<QueryResultsPooler, QueryError> {
        let mut pooler = qproc.create(endpoint)?;
        pooler.append(&body)?;
        pooler.start()?;
        Ok(pooler)
    })
    .await;
    let mut pooler = match started {
        Ok(Ok(pooler)) => pooler,
        Ok(Err(err)) => return error_response(err),
        Err(err) => return task_panic_response(err),
    };

    let content_type = pooler
        .formatter()
        .map(|f| f.content_type())
        .unwrap_or("text/plain");
    let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(RESPONSE_CHANNEL_DEPTH);
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; RESPONSE_CHUNK_SIZE];
        loop {
            match pooler.read_some(&mut buf) {
                Ok((n, complete)) => {
                    if n > 0 && tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break; // client went away
                    }
                    if complete {
                        break;
                    }
                }
                Err(err) => {
                    error!("query failed mid-stream: {}", err);
                    let _ = tx.blocking_send(Ok(Bytes::from(format!("-{}\r\n", err))));
                    break;
                }
            }
        }
        pooler.close();
    });

    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(ReceiverStream::new(rx)),
    )
        .into_response()
}

fn error_response(err: QueryError) -> Response {
    let status = match &err {
        QueryError::Parse(_) | QueryError::NotStarted | QueryError::AlreadyStarted => {
            StatusCode::BAD_REQUEST
        }
        QueryError::ConnectionClosed => StatusCode::SERVICE_UNAVAILABLE,
        QueryError::Formatter | QueryError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, Json(serde_json::json!({"error": err.to_string()}))).into_response()
}

fn task_panic_response(err: tokio::task::JoinError) -> Response {
    error!("query task panicked: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({"error": "internal error"})),
    )
        .into_response()
}
