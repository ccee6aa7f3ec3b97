//! HTTP API Server
//!
//! Git smart-HTTP endpoints backed by the replica node set, plus status and
//! admin routes.

use std::io;
use std::sync::Arc;
use async_compression::tokio::bufread::GzipDecoder;
use axum::{
    body::Body,
    extract::{Query, State},
    http::{header, HeaderMap, HeaderValue},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::{ReaderStream, StreamReader};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::protocol::{advertisement_header, valid_git_protocol, GitService};
use crate::config::{GitScaleConfig, ResyncTrigger};
use crate::executor::{BoxedReader, BoxedWriter, Invocation, RepositoryExecutor, RunIo};
use crate::replication::{ReplicationHandle, ReplicationReport, Replicator, Resyncer};
use crate::state::{MarkerStore, ReplicaNode};
use crate::error::{Error, Result};

/// Buffer between an executor's stdout and the response body
const OUTPUT_PIPE_CAPACITY: usize = 64 * 1024;
/// Response chunks queued from node output before forwarders wait
const OUTPUT_QUEUE: usize = 32;

/// Shared application state
pub struct AppState {
    pub config: GitScaleConfig,
    /// Replica node set, fixed for the process lifetime
    pub nodes: Vec<ReplicaNode>,
    pub executor: Arc<dyn RepositoryExecutor>,
    pub markers: MarkerStore,
    pub resyncer: Resyncer,
    pub replicator: Replicator,
}

impl AppState {
    pub fn new(config: GitScaleConfig, executor: Arc<dyn RepositoryExecutor>) -> Self {
        let nodes = config.nodes();
        let markers = MarkerStore::new();
        let resyncer = Resyncer::new(Arc::clone(&executor), markers.clone(), config.resync_timeout())
            .with_reconcile(config.resync.reconcile);
        let replicator = Replicator::new(nodes.clone(), Arc::clone(&executor), markers.clone());

        Self {
            config,
            nodes,
            executor,
            markers,
            resyncer,
            replicator,
        }
    }

    /// Reject services switched off in configuration
    fn allow(&self, service: GitService) -> Result<()> {
        let enabled = match service {
            GitService::UploadPack => self.config.services.upload_pack,
            GitService::ReceivePack => self.config.services.receive_pack,
        };
        if enabled {
            Ok(())
        } else {
            Err(Error::ServiceNotAllowed(service.name()))
        }
    }

    /// Environment for one executor invocation of `service`
    fn executor_env(&self, service: GitService, headers: &HeaderMap) -> Vec<(String, String)> {
        let mut env = self.config.extra_env();
        // Lets pre-receive and post-receive hooks run
        env.push(("SSH_ORIGINAL_COMMAND".to_string(), service.short_name().to_string()));

        if let Some(protocol) = headers.get("git-protocol").and_then(|v| v.to_str().ok()) {
            if valid_git_protocol(protocol) {
                env.push(("GIT_PROTOCOL".to_string(), protocol.to_string()));
            } else {
                tracing::debug!("Dropping invalid Git-Protocol header {:?}", protocol);
            }
        }
        env
    }
}

/// HTTP API server
pub struct HttpServer {
    bind_address: String,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(config: GitScaleConfig, executor: Arc<dyn RepositoryExecutor>) -> Self {
        let bind_address = config.server.bind_address.clone();
        Self {
            bind_address,
            state: Arc::new(AppState::new(config, executor)),
        }
    }

    /// Start the HTTP server, returning after Ctrl+C
    pub async fn start(&self) -> Result<()> {
        let app = router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(&self.bind_address).await?;
        tracing::info!(
            nodes = self.state.nodes.len(),
            "HTTP API listening on {}",
            self.bind_address
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        tracing::info!("HTTP API stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}

/// Create the router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Git smart HTTP
        .route("/info/refs", get(handle_info_refs))
        .route("/git-upload-pack", post(handle_upload_pack))
        .route("/git-receive-pack", post(handle_receive_pack))
        // Status and admin
        .route("/status", get(handle_status))
        .route("/nodes", get(handle_nodes))
        .route("/admin/resync", post(handle_resync))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self);
        } else {
            tracing::warn!("Request rejected: {}", self);
        }
        (status, self.to_string()).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct InfoRefsQuery {
    service: Option<String>,
}

// ============ Handlers ============

async fn handle_status() -> &'static str {
    "OK"
}

async fn handle_nodes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.markers.snapshot(&state.nodes).await)
}

async fn handle_resync(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let reports = state.resyncer.resync_all(&state.nodes).await;
    let healed = reports.iter().filter(|r| r.outcome.is_healed()).count();
    tracing::info!("Healing pass finished: {} of {} nodes healed", healed, reports.len());
    Json(reports)
}

async fn handle_info_refs(
    State(state): State<Arc<AppState>>,
    Query(query): Query<InfoRefsQuery>,
    headers: HeaderMap,
) -> Result<Response> {
    let service = GitService::from_query(query.service.as_deref().unwrap_or_default())?;
    state.allow(service)?;

    if state.config.resync_on(ResyncTrigger::Advertise) {
        state.resyncer.resync(&state.config.resync_node()).await;
    }

    let node = state.config.advertise_node();
    let invocation = Invocation::new(node.path())
        .args([service.short_name(), "--stateless-rpc", "--advertise-refs", "."])
        .envs(state.executor_env(service, &headers));
    let refs = state.executor.output(invocation).await?;

    let mut body = advertisement_header(service);
    body.extend_from_slice(&refs);

    let mut response = ([(header::CONTENT_TYPE, service.advertisement_content_type())], body)
        .into_response();
    let response_headers = response.headers_mut();
    response_headers.insert(header::EXPIRES, HeaderValue::from_static("Fri, 01 Jan 1980 00:00:00 GMT"));
    response_headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
    response_headers.insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, max-age=0, must-revalidate"),
    );
    Ok(response)
}

async fn handle_upload_pack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let service = GitService::UploadPack;
    let input = accept_request(&state, service, &headers, body).await?;

    let node = state.config.upload_node();
    if state.config.resync_on(ResyncTrigger::UploadPack) {
        state.resyncer.resync(&node).await;
    }

    let invocation = rpc_invocation(&node, service, state.executor_env(service, &headers));
    let (writer, reader) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
    let executor = Arc::clone(&state.executor);
    tokio::spawn(async move {
        if let Err(e) = executor.run(invocation, RunIo::new(input, Box::new(writer))).await {
            tracing::error!(node = %node, "Fail to serve upload-pack: {}", e);
        }
    });

    Ok((
        [(header::CONTENT_TYPE, service.result_content_type())],
        Body::from_stream(ReaderStream::new(reader)),
    )
        .into_response())
}

async fn handle_receive_pack(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Body,
) -> Result<Response> {
    let service = GitService::ReceivePack;
    let input = accept_request(&state, service, &headers, body).await?;

    if state.config.resync_on(ResyncTrigger::ReceivePack) {
        state.resyncer.resync_all(&state.nodes).await;
    }

    let env = state.executor_env(service, &headers);
    let (output_tx, mut output_rx) = mpsc::channel::<Bytes>(OUTPUT_QUEUE);
    let cancel = CancellationToken::new();

    let mut handle = state.replicator.spawn(
        input,
        |node| rpc_invocation(node, service, env.clone()),
        |node| forward_output(node, output_tx.clone()),
        cancel.clone(),
    );

    // The status line can only report an inbound failure until the first
    // node output has been streamed.
    let first_chunk = tokio::select! {
        biased;
        inbound = handle.inbound_done() => {
            if let Some(err) = inbound.and_then(|outcome| outcome.to_error()) {
                drop(output_rx);
                tokio::spawn(async move { log_report(handle.finish().await) });
                return Err(err);
            }
            None
        }
        chunk = output_rx.recv() => chunk,
    };

    // Holding a sender keeps the body open until the report is complete.
    let keepalive = output_tx;
    tokio::spawn(finish_replication(handle, keepalive, cancel));

    let chunks = futures::stream::iter(first_chunk).chain(ReceiverStream::new(output_rx));
    Ok((
        [(header::CONTENT_TYPE, service.result_content_type())],
        Body::from_stream(chunks.map(Ok::<_, std::convert::Infallible>)),
    )
        .into_response())
}

// ============ Helpers ============

/// Check the service and content type, then open the (possibly gzipped) body
async fn accept_request(
    state: &AppState,
    service: GitService,
    headers: &HeaderMap,
    body: Body,
) -> Result<BoxedReader> {
    let content_type = headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    service.check_request_content_type(content_type)?;
    state.allow(service)?;

    let stream = body.into_data_stream().map_err(io::Error::other);
    let reader = StreamReader::new(stream);

    let gzipped = headers
        .get(header::CONTENT_ENCODING)
        .is_some_and(|v| v.as_bytes().eq_ignore_ascii_case(b"gzip"));
    if !gzipped {
        return Ok(Box::new(reader));
    }

    // Surface a corrupt gzip header before any executor is started.
    let mut decoded = BufReader::new(GzipDecoder::new(reader));
    decoded
        .fill_buf()
        .await
        .map_err(|e| Error::Decode(format!("gzip: {}", e)))?;
    Ok(Box::new(decoded))
}

fn rpc_invocation(node: &ReplicaNode, service: GitService, env: Vec<(String, String)>) -> Invocation {
    Invocation::new(node.path())
        .args([service.short_name(), "--stateless-rpc", "."])
        .envs(env)
}

/// Writer for one node's stdout whose bytes are queued onto the response
fn forward_output(node: &ReplicaNode, output: mpsc::Sender<Bytes>) -> BoxedWriter {
    let (writer, reader) = tokio::io::duplex(OUTPUT_PIPE_CAPACITY);
    let node = node.clone();

    tokio::spawn(async move {
        let mut chunks = ReaderStream::new(reader);
        while let Some(chunk) = chunks.next().await {
            match chunk {
                Ok(chunk) => {
                    if output.send(chunk).await.is_err() {
                        tracing::debug!(node = %node, "Response closed, discarding node output");
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(node = %node, "Reading node output failed: {}", e);
                    break;
                }
            }
        }
    });

    Box::new(writer)
}

/// Wait for the replicated write while the response streams. A client that
/// goes away stops result collection.
async fn finish_replication(
    handle: ReplicationHandle,
    keepalive: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
) {
    let finish = handle.finish();
    tokio::pin!(finish);

    let report = tokio::select! {
        report = &mut finish => report,
        _ = keepalive.closed() => {
            tracing::warn!("Client disconnected during receive-pack");
            cancel.cancel();
            finish.await
        }
    };
    log_report(report);
}

fn log_report(report: Result<ReplicationReport>) {
    match report {
        Ok(report) => {
            let failed = report.failed_nodes().len();
            if failed == 0 && report.abandoned == 0 {
                tracing::info!(
                    bytes = report.inbound.bytes,
                    "Replicated write to {} nodes",
                    report.results.len()
                );
            } else {
                tracing::warn!(
                    bytes = report.inbound.bytes,
                    failed,
                    marked = report.marked.len(),
                    abandoned = report.abandoned,
                    "Replicated write incomplete"
                );
            }
        }
        Err(e) => tracing::error!("Replication did not finish: {}", e),
    }
}
