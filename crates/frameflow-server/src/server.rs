//! WebSocket streaming server implementation.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use frameflow_proto::{ErrorCode, ServerMessage};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{header, StatusCode, Uri};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::form_urlencoded;

use crate::config::{ServerConfig, SessionConfig};
use crate::error::{ServerError, ServerResult};
use crate::handler::{run_session, SessionContext};
use crate::monitor::{MonitorWorker, SessionMonitor};
use crate::pipeline::{PipelineCatalog, PipelineExecutor, PipelineRegistry};
use crate::session::Session;

/// Query parameter that selects the pipeline for a connection.
pub const PIPELINE_QUERY_PARAM: &str = "pipeline_id";

/// How long `serve` waits for open sessions after shutdown is requested.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Streaming inference server.
///
/// Each accepted connection selects a pipeline during the upgrade request and
/// then runs its own frame loop. Sessions share nothing but the executor and
/// the monitor.
pub struct StreamServer {
    /// Server configuration.
    config: Arc<ServerConfig>,
    /// Known pipeline identifiers.
    catalog: Arc<dyn PipelineCatalog>,
    /// Runs frames for every session.
    executor: Arc<dyn PipelineExecutor>,
    /// Read side of the session monitor.
    monitor: SessionMonitor,
    /// Folding task, started by the first call to `serve`.
    monitor_worker: Mutex<Option<MonitorWorker>>,
    /// Cancelled to stop accepting and close every session.
    shutdown: CancellationToken,
    /// Server start time (for uptime calculation).
    start_time: Instant,
}

impl std::fmt::Debug for StreamServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamServer")
            .field("config", &self.config)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl StreamServer {
    /// Create a server with a separate catalog and executor.
    #[must_use]
    pub fn new(
        config: ServerConfig,
        catalog: Arc<dyn PipelineCatalog>,
        executor: Arc<dyn PipelineExecutor>,
    ) -> Self {
        let (monitor, worker) = SessionMonitor::new(config.monitor_capacity);
        Self {
            config: Arc::new(config),
            catalog,
            executor,
            monitor,
            monitor_worker: Mutex::new(Some(worker)),
            shutdown: CancellationToken::new(),
            start_time: Instant::now(),
        }
    }

    /// Create a server backed by one registry acting as catalog and executor.
    #[must_use]
    pub fn with_registry(config: ServerConfig, registry: PipelineRegistry) -> Self {
        let registry = Arc::new(registry);
        Self::new(config, registry.clone(), registry)
    }

    /// Get the server configuration.
    #[must_use]
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get the session monitor.
    #[must_use]
    pub fn monitor(&self) -> &SessionMonitor {
        &self.monitor
    }

    /// Token that is cancelled when the server shuts down.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Time since the server was created.
    #[must_use]
    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Stop accepting connections and close every open session.
    pub fn shutdown(&self) {
        info!("Shutdown requested");
        self.shutdown.cancel();
    }

    /// Bind the configured address.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::BindFailed` if the address cannot be bound.
    pub async fn bind(&self) -> ServerResult<TcpListener> {
        let addr = self.config.bind_addr;
        TcpListener::bind(addr)
            .await
            .map_err(|e| ServerError::BindFailed(addr, e))
    }

    /// Bind the configured address and serve until shut down.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn run(&self) -> ServerResult<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shut down.
    ///
    /// Open sessions are given a short grace period to close after the
    /// shutdown signal.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address.
    pub async fn serve(&self, listener: TcpListener) -> ServerResult<()> {
        let addr = listener
            .local_addr()
            .map_err(|e| ServerError::Internal(format!("listener has no address: {e}")))?;
        self.start_monitor();

        info!(addr = %addr, "Streaming server listening");

        let tracker = TaskTracker::new();
        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            tracker.spawn(self.handle_connection(stream, peer));
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                () = self.shutdown.cancelled() => {
                    info!("Shutdown signal received");
                    break;
                }
            }
        }

        tracker.close();
        if tokio::time::timeout(DRAIN_TIMEOUT, tracker.wait()).await.is_err() {
            warn!(remaining = tracker.len(), "Sessions still open after drain timeout");
        }

        info!(uptime_secs = self.uptime().as_secs(), "Streaming server stopped");
        Ok(())
    }

    fn start_monitor(&self) {
        let worker = match self.monitor_worker.lock() {
            Ok(mut slot) => slot.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(worker) = worker {
            tokio::spawn(worker.run());
        }
    }

    /// Build the future that upgrades and serves one TCP connection.
    fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> impl std::future::Future<Output = ()> + Send + 'static {
        let config = self.config.clone();
        let catalog = self.catalog.clone();
        let ctx = SessionContext {
            executor: self.executor.clone(),
            monitor: self.monitor.handle(),
            shutdown: self.shutdown.child_token(),
        };
        let monitor = self.monitor.clone();

        async move {
            debug!(peer = %peer, "New connection");

            let (ws, pipeline_id) = match upgrade(stream, &config, catalog.as_ref()).await {
                Ok(upgraded) => upgraded,
                Err(e) => {
                    warn!(peer = %peer, error = %e, "WebSocket upgrade failed");
                    return;
                }
            };
            info!(peer = %peer, pipeline_id = %pipeline_id, "WebSocket connection established");

            let active = monitor.active_count().await;
            if active >= config.max_sessions {
                warn!(
                    peer = %peer,
                    active,
                    recommended = config.max_sessions,
                    "Session count above recommended maximum"
                );
            }

            let session = Session::new(pipeline_id, config.session);
            let summary = run_session(ws, session, ctx).await;
            debug!(
                peer = %peer,
                session_id = %summary.stats.session_id,
                reason = ?summary.reason,
                "Connection finished"
            );
        }
    }
}

/// Perform the WebSocket upgrade, checking the requested pipeline against
/// the catalog before the handshake completes.
///
/// Rejected pipelines, malformed requests and handshakes that outlive
/// `handshake_timeout` all surface as [`ServerError::Handshake`].
async fn upgrade<S>(
    stream: S,
    config: &ServerConfig,
    catalog: &dyn PipelineCatalog,
) -> ServerResult<(WebSocketStream<S>, String)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut selected: Option<String> = None;
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        match pipeline_from_uri(request.uri()) {
            Some(id) if catalog.is_valid_pipeline(&id) => {
                selected = Some(id);
                Ok(response)
            }
            requested => Err(reject_response(requested.as_deref())),
        }
    };

    let handshake = accept_hdr_async_with_config(
        stream,
        callback,
        Some(websocket_config(&config.session)),
    );

    let ws = tokio::time::timeout(config.handshake_timeout, handshake)
        .await
        .map_err(|_| ServerError::Handshake("timed out".to_string()))?
        .map_err(|e| ServerError::Handshake(e.to_string()))?;

    let pipeline_id =
        selected.ok_or_else(|| ServerError::Handshake("no pipeline selected".to_string()))?;
    Ok((ws, pipeline_id))
}

/// Transport limits for a session.
///
/// Messages up to twice the frame limit are buffered so an oversized frame
/// can still be reported as `frame_too_large`.
#[must_use]
#[allow(clippy::field_reassign_with_default)]
pub fn websocket_config(session: &SessionConfig) -> WebSocketConfig {
    let limit = session.transport_message_limit();
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(limit);
    config.max_frame_size = Some(limit);
    config
}

/// Extract the `pipeline_id` query parameter from an upgrade request URI.
///
/// Returns `None` when the parameter is missing or empty.
#[must_use]
pub fn pipeline_from_uri(uri: &Uri) -> Option<String> {
    uri.query().and_then(pipeline_from_query)
}

/// Extract the `pipeline_id` parameter from a raw query string.
///
/// Values are percent-decoded, so `jpeg%5Finfo` selects `jpeg_info`.
#[must_use]
pub fn pipeline_from_query(query: &str) -> Option<String> {
    form_urlencoded::parse(query.as_bytes())
        .find(|(key, _)| key == PIPELINE_QUERY_PARAM)
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}

/// HTTP 400 response with an `invalid_pipeline` body.
#[must_use]
pub fn reject_response(requested: Option<&str>) -> ErrorResponse {
    let detail = match requested {
        Some(id) => {
            warn!(pipeline_id = %id, "Rejected connection: unknown pipeline");
            format!("unknown pipeline: {id}")
        }
        None => {
            warn!("Rejected connection: no pipeline requested");
            format!("missing {PIPELINE_QUERY_PARAM} query parameter")
        }
    };

    let body = ServerMessage::error(ErrorCode::InvalidPipeline, detail)
        .to_json()
        .unwrap_or_else(|_| r#"{"error":"invalid_pipeline"}"#.to_string());

    let mut response = ErrorResponse::new(Some(body));
    *response.status_mut() = StatusCode::BAD_REQUEST;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("application/json"),
    );
    response
}
