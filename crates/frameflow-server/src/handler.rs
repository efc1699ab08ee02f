//! Per-connection frame loop.
//!
//! One handler task owns one [`Session`] and one WebSocket. Each inbound
//! binary message is validated, checked against the backpressure policy and
//! then either dropped or run through the pipeline executor. Frames are
//! handled strictly in arrival order and never queued.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use frameflow_proto::{ErrorCode, ServerMessage};
use futures::{FutureExt, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backpressure::{self, Decision};
use crate::error::{ServerError, ServerResult};
use crate::monitor::MonitorHandle;
use crate::pipeline::{PipelineError, PipelineExecutor, PipelineOutput};
use crate::session::{CloseReason, Session, SessionStats};
use crate::validator::FrameValidator;

/// Detail sent with `internal_error`; the real cause only goes to the log.
pub const INTERNAL_ERROR_DETAIL: &str = "internal server error";

/// Shared collaborators handed to every connection handler.
#[derive(Clone)]
pub struct SessionContext {
    /// Runs frames through pipelines.
    pub executor: Arc<dyn PipelineExecutor>,
    /// Where the handler reports its counters.
    pub monitor: MonitorHandle,
    /// Cancelled when the server shuts down.
    pub shutdown: CancellationToken,
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("monitor", &self.monitor)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSummary {
    /// Why it ended.
    pub reason: CloseReason,
    /// Final counters.
    pub stats: SessionStats,
}

/// A read from the socket, sorted by what the frame loop does with it.
#[derive(Debug)]
enum Inbound {
    Frame(Vec<u8>),
    Text,
    Control,
    TooLarge(String),
    Closed,
    ReadFailed(String),
}

impl Inbound {
    fn classify(msg: Option<Result<WsMessage, WsError>>) -> Self {
        match msg {
            None | Some(Ok(WsMessage::Close(_))) => Self::Closed,
            Some(Ok(WsMessage::Binary(data))) => Self::Frame(data),
            Some(Ok(WsMessage::Text(_))) => Self::Text,
            Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                Self::Control
            }
            Some(Err(WsError::Capacity(e))) => Self::TooLarge(e.to_string()),
            // Text payloads are decoded by the transport.
            Some(Err(WsError::Utf8)) => Self::Text,
            Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => Self::Closed,
            Some(Err(e)) => Self::ReadFailed(e.to_string()),
        }
    }

    const fn ends_session(&self) -> bool {
        matches!(self, Self::Closed | Self::ReadFailed(_))
    }
}

/// What the loop does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close(CloseReason),
}

/// Outcome of awaiting the executor.
enum Execution {
    Done(Result<PipelineOutput, PipelineError>),
    Cancelled(CloseReason),
}

/// Run the frame loop for one connection until it closes.
///
/// The session must already be `Active`; it is consumed and released when
/// the function returns.
pub async fn run_session<S>(ws: S, session: Session, ctx: SessionContext) -> SessionSummary
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage> + Unpin + Send,
    <S as Sink<WsMessage>>::Error: fmt::Display,
{
    let validator = FrameValidator::new(session.config().max_frame_size_bytes);
    let mut handler = ConnectionHandler {
        ws,
        session,
        validator,
        ctx,
        lookahead: None,
    };
    handler.run().await
}

struct ConnectionHandler<S> {
    ws: S,
    session: Session,
    validator: FrameValidator,
    ctx: SessionContext,
    /// At most one message read while a frame was in the pipeline.
    lookahead: Option<Inbound>,
}

impl<S> ConnectionHandler<S>
where
    S: Stream<Item = Result<WsMessage, WsError>> + Sink<WsMessage> + Unpin + Send,
    <S as Sink<WsMessage>>::Error: fmt::Display,
{
    async fn run(&mut self) -> SessionSummary {
        let session_id = self.session.id();
        info!(
            session_id = %session_id,
            pipeline = %self.session.pipeline_id(),
            "Session active"
        );
        self.ctx.monitor.opened(self.session.stats()).await;

        let reason = loop {
            let outcome = AssertUnwindSafe(self.step()).catch_unwind().await;
            match outcome {
                Ok(Ok(Flow::Continue)) => {}
                Ok(Ok(Flow::Close(reason))) => break reason,
                Ok(Err(ServerError::ConnectionClosed | ServerError::WebSocket(_))) => {
                    debug!(session_id = %session_id, "Peer went away while sending");
                    break CloseReason::PeerDisconnected;
                }
                Ok(Err(e)) => {
                    error!(
                        session_id = %session_id,
                        pipeline = %self.session.pipeline_id(),
                        frame_index = self.session.frame_index(),
                        error = %e,
                        category = ?ErrorCode::InternalError.category(),
                        "Internal error in frame loop"
                    );
                    self.send_internal_error().await;
                    break CloseReason::InternalError;
                }
                Err(panic) => {
                    error!(
                        session_id = %session_id,
                        pipeline = %self.session.pipeline_id(),
                        frame_index = self.session.frame_index(),
                        panic = %panic_message(panic.as_ref()),
                        category = ?ErrorCode::InternalError.category(),
                        "Panic in frame loop"
                    );
                    self.send_internal_error().await;
                    break CloseReason::InternalError;
                }
            }
        };

        self.close(reason).await
    }

    async fn close(&mut self, reason: CloseReason) -> SessionSummary {
        self.session.begin_closing();
        self.lookahead = None;

        // A peer-initiated close only needs the queued reply flushed.
        let result = if reason == CloseReason::PeerDisconnected {
            self.ws.flush().await
        } else {
            self.ws.close().await
        };
        if let Err(e) = result {
            debug!(session_id = %self.session.id(), error = %e, "Close handshake failed");
        }

        self.session.mark_closed();
        let stats = self.session.stats();
        info!(
            session_id = %stats.session_id,
            pipeline = %stats.pipeline_id,
            frames = stats.frame_index,
            dropped = stats.dropped_frames,
            ?reason,
            "Session closed"
        );
        self.ctx.monitor.closed(stats.clone(), reason).await;

        SessionSummary { reason, stats }
    }

    async fn next_inbound(&mut self) -> Inbound {
        if let Some(inbound) = self.lookahead.take() {
            return inbound;
        }
        tokio::select! {
            msg = self.ws.next() => Inbound::classify(msg),
            () = self.ctx.shutdown.cancelled() => Inbound::Closed,
        }
    }

    async fn step(&mut self) -> ServerResult<Flow> {
        if self.ctx.shutdown.is_cancelled() {
            return Ok(Flow::Close(CloseReason::ServerShutdown));
        }

        let frame = match self.next_inbound().await {
            Inbound::Frame(frame) => frame,
            Inbound::Control => return Ok(Flow::Continue),
            Inbound::Text => {
                return self
                    .reject(ErrorCode::InvalidMessage, "expected a binary frame")
                    .await;
            }
            Inbound::TooLarge(detail) => {
                return self.reject(ErrorCode::FrameTooLarge, detail).await;
            }
            Inbound::Closed => {
                let reason = if self.ctx.shutdown.is_cancelled() {
                    CloseReason::ServerShutdown
                } else {
                    CloseReason::PeerDisconnected
                };
                return Ok(Flow::Close(reason));
            }
            Inbound::ReadFailed(e) => {
                debug!(session_id = %self.session.id(), error = %e, "WebSocket read error");
                return Ok(Flow::Close(CloseReason::PeerDisconnected));
            }
        };

        if let Err(e) = self.validator.validate(&frame) {
            let code = e.code;
            self.log_violation(code, &e.detail);
            self.send(&e.into_message()).await?;
            return Ok(Flow::Close(CloseReason::ProtocolViolation(code)));
        }

        match backpressure::evaluate(&self.session) {
            Decision::Drop(cause) => {
                let frame_index = self.session.record_drop();
                debug!(
                    session_id = %self.session.id(),
                    frame_index,
                    ?cause,
                    drop_rate = self.session.measured_drop_rate(),
                    "Dropped frame"
                );
                self.send(&ServerMessage::dropped(frame_index)).await?;
            }
            Decision::Accept => {
                let frame_index = self.session.accept_frame();
                let started = Instant::now();

                let result = match self.execute(frame_index, frame).await {
                    Execution::Done(result) => result,
                    Execution::Cancelled(reason) => {
                        debug!(
                            session_id = %self.session.id(),
                            frame_index,
                            ?reason,
                            "Cancelled in-flight frame"
                        );
                        return Ok(Flow::Close(reason));
                    }
                };
                self.session.record_processed(started.elapsed());

                match result {
                    Ok(output) => {
                        self.send(&ServerMessage::result(frame_index, output)).await?;
                    }
                    Err(e) if e.is_unexpected() => {
                        return Err(ServerError::Internal(e.to_string()));
                    }
                    Err(e) => {
                        warn!(
                            session_id = %self.session.id(),
                            frame_index,
                            error = %e,
                            category = ?ErrorCode::PipelineFailure.category(),
                            "Pipeline failure"
                        );
                        self.send(&ServerMessage::error(ErrorCode::PipelineFailure, e.to_string()))
                            .await?;
                        return Ok(Flow::Close(CloseReason::PipelineFailure));
                    }
                }
            }
        }

        self.update_slow_down().await?;
        self.ctx.monitor.progress(self.session.stats());
        Ok(Flow::Continue)
    }

    /// Await the executor while watching the socket for a disconnect.
    ///
    /// The socket is polled for at most one message; anything other than a
    /// close is parked in `lookahead` and the socket is left alone until the
    /// frame loop consumes it.
    async fn execute(&mut self, frame_index: u64, frame: Vec<u8>) -> Execution {
        let executor = self.ctx.executor.clone();
        let pipeline_id = self.session.pipeline_id().to_string();
        let mut run = executor.run(&pipeline_id, frame_index, Arc::from(frame));

        loop {
            let watch_socket = self.lookahead.is_none();
            tokio::select! {
                result = &mut run => return Execution::Done(result),
                () = self.ctx.shutdown.cancelled() => {
                    return Execution::Cancelled(CloseReason::ServerShutdown);
                }
                msg = self.ws.next(), if watch_socket => {
                    match Inbound::classify(msg) {
                        inbound if inbound.ends_session() => {
                            return Execution::Cancelled(CloseReason::PeerDisconnected);
                        }
                        Inbound::Control => {}
                        inbound => self.lookahead = Some(inbound),
                    }
                }
            }
        }
    }

    async fn update_slow_down(&mut self) -> ServerResult<()> {
        if backpressure::should_warn_slow_down(&self.session) {
            info!(
                session_id = %self.session.id(),
                drop_rate = self.session.measured_drop_rate(),
                "Asking client to slow down"
            );
            self.send(&ServerMessage::slow_down()).await?;
            self.session.set_slow_down_sent(true);
        } else if backpressure::should_reset_slow_down(&self.session) {
            debug!(session_id = %self.session.id(), "Drop rate recovered");
            self.session.set_slow_down_sent(false);
        }
        Ok(())
    }

    async fn reject(&mut self, code: ErrorCode, detail: impl Into<String>) -> ServerResult<Flow> {
        let detail = detail.into();
        self.log_violation(code, &detail);
        self.send(&ServerMessage::error(code, detail)).await?;
        Ok(Flow::Close(CloseReason::ProtocolViolation(code)))
    }

    fn log_violation(&self, code: ErrorCode, detail: &str) {
        warn!(
            session_id = %self.session.id(),
            code = %code,
            category = ?code.category(),
            detail = %detail,
            "Closing session on protocol violation"
        );
    }

    async fn send_internal_error(&mut self) {
        let msg = ServerMessage::error(ErrorCode::InternalError, INTERNAL_ERROR_DETAIL);
        if let Err(e) = self.send(&msg).await {
            debug!(session_id = %self.session.id(), error = %e, "Failed to report internal error");
        }
    }

    async fn send(&mut self, msg: &ServerMessage) -> ServerResult<()> {
        let json = msg.to_json()?;
        self.ws
            .send(WsMessage::Text(json))
            .await
            .map_err(|e| ServerError::WebSocket(e.to_string()))
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}
