//! Test helpers for E2E tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use frameflow_proto::ServerMessage;
use frameflow_server::{
    builtin_registry, Pipeline, PipelineError, PipelineOutput, ServerConfig, SessionConfig,
    SessionMonitor, StreamServer,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Default test timeout.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Processing time of the `slow` test pipeline; above the default 100ms
/// frame interval.
pub const SLOW_PIPELINE_DELAY: Duration = Duration::from_millis(150);

/// Pipeline that rejects every frame.
#[derive(Debug)]
pub struct AlwaysFails;

impl Pipeline for AlwaysFails {
    fn name(&self) -> &str {
        "always_fails"
    }

    fn process(&self, _frame_index: u64, _frame: &[u8]) -> Result<PipelineOutput, PipelineError> {
        Err(PipelineError::failed("always_fails", "model not loaded"))
    }
}

/// Pipeline that takes longer than one frame interval.
#[derive(Debug)]
pub struct Slow;

impl Pipeline for Slow {
    fn name(&self) -> &str {
        "slow"
    }

    fn process(&self, frame_index: u64, frame: &[u8]) -> Result<PipelineOutput, PipelineError> {
        std::thread::sleep(SLOW_PIPELINE_DELAY);
        Ok(json!({"frame_index": frame_index, "bytes": frame.len()}))
    }
}

/// Test server that manages its own lifecycle.
pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<StreamServer>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    /// Start a server with default session settings on an available port.
    pub async fn start() -> Self {
        Self::start_with(SessionConfig::new()).await
    }

    /// Start a server with custom session settings on an available port.
    pub async fn start_with(session: SessionConfig) -> Self {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let config = ServerConfig::new(addr).with_session_config(session);
        let registry = builtin_registry()
            .with_pipeline(AlwaysFails)
            .with_pipeline(Slow);

        let server = Arc::new(StreamServer::with_registry(config, registry));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_clone = server.clone();
        let handle = tokio::spawn(async move {
            if let Err(e) = server_clone.serve(listener).await {
                eprintln!("Server error: {e}");
            }
        });

        Self {
            addr,
            server,
            handle: Some(handle),
        }
    }

    /// WebSocket URL selecting `pipeline`.
    pub fn url(&self, pipeline: &str) -> String {
        format!("ws://{}/stream?pipeline_id={}", self.addr, pipeline)
    }

    /// WebSocket URL without a pipeline parameter.
    pub fn bare_url(&self) -> String {
        format!("ws://{}/stream", self.addr)
    }

    pub fn monitor(&self) -> &SessionMonitor {
        self.server.monitor()
    }

    /// Poll the monitor until `expected` sessions are active.
    pub async fn wait_for_active(&self, expected: usize) -> bool {
        for _ in 0..100 {
            if self.monitor().active_count().await == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Poll the monitor until `expected` sessions have closed.
    pub async fn wait_for_closed(&self, expected: u64) -> bool {
        for _ in 0..100 {
            if self.monitor().snapshot().await.total_closed == expected {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    /// Shut the server down and wait for the accept loop to finish.
    pub async fn shutdown(mut self) {
        self.server.shutdown();
        if let Some(handle) = self.handle.take() {
            let _ = timeout(Duration::from_secs(10), handle).await;
        }
    }
}

/// Streaming client for testing.
pub struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect to `url`, returning the raw handshake error on rejection.
    pub async fn connect(url: &str) -> Result<Self, WsError> {
        let (ws, _) = connect_async(url).await?;
        Ok(Self { ws })
    }

    /// Send a binary frame.
    pub async fn send_frame(&mut self, frame: Vec<u8>) {
        self.ws.send(WsMessage::Binary(frame)).await.unwrap();
    }

    /// Send a text message.
    pub async fn send_text(&mut self, text: &str) {
        self.ws.send(WsMessage::Text(text.to_string())).await.unwrap();
    }

    /// Receive the next server message. Returns `None` once the server has
    /// closed the connection.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            let msg = timeout(TEST_TIMEOUT, self.ws.next())
                .await
                .expect("timed out waiting for server message");
            match msg {
                Some(Ok(WsMessage::Text(text))) => {
                    return Some(ServerMessage::from_json(&text).unwrap());
                }
                Some(Ok(WsMessage::Close(_)) | Err(_)) | None => return None,
                Some(Ok(_)) => {}
            }
        }
    }

    /// Send a frame and wait for its response.
    pub async fn request(&mut self, frame: Vec<u8>) -> ServerMessage {
        self.send_frame(frame).await;
        self.recv().await.expect("connection closed before a response")
    }

    /// Wait until the server ends the connection, discarding any messages.
    pub async fn expect_closed(&mut self) {
        while self.recv().await.is_some() {}
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}

/// A frame of `len` bytes with valid JPEG markers.
pub fn jpeg(len: usize) -> Vec<u8> {
    assert!(len >= 4);
    let mut data = vec![0u8; len];
    data[0] = 0xFF;
    data[1] = 0xD8;
    data[len - 2] = 0xFF;
    data[len - 1] = 0xD9;
    data
}

/// A JPEG with a 640x480 three-component start-of-frame segment.
pub fn jpeg_640x480() -> Vec<u8> {
    let mut data = vec![0xFF, 0xD8];
    data.extend_from_slice(&[
        0xFF, 0xC0, 0x00, 0x11, 0x08, 0x01, 0xE0, 0x02, 0x80, 0x03, 0x01, 0x22, 0x00, 0x02, 0x11,
        0x01, 0x03, 0x11, 0x01,
    ]);
    data.extend_from_slice(&[0xFF, 0xD9]);
    data
}
