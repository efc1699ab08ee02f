//! Server configuration.

use std::net::SocketAddr;
use std::time::Duration;

use crate::error::{ServerError, ServerResult};

/// Default drop-rate threshold above which frames are shed.
pub const DEFAULT_DROP_THRESHOLD: f64 = 0.10;

/// Default drop-rate threshold above which a slow-down warning is sent.
pub const DEFAULT_SLOWDOWN_THRESHOLD: f64 = 0.30;

/// Default maximum frame size in megabytes.
pub const DEFAULT_MAX_FRAME_SIZE_MB: usize = 5;

/// Bytes in one megabyte.
pub const BYTES_PER_MB: usize = 1024 * 1024;

/// Default maximum frame size in bytes: 5MB.
pub const DEFAULT_MAX_FRAME_SIZE_BYTES: usize = DEFAULT_MAX_FRAME_SIZE_MB * BYTES_PER_MB;

/// Default nominal client frame rate.
pub const DEFAULT_TARGET_FPS: u32 = 10;

/// Default drop-rate window. Zero measures over the whole session.
pub const DEFAULT_RATE_WINDOW: usize = 0;

/// Largest accepted drop-rate window, in frames.
pub const MAX_RATE_WINDOW: usize = 1024;

/// Recommended number of concurrent sessions. Advisory only.
pub const DEFAULT_MAX_SESSIONS: usize = 10;

/// Default bind address.
pub const DEFAULT_BIND_ADDR: ([u8; 4], u16) = ([0, 0, 0, 0], 8765);

/// Per-session settings, copied into every session at creation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Drop frames while the drop rate exceeds this fraction.
    ///
    /// Every drop raises the rate, so once it is above this threshold it
    /// stays there: with the defaults, one frame slower than
    /// `frame_interval` makes every later frame drop. Set this above the
    /// share of frames a slow pipeline forces out
    /// (`1 - frame_interval / processing_time`) for the session to recover.
    pub drop_threshold: f64,
    /// Warn the client once the drop rate exceeds this fraction.
    pub slowdown_threshold: f64,
    /// Frames larger than this are rejected.
    pub max_frame_size_bytes: usize,
    /// Nominal time between two client frames.
    /// A frame that took longer than this to process causes the next one to be dropped.
    pub frame_interval: Duration,
    /// Number of most recent frames the drop rate is measured over.
    /// Zero means the whole session.
    ///
    /// A window does not release a latched `drop_threshold` by itself:
    /// while every frame is dropped the window fills with drops.
    pub rate_window: usize,
}

impl SessionConfig {
    /// Create a session configuration with default values.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            drop_threshold: DEFAULT_DROP_THRESHOLD,
            slowdown_threshold: DEFAULT_SLOWDOWN_THRESHOLD,
            max_frame_size_bytes: DEFAULT_MAX_FRAME_SIZE_BYTES,
            frame_interval: Duration::from_millis(1000 / DEFAULT_TARGET_FPS as u64),
            rate_window: DEFAULT_RATE_WINDOW,
        }
    }

    /// Set the drop threshold.
    #[must_use]
    pub const fn with_drop_threshold(mut self, threshold: f64) -> Self {
        self.drop_threshold = threshold;
        self
    }

    /// Set the slow-down threshold.
    #[must_use]
    pub const fn with_slowdown_threshold(mut self, threshold: f64) -> Self {
        self.slowdown_threshold = threshold;
        self
    }

    /// Set the maximum frame size in bytes.
    #[must_use]
    pub const fn with_max_frame_size_bytes(mut self, bytes: usize) -> Self {
        self.max_frame_size_bytes = bytes;
        self
    }

    /// Set the maximum frame size in megabytes.
    #[must_use]
    pub const fn with_max_frame_size_mb(mut self, mb: usize) -> Self {
        self.max_frame_size_bytes = mb.saturating_mul(BYTES_PER_MB);
        self
    }

    /// Set the nominal frame interval.
    #[must_use]
    pub const fn with_frame_interval(mut self, interval: Duration) -> Self {
        self.frame_interval = interval;
        self
    }

    /// Derive the nominal frame interval from a target frame rate.
    /// A rate of zero leaves the interval at zero, which `validate` rejects.
    #[must_use]
    pub fn with_target_fps(mut self, fps: u32) -> Self {
        self.frame_interval = Duration::from_secs(1)
            .checked_div(fps)
            .unwrap_or(Duration::ZERO);
        self
    }

    /// Set the drop-rate window.
    #[must_use]
    pub const fn with_rate_window(mut self, frames: usize) -> Self {
        self.rate_window = frames;
        self
    }

    /// Largest message the WebSocket transport will buffer.
    ///
    /// Frames between `max_frame_size_bytes` and this limit reach the
    /// validator and are reported as too large; anything bigger is cut off
    /// by the transport itself.
    #[must_use]
    pub const fn transport_message_limit(&self) -> usize {
        self.max_frame_size_bytes.saturating_mul(2)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if any value is out of range.
    pub fn validate(&self) -> ServerResult<()> {
        if !(0.0..=1.0).contains(&self.drop_threshold) {
            return Err(ServerError::Config(format!(
                "drop threshold must be within [0, 1], got {}",
                self.drop_threshold
            )));
        }

        if !(0.0..=1.0).contains(&self.slowdown_threshold) {
            return Err(ServerError::Config(format!(
                "slow-down threshold must be within [0, 1], got {}",
                self.slowdown_threshold
            )));
        }

        if self.max_frame_size_bytes == 0 {
            return Err(ServerError::Config(
                "max frame size must be greater than zero".to_string(),
            ));
        }

        if self.frame_interval.is_zero() {
            return Err(ServerError::Config(
                "frame interval must be greater than zero".to_string(),
            ));
        }

        if self.rate_window > MAX_RATE_WINDOW {
            return Err(ServerError::Config(format!(
                "drop rate window cannot exceed {MAX_RATE_WINDOW} frames, got {}",
                self.rate_window
            )));
        }

        Ok(())
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Configuration for the streaming server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind the WebSocket server to.
    pub bind_addr: SocketAddr,
    /// Recommended maximum number of concurrent sessions.
    /// Exceeding it is logged, never enforced.
    pub max_sessions: usize,
    /// Time allowed for the WebSocket handshake.
    pub handshake_timeout: Duration,
    /// Capacity of the session monitor's report channel.
    pub monitor_capacity: usize,
    /// Settings applied to each new session.
    pub session: SessionConfig,
}

impl ServerConfig {
    /// Create a new server configuration with the specified bind address.
    #[must_use]
    pub const fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_sessions: DEFAULT_MAX_SESSIONS,
            handshake_timeout: Duration::from_secs(10),
            monitor_capacity: 256,
            session: SessionConfig::new(),
        }
    }

    /// Set the session configuration.
    #[must_use]
    pub const fn with_session_config(mut self, config: SessionConfig) -> Self {
        self.session = config;
        self
    }

    /// Set the recommended maximum number of sessions.
    #[must_use]
    pub const fn with_max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max;
        self
    }

    /// Set the handshake timeout.
    #[must_use]
    pub const fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the monitor channel capacity.
    #[must_use]
    pub const fn with_monitor_capacity(mut self, capacity: usize) -> Self {
        self.monitor_capacity = capacity;
        self
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Config` if any value is out of range.
    pub fn validate(&self) -> ServerResult<()> {
        if self.handshake_timeout.is_zero() {
            return Err(ServerError::Config(
                "handshake timeout must be greater than zero".to_string(),
            ));
        }

        if self.monitor_capacity == 0 {
            return Err(ServerError::Config(
                "monitor capacity must be greater than zero".to_string(),
            ));
        }

        self.session.validate()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new(DEFAULT_BIND_ADDR.into())
    }
}
