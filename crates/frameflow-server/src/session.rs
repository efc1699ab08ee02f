//! Per-connection streaming session state.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use frameflow_proto::ErrorCode;
use serde::Serialize;

use crate::config::SessionConfig;

/// Lifecycle of a streaming session.
///
/// States only ever move forward. `Connecting` covers the handshake, before
/// any [`Session`] exists; a session is created directly in `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Handshake in progress, pipeline not yet validated.
    Connecting,
    /// Frame loop running.
    Active,
    /// Shutting the connection down.
    Closing,
    /// Terminal.
    Closed,
}

impl SessionState {
    /// Check if the session is processing frames.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check if the session reached its terminal state.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason", content = "code")]
pub enum CloseReason {
    /// The client closed the connection or the socket failed.
    PeerDisconnected,
    /// The client broke the protocol.
    ProtocolViolation(ErrorCode),
    /// The pipeline failed on a frame.
    PipelineFailure,
    /// Unexpected server-side error.
    InternalError,
    /// The server is shutting down.
    ServerShutdown,
}

/// Bounded record of the most recent frame outcomes.
#[derive(Debug, Clone)]
struct OutcomeWindow {
    outcomes: VecDeque<bool>,
    capacity: usize,
    dropped: usize,
}

impl OutcomeWindow {
    fn new(capacity: usize) -> Self {
        Self {
            outcomes: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    fn record(&mut self, dropped: bool) {
        if self.outcomes.len() == self.capacity {
            if let Some(true) = self.outcomes.pop_front() {
                self.dropped -= 1;
            }
        }
        self.outcomes.push_back(dropped);
        if dropped {
            self.dropped += 1;
        }
    }

    fn drop_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            0.0
        } else {
            self.dropped as f64 / self.outcomes.len() as f64
        }
    }
}

/// Point-in-time copy of a session's counters.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionStats {
    /// Session identifier.
    pub session_id: uuid::Uuid,
    /// Pipeline the session streams into.
    pub pipeline_id: String,
    /// Frames accepted for processing.
    pub frame_index: u64,
    /// Frames shed under backpressure.
    pub dropped_frames: u64,
    /// Drop rate used for backpressure decisions.
    pub drop_rate: f64,
    /// When the session was created.
    pub connected_at: DateTime<Utc>,
    /// When the last frame finished processing.
    pub last_processed_at: Option<DateTime<Utc>>,
}

/// State for one streaming connection.
///
/// Owned by exactly one connection handler task and never shared, so
/// nothing here is synchronized.
#[derive(Debug)]
pub struct Session {
    id: uuid::Uuid,
    pipeline_id: String,
    state: SessionState,
    frame_index: u64,
    dropped_frames: u64,
    connected_at: DateTime<Utc>,
    last_processed_at: Option<DateTime<Utc>>,
    last_processing_duration: Option<Duration>,
    slow_down_sent: bool,
    config: SessionConfig,
    recent: Option<OutcomeWindow>,
}

impl Session {
    /// Create an active session for an already validated pipeline.
    #[must_use]
    pub fn new(pipeline_id: impl Into<String>, config: SessionConfig) -> Self {
        let recent = (config.rate_window > 0).then(|| OutcomeWindow::new(config.rate_window));
        Self {
            id: uuid::Uuid::new_v4(),
            pipeline_id: pipeline_id.into(),
            state: SessionState::Active,
            frame_index: 0,
            dropped_frames: 0,
            connected_at: Utc::now(),
            last_processed_at: None,
            last_processing_duration: None,
            slow_down_sent: false,
            config,
            recent,
        }
    }

    /// Get the session ID.
    #[must_use]
    pub const fn id(&self) -> uuid::Uuid {
        self.id
    }

    /// Get the pipeline ID.
    #[must_use]
    pub fn pipeline_id(&self) -> &str {
        &self.pipeline_id
    }

    /// Get the current state.
    #[must_use]
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Number of frames accepted for processing.
    #[must_use]
    pub const fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Number of frames dropped under backpressure.
    #[must_use]
    pub const fn dropped_frames(&self) -> u64 {
        self.dropped_frames
    }

    /// Total frames received.
    #[must_use]
    pub const fn frames_received(&self) -> u64 {
        self.frame_index + self.dropped_frames
    }

    /// When the session was created.
    #[must_use]
    pub const fn connected_at(&self) -> DateTime<Utc> {
        self.connected_at
    }

    /// When the last frame finished processing.
    #[must_use]
    pub const fn last_processed_at(&self) -> Option<DateTime<Utc>> {
        self.last_processed_at
    }

    /// How long the previous frame spent in the pipeline.
    /// `None` before the first frame and after a drop.
    #[must_use]
    pub const fn last_processing_duration(&self) -> Option<Duration> {
        self.last_processing_duration
    }

    /// Whether a slow-down warning is outstanding for the current episode.
    #[must_use]
    pub const fn slow_down_sent(&self) -> bool {
        self.slow_down_sent
    }

    /// Settings the session was created with.
    #[must_use]
    pub const fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Fraction of all received frames that were dropped.
    #[must_use]
    pub fn drop_rate(&self) -> f64 {
        let received = self.frames_received();
        if received == 0 {
            0.0
        } else {
            self.dropped_frames as f64 / received as f64
        }
    }

    /// Drop rate the backpressure policy acts on: over the configured window
    /// when one is set, otherwise the whole session.
    #[must_use]
    pub fn measured_drop_rate(&self) -> f64 {
        self.recent
            .as_ref()
            .map_or_else(|| self.drop_rate(), OutcomeWindow::drop_rate)
    }

    /// Accept a frame and return its index.
    pub fn accept_frame(&mut self) -> u64 {
        self.frame_index += 1;
        if let Some(recent) = self.recent.as_mut() {
            recent.record(false);
        }
        self.frame_index
    }

    /// Record that the accepted frame finished processing.
    pub fn record_processed(&mut self, duration: Duration) {
        self.last_processed_at = Some(Utc::now());
        self.last_processing_duration = Some(duration);
    }

    /// Drop a frame and return the index it would have had.
    pub fn record_drop(&mut self) -> u64 {
        self.dropped_frames += 1;
        self.last_processing_duration = None;
        if let Some(recent) = self.recent.as_mut() {
            recent.record(true);
        }
        self.frame_index + 1
    }

    /// Set or clear the slow-down flag.
    pub const fn set_slow_down_sent(&mut self, sent: bool) {
        self.slow_down_sent = sent;
    }

    /// Move to `Closing`. Returns `false` if the session is already past it.
    pub fn begin_closing(&mut self) -> bool {
        self.advance(SessionState::Closing)
    }

    /// Move to `Closed`.
    pub fn mark_closed(&mut self) -> bool {
        self.advance(SessionState::Closed)
    }

    fn advance(&mut self, next: SessionState) -> bool {
        if next > self.state {
            self.state = next;
            true
        } else {
            false
        }
    }

    /// Snapshot the counters.
    #[must_use]
    pub fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            pipeline_id: self.pipeline_id.clone(),
            frame_index: self.frame_index,
            dropped_frames: self.dropped_frames,
            drop_rate: self.measured_drop_rate(),
            connected_at: self.connected_at,
            last_processed_at: self.last_processed_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session() -> Session {
        Session::new("jpeg_info", SessionConfig::new())
    }

    // ==================== SessionState Tests ====================

    #[test]
    fn test_session_state_flags() {
        assert!(!SessionState::Connecting.is_active());
        assert!(SessionState::Active.is_active());
        assert!(!SessionState::Closing.is_active());
        assert!(SessionState::Closed.is_terminal());
        assert!(!SessionState::Closing.is_terminal());
    }

    #[test]
    fn test_session_state_ordering() {
        assert!(SessionState::Connecting < SessionState::Active);
        assert!(SessionState::Active < SessionState::Closing);
        assert!(SessionState::Closing < SessionState::Closed);
    }

    // ==================== Session Construction Tests ====================

    #[test]
    fn test_session_new() {
        let session = session();

        assert_eq!(session.pipeline_id(), "jpeg_info");
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.frame_index(), 0);
        assert_eq!(session.dropped_frames(), 0);
        assert!(session.last_processed_at().is_none());
        assert!(session.last_processing_duration().is_none());
        assert!(!session.slow_down_sent());
    }

    #[test]
    fn test_session_id_is_unique() {
        assert_ne!(session().id(), session().id());
    }

    // ==================== Counter Tests ====================

    #[test]
    fn test_drop_rate_zero_before_frames() {
        assert!(session().drop_rate().abs() < f64::EPSILON);
        assert!(session().measured_drop_rate().abs() < f64::EPSILON);
    }

    #[test]
    fn test_accept_frame_increments_index() {
        let mut session = session();

        assert_eq!(session.accept_frame(), 1);
        assert_eq!(session.accept_frame(), 2);
        assert_eq!(session.frame_index(), 2);
        assert_eq!(session.frames_received(), 2);
    }

    #[test]
    fn test_record_drop_reports_next_index() {
        let mut session = session();
        session.accept_frame();

        assert_eq!(session.record_drop(), 2);
        assert_eq!(session.record_drop(), 2);
        assert_eq!(session.frame_index(), 1);
        assert_eq!(session.dropped_frames(), 2);
        assert_eq!(session.frames_received(), 3);
    }

    #[test]
    fn test_record_processed_sets_timing() {
        let mut session = session();
        session.accept_frame();
        session.record_processed(Duration::from_millis(42));

        assert!(session.last_processed_at().is_some());
        assert_eq!(
            session.last_processing_duration(),
            Some(Duration::from_millis(42))
        );
    }

    #[test]
    fn test_record_drop_clears_processing_duration() {
        let mut session = session();
        session.accept_frame();
        session.record_processed(Duration::from_millis(500));
        session.record_drop();

        assert!(session.last_processing_duration().is_none());
        assert!(session.last_processed_at().is_some());
    }

    #[test]
    fn test_cumulative_drop_rate() {
        let mut session = session();
        for _ in 0..65 {
            session.accept_frame();
        }
        for _ in 0..35 {
            session.record_drop();
        }

        assert!((session.drop_rate() - 0.35).abs() < 1e-9);
        assert!((session.measured_drop_rate() - 0.35).abs() < 1e-9);
    }

    #[test]
    fn test_windowed_drop_rate_forgets_old_frames() {
        let mut session = Session::new("p", SessionConfig::new().with_rate_window(4));
        for _ in 0..4 {
            session.record_drop();
        }
        assert!((session.measured_drop_rate() - 1.0).abs() < f64::EPSILON);

        session.accept_frame();
        session.accept_frame();
        assert!((session.measured_drop_rate() - 0.5).abs() < f64::EPSILON);

        session.accept_frame();
        session.accept_frame();
        assert!(session.measured_drop_rate().abs() < f64::EPSILON);
        // Cumulative rate still counts every frame.
        assert!((session.drop_rate() - 0.5).abs() < f64::EPSILON);
    }

    // ==================== Lifecycle Tests ====================

    #[test]
    fn test_lifecycle_moves_forward_only() {
        let mut session = session();

        assert!(session.begin_closing());
        assert_eq!(session.state(), SessionState::Closing);
        assert!(!session.begin_closing());

        assert!(session.mark_closed());
        assert_eq!(session.state(), SessionState::Closed);
        assert!(!session.begin_closing());
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test]
    fn test_mark_closed_from_active() {
        let mut session = session();
        assert!(session.mark_closed());
        assert!(session.state().is_terminal());
    }

    #[test]
    fn test_stats_snapshot() {
        let mut session = session();
        session.accept_frame();
        session.record_drop();

        let stats = session.stats();
        assert_eq!(stats.session_id, session.id());
        assert_eq!(stats.pipeline_id, "jpeg_info");
        assert_eq!(stats.frame_index, 1);
        assert_eq!(stats.dropped_frames, 1);
        assert!((stats.drop_rate - 0.5).abs() < f64::EPSILON);
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn drop_rate_within_unit_interval(
                outcomes in prop::collection::vec(any::<bool>(), 0..200),
                window in 0usize..16,
            ) {
                let mut session = Session::new("p", SessionConfig::new().with_rate_window(window));
                for dropped in &outcomes {
                    if *dropped {
                        session.record_drop();
                    } else {
                        session.accept_frame();
                    }
                    prop_assert!((0.0..=1.0).contains(&session.drop_rate()));
                    prop_assert!((0.0..=1.0).contains(&session.measured_drop_rate()));
                }
                prop_assert_eq!(session.frames_received(), outcomes.len() as u64);
            }
        }
    }
}
