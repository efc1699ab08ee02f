//! Read-mostly view of active sessions.
//!
//! Connection handlers never share their [`Session`](crate::session::Session).
//! Instead each one reports counters on a bounded channel and a single
//! worker folds the reports into a map that observers can read.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

use crate::session::{CloseReason, SessionStats};

/// Report sent by a connection handler.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A session became active.
    Opened(SessionStats),
    /// Counters after a frame.
    Progress(SessionStats),
    /// A session ended.
    Closed {
        /// Final counters.
        stats: SessionStats,
        /// Why it ended.
        reason: CloseReason,
    },
}

/// Aggregate view returned by [`SessionMonitor::snapshot`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorSnapshot {
    /// Currently active sessions, oldest first.
    pub active: Vec<SessionStats>,
    /// Sessions opened since startup.
    pub total_opened: u64,
    /// Sessions closed since startup.
    pub total_closed: u64,
    /// Frames processed by sessions that have closed.
    pub closed_frames: u64,
    /// Frames dropped by sessions that have closed.
    pub closed_dropped: u64,
}

#[derive(Debug, Default)]
struct MonitorState {
    active: HashMap<uuid::Uuid, SessionStats>,
    total_opened: u64,
    total_closed: u64,
    closed_frames: u64,
    closed_dropped: u64,
}

impl MonitorState {
    fn apply(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Opened(stats) => {
                self.total_opened += 1;
                self.active.insert(stats.session_id, stats);
            }
            SessionEvent::Progress(stats) => {
                // A late progress report must not resurrect a closed session.
                if let Some(entry) = self.active.get_mut(&stats.session_id) {
                    *entry = stats;
                }
            }
            SessionEvent::Closed { stats, reason } => {
                trace!(session_id = %stats.session_id, ?reason, "Session closed");
                self.active.remove(&stats.session_id);
                self.total_closed += 1;
                self.closed_frames += stats.frame_index;
                self.closed_dropped += stats.dropped_frames;
            }
        }
    }
}

/// Sending half handed to each connection handler.
#[derive(Debug, Clone)]
pub struct MonitorHandle {
    tx: mpsc::Sender<SessionEvent>,
}

impl MonitorHandle {
    /// Report that a session opened. Waits for channel capacity.
    pub async fn opened(&self, stats: SessionStats) {
        if self.tx.send(SessionEvent::Opened(stats)).await.is_err() {
            debug!("Session monitor is gone, dropping open report");
        }
    }

    /// Report progress without waiting. Returns `false` if the report was
    /// discarded because the channel is full or closed.
    pub fn progress(&self, stats: SessionStats) -> bool {
        self.tx.try_send(SessionEvent::Progress(stats)).is_ok()
    }

    /// Report that a session closed. Waits for channel capacity.
    pub async fn closed(&self, stats: SessionStats, reason: CloseReason) {
        if self
            .tx
            .send(SessionEvent::Closed { stats, reason })
            .await
            .is_err()
        {
            debug!("Session monitor is gone, dropping close report");
        }
    }
}

/// Receiving half; run it on its own task.
#[derive(Debug)]
pub struct MonitorWorker {
    rx: mpsc::Receiver<SessionEvent>,
    state: Arc<RwLock<MonitorState>>,
}

impl MonitorWorker {
    /// Fold reports until every handle has been dropped.
    pub async fn run(mut self) {
        while let Some(event) = self.rx.recv().await {
            self.state.write().await.apply(event);
        }
        debug!("Session monitor stopped");
    }
}

/// Observer side of the monitor.
#[derive(Debug, Clone)]
pub struct SessionMonitor {
    state: Arc<RwLock<MonitorState>>,
    handle: MonitorHandle,
}

impl SessionMonitor {
    /// Create a monitor whose report channel holds `capacity` events.
    #[must_use]
    pub fn new(capacity: usize) -> (Self, MonitorWorker) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let state = Arc::new(RwLock::new(MonitorState::default()));
        let monitor = Self {
            state: state.clone(),
            handle: MonitorHandle { tx },
        };
        (monitor, MonitorWorker { rx, state })
    }

    /// A handle for reporting.
    #[must_use]
    pub fn handle(&self) -> MonitorHandle {
        self.handle.clone()
    }

    /// Number of active sessions.
    pub async fn active_count(&self) -> usize {
        self.state.read().await.active.len()
    }

    /// Latest counters for one session.
    pub async fn get(&self, session_id: uuid::Uuid) -> Option<SessionStats> {
        self.state.read().await.active.get(&session_id).cloned()
    }

    /// Copy of the current view.
    pub async fn snapshot(&self) -> MonitorSnapshot {
        let state = self.state.read().await;
        let mut active: Vec<SessionStats> = state.active.values().cloned().collect();
        active.sort_by_key(|s| s.connected_at);
        MonitorSnapshot {
            active,
            total_opened: state.total_opened,
            total_closed: state.total_closed,
            closed_frames: state.closed_frames,
            closed_dropped: state.closed_dropped,
        }
    }
}
