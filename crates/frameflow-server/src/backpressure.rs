//! Load shedding policy.
//!
//! Every function here is pure over a [`Session`]'s counters. The connection
//! handler applies the outcome; nothing in this module mutates state or
//! holds frames. A frame that is not accepted immediately is dropped.

use std::time::Duration;

use crate::session::Session;

/// What to do with the next frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Run the frame through the pipeline.
    Accept,
    /// Discard the frame.
    Drop(DropCause),
}

/// Which symptom triggered a drop. Both may hold at once; the interval
/// check is reported first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropCause {
    /// The previous frame took longer than the nominal frame interval.
    FallingBehind,
    /// The drop rate is above the drop threshold.
    DropRate,
}

/// Decide whether the next frame should be dropped.
///
/// Either symptom alone is enough: the previous frame outlasting the frame
/// interval, or the drop rate exceeding `drop_threshold`.
#[must_use]
pub fn should_drop(
    session: &Session,
    last_processing_duration: Option<Duration>,
    frame_interval: Duration,
) -> bool {
    drop_cause(session, last_processing_duration, frame_interval).is_some()
}

fn drop_cause(
    session: &Session,
    last_processing_duration: Option<Duration>,
    frame_interval: Duration,
) -> Option<DropCause> {
    if last_processing_duration.is_some_and(|d| d > frame_interval) {
        Some(DropCause::FallingBehind)
    } else if session.measured_drop_rate() > session.config().drop_threshold {
        Some(DropCause::DropRate)
    } else {
        None
    }
}

/// Evaluate the next frame against the session's own timing and settings.
#[must_use]
pub fn evaluate(session: &Session) -> Decision {
    drop_cause(
        session,
        session.last_processing_duration(),
        session.config().frame_interval,
    )
    .map_or(Decision::Accept, Decision::Drop)
}

/// Edge-triggered slow-down check: true when the drop rate is above the
/// slow-down threshold and no warning is outstanding for this episode.
#[must_use]
pub fn should_warn_slow_down(session: &Session) -> bool {
    !session.slow_down_sent() && session.measured_drop_rate() > session.config().slowdown_threshold
}

/// True when a warning is outstanding and the drop rate has fallen back to
/// or below the slow-down threshold, ending the episode.
#[must_use]
pub fn should_reset_slow_down(session: &Session) -> bool {
    session.slow_down_sent()
        && session.measured_drop_rate() <= session.config().slowdown_threshold
}
