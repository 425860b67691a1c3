use crate::types::{AttemptId, AttendanceMark, RejectReason, ScanState};
use serde::Serialize;

/// Reporting channel item. Every error class surfaces here, whether or not a
/// front-end chooses to render it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum KioskEvent {
    SessionStarted {
        presence_strategy: String,
    },
    StateChanged {
        from: ScanState,
        to: ScanState,
    },
    PresenceChanged {
        present: bool,
    },
    AttemptStarted {
        attempt: AttemptId,
    },
    /// Outcome arrived for an attempt that no longer applies.
    AttemptDiscarded {
        attempt: AttemptId,
    },
    MatchRejected {
        attempt: AttemptId,
        identity_id: String,
        confidence: f32,
        reason: RejectReason,
    },
    RecognitionFailed {
        attempt: AttemptId,
        error: String,
    },
    AttendanceMarked {
        mark: AttendanceMark,
    },
    GatewayFailed {
        identity_id: String,
        error: String,
    },
    DeviceFailed {
        kind: String,
        message: String,
    },
    SessionStopped,
}
