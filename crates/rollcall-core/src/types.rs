use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Orchestrator state as shown on the kiosk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanState {
    /// Waiting for a subject; initial state.
    Scanning,
    /// A recognition attempt is outstanding for the current subject.
    PersonDetected,
    /// A match was accepted; cool-down running.
    Confirmed,
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ScanState::Scanning => "scanning",
            ScanState::PersonDetected => "person_detected",
            ScanState::Confirmed => "confirmed",
        })
    }
}

/// Identity resolved by the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    pub name: String,
}

/// A candidate match returned by the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Match {
    pub identity: Identity,
    /// Match score in [0, 1].
    pub confidence: f32,
    /// Whether the service judged the subject to be a live person.
    pub liveness: bool,
}

/// Successful response of the recognition service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Recognition {
    Matched(Match),
    NoMatch,
}

/// Opaque id of a recognition attempt, unique within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub u64);

impl fmt::Display for AttemptId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Why an otherwise successful match was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    BelowThreshold,
    LivenessFailed,
}

/// Request passed to the attendance gateway on entry into `Confirmed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRequest {
    pub identity: Identity,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Attendance status assigned by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    Present,
    Late,
}

impl AttendanceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttendanceStatus::Present => "present",
            AttendanceStatus::Late => "late",
        }
    }
}

/// A durably recorded attendance mark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceMark {
    pub record_id: String,
    pub identity_id: String,
    pub identity_name: String,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
    pub status: AttendanceStatus,
    /// The gateway already held a mark for this identity and returned it.
    pub already_marked: bool,
}

/// Snapshot of a running session, published after every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub active: bool,
    pub state: ScanState,
    pub present: bool,
    /// A recognition attempt is outstanding.
    pub busy: bool,
    /// Name of the presence strategy selected at session start.
    pub presence_strategy: String,
    /// Number of confirmation episodes so far.
    pub episodes: u64,
}

impl SessionStatus {
    pub fn inactive() -> Self {
        Self {
            active: false,
            state: ScanState::Scanning,
            present: false,
            busy: false,
            presence_strategy: String::new(),
            episodes: 0,
        }
    }
}
