//! rollcall-core — Presence-gated recognition for an attendance kiosk.
//!
//! A cheap presence check runs continuously; the expensive recognition call
//! only runs while someone is in front of the camera, at most one at a time.
//! Confirmed matches are handed to an attendance gateway exactly once per
//! presence episode.

pub mod config;
pub mod event;
pub mod orchestrator;
pub mod presence;
pub mod service;
pub mod session;
pub mod source;
pub mod types;

pub use config::{ConfigError, HeuristicConfig, KioskConfig};
pub use event::KioskEvent;
pub use service::{
    AttendanceGateway, GatewayError, RecognitionError, RecognitionRequest, RecognitionService,
};
pub use session::{spawn_session, SessionExit, SessionHandle};
pub use source::{DeviceError, Frame, FrameSource, StillFrame};
pub use types::{
    AttendanceMark, AttendanceRequest, AttendanceStatus, Identity, Match, Recognition, ScanState,
    SessionStatus,
};
