//! Narrow interfaces to the external recognition service and attendance store.

use crate::source::StillFrame;
use crate::types::{AttendanceMark, AttendanceRequest, Recognition};
use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Recoverable recognition failure; the orchestrator retries on the next tick.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RecognitionError {
    #[error("recognition service error: {0}")]
    Service(String),
    #[error("recognition timed out after {0:?}")]
    Timeout(Duration),
}

/// Recoverable attendance write failure; never affects orchestrator state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum GatewayError {
    #[error("attendance storage failed: {0}")]
    Storage(String),
    #[error("attendance rejected: {0}")]
    Rejected(String),
}

/// One recognition request: a still frame and the face limit for the service.
#[derive(Debug, Clone)]
pub struct RecognitionRequest {
    pub frame: StillFrame,
    pub max_faces: u32,
}

#[async_trait]
pub trait RecognitionService: Send + Sync {
    async fn recognize(&self, request: RecognitionRequest) -> Result<Recognition, RecognitionError>;
}

/// Durable attendance store. Cross-session deduplication is its job.
#[async_trait]
pub trait AttendanceGateway: Send + Sync {
    async fn mark_attendance(
        &self,
        request: AttendanceRequest,
    ) -> Result<AttendanceMark, GatewayError>;
}
