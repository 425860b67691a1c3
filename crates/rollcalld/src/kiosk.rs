//! Session supervisor: owns at most one running session, remembers the
//! last device failure, and restarts on an explicit retry.

use rollcall_core::{
    spawn_session, AttendanceGateway, DeviceError, FrameSource, KioskConfig, KioskEvent,
    RecognitionService, SessionExit, SessionHandle, SessionStatus,
};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};

/// Builds a fresh frame source for each session.
pub type SourceFactory = Box<dyn Fn() -> Box<dyn FrameSource> + Send + Sync>;

/// Device failure as reported over the control interface.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceFault {
    pub kind: &'static str,
    pub message: String,
    pub detail: String,
}

impl From<&DeviceError> for DeviceFault {
    fn from(err: &DeviceError) -> Self {
        Self {
            kind: err.kind(),
            message: err.user_message(),
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct KioskStatus {
    pub version: &'static str,
    pub session: SessionStatus,
    pub last_error: Option<DeviceFault>,
}

#[derive(Default)]
struct Slot {
    session: Option<SessionHandle>,
    last_error: Option<DeviceError>,
}

impl Slot {
    /// Collect a session that ended on its own and record why.
    async fn reap(&mut self) {
        if !self.session.as_ref().is_some_and(SessionHandle::is_finished) {
            return;
        }
        let Some(handle) = self.session.take() else {
            return;
        };
        match handle.stop().await {
            SessionExit::DeviceLost(err) => self.last_error = Some(err),
            SessionExit::Panicked(msg) => {
                tracing::error!(error = %msg, "session task panicked");
                self.last_error = Some(DeviceError::Other(msg));
            }
            SessionExit::Stopped => {}
        }
    }
}

pub struct Kiosk {
    config: KioskConfig,
    sources: SourceFactory,
    service: Arc<dyn RecognitionService>,
    gateway: Arc<dyn AttendanceGateway>,
    events: broadcast::Sender<KioskEvent>,
    slot: Mutex<Slot>,
}

impl Kiosk {
    pub fn new(
        config: KioskConfig,
        sources: SourceFactory,
        service: Arc<dyn RecognitionService>,
        gateway: Arc<dyn AttendanceGateway>,
        events: broadcast::Sender<KioskEvent>,
    ) -> Self {
        Self {
            config,
            sources,
            service,
            gateway,
            events,
            slot: Mutex::new(Slot::default()),
        }
    }

    /// Start a session, or report the running one. Also the retry action
    /// after a device failure.
    pub async fn start(&self) -> Result<SessionStatus, DeviceError> {
        let mut slot = self.slot.lock().await;
        slot.reap().await;
        if let Some(session) = &slot.session {
            tracing::debug!("start requested while a session is running");
            return Ok(session.status());
        }

        let source = (self.sources)();
        match spawn_session(
            self.config.clone(),
            source,
            Arc::clone(&self.service),
            Arc::clone(&self.gateway),
            self.events.clone(),
        )
        .await
        {
            Ok(handle) => {
                let status = handle.status();
                slot.session = Some(handle);
                slot.last_error = None;
                Ok(status)
            }
            Err(err) => {
                tracing::warn!(error = %err, kind = err.kind(), "session start failed");
                let _ = self.events.send(KioskEvent::DeviceFailed {
                    kind: err.kind().to_string(),
                    message: err.user_message(),
                });
                slot.last_error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Stop the running session. Returns false when none was running.
    pub async fn stop(&self) -> bool {
        let mut slot = self.slot.lock().await;
        slot.reap().await;
        match slot.session.take() {
            Some(handle) => {
                handle.stop().await;
                true
            }
            None => false,
        }
    }

    pub async fn status(&self) -> KioskStatus {
        let mut slot = self.slot.lock().await;
        slot.reap().await;
        KioskStatus {
            version: env!("CARGO_PKG_VERSION"),
            session: slot
                .session
                .as_ref()
                .map_or_else(SessionStatus::inactive, SessionHandle::status),
            last_error: slot.last_error.as_ref().map(DeviceFault::from),
        }
    }
}
