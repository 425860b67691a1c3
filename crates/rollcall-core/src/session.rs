//! Session runner: owns the frame source, both periodic ticks and the
//! in-flight recognition call, and applies orchestrator effects.
//!
//! Everything runs on one tokio task. Camera reads block, so each one is
//! handed to the blocking pool together with the source, which comes back
//! with the result; at most one read is outstanding. The device is released
//! when the task ends, whether by [`SessionHandle::stop`], a device fault, or
//! the handle being dropped (which aborts the task).

use crate::config::KioskConfig;
use crate::event::KioskEvent;
use crate::orchestrator::{Effect, Orchestrator, OrchestratorConfig};
use crate::presence::{select_detector, PresenceDetector};
use crate::service::{AttendanceGateway, RecognitionError, RecognitionRequest, RecognitionService};
use crate::source::{DeviceError, Frame, FrameSource, StillFrame};
use crate::types::{AttemptId, AttendanceRequest, Recognition, SessionStatus};
use chrono::Utc;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{broadcast, oneshot, watch};
use tokio::task::{self, JoinHandle};
use tokio::time::{interval, interval_at, sleep_until, Instant, MissedTickBehavior};

/// How a session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionExit {
    Stopped,
    DeviceLost(DeviceError),
    Panicked(String),
}

/// Handle to a running session. Dropping it aborts the session task.
pub struct SessionHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<SessionExit>>,
    status: watch::Receiver<SessionStatus>,
}

impl SessionHandle {
    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    /// The session task has ended (stopped or device lost).
    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, |task| task.is_finished())
    }

    /// Cancel both ticks and release the device; returns once both are done.
    pub async fn stop(mut self) -> SessionExit {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .unwrap_or_else(|e| SessionExit::Panicked(e.to_string())),
            None => SessionExit::Stopped,
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Start the frame source and spawn the session task.
///
/// The device open and warmup run on the blocking pool. Fails fast with the
/// source's `DeviceError`; no task is spawned in that case.
pub async fn spawn_session(
    config: KioskConfig,
    mut source: Box<dyn FrameSource>,
    service: Arc<dyn RecognitionService>,
    gateway: Arc<dyn AttendanceGateway>,
    events: broadcast::Sender<KioskEvent>,
) -> Result<SessionHandle, DeviceError> {
    let (source, started) = task::spawn_blocking(move || {
        let started = source.start();
        (source, started)
    })
    .await
    .map_err(|e| DeviceError::Other(format!("camera start task failed: {e}")))?;
    started?;

    let detector = select_detector(source.native_presence(), config.heuristic.clone());
    let presence_strategy = detector.name().to_string();

    let (status_tx, status_rx) = watch::channel(SessionStatus {
        active: true,
        presence_strategy: presence_strategy.clone(),
        ..SessionStatus::inactive()
    });
    let (shutdown_tx, shutdown_rx) = oneshot::channel();

    tracing::debug!(
        presence_strategy = %presence_strategy,
        presence_period_ms = config.presence_period_ms,
        recognition_period_ms = config.recognition_period_ms,
        "session started"
    );
    let _ = events.send(KioskEvent::SessionStarted { presence_strategy });

    let runner = Runner {
        machine: Orchestrator::new(OrchestratorConfig::from(&config)),
        config,
        source: Some(source),
        want_luma: false,
        want_still: false,
        detector,
        service,
        gateway,
        events,
        status: status_tx,
    };
    let task = tokio::spawn(runner.run(shutdown_rx));

    Ok(SessionHandle {
        shutdown: Some(shutdown_tx),
        task: Some(task),
        status: status_rx,
    })
}

type RecognitionCall = Pin<Box<dyn Future<Output = Result<Recognition, RecognitionError>> + Send>>;

#[derive(Debug, Clone, Copy)]
enum CaptureKind {
    Luma,
    Still,
}

enum Captured {
    Luma(Result<Option<Frame>, DeviceError>),
    Still(Result<Option<StillFrame>, DeviceError>),
}

/// A camera read on the blocking pool; yields the source back.
type CaptureTask = JoinHandle<(Box<dyn FrameSource>, Captured)>;

struct InFlight {
    id: AttemptId,
    call: RecognitionCall,
}

struct Runner {
    config: KioskConfig,
    machine: Orchestrator,
    /// `None` while a read holds the source.
    source: Option<Box<dyn FrameSource>>,
    want_luma: bool,
    want_still: bool,
    detector: Box<dyn PresenceDetector>,
    service: Arc<dyn RecognitionService>,
    gateway: Arc<dyn AttendanceGateway>,
    events: broadcast::Sender<KioskEvent>,
    status: watch::Sender<SessionStatus>,
}

impl Runner {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) -> SessionExit {
        let mut presence_tick = interval(self.config.presence_period());
        presence_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let period = self.config.recognition_period();
        let mut recognition_tick = interval_at(Instant::now() + period, period);
        recognition_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<InFlight> = None;
        let mut capture: Option<CaptureTask> = None;

        let exit = loop {
            let deadline = self.machine.next_deadline();

            tokio::select! {
                biased;

                _ = &mut shutdown => break SessionExit::Stopped,

                _ = wait_until(deadline), if deadline.is_some() => {
                    let effects = self.machine.on_deadline(Instant::now());
                    self.apply(effects, &mut in_flight, None);
                }

                (id, result) = poll_call(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    let effects = self.machine.on_attempt_resolved(id, result, Instant::now());
                    self.apply(effects, &mut in_flight, None);
                }

                done = poll_capture(&mut capture), if capture.is_some() => {
                    capture = None;
                    let (source, captured) = match done {
                        Ok(done) => done,
                        Err(e) => {
                            break SessionExit::DeviceLost(DeviceError::Other(format!(
                                "capture task failed: {e}"
                            )))
                        }
                    };
                    self.source = Some(source);
                    let handled = match captured {
                        Captured::Luma(frame) => self.sample_presence(frame, &mut in_flight),
                        Captured::Still(still) => self.start_attempt(still, &mut in_flight),
                    };
                    if let Err(err) = handled {
                        break SessionExit::DeviceLost(err);
                    }
                    self.request_capture(&mut capture);
                }

                _ = presence_tick.tick() => {
                    self.want_luma = true;
                    self.request_capture(&mut capture);
                }

                _ = recognition_tick.tick() => {
                    if self.machine.ready_for_attempt() {
                        self.want_still = true;
                        self.request_capture(&mut capture);
                    }
                }
            }

            self.publish_status(true);
        };

        if let SessionExit::DeviceLost(err) = &exit {
            tracing::debug!(error = %err, "capture device failed; session ended");
            self.emit(KioskEvent::DeviceFailed {
                kind: err.kind().to_string(),
                message: err.user_message(),
            });
        }

        // An in-flight call is dropped with the session; a running read is
        // waited for so the source can be stopped here.
        drop(in_flight);
        if let Some(task) = capture.take() {
            if let Ok((source, _)) = task.await {
                self.source = Some(source);
            }
        }
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
        self.publish_status(false);
        self.emit(KioskEvent::SessionStopped);
        tracing::debug!(episodes = self.machine.episodes(), "session stopped");
        exit
    }

    /// Hand the source to the blocking pool for the next wanted read.
    /// Luminance goes first so a coinciding presence sample is applied
    /// before the attempt starts.
    fn request_capture(&mut self, capture: &mut Option<CaptureTask>) {
        if capture.is_some() {
            return;
        }
        let kind = if std::mem::take(&mut self.want_luma) {
            CaptureKind::Luma
        } else if std::mem::take(&mut self.want_still) && self.machine.ready_for_attempt() {
            CaptureKind::Still
        } else {
            return;
        };
        let Some(mut source) = self.source.take() else {
            return;
        };
        tracing::trace!(?kind, "capture requested");
        *capture = Some(task::spawn_blocking(move || {
            let captured = match kind {
                CaptureKind::Luma => Captured::Luma(source.luma_frame()),
                CaptureKind::Still => Captured::Still(source.capture_frame()),
            };
            (source, captured)
        }));
    }

    fn sample_presence(
        &mut self,
        frame: Result<Option<Frame>, DeviceError>,
        in_flight: &mut Option<InFlight>,
    ) -> Result<(), DeviceError> {
        // Not ready: keep the last sample.
        let Some(frame) = frame? else {
            return Ok(());
        };
        let present = self.detector.is_present(&frame);
        if present != self.machine.is_present() {
            tracing::debug!(present, "presence changed");
            self.emit(KioskEvent::PresenceChanged { present });
        }
        let effects = self.machine.on_presence(present);
        self.apply(effects, in_flight, None);
        Ok(())
    }

    fn start_attempt(
        &mut self,
        still: Result<Option<StillFrame>, DeviceError>,
        in_flight: &mut Option<InFlight>,
    ) -> Result<(), DeviceError> {
        let Some(still) = still? else {
            tracing::debug!("frame source not ready; skipping recognition tick");
            return Ok(());
        };
        // Presence may have changed while the still was being read.
        if !self.machine.ready_for_attempt() {
            return Ok(());
        }
        let effects = self.machine.on_recognition_tick(Instant::now());
        self.apply(effects, in_flight, Some(still));
        Ok(())
    }

    fn apply(
        &mut self,
        effects: Vec<Effect>,
        in_flight: &mut Option<InFlight>,
        mut still: Option<StillFrame>,
    ) {
        for effect in effects {
            match effect {
                Effect::StateChanged { from, to } => {
                    tracing::debug!(%from, %to, "scan state changed");
                    self.emit(KioskEvent::StateChanged { from, to });
                }
                Effect::Recognize(id) => match still.take() {
                    Some(frame) => {
                        tracing::debug!(attempt = %id, bytes = frame.jpeg.len(), "recognition attempt started");
                        let service = Arc::clone(&self.service);
                        let request = RecognitionRequest {
                            frame,
                            max_faces: self.config.max_faces_per_frame,
                        };
                        *in_flight = Some(InFlight {
                            id,
                            call: Box::pin(async move { service.recognize(request).await }),
                        });
                        self.emit(KioskEvent::AttemptStarted { attempt: id });
                    }
                    None => {
                        // Left outstanding; the recognition timeout reclaims it.
                        tracing::error!(attempt = %id, "recognition attempt started without a frame");
                    }
                },
                Effect::Abandon(id) => {
                    if in_flight.as_ref().is_some_and(|call| call.id == id) {
                        *in_flight = None;
                    }
                }
                Effect::Discarded(id) => {
                    tracing::debug!(attempt = %id, "stale recognition outcome discarded");
                    self.emit(KioskEvent::AttemptDiscarded { attempt: id });
                }
                Effect::Rejected {
                    attempt,
                    identity,
                    confidence,
                    reason,
                } => {
                    tracing::debug!(
                        attempt = %attempt,
                        identity = %identity.id,
                        confidence,
                        ?reason,
                        "match rejected"
                    );
                    self.emit(KioskEvent::MatchRejected {
                        attempt,
                        identity_id: identity.id,
                        confidence,
                        reason,
                    });
                }
                Effect::RecognitionFailed { attempt, error } => {
                    tracing::debug!(attempt = %attempt, error = %error, "recognition failed");
                    self.emit(KioskEvent::RecognitionFailed {
                        attempt,
                        error: error.to_string(),
                    });
                }
                Effect::MarkAttendance {
                    episode,
                    identity,
                    confidence,
                } => {
                    tracing::debug!(episode, identity = %identity.id, confidence, "attendance confirmed");
                    self.mark_attendance(AttendanceRequest {
                        identity,
                        confidence,
                        timestamp: Utc::now(),
                    });
                }
            }
        }
    }

    /// Fire-and-forget gateway write; failures are reported, never fed back.
    fn mark_attendance(&self, request: AttendanceRequest) {
        let gateway = Arc::clone(&self.gateway);
        let events = self.events.clone();
        tokio::spawn(async move {
            let identity_id = request.identity.id.clone();
            match gateway.mark_attendance(request).await {
                Ok(mark) => {
                    tracing::debug!(
                        record = %mark.record_id,
                        identity = %mark.identity_id,
                        status = mark.status.as_str(),
                        already_marked = mark.already_marked,
                        "attendance recorded"
                    );
                    let _ = events.send(KioskEvent::AttendanceMarked { mark });
                }
                Err(err) => {
                    tracing::debug!(identity = %identity_id, error = %err, "attendance write failed");
                    let _ = events.send(KioskEvent::GatewayFailed {
                        identity_id,
                        error: err.to_string(),
                    });
                }
            }
        });
    }

    fn emit(&self, event: KioskEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    fn publish_status(&self, active: bool) {
        let presence_strategy = self.detector.name().to_string();
        self.status.send_replace(SessionStatus {
            active,
            state: self.machine.state(),
            present: self.machine.is_present(),
            busy: self.machine.is_busy(),
            presence_strategy,
            episodes: self.machine.episodes(),
        });
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        // Covers task abort; a no-op after a normal exit. A source held by a
        // running read is stopped by its own drop when the read returns.
        if let Some(source) = self.source.as_mut() {
            source.stop();
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn poll_capture(
    capture: &mut Option<CaptureTask>,
) -> Result<(Box<dyn FrameSource>, Captured), task::JoinError> {
    match capture {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}

async fn poll_call(
    in_flight: &mut Option<InFlight>,
) -> (AttemptId, Result<Recognition, RecognitionError>) {
    match in_flight {
        Some(call) => {
            let result = call.call.as_mut().await;
            (call.id, result)
        }
        None => std::future::pending().await,
    }
}
