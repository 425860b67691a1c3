//! Turns every `KioskEvent` into a tracing event.

use rollcall_core::{KioskEvent, ScanState};
use tokio::sync::broadcast::{self, error::RecvError};

pub async fn run(mut events: broadcast::Receiver<KioskEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => log_event(&event),
            Err(RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger fell behind; events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn log_event(event: &KioskEvent) {
    match event {
        KioskEvent::SessionStarted { presence_strategy } => {
            tracing::info!(presence_strategy = %presence_strategy, "kiosk scanning");
        }
        KioskEvent::StateChanged { from, to } => {
            if *to == ScanState::Confirmed {
                tracing::info!(%from, %to, "person confirmed");
            } else {
                tracing::debug!(%from, %to, "state");
            }
        }
        KioskEvent::PresenceChanged { present } => {
            tracing::debug!(present, "presence");
        }
        KioskEvent::AttemptStarted { attempt } => {
            tracing::debug!(attempt = %attempt, "recognizing");
        }
        KioskEvent::AttemptDiscarded { attempt } => {
            tracing::debug!(attempt = %attempt, "outcome discarded; person left");
        }
        KioskEvent::MatchRejected {
            identity_id,
            confidence,
            reason,
            ..
        } => {
            tracing::info!(identity = %identity_id, confidence, ?reason, "match not accepted");
        }
        KioskEvent::RecognitionFailed { attempt, error } => {
            tracing::warn!(attempt = %attempt, error = %error, "recognition error");
        }
        KioskEvent::AttendanceMarked { mark } => {
            if mark.already_marked {
                tracing::info!(identity = %mark.identity_id, name = %mark.identity_name, "already marked today");
            } else {
                tracing::info!(
                    identity = %mark.identity_id,
                    name = %mark.identity_name,
                    status = mark.status.as_str(),
                    confidence = mark.confidence,
                    "attendance marked"
                );
            }
        }
        KioskEvent::GatewayFailed { identity_id, error } => {
            tracing::warn!(identity = %identity_id, error = %error, "attendance not recorded");
        }
        KioskEvent::DeviceFailed { kind, message } => {
            tracing::warn!(kind = %kind, message = %message, "camera unavailable; call Start to retry");
        }
        KioskEvent::SessionStopped => {
            tracing::info!("kiosk idle");
        }
    }
}
