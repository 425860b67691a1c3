//! Presence-gated recognition state machine.
//!
//! The [`Orchestrator`] is clock-injected and does no I/O: every input takes
//! the current instant and returns the [`Effect`]s the session runner must
//! apply (start a call, drop a timed-out call, write attendance, report).
//!
//! ```text
//!             tick ∧ present ∧ idle
//!   Scanning ─────────────────────────▶ PersonDetected
//!      ▲  ▲                                │      │
//!      │  └──── no match / error / ────────┘      │ matched ∧ accepted
//!      │        rejected / timeout                ▼
//!      └────────── cool-down ∨ ¬present ────── Confirmed
//! ```
//!
//! At most one attempt is outstanding. Losing presence marks the outstanding
//! attempt stale; its outcome is discarded when it arrives.

use crate::config::KioskConfig;
use crate::service::RecognitionError;
use crate::types::{AttemptId, Identity, Match, Recognition, RejectReason, ScanState};
use std::time::Duration;
use tokio::time::Instant;

/// Thresholds and durations the state machine needs.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub confidence_threshold: f32,
    pub liveness_detection: bool,
    pub recognition_timeout: Duration,
    pub cooldown: Duration,
}

impl From<&KioskConfig> for OrchestratorConfig {
    fn from(config: &KioskConfig) -> Self {
        Self {
            confidence_threshold: config.confidence_threshold,
            liveness_detection: config.liveness_detection,
            recognition_timeout: config.recognition_timeout(),
            cooldown: config.cooldown(),
        }
    }
}

/// Work requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    StateChanged { from: ScanState, to: ScanState },
    /// Capture has already happened; issue the recognition call for this attempt.
    Recognize(AttemptId),
    /// The attempt timed out; drop its in-flight call.
    Abandon(AttemptId),
    /// The attempt's outcome arrived but no longer applies.
    Discarded(AttemptId),
    Rejected {
        attempt: AttemptId,
        identity: Identity,
        confidence: f32,
        reason: RejectReason,
    },
    RecognitionFailed {
        attempt: AttemptId,
        error: RecognitionError,
    },
    /// Entry into `Confirmed`: exactly one per episode.
    MarkAttendance {
        episode: u64,
        identity: Identity,
        confidence: f32,
    },
}

#[derive(Debug)]
struct Outstanding {
    id: AttemptId,
    deadline: Instant,
    /// Presence was lost after this attempt was issued.
    stale: bool,
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    state: ScanState,
    present: bool,
    outstanding: Option<Outstanding>,
    cooldown_until: Option<Instant>,
    next_attempt: u64,
    episodes: u64,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Self {
        Self {
            config,
            state: ScanState::Scanning,
            present: false,
            outstanding: None,
            cooldown_until: None,
            next_attempt: 1,
            episodes: 0,
        }
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_present(&self) -> bool {
        self.present
    }

    /// A recognition attempt is outstanding.
    pub fn is_busy(&self) -> bool {
        self.outstanding.is_some()
    }

    pub fn outstanding(&self) -> Option<AttemptId> {
        self.outstanding.as_ref().map(|o| o.id)
    }

    /// Number of confirmation episodes entered so far.
    pub fn episodes(&self) -> u64 {
        self.episodes
    }

    /// Whether the next recognition tick would start an attempt.
    pub fn ready_for_attempt(&self) -> bool {
        self.present && self.outstanding.is_none() && self.state == ScanState::Scanning
    }

    /// Earliest instant at which [`on_deadline`](Self::on_deadline) has work.
    pub fn next_deadline(&self) -> Option<Instant> {
        let attempt = self.outstanding.as_ref().map(|o| o.deadline);
        match (attempt, self.cooldown_until) {
            (Some(a), Some(c)) => Some(a.min(c)),
            (a, c) => a.or(c),
        }
    }

    /// Record a presence sample. Loss of presence returns to `Scanning`
    /// immediately, pre-empting the cool-down, and marks any outstanding
    /// attempt stale.
    pub fn on_presence(&mut self, present: bool) -> Vec<Effect> {
        let mut effects = Vec::new();
        self.present = present;
        if present {
            return effects;
        }

        if let Some(attempt) = self.outstanding.as_mut() {
            if !attempt.stale {
                tracing::debug!(attempt = %attempt.id, "presence lost; outcome will be discarded");
                attempt.stale = true;
            }
        }
        self.cooldown_until = None;
        self.transition(ScanState::Scanning, &mut effects);
        effects
    }

    /// Recognition tick. Starts an attempt when present and idle; otherwise
    /// the tick is dropped.
    pub fn on_recognition_tick(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();
        if !self.ready_for_attempt() {
            tracing::trace!(
                state = %self.state,
                present = self.present,
                busy = self.is_busy(),
                "recognition tick dropped"
            );
            return effects;
        }

        let id = AttemptId(self.next_attempt);
        self.next_attempt += 1;
        self.outstanding = Some(Outstanding {
            id,
            deadline: now + self.config.recognition_timeout,
            stale: false,
        });
        self.transition(ScanState::PersonDetected, &mut effects);
        effects.push(Effect::Recognize(id));
        effects
    }

    /// Outcome of the recognition call for `id`.
    pub fn on_attempt_resolved(
        &mut self,
        id: AttemptId,
        result: Result<Recognition, RecognitionError>,
        now: Instant,
    ) -> Vec<Effect> {
        let mut effects = Vec::new();

        let attempt = match self.outstanding.take() {
            Some(attempt) if attempt.id == id => attempt,
            other => {
                // Superseded or already timed out.
                self.outstanding = other;
                effects.push(Effect::Discarded(id));
                return effects;
            }
        };

        if attempt.stale {
            if let Err(error) = result {
                effects.push(Effect::RecognitionFailed { attempt: id, error });
            }
            effects.push(Effect::Discarded(id));
            return effects;
        }

        match result {
            Ok(Recognition::Matched(m)) => match self.evaluate(&m) {
                Ok(()) => {
                    self.episodes += 1;
                    self.cooldown_until = Some(now + self.config.cooldown);
                    self.transition(ScanState::Confirmed, &mut effects);
                    effects.push(Effect::MarkAttendance {
                        episode: self.episodes,
                        identity: m.identity,
                        confidence: m.confidence,
                    });
                }
                Err(reason) => {
                    effects.push(Effect::Rejected {
                        attempt: id,
                        identity: m.identity,
                        confidence: m.confidence,
                        reason,
                    });
                    self.transition(ScanState::Scanning, &mut effects);
                }
            },
            Ok(Recognition::NoMatch) => self.transition(ScanState::Scanning, &mut effects),
            Err(error) => {
                effects.push(Effect::RecognitionFailed { attempt: id, error });
                self.transition(ScanState::Scanning, &mut effects);
            }
        }
        effects
    }

    /// Fire expired timers: recognition timeout and cool-down end.
    pub fn on_deadline(&mut self, now: Instant) -> Vec<Effect> {
        let mut effects = Vec::new();

        let expired = self
            .outstanding
            .as_ref()
            .is_some_and(|attempt| now >= attempt.deadline);
        if expired {
            if let Some(attempt) = self.outstanding.take() {
                effects.push(Effect::Abandon(attempt.id));
                effects.push(Effect::RecognitionFailed {
                    attempt: attempt.id,
                    error: RecognitionError::Timeout(self.config.recognition_timeout),
                });
                if !attempt.stale {
                    self.transition(ScanState::Scanning, &mut effects);
                }
            }
        }

        let cooled = self.cooldown_until.is_some_and(|until| now >= until);
        if cooled && self.state == ScanState::Confirmed {
            self.cooldown_until = None;
            self.transition(ScanState::Scanning, &mut effects);
        }
        effects
    }

    fn evaluate(&self, m: &Match) -> Result<(), RejectReason> {
        // NaN fails this comparison and is rejected.
        if !(m.confidence >= self.config.confidence_threshold) {
            return Err(RejectReason::BelowThreshold);
        }
        if self.config.liveness_detection && !m.liveness {
            return Err(RejectReason::LivenessFailed);
        }
        Ok(())
    }

    fn transition(&mut self, to: ScanState, effects: &mut Vec<Effect>) {
        if self.state != to {
            tracing::debug!(from = %self.state, to = %to, "state transition");
            effects.push(Effect::StateChanged {
                from: self.state,
                to,
            });
            self.state = to;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            confidence_threshold: 0.8,
            liveness_detection: true,
            recognition_timeout: Duration::from_secs(5),
            cooldown: Duration::from_secs(4),
        }
    }

    fn matched(confidence: f32, liveness: bool) -> Result<Recognition, RecognitionError> {
        Ok(Recognition::Matched(Match {
            identity: Identity {
                id: "STU001".into(),
                name: "Ada Lovelace".into(),
            },
            confidence,
            liveness,
        }))
    }

    fn marks(effects: &[Effect]) -> usize {
        effects
            .iter()
            .filter(|e| matches!(e, Effect::MarkAttendance { .. }))
            .count()
    }

    fn started(effects: &[Effect]) -> Option<AttemptId> {
        effects.iter().find_map(|e| match e {
            Effect::Recognize(id) => Some(*id),
            _ => None,
        })
    }

    struct Clock(Instant);

    impl Clock {
        fn at(&self, secs: f64) -> Instant {
            self.0 + Duration::from_secs_f64(secs)
        }
    }

    #[test]
    fn test_no_presence_means_no_attempts() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        for i in 0..50 {
            assert!(orch.on_presence(false).is_empty());
            assert!(orch.on_recognition_tick(clock.at(i as f64 * 0.3)).is_empty());
        }
        assert_eq!(orch.state(), ScanState::Scanning);
        assert!(!orch.is_busy());
    }

    #[test]
    fn test_accepted_match_confirms_and_marks_once() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);

        let effects = orch.on_recognition_tick(clock.at(1.0));
        let id = started(&effects).unwrap();
        assert_eq!(orch.state(), ScanState::PersonDetected);

        let effects = orch.on_attempt_resolved(id, matched(0.95, true), clock.at(1.0));
        assert_eq!(orch.state(), ScanState::Confirmed);
        assert_eq!(marks(&effects), 1);
        assert!(effects.contains(&Effect::MarkAttendance {
            episode: 1,
            identity: Identity {
                id: "STU001".into(),
                name: "Ada Lovelace".into()
            },
            confidence: 0.95,
        }));
    }

    #[test]
    fn test_cooldown_returns_to_scanning_once() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        let mut all = orch.on_attempt_resolved(id, matched(0.95, true), clock.at(1.0));

        assert_eq!(orch.next_deadline(), Some(clock.at(5.0)));

        // Ticks during the cool-down do nothing, however frequent.
        for step in 1..=39 {
            let t = clock.at(1.0 + step as f64 * 0.1);
            all.extend(orch.on_presence(true));
            all.extend(orch.on_recognition_tick(t));
            all.extend(orch.on_deadline(t));
        }
        assert_eq!(orch.state(), ScanState::Confirmed);

        let effects = orch.on_deadline(clock.at(5.0));
        assert_eq!(
            effects,
            vec![Effect::StateChanged {
                from: ScanState::Confirmed,
                to: ScanState::Scanning
            }]
        );
        assert!(orch.on_deadline(clock.at(5.0)).is_empty());
        all.extend(effects);
        assert_eq!(marks(&all), 1);
        assert_eq!(orch.episodes(), 1);
    }

    #[test]
    fn test_timeout_reverts_and_reports() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();

        assert_eq!(orch.next_deadline(), Some(clock.at(6.0)));
        assert!(orch.on_deadline(clock.at(5.9)).is_empty());

        let effects = orch.on_deadline(clock.at(6.0));
        assert_eq!(
            effects,
            vec![
                Effect::Abandon(id),
                Effect::RecognitionFailed {
                    attempt: id,
                    error: RecognitionError::Timeout(Duration::from_secs(5)),
                },
                Effect::StateChanged {
                    from: ScanState::PersonDetected,
                    to: ScanState::Scanning
                },
            ]
        );
        assert!(!orch.is_busy());

        // A late answer for the abandoned attempt is ignored.
        let effects = orch.on_attempt_resolved(id, matched(0.99, true), clock.at(7.0));
        assert_eq!(effects, vec![Effect::Discarded(id)]);
        assert_eq!(orch.state(), ScanState::Scanning);
    }

    #[test]
    fn test_flicker_discards_stale_match() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();

        let effects = orch.on_presence(false);
        assert_eq!(
            effects,
            vec![Effect::StateChanged {
                from: ScanState::PersonDetected,
                to: ScanState::Scanning
            }]
        );
        // Still busy: the call is not cancelled.
        assert!(orch.is_busy());
        orch.on_presence(true);
        assert!(orch.on_recognition_tick(clock.at(2.5)).is_empty());

        let effects = orch.on_attempt_resolved(id, matched(0.99, true), clock.at(3.0));
        assert_eq!(effects, vec![Effect::Discarded(id)]);
        assert_eq!(orch.state(), ScanState::Scanning);
        assert!(!orch.is_busy());
        assert_eq!(orch.episodes(), 0);
    }

    #[test]
    fn test_stale_error_is_still_reported() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        orch.on_presence(false);

        let error = RecognitionError::Service("503".into());
        let effects = orch.on_attempt_resolved(id, Err(error.clone()), clock.at(2.0));
        assert_eq!(
            effects,
            vec![
                Effect::RecognitionFailed { attempt: id, error },
                Effect::Discarded(id)
            ]
        );
    }

    #[test]
    fn test_below_threshold_rejected() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();

        let effects = orch.on_attempt_resolved(id, matched(0.79, true), clock.at(1.5));
        assert_eq!(marks(&effects), 0);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Rejected {
                reason: RejectReason::BelowThreshold,
                ..
            }
        )));
        assert_eq!(orch.state(), ScanState::Scanning);
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        let effects = orch.on_attempt_resolved(id, matched(0.8, true), clock.at(1.0));
        assert_eq!(marks(&effects), 1);
    }

    #[test]
    fn test_nan_confidence_rejected() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        let effects = orch.on_attempt_resolved(id, matched(f32::NAN, true), clock.at(1.0));
        assert_eq!(marks(&effects), 0);
    }

    #[test]
    fn test_liveness_failure_rejected() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();

        let effects = orch.on_attempt_resolved(id, matched(0.99, false), clock.at(1.0));
        assert_eq!(marks(&effects), 0);
        assert!(effects.iter().any(|e| matches!(
            e,
            Effect::Rejected {
                reason: RejectReason::LivenessFailed,
                ..
            }
        )));
    }

    #[test]
    fn test_liveness_ignored_when_disabled() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(OrchestratorConfig {
            liveness_detection: false,
            ..config()
        });
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        let effects = orch.on_attempt_resolved(id, matched(0.9, false), clock.at(1.0));
        assert_eq!(marks(&effects), 1);
        assert_eq!(orch.state(), ScanState::Confirmed);
    }

    #[test]
    fn test_tick_while_busy_is_dropped() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let first = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        assert!(orch.on_recognition_tick(clock.at(2.0)).is_empty());
        assert!(orch.on_recognition_tick(clock.at(3.0)).is_empty());
        assert_eq!(orch.outstanding(), Some(first));

        orch.on_attempt_resolved(first, Ok(Recognition::NoMatch), clock.at(3.5));
        let second = started(&orch.on_recognition_tick(clock.at(4.0))).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_presence_loss_preempts_cooldown() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        orch.on_attempt_resolved(id, matched(0.95, true), clock.at(1.0));
        assert_eq!(orch.state(), ScanState::Confirmed);

        let effects = orch.on_presence(false);
        assert_eq!(
            effects,
            vec![Effect::StateChanged {
                from: ScanState::Confirmed,
                to: ScanState::Scanning
            }]
        );
        assert_eq!(orch.next_deadline(), None);
        assert!(orch.on_deadline(clock.at(5.0)).is_empty());
    }

    #[test]
    fn test_new_episode_after_cooldown() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);
        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        orch.on_attempt_resolved(id, matched(0.95, true), clock.at(1.0));
        orch.on_deadline(clock.at(5.0));

        let id = started(&orch.on_recognition_tick(clock.at(6.0))).unwrap();
        let effects = orch.on_attempt_resolved(id, matched(0.95, true), clock.at(6.5));
        assert!(effects.iter().any(|e| matches!(e, Effect::MarkAttendance { episode: 2, .. })));
    }

    #[test]
    fn test_no_match_and_error_revert() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        orch.on_presence(true);

        let id = started(&orch.on_recognition_tick(clock.at(1.0))).unwrap();
        orch.on_attempt_resolved(id, Ok(Recognition::NoMatch), clock.at(1.2));
        assert_eq!(orch.state(), ScanState::Scanning);

        let id = started(&orch.on_recognition_tick(clock.at(2.0))).unwrap();
        let effects = orch.on_attempt_resolved(
            id,
            Err(RecognitionError::Service("connection refused".into())),
            clock.at(2.2),
        );
        assert!(effects
            .iter()
            .any(|e| matches!(e, Effect::RecognitionFailed { .. })));
        assert_eq!(orch.state(), ScanState::Scanning);
        assert!(!orch.is_busy());
    }

    #[test]
    fn test_at_most_one_outstanding_under_random_inputs() {
        let clock = Clock(Instant::now());
        let mut orch = Orchestrator::new(config());
        let mut in_flight: Vec<AttemptId> = Vec::new();
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let mut confirmed_entries = 0usize;
        let mut mark_effects = 0usize;

        for step in 0..5_000u64 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let now = clock.at(step as f64 * 0.1);

            let effects = match seed % 5 {
                0 => orch.on_presence(seed % 3 != 0),
                1 => orch.on_recognition_tick(now),
                2 => match in_flight.first().copied() {
                    Some(id) => {
                        let result = match (seed >> 8) % 3 {
                            0 => matched(0.5 + ((seed >> 16) % 50) as f32 / 100.0, (seed >> 24) % 2 == 0),
                            1 => Ok(Recognition::NoMatch),
                            _ => Err(RecognitionError::Service("boom".into())),
                        };
                        in_flight.retain(|a| *a != id);
                        orch.on_attempt_resolved(id, result, now)
                    }
                    None => Vec::new(),
                },
                _ => orch.on_deadline(now),
            };

            for effect in &effects {
                match effect {
                    Effect::Recognize(id) => in_flight.push(*id),
                    Effect::Abandon(id) => in_flight.retain(|a| a != id),
                    Effect::StateChanged {
                        to: ScanState::Confirmed,
                        ..
                    } => confirmed_entries += 1,
                    Effect::MarkAttendance { .. } => mark_effects += 1,
                    _ => {}
                }
            }
            assert!(in_flight.len() <= 1, "step {step}: {in_flight:?}");
            assert_eq!(orch.is_busy(), !in_flight.is_empty());
        }
        assert_eq!(confirmed_entries, mark_effects);
    }
}
