//! Per-camera reconnect state machine
//!
//! Governs the decoder lifecycle: exponential backoff with jitter between
//! attempts and a circuit breaker that throttles reconnect storms. Every
//! transition publishes a status record so out-of-process observers see the
//! same picture the registry does.
//!
//! ```text
//! IDLE → CONNECTING → READY ⇄ STALLED → COOLDOWN → CONNECTING
//!              │                            │
//!              └────────→ COOLDOWN ─────────┴──→ OPEN_BREAKER → COOLDOWN
//! any → STOPPED on stop/remove
//! ```
//!
//! STALLED is held for one frame slot before the cooldown is committed; a
//! frame arriving inside that grace window rolls the pipeline back to READY.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::schema::ReconnectSettings;
use crate::error::ErrorCode;
use crate::status::{CamStatus, StatusStore};

/// READY must hold this long (with frames flowing) before the failure
/// counter resets; a camera that dies right after its first frame keeps
/// escalating backoff.
const SUSTAIN_READY: Duration = Duration::from_secs(5);

/// Pipeline lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Idle,
    Connecting,
    Ready,
    Stalled,
    Cooldown,
    OpenBreaker,
    Stopped,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::Idle => "IDLE",
            Phase::Connecting => "CONNECTING",
            Phase::Ready => "READY",
            Phase::Stalled => "STALLED",
            Phase::Cooldown => "COOLDOWN",
            Phase::OpenBreaker => "OPEN_BREAKER",
            Phase::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

/// Point-in-time view of the reconnect state
#[derive(Debug, Clone)]
pub struct ReconnectSnapshot {
    pub phase: Phase,
    pub consecutive_failures: u32,
    pub next_attempt_in: Option<Duration>,
    pub last_error: Option<ErrorCode>,
}

/// Verdict for a prospective connection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    /// Go ahead; the caller owns the attempt now
    Proceed,
    /// Backoff still running; retry after the given delay
    Wait(Duration),
    /// Breaker is open; no attempt may be made
    Refused,
}

struct State {
    phase: Phase,
    consecutive_failures: u32,
    next_attempt_at: Option<Instant>,
    breaker_opened_at: Option<Instant>,
    last_error: Option<ErrorCode>,
    ready_since: Option<Instant>,
    sustained: bool,
}

/// Per-camera reconnect controller
pub struct ReconnectController {
    camera_id: String,
    settings: ReconnectSettings,
    status: Arc<StatusStore>,
    state: Mutex<State>,
}

impl ReconnectController {
    pub fn new(camera_id: &str, settings: ReconnectSettings, status: Arc<StatusStore>) -> Self {
        Self {
            camera_id: camera_id.to_string(),
            settings,
            status,
            state: Mutex::new(State {
                phase: Phase::Idle,
                consecutive_failures: 0,
                next_attempt_at: None,
                breaker_opened_at: None,
                last_error: None,
                ready_since: None,
                sustained: false,
            }),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn snapshot(&self) -> ReconnectSnapshot {
        let state = self.state.lock();
        ReconnectSnapshot {
            phase: state.phase,
            consecutive_failures: state.consecutive_failures,
            next_attempt_in: state
                .next_attempt_at
                .map(|at| at.saturating_duration_since(Instant::now())),
            last_error: state.last_error,
        }
    }

    /// May a connection attempt start now?
    ///
    /// Handles the half-open transition: once the breaker has been open for
    /// `breaker_open_ms`, the next query moves it back to COOLDOWN and lets
    /// one attempt through.
    pub fn check_attempt(&self) -> AttemptDecision {
        let mut state = self.state.lock();
        match state.phase {
            Phase::Stopped => AttemptDecision::Refused,
            Phase::OpenBreaker => {
                let opened = state.breaker_opened_at.expect("open breaker has open time");
                if opened.elapsed() < Duration::from_millis(self.settings.breaker_open_ms) {
                    AttemptDecision::Refused
                } else {
                    // Half-open: allow a single probe attempt
                    state.phase = Phase::Cooldown;
                    state.next_attempt_at = Some(Instant::now());
                    drop(state);
                    self.publish();
                    AttemptDecision::Proceed
                }
            }
            _ => match state.next_attempt_at {
                Some(at) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        AttemptDecision::Proceed
                    } else {
                        AttemptDecision::Wait(remaining)
                    }
                }
                None => AttemptDecision::Proceed,
            },
        }
    }

    /// IDLE/COOLDOWN → CONNECTING
    pub fn mark_connecting(&self) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Connecting;
            state.ready_since = None;
            state.sustained = false;
        }
        self.publish();
    }

    /// CONNECTING → READY (readiness criterion satisfied), or
    /// STALLED → READY (frame arrived within the stall grace window)
    pub fn mark_ready(&self) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Ready;
            state.ready_since = Some(Instant::now());
            state.sustained = false;
            state.next_attempt_at = None;
        }
        self.publish();
        tracing::info!(camera_id = %self.camera_id, "Capture ready");
    }

    /// Called on every delivered frame; resets the failure counter once
    /// READY has been sustained long enough.
    pub fn note_frame(&self) {
        let mut state = self.state.lock();
        if state.phase != Phase::Ready || state.sustained {
            return;
        }
        if let Some(since) = state.ready_since {
            if since.elapsed() >= SUSTAIN_READY {
                state.sustained = true;
                state.consecutive_failures = 0;
                state.last_error = None;
                drop(state);
                self.publish();
            }
        }
    }

    /// READY → STALLED (watchdog: no frame for `no_frame_timeout_ms`)
    pub fn mark_stalled(&self) {
        {
            let mut state = self.state.lock();
            if state.phase != Phase::Ready {
                return;
            }
            state.phase = Phase::Stalled;
        }
        self.publish();
        tracing::warn!(camera_id = %self.camera_id, "Capture stalled");
    }

    /// Record a classified failure and schedule the next attempt.
    ///
    /// Opens the breaker at the configured threshold; persistent
    /// configuration errors reach it one failure earlier.
    pub fn record_failure(&self, code: ErrorCode) {
        {
            let mut state = self.state.lock();
            if state.phase == Phase::Stopped {
                return;
            }
            state.consecutive_failures += 1;
            state.last_error = Some(code);
            state.ready_since = None;
            state.sustained = false;

            let threshold = if code.is_persistent_config() {
                self.settings.breaker_threshold.saturating_sub(1).max(1)
            } else {
                self.settings.breaker_threshold
            };

            if state.consecutive_failures >= threshold {
                state.phase = Phase::OpenBreaker;
                state.breaker_opened_at = Some(Instant::now());
                state.next_attempt_at =
                    Some(Instant::now() + Duration::from_millis(self.settings.breaker_open_ms));
            } else {
                let delay = self.backoff_delay(state.consecutive_failures);
                state.phase = Phase::Cooldown;
                state.next_attempt_at = Some(Instant::now() + delay);
            }
        }
        self.publish();
    }

    /// any → STOPPED (operator stop or remove)
    pub fn mark_stopped(&self) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Stopped;
            state.next_attempt_at = None;
            state.ready_since = None;
        }
        self.publish();
    }

    /// STOPPED → IDLE, clearing history (registry start/reload)
    pub fn reset(&self) {
        {
            let mut state = self.state.lock();
            state.phase = Phase::Idle;
            state.consecutive_failures = 0;
            state.next_attempt_at = None;
            state.breaker_opened_at = None;
            state.last_error = None;
            state.ready_since = None;
            state.sustained = false;
        }
        self.publish();
    }

    /// `delay = min(max, base × 2^min(failures, 6)) × (1 ± jitter)`
    fn backoff_delay(&self, failures: u32) -> Duration {
        let exp = failures.min(6);
        let raw = self
            .settings
            .backoff_base_ms
            .saturating_mul(1u64 << exp)
            .min(self.settings.backoff_max_ms);
        let jitter = self.settings.jitter.clamp(0.0, 1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-jitter..=jitter);
        Duration::from_millis((raw as f64 * factor).max(0.0) as u64)
    }

    fn publish(&self) {
        let snapshot = self.snapshot();
        self.status.set_status(
            &self.camera_id,
            &CamStatus {
                phase: snapshot.phase,
                consecutive_failures: snapshot.consecutive_failures,
                next_attempt_in_ms: snapshot.next_attempt_in.map(|d| d.as_millis() as u64),
                last_error: snapshot.last_error,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(settings: ReconnectSettings) -> ReconnectController {
        ReconnectController::new("cam-1", settings, Arc::new(StatusStore::new()))
    }

    fn fast_settings() -> ReconnectSettings {
        ReconnectSettings {
            backoff_base_ms: 10,
            backoff_max_ms: 100,
            jitter: 0.0,
            breaker_threshold: 3,
            breaker_open_ms: 50,
        }
    }

    #[test]
    fn test_initial_phase_is_idle() {
        let c = controller(fast_settings());
        assert_eq!(c.phase(), Phase::Idle);
        assert_eq!(c.check_attempt(), AttemptDecision::Proceed);
    }

    #[test]
    fn test_failure_schedules_cooldown() {
        let c = controller(fast_settings());
        c.mark_connecting();
        c.record_failure(ErrorCode::ConnectFailed);
        assert_eq!(c.phase(), Phase::Cooldown);
        match c.check_attempt() {
            AttemptDecision::Wait(d) => assert!(d <= Duration::from_millis(20)),
            other => panic!("expected Wait, got {other:?}"),
        }
        let snap = c.snapshot();
        assert_eq!(snap.consecutive_failures, 1);
        assert_eq!(snap.last_error, Some(ErrorCode::ConnectFailed));
    }

    #[test]
    fn test_breaker_opens_at_threshold_and_refuses() {
        let c = controller(fast_settings());
        for _ in 0..3 {
            c.mark_connecting();
            c.record_failure(ErrorCode::ConnectFailed);
        }
        assert_eq!(c.phase(), Phase::OpenBreaker);
        assert_eq!(c.check_attempt(), AttemptDecision::Refused);
    }

    #[tokio::test]
    async fn test_breaker_half_opens_after_window() {
        let c = controller(fast_settings());
        for _ in 0..3 {
            c.record_failure(ErrorCode::ConnectFailed);
        }
        assert_eq!(c.check_attempt(), AttemptDecision::Refused);
        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(c.check_attempt(), AttemptDecision::Proceed);
        assert_eq!(c.phase(), Phase::Cooldown);
    }

    #[test]
    fn test_persistent_config_opens_breaker_sooner() {
        let c = controller(fast_settings());
        c.record_failure(ErrorCode::AuthFailed);
        assert_eq!(c.phase(), Phase::Cooldown);
        c.record_failure(ErrorCode::AuthFailed);
        // threshold 3 → persistent errors open at 2
        assert_eq!(c.phase(), Phase::OpenBreaker);
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let c = controller(ReconnectSettings {
            backoff_base_ms: 500,
            backoff_max_ms: 10_000,
            jitter: 0.0,
            breaker_threshold: 100,
            breaker_open_ms: 15_000,
        });
        assert_eq!(c.backoff_delay(1), Duration::from_millis(1_000));
        assert_eq!(c.backoff_delay(2), Duration::from_millis(2_000));
        assert_eq!(c.backoff_delay(4), Duration::from_millis(8_000));
        // capped at max
        assert_eq!(c.backoff_delay(6), Duration::from_millis(10_000));
        assert_eq!(c.backoff_delay(50), Duration::from_millis(10_000));
    }

    #[test]
    fn test_jitter_stays_in_bounds() {
        let c = controller(ReconnectSettings {
            backoff_base_ms: 1_000,
            backoff_max_ms: 60_000,
            jitter: 0.25,
            breaker_threshold: 100,
            breaker_open_ms: 15_000,
        });
        for _ in 0..100 {
            let d = c.backoff_delay(1).as_millis() as f64;
            assert!((1_500.0..=2_500.0).contains(&d), "delay {d} out of bounds");
        }
    }

    #[test]
    fn test_stalled_only_from_ready() {
        let c = controller(fast_settings());
        c.mark_connecting();
        c.mark_stalled();
        assert_eq!(c.phase(), Phase::Connecting);
        c.mark_ready();
        c.mark_stalled();
        assert_eq!(c.phase(), Phase::Stalled);
    }

    #[test]
    fn test_stalled_rolls_back_to_ready_on_late_frame() {
        let c = controller(fast_settings());
        c.mark_connecting();
        c.mark_ready();
        c.mark_stalled();
        assert_eq!(c.phase(), Phase::Stalled);
        // Frame arrived during the grace window: no cooldown
        c.mark_ready();
        assert_eq!(c.phase(), Phase::Ready);
        assert_eq!(c.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_sustained_ready_resets_failures() {
        let c = controller(fast_settings());
        c.record_failure(ErrorCode::ConnectFailed);
        c.mark_connecting();
        c.mark_ready();
        // Not sustained yet: counter still stands
        c.note_frame();
        assert_eq!(c.snapshot().consecutive_failures, 1);

        // Force the ready clock back instead of sleeping 5s
        c.state.lock().ready_since = Some(Instant::now() - SUSTAIN_READY);
        c.note_frame();
        let snap = c.snapshot();
        assert_eq!(snap.consecutive_failures, 0);
        assert_eq!(snap.last_error, None);
    }

    #[test]
    fn test_stop_from_any_phase() {
        let c = controller(fast_settings());
        for _ in 0..3 {
            c.record_failure(ErrorCode::ConnectFailed);
        }
        c.mark_stopped();
        assert_eq!(c.phase(), Phase::Stopped);
        assert_eq!(c.check_attempt(), AttemptDecision::Refused);
        c.reset();
        assert_eq!(c.phase(), Phase::Idle);
        assert_eq!(c.snapshot().consecutive_failures, 0);
    }

    #[test]
    fn test_transitions_publish_status() {
        let store = Arc::new(StatusStore::new());
        let c = ReconnectController::new("cam-1", fast_settings(), store.clone());
        c.mark_connecting();
        let value = store.get("cam:cam-1:status").unwrap();
        assert_eq!(value["phase"], "CONNECTING");
        c.record_failure(ErrorCode::ReadTimeout);
        let value = store.get("cam:cam-1:status").unwrap();
        assert_eq!(value["phase"], "COOLDOWN");
        assert_eq!(value["last_error"], "READ_TIMEOUT");
    }
}
