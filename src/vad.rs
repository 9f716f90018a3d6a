//! Voice activity detection
//!
//! Classifies a stream of audio sample blocks into idle/active/hang with
//! a level threshold and hang-time hysteresis. The hang timer lives on
//! the reactor; only the detector's own processing and timeout paths
//! mutate its state.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedSender;

use crate::config::VadConfig;
use crate::constants::{LEVEL_CEILING_DB, LEVEL_FLOOR_DB};
use crate::reactor::{CallbackAction, Reactor, TimerId, TimerKind};

/// Detector state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadState {
    /// No voice detected
    Idle,
    /// Level above threshold
    Active,
    /// Level dropped below threshold; waiting out the hang time
    Hang,
}

/// Notifications emitted by the detector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VadEvent {
    /// Measured block level in dB; emitted for every processed block
    Level(i32),
    /// State transition; emitted on transitions only
    State(VadState),
}

struct VadInner {
    reactor: Reactor,
    events: UnboundedSender<VadEvent>,
    enabled: bool,
    threshold_db: i32,
    hang_delay: Duration,
    state: VadState,
    hang_timer: Option<TimerId>,
}

/// Level-threshold voice activity detector with hang-time hysteresis
pub struct VoiceActivityDetector {
    inner: Rc<RefCell<VadInner>>,
}

impl VoiceActivityDetector {
    pub fn new(reactor: Reactor, config: &VadConfig, events: UnboundedSender<VadEvent>) -> Self {
        let detector = Self {
            inner: Rc::new(RefCell::new(VadInner {
                reactor,
                events,
                enabled: config.enabled,
                threshold_db: 0,
                hang_delay: Duration::ZERO,
                state: VadState::Idle,
                hang_timer: None,
            })),
        };
        detector.set_threshold_db(config.threshold_db);
        detector.set_hang_delay(config.hang_delay());
        detector
    }

    pub fn state(&self) -> VadState {
        self.inner.borrow().state
    }

    pub fn enabled(&self) -> bool {
        self.inner.borrow().enabled
    }

    pub fn threshold_db(&self) -> i32 {
        self.inner.borrow().threshold_db
    }

    pub fn hang_delay(&self) -> Duration {
        self.inner.borrow().hang_delay
    }

    /// Whether the detector currently votes for transmission
    pub fn is_active(&self) -> bool {
        let inner = self.inner.borrow();
        inner.enabled && inner.state != VadState::Idle
    }

    /// Enable or disable the detector. Disabling forces an immediate
    /// transition to idle and cancels any pending hang timer.
    pub fn set_enabled(&self, enable: bool) {
        let mut inner = self.inner.borrow_mut();
        inner.enabled = enable;
        if !enable {
            let _ = inner.events.send(VadEvent::Level(LEVEL_FLOOR_DB));
            Self::apply_state(&mut inner, &self.inner, VadState::Idle);
        }
    }

    /// Set the activation threshold; out-of-range values are clamped to
    /// the reportable level range.
    pub fn set_threshold_db(&self, threshold_db: i32) {
        self.inner.borrow_mut().threshold_db =
            threshold_db.clamp(LEVEL_FLOOR_DB, LEVEL_CEILING_DB);
    }

    /// Set the hang time applied when the level drops below threshold
    pub fn set_hang_delay(&self, delay: Duration) {
        self.inner.borrow_mut().hang_delay = delay;
    }

    /// Process one block of samples.
    ///
    /// Emits a level notification for every block; while disabled the
    /// emitted level is pinned to the floor and no transitions occur.
    pub fn process_block(&self, samples: &[f32]) {
        debug_assert!(!samples.is_empty(), "empty audio block");
        if samples.is_empty() {
            return;
        }

        let mut inner = self.inner.borrow_mut();
        let level = if inner.enabled {
            block_level_db(samples)
        } else {
            LEVEL_FLOOR_DB
        };
        let _ = inner.events.send(VadEvent::Level(level));
        if !inner.enabled {
            return;
        }

        if level > inner.threshold_db {
            Self::apply_state(&mut inner, &self.inner, VadState::Active);
        } else if inner.state == VadState::Active {
            Self::apply_state(&mut inner, &self.inner, VadState::Hang);
        }
    }

    /// State transition with hang-timer bookkeeping. Entering hang arms
    /// exactly one one-shot timer; leaving it for any reason cancels the
    /// timer, so a re-activation restarts the full hang window on the
    /// next drop.
    fn apply_state(inner: &mut VadInner, handle: &Rc<RefCell<VadInner>>, new_state: VadState) {
        if inner.state == new_state {
            return;
        }

        if let Some(id) = inner.hang_timer.take() {
            inner.reactor.del_timer(id);
        }

        if new_state == VadState::Hang {
            let id = TimerId::new();
            let weak = Rc::downgrade(handle);
            inner
                .reactor
                .add_timer(id, inner.hang_delay, TimerKind::OneShot, move || {
                    if let Some(strong) = weak.upgrade() {
                        let mut inner = strong.borrow_mut();
                        // The firing one-shot deregisters itself; only
                        // clear the slot so the transition below does not
                        // try to cancel it again.
                        inner.hang_timer = None;
                        VoiceActivityDetector::apply_state(&mut inner, &strong, VadState::Idle);
                    }
                    CallbackAction::Stop
                });
            inner.hang_timer = Some(id);
        }

        inner.state = new_state;
        let _ = inner.events.send(VadEvent::State(new_state));
    }
}

/// Block level in dB: mean absolute deviation from the block mean,
/// clamped to [floor, 0]. Truncation toward zero matches the original
/// integer-level metering this detector is calibrated against.
fn block_level_db(samples: &[f32]) -> i32 {
    let n = samples.len() as f32;
    let dc_offset = samples.iter().sum::<f32>() / n;
    let avg = samples.iter().map(|s| (s - dc_offset).abs()).sum::<f32>() / n;

    if avg > 1.0 {
        LEVEL_CEILING_DB
    } else if avg > 0.001 {
        (20.0 * avg.log10()) as i32
    } else {
        LEVEL_FLOOR_DB
    }
}
