//! Event reactor: the application's single multiplexing point
//!
//! Adapts the host event loop (a current-thread tokio runtime) into two
//! abstract primitives: timers and descriptor watches. Registration and
//! removal are idempotent at the map level; every native handle the
//! reactor creates is owned exclusively by the reactor and force-removed
//! on teardown.
//!
//! The reactor is deliberately `!Send`: every registration, removal and
//! callback runs on the one thread that drives the loop, which is the
//! entire locking discipline this core needs.

pub mod timer;
pub mod watch;

use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::ReactorError;

pub use timer::{TimerId, TimerKind};
pub use watch::WatchDirection;

/// Continue/stop signal returned by timer and watch callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackAction {
    /// Keep the registration armed
    Continue,
    /// Deregister after this invocation
    Stop,
}

/// The application's event multiplexer
///
/// Cheap to clone; clones share one underlying registration table. The
/// table tears down (aborting every pending timer and watch) when the
/// last handle drops.
///
/// All methods must be called on the loop thread, inside a
/// [`tokio::task::LocalSet`].
#[derive(Clone)]
pub struct Reactor {
    timers: timer::TimerService,
    watches: watch::IoWatchService,
}

impl Reactor {
    pub fn new() -> Self {
        Self {
            timers: timer::TimerService::new(),
            watches: watch::IoWatchService::new(),
        }
    }

    /// Register a timer that invokes `callback` on every tick.
    ///
    /// One-shot timers deregister themselves after the single fire;
    /// periodic timers run until removed or until the callback returns
    /// [`CallbackAction::Stop`]. Registering an id that is already live
    /// is a caller bug: it trips a debug assertion and is ignored in
    /// release builds.
    pub fn add_timer(
        &self,
        id: TimerId,
        interval: Duration,
        kind: TimerKind,
        callback: impl FnMut() -> CallbackAction + 'static,
    ) {
        self.timers.add(id, interval, kind, callback);
    }

    /// Remove a timer. Removing an id that is not registered is a
    /// caller bug (debug assertion; ignored in release builds).
    pub fn del_timer(&self, id: TimerId) {
        self.timers.del(id);
    }

    /// Whether `id` currently has a live registration
    pub fn timer_registered(&self, id: TimerId) -> bool {
        self.timers.is_registered(id)
    }

    /// Register interest in a descriptor's readiness for one direction.
    ///
    /// The callback fires on every readiness event for as long as it
    /// returns [`CallbackAction::Continue`]. The caller keeps ownership
    /// of the descriptor and must keep it open while watched.
    pub fn add_watch(
        &self,
        fd: RawFd,
        direction: WatchDirection,
        callback: impl FnMut() -> CallbackAction + 'static,
    ) -> Result<(), ReactorError> {
        self.watches.add(fd, direction, callback)
    }

    /// Remove a watch. Removing a watch that is not registered is a
    /// caller bug (debug assertion; ignored in release builds).
    pub fn del_watch(&self, fd: RawFd, direction: WatchDirection) {
        self.watches.del(fd, direction);
    }

    /// Whether `(fd, direction)` currently has a live registration
    pub fn watch_registered(&self, fd: RawFd, direction: WatchDirection) -> bool {
        self.watches.is_registered(fd, direction)
    }

    /// Number of live registrations (timers plus watches)
    pub fn registration_count(&self) -> usize {
        self.timers.len() + self.watches.len()
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    #[tokio::test(start_paused = true)]
    async fn test_reactor_composes_timers_and_watches() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let reactor = Reactor::new();
                let fired = Rc::new(Cell::new(0u32));
                let id = TimerId::new();

                let counter = fired.clone();
                reactor.add_timer(id, Duration::from_millis(20), TimerKind::Periodic, move || {
                    counter.set(counter.get() + 1);
                    CallbackAction::Continue
                });
                assert_eq!(reactor.registration_count(), 1);

                tokio::time::advance(Duration::from_millis(65)).await;
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }

                assert_eq!(fired.get(), 3);
                reactor.del_timer(id);
                assert_eq!(reactor.registration_count(), 0);
            })
            .await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_clones_share_registrations() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let reactor = Reactor::new();
                let handle = reactor.clone();
                let id = TimerId::new();

                reactor.add_timer(id, Duration::from_millis(10), TimerKind::OneShot, || {
                    CallbackAction::Stop
                });
                assert!(handle.timer_registered(id));

                handle.del_timer(id);
                assert!(!reactor.timer_registered(id));
            })
            .await;
    }
}
