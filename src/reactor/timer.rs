//! Timer registration on the host event loop
//!
//! Maps abstract one-shot/periodic timer requests onto tokio sleep tasks.
//! The service exclusively owns every task it spawns and is the only
//! entity allowed to tear one down.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::CallbackAction;

/// Opaque timer identity
///
/// Allocated from a process-wide counter so an id can never collide with
/// a concurrently live registration owned by someone else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

impl TimerId {
    /// Allocate a fresh timer identity
    pub fn new() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TimerId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for TimerId {
    fn default() -> Self {
        Self::new()
    }
}

/// Firing behavior of a timer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// Fires once, then deregisters itself
    OneShot,
    /// Fires every interval until removed or the callback returns
    /// [`CallbackAction::Stop`]
    Periodic,
}

struct TimerEntry {
    epoch: u64,
    task: JoinHandle<()>,
}

struct TimerTable {
    entries: HashMap<TimerId, TimerEntry>,
    next_epoch: u64,
}

impl Drop for TimerTable {
    fn drop(&mut self) {
        // Force-deregister everything so no callback can fire into a
        // partially destroyed object graph.
        for (_, entry) in self.entries.drain() {
            entry.task.abort();
        }
    }
}

/// Maps timer identities onto native timer tasks
#[derive(Clone)]
pub(crate) struct TimerService {
    inner: Rc<RefCell<TimerTable>>,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(TimerTable {
                entries: HashMap::new(),
                next_epoch: 0,
            })),
        }
    }

    /// Register a timer. Must be called on the loop thread, inside a
    /// `LocalSet`.
    pub(crate) fn add(
        &self,
        id: TimerId,
        interval: Duration,
        kind: TimerKind,
        mut callback: impl FnMut() -> CallbackAction + 'static,
    ) {
        let mut table = self.inner.borrow_mut();
        if table.entries.contains_key(&id) {
            // Double registration is a caller bug; keep the existing one.
            debug_assert!(false, "timer {id:?} registered twice");
            tracing::warn!(?id, "ignoring duplicate timer registration");
            return;
        }

        let epoch = table.next_epoch;
        table.next_epoch += 1;

        let slot = Rc::downgrade(&self.inner);
        let task = tokio::task::spawn_local(async move {
            match kind {
                TimerKind::OneShot => {
                    tokio::time::sleep(interval).await;
                    let _ = callback();
                }
                TimerKind::Periodic => {
                    // Fixed deadlines, so ticks do not drift by callback
                    // latency the way chained sleeps would.
                    let first = tokio::time::Instant::now() + interval;
                    let mut ticks = tokio::time::interval_at(first, interval);
                    loop {
                        ticks.tick().await;
                        if callback() == CallbackAction::Stop {
                            break;
                        }
                    }
                }
            }
            remove_if_current(&slot, id, epoch);
        });

        table.entries.insert(id, TimerEntry { epoch, task });
    }

    /// Remove a timer, preventing any further fires.
    pub(crate) fn del(&self, id: TimerId) {
        let mut table = self.inner.borrow_mut();
        match table.entries.remove(&id) {
            Some(entry) => entry.task.abort(),
            None => {
                debug_assert!(false, "removal of unregistered timer {id:?}");
                tracing::warn!(?id, "ignoring removal of unregistered timer");
            }
        }
    }

    pub(crate) fn is_registered(&self, id: TimerId) -> bool {
        self.inner.borrow().entries.contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.borrow().entries.len()
    }
}

/// Self-deregistration path for tasks that ran to completion. The epoch
/// guard keeps a finished task from removing a newer registration that
/// reused the same id.
fn remove_if_current(slot: &Weak<RefCell<TimerTable>>, id: TimerId, epoch: u64) {
    if let Some(table) = slot.upgrade() {
        let mut table = table.borrow_mut();
        if table.entries.get(&id).map(|e| e.epoch) == Some(epoch) {
            table.entries.remove(&id);
        }
    }
}
