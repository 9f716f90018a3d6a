//! Descriptor readiness watches on the host event loop
//!
//! Maps abstract (descriptor, direction) watches onto tokio `AsyncFd`
//! registrations. Read and write watches on the same descriptor have
//! independent lifetimes, but epoll refuses to register one descriptor
//! twice, so a single driver task per descriptor serves both directions
//! and awaits only the union of the directions currently watched.

use std::cell::RefCell;
use std::collections::HashMap;
use std::os::fd::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};

use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::error::ReactorError;

use super::CallbackAction;

/// Direction of interest in a descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WatchDirection {
    /// Wake when the descriptor becomes readable (or hits EOF/error)
    Read,
    /// Wake when the descriptor becomes writable (or hits an error)
    Write,
}

type WatchCallback = Rc<RefCell<Box<dyn FnMut() -> CallbackAction>>>;

/// Descriptor wrapper for `AsyncFd` registration. Does not own the
/// descriptor; the caller keeps it open for the lifetime of the watch.
struct BorrowedSource(RawFd);

impl AsRawFd for BorrowedSource {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

struct Driver {
    epoch: u64,
    notify: Rc<Notify>,
    task: JoinHandle<()>,
}

struct WatchTable {
    read: HashMap<RawFd, WatchCallback>,
    write: HashMap<RawFd, WatchCallback>,
    drivers: HashMap<RawFd, Driver>,
    next_epoch: u64,
}

impl WatchTable {
    fn slots(&mut self, direction: WatchDirection) -> &mut HashMap<RawFd, WatchCallback> {
        match direction {
            WatchDirection::Read => &mut self.read,
            WatchDirection::Write => &mut self.write,
        }
    }

    /// Union of the directions currently watched for `fd`, or `None`
    /// when the descriptor has no watchers left.
    fn wanted_interest(&self, fd: RawFd) -> Option<Interest> {
        let mut interest = None;
        if self.read.contains_key(&fd) {
            interest = Some(Interest::READABLE);
        }
        if self.write.contains_key(&fd) {
            interest = Some(match interest {
                Some(i) => i.add(Interest::WRITABLE),
                None => Interest::WRITABLE,
            });
        }
        interest
    }
}

impl Drop for WatchTable {
    fn drop(&mut self) {
        for (_, driver) in self.drivers.drain() {
            driver.task.abort();
        }
        self.read.clear();
        self.write.clear();
    }
}

/// Maps (descriptor, direction) watches onto native readiness sources
#[derive(Clone)]
pub(crate) struct IoWatchService {
    inner: Rc<RefCell<WatchTable>>,
}

impl IoWatchService {
    pub(crate) fn new() -> Self {
        Self {
            inner: Rc::new(RefCell::new(WatchTable {
                read: HashMap::new(),
                write: HashMap::new(),
                drivers: HashMap::new(),
                next_epoch: 0,
            })),
        }
    }

    /// Register interest in a descriptor's readiness. Must be called on
    /// the loop thread, inside a `LocalSet`.
    pub(crate) fn add(
        &self,
        fd: RawFd,
        direction: WatchDirection,
        callback: impl FnMut() -> CallbackAction + 'static,
    ) -> Result<(), ReactorError> {
        let mut table = self.inner.borrow_mut();
        if table.slots(direction).contains_key(&fd) {
            debug_assert!(false, "watch ({fd}, {direction:?}) registered twice");
            tracing::warn!(fd, ?direction, "ignoring duplicate watch registration");
            return Ok(());
        }

        let callback: Box<dyn FnMut() -> CallbackAction> = Box::new(callback);

        if let Some(notify) = table.drivers.get(&fd).map(|d| d.notify.clone()) {
            // A driver for this descriptor is already running; give it
            // the new slot and re-arm it.
            table
                .slots(direction)
                .insert(fd, Rc::new(RefCell::new(callback)));
            notify.notify_one();
            return Ok(());
        }

        // Register with the full interest set up front; the driver only
        // ever awaits the directions that are actually watched.
        let afd = AsyncFd::with_interest(
            BorrowedSource(fd),
            Interest::READABLE.add(Interest::WRITABLE),
        )
        .map_err(|source| ReactorError::WatchRegistration { fd, source })?;

        table
            .slots(direction)
            .insert(fd, Rc::new(RefCell::new(callback)));

        let epoch = table.next_epoch;
        table.next_epoch += 1;

        let notify = Rc::new(Notify::new());
        let task = tokio::task::spawn_local(drive_fd(
            afd,
            fd,
            epoch,
            notify.clone(),
            Rc::downgrade(&self.inner),
        ));
        table.drivers.insert(fd, Driver { epoch, notify, task });

        Ok(())
    }

    /// Remove a watch. The callback can no longer fire once this
    /// returns; the driver task winds down on its own.
    pub(crate) fn del(&self, fd: RawFd, direction: WatchDirection) {
        let mut table = self.inner.borrow_mut();
        match table.slots(direction).remove(&fd) {
            Some(_) => {
                if let Some(driver) = table.drivers.get(&fd) {
                    driver.notify.notify_one();
                }
            }
            None => {
                debug_assert!(false, "removal of unregistered watch ({fd}, {direction:?})");
                tracing::warn!(fd, ?direction, "ignoring removal of unregistered watch");
            }
        }
    }

    pub(crate) fn is_registered(&self, fd: RawFd, direction: WatchDirection) -> bool {
        let mut table = self.inner.borrow_mut();
        table.slots(direction).contains_key(&fd)
    }

    pub(crate) fn len(&self) -> usize {
        let table = self.inner.borrow();
        table.read.len() + table.write.len()
    }
}

/// Per-descriptor driver: waits for whichever directions are watched,
/// dispatches to their callbacks, and exits once no watcher remains.
async fn drive_fd(
    afd: AsyncFd<BorrowedSource>,
    fd: RawFd,
    epoch: u64,
    notify: Rc<Notify>,
    table: Weak<RefCell<WatchTable>>,
) {
    loop {
        let wanted = match table.upgrade() {
            Some(strong) => strong.borrow().wanted_interest(fd),
            None => return,
        };
        let Some(wanted) = wanted else { break };

        tokio::select! {
            guard = afd.ready(wanted) => {
                let mut guard = match guard {
                    Ok(guard) => guard,
                    Err(e) => {
                        tracing::error!(fd, "descriptor watch failed: {e}");
                        break;
                    }
                };
                let ready = guard.ready();
                if ready.is_readable() || ready.is_read_closed() {
                    dispatch(&table, fd, WatchDirection::Read);
                }
                if ready.is_writable() || ready.is_write_closed() {
                    dispatch(&table, fd, WatchDirection::Write);
                }
                guard.clear_ready();
            }
            _ = notify.notified() => {
                // Watch set changed; recompute the awaited interest.
            }
        }
    }

    // Self-deregistration; the epoch guard protects a newer driver that
    // reused the descriptor.
    if let Some(strong) = table.upgrade() {
        let mut table = strong.borrow_mut();
        if table.drivers.get(&fd).map(|d| d.epoch) == Some(epoch) {
            table.drivers.remove(&fd);
        }
    }
}

/// Invoke one direction's callback without holding the table borrow, so
/// the callback may itself add or remove watches.
fn dispatch(table: &Weak<RefCell<WatchTable>>, fd: RawFd, direction: WatchDirection) {
    let callback = match table.upgrade() {
        Some(strong) => {
            let mut t = strong.borrow_mut();
            t.slots(direction).get(&fd).cloned()
        }
        None => None,
    };
    let Some(callback) = callback else { return };

    let action = {
        let mut callback = callback.borrow_mut();
        (*callback)()
    };
    if action == CallbackAction::Stop {
        if let Some(strong) = table.upgrade() {
            strong.borrow_mut().slots(direction).remove(&fd);
        }
    }
}
