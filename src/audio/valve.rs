//! Signal valves: on/off switches placed in an audio path

use std::cell::Cell;
use std::rc::Rc;

use tokio::sync::mpsc::UnboundedSender;

/// A logical on/off switch in a signal path
pub trait SignalValve {
    fn set_open(&mut self, open: bool);
    fn is_open(&self) -> bool;
}

struct GateShared<T> {
    label: &'static str,
    open: Cell<bool>,
    sink: UnboundedSender<T>,
}

/// Channel-backed valve: items pushed while open are forwarded to the
/// sink, items pushed while closed are dropped.
///
/// Clones share one gate, so one clone can sit behind the arbiter as a
/// [`SignalValve`] while another feeds samples through it. Gates start
/// closed.
pub struct GateValve<T> {
    shared: Rc<GateShared<T>>,
}

impl<T> GateValve<T> {
    pub fn new(label: &'static str, sink: UnboundedSender<T>) -> Self {
        Self {
            shared: Rc::new(GateShared {
                label,
                open: Cell::new(false),
                sink,
            }),
        }
    }

    /// Forward `item` to the sink if the gate is open. Returns whether
    /// the item passed through.
    pub fn push(&self, item: T) -> bool {
        if !self.shared.open.get() {
            return false;
        }
        self.shared.sink.send(item).is_ok()
    }
}

impl<T> Clone for GateValve<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> SignalValve for GateValve<T> {
    fn set_open(&mut self, open: bool) {
        if self.shared.open.get() != open {
            tracing::debug!(gate = self.shared.label, open, "gate switched");
        }
        self.shared.open.set(open);
    }

    fn is_open(&self) -> bool {
        self.shared.open.get()
    }
}
