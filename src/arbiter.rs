//! Transmit arbitration
//!
//! Combines manual keying, voice activation and connection state into a
//! single transmit decision and executes the side effects that realize
//! it: gate switching and, under half duplex, handing the hardware back
//! and forth between the receive and transmit paths.
//!
//! The half-duplex switch order is a hard contract: the receive path is
//! torn down before the microphone opens, the transmit gate opens last
//! on key-down and closes first on key-up. Reordering these steps has
//! been observed to break hardware recovery on real devices.

use tokio::sync::mpsc::UnboundedSender;

use crate::audio::{AudioEndpoint, SignalValve};
use crate::config::DuplexPolicy;

/// State of the link to the remote station
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

/// Notifications emitted by the arbiter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArbiterEvent {
    /// The transmit decision changed
    TransmitChanged(bool),
    /// A device failed to open while applying a decision; the dependent
    /// gate was left closed
    DeviceError(String),
}

/// Resolves the activation signals into one transmit decision and owns
/// every device open/close transition on the audio path
pub struct TransmitArbiter {
    policy: DuplexPolicy,
    connection: ConnectionState,
    manual_key: bool,
    vad_active: bool,
    transmitting: bool,
    applying: bool,
    tx_gate: Box<dyn SignalValve>,
    rx_gate: Box<dyn SignalValve>,
    microphone: Box<dyn AudioEndpoint>,
    speaker: Box<dyn AudioEndpoint>,
    events: UnboundedSender<ArbiterEvent>,
}

impl TransmitArbiter {
    /// Build an arbiter over its collaborators. Gates are expected to
    /// start closed; call [`start`](Self::start) to prime the receive
    /// path.
    pub fn new(
        policy: DuplexPolicy,
        tx_gate: Box<dyn SignalValve>,
        rx_gate: Box<dyn SignalValve>,
        microphone: Box<dyn AudioEndpoint>,
        speaker: Box<dyn AudioEndpoint>,
        events: UnboundedSender<ArbiterEvent>,
    ) -> Self {
        Self {
            policy,
            connection: ConnectionState::Disconnected,
            manual_key: false,
            vad_active: false,
            transmitting: false,
            applying: false,
            tx_gate,
            rx_gate,
            microphone,
            speaker,
            events,
        }
    }

    /// Open the initial receive path: speaker plus receive gate, and
    /// under full duplex the microphone as well (it stays open for the
    /// whole session in that mode).
    pub fn start(&mut self) {
        if self.policy == DuplexPolicy::Full {
            if let Err(e) = self.microphone.open() {
                self.report_device_error("microphone", &e.to_string());
            }
        }
        match self.speaker.open() {
            Ok(()) => self.rx_gate.set_open(true),
            Err(e) => self.report_device_error("speaker", &e.to_string()),
        }
    }

    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }

    pub fn connection(&self) -> ConnectionState {
        self.connection
    }

    pub fn policy(&self) -> DuplexPolicy {
        self.policy
    }

    /// Feed a connection-state change. Leaving the connected state
    /// forces the transmit decision off regardless of the activation
    /// signals, so a torn-down link can never stay keyed.
    pub fn connection_changed(&mut self, state: ConnectionState) {
        self.connection = state;
        self.reevaluate();
    }

    /// Feed a manual key edge
    pub fn set_manual_key(&mut self, pressed: bool) {
        self.manual_key = pressed;
        self.reevaluate();
    }

    /// Feed the voice-activation signal (detector enabled and not idle)
    pub fn set_vad_active(&mut self, active: bool) {
        self.vad_active = active;
        self.reevaluate();
    }

    fn reevaluate(&mut self) {
        let should_transmit = self.connection == ConnectionState::Connected
            && (self.manual_key || self.vad_active);
        self.apply(should_transmit);
    }

    /// Apply a transmit decision. Idempotent: re-applying the current
    /// decision performs no gate or device calls at all.
    fn apply(&mut self, transmit: bool) {
        if self.transmitting == transmit {
            return;
        }
        // The arbiter is not designed for overlapping invocations on the
        // same audio path.
        debug_assert!(!self.applying, "transmit arbiter invoked re-entrantly");
        if self.applying {
            return;
        }
        self.applying = true;
        self.transmitting = transmit;

        if transmit {
            if self.policy == DuplexPolicy::Half {
                self.rx_gate.set_open(false);
                self.speaker.close();
                match self.microphone.open() {
                    Ok(()) => self.tx_gate.set_open(true),
                    Err(e) => self.report_device_error("microphone", &e.to_string()),
                }
            } else {
                self.tx_gate.set_open(true);
            }
        } else {
            self.tx_gate.set_open(false);
            if self.policy == DuplexPolicy::Half {
                self.microphone.close();
                match self.speaker.open() {
                    Ok(()) => self.rx_gate.set_open(true),
                    Err(e) => self.report_device_error("speaker", &e.to_string()),
                }
            }
        }

        tracing::info!(transmit, "transmit decision applied");
        let _ = self.events.send(ArbiterEvent::TransmitChanged(transmit));
        self.applying = false;
    }

    fn report_device_error(&self, device: &str, message: &str) {
        tracing::warn!("could not open {device} device: {message}");
        let _ = self
            .events
            .send(ArbiterEvent::DeviceError(format!("{device}: {message}")));
    }
}
