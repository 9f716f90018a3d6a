//! Link session wiring
//!
//! Binds the reactor, resolver, voice activity detector and transmit
//! arbiter into one station-side session. The session consumes inbound
//! edges (key gestures, connection-state changes from the link layer,
//! remote audio, microphone blocks), recomputes the arbiter after every
//! one of them, and re-emits the user-facing notifications the embedding
//! UI needs. It never renders anything itself.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::arbiter::{ArbiterEvent, ConnectionState, TransmitArbiter};
use crate::audio::{
    AudioEndpoint, GateValve, MicrophoneEndpoint, PlaybackQueue, SampleBlock, SpeakerEndpoint,
};
use crate::config::{LinkConfig, PttMode};
use crate::reactor::Reactor;
use crate::resolver::{HostLookup, LookupResult, ResolveFn};
use crate::vad::{VadEvent, VadState, VoiceActivityDetector};

/// User-facing notifications from the session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Local transmit indicator
    TransmitChanged(bool),
    /// Remote-activity (receive) indicator
    ReceiveChanged(bool),
    /// Microphone level meter, in dB
    VadLevel(i32),
    /// Voice activity state for the indicator lamp
    VadState(VadState),
    /// Host lookup succeeded
    AddressResolved(Ipv4Addr),
    /// Informational text for the embedding UI (lookup failures, device
    /// warnings, connection progress)
    Info(String),
}

/// The audio-path collaborators a session arbitrates over
///
/// [`AudioPath::with_host_devices`] builds the cpal-backed production
/// path; tests assemble one from mocks.
pub struct AudioPath {
    pub tx_gate: GateValve<SampleBlock>,
    pub rx_gate: GateValve<SampleBlock>,
    pub microphone: Box<dyn AudioEndpoint>,
    pub speaker: Box<dyn AudioEndpoint>,
    /// Capture blocks arriving from the microphone endpoint
    pub mic_blocks: UnboundedReceiver<SampleBlock>,
    /// Blocks that passed the receive gate, headed for playback
    pub speaker_feed: UnboundedReceiver<SampleBlock>,
    /// Playback handle of the speaker endpoint, when there is one
    pub playback: Option<PlaybackQueue>,
}

impl AudioPath {
    /// Build the production path on the host's audio devices. Devices
    /// are looked up lazily; nothing is opened until the arbiter starts.
    pub fn with_host_devices(
        config: &LinkConfig,
        link_sink: UnboundedSender<SampleBlock>,
    ) -> Self {
        let (mic_tx, mic_blocks) = unbounded_channel();
        let (spkr_tx, speaker_feed) = unbounded_channel();

        let microphone = MicrophoneEndpoint::new(config.mic_device.clone(), mic_tx);
        let speaker = SpeakerEndpoint::new(config.speaker_device.clone());
        let playback = speaker.queue();

        Self {
            tx_gate: GateValve::new("transmit", link_sink),
            rx_gate: GateValve::new("receive", spkr_tx),
            microphone: Box::new(microphone),
            speaker: Box::new(speaker),
            mic_blocks,
            speaker_feed,
            playback: Some(playback),
        }
    }
}

/// One station-side voice link session
pub struct LinkSession {
    ptt_mode: PttMode,
    vad: VoiceActivityDetector,
    vad_rx: UnboundedReceiver<VadEvent>,
    arbiter: TransmitArbiter,
    arbiter_rx: UnboundedReceiver<ArbiterEvent>,
    lookup: HostLookup,
    lookup_rx: UnboundedReceiver<LookupResult>,
    tx_gate: GateValve<SampleBlock>,
    rx_gate: GateValve<SampleBlock>,
    mic_blocks: UnboundedReceiver<SampleBlock>,
    speaker_feed: UnboundedReceiver<SampleBlock>,
    playback: Option<PlaybackQueue>,
    key_active: bool,
    receiving: bool,
    remote_addr: Option<Ipv4Addr>,
    events: UnboundedSender<SessionEvent>,
}

impl LinkSession {
    /// Build a session resolving through the system resolver
    pub fn new(
        reactor: Reactor,
        config: &LinkConfig,
        path: AudioPath,
        events: UnboundedSender<SessionEvent>,
    ) -> Self {
        Self::with_resolver(reactor, config, path, events, crate::resolver::system_resolver())
    }

    /// Build a session with a custom resolve function
    pub fn with_resolver(
        reactor: Reactor,
        config: &LinkConfig,
        path: AudioPath,
        events: UnboundedSender<SessionEvent>,
        resolve: ResolveFn,
    ) -> Self {
        let (vad_tx, vad_rx) = unbounded_channel();
        let (arbiter_tx, arbiter_rx) = unbounded_channel();
        let (lookup_tx, lookup_rx) = unbounded_channel();

        let vad = VoiceActivityDetector::new(reactor, &config.vad, vad_tx);
        let arbiter = TransmitArbiter::new(
            config.duplex,
            Box::new(path.tx_gate.clone()),
            Box::new(path.rx_gate.clone()),
            path.microphone,
            path.speaker,
            arbiter_tx,
        );
        let lookup = HostLookup::with_resolver(lookup_tx, resolve);

        Self {
            ptt_mode: config.ptt_mode,
            vad,
            vad_rx,
            arbiter,
            arbiter_rx,
            lookup,
            lookup_rx,
            tx_gate: path.tx_gate,
            rx_gate: path.rx_gate,
            mic_blocks: path.mic_blocks,
            speaker_feed: path.speaker_feed,
            playback: path.playback,
            key_active: false,
            receiving: false,
            remote_addr: None,
            events,
        }
    }

    /// Prime the receive path; call once after construction.
    pub fn start(&mut self) {
        self.arbiter.start();
        self.pump();
    }

    pub fn is_transmitting(&self) -> bool {
        self.arbiter.is_transmitting()
    }

    pub fn is_receiving(&self) -> bool {
        self.receiving
    }

    pub fn remote_address(&self) -> Option<Ipv4Addr> {
        self.remote_addr
    }

    pub fn vad(&self) -> &VoiceActivityDetector {
        &self.vad
    }

    /// Start resolving the remote host. Must be called on the loop
    /// thread, inside a `LocalSet`.
    pub fn connect_to_host(&mut self, label: &str) {
        let _ = self
            .events
            .send(SessionEvent::Info(format!("Resolving {label}...")));
        self.lookup.start(label);
    }

    /// Feed a connection-state change from the link layer
    pub fn connection_changed(&mut self, state: ConnectionState) {
        let text = match state {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting...",
            ConnectionState::Connected => "Connected",
            ConnectionState::Disconnecting => "Disconnecting...",
        };
        let _ = self.events.send(SessionEvent::Info(text.to_string()));
        if matches!(
            state,
            ConnectionState::Disconnected | ConnectionState::Disconnecting
        ) {
            self.set_receiving(false);
        }
        self.arbiter.connection_changed(state);
        self.pump();
    }

    /// Manual key press edge. Hold mode keys while pressed; toggle mode
    /// flips the key state on every press.
    pub fn key_pressed(&mut self) {
        match self.ptt_mode {
            PttMode::Hold => self.set_key(true),
            PttMode::Toggle => {
                let flipped = !self.key_active;
                self.set_key(flipped);
            }
        }
    }

    /// Manual key release edge; ignored in toggle mode
    pub fn key_released(&mut self) {
        if self.ptt_mode == PttMode::Hold {
            self.set_key(false);
        }
    }

    pub fn set_vad_enabled(&mut self, enable: bool) {
        self.vad.set_enabled(enable);
        self.arbiter.set_vad_active(self.vad.is_active());
        self.pump();
    }

    pub fn set_vad_threshold_db(&mut self, threshold_db: i32) {
        self.vad.set_threshold_db(threshold_db);
    }

    pub fn set_vad_hang_delay(&mut self, delay: Duration) {
        self.vad.set_hang_delay(delay);
    }

    /// Feed the remote receive indicator from the link layer
    pub fn set_receiving(&mut self, receiving: bool) {
        if self.receiving == receiving {
            return;
        }
        self.receiving = receiving;
        let _ = self.events.send(SessionEvent::ReceiveChanged(receiving));
    }

    /// Feed a block of remote audio toward the speaker; dropped while
    /// the receive gate is closed
    pub fn handle_remote_block(&mut self, block: SampleBlock) {
        self.rx_gate.push(block);
    }

    /// Drain every pending notification and input block once.
    pub fn pump(&mut self) {
        while let Ok(block) = self.mic_blocks.try_recv() {
            self.vad.process_block(&block);
            self.tx_gate.push(block);
        }

        while let Ok(event) = self.vad_rx.try_recv() {
            match event {
                VadEvent::Level(db) => {
                    let _ = self.events.send(SessionEvent::VadLevel(db));
                }
                VadEvent::State(state) => {
                    let _ = self.events.send(SessionEvent::VadState(state));
                    self.arbiter
                        .set_vad_active(self.vad.enabled() && state != VadState::Idle);
                }
            }
        }

        while let Ok(event) = self.arbiter_rx.try_recv() {
            match event {
                ArbiterEvent::TransmitChanged(on) => {
                    let _ = self.events.send(SessionEvent::TransmitChanged(on));
                }
                ArbiterEvent::DeviceError(message) => {
                    let _ = self
                        .events
                        .send(SessionEvent::Info(format!("Warning: {message}")));
                }
            }
        }

        while let Ok(result) = self.lookup_rx.try_recv() {
            self.handle_lookup_result(result);
        }

        while let Ok(block) = self.speaker_feed.try_recv() {
            if let Some(playback) = &self.playback {
                playback.push_block(&block);
            }
        }
    }

    /// Drive the session forever. The short sleep keeps the loop
    /// cooperative without busy-waiting, the way the capture loops in
    /// this crate's lineage do.
    pub async fn run(&mut self) {
        loop {
            self.pump();
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }

    fn set_key(&mut self, active: bool) {
        self.key_active = active;
        self.arbiter.set_manual_key(active);
        self.pump();
    }

    fn handle_lookup_result(&mut self, result: LookupResult) {
        if result.failed || result.addresses.is_empty() {
            let _ = self.events.send(SessionEvent::Info(format!(
                "Host lookup failed for {}",
                result.label
            )));
            return;
        }
        let addr = result.addresses[0];
        self.remote_addr = Some(addr);
        let _ = self.events.send(SessionEvent::AddressResolved(addr));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AudioError;
    use std::rc::Rc;
    use tokio::sync::mpsc::error::TryRecvError;

    struct NullEndpoint {
        open: bool,
    }

    impl AudioEndpoint for NullEndpoint {
        fn open(&mut self) -> Result<(), AudioError> {
            self.open = true;
            Ok(())
        }

        fn close(&mut self) {
            self.open = false;
        }

        fn is_open(&self) -> bool {
            self.open
        }
    }

    struct Fixture {
        session: LinkSession,
        events: UnboundedReceiver<SessionEvent>,
        mic_tx: UnboundedSender<SampleBlock>,
        link_rx: UnboundedReceiver<SampleBlock>,
    }

    fn fixture(config: LinkConfig) -> Fixture {
        fixture_with_resolver(config, crate::resolver::system_resolver())
    }

    fn fixture_with_resolver(config: LinkConfig, resolve: ResolveFn) -> Fixture {
        let (link_tx, link_rx) = unbounded_channel();
        let (mic_tx, mic_blocks) = unbounded_channel();
        let (spkr_tx, speaker_feed) = unbounded_channel();
        let path = AudioPath {
            tx_gate: GateValve::new("transmit", link_tx),
            rx_gate: GateValve::new("receive", spkr_tx),
            microphone: Box::new(NullEndpoint { open: false }),
            speaker: Box::new(NullEndpoint { open: false }),
            mic_blocks,
            speaker_feed,
            playback: None,
        };
        let (events_tx, events) = unbounded_channel();
        let mut session =
            LinkSession::with_resolver(Reactor::new(), &config, path, events_tx, resolve);
        session.start();
        Fixture {
            session,
            events,
            mic_tx,
            link_rx,
        }
    }

    fn drain(rx: &mut UnboundedReceiver<SessionEvent>) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            events.push(ev);
        }
        events
    }

    fn loud_block() -> SampleBlock {
        let mut block = vec![0.3f32; 64];
        for sample in block.iter_mut().skip(1).step_by(2) {
            *sample = -0.3;
        }
        block
    }

    #[test]
    fn test_hold_mode_keys_while_pressed() {
        let mut fx = fixture(LinkConfig::default());
        fx.session.connection_changed(ConnectionState::Connected);
        drain(&mut fx.events);

        fx.session.key_pressed();
        assert!(fx.session.is_transmitting());
        assert!(drain(&mut fx.events).contains(&SessionEvent::TransmitChanged(true)));

        fx.session.key_released();
        assert!(!fx.session.is_transmitting());
        assert!(drain(&mut fx.events).contains(&SessionEvent::TransmitChanged(false)));
    }

    #[test]
    fn test_toggle_mode_flips_on_press() {
        let config = LinkConfig {
            ptt_mode: PttMode::Toggle,
            ..LinkConfig::default()
        };
        let mut fx = fixture(config);
        fx.session.connection_changed(ConnectionState::Connected);

        fx.session.key_pressed();
        fx.session.key_released();
        assert!(fx.session.is_transmitting());

        fx.session.key_pressed();
        assert!(!fx.session.is_transmitting());
    }

    #[test]
    fn test_key_without_connection_does_not_transmit() {
        let mut fx = fixture(LinkConfig::default());
        fx.session.key_pressed();
        assert!(!fx.session.is_transmitting());
    }

    #[test]
    fn test_mic_blocks_pass_only_while_transmitting() {
        let mut fx = fixture(LinkConfig::default());
        fx.session.connection_changed(ConnectionState::Connected);

        fx.mic_tx.send(loud_block()).unwrap();
        fx.session.pump();
        assert!(matches!(fx.link_rx.try_recv(), Err(TryRecvError::Empty)));

        fx.session.key_pressed();
        fx.mic_tx.send(loud_block()).unwrap();
        fx.session.pump();
        assert!(fx.link_rx.try_recv().is_ok());
    }

    #[test]
    fn test_vad_activation_keys_transmitter() {
        let config = LinkConfig {
            vad: crate::config::VadConfig {
                enabled: true,
                threshold_db: -30,
                hang_ms: 1000,
            },
            ..LinkConfig::default()
        };
        let mut fx = fixture(config);
        fx.session.connection_changed(ConnectionState::Connected);
        drain(&mut fx.events);

        fx.mic_tx.send(loud_block()).unwrap();
        fx.session.pump();

        assert!(fx.session.is_transmitting());
        let events = drain(&mut fx.events);
        assert!(events.contains(&SessionEvent::VadState(VadState::Active)));
        assert!(events.contains(&SessionEvent::TransmitChanged(true)));
    }

    #[test]
    fn test_disconnect_kills_transmission() {
        let mut fx = fixture(LinkConfig::default());
        fx.session.connection_changed(ConnectionState::Connected);
        fx.session.key_pressed();
        assert!(fx.session.is_transmitting());

        fx.session.connection_changed(ConnectionState::Disconnecting);
        assert!(!fx.session.is_transmitting());
    }

    #[test]
    fn test_receive_indicator_dedupes() {
        let mut fx = fixture(LinkConfig::default());
        drain(&mut fx.events);

        fx.session.set_receiving(true);
        fx.session.set_receiving(true);
        fx.session.set_receiving(false);

        let changes: Vec<_> = drain(&mut fx.events)
            .into_iter()
            .filter(|ev| matches!(ev, SessionEvent::ReceiveChanged(_)))
            .collect();
        assert_eq!(
            changes,
            vec![
                SessionEvent::ReceiveChanged(true),
                SessionEvent::ReceiveChanged(false)
            ]
        );
    }

    #[tokio::test]
    async fn test_lookup_failure_becomes_info_event() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let failing: ResolveFn = Rc::new(|_label: String| {
                    use futures_util::FutureExt;
                    async {
                        Err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "host not found",
                        ))
                    }
                    .boxed_local()
                });
                let mut fx = fixture_with_resolver(LinkConfig::default(), failing);

                fx.session.connect_to_host("nowhere.example.org");
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                fx.session.pump();

                let events = drain(&mut fx.events);
                assert!(events.iter().any(|ev| matches!(
                    ev,
                    SessionEvent::Info(text) if text.contains("lookup failed")
                )));
                assert!(fx.session.remote_address().is_none());
            })
            .await;
    }

    #[tokio::test]
    async fn test_lookup_success_resolves_address() {
        tokio::task::LocalSet::new()
            .run_until(async {
                let fixed: ResolveFn = Rc::new(|_label: String| {
                    use futures_util::FutureExt;
                    async { Ok(vec!["203.0.113.9".parse().unwrap()]) }.boxed_local()
                });
                let mut fx = fixture_with_resolver(LinkConfig::default(), fixed);

                fx.session.connect_to_host("peer.example.org");
                for _ in 0..5 {
                    tokio::task::yield_now().await;
                }
                fx.session.pump();

                let expected: Ipv4Addr = "203.0.113.9".parse().unwrap();
                assert_eq!(fx.session.remote_address(), Some(expected));
                let events = drain(&mut fx.events);
                assert!(events.contains(&SessionEvent::AddressResolved(expected)));
            })
            .await;
    }

    #[test]
    fn test_remote_blocks_dropped_while_transmitting_half_duplex() {
        let mut fx = fixture(LinkConfig::default());
        fx.session.connection_changed(ConnectionState::Connected);
        fx.session.key_pressed();

        // Receive gate is closed during half-duplex transmit; the block
        // must be discarded, not queued behind the switch.
        fx.session.handle_remote_block(vec![0.1; 16]);
        fx.session.pump();
        assert!(fx.session.is_transmitting());
    }
}
