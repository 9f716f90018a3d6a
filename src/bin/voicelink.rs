//! Voicelink demo client
//!
//! Lists the host's audio devices, resolves the peer host given on the
//! command line, and runs a stdin push-to-talk loop over the local audio
//! path. The link transport itself is out of scope here; transmitted
//! blocks are counted instead of sent.

use anyhow::Result;
use std::os::fd::AsRawFd;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voicelink::{
    arbiter::ConnectionState,
    audio::device::list_devices,
    config::{LinkConfig, PttMode},
    reactor::{CallbackAction, Reactor, WatchDirection},
    session::{AudioPath, LinkSession, SessionEvent},
};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Voicelink");

    let local = tokio::task::LocalSet::new();
    local.run_until(run()).await
}

async fn run() -> Result<()> {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}", device.name, device_type, default_marker);
    }
    println!();

    let config = LinkConfig {
        // Each entered line flips the key; there is no key-up event on a
        // terminal.
        ptt_mode: PttMode::Toggle,
        ..LinkConfig::default()
    };

    let reactor = Reactor::new();
    let (events_tx, mut events_rx) = tokio::sync::mpsc::unbounded_channel();
    let (link_tx, mut link_rx) = tokio::sync::mpsc::unbounded_channel();

    let path = AudioPath::with_host_devices(&config, link_tx);
    let mut session = LinkSession::new(reactor.clone(), &config, path, events_tx);
    session.start();

    if let Some(host) = std::env::args().nth(1) {
        session.connect_to_host(&host);
    } else {
        tracing::info!("No host given; running without a lookup");
        session.connection_changed(ConnectionState::Connected);
    }

    // Each line on stdin is one push-to-talk gesture.
    let (ptt_tx, mut ptt_rx) = tokio::sync::mpsc::unbounded_channel();
    let stdin_fd = std::io::stdin().as_raw_fd();
    reactor.add_watch(stdin_fd, WatchDirection::Read, move || {
        let mut line = String::new();
        match std::io::stdin().read_line(&mut line) {
            Ok(0) | Err(_) => CallbackAction::Stop,
            Ok(_) => {
                let _ = ptt_tx.send(());
                CallbackAction::Continue
            }
        }
    })?;

    tracing::info!("Press Enter to toggle PTT - Ctrl+C to stop");

    let mut blocks_sent: u64 = 0;
    loop {
        session.pump();

        while ptt_rx.try_recv().is_ok() {
            session.key_pressed();
        }

        while let Ok(block) = link_rx.try_recv() {
            blocks_sent += 1;
            if blocks_sent % 100 == 0 {
                tracing::info!("{} blocks toward the link ({} samples last)", blocks_sent, block.len());
            }
        }

        while let Ok(event) = events_rx.try_recv() {
            match event {
                SessionEvent::TransmitChanged(on) => {
                    tracing::info!("TX: {}", if on { "ON" } else { "OFF" });
                }
                SessionEvent::ReceiveChanged(on) => {
                    tracing::info!("RX: {}", if on { "ON" } else { "OFF" });
                }
                SessionEvent::VadState(state) => {
                    tracing::debug!(?state, "voice activity");
                }
                SessionEvent::VadLevel(db) => {
                    tracing::trace!(db, "mic level");
                }
                SessionEvent::AddressResolved(addr) => {
                    tracing::info!("Peer resolved to {addr}");
                    session.connection_changed(ConnectionState::Connected);
                }
                SessionEvent::Info(text) => {
                    tracing::info!("{text}");
                }
            }
        }

        // Small sleep to prevent busy-waiting
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
