//! # Voicelink
//!
//! Core engine for a peer-to-peer voice link client: event reactor,
//! cancellable host resolution, voice activity detection and transmit
//! arbitration. Everything that renders widgets, persists settings or
//! speaks the peer-directory protocol lives outside this crate.
//!
//! ## Signal Flow
//!
//! ```text
//!                 ┌──────────────────────────────────────────────┐
//!                 │                 Reactor                      │
//!                 │   timers (hang, app ticks)  fd watches       │
//!                 └───────┬──────────────────────────┬───────────┘
//!                         │ hang timer               │ readiness
//!                         ▼                          ▼
//!  mic blocks ──►┌─────────────────┐      ┌──────────────────────┐
//!                │       VAD       │      │  CancellableResolver │──► address
//!                │ IDLE/ACTIVE/HANG│      └──────────────────────┘
//!                └────────┬────────┘
//!                         │ state/level          connection state
//!                         ▼                          │
//!  manual key ──►┌─────────────────────────────────────┐
//!                │           TransmitArbiter           │
//!                │  connected ∧ (key ∨ vad) → transmit │
//!                └──┬───────────┬───────────┬──────────┘
//!                   ▼           ▼           ▼
//!               tx/rx gates   microphone  speaker
//!                             (half duplex: never open together
//!                              with the receive path)
//! ```
//!
//! The whole core runs on the one thread that drives the event loop (a
//! current-thread tokio runtime with a `LocalSet`); ordering is the
//! loop's dispatch order and nothing in here takes a lock on the hot
//! path. The only off-thread activity is the OS resolver and the audio
//! device callbacks, both of which hand their results back to the loop
//! through channels.

pub mod arbiter;
pub mod audio;
pub mod config;
pub mod error;
pub mod reactor;
pub mod resolver;
pub mod session;
pub mod vad;

pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// Internal sample rate of the voice path
    pub const INTERNAL_SAMPLE_RATE: u32 = 16_000;

    /// Lowest reportable audio level in dB
    pub const LEVEL_FLOOR_DB: i32 = -60;

    /// Highest reportable audio level in dB
    pub const LEVEL_CEILING_DB: i32 = 0;

    /// Default voice activation threshold in dB
    pub const DEFAULT_VAD_THRESHOLD_DB: i32 = -30;

    /// Default hang time in milliseconds before voice keying drops
    pub const DEFAULT_VAD_HANG_MS: u64 = 1000;

    /// Freshness lifetime assigned to resolved addresses; the platform
    /// resolver exposes no authoritative TTL
    pub const RESOLVED_ADDRESS_TTL: Duration = Duration::from_secs(1);

    /// Playback queue cap in samples (one second at the internal rate)
    pub const PLAYBACK_QUEUE_MAX_SAMPLES: usize = 16_000;
}
