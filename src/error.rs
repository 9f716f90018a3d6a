//! Error types for the voice link core

use thiserror::Error;

/// Main error type for the crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("Reactor error: {0}")]
    Reactor(#[from] ReactorError),

    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reactor subsystem errors
///
/// Double registration and removal of unknown entries are caller bugs and
/// are handled with debug assertions, not error values. Only conditions
/// the host OS can genuinely produce at runtime appear here.
#[derive(Error, Debug)]
pub enum ReactorError {
    #[error("Failed to register descriptor {fd} with the event loop: {source}")]
    WatchRegistration {
        fd: std::os::fd::RawFd,
        #[source]
        source: std::io::Error,
    },
}

/// Audio path errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("cpal error: {0}")]
    CpalError(String),
}

/// Result type alias for the crate
pub type Result<T> = std::result::Result<T, Error>;
