//! Audio path subsystem

pub mod device;
pub mod endpoint;
pub mod valve;

pub use device::{input_device, list_devices, output_device, DeviceInfo};
pub use endpoint::{AudioEndpoint, MicrophoneEndpoint, PlaybackQueue, SpeakerEndpoint};
pub use valve::{GateValve, SignalValve};

/// Block of interleaved f32 samples
pub type SampleBlock = Vec<f32>;
