//! Serial link to the knob microcontroller

pub mod decode;
pub mod link;

pub use decode::decode_sample;
pub use link::{ParityMode, RawSample, SampleSource, SerialConfig, SerialLink, TimeoutPolicy};
