#![doc = include_str!(concat!(env!("OUT_DIR"), "/README_GENERATED.md"))]
#![deny(unused_crate_dependencies)]

pub mod error;
pub mod format;
pub mod provider;
pub mod ring;

pub use error::AudioError;
pub use format::AudioFormat;
pub use provider::{AudioProvider, AudioSource, ConsumerId, SharedAudioProvider};
pub use ring::{AudioReader, AudioRingStream, AudioWriter, ReadOutcome};
