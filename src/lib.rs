//! Zapline - adaptive stimulus-response verification for media devices
//!
//! This library repeatedly applies a stimulus (for example a channel change)
//! to a device under test, runs a gated chain of detectors over the captured
//! frames and audio, learns which transition detection strategy works for the
//! device, and aggregates per-iteration outcomes into run statistics.

pub mod adaptive;
pub mod budget;
pub mod cli;
pub mod config;
pub mod controller;
pub mod error;
pub mod evidence;
pub mod pipeline;
pub mod ports;
pub mod recorder;
pub mod scenario;
pub mod stats;
pub mod types;

pub use config::EngineConfig;
pub use controller::{CancelToken, ProgressEvent, RunHandle, RunReport, ZapEngine};
pub use ports::{DetectorPort, DeviceContext};
pub use types::{DetectionMethod, LearnedMethod, StimulusAction, StimulusKind};
