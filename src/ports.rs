//! Interfaces to the device under test and the detector services
//!
//! The engine never implements detection or device I/O itself. Everything
//! here is blocking and may take seconds per call.

use crate::error::{CaptureError, DetectorFault};
use crate::types::{AnalysisRegion, DeviceCommand, FrameRef, StimulusAction};
use serde::{Deserialize, Serialize};

pub type DetectorResult<T> = Result<T, DetectorFault>;

/// Result of executing a stimulus or recovery command list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    /// Device-side figure; the engine times the call itself
    pub duration_ms: u64,
    pub error: Option<String>,
}

impl ActionOutcome {
    pub fn ok(duration_ms: u64) -> Self {
        Self {
            success: true,
            duration_ms,
            error: None,
        }
    }

    pub fn failed(duration_ms: u64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            duration_ms,
            error: Some(error.into()),
        }
    }
}

/// Device under test
pub trait DeviceContext {
    /// Stable identifier of the device (serial, host name)
    fn device_id(&self) -> &str;

    fn execute_action(&mut self, action: &StimulusAction) -> ActionOutcome;

    /// Run recovery commands after a failed stimulus
    fn execute_recovery(&mut self, commands: &[DeviceCommand]) -> ActionOutcome;

    fn capture_frame(&mut self, tag: &str) -> Result<FrameRef, CaptureError>;

    /// Frames recorded since `since_ms` (the analyzed window), oldest first
    fn analysis_window(&mut self, since_ms: u64) -> Vec<FrameRef>;
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MotionReport {
    pub changed: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SubtitleReport {
    pub detected: bool,
    pub text: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SpeechReport {
    pub detected: bool,
    pub transcript: Option<String>,
    pub language: Option<String>,
}

/// Primary strategy result (region-based blackout/freeze detection)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct PrimaryTransitionReport {
    pub detected: bool,
    pub duration_ms: Option<f64>,
    pub gap_ms: Option<f64>,
    pub kpi_timestamp_ms: Option<u64>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Frames the detector itself flagged as relevant
    #[serde(default)]
    pub evidence_frames: Vec<FrameRef>,
}

/// Secondary strategy result (frame-difference based)
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SecondaryTransitionReport {
    pub detected: bool,
    pub duration_ms: Option<f64>,
    pub kpi_timestamp_ms: Option<u64>,
    /// Difference between consecutive frames of the window
    #[serde(default)]
    pub frame_diffs: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ChannelReport {
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
}

/// Detector services consumed by the signal pipeline
pub trait DetectorPort {
    /// Cheap content-change check on the settled frame
    fn detect_motion(&mut self) -> DetectorResult<MotionReport>;

    fn detect_subtitles(&mut self, frames: &[FrameRef]) -> DetectorResult<SubtitleReport>;

    fn detect_speech(&mut self, segment_count: usize) -> DetectorResult<SpeechReport>;

    fn detect_transition_primary(
        &mut self,
        window: &[FrameRef],
        regions: &[AnalysisRegion],
    ) -> DetectorResult<PrimaryTransitionReport>;

    fn detect_transition_secondary(
        &mut self,
        window: &[FrameRef],
    ) -> DetectorResult<SecondaryTransitionReport>;

    /// Channel banner / logo recognition; unavailable unless implemented
    fn detect_channel_info(&mut self, _frame: Option<&FrameRef>) -> DetectorResult<ChannelReport> {
        Err(DetectorFault::Unavailable(
            "channel info detector not configured".to_string(),
        ))
    }
}
