//! Data model shared by every stage of the engine
//!
//! Stage sub-results are immutable once a stage produces them; the pipeline
//! composes them into one [`AnalysisResult`] per iteration, and the
//! controller merges that into the iteration's [`IterationRecord`].

use crate::error::{ActionFailure, AnalysisError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Reference to a captured frame (screenshot) on the device under test
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRef {
    /// Capture tag (e.g., "pre", "main", "post", "window_3")
    pub tag: String,
    /// Storage path or URI of the frame
    pub path: String,
    /// Capture time in milliseconds since UNIX epoch
    pub timestamp_ms: u64,
}

/// Whether a stimulus is expected to produce a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StimulusKind {
    /// Moves the device to a new state (e.g., channel up); transition detection runs
    #[default]
    Forward,
    /// Does not change state; transition detection is skipped
    Neutral,
}

/// Primitive device command (key press, tap, shell call)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Value,
    /// Wait after the command, in milliseconds
    #[serde(default)]
    pub wait_ms: u64,
}

impl DeviceCommand {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            params: serde_json::Value::Null,
            wait_ms: 0,
        }
    }
}

/// Command issued to the device each iteration
///
/// `retry_actions` belong to the navigation layer and are never executed by
/// the engine. `failure_actions` are run once after a failed stimulus to put
/// the device back into a known state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StimulusAction {
    pub id: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub kind: StimulusKind,
    #[serde(default)]
    pub commands: Vec<DeviceCommand>,
    #[serde(default)]
    pub retry_actions: Vec<DeviceCommand>,
    #[serde(default)]
    pub failure_actions: Vec<DeviceCommand>,
}

impl StimulusAction {
    pub fn new(id: impl Into<String>, kind: StimulusKind) -> Self {
        let id = id.into();
        Self {
            label: id.clone(),
            id,
            kind,
            commands: Vec::new(),
            retry_actions: Vec::new(),
            failure_actions: Vec::new(),
        }
    }

    pub fn with_command(mut self, command: DeviceCommand) -> Self {
        self.commands.push(command);
        self
    }

    pub fn with_failure_action(mut self, command: DeviceCommand) -> Self {
        self.failure_actions.push(command);
        self
    }
}

impl Default for StimulusAction {
    fn default() -> Self {
        Self::new("channel_up", StimulusKind::Forward)
            .with_command(DeviceCommand::new("CHANNEL_UP"))
    }
}

/// Rectangle of the frame the transition detectors look at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysisRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl AnalysisRegion {
    pub fn full_hd() -> Self {
        Self {
            x: 0,
            y: 0,
            width: 1920,
            height: 1080,
        }
    }
}

/// Analysis stage identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Motion,
    Subtitles,
    Speech,
    Transition,
    ChannelInfo,
}

impl Stage {
    /// The stage label used in messages and logging.
    pub fn label(self) -> &'static str {
        match self {
            Self::Motion => "motion",
            Self::Subtitles => "subtitles",
            Self::Speech => "speech",
            Self::Transition => "transition",
            Self::ChannelInfo => "channel_info",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Why a stage did not run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    /// Motion gate reported no content change
    NoMotion,
    /// Device class produces no audio
    AudioDisabled,
    /// Stimulus is not expected to produce a transition
    NeutralStimulus,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NoMotion => "no motion detected",
            Self::AudioDisabled => "audio disabled for device class",
            Self::NeutralStimulus => "neutral stimulus",
        })
    }
}

/// Execution status of a single analysis stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageStatus {
    Ran,
    Skipped { reason: SkipReason },
    Failed { error: AnalysisError },
}

impl StageStatus {
    pub fn skipped(reason: SkipReason) -> Self {
        Self::Skipped { reason }
    }

    pub fn failed(error: AnalysisError) -> Self {
        Self::Failed { error }
    }

    /// True when the stage was attempted, whether or not the detector succeeded
    pub fn attempted(&self) -> bool {
        !matches!(self, Self::Skipped { .. })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped { .. })
    }

    pub fn error(&self) -> Option<&AnalysisError> {
        match self {
            Self::Failed { error } => Some(error),
            _ => None,
        }
    }

    fn describe(&self, detected: bool) -> String {
        match self {
            Self::Ran if detected => "detected".to_string(),
            Self::Ran => "not detected".to_string(),
            Self::Skipped { reason } => format!("skipped ({reason})"),
            Self::Failed { error } => format!("failed ({error})"),
        }
    }
}

/// Transition-detection strategy used for an iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    #[default]
    Unset,
    Primary,
    Secondary,
    BothFailed,
}

impl DetectionMethod {
    pub fn label(self) -> &'static str {
        match self {
            Self::Unset => "unset",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::BothFailed => "both_failed",
        }
    }
}

impl fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Strategy the engine has committed to for the rest of the run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LearnedMethod {
    #[default]
    Unlearned,
    Primary,
    Secondary,
}

impl LearnedMethod {
    pub fn is_learned(self) -> bool {
        self != Self::Unlearned
    }

    pub fn as_detection_method(self) -> DetectionMethod {
        match self {
            Self::Unlearned => DetectionMethod::Unset,
            Self::Primary => DetectionMethod::Primary,
            Self::Secondary => DetectionMethod::Secondary,
        }
    }
}

impl fmt::Display for LearnedMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Unlearned => "unlearned",
            Self::Primary => "primary",
            Self::Secondary => "secondary",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MotionAnalysis {
    pub status: StageStatus,
    pub detected: bool,
    #[serde(default)]
    pub details: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubtitleAnalysis {
    pub status: StageStatus,
    pub detected: bool,
    pub text: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeechAnalysis {
    pub status: StageStatus,
    pub detected: bool,
    pub transcript: Option<String>,
    pub language: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionAnalysis {
    pub status: StageStatus,
    pub detected: bool,
    pub method: DetectionMethod,
    pub transition_duration_ms: Option<f64>,
    pub gap_duration_ms: Option<f64>,
    /// When the change was observed, in milliseconds since UNIX epoch
    pub kpi_timestamp_ms: Option<u64>,
    /// Frames kept for human review of a failed detection
    pub evidence: Vec<FrameRef>,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelAnalysis {
    pub status: StageStatus,
    pub channel_id: Option<String>,
    pub channel_name: Option<String>,
}

macro_rules! stage_constructors {
    ($ty:ident { $($field:ident : $value:expr),* $(,)? }) => {
        impl $ty {
            pub fn skipped(reason: SkipReason) -> Self {
                Self { status: StageStatus::skipped(reason), $($field: $value),* }
            }

            pub fn failed(error: AnalysisError) -> Self {
                Self { status: StageStatus::failed(error), $($field: $value),* }
            }
        }
    };
}

stage_constructors!(MotionAnalysis {
    detected: false,
    details: serde_json::Value::Null,
});
stage_constructors!(SubtitleAnalysis {
    detected: false,
    text: None,
    language: None,
});
stage_constructors!(SpeechAnalysis {
    detected: false,
    transcript: None,
    language: None,
});
stage_constructors!(TransitionAnalysis {
    detected: false,
    method: DetectionMethod::Unset,
    transition_duration_ms: None,
    gap_duration_ms: None,
    kpi_timestamp_ms: None,
    evidence: Vec::new(),
    metadata: serde_json::Value::Null,
});
stage_constructors!(ChannelAnalysis {
    channel_id: None,
    channel_name: None,
});

impl SubtitleAnalysis {
    pub fn message(&self) -> String {
        self.status.describe(self.detected)
    }
}

impl SpeechAnalysis {
    pub fn message(&self) -> String {
        self.status.describe(self.detected)
    }
}

impl TransitionAnalysis {
    pub fn message(&self) -> String {
        match (&self.status, self.method) {
            (StageStatus::Ran, DetectionMethod::BothFailed) => {
                "not detected (both methods failed)".to_string()
            }
            (StageStatus::Ran, method) if self.detected => format!("detected via {method}"),
            (status, _) => status.describe(self.detected),
        }
    }
}

/// Merged per-iteration analysis outcome
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalysisResult {
    pub motion: MotionAnalysis,
    pub subtitles: SubtitleAnalysis,
    pub speech: SpeechAnalysis,
    pub transition: TransitionAnalysis,
    pub channel: ChannelAnalysis,
    pub success: bool,
    pub message: String,
}

impl AnalysisResult {
    pub fn motion_detected(&self) -> bool {
        self.motion.detected
    }

    pub fn transition_detected(&self) -> bool {
        self.transition.detected
    }

    pub fn detection_method(&self) -> DetectionMethod {
        self.transition.method
    }

    pub fn subtitle_detected(&self) -> bool {
        self.subtitles.detected
    }

    pub fn speech_detected(&self) -> bool {
        self.speech.detected
    }

    pub fn transition_duration_ms(&self) -> Option<f64> {
        self.transition.transition_duration_ms
    }

    pub fn gap_duration_ms(&self) -> Option<f64> {
        self.transition.gap_duration_ms
    }
}

/// Frames captured around an iteration
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IterationFrames {
    pub pre: Option<FrameRef>,
    pub main: Option<FrameRef>,
    pub post: Option<FrameRef>,
}

/// One loop iteration, created after the stimulus and completed after analysis
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationRecord {
    /// 1-based iteration index
    pub iteration: usize,
    pub action_id: String,
    pub action_label: String,
    pub started_at_ms: u64,
    /// Set when the iteration is finished (analysis merged or action failure handled)
    pub ended_at_ms: Option<u64>,
    /// Wall-clock time of the stimulus as measured by the engine
    pub execution_duration_ms: u64,
    /// Duration the device reported for the stimulus, 0 if it reported none
    pub device_duration_ms: u64,
    pub action_success: bool,
    pub action_error: Option<ActionFailure>,
    pub frames: IterationFrames,
    pub analysis: Option<AnalysisResult>,
    pub recovered: bool,
}

impl IterationRecord {
    /// Iteration succeeded: stimulus ran and the analysis reported success
    pub fn is_successful(&self) -> bool {
        self.action_success && self.analysis.as_ref().is_some_and(|a| a.success)
    }

    pub fn is_finished(&self) -> bool {
        self.ended_at_ms.is_some()
    }
}
