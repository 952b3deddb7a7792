//! Error taxonomy
//!
//! Every failure is contained by the smallest unit that can hold it: a
//! detector fault belongs to one analysis stage, an action failure to one
//! iteration. None of these abort a run.

use crate::types::Stage;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure reported by a detector implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DetectorFault {
    #[error("detector unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),
}

/// Stage-attributed analysis failure
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AnalysisError {
    #[error("{stage} detector unavailable: {reason}")]
    DetectorUnavailable { stage: Stage, reason: String },

    #[error("{stage} detector error: {message}")]
    DetectorError { stage: Stage, message: String },

    #[error("{stage} detector exceeded budget: {elapsed_ms} ms > {budget_ms} ms")]
    DetectorTimeout {
        stage: Stage,
        elapsed_ms: u64,
        budget_ms: u64,
    },

    #[error("both transition strategies failed: primary ({primary}), secondary ({secondary})")]
    BothStrategiesFailed { primary: String, secondary: String },
}

impl AnalysisError {
    /// Attribute a detector fault to a stage
    pub fn from_fault(stage: Stage, fault: DetectorFault) -> Self {
        match fault {
            DetectorFault::Unavailable(reason) => Self::DetectorUnavailable { stage, reason },
            DetectorFault::Failed(message) => Self::DetectorError { stage, message },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DetectorUnavailable { .. } => ErrorKind::DetectorUnavailable,
            Self::DetectorError { .. } => ErrorKind::DetectorError,
            Self::DetectorTimeout { .. } => ErrorKind::DetectorTimeout,
            Self::BothStrategiesFailed { .. } => ErrorKind::BothStrategiesFailed,
        }
    }

    pub fn stage(&self) -> Stage {
        match self {
            Self::DetectorUnavailable { stage, .. }
            | Self::DetectorError { stage, .. }
            | Self::DetectorTimeout { stage, .. } => *stage,
            Self::BothStrategiesFailed { .. } => Stage::Transition,
        }
    }
}

/// Stimulus execution failed
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("action '{action_id}' failed: {message}")]
pub struct ActionFailure {
    pub action_id: String,
    pub message: String,
}

impl ActionFailure {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ActionFailure
    }
}

/// Error kinds callers can branch on without matching messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ActionFailure,
    DetectorUnavailable,
    DetectorError,
    DetectorTimeout,
    BothStrategiesFailed,
}

/// Frame capture on the device failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("frame capture '{tag}' failed: {message}")]
pub struct CaptureError {
    pub tag: String,
    pub message: String,
}

/// Invalid engine configuration
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("at least one analysis region is required")]
    NoRegions,

    #[error("analysis region {index} has zero area ({width}x{height})")]
    EmptyRegion {
        index: usize,
        width: u32,
        height: u32,
    },

    #[error("similarity_threshold must be a non-negative finite number, got {0}")]
    InvalidSimilarityThreshold(f64),

    #[error("speech_segment_count must be >= 1, got {0}")]
    InvalidSegmentCount(usize),

    #[error("detector_budget_ms must be > 0 when set")]
    ZeroDetectorBudget,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fault_attribution() {
        let err = AnalysisError::from_fault(
            Stage::Speech,
            DetectorFault::Unavailable("whisper not loaded".to_string()),
        );
        assert_eq!(err.kind(), ErrorKind::DetectorUnavailable);
        assert_eq!(err.stage(), Stage::Speech);
        assert_eq!(
            err.to_string(),
            "speech detector unavailable: whisper not loaded"
        );
    }

    #[test]
    fn test_both_strategies_failed_belongs_to_transition() {
        let err = AnalysisError::BothStrategiesFailed {
            primary: "no blackscreen".to_string(),
            secondary: "no freeze".to_string(),
        };
        assert_eq!(err.stage(), Stage::Transition);
        assert_eq!(err.kind(), ErrorKind::BothStrategiesFailed);
    }

    #[test]
    fn test_analysis_error_serializes_with_kind_tag() {
        let err = AnalysisError::DetectorTimeout {
            stage: Stage::Motion,
            elapsed_ms: 120,
            budget_ms: 50,
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "detector_timeout");
        assert_eq!(json["stage"], "motion");
    }

    #[test]
    fn test_action_failure_message() {
        let failure = ActionFailure {
            action_id: "ch_up".to_string(),
            message: "adb offline".to_string(),
        };
        assert_eq!(failure.kind(), ErrorKind::ActionFailure);
        assert_eq!(failure.to_string(), "action 'ch_up' failed: adb offline");
    }
}
