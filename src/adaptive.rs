//! Adaptive transition-detection strategy selection
//!
//! Two strategies compete for detecting the expected transition:
//!
//! - **primary**: region-based blackout/freeze detection
//! - **secondary**: frame-difference analysis over the window
//!
//! Until one of them succeeds, every attempt tries primary first and falls
//! back to secondary. The first success commits the run to that strategy
//! and only that strategy is called afterwards, even when it fails.
//!
//! ```text
//!               primary ok
//!  Unlearned ─────────────────▶ Primary   (terminal)
//!      │
//!      │ primary failed, secondary ok
//!      └──────────────────────▶ Secondary (terminal)
//! ```

use crate::budget::DetectorBudget;
use crate::error::AnalysisError;
use crate::evidence::{min_frame_difference, EvidenceCollector, EvidenceTag};
use crate::ports::{DetectorPort, PrimaryTransitionReport, SecondaryTransitionReport};
use crate::types::{
    AnalysisRegion, DetectionMethod, FrameRef, LearnedMethod, Stage, StageStatus,
    TransitionAnalysis,
};
use serde_json::json;

/// Inputs for one transition detection
#[derive(Debug, Clone, Copy)]
pub struct TransitionRequest<'a> {
    pub iteration: usize,
    pub window: &'a [FrameRef],
    pub regions: &'a [AnalysisRegion],
}

/// Strategy selector owning the run's learned method
#[derive(Debug, Clone)]
pub struct AdaptiveTransitionDetector {
    learned: LearnedMethod,
    learned_at_iteration: Option<usize>,
    evidence: EvidenceCollector,
    primary_calls: u64,
    secondary_calls: u64,
}

impl AdaptiveTransitionDetector {
    pub fn new(evidence: EvidenceCollector) -> Self {
        Self {
            learned: LearnedMethod::Unlearned,
            learned_at_iteration: None,
            evidence,
            primary_calls: 0,
            secondary_calls: 0,
        }
    }

    pub fn learned_method(&self) -> LearnedMethod {
        self.learned
    }

    /// Iteration on which the method was learned
    pub fn learned_at_iteration(&self) -> Option<usize> {
        self.learned_at_iteration
    }

    pub fn primary_calls(&self) -> u64 {
        self.primary_calls
    }

    pub fn secondary_calls(&self) -> u64 {
        self.secondary_calls
    }

    pub fn detect_transition(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> TransitionAnalysis {
        match self.learned {
            LearnedMethod::Primary => self.detect_with_primary(detectors, budget, request),
            LearnedMethod::Secondary => self.detect_with_secondary(detectors, budget, request),
            LearnedMethod::Unlearned => self.detect_and_learn(detectors, budget, request),
        }
    }

    fn run_primary(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> Result<PrimaryTransitionReport, AnalysisError> {
        self.primary_calls += 1;
        budget.call(Stage::Transition, || {
            detectors.detect_transition_primary(request.window, request.regions)
        })
    }

    fn run_secondary(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> Result<SecondaryTransitionReport, AnalysisError> {
        self.secondary_calls += 1;
        budget.call(Stage::Transition, || {
            detectors.detect_transition_secondary(request.window)
        })
    }

    fn detect_with_primary(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> TransitionAnalysis {
        let result = self.run_primary(detectors, budget, request);
        if let Ok(report) = &result {
            if report.detected {
                return primary_detected(report);
            }
        }

        let evidence = self.evidence.maybe_capture_failure_evidence(
            request.window,
            EvidenceTag::Primary,
            None,
        );
        tracing::info!(
            iteration = request.iteration,
            evidence = evidence.len(),
            "learned primary method did not detect a transition"
        );

        let mut analysis = match result {
            Ok(report) => primary_missed(&report),
            Err(error) => TransitionAnalysis::failed(error),
        };
        analysis.method = DetectionMethod::Primary;
        analysis.evidence = evidence;
        analysis
    }

    fn detect_with_secondary(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> TransitionAnalysis {
        match self.run_secondary(detectors, budget, request) {
            Ok(report) if report.detected => secondary_detected(&report),
            Ok(report) => {
                let min_diff = min_frame_difference(&report.frame_diffs);
                let evidence = self.evidence.maybe_capture_failure_evidence(
                    request.window,
                    EvidenceTag::Secondary,
                    min_diff,
                );
                tracing::info!(
                    iteration = request.iteration,
                    min_diff = ?min_diff,
                    evidence = evidence.len(),
                    "learned secondary method did not detect a transition"
                );
                TransitionAnalysis {
                    status: StageStatus::Ran,
                    detected: false,
                    method: DetectionMethod::Secondary,
                    transition_duration_ms: None,
                    gap_duration_ms: None,
                    kpi_timestamp_ms: None,
                    evidence,
                    metadata: json!({ "min_frame_diff": min_diff }),
                }
            }
            Err(error) => {
                tracing::warn!(iteration = request.iteration, %error, "secondary detector failed");
                let mut analysis = TransitionAnalysis::failed(error);
                analysis.method = DetectionMethod::Secondary;
                analysis
            }
        }
    }

    fn detect_and_learn(
        &mut self,
        detectors: &mut dyn DetectorPort,
        budget: &DetectorBudget,
        request: &TransitionRequest<'_>,
    ) -> TransitionAnalysis {
        let primary = self.run_primary(detectors, budget, request);
        if let Ok(report) = &primary {
            if report.detected {
                self.learn(LearnedMethod::Primary, request.iteration);
                return primary_detected(report);
            }
        }
        let primary_reason = failure_reason(&primary);
        tracing::debug!(
            iteration = request.iteration,
            reason = %primary_reason,
            "primary method failed, trying secondary"
        );

        let secondary = self.run_secondary(detectors, budget, request);
        if let Ok(report) = &secondary {
            if report.detected {
                self.learn(LearnedMethod::Secondary, request.iteration);
                let mut analysis = secondary_detected(report);
                analysis.metadata["primary_failure"] = json!(primary_reason);
                return analysis;
            }
        }
        let secondary_reason = failure_reason(&secondary);

        let evidence = self.evidence.maybe_capture_failure_evidence(
            request.window,
            EvidenceTag::BothMethods,
            None,
        );
        tracing::warn!(
            iteration = request.iteration,
            primary = %primary_reason,
            secondary = %secondary_reason,
            evidence = evidence.len(),
            "both transition methods failed"
        );

        let min_diff = secondary
            .as_ref()
            .ok()
            .and_then(|r| min_frame_difference(&r.frame_diffs));
        let status = if primary.is_err() && secondary.is_err() {
            StageStatus::failed(AnalysisError::BothStrategiesFailed {
                primary: primary_reason.clone(),
                secondary: secondary_reason.clone(),
            })
        } else {
            StageStatus::Ran
        };

        TransitionAnalysis {
            status,
            detected: false,
            method: DetectionMethod::BothFailed,
            transition_duration_ms: None,
            gap_duration_ms: None,
            kpi_timestamp_ms: None,
            evidence,
            metadata: json!({
                "primary_failure": primary_reason,
                "secondary_failure": secondary_reason,
                "min_frame_diff": min_diff,
            }),
        }
    }

    fn learn(&mut self, method: LearnedMethod, iteration: usize) {
        debug_assert!(!self.learned.is_learned());
        self.learned = method;
        self.learned_at_iteration = Some(iteration);
        tracing::info!(%method, iteration, "transition detection method learned");
    }
}

fn failure_reason<T>(result: &Result<T, AnalysisError>) -> String {
    match result {
        Ok(_) => "not detected".to_string(),
        Err(error) => error.to_string(),
    }
}

fn primary_detected(report: &PrimaryTransitionReport) -> TransitionAnalysis {
    TransitionAnalysis {
        status: StageStatus::Ran,
        detected: true,
        method: DetectionMethod::Primary,
        transition_duration_ms: report.duration_ms,
        gap_duration_ms: report.gap_ms,
        kpi_timestamp_ms: report.kpi_timestamp_ms,
        evidence: Vec::new(),
        metadata: report.metadata.clone(),
    }
}

fn primary_missed(report: &PrimaryTransitionReport) -> TransitionAnalysis {
    let flagged: Vec<&str> = report
        .evidence_frames
        .iter()
        .map(|f| f.path.as_str())
        .collect();
    TransitionAnalysis {
        status: StageStatus::Ran,
        detected: false,
        method: DetectionMethod::Primary,
        transition_duration_ms: None,
        gap_duration_ms: None,
        kpi_timestamp_ms: None,
        evidence: Vec::new(),
        metadata: json!({ "detector_flagged_frames": flagged }),
    }
}

fn secondary_detected(report: &SecondaryTransitionReport) -> TransitionAnalysis {
    TransitionAnalysis {
        status: StageStatus::Ran,
        detected: true,
        method: DetectionMethod::Secondary,
        transition_duration_ms: report.duration_ms,
        gap_duration_ms: None,
        kpi_timestamp_ms: report.kpi_timestamp_ms,
        evidence: Vec::new(),
        metadata: json!({
            "frame_diff_count": report.frame_diffs.len(),
            "min_frame_diff": min_frame_difference(&report.frame_diffs),
        }),
    }
}
