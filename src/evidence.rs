//! Failure evidence selection
//!
//! When a transition detection fails, a few representative frames of the
//! analyzed window are kept for human review: first, middle and last,
//! never the full window.
//!
//! | Strategy | Evidence attached |
//! |----------|-------------------|
//! | primary | always |
//! | secondary | only when the smallest frame difference is below the threshold (near miss) |
//! | both methods | always |

use crate::types::FrameRef;
use std::fmt;

/// Which failed detection the evidence is for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceTag {
    Primary,
    Secondary,
    BothMethods,
}

impl fmt::Display for EvidenceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Primary => "primary",
            Self::Secondary => "secondary",
            Self::BothMethods => "both methods",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvidenceCollector {
    similarity_threshold: f64,
}

impl EvidenceCollector {
    pub fn new(similarity_threshold: f64) -> Self {
        Self {
            similarity_threshold,
        }
    }

    pub fn similarity_threshold(&self) -> f64 {
        self.similarity_threshold
    }

    /// Pick evidence frames for a failed detection, or none
    ///
    /// `diagnostic_signal` is the smallest observed frame difference for the
    /// secondary strategy; it is ignored for the others.
    pub fn maybe_capture_failure_evidence(
        &self,
        frames: &[FrameRef],
        tag: EvidenceTag,
        diagnostic_signal: Option<f64>,
    ) -> Vec<FrameRef> {
        let attach = match tag {
            EvidenceTag::Primary | EvidenceTag::BothMethods => true,
            EvidenceTag::Secondary => {
                diagnostic_signal.is_some_and(|diff| diff < self.similarity_threshold)
            }
        };

        if !attach {
            tracing::debug!(
                %tag,
                min_diff = ?diagnostic_signal,
                threshold = self.similarity_threshold,
                "frames clearly dissimilar, no evidence kept"
            );
            return Vec::new();
        }

        let evidence = select_representative(frames);
        tracing::debug!(%tag, frames = evidence.len(), "failure evidence captured");
        evidence
    }
}

/// First, middle and last frame of the window, without duplicates
pub fn select_representative(frames: &[FrameRef]) -> Vec<FrameRef> {
    if frames.is_empty() {
        return Vec::new();
    }

    let last = frames.len() - 1;
    let mut indices = vec![0, last / 2, last];
    indices.dedup();

    indices.into_iter().map(|i| frames[i].clone()).collect()
}

/// Smallest finite frame difference, if any
pub fn min_frame_difference(diffs: &[f64]) -> Option<f64> {
    diffs
        .iter()
        .copied()
        .filter(|d| d.is_finite())
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
}
