//! Per-call time budget for detector calls
//!
//! Detector calls are blocking and run on the engine thread, so the budget
//! is enforced after the call returns: a result that arrives late is
//! discarded and reported as [`AnalysisError::DetectorTimeout`] for that
//! stage. Every call is timed and logged at debug level either way.

use crate::error::AnalysisError;
use crate::ports::DetectorResult;
use crate::types::Stage;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DetectorBudget {
    limit: Option<Duration>,
}

impl DetectorBudget {
    pub fn new(limit: Option<Duration>) -> Self {
        Self { limit }
    }

    pub fn unlimited() -> Self {
        Self { limit: None }
    }

    pub fn limit(&self) -> Option<Duration> {
        self.limit
    }

    /// Run one detector call and attribute any fault to `stage`
    pub fn call<T>(
        &self,
        stage: Stage,
        f: impl FnOnce() -> DetectorResult<T>,
    ) -> Result<T, AnalysisError> {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed();

        tracing::debug!(
            stage = stage.label(),
            elapsed_ms = elapsed.as_millis() as u64,
            ok = result.is_ok(),
            "detector call finished"
        );

        if let Some(limit) = self.limit {
            if elapsed > limit {
                return Err(AnalysisError::DetectorTimeout {
                    stage,
                    elapsed_ms: elapsed.as_millis() as u64,
                    budget_ms: limit.as_millis() as u64,
                });
            }
        }

        result.map_err(|fault| AnalysisError::from_fault(stage, fault))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DetectorFault, ErrorKind};

    #[test]
    fn test_unlimited_passes_value_through() {
        let budget = DetectorBudget::unlimited();
        let value = budget.call(Stage::Motion, || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn test_fault_is_attributed_to_stage() {
        let budget = DetectorBudget::unlimited();
        let err = budget
            .call::<()>(Stage::Subtitles, || {
                Err(DetectorFault::Failed("tesseract crashed".to_string()))
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DetectorError);
        assert_eq!(err.stage(), Stage::Subtitles);
    }

    #[test]
    fn test_late_result_becomes_timeout() {
        let budget = DetectorBudget::new(Some(Duration::from_millis(1)));
        let err = budget
            .call(Stage::Speech, || {
                std::thread::sleep(Duration::from_millis(20));
                Ok(true)
            })
            .unwrap_err();
        match err {
            AnalysisError::DetectorTimeout {
                stage, budget_ms, ..
            } => {
                assert_eq!(stage, Stage::Speech);
                assert_eq!(budget_ms, 1);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
    }

    #[test]
    fn test_fast_call_within_budget() {
        let budget = DetectorBudget::new(Some(Duration::from_secs(10)));
        assert!(budget.call(Stage::Transition, || Ok(())).is_ok());
        assert_eq!(budget.limit(), Some(Duration::from_secs(10)));
    }
}
