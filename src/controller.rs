//! Iteration controller
//!
//! Runs the stimulus `count` times on one device, strictly in order. Each
//! iteration is recorded in two phases (after the stimulus, after analysis)
//! and folded into the run statistics. A run can execute on the caller's
//! thread with [`ZapEngine::run_iterations`] or on a dedicated thread with
//! [`ZapEngine::spawn`], which hands back a [`RunHandle`] exposing progress
//! events, the live record view, cancellation and the final report.

use crate::config::EngineConfig;
use crate::error::{ActionFailure, ConfigError};
use crate::pipeline::{IterationContext, SignalPipeline};
use crate::ports::{DetectorPort, DeviceContext};
use crate::recorder::{RecorderHandle, ResultRecorder};
use crate::stats::{Rates, Statistics, StatisticsAggregator};
use crate::types::{
    DetectionMethod, FrameRef, IterationFrames, IterationRecord, LearnedMethod, StimulusAction,
};
use crossbeam::channel::{self, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn new_run_id() -> String {
    format!("{:016x}", rand::random::<u64>())
}

/// Cooperative cancellation, checked before each iteration
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live progress of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    RunStarted {
        run_id: String,
        requested_iterations: usize,
    },
    IterationStarted {
        iteration: usize,
    },
    ActionCompleted {
        iteration: usize,
        success: bool,
        duration_ms: u64,
    },
    AnalysisCompleted {
        iteration: usize,
        success: bool,
        detection_method: DetectionMethod,
    },
    RunFinished {
        overall_success: bool,
        cancelled: bool,
    },
}

/// Outcome of a complete run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub device_id: String,
    pub action_id: String,
    pub requested_iterations: usize,
    pub overall_success: bool,
    pub cancelled: bool,
    pub records: Vec<IterationRecord>,
    pub statistics: Statistics,
    pub learned_method: LearnedMethod,
    pub learned_at_iteration: Option<usize>,
}

impl RunReport {
    pub fn rates(&self) -> Rates {
        self.statistics.rates()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// One engine instance per run and device
pub struct ZapEngine {
    config: EngineConfig,
    run_id: String,
    device: Box<dyn DeviceContext + Send>,
    pipeline: SignalPipeline,
    recorder: ResultRecorder,
    stats: StatisticsAggregator,
    cancel: CancelToken,
    progress: Option<Sender<ProgressEvent>>,
}

impl ZapEngine {
    pub fn new(
        config: EngineConfig,
        device: Box<dyn DeviceContext + Send>,
        detectors: Box<dyn DetectorPort + Send>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let pipeline = SignalPipeline::new(&config, detectors);
        Ok(Self {
            config,
            run_id: new_run_id(),
            device,
            pipeline,
            recorder: ResultRecorder::new(),
            stats: StatisticsAggregator::new(),
            cancel: CancelToken::new(),
            progress: None,
        })
    }

    pub fn with_progress(mut self, sender: Sender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn recorder_handle(&self) -> RecorderHandle {
        self.recorder.handle()
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn learned_method(&self) -> LearnedMethod {
        self.pipeline.learned_method()
    }

    /// Run the configured number of iterations
    pub fn run(self, action: &StimulusAction) -> RunReport {
        let count = self.config.iterations;
        self.run_iterations(action, count)
    }

    /// Run `count` iterations of `action` and return the full report
    ///
    /// Always completes every iteration unless cancelled; detector and
    /// action failures are recorded, never propagated.
    pub fn run_iterations(mut self, action: &StimulusAction, count: usize) -> RunReport {
        let span = tracing::info_span!(
            "zap_run",
            run_id = %self.run_id,
            device = %self.device.device_id(),
            action = %action.id
        );
        let _guard = span.enter();

        tracing::info!(count, "starting zap run");
        self.emit(ProgressEvent::RunStarted {
            run_id: self.run_id.clone(),
            requested_iterations: count,
        });

        let mut cancelled = false;
        for iteration in 1..=count {
            if self.cancel.is_cancelled() {
                tracing::warn!(iteration, "run cancelled before iteration");
                cancelled = true;
                break;
            }
            self.run_one(action, iteration);
        }

        let statistics = self.stats.summary();
        let overall_success = !cancelled && statistics.successful_iterations == count as u64;
        tracing::info!(
            overall_success,
            successful = statistics.successful_iterations,
            total = statistics.total_iterations,
            learned = %self.pipeline.learned_method(),
            "zap run finished"
        );
        self.emit(ProgressEvent::RunFinished {
            overall_success,
            cancelled,
        });

        RunReport {
            run_id: self.run_id.clone(),
            device_id: self.device.device_id().to_string(),
            action_id: action.id.clone(),
            requested_iterations: count,
            overall_success,
            cancelled,
            records: self.recorder.records(),
            statistics,
            learned_method: self.pipeline.learned_method(),
            learned_at_iteration: self.pipeline.transition_detector().learned_at_iteration(),
        }
    }

    /// Run on a dedicated thread
    pub fn spawn(self, action: StimulusAction, count: usize) -> std::io::Result<RunHandle> {
        let (sender, receiver) = channel::unbounded();
        let engine = self.with_progress(sender);
        let run_id = engine.run_id.clone();
        let records = engine.recorder_handle();
        let cancel = engine.cancel_token();

        let join = thread::Builder::new()
            .name(format!("zap-{}", engine.device.device_id()))
            .spawn(move || engine.run_iterations(&action, count))?;

        Ok(RunHandle {
            run_id,
            progress: receiver,
            records,
            cancel,
            join,
        })
    }

    fn run_one(&mut self, action: &StimulusAction, iteration: usize) {
        let span = tracing::info_span!("iteration", iteration);
        let _guard = span.enter();
        self.emit(ProgressEvent::IterationStarted { iteration });

        let pre = self.capture("pre");
        let started_at_ms = now_ms();
        let clock = Instant::now();
        let outcome = self.device.execute_action(action);
        let execution_duration_ms = clock.elapsed().as_millis() as u64;

        let action_error = (!outcome.success).then(|| ActionFailure {
            action_id: action.id.clone(),
            message: outcome
                .error
                .clone()
                .unwrap_or_else(|| "unknown failure".to_string()),
        });

        let id = self.recorder.begin(IterationRecord {
            iteration,
            action_id: action.id.clone(),
            action_label: action.label.clone(),
            started_at_ms,
            ended_at_ms: None,
            execution_duration_ms,
            device_duration_ms: outcome.duration_ms,
            action_success: outcome.success,
            action_error: action_error.clone(),
            frames: IterationFrames {
                pre,
                main: None,
                post: None,
            },
            analysis: None,
            recovered: false,
        });
        self.emit(ProgressEvent::ActionCompleted {
            iteration,
            success: outcome.success,
            duration_ms: execution_duration_ms,
        });

        if let Some(failure) = action_error {
            tracing::warn!(%failure, "stimulus failed, skipping analysis");
            let recovered = self.recover(action);
            self.recorder.update(id, |record| {
                record.recovered = recovered;
                record.ended_at_ms = Some(now_ms());
            });
        } else {
            let settle = self.config.settle_delay();
            if !settle.is_zero() {
                thread::sleep(settle);
            }

            let main_frame = self.capture("main");
            let window = self.device.analysis_window(started_at_ms);
            let ctx = IterationContext {
                run_id: self.run_id.clone(),
                iteration,
                stimulus_kind: action.kind,
                main_frame: main_frame.clone(),
                window,
            };
            let analysis = self.pipeline.analyze(&ctx);
            tracing::info!(
                success = analysis.success,
                method = %analysis.detection_method(),
                message = %analysis.message,
                "analysis complete"
            );
            let success = analysis.success;
            let detection_method = analysis.detection_method();

            let post = self.capture("post");
            self.recorder
                .complete(id, analysis, main_frame, post, now_ms());
            self.emit(ProgressEvent::AnalysisCompleted {
                iteration,
                success,
                detection_method,
            });
        }

        if let Some(record) = self.recorder.get(id) {
            self.stats.record(&record);
        }
    }

    /// Put the device back into a known state after a failed stimulus
    fn recover(&mut self, action: &StimulusAction) -> bool {
        if action.failure_actions.is_empty() {
            return false;
        }
        let outcome = self.device.execute_recovery(&action.failure_actions);
        if outcome.success {
            tracing::info!("device recovered after failed stimulus");
        } else {
            tracing::warn!(error = ?outcome.error, "recovery actions failed");
        }
        outcome.success
    }

    fn capture(&mut self, tag: &str) -> Option<FrameRef> {
        match self.device.capture_frame(tag) {
            Ok(frame) => Some(frame),
            Err(error) => {
                tracing::warn!(%error, "frame capture failed");
                None
            }
        }
    }

    fn emit(&self, event: ProgressEvent) {
        if let Some(sender) = &self.progress {
            // receiver may already be gone; progress is best-effort
            let _ = sender.send(event);
        }
    }
}

/// Handle to a run executing on its own thread
pub struct RunHandle {
    run_id: String,
    progress: Receiver<ProgressEvent>,
    records: RecorderHandle,
    cancel: CancelToken,
    join: JoinHandle<RunReport>,
}

impl RunHandle {
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn progress(&self) -> &Receiver<ProgressEvent> {
        &self.progress
    }

    pub fn records(&self) -> &RecorderHandle {
        &self.records
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the run to finish
    pub fn wait(self) -> anyhow::Result<RunReport> {
        self.join
            .join()
            .map_err(|_| anyhow::anyhow!("engine thread for run {} panicked", self.run_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{DetectorAnswer, IterationScript, Scenario};

    fn engine(scenario: &Scenario) -> ZapEngine {
        let (device, detectors, _log) = scenario.build();
        ZapEngine::new(EngineConfig::fast(), Box::new(device), Box::new(detectors)).unwrap()
    }

    #[test]
    fn test_zero_iterations() {
        let report = engine(&Scenario::default()).run_iterations(&StimulusAction::default(), 0);
        assert!(report.records.is_empty());
        assert!(report.overall_success);
        assert_eq!(report.statistics.success_rate(), 0.0);
        assert_eq!(report.learned_method, LearnedMethod::Unlearned);
    }

    #[test]
    fn test_run_uses_configured_iterations() {
        let (device, detectors, _log) = Scenario::default().build();
        let config = EngineConfig {
            iterations: 3,
            ..EngineConfig::fast()
        };
        let report = ZapEngine::new(config, Box::new(device), Box::new(detectors))
            .unwrap()
            .run(&StimulusAction::default());
        assert_eq!(report.records.len(), 3);
        assert_eq!(report.requested_iterations, 3);
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let (device, detectors, _log) = Scenario::default().build();
        let config = EngineConfig {
            regions: Vec::new(),
            ..EngineConfig::fast()
        };
        assert!(matches!(
            ZapEngine::new(config, Box::new(device), Box::new(detectors)),
            Err(ConfigError::NoRegions)
        ));
    }

    #[test]
    fn test_failed_action_is_recorded_and_loop_continues() {
        let scenario = Scenario::default().with_override(
            2,
            IterationScript {
                action_fails: true,
                ..IterationScript::default()
            },
        );
        let report = engine(&scenario).run_iterations(&StimulusAction::default(), 3);

        assert_eq!(report.records.len(), 3);
        let failed = &report.records[1];
        assert!(!failed.action_success);
        assert!(failed.analysis.is_none());
        assert!(failed.is_finished());
        assert!(failed.action_error.is_some());
        assert!(!failed.recovered);
        assert!(report.records[2].is_successful());
        assert_eq!(report.statistics.action_failures, 1);
        assert!(!report.overall_success);
    }

    #[test]
    fn test_failure_actions_recover_device() {
        let scenario = Scenario::default().with_override(
            1,
            IterationScript {
                action_fails: true,
                ..IterationScript::default()
            },
        );
        let action = StimulusAction::default()
            .with_failure_action(crate::types::DeviceCommand::new("HOME"));
        let report = engine(&scenario).run_iterations(&action, 1);

        assert!(report.records[0].recovered);
        assert_eq!(report.statistics.recovered_iterations, 1);
    }

    #[test]
    fn test_records_carry_frames() {
        let report = engine(&Scenario::default()).run_iterations(&StimulusAction::default(), 1);
        let frames = &report.records[0].frames;
        assert_eq!(frames.pre.as_ref().map(|f| f.tag.as_str()), Some("pre"));
        assert_eq!(frames.main.as_ref().map(|f| f.tag.as_str()), Some("main"));
        assert_eq!(frames.post.as_ref().map(|f| f.tag.as_str()), Some("post"));
    }

    #[test]
    fn test_cancel_before_start() {
        let engine = engine(&Scenario::default());
        engine.cancel_token().cancel();
        let report = engine.run_iterations(&StimulusAction::default(), 4);

        assert!(report.cancelled);
        assert!(!report.overall_success);
        assert!(report.records.is_empty());
    }

    #[test]
    fn test_progress_events_in_order() {
        let (sender, receiver) = channel::unbounded();
        let scenario = Scenario::uniform(IterationScript {
            motion: DetectorAnswer::Miss,
            ..IterationScript::default()
        });
        let report = engine(&scenario)
            .with_progress(sender)
            .run_iterations(&StimulusAction::default(), 1);

        let events: Vec<ProgressEvent> = receiver.try_iter().collect();
        assert!(matches!(events[0], ProgressEvent::RunStarted { .. }));
        assert_eq!(events[1], ProgressEvent::IterationStarted { iteration: 1 });
        assert!(matches!(
            events[2],
            ProgressEvent::ActionCompleted { success: true, .. }
        ));
        assert_eq!(
            events[3],
            ProgressEvent::AnalysisCompleted {
                iteration: 1,
                success: false,
                detection_method: DetectionMethod::Unset,
            }
        );
        assert_eq!(
            events[4],
            ProgressEvent::RunFinished {
                overall_success: false,
                cancelled: false,
            }
        );
        assert!(!report.overall_success);
    }

    #[test]
    fn test_report_serializes() {
        let report = engine(&Scenario::default()).run_iterations(&StimulusAction::default(), 2);
        let json: serde_json::Value = serde_json::from_str(&report.to_json().unwrap()).unwrap();
        assert_eq!(json["requested_iterations"], 2);
        assert_eq!(json["learned_method"], "primary");
        assert_eq!(json["records"].as_array().unwrap().len(), 2);
    }
}
