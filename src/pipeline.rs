//! Gated analysis cascade run once per iteration
//!
//! ```text
//! motion gate ──no change──▶ everything else skipped
//!      │
//!      ▼ changed
//! subtitles, speech (unless audio disabled), channel info
//!      │
//!      ▼ forward stimulus only
//! transition (adaptive primary/secondary)
//! ```
//!
//! A failing stage only marks its own sub-result as failed; the cascade
//! always produces a complete [`AnalysisResult`].

use crate::adaptive::{AdaptiveTransitionDetector, TransitionRequest};
use crate::budget::DetectorBudget;
use crate::config::EngineConfig;
use crate::evidence::EvidenceCollector;
use crate::ports::DetectorPort;
use crate::types::{
    AnalysisRegion, AnalysisResult, ChannelAnalysis, FrameRef, LearnedMethod, MotionAnalysis,
    SkipReason, SpeechAnalysis, Stage, StageStatus, StimulusKind, SubtitleAnalysis,
    TransitionAnalysis,
};

/// Everything the pipeline needs to know about the current iteration
#[derive(Debug, Clone)]
pub struct IterationContext {
    /// Attached to the `analyze` span so stage logs can be joined to the run
    pub run_id: String,
    pub iteration: usize,
    pub stimulus_kind: StimulusKind,
    /// Settled frame captured after the settle delay
    pub main_frame: Option<FrameRef>,
    /// Frames recorded since the stimulus started
    pub window: Vec<FrameRef>,
}

/// Pipeline settings derived from [`EngineConfig`]
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub speech_enabled: bool,
    pub speech_segment_count: usize,
    pub regions: Vec<AnalysisRegion>,
}

impl From<&EngineConfig> for PipelineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            speech_enabled: config.speech_enabled(),
            speech_segment_count: config.speech_segment_count,
            regions: config.regions.clone(),
        }
    }
}

pub struct SignalPipeline {
    settings: PipelineSettings,
    detectors: Box<dyn DetectorPort + Send>,
    transition: AdaptiveTransitionDetector,
    budget: DetectorBudget,
}

impl SignalPipeline {
    pub fn new(config: &EngineConfig, detectors: Box<dyn DetectorPort + Send>) -> Self {
        Self {
            settings: PipelineSettings::from(config),
            detectors,
            transition: AdaptiveTransitionDetector::new(EvidenceCollector::new(
                config.evidence.similarity_threshold,
            )),
            budget: DetectorBudget::new(config.detector_budget()),
        }
    }

    pub fn learned_method(&self) -> LearnedMethod {
        self.transition.learned_method()
    }

    pub fn transition_detector(&self) -> &AdaptiveTransitionDetector {
        &self.transition
    }

    pub fn analyze(&mut self, ctx: &IterationContext) -> AnalysisResult {
        let span = tracing::debug_span!(
            "analyze",
            run_id = %ctx.run_id,
            iteration = ctx.iteration,
            stimulus = ?ctx.stimulus_kind
        );
        let _guard = span.enter();

        let motion = self.motion_gate();
        if !motion.detected {
            let reason = SkipReason::NoMotion;
            tracing::info!(
                motion_failed = motion.status.error().is_some(),
                "motion gate closed, skipping deeper analysis"
            );
            return compose(
                motion,
                SubtitleAnalysis::skipped(reason),
                SpeechAnalysis::skipped(reason),
                TransitionAnalysis::skipped(reason),
                ChannelAnalysis::skipped(reason),
            );
        }

        let settled: Vec<FrameRef> = ctx.main_frame.iter().cloned().collect();
        let subtitles = self.subtitles(&settled);
        let speech = self.speech();
        let channel = self.channel_info(ctx.main_frame.as_ref());

        let transition = match ctx.stimulus_kind {
            StimulusKind::Forward => {
                let request = TransitionRequest {
                    iteration: ctx.iteration,
                    window: &ctx.window,
                    regions: &self.settings.regions,
                };
                self.transition
                    .detect_transition(self.detectors.as_mut(), &self.budget, &request)
            }
            StimulusKind::Neutral => TransitionAnalysis::skipped(SkipReason::NeutralStimulus),
        };

        compose(motion, subtitles, speech, transition, channel)
    }

    fn motion_gate(&mut self) -> MotionAnalysis {
        let detectors = self.detectors.as_mut();
        match self.budget.call(Stage::Motion, || detectors.detect_motion()) {
            Ok(report) => MotionAnalysis {
                status: StageStatus::Ran,
                detected: report.changed,
                details: report.details,
            },
            Err(error) => {
                tracing::warn!(%error, "motion gate failed");
                MotionAnalysis::failed(error)
            }
        }
    }

    fn subtitles(&mut self, frames: &[FrameRef]) -> SubtitleAnalysis {
        let detectors = self.detectors.as_mut();
        match self
            .budget
            .call(Stage::Subtitles, || detectors.detect_subtitles(frames))
        {
            Ok(report) => SubtitleAnalysis {
                status: StageStatus::Ran,
                detected: report.detected,
                text: report.text,
                language: report.language,
            },
            Err(error) => {
                tracing::warn!(%error, "subtitle analysis failed");
                SubtitleAnalysis::failed(error)
            }
        }
    }

    fn speech(&mut self) -> SpeechAnalysis {
        if !self.settings.speech_enabled {
            return SpeechAnalysis::skipped(SkipReason::AudioDisabled);
        }

        let segments = self.settings.speech_segment_count;
        let detectors = self.detectors.as_mut();
        match self
            .budget
            .call(Stage::Speech, || detectors.detect_speech(segments))
        {
            Ok(report) => SpeechAnalysis {
                status: StageStatus::Ran,
                detected: report.detected,
                transcript: report.transcript,
                language: report.language,
            },
            Err(error) => {
                tracing::warn!(%error, "speech analysis failed");
                SpeechAnalysis::failed(error)
            }
        }
    }

    fn channel_info(&mut self, frame: Option<&FrameRef>) -> ChannelAnalysis {
        let detectors = self.detectors.as_mut();
        match self
            .budget
            .call(Stage::ChannelInfo, || detectors.detect_channel_info(frame))
        {
            Ok(report) => ChannelAnalysis {
                status: StageStatus::Ran,
                channel_id: report.channel_id,
                channel_name: report.channel_name,
            },
            Err(error) => {
                tracing::debug!(%error, "channel info unavailable");
                ChannelAnalysis::failed(error)
            }
        }
    }
}

/// Merge stage results; success means the motion gate saw a content change
fn compose(
    motion: MotionAnalysis,
    subtitles: SubtitleAnalysis,
    speech: SpeechAnalysis,
    transition: TransitionAnalysis,
    channel: ChannelAnalysis,
) -> AnalysisResult {
    let motion_message = match (&motion.status, motion.detected) {
        (StageStatus::Failed { error }, _) => format!("motion failed ({error})"),
        (_, true) => "motion detected".to_string(),
        (_, false) => "no motion detected".to_string(),
    };
    let message = format!(
        "{motion_message}; subtitles: {}; speech: {}; transition: {}",
        subtitles.message(),
        speech.message(),
        transition.message()
    );

    AnalysisResult {
        success: motion.detected,
        motion,
        subtitles,
        speech,
        transition,
        channel,
        message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DetectorFault, ErrorKind};
    use crate::ports::{
        ChannelReport, DetectorResult, MotionReport, PrimaryTransitionReport,
        SecondaryTransitionReport, SpeechReport, SubtitleReport,
    };
    use crate::types::DetectionMethod;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct FixedDetectors {
        motion: DetectorResult<bool>,
        subtitles_fail: bool,
        calls: Arc<Mutex<Vec<&'static str>>>,
    }

    impl FixedDetectors {
        fn new(motion: DetectorResult<bool>) -> Self {
            Self {
                motion,
                subtitles_fail: false,
                calls: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn log(&self, name: &'static str) {
            self.calls.lock().unwrap().push(name);
        }
    }

    impl DetectorPort for FixedDetectors {
        fn detect_motion(&mut self) -> DetectorResult<MotionReport> {
            self.log("motion");
            self.motion.clone().map(|changed| MotionReport {
                changed,
                details: serde_json::Value::Null,
            })
        }

        fn detect_subtitles(&mut self, frames: &[FrameRef]) -> DetectorResult<SubtitleReport> {
            self.log("subtitles");
            if self.subtitles_fail {
                return Err(DetectorFault::Failed("ocr engine crashed".to_string()));
            }
            Ok(SubtitleReport {
                detected: !frames.is_empty(),
                text: Some("Good evening".to_string()),
                language: Some("en".to_string()),
            })
        }

        fn detect_speech(&mut self, segment_count: usize) -> DetectorResult<SpeechReport> {
            self.log("speech");
            Ok(SpeechReport {
                detected: segment_count > 0,
                transcript: Some("news at nine".to_string()),
                language: Some("en".to_string()),
            })
        }

        fn detect_transition_primary(
            &mut self,
            _window: &[FrameRef],
            _regions: &[AnalysisRegion],
        ) -> DetectorResult<PrimaryTransitionReport> {
            self.log("primary");
            Ok(PrimaryTransitionReport {
                detected: true,
                duration_ms: Some(1_500.0),
                ..Default::default()
            })
        }

        fn detect_transition_secondary(
            &mut self,
            _window: &[FrameRef],
        ) -> DetectorResult<SecondaryTransitionReport> {
            self.log("secondary");
            Ok(SecondaryTransitionReport::default())
        }

        fn detect_channel_info(
            &mut self,
            _frame: Option<&FrameRef>,
        ) -> DetectorResult<ChannelReport> {
            self.log("channel");
            Ok(ChannelReport {
                channel_id: Some("7".to_string()),
                channel_name: Some("Seven".to_string()),
            })
        }
    }

    fn context(kind: StimulusKind) -> IterationContext {
        IterationContext {
            run_id: "run".to_string(),
            iteration: 1,
            stimulus_kind: kind,
            main_frame: Some(FrameRef {
                tag: "main".to_string(),
                path: "/f/main.jpg".to_string(),
                timestamp_ms: 10,
            }),
            window: Vec::new(),
        }
    }

    fn pipeline(config: &EngineConfig, detectors: FixedDetectors) -> SignalPipeline {
        SignalPipeline::new(config, Box::new(detectors))
    }

    #[test]
    fn test_no_motion_skips_everything() {
        let detectors = FixedDetectors::new(Ok(false));
        let calls = Arc::clone(&detectors.calls);
        let mut pipeline = pipeline(&EngineConfig::fast(), detectors);

        let result = pipeline.analyze(&context(StimulusKind::Forward));

        assert!(!result.success);
        assert!(result.subtitles.status.is_skipped());
        assert!(result.speech.status.is_skipped());
        assert!(result.transition.status.is_skipped());
        assert!(result.channel.status.is_skipped());
        assert_eq!(*calls.lock().unwrap(), vec!["motion"]);
        assert!(result.message.starts_with("no motion detected"));
    }

    #[test]
    fn test_motion_failure_closes_gate() {
        let detectors = FixedDetectors::new(Err(DetectorFault::Unavailable(
            "capture card missing".to_string(),
        )));
        let mut pipeline = pipeline(&EngineConfig::fast(), detectors);

        let result = pipeline.analyze(&context(StimulusKind::Forward));

        assert!(!result.success);
        assert_eq!(
            result.motion.status.error().map(|e| e.kind()),
            Some(ErrorKind::DetectorUnavailable)
        );
        assert!(result.transition.status.is_skipped());
    }

    #[test]
    fn test_forward_stimulus_runs_full_cascade() {
        let detectors = FixedDetectors::new(Ok(true));
        let calls = Arc::clone(&detectors.calls);
        let mut pipeline = pipeline(&EngineConfig::fast(), detectors);

        let result = pipeline.analyze(&context(StimulusKind::Forward));

        assert!(result.success);
        assert!(result.subtitle_detected());
        assert!(result.speech_detected());
        assert!(result.transition_detected());
        assert_eq!(result.detection_method(), DetectionMethod::Primary);
        assert_eq!(result.channel.channel_id.as_deref(), Some("7"));
        assert_eq!(pipeline.learned_method(), LearnedMethod::Primary);
        assert_eq!(
            *calls.lock().unwrap(),
            vec!["motion", "subtitles", "speech", "channel", "primary"]
        );
    }

    #[test]
    fn test_neutral_stimulus_skips_transition() {
        let detectors = FixedDetectors::new(Ok(true));
        let mut pipeline = pipeline(&EngineConfig::fast(), detectors);

        let result = pipeline.analyze(&context(StimulusKind::Neutral));

        assert!(result.success);
        assert_eq!(
            result.transition.status,
            StageStatus::skipped(SkipReason::NeutralStimulus)
        );
        assert_eq!(pipeline.learned_method(), LearnedMethod::Unlearned);
    }

    #[test]
    fn test_audio_disabled_device_skips_speech() {
        let config = EngineConfig {
            device_class: "host_vnc".to_string(),
            audio_disabled_device_classes: vec!["host_vnc".to_string()],
            ..EngineConfig::fast()
        };
        let detectors = FixedDetectors::new(Ok(true));
        let calls = Arc::clone(&detectors.calls);
        let mut pipeline = pipeline(&config, detectors);

        let result = pipeline.analyze(&context(StimulusKind::Forward));

        assert!(!result.speech_detected());
        assert!(result.speech.message().starts_with("skipped"));
        assert!(result.success);
        assert!(!calls.lock().unwrap().contains(&"speech"));
    }

    #[test]
    fn test_stage_error_is_contained() {
        let mut detectors = FixedDetectors::new(Ok(true));
        detectors.subtitles_fail = true;
        let mut pipeline = pipeline(&EngineConfig::fast(), detectors);

        let result = pipeline.analyze(&context(StimulusKind::Forward));

        assert_eq!(
            result.subtitles.status.error().map(|e| e.kind()),
            Some(ErrorKind::DetectorError)
        );
        assert!(result.speech_detected());
        assert!(result.transition_detected());
        assert!(result.success);
        assert!(result.message.contains("subtitles: failed"));
    }

    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_stage_logs_carry_run_id() {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        let mut pipeline = pipeline(&EngineConfig::fast(), FixedDetectors::new(Ok(false)));
        let ctx = IterationContext {
            run_id: "feedc0de".to_string(),
            ..context(StimulusKind::Forward)
        };

        tracing::subscriber::with_default(subscriber, || pipeline.analyze(&ctx));

        let logs = String::from_utf8(buffer.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("motion gate closed"));
        assert!(logs.contains("run_id=feedc0de"));
        assert!(logs.contains("iteration=1"));
    }
}
