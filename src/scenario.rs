//! Scripted device and detectors
//!
//! A [`Scenario`] describes, per iteration, what the device and each
//! detector answer. It drives the engine without hardware: the `zapline`
//! binary replays scenario files, and the test suites build scenarios in
//! code. Every detector call is written to a shared [`CallLog`].
//!
//! ```toml
//! device_id = "sim-stb-01"
//! window_size = 8
//!
//! [baseline]
//! primary = "miss"
//! secondary = "detect"
//!
//! [[overrides]]
//! index = 3
//! script = { action_fails = true }
//! ```

use crate::error::{CaptureError, DetectorFault};
use crate::ports::{
    ActionOutcome, ChannelReport, DetectorPort, DetectorResult, DeviceContext, MotionReport,
    PrimaryTransitionReport, SecondaryTransitionReport, SpeechReport, SubtitleReport,
};
use crate::types::{AnalysisRegion, DeviceCommand, FrameRef, StimulusAction};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// What a scripted detector answers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DetectorAnswer {
    #[default]
    Detect,
    Miss,
    Error,
    Unavailable,
}

/// Device and detector behavior for one iteration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationScript {
    pub action_fails: bool,
    /// Duration the device reports for the stimulus
    pub action_duration_ms: u64,
    /// Time the stimulus actually blocks for
    pub action_delay_ms: u64,
    pub motion: DetectorAnswer,
    pub subtitles: DetectorAnswer,
    pub subtitle_text: Option<String>,
    pub subtitle_language: Option<String>,
    pub speech: DetectorAnswer,
    pub transcript: Option<String>,
    pub speech_language: Option<String>,
    pub primary: DetectorAnswer,
    pub secondary: DetectorAnswer,
    pub transition_duration_ms: f64,
    pub gap_duration_ms: Option<f64>,
    pub frame_diffs: Vec<f64>,
    /// Channel the banner shows; no channel means the detector is unavailable
    pub channel_id: Option<String>,
    /// Artificial latency added to every detector call
    pub detector_delay_ms: u64,
}

impl Default for IterationScript {
    fn default() -> Self {
        Self {
            action_fails: false,
            action_duration_ms: 120,
            action_delay_ms: 0,
            motion: DetectorAnswer::Detect,
            subtitles: DetectorAnswer::Miss,
            subtitle_text: None,
            subtitle_language: None,
            speech: DetectorAnswer::Miss,
            transcript: None,
            speech_language: None,
            primary: DetectorAnswer::Detect,
            secondary: DetectorAnswer::Detect,
            transition_duration_ms: 1_500.0,
            gap_duration_ms: None,
            frame_diffs: Vec::new(),
            channel_id: None,
            detector_delay_ms: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationOverride {
    /// 1-based iteration the script applies to
    pub index: usize,
    pub script: IterationScript,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Scenario {
    pub device_id: String,
    /// Frames in each analysis window
    pub window_size: usize,
    pub recovery_succeeds: bool,
    /// Stimulus to replay; the binary falls back to channel-up
    pub action: Option<StimulusAction>,
    /// Script for every iteration without an override
    pub baseline: IterationScript,
    pub overrides: Vec<IterationOverride>,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            device_id: "sim-stb-01".to_string(),
            window_size: 8,
            recovery_succeeds: true,
            action: None,
            baseline: IterationScript::default(),
            overrides: Vec::new(),
        }
    }
}

impl Scenario {
    /// Same script for every iteration
    pub fn uniform(script: IterationScript) -> Self {
        Self {
            baseline: script,
            ..Self::default()
        }
    }

    pub fn with_override(mut self, index: usize, script: IterationScript) -> Self {
        self.overrides.retain(|o| o.index != index);
        self.overrides.push(IterationOverride { index, script });
        self
    }

    pub fn with_device_id(mut self, device_id: impl Into<String>) -> Self {
        self.device_id = device_id.into();
        self
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse scenario TOML")
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid scenario in {}", path.display()))
    }

    pub fn script_for(&self, iteration: usize) -> &IterationScript {
        self.overrides
            .iter()
            .find(|o| o.index == iteration)
            .map(|o| &o.script)
            .unwrap_or(&self.baseline)
    }

    /// Build a device, a detector set and the call log they share
    pub fn build(&self) -> (ScriptedDevice, ScriptedDetectors, CallLog) {
        let scenario = Arc::new(self.clone());
        let cursor = Arc::new(AtomicUsize::new(0));
        let log = CallLog::default();

        let device = ScriptedDevice {
            scenario: Arc::clone(&scenario),
            cursor: Arc::clone(&cursor),
            log: log.clone(),
        };
        let detectors = ScriptedDetectors {
            scenario,
            cursor,
            log: log.clone(),
        };
        (device, detectors, log)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectorCall {
    pub iteration: usize,
    pub name: &'static str,
    /// Frames handed to the detector, if it takes any
    pub frames: Vec<FrameRef>,
}

/// Shared, ordered log of device and detector calls
#[derive(Debug, Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<DetectorCall>>>);

impl CallLog {
    fn push(&self, iteration: usize, name: &'static str) {
        self.push_with_frames(iteration, name, Vec::new());
    }

    fn push_with_frames(&self, iteration: usize, name: &'static str, frames: Vec<FrameRef>) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DetectorCall {
                iteration,
                name,
                frames,
            });
    }

    pub fn calls(&self) -> Vec<DetectorCall> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn count(&self, name: &str) -> usize {
        self.calls().iter().filter(|c| c.name == name).count()
    }

    /// Iterations in which `name` was called, in call order
    pub fn iterations_for(&self, name: &str) -> Vec<usize> {
        self.calls()
            .iter()
            .filter(|c| c.name == name)
            .map(|c| c.iteration)
            .collect()
    }

    /// Frames `name` received, one entry per call
    pub fn frames_for(&self, name: &str) -> Vec<Vec<FrameRef>> {
        self.calls()
            .into_iter()
            .filter(|c| c.name == name)
            .map(|c| c.frames)
            .collect()
    }
}

pub struct ScriptedDevice {
    scenario: Arc<Scenario>,
    cursor: Arc<AtomicUsize>,
    log: CallLog,
}

impl ScriptedDevice {
    fn iteration(&self) -> usize {
        self.cursor.load(Ordering::SeqCst)
    }

    fn frame(&self, tag: String, timestamp_ms: u64) -> FrameRef {
        FrameRef {
            path: format!(
                "{}/iter{:04}_{}.png",
                self.scenario.device_id,
                self.iteration(),
                tag
            ),
            tag,
            timestamp_ms,
        }
    }
}

impl DeviceContext for ScriptedDevice {
    fn device_id(&self) -> &str {
        &self.scenario.device_id
    }

    fn execute_action(&mut self, _action: &StimulusAction) -> ActionOutcome {
        let iteration = self.cursor.fetch_add(1, Ordering::SeqCst) + 1;
        self.log.push(iteration, "action");
        let script = self.scenario.script_for(iteration);
        if script.action_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(script.action_delay_ms));
        }
        if script.action_fails {
            ActionOutcome::failed(script.action_duration_ms, "scripted action failure")
        } else {
            ActionOutcome::ok(script.action_duration_ms)
        }
    }

    fn execute_recovery(&mut self, _commands: &[DeviceCommand]) -> ActionOutcome {
        self.log.push(self.iteration(), "recovery");
        if self.scenario.recovery_succeeds {
            ActionOutcome::ok(50)
        } else {
            ActionOutcome::failed(50, "scripted recovery failure")
        }
    }

    fn capture_frame(&mut self, tag: &str) -> Result<FrameRef, CaptureError> {
        Ok(self.frame(tag.to_string(), now_ms()))
    }

    fn analysis_window(&mut self, since_ms: u64) -> Vec<FrameRef> {
        (0..self.scenario.window_size)
            .map(|k| self.frame(format!("window_{k}"), since_ms + k as u64 * 40))
            .collect()
    }
}

pub struct ScriptedDetectors {
    scenario: Arc<Scenario>,
    cursor: Arc<AtomicUsize>,
    log: CallLog,
}

impl ScriptedDetectors {
    /// Log the call, apply latency and resolve the scripted answer
    fn answer(
        &self,
        name: &'static str,
        frames: &[FrameRef],
        pick: fn(&IterationScript) -> DetectorAnswer,
    ) -> (DetectorResult<bool>, &IterationScript) {
        let iteration = self.cursor.load(Ordering::SeqCst);
        self.log.push_with_frames(iteration, name, frames.to_vec());

        let script = self.scenario.script_for(iteration);
        if script.detector_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(script.detector_delay_ms));
        }

        let result = match pick(script) {
            DetectorAnswer::Detect => Ok(true),
            DetectorAnswer::Miss => Ok(false),
            DetectorAnswer::Error => Err(DetectorFault::Failed(format!("scripted {name} error"))),
            DetectorAnswer::Unavailable => Err(DetectorFault::Unavailable(format!(
                "scripted {name} detector offline"
            ))),
        };
        (result, script)
    }
}

impl DetectorPort for ScriptedDetectors {
    fn detect_motion(&mut self) -> DetectorResult<MotionReport> {
        let (result, _) = self.answer("motion", &[], |s| s.motion);
        result.map(|changed| MotionReport {
            changed,
            details: json!({ "source": "scripted" }),
        })
    }

    fn detect_subtitles(&mut self, frames: &[FrameRef]) -> DetectorResult<SubtitleReport> {
        let (result, script) = self.answer("subtitles", frames, |s| s.subtitles);
        let detected = result?;
        Ok(SubtitleReport {
            detected,
            text: detected.then(|| {
                script
                    .subtitle_text
                    .clone()
                    .unwrap_or_else(|| "Scripted subtitle".to_string())
            }),
            language: detected.then(|| {
                script
                    .subtitle_language
                    .clone()
                    .unwrap_or_else(|| "en".to_string())
            }),
        })
    }

    fn detect_speech(&mut self, _segment_count: usize) -> DetectorResult<SpeechReport> {
        let (result, script) = self.answer("speech", &[], |s| s.speech);
        let detected = result?;
        Ok(SpeechReport {
            detected,
            transcript: detected.then(|| {
                script
                    .transcript
                    .clone()
                    .unwrap_or_else(|| "scripted transcript".to_string())
            }),
            language: detected.then(|| {
                script
                    .speech_language
                    .clone()
                    .unwrap_or_else(|| "en".to_string())
            }),
        })
    }

    fn detect_transition_primary(
        &mut self,
        window: &[FrameRef],
        _regions: &[AnalysisRegion],
    ) -> DetectorResult<PrimaryTransitionReport> {
        let (result, script) = self.answer("primary", window, |s| s.primary);
        let detected = result?;
        Ok(PrimaryTransitionReport {
            detected,
            duration_ms: detected.then_some(script.transition_duration_ms),
            gap_ms: if detected { script.gap_duration_ms } else { None },
            kpi_timestamp_ms: detected
                .then(|| window.first().map(|f| f.timestamp_ms))
                .flatten(),
            metadata: json!({ "source": "scripted", "window": window.len() }),
            evidence_frames: Vec::new(),
        })
    }

    fn detect_transition_secondary(
        &mut self,
        window: &[FrameRef],
    ) -> DetectorResult<SecondaryTransitionReport> {
        let (result, script) = self.answer("secondary", window, |s| s.secondary);
        let detected = result?;
        Ok(SecondaryTransitionReport {
            detected,
            duration_ms: detected.then_some(script.transition_duration_ms),
            kpi_timestamp_ms: detected
                .then(|| window.last().map(|f| f.timestamp_ms))
                .flatten(),
            frame_diffs: script.frame_diffs.clone(),
        })
    }

    fn detect_channel_info(&mut self, frame: Option<&FrameRef>) -> DetectorResult<ChannelReport> {
        let iteration = self.cursor.load(Ordering::SeqCst);
        self.log
            .push_with_frames(iteration, "channel", frame.into_iter().cloned().collect());
        match &self.scenario.script_for(iteration).channel_id {
            Some(id) => Ok(ChannelReport {
                channel_id: Some(id.clone()),
                channel_name: Some(format!("Channel {id}")),
            }),
            None => Err(DetectorFault::Unavailable(
                "no channel banner scripted".to_string(),
            )),
        }
    }
}
