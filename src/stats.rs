//! Run statistics
//!
//! Counters, duration lists and distinct-value sets over all iterations of a
//! run. Rates are derived on demand and never stored.

use crate::types::{DetectionMethod, IterationRecord};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Aggregate statistics for one engine run
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Statistics {
    pub total_iterations: u64,
    pub successful_iterations: u64,
    pub action_failures: u64,
    pub recovered_iterations: u64,

    pub motion_analyzed_count: u64,
    pub motion_detected_count: u64,
    pub subtitles_analyzed_count: u64,
    pub subtitles_detected_count: u64,
    pub audio_speech_analyzed_count: u64,
    pub audio_speech_detected_count: u64,
    pub zapping_analyzed_count: u64,
    pub zapping_detected_count: u64,

    /// Stimulus execution durations (ms)
    pub action_durations_ms: Vec<f64>,
    /// Detected transition durations (ms)
    pub zapping_durations_ms: Vec<f64>,
    /// Gap (blackout) durations (ms)
    pub gap_durations_ms: Vec<f64>,

    pub subtitle_languages: BTreeSet<String>,
    pub speech_languages: BTreeSet<String>,
    pub channel_ids: BTreeSet<String>,

    /// Method of every successful transition detection, in iteration order
    pub detection_methods_used: Vec<DetectionMethod>,
}

/// Summary of a duration list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurationSummary {
    pub count: usize,
    pub mean: f64,
    pub min: f64,
    pub max: f64,
    pub stddev: f64,
    pub median: f64,
}

/// Derived rates, each `count / total_iterations`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rates {
    pub success_rate: f64,
    pub motion_rate: f64,
    pub subtitles_rate: f64,
    pub audio_speech_rate: f64,
    pub zapping_rate: f64,
}

fn rate(count: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

impl Statistics {
    pub fn success_rate(&self) -> f64 {
        rate(self.successful_iterations, self.total_iterations)
    }

    pub fn motion_rate(&self) -> f64 {
        rate(self.motion_detected_count, self.total_iterations)
    }

    pub fn subtitles_rate(&self) -> f64 {
        rate(self.subtitles_detected_count, self.total_iterations)
    }

    pub fn audio_speech_rate(&self) -> f64 {
        rate(self.audio_speech_detected_count, self.total_iterations)
    }

    pub fn zapping_rate(&self) -> f64 {
        rate(self.zapping_detected_count, self.total_iterations)
    }

    pub fn rates(&self) -> Rates {
        Rates {
            success_rate: self.success_rate(),
            motion_rate: self.motion_rate(),
            subtitles_rate: self.subtitles_rate(),
            audio_speech_rate: self.audio_speech_rate(),
            zapping_rate: self.zapping_rate(),
        }
    }

    pub fn action_duration_summary(&self) -> Option<DurationSummary> {
        summarize_durations(&self.action_durations_ms)
    }

    pub fn zapping_duration_summary(&self) -> Option<DurationSummary> {
        summarize_durations(&self.zapping_durations_ms)
    }

    pub fn gap_duration_summary(&self) -> Option<DurationSummary> {
        summarize_durations(&self.gap_durations_ms)
    }

    /// How often each detection method succeeded
    pub fn method_histogram(&self) -> BTreeMap<DetectionMethod, u64> {
        let mut histogram = BTreeMap::new();
        for method in &self.detection_methods_used {
            *histogram.entry(*method).or_insert(0) += 1;
        }
        histogram
    }
}

/// Summarize a duration list; `None` when it holds no finite value
///
/// Non-finite entries are ignored. Mean, min, max and median are computed on
/// the f64 values so they are exact; the standard deviation comes from Trueno.
pub fn summarize_durations(durations: &[f64]) -> Option<DurationSummary> {
    let mut sorted: Vec<f64> = durations
        .iter()
        .copied()
        .filter(|d| d.is_finite())
        .collect();
    if sorted.is_empty() {
        return None;
    }

    let mean = sorted.iter().sum::<f64>() / sorted.len() as f64;

    let as_f32: Vec<f32> = sorted.iter().map(|&d| d as f32).collect();
    let stddev = trueno::Vector::from_slice(&as_f32)
        .stddev()
        .ok()
        .filter(|s| s.is_finite())
        .unwrap_or(0.0) as f64;

    sorted.sort_by(f64::total_cmp);

    let mid = sorted.len() / 2;
    let median = if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    };

    Some(DurationSummary {
        count: sorted.len(),
        mean,
        min: sorted[0],
        max: sorted[sorted.len() - 1],
        stddev,
        median,
    })
}

/// Accumulates [`Statistics`] from finished iteration records
#[derive(Debug, Default)]
pub struct StatisticsAggregator {
    stats: Statistics,
}

impl StatisticsAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one finished iteration into the statistics
    ///
    /// Per-signal counters only move when that stage was attempted; stages
    /// skipped by the motion gate or by configuration leave them untouched.
    pub fn record(&mut self, record: &IterationRecord) {
        let stats = &mut self.stats;
        stats.total_iterations += 1;
        stats
            .action_durations_ms
            .push(record.execution_duration_ms as f64);

        if !record.action_success {
            stats.action_failures += 1;
        }
        if record.recovered {
            stats.recovered_iterations += 1;
        }
        if record.is_successful() {
            stats.successful_iterations += 1;
        }

        let Some(analysis) = &record.analysis else {
            return;
        };

        if analysis.motion.status.attempted() {
            stats.motion_analyzed_count += 1;
            if analysis.motion.detected {
                stats.motion_detected_count += 1;
            }
        }

        let subtitles = &analysis.subtitles;
        if subtitles.status.attempted() {
            stats.subtitles_analyzed_count += 1;
            if subtitles.detected {
                stats.subtitles_detected_count += 1;
                if let Some(lang) = &subtitles.language {
                    stats.subtitle_languages.insert(lang.clone());
                }
            }
        }

        let speech = &analysis.speech;
        if speech.status.attempted() {
            stats.audio_speech_analyzed_count += 1;
            if speech.detected {
                stats.audio_speech_detected_count += 1;
                if let Some(lang) = &speech.language {
                    stats.speech_languages.insert(lang.clone());
                }
            }
        }

        let transition = &analysis.transition;
        if transition.status.attempted() {
            stats.zapping_analyzed_count += 1;
            if transition.detected {
                stats.zapping_detected_count += 1;
                stats.detection_methods_used.push(transition.method);
                let duration = transition.transition_duration_ms.filter(|d| d.is_finite());
                if let Some(duration) = duration {
                    stats.zapping_durations_ms.push(duration);
                }
                if let Some(gap) = transition.gap_duration_ms.filter(|g| g.is_finite()) {
                    stats.gap_durations_ms.push(gap);
                }
            }
        }

        if let Some(channel) = &analysis.channel.channel_id {
            stats.channel_ids.insert(channel.clone());
        }
    }

    pub fn summary(&self) -> Statistics {
        self.stats.clone()
    }

    pub fn into_statistics(self) -> Statistics {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        AnalysisResult, ChannelAnalysis, IterationFrames, MotionAnalysis, SkipReason,
        SpeechAnalysis, StageStatus, SubtitleAnalysis, TransitionAnalysis,
    };

    fn skipped_analysis() -> AnalysisResult {
        AnalysisResult {
            motion: MotionAnalysis {
                status: StageStatus::Ran,
                detected: false,
                details: serde_json::Value::Null,
            },
            subtitles: SubtitleAnalysis::skipped(SkipReason::NoMotion),
            speech: SpeechAnalysis::skipped(SkipReason::NoMotion),
            transition: TransitionAnalysis::skipped(SkipReason::NoMotion),
            channel: ChannelAnalysis::skipped(SkipReason::NoMotion),
            success: false,
            message: "no motion".to_string(),
        }
    }

    fn full_analysis(lang: &str, method: DetectionMethod, duration: f64) -> AnalysisResult {
        let mut analysis = skipped_analysis();
        analysis.motion.detected = true;
        analysis.subtitles = SubtitleAnalysis {
            status: StageStatus::Ran,
            detected: true,
            text: Some("hello".to_string()),
            language: Some(lang.to_string()),
        };
        analysis.speech = SpeechAnalysis {
            status: StageStatus::Ran,
            detected: true,
            transcript: Some("hello".to_string()),
            language: Some(lang.to_string()),
        };
        analysis.transition.status = StageStatus::Ran;
        analysis.transition.detected = true;
        analysis.transition.method = method;
        analysis.transition.transition_duration_ms = Some(duration);
        analysis.channel = ChannelAnalysis {
            status: StageStatus::Ran,
            channel_id: Some("101".to_string()),
            channel_name: None,
        };
        analysis.success = true;
        analysis
    }

    fn record(i: usize, duration_ms: u64, analysis: Option<AnalysisResult>) -> IterationRecord {
        IterationRecord {
            iteration: i,
            action_id: "ch_up".to_string(),
            action_label: "Channel up".to_string(),
            started_at_ms: 0,
            ended_at_ms: Some(1),
            execution_duration_ms: duration_ms,
            device_duration_ms: duration_ms,
            action_success: analysis.is_some(),
            action_error: None,
            frames: IterationFrames::default(),
            analysis,
            recovered: false,
        }
    }

    #[test]
    fn test_empty_statistics_rates_are_zero() {
        let stats = StatisticsAggregator::new().summary();
        assert_eq!(stats.total_iterations, 0);
        assert_eq!(stats.success_rate(), 0.0);
        assert_eq!(stats.zapping_rate(), 0.0);
        assert!(stats.action_duration_summary().is_none());
    }

    #[test]
    fn test_skipped_stages_do_not_count() {
        let mut agg = StatisticsAggregator::new();
        agg.record(&record(1, 100, Some(skipped_analysis())));
        let stats = agg.summary();

        assert_eq!(stats.total_iterations, 1);
        assert_eq!(stats.motion_analyzed_count, 1);
        assert_eq!(stats.motion_detected_count, 0);
        assert_eq!(stats.subtitles_analyzed_count, 0);
        assert_eq!(stats.audio_speech_analyzed_count, 0);
        assert_eq!(stats.zapping_analyzed_count, 0);
        assert_eq!(stats.successful_iterations, 0);
    }

    #[test]
    fn test_languages_and_channels_are_distinct() {
        let mut agg = StatisticsAggregator::new();
        agg.record(&record(1, 100, Some(full_analysis("en", DetectionMethod::Primary, 900.0))));
        agg.record(&record(2, 120, Some(full_analysis("en", DetectionMethod::Primary, 1100.0))));
        agg.record(&record(3, 140, Some(full_analysis("de", DetectionMethod::Primary, 1000.0))));
        let stats = agg.summary();

        assert_eq!(stats.subtitle_languages.len(), 2);
        assert_eq!(stats.speech_languages.len(), 2);
        assert_eq!(stats.channel_ids.len(), 1);
        assert_eq!(stats.zapping_detected_count, 3);
        assert_eq!(stats.success_rate(), 1.0);
        assert_eq!(
            stats.method_histogram().get(&DetectionMethod::Primary),
            Some(&3)
        );
    }

    #[test]
    fn test_action_failure_counts_without_analysis() {
        let mut agg = StatisticsAggregator::new();
        agg.record(&record(1, 50, None));
        agg.record(&record(2, 70, Some(full_analysis("en", DetectionMethod::Secondary, 800.0))));
        let stats = agg.summary();

        assert_eq!(stats.total_iterations, 2);
        assert_eq!(stats.action_failures, 1);
        assert_eq!(stats.successful_iterations, 1);
        assert_eq!(stats.success_rate(), 0.5);
        assert_eq!(stats.action_durations_ms, vec![50.0, 70.0]);
    }

    #[test]
    fn test_duration_summary_single_element() {
        let summary = summarize_durations(&[250.0]).unwrap();
        assert_eq!(summary.count, 1);
        assert_eq!(summary.min, 250.0);
        assert_eq!(summary.max, 250.0);
        assert_eq!(summary.median, 250.0);
        assert!((summary.mean - 250.0).abs() < 1e-3);
    }

    #[test]
    fn test_duration_summary_values() {
        let summary = summarize_durations(&[300.0, 100.0, 200.0, 400.0]).unwrap();
        assert_eq!(summary.min, 100.0);
        assert_eq!(summary.max, 400.0);
        assert_eq!(summary.median, 250.0);
        assert_eq!(summary.mean, 250.0);
        assert!(summary.stddev > 0.0);
    }

    #[test]
    fn test_duration_summary_mean_is_exact() {
        let durations = [1234.567, 987.654, 1500.25];
        let summary = summarize_durations(&durations).unwrap();
        let expected = durations.iter().sum::<f64>() / 3.0;
        assert!((summary.mean - expected).abs() <= f64::EPSILON * expected);
    }

    #[test]
    fn test_duration_summary_ignores_non_finite() {
        let summary = summarize_durations(&[3.0, f64::NAN, 1.0, f64::INFINITY]).unwrap();
        assert_eq!(summary.count, 2);
        assert_eq!(summary.min, 1.0);
        assert_eq!(summary.max, 3.0);
        assert_eq!(summary.median, 2.0);
        assert_eq!(summary.mean, 2.0);

        assert!(summarize_durations(&[f64::NAN]).is_none());
    }

    #[test]
    fn test_non_finite_transition_durations_are_dropped() {
        let mut agg = StatisticsAggregator::new();
        let mut analysis = full_analysis("en", DetectionMethod::Primary, f64::NAN);
        analysis.transition.gap_duration_ms = Some(f64::INFINITY);
        agg.record(&record(1, 100, Some(analysis)));
        agg.record(&record(2, 100, Some(full_analysis("en", DetectionMethod::Primary, 900.0))));
        let stats = agg.summary();

        assert_eq!(stats.zapping_detected_count, 2);
        assert_eq!(stats.zapping_durations_ms, vec![900.0]);
        assert!(stats.gap_durations_ms.is_empty());
        let summary = stats.zapping_duration_summary().unwrap();
        assert_eq!((summary.min, summary.max), (900.0, 900.0));
    }
}
