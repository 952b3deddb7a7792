//! Engine configuration
//!
//! Loaded from TOML; every field has a default so a partial file works.
//!
//! ```toml
//! iterations = 20
//! settle_delay_ms = 3000
//! device_class = "android_tv"
//! audio_disabled_device_classes = ["host_vnc"]
//!
//! [[regions]]
//! x = 0
//! y = 0
//! width = 1920
//! height = 1080
//!
//! [evidence]
//! similarity_threshold = 5.0
//! ```

use crate::error::ConfigError;
use crate::types::AnalysisRegion;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

/// Failure-evidence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvidenceConfig {
    /// Frame-difference level below which a failed secondary detection is
    /// considered a near miss and gets evidence frames attached
    pub similarity_threshold: f64,
}

impl Default for EvidenceConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 5.0,
        }
    }
}

/// Configuration for one engine run
///
/// # Example
/// ```
/// use zapline::config::EngineConfig;
///
/// let config = EngineConfig::default();
/// assert_eq!(config.settle_delay_ms, 3000);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Default iteration count when the caller does not pass one
    pub iterations: usize,

    /// Wait between the stimulus and the frame used for analysis, so that
    /// transient banners have cleared
    pub settle_delay_ms: u64,

    /// Device class of the device under test (e.g., "android_tv", "stb")
    pub device_class: String,

    /// Device classes that produce no audio; speech analysis is skipped for them
    pub audio_disabled_device_classes: Vec<String>,

    /// Number of audio segments handed to the speech detector
    pub speech_segment_count: usize,

    /// Regions the primary transition detector inspects
    pub regions: Vec<AnalysisRegion>,

    pub evidence: EvidenceConfig,

    /// Per-call budget for detector calls; `None` disables the check
    pub detector_budget_ms: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            iterations: 10,
            settle_delay_ms: 3000,
            device_class: "stb".to_string(),
            audio_disabled_device_classes: Vec::new(),
            speech_segment_count: 2,
            regions: vec![AnalysisRegion::full_hd()],
            evidence: EvidenceConfig::default(),
            detector_budget_ms: None,
        }
    }
}

impl EngineConfig {
    /// Zero settle delay, for simulations and tests
    pub fn fast() -> Self {
        Self {
            settle_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;

        Self::from_toml_str(&content)
            .with_context(|| format!("Invalid engine configuration in {}", path.display()))
    }

    /// Load configuration from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.regions.is_empty() {
            return Err(ConfigError::NoRegions);
        }

        if let Some((index, region)) = self
            .regions
            .iter()
            .enumerate()
            .find(|(_, r)| r.width == 0 || r.height == 0)
        {
            return Err(ConfigError::EmptyRegion {
                index,
                width: region.width,
                height: region.height,
            });
        }

        let threshold = self.evidence.similarity_threshold;
        if !threshold.is_finite() || threshold < 0.0 {
            return Err(ConfigError::InvalidSimilarityThreshold(threshold));
        }

        if self.speech_segment_count == 0 {
            return Err(ConfigError::InvalidSegmentCount(self.speech_segment_count));
        }

        if self.detector_budget_ms == Some(0) {
            return Err(ConfigError::ZeroDetectorBudget);
        }

        Ok(())
    }

    /// Whether speech analysis runs for the configured device class
    pub fn speech_enabled(&self) -> bool {
        !self
            .audio_disabled_device_classes
            .iter()
            .any(|c| c.eq_ignore_ascii_case(&self.device_class))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn detector_budget(&self) -> Option<Duration> {
        self.detector_budget_ms.map(Duration::from_millis)
    }
}
