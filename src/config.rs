use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::AppError;
use crate::pipeline::domain::{AlertBreakpoints, LabelCatalog, LabelEntry, RetrievalBudget};

const ENV_PREFIX: &str = "SITESAFE";
const DEFAULT_CONFIG_NAME: &str = "sitesafe";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub log_level: String,
    pub reports_dir: PathBuf,
    pub extraction: ExtractionConfig,
    pub detection: DetectionConfig,
    pub retrieval: RetrievalConfig,
    pub risk: RiskConfig,
    pub workers: WorkerConfig,
    pub calls: CallPolicies,
    pub labels: Vec<LabelEntry>,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            log_level: "INFO".to_string(),
            reports_dir: PathBuf::from("data/reports"),
            extraction: ExtractionConfig::default(),
            detection: DetectionConfig::default(),
            retrieval: RetrievalConfig::default(),
            risk: RiskConfig::default(),
            workers: WorkerConfig::default(),
            calls: CallPolicies::default(),
            labels: LabelCatalog::default_entries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    pub fps: u32,
    pub max_frames: usize,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            fps: 1,
            max_frames: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Detections below this confidence never leave the normalizer.
    pub confidence_threshold: f32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// RRF smoothing constant
    pub rrf_k: f64,
    /// Each ranking leg fetches `top_k * prefetch_multiplier` candidates before fusion
    pub prefetch_multiplier: usize,
    pub budget: RetrievalBudget,
    /// Query used for labels without a catalog entry; `{label}` is substituted.
    pub default_query_template: String,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            prefetch_multiplier: 3,
            budget: RetrievalBudget::default(),
            default_query_template: "{label} safety requirement construction site".to_string(),
        }
    }
}

impl RetrievalConfig {
    pub fn query_for(&self, catalog: &LabelCatalog, label: &str) -> String {
        catalog
            .get(label)
            .map(|entry| entry.query.clone())
            .unwrap_or_else(|| self.default_query_template.replace("{label}", label))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RiskConfig {
    pub breakpoints: AlertBreakpoints,
    /// Weight for violation labels without their own `severity_weight`
    pub default_violation_weight: u32,
    /// Added by the rule-based scorer when violations co-occur with machinery
    pub equipment_modifier: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            breakpoints: AlertBreakpoints::default(),
            default_violation_weight: 25,
            equipment_modifier: 15,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Maximum in-flight calls per external collaborator within one pipeline
    pub pool_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { pool_size: 4 }
    }
}

/// Timeout and retry policy for one collaborator. Has no default of its
/// own: missing keys are filled from that collaborator's entry in
/// `CallPolicies::default()` when loading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct CallPolicy {
    pub timeout_ms: u64,
    pub retry_once: bool,
}

impl CallPolicy {
    pub const fn new(timeout_ms: u64, retry_once: bool) -> Self {
        Self {
            timeout_ms,
            retry_once,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CallPolicies {
    pub frame_source: CallPolicy,
    pub primary_detector: CallPolicy,
    pub fallback_detector: CallPolicy,
    pub vector_index: CallPolicy,
    pub reasoning: CallPolicy,
    pub renderer: CallPolicy,
    /// Alerts are never retried.
    pub notifier: CallPolicy,
}

impl Default for CallPolicies {
    fn default() -> Self {
        Self {
            frame_source: CallPolicy::new(120_000, false),
            primary_detector: CallPolicy::new(15_000, true),
            fallback_detector: CallPolicy::new(45_000, true),
            vector_index: CallPolicy::new(10_000, true),
            reasoning: CallPolicy::new(60_000, true),
            renderer: CallPolicy::new(30_000, false),
            notifier: CallPolicy::new(10_000, false),
        }
    }
}

impl CallPolicies {
    /// Every policy with its configuration key.
    pub fn named(&self) -> [(&'static str, CallPolicy); 7] {
        [
            ("frame_source", self.frame_source),
            ("primary_detector", self.primary_detector),
            ("fallback_detector", self.fallback_detector),
            ("vector_index", self.vector_index),
            ("reasoning", self.reasoning),
            ("renderer", self.renderer),
            ("notifier", self.notifier),
        ]
    }
}

impl Configuration {
    /// Defaults, then `path` (or `./sitesafe.*` when present), then
    /// `SITESAFE__SECTION__KEY` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, AppError> {
        let mut builder = config::Config::builder();
        // Seed per-collaborator policies key by key so a partial override
        // keeps that collaborator's own defaults
        for (name, policy) in CallPolicies::default().named() {
            builder = builder
                .set_default(format!("calls.{}.timeout_ms", name), policy.timeout_ms)?
                .set_default(format!("calls.{}.retry_once", name), policy.retry_once)?;
        }
        builder = match path {
            Some(path) => builder.add_source(config::File::from(path).required(true)),
            None => builder.add_source(config::File::with_name(DEFAULT_CONFIG_NAME).required(false)),
        };
        let configuration: Configuration = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        configuration.validate().map_err(AppError::InvalidConfig)?;
        Ok(configuration)
    }

    pub fn label_catalog(&self) -> LabelCatalog {
        LabelCatalog::new(self.labels.iter().cloned())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.extraction.fps == 0 {
            return Err("Extraction fps must be greater than 0".to_string());
        }

        if self.extraction.max_frames == 0 {
            return Err("Extraction max_frames must be greater than 0".to_string());
        }

        let threshold = self.detection.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err("Confidence threshold must be between 0.0 and 1.0".to_string());
        }

        if !self.retrieval.rrf_k.is_finite() || self.retrieval.rrf_k <= 0.0 {
            return Err("RRF k must be a positive number".to_string());
        }

        if self.retrieval.prefetch_multiplier == 0 {
            return Err("Prefetch multiplier must be greater than 0".to_string());
        }

        if self.retrieval.budget.default_top_k == 0
            || self.retrieval.budget.tiers.values().any(|k| *k == 0)
        {
            return Err("Retrieval budgets must be greater than 0".to_string());
        }

        self.risk.breakpoints.validate()?;

        if self.workers.pool_size == 0 {
            return Err("Worker pool size must be greater than 0".to_string());
        }

        for (name, policy) in self.calls.named() {
            if policy.timeout_ms == 0 {
                return Err(format!("Timeout for {} must be greater than 0", name));
            }
        }

        // A retried alert may be delivered twice
        if self.calls.notifier.retry_once {
            return Err("Notifier must not retry".to_string());
        }

        if self.labels.is_empty() {
            return Err("Label catalog must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for entry in &self.labels {
            if !seen.insert(entry.name.trim().to_lowercase()) {
                return Err(format!("Duplicate label '{}' in catalog", entry.name));
            }
        }

        Ok(())
    }
}
