use crate::canon::CanonProfile;
use crate::error::Result;
use crate::paths;
use crate::policy::{default_rules, PolicyEngine, PolicyRule, MAX_PAYLOAD_BYTES};
use crate::registry::{default_actions, ActionSpec, StaticRegistry};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

// ---------------------------------------------------------------------------
// QueueConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_lease_ttl_ms")]
    pub lease_ttl_ms: u64,
    #[serde(default = "default_max_reassigns")]
    pub max_reassigns: u32,
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_worker_tick_ms")]
    pub worker_tick_ms: u64,
}

fn default_lease_ttl_ms() -> u64 {
    30_000
}

fn default_max_reassigns() -> u32 {
    3
}

fn default_sweep_interval_ms() -> u64 {
    1_000
}

fn default_worker_tick_ms() -> u64 {
    250
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: default_lease_ttl_ms(),
            max_reassigns: default_max_reassigns(),
            sweep_interval_ms: default_sweep_interval_ms(),
            worker_tick_ms: default_worker_tick_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// IntentConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanProfile {
    #[serde(default = "default_true")]
    pub null_strip: bool,
    #[serde(default = "default_true")]
    pub num_norm: bool,
}

fn default_true() -> bool {
    true
}

impl Default for PlanProfile {
    fn default() -> Self {
        Self {
            null_strip: true,
            num_norm: true,
        }
    }
}

impl PlanProfile {
    pub fn profile(&self) -> CanonProfile {
        CanonProfile {
            null_strip: self.null_strip,
            num_norm: self.num_norm,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntentConfig {
    #[serde(default = "default_preview_ttl_secs")]
    pub preview_ttl_secs: u64,
    #[serde(default = "default_confirm_phrase")]
    pub default_confirm_phrase: String,
    #[serde(default)]
    pub plan_profile: PlanProfile,
    /// Hard ceiling on canonical draft payload size, checked before policy.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: u64,
}

fn default_max_payload_bytes() -> u64 {
    4 * MAX_PAYLOAD_BYTES
}

fn default_preview_ttl_secs() -> u64 {
    600
}

fn default_confirm_phrase() -> String {
    "DUAL_CONTROL".to_string()
}

impl Default for IntentConfig {
    fn default() -> Self {
        Self {
            preview_ttl_secs: default_preview_ttl_secs(),
            default_confirm_phrase: default_confirm_phrase(),
            plan_profile: PlanProfile::default(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// AnchorConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnchorConfig {
    /// Minutes after UTC midnight at which the anchor day rolls over.
    #[serde(default)]
    pub boundary_offset_minutes: i64,
    #[serde(default = "default_seal_interval_secs")]
    pub seal_interval_secs: u64,
}

fn default_seal_interval_secs() -> u64 {
    60
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            boundary_offset_minutes: 0,
            seal_interval_secs: default_seal_interval_secs(),
        }
    }
}

// ---------------------------------------------------------------------------
// PolicyConfig / WorkerConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_rules")]
    pub rules: Vec<PolicyRule>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            rules: default_rules(),
        }
    }
}

/// In-process worker loop run by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    /// Topics served by the built-in handler. Empty means every action topic.
    #[serde(default)]
    pub topics: Vec<String>,
}

fn default_worker_id() -> String {
    "builtin-1".to_string()
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            worker_id: default_worker_id(),
            topics: Vec::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub intent: IntentConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default = "default_actions")]
    pub actions: Vec<ActionSpec>,
    #[serde(default)]
    pub worker: WorkerConfig,
}

fn default_version() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            queue: QueueConfig::default(),
            intent: IntentConfig::default(),
            anchor: AnchorConfig::default(),
            policy: PolicyConfig::default(),
            actions: default_actions(),
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Load `veriq.yaml` under `root`, falling back to defaults when the
    /// file does not exist yet.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(&path)?;
        let cfg: Config = serde_yaml::from_str(&data)?;
        Ok(cfg)
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let path = paths::config_path(root);
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(&path, data.as_bytes())
    }

    /// Topics the built-in worker serves.
    pub fn worker_topics(&self) -> Vec<String> {
        if !self.worker.topics.is_empty() {
            return self.worker.topics.clone();
        }
        let mut topics: Vec<String> = self.actions.iter().map(|a| a.topic.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();
        let mut error = |message: String| {
            warnings.push(ConfigWarning {
                level: WarnLevel::Error,
                message,
            })
        };

        if self.queue.lease_ttl_ms == 0 {
            error("queue.lease_ttl_ms must be greater than zero".into());
        }
        if self.intent.preview_ttl_secs == 0 {
            error("intent.preview_ttl_secs must be greater than zero".into());
        }
        if self.intent.max_payload_bytes == 0 {
            error("intent.max_payload_bytes must be greater than zero".into());
        }
        if self.intent.default_confirm_phrase.trim().is_empty() {
            error("intent.default_confirm_phrase is empty".into());
        }
        if !(0..24 * 60).contains(&self.anchor.boundary_offset_minutes) {
            error("anchor.boundary_offset_minutes must be within 0..1440".into());
        }
        if let Err(e) = PolicyEngine::new(&self.policy.rules, Arc::new(crate::clock::SystemClock)) {
            error(e.to_string());
        }
        if let Err(e) = StaticRegistry::new(self.actions.clone()) {
            error(e.to_string());
        }

        let mut names = HashSet::new();
        for rule in &self.policy.rules {
            if !names.insert(rule.name()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!("policy rule '{}' is declared more than once", rule.name()),
                });
            }
        }
        if self.queue.sweep_interval_ms > self.queue.lease_ttl_ms {
            warnings.push(ConfigWarning {
                level: WarnLevel::Warning,
                message: "queue.sweep_interval_ms exceeds lease_ttl_ms; expired leases will linger"
                    .into(),
            });
        }
        for action in &self.actions {
            if action.confirm_phrase.as_deref().is_some_and(|p| p.trim().is_empty()) {
                warnings.push(ConfigWarning {
                    level: WarnLevel::Warning,
                    message: format!(
                        "action {}:{} has an empty confirm_phrase",
                        action.schema_id, action.version
                    ),
                });
            }
        }
        warnings
    }

    pub fn has_errors(warnings: &[ConfigWarning]) -> bool {
        warnings.iter().any(|w| w.level == WarnLevel::Error)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
