use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use crate::core::queue::QueueSettings;
use crate::core::runs::RunSettings;
use crate::core::runs::outbound::OutboundScope;
use crate::core::sandbox::SandboxConfig;
use crate::core::tools::ToolManifest;

pub const CONFIG_FILE: &str = "runcore.toml";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RuncoreConfig {
    #[serde(default)]
    pub store: StoreSection,
    #[serde(default)]
    pub queues: QueuesSection,
    #[serde(default)]
    pub runs: RunsSection,
    #[serde(default)]
    pub policy: PolicySection,
    #[serde(default)]
    pub sandbox: SandboxConfig,
    #[serde(default)]
    pub compaction: CompactionSection,
    #[serde(default)]
    pub outbound: OutboundSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub logging: LoggingSection,
    #[serde(default)]
    pub tools: Vec<ToolManifest>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreSection {
    /// Relative paths resolve against the data directory.
    #[serde(default = "default_db_file")]
    pub db_file: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueuesSection {
    #[serde(default = "default_runs_concurrency")]
    pub runs: usize,
    #[serde(default = "default_side_concurrency")]
    pub delivery: usize,
    #[serde(default = "default_side_concurrency")]
    pub memory: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunsSection {
    #[serde(default = "default_max_iterations")]
    pub default_max_iterations: u32,
    #[serde(default = "default_max_iterations_cap")]
    pub max_iterations_cap: u32,
    #[serde(default = "default_run_timeout_secs")]
    pub run_timeout_secs: u64,
    #[serde(default = "default_stale_after_secs")]
    pub stale_after_secs: u64,
    #[serde(default)]
    pub wake_on_any_child: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PolicySection {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompactionSection {
    /// Inbound turns kept live before the older half is summarized. `0` disables.
    #[serde(default = "default_turn_threshold")]
    pub turn_threshold: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboundSection {
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,
    #[serde(default)]
    pub scope: OutboundScope,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_tick_cron")]
    pub cron: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    #[serde(default = "default_provider_id")]
    pub provider: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Name of the environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default)]
    pub fallback_model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingSection {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_db_file() -> PathBuf {
    PathBuf::from("runcore.db")
}
fn default_runs_concurrency() -> usize {
    4
}
fn default_side_concurrency() -> usize {
    2
}
fn default_max_attempts() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1_000
}
fn default_max_iterations() -> u32 {
    25
}
fn default_max_iterations_cap() -> u32 {
    100
}
fn default_run_timeout_secs() -> u64 {
    3_600
}
fn default_stale_after_secs() -> u64 {
    300
}
fn default_cache_ttl_secs() -> u64 {
    30
}
fn default_turn_threshold() -> i64 {
    40
}
fn default_similarity_threshold() -> f64 {
    0.92
}
fn default_tick_cron() -> String {
    "*/5 * * * * *".to_string()
}
fn default_provider_id() -> String {
    "openai".to_string()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}
fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_llm_timeout_secs() -> u64 {
    120
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for StoreSection {
    fn default() -> Self {
        Self {
            db_file: default_db_file(),
        }
    }
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            runs: default_runs_concurrency(),
            delivery: default_side_concurrency(),
            memory: default_side_concurrency(),
            max_attempts: default_max_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

impl Default for RunsSection {
    fn default() -> Self {
        Self {
            default_max_iterations: default_max_iterations(),
            max_iterations_cap: default_max_iterations_cap(),
            run_timeout_secs: default_run_timeout_secs(),
            stale_after_secs: default_stale_after_secs(),
            wake_on_any_child: false,
        }
    }
}

impl Default for PolicySection {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for CompactionSection {
    fn default() -> Self {
        Self {
            turn_threshold: default_turn_threshold(),
        }
    }
}

impl Default for OutboundSection {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            scope: OutboundScope::default(),
        }
    }
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            cron: default_tick_cron(),
        }
    }
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider_id(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            model: default_model(),
            fallback_model: None,
            system_prompt: None,
            timeout_secs: default_llm_timeout_secs(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl RuncoreConfig {
    /// Load `path`, or `runcore.toml` in `data_dir` when no path is given.
    /// A missing default file yields the defaults.
    pub async fn load(path: Option<&Path>, data_dir: &Path) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => {
                let p = data_dir.join(CONFIG_FILE);
                if !p.exists() {
                    info!("No {} found, using defaults.", CONFIG_FILE);
                    return Ok(Self::default().validated());
                }
                p
            }
        };
        let content = tokio::fs::read_to_string(&config_path)
            .await
            .with_context(|| format!("reading {}", config_path.display()))?;
        let config: RuncoreConfig = toml::from_str(&content)
            .with_context(|| format!("parsing {}", config_path.display()))?;
        let config = config.validated();
        info!(
            "Loaded config from {}: {} tool(s), model {}",
            config_path.display(),
            config.tools.len(),
            config.llm.model
        );
        Ok(config)
    }

    /// Clamp values that would wedge the daemon.
    pub fn validated(mut self) -> Self {
        for (name, value) in [
            ("queues.runs", &mut self.queues.runs),
            ("queues.delivery", &mut self.queues.delivery),
            ("queues.memory", &mut self.queues.memory),
        ] {
            if *value == 0 {
                warn!("{} = 0 would stall the queue; using 1", name);
                *value = 1;
            }
        }
        if self.queues.max_attempts == 0 {
            warn!("queues.max_attempts = 0; using 1");
            self.queues.max_attempts = 1;
        }
        if self.runs.default_max_iterations == 0 {
            warn!("runs.default_max_iterations = 0; using {}", default_max_iterations());
            self.runs.default_max_iterations = default_max_iterations();
        }
        if self.runs.max_iterations_cap < self.runs.default_max_iterations {
            warn!(
                "runs.max_iterations_cap {} is below the default {}; raising it",
                self.runs.max_iterations_cap, self.runs.default_max_iterations
            );
            self.runs.max_iterations_cap = self.runs.default_max_iterations;
        }
        let threshold = self.outbound.similarity_threshold;
        if !(threshold > 0.0 && threshold <= 1.0) {
            warn!(
                "outbound.similarity_threshold {} is outside (0, 1]; using {}",
                threshold,
                default_similarity_threshold()
            );
            self.outbound.similarity_threshold = default_similarity_threshold();
        }
        self
    }

    pub fn db_path(&self, data_dir: &Path) -> PathBuf {
        if self.store.db_file.is_absolute() {
            self.store.db_file.clone()
        } else {
            data_dir.join(&self.store.db_file)
        }
    }

    pub fn run_settings(&self) -> RunSettings {
        RunSettings {
            default_max_iterations: self.runs.default_max_iterations,
            max_iterations_cap: self.runs.max_iterations_cap,
            run_timeout: Duration::from_secs(self.runs.run_timeout_secs),
            stale_after: Duration::from_secs(self.runs.stale_after_secs),
            wake_on_any_child: self.runs.wake_on_any_child,
            similarity_threshold: self.outbound.similarity_threshold,
            outbound_scope: self.outbound.scope,
        }
    }

    pub fn queue_settings(&self, concurrency: usize) -> QueueSettings {
        QueueSettings {
            concurrency,
            max_attempts: self.queues.max_attempts,
            retry_delay_ms: self.queues.retry_delay_ms,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::sandbox::NetworkPolicy;

    #[tokio::test]
    async fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = RuncoreConfig::load(None, dir.path()).await.unwrap();
        assert_eq!(config.runs.default_max_iterations, 25);
        assert_eq!(config.runs.max_iterations_cap, 100);
        assert_eq!(config.db_path(dir.path()), dir.path().join("runcore.db"));
        assert_eq!(config.run_settings(), RunSettings::default());
    }

    #[tokio::test]
    async fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custom.toml");
        tokio::fs::write(
            &path,
            r#"
            [runs]
            max_iterations_cap = 10

            [sandbox]
            timeout_ms = 5000
            network = "allow"

            [outbound]
            scope = "context"

            [[tools]]
            name = "web.fetch"
            classification = "READ"
            handler = { kind = "wasm", module = "/opt/tools/fetch.wasm" }
            "#,
        )
        .await
        .unwrap();

        let config = RuncoreConfig::load(Some(&path), dir.path()).await.unwrap();
        // The cap was below the default and got raised.
        assert_eq!(config.runs.max_iterations_cap, 25);
        assert_eq!(config.sandbox.timeout_ms, 5000);
        assert_eq!(config.sandbox.network_policy, NetworkPolicy::Allow);
        assert_eq!(config.sandbox.memory_limit_mb, 256);
        assert_eq!(config.outbound.scope, OutboundScope::Context);
        assert_eq!(config.tools.len(), 1);
        assert_eq!(config.llm.model, "gpt-4o-mini");
    }

    #[test]
    fn zero_concurrency_is_clamped() {
        let mut config = RuncoreConfig::default();
        config.queues.runs = 0;
        config.outbound.similarity_threshold = 3.0;
        let config = config.validated();
        assert_eq!(config.queues.runs, 1);
        assert_eq!(config.outbound.similarity_threshold, 0.92);
    }
}
