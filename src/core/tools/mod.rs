//! Tool registry: names, classifications and how each tool is executed.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::core::command::is_tool_command_name;
use crate::core::error::{CoreError, CoreResult};
use crate::core::runs::Run;
use crate::core::sandbox::{
    SandboxConfig, SandboxContext, SandboxExecutor, SandboxHandler, SandboxOverrides, SandboxResult,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Classification {
    Read,
    Write,
    Destruct,
    Sensitive,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Read => "READ",
            Classification::Write => "WRITE",
            Classification::Destruct => "DESTRUCT",
            Classification::Sensitive => "SENSITIVE",
        }
    }
}

/// A trusted handler running inside the worker process. It sees the full
/// run and is not preemptible.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn call(&self, run: &Run, args: &Map<String, Value>) -> Result<Value, String>;
}

#[derive(Clone)]
pub enum ToolExecution {
    InProcess(Arc<dyn ToolHandler>),
    Sandboxed {
        handler: SandboxHandler,
        config: SandboxConfig,
    },
}

#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub classification: Classification,
    pub execution: ToolExecution,
    /// Opaque per-tool settings forwarded to sandboxed handlers.
    pub config: Value,
}

impl ToolDefinition {
    pub fn in_process(
        name: &str,
        classification: Classification,
        description: &str,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            classification,
            execution: ToolExecution::InProcess(handler),
            config: Value::Null,
        }
    }
}

/// A `[[tools]]` entry from the daemon config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolManifest {
    pub name: String,
    pub classification: Classification,
    #[serde(default)]
    pub description: String,
    pub handler: SandboxHandler,
    #[serde(default)]
    pub sandbox: SandboxOverrides,
    #[serde(default)]
    pub config: Value,
}

impl ToolManifest {
    pub fn into_definition(self, defaults: &SandboxConfig) -> ToolDefinition {
        ToolDefinition {
            execution: ToolExecution::Sandboxed {
                handler: self.handler,
                config: defaults.with_overrides(&self.sandbox),
            },
            name: self.name,
            description: self.description,
            classification: self.classification,
            config: self.config,
        }
    }
}

/// Outcome of one tool execution, independent of where it ran.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolOutcome {
    pub success: bool,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub elapsed_ms: u64,
    pub timed_out: bool,
}

impl ToolOutcome {
    pub fn to_json(&self) -> Value {
        if self.success {
            json!({
                "success": true,
                "result": self.result.clone().unwrap_or(Value::Null),
                "elapsedMs": self.elapsed_ms,
            })
        } else {
            json!({
                "success": false,
                "error": self.error.clone().unwrap_or_default(),
                "elapsedMs": self.elapsed_ms,
                "timedOut": self.timed_out,
            })
        }
    }
}

impl From<SandboxResult> for ToolOutcome {
    fn from(r: SandboxResult) -> Self {
        Self {
            success: r.success,
            result: r.result,
            error: r.error,
            elapsed_ms: r.elapsed_ms,
            timed_out: r.timed_out,
        }
    }
}

pub struct ToolRegistry {
    tools: HashMap<String, ToolDefinition>,
    sandbox: Arc<dyn SandboxExecutor>,
}

impl ToolRegistry {
    pub fn new(sandbox: Arc<dyn SandboxExecutor>) -> Self {
        Self {
            tools: HashMap::new(),
            sandbox,
        }
    }

    pub fn register(&mut self, def: ToolDefinition) -> CoreResult<()> {
        if !is_tool_command_name(&def.name) {
            return Err(CoreError::Config(format!(
                "tool name `{}` is not of the form namespace.command",
                def.name
            )));
        }
        if self.tools.contains_key(&def.name) {
            warn!("Tool {} registered twice; keeping the latest", def.name);
        }
        info!("Registered tool {} ({})", def.name, def.classification.as_str());
        self.tools.insert(def.name.clone(), def);
        Ok(())
    }

    pub fn register_manifests(
        &mut self,
        manifests: &[ToolManifest],
        defaults: &SandboxConfig,
    ) -> CoreResult<()> {
        for manifest in manifests {
            self.register(manifest.clone().into_definition(defaults))?;
        }
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.get(name)
    }

    pub fn classification(&self, name: &str) -> Option<Classification> {
        self.tools.get(name).map(|t| t.classification)
    }

    /// Tools visible to a run, sorted by name.
    pub fn visible_to(&self, run: &Run) -> Vec<&ToolDefinition> {
        let mut tools: Vec<_> = self
            .tools
            .values()
            .filter(|t| run.is_tool_allowed(&t.name))
            .collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    pub async fn execute(&self, run: &Run, name: &str, args: &Map<String, Value>) -> ToolOutcome {
        let Some(def) = self.tools.get(name) else {
            return ToolOutcome {
                success: false,
                result: None,
                error: Some(format!("unknown tool `{name}`")),
                elapsed_ms: 0,
                timed_out: false,
            };
        };
        match &def.execution {
            ToolExecution::InProcess(handler) => {
                let started = Instant::now();
                let outcome = handler.call(run, args).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match outcome {
                    Ok(result) => ToolOutcome {
                        success: true,
                        result: Some(result),
                        error: None,
                        elapsed_ms,
                        timed_out: false,
                    },
                    Err(error) => ToolOutcome {
                        success: false,
                        result: None,
                        error: Some(error),
                        elapsed_ms,
                        timed_out: false,
                    },
                }
            }
            ToolExecution::Sandboxed { handler, config } => {
                let context = SandboxContext {
                    tenant_id: run.tenant_id.clone(),
                    agent_id: run.agent_id.clone(),
                    run_id: run.id.clone(),
                    user_id: run.user_id.clone(),
                    channel_id: run.channel_id.clone(),
                    tool_name: def.name.clone(),
                    tool_config: def.config.clone(),
                };
                self.sandbox
                    .execute(handler, &context, args, config)
                    .await
                    .into()
            }
        }
    }
}

/// `time.now`: current UTC time.
pub struct ClockTool;

#[async_trait]
impl ToolHandler for ClockTool {
    async fn call(&self, _run: &Run, _args: &Map<String, Value>) -> Result<Value, String> {
        let now = chrono::Utc::now();
        Ok(json!({ "utc": now.to_rfc3339(), "unix": now.timestamp() }))
    }
}

/// Registers the tools every worker carries.
pub fn register_builtins(registry: &mut ToolRegistry) -> CoreResult<()> {
    registry.register(ToolDefinition::in_process(
        "time.now",
        Classification::Read,
        "Current UTC time",
        Arc::new(ClockTool),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::runs::{RunKind, RunStatus};
    use crate::core::sandbox::IsolatedExecutor;

    fn sample_run() -> Run {
        let now = chrono::Utc::now();
        Run {
            id: "run-1".into(),
            tenant_id: "t1".into(),
            agent_id: "a1".into(),
            user_id: None,
            channel_id: None,
            context_id: None,
            parent_run_id: None,
            root_run_id: "run-1".into(),
            kind: RunKind::Coordinator,
            status: RunStatus::Running,
            input_text: None,
            input_json: None,
            output_text: None,
            allowed_tools: None,
            policy_profile: None,
            wake_at: None,
            wake_reason: None,
            iteration: 0,
            max_iterations: 25,
            pending_confirmation: None,
            cancel_reason: None,
            cancel_requested_at: None,
            cancel_requested_by: None,
            created_at: now,
            updated_at: now,
            finished_at: None,
        }
    }

    struct Failing;

    #[async_trait]
    impl ToolHandler for Failing {
        async fn call(&self, _run: &Run, _args: &Map<String, Value>) -> Result<Value, String> {
            Err("disk full".into())
        }
    }

    fn registry() -> ToolRegistry {
        let mut reg = ToolRegistry::new(Arc::new(IsolatedExecutor::new()));
        register_builtins(&mut reg).unwrap();
        reg.register(ToolDefinition::in_process(
            "files.write",
            Classification::Write,
            "",
            Arc::new(Failing),
        ))
        .unwrap();
        reg
    }

    #[test]
    fn rejects_malformed_names() {
        let mut reg = registry();
        let err = reg
            .register(ToolDefinition::in_process(
                "nodot",
                Classification::Read,
                "",
                Arc::new(ClockTool),
            ))
            .unwrap_err();
        assert!(matches!(err, CoreError::Config(_)));
        assert_eq!(reg.classification("files.write"), Some(Classification::Write));
        assert_eq!(reg.classification("files.read"), None);
    }

    #[tokio::test]
    async fn in_process_results_and_failures() {
        let reg = registry();
        let run = sample_run();

        let ok = reg.execute(&run, "time.now", &Map::new()).await;
        assert!(ok.success);
        assert!(ok.result.unwrap().get("utc").is_some());

        let failed = reg.execute(&run, "files.write", &Map::new()).await;
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert_eq!(failed.to_json()["success"], false);

        let unknown = reg.execute(&run, "nope.nope", &Map::new()).await;
        assert!(unknown.error.unwrap().contains("unknown tool"));
    }

    #[test]
    fn visibility_follows_allowed_tools() {
        let reg = registry();
        let mut run = sample_run();
        run.allowed_tools = Some(vec!["time.now".into()]);
        let names: Vec<_> = reg.visible_to(&run).iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["time.now"]);
    }

    #[test]
    fn manifests_from_toml() {
        let manifest: ToolManifest = toml::from_str(
            r#"
            name = "web.search"
            classification = "READ"
            handler = { kind = "process", program = "python3", args = ["search.py"] }
            sandbox = { timeout_ms = 5000, network = "allow" }
            config = { engine = "ddg" }
            "#,
        )
        .unwrap();
        let def = manifest.into_definition(&SandboxConfig::default());
        assert_eq!(def.classification, Classification::Read);
        assert_eq!(def.config["engine"], "ddg");
        match def.execution {
            ToolExecution::Sandboxed { config, .. } => {
                assert_eq!(config.timeout_ms, 5000);
                assert_eq!(config.network_policy, crate::core::sandbox::NetworkPolicy::Allow);
            }
            ToolExecution::InProcess(_) => panic!("expected sandboxed"),
        }
    }
}
