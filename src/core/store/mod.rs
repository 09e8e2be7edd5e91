//! SQLite persistence for runs, steps, policy rules, quota buckets and
//! conversation contexts.
//!
//! One connection behind an async mutex, like every other store in the
//! daemon. Each submodule adds an `impl Store` block for its tables.

mod contexts;
mod policy;
mod quota;
mod runs;

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::error::{CoreError, CoreResult};

pub use contexts::{ContextMessage, MessageDirection};
pub use runs::{RunFilter, RunPatch};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    agent_id TEXT NOT NULL,
    user_id TEXT,
    channel_id TEXT,
    context_id TEXT,
    parent_run_id TEXT,
    root_run_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    status TEXT NOT NULL,
    input_text TEXT,
    input_json TEXT,
    output_text TEXT,
    allowed_tools TEXT,
    policy_profile TEXT,
    wake_at TEXT,
    wake_reason TEXT,
    iteration INTEGER NOT NULL DEFAULT 0,
    max_iterations INTEGER NOT NULL,
    pending_confirmation TEXT,
    cancel_reason TEXT,
    cancel_requested_at TEXT,
    cancel_requested_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    finished_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_root ON runs(root_run_id);
CREATE INDEX IF NOT EXISTS idx_runs_parent ON runs(parent_run_id);
CREATE INDEX IF NOT EXISTS idx_runs_status_wake ON runs(status, wake_reason, wake_at);

CREATE TABLE IF NOT EXISTS run_steps (
    id TEXT PRIMARY KEY,
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    step_type TEXT NOT NULL,
    tool_name TEXT,
    args_json TEXT,
    result_json TEXT,
    status TEXT NOT NULL,
    idempotency_key TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    UNIQUE(run_id, seq),
    UNIQUE(run_id, idempotency_key)
);

CREATE TABLE IF NOT EXISTS policy_rules (
    id TEXT PRIMARY KEY,
    tenant_id TEXT NOT NULL,
    agent_id TEXT,
    name TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    conditions_json TEXT NOT NULL DEFAULT '{}',
    action TEXT NOT NULL,
    config_json TEXT NOT NULL DEFAULT '{}',
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_policy_rules_tenant ON policy_rules(tenant_id, enabled);

CREATE TABLE IF NOT EXISTS quota_usage (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    tenant_id TEXT NOT NULL,
    agent_id TEXT NOT NULL DEFAULT '',
    user_id TEXT NOT NULL DEFAULT '',
    resource_type TEXT NOT NULL,
    period TEXT NOT NULL,
    period_start TEXT NOT NULL,
    usage_count INTEGER NOT NULL DEFAULT 0,
    usage_limit INTEGER,
    updated_at TEXT NOT NULL,
    UNIQUE(tenant_id, agent_id, user_id, resource_type, period, period_start)
);

CREATE TABLE IF NOT EXISTS contexts (
    context_id TEXT PRIMARY KEY,
    turn_count INTEGER NOT NULL DEFAULT 0,
    summary TEXT,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS context_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    context_id TEXT NOT NULL,
    direction TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_context_messages_ctx ON context_messages(context_id, id);

CREATE TABLE IF NOT EXISTS outbound_commits (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    context_id TEXT,
    iteration INTEGER NOT NULL,
    message TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE(run_id, iteration)
);
CREATE INDEX IF NOT EXISTS idx_outbound_commits_ctx ON outbound_commits(context_id);
";

#[derive(Clone)]
pub struct Store {
    db: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open<P: AsRef<Path>>(path: P) -> CoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)
                .map_err(|e| CoreError::Config(format!("{}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        info!("Store opened at {}", path.display());
        Self::init(conn)
    }

    pub fn open_in_memory() -> CoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> CoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            db: Arc::new(Mutex::new(conn)),
        })
    }
}

pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(field: &'static str, s: &str) -> CoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| CoreError::Corrupt {
            field,
            value: s.to_string(),
        })
}

pub(crate) fn parse_opt_ts(
    field: &'static str,
    s: Option<String>,
) -> CoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(field, &s)).transpose()
}

pub(crate) fn parse_opt_json<T: serde::de::DeserializeOwned>(
    s: Option<String>,
) -> CoreResult<Option<T>> {
    Ok(s.map(|s| serde_json::from_str(&s)).transpose()?)
}
