use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{OptionalExtension, Row, params, params_from_iter};

use super::{Store, parse_opt_json, parse_opt_ts, parse_ts, ts};
use crate::core::error::{CoreError, CoreResult};
use crate::core::runs::{
    NewStep, PendingConfirmation, Run, RunKind, RunStatus, RunStep, StepStatus, StepType,
    WakeReason, can_transition,
};

const RUN_COLUMNS: &str = "id, tenant_id, agent_id, user_id, channel_id, context_id, parent_run_id,
    root_run_id, kind, status, input_text, input_json, output_text, allowed_tools, policy_profile,
    wake_at, wake_reason, iteration, max_iterations, pending_confirmation, cancel_reason,
    cancel_requested_at, cancel_requested_by, created_at, updated_at, finished_at";

const STEP_COLUMNS: &str = "id, run_id, seq, step_type, tool_name, args_json, result_json, status,
    idempotency_key, created_at, updated_at";

fn read_run(row: &Row<'_>) -> CoreResult<Run> {
    let status: String = row.get(9)?;
    let kind: String = row.get(8)?;
    let wake_reason: Option<String> = row.get(16)?;
    Ok(Run {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        agent_id: row.get(2)?,
        user_id: row.get(3)?,
        channel_id: row.get(4)?,
        context_id: row.get(5)?,
        parent_run_id: row.get(6)?,
        root_run_id: row.get(7)?,
        kind: RunKind::parse(&kind)?,
        status: status.parse()?,
        input_text: row.get(10)?,
        input_json: parse_opt_json(row.get(11)?)?,
        output_text: row.get(12)?,
        allowed_tools: parse_opt_json(row.get(13)?)?,
        policy_profile: row.get(14)?,
        wake_at: parse_opt_ts("runs.wake_at", row.get(15)?)?,
        wake_reason: wake_reason.as_deref().map(WakeReason::parse).transpose()?,
        iteration: row.get(17)?,
        max_iterations: row.get(18)?,
        pending_confirmation: parse_opt_json(row.get(19)?)?,
        cancel_reason: row.get(20)?,
        cancel_requested_at: parse_opt_ts("runs.cancel_requested_at", row.get(21)?)?,
        cancel_requested_by: row.get(22)?,
        created_at: parse_ts("runs.created_at", &row.get::<_, String>(23)?)?,
        updated_at: parse_ts("runs.updated_at", &row.get::<_, String>(24)?)?,
        finished_at: parse_opt_ts("runs.finished_at", row.get(25)?)?,
    })
}

fn read_step(row: &Row<'_>) -> CoreResult<RunStep> {
    let step_type: String = row.get(3)?;
    let status: String = row.get(7)?;
    Ok(RunStep {
        id: row.get(0)?,
        run_id: row.get(1)?,
        seq: row.get(2)?,
        step_type: StepType::parse(&step_type)?,
        tool_name: row.get(4)?,
        args_json: parse_opt_json(row.get(5)?)?,
        result_json: parse_opt_json(row.get(6)?)?,
        status: StepStatus::parse(&status)?,
        idempotency_key: row.get(8)?,
        created_at: parse_ts("run_steps.created_at", &row.get::<_, String>(9)?)?,
        updated_at: parse_ts("run_steps.updated_at", &row.get::<_, String>(10)?)?,
    })
}

fn opt_text(s: Option<String>) -> SqlValue {
    s.map(SqlValue::Text).unwrap_or(SqlValue::Null)
}

fn json_text<T: serde::Serialize>(value: Option<&T>) -> CoreResult<SqlValue> {
    Ok(match value {
        Some(v) => SqlValue::Text(serde_json::to_string(v)?),
        None => SqlValue::Null,
    })
}

/// Compare-and-set update of a run. Guards select the rows that may change;
/// set fields are written only when `Some`.
#[derive(Debug, Clone, Default)]
pub struct RunPatch {
    pub expect_status: Vec<RunStatus>,
    pub expect_wake_reason: Option<WakeReason>,
    pub expect_iteration: Option<u32>,

    pub status: Option<RunStatus>,
    pub iteration: Option<u32>,
    pub max_iterations: Option<u32>,
    pub output_text: Option<Option<String>>,
    pub wake_at: Option<Option<DateTime<Utc>>>,
    pub wake_reason: Option<Option<WakeReason>>,
    pub pending_confirmation: Option<Option<PendingConfirmation>>,
    pub cancel_reason: Option<String>,
    pub cancel_requested_by: Option<String>,
}

impl RunPatch {
    pub fn from(statuses: &[RunStatus]) -> Self {
        Self {
            expect_status: statuses.to_vec(),
            ..Self::default()
        }
    }

    pub fn to(mut self, status: RunStatus) -> Self {
        self.status = Some(status);
        self
    }
}

/// Selection for run listings. Unset fields do not filter.
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    pub statuses: Vec<RunStatus>,
    pub wake_reason: Option<WakeReason>,
    pub wake_at_or_before: Option<DateTime<Utc>>,
    pub updated_before: Option<DateTime<Utc>>,
    pub root_run_id: Option<String>,
    pub parent_run_id: Option<String>,
    pub limit: Option<u32>,
}

impl Store {
    /// Insert a run. Returns false when a run with the same id already exists.
    pub async fn insert_run(&self, run: &Run) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            &format!(
                "INSERT OR IGNORE INTO runs ({RUN_COLUMNS}) VALUES
                 (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                  ?18, ?19, ?20, ?21, ?22, ?23, ?24, ?25, ?26)"
            ),
            params![
                run.id,
                run.tenant_id,
                run.agent_id,
                run.user_id,
                run.channel_id,
                run.context_id,
                run.parent_run_id,
                run.root_run_id,
                run.kind.as_str(),
                run.status.as_str(),
                run.input_text,
                json_text(run.input_json.as_ref())?,
                run.output_text,
                json_text(run.allowed_tools.as_ref())?,
                run.policy_profile,
                run.wake_at.map(ts),
                run.wake_reason.map(WakeReason::as_str),
                run.iteration,
                run.max_iterations,
                json_text(run.pending_confirmation.as_ref())?,
                run.cancel_reason,
                run.cancel_requested_at.map(ts),
                run.cancel_requested_by,
                ts(run.created_at),
                ts(run.updated_at),
                run.finished_at.map(ts),
            ],
        )?;
        Ok(rows > 0)
    }

    pub async fn get_run(&self, run_id: &str) -> CoreResult<Option<Run>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"))?;
        let mut rows = stmt.query(params![run_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_run(row)?)),
            None => Ok(None),
        }
    }

    pub async fn require_run(&self, run_id: &str) -> CoreResult<Run> {
        self.get_run(run_id).await?.ok_or_else(|| CoreError::RunNotFound {
            run_id: run_id.to_string(),
        })
    }

    pub async fn list_runs(&self, filter: &RunFilter) -> CoreResult<Vec<Run>> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<SqlValue> = Vec::new();
        if !filter.statuses.is_empty() {
            let marks = vec!["?"; filter.statuses.len()].join(", ");
            clauses.push(format!("status IN ({marks})"));
            values.extend(
                filter
                    .statuses
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
        }
        if let Some(reason) = filter.wake_reason {
            clauses.push("wake_reason = ?".into());
            values.push(SqlValue::Text(reason.as_str().to_string()));
        }
        if let Some(at) = filter.wake_at_or_before {
            clauses.push("wake_at IS NOT NULL AND wake_at <= ?".into());
            values.push(SqlValue::Text(ts(at)));
        }
        if let Some(before) = filter.updated_before {
            clauses.push("updated_at < ?".into());
            values.push(SqlValue::Text(ts(before)));
        }
        if let Some(root) = &filter.root_run_id {
            clauses.push("root_run_id = ?".into());
            values.push(SqlValue::Text(root.clone()));
        }
        if let Some(parent) = &filter.parent_run_id {
            clauses.push("parent_run_id = ?".into());
            values.push(SqlValue::Text(parent.clone()));
        }

        let mut sql = format!("SELECT {RUN_COLUMNS} FROM runs");
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY created_at ASC, id ASC");
        if let Some(limit) = filter.limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }

        let db = self.db.lock().await;
        let mut stmt = db.prepare(&sql)?;
        let mut rows = stmt.query(params_from_iter(values.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_run(row)?);
        }
        Ok(out)
    }

    pub async fn list_children(&self, parent_run_id: &str) -> CoreResult<Vec<Run>> {
        self.list_runs(&RunFilter {
            parent_run_id: Some(parent_run_id.to_string()),
            ..RunFilter::default()
        })
        .await
    }

    /// Apply `patch` if the run still matches its guards. Returns whether a
    /// row changed.
    pub async fn update_run(&self, run_id: &str, patch: &RunPatch) -> CoreResult<bool> {
        if let Some(to) = patch.status {
            for &from in &patch.expect_status {
                if from != to && !can_transition(from, to) {
                    return Err(CoreError::InvalidTransition {
                        run_id: run_id.to_string(),
                        from,
                        to,
                    });
                }
            }
        }

        let now = Utc::now();
        let mut sets: Vec<&'static str> = vec!["updated_at = ?"];
        let mut values: Vec<SqlValue> = vec![SqlValue::Text(ts(now))];

        if let Some(status) = patch.status {
            sets.push("status = ?");
            values.push(SqlValue::Text(status.as_str().to_string()));
            if status.is_terminal() {
                sets.push("finished_at = ?");
                values.push(SqlValue::Text(ts(now)));
            }
        }
        if let Some(n) = patch.iteration {
            sets.push("iteration = ?");
            values.push(SqlValue::Integer(n.into()));
        }
        if let Some(n) = patch.max_iterations {
            sets.push("max_iterations = ?");
            values.push(SqlValue::Integer(n.into()));
        }
        if let Some(output) = &patch.output_text {
            sets.push("output_text = ?");
            values.push(opt_text(output.clone()));
        }
        if let Some(wake_at) = patch.wake_at {
            sets.push("wake_at = ?");
            values.push(opt_text(wake_at.map(ts)));
        }
        if let Some(reason) = patch.wake_reason {
            sets.push("wake_reason = ?");
            values.push(opt_text(reason.map(|r| r.as_str().to_string())));
        }
        if let Some(pending) = &patch.pending_confirmation {
            sets.push("pending_confirmation = ?");
            values.push(json_text(pending.as_ref())?);
        }
        if let Some(reason) = &patch.cancel_reason {
            sets.push("cancel_reason = ?");
            values.push(SqlValue::Text(reason.clone()));
            sets.push("cancel_requested_at = COALESCE(cancel_requested_at, ?)");
            values.push(SqlValue::Text(ts(now)));
        }
        if let Some(by) = &patch.cancel_requested_by {
            sets.push("cancel_requested_by = ?");
            values.push(SqlValue::Text(by.clone()));
        }

        let mut sql = format!("UPDATE runs SET {} WHERE id = ?", sets.join(", "));
        values.push(SqlValue::Text(run_id.to_string()));
        if !patch.expect_status.is_empty() {
            let marks = vec!["?"; patch.expect_status.len()].join(", ");
            sql.push_str(&format!(" AND status IN ({marks})"));
            values.extend(
                patch
                    .expect_status
                    .iter()
                    .map(|s| SqlValue::Text(s.as_str().to_string())),
            );
        }
        if let Some(reason) = patch.expect_wake_reason {
            sql.push_str(" AND wake_reason = ?");
            values.push(SqlValue::Text(reason.as_str().to_string()));
        }
        if let Some(n) = patch.expect_iteration {
            sql.push_str(" AND iteration = ?");
            values.push(SqlValue::Integer(n.into()));
        }

        let db = self.db.lock().await;
        let rows = db.execute(&sql, params_from_iter(values.iter()))?;
        Ok(rows > 0)
    }

    /// Append a step with the next sequence number. A step whose idempotency
    /// key already exists is returned unchanged with `inserted = false`.
    pub async fn append_step(&self, step: &NewStep) -> CoreResult<(RunStep, bool)> {
        let db = self.db.lock().await;
        let now = ts(Utc::now());
        let id = uuid::Uuid::new_v4().to_string();
        let inserted = db.execute(
            "INSERT INTO run_steps (id, run_id, seq, step_type, tool_name, args_json, result_json,
                 status, idempotency_key, created_at, updated_at)
             SELECT ?1, ?2, COALESCE(MAX(seq), 0) + 1, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9
             FROM run_steps WHERE run_id = ?2
             ON CONFLICT(run_id, idempotency_key) DO NOTHING",
            params![
                id,
                step.run_id,
                step.step_type.as_str(),
                step.tool_name,
                json_text(step.args_json.as_ref())?,
                json_text(step.result_json.as_ref())?,
                step.status.as_str(),
                step.idempotency_key,
                now,
            ],
        )?;
        let mut stmt = db.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 AND idempotency_key = ?2"
        ))?;
        let mut rows = stmt.query(params![step.run_id, step.idempotency_key])?;
        let row = rows.next()?.ok_or(rusqlite::Error::QueryReturnedNoRows)?;
        Ok((read_step(row)?, inserted > 0))
    }

    pub async fn get_step_by_key(&self, run_id: &str, key: &str) -> CoreResult<Option<RunStep>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 AND idempotency_key = ?2"
        ))?;
        let mut rows = stmt.query(params![run_id, key])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_step(row)?)),
            None => Ok(None),
        }
    }

    /// Move a non-terminal step to its final status. Terminal steps are frozen.
    pub async fn finish_step(
        &self,
        step_id: &str,
        status: StepStatus,
        result: Option<&serde_json::Value>,
    ) -> CoreResult<Option<RunStep>> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE run_steps SET status = ?1, result_json = COALESCE(?2, result_json), updated_at = ?3
             WHERE id = ?4 AND status IN ('pending', 'running')",
            params![status.as_str(), json_text(result)?, ts(Utc::now()), step_id],
        )?;
        if rows == 0 {
            return Ok(None);
        }
        let mut stmt = db.prepare(&format!("SELECT {STEP_COLUMNS} FROM run_steps WHERE id = ?1"))?;
        let mut rows = stmt.query(params![step_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_step(row)?)),
            None => Ok(None),
        }
    }

    pub async fn list_steps(&self, run_id: &str, after_seq: i64) -> CoreResult<Vec<RunStep>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps WHERE run_id = ?1 AND seq > ?2 ORDER BY seq ASC"
        ))?;
        let mut rows = stmt.query(params![run_id, after_seq])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_step(row)?);
        }
        Ok(out)
    }

    pub async fn latest_step(
        &self,
        run_id: &str,
        step_type: StepType,
        status: Option<StepStatus>,
    ) -> CoreResult<Option<RunStep>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM run_steps
             WHERE run_id = ?1 AND step_type = ?2 AND (?3 IS NULL OR status = ?3)
             ORDER BY seq DESC LIMIT 1"
        ))?;
        let mut rows = stmt.query(params![run_id, step_type.as_str(), status.map(|s| s.as_str())])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_step(row)?)),
            None => Ok(None),
        }
    }

    /// Record the single committed outbound message for a run iteration.
    /// Returns false if this iteration already committed one.
    pub async fn commit_outbound(
        &self,
        run_id: &str,
        context_id: Option<&str>,
        iteration: u32,
        message: &str,
    ) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "INSERT OR IGNORE INTO outbound_commits (run_id, context_id, iteration, message, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id, context_id, iteration, message, ts(Utc::now())],
        )?;
        Ok(rows > 0)
    }

    pub async fn outbound_commit_for(&self, run_id: &str, iteration: u32) -> CoreResult<Option<String>> {
        let db = self.db.lock().await;
        Ok(db
            .query_row(
                "SELECT message FROM outbound_commits WHERE run_id = ?1 AND iteration = ?2",
                params![run_id, iteration],
                |row| row.get(0),
            )
            .optional()?)
    }

    /// Messages already committed in a run, or across a context when given.
    pub async fn committed_messages(
        &self,
        run_id: &str,
        context_id: Option<&str>,
    ) -> CoreResult<Vec<String>> {
        let db = self.db.lock().await;
        let mut stmt = match context_id {
            Some(_) => db.prepare(
                "SELECT message FROM outbound_commits WHERE context_id = ?2 OR run_id = ?1 ORDER BY id ASC",
            )?,
            None => db.prepare(
                "SELECT message FROM outbound_commits WHERE run_id = ?1 AND ?2 IS NULL ORDER BY id ASC",
            )?,
        };
        let rows = stmt.query_map(params![run_id, context_id], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}
