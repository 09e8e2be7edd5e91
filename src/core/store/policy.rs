use chrono::Utc;
use rusqlite::{Row, params};

use super::{Store, parse_ts, ts};
use crate::core::error::{CoreError, CoreResult};
use crate::core::policy::{NewPolicyRule, PolicyAction, PolicyRule};

const RULE_COLUMNS: &str =
    "id, tenant_id, agent_id, name, priority, conditions_json, action, config_json, enabled, created_at";

fn read_rule(row: &Row<'_>) -> CoreResult<PolicyRule> {
    let conditions: String = row.get(5)?;
    let action: String = row.get(6)?;
    let config: String = row.get(7)?;
    let enabled: i64 = row.get(8)?;
    Ok(PolicyRule {
        id: row.get(0)?,
        tenant_id: row.get(1)?,
        agent_id: row.get(2)?,
        name: row.get(3)?,
        priority: row.get(4)?,
        conditions: serde_json::from_str(&conditions)?,
        action: PolicyAction::parse(&action).ok_or(CoreError::Corrupt {
            field: "policy_rules.action",
            value: action,
        })?,
        config: serde_json::from_str(&config)?,
        enabled: enabled != 0,
        created_at: parse_ts("policy_rules.created_at", &row.get::<_, String>(9)?)?,
    })
}

impl Store {
    pub async fn insert_policy_rule(&self, rule: &NewPolicyRule) -> CoreResult<PolicyRule> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let db = self.db.lock().await;
            db.execute(
                "INSERT INTO policy_rules
                     (id, tenant_id, agent_id, name, priority, conditions_json, action, config_json, enabled, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id,
                    rule.tenant_id,
                    rule.agent_id,
                    rule.name,
                    rule.priority,
                    serde_json::to_string(&rule.conditions)?,
                    rule.action.as_str(),
                    serde_json::to_string(&rule.config)?,
                    rule.enabled as i64,
                    ts(Utc::now()),
                ],
            )?;
        }
        self.get_policy_rule(&id)
            .await?
            .ok_or(CoreError::Store(rusqlite::Error::QueryReturnedNoRows))
    }

    pub async fn get_policy_rule(&self, rule_id: &str) -> CoreResult<Option<PolicyRule>> {
        let db = self.db.lock().await;
        let mut stmt =
            db.prepare(&format!("SELECT {RULE_COLUMNS} FROM policy_rules WHERE id = ?1"))?;
        let mut rows = stmt.query(params![rule_id])?;
        match rows.next()? {
            Some(row) => Ok(Some(read_rule(row)?)),
            None => Ok(None),
        }
    }

    /// Enabled rules visible to `agent_id` (its own plus agent-agnostic ones),
    /// highest priority first, then oldest first.
    pub async fn list_enabled_policy_rules(
        &self,
        tenant_id: &str,
        agent_id: &str,
    ) -> CoreResult<Vec<PolicyRule>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {RULE_COLUMNS} FROM policy_rules
             WHERE tenant_id = ?1 AND enabled = 1 AND (agent_id IS NULL OR agent_id = ?2)
             ORDER BY priority DESC, rowid ASC"
        ))?;
        let mut rows = stmt.query(params![tenant_id, agent_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(read_rule(row)?);
        }
        Ok(out)
    }

    pub async fn set_policy_rule_enabled(&self, rule_id: &str, enabled: bool) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute(
            "UPDATE policy_rules SET enabled = ?1 WHERE id = ?2",
            params![enabled as i64, rule_id],
        )?;
        Ok(rows > 0)
    }

    pub async fn delete_policy_rule(&self, rule_id: &str) -> CoreResult<bool> {
        let db = self.db.lock().await;
        let rows = db.execute("DELETE FROM policy_rules WHERE id = ?1", params![rule_id])?;
        Ok(rows > 0)
    }
}
