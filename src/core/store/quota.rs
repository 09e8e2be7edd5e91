use chrono::Utc;
use rusqlite::params;

use super::{Store, parse_ts, ts};
use crate::core::error::CoreResult;
use crate::core::quota::{Period, QuotaKey, UsageRow};

impl Store {
    /// Atomically add `amount` to a bucket, creating it if needed. A supplied
    /// limit replaces the stored one. Returns the post-increment count and
    /// the effective limit.
    pub async fn upsert_quota(
        &self,
        key: &QuotaKey,
        resource_type: &str,
        period: Period,
        period_start: &str,
        amount: i64,
        limit: Option<i64>,
    ) -> CoreResult<(i64, Option<i64>)> {
        let db = self.db.lock().await;
        let row = db.query_row(
            "INSERT INTO quota_usage
                 (tenant_id, agent_id, user_id, resource_type, period, period_start, usage_count, usage_limit, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(tenant_id, agent_id, user_id, resource_type, period, period_start)
             DO UPDATE SET usage_count = usage_count + excluded.usage_count,
                           usage_limit = COALESCE(excluded.usage_limit, usage_limit),
                           updated_at = excluded.updated_at
             RETURNING usage_count, usage_limit",
            params![
                key.tenant_id,
                key.agent_id.as_deref().unwrap_or(""),
                key.user_id.as_deref().unwrap_or(""),
                resource_type,
                period.as_str(),
                period_start,
                amount,
                limit,
                ts(Utc::now()),
            ],
            |row| Ok((row.get::<_, i64>(0)?, row.get::<_, Option<i64>>(1)?)),
        )?;
        Ok(row)
    }

    /// Rows for a tenant whose bucket start matches the current one for
    /// their period.
    pub async fn quota_rows(
        &self,
        tenant_id: &str,
        current_starts: &[(Period, String)],
    ) -> CoreResult<Vec<UsageRow>> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT agent_id, user_id, resource_type, period_start, usage_count, usage_limit
             FROM quota_usage
             WHERE tenant_id = ?1 AND period = ?2 AND period_start = ?3
             ORDER BY resource_type ASC, agent_id ASC, user_id ASC",
        )?;
        let mut out = Vec::new();
        for (period, start) in current_starts {
            let mut rows = stmt.query(params![tenant_id, period.as_str(), start])?;
            while let Some(row) = rows.next()? {
                let agent_id: String = row.get(0)?;
                let user_id: String = row.get(1)?;
                let start: String = row.get(3)?;
                let usage_count: i64 = row.get(4)?;
                let usage_limit: Option<i64> = row.get(5)?;
                out.push(UsageRow {
                    agent_id: (!agent_id.is_empty()).then_some(agent_id),
                    user_id: (!user_id.is_empty()).then_some(user_id),
                    resource_type: row.get(2)?,
                    period: *period,
                    period_start: parse_ts("quota_usage.period_start", &start)?,
                    usage_count,
                    usage_limit,
                    remaining: usage_limit.map(|limit| limit - usage_count),
                });
            }
        }
        Ok(out)
    }
}
