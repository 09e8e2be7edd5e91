//! Usage counters over hourly, daily and monthly buckets.
//!
//! Bucket starts are always computed in UTC so every worker agrees on which
//! row a charge lands in.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::error::CoreResult;
use crate::core::store::{Store, ts};

pub const TOOL_CALLS: &str = "tool_calls";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Period {
    Hour,
    Day,
    Month,
}

impl Period {
    pub const ALL: [Period; 3] = [Period::Hour, Period::Day, Period::Month];

    pub fn as_str(self) -> &'static str {
        match self {
            Period::Hour => "hour",
            Period::Day => "day",
            Period::Month => "month",
        }
    }

    /// Start of the bucket containing `now`.
    pub fn start(self, now: DateTime<Utc>) -> DateTime<Utc> {
        let (year, month, day, hour) = match self {
            Period::Hour => (now.year(), now.month(), now.day(), now.hour()),
            Period::Day => (now.year(), now.month(), now.day(), 0),
            Period::Month => (now.year(), now.month(), 1, 0),
        };
        Utc.with_ymd_and_hms(year, month, day, hour, 0, 0)
            .single()
            .unwrap_or(now)
    }
}

/// Who a bucket belongs to. Absent ids mean "any".
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaKey {
    pub tenant_id: String,
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
}

impl QuotaKey {
    pub fn tenant(tenant_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            ..Self::default()
        }
    }

    pub fn agent(tenant_id: &str, agent_id: &str) -> Self {
        Self {
            tenant_id: tenant_id.to_string(),
            agent_id: Some(agent_id.to_string()),
            user_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeResult {
    pub allowed: bool,
    pub usage: i64,
    pub limit: Option<i64>,
    pub period: Period,
    pub period_start: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRow {
    pub agent_id: Option<String>,
    pub user_id: Option<String>,
    pub resource_type: String,
    pub period: Period,
    pub period_start: DateTime<Utc>,
    pub usage_count: i64,
    pub usage_limit: Option<i64>,
    /// `None` when the bucket is unlimited.
    pub remaining: Option<i64>,
}

#[derive(Clone)]
pub struct QuotaLedger {
    store: Store,
}

impl QuotaLedger {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub async fn charge(
        &self,
        key: &QuotaKey,
        resource_type: &str,
        period: Period,
        amount: i64,
        limit: Option<i64>,
    ) -> CoreResult<ChargeResult> {
        self.charge_at(key, resource_type, period, amount, limit, Utc::now())
            .await
    }

    /// Record `amount` against the bucket for `now`. The increment is kept
    /// even when it pushes usage over the limit.
    pub async fn charge_at(
        &self,
        key: &QuotaKey,
        resource_type: &str,
        period: Period,
        amount: i64,
        limit: Option<i64>,
        now: DateTime<Utc>,
    ) -> CoreResult<ChargeResult> {
        let period_start = period.start(now);
        let (usage, limit) = self
            .store
            .upsert_quota(key, resource_type, period, &ts(period_start), amount, limit)
            .await?;
        let allowed = limit.is_none_or(|limit| usage <= limit);
        if allowed {
            debug!(
                "Quota [{}/{}] {} {} usage {}/{:?}",
                key.tenant_id,
                key.agent_id.as_deref().unwrap_or("*"),
                resource_type,
                period.as_str(),
                usage,
                limit
            );
        } else {
            warn!(
                "Quota [{}/{}] {} {} exhausted: usage {} over limit {:?}",
                key.tenant_id,
                key.agent_id.as_deref().unwrap_or("*"),
                resource_type,
                period.as_str(),
                usage,
                limit
            );
        }
        Ok(ChargeResult {
            allowed,
            usage,
            limit,
            period,
            period_start,
        })
    }

    pub async fn current_usage(&self, tenant_id: &str) -> CoreResult<Vec<UsageRow>> {
        self.current_usage_at(tenant_id, Utc::now()).await
    }

    pub async fn current_usage_at(
        &self,
        tenant_id: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<UsageRow>> {
        let starts: Vec<(Period, String)> = Period::ALL
            .iter()
            .map(|p| (*p, ts(p.start(now))))
            .collect();
        self.store.quota_rows(tenant_id, &starts).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 17).unwrap()
    }

    #[test]
    fn bucket_starts_truncate_in_utc() {
        let now = at(2026, 7, 19, 13, 42);
        assert_eq!(Period::Hour.start(now), Utc.with_ymd_and_hms(2026, 7, 19, 13, 0, 0).unwrap());
        assert_eq!(Period::Day.start(now), Utc.with_ymd_and_hms(2026, 7, 19, 0, 0, 0).unwrap());
        assert_eq!(Period::Month.start(now), Utc.with_ymd_and_hms(2026, 7, 1, 0, 0, 0).unwrap());
    }

    #[tokio::test]
    async fn sixth_charge_over_limit_five_is_denied_but_recorded() {
        let ledger = QuotaLedger::new(Store::open_in_memory().unwrap());
        let key = QuotaKey::agent("t1", "a1");
        let now = at(2026, 1, 1, 9, 5);
        for i in 1..=5 {
            let r = ledger
                .charge_at(&key, TOOL_CALLS, Period::Hour, 1, Some(5), now)
                .await
                .unwrap();
            assert!(r.allowed);
            assert_eq!(r.usage, i);
        }
        let sixth = ledger
            .charge_at(&key, TOOL_CALLS, Period::Hour, 1, Some(5), now)
            .await
            .unwrap();
        assert!(!sixth.allowed);
        assert_eq!(sixth.usage, 6);
        assert_eq!(sixth.limit, Some(5));

        let seventh = ledger
            .charge_at(&key, TOOL_CALLS, Period::Hour, 1, None, now)
            .await
            .unwrap();
        assert!(!seventh.allowed);
        assert_eq!(seventh.usage, 7);
    }

    #[tokio::test]
    async fn new_period_starts_a_new_bucket() {
        let ledger = QuotaLedger::new(Store::open_in_memory().unwrap());
        let key = QuotaKey::tenant("t1");
        ledger
            .charge_at(&key, "messages", Period::Hour, 3, Some(3), at(2026, 1, 1, 9, 59))
            .await
            .unwrap();
        let next = ledger
            .charge_at(&key, "messages", Period::Hour, 1, Some(3), at(2026, 1, 1, 10, 0))
            .await
            .unwrap();
        assert!(next.allowed);
        assert_eq!(next.usage, 1);
    }

    #[tokio::test]
    async fn keys_with_and_without_agent_are_distinct() {
        let ledger = QuotaLedger::new(Store::open_in_memory().unwrap());
        let now = at(2026, 1, 1, 9, 0);
        ledger
            .charge_at(&QuotaKey::tenant("t1"), TOOL_CALLS, Period::Day, 1, None, now)
            .await
            .unwrap();
        let agent = ledger
            .charge_at(&QuotaKey::agent("t1", "a1"), TOOL_CALLS, Period::Day, 1, None, now)
            .await
            .unwrap();
        assert_eq!(agent.usage, 1);
        let again = ledger
            .charge_at(&QuotaKey::tenant("t1"), TOOL_CALLS, Period::Day, 2, None, now)
            .await
            .unwrap();
        assert_eq!(again.usage, 3);
    }

    #[tokio::test]
    async fn current_usage_reports_remaining() {
        let ledger = QuotaLedger::new(Store::open_in_memory().unwrap());
        let now = at(2026, 2, 10, 8, 30);
        let key = QuotaKey::agent("t1", "a1");
        ledger
            .charge_at(&key, TOOL_CALLS, Period::Hour, 2, Some(10), now)
            .await
            .unwrap();
        ledger
            .charge_at(&key, "tokens", Period::Month, 500, None, now)
            .await
            .unwrap();
        ledger
            .charge_at(&key, TOOL_CALLS, Period::Hour, 1, Some(10), at(2026, 2, 10, 7, 0))
            .await
            .unwrap();

        let rows = ledger.current_usage_at("t1", now).await.unwrap();
        assert_eq!(rows.len(), 2);
        let hourly = rows.iter().find(|r| r.period == Period::Hour).unwrap();
        assert_eq!(hourly.usage_count, 2);
        assert_eq!(hourly.remaining, Some(8));
        assert_eq!(hourly.agent_id.as_deref(), Some("a1"));
        let monthly = rows.iter().find(|r| r.period == Period::Month).unwrap();
        assert_eq!(monthly.remaining, None);
        assert!(ledger.current_usage_at("t2", now).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_charges_do_not_lose_increments() {
        let ledger = QuotaLedger::new(Store::open_in_memory().unwrap());
        let now = at(2026, 3, 3, 3, 3);
        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .charge_at(&QuotaKey::tenant("t1"), TOOL_CALLS, Period::Hour, 1, None, now)
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let rows = ledger.current_usage_at("t1", now).await.unwrap();
        assert_eq!(rows[0].usage_count, 20);
    }
}
