//! Tenant policy over tool calls.
//!
//! Rules are evaluated highest priority first, ties in creation order; the
//! first match decides. `rate_limit` rules charge the quota ledger and turn
//! into allow or deny.

pub mod matcher;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::core::error::CoreResult;
use crate::core::quota::{ChargeResult, Period, QuotaKey, QuotaLedger, TOOL_CALLS};
use crate::core::runs::RunKind;
use crate::core::store::Store;
use crate::core::tools::Classification;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyAction {
    Allow,
    Confirm,
    Deny,
    RateLimit,
}

impl PolicyAction {
    pub fn as_str(self) -> &'static str {
        match self {
            PolicyAction::Allow => "allow",
            PolicyAction::Confirm => "confirm",
            PolicyAction::Deny => "deny",
            PolicyAction::RateLimit => "rate_limit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(PolicyAction::Allow),
            "confirm" => Some(PolicyAction::Confirm),
            "deny" => Some(PolicyAction::Deny),
            "rate_limit" => Some(PolicyAction::RateLimit),
            _ => None,
        }
    }

    /// Actions whose outcome can be a denial.
    fn may_deny(self) -> bool {
        matches!(self, PolicyAction::Deny | PolicyAction::RateLimit)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConditions {
    /// Tool pattern, e.g. `memory.*`, `web`, `*`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    /// Exact `namespace.command`; wins over `tool` when both are set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classification: Option<Classification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args_pattern: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_kind: Option<RunKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_profile: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quota: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_per_hour: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_workflow: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default)]
    pub require_reason: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyRule {
    pub id: String,
    pub tenant_id: String,
    pub agent_id: Option<String>,
    pub name: String,
    pub priority: i64,
    pub conditions: RuleConditions,
    pub action: PolicyAction,
    pub config: RuleConfig,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewPolicyRule {
    pub tenant_id: String,
    #[serde(default)]
    pub agent_id: Option<String>,
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub conditions: RuleConditions,
    pub action: PolicyAction,
    #[serde(default)]
    pub config: RuleConfig,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// What the engine is asked about.
#[derive(Debug, Clone)]
pub struct PolicyContext<'a> {
    pub tenant_id: &'a str,
    pub agent_id: &'a str,
    /// Tool namespace, e.g. `memory`.
    pub tool_name: &'a str,
    /// Full command name, e.g. `memory.put`.
    pub command_name: &'a str,
    pub classification: Option<Classification>,
    pub args: &'a Map<String, Value>,
    pub run_kind: RunKind,
    pub policy_profile: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Allow,
    Confirm,
    Deny,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Decision {
    pub verdict: Verdict,
    /// Action of the winning rule; `None` when no rule matched.
    pub action: Option<PolicyAction>,
    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
    pub reason: Option<String>,
    pub quota: Option<ChargeResult>,
    pub approval_workflow: Option<String>,
    pub require_reason: bool,
}

impl Decision {
    fn default_allow() -> Self {
        Self {
            verdict: Verdict::Allow,
            action: None,
            rule_id: None,
            rule_name: None,
            reason: None,
            quota: None,
            approval_workflow: None,
            require_reason: false,
        }
    }

    fn from_rule(rule: &PolicyRule, verdict: Verdict) -> Self {
        Self {
            verdict,
            action: Some(rule.action),
            rule_id: Some(rule.id.clone()),
            rule_name: Some(rule.name.clone()),
            reason: None,
            quota: None,
            approval_workflow: rule.config.approval_workflow.clone(),
            require_reason: rule.config.require_reason,
        }
    }

    /// Denied by quota rather than by a plain deny rule.
    pub fn is_quota_denial(&self) -> bool {
        self.verdict == Verdict::Deny && self.action == Some(PolicyAction::RateLimit)
    }
}

struct CachedRules {
    loaded_at: Instant,
    rules: Arc<Vec<PolicyRule>>,
}

pub struct PolicyEngine {
    store: Store,
    ledger: QuotaLedger,
    cache_ttl: Duration,
    cache: RwLock<HashMap<(String, String), CachedRules>>,
}

impl PolicyEngine {
    pub fn new(store: Store, ledger: QuotaLedger, cache_ttl: Duration) -> Self {
        Self {
            store,
            ledger,
            cache_ttl,
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &QuotaLedger {
        &self.ledger
    }

    pub async fn add_rule(&self, rule: &NewPolicyRule) -> CoreResult<PolicyRule> {
        let rule = self.store.insert_policy_rule(rule).await?;
        info!(
            "Policy rule [{}] '{}' added for tenant {} ({} @ {})",
            rule.id,
            rule.name,
            rule.tenant_id,
            rule.action.as_str(),
            rule.priority
        );
        self.invalidate(&rule.tenant_id).await;
        Ok(rule)
    }

    pub async fn set_rule_enabled(&self, rule_id: &str, enabled: bool) -> CoreResult<bool> {
        let rule = self.store.get_policy_rule(rule_id).await?;
        let changed = self.store.set_policy_rule_enabled(rule_id, enabled).await?;
        if let Some(rule) = rule {
            self.invalidate(&rule.tenant_id).await;
        }
        Ok(changed)
    }

    pub async fn remove_rule(&self, rule_id: &str) -> CoreResult<bool> {
        let rule = self.store.get_policy_rule(rule_id).await?;
        let removed = self.store.delete_policy_rule(rule_id).await?;
        if let Some(rule) = rule {
            self.invalidate(&rule.tenant_id).await;
        }
        Ok(removed)
    }

    /// Drop cached rule lists for a tenant.
    pub async fn invalidate(&self, tenant_id: &str) {
        self.cache
            .write()
            .await
            .retain(|(tenant, _), _| tenant != tenant_id);
    }

    async fn rules_for(&self, tenant_id: &str, agent_id: &str) -> CoreResult<(Arc<Vec<PolicyRule>>, bool)> {
        let key = (tenant_id.to_string(), agent_id.to_string());
        if !self.cache_ttl.is_zero()
            && let Some(cached) = self.cache.read().await.get(&key)
            && cached.loaded_at.elapsed() < self.cache_ttl
        {
            return Ok((cached.rules.clone(), true));
        }
        let rules = Arc::new(self.store.list_enabled_policy_rules(tenant_id, agent_id).await?);
        if !self.cache_ttl.is_zero() {
            self.cache.write().await.insert(
                key,
                CachedRules {
                    loaded_at: Instant::now(),
                    rules: rules.clone(),
                },
            );
        }
        Ok((rules, false))
    }

    /// Whether a cached rule is still exactly what the store holds and in
    /// scope for this call.
    async fn still_current(&self, rule: &PolicyRule, ctx: &PolicyContext<'_>) -> CoreResult<bool> {
        Ok(match self.store.get_policy_rule(&rule.id).await? {
            Some(fresh) => fresh == *rule && matcher::in_scope(&fresh, ctx.tenant_id, ctx.agent_id),
            None => false,
        })
    }

    pub async fn decide(&self, ctx: &PolicyContext<'_>) -> CoreResult<Decision> {
        let (rules, cached) = self.rules_for(ctx.tenant_id, ctx.agent_id).await?;

        let mut winner = matcher::evaluate(&rules, ctx).cloned();
        if cached
            && let Some(rule) = &winner
            && rule.action.may_deny()
            && !self.still_current(rule, ctx).await?
        {
            debug!(
                "Policy rule [{}] changed since cached, re-evaluating tenant {}",
                rule.id, ctx.tenant_id
            );
            self.invalidate(ctx.tenant_id).await;
            let (fresh, _) = self.rules_for(ctx.tenant_id, ctx.agent_id).await?;
            winner = matcher::evaluate(&fresh, ctx).cloned();
        }

        let Some(rule) = winner else {
            return Ok(Decision::default_allow());
        };

        let decision = match rule.action {
            PolicyAction::Allow => Decision::from_rule(&rule, Verdict::Allow),
            PolicyAction::Confirm => Decision::from_rule(&rule, Verdict::Confirm),
            PolicyAction::Deny => Decision {
                reason: Some(
                    rule.config
                        .message
                        .clone()
                        .unwrap_or_else(|| format!("Blocked by policy rule '{}'", rule.name)),
                ),
                ..Decision::from_rule(&rule, Verdict::Deny)
            },
            PolicyAction::RateLimit => {
                let limit = rule.config.quota.or(rule.config.rate_per_hour);
                let charge = self
                    .ledger
                    .charge(
                        &QuotaKey::agent(ctx.tenant_id, ctx.agent_id),
                        TOOL_CALLS,
                        Period::Hour,
                        1,
                        limit,
                    )
                    .await?;
                if charge.allowed {
                    Decision {
                        quota: Some(charge),
                        ..Decision::from_rule(&rule, Verdict::Allow)
                    }
                } else {
                    Decision {
                        reason: Some(rule.config.message.clone().unwrap_or_else(|| {
                            format!(
                                "Rate limit reached for {}: {} of {} tool calls this hour",
                                ctx.command_name,
                                charge.usage,
                                charge.limit.map(|l| l.to_string()).unwrap_or_else(|| "unlimited".into())
                            )
                        })),
                        quota: Some(charge),
                        ..Decision::from_rule(&rule, Verdict::Deny)
                    }
                }
            }
        };

        debug!(
            "Policy [{}] {} -> {:?} via rule '{}'",
            ctx.tenant_id, ctx.command_name, decision.verdict, rule.name
        );
        Ok(decision)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(ttl: Duration) -> PolicyEngine {
        let store = Store::open_in_memory().unwrap();
        PolicyEngine::new(store.clone(), QuotaLedger::new(store), ttl)
    }

    fn new_rule(agent: Option<&str>, priority: i64, tool: &str, action: PolicyAction) -> NewPolicyRule {
        NewPolicyRule {
            tenant_id: "t1".into(),
            agent_id: agent.map(str::to_string),
            name: format!("{}-{}", action.as_str(), priority),
            priority,
            conditions: RuleConditions {
                tool: Some(tool.into()),
                ..RuleConditions::default()
            },
            action,
            config: RuleConfig::default(),
            enabled: true,
        }
    }

    fn ctx<'a>(command: &'a str, args: &'a Map<String, Value>) -> PolicyContext<'a> {
        let tool = command.split('.').next().unwrap_or(command);
        PolicyContext {
            tenant_id: "t1",
            agent_id: "a1",
            tool_name: tool,
            command_name: command,
            classification: Some(Classification::Read),
            args,
            run_kind: RunKind::Coordinator,
            policy_profile: None,
        }
    }

    #[tokio::test]
    async fn no_rules_defaults_to_allow() {
        let e = engine(Duration::ZERO);
        let args = Map::new();
        let d = e.decide(&ctx("web.search", &args)).await.unwrap();
        assert_eq!(d.verdict, Verdict::Allow);
        assert!(d.rule_id.is_none());
    }

    #[tokio::test]
    async fn agent_deny_at_10_beats_tenant_allow_at_5() {
        let e = engine(Duration::ZERO);
        e.add_rule(&new_rule(None, 5, "web.*", PolicyAction::Allow)).await.unwrap();
        e.add_rule(&new_rule(Some("a1"), 10, "web.*", PolicyAction::Deny)).await.unwrap();
        let args = Map::new();
        let d = e.decide(&ctx("web.search", &args)).await.unwrap();
        assert_eq!(d.verdict, Verdict::Deny);
        assert_eq!(d.rule_name.as_deref(), Some("deny-10"));
        assert!(d.reason.is_some());
    }

    #[tokio::test]
    async fn equal_priority_keeps_creation_order() {
        let e = engine(Duration::ZERO);
        e.add_rule(&new_rule(None, 1, "*", PolicyAction::Confirm)).await.unwrap();
        e.add_rule(&new_rule(None, 1, "*", PolicyAction::Deny)).await.unwrap();
        let args = Map::new();
        for _ in 0..5 {
            let d = e.decide(&ctx("fs.read", &args)).await.unwrap();
            assert_eq!(d.verdict, Verdict::Confirm);
        }
    }

    #[tokio::test]
    async fn rate_limit_charges_hourly_bucket() {
        let e = engine(Duration::ZERO);
        let mut rule = new_rule(None, 1, "web.*", PolicyAction::RateLimit);
        rule.config.rate_per_hour = Some(2);
        rule.config.message = Some("slow down".into());
        e.add_rule(&rule).await.unwrap();
        let args = Map::new();

        for expected in [1, 2] {
            let d = e.decide(&ctx("web.search", &args)).await.unwrap();
            assert_eq!(d.verdict, Verdict::Allow);
            assert_eq!(d.quota.as_ref().unwrap().usage, expected);
        }
        let d = e.decide(&ctx("web.fetch", &args)).await.unwrap();
        assert_eq!(d.verdict, Verdict::Deny);
        assert!(d.is_quota_denial());
        assert_eq!(d.reason.as_deref(), Some("slow down"));
    }

    #[tokio::test]
    async fn toggling_and_removing_rules_refreshes_cached_decisions() {
        let e = engine(Duration::from_secs(3600));
        let confirm = e
            .add_rule(&new_rule(None, 10, "fs.*", PolicyAction::Confirm))
            .await
            .unwrap();
        let args = Map::new();
        assert_eq!(e.decide(&ctx("fs.read", &args)).await.unwrap().verdict, Verdict::Confirm);

        assert!(e.set_rule_enabled(&confirm.id, false).await.unwrap());
        assert_eq!(e.decide(&ctx("fs.read", &args)).await.unwrap().verdict, Verdict::Allow);

        assert!(e.set_rule_enabled(&confirm.id, true).await.unwrap());
        assert_eq!(e.decide(&ctx("fs.read", &args)).await.unwrap().verdict, Verdict::Confirm);

        assert!(e.remove_rule(&confirm.id).await.unwrap());
        assert_eq!(e.decide(&ctx("fs.read", &args)).await.unwrap().verdict, Verdict::Allow);

        assert!(!e.remove_rule(&confirm.id).await.unwrap());
        assert!(!e.set_rule_enabled("missing", true).await.unwrap());
    }

    #[tokio::test]
    async fn cached_deny_is_rechecked_against_the_store() {
        let e = engine(Duration::from_secs(3600));
        let deny = e
            .add_rule(&new_rule(None, 10, "web.*", PolicyAction::Deny))
            .await
            .unwrap();
        let args = Map::new();
        assert_eq!(e.decide(&ctx("web.search", &args)).await.unwrap().verdict, Verdict::Deny);

        // Disable behind the engine's back: the cache still holds the rule.
        e.store.set_policy_rule_enabled(&deny.id, false).await.unwrap();
        assert_eq!(e.decide(&ctx("web.search", &args)).await.unwrap().verdict, Verdict::Allow);
    }

    #[tokio::test]
    async fn confirm_carries_workflow_settings() {
        let e = engine(Duration::ZERO);
        let mut rule = new_rule(None, 3, "fs.delete", PolicyAction::Confirm);
        rule.config.approval_workflow = Some("ops".into());
        rule.config.require_reason = true;
        e.add_rule(&rule).await.unwrap();
        let args = Map::new();
        let d = e.decide(&ctx("fs.delete", &args)).await.unwrap();
        assert_eq!(d.verdict, Verdict::Confirm);
        assert_eq!(d.approval_workflow.as_deref(), Some("ops"));
        assert!(d.require_reason);
        assert_eq!(e.decide(&ctx("fs.read", &args)).await.unwrap().verdict, Verdict::Allow);
    }
}
