use super::{PolicyContext, PolicyRule};

/// Match a rule's tool pattern against a call.
///
/// `*` matches everything, `ns.*` any command in `ns`, a trailing `*` is a
/// prefix match, anything else must equal the namespace or the full name.
pub fn tool_pattern_matches(pattern: &str, tool_name: &str, command_name: &str) -> bool {
    if pattern == "*" {
        return true;
    }
    if let Some(ns) = pattern.strip_suffix(".*") {
        return ns == tool_name;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return command_name.starts_with(prefix);
    }
    pattern == tool_name || pattern == command_name
}

/// Whether the rule is scoped to this tenant/agent at all.
pub fn in_scope(rule: &PolicyRule, tenant_id: &str, agent_id: &str) -> bool {
    rule.enabled
        && rule.tenant_id == tenant_id
        && rule.agent_id.as_deref().is_none_or(|a| a == agent_id)
}

pub fn rule_matches(rule: &PolicyRule, ctx: &PolicyContext<'_>) -> bool {
    if !in_scope(rule, ctx.tenant_id, ctx.agent_id) {
        return false;
    }
    let c = &rule.conditions;

    match (&c.command, &c.tool) {
        (Some(command), _) => {
            if command != ctx.command_name {
                return false;
            }
        }
        (None, Some(tool)) => {
            if !tool_pattern_matches(tool, ctx.tool_name, ctx.command_name) {
                return false;
            }
        }
        (None, None) => {}
    }

    if let Some(class) = c.classification
        && ctx.classification != Some(class)
    {
        return false;
    }

    if let Some(pattern) = &c.args_pattern
        && !pattern.iter().all(|(k, v)| ctx.args.get(k) == Some(v))
    {
        return false;
    }

    if let Some(kind) = c.run_kind
        && kind != ctx.run_kind
    {
        return false;
    }

    if let Some(profile) = &c.policy_profile
        && ctx.policy_profile != Some(profile.as_str())
    {
        return false;
    }

    true
}

/// First matching rule. `rules` must already be in evaluation order.
pub fn evaluate<'a>(rules: &'a [PolicyRule], ctx: &PolicyContext<'_>) -> Option<&'a PolicyRule> {
    rules.iter().find(|rule| rule_matches(rule, ctx))
}
