//! One outbound message per iteration, and no near-duplicates of messages
//! already sent.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::error::CoreResult;
use crate::core::runs::Run;
use crate::core::store::Store;

pub const ALREADY_COMMITTED: &str = "already_committed";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboundScope {
    #[default]
    Run,
    Context,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundVerdict {
    Committed,
    Blocked { reason: String },
}

#[derive(Clone)]
pub struct OutboundGuard {
    store: Store,
    similarity_threshold: f64,
    scope: OutboundScope,
}

impl OutboundGuard {
    pub fn new(store: Store, similarity_threshold: f64, scope: OutboundScope) -> Self {
        Self {
            store,
            similarity_threshold,
            scope,
        }
    }

    pub async fn commit(&self, run: &Run, iteration: u32, message: &str) -> CoreResult<OutboundVerdict> {
        if let Some(existing) = self.store.outbound_commit_for(&run.id, iteration).await? {
            return Ok(self.same_turn(&existing, message));
        }

        let context_id = match self.scope {
            OutboundScope::Context => run.context_id.as_deref(),
            OutboundScope::Run => None,
        };
        let earlier = self.store.committed_messages(&run.id, context_id).await?;
        if let Some(score) = earlier
            .iter()
            .map(|prior| similarity(prior, message))
            .find(|score| *score >= self.similarity_threshold)
        {
            info!(
                "Run [{}] outbound message blocked (similarity {:.2})",
                run.id, score
            );
            return Ok(OutboundVerdict::Blocked {
                reason: format!("{ALREADY_COMMITTED}: a near-identical message was already sent"),
            });
        }

        if self
            .store
            .commit_outbound(&run.id, run.context_id.as_deref(), iteration, message)
            .await?
        {
            return Ok(OutboundVerdict::Committed);
        }
        // Lost a race for this iteration's slot.
        match self.store.outbound_commit_for(&run.id, iteration).await? {
            Some(existing) => Ok(self.same_turn(&existing, message)),
            None => Ok(OutboundVerdict::Committed),
        }
    }

    fn same_turn(&self, existing: &str, message: &str) -> OutboundVerdict {
        if existing == message {
            OutboundVerdict::Committed
        } else {
            OutboundVerdict::Blocked {
                reason: format!("{ALREADY_COMMITTED}: only one message may be sent per turn"),
            }
        }
    }
}

fn tokens(text: &str) -> HashSet<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// Jaccard similarity of lowercase alphanumeric tokens.
pub fn similarity(a: &str, b: &str) -> f64 {
    let (ta, tb) = (tokens(a), tokens(b));
    if ta.is_empty() && tb.is_empty() {
        return if a.trim() == b.trim() { 1.0 } else { 0.0 };
    }
    let shared = ta.intersection(&tb).count() as f64;
    let union = ta.union(&tb).count() as f64;
    shared / union
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_ignores_case_and_punctuation() {
        assert_eq!(similarity("Done! The report is ready.", "done the report is ready"), 1.0);
        assert!(similarity("the report is ready", "the weather is nice") < 0.5);
        assert_eq!(similarity("", ""), 1.0);
    }
}
