//! Keeps a context's live message window bounded by folding its older half
//! into a running summary.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::core::error::CoreResult;
use crate::core::llm::{ChatMessage, CompletionOptions, LlmManager};
use crate::core::store::{ContextMessage, MessageDirection, Store};

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, previous: Option<&str>, messages: &[ContextMessage]) -> CoreResult<String>;
}

pub struct LlmSummarizer {
    llm: LlmManager,
}

impl LlmSummarizer {
    pub fn new(llm: LlmManager) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, previous: Option<&str>, messages: &[ContextMessage]) -> CoreResult<String> {
        let mut transcript = String::new();
        if let Some(prev) = previous {
            transcript.push_str("Earlier summary:\n");
            transcript.push_str(prev);
            transcript.push_str("\n\n");
        }
        for m in messages {
            let who = match m.direction {
                MessageDirection::Inbound => "user",
                MessageDirection::Outbound => "agent",
            };
            transcript.push_str(&format!("{who}: {}\n", m.content));
        }
        let prompt = [
            ChatMessage::system(
                "Summarize the conversation below in a few sentences. Keep names, decisions and open requests.",
            ),
            ChatMessage::user(transcript),
        ];
        Ok(self.llm.complete(&prompt, &CompletionOptions::default()).await?)
    }
}

pub struct ContextCompactor {
    store: Store,
    summarizer: Arc<dyn Summarizer>,
    turn_threshold: i64,
}

impl ContextCompactor {
    pub fn new(store: Store, summarizer: Arc<dyn Summarizer>, turn_threshold: i64) -> Self {
        Self {
            store,
            summarizer,
            turn_threshold,
        }
    }

    /// Compact `context_id` if it is over the threshold. Returns the new
    /// turn count when compaction happened.
    pub async fn maybe_compact(&self, context_id: &str) -> CoreResult<Option<i64>> {
        let turns = self.store.context_turn_count(context_id).await?;
        if turns <= self.turn_threshold {
            return Ok(None);
        }
        let snapshot = self.store.context_messages(context_id).await?;
        let cut = snapshot.len() / 2;
        if cut == 0 {
            return Ok(None);
        }
        let older = &snapshot[..cut];
        let previous = self.store.context_summary(context_id).await?;
        let summary = self.summarizer.summarize(previous.as_deref(), older).await?;
        let ids: Vec<i64> = older.iter().map(|m| m.id).collect();
        let remaining = self.store.compact_context(context_id, &ids, &summary).await?;
        info!(
            "Context [{}] compacted: {} messages folded, {} turns remain",
            context_id,
            ids.len(),
            remaining
        );
        Ok(Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        batches: Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl Summarizer for Recording {
        async fn summarize(
            &self,
            previous: Option<&str>,
            messages: &[ContextMessage],
        ) -> CoreResult<String> {
            self.batches
                .lock()
                .unwrap()
                .push(messages.iter().map(|m| m.content.clone()).collect());
            Ok(format!("{}+{}", previous.unwrap_or(""), messages.len()))
        }
    }

    #[tokio::test]
    async fn folds_the_older_half_past_the_threshold() {
        let store = Store::open_in_memory().unwrap();
        let summarizer = Arc::new(Recording::default());
        let compactor = ContextCompactor::new(store.clone(), summarizer.clone(), 3);

        for i in 0..3 {
            store
                .append_context_message("c1", MessageDirection::Inbound, &format!("q{i}"))
                .await
                .unwrap();
            store
                .append_context_message("c1", MessageDirection::Outbound, &format!("a{i}"))
                .await
                .unwrap();
        }
        assert_eq!(compactor.maybe_compact("c1").await.unwrap(), None);

        store
            .append_context_message("c1", MessageDirection::Inbound, "q3")
            .await
            .unwrap();
        // 7 messages, 4 turns: the first 3 messages are folded.
        let remaining = compactor.maybe_compact("c1").await.unwrap();
        assert_eq!(remaining, Some(2));
        assert_eq!(
            summarizer.batches.lock().unwrap()[0],
            vec!["q0", "a0", "q1"]
        );
        assert_eq!(store.context_summary("c1").await.unwrap().as_deref(), Some("+3"));
        assert_eq!(compactor.maybe_compact("c1").await.unwrap(), None);
    }
}
