//! Push notifications for step appends and status changes, one broadcast
//! channel per run.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;

use super::{RunStatus, RunStep};

const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub enum StepEvent {
    Appended(RunStep),
    /// A pending or running step reached its final status.
    Updated(RunStep),
    Status { run_id: String, status: RunStatus },
}

#[derive(Clone, Default)]
pub struct StepEvents {
    channels: Arc<Mutex<HashMap<String, broadcast::Sender<StepEvent>>>>,
}

impl StepEvents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stream of events for `run_id`. Slow subscribers see a `Lagged` error
    /// instead of blocking publishers.
    pub fn subscribe(&self, run_id: &str) -> BroadcastStream<StepEvent> {
        let rx = match self.channels.lock() {
            Ok(mut channels) => channels
                .entry(run_id.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .subscribe(),
            // A poisoned map still yields a stream; it just never receives.
            Err(_) => broadcast::channel(1).1,
        };
        BroadcastStream::new(rx)
    }

    pub fn publish(&self, run_id: &str, event: StepEvent) {
        let terminal = matches!(event, StepEvent::Status { status, .. } if status.is_terminal());
        if let Ok(mut channels) = self.channels.lock() {
            if let Some(tx) = channels.get(run_id) {
                let _ = tx.send(event);
            }
            if terminal {
                // Dropping the sender ends every stream after its buffered events.
                channels.remove(run_id);
            }
        }
    }

    pub fn subscriber_count(&self, run_id: &str) -> usize {
        self.channels
            .lock()
            .ok()
            .and_then(|c| c.get(run_id).map(|tx| tx.receiver_count()))
            .unwrap_or(0)
    }
}
