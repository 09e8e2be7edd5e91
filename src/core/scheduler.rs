//! Periodic signals the run engine cannot raise on its own: due sleepers,
//! parents whose children finished, and runs abandoned by a dead worker.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::core::error::CoreResult;
use crate::core::runs::RunEngine;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub sleepers: usize,
    pub parents: usize,
    pub recovered: usize,
}

impl TickReport {
    pub fn is_idle(&self) -> bool {
        *self == Self::default()
    }
}

pub struct Scheduler {
    engine: Arc<RunEngine>,
}

impl Scheduler {
    pub fn new(engine: Arc<RunEngine>) -> Self {
        Self { engine }
    }

    pub async fn tick(&self) -> CoreResult<TickReport> {
        self.tick_at(Utc::now()).await
    }

    pub async fn tick_at(&self, now: DateTime<Utc>) -> CoreResult<TickReport> {
        let report = TickReport {
            sleepers: self.engine.wake_due_sleepers(now).await?,
            parents: self.engine.wake_parents().await?,
            recovered: self.engine.recover_stale(now).await?,
        };
        if report.is_idle() {
            debug!("Scheduler tick: nothing to do");
        } else {
            info!(
                "Scheduler tick: {} sleeper(s), {} parent(s), {} stale run(s)",
                report.sleepers, report.parents, report.recovered
            );
        }
        Ok(report)
    }
}
