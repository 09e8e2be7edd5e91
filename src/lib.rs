//! Run orchestration core: model-issued commands, tool policy and quotas,
//! sandboxed tool execution and a durable per-run state machine.

pub mod config;
pub mod core;
pub mod daemon;
pub mod logging;
pub mod platform;
