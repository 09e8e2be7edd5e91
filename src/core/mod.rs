pub mod command;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod policy;
pub mod queue;
pub mod quota;
pub mod runs;
pub mod sandbox;
pub mod scheduler;
pub mod store;
pub mod tools;
pub mod worker;
