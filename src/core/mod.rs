pub mod agent;
pub mod engine;
pub mod error;
pub mod lifecycle;
pub mod llm;
pub mod memory;
pub mod queue;
pub mod runner;
pub mod tools;
pub mod triggers;
