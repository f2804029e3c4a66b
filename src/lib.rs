//! convoserver — multi-tenant, multi-channel conversational messaging core.
//!
//! Components (each a long-running process behind one binary):
//! - gateway: provider webhook termination and outbound delivery
//! - orchestrator: the inbound message pipeline and admin surface
//! - ingestion: knowledge asset chunking and vector materialization
//! - automation: rule scheduling and action dispatch

pub mod automation;
pub mod config;
pub mod gateway;
pub mod ingestion;
pub mod llm;
pub mod orchestrator;
pub mod retrieval;
pub mod shared;

pub use config::AppConfig;
pub use shared::state::AppState;
