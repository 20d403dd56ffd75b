// src/tokenlingo/mod.rs

pub mod clients;
pub mod config;
pub mod efficiency;
pub mod error;
pub mod event;
pub mod markers;
pub mod orchestrator;
pub mod pattern_tracker;
pub mod prompt;
pub mod provider;
pub mod session;
pub mod store;

#[cfg(feature = "api-server")]
pub mod api;

// Export the orchestrator so it can be reached as tokenlingo::SessionOrchestrator
pub use orchestrator::SessionOrchestrator;
