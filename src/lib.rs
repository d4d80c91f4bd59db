pub mod agent;
pub mod config;
pub mod engine;
pub mod errors;
pub mod git;
pub mod integrations;
pub mod manifest;
pub mod phase;
pub mod prompts;
pub mod server;
pub mod store;
