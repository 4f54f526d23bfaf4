// Common library for the golden-config job workers

pub mod config;
pub mod errors;
pub mod filter;
pub mod inventory;
pub mod models;
pub mod publish;
pub mod retry;
pub mod runner;
pub mod services;
pub mod sync;
pub mod telemetry;
pub mod vcs;
