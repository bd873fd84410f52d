//! # Repo Sync Library
//!
//! Code host discovery, repo catalog reconciliation and index job scheduling,
//! plus the operator API and the background services that drive them.

pub mod config;
pub mod connectors;
pub mod crypto;
pub mod db;
pub mod error;
pub mod git;
pub mod glob;
pub mod handlers;
pub mod indexer;
pub mod job_worker;
pub mod models;
pub mod repositories;
pub mod retry;
pub mod scheduler;
pub mod server;
pub mod sync_engine;
pub mod sync_poller;
pub mod telemetry;
pub use migration;
