//! Jobfarm - distributed job scheduling for multi-node deployments
//!
//! Nodes share nothing but the job tables. Each node scans for due job
//! definitions, claims pending executions under a time-bound lease, runs
//! them through registered handlers and retries failures with backoff.

#![allow(missing_docs)]

pub mod app;
pub mod app_info;
pub mod boot;
pub mod cli;
pub mod commands;
pub mod config;
pub mod database;
pub mod environment;
pub mod error;
pub mod jobs;
pub mod setup_tracing;
pub mod store;

#[cfg(any(test, feature = "test-utils"))]
pub mod tests;
