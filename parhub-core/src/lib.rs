//! ParHub Core - Cluster hub for a parallel computing system
//!
//! This crate provides:
//! - An addressable in-process message transport (router/dealer, pub/sub)
//! - A single-threaded reactor with timers
//! - Heartbeat-based engine liveness
//! - Engine registration and the task ledger clients query

pub mod config;
pub mod coordinator;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod runtime;
pub mod worker;

pub use config::HubConfig;
pub use coordinator::{Hub, HubFactory, HubServer};
pub use error::{HubError, Result};
pub use protocol::{Context, EngineId};
pub use worker::{Engine, Heart, HubClient};

/// Default heartbeat interval in milliseconds
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 2000;

/// Floor for the registration timeout in milliseconds
pub const MIN_REGISTRATION_TIMEOUT_MS: u64 = 5000;
