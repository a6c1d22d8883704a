//! Hub side of the cluster
//!
//! Heartbeat monitoring, engine registration, the task ledger and the hub
//! that ties them to a reactor.

pub mod factory;
pub mod heartmonitor;
pub mod hub;
pub mod ledger;
pub mod liveness;
pub mod registry;

pub use factory::{HubFactory, HubServer};
pub use heartmonitor::{HeartHost, HeartMonitor};
pub use hub::{Hub, HubSockets};
pub use ledger::{ResultDisposition, TaskLedger, TaskRecord};
pub use liveness::{Liveness, Transition};
pub use registry::{EngineRecord, EngineRegistry, EngineState};
