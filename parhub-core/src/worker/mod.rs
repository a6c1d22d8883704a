//! Engine-side logic
//!
//! Heart beacon, a minimal self-registering engine and the hub client.

pub mod client;
pub mod engine;
pub mod heart;

pub use client::{ClientConfig, HubClient};
pub use engine::{Engine, EngineLink};
pub use heart::{Heart, HeartHandle};
