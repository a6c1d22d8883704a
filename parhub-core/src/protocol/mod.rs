//! Wire protocol
//!
//! Multi-frame messages, their payloads and the in-process transport they
//! travel over.

pub mod message;
pub mod messages;
pub mod transport;

pub use message::{notification, Message, MonitorKind, QueryKind};
pub use messages::{EngineId, Lane, Reply, TaskStatus};
pub use transport::{Context, DealerSocket, Inbox, PubSocket, RouterSocket, SubSocket};
