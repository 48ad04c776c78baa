//! relaymesh: relay selection and message lifecycle engine
//!
//! Decides, for a message whose recipient may be offline, mobile or out of
//! range, whether to deliver directly, hand it to intermediary nodes, or
//! hold it for later pickup, within per-node forwarding budgets and a
//! bounded hop count.

pub mod api;
pub mod config;
pub mod coordinator;
pub mod geo;
pub mod message;
pub mod metrics;
pub mod movement;
pub mod node;
pub mod quota;
pub mod relay;
pub mod scheduler;
pub mod scoring;
pub mod store;
pub mod transport;

pub use config::EngineConfig;
pub use coordinator::{CoordinatorError, CoordinatorResult, MessageCoordinator};
