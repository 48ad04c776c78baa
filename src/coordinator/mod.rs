//! Ingress operations and peer hand-off, composed over the registry,
//! selector, quota governor and lifecycle manager.

mod coordinator;
mod error;
mod types;

pub use crate::config::DEFAULT_LOCAL_PEER;
pub use coordinator::MessageCoordinator;
pub use error::{CoordinatorError, CoordinatorResult};
pub use types::{
    DiscoveredRelay, HandOffReport, NetworkStatus, NodeRegistration, PayloadDisposition,
    SendReceipt,
};
