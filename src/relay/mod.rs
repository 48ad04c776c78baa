//! Relay Selector
//!
//! Picks intermediary nodes to carry a message toward a recipient that is
//! not directly reachable.
//!
//! Key features:
//! - Proximity search around the recipient's predicted or last known location
//! - Movement corridors that spread copies along a mobile recipient's path
//! - Priority-aware battery floors and quota gating
//! - Link-layer discovery fallback for location-less deployments

mod selector;
mod types;

pub use selector::RelaySelector;
pub use types::{
    estimate_delivery_minutes, RelaySelection, RelayTarget, RoutingStrategy, SelectionOptions,
    MAX_DELIVERY_ESTIMATE_MINUTES,
};
