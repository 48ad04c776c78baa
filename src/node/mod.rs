//! Node Registry
//!
//! Participating devices: their reachability, battery, forwarding quotas,
//! statistics and recent position samples.

mod error;
mod registry;
mod types;
mod update;

pub use error::{NodeError, NodeResult};
pub use registry::{NodeRegistry, PositionReport};
pub use types::{
    ema, BatteryTier, Capability, Connectivity, ForwardingState, LocationFix, MobilityClass,
    MovementPattern, Node, NodeId, NodePosition, NodeStats, PositionSample, PositionSource,
    PredictedLocation, RelayProtocol, ScanMode, CONNECTION_TIME_SMOOTHING, MAX_POSITION_HISTORY,
};
pub use update::{EligibilityFilter, NodeUpdate};
