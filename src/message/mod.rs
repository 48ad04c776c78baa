//! Message Lifecycle Manager
//!
//! Owns the message state machine, ttl and hop accounting, and the route
//! path and cache-holder bookkeeping.

mod error;
mod lifecycle;
mod state_machine;
mod types;

pub use error::{MessageError, MessageResult};
pub use lifecycle::{IdGenerator, LifecycleManager, RouteOutcome};
pub use state_machine::MessageStatus;
pub use types::{
    DeliveryMethod, Message, MessageId, NewMessage, Priority, MAX_TTL, MIN_TTL,
};
