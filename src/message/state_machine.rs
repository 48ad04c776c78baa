use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle state of a message
///
/// ```text
/// PENDING ──> ROUTING ──> CACHED ──> DELIVERED
///    │  ▲        │  │        │
///    │  └────────┘  └──> DELIVERED
///    └──> DELIVERED | FAILED | EXPIRED      (any non-terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageStatus {
    Pending,
    Routing,
    Cached,
    Delivered,
    Failed,
    Expired,
}

impl MessageStatus {
    pub const ALL: [MessageStatus; 6] = [
        MessageStatus::Pending,
        MessageStatus::Routing,
        MessageStatus::Cached,
        MessageStatus::Delivered,
        MessageStatus::Failed,
        MessageStatus::Expired,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            MessageStatus::Delivered | MessageStatus::Failed | MessageStatus::Expired
        )
    }

    /// Allowed edges of the lifecycle graph
    pub fn can_transition_to(&self, to: MessageStatus) -> bool {
        use MessageStatus::*;

        match (self, to) {
            (Delivered | Failed | Expired, _) => false,

            (Pending, Routing | Delivered | Failed | Expired) => true,
            (Pending, Pending | Cached) => false,

            // a routing step ends cached, delivered, or back in pending
            (Routing, Cached | Delivered | Pending | Failed | Expired) => true,
            (Routing, Routing) => false,

            // a cached message may be relayed again from its holder
            (Cached, Routing | Delivered | Failed | Expired) => true,
            (Cached, Pending | Cached) => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "PENDING",
            MessageStatus::Routing => "ROUTING",
            MessageStatus::Cached => "CACHED",
            MessageStatus::Delivered => "DELIVERED",
            MessageStatus::Failed => "FAILED",
            MessageStatus::Expired => "EXPIRED",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MessageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown message status: {s}"))
    }
}
