use crate::geo::Coordinate;
use crate::message::error::{MessageError, MessageResult};
use crate::message::state_machine::MessageStatus;
use crate::node::NodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type MessageId = String;

/// Lowest ttl a new message may carry
pub const MIN_TTL: u8 = 1;

/// Highest ttl a new message may carry
pub const MAX_TTL: u8 = 15;

/// Message urgency, ordered `Low < Normal < High < Emergency`
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Emergency,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "LOW",
            Priority::Normal => "NORMAL",
            Priority::High => "HIGH",
            Priority::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryMethod {
    Direct,
    MeshRelay,
    StoreAndForward,
    MobileCorridor,
}

impl DeliveryMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMethod::Direct => "DIRECT",
            DeliveryMethod::MeshRelay => "MESH_RELAY",
            DeliveryMethod::StoreAndForward => "STORE_AND_FORWARD",
            DeliveryMethod::MobileCorridor => "MOBILE_CORRIDOR",
        }
    }
}

/// Caller-supplied fields of a message to send
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NewMessage {
    pub sender_id: NodeId,
    pub sender_name: String,
    pub recipient_id: NodeId,
    pub content: String,
    pub priority: Priority,
    pub encrypted: bool,
    pub sender_location: Option<Coordinate>,
    pub recipient_last_known_location: Option<Coordinate>,
    pub target_delivery_radius_m: Option<f64>,
}

/// One logical message instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub message_id: MessageId,
    pub sender_id: NodeId,
    pub sender_name: String,
    pub recipient_id: NodeId,
    pub content: String,
    pub priority: Priority,
    pub encrypted: bool,

    /// Arrived through a peer payload rather than the ingress API
    pub from_mesh: bool,

    /// Remaining hop budget; 0 forbids further forwarding
    pub ttl: u8,
    pub hop_count: u32,

    /// Relays visited, in order, without duplicates
    pub route_path: Vec<NodeId>,
    pub delivery_method: Option<DeliveryMethod>,
    pub sender_location: Option<Coordinate>,
    pub recipient_last_known_location: Option<Coordinate>,
    pub target_delivery_radius_m: Option<f64>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Nodes currently holding a copy
    pub cached_at: Vec<NodeId>,
    pub cache_expiry: Option<DateTime<Utc>>,

    pub status: MessageStatus,

    /// Set while a routing step holds the message
    pub routing_started_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub delivered_by: Option<NodeId>,
    pub failed_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,

    /// Retention deadline
    pub expires_at: DateTime<Utc>,
}

impl Message {
    pub fn new(
        message_id: MessageId,
        draft: NewMessage,
        ttl: u8,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            message_id,
            sender_id: draft.sender_id,
            sender_name: draft.sender_name,
            recipient_id: draft.recipient_id,
            content: draft.content,
            priority: draft.priority,
            encrypted: draft.encrypted,
            from_mesh: false,
            ttl,
            hop_count: 0,
            route_path: Vec::new(),
            delivery_method: None,
            sender_location: draft.sender_location,
            recipient_last_known_location: draft.recipient_last_known_location,
            target_delivery_radius_m: draft.target_delivery_radius_m,
            attempt_count: 0,
            last_attempt_at: None,
            cached_at: Vec::new(),
            cache_expiry: None,
            status: MessageStatus::Pending,
            routing_started_at: None,
            created_at: now,
            delivered_at: None,
            delivered_by: None,
            failed_at: None,
            failure_reason: None,
            expired_at: None,
            expires_at,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Most recent relay on the route
    pub fn last_hop(&self) -> Option<&NodeId> {
        self.route_path.last()
    }

    /// Move to `to`, stamping the matching lifecycle timestamp
    pub fn transition(&mut self, to: MessageStatus, now: DateTime<Utc>) -> MessageResult<()> {
        if !self.status.can_transition_to(to) {
            return Err(MessageError::InvalidTransition {
                message_id: self.message_id.clone(),
                from: self.status,
                to,
            });
        }

        match to {
            MessageStatus::Routing => self.routing_started_at = Some(now),
            MessageStatus::Delivered => self.delivered_at = Some(now),
            MessageStatus::Failed => self.failed_at = Some(now),
            MessageStatus::Expired => self.expired_at = Some(now),
            MessageStatus::Pending | MessageStatus::Cached => {}
        }
        if to != MessageStatus::Routing {
            self.routing_started_at = None;
        }

        self.status = to;
        Ok(())
    }

    /// Account one relay hop through `relay`
    pub fn record_hop(&mut self, relay: &NodeId) -> MessageResult<()> {
        if self.ttl == 0 {
            return Err(MessageError::TtlExhausted(self.message_id.clone()));
        }
        if self.route_path.contains(relay) {
            return Err(MessageError::RouteLoop {
                message_id: self.message_id.clone(),
                node_id: relay.clone(),
            });
        }

        self.route_path.push(relay.clone());
        self.ttl -= 1;
        self.hop_count += 1;
        Ok(())
    }

    /// Add a cache holder, keeping the set bounded
    pub fn add_cache_holder(&mut self, node_id: &NodeId, max_cache_nodes: usize) -> bool {
        if self.cached_at.contains(node_id) || self.cached_at.len() >= max_cache_nodes {
            return false;
        }
        self.cached_at.push(node_id.clone());
        true
    }

    /// When the terminal state was entered, if any
    pub fn terminal_at(&self) -> Option<DateTime<Utc>> {
        match self.status {
            MessageStatus::Delivered => self.delivered_at,
            MessageStatus::Failed => self.failed_at,
            MessageStatus::Expired => self.expired_at,
            MessageStatus::Pending | MessageStatus::Routing | MessageStatus::Cached => None,
        }
    }
}
