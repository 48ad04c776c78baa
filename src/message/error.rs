use crate::message::state_machine::MessageStatus;
use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Message not found: {0}")]
    NotFound(String),

    #[error("Invalid transition for {message_id}: {from} -> {to}")]
    InvalidTransition {
        message_id: String,
        from: MessageStatus,
        to: MessageStatus,
    },

    #[error("TTL exhausted for message {0}")]
    TtlExhausted(String),

    #[error("Node {node_id} already on the route of {message_id}")]
    RouteLoop { message_id: String, node_id: String },

    #[error("Could not allocate a unique message id after {0} attempts")]
    IdExhausted(u32),

    #[error("Message {0} was modified concurrently")]
    Conflict(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type MessageResult<T> = Result<T, MessageError>;
