use crate::message::MessageError;
use crate::node::NodeError;
use crate::store::StoreError;
use crate::transport::TransportError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Invalid node: {0}")]
    InvalidNode(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Invalid state transition: {0}")]
    InvalidStateTransition(String),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Transport error: {0}")]
    TransportError(#[from] TransportError),

    #[error("Store error: {0}")]
    StoreError(#[from] StoreError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoordinatorError {
    /// Errors caused by the caller's input rather than the engine
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            CoordinatorError::InvalidMessage(_)
                | CoordinatorError::InvalidNode(_)
                | CoordinatorError::InvalidRequest(_)
        )
    }
}

impl From<MessageError> for CoordinatorError {
    fn from(err: MessageError) -> Self {
        match err {
            MessageError::NotFound(id) => CoordinatorError::MessageNotFound(id),
            e @ MessageError::InvalidTransition { .. } => {
                CoordinatorError::InvalidStateTransition(e.to_string())
            }
            MessageError::Conflict(id) => CoordinatorError::Conflict(id),
            MessageError::Store(e) => CoordinatorError::StoreError(e),
            e => CoordinatorError::Internal(e.to_string()),
        }
    }
}

impl From<NodeError> for CoordinatorError {
    fn from(err: NodeError) -> Self {
        match err {
            NodeError::NotFound(id) => CoordinatorError::NodeNotFound(id),
            NodeError::InvalidUpdate(reason) => CoordinatorError::InvalidNode(reason),
            NodeError::Store(e) => CoordinatorError::StoreError(e),
        }
    }
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;
