use crate::store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("Node not found: {0}")]
    NotFound(String),

    #[error("Invalid node update: {0}")]
    InvalidUpdate(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type NodeResult<T> = Result<T, NodeError>;
