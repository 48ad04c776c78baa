use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Peer {0} is not connected")]
    PeerUnavailable(String),

    #[error("Send to {peer_id} failed: {reason}")]
    SendFailed { peer_id: String, reason: String },

    #[error("Envelope of {0} bytes exceeds the size limit")]
    TooLarge(usize),

    #[error("Unsupported envelope version {0}")]
    UnsupportedVersion(u8),

    #[error("Envelope checksum mismatch")]
    ChecksumMismatch,

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<bincode::Error> for TransportError {
    fn from(err: bincode::Error) -> Self {
        TransportError::SerializationError(err.to_string())
    }
}

pub type TransportResult<T> = Result<T, TransportError>;
