use thiserror::Error;

/// Reasons a wire frame is rejected. Frames failing to decode are dropped
/// by the receiver; these errors never close a connection.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid sender identity")]
    InvalidSender,
}
