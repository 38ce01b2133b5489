//! Error types for the grpclb policy.

use thiserror::Error;

/// Error type for the grpclb policy and its collaborators.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// A pick arrived without a token-storage slot in its initial metadata.
    #[error("pick request did not provide a token-storage slot")]
    MissingTokenStorage,

    /// An enqueued pick was cancelled by the caller before an RR became
    /// available to serve it.
    #[error("pick cancelled: {0}")]
    PickCancelled(Box<Error>),

    /// The policy has shut down; no further calls will be served.
    #[error("channel shutdown")]
    ChannelShutdown,

    /// A decoded LB response failed validation. Dropped; the stream
    /// continues and this error never reaches a pick caller.
    #[error("invalid LB response: {0}")]
    InvalidLbResponse(String),

    /// The LB streaming call ended. Internal only: drives a retry, never
    /// surfaced to a pick caller.
    #[error("LB call ended: {0}")]
    LbCallEnded(String),

    /// Failed to establish the transport to the LB service.
    #[error("LB transport connection failed: {0}")]
    Connection(String),

    /// A transport-level failure occurred mid-stream.
    #[error("LB transport error: {0}")]
    Transport(#[from] tonic::Status),

    /// Failed to encode or decode an LB protocol message.
    #[error("LB codec error: {0}")]
    Codec(String),

    /// The policy could not be constructed from the supplied configuration.
    #[error("invalid grpclb configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for grpclb operations.
pub type Result<T> = std::result::Result<T, Error>;
