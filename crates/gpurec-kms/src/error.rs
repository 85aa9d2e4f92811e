//! Error types for the KMS broker.

use thiserror::Error;

/// Errors that can occur talking to (or inside) the KMS broker.
#[derive(Error, Debug)]
pub enum KmsError {
    /// The helper binary could not be located.
    #[error("KMS broker binary not found (looked next to the executable and in $PATH)")]
    BrokerNotFound,

    /// The helper process could not be spawned.
    #[error("Failed to spawn KMS broker: {0}")]
    SpawnFailed(std::io::Error),

    /// The helper did not connect back within the handshake window.
    #[error("KMS broker did not connect within {0} seconds")]
    HandshakeTimeout(u64),

    /// The helper exited (or was killed) while we waited on it.
    #[error("KMS broker exited unexpectedly")]
    BrokerDied,

    /// The two sides disagree on the wire protocol version.
    ///
    /// Both sides drop the offending message; this usually means a stale
    /// helper binary from an older installation is still on $PATH.
    #[error("KMS protocol version mismatch: ours {ours}, theirs {theirs}")]
    ProtocolMismatch { ours: u32, theirs: u32 },

    /// A message did not decode as a protocol struct.
    #[error("Malformed KMS message: {0}")]
    MalformedMessage(String),

    /// The broker reported a failure in its response.
    #[error("KMS broker error ({result:?}): {message}")]
    Broker {
        result: crate::protocol::ResponseResult,
        message: String,
    },

    /// DRM device access failed (server side).
    #[error("DRM error: {0}")]
    Drm(String),

    /// Socket level failure.
    #[error("Socket error: {0}")]
    Socket(#[from] std::io::Error),

    /// nix level socket failure.
    #[error("Socket error: {0}")]
    Nix(#[from] nix::errno::Errno),
}

/// Result type for KMS broker operations.
pub type Result<T> = std::result::Result<T, KmsError>;
