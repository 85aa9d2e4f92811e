//! Error taxonomy for the capture layer.
//!
//! The split matters for control flow: `Transient` never crosses the pacer
//! boundary except as a skipped frame, `Fatal` flips the process-wide
//! running flag, `Capability` triggers a one-step codec fallback in the
//! session layer before anything becomes fatal.

use thiserror::Error;

/// Errors from capture backends and their trackers.
#[derive(Error, Debug)]
pub enum CaptureError {
    /// Invalid target or configuration for this backend.
    ///
    /// Surfaced to stderr; the process exits with the unsupported-config
    /// code.
    #[error("Capture configuration error: {0}")]
    Config(String),

    /// The GPU/display stack cannot do what was requested; a fallback may
    /// exist one level up.
    #[error("Capture capability error: {0}")]
    Capability(String),

    /// Momentary failure: broker returned no planes, NvFBC session died,
    /// PipeWire renegotiating. Logged once, retried silently; the frame is
    /// skipped.
    #[error("Transient capture failure: {0}")]
    Transient(String),

    /// Unrecoverable: protocol mismatch, monitor gone, portal timeout.
    /// The session tears down with the capture-failure exit code.
    #[error("Fatal capture failure: {0}")]
    Fatal(String),

    /// D-Bus failure during the portal handshake. Usually means no
    /// session bus or no portal backend is running.
    #[error("D-Bus error: {0}")]
    Dbus(#[from] zbus::Error),

    /// Broker errors map onto transient/fatal at the call site; this
    /// carries the original when the distinction needs context.
    #[error(transparent)]
    Kms(#[from] gpurec_kms::KmsError),

    #[error(transparent)]
    Gl(#[from] gpurec_gl::GlError),

    #[error(transparent)]
    Color(#[from] gpurec_color::ColorError),

    #[error(transparent)]
    Encode(#[from] gpurec_encode::EncodeError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl CaptureError {
    /// True when the pacer should skip the frame and try again rather
    /// than tear the session down.
    pub fn is_transient(&self) -> bool {
        matches!(self, CaptureError::Transient(_))
    }
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(CaptureError::Transient("no planes".into()).is_transient());
        assert!(!CaptureError::Fatal("monitor gone".into()).is_transient());
        assert!(!CaptureError::Config("bad window".into()).is_transient());
    }
}
