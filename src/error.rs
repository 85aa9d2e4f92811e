//! Top-level error type with process exit-code mapping.

use thiserror::Error;

use crate::config::exit_codes;

/// Errors surfacing from a recording session.
///
/// Every variant maps to one of the documented exit codes so scripts can
/// branch on `$?`. Messages go to stderr as single lines; no backtraces.
#[derive(Error, Debug)]
pub enum RecordError {
    /// Invalid configuration.
    #[error("Invalid configuration: {}", .0.join("; "))]
    Config(Vec<String>),

    /// The requested codec is unsupported and every fallback was too.
    #[error("No supported codec: {0}")]
    UnsupportedCodec(String),

    /// GL/EGL stack failed to initialize.
    #[error(transparent)]
    Gl(#[from] gpurec_gl::GlError),

    /// No usable DRM card.
    #[error("No DRM card available")]
    NoDrmCard,

    /// Capture setup or steady-state failure.
    #[error(transparent)]
    Capture(#[from] gpurec_capture::CaptureError),

    /// Encoder adapter failure.
    #[error(transparent)]
    Encode(#[from] gpurec_encode::EncodeError),

    /// Output I/O failure (fatal for the output file).
    #[error("Output error: {0}")]
    Io(#[from] std::io::Error),
}

impl RecordError {
    /// The exit code this error maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            RecordError::Config(_) | RecordError::UnsupportedCodec(_) => {
                exit_codes::UNSUPPORTED_CONFIG
            }
            RecordError::Gl(_) => exit_codes::GL_INIT_FAILED,
            RecordError::NoDrmCard => exit_codes::NO_DRM_CARD,
            RecordError::Capture(e) => match e {
                gpurec_capture::CaptureError::Config(_) => exit_codes::UNSUPPORTED_CONFIG,
                _ => exit_codes::CAPTURE_FAILED,
            },
            RecordError::Encode(_) => exit_codes::CAPTURE_FAILED,
            RecordError::Io(_) => exit_codes::FAILURE,
        }
    }
}

/// Result type for session operations.
pub type Result<T> = std::result::Result<T, RecordError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(
            RecordError::Config(vec!["bad".into()]).exit_code(),
            exit_codes::UNSUPPORTED_CONFIG
        );
        assert_eq!(RecordError::NoDrmCard.exit_code(), exit_codes::NO_DRM_CARD);
        assert_eq!(
            RecordError::Capture(gpurec_capture::CaptureError::Fatal("x".into())).exit_code(),
            exit_codes::CAPTURE_FAILED
        );
        assert_eq!(
            RecordError::Capture(gpurec_capture::CaptureError::Config("x".into())).exit_code(),
            exit_codes::UNSUPPORTED_CONFIG
        );
    }

    #[test]
    fn test_messages_are_single_line() {
        let error = RecordError::Config(vec!["a".into(), "b".into()]);
        assert!(!error.to_string().contains('\n'));
    }
}
