//! Error types for the encoder adapters.

use thiserror::Error;

/// Errors from the encoder destination-surface adapters.
///
/// A failing `start` aborts the whole capture session; there is no
/// adapter-to-adapter fallback at this layer. The selector above (which
/// knows the GPU vendor and the user's encoder preference) handles
/// falling back between codec/encoder choices.
#[derive(Error, Debug)]
pub enum EncodeError {
    /// A vendor library required by this adapter could not be loaded.
    #[error("Failed to load {library}: {reason}")]
    LibraryLoad {
        library: &'static str,
        reason: String,
    },

    /// VAAPI call failure.
    #[error("VAAPI error in {call}: status {status}")]
    Vaapi { call: &'static str, status: i32 },

    /// CUDA call failure.
    #[error("CUDA error in {call}: code {code}")]
    Cuda { call: &'static str, code: i32 },

    /// EGL re-import of an exported surface failed.
    #[error("Failed to import encoder surface into GL: {0}")]
    SurfaceImport(String),

    /// GL texture allocation failed.
    #[error("Failed to allocate destination textures: {0}")]
    TextureAllocation(String),

    /// The requested codec is not supported by this adapter/GPU.
    #[error("Codec {0:?} is not supported by this encoder")]
    UnsupportedCodec(crate::codec::VideoCodec),

    /// No render node could be derived from the card path.
    #[error("No render node for {0}")]
    NoRenderNode(String),

    /// Frame storage did not match the adapter (wiring bug).
    #[error("Frame storage mismatch: expected {expected}")]
    StorageMismatch { expected: &'static str },

    /// I/O failure (device open).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for encoder adapter operations.
pub type Result<T> = std::result::Result<T, EncodeError>;
