//! Error types for the color conversion engine.

use thiserror::Error;

/// Errors that can occur building or driving the conversion pipeline.
///
/// All of these are fatal for the session: the engine is rebuilt only when
/// the destination dimensions or bit depth change, and a failure there
/// means the GL stack cannot express the requested conversion.
#[derive(Error, Debug)]
pub enum ColorError {
    /// Shader compilation failed; the log comes from the driver.
    #[error("Shader compilation failed: {0}")]
    ShaderCompile(String),

    /// Program linking failed.
    #[error("Shader link failed: {0}")]
    ShaderLink(String),

    /// A framebuffer attached to a destination texture is incomplete.
    #[error("Framebuffer incomplete for {0} plane")]
    FramebufferIncomplete(&'static str),

    /// The caller supplied the wrong number of destination textures.
    #[error("Expected 2 destination textures, got {0}")]
    WrongDestinationCount(usize),
}

/// Result type for color conversion operations.
pub type Result<T> = std::result::Result<T, ColorError>;
