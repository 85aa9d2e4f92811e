//! Error types for the GL/EGL runtime.

use thiserror::Error;

/// Errors that can occur while loading or driving the vendor GL stack.
///
/// Every error from this crate is fatal for the capture session: the
/// runtime is created once at startup and a half-loaded GL stack is not
/// usable for anything.
#[derive(Error, Debug)]
pub enum GlError {
    /// A vendor library could not be opened.
    #[error("Failed to load {library}: {source}")]
    LibraryLoad {
        library: &'static str,
        source: libloading::Error,
    },

    /// A required symbol is missing from a loaded library.
    #[error("Missing symbol {symbol} in {library}")]
    MissingSymbol {
        library: &'static str,
        symbol: &'static str,
    },

    /// EGL display could not be obtained or initialized.
    #[error("EGL display initialization failed (egl error 0x{0:x})")]
    DisplayInit(i32),

    /// No EGL config matched the requested attributes.
    #[error("No matching EGL config")]
    NoConfig,

    /// Context or surface creation failed.
    #[error("Context creation failed: {0}")]
    ContextCreation(String),

    /// The X11 display could not be opened.
    #[error("Failed to open X11 display")]
    X11DisplayOpen,

    /// GLX specific failure (NVIDIA X11 monitor capture path).
    #[error("GLX initialization failed: {0}")]
    Glx(String),

    /// Monitor enumeration failed.
    #[error("Monitor enumeration failed: {0}")]
    MonitorEnumeration(String),

    /// The GL renderer is a software rasterizer; capture would silently
    /// run on the CPU.
    #[error("OpenGL is software-rendered ({0}) - check the graphics driver installation")]
    SoftwareRenderer(String),
}

/// Result type for GL runtime operations.
pub type Result<T> = std::result::Result<T, GlError>;
