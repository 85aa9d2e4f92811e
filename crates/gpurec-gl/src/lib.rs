//! # gpurec-gl
//!
//! Runtime-loaded GL/EGL/GLX stack for the gpurec capture pipeline.
//!
//! This crate is part of the [gpurec](https://github.com/gpurec/gpurec)
//! workspace. It owns the process-wide GL state the rest of the dataplane
//! renders through:
//!
//! - **Dynamic loading**: `libEGL`, `libGL`/`libGLESv2` and X11 are opened
//!   with `dlopen` semantics at startup; nothing from the vendor stack is
//!   linked at build time, so one binary runs on Mesa and the NVIDIA
//!   proprietary driver alike.
//! - **Headless contexts**: a GL ES 3.0 context on a 1x1 invisible X11
//!   window, a pbuffer on Wayland, or a GLX context when NvFBC requires one.
//! - **DMA-BUF import**: `eglCreateImage` with `EGL_LINUX_DMA_BUF_EXT` plus
//!   `glEGLImageTargetTexture2DOES`, the zero-copy entry into the GPU.
//! - **Monitor enumeration**: XRandR (with DRM connector ids) on X11, DRM
//!   connectors on Wayland.
//! - **Vendor detection**: AMD/Intel/NVIDIA classification from the GL
//!   renderer string, including Steam Deck detection.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpurec_gl::{GlRuntime, RuntimeOptions};
//!
//! let runtime = GlRuntime::load(&RuntimeOptions {
//!     display_name: None,
//!     is_monitor_capture: true,
//! })?;
//!
//! for monitor in runtime.monitors() {
//!     println!(
//!         "{}: {}x{} at {:?} (connector {})",
//!         monitor.name, monitor.size.0, monitor.size.1,
//!         monitor.position, monitor.connector_id,
//!     );
//! }
//! ```
//!
//! # Threading
//!
//! The runtime is created on, and must stay on, the thread that runs the
//! frame pacer. The GL context is made current there exactly once; the
//! type is intentionally not `Send`/`Sync`.

pub mod error;
pub mod ffi;
pub mod library;
pub mod monitor;
pub mod runtime;
pub mod vendor;

pub use error::{GlError, Result};
pub use monitor::{Monitor, Rotation};
pub use runtime::{DisplayServer, GlRuntime, RuntimeOptions};
pub use vendor::{GpuInfo, GpuVendor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
