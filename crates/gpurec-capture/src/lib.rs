//! # gpurec-capture
//!
//! Capture backends for the gpurec pipeline: four mutually incompatible
//! screen-capture protocols behind one [`CaptureBackend`] interface.
//!
//! | Backend | Source | Path to the GPU |
//! |---------|--------|-----------------|
//! | [`KmsCapture`] | DRM/KMS scanout planes via the privileged broker | DMA-BUF import (or VAAPI direct blit on AMD) |
//! | [`XCompositeCapture`] | One X11 window's backing pixmap | EGL pixmap image |
//! | [`PortalCapture`] | XDG portal / PipeWire stream | DMA-BUF import from the loop thread's latch |
//! | [`NvFbcCapture`] | NVIDIA NvFBC session | NvFBC-managed GL textures |
//!
//! Shared machinery:
//!
//! - [`frame::FrameDescriptor`] - captured frames with move-only DMA-BUF
//!   plane FDs (open exactly once, close exactly once)
//! - [`import::ImportLadder`] - the modifier / external-texture / fast-path
//!   fallback latches every backend shares
//! - [`damage::DamageTracker`] - XDamage + XRandR + cursor-motion
//!   consolidation into one "has the target changed" flag
//! - [`cursor::X11CursorTracker`] - XFixes cursor with upload-on-change
//!
//! # Error taxonomy
//!
//! [`CaptureError`] separates transient failures (skip the frame, retry
//! silently) from fatal ones (tear the session down). Backends return
//! [`CaptureStatus::Skipped`] for the transient cases so the pacer never
//! sees them as errors.

pub mod backend;
pub mod cursor;
pub mod damage;
pub mod error;
pub mod frame;
pub mod import;
pub mod kms;
pub mod nvfbc;
pub mod portal;
pub mod pipewire_stream;
pub mod x11ext;
pub mod xcomposite;

pub use backend::{Backend, CaptureBackend, CaptureStatus, StopReason};
pub use cursor::X11CursorTracker;
pub use damage::{DamageTracker, Rect};
pub use error::{CaptureError, Result};
pub use frame::{CursorRect, DmaBufPlane, FrameDescriptor};
pub use import::{BoundImage, ImportLadder};
pub use kms::{KmsCapture, KmsCaptureParams};
pub use nvfbc::{NvFbcCapture, NvFbcParams};
pub use portal::{PortalCapture, PortalParams};
pub use pipewire_stream::{
    CropRegion, CursorState, LatchedFrame, NegotiatedFormat, PwStreamThread, SharedStreamState,
};
pub use xcomposite::{XCompositeCapture, XCompositeParams};

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
