//! The capture backend interface.
//!
//! Four backends (KMS planes, XComposite windows, portal/PipeWire streams,
//! NvFBC) hide four mutually incompatible capture protocols behind this
//! trait. The optional operations default to no-ops so the pacer never
//! branches on "does this backend support X".

use gpurec_color::{ColorConversion, SourceColor};
use gpurec_encode::{CodecContext, EncodeFrame};
use gpurec_kms::HdrOutputMetadata;
use x11_dl::xlib::XEvent;

use crate::error::Result;

/// Outcome of one `capture` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    /// A frame was produced into the destination textures.
    Captured,

    /// Nothing this tick (source idle, session recreating, renegotiation
    /// in flight). The pacer skips the frame.
    Skipped,
}

/// Whether the backend wants the session to end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Keep capturing.
    Continue,
    /// Orderly stop (window closed).
    Stop,
    /// Stop due to an error.
    StopWithError,
}

/// One capture protocol behind a uniform surface.
///
/// Call order per event round: `on_event` for each pending event, then
/// `tick`, then (from the pacer, at frame cadence) `capture`.
///
/// `start` runs before the encoder adapter allocates its destination
/// surface: it fixes the codec dimensions the rest of the pipeline is
/// built around.
pub trait CaptureBackend {
    /// Acquire the source and fix the codec dimensions. Called once.
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()>;

    /// Inspect one display-server event. Optional.
    fn on_event(&mut self, event: &XEvent) {
        let _ = event;
    }

    /// Periodic housekeeping between frames. Optional.
    fn tick(&mut self) {}

    /// Whether the session should end. Optional; default keeps going.
    fn should_stop(&mut self) -> StopReason {
        StopReason::Continue
    }

    /// Produce the current frame into the conversion engine's destination
    /// textures (or the encoder surface on the fast path).
    fn capture(
        &mut self,
        frame: &mut EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus>;

    /// Channel order of the source (BGR sources get a swizzle).
    fn source_color(&self) -> SourceColor {
        SourceColor::Rgb
    }

    /// True when this backend's frames bind as OES-external textures and
    /// the conversion engine must load the external shader pair.
    fn uses_external_image(&self) -> bool {
        false
    }

    /// HDR metadata latched from the source, when the source carries it.
    fn hdr_metadata(&self) -> Option<HdrOutputMetadata> {
        None
    }

    /// X11 window being captured; 0 when not applicable. The damage
    /// tracker uses this to follow focus changes.
    fn window_id(&self) -> u64 {
        0
    }

    /// Backend-internal damage state. `None` means the backend has no
    /// damage information and the external tracker (or always-damaged
    /// degradation) decides.
    fn is_damaged(&self) -> Option<bool> {
        None
    }

    /// Clear backend-internal damage after a capture.
    fn clear_damage(&mut self) {}
}

/// The four backends as one tagged type.
///
/// The session selects a variant at startup; everything downstream talks
/// to the trait.
pub enum Backend {
    Kms(crate::kms::KmsCapture),
    XComposite(crate::xcomposite::XCompositeCapture),
    Portal(crate::portal::PortalCapture),
    NvFbc(crate::nvfbc::NvFbcCapture),
}

impl Backend {
    fn inner(&mut self) -> &mut dyn CaptureBackend {
        match self {
            Backend::Kms(b) => b,
            Backend::XComposite(b) => b,
            Backend::Portal(b) => b,
            Backend::NvFbc(b) => b,
        }
    }

    fn inner_ref(&self) -> &dyn CaptureBackend {
        match self {
            Backend::Kms(b) => b,
            Backend::XComposite(b) => b,
            Backend::Portal(b) => b,
            Backend::NvFbc(b) => b,
        }
    }
}

impl CaptureBackend for Backend {
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()> {
        self.inner().start(ctx)
    }

    fn on_event(&mut self, event: &XEvent) {
        self.inner().on_event(event);
    }

    fn tick(&mut self) {
        self.inner().tick();
    }

    fn should_stop(&mut self) -> StopReason {
        self.inner().should_stop()
    }

    fn capture(
        &mut self,
        frame: &mut EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus> {
        self.inner().capture(frame, color)
    }

    fn source_color(&self) -> SourceColor {
        self.inner_ref().source_color()
    }

    fn uses_external_image(&self) -> bool {
        self.inner_ref().uses_external_image()
    }

    fn hdr_metadata(&self) -> Option<HdrOutputMetadata> {
        self.inner_ref().hdr_metadata()
    }

    fn window_id(&self) -> u64 {
        self.inner_ref().window_id()
    }

    fn is_damaged(&self) -> Option<bool> {
        self.inner_ref().is_damaged()
    }

    fn clear_damage(&mut self) {
        self.inner().clear_damage();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct MinimalBackend;

    impl CaptureBackend for MinimalBackend {
        fn start(&mut self, _ctx: &mut CodecContext) -> Result<()> {
            Ok(())
        }

        fn capture(
            &mut self,
            _frame: &mut EncodeFrame,
            _color: &ColorConversion,
        ) -> Result<CaptureStatus> {
            Ok(CaptureStatus::Captured)
        }
    }

    #[test]
    fn test_optional_operations_have_defaults() {
        let mut backend = MinimalBackend;
        assert_eq!(backend.should_stop(), StopReason::Continue);
        assert_eq!(backend.source_color(), SourceColor::Rgb);
        assert!(!backend.uses_external_image());
        assert!(backend.hdr_metadata().is_none());
        assert_eq!(backend.window_id(), 0);
        assert!(backend.is_damaged().is_none());
        backend.tick();
        backend.clear_damage();
    }
}
