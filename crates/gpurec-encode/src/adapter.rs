//! The encoder adapter interface and its dispatch enum.
//!
//! An adapter owns the pair of destination textures the color engine writes
//! into and knows how to get those pixels in front of one encoder family
//! without a CPU round-trip (or with exactly one, for the software case).

use gpurec_color::DestinationColor;
use gpurec_gl::ffi::GlUint;

use crate::codec::{CodecContext, SupportedCodecs};
use crate::error::Result;
use crate::frame::{EncodeFrame, EncodedPacket};

/// Destination-surface adapter for one encoder family.
///
/// Lifecycle: `supported_codecs` may be called before `start` (capability
/// probing tears its temporary state down again when `cleanup` is set).
/// `start` allocates the destination surface once; the textures are reused
/// for every frame until drop.
pub trait VideoEncoderAdapter {
    /// What this adapter can encode on this GPU.
    fn supported_codecs(&mut self, cleanup: bool) -> SupportedCodecs;

    /// Allocate the destination surface for `ctx` and return the frame the
    /// external encoder will consume. May grow `ctx`'s dimensions for
    /// codec alignment rules.
    fn start(&mut self, ctx: &mut CodecContext) -> Result<EncodeFrame>;

    /// Move the rendered textures into `frame`'s storage. A no-op for
    /// adapters whose textures alias the encoder surface (VAAPI).
    fn copy_textures_to_frame(&mut self, frame: &mut EncodeFrame) -> Result<()> {
        let _ = frame;
        Ok(())
    }

    /// The destination textures (Y, UV) and their pixel layout.
    fn textures(&self) -> ([GlUint; 2], DestinationColor);
}

/// The three adapter implementations behind one type.
pub enum EncoderAdapter {
    Vaapi(crate::vaapi::VaapiEncoder),
    Cuda(crate::cuda::CudaEncoder),
    Software(crate::software::SoftwareEncoder),
}

impl VideoEncoderAdapter for EncoderAdapter {
    fn supported_codecs(&mut self, cleanup: bool) -> SupportedCodecs {
        match self {
            EncoderAdapter::Vaapi(e) => e.supported_codecs(cleanup),
            EncoderAdapter::Cuda(e) => e.supported_codecs(cleanup),
            EncoderAdapter::Software(e) => e.supported_codecs(cleanup),
        }
    }

    fn start(&mut self, ctx: &mut CodecContext) -> Result<EncodeFrame> {
        match self {
            EncoderAdapter::Vaapi(e) => e.start(ctx),
            EncoderAdapter::Cuda(e) => e.start(ctx),
            EncoderAdapter::Software(e) => e.start(ctx),
        }
    }

    fn copy_textures_to_frame(&mut self, frame: &mut EncodeFrame) -> Result<()> {
        match self {
            EncoderAdapter::Vaapi(e) => e.copy_textures_to_frame(frame),
            EncoderAdapter::Cuda(e) => e.copy_textures_to_frame(frame),
            EncoderAdapter::Software(e) => e.copy_textures_to_frame(frame),
        }
    }

    fn textures(&self) -> ([GlUint; 2], DestinationColor) {
        match self {
            EncoderAdapter::Vaapi(e) => e.textures(),
            EncoderAdapter::Cuda(e) => e.textures(),
            EncoderAdapter::Software(e) => e.textures(),
        }
    }
}

/// The external encoder this workspace drives but does not implement.
///
/// Implementations wrap an actual codec (VAAPI/NVENC through an AV
/// library, or a software encoder). The dataplane only relies on this
/// narrow surface: configure once, submit frames with a pts, drain
/// packets.
pub trait Encoder: Send {
    /// Bind the encoder to the negotiated context and frame. CUDA-family
    /// encoders fill in the frame's device pointers here.
    fn configure(&mut self, ctx: &CodecContext, frame: &mut EncodeFrame) -> Result<()>;

    /// Submit the current frame contents with `pts`. Duplicated frames are
    /// submitted repeatedly with distinct pts values.
    fn submit(&mut self, frame: &EncodeFrame, pts: i64) -> Result<()>;

    /// Drain any finished packets. Called after every submit.
    fn receive(&mut self) -> Vec<EncodedPacket>;

    /// Flush delayed packets at end of stream.
    fn flush(&mut self) -> Vec<EncodedPacket>;
}
