//! # gpurec-encode
//!
//! Encoder destination-surface adapters for the gpurec capture pipeline.
//!
//! The color engine needs a pair of GL textures to render Y and UV planes
//! into; the encoder needs those pixels in whatever memory its hardware
//! block reads. The three adapters bridge that gap, each keeping the data
//! on the GPU:
//!
//! - **VAAPI** ([`VaapiEncoder`]): the encoder surface itself is exported
//!   as DMA-BUF layers and re-imported as GL textures. True zero-copy;
//!   encoding references the same memory the shaders wrote.
//! - **CUDA/NVENC** ([`CudaEncoder`]): GL textures registered as CUDA
//!   graphics resources; one device-to-device 2D memcpy per plane into the
//!   NVENC input surface (NVENC requires encoder-native pitch).
//! - **Software** ([`SoftwareEncoder`]): plain GL textures read back to
//!   pitch-aligned CPU buffers.
//!
//! Codec identities, capability sets and the AMD dimension-alignment
//! quirks live in [`codec`]; the external encoder contract in
//! [`adapter::Encoder`].
//!
//! # Failure policy
//!
//! `start` failing aborts the capture session. There is no adapter-level
//! fallback; the session's encoder selector (which also handles the
//! HDR-to-SDR and HEVC-to-H.264 capability fallbacks) sits above this
//! crate.

pub mod adapter;
pub mod codec;
pub mod cuda;
pub mod error;
pub mod frame;
pub mod software;
pub mod vaapi;

pub use adapter::{Encoder, EncoderAdapter, VideoEncoderAdapter};
pub use codec::{
    align_dimensions, CodecContext, CodecFamily, SupportedCodecs, TimeBase, VideoCodec,
};
pub use cuda::CudaEncoder;
pub use error::{EncodeError, Result};
pub use frame::{CpuPlane, EncodeFrame, EncodedPacket, FrameStorage};
pub use software::SoftwareEncoder;
pub use vaapi::{FastPathSource, VaapiEncoder, VaapiFastPath};

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
