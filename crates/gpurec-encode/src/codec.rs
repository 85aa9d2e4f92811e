//! Codec identities, capability sets and dimension alignment quirks.

use gpurec_color::{ColorDepth, ColorRange, DestinationColor};
use gpurec_gl::GpuVendor;

/// Video codec choices, including the HDR/10-bit variants that change the
/// destination surface bit depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VideoCodec {
    H264,
    Hevc,
    HevcHdr,
    Hevc10Bit,
    Av1,
    Av1Hdr,
    Av110Bit,
    Vp8,
    Vp9,
}

impl VideoCodec {
    /// Destination surface bit depth implied by the codec choice.
    pub fn depth(self) -> ColorDepth {
        match self {
            VideoCodec::HevcHdr
            | VideoCodec::Hevc10Bit
            | VideoCodec::Av1Hdr
            | VideoCodec::Av110Bit => ColorDepth::Bits10,
            _ => ColorDepth::Bits8,
        }
    }

    /// Destination YUV layout: P010 for the 10-bit variants, NV12 otherwise.
    pub fn destination_color(self) -> DestinationColor {
        match self.depth() {
            ColorDepth::Bits10 => DestinationColor::P010,
            ColorDepth::Bits8 => DestinationColor::Nv12,
        }
    }

    pub fn is_hdr(self) -> bool {
        matches!(self, VideoCodec::HevcHdr | VideoCodec::Av1Hdr)
    }

    /// One-step capability fallback: HDR drops to SDR, the newer codecs
    /// drop to H.264. `None` means there is nothing left to try and the
    /// error becomes fatal.
    pub fn fallback(self) -> Option<VideoCodec> {
        match self {
            VideoCodec::HevcHdr | VideoCodec::Hevc10Bit => Some(VideoCodec::Hevc),
            VideoCodec::Av1Hdr | VideoCodec::Av110Bit => Some(VideoCodec::Av1),
            VideoCodec::Hevc | VideoCodec::Av1 | VideoCodec::Vp9 => Some(VideoCodec::H264),
            VideoCodec::Vp8 | VideoCodec::H264 => None,
        }
    }

    /// The base codec family, ignoring HDR/bit-depth variants.
    pub fn family(self) -> CodecFamily {
        match self {
            VideoCodec::H264 => CodecFamily::H264,
            VideoCodec::Hevc | VideoCodec::HevcHdr | VideoCodec::Hevc10Bit => CodecFamily::Hevc,
            VideoCodec::Av1 | VideoCodec::Av1Hdr | VideoCodec::Av110Bit => CodecFamily::Av1,
            VideoCodec::Vp8 => CodecFamily::Vp8,
            VideoCodec::Vp9 => CodecFamily::Vp9,
        }
    }
}

/// Codec families as the hardware sees them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecFamily {
    H264,
    Hevc,
    Av1,
    Vp8,
    Vp9,
}

/// What an encoder implementation can produce on this GPU.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SupportedCodecs {
    pub h264: bool,
    pub hevc: bool,
    pub hevc_hdr: bool,
    pub hevc_10bit: bool,
    pub av1: bool,
    pub av1_hdr: bool,
    pub av1_10bit: bool,
    pub vp8: bool,
    pub vp9: bool,
}

impl SupportedCodecs {
    pub fn supports(&self, codec: VideoCodec) -> bool {
        match codec {
            VideoCodec::H264 => self.h264,
            VideoCodec::Hevc => self.hevc,
            VideoCodec::HevcHdr => self.hevc_hdr,
            VideoCodec::Hevc10Bit => self.hevc_10bit,
            VideoCodec::Av1 => self.av1,
            VideoCodec::Av1Hdr => self.av1_hdr,
            VideoCodec::Av110Bit => self.av1_10bit,
            VideoCodec::Vp8 => self.vp8,
            VideoCodec::Vp9 => self.vp9,
        }
    }
}

/// Codec parameters shared between the adapters, the external encoder and
/// the muxer contract. Width/height may be grown by [`align_dimensions`];
/// the visible area stays at the capture size.
#[derive(Debug, Clone)]
pub struct CodecContext {
    pub codec: VideoCodec,
    pub width: i32,
    pub height: i32,
    pub framerate: u32,
    pub color_range: ColorRange,

    /// pts/dts units: 1/fps for CFR, microseconds for VFR/content.
    pub time_base: TimeBase,
}

/// A rational time base, `num/den` seconds per tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeBase {
    pub num: i32,
    pub den: i32,
}

impl TimeBase {
    pub const MICROSECONDS: TimeBase = TimeBase {
        num: 1,
        den: 1_000_000,
    };

    pub fn per_frame(fps: u32) -> TimeBase {
        TimeBase {
            num: 1,
            den: fps.max(1) as i32,
        }
    }

    /// Rescale a timestamp from this base into `target`, rounding to
    /// nearest.
    pub fn rescale(self, value: i64, target: TimeBase) -> i64 {
        let num = value as i128 * self.num as i128 * target.den as i128;
        let den = self.den as i128 * target.num as i128;
        if den == 0 {
            return value;
        }
        let half = den.abs() / 2;
        let rounded = if num >= 0 { num + half } else { num - half };
        (rounded / den) as i64
    }
}

fn align_up(value: i32, alignment: i32) -> i32 {
    (value + alignment - 1) / alignment * alignment
}

/// Apply the per-vendor codec dimension quirks to a codec context.
///
/// AMD HEVC wants width aligned to 64 and height to 16. AMD AV1 aligns
/// width to 64 too, but the driver special-cases a height of exactly 1080
/// (it maps it to 1082 internally, and aligning to 1088 here would add
/// visible black bars).
pub fn align_dimensions(vendor: GpuVendor, ctx: &mut CodecContext) {
    if vendor != GpuVendor::Amd {
        return;
    }
    match ctx.codec.family() {
        CodecFamily::Hevc => {
            ctx.width = align_up(ctx.width, 64);
            ctx.height = align_up(ctx.height, 16);
        }
        CodecFamily::Av1 => {
            ctx.width = align_up(ctx.width, 64);
            if ctx.height != 1080 {
                ctx.height = align_up(ctx.height, 16);
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_depth_and_destination() {
        assert_eq!(VideoCodec::H264.depth(), ColorDepth::Bits8);
        assert_eq!(VideoCodec::HevcHdr.depth(), ColorDepth::Bits10);
        assert_eq!(VideoCodec::Av110Bit.destination_color(), DestinationColor::P010);
        assert_eq!(VideoCodec::Vp9.destination_color(), DestinationColor::Nv12);
    }

    #[test]
    fn test_fallback_chain_terminates() {
        // Every chain must reach None in a few steps.
        for codec in [
            VideoCodec::H264,
            VideoCodec::Hevc,
            VideoCodec::HevcHdr,
            VideoCodec::Hevc10Bit,
            VideoCodec::Av1,
            VideoCodec::Av1Hdr,
            VideoCodec::Av110Bit,
            VideoCodec::Vp8,
            VideoCodec::Vp9,
        ] {
            let mut current = Some(codec);
            let mut steps = 0;
            while let Some(c) = current {
                current = c.fallback();
                steps += 1;
                assert!(steps < 5, "fallback loop for {:?}", codec);
            }
        }
    }

    #[test]
    fn test_hdr_falls_back_to_sdr_same_family() {
        assert_eq!(VideoCodec::HevcHdr.fallback(), Some(VideoCodec::Hevc));
        assert_eq!(VideoCodec::Av1Hdr.fallback(), Some(VideoCodec::Av1));
        assert_eq!(VideoCodec::Hevc.fallback(), Some(VideoCodec::H264));
    }

    #[test]
    fn test_amd_hevc_alignment() {
        let mut ctx = CodecContext {
            codec: VideoCodec::Hevc,
            width: 1920,
            height: 1080,
            framerate: 60,
            color_range: ColorRange::Limited,
            time_base: TimeBase::per_frame(60),
        };
        align_dimensions(GpuVendor::Amd, &mut ctx);
        assert_eq!(ctx.width, 1920);
        assert_eq!(ctx.height, 1088);

        ctx.width = 1366;
        ctx.height = 768;
        align_dimensions(GpuVendor::Amd, &mut ctx);
        assert_eq!(ctx.width, 1408);
        assert_eq!(ctx.height, 768);
    }

    #[test]
    fn test_amd_av1_1080_special_case() {
        let mut ctx = CodecContext {
            codec: VideoCodec::Av1,
            width: 1920,
            height: 1080,
            framerate: 60,
            color_range: ColorRange::Limited,
            time_base: TimeBase::per_frame(60),
        };
        align_dimensions(GpuVendor::Amd, &mut ctx);
        // 1080 stays 1080; aligning to 1088 would paint black bars.
        assert_eq!(ctx.height, 1080);

        ctx.height = 1440;
        align_dimensions(GpuVendor::Amd, &mut ctx);
        assert_eq!(ctx.height, 1440);

        ctx.height = 900;
        align_dimensions(GpuVendor::Amd, &mut ctx);
        assert_eq!(ctx.height, 912);
    }

    #[test]
    fn test_other_vendors_not_aligned() {
        let mut ctx = CodecContext {
            codec: VideoCodec::Hevc,
            width: 1366,
            height: 766,
            framerate: 30,
            color_range: ColorRange::Full,
            time_base: TimeBase::per_frame(30),
        };
        align_dimensions(GpuVendor::Nvidia, &mut ctx);
        assert_eq!((ctx.width, ctx.height), (1366, 766));
        align_dimensions(GpuVendor::Intel, &mut ctx);
        assert_eq!((ctx.width, ctx.height), (1366, 766));
    }

    #[test]
    fn test_timebase_rescale() {
        // 30 fps frame index -> microseconds.
        let frame = TimeBase::per_frame(30);
        assert_eq!(frame.rescale(30, TimeBase::MICROSECONDS), 1_000_000);
        assert_eq!(frame.rescale(1, TimeBase::MICROSECONDS), 33_333);

        // Identity.
        assert_eq!(frame.rescale(123, frame), 123);
    }

    #[test]
    fn test_supported_codecs_lookup() {
        let caps = SupportedCodecs {
            h264: true,
            hevc: true,
            ..Default::default()
        };
        assert!(caps.supports(VideoCodec::H264));
        assert!(caps.supports(VideoCodec::Hevc));
        assert!(!caps.supports(VideoCodec::HevcHdr));
        assert!(!caps.supports(VideoCodec::Av1));
    }
}
