//! Software destination-surface adapter.
//!
//! The fallback when no hardware encoder is usable: the color engine still
//! converts on the GPU, then `copy_textures_to_frame` reads both planes
//! back with `glGetTexImage` into pitch-aligned CPU buffers the software
//! encoder consumes in place. The one CPU round-trip in the pipeline, by
//! design of this adapter only.

use std::rc::Rc;

use gpurec_color::{ColorDepth, DestinationColor};
use gpurec_gl::ffi as gl;
use gpurec_gl::GlRuntime;
use tracing::debug;

use crate::codec::{CodecContext, SupportedCodecs};
use crate::error::{EncodeError, Result};
use crate::frame::{CpuPlane, EncodeFrame, FrameStorage};

/// Row pitch alignment for the CPU planes.
const PLANE_PITCH_ALIGNMENT: usize = 4;

fn align_pitch(bytes: usize) -> usize {
    (bytes + PLANE_PITCH_ALIGNMENT - 1) / PLANE_PITCH_ALIGNMENT * PLANE_PITCH_ALIGNMENT
}

/// Software (CPU) destination-surface adapter.
pub struct SoftwareEncoder {
    runtime: Rc<GlRuntime>,
    textures: [u32; 2],
    destination: DestinationColor,
    width: i32,
    height: i32,
}

impl SoftwareEncoder {
    pub fn new(runtime: Rc<GlRuntime>) -> Self {
        Self {
            runtime,
            textures: [0; 2],
            destination: DestinationColor::Nv12,
            width: 0,
            height: 0,
        }
    }

    pub fn supported_codecs(&mut self, _cleanup: bool) -> SupportedCodecs {
        // Software encoding supports everything in principle; in practice
        // the session only offers H.264 and the VP codecs here because the
        // rest are unusably slow on a CPU at capture rates.
        SupportedCodecs {
            h264: true,
            hevc: false,
            hevc_hdr: false,
            hevc_10bit: false,
            av1: false,
            av1_hdr: false,
            av1_10bit: false,
            vp8: true,
            vp9: true,
        }
    }

    pub fn start(&mut self, ctx: &mut CodecContext) -> Result<EncodeFrame> {
        let depth = ctx.codec.depth();
        self.destination = ctx.codec.destination_color();
        self.width = ctx.width;
        self.height = ctx.height;

        let (y_format, uv_format) = match depth {
            ColorDepth::Bits8 => (gl::GL_R8, gl::GL_RG8),
            ColorDepth::Bits10 => (gl::GL_R16, gl::GL_RG16),
        };
        let sizes = [
            (self.width, self.height, y_format),
            (self.width / 2, self.height / 2, uv_format),
        ];
        for (i, (w, h, format)) in sizes.into_iter().enumerate() {
            let texture = self.runtime.gen_texture();
            self.runtime.bind_texture(gl::GL_TEXTURE_2D, texture);
            self.runtime.tex_storage_2d(gl::GL_TEXTURE_2D, format, w, h);
            self.runtime
                .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MIN_FILTER, gl::GL_NEAREST);
            self.runtime
                .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MAG_FILTER, gl::GL_NEAREST);
            let error = self.runtime.gl_error();
            self.runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
            if error != gl::GL_NO_ERROR {
                self.runtime.delete_texture(texture);
                return Err(EncodeError::TextureAllocation(format!(
                    "plane {i} (GL error 0x{error:x})"
                )));
            }
            self.textures[i] = texture;
        }

        let bytes_per_component = match depth {
            ColorDepth::Bits8 => 1,
            ColorDepth::Bits10 => 2,
        };
        let y_pitch = align_pitch(self.width as usize * bytes_per_component);
        let uv_pitch = align_pitch(self.width as usize * bytes_per_component);
        debug!(
            "Software adapter: {}x{} pitches {}/{}",
            self.width, self.height, y_pitch, uv_pitch
        );

        Ok(EncodeFrame {
            width: ctx.width,
            height: ctx.height,
            destination: self.destination,
            storage: FrameStorage::Cpu {
                planes: [
                    CpuPlane {
                        data: vec![0; y_pitch * self.height as usize],
                        pitch: y_pitch,
                    },
                    CpuPlane {
                        data: vec![0; uv_pitch * (self.height as usize / 2)],
                        pitch: uv_pitch,
                    },
                ],
            },
        })
    }

    /// Read both planes back from the GPU into the frame's CPU buffers.
    pub fn copy_textures_to_frame(&mut self, frame: &mut EncodeFrame) -> Result<()> {
        let FrameStorage::Cpu { planes } = &mut frame.storage else {
            return Err(EncodeError::StorageMismatch { expected: "cpu" });
        };

        let (formats, ty) = match self.destination {
            DestinationColor::Nv12 => ([gl::GL_RED, gl::GL_RG], gl::GL_UNSIGNED_BYTE),
            DestinationColor::P010 => ([gl::GL_RED, gl::GL_RG], gl::GL_UNSIGNED_SHORT),
        };

        self.runtime
            .pixel_store_pack_alignment(PLANE_PITCH_ALIGNMENT as i32);
        for (i, plane) in planes.iter_mut().enumerate() {
            self.runtime.bind_texture(gl::GL_TEXTURE_2D, self.textures[i]);
            self.runtime
                .get_tex_image(gl::GL_TEXTURE_2D, formats[i], ty, &mut plane.data);
        }
        self.runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
        Ok(())
    }

    pub fn textures(&self) -> ([u32; 2], DestinationColor) {
        (self.textures, self.destination)
    }
}

impl Drop for SoftwareEncoder {
    fn drop(&mut self) {
        for texture in self.textures {
            if texture != 0 {
                self.runtime.delete_texture(texture);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pitch_alignment() {
        assert_eq!(align_pitch(1920), 1920);
        assert_eq!(align_pitch(1919), 1920);
        assert_eq!(align_pitch(1), 4);
        assert_eq!(align_pitch(0), 0);
    }
}
