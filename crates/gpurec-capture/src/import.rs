//! The DMA-BUF import ladder shared by every backend.
//!
//! Importing a captured frame into GL has two failure-prone steps, each
//! with a one-way fallback that latches for the rest of the session:
//!
//! 1. `eglCreateImage` **with** explicit format modifiers. Some driver
//!    combinations reject that; after the first failure all imports retry
//!    without modifier attributes.
//! 2. Binding the image to a standard 2D texture. Tiled or vendor-specific
//!    layouts may only bind as OES-external textures, which need the
//!    external shader variants; after the first bind failure the external
//!    path is used for the rest of the session.
//!
//! A third latch records the AMD VAAPI direct-blit fast path failing, after
//! which every frame takes the GL shader path. The latches only ever go
//! one way; there is no probing back.

use std::rc::Rc;

use gpurec_gl::ffi::{self, EglImage, GlUint};
use gpurec_gl::GlRuntime;
use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::frame::FrameDescriptor;

/// Session-wide import fallbacks. See the module docs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ImportLadder {
    no_modifiers_fallback: bool,
    external_texture_fallback: bool,
    fast_path_failed: bool,
}

/// A successfully imported and bound frame.
///
/// The EGL image is destroyed on drop; per the frame lifecycle it must not
/// outlive the next capture.
pub struct BoundImage {
    runtime: Rc<GlRuntime>,
    image: EglImage,

    /// The texture the image was bound to.
    pub texture: GlUint,

    /// True when bound to the OES-external target (external shaders
    /// required).
    pub external: bool,
}

impl Drop for BoundImage {
    fn drop(&mut self) {
        self.runtime.destroy_image(self.image);
    }
}

impl ImportLadder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether imports currently use OES-external binding.
    pub fn uses_external_texture(&self) -> bool {
        self.external_texture_fallback
    }

    /// Whether the VAAPI direct blit is still worth attempting.
    pub fn fast_path_available(&self) -> bool {
        !self.fast_path_failed
    }

    /// Record a fast-path failure; the GL path is used from now on.
    pub fn latch_fast_path_failed(&mut self) {
        if !self.fast_path_failed {
            warn!("VAAPI direct blit failed, falling back to shader conversion permanently");
            self.fast_path_failed = true;
        }
    }

    /// Import `frame`'s planes as an EGL image and bind it to one of the
    /// two provided textures according to the current fallback state.
    ///
    /// Consumes the descriptor's planes; their FDs close when the returned
    /// guard drops (EGL holds its own references once the image exists).
    pub fn import_and_bind(
        &mut self,
        runtime: &Rc<GlRuntime>,
        frame: &mut FrameDescriptor,
        texture_2d: GlUint,
        texture_external: GlUint,
    ) -> Result<BoundImage> {
        let planes = frame.take_planes();
        if planes.is_empty() {
            return Err(CaptureError::Transient("frame has no planes".into()));
        }

        let with_modifiers = frame.has_modifier() && !self.no_modifiers_fallback;
        let mut image = create_image(runtime, frame, &planes, with_modifiers);
        if image.is_null() && with_modifiers {
            warn!(
                "DMA-BUF import with modifiers failed (egl 0x{:x}); retrying without for the rest of the session",
                runtime.egl_error()
            );
            self.no_modifiers_fallback = true;
            image = create_image(runtime, frame, &planes, false);
        }
        if image.is_null() {
            return Err(CaptureError::Transient(format!(
                "eglCreateImage failed (egl 0x{:x})",
                runtime.egl_error()
            )));
        }

        // Plane FDs stay open in `planes` until the end of this function;
        // EGL has taken its references by then.
        let bound = self.bind(runtime, image, texture_2d, texture_external);
        drop(planes);
        bound
    }

    fn bind(
        &mut self,
        runtime: &Rc<GlRuntime>,
        image: EglImage,
        texture_2d: GlUint,
        texture_external: GlUint,
    ) -> Result<BoundImage> {
        if !self.external_texture_fallback {
            if bind_to(runtime, image, ffi::GL_TEXTURE_2D, texture_2d) {
                return Ok(BoundImage {
                    runtime: Rc::clone(runtime),
                    image,
                    texture: texture_2d,
                    external: false,
                });
            }
            warn!("2D texture bind rejected; using OES-external textures for the rest of the session");
            self.external_texture_fallback = true;
        }

        if bind_to(runtime, image, ffi::GL_TEXTURE_EXTERNAL_OES, texture_external) {
            return Ok(BoundImage {
                runtime: Rc::clone(runtime),
                image,
                texture: texture_external,
                external: true,
            });
        }

        runtime.destroy_image(image);
        Err(CaptureError::Transient(format!(
            "binding EGL image failed on both targets (gl 0x{:x})",
            runtime.gl_error()
        )))
    }
}

fn bind_to(runtime: &GlRuntime, image: EglImage, target: u32, texture: GlUint) -> bool {
    // Drain stale error state so the check below sees only this bind.
    while runtime.gl_error() != ffi::GL_NO_ERROR {}

    runtime.bind_texture(target, texture);
    runtime.image_target_texture_2d(target, image);
    let ok = runtime.gl_error() == ffi::GL_NO_ERROR;
    runtime.bind_texture(target, 0);
    ok
}

fn create_image(
    runtime: &GlRuntime,
    frame: &FrameDescriptor,
    planes: &[crate::frame::DmaBufPlane],
    with_modifiers: bool,
) -> EglImage {
    const FD_ATTRS: [i32; 4] = [
        ffi::EGL_DMA_BUF_PLANE0_FD_EXT,
        ffi::EGL_DMA_BUF_PLANE1_FD_EXT,
        ffi::EGL_DMA_BUF_PLANE2_FD_EXT,
        ffi::EGL_DMA_BUF_PLANE3_FD_EXT,
    ];
    const OFFSET_ATTRS: [i32; 4] = [
        ffi::EGL_DMA_BUF_PLANE0_OFFSET_EXT,
        ffi::EGL_DMA_BUF_PLANE1_OFFSET_EXT,
        ffi::EGL_DMA_BUF_PLANE2_OFFSET_EXT,
        ffi::EGL_DMA_BUF_PLANE3_OFFSET_EXT,
    ];
    const PITCH_ATTRS: [i32; 4] = [
        ffi::EGL_DMA_BUF_PLANE0_PITCH_EXT,
        ffi::EGL_DMA_BUF_PLANE1_PITCH_EXT,
        ffi::EGL_DMA_BUF_PLANE2_PITCH_EXT,
        ffi::EGL_DMA_BUF_PLANE3_PITCH_EXT,
    ];
    const MODIFIER_LO_ATTRS: [i32; 4] = [
        ffi::EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
        ffi::EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT,
        ffi::EGL_DMA_BUF_PLANE2_MODIFIER_LO_EXT,
        ffi::EGL_DMA_BUF_PLANE3_MODIFIER_LO_EXT,
    ];
    const MODIFIER_HI_ATTRS: [i32; 4] = [
        ffi::EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT,
        ffi::EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT,
        ffi::EGL_DMA_BUF_PLANE2_MODIFIER_HI_EXT,
        ffi::EGL_DMA_BUF_PLANE3_MODIFIER_HI_EXT,
    ];

    let mut attribs: Vec<isize> = Vec::with_capacity(7 + planes.len() * 10);
    attribs.extend_from_slice(&[
        ffi::EGL_LINUX_DRM_FOURCC_EXT as isize,
        frame.fourcc as isize,
        ffi::EGL_WIDTH as isize,
        frame.width as isize,
        ffi::EGL_HEIGHT as isize,
        frame.height as isize,
    ]);
    for (i, plane) in planes.iter().enumerate().take(4) {
        attribs.extend_from_slice(&[
            FD_ATTRS[i] as isize,
            plane.raw_fd() as isize,
            OFFSET_ATTRS[i] as isize,
            plane.offset as isize,
            PITCH_ATTRS[i] as isize,
            plane.pitch as isize,
        ]);
        if with_modifiers {
            attribs.extend_from_slice(&[
                MODIFIER_LO_ATTRS[i] as isize,
                (frame.modifier & 0xFFFF_FFFF) as isize,
                MODIFIER_HI_ATTRS[i] as isize,
                (frame.modifier >> 32) as isize,
            ]);
        }
    }
    attribs.push(ffi::EGL_NONE as isize);

    debug!(
        "Importing {}x{} fourcc {:#x}, {} plane(s), modifiers={}",
        frame.width,
        frame.height,
        frame.fourcc,
        planes.len(),
        with_modifiers
    );
    runtime.create_dmabuf_image(&attribs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ladder_defaults() {
        let ladder = ImportLadder::new();
        assert!(!ladder.uses_external_texture());
        assert!(ladder.fast_path_available());
    }

    #[test]
    fn test_fast_path_latch_is_permanent() {
        let mut ladder = ImportLadder::new();
        ladder.latch_fast_path_failed();
        assert!(!ladder.fast_path_available());
        // Latching again changes nothing and must not panic.
        ladder.latch_fast_path_failed();
        assert!(!ladder.fast_path_available());
    }
}
