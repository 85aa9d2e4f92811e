//! X11 cursor tracking and rendering.
//!
//! The cursor is captured out-of-band through XFixes for every X11 path
//! (including KMS capture, where the hardware cursor plane may belong to a
//! different GPU under PRIME). The bitmap is re-uploaded to its texture
//! only when the XFixes cursor serial changes; position updates are free.

use std::rc::Rc;

use gpurec_color::ColorConversion;
use gpurec_gl::ffi as gl;
use gpurec_gl::{GlRuntime, Rotation};
use tracing::{debug, trace};
use x11_dl::xlib::Xlib;

use crate::error::Result;
use crate::x11ext::XFixes;

/// Cursor state fetched from the X server with a GL texture cache.
pub struct X11CursorTracker {
    runtime: Rc<GlRuntime>,
    xfixes: XFixes,
    texture: u32,

    position: (i32, i32),
    size: (u32, u32),

    /// Serial of the bitmap currently in the texture; uploads happen only
    /// when the server reports a different one.
    uploaded_serial: Option<u64>,

    visible: bool,
}

impl X11CursorTracker {
    pub fn new(runtime: Rc<GlRuntime>) -> Result<Self> {
        let xfixes = XFixes::load(runtime.x11_display())?;
        let texture = runtime.gen_texture();
        runtime.bind_texture(gl::GL_TEXTURE_2D, texture);
        runtime.tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MIN_FILTER, gl::GL_LINEAR);
        runtime.tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MAG_FILTER, gl::GL_LINEAR);
        runtime.tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_WRAP_S, gl::GL_CLAMP_TO_EDGE);
        runtime.tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_WRAP_T, gl::GL_CLAMP_TO_EDGE);
        runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
        Ok(Self {
            runtime,
            xfixes,
            texture,
            position: (0, 0),
            size: (0, 0),
            uploaded_serial: None,
            visible: false,
        })
    }

    /// Poll the server's cursor; upload the bitmap only on serial change.
    pub fn update(&mut self) {
        let display = self.runtime.x11_display();
        let Some(image) = self
            .runtime
            .x11()
            .and_then(|xlib: &Xlib| self.xfixes.cursor_image(display, xlib))
        else {
            self.visible = false;
            return;
        };

        self.position = (image.x, image.y);
        self.visible = image.width > 0 && image.height > 0;

        if self.uploaded_serial == Some(image.serial) {
            trace!("Cursor unchanged (serial {})", image.serial);
            return;
        }

        debug!(
            "Cursor bitmap changed: {}x{} serial {}",
            image.width, image.height, image.serial
        );
        self.size = (image.width, image.height);
        let gl_rt = &self.runtime;
        gl_rt.bind_texture(gl::GL_TEXTURE_2D, self.texture);
        gl_rt.pixel_store_unpack_alignment(1);
        gl_rt.tex_storage_2d(gl::GL_TEXTURE_2D, gl::GL_RGBA, image.width as i32, image.height as i32);
        gl_rt.tex_sub_image_2d(
            gl::GL_TEXTURE_2D,
            0,
            0,
            image.width as i32,
            image.height as i32,
            gl::GL_RGBA,
            gl::GL_UNSIGNED_BYTE,
            &image.pixels,
        );
        gl_rt.pixel_store_unpack_alignment(4);
        gl_rt.bind_texture(gl::GL_TEXTURE_2D, 0);
        self.uploaded_serial = Some(image.serial);
    }

    /// Current hotspot-adjusted position in root coordinates.
    pub fn position(&self) -> (i32, i32) {
        self.position
    }

    pub fn size(&self) -> (u32, u32) {
        self.size
    }

    pub fn visible(&self) -> bool {
        self.visible
    }

    /// Draw the cursor into the destination at `target_pos` (already
    /// translated into capture-target space by the caller).
    pub fn draw(&self, color: &ColorConversion, target_pos: (i32, i32), rotation: Rotation) {
        if !self.visible || self.size.0 == 0 {
            return;
        }
        self.runtime.enable(gl::GL_BLEND);
        self.runtime
            .blend_func(gl::GL_SRC_ALPHA, gl::GL_ONE_MINUS_SRC_ALPHA);
        color.draw(
            self.texture,
            target_pos,
            (self.size.0 as i32, self.size.1 as i32),
            (0, 0),
            (self.size.0 as i32, self.size.1 as i32),
            rotation.radians(),
            false,
        );
        self.runtime.disable(gl::GL_BLEND);
    }
}

impl Drop for X11CursorTracker {
    fn drop(&mut self) {
        self.runtime.delete_texture(self.texture);
    }
}
