//! XComposite window capture.
//!
//! Tracks one window's backing pixmap: `XCompositeNameWindowPixmap` gives a
//! pixmap that survives occlusion, which EGL turns into a texture without
//! copies. Resizes re-acquire the pixmap after a one second quiet period
//! (compositors fire streams of ConfigureNotify during interactive
//! resizing, and each re-acquire stalls the GPU).
//!
//! With `follow_focused` the backend re-targets to whatever window the
//! `_NET_ACTIVE_WINDOW` root property points at.

use std::rc::Rc;
use std::time::{Duration, Instant};

use gpurec_color::{ColorConversion, SourceColor};
use gpurec_encode::CodecContext;
use gpurec_gl::ffi as gl;
use gpurec_gl::GlRuntime;
use gpurec_gl::Rotation;
use tracing::{debug, info, warn};
use x11_dl::xlib::{
    ConfigureNotify, DestroyNotify, Expose, PropertyChangeMask, PropertyNotify,
    StructureNotifyMask, XEvent,
};

use crate::backend::{CaptureBackend, CaptureStatus, StopReason};
use crate::cursor::X11CursorTracker;
use crate::error::{CaptureError, Result};
use crate::x11ext::XComposite;

/// Delay between the last ConfigureNotify and the pixmap re-acquire.
const RESIZE_DEBOUNCE: Duration = Duration::from_secs(1);

/// XComposite capture options.
#[derive(Debug, Clone)]
pub struct XCompositeParams {
    /// Window to capture, or 0 with `follow_focused`.
    pub window: u64,
    pub follow_focused: bool,
    pub record_cursor: bool,
}

/// XComposite window capture backend.
pub struct XCompositeCapture {
    runtime: Rc<GlRuntime>,
    params: XCompositeParams,
    composite: Option<XComposite>,

    window: u64,
    window_size: (i32, i32),
    codec_size: (i32, i32),

    pixmap: u64,
    texture: u32,

    /// Set by ConfigureNotify; consumed by `tick` after the debounce.
    resize_at: Option<Instant>,
    pending_size: (i32, i32),

    net_active_window_atom: u64,
    focus_changed: bool,

    cursor: Option<X11CursorTracker>,
    stop: StopReason,
}

impl XCompositeCapture {
    pub fn new(runtime: Rc<GlRuntime>, params: XCompositeParams) -> Self {
        Self {
            runtime,
            window: params.window,
            params,
            composite: None,
            window_size: (0, 0),
            codec_size: (0, 0),
            pixmap: 0,
            texture: 0,
            resize_at: None,
            pending_size: (0, 0),
            net_active_window_atom: 0,
            focus_changed: false,
            cursor: None,
            stop: StopReason::Continue,
        }
    }

    fn query_window_size(&self, window: u64) -> Result<(i32, i32)> {
        let xlib = self
            .runtime
            .x11()
            .ok_or_else(|| CaptureError::Config("window capture requires X11".into()))?;
        // SAFETY: live display; attributes struct is filled on success.
        unsafe {
            let mut attributes: x11_dl::xlib::XWindowAttributes = std::mem::zeroed();
            if (xlib.XGetWindowAttributes)(self.runtime.x11_display(), window, &mut attributes)
                == 0
            {
                return Err(CaptureError::Fatal(format!(
                    "window {window:#x} does not exist"
                )));
            }
            Ok((attributes.width, attributes.height))
        }
    }

    fn acquire_pixmap(&mut self) -> Result<()> {
        let composite = self
            .composite
            .as_ref()
            .ok_or_else(|| CaptureError::Fatal("XComposite not loaded".into()))?;
        let display = self.runtime.x11_display();

        self.release_pixmap();
        let pixmap = composite.name_window_pixmap(display, self.window);
        if pixmap == 0 {
            return Err(CaptureError::Transient("NameWindowPixmap returned 0".into()));
        }

        let image = self.runtime.create_pixmap_image(pixmap);
        if image.is_null() {
            // SAFETY: pixmap freed through Xlib below.
            if let Some(xlib) = self.runtime.x11() {
                unsafe { (xlib.XFreePixmap)(display, pixmap) };
            }
            return Err(CaptureError::Transient(format!(
                "pixmap EGL import failed (egl 0x{:x})",
                self.runtime.egl_error()
            )));
        }

        if self.texture == 0 {
            self.texture = self.runtime.gen_texture();
        }
        self.runtime.bind_texture(gl::GL_TEXTURE_2D, self.texture);
        self.runtime
            .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MIN_FILTER, gl::GL_LINEAR);
        self.runtime
            .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MAG_FILTER, gl::GL_LINEAR);
        self.runtime.image_target_texture_2d(gl::GL_TEXTURE_2D, image);
        self.runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
        self.runtime.destroy_image(image);

        self.pixmap = pixmap;
        debug!(
            "Acquired pixmap for window {:#x} ({}x{})",
            self.window, self.window_size.0, self.window_size.1
        );
        Ok(())
    }

    fn release_pixmap(&mut self) {
        if self.pixmap != 0 {
            if let Some(xlib) = self.runtime.x11() {
                // SAFETY: pixmap came from NameWindowPixmap on this display.
                unsafe { (xlib.XFreePixmap)(self.runtime.x11_display(), self.pixmap) };
            }
            self.pixmap = 0;
        }
    }

    fn retarget(&mut self, window: u64) {
        if window == 0 || window == self.window {
            return;
        }
        info!("Following focus to window {:#x}", window);
        if let Some(composite) = &self.composite {
            composite.unredirect_window(self.runtime.x11_display(), self.window);
            composite.redirect_window(self.runtime.x11_display(), window);
        }
        self.window = window;
        self.select_window_events();
        match self.query_window_size(window) {
            Ok(size) => {
                self.window_size = size;
                if let Err(e) = self.acquire_pixmap() {
                    warn!("Pixmap acquire after focus change failed: {}", e);
                }
            }
            Err(e) => warn!("Focused window went away: {}", e),
        }
    }

    fn select_window_events(&self) {
        if let Some(xlib) = self.runtime.x11() {
            // SAFETY: live display/window.
            unsafe {
                (xlib.XSelectInput)(
                    self.runtime.x11_display(),
                    self.window,
                    StructureNotifyMask | x11_dl::xlib::ExposureMask,
                );
            }
        }
    }

    fn active_window(&self) -> u64 {
        let Some(xlib) = self.runtime.x11() else {
            return 0;
        };
        if self.net_active_window_atom == 0 {
            return 0;
        }
        let display = self.runtime.x11_display();
        // SAFETY: standard property read, freed with XFree.
        unsafe {
            let root = (xlib.XDefaultRootWindow)(display);
            let mut actual_type = 0;
            let mut actual_format = 0;
            let mut nitems = 0;
            let mut bytes_after = 0;
            let mut prop: *mut u8 = std::ptr::null_mut();
            let status = (xlib.XGetWindowProperty)(
                display,
                root,
                self.net_active_window_atom,
                0,
                1,
                0,
                0, // AnyPropertyType
                &mut actual_type,
                &mut actual_format,
                &mut nitems,
                &mut bytes_after,
                &mut prop,
            );
            if status != 0 || prop.is_null() || nitems == 0 {
                return 0;
            }
            let window = *(prop as *const libc::c_ulong) as u64;
            (xlib.XFree)(prop.cast());
            window
        }
    }
}

impl CaptureBackend for XCompositeCapture {
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()> {
        let composite = XComposite::load(self.runtime.x11_display())?;

        if self.params.follow_focused {
            if let Some(xlib) = self.runtime.x11() {
                // SAFETY: atom interning and root event selection.
                unsafe {
                    let display = self.runtime.x11_display();
                    self.net_active_window_atom =
                        (xlib.XInternAtom)(display, c"_NET_ACTIVE_WINDOW".as_ptr(), 0);
                    let root = (xlib.XDefaultRootWindow)(display);
                    (xlib.XSelectInput)(display, root, PropertyChangeMask);
                }
            }
        }

        composite.redirect_window(self.runtime.x11_display(), self.window);
        self.composite = Some(composite);

        self.window_size = self.query_window_size(self.window)?;
        self.select_window_events();

        // Codecs want even dimensions; the window is drawn at its real
        // size and the odd edge row/column stays black.
        self.codec_size = (
            (self.window_size.0.max(2)) & !1,
            (self.window_size.1.max(2)) & !1,
        );
        ctx.width = self.codec_size.0;
        ctx.height = self.codec_size.1;

        self.acquire_pixmap()?;

        if self.params.record_cursor {
            self.cursor = Some(X11CursorTracker::new(Rc::clone(&self.runtime))?);
        }

        info!(
            "XComposite capture of window {:#x} ({}x{})",
            self.window, self.codec_size.0, self.codec_size.1
        );
        Ok(())
    }

    fn on_event(&mut self, event: &XEvent) {
        // SAFETY: reading the type tag of an XEvent union is always valid.
        let event_type = unsafe { event.type_ };
        match event_type {
            ConfigureNotify => {
                // SAFETY: tag checked.
                let configure = unsafe { event.configure };
                if configure.window == self.window
                    && (configure.width, configure.height) != self.window_size
                {
                    self.pending_size = (configure.width, configure.height);
                    self.resize_at = Some(Instant::now() + RESIZE_DEBOUNCE);
                }
            }
            Expose => {
                // SAFETY: tag checked.
                let expose = unsafe { event.expose };
                if expose.window == self.window && expose.count == 0 {
                    // Content is fresh; nothing to do, the damage tracker
                    // sees the same event.
                }
            }
            DestroyNotify => {
                // SAFETY: tag checked.
                let destroy = unsafe { event.destroy_window };
                if destroy.window == self.window {
                    info!("Captured window destroyed, stopping");
                    self.stop = StopReason::Stop;
                }
            }
            PropertyNotify if self.params.follow_focused => {
                // SAFETY: tag checked.
                let property = unsafe { event.property };
                if property.atom == self.net_active_window_atom {
                    self.focus_changed = true;
                }
            }
            _ => {}
        }
    }

    fn tick(&mut self) {
        if self.focus_changed {
            self.focus_changed = false;
            let active = self.active_window();
            self.retarget(active);
        }

        if let Some(deadline) = self.resize_at {
            if Instant::now() >= deadline {
                self.resize_at = None;
                self.window_size = self.pending_size;
                debug!(
                    "Window resized to {}x{}, re-acquiring pixmap",
                    self.window_size.0, self.window_size.1
                );
                if let Err(e) = self.acquire_pixmap() {
                    warn!("Pixmap re-acquire failed: {}", e);
                }
            }
        }
    }

    fn should_stop(&mut self) -> StopReason {
        self.stop
    }

    fn capture(
        &mut self,
        _frame: &mut gpurec_encode::EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus> {
        if self.pixmap == 0 {
            return Ok(CaptureStatus::Skipped);
        }

        // Clip to whichever is smaller so a grown window does not write
        // outside the destination and a shrunk one leaves the cleared
        // border.
        let draw_size = (
            self.window_size.0.min(self.codec_size.0),
            self.window_size.1.min(self.codec_size.1),
        );
        color.draw(
            self.texture,
            (0, 0),
            draw_size,
            (0, 0),
            draw_size,
            0.0,
            false,
        );

        if let Some(cursor) = self.cursor.as_mut() {
            cursor.update();
            let (root_x, root_y) = cursor.position();
            if let Some((win_x, win_y)) = self.translate_root_to_window(root_x, root_y) {
                cursor.draw(color, (win_x, win_y), Rotation::R0);
            }
        }

        Ok(CaptureStatus::Captured)
    }

    fn source_color(&self) -> SourceColor {
        SourceColor::Rgb
    }

    fn window_id(&self) -> u64 {
        self.window
    }
}

impl XCompositeCapture {
    fn translate_root_to_window(&self, root_x: i32, root_y: i32) -> Option<(i32, i32)> {
        let xlib = self.runtime.x11()?;
        let display = self.runtime.x11_display();
        // SAFETY: live display and windows; out-params local.
        unsafe {
            let root = (xlib.XDefaultRootWindow)(display);
            let (mut x, mut y) = (0, 0);
            let mut child = 0;
            if (xlib.XTranslateCoordinates)(
                display,
                root,
                self.window,
                root_x,
                root_y,
                &mut x,
                &mut y,
                &mut child,
            ) == 0
            {
                return None;
            }
            Some((x, y))
        }
    }
}

impl Drop for XCompositeCapture {
    fn drop(&mut self) {
        self.release_pixmap();
        if let Some(composite) = &self.composite {
            composite.unredirect_window(self.runtime.x11_display(), self.window);
        }
        if self.texture != 0 {
            self.runtime.delete_texture(self.texture);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codec_size_is_even() {
        // The start() rounding rule, checked in isolation.
        let odd = (1365i32, 767i32);
        let rounded = ((odd.0.max(2)) & !1, (odd.1.max(2)) & !1);
        assert_eq!(rounded, (1364, 766));

        let tiny = (1i32, 1i32);
        let rounded = ((tiny.0.max(2)) & !1, (tiny.1.max(2)) & !1);
        assert_eq!(rounded, (2, 2));
    }

    #[test]
    fn test_resize_debounce_window() {
        assert_eq!(RESIZE_DEBOUNCE, Duration::from_secs(1));
    }
}
