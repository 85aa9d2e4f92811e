//! XDG desktop portal capture (Wayland).
//!
//! The D-Bus side is one blocking handshake at session start: open a
//! screencast session, let the user pick a source, and come away with a
//! PipeWire fd + node id. Everything per-frame happens on the PipeWire
//! loop thread ([`crate::pipewire_stream`]); this backend just takes the
//! latched frame under its mutex and runs the usual import-and-draw.
//!
//! The portal restore token is persisted under
//! `$XDG_CONFIG_HOME/gpurec/restore_token` so the next session can skip
//! the source-picker dialog.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;

use ashpd::desktop::screencast::{CursorMode, Screencast, SourceType};
use ashpd::desktop::PersistMode;
use gpurec_color::{ColorConversion, SourceColor};
use gpurec_encode::{CodecContext, EncodeFrame};
use gpurec_gl::ffi as gl;
use gpurec_gl::GlRuntime;
use tracing::{debug, info, warn};

use crate::backend::{CaptureBackend, CaptureStatus, StopReason};
use crate::error::{CaptureError, Result};
use crate::frame::FrameDescriptor;
use crate::import::ImportLadder;
use crate::pipewire_stream::{CursorState, PwStreamThread};

/// How long the first format negotiation may take before startup fails.
const NEGOTIATION_TIMEOUT: Duration = Duration::from_secs(5);

/// Portal capture options.
#[derive(Debug, Clone)]
pub struct PortalParams {
    pub record_cursor: bool,
    /// Re-use the last session's source without showing the picker.
    pub restore_session: bool,
    /// Override for the restore token path.
    pub restore_token_path: Option<PathBuf>,
}

/// Portal/PipeWire capture backend.
pub struct PortalCapture {
    runtime: Rc<GlRuntime>,
    params: PortalParams,
    stream: Option<PwStreamThread>,
    ladder: ImportLadder,

    texture_2d: u32,
    texture_external: u32,
    cursor_texture: u32,
    cursor_serial: u64,
    cursor_size: (u32, u32),

    capture_size: (u32, u32),
    damaged: bool,
}

struct PortalSession {
    pipewire_fd: OwnedFd,
    node_id: u32,
    size: (u32, u32),
    restore_token: Option<String>,
}

impl PortalCapture {
    pub fn new(runtime: Rc<GlRuntime>, params: PortalParams) -> Self {
        Self {
            runtime,
            params,
            stream: None,
            ladder: ImportLadder::new(),
            texture_2d: 0,
            texture_external: 0,
            cursor_texture: 0,
            cursor_serial: 0,
            cursor_size: (0, 0),
            capture_size: (0, 0),
            damaged: true,
        }
    }

    fn token_path(&self) -> PathBuf {
        if let Some(path) = &self.params.restore_token_path {
            return path.clone();
        }
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                let home = std::env::var_os("HOME").unwrap_or_else(|| "/tmp".into());
                PathBuf::from(home).join(".config")
            });
        base.join("gpurec").join("restore_token")
    }

    fn load_restore_token(&self) -> Option<String> {
        if !self.params.restore_session {
            return None;
        }
        let token = std::fs::read_to_string(self.token_path()).ok()?;
        let token = token.trim().to_string();
        (!token.is_empty()).then_some(token)
    }

    fn save_restore_token(&self, token: &Option<String>) {
        let Some(token) = token else { return };
        let path = self.token_path();
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::write(&path, token) {
            warn!("Failed to persist portal restore token: {}", e);
        } else {
            debug!("Portal restore token saved to {}", path.display());
        }
    }

    /// The blocking D-Bus handshake, executed once at session start on a
    /// private tokio runtime.
    fn open_session(&self) -> Result<PortalSession> {
        let restore_token = self.load_restore_token();
        let cursor_mode = if self.params.record_cursor {
            // The cursor arrives as stream metadata and is rendered by us,
            // so it can be toggled and positioned independently.
            CursorMode::Metadata
        } else {
            CursorMode::Hidden
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| CaptureError::Fatal(format!("tokio runtime: {e}")))?;

        runtime.block_on(async move {
            let proxy = Screencast::new()
                .await
                .map_err(|e| CaptureError::Fatal(format!("screencast portal: {e}")))?;
            let session = proxy
                .create_session()
                .await
                .map_err(|e| CaptureError::Fatal(format!("portal session: {e}")))?;

            proxy
                .select_sources(
                    &session,
                    cursor_mode.into(),
                    SourceType::Monitor | SourceType::Window | SourceType::Virtual,
                    false,
                    restore_token.as_deref(),
                    PersistMode::ExplicitlyRevoked,
                )
                .await
                .map_err(|e| CaptureError::Fatal(format!("select_sources: {e}")))?
                .response()
                .map_err(|e| CaptureError::Fatal(format!("select_sources response: {e}")))?;

            let response = proxy
                .start(&session, None)
                .await
                .map_err(|e| CaptureError::Fatal(format!("portal start: {e}")))?
                .response()
                .map_err(|e| CaptureError::Fatal(format!("portal start response: {e}")))?;

            let stream = response
                .streams()
                .first()
                .ok_or_else(|| {
                    CaptureError::Fatal("portal returned no streams (denied?)".into())
                })?;
            let node_id = stream.pipe_wire_node_id();
            let size = stream
                .size()
                .map(|(w, h)| (w.max(0) as u32, h.max(0) as u32))
                .unwrap_or((0, 0));
            let restore_token = response.restore_token().map(str::to_string);

            let fd = proxy
                .open_pipe_wire_remote(&session)
                .await
                .map_err(|e| CaptureError::Fatal(format!("open_pipe_wire_remote: {e}")))?;

            info!(
                "Portal session: node {} ({}x{}), restore token {}",
                node_id,
                size.0,
                size.1,
                if restore_token.is_some() { "yes" } else { "no" }
            );
            Ok(PortalSession {
                pipewire_fd: fd.into(),
                node_id,
                size,
                restore_token,
            })
        })
    }

    fn create_input_texture(&self, target: u32) -> u32 {
        let texture = self.runtime.gen_texture();
        self.runtime.bind_texture(target, texture);
        self.runtime
            .tex_parameter_i(target, gl::GL_TEXTURE_MIN_FILTER, gl::GL_LINEAR);
        self.runtime
            .tex_parameter_i(target, gl::GL_TEXTURE_MAG_FILTER, gl::GL_LINEAR);
        self.runtime.bind_texture(target, 0);
        texture
    }

    fn upload_cursor(&mut self, cursor: &mut CursorState) {
        let Some(bitmap) = cursor.bitmap.take() else {
            return;
        };
        if cursor.serial == self.cursor_serial && self.cursor_size == cursor.size {
            return;
        }
        if self.cursor_texture == 0 {
            self.cursor_texture = self.create_input_texture(gl::GL_TEXTURE_2D);
        }
        self.runtime.bind_texture(gl::GL_TEXTURE_2D, self.cursor_texture);
        self.runtime.pixel_store_unpack_alignment(1);
        self.runtime.tex_storage_2d(
            gl::GL_TEXTURE_2D,
            gl::GL_RGBA,
            cursor.size.0 as i32,
            cursor.size.1 as i32,
        );
        self.runtime.tex_sub_image_2d(
            gl::GL_TEXTURE_2D,
            0,
            0,
            cursor.size.0 as i32,
            cursor.size.1 as i32,
            gl::GL_BGRA,
            gl::GL_UNSIGNED_BYTE,
            &bitmap,
        );
        self.runtime.pixel_store_unpack_alignment(4);
        self.runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
        self.cursor_serial = cursor.serial;
        self.cursor_size = cursor.size;
    }
}

impl CaptureBackend for PortalCapture {
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()> {
        let session = self.open_session()?;
        self.save_restore_token(&session.restore_token);

        let stream = PwStreamThread::spawn(session.pipewire_fd, session.node_id);
        let negotiated = stream
            .state()
            .wait_negotiated(NEGOTIATION_TIMEOUT)
            .ok_or_else(|| {
                CaptureError::Fatal(format!(
                    "PipeWire stream did not negotiate within {} seconds",
                    NEGOTIATION_TIMEOUT.as_secs()
                ))
            })?;
        self.stream = Some(stream);

        self.capture_size = if negotiated.width > 0 {
            (negotiated.width, negotiated.height)
        } else {
            session.size
        };
        if self.capture_size.0 == 0 || self.capture_size.1 == 0 {
            return Err(CaptureError::Fatal("portal stream has no dimensions".into()));
        }
        ctx.width = (self.capture_size.0.max(2) & !1) as i32;
        ctx.height = (self.capture_size.1.max(2) & !1) as i32;

        self.texture_2d = self.create_input_texture(gl::GL_TEXTURE_2D);
        self.texture_external = self.create_input_texture(gl::GL_TEXTURE_EXTERNAL_OES);
        Ok(())
    }

    fn should_stop(&mut self) -> StopReason {
        let Some(stream) = &self.stream else {
            return StopReason::StopWithError;
        };
        if stream.state().error.lock().is_some() {
            return StopReason::StopWithError;
        }
        StopReason::Continue
    }

    fn capture(
        &mut self,
        frame: &mut EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus> {
        let Some(stream) = &self.stream else {
            return Ok(CaptureStatus::Skipped);
        };
        let state = stream.state();

        // Take the latched frame; the loop thread will latch a fresh one.
        // A renegotiating stream simply has nothing latched for a while.
        let Some(mut latched) = state.frame.lock().take() else {
            return Ok(CaptureStatus::Skipped);
        };
        self.damaged = self.damaged || latched.damaged;

        let (crop_pos, crop_size) = match latched.crop {
            Some(crop) => (
                (crop.x, crop.y),
                (crop.width as i32, crop.height as i32),
            ),
            None => ((0, 0), (latched.width as i32, latched.height as i32)),
        };

        let mut descriptor = FrameDescriptor {
            width: latched.width,
            height: latched.height,
            fourcc: latched.fourcc,
            modifier: latched.modifier,
            rotation: gpurec_gl::Rotation::R0,
            source_color: SourceColor::Rgb,
            planes: latched.planes.drain(..).collect(),
            cursor: None,
            hdr: None,
        };

        let bound = match self.ladder.import_and_bind(
            &self.runtime,
            &mut descriptor,
            self.texture_2d,
            self.texture_external,
        ) {
            Ok(bound) => bound,
            Err(e) if e.is_transient() => {
                // Ask the loop thread to drop modifiers from the format and
                // skip this frame. The retry happens even when the failure
                // was something other than a modifier problem.
                warn!("Buffer import failed ({}); requesting renegotiation", e);
                state
                    .renegotiate_without_modifiers
                    .store(true, std::sync::atomic::Ordering::SeqCst);
                return Ok(CaptureStatus::Skipped);
            }
            Err(e) => return Err(e),
        };

        color.draw(
            bound.texture,
            (0, 0),
            (frame.width, frame.height),
            crop_pos,
            crop_size,
            0.0,
            bound.external,
        );
        drop(bound);

        if self.params.record_cursor {
            let mut cursor = state.cursor.lock().clone();
            self.upload_cursor(&mut cursor);
            if cursor.visible && self.cursor_texture != 0 && self.cursor_size.0 > 0 {
                self.runtime.enable(gl::GL_BLEND);
                self.runtime
                    .blend_func(gl::GL_SRC_ALPHA, gl::GL_ONE_MINUS_SRC_ALPHA);
                color.draw(
                    self.cursor_texture,
                    (
                        cursor.position.0 - cursor.hotspot.0,
                        cursor.position.1 - cursor.hotspot.1,
                    ),
                    (self.cursor_size.0 as i32, self.cursor_size.1 as i32),
                    (0, 0),
                    (self.cursor_size.0 as i32, self.cursor_size.1 as i32),
                    0.0,
                    false,
                );
                self.runtime.disable(gl::GL_BLEND);
            }
        }

        Ok(CaptureStatus::Captured)
    }

    fn source_color(&self) -> SourceColor {
        SourceColor::Rgb
    }

    fn uses_external_image(&self) -> bool {
        true
    }

    fn is_damaged(&self) -> Option<bool> {
        Some(self.damaged)
    }

    fn clear_damage(&mut self) {
        self.damaged = false;
        if let Some(stream) = &self.stream {
            if let Some(frame) = stream.state().frame.lock().as_mut() {
                frame.damaged = false;
            }
        }
    }
}

impl Drop for PortalCapture {
    fn drop(&mut self) {
        for texture in [self.texture_2d, self.texture_external, self.cursor_texture] {
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
    fn test_token_path_override() {
        let capture_params = PortalParams {
            record_cursor: false,
            restore_session: true,
            restore_token_path: Some(PathBuf::from("/tmp/gpurec-test-token")),
        };
        // Only the pure path logic is testable without a portal.
        assert_eq!(
            capture_params.restore_token_path.as_deref(),
            Some(std::path::Path::new("/tmp/gpurec-test-token"))
        );
    }

    #[test]
    fn test_negotiation_timeout_is_five_seconds() {
        assert_eq!(NEGOTIATION_TIMEOUT, Duration::from_secs(5));
    }
}
