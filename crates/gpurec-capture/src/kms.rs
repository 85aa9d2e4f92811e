//! KMS plane capture through the privileged broker.
//!
//! Every frame asks the broker for the current scanout planes and imports
//! the one driving the chosen monitor (matched by DRM connector id). When
//! no plane matches - some compositors scan every monitor out of one
//! combined plane - the largest non-cursor plane is captured instead and
//! the monitor's source rectangle selects the region.
//!
//! On AMD with a VAAPI encoder and no rotation, the frame skips GL
//! entirely: the plane's DMA-BUF is imported as a VAAPI surface and
//! vpp-blitted into the encoder surface. First failure latches that path
//! off for the session.

use std::rc::Rc;

use gpurec_color::{ColorConversion, SourceColor};
use gpurec_encode::{CodecContext, EncodeFrame, FastPathSource, VaapiFastPath};
use gpurec_gl::ffi as gl;
use gpurec_gl::{DisplayServer, GlRuntime, GpuVendor, Rotation};
use gpurec_kms::{BrokerClient, HdrOutputMetadata, KmsError, ResponseItem};
use tracing::{debug, info, warn};

use crate::backend::{CaptureBackend, CaptureStatus};
use crate::cursor::X11CursorTracker;
use crate::error::{CaptureError, Result};
use crate::frame::{DmaBufPlane, FrameDescriptor};
use crate::import::ImportLadder;

/// KMS capture options.
#[derive(Debug, Clone)]
pub struct KmsCaptureParams {
    /// Connector name ("DP-1") or "screen" for the first monitor.
    pub monitor: String,
    pub record_cursor: bool,
    pub hdr: bool,
}

#[derive(Debug, Clone, Copy)]
struct MonitorTarget {
    connector_id: u32,
    position: (i32, i32),
    size: (u32, u32),
    rotation: Rotation,
}

/// KMS plane capture backend.
pub struct KmsCapture {
    runtime: Rc<GlRuntime>,
    params: KmsCaptureParams,
    broker: Option<BrokerClient>,
    target: Option<MonitorTarget>,
    ladder: ImportLadder,
    fast_path: Option<VaapiFastPath>,

    texture_2d: u32,
    texture_external: u32,
    cursor_texture_2d: u32,
    cursor_texture_external: u32,

    x11_cursor: Option<X11CursorTracker>,
    hdr_metadata: Option<HdrOutputMetadata>,

    transient_warned: bool,
}

impl KmsCapture {
    pub fn new(
        runtime: Rc<GlRuntime>,
        params: KmsCaptureParams,
        fast_path: Option<VaapiFastPath>,
    ) -> Self {
        Self {
            runtime,
            params,
            broker: None,
            target: None,
            ladder: ImportLadder::new(),
            fast_path,
            texture_2d: 0,
            texture_external: 0,
            cursor_texture_2d: 0,
            cursor_texture_external: 0,
            x11_cursor: None,
            hdr_metadata: None,
            transient_warned: false,
        }
    }

    /// Install the VAAPI direct-blit handle once the encoder adapter has
    /// its display open. Only meaningful on AMD.
    pub fn set_fast_path(&mut self, fast_path: Option<VaapiFastPath>) {
        self.fast_path = fast_path;
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

    fn resolve_target(&self) -> Result<MonitorTarget> {
        let monitors = self.runtime.monitors();
        let monitor = if self.params.monitor == "screen" {
            monitors.first()
        } else {
            monitors.iter().find(|m| m.name == self.params.monitor)
        };
        let monitor = monitor.ok_or_else(|| {
            CaptureError::Fatal(format!("monitor '{}' not found", self.params.monitor))
        })?;
        Ok(MonitorTarget {
            connector_id: monitor.connector_id,
            position: monitor.position,
            size: monitor.size,
            rotation: monitor.rotation,
        })
    }

    fn get_planes(&mut self) -> Result<gpurec_kms::Response> {
        let broker = self
            .broker
            .as_mut()
            .ok_or_else(|| CaptureError::Fatal("broker not started".into()))?;
        match broker.get_kms() {
            Ok(response) => {
                self.transient_warned = false;
                Ok(response)
            }
            // A mismatched helper is an installation problem, not a
            // runtime one; surfaces as the unsupported-config exit code.
            Err(KmsError::ProtocolMismatch { ours, theirs }) => Err(CaptureError::Config(format!(
                "KMS broker protocol mismatch (ours {ours}, theirs {theirs}) - is an old gpurec-kms-broker on $PATH?"
            ))),
            Err(KmsError::Broker { result, message }) => {
                if !self.transient_warned {
                    warn!("KMS broker returned no planes ({:?}): {}", result, message);
                    self.transient_warned = true;
                }
                Err(CaptureError::Transient(message))
            }
            Err(e @ KmsError::BrokerDied) => Err(CaptureError::Fatal(e.to_string())),
            Err(e) => Err(CaptureError::Transient(e.to_string())),
        }
    }

    /// Pick the plane for the target: connector match first, then the
    /// largest non-cursor plane (combined-plane mode).
    fn select_item<'r>(
        &self,
        response: &'r gpurec_kms::Response,
        target: &MonitorTarget,
    ) -> Option<(&'r ResponseItem, bool)> {
        if let Some(item) = response
            .items
            .iter()
            .find(|item| !item.is_cursor && item.connector_id == target.connector_id)
        {
            return Some((item, false));
        }
        response
            .items
            .iter()
            .filter(|item| !item.is_cursor)
            .max_by_key(|item| u64::from(item.width) * u64::from(item.height))
            .map(|item| (item, true))
    }

    fn descriptor_from_item(item: &mut ResponseItem, rotation: Rotation) -> FrameDescriptor {
        let planes = item
            .bufs
            .drain(..)
            .filter_map(|buf| buf.fd.map(|fd| DmaBufPlane::new(fd, buf.offset, buf.pitch)))
            .collect();
        FrameDescriptor {
            width: item.width,
            height: item.height,
            fourcc: item.pixel_format,
            modifier: item.modifier,
            rotation,
            source_color: SourceColor::Rgb,
            planes,
            cursor: None,
            hdr: item.hdr_metadata,
        }
    }

    fn try_fast_path(&mut self, frame: &EncodeFrame, descriptor: &FrameDescriptor) -> bool {
        if self.runtime.gpu_info().vendor != GpuVendor::Amd
            || !self.ladder.fast_path_available()
            || descriptor.rotation != Rotation::R0
        {
            return false;
        }
        let Some(fast_path) = &self.fast_path else {
            return false;
        };

        let fds: Vec<_> = descriptor.planes.iter().map(|p| p.borrowed_fd()).collect();
        let offsets: Vec<u32> = descriptor.planes.iter().map(|p| p.offset).collect();
        let pitches: Vec<u32> = descriptor.planes.iter().map(|p| p.pitch).collect();
        let source = FastPathSource {
            fds: &fds,
            offsets: &offsets,
            pitches: &pitches,
            modifier: descriptor.modifier,
            fourcc: descriptor.fourcc,
            width: descriptor.width,
            height: descriptor.height,
        };
        match fast_path.copy_drm_planes_to_surface(frame, &source) {
            Ok(()) => true,
            Err(e) => {
                warn!("VAAPI direct blit failed: {}", e);
                self.ladder.latch_fast_path_failed();
                false
            }
        }
    }

    fn draw_cursor_plane(
        &mut self,
        color: &ColorConversion,
        item: &mut ResponseItem,
        target: &MonitorTarget,
    ) {
        let mut descriptor = Self::descriptor_from_item(item, Rotation::R0);
        if descriptor.planes.is_empty() {
            return;
        }
        let bound = match self.ladder.import_and_bind(
            &self.runtime,
            &mut descriptor,
            self.cursor_texture_2d,
            self.cursor_texture_external,
        ) {
            Ok(bound) => bound,
            Err(e) => {
                debug!("Cursor plane import failed: {}", e);
                return;
            }
        };

        let (width, height) = (descriptor.width as i32, descriptor.height as i32);
        let (out_w, out_h) = (target.size.0 as i32, target.size.1 as i32);
        // The cursor plane position is in unrotated framebuffer space.
        let (x, y) = (item.x - target.position.0, item.y - target.position.1);
        let position = match target.rotation {
            Rotation::R0 => (x, y),
            Rotation::R90 => (out_w - y - height, x),
            Rotation::R180 => (out_w - x - width, out_h - y - height),
            Rotation::R270 => (y, out_h - x - width),
        };

        self.runtime.enable(gl::GL_BLEND);
        self.runtime
            .blend_func(gl::GL_SRC_ALPHA, gl::GL_ONE_MINUS_SRC_ALPHA);
        color.draw(
            bound.texture,
            position,
            (width, height),
            (0, 0),
            (width, height),
            target.rotation.radians(),
            bound.external,
        );
        self.runtime.disable(gl::GL_BLEND);
    }
}

impl CaptureBackend for KmsCapture {
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()> {
        let card_path = gpurec_kms::default_card_path()
            .ok_or_else(|| CaptureError::Fatal("no DRM card found".into()))?;
        self.broker = Some(BrokerClient::spawn(&card_path)?);

        let target = self.resolve_target()?;
        ctx.width = target.size.0 as i32;
        ctx.height = target.size.1 as i32;
        self.target = Some(target);

        self.texture_2d = self.create_input_texture(gl::GL_TEXTURE_2D);
        self.texture_external = self.create_input_texture(gl::GL_TEXTURE_EXTERNAL_OES);
        self.cursor_texture_2d = self.create_input_texture(gl::GL_TEXTURE_2D);
        self.cursor_texture_external = self.create_input_texture(gl::GL_TEXTURE_EXTERNAL_OES);

        // On X11 the hardware cursor plane can live on another GPU, so the
        // cursor comes from XFixes instead of a KMS plane there.
        if self.params.record_cursor && self.runtime.display_server() == DisplayServer::X11 {
            self.x11_cursor = Some(X11CursorTracker::new(Rc::clone(&self.runtime))?);
        }

        // Latch HDR metadata from the first plane that carries it so the
        // stream metadata is ready before the first packet.
        if self.params.hdr {
            if let Ok(response) = self.get_planes() {
                self.hdr_metadata = response.items.iter().find_map(|item| item.hdr_metadata);
            }
        }

        info!(
            "KMS capture on {} ({}x{}, connector {}, rotation {:?})",
            self.params.monitor, target.size.0, target.size.1, target.connector_id, target.rotation
        );
        Ok(())
    }

    fn capture(
        &mut self,
        frame: &mut EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus> {
        let target = self
            .target
            .ok_or_else(|| CaptureError::Fatal("capture before start".into()))?;

        let mut response = match self.get_planes() {
            Ok(response) => response,
            Err(e) if e.is_transient() => return Ok(CaptureStatus::Skipped),
            Err(e) => return Err(e),
        };

        let Some((item_ref, combined_plane)) = self.select_item(&response, &target) else {
            if !self.transient_warned {
                warn!("No capturable plane in broker response");
                self.transient_warned = true;
            }
            return Ok(CaptureStatus::Skipped);
        };

        // Indexes survive the mutable re-borrow below.
        let item_index = response
            .items
            .iter()
            .position(|i| std::ptr::eq(i, item_ref))
            .unwrap_or(0);
        let cursor_index = response.items.iter().position(|i| i.is_cursor);

        if self.hdr_metadata.is_none() {
            self.hdr_metadata = response.items.iter().find_map(|i| i.hdr_metadata);
        }

        let item = &mut response.items[item_index];
        // The monitor size in framebuffer coordinates (pre-rotation).
        let (monitor_w, monitor_h) = if target.rotation.swaps_dimensions() {
            (target.size.1 as i32, target.size.0 as i32)
        } else {
            (target.size.0 as i32, target.size.1 as i32)
        };
        // Source rectangle within the (possibly combined) plane: the
        // monitor's region of a combined framebuffer, the plane's own
        // source crop otherwise.
        let (src_x, src_y, src_w, src_h) = if combined_plane {
            (target.position.0, target.position.1, monitor_w, monitor_h)
        } else if item.src_w > 0 && item.src_h > 0 {
            (item.x, item.y, item.src_w, item.src_h)
        } else {
            (item.x, item.y, monitor_w, monitor_h)
        };

        let mut descriptor = Self::descriptor_from_item(item, target.rotation);
        if descriptor.planes.is_empty() {
            return Ok(CaptureStatus::Skipped);
        }

        if self.try_fast_path(frame, &descriptor) {
            return Ok(CaptureStatus::Captured);
        }

        let bound = self.ladder.import_and_bind(
            &self.runtime,
            &mut descriptor,
            self.texture_2d,
            self.texture_external,
        )?;

        color.draw(
            bound.texture,
            (0, 0),
            (frame.width, frame.height),
            (src_x, src_y),
            (src_w, src_h),
            target.rotation.radians(),
            bound.external,
        );
        drop(bound);

        if self.params.record_cursor {
            if let Some(cursor) = self.x11_cursor.as_mut() {
                cursor.update();
                let (cx, cy) = cursor.position();
                let position = (cx - target.position.0, cy - target.position.1);
                cursor.draw(color, position, Rotation::R0);
            } else if let Some(cursor_index) = cursor_index {
                let cursor_item = &mut response.items[cursor_index];
                self.draw_cursor_plane(color, cursor_item, &target);
            }
        }

        Ok(CaptureStatus::Captured)
    }

    fn source_color(&self) -> SourceColor {
        SourceColor::Rgb
    }

    fn uses_external_image(&self) -> bool {
        // Scanout buffers routinely use layouts only the external sampler
        // accepts; always have the external shader pair ready.
        true
    }

    fn hdr_metadata(&self) -> Option<HdrOutputMetadata> {
        self.hdr_metadata
    }
}

impl Drop for KmsCapture {
    fn drop(&mut self) {
        for texture in [
            self.texture_2d,
            self.texture_external,
            self.cursor_texture_2d,
            self.cursor_texture_external,
        ] {
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
    fn test_params_shape() {
        let params = KmsCaptureParams {
            monitor: "DP-1".into(),
            record_cursor: true,
            hdr: false,
        };
        assert_eq!(params.monitor, "DP-1");
        assert!(params.record_cursor);
    }
}
