//! The dedicated PipeWire stream thread.
//!
//! PipeWire's Rust bindings use `Rc` and `NonNull` internally and are not
//! `Send`, so everything PipeWire lives on one `std::thread` with its own
//! `MainLoop`. The `on_process` callback latches the most recent frame
//! (duplicated DMA-BUF plane FDs, crop, damage, cursor) behind a mutex;
//! the pacer-side backend takes the latch in `capture()` and never touches
//! PipeWire itself.
//!
//! Renegotiation is a one-way flag: when the capture side fails to import
//! a buffer it asks this thread to re-announce the format without
//! modifiers, mirroring how compositors recover from modifier-incompatible
//! buffers. The retry fires even when the failure was not a modifier
//! problem.

use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use parking_lot::Mutex;
use pipewire as pw;
use pw::spa::pod::serialize::PodSerializer;
use pw::spa::pod::Pod;
use pw::stream::{Stream, StreamFlags};
use tracing::{debug, info, warn};

use crate::frame::DmaBufPlane;

/// Crop rectangle from `SPA_META_VideoCrop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CropRegion {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

/// Cursor state from `SPA_META_Cursor`.
#[derive(Debug, Clone, Default)]
pub struct CursorState {
    pub position: (i32, i32),
    pub hotspot: (i32, i32),
    pub size: (u32, u32),
    /// BGRA bitmap; `None` when unchanged since the last update.
    pub bitmap: Option<Vec<u8>>,
    pub serial: u64,
    pub visible: bool,
}

/// The most recent frame, latched by `on_process`.
#[derive(Debug, Default)]
pub struct LatchedFrame {
    pub planes: Vec<DmaBufPlane>,
    pub width: u32,
    pub height: u32,
    pub fourcc: u32,
    pub modifier: u64,
    pub crop: Option<CropRegion>,
    pub damaged: bool,
}

/// Format the stream settled on.
#[derive(Debug, Clone, Copy, Default)]
pub struct NegotiatedFormat {
    pub width: u32,
    pub height: u32,
    pub spa_format: u32,
    pub modifier: u64,
}

/// State shared between the PipeWire thread and the capture side.
#[derive(Default)]
pub struct SharedStreamState {
    pub frame: Mutex<Option<LatchedFrame>>,
    pub cursor: Mutex<CursorState>,
    pub negotiated: Mutex<Option<NegotiatedFormat>>,
    pub error: Mutex<Option<String>>,

    /// Capture side sets this after a failed import; the loop thread
    /// re-announces formats without modifiers.
    pub renegotiate_without_modifiers: AtomicBool,

    running: AtomicBool,
}

impl SharedStreamState {
    /// Wait until the first format negotiation lands.
    pub fn wait_negotiated(&self, timeout: Duration) -> Option<NegotiatedFormat> {
        let deadline = std::time::Instant::now() + timeout;
        loop {
            if let Some(format) = *self.negotiated.lock() {
                return Some(format);
            }
            if self.error.lock().is_some() || std::time::Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
    }
}

/// Handle to the running stream thread.
pub struct PwStreamThread {
    state: Arc<SharedStreamState>,
    handle: Option<JoinHandle<()>>,
}

impl PwStreamThread {
    /// Spawn the loop thread for `node_id` on the portal-provided fd.
    pub fn spawn(fd: OwnedFd, node_id: u32) -> Self {
        let state = Arc::new(SharedStreamState::default());
        state.running.store(true, Ordering::SeqCst);
        let thread_state = Arc::clone(&state);
        let handle = std::thread::Builder::new()
            .name("gpurec-pipewire".into())
            .spawn(move || {
                if let Err(e) = run_loop(fd, node_id, &thread_state) {
                    warn!("PipeWire loop thread exited with error: {}", e);
                    *thread_state.error.lock() = Some(e);
                }
            })
            .ok();
        Self {
            state,
            handle,
        }
    }

    pub fn state(&self) -> &Arc<SharedStreamState> {
        &self.state
    }

    pub fn stop(&mut self) {
        self.state.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for PwStreamThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_loop(fd: OwnedFd, node_id: u32, state: &Arc<SharedStreamState>) -> Result<(), String> {
    pw::init();

    let mainloop =
        pw::main_loop::MainLoop::new(None).map_err(|e| format!("MainLoop: {e}"))?;
    let context =
        pw::context::Context::new(&mainloop).map_err(|e| format!("Context: {e}"))?;
    let core = context
        .connect_fd(fd, None)
        .map_err(|e| format!("connect_fd: {e}"))?;

    let stream = Stream::new(
        &core,
        "gpurec-capture",
        pw::properties! {
            *pw::keys::MEDIA_TYPE => "Video",
            *pw::keys::MEDIA_CATEGORY => "Capture",
            *pw::keys::MEDIA_ROLE => "Screen",
        },
    )
    .map_err(|e| format!("Stream::new: {e}"))?;

    let process_state = Arc::clone(state);
    let param_state = Arc::clone(state);
    let _listener = stream
        .add_local_listener::<()>()
        .state_changed(|_stream, _data, old, new| {
            debug!("PipeWire stream state: {:?} -> {:?}", old, new);
        })
        .param_changed(move |_stream, _data, id, pod| {
            if id != pw::spa::param::ParamType::Format.as_raw() {
                return;
            }
            let Some(pod) = pod else { return };
            on_format_changed(&param_state, pod);
        })
        .process(move |stream_ref, _data| {
            on_process(stream_ref, &process_state);
        })
        .register()
        .map_err(|e| format!("register listener: {e}"))?;

    let format_pod = build_format_pod(true);
    let mut params = [Pod::from_bytes(&format_pod).ok_or_else(|| "format pod".to_string())?];
    stream
        .connect(
            pw::spa::utils::Direction::Input,
            Some(node_id),
            StreamFlags::AUTOCONNECT,
            &mut params,
        )
        .map_err(|e| format!("stream connect: {e}"))?;

    info!("PipeWire stream connected to node {}", node_id);

    while state.running.load(Ordering::SeqCst) {
        mainloop.loop_().iterate(Duration::from_millis(50));

        if state
            .renegotiate_without_modifiers
            .swap(false, Ordering::SeqCst)
        {
            info!("Re-announcing stream formats without modifiers");
            let pod_bytes = build_format_pod(false);
            if let Some(pod) = Pod::from_bytes(&pod_bytes) {
                let mut params = [pod];
                if let Err(e) = stream.update_params(&mut params) {
                    warn!("update_params failed: {}", e);
                }
            }
        }
    }

    let _ = stream.disconnect();
    Ok(())
}

/// Announce the RGB formats we can import.
///
/// With `with_modifiers` the pod carries a modifier choice so the
/// compositor may pick a tiled DMA-BUF layout; the don't-fixate flag lets
/// it narrow the choice during negotiation.
fn build_format_pod(with_modifiers: bool) -> Vec<u8> {
    use pw::spa::pod::{self, Property, PropertyFlags, Value};
    use pw::spa::utils::{Choice, ChoiceEnum, ChoiceFlags};

    let mut obj = pod::object!(
        pw::spa::utils::SpaTypes::ObjectParamFormat,
        pw::spa::param::ParamType::EnumFormat,
        pod::property!(
            pw::spa::param::format::FormatProperties::MediaType,
            Id,
            pw::spa::param::format::MediaType::Video
        ),
        pod::property!(
            pw::spa::param::format::FormatProperties::MediaSubtype,
            Id,
            pw::spa::param::format::MediaSubtype::Raw
        ),
        pod::property!(
            pw::spa::param::format::FormatProperties::VideoFormat,
            Choice,
            Enum,
            Id,
            pw::spa::param::video::VideoFormat::BGRx,
            pw::spa::param::video::VideoFormat::BGRA,
            pw::spa::param::video::VideoFormat::RGBx,
            pw::spa::param::video::VideoFormat::RGBA
        ),
        pod::property!(
            pw::spa::param::format::FormatProperties::VideoSize,
            Choice,
            Range,
            Rectangle,
            pw::spa::utils::Rectangle {
                width: 1920,
                height: 1080
            },
            pw::spa::utils::Rectangle {
                width: 1,
                height: 1
            },
            pw::spa::utils::Rectangle {
                width: 16384,
                height: 16384
            }
        ),
        pod::property!(
            pw::spa::param::format::FormatProperties::VideoFramerate,
            Choice,
            Range,
            Fraction,
            pw::spa::utils::Fraction { num: 60, denom: 1 },
            pw::spa::utils::Fraction { num: 1, denom: 1 },
            pw::spa::utils::Fraction { num: 500, denom: 1 }
        ),
    );

    if with_modifiers {
        // Implicit modifier only: the compositor may still pick DMA-BUF
        // with linear/implicit layout, and rejects tiled ones we could not
        // import anyway.
        obj.properties.push(Property {
            key: pw::spa::param::format::FormatProperties::VideoModifier.as_raw(),
            flags: PropertyFlags::MANDATORY | PropertyFlags::DONT_FIXATE,
            value: Value::Choice(pw::spa::pod::ChoiceValue::Long(Choice(
                ChoiceFlags::empty(),
                ChoiceEnum::Enum {
                    default: 0,
                    alternatives: vec![0],
                },
            ))),
        });
    }

    PodSerializer::serialize(
        std::io::Cursor::new(Vec::new()),
        &Value::Object(obj),
    )
    .map(|(cursor, _)| cursor.into_inner())
    .unwrap_or_default()
}

fn on_format_changed(state: &Arc<SharedStreamState>, pod: &Pod) {
    use pw::spa::param::format_utils::parse_format;

    let Ok((media_type, media_subtype)) = parse_format(pod) else {
        return;
    };
    if media_type != pw::spa::param::format::MediaType::Video
        || media_subtype != pw::spa::param::format::MediaSubtype::Raw
    {
        return;
    }

    let mut info = pw::spa::param::video::VideoInfoRaw::default();
    if info.parse(pod).is_err() {
        warn!("Failed to parse negotiated video format");
        return;
    }

    let format = NegotiatedFormat {
        width: info.size().width,
        height: info.size().height,
        spa_format: info.format().as_raw(),
        modifier: info.modifier(),
    };
    info!(
        "PipeWire negotiated {}x{} spa format {} modifier {:#x}",
        format.width, format.height, format.spa_format, format.modifier
    );
    *state.negotiated.lock() = Some(format);
}

fn on_process(stream: &pw::stream::StreamRef, state: &Arc<SharedStreamState>) {
    // SAFETY: raw buffer access inside the process callback; the buffer is
    // queued back before returning.
    unsafe {
        let raw_buffer = stream.dequeue_raw_buffer();
        if raw_buffer.is_null() {
            return;
        }
        let spa_buffer = (*raw_buffer).buffer;
        if spa_buffer.is_null() {
            stream.queue_raw_buffer(raw_buffer);
            return;
        }

        latch_frame(spa_buffer, state);

        stream.queue_raw_buffer(raw_buffer);
    }
}

/// Copy everything interesting out of a dequeued buffer under the latch.
///
/// # Safety
///
/// `spa_buffer` must be a valid dequeued buffer.
unsafe fn latch_frame(spa_buffer: *mut libspa_sys::spa_buffer, state: &Arc<SharedStreamState>) {
    // SAFETY (fn contract): buffer is valid while dequeued.
    unsafe {
        let negotiated = (*state.negotiated.lock()).unwrap_or_default();

        let n_datas = (*spa_buffer).n_datas as usize;
        let datas = (*spa_buffer).datas;
        if n_datas == 0 || datas.is_null() {
            return;
        }

        // Only the DMA-BUF path feeds the GPU pipeline; SHM frames are
        // ignored (the session would have failed negotiation instead).
        let first = &*datas;
        if first.type_ != libspa_sys::SPA_DATA_DmaBuf {
            return;
        }

        let mut planes = Vec::with_capacity(n_datas.min(4));
        for i in 0..n_datas.min(4) {
            let data = &*datas.add(i);
            if data.fd < 0 {
                continue;
            }
            // The buffer goes straight back to PipeWire; duplicate the fd
            // so the latched frame owns its planes.
            let dup = libc::fcntl(data.fd as RawFd, libc::F_DUPFD_CLOEXEC, 3);
            if dup < 0 {
                continue;
            }
            let (offset, stride) = if data.chunk.is_null() {
                (0, 0)
            } else {
                ((*data.chunk).offset, (*data.chunk).stride as u32)
            };
            planes.push(DmaBufPlane::new(OwnedFd::from_raw_fd(dup), offset, stride));
        }
        if planes.is_empty() {
            return;
        }

        let mut crop = None;
        let mut damaged = false;
        let mut saw_damage_meta = false;

        let n_metas = (*spa_buffer).n_metas as usize;
        let metas = (*spa_buffer).metas;
        for i in 0..n_metas {
            let meta = &*metas.add(i);
            match meta.type_ {
                libspa_sys::SPA_META_VideoCrop => {
                    let region = &*(meta.data as *const libspa_sys::spa_meta_region);
                    if region.region.size.width > 0 && region.region.size.height > 0 {
                        crop = Some(CropRegion {
                            x: region.region.position.x,
                            y: region.region.position.y,
                            width: region.region.size.width,
                            height: region.region.size.height,
                        });
                    }
                }
                libspa_sys::SPA_META_VideoDamage => {
                    saw_damage_meta = true;
                    let region = &*(meta.data as *const libspa_sys::spa_meta_region);
                    if region.region.size.width > 0 && region.region.size.height > 0 {
                        damaged = true;
                    }
                }
                libspa_sys::SPA_META_Cursor => {
                    latch_cursor(meta, state);
                }
                _ => {}
            }
        }
        if !saw_damage_meta {
            // No damage information means we must assume change.
            damaged = true;
        }

        let mut latch = state.frame.lock();
        // Damage stays sticky across latched frames until the capture side
        // clears it.
        let prev_damaged = latch.as_ref().is_some_and(|f| f.damaged);
        *latch = Some(LatchedFrame {
            planes,
            width: negotiated.width,
            height: negotiated.height,
            fourcc: spa_format_to_drm_fourcc(negotiated.spa_format),
            modifier: negotiated.modifier,
            crop,
            damaged: damaged || prev_damaged,
        });
    }
}

/// # Safety
///
/// `meta` must be a cursor meta from a live buffer.
unsafe fn latch_cursor(meta: &libspa_sys::spa_meta, state: &Arc<SharedStreamState>) {
    // SAFETY (fn contract): meta data points at a spa_meta_cursor.
    unsafe {
        let cursor_meta = &*(meta.data as *const libspa_sys::spa_meta_cursor);
        let mut cursor = state.cursor.lock();
        cursor.visible = cursor_meta.id != 0;
        cursor.position = (cursor_meta.position.x, cursor_meta.position.y);
        cursor.hotspot = (cursor_meta.hotspot.x, cursor_meta.hotspot.y);

        if cursor_meta.bitmap_offset == 0 {
            return;
        }
        let bitmap = &*((meta.data as *const u8)
            .add(cursor_meta.bitmap_offset as usize)
            .cast::<libspa_sys::spa_meta_bitmap>());
        if bitmap.size.width == 0 || bitmap.size.height == 0 || bitmap.offset == 0 {
            return;
        }

        let serial = (bitmap.size.width as u64) << 40
            | (bitmap.size.height as u64) << 16
            | cursor_meta.id as u64;
        if cursor.serial == serial && cursor.bitmap.is_some() {
            return;
        }

        let src = (bitmap as *const libspa_sys::spa_meta_bitmap as *const u8)
            .add(bitmap.offset as usize);
        let height = bitmap.size.height as usize;
        let stride = bitmap.stride.unsigned_abs() as usize;
        let row_bytes = bitmap.size.width as usize * 4;
        let mut pixels = Vec::with_capacity(row_bytes * height);
        for row in 0..height {
            let row_ptr = src.add(row * stride);
            pixels.extend_from_slice(std::slice::from_raw_parts(row_ptr, row_bytes));
        }
        cursor.size = (bitmap.size.width, bitmap.size.height);
        cursor.bitmap = Some(pixels);
        cursor.serial = serial;
    }
}

/// Map a SPA video format onto the DRM fourcc EGL import expects.
pub fn spa_format_to_drm_fourcc(spa_format: u32) -> u32 {
    use pw::spa::param::video::VideoFormat;

    const fn fourcc(s: &[u8; 4]) -> u32 {
        (s[0] as u32) | ((s[1] as u32) << 8) | ((s[2] as u32) << 16) | ((s[3] as u32) << 24)
    }
    // DRM fourccs are little-endian channel order, SPA names are
    // big-endian-ish; BGRx in SPA is XR24 in DRM.
    let format = spa_format;
    if format == VideoFormat::BGRx.as_raw() {
        fourcc(b"XR24")
    } else if format == VideoFormat::BGRA.as_raw() {
        fourcc(b"AR24")
    } else if format == VideoFormat::RGBx.as_raw() {
        fourcc(b"XB24")
    } else if format == VideoFormat::RGBA.as_raw() {
        fourcc(b"AB24")
    } else {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spa_to_drm_fourcc() {
        use pw::spa::param::video::VideoFormat;
        assert_eq!(
            spa_format_to_drm_fourcc(VideoFormat::BGRx.as_raw()),
            0x3432_5258 // XR24
        );
        assert_eq!(
            spa_format_to_drm_fourcc(VideoFormat::BGRA.as_raw()),
            0x3432_5241 // AR24
        );
        assert_eq!(spa_format_to_drm_fourcc(9999), 0);
    }

    #[test]
    fn test_format_pod_builds() {
        let with = build_format_pod(true);
        let without = build_format_pod(false);
        assert!(!with.is_empty());
        assert!(!without.is_empty());
        // The modifier property adds bytes.
        assert!(with.len() > without.len());
    }

    #[test]
    fn test_wait_negotiated_times_out() {
        let state = SharedStreamState::default();
        let start = std::time::Instant::now();
        assert!(state.wait_negotiated(Duration::from_millis(50)).is_none());
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn test_wait_negotiated_sees_error() {
        let state = SharedStreamState::default();
        *state.error.lock() = Some("boom".into());
        // Error short-circuits the wait.
        let start = std::time::Instant::now();
        assert!(state.wait_negotiated(Duration::from_secs(5)).is_none());
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
