//! NvFBC capture (NVIDIA X11).
//!
//! `libnvidia-fbc.so.1` is loaded at runtime and attached to the runtime's
//! GLX context (`bExternallyManagedContext`): NvFBC then delivers frames
//! straight into GL textures it manages, and capture is a single
//! grab-and-draw.
//!
//! When a grab fails (driver restart, modeset under the session) the
//! backend tears the session down and retries a full re-create once per
//! second, skipping frames silently in between.

use std::ffi::{c_char, c_int, c_void, CStr};
use std::rc::Rc;
use std::time::{Duration, Instant};

use gpurec_color::{ColorConversion, SourceColor};
use gpurec_encode::CodecContext;
use gpurec_gl::GlRuntime;
use libloading::Library;
use tracing::{debug, info, warn};

use crate::backend::{CaptureBackend, CaptureStatus};
use crate::error::{CaptureError, Result};

/// Cadence for session re-creation after a lost session.
const RECREATE_RETRY: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// NvFBC FFI surface (runtime loaded)
// ---------------------------------------------------------------------------

type NvFbcStatus = c_int;
type NvFbcHandle = u64;
type NvFbcBool = u32;

const NVFBC_SUCCESS: NvFbcStatus = 0;
const NVFBC_TRUE: NvFbcBool = 1;
const NVFBC_FALSE: NvFbcBool = 0;

const NVFBC_VERSION_MAJOR: u32 = 1;
const NVFBC_VERSION_MINOR: u32 = 8;
const NVFBC_VERSION: u32 = NVFBC_VERSION_MINOR | (NVFBC_VERSION_MAJOR << 8);

/// `NVFBC_STRUCT_VERSION` from NvFBC.h, wrapping shifts and all.
const fn struct_version(size: usize, ver: u32) -> u32 {
    (size as u32) | (ver << 16) | NVFBC_VERSION.wrapping_shl(24)
}

const NVFBC_CAPTURE_TO_GL: c_int = 3;

const NVFBC_TRACKING_OUTPUT: c_int = 1;
const NVFBC_TRACKING_SCREEN: c_int = 2;

const NVFBC_OUTPUT_MAX: usize = 5;
const NVFBC_TOGL_TEXTURES_MAX: usize = 2;

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NvFbcSize {
    w: u32,
    h: u32,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct NvFbcBox {
    x: u32,
    y: u32,
    w: u32,
    h: u32,
}

#[repr(C)]
struct NvFbcRandrOutputInfo {
    dw_id: u32,
    name: [c_char; 128],
    tracked_box: NvFbcBox,
}

#[repr(C)]
struct NvFbcCreateHandleParams {
    dw_version: u32,
    private_data: *const c_void,
    private_data_size: u32,
    b_externally_managed_context: NvFbcBool,
    glx_ctx: *mut c_void,
    glx_fb_config: *mut c_void,
}

#[repr(C)]
struct NvFbcDestroyHandleParams {
    dw_version: u32,
}

#[repr(C)]
struct NvFbcGetStatusParams {
    dw_version: u32,
    b_is_capture_possible: NvFbcBool,
    b_currently_capturing: NvFbcBool,
    b_can_create_now: NvFbcBool,
    screen_size: NvFbcSize,
    b_xrandr_available: NvFbcBool,
    outputs: [NvFbcRandrOutputInfo; NVFBC_OUTPUT_MAX],
    dw_output_num: u32,
    dw_nvfbc_version: u32,
}

#[repr(C)]
struct NvFbcCreateCaptureSessionParams {
    dw_version: u32,
    e_capture_type: c_int,
    e_tracking_type: c_int,
    dw_output_id: u32,
    capture_box: NvFbcBox,
    frame_size: NvFbcSize,
    b_with_cursor: NvFbcBool,
    b_disable_auto_modeset_recovery: NvFbcBool,
    dw_sampling_rate_ms: u32,
    b_push_model: NvFbcBool,
    b_allow_direct_capture: NvFbcBool,
}

#[repr(C)]
struct NvFbcDestroyCaptureSessionParams {
    dw_version: u32,
}

#[repr(C)]
struct NvFbcToGlSetupParams {
    dw_version: u32,
    e_buffer_format: c_int,
    b_with_diff_map: NvFbcBool,
    pp_diff_map: *mut *mut c_void,
    dw_diff_map_scaling_factor: u32,
    dw_textures: [u32; NVFBC_TOGL_TEXTURES_MAX],
    dw_tex_target: u32,
    dw_tex_format: u32,
    diff_map_size: NvFbcSize,
}

#[repr(C)]
#[derive(Default)]
struct NvFbcFrameGrabInfo {
    dw_width: u32,
    dw_height: u32,
    dw_byte_size: u32,
    dw_current_frame: u32,
    b_is_new_frame: NvFbcBool,
    ul_timestamp_us: u64,
    dw_missed_frames: u32,
    b_required_post_processing: NvFbcBool,
    b_direct_capture: NvFbcBool,
}

#[repr(C)]
struct NvFbcToGlGrabFrameParams {
    dw_version: u32,
    dw_flags: u32,
    p_frame_grab_info: *mut NvFbcFrameGrabInfo,
    dw_timeout_ms: u32,
    dw_texture_index: u32,
}

/// `NVFBC_API_FUNCTION_LIST`: fixed pointer order, filled by
/// `NvFBCCreateInstance`.
#[repr(C)]
struct NvFbcFunctionList {
    dw_version: u32,
    get_last_error_str: Option<unsafe extern "C" fn(NvFbcHandle) -> *const c_char>,
    create_handle:
        Option<unsafe extern "C" fn(*mut NvFbcHandle, *mut NvFbcCreateHandleParams) -> NvFbcStatus>,
    destroy_handle:
        Option<unsafe extern "C" fn(NvFbcHandle, *mut NvFbcDestroyHandleParams) -> NvFbcStatus>,
    get_status:
        Option<unsafe extern "C" fn(NvFbcHandle, *mut NvFbcGetStatusParams) -> NvFbcStatus>,
    bind_context: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    release_context: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    create_capture_session: Option<
        unsafe extern "C" fn(NvFbcHandle, *mut NvFbcCreateCaptureSessionParams) -> NvFbcStatus,
    >,
    destroy_capture_session: Option<
        unsafe extern "C" fn(NvFbcHandle, *mut NvFbcDestroyCaptureSessionParams) -> NvFbcStatus,
    >,
    to_sys_setup: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    to_sys_grab_frame: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    to_cuda_setup: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    to_cuda_grab_frame: Option<unsafe extern "C" fn(NvFbcHandle, *mut c_void) -> NvFbcStatus>,
    reserved_1: *mut c_void,
    reserved_2: *mut c_void,
    reserved_3: *mut c_void,
    to_gl_setup:
        Option<unsafe extern "C" fn(NvFbcHandle, *mut NvFbcToGlSetupParams) -> NvFbcStatus>,
    to_gl_grab_frame:
        Option<unsafe extern "C" fn(NvFbcHandle, *mut NvFbcToGlGrabFrameParams) -> NvFbcStatus>,
}

/// GeForce cards need this private key to unlock NvFBC.
const ENABLE_KEY: [u8; 16] = [
    0xac, 0x10, 0xc9, 0x2e, 0xa5, 0xe6, 0x87, 0x4f, 0x8f, 0x4b, 0xf4, 0x61, 0xf8, 0x56, 0x27,
    0xe9,
];

/// NvFBC capture options.
#[derive(Debug, Clone)]
pub struct NvFbcParams {
    /// Output name ("DP-1") or "screen" for everything.
    pub display_to_capture: String,
    pub record_cursor: bool,
    /// Push-model direct capture (lower latency, fullscreen apps only).
    pub direct_capture: bool,
}

struct NvFbcSession {
    handle: NvFbcHandle,
    capture_session_active: bool,
    textures: [u32; NVFBC_TOGL_TEXTURES_MAX],
    size: (u32, u32),
}

/// NvFBC capture backend.
pub struct NvFbcCapture {
    runtime: Rc<GlRuntime>,
    params: NvFbcParams,
    _lib: Option<Library>,
    fns: Option<Box<NvFbcFunctionList>>,
    session: Option<NvFbcSession>,
    needs_recreate: bool,
    next_recreate_at: Instant,
}

impl NvFbcCapture {
    pub fn new(runtime: Rc<GlRuntime>, params: NvFbcParams) -> Self {
        Self {
            runtime,
            params,
            _lib: None,
            fns: None,
            session: None,
            needs_recreate: false,
            next_recreate_at: Instant::now(),
        }
    }

    fn load_library(&mut self) -> Result<()> {
        // SAFETY: loading the NVIDIA capture library.
        let lib = unsafe { Library::new("libnvidia-fbc.so.1") }.map_err(|e| {
            CaptureError::Capability(format!("libnvidia-fbc.so.1 not loadable: {e}"))
        })?;
        type CreateInstance = unsafe extern "C" fn(*mut NvFbcFunctionList) -> NvFbcStatus;
        // SAFETY: documented entry point.
        let create_instance: CreateInstance = unsafe {
            lib.get(b"NvFBCCreateInstance")
                .map(|s: libloading::Symbol<'_, CreateInstance>| *s)
                .map_err(|_| {
                    CaptureError::Capability("NvFBCCreateInstance missing".into())
                })?
        };

        let mut fns: Box<NvFbcFunctionList> =
            // SAFETY: the list is plain data filled by the driver.
            unsafe { Box::new(std::mem::zeroed()) };
        fns.dw_version = struct_version(std::mem::size_of::<NvFbcFunctionList>(), 1);
        // SAFETY: list pointer valid; driver fills the entry points.
        let status = unsafe { create_instance(fns.as_mut()) };
        if status != NVFBC_SUCCESS {
            return Err(CaptureError::Capability(format!(
                "NvFBCCreateInstance failed: {status}"
            )));
        }
        self._lib = Some(lib);
        self.fns = Some(fns);
        Ok(())
    }

    fn last_error(&self, handle: NvFbcHandle) -> String {
        let Some(fns) = &self.fns else {
            return String::new();
        };
        let Some(get_error) = fns.get_last_error_str else {
            return String::new();
        };
        // SAFETY: handle is live; the string is driver-owned and static
        // enough to copy out immediately.
        unsafe {
            let ptr = get_error(handle);
            if ptr.is_null() {
                String::new()
            } else {
                CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    fn create_session(&mut self) -> Result<()> {
        let (glx_ctx, glx_fb_config) = self.runtime.glx_handles().ok_or_else(|| {
            CaptureError::Capability("NvFBC requires the GLX context path".into())
        })?;
        let fns = self
            .fns
            .as_ref()
            .ok_or_else(|| CaptureError::Fatal("NvFBC not loaded".into()))?;
        let create_handle = fns.create_handle.ok_or_else(|| {
            CaptureError::Capability("driver lacks nvFBCCreateHandle".into())
        })?;
        let get_status = fns.get_status.ok_or_else(|| {
            CaptureError::Capability("driver lacks nvFBCGetStatus".into())
        })?;
        let create_capture = fns.create_capture_session.ok_or_else(|| {
            CaptureError::Capability("driver lacks nvFBCCreateCaptureSession".into())
        })?;
        let togl_setup = fns.to_gl_setup.ok_or_else(|| {
            CaptureError::Capability("driver lacks nvFBCToGLSetUp".into())
        })?;

        let mut handle: NvFbcHandle = 0;
        let mut create_params = NvFbcCreateHandleParams {
            dw_version: struct_version(std::mem::size_of::<NvFbcCreateHandleParams>(), 2),
            private_data: std::ptr::null(),
            private_data_size: 0,
            b_externally_managed_context: NVFBC_TRUE,
            glx_ctx,
            glx_fb_config,
        };
        // SAFETY: params outlive the call.
        let mut status = unsafe { create_handle(&mut handle, &mut create_params) };
        if status != NVFBC_SUCCESS {
            // GeForce: retry with the unlock key.
            create_params.private_data = ENABLE_KEY.as_ptr().cast();
            create_params.private_data_size = ENABLE_KEY.len() as u32;
            // SAFETY: as above.
            status = unsafe { create_handle(&mut handle, &mut create_params) };
        }
        if status != NVFBC_SUCCESS {
            return Err(CaptureError::Capability(format!(
                "nvFBCCreateHandle failed: {status}"
            )));
        }

        // SAFETY: zeroed param struct is the documented starting state.
        let mut status_params: NvFbcGetStatusParams = unsafe { std::mem::zeroed() };
        status_params.dw_version =
            struct_version(std::mem::size_of::<NvFbcGetStatusParams>(), 2);
        // SAFETY: handle live, params local.
        if unsafe { get_status(handle, &mut status_params) } != NVFBC_SUCCESS {
            let message = self.last_error(handle);
            self.destroy_handle(handle);
            return Err(CaptureError::Capability(format!(
                "nvFBCGetStatus failed: {message}"
            )));
        }
        if status_params.b_can_create_now == NVFBC_FALSE {
            self.destroy_handle(handle);
            return Err(CaptureError::Transient(
                "NvFBC cannot create a capture session right now".into(),
            ));
        }

        let tracking = if self.params.display_to_capture == "screen" {
            NVFBC_TRACKING_SCREEN
        } else {
            NVFBC_TRACKING_OUTPUT
        };
        let (output_id, size) = if tracking == NVFBC_TRACKING_OUTPUT {
            match find_output(&status_params, &self.params.display_to_capture) {
                Some(found) => found,
                None => {
                    self.destroy_handle(handle);
                    return Err(CaptureError::Fatal(format!(
                        "NvFBC output '{}' not found",
                        self.params.display_to_capture
                    )));
                }
            }
        } else {
            (
                0,
                (status_params.screen_size.w, status_params.screen_size.h),
            )
        };

        let mut capture_params = NvFbcCreateCaptureSessionParams {
            dw_version: struct_version(
                std::mem::size_of::<NvFbcCreateCaptureSessionParams>(),
                6,
            ),
            e_capture_type: NVFBC_CAPTURE_TO_GL,
            e_tracking_type: tracking,
            dw_output_id: output_id,
            capture_box: NvFbcBox::default(),
            frame_size: NvFbcSize::default(),
            b_with_cursor: if self.params.record_cursor {
                NVFBC_TRUE
            } else {
                NVFBC_FALSE
            },
            b_disable_auto_modeset_recovery: NVFBC_FALSE,
            dw_sampling_rate_ms: 0,
            b_push_model: if self.params.direct_capture {
                NVFBC_TRUE
            } else {
                NVFBC_FALSE
            },
            b_allow_direct_capture: if self.params.direct_capture {
                NVFBC_TRUE
            } else {
                NVFBC_FALSE
            },
        };
        // SAFETY: handle live, params local.
        if unsafe { create_capture(handle, &mut capture_params) } != NVFBC_SUCCESS {
            let message = self.last_error(handle);
            self.destroy_handle(handle);
            return Err(CaptureError::Transient(format!(
                "nvFBCCreateCaptureSession failed: {message}"
            )));
        }

        // SAFETY: zeroed setup params, filled by the driver.
        let mut setup_params: NvFbcToGlSetupParams = unsafe { std::mem::zeroed() };
        setup_params.dw_version =
            struct_version(std::mem::size_of::<NvFbcToGlSetupParams>(), 2);
        // SAFETY: handle live, params local.
        if unsafe { togl_setup(handle, &mut setup_params) } != NVFBC_SUCCESS {
            let message = self.last_error(handle);
            self.destroy_session_handle(handle, true);
            return Err(CaptureError::Transient(format!(
                "nvFBCToGLSetUp failed: {message}"
            )));
        }

        info!(
            "NvFBC session on '{}' ({}x{})",
            self.params.display_to_capture, size.0, size.1
        );
        self.session = Some(NvFbcSession {
            handle,
            capture_session_active: true,
            textures: setup_params.dw_textures,
            size,
        });
        Ok(())
    }

    fn destroy_handle(&self, handle: NvFbcHandle) {
        self.destroy_session_handle(handle, false);
    }

    fn destroy_session_handle(&self, handle: NvFbcHandle, with_session: bool) {
        let Some(fns) = &self.fns else { return };
        // SAFETY: teardown with versioned empty param structs.
        unsafe {
            if with_session {
                if let Some(destroy_capture) = fns.destroy_capture_session {
                    let mut params = NvFbcDestroyCaptureSessionParams {
                        dw_version: struct_version(
                            std::mem::size_of::<NvFbcDestroyCaptureSessionParams>(),
                            1,
                        ),
                    };
                    destroy_capture(handle, &mut params);
                }
            }
            if let Some(destroy_handle) = fns.destroy_handle {
                let mut params = NvFbcDestroyHandleParams {
                    dw_version: struct_version(
                        std::mem::size_of::<NvFbcDestroyHandleParams>(),
                        1,
                    ),
                };
                destroy_handle(handle, &mut params);
            }
        }
    }

    fn teardown_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.destroy_session_handle(session.handle, session.capture_session_active);
        }
    }
}

fn find_output(status: &NvFbcGetStatusParams, name: &str) -> Option<(u32, (u32, u32))> {
    for output in status.outputs.iter().take(status.dw_output_num as usize) {
        // SAFETY: the driver null-terminates output names.
        let output_name = unsafe { CStr::from_ptr(output.name.as_ptr()) };
        if output_name.to_string_lossy() == name {
            return Some((
                output.dw_id,
                (output.tracked_box.w, output.tracked_box.h),
            ));
        }
    }
    None
}

impl CaptureBackend for NvFbcCapture {
    fn start(&mut self, ctx: &mut CodecContext) -> Result<()> {
        self.load_library()?;
        self.create_session()?;
        let session = self
            .session
            .as_ref()
            .ok_or_else(|| CaptureError::Fatal("session missing after create".into()))?;
        ctx.width = session.size.0 as i32;
        ctx.height = session.size.1 as i32;
        Ok(())
    }

    fn tick(&mut self) {
        if self.needs_recreate && Instant::now() >= self.next_recreate_at {
            self.teardown_session();
            match self.create_session() {
                Ok(()) => {
                    info!("NvFBC session re-created");
                    self.needs_recreate = false;
                }
                Err(e) => {
                    debug!("NvFBC re-create attempt failed: {}", e);
                    self.next_recreate_at = Instant::now() + RECREATE_RETRY;
                }
            }
        }
    }

    fn capture(
        &mut self,
        frame: &mut gpurec_encode::EncodeFrame,
        color: &ColorConversion,
    ) -> Result<CaptureStatus> {
        if self.needs_recreate {
            return Ok(CaptureStatus::Skipped);
        }
        let Some(session) = &self.session else {
            return Ok(CaptureStatus::Skipped);
        };
        let Some(fns) = &self.fns else {
            return Ok(CaptureStatus::Skipped);
        };
        let Some(grab) = fns.to_gl_grab_frame else {
            return Err(CaptureError::Capability("driver lacks nvFBCToGLGrabFrame".into()));
        };

        let mut grab_info = NvFbcFrameGrabInfo::default();
        let mut grab_params = NvFbcToGlGrabFrameParams {
            dw_version: struct_version(std::mem::size_of::<NvFbcToGlGrabFrameParams>(), 2),
            dw_flags: 0,
            p_frame_grab_info: &mut grab_info,
            dw_timeout_ms: 0,
            dw_texture_index: 0,
        };
        // SAFETY: handle live, params local.
        let status = unsafe { grab(session.handle, &mut grab_params) };
        if status != NVFBC_SUCCESS {
            warn!(
                "NvFBC grab failed ({}), re-creating the session",
                self.last_error(session.handle)
            );
            self.needs_recreate = true;
            self.next_recreate_at = Instant::now() + RECREATE_RETRY;
            return Ok(CaptureStatus::Skipped);
        }

        let texture = session.textures[grab_params.dw_texture_index as usize];
        color.draw(
            texture,
            (0, 0),
            (frame.width, frame.height),
            (0, 0),
            (session.size.0 as i32, session.size.1 as i32),
            0.0,
            false,
        );
        Ok(CaptureStatus::Captured)
    }

    fn source_color(&self) -> SourceColor {
        // NvFBC delivers BGRA textures.
        SourceColor::Bgr
    }
}

impl Drop for NvFbcCapture {
    fn drop(&mut self) {
        self.teardown_session();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_struct_version_encodes_size() {
        let v = struct_version(64, 2);
        assert_eq!(v & 0xFFFF, 64);
        assert_eq!((v >> 16) & 0xFF, 2);
    }

    #[test]
    fn test_enable_key_length() {
        assert_eq!(ENABLE_KEY.len(), 16);
    }
}
