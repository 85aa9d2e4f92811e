//! VAAPI destination-surface adapter (AMD and Intel).
//!
//! The zero-copy trick: allocate the encoder surface through VAAPI, export
//! it as DMA-BUF layers with `vaExportSurfaceHandle`, and re-import each
//! layer as a GL texture through EGL. The color engine then renders
//! straight into the encoder's own memory and encoding references the
//! original surface with no copy at all.
//!
//! Also hosts the AMD "fast path": importing a captured frame's DMA-BUF
//! planes as a temporary VAAPI surface and running a video-processing blit
//! directly into the encoder surface, skipping GL entirely. Only valid for
//! unrotated captures; the capture layer latches it off permanently on the
//! first failure.

use std::ffi::{c_int, c_void};
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::rc::Rc;

use gpurec_color::{ColorDepth, DestinationColor};
use gpurec_gl::ffi as gl;
use gpurec_gl::{GlRuntime, GpuVendor};
use libloading::Library;
use tracing::{debug, info, warn};

use crate::codec::{align_dimensions, CodecContext, SupportedCodecs};
use crate::error::{EncodeError, Result};
use crate::frame::{EncodeFrame, FrameStorage};

// ---------------------------------------------------------------------------
// libva FFI surface (runtime loaded)
// ---------------------------------------------------------------------------

pub(crate) type VaDisplay = *mut c_void;
type VaStatus = c_int;
type VaSurfaceId = u32;
type VaConfigId = u32;
type VaContextId = u32;
type VaBufferId = u32;

const VA_STATUS_SUCCESS: VaStatus = 0;

const VA_RT_FORMAT_YUV420: u32 = 0x0000_0001;
const VA_RT_FORMAT_YUV420_10: u32 = 0x0000_0100;

const VA_FOURCC_NV12: u32 = fourcc(b"NV12");
const VA_FOURCC_P010: u32 = fourcc(b"P010");

const VA_SURFACE_ATTRIB_SETTABLE: u32 = 0x0000_0002;
const VA_SURFACE_ATTRIB_PIXEL_FORMAT: c_int = 1;
const VA_SURFACE_ATTRIB_MEMORY_TYPE: c_int = 9;
const VA_SURFACE_ATTRIB_EXTERNAL_BUFFER_DESCRIPTOR: c_int = 10;
const VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2: u32 = 0x4000_0000;

const VA_GENERIC_VALUE_TYPE_INTEGER: c_int = 1;
const VA_GENERIC_VALUE_TYPE_POINTER: c_int = 4;

const VA_EXPORT_SURFACE_READ_WRITE: u32 = 0x0003;
const VA_EXPORT_SURFACE_SEPARATE_LAYERS: u32 = 0x0004;

const VA_PROFILE_NONE: c_int = -1;
const VA_PROFILE_H264_BASELINE: c_int = 5;
const VA_PROFILE_H264_MAIN: c_int = 6;
const VA_PROFILE_H264_HIGH: c_int = 7;
const VA_PROFILE_H264_CONSTRAINED_BASELINE: c_int = 13;
const VA_PROFILE_VP8_VERSION_0_3: c_int = 14;
const VA_PROFILE_HEVC_MAIN: c_int = 17;
const VA_PROFILE_HEVC_MAIN10: c_int = 18;
const VA_PROFILE_VP9_PROFILE0: c_int = 19;
const VA_PROFILE_VP9_PROFILE2: c_int = 21;
const VA_PROFILE_AV1_PROFILE0: c_int = 32;

const VA_ENTRYPOINT_ENC_SLICE: c_int = 6;
const VA_ENTRYPOINT_ENC_SLICE_LP: c_int = 8;
const VA_ENTRYPOINT_VIDEO_PROC: c_int = 10;

const VA_PROC_PIPELINE_PARAMETER_BUFFER_TYPE: c_int = 41;

const fn fourcc(s: &[u8; 4]) -> u32 {
    (s[0] as u32) | ((s[1] as u32) << 8) | ((s[2] as u32) << 16) | ((s[3] as u32) << 24)
}

// DRM fourccs for the exported per-plane layers.
const DRM_FORMAT_R8: u32 = fourcc(b"R8  ");
const DRM_FORMAT_GR88: u32 = fourcc(b"GR88");
const DRM_FORMAT_R16: u32 = fourcc(b"R16 ");
const DRM_FORMAT_GR1616: u32 = fourcc(b"GR32");

#[repr(C)]
union VaGenericValueData {
    i: c_int,
    f: f32,
    ptr: *mut c_void,
}

#[repr(C)]
struct VaGenericValue {
    value_type: c_int,
    value: VaGenericValueData,
}

#[repr(C)]
struct VaSurfaceAttrib {
    kind: c_int,
    flags: u32,
    value: VaGenericValue,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VaDrmPrimeObject {
    fd: c_int,
    size: u32,
    drm_format_modifier: u64,
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VaDrmPrimeLayer {
    drm_format: u32,
    num_planes: u32,
    object_index: [u32; 4],
    offset: [u32; 4],
    pitch: [u32; 4],
}

/// `VADRMPRIMESurfaceDescriptor` from va_drmcommon.h.
#[repr(C)]
#[derive(Default)]
struct VaDrmPrimeSurfaceDescriptor {
    fourcc: u32,
    width: u32,
    height: u32,
    num_objects: u32,
    objects: [VaDrmPrimeObject; 4],
    num_layers: u32,
    layers: [VaDrmPrimeLayer; 4],
}

#[repr(C)]
#[derive(Clone, Copy, Default)]
struct VaRectangle {
    x: i16,
    y: i16,
    width: u16,
    height: u16,
}

/// Leading fields of `VAProcPipelineParameterBuffer`; the zeroed tail
/// covers the color-property fields added by newer libva revisions, which
/// all default to "unspecified" at zero.
#[repr(C)]
struct VaProcPipelineParameterBuffer {
    surface: VaSurfaceId,
    surface_region: *const VaRectangle,
    surface_color_standard: u32,
    output_region: *const VaRectangle,
    output_background_color: u32,
    output_color_standard: u32,
    pipeline_flags: u32,
    filter_flags: u32,
    filters: *mut VaBufferId,
    num_filters: u32,
    forward_references: *mut VaSurfaceId,
    num_forward_references: u32,
    backward_references: *mut VaSurfaceId,
    num_backward_references: u32,
    rotation_state: u32,
    blend_state: *const c_void,
    mirror_state: u32,
    additional_outputs: *mut VaSurfaceId,
    num_additional_outputs: u32,
    tail: [u64; 8],
}

struct VaFns {
    get_display_drm: unsafe extern "C" fn(c_int) -> VaDisplay,
    initialize: unsafe extern "C" fn(VaDisplay, *mut c_int, *mut c_int) -> VaStatus,
    terminate: unsafe extern "C" fn(VaDisplay) -> VaStatus,
    max_num_profiles: unsafe extern "C" fn(VaDisplay) -> c_int,
    query_config_profiles: unsafe extern "C" fn(VaDisplay, *mut c_int, *mut c_int) -> VaStatus,
    max_num_entrypoints: unsafe extern "C" fn(VaDisplay) -> c_int,
    query_config_entrypoints:
        unsafe extern "C" fn(VaDisplay, c_int, *mut c_int, *mut c_int) -> VaStatus,
    create_surfaces: unsafe extern "C" fn(
        VaDisplay,
        u32,
        u32,
        u32,
        *mut VaSurfaceId,
        u32,
        *mut VaSurfaceAttrib,
        u32,
    ) -> VaStatus,
    destroy_surfaces: unsafe extern "C" fn(VaDisplay, *mut VaSurfaceId, c_int) -> VaStatus,
    export_surface_handle:
        unsafe extern "C" fn(VaDisplay, VaSurfaceId, u32, u32, *mut c_void) -> VaStatus,
    sync_surface: unsafe extern "C" fn(VaDisplay, VaSurfaceId) -> VaStatus,
    create_config: unsafe extern "C" fn(
        VaDisplay,
        c_int,
        c_int,
        *mut c_void,
        c_int,
        *mut VaConfigId,
    ) -> VaStatus,
    destroy_config: unsafe extern "C" fn(VaDisplay, VaConfigId) -> VaStatus,
    create_context: unsafe extern "C" fn(
        VaDisplay,
        VaConfigId,
        c_int,
        c_int,
        c_int,
        *mut VaSurfaceId,
        c_int,
        *mut VaContextId,
    ) -> VaStatus,
    destroy_context: unsafe extern "C" fn(VaDisplay, VaContextId) -> VaStatus,
    create_buffer: unsafe extern "C" fn(
        VaDisplay,
        VaContextId,
        c_int,
        u32,
        u32,
        *mut c_void,
        *mut VaBufferId,
    ) -> VaStatus,
    destroy_buffer: unsafe extern "C" fn(VaDisplay, VaBufferId) -> VaStatus,
    begin_picture: unsafe extern "C" fn(VaDisplay, VaContextId, VaSurfaceId) -> VaStatus,
    render_picture:
        unsafe extern "C" fn(VaDisplay, VaContextId, *mut VaBufferId, c_int) -> VaStatus,
    end_picture: unsafe extern "C" fn(VaDisplay, VaContextId) -> VaStatus,
}

struct VaLib {
    _va: Library,
    _va_drm: Library,
    fns: VaFns,
}

fn check(call: &'static str, status: VaStatus) -> Result<()> {
    if status == VA_STATUS_SUCCESS {
        Ok(())
    } else {
        Err(EncodeError::Vaapi { call, status })
    }
}

macro_rules! va_sym {
    ($lib:expr, $name:literal) => {{
        // SAFETY: the symbol type matches the libva prototype.
        unsafe {
            $lib.get($name.as_bytes())
                .map(|s| *s)
                .map_err(|e| EncodeError::LibraryLoad {
                    library: "libva",
                    reason: format!(concat!($name, ": {}"), e),
                })?
        }
    }};
}

impl VaLib {
    fn load() -> Result<Self> {
        // SAFETY: opening the system VAAPI stack.
        let va = unsafe { Library::new("libva.so.2") }.map_err(|e| EncodeError::LibraryLoad {
            library: "libva.so.2",
            reason: e.to_string(),
        })?;
        // SAFETY: as above.
        let va_drm =
            unsafe { Library::new("libva-drm.so.2") }.map_err(|e| EncodeError::LibraryLoad {
                library: "libva-drm.so.2",
                reason: e.to_string(),
            })?;
        let fns = VaFns {
            get_display_drm: va_sym!(va_drm, "vaGetDisplayDRM"),
            initialize: va_sym!(va, "vaInitialize"),
            terminate: va_sym!(va, "vaTerminate"),
            max_num_profiles: va_sym!(va, "vaMaxNumProfiles"),
            query_config_profiles: va_sym!(va, "vaQueryConfigProfiles"),
            max_num_entrypoints: va_sym!(va, "vaMaxNumEntrypoints"),
            query_config_entrypoints: va_sym!(va, "vaQueryConfigEntrypoints"),
            create_surfaces: va_sym!(va, "vaCreateSurfaces"),
            destroy_surfaces: va_sym!(va, "vaDestroySurfaces"),
            export_surface_handle: va_sym!(va, "vaExportSurfaceHandle"),
            sync_surface: va_sym!(va, "vaSyncSurface"),
            create_config: va_sym!(va, "vaCreateConfig"),
            destroy_config: va_sym!(va, "vaDestroyConfig"),
            create_context: va_sym!(va, "vaCreateContext"),
            destroy_context: va_sym!(va, "vaDestroyContext"),
            create_buffer: va_sym!(va, "vaCreateBuffer"),
            destroy_buffer: va_sym!(va, "vaDestroyBuffer"),
            begin_picture: va_sym!(va, "vaBeginPicture"),
            render_picture: va_sym!(va, "vaRenderPicture"),
            end_picture: va_sym!(va, "vaEndPicture"),
        };
        Ok(Self {
            _va: va,
            _va_drm: va_drm,
            fns,
        })
    }
}

/// An initialized VA display on a render node.
pub(crate) struct VaInstance {
    lib: VaLib,
    display: VaDisplay,
    _device: File,
}

impl VaInstance {
    fn open(card_path: &str) -> Result<Self> {
        let render_path = render_node_for(card_path)?;
        let device = File::options().read(true).write(true).open(&render_path)?;
        let lib = VaLib::load()?;
        // SAFETY: device fd stays open for the VaInstance lifetime.
        let display = unsafe { (lib.fns.get_display_drm)(device.as_raw_fd()) };
        if display.is_null() {
            return Err(EncodeError::Vaapi {
                call: "vaGetDisplayDRM",
                status: -1,
            });
        }
        let (mut major, mut minor) = (0, 0);
        // SAFETY: display is valid; out-params are local.
        check("vaInitialize", unsafe {
            (lib.fns.initialize)(display, &mut major, &mut minor)
        })?;
        debug!("VAAPI {}.{} on {}", major, minor, render_path);
        Ok(Self {
            lib,
            display,
            _device: device,
        })
    }

    fn query_supported_codecs(&self) -> SupportedCodecs {
        let mut caps = SupportedCodecs::default();
        // SAFETY: display initialized; buffers sized from the max queries.
        unsafe {
            let max_profiles = (self.lib.fns.max_num_profiles)(self.display);
            let mut profiles = vec![0 as c_int; max_profiles.max(0) as usize];
            let mut num_profiles = 0;
            if (self.lib.fns.query_config_profiles)(
                self.display,
                profiles.as_mut_ptr(),
                &mut num_profiles,
            ) != VA_STATUS_SUCCESS
            {
                return caps;
            }
            profiles.truncate(num_profiles.max(0) as usize);

            for profile in profiles {
                if !self.profile_has_encode_entrypoint(profile) {
                    continue;
                }
                match profile {
                    VA_PROFILE_H264_BASELINE
                    | VA_PROFILE_H264_MAIN
                    | VA_PROFILE_H264_HIGH
                    | VA_PROFILE_H264_CONSTRAINED_BASELINE => caps.h264 = true,
                    VA_PROFILE_HEVC_MAIN => caps.hevc = true,
                    VA_PROFILE_HEVC_MAIN10 => {
                        caps.hevc_hdr = true;
                        caps.hevc_10bit = true;
                    }
                    VA_PROFILE_VP8_VERSION_0_3 => caps.vp8 = true,
                    VA_PROFILE_VP9_PROFILE0 | VA_PROFILE_VP9_PROFILE2 => caps.vp9 = true,
                    VA_PROFILE_AV1_PROFILE0 => {
                        caps.av1 = true;
                        caps.av1_hdr = true;
                        caps.av1_10bit = true;
                    }
                    _ => {}
                }
            }
        }
        caps
    }

    unsafe fn profile_has_encode_entrypoint(&self, profile: c_int) -> bool {
        // SAFETY (fn contract): display initialized.
        unsafe {
            let max = (self.lib.fns.max_num_entrypoints)(self.display);
            let mut entrypoints = vec![0 as c_int; max.max(0) as usize];
            let mut num = 0;
            if (self.lib.fns.query_config_entrypoints)(
                self.display,
                profile,
                entrypoints.as_mut_ptr(),
                &mut num,
            ) != VA_STATUS_SUCCESS
            {
                return false;
            }
            entrypoints
                .iter()
                .take(num.max(0) as usize)
                .any(|&e| e == VA_ENTRYPOINT_ENC_SLICE || e == VA_ENTRYPOINT_ENC_SLICE_LP)
        }
    }
}

impl Drop for VaInstance {
    fn drop(&mut self) {
        // SAFETY: display came from vaInitialize in open().
        unsafe {
            (self.lib.fns.terminate)(self.display);
        }
    }
}

/// Map `/dev/dri/cardN` to its render node.
fn render_node_for(card_path: &str) -> Result<String> {
    let digits: String = card_path
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    let index: u32 = digits
        .chars()
        .rev()
        .collect::<String>()
        .parse()
        .map_err(|_| EncodeError::NoRenderNode(card_path.to_string()))?;
    let render = format!("/dev/dri/renderD{}", 128 + index);
    if std::path::Path::new(&render).exists() {
        Ok(render)
    } else {
        Err(EncodeError::NoRenderNode(card_path.to_string()))
    }
}

// ---------------------------------------------------------------------------
// The adapter
// ---------------------------------------------------------------------------

/// VAAPI destination-surface adapter.
pub struct VaapiEncoder {
    runtime: Rc<GlRuntime>,
    card_path: String,
    va: Option<Rc<VaInstance>>,
    surface: Option<VaSurfaceId>,
    textures: [u32; 2],
    destination: DestinationColor,
    /// FDs of the exported surface objects; kept open while the EGL images
    /// referencing them live.
    exported_fds: Vec<OwnedFd>,
}

impl VaapiEncoder {
    pub fn new(runtime: Rc<GlRuntime>, card_path: impl Into<String>) -> Self {
        Self {
            runtime,
            card_path: card_path.into(),
            va: None,
            surface: None,
            textures: [0; 2],
            destination: DestinationColor::Nv12,
            exported_fds: Vec::new(),
        }
    }

    fn instance(&mut self) -> Result<Rc<VaInstance>> {
        if let Some(va) = &self.va {
            return Ok(Rc::clone(va));
        }
        let va = Rc::new(VaInstance::open(&self.card_path)?);
        self.va = Some(Rc::clone(&va));
        Ok(va)
    }

    /// Handle for the capture layer's direct-blit fast path.
    pub fn fast_path(&self) -> Option<VaapiFastPath> {
        self.va.as_ref().map(|va| VaapiFastPath {
            va: Rc::clone(va),
        })
    }

    pub fn supported_codecs(&mut self, cleanup: bool) -> SupportedCodecs {
        let caps = match self.instance() {
            Ok(va) => va.query_supported_codecs(),
            Err(e) => {
                warn!("VAAPI capability probe failed: {}", e);
                SupportedCodecs::default()
            }
        };
        if cleanup {
            self.va = None;
        }
        caps
    }

    pub fn start(&mut self, ctx: &mut CodecContext) -> Result<EncodeFrame> {
        let vendor = self.runtime.gpu_info().vendor;
        let requested = (ctx.width, ctx.height);
        align_dimensions(vendor, ctx);
        if (ctx.width, ctx.height) != requested && vendor == GpuVendor::Amd {
            warn!(
                "Encoded size grown to {}x{} for AMD alignment; black bars will pad the edges",
                ctx.width, ctx.height
            );
        }

        let depth = ctx.codec.depth();
        self.destination = ctx.codec.destination_color();
        let va = self.instance()?;

        let (rt_format, va_fourcc) = match depth {
            ColorDepth::Bits8 => (VA_RT_FORMAT_YUV420, VA_FOURCC_NV12),
            ColorDepth::Bits10 => (VA_RT_FORMAT_YUV420_10, VA_FOURCC_P010),
        };

        let mut surface: VaSurfaceId = 0;
        let mut pixel_format_attrib = VaSurfaceAttrib {
            kind: VA_SURFACE_ATTRIB_PIXEL_FORMAT,
            flags: VA_SURFACE_ATTRIB_SETTABLE,
            value: VaGenericValue {
                value_type: VA_GENERIC_VALUE_TYPE_INTEGER,
                value: VaGenericValueData {
                    i: va_fourcc as c_int,
                },
            },
        };
        // SAFETY: attrib array of one element, surface out-param local.
        check("vaCreateSurfaces", unsafe {
            (va.lib.fns.create_surfaces)(
                va.display,
                rt_format,
                ctx.width as u32,
                ctx.height as u32,
                &mut surface,
                1,
                &mut pixel_format_attrib,
                1,
            )
        })?;
        self.surface = Some(surface);

        let mut descriptor = VaDrmPrimeSurfaceDescriptor::default();
        // SAFETY: surface just created; descriptor is the documented
        // out-struct for DRM_PRIME_2 export.
        check("vaExportSurfaceHandle", unsafe {
            (va.lib.fns.export_surface_handle)(
                va.display,
                surface,
                VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2,
                VA_EXPORT_SURFACE_READ_WRITE | VA_EXPORT_SURFACE_SEPARATE_LAYERS,
                (&mut descriptor as *mut VaDrmPrimeSurfaceDescriptor).cast(),
            )
        })?;

        self.import_layers_as_textures(&descriptor, depth)?;
        info!(
            "VAAPI surface {}x{} {:?} exported as {} layer(s)",
            ctx.width, ctx.height, self.destination, descriptor.num_layers
        );

        Ok(EncodeFrame {
            width: ctx.width,
            height: ctx.height,
            destination: self.destination,
            storage: FrameStorage::Vaapi {
                surface_id: surface,
            },
        })
    }

    fn import_layers_as_textures(
        &mut self,
        descriptor: &VaDrmPrimeSurfaceDescriptor,
        depth: ColorDepth,
    ) -> Result<()> {
        if descriptor.num_layers < 2 {
            return Err(EncodeError::SurfaceImport(format!(
                "expected 2 layers, got {}",
                descriptor.num_layers
            )));
        }

        // Take ownership of the exported object FDs; EGL keeps its own
        // references once the image exists, but holding them until drop is
        // harmless and keeps teardown ordering trivial.
        let mut fds: Vec<OwnedFd> = Vec::new();
        for object in descriptor.objects.iter().take(descriptor.num_objects as usize) {
            // SAFETY: libva transferred these fds to us.
            fds.push(unsafe { OwnedFd::from_raw_fd_checked(object.fd)? });
        }

        let plane_formats = match depth {
            ColorDepth::Bits8 => [DRM_FORMAT_R8, DRM_FORMAT_GR88],
            ColorDepth::Bits10 => [DRM_FORMAT_R16, DRM_FORMAT_GR1616],
        };

        for (i, drm_format) in plane_formats.iter().enumerate() {
            let layer = &descriptor.layers[i];
            let object = &descriptor.objects[layer.object_index[0] as usize];
            let (width, height) = if i == 0 {
                (descriptor.width, descriptor.height)
            } else {
                (descriptor.width / 2, descriptor.height / 2)
            };

            let attribs: [isize; 17] = [
                gl::EGL_LINUX_DRM_FOURCC_EXT as isize,
                *drm_format as isize,
                gl::EGL_WIDTH as isize,
                width as isize,
                gl::EGL_HEIGHT as isize,
                height as isize,
                gl::EGL_DMA_BUF_PLANE0_FD_EXT as isize,
                fds[layer.object_index[0] as usize].as_raw_fd() as isize,
                gl::EGL_DMA_BUF_PLANE0_OFFSET_EXT as isize,
                layer.offset[0] as isize,
                gl::EGL_DMA_BUF_PLANE0_PITCH_EXT as isize,
                layer.pitch[0] as isize,
                gl::EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT as isize,
                (object.drm_format_modifier & 0xFFFF_FFFF) as isize,
                gl::EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT as isize,
                (object.drm_format_modifier >> 32) as isize,
                gl::EGL_NONE as isize,
            ];

            let image = self.runtime.create_dmabuf_image(&attribs);
            if image.is_null() {
                return Err(EncodeError::SurfaceImport(format!(
                    "EGL import of layer {} failed (0x{:x})",
                    i,
                    self.runtime.egl_error()
                )));
            }

            let texture = self.runtime.gen_texture();
            self.runtime.bind_texture(gl::GL_TEXTURE_2D, texture);
            self.runtime
                .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MIN_FILTER, gl::GL_LINEAR);
            self.runtime
                .tex_parameter_i(gl::GL_TEXTURE_2D, gl::GL_TEXTURE_MAG_FILTER, gl::GL_LINEAR);
            self.runtime.image_target_texture_2d(gl::GL_TEXTURE_2D, image);
            let gl_error = self.runtime.gl_error();
            self.runtime.bind_texture(gl::GL_TEXTURE_2D, 0);
            self.runtime.destroy_image(image);

            if gl_error != gl::GL_NO_ERROR {
                self.runtime.delete_texture(texture);
                return Err(EncodeError::SurfaceImport(format!(
                    "binding layer {i} produced GL error 0x{gl_error:x}"
                )));
            }
            self.textures[i] = texture;
        }

        self.exported_fds = fds;
        Ok(())
    }

    /// The GL textures alias the encoder surface; nothing to copy.
    pub fn copy_textures_to_frame(&mut self, _frame: &mut EncodeFrame) -> Result<()> {
        Ok(())
    }

    pub fn textures(&self) -> ([u32; 2], DestinationColor) {
        (self.textures, self.destination)
    }
}

impl Drop for VaapiEncoder {
    fn drop(&mut self) {
        for texture in self.textures {
            if texture != 0 {
                self.runtime.delete_texture(texture);
            }
        }
        if let (Some(va), Some(mut surface)) = (&self.va, self.surface) {
            // SAFETY: surface was created on this display.
            unsafe {
                (va.lib.fns.destroy_surfaces)(va.display, &mut surface, 1);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Fast path: DMA-BUF planes -> encoder surface via video processing
// ---------------------------------------------------------------------------

/// Source description for the direct blit.
#[derive(Debug)]
pub struct FastPathSource<'a> {
    pub fds: &'a [std::os::fd::BorrowedFd<'a>],
    pub offsets: &'a [u32],
    pub pitches: &'a [u32],
    pub modifier: u64,
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
}

/// Shared handle used by the KMS capture backend on AMD to blit captured
/// planes straight into the encoder surface.
pub struct VaapiFastPath {
    va: Rc<VaInstance>,
}

impl VaapiFastPath {
    /// Import the source planes as a temporary surface and vpp-blit it
    /// into `frame`'s VAAPI surface.
    pub fn copy_drm_planes_to_surface(
        &self,
        frame: &EncodeFrame,
        source: &FastPathSource<'_>,
    ) -> Result<()> {
        let FrameStorage::Vaapi { surface_id } = frame.storage else {
            return Err(EncodeError::StorageMismatch { expected: "vaapi" });
        };

        let mut descriptor = VaDrmPrimeSurfaceDescriptor {
            fourcc: source.fourcc,
            width: source.width,
            height: source.height,
            num_objects: source.fds.len() as u32,
            num_layers: 1,
            ..Default::default()
        };
        for (i, fd) in source.fds.iter().enumerate() {
            descriptor.objects[i] = VaDrmPrimeObject {
                fd: fd.as_raw_fd(),
                size: 0,
                drm_format_modifier: source.modifier,
            };
        }
        descriptor.layers[0].drm_format = source.fourcc;
        descriptor.layers[0].num_planes = source.fds.len() as u32;
        for i in 0..source.fds.len() {
            descriptor.layers[0].object_index[i] = i as u32;
            descriptor.layers[0].offset[i] = source.offsets[i];
            descriptor.layers[0].pitch[i] = source.pitches[i];
        }

        let fns = &self.va.lib.fns;
        let display = self.va.display;

        let mut attribs = [
            VaSurfaceAttrib {
                kind: VA_SURFACE_ATTRIB_MEMORY_TYPE,
                flags: VA_SURFACE_ATTRIB_SETTABLE,
                value: VaGenericValue {
                    value_type: VA_GENERIC_VALUE_TYPE_INTEGER,
                    value: VaGenericValueData {
                        i: VA_SURFACE_ATTRIB_MEM_TYPE_DRM_PRIME_2 as c_int,
                    },
                },
            },
            VaSurfaceAttrib {
                kind: VA_SURFACE_ATTRIB_EXTERNAL_BUFFER_DESCRIPTOR,
                flags: VA_SURFACE_ATTRIB_SETTABLE,
                value: VaGenericValue {
                    value_type: VA_GENERIC_VALUE_TYPE_POINTER,
                    value: VaGenericValueData {
                        ptr: (&mut descriptor as *mut VaDrmPrimeSurfaceDescriptor).cast(),
                    },
                },
            },
        ];

        let mut input_surface: VaSurfaceId = 0;
        // SAFETY: descriptor and attribs outlive the call.
        check("vaCreateSurfaces(import)", unsafe {
            (fns.create_surfaces)(
                display,
                VA_RT_FORMAT_YUV420,
                source.width,
                source.height,
                &mut input_surface,
                1,
                attribs.as_mut_ptr(),
                attribs.len() as u32,
            )
        })?;

        // Scoped teardown of the vpp chain on all exit paths.
        let result = self.run_vpp_blit(input_surface, surface_id, source, frame);

        // SAFETY: input_surface was created above.
        unsafe {
            (fns.destroy_surfaces)(display, &mut input_surface, 1);
        }
        result
    }

    fn run_vpp_blit(
        &self,
        input: VaSurfaceId,
        output: VaSurfaceId,
        source: &FastPathSource<'_>,
        frame: &EncodeFrame,
    ) -> Result<()> {
        let fns = &self.va.lib.fns;
        let display = self.va.display;

        let mut config: VaConfigId = 0;
        // SAFETY: standard vpp config creation.
        check("vaCreateConfig(vpp)", unsafe {
            (fns.create_config)(
                display,
                VA_PROFILE_NONE,
                VA_ENTRYPOINT_VIDEO_PROC,
                std::ptr::null_mut(),
                0,
                &mut config,
            )
        })?;

        let mut context: VaContextId = 0;
        let mut render_target = output;
        // SAFETY: config created above; render target list of one.
        let context_status = unsafe {
            (fns.create_context)(
                display,
                config,
                frame.width,
                frame.height,
                0,
                &mut render_target,
                1,
                &mut context,
            )
        };
        if context_status != VA_STATUS_SUCCESS {
            // SAFETY: config created above.
            unsafe { (fns.destroy_config)(display, config) };
            return Err(EncodeError::Vaapi {
                call: "vaCreateContext(vpp)",
                status: context_status,
            });
        }

        let surface_region = VaRectangle {
            x: 0,
            y: 0,
            width: source.width as u16,
            height: source.height as u16,
        };
        let output_region = VaRectangle {
            x: 0,
            y: 0,
            width: frame.width as u16,
            height: frame.height as u16,
        };
        let mut params = VaProcPipelineParameterBuffer {
            surface: input,
            surface_region: &surface_region,
            surface_color_standard: 0,
            output_region: &output_region,
            output_background_color: 0xFF00_0000,
            output_color_standard: 0,
            pipeline_flags: 0,
            filter_flags: 0,
            filters: std::ptr::null_mut(),
            num_filters: 0,
            forward_references: std::ptr::null_mut(),
            num_forward_references: 0,
            backward_references: std::ptr::null_mut(),
            num_backward_references: 0,
            rotation_state: 0,
            blend_state: std::ptr::null(),
            mirror_state: 0,
            additional_outputs: std::ptr::null_mut(),
            num_additional_outputs: 0,
            tail: [0; 8],
        };

        let mut buffer: VaBufferId = 0;
        // SAFETY: params lives across the call; size is the struct size.
        let status = unsafe {
            (fns.create_buffer)(
                display,
                context,
                VA_PROC_PIPELINE_PARAMETER_BUFFER_TYPE,
                std::mem::size_of::<VaProcPipelineParameterBuffer>() as u32,
                1,
                (&mut params as *mut VaProcPipelineParameterBuffer).cast(),
                &mut buffer,
            )
        };

        let blit = status == VA_STATUS_SUCCESS
            && {
                // SAFETY: context/buffer valid; the begin/render/end triplet
                // is the documented vpp submission sequence.
                unsafe {
                    (fns.begin_picture)(display, context, output) == VA_STATUS_SUCCESS
                        && (fns.render_picture)(display, context, &mut buffer, 1)
                            == VA_STATUS_SUCCESS
                        && (fns.end_picture)(display, context) == VA_STATUS_SUCCESS
                        && (fns.sync_surface)(display, output) == VA_STATUS_SUCCESS
                }
            };

        // SAFETY: teardown of objects created above.
        unsafe {
            if status == VA_STATUS_SUCCESS {
                (fns.destroy_buffer)(display, buffer);
            }
            (fns.destroy_context)(display, context);
            (fns.destroy_config)(display, config);
        }

        if blit {
            Ok(())
        } else {
            Err(EncodeError::Vaapi {
                call: "vpp blit",
                status: if status == VA_STATUS_SUCCESS { -1 } else { status },
            })
        }
    }
}

// OwnedFd has no fallible from_raw_fd; negative fds from a buggy driver
// would otherwise abort in the OwnedFd constructor.
trait FromRawFdChecked: Sized {
    unsafe fn from_raw_fd_checked(fd: c_int) -> std::io::Result<Self>;
}

impl FromRawFdChecked for OwnedFd {
    unsafe fn from_raw_fd_checked(fd: c_int) -> std::io::Result<Self> {
        if fd < 0 {
            return Err(std::io::Error::from_raw_os_error(libc::EBADF));
        }
        // SAFETY (fn contract): caller owns the fd.
        Ok(unsafe { std::os::fd::FromRawFd::from_raw_fd(fd) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fourcc_values() {
        assert_eq!(VA_FOURCC_NV12, 0x3231_564E);
        assert_eq!(DRM_FORMAT_R8, 0x2020_3852);
        assert_eq!(DRM_FORMAT_GR88, 0x3838_5247);
    }

    #[test]
    fn test_render_node_mapping() {
        // Only shape-checkable without hardware: a bad path errors.
        assert!(render_node_for("/dev/dri/nonsense").is_err());
    }

    #[test]
    fn test_prime_descriptor_is_fixed_layout() {
        // The descriptor crosses the libva ABI; spot-check the layout.
        assert_eq!(std::mem::size_of::<VaDrmPrimeObject>(), 16);
        assert_eq!(std::mem::size_of::<VaDrmPrimeLayer>(), 56);
    }
}
