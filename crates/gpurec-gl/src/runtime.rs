//! The shared GL/EGL runtime.
//!
//! Created once at capture start and treated as an immutable-after-init
//! registry: capture backends, the color engine and the encoder adapters all
//! hold a non-owning handle and call into the loaded GL stack through it.
//! The GL context is pinned to the pacer thread; the runtime is deliberately
//! not `Sync`.
//!
//! Two context flavors exist:
//!
//! - **EGL** (default): a 1x1 invisible X11 window surface on X11, a pbuffer
//!   surface on Wayland. The surface is never shown; `swap_buffers` only
//!   drives the driver's frame completion.
//! - **GLX**: used for NVIDIA X11 monitor capture, because NvFBC can only
//!   latch onto a GLX context.

use std::ffi::{c_void, CStr, CString};
use std::os::raw::c_int;

use libloading::Library;
use tracing::{debug, info, warn};
use x11_dl::glx::Glx;
use x11_dl::xlib::{Display, XEvent, Xlib};

use crate::error::{GlError, Result};
use crate::ffi::{self, EglConfig, EglContext, EglDisplay, EglImage, EglSurface, GlEnum, GlInt, GlSizei, GlUint};
use crate::library::{open_first, optional, required};
use crate::monitor::{self, Monitor};
use crate::vendor::{self, GpuInfo};

/// Which display server the process is talking to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisplayServer {
    X11,
    Wayland,
}

/// Options controlling runtime creation.
#[derive(Debug, Clone, Default)]
pub struct RuntimeOptions {
    /// X11 display string; `None` uses `$DISPLAY`.
    pub display_name: Option<String>,

    /// Monitor capture is requested. Together with an NVIDIA GPU on X11
    /// this switches the context to GLX for NvFBC.
    pub is_monitor_capture: bool,
}

/// Environment variables that make the captured monitor and the rendering
/// GPU disagree under NVIDIA PRIME render offload.
const PRIME_OFFLOAD_VARS: &[&str] = &[
    "__NV_PRIME_RENDER_OFFLOAD",
    "__NV_PRIME_RENDER_OFFLOAD_PROVIDER",
    "__GLX_VENDOR_LIBRARY_NAME",
    "__VK_LAYER_NV_optimus",
];

struct EglFns {
    get_display: ffi::FnEglGetDisplay,
    initialize: ffi::FnEglInitialize,
    terminate: ffi::FnEglTerminate,
    bind_api: ffi::FnEglBindApi,
    choose_config: ffi::FnEglChooseConfig,
    create_context: ffi::FnEglCreateContext,
    destroy_context: ffi::FnEglDestroyContext,
    create_window_surface: ffi::FnEglCreateWindowSurface,
    create_pbuffer_surface: ffi::FnEglCreatePbufferSurface,
    destroy_surface: ffi::FnEglDestroySurface,
    make_current: ffi::FnEglMakeCurrent,
    swap_buffers: ffi::FnEglSwapBuffers,
    swap_interval: ffi::FnEglSwapInterval,
    get_error: ffi::FnEglGetError,
    get_proc_address: ffi::FnEglGetProcAddress,
    create_image: ffi::FnEglCreateImage,
    destroy_image: ffi::FnEglDestroyImage,
    image_target_texture_2d: ffi::FnGlEglImageTargetTexture2dOes,
}

struct GlFns {
    get_string: ffi::FnGlGetString,
    get_error: ffi::FnGlGetError,
    clear: ffi::FnGlClear,
    clear_color: ffi::FnGlClearColor,
    viewport: ffi::FnGlViewport,
    scissor: ffi::FnGlScissor,
    enable: ffi::FnGlEnable,
    disable: ffi::FnGlDisable,
    blend_func: ffi::FnGlBlendFunc,
    flush: ffi::FnGlFlush,
    finish: ffi::FnGlFinish,
    pixel_store_i: ffi::FnGlPixelStorei,
    gen_textures: ffi::FnGlGenTextures,
    delete_textures: ffi::FnGlDeleteTextures,
    bind_texture: ffi::FnGlBindTexture,
    active_texture: ffi::FnGlActiveTexture,
    tex_parameter_i: ffi::FnGlTexParameteri,
    tex_parameter_iv: ffi::FnGlTexParameteriv,
    get_tex_level_parameter_iv: ffi::FnGlGetTexLevelParameteriv,
    tex_image_2d: ffi::FnGlTexImage2d,
    tex_sub_image_2d: ffi::FnGlTexSubImage2d,
    get_tex_image: ffi::FnGlGetTexImage,
    gen_framebuffers: ffi::FnGlGenFramebuffers,
    delete_framebuffers: ffi::FnGlDeleteFramebuffers,
    bind_framebuffer: ffi::FnGlBindFramebuffer,
    framebuffer_texture_2d: ffi::FnGlFramebufferTexture2d,
    check_framebuffer_status: ffi::FnGlCheckFramebufferStatus,
    read_pixels: ffi::FnGlReadPixels,
    gen_vertex_arrays: ffi::FnGlGenVertexArrays,
    delete_vertex_arrays: ffi::FnGlDeleteVertexArrays,
    bind_vertex_array: ffi::FnGlBindVertexArray,
    gen_buffers: ffi::FnGlGenBuffers,
    delete_buffers: ffi::FnGlDeleteBuffers,
    bind_buffer: ffi::FnGlBindBuffer,
    buffer_data: ffi::FnGlBufferData,
    buffer_sub_data: ffi::FnGlBufferSubData,
    vertex_attrib_pointer: ffi::FnGlVertexAttribPointer,
    enable_vertex_attrib_array: ffi::FnGlEnableVertexAttribArray,
    draw_arrays: ffi::FnGlDrawArrays,
    create_shader: ffi::FnGlCreateShader,
    delete_shader: ffi::FnGlDeleteShader,
    shader_source: ffi::FnGlShaderSource,
    compile_shader: ffi::FnGlCompileShader,
    get_shader_iv: ffi::FnGlGetShaderiv,
    get_shader_info_log: ffi::FnGlGetShaderInfoLog,
    create_program: ffi::FnGlCreateProgram,
    delete_program: ffi::FnGlDeleteProgram,
    attach_shader: ffi::FnGlAttachShader,
    link_program: ffi::FnGlLinkProgram,
    get_program_iv: ffi::FnGlGetProgramiv,
    get_program_info_log: ffi::FnGlGetProgramInfoLog,
    use_program: ffi::FnGlUseProgram,
    bind_attrib_location: ffi::FnGlBindAttribLocation,
    get_uniform_location: ffi::FnGlGetUniformLocation,
    uniform_1f: ffi::FnGlUniform1f,
    uniform_2f: ffi::FnGlUniform2f,
    uniform_1i: ffi::FnGlUniform1i,
}

enum ContextState {
    Egl {
        display: EglDisplay,
        context: EglContext,
        surface: EglSurface,
    },
    Glx {
        glx: Glx,
        context: *mut c_void,
        fb_config: *mut c_void,
        window: u64,
    },
}

/// The loaded GL/EGL runtime. See the module docs.
pub struct GlRuntime {
    // Library handles are kept alive for the lifetime of the function
    // pointers resolved out of them.
    _egl_lib: Library,
    _gl_lib: Library,

    egl: EglFns,
    gl: GlFns,
    ctx: ContextState,

    xlib: Option<Xlib>,
    x_display: *mut Display,
    x_window: u64,

    display_server: DisplayServer,
    gpu_info: GpuInfo,
    monitors: Vec<Monitor>,
}

impl GlRuntime {
    /// Load the vendor GL stack and create the hidden rendering context.
    ///
    /// Must succeed before any other core call. Any failure here is fatal
    /// for the process (exit code 22 at the session layer).
    pub fn load(options: &RuntimeOptions) -> Result<Self> {
        for var in PRIME_OFFLOAD_VARS {
            if std::env::var_os(var).is_some() {
                warn!("Unsetting {} so capture and rendering agree on a GPU", var);
                std::env::remove_var(var);
            }
        }

        let display_server = detect_display_server();
        info!("Display server: {:?}", display_server);

        let egl_lib = open_first("libEGL", &["libEGL.so.1", "libEGL.so"])?;
        let gl_lib = open_first("libGL", &["libGL.so.1", "libGLESv2.so.2", "libGL.so"])?;

        let egl = load_egl_fns(&egl_lib, &gl_lib)?;
        let gl = load_gl_fns(&gl_lib, &egl)?;

        let (xlib, x_display) = match display_server {
            DisplayServer::X11 => {
                let xlib = Xlib::open().map_err(|_| GlError::X11DisplayOpen)?;
                let name = options
                    .display_name
                    .as_ref()
                    .map(|s| CString::new(s.as_str()).unwrap_or_default());
                let name_ptr = name.as_ref().map_or(std::ptr::null(), |n| n.as_ptr());
                // SAFETY: Xlib was loaded above; a null name means $DISPLAY.
                let dpy = unsafe { (xlib.XOpenDisplay)(name_ptr) };
                if dpy.is_null() {
                    return Err(GlError::X11DisplayOpen);
                }
                (Some(xlib), dpy)
            }
            DisplayServer::Wayland => (None, std::ptr::null_mut()),
        };

        let mut runtime = Self {
            _egl_lib: egl_lib,
            _gl_lib: gl_lib,
            egl,
            gl,
            ctx: ContextState::Egl {
                display: ffi::EGL_NO_DISPLAY,
                context: ffi::EGL_NO_CONTEXT,
                surface: ffi::EGL_NO_SURFACE,
            },
            xlib,
            x_display,
            x_window: 0,
            display_server,
            gpu_info: GpuInfo::default(),
            monitors: Vec::new(),
        };

        runtime.create_egl_context()?;
        runtime.gpu_info = runtime.query_gpu_info()?;

        // NvFBC can only attach to a GLX context, so NVIDIA X11 monitor
        // capture tears the EGL context down again and goes through GLX.
        if options.is_monitor_capture
            && display_server == DisplayServer::X11
            && runtime.gpu_info.vendor == vendor::GpuVendor::Nvidia
        {
            info!("NVIDIA X11 monitor capture: switching to a GLX context for NvFBC");
            runtime.destroy_context();
            runtime.create_glx_context()?;
            runtime.gpu_info = runtime.query_gpu_info()?;
        }

        runtime.monitors = runtime.enumerate_monitors()?;
        info!(
            "GL runtime ready: {:?}, {} monitor(s)",
            runtime.gpu_info.vendor,
            runtime.monitors.len()
        );
        Ok(runtime)
    }

    /// Which display server this runtime is connected to.
    pub fn display_server(&self) -> DisplayServer {
        self.display_server
    }

    /// Detected GPU vendor information.
    pub fn gpu_info(&self) -> &GpuInfo {
        &self.gpu_info
    }

    /// Monitors enumerated at load time.
    pub fn monitors(&self) -> &[Monitor] {
        &self.monitors
    }

    /// Find a monitor by its connector name ("DP-1", "HDMI-A-1", ...).
    pub fn find_monitor(&self, name: &str) -> Option<&Monitor> {
        self.monitors.iter().find(|m| m.name == name)
    }

    /// The X11 display pointer, null on Wayland.
    ///
    /// Capture backends use this for XComposite/XDamage/XFixes calls; they
    /// must only do so from the pacer thread.
    pub fn x11_display(&self) -> *mut Display {
        self.x_display
    }

    /// The loaded Xlib function table, `None` on Wayland.
    pub fn x11(&self) -> Option<&Xlib> {
        self.xlib.as_ref()
    }

    /// Dispatch one pending X11 event without blocking.
    ///
    /// Returns the consumed event so that the damage tracker and the capture
    /// backend can both inspect it in the same event round. Returns `None`
    /// when the queue is empty (always on Wayland: the portal backend owns
    /// its own loop thread there).
    pub fn process_event(&self) -> Option<XEvent> {
        let xlib = self.xlib.as_ref()?;
        // SAFETY: display is valid for the lifetime of the runtime; XPending
        // and XNextEvent are the standard non-blocking poll pair.
        unsafe {
            if (xlib.XPending)(self.x_display) <= 0 {
                return None;
            }
            let mut event: XEvent = std::mem::zeroed();
            (xlib.XNextEvent)(self.x_display, &mut event);
            Some(event)
        }
    }

    /// Present the hidden surface. Only drives driver frame completion;
    /// nothing is ever shown to the user.
    pub fn swap_buffers(&self) {
        match &self.ctx {
            ContextState::Egl {
                display, surface, ..
            } => {
                if !surface.is_null() {
                    // SAFETY: display/surface were created together in load().
                    unsafe { (self.egl.swap_buffers)(*display, *surface) };
                } else {
                    // Pbuffer path: nothing to present, just flush.
                    // SAFETY: trivially safe GL call on the current context.
                    unsafe { (self.gl.flush)() };
                }
            }
            ContextState::Glx { glx, window, .. } => {
                // SAFETY: GLX context was made current on this display/window.
                unsafe { (glx.glXSwapBuffers)(self.x_display as *mut _, *window) };
            }
        }
    }

    /// True when running on a GLX context (NvFBC requirement).
    pub fn is_glx(&self) -> bool {
        matches!(self.ctx, ContextState::Glx { .. })
    }

    /// The GLX context and fbconfig, for NvFBC's externally-managed
    /// context mode. `None` on EGL.
    pub fn glx_handles(&self) -> Option<(*mut c_void, *mut c_void)> {
        match &self.ctx {
            ContextState::Glx {
                context, fb_config, ..
            } => Some((*context, *fb_config)),
            ContextState::Egl { .. } => None,
        }
    }

    fn create_egl_context(&mut self) -> Result<()> {
        // SAFETY: all calls follow the EGL initialization sequence; the
        // display pointer is either a live X11 display or the default.
        unsafe {
            let native: ffi::EglNativeDisplay = match self.display_server {
                DisplayServer::X11 => self.x_display.cast(),
                DisplayServer::Wayland => ffi::EGL_DEFAULT_DISPLAY,
            };
            let display = (self.egl.get_display)(native);
            if display.is_null() {
                return Err(GlError::DisplayInit((self.egl.get_error)()));
            }
            let (mut major, mut minor) = (0, 0);
            if (self.egl.initialize)(display, &mut major, &mut minor) != ffi::EGL_TRUE {
                return Err(GlError::DisplayInit((self.egl.get_error)()));
            }
            debug!("EGL {}.{}", major, minor);
            (self.egl.bind_api)(ffi::EGL_OPENGL_ES_API);

            let surface_bit = match self.display_server {
                DisplayServer::X11 => ffi::EGL_WINDOW_BIT,
                DisplayServer::Wayland => ffi::EGL_PBUFFER_BIT,
            };
            let config_attribs = [
                ffi::EGL_SURFACE_TYPE,
                surface_bit,
                ffi::EGL_RENDERABLE_TYPE,
                ffi::EGL_OPENGL_ES2_BIT,
                ffi::EGL_RED_SIZE,
                8,
                ffi::EGL_GREEN_SIZE,
                8,
                ffi::EGL_BLUE_SIZE,
                8,
                ffi::EGL_ALPHA_SIZE,
                0,
                ffi::EGL_NONE,
            ];
            let mut config: EglConfig = std::ptr::null_mut();
            let mut num_configs = 0;
            if (self.egl.choose_config)(display, config_attribs.as_ptr(), &mut config, 1, &mut num_configs)
                != ffi::EGL_TRUE
                || num_configs == 0
            {
                return Err(GlError::NoConfig);
            }

            let context_attribs = [ffi::EGL_CONTEXT_CLIENT_VERSION, 3, ffi::EGL_NONE];
            let context =
                (self.egl.create_context)(display, config, ffi::EGL_NO_CONTEXT, context_attribs.as_ptr());
            if context.is_null() {
                return Err(GlError::ContextCreation(format!(
                    "eglCreateContext failed (0x{:x})",
                    (self.egl.get_error)()
                )));
            }

            let surface = match self.display_server {
                DisplayServer::X11 => {
                    let window = self.create_hidden_x11_window()?;
                    self.x_window = window;
                    (self.egl.create_window_surface)(display, config, window as usize, std::ptr::null())
                }
                DisplayServer::Wayland => {
                    let pbuffer_attribs =
                        [ffi::EGL_WIDTH, 1, ffi::EGL_HEIGHT, 1, ffi::EGL_NONE];
                    (self.egl.create_pbuffer_surface)(display, config, pbuffer_attribs.as_ptr())
                }
            };
            if surface.is_null() {
                (self.egl.destroy_context)(display, context);
                return Err(GlError::ContextCreation(format!(
                    "surface creation failed (0x{:x})",
                    (self.egl.get_error)()
                )));
            }

            if (self.egl.make_current)(display, surface, surface, context) != ffi::EGL_TRUE {
                (self.egl.destroy_surface)(display, surface);
                (self.egl.destroy_context)(display, context);
                return Err(GlError::ContextCreation("eglMakeCurrent failed".into()));
            }
            (self.egl.swap_interval)(display, 0);

            self.ctx = ContextState::Egl {
                display,
                context,
                surface,
            };
        }
        Ok(())
    }

    fn create_glx_context(&mut self) -> Result<()> {
        let xlib = self
            .xlib
            .as_ref()
            .ok_or_else(|| GlError::Glx("GLX requires X11".into()))?;
        let glx = Glx::open().map_err(|e| GlError::Glx(e.to_string()))?;
        // SAFETY: display is a live X11 connection; the GLX calls follow the
        // fbconfig context creation sequence.
        unsafe {
            let screen = (xlib.XDefaultScreen)(self.x_display);
            let attribs = [
                x11_dl::glx::GLX_RENDER_TYPE,
                x11_dl::glx::GLX_RGBA_BIT,
                x11_dl::glx::GLX_DRAWABLE_TYPE,
                x11_dl::glx::GLX_WINDOW_BIT,
                x11_dl::glx::GLX_DOUBLEBUFFER,
                1,
                x11_dl::glx::GLX_RED_SIZE,
                8,
                x11_dl::glx::GLX_GREEN_SIZE,
                8,
                x11_dl::glx::GLX_BLUE_SIZE,
                8,
                0,
            ];
            let mut num_configs = 0;
            let configs = (glx.glXChooseFBConfig)(
                self.x_display as *mut _,
                screen,
                attribs.as_ptr(),
                &mut num_configs,
            );
            if configs.is_null() || num_configs == 0 {
                return Err(GlError::Glx("no matching GLX fbconfig".into()));
            }
            let config = *configs;
            (xlib.XFree)(configs.cast());

            let visual = (glx.glXGetVisualFromFBConfig)(self.x_display as *mut _, config);
            if visual.is_null() {
                return Err(GlError::Glx("fbconfig has no visual".into()));
            }

            let window = self.create_hidden_x11_window()?;
            self.x_window = window;

            let context = (glx.glXCreateNewContext)(
                self.x_display as *mut _,
                config,
                x11_dl::glx::GLX_RGBA_TYPE,
                std::ptr::null_mut(),
                1,
            );
            (xlib.XFree)(visual.cast());
            if context.is_null() {
                return Err(GlError::Glx("glXCreateNewContext failed".into()));
            }
            if (glx.glXMakeCurrent)(self.x_display as *mut _, window, context) == 0 {
                (glx.glXDestroyContext)(self.x_display as *mut _, context);
                return Err(GlError::Glx("glXMakeCurrent failed".into()));
            }

            self.ctx = ContextState::Glx {
                glx,
                context: context.cast(),
                fb_config: config.cast(),
                window,
            };
        }
        Ok(())
    }

    fn create_hidden_x11_window(&self) -> Result<u64> {
        let xlib = self.xlib.as_ref().ok_or(GlError::X11DisplayOpen)?;
        // SAFETY: standard Xlib window creation; the window is never mapped.
        unsafe {
            let screen = (xlib.XDefaultScreen)(self.x_display);
            let root = (xlib.XRootWindow)(self.x_display, screen);
            let window = (xlib.XCreateSimpleWindow)(self.x_display, root, 0, 0, 1, 1, 0, 0, 0);
            if window == 0 {
                return Err(GlError::ContextCreation("XCreateSimpleWindow failed".into()));
            }
            (xlib.XFlush)(self.x_display);
            Ok(window)
        }
    }

    fn query_gpu_info(&self) -> Result<GpuInfo> {
        // SAFETY: a context is current; glGetString is valid.
        let renderer = unsafe {
            let ptr = (self.gl.get_string)(ffi::GL_RENDERER);
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        };
        // SAFETY: as above.
        let vendor_str = unsafe {
            let ptr = (self.gl.get_string)(ffi::GL_VENDOR);
            if ptr.is_null() {
                None
            } else {
                Some(CStr::from_ptr(ptr).to_string_lossy().into_owned())
            }
        };
        vendor::detect(vendor_str.as_deref(), renderer.as_deref())
    }

    fn enumerate_monitors(&self) -> Result<Vec<Monitor>> {
        match self.display_server {
            DisplayServer::X11 => {
                let xlib = self.xlib.as_ref().ok_or(GlError::X11DisplayOpen)?;
                monitor::enumerate_x11(xlib, self.x_display)
            }
            DisplayServer::Wayland => monitor::enumerate_drm(),
        }
    }

    fn destroy_context(&mut self) {
        match std::mem::replace(
            &mut self.ctx,
            ContextState::Egl {
                display: ffi::EGL_NO_DISPLAY,
                context: ffi::EGL_NO_CONTEXT,
                surface: ffi::EGL_NO_SURFACE,
            },
        ) {
            ContextState::Egl {
                display,
                context,
                surface,
            } => {
                if !display.is_null() {
                    // SAFETY: tearing down objects created in create_egl_context.
                    unsafe {
                        (self.egl.make_current)(
                            display,
                            ffi::EGL_NO_SURFACE,
                            ffi::EGL_NO_SURFACE,
                            ffi::EGL_NO_CONTEXT,
                        );
                        if !surface.is_null() {
                            (self.egl.destroy_surface)(display, surface);
                        }
                        if !context.is_null() {
                            (self.egl.destroy_context)(display, context);
                        }
                        (self.egl.terminate)(display);
                    }
                }
            }
            ContextState::Glx { glx, context, .. } => {
                // SAFETY: tearing down objects created in create_glx_context.
                unsafe {
                    (glx.glXMakeCurrent)(self.x_display as *mut _, 0, std::ptr::null_mut());
                    (glx.glXDestroyContext)(self.x_display as *mut _, context.cast());
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // EGL image import (DMA-BUF)
    // ------------------------------------------------------------------

    /// Create an EGL image from a prepared DMA-BUF attribute list.
    ///
    /// The attribute list is built by the capture layer (it owns the plane
    /// FDs). Returns a null image on failure; the caller inspects
    /// [`GlRuntime::egl_error`].
    pub fn create_dmabuf_image(&self, attribs: &[isize]) -> EglImage {
        let display = self.egl_display();
        // SAFETY: attribs is a valid EGL_NONE-terminated attribute list.
        unsafe {
            (self.egl.create_image)(
                display,
                ffi::EGL_NO_CONTEXT,
                ffi::EGL_LINUX_DMA_BUF_EXT,
                std::ptr::null_mut(),
                attribs.as_ptr(),
            )
        }
    }

    /// Create an EGL image from an X11 pixmap (XComposite window capture).
    pub fn create_pixmap_image(&self, pixmap: u64) -> EglImage {
        // SAFETY: the pixmap id is passed as the buffer handle per
        // EGL_KHR_image_pixmap; a null attrib list is allowed.
        unsafe {
            (self.egl.create_image)(
                self.egl_display(),
                ffi::EGL_NO_CONTEXT,
                ffi::EGL_NATIVE_PIXMAP_KHR,
                pixmap as *mut c_void,
                std::ptr::null(),
            )
        }
    }

    /// Destroy an EGL image created by [`GlRuntime::create_dmabuf_image`].
    pub fn destroy_image(&self, image: EglImage) {
        if image.is_null() {
            return;
        }
        // SAFETY: image came from create_dmabuf_image on this display.
        unsafe {
            (self.egl.destroy_image)(self.egl_display(), image);
        }
    }

    /// Bind `image` to the texture currently bound at `target`.
    pub fn image_target_texture_2d(&self, target: GlEnum, image: EglImage) {
        // SAFETY: extension pointer resolved at load; image/target validity
        // is the caller's contract.
        unsafe { (self.egl.image_target_texture_2d)(target, image) }
    }

    /// Last EGL error code.
    pub fn egl_error(&self) -> c_int {
        // SAFETY: trivially safe query.
        unsafe { (self.egl.get_error)() }
    }

    fn egl_display(&self) -> EglDisplay {
        match &self.ctx {
            ContextState::Egl { display, .. } => *display,
            // GLX contexts still keep an initialized EGL display around for
            // DMA-BUF import; NvFBC capture does not use EGL images though.
            ContextState::Glx { .. } => ffi::EGL_NO_DISPLAY,
        }
    }

    // ------------------------------------------------------------------
    // GL wrappers. Thin by design: the callers are the color engine and
    // the encoder adapters, which manage GL object lifetimes themselves.
    // ------------------------------------------------------------------

    pub fn gen_texture(&self) -> GlUint {
        let mut id = 0;
        // SAFETY: valid GL call on the current context.
        unsafe { (self.gl.gen_textures)(1, &mut id) };
        id
    }

    pub fn delete_texture(&self, id: GlUint) {
        // SAFETY: deleting 0 or a valid texture id is defined behavior.
        unsafe { (self.gl.delete_textures)(1, &id) };
    }

    pub fn bind_texture(&self, target: GlEnum, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.bind_texture)(target, id) };
    }

    pub fn active_texture(&self, unit: GlEnum) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.active_texture)(unit) };
    }

    pub fn tex_parameter_i(&self, target: GlEnum, pname: GlEnum, value: GlInt) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.tex_parameter_i)(target, pname, value) };
    }

    pub fn tex_parameter_iv(&self, target: GlEnum, pname: GlEnum, values: &[GlInt; 4]) {
        // SAFETY: valid GL call with a 4-element parameter vector.
        unsafe { (self.gl.tex_parameter_iv)(target, pname, values.as_ptr()) };
    }

    /// Query the bound texture's level-0 size.
    pub fn texture_size(&self, target: GlEnum) -> (i32, i32) {
        let (mut w, mut h) = (0, 0);
        // SAFETY: valid GL queries on the bound texture.
        unsafe {
            (self.gl.get_tex_level_parameter_iv)(target, 0, ffi::GL_TEXTURE_WIDTH, &mut w);
            (self.gl.get_tex_level_parameter_iv)(target, 0, ffi::GL_TEXTURE_HEIGHT, &mut h);
        }
        (w, h)
    }

    /// Allocate immutable-size storage for the bound texture (no pixels).
    pub fn tex_storage_2d(&self, target: GlEnum, internal: GlEnum, width: i32, height: i32) {
        // SAFETY: glTexImage2D with a null pointer allocates storage only.
        unsafe {
            (self.gl.tex_image_2d)(
                target,
                0,
                internal as GlInt,
                width,
                height,
                0,
                upload_format_for(internal),
                upload_type_for(internal),
                std::ptr::null(),
            );
        }
    }

    pub fn tex_sub_image_2d(
        &self,
        target: GlEnum,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        format: GlEnum,
        ty: GlEnum,
        data: &[u8],
    ) {
        // SAFETY: caller guarantees data covers width*height pixels of the
        // given format.
        unsafe {
            (self.gl.tex_sub_image_2d)(target, 0, x, y, width, height, format, ty, data.as_ptr().cast());
        }
    }

    /// Read back the bound texture into `out` (software encoder path).
    pub fn get_tex_image(&self, target: GlEnum, format: GlEnum, ty: GlEnum, out: &mut [u8]) {
        // SAFETY: caller sizes `out` for the bound texture dimensions.
        unsafe { (self.gl.get_tex_image)(target, 0, format, ty, out.as_mut_ptr().cast()) };
    }

    /// Read back a rectangle of the bound framebuffer.
    pub fn read_pixels(
        &self,
        x: i32,
        y: i32,
        width: i32,
        height: i32,
        format: GlEnum,
        ty: GlEnum,
        out: &mut [u8],
    ) {
        // SAFETY: caller sizes `out` for width*height pixels of `format`.
        unsafe { (self.gl.read_pixels)(x, y, width, height, format, ty, out.as_mut_ptr().cast()) };
    }

    pub fn pixel_store_pack_alignment(&self, alignment: GlInt) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.pixel_store_i)(ffi::GL_PACK_ALIGNMENT, alignment) };
    }

    pub fn pixel_store_unpack_alignment(&self, alignment: GlInt) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.pixel_store_i)(ffi::GL_UNPACK_ALIGNMENT, alignment) };
    }

    pub fn gen_framebuffer(&self) -> GlUint {
        let mut id = 0;
        // SAFETY: valid GL call.
        unsafe { (self.gl.gen_framebuffers)(1, &mut id) };
        id
    }

    pub fn delete_framebuffer(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.delete_framebuffers)(1, &id) };
    }

    pub fn bind_framebuffer(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.bind_framebuffer)(ffi::GL_FRAMEBUFFER, id) };
    }

    pub fn framebuffer_texture_2d(&self, texture: GlUint) {
        // SAFETY: attaches to the currently bound framebuffer.
        unsafe {
            (self.gl.framebuffer_texture_2d)(
                ffi::GL_FRAMEBUFFER,
                ffi::GL_COLOR_ATTACHMENT0,
                ffi::GL_TEXTURE_2D,
                texture,
                0,
            );
        }
    }

    pub fn framebuffer_complete(&self) -> bool {
        // SAFETY: valid GL query.
        unsafe { (self.gl.check_framebuffer_status)(ffi::GL_FRAMEBUFFER) == ffi::GL_FRAMEBUFFER_COMPLETE }
    }

    pub fn gen_vertex_array(&self) -> GlUint {
        let mut id = 0;
        // SAFETY: valid GL call.
        unsafe { (self.gl.gen_vertex_arrays)(1, &mut id) };
        id
    }

    pub fn delete_vertex_array(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.delete_vertex_arrays)(1, &id) };
    }

    pub fn bind_vertex_array(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.bind_vertex_array)(id) };
    }

    pub fn gen_buffer(&self) -> GlUint {
        let mut id = 0;
        // SAFETY: valid GL call.
        unsafe { (self.gl.gen_buffers)(1, &mut id) };
        id
    }

    pub fn delete_buffer(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.delete_buffers)(1, &id) };
    }

    pub fn bind_array_buffer(&self, id: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.bind_buffer)(ffi::GL_ARRAY_BUFFER, id) };
    }

    pub fn array_buffer_data_static(&self, data: &[f32]) {
        // SAFETY: uploads `data` into the bound array buffer.
        unsafe {
            (self.gl.buffer_data)(
                ffi::GL_ARRAY_BUFFER,
                std::mem::size_of_val(data) as isize,
                data.as_ptr().cast(),
                ffi::GL_STATIC_DRAW,
            );
        }
    }

    /// Allocate a dynamic array buffer of `bytes` with no initial data.
    pub fn array_buffer_alloc_dynamic(&self, bytes: usize) {
        // SAFETY: null data pointer allocates storage only.
        unsafe {
            (self.gl.buffer_data)(
                ffi::GL_ARRAY_BUFFER,
                bytes as isize,
                std::ptr::null(),
                ffi::GL_DYNAMIC_DRAW,
            );
        }
    }

    /// Replace the start of the bound array buffer.
    pub fn array_buffer_sub_data(&self, data: &[f32]) {
        // SAFETY: caller allocated at least `data` bytes in the buffer.
        unsafe {
            (self.gl.buffer_sub_data)(
                ffi::GL_ARRAY_BUFFER,
                0,
                std::mem::size_of_val(data) as isize,
                data.as_ptr().cast(),
            );
        }
    }

    pub fn vertex_attrib_pointer_f32(&self, index: GlUint, size: GlInt, stride: GlSizei, offset: usize) {
        // SAFETY: describes the bound array buffer layout.
        unsafe {
            (self.gl.vertex_attrib_pointer)(index, size, ffi::GL_FLOAT, 0, stride, offset as *const c_void);
            (self.gl.enable_vertex_attrib_array)(index);
        }
    }

    pub fn draw_arrays_triangles(&self, first: GlInt, count: GlSizei) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.draw_arrays)(ffi::GL_TRIANGLES, first, count) };
    }

    pub fn viewport(&self, x: i32, y: i32, width: i32, height: i32) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.viewport)(x, y, width, height) };
    }

    pub fn scissor(&self, x: i32, y: i32, width: i32, height: i32) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.scissor)(x, y, width, height) };
    }

    pub fn enable(&self, cap: GlEnum) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.enable)(cap) };
    }

    pub fn disable(&self, cap: GlEnum) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.disable)(cap) };
    }

    pub fn blend_func(&self, src: GlEnum, dst: GlEnum) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.blend_func)(src, dst) };
    }

    pub fn clear_color(&self, r: f32, g: f32, b: f32, a: f32) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.clear_color)(r, g, b, a) };
    }

    pub fn clear(&self, mask: GlEnum) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.clear)(mask) };
    }

    pub fn flush(&self) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.flush)() };
    }

    pub fn finish(&self) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.finish)() };
    }

    pub fn gl_error(&self) -> GlEnum {
        // SAFETY: valid GL query.
        unsafe { (self.gl.get_error)() }
    }

    // Shader plumbing, used by gpurec-color.

    pub fn create_shader(&self, kind: GlEnum) -> GlUint {
        // SAFETY: valid GL call.
        unsafe { (self.gl.create_shader)(kind) }
    }

    pub fn shader_source(&self, shader: GlUint, source: &CStr) {
        let ptr = source.as_ptr();
        // SAFETY: null-terminated single-string upload.
        unsafe { (self.gl.shader_source)(shader, 1, &ptr, std::ptr::null()) };
    }

    pub fn compile_shader(&self, shader: GlUint) -> std::result::Result<(), String> {
        // SAFETY: valid GL calls; info log buffer is sized from the query.
        unsafe {
            (self.gl.compile_shader)(shader);
            let mut status = 0;
            (self.gl.get_shader_iv)(shader, ffi::GL_COMPILE_STATUS, &mut status);
            if status != 0 {
                return Ok(());
            }
            let mut buf = vec![0u8; 1024];
            let mut written: GlSizei = 0;
            (self.gl.get_shader_info_log)(
                shader,
                buf.len() as GlSizei,
                &mut written,
                buf.as_mut_ptr().cast(),
            );
            Err(log_to_string(buf, written))
        }
    }

    pub fn delete_shader(&self, shader: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.delete_shader)(shader) };
    }

    pub fn create_program(&self) -> GlUint {
        // SAFETY: valid GL call.
        unsafe { (self.gl.create_program)() }
    }

    pub fn delete_program(&self, program: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.delete_program)(program) };
    }

    pub fn attach_shader(&self, program: GlUint, shader: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.attach_shader)(program, shader) };
    }

    pub fn bind_attrib_location(&self, program: GlUint, index: GlUint, name: &CStr) {
        // SAFETY: valid GL call with null-terminated name.
        unsafe { (self.gl.bind_attrib_location)(program, index, name.as_ptr()) };
    }

    pub fn link_program(&self, program: GlUint) -> std::result::Result<(), String> {
        // SAFETY: valid GL calls; info log buffer is sized from the query.
        unsafe {
            (self.gl.link_program)(program);
            let mut status = 0;
            (self.gl.get_program_iv)(program, ffi::GL_LINK_STATUS, &mut status);
            if status != 0 {
                return Ok(());
            }
            let mut buf = vec![0u8; 1024];
            let mut written: GlSizei = 0;
            (self.gl.get_program_info_log)(
                program,
                buf.len() as GlSizei,
                &mut written,
                buf.as_mut_ptr().cast(),
            );
            Err(log_to_string(buf, written))
        }
    }

    pub fn use_program(&self, program: GlUint) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.use_program)(program) };
    }

    pub fn uniform_location(&self, program: GlUint, name: &CStr) -> GlInt {
        // SAFETY: valid GL call with null-terminated name.
        unsafe { (self.gl.get_uniform_location)(program, name.as_ptr()) }
    }

    pub fn uniform_1f(&self, location: GlInt, value: f32) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.uniform_1f)(location, value) };
    }

    pub fn uniform_2f(&self, location: GlInt, x: f32, y: f32) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.uniform_2f)(location, x, y) };
    }

    pub fn uniform_1i(&self, location: GlInt, value: GlInt) {
        // SAFETY: valid GL call.
        unsafe { (self.gl.uniform_1i)(location, value) };
    }
}

impl Drop for GlRuntime {
    fn drop(&mut self) {
        self.destroy_context();
        if let (Some(xlib), false) = (self.xlib.as_ref(), self.x_display.is_null()) {
            // SAFETY: display was opened in load(); window may be 0.
            unsafe {
                if self.x_window != 0 {
                    (xlib.XDestroyWindow)(self.x_display, self.x_window);
                }
                (xlib.XCloseDisplay)(self.x_display);
            }
        }
    }
}

fn detect_display_server() -> DisplayServer {
    // WAYLAND_DISPLAY wins even when an Xwayland DISPLAY is also exported:
    // capturing through X11 under a Wayland compositor only sees Xwayland
    // clients.
    if std::env::var_os("WAYLAND_DISPLAY").is_some() {
        DisplayServer::Wayland
    } else {
        DisplayServer::X11
    }
}

fn upload_format_for(internal: GlEnum) -> GlEnum {
    match internal {
        ffi::GL_R8 | ffi::GL_R16 => ffi::GL_RED,
        ffi::GL_RG8 | ffi::GL_RG16 => ffi::GL_RG,
        _ => ffi::GL_RGBA,
    }
}

fn upload_type_for(internal: GlEnum) -> GlEnum {
    match internal {
        ffi::GL_R16 | ffi::GL_RG16 => ffi::GL_UNSIGNED_SHORT,
        _ => ffi::GL_UNSIGNED_BYTE,
    }
}

fn log_to_string(mut buf: Vec<u8>, written: GlSizei) -> String {
    buf.truncate(written.max(0) as usize);
    String::from_utf8_lossy(&buf).into_owned()
}

fn load_egl_fns(egl_lib: &Library, gl_lib: &Library) -> Result<EglFns> {
    let get_proc_address: ffi::FnEglGetProcAddress =
        required(egl_lib, "libEGL", "eglGetProcAddress")?;

    // Extension entry points are only reachable through eglGetProcAddress.
    let lookup_ext = |name: &CStr| -> *mut c_void {
        // SAFETY: eglGetProcAddress accepts any null-terminated name.
        unsafe { get_proc_address(name.as_ptr()) }
    };
    let image_target = lookup_ext(c"glEGLImageTargetTexture2DOES");
    if image_target.is_null() {
        return Err(GlError::MissingSymbol {
            library: "libEGL",
            symbol: "glEGLImageTargetTexture2DOES",
        });
    }
    let _ = gl_lib; // GL ES entry points resolved separately.

    Ok(EglFns {
        get_display: required(egl_lib, "libEGL", "eglGetDisplay")?,
        initialize: required(egl_lib, "libEGL", "eglInitialize")?,
        terminate: required(egl_lib, "libEGL", "eglTerminate")?,
        bind_api: required(egl_lib, "libEGL", "eglBindAPI")?,
        choose_config: required(egl_lib, "libEGL", "eglChooseConfig")?,
        create_context: required(egl_lib, "libEGL", "eglCreateContext")?,
        destroy_context: required(egl_lib, "libEGL", "eglDestroyContext")?,
        create_window_surface: required(egl_lib, "libEGL", "eglCreateWindowSurface")?,
        create_pbuffer_surface: required(egl_lib, "libEGL", "eglCreatePbufferSurface")?,
        destroy_surface: required(egl_lib, "libEGL", "eglDestroySurface")?,
        make_current: required(egl_lib, "libEGL", "eglMakeCurrent")?,
        swap_buffers: required(egl_lib, "libEGL", "eglSwapBuffers")?,
        swap_interval: required(egl_lib, "libEGL", "eglSwapInterval")?,
        get_error: required(egl_lib, "libEGL", "eglGetError")?,
        get_proc_address,
        create_image: required(egl_lib, "libEGL", "eglCreateImage")?,
        destroy_image: required(egl_lib, "libEGL", "eglDestroyImage")?,
        // SAFETY: non-null checked above; the OES signature is fixed.
        image_target_texture_2d: unsafe { std::mem::transmute(image_target) },
    })
}

macro_rules! gl_fn {
    ($gl_lib:expr, $egl:expr, $name:literal) => {{
        match optional($gl_lib, $name) {
            Some(f) => f,
            None => {
                let cname = CString::new($name).unwrap_or_default();
                // SAFETY: eglGetProcAddress accepts any name; returns null
                // when unknown, which we map to MissingSymbol.
                let ptr = unsafe { ($egl.get_proc_address)(cname.as_ptr()) };
                if ptr.is_null() {
                    return Err(GlError::MissingSymbol {
                        library: "libGL",
                        symbol: $name,
                    });
                }
                // SAFETY: signature fixed by the GL specification.
                unsafe { std::mem::transmute(ptr) }
            }
        }
    }};
}

fn load_gl_fns(gl_lib: &Library, egl: &EglFns) -> Result<GlFns> {
    Ok(GlFns {
        get_string: gl_fn!(gl_lib, egl, "glGetString"),
        get_error: gl_fn!(gl_lib, egl, "glGetError"),
        clear: gl_fn!(gl_lib, egl, "glClear"),
        clear_color: gl_fn!(gl_lib, egl, "glClearColor"),
        viewport: gl_fn!(gl_lib, egl, "glViewport"),
        scissor: gl_fn!(gl_lib, egl, "glScissor"),
        enable: gl_fn!(gl_lib, egl, "glEnable"),
        disable: gl_fn!(gl_lib, egl, "glDisable"),
        blend_func: gl_fn!(gl_lib, egl, "glBlendFunc"),
        flush: gl_fn!(gl_lib, egl, "glFlush"),
        finish: gl_fn!(gl_lib, egl, "glFinish"),
        pixel_store_i: gl_fn!(gl_lib, egl, "glPixelStorei"),
        gen_textures: gl_fn!(gl_lib, egl, "glGenTextures"),
        delete_textures: gl_fn!(gl_lib, egl, "glDeleteTextures"),
        bind_texture: gl_fn!(gl_lib, egl, "glBindTexture"),
        active_texture: gl_fn!(gl_lib, egl, "glActiveTexture"),
        tex_parameter_i: gl_fn!(gl_lib, egl, "glTexParameteri"),
        tex_parameter_iv: gl_fn!(gl_lib, egl, "glTexParameteriv"),
        get_tex_level_parameter_iv: gl_fn!(gl_lib, egl, "glGetTexLevelParameteriv"),
        tex_image_2d: gl_fn!(gl_lib, egl, "glTexImage2D"),
        tex_sub_image_2d: gl_fn!(gl_lib, egl, "glTexSubImage2D"),
        get_tex_image: gl_fn!(gl_lib, egl, "glGetTexImage"),
        gen_framebuffers: gl_fn!(gl_lib, egl, "glGenFramebuffers"),
        delete_framebuffers: gl_fn!(gl_lib, egl, "glDeleteFramebuffers"),
        bind_framebuffer: gl_fn!(gl_lib, egl, "glBindFramebuffer"),
        framebuffer_texture_2d: gl_fn!(gl_lib, egl, "glFramebufferTexture2D"),
        check_framebuffer_status: gl_fn!(gl_lib, egl, "glCheckFramebufferStatus"),
        read_pixels: gl_fn!(gl_lib, egl, "glReadPixels"),
        gen_vertex_arrays: gl_fn!(gl_lib, egl, "glGenVertexArrays"),
        delete_vertex_arrays: gl_fn!(gl_lib, egl, "glDeleteVertexArrays"),
        bind_vertex_array: gl_fn!(gl_lib, egl, "glBindVertexArray"),
        gen_buffers: gl_fn!(gl_lib, egl, "glGenBuffers"),
        delete_buffers: gl_fn!(gl_lib, egl, "glDeleteBuffers"),
        bind_buffer: gl_fn!(gl_lib, egl, "glBindBuffer"),
        buffer_data: gl_fn!(gl_lib, egl, "glBufferData"),
        buffer_sub_data: gl_fn!(gl_lib, egl, "glBufferSubData"),
        vertex_attrib_pointer: gl_fn!(gl_lib, egl, "glVertexAttribPointer"),
        enable_vertex_attrib_array: gl_fn!(gl_lib, egl, "glEnableVertexAttribArray"),
        draw_arrays: gl_fn!(gl_lib, egl, "glDrawArrays"),
        create_shader: gl_fn!(gl_lib, egl, "glCreateShader"),
        delete_shader: gl_fn!(gl_lib, egl, "glDeleteShader"),
        shader_source: gl_fn!(gl_lib, egl, "glShaderSource"),
        compile_shader: gl_fn!(gl_lib, egl, "glCompileShader"),
        get_shader_iv: gl_fn!(gl_lib, egl, "glGetShaderiv"),
        get_shader_info_log: gl_fn!(gl_lib, egl, "glGetShaderInfoLog"),
        create_program: gl_fn!(gl_lib, egl, "glCreateProgram"),
        delete_program: gl_fn!(gl_lib, egl, "glDeleteProgram"),
        attach_shader: gl_fn!(gl_lib, egl, "glAttachShader"),
        link_program: gl_fn!(gl_lib, egl, "glLinkProgram"),
        get_program_iv: gl_fn!(gl_lib, egl, "glGetProgramiv"),
        get_program_info_log: gl_fn!(gl_lib, egl, "glGetProgramInfoLog"),
        use_program: gl_fn!(gl_lib, egl, "glUseProgram"),
        bind_attrib_location: gl_fn!(gl_lib, egl, "glBindAttribLocation"),
        get_uniform_location: gl_fn!(gl_lib, egl, "glGetUniformLocation"),
        uniform_1f: gl_fn!(gl_lib, egl, "glUniform1f"),
        uniform_2f: gl_fn!(gl_lib, egl, "glUniform2f"),
        uniform_1i: gl_fn!(gl_lib, egl, "glUniform1i"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_server_detection_prefers_wayland() {
        // Can't mutate the real environment safely in parallel tests, so
        // only pin down the pure helpers here.
        assert_eq!(upload_format_for(ffi::GL_R8), ffi::GL_RED);
        assert_eq!(upload_format_for(ffi::GL_RG16), ffi::GL_RG);
        assert_eq!(upload_type_for(ffi::GL_R16), ffi::GL_UNSIGNED_SHORT);
        assert_eq!(upload_type_for(ffi::GL_RG8), ffi::GL_UNSIGNED_BYTE);
    }
}
