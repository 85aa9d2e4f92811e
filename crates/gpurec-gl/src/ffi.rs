//! Raw EGL and GL ES types, constants and function pointer signatures.
//!
//! Nothing here is linked at build time. Every entry point is resolved at
//! runtime from the vendor libraries (`libEGL.so.1`, `libGL.so.1`,
//! `libGLESv2.so.2`), matching how the rest of the stack (NvFBC, CUDA,
//! VAAPI) is loaded. Only the subset of GL ES 3.0 plus the DMA-BUF import
//! extension that the dataplane actually uses is declared.

use std::os::raw::{c_char, c_float, c_int, c_uint, c_void};

pub type EglDisplay = *mut c_void;
pub type EglConfig = *mut c_void;
pub type EglContext = *mut c_void;
pub type EglSurface = *mut c_void;
pub type EglImage = *mut c_void;
pub type EglNativeDisplay = *mut c_void;
pub type EglNativeWindow = usize;

pub type GlEnum = c_uint;
pub type GlUint = c_uint;
pub type GlInt = c_int;
pub type GlSizei = c_int;
pub type GlBoolean = u8;

pub const EGL_SUCCESS: c_int = 0x3000;
pub const EGL_NO_DISPLAY: EglDisplay = std::ptr::null_mut();
pub const EGL_NO_CONTEXT: EglContext = std::ptr::null_mut();
pub const EGL_NO_SURFACE: EglSurface = std::ptr::null_mut();
pub const EGL_NO_IMAGE: EglImage = std::ptr::null_mut();
pub const EGL_DEFAULT_DISPLAY: EglNativeDisplay = std::ptr::null_mut();

pub const EGL_NONE: c_int = 0x3038;
pub const EGL_TRUE: c_uint = 1;

pub const EGL_OPENGL_ES2_BIT: c_int = 0x0004;
pub const EGL_OPENGL_ES_API: c_uint = 0x30A0;
pub const EGL_RENDERABLE_TYPE: c_int = 0x3040;
pub const EGL_SURFACE_TYPE: c_int = 0x3033;
pub const EGL_WINDOW_BIT: c_int = 0x0004;
pub const EGL_PBUFFER_BIT: c_int = 0x0001;
pub const EGL_RED_SIZE: c_int = 0x3024;
pub const EGL_GREEN_SIZE: c_int = 0x3023;
pub const EGL_BLUE_SIZE: c_int = 0x3022;
pub const EGL_ALPHA_SIZE: c_int = 0x3021;
pub const EGL_WIDTH: c_int = 0x3057;
pub const EGL_HEIGHT: c_int = 0x3056;
pub const EGL_CONTEXT_CLIENT_VERSION: c_int = 0x3098;

pub const EGL_NATIVE_PIXMAP_KHR: c_uint = 0x30B0;
pub const EGL_LINUX_DMA_BUF_EXT: c_uint = 0x3270;
pub const EGL_LINUX_DRM_FOURCC_EXT: c_int = 0x3271;
pub const EGL_DMA_BUF_PLANE0_FD_EXT: c_int = 0x3272;
pub const EGL_DMA_BUF_PLANE0_OFFSET_EXT: c_int = 0x3273;
pub const EGL_DMA_BUF_PLANE0_PITCH_EXT: c_int = 0x3274;
pub const EGL_DMA_BUF_PLANE1_FD_EXT: c_int = 0x3275;
pub const EGL_DMA_BUF_PLANE1_OFFSET_EXT: c_int = 0x3276;
pub const EGL_DMA_BUF_PLANE1_PITCH_EXT: c_int = 0x3277;
pub const EGL_DMA_BUF_PLANE2_FD_EXT: c_int = 0x3278;
pub const EGL_DMA_BUF_PLANE2_OFFSET_EXT: c_int = 0x3279;
pub const EGL_DMA_BUF_PLANE2_PITCH_EXT: c_int = 0x327A;
pub const EGL_DMA_BUF_PLANE3_FD_EXT: c_int = 0x3440;
pub const EGL_DMA_BUF_PLANE3_OFFSET_EXT: c_int = 0x3441;
pub const EGL_DMA_BUF_PLANE3_PITCH_EXT: c_int = 0x3442;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT: c_int = 0x3443;
pub const EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT: c_int = 0x3444;
pub const EGL_DMA_BUF_PLANE1_MODIFIER_LO_EXT: c_int = 0x3445;
pub const EGL_DMA_BUF_PLANE1_MODIFIER_HI_EXT: c_int = 0x3446;
pub const EGL_DMA_BUF_PLANE2_MODIFIER_LO_EXT: c_int = 0x3447;
pub const EGL_DMA_BUF_PLANE2_MODIFIER_HI_EXT: c_int = 0x3448;
pub const EGL_DMA_BUF_PLANE3_MODIFIER_LO_EXT: c_int = 0x3449;
pub const EGL_DMA_BUF_PLANE3_MODIFIER_HI_EXT: c_int = 0x344A;

/// DRM_FORMAT_MOD_INVALID: the frame carries no explicit modifier.
pub const DRM_FORMAT_MOD_INVALID: u64 = 0x00FF_FFFF_FFFF_FFFF;

pub const GL_TEXTURE_2D: GlEnum = 0x0DE1;
pub const GL_TEXTURE_EXTERNAL_OES: GlEnum = 0x8D65;
pub const GL_TEXTURE0: GlEnum = 0x84C0;
pub const GL_TEXTURE_MIN_FILTER: GlEnum = 0x2801;
pub const GL_TEXTURE_MAG_FILTER: GlEnum = 0x2800;
pub const GL_TEXTURE_WRAP_S: GlEnum = 0x2802;
pub const GL_TEXTURE_WRAP_T: GlEnum = 0x2803;
pub const GL_CLAMP_TO_EDGE: GlInt = 0x812F;
pub const GL_LINEAR: GlInt = 0x2601;
pub const GL_NEAREST: GlInt = 0x2600;

pub const GL_RGBA: GlEnum = 0x1908;
pub const GL_BGRA: GlEnum = 0x80E1;
pub const GL_RED: GlEnum = 0x1903;
pub const GL_RG: GlEnum = 0x8227;
pub const GL_R8: GlEnum = 0x8229;
pub const GL_RG8: GlEnum = 0x822B;
pub const GL_R16: GlEnum = 0x822A;
pub const GL_RG16: GlEnum = 0x822C;
pub const GL_UNSIGNED_BYTE: GlEnum = 0x1401;
pub const GL_UNSIGNED_SHORT: GlEnum = 0x1403;
pub const GL_FLOAT: GlEnum = 0x1406;

pub const GL_FRAMEBUFFER: GlEnum = 0x8D40;
pub const GL_COLOR_ATTACHMENT0: GlEnum = 0x8CE0;
pub const GL_FRAMEBUFFER_COMPLETE: GlEnum = 0x8CD5;
pub const GL_COLOR_BUFFER_BIT: GlEnum = 0x4000;

pub const GL_ARRAY_BUFFER: GlEnum = 0x8892;
pub const GL_STATIC_DRAW: GlEnum = 0x88E4;
pub const GL_DYNAMIC_DRAW: GlEnum = 0x88E8;
pub const GL_TRIANGLES: GlEnum = 0x0004;

pub const GL_TEXTURE_SWIZZLE_RGBA: GlEnum = 0x8E46;
pub const GL_RED_COMPONENT: GlInt = 0x1903;
pub const GL_GREEN_COMPONENT: GlInt = 0x1904;
pub const GL_BLUE_COMPONENT: GlInt = 0x1905;
pub const GL_ALPHA_COMPONENT: GlInt = 0x1906;
pub const GL_ONE: GlInt = 1;

pub const GL_TEXTURE_WIDTH: GlEnum = 0x1000;
pub const GL_TEXTURE_HEIGHT: GlEnum = 0x1001;

pub const GL_VERTEX_SHADER: GlEnum = 0x8B31;
pub const GL_FRAGMENT_SHADER: GlEnum = 0x8B30;
pub const GL_COMPILE_STATUS: GlEnum = 0x8B81;
pub const GL_LINK_STATUS: GlEnum = 0x8B82;
pub const GL_INFO_LOG_LENGTH: GlEnum = 0x8B84;

pub const GL_SCISSOR_TEST: GlEnum = 0x0C11;
pub const GL_BLEND: GlEnum = 0x0BE2;
pub const GL_SRC_ALPHA: GlEnum = 0x0302;
pub const GL_ONE_MINUS_SRC_ALPHA: GlEnum = 0x0303;

pub const GL_VENDOR: GlEnum = 0x1F00;
pub const GL_RENDERER: GlEnum = 0x1F01;
pub const GL_NO_ERROR: GlEnum = 0;

pub const GL_PACK_ALIGNMENT: GlEnum = 0x0D05;
pub const GL_UNPACK_ALIGNMENT: GlEnum = 0x0CF5;

// EGL entry points.
pub type FnEglGetDisplay = unsafe extern "C" fn(EglNativeDisplay) -> EglDisplay;
pub type FnEglInitialize = unsafe extern "C" fn(EglDisplay, *mut c_int, *mut c_int) -> c_uint;
pub type FnEglTerminate = unsafe extern "C" fn(EglDisplay) -> c_uint;
pub type FnEglBindApi = unsafe extern "C" fn(c_uint) -> c_uint;
pub type FnEglChooseConfig =
    unsafe extern "C" fn(EglDisplay, *const c_int, *mut EglConfig, c_int, *mut c_int) -> c_uint;
pub type FnEglCreateContext =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglContext, *const c_int) -> EglContext;
pub type FnEglDestroyContext = unsafe extern "C" fn(EglDisplay, EglContext) -> c_uint;
pub type FnEglCreateWindowSurface =
    unsafe extern "C" fn(EglDisplay, EglConfig, EglNativeWindow, *const c_int) -> EglSurface;
pub type FnEglCreatePbufferSurface =
    unsafe extern "C" fn(EglDisplay, EglConfig, *const c_int) -> EglSurface;
pub type FnEglDestroySurface = unsafe extern "C" fn(EglDisplay, EglSurface) -> c_uint;
pub type FnEglMakeCurrent =
    unsafe extern "C" fn(EglDisplay, EglSurface, EglSurface, EglContext) -> c_uint;
pub type FnEglSwapBuffers = unsafe extern "C" fn(EglDisplay, EglSurface) -> c_uint;
pub type FnEglSwapInterval = unsafe extern "C" fn(EglDisplay, c_int) -> c_uint;
pub type FnEglGetError = unsafe extern "C" fn() -> c_int;
pub type FnEglGetProcAddress = unsafe extern "C" fn(*const c_char) -> *mut c_void;
pub type FnEglCreateImage =
    unsafe extern "C" fn(EglDisplay, EglContext, c_uint, *mut c_void, *const isize) -> EglImage;
pub type FnEglDestroyImage = unsafe extern "C" fn(EglDisplay, EglImage) -> c_uint;
pub type FnGlEglImageTargetTexture2dOes = unsafe extern "C" fn(GlEnum, *mut c_void);

// GL ES 3.0 subset.
pub type FnGlGetString = unsafe extern "C" fn(GlEnum) -> *const c_char;
pub type FnGlGetError = unsafe extern "C" fn() -> GlEnum;
pub type FnGlClear = unsafe extern "C" fn(GlEnum);
pub type FnGlClearColor = unsafe extern "C" fn(c_float, c_float, c_float, c_float);
pub type FnGlViewport = unsafe extern "C" fn(GlInt, GlInt, GlSizei, GlSizei);
pub type FnGlScissor = unsafe extern "C" fn(GlInt, GlInt, GlSizei, GlSizei);
pub type FnGlEnable = unsafe extern "C" fn(GlEnum);
pub type FnGlDisable = unsafe extern "C" fn(GlEnum);
pub type FnGlBlendFunc = unsafe extern "C" fn(GlEnum, GlEnum);
pub type FnGlFlush = unsafe extern "C" fn();
pub type FnGlFinish = unsafe extern "C" fn();
pub type FnGlPixelStorei = unsafe extern "C" fn(GlEnum, GlInt);

pub type FnGlGenTextures = unsafe extern "C" fn(GlSizei, *mut GlUint);
pub type FnGlDeleteTextures = unsafe extern "C" fn(GlSizei, *const GlUint);
pub type FnGlBindTexture = unsafe extern "C" fn(GlEnum, GlUint);
pub type FnGlActiveTexture = unsafe extern "C" fn(GlEnum);
pub type FnGlTexParameteri = unsafe extern "C" fn(GlEnum, GlEnum, GlInt);
pub type FnGlTexParameteriv = unsafe extern "C" fn(GlEnum, GlEnum, *const GlInt);
pub type FnGlGetTexLevelParameteriv = unsafe extern "C" fn(GlEnum, GlInt, GlEnum, *mut GlInt);
pub type FnGlTexImage2d = unsafe extern "C" fn(
    GlEnum,
    GlInt,
    GlInt,
    GlSizei,
    GlSizei,
    GlInt,
    GlEnum,
    GlEnum,
    *const c_void,
);
pub type FnGlTexSubImage2d = unsafe extern "C" fn(
    GlEnum,
    GlInt,
    GlInt,
    GlInt,
    GlSizei,
    GlSizei,
    GlEnum,
    GlEnum,
    *const c_void,
);
pub type FnGlGetTexImage = unsafe extern "C" fn(GlEnum, GlInt, GlEnum, GlEnum, *mut c_void);

pub type FnGlGenFramebuffers = unsafe extern "C" fn(GlSizei, *mut GlUint);
pub type FnGlDeleteFramebuffers = unsafe extern "C" fn(GlSizei, *const GlUint);
pub type FnGlBindFramebuffer = unsafe extern "C" fn(GlEnum, GlUint);
pub type FnGlFramebufferTexture2d = unsafe extern "C" fn(GlEnum, GlEnum, GlEnum, GlUint, GlInt);
pub type FnGlCheckFramebufferStatus = unsafe extern "C" fn(GlEnum) -> GlEnum;
pub type FnGlReadPixels =
    unsafe extern "C" fn(GlInt, GlInt, GlSizei, GlSizei, GlEnum, GlEnum, *mut c_void);

pub type FnGlGenVertexArrays = unsafe extern "C" fn(GlSizei, *mut GlUint);
pub type FnGlDeleteVertexArrays = unsafe extern "C" fn(GlSizei, *const GlUint);
pub type FnGlBindVertexArray = unsafe extern "C" fn(GlUint);
pub type FnGlGenBuffers = unsafe extern "C" fn(GlSizei, *mut GlUint);
pub type FnGlDeleteBuffers = unsafe extern "C" fn(GlSizei, *const GlUint);
pub type FnGlBindBuffer = unsafe extern "C" fn(GlEnum, GlUint);
pub type FnGlBufferData = unsafe extern "C" fn(GlEnum, isize, *const c_void, GlEnum);
pub type FnGlBufferSubData = unsafe extern "C" fn(GlEnum, isize, isize, *const c_void);
pub type FnGlVertexAttribPointer =
    unsafe extern "C" fn(GlUint, GlInt, GlEnum, GlBoolean, GlSizei, *const c_void);
pub type FnGlEnableVertexAttribArray = unsafe extern "C" fn(GlUint);
pub type FnGlDrawArrays = unsafe extern "C" fn(GlEnum, GlInt, GlSizei);

pub type FnGlCreateShader = unsafe extern "C" fn(GlEnum) -> GlUint;
pub type FnGlDeleteShader = unsafe extern "C" fn(GlUint);
pub type FnGlShaderSource =
    unsafe extern "C" fn(GlUint, GlSizei, *const *const c_char, *const GlInt);
pub type FnGlCompileShader = unsafe extern "C" fn(GlUint);
pub type FnGlGetShaderiv = unsafe extern "C" fn(GlUint, GlEnum, *mut GlInt);
pub type FnGlGetShaderInfoLog = unsafe extern "C" fn(GlUint, GlSizei, *mut GlSizei, *mut c_char);
pub type FnGlCreateProgram = unsafe extern "C" fn() -> GlUint;
pub type FnGlDeleteProgram = unsafe extern "C" fn(GlUint);
pub type FnGlAttachShader = unsafe extern "C" fn(GlUint, GlUint);
pub type FnGlLinkProgram = unsafe extern "C" fn(GlUint);
pub type FnGlGetProgramiv = unsafe extern "C" fn(GlUint, GlEnum, *mut GlInt);
pub type FnGlGetProgramInfoLog = unsafe extern "C" fn(GlUint, GlSizei, *mut GlSizei, *mut c_char);
pub type FnGlUseProgram = unsafe extern "C" fn(GlUint);
pub type FnGlBindAttribLocation = unsafe extern "C" fn(GlUint, GlUint, *const c_char);
pub type FnGlGetUniformLocation = unsafe extern "C" fn(GlUint, *const c_char) -> GlInt;
pub type FnGlUniform1f = unsafe extern "C" fn(GlInt, c_float);
pub type FnGlUniform2f = unsafe extern "C" fn(GlInt, c_float, c_float);
pub type FnGlUniform1i = unsafe extern "C" fn(GlInt, GlInt);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dma_buf_attribute_triples_are_contiguous() {
        // The import code indexes plane attributes arithmetically; planes
        // 0..=2 use a contiguous block, plane 3 lives in its own range.
        assert_eq!(EGL_DMA_BUF_PLANE1_FD_EXT - EGL_DMA_BUF_PLANE0_FD_EXT, 3);
        assert_eq!(EGL_DMA_BUF_PLANE2_FD_EXT - EGL_DMA_BUF_PLANE1_FD_EXT, 3);
        assert_eq!(
            EGL_DMA_BUF_PLANE0_MODIFIER_HI_EXT - EGL_DMA_BUF_PLANE0_MODIFIER_LO_EXT,
            1
        );
    }

    #[test]
    fn test_invalid_modifier_sentinel() {
        assert_eq!(DRM_FORMAT_MOD_INVALID, 0x00FF_FFFF_FFFF_FFFF);
    }
}
