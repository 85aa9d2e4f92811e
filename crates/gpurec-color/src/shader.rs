//! GLSL source generation and program compilation.
//!
//! The conversion shaders are short enough to build as strings at
//! initialization. Each program comes in a Y and a UV variant, and each of
//! those in an internal (`sampler2D`) and an external (`samplerExternalOES`)
//! flavor; OES-external sources need the dedicated sampler declaration and
//! extension pragma.

use std::ffi::CString;
use std::rc::Rc;

use gpurec_gl::ffi::{GlInt, GlUint, GL_FRAGMENT_SHADER, GL_VERTEX_SHADER};
use gpurec_gl::GlRuntime;

use crate::error::{ColorError, Result};
use crate::matrix::{glsl_matrix, transform_matrix};
use crate::types::{ColorRange, DestinationColor};

const ROTATE_Z: &str = "mat4 rotate_z(in float angle) {\n\
                        \x20   return mat4(cos(angle), -sin(angle), 0.0, 0.0,\n\
                        \x20               sin(angle),  cos(angle), 0.0, 0.0,\n\
                        \x20               0.0,           0.0,      1.0, 0.0,\n\
                        \x20               0.0,           0.0,      0.0, 1.0);\n\
                        }\n";

/// Which plane a shader writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderPlane {
    Y,
    Uv,
}

/// Build the vertex shader source for a plane.
///
/// The UV variant scales clip coordinates by 0.5 and shifts by -0.5: the
/// chroma plane is downsampled 2x in both axes entirely in the vertex
/// stage.
pub fn vertex_source(plane: ShaderPlane) -> String {
    let position = match plane {
        ShaderPlane::Y => {
            "  gl_Position = vec4(offset.x, offset.y, 0.0, 0.0) + vec4(pos.x, pos.y, 0.0, 1.0);\n"
        }
        ShaderPlane::Uv => {
            "  gl_Position = (vec4(offset.x, offset.y, 0.0, 0.0) + vec4(pos.x, pos.y, 0.0, 1.0)) * vec4(0.5, 0.5, 1.0, 1.0) - vec4(0.5, 0.5, 0.0, 0.0);\n"
        }
    };
    format!(
        "#version 300 es\n\
         in vec2 pos;\n\
         in vec2 texcoords;\n\
         out vec2 texcoords_out;\n\
         uniform vec2 offset;\n\
         uniform float rotation;\n\
         {ROTATE_Z}\
         void main()\n\
         {{\n\
         \x20 texcoords_out = (vec4(texcoords.x - 0.5, texcoords.y - 0.5, 0.0, 0.0) * rotate_z(rotation)).xy + vec2(0.5, 0.5);\n\
         {position}\
         }}\n"
    )
}

/// Build the fragment shader source for a plane.
pub fn fragment_source(
    plane: ShaderPlane,
    destination: DestinationColor,
    range: ColorRange,
    external_texture: bool,
) -> String {
    let matrix = glsl_matrix(transform_matrix(destination, range));
    let (extensions, sampler) = if external_texture {
        (
            "#extension GL_OES_EGL_image_external : enable\n\
             #extension GL_OES_EGL_image_external_essl3 : require\n",
            "samplerExternalOES",
        )
    } else {
        ("", "sampler2D")
    };
    let write = match plane {
        ShaderPlane::Y => "  FragColor.x = (RGBtoYUV * vec4(pixel.rgb, 1.0)).x;\n",
        ShaderPlane::Uv => "  FragColor.xy = (RGBtoYUV * vec4(pixel.rgb, 1.0)).yz;\n",
    };
    format!(
        "#version 300 es\n\
         {extensions}\
         precision mediump float;\n\
         in vec2 texcoords_out;\n\
         uniform {sampler} tex1;\n\
         out vec4 FragColor;\n\
         {matrix}\
         void main()\n\
         {{\n\
         \x20 vec4 pixel = texture(tex1, texcoords_out);\n\
         {write}\
         \x20 FragColor.w = pixel.a;\n\
         }}\n"
    )
}

/// Uniform locations a conversion program exposes.
#[derive(Debug, Clone, Copy, Default)]
pub struct Uniforms {
    pub offset: GlInt,
    pub rotation: GlInt,
}

/// A compiled and linked conversion program.
pub struct ShaderProgram {
    runtime: Rc<GlRuntime>,
    program: GlUint,
    pub uniforms: Uniforms,
}

impl ShaderProgram {
    /// Compile `vertex` + `fragment`, binding the fixed attribute layout
    /// (`pos`=0, `texcoords`=1) before linking.
    pub fn new(runtime: Rc<GlRuntime>, vertex: &str, fragment: &str) -> Result<Self> {
        let program = compile_program(&runtime, vertex, fragment)?;
        let uniforms = Uniforms {
            offset: runtime.uniform_location(program, c"offset"),
            rotation: runtime.uniform_location(program, c"rotation"),
        };
        Ok(Self {
            runtime,
            program,
            uniforms,
        })
    }

    pub fn use_program(&self) {
        self.runtime.use_program(self.program);
    }

    pub fn set_rotation(&self, radians: f32) {
        self.runtime.uniform_1f(self.uniforms.rotation, radians);
    }

    pub fn set_offset(&self, x: f32, y: f32) {
        self.runtime.uniform_2f(self.uniforms.offset, x, y);
    }
}

impl Drop for ShaderProgram {
    fn drop(&mut self) {
        self.runtime.delete_program(self.program);
    }
}

fn compile_program(runtime: &GlRuntime, vertex: &str, fragment: &str) -> Result<GlUint> {
    let vs = compile_stage(runtime, GL_VERTEX_SHADER, vertex)?;
    let fs = match compile_stage(runtime, GL_FRAGMENT_SHADER, fragment) {
        Ok(fs) => fs,
        Err(e) => {
            runtime.delete_shader(vs);
            return Err(e);
        }
    };

    let program = runtime.create_program();
    runtime.attach_shader(program, vs);
    runtime.attach_shader(program, fs);
    runtime.bind_attrib_location(program, 0, c"pos");
    runtime.bind_attrib_location(program, 1, c"texcoords");
    let link_result = runtime.link_program(program);

    // Shaders are reference-held by the program after attach.
    runtime.delete_shader(vs);
    runtime.delete_shader(fs);

    link_result.map_err(|log| {
        runtime.delete_program(program);
        ColorError::ShaderLink(log)
    })?;
    Ok(program)
}

fn compile_stage(runtime: &GlRuntime, kind: u32, source: &str) -> Result<GlUint> {
    let shader = runtime.create_shader(kind);
    let c_source =
        CString::new(source).map_err(|_| ColorError::ShaderCompile("NUL in source".into()))?;
    runtime.shader_source(shader, &c_source);
    runtime.compile_shader(shader).map_err(|log| {
        runtime.delete_shader(shader);
        ColorError::ShaderCompile(log)
    })?;
    Ok(shader)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_source_uv_downsamples() {
        let y = vertex_source(ShaderPlane::Y);
        let uv = vertex_source(ShaderPlane::Uv);
        assert!(y.contains("rotate_z"));
        assert!(!y.contains("vec4(0.5, 0.5, 1.0, 1.0)"));
        assert!(uv.contains("vec4(0.5, 0.5, 1.0, 1.0)"));
    }

    #[test]
    fn test_fragment_source_variants() {
        let internal =
            fragment_source(ShaderPlane::Y, DestinationColor::Nv12, ColorRange::Full, false);
        assert!(internal.contains("sampler2D"));
        assert!(!internal.contains("samplerExternalOES"));
        assert!(internal.contains("FragColor.x ="));

        let external =
            fragment_source(ShaderPlane::Uv, DestinationColor::P010, ColorRange::Limited, true);
        assert!(external.contains("samplerExternalOES"));
        assert!(external.contains("GL_OES_EGL_image_external_essl3"));
        assert!(external.contains("FragColor.xy ="));
        // The P010 limited matrix shows up in the source.
        assert!(external.contains("0.225613"));
    }

    #[test]
    fn test_sources_have_no_nul() {
        for plane in [ShaderPlane::Y, ShaderPlane::Uv] {
            assert!(!vertex_source(plane).contains('\0'));
            for ext in [false, true] {
                let src =
                    fragment_source(plane, DestinationColor::Nv12, ColorRange::Limited, ext);
                assert!(!src.contains('\0'));
            }
        }
    }
}
