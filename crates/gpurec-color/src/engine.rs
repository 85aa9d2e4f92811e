//! The two-pass Y/UV conversion engine.
//!
//! Owns up to four shader programs ({Y, UV} x {internal, external texture}),
//! one framebuffer per destination plane and a single rectangle geometry.
//! `draw` renders the source texture into both planes; `clear` resets them
//! to neutral black (Y=0, U=V=0.5).
//!
//! The engine leaves framebuffer binding 0 and texture binding 0 behind on
//! every exit path so the capture backends never observe a leaked binding.

use std::rc::Rc;

use gpurec_gl::ffi::{
    GlUint, GL_ALPHA_COMPONENT, GL_BLUE_COMPONENT, GL_COLOR_BUFFER_BIT, GL_GREEN_COMPONENT,
    GL_ONE, GL_RED_COMPONENT, GL_SCISSOR_TEST, GL_TEXTURE_2D, GL_TEXTURE_EXTERNAL_OES,
    GL_TEXTURE_SWIZZLE_RGBA,
};
use gpurec_gl::GlRuntime;
use tracing::debug;

use crate::error::{ColorError, Result};
use crate::shader::{fragment_source, vertex_source, ShaderPlane, ShaderProgram};
use crate::types::{ColorRange, DestinationColor, SourceColor};

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct ColorConversionParams {
    pub source_color: SourceColor,
    pub destination_color: DestinationColor,
    pub color_range: ColorRange,

    /// Y plane and UV plane textures, owned by the encoder adapter.
    pub destination_textures: [GlUint; 2],

    /// Also build the OES-external shader pair. Latched by the capture
    /// layer once a 2D bind fails.
    pub load_external_image_shader: bool,
}

// Shader slot layout, fixed: [Y-internal, UV-internal, Y-external, UV-external].
const SLOT_Y_INTERNAL: usize = 0;
const SLOT_UV_INTERNAL: usize = 1;
const SLOT_Y_EXTERNAL: usize = 2;
const SLOT_UV_EXTERNAL: usize = 3;

const VERTICES_LEN: usize = 24;

/// GL shader pipeline converting an RGB(A) source into planar YUV.
pub struct ColorConversion {
    runtime: Rc<GlRuntime>,
    params: ColorConversionParams,
    shaders: [Option<ShaderProgram>; 4],
    framebuffers: [GlUint; 2],
    vao: GlUint,
    vbo: GlUint,
}

impl ColorConversion {
    /// Build shaders, framebuffers and the rectangle geometry.
    pub fn new(runtime: Rc<GlRuntime>, params: ColorConversionParams) -> Result<Self> {
        let mut engine = Self {
            runtime: Rc::clone(&runtime),
            params,
            shaders: [None, None, None, None],
            framebuffers: [0; 2],
            vao: 0,
            vbo: 0,
        };

        engine.shaders[SLOT_Y_INTERNAL] = Some(engine.build_shader(ShaderPlane::Y, false)?);
        engine.shaders[SLOT_UV_INTERNAL] = Some(engine.build_shader(ShaderPlane::Uv, false)?);
        if engine.params.load_external_image_shader {
            engine.shaders[SLOT_Y_EXTERNAL] = Some(engine.build_shader(ShaderPlane::Y, true)?);
            engine.shaders[SLOT_UV_EXTERNAL] = Some(engine.build_shader(ShaderPlane::Uv, true)?);
        }

        engine.build_framebuffers()?;
        engine.build_vertices();
        debug!(
            "Color conversion ready: {:?} {:?}",
            engine.params.destination_color, engine.params.color_range
        );
        Ok(engine)
    }

    fn build_shader(&self, plane: ShaderPlane, external: bool) -> Result<ShaderProgram> {
        let vertex = vertex_source(plane);
        let fragment = fragment_source(
            plane,
            self.params.destination_color,
            self.params.color_range,
            external,
        );
        ShaderProgram::new(Rc::clone(&self.runtime), &vertex, &fragment)
    }

    fn build_framebuffers(&mut self) -> Result<()> {
        let gl = &self.runtime;
        for (i, name) in ["Y", "UV"].iter().enumerate() {
            let fb = gl.gen_framebuffer();
            gl.bind_framebuffer(fb);
            gl.framebuffer_texture_2d(self.params.destination_textures[i]);
            if !gl.framebuffer_complete() {
                gl.bind_framebuffer(0);
                return Err(ColorError::FramebufferIncomplete(name));
            }
            self.framebuffers[i] = fb;
        }
        gl.bind_framebuffer(0);
        Ok(())
    }

    fn build_vertices(&mut self) {
        let gl = &self.runtime;
        self.vao = gl.gen_vertex_array();
        gl.bind_vertex_array(self.vao);

        self.vbo = gl.gen_buffer();
        gl.bind_array_buffer(self.vbo);
        gl.array_buffer_alloc_dynamic(VERTICES_LEN * std::mem::size_of::<f32>());

        // Interleaved [x, y, u, v] per vertex.
        gl.vertex_attrib_pointer_f32(0, 2, 4 * std::mem::size_of::<f32>() as i32, 0);
        gl.vertex_attrib_pointer_f32(
            1,
            2,
            4 * std::mem::size_of::<f32>() as i32,
            2 * std::mem::size_of::<f32>(),
        );
        gl.bind_vertex_array(0);
    }

    /// Render `texture_id` into the destination planes.
    ///
    /// Positions and sizes are in pixels; `source_pos`/`source_size` locate
    /// the quad in the destination, `texture_pos`/`texture_size` select the
    /// region of the source texture. `rotation` is radians counter-clockwise.
    pub fn draw(
        &self,
        texture_id: GlUint,
        source_pos: (i32, i32),
        source_size: (i32, i32),
        texture_pos: (i32, i32),
        texture_size: (i32, i32),
        rotation: f32,
        external_texture: bool,
    ) {
        let gl = &self.runtime;

        // The shader rotates texture coordinates, so the angle runs the
        // opposite way from the monitor rotation.
        let rotation = std::f32::consts::TAU - rotation;

        gl.bind_texture(GL_TEXTURE_2D, self.params.destination_textures[0]);
        let dest_size = gl.texture_size(GL_TEXTURE_2D);
        gl.bind_texture(GL_TEXTURE_2D, 0);

        let target = if external_texture {
            GL_TEXTURE_EXTERNAL_OES
        } else {
            GL_TEXTURE_2D
        };
        gl.bind_texture(target, texture_id);

        // OES-external textures cannot be size-queried.
        let mut src_tex_size = if external_texture {
            source_size
        } else {
            gl.texture_size(target)
        };

        if quarter_turn(rotation) {
            std::mem::swap(&mut src_tex_size.0, &mut src_tex_size.1);
        }

        let vertices = build_vertices(
            source_pos,
            source_size,
            texture_pos,
            texture_size,
            dest_size,
            src_tex_size,
        );
        let pos_norm = normalize_pos(source_pos, dest_size);

        self.swizzle_source(target, true);

        gl.bind_vertex_array(self.vao);
        gl.viewport(0, 0, dest_size.0, dest_size.1);
        gl.bind_array_buffer(self.vbo);
        gl.array_buffer_sub_data(&vertices);

        for (fb_index, slot) in [
            (0, if external_texture { SLOT_Y_EXTERNAL } else { SLOT_Y_INTERNAL }),
            (1, if external_texture { SLOT_UV_EXTERNAL } else { SLOT_UV_INTERNAL }),
        ] {
            let Some(shader) = self.shaders[slot].as_ref() else {
                continue;
            };
            gl.bind_framebuffer(self.framebuffers[fb_index]);
            shader.use_program();
            shader.set_rotation(rotation);
            shader.set_offset(pos_norm.0, pos_norm.1);
            gl.draw_arrays_triangles(0, 6);
        }

        gl.bind_vertex_array(0);
        gl.use_program(0);
        gl.bind_texture(target, 0);
        gl.bind_framebuffer(0);

        self.swizzle_source(target, false);
    }

    /// Restrict subsequent draws to a destination rectangle.
    ///
    /// Used when composing several sources (monitor + cursor) into one
    /// destination; pass `None` to draw unclipped again.
    pub fn set_scissor(&self, rect: Option<(i32, i32, i32, i32)>) {
        let gl = &self.runtime;
        match rect {
            Some((x, y, w, h)) => {
                gl.enable(GL_SCISSOR_TEST);
                gl.scissor(x, y, w, h);
            }
            None => gl.disable(GL_SCISSOR_TEST),
        }
    }

    /// Reset both planes to neutral black (Y=0, U=V=0.5).
    pub fn clear(&self) {
        let gl = &self.runtime;

        gl.bind_framebuffer(self.framebuffers[0]);
        gl.clear_color(0.0, 0.0, 0.0, 1.0);
        gl.clear(GL_COLOR_BUFFER_BIT);

        gl.bind_framebuffer(self.framebuffers[1]);
        gl.clear_color(0.5, 0.5, 0.0, 1.0);
        gl.clear(GL_COLOR_BUFFER_BIT);

        gl.bind_framebuffer(0);
    }

    /// Whether the external-texture shader pair is available.
    pub fn has_external_shaders(&self) -> bool {
        self.shaders[SLOT_Y_EXTERNAL].is_some()
    }

    pub fn params(&self) -> &ColorConversionParams {
        &self.params
    }

    fn swizzle_source(&self, target: u32, enable: bool) {
        if self.params.source_color != SourceColor::Bgr {
            return;
        }
        let mask = if enable {
            [GL_BLUE_COMPONENT, GL_GREEN_COMPONENT, GL_RED_COMPONENT, GL_ONE]
        } else {
            [
                GL_RED_COMPONENT,
                GL_GREEN_COMPONENT,
                GL_BLUE_COMPONENT,
                GL_ALPHA_COMPONENT,
            ]
        };
        self.runtime
            .tex_parameter_iv(target, GL_TEXTURE_SWIZZLE_RGBA, &mask);
    }
}

impl Drop for ColorConversion {
    fn drop(&mut self) {
        let gl = &self.runtime;
        if self.vbo != 0 {
            gl.delete_buffer(self.vbo);
        }
        if self.vao != 0 {
            gl.delete_vertex_array(self.vao);
        }
        for fb in self.framebuffers {
            if fb != 0 {
                gl.delete_framebuffer(fb);
            }
        }
    }
}

fn quarter_turn(rotation: f32) -> bool {
    use std::f32::consts::PI;
    (PI * 0.5 - rotation).abs() <= 0.001 || (PI * 1.5 - rotation).abs() <= 0.001
}

fn normalize_pos(pos: (i32, i32), dest: (i32, i32)) -> (f32, f32) {
    let dx = if dest.0 == 0 { 1.0 } else { dest.0 as f32 };
    let dy = if dest.1 == 0 { 1.0 } else { dest.1 as f32 };
    ((pos.0 as f32 / dx) * 2.0, (pos.1 as f32 / dy) * 2.0)
}

/// Build the interleaved rectangle vertices for one draw.
///
/// Destination extents are normalized to clip space anchored at (-1, -1);
/// the offset uniform moves the quad. Texture coordinates are normalized to
/// the source texture.
fn build_vertices(
    source_pos: (i32, i32),
    source_size: (i32, i32),
    texture_pos: (i32, i32),
    texture_size: (i32, i32),
    dest: (i32, i32),
    src_tex: (i32, i32),
) -> [f32; VERTICES_LEN] {
    let _ = source_pos; // position goes through the offset uniform
    let dx = if dest.0 == 0 { 1.0 } else { dest.0 as f32 };
    let dy = if dest.1 == 0 { 1.0 } else { dest.1 as f32 };
    let tx = if src_tex.0 == 0 { 1.0 } else { src_tex.0 as f32 };
    let ty = if src_tex.1 == 0 { 1.0 } else { src_tex.1 as f32 };

    let size = (
        (source_size.0 as f32 / dx) * 2.0,
        (source_size.1 as f32 / dy) * 2.0,
    );
    let tex_pos = (texture_pos.0 as f32 / tx, texture_pos.1 as f32 / ty);
    let tex_size = (texture_size.0 as f32 / tx, texture_size.1 as f32 / ty);

    [
        -1.0,
        -1.0 + size.1,
        tex_pos.0,
        tex_pos.1 + tex_size.1,
        -1.0,
        -1.0,
        tex_pos.0,
        tex_pos.1,
        -1.0 + size.0,
        -1.0,
        tex_pos.0 + tex_size.0,
        tex_pos.1,
        //
        -1.0,
        -1.0 + size.1,
        tex_pos.0,
        tex_pos.1 + tex_size.1,
        -1.0 + size.0,
        -1.0,
        tex_pos.0 + tex_size.0,
        tex_pos.1,
        -1.0 + size.0,
        -1.0 + size.1,
        tex_pos.0 + tex_size.0,
        tex_pos.1 + tex_size.1,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quarter_turn_detection() {
        use std::f32::consts::PI;
        assert!(quarter_turn(PI * 0.5));
        assert!(quarter_turn(PI * 1.5));
        assert!(!quarter_turn(0.0));
        assert!(!quarter_turn(PI));
    }

    #[test]
    fn test_full_frame_vertices_span_clip_space() {
        let v = build_vertices((0, 0), (1920, 1080), (0, 0), (1920, 1080), (1920, 1080), (1920, 1080));
        // Bottom-left vertex at (-1, -1), top-right at (1, 1).
        assert_eq!(v[4], -1.0);
        assert_eq!(v[5], -1.0);
        assert_eq!(v[20], 1.0);
        assert_eq!(v[21], 1.0);
        // Full texture range.
        assert_eq!(v[6], 0.0);
        assert_eq!(v[7], 0.0);
        assert_eq!(v[22], 1.0);
        assert_eq!(v[23], 1.0);
    }

    #[test]
    fn test_half_size_vertices() {
        let v = build_vertices((0, 0), (960, 540), (0, 0), (960, 540), (1920, 1080), (1920, 1080));
        // Quad covers the left half of clip space horizontally.
        assert_eq!(v[16], 0.0); // -1 + 960/1920*2
        assert_eq!(v[22], 0.5); // texcoord max
    }

    #[test]
    fn test_normalize_pos_handles_zero_dest() {
        let (x, y) = normalize_pos((10, 20), (0, 0));
        assert_eq!(x, 20.0);
        assert_eq!(y, 40.0);
    }

    #[test]
    fn test_vertices_are_deterministic() {
        // Color conversion must be a pure function of its inputs; the
        // geometry half of that is byte-identical vertex data.
        let a = build_vertices((0, 0), (1280, 720), (0, 0), (1280, 720), (1280, 720), (1280, 720));
        let b = build_vertices((0, 0), (1280, 720), (0, 0), (1280, 720), (1280, 720), (1280, 720));
        assert_eq!(a, b);
    }
}
