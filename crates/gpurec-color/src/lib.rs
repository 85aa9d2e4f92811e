//! # gpurec-color
//!
//! In-GPU colorspace conversion for the gpurec capture pipeline.
//!
//! Captured frames arrive as RGB(A) textures; hardware encoders want planar
//! YUV. This crate renders the conversion on the GPU with generated GLSL:
//! one pass writes the Y plane, a second writes the interleaved UV plane at
//! half resolution (downsampled in the vertex stage). No pixel ever takes a
//! CPU round-trip.
//!
//! - **NV12** (BT.709, 8-bit) and **P010** (BT.2020, 10-bit) destinations
//! - **Limited** (studio) and **full** (PC) range matrices
//! - **BGR sources** via texture swizzle, not separate shaders
//! - **OES-external** source textures via a dedicated shader pair
//! - **Rotation** as a radians uniform on the texture coordinates
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use gpurec_color::{ColorConversion, ColorConversionParams, DestinationColor, ColorRange, SourceColor};
//!
//! let engine = ColorConversion::new(runtime, ColorConversionParams {
//!     source_color: SourceColor::Rgb,
//!     destination_color: DestinationColor::Nv12,
//!     color_range: ColorRange::Limited,
//!     destination_textures: [y_tex, uv_tex],
//!     load_external_image_shader: false,
//! })?;
//!
//! engine.clear();
//! engine.draw(source_tex, (0, 0), (1920, 1080), (0, 0), (1920, 1080), 0.0, false);
//! ```
//!
//! # Lifecycle
//!
//! The engine is rebuilt when the destination dimensions or bit depth
//! change, never per frame. A `draw` call is atomic with respect to GL
//! state: framebuffer binding 0 is restored on every exit path.

pub mod engine;
pub mod error;
pub mod matrix;
pub mod shader;
pub mod types;

pub use engine::{ColorConversion, ColorConversionParams};
pub use error::{ColorError, Result};
pub use matrix::{glsl_matrix, transform_matrix, Mat4};
pub use shader::{fragment_source, vertex_source, ShaderPlane, ShaderProgram};
pub use types::{ColorDepth, ColorRange, DestinationColor, SourceColor};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
