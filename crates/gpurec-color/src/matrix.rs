//! RGB to YUV transform matrices.
//!
//! Four matrices cover the destination format / range grid. They are
//! embedded into the fragment shaders as `mat4` literals; the alpha row
//! carries the chroma offset (0.5) and luma offset (16/255 for limited
//! range) so the shader is a single matrix multiply.
//!
//! The limited range variants are the full range matrix scaled by
//! (235-16)/255 with 16/255 added to the luma row.

use crate::types::{ColorRange, DestinationColor};

/// Column-major 4x4 matrix, in the order GLSL's `mat4` constructor takes.
pub type Mat4 = [[f32; 4]; 4];

/// ITU-R BT.2020, full range.
pub const RGB_TO_P010_FULL: Mat4 = [
    [0.262700, -0.139630, 0.500000, 0.000000],
    [0.678000, -0.360370, -0.459786, 0.000000],
    [0.059300, 0.500000, -0.040214, 0.000000],
    [0.000000, 0.500000, 0.500000, 1.000000],
];

/// ITU-R BT.2020, limited range.
pub const RGB_TO_P010_LIMITED: Mat4 = [
    [0.225613, -0.119918, 0.429412, 0.000000],
    [0.582282, -0.309494, -0.394875, 0.000000],
    [0.050928, 0.429412, -0.034537, 0.000000],
    [0.062745, 0.500000, 0.500000, 1.000000],
];

/// ITU-R BT.709, full range. Luma coefficients 0.2110/0.7110/0.0710.
pub const RGB_TO_NV12_FULL: Mat4 = [
    [0.211000, -0.113563, 0.500000, 0.000000],
    [0.711000, -0.382670, -0.450570, 0.000000],
    [0.071000, 0.500000, -0.044994, 0.000000],
    [0.000000, 0.500000, 0.500000, 1.000000],
];

/// ITU-R BT.709, limited range.
pub const RGB_TO_NV12_LIMITED: Mat4 = [
    [0.180353, -0.096964, 0.429412, 0.000000],
    [0.609765, -0.327830, -0.385927, 0.000000],
    [0.060118, 0.429412, -0.038049, 0.000000],
    [0.062745, 0.500000, 0.500000, 1.000000],
];

/// Select the matrix for a destination format and range.
pub fn transform_matrix(destination: DestinationColor, range: ColorRange) -> &'static Mat4 {
    match (destination, range) {
        (DestinationColor::Nv12, ColorRange::Full) => &RGB_TO_NV12_FULL,
        (DestinationColor::Nv12, ColorRange::Limited) => &RGB_TO_NV12_LIMITED,
        (DestinationColor::P010, ColorRange::Full) => &RGB_TO_P010_FULL,
        (DestinationColor::P010, ColorRange::Limited) => &RGB_TO_P010_LIMITED,
    }
}

/// Render a matrix as a GLSL `const mat4 RGBtoYUV = ...;` declaration.
pub fn glsl_matrix(matrix: &Mat4) -> String {
    let mut out = String::from("const mat4 RGBtoYUV = mat4(");
    for (i, column) in matrix.iter().enumerate() {
        if i > 0 {
            out.push_str(",\n                           ");
        }
        out.push_str(&format!(
            "{:.6}, {:.6}, {:.6}, {:.6}",
            column[0], column[1], column[2], column[3]
        ));
    }
    out.push_str(");\n");
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Apply a matrix to an RGB triple the way the shader does.
    fn apply(matrix: &Mat4, rgb: [f32; 3]) -> [f32; 3] {
        let v = [rgb[0], rgb[1], rgb[2], 1.0];
        let mut out = [0.0f32; 3];
        for (row, value) in out.iter_mut().enumerate() {
            *value = (0..4).map(|col| matrix[col][row] * v[col]).sum();
        }
        out
    }

    #[test]
    fn test_white_maps_to_neutral_chroma() {
        for matrix in [
            &RGB_TO_NV12_FULL,
            &RGB_TO_NV12_LIMITED,
            &RGB_TO_P010_FULL,
            &RGB_TO_P010_LIMITED,
        ] {
            let yuv = apply(matrix, [1.0, 1.0, 1.0]);
            assert!((yuv[1] - 0.5).abs() < 0.01, "U for white: {}", yuv[1]);
            assert!((yuv[2] - 0.5).abs() < 0.01, "V for white: {}", yuv[2]);
        }
    }

    #[test]
    fn test_black_luma_matches_range() {
        let full = apply(&RGB_TO_NV12_FULL, [0.0, 0.0, 0.0]);
        assert!(full[0].abs() < 1e-6);

        // Limited range black sits at 16/255.
        let limited = apply(&RGB_TO_NV12_LIMITED, [0.0, 0.0, 0.0]);
        assert!((limited[0] - 16.0 / 255.0).abs() < 1e-4);
    }

    #[test]
    fn test_white_luma_matches_range() {
        let full = apply(&RGB_TO_P010_FULL, [1.0, 1.0, 1.0]);
        assert!((full[0] - 1.0).abs() < 0.01);

        // Limited range white sits at 235/255.
        let limited = apply(&RGB_TO_P010_LIMITED, [1.0, 1.0, 1.0]);
        assert!((limited[0] - 235.0 / 255.0).abs() < 0.01);
    }

    #[test]
    fn test_matrix_selection() {
        assert!(std::ptr::eq(
            transform_matrix(DestinationColor::Nv12, ColorRange::Full),
            &RGB_TO_NV12_FULL
        ));
        assert!(std::ptr::eq(
            transform_matrix(DestinationColor::P010, ColorRange::Limited),
            &RGB_TO_P010_LIMITED
        ));
    }

    #[test]
    fn test_glsl_rendering() {
        let glsl = glsl_matrix(&RGB_TO_NV12_FULL);
        assert!(glsl.starts_with("const mat4 RGBtoYUV = mat4("));
        assert!(glsl.contains("0.211000"));
        assert!(glsl.contains("-0.450570"));
        assert!(glsl.trim_end().ends_with(");"));
    }
}
