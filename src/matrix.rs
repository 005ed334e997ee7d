//! Transform matrix computation for last-flushed buffer queries.
//!
//! Produces a column-major 4x4 texture transform mapping buffer
//! coordinates to display coordinates for a given surface transform. The
//! legacy variant ignores the crop; the v2 variant folds the damage
//! rectangle into a scale/offset so partially drawn buffers sample only
//! the valid region.

use crate::types::{ Rect, TransformType };

pub const MATRIX_SIZE: usize = 16;

const IDENTITY: [f32; MATRIX_SIZE] = [
    1.0, 0.0, 0.0, 0.0,
    0.0, 1.0, 0.0, 0.0,
    0.0, 0.0, 1.0, 0.0,
    0.0, 0.0, 0.0, 1.0,
];

/// Column-major 2D rotation/flip in texture space. Each transform maps
/// the unit square onto itself, so the matrices combine rotation with the
/// translation that re-anchors the origin.
fn transform_matrix(transform: TransformType) -> [f32; MATRIX_SIZE] {
    let mut m = IDENTITY;
    match transform {
        TransformType::RotateNone => {}
        TransformType::Rotate90 => {
            // (x, y) -> (y, 1 - x)
            m[0] = 0.0;
            m[1] = -1.0;
            m[4] = 1.0;
            m[5] = 0.0;
            m[13] = 1.0;
        }
        TransformType::Rotate180 => {
            m[0] = -1.0;
            m[5] = -1.0;
            m[12] = 1.0;
            m[13] = 1.0;
        }
        TransformType::Rotate270 => {
            m[0] = 0.0;
            m[1] = 1.0;
            m[4] = -1.0;
            m[5] = 0.0;
            m[12] = 1.0;
        }
        TransformType::FlipH => {
            m[0] = -1.0;
            m[12] = 1.0;
        }
        TransformType::FlipV => {
            m[5] = -1.0;
            m[13] = 1.0;
        }
        TransformType::FlipHRotate90 => {
            m[0] = 0.0;
            m[1] = 1.0;
            m[4] = 1.0;
            m[5] = 0.0;
        }
        TransformType::FlipVRotate90 => {
            m[0] = 0.0;
            m[1] = -1.0;
            m[4] = -1.0;
            m[5] = 0.0;
            m[12] = 1.0;
            m[13] = 1.0;
        }
    }
    m
}

fn multiply(a: &[f32; MATRIX_SIZE], b: &[f32; MATRIX_SIZE]) -> [f32; MATRIX_SIZE] {
    let mut out = [0.0f32; MATRIX_SIZE];
    for col in 0..4 {
        for row in 0..4 {
            let mut sum = 0.0;
            for k in 0..4 {
                sum += a[k * 4 + row] * b[col * 4 + k];
            }
            out[col * 4 + row] = sum;
        }
    }
    out
}

/// Legacy matrix: rotation/flip only
pub fn compute_transform_matrix(transform: TransformType) -> [f32; MATRIX_SIZE] {
    transform_matrix(transform)
}

/// V2 matrix: rotation/flip composed with the crop implied by the valid
/// region of a `buffer_width` x `buffer_height` buffer
pub fn compute_transform_matrix_v2(
    transform: TransformType,
    buffer_width: i32,
    buffer_height: i32,
    crop: &Rect
) -> [f32; MATRIX_SIZE] {
    let rotation = transform_matrix(transform);
    if buffer_width <= 0 || buffer_height <= 0 || crop.w <= 0 || crop.h <= 0 {
        return rotation;
    }
    let sx = (crop.w as f32) / (buffer_width as f32);
    let sy = (crop.h as f32) / (buffer_height as f32);
    let tx = (crop.x as f32) / (buffer_width as f32);
    let ty = (crop.y as f32) / (buffer_height as f32);
    let mut crop_matrix = IDENTITY;
    crop_matrix[0] = sx;
    crop_matrix[5] = sy;
    crop_matrix[12] = tx;
    crop_matrix[13] = ty;
    multiply(&crop_matrix, &rotation)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(m: &[f32; MATRIX_SIZE], x: f32, y: f32) -> (f32, f32) {
        (m[0] * x + m[4] * y + m[12], m[1] * x + m[5] * y + m[13])
    }

    #[test]
    fn test_identity_for_no_transform() {
        let m = compute_transform_matrix(TransformType::RotateNone);
        assert_eq!(apply(&m, 0.25, 0.75), (0.25, 0.75));
    }

    #[test]
    fn test_rotate_90_maps_unit_square() {
        let m = compute_transform_matrix(TransformType::Rotate90);
        assert_eq!(apply(&m, 1.0, 0.0), (0.0, 0.0));
        assert_eq!(apply(&m, 0.0, 0.0), (0.0, 1.0));
    }

    #[test]
    fn test_v2_full_crop_equals_v1() {
        let crop = Rect::new(0, 0, 256, 256);
        let v1 = compute_transform_matrix(TransformType::Rotate180);
        let v2 = compute_transform_matrix_v2(TransformType::Rotate180, 256, 256, &crop);
        assert_eq!(v1, v2);
    }

    #[test]
    fn test_v2_half_crop_scales() {
        let crop = Rect::new(0, 0, 128, 256);
        let m = compute_transform_matrix_v2(TransformType::RotateNone, 256, 256, &crop);
        assert_eq!(apply(&m, 1.0, 1.0), (0.5, 1.0));
    }
}
