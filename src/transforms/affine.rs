//! 4x4 homogeneous affine transforms applied to streamline points.
//!
//! Matrices are stored row-major in f64. Points stay in f32 (the on-disk
//! precision) and are promoted to f64 only while being transformed.

use crate::error::{Error, Result};
use rayon::prelude::*;

/// Number of points above which point transforms run in parallel.
const PARALLEL_THRESHOLD: usize = 1 << 16;

/// A 4x4 affine matrix acting on homogeneous 3D points.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Affine(pub(crate) [[f64; 4]; 4]);

impl Default for Affine {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl From<[[f64; 4]; 4]> for Affine {
    fn from(matrix: [[f64; 4]; 4]) -> Self {
        Self(matrix)
    }
}

impl Affine {
    /// The identity transform.
    pub const IDENTITY: Self = Self([
        [1.0, 0.0, 0.0, 0.0],
        [0.0, 1.0, 0.0, 0.0],
        [0.0, 0.0, 1.0, 0.0],
        [0.0, 0.0, 0.0, 1.0],
    ]);

    /// Wrap a row-major matrix.
    pub const fn new(matrix: [[f64; 4]; 4]) -> Self {
        Self(matrix)
    }

    /// Build from an f32 matrix, as stored in TRK headers.
    pub fn from_f32(matrix: [[f32; 4]; 4]) -> Self {
        let mut out = [[0.0f64; 4]; 4];
        for (row, src) in out.iter_mut().zip(matrix.iter()) {
            for (dst, &v) in row.iter_mut().zip(src.iter()) {
                *dst = v as f64;
            }
        }
        Self(out)
    }

    /// Downcast to f32 for serialization.
    pub fn to_f32(&self) -> [[f32; 4]; 4] {
        let mut out = [[0.0f32; 4]; 4];
        for (row, src) in out.iter_mut().zip(self.0.iter()) {
            for (dst, &v) in row.iter_mut().zip(src.iter()) {
                *dst = v as f32;
            }
        }
        out
    }

    /// Row-major matrix.
    pub fn matrix(&self) -> &[[f64; 4]; 4] {
        &self.0
    }

    /// Diagonal scaling.
    pub fn scaling(scale: [f64; 3]) -> Self {
        let mut m = Self::IDENTITY.0;
        for (i, &s) in scale.iter().enumerate() {
            m[i][i] = s;
        }
        Self(m)
    }

    /// Pure translation.
    pub fn translation(offset: [f64; 3]) -> Self {
        let mut m = Self::IDENTITY.0;
        for (i, &t) in offset.iter().enumerate() {
            m[i][3] = t;
        }
        Self(m)
    }

    /// Matrix product `self . other`: the result applies `other` first.
    pub fn compose(&self, other: &Affine) -> Affine {
        let (a, b) = (&self.0, &other.0);
        let mut out = [[0.0f64; 4]; 4];
        for (i, row) in out.iter_mut().enumerate() {
            for (j, cell) in row.iter_mut().enumerate() {
                *cell = (0..4).map(|k| a[i][k] * b[k][j]).sum();
            }
        }
        Affine(out)
    }

    /// Inverse by Gauss-Jordan elimination with partial pivoting.
    ///
    /// Fails with [`Error::NonInvertibleAffine`] for singular matrices and for
    /// any matrix, or inverse, holding a NaN or infinite entry.
    pub fn inverse(&self) -> Result<Affine> {
        let mut a = self.0;
        let mut inv = Self::IDENTITY.0;

        if !self.is_finite() {
            return Err(Error::NonInvertibleAffine);
        }
        let scale = a
            .iter()
            .flatten()
            .map(|v| v.abs())
            .fold(0.0f64, f64::max);
        if !scale.is_finite() || scale == 0.0 {
            return Err(Error::NonInvertibleAffine);
        }
        let tolerance = scale * 1e-12;

        for col in 0..4 {
            let pivot_row = (col..4)
                .max_by(|&r1, &r2| a[r1][col].abs().total_cmp(&a[r2][col].abs()))
                .unwrap_or(col);
            if a[pivot_row][col].abs() <= tolerance {
                return Err(Error::NonInvertibleAffine);
            }
            a.swap(col, pivot_row);
            inv.swap(col, pivot_row);

            let pivot = a[col][col];
            for j in 0..4 {
                a[col][j] /= pivot;
                inv[col][j] /= pivot;
            }

            for row in 0..4 {
                if row == col {
                    continue;
                }
                let factor = a[row][col];
                if factor == 0.0 {
                    continue;
                }
                for j in 0..4 {
                    a[row][j] -= factor * a[col][j];
                    inv[row][j] -= factor * inv[col][j];
                }
            }
        }

        let inv = Affine(inv);
        if !inv.is_finite() {
            return Err(Error::NonInvertibleAffine);
        }
        Ok(inv)
    }

    /// True if every entry is finite.
    pub fn is_finite(&self) -> bool {
        self.0.iter().flatten().all(|v| v.is_finite())
    }

    /// True if this is exactly the identity.
    pub fn is_identity(&self) -> bool {
        *self == Self::IDENTITY
    }

    /// Element-wise comparison within an absolute tolerance.
    pub fn approx_eq(&self, other: &Affine, tolerance: f64) -> bool {
        self.0
            .iter()
            .flatten()
            .zip(other.0.iter().flatten())
            .all(|(a, b)| (a - b).abs() <= tolerance)
    }

    /// The upper-left 3x3 block.
    pub fn linear(&self) -> [[f64; 3]; 3] {
        let m = &self.0;
        [
            [m[0][0], m[0][1], m[0][2]],
            [m[1][0], m[1][1], m[1][2]],
            [m[2][0], m[2][1], m[2][2]],
        ]
    }

    /// Transform a single point.
    pub fn apply_point(&self, point: [f32; 3]) -> [f32; 3] {
        let mut p = point;
        transform_xyz(&self.0, &mut p);
        p
    }

    /// Transform a flat buffer of `x, y, z` triplets in place.
    ///
    /// Large buffers are processed in parallel.
    pub fn apply_points(&self, points: &mut [f32]) {
        debug_assert_eq!(points.len() % 3, 0, "point buffer is not xyz triplets");
        if self.is_identity() {
            return;
        }
        let m = self.0;
        if points.len() >= PARALLEL_THRESHOLD * 3 {
            points
                .par_chunks_exact_mut(3)
                .for_each(|p| transform_xyz(&m, p));
        } else {
            points
                .chunks_exact_mut(3)
                .for_each(|p| transform_xyz(&m, p));
        }
    }
}

#[inline]
fn transform_xyz(m: &[[f64; 4]; 4], p: &mut [f32]) {
    let (x, y, z) = (p[0] as f64, p[1] as f64, p[2] as f64);
    p[0] = (m[0][0] * x + m[0][1] * y + m[0][2] * z + m[0][3]) as f32;
    p[1] = (m[1][0] * x + m[1][1] * y + m[1][2] * z + m[1][3]) as f32;
    p[2] = (m[2][0] * x + m[2][1] * y + m[2][2] * z + m[2][3]) as f32;
}

/// Compose two transforms: the result applies `b` first, then `a`.
pub fn compose(a: &Affine, b: &Affine) -> Affine {
    a.compose(b)
}

/// Map native-space points to the anatomical (RAS+ mm) space.
#[must_use = "this function returns transformed points and does not modify the input"]
pub fn to_rasmm(points: &[f32], affine_to_rasmm: &Affine) -> Vec<f32> {
    let mut out = points.to_vec();
    affine_to_rasmm.apply_points(&mut out);
    out
}

/// Map anatomical (RAS+ mm) points back to native space.
pub fn from_rasmm(points: &[f32], affine_to_rasmm: &Affine) -> Result<Vec<f32>> {
    let inverse = affine_to_rasmm.inverse()?;
    let mut out = points.to_vec();
    inverse.apply_points(&mut out);
    Ok(out)
}
