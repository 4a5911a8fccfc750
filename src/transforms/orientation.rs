//! Axis orientation algebra.
//!
//! An orientation lists, for each array axis, the world axis it maps to and
//! whether it points along (`+1`) or against (`-1`) that world axis. World
//! axes are labelled `(L, R)`, `(P, A)`, `(I, S)`; the second label of each
//! pair is the positive direction, so `"RAS"` is the identity orientation.

use super::affine::Affine;
use crate::error::{Error, Result};

/// Per-axis `(world axis, flip)` pairs, with flip being `1.0` or `-1.0`.
pub type Orientation = [(usize, f64); 3];

const LABELS: [(char, char); 3] = [('L', 'R'), ('P', 'A'), ('I', 'S')];

/// Parse axis codes such as `"LPS"` into an orientation.
pub fn axcodes_to_orientation(codes: &str) -> Result<Orientation> {
    let chars: Vec<char> = codes.chars().map(|c| c.to_ascii_uppercase()).collect();
    if chars.len() != 3 {
        return Err(Error::Configuration(format!(
            "axis codes must have 3 letters, got '{}'",
            codes
        )));
    }

    let mut ornt = [(0usize, 1.0f64); 3];
    let mut seen = [false; 3];
    for (slot, &code) in ornt.iter_mut().zip(chars.iter()) {
        let (axis, flip) = LABELS
            .iter()
            .enumerate()
            .find_map(|(axis, &(neg, pos))| {
                if code == neg {
                    Some((axis, -1.0))
                } else if code == pos {
                    Some((axis, 1.0))
                } else {
                    None
                }
            })
            .ok_or_else(|| {
                Error::Configuration(format!("unknown axis code '{}' in '{}'", code, codes))
            })?;
        if seen[axis] {
            return Err(Error::Configuration(format!(
                "axis codes '{}' use world axis {} twice",
                codes, axis
            )));
        }
        seen[axis] = true;
        *slot = (axis, flip);
    }
    Ok(ornt)
}

/// Inverse of [`axcodes_to_orientation`].
pub fn orientation_to_axcodes(ornt: &Orientation) -> String {
    ornt.iter()
        .map(|&(axis, flip)| {
            let (neg, pos) = LABELS[axis];
            if flip < 0.0 {
                neg
            } else {
                pos
            }
        })
        .collect()
}

/// Orientation of the voxel axes of `affine` with respect to world axes.
///
/// Columns are normalized by their zoom and replaced by the nearest
/// orthogonal matrix. Voxel axes then pick, in order, the world axis with the
/// largest absolute weight in their column, and each pick removes that world
/// axis from later columns. A voxel axis with no remaining weight (a singular
/// affine) takes the lowest world axis left over, pointing positive.
pub fn io_orientation(affine: &Affine) -> Orientation {
    let mut rs = affine.linear();
    for col in 0..3 {
        let zoom = (0..3).map(|row| rs[row][col] * rs[row][col]).sum::<f64>().sqrt();
        if zoom > 0.0 {
            for row in rs.iter_mut() {
                row[col] /= zoom;
            }
        }
    }
    let mut weights = nearest_orthogonal(rs);

    let mut ornt: [Option<(usize, f64)>; 3] = [None; 3];
    let mut row_used = [false; 3];
    for col in 0..3 {
        let best = (0..3)
            .map(|row| (row, weights[row][col]))
            .filter(|&(_, w)| w.abs() > ZERO_WEIGHT)
            .fold(None, |best: Option<(usize, f64)>, (row, w)| match best {
                Some((_, b)) if b.abs() >= w.abs() => best,
                _ => Some((row, w)),
            });
        if let Some((row, w)) = best {
            ornt[col] = Some((row, if w < 0.0 { -1.0 } else { 1.0 }));
            row_used[row] = true;
            weights[row] = [0.0; 3];
        }
    }

    let mut spare = (0..3).filter(|&row| !row_used[row]);
    ornt.map(|slot| slot.unwrap_or_else(|| (spare.next().unwrap_or(0), 1.0)))
}

/// Weights at or below this are treated as zero when assigning axes.
const ZERO_WEIGHT: f64 = 1e-8;

/// Nearest orthogonal matrix to `m` (the polar factor `U V^T` of its SVD).
///
/// The SVD comes from one-sided Jacobi rotations of the columns. Singular
/// directions, whose singular value is negligible, are dropped, so the result
/// of a rank-deficient `m` has matching zero columns.
fn nearest_orthogonal(m: [[f64; 3]; 3]) -> [[f64; 3]; 3] {
    let mut a = m;
    let mut v = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
    let dot = |x: &[[f64; 3]; 3], p: usize, q: usize| (0..3).map(|r| x[r][p] * x[r][q]).sum::<f64>();

    for _ in 0..JACOBI_SWEEPS {
        let mut rotated = false;
        for (p, q) in [(0, 1), (0, 2), (1, 2)] {
            let (alpha, beta, gamma) = (dot(&a, p, p), dot(&a, q, q), dot(&a, p, q));
            if gamma.abs() <= f64::EPSILON * (alpha * beta).sqrt() {
                continue;
            }
            rotated = true;
            let zeta = (beta - alpha) / (2.0 * gamma);
            let t = zeta.signum() / (zeta.abs() + (1.0 + zeta * zeta).sqrt());
            let c = 1.0 / (1.0 + t * t).sqrt();
            let s = c * t;
            for x in [&mut a, &mut v] {
                for row in x.iter_mut() {
                    let (xp, xq) = (row[p], row[q]);
                    row[p] = c * xp - s * xq;
                    row[q] = s * xp + c * xq;
                }
            }
        }
        if !rotated {
            break;
        }
    }

    let sigma = [0, 1, 2].map(|i| dot(&a, i, i).sqrt());
    let tolerance = sigma.iter().copied().fold(0.0, f64::max) * 3.0 * f64::EPSILON;
    let mut out = [[0.0f64; 3]; 3];
    for (i, &s) in sigma.iter().enumerate() {
        if s <= tolerance {
            continue;
        }
        for (r, out_row) in out.iter_mut().enumerate() {
            for (c, cell) in out_row.iter_mut().enumerate() {
                *cell += a[r][i] / s * v[c][i];
            }
        }
    }
    out
}

const JACOBI_SWEEPS: usize = 60;

/// Axis codes of the voxel axes of `affine`, e.g. `"RAS"`.
pub fn affine_to_axcodes(affine: &Affine) -> String {
    orientation_to_axcodes(&io_orientation(affine))
}

/// Orientation that takes an array in `start` orientation to `end` orientation.
pub fn orientation_transform(start: &Orientation, end: &Orientation) -> Result<Orientation> {
    let mut result = [(0usize, 1.0f64); 3];
    for (start_in, &(start_out, start_flip)) in start.iter().enumerate() {
        let (end_in, &(_, end_flip)) = end
            .iter()
            .enumerate()
            .find(|(_, &(end_out, _))| end_out == start_out)
            .ok_or_else(|| {
                Error::Configuration(format!(
                    "orientations {} and {} do not share world axes",
                    orientation_to_axcodes(start),
                    orientation_to_axcodes(end)
                ))
            })?;
        let flip = if start_flip == end_flip { 1.0 } else { -1.0 };
        result[start_in] = (end_in, flip);
    }
    Ok(result)
}

/// Affine mapping voxel indices of a reoriented array back to the original.
///
/// `ornt` is the reorientation that was applied and `shape` the original
/// array shape; flips are mirrored about the array centre.
pub fn inverse_orientation_affine(ornt: &Orientation, shape: [f64; 3]) -> Affine {
    let mut undo_reorder = [[0.0f64; 4]; 4];
    for (row, &(axis, _)) in ornt.iter().enumerate() {
        undo_reorder[row][axis] = 1.0;
    }
    undo_reorder[3][3] = 1.0;

    let mut undo_flip = *Affine::IDENTITY.matrix();
    for (i, &(_, flip)) in ornt.iter().enumerate() {
        let center = -(shape[i] - 1.0) / 2.0;
        undo_flip[i][i] = flip;
        undo_flip[i][3] = flip * center - center;
    }

    Affine::new(undo_flip).compose(&Affine::new(undo_reorder))
}
