//! Affines between TrackVis voxmm space and RAS+ mm.
//!
//! TRK points are voxel coordinates scaled by voxel size, measured from the
//! corner of the first voxel and laid out along `voxel_order`. Mapping them to
//! RAS+ mm goes through voxel indices of the reference volume.

use super::header::TrkHeader;
use crate::error::{Error, Result};
use crate::transforms::orientation::{
    axcodes_to_orientation, inverse_orientation_affine, io_orientation, orientation_transform,
};
use crate::transforms::Affine;

impl TrkHeader {
    /// Affine taking stored (voxmm) points to RAS+ mm.
    ///
    /// Fails with [`Error::NonInvertibleAffine`] when `voxel_to_rasmm` holds a
    /// NaN or infinite entry.
    pub fn voxmm_to_rasmm(&self) -> Result<Affine> {
        if !self.voxel_to_rasmm.is_finite() {
            return Err(Error::NonInvertibleAffine);
        }
        let inv_sizes = self.voxel_sizes.map(|s| 1.0 / s as f64);
        let to_voxel = Affine::translation([-0.5; 3]).compose(&Affine::scaling(inv_sizes));

        let header_ornt = axcodes_to_orientation(&self.voxel_order)?;
        let affine_ornt = io_orientation(&self.voxel_to_rasmm);
        let ornt = orientation_transform(&header_ornt, &affine_ornt)?;
        let shape = self.dimensions.map(f64::from);
        let reorient = inverse_orientation_affine(&ornt, shape);

        Ok(self.voxel_to_rasmm.compose(&reorient).compose(&to_voxel))
    }

    /// Affine taking RAS+ mm points to stored (voxmm) points.
    pub fn rasmm_to_voxmm(&self) -> Result<Affine> {
        self.voxmm_to_rasmm()?.inverse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: [f32; 3], b: [f32; 3]) {
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() < 1e-4, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_default_header_is_half_voxel_shift() {
        let affine = TrkHeader::default().voxmm_to_rasmm().unwrap();
        assert!(affine.approx_eq(&Affine::translation([-0.5; 3]), 1e-12));
    }

    #[test]
    fn test_matching_voxel_order() {
        let header = TrkHeader {
            dimensions: [10, 10, 10],
            voxel_sizes: [2.0, 2.0, 2.0],
            voxel_to_rasmm: Affine::scaling([-2.0, -2.0, 2.0]),
            voxel_order: "LPS".to_string(),
            ..TrkHeader::default()
        };
        let affine = header.voxmm_to_rasmm().unwrap();
        // voxmm (1, 1, 1) is the centre of voxel (0, 0, 0)
        assert_close(affine.apply_point([1.0, 1.0, 1.0]), [0.0, 0.0, 0.0]);
        assert_close(affine.apply_point([5.0, 3.0, 1.0]), [-4.0, -2.0, 0.0]);
    }

    #[test]
    fn test_voxel_order_differs_from_affine() {
        let header = TrkHeader {
            dimensions: [10, 10, 10],
            voxel_sizes: [2.0, 2.0, 2.0],
            voxel_to_rasmm: Affine::scaling([-2.0, -2.0, 2.0]),
            voxel_order: "RAS".to_string(),
            ..TrkHeader::default()
        };
        let affine = header.voxmm_to_rasmm().unwrap();
        // voxel (0, 0, 0) in RAS order is voxel (9, 9, 0) of the LPS volume
        assert_close(affine.apply_point([1.0, 1.0, 1.0]), [-18.0, -18.0, 0.0]);
    }

    #[test]
    fn test_inverse_roundtrip() {
        let header = TrkHeader {
            dimensions: [91, 109, 91],
            voxel_sizes: [1.25, 1.25, 1.25],
            voxel_to_rasmm: Affine::new([
                [-1.25, 0.0, 0.0, 90.0],
                [0.0, 1.25, 0.0, -126.0],
                [0.0, 0.0, 1.25, -72.0],
                [0.0, 0.0, 0.0, 1.0],
            ]),
            voxel_order: "LAS".to_string(),
            ..TrkHeader::default()
        };
        let forward = header.voxmm_to_rasmm().unwrap();
        let backward = header.rasmm_to_voxmm().unwrap();
        let p = [12.5, 40.0, 3.75];
        assert_close(backward.apply_point(forward.apply_point(p)), p);
    }

    #[test]
    fn test_non_finite_voxel_affine_rejected() {
        let mut m = Affine::IDENTITY.0;
        m[0][0] = f64::NAN;
        let header = TrkHeader {
            voxel_to_rasmm: Affine::new(m),
            ..TrkHeader::default()
        };
        assert!(matches!(header.voxmm_to_rasmm(), Err(Error::NonInvertibleAffine)));
        assert!(matches!(header.rasmm_to_voxmm(), Err(Error::NonInvertibleAffine)));
    }
}
