//! A single streamline together with its attached data.

use crate::error::{Error, Result};
use crate::transforms::Affine;
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;

/// One streamline and the data attached to it.
///
/// `streamline` is `n x 3`; every entry of `data_for_points` is `n x width`;
/// every entry of `data_for_streamline` is a vector of its declared width.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TractogramItem {
    /// Point coordinates, one row per point.
    pub streamline: Array2<f32>,
    /// Per-point attributes keyed by name.
    pub data_for_points: BTreeMap<String, Array2<f32>>,
    /// Per-streamline attributes keyed by name.
    pub data_for_streamline: BTreeMap<String, Array1<f32>>,
}

impl TractogramItem {
    /// Item with points only.
    pub fn new(streamline: Array2<f32>) -> Self {
        Self {
            streamline,
            data_for_points: BTreeMap::new(),
            data_for_streamline: BTreeMap::new(),
        }
    }

    /// Attach a per-point attribute.
    pub fn with_point_data(mut self, name: impl Into<String>, data: Array2<f32>) -> Self {
        self.data_for_points.insert(name.into(), data);
        self
    }

    /// Attach a per-streamline attribute.
    pub fn with_streamline_data(mut self, name: impl Into<String>, data: Array1<f32>) -> Self {
        self.data_for_streamline.insert(name.into(), data);
        self
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.streamline.nrows()
    }

    /// True if the streamline has no points.
    pub fn is_empty(&self) -> bool {
        self.streamline.nrows() == 0
    }

    /// Check that coordinates have 3 columns and per-point data one row per point.
    pub fn validate(&self, index: usize) -> Result<()> {
        if self.streamline.ncols() != 3 {
            return Err(Error::ShapeMismatch(format!(
                "streamline {} has {} coordinate columns, expected 3",
                index,
                self.streamline.ncols()
            )));
        }
        for (name, data) in &self.data_for_points {
            if data.nrows() != self.len() {
                return Err(Error::PointCountMismatch {
                    name: name.clone(),
                    streamline: index,
                    expected: self.len(),
                    actual: data.nrows(),
                });
            }
        }
        Ok(())
    }

    /// Transform the coordinates in place.
    pub fn apply_affine(&mut self, affine: &Affine) {
        if affine.is_identity() {
            return;
        }
        if let Some(points) = self.streamline.as_slice_mut() {
            affine.apply_points(points);
        } else {
            for mut row in self.streamline.rows_mut() {
                let p = affine.apply_point([row[0], row[1], row[2]]);
                row[0] = p[0];
                row[1] = p[1];
                row[2] = p[2];
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2, ShapeBuilder};

    #[test]
    fn test_validate_point_rows() {
        let item = TractogramItem::new(Array2::zeros((4, 3)))
            .with_point_data("fa", Array2::zeros((3, 1)));
        let err = item.validate(7).unwrap_err();
        assert!(matches!(
            err,
            Error::PointCountMismatch {
                streamline: 7,
                expected: 4,
                actual: 3,
                ..
            }
        ));
    }

    #[test]
    fn test_apply_affine_non_contiguous() {
        let f_order =
            Array2::from_shape_vec((2, 3).f(), vec![1.0f32, 4.0, 2.0, 5.0, 3.0, 6.0]).unwrap();
        assert!(f_order.as_slice().is_none());
        let mut item = TractogramItem::new(f_order);
        item.apply_affine(&Affine::translation([1.0, 0.0, -1.0]));
        assert_eq!(item.streamline, array![[2.0f32, 2.0, 2.0], [5.0, 5.0, 5.0]]);
    }
}
