//! Materialized tractogram.

use super::item::TractogramItem;
use super::sequence::ArraySequence;
use super::PointSpace;
use crate::error::{Error, Result};
use crate::transforms::Affine;
use ndarray::{Array2, Axis};
use std::collections::BTreeMap;

/// Tolerance used when checking that two tractograms share an affine.
const AFFINE_TOLERANCE: f64 = 1e-6;

/// Streamlines with aligned per-point and per-streamline data.
///
/// Invariants, checked by every constructor and mutator:
/// - `streamlines` has width 3.
/// - every per-point sequence has one array per streamline, with one row
///   per point of that streamline.
/// - every per-streamline table has one row per streamline.
/// - `affine_to_rasmm` is invertible, and is the identity whenever `space`
///   is [`PointSpace::Rasmm`].
#[derive(Debug, Clone, PartialEq)]
pub struct Tractogram {
    streamlines: ArraySequence,
    data_per_point: BTreeMap<String, ArraySequence>,
    data_per_streamline: BTreeMap<String, Array2<f32>>,
    affine_to_rasmm: Affine,
    space: PointSpace,
}

impl Default for Tractogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Tractogram {
    /// Empty tractogram in RAS+ mm with no attached data.
    pub fn new() -> Self {
        Self {
            streamlines: ArraySequence::new(3),
            data_per_point: BTreeMap::new(),
            data_per_streamline: BTreeMap::new(),
            affine_to_rasmm: Affine::IDENTITY,
            space: PointSpace::Rasmm,
        }
    }

    /// Empty tractogram declaring attribute names and widths up front, so
    /// that items carrying them can be [`push`](Self::push)ed.
    pub fn with_fields(
        point_fields: &[(&str, usize)],
        streamline_fields: &[(&str, usize)],
    ) -> Self {
        let mut tractogram = Self::new();
        for &(name, width) in point_fields {
            tractogram
                .data_per_point
                .insert(name.to_string(), ArraySequence::new(width));
        }
        for &(name, width) in streamline_fields {
            tractogram
                .data_per_streamline
                .insert(name.to_string(), Array2::zeros((0, width)));
        }
        tractogram
    }

    /// Streamlines only.
    pub fn from_streamlines(streamlines: ArraySequence, affine_to_rasmm: Affine) -> Result<Self> {
        Self::from_parts(
            streamlines,
            BTreeMap::new(),
            BTreeMap::new(),
            affine_to_rasmm,
        )
    }

    /// Assemble from parts, validating every invariant.
    ///
    /// The points are tagged [`PointSpace::Rasmm`] when `affine_to_rasmm` is
    /// the identity and [`PointSpace::Native`] otherwise; use
    /// [`with_space`](Self::with_space) to tag native points explicitly.
    pub fn from_parts(
        streamlines: ArraySequence,
        data_per_point: BTreeMap<String, ArraySequence>,
        data_per_streamline: BTreeMap<String, Array2<f32>>,
        affine_to_rasmm: Affine,
    ) -> Result<Self> {
        if streamlines.common_width() != 3 {
            return Err(Error::ShapeMismatch(format!(
                "streamlines must have 3 columns, got {}",
                streamlines.common_width()
            )));
        }
        affine_to_rasmm.inverse()?;

        let space = if affine_to_rasmm.is_identity() {
            PointSpace::Rasmm
        } else {
            PointSpace::Native
        };
        let tractogram = Self {
            streamlines,
            data_per_point: BTreeMap::new(),
            data_per_streamline: BTreeMap::new(),
            affine_to_rasmm,
            space,
        };
        let tractogram = data_per_point
            .into_iter()
            .try_fold(tractogram, |t, (name, seq)| t.with_data_per_point(name, seq))?;
        data_per_streamline
            .into_iter()
            .try_fold(tractogram, |t, (name, table)| {
                t.with_data_per_streamline(name, table)
            })
    }

    /// Tag the points with `space`.
    ///
    /// Only native points may carry a non-identity `affine_to_rasmm`.
    pub fn with_space(mut self, space: PointSpace) -> Result<Self> {
        if space == PointSpace::Rasmm && !self.affine_to_rasmm.is_identity() {
            return Err(Error::Configuration(
                "points with a non-identity affine_to_rasmm cannot be tagged as RAS+ mm"
                    .to_string(),
            ));
        }
        self.space = space;
        Ok(self)
    }

    /// Attach a per-point attribute, one array per streamline.
    pub fn with_data_per_point(
        mut self,
        name: impl Into<String>,
        data: ArraySequence,
    ) -> Result<Self> {
        let name = name.into();
        if data.len() != self.len() {
            return Err(Error::AttributeLengthMismatch {
                name,
                kind: "per-point",
                expected: self.len(),
                actual: data.len(),
            });
        }
        let mismatch = self
            .streamlines
            .lengths()
            .iter()
            .zip(data.lengths())
            .enumerate()
            .find(|(_, (expected, actual))| expected != actual);
        if let Some((streamline, (&expected, &actual))) = mismatch {
            return Err(Error::PointCountMismatch {
                name,
                streamline,
                expected,
                actual,
            });
        }
        self.data_per_point.insert(name, data);
        Ok(self)
    }

    /// Attach a per-streamline attribute as an `n_streamlines x width` table.
    pub fn with_data_per_streamline(
        mut self,
        name: impl Into<String>,
        data: Array2<f32>,
    ) -> Result<Self> {
        let name = name.into();
        if data.nrows() != self.len() {
            return Err(Error::AttributeLengthMismatch {
                name,
                kind: "per-streamline",
                expected: self.len(),
                actual: data.nrows(),
            });
        }
        self.data_per_streamline
            .insert(name, data.as_standard_layout().into_owned());
        Ok(self)
    }

    /// Number of streamlines.
    pub fn len(&self) -> usize {
        self.streamlines.len()
    }

    /// True if there are no streamlines.
    pub fn is_empty(&self) -> bool {
        self.streamlines.is_empty()
    }

    /// Packed streamline points, one `n x 3` array per streamline.
    pub fn streamlines(&self) -> &ArraySequence {
        &self.streamlines
    }

    /// Per-point attributes by name.
    pub fn data_per_point(&self) -> &BTreeMap<String, ArraySequence> {
        &self.data_per_point
    }

    /// Per-streamline attributes by name, one row per streamline.
    pub fn data_per_streamline(&self) -> &BTreeMap<String, Array2<f32>> {
        &self.data_per_streamline
    }

    /// Affine taking the current points to RAS+ mm.
    pub fn affine_to_rasmm(&self) -> &Affine {
        &self.affine_to_rasmm
    }

    /// Space the points are currently in.
    pub fn space(&self) -> PointSpace {
        self.space
    }

    /// Per-point attribute names and widths, sorted by name.
    pub fn point_fields(&self) -> Vec<(String, usize)> {
        self.data_per_point
            .iter()
            .map(|(name, seq)| (name.clone(), seq.common_width()))
            .collect()
    }

    /// Per-streamline attribute names and widths, sorted by name.
    pub fn streamline_fields(&self) -> Vec<(String, usize)> {
        self.data_per_streamline
            .iter()
            .map(|(name, table)| (name.clone(), table.ncols()))
            .collect()
    }

    /// Copy of streamline `index` and its data.
    pub fn get(&self, index: usize) -> Option<TractogramItem> {
        let streamline = self.streamlines.get(index)?.to_owned();
        let data_for_points = self
            .data_per_point
            .iter()
            .filter_map(|(name, seq)| Some((name.clone(), seq.get(index)?.to_owned())))
            .collect();
        let data_for_streamline = self
            .data_per_streamline
            .iter()
            .map(|(name, table)| (name.clone(), table.row(index).to_owned()))
            .collect();
        Some(TractogramItem {
            streamline,
            data_for_points,
            data_for_streamline,
        })
    }

    /// Items in order.
    pub fn iter(&self) -> impl Iterator<Item = TractogramItem> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// New tractogram holding the streamlines at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<Tractogram> {
        let streamlines = self.streamlines.select(indices)?;
        let data_per_point = self
            .data_per_point
            .iter()
            .map(|(name, seq)| Ok((name.clone(), seq.select(indices)?)))
            .collect::<Result<_>>()?;
        let data_per_streamline = self
            .data_per_streamline
            .iter()
            .map(|(name, table)| (name.clone(), table.select(Axis(0), indices)))
            .collect();
        Ok(Self {
            streamlines,
            data_per_point,
            data_per_streamline,
            affine_to_rasmm: self.affine_to_rasmm,
            space: self.space,
        })
    }

    /// Append one item, which must carry exactly this tractogram's attributes.
    ///
    /// Nothing is modified when validation fails.
    pub fn push(&mut self, item: TractogramItem) -> Result<()> {
        let index = self.len();
        item.validate(index)?;
        self.check_item_schema(&item, index)?;

        self.streamlines.push(item.streamline.view())?;
        for (name, data) in &item.data_for_points {
            if let Some(seq) = self.data_per_point.get_mut(name) {
                seq.push(data.view())?;
            }
        }
        for (name, data) in &item.data_for_streamline {
            if let Some(table) = self.data_per_streamline.get_mut(name) {
                table
                    .push_row(data.view())
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
            }
        }
        Ok(())
    }

    fn check_item_schema(&self, item: &TractogramItem, index: usize) -> Result<()> {
        let point_keys: Vec<_> = item.data_for_points.keys().collect();
        let streamline_keys: Vec<_> = item.data_for_streamline.keys().collect();
        if !point_keys.iter().copied().eq(self.data_per_point.keys())
            || !streamline_keys.iter().copied().eq(self.data_per_streamline.keys())
        {
            return Err(Error::Configuration(format!(
                "streamline {} carries attributes {:?}/{:?}, tractogram expects {:?}/{:?}",
                index,
                point_keys,
                streamline_keys,
                self.data_per_point.keys().collect::<Vec<_>>(),
                self.data_per_streamline.keys().collect::<Vec<_>>()
            )));
        }
        for (name, data) in &item.data_for_points {
            let width = self.data_per_point[name].common_width();
            if data.ncols() != width {
                return Err(Error::ShapeMismatch(format!(
                    "per-point attribute '{}' of streamline {} has width {}, expected {}",
                    name,
                    index,
                    data.ncols(),
                    width
                )));
            }
        }
        for (name, data) in &item.data_for_streamline {
            let width = self.data_per_streamline[name].ncols();
            if data.len() != width {
                return Err(Error::ShapeMismatch(format!(
                    "per-streamline attribute '{}' of streamline {} has width {}, expected {}",
                    name,
                    index,
                    data.len(),
                    width
                )));
            }
        }
        Ok(())
    }

    /// Append every streamline of `other`.
    ///
    /// Both tractograms must have the same attributes and widths, the same
    /// space and the same `affine_to_rasmm`.
    pub fn extend(&mut self, other: &Tractogram) -> Result<()> {
        if self.space != other.space
            || !self
                .affine_to_rasmm
                .approx_eq(&other.affine_to_rasmm, AFFINE_TOLERANCE)
        {
            return Err(Error::Configuration(
                "cannot extend a tractogram with one in a different space".to_string(),
            ));
        }
        if self.point_fields() != other.point_fields()
            || self.streamline_fields() != other.streamline_fields()
        {
            return Err(Error::Configuration(format!(
                "attribute mismatch: {:?}/{:?} vs {:?}/{:?}",
                self.point_fields(),
                self.streamline_fields(),
                other.point_fields(),
                other.streamline_fields()
            )));
        }

        self.streamlines.extend(&other.streamlines)?;
        for (name, seq) in self.data_per_point.iter_mut() {
            if let Some(src) = other.data_per_point.get(name) {
                seq.extend(src)?;
            }
        }
        for (name, table) in self.data_per_streamline.iter_mut() {
            if let Some(src) = other.data_per_streamline.get(name) {
                table
                    .append(Axis(0), src.view())
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))?;
            }
        }
        Ok(())
    }

    /// New tractogram with `affine` applied to every point.
    ///
    /// `affine_to_rasmm` is updated to `affine_to_rasmm . affine^-1`, so the
    /// result still maps to the same RAS+ mm coordinates. Any affine other
    /// than the identity leaves the points in [`PointSpace::Native`].
    pub fn apply_affine(&self, affine: &Affine) -> Result<Tractogram> {
        self.clone().into_transformed(affine)
    }

    /// Consuming variant of [`apply_affine`](Self::apply_affine).
    pub fn into_transformed(mut self, affine: &Affine) -> Result<Tractogram> {
        let inverse = affine.inverse()?;
        affine.apply_points(self.streamlines.as_mut_slice());
        self.affine_to_rasmm = self.affine_to_rasmm.compose(&inverse);
        if !affine.is_identity() {
            self.space = PointSpace::Native;
        }
        Ok(self)
    }

    /// New tractogram with points in RAS+ mm.
    pub fn to_world(&self) -> Tractogram {
        self.clone().into_world()
    }

    /// Consuming variant of [`to_world`](Self::to_world).
    pub fn into_world(mut self) -> Tractogram {
        self.affine_to_rasmm
            .apply_points(self.streamlines.as_mut_slice());
        self.affine_to_rasmm = Affine::IDENTITY;
        self.space = PointSpace::Rasmm;
        self
    }

    /// Apply `points` to every point and tag the result with `affine_to_rasmm`
    /// and `space` as given, without recomputing them.
    pub(crate) fn transformed_to(
        mut self,
        points: &Affine,
        affine_to_rasmm: Affine,
        space: PointSpace,
    ) -> Tractogram {
        points.apply_points(self.streamlines.as_mut_slice());
        self.affine_to_rasmm = affine_to_rasmm;
        self.space = space;
        self
    }
}
