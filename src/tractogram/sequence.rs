//! Packed storage for sequences of variable-length 2D arrays.

use crate::error::{Error, Result};
use ndarray::{Array2, ArrayView2, ArrayViewMut2};

/// A sequence of `rows x width` arrays packed into one row-major buffer.
///
/// All arrays share the same column width; only their row counts vary.
/// Streamlines are stored with width 3, per-point attributes with their
/// declared width.
#[derive(Debug, Clone, PartialEq)]
pub struct ArraySequence {
    data: Vec<f32>,
    common_width: usize,
    offsets: Vec<usize>,
    lengths: Vec<usize>,
}

impl ArraySequence {
    /// Create an empty sequence of arrays with `common_width` columns.
    pub fn new(common_width: usize) -> Self {
        Self {
            data: Vec::new(),
            common_width,
            offsets: Vec::new(),
            lengths: Vec::new(),
        }
    }

    /// Create an empty sequence with room for `rows` rows over `sequences` arrays.
    pub fn with_capacity(common_width: usize, rows: usize, sequences: usize) -> Self {
        Self {
            data: Vec::with_capacity(rows * common_width),
            common_width,
            offsets: Vec::with_capacity(sequences),
            lengths: Vec::with_capacity(sequences),
        }
    }

    /// Build from owned arrays, which must all have `common_width` columns.
    pub fn from_arrays<I>(common_width: usize, arrays: I) -> Result<Self>
    where
        I: IntoIterator<Item = Array2<f32>>,
    {
        let mut seq = Self::new(common_width);
        for array in arrays {
            seq.push(array.view())?;
        }
        Ok(seq)
    }

    /// Build directly from a packed buffer and per-array row counts.
    pub fn from_flat(common_width: usize, data: Vec<f32>, lengths: Vec<usize>) -> Result<Self> {
        let total_rows: usize = lengths.iter().sum();
        if data.len() != total_rows * common_width {
            return Err(Error::ShapeMismatch(format!(
                "packed buffer holds {} values, lengths require {} rows of width {}",
                data.len(),
                total_rows,
                common_width
            )));
        }
        let mut offsets = Vec::with_capacity(lengths.len());
        let mut next = 0;
        for &len in &lengths {
            offsets.push(next);
            next += len;
        }
        Ok(Self {
            data,
            common_width,
            offsets,
            lengths,
        })
    }

    /// Append one array.
    pub fn push(&mut self, array: ArrayView2<'_, f32>) -> Result<()> {
        if array.ncols() != self.common_width {
            return Err(Error::ShapeMismatch(format!(
                "array has {} columns, sequence width is {}",
                array.ncols(),
                self.common_width
            )));
        }
        self.offsets.push(self.total_rows());
        self.lengths.push(array.nrows());
        self.data.extend(array.iter().copied());
        Ok(())
    }

    /// Append one array given as packed row-major values.
    pub fn push_rows(&mut self, values: &[f32]) -> Result<()> {
        let width = self.common_width;
        if width == 0 || values.len() % width != 0 {
            return Err(Error::ShapeMismatch(format!(
                "{} values do not form rows of width {}",
                values.len(),
                width
            )));
        }
        self.offsets.push(self.total_rows());
        self.lengths.push(values.len() / width);
        self.data.extend_from_slice(values);
        Ok(())
    }

    /// Append all arrays of `other`.
    pub fn extend(&mut self, other: &ArraySequence) -> Result<()> {
        if other.common_width != self.common_width {
            return Err(Error::ShapeMismatch(format!(
                "cannot extend width {} sequence with width {} sequence",
                self.common_width, other.common_width
            )));
        }
        let base = self.total_rows();
        self.offsets.extend(other.offsets.iter().map(|o| o + base));
        self.lengths.extend_from_slice(&other.lengths);
        self.data.extend_from_slice(&other.data);
        Ok(())
    }

    /// Number of arrays.
    pub fn len(&self) -> usize {
        self.lengths.len()
    }

    /// True if the sequence holds no arrays.
    pub fn is_empty(&self) -> bool {
        self.lengths.is_empty()
    }

    /// Column count shared by every array.
    pub fn common_width(&self) -> usize {
        self.common_width
    }

    /// Total rows across all arrays.
    pub fn total_rows(&self) -> usize {
        if self.common_width == 0 {
            self.lengths.iter().sum()
        } else {
            self.data.len() / self.common_width
        }
    }

    /// Row count of each array.
    pub fn lengths(&self) -> &[usize] {
        &self.lengths
    }

    /// Starting row of each array in the packed buffer.
    pub fn offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// Packed row-major values.
    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// View of array `index`.
    pub fn get(&self, index: usize) -> Option<ArrayView2<'_, f32>> {
        let (&offset, &len) = self.offsets.get(index).zip(self.lengths.get(index))?;
        let start = offset * self.common_width;
        let end = start + len * self.common_width;
        ArrayView2::from_shape((len, self.common_width), &self.data[start..end]).ok()
    }

    /// Mutable view of array `index`.
    pub fn get_mut(&mut self, index: usize) -> Option<ArrayViewMut2<'_, f32>> {
        let (&offset, &len) = self.offsets.get(index).zip(self.lengths.get(index))?;
        let start = offset * self.common_width;
        let end = start + len * self.common_width;
        ArrayViewMut2::from_shape((len, self.common_width), &mut self.data[start..end]).ok()
    }

    /// Iterate over views of every array, in order.
    pub fn iter(&self) -> impl Iterator<Item = ArrayView2<'_, f32>> + '_ {
        (0..self.len()).filter_map(move |i| self.get(i))
    }

    /// All rows as one `total_rows x width` view.
    pub fn rows(&self) -> Result<ArrayView2<'_, f32>> {
        ArrayView2::from_shape((self.total_rows(), self.common_width), &self.data)
            .map_err(|e| Error::ShapeMismatch(e.to_string()))
    }

    /// New sequence holding copies of the arrays at `indices`, in that order.
    pub fn select(&self, indices: &[usize]) -> Result<ArraySequence> {
        let rows: usize = indices
            .iter()
            .map(|&i| self.lengths.get(i).copied().ok_or(i))
            .sum::<std::result::Result<usize, usize>>()
            .map_err(|i| {
                Error::Configuration(format!(
                    "index {} out of range for sequence of {} arrays",
                    i,
                    self.len()
                ))
            })?;

        let mut out = Self::with_capacity(self.common_width, rows, indices.len());
        for &i in indices {
            let start = self.offsets[i] * self.common_width;
            let end = start + self.lengths[i] * self.common_width;
            out.offsets.push(out.total_rows());
            out.lengths.push(self.lengths[i]);
            out.data.extend_from_slice(&self.data[start..end]);
        }
        Ok(out)
    }
}
