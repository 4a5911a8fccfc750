//! Tractogram decoded on demand from a reopenable source.

use super::{PointSpace, Tractogram, TractogramItem};
use crate::error::{Error, Result};
use crate::transforms::Affine;
use crate::trk::{StreamlineIndex, StreamlineReader, TrkHeader, TrkSource};
use std::io::{Read, Seek};

/// Tractogram whose streamlines are decoded from `source` on every pass.
///
/// Nothing is materialized: [`iter`](Self::iter) opens an independent reader
/// each time, and transforms are recorded and applied to each item as it is
/// decoded. Use [`materialize`](Self::materialize) to load everything.
#[derive(Debug, Clone)]
pub struct LazyTractogram<S> {
    source: S,
    header: TrkHeader,
    transform: Affine,
    affine_to_rasmm: Affine,
    space: PointSpace,
    allow_empty: bool,
}

impl<S: TrkSource> LazyTractogram<S> {
    /// Read the header of `source`; points are yielded in native voxmm space.
    pub fn open(source: S) -> Result<Self> {
        let mut reader = source.open()?;
        let header = TrkHeader::from_reader(&mut reader)?;
        let affine_to_rasmm = header.voxmm_to_rasmm()?;
        affine_to_rasmm.inverse()?;
        log::debug!("opened lazy tractogram over {}", source.describe());
        Ok(Self {
            source,
            header,
            transform: Affine::IDENTITY,
            affine_to_rasmm,
            space: PointSpace::Native,
            allow_empty: true,
        })
    }

    /// Reject zero-point streamlines during iteration.
    pub fn allow_empty_streamlines(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Header of the underlying file.
    pub fn header(&self) -> &TrkHeader {
        &self.header
    }

    /// Where records are read from.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// Affine taking yielded points to RAS+ mm.
    pub fn affine_to_rasmm(&self) -> &Affine {
        &self.affine_to_rasmm
    }

    /// Space the yielded points are in.
    pub fn space(&self) -> PointSpace {
        self.space
    }

    /// Per-point attribute names, in record order.
    pub fn point_field_names(&self) -> Vec<&str> {
        self.header
            .scalar_fields
            .iter()
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Per-streamline attribute names, in record order.
    pub fn streamline_field_names(&self) -> Vec<&str> {
        self.header
            .property_fields
            .iter()
            .map(|f| f.name.as_str())
            .collect()
    }

    /// Record `affine` to be applied to every yielded point.
    pub fn into_transformed(mut self, affine: &Affine) -> Result<Self> {
        let inverse = affine.inverse()?;
        self.transform = affine.compose(&self.transform);
        self.affine_to_rasmm = self.affine_to_rasmm.compose(&inverse);
        if !affine.is_identity() {
            self.space = PointSpace::Native;
        }
        Ok(self)
    }

    /// Yield points in RAS+ mm from now on.
    pub fn into_world(mut self) -> Self {
        self.transform = self.affine_to_rasmm.compose(&self.transform);
        self.affine_to_rasmm = Affine::IDENTITY;
        self.space = PointSpace::Rasmm;
        self
    }

    /// Start a new pass over the source.
    ///
    /// Each call opens its own reader; passes do not share state.
    pub fn iter(&self) -> Result<LazyIter<S::Reader>> {
        Ok(LazyIter {
            reader: self.open_reader()?,
            transform: self.transform,
        })
    }

    /// Number of streamlines, from the header or by scanning the records.
    pub fn count(&self) -> Result<usize> {
        if let Some(n) = self.header.nb_streamlines {
            return Ok(n);
        }
        log::warn!(
            "streamline count not recorded in {}; scanning records",
            self.source.describe()
        );
        self.open_reader()?.count_remaining()
    }

    /// Decode every streamline into a [`Tractogram`] in the current space.
    pub fn materialize(&self) -> Result<Tractogram> {
        let native = self
            .open_reader()?
            .read_tractogram(self.header.voxmm_to_rasmm()?)?;
        Ok(native.transformed_to(&self.transform, self.affine_to_rasmm, self.space))
    }

    /// Scan the source once and record every record's offset.
    pub fn build_index(&self) -> Result<StreamlineIndex> {
        StreamlineIndex::build(&mut self.open_reader()?)
    }

    fn open_reader(&self) -> Result<StreamlineReader<S::Reader>> {
        let mut inner = self.source.open()?;
        let header = TrkHeader::from_reader(&mut inner)?;
        if header != self.header {
            return Err(Error::Configuration(format!(
                "header of {} changed since it was opened",
                self.source.describe()
            )));
        }
        Ok(StreamlineReader::new(inner, &header).allow_empty_streamlines(self.allow_empty))
    }
}

impl<S: TrkSource + Clone> LazyTractogram<S> {
    /// Lazy view with `affine` applied to every point. The source is shared.
    pub fn apply_affine(&self, affine: &Affine) -> Result<Self> {
        self.clone().into_transformed(affine)
    }

    /// Lazy view yielding RAS+ mm points.
    pub fn to_world(&self) -> Self {
        self.clone().into_world()
    }
}

impl<S> LazyTractogram<S>
where
    S: TrkSource,
    S::Reader: Seek,
{
    /// Decode streamline `i` through `index`, in the current space.
    pub fn get_indexed(
        &self,
        index: &StreamlineIndex,
        i: usize,
    ) -> Result<Option<TractogramItem>> {
        let mut reader = self.open_reader()?;
        let item = index.read(&mut reader, i)?;
        Ok(item.map(|mut item| {
            item.apply_affine(&self.transform);
            item
        }))
    }
}

/// One pass over a lazy tractogram.
#[derive(Debug)]
pub struct LazyIter<R> {
    reader: StreamlineReader<R>,
    transform: Affine,
}

impl<R: Read> Iterator for LazyIter<R> {
    type Item = Result<TractogramItem>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.reader.next()?;
        Some(item.map(|mut item| {
            item.apply_affine(&self.transform);
            item
        }))
    }
}
