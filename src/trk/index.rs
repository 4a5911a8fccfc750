//! Opt-in random access over a seekable TRK input.

use super::reader::StreamlineReader;
use crate::error::{Error, Result};
use crate::tractogram::TractogramItem;
use std::io::{Read, Seek};

/// Byte offset and point count of every record, built by one scanning pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamlineIndex {
    offsets: Vec<u64>,
    nb_points: Vec<usize>,
}

impl StreamlineIndex {
    /// Scan the remaining records of `reader` without decoding their values.
    pub fn build<R: Read>(reader: &mut StreamlineReader<R>) -> Result<Self> {
        let mut index = Self::default();
        while let Some(info) = reader.skip_record()? {
            index.offsets.push(info.offset);
            index.nb_points.push(info.nb_points);
        }
        log::debug!("indexed {} streamline records", index.len());
        Ok(index)
    }

    /// Number of indexed records.
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    /// True if the file has no records.
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    /// Byte offset of record `i`.
    pub fn offset(&self, i: usize) -> Option<u64> {
        self.offsets.get(i).copied()
    }

    /// Point count of record `i`.
    pub fn nb_points(&self, i: usize) -> Option<usize> {
        self.nb_points.get(i).copied()
    }

    /// Total points across all records.
    pub fn total_points(&self) -> usize {
        self.nb_points.iter().sum()
    }

    /// Decode record `i` by seeking `reader` to it. Items are in native space.
    pub fn read<R: Read + Seek>(
        &self,
        reader: &mut StreamlineReader<R>,
        i: usize,
    ) -> Result<Option<TractogramItem>> {
        let Some(offset) = self.offset(i) else {
            return Ok(None);
        };
        reader.seek_record(offset, i)?;
        match reader.read_record()? {
            Some(info) if info.nb_points == self.nb_points[i] => {
                reader.current_item(&info).map(Some)
            }
            Some(info) => Err(Error::InvalidRecord {
                offset,
                reason: format!(
                    "index records {} points for streamline {} but the file holds {}",
                    self.nb_points[i], i, info.nb_points
                ),
            }),
            None => Err(Error::InvalidRecord {
                offset,
                reason: format!("indexed streamline {} is missing", i),
            }),
        }
    }
}
