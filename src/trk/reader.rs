//! Forward-only decoder over the TRK record region.

use super::header::{read_up_to, Endianness, FieldDescriptor, TrkHeader, HEADER_SIZE};
use crate::error::{Error, Result};
use crate::tractogram::{ArraySequence, PointSpace, Tractogram, TractogramItem};
use crate::transforms::Affine;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use ndarray::{Array1, Array2};
use std::collections::BTreeMap;
use std::io::{self, Read, Seek, SeekFrom};

/// Upper bound on the streamline count reserved up front from the header.
const MAX_PREALLOCATED_STREAMLINES: usize = 1 << 20;

/// Position and size of one decoded record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordInfo {
    /// Zero-based streamline index.
    pub index: usize,
    /// Byte offset of the record's point count in the file.
    pub offset: u64,
    /// Number of points.
    pub nb_points: usize,
}

/// Single-pass cursor producing one streamline per record, in file order.
///
/// The cursor never holds more than one record's bytes. It cannot be
/// rewound; reopen the source for another pass, or use a
/// [`StreamlineIndex`](super::StreamlineIndex) for random access. After the
/// first error every further call returns `None`.
#[derive(Debug)]
pub struct StreamlineReader<R> {
    inner: R,
    endianness: Endianness,
    scalar_fields: Vec<FieldDescriptor>,
    property_fields: Vec<FieldDescriptor>,
    nb_scalars: usize,
    nb_properties: usize,
    declared: Option<usize>,
    allow_empty: bool,
    position: u64,
    index: usize,
    raw: Vec<u8>,
    values: Vec<f32>,
    properties: Vec<f32>,
    done: bool,
}

impl<R: Read> StreamlineReader<R> {
    /// Read the header from `inner` and position at the first record.
    pub fn open(mut inner: R) -> Result<Self> {
        let header = TrkHeader::from_reader(&mut inner)?;
        Ok(Self::new(inner, &header))
    }

    /// Cursor over a source already positioned just past `header`.
    pub fn new(inner: R, header: &TrkHeader) -> Self {
        Self {
            inner,
            endianness: header.endianness(),
            scalar_fields: header.scalar_fields.clone(),
            property_fields: header.property_fields.clone(),
            nb_scalars: header.nb_scalars_per_point(),
            nb_properties: header.nb_properties_per_streamline(),
            declared: header.nb_streamlines,
            allow_empty: true,
            position: HEADER_SIZE as u64,
            index: 0,
            raw: Vec::new(),
            values: Vec::new(),
            properties: Vec::new(),
            done: false,
        }
    }

    /// Reject records with zero points.
    pub fn allow_empty_streamlines(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Byte offset of the next record.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Index of the next record.
    pub fn next_index(&self) -> usize {
        self.index
    }

    /// Decode the next record into the internal buffers.
    ///
    /// Returns `Ok(None)` at the end of the record region. The decoded values
    /// are available from [`point_values`](Self::point_values) and
    /// [`property_values`](Self::property_values) until the next call.
    pub fn read_record(&mut self) -> Result<Option<RecordInfo>> {
        let Some(nb_points) = self.read_count()? else {
            return Ok(None);
        };
        let offset = self.position;
        let (values_len, properties_len) = self.record_lengths(nb_points, offset)?;

        // The buffer grows with the bytes actually present, never with the
        // declared count, so a corrupt count cannot force a huge allocation.
        let body_bytes = (values_len + properties_len) * 4;
        self.raw.clear();
        let filled = (&mut self.inner)
            .take(body_bytes as u64)
            .read_to_end(&mut self.raw)
            .inspect_err(|_| self.done = true)?;
        if filled < body_bytes {
            return Err(self.truncated(offset, 4 + body_bytes as u64, 4 + filled as u64));
        }

        self.values.resize(values_len, 0.0);
        self.properties.resize(properties_len, 0.0);
        let (value_bytes, property_bytes) = self.raw.split_at(values_len * 4);
        match self.endianness {
            Endianness::Little => {
                LittleEndian::read_f32_into(value_bytes, &mut self.values);
                LittleEndian::read_f32_into(property_bytes, &mut self.properties);
            }
            Endianness::Big => {
                BigEndian::read_f32_into(value_bytes, &mut self.values);
                BigEndian::read_f32_into(property_bytes, &mut self.properties);
            }
        }

        Ok(Some(self.advance(offset, nb_points, body_bytes)))
    }

    /// Skip the next record without decoding its values.
    pub fn skip_record(&mut self) -> Result<Option<RecordInfo>> {
        let Some(nb_points) = self.read_count()? else {
            return Ok(None);
        };
        let offset = self.position;
        let (values_len, properties_len) = self.record_lengths(nb_points, offset)?;
        let body_bytes = (values_len + properties_len) * 4;

        let skipped = io::copy(
            &mut (&mut self.inner).take(body_bytes as u64),
            &mut io::sink(),
        )
        .inspect_err(|_| self.done = true)?;
        if skipped < body_bytes as u64 {
            return Err(self.truncated(offset, 4 + body_bytes as u64, 4 + skipped));
        }
        Ok(Some(self.advance(offset, nb_points, body_bytes)))
    }

    /// Count the remaining records by skipping over them.
    pub fn count_remaining(&mut self) -> Result<usize> {
        let mut count = 0;
        while self.skip_record()?.is_some() {
            count += 1;
        }
        Ok(count)
    }

    /// Interleaved `x, y, z, scalars...` values of the last decoded record.
    pub fn point_values(&self) -> &[f32] {
        &self.values
    }

    /// Per-streamline values of the last decoded record.
    pub fn property_values(&self) -> &[f32] {
        &self.properties
    }

    /// Per-point field layout.
    pub fn scalar_fields(&self) -> &[FieldDescriptor] {
        &self.scalar_fields
    }

    /// Per-streamline field layout.
    pub fn property_fields(&self) -> &[FieldDescriptor] {
        &self.property_fields
    }

    /// Split the last decoded record into an owned item.
    pub fn current_item(&self, info: &RecordInfo) -> Result<TractogramItem> {
        let n = info.nb_points;
        let stride = 3 + self.nb_scalars;

        let mut points = Vec::with_capacity(n * 3);
        let mut scalars: Vec<Vec<f32>> = self
            .scalar_fields
            .iter()
            .map(|f| Vec::with_capacity(n * f.width))
            .collect();
        for row in self.values.chunks_exact(stride) {
            points.extend_from_slice(&row[..3]);
            let mut col = 3;
            for (field, out) in self.scalar_fields.iter().zip(scalars.iter_mut()) {
                out.extend_from_slice(&row[col..col + field.width]);
                col += field.width;
            }
        }

        let shape_err = |e: ndarray::ShapeError| Error::ShapeMismatch(e.to_string());
        let streamline = Array2::from_shape_vec((n, 3), points).map_err(shape_err)?;
        let mut data_for_points = BTreeMap::new();
        for (field, values) in self.scalar_fields.iter().zip(scalars) {
            let array = Array2::from_shape_vec((n, field.width), values).map_err(shape_err)?;
            data_for_points.insert(field.name.clone(), array);
        }

        let mut data_for_streamline = BTreeMap::new();
        let mut col = 0;
        for field in &self.property_fields {
            let values = self.properties[col..col + field.width].to_vec();
            data_for_streamline.insert(field.name.clone(), Array1::from_vec(values));
            col += field.width;
        }

        Ok(TractogramItem {
            streamline,
            data_for_points,
            data_for_streamline,
        })
    }

    /// Drain every remaining record into a tractogram whose points stay in
    /// the file's space, tagged native with `affine_to_rasmm`.
    pub fn read_tractogram(&mut self, affine_to_rasmm: Affine) -> Result<Tractogram> {
        let capacity = self
            .declared
            .unwrap_or(0)
            .saturating_sub(self.index)
            .min(MAX_PREALLOCATED_STREAMLINES);
        let mut streamlines = ArraySequence::with_capacity(3, 0, capacity);
        let mut point_data: Vec<ArraySequence> = self
            .scalar_fields
            .iter()
            .map(|f| ArraySequence::with_capacity(f.width, 0, capacity))
            .collect();
        let mut streamline_data: Vec<Vec<f32>> = self
            .property_fields
            .iter()
            .map(|f| Vec::with_capacity(capacity * f.width))
            .collect();

        let stride = 3 + self.nb_scalars;
        let mut points = Vec::new();
        let mut scalars: Vec<Vec<f32>> = vec![Vec::new(); self.scalar_fields.len()];
        while self.read_record()?.is_some() {
            if self.nb_scalars == 0 {
                streamlines.push_rows(&self.values)?;
            } else {
                points.clear();
                scalars.iter_mut().for_each(Vec::clear);
                for row in self.values.chunks_exact(stride) {
                    points.extend_from_slice(&row[..3]);
                    let mut col = 3;
                    for (field, out) in self.scalar_fields.iter().zip(scalars.iter_mut()) {
                        out.extend_from_slice(&row[col..col + field.width]);
                        col += field.width;
                    }
                }
                streamlines.push_rows(&points)?;
                for (seq, values) in point_data.iter_mut().zip(&scalars) {
                    seq.push_rows(values)?;
                }
            }

            let mut col = 0;
            for (field, out) in self.property_fields.iter().zip(streamline_data.iter_mut()) {
                out.extend_from_slice(&self.properties[col..col + field.width]);
                col += field.width;
            }
        }

        let n = streamlines.len();
        log::debug!(
            "decoded {} streamlines ({} points)",
            n,
            streamlines.total_rows()
        );
        let data_per_point = self
            .scalar_fields
            .iter()
            .map(|f| f.name.clone())
            .zip(point_data)
            .collect();
        let data_per_streamline = self
            .property_fields
            .iter()
            .zip(streamline_data)
            .map(|(f, values)| {
                Array2::from_shape_vec((n, f.width), values)
                    .map(|table| (f.name.clone(), table))
                    .map_err(|e| Error::ShapeMismatch(e.to_string()))
            })
            .collect::<Result<_>>()?;
        Tractogram::from_parts(streamlines, data_per_point, data_per_streamline, affine_to_rasmm)?
            .with_space(PointSpace::Native)
    }

    fn read_count(&mut self) -> Result<Option<usize>> {
        if self.done {
            return Ok(None);
        }
        if self.declared == Some(self.index) {
            self.done = true;
            return Ok(None);
        }

        let mut count = [0u8; 4];
        let filled = read_up_to(&mut self.inner, &mut count).inspect_err(|_| self.done = true)?;
        if filled == 0 {
            if self.declared.is_some() {
                log::debug!(
                    "record region ended after {} of {:?} declared streamlines",
                    self.index,
                    self.declared
                );
                return Err(self.truncated(self.position, 4, 0));
            }
            self.done = true;
            return Ok(None);
        }
        if filled < count.len() {
            return Err(self.truncated(self.position, 4, filled as u64));
        }

        let nb_points = match self.endianness {
            Endianness::Little => LittleEndian::read_i32(&count),
            Endianness::Big => BigEndian::read_i32(&count),
        };
        if nb_points < 0 {
            self.done = true;
            return Err(Error::InvalidRecord {
                offset: self.position,
                reason: format!("negative point count {}", nb_points),
            });
        }
        if nb_points == 0 && !self.allow_empty {
            self.done = true;
            return Err(Error::EmptyStreamline { index: self.index });
        }
        Ok(Some(nb_points as usize))
    }

    fn record_lengths(&mut self, nb_points: usize, offset: u64) -> Result<(usize, usize)> {
        let values = nb_points
            .checked_mul(3 + self.nb_scalars)
            .filter(|v| v.checked_add(self.nb_properties).and_then(|t| t.checked_mul(4)).is_some());
        match values {
            Some(values) => Ok((values, self.nb_properties)),
            None => {
                self.done = true;
                Err(Error::InvalidRecord {
                    offset,
                    reason: format!("point count {} overflows the record size", nb_points),
                })
            }
        }
    }

    fn advance(&mut self, offset: u64, nb_points: usize, body_bytes: usize) -> RecordInfo {
        let info = RecordInfo {
            index: self.index,
            offset,
            nb_points,
        };
        self.position += 4 + body_bytes as u64;
        self.index += 1;
        info
    }

    fn truncated(&mut self, offset: u64, expected: u64, available: u64) -> Error {
        self.done = true;
        Error::TruncatedRecord {
            offset,
            streamline: self.index,
            expected,
            available,
        }
    }
}

impl<R: Read + Seek> StreamlineReader<R> {
    /// Reposition at the record starting at `offset`, which must be record
    /// number `index`.
    pub fn seek_record(&mut self, offset: u64, index: usize) -> Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        self.index = index;
        self.done = false;
        Ok(())
    }
}

impl<R: Read> Iterator for StreamlineReader<R> {
    type Item = Result<TractogramItem>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.read_record() {
            Ok(Some(info)) => Some(self.current_item(&info)),
            Ok(None) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn encode(header: &TrkHeader, records: &[(Vec<f32>, Vec<f32>)]) -> Vec<u8> {
        let mut bytes = header.to_bytes().unwrap();
        let stride = 3 + header.nb_scalars_per_point();
        for (values, props) in records {
            let mut count = [0u8; 4];
            LittleEndian::write_i32(&mut count, (values.len() / stride) as i32);
            bytes.extend_from_slice(&count);
            for v in values.iter().chain(props.iter()) {
                bytes.extend_from_slice(&v.to_le_bytes());
            }
        }
        bytes
    }

    fn header_with_fields(count: Option<usize>) -> TrkHeader {
        TrkHeader {
            scalar_fields: vec![FieldDescriptor::new("fa", 1), FieldDescriptor::new("rgb", 3)],
            property_fields: vec![FieldDescriptor::new("id", 1)],
            nb_streamlines: count,
            ..TrkHeader::default()
        }
    }

    fn two_records() -> Vec<(Vec<f32>, Vec<f32>)> {
        vec![
            (
                vec![
                    0.0, 1.0, 2.0, 0.5, 10.0, 11.0, 12.0, //
                    3.0, 4.0, 5.0, 0.6, 13.0, 14.0, 15.0,
                ],
                vec![7.0],
            ),
            (vec![6.0, 7.0, 8.0, 0.7, 16.0, 17.0, 18.0], vec![8.0]),
        ]
    }

    #[test]
    fn test_decode_records_in_order() {
        let bytes = encode(&header_with_fields(Some(2)), &two_records());
        let reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        let items: Vec<_> = reader.collect::<Result<_>>().unwrap();

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].streamline.dim(), (2, 3));
        assert_eq!(items[0].streamline[[1, 2]], 5.0);
        assert_eq!(items[0].data_for_points["fa"][[1, 0]], 0.6);
        assert_eq!(items[0].data_for_points["rgb"].row(0).to_vec(), vec![10.0, 11.0, 12.0]);
        assert_eq!(items[1].data_for_streamline["id"][0], 8.0);
    }

    #[test]
    fn test_unknown_count_reads_to_eof() {
        let bytes = encode(&header_with_fields(None), &two_records());
        let mut reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        assert_eq!(reader.count_remaining().unwrap(), 2);
    }

    #[test]
    fn test_record_offsets() {
        let bytes = encode(&header_with_fields(Some(2)), &two_records());
        let mut reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        let first = reader.skip_record().unwrap().unwrap();
        let second = reader.read_record().unwrap().unwrap();
        assert_eq!(first.offset, 1000);
        assert_eq!(second.offset, 1000 + 4 + (14 + 1) * 4);
        assert_eq!(second.nb_points, 1);
        assert!(reader.read_record().unwrap().is_none());
    }

    #[test]
    fn test_every_truncation_of_last_record_fails() {
        let bytes = encode(&header_with_fields(None), &two_records());
        let last_record = 4 + (7 + 1) * 4;
        for cut in 1..=last_record {
            let truncated = bytes[..bytes.len() - cut].to_vec();
            let results: Vec<_> = StreamlineReader::open(Cursor::new(truncated))
                .unwrap()
                .collect();
            if cut == last_record {
                // whole record removed: a shorter but valid file
                assert_eq!(results.len(), 1);
                assert!(results[0].is_ok());
            } else {
                assert_eq!(results.len(), 2, "cut {cut}");
                assert!(
                    matches!(results[1], Err(Error::TruncatedRecord { streamline: 1, .. })),
                    "cut {cut}: {:?}",
                    results[1]
                );
            }
        }
    }

    #[test]
    fn test_missing_declared_streamlines() {
        let bytes = encode(&header_with_fields(Some(3)), &two_records());
        let results: Vec<_> = StreamlineReader::open(Cursor::new(bytes)).unwrap().collect();
        assert_eq!(results.len(), 3);
        assert!(matches!(
            results[2],
            Err(Error::TruncatedRecord {
                streamline: 2,
                available: 0,
                ..
            })
        ));
    }

    #[test]
    fn test_huge_point_count_reports_truncation() {
        let header = TrkHeader {
            nb_streamlines: Some(i32::MAX as usize),
            ..TrkHeader::default()
        };
        let mut bytes = header.to_bytes().unwrap();
        bytes.extend_from_slice(&i32::MAX.to_le_bytes());
        bytes.extend_from_slice(&[0u8; 12]);

        let mut reader = StreamlineReader::open(Cursor::new(bytes.clone())).unwrap();
        match reader.read_record() {
            Err(Error::TruncatedRecord {
                streamline: 0,
                expected,
                available: 16,
                ..
            }) => assert_eq!(expected, 4 + i32::MAX as u64 * 12),
            other => panic!("unexpected {other:?}"),
        }
        assert!(reader.raw.capacity() < 1 << 20);

        let mut reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.read_tractogram(Affine::IDENTITY),
            Err(Error::TruncatedRecord { streamline: 0, .. })
        ));
    }

    #[test]
    fn test_negative_point_count() {
        let mut bytes = TrkHeader::default().to_bytes().unwrap();
        bytes.extend_from_slice(&(-3i32).to_le_bytes());
        let mut reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        assert!(matches!(
            reader.next(),
            Some(Err(Error::InvalidRecord { offset: 1000, .. }))
        ));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_empty_streamline_policy() {
        let bytes = encode(&TrkHeader::default(), &[(vec![], vec![]), (vec![1.0, 2.0, 3.0], vec![])]);

        let items: Vec<_> = StreamlineReader::open(Cursor::new(bytes.clone()))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items[0].len(), 0);
        assert_eq!(items[1].len(), 1);

        let mut strict = StreamlineReader::open(Cursor::new(bytes))
            .unwrap()
            .allow_empty_streamlines(false);
        assert!(matches!(
            strict.next(),
            Some(Err(Error::EmptyStreamline { index: 0 }))
        ));
    }

    #[test]
    fn test_big_endian_records() {
        let header = TrkHeader::default().with_endianness(Endianness::Big);
        let mut bytes = header.to_bytes().unwrap();
        bytes.extend_from_slice(&2i32.to_be_bytes());
        for v in [1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0] {
            bytes.extend_from_slice(&v.to_be_bytes());
        }
        let items: Vec<_> = StreamlineReader::open(Cursor::new(bytes))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items[0].streamline.row(1).to_vec(), vec![4.0, 5.0, 6.0]);
    }

    #[test]
    fn test_read_tractogram_matches_items() {
        let bytes = encode(&header_with_fields(Some(2)), &two_records());
        let eager = StreamlineReader::open(Cursor::new(bytes.clone()))
            .unwrap()
            .read_tractogram(Affine::IDENTITY)
            .unwrap();
        let items: Vec<_> = StreamlineReader::open(Cursor::new(bytes))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(eager.len(), 2);
        assert_eq!(eager.data_per_point()["rgb"].common_width(), 3);
        assert_eq!(eager.data_per_streamline()["id"].dim(), (2, 1));
        for (i, item) in items.iter().enumerate() {
            assert_eq!(&eager.get(i).unwrap(), item);
        }
    }

    #[test]
    fn test_seek_record() {
        let bytes = encode(&header_with_fields(Some(2)), &two_records());
        let mut reader = StreamlineReader::open(Cursor::new(bytes)).unwrap();
        reader.skip_record().unwrap();
        let second = reader.read_record().unwrap().unwrap();
        reader.seek_record(second.offset, 1).unwrap();
        let item = reader.next().unwrap().unwrap();
        assert_eq!(item.streamline.row(0).to_vec(), vec![6.0, 7.0, 8.0]);
    }
}
