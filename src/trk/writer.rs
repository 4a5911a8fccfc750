//! Sequential TRK record encoder.

use super::header::{Endianness, FieldDescriptor, TrkHeader, CURRENT_VERSION};
use crate::error::{Error, Result};
use crate::tractogram::TractogramItem;
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};
use ndarray::{ArrayView1, ArrayView2};
use std::io::{Seek, SeekFrom, Write};

/// Writes streamlines one record at a time and finalizes the header.
///
/// Two modes:
/// - [`new`](Self::new) over a seekable output writes a provisional header
///   that readers reject, and [`finish`](Self::finish) patches in the real
///   one once the count is known.
/// - [`with_count`](Self::with_count) writes the final header up front for a
///   known count; [`finish_counted`](Self::finish_counted) checks it was met.
///
/// Points must already be in the file's voxmm space. Any failure is reported
/// as [`Error::IncompleteWrite`] and leaves the output unusable; dropping an
/// unfinished writer does not repair it.
#[derive(Debug)]
pub struct TrkWriter<W: Write> {
    inner: Option<W>,
    header: TrkHeader,
    declared: Option<usize>,
    allow_empty: bool,
    count: usize,
    buf: Vec<u8>,
}

impl<W: Write + Seek> TrkWriter<W> {
    /// Start a file whose streamline count is patched in by [`finish`](Self::finish).
    pub fn new(mut inner: W, mut header: TrkHeader) -> Result<Self> {
        header.version = CURRENT_VERSION;
        header.nb_streamlines = None;
        let bytes = header.to_provisional_bytes()?;
        inner
            .write_all(&bytes)
            .map_err(|e| Error::incomplete(0, e.into()))?;
        log::debug!("started TRK output with provisional header");
        Ok(Self::from_parts(inner, header, None))
    }

    /// Write the final header over the provisional one and return the output.
    pub fn finish(mut self) -> Result<W> {
        let written = self.count;
        let mut inner = self.take_inner()?;
        self.header.nb_streamlines = (written > 0).then_some(written);
        patch_header(&mut inner, &self.header).map_err(|e| Error::incomplete(written, e))?;
        log::debug!("finalized TRK header with {} streamlines", written);
        Ok(inner)
    }
}

fn patch_header<W: Write + Seek>(inner: &mut W, header: &TrkHeader) -> Result<()> {
    let bytes = header.to_bytes()?;
    inner.flush()?;
    inner.seek(SeekFrom::Start(0))?;
    inner.write_all(&bytes)?;
    inner.seek(SeekFrom::End(0))?;
    inner.flush()?;
    Ok(())
}

impl<W: Write> TrkWriter<W> {
    /// Start a file that will hold exactly `count` streamlines.
    pub fn with_count(mut inner: W, mut header: TrkHeader, count: usize) -> Result<Self> {
        header.version = CURRENT_VERSION;
        header.nb_streamlines = (count > 0).then_some(count);
        let bytes = header.to_bytes()?;
        inner
            .write_all(&bytes)
            .map_err(|e| Error::incomplete(0, e.into()))?;
        Ok(Self::from_parts(inner, header, Some(count)))
    }

    /// Check that the declared count was written and return the output.
    pub fn finish_counted(mut self) -> Result<W> {
        let written = self.count;
        let mut inner = self.take_inner()?;
        if let Some(declared) = self.declared {
            if declared != written {
                return Err(Error::incomplete(
                    written,
                    Error::Configuration(format!(
                        "header declares {} streamlines but {} were written",
                        declared, written
                    )),
                ));
            }
        }
        inner
            .flush()
            .map_err(|e| Error::incomplete(written, e.into()))?;
        Ok(inner)
    }

    fn from_parts(inner: W, header: TrkHeader, declared: Option<usize>) -> Self {
        Self {
            inner: Some(inner),
            header,
            declared,
            allow_empty: true,
            count: 0,
            buf: Vec::new(),
        }
    }

    fn take_inner(&mut self) -> Result<W> {
        self.inner.take().ok_or_else(|| {
            Error::incomplete(
                self.count,
                Error::Configuration("writer already finished".to_string()),
            )
        })
    }

    /// Reject streamlines with zero points.
    pub fn allow_empty_streamlines(mut self, allow: bool) -> Self {
        self.allow_empty = allow;
        self
    }

    /// Header being written (count excluded until finished).
    pub fn header(&self) -> &TrkHeader {
        &self.header
    }

    /// Number of streamlines written so far.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Write one item, matching its attributes to the header fields by name.
    pub fn write_item(&mut self, item: &TractogramItem) -> Result<()> {
        let index = self.count;
        let views = item.validate(index).and_then(|_| {
            let scalars = lookup(&self.header.scalar_fields, index, "per-point", |name| {
                item.data_for_points.get(name).map(|a| a.view())
            })?;
            let properties =
                lookup(&self.header.property_fields, index, "per-streamline", |name| {
                    item.data_for_streamline.get(name).map(|a| a.view())
                })?;
            if scalars.len() != item.data_for_points.len()
                || properties.len() != item.data_for_streamline.len()
            {
                return Err(Error::Configuration(format!(
                    "streamline {} carries attributes the header does not declare",
                    index
                )));
            }
            Ok((scalars, properties))
        });
        match views {
            Ok((scalars, properties)) => {
                self.write_views(item.streamline.view(), &scalars, &properties)
            }
            Err(e) => Err(Error::incomplete(index, e)),
        }
    }

    /// Write one record from views given in header field order.
    pub fn write_views(
        &mut self,
        points: ArrayView2<'_, f32>,
        scalars: &[ArrayView2<'_, f32>],
        properties: &[ArrayView1<'_, f32>],
    ) -> Result<()> {
        let written = self.count;
        self.encode(points, scalars, properties)
            .and_then(|_| {
                let inner = self.inner.as_mut().ok_or_else(|| {
                    Error::Configuration("writer already finished".to_string())
                })?;
                inner.write_all(&self.buf)?;
                Ok(())
            })
            .map_err(|e| Error::incomplete(written, e))?;
        self.count += 1;
        Ok(())
    }

    fn encode(
        &mut self,
        points: ArrayView2<'_, f32>,
        scalars: &[ArrayView2<'_, f32>],
        properties: &[ArrayView1<'_, f32>],
    ) -> Result<()> {
        let index = self.count;
        if let Some(declared) = self.declared {
            if index >= declared {
                return Err(Error::Configuration(format!(
                    "header declares {} streamlines, cannot write more",
                    declared
                )));
            }
        }
        if points.ncols() != 3 {
            return Err(Error::ShapeMismatch(format!(
                "streamline {} has {} coordinate columns, expected 3",
                index,
                points.ncols()
            )));
        }
        let n = points.nrows();
        if n == 0 && !self.allow_empty {
            return Err(Error::EmptyStreamline { index });
        }
        if i32::try_from(n).is_err() {
            return Err(Error::ShapeMismatch(format!(
                "streamline {} has {} points, more than a TRK record can hold",
                index, n
            )));
        }
        check_widths(
            &self.header.scalar_fields,
            index,
            scalars.iter().map(|s| (s.nrows(), s.ncols())),
            Some(n),
        )?;
        check_widths(
            &self.header.property_fields,
            index,
            properties.iter().map(|p| (1, p.len())),
            None,
        )?;

        let result = match self.header.endianness() {
            Endianness::Little => {
                encode_record::<LittleEndian>(&mut self.buf, points, scalars, properties)
            }
            Endianness::Big => {
                encode_record::<BigEndian>(&mut self.buf, points, scalars, properties)
            }
        };
        result.map_err(Error::from)
    }
}

impl<W: Write> Drop for TrkWriter<W> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            log::warn!(
                "TRK writer dropped before finishing after {} streamlines; output is incomplete",
                self.count
            );
        }
    }
}

fn lookup<A>(
    fields: &[FieldDescriptor],
    index: usize,
    kind: &str,
    get: impl Fn(&str) -> Option<A>,
) -> Result<Vec<A>> {
    fields
        .iter()
        .map(|field| {
            get(&field.name).ok_or_else(|| {
                Error::Configuration(format!(
                    "streamline {} is missing {} attribute '{}'",
                    index, kind, field.name
                ))
            })
        })
        .collect()
}

fn check_widths(
    fields: &[FieldDescriptor],
    index: usize,
    shapes: impl ExactSizeIterator<Item = (usize, usize)>,
    rows: Option<usize>,
) -> Result<()> {
    if shapes.len() != fields.len() {
        return Err(Error::ShapeMismatch(format!(
            "streamline {} provides {} attribute blocks, header declares {}",
            index,
            shapes.len(),
            fields.len()
        )));
    }
    for (field, (nrows, ncols)) in fields.iter().zip(shapes) {
        if ncols != field.width {
            return Err(Error::ShapeMismatch(format!(
                "attribute '{}' of streamline {} has width {}, header declares {}",
                field.name, index, ncols, field.width
            )));
        }
        if let Some(expected) = rows {
            if nrows != expected {
                return Err(Error::PointCountMismatch {
                    name: field.name.clone(),
                    streamline: index,
                    expected,
                    actual: nrows,
                });
            }
        }
    }
    Ok(())
}

fn encode_record<E: ByteOrder>(
    buf: &mut Vec<u8>,
    points: ArrayView2<'_, f32>,
    scalars: &[ArrayView2<'_, f32>],
    properties: &[ArrayView1<'_, f32>],
) -> std::io::Result<()> {
    buf.clear();
    buf.write_i32::<E>(points.nrows() as i32)?;
    for (i, point) in points.rows().into_iter().enumerate() {
        for &v in point {
            buf.write_f32::<E>(v)?;
        }
        for block in scalars {
            for &v in block.row(i) {
                buf.write_f32::<E>(v)?;
            }
        }
    }
    for block in properties {
        for &v in block {
            buf.write_f32::<E>(v)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trk::header::HEADER_SIZE;
    use crate::trk::reader::StreamlineReader;
    use ndarray::{array, Array2};
    use std::io::Cursor;

    fn fa_header() -> TrkHeader {
        TrkHeader {
            scalar_fields: vec![FieldDescriptor::new("fa", 1)],
            property_fields: vec![FieldDescriptor::new("weight", 2)],
            ..TrkHeader::default()
        }
    }

    fn item(n: usize) -> TractogramItem {
        let points = Array2::from_shape_fn((n, 3), |(i, j)| (i * 3 + j) as f32);
        TractogramItem::new(points)
            .with_point_data("fa", Array2::from_elem((n, 1), 0.25))
            .with_streamline_data("weight", array![1.0f32, 2.0])
    }

    #[test]
    fn test_seek_and_patch() {
        let mut writer = TrkWriter::new(Cursor::new(Vec::new()), fa_header()).unwrap();
        writer.write_item(&item(2)).unwrap();
        writer.write_item(&item(3)).unwrap();
        let bytes = writer.finish().unwrap().into_inner();

        let header = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.nb_streamlines, Some(2));
        assert_eq!(bytes.len(), HEADER_SIZE + (4 + 2 * 16 + 8) + (4 + 3 * 16 + 8));

        let items: Vec<_> = StreamlineReader::open(Cursor::new(bytes))
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(items, vec![item(2), item(3)]);
    }

    #[test]
    fn test_unfinished_output_is_rejected() {
        let mut out = Cursor::new(Vec::new());
        {
            let mut writer = TrkWriter::new(&mut out, fa_header()).unwrap();
            writer.write_item(&item(2)).unwrap();
        }
        let err = TrkHeader::from_bytes(out.get_ref()).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader { offset: 996, .. }));
    }

    #[test]
    fn test_counted_mode() {
        let mut writer = TrkWriter::with_count(Vec::new(), fa_header(), 1).unwrap();
        writer.write_item(&item(4)).unwrap();
        assert!(matches!(
            writer.write_item(&item(1)),
            Err(Error::IncompleteWrite { written: 1, .. })
        ));
        let bytes = writer.finish_counted().unwrap();
        assert_eq!(TrkHeader::from_bytes(&bytes).unwrap().nb_streamlines, Some(1));

        let short = TrkWriter::with_count(Vec::new(), fa_header(), 3).unwrap();
        assert!(short.finish_counted().is_err());
    }

    #[test]
    fn test_missing_attribute_is_incomplete_write() {
        let mut writer = TrkWriter::new(Cursor::new(Vec::new()), fa_header()).unwrap();
        writer.write_item(&item(1)).unwrap();
        let err = writer
            .write_item(&TractogramItem::new(Array2::zeros((2, 3))))
            .unwrap_err();
        match err {
            Error::IncompleteWrite { written, source } => {
                assert_eq!(written, 1);
                assert!(source.to_string().contains("missing per-point attribute 'fa'"));
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_width_mismatch() {
        let mut writer = TrkWriter::new(Cursor::new(Vec::new()), fa_header()).unwrap();
        let wide = item(2).with_point_data("fa", Array2::zeros((2, 2)));
        assert!(writer.write_item(&wide).is_err());
        assert_eq!(writer.count(), 0);
    }

    #[test]
    fn test_empty_streamline_policy() {
        let mut writer = TrkWriter::new(Cursor::new(Vec::new()), TrkHeader::default())
            .unwrap()
            .allow_empty_streamlines(false);
        let err = writer
            .write_item(&TractogramItem::new(Array2::zeros((0, 3))))
            .unwrap_err();
        assert!(matches!(
            err,
            Error::IncompleteWrite { written: 0, ref source }
                if matches!(**source, Error::EmptyStreamline { index: 0 })
        ));

        let mut lenient = TrkWriter::new(Cursor::new(Vec::new()), TrkHeader::default()).unwrap();
        lenient
            .write_item(&TractogramItem::new(Array2::zeros((0, 3))))
            .unwrap();
        assert_eq!(lenient.count(), 1);
        lenient.finish().unwrap();
    }

    #[test]
    fn test_big_endian_output() {
        let header = TrkHeader::default().with_endianness(Endianness::Big);
        let mut writer = TrkWriter::new(Cursor::new(Vec::new()), header).unwrap();
        writer
            .write_item(&TractogramItem::new(array![[1.0f32, 2.0, 3.0]]))
            .unwrap();
        let bytes = writer.finish().unwrap().into_inner();
        assert_eq!(&bytes[1000..1004], &1i32.to_be_bytes());
        assert_eq!(&bytes[1004..1008], &1.0f32.to_be_bytes());
    }
}
