//! TRK load and save.
//!
//! - Uncompressed files are memory-mapped for eager loads.
//! - `.trk.gz` files are decompressed in one shot with libdeflate, falling
//!   back to streaming decode, and compressed in parallel with gzp on save.
//! - Uncompressed saves write a provisional header and patch it once the
//!   streamline count is known; gzip saves count first.

use super::header::{FieldDescriptor, TrkHeader, CURRENT_VERSION, HEADER_SIZE, MAGIC};
use super::reader::StreamlineReader;
use super::source::{is_gzip_path, FileSource, TrkSource};
use super::writer::TrkWriter;
use crate::error::{Error, Result};
use crate::tractogram::{ArraySequence, LazyTractogram, PointSpace, Tractogram};
use crate::transforms::Affine;
use flate2::bufread::MultiGzDecoder;
use gzp::deflate::Gzip;
use gzp::par::compress::ParCompressBuilder;
use gzp::ZWriter;
use libdeflater::{DecompressionError, Decompressor};
use memmap2::Mmap;
use ndarray::{ArrayView1, ArrayView2};
use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Write};
use std::path::Path;

const WRITE_BUFFER_SIZE: usize = 1024 * 1024;
const GZIP_BUFFER_SIZE: usize = 256 * 1024;

/// Options for [`load_with_options`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOptions {
    /// Return a [`LazyTractogram`] instead of decoding everything.
    pub lazy: bool,
    /// Space the points are returned in.
    pub space: PointSpace,
    /// Accept streamlines with zero points.
    pub allow_empty_streamlines: bool,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            lazy: false,
            space: PointSpace::Rasmm,
            allow_empty_streamlines: true,
        }
    }
}

impl LoadOptions {
    /// Eager load into RAS+ mm, accepting empty streamlines.
    pub fn new() -> Self {
        Self::default()
    }

    /// Defer decoding to each pass over the file.
    pub fn lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    /// Space the loaded points are expressed in.
    pub fn space(mut self, space: PointSpace) -> Self {
        self.space = space;
        self
    }

    /// Whether a zero-point streamline loads or fails with
    /// [`Error::EmptyStreamline`].
    pub fn allow_empty_streamlines(mut self, allow: bool) -> Self {
        self.allow_empty_streamlines = allow;
        self
    }
}

/// Options for [`save_with_options`] and [`save_lazy`].
#[derive(Debug, Clone, PartialEq)]
pub struct SaveOptions {
    /// Reference geometry and byte order of the output.
    ///
    /// Field descriptors and the streamline count are replaced by the ones
    /// of the saved tractogram.
    pub header: TrkHeader,
    /// Accept streamlines with zero points.
    pub allow_empty_streamlines: bool,
}

impl Default for SaveOptions {
    fn default() -> Self {
        Self {
            header: TrkHeader::default(),
            allow_empty_streamlines: true,
        }
    }
}

impl SaveOptions {
    /// Little-endian output with the default header geometry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Use the geometry of `reference`, e.g. the header of a loaded file.
    pub fn reference(mut self, reference: &TrkHeader) -> Self {
        self.header.set_geometry_from(reference);
        self.header = self.header.with_endianness(reference.endianness());
        self
    }

    /// Use `header` as the output header, byte order included.
    pub fn header(mut self, header: TrkHeader) -> Self {
        self.header = header;
        self
    }

    /// Whether a zero-point streamline is written or fails the save.
    pub fn allow_empty_streamlines(mut self, allow: bool) -> Self {
        self.allow_empty_streamlines = allow;
        self
    }
}

/// Result of [`load_with_options`].
#[derive(Debug)]
pub enum Loaded {
    /// Every streamline decoded into memory.
    Eager(Tractogram),
    /// Streamlines decoded from the file on each pass.
    Lazy(LazyTractogram<FileSource>),
}

impl Loaded {
    /// True for [`Loaded::Lazy`].
    pub fn is_lazy(&self) -> bool {
        matches!(self, Self::Lazy(_))
    }

    /// Materialize if lazy.
    pub fn into_eager(self) -> Result<Tractogram> {
        match self {
            Self::Eager(t) => Ok(t),
            Self::Lazy(lazy) => lazy.materialize(),
        }
    }
}

/// Load a TRK file eagerly, with points in RAS+ mm.
///
/// # Example
/// ```ignore
/// let tractogram = trkio::load("bundle.trk")?;
/// println!("{} streamlines", tractogram.len());
/// ```
#[must_use = "this function returns a loaded tractogram that should be used"]
pub fn load<P: AsRef<Path>>(path: P) -> Result<Tractogram> {
    load_eager(path.as_ref(), &LoadOptions::default())
}

/// Open a TRK file lazily, with points yielded in RAS+ mm.
#[must_use = "this function returns a lazy tractogram that should be used"]
pub fn load_lazy<P: AsRef<Path>>(path: P) -> Result<LazyTractogram<FileSource>> {
    open_lazy(path.as_ref(), &LoadOptions::default().lazy(true))
}

/// Load a TRK file as configured by `options`.
#[must_use = "this function returns a loaded tractogram that should be used"]
pub fn load_with_options<P: AsRef<Path>>(path: P, options: &LoadOptions) -> Result<Loaded> {
    let path = path.as_ref();
    if options.lazy {
        open_lazy(path, options).map(Loaded::Lazy)
    } else {
        load_eager(path, options).map(Loaded::Eager)
    }
}

/// Decode a complete TRK file held in memory. `options.lazy` is ignored.
pub fn load_from_bytes(data: &[u8], options: &LoadOptions) -> Result<Tractogram> {
    let header = TrkHeader::from_bytes(data)?;
    let voxmm_to_rasmm = header.voxmm_to_rasmm()?;
    let native = StreamlineReader::new(&data[HEADER_SIZE..], &header)
        .allow_empty_streamlines(options.allow_empty_streamlines)
        .read_tractogram(voxmm_to_rasmm)?;
    Ok(match options.space {
        PointSpace::Rasmm => native.into_world(),
        PointSpace::Native => native,
    })
}

fn open_lazy(path: &Path, options: &LoadOptions) -> Result<LazyTractogram<FileSource>> {
    let lazy = LazyTractogram::open(FileSource::new(path))?
        .allow_empty_streamlines(options.allow_empty_streamlines);
    Ok(match options.space {
        PointSpace::Rasmm => lazy.into_world(),
        PointSpace::Native => lazy,
    })
}

fn load_eager(path: &Path, options: &LoadOptions) -> Result<Tractogram> {
    if is_gzip_path(path) {
        let compressed = std::fs::read(path)?;
        let data = decompress_gzip(&compressed)?;
        load_from_bytes(&data, options)
    } else {
        load_uncompressed(path, options)
    }
}

#[allow(unsafe_code)]
fn load_uncompressed(path: &Path, options: &LoadOptions) -> Result<Tractogram> {
    let file = File::open(path)?;
    // SAFETY: the map is read-only and dropped before returning; records are
    // copied out while decoding. External modification can only corrupt the
    // decoded values, which are validated as they are read.
    let mmap = unsafe { Mmap::map(&file)? };
    load_from_bytes(&mmap, options)
}

fn estimate_gzip_uncompressed_size(compressed: &[u8]) -> usize {
    // ISIZE (RFC 1952) is the size modulo 2^32 of the last member only.
    if compressed.len() >= 4 {
        let trailer = &compressed[compressed.len() - 4..];
        u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]) as usize
    } else {
        compressed.len() * 4
    }
}

fn decompress_gzip_streaming(compressed: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = MultiGzDecoder::new(BufReader::with_capacity(
        GZIP_BUFFER_SIZE,
        Cursor::new(compressed),
    ));
    let mut output = Vec::with_capacity(estimate_gzip_uncompressed_size(compressed));
    decoder
        .read_to_end(&mut output)
        .map_err(|e| Error::Decompression(format!("gzip stream decode failed: {e}")))?;
    Ok(output)
}

fn decompress_gzip(compressed: &[u8]) -> Result<Vec<u8>> {
    let estimated = estimate_gzip_uncompressed_size(compressed);
    let mut output = vec![0u8; estimated.max(HEADER_SIZE)];
    match Decompressor::new().gzip_decompress(compressed, &mut output) {
        Ok(written) if written == estimated => {
            output.truncate(written);
            Ok(output)
        }
        Ok(_) | Err(DecompressionError::InsufficientSpace) => {
            log::debug!("gzip trailer size unreliable; falling back to streaming decode");
            decompress_gzip_streaming(compressed)
        }
        Err(e) => Err(Error::Decompression(e.to_string())),
    }
}

/// Read only the header of a TRK file.
pub fn load_header<P: AsRef<Path>>(path: P) -> Result<TrkHeader> {
    let mut reader = FileSource::new(path).open()?;
    TrkHeader::from_reader(&mut reader)
}

/// True if `path` starts with the TRK magic (after decompression for `.gz`).
pub fn is_trk<P: AsRef<Path>>(path: P) -> bool {
    let mut magic = [0u8; 5];
    FileSource::new(path)
        .open()
        .and_then(|mut r| r.read_exact(&mut magic).map_err(Error::from))
        .is_ok_and(|_| &magic == MAGIC)
}

/// Save with the default header (1x1x1 identity `RAS` reference).
///
/// # Example
/// ```ignore
/// trkio::save(&tractogram, "bundle.trk.gz")?;
/// ```
pub fn save<P: AsRef<Path>>(tractogram: &Tractogram, path: P) -> Result<()> {
    save_with_options(tractogram, path, &SaveOptions::default())
}

/// Save a tractogram; `.gz` paths are gzip-compressed.
pub fn save_with_options<P: AsRef<Path>>(
    tractogram: &Tractogram,
    path: P,
    options: &SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let header = output_header(
        &options.header,
        tractogram.point_fields(),
        tractogram.streamline_fields(),
    )?;
    let points = native_points(tractogram, &header)?;
    log::debug!(
        "saving {} streamlines to {}",
        tractogram.len(),
        path.display()
    );

    let file = File::create(path)?;
    let out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    if is_gzip_path(path) {
        let parz = ParCompressBuilder::<Gzip>::new().from_writer(out);
        let mut writer = TrkWriter::with_count(parz, header, tractogram.len())?
            .allow_empty_streamlines(options.allow_empty_streamlines);
        write_tractogram(&mut writer, tractogram, &points)?;
        let mut parz = writer.finish_counted()?;
        finish_compression(&mut parz, tractogram.len())
    } else {
        let mut writer =
            TrkWriter::new(out, header)?.allow_empty_streamlines(options.allow_empty_streamlines);
        write_tractogram(&mut writer, tractogram, &points)?;
        writer.finish()?;
        Ok(())
    }
}

/// Encode a tractogram into an in-memory TRK file.
pub fn save_to_bytes(tractogram: &Tractogram, options: &SaveOptions) -> Result<Vec<u8>> {
    let header = output_header(
        &options.header,
        tractogram.point_fields(),
        tractogram.streamline_fields(),
    )?;
    let points = native_points(tractogram, &header)?;
    let mut writer = TrkWriter::new(Cursor::new(Vec::new()), header)?
        .allow_empty_streamlines(options.allow_empty_streamlines);
    write_tractogram(&mut writer, tractogram, &points)?;
    Ok(writer.finish()?.into_inner())
}

/// Stream a lazy tractogram into a new file without materializing it.
///
/// A `.gz` destination needs the count up front, so a source without a
/// recorded count is scanned once before writing.
pub fn save_lazy<S: TrkSource, P: AsRef<Path>>(
    lazy: &LazyTractogram<S>,
    path: P,
    options: &SaveOptions,
) -> Result<()> {
    let path = path.as_ref();
    let header = output_header(
        &options.header,
        field_pairs(&lazy.header().scalar_fields),
        field_pairs(&lazy.header().property_fields),
    )?;
    let to_native = header.rasmm_to_voxmm()?.compose(lazy.affine_to_rasmm());

    let file = File::create(path)?;
    let out = BufWriter::with_capacity(WRITE_BUFFER_SIZE, file);
    if is_gzip_path(path) {
        let count = lazy.count()?;
        let parz = ParCompressBuilder::<Gzip>::new().from_writer(out);
        let mut writer = TrkWriter::with_count(parz, header, count)?
            .allow_empty_streamlines(options.allow_empty_streamlines);
        write_lazy(&mut writer, lazy, &to_native)?;
        let mut parz = writer.finish_counted()?;
        finish_compression(&mut parz, count)
    } else {
        let mut writer =
            TrkWriter::new(out, header)?.allow_empty_streamlines(options.allow_empty_streamlines);
        write_lazy(&mut writer, lazy, &to_native)?;
        writer.finish()?;
        Ok(())
    }
}

fn field_pairs(fields: &[FieldDescriptor]) -> Vec<(String, usize)> {
    fields.iter().map(|f| (f.name.clone(), f.width)).collect()
}

fn output_header(
    reference: &TrkHeader,
    point_fields: Vec<(String, usize)>,
    streamline_fields: Vec<(String, usize)>,
) -> Result<TrkHeader> {
    let mut header = reference.clone();
    header.scalar_fields = point_fields
        .into_iter()
        .map(|(name, width)| FieldDescriptor::new(name, width))
        .collect();
    header.property_fields = streamline_fields
        .into_iter()
        .map(|(name, width)| FieldDescriptor::new(name, width))
        .collect();
    header.nb_streamlines = None;
    header.version = CURRENT_VERSION;
    // surface descriptor problems before any byte is written
    header.to_bytes()?;
    Ok(header)
}

fn native_points(tractogram: &Tractogram, header: &TrkHeader) -> Result<ArraySequence> {
    let to_native = header
        .rasmm_to_voxmm()?
        .compose(tractogram.affine_to_rasmm());
    let mut points = tractogram.streamlines().clone();
    to_native.apply_points(points.as_mut_slice());
    Ok(points)
}

fn write_tractogram<W: Write>(
    writer: &mut TrkWriter<W>,
    tractogram: &Tractogram,
    points: &ArraySequence,
) -> Result<()> {
    // header fields were built from these maps, so iteration orders agree
    let per_point: Vec<&ArraySequence> = tractogram.data_per_point().values().collect();
    let per_streamline: Vec<_> = tractogram.data_per_streamline().values().collect();
    for (i, streamline) in points.iter().enumerate() {
        let scalars: Vec<ArrayView2<'_, f32>> =
            per_point.iter().filter_map(|seq| seq.get(i)).collect();
        let properties: Vec<ArrayView1<'_, f32>> =
            per_streamline.iter().map(|table| table.row(i)).collect();
        writer.write_views(streamline, &scalars, &properties)?;
    }
    Ok(())
}

fn write_lazy<S: TrkSource, W: Write>(
    writer: &mut TrkWriter<W>,
    lazy: &LazyTractogram<S>,
    to_native: &Affine,
) -> Result<()> {
    for item in lazy.iter()? {
        let mut item = item.map_err(|e| Error::incomplete(writer.count(), e))?;
        item.apply_affine(to_native);
        writer.write_item(&item)?;
    }
    Ok(())
}

fn finish_compression<Z: ZWriter + ?Sized>(parz: &mut Z, written: usize) -> Result<()> {
    parz.finish().map_err(|e| {
        Error::incomplete(
            written,
            Error::Io(std::io::Error::other(format!(
                "parallel compression finish failed: {e}"
            ))),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use tempfile::tempdir;

    fn sample() -> Tractogram {
        let streamlines =
            ArraySequence::from_flat(3, (0..15).map(|v| v as f32).collect(), vec![2, 3]).unwrap();
        let fa = ArraySequence::from_flat(1, vec![0.1, 0.2, 0.3, 0.4, 0.5], vec![2, 3]).unwrap();
        Tractogram::from_streamlines(streamlines, Affine::IDENTITY)
            .unwrap()
            .with_data_per_point("fa", fa)
            .unwrap()
            .with_data_per_streamline("id", array![[1.0f32], [2.0]])
            .unwrap()
    }

    fn assert_points_close(a: &Tractogram, b: &Tractogram) {
        assert_eq!(a.streamlines().lengths(), b.streamlines().lengths());
        for (x, y) in a
            .streamlines()
            .as_slice()
            .iter()
            .zip(b.streamlines().as_slice())
        {
            assert!((x - y).abs() < 1e-4, "{x} vs {y}");
        }
    }

    #[test]
    fn test_bytes_roundtrip() {
        let t = sample();
        let bytes = save_to_bytes(&t, &SaveOptions::default()).unwrap();
        let back = load_from_bytes(&bytes, &LoadOptions::default()).unwrap();
        assert_points_close(&t, &back);
        assert_eq!(back.data_per_point(), t.data_per_point());
        assert_eq!(back.data_per_streamline(), t.data_per_streamline());
        assert!(back.affine_to_rasmm().is_identity());
    }

    #[test]
    fn test_native_space_load() {
        let bytes = save_to_bytes(&sample(), &SaveOptions::default()).unwrap();
        let native = load_from_bytes(&bytes, &LoadOptions::new().space(PointSpace::Native)).unwrap();
        assert_eq!(native.space(), PointSpace::Native);
        // default header: voxmm = rasmm + 0.5
        assert!((native.streamlines().as_slice()[0] - 0.5).abs() < 1e-6);
        assert_points_close(&native.to_world(), &sample());
    }

    #[test]
    fn test_file_roundtrip_plain_and_gzip() {
        let dir = tempdir().unwrap();
        for name in ["t.trk", "t.trk.gz"] {
            let path = dir.path().join(name);
            save(&sample(), &path).unwrap();
            assert!(is_trk(&path));
            assert_eq!(load_header(&path).unwrap().nb_streamlines, Some(2));
            let back = load(&path).unwrap();
            assert_points_close(&sample(), &back);
            assert_eq!(back.data_per_point(), sample().data_per_point());
        }
    }

    #[test]
    fn test_is_trk_rejects_other_files() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("not.trk");
        std::fs::write(&path, b"NIFTI").unwrap();
        assert!(!is_trk(&path));
        assert!(!is_trk(dir.path().join("missing.trk")));
    }

    #[test]
    fn test_reference_header_geometry() {
        let reference = TrkHeader {
            dimensions: [20, 20, 20],
            voxel_sizes: [2.0, 2.0, 2.0],
            voxel_to_rasmm: Affine::new([
                [-2.0, 0.0, 0.0, 20.0],
                [0.0, 2.0, 0.0, -20.0],
                [0.0, 0.0, 2.0, -20.0],
                [0.0, 0.0, 0.0, 1.0],
            ]),
            voxel_order: "LAS".to_string(),
            ..TrkHeader::default()
        };
        let options = SaveOptions::new().reference(&reference);
        let bytes = save_to_bytes(&sample(), &options).unwrap();
        let header = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header.voxel_order, "LAS");
        assert_eq!(header.dimensions, [20, 20, 20]);
        assert_eq!(header.scalar_fields, vec![FieldDescriptor::new("fa", 1)]);

        let back = load_from_bytes(&bytes, &LoadOptions::default()).unwrap();
        assert_points_close(&sample(), &back);
    }

    #[test]
    fn test_invalid_field_name_fails_before_writing() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.trk");
        let t = sample()
            .with_data_per_streamline("a_name_that_is_far_too_long", array![[0.0f32], [0.0]])
            .unwrap();
        assert!(matches!(save(&t, &path), Err(Error::Configuration(_))));
        assert!(!path.exists());
    }

    fn one_record_file(header: &TrkHeader, nb_points: i32, body: &[f32]) -> Vec<u8> {
        let mut bytes = header.to_bytes().unwrap();
        bytes.extend_from_slice(&nb_points.to_le_bytes());
        for v in body {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes
    }

    #[test]
    fn test_nan_voxel_affine_fails_to_load() {
        let mut bytes = one_record_file(&TrkHeader::default(), 1, &[1.0, 2.0, 3.0]);
        bytes[440..444].copy_from_slice(&f32::NAN.to_le_bytes());
        for space in [PointSpace::Rasmm, PointSpace::Native] {
            let options = LoadOptions::new().space(space);
            assert!(matches!(
                load_from_bytes(&bytes, &options),
                Err(Error::NonInvertibleAffine)
            ));
        }
    }

    #[test]
    fn test_huge_point_count_fails_as_truncated() {
        let header = TrkHeader {
            nb_streamlines: Some(1),
            ..TrkHeader::default()
        };
        let bytes = one_record_file(&header, i32::MAX, &[1.0, 2.0, 3.0]);
        assert!(matches!(
            load_from_bytes(&bytes, &LoadOptions::default()),
            Err(Error::TruncatedRecord {
                streamline: 0,
                available: 16,
                ..
            })
        ));
    }

    #[test]
    fn test_native_load_is_native_with_identity_affine() {
        let header = TrkHeader {
            voxel_to_rasmm: Affine::translation([0.5; 3]),
            nb_streamlines: Some(1),
            ..TrkHeader::default()
        };
        let bytes = one_record_file(&header, 1, &[1.0, 2.0, 3.0]);
        let native =
            load_from_bytes(&bytes, &LoadOptions::new().space(PointSpace::Native)).unwrap();
        assert!(native.affine_to_rasmm().is_identity());
        assert_eq!(native.space(), PointSpace::Native);

        let world = load_from_bytes(&bytes, &LoadOptions::default()).unwrap();
        assert_eq!(world.space(), PointSpace::Rasmm);
        assert_eq!(world.streamlines().as_slice(), native.streamlines().as_slice());
    }
}
