//! TrackVis header parsing and representation.
//!
//! The header is a fixed 1000-byte block. Byte order is detected from the
//! `hdr_size` field, which must read as 1000 in the file's byte order.

use crate::error::{Error, Result};
use crate::transforms::orientation::axcodes_to_orientation;
use crate::transforms::Affine;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::io::Read;

/// Size of the TRK header in bytes.
pub const HEADER_SIZE: usize = 1000;

/// Leading bytes of every TRK file.
pub const MAGIC: &[u8; 5] = b"TRACK";

/// Maximum number of named per-point or per-streamline fields.
pub const MAX_NAMED_FIELDS: usize = 10;

/// Size of one encoded field name slot.
pub const FIELD_NAME_SIZE: usize = 20;

/// Version written by this crate.
pub const CURRENT_VERSION: i32 = 2;

/// TRK header field byte offsets.
///
/// Padding and reserved regions are listed for completeness; they are
/// written as zeros.
#[allow(dead_code)]
pub(crate) mod offsets {
    pub const ID_STRING: usize = 0;
    pub const DIMENSIONS: usize = 6;
    pub const VOXEL_SIZES: usize = 12;
    pub const ORIGIN: usize = 24;
    pub const NB_SCALARS_PER_POINT: usize = 36;
    pub const SCALAR_NAME: usize = 38;
    pub const NB_PROPERTIES_PER_STREAMLINE: usize = 238;
    pub const PROPERTY_NAME: usize = 240;
    pub const VOXEL_TO_RASMM: usize = 440;
    pub const RESERVED: usize = 504;
    pub const VOXEL_ORDER: usize = 948;
    pub const PAD2: usize = 952;
    pub const IMAGE_ORIENTATION_PATIENT: usize = 956;
    pub const PAD1: usize = 980;
    pub const INVERT_X: usize = 982;
    pub const NB_STREAMLINES: usize = 988;
    pub const VERSION: usize = 992;
    pub const HDR_SIZE: usize = 996;
}

/// Byte order of a TRK file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Endianness {
    /// Least significant byte first.
    #[default]
    Little,
    /// Most significant byte first.
    Big,
}

/// A named block of `width` f32 values attached per point or per streamline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescriptor {
    /// Attribute name.
    pub name: String,
    /// Number of f32 values per point (or per streamline).
    pub width: usize,
}

impl FieldDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, width: usize) -> Self {
        Self {
            name: name.into(),
            width,
        }
    }

    /// Decode one 20-byte name slot: `name` or `name\0<width>`, NUL padded.
    ///
    /// Empty slots and slots declaring width 0 yield `None`.
    fn decode(raw: &[u8], offset: usize) -> Result<Option<Self>> {
        let name_end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        if name_end == 0 {
            return Ok(None);
        }
        let name: String = raw[..name_end].iter().map(|&b| b as char).collect();

        let rest = raw.get(name_end + 1..).unwrap_or(&[]);
        let suffix_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let suffix = &rest[..suffix_end];
        let width = if suffix.is_empty() {
            1
        } else {
            std::str::from_utf8(suffix)
                .ok()
                .and_then(|s| s.parse::<usize>().ok())
                .ok_or_else(|| {
                    Error::descriptor(
                        offset,
                        format!(
                            "field '{}' has non-numeric width suffix {:?}",
                            name,
                            String::from_utf8_lossy(suffix)
                        ),
                    )
                })?
        };

        if width == 0 {
            return Ok(None);
        }
        Ok(Some(Self { name, width }))
    }

    /// Encode into a 20-byte name slot.
    fn encode(&self) -> Result<[u8; FIELD_NAME_SIZE]> {
        if self.width == 0 {
            return Err(Error::Configuration(format!(
                "field '{}' has width 0",
                self.name
            )));
        }
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(Error::Configuration(format!(
                "field name {:?} must be non-empty and contain no NUL bytes",
                self.name
            )));
        }

        let mut encoded: Vec<u8> = Vec::with_capacity(FIELD_NAME_SIZE);
        for c in self.name.chars() {
            let code = c as u32;
            if code > 0xFF {
                return Err(Error::Configuration(format!(
                    "field name '{}' is not representable in Latin-1",
                    self.name
                )));
            }
            encoded.push(code as u8);
        }
        if self.width > 1 {
            encoded.push(0);
            encoded.extend_from_slice(self.width.to_string().as_bytes());
        }
        if encoded.len() > FIELD_NAME_SIZE {
            return Err(Error::Configuration(format!(
                "field '{}' with width {} needs {} bytes, limit is {}",
                self.name,
                self.width,
                encoded.len(),
                FIELD_NAME_SIZE
            )));
        }

        let mut slot = [0u8; FIELD_NAME_SIZE];
        slot[..encoded.len()].copy_from_slice(&encoded);
        Ok(slot)
    }
}

/// Parsed TrackVis header.
#[derive(Debug, Clone, PartialEq)]
pub struct TrkHeader {
    /// Reference volume dimensions, in voxels.
    pub dimensions: [i16; 3],
    /// Reference volume voxel sizes, in millimeters.
    pub voxel_sizes: [f32; 3],
    /// Volume origin (unused by TrackVis, kept for round-tripping).
    pub origin: [f32; 3],
    /// Per-point fields, in record order.
    pub scalar_fields: Vec<FieldDescriptor>,
    /// Per-streamline fields, in record order.
    pub property_fields: Vec<FieldDescriptor>,
    /// Voxel to RAS+ millimeter affine of the reference volume.
    pub voxel_to_rasmm: Affine,
    /// Voxel axis codes of the reference volume, e.g. `"LPS"`.
    pub voxel_order: String,
    /// DICOM image orientation of the reference volume.
    pub image_orientation_patient: [f32; 6],
    /// `invert_x`, `invert_y`, `invert_z`, `swap_xy`, `swap_yz`, `swap_zx`.
    pub orientation_flags: [u8; 6],
    /// Declared streamline count; `None` when not recorded.
    pub nb_streamlines: Option<usize>,
    /// Format version.
    pub version: i32,
    /// Byte order the header was read in, and that [`to_bytes`](Self::to_bytes)
    /// writes the header and records in.
    pub endianness: Endianness,
}

impl Default for TrkHeader {
    fn default() -> Self {
        Self {
            dimensions: [1, 1, 1],
            voxel_sizes: [1.0, 1.0, 1.0],
            origin: [0.0; 3],
            scalar_fields: Vec::new(),
            property_fields: Vec::new(),
            voxel_to_rasmm: Affine::IDENTITY,
            voxel_order: "RAS".to_string(),
            image_orientation_patient: [0.0; 6],
            orientation_flags: [0; 6],
            nb_streamlines: None,
            version: CURRENT_VERSION,
            endianness: Endianness::Little,
        }
    }
}

impl TrkHeader {
    /// Read a header from the start of `reader`.
    pub fn from_reader<R: Read>(reader: &mut R) -> Result<Self> {
        let mut buf = [0u8; HEADER_SIZE];
        let read = read_up_to(reader, &mut buf)?;
        Self::from_bytes(&buf[..read])
    }

    /// Parse a header with automatic byte order detection.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(Error::malformed(
                bytes.len(),
                format!(
                    "header too short: got {} bytes, need {}",
                    bytes.len(),
                    HEADER_SIZE
                ),
            ));
        }

        if &bytes[..MAGIC.len()] != MAGIC {
            return Err(Error::malformed(
                offsets::ID_STRING,
                format!(
                    "invalid TRK magic {:?}, expected \"TRACK\"",
                    String::from_utf8_lossy(&bytes[..MAGIC.len()])
                ),
            ));
        }

        use offsets::HDR_SIZE;
        let hdr_size_le = LittleEndian::read_i32(&bytes[HDR_SIZE..HDR_SIZE + 4]);
        let hdr_size_be = BigEndian::read_i32(&bytes[HDR_SIZE..HDR_SIZE + 4]);
        if hdr_size_le == HEADER_SIZE as i32 {
            Self::parse::<LittleEndian>(bytes, Endianness::Little)
        } else if hdr_size_be == HEADER_SIZE as i32 {
            Self::parse::<BigEndian>(bytes, Endianness::Big)
        } else if hdr_size_le == 0 {
            Err(Error::malformed(
                HDR_SIZE,
                "header size is 0: the file was never finalized (interrupted write?)",
            ))
        } else {
            Err(Error::malformed(
                HDR_SIZE,
                format!(
                    "header size reads {} (little-endian) / {} (big-endian), expected {}",
                    hdr_size_le, hdr_size_be, HEADER_SIZE
                ),
            ))
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn parse<E: ByteOrder>(bytes: &[u8], endianness: Endianness) -> Result<Self> {
        use offsets::*;

        let version = E::read_i32(&bytes[VERSION..VERSION + 4]);
        match version {
            1 => log::warn!("TRK version 1 has no voxel-to-RAS affine; assuming identity"),
            2 => {}
            3 => log::warn!("parsing TRK version 3 as version 2"),
            other => return Err(Error::UnsupportedVersion { version: other }),
        }

        let mut dimensions = [0i16; 3];
        for (i, d) in dimensions.iter_mut().enumerate() {
            let off = DIMENSIONS + i * 2;
            *d = E::read_i16(&bytes[off..off + 2]);
        }

        let mut voxel_sizes = [0f32; 3];
        for (i, v) in voxel_sizes.iter_mut().enumerate() {
            let off = VOXEL_SIZES + i * 4;
            *v = E::read_f32(&bytes[off..off + 4]);
            if !v.is_finite() || *v == 0.0 {
                return Err(Error::malformed(
                    off,
                    format!("voxel size {} must be finite and non-zero, got {}", i, v),
                ));
            }
        }

        let mut origin = [0f32; 3];
        E::read_f32_into(&bytes[ORIGIN..ORIGIN + 12], &mut origin);

        let nb_scalars = E::read_i16(&bytes[NB_SCALARS_PER_POINT..NB_SCALARS_PER_POINT + 2]);
        let nb_properties = E::read_i16(
            &bytes[NB_PROPERTIES_PER_STREAMLINE..NB_PROPERTIES_PER_STREAMLINE + 2],
        );
        let scalar_fields = decode_fields(
            bytes,
            SCALAR_NAME,
            NB_SCALARS_PER_POINT,
            nb_scalars,
            "scalars",
        )?;
        let property_fields = decode_fields(
            bytes,
            PROPERTY_NAME,
            NB_PROPERTIES_PER_STREAMLINE,
            nb_properties,
            "properties",
        )?;

        let mut matrix = [[0f32; 4]; 4];
        for (r, row) in matrix.iter_mut().enumerate() {
            let off = VOXEL_TO_RASMM + r * 16;
            E::read_f32_into(&bytes[off..off + 16], row);
        }
        let voxel_to_rasmm = if version == 1 {
            Affine::IDENTITY
        } else if matrix[3][3] == 0.0 {
            log::warn!("voxel-to-RAS affine was not recorded in the TRK header; assuming identity");
            Affine::IDENTITY
        } else {
            Affine::from_f32(matrix)
        };

        let mut voxel_order = latin1_until_nul(&bytes[VOXEL_ORDER..VOXEL_ORDER + 4]);
        if voxel_order.is_empty() {
            log::warn!("voxel order is not specified; assuming LPS (TrackVis default)");
            voxel_order = "LPS".to_string();
        }
        axcodes_to_orientation(&voxel_order)
            .map_err(|e| Error::malformed(VOXEL_ORDER, e.to_string()))?;

        let mut image_orientation_patient = [0f32; 6];
        E::read_f32_into(
            &bytes[IMAGE_ORIENTATION_PATIENT..IMAGE_ORIENTATION_PATIENT + 24],
            &mut image_orientation_patient,
        );

        let mut orientation_flags = [0u8; 6];
        orientation_flags.copy_from_slice(&bytes[INVERT_X..INVERT_X + 6]);

        let count = E::read_i32(&bytes[NB_STREAMLINES..NB_STREAMLINES + 4]);
        let nb_streamlines = match count {
            0 => None,
            n if n > 0 => Some(n as usize),
            n => {
                return Err(Error::malformed(
                    NB_STREAMLINES,
                    format!("streamline count is negative: {}", n),
                ))
            }
        };

        let header = Self {
            dimensions,
            voxel_sizes,
            origin,
            scalar_fields,
            property_fields,
            voxel_to_rasmm,
            voxel_order,
            image_orientation_patient,
            orientation_flags,
            nb_streamlines,
            version,
            endianness,
        };
        log::debug!(
            "parsed TRK v{} header ({:?}): {} scalars/point, {} properties/streamline, count {:?}",
            header.version,
            header.endianness,
            header.nb_scalars_per_point(),
            header.nb_properties_per_streamline(),
            header.nb_streamlines
        );
        Ok(header)
    }

    /// Serialize in this header's byte order.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.serialize(HEADER_SIZE as i32)
    }

    /// Serialize with `hdr_size = 0`, which the parser rejects.
    ///
    /// Written before the records so that an unfinished file cannot be
    /// mistaken for a complete one.
    pub(crate) fn to_provisional_bytes(&self) -> Result<Vec<u8>> {
        self.serialize(0)
    }

    fn serialize(&self, hdr_size: i32) -> Result<Vec<u8>> {
        match self.endianness {
            Endianness::Little => self.write_fields::<LittleEndian>(hdr_size),
            Endianness::Big => self.write_fields::<BigEndian>(hdr_size),
        }
    }

    #[allow(clippy::wildcard_imports)]
    fn write_fields<E: ByteOrder>(&self, hdr_size: i32) -> Result<Vec<u8>> {
        use offsets::*;

        let mut buf = vec![0u8; HEADER_SIZE];
        buf[..MAGIC.len()].copy_from_slice(MAGIC);

        for (i, &d) in self.dimensions.iter().enumerate() {
            let off = DIMENSIONS + i * 2;
            E::write_i16(&mut buf[off..off + 2], d);
        }
        E::write_f32_into(&self.voxel_sizes, &mut buf[VOXEL_SIZES..VOXEL_SIZES + 12]);
        E::write_f32_into(&self.origin, &mut buf[ORIGIN..ORIGIN + 12]);

        let nb_scalars = encode_fields(&mut buf, SCALAR_NAME, &self.scalar_fields, "per-point")?;
        let nb_properties = encode_fields(
            &mut buf,
            PROPERTY_NAME,
            &self.property_fields,
            "per-streamline",
        )?;
        E::write_i16(
            &mut buf[NB_SCALARS_PER_POINT..NB_SCALARS_PER_POINT + 2],
            nb_scalars,
        );
        E::write_i16(
            &mut buf[NB_PROPERTIES_PER_STREAMLINE..NB_PROPERTIES_PER_STREAMLINE + 2],
            nb_properties,
        );

        for (r, row) in self.voxel_to_rasmm.to_f32().iter().enumerate() {
            let off = VOXEL_TO_RASMM + r * 16;
            E::write_f32_into(row, &mut buf[off..off + 16]);
        }

        let order = self.voxel_order.as_bytes();
        if order.len() > 4 || !order.is_ascii() {
            return Err(Error::Configuration(format!(
                "voxel order {:?} does not fit in 4 ASCII bytes",
                self.voxel_order
            )));
        }
        buf[VOXEL_ORDER..VOXEL_ORDER + order.len()].copy_from_slice(order);

        E::write_f32_into(
            &self.image_orientation_patient,
            &mut buf[IMAGE_ORIENTATION_PATIENT..IMAGE_ORIENTATION_PATIENT + 24],
        );
        buf[INVERT_X..INVERT_X + 6].copy_from_slice(&self.orientation_flags);

        let count = match self.nb_streamlines {
            None => 0,
            Some(n) => i32::try_from(n).map_err(|_| {
                Error::Configuration(format!("{} streamlines exceed the TRK count field", n))
            })?,
        };
        E::write_i32(&mut buf[NB_STREAMLINES..NB_STREAMLINES + 4], count);
        E::write_i32(&mut buf[VERSION..VERSION + 4], self.version);
        E::write_i32(&mut buf[HDR_SIZE..HDR_SIZE + 4], hdr_size);

        Ok(buf)
    }

    /// Total f32 values stored per point after the coordinates.
    pub fn nb_scalars_per_point(&self) -> usize {
        self.scalar_fields.iter().map(|f| f.width).sum()
    }

    /// Total f32 values stored per streamline after its points.
    pub fn nb_properties_per_streamline(&self) -> usize {
        self.property_fields.iter().map(|f| f.width).sum()
    }

    /// Byte order of the file this header came from (or will be written in).
    pub fn endianness(&self) -> Endianness {
        self.endianness
    }

    /// Returns true if the file is little endian.
    pub fn is_little_endian(&self) -> bool {
        self.endianness == Endianness::Little
    }

    /// Same header written in another byte order.
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Copy reference-volume geometry from `reference`, keeping fields and count.
    pub fn set_geometry_from(&mut self, reference: &TrkHeader) {
        self.dimensions = reference.dimensions;
        self.voxel_sizes = reference.voxel_sizes;
        self.origin = reference.origin;
        self.voxel_to_rasmm = reference.voxel_to_rasmm;
        self.voxel_order = reference.voxel_order.clone();
        self.image_orientation_patient = reference.image_orientation_patient;
        self.orientation_flags = reference.orientation_flags;
    }
}

impl std::fmt::Display for TrkHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names = |fields: &[FieldDescriptor]| {
            fields
                .iter()
                .map(|d| format!("{}[{}]", d.name, d.width))
                .collect::<Vec<_>>()
                .join(", ")
        };
        writeln!(f, "TRK v{} ({:?} endian)", self.version, self.endianness)?;
        writeln!(f, "dimensions: {:?}", self.dimensions)?;
        writeln!(f, "voxel_sizes: {:?}", self.voxel_sizes)?;
        writeln!(f, "voxel_order: {}", self.voxel_order)?;
        writeln!(f, "voxel_to_rasmm:")?;
        for row in self.voxel_to_rasmm.matrix() {
            writeln!(f, "  {:?}", row)?;
        }
        writeln!(
            f,
            "scalars/point: {} ({})",
            self.nb_scalars_per_point(),
            names(&self.scalar_fields)
        )?;
        writeln!(
            f,
            "properties/streamline: {} ({})",
            self.nb_properties_per_streamline(),
            names(&self.property_fields)
        )?;
        match self.nb_streamlines {
            Some(n) => write!(f, "streamlines: {}", n),
            None => write!(f, "streamlines: unknown"),
        }
    }
}

fn decode_fields(
    bytes: &[u8],
    names_offset: usize,
    count_offset: usize,
    declared: i16,
    fallback_name: &str,
) -> Result<Vec<FieldDescriptor>> {
    if declared < 0 {
        return Err(Error::descriptor(
            count_offset,
            format!("declared field width total is negative: {}", declared),
        ));
    }
    let declared = declared as usize;
    let mut fields = Vec::new();
    if declared == 0 {
        return Ok(fields);
    }

    let mut named_total = 0;
    for slot in 0..MAX_NAMED_FIELDS {
        let off = names_offset + slot * FIELD_NAME_SIZE;
        if let Some(field) = FieldDescriptor::decode(&bytes[off..off + FIELD_NAME_SIZE], off)? {
            named_total += field.width;
            fields.push(field);
        }
    }

    if named_total > declared {
        return Err(Error::descriptor(
            names_offset,
            format!(
                "named fields declare {} values but the header declares {}",
                named_total, declared
            ),
        ));
    }
    if named_total < declared {
        fields.push(FieldDescriptor::new(fallback_name, declared - named_total));
    }
    Ok(fields)
}

fn encode_fields(
    buf: &mut [u8],
    names_offset: usize,
    fields: &[FieldDescriptor],
    kind: &str,
) -> Result<i16> {
    if fields.len() > MAX_NAMED_FIELDS {
        return Err(Error::Configuration(format!(
            "TRK stores at most {} named {} fields, got {}",
            MAX_NAMED_FIELDS,
            kind,
            fields.len()
        )));
    }
    let mut total = 0usize;
    for (slot, field) in fields.iter().enumerate() {
        let off = names_offset + slot * FIELD_NAME_SIZE;
        buf[off..off + FIELD_NAME_SIZE].copy_from_slice(&field.encode()?);
        total += field.width;
    }
    i16::try_from(total).map_err(|_| {
        Error::Configuration(format!(
            "{} {} values exceed the TRK header limit",
            total, kind
        ))
    })
}

fn latin1_until_nul(raw: &[u8]) -> String {
    raw.iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect()
}

/// Read until `buf` is full or the reader is exhausted; returns bytes read.
pub(crate) fn read_up_to<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header() -> TrkHeader {
        TrkHeader {
            dimensions: [91, 109, 91],
            voxel_sizes: [2.0, 2.0, 2.0],
            scalar_fields: vec![
                FieldDescriptor::new("fa", 1),
                FieldDescriptor::new("colors", 3),
            ],
            property_fields: vec![FieldDescriptor::new("mean_curvature", 1)],
            voxel_to_rasmm: Affine::new([
                [-2.0, 0.0, 0.0, 90.0],
                [0.0, 2.0, 0.0, -126.0],
                [0.0, 0.0, 2.0, -72.0],
                [0.0, 0.0, 0.0, 1.0],
            ]),
            voxel_order: "LAS".to_string(),
            nb_streamlines: Some(42),
            ..TrkHeader::default()
        }
    }

    #[test]
    fn test_roundtrip_little_endian() {
        let header = sample_header();
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(&bytes[..5], b"TRACK");

        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(parsed.nb_scalars_per_point(), 4);
        assert_eq!(parsed.nb_properties_per_streamline(), 1);
    }

    #[test]
    fn test_roundtrip_big_endian() {
        let header = sample_header().with_endianness(Endianness::Big);
        let bytes = header.to_bytes().unwrap();
        assert_eq!(BigEndian::read_i32(&bytes[996..1000]), 1000);

        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert!(!parsed.is_little_endian());
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_field_name_encoding() {
        let bytes = sample_header().to_bytes().unwrap();
        assert_eq!(&bytes[38..40], b"fa");
        assert_eq!(bytes[40], 0);
        assert_eq!(&bytes[58..66], b"colors\x003");
        assert_eq!(LittleEndian::read_i16(&bytes[36..38]), 4);
    }

    #[test]
    fn test_bad_magic() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[..5].copy_from_slice(b"TRACX");
        let err = TrkHeader::from_bytes(&bytes).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader { offset: 0, .. }));
        assert!(err.to_string().contains("invalid TRK magic"));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = sample_header().to_bytes().unwrap();
        let err = TrkHeader::from_bytes(&bytes[..600]).unwrap_err();
        assert!(matches!(err, Error::MalformedHeader { offset: 600, .. }));
    }

    #[test]
    fn test_bad_hdr_size() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_i32(&mut bytes[996..1000], 999);
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::MalformedHeader { offset: 996, .. })
        ));
    }

    #[test]
    fn test_provisional_header_is_rejected() {
        let bytes = sample_header().to_provisional_bytes().unwrap();
        let err = TrkHeader::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("never finalized"));
    }

    #[test]
    fn test_unsupported_version() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_i32(&mut bytes[992..996], 7);
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::UnsupportedVersion { version: 7 })
        ));
    }

    #[test]
    fn test_version_1_uses_identity() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_i32(&mut bytes[992..996], 1);
        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.version, 1);
        assert_eq!(parsed.voxel_to_rasmm, Affine::IDENTITY);
    }

    #[test]
    fn test_unrecorded_affine_defaults_to_identity() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[440..504].fill(0);
        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.voxel_to_rasmm, Affine::IDENTITY);
    }

    #[test]
    fn test_empty_voxel_order_defaults_to_lps() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[948..952].fill(0);
        assert_eq!(TrkHeader::from_bytes(&bytes).unwrap().voxel_order, "LPS");

        bytes[948..951].copy_from_slice(b"XYZ");
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::MalformedHeader { offset: 948, .. })
        ));
    }

    #[test]
    fn test_negative_field_count() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_i16(&mut bytes[36..38], -2);
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::InvalidFieldDescriptor { offset: 36, .. })
        ));
    }

    #[test]
    fn test_named_fields_exceed_declared_total() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_i16(&mut bytes[36..38], 2);
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::InvalidFieldDescriptor { offset: 38, .. })
        ));
    }

    #[test]
    fn test_non_numeric_width_suffix() {
        let mut bytes = sample_header().to_bytes().unwrap();
        bytes[58..78].fill(0);
        bytes[58..66].copy_from_slice(b"colors\0x");
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::InvalidFieldDescriptor { offset: 58, .. })
        ));
    }

    #[test]
    fn test_unnamed_remainder_becomes_generic_field() {
        let mut bytes = TrkHeader::default().to_bytes().unwrap();
        LittleEndian::write_i16(&mut bytes[36..38], 3);
        LittleEndian::write_i16(&mut bytes[238..240], 2);
        let parsed = TrkHeader::from_bytes(&bytes).unwrap();
        assert_eq!(parsed.scalar_fields, vec![FieldDescriptor::new("scalars", 3)]);
        assert_eq!(
            parsed.property_fields,
            vec![FieldDescriptor::new("properties", 2)]
        );
    }

    #[test]
    fn test_invalid_voxel_size() {
        let mut bytes = sample_header().to_bytes().unwrap();
        LittleEndian::write_f32(&mut bytes[16..20], 0.0);
        assert!(matches!(
            TrkHeader::from_bytes(&bytes),
            Err(Error::MalformedHeader { offset: 16, .. })
        ));
    }

    #[test]
    fn test_encode_rejects_bad_fields() {
        let mut header = TrkHeader::default();
        header.scalar_fields = vec![FieldDescriptor::new("a_very_long_field_name", 1)];
        assert!(matches!(header.to_bytes(), Err(Error::Configuration(_))));

        header.scalar_fields = vec![FieldDescriptor::new("eighteen_chars_abc", 12)];
        assert!(header.to_bytes().is_err());

        header.scalar_fields = (0..11).map(|i| FieldDescriptor::new(format!("f{i}"), 1)).collect();
        assert!(header.to_bytes().is_err());
    }

    #[test]
    fn test_from_reader_short_input() {
        let bytes = sample_header().to_bytes().unwrap();
        let mut cursor = std::io::Cursor::new(&bytes[..10]);
        assert!(matches!(
            TrkHeader::from_reader(&mut cursor),
            Err(Error::MalformedHeader { offset: 10, .. })
        ));
    }
}
