//! Reopenable inputs for lazy tractograms.
//!
//! A lazy tractogram reads its source once per pass. Each call to
//! [`TrkSource::open`] must return an independent reader positioned at the
//! start of the file, so concurrent passes never share a cursor.

use crate::error::Result;
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{self, BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

const READ_BUFFER_SIZE: usize = 256 * 1024;

/// Something that can be opened repeatedly for reading a TRK file.
pub trait TrkSource {
    /// Reader positioned at byte 0 of the (decompressed) file.
    type Reader: Read;

    /// Open a fresh, independent reader.
    fn open(&self) -> Result<Self::Reader>;

    /// Short description for logs and error messages.
    fn describe(&self) -> String;
}

/// A TRK file on disk, optionally gzip-compressed (`.gz` extension).
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    gzip: bool,
}

impl FileSource {
    /// Source for `path`; compression is inferred from the extension.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let gzip = is_gzip_path(&path);
        Self { path, gzip }
    }

    /// Path of the file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True if the path ends in `.gz`.
    pub fn is_gzip(&self) -> bool {
        self.gzip
    }
}

impl TrkSource for FileSource {
    type Reader = FileReader;

    fn open(&self) -> Result<FileReader> {
        let file = File::open(&self.path)?;
        Ok(if self.gzip {
            FileReader::Gzip(BufReader::with_capacity(
                READ_BUFFER_SIZE,
                MultiGzDecoder::new(file),
            ))
        } else {
            FileReader::Plain(BufReader::with_capacity(READ_BUFFER_SIZE, file))
        })
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Reader returned by [`FileSource`].
///
/// Plain files support seeking; gzip streams do not.
#[derive(Debug)]
pub enum FileReader {
    Plain(BufReader<File>),
    Gzip(BufReader<MultiGzDecoder<File>>),
}

impl Read for FileReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Plain(r) => r.read(buf),
            Self::Gzip(r) => r.read(buf),
        }
    }
}

impl Seek for FileReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match self {
            Self::Plain(r) => r.seek(pos),
            Self::Gzip(_) => Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "gzip-compressed TRK streams cannot seek; load eagerly or decompress first",
            )),
        }
    }
}

/// Uncompressed TRK bytes shared in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    bytes: Arc<[u8]>,
}

impl MemorySource {
    /// Wrap a complete uncompressed file.
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// The file contents.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl TrkSource for MemorySource {
    type Reader = Cursor<Arc<[u8]>>;

    fn open(&self) -> Result<Self::Reader> {
        Ok(Cursor::new(Arc::clone(&self.bytes)))
    }

    fn describe(&self) -> String {
        format!("<memory: {} bytes>", self.bytes.len())
    }
}

pub(crate) fn is_gzip_path(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "gz")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::tempdir;

    #[test]
    fn test_memory_source_passes_are_independent() {
        let source = MemorySource::new(vec![1u8, 2, 3, 4]);
        let mut a = source.open().unwrap();
        let mut b = source.open().unwrap();
        let mut first = [0u8; 2];
        a.read_exact(&mut first).unwrap();
        let mut all = Vec::new();
        b.read_to_end(&mut all).unwrap();
        assert_eq!(first, [1, 2]);
        assert_eq!(all, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_file_source_gzip_detection_and_seek() {
        let dir = tempdir().unwrap();
        let plain = dir.path().join("a.trk");
        std::fs::write(&plain, b"TRACK-plain").unwrap();
        let gz = dir.path().join("a.trk.gz");
        let mut enc = flate2::write::GzEncoder::new(
            File::create(&gz).unwrap(),
            flate2::Compression::fast(),
        );
        enc.write_all(b"TRACK-gz").unwrap();
        enc.finish().unwrap();

        let mut reader = FileSource::new(&plain).open().unwrap();
        reader.seek(SeekFrom::Start(6)).unwrap();
        let mut rest = String::new();
        reader.read_to_string(&mut rest).unwrap();
        assert_eq!(rest, "plain");

        let source = FileSource::new(&gz);
        assert!(source.is_gzip());
        let mut reader = source.open().unwrap();
        let mut text = String::new();
        reader.read_to_string(&mut text).unwrap();
        assert_eq!(text, "TRACK-gz");
        assert!(reader.seek(SeekFrom::Start(0)).is_err());
    }
}
