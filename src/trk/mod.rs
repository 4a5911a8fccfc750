//! TrackVis `.trk` file format support.
//!
//! A TRK file is a 1000-byte header followed by one variable-length record
//! per streamline. This module provides the header codec, a forward-only
//! record decoder, a record encoder, optional random access and the
//! path-level load/save functions.

pub(crate) mod header;
pub mod io;
mod index;
mod reader;
mod source;
mod space;
mod writer;

pub use header::{
    Endianness, FieldDescriptor, TrkHeader, CURRENT_VERSION, FIELD_NAME_SIZE, HEADER_SIZE,
    MAGIC, MAX_NAMED_FIELDS,
};
pub use index::StreamlineIndex;
pub use io::{
    is_trk, load, load_from_bytes, load_header, load_lazy, load_with_options, save, save_lazy,
    save_to_bytes, save_with_options, LoadOptions, Loaded, SaveOptions,
};
pub use reader::{RecordInfo, StreamlineReader};
pub use source::{FileReader, FileSource, MemorySource, TrkSource};
pub use writer::TrkWriter;
