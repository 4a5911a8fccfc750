//! # trkio
//!
//! Reading and writing TrackVis `.trk` tractograms.
//!
//! ## Features
//!
//! - **Eager or lazy loading**: decode a whole file into a [`Tractogram`], or
//!   stream streamlines one record at a time from a [`LazyTractogram`]
//! - **Coordinate spaces**: points in RAS+ mm by default, or in the file's
//!   native voxmm space, with invertible affines between the two
//! - **Attached data**: per-point and per-streamline attributes with the
//!   widths declared in the header
//! - **Gzip**: `.trk.gz` paths are compressed and decompressed transparently
//! - **Honest partial writes**: an interrupted save leaves a header readers
//!   reject instead of a file with a wrong streamline count
//!
//! ## Example
//!
//! ```ignore
//! use trkio::{load, load_lazy, save};
//!
//! let tractogram = load("bundle.trk")?;
//! save(&tractogram, "copy.trk.gz")?;
//!
//! for item in load_lazy("copy.trk.gz")?.iter()? {
//!     let item = item?;
//!     println!("{} points", item.len());
//! }
//! ```

#![deny(unsafe_code)]

pub mod error;
pub mod tractogram;
pub mod transforms;
pub mod trk;

pub use error::{Error, Result};
pub use tractogram::{ArraySequence, LazyTractogram, PointSpace, Tractogram, TractogramItem};
pub use transforms::Affine;
pub use trk::{
    is_trk, load, load_from_bytes, load_header, load_lazy, load_with_options, save, save_lazy,
    save_to_bytes, save_with_options, FieldDescriptor, LoadOptions, Loaded, SaveOptions,
    TrkHeader,
};
