//! In-memory and lazily decoded tractograms.

mod inmem;
mod item;
mod lazy;
mod sequence;

pub use inmem::Tractogram;
pub use item::TractogramItem;
pub use lazy::{LazyIter, LazyTractogram};
pub use sequence::ArraySequence;

/// Coordinate space that streamline points are expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PointSpace {
    /// RAS+ millimeters of the reference volume.
    #[default]
    Rasmm,
    /// Any space other than RAS+ mm, such as the file's voxmm space. The
    /// tag is explicit: a native tractogram may carry an identity
    /// `affine_to_rasmm` when the file's voxmm space happens to be RAS+ mm.
    Native,
}
