//! Affine transforms and axis orientation algebra.

pub mod affine;
pub mod orientation;

pub use affine::{compose, from_rasmm, to_rasmm, Affine};
pub use orientation::{
    affine_to_axcodes, axcodes_to_orientation, inverse_orientation_affine, io_orientation,
    orientation_to_axcodes, orientation_transform, Orientation,
};
