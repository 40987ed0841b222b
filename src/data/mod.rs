//! Grid data: row partition and the per-rank grid slice.

pub mod grid;
pub mod partition;

pub use grid::{Color, GridStore};
pub use partition::{Partition, SorParams};
