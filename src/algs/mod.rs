//! Transport and collective algorithms.

pub mod communicator;
pub mod ports;
pub mod reduction;
pub mod wire;

pub use communicator::{CommTag, Communicator, Wait};
pub use reduction::{Reducer, ReducerStrategy};
