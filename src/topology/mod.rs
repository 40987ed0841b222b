//! Pool membership and rank resolution.
//!
//! A [`Registry`] names the members of a closed pool and runs first-caller-wins
//! elections; [`Topology::resolve`] turns those elections into dense ranks
//! `0..P` that every member agrees on.

pub mod rank;
pub mod registry;

pub use rank::Topology;
pub use registry::{LocalPool, LocalRegistry, PeerId, Registry};
