//! Trade detection engine.
//!
//! This crate turns a fetched transaction into a classified trade:
//! lookup-table resolution, per-asset balance deltas of the signer and
//! the ordered swap detection rules.

pub mod classifier;
pub mod delta;
pub mod resolver;

pub use classifier::*;
pub use delta::*;
pub use resolver::*;
