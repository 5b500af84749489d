//! Utilities for testing code based on hosts without real network I/O. They are used for
//!  testing this crate, and they are exported for application testing as well.

pub mod compressor;
pub mod network;

pub use compressor::RunLengthCompressor;
pub use network::{NetworkConditions, NetworkStatistics, SimulatedNetwork, SimulatedSocket};
