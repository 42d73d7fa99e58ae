//! Storage backing a tape.
//!
//! - [`ChunkedStore`]: segmented, address-stable arrays for statements,
//!   argument handles, values and external function records.
//! - [`AdjointStorage`] / [`DerivativeVector`]: handle to derivative maps
//!   used by the evaluation sweeps.

pub mod chunked;
pub mod derivative;

pub use chunked::{ChunkPosition, ChunkedStore, MemoryBudget};
pub use derivative::{AdjointStorage, DerivativeVector, Direction, Gradient};
