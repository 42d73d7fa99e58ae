//! Tape persistence.
//!
//! A persisted tape starts with a header (tape kind, input and output
//! handles, statement count) followed by one record per statement. Two
//! variants are provided:
//!
//! - [`TextWriter`] / [`TextReader`]: line oriented and human readable.
//! - [`GraphWriter`]: Graphviz DOT for visualization (feature `graphviz`).
//!
//! A reader only accepts tapes of the kind it is asked for.
//!
//! # Example
//!
//! ```
//! use adtape::io::{TapeReader, TapeWriter, TextReader, TextWriter};
//! use adtape::{Identifier, Operation, Tape, TapeConfig};
//!
//! let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
//! tape.set_active();
//! let x = tape.register_input(3.0).unwrap();
//! let mut y = Identifier::PASSIVE;
//! tape.store_operation(&mut y, Operation::Square, &[(x, 3.0)], &[]).unwrap();
//! tape.register_output(&mut y, 9.0).unwrap();
//! tape.set_passive();
//!
//! let mut buffer = Vec::new();
//! TextWriter::new(&mut buffer).write(&tape).unwrap();
//!
//! let mut loaded = TextReader::new(buffer.as_slice())
//!     .read::<f64, adtape::LinearIndexManager>(TapeConfig::jacobian())
//!     .unwrap();
//! loaded.tape.set_gradient(loaded.outputs[0], 1.0);
//! loaded.tape.evaluate().unwrap();
//! assert_eq!(loaded.tape.gradient(loaded.inputs[0]), 6.0);
//! ```

#[cfg(feature = "graphviz")]
mod graph;
mod text;

#[cfg(feature = "graphviz")]
pub use graph::GraphWriter;
pub use text::{TextReader, TextWriter};

use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::real::Real;
use crate::tape::{Tape, TapeConfig};

/// Serializes a tape.
pub trait TapeWriter {
    /// Write the header and every persistable statement of `tape`.
    ///
    /// # Errors
    /// Returns [`TapeError::Io`] if the transport fails.
    fn write<T: Real, I: IndexManager>(&mut self, tape: &Tape<T, I>) -> Result<(), TapeError>;
}

/// A tape reconstructed by a [`TapeReader`].
#[derive(Debug)]
pub struct LoadedTape<T: Real, I: IndexManager> {
    /// Idle tape ready for evaluation.
    pub tape: Tape<T, I>,
    /// Input handles in registration order.
    pub inputs: Vec<Identifier>,
    /// Output handles in registration order.
    pub outputs: Vec<Identifier>,
}

/// Reconstructs a tape written by the matching [`TapeWriter`].
pub trait TapeReader {
    /// Read a tape into a new tape built from `config`.
    ///
    /// # Errors
    /// Returns [`TapeError::KindMismatch`] if the stored kind differs from
    /// `config.kind`, [`TapeError::Format`] for malformed input and
    /// [`TapeError::Io`] if the transport fails.
    fn read<T: Real, I: IndexManager>(
        &mut self,
        config: TapeConfig,
    ) -> Result<LoadedTape<T, I>, TapeError>;
}
