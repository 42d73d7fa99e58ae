//! adtape - tape-based automatic differentiation engine
//!
//! A [`Tape`] records every elementary operation executed on tracked values
//! as a statement with its local partial derivatives. The recording can
//! then be swept in reverse (adjoints), forward (tangents) or, on
//! primal-value tapes, re-evaluated for new inputs.
//!
//! # Architecture
//!
//! ```text
//! Recording:   register_input → store / store_operation → register_output
//!                   │                   │
//!              IndexManager        ChunkedStore (statements, arguments,
//!              (linear | reuse)     values, external records)
//!
//! Evaluation:  evaluate[_range|_with]           reverse sweep
//!              evaluate_forward[_range|_with]   forward sweep
//!              evaluate_primal[_range]          primal re-evaluation
//!
//! Tooling:     PreaccumulationHelper, ExternalFunction, io, optimize
//! ```
//!
//! Positions ([`Position`]) mark points in the recording and allow partial
//! evaluation and rollback with [`Tape::reset_to`].
//!
//! # Example
//!
//! ```
//! use adtape::{Identifier, Operation, Tape, TapeConfig};
//!
//! let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
//! tape.set_active();
//!
//! // y = x^3 at x = 4
//! let x = tape.register_input(4.0).unwrap();
//! let mut y = Identifier::PASSIVE;
//! let v = tape.store_operation(&mut y, Operation::PowConst, &[(x, 4.0)], &[3.0]).unwrap();
//! tape.register_output(&mut y, v).unwrap();
//! tape.set_passive();
//!
//! tape.set_gradient(y, 1.0);
//! tape.evaluate().unwrap();
//! assert!((tape.gradient(x) - 48.0).abs() < 1e-12);
//! ```

pub mod error;
pub mod external;
pub mod index;
pub mod io;
pub mod operation;
pub mod optimize;
pub mod preaccumulation;
pub mod real;
pub mod storage;
pub mod tape;

pub use error::TapeError;
pub use external::{ExternalCallbacks, ExternalFunction};
pub use index::{Identifier, IndexManager, LinearIndexManager, ReclaimPolicy, ReuseIndexManager};
pub use operation::Operation;
pub use optimize::{Relabeling, optimize_identifiers};
pub use preaccumulation::{PreaccumulationConfig, PreaccumulationHelper};
pub use real::Real;
pub use storage::{AdjointStorage, ChunkPosition, DerivativeVector, Direction, Gradient};
pub use tape::{
    ManualStatement, Position, Statement, StatementView, Tape, TapeConfig, TapeKind, TapeState,
    TapeStatistics, VectorAccess,
};
