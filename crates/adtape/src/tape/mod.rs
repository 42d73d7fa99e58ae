//! The tape: recording state, positions and derivative storage.
//!
//! A [`Tape`] owns four [`ChunkedStore`]s that grow in lockstep:
//!
//! - statements, one [`Statement`] per recorded operation,
//! - argument handles,
//! - values (partials, constants and passive operands),
//! - external function records.
//!
//! A [`Position`] captures the end of all four (plus the identifier counter
//! and registration lists) and is the unit for partial evaluation and
//! rollback.
//!
//! # Example
//!
//! ```
//! use adtape::{Identifier, Operation, Tape, TapeConfig};
//!
//! let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
//! tape.set_active();
//!
//! let x = tape.register_input(4.0).unwrap();
//! let mut x2 = Identifier::PASSIVE;
//! let v2 = tape.store_operation(&mut x2, Operation::Mul, &[(x, 4.0), (x, 4.0)], &[]).unwrap();
//! let mut y = Identifier::PASSIVE;
//! let v3 = tape.store_operation(&mut y, Operation::Mul, &[(x2, v2), (x, 4.0)], &[]).unwrap();
//! tape.register_output(&mut y, v3).unwrap();
//! tape.set_passive();
//!
//! tape.set_gradient(y, 1.0);
//! tape.evaluate().unwrap();
//! assert_eq!(tape.gradient(x), 48.0);
//! ```

pub mod access;
mod config;
mod evaluate;
mod recorder;
mod statement;
mod statistics;

pub use access::VectorAccess;
pub use config::{TapeConfig, TapeKind};
pub use recorder::ManualStatement;
pub use statement::{Statement, StatementView};
pub use statistics::TapeStatistics;

use crate::error::TapeError;
use crate::external::ExternalRecord;
use crate::index::{Identifier, IndexManager, LinearIndexManager};
use crate::real::Real;
use crate::storage::{AdjointStorage, ChunkPosition, ChunkedStore, DerivativeVector, MemoryBudget};
use log::debug;
use std::collections::{HashMap, HashSet};
use std::fmt;

/// Lifecycle state of a tape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TapeState {
    /// Active: operations are appended.
    Recording,
    /// Passive: nothing is recorded; evaluation and rollback are allowed.
    Idle,
    EvaluatingReverse,
    EvaluatingForward,
    EvaluatingPrimal,
}

/// Opaque marker of a point in the recorded stream.
///
/// Positions are totally ordered by recording time. They stay valid while
/// the tape grows and become invalid once a `reset_to` discards the point
/// they mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Position {
    pub(crate) statements: ChunkPosition,
    pub(crate) arguments: ChunkPosition,
    pub(crate) values: ChunkPosition,
    pub(crate) externals: ChunkPosition,
    pub(crate) identifiers: u32,
    pub(crate) inputs: usize,
    pub(crate) outputs: usize,
}

impl Position {
    /// Location in the statement stream.
    pub fn statements(&self) -> ChunkPosition {
        self.statements
    }

    /// Identifier counter at this point (always `0` for reuse tapes).
    pub fn identifiers(&self) -> u32 {
        self.identifiers
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}",
            self.statements.chunk(),
            self.statements.offset()
        )
    }
}

/// Append-only, checkpointable record of elementary operations.
///
/// `T` is the primal/partial type, `I` the identifier policy. The tape owns
/// its scalar adjoint vector; vector-mode and custom storage are passed per
/// evaluation call.
pub struct Tape<T: Real, I: IndexManager = LinearIndexManager> {
    pub(crate) config: TapeConfig,
    pub(crate) state: TapeState,
    pub(crate) indices: I,
    pub(crate) budget: MemoryBudget,
    pub(crate) statements: ChunkedStore<Statement<T>>,
    pub(crate) arguments: ChunkedStore<Identifier>,
    pub(crate) values: ChunkedStore<T>,
    pub(crate) externals: ChunkedStore<ExternalRecord<T>>,
    pub(crate) adjoints: DerivativeVector<T>,
    /// Primal values at the end of the tape (primal-value tapes only).
    pub(crate) primals: Vec<T>,
    pub(crate) inputs: Vec<Identifier>,
    pub(crate) outputs: Vec<Identifier>,
    pub(crate) registered_outputs: HashSet<Identifier>,
    /// Statement holding each registered input (primal-value tapes only).
    pub(crate) input_statements: HashMap<Identifier, ChunkPosition>,
}

impl<T: Real, I: IndexManager> Tape<T, I> {
    /// Create an idle tape with a default identifier manager.
    pub fn new(config: TapeConfig) -> Self {
        Self::with_indices(config, I::default())
    }

    /// Create an idle tape with the given identifier manager.
    pub fn with_indices(config: TapeConfig, indices: I) -> Self {
        let config = config.normalized();
        let chunk_size = config.chunk_size;
        Self {
            config,
            state: TapeState::Idle,
            indices,
            budget: MemoryBudget::new(config.memory_limit),
            statements: ChunkedStore::new("statements", chunk_size),
            arguments: ChunkedStore::new("arguments", chunk_size),
            values: ChunkedStore::new("values", chunk_size),
            externals: ChunkedStore::new("externals", chunk_size),
            adjoints: DerivativeVector::new(),
            primals: Vec::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            registered_outputs: HashSet::new(),
            input_statements: HashMap::new(),
        }
    }

    pub fn config(&self) -> &TapeConfig {
        &self.config
    }

    pub fn kind(&self) -> TapeKind {
        self.config.kind
    }

    pub fn state(&self) -> TapeState {
        self.state
    }

    /// Identifier manager, e.g. to inspect the issued handle range.
    pub fn indices(&self) -> &I {
        &self.indices
    }

    /// Start recording.
    pub fn set_active(&mut self) {
        self.state = TapeState::Recording;
    }

    /// Stop recording.
    pub fn set_passive(&mut self) {
        self.state = TapeState::Idle;
    }

    pub fn is_recording(&self) -> bool {
        self.state == TapeState::Recording
    }

    pub(crate) fn has_primals(&self) -> bool {
        self.config.kind == TapeKind::PrimalValue
    }

    /// Handles registered as inputs, in registration order.
    pub fn inputs(&self) -> &[Identifier] {
        &self.inputs
    }

    /// Handles registered as outputs, in registration order.
    pub fn outputs(&self) -> &[Identifier] {
        &self.outputs
    }

    /// Current end of the tape.
    pub fn position(&self) -> Position {
        Position {
            statements: self.statements.position(),
            arguments: self.arguments.position(),
            values: self.values.position(),
            externals: self.externals.position(),
            identifiers: self.indices.position(),
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
        }
    }

    /// Position before anything was recorded.
    pub fn zero_position(&self) -> Position {
        Position::default()
    }

    /// Number of recorded statements, external markers included.
    pub fn size(&self) -> usize {
        self.statements.len()
    }

    /// Check whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Snapshot of the tape's sizes.
    pub fn statistics(&self) -> TapeStatistics {
        TapeStatistics {
            kind: self.config.kind,
            statements: self.statements.len(),
            arguments: self.arguments.len(),
            values: self.values.len(),
            external_functions: self.externals.len(),
            segments: self.statements.chunk_count()
                + self.arguments.chunk_count()
                + self.values.chunk_count()
                + self.externals.chunk_count(),
            allocated_bytes: self.budget.used(),
            largest_identifier: self.indices.largest_issued(),
            inputs: self.inputs.len(),
            outputs: self.outputs.len(),
        }
    }

    // ========================================================================
    // Derivatives
    // ========================================================================

    /// Adjoint (or tangent, after a forward sweep) of `id` in the tape's own
    /// vector. Passive and unknown handles read as zero.
    pub fn gradient(&self, id: Identifier) -> T {
        AdjointStorage::<T, T>::read(&self.adjoints, id)
    }

    /// Seed the adjoint (or tangent) of `id`. Writes to the passive handle
    /// and to handles the tape never issued are ignored.
    pub fn set_gradient(&mut self, id: Identifier, value: T) {
        if !self.is_issued(id) {
            return;
        }
        let largest = self.indices.largest_issued() as usize;
        AdjointStorage::<T, T>::ensure_size(&mut self.adjoints, largest);
        AdjointStorage::<T, T>::set(&mut self.adjoints, id, value);
    }

    /// The tape's scalar derivative vector.
    pub fn adjoints(&self) -> &DerivativeVector<T> {
        &self.adjoints
    }

    /// Zero every entry of the tape's derivative vector.
    pub fn clear_adjoints(&mut self) {
        self.adjoints.as_mut_slice().fill(T::zero());
    }

    /// Zero the derivatives of every handle produced in `[end, start)`.
    ///
    /// # Errors
    /// Returns [`TapeError::InvalidRange`] if `start < end`.
    pub fn clear_adjoints_range(&mut self, start: &Position, end: &Position) -> Result<(), TapeError> {
        if start < end {
            return Err(TapeError::InvalidRange {
                message: format!("clear from {start} down to {end}"),
            });
        }
        let mut pos = start.statements;
        while pos > end.statements {
            if let Some(lhs) = self.statements.prev(&mut pos).lhs() {
                AdjointStorage::<T, T>::clear(&mut self.adjoints, lhs);
            }
        }
        for raw in end.identifiers + 1..=start.identifiers {
            AdjointStorage::<T, T>::clear(&mut self.adjoints, Identifier::new(raw));
        }
        Ok(())
    }

    /// Active and not above the identifier high-water mark.
    fn is_issued(&self, id: Identifier) -> bool {
        id.is_active() && id.raw() <= self.indices.largest_issued()
    }

    fn largest_slot(&self, id: Identifier) -> usize {
        (self.indices.largest_issued() as usize).max(id.index())
    }

    // ========================================================================
    // Primal values
    // ========================================================================

    /// Current primal value of `id` (primal-value tapes only).
    pub fn primal(&self, id: Identifier) -> Option<T> {
        if !self.has_primals() || !id.is_active() {
            return None;
        }
        self.primals.get(id.index()).copied()
    }

    /// Overwrite the primal value of `id`.
    ///
    /// For a registered input the stored input statement is updated as well,
    /// so a following [`Tape::evaluate_primal`] propagates the new value.
    ///
    /// # Errors
    /// Returns [`TapeError::Unsupported`] on Jacobian tapes.
    pub fn set_primal(&mut self, id: Identifier, value: T) -> Result<(), TapeError> {
        if !self.has_primals() {
            return Err(TapeError::Unsupported {
                operation: "set_primal",
                kind: self.config.kind,
            });
        }
        if !self.is_issued(id) {
            return Ok(());
        }
        self.ensure_primal_slot(id);
        self.primals[id.index()] = value;
        if let Some(&pos) = self.input_statements.get(&id) {
            if let Some(Statement::Input { value: stored, .. }) = self.statements.get_mut(pos) {
                *stored = value;
            }
        }
        Ok(())
    }

    /// The primal vector, indexed by `Identifier::index`.
    pub fn primals(&self) -> &[T] {
        &self.primals
    }

    /// Record `value` as the primal of `id` and return what the slot held.
    pub(crate) fn swap_primal(&mut self, id: Identifier, value: T) -> T {
        if !self.has_primals() || !id.is_active() {
            return T::zero();
        }
        self.ensure_primal_slot(id);
        std::mem::replace(&mut self.primals[id.index()], value)
    }

    fn ensure_primal_slot(&mut self, id: Identifier) {
        let len = self.largest_slot(id) + 1;
        if self.primals.len() < len {
            self.primals.resize(len, T::zero());
        }
    }

    // ========================================================================
    // Rollback
    // ========================================================================

    /// Discard every statement, external record and registration.
    ///
    /// Delete callbacks of external functions run, newest first. Segments
    /// stay allocated for the next recording and the derivative vector is
    /// zeroed.
    pub fn reset(&mut self) {
        debug!("tape reset: discarding {} statements", self.statements.len());
        self.externals.reset_with(|record| record.delete());
        self.statements.reset_to(ChunkPosition::default());
        self.arguments.reset_to(ChunkPosition::default());
        self.values.reset_to(ChunkPosition::default());
        self.indices.reset();
        self.clear_adjoints();
        self.inputs.clear();
        self.outputs.clear();
        self.registered_outputs.clear();
        self.input_statements.clear();
        self.state = TapeState::Idle;
    }

    /// Discard everything recorded after `pos`.
    ///
    /// Adjoints of discarded outputs are zeroed, overwritten primal values
    /// are restored and delete callbacks of discarded external functions
    /// run, newest first.
    ///
    /// # Errors
    /// Returns [`TapeError::PositionAfterCurrent`] if `pos` lies after the
    /// current position. The tape is not modified in that case.
    pub fn reset_to(&mut self, pos: &Position) -> Result<(), TapeError> {
        let current = self.position();
        if *pos > current || !self.statements.contains(pos.statements) {
            return Err(TapeError::PositionAfterCurrent);
        }
        debug!("tape reset_to {pos} from {current}");

        let mut walk = current.statements;
        while walk > pos.statements {
            let statement = *self.statements.prev(&mut walk);
            if let (Some(lhs), Some(old)) = (statement.lhs(), statement.old_primal()) {
                AdjointStorage::<T, T>::clear(&mut self.adjoints, lhs);
                if self.has_primals() && lhs.is_active() {
                    if let Some(slot) = self.primals.get_mut(lhs.index()) {
                        *slot = old;
                    }
                }
            }
        }

        self.externals.reset_to_with(pos.externals, |record| record.delete());
        self.statements.reset_to(pos.statements);
        self.arguments.reset_to(pos.arguments);
        self.values.reset_to(pos.values);

        if I::IS_LINEAR {
            for raw in pos.identifiers + 1..=current.identifiers {
                AdjointStorage::<T, T>::clear(&mut self.adjoints, Identifier::new(raw));
            }
            self.indices.reset_to(pos.identifiers);
        }
        for id in self.outputs.drain(pos.outputs.min(self.outputs.len())..) {
            self.registered_outputs.remove(&id);
        }
        self.inputs.truncate(pos.inputs);
        self.input_statements.retain(|_, at| *at < pos.statements);
        Ok(())
    }

    /// Release pooled segments left over by earlier rollbacks.
    pub fn shrink(&mut self) {
        self.statements.shrink(&mut self.budget);
        self.arguments.shrink(&mut self.budget);
        self.values.shrink(&mut self.budget);
        self.externals.shrink(&mut self.budget);
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Visit every statement in recording order.
    pub fn visit_forward(&self, mut visit: impl FnMut(StatementView<'_, T>)) {
        let mut arg_pos = self.arguments.zero_position();
        let mut val_pos = self.values.zero_position();
        for statement in self.statements.iter() {
            let arguments = self
                .arguments
                .slice_after(&mut arg_pos, statement.argument_count());
            let values = self.values.slice_after(&mut val_pos, statement.value_count());
            visit(StatementView {
                statement,
                arguments,
                values,
            });
        }
    }

    /// Visit every statement in reverse recording order.
    pub fn visit_reverse(&self, mut visit: impl FnMut(StatementView<'_, T>)) {
        let mut pos = self.statements.position();
        let mut arg_pos = self.arguments.position();
        let mut val_pos = self.values.position();
        while pos > self.statements.zero_position() {
            let statement = self.statements.prev(&mut pos);
            let arguments = self
                .arguments
                .slice_before(&mut arg_pos, statement.argument_count());
            let values = self.values.slice_before(&mut val_pos, statement.value_count());
            visit(StatementView {
                statement,
                arguments,
                values,
            });
        }
    }
}

impl<T: Real, I: IndexManager> Drop for Tape<T, I> {
    fn drop(&mut self) {
        self.externals.reset_with(|record| record.delete());
    }
}

impl<T: Real, I: IndexManager> fmt::Debug for Tape<T, I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tape")
            .field("kind", &self.config.kind)
            .field("state", &self.state)
            .field("indices", &self.indices)
            .field("statements", &self.statements.len())
            .field("external_functions", &self.externals.len())
            .finish_non_exhaustive()
    }
}
