//! Statement records stored in the tape's statement stream.

use crate::index::Identifier;
use crate::operation::Operation;
use crate::real::Real;

/// One record in the statement stream.
///
/// The argument handles and values that belong to a statement live in the
/// tape's argument and value stores, in the same order as the statements.
/// Their counts are implied by the record:
///
/// | record      | argument handles | values                              |
/// |-------------|------------------|-------------------------------------|
/// | `Input`     | 0                | 0                                   |
/// | `Jacobian`  | `arg_count`      | `arg_count` partials                |
/// | `Operation` | `op.arity()`     | constants, then passive operands    |
/// | `External`  | 0                | 0 (plus one external record)        |
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Statement<T> {
    /// Registration of an input value (primal-value tapes only).
    Input {
        lhs: Identifier,
        value: T,
        old_primal: T,
    },
    /// Output with precomputed local partials.
    Jacobian {
        lhs: Identifier,
        arg_count: u16,
        primal: T,
        old_primal: T,
    },
    /// Output recomputed from an operation tag (primal-value tapes only).
    ///
    /// Passive operands are stored as [`Identifier::PASSIVE`] in the
    /// argument store and their values follow the constants.
    Operation {
        lhs: Identifier,
        op: Operation,
        passive_count: u8,
        old_primal: T,
    },
    /// Marker for an external function record.
    External,
}

impl<T: Real> Statement<T> {
    /// Output handle, if the statement produces one.
    pub fn lhs(&self) -> Option<Identifier> {
        match *self {
            Statement::Input { lhs, .. }
            | Statement::Jacobian { lhs, .. }
            | Statement::Operation { lhs, .. } => Some(lhs),
            Statement::External => None,
        }
    }

    /// Number of entries in the argument store.
    pub fn argument_count(&self) -> usize {
        match *self {
            Statement::Jacobian { arg_count, .. } => arg_count as usize,
            Statement::Operation { op, .. } => op.arity(),
            Statement::Input { .. } | Statement::External => 0,
        }
    }

    /// Number of entries in the value store.
    pub fn value_count(&self) -> usize {
        match *self {
            Statement::Jacobian { arg_count, .. } => arg_count as usize,
            Statement::Operation {
                op, passive_count, ..
            } => op.constant_count() + passive_count as usize,
            Statement::Input { .. } | Statement::External => 0,
        }
    }

    /// Value the output slot held before this statement.
    pub(crate) fn old_primal(&self) -> Option<T> {
        match *self {
            Statement::Input { old_primal, .. }
            | Statement::Jacobian { old_primal, .. }
            | Statement::Operation { old_primal, .. } => Some(old_primal),
            Statement::External => None,
        }
    }

    pub(crate) fn set_old_primal(&mut self, value: T) {
        match self {
            Statement::Input { old_primal, .. }
            | Statement::Jacobian { old_primal, .. }
            | Statement::Operation { old_primal, .. } => *old_primal = value,
            Statement::External => {}
        }
    }

    pub(crate) fn set_lhs(&mut self, id: Identifier) {
        match self {
            Statement::Input { lhs, .. }
            | Statement::Jacobian { lhs, .. }
            | Statement::Operation { lhs, .. } => *lhs = id,
            Statement::External => {}
        }
    }
}

/// Borrowed view of a statement with its arguments and values.
#[derive(Debug, Clone, Copy)]
pub struct StatementView<'a, T> {
    pub statement: &'a Statement<T>,
    pub arguments: &'a [Identifier],
    pub values: &'a [T],
}

/// Gather operand primals for an operation statement.
///
/// Active operands are read from `primals`; passive ones are taken in order
/// from `passive_values`.
pub(crate) fn gather_operands<T: Real>(
    arguments: &[Identifier],
    passive_values: &[T],
    primals: &[T],
    out: &mut [T],
) {
    let mut passive = passive_values.iter();
    for (slot, id) in out.iter_mut().zip(arguments) {
        *slot = if id.is_active() {
            primals.get(id.index()).copied().unwrap_or_else(T::zero)
        } else {
            passive.next().copied().unwrap_or_else(T::zero)
        };
    }
}
