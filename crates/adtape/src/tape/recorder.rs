//! Statement recording and value registration.

use super::{Statement, Tape, TapeKind};
use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::operation::Operation;
use crate::real::Real;
use smallvec::SmallVec;

/// Argument list of one statement before it is written to the tape.
type Arguments<T> = SmallVec<[(Identifier, T); 8]>;

impl<T: Real, I: IndexManager> Tape<T, I> {
    // ========================================================================
    // Registration
    // ========================================================================

    /// Register an independent variable and return its handle.
    ///
    /// The handle is always fresh. On a recording primal-value tape an input
    /// statement is stored so primal re-evaluation can restart from it.
    ///
    /// # Errors
    /// Returns a capacity error if no handle or no tape memory is left.
    pub fn register_input(&mut self, value: T) -> Result<Identifier, TapeError> {
        let mut id = Identifier::PASSIVE;
        if self.has_primals() && self.is_recording() {
            self.statements.reserve(1, &mut self.budget)?;
            self.indices.assign_unused(&mut id)?;
            let old_primal = self.swap_primal(id, value);
            self.statements.push(Statement::Input {
                lhs: id,
                value,
                old_primal,
            });
            let mut end = self.statements.position();
            let at = self.statements.prev_position(&mut end);
            self.input_statements.insert(id, at);
        } else {
            self.indices.assign_unused(&mut id)?;
            self.swap_primal(id, value);
        }
        self.inputs.push(id);
        Ok(id)
    }

    /// Register a dependent variable.
    ///
    /// Under the reuse policy, or when copies share handles, the output gets
    /// a fresh handle through a copy statement so that seeding it cannot
    /// alias another value. Passive values are ignored.
    ///
    /// # Errors
    /// Returns [`TapeError::AlreadyRegistered`] if `id` is already an output.
    pub fn register_output(&mut self, id: &mut Identifier, value: T) -> Result<(), TapeError> {
        if !id.is_active() {
            return Ok(());
        }
        if self.registered_outputs.contains(id) {
            return Err(TapeError::AlreadyRegistered { id: id.raw() });
        }
        if self.is_recording() && (!I::IS_LINEAR || self.config.copy_optimization) {
            let source = *id;
            let mut fresh = Identifier::PASSIVE;
            self.push_copy(&mut fresh, source, value)?;
            *id = fresh;
        }
        self.outputs.push(*id);
        self.registered_outputs.insert(*id);
        Ok(())
    }

    /// Give the output of an external function a handle.
    ///
    /// No statement is recorded; the external function's callbacks are
    /// responsible for the derivative of the returned handle.
    pub fn register_external_output(&mut self, value: T) -> Result<Identifier, TapeError> {
        let mut id = Identifier::PASSIVE;
        if !self.is_recording() {
            return Ok(id);
        }
        self.indices.assign_unused(&mut id)?;
        self.swap_primal(id, value);
        Ok(id)
    }

    /// Release a handle when its value goes out of scope.
    pub fn free(&mut self, id: &mut Identifier) {
        self.indices.free(id);
    }

    // ========================================================================
    // Statements
    // ========================================================================

    /// Record `lhs = f(args)` with precomputed local partials.
    ///
    /// Passive arguments and zero partials are dropped and duplicate handles
    /// are summed, so each input reaches the evaluator at most once. If no
    /// active argument remains, or the tape is not recording, `lhs` becomes
    /// passive and nothing is stored.
    ///
    /// # Arguments
    /// * `lhs` - Output handle; assigned by the identifier policy
    /// * `primal` - Output value
    /// * `args` - `(handle, partial)` pairs
    ///
    /// # Errors
    /// Returns [`TapeError::StatementTooLarge`] when more distinct arguments
    /// remain than `max_arguments`, or another capacity error. The tape is
    /// left unchanged on error.
    pub fn store(
        &mut self,
        lhs: &mut Identifier,
        primal: T,
        args: &[(Identifier, T)],
    ) -> Result<(), TapeError> {
        if !self.is_recording() {
            self.indices.free(lhs);
            return Ok(());
        }

        let mut merged: Arguments<T> = SmallVec::new();
        for &(id, partial) in args {
            if !id.is_active() {
                continue;
            }
            match merged.iter_mut().find(|(seen, _)| *seen == id) {
                Some((_, sum)) => *sum += partial,
                None => merged.push((id, partial)),
            }
        }
        if merged.is_empty() {
            self.indices.free(lhs);
            return Ok(());
        }
        merged.retain(|(_, partial)| !partial.is_zero());
        if merged.len() > self.config.max_arguments {
            return Err(TapeError::StatementTooLarge {
                arguments: merged.len(),
                max: self.config.max_arguments,
            });
        }
        self.push_jacobian(lhs, primal, &merged)
    }

    /// Record `lhs = op(args, constants)` and return the output value.
    ///
    /// `args` are `(handle, primal)` pairs. Jacobian tapes evaluate the
    /// partials right away; primal-value tapes store the operation tag with
    /// its operands and recompute partials in every sweep.
    ///
    /// # Errors
    /// Returns [`TapeError::ArgumentCountMismatch`] if the operand or
    /// constant count does not match `op`, or a capacity error.
    pub fn store_operation(
        &mut self,
        lhs: &mut Identifier,
        op: Operation,
        args: &[(Identifier, T)],
        constants: &[T],
    ) -> Result<T, TapeError> {
        if args.len() != op.arity() {
            return Err(TapeError::ArgumentCountMismatch {
                expected: op.arity(),
                actual: args.len(),
            });
        }
        if constants.len() != op.constant_count() {
            return Err(TapeError::ArgumentCountMismatch {
                expected: op.constant_count(),
                actual: constants.len(),
            });
        }

        let mut operands = [T::zero(); 2];
        for (slot, &(_, value)) in operands.iter_mut().zip(args) {
            *slot = value;
        }
        let operands = &operands[..args.len()];
        let value = op.primal(operands, constants);

        match self.config.kind {
            TapeKind::Jacobian => {
                let mut partials = [T::zero(); 2];
                op.partials(operands, constants, &mut partials[..args.len()]);
                let mut pairs: Arguments<T> = SmallVec::new();
                for (&(id, _), &partial) in args.iter().zip(&partials) {
                    pairs.push((id, partial));
                }
                self.store(lhs, value, &pairs)?;
            }
            TapeKind::PrimalValue => {
                if !self.is_recording() || args.iter().all(|(id, _)| !id.is_active()) {
                    self.indices.free(lhs);
                } else {
                    self.push_operation(lhs, op, args, constants, value)?;
                }
            }
        }
        Ok(value)
    }

    /// Record `lhs = rhs`.
    ///
    /// With copy optimization on a linear Jacobian tape the handle is shared
    /// and nothing is stored.
    pub fn store_copy(
        &mut self,
        lhs: &mut Identifier,
        rhs: Identifier,
        value: T,
    ) -> Result<(), TapeError> {
        if I::IS_LINEAR
            && self.config.copy_optimization
            && self.config.kind == TapeKind::Jacobian
            && self.is_recording()
        {
            *lhs = rhs;
            return Ok(());
        }
        self.store_operation(lhs, Operation::Copy, &[(rhs, value)], &[])?;
        Ok(())
    }

    /// Start a statement whose partials are computed by the caller.
    ///
    /// Exactly `count` arguments must be pushed before
    /// [`ManualStatement::finish`]. Arguments are stored as given, without
    /// merging or dropping zeros.
    ///
    /// # Errors
    /// Returns [`TapeError::StatementTooLarge`] if `count` exceeds
    /// `max_arguments`.
    pub fn begin_manual(
        &mut self,
        primal: T,
        count: usize,
    ) -> Result<ManualStatement<'_, T, I>, TapeError> {
        if count > self.config.max_arguments {
            return Err(TapeError::StatementTooLarge {
                arguments: count,
                max: self.config.max_arguments,
            });
        }
        Ok(ManualStatement {
            tape: self,
            primal,
            expected: count,
            arguments: SmallVec::new(),
        })
    }

    /// Append a statement with explicit handles, e.g. from a stored tape.
    ///
    /// Every handle is reserved with the identifier manager. The primal of
    /// the output slot becomes `primal`; the overwritten value is kept as
    /// the statement's old primal.
    pub(crate) fn restore_statement(
        &mut self,
        mut statement: Statement<T>,
        primal: T,
        arguments: &[Identifier],
        values: &[T],
    ) -> Result<(), TapeError> {
        self.statements.reserve(1, &mut self.budget)?;
        self.arguments.reserve(arguments.len(), &mut self.budget)?;
        self.values.reserve(values.len(), &mut self.budget)?;
        for &id in arguments.iter().filter(|id| id.is_active()) {
            self.indices.reserve(id)?;
        }
        if let Some(lhs) = statement.lhs() {
            self.indices.reserve(lhs)?;
            let old_primal = self.swap_primal(lhs, primal);
            statement.set_old_primal(old_primal);
        }
        self.statements.push(statement);
        if let Statement::Input { lhs, .. } = statement {
            let mut end = self.statements.position();
            let at = self.statements.prev_position(&mut end);
            self.input_statements.insert(lhs, at);
        }
        self.arguments.extend_from_slice(arguments);
        self.values.extend_from_slice(values);
        Ok(())
    }

    /// Copy that always stores a statement into a fresh handle.
    fn push_copy(&mut self, lhs: &mut Identifier, source: Identifier, value: T) -> Result<(), TapeError> {
        match self.config.kind {
            TapeKind::Jacobian => self.push_jacobian(lhs, value, &[(source, T::one())]),
            TapeKind::PrimalValue => {
                self.push_operation(lhs, Operation::Copy, &[(source, value)], &[], value)
            }
        }
    }

    /// Write a Jacobian statement; `args` are final.
    pub(crate) fn push_jacobian(
        &mut self,
        lhs: &mut Identifier,
        primal: T,
        args: &[(Identifier, T)],
    ) -> Result<(), TapeError> {
        let n = args.len();
        self.statements.reserve(1, &mut self.budget)?;
        self.arguments.reserve(n, &mut self.budget)?;
        self.values.reserve(n, &mut self.budget)?;
        self.indices.assign(lhs)?;

        let old_primal = self.swap_primal(*lhs, primal);
        self.statements.push(Statement::Jacobian {
            lhs: *lhs,
            arg_count: n as u16,
            primal,
            old_primal,
        });
        self.arguments.extend(args.iter().map(|&(id, _)| id));
        self.values.extend(args.iter().map(|&(_, partial)| partial));
        Ok(())
    }

    /// Write an operation statement; at least one operand is active.
    fn push_operation(
        &mut self,
        lhs: &mut Identifier,
        op: Operation,
        args: &[(Identifier, T)],
        constants: &[T],
        value: T,
    ) -> Result<(), TapeError> {
        let passive: SmallVec<[T; 2]> = args
            .iter()
            .filter(|(id, _)| !id.is_active())
            .map(|&(_, v)| v)
            .collect();
        self.statements.reserve(1, &mut self.budget)?;
        self.arguments.reserve(args.len(), &mut self.budget)?;
        self.values
            .reserve(constants.len() + passive.len(), &mut self.budget)?;
        self.indices.assign(lhs)?;

        let old_primal = self.swap_primal(*lhs, value);
        self.statements.push(Statement::Operation {
            lhs: *lhs,
            op,
            passive_count: passive.len() as u8,
            old_primal,
        });
        self.arguments.extend(args.iter().map(|&(id, _)| id));
        self.values.extend_from_slice(constants);
        self.values.extend_from_slice(&passive);
        Ok(())
    }
}

/// Statement under construction by [`Tape::begin_manual`].
pub struct ManualStatement<'a, T: Real, I: IndexManager> {
    tape: &'a mut Tape<T, I>,
    primal: T,
    expected: usize,
    arguments: SmallVec<[(Identifier, T); 8]>,
}

impl<T: Real, I: IndexManager> ManualStatement<'_, T, I> {
    /// Append one `(handle, partial)` pair.
    pub fn push(&mut self, id: Identifier, partial: T) -> &mut Self {
        self.arguments.push((id, partial));
        self
    }

    /// Store the statement and assign `lhs`.
    ///
    /// # Errors
    /// Returns [`TapeError::ArgumentCountMismatch`] if the number of pushed
    /// arguments differs from the announced count.
    pub fn finish(self, lhs: &mut Identifier) -> Result<(), TapeError> {
        if self.arguments.len() != self.expected {
            return Err(TapeError::ArgumentCountMismatch {
                expected: self.expected,
                actual: self.arguments.len(),
            });
        }
        if !self.tape.is_recording() {
            self.tape.indices.free(lhs);
            return Ok(());
        }
        self.tape.push_jacobian(lhs, self.primal, &self.arguments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ReuseIndexManager;
    use crate::tape::TapeConfig;

    fn recording(config: TapeConfig) -> Tape<f64> {
        let mut tape = Tape::new(config);
        tape.set_active();
        tape
    }

    fn last_arguments(tape: &Tape<f64>) -> Vec<(Identifier, f64)> {
        let mut out = Vec::new();
        tape.visit_reverse(|view| {
            if out.is_empty() {
                out = view
                    .arguments
                    .iter()
                    .copied()
                    .zip(view.values.iter().copied())
                    .collect();
            }
        });
        out
    }

    #[test]
    fn test_store_merges_duplicates_and_drops_zeros() {
        let mut tape = recording(TapeConfig::jacobian());
        let a = tape.register_input(1.0).unwrap();
        let b = tape.register_input(2.0).unwrap();
        let mut y = Identifier::PASSIVE;
        tape.store(&mut y, 0.0, &[(a, 1.0), (b, 0.0), (a, 2.0), (Identifier::PASSIVE, 5.0)])
            .unwrap();
        assert!(y.is_active());
        assert_eq!(last_arguments(&tape), vec![(a, 3.0)]);
    }

    #[test]
    fn test_store_all_passive_records_nothing() {
        let mut tape = recording(TapeConfig::jacobian());
        let mut y = Identifier::new(7);
        tape.store(&mut y, 1.0, &[(Identifier::PASSIVE, 2.0)]).unwrap();
        assert!(!y.is_active());
        assert!(tape.is_empty());
    }

    #[test]
    fn test_store_zero_partials_keeps_statement() {
        let mut tape = recording(TapeConfig::jacobian());
        let a = tape.register_input(1.0).unwrap();
        let mut y = Identifier::PASSIVE;
        tape.store(&mut y, 0.0, &[(a, 1.0), (a, -1.0)]).unwrap();
        assert!(y.is_active());
        assert_eq!(tape.size(), 1);
        assert!(last_arguments(&tape).is_empty());
    }

    #[test]
    fn test_store_when_passive() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let mut y = Identifier::new(3);
        tape.store(&mut y, 1.0, &[(Identifier::new(1), 1.0)]).unwrap();
        assert!(!y.is_active());
        assert!(tape.is_empty());
    }

    #[test]
    fn test_statement_too_large_leaves_tape_unchanged() {
        let mut tape = recording(TapeConfig::jacobian().with_max_arguments(2));
        let inputs: Vec<_> = (0..3).map(|i| tape.register_input(i as f64).unwrap()).collect();
        let before = tape.position();
        let args: Vec<_> = inputs.iter().map(|&id| (id, 1.0)).collect();
        let mut y = Identifier::PASSIVE;
        let err = tape.store(&mut y, 0.0, &args).unwrap_err();
        assert!(err.is_capacity());
        assert_eq!(tape.position(), before);
        assert!(!y.is_active());
    }

    #[test]
    fn test_store_operation_checks_arity() {
        let mut tape = recording(TapeConfig::jacobian());
        let a = tape.register_input(1.0).unwrap();
        let mut y = Identifier::PASSIVE;
        let err = tape
            .store_operation(&mut y, Operation::Add, &[(a, 1.0)], &[])
            .unwrap_err();
        assert!(matches!(
            err,
            TapeError::ArgumentCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_primal_operation_stores_passive_operand() {
        let mut tape = recording(TapeConfig::primal_value());
        let a = tape.register_input(3.0).unwrap();
        let mut y = Identifier::PASSIVE;
        let value = tape
            .store_operation(&mut y, Operation::Mul, &[(Identifier::PASSIVE, 2.0), (a, 3.0)], &[])
            .unwrap();
        assert_eq!(value, 6.0);
        assert_eq!(tape.primal(y), Some(6.0));

        let mut seen = None;
        tape.visit_reverse(|view| {
            if seen.is_none() {
                seen = Some((view.arguments.to_vec(), view.values.to_vec()));
            }
        });
        let (arguments, values) = seen.unwrap();
        assert_eq!(arguments, vec![Identifier::PASSIVE, a]);
        assert_eq!(values, vec![2.0]);
    }

    #[test]
    fn test_copy_optimization_shares_handle() {
        let mut tape = recording(TapeConfig::jacobian().with_copy_optimization(true));
        let a = tape.register_input(1.0).unwrap();
        let mut b = Identifier::PASSIVE;
        tape.store_copy(&mut b, a, 1.0).unwrap();
        assert_eq!(a, b);
        assert!(tape.is_empty());

        // The output still gets its own handle.
        tape.register_output(&mut b, 1.0).unwrap();
        assert_ne!(a, b);
        assert_eq!(tape.size(), 1);
    }

    #[test]
    fn test_register_output_twice() {
        let mut tape = recording(TapeConfig::jacobian());
        let a = tape.register_input(1.0).unwrap();
        let mut y = Identifier::PASSIVE;
        tape.store(&mut y, 1.0, &[(a, 1.0)]).unwrap();
        tape.register_output(&mut y, 1.0).unwrap();
        let err = tape.register_output(&mut y, 1.0).unwrap_err();
        assert!(matches!(err, TapeError::AlreadyRegistered { .. }));
    }

    #[test]
    fn test_reuse_output_gets_fresh_handle() {
        let mut tape: Tape<f64, ReuseIndexManager> = Tape::new(TapeConfig::jacobian());
        tape.set_active();
        let a = tape.register_input(1.0).unwrap();
        let mut y = a;
        tape.register_output(&mut y, 1.0).unwrap();
        assert_ne!(y, a);
        assert_eq!(tape.outputs(), &[y]);
    }

    #[test]
    fn test_manual_statement() {
        let mut tape = recording(TapeConfig::jacobian());
        let a = tape.register_input(1.0).unwrap();
        let b = tape.register_input(2.0).unwrap();

        let mut y = Identifier::PASSIVE;
        let mut manual = tape.begin_manual(5.0, 2).unwrap();
        manual.push(a, 2.0).push(b, 0.0);
        manual.finish(&mut y).unwrap();
        assert_eq!(last_arguments(&tape), vec![(a, 2.0), (b, 0.0)]);

        let mut z = Identifier::PASSIVE;
        let mut manual = tape.begin_manual(1.0, 2).unwrap();
        manual.push(a, 1.0);
        let err = manual.finish(&mut z).unwrap_err();
        assert!(matches!(
            err,
            TapeError::ArgumentCountMismatch {
                expected: 2,
                actual: 1
            }
        ));
    }

    #[test]
    fn test_register_input_records_on_primal_tape() {
        let mut tape = recording(TapeConfig::primal_value());
        let x = tape.register_input(1.5).unwrap();
        assert_eq!(tape.size(), 1);
        assert_eq!(tape.primal(x), Some(1.5));

        let mut jacobian = recording(TapeConfig::jacobian());
        jacobian.register_input(1.5).unwrap();
        assert!(jacobian.is_empty());
    }
}
