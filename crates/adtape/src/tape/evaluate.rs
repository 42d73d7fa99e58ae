//! Reverse, forward and primal sweeps.
//!
//! All sweeps walk the four stores in lockstep. The reverse sweep reads each
//! output derivative, clears it and then accumulates into the arguments, so
//! a statement that names its own output as an argument (possible under the
//! reuse policy) sees the pre-statement value. The forward sweep computes
//! the output tangent from the arguments before overwriting it. Passive
//! arguments are skipped by both, so caller supplied storage never sees the
//! passive handle.
//!
//! On primal-value tapes `Tape::primals` always holds the values at the end
//! of the tape. Sweeps that need the values at an earlier point restore
//! them from the overwritten ("old") primals stored with each statement.

use super::access::StorageAccess;
use super::statement::gather_operands;
use super::{Position, Statement, Tape, TapeState};
use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::real::Real;
use crate::storage::{AdjointStorage, ChunkPosition, ChunkedStore, DerivativeVector, Gradient};
use log::debug;

impl<T: Real, I: IndexManager> Tape<T, I> {
    // ========================================================================
    // Reverse
    // ========================================================================

    /// Reverse sweep over the whole tape using the tape's adjoint vector.
    ///
    /// # Errors
    /// Returns [`TapeError::EvaluateWhileRecording`] if the tape is active.
    pub fn evaluate(&mut self) -> Result<(), TapeError> {
        let start = self.position();
        let end = self.zero_position();
        self.evaluate_range(&start, &end)
    }

    /// Reverse sweep over `[end, start)` using the tape's adjoint vector.
    pub fn evaluate_range(&mut self, start: &Position, end: &Position) -> Result<(), TapeError> {
        let mut adjoints = std::mem::take(&mut self.adjoints);
        let result = self.evaluate_with::<T, _>(start, end, &mut adjoints);
        self.adjoints = adjoints;
        result
    }

    /// Reverse sweep over `[end, start)` into caller supplied storage.
    ///
    /// Statements are processed in strict reverse recording order. For each
    /// one the output derivative is read, cleared, and then
    /// `adjoint[arg] += partial * adjoint[out]` is applied per argument.
    /// External function markers call their reverse callback instead.
    ///
    /// # Arguments
    /// * `start` - Later position (`start >= end`)
    /// * `end` - Earlier position
    /// * `adjoints` - Derivative storage, scalar or vector mode
    ///
    /// # Errors
    /// Returns [`TapeError::EvaluateWhileRecording`] if the tape is active,
    /// [`TapeError::InvalidRange`] if `start < end` or `start` lies after
    /// the end of the tape.
    ///
    /// # Example
    ///
    /// ```
    /// use adtape::{DerivativeVector, Direction, Identifier, Tape, TapeConfig};
    ///
    /// let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
    /// tape.set_active();
    /// let a = tape.register_input(2.0).unwrap();
    /// let b = tape.register_input(3.0).unwrap();
    /// let mut sum = Identifier::PASSIVE;
    /// tape.store(&mut sum, 5.0, &[(a, 1.0), (b, 1.0)]).unwrap();
    /// let mut prod = Identifier::PASSIVE;
    /// tape.store(&mut prod, 6.0, &[(a, 3.0), (b, 2.0)]).unwrap();
    /// tape.set_passive();
    ///
    /// let mut adjoints: DerivativeVector<Direction<f64, 2>> = DerivativeVector::new();
    /// adjoints.resize_for(tape.indices());
    /// adjoints[sum] = Direction::unit(0);
    /// adjoints[prod] = Direction::unit(1);
    /// let (start, end) = (tape.position(), tape.zero_position());
    /// tape.evaluate_with(&start, &end, &mut adjoints).unwrap();
    /// assert_eq!(adjoints[a].components(), &[1.0, 3.0]);
    /// ```
    pub fn evaluate_with<G, S>(
        &mut self,
        start: &Position,
        end: &Position,
        adjoints: &mut S,
    ) -> Result<(), TapeError>
    where
        G: Gradient<T>,
        S: AdjointStorage<T, G>,
    {
        self.check_evaluable()?;
        if start < end {
            return Err(TapeError::InvalidRange {
                message: format!("reverse sweep from {start} down to {end}"),
            });
        }
        if *start > self.position() {
            return Err(TapeError::InvalidRange {
                message: format!("reverse sweep starts at {start}, after the tape end"),
            });
        }
        debug!("reverse sweep from {start} down to {end} (dim {})", G::DIM);
        adjoints.ensure_size(self.indices.largest_issued() as usize);
        self.state = TapeState::EvaluatingReverse;

        if self.has_primals() && !I::IS_LINEAR {
            // Work on a copy rewound to `start`; the tape keeps its end state.
            let mut primals = self.primals.clone();
            restore_primals(
                &self.statements,
                &mut primals,
                self.statements.position(),
                start.statements,
            );
            self.reverse_sweep(start, end, adjoints, Some(&mut primals), true);
        } else if self.has_primals() {
            let mut primals = std::mem::take(&mut self.primals);
            self.reverse_sweep(start, end, adjoints, Some(&mut primals), false);
            self.primals = primals;
        } else {
            self.reverse_sweep(start, end, adjoints, None, false);
        }

        self.state = TapeState::Idle;
        Ok(())
    }

    fn reverse_sweep<G, S>(
        &mut self,
        start: &Position,
        end: &Position,
        adjoints: &mut S,
        mut primals: Option<&mut [T]>,
        restore: bool,
    ) where
        G: Gradient<T>,
        S: AdjointStorage<T, G>,
    {
        let skip_zero = self.config.skip_zero_adjoints;
        let statements = &self.statements;
        let arguments = &self.arguments;
        let values = &self.values;
        let externals = &mut self.externals;

        let mut stmt_pos = start.statements;
        let mut arg_pos = start.arguments;
        let mut val_pos = start.values;
        let mut ext_pos = start.externals;
        let mut operands = [T::zero(); 2];
        let mut partials = [T::zero(); 2];

        while stmt_pos > end.statements {
            let statement = *statements.prev(&mut stmt_pos);
            if restore {
                if let (Some(lhs), Some(old), Some(slots)) =
                    (statement.lhs(), statement.old_primal(), primals.as_deref_mut())
                {
                    write_primal(slots, lhs, old);
                }
            }

            match statement {
                Statement::Input { .. } => {}
                Statement::Jacobian { lhs, arg_count, .. } => {
                    let n = arg_count as usize;
                    let ids = arguments.slice_before(&mut arg_pos, n);
                    let jacobian = values.slice_before(&mut val_pos, n);

                    let adjoint = adjoints.read(lhs);
                    adjoints.clear(lhs);
                    if skip_zero && adjoint.is_zero() {
                        continue;
                    }
                    for (&id, &partial) in ids.iter().zip(jacobian) {
                        if id.is_active() {
                            adjoints.add_scaled(id, partial, &adjoint);
                        }
                    }
                }
                Statement::Operation {
                    lhs,
                    op,
                    passive_count,
                    ..
                } => {
                    let arity = op.arity();
                    let constant_count = op.constant_count();
                    let ids = arguments.slice_before(&mut arg_pos, arity);
                    let stored =
                        values.slice_before(&mut val_pos, constant_count + passive_count as usize);

                    let adjoint = adjoints.read(lhs);
                    adjoints.clear(lhs);
                    if skip_zero && adjoint.is_zero() {
                        continue;
                    }
                    let (constants, passive) = stored.split_at(constant_count);
                    gather_operands(
                        ids,
                        passive,
                        primals.as_deref().unwrap_or(&[]),
                        &mut operands[..arity],
                    );
                    op.partials(&operands[..arity], constants, &mut partials[..arity]);
                    for (&id, &partial) in ids.iter().zip(&partials[..arity]) {
                        if id.is_active() {
                            adjoints.add_scaled(id, partial, &adjoint);
                        }
                    }
                }
                Statement::External => {
                    let at = externals.prev_position(&mut ext_pos);
                    if let Some(record) = externals.get_mut(at) {
                        let mut access =
                            StorageAccess::<T, G, S>::new(Some(&mut *adjoints), primals.as_deref_mut());
                        record.reverse(&mut access);
                    }
                }
            }
        }
    }

    // ========================================================================
    // Forward
    // ========================================================================

    /// Forward sweep over the whole tape using the tape's derivative vector.
    pub fn evaluate_forward(&mut self) -> Result<(), TapeError> {
        let start = self.zero_position();
        let end = self.position();
        self.evaluate_forward_range(&start, &end)
    }

    /// Forward sweep over `[start, end)` using the tape's derivative vector.
    pub fn evaluate_forward_range(&mut self, start: &Position, end: &Position) -> Result<(), TapeError> {
        let mut tangents = std::mem::take(&mut self.adjoints);
        let result = self.evaluate_forward_with::<T, _>(start, end, &mut tangents);
        self.adjoints = tangents;
        result
    }

    /// Forward sweep over `[start, end)` into caller supplied storage.
    ///
    /// Each statement overwrites its output tangent with
    /// `sum(partial * tangent[arg])`. Input tangents are left as seeded.
    /// Primal-value tapes recompute primal values along the way.
    ///
    /// # Errors
    /// Returns [`TapeError::EvaluateWhileRecording`] if the tape is active,
    /// [`TapeError::InvalidRange`] if `start > end` or `end` lies after the
    /// end of the tape.
    pub fn evaluate_forward_with<G, S>(
        &mut self,
        start: &Position,
        end: &Position,
        tangents: &mut S,
    ) -> Result<(), TapeError>
    where
        G: Gradient<T>,
        S: AdjointStorage<T, G>,
    {
        self.check_forward_range(start, end)?;
        debug!("forward sweep from {start} to {end} (dim {})", G::DIM);
        tangents.ensure_size(self.indices.largest_issued() as usize);
        self.state = TapeState::EvaluatingForward;
        self.replay::<G, S>(start, end, Some(tangents));
        self.state = TapeState::Idle;
        Ok(())
    }

    // ========================================================================
    // Primal
    // ========================================================================

    /// Recompute every primal value from the current inputs.
    pub fn evaluate_primal(&mut self) -> Result<(), TapeError> {
        let start = self.zero_position();
        let end = self.position();
        self.evaluate_primal_range(&start, &end)
    }

    /// Recompute the primal values of statements in `[start, end)`.
    ///
    /// Derivatives are not touched. On reuse tapes the statements after
    /// `end` are replayed as well, so the primal vector stays consistent
    /// with the end of the tape.
    ///
    /// # Errors
    /// Returns [`TapeError::Unsupported`] on Jacobian tapes, otherwise the
    /// same errors as [`Tape::evaluate_forward_with`].
    pub fn evaluate_primal_range(&mut self, start: &Position, end: &Position) -> Result<(), TapeError> {
        if !self.has_primals() {
            return Err(TapeError::Unsupported {
                operation: "primal evaluation",
                kind: self.config.kind,
            });
        }
        self.check_forward_range(start, end)?;
        debug!("primal sweep from {start} to {end}");
        self.state = TapeState::EvaluatingPrimal;
        self.replay::<T, DerivativeVector<T>>(start, end, None);
        self.state = TapeState::Idle;
        Ok(())
    }

    fn check_evaluable(&self) -> Result<(), TapeError> {
        if self.state == TapeState::Recording {
            return Err(TapeError::EvaluateWhileRecording);
        }
        Ok(())
    }

    fn check_forward_range(&self, start: &Position, end: &Position) -> Result<(), TapeError> {
        self.check_evaluable()?;
        if start > end {
            return Err(TapeError::InvalidRange {
                message: format!("forward sweep from {start} to {end}"),
            });
        }
        if *end > self.position() {
            return Err(TapeError::InvalidRange {
                message: format!("forward sweep ends at {end}, after the tape end"),
            });
        }
        Ok(())
    }

    /// Forward walk over `[start, end)`, keeping reuse primals consistent.
    fn replay<G, S>(&mut self, start: &Position, end: &Position, tangents: Option<&mut S>)
    where
        G: Gradient<T>,
        S: AdjointStorage<T, G>,
    {
        let reuse_primals = self.has_primals() && !I::IS_LINEAR;
        let tape_end = self.position();
        if reuse_primals {
            restore_primals(
                &self.statements,
                &mut self.primals,
                tape_end.statements,
                start.statements,
            );
        }
        self.forward_walk::<G, S>(start, end, tangents);
        if reuse_primals && *end < tape_end {
            self.forward_walk::<G, S>(end, &tape_end, None);
        }
    }

    fn forward_walk<G, S>(&mut self, start: &Position, end: &Position, mut tangents: Option<&mut S>)
    where
        G: Gradient<T>,
        S: AdjointStorage<T, G>,
    {
        let has_primals = self.has_primals();
        let statements = &mut self.statements;
        let arguments = &self.arguments;
        let values = &self.values;
        let externals = &mut self.externals;
        let primals = &mut self.primals;

        let mut stmt_pos = start.statements;
        let mut arg_pos = start.arguments;
        let mut val_pos = start.values;
        let mut ext_pos = start.externals;
        let mut operands = [T::zero(); 2];
        let mut partials = [T::zero(); 2];

        while stmt_pos < end.statements {
            let at = statements.next_position(&mut stmt_pos);
            let Some(&statement) = statements.get(at) else {
                break;
            };

            let new_primal = match statement {
                Statement::Input { value, .. } => Some(value),
                Statement::Jacobian {
                    lhs,
                    arg_count,
                    primal,
                    ..
                } => {
                    let n = arg_count as usize;
                    let ids = arguments.slice_after(&mut arg_pos, n);
                    let jacobian = values.slice_after(&mut val_pos, n);
                    if let Some(tangents) = tangents.as_deref_mut() {
                        let mut tangent = G::zero();
                        for (&id, &partial) in ids.iter().zip(jacobian) {
                            if id.is_active() {
                                tangent.add_scaled(partial, &tangents.read(id));
                            }
                        }
                        tangents.set(lhs, tangent);
                    }
                    Some(primal)
                }
                Statement::Operation {
                    lhs,
                    op,
                    passive_count,
                    ..
                } => {
                    let arity = op.arity();
                    let constant_count = op.constant_count();
                    let ids = arguments.slice_after(&mut arg_pos, arity);
                    let stored =
                        values.slice_after(&mut val_pos, constant_count + passive_count as usize);
                    let (constants, passive) = stored.split_at(constant_count);
                    gather_operands(ids, passive, primals, &mut operands[..arity]);
                    if let Some(tangents) = tangents.as_deref_mut() {
                        op.partials(&operands[..arity], constants, &mut partials[..arity]);
                        let mut tangent = G::zero();
                        for (&id, &partial) in ids.iter().zip(&partials[..arity]) {
                            if id.is_active() {
                                tangent.add_scaled(partial, &tangents.read(id));
                            }
                        }
                        tangents.set(lhs, tangent);
                    }
                    Some(op.primal(&operands[..arity], constants))
                }
                Statement::External => {
                    let ext_at = externals.next_position(&mut ext_pos);
                    if let Some(record) = externals.get_mut(ext_at) {
                        let slots = if has_primals {
                            Some(&mut primals[..])
                        } else {
                            None
                        };
                        match tangents.as_deref_mut() {
                            Some(tangents) => {
                                let mut access = StorageAccess::<T, G, S>::new(Some(tangents), slots);
                                record.forward(&mut access);
                            }
                            None => {
                                let mut access = StorageAccess::<T, G, S>::new(None, slots);
                                record.primal(&mut access);
                            }
                        }
                    }
                    None
                }
            };

            if let (true, Some(value), Some(lhs)) = (has_primals, new_primal, statement.lhs()) {
                let old = write_primal(primals, lhs, value);
                if let Some(stored) = statements.get_mut(at) {
                    stored.set_old_primal(old);
                }
            }
        }
    }
}

/// Walk back from `from` to `to`, writing each statement's old primal.
fn restore_primals<T: Real>(
    statements: &ChunkedStore<Statement<T>>,
    primals: &mut [T],
    from: ChunkPosition,
    to: ChunkPosition,
) {
    let mut pos = from;
    while pos > to {
        let statement = statements.prev(&mut pos);
        if let (Some(lhs), Some(old)) = (statement.lhs(), statement.old_primal()) {
            write_primal(primals, lhs, old);
        }
    }
}

/// Store `value` for `id` and return the previous value.
fn write_primal<T: Real>(primals: &mut [T], id: Identifier, value: T) -> T {
    match primals.get_mut(id.index()) {
        Some(slot) if id.is_active() => std::mem::replace(slot, value),
        _ => T::zero(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ReuseIndexManager;
    use crate::operation::Operation;
    use crate::tape::TapeConfig;
    use approx::assert_relative_eq;

    /// Records `y = sin(x0) * x1 + x0` and returns `(x0, x1, y)`.
    fn record<I: IndexManager>(tape: &mut Tape<f64, I>, x0: f64, x1: f64) -> (Identifier, Identifier, Identifier) {
        tape.set_active();
        let a = tape.register_input(x0).unwrap();
        let b = tape.register_input(x1).unwrap();
        let mut s = Identifier::PASSIVE;
        let sv = tape.store_operation(&mut s, Operation::Sin, &[(a, x0)], &[]).unwrap();
        let mut p = Identifier::PASSIVE;
        let pv = tape
            .store_operation(&mut p, Operation::Mul, &[(s, sv), (b, x1)], &[])
            .unwrap();
        let mut y = Identifier::PASSIVE;
        let yv = tape
            .store_operation(&mut y, Operation::Add, &[(p, pv), (a, x0)], &[])
            .unwrap();
        tape.register_output(&mut y, yv).unwrap();
        tape.set_passive();
        (a, b, y)
    }

    #[test]
    fn test_reverse_both_kinds() {
        let (x0, x1) = (0.3, 1.7);
        for config in [TapeConfig::jacobian(), TapeConfig::primal_value()] {
            let mut tape: Tape<f64> = Tape::new(config);
            let (a, b, y) = record(&mut tape, x0, x1);
            tape.set_gradient(y, 1.0);
            tape.evaluate().unwrap();
            assert_relative_eq!(tape.gradient(a), x0.cos() * x1 + 1.0, epsilon = 1e-12);
            assert_relative_eq!(tape.gradient(b), x0.sin(), epsilon = 1e-12);
            // Consumed.
            assert_eq!(tape.gradient(y), 0.0);
        }
    }

    #[test]
    fn test_forward_both_kinds() {
        let (x0, x1) = (0.3, 1.7);
        for config in [TapeConfig::jacobian(), TapeConfig::primal_value()] {
            let mut tape: Tape<f64> = Tape::new(config);
            let (a, _, y) = record(&mut tape, x0, x1);
            tape.set_gradient(a, 1.0);
            tape.evaluate_forward().unwrap();
            assert_relative_eq!(tape.gradient(y), x0.cos() * x1 + 1.0, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_evaluate_while_recording() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        tape.set_active();
        assert!(matches!(
            tape.evaluate().unwrap_err(),
            TapeError::EvaluateWhileRecording
        ));
        assert!(matches!(
            tape.evaluate_forward().unwrap_err(),
            TapeError::EvaluateWhileRecording
        ));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let (_, _, y) = record(&mut tape, 1.0, 2.0);
        let (start, end) = (tape.zero_position(), tape.position());
        tape.set_gradient(y, 1.0);
        let err = tape.evaluate_range(&start, &end).unwrap_err();
        assert!(matches!(err, TapeError::InvalidRange { .. }));
        // Nothing was consumed.
        assert_eq!(tape.gradient(y), 1.0);
        assert!(tape.evaluate_forward_range(&end, &start).is_err());
    }

    #[test]
    fn test_empty_range_is_noop() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let (_, _, y) = record(&mut tape, 1.0, 2.0);
        tape.set_gradient(y, 1.0);
        let pos = tape.position();
        tape.evaluate_range(&pos, &pos).unwrap();
        assert_eq!(tape.gradient(y), 1.0);
    }

    #[test]
    fn test_primal_sweep_after_set_primal() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::primal_value());
        let (a, b, y) = record(&mut tape, 0.3, 1.7);
        tape.set_primal(a, 1.1).unwrap();
        tape.set_primal(b, -0.4).unwrap();
        tape.evaluate_primal().unwrap();
        assert_relative_eq!(tape.primal(y).unwrap(), 1.1f64.sin() * -0.4 + 1.1, epsilon = 1e-12);

        // The reverse sweep uses the new point.
        tape.set_gradient(y, 1.0);
        tape.evaluate().unwrap();
        assert_relative_eq!(tape.gradient(a), 1.1f64.cos() * -0.4 + 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_primal_sweep_on_jacobian_tape() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let err = tape.evaluate_primal().unwrap_err();
        assert!(matches!(err, TapeError::Unsupported { .. }));
    }

    #[test]
    fn test_reuse_primal_tape_in_place_update() {
        // x = x * x, twice, with the same handle.
        let mut tape: Tape<f64, ReuseIndexManager> = Tape::new(TapeConfig::primal_value());
        tape.set_active();
        let input = tape.register_input(3.0).unwrap();
        let mut x = Identifier::PASSIVE;
        let mut value = tape
            .store_operation(&mut x, Operation::Copy, &[(input, 3.0)], &[])
            .unwrap();
        for _ in 0..2 {
            let prev = x;
            value = tape
                .store_operation(&mut x, Operation::Mul, &[(prev, value), (prev, value)], &[])
                .unwrap();
        }
        tape.set_passive();
        assert_eq!(value, 81.0);

        // d(x^4)/dx = 4 x^3
        tape.set_gradient(x, 1.0);
        tape.evaluate().unwrap();
        assert_relative_eq!(tape.gradient(input), 108.0, epsilon = 1e-9);
        // End state is untouched by the reverse sweep.
        assert_eq!(tape.primal(x), Some(81.0));

        tape.set_primal(input, 2.0).unwrap();
        tape.evaluate_primal().unwrap();
        assert_eq!(tape.primal(x), Some(16.0));

        tape.clear_adjoints();
        tape.set_gradient(input, 1.0);
        tape.evaluate_forward().unwrap();
        assert_relative_eq!(tape.gradient(x), 32.0, epsilon = 1e-9);
    }
}
