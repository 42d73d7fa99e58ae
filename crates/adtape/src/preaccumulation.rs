//! Preaccumulation: compress a recorded region into one statement per output.
//!
//! Between [`PreaccumulationHelper::start`] and
//! [`PreaccumulationHelper::finish`] the caller records arbitrary code. On
//! finish the local Jacobian of the region's outputs with respect to its
//! inputs is computed by sweeping only the new statements, the region is
//! rolled back with `reset_to`, and one Jacobian statement per output is
//! stored in its place. Derivatives through the region are unchanged up to
//! summation order; the tape usually gets much shorter.
//!
//! # Example
//!
//! ```
//! use adtape::{Identifier, Operation, PreaccumulationHelper, Tape, TapeConfig};
//!
//! let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
//! tape.set_active();
//! let x = tape.register_input(2.0).unwrap();
//!
//! let mut helper = PreaccumulationHelper::new();
//! helper.start(&tape, &[x]);
//! let mut y = Identifier::PASSIVE;
//! let mut value = 2.0;
//! tape.store_copy(&mut y, x, value).unwrap();
//! for _ in 0..10 {
//!     let prev = y;
//!     value = tape.store_operation(&mut y, Operation::MulConst, &[(prev, value)], &[1.5]).unwrap();
//! }
//! let mut outputs = [y];
//! helper.finish(&mut tape, &mut outputs).unwrap();
//! assert_eq!(tape.size(), 1);
//!
//! tape.set_passive();
//! tape.set_gradient(outputs[0], 1.0);
//! tape.evaluate().unwrap();
//! assert!((tape.gradient(x) - 1.5f64.powi(10)).abs() < 1e-12);
//! ```

use crate::error::TapeError;
use crate::index::{Identifier, IndexManager};
use crate::real::Real;
use crate::storage::{AdjointStorage, DerivativeVector};
use crate::tape::{Position, Statement, Tape};
use faer::{Mat, MatRef};
use log::debug;
use smallvec::SmallVec;

/// Options for [`PreaccumulationHelper`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreaccumulationConfig {
    /// Fail with [`TapeError::UnusedVariable`] when an input has an all-zero
    /// column or an output an all-zero row.
    pub reject_unused: bool,
    /// Use the reverse sweep when inputs and outputs are equally many.
    pub prefer_reverse: bool,
}

impl Default for PreaccumulationConfig {
    fn default() -> Self {
        Self {
            reject_unused: false,
            prefer_reverse: true,
        }
    }
}

/// Records a region and replaces it with its compressed local Jacobian.
#[derive(Debug)]
pub struct PreaccumulationHelper<T: Real> {
    config: PreaccumulationConfig,
    start: Option<Position>,
    inputs: Vec<Identifier>,
    scratch: DerivativeVector<T>,
    jacobian: Mat<T>,
}

impl<T: Real> PreaccumulationHelper<T> {
    pub fn new() -> Self {
        Self::with_config(PreaccumulationConfig::default())
    }

    pub fn with_config(config: PreaccumulationConfig) -> Self {
        Self {
            config,
            start: None,
            inputs: Vec::new(),
            scratch: DerivativeVector::new(),
            jacobian: Mat::from_fn(0, 0, |_, _| T::zero()),
        }
    }

    /// Mark the current tape position as the start of the region.
    pub fn start<I: IndexManager>(&mut self, tape: &Tape<T, I>, inputs: &[Identifier]) {
        self.start = Some(tape.position());
        self.inputs.clear();
        self.inputs.extend_from_slice(inputs);
    }

    /// Add an input after [`PreaccumulationHelper::start`].
    pub fn add_input(&mut self, id: Identifier) {
        self.inputs.push(id);
    }

    /// Jacobian computed by the last successful finish, outputs by inputs.
    pub fn jacobian(&self) -> MatRef<'_, T> {
        self.jacobian.as_ref()
    }

    /// Compress the region recorded since `start`.
    ///
    /// `outputs` are rewritten to the handles of the new statements. On
    /// linear tapes every handle issued inside the region other than the
    /// outputs is invalid afterwards.
    ///
    /// # Errors
    /// Returns [`TapeError::PreaccumulationNotStarted`] without a matching
    /// start, [`TapeError::UnusedVariable`] for unused inputs or outputs when
    /// configured to reject them, or a capacity error from re-recording.
    pub fn finish<I: IndexManager>(
        &mut self,
        tape: &mut Tape<T, I>,
        outputs: &mut [Identifier],
    ) -> Result<(), TapeError> {
        let start = self.start.take().ok_or(TapeError::PreaccumulationNotStarted)?;
        let was_recording = tape.is_recording();
        tape.set_passive();
        let result = self.compress(tape, &start, outputs);
        if was_recording {
            tape.set_active();
        }
        result
    }

    fn compress<I: IndexManager>(
        &mut self,
        tape: &mut Tape<T, I>,
        start: &Position,
        outputs: &mut [Identifier],
    ) -> Result<(), TapeError> {
        let end = tape.position();
        let n_in = self.inputs.len();
        let n_out = outputs.len();
        let reverse = n_out < n_in || (n_out == n_in && self.config.prefer_reverse);

        // Column-major, n_out x n_in.
        let mut entries = vec![T::zero(); n_out * n_in];
        if reverse {
            for (j, &output) in outputs.iter().enumerate() {
                seed(&mut self.scratch, tape, output);
                tape.evaluate_with::<T, _>(&end, start, &mut self.scratch)?;
                for (i, &input) in self.inputs.iter().enumerate() {
                    entries[i * n_out + j] = AdjointStorage::<T, T>::read(&self.scratch, input);
                }
            }
        } else {
            for (i, &input) in self.inputs.iter().enumerate() {
                seed(&mut self.scratch, tape, input);
                tape.evaluate_forward_with::<T, _>(start, &end, &mut self.scratch)?;
                for (j, &output) in outputs.iter().enumerate() {
                    entries[i * n_out + j] = AdjointStorage::<T, T>::read(&self.scratch, output);
                }
            }
        }
        self.jacobian = Mat::from_fn(n_out, n_in, |j, i| entries[i * n_out + j]);
        debug!(
            "preaccumulated {n_out} x {n_in} jacobian with {} sweeps",
            if reverse { "reverse" } else { "forward" }
        );

        if self.config.reject_unused {
            self.check_unused(outputs)?;
        }

        let primals: Vec<T> = outputs
            .iter()
            .map(|&output| output_primal(tape, output, start, &end))
            .collect();

        tape.reset_to(start)?;

        let mut fresh = vec![Identifier::PASSIVE; n_out];
        for (j, &output) in outputs.iter().enumerate() {
            if !output.is_active() {
                continue;
            }
            let row: SmallVec<[(Identifier, T); 8]> = self
                .inputs
                .iter()
                .enumerate()
                .map(|(i, &input)| (input, self.jacobian[(j, i)]))
                .filter(|(input, partial)| input.is_active() && !partial.is_zero())
                .collect();
            push_row(tape, &mut fresh[j], primals[j], &row)?;
        }
        for (output, new) in outputs.iter_mut().zip(fresh) {
            if output.is_active() {
                tape.free(output);
                *output = new;
            }
        }
        Ok(())
    }

    fn check_unused(&self, outputs: &[Identifier]) -> Result<(), TapeError> {
        let jacobian = self.jacobian.as_ref();
        for (i, &input) in self.inputs.iter().enumerate() {
            if (0..jacobian.nrows()).all(|j| jacobian[(j, i)].is_zero()) {
                return Err(TapeError::UnusedVariable {
                    id: input.raw(),
                    role: "jacobian column",
                });
            }
        }
        for (j, &output) in outputs.iter().enumerate() {
            if (0..jacobian.ncols()).all(|i| jacobian[(j, i)].is_zero()) {
                return Err(TapeError::UnusedVariable {
                    id: output.raw(),
                    role: "jacobian row",
                });
            }
        }
        Ok(())
    }
}

impl<T: Real> Default for PreaccumulationHelper<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Primal of `output` as recorded inside `[start, end)`.
fn output_primal<T: Real, I: IndexManager>(
    tape: &Tape<T, I>,
    output: Identifier,
    start: &Position,
    end: &Position,
) -> T {
    if let Some(value) = tape.primal(output) {
        return value;
    }
    let mut pos = end.statements;
    while pos > start.statements {
        if let Statement::Jacobian { lhs, primal, .. } = *tape.statements.prev(&mut pos) {
            if lhs == output {
                return primal;
            }
        }
    }
    T::zero()
}

/// Store one Jacobian row, chaining statements if it is too long.
fn push_row<T: Real, I: IndexManager>(
    tape: &mut Tape<T, I>,
    lhs: &mut Identifier,
    primal: T,
    row: &[(Identifier, T)],
) -> Result<(), TapeError> {
    let max = tape.config().max_arguments;
    if row.len() <= max {
        return tape.push_jacobian(lhs, primal, row);
    }
    if max < 2 {
        return Err(TapeError::StatementTooLarge {
            arguments: row.len(),
            max,
        });
    }

    let mut carry = Identifier::PASSIVE;
    tape.push_jacobian(&mut carry, T::zero(), &row[..max])?;
    let mut rest = &row[max..];
    loop {
        let take = rest.len().min(max - 1);
        let mut args: SmallVec<[(Identifier, T); 8]> = SmallVec::with_capacity(take + 1);
        args.push((carry, T::one()));
        args.extend_from_slice(&rest[..take]);
        rest = &rest[take..];
        if rest.is_empty() {
            tape.push_jacobian(lhs, primal, &args)?;
            tape.free(&mut carry);
            return Ok(());
        }
        let mut next = Identifier::PASSIVE;
        tape.push_jacobian(&mut next, T::zero(), &args)?;
        tape.free(&mut carry);
        carry = next;
    }
}

/// Zero `scratch` and put a unit derivative on `id`.
fn seed<T: Real, I: IndexManager>(scratch: &mut DerivativeVector<T>, tape: &Tape<T, I>, id: Identifier) {
    scratch.resize_for(tape.indices());
    scratch.as_mut_slice().fill(T::zero());
    AdjointStorage::<T, T>::set(scratch, id, T::one());
}
