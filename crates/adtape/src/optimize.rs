//! Identifier relabeling for evaluation locality.
//!
//! A linear tape issues handles in recording order, including handles that
//! were released again or never reached a statement. After recording,
//! [`optimize_identifiers`] renumbers every handle densely in first-use
//! order, so the derivative and primal vectors shrink and a reverse sweep
//! walks them front to back with few gaps.

use crate::error::TapeError;
use crate::index::{Identifier, IndexManager, LinearIndexManager};
use crate::real::Real;
use crate::tape::Tape;
use log::debug;
use std::collections::{HashMap, HashSet};

/// Mapping from old to new handles produced by [`optimize_identifiers`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Relabeling {
    /// `map[old] = new`; dead handles map to `0`.
    map: Vec<u32>,
    issued: u32,
}

impl Relabeling {
    /// New handle for `id`. Passive and dead handles map to passive.
    pub fn apply(&self, id: Identifier) -> Identifier {
        Identifier::new(self.map.get(id.index()).copied().unwrap_or(0))
    }

    /// Number of live handles after relabeling.
    pub fn len(&self) -> usize {
        self.issued as usize
    }

    pub fn is_empty(&self) -> bool {
        self.issued == 0
    }

    fn label(&mut self, id: Identifier) {
        if !id.is_active() {
            return;
        }
        if self.map.len() <= id.index() {
            self.map.resize(id.index() + 1, 0);
        }
        if self.map[id.index()] == 0 {
            self.issued += 1;
            self.map[id.index()] = self.issued;
        }
    }
}

/// Renumber every handle of a linear tape in first-use order.
///
/// Handles from `inputs` are labelled first, in the order produced, then
/// each argument and output handle in recording order, then any remaining
/// handle from `outputs`. Statements, registration lists and primal values
/// are rewritten in place; the derivative vector is zeroed. Evaluation
/// results are unchanged under the returned map.
///
/// Positions captured before the call are invalid afterwards.
///
/// # Arguments
/// * `tape` - Idle linear tape without external functions
/// * `inputs` - Handles to place first, e.g. `tape.inputs().to_vec()`
/// * `outputs` - Handles that must stay live after relabeling
///
/// # Errors
/// Returns [`TapeError::EvaluateWhileRecording`] on a recording tape and
/// [`TapeError::Unsupported`] when external functions are recorded, since
/// their user data holds handles the optimizer cannot rewrite.
///
/// # Example
///
/// ```
/// use adtape::{optimize_identifiers, Identifier, Operation, Tape, TapeConfig};
///
/// let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
/// tape.set_active();
/// let mut unused = tape.register_input(0.0).unwrap();
/// let x = tape.register_input(2.0).unwrap();
/// let mut y = Identifier::PASSIVE;
/// tape.store_operation(&mut y, Operation::Exp, &[(x, 2.0)], &[]).unwrap();
/// tape.free(&mut unused);
/// tape.set_passive();
///
/// let map = optimize_identifiers(&mut tape, [x], [y]).unwrap();
/// assert_eq!(map.apply(x), Identifier::new(1));
/// assert_eq!(map.apply(y), Identifier::new(2));
///
/// tape.set_gradient(map.apply(y), 1.0);
/// tape.evaluate().unwrap();
/// assert!((tape.gradient(map.apply(x)) - 2.0f64.exp()).abs() < 1e-12);
/// ```
pub fn optimize_identifiers<T: Real>(
    tape: &mut Tape<T, LinearIndexManager>,
    inputs: impl IntoIterator<Item = Identifier>,
    outputs: impl IntoIterator<Item = Identifier>,
) -> Result<Relabeling, TapeError> {
    if tape.is_recording() {
        return Err(TapeError::EvaluateWhileRecording);
    }
    if !tape.externals.is_empty() {
        return Err(TapeError::Unsupported {
            operation: "optimize_identifiers with external functions",
            kind: tape.kind(),
        });
    }

    let mut relabeling = Relabeling {
        map: Vec::new(),
        issued: 0,
    };
    for id in inputs {
        relabeling.label(id);
    }
    tape.visit_forward(|view| {
        for &id in view.arguments {
            relabeling.label(id);
        }
        if let Some(lhs) = view.statement.lhs() {
            relabeling.label(lhs);
        }
    });
    for id in outputs {
        relabeling.label(id);
    }
    let largest = tape.indices.largest_issued();

    for statement in tape.statements.iter_mut() {
        if let Some(lhs) = statement.lhs() {
            statement.set_lhs(relabeling.apply(lhs));
        }
    }
    for id in tape.arguments.iter_mut() {
        *id = relabeling.apply(*id);
    }

    let relabel_list = |ids: &mut Vec<Identifier>| {
        for id in ids.iter_mut() {
            *id = relabeling.apply(*id);
        }
    };
    relabel_list(&mut tape.inputs);
    relabel_list(&mut tape.outputs);
    tape.registered_outputs = tape
        .registered_outputs
        .iter()
        .map(|&id| relabeling.apply(id))
        .collect::<HashSet<_>>();
    tape.input_statements = tape
        .input_statements
        .iter()
        .map(|(&id, &at)| (relabeling.apply(id), at))
        .collect::<HashMap<_, _>>();

    if !tape.primals.is_empty() {
        let mut primals = vec![T::zero(); relabeling.len() + 1];
        for (old, &new) in relabeling.map.iter().enumerate() {
            if new != 0 {
                if let Some(&value) = tape.primals.get(old) {
                    primals[new as usize] = value;
                }
            }
        }
        tape.primals = primals;
    }
    tape.clear_adjoints();
    tape.indices.reset_to(relabeling.issued);

    debug!(
        "relabelled {} live handles out of {largest} issued",
        relabeling.issued
    );
    Ok(relabeling)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::tape::TapeConfig;
    use approx::assert_relative_eq;

    fn record(tape: &mut Tape<f64>) -> (Identifier, Identifier, Identifier) {
        tape.set_active();
        let a = tape.register_input(1.5).unwrap();
        let b = tape.register_input(0.5).unwrap();
        let mut t = Identifier::PASSIVE;
        let vt = tape
            .store_operation(&mut t, Operation::Mul, &[(a, 1.5), (b, 0.5)], &[])
            .unwrap();
        // Never used again.
        let mut dead = Identifier::PASSIVE;
        tape.store_operation(&mut dead, Operation::Exp, &[(a, 1.5)], &[])
            .unwrap();
        let mut y = Identifier::PASSIVE;
        let vy = tape
            .store_operation(&mut y, Operation::Sin, &[(t, vt)], &[])
            .unwrap();
        tape.register_output(&mut y, vy).unwrap();
        tape.set_passive();
        (a, b, y)
    }

    #[test]
    fn test_inputs_first() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let (a, b, y) = record(&mut tape);
        // Reverse the input order on purpose.
        let map = optimize_identifiers(&mut tape, [b, a], [y]).unwrap();
        assert_eq!(map.apply(b), Identifier::new(1));
        assert_eq!(map.apply(a), Identifier::new(2));
        assert_eq!(tape.inputs(), &[map.apply(a), map.apply(b)]);
        assert_eq!(tape.outputs(), &[map.apply(y)]);
        assert_eq!(tape.indices().largest_issued() as usize, map.len());
    }

    #[test]
    fn test_gradients_unchanged() {
        let mut reference: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let (a, b, y) = record(&mut reference);
        reference.set_gradient(y, 1.0);
        reference.evaluate().unwrap();

        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        let (a2, b2, y2) = record(&mut tape);
        let inputs = tape.inputs().to_vec();
        let map = optimize_identifiers(&mut tape, inputs, [y2]).unwrap();
        tape.set_gradient(map.apply(y2), 1.0);
        tape.evaluate().unwrap();

        assert_relative_eq!(tape.gradient(map.apply(a2)), reference.gradient(a));
        assert_relative_eq!(tape.gradient(map.apply(b2)), reference.gradient(b));
    }

    #[test]
    fn test_primal_values_follow_handles() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::primal_value());
        tape.set_active();
        let mut skipped = tape.register_input(9.0).unwrap();
        let x = tape.register_input(3.0).unwrap();
        let mut y = Identifier::PASSIVE;
        tape.store_operation(&mut y, Operation::Square, &[(x, 3.0)], &[])
            .unwrap();
        tape.free(&mut skipped);
        tape.set_passive();

        let map = optimize_identifiers(&mut tape, [x], [y]).unwrap();
        assert_eq!(tape.primal(map.apply(x)), Some(3.0));
        assert_eq!(tape.primal(map.apply(y)), Some(9.0));

        tape.set_primal(map.apply(x), 4.0).unwrap();
        tape.evaluate_primal().unwrap();
        assert_eq!(tape.primal(map.apply(y)), Some(16.0));
    }

    #[test]
    fn test_rejects_recording_tape() {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        tape.set_active();
        let err = optimize_identifiers(&mut tape, [Identifier::PASSIVE; 0], [Identifier::PASSIVE; 0]).unwrap_err();
        assert!(matches!(err, TapeError::EvaluateWhileRecording));
    }
}
