//! Randomized checks of recorded derivatives against finite differences.

use adtape::{
    Identifier, IndexManager, LinearIndexManager, Operation, ReuseIndexManager, Tape, TapeConfig,
};
use approx::assert_relative_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

const INPUTS: usize = 3;
const STEPS: usize = 24;
const OPS: [Operation; 10] = [
    Operation::Add,
    Operation::Sub,
    Operation::Mul,
    Operation::Div,
    Operation::Sin,
    Operation::Cos,
    Operation::Tanh,
    Operation::Square,
    Operation::MulConst,
    Operation::AddConst,
];

#[derive(Debug, Clone, Copy)]
struct Step {
    op: Operation,
    lhs: usize,
    rhs: usize,
    constant: f64,
}

/// A straight-line program over a growing list of values.
#[derive(Debug)]
struct Program {
    point: Vec<f64>,
    steps: Vec<Step>,
}

impl Program {
    fn random(rng: &mut StdRng) -> Self {
        let point: Vec<f64> = (0..INPUTS).map(|_| rng.sample(StandardNormal)).collect();
        let mut values = point.clone();
        let mut steps = Vec::with_capacity(STEPS);
        while steps.len() < STEPS {
            let op = OPS[rng.random_range(0..OPS.len())];
            let lhs = rng.random_range(0..values.len());
            let rhs = rng.random_range(0..values.len());
            let constant: f64 = rng.random_range(-2.0..2.0);
            // Keep denominators away from zero and magnitudes moderate.
            if op == Operation::Div && values[rhs].abs() < 0.5 {
                continue;
            }
            let step = Step {
                op,
                lhs,
                rhs,
                constant,
            };
            let value = step.apply(&values);
            if !value.is_finite() || value.abs() > 1e3 {
                continue;
            }
            values.push(value);
            steps.push(step);
        }
        Self { point, steps }
    }

    fn evaluate(&self, point: &[f64]) -> f64 {
        let mut values = point.to_vec();
        for step in &self.steps {
            let value = step.apply(&values);
            values.push(value);
        }
        values.last().copied().unwrap_or(0.0)
    }

    fn finite_difference(&self, input: usize) -> f64 {
        let h = 1e-6;
        let mut up = self.point.clone();
        let mut down = self.point.clone();
        up[input] += h;
        down[input] -= h;
        (self.evaluate(&up) - self.evaluate(&down)) / (2.0 * h)
    }

    /// Record the program and return the input handles and the output.
    fn record<I: IndexManager>(&self, tape: &mut Tape<f64, I>) -> (Vec<Identifier>, Identifier) {
        tape.set_active();
        let mut handles: Vec<Identifier> = self
            .point
            .iter()
            .map(|&v| tape.register_input(v).unwrap())
            .collect();
        let inputs = handles.clone();
        let mut values = self.point.clone();
        for step in &self.steps {
            let mut args = vec![(handles[step.lhs], values[step.lhs])];
            if step.op.arity() == 2 {
                args.push((handles[step.rhs], values[step.rhs]));
            }
            let constants: &[f64] = if step.op.constant_count() == 1 {
                std::slice::from_ref(&step.constant)
            } else {
                &[]
            };
            let mut lhs = Identifier::PASSIVE;
            let value = tape
                .store_operation(&mut lhs, step.op, &args, constants)
                .unwrap();
            handles.push(lhs);
            values.push(value);
        }
        let mut output = handles.last().copied().unwrap_or(Identifier::PASSIVE);
        let value = values.last().copied().unwrap_or(0.0);
        tape.register_output(&mut output, value).unwrap();
        tape.set_passive();
        (inputs, output)
    }
}

impl Step {
    fn apply(&self, values: &[f64]) -> f64 {
        let a = values[self.lhs];
        let b = values[self.rhs];
        match self.op {
            Operation::Add => a + b,
            Operation::Sub => a - b,
            Operation::Mul => a * b,
            Operation::Div => a / b,
            Operation::Sin => a.sin(),
            Operation::Cos => a.cos(),
            Operation::Tanh => a.tanh(),
            Operation::Square => a * a,
            Operation::MulConst => a * self.constant,
            Operation::AddConst => a + self.constant,
            _ => unreachable!(),
        }
    }
}

fn check_program<I: IndexManager>(program: &Program, config: TapeConfig) {
    let mut tape: Tape<f64, I> = Tape::new(config);
    let (inputs, output) = program.record(&mut tape);
    if !output.is_active() {
        return;
    }

    tape.set_gradient(output, 1.0);
    tape.evaluate().unwrap();
    let reverse: Vec<f64> = inputs.iter().map(|&x| tape.gradient(x)).collect();

    for (i, &input) in inputs.iter().enumerate() {
        let fd = program.finite_difference(i);
        assert_relative_eq!(reverse[i], fd, epsilon = 1e-4, max_relative = 1e-4);

        tape.clear_adjoints();
        tape.set_gradient(input, 1.0);
        tape.evaluate_forward().unwrap();
        assert_relative_eq!(tape.gradient(output), reverse[i], epsilon = 1e-10, max_relative = 1e-10);
    }
}

#[test]
fn test_random_programs_match_finite_differences() {
    let mut rng = StdRng::seed_from_u64(20240611);
    for _ in 0..25 {
        let program = Program::random(&mut rng);
        check_program::<LinearIndexManager>(&program, TapeConfig::jacobian());
        check_program::<LinearIndexManager>(&program, TapeConfig::primal_value());
        check_program::<ReuseIndexManager>(&program, TapeConfig::jacobian());
        check_program::<ReuseIndexManager>(&program, TapeConfig::primal_value());
    }
}

#[test]
fn test_random_programs_reevaluate_at_new_points() {
    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..10 {
        let program = Program::random(&mut rng);
        let mut tape: Tape<f64, ReuseIndexManager> = Tape::new(TapeConfig::primal_value());
        let (inputs, output) = program.record(&mut tape);
        if !output.is_active() {
            continue;
        }

        // Small moves keep every denominator away from zero.
        let moved: Vec<f64> = program
            .point
            .iter()
            .map(|&v| v + rng.random_range(-1e-3..1e-3))
            .collect();
        for (&id, &v) in inputs.iter().zip(&moved) {
            tape.set_primal(id, v).unwrap();
        }
        tape.evaluate_primal().unwrap();
        let expected = program.evaluate(&moved);
        assert_relative_eq!(tape.primal(output).unwrap(), expected, epsilon = 1e-10, max_relative = 1e-10);
    }
}
