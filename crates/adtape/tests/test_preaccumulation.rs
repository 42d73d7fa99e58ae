//! Integration tests for preaccumulation.

use adtape::{
    Identifier, IndexManager, LinearIndexManager, Operation, PreaccumulationConfig,
    PreaccumulationHelper, ReuseIndexManager, Tape, TapeConfig,
};
use approx::assert_relative_eq;

const X: [f64; 3] = [0.4, 1.7, -0.9];

fn apply<I: IndexManager>(
    tape: &mut Tape<f64, I>,
    op: Operation,
    args: &[(Identifier, f64)],
) -> (Identifier, f64) {
    let mut lhs = Identifier::PASSIVE;
    let value = tape.store_operation(&mut lhs, op, args, &[]).unwrap();
    (lhs, value)
}

/// u = exp(x0) * x1 + sin(x2), v = x0 * x1 * x2, then z = u / v + u.
///
/// With `compress` the region computing `u` and `v` is preaccumulated.
fn gradient<I: IndexManager>(config: TapeConfig, compress: bool) -> (Vec<f64>, usize) {
    let mut tape: Tape<f64, I> = Tape::new(config);
    tape.set_active();
    let xs: Vec<Identifier> = X.iter().map(|&v| tape.register_input(v).unwrap()).collect();

    let mut helper = PreaccumulationHelper::new();
    if compress {
        helper.start(&tape, &xs);
    }
    let (e, ve) = apply(&mut tape, Operation::Exp, &[(xs[0], X[0])]);
    let (ex, vex) = apply(&mut tape, Operation::Mul, &[(e, ve), (xs[1], X[1])]);
    let (s, vs) = apply(&mut tape, Operation::Sin, &[(xs[2], X[2])]);
    let (u, vu) = apply(&mut tape, Operation::Add, &[(ex, vex), (s, vs)]);
    let (p, vp) = apply(&mut tape, Operation::Mul, &[(xs[0], X[0]), (xs[1], X[1])]);
    let (v, vv) = apply(&mut tape, Operation::Mul, &[(p, vp), (xs[2], X[2])]);

    let mut region = [u, v];
    if compress {
        helper.finish(&mut tape, &mut region).unwrap();
        assert!(tape.is_recording());
    }
    let [u, v] = region;
    let (q, vq) = apply(&mut tape, Operation::Div, &[(u, vu), (v, vv)]);
    let (mut z, vz) = apply(&mut tape, Operation::Add, &[(q, vq), (u, vu)]);
    tape.register_output(&mut z, vz).unwrap();
    tape.set_passive();

    let size = tape.size();
    tape.set_gradient(z, 1.0);
    tape.evaluate().unwrap();
    (xs.iter().map(|&x| tape.gradient(x)).collect(), size)
}

fn check_equivalence<I: IndexManager>(config: TapeConfig) {
    let (plain, plain_size) = gradient::<I>(config, false);
    let (compressed, compressed_size) = gradient::<I>(config, true);
    assert!(compressed_size < plain_size);
    for (a, b) in plain.iter().zip(&compressed) {
        assert_relative_eq!(*a, *b, epsilon = 1e-12, max_relative = 1e-12);
    }
}

#[test]
fn test_equivalence_linear_jacobian() {
    check_equivalence::<LinearIndexManager>(TapeConfig::jacobian());
}

#[test]
fn test_equivalence_linear_primal() {
    check_equivalence::<LinearIndexManager>(TapeConfig::primal_value());
}

#[test]
fn test_equivalence_reuse_jacobian() {
    check_equivalence::<ReuseIndexManager>(TapeConfig::jacobian());
}

#[test]
fn test_equivalence_reuse_primal() {
    check_equivalence::<ReuseIndexManager>(TapeConfig::primal_value());
}

#[test]
fn test_forward_and_reverse_compression_agree() {
    let record = |prefer_reverse: bool| {
        let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
        tape.set_active();
        let a = tape.register_input(1.3).unwrap();
        let b = tape.register_input(0.2).unwrap();
        let mut helper = PreaccumulationHelper::with_config(PreaccumulationConfig {
            prefer_reverse,
            ..PreaccumulationConfig::default()
        });
        helper.start(&tape, &[a, b]);
        let (sa, vsa) = apply(&mut tape, Operation::Square, &[(a, 1.3)]);
        let (sb, vsb) = apply(&mut tape, Operation::Square, &[(b, 0.2)]);
        let (h, vh) = apply(&mut tape, Operation::Add, &[(sa, vsa), (sb, vsb)]);
        let (t, _) = apply(&mut tape, Operation::Atan2, &[(b, 0.2), (a, 1.3)]);
        let (r, _) = apply(&mut tape, Operation::Ln, &[(h, vh)]);
        let mut outputs = [r, t];
        helper.finish(&mut tape, &mut outputs).unwrap();
        helper.jacobian().to_owned()
    };
    let reverse = record(true);
    let forward = record(false);
    assert_eq!((reverse.nrows(), reverse.ncols()), (2, 2));
    for j in 0..2 {
        for i in 0..2 {
            assert_relative_eq!(reverse[(j, i)], forward[(j, i)], epsilon = 1e-12);
        }
    }
    // d ln(a^2 + b^2) / da = 2 a / (a^2 + b^2)
    let r2 = 1.3f64 * 1.3 + 0.2 * 0.2;
    assert_relative_eq!(reverse[(0, 0)], 2.6 / r2, epsilon = 1e-12);
    assert_relative_eq!(reverse[(1, 0)], -0.2 / r2, epsilon = 1e-12);
}

#[test]
fn test_added_input_after_start() {
    let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
    tape.set_active();
    let a = tape.register_input(3.0).unwrap();
    let b = tape.register_input(4.0).unwrap();
    let mut helper = PreaccumulationHelper::new();
    helper.start(&tape, &[a]);
    helper.add_input(b);
    let (p, _) = apply(&mut tape, Operation::Mul, &[(a, 3.0), (b, 4.0)]);
    let mut outputs = [p];
    helper.finish(&mut tape, &mut outputs).unwrap();
    tape.set_passive();

    tape.set_gradient(outputs[0], 1.0);
    tape.evaluate().unwrap();
    assert_eq!(tape.gradient(a), 4.0);
    assert_eq!(tape.gradient(b), 3.0);
}
