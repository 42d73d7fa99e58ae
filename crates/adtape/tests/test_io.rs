//! Integration tests for tape persistence and identifier relabeling.

use adtape::io::{LoadedTape, TapeReader, TapeWriter, TextReader, TextWriter};
use adtape::{
    Identifier, IndexManager, LinearIndexManager, Operation, PreaccumulationHelper,
    ReuseIndexManager, Tape, TapeConfig, TapeError, optimize_identifiers,
};
use approx::assert_relative_eq;

/// f(x, y) = tanh(x * y) - sqrt(y) / x
fn record<I: IndexManager>(config: TapeConfig, x0: f64, y0: f64) -> (Tape<f64, I>, Identifier) {
    let mut tape: Tape<f64, I> = Tape::new(config);
    tape.set_active();
    let x = tape.register_input(x0).unwrap();
    let y = tape.register_input(y0).unwrap();
    let mut xy = Identifier::PASSIVE;
    let vxy = tape
        .store_operation(&mut xy, Operation::Mul, &[(x, x0), (y, y0)], &[])
        .unwrap();
    let mut t = Identifier::PASSIVE;
    let vt = tape
        .store_operation(&mut t, Operation::Tanh, &[(xy, vxy)], &[])
        .unwrap();
    tape.free(&mut xy);
    let mut s = Identifier::PASSIVE;
    let vs = tape
        .store_operation(&mut s, Operation::Sqrt, &[(y, y0)], &[])
        .unwrap();
    let mut q = Identifier::PASSIVE;
    let vq = tape
        .store_operation(&mut q, Operation::Div, &[(s, vs), (x, x0)], &[])
        .unwrap();
    tape.free(&mut s);
    let mut f = Identifier::PASSIVE;
    let vf = tape
        .store_operation(&mut f, Operation::Sub, &[(t, vt), (q, vq)], &[])
        .unwrap();
    tape.register_output(&mut f, vf).unwrap();
    tape.set_passive();
    (tape, f)
}

fn f_gradient(x: f64, y: f64) -> (f64, f64) {
    let sech2 = 1.0 - (x * y).tanh().powi(2);
    (y * sech2 + y.sqrt() / (x * x), x * sech2 - 0.5 / (y.sqrt() * x))
}

fn round_trip<I: IndexManager>(tape: &Tape<f64, I>, config: TapeConfig) -> LoadedTape<f64, I> {
    let mut buffer = Vec::new();
    TextWriter::new(&mut buffer).write(tape).unwrap();
    TextReader::new(buffer.as_slice()).read::<f64, I>(config).unwrap()
}

fn check_loaded<I: IndexManager>(loaded: &mut LoadedTape<f64, I>, x0: f64, y0: f64) {
    assert_eq!(loaded.inputs.len(), 2);
    assert_eq!(loaded.outputs.len(), 1);
    loaded.tape.set_gradient(loaded.outputs[0], 1.0);
    loaded.tape.evaluate().unwrap();
    let (gx, gy) = f_gradient(x0, y0);
    assert_relative_eq!(loaded.tape.gradient(loaded.inputs[0]), gx, epsilon = 1e-12);
    assert_relative_eq!(loaded.tape.gradient(loaded.inputs[1]), gy, epsilon = 1e-12);
}

#[test]
fn test_round_trip_every_kind() {
    let (x0, y0) = (0.6, 2.5);
    for config in [TapeConfig::jacobian(), TapeConfig::primal_value()] {
        let (tape, _) = record::<LinearIndexManager>(config, x0, y0);
        let mut loaded = round_trip(&tape, config);
        assert_eq!(loaded.tape.size(), tape.size());
        check_loaded(&mut loaded, x0, y0);

        let (tape, _) = record::<ReuseIndexManager>(config, x0, y0);
        let mut loaded = round_trip(&tape, config);
        assert_eq!(loaded.inputs, tape.inputs());
        check_loaded(&mut loaded, x0, y0);
    }
}

#[test]
fn test_loaded_primal_tape_reevaluates() {
    let (tape, _) = record::<ReuseIndexManager>(TapeConfig::primal_value(), 0.6, 2.5);
    let mut loaded = round_trip(&tape, TapeConfig::primal_value());

    let (x1, y1) = (1.4, 0.3);
    loaded.tape.set_primal(loaded.inputs[0], x1).unwrap();
    loaded.tape.set_primal(loaded.inputs[1], y1).unwrap();
    loaded.tape.evaluate_primal().unwrap();
    let expected = (x1 * y1).tanh() - y1.sqrt() / x1;
    assert_relative_eq!(loaded.tape.primal(loaded.outputs[0]).unwrap(), expected, epsilon = 1e-12);
    check_loaded(&mut loaded, x1, y1);
}

#[test]
fn test_written_text_is_stable() {
    let (tape, _) = record::<LinearIndexManager>(TapeConfig::jacobian(), 0.6, 2.5);
    let mut first = Vec::new();
    TextWriter::new(&mut first).write(&tape).unwrap();
    let loaded = round_trip(&tape, TapeConfig::jacobian());
    let mut second = Vec::new();
    TextWriter::new(&mut second).write(&loaded.tape).unwrap();
    assert_eq!(String::from_utf8(first).unwrap(), String::from_utf8(second).unwrap());
}

#[test]
fn test_reader_rejects_other_kind() {
    let (tape, _) = record::<LinearIndexManager>(TapeConfig::primal_value(), 0.6, 2.5);
    let mut buffer = Vec::new();
    TextWriter::new(&mut buffer).write(&tape).unwrap();
    let err = TextReader::new(buffer.as_slice())
        .read::<f64, LinearIndexManager>(TapeConfig::jacobian())
        .unwrap_err();
    assert!(matches!(err, TapeError::KindMismatch { .. }));
}

#[test]
fn test_preaccumulated_primal_tape_round_trip() {
    let (x0, y0) = (0.6, 2.5);
    let mut tape: Tape<f64> = Tape::new(TapeConfig::primal_value());
    tape.set_active();
    let x = tape.register_input(x0).unwrap();
    let y = tape.register_input(y0).unwrap();
    let mut helper = PreaccumulationHelper::new();
    helper.start(&tape, &[x, y]);
    let mut p = Identifier::PASSIVE;
    let vp = tape
        .store_operation(&mut p, Operation::Mul, &[(x, x0), (y, y0)], &[])
        .unwrap();
    let mut outputs = [p];
    helper.finish(&mut tape, &mut outputs).unwrap();
    let [mut p] = outputs;
    tape.register_output(&mut p, vp).unwrap();
    tape.set_passive();

    let mut loaded = round_trip(&tape, TapeConfig::primal_value());
    loaded.tape.set_gradient(loaded.outputs[0], 1.0);
    loaded.tape.evaluate().unwrap();
    assert_relative_eq!(loaded.tape.gradient(loaded.inputs[0]), y0);
    assert_relative_eq!(loaded.tape.gradient(loaded.inputs[1]), x0);
}

#[test]
fn test_optimized_tape_round_trip() {
    let (x0, y0) = (0.6, 2.5);
    let (mut tape, f) = record::<LinearIndexManager>(TapeConfig::primal_value(), x0, y0);
    let inputs = tape.inputs().to_vec();
    let before = tape.indices().largest_issued();
    let relabeling = optimize_identifiers(&mut tape, inputs, [f]).unwrap();
    assert!(relabeling.len() as u32 <= before);
    assert_eq!(tape.outputs(), &[relabeling.apply(f)]);

    let mut loaded = round_trip(&tape, TapeConfig::primal_value());
    assert_eq!(loaded.inputs, vec![Identifier::new(1), Identifier::new(2)]);
    check_loaded(&mut loaded, x0, y0);
}

#[cfg(feature = "graphviz")]
#[test]
fn test_graph_writer_names_every_statement() {
    use adtape::io::GraphWriter;

    let (tape, _) = record::<LinearIndexManager>(TapeConfig::primal_value(), 0.6, 2.5);
    let mut buffer = Vec::new();
    GraphWriter::new(&mut buffer).write(&tape).unwrap();
    let dot = String::from_utf8(buffer).unwrap();
    assert!(dot.starts_with("digraph"));
    for name in ["mul", "tanh", "sqrt", "div", "sub"] {
        assert!(dot.contains(name), "missing {name} in {dot}");
    }
    assert!(dot.contains("(output)"));
}
