//! Elementary operations recorded on primal-value tapes.
//!
//! Each [`Operation`] is a uniform tag: given the argument primal values and
//! the operation constants it can recompute the output ([`Operation::primal`])
//! and the local partial derivatives ([`Operation::partials`]). Jacobian tapes
//! use the same kernels once, at recording time; primal-value tapes keep the
//! tag and call them again during every sweep.

use crate::real::Real;
use std::fmt;
use std::str::FromStr;

/// Elementary operation tag.
///
/// Arguments are the tracked (or passive) operands; constants are plain
/// values baked into the statement, such as the `c` in `x + c`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `a`
    Copy,
    /// `a + b`
    Add,
    /// `a - b`
    Sub,
    /// `a * b`
    Mul,
    /// `a / b`
    Div,
    /// `-a`
    Neg,
    /// `a + c`
    AddConst,
    /// `a * c`
    MulConst,
    /// `c - a`
    ConstSub,
    /// `c / a`
    ConstDiv,
    /// `a * a`
    Square,
    Sqrt,
    Exp,
    Ln,
    Sin,
    Cos,
    Tan,
    Tanh,
    Abs,
    /// `a ^ b`
    Pow,
    /// `a ^ c`
    PowConst,
    /// `atan2(a, b)`
    Atan2,
}

impl Operation {
    const ALL: [Operation; 22] = [
        Operation::Copy,
        Operation::Add,
        Operation::Sub,
        Operation::Mul,
        Operation::Div,
        Operation::Neg,
        Operation::AddConst,
        Operation::MulConst,
        Operation::ConstSub,
        Operation::ConstDiv,
        Operation::Square,
        Operation::Sqrt,
        Operation::Exp,
        Operation::Ln,
        Operation::Sin,
        Operation::Cos,
        Operation::Tan,
        Operation::Tanh,
        Operation::Abs,
        Operation::Pow,
        Operation::PowConst,
        Operation::Atan2,
    ];

    /// Number of operands.
    pub fn arity(self) -> usize {
        match self {
            Operation::Add
            | Operation::Sub
            | Operation::Mul
            | Operation::Div
            | Operation::Pow
            | Operation::Atan2 => 2,
            _ => 1,
        }
    }

    /// Number of constants stored with the statement.
    pub fn constant_count(self) -> usize {
        match self {
            Operation::AddConst
            | Operation::MulConst
            | Operation::ConstSub
            | Operation::ConstDiv
            | Operation::PowConst => 1,
            _ => 0,
        }
    }

    /// Stable lower-case name used by the tape writers.
    pub fn name(self) -> &'static str {
        match self {
            Operation::Copy => "copy",
            Operation::Add => "add",
            Operation::Sub => "sub",
            Operation::Mul => "mul",
            Operation::Div => "div",
            Operation::Neg => "neg",
            Operation::AddConst => "add_const",
            Operation::MulConst => "mul_const",
            Operation::ConstSub => "const_sub",
            Operation::ConstDiv => "const_div",
            Operation::Square => "square",
            Operation::Sqrt => "sqrt",
            Operation::Exp => "exp",
            Operation::Ln => "ln",
            Operation::Sin => "sin",
            Operation::Cos => "cos",
            Operation::Tan => "tan",
            Operation::Tanh => "tanh",
            Operation::Abs => "abs",
            Operation::Pow => "pow",
            Operation::PowConst => "pow_const",
            Operation::Atan2 => "atan2",
        }
    }

    /// Output value for the given operands and constants.
    pub fn primal<T: Real>(self, args: &[T], constants: &[T]) -> T {
        let a = args[0];
        match self {
            Operation::Copy => a,
            Operation::Add => a + args[1],
            Operation::Sub => a - args[1],
            Operation::Mul => a * args[1],
            Operation::Div => a / args[1],
            Operation::Neg => -a,
            Operation::AddConst => a + constants[0],
            Operation::MulConst => a * constants[0],
            Operation::ConstSub => constants[0] - a,
            Operation::ConstDiv => constants[0] / a,
            Operation::Square => a * a,
            Operation::Sqrt => a.sqrt(),
            Operation::Exp => a.exp(),
            Operation::Ln => a.ln(),
            Operation::Sin => a.sin(),
            Operation::Cos => a.cos(),
            Operation::Tan => a.tan(),
            Operation::Tanh => a.tanh(),
            Operation::Abs => a.abs(),
            Operation::Pow => a.powf(args[1]),
            Operation::PowConst => a.powf(constants[0]),
            Operation::Atan2 => a.atan2(args[1]),
        }
    }

    /// Local partial derivatives, one per operand, written into `out`.
    pub fn partials<T: Real>(self, args: &[T], constants: &[T], out: &mut [T]) {
        let a = args[0];
        let one = T::one();
        let two = one + one;
        match self {
            Operation::Copy | Operation::AddConst => out[0] = one,
            Operation::Add => {
                out[0] = one;
                out[1] = one;
            }
            Operation::Sub => {
                out[0] = one;
                out[1] = -one;
            }
            Operation::Mul => {
                out[0] = args[1];
                out[1] = a;
            }
            Operation::Div => {
                let b = args[1];
                out[0] = one / b;
                out[1] = -a / (b * b);
            }
            Operation::Neg | Operation::ConstSub => out[0] = -one,
            Operation::MulConst => out[0] = constants[0],
            Operation::ConstDiv => out[0] = -constants[0] / (a * a),
            Operation::Square => out[0] = two * a,
            Operation::Sqrt => out[0] = one / (two * a.sqrt()),
            Operation::Exp => out[0] = a.exp(),
            Operation::Ln => out[0] = one / a,
            Operation::Sin => out[0] = a.cos(),
            Operation::Cos => out[0] = -a.sin(),
            Operation::Tan => {
                let c = a.cos();
                out[0] = one / (c * c);
            }
            Operation::Tanh => {
                let t = a.tanh();
                out[0] = one - t * t;
            }
            Operation::Abs => {
                out[0] = if a < T::zero() { -one } else { one };
            }
            Operation::Pow => {
                let b = args[1];
                let value = a.powf(b);
                out[0] = b * a.powf(b - one);
                // d/db a^b = a^b ln a; defined as zero where ln a is not.
                out[1] = if a > T::zero() { value * a.ln() } else { T::zero() };
            }
            Operation::PowConst => {
                let c = constants[0];
                out[0] = c * a.powf(c - one);
            }
            Operation::Atan2 => {
                let b = args[1];
                let denom = a * a + b * b;
                out[0] = b / denom;
                out[1] = -a / denom;
            }
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Operation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Operation::ALL
            .iter()
            .copied()
            .find(|op| op.name() == s)
            .ok_or_else(|| format!("unknown operation '{s}'"))
    }
}
