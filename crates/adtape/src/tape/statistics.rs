use super::TapeKind;
use std::fmt;

/// Sizes of a tape at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeStatistics {
    pub kind: TapeKind,
    pub statements: usize,
    pub arguments: usize,
    pub values: usize,
    pub external_functions: usize,
    /// Allocated segments over all stores, pooled ones included.
    pub segments: usize,
    pub allocated_bytes: usize,
    pub largest_identifier: u32,
    pub inputs: usize,
    pub outputs: usize,
}

impl fmt::Display for TapeStatistics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} tape", self.kind)?;
        writeln!(f, "  statements:         {:>12}", self.statements)?;
        writeln!(f, "  arguments:          {:>12}", self.arguments)?;
        writeln!(f, "  values:             {:>12}", self.values)?;
        writeln!(f, "  external functions: {:>12}", self.external_functions)?;
        writeln!(f, "  segments:           {:>12}", self.segments)?;
        writeln!(f, "  allocated bytes:    {:>12}", self.allocated_bytes)?;
        writeln!(f, "  largest identifier: {:>12}", self.largest_identifier)?;
        write!(f, "  inputs/outputs:     {:>6}/{:<5}", self.inputs, self.outputs)
    }
}
