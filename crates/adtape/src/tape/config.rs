//! Tape construction parameters.

use std::fmt;
use std::str::FromStr;

/// What a tape stores per statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum TapeKind {
    /// Local partial derivatives are computed at recording time and stored.
    #[default]
    Jacobian,
    /// The operation tag and primal operands are stored; partials are
    /// recomputed from the primal vector on every sweep. Supports primal
    /// re-evaluation.
    PrimalValue,
}

impl TapeKind {
    /// Stable name used by the tape writers.
    pub fn name(self) -> &'static str {
        match self {
            TapeKind::Jacobian => "jacobian",
            TapeKind::PrimalValue => "primal-value",
        }
    }
}

impl fmt::Display for TapeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for TapeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "jacobian" => Ok(TapeKind::Jacobian),
            "primal-value" => Ok(TapeKind::PrimalValue),
            other => Err(format!("unknown tape kind '{other}'")),
        }
    }
}

/// Configuration for a [`Tape`](super::Tape).
///
/// # Example
///
/// ```
/// use adtape::{TapeConfig, TapeKind};
///
/// let config = TapeConfig::default()
///     .with_kind(TapeKind::PrimalValue)
///     .with_chunk_size(1 << 16)
///     .with_memory_limit(Some(64 << 20));
/// assert_eq!(config.kind, TapeKind::PrimalValue);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TapeConfig {
    /// Statement representation.
    pub kind: TapeKind,
    /// Items per segment in every store. Raised to `max_arguments` if smaller.
    pub chunk_size: usize,
    /// Largest number of distinct arguments a single statement may carry.
    pub max_arguments: usize,
    /// Byte ceiling over all segments; `None` for unlimited.
    pub memory_limit: Option<usize>,
    /// Skip the argument loop of a reverse step when the output adjoint is
    /// zero. The output adjoint is cleared either way.
    pub skip_zero_adjoints: bool,
    /// On linear Jacobian tapes, let a copy share the source handle instead
    /// of recording a statement.
    pub copy_optimization: bool,
}

impl TapeConfig {
    /// Default chunk size in items.
    pub const DEFAULT_CHUNK_SIZE: usize = 4096;

    /// Default maximum number of arguments per statement.
    pub const DEFAULT_MAX_ARGUMENTS: usize = 255;

    /// Configuration for a Jacobian tape.
    pub fn jacobian() -> Self {
        Self::default()
    }

    /// Configuration for a primal-value tape.
    pub fn primal_value() -> Self {
        Self::default().with_kind(TapeKind::PrimalValue)
    }

    pub fn with_kind(mut self, kind: TapeKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_max_arguments(mut self, max_arguments: usize) -> Self {
        self.max_arguments = max_arguments;
        self
    }

    pub fn with_memory_limit(mut self, memory_limit: Option<usize>) -> Self {
        self.memory_limit = memory_limit;
        self
    }

    pub fn with_skip_zero_adjoints(mut self, skip: bool) -> Self {
        self.skip_zero_adjoints = skip;
        self
    }

    pub fn with_copy_optimization(mut self, enabled: bool) -> Self {
        self.copy_optimization = enabled;
        self
    }

    /// Clamp inconsistent settings.
    pub(crate) fn normalized(mut self) -> Self {
        self.max_arguments = self.max_arguments.clamp(1, u16::MAX as usize);
        // Operation statements carry at most two operands and values.
        self.chunk_size = self.chunk_size.max(self.max_arguments).max(4);
        self
    }
}

impl Default for TapeConfig {
    fn default() -> Self {
        Self {
            kind: TapeKind::Jacobian,
            chunk_size: Self::DEFAULT_CHUNK_SIZE,
            max_arguments: Self::DEFAULT_MAX_ARGUMENTS,
            memory_limit: None,
            skip_zero_adjoints: true,
            copy_optimization: false,
        }
    }
}
