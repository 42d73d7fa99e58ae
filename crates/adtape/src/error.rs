//! Error types for adtape.

use thiserror::Error;

use crate::tape::TapeKind;

/// Errors that can occur while recording, evaluating or persisting a tape.
///
/// Capacity errors leave the tape evaluable up to the last statement that was
/// recorded successfully. Misuse errors reject the call without touching the
/// tape. Use [`TapeError::is_capacity`] to tell the two apart.
#[derive(Debug, Error)]
pub enum TapeError {
    /// The identifier policy ran out of representable handles.
    #[error("identifier overflow: no handle left below {limit}")]
    IdentifierOverflow { limit: u32 },

    /// Opening another segment would exceed the configured memory ceiling.
    #[error("out of tape memory: {requested} bytes requested, limit is {limit} bytes")]
    OutOfTapeMemory { requested: usize, limit: usize },

    /// A single statement carries more arguments than the tape accepts.
    #[error("statement too large: {arguments} arguments, at most {max} allowed")]
    StatementTooLarge { arguments: usize, max: usize },

    /// Evaluation was requested while the tape is still recording.
    #[error("cannot evaluate while the tape is recording")]
    EvaluateWhileRecording,

    /// The handle was already registered as an input or output.
    #[error("identifier {id} is already registered")]
    AlreadyRegistered { id: u32 },

    /// The position range is inverted for the requested traversal.
    #[error("invalid position range: {message}")]
    InvalidRange { message: String },

    /// `reset_to` was called with a position recorded after the current one.
    #[error("position lies after the current tape position")]
    PositionAfterCurrent,

    /// A manual statement received a different number of arguments than announced.
    #[error("manual statement expected {expected} arguments, got {actual}")]
    ArgumentCountMismatch { expected: usize, actual: usize },

    /// The operation is not available for this tape kind.
    #[error("{operation} is not supported on a {kind} tape")]
    Unsupported {
        operation: &'static str,
        kind: TapeKind,
    },

    /// `finish` was called on a preaccumulation helper that was never started.
    #[error("preaccumulation region was not started")]
    PreaccumulationNotStarted,

    /// A preaccumulation input or output has no dependency inside the region.
    #[error("identifier {id} has an all-zero {role} in the preaccumulated region")]
    UnusedVariable { id: u32, role: &'static str },

    /// I/O failure from the underlying transport.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed persisted tape.
    #[error("format error at line {line}: {message}")]
    Format { line: usize, message: String },

    /// Persisted tape kind differs from the requested one.
    #[error("tape kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },
}

impl TapeError {
    /// Returns true for recoverable capacity conditions.
    ///
    /// Recording aborts on these, but every statement recorded before the
    /// failure stays on the tape and can still be evaluated.
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            TapeError::IdentifierOverflow { .. }
                | TapeError::OutOfTapeMemory { .. }
                | TapeError::StatementTooLarge { .. }
        )
    }

    pub(crate) fn format(line: usize, message: impl Into<String>) -> Self {
        TapeError::Format {
            line,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_classification() {
        assert!(TapeError::IdentifierOverflow { limit: 10 }.is_capacity());
        assert!(
            TapeError::OutOfTapeMemory {
                requested: 64,
                limit: 32
            }
            .is_capacity()
        );
        assert!(
            TapeError::StatementTooLarge {
                arguments: 300,
                max: 255
            }
            .is_capacity()
        );
        assert!(!TapeError::EvaluateWhileRecording.is_capacity());
        assert!(!TapeError::PositionAfterCurrent.is_capacity());
    }

    #[test]
    fn test_messages() {
        let err = TapeError::StatementTooLarge {
            arguments: 300,
            max: 255,
        };
        assert_eq!(
            err.to_string(),
            "statement too large: 300 arguments, at most 255 allowed"
        );

        let err = TapeError::format(3, "bad record");
        assert_eq!(err.to_string(), "format error at line 3: bad record");
    }
}
