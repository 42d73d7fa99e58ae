//! Linear identifier policy: one new handle per statement, never reused.

use super::{Identifier, IndexManager};
use crate::error::TapeError;
use log::trace;

/// Issues handles from a strictly increasing counter.
///
/// The handle space equals the number of statements ever produced, which
/// keeps the tape free of output handles (they are implied by the order of
/// statements) at the cost of an adjoint vector that grows with the tape.
#[derive(Debug, Clone)]
pub struct LinearIndexManager {
    /// Last handle issued; `0` when nothing was issued.
    count: u32,
    /// Largest handle this manager may issue.
    limit: u32,
}

impl LinearIndexManager {
    /// Create a manager that may issue handles up to `u32::MAX`.
    pub fn new() -> Self {
        Self::with_limit(u32::MAX)
    }

    /// Create a manager that refuses to issue handles above `limit`.
    pub fn with_limit(limit: u32) -> Self {
        Self { count: 0, limit }
    }

    fn next(&mut self) -> Result<Identifier, TapeError> {
        if self.count >= self.limit {
            return Err(TapeError::IdentifierOverflow { limit: self.limit });
        }
        self.count += 1;
        Ok(Identifier::new(self.count))
    }
}

impl Default for LinearIndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager for LinearIndexManager {
    const IS_LINEAR: bool = true;

    fn assign(&mut self, id: &mut Identifier) -> Result<(), TapeError> {
        *id = self.next()?;
        Ok(())
    }

    fn assign_unused(&mut self, id: &mut Identifier) -> Result<(), TapeError> {
        *id = self.next()?;
        Ok(())
    }

    fn free(&mut self, id: &mut Identifier) {
        *id = Identifier::PASSIVE;
    }

    fn largest_issued(&self) -> u32 {
        self.count
    }

    fn position(&self) -> u32 {
        self.count
    }

    fn reset_to(&mut self, position: u32) {
        trace!("linear index counter rewound from {} to {}", self.count, position);
        self.count = position;
    }

    fn reset(&mut self) {
        self.count = 0;
    }

    fn reserve(&mut self, id: Identifier) -> Result<(), TapeError> {
        if id.raw() > self.limit {
            return Err(TapeError::IdentifierOverflow { limit: self.limit });
        }
        self.count = self.count.max(id.raw());
        Ok(())
    }
}
