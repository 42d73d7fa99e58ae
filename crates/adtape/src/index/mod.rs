//! Identifier management for tracked values.
//!
//! Every active value owns an [`Identifier`] naming its slot in the
//! derivative and primal vectors. How identifiers are issued and retired is
//! a policy selected at tape construction:
//!
//! - [`LinearIndexManager`]: a strictly increasing counter. Handles are never
//!   reused, so the identifier space grows with the number of statements.
//! - [`ReuseIndexManager`]: a free-list of retired handles. The identifier
//!   space stays bounded by the live working set.

mod linear;
mod reuse;

pub use linear::LinearIndexManager;
pub use reuse::{ReclaimPolicy, ReuseIndexManager};

use crate::error::TapeError;
use std::fmt;
use std::fmt::Debug;

/// Integer handle naming a tracked value's slot.
///
/// The value `0` is reserved for passive (untracked) values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Identifier(u32);

impl Identifier {
    /// The passive handle. Its derivative is always zero and never written.
    pub const PASSIVE: Identifier = Identifier(0);

    /// Create an identifier from its raw index.
    pub const fn new(index: u32) -> Self {
        Self(index)
    }

    /// Raw index.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Index into derivative/primal vectors.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Check whether this handle refers to a tracked value.
    pub const fn is_active(self) -> bool {
        self.0 != 0
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier issuing policy.
///
/// Implementations own the bookkeeping for which handles are live. The tape
/// calls into the manager for every statement output, input registration
/// and scope exit.
pub trait IndexManager: Debug + Default {
    /// True when handles are issued in recording order and never reused.
    ///
    /// Linear managers tie the identifier counter to tape positions so that
    /// `reset_to` also rewinds the counter.
    const IS_LINEAR: bool;

    /// Assign a handle for the output of a statement.
    ///
    /// Linear managers always issue a new handle. Reuse managers keep an
    /// already active handle and only draw from the pool for passive ones.
    fn assign(&mut self, id: &mut Identifier) -> Result<(), TapeError>;

    /// Assign a handle that is not shared with any other value.
    ///
    /// Used for registered inputs and outputs. Any handle held before is
    /// released first.
    fn assign_unused(&mut self, id: &mut Identifier) -> Result<(), TapeError>;

    /// Release a handle on scope exit and set it to passive.
    fn free(&mut self, id: &mut Identifier);

    /// Largest handle issued so far. Derivative vectors must cover it.
    fn largest_issued(&self) -> u32;

    /// Marker stored in tape positions (the counter for linear managers).
    fn position(&self) -> u32;

    /// Rewind to a marker returned by [`IndexManager::position`].
    fn reset_to(&mut self, position: u32);

    /// Forget all statements; called on a full tape reset.
    fn reset(&mut self);

    /// Make sure `id` is considered issued, e.g. when reading a stored tape.
    fn reserve(&mut self, id: Identifier) -> Result<(), TapeError>;
}
