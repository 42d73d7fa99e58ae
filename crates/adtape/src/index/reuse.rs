//! Reuse identifier policy: retired handles return to a free-list.

use super::{Identifier, IndexManager};
use crate::error::TapeError;
use log::trace;

/// When a freed handle becomes available to new values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReclaimPolicy {
    /// Freed handles go straight back to the pool.
    ///
    /// Statements recorded before the free may still name the handle. The
    /// reverse sweep zeroes each output derivative after reading it, so the
    /// slot is clean again before an older statement names it.
    #[default]
    Eager,
    /// Freed handles are parked until the next full tape reset, so no handle
    /// named by a recorded statement is ever handed to another value.
    Deferred,
}

/// Issues handles from a free-list, bounded by the live working set.
#[derive(Debug, Clone)]
pub struct ReuseIndexManager {
    /// Handles ready to be issued again.
    pool: Vec<u32>,
    /// Handles freed under [`ReclaimPolicy::Deferred`], released on reset.
    parked: Vec<u32>,
    /// Largest handle issued so far.
    largest: u32,
    /// Largest handle this manager may issue.
    limit: u32,
    /// Number of handles currently held by values.
    live: usize,
    policy: ReclaimPolicy,
}

impl ReuseIndexManager {
    /// Create a manager with eager reclamation.
    pub fn new() -> Self {
        Self::with_policy(ReclaimPolicy::Eager)
    }

    /// Create a manager with the given reclamation policy.
    pub fn with_policy(policy: ReclaimPolicy) -> Self {
        Self {
            pool: Vec::new(),
            parked: Vec::new(),
            largest: 0,
            limit: u32::MAX,
            live: 0,
            policy,
        }
    }

    /// Refuse to issue handles above `limit`.
    pub fn with_limit(mut self, limit: u32) -> Self {
        self.limit = limit;
        self
    }

    /// Reclamation policy in use.
    pub fn policy(&self) -> ReclaimPolicy {
        self.policy
    }

    /// Number of handles currently held by values.
    pub fn live(&self) -> usize {
        self.live
    }

    /// Number of handles waiting in the pool.
    pub fn pooled(&self) -> usize {
        self.pool.len()
    }

    /// Number of handles parked until the next reset.
    pub fn parked(&self) -> usize {
        self.parked.len()
    }

    fn draw(&mut self) -> Result<Identifier, TapeError> {
        let raw = match self.pool.pop() {
            Some(raw) => raw,
            None => {
                if self.largest >= self.limit {
                    return Err(TapeError::IdentifierOverflow { limit: self.limit });
                }
                self.largest += 1;
                self.largest
            }
        };
        self.live += 1;
        Ok(Identifier::new(raw))
    }
}

impl Default for ReuseIndexManager {
    fn default() -> Self {
        Self::new()
    }
}

impl IndexManager for ReuseIndexManager {
    const IS_LINEAR: bool = false;

    fn assign(&mut self, id: &mut Identifier) -> Result<(), TapeError> {
        if !id.is_active() {
            *id = self.draw()?;
        }
        Ok(())
    }

    fn assign_unused(&mut self, id: &mut Identifier) -> Result<(), TapeError> {
        // Draw before releasing so the old handle cannot come straight back.
        let mut fresh = self.draw()?;
        std::mem::swap(id, &mut fresh);
        self.free(&mut fresh);
        Ok(())
    }

    fn free(&mut self, id: &mut Identifier) {
        if !id.is_active() {
            return;
        }
        match self.policy {
            ReclaimPolicy::Eager => self.pool.push(id.raw()),
            ReclaimPolicy::Deferred => self.parked.push(id.raw()),
        }
        self.live = self.live.saturating_sub(1);
        trace!("identifier {} released ({:?})", id, self.policy);
        *id = Identifier::PASSIVE;
    }

    fn largest_issued(&self) -> u32 {
        self.largest
    }

    fn position(&self) -> u32 {
        0
    }

    fn reset_to(&mut self, _position: u32) {}

    fn reset(&mut self) {
        self.pool.append(&mut self.parked);
        // Hand out small handles first for better locality.
        self.pool.sort_unstable_by(|a, b| b.cmp(a));
    }

    fn reserve(&mut self, id: Identifier) -> Result<(), TapeError> {
        if id.raw() > self.limit {
            return Err(TapeError::IdentifierOverflow { limit: self.limit });
        }
        if id.raw() > self.largest {
            self.pool.extend(self.largest + 1..id.raw());
            self.largest = id.raw();
            self.live += 1;
        } else if let Some(slot) = self.pool.iter().position(|&raw| raw == id.raw()) {
            self.pool.swap_remove(slot);
            self.live += 1;
        }
        Ok(())
    }
}
