//! Storage-agnostic access for external function callbacks.

use crate::index::Identifier;
use crate::real::Real;
use crate::storage::{AdjointStorage, Gradient};
use std::marker::PhantomData;

/// Read/write access to derivatives and primals of arbitrary handles.
///
/// External function callbacks receive this instead of the concrete
/// storage, so the same callback works for scalar adjoints, vector mode
/// and user supplied storage. Derivative components are addressed by
/// `dim < dimension()`; other components and the passive handle read as
/// zero and ignore writes.
pub trait VectorAccess<T: Real> {
    /// Number of derivative directions.
    fn dimension(&self) -> usize;

    /// Component `dim` of the derivative of `id`.
    fn derivative(&self, id: Identifier, dim: usize) -> T;

    /// Add `value` to component `dim` of the derivative of `id`.
    fn update_derivative(&mut self, id: Identifier, dim: usize, value: T);

    /// Overwrite component `dim` of the derivative of `id`.
    fn set_derivative(&mut self, id: Identifier, dim: usize, value: T);

    /// Zero every component of the derivative of `id`.
    fn reset_derivative(&mut self, id: Identifier);

    /// Whether primal values are available (primal-value tapes).
    fn has_primals(&self) -> bool;

    /// Primal value of `id`, if available.
    fn primal(&self, id: Identifier) -> Option<T>;

    /// Overwrite the primal value of `id`; ignored without primals.
    fn set_primal(&mut self, id: Identifier, value: T);
}

/// [`VectorAccess`] over an [`AdjointStorage`] and an optional primal slice.
pub(crate) struct StorageAccess<'a, T, G, S> {
    storage: Option<&'a mut S>,
    primals: Option<&'a mut [T]>,
    _gradient: PhantomData<G>,
}

impl<'a, T, G, S> StorageAccess<'a, T, G, S> {
    pub(crate) fn new(storage: Option<&'a mut S>, primals: Option<&'a mut [T]>) -> Self {
        Self {
            storage,
            primals,
            _gradient: PhantomData,
        }
    }
}

impl<T, G, S> VectorAccess<T> for StorageAccess<'_, T, G, S>
where
    T: Real,
    G: Gradient<T>,
    S: AdjointStorage<T, G>,
{
    fn dimension(&self) -> usize {
        G::DIM
    }

    fn derivative(&self, id: Identifier, dim: usize) -> T {
        match &self.storage {
            Some(storage) if writable::<T, G>(id, dim) => storage.read(id).component(dim),
            _ => T::zero(),
        }
    }

    fn update_derivative(&mut self, id: Identifier, dim: usize, value: T) {
        if !writable::<T, G>(id, dim) {
            return;
        }
        if let Some(storage) = self.storage.as_deref_mut() {
            let mut derivative = storage.read(id);
            *derivative.component_mut(dim) += value;
            storage.set(id, derivative);
        }
    }

    fn set_derivative(&mut self, id: Identifier, dim: usize, value: T) {
        if !writable::<T, G>(id, dim) {
            return;
        }
        if let Some(storage) = self.storage.as_deref_mut() {
            let mut derivative = storage.read(id);
            *derivative.component_mut(dim) = value;
            storage.set(id, derivative);
        }
    }

    fn reset_derivative(&mut self, id: Identifier) {
        if !id.is_active() {
            return;
        }
        if let Some(storage) = self.storage.as_deref_mut() {
            storage.clear(id);
        }
    }

    fn has_primals(&self) -> bool {
        self.primals.is_some()
    }

    fn primal(&self, id: Identifier) -> Option<T> {
        if !id.is_active() {
            return None;
        }
        self.primals.as_deref()?.get(id.index()).copied()
    }

    fn set_primal(&mut self, id: Identifier, value: T) {
        if !id.is_active() {
            return;
        }
        if let Some(slot) = self
            .primals
            .as_deref_mut()
            .and_then(|primals| primals.get_mut(id.index()))
        {
            *slot = value;
        }
    }
}

/// Active handle and a component below `G::DIM`.
fn writable<T: Real, G: Gradient<T>>(id: Identifier, dim: usize) -> bool {
    id.is_active() && dim < G::DIM
}
