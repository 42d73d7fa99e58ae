//! External functions: opaque computations with user supplied derivatives.
//!
//! An external function is recorded as a single marker in the statement
//! stream. When a sweep reaches the marker it calls the matching callback
//! with a [`VectorAccess`], through which the callback reads and writes the
//! derivatives (and, on primal-value tapes, primals) of any handle.
//!
//! The tape owns every record. The delete callback runs exactly once: when
//! a `reset`/`reset_to` discards the marker, or when the tape is dropped.
//!
//! # Example
//!
//! ```
//! use adtape::{ExternalFunction, Identifier, Tape, TapeConfig, VectorAccess};
//!
//! let mut tape: Tape<f64> = Tape::new(TapeConfig::jacobian());
//! tape.set_active();
//! let x = tape.register_input(3.0).unwrap();
//!
//! // y = 2 x computed outside the tape.
//! let y = tape.register_external_output(6.0).unwrap();
//! let f = ExternalFunction::new("double", (x, y)).on_reverse(
//!     |&mut (x, y): &mut (Identifier, Identifier), access: &mut dyn VectorAccess<f64>| {
//!         for dim in 0..access.dimension() {
//!             let bar = access.derivative(y, dim);
//!             access.update_derivative(x, dim, 2.0 * bar);
//!         }
//!         access.reset_derivative(y);
//!     },
//! );
//! tape.push_external_function(f).unwrap();
//! tape.set_passive();
//!
//! tape.set_gradient(y, 1.0);
//! tape.evaluate().unwrap();
//! assert_eq!(tape.gradient(x), 2.0);
//! ```

use crate::error::TapeError;
use crate::index::IndexManager;
use crate::real::Real;
use crate::tape::{Statement, Tape, VectorAccess};
use log::debug;

/// Callbacks attached to an external function marker.
pub trait ExternalCallbacks<T: Real>: Send {
    /// Name used in logs and tape writers.
    fn name(&self) -> &str;

    /// Propagate adjoints from the outputs to the inputs.
    fn reverse(&mut self, access: &mut dyn VectorAccess<T>);

    /// Propagate tangents from the inputs to the outputs.
    fn forward(&mut self, access: &mut dyn VectorAccess<T>);

    /// Recompute output primals from input primals.
    fn primal(&mut self, access: &mut dyn VectorAccess<T>);

    /// Release the user data. Called exactly once.
    fn delete(self: Box<Self>);
}

pub(crate) type ExternalRecord<T> = Box<dyn ExternalCallbacks<T>>;

type Callback<T, D> = Box<dyn FnMut(&mut D, &mut dyn VectorAccess<T>) + Send>;

/// [`ExternalCallbacks`] built from closures over typed user data.
///
/// Callbacks that are not set do nothing.
pub struct ExternalFunction<T, D> {
    name: String,
    data: D,
    reverse: Option<Callback<T, D>>,
    forward: Option<Callback<T, D>>,
    primal: Option<Callback<T, D>>,
    delete: Option<Box<dyn FnOnce(D) + Send>>,
}

impl<T: Real, D: Send + 'static> ExternalFunction<T, D> {
    pub fn new(name: impl Into<String>, data: D) -> Self {
        Self {
            name: name.into(),
            data,
            reverse: None,
            forward: None,
            primal: None,
            delete: None,
        }
    }

    pub fn on_reverse(
        mut self,
        f: impl FnMut(&mut D, &mut dyn VectorAccess<T>) + Send + 'static,
    ) -> Self {
        self.reverse = Some(Box::new(f));
        self
    }

    pub fn on_forward(
        mut self,
        f: impl FnMut(&mut D, &mut dyn VectorAccess<T>) + Send + 'static,
    ) -> Self {
        self.forward = Some(Box::new(f));
        self
    }

    pub fn on_primal(
        mut self,
        f: impl FnMut(&mut D, &mut dyn VectorAccess<T>) + Send + 'static,
    ) -> Self {
        self.primal = Some(Box::new(f));
        self
    }

    /// Consume the user data when the record is discarded.
    pub fn on_delete(mut self, f: impl FnOnce(D) + Send + 'static) -> Self {
        self.delete = Some(Box::new(f));
        self
    }

    fn call(
        name: &str,
        which: &str,
        callback: &mut Option<Callback<T, D>>,
        data: &mut D,
        access: &mut dyn VectorAccess<T>,
    ) {
        match callback {
            Some(f) => f(data, access),
            None => debug!("external function '{name}' has no {which} callback"),
        }
    }
}

impl<T: Real, D: Send + 'static> ExternalCallbacks<T> for ExternalFunction<T, D> {
    fn name(&self) -> &str {
        &self.name
    }

    fn reverse(&mut self, access: &mut dyn VectorAccess<T>) {
        Self::call(&self.name, "reverse", &mut self.reverse, &mut self.data, access);
    }

    fn forward(&mut self, access: &mut dyn VectorAccess<T>) {
        Self::call(&self.name, "forward", &mut self.forward, &mut self.data, access);
    }

    fn primal(&mut self, access: &mut dyn VectorAccess<T>) {
        Self::call(&self.name, "primal", &mut self.primal, &mut self.data, access);
    }

    fn delete(self: Box<Self>) {
        let this = *self;
        if let Some(f) = this.delete {
            f(this.data);
        }
    }
}

impl<T: Real, I: IndexManager> Tape<T, I> {
    /// Insert an external function marker at the current position.
    ///
    /// On a tape that is not recording nothing is stored and the delete
    /// callback runs right away.
    ///
    /// # Errors
    /// Returns a capacity error if the marker does not fit; the record is
    /// deleted in that case.
    pub fn push_external_function(
        &mut self,
        function: impl ExternalCallbacks<T> + 'static,
    ) -> Result<(), TapeError> {
        let record: ExternalRecord<T> = Box::new(function);
        if !self.is_recording() {
            record.delete();
            return Ok(());
        }
        let reserved = self
            .statements
            .reserve(1, &mut self.budget)
            .and_then(|()| self.externals.reserve(1, &mut self.budget));
        if let Err(err) = reserved {
            record.delete();
            return Err(err);
        }
        debug!("external function '{}' recorded", record.name());
        self.statements.push(Statement::External);
        self.externals.push(record);
        Ok(())
    }

    /// Names of the recorded external functions, in recording order.
    pub fn external_function_names(&self) -> Vec<&str> {
        self.externals.iter().map(|record| record.name()).collect()
    }
}
