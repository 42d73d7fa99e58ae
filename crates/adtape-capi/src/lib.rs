//! C API for adtape
//!
//! This crate exposes a scalar `f64` Jacobian tape with linear identifiers
//! to foreign front-ends (C, Julia, Python, ...). A front-end overloads its
//! arithmetic, computes local partials itself and calls
//! `adt_tape_f64_store` once per operation.
//!
//! All extern "C" functions are inherently unsafe as they work with raw pointers
//! from foreign code. Handles cross the boundary as plain `unsigned int`
//! values; `0` is the passive handle.

#![allow(clippy::not_unsafe_ptr_arg_deref)]

use adtape::{Identifier, Position, Tape, TapeConfig, TapeError};
use libc::{c_double, c_int, c_uint, size_t};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const ADT_SUCCESS: StatusCode = 0;
pub const ADT_INVALID_ARGUMENT: StatusCode = -1;
pub const ADT_CAPACITY_EXCEEDED: StatusCode = -2;
pub const ADT_INVALID_STATE: StatusCode = -3;
pub const ADT_INTERNAL_ERROR: StatusCode = -4;

fn status_of(err: &TapeError) -> StatusCode {
    if err.is_capacity() {
        ADT_CAPACITY_EXCEEDED
    } else {
        match err {
            TapeError::ArgumentCountMismatch { .. } => ADT_INVALID_ARGUMENT,
            TapeError::Io(_) | TapeError::Format { .. } | TapeError::KindMismatch { .. } => {
                ADT_INTERNAL_ERROR
            }
            _ => ADT_INVALID_STATE,
        }
    }
}

fn status(result: Result<(), TapeError>) -> StatusCode {
    match result {
        Ok(()) => ADT_SUCCESS,
        Err(err) => status_of(&err),
    }
}

/// Opaque tape type for f64
#[repr(C)]
pub struct adt_tape_f64 {
    _private: *mut std::ffi::c_void,
}

impl adt_tape_f64 {
    fn from_tape(tape: Tape<f64>) -> Self {
        let boxed = Box::new(tape);
        Self {
            _private: Box::into_raw(boxed) as *mut std::ffi::c_void,
        }
    }

    fn inner(&self) -> &Tape<f64> {
        unsafe { &*(self._private as *const Tape<f64>) }
    }

    fn inner_mut(&mut self) -> &mut Tape<f64> {
        unsafe { &mut *(self._private as *mut Tape<f64>) }
    }
}

impl Drop for adt_tape_f64 {
    fn drop(&mut self) {
        if !self._private.is_null() {
            unsafe {
                let _ = Box::from_raw(self._private as *mut Tape<f64>);
            }
        }
    }
}

/// Opaque tape position
#[repr(C)]
pub struct adt_position {
    _private: *mut std::ffi::c_void,
}

impl adt_position {
    fn from_position(position: Position) -> Self {
        Self {
            _private: Box::into_raw(Box::new(position)) as *mut std::ffi::c_void,
        }
    }

    fn inner(&self) -> &Position {
        unsafe { &*(self._private as *const Position) }
    }
}

impl Drop for adt_position {
    fn drop(&mut self) {
        if !self._private.is_null() {
            unsafe {
                let _ = Box::from_raw(self._private as *mut Position);
            }
        }
    }
}

// ============================================================================
// Tape lifecycle functions
// ============================================================================

/// Create a new idle tape.
///
/// # Arguments
/// * `chunk_size` - Items per storage segment, `0` for the default
/// * `max_arguments` - Largest statement accepted, `0` for the default
/// * `status` - Pointer to receive status code
///
/// # Returns
/// Pointer to new tape, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_new(
    chunk_size: size_t,
    max_arguments: size_t,
    status: *mut StatusCode,
) -> *mut adt_tape_f64 {
    if status.is_null() {
        return ptr::null_mut();
    }

    let result = catch_unwind(|| {
        let mut config = TapeConfig::jacobian();
        if chunk_size > 0 {
            config = config.with_chunk_size(chunk_size);
        }
        if max_arguments > 0 {
            config = config.with_max_arguments(max_arguments);
        }
        let tape: Tape<f64> = Tape::new(config);
        Box::into_raw(Box::new(adt_tape_f64::from_tape(tape)))
    });

    match result {
        Ok(ptr) => {
            unsafe {
                *status = ADT_SUCCESS;
            }
            ptr
        }
        Err(_) => {
            unsafe {
                *status = ADT_INTERNAL_ERROR;
            }
            ptr::null_mut()
        }
    }
}

/// Release (free) a tape. External resources are cleaned up.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_release(tape: *mut adt_tape_f64) {
    if !tape.is_null() {
        unsafe {
            let _ = Box::from_raw(tape);
        }
    }
}

/// Start recording.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_set_active(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*tape).inner_mut().set_active();
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Stop recording.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_set_passive(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*tape).inner_mut().set_passive();
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Number of recorded statements (0 for a null tape).
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_size(tape: *const adt_tape_f64) -> size_t {
    if tape.is_null() {
        return 0;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe { (*tape).inner().size() }));

    result.unwrap_or(0)
}

// ============================================================================
// Recording functions
// ============================================================================

/// Register an independent variable.
///
/// # Arguments
/// * `tape` - Recording tape
/// * `value` - Input value
/// * `out_id` - Pointer to receive the new handle
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_register_input(
    tape: *mut adt_tape_f64,
    value: c_double,
    out_id: *mut c_uint,
) -> StatusCode {
    if tape.is_null() || out_id.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        match (*tape).inner_mut().register_input(value) {
            Ok(id) => {
                *out_id = id.raw();
                ADT_SUCCESS
            }
            Err(err) => status_of(&err),
        }
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Register a dependent variable. `id` may be rewritten to a fresh handle.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_register_output(
    tape: *mut adt_tape_f64,
    id: *mut c_uint,
    value: c_double,
) -> StatusCode {
    if tape.is_null() || id.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let mut handle = Identifier::new(*id);
        let code = status((*tape).inner_mut().register_output(&mut handle, value));
        *id = handle.raw();
        code
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Record `lhs = f(args)` with precomputed partials.
///
/// # Arguments
/// * `tape` - Tape (nothing is stored while passive)
/// * `lhs` - Pointer to the output handle; receives the assigned handle
/// * `primal` - Output value
/// * `ids` - Pointer to `n` argument handles
/// * `partials` - Pointer to `n` partial derivatives
/// * `n` - Number of arguments
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_store(
    tape: *mut adt_tape_f64,
    lhs: *mut c_uint,
    primal: c_double,
    ids: *const c_uint,
    partials: *const c_double,
    n: size_t,
) -> StatusCode {
    if tape.is_null() || lhs.is_null() || (n > 0 && (ids.is_null() || partials.is_null())) {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let (id_slice, partial_slice): (&[c_uint], &[c_double]) = if n == 0 {
            (&[], &[])
        } else {
            (
                std::slice::from_raw_parts(ids, n),
                std::slice::from_raw_parts(partials, n),
            )
        };
        let args: Vec<(Identifier, f64)> = id_slice
            .iter()
            .zip(partial_slice)
            .map(|(&id, &partial)| (Identifier::new(id), partial))
            .collect();

        let mut handle = Identifier::new(*lhs);
        let code = status((*tape).inner_mut().store(&mut handle, primal, &args));
        *lhs = handle.raw();
        code
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Release a handle on scope exit; `id` is set to passive.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_free_id(tape: *mut adt_tape_f64, id: *mut c_uint) -> StatusCode {
    if tape.is_null() || id.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let mut handle = Identifier::new(*id);
        (*tape).inner_mut().free(&mut handle);
        *id = handle.raw();
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

// ============================================================================
// Position functions
// ============================================================================

/// Capture the current end of the tape.
///
/// # Returns
/// Pointer to a new position, or null on error. Release it with
/// `adt_position_release`.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_position(tape: *const adt_tape_f64) -> *mut adt_position {
    if tape.is_null() {
        return ptr::null_mut();
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let position = (*tape).inner().position();
        Box::into_raw(Box::new(adt_position::from_position(position)))
    }));

    result.unwrap_or(ptr::null_mut())
}

/// Release (free) a position.
#[unsafe(no_mangle)]
pub extern "C" fn adt_position_release(position: *mut adt_position) {
    if !position.is_null() {
        unsafe {
            let _ = Box::from_raw(position);
        }
    }
}

/// Discard everything recorded after `position`.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_reset_to(
    tape: *mut adt_tape_f64,
    position: *const adt_position,
) -> StatusCode {
    if tape.is_null() || position.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let position = *(*position).inner();
        status((*tape).inner_mut().reset_to(&position))
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Discard the whole recording.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_reset(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*tape).inner_mut().reset();
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

// ============================================================================
// Evaluation functions
// ============================================================================

/// Reverse sweep over the whole tape.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_evaluate(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        status((*tape).inner_mut().evaluate())
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Reverse sweep from `start` down to `end` (`start >= end`).
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_evaluate_range(
    tape: *mut adt_tape_f64,
    start: *const adt_position,
    end: *const adt_position,
) -> StatusCode {
    if tape.is_null() || start.is_null() || end.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        let start = *(*start).inner();
        let end = *(*end).inner();
        status((*tape).inner_mut().evaluate_range(&start, &end))
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Forward sweep over the whole tape.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_evaluate_forward(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        status((*tape).inner_mut().evaluate_forward())
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

// ============================================================================
// Derivative access functions
// ============================================================================

/// Get the adjoint (or tangent) of a handle.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_get_gradient(
    tape: *const adt_tape_f64,
    id: c_uint,
    out: *mut c_double,
) -> StatusCode {
    if tape.is_null() || out.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        *out = (*tape).inner().gradient(Identifier::new(id));
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Seed the adjoint (or tangent) of a handle.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_set_gradient(
    tape: *mut adt_tape_f64,
    id: c_uint,
    value: c_double,
) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*tape).inner_mut().set_gradient(Identifier::new(id), value);
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

/// Zero every adjoint.
#[unsafe(no_mangle)]
pub extern "C" fn adt_tape_f64_clear_adjoints(tape: *mut adt_tape_f64) -> StatusCode {
    if tape.is_null() {
        return ADT_INVALID_ARGUMENT;
    }

    let result = catch_unwind(AssertUnwindSafe(|| unsafe {
        (*tape).inner_mut().clear_adjoints();
        ADT_SUCCESS
    }));

    result.unwrap_or(ADT_INTERNAL_ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_tape() -> *mut adt_tape_f64 {
        let mut status: StatusCode = -999;
        let tape = adt_tape_f64_new(0, 0, &mut status);
        assert_eq!(status, ADT_SUCCESS);
        assert!(!tape.is_null());
        tape
    }

    #[test]
    fn test_cube_gradient() {
        let tape = new_tape();
        assert_eq!(adt_tape_f64_set_active(tape), ADT_SUCCESS);

        let mut x: c_uint = 0;
        assert_eq!(adt_tape_f64_register_input(tape, 4.0, &mut x), ADT_SUCCESS);
        assert_ne!(x, 0);

        // y = x^3, dy/dx = 3 x^2
        let mut y: c_uint = 0;
        let ids = [x];
        let partials = [48.0];
        assert_eq!(
            adt_tape_f64_store(tape, &mut y, 64.0, ids.as_ptr(), partials.as_ptr(), 1),
            ADT_SUCCESS
        );
        assert_eq!(adt_tape_f64_register_output(tape, &mut y, 64.0), ADT_SUCCESS);
        assert_eq!(adt_tape_f64_set_passive(tape), ADT_SUCCESS);
        assert_eq!(adt_tape_f64_size(tape), 1);

        assert_eq!(adt_tape_f64_set_gradient(tape, y, 1.0), ADT_SUCCESS);
        assert_eq!(adt_tape_f64_evaluate(tape), ADT_SUCCESS);
        let mut grad = 0.0;
        assert_eq!(adt_tape_f64_get_gradient(tape, x, &mut grad), ADT_SUCCESS);
        assert_eq!(grad, 48.0);

        adt_tape_f64_release(tape);
    }

    #[test]
    fn test_evaluate_while_recording() {
        let tape = new_tape();
        adt_tape_f64_set_active(tape);
        assert_eq!(adt_tape_f64_evaluate(tape), ADT_INVALID_STATE);
        adt_tape_f64_release(tape);
    }

    #[test]
    fn test_reset_to_position() {
        let tape = new_tape();
        adt_tape_f64_set_active(tape);
        let mut x: c_uint = 0;
        adt_tape_f64_register_input(tape, 1.0, &mut x);
        let checkpoint = adt_tape_f64_position(tape);
        assert!(!checkpoint.is_null());

        let mut y: c_uint = 0;
        let ids = [x, x];
        let partials = [1.0, 2.0];
        adt_tape_f64_store(tape, &mut y, 3.0, ids.as_ptr(), partials.as_ptr(), 2);
        assert_eq!(adt_tape_f64_size(tape), 1);

        adt_tape_f64_set_passive(tape);
        assert_eq!(adt_tape_f64_reset_to(tape, checkpoint), ADT_SUCCESS);
        assert_eq!(adt_tape_f64_size(tape), 0);

        adt_position_release(checkpoint);
        adt_tape_f64_release(tape);
    }

    #[test]
    fn test_too_many_arguments() {
        let mut status: StatusCode = -999;
        let tape = adt_tape_f64_new(0, 1, &mut status);
        adt_tape_f64_set_active(tape);
        let mut a: c_uint = 0;
        let mut b: c_uint = 0;
        adt_tape_f64_register_input(tape, 1.0, &mut a);
        adt_tape_f64_register_input(tape, 2.0, &mut b);

        let mut y: c_uint = 0;
        let ids = [a, b];
        let partials = [1.0, 1.0];
        assert_eq!(
            adt_tape_f64_store(tape, &mut y, 3.0, ids.as_ptr(), partials.as_ptr(), 2),
            ADT_CAPACITY_EXCEEDED
        );
        adt_tape_f64_release(tape);
    }

    #[test]
    fn test_null_arguments() {
        let mut status: StatusCode = 0;
        assert!(adt_tape_f64_new(0, 0, ptr::null_mut()).is_null());
        assert_eq!(adt_tape_f64_evaluate(ptr::null_mut()), ADT_INVALID_ARGUMENT);
        assert_eq!(adt_tape_f64_size(ptr::null()), 0);
        let tape = adt_tape_f64_new(0, 0, &mut status);
        assert_eq!(
            adt_tape_f64_store(tape, ptr::null_mut(), 0.0, ptr::null(), ptr::null(), 0),
            ADT_INVALID_ARGUMENT
        );
        adt_tape_f64_release(tape);
    }
}
