//! Error type for the companion runtime library.
//!
//! Compiled traces and the glue code that drives them report failures
//! through this type rather than panicking, so a JIT-compiled loop can
//! never unwind through foreign-code frames it was linked into.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("type error: {0}")]
    TypeError(String),

    #[error("bounds error: index {index} out of range for length {length}")]
    BoundsError { index: usize, length: usize },

    #[error("division by zero")]
    DivisionByZero,

    #[error("unbox failed: expected {expected}, cell tag was {actual}")]
    UnboxMismatch { expected: &'static str, actual: u8 },

    #[error("unimplemented: {0}")]
    Unimplemented(String),

    #[error("{0}")]
    Custom(String),
}

impl RuntimeError {
    pub fn type_error<S: Into<String>>(msg: S) -> Self {
        RuntimeError::TypeError(msg.into())
    }

    pub fn bounds_error(index: usize, length: usize) -> Self {
        RuntimeError::BoundsError { index, length }
    }

    pub fn custom<S: Into<String>>(msg: S) -> Self {
        RuntimeError::Custom(msg.into())
    }
}

pub type RuntimeResult<T> = Result<T, RuntimeError>;
