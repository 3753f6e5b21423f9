//! Error kinds raised by the interpreter, recorder and code generator.

use thiserror::Error;

/// Errors that can occur during bytecode interpretation or trace execution.
///
/// `RecordAbort` and `RegisterOverflow` are internal: the former never
/// surfaces to user code (it silently ends recording), and the latter is
/// fatal and indicates a prototype that the compiler should never have
/// produced.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum VecjitError {
    #[error("object '{0}' not found")]
    NameNotFound(String),

    #[error("expected type {expected}, got {got}")]
    TypeError { expected: String, got: String },

    #[error("non-conformable arguments in {op} (lengths {a_len}, {b_len})")]
    LengthError {
        op: &'static str,
        a_len: usize,
        b_len: usize,
    },

    #[error("subscript out of bounds: index {index}, length {length}")]
    OutOfBounds { index: i64, length: usize },

    #[error("{fn_name} expects {expected} argument(s), got {given}")]
    Arity {
        fn_name: String,
        given: usize,
        expected: usize,
    },

    #[error("attempt to apply non-function of type {0}")]
    NonFunctionCall(String),

    #[error("no applicable method for '{generic}' applied to class \"{class}\"")]
    NoMethod { generic: String, class: String },

    /// Integer arithmetic overflow. By default this does not propagate as
    /// an error: callers should prefer returning `NA` from the op. Kept as
    /// a variant so a caller that wants to be strict can opt in.
    #[error("NAs produced by integer overflow")]
    Overflow,

    /// Internal: recording could not continue. Caught by the recorder and
    /// never surfaced to user code.
    #[error("trace recording aborted: {0}")]
    RecordAbort(String),

    /// Internal, fatal: the register file window exceeded the interpreter's
    /// configured register budget.
    #[error("register file overflow")]
    RegisterOverflow,
}

pub type VResult<T> = Result<T, VecjitError>;
