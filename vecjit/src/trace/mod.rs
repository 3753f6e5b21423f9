//! Hot-path trace recording and optimization: turns a repeatedly executed
//! bytecode region into a [`crate::ir::Trace`] that the code generator can
//! lower to native code, falling back to the interpreter whenever recording
//! can't represent what's executing.

pub mod optimizer;
pub mod recorder;

pub use optimizer::{optimize, OptimizedTrace};
pub use recorder::{RecordBudget, RecordOutcome, Recorder};
