//! Register-based bytecode: the instruction set, threaded dispatch, the
//! calling convention, and the interpreter loop that ties them together.

pub mod calling;
pub mod dispatch;
pub mod frame;
pub mod instr;
pub mod interp;
pub mod raw;

pub use frame::Frame;
pub use instr::Instr;
pub use interp::{Control, Interp};
