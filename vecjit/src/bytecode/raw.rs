//! Wire-level instruction encoding: the `(opcode, a, b, c)` contract the
//! compiler's output format must honor (see the external-interfaces
//! design notes). This is the only part of the instruction set that a
//! foreign compiler front-end actually needs to target; [`super::instr::Instr`]
//! is the decoded, ergonomic form the interpreter and recorder work with.

use serde::{Deserialize, Serialize};

/// One bytecode instruction as the compiler emits it: a discriminant plus
/// three signed 32-bit operand fields. Each field is independently either
/// a register index, a constant-pool index, or (for jumps) a relative
/// displacement -- the meaning is fixed per opcode, not self-describing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInstr {
    pub op: RawOp,
    pub a: i32,
    pub b: i32,
    pub c: i32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum RawOp {
    Kget,
    Iget,
    Get,
    Assign,
    Iassign,
    Eassign,
    Jmp,
    Jt,
    Jf,
    Forbegin,
    Forend,
    Ret,
    Done,
    Subset,
    Subset2,
    Colon,
    Seq,
    Arith,
    Logical,
    Ordinal,
    Fold,
    Scan,
    Call,
    UseMethod,
    Function,
    Coerce,
}

impl RawInstr {
    /// For `call`: `b < 0` selects the pre-compiled call site `-(b+1)`;
    /// `b >= 0` means "argument list is the value in register b".
    pub fn call_site_index(&self) -> Option<usize> {
        if self.op == RawOp::Call && self.b < 0 {
            Some((-(self.b + 1)) as usize)
        } else {
            None
        }
    }

    pub fn call_arglist_register(&self) -> Option<usize> {
        if self.op == RawOp::Call && self.b >= 0 {
            Some(self.b as usize)
        } else {
            None
        }
    }

    /// Jump displacement: relative to the instruction's own index.
    pub fn jump_target(&self, here: usize) -> usize {
        (here as i64 + self.a as i64) as usize
    }
}
