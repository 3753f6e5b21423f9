//! Threaded dispatch: on first entry to a prototype, patch each
//! instruction with a direct handler pointer so later executions skip the
//! `match` entirely. A portable switch-based loop (ordinary `match` over
//! [`Instr`]) is always available and produces identical results; threading
//! only changes dispatch cost, never semantics.

use super::instr::Instr;
use super::interp::{Control, Interp};
use crate::error::VResult;

pub type Handler = fn(&mut Interp, &Instr) -> VResult<Control>;

/// A single threaded slot: just the resolved handler. Operand data still
/// lives in the parallel, unmodified `Instr` array, so threading never
/// duplicates or mutates program data -- only dispatch.
#[derive(Clone, Copy)]
pub struct ThreadedInstr {
    pub handler: Handler,
}

impl std::fmt::Debug for ThreadedInstr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedInstr")
            .field("handler", &(self.handler as usize))
            .finish()
    }
}

/// Build the threaded table for a prototype's bytecode. Cheap to call
/// repeatedly (pure function of the opcode), so there's no harm in racing
/// two threads into filling the same `RefCell` -- whichever wins, both
/// computed the same table.
pub fn thread_bytecode(bytecode: &[Instr]) -> Vec<ThreadedInstr> {
    bytecode
        .iter()
        .map(|instr| ThreadedInstr {
            handler: handler_for(instr),
        })
        .collect()
}

fn handler_for(instr: &Instr) -> Handler {
    match instr {
        Instr::Kget { .. } => super::interp::op_kget,
        Instr::Iget { .. } => super::interp::op_iget,
        Instr::Get { .. } => super::interp::op_get,
        Instr::Assign { .. } => super::interp::op_assign,
        Instr::Iassign { .. } => super::interp::op_iassign,
        Instr::Eassign { .. } => super::interp::op_eassign,
        Instr::Jmp { .. } => super::interp::op_jmp,
        Instr::Jt { .. } => super::interp::op_jt,
        Instr::Jf { .. } => super::interp::op_jf,
        Instr::ForBegin { .. } => super::interp::op_forbegin,
        Instr::ForEnd { .. } => super::interp::op_forend,
        Instr::Ret { .. } => super::interp::op_ret,
        Instr::Done => super::interp::op_done,
        Instr::Subset { .. } => super::interp::op_subset,
        Instr::Subset2 { .. } => super::interp::op_subset2,
        Instr::Colon { .. } => super::interp::op_colon,
        Instr::Seq { .. } => super::interp::op_seq,
        Instr::ArithUnary { .. } => super::interp::op_arith_unary,
        Instr::ArithBinary { .. } => super::interp::op_arith_binary,
        Instr::Compare { .. } => super::interp::op_compare,
        Instr::Logical { .. } => super::interp::op_logical,
        Instr::Fold { .. } => super::interp::op_fold,
        Instr::Scan { .. } => super::interp::op_scan,
        Instr::Call { .. } => super::interp::op_call,
        Instr::UseMethod { .. } => super::interp::op_use_method,
        Instr::MakeFunction { .. } => super::interp::op_make_function,
        Instr::Coerce { .. } => super::interp::op_coerce,
    }
}
