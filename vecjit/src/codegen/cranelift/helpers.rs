use crate::bytecode::instr::{ArithOp, CompareOp};
use cranelift_codegen::ir::condcodes::FloatCC;
use cranelift_codegen::ir::types as cl_types;
use cranelift_codegen::ir::{AbiParam, Signature};
use cranelift_codegen::isa::CallConv;

use super::CraneliftError;

/// Signature shared by every compiled trace: `(i64 start, i64 len, i64
/// inputs_ptr, i64 out_ptr) -> i64`, matching [`crate::codegen::CompiledTraceFn`]
/// once the caller reinterprets the pointer-sized integers.
pub(super) fn trace_signature() -> Signature {
    let mut sig = Signature::new(CallConv::SystemV);
    sig.params.push(AbiParam::new(cl_types::I64)); // start_index
    sig.params.push(AbiParam::new(cl_types::I64)); // len
    sig.params.push(AbiParam::new(cl_types::I64)); // inputs: *const *const f64
    sig.params.push(AbiParam::new(cl_types::I64)); // out: *mut f64
    sig.returns.push(AbiParam::new(cl_types::I64)); // exit id, or u32::MAX
    sig
}

/// Lower a scalar [`ArithOp`] to the fadd/fsub/... builder call, returning
/// `None` for ops the fused-loop generator doesn't (yet) lower, so the
/// caller can fall back to aborting compilation for that trace.
pub(super) fn is_binary_arith(op: ArithOp) -> bool {
    matches!(
        op,
        ArithOp::Add | ArithOp::Sub | ArithOp::Mul | ArithOp::Div | ArithOp::Pmin | ArithOp::Pmax
    )
}

pub(super) fn is_unary_arith(op: ArithOp) -> bool {
    matches!(op, ArithOp::Neg | ArithOp::Abs | ArithOp::Sqrt)
}

pub(super) fn float_cc(op: CompareOp) -> FloatCC {
    match op {
        CompareOp::Eq => FloatCC::Equal,
        CompareOp::Neq => FloatCC::NotEqual,
        CompareOp::Lt => FloatCC::LessThan,
        CompareOp::Le => FloatCC::LessThanOrEqual,
        CompareOp::Gt => FloatCC::GreaterThan,
        CompareOp::Ge => FloatCC::GreaterThanOrEqual,
    }
}

pub(super) fn unsupported(what: &str) -> CraneliftError {
    CraneliftError::Unsupported(what.to_string())
}
