//! Decoded, register-indexed instruction set the interpreter dispatches on.

use crate::env::Pointer;
use crate::value::Sym;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    IDiv,
    Mod,
    Pow,
    Atan2,
    Hypot,
    Pmin,
    Pmax,
    Neg,
    Pos,
    Abs,
    Sign,
    Sqrt,
    Floor,
    Ceiling,
    Trunc,
    Exp,
    Log,
    Cos,
    Sin,
    Tan,
    Acos,
    Asin,
    Atan,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogicalOp {
    And,
    Or,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FoldOp {
    Sum,
    Prod,
    Min,
    Max,
    All,
    Any,
    Length,
    Mean,
    Cm2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Coercion {
    Logical,
    Integer,
    Double,
    Character,
    Raw,
    Type,
}

/// Register-based instruction. `reg` fields are indices into the current
/// frame's register window (relative to `base`).
#[derive(Debug, Clone)]
pub enum Instr {
    // --- Loads/stores ---
    Kget { dst: usize, const_idx: usize },
    Iget { dst: usize, name: Sym },
    /// `get`/`assign` both carry a one-slot inline cache; `cache` starts as
    /// `None` and is filled in by the interpreter on first resolution.
    Get { dst: usize, name: Sym, cache: Option<Pointer> },
    Assign { name: Sym, src: usize, cache: Option<Pointer> },
    Iassign { name: Sym, src: usize },
    Eassign { target: usize, index: usize, src: usize },

    // --- Control ---
    Jmp { target: isize },
    Jt { cond: usize, target: isize },
    Jf { cond: usize, target: isize },
    /// `pos` is a dedicated induction-position register: 0-based index
    /// into `iter`, distinct from `var` (the bound element value).
    ForBegin { iter: usize, var: usize, pos: usize, end_target: isize },
    ForEnd { iter: usize, var: usize, pos: usize, body_target: isize },
    Ret { value: usize },
    Done,

    // --- Element & subset ---
    Subset { dst: usize, obj: usize, index: usize },
    Subset2 { dst: usize, obj: usize, index: usize },
    Colon { dst: usize, from: usize, to: usize },
    Seq { dst: usize, from: usize, to: usize, by: usize },

    // --- Arithmetic/logical ---
    ArithUnary { op: ArithOp, dst: usize, src: usize },
    ArithBinary { op: ArithOp, dst: usize, lhs: usize, rhs: usize },
    Compare { op: CompareOp, dst: usize, lhs: usize, rhs: usize },
    Logical { op: LogicalOp, dst: usize, lhs: usize, rhs: Option<usize> },
    Fold { op: FoldOp, dst: usize, src: usize },
    Scan { op: FoldOp, dst: usize, src: usize },

    // --- Calling ---
    /// `call_site` mirrors the wire contract's `b<0` case: `Some(i)` means
    /// pre-compiled call site `i`; `None` means the arglist lives in
    /// `args_reg`.
    Call {
        dst: usize,
        callee: usize,
        call_site: Option<usize>,
        args_reg: Option<usize>,
    },
    UseMethod { dst: usize, generic: Sym, first_arg: usize },
    MakeFunction { dst: usize, child_proto: usize },

    // --- Coercions ---
    Coerce { kind: Coercion, dst: usize, src: usize },
}
