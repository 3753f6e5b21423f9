//! `IRNode`: a single instruction in the linear, SSA-like trace IR.

use super::opcode::{IrAux, IrOpcode, IrType};
use std::cell::Cell;

/// Index of a node within its [`super::Trace`]. All operand references are
/// back-references: strictly lower indices than the node that holds them.
pub type IrRef = usize;

/// A fold's grouping kind, or plain scalar/map shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupKind {
    Scalar,
    Map,
    Generator,
    Fold,
    Scan,
}

/// Output shape: element count, number of distinct group levels (for a
/// grouped fold), and optional filter/split/NA-mask sibling references.
#[derive(Debug, Clone, Copy)]
pub struct Shape {
    pub length: IrRef,
    pub levels: usize,
    pub filter: Option<IrRef>,
    pub split: Option<IrRef>,
    pub na_mask: Option<IrRef>,
}

impl Shape {
    pub fn plain(length: IrRef) -> Self {
        Shape {
            length,
            levels: 1,
            filter: None,
            split: None,
            na_mask: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct IRNode {
    pub op: IrOpcode,
    pub ty: IrType,
    /// Virtual register assigned by the optimizer's register-assignment
    /// pass; `None` until then.
    pub reg: Cell<Option<u32>>,
    pub a: Option<IrRef>,
    pub b: Option<IrRef>,
    pub c: Option<IrRef>,
    /// `None` for the entry node of a trace (its "shape" is the trace's
    /// own length, fixed at record time).
    pub shape: Option<Shape>,
    pub group: GroupKind,
    pub aux: IrAux,
    pub live: Cell<bool>,
    pub sunk: Cell<bool>,
    /// Which exit (if any) this node belongs to, for nodes sunk onto a
    /// side-exit stub rather than the main fused loop.
    pub exit: Cell<Option<u32>>,
}

impl IRNode {
    pub fn new(op: IrOpcode, ty: IrType, group: GroupKind) -> Self {
        IRNode {
            op,
            ty,
            reg: Cell::new(None),
            a: None,
            b: None,
            c: None,
            shape: None,
            group,
            aux: IrAux::None,
            live: Cell::new(true),
            sunk: Cell::new(false),
            exit: Cell::new(None),
        }
    }

    pub fn with_operands(mut self, a: Option<IrRef>, b: Option<IrRef>, c: Option<IrRef>) -> Self {
        self.a = a;
        self.b = b;
        self.c = c;
        self
    }

    pub fn with_shape(mut self, shape: Shape) -> Self {
        self.shape = Some(shape);
        self
    }

    pub fn with_aux(mut self, aux: IrAux) -> Self {
        self.aux = aux;
        self
    }

    pub fn operands(&self) -> impl Iterator<Item = IrRef> {
        [self.a, self.b, self.c].into_iter().flatten()
    }
}
