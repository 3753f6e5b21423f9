//! Linear, SSA-like intermediate representation for a recorded trace.

pub mod node;
pub mod opcode;

pub use node::{GroupKind, IRNode, IrRef, Shape};
pub use opcode::{IrAux, IrOpcode, IrType};

use crate::value::Sym;
use rustc_hash::FxHashMap;

/// A slot -> IR-ref mapping capturing interpreter state at a point in
/// time: the entry snapshot (record start) or a side-exit snapshot.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub registers: FxHashMap<usize, IrRef>,
    pub env_slots: FxHashMap<Sym, IrRef>,
}

/// One side exit: the guard node index that can take it, and the
/// interpreter state to reconstruct if it fires.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub guard: IrRef,
    pub snapshot: Snapshot,
    /// Absolute bytecode pc the interpreter resumes at if this exit fires.
    pub resume_pc: usize,
}

/// A recorded trace: its IR, the state it started from, and every exit
/// discovered while recording.
#[derive(Debug, Default)]
pub struct Trace {
    pub nodes: Vec<IRNode>,
    pub entry: Snapshot,
    pub exits: Vec<ExitInfo>,
}

impl Trace {
    pub fn new() -> Self {
        Trace::default()
    }

    /// Append a node, enforcing that every operand it carries refers only
    /// to strictly earlier nodes (and, for its shape's length/filter/
    /// split/na_mask refs, likewise).
    pub fn push(&mut self, node: IRNode) -> IrRef {
        let idx = self.nodes.len();
        debug_assert!(
            node.operands().all(|r| r < idx),
            "IR operand must be a back-reference"
        );
        if let Some(shape) = &node.shape {
            debug_assert!(shape.length < idx, "shape length ref must be a back-reference");
            for r in [shape.filter, shape.split, shape.na_mask].into_iter().flatten() {
                debug_assert!(r < idx, "shape sibling ref must be a back-reference");
            }
        }
        self.nodes.push(node);
        idx
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn add_exit(&mut self, guard: IrRef, snapshot: Snapshot, resume_pc: usize) -> u32 {
        self.exits.push(ExitInfo {
            guard,
            snapshot,
            resume_pc,
        });
        (self.exits.len() - 1) as u32
    }
}
