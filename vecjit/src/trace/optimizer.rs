//! Trace optimizer: liveness, sinking, fusion grouping and register
//! assignment over an already-recorded [`Trace`]. Every pass mutates the
//! `Cell` fields [`crate::ir::IRNode`] carries for exactly this purpose, so
//! none of these passes need to rebuild the node list.

use crate::ir::{IrOpcode, IrRef, Trace};
use std::collections::HashMap;

/// Fusion groups and a liveness/register-assignment summary produced by
/// [`optimize`]. The trace itself is mutated in place (its nodes' `live`,
/// `sunk`, `exit` and `reg` cells are filled in); this struct is the extra
/// bookkeeping the code generator needs on top of that.
#[derive(Debug)]
pub struct OptimizedTrace {
    /// Groups of node indices that share an output length and can be
    /// lowered as a single fused loop.
    pub fusion_groups: Vec<Vec<IrRef>>,
    pub live_count: usize,
}

pub fn optimize(trace: &Trace) -> OptimizedTrace {
    liveness(trace);
    sink_exit_only_nodes(trace);
    register_assignment(trace)
}

/// Mark every node reachable, backward, from a control opcode, an exit's
/// snapshot, or another live node's operands/shape refs. Everything else is
/// dead: computed by the interpreter but never read back out of the trace.
fn liveness(trace: &Trace) {
    let n = trace.nodes.len();
    let mut live = vec![false; n];

    for (i, node) in trace.nodes.iter().enumerate() {
        if node.op.is_control() {
            live[i] = true;
        }
    }
    for exit in &trace.exits {
        live[exit.guard] = true;
        for &r in exit.snapshot.registers.values() {
            live[r] = true;
        }
        for &r in exit.snapshot.env_slots.values() {
            live[r] = true;
        }
    }

    // Backward sweep: once a node is known live, its operands/shape refs
    // (all strictly earlier indices, per the trace's back-reference
    // invariant) become live too.
    for i in (0..n).rev() {
        if !live[i] {
            continue;
        }
        let node = &trace.nodes[i];
        for r in node.operands() {
            live[r] = true;
        }
        if let Some(shape) = &node.shape {
            live[shape.length] = true;
            for r in [shape.filter, shape.split, shape.na_mask].into_iter().flatten() {
                live[r] = true;
            }
        }
    }

    for (i, node) in trace.nodes.iter().enumerate() {
        node.live.set(live[i]);
    }
}

/// A live node whose only live consumers are exit snapshots (never read by
/// anything on the main fused-loop path) can be computed lazily on the exit
/// stub instead of unconditionally every iteration.
fn sink_exit_only_nodes(trace: &Trace) {
    let n = trace.nodes.len();
    let mut used_on_mainline = vec![false; n];
    for node in &trace.nodes {
        if !node.live.get() {
            continue;
        }
        for r in node.operands() {
            used_on_mainline[r] = true;
        }
        if let Some(shape) = &node.shape {
            used_on_mainline[shape.length] = true;
        }
    }

    for (exit_id, exit) in trace.exits.iter().enumerate() {
        let mut targets: Vec<IrRef> = exit.snapshot.registers.values().copied().collect();
        targets.extend(exit.snapshot.env_slots.values().copied());
        for r in targets {
            let node = &trace.nodes[r];
            if node.live.get() && !used_on_mainline[r] && !node.op.is_control() {
                node.sunk.set(true);
                node.exit.set(Some(exit_id as u32));
            }
        }
    }
}

/// Group live, non-sunk `Map`-kind nodes by their shared output-length
/// node, so the code generator can lower each group as one fused loop.
fn fusion_groups(trace: &Trace) -> Vec<Vec<IrRef>> {
    let mut by_length: HashMap<IrRef, Vec<IrRef>> = HashMap::new();
    let mut order: Vec<IrRef> = Vec::new();
    for (i, node) in trace.nodes.iter().enumerate() {
        if !node.live.get() || node.sunk.get() {
            continue;
        }
        if node.group != crate::ir::GroupKind::Map {
            continue;
        }
        let Some(shape) = &node.shape else { continue };
        let bucket = by_length.entry(shape.length).or_insert_with(|| {
            order.push(shape.length);
            Vec::new()
        });
        bucket.push(i);
    }
    order.into_iter().map(|len| by_length.remove(&len).unwrap()).collect()
}

/// Assign dense virtual register numbers to every live node in trace
/// order, skipping dead and sunk nodes (sunk nodes get a register only on
/// the exit stub that computes them, which the code generator numbers
/// itself).
fn register_assignment(trace: &Trace) -> OptimizedTrace {
    let mut next = 0u32;
    let mut live_count = 0usize;
    for node in &trace.nodes {
        if node.live.get() && !node.sunk.get() {
            node.reg.set(Some(next));
            next += 1;
            live_count += 1;
        }
    }
    OptimizedTrace {
        fusion_groups: fusion_groups(trace),
        live_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instr::ArithOp;
    use crate::ir::{GroupKind, IRNode, IrType, Shape, Snapshot};

    fn sload() -> IRNode {
        IRNode::new(IrOpcode::Sload, IrType::Double, GroupKind::Scalar)
    }

    /// A node only becomes live by being reachable from a control opcode or
    /// an exit snapshot; these helpers stand in for "the trace actually
    /// exports this value somewhere".
    fn guard_exporting(t: &mut Trace, value: IrRef) {
        let guard = t.push(
            IRNode::new(IrOpcode::Gtrue, IrType::Boxed, GroupKind::Scalar)
                .with_operands(Some(value), None, None),
        );
        let mut snap = Snapshot::default();
        snap.registers.insert(0, value);
        t.add_exit(guard, snap, 99);
    }

    #[test]
    fn dead_node_with_no_consumers_is_pruned() {
        let mut t = Trace::new();
        let a = t.push(sload());
        let b = t.push(sload());
        let len = t.push(IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar));
        let used = t.push(
            IRNode::new(IrOpcode::Arith(ArithOp::Add), IrType::Double, GroupKind::Map)
                .with_operands(Some(a), Some(b), None)
                .with_shape(Shape::plain(len)),
        );
        guard_exporting(&mut t, used);
        let dead = t.push(
            IRNode::new(IrOpcode::Arith(ArithOp::Mul), IrType::Double, GroupKind::Map)
                .with_operands(Some(a), Some(b), None)
                .with_shape(Shape::plain(len)),
        );
        t.push(IRNode::new(IrOpcode::Jmp, IrType::Boxed, GroupKind::Scalar));

        optimize(&t);
        assert!(t.nodes[used].live.get());
        assert!(!t.nodes[dead].live.get());
        assert!(t.nodes[used].reg.get().is_some());
        assert!(t.nodes[dead].reg.get().is_none());
    }

    #[test]
    fn nodes_sharing_a_length_fuse_into_one_group() {
        let mut t = Trace::new();
        let a = t.push(sload());
        let b = t.push(sload());
        let len = t.push(IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar));
        let mul = t.push(
            IRNode::new(IrOpcode::Arith(ArithOp::Mul), IrType::Double, GroupKind::Map)
                .with_operands(Some(a), Some(b), None)
                .with_shape(Shape::plain(len)),
        );
        let add = t.push(
            IRNode::new(IrOpcode::Arith(ArithOp::Add), IrType::Double, GroupKind::Map)
                .with_operands(Some(mul), Some(a), None)
                .with_shape(Shape::plain(len)),
        );
        guard_exporting(&mut t, add);
        t.push(IRNode::new(IrOpcode::Jmp, IrType::Boxed, GroupKind::Scalar));

        let optimized = optimize(&t);
        assert_eq!(optimized.fusion_groups.len(), 1);
        assert_eq!(optimized.fusion_groups[0], vec![mul, add]);
    }
}
