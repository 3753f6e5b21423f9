//! Trace recorder: shadow-interprets the interpreter's real handlers while
//! mirroring each executed bytecode as an [`IRNode`].
//!
//! The recorder never speculates: it always runs the *real* opcode
//! handler to produce the real value before advancing, so a trace's
//! numeric results are byte-for-byte what plain interpretation would have
//! produced (property 1 in the design notes' testable-properties list).
//! On abort, nothing about the instruction that could not be represented
//! has executed yet, so control can simply fall back to
//! [`crate::bytecode::interp::Interp::run`] from the same `pc`.

use crate::bytecode::instr::Instr;
use crate::bytecode::interp::{Control, Interp};
use crate::error::VecjitError;
use crate::ir::{GroupKind, IRNode, IrAux, IrOpcode, IrRef, IrType, Shape, Snapshot, Trace};
use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy)]
pub struct RecordBudget {
    pub max_nodes: usize,
    pub max_dynamic_instrs: usize,
}

impl Default for RecordBudget {
    fn default() -> Self {
        RecordBudget {
            max_nodes: 4096,
            max_dynamic_instrs: 100_000,
        }
    }
}

pub enum RecordOutcome {
    /// The trace closed on its own loop header at `header_pc`.
    Closed { trace: Trace, header_pc: usize },
    /// Recording was abandoned; the interpreter should resume plain
    /// execution at `resume_pc` (nothing executed by the recorder past
    /// that point).
    Aborted { reason: String, resume_pc: usize },
}

pub struct Recorder {
    trace: Trace,
    reg_map: FxHashMap<usize, IrRef>,
    length_map: FxHashMap<usize, IrRef>,
    budget: RecordBudget,
    steps: usize,
    start_pc: usize,
}

impl Recorder {
    pub fn new(start_pc: usize, budget: RecordBudget) -> Self {
        Recorder {
            trace: Trace::new(),
            reg_map: FxHashMap::default(),
            length_map: FxHashMap::default(),
            budget,
            steps: 0,
            start_pc,
        }
    }

    /// Run the recorder from `start_pc` until the trace closes, a guard
    /// cannot be represented, or the budget is exhausted.
    pub fn record(mut self, interp: &mut Interp) -> RecordOutcome {
        let mut pc = self.start_pc;
        loop {
            if self.trace.len() >= self.budget.max_nodes || self.steps >= self.budget.max_dynamic_instrs
            {
                return RecordOutcome::Aborted {
                    reason: "recording budget exceeded".into(),
                    resume_pc: pc,
                };
            }
            self.steps += 1;

            let instr = interp.proto.bytecode[pc].clone();
            match self.step(interp, pc, &instr) {
                Ok(StepResult::Continue(next_pc)) => pc = next_pc,
                Ok(StepResult::Closed) => {
                    return RecordOutcome::Closed {
                        trace: self.trace,
                        header_pc: self.start_pc,
                    }
                }
                Err(reason) => {
                    return RecordOutcome::Aborted {
                        reason,
                        resume_pc: pc,
                    }
                }
            }
        }
    }

    fn slot(&mut self, reg: usize) -> IrRef {
        if let Some(&r) = self.reg_map.get(&reg) {
            return r;
        }
        let node = IRNode::new(IrOpcode::Sload, IrType::Boxed, GroupKind::Scalar)
            .with_aux(IrAux::Slot(reg));
        let r = self.trace.push(node);
        self.trace.entry.registers.insert(reg, r);
        self.reg_map.insert(reg, r);
        r
    }

    fn length_of(&mut self, reg: usize) -> IrRef {
        if let Some(&r) = self.length_map.get(&reg) {
            return r;
        }
        let src = self.slot(reg);
        let node = IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar)
            .with_operands(Some(src), None, None);
        let r = self.trace.push(node);
        self.length_map.insert(reg, r);
        r
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot {
            registers: self.reg_map.clone(),
            env_slots: FxHashMap::default(),
        }
    }

    fn step(&mut self, interp: &mut Interp, pc: usize, instr: &Instr) -> Result<StepResult, String> {
        // Handlers that compute jump targets (`jmp`/`jt`/`jf`/`forend`) read
        // `interp.pc` directly, so it must track the recorder's own `pc`.
        interp.pc = pc;
        match instr {
            Instr::ArithBinary { op, dst, lhs, rhs } => {
                let a = self.slot(*lhs);
                let b = self.slot(*rhs);
                let len = self.length_of(*lhs);
                let node = IRNode::new(IrOpcode::Arith(*op), IrType::Double, GroupKind::Map)
                    .with_operands(Some(a), Some(b), None)
                    .with_shape(Shape::plain(len));
                let r = self.trace.push(node);
                self.reg_map.insert(*dst, r);
                self.length_map.insert(*dst, len);
                run_real(interp, instr)?;
                Ok(StepResult::Continue(pc + 1))
            }
            Instr::ArithUnary { op, dst, src } => {
                let a = self.slot(*src);
                let len = self.length_of(*src);
                let node = IRNode::new(IrOpcode::Arith(*op), IrType::Double, GroupKind::Map)
                    .with_operands(Some(a), None, None)
                    .with_shape(Shape::plain(len));
                let r = self.trace.push(node);
                self.reg_map.insert(*dst, r);
                self.length_map.insert(*dst, len);
                run_real(interp, instr)?;
                Ok(StepResult::Continue(pc + 1))
            }
            Instr::Compare { op, dst, lhs, rhs } => {
                let a = self.slot(*lhs);
                let b = self.slot(*rhs);
                let len = self.length_of(*lhs);
                let node = IRNode::new(IrOpcode::Compare(*op), IrType::Logical, GroupKind::Map)
                    .with_operands(Some(a), Some(b), None)
                    .with_shape(Shape::plain(len));
                let r = self.trace.push(node);
                self.reg_map.insert(*dst, r);
                self.length_map.insert(*dst, len);
                run_real(interp, instr)?;
                Ok(StepResult::Continue(pc + 1))
            }
            Instr::Fold { op, dst, src } => {
                let a = self.slot(*src);
                let len = self.length_of(*src);
                let node = IRNode::new(IrOpcode::Fold(*op), IrType::Double, GroupKind::Fold)
                    .with_operands(Some(a), None, None)
                    .with_shape(Shape::plain(len));
                let r = self.trace.push(node);
                self.reg_map.insert(*dst, r);
                run_real(interp, instr)?;
                Ok(StepResult::Continue(pc + 1))
            }
            Instr::Jt { cond, target } | Instr::Jf { cond, target } => {
                let is_jt = matches!(instr, Instr::Jt { .. });
                let cond_ref = self.slot(*cond);
                let guard_op = if is_jt { IrOpcode::Gtrue } else { IrOpcode::Gfalse };

                // Determine which way this guard actually goes and record
                // the *other* direction as a side exit. `continues_if_true`
                // is the condition's truthiness on the path just taken --
                // the trace stays valid on replay only as long as future
                // evaluations agree with it.
                let control = run_real(interp, instr)?;
                let taken_target = (pc as isize + *target) as usize;
                let fallthrough = pc + 1;
                let branch_taken = matches!(control, Control::Jump(t) if t == taken_target);
                let continues_if_true = branch_taken == is_jt;
                let (next_pc, exit_resume) = if branch_taken {
                    (taken_target, fallthrough)
                } else {
                    (fallthrough, taken_target)
                };

                let guard = self.trace.push(
                    IRNode::new(guard_op, IrType::Boxed, GroupKind::Scalar)
                        .with_operands(Some(cond_ref), None, None)
                        .with_aux(IrAux::GuardDirection(continues_if_true)),
                );
                self.trace.add_exit(guard, self.snapshot(), exit_resume);
                Ok(StepResult::Continue(next_pc))
            }
            Instr::ForEnd {
                iter,
                var,
                pos,
                body_target,
            } => {
                let _ = (iter, var, pos);
                let back_edge_target = (pc as isize + *body_target) as usize;
                let control = run_real(interp, instr)?;
                // `note_hot_candidate` is a monotonic per-(proto, pc)
                // counter: once this back edge has tripped it once, every
                // later real pass through it reports `HotSite` again, never
                // `Jump` -- so the loop-closing check has to accept either
                // variant, or a trace started from an already-hot site
                // could never close (it would record forever and abort on
                // the node/step budget instead).
                match control {
                    Control::Jump(t) | Control::HotSite(t)
                        if t == back_edge_target && t == self.start_pc =>
                    {
                        self.trace.push(IRNode::new(
                            IrOpcode::Loop,
                            IrType::Boxed,
                            GroupKind::Scalar,
                        ));
                        self.trace.push(IRNode::new(
                            IrOpcode::Jmp,
                            IrType::Boxed,
                            GroupKind::Scalar,
                        ));
                        Ok(StepResult::Closed)
                    }
                    Control::Jump(t) => Ok(StepResult::Continue(t)),
                    Control::Next => Ok(StepResult::Continue(pc + 1)),
                    Control::HotSite(t) => Ok(StepResult::Continue(t)),
                    Control::Return(_) => {
                        Err("forend unexpectedly returned from the frame".into())
                    }
                }
            }
            other => Err(format!("cannot represent {other:?} in the trace IR")),
        }
    }
}

/// Nested recording is never attempted at this layer: `Recorder::record`
/// takes ownership of `self` and runs to completion or abort before
/// returning, so there is no reentrant call path through this API.
fn run_real(interp: &mut Interp, instr: &Instr) -> Result<Control, String> {
    let handler = crate::bytecode::dispatch::thread_bytecode(std::slice::from_ref(instr))[0].handler;
    handler(interp, instr).map_err(|e: VecjitError| e.to_string())
}

enum StepResult {
    Continue(usize),
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instr::ArithOp;
    use crate::proto::Prototype;
    use crate::value::Value;
    use std::rc::Rc;

    fn make_interp_with(bytecode: Vec<Instr>, regs: &[(usize, Value)]) -> Interp {
        let proto = Rc::new(Prototype::new("test", vec![], 0, bytecode, 8));
        let mut interp = Interp::new(proto);
        for (r, v) in regs {
            interp.registers[*r] = v.clone();
        }
        interp
    }

    #[test]
    fn scenario_b_vector_fusion_produces_ir_of_length_at_least_three() {
        // a*b + a, matching Scenario B's shape.
        let a = Value::Double(crate::value::Vector::filled(1024, 2.0));
        let b = Value::Double(crate::value::Vector::filled(1024, 3.0));
        let bytecode = vec![
            Instr::ArithBinary {
                op: ArithOp::Mul,
                dst: 2,
                lhs: 0,
                rhs: 1,
            },
            Instr::ArithBinary {
                op: ArithOp::Add,
                dst: 3,
                lhs: 2,
                rhs: 0,
            },
            Instr::Ret { value: 3 },
        ];
        let mut interp = make_interp_with(bytecode, &[(0, a), (1, b)]);
        let outcome = Recorder::new(0, RecordBudget::default()).record(&mut interp);
        match outcome {
            RecordOutcome::Aborted { reason, .. } => {
                // `ret` isn't representable; recording should abort right
                // at it, having already recorded the two arith ops.
                assert!(reason.contains("Ret"));
            }
            RecordOutcome::Closed { .. } => panic!("did not expect a loop close here"),
        }
        let result = interp.registers[3].as_double_slice().unwrap().to_vec();
        assert!(result.iter().all(|&x| (x - 8.0).abs() < 1e-12));
    }

    #[test]
    fn abort_leaves_interpreter_state_as_if_never_recorded() {
        let bytecode = vec![
            Instr::ArithBinary {
                op: ArithOp::Add,
                dst: 2,
                lhs: 0,
                rhs: 1,
            },
            Instr::UseMethod {
                dst: 3,
                generic: 0,
                first_arg: 2,
            },
        ];
        let a = Value::scalar_integer(1);
        let b = Value::scalar_integer(2);
        let mut interp = make_interp_with(bytecode, &[(0, a), (1, b)]);
        let outcome = Recorder::new(0, RecordBudget::default()).record(&mut interp);
        match outcome {
            RecordOutcome::Aborted { resume_pc, .. } => assert_eq!(resume_pc, 1),
            RecordOutcome::Closed { .. } => panic!("UseMethod is not representable"),
        }
        // The add already ran for real (recorder always executes the real
        // handler before deciding representability of the *next*
        // instruction), so register 2 holds the real sum either way.
        assert_eq!(interp.registers[2].as_integer_slice().unwrap()[0], 3);
    }
}
