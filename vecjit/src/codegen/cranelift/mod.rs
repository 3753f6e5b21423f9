//! Cranelift code generation backend.
//!
//! Lowers one fused loop per recorded, loop-closed trace straight to
//! native code: a single `for i in start..len` body that replays the
//! trace's live instructions, branching out to a per-guard exit stub the
//! moment a condition stops matching what was recorded.

mod helpers;

use super::{CodeGenerator, CodegenConfig, CompiledTrace, CompiledTraceFn};
use crate::bytecode::instr::{ArithOp, FoldOp};
use crate::error::{VResult, VecjitError};
use crate::ir::{IrAux, IrOpcode, IrRef, Trace};
use crate::trace::OptimizedTrace;

use cranelift_codegen::ir::{types as cl_types, Block, InstBuilder, MemFlags, Value};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_codegen::Context;
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{FuncId, Linkage, Module};
use std::collections::HashMap;
use target_lexicon::Triple;

use helpers::{float_cc, is_binary_arith, is_unary_arith, trace_signature, unsupported};

/// Errors specific to the Cranelift backend, folded into [`VecjitError::RecordAbort`]
/// at the [`CodeGenerator`] boundary: a trace that can't be compiled simply
/// keeps running under the interpreter.
#[derive(Debug)]
pub enum CraneliftError {
    ModuleCreation(String),
    FunctionCompilation(String),
    Unsupported(String),
}

impl std::fmt::Display for CraneliftError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CraneliftError::ModuleCreation(m) => write!(f, "module creation error: {m}"),
            CraneliftError::FunctionCompilation(m) => write!(f, "function compilation error: {m}"),
            CraneliftError::Unsupported(m) => write!(f, "unsupported in fused trace: {m}"),
        }
    }
}

impl std::error::Error for CraneliftError {}

impl From<CraneliftError> for VecjitError {
    fn from(e: CraneliftError) -> Self {
        VecjitError::RecordAbort(e.to_string())
    }
}

pub struct CraneliftCodeGenerator {
    #[allow(dead_code)]
    config: CodegenConfig,
    module: JITModule,
    builder_context: FunctionBuilderContext,
    ctx: Context,
    next_id: u32,
    function_ids: HashMap<u32, FuncId>,
}

impl CraneliftCodeGenerator {
    pub fn new() -> Result<Self, CraneliftError> {
        Self::with_config(CodegenConfig::default())
    }

    pub fn with_config(config: CodegenConfig) -> Result<Self, CraneliftError> {
        let mut flag_builder = settings::builder();
        flag_builder
            .set("opt_level", "speed")
            .map_err(|e| CraneliftError::ModuleCreation(e.to_string()))?;
        let isa_builder = cranelift_codegen::isa::lookup(Triple::host())
            .map_err(|e| CraneliftError::ModuleCreation(e.to_string()))?;
        let isa = isa_builder
            .finish(settings::Flags::new(flag_builder))
            .map_err(|e| CraneliftError::ModuleCreation(e.to_string()))?;
        let builder = JITBuilder::with_isa(isa, cranelift_module::default_libcall_names());
        let module = JITModule::new(builder);
        Ok(CraneliftCodeGenerator {
            config,
            module,
            builder_context: FunctionBuilderContext::new(),
            ctx: Context::new(),
            next_id: 0,
            function_ids: HashMap::new(),
        })
    }
}

/// One loop-carried fold accumulator.
struct FoldAcc {
    node: IrRef,
    op: FoldOp,
    init: f64,
}

fn fold_identity(op: FoldOp) -> Result<f64, CraneliftError> {
    match op {
        FoldOp::Sum | FoldOp::Any | FoldOp::Length => Ok(0.0),
        FoldOp::Prod | FoldOp::All => Ok(1.0),
        FoldOp::Min => Ok(f64::INFINITY),
        FoldOp::Max => Ok(f64::NEG_INFINITY),
        FoldOp::Mean | FoldOp::Cm2 => Err(unsupported("mean/cm2 fold in a fused native loop")),
    }
}

fn fold_combine(
    builder: &mut FunctionBuilder,
    op: FoldOp,
    acc: Value,
    x: Value,
) -> Result<Value, CraneliftError> {
    Ok(match op {
        FoldOp::Sum => builder.ins().fadd(acc, x),
        FoldOp::Length => {
            let one = builder.ins().f64const(1.0);
            builder.ins().fadd(acc, one)
        }
        FoldOp::Prod => builder.ins().fmul(acc, x),
        FoldOp::Min => builder.ins().fmin(acc, x),
        FoldOp::Max => builder.ins().fmax(acc, x),
        FoldOp::All | FoldOp::Any => {
            let zero = builder.ins().f64const(0.0);
            let acc_nz = builder.ins().fcmp(cranelift_codegen::ir::condcodes::FloatCC::NotEqual, acc, zero);
            let x_nz = builder.ins().fcmp(cranelift_codegen::ir::condcodes::FloatCC::NotEqual, x, zero);
            let combined = if op == FoldOp::All {
                builder.ins().band(acc_nz, x_nz)
            } else {
                builder.ins().bor(acc_nz, x_nz)
            };
            let as_i = builder.ins().uextend(cl_types::I64, combined);
            builder.ins().fcvt_from_uint(cl_types::F64, as_i)
        }
        FoldOp::Mean | FoldOp::Cm2 => return Err(unsupported("mean/cm2 fold in a fused native loop")),
    })
}

impl CodeGenerator for CraneliftCodeGenerator {
    fn target_name(&self) -> &str {
        "cranelift"
    }

    fn compile_trace(&mut self, trace: &Trace, _optimized: &OptimizedTrace) -> VResult<CompiledTrace> {
        let compiled = self.compile(trace).map_err(VecjitError::from)?;
        Ok(compiled)
    }
}

impl CraneliftCodeGenerator {
    fn compile(&mut self, trace: &Trace) -> Result<CompiledTrace, CraneliftError> {
        let id = self.next_id;
        self.next_id += 1;
        let name = format!("vecjit_trace_{id}");

        let sig = trace_signature();
        let func_id = self
            .module
            .declare_function(&name, Linkage::Export, &sig)
            .map_err(|e| CraneliftError::ModuleCreation(e.to_string()))?;
        self.function_ids.insert(id, func_id);

        self.ctx.func = cranelift_codegen::ir::Function::with_name_signature(
            cranelift_codegen::ir::UserFuncName::user(0, func_id.as_u32()),
            sig,
        );

        let (input_slots, exit_register_slots) = {
            let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_context);
            let result = build_body(&mut builder, trace)?;
            builder.finalize();
            result
        };

        self.module
            .define_function(func_id, &mut self.ctx)
            .map_err(|e| CraneliftError::FunctionCompilation(e.to_string()))?;
        self.module.clear_context(&mut self.ctx);

        self.module
            .finalize_definitions()
            .map_err(|e| CraneliftError::FunctionCompilation(e.to_string()))?;
        let raw = self.module.get_finalized_function(func_id);
        let entry: CompiledTraceFn = unsafe { std::mem::transmute(raw) };

        Ok(CompiledTrace {
            entry,
            input_slots,
            exit_register_slots,
        })
    }
}

/// Emits the function body: a single induction-variable loop over
/// `start_index..len`, threading fold accumulators as block parameters,
/// with one early-return block per recorded guard.
fn build_body(
    builder: &mut FunctionBuilder,
    trace: &Trace,
) -> Result<(Vec<usize>, Vec<Vec<u32>>), CraneliftError> {
    let entry = builder.create_block();
    builder.append_block_params_for_function_params(entry);
    builder.switch_to_block(entry);
    builder.seal_block(entry);

    let params = builder.block_params(entry).to_vec();
    let (start_index, len, inputs_ptr, out_ptr) = (params[0], params[1], params[2], params[3]);

    // Hoist each distinct Sload slot's base pointer load out of the loop.
    let mut slot_order: Vec<usize> = Vec::new();
    let mut slot_base: HashMap<usize, Value> = HashMap::new();
    for node in &trace.nodes {
        if !node.live.get() || node.sunk.get() {
            continue;
        }
        if let (IrOpcode::Sload, IrAux::Slot(reg)) = (node.op, &node.aux) {
            if !slot_base.contains_key(reg) {
                let pos = slot_order.len();
                slot_order.push(*reg);
                let base = builder
                    .ins()
                    .load(cl_types::I64, MemFlags::new(), inputs_ptr, (pos * 8) as i32);
                slot_base.insert(*reg, base);
            }
        }
    }

    let folds: Vec<FoldAcc> = trace
        .nodes
        .iter()
        .enumerate()
        .filter(|(_, n)| n.live.get() && !n.sunk.get())
        .filter_map(|(i, n)| match n.op {
            IrOpcode::Fold(op) => Some((i, op)),
            _ => None,
        })
        .map(|(i, op)| fold_identity(op).map(|init| FoldAcc { node: i, op, init }))
        .collect::<Result<_, _>>()?;

    let mut header_params = vec![cl_types::I64];
    header_params.extend(folds.iter().map(|_| cl_types::F64));

    let header = builder.create_block();
    let body = builder.create_block();
    let done = builder.create_block();
    for &ty in &header_params {
        builder.append_block_param(header, ty);
    }
    for &ty in &header_params {
        builder.append_block_param(body, ty);
    }
    for _ in &folds {
        builder.append_block_param(done, cl_types::F64);
    }

    let mut entry_args = vec![start_index];
    for f in &folds {
        entry_args.push(builder.ins().f64const(f.init));
    }
    builder.ins().jump(header, &entry_args);

    builder.switch_to_block(header);
    let header_params_vals = builder.block_params(header).to_vec();
    let i_hdr = header_params_vals[0];
    let cond = builder
        .ins()
        .icmp(cranelift_codegen::ir::condcodes::IntCC::SignedLessThan, i_hdr, len);
    let body_args = header_params_vals.clone();
    let done_args: Vec<Value> = header_params_vals[1..].to_vec();
    builder.ins().brif(cond, body, &body_args, done, &done_args);

    // `body` starts the same way `header` left off; its own params become
    // the per-iteration `i` and fold accumulator values.
    builder.switch_to_block(body);
    let body_params_vals = builder.block_params(body).to_vec();
    let i_val = body_params_vals[0];
    let mut fold_vals: HashMap<IrRef, Value> = HashMap::new();
    for (k, f) in folds.iter().enumerate() {
        fold_vals.insert(f.node, body_params_vals[1 + k]);
    }

    let mut vals: HashMap<IrRef, Value> = HashMap::new();
    let mut exit_register_slots: Vec<Vec<u32>> = Vec::new();

    for (idx, node) in trace.nodes.iter().enumerate() {
        if !node.live.get() || node.sunk.get() {
            continue;
        }
        match node.op {
            IrOpcode::Sload => {
                let IrAux::Slot(reg) = &node.aux else {
                    return Err(unsupported("sload without a slot aux"));
                };
                let base = slot_base[reg];
                let byte_off = builder.ins().imul_imm(i_val, 8);
                let addr = builder.ins().iadd(base, byte_off);
                let v = builder.ins().load(cl_types::F64, MemFlags::new(), addr, 0);
                vals.insert(idx, v);
            }
            IrOpcode::Arith(op) => {
                let a = *vals
                    .get(&node.a.expect("arith always has an lhs"))
                    .ok_or_else(|| unsupported("arith operand not yet computed"))?;
                let v = if let Some(b_ref) = node.b {
                    if !is_binary_arith(op) {
                        return Err(unsupported("binary arith op not lowered"));
                    }
                    let b = *vals
                        .get(&b_ref)
                        .ok_or_else(|| unsupported("arith rhs not yet computed"))?;
                    match op {
                        ArithOp::Add => builder.ins().fadd(a, b),
                        ArithOp::Sub => builder.ins().fsub(a, b),
                        ArithOp::Mul => builder.ins().fmul(a, b),
                        ArithOp::Div => builder.ins().fdiv(a, b),
                        ArithOp::Pmin => builder.ins().fmin(a, b),
                        ArithOp::Pmax => builder.ins().fmax(a, b),
                        _ => unreachable!("filtered by is_binary_arith"),
                    }
                } else {
                    if !is_unary_arith(op) {
                        return Err(unsupported("unary arith op not lowered"));
                    }
                    match op {
                        ArithOp::Neg => builder.ins().fneg(a),
                        ArithOp::Abs => builder.ins().fabs(a),
                        ArithOp::Sqrt => builder.ins().sqrt(a),
                        _ => unreachable!("filtered by is_unary_arith"),
                    }
                };
                vals.insert(idx, v);
                if let Some(reg) = node.reg.get() {
                    store_row(builder, out_ptr, len, reg, i_val, v);
                }
            }
            IrOpcode::Compare(op) => {
                let a = *vals
                    .get(&node.a.expect("compare always has an lhs"))
                    .ok_or_else(|| unsupported("compare operand not yet computed"))?;
                let b = *vals
                    .get(&node.b.expect("compare always has an rhs"))
                    .ok_or_else(|| unsupported("compare operand not yet computed"))?;
                let cmp = builder.ins().fcmp(float_cc(op), a, b);
                let as_i = builder.ins().uextend(cl_types::I64, cmp);
                let as_f = builder.ins().fcvt_from_uint(cl_types::F64, as_i);
                vals.insert(idx, as_f);
                if let Some(reg) = node.reg.get() {
                    store_row(builder, out_ptr, len, reg, i_val, as_f);
                }
            }
            IrOpcode::Fold(op) => {
                let a = *vals
                    .get(&node.a.expect("fold always has an operand"))
                    .ok_or_else(|| unsupported("fold operand not yet computed"))?;
                let acc = fold_vals[&idx];
                let updated = fold_combine(builder, op, acc, a)?;
                fold_vals.insert(idx, updated);
            }
            IrOpcode::Gtrue | IrOpcode::Gfalse => {
                let cond_ref = node.a.expect("guard always has a condition");
                let cond_val = *vals
                    .get(&cond_ref)
                    .ok_or_else(|| unsupported("guard condition not yet computed"))?;
                let IrAux::GuardDirection(continues_if_true) = node.aux else {
                    return Err(unsupported("guard missing its recorded direction"));
                };
                let zero = builder.ins().f64const(0.0);
                let nonzero = builder
                    .ins()
                    .fcmp(cranelift_codegen::ir::condcodes::FloatCC::NotEqual, cond_val, zero);
                let continue_cond = if continues_if_true {
                    nonzero
                } else {
                    builder.ins().bxor_imm(nonzero, 1)
                };

                let exit = trace
                    .exits
                    .iter()
                    .position(|e| e.guard == idx)
                    .ok_or_else(|| unsupported("guard has no matching recorded exit"))?;
                let exit_block = builder.create_block();
                let cont = builder.create_block();
                builder.ins().brif(continue_cond, cont, &[], exit_block, &[]);

                builder.switch_to_block(exit_block);
                builder.seal_block(exit_block);
                // Pack the firing iteration into the high bits so the
                // caller can find that iteration's row in `out`; every
                // iteration re-writes a live register's row at a
                // different column, not just the last one.
                let exit_id = builder.ins().iconst(cl_types::I64, exit as i64);
                let iter_bits = builder.ins().ishl_imm(i_val, 32);
                let packed = builder.ins().bor(iter_bits, exit_id);
                builder.ins().return_(&[packed]);
                exit_register_slots.push(
                    trace.exits[exit]
                        .snapshot
                        .registers
                        .values()
                        .filter_map(|r| trace.nodes[*r].reg.get())
                        .collect(),
                );

                builder.seal_block(cont);
                builder.switch_to_block(cont);
            }
            IrOpcode::Loop | IrOpcode::Jmp => {
                // Structural markers only: this loop's own header/body
                // pair already implements the back-edge.
            }
            other => return Err(unsupported(&format!("{other:?} in a fused native trace"))),
        }
    }

    let i_next = builder.ins().iadd_imm(i_val, 1);
    let mut back_args = vec![i_next];
    for f in &folds {
        back_args.push(fold_vals[&f.node]);
    }
    builder.ins().jump(header, &back_args);
    builder.seal_block(header);
    builder.seal_block(body);

    builder.switch_to_block(done);
    let done_vals = builder.block_params(done).to_vec();
    for (k, f) in folds.iter().enumerate() {
        if let Some(reg) = trace.nodes[f.node].reg.get() {
            store_row(builder, out_ptr, len, reg, i_const(builder, 0), done_vals[k]);
        }
    }
    let sentinel = builder.ins().iconst(cl_types::I64, u32::MAX as i64);
    builder.ins().return_(&[sentinel]);
    builder.seal_block(done);

    Ok((slot_order, exit_register_slots))
}

fn i_const(builder: &mut FunctionBuilder, v: i64) -> Value {
    builder.ins().iconst(cl_types::I64, v)
}

/// `out[reg * len + i]`, addressed in bytes.
fn store_row(
    builder: &mut FunctionBuilder,
    out_ptr: Value,
    len: Value,
    reg: u32,
    i_val: Value,
    v: Value,
) {
    let row = builder.ins().imul_imm(len, reg as i64);
    let idx = builder.ins().iadd(row, i_val);
    let byte_off = builder.ins().imul_imm(idx, 8);
    let addr = builder.ins().iadd(out_ptr, byte_off);
    builder.ins().store(MemFlags::new(), v, addr, 0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::instr::ArithOp;
    use crate::ir::{GroupKind, IRNode, IrType, Shape, Snapshot};
    use crate::trace::optimizer::optimize;

    #[test]
    fn compiles_a_simple_fused_add_loop() {
        let mut t = Trace::new();
        let a = t.push(IRNode::new(IrOpcode::Sload, IrType::Double, GroupKind::Scalar).with_aux(IrAux::Slot(0)));
        let b = t.push(IRNode::new(IrOpcode::Sload, IrType::Double, GroupKind::Scalar).with_aux(IrAux::Slot(1)));
        let len_node = t.push(IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar));
        let sum = t.push(
            IRNode::new(IrOpcode::Arith(ArithOp::Add), IrType::Double, GroupKind::Map)
                .with_operands(Some(a), Some(b), None)
                .with_shape(Shape::plain(len_node)),
        );
        // `sum` only becomes live/register-assigned by being exported
        // somewhere -- here, a guard exit that always takes its "continue"
        // path, matching how a real closing trace exports its loop-carried
        // values to a side exit.
        let guard = t.push(
            IRNode::new(IrOpcode::Gtrue, IrType::Boxed, GroupKind::Scalar)
                .with_operands(Some(sum), None, None)
                .with_aux(IrAux::GuardDirection(true)),
        );
        let mut snap = Snapshot::default();
        snap.registers.insert(0, sum);
        t.add_exit(guard, snap, 99);
        t.push(IRNode::new(IrOpcode::Loop, IrType::Boxed, GroupKind::Scalar));
        t.push(IRNode::new(IrOpcode::Jmp, IrType::Boxed, GroupKind::Scalar));

        let optimized = optimize(&t);

        let mut codegen = CraneliftCodeGenerator::new().expect("cranelift backend available");
        let compiled = codegen.compile(&t).expect("trace should compile");

        let xs = [1.0f64, 2.0, 3.0, 4.0];
        let ys = [10.0f64, 20.0, 30.0, 40.0];
        let inputs: [*const f64; 2] = [xs.as_ptr(), ys.as_ptr()];
        let reg_count = optimized.live_count.max(1);
        let mut out = vec![0.0f64; reg_count * xs.len()];

        let code = (compiled.entry)(0, xs.len() as u64, inputs.as_ptr(), out.as_mut_ptr());
        assert_eq!(code, u32::MAX as u64);

        let sum_reg = t.nodes[sum].reg.get().expect("sum node got a register") as usize;
        let row = &out[sum_reg * xs.len()..sum_reg * xs.len() + xs.len()];
        assert_eq!(row, [11.0, 22.0, 33.0, 44.0]);
    }

    /// Scenario C, compiled path: a fused `Sum` fold's per-lane accumulator
    /// (threaded as a Cranelift block param around the loop's back-edge)
    /// reaches the same total plain interpretation would, written to
    /// `out[reg*len + 0]` once the loop reaches `done`.
    #[test]
    fn compiles_a_fused_sum_fold_loop() {
        use crate::bytecode::instr::FoldOp;

        let mut t = Trace::new();
        let a = t.push(IRNode::new(IrOpcode::Sload, IrType::Double, GroupKind::Scalar).with_aux(IrAux::Slot(0)));
        let len_node = t.push(IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar));
        let sum = t.push(
            IRNode::new(IrOpcode::Fold(FoldOp::Sum), IrType::Double, GroupKind::Fold)
                .with_operands(Some(a), None, None)
                .with_shape(Shape::plain(len_node)),
        );
        let guard = t.push(
            IRNode::new(IrOpcode::Gtrue, IrType::Boxed, GroupKind::Scalar)
                .with_operands(Some(sum), None, None)
                .with_aux(IrAux::GuardDirection(true)),
        );
        let mut snap = Snapshot::default();
        snap.registers.insert(0, sum);
        t.add_exit(guard, snap, 99);
        t.push(IRNode::new(IrOpcode::Loop, IrType::Boxed, GroupKind::Scalar));
        t.push(IRNode::new(IrOpcode::Jmp, IrType::Boxed, GroupKind::Scalar));

        let optimized = optimize(&t);

        let mut codegen = CraneliftCodeGenerator::new().expect("cranelift backend available");
        let compiled = codegen.compile(&t).expect("trace should compile");

        let xs = [1.0f64, 2.0, 3.0, 4.0];
        let inputs: [*const f64; 1] = [xs.as_ptr()];
        let reg_count = optimized.live_count.max(1);
        let mut out = vec![0.0f64; reg_count * xs.len()];

        let code = (compiled.entry)(0, xs.len() as u64, inputs.as_ptr(), out.as_mut_ptr());
        assert_eq!(code, u32::MAX as u64);

        let sum_reg = t.nodes[sum].reg.get().expect("sum node got a register") as usize;
        assert_eq!(out[sum_reg * xs.len()], 10.0);
    }
}
