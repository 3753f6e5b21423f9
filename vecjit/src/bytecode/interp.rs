//! Register-based, threaded-dispatch bytecode interpreter.
//!
//! The interpreter owns a flat register file (`registers`), a moving
//! `base` into it per call, and a call stack of [`Frame`]s. On a hot
//! back-edge it can hand control to the trace recorder (see
//! [`crate::trace::recorder`]); this module stays usable standalone,
//! with tracing entirely optional.

use super::calling::{match_arguments, Actual, NameResolver};
use super::frame::{is_closure_safe, Frame};
use super::instr::{ArithOp, Coercion, CompareOp, FoldOp, Instr, LogicalOp};
use crate::env::{EnvArena, EnvId};
use crate::error::{VResult, VecjitError};
use crate::proto::{FunctionValue, Promise, PromiseArena, Prototype};
use crate::value::{is_na_double, na_double, CoerceTo, Sym, Value, Vector, NA_INTEGER, NA_LOGICAL};
use std::rc::Rc;

/// Minimum, width-aligned operand length that makes a vector op a
/// "recordable" hot-path site. `W` is a tunable SIMD-lane count; the
/// W-alignment check is preserved regardless of its exact value.
pub const SIMD_WIDTH: usize = 4;
pub const HOT_LENGTH_THRESHOLD: usize = SIMD_WIDTH * 16;

/// What a handler wants the dispatch loop to do next.
#[derive(Debug)]
pub enum Control {
    /// Fall through to the next instruction.
    Next,
    /// Jump to an absolute bytecode index within the current prototype.
    Jump(usize),
    /// Return from the current frame with this value.
    Return(Value),
    /// A hot back-edge or hot arith site was observed; the caller (the
    /// outer `run` loop) should attempt to start/continue trace recording
    /// at this absolute bytecode index.
    HotSite(usize),
}

pub struct Interp {
    pub envs: EnvArena,
    pub promises: PromiseArena,
    pub registers: Vec<Value>,
    pub base: usize,
    pub frames: Vec<Frame>,
    pub pc: usize,
    pub proto: Rc<Prototype>,
    pub cur_env: EnvId,
    pub warnings: Vec<String>,
    /// Per-(prototype, pc) hit counters driving hot-loop detection. Keyed
    /// by pointer identity of the prototype plus its pc, flattened to a
    /// single u64 so it can live in one hash map. This is consulted on
    /// every back-edge, so it uses `rustc_hash`'s non-cryptographic hasher
    /// rather than the stdlib's DoS-resistant (and slower) default.
    hit_counts: rustc_hash::FxHashMap<(usize, usize), u32>,
    /// Installed traces, keyed the same way as `hit_counts`: one compiled
    /// native function per (prototype, loop-header pc) that has closed and
    /// compiled successfully. Consulted before recording runs again.
    #[cfg(feature = "jit")]
    compiled_traces: rustc_hash::FxHashMap<(usize, usize), (crate::ir::Trace, crate::codegen::CompiledTrace)>,
    /// Composes `generic`+class into a bound method, see [`MethodResolver`].
    pub method_resolver: Box<dyn MethodResolver>,
}

/// A resolved `UseMethod` dispatch: the function to call, plus the
/// `.Generic`/`.Method`/`.Class` bindings to install in its environment.
pub struct MethodMatch {
    pub function: FunctionValue,
    pub bindings: Vec<(Sym, Value)>,
}

/// Resolves `UseMethod`: given the generic's symbol and the first
/// argument's class vector, search `generic.class[0]`, then
/// `generic.default`. Composing `"generic.class"` into a symbol requires
/// the (external) string-interning table, so actual resolution is supplied
/// by the embedder; the bare interpreter ships [`NoMethodResolver`], which
/// always reports no method.
pub trait MethodResolver {
    fn resolve(&self, interp: &Interp, generic: Sym, class: &[Sym]) -> Option<MethodMatch>;
}

pub struct NoMethodResolver;
impl MethodResolver for NoMethodResolver {
    fn resolve(&self, _interp: &Interp, _generic: Sym, _class: &[Sym]) -> Option<MethodMatch> {
        None
    }
}

/// Trivial resolver used where the front-end hasn't wired up real prefix
/// matching; treats every name as non-prefix-matching. Real embedders
/// supply their own, backed by the string-interning table.
pub struct NoPrefixResolver;
impl NameResolver for NoPrefixResolver {
    fn is_prefix(&self, _prefix: crate::value::Sym, _full: crate::value::Sym) -> bool {
        false
    }
}

impl Interp {
    pub fn new(proto: Rc<Prototype>) -> Self {
        let mut envs = EnvArena::new();
        let root = envs.create(None);
        let register_count = proto.register_count;
        Interp {
            envs,
            promises: PromiseArena::new(),
            registers: vec![Value::Null; register_count],
            base: 0,
            frames: Vec::new(),
            pc: 0,
            proto,
            cur_env: root,
            warnings: Vec::new(),
            hit_counts: rustc_hash::FxHashMap::default(),
            #[cfg(feature = "jit")]
            compiled_traces: rustc_hash::FxHashMap::default(),
            method_resolver: Box::new(NoMethodResolver),
        }
    }

    fn reg(&self, r: usize) -> Value {
        self.registers[self.base + r].clone()
    }

    fn set_reg(&mut self, r: usize, v: Value) {
        let idx = self.base + r;
        if idx >= self.registers.len() {
            self.registers.resize(idx + 1, Value::Null);
        }
        self.registers[idx] = v;
    }

    fn is_truthy(v: &Value) -> VResult<bool> {
        match v {
            Value::Logical(l) if l.len() == 1 => {
                let b = l.as_slice()[0];
                if b == NA_LOGICAL {
                    Err(VecjitError::TypeError {
                        expected: "TRUE/FALSE (not NA)".into(),
                        got: "NA".into(),
                    })
                } else {
                    Ok(b != 0)
                }
            }
            other if other.length() == 0 => Err(VecjitError::LengthError {
                op: "if",
                a_len: 0,
                b_len: 0,
            }),
            other => {
                let coerced: Vector<u8> = other.coerce()?;
                Ok(coerced.as_slice()[0] != 0)
            }
        }
    }

    /// Ensure threaded bytecode exists for the current prototype, building
    /// it on first entry.
    fn ensure_threaded(&self) {
        if self.proto.threaded.borrow().is_none() {
            let table = super::dispatch::thread_bytecode(&self.proto.bytecode);
            *self.proto.threaded.borrow_mut() = Some(table);
        }
    }

    /// Run the current prototype's bytecode to completion (a `ret` or
    /// `done`), threaded-dispatching each instruction. Returns the
    /// produced value, or propagates an error after unwinding this frame.
    pub fn run(&mut self) -> VResult<Value> {
        self.ensure_threaded();
        loop {
            let bytecode_len = self.proto.bytecode.len();
            if self.pc >= bytecode_len {
                return Ok(Value::Null);
            }
            let instr = self.proto.bytecode[self.pc].clone_shallow();
            let threaded = self.proto.threaded.borrow();
            let handler = threaded.as_ref().unwrap()[self.pc].handler;
            drop(threaded);
            let control = handler(self, &instr)?;
            match control {
                Control::Next => self.pc += 1,
                Control::Jump(target) => self.pc = target,
                Control::Return(v) => return Ok(v),
                Control::HotSite(at) => {
                    // The pc the loop would fall through to if it simply
                    // ran out of elements under plain interpretation (what
                    // `Control::Next` from this same instruction means).
                    let fallthrough = self.pc + 1;
                    #[cfg(feature = "jit")]
                    {
                        self.pc = self.enter_hot_site(at, fallthrough)?;
                    }
                    #[cfg(not(feature = "jit"))]
                    {
                        let _ = fallthrough;
                        self.pc = at;
                    }
                }
            }
        }
    }

    /// Handle a hot back-edge: dispatch into an already-installed compiled
    /// trace, or record+optimize+compile+install a new one. Either way
    /// returns the pc execution should resume at; recording/codegen
    /// failures just fall back to plain interpretation at `at`, same as
    /// the non-`jit` build does unconditionally.
    #[cfg(feature = "jit")]
    fn enter_hot_site(&mut self, at: usize, fallthrough: usize) -> VResult<usize> {
        let key = (Rc::as_ptr(&self.proto) as usize, at);
        if self.compiled_traces.contains_key(&key) {
            return Ok(self.run_compiled_trace(&key, fallthrough));
        }

        let outcome = crate::trace::Recorder::new(at, crate::trace::RecordBudget::default()).record(self);
        match outcome {
            crate::trace::RecordOutcome::Closed { trace, header_pc } => {
                let optimized = crate::trace::optimize(&trace);
                if let Ok(mut codegen) = crate::codegen::cranelift::CraneliftCodeGenerator::new() {
                    use crate::codegen::CodeGenerator;
                    if let Ok(compiled) = codegen.compile_trace(&trace, &optimized) {
                        let key = (Rc::as_ptr(&self.proto) as usize, header_pc);
                        self.compiled_traces.insert(key, (trace, compiled));
                    }
                }
                // Recording already drove this iteration through the real
                // handlers (see `crate::trace::recorder`'s shadow-execution
                // invariant), so the interpreter's own state is already
                // wherever plain interpretation would have left it -- just
                // keep going from there exactly like an ordinary back edge.
                Ok(at)
            }
            crate::trace::RecordOutcome::Aborted { resume_pc, .. } => Ok(resume_pc),
        }
    }

    /// Call an installed trace's native entry point over the sequence its
    /// inputs are bound to, then splice its result back into the register
    /// file. Returns the pc execution resumes at. Collects everything it
    /// needs out of the cached `(Trace, CompiledTrace)` up front so the
    /// borrow on `compiled_traces` ends before any `self.reg`/`set_reg`
    /// call, which both need `&mut self`/`&self` on the whole interpreter.
    #[cfg(feature = "jit")]
    fn run_compiled_trace(&mut self, key: &(usize, usize), fallthrough: usize) -> usize {
        // Whether a register's row in `out` is a single accumulated scalar
        // (a `Fold`, written once at column 0 after the loop) or one value
        // per iteration (everything else `build_body` stores, written to
        // column `i` on every pass -- see `store_row`).
        struct RegPlan {
            reg: usize,
            slot: u32,
            is_fold: bool,
        }
        struct ExitPlan {
            resume_pc: usize,
            regs: Vec<RegPlan>,
        }

        let (entry_fn, input_slots, live_count, completion_plan, exit_plans) = {
            let (trace, compiled) = &self.compiled_traces[key];
            let reg_plan_for = |reg: usize, node: crate::ir::IrRef| -> Option<RegPlan> {
                trace.nodes[node].reg.get().map(|slot| RegPlan {
                    reg,
                    slot,
                    is_fold: matches!(trace.nodes[node].group, crate::ir::GroupKind::Fold),
                })
            };
            // A guard's snapshot is taken from the recorder's full `reg_map`,
            // which by construction holds every register written up to that
            // point -- not just the trace's own inputs. Any guard's snapshot
            // is therefore as good a source as any for "what's live when the
            // loop falls off the end without tripping a guard"; fall back to
            // the entry snapshot for a guardless trace (nothing computed in
            // the body was ever exported, so there is nothing to splice back
            // beyond the inputs themselves).
            let completion_plan: Vec<RegPlan> = trace
                .exits
                .last()
                .map(|exit| &exit.snapshot.registers)
                .unwrap_or(&trace.entry.registers)
                .iter()
                .filter_map(|(&reg, &node)| reg_plan_for(reg, node))
                .collect();
            let exit_plans: Vec<ExitPlan> = trace
                .exits
                .iter()
                .map(|exit| ExitPlan {
                    resume_pc: exit.resume_pc,
                    regs: exit
                        .snapshot
                        .registers
                        .iter()
                        .filter_map(|(&reg, &node)| reg_plan_for(reg, node))
                        .collect(),
                })
                .collect();
            let live_count = trace.nodes.iter().filter(|n| n.live.get() && !n.sunk.get()).count().max(1);
            (compiled.entry, compiled.input_slots.clone(), live_count, completion_plan, exit_plans)
        };

        let inputs: Vec<*const f64> = input_slots
            .iter()
            .map(|&reg| {
                let v = self.reg(reg);
                v.as_double_slice().map(|s| s.as_ptr()).unwrap_or(std::ptr::null())
            })
            .collect();
        let seq_len = input_slots.first().map(|&reg| self.reg(reg).length()).unwrap_or(0);
        if seq_len == 0 || inputs.iter().any(|p| p.is_null()) {
            // Can't safely dispatch (an input isn't a plain double vector
            // after all, or there's nothing to iterate); fall back to
            // plain interpretation at the loop header.
            return key.1;
        }

        let mut out = vec![0.0f64; live_count * seq_len];
        let code = entry_fn(0, seq_len as u64, inputs.as_ptr(), out.as_mut_ptr());

        if code == u32::MAX as u64 {
            // Ran to completion: splice back whichever registers were live
            // going into the loop body (see `completion_plan` above). A
            // fold collapsed to one value, written at column 0; anything
            // else is the fused elementwise result, one value per column.
            for plan in completion_plan {
                let row = &out[plan.slot as usize * seq_len..plan.slot as usize * seq_len + seq_len];
                let value = if plan.is_fold {
                    Value::scalar_double(row[0])
                } else {
                    Value::Double(Vector::from_vec(row.to_vec()))
                };
                self.set_reg(plan.reg, value);
            }
            return fallthrough;
        }

        // A side exit fires mid-loop, at a specific iteration: everything
        // but a fold has a valid value for columns `0..=iter_at_exit` only
        // (later columns were never reached), and a fold's accumulator is
        // never written to `out` at all on this path (only the `done`
        // block after a full run does that) -- there is no way yet to
        // recover a fold's running total from a side exit, so a fold
        // register here keeps whatever the interpreter already held.
        let exit_idx = (code & 0xFFFF_FFFF) as usize;
        let iter_at_exit = (code >> 32) as usize;
        let plan = &exit_plans[exit_idx];
        for reg_plan in &plan.regs {
            if reg_plan.is_fold {
                continue;
            }
            let row_start = reg_plan.slot as usize * seq_len;
            let prefix = out[row_start..row_start + iter_at_exit + 1].to_vec();
            self.set_reg(reg_plan.reg, Value::Double(Vector::from_vec(prefix)));
        }
        plan.resume_pc
    }

    /// Count a visit to a hot-path candidate `pc`; returns `true` once the
    /// site has been seen often enough to be worth recording.
    pub fn note_hot_candidate(&mut self, pc: usize) -> bool {
        let key = (Rc::as_ptr(&self.proto) as usize, pc);
        let count = self.hit_counts.entry(key).or_insert(0);
        *count += 1;
        *count >= 2
    }

    /// Call a function value with already-evaluated actuals. Builds a
    /// fresh callee environment, applies the argument-matching algorithm,
    /// runs the callee prototype to completion, and recycles the callee
    /// environment onto the conceptual free list when it is closure-safe.
    pub fn call(&mut self, func: &FunctionValue, actuals: &[Actual]) -> VResult<Value> {
        let proto = func.proto.clone();
        let callee_env = self.envs.create(Some(func.captured_env));

        let matched = match_arguments(
            &proto.param_names,
            proto.dots_index,
            actuals,
            &NoPrefixResolver,
        );

        for (i, &pname) in proto.param_names[..proto.dots_index.min(proto.param_names.len())]
            .iter()
            .enumerate()
        {
            let value = match &matched.bound[i] {
                Some(v) => v.clone(),
                None => match &proto.defaults[i] {
                    Some(default) => {
                        let default_proto = proto.children[default.proto as usize].clone();
                        let id = self.promises.create(default_proto, callee_env);
                        Value::Promise(id)
                    }
                    None => {
                        return Err(VecjitError::Arity {
                            fn_name: proto.expr_source.clone(),
                            given: actuals.len(),
                            expected: proto.dots_index,
                        })
                    }
                },
            };
            self.envs.get_mut(callee_env).assign(pname, value);
        }
        self.envs.get_mut(callee_env).dots = matched.dots;

        // Swap in the callee as "current" execution context, recursing
        // into a nested run. A stack-unwind on error restores `base` and
        // the caller's env/proto via the frame we push here.
        let saved_proto = self.proto.clone();
        let saved_env = self.cur_env;
        let saved_pc = self.pc;
        let saved_base = self.base;

        self.frames.push(Frame {
            env: callee_env,
            owns_env: true,
            proto: proto.clone(),
            return_pc: saved_pc,
            return_base: saved_base,
            result_slot: None,
        });
        self.proto = proto;
        self.cur_env = callee_env;
        self.base = self.registers.len();
        self.registers
            .resize(self.base + self.proto.register_count, Value::Null);
        self.pc = 0;

        let result = self.run();

        self.registers.truncate(self.base);
        self.frames.pop();
        self.proto = saved_proto;
        self.cur_env = saved_env;
        self.pc = saved_pc;
        self.base = saved_base;

        let value = result?;
        let _ = is_closure_safe(&value, callee_env); // documents the free-list decision point
        Ok(value)
    }

    /// Like [`Interp::call`], but installs `extra_bindings` (e.g. a
    /// `UseMethod` dispatch's `.Generic`/`.Method`/`.Class`) into the callee
    /// environment before running, after parameters and defaults are bound.
    pub fn call_with_bindings(
        &mut self,
        func: &FunctionValue,
        actuals: &[Actual],
        extra_bindings: &[(Sym, Value)],
    ) -> VResult<Value> {
        let proto = func.proto.clone();
        let callee_env = self.envs.create(Some(func.captured_env));

        let matched = match_arguments(
            &proto.param_names,
            proto.dots_index,
            actuals,
            &NoPrefixResolver,
        );

        for (i, &pname) in proto.param_names[..proto.dots_index.min(proto.param_names.len())]
            .iter()
            .enumerate()
        {
            let value = match &matched.bound[i] {
                Some(v) => v.clone(),
                None => match &proto.defaults[i] {
                    Some(default) => {
                        let default_proto = proto.children[default.proto as usize].clone();
                        let id = self.promises.create(default_proto, callee_env);
                        Value::Promise(id)
                    }
                    None => {
                        return Err(VecjitError::Arity {
                            fn_name: proto.expr_source.clone(),
                            given: actuals.len(),
                            expected: proto.dots_index,
                        })
                    }
                },
            };
            self.envs.get_mut(callee_env).assign(pname, value);
        }
        self.envs.get_mut(callee_env).dots = matched.dots;
        for (name, value) in extra_bindings {
            self.envs.get_mut(callee_env).assign(*name, value.clone());
        }

        let saved_proto = self.proto.clone();
        let saved_env = self.cur_env;
        let saved_pc = self.pc;
        let saved_base = self.base;

        self.frames.push(Frame {
            env: callee_env,
            owns_env: true,
            proto: proto.clone(),
            return_pc: saved_pc,
            return_base: saved_base,
            result_slot: None,
        });
        self.proto = proto;
        self.cur_env = callee_env;
        self.base = self.registers.len();
        self.registers
            .resize(self.base + self.proto.register_count, Value::Null);
        self.pc = 0;

        let result = self.run();

        self.registers.truncate(self.base);
        self.frames.pop();
        self.proto = saved_proto;
        self.cur_env = saved_env;
        self.pc = saved_pc;
        self.base = saved_base;

        let value = result?;
        let _ = is_closure_safe(&value, callee_env);
        Ok(value)
    }

    /// Force a promise, memoizing its value so a second force is a cache
    /// hit rather than a re-evaluation. No-op (beyond the clone) if the
    /// promise is already forced.
    pub fn force_promise(&mut self, id: crate::proto::PromiseId) -> VResult<Value> {
        if let Promise::Forced(v) = self.promises.get(id) {
            return Ok(v.clone());
        }
        let (proto, env) = match self.promises.get(id) {
            Promise::Unforced { proto, env } => (proto.clone(), *env),
            Promise::Forced(_) => unreachable!(),
        };
        let value = self.eval_prototype_in_env(proto, env)?;
        self.promises.set_forced(id, value.clone());
        Ok(value)
    }

    /// Run `proto` to completion in the already-built environment `env`,
    /// without creating a fresh callee environment or matching arguments.
    /// Used to evaluate a promise's default-expression prototype in the
    /// environment it was captured with. Mirrors [`Interp::call`]'s
    /// save/restore of the outer execution context.
    fn eval_prototype_in_env(&mut self, proto: Rc<Prototype>, env: EnvId) -> VResult<Value> {
        let saved_proto = self.proto.clone();
        let saved_env = self.cur_env;
        let saved_pc = self.pc;
        let saved_base = self.base;

        self.frames.push(Frame {
            env,
            owns_env: false,
            proto: proto.clone(),
            return_pc: saved_pc,
            return_base: saved_base,
            result_slot: None,
        });
        self.proto = proto;
        self.cur_env = env;
        self.base = self.registers.len();
        self.registers
            .resize(self.base + self.proto.register_count, Value::Null);
        self.pc = 0;

        let result = self.run();

        self.registers.truncate(self.base);
        self.frames.pop();
        self.proto = saved_proto;
        self.cur_env = saved_env;
        self.pc = saved_pc;
        self.base = saved_base;

        result
    }

}

impl Instr {
    /// Shallow clone for the dispatch loop (avoids holding a borrow of
    /// `self.proto.bytecode` across the handler call while it may itself
    /// need to read other instructions, e.g. jump targets).
    fn clone_shallow(&self) -> Instr {
        self.clone()
    }
}

// ---- Opcode handlers. Each has the exact `Handler` signature so the
// threaded-dispatch table can store them directly as function pointers. ----

pub fn op_kget(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Kget { dst, const_idx } = instr else {
        unreachable!()
    };
    let v = me.proto.constants[*const_idx].clone();
    me.set_reg(*dst, v);
    Ok(Control::Next)
}

pub fn op_iget(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Iget { dst, name } = instr else {
        unreachable!()
    };
    let v = me.envs.find_in_chain(me.cur_env, *name)?;
    let v = force_on_read(me, *name, v)?;
    me.set_reg(*dst, v);
    Ok(Control::Next)
}

pub fn op_get(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Get { dst, name, cache } = instr else {
        unreachable!()
    };
    let mut ptr = *cache;
    let value = match &mut ptr {
        Some(p) if p.env == me.cur_env => {
            let v = me.envs.get_by_pointer(p);
            if let Value::Promise(id) = v {
                let forced = me.force_promise(id)?;
                me.envs.assign_by_pointer(p, forced.clone());
                forced
            } else {
                v
            }
        }
        _ => {
            let v = me.envs.find_in_chain(me.cur_env, *name)?;
            let v = force_on_read(me, *name, v)?;
            if let Some(fresh) = me.envs.get(me.cur_env).make_pointer(me.cur_env, *name) {
                ptr = Some(fresh);
            }
            v
        }
    };
    me.set_reg(*dst, value);
    Ok(Control::Next)
}

/// A variable whose bound value is an unforced promise evaluates it here,
/// on first read, and memoizes the result back into the reading
/// environment -- matching how default-argument promises are always bound
/// directly in the frame that reads them.
fn force_on_read(me: &mut Interp, name: crate::value::Sym, v: Value) -> VResult<Value> {
    let Value::Promise(id) = v else { return Ok(v) };
    let value = me.force_promise(id)?;
    me.envs.get_mut(me.cur_env).assign(name, value.clone());
    Ok(value)
}

pub fn op_assign(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Assign { name, src, .. } = instr else {
        unreachable!()
    };
    let v = me.reg(*src);
    me.envs.get_mut(me.cur_env).assign(*name, v);
    Ok(Control::Next)
}

pub fn op_iassign(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Iassign { name, src } = instr else {
        unreachable!()
    };
    let v = me.reg(*src);
    me.envs.get_mut(me.cur_env).assign(*name, v);
    Ok(Control::Next)
}

pub fn op_eassign(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Eassign { target, index, src } = instr else {
        unreachable!()
    };
    let idx_val = me.reg(*index);
    let idx: Vector<i64> = idx_val.coerce()?;
    let i = idx.as_slice()[0];
    let src_val = me.reg(*src);
    let mut obj = me.reg(*target);
    set_element(&mut obj, i, &src_val)?;
    me.set_reg(*target, obj);
    Ok(Control::Next)
}

fn set_element(obj: &mut Value, index1: i64, value: &Value) -> VResult<()> {
    if index1 < 1 {
        return Err(VecjitError::OutOfBounds {
            index: index1,
            length: obj.length(),
        });
    }
    let i = (index1 - 1) as usize;
    match obj {
        Value::Double(v) => {
            let scalar: Vector<f64> = value.coerce()?;
            if i >= v.len() {
                return Err(VecjitError::OutOfBounds {
                    index: index1,
                    length: v.len(),
                });
            }
            v.as_mut_slice()[i] = scalar.as_slice()[0];
        }
        Value::Integer(v) => {
            let scalar: Vector<i64> = value.coerce()?;
            if i >= v.len() {
                return Err(VecjitError::OutOfBounds {
                    index: index1,
                    length: v.len(),
                });
            }
            v.as_mut_slice()[i] = scalar.as_slice()[0];
        }
        _ => {
            return Err(VecjitError::TypeError {
                expected: "numeric vector".into(),
                got: obj.vtype().name().into(),
            })
        }
    }
    Ok(())
}

pub fn op_jmp(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Jmp { target } = instr else {
        unreachable!()
    };
    Ok(Control::Jump((me.pc as isize + *target) as usize))
}

pub fn op_jt(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Jt { cond, target } = instr else {
        unreachable!()
    };
    let v = me.reg(*cond);
    if Interp::is_truthy(&v)? {
        Ok(Control::Jump((me.pc as isize + *target) as usize))
    } else {
        Ok(Control::Next)
    }
}

pub fn op_jf(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Jf { cond, target } = instr else {
        unreachable!()
    };
    let v = me.reg(*cond);
    if !Interp::is_truthy(&v)? {
        Ok(Control::Jump((me.pc as isize + *target) as usize))
    } else {
        Ok(Control::Next)
    }
}

pub fn op_forbegin(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::ForBegin {
        iter,
        var,
        pos,
        end_target,
    } = instr
    else {
        unreachable!()
    };
    let seq = me.reg(*iter);
    if seq.length() == 0 {
        return Ok(Control::Jump((me.pc as isize + *end_target) as usize));
    }
    let first = index_scalar(&seq, 0)?;
    me.set_reg(*var, first);
    me.set_reg(*pos, Value::scalar_integer(0));
    Ok(Control::Next)
}

pub fn op_forend(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::ForEnd {
        iter,
        var,
        pos,
        body_target,
    } = instr
    else {
        unreachable!()
    };
    let seq = me.reg(*iter);
    let cur_pos = me.reg(*pos);
    let pos_idx: Vector<i64> = cur_pos.coerce().unwrap_or_else(|_| Vector::scalar(0));
    let next_idx = pos_idx.as_slice()[0] as usize;
    if next_idx + 1 >= seq.length() {
        return Ok(Control::Next); // loop exhausted, fall through
    }
    let next = index_scalar(&seq, next_idx + 1)?;
    me.set_reg(*var, next);
    me.set_reg(*pos, Value::scalar_integer((next_idx + 1) as i64));

    // Back-edge: a qualifying candidate for trace recording if the
    // sequence itself is a wide, width-aligned numeric vector.
    let len = seq.length();
    if len > HOT_LENGTH_THRESHOLD && len % SIMD_WIDTH == 0 {
        let target = (me.pc as isize + *body_target) as usize;
        if me.note_hot_candidate(me.pc) {
            return Ok(Control::HotSite(target));
        }
    }
    Ok(Control::Jump((me.pc as isize + *body_target) as usize))
}

fn index_scalar(v: &Value, i: usize) -> VResult<Value> {
    match v {
        Value::Integer(vec) => Ok(Value::scalar_integer(vec.as_slice()[i])),
        Value::Double(vec) => Ok(Value::scalar_double(vec.as_slice()[i])),
        Value::Logical(vec) => Ok(Value::scalar_logical(vec.as_slice()[i])),
        other => Err(VecjitError::TypeError {
            expected: "iterable".into(),
            got: other.vtype().name().into(),
        }),
    }
}

pub fn op_ret(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Ret { value } = instr else {
        unreachable!()
    };
    Ok(Control::Return(me.reg(*value)))
}

pub fn op_done(_me: &mut Interp, _instr: &Instr) -> VResult<Control> {
    Ok(Control::Return(Value::Null))
}

pub fn op_subset(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Subset { dst, obj, index } = instr else {
        unreachable!()
    };
    let obj_v = me.reg(*obj);
    let idx_v = me.reg(*index);
    let idx: Vector<i64> = idx_v.coerce()?;
    let i1 = idx.as_slice()[0];
    if i1 < 1 || i1 as usize > obj_v.length() {
        return Err(VecjitError::OutOfBounds {
            index: i1,
            length: obj_v.length(),
        });
    }
    let v = index_scalar(&obj_v, (i1 - 1) as usize)?;
    me.set_reg(*dst, v);
    Ok(Control::Next)
}

pub fn op_subset2(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    // `[[`: same semantics as `subset` for atomic vectors in this engine;
    // list element extraction is handled by the (external) standard
    // library layer on top of `Value::List`.
    op_subset(
        me,
        &Instr::Subset {
            dst: match instr {
                Instr::Subset2 { dst, .. } => *dst,
                _ => unreachable!(),
            },
            obj: match instr {
                Instr::Subset2 { obj, .. } => *obj,
                _ => unreachable!(),
            },
            index: match instr {
                Instr::Subset2 { index, .. } => *index,
                _ => unreachable!(),
            },
        },
    )
}

pub fn op_colon(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Colon { dst, from, to } = instr else {
        unreachable!()
    };
    let from: Vector<i64> = me.reg(*from).coerce()?;
    let to: Vector<i64> = me.reg(*to).coerce()?;
    let (a, b) = (from.as_slice()[0], to.as_slice()[0]);
    let v: Vec<i64> = if a <= b { (a..=b).collect() } else { (b..=a).rev().collect() };
    me.set_reg(*dst, Value::Integer(Vector::from_vec(v)));
    Ok(Control::Next)
}

pub fn op_seq(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Seq { dst, from, to, by } = instr else {
        unreachable!()
    };
    let from: Vector<f64> = me.reg(*from).coerce()?;
    let to: Vector<f64> = me.reg(*to).coerce()?;
    let by: Vector<f64> = me.reg(*by).coerce()?;
    let (a, b, step) = (from.as_slice()[0], to.as_slice()[0], by.as_slice()[0]);
    let mut out = Vec::new();
    if step > 0.0 {
        let mut x = a;
        while x <= b + 1e-9 {
            out.push(x);
            x += step;
        }
    } else if step < 0.0 {
        let mut x = a;
        while x >= b - 1e-9 {
            out.push(x);
            x += step;
        }
    }
    me.set_reg(*dst, Value::Double(Vector::from_vec(out)));
    Ok(Control::Next)
}

fn vec_len_match(op: &'static str, a: usize, b: usize) -> VResult<usize> {
    if a == 0 || b == 0 {
        return Ok(0);
    }
    if a % b != 0 && b % a != 0 {
        return Err(VecjitError::LengthError {
            op,
            a_len: a,
            b_len: b,
        });
    }
    Ok(a.max(b))
}

pub fn op_arith_binary(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::ArithBinary { op, dst, lhs, rhs } = instr else {
        unreachable!()
    };
    let lv = me.reg(*lhs);
    let rv = me.reg(*rhs);
    let result = arith_binary(*op, &lv, &rv)?;
    me.set_reg(*dst, result);

    let (a_len, b_len) = (lv.length(), rv.length());
    if a_len > HOT_LENGTH_THRESHOLD
        && a_len % SIMD_WIDTH == 0
        && b_len > 0
        && a_len % b_len == 0
        && me.note_hot_candidate(me.pc)
    {
        return Ok(Control::HotSite(me.pc));
    }
    Ok(Control::Next)
}

/// Binary arithmetic with integer overflow -> NA (never a trap) and NA
/// propagation at every element.
pub fn arith_binary(op: ArithOp, lhs: &Value, rhs: &Value) -> VResult<Value> {
    use crate::value::coerce::{checked_add_i64, checked_mul_i64, checked_sub_i64};

    if let (Value::Integer(a), Value::Integer(b)) = (lhs, rhs) {
        if matches!(op, ArithOp::Add | ArithOp::Sub | ArithOp::Mul) {
            let len = vec_len_match("arith", a.len(), b.len())?;
            let mut out = Vec::with_capacity(len);
            for i in 0..len {
                let x = *a.recycled(i);
                let y = *b.recycled(i);
                out.push(match op {
                    ArithOp::Add => checked_add_i64(x, y),
                    ArithOp::Sub => checked_sub_i64(x, y),
                    ArithOp::Mul => checked_mul_i64(x, y),
                    _ => unreachable!(),
                });
            }
            return Ok(Value::Integer(Vector::from_vec(out)));
        }
    }

    let a: Vector<f64> = lhs.coerce()?;
    let b: Vector<f64> = rhs.coerce()?;
    let len = vec_len_match("arith", a.len(), b.len())?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let x = *a.recycled(i);
        let y = *b.recycled(i);
        out.push(apply_binary_f64(op, x, y));
    }
    Ok(Value::Double(Vector::from_vec(out)))
}

fn apply_binary_f64(op: ArithOp, x: f64, y: f64) -> f64 {
    if is_na_double(x) || is_na_double(y) {
        return na_double();
    }
    match op {
        ArithOp::Add => x + y,
        ArithOp::Sub => x - y,
        ArithOp::Mul => x * y,
        ArithOp::Div => x / y,
        ArithOp::IDiv => (x / y).floor(),
        ArithOp::Mod => x - y * (x / y).floor(),
        ArithOp::Pow => x.powf(y),
        ArithOp::Atan2 => x.atan2(y),
        ArithOp::Hypot => x.hypot(y),
        ArithOp::Pmin => x.min(y),
        ArithOp::Pmax => x.max(y),
        _ => unreachable!("unary op passed to binary apply"),
    }
}

pub fn op_arith_unary(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::ArithUnary { op, dst, src } = instr else {
        unreachable!()
    };
    let v = me.reg(*src);
    let a: Vector<f64> = v.coerce()?;
    let out: Vec<f64> = a
        .as_slice()
        .iter()
        .map(|&x| {
            if is_na_double(x) {
                na_double()
            } else {
                apply_unary_f64(*op, x)
            }
        })
        .collect();
    me.set_reg(*dst, Value::Double(Vector::from_vec(out)));
    Ok(Control::Next)
}

fn apply_unary_f64(op: ArithOp, x: f64) -> f64 {
    match op {
        ArithOp::Neg => -x,
        ArithOp::Pos => x,
        ArithOp::Abs => x.abs(),
        ArithOp::Sign => x.signum(),
        ArithOp::Sqrt => x.sqrt(),
        ArithOp::Floor => x.floor(),
        ArithOp::Ceiling => x.ceil(),
        ArithOp::Trunc => x.trunc(),
        ArithOp::Exp => x.exp(),
        ArithOp::Log => x.ln(),
        ArithOp::Cos => x.cos(),
        ArithOp::Sin => x.sin(),
        ArithOp::Tan => x.tan(),
        ArithOp::Acos => x.acos(),
        ArithOp::Asin => x.asin(),
        ArithOp::Atan => x.atan(),
        _ => unreachable!("binary op passed to unary apply"),
    }
}

pub fn op_compare(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Compare { op, dst, lhs, rhs } = instr else {
        unreachable!()
    };
    let a: Vector<f64> = me.reg(*lhs).coerce()?;
    let b: Vector<f64> = me.reg(*rhs).coerce()?;
    let len = vec_len_match("compare", a.len(), b.len())?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let (x, y) = (*a.recycled(i), *b.recycled(i));
        out.push(if is_na_double(x) || is_na_double(y) {
            NA_LOGICAL
        } else {
            let r = match op {
                CompareOp::Eq => x == y,
                CompareOp::Neq => x != y,
                CompareOp::Lt => x < y,
                CompareOp::Le => x <= y,
                CompareOp::Gt => x > y,
                CompareOp::Ge => x >= y,
            };
            r as u8
        });
    }
    me.set_reg(*dst, Value::Logical(Vector::from_vec(out)));
    Ok(Control::Next)
}

pub fn op_logical(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Logical { op, dst, lhs, rhs } = instr else {
        unreachable!()
    };
    let a: Vector<u8> = me.reg(*lhs).coerce()?;
    if *op == LogicalOp::Not {
        let out: Vec<u8> = a
            .as_slice()
            .iter()
            .map(|&x| if x == NA_LOGICAL { NA_LOGICAL } else { (x == 0) as u8 })
            .collect();
        me.set_reg(*dst, Value::Logical(Vector::from_vec(out)));
        return Ok(Control::Next);
    }
    let rhs = rhs.expect("and/or always carry an rhs");
    let b: Vector<u8> = me.reg(rhs).coerce()?;
    let len = vec_len_match("logical", a.len(), b.len())?;
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let (x, y) = (*a.recycled(i), *b.recycled(i));
        // Short-circuit masking: a determined value can settle the result
        // even when the other operand is NA.
        let bit = match op {
            LogicalOp::And => {
                if x == 0 || y == 0 {
                    Some(0)
                } else if x == NA_LOGICAL || y == NA_LOGICAL {
                    None
                } else {
                    Some(1)
                }
            }
            LogicalOp::Or => {
                if x == 1 || y == 1 {
                    Some(1)
                } else if x == NA_LOGICAL || y == NA_LOGICAL {
                    None
                } else {
                    Some(0)
                }
            }
            LogicalOp::Not => unreachable!(),
        };
        out.push(bit.unwrap_or(NA_LOGICAL));
    }
    me.set_reg(*dst, Value::Logical(Vector::from_vec(out)));
    Ok(Control::Next)
}

pub fn op_fold(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Fold { op, dst, src } = instr else {
        unreachable!()
    };
    let v = me.reg(*src);
    let result = fold(*op, &v)?;
    me.set_reg(*dst, result);
    Ok(Control::Next)
}

pub fn fold(op: FoldOp, v: &Value) -> VResult<Value> {
    if let (FoldOp::Sum, Value::Integer(vec)) = (op, v) {
        let mut acc: i64 = 0;
        let mut na = false;
        for &x in vec.as_slice() {
            if x == NA_INTEGER {
                na = true;
                break;
            }
            acc = acc.wrapping_add(x);
        }
        return Ok(Value::scalar_integer(if na { NA_INTEGER } else { acc }));
    }
    let a: Vector<f64> = v.coerce()?;
    let xs = a.as_slice();
    let identity = match op {
        FoldOp::Sum | FoldOp::Length | FoldOp::Any => 0.0,
        FoldOp::Prod | FoldOp::All => 1.0,
        FoldOp::Min => f64::INFINITY,
        FoldOp::Max => f64::NEG_INFINITY,
        FoldOp::Mean | FoldOp::Cm2 => 0.0,
    };
    let mut acc = identity;
    let mut n = 0u64;
    let mut mean = 0.0;
    let mut cm2 = 0.0;
    for &x in xs {
        if is_na_double(x) {
            return Ok(Value::scalar_double(na_double()));
        }
        n += 1;
        match op {
            FoldOp::Sum => acc += x,
            FoldOp::Prod => acc *= x,
            FoldOp::Min => acc = acc.min(x),
            FoldOp::Max => acc = acc.max(x),
            FoldOp::All => acc = if x != 0.0 && acc != 0.0 { 1.0 } else { 0.0 },
            FoldOp::Any => acc = if x != 0.0 || acc != 0.0 { 1.0 } else { 0.0 },
            FoldOp::Length => acc += 1.0,
            FoldOp::Mean | FoldOp::Cm2 => {
                // Welford's online recurrence: the per-tile (n, mean, cm2)
                // triple the parallel merge combines.
                let delta = x - mean;
                mean += delta / n as f64;
                cm2 += delta * (x - mean);
            }
        }
    }
    match op {
        FoldOp::Mean => Ok(Value::scalar_double(mean)),
        FoldOp::Cm2 => Ok(Value::scalar_double(cm2)),
        _ => Ok(Value::scalar_double(acc)),
    }
}

pub fn op_scan(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Scan { op, dst, src } = instr else {
        unreachable!()
    };
    let a: Vector<f64> = me.reg(*src).coerce()?;
    let xs = a.as_slice();
    let mut out = Vec::with_capacity(xs.len());
    let mut acc = match op {
        FoldOp::Sum | FoldOp::Length | FoldOp::Any => 0.0,
        FoldOp::Prod | FoldOp::All => 1.0,
        FoldOp::Min => f64::INFINITY,
        FoldOp::Max => f64::NEG_INFINITY,
        FoldOp::Mean | FoldOp::Cm2 => 0.0,
    };
    for &x in xs {
        if is_na_double(x) {
            out.push(na_double());
            continue;
        }
        acc = match op {
            FoldOp::Sum => acc + x,
            FoldOp::Prod => acc * x,
            FoldOp::Min => acc.min(x),
            FoldOp::Max => acc.max(x),
            FoldOp::All => {
                if x != 0.0 && acc != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            FoldOp::Any => {
                if x != 0.0 || acc != 0.0 {
                    1.0
                } else {
                    0.0
                }
            }
            FoldOp::Length => acc + 1.0,
            FoldOp::Mean | FoldOp::Cm2 => acc, // not defined as scans; left as running sum
        };
        out.push(acc);
    }
    me.set_reg(*dst, Value::Double(Vector::from_vec(out)));
    Ok(Control::Next)
}

pub fn op_call(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Call {
        dst,
        callee,
        args_reg,
        ..
    } = instr
    else {
        unreachable!()
    };
    let callee_v = me.reg(*callee);
    let Value::Function(f) = callee_v else {
        return Err(VecjitError::NonFunctionCall(callee_v.vtype().name().into()));
    };
    let actuals = match args_reg {
        Some(r) => args_from_register(me, *r)?,
        None => Vec::new(),
    };
    let result = me.call(&f, &actuals)?;
    me.set_reg(*dst, result);
    Ok(Control::Next)
}

fn args_from_register(me: &Interp, r: usize) -> VResult<Vec<Actual>> {
    match me.reg(r) {
        Value::List(items) => Ok(items
            .as_slice()
            .iter()
            .map(|v| Actual {
                name: None,
                value: (**v).clone(),
            })
            .collect()),
        other => Ok(vec![Actual {
            name: None,
            value: other,
        }]),
    }
}

pub fn op_use_method(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::UseMethod {
        dst,
        generic,
        first_arg,
    } = instr
    else {
        unreachable!()
    };
    let arg = me.reg(*first_arg);
    let class: Vec<Sym> = match &arg {
        Value::Object { class, .. } => class.as_slice().to_vec(),
        _ => Vec::new(),
    };
    let resolver = std::mem::replace(&mut me.method_resolver, Box::new(NoMethodResolver));
    let resolved = resolver.resolve(me, *generic, &class);
    me.method_resolver = resolver;

    let class_for_error = class.first().map(|c| format!("<sym {c}>")).unwrap_or_default();
    let MethodMatch { function, bindings } = resolved.ok_or_else(|| VecjitError::NoMethod {
        generic: format!("<sym {generic}>"),
        class: class_for_error,
    })?;

    let actuals = vec![Actual {
        name: None,
        value: arg,
    }];
    let result = me.call_with_bindings(&function, &actuals, &bindings)?;
    me.set_reg(*dst, result);
    Ok(Control::Next)
}

pub fn op_make_function(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::MakeFunction { dst, child_proto } = instr else {
        unreachable!()
    };
    let child = me.proto.children[*child_proto].clone();
    let f = FunctionValue {
        proto: child,
        captured_env: me.cur_env,
    };
    me.set_reg(*dst, Value::Function(f));
    Ok(Control::Next)
}

pub fn op_coerce(me: &mut Interp, instr: &Instr) -> VResult<Control> {
    let Instr::Coerce { kind, dst, src } = instr else {
        unreachable!()
    };
    let v = me.reg(*src);
    let out = match kind {
        Coercion::Double => Value::Double(v.coerce()?),
        Coercion::Integer => Value::Integer(v.coerce()?),
        Coercion::Logical => Value::Logical(v.coerce()?),
        Coercion::Character | Coercion::Raw | Coercion::Type => {
            return Err(VecjitError::TypeError {
                expected: "coercible type".into(),
                got: v.vtype().name().into(),
            })
        }
    };
    me.set_reg(*dst, out);
    Ok(Control::Next)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Scenario C (interpreter side): `sum(1:1000)` is an integer sum,
    /// taking the integer-accumulator branch of `fold` rather than the
    /// coerce-to-double path every other fold kind uses.
    #[test]
    fn sum_fold_over_integers_matches_scenario_c() {
        let xs: Vec<i64> = (1..=1000).collect();
        let v = Value::Integer(Vector::from_vec(xs));
        let result = fold(FoldOp::Sum, &v).expect("sum should not error");
        assert_eq!(result.as_integer_slice().unwrap(), &[500500]);
    }

    #[test]
    fn sum_fold_short_circuits_on_na() {
        let v = Value::Integer(Vector::from_vec(vec![1, NA_INTEGER, 3]));
        let result = fold(FoldOp::Sum, &v).expect("fold itself does not error on NA");
        assert_eq!(result.as_integer_slice().unwrap(), &[NA_INTEGER]);
    }
}
