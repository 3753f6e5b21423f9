//! A register-based, threaded-dispatch bytecode interpreter paired with a
//! tracing JIT: hot loops are recorded into a linear SSA-like IR, optimized
//! (liveness, sinking, fusion grouping, register assignment), and -- when
//! the `jit` feature is enabled -- compiled to native code with Cranelift.
//! A trace that can't be represented simply keeps running under the
//! interpreter; this crate never requires the JIT to succeed.
//!
//! # Modules
//!
//! - [`bytecode`]: the instruction set, threaded dispatch, calling
//!   convention, and the interpreter loop.
//! - [`value`]: the dynamically-typed value model (scalars, vectors, NA).
//! - [`env`]: variable scopes and the inline-cache pointer protocol.
//! - [`proto`]: prototypes, call sites, and the default-argument promise
//!   arena.
//! - [`ir`]: the trace IR: nodes, shapes, snapshots, exits.
//! - [`trace`]: the recorder and the trace optimizer passes.
//! - [`codegen`]: native code generation for an optimized trace.
//! - [`concurrency`]: the `doall` tiling primitive and per-thread
//!   accumulator banks JITed reductions and maps dispatch work to.
//! - [`error`]: the crate's unified error type.

pub mod bytecode;
pub mod codegen;
pub mod concurrency;
pub mod env;
pub mod error;
pub mod ir;
pub mod proto;
pub mod trace;
pub mod value;

pub use bytecode::{Control, Frame, Instr, Interp};
pub use error::{VResult, VecjitError};
pub use ir::Trace;
pub use proto::Prototype;
pub use trace::{RecordBudget, RecordOutcome, Recorder};
pub use value::Value;

#[cfg(test)]
mod integration_tests {
    use super::*;
    use crate::bytecode::instr::{ArithOp, FoldOp, Instr};
    use crate::value::{Value, Vector};
    use std::rc::Rc;

    fn run_prototype(bytecode: Vec<Instr>, regs: &[(usize, Value)], register_count: usize) -> Interp {
        let proto = Rc::new(Prototype::new("test", vec![], 0, bytecode, register_count));
        let mut interp = Interp::new(proto);
        for (r, v) in regs {
            interp.registers[*r] = v.clone();
        }
        interp.run().expect("plain interpretation should succeed");
        interp
    }

    /// Scenario A (design notes' end-to-end list): a straight-line vector
    /// expression interpreted plainly reaches the same answer a recorded
    /// trace would -- the recorder's core guarantee (property 1) is that
    /// these two paths can never disagree.
    #[test]
    fn plain_interpretation_computes_a_vector_expression() {
        let a = Value::Double(Vector::filled(8, 2.0));
        let b = Value::Double(Vector::filled(8, 3.0));
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
        let interp = run_prototype(bytecode, &[(0, a), (1, b)], 8);
        let result = interp.registers[3].as_double_slice().unwrap().to_vec();
        assert!(result.iter().all(|&x| (x - 8.0).abs() < 1e-12));
    }

    /// Recording the same expression up to its first non-representable
    /// instruction (`ret`) produces IR and leaves the interpreter in
    /// exactly the state plain interpretation would have, at the point
    /// recording stopped -- demonstrated by resuming with `Interp::run`
    /// from the recorder's `resume_pc` and checking the final answer
    /// matches Scenario A bit for bit.
    #[test]
    fn recording_then_resuming_matches_plain_interpretation() {
        let a = Value::Double(Vector::filled(8, 2.0));
        let b = Value::Double(Vector::filled(8, 3.0));
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
        let proto = Rc::new(Prototype::new("test", vec![], 0, bytecode, 8));
        let mut interp = Interp::new(proto);
        interp.registers[0] = a;
        interp.registers[1] = b;

        let outcome = Recorder::new(0, RecordBudget::default()).record(&mut interp);
        let resume_pc = match outcome {
            RecordOutcome::Aborted { resume_pc, .. } => resume_pc,
            RecordOutcome::Closed { .. } => panic!("ret is never representable"),
        };
        interp.pc = resume_pc;
        interp.run().expect("resumed interpretation should succeed");

        let result = interp.registers[3].as_double_slice().unwrap().to_vec();
        assert!(result.iter().all(|&x| (x - 8.0).abs() < 1e-12));
    }

    /// A trace that closes its own loop header (as a recorded `for`-loop
    /// back edge would) survives the optimizer's liveness/sinking/fusion/
    /// register-assignment passes without losing the node its guard
    /// exports to a side exit.
    #[test]
    fn a_closing_loop_trace_survives_optimization() {
        use crate::ir::{GroupKind, IRNode, IrAux, IrOpcode, IrType, Shape, Snapshot};

        let mut t = Trace::new();
        let a = t.push(IRNode::new(IrOpcode::Sload, IrType::Double, GroupKind::Scalar).with_aux(IrAux::Slot(0)));
        let len = t.push(IRNode::new(IrOpcode::Length, IrType::Integer, GroupKind::Scalar));
        let sum = t.push(
            IRNode::new(IrOpcode::Fold(FoldOp::Sum), IrType::Double, GroupKind::Fold)
                .with_operands(Some(a), None, None)
                .with_shape(Shape::plain(len)),
        );
        let guard = t.push(
            IRNode::new(IrOpcode::Gtrue, IrType::Boxed, GroupKind::Scalar)
                .with_operands(Some(sum), None, None)
                .with_aux(IrAux::GuardDirection(true)),
        );
        let mut snap = Snapshot::default();
        snap.registers.insert(1, sum);
        t.add_exit(guard, snap, 99);
        t.push(IRNode::new(IrOpcode::Loop, IrType::Boxed, GroupKind::Scalar));
        t.push(IRNode::new(IrOpcode::Jmp, IrType::Boxed, GroupKind::Scalar));

        let optimized = trace::optimize(&t);
        assert!(optimized.live_count > 0);
        assert!(t.nodes[sum].live.get());
        assert!(!t.nodes[sum].sunk.get());
    }

    /// End-to-end: a `for` loop whose body is a guarded vector op, run
    /// through a full `Interp::run()` over a sequence long enough to pass
    /// the hot-loop threshold. The second back edge reports `HotSite`,
    /// which records, optimizes, compiles, and installs a trace; a loop
    /// header that is already hot keeps reporting `HotSite` on every later
    /// back edge (its hit count only ever grows), which is also what
    /// closes the recording once an installed trace exists.
    ///
    /// The recorded body only ever touches `a`/`b` -- never the induction
    /// variable itself, since a Cranelift `Sload` reads a full-length array
    /// at the current native-loop index, which only `a`/`b` actually are; a
    /// for-loop's bound element is a fresh scalar every pass and isn't
    /// representable that way. The `for`'s own `iter` sequence exists only
    /// to drive the R-level iteration count to the same length as `a`/`b`,
    /// so the body recomputes the identical elementwise product on every
    /// pass -- not realistic R code, but enough to exercise real record,
    /// compile, install, and dispatch from a genuine back edge rather than
    /// a hand-built `Trace`.
    ///
    /// The guard (`a > b`) never actually fires, so this exercises the
    /// "ran to completion" splice path, not a side exit -- and the answer
    /// it produces must match what a loop too short to ever go hot (plain
    /// interpretation only) computes for the same arithmetic.
    #[cfg(feature = "jit")]
    #[test]
    fn hot_for_loop_dispatches_into_an_installed_trace() {
        use crate::bytecode::instr::CompareOp;

        fn make_loop_bytecode() -> Vec<Instr> {
            vec![
                Instr::ForBegin {
                    iter: 2,
                    var: 3,
                    pos: 4,
                    end_target: 5,
                },
                Instr::ArithBinary {
                    op: ArithOp::Mul,
                    dst: 5,
                    lhs: 0,
                    rhs: 1,
                },
                Instr::Compare {
                    op: CompareOp::Gt,
                    dst: 6,
                    lhs: 0,
                    rhs: 1,
                },
                Instr::Jf { cond: 6, target: 2 },
                Instr::ForEnd {
                    iter: 2,
                    var: 3,
                    pos: 4,
                    body_target: -3,
                },
                Instr::Ret { value: 5 },
            ]
        }

        // `a` counts up from 1 so `a * b` varies by element instead of
        // being constant everywhere; `b` is fixed at -1 so the guard
        // (`a > b`) holds for every element. `len` elements must clear
        // `HOT_LENGTH_THRESHOLD` (64) and be SIMD_WIDTH-aligned for the
        // loop's second back edge to go hot; `iter` only needs to share
        // that length.
        fn run_case(len: usize) -> Vec<f64> {
            let a_vals: Vec<f64> = (1..=len as i64).map(|n| n as f64).collect();
            let a = Value::Double(Vector::from_vec(a_vals));
            let b = Value::Double(Vector::filled(len, -1.0));
            let iter = Value::Double(Vector::from_vec((1..=len as i64).map(|n| n as f64).collect()));
            let interp = run_prototype(make_loop_bytecode(), &[(0, a), (1, b), (2, iter)], 8);
            interp.registers[5].as_double_slice().unwrap().to_vec()
        }

        let hot = run_case(80);
        let expected_hot: Vec<f64> = (1..=80i64).map(|n| n as f64 * -1.0).collect();
        assert_eq!(hot, expected_hot);

        // Same arithmetic, too short to ever go hot -- plain interpretation
        // the whole way, giving the answer the compiled path above must
        // match bit for bit.
        let cold = run_case(8);
        let expected_cold: Vec<f64> = (1..=8i64).map(|n| n as f64 * -1.0).collect();
        assert_eq!(cold, expected_cold);
    }

    /// A parameter left unfilled at a call site is bound to a promise over
    /// its default expression; reading it runs that expression lazily and
    /// memoizes the result, so a second read in the same call sees the
    /// already-forced value rather than re-running anything.
    #[test]
    fn unfilled_default_argument_forces_lazily_and_memoizes() {
        use crate::proto::{DefaultExpr, FunctionValue};

        const X: crate::value::Sym = 7;

        let mut default_proto = Prototype::new(
            "42",
            vec![],
            0,
            vec![Instr::Kget { dst: 0, const_idx: 0 }, Instr::Ret { value: 0 }],
            1,
        );
        default_proto.constants.push(Value::scalar_integer(42));
        let default_proto = Rc::new(default_proto);

        let mut callee_proto = Prototype::new(
            "function(x = 42) x + x",
            vec![X],
            1,
            vec![
                Instr::Iget { dst: 0, name: X },
                Instr::Iget { dst: 1, name: X },
                Instr::ArithBinary {
                    op: ArithOp::Add,
                    dst: 2,
                    lhs: 0,
                    rhs: 1,
                },
                Instr::Ret { value: 2 },
            ],
            3,
        );
        callee_proto.defaults[0] = Some(DefaultExpr { proto: 0 });
        callee_proto.children.push(default_proto);
        let callee_proto = Rc::new(callee_proto);

        let main_proto = Rc::new(Prototype::new("test", vec![], 0, vec![], 1));
        let mut interp = Interp::new(main_proto);
        let f = FunctionValue {
            proto: callee_proto,
            captured_env: interp.cur_env,
        };
        let result = interp.call(&f, &[]).expect("call with all defaults should succeed");
        assert_eq!(result.as_integer_slice().unwrap()[0], 84);
    }

    /// Scenario F: `UseMethod` dispatches on the first argument's class,
    /// falling through to `.default` when no class-specific method exists.
    /// Resolution itself needs the (external) string-interning table to
    /// compose `generic.class`, so the test supplies a tiny in-memory
    /// [`MethodResolver`] standing in for that embedder-side lookup.
    #[test]
    fn use_method_dispatches_on_class_falling_back_to_default() {
        use crate::bytecode::interp::{MethodMatch, MethodResolver};
        use crate::proto::FunctionValue;
        use crate::value::Vector;

        const PRINT: crate::value::Sym = 1;
        const FOO: crate::value::Sym = 2;
        const BAR: crate::value::Sym = 3;

        fn make_proto(tag: i64) -> Rc<Prototype> {
            let mut proto = Prototype::new(
                "method",
                vec![0],
                1,
                vec![Instr::Kget { dst: 1, const_idx: 0 }, Instr::Ret { value: 1 }],
                2,
            );
            proto.constants.push(Value::scalar_integer(tag));
            Rc::new(proto)
        }

        struct StaticResolver {
            print_foo: Rc<Prototype>,
            print_default: Rc<Prototype>,
            captured_env: crate::env::EnvId,
        }
        impl MethodResolver for StaticResolver {
            fn resolve(
                &self,
                _interp: &Interp,
                generic: crate::value::Sym,
                class: &[crate::value::Sym],
            ) -> Option<MethodMatch> {
                if generic != PRINT {
                    return None;
                }
                let proto = if class.first() == Some(&FOO) {
                    self.print_foo.clone()
                } else {
                    self.print_default.clone()
                };
                Some(MethodMatch {
                    function: FunctionValue {
                        proto,
                        captured_env: self.captured_env,
                    },
                    bindings: vec![],
                })
            }
        }

        fn run_use_method(first_arg: Value) -> Value {
            let caller_proto = Rc::new(Prototype::new(
                "call print",
                vec![],
                0,
                vec![
                    Instr::UseMethod {
                        dst: 1,
                        generic: PRINT,
                        first_arg: 0,
                    },
                    Instr::Ret { value: 1 },
                ],
                2,
            ));
            let mut interp = Interp::new(caller_proto);
            interp.method_resolver = Box::new(StaticResolver {
                print_foo: make_proto(1),
                print_default: make_proto(0),
                captured_env: interp.cur_env,
            });
            interp.registers[0] = first_arg;
            interp.run().expect("UseMethod dispatch should succeed");
            interp.registers[1].clone()
        }

        let foo_obj = Value::Object {
            base: Box::new(Value::scalar_integer(0)),
            class: Vector::from_vec(vec![FOO]),
        };
        let bar_obj = Value::Object {
            base: Box::new(Value::scalar_integer(0)),
            class: Vector::from_vec(vec![BAR]),
        };

        assert_eq!(run_use_method(foo_obj).as_integer_slice().unwrap()[0], 1);
        assert_eq!(run_use_method(bar_obj).as_integer_slice().unwrap()[0], 0);
    }
}
