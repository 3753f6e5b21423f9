//! Immutable per-function artifacts: [`Prototype`], pre-compiled call
//! sites, and the lazy-promise cell used for default arguments.

use crate::bytecode::instr::Instr;
use crate::env::EnvId;
use crate::value::{Sym, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Index of a [`Prototype`] inside the enclosing program's prototype pool.
pub type ProtoId = u32;

/// A single positional or named actual argument at a call site, resolved
/// ahead of time by the (external) compiler wherever possible.
#[derive(Debug, Clone)]
pub struct CallArg {
    pub name: Option<Sym>,
    /// `None` for `...`-splice positions; the dots are expanded at the call
    /// site, preserving whatever names they carried.
    pub is_dots: bool,
}

/// Pre-built argument list at a call site: the call expression is not part
/// of this crate's concern (lives in the external printer/deparser), only
/// the shape needed to drive argument matching.
#[derive(Debug, Clone)]
pub struct CompiledCall {
    pub args: Vec<CallArg>,
    /// Index at which `...` appears among `args`, or `args.len()` if none.
    pub dots_index: usize,
}

/// A default-argument expression: a prototype to run, paired with `None`
/// until the parameter it defaults is actually read, at which point it is
/// evaluated in the callee environment. See [`Promise`].
#[derive(Debug, Clone)]
pub struct DefaultExpr {
    pub proto: ProtoId,
}

/// Immutable function body, produced by the (external) compiler and owned
/// for the lifetime of the program.
#[derive(Debug)]
pub struct Prototype {
    pub expr_source: String,
    pub param_names: Vec<Sym>,
    pub defaults: Vec<Option<DefaultExpr>>,
    /// Index of the dotted (`...`) parameter, or `param_names.len()` if the
    /// prototype takes no varargs.
    pub dots_index: usize,
    pub constants: Vec<Value>,
    pub children: Vec<Rc<Prototype>>,
    pub call_sites: Vec<CompiledCall>,
    pub bytecode: Vec<Instr>,
    /// Threaded bytecode: lazily filled on first entry by replacing each
    /// opcode with its handler's dispatch target. `None` until then.
    pub threaded: RefCell<Option<Vec<crate::bytecode::dispatch::ThreadedInstr>>>,
    /// Number of registers this prototype's frame needs.
    pub register_count: usize,
}

impl Prototype {
    pub fn new(
        expr_source: impl Into<String>,
        param_names: Vec<Sym>,
        dots_index: usize,
        bytecode: Vec<Instr>,
        register_count: usize,
    ) -> Self {
        let n = param_names.len();
        Prototype {
            expr_source: expr_source.into(),
            param_names,
            defaults: vec![None; n],
            dots_index,
            constants: Vec::new(),
            children: Vec::new(),
            call_sites: Vec::new(),
            bytecode,
            threaded: RefCell::new(None),
            register_count,
        }
    }

    pub fn has_dots(&self) -> bool {
        self.dots_index < self.param_names.len()
    }
}

/// A closure: (prototype, captured environment).
#[derive(Debug, Clone)]
pub struct FunctionValue {
    pub proto: Rc<Prototype>,
    pub captured_env: EnvId,
}

pub type PromiseId = u32;

/// Lazy-evaluation cell for a default argument: starts as `Unforced`
/// (pointing at the prototype+environment to run) and transitions, at
/// most once, to `Forced` with the computed value memoized into the
/// enclosing environment.
#[derive(Debug, Clone)]
pub enum Promise {
    Unforced {
        proto: Rc<Prototype>,
        env: EnvId,
    },
    Forced(Value),
}

impl Promise {
    pub fn is_forced(&self) -> bool {
        matches!(self, Promise::Forced(_))
    }
}

/// Arena of live promises, mirroring [`crate::env::EnvArena`]'s pattern.
#[derive(Debug, Default)]
pub struct PromiseArena {
    promises: Vec<Promise>,
}

impl PromiseArena {
    pub fn new() -> Self {
        PromiseArena {
            promises: Vec::new(),
        }
    }

    pub fn create(&mut self, proto: Rc<Prototype>, env: EnvId) -> PromiseId {
        self.promises.push(Promise::Unforced { proto, env });
        (self.promises.len() - 1) as PromiseId
    }

    pub fn get(&self, id: PromiseId) -> &Promise {
        &self.promises[id as usize]
    }

    /// Record the computed value for a promise forced by the caller, e.g.
    /// via [`crate::bytecode::interp::Interp::force_promise`]. Overwrites
    /// whatever was there, forced or not; callers are expected to have
    /// already checked `is_forced` if they care about re-running work.
    pub fn set_forced(&mut self, id: PromiseId, value: Value) {
        self.promises[id as usize] = Promise::Forced(value);
    }

    /// Force a promise: if already forced, return the memoized value
    /// without re-running anything.
    pub fn force_with<F>(&mut self, id: PromiseId, eval: F) -> Value
    where
        F: FnOnce(&Rc<Prototype>, EnvId) -> Value,
    {
        if let Promise::Forced(v) = &self.promises[id as usize] {
            return v.clone();
        }
        let (proto, env) = match &self.promises[id as usize] {
            Promise::Unforced { proto, env } => (proto.clone(), *env),
            Promise::Forced(_) => unreachable!(),
        };
        let value = eval(&proto, env);
        self.promises[id as usize] = Promise::Forced(value.clone());
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_forces_at_most_once() {
        let proto = Rc::new(Prototype::new("1", vec![], 0, vec![], 0));
        let mut arena = PromiseArena::new();
        let id = arena.create(proto, 0);
        let calls = std::cell::Cell::new(0);
        let v1 = arena.force_with(id, |_, _| {
            calls.set(calls.get() + 1);
            Value::scalar_integer(7)
        });
        let v2 = arena.force_with(id, |_, _| {
            calls.set(calls.get() + 1);
            Value::scalar_integer(999)
        });
        assert_eq!(calls.get(), 1);
        assert_eq!(v1.length(), v2.length());
        assert!(arena.get(id).is_forced());
    }
}
