//! Call-stack frame: everything needed to resume the caller on `ret`.

use crate::env::EnvId;
use crate::proto::Prototype;
use std::rc::Rc;

#[derive(Debug)]
pub struct Frame {
    pub env: EnvId,
    /// Whether this frame is responsible for returning its environment to
    /// the free-list on return (false once a closure-safe value leaks it).
    pub owns_env: bool,
    pub proto: Rc<Prototype>,
    pub return_pc: usize,
    pub return_base: usize,
    /// Register in the *caller's* window that receives this call's result,
    /// or `None` for the outermost/top-level frame.
    pub result_slot: Option<usize>,
}

/// Returns `true` if `value`'s shape makes it safe to recycle the callee
/// environment onto the free list: it doesn't reference (and thus keep
/// alive) the environment itself, e.g. by being a closure or environment
/// value captured from this call.
pub fn is_closure_safe(value: &crate::value::Value, env: EnvId) -> bool {
    use crate::value::Value;
    match value {
        Value::Function(f) => f.captured_env != env,
        Value::Environment(e) => *e != env,
        _ => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::FunctionValue;
    use crate::proto::Prototype;
    use crate::value::Value;

    #[test]
    fn returning_a_plain_value_is_closure_safe() {
        assert!(is_closure_safe(&Value::scalar_integer(1), 3));
    }

    #[test]
    fn returning_a_closure_over_the_callee_env_is_not_safe() {
        let proto = std::rc::Rc::new(Prototype::new("1", vec![], 0, vec![], 0));
        let f = Value::Function(FunctionValue {
            proto,
            captured_env: 3,
        });
        assert!(!is_closure_safe(&f, 3));
    }
}
