//! Code generation for an optimized [`crate::ir::Trace`].
//!
//! # Backends
//!
//! - **cranelift** (optional, default-on): compiles the fused loop straight
//!   to native code at JIT speed. Behind the `jit` feature so the bare
//!   interpreter can be embedded without pulling in Cranelift at all.

#[cfg(feature = "jit")]
pub mod cranelift;

use crate::error::VResult;
use crate::ir::Trace;
use crate::trace::OptimizedTrace;

/// Entry point of a compiled trace: runs the fused loop starting at
/// `start_index` up to (but not including) `len`, writing each live
/// register's final value into `out` (indexed by virtual register number)
/// and returning either `u32::MAX` if the loop ran to completion without a
/// guard firing, or a packed side-exit result: the exit id in the low 32
/// bits and the iteration the guard fired on in the high 32 bits (needed
/// to find that iteration's row in `out`, since every iteration of a live
/// register's row is written as the loop runs, not just the last one).
/// Returns `u64` rather than `u32` because that is the width Cranelift's
/// `I64` return slot actually occupies and because the packed form needs
/// the extra bits; narrowing happens at the call site, not the ABI.
pub type CompiledTraceFn = extern "C" fn(
    start_index: u64,
    len: u64,
    inputs: *const *const f64,
    out: *mut f64,
) -> u64;

/// A trace compiled to native code, plus enough bookkeeping to call it.
pub struct CompiledTrace {
    pub entry: CompiledTraceFn,
    /// Interpreter register each `inputs` pointer corresponds to, in the
    /// order the trace first referenced it (i.e. `inputs[i]` is the raw
    /// `f64` data backing register `input_slots[i]`).
    pub input_slots: Vec<usize>,
    /// Register slot each exit's snapshot needs read back out of `out` to
    /// resume the interpreter, in the order the interpreter's own
    /// registers were captured by [`crate::ir::Snapshot`].
    pub exit_register_slots: Vec<Vec<u32>>,
}

impl std::fmt::Debug for CompiledTrace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledTrace")
            .field("entry", &(self.entry as usize))
            .field("input_slots", &self.input_slots)
            .field("exit_register_slots", &self.exit_register_slots)
            .finish()
    }
}

/// Configuration for trace code generation.
#[derive(Debug, Clone)]
pub struct CodegenConfig {
    /// Whether to emit bounds/NA guard checks the interpreter would also
    /// have performed (turning them off trusts the recorder's own guards).
    pub runtime_checks: bool,
    /// Whether to verify the generated Cranelift IR before finalizing.
    pub debug_assertions: bool,
    /// Lane width the fused loop's generated vector ops target.
    pub simd_width: usize,
}

impl Default for CodegenConfig {
    fn default() -> Self {
        CodegenConfig {
            runtime_checks: true,
            debug_assertions: cfg!(debug_assertions),
            simd_width: crate::bytecode::interp::SIMD_WIDTH,
        }
    }
}

impl CodegenConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn release() -> Self {
        CodegenConfig {
            runtime_checks: false,
            debug_assertions: false,
            simd_width: crate::bytecode::interp::SIMD_WIDTH,
        }
    }
}

/// A backend that turns an optimized trace into a callable native function.
pub trait CodeGenerator {
    fn target_name(&self) -> &str;
    fn compile_trace(&mut self, trace: &Trace, optimized: &OptimizedTrace) -> VResult<CompiledTrace>;
}
