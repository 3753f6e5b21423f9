//! Inline-cache token embedded in threaded bytecode for `get`/`assign`.

use super::EnvId;
use crate::value::Sym;

/// `(env, name, revision, index)`: as long as the owning environment's
/// `revision` still matches, `get`/`assign` can go straight to `index`
/// without hashing. A stale pointer is rewritten in place by
/// [`super::EnvArena::get_by_pointer`] / `assign_by_pointer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pointer {
    pub env: EnvId,
    pub name: Sym,
    pub revision: u64,
    pub index: usize,
}
