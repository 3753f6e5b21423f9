//! Environment operations, as a vtable rather than a reimplementation.
//!
//! The actual environment table (hashing, lexical/dynamic parent chains,
//! dotted varargs) lives in the host crate's own `Env`/`Frame` types --
//! this crate cannot depend on them without creating a cycle, since the
//! host depends on this crate for linking compiled traces. What a
//! compiled trace needs instead is a stable C-ABI calling surface: at
//! trace-call time the host fills in an [`EnvironmentVTable`] with
//! pointers into its real environment, and passes it alongside the
//! trace's other arguments. No fused loop in the current code generator
//! emits any of these calls yet (environment side effects are lifted to
//! trace entry/exit and never occur inside the loop body), but the
//! surface is specified so a later generator extension has a stable
//! target to call into.

use crate::cell::Cell;
use std::os::raw::c_void;

pub type EnvHandle = *mut c_void;

#[repr(C)]
pub struct EnvironmentVTable {
    pub sload: extern "C" fn(env: EnvHandle, slot: u32) -> Cell,
    pub sstore: extern "C" fn(env: EnvHandle, slot: u32, value: Cell),
    pub eload: extern "C" fn(env: EnvHandle, name: u32) -> Cell,
    pub estore: extern "C" fn(env: EnvHandle, name: u32, value: Cell),
    pub new_environment: extern "C" fn(parent: EnvHandle) -> EnvHandle,
    pub length: extern "C" fn(value: Cell) -> u32,
    pub alength: extern "C" fn(value: Cell, dim: u32) -> u32,
    pub olength: extern "C" fn(value: Cell) -> u32,
    pub get_prototype: extern "C" fn(env: EnvHandle) -> EnvHandle,
    pub get_attr: extern "C" fn(value: Cell, name: u32) -> Cell,
    pub get_strip: extern "C" fn(value: Cell) -> Cell,
    pub get_environment: extern "C" fn(value: Cell) -> EnvHandle,
    pub push: extern "C" fn(env: EnvHandle, value: Cell),
    pub pop: extern "C" fn(env: EnvHandle) -> Cell,
}
