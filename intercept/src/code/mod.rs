//! Executable memory: slab allocation and in-place code patching.

pub mod allocator;
pub mod patcher;
