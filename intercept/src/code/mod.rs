//! Executable memory: allocation, in-place patching and i-cache maintenance.

pub mod allocator;
pub mod cache;
pub mod patcher;
