//! Built-in engine implementations.

mod memory;

pub use memory::MemoryEngine;
