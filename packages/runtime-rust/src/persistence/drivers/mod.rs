//! Built-in persistence drivers.

mod local;
mod memory;

pub use local::{sanitize_backup_name, LocalDiskDriver};
pub use memory::MemoryDriver;
