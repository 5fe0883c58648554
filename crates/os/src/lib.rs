//! Quarry OS pack: `file` resources whose content is kept current by
//! filesystem notifications, and the loaded kernel module table.

#![forbid(unsafe_code)]

use std::sync::Arc;

use quarry_store::Registry;

mod file;
pub mod fswatch;
pub mod kernel;

pub use fswatch::{read_change, FsChangeSource};
pub use kernel::{parse_modules, KernelSource, ModuleEntry, ProcKernel, StaticKernel};

/// Register `file`, `kernel` and `kernel.module`.
pub fn register(registry: &mut Registry, kernel: Arc<dyn KernelSource>) {
    registry.register(file::file_schema(Arc::new(FsChangeSource::new())));
    registry.register(kernel::kernel_schema(kernel));
    registry.register(kernel::module_schema());
}
