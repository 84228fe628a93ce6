//! x86 protected-mode memory access and protection engine.
//!
//! [`cpu`] holds segmentation, privilege checks, gates and task switching;
//! [`mmu`] holds paging and the translation cache. Most embedders only need
//! [`CpuContext`] and a [`MemoryBus`] implementation such as [`PagedRam`].

pub use x86pm_cpu as cpu;
pub use x86pm_mmu as mmu;

pub use x86pm_cpu::{CpuConfig, CpuContext, CpuExit, Fault, SegReg};
pub use x86pm_mmu::{MemoryBus, PagedRam};
