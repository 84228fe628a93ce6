//! Protected-mode segmentation and privilege engine for 286 through
//! Pentium-class x86 CPUs.
//!
//! [`CpuContext`] owns the architectural state (general registers, segment
//! caches, descriptor table registers, EFLAGS) together with the
//! [`x86pm_mmu::Mmu`] that handles paging. Segment loads, far transfers,
//! interrupt dispatch and task switches validate against the descriptor
//! tables in guest memory and report violations as [`Fault`]s, which are also
//! recorded as the pending abort until [`CpuContext::deliver_pending_fault`]
//! routes them through the IDT.

#![forbid(unsafe_code)]

mod descriptor;
mod fault;
mod gate;
mod loader;
mod segment;
mod state;
mod task;

pub use descriptor::{Descriptor, DescriptorKind, Gate};
pub use fault::{CpuExit, Exception, Fault};
pub use gate::{FarKind, InterruptSource};
pub use segment::{DescriptorTable, SegReg, SegmentCache, SystemSegment, UNUSABLE_BASE};
pub use state::{CpuConfig, CpuContext, CpuMode, Eflags, Gpr};
pub use task::TaskSwitchReason;

pub use x86pm_mmu::{ConfigError, CpuClass, MemoryBus, PageFault};
