//! Hardware task switching through 32-bit and 16-bit TSS descriptors.

use x86pm_mmu::{MemoryBus, CR0_TS};

use crate::descriptor::{Descriptor, DescriptorKind, ACCESS_TSS_BUSY};
use crate::fault::Fault;
use crate::segment::{SegReg, SegmentCache, SystemSegment};
use crate::state::{Eflags, Gpr};
use crate::CpuContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskSwitchReason {
    Jmp,
    Call,
    /// Interrupt or exception through a task gate.
    Int,
    /// IRET with NT set, returning to the backlink task.
    Iret,
}

impl TaskSwitchReason {
    /// The outgoing task stays busy when it can be returned to.
    fn nests(self) -> bool {
        matches!(self, TaskSwitchReason::Call | TaskSwitchReason::Int)
    }
}

const TSS32_MIN_LIMIT: u32 = 103;
const TSS16_MIN_LIMIT: u32 = 43;

/// Register image held by a TSS.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TaskState {
    cr3: Option<u32>,
    eip: u32,
    eflags: u32,
    gprs: [u32; 8],
    /// ES, CS, SS, DS, FS, GS. FS and GS are zero in a 16-bit TSS.
    selectors: [u16; 6],
    ldt: u16,
}

impl CpuContext {
    fn read_task_state(
        &mut self,
        bus: &mut impl MemoryBus,
        base: u32,
        tss32: bool,
    ) -> Result<TaskState, Fault> {
        let at = |off: u32| base.wrapping_add(off);
        let mut gprs = [0u32; 8];
        let mut selectors = [0u16; 6];

        if tss32 {
            let cr3 = self.sys_read_u32(bus, at(0x1c))?;
            let eip = self.sys_read_u32(bus, at(0x20))?;
            let eflags = self.sys_read_u32(bus, at(0x24))?;
            for (i, gpr) in gprs.iter_mut().enumerate() {
                *gpr = self.sys_read_u32(bus, at(0x28 + 4 * i as u32))?;
            }
            for (i, selector) in selectors.iter_mut().enumerate() {
                *selector = self.sys_read_u16(bus, at(0x48 + 4 * i as u32))?;
            }
            let ldt = self.sys_read_u16(bus, at(0x60))?;
            return Ok(TaskState {
                cr3: Some(cr3),
                eip,
                eflags,
                gprs,
                selectors,
                ldt,
            });
        }

        let eip = self.sys_read_u16(bus, at(0x0e))? as u32;
        let eflags = self.sys_read_u16(bus, at(0x10))? as u32;
        for (i, gpr) in gprs.iter_mut().enumerate() {
            *gpr = 0xffff_0000 | self.sys_read_u16(bus, at(0x12 + 2 * i as u32))? as u32;
        }
        for (i, selector) in selectors.iter_mut().take(4).enumerate() {
            *selector = self.sys_read_u16(bus, at(0x22 + 2 * i as u32))?;
        }
        let ldt = self.sys_read_u16(bus, at(0x2a))?;
        Ok(TaskState {
            cr3: None,
            eip,
            eflags,
            gprs,
            selectors,
            ldt,
        })
    }

    /// Save the outgoing task into the TSS TR points at, in TR's format.
    fn save_task_state(
        &mut self,
        bus: &mut impl MemoryBus,
        eip: u32,
        eflags: u32,
    ) -> Result<(), Fault> {
        let base = self.tr.base;
        let at = |off: u32| base.wrapping_add(off);

        if self.tr.is_tss32() {
            let cr3 = self.mmu.cr3();
            self.sys_write_u32(bus, at(0x1c), cr3)?;
            self.sys_write_u32(bus, at(0x20), eip)?;
            self.sys_write_u32(bus, at(0x24), eflags)?;
            for (i, reg) in Gpr::ALL.into_iter().enumerate() {
                let value = self.gpr(reg);
                self.sys_write_u32(bus, at(0x28 + 4 * i as u32), value)?;
            }
            for (i, reg) in SegReg::ALL.into_iter().enumerate() {
                let selector = self.selector(reg);
                self.sys_write_u16(bus, at(0x48 + 4 * i as u32), selector)?;
            }
            return Ok(());
        }

        self.sys_write_u16(bus, at(0x0e), eip as u16)?;
        self.sys_write_u16(bus, at(0x10), eflags as u16)?;
        for (i, reg) in Gpr::ALL.into_iter().enumerate() {
            let value = self.gpr(reg) as u16;
            self.sys_write_u16(bus, at(0x12 + 2 * i as u32), value)?;
        }
        for (i, reg) in SegReg::ALL.into_iter().take(4).enumerate() {
            let selector = self.selector(reg);
            self.sys_write_u16(bus, at(0x22 + 2 * i as u32), selector)?;
        }
        Ok(())
    }

    /// Set or clear the busy bit of the GDT TSS descriptor `selector` names.
    fn set_tss_busy(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        busy: bool,
    ) -> Result<(), Fault> {
        let code = selector & !3;
        let Some(addr) = self.gdtr.entry((selector & !7) as u32) else {
            return Err(self.ts(code));
        };
        let addr = addr.wrapping_add(4);
        let word = self.sys_read_u16(bus, addr)?;
        let bit = (ACCESS_TSS_BUSY as u16) << 8;
        let word = if busy { word | bit } else { word & !bit };
        self.sys_write_u16(bus, addr, word)
    }

    /// Switch to the task whose TSS descriptor `desc` was read from GDT
    /// selector `selector`. `return_eip` is saved as the outgoing task's EIP.
    ///
    /// The incoming state is read in full before anything is written, so a
    /// fault reading the new TSS leaves the current task intact. Once TR has
    /// moved, faults raised while loading segments are taken in the new task.
    pub fn switch_task(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        desc: Descriptor,
        reason: TaskSwitchReason,
        return_eip: u32,
    ) -> Result<(), Fault> {
        let class = self.config().class;
        let code = selector & !3;
        let tss32 = desc.kind().is_tss32();
        let min_limit = if tss32 {
            TSS32_MIN_LIMIT
        } else {
            TSS16_MIN_LIMIT
        };
        if desc.limit(class) < min_limit {
            return Err(self.ts(code));
        }
        let base = desc.base(class);
        let incoming = self.read_task_state(bus, base, tss32)?;

        let old_tr = self.tr;
        tracing::debug!(
            from = old_tr.selector,
            to = selector,
            ?reason,
            eip = return_eip,
            "task switch"
        );

        let mut outgoing_flags = self.eflags.bits();
        if reason == TaskSwitchReason::Iret {
            outgoing_flags &= !Eflags::NT.bits();
        }
        self.save_task_state(bus, return_eip, outgoing_flags)?;

        if !reason.nests() {
            self.set_tss_busy(bus, old_tr.selector, false)?;
        }
        if reason != TaskSwitchReason::Iret {
            self.set_tss_busy(bus, selector, true)?;
        }

        let mut eflags = incoming.eflags;
        if reason.nests() {
            self.sys_write_u16(bus, base, old_tr.selector)?;
            eflags |= Eflags::NT.bits();
        }

        if let Some(cr3) = incoming.cr3 {
            self.mmu.set_cr3(cr3);
        }
        self.eip = incoming.eip;
        self.eflags = Eflags::from_bits_retain(eflags) | Eflags::FIXED;
        for (reg, value) in Gpr::ALL.into_iter().zip(incoming.gprs) {
            self.set_gpr(reg, value);
        }
        let cr0 = self.mmu.cr0();
        self.mmu.set_cr0(cr0 | CR0_TS);
        self.tr = SystemSegment {
            access: desc.access() | ACCESS_TSS_BUSY,
            ..SystemSegment::from_descriptor(selector, &desc, class)
        };

        let ldt = incoming.ldt;
        if ldt & 4 != 0 {
            return Err(self.ts(ldt & !3));
        }
        self.load_ldt_with(bus, ldt, |cpu| cpu.ts(ldt & !3), |cpu| cpu.ts(ldt & !3))?;

        let [es, cs, ss, ds, fs, gs] = incoming.selectors;
        if self.eflags.contains(Eflags::VM) {
            let old_cpl = self.segment(SegReg::Cs).dpl();
            for (reg, selector) in SegReg::ALL.into_iter().zip(incoming.selectors) {
                self.set_segment(reg, SegmentCache::v86(selector));
            }
            self.note_privilege_change(old_cpl, 3);
            return Ok(());
        }

        self.load_task_code_segment(bus, cs)?;
        self.load_data_segment(bus, SegReg::Es, es)?;
        self.load_stack_segment(bus, ss)?;
        self.load_data_segment(bus, SegReg::Ds, ds)?;
        if tss32 {
            self.load_data_segment(bus, SegReg::Fs, fs)?;
            self.load_data_segment(bus, SegReg::Gs, gs)?;
        } else {
            self.set_segment(SegReg::Fs, SegmentCache::unusable());
            self.set_segment(SegReg::Gs, SegmentCache::unusable());
        }

        let cs_limit_ok = self.segment(SegReg::Cs).contains(self.eip, 1);
        if !cs_limit_ok {
            return Err(self.gp(0));
        }
        Ok(())
    }

    /// CS of an incoming task: its RPL becomes the new CPL, and every
    /// failure other than not-present is #TS.
    fn load_task_code_segment(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        let code = selector & !3;
        if code == 0 {
            return Err(self.ts(0));
        }
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.ts(code))?;
        let rpl = (selector & 3) as u8;
        let ok = match desc.kind() {
            DescriptorKind::Code {
                conforming: false, ..
            } => desc.dpl() == rpl,
            DescriptorKind::Code {
                conforming: true, ..
            } => desc.dpl() <= rpl,
            _ => false,
        };
        if !ok {
            return Err(self.ts(code));
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }
        self.mark_accessed(bus, addr, &mut desc)?;
        self.commit_code_segment(selector, &desc, rpl);
        Ok(())
    }
}
