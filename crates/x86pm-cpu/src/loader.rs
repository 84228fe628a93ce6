//! Selector validation and segment register loads.
//!
//! Real and virtual-8086 loads only recompute the base. Protected-mode loads
//! read the descriptor from the GDT or LDT, apply the per-register type and
//! privilege rules, and copy it into the hidden cache. The cache is never
//! revalidated afterwards, so later writes to the table do not affect a
//! loaded register.

use x86pm_mmu::MemoryBus;

use crate::descriptor::{Descriptor, DescriptorKind, ACCESS_ACCESSED, ACCESS_TSS_BUSY};
use crate::fault::Fault;
use crate::segment::{SegReg, SegmentCache, SystemSegment};
use crate::state::CpuMode;
use crate::CpuContext;

impl CpuContext {
    /// Linear address of the descriptor `selector` names, if it lies within
    /// the GDT or (TI set) the LDT.
    pub(crate) fn descriptor_address(&self, selector: u16) -> Option<u32> {
        let table = if selector & 4 != 0 {
            self.ldtr.table()
        } else {
            self.gdtr
        };
        table.entry((selector & !7) as u32)
    }

    /// Read the descriptor `selector` names. `out_of_range` produces the fault
    /// for a selector beyond its table limit.
    pub(crate) fn fetch_descriptor(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        out_of_range: impl FnOnce(&mut Self) -> Fault,
    ) -> Result<(u32, Descriptor), Fault> {
        let Some(addr) = self.descriptor_address(selector) else {
            return Err(out_of_range(self));
        };
        let raw = self.sys_read_u64(bus, addr)?;
        Ok((addr, Descriptor::from_raw(raw)))
    }

    /// Same as [`Self::fetch_descriptor`] but restricted to the GDT, as for
    /// TSS and LDT descriptors.
    pub(crate) fn fetch_gdt_descriptor(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        invalid: impl FnOnce(&mut Self) -> Fault,
    ) -> Result<(u32, Descriptor), Fault> {
        let Some(addr) = self
            .gdtr
            .entry((selector & !7) as u32)
            .filter(|_| selector & 4 == 0)
        else {
            return Err(invalid(self));
        };
        let raw = self.sys_read_u64(bus, addr)?;
        Ok((addr, Descriptor::from_raw(raw)))
    }

    /// Set the accessed bit in the table copy of a code or data descriptor.
    pub(crate) fn mark_accessed(
        &mut self,
        bus: &mut impl MemoryBus,
        addr: u32,
        desc: &mut Descriptor,
    ) -> Result<(), Fault> {
        if !self.config().set_accessed_bits || desc.access() & ACCESS_ACCESSED != 0 {
            return Ok(());
        }
        desc.words[2] |= (ACCESS_ACCESSED as u16) << 8;
        self.sys_write_u16(bus, addr.wrapping_add(4), desc.words[2])
    }

    /// Load ES, DS, FS or GS. CS and SS are routed to their own loaders.
    pub fn load_data_segment(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        selector: u16,
    ) -> Result<(), Fault> {
        match reg {
            SegReg::Cs => return self.load_code_segment(bus, selector),
            SegReg::Ss => return self.load_stack_segment(bus, selector),
            _ => {}
        }
        match self.mode() {
            CpuMode::Real => {
                self.segment_mut(reg).load_real(selector);
                return Ok(());
            }
            CpuMode::Vm86 => {
                self.set_segment(reg, SegmentCache::v86(selector));
                return Ok(());
            }
            CpuMode::Protected => {}
        }

        if selector & !3 == 0 {
            self.set_segment(
                reg,
                SegmentCache {
                    selector,
                    ..SegmentCache::unusable()
                },
            );
            return Ok(());
        }

        let code = selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        let cpl = self.cpl();
        let rpl = (selector & 3) as u8;
        match desc.access() & 0x1f {
            // Data and non-conforming readable code.
            0x10..=0x17 | 0x1a | 0x1b => {
                if rpl.max(cpl) > desc.dpl() {
                    return Err(self.gp(code));
                }
            }
            // Conforming readable code.
            0x1e | 0x1f => {}
            _ => return Err(self.gp(code)),
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }

        self.mark_accessed(bus, addr, &mut desc)?;
        let class = self.config().class;
        self.set_segment(reg, SegmentCache::from_descriptor(selector, &desc, class));
        tracing::trace!(?reg, selector, "segment loaded");
        Ok(())
    }

    /// Load SS. The B bit of the new descriptor selects SP or ESP.
    pub fn load_stack_segment(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        match self.mode() {
            CpuMode::Real => {
                self.segment_mut(SegReg::Ss).load_real(selector);
                return Ok(());
            }
            CpuMode::Vm86 => {
                self.set_segment(SegReg::Ss, SegmentCache::v86(selector));
                return Ok(());
            }
            CpuMode::Protected => {}
        }

        if selector & !3 == 0 {
            return Err(self.ss(0));
        }
        let code = selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        let cpl = self.cpl();
        if (selector & 3) as u8 != cpl || desc.dpl() != cpl || !desc.is_writable_data() {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.ss(code));
        }

        self.mark_accessed(bus, addr, &mut desc)?;
        let class = self.config().class;
        self.set_segment(
            SegReg::Ss,
            SegmentCache::from_descriptor(selector, &desc, class),
        );
        Ok(())
    }

    /// Load CS without a control transfer (e.g. from a decoded far pointer the
    /// caller has already resolved). Gates are not followed here.
    pub fn load_code_segment(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        match self.mode() {
            CpuMode::Real => {
                self.segment_mut(SegReg::Cs).load_real(selector);
                return Ok(());
            }
            CpuMode::Vm86 => {
                self.set_segment(SegReg::Cs, SegmentCache::v86(selector));
                return Ok(());
            }
            CpuMode::Protected => {}
        }

        if selector & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        let (addr, mut desc) = self.fetch_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        let cpl = self.cpl();
        self.check_code_privilege(&desc, selector, cpl, |cpu| cpu.gp(code))?;
        if !desc.is_present() {
            return Err(self.np(code));
        }
        self.mark_accessed(bus, addr, &mut desc)?;
        self.commit_code_segment(selector, &desc, cpl);
        Ok(())
    }

    /// Same-privilege code rules: non-conforming needs `RPL <= CPL` and
    /// `DPL == CPL`, conforming needs `DPL <= CPL`.
    pub(crate) fn check_code_privilege(
        &mut self,
        desc: &Descriptor,
        selector: u16,
        cpl: u8,
        fault: impl FnOnce(&mut Self) -> Fault,
    ) -> Result<(), Fault> {
        let rpl = (selector & 3) as u8;
        let ok = match desc.kind() {
            DescriptorKind::Code {
                conforming: false, ..
            } => rpl <= cpl && desc.dpl() == cpl,
            DescriptorKind::Code {
                conforming: true, ..
            } => desc.dpl() <= cpl,
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(fault(self))
        }
    }

    /// Install `desc` as CS running at `cpl`: the cached DPL and the selector
    /// RPL both become `cpl`.
    pub(crate) fn commit_code_segment(&mut self, selector: u16, desc: &Descriptor, cpl: u8) {
        let old_cpl = self.cpl();
        let class = self.config().class;
        let selector = (selector & !3) | cpl as u16;
        self.set_segment(
            SegReg::Cs,
            SegmentCache::from_descriptor(selector, &desc.with_dpl(cpl), class),
        );
        self.note_privilege_change(old_cpl, cpl);
    }

    /// User/supervisor translations differ only across the ring 3 boundary.
    pub(crate) fn note_privilege_change(&mut self, old_cpl: u8, new_cpl: u8) {
        if (old_cpl == 3) != (new_cpl == 3) {
            tracing::trace!(old_cpl, new_cpl, "privilege change flushes translations");
            self.mmu.invalidate_all();
        }
    }

    /// Null DS, ES, FS and GS when they are no longer loadable at the current
    /// privilege level (after a return to an outer ring).
    pub(crate) fn null_inaccessible_data_segments(&mut self) {
        let cpl = self.cpl();
        for reg in SegReg::DATA {
            if !self.segment(reg).accessible_at(cpl) {
                self.set_segment(reg, SegmentCache::unusable());
            }
        }
    }

    /// LTR: load TR from an available TSS descriptor in the GDT and mark it busy.
    pub fn load_task_register(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
    ) -> Result<(), Fault> {
        if self.mode() != CpuMode::Protected || self.cpl() != 0 || selector & !3 == 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        let (addr, mut desc) = self.fetch_gdt_descriptor(bus, selector, |cpu| cpu.gp(code))?;
        if !matches!(
            desc.kind(),
            DescriptorKind::AvailableTss16 | DescriptorKind::AvailableTss32
        ) {
            return Err(self.gp(code));
        }
        if !desc.is_present() {
            return Err(self.np(code));
        }

        desc.words[2] |= (ACCESS_TSS_BUSY as u16) << 8;
        self.sys_write_u16(bus, addr.wrapping_add(4), desc.words[2])?;
        let class = self.config().class;
        self.tr = SystemSegment::from_descriptor(selector, &desc, class);
        tracing::debug!(selector, base = self.tr.base, "task register loaded");
        Ok(())
    }

    /// LLDT: load LDTR from the GDT. A null selector leaves an empty LDT.
    pub fn load_ldt(&mut self, bus: &mut impl MemoryBus, selector: u16) -> Result<(), Fault> {
        if self.mode() != CpuMode::Protected || self.cpl() != 0 {
            return Err(self.gp(0));
        }
        let code = selector & !3;
        self.load_ldt_with(bus, selector, |cpu| cpu.gp(code), |cpu| cpu.np(code))
    }

    /// LDTR load shared by LLDT and the task switcher, which reports
    /// failures as #TS instead.
    pub(crate) fn load_ldt_with(
        &mut self,
        bus: &mut impl MemoryBus,
        selector: u16,
        invalid: impl Fn(&mut Self) -> Fault,
        not_present: impl FnOnce(&mut Self) -> Fault,
    ) -> Result<(), Fault> {
        if selector & !3 == 0 {
            self.ldtr = SystemSegment {
                selector,
                ..SystemSegment::default()
            };
            return Ok(());
        }
        let (_, desc) = self.fetch_gdt_descriptor(bus, selector, &invalid)?;
        if desc.kind() != DescriptorKind::Ldt {
            return Err(invalid(self));
        }
        if !desc.is_present() {
            return Err(not_present(self));
        }
        let class = self.config().class;
        self.ldtr = SystemSegment::from_descriptor(selector, &desc, class);
        Ok(())
    }
}
