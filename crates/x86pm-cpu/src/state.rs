use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use x86pm_mmu::{AccessContext, ConfigError, CpuClass, MemoryBus, Mmu, MmuConfig, CR0_PE};

use crate::fault::Fault;
use crate::segment::{DescriptorTable, SegReg, SegmentCache, SystemSegment};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct Eflags: u32 {
        const CF = 1 << 0;
        /// Always reads as one.
        const FIXED = 1 << 1;
        const PF = 1 << 2;
        const AF = 1 << 4;
        const ZF = 1 << 6;
        const SF = 1 << 7;
        const TF = 1 << 8;
        const IF = 1 << 9;
        const DF = 1 << 10;
        const OF = 1 << 11;
        const IOPL = 0b11 << 12;
        const NT = 1 << 14;
        const RF = 1 << 16;
        const VM = 1 << 17;
        const AC = 1 << 18;
        const VIF = 1 << 19;
        const VIP = 1 << 20;
        const ID = 1 << 21;
    }
}

impl Eflags {
    #[inline]
    pub fn iopl(self) -> u8 {
        ((self.bits() >> 12) & 3) as u8
    }
}

/// Bits of the low word a POPF/IRET image may carry (reserved bits 3, 5 and 15 read as zero).
pub(crate) const FLAGS_LOW_WRITABLE: u32 = 0x7fd5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gpr {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Gpr {
    pub const ALL: [Gpr; 8] = [
        Gpr::Eax,
        Gpr::Ecx,
        Gpr::Edx,
        Gpr::Ebx,
        Gpr::Esp,
        Gpr::Ebp,
        Gpr::Esi,
        Gpr::Edi,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuMode {
    Real,
    Protected,
    Vm86,
}

/// Embedder-facing configuration. Missing fields take their defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CpuConfig {
    pub class: CpuClass,
    /// Honour PSE-36 physical address bits in 4MB page directory entries.
    pub pse36: bool,
    /// Write the accessed bit back to descriptors when a segment is loaded.
    pub set_accessed_bits: bool,
    /// Entries in each of the read and write translation rings.
    pub tlb_capacity: usize,
    /// Start from 0xFFFF_FFF0 (AT-class) instead of 0xFFFF0.
    pub reset_vector_high: bool,
}

impl Default for CpuConfig {
    fn default() -> Self {
        let mmu = MmuConfig::default();
        Self {
            class: mmu.class,
            pse36: mmu.pse36,
            set_accessed_bits: true,
            tlb_capacity: mmu.tlb_capacity,
            reset_vector_high: true,
        }
    }
}

impl CpuConfig {
    pub fn mmu_config(&self) -> MmuConfig {
        MmuConfig {
            class: self.class,
            pse36: self.pse36,
            tlb_capacity: self.tlb_capacity,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.mmu_config().validate()
    }
}

/// Architectural state of one CPU plus its MMU.
///
/// `eip` always names the instruction being executed: control transfers take
/// the address of the next instruction as an explicit `return_eip` and only
/// move `eip` once they commit, so a raised fault reports the faulting
/// instruction.
#[derive(Debug, Clone)]
pub struct CpuContext {
    gprs: [u32; 8],
    pub eip: u32,
    pub eflags: Eflags,
    segs: [SegmentCache; 6],

    pub gdtr: DescriptorTable,
    pub idtr: DescriptorTable,
    pub ldtr: SystemSegment,
    pub tr: SystemSegment,

    /// Control registers CR0/CR2/CR3/CR4, A20 and the translation cache.
    pub mmu: Mmu,

    config: CpuConfig,
    pub(crate) pending: Option<Fault>,
}

impl Default for CpuContext {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuContext {
    pub fn new() -> Self {
        Self::build(CpuConfig::default(), Mmu::new())
    }

    pub fn with_config(config: CpuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let mmu = Mmu::with_config(config.mmu_config())?;
        Ok(Self::build(config, mmu))
    }

    fn build(config: CpuConfig, mmu: Mmu) -> Self {
        let mut cpu = Self {
            gprs: [0; 8],
            eip: 0,
            eflags: Eflags::FIXED,
            segs: [SegmentCache::reset(); 6],
            gdtr: DescriptorTable::default(),
            idtr: DescriptorTable::default(),
            ldtr: SystemSegment::default(),
            tr: SystemSegment::default(),
            mmu,
            config,
            pending: None,
        };
        cpu.reset();
        cpu
    }

    #[inline]
    pub fn config(&self) -> &CpuConfig {
        &self.config
    }

    /// Power-on/RESET state: real mode, paging off, A20 on, caches flushed.
    pub fn reset(&mut self) {
        self.gprs = [0; 8];
        self.eflags = Eflags::FIXED;
        self.segs = [SegmentCache::reset(); 6];
        let cs = &mut self.segs[SegReg::Cs as usize];
        if self.config.reset_vector_high {
            cs.selector = 0xf000;
            cs.base = 0xffff_0000;
            self.eip = 0xfff0;
        } else {
            cs.selector = 0xffff;
            cs.base = 0x000f_fff0;
            self.eip = 0;
        }

        self.gdtr = DescriptorTable {
            base: 0,
            limit: 0xffff,
        };
        self.idtr = DescriptorTable {
            base: 0,
            limit: 0x03ff,
        };
        self.ldtr = SystemSegment {
            limit: 0xffff,
            access: 0x82,
            ..SystemSegment::default()
        };
        self.tr = SystemSegment {
            limit: 0xffff,
            access: 0x8b,
            ..SystemSegment::default()
        };

        self.mmu.set_cr4(0);
        self.mmu.set_cr0(0);
        self.mmu.set_cr3(0);
        self.mmu.set_cr2(0);
        self.mmu.set_a20(true);
        self.mmu.invalidate_all();
        self.pending = None;
        tracing::debug!(cs = self.segs[SegReg::Cs as usize].selector, eip = self.eip, "cpu reset");
    }

    pub fn mode(&self) -> CpuMode {
        if self.mmu.cr0() & CR0_PE == 0 {
            CpuMode::Real
        } else if self.eflags.contains(Eflags::VM) {
            CpuMode::Vm86
        } else {
            CpuMode::Protected
        }
    }

    /// Current privilege level, held in the DPL field of the cached CS.
    pub fn cpl(&self) -> u8 {
        match self.mode() {
            CpuMode::Real => 0,
            CpuMode::Vm86 => 3,
            CpuMode::Protected => self.segs[SegReg::Cs as usize].dpl(),
        }
    }

    /// Default operand size of the current code segment is 32-bit.
    #[inline]
    pub fn use32(&self) -> bool {
        self.mode() != CpuMode::Vm86 && self.segs[SegReg::Cs as usize].is_big()
    }

    /// The stack pointer is ESP rather than SP.
    #[inline]
    pub fn stack32(&self) -> bool {
        self.mode() != CpuMode::Vm86 && self.segs[SegReg::Ss as usize].is_big()
    }

    #[inline]
    pub fn gpr(&self, reg: Gpr) -> u32 {
        self.gprs[reg as usize]
    }

    #[inline]
    pub fn set_gpr(&mut self, reg: Gpr, value: u32) {
        self.gprs[reg as usize] = value;
    }

    #[inline]
    pub fn segment(&self, reg: SegReg) -> &SegmentCache {
        &self.segs[reg as usize]
    }

    #[inline]
    pub fn selector(&self, reg: SegReg) -> u16 {
        self.segs[reg as usize].selector
    }

    #[inline]
    pub(crate) fn segment_mut(&mut self, reg: SegReg) -> &mut SegmentCache {
        &mut self.segs[reg as usize]
    }

    /// Overwrite a register's hidden cache directly, bypassing every check.
    #[inline]
    pub fn set_segment(&mut self, reg: SegReg, cache: SegmentCache) {
        self.segs[reg as usize] = cache;
    }

    pub fn lgdt(&mut self, base: u32, limit: u16) {
        self.gdtr = DescriptorTable {
            base,
            limit: limit as u32,
        };
    }

    pub fn lidt(&mut self, base: u32, limit: u16) {
        self.idtr = DescriptorTable {
            base,
            limit: limit as u32,
        };
    }

    /// Replace the bits of EFLAGS selected by `mask`.
    pub(crate) fn load_flags(&mut self, value: u32, mask: u32) {
        let merged = (self.eflags.bits() & !mask) | (value & mask);
        self.eflags = Eflags::from_bits_retain(merged) | Eflags::FIXED;
    }

    #[inline]
    pub(crate) fn access_context(&self) -> AccessContext {
        AccessContext::with_cpl(self.cpl())
    }

    /// Form the linear address of a segment-relative access, enforcing the
    /// usability, type and limit rules of the cached descriptor.
    fn segment_linear(
        &mut self,
        reg: SegReg,
        offset: u32,
        size: u32,
        write: bool,
    ) -> Result<u32, Fault> {
        let seg = self.segs[reg as usize];
        let mut ok = seg.contains(offset, size);
        if self.mode() == CpuMode::Protected {
            ok &= seg.is_usable();
            ok &= if write {
                seg.is_writable()
            } else {
                seg.is_readable()
            };
        }
        if !ok {
            return Err(match reg {
                SegReg::Ss => self.ss(0),
                _ => self.gp(0),
            });
        }
        Ok(seg.base.wrapping_add(offset))
    }

    pub fn read_u8(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
    ) -> Result<u8, Fault> {
        let linear = self.segment_linear(reg, offset, 1, false)?;
        let ctx = self.access_context();
        self.mmu
            .read_linear_u8(bus, linear, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    pub fn read_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
    ) -> Result<u16, Fault> {
        let linear = self.segment_linear(reg, offset, 2, false)?;
        let ctx = self.access_context();
        self.mmu
            .read_linear_u16(bus, linear, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    pub fn read_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
    ) -> Result<u32, Fault> {
        let linear = self.segment_linear(reg, offset, 4, false)?;
        let ctx = self.access_context();
        self.mmu
            .read_linear_u32(bus, linear, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    pub fn write_u8(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
        value: u8,
    ) -> Result<(), Fault> {
        let linear = self.segment_linear(reg, offset, 1, true)?;
        let ctx = self.access_context();
        self.mmu
            .write_linear_u8(bus, linear, value, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    pub fn write_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
        value: u16,
    ) -> Result<(), Fault> {
        let linear = self.segment_linear(reg, offset, 2, true)?;
        let ctx = self.access_context();
        self.mmu
            .write_linear_u16(bus, linear, value, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    pub fn write_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        reg: SegReg,
        offset: u32,
        value: u32,
    ) -> Result<(), Fault> {
        let linear = self.segment_linear(reg, offset, 4, true)?;
        let ctx = self.access_context();
        self.mmu
            .write_linear_u32(bus, linear, value, ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    /// Instruction byte at CS:`offset`. Only the limit is checked; execute
    /// permission is implied by CS holding a code segment.
    pub fn fetch_u8(&mut self, bus: &mut impl MemoryBus, offset: u32) -> Result<u8, Fault> {
        let cs = self.segs[SegReg::Cs as usize];
        if !cs.contains(offset, 1) {
            return Err(self.gp(0));
        }
        let ctx = self.access_context();
        self.mmu
            .fetch_linear_u8(bus, cs.base.wrapping_add(offset), ctx)
            .map_err(|pf| self.raise(pf.into()))
    }

    // Descriptor tables, the TSS and the IDT are read on behalf of the CPU
    // itself and skip the user/supervisor page check.

    pub(crate) fn sys_read_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
    ) -> Result<u16, Fault> {
        self.mmu
            .read_linear_u16(bus, linear, AccessContext::system())
            .map_err(|pf| self.raise(pf.into()))
    }

    pub(crate) fn sys_read_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
    ) -> Result<u32, Fault> {
        self.mmu
            .read_linear_u32(bus, linear, AccessContext::system())
            .map_err(|pf| self.raise(pf.into()))
    }

    pub(crate) fn sys_read_u64(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
    ) -> Result<u64, Fault> {
        self.mmu
            .read_linear_u64(bus, linear, AccessContext::system())
            .map_err(|pf| self.raise(pf.into()))
    }

    pub(crate) fn sys_write_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u16,
    ) -> Result<(), Fault> {
        self.mmu
            .write_linear_u16(bus, linear, value, AccessContext::system())
            .map_err(|pf| self.raise(pf.into()))
    }

    pub(crate) fn sys_write_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u32,
    ) -> Result<(), Fault> {
        self.mmu
            .write_linear_u32(bus, linear, value, AccessContext::system())
            .map_err(|pf| self.raise(pf.into()))
    }
}
