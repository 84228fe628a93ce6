//! x86 protected-mode MMU: linear → physical translation with a software TLB.
//!
//! Two paging formats are implemented:
//! - 32-bit paging (4KB pages, 4MB pages with CR4.PSE, optional PSE-36)
//! - PAE paging (4KB / 2MB pages, 40-bit physical addresses)
//!
//! Translations are cached in two rings, one per [`Direction`]. The page walker
//! sets accessed/dirty bits through read-modify-write cycles on the page tables
//! themselves, so anything snooping the tables observes them exactly as a guest
//! would.

#![forbid(unsafe_code)]

mod config;
mod linear;
mod ram;
mod tlb;

pub use config::{ConfigError, CpuClass, MmuConfig, MAX_TLB_CAPACITY, MIN_TLB_CAPACITY};
pub use ram::PagedRam;
pub use tlb::Direction;

use thiserror::Error;
use tlb::{Tlb, TlbEntry, NO_FRAME};

pub const PAGE_SIZE: usize = 4096;

/// Physical memory access used for page-table walking and data accesses.
pub trait MemoryBus {
    fn read_u8(&mut self, paddr: u64) -> u8;
    fn read_u16(&mut self, paddr: u64) -> u16;
    fn read_u32(&mut self, paddr: u64) -> u32;
    fn read_u64(&mut self, paddr: u64) -> u64;

    fn write_u8(&mut self, paddr: u64, value: u8);
    fn write_u16(&mut self, paddr: u64, value: u16);
    fn write_u32(&mut self, paddr: u64, value: u32);
    fn write_u64(&mut self, paddr: u64, value: u64);

    /// Read a byte slice from physical memory, one byte at a time unless the
    /// backend overrides it.
    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        for (i, slot) in dst.iter_mut().enumerate() {
            *slot = self.read_u8(paddr.wrapping_add(i as u64));
        }
    }

    /// Write a byte slice to physical memory, one byte at a time unless the
    /// backend overrides it.
    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        for (i, byte) in src.iter().copied().enumerate() {
            self.write_u8(paddr.wrapping_add(i as u64), byte);
        }
    }
}

impl<T: MemoryBus + ?Sized> MemoryBus for &mut T {
    #[inline]
    fn read_u8(&mut self, paddr: u64) -> u8 {
        <T as MemoryBus>::read_u8(&mut **self, paddr)
    }

    #[inline]
    fn read_u16(&mut self, paddr: u64) -> u16 {
        <T as MemoryBus>::read_u16(&mut **self, paddr)
    }

    #[inline]
    fn read_u32(&mut self, paddr: u64) -> u32 {
        <T as MemoryBus>::read_u32(&mut **self, paddr)
    }

    #[inline]
    fn read_u64(&mut self, paddr: u64) -> u64 {
        <T as MemoryBus>::read_u64(&mut **self, paddr)
    }

    #[inline]
    fn write_u8(&mut self, paddr: u64, value: u8) {
        <T as MemoryBus>::write_u8(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u16(&mut self, paddr: u64, value: u16) {
        <T as MemoryBus>::write_u16(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u32(&mut self, paddr: u64, value: u32) {
        <T as MemoryBus>::write_u32(&mut **self, paddr, value)
    }

    #[inline]
    fn write_u64(&mut self, paddr: u64, value: u64) {
        <T as MemoryBus>::write_u64(&mut **self, paddr, value)
    }

    #[inline]
    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        <T as MemoryBus>::read_bytes(&mut **self, paddr, dst)
    }

    #[inline]
    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        <T as MemoryBus>::write_bytes(&mut **self, paddr, src)
    }
}

/// Type of memory access being translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    #[inline]
    fn is_write(self) -> bool {
        matches!(self, AccessType::Write)
    }

    #[inline]
    pub fn direction(self) -> Direction {
        match self {
            AccessType::Write => Direction::Write,
            AccessType::Read | AccessType::Execute => Direction::Read,
        }
    }
}

/// Privilege context of a translation.
///
/// System accesses (descriptor tables, TSS, IDT) are made on behalf of the CPU
/// and bypass the user/supervisor page check even when CPL is 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AccessContext {
    pub cpl: u8,
    pub system: bool,
}

impl AccessContext {
    #[inline]
    pub const fn with_cpl(cpl: u8) -> Self {
        Self { cpl, system: false }
    }

    #[inline]
    pub const fn system() -> Self {
        Self {
            cpl: 0,
            system: true,
        }
    }

    #[inline]
    pub fn is_user(self) -> bool {
        self.cpl == 3 && !self.system
    }
}

/// #PF details. CR2 has already been updated when this is returned from
/// [`Mmu::translate`] or [`Mmu::lookup_or_translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("page fault at {addr:#010x} (error code {error_code:#x})")]
pub struct PageFault {
    /// Faulting linear address (CR2).
    pub addr: u32,
    /// Bit 0: the entry was present, bit 1: write, bit 2: user.
    pub error_code: u32,
}

impl PageFault {
    #[inline]
    fn new(addr: u32, present: bool, access: AccessType, is_user: bool) -> Self {
        Self {
            addr,
            error_code: pf_error_code(present, access, is_user),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PagingMode {
    Disabled,
    Legacy32,
    Pae,
}

/// MMU and translation cache statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MmuStats {
    /// Page-table walks performed by committing translations.
    pub page_walks: u64,
    pub read_hits: u64,
    pub read_misses: u64,
    pub write_hits: u64,
    pub write_misses: u64,
    /// Full cache flushes.
    pub flushes: u64,
}

/// Result of a successful walk before it is committed to the cache.
#[derive(Debug, Clone, Copy)]
struct Walk {
    paddr: u64,
    user: bool,
    writable: bool,
    table_frames: [u64; 3],
}

/// Whether a walk may modify guest page tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WalkEffects {
    Commit,
    Probe,
}

/// x86 MMU with a software TLB.
#[derive(Debug, Clone)]
pub struct Mmu {
    cr0: u32,
    cr2: u32,
    cr3: u32,
    cr4: u32,
    mode: PagingMode,
    a20_mask: u64,
    config: MmuConfig,
    tlb: Tlb,
    /// User bit of the most recently served translation.
    last_user: bool,
    stats: MmuStats,
}

impl Default for Mmu {
    fn default() -> Self {
        Self::new()
    }
}

impl Mmu {
    pub fn new() -> Self {
        let config = MmuConfig::default();
        Self {
            cr0: 0,
            cr2: 0,
            cr3: 0,
            cr4: 0,
            mode: PagingMode::Disabled,
            a20_mask: !0,
            config,
            tlb: Tlb::new(config.tlb_capacity),
            last_user: false,
            stats: MmuStats::default(),
        }
    }

    pub fn with_config(config: MmuConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            tlb: Tlb::new(config.tlb_capacity),
            ..Self::new()
        })
    }

    #[inline]
    fn update_cached_state(&mut self) {
        self.mode = if self.cr0 & CR0_PG == 0 {
            PagingMode::Disabled
        } else if self.cr4 & CR4_PAE == 0 {
            PagingMode::Legacy32
        } else {
            PagingMode::Pae
        };
    }

    #[inline]
    pub fn config(&self) -> &MmuConfig {
        &self.config
    }

    #[inline]
    pub fn stats(&self) -> MmuStats {
        self.stats
    }

    #[inline]
    pub fn reset_stats(&mut self) {
        self.stats = MmuStats::default();
    }

    #[inline]
    pub fn paging_mode(&self) -> PagingMode {
        self.mode
    }

    #[inline]
    pub fn cr0(&self) -> u32 {
        self.cr0
    }

    /// CR2 is written by the MMU on every page fault it reports.
    #[inline]
    pub fn cr2(&self) -> u32 {
        self.cr2
    }

    #[inline]
    pub fn set_cr2(&mut self, value: u32) {
        self.cr2 = value;
    }

    #[inline]
    pub fn cr3(&self) -> u32 {
        self.cr3
    }

    #[inline]
    pub fn cr4(&self) -> u32 {
        self.cr4
    }

    #[inline]
    pub fn a20_enabled(&self) -> bool {
        self.a20_mask & A20_BIT != 0
    }

    /// User bit of the translation most recently served by the cache or walker.
    #[inline]
    pub fn last_user_permission(&self) -> bool {
        self.last_user
    }

    /// Live entries in one direction of the translation cache.
    #[inline]
    pub fn cached_entries(&self, dir: Direction) -> usize {
        self.tlb.len(dir)
    }

    pub fn set_cr0(&mut self, value: u32) {
        let old_pg = self.cr0 & CR0_PG != 0;
        self.cr0 = value;
        if old_pg != (value & CR0_PG != 0) {
            self.invalidate_all();
        }
        self.update_cached_state();
    }

    pub fn set_cr3(&mut self, value: u32) {
        self.cr3 = value;
        self.invalidate_all();
    }

    pub fn set_cr4(&mut self, value: u32) {
        let old_relevant = self.cr4 & (CR4_PAE | CR4_PSE);
        self.cr4 = value;
        if old_relevant != value & (CR4_PAE | CR4_PSE) {
            self.invalidate_all();
        }
        self.update_cached_state();
    }

    /// Gate address line 20. Disabling it aliases the second megabyte onto the first.
    pub fn set_a20(&mut self, enabled: bool) {
        if enabled == self.a20_enabled() {
            return;
        }
        self.a20_mask = if enabled { !0 } else { !A20_BIT };
        self.invalidate_all();
    }

    /// Drop every cached translation in both directions.
    pub fn invalidate_all(&mut self) {
        tracing::trace!(
            reads = self.tlb.len(Direction::Read),
            writes = self.tlb.len(Direction::Write),
            "flushing translation cache"
        );
        self.stats.flushes = self.stats.flushes.wrapping_add(1);
        self.tlb.flush_all();
    }

    /// INVLPG.
    pub fn invalidate_page(&mut self, linear: u32) {
        self.tlb.invalidate_page(linear);
    }

    /// Drop write translations targeting the physical page containing `paddr`.
    pub fn invalidate_write_page(&mut self, paddr: u64) {
        self.tlb.invalidate_write_frame(paddr >> 12);
    }

    /// Must be told about every guest write that bypasses the linear accessors.
    /// Writes into a page table backing a cached translation flush the cache.
    pub fn note_physical_write(&mut self, paddr: u64) {
        if self.tlb.references_table_frame(paddr >> 12) {
            tracing::trace!(paddr, "write to cached page table");
            self.invalidate_all();
        }
    }

    #[inline]
    fn wp_applies(&self) -> bool {
        self.cr0 & CR0_WP != 0 && self.config.class.has_write_protect()
    }

    /// Translate a linear address by walking the page tables.
    ///
    /// This always walks (the cache is neither consulted nor filled; use
    /// [`Mmu::lookup_or_translate`] for cached translation), sets
    /// accessed/dirty bits and records CR2 on failure.
    pub fn translate(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
    ) -> Result<u64, PageFault> {
        self.walk(bus, linear, access, ctx, WalkEffects::Commit)
            .map(|walk| {
                self.last_user = walk.user;
                walk.paddr
            })
            .map_err(|pf| {
                self.cr2 = pf.addr;
                pf
            })
    }

    /// Side-effect free translation: same walk and permission checks as
    /// [`Mmu::translate`] but no accessed/dirty updates, no CR2 write, no
    /// statistics, and faults collapse to `None`.
    pub fn translate_no_abort(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
    ) -> Option<u64> {
        self.walk(bus, linear, access, ctx, WalkEffects::Probe)
            .ok()
            .map(|walk| walk.paddr)
    }

    /// Translate through the cache, walking and refilling it on a miss.
    pub fn lookup_or_translate(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
    ) -> Result<u64, PageFault> {
        if self.mode == PagingMode::Disabled {
            return Ok(linear as u64 & self.a20_mask);
        }

        let dir = access.direction();
        if let Some(entry) = self.tlb.lookup(dir, linear).copied() {
            // Entries may have been filled by a supervisor or system access, or before
            // CR0.WP was set. An access they do not permit must walk so the fault is
            // reported properly.
            let write_denied = access.is_write()
                && !entry.writable
                && (ctx.is_user() || self.wp_applies());
            let denied = (ctx.is_user() && !entry.user) || write_denied;
            if !denied {
                let paddr = entry.translate(linear);
                self.last_user = entry.user;
                self.count_hit(dir);
                return Ok(paddr);
            }
        }
        self.count_miss(dir);

        let walk = match self.walk(bus, linear, access, ctx, WalkEffects::Commit) {
            Ok(walk) => walk,
            Err(pf) => {
                self.cr2 = pf.addr;
                return Err(pf);
            }
        };
        self.tlb.insert(
            dir,
            TlbEntry {
                page: linear >> 12,
                frame: walk.paddr >> 12,
                user: walk.user,
                writable: walk.writable,
                table_frames: walk.table_frames,
            },
        );
        self.last_user = walk.user;
        Ok(walk.paddr)
    }

    fn count_hit(&mut self, dir: Direction) {
        match dir {
            Direction::Read => self.stats.read_hits = self.stats.read_hits.wrapping_add(1),
            Direction::Write => self.stats.write_hits = self.stats.write_hits.wrapping_add(1),
        }
    }

    fn count_miss(&mut self, dir: Direction) {
        match dir {
            Direction::Read => self.stats.read_misses = self.stats.read_misses.wrapping_add(1),
            Direction::Write => self.stats.write_misses = self.stats.write_misses.wrapping_add(1),
        }
    }

    fn walk(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
        effects: WalkEffects,
    ) -> Result<Walk, PageFault> {
        if effects == WalkEffects::Commit && self.mode != PagingMode::Disabled {
            self.stats.page_walks = self.stats.page_walks.wrapping_add(1);
        }
        let walk = match self.mode {
            PagingMode::Disabled => Walk {
                paddr: linear as u64,
                user: true,
                writable: true,
                table_frames: [NO_FRAME; 3],
            },
            PagingMode::Legacy32 => self.walk_legacy32(bus, linear, access, ctx, effects)?,
            PagingMode::Pae => self.walk_pae(bus, linear, access, ctx, effects)?,
        };
        Ok(Walk {
            paddr: walk.paddr & self.a20_mask,
            ..walk
        })
    }

    #[inline]
    fn check_perms(
        &self,
        linear: u32,
        user_ok: bool,
        writable_ok: bool,
        access: AccessType,
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        let is_user = ctx.is_user();
        if is_user && !user_ok {
            return Err(PageFault::new(linear, true, access, is_user));
        }
        if access.is_write() && !writable_ok && (is_user || self.wp_applies()) {
            return Err(PageFault::new(linear, true, access, is_user));
        }
        Ok(())
    }

    fn walk_legacy32(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
        effects: WalkEffects,
    ) -> Result<Walk, PageFault> {
        let is_user = ctx.is_user();
        let pde_addr = ((self.cr3 & !0xfff) + ((linear >> 20) & 0xffc)) as u64;
        let pde = bus.read_u32(pde_addr);
        if pde & PTE_P == 0 {
            return Err(PageFault::new(linear, false, access, is_user));
        }

        if pde & PTE_PS != 0 && self.cr4 & CR4_PSE != 0 {
            let user_ok = pde & PTE_US != 0;
            let writable_ok = pde & PTE_RW != 0;
            self.check_perms(linear, user_ok, writable_ok, access, ctx)?;

            if effects == WalkEffects::Commit {
                let mut new_pde = pde | PTE_A;
                if access.is_write() {
                    new_pde |= PTE_D;
                }
                if new_pde != pde {
                    bus.write_u32(pde_addr, new_pde);
                }
            }

            let mut pbase = (pde & 0xffc0_0000) as u64;
            if self.config.pse36 {
                pbase |= ((pde & PDE_PSE36_MASK) as u64) << 19;
            }
            return Ok(Walk {
                paddr: pbase | (linear & 0x3f_ffff) as u64,
                user: user_ok,
                writable: writable_ok,
                table_frames: [pde_addr >> 12, NO_FRAME, NO_FRAME],
            });
        }

        let pte_addr = ((pde & !0xfff) + ((linear >> 10) & 0xffc)) as u64;
        let pte = bus.read_u32(pte_addr);
        if pte & PTE_P == 0 {
            return Err(PageFault::new(linear, false, access, is_user));
        }

        let combined = pde & pte;
        let user_ok = combined & PTE_US != 0;
        let writable_ok = combined & PTE_RW != 0;
        self.check_perms(linear, user_ok, writable_ok, access, ctx)?;

        if effects == WalkEffects::Commit {
            if pde & PTE_A == 0 {
                bus.write_u32(pde_addr, pde | PTE_A);
            }
            let mut new_pte = pte | PTE_A;
            if access.is_write() {
                new_pte |= PTE_D;
            }
            if new_pte != pte {
                bus.write_u32(pte_addr, new_pte);
            }
        }

        Ok(Walk {
            paddr: ((pte & !0xfff) | (linear & 0xfff)) as u64,
            user: user_ok,
            writable: writable_ok,
            table_frames: [pde_addr >> 12, pte_addr >> 12, NO_FRAME],
        })
    }

    fn walk_pae(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
        effects: WalkEffects,
    ) -> Result<Walk, PageFault> {
        let is_user = ctx.is_user();
        let linear64 = linear as u64;

        let pdpte_addr = ((self.cr3 & !0x1f) as u64) + ((linear64 >> 27) & 0x18);
        let pdpte = bus.read_u64(pdpte_addr) & PAE_ADDR_MASK;
        if pdpte & PTE_P64 == 0 {
            return Err(PageFault::new(linear, false, access, is_user));
        }

        let pde_addr = (pdpte & !0xfff) + ((linear64 >> 18) & 0xff8);
        let pde = bus.read_u64(pde_addr) & PAE_ADDR_MASK;
        if pde & PTE_P64 == 0 {
            return Err(PageFault::new(linear, false, access, is_user));
        }

        if pde & PTE_PS64 != 0 {
            let user_ok = pde & PTE_US64 != 0;
            let writable_ok = pde & PTE_RW64 != 0;
            self.check_perms(linear, user_ok, writable_ok, access, ctx)?;

            if effects == WalkEffects::Commit {
                let mut new_pde = pde | PTE_A64;
                if access.is_write() {
                    new_pde |= PTE_D64;
                }
                if new_pde != pde {
                    let raw = bus.read_u64(pde_addr);
                    bus.write_u64(pde_addr, raw | (new_pde & (PTE_A64 | PTE_D64)));
                }
            }

            return Ok(Walk {
                paddr: (pde & !0x1f_ffff) | (linear64 & 0x1f_ffff),
                user: user_ok,
                writable: writable_ok,
                table_frames: [pdpte_addr >> 12, pde_addr >> 12, NO_FRAME],
            });
        }

        let pte_addr = (pde & !0xfff) + ((linear64 >> 9) & 0xff8);
        let pte = bus.read_u64(pte_addr) & PAE_ADDR_MASK;
        if pte & PTE_P64 == 0 {
            return Err(PageFault::new(linear, false, access, is_user));
        }

        let combined = pde & pte;
        let user_ok = combined & PTE_US64 != 0;
        let writable_ok = combined & PTE_RW64 != 0;
        self.check_perms(linear, user_ok, writable_ok, access, ctx)?;

        if effects == WalkEffects::Commit {
            if pde & PTE_A64 == 0 {
                let raw = bus.read_u64(pde_addr);
                bus.write_u64(pde_addr, raw | PTE_A64);
            }
            let mut set = PTE_A64;
            if access.is_write() {
                set |= PTE_D64;
            }
            if pte & set != set {
                let raw = bus.read_u64(pte_addr);
                bus.write_u64(pte_addr, raw | set);
            }
        }

        Ok(Walk {
            paddr: (pte & !0xfff) | (linear64 & 0xfff),
            user: user_ok,
            writable: writable_ok,
            table_frames: [pdpte_addr >> 12, pde_addr >> 12, pte_addr >> 12],
        })
    }
}

#[inline]
fn pf_error_code(present: bool, access: AccessType, is_user: bool) -> u32 {
    let mut code = 0u32;
    if present {
        code |= 1 << 0;
    }
    if access.is_write() {
        code |= 1 << 1;
    }
    if is_user {
        code |= 1 << 2;
    }
    code
}

pub const CR0_PE: u32 = 1 << 0;
pub const CR0_TS: u32 = 1 << 3;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;

const A20_BIT: u64 = 1 << 20;

pub const PTE_P: u32 = 1 << 0;
pub const PTE_RW: u32 = 1 << 1;
pub const PTE_US: u32 = 1 << 2;
pub const PTE_A: u32 = 1 << 5;
pub const PTE_D: u32 = 1 << 6;
pub const PTE_PS: u32 = 1 << 7;

const PTE_P64: u64 = PTE_P as u64;
const PTE_RW64: u64 = PTE_RW as u64;
const PTE_US64: u64 = PTE_US as u64;
const PTE_A64: u64 = PTE_A as u64;
const PTE_D64: u64 = PTE_D as u64;
const PTE_PS64: u64 = PTE_PS as u64;

/// PSE-36: PDE bits 13..16 hold physical address bits 32..35.
const PDE_PSE36_MASK: u32 = 0x0001_e000;
/// PAE entries address 40 bits of physical memory.
const PAE_ADDR_MASK: u64 = 0xff_ffff_ffff;

#[cfg(test)]
mod tests;
