use super::*;

use core::convert::TryInto;
use proptest::prelude::*;

#[derive(Clone)]
struct TestMemory {
    data: Vec<u8>,
    reads: usize,
    writes: usize,
}

impl TestMemory {
    fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
            reads: 0,
            writes: 0,
        }
    }

    fn reset_counters(&mut self) {
        self.reads = 0;
        self.writes = 0;
    }

    fn write_u32_raw(&mut self, paddr: u64, value: u32) {
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64_raw(&mut self, paddr: u64, value: u64) {
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }

    fn read_u32_raw(&self, paddr: u64) -> u32 {
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn read_u64_raw(&self, paddr: u64) -> u64 {
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }
}

impl MemoryBus for TestMemory {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        self.reads += 1;
        self.data[paddr as usize]
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        self.reads += 1;
        let off = paddr as usize;
        u16::from_le_bytes(self.data[off..off + 2].try_into().unwrap())
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        self.reads += 1;
        let off = paddr as usize;
        u32::from_le_bytes(self.data[off..off + 4].try_into().unwrap())
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        self.reads += 1;
        let off = paddr as usize;
        u64::from_le_bytes(self.data[off..off + 8].try_into().unwrap())
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        self.writes += 1;
        self.data[paddr as usize] = value;
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.writes += 1;
        let off = paddr as usize;
        self.data[off..off + 8].copy_from_slice(&value.to_le_bytes());
    }
}

const USER: AccessContext = AccessContext::with_cpl(3);
const KERNEL: AccessContext = AccessContext::with_cpl(0);

const PD_BASE: u64 = 0x1000;
const PT_BASE: u64 = 0x2000;

/// 32-bit paging with linear page 0 mapped to `page_base` using `flags` on both levels.
fn legacy_identity(mem: &mut TestMemory, page_base: u32, flags: u32) -> Mmu {
    mem.write_u32_raw(PD_BASE, PT_BASE as u32 | flags);
    mem.write_u32_raw(PT_BASE, page_base | flags);

    let mut mmu = Mmu::new();
    mmu.set_cr3(PD_BASE as u32);
    mmu.set_cr4(0);
    mmu.set_cr0(CR0_PE | CR0_PG);
    mmu
}

fn read_u8_through_generic<B: MemoryBus>(mut bus: B, paddr: u64) -> u8 {
    bus.read_u8(paddr)
}

#[test]
fn memory_bus_is_implemented_for_mut_refs() {
    let mut mem = TestMemory::new(0x10);
    mem.data[0] = 0xaa;
    mem.reset_counters();

    let got = read_u8_through_generic(&mut mem, 0);
    assert_eq!(got, 0xaa);
    assert_eq!(mem.reads, 1);
}

#[test]
fn no_paging_is_identity_and_honours_a20() {
    let mut mmu = Mmu::new();
    let mut mem = TestMemory::new(0x10);

    assert_eq!(
        mmu.translate(&mut mem, 0x1234, AccessType::Read, KERNEL),
        Ok(0x1234)
    );
    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x0010_fff0, AccessType::Write, USER),
        Ok(0x0010_fff0)
    );

    mmu.set_a20(false);
    assert!(!mmu.a20_enabled());
    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x0010_fff0, AccessType::Read, KERNEL),
        Ok(0x0000_fff0)
    );
    assert_eq!(mem.reads, 0);
}

#[test]
fn legacy32_4kb_translation_sets_accessed_and_dirty() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);

    assert_eq!(
        mmu.translate(&mut mem, 0x123, AccessType::Read, USER),
        Ok(0x3123)
    );
    assert_ne!(mem.read_u32_raw(PD_BASE) & PTE_A, 0);
    assert_ne!(mem.read_u32_raw(PT_BASE) & PTE_A, 0);
    assert_eq!(mem.read_u32_raw(PT_BASE) & PTE_D, 0);

    assert_eq!(
        mmu.translate(&mut mem, 0x123, AccessType::Write, USER),
        Ok(0x3123)
    );
    assert_ne!(mem.read_u32_raw(PT_BASE) & PTE_D, 0);
    // The directory entry never gets a dirty bit for a 4KB mapping.
    assert_eq!(mem.read_u32_raw(PD_BASE) & PTE_D, 0);
}

#[test]
fn legacy32_4mb_page_requires_pse_and_composes_pse36_bits() {
    let mut mem = TestMemory::new(0x0090_0000);
    // PDE[1] maps linear 0x0040_0000 to physical 0x1_0080_0000.
    let pde_addr = PD_BASE + 4;
    mem.write_u32_raw(
        pde_addr,
        0x0080_0000 | (1 << 13) | PTE_P | PTE_RW | PTE_US | PTE_PS,
    );

    let mut mmu = Mmu::with_config(MmuConfig {
        pse36: true,
        ..MmuConfig::default()
    })
    .unwrap();
    mmu.set_cr3(PD_BASE as u32);
    mmu.set_cr4(CR4_PSE);
    mmu.set_cr0(CR0_PE | CR0_PG);

    assert_eq!(
        mmu.translate(&mut mem, 0x0040_1234, AccessType::Write, KERNEL),
        Ok(0x1_0080_1234)
    );
    let pde = mem.read_u32_raw(pde_addr);
    assert_ne!(pde & PTE_A, 0);
    assert_ne!(pde & PTE_D, 0);

    // Without CR4.PSE the PS bit is ignored and the PDE is treated as a table pointer.
    mmu.set_cr4(0);
    assert_eq!(
        mmu.translate(&mut mem, 0x0040_1234, AccessType::Read, KERNEL),
        Err(PageFault {
            addr: 0x0040_1234,
            error_code: 0,
        })
    );
}

#[test]
fn pae_4kb_and_2mb_translation() {
    let mut mem = TestMemory::new(0x10000);
    let pdpt_base = 0x1000u64;
    let pd_base = 0x2000u64;
    let pt_base = 0x3000u64;
    let flags = (PTE_P | PTE_RW | PTE_US) as u64;

    mem.write_u64_raw(pdpt_base, pd_base | PTE_P as u64);
    mem.write_u64_raw(pd_base, pt_base | flags);
    mem.write_u64_raw(pt_base + 8, 0x4000 | flags);
    // PDE[1]: 2MB page at physical 0x0060_0000.
    mem.write_u64_raw(pd_base + 8, 0x0060_0000 | flags | PTE_PS as u64);

    let mut mmu = Mmu::new();
    mmu.set_cr3(pdpt_base as u32);
    mmu.set_cr4(CR4_PAE);
    mmu.set_cr0(CR0_PE | CR0_PG);
    assert_eq!(mmu.paging_mode(), PagingMode::Pae);

    assert_eq!(
        mmu.translate(&mut mem, 0x1456, AccessType::Write, USER),
        Ok(0x4456)
    );
    assert_ne!(mem.read_u64_raw(pd_base) & PTE_A as u64, 0);
    assert_eq!(
        mem.read_u64_raw(pt_base + 8) & (PTE_A | PTE_D) as u64,
        (PTE_A | PTE_D) as u64
    );
    assert_eq!(mem.read_u64_raw(pdpt_base) & PTE_A as u64, 0);

    assert_eq!(
        mmu.translate(&mut mem, 0x0020_0010, AccessType::Read, USER),
        Ok(0x0060_0010)
    );
    assert_ne!(mem.read_u64_raw(pd_base + 8) & PTE_A as u64, 0);
    assert_eq!(mem.read_u64_raw(pd_base + 8) & PTE_D as u64, 0);
}

#[test]
fn not_present_fault_reports_error_code_and_cr2() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);

    let err = mmu
        .lookup_or_translate(&mut mem, 0x0080_0000, AccessType::Write, USER)
        .unwrap_err();
    assert_eq!(err.addr, 0x0080_0000);
    assert_eq!(err.error_code, 0b110);
    assert_eq!(mmu.cr2(), 0x0080_0000);
    assert_eq!(mmu.cached_entries(Direction::Write), 0);
}

#[test]
fn user_access_to_supervisor_page_faults_but_system_access_does_not() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW);

    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER),
        Err(PageFault {
            addr: 0x10,
            error_code: 0b101,
        })
    );

    let system = AccessContext {
        cpl: 3,
        system: true,
    };
    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, system),
        Ok(0x3010)
    );
    assert!(!mmu.last_user_permission());

    // The system access filled the cache; a user access must still fault.
    assert!(mmu
        .lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER)
        .is_err());
}

#[test]
fn supervisor_write_protect_depends_on_cpu_class() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_US);

    // WP clear: supervisor writes ignore R/W.
    assert_eq!(
        mmu.translate(&mut mem, 0x20, AccessType::Write, KERNEL),
        Ok(0x3020)
    );

    mmu.set_cr0(CR0_PE | CR0_PG | CR0_WP);
    assert_eq!(
        mmu.translate(&mut mem, 0x20, AccessType::Write, KERNEL),
        Err(PageFault {
            addr: 0x20,
            error_code: 0b011,
        })
    );

    let mut mmu386 = Mmu::with_config(MmuConfig {
        class: CpuClass::I386,
        ..MmuConfig::default()
    })
    .unwrap();
    mmu386.set_cr3(PD_BASE as u32);
    mmu386.set_cr0(CR0_PE | CR0_PG | CR0_WP);
    assert_eq!(
        mmu386.translate(&mut mem, 0x20, AccessType::Write, KERNEL),
        Ok(0x3020)
    );
}

#[test]
fn cached_supervisor_write_honours_later_write_protect() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_US);

    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x20, AccessType::Write, KERNEL),
        Ok(0x3020)
    );
    assert_eq!(mmu.cached_entries(Direction::Write), 1);

    mmu.set_cr0(CR0_PE | CR0_PG | CR0_WP);
    let walked = mmu.translate(&mut mem, 0x20, AccessType::Write, KERNEL);
    let cached = mmu.lookup_or_translate(&mut mem, 0x20, AccessType::Write, KERNEL);
    assert_eq!(cached, walked);
    assert_eq!(
        cached,
        Err(PageFault {
            addr: 0x20,
            error_code: 0b011,
        })
    );

    // Reads of the same page stay cached.
    mmu.lookup_or_translate(&mut mem, 0x20, AccessType::Read, KERNEL)
        .unwrap();
    let walks = mmu.stats().page_walks;
    mmu.lookup_or_translate(&mut mem, 0x24, AccessType::Read, KERNEL)
        .unwrap();
    assert_eq!(mmu.stats().page_walks, walks);
}

#[test]
fn cache_hit_skips_the_page_walk() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);

    let first = mmu.lookup_or_translate(&mut mem, 0x456, AccessType::Read, USER);
    let walks = mmu.stats().page_walks;
    mem.reset_counters();

    let second = mmu.lookup_or_translate(&mut mem, 0x456, AccessType::Read, USER);
    assert_eq!(first, second);
    assert_eq!(mmu.stats().page_walks, walks);
    assert_eq!(mmu.stats().read_hits, 1);
    assert_eq!(mem.reads, 0);

    // Reads and writes are cached independently.
    mmu.lookup_or_translate(&mut mem, 0x456, AccessType::Write, USER)
        .unwrap();
    assert_eq!(mmu.stats().page_walks, walks + 1);
    assert_eq!(mmu.cached_entries(Direction::Read), 1);
    assert_eq!(mmu.cached_entries(Direction::Write), 1);
}

#[test]
fn invalidate_all_is_idempotent() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);
    mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER)
        .unwrap();

    for _ in 0..2 {
        mmu.invalidate_all();
        assert_eq!(mmu.cached_entries(Direction::Read), 0);
        assert_eq!(mmu.cached_entries(Direction::Write), 0);
    }
}

#[test]
fn control_register_and_a20_changes_flush_the_cache() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);
    let fill = |mmu: &mut Mmu, mem: &mut TestMemory| {
        mmu.lookup_or_translate(mem, 0x10, AccessType::Read, USER)
            .unwrap();
        assert_eq!(mmu.cached_entries(Direction::Read), 1);
    };

    fill(&mut mmu, &mut mem);
    mmu.set_cr3(PD_BASE as u32);
    assert_eq!(mmu.cached_entries(Direction::Read), 0);

    fill(&mut mmu, &mut mem);
    mmu.set_a20(false);
    assert_eq!(mmu.cached_entries(Direction::Read), 0);

    fill(&mut mmu, &mut mem);
    mmu.set_cr4(CR4_PSE);
    assert_eq!(mmu.cached_entries(Direction::Read), 0);

    fill(&mut mmu, &mut mem);
    mmu.set_cr0(CR0_PE);
    assert_eq!(mmu.cached_entries(Direction::Read), 0);
}

#[test]
fn page_table_writes_invalidate_cached_translations() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);
    // Map linear page 2 onto the page table itself so the guest can edit it.
    mem.write_u32_raw(PT_BASE + 8, PT_BASE as u32 | PTE_P | PTE_RW | PTE_US);

    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER),
        Ok(0x3010)
    );

    // Remap linear page 0 to 0x5000 through the linear alias.
    mmu.write_linear_u32(&mut mem, 0x2000, 0x5000 | PTE_P | PTE_RW | PTE_US, USER)
        .unwrap();
    assert_eq!(
        mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER),
        Ok(0x5010)
    );

    // Writes that do not touch a referenced table leave the cache alone.
    mmu.note_physical_write(0x9000);
    assert_eq!(mmu.cached_entries(Direction::Read), 1);
}

#[test]
fn invalidate_write_page_keeps_read_translations() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);
    mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Read, USER)
        .unwrap();
    mmu.lookup_or_translate(&mut mem, 0x10, AccessType::Write, USER)
        .unwrap();

    mmu.invalidate_write_page(0x3abc);
    assert_eq!(mmu.cached_entries(Direction::Read), 1);
    assert_eq!(mmu.cached_entries(Direction::Write), 0);

    mmu.invalidate_page(0x10);
    assert_eq!(mmu.cached_entries(Direction::Read), 0);
}

#[test]
fn translate_no_abort_has_no_side_effects() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);
    mmu.set_cr2(0xdead);
    mem.reset_counters();

    assert_eq!(
        mmu.translate_no_abort(&mut mem, 0x44, AccessType::Write, USER),
        Some(0x3044)
    );
    assert_eq!(
        mmu.translate_no_abort(&mut mem, 0x0040_0000, AccessType::Read, USER),
        None
    );
    assert_eq!(mem.writes, 0);
    assert_eq!(mem.read_u32_raw(PT_BASE) & (PTE_A | PTE_D), 0);
    assert_eq!(mmu.cr2(), 0xdead);
    assert_eq!(mmu.stats().page_walks, 0);
    assert_eq!(mmu.cached_entries(Direction::Write), 0);
}

#[test]
fn page_crossing_write_faults_before_touching_memory() {
    let mut mem = TestMemory::new(0x10000);
    let mut mmu = legacy_identity(&mut mem, 0x3000, PTE_P | PTE_RW | PTE_US);

    let err = mmu
        .write_linear_u32(&mut mem, 0xffe, 0x1122_3344, USER)
        .unwrap_err();
    assert_eq!(err.addr, 0x1000);
    assert_eq!(mem.data[0x3ffe], 0);
    assert_eq!(mem.data[0x3fff], 0);

    mem.write_u32_raw(PT_BASE + 4, 0x7000 | PTE_P | PTE_RW | PTE_US);
    mmu.write_linear_u32(&mut mem, 0xffe, 0x1122_3344, USER)
        .unwrap();
    assert_eq!(mem.data[0x3ffe], 0x44);
    assert_eq!(mem.data[0x7001], 0x11);
    assert_eq!(
        mmu.read_linear_u32(&mut mem, 0xffe, USER),
        Ok(0x1122_3344)
    );
}

#[test]
fn rejects_invalid_cache_capacity() {
    let err = Mmu::with_config(MmuConfig {
        tlb_capacity: 100,
        ..MmuConfig::default()
    })
    .unwrap_err();
    assert_eq!(err, ConfigError::TlbCapacity(100));
}

proptest! {
    #[test]
    fn cached_and_uncached_translation_agree(offsets in prop::collection::vec(0u32..0x0040_0000, 1..64)) {
        let mut mem = TestMemory::new(0x0050_0000);
        // Identity-map the first 4MB with one page table.
        mem.write_u32_raw(PD_BASE, PT_BASE as u32 | PTE_P | PTE_RW | PTE_US);
        for page in 0..1024u32 {
            mem.write_u32_raw(PT_BASE + page as u64 * 4, (page << 12) | PTE_P | PTE_RW | PTE_US);
        }
        let mut mmu = Mmu::with_config(MmuConfig { tlb_capacity: 16, ..MmuConfig::default() }).unwrap();
        mmu.set_cr3(PD_BASE as u32);
        mmu.set_cr0(CR0_PE | CR0_PG);

        for linear in offsets {
            let probed = mmu.translate_no_abort(&mut mem, linear, AccessType::Read, USER);
            let cached = mmu.lookup_or_translate(&mut mem, linear, AccessType::Read, USER).ok();
            prop_assert_eq!(probed, Some(linear as u64));
            prop_assert_eq!(cached, probed);
            prop_assert!(mmu.cached_entries(Direction::Read) <= 16);
        }
    }
}
