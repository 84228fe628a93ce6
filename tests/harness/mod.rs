#![allow(dead_code)]

use std::sync::Once;

use x86pm::cpu::{FarKind, Gpr};
use x86pm::mmu::CR0_PE;
use x86pm::{CpuContext, MemoryBus, PagedRam, SegReg};

pub const GDT_BASE: u32 = 0x1000;
pub const IDT_BASE: u32 = 0x2000;
pub const KCODE: u16 = 0x08;
pub const KDATA: u16 = 0x10;
pub const UCODE: u16 = 0x1b;
pub const UDATA: u16 = 0x23;
pub const KSTACK_TOP: u32 = 0x8000;

static TRACING: Once = Once::new();

/// Route `tracing` output through the test harness. `RUST_LOG` selects levels.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn seg_desc(base: u32, limit: u32, access: u8, flags: u8) -> u64 {
    (limit as u64 & 0xffff)
        | (base as u64 & 0xff_ffff) << 16
        | (access as u64) << 40
        | ((limit as u64 >> 16) & 0xf) << 48
        | ((flags as u64) & 0xf) << 52
        | ((base as u64) >> 24) << 56
}

pub fn gate_desc(selector: u16, offset: u32, access: u8, params: u8) -> u64 {
    (offset as u64 & 0xffff)
        | (selector as u64) << 16
        | (params as u64 & 0x1f) << 32
        | (access as u64) << 40
        | ((offset as u64) >> 16) << 48
}

pub fn write_gdt(ram: &mut PagedRam, selector: u16, raw: u64) {
    ram.write_u64((GDT_BASE + (selector as u32 & !7)) as u64, raw);
}

pub fn write_idt(ram: &mut PagedRam, vector: u8, raw: u64) {
    ram.write_u64((IDT_BASE + vector as u32 * 8) as u64, raw);
}

/// Ring 0 with flat code/data and ring 3 code/data descriptors installed.
pub fn flat_protected_mode(ram: &mut PagedRam, cpu: &mut CpuContext) -> anyhow::Result<()> {
    write_gdt(ram, KCODE, 0x00cf_9a00_0000_ffff);
    write_gdt(ram, KDATA, 0x00cf_9200_0000_ffff);
    write_gdt(ram, UCODE, 0x00cf_fa00_0000_ffff);
    write_gdt(ram, UDATA, 0x00cf_f200_0000_ffff);

    cpu.lgdt(GDT_BASE, 0xff);
    cpu.lidt(IDT_BASE, 0x7ff);
    cpu.mmu.set_cr0(cpu.mmu.cr0() | CR0_PE);
    cpu.load_code_segment_far(ram, KCODE, 0, 0, FarKind::Jmp)?;
    cpu.load_stack_segment(ram, KDATA)?;
    cpu.set_gpr(Gpr::Esp, KSTACK_TOP);
    for reg in [SegReg::Ds, SegReg::Es, SegReg::Fs, SegReg::Gs] {
        cpu.load_data_segment(ram, reg, KDATA)?;
    }
    Ok(())
}
