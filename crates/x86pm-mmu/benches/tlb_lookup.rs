#[cfg(target_arch = "wasm32")]
fn main() {}

#[cfg(not(target_arch = "wasm32"))]
use std::time::Duration;

#[cfg(not(target_arch = "wasm32"))]
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
#[cfg(not(target_arch = "wasm32"))]
use x86pm_mmu::{
    AccessContext, AccessType, MemoryBus, Mmu, PagedRam, CR0_PE, CR0_PG, CR4_PAE, PTE_P, PTE_RW,
    PTE_US,
};

#[cfg(not(target_arch = "wasm32"))]
fn criterion_config() -> Criterion {
    match std::env::var("X86PM_BENCH_PROFILE").as_deref() {
        Ok("ci") => Criterion::default()
            .warm_up_time(Duration::from_millis(200))
            .measurement_time(Duration::from_secs(1))
            .sample_size(10)
            .noise_threshold(0.05),
        _ => Criterion::default()
            .warm_up_time(Duration::from_secs(1))
            .measurement_time(Duration::from_secs(2))
            .sample_size(30)
            .noise_threshold(0.03),
    }
}

#[cfg(not(target_arch = "wasm32"))]
const FLAGS: u32 = PTE_P | PTE_RW | PTE_US;

#[cfg(not(target_arch = "wasm32"))]
fn legacy32_setup() -> (Mmu, PagedRam) {
    let mut ram = PagedRam::new(0x20_000).unwrap();
    ram.write_u32(0x1000, 0x2000 | FLAGS);
    ram.write_u32(0x2000, 0x8000 | FLAGS);

    let mut mmu = Mmu::new();
    mmu.set_cr3(0x1000);
    mmu.set_cr0(CR0_PE | CR0_PG);
    (mmu, ram)
}

#[cfg(not(target_arch = "wasm32"))]
fn pae_setup() -> (Mmu, PagedRam) {
    let mut ram = PagedRam::new(0x20_000).unwrap();
    ram.write_u64(0x1000, 0x2000 | PTE_P as u64);
    ram.write_u64(0x2000, 0x3000 | FLAGS as u64);
    ram.write_u64(0x3000, 0x8000 | FLAGS as u64);

    let mut mmu = Mmu::new();
    mmu.set_cr3(0x1000);
    mmu.set_cr4(CR4_PAE);
    mmu.set_cr0(CR0_PE | CR0_PG);
    (mmu, ram)
}

#[cfg(not(target_arch = "wasm32"))]
fn bench_tlb_lookup(c: &mut Criterion) {
    let ctx = AccessContext::with_cpl(3);
    let linear = 0x234u32;

    let mut group = c.benchmark_group("tlb_lookup");
    group.throughput(Throughput::Elements(1));

    for (name, setup) in [
        ("hit_legacy32_4k_read", legacy32_setup as fn() -> (Mmu, PagedRam)),
        ("hit_pae_4k_read", pae_setup),
    ] {
        let (mut mmu, mut ram) = setup();
        // Populate the read ring once via a page walk.
        let warm = mmu
            .lookup_or_translate(&mut ram, linear, AccessType::Read, ctx)
            .unwrap();
        black_box(warm);

        group.bench_function(name, |b| {
            b.iter(|| {
                let paddr = mmu
                    .lookup_or_translate(&mut ram, black_box(linear), AccessType::Read, ctx)
                    .unwrap();
                black_box(paddr)
            })
        });
    }

    let (mut mmu, mut ram) = legacy32_setup();
    group.bench_function("miss_legacy32_4k_write", |b| {
        b.iter(|| {
            mmu.invalidate_all();
            let paddr = mmu
                .lookup_or_translate(&mut ram, black_box(linear), AccessType::Write, ctx)
                .unwrap();
            black_box(paddr)
        })
    });
    group.finish();
}

#[cfg(not(target_arch = "wasm32"))]
criterion_group! {
    name = benches;
    config = criterion_config();
    targets = bench_tlb_lookup
}
#[cfg(not(target_arch = "wasm32"))]
criterion_main!(benches);
