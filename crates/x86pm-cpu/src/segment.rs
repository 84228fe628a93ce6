use x86pm_mmu::CpuClass;

use crate::descriptor::{Descriptor, ACCESS_PRESENT};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SegReg {
    Es = 0,
    Cs = 1,
    Ss = 2,
    Ds = 3,
    Fs = 4,
    Gs = 5,
}

impl SegReg {
    pub const ALL: [SegReg; 6] = [
        SegReg::Es,
        SegReg::Cs,
        SegReg::Ss,
        SegReg::Ds,
        SegReg::Fs,
        SegReg::Gs,
    ];

    /// Registers nulled or revalidated on privilege changes.
    pub(crate) const DATA: [SegReg; 4] = [SegReg::Es, SegReg::Ds, SegReg::Fs, SegReg::Gs];
}

/// Hidden part of a segment register, loaded from a descriptor and never
/// revalidated against the table afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SegmentCache {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    /// Lowest valid offset.
    pub limit_low: u32,
    /// Highest valid offset.
    pub limit_high: u32,
    pub access: u8,
    pub ar_high: u8,
}

/// Base of a register loaded with a null selector in protected mode.
pub const UNUSABLE_BASE: u32 = 0xffff_ffff;

const REAL_MODE_ACCESS: u8 = 0x93;
const V86_ACCESS: u8 = 0xf3;

impl SegmentCache {
    /// Power-on state of every register except CS.
    pub const fn reset() -> Self {
        Self {
            selector: 0,
            base: 0,
            limit: 0xffff,
            limit_low: 0,
            limit_high: 0xffff,
            access: REAL_MODE_ACCESS,
            ar_high: 0,
        }
    }

    /// Null selector loaded in protected mode. Any access through it faults.
    pub const fn unusable() -> Self {
        Self {
            selector: 0,
            base: UNUSABLE_BASE,
            limit: 0,
            limit_low: 0,
            limit_high: 0,
            access: 0,
            ar_high: 0,
        }
    }

    /// Virtual-8086 register: base from the selector, 64KiB, DPL 3 read/write.
    pub const fn v86(selector: u16) -> Self {
        Self {
            selector,
            base: (selector as u32) << 4,
            limit: 0xffff,
            limit_low: 0,
            limit_high: 0xffff,
            access: V86_ACCESS,
            ar_high: 0,
        }
    }

    /// Real-mode load: only the selector and base change, so limits set up in
    /// protected mode survive ("unreal" mode).
    pub(crate) fn load_real(&mut self, selector: u16) {
        self.selector = selector;
        self.base = (selector as u32) << 4;
        if self.access & ACCESS_PRESENT == 0 {
            *self = Self {
                selector,
                base: (selector as u32) << 4,
                ..Self::reset()
            };
        }
    }

    pub fn from_descriptor(selector: u16, desc: &Descriptor, class: CpuClass) -> Self {
        let limit = desc.limit(class);
        let access = desc.access();
        let ar_high = desc.ar_high();
        let expand_down = access & 0x18 == 0x10 && access & 0x04 != 0;
        let (limit_low, limit_high) = if expand_down {
            let top = if ar_high & 0x40 != 0 {
                0xffff_ffff
            } else {
                0xffff
            };
            (limit.wrapping_add(1), top)
        } else {
            (0, limit)
        };
        Self {
            selector,
            base: desc.base(class),
            limit,
            limit_low,
            limit_high,
            access,
            ar_high,
        }
    }

    #[inline]
    pub fn dpl(&self) -> u8 {
        (self.access >> 5) & 3
    }

    #[inline]
    pub fn rpl(&self) -> u8 {
        (self.selector & 3) as u8
    }

    #[inline]
    pub fn is_usable(&self) -> bool {
        self.access & ACCESS_PRESENT != 0
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        self.access & 0x18 == 0x18
    }

    #[inline]
    pub fn is_conforming_code(&self) -> bool {
        self.is_code() && self.access & 0x04 != 0
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.access & 0x1a == 0x12
    }

    #[inline]
    pub fn is_readable(&self) -> bool {
        !self.is_code() || self.access & 0x02 != 0
    }

    /// D/B bit: 32-bit operand size for CS, 32-bit stack pointer for SS.
    #[inline]
    pub fn is_big(&self) -> bool {
        self.ar_high & 0x40 != 0
    }

    /// Whether `size` bytes at `offset` lie between `limit_low` and `limit_high`
    /// without wrapping.
    #[inline]
    pub fn contains(&self, offset: u32, size: u32) -> bool {
        match offset.checked_add(size.saturating_sub(1)) {
            Some(end) => offset >= self.limit_low && end <= self.limit_high,
            None => false,
        }
    }

    /// Whether this data or readable-code register stays loadable at `cpl`.
    /// Used to null DS/ES/FS/GS after returning to an outer privilege level.
    pub(crate) fn accessible_at(&self, cpl: u8) -> bool {
        match self.access & 0x1f {
            0x10..=0x17 | 0x1a | 0x1b => self.rpl() <= self.dpl() && cpl <= self.dpl(),
            0x1e | 0x1f => true,
            _ => false,
        }
    }
}

/// GDTR or IDTR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DescriptorTable {
    pub base: u32,
    pub limit: u32,
}

impl DescriptorTable {
    /// Linear address of the 8-byte entry at `offset`, if it fits under the limit.
    #[inline]
    pub fn entry(&self, offset: u32) -> Option<u32> {
        let last = offset.checked_add(7)?;
        (last <= self.limit).then(|| self.base.wrapping_add(offset))
    }
}

/// LDTR or TR: a selector plus the cached descriptor fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SystemSegment {
    pub selector: u16,
    pub base: u32,
    pub limit: u32,
    pub access: u8,
    pub ar_high: u8,
}

impl SystemSegment {
    pub fn from_descriptor(selector: u16, desc: &Descriptor, class: CpuClass) -> Self {
        Self {
            selector,
            base: desc.base(class),
            limit: desc.limit(class),
            access: desc.access(),
            ar_high: desc.ar_high(),
        }
    }

    #[inline]
    pub fn table(&self) -> DescriptorTable {
        DescriptorTable {
            base: self.base,
            limit: self.limit,
        }
    }

    /// 32-bit TSS types have bit 3 of the type field set.
    #[inline]
    pub fn is_tss32(&self) -> bool {
        self.access & 0x08 != 0
    }
}
