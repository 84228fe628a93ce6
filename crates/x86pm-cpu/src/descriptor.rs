use x86pm_mmu::CpuClass;

/// Target of a call, interrupt, trap or task gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gate {
    pub selector: u16,
    pub offset: u32,
    /// Words (16-bit gate) or dwords (32-bit gate) copied on a stack switch.
    /// Always zero for anything but call gates.
    pub param_count: u8,
    pub dpl: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorKind {
    Data { writable: bool, expand_down: bool },
    Code { readable: bool, conforming: bool },
    AvailableTss16,
    BusyTss16,
    AvailableTss32,
    BusyTss32,
    Ldt,
    CallGate16(Gate),
    CallGate32(Gate),
    TaskGate(Gate),
    InterruptGate16(Gate),
    InterruptGate32(Gate),
    TrapGate16(Gate),
    TrapGate32(Gate),
    Invalid,
}

impl DescriptorKind {
    #[inline]
    pub fn is_tss(self) -> bool {
        matches!(
            self,
            Self::AvailableTss16 | Self::BusyTss16 | Self::AvailableTss32 | Self::BusyTss32
        )
    }

    #[inline]
    pub fn is_tss32(self) -> bool {
        matches!(self, Self::AvailableTss32 | Self::BusyTss32)
    }
}

/// An 8-byte segment or gate descriptor, kept as the four little-endian words
/// it is stored as in a descriptor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Descriptor {
    pub words: [u16; 4],
}

pub(crate) const ACCESS_PRESENT: u8 = 0x80;
pub(crate) const ACCESS_ACCESSED: u8 = 0x01;
/// Busy bit of a TSS type field.
pub(crate) const ACCESS_TSS_BUSY: u8 = 0x02;

impl Descriptor {
    #[inline]
    pub const fn from_words(words: [u16; 4]) -> Self {
        Self { words }
    }

    pub const fn from_raw(raw: u64) -> Self {
        Self {
            words: [
                raw as u16,
                (raw >> 16) as u16,
                (raw >> 32) as u16,
                (raw >> 48) as u16,
            ],
        }
    }

    pub const fn raw(&self) -> u64 {
        self.words[0] as u64
            | (self.words[1] as u64) << 16
            | (self.words[2] as u64) << 32
            | (self.words[3] as u64) << 48
    }

    /// Type, S, DPL and P.
    #[inline]
    pub const fn access(&self) -> u8 {
        (self.words[2] >> 8) as u8
    }

    /// G, D/B, AVL and limit bits 19:16.
    #[inline]
    pub const fn ar_high(&self) -> u8 {
        self.words[3] as u8
    }

    #[inline]
    pub const fn dpl(&self) -> u8 {
        (self.access() >> 5) & 3
    }

    #[inline]
    pub const fn is_present(&self) -> bool {
        self.access() & ACCESS_PRESENT != 0
    }

    #[inline]
    pub const fn is_system(&self) -> bool {
        self.access() & 0x10 == 0
    }

    /// D/B bit.
    #[inline]
    pub const fn is_big(&self) -> bool {
        self.ar_high() & 0x40 != 0
    }

    pub fn base(&self, class: CpuClass) -> u32 {
        let mut base = self.words[1] as u32 | ((self.words[2] & 0xff) as u32) << 16;
        if class.has_32bit_descriptors() {
            base |= ((self.words[3] >> 8) as u32) << 24;
        }
        base
    }

    /// Effective limit in bytes, with granularity applied.
    pub fn limit(&self, class: CpuClass) -> u32 {
        if !class.has_32bit_descriptors() {
            return self.words[0] as u32;
        }
        let limit = self.words[0] as u32 | ((self.words[3] & 0xf) as u32) << 16;
        if self.words[3] & 0x80 != 0 {
            (limit << 12) | 0xfff
        } else {
            limit
        }
    }

    pub fn kind(&self) -> DescriptorKind {
        let access = self.access();
        if !self.is_system() {
            return if access & 0x08 != 0 {
                DescriptorKind::Code {
                    readable: access & 0x02 != 0,
                    conforming: access & 0x04 != 0,
                }
            } else {
                DescriptorKind::Data {
                    writable: access & 0x02 != 0,
                    expand_down: access & 0x04 != 0,
                }
            };
        }

        let gate16 = Gate {
            selector: self.words[1],
            offset: self.words[0] as u32,
            param_count: 0,
            dpl: self.dpl(),
        };
        let gate32 = Gate {
            offset: gate16.offset | (self.words[3] as u32) << 16,
            ..gate16
        };
        let params = (self.words[2] & 0x1f) as u8;
        match access & 0x0f {
            0x1 => DescriptorKind::AvailableTss16,
            0x2 => DescriptorKind::Ldt,
            0x3 => DescriptorKind::BusyTss16,
            0x4 => DescriptorKind::CallGate16(Gate {
                param_count: params,
                ..gate16
            }),
            0x5 => DescriptorKind::TaskGate(Gate {
                offset: 0,
                ..gate16
            }),
            0x6 => DescriptorKind::InterruptGate16(gate16),
            0x7 => DescriptorKind::TrapGate16(gate16),
            0x9 => DescriptorKind::AvailableTss32,
            0xb => DescriptorKind::BusyTss32,
            0xc => DescriptorKind::CallGate32(Gate {
                param_count: params,
                ..gate32
            }),
            0xe => DescriptorKind::InterruptGate32(gate32),
            0xf => DescriptorKind::TrapGate32(gate32),
            _ => DescriptorKind::Invalid,
        }
    }

    /// Writable data segment, the only kind SS may hold.
    #[inline]
    pub fn is_writable_data(&self) -> bool {
        matches!(self.kind(), DescriptorKind::Data { writable: true, .. })
    }

    #[inline]
    pub fn is_code(&self) -> bool {
        matches!(self.kind(), DescriptorKind::Code { .. })
    }

    #[inline]
    pub fn is_conforming_code(&self) -> bool {
        matches!(
            self.kind(),
            DescriptorKind::Code {
                conforming: true,
                ..
            }
        )
    }

    /// Same descriptor with DPL replaced, as cached for a CS that runs at `cpl`.
    #[inline]
    pub(crate) fn with_dpl(self, dpl: u8) -> Self {
        let mut words = self.words;
        words[2] = (words[2] & !(3 << 13)) | ((dpl as u16 & 3) << 13);
        Self { words }
    }
}
