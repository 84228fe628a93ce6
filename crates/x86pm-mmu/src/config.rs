use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CPU generation. Several protection rules depend on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuClass {
    I286,
    I386,
    I486,
    Pentium,
}

impl CpuClass {
    /// `CR0.WP` only exists from the 486 onward.
    #[inline]
    pub fn has_write_protect(self) -> bool {
        self >= CpuClass::I486
    }

    /// The 286 ignores the top byte of descriptor bases.
    #[inline]
    pub fn has_32bit_descriptors(self) -> bool {
        self >= CpuClass::I386
    }
}

impl Default for CpuClass {
    fn default() -> Self {
        CpuClass::Pentium
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MmuConfig {
    pub class: CpuClass,
    /// Honour PDE bits 13..16 of 4MB pages as physical address bits 32..35.
    pub pse36: bool,
    /// Number of entries in each of the read and write translation rings.
    pub tlb_capacity: usize,
}

pub const MIN_TLB_CAPACITY: usize = 16;
pub const MAX_TLB_CAPACITY: usize = 4096;

impl Default for MmuConfig {
    fn default() -> Self {
        Self {
            class: CpuClass::default(),
            pse36: false,
            tlb_capacity: 256,
        }
    }
}

impl MmuConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let cap = self.tlb_capacity;
        if !cap.is_power_of_two() || !(MIN_TLB_CAPACITY..=MAX_TLB_CAPACITY).contains(&cap) {
            return Err(ConfigError::TlbCapacity(cap));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("translation cache capacity {0} must be a power of two between 16 and 4096")]
    TlbCapacity(usize),

    #[error("RAM size {0:#x} is not a multiple of the 4KiB page size")]
    RamSize(u64),
}
