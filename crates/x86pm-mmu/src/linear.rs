//! Linear-address memory accessors routed through the translation cache.
//!
//! Accesses that straddle a page boundary translate both pages before any
//! byte moves, so a fault on the second page leaves memory untouched.

use crate::{AccessContext, AccessType, MemoryBus, Mmu, PageFault};

impl Mmu {
    #[inline]
    pub fn read_linear_u8(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        ctx: AccessContext,
    ) -> Result<u8, PageFault> {
        let paddr = self.lookup_or_translate(bus, linear, AccessType::Read, ctx)?;
        Ok(bus.read_u8(paddr))
    }

    pub fn read_linear_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        ctx: AccessContext,
    ) -> Result<u16, PageFault> {
        self.read_linear::<2>(bus, linear, AccessType::Read, ctx)
            .map(u16::from_le_bytes)
    }

    pub fn read_linear_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        ctx: AccessContext,
    ) -> Result<u32, PageFault> {
        self.read_linear::<4>(bus, linear, AccessType::Read, ctx)
            .map(u32::from_le_bytes)
    }

    pub fn read_linear_u64(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        ctx: AccessContext,
    ) -> Result<u64, PageFault> {
        self.read_linear::<8>(bus, linear, AccessType::Read, ctx)
            .map(u64::from_le_bytes)
    }

    /// Instruction fetch. Served from the read ring.
    pub fn fetch_linear_u8(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        ctx: AccessContext,
    ) -> Result<u8, PageFault> {
        let paddr = self.lookup_or_translate(bus, linear, AccessType::Execute, ctx)?;
        Ok(bus.read_u8(paddr))
    }

    pub fn write_linear_u8(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u8,
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        self.write_linear(bus, linear, &[value], ctx)
    }

    pub fn write_linear_u16(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u16,
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        self.write_linear(bus, linear, &value.to_le_bytes(), ctx)
    }

    pub fn write_linear_u32(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u32,
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        self.write_linear(bus, linear, &value.to_le_bytes(), ctx)
    }

    pub fn write_linear_u64(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        value: u64,
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        self.write_linear(bus, linear, &value.to_le_bytes(), ctx)
    }

    fn read_linear<const N: usize>(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        access: AccessType,
        ctx: AccessContext,
    ) -> Result<[u8; N], PageFault> {
        let mut buf = [0u8; N];
        let first = self.lookup_or_translate(bus, linear, access, ctx)?;
        let in_page = page_remaining(linear);
        if in_page >= N {
            bus.read_bytes(first, &mut buf);
            return Ok(buf);
        }

        let second =
            self.lookup_or_translate(bus, linear.wrapping_add(in_page as u32), access, ctx)?;
        bus.read_bytes(first, &mut buf[..in_page]);
        bus.read_bytes(second, &mut buf[in_page..]);
        Ok(buf)
    }

    fn write_linear(
        &mut self,
        bus: &mut impl MemoryBus,
        linear: u32,
        bytes: &[u8],
        ctx: AccessContext,
    ) -> Result<(), PageFault> {
        let first = self.lookup_or_translate(bus, linear, AccessType::Write, ctx)?;
        let in_page = page_remaining(linear);
        if in_page >= bytes.len() {
            bus.write_bytes(first, bytes);
            self.note_physical_write(first);
            return Ok(());
        }

        let second = self.lookup_or_translate(
            bus,
            linear.wrapping_add(in_page as u32),
            AccessType::Write,
            ctx,
        )?;
        bus.write_bytes(first, &bytes[..in_page]);
        bus.write_bytes(second, &bytes[in_page..]);
        self.note_physical_write(first);
        self.note_physical_write(second);
        Ok(())
    }
}

#[inline]
fn page_remaining(linear: u32) -> usize {
    0x1000 - (linear & 0xfff) as usize
}
