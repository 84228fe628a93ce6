use crate::{ConfigError, MemoryBus, PAGE_SIZE};

/// Guest RAM as an arena of lazily allocated 4KiB frames.
///
/// Untouched frames read as zero and cost no host memory. Accesses beyond the
/// end of RAM behave as open bus: reads return all ones and writes are dropped.
#[derive(Debug, Clone)]
pub struct PagedRam {
    frames: Vec<Option<Box<[u8; PAGE_SIZE]>>>,
}

impl PagedRam {
    pub fn new(size: u64) -> Result<Self, ConfigError> {
        if size % PAGE_SIZE as u64 != 0 {
            return Err(ConfigError::RamSize(size));
        }
        let count = (size / PAGE_SIZE as u64) as usize;
        Ok(Self {
            frames: vec![None; count],
        })
    }

    #[inline]
    pub fn size(&self) -> u64 {
        (self.frames.len() * PAGE_SIZE) as u64
    }

    #[inline]
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Bounds-checked view of an allocated frame.
    pub fn frame(&self, frame: u64) -> Option<&[u8; PAGE_SIZE]> {
        let slot = self.frames.get(usize::try_from(frame).ok()?)?;
        slot.as_deref()
    }

    fn frame_mut(&mut self, frame: u64) -> Option<&mut [u8; PAGE_SIZE]> {
        let slot = self.frames.get_mut(usize::try_from(frame).ok()?)?;
        Some(slot.get_or_insert_with(|| Box::new([0; PAGE_SIZE])))
    }

    fn load<const N: usize>(&mut self, paddr: u64) -> [u8; N] {
        let mut buf = [0u8; N];
        self.read_bytes(paddr, &mut buf);
        buf
    }
}

impl MemoryBus for PagedRam {
    fn read_u8(&mut self, paddr: u64) -> u8 {
        let frame = paddr >> 12;
        match usize::try_from(frame).ok().and_then(|f| self.frames.get(f)) {
            Some(Some(page)) => page[(paddr & 0xfff) as usize],
            Some(None) => 0,
            None => 0xff,
        }
    }

    fn read_u16(&mut self, paddr: u64) -> u16 {
        u16::from_le_bytes(self.load(paddr))
    }

    fn read_u32(&mut self, paddr: u64) -> u32 {
        u32::from_le_bytes(self.load(paddr))
    }

    fn read_u64(&mut self, paddr: u64) -> u64 {
        u64::from_le_bytes(self.load(paddr))
    }

    fn write_u8(&mut self, paddr: u64, value: u8) {
        if let Some(page) = self.frame_mut(paddr >> 12) {
            page[(paddr & 0xfff) as usize] = value;
        }
    }

    fn write_u16(&mut self, paddr: u64, value: u16) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u32(&mut self, paddr: u64, value: u32) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn write_u64(&mut self, paddr: u64, value: u64) {
        self.write_bytes(paddr, &value.to_le_bytes());
    }

    fn read_bytes(&mut self, paddr: u64, dst: &mut [u8]) {
        let mut done = 0usize;
        while done < dst.len() {
            let addr = paddr.wrapping_add(done as u64);
            let off = (addr & 0xfff) as usize;
            let chunk = (PAGE_SIZE - off).min(dst.len() - done);
            let out = &mut dst[done..done + chunk];
            match usize::try_from(addr >> 12).ok().and_then(|f| self.frames.get(f)) {
                Some(Some(page)) => out.copy_from_slice(&page[off..off + chunk]),
                Some(None) => out.fill(0),
                None => out.fill(0xff),
            }
            done += chunk;
        }
    }

    fn write_bytes(&mut self, paddr: u64, src: &[u8]) {
        let mut done = 0usize;
        while done < src.len() {
            let addr = paddr.wrapping_add(done as u64);
            let off = (addr & 0xfff) as usize;
            let chunk = (PAGE_SIZE - off).min(src.len() - done);
            if let Some(page) = self.frame_mut(addr >> 12) {
                page[off..off + chunk].copy_from_slice(&src[done..done + chunk]);
            }
            done += chunk;
        }
    }
}
