use std::collections::{HashMap, HashSet};

/// Which translation ring an access is served from.
///
/// Reads and instruction fetches share the read ring; writes have their own
/// ring so a read-only mapping never satisfies a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Read,
    Write,
}

/// Marker for unused slots in [`TlbEntry::table_frames`].
pub(crate) const NO_FRAME: u64 = u64::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TlbEntry {
    /// Linear page number (`linear >> 12`).
    pub(crate) page: u32,
    /// Physical frame number (`paddr >> 12`), already A20-masked.
    pub(crate) frame: u64,
    pub(crate) user: bool,
    pub(crate) writable: bool,
    /// Frames of the paging structures that produced this entry.
    pub(crate) table_frames: [u64; 3],
}

impl TlbEntry {
    #[inline]
    pub(crate) fn translate(&self, linear: u32) -> u64 {
        (self.frame << 12) | (linear & 0xfff) as u64
    }
}

/// Fixed-size ring of translations with O(1) lookup by linear page.
#[derive(Debug, Clone)]
struct Ring {
    slots: Vec<Option<TlbEntry>>,
    index: HashMap<u32, usize>,
    next: usize,
}

impl Ring {
    fn new(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
            index: HashMap::with_capacity(capacity),
            next: 0,
        }
    }

    #[inline]
    fn lookup(&self, page: u32) -> Option<&TlbEntry> {
        let slot = *self.index.get(&page)?;
        self.slots[slot].as_ref()
    }

    fn insert(&mut self, entry: TlbEntry) {
        if self.index.contains_key(&entry.page) {
            return;
        }
        let slot = self.next;
        if let Some(old) = self.slots[slot].take() {
            self.index.remove(&old.page);
        }
        self.slots[slot] = Some(entry);
        self.index.insert(entry.page, slot);
        self.next = (slot + 1) % self.slots.len();
    }

    fn remove_where(&mut self, mut pred: impl FnMut(&TlbEntry) -> bool) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(&mut pred) {
                if let Some(old) = slot.take() {
                    self.index.remove(&old.page);
                }
            }
        }
    }

    fn clear(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
        self.index.clear();
        self.next = 0;
    }

    #[inline]
    fn len(&self) -> usize {
        self.index.len()
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Tlb {
    read: Ring,
    write: Ring,
    /// Over-approximation of page-table frames referenced by live entries.
    /// Only shrinks on a full flush.
    table_frames: HashSet<u64>,
}

impl Tlb {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            read: Ring::new(capacity),
            write: Ring::new(capacity),
            table_frames: HashSet::new(),
        }
    }

    #[inline]
    fn ring(&self, dir: Direction) -> &Ring {
        match dir {
            Direction::Read => &self.read,
            Direction::Write => &self.write,
        }
    }

    #[inline]
    pub(crate) fn lookup(&self, dir: Direction, linear: u32) -> Option<&TlbEntry> {
        self.ring(dir).lookup(linear >> 12)
    }

    pub(crate) fn insert(&mut self, dir: Direction, entry: TlbEntry) {
        self.table_frames.extend(
            entry
                .table_frames
                .iter()
                .copied()
                .filter(|&frame| frame != NO_FRAME),
        );
        match dir {
            Direction::Read => self.read.insert(entry),
            Direction::Write => self.write.insert(entry),
        }
    }

    pub(crate) fn flush_all(&mut self) {
        self.read.clear();
        self.write.clear();
        self.table_frames.clear();
    }

    pub(crate) fn invalidate_page(&mut self, linear: u32) {
        let page = linear >> 12;
        self.read.remove_where(|e| e.page == page);
        self.write.remove_where(|e| e.page == page);
    }

    pub(crate) fn invalidate_write_frame(&mut self, frame: u64) {
        self.write.remove_where(|e| e.frame == frame);
    }

    #[inline]
    pub(crate) fn references_table_frame(&self, frame: u64) -> bool {
        self.table_frames.contains(&frame)
    }

    #[inline]
    pub(crate) fn len(&self, dir: Direction) -> usize {
        self.ring(dir).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(page: u32, frame: u64) -> TlbEntry {
        TlbEntry {
            page,
            frame,
            user: true,
            writable: true,
            table_frames: [1, 2, NO_FRAME],
        }
    }

    #[test]
    fn ring_evicts_oldest_entry_first() {
        let mut tlb = Tlb::new(4);
        for page in 0..4u32 {
            tlb.insert(Direction::Read, entry(page, page as u64 + 0x100));
        }
        assert_eq!(tlb.len(Direction::Read), 4);

        tlb.insert(Direction::Read, entry(9, 0x109));
        assert!(tlb.lookup(Direction::Read, 0).is_none());
        assert!(tlb.lookup(Direction::Read, 1 << 12).is_some());
        assert_eq!(
            tlb.lookup(Direction::Read, (9 << 12) | 0x34)
                .map(|e| e.translate((9 << 12) | 0x34)),
            Some(0x109_034)
        );
    }

    #[test]
    fn duplicate_insert_keeps_a_single_entry() {
        let mut tlb = Tlb::new(16);
        tlb.insert(Direction::Write, entry(5, 0x10));
        tlb.insert(Direction::Write, entry(5, 0x20));
        assert_eq!(tlb.len(Direction::Write), 1);
        assert_eq!(tlb.lookup(Direction::Write, 5 << 12).map(|e| e.frame), Some(0x10));
        assert_eq!(tlb.len(Direction::Read), 0);
    }

    #[test]
    fn write_frame_invalidation_only_touches_write_ring() {
        let mut tlb = Tlb::new(16);
        tlb.insert(Direction::Read, entry(1, 0x42));
        tlb.insert(Direction::Write, entry(1, 0x42));
        tlb.insert(Direction::Write, entry(2, 0x43));

        tlb.invalidate_write_frame(0x42);
        assert!(tlb.lookup(Direction::Read, 1 << 12).is_some());
        assert!(tlb.lookup(Direction::Write, 1 << 12).is_none());
        assert!(tlb.lookup(Direction::Write, 2 << 12).is_some());
    }

    #[test]
    fn flush_forgets_table_frames() {
        let mut tlb = Tlb::new(16);
        tlb.insert(Direction::Read, entry(1, 0x42));
        assert!(tlb.references_table_frame(2));
        tlb.flush_all();
        assert!(!tlb.references_table_frame(2));
        assert_eq!(tlb.len(Direction::Read), 0);
    }
}
