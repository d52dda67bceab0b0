//! The region registry tracks every live large allocation (requests
//! larger than [`crate::class::MAX_SLAB_OBJECT_SIZE`]) by its base
//! address, in an open-addressed hash table. It exists so `free`,
//! `realloc`, and `malloc_usable_size` can recover a pointer's size
//! and guard layout without any header stored next to the user's
//! data — the same out-of-band-metadata property the slab engine
//! keeps for small objects.
//!
//! The table lives in two pre-reserved buffers and grows by rehashing
//! from whichever is active into the other ("ping-pong"): the base
//! address of each buffer is fixed for the process's life (recorded
//! once in [`crate::root::ProtectedRoot`]), only the committed prefix
//! and the active index change.
use std::mem::size_of;
use std::ptr::NonNull;

use crate::error::{fatal, Error, Result};
use crate::prng::Rng;
use crate::provider::PageProvider;

/// One live large allocation. The leading and trailing guards start
/// out equal (both `guard_size`) but can drift apart: shrinking an
/// allocation in place folds the freed tail into the trailing guard
/// only, so the two are tracked separately rather than assumed
/// symmetric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionEntry {
    pub base: u64,
    pub size: u64,
    pub guard_size: u64,
    pub trailing_guard_size: u64,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    occupied: bool,
    entry: RegionEntry,
}

const EMPTY_SLOT: Slot = Slot {
    occupied: false,
    entry: RegionEntry { base: 0, size: 0, guard_size: 0, trailing_guard_size: 0 },
};

/// A raw buffer of `Slot`s, reserved in full up front and committed
/// page-by-page as the table's capacity grows into it.
struct RegionBuffer {
    addr: u64,
    reserved_slots: usize,
    committed_slots: usize,
}

impl RegionBuffer {
    fn reserve(provider: &dyn PageProvider, reserved_slots: usize) -> Result<Self> {
        let bytes = reserved_slots * size_of::<Slot>();
        let ptr = provider.map(page_round(bytes, provider.page_size()))?;
        Ok(RegionBuffer {
            addr: ptr.as_ptr() as usize as u64,
            reserved_slots,
            committed_slots: 0,
        })
    }

    fn ensure_committed(&mut self, provider: &dyn PageProvider, slots: usize) -> Result<()> {
        if slots <= self.committed_slots {
            return Ok(());
        }
        if slots > self.reserved_slots {
            return Err(Error::OutOfMemory);
        }

        let page_size = provider.page_size();
        let bytes = page_round(slots * size_of::<Slot>(), page_size);
        let ptr = NonNull::new(self.addr as *mut std::ffi::c_void).expect("buffer address is non-null");
        provider.protect_rw(ptr, bytes)?;
        self.committed_slots = bytes / size_of::<Slot>();
        Ok(())
    }

    fn slot_ptr(&self, idx: usize) -> *mut Slot {
        (self.addr as usize + idx * size_of::<Slot>()) as *mut Slot
    }

    fn get(&self, idx: usize) -> Slot {
        unsafe { *self.slot_ptr(idx) }
    }

    fn set(&mut self, idx: usize, slot: Slot) {
        unsafe {
            *self.slot_ptr(idx) = slot;
        }
    }
}

fn page_round(n: usize, page_size: usize) -> usize {
    (n + page_size - 1) & !(page_size - 1)
}

/// Initial live capacity; small enough that most processes never grow
/// past it, large enough to avoid rehashing on the first few inserts.
const INITIAL_CAPACITY: usize = 256;

/// Total address space reserved per buffer, as a slot count. Growth
/// beyond this is an out-of-memory condition — in practice it would
/// require tracking billions of concurrently live large allocations.
#[cfg(not(feature = "test_only_small_constants"))]
const MAX_CAPACITY: usize = 1 << 24;
#[cfg(feature = "test_only_small_constants")]
const MAX_CAPACITY: usize = 1 << 10;

pub(crate) struct RegionTable {
    buffers: [RegionBuffer; 2],
    active: usize,
    capacity: usize,
    count: usize,
    rng: Rng,
}

impl RegionTable {
    pub fn new(provider: &dyn PageProvider) -> Result<Self> {
        let mut a = RegionBuffer::reserve(provider, MAX_CAPACITY)?;
        let b = RegionBuffer::reserve(provider, MAX_CAPACITY)?;
        a.ensure_committed(provider, INITIAL_CAPACITY)?;

        Ok(RegionTable {
            buffers: [a, b],
            active: 0,
            capacity: INITIAL_CAPACITY,
            count: 0,
            rng: Rng::new(),
        })
    }

    /// Draws a randomized guard size for a new large allocation of
    /// `n` bytes: `(uniform(n / page / 8) + 1) * page_size`, so bigger
    /// requests get (on average) proportionally bigger guards without
    /// a fixed, guessable width.
    pub fn draw_guard_size(&mut self, n: usize, page_size: usize) -> usize {
        let bound = (n / page_size / 8) as u64;
        let pages = self.rng.uniform_u64(bound) + 1;
        pages as usize * page_size
    }

    /// Addresses of the two reserved buffers, for recording in the
    /// protected root.
    pub fn buffer_addresses(&self) -> [u64; 2] {
        [self.buffers[0].addr, self.buffers[1].addr]
    }

    pub fn insert(&mut self, entry: RegionEntry, provider: &dyn PageProvider) -> Result<()> {
        if (self.count + 1) * 4 > self.capacity * 3 {
            self.grow(provider)?;
        }

        let mask = self.capacity - 1;
        let mut i = home_index(entry.base, mask);
        loop {
            let slot = self.buffers[self.active].get(i);
            if !slot.occupied {
                self.buffers[self.active].set(i, Slot { occupied: true, entry });
                self.count += 1;
                return Ok(());
            }
            if slot.entry.base == entry.base {
                fatal("region registry: duplicate base address registered");
            }
            i = i.wrapping_sub(1) & mask;
        }
    }

    pub fn lookup(&self, base: u64) -> Option<RegionEntry> {
        let mask = self.capacity - 1;
        let mut i = home_index(base, mask);
        loop {
            let slot = self.buffers[self.active].get(i);
            if !slot.occupied {
                return None;
            }
            if slot.entry.base == base {
                return Some(slot.entry);
            }
            i = i.wrapping_sub(1) & mask;
        }
    }

    /// Removes and returns the entry for `base`. `None` if not found.
    pub fn remove(&mut self, base: u64) -> Option<RegionEntry> {
        let mask = self.capacity - 1;
        let mut i = home_index(base, mask);
        let removed = loop {
            let slot = self.buffers[self.active].get(i);
            if !slot.occupied {
                return None;
            }
            if slot.entry.base == base {
                break slot.entry;
            }
            i = i.wrapping_sub(1) & mask;
        };

        self.buffers[self.active].set(i, EMPTY_SLOT);

        // Backward-shift deletion: our probe sequence walks downward
        // from a key's home slot, so a following slot can fill the
        // hole only if doing so doesn't move it further from its own
        // home than it already was.
        let mut hole = i;
        loop {
            let j = hole.wrapping_sub(1) & mask;
            let slot_j = self.buffers[self.active].get(j);
            if !slot_j.occupied {
                break;
            }
            let home_j = home_index(slot_j.entry.base, mask);
            if probe_distance(home_j, hole, self.capacity) < probe_distance(home_j, j, self.capacity)
            {
                self.buffers[self.active].set(hole, slot_j);
                self.buffers[self.active].set(j, EMPTY_SLOT);
                hole = j;
            } else {
                break;
            }
        }

        self.count -= 1;
        Some(removed)
    }

    fn grow(&mut self, provider: &dyn PageProvider) -> Result<()> {
        let new_capacity = self.capacity * 2;
        let target = 1 - self.active;
        self.buffers[target].ensure_committed(provider, new_capacity)?;

        let mask = new_capacity - 1;
        for idx in 0..self.capacity {
            let slot = self.buffers[self.active].get(idx);
            if !slot.occupied {
                continue;
            }
            let mut i = home_index(slot.entry.base, mask);
            loop {
                if !self.buffers[target].get(i).occupied {
                    self.buffers[target].set(i, slot);
                    break;
                }
                i = i.wrapping_sub(1) & mask;
            }
        }

        self.active = target;
        self.capacity = new_capacity;
        log::debug!("rampart: region table grew to {} slots", new_capacity);
        Ok(())
    }
}

fn mix(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

fn home_index(base: u64, mask: usize) -> usize {
    (mix(base) as usize) & mask
}

/// Number of decrementing probe steps from `home` to reach `slot`.
fn probe_distance(home: usize, slot: usize, capacity: usize) -> usize {
    home.wrapping_sub(slot) & (capacity - 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::provider::MmapProvider;

    fn entry(base: u64) -> RegionEntry {
        RegionEntry { base, size: 4096, guard_size: 4096, trailing_guard_size: 4096 }
    }

    #[test]
    fn insert_then_lookup_roundtrips() {
        let provider = MmapProvider::new();
        let mut table = RegionTable::new(&provider).expect("table should reserve");

        table.insert(entry(0x1000), &provider).unwrap();
        table.insert(entry(0x2000), &provider).unwrap();

        assert_eq!(table.lookup(0x1000), Some(entry(0x1000)));
        assert_eq!(table.lookup(0x2000), Some(entry(0x2000)));
        assert_eq!(table.lookup(0x3000), None);
    }

    #[test]
    fn remove_then_lookup_misses() {
        let provider = MmapProvider::new();
        let mut table = RegionTable::new(&provider).expect("table should reserve");

        table.insert(entry(0x4000), &provider).unwrap();
        assert_eq!(table.remove(0x4000), Some(entry(0x4000)));
        assert_eq!(table.lookup(0x4000), None);
        assert_eq!(table.remove(0x4000), None);
    }

    #[test]
    fn grows_past_initial_capacity_without_losing_entries() {
        let provider = MmapProvider::new();
        let mut table = RegionTable::new(&provider).expect("table should reserve");

        let bases: Vec<u64> = (0..500).map(|i| 0x1000 * (i as u64 + 1)).collect();
        for &base in &bases {
            table.insert(entry(base), &provider).unwrap();
        }

        for &base in &bases {
            assert_eq!(table.lookup(base), Some(entry(base)), "lost entry for {:#x}", base);
        }
    }

    #[test]
    fn draw_guard_size_is_page_aligned_and_nonzero() {
        let provider = MmapProvider::new();
        let mut table = RegionTable::new(&provider).expect("table should reserve");
        let page_size = provider.page_size();

        for n in [page_size, page_size * 64, page_size * 4096] {
            let guard = table.draw_guard_size(n, page_size);
            assert!(guard >= page_size);
            assert_eq!(guard % page_size, 0);
        }
    }

    #[test]
    fn remove_in_cluster_preserves_other_members() {
        let provider = MmapProvider::new();
        let mut table = RegionTable::new(&provider).expect("table should reserve");

        // Force several bases into the same probe neighborhood by
        // inserting enough entries that collisions are likely, then
        // delete roughly half and confirm the rest are still found.
        let bases: Vec<u64> = (0..40).map(|i| 0x8000 + i as u64).collect();
        for &base in &bases {
            table.insert(entry(base), &provider).unwrap();
        }
        for &base in bases.iter().step_by(2) {
            table.remove(*base);
        }
        for (i, &base) in bases.iter().enumerate() {
            if i % 2 == 0 {
                assert_eq!(table.lookup(base), None);
            } else {
                assert_eq!(table.lookup(base), Some(entry(base)));
            }
        }
    }
}
