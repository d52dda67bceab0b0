//! The slab engine is the allocator's hot path: a per-class bitmap
//! allocator over slabs carved out of a single, huge, pre-reserved
//! region (see [`crate::slab_region`]). All metadata — the
//! occupancy bitmap, the intrusive list links, the canary — lives
//! out-of-band in a per-class metadata array, never inside the slab
//! itself.
use std::ptr::NonNull;

use crate::class::{self, SizeClassInfo, CLASSES, N_CLASSES};
use crate::config::Config;
use crate::error::{fatal, Error, Result};
use crate::lock::Guarded;
use crate::prng::Rng;
use crate::provider::PageProvider;
use crate::slab_region::SlabLayout;

/// Bytes reserved at the tail of every slot for the canary, once
/// canaries are enabled. Matches the 8-byte inflation the dispatcher
/// applies before classifying a request (see `crate::dispatch`).
pub(crate) const CANARY_SIZE: usize = 8;

/// One metadata record per slab, out-of-band from the slab's data.
#[derive(Debug, Clone, Copy)]
struct SlabMeta {
    bitmap: u64,
    prev: Option<u32>,
    next: Option<u32>,
    canary_value: u64,
}

impl SlabMeta {
    fn fresh(canary_value: u64) -> Self {
        SlabMeta {
            bitmap: 0,
            prev: None,
            next: None,
            canary_value,
        }
    }
}

/// Per-class mutable state: the metadata array and the partial/empty/
/// free slab lists. Protected by the class's [`Guarded`] lock.
struct ClassState {
    metadata: Vec<SlabMeta>,
    partial_head: Option<u32>,
    empty_head: Option<u32>,
    free_head: Option<u32>,
    free_tail: Option<u32>,
    empty_slabs_total: usize,
    rng: Rng,
}

impl ClassState {
    fn new() -> Self {
        ClassState {
            metadata: Vec::new(),
            partial_head: None,
            empty_head: None,
            free_head: None,
            free_tail: None,
            empty_slabs_total: 0,
            rng: Rng::new(),
        }
    }
}

/// Everything about one size class that is fixed once the allocator
/// finishes initializing: its geometry within the slab region, and
/// the lock-protected state that changes on every allocate/free.
pub(crate) struct ClassRuntime {
    pub info: SizeClassInfo,
    /// `info.size`, or the minimum slot stride for the sentinel class
    /// (size-0 requests still need a real, unique, freeable address).
    effective_size: u32,
    pub layout: SlabLayout,
    state: Guarded<ClassState>,
}

/// Minimum physical slot stride, used only for the size-0 sentinel
/// class so `malloc(0)` still returns a unique, freeable pointer.
const MIN_SLOT_STRIDE: u32 = 16;

impl ClassRuntime {
    pub fn new(info: SizeClassInfo, layout: SlabLayout) -> Self {
        ClassRuntime {
            info,
            effective_size: if info.size == 0 { MIN_SLOT_STRIDE } else { info.size },
            layout,
            state: Guarded::new(ClassState::new()),
        }
    }

    fn slot_stride(&self) -> usize {
        self.effective_size as usize
    }

    /// Number of slabs this class could ever have, given its share of
    /// the slab region.
    fn max_slabs(&self) -> usize {
        (self.layout.usable_size / self.layout.slab_stride) as usize
    }

    fn slab_address(&self, logical_idx: u32) -> u64 {
        self.layout.class_start + (logical_idx as u64) * self.layout.slab_stride
    }

    fn slot_pointer(&self, slab_addr: u64, slot: u32) -> usize {
        (slab_addr as usize) + (slot as usize) * self.slot_stride()
    }

    /// Attempts to service a `requested`-byte allocation from this
    /// class. `requested` is the already-canary-inflated, already
    /// class-rounded size; `0` means this is the size-0 sentinel
    /// path, which skips the write-after-free check and canary.
    pub fn allocate(
        &self,
        requested: usize,
        provider: &dyn PageProvider,
        config: &Config,
    ) -> Result<NonNull<u8>> {
        self.state.with(|state| {
            let (slab_idx, slot, fresh_slab) = if let Some(head) = state.partial_head {
                let slot = pick_free_slot(state.metadata[head as usize].bitmap, self.info.slots, &mut state.rng);
                set_bit(&mut state.metadata[head as usize].bitmap, slot);
                if is_full(state.metadata[head as usize].bitmap, self.info.slots) {
                    unlink_partial(state, head);
                }
                (head, slot, false)
            } else if let Some(head) = state.empty_head {
                state.empty_head = state.metadata[head as usize].next;
                state.empty_slabs_total -= self.layout.slab_size;
                link_partial(state, head);
                let slot = pick_free_slot(0, self.info.slots, &mut state.rng);
                set_bit(&mut state.metadata[head as usize].bitmap, slot);
                (head, slot, false)
            } else if let Some(head) = state.free_head {
                state.free_head = state.metadata[head as usize].next;
                if state.free_head.is_none() {
                    state.free_tail = None;
                }
                let slab_addr = self.slab_address(head);
                if requested != 0 {
                    provider.protect_rw(
                        NonNull::new(slab_addr as *mut std::ffi::c_void).expect("slab address is non-null"),
                        self.layout.slab_size,
                    )?;
                }
                state.metadata[head as usize].canary_value = draw_canary(&mut state.rng);
                link_partial(state, head);
                let slot = pick_free_slot(0, self.info.slots, &mut state.rng);
                set_bit(&mut state.metadata[head as usize].bitmap, slot);
                (head, slot, true)
            } else {
                if state.metadata.len() >= self.max_slabs() {
                    return Err(Error::OutOfMemory);
                }
                let idx = state.metadata.len() as u32;
                let slab_addr = self.slab_address(idx);
                if requested != 0 {
                    provider.protect_rw(
                        NonNull::new(slab_addr as *mut std::ffi::c_void).expect("slab address is non-null"),
                        self.layout.slab_size,
                    )?;
                }
                let canary = draw_canary(&mut state.rng);
                state.metadata.push(SlabMeta::fresh(canary));
                link_partial(state, idx);
                let slot = pick_free_slot(0, self.info.slots, &mut state.rng);
                set_bit(&mut state.metadata[idx as usize].bitmap, slot);
                (idx, slot, true)
            };

            let slab_addr = self.slab_address(slab_idx);
            let slot_ptr = self.slot_pointer(slab_addr, slot);

            if requested != 0 {
                let object_bytes = self.effective_size as usize - canary_reservation(config);
                let slice = unsafe {
                    std::slice::from_raw_parts(slot_ptr as *const u8, object_bytes)
                };
                if config.zero_on_free && !fresh_slab && slice.iter().any(|&b| b != 0) {
                    fatal("write-after-free: freed bytes were modified before reuse");
                }

                if config.canaries {
                    let canary = state.metadata[slab_idx as usize].canary_value;
                    unsafe {
                        std::ptr::write_unaligned(
                            (slot_ptr + object_bytes) as *mut u64,
                            canary,
                        );
                    }
                }
            }

            #[cfg(feature = "trace-allocations")]
            log::trace!(
                "rampart: allocate class={} slab={} slot={}",
                self.info.size,
                slab_idx,
                slot
            );

            Ok(NonNull::new(slot_ptr as *mut u8).expect("slot pointer is non-null"))
        })
    }

    /// Releases `p`, previously returned by [`ClassRuntime::allocate`]
    /// for this class. `expected` is the size passed to a sized-free
    /// API (e.g. `free_sized`), if any.
    pub fn deallocate(
        &self,
        p: NonNull<u8>,
        expected: Option<usize>,
        provider: &dyn PageProvider,
        config: &Config,
    ) {
        let addr = p.as_ptr() as usize as u64;
        let offset = addr - self.layout.class_start;
        let slab_idx = (offset / self.layout.slab_stride) as u32;

        self.state.with(|state| {
            if slab_idx as usize >= state.metadata.len() {
                fatal("invalid free: slab index beyond metadata high-water mark");
            }

            let slab_addr = self.slab_address(slab_idx);
            let within_slab = addr - slab_addr;
            let slot = (within_slab / self.slot_stride() as u64) as u32;

            if self.slot_pointer(slab_addr, slot) as u64 != addr {
                fatal("invalid free: pointer is not aligned to a slot boundary");
            }

            if let Some(expected_size) = expected {
                if expected_size != self.info.size as usize {
                    fatal("sized deallocation mismatch");
                }
            }

            if !get_bit(state.metadata[slab_idx as usize].bitmap, slot) {
                fatal("double free");
            }

            let was_full = is_full(state.metadata[slab_idx as usize].bitmap, self.info.slots);

            if self.info.size != 0 {
                let object_bytes = self.effective_size as usize - canary_reservation(config);

                if config.canaries {
                    let expected_canary = state.metadata[slab_idx as usize].canary_value;
                    let actual = unsafe {
                        std::ptr::read_unaligned((addr as usize + object_bytes) as *const u64)
                    };
                    if actual != expected_canary {
                        fatal("canary corrupted: linear overflow detected");
                    }
                }

                if config.zero_on_free {
                    unsafe {
                        std::ptr::write_bytes(addr as usize as *mut u8, 0, object_bytes);
                    }
                }
            }

            if was_full {
                link_partial(state, slab_idx);
            }

            clear_bit(&mut state.metadata[slab_idx as usize].bitmap, slot);

            if state.metadata[slab_idx as usize].bitmap == 0 {
                unlink_partial(state, slab_idx);

                if state.empty_slabs_total + self.layout.slab_size > config.empty_cache_budget {
                    let slab_addr_ptr = NonNull::new(slab_addr as *mut std::ffi::c_void)
                        .expect("slab address is non-null");
                    match provider.map_fixed(slab_addr_ptr, self.layout.slab_size) {
                        Ok(()) => {
                            push_free(state, slab_idx);
                            log::debug!(
                                "rampart: class={} slab={} -> free (decommitted)",
                                self.info.size,
                                slab_idx
                            );
                            return;
                        }
                        Err(e) => {
                            log::warn!(
                                "rampart: map_fixed failed ({:?}); keeping slab {} committed",
                                e,
                                slab_idx
                            );
                        }
                    }
                }

                push_empty(state, slab_idx);
                state.empty_slabs_total += self.layout.slab_size;
                log::debug!(
                    "rampart: class={} slab={} -> empty",
                    self.info.size,
                    slab_idx
                );
            }
        })
    }

    /// Implements `malloc_trim`'s contribution for this class: walks
    /// the empty list, decommits every slab, and moves it to the free
    /// list. Stops at the first decommit failure. Returns whether
    /// anything was trimmed.
    pub fn trim(&self, provider: &dyn PageProvider) -> bool {
        self.state.with(|state| {
            let mut trimmed = false;
            while let Some(head) = state.empty_head {
                let slab_addr = self.slab_address(head);
                let ptr = NonNull::new(slab_addr as *mut std::ffi::c_void)
                    .expect("slab address is non-null");
                match provider.map_fixed(ptr, self.layout.slab_size) {
                    Ok(()) => {
                        state.empty_head = state.metadata[head as usize].next;
                        state.empty_slabs_total -= self.layout.slab_size;
                        push_free(state, head);
                        trimmed = true;
                    }
                    Err(_) => break,
                }
            }
            trimmed
        })
    }

    /// Locks this class's state without releasing it; pairs with
    /// [`ClassRuntime::raw_unlock`]. Used only by the fork coordinator
    /// in `crate::root`.
    pub(crate) fn raw_lock(&self) {
        self.state.raw_lock();
    }

    pub(crate) fn raw_unlock(&self) {
        self.state.raw_unlock();
    }

    /// Rebuilds this class's lock and re-seeds its PRNG after
    /// `fork()`, in the child. The metadata array and list heads are
    /// left untouched: they describe real committed memory that the
    /// child still owns.
    pub(crate) fn post_fork_child(&self) {
        self.state.raw_reinit();
        self.state.with(|s| s.rng.reseed());
    }

    /// `true` if `p` was allocated from this class's live state, for
    /// use only by debug/contract checks; never on the hot path.
    #[cfg(any(
        all(test, feature = "check_contracts_in_tests"),
        feature = "check_contracts"
    ))]
    pub(crate) fn owns_pointer(&self, p: NonNull<u8>) -> bool {
        let addr = p.as_ptr() as usize as u64;
        addr >= self.layout.class_start
            && addr < self.layout.class_start + self.layout.usable_size
    }

    /// A snapshot of this class's list/bitmap accounting, for the
    /// stress-test invariants in `crate::dispatch`'s test module.
    #[cfg(test)]
    pub(crate) fn debug_stats(&self) -> ClassDebugStats {
        self.state.with(|state| {
            let count_and_check = |mut head: Option<u32>| {
                let mut n = 0usize;
                let mut all_empty_bitmap = true;
                while let Some(idx) = head {
                    n += 1;
                    if state.metadata[idx as usize].bitmap != 0 {
                        all_empty_bitmap = false;
                    }
                    head = state.metadata[idx as usize].next;
                }
                (n, all_empty_bitmap)
            };

            let (empty_count, empty_ok) = count_and_check(state.empty_head);
            let (free_count, free_ok) = count_and_check(state.free_head);
            let (partial_count, _) = count_and_check(state.partial_head);

            ClassDebugStats {
                metadata_high_water: state.metadata.len(),
                empty_count,
                free_count,
                partial_count,
                idle_slabs_have_empty_bitmap: empty_ok && free_ok,
            }
        })
    }
}

/// See [`ClassRuntime::debug_stats`].
#[cfg(test)]
pub(crate) struct ClassDebugStats {
    pub metadata_high_water: usize,
    pub empty_count: usize,
    pub free_count: usize,
    pub partial_count: usize,
    pub idle_slabs_have_empty_bitmap: bool,
}

fn canary_reservation(config: &Config) -> usize {
    if config.canaries {
        CANARY_SIZE
    } else {
        0
    }
}

fn draw_canary(rng: &mut Rng) -> u64 {
    let v = rng.next_u64();
    #[cfg(target_endian = "little")]
    {
        v & 0xFFFF_FFFF_FFFF_FF00
    }
    #[cfg(target_endian = "big")]
    {
        v & 0x00FF_FFFF_FFFF_FFFF
    }
}

#[inline]
fn get_bit(bitmap: u64, slot: u32) -> bool {
    (bitmap >> slot) & 1 != 0
}

#[inline]
fn set_bit(bitmap: &mut u64, slot: u32) {
    *bitmap |= 1u64 << slot;
}

#[inline]
fn clear_bit(bitmap: &mut u64, slot: u32) {
    *bitmap &= !(1u64 << slot);
}

#[inline]
fn is_full(bitmap: u64, slots: u32) -> bool {
    let mask = full_mask(slots);
    bitmap & mask == mask
}

#[inline]
fn full_mask(slots: u32) -> u64 {
    if slots == 64 {
        u64::MAX
    } else {
        (1u64 << slots) - 1
    }
}

/// Picks a free slot out of `bitmap`, preferring a randomized start
/// position within `[0, slots)` and falling back to the lowest free
/// slot overall if that half of the bitmap is already full.
pub(crate) fn pick_free_slot(bitmap: u64, slots: u32, rng: &mut Rng) -> u32 {
    debug_assert!(slots > 0 && slots <= 64);
    debug_assert_ne!(bitmap & full_mask(slots), full_mask(slots), "slab has no free slot");

    let start = rng.uniform_u16(slots as u16) as u32;
    let below_mask = if start == 0 { 0 } else { (1u64 << start) - 1 };
    let masked = bitmap | below_mask;
    let candidate = masked.trailing_ones();

    if candidate < slots {
        candidate
    } else {
        bitmap.trailing_ones()
    }
}

fn link_partial(state: &mut ClassState, idx: u32) {
    state.metadata[idx as usize].prev = None;
    state.metadata[idx as usize].next = state.partial_head;
    if let Some(old_head) = state.partial_head {
        state.metadata[old_head as usize].prev = Some(idx);
    }
    state.partial_head = Some(idx);
}

fn unlink_partial(state: &mut ClassState, idx: u32) {
    let prev = state.metadata[idx as usize].prev;
    let next = state.metadata[idx as usize].next;

    match prev {
        Some(p) => state.metadata[p as usize].next = next,
        None => state.partial_head = next,
    }
    if let Some(n) = next {
        state.metadata[n as usize].prev = prev;
    }

    state.metadata[idx as usize].prev = None;
    state.metadata[idx as usize].next = None;
}

fn push_empty(state: &mut ClassState, idx: u32) {
    state.metadata[idx as usize].next = state.empty_head;
    state.empty_head = Some(idx);
}

fn push_free(state: &mut ClassState, idx: u32) {
    state.metadata[idx as usize].next = None;
    match state.free_tail {
        Some(tail) => state.metadata[tail as usize].next = Some(idx),
        None => state.free_head = Some(idx),
    }
    state.free_tail = Some(idx);
}

/// Derives the size class owning `p`, given the slab region's bounds.
/// Returns `None` if `p` does not fall in the slab region at all.
pub(crate) fn class_for_pointer(slab_region_start: u64, slab_region_end: u64, p: u64) -> Option<usize> {
    if p < slab_region_start || p >= slab_region_end {
        return None;
    }

    let idx = ((p - slab_region_start) / class::STRIPE_SIZE) as usize;
    if idx < N_CLASSES {
        Some(idx)
    } else {
        None
    }
}

static_assertions::const_assert!(N_CLASSES > 0);

#[cfg(test)]
mod test {
    use super::*;
    use proptest::collection::vec;
    use proptest::prelude::*;

    use crate::config::Config;
    use crate::provider::MmapProvider;

    fn test_runtime(provider: &MmapProvider, slots: u32, size: u32, slab_count: usize) -> ClassRuntime {
        let page_size = provider.page_size();
        let raw = slots as usize * size as usize;
        let slab_size = (raw.max(1) + page_size - 1) & !(page_size - 1);
        let base = provider
            .map(slab_size * slab_count)
            .expect("reserving test slab space should succeed");

        let layout = SlabLayout {
            class_start: base.as_ptr() as usize as u64,
            slab_size,
            slab_stride: slab_size as u64,
            usable_size: (slab_size * slab_count) as u64,
        };
        ClassRuntime::new(SizeClassInfo { size, slots }, layout)
    }

    #[test]
    fn bit_helpers_roundtrip() {
        let mut bitmap = 0u64;
        set_bit(&mut bitmap, 3);
        set_bit(&mut bitmap, 5);
        assert!(get_bit(bitmap, 3));
        assert!(get_bit(bitmap, 5));
        assert!(!get_bit(bitmap, 4));

        clear_bit(&mut bitmap, 3);
        assert!(!get_bit(bitmap, 3));
    }

    #[test]
    fn is_full_respects_slot_count() {
        assert!(!is_full(0, 4));
        assert!(is_full(0b1111, 4));
        assert!(!is_full(0b0111, 4));
        assert!(is_full(u64::MAX, 64));
    }

    #[test]
    fn pick_free_slot_avoids_occupied_bits() {
        let mut rng = Rng::new();
        // Only slot 2 is free among 4 slots.
        let bitmap = 0b1011;
        for _ in 0..200 {
            assert_eq!(pick_free_slot(bitmap, 4, &mut rng), 2);
        }
    }

    #[test]
    fn pick_free_slot_falls_back_when_upper_half_full() {
        let mut rng = Rng::new();
        // Only slot 0 is free among 8 slots; any random start > 0
        // finds nothing below 8 and must fall back to slot 0.
        let bitmap = 0b1111_1110;
        for _ in 0..200 {
            assert_eq!(pick_free_slot(bitmap, 8, &mut rng), 0);
        }
    }

    #[test]
    fn class_for_pointer_respects_bounds() {
        let start = 0x1000_0000_0000u64;
        let end = start + (N_CLASSES as u64) * class::STRIPE_SIZE;

        assert_eq!(class_for_pointer(start, end, start), Some(0));
        assert_eq!(
            class_for_pointer(start, end, start + class::STRIPE_SIZE),
            Some(1)
        );
        assert_eq!(class_for_pointer(start, end, start - 1), None);
        assert_eq!(class_for_pointer(start, end, end), None);
    }

    #[test]
    fn list_linking_is_consistent() {
        let mut state = ClassState::new();
        state.metadata.push(SlabMeta::fresh(0));
        state.metadata.push(SlabMeta::fresh(0));
        state.metadata.push(SlabMeta::fresh(0));

        link_partial(&mut state, 0);
        link_partial(&mut state, 1);
        link_partial(&mut state, 2);
        // LIFO: head should be 2, then 1, then 0.
        assert_eq!(state.partial_head, Some(2));

        unlink_partial(&mut state, 1);
        assert_eq!(state.metadata[2].next, Some(0));
        assert_eq!(state.metadata[0].prev, Some(2));
    }

    #[test]
    fn allocate_and_deallocate_exhausts_and_refills_one_slab() {
        let provider = MmapProvider::new();
        let config = Config::default();
        let runtime = test_runtime(&provider, 4, 64, 2);

        let mut live = Vec::new();
        for _ in 0..4 {
            live.push(runtime.allocate(64, &provider, &config).expect("should allocate"));
        }
        // Fifth allocation must come from a second slab, not reuse a slot.
        let fifth = runtime.allocate(64, &provider, &config).expect("should allocate");
        assert!(!live.contains(&fifth));

        for p in live {
            runtime.deallocate(p, None, &provider, &config);
        }
        runtime.deallocate(fifth, None, &provider, &config);
    }

    proptest! {
        // Exercises the bitmap allocator and the partial/empty/free
        // list transitions under randomized interleaving of allocate
        // and deallocate, the same shape as the teacher's own
        // `random_order` class test.
        #[test]
        fn random_alloc_free_order(ops in vec(any::<bool>(), 1..300)) {
            let provider = MmapProvider::new();
            let config = Config::default();
            let runtime = test_runtime(&provider, 8, 64, 6);

            let mut live: Vec<NonNull<u8>> = Vec::new();
            for allocate in ops {
                if allocate || live.is_empty() {
                    if let Ok(p) = runtime.allocate(64, &provider, &config) {
                        prop_assert!(!live.contains(&p), "bitmap allocator handed out a live slot twice");
                        live.push(p);
                    }
                } else {
                    let p = live.pop().expect("checked non-empty above");
                    runtime.deallocate(p, None, &provider, &config);
                }
            }

            for p in live {
                runtime.deallocate(p, None, &provider, &config);
            }
        }
    }
}
