//! The size-class table is a small, static map from a requested size
//! to the slab size class that services it. It never changes after
//! first use, so it is built once behind a `lazy_static` and read
//! without locking from every allocation.
use static_assertions::const_assert_eq;

/// Sentinel plus 8 linear classes (16..=128 by 16) plus 7 geometric
/// rows of 4 classes each (doubling every 4 steps, 160..=16384).
pub(crate) const N_CLASSES: usize = 37;

/// Largest size a slab class will service; larger requests are
/// routed to the large-allocation path.
pub(crate) const MAX_SLAB_OBJECT_SIZE: usize = 16384;

#[cfg(not(feature = "test_only_small_constants"))]
pub(crate) const STRIPE_SIZE: u64 = 256 * (1 << 30); // 256 GiB
#[cfg(not(feature = "test_only_small_constants"))]
pub(crate) const STRIPE_USABLE_SIZE: u64 = 128 * (1 << 30); // 128 GiB

// Shrunk so proptest and scenario tests can exercise stripe/gap/slab
// arithmetic without asking the test host for petabytes of address
// space. The arithmetic under test is identical; only the constants
// feeding it are smaller.
#[cfg(feature = "test_only_small_constants")]
pub(crate) const STRIPE_SIZE: u64 = 16 * (1 << 20); // 16 MiB
#[cfg(feature = "test_only_small_constants")]
pub(crate) const STRIPE_USABLE_SIZE: u64 = 8 * (1 << 20); // 8 MiB

/// Per-class static description: object size, slots per slab, and the
/// resulting slab size (page-rounded at init, once the page size is
/// known — see [`SizeClassInfo::slab_size`]).
#[derive(Debug, Clone, Copy)]
pub(crate) struct SizeClassInfo {
    /// Rounded object size in bytes. `0` for the sentinel class.
    pub size: u32,
    /// Objects per slab. `0` for the sentinel class.
    pub slots: u32,
}

/// Chooses `slots` for a class of the given object size so that a
/// slab never needs more than a 64-bit occupancy bitmap, per the
/// design's invariant that slab size stays modest.
fn slots_for_size(size: u32) -> u32 {
    match size {
        0 => 0,
        1..=128 => 64,
        129..=512 => 32,
        513..=2048 => 16,
        2049..=8192 => 8,
        _ => 4,
    }
}

fn build_classes() -> [SizeClassInfo; N_CLASSES] {
    let mut classes = [SizeClassInfo { size: 0, slots: 0 }; N_CLASSES];

    // Classes 1..=8: 16-byte increments up to 128.
    for i in 1..=8u32 {
        let size = i * 16;
        classes[i as usize] = SizeClassInfo {
            size,
            slots: slots_for_size(size),
        };
    }

    // Classes 9..=36: 7 geometric rows of 4 classes, doubling the
    // base every row (160..256, 320..512, ..., 10240..16384).
    let mut idx = 9usize;
    let mut base = 128u32;
    for _ in 0..7 {
        let step = base / 4;
        for step_idx in 1..=4u32 {
            let size = base + step * step_idx;
            classes[idx] = SizeClassInfo {
                size,
                slots: slots_for_size(size),
            };
            idx += 1;
        }
        base *= 2;
    }

    debug_assert_eq!(idx, N_CLASSES);
    debug_assert_eq!(classes[N_CLASSES - 1].size, MAX_SLAB_OBJECT_SIZE as u32);

    classes
}

lazy_static::lazy_static! {
    pub(crate) static ref CLASSES: [SizeClassInfo; N_CLASSES] = build_classes();
}

const_assert_eq!(N_CLASSES, 37);

impl SizeClassInfo {
    /// The page-rounded size of one slab for this class.
    pub fn slab_size(&self, page_size: usize) -> usize {
        let raw = self.slots as usize * self.size as usize;
        (raw + page_size - 1) & !(page_size - 1)
    }
}

/// Classifies a request of `n` bytes, returning the rounded size and
/// the class index that will service it.
///
/// Requests larger than [`MAX_SLAB_OBJECT_SIZE`] are not slab
/// requests; callers must route them to the large-allocation path
/// instead of calling this function.
pub(crate) fn classify(n: usize) -> (usize, usize) {
    if n == 0 {
        return (0, 0);
    }

    if n <= 128 {
        let rounded = (n + 15) & !15;
        let class = ((n - 1) >> 4) + 1;
        return (rounded, class);
    }

    for (idx, info) in CLASSES.iter().enumerate().skip(9) {
        if info.size as usize >= n {
            return (info.size as usize, idx);
        }
    }

    unreachable!("n <= MAX_SLAB_OBJECT_SIZE must find a class; caller violated precondition");
}

/// Like [`classify`], but additionally requires the resulting class
/// size to be a multiple of `align` (a power of two, at most the page
/// size). Returns `None` if no class in range satisfies both.
pub(crate) fn classify_aligned(n: usize, align: usize) -> Option<(usize, usize)> {
    debug_assert!(align.is_power_of_two());

    for (idx, info) in CLASSES.iter().enumerate().skip(1) {
        let size = info.size as usize;
        if size >= n && size % align == 0 {
            return Some((size, idx));
        }
    }

    None
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn table_has_expected_shape() {
        assert_eq!(CLASSES[0].size, 0);
        assert_eq!(CLASSES[0].slots, 0);
        assert_eq!(CLASSES[1].size, 16);
        assert_eq!(CLASSES[8].size, 128);
        assert_eq!(CLASSES[9].size, 160);
        assert_eq!(CLASSES[N_CLASSES - 1].size, 16384);

        // Sizes must be strictly increasing past the sentinel.
        for window in CLASSES[1..].windows(2) {
            assert!(window[1].size > window[0].size);
        }

        // No slab needs more than a 64-bit bitmap.
        for info in CLASSES.iter() {
            assert!(info.slots <= 64);
        }
    }

    #[test]
    fn classify_sentinel() {
        assert_eq!(classify(0), (0, 0));
    }

    #[test]
    fn classify_small_rounds_up_to_16() {
        assert_eq!(classify(1), (16, 1));
        assert_eq!(classify(16), (16, 1));
        assert_eq!(classify(17), (32, 2));
        assert_eq!(classify(24), (32, 2));
        assert_eq!(classify(128), (128, 8));
    }

    #[test]
    fn classify_large_scans_geometric_rows() {
        assert_eq!(classify(129), (160, 9));
        assert_eq!(classify(160), (160, 9));
        assert_eq!(classify(161), (192, 10));
        assert_eq!(classify(16384), (16384, N_CLASSES - 1));
    }

    #[test]
    fn classify_aligned_requires_divisibility() {
        // Class 9 is size 160, not divisible by 128; class 12 (512)
        // is the first class >= 129 divisible by 128... but the first
        // class whose size is both >= 129 and a multiple of 128 could
        // also be found earlier if one exists.
        let (size, _) = classify_aligned(129, 128).expect("should find a class");
        assert_eq!(size % 128, 0);
        assert!(size >= 129);
    }

    #[test]
    fn classify_aligned_rejects_out_of_range() {
        assert!(classify_aligned(usize::MAX, 16).is_none());
    }

    #[test]
    fn slab_size_is_page_rounded() {
        let page_size = 4096;
        for info in CLASSES.iter().skip(1) {
            let size = info.slab_size(page_size);
            assert_eq!(size % page_size, 0);
            assert!(size >= info.slots as usize * info.size as usize);
        }
    }
}
