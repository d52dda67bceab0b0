//! Reserves the single, huge span of address space every size class's
//! slabs are carved out of, and computes each class's slice of it.
//!
//! The whole region is reserved with `PROT_NONE` in one `mmap` call;
//! no physical memory is committed until a class actually grows a
//! slab (see `crate::slab::ClassRuntime::allocate`). Each class owns
//! one fixed-size stripe, large enough that it will never be
//! exhausted in practice, so no class can ever grow into another's
//! stripe.
use crate::class::{SizeClassInfo, CLASSES, N_CLASSES, STRIPE_SIZE, STRIPE_USABLE_SIZE};
use crate::error::Result;
use crate::prng::Rng;
use crate::provider::PageProvider;

/// One class's fixed geometry within the slab region.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlabLayout {
    /// Address of logical slab 0 for this class.
    pub class_start: u64,
    /// Page-rounded bytes occupied by one slab's real data.
    pub slab_size: usize,
    /// Bytes between consecutive logical slabs: `slab_size`, or
    /// `slab_size * 2` when guard slabs are enabled (every other
    /// physical slot stays `PROT_NONE` as an inter-slab guard).
    pub slab_stride: u64,
    /// Total bytes available for this class's logical slabs, i.e. the
    /// span `max_slabs() * slab_stride` can grow into.
    pub usable_size: u64,
}

pub(crate) struct SlabRegion {
    pub start: u64,
    pub end: u64,
    pub layouts: [SlabLayout; N_CLASSES],
}

/// Largest fraction of a stripe that init's random gap is allowed to
/// eat into, leaving the rest for the class's own slabs.
const MAX_GAP_FRACTION: u64 = 16;

/// Reserves the full slab region and lays out every class's stripe
/// within it. `rng` seeds the one-time randomized gap placed before
/// each class's first slab; it is never touched again afterward,
/// unlike the per-class `Rng` used for bitmap search jitter.
pub(crate) fn reserve(
    provider: &dyn PageProvider,
    guard_slabs: bool,
    rng: &mut Rng,
) -> Result<SlabRegion> {
    let page_size = provider.page_size();
    let total = STRIPE_SIZE * N_CLASSES as u64;
    let base = provider.map(total as usize)?;
    let start = base.as_ptr() as usize as u64;
    let end = start + total;

    let mut layouts = [SlabLayout {
        class_start: 0,
        slab_size: 0,
        slab_stride: 0,
        usable_size: 0,
    }; N_CLASSES];

    for (idx, info) in CLASSES.iter().enumerate() {
        let stripe_base = start + (idx as u64) * STRIPE_SIZE;
        let slab_size = info.slab_size(page_size).max(page_size);
        let slab_stride = if guard_slabs {
            slab_size as u64 * 2
        } else {
            slab_size as u64
        };

        let gap = random_gap(STRIPE_SIZE, slab_stride, rng, page_size as u64);

        // Only the first half of each stripe is ever handed to a
        // class's slabs; the second half stays permanently `PROT_NONE`
        // as a buffer between this class and the next one's stripe, on
        // top of the inter-slab guard slots `slab_stride` already
        // bakes in.
        layouts[idx] = SlabLayout {
            class_start: stripe_base + gap,
            slab_size,
            slab_stride,
            usable_size: (STRIPE_SIZE - gap).min(STRIPE_USABLE_SIZE),
        };
    }

    Ok(SlabRegion { start, end, layouts })
}

/// Picks a page-aligned, slab-stride-aligned gap to place before a
/// class's first slab, bounded so at least `1/MAX_GAP_FRACTION` of the
/// stripe remains usable no matter how unlucky the draw.
fn random_gap(stripe_size: u64, slab_stride: u64, rng: &mut Rng, page_size: u64) -> u64 {
    if slab_stride == 0 {
        return 0;
    }

    let max_gap = stripe_size / MAX_GAP_FRACTION;
    let max_steps = max_gap / slab_stride;
    if max_steps == 0 {
        return 0;
    }

    let steps = rng.uniform_u64(max_steps);
    let gap = steps * slab_stride;
    debug_assert_eq!(gap % page_size, 0, "slab_stride is always page-aligned");
    gap
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn random_gap_stays_within_bound_and_aligned() {
        let mut rng = Rng::new();
        for _ in 0..500 {
            let gap = random_gap(STRIPE_SIZE, 4096 * 2, &mut rng, 4096);
            assert_eq!(gap % (4096 * 2), 0);
            assert!(gap < STRIPE_SIZE / MAX_GAP_FRACTION);
        }
    }

    #[test]
    fn random_gap_handles_huge_stride() {
        let mut rng = Rng::new();
        // A stride bigger than the whole allowed gap budget must not
        // panic; it just means no randomization is possible.
        assert_eq!(random_gap(STRIPE_SIZE, STRIPE_SIZE, &mut rng, 4096), 0);
    }
}
