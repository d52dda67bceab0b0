//! The allocator's global state: the slab region, the per-class
//! runtimes, the large-allocation region table, and the dedicated,
//! read-only-after-init page that anchors them ([`ProtectedRoot`]).
//!
//! Initialization is lazy and one-shot, driven by `lazy_static`'s
//! built-in `Once` rather than a hand-rolled mutex-and-flag: every
//! side effect of bringing the allocator up (reserving the slab
//! region, building the region table, registering the `fork()`
//! handlers) happens inside [`Root::new`], which `lazy_static`
//! guarantees runs exactly once no matter how many threads race to
//! touch [`ROOT`] first.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::class::{CLASSES, N_CLASSES};
use crate::config::Config;
use crate::error::fatal;
use crate::lock::Guarded;
use crate::prng::Rng;
use crate::provider::{default_provider, PageProvider};
use crate::region::RegionTable;
use crate::slab::ClassRuntime;
use crate::slab_region::{self, SlabRegion};

/// Fields that describe the allocator's layout and never change after
/// [`Root::new`] finishes building them. Lives in its own dedicated
/// mmap'd page, which is made read-only immediately after
/// `initialized` is set — an attacker who corrupts a wild pointer
/// into writing here finds the page unwritable instead of able to
/// repoint the slab region or region table.
#[repr(C)]
struct ProtectedRoot {
    slab_region_start: u64,
    slab_region_end: u64,
    region_table_buffers: [u64; 2],
    initialized: AtomicBool,
}

/// The allocator singleton. Everything except [`ProtectedRoot`]'s
/// fields lives in ordinary, writable process memory, behind
/// per-class and per-table locks.
pub(crate) struct Root {
    provider: &'static dyn PageProvider,
    config: Config,
    protected: NonNull<ProtectedRoot>,
    classes: Box<[ClassRuntime]>,
    regions: Guarded<RegionTable>,
}

// SAFETY: every field is either `Sync` itself or, in `protected`'s
// case, write-once before being made read-only and read-only for the
// rest of the process's life.
unsafe impl Sync for Root {}

impl Root {
    fn new() -> Root {
        let provider = default_provider();
        let config = Config::load();

        let mut init_rng = Rng::new();
        let region: SlabRegion = slab_region::reserve(provider, config.guard_slabs, &mut init_rng)
            .unwrap_or_else(|e| fatal(&format!("failed to reserve slab region: {}", e)));

        let classes: Box<[ClassRuntime]> = CLASSES
            .iter()
            .zip(region.layouts.iter())
            .map(|(info, layout)| ClassRuntime::new(*info, *layout))
            .collect();
        debug_assert_eq!(classes.len(), N_CLASSES);

        let region_table = RegionTable::new(provider)
            .unwrap_or_else(|e| fatal(&format!("failed to reserve region table: {}", e)));
        let buffer_addresses = region_table.buffer_addresses();
        let regions = Guarded::new(region_table);

        let protected = init_protected_root(
            provider,
            region.start,
            region.end,
            buffer_addresses,
        );

        register_fork_handlers();

        log::info!(
            "rampart: initialized: slab region {:#x}..{:#x}, {} classes",
            region.start,
            region.end,
            N_CLASSES
        );

        Root {
            provider,
            config,
            protected,
            classes,
            regions,
        }
    }

    pub fn provider(&self) -> &'static dyn PageProvider {
        self.provider
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn class(&self, idx: usize) -> &ClassRuntime {
        &self.classes[idx]
    }

    pub fn classes(&self) -> &[ClassRuntime] {
        &self.classes
    }

    pub fn regions(&self) -> &Guarded<RegionTable> {
        &self.regions
    }

    pub fn slab_bounds(&self) -> (u64, u64) {
        // SAFETY: written once before the page was made read-only and
        // never mutated since.
        let protected = unsafe { self.protected.as_ref() };
        (protected.slab_region_start, protected.slab_region_end)
    }
}

fn init_protected_root(
    provider: &dyn PageProvider,
    slab_region_start: u64,
    slab_region_end: u64,
    region_table_buffers: [u64; 2],
) -> NonNull<ProtectedRoot> {
    let page_size = provider.page_size();
    let size = std::mem::size_of::<ProtectedRoot>();
    debug_assert!(size <= page_size, "ProtectedRoot must fit in one page");

    let raw = provider
        .map(page_size)
        .unwrap_or_else(|e| fatal(&format!("failed to reserve protected root page: {}", e)));
    provider
        .protect_rw(raw, page_size)
        .unwrap_or_else(|e| fatal(&format!("failed to commit protected root page: {}", e)));

    let ptr = raw.as_ptr() as *mut ProtectedRoot;
    unsafe {
        ptr.write(ProtectedRoot {
            slab_region_start,
            slab_region_end,
            region_table_buffers,
            initialized: AtomicBool::new(false),
        });
        (*ptr).initialized.store(true, Ordering::Release);
    }

    provider
        .protect_ro(raw, page_size)
        .unwrap_or_else(|e| fatal(&format!("failed to protect root page read-only: {}", e)));

    NonNull::new(ptr).expect("protected root page is non-null")
}

fn register_fork_handlers() {
    unsafe {
        libc::pthread_atfork(
            Some(atfork_prepare),
            Some(atfork_parent),
            Some(atfork_child),
        );
    }
}

/// Lock order is fixed and identical across prepare/parent/child: the
/// region table first, then size classes in ascending index order.
/// Taking every lock before `fork()` guarantees the child starts with
/// a consistent snapshot of the allocator's state; taking them in one
/// global order rules out deadlock against a concurrent allocation on
/// another thread doing the same traversal.
extern "C" fn atfork_prepare() {
    ROOT.regions.raw_lock();
    for class in ROOT.classes.iter() {
        class.raw_lock();
    }
}

extern "C" fn atfork_parent() {
    ROOT.regions.raw_unlock();
    for class in ROOT.classes.iter() {
        class.raw_unlock();
    }
}

extern "C" fn atfork_child() {
    ROOT.regions.raw_reinit();
    for class in ROOT.classes.iter() {
        class.post_fork_child();
    }
    log::debug!("rampart: re-initialized allocator locks and PRNGs after fork");
}

lazy_static::lazy_static! {
    pub(crate) static ref ROOT: Root = Root::new();
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn root_initializes_and_reports_bounds() {
        let (start, end) = ROOT.slab_bounds();
        assert!(start > 0);
        assert!(end > start);
        assert_eq!(ROOT.classes().len(), N_CLASSES);
    }
}
