//! A thin wrapper around a raw `pthread_mutex_t`.
//!
//! The design relies on holding every per-class lock and the regions
//! lock across a `fork()` in a very particular way: acquired in
//! `pthread_atfork`'s "prepare" callback, released in the "parent"
//! callback, and *destroyed and rebuilt* (not merely unlocked) in the
//! "child" callback, since the child's other threads vanished without
//! a chance to clean up any queued waiter state. `std::sync::Mutex`
//! has no API for holding a guard across that callback boundary or
//! for rebuilding its OS primitive in place, so the allocator's locks
//! are built on the raw pthread primitive instead.
use std::cell::UnsafeCell;

pub(crate) struct RawMutex {
    inner: UnsafeCell<libc::pthread_mutex_t>,
}

// SAFETY: `pthread_mutex_t` is designed to be shared across threads;
// all access goes through the `pthread_mutex_*` API, which handles
// its own synchronization.
unsafe impl Sync for RawMutex {}
unsafe impl Send for RawMutex {}

impl RawMutex {
    pub fn new() -> Self {
        RawMutex {
            inner: UnsafeCell::new(unsafe { std::mem::zeroed() }),
        }
    }

    fn init(&self) {
        unsafe {
            libc::pthread_mutex_init(self.inner.get(), std::ptr::null());
        }
    }

    pub fn lock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_lock(self.inner.get());
            assert_eq!(ret, 0, "pthread_mutex_lock failed: {}", ret);
        }
    }

    pub fn unlock(&self) {
        unsafe {
            let ret = libc::pthread_mutex_unlock(self.inner.get());
            assert_eq!(ret, 0, "pthread_mutex_unlock failed: {}", ret);
        }
    }

    /// Destroys and rebuilds the underlying primitive. Only safe to
    /// call when no thread is, or could be, blocked on this mutex —
    /// i.e. immediately after `fork()`, in the child.
    pub fn reinit(&self) {
        unsafe {
            libc::pthread_mutex_destroy(self.inner.get());
        }
        self.init();
    }
}

/// A `Mutex`-alike built on [`RawMutex`] that additionally exposes
/// `raw_lock`/`raw_unlock`/`raw_reinit` for the fork coordinator, on
/// top of the usual closure-based safe access.
pub(crate) struct Guarded<T> {
    mutex: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Sync for Guarded<T> {}

impl<T> Guarded<T> {
    pub fn new(value: T) -> Self {
        let mutex = RawMutex::new();
        mutex.init();
        Guarded {
            mutex,
            data: UnsafeCell::new(value),
        }
    }

    /// Runs `f` with exclusive access to the guarded value.
    #[inline]
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.mutex.lock();
        let ret = f(unsafe { &mut *self.data.get() });
        self.mutex.unlock();
        ret
    }

    /// Locks without an accompanying unlock; pairs with
    /// [`Guarded::raw_unlock`]. Only used by the fork coordinator,
    /// which must hold every lock across a `pthread_atfork` "prepare"
    /// callback and into the matching "parent"/"child" callback.
    pub fn raw_lock(&self) {
        self.mutex.lock();
    }

    pub fn raw_unlock(&self) {
        self.mutex.unlock();
    }

    /// Rebuilds the lock in place; see [`RawMutex::reinit`]. The
    /// guarded value is left as-is — callers that need to reset state
    /// too (e.g. re-seed a PRNG) do so via a separate call under the
    /// freshly rebuilt lock.
    pub fn raw_reinit(&self) {
        self.mutex.reinit();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn with_provides_exclusive_access() {
        let guarded = Guarded::new(0u32);
        guarded.with(|v| *v += 1);
        guarded.with(|v| *v += 1);
        assert_eq!(guarded.with(|v| *v), 2);
    }

    #[test]
    fn raw_lock_unlock_roundtrips() {
        let guarded = Guarded::new(0u32);
        guarded.raw_lock();
        guarded.raw_unlock();
        guarded.with(|v| *v += 1);
        assert_eq!(guarded.with(|v| *v), 1);
    }
}
