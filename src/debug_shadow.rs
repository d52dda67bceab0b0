//! An out-of-line shadow map of every live allocation's origin,
//! compiled in only when contracts are checked. It exists purely to
//! catch *type confusion* early and with a precise diagnostic: e.g. a
//! pointer obtained from size class 7 being freed through a code path
//! that believes it came from the large-allocation region. The slab
//! engine and region table already refuse such frees as a matter of
//! course (a class's own bitmap won't contain a bit for a foreign
//! pointer); this module exists to make the contract explicit and
//! independently checkable in tests, grounded on the same idea as the
//! teacher's own debug allocation map.
#![cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Origin {
    Small(usize),
    Large,
}

lazy_static::lazy_static! {
    static ref SHADOW: Mutex<HashMap<usize, Origin>> = Mutex::new(HashMap::new());
}

/// Records that `addr` was just handed out with the given origin.
pub(crate) fn record_alloc(addr: usize, origin: Origin) {
    let mut map = SHADOW.lock().expect("shadow map mutex poisoned");
    map.insert(addr, origin);
}

/// Checks that `addr` is being freed with the origin it was allocated
/// with, then forgets it. Panics (not `fatal`: this is a test/debug
/// instrument, not the production safety check) on mismatch or on an
/// address the shadow map never saw.
pub(crate) fn check_and_forget(addr: usize, origin: Origin) {
    let mut map = SHADOW.lock().expect("shadow map mutex poisoned");
    match map.remove(&addr) {
        Some(recorded) => assert_eq!(
            recorded, origin,
            "type confusion: {:#x} allocated as {:?} but freed as {:?}",
            addr, recorded, origin
        ),
        None => panic!("shadow map has no record of {:#x}", addr),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn matching_origin_round_trips() {
        record_alloc(0x1000, Origin::Small(3));
        check_and_forget(0x1000, Origin::Small(3));
    }

    #[test]
    #[should_panic(expected = "type confusion")]
    fn mismatched_origin_panics() {
        record_alloc(0x2000, Origin::Small(3));
        check_and_forget(0x2000, Origin::Large);
    }
}
