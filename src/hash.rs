//! Zero-sized hash builder for the crate's internal maps.
//!
//! Observer sets and the delivery loop's source registry are keyed by
//! allocation addresses, so HashDoS resistance buys nothing there. `FastHashBuilder`
//! hashes with foldhash under a fixed seed and takes no space in the map.

use std::hash::BuildHasher;

use foldhash::fast::{FixedState, FoldHasher};

/// A zero-sized `BuildHasher` backed by foldhash with a fixed seed.
#[derive(Clone, Copy, Debug, Default)]
pub(crate) struct FastHashBuilder;

impl BuildHasher for FastHashBuilder {
    type Hasher = FoldHasher<'static>;

    #[inline]
    fn build_hasher(&self) -> Self::Hasher {
        FixedState::with_seed(0x517cc1b727220a95).build_hasher()
    }
}

/// Address of the allocation behind `ptr`, used as an identity key.
///
/// Two `Arc`s pointing at the same allocation produce the same key, regardless
/// of which trait object they were coerced to.
#[inline]
pub(crate) fn address_of<T: ?Sized>(ptr: *const T) -> usize {
    ptr.cast::<()>() as usize
}
