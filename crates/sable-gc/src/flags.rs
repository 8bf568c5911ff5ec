//! Object flag sets
//!
//! Two independent flag words exist per object:
//!
//! - [`InternalFlags`] live in the object table slot, are atomic, and are the
//!   only state the parallel mark phase mutates.
//! - [`ObjectFlags`] live on the instance; embedders stamp keep bits here and
//!   the purger records destruction progress.

use bitflags::bitflags;

bitflags! {
    /// Per-slot collector state, stored atomically in the object table.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InternalFlags: u32 {
        /// Kept alive by native code regardless of references
        const NATIVE = 1 << 0;
        /// Owned by an async loader; kept alive until it clears the bit
        const ASYNC = 1 << 1;
        /// Member of a cluster that was reached during the current pass
        const REACHABLE_IN_CLUSTER = 1 << 2;
        /// Root of a cluster
        const CLUSTER_ROOT = 1 << 3;
        /// Pinned in the root set
        const ROOT_SET = 1 << 4;
        /// Not (yet) found reachable during the current pass
        const UNREACHABLE = 1 << 5;
        /// Condemned; references to it are nulled instead of followed
        const PENDING_KILL = 1 << 6;

        /// Internal bits that keep an object alive on their own
        const GARBAGE_COLLECTION_KEEP = Self::NATIVE.bits() | Self::ASYNC.bits();
    }
}

bitflags! {
    /// Instance-level flags visible to the embedder.
    ///
    /// The low bits are free for embedder keep policies passed to
    /// `run_collection`; the high bits track destruction progress.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ObjectFlags: u32 {
        /// Object is publicly visible
        const PUBLIC = 1 << 0;
        /// Object stays alive even when nothing references it
        const STANDALONE = 1 << 1;
        /// Transient object
        const TRANSIENT = 1 << 2;
        /// Class default object
        const CLASS_DEFAULT_OBJECT = 1 << 3;
        /// Embedder-defined keep bits
        const USER_0 = 1 << 8;
        /// Embedder-defined keep bits
        const USER_1 = 1 << 9;
        /// Embedder-defined keep bits
        const USER_2 = 1 << 10;
        /// Embedder-defined keep bits
        const USER_3 = 1 << 11;
        /// `begin_destroy` has been routed
        const BEGIN_DESTROYED = 1 << 28;
        /// `finish_destroy` has been routed
        const FINISH_DESTROYED = 1 << 29;
    }
}

impl ObjectFlags {
    /// No keep flags: only references keep objects alive
    pub const NO_FLAGS: Self = Self::empty();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keep_mask_covers_native_and_async() {
        assert!(InternalFlags::GARBAGE_COLLECTION_KEEP.contains(InternalFlags::NATIVE));
        assert!(InternalFlags::GARBAGE_COLLECTION_KEEP.contains(InternalFlags::ASYNC));
        assert!(!InternalFlags::GARBAGE_COLLECTION_KEEP.contains(InternalFlags::ROOT_SET));
    }

    #[test]
    fn test_destroy_bits_are_disjoint_from_user_bits() {
        let destroy = ObjectFlags::BEGIN_DESTROYED | ObjectFlags::FINISH_DESTROYED;
        let user =
            ObjectFlags::USER_0 | ObjectFlags::USER_1 | ObjectFlags::USER_2 | ObjectFlags::USER_3;
        assert!(!destroy.intersects(user));
    }
}
