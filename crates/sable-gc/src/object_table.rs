//! Object table
//!
//! Dense array of object slots addressed by [`ObjectIndex`]. Each slot carries
//! an atomic [`InternalFlags`] word, the object's cluster membership and the
//! instance itself. During traversal the table is shared immutably between
//! worker threads; liveness is expressed solely through the flag atomics.
//!
//! The first `permanent_count` slots form the permanent ("disregard for GC")
//! pool: they are never marked, never purged, and references into them are
//! rejected by a single index compare.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::cluster::ClusterIndex;
use crate::flags::InternalFlags;
use crate::object::{ObjectIndex, ObjectInstance};

/// Cluster relationship of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClusterMembership {
    /// Ordinary object (owner index 0)
    #[default]
    None,
    /// Root of the given cluster
    Root(ClusterIndex),
    /// Member owned by the given cluster root (owner index > 0)
    Member(ObjectIndex),
}

/// One object slot.
#[derive(Debug, Default)]
pub struct ObjectItem {
    flags: AtomicU32,
    membership: ClusterMembership,
    instance: Option<ObjectInstance>,
}

impl ObjectItem {
    /// Current internal flags
    #[inline]
    pub fn flags(&self) -> InternalFlags {
        InternalFlags::from_bits_retain(self.flags.load(Ordering::Acquire))
    }

    /// Whether any of `flags` is set
    #[inline]
    pub fn has_any_flags(&self, flags: InternalFlags) -> bool {
        self.flags().intersects(flags)
    }

    /// Whether all of `flags` are set
    #[inline]
    pub fn has_all_flags(&self, flags: InternalFlags) -> bool {
        self.flags().contains(flags)
    }

    /// Set flags (single atomic or)
    #[inline]
    pub fn set_flags(&self, flags: InternalFlags) {
        self.flags.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    /// Clear flags (single atomic and)
    #[inline]
    pub fn clear_flags(&self, flags: InternalFlags) {
        self.flags.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Clear `flag` and report whether this call is the one that cleared it.
    #[inline]
    pub fn this_thread_atomically_cleared_flag(&self, flag: InternalFlags) -> bool {
        let previous = self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
        previous & flag.bits() != 0
    }

    /// Set `flag` and report whether this call is the one that set it.
    #[inline]
    pub fn this_thread_atomically_set_flag(&self, flag: InternalFlags) -> bool {
        let previous = self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
        previous & flag.bits() == 0
    }

    /// Not (yet) reachable in the current pass
    #[inline]
    pub fn is_unreachable(&self) -> bool {
        self.has_any_flags(InternalFlags::UNREACHABLE)
    }

    /// Condemned
    #[inline]
    pub fn is_pending_kill(&self) -> bool {
        self.has_any_flags(InternalFlags::PENDING_KILL)
    }

    /// Pinned in the root set
    #[inline]
    pub fn is_root_set(&self) -> bool {
        self.has_any_flags(InternalFlags::ROOT_SET)
    }

    /// Cluster membership
    #[inline]
    pub fn membership(&self) -> ClusterMembership {
        self.membership
    }

    /// Owning cluster root when this slot is a cluster member
    #[inline]
    pub fn owner_index(&self) -> Option<ObjectIndex> {
        match self.membership {
            ClusterMembership::Member(root) => Some(root),
            _ => None,
        }
    }

    /// Cluster this slot is the root of
    #[inline]
    pub fn cluster_index(&self) -> Option<ClusterIndex> {
        match self.membership {
            ClusterMembership::Root(cluster) => Some(cluster),
            _ => None,
        }
    }

    pub(crate) fn set_membership(&mut self, membership: ClusterMembership) {
        self.membership = membership;
    }

    /// Whether the slot holds an object
    #[inline]
    pub fn is_live(&self) -> bool {
        self.instance.is_some()
    }

    /// The object, if the slot is live
    #[inline]
    pub fn instance(&self) -> Option<&ObjectInstance> {
        self.instance.as_ref()
    }

    pub(crate) fn instance_mut(&mut self) -> Option<&mut ObjectInstance> {
        self.instance.as_mut()
    }
}

/// Table of all object slots.
#[derive(Debug, Default)]
pub struct ObjectTable {
    items: Vec<ObjectItem>,
    free_list: Vec<ObjectIndex>,
    permanent_count: u32,
    disregard_open: bool,
    live_count: usize,
}

impl ObjectTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Total slots, live or free
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the table has no slots
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of live objects
    pub fn live_count(&self) -> usize {
        self.live_count
    }

    /// Live objects outside the permanent pool
    pub fn live_count_minus_permanent(&self) -> usize {
        self.live_count - self.permanent_count as usize
    }

    /// Size of the permanent pool
    pub fn permanent_count(&self) -> usize {
        self.permanent_count as usize
    }

    /// Start placing allocations into the permanent pool.
    ///
    /// Only possible while the table is empty, so the pool stays a prefix.
    pub fn open_disregard_for_gc(&mut self) -> bool {
        if !self.items.is_empty() {
            return false;
        }
        self.disregard_open = true;
        true
    }

    /// Seal the permanent pool at the current table size.
    pub fn close_disregard_for_gc(&mut self) {
        if self.disregard_open {
            self.disregard_open = false;
            self.permanent_count = self.items.len() as u32;
            tracing::debug!(
                target: "sable::gc",
                permanent = self.permanent_count,
                "Closed disregard-for-GC pool"
            );
        }
    }

    /// Fold the permanent pool back into the collectable set (exit purge)
    pub fn disable_disregard_for_gc(&mut self) {
        self.disregard_open = false;
        self.permanent_count = 0;
    }

    /// Whether the permanent pool is still accepting allocations
    pub fn is_disregard_open(&self) -> bool {
        self.disregard_open
    }

    /// Pure index compare; never touches the slot
    #[inline]
    pub fn resides_in_permanent_pool(&self, index: ObjectIndex) -> bool {
        index.0 < self.permanent_count
    }

    /// Place an instance in a free slot
    pub(crate) fn allocate(&mut self, instance: ObjectInstance) -> ObjectIndex {
        let reuse = if self.disregard_open {
            None
        } else {
            self.free_list.pop()
        };
        let index = match reuse {
            Some(index) => index,
            None => {
                let index = ObjectIndex(self.items.len() as u32);
                self.items.push(ObjectItem::default());
                index
            }
        };
        let item = &mut self.items[index.as_usize()];
        debug_assert!(!item.is_live());
        item.flags.store(0, Ordering::Release);
        item.membership = ClusterMembership::None;
        item.instance = Some(instance);
        self.live_count += 1;
        index
    }

    /// Drop the instance and recycle the slot
    pub(crate) fn free(&mut self, index: ObjectIndex) -> Option<ObjectInstance> {
        let item = self.items.get_mut(index.as_usize())?;
        let instance = item.instance.take()?;
        item.flags.store(0, Ordering::Release);
        item.membership = ClusterMembership::None;
        self.free_list.push(index);
        self.live_count -= 1;
        Some(instance)
    }

    /// Whether `index` is in range and live (the low-level validity check)
    #[inline]
    pub fn is_valid(&self, index: ObjectIndex) -> bool {
        self.items
            .get(index.as_usize())
            .is_some_and(ObjectItem::is_live)
    }

    /// Slot at `index`, live or not
    #[inline]
    pub fn item(&self, index: ObjectIndex) -> Option<&ObjectItem> {
        self.items.get(index.as_usize())
    }

    /// Slot at `index` for a caller that already validated it.
    ///
    /// # Panics
    /// Panics when `index` is out of range.
    #[inline]
    pub fn item_for_gc(&self, index: ObjectIndex) -> &ObjectItem {
        &self.items[index.as_usize()]
    }

    pub(crate) fn item_mut(&mut self, index: ObjectIndex) -> Option<&mut ObjectItem> {
        self.items.get_mut(index.as_usize())
    }

    /// Live object at `index`
    pub fn instance(&self, index: ObjectIndex) -> Option<&ObjectInstance> {
        self.item(index).and_then(ObjectItem::instance)
    }

    pub(crate) fn instance_mut(&mut self, index: ObjectIndex) -> Option<&mut ObjectInstance> {
        self.item_mut(index).and_then(ObjectItem::instance_mut)
    }

    /// Live slots in index order. `skip_permanent` starts past the pool.
    pub fn iter(&self, skip_permanent: bool) -> impl Iterator<Item = (ObjectIndex, &ObjectItem)> {
        let start = if skip_permanent {
            self.permanent_count as usize
        } else {
            0
        };
        self.items[start..]
            .iter()
            .enumerate()
            .filter(|(_, item)| item.is_live())
            .map(move |(offset, item)| (ObjectIndex((start + offset) as u32), item))
    }

    /// Dotted path of `index` through its outer chain
    pub fn path_name(&self, index: ObjectIndex) -> String {
        let mut parts = Vec::new();
        let mut current = Some(index);
        while let Some(at) = current {
            match self.instance(at) {
                Some(instance) if parts.len() < 64 => {
                    parts.push(instance.name());
                    current = instance.outer();
                }
                _ => break,
            }
        }
        if parts.is_empty() {
            return format!("<invalid {index}>");
        }
        parts.reverse();
        parts.join(".")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::ObjectSpec;
    use crate::types::TypeId;

    fn instance(name: &str) -> ObjectInstance {
        ObjectInstance::from_spec(ObjectSpec::new(TypeId(0), name))
    }

    #[test]
    fn test_allocate_and_free_recycles_slots() {
        let mut table = ObjectTable::new();
        let a = table.allocate(instance("a"));
        let b = table.allocate(instance("b"));
        assert_eq!(a, ObjectIndex(0));
        assert_eq!(b, ObjectIndex(1));
        assert_eq!(table.live_count(), 2);

        assert!(table.free(a).is_some());
        assert!(!table.is_valid(a));
        assert_eq!(table.live_count(), 1);

        let c = table.allocate(instance("c"));
        assert_eq!(c, a);
        assert_eq!(table.instance(c).map(|i| i.name()), Some("c"));
    }

    #[test]
    fn test_permanent_pool_is_a_prefix() {
        let mut table = ObjectTable::new();
        assert!(table.open_disregard_for_gc());
        let p0 = table.allocate(instance("p0"));
        let p1 = table.allocate(instance("p1"));
        table.close_disregard_for_gc();
        let x = table.allocate(instance("x"));

        assert!(table.resides_in_permanent_pool(p0));
        assert!(table.resides_in_permanent_pool(p1));
        assert!(!table.resides_in_permanent_pool(x));
        assert_eq!(table.iter(true).count(), 1);
        assert_eq!(table.iter(false).count(), 3);
        assert!(!table.open_disregard_for_gc());
    }

    #[test]
    fn test_atomic_flag_races_have_one_winner() {
        let item = ObjectItem::default();
        item.set_flags(InternalFlags::UNREACHABLE);
        assert!(item.this_thread_atomically_cleared_flag(InternalFlags::UNREACHABLE));
        assert!(!item.this_thread_atomically_cleared_flag(InternalFlags::UNREACHABLE));

        assert!(item.this_thread_atomically_set_flag(InternalFlags::REACHABLE_IN_CLUSTER));
        assert!(!item.this_thread_atomically_set_flag(InternalFlags::REACHABLE_IN_CLUSTER));
    }

    #[test]
    fn test_path_name_follows_outers() {
        let mut table = ObjectTable::new();
        let package = table.allocate(instance("Package"));
        let child = table.allocate(ObjectInstance::from_spec(
            ObjectSpec::new(TypeId(0), "Mesh").outer(package),
        ));
        assert_eq!(table.path_name(child), "Package.Mesh");
        assert_eq!(table.path_name(ObjectIndex(99)), "<invalid #99>");
    }
}
