//! Object clusters
//!
//! A cluster is a group of objects that live and die together. Reachability
//! of the whole group is decided through its root: once the root is reached,
//! the collector only visits the cluster's precomputed outgoing edges
//! (`referenced_clusters` and `mutable_objects`) instead of every member.
//!
//! During traversal the table's structure is read-only. Workers may null
//! entries of the outgoing edge lists and raise `needs_dissolving`; the
//! physical dissolution happens later in a sequential phase.

use std::sync::atomic::{AtomicBool, Ordering};

use rustc_hash::FxHashSet;

use crate::error::{GcError, GcResult};
use crate::flags::InternalFlags;
use crate::object::{ObjectIndex, RefSlot};
use crate::object_table::{ClusterMembership, ObjectTable};
use crate::token_stream::{TargetGatherer, walk_references};
use crate::types::TypeRegistry;

/// Index into the cluster table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClusterIndex(pub u32);

impl ClusterIndex {
    /// Index as `usize`
    #[inline]
    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// One cluster.
#[derive(Debug)]
pub struct Cluster {
    root: ObjectIndex,
    objects: Vec<ObjectIndex>,
    mutable_objects: Vec<RefSlot>,
    referenced_clusters: Vec<RefSlot>,
    needs_dissolving: AtomicBool,
}

/// Result of dissolving a cluster: the objects that become independent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DissolvedCluster {
    /// Former root
    pub root: ObjectIndex,
    /// Former members
    pub members: Vec<ObjectIndex>,
}

impl Cluster {
    /// Root object
    pub fn root(&self) -> ObjectIndex {
        self.root
    }

    /// Members, root excluded
    pub fn objects(&self) -> &[ObjectIndex] {
        &self.objects
    }

    /// Non-clustered objects (and members of other clusters) referenced from
    /// this cluster
    pub fn mutable_objects(&self) -> &[RefSlot] {
        &self.mutable_objects
    }

    /// Roots of other clusters referenced from this cluster
    pub fn referenced_clusters(&self) -> &[RefSlot] {
        &self.referenced_clusters
    }

    /// Whether a pending-kill reference was found during the current pass
    pub fn needs_dissolving(&self) -> bool {
        self.needs_dissolving.load(Ordering::Acquire)
    }

    /// Flag the cluster for dissolution; true for the call that raised it.
    pub(crate) fn flag_for_dissolving(&self) -> bool {
        !self.needs_dissolving.swap(true, Ordering::AcqRel)
    }

    /// Flattened member set; applying it is up to the table.
    pub fn dissolve(&self) -> DissolvedCluster {
        DissolvedCluster {
            root: self.root,
            members: self.objects.clone(),
        }
    }
}

/// All clusters of a collector.
#[derive(Debug, Default)]
pub struct ClusterTable {
    clusters: Vec<Option<Cluster>>,
    free: Vec<ClusterIndex>,
    allocated: usize,
}

impl ClusterTable {
    /// Empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live clusters
    pub fn len(&self) -> usize {
        self.allocated
    }

    /// Whether there are no clusters
    pub fn is_empty(&self) -> bool {
        self.allocated == 0
    }

    /// Cluster at `index`
    #[inline]
    pub fn get(&self, index: ClusterIndex) -> Option<&Cluster> {
        self.clusters.get(index.as_usize()).and_then(Option::as_ref)
    }

    /// Live clusters with their indices
    pub fn iter(&self) -> impl Iterator<Item = (ClusterIndex, &Cluster)> {
        self.clusters
            .iter()
            .enumerate()
            .filter_map(|(i, c)| c.as_ref().map(|c| (ClusterIndex(i as u32), c)))
    }

    /// Indices of clusters flagged for dissolution
    pub fn flagged_for_dissolving(&self) -> Vec<ClusterIndex> {
        self.iter()
            .filter(|(_, c)| c.needs_dissolving())
            .map(|(i, _)| i)
            .collect()
    }

    /// Group `root` and `members` into a new cluster.
    ///
    /// The outgoing edges are computed from the objects' token streams:
    /// references to roots of other clusters land in `referenced_clusters`,
    /// references to anything else outside the cluster (and outside the
    /// permanent pool) land in `mutable_objects`.
    pub fn create_cluster(
        &mut self,
        objects: &mut ObjectTable,
        types: &TypeRegistry,
        root: ObjectIndex,
        members: &[ObjectIndex],
    ) -> GcResult<ClusterIndex> {
        let mut inside = FxHashSet::default();
        inside.insert(root);
        check_clusterable(objects, root, false)?;
        for &member in members {
            check_clusterable(objects, member, true)?;
            if !inside.insert(member) {
                return Err(GcError::ClusterRejected {
                    object: member,
                    reason: "listed twice",
                });
            }
        }

        let mut gatherer = TargetGatherer::default();
        for &object in std::iter::once(&root).chain(members) {
            let Some(instance) = objects.instance(object) else {
                return Err(GcError::InvalidObject(object));
            };
            let type_id = instance.type_id();
            let info = types.get(type_id).ok_or(GcError::UnknownType(type_id))?;
            walk_references(info.token_stream(), info.name(), instance, &mut gatherer)?;
        }

        let mut referenced_clusters = Vec::new();
        let mut mutable_objects = Vec::new();
        let mut seen = FxHashSet::default();
        for target in gatherer.targets {
            if inside.contains(&target)
                || objects.resides_in_permanent_pool(target)
                || !seen.insert(target)
            {
                continue;
            }
            let item = objects
                .item(target)
                .filter(|item| item.is_live())
                .ok_or(GcError::InvalidObject(target))?;
            match item.membership() {
                ClusterMembership::Root(_) => referenced_clusters.push(RefSlot::new(Some(target))),
                _ => mutable_objects.push(RefSlot::new(Some(target))),
            }
        }

        let cluster = Cluster {
            root,
            objects: members.to_vec(),
            mutable_objects,
            referenced_clusters,
            needs_dissolving: AtomicBool::new(false),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.clusters[index.as_usize()] = Some(cluster);
                index
            }
            None => {
                self.clusters.push(Some(cluster));
                ClusterIndex(self.clusters.len() as u32 - 1)
            }
        };
        self.allocated += 1;

        if let Some(item) = objects.item_mut(root) {
            item.set_membership(ClusterMembership::Root(index));
            item.set_flags(InternalFlags::CLUSTER_ROOT);
        }
        for &member in members {
            if let Some(item) = objects.item_mut(member) {
                item.set_membership(ClusterMembership::Member(root));
            }
        }

        #[cfg(feature = "cluster_logging")]
        tracing::debug!(
            target: "sable::gc",
            cluster = index.0,
            root = root.0,
            members = members.len(),
            "Created cluster"
        );

        Ok(index)
    }

    /// Dissolve the cluster at `index`: members and root become independent
    /// objects and the cluster slot is freed.
    pub fn dissolve_cluster(
        &mut self,
        objects: &mut ObjectTable,
        index: ClusterIndex,
    ) -> Option<DissolvedCluster> {
        let dissolved = self.get(index)?.dissolve();
        for &member in &dissolved.members {
            if let Some(item) = objects.item_mut(member) {
                item.set_membership(ClusterMembership::None);
            }
        }
        if let Some(item) = objects.item_mut(dissolved.root) {
            item.set_membership(ClusterMembership::None);
            item.clear_flags(InternalFlags::CLUSTER_ROOT);
        }
        self.free_cluster(index);

        #[cfg(feature = "cluster_logging")]
        tracing::debug!(
            target: "sable::gc",
            cluster = index.0,
            root = dissolved.root.0,
            members = dissolved.members.len(),
            "Dissolved cluster"
        );

        Some(dissolved)
    }

    /// Destroy an unreachable cluster. Members that were not reached through
    /// another cluster become unreachable along with the root.
    pub(crate) fn destroy_unreachable_cluster(
        &mut self,
        objects: &mut ObjectTable,
        index: ClusterIndex,
    ) -> Option<DissolvedCluster> {
        let dissolved = self.dissolve_cluster(objects, index)?;
        for &member in &dissolved.members {
            if let Some(item) = objects.item(member)
                && !item.has_any_flags(InternalFlags::REACHABLE_IN_CLUSTER)
            {
                item.set_flags(InternalFlags::UNREACHABLE);
            }
        }
        Some(dissolved)
    }

    fn free_cluster(&mut self, index: ClusterIndex) {
        if let Some(slot) = self.clusters.get_mut(index.as_usize())
            && slot.take().is_some()
        {
            self.free.push(index);
            self.allocated -= 1;
        }
    }
}

fn check_clusterable(objects: &ObjectTable, object: ObjectIndex, is_member: bool) -> GcResult<()> {
    let reject = |reason| Err(GcError::ClusterRejected { object, reason });
    let Some(item) = objects.item(object).filter(|item| item.is_live()) else {
        return Err(GcError::InvalidObject(object));
    };
    if objects.resides_in_permanent_pool(object) {
        return reject("object is in the permanent pool");
    }
    if item.membership() != ClusterMembership::None {
        return reject("object is already part of a cluster");
    }
    if item.is_pending_kill() {
        return reject("object is pending kill");
    }
    if is_member && item.is_root_set() {
        return reject("rooted objects cannot be cluster members");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Field, ObjectInstance, ObjectSpec};
    use crate::types::{Property, PropertyKind, TypeId, TypeInfo};

    fn setup() -> (ObjectTable, TypeRegistry, TypeId) {
        let mut types = TypeRegistry::new();
        let node = types
            .register(TypeInfo::new("Node").property(Property::new(
                "Links",
                0,
                PropertyKind::Array(Box::new(PropertyKind::Object)),
            )))
            .unwrap();
        types.assemble_token_stream(node, false).unwrap();
        (ObjectTable::new(), types, node)
    }

    fn node(
        objects: &mut ObjectTable,
        ty: TypeId,
        name: &str,
        links: &[ObjectIndex],
    ) -> ObjectIndex {
        let fields = vec![Field::references(links.iter().copied().map(Some))];
        objects.allocate(ObjectInstance::from_spec(ObjectSpec::new(ty, name).fields(fields)))
    }

    fn link(objects: &mut ObjectTable, from: ObjectIndex, to: ObjectIndex) {
        let field = objects
            .instance_mut(from)
            .and_then(|i| i.field_mut(0))
            .and_then(Field::as_ref_array_mut)
            .unwrap();
        field.push(RefSlot::new(Some(to)));
    }

    #[test]
    fn test_create_cluster_classifies_outgoing_edges() {
        let (mut objects, types, ty) = setup();
        let outside = node(&mut objects, ty, "outside", &[]);
        let other_root = node(&mut objects, ty, "other_root", &[]);
        let other_member = node(&mut objects, ty, "other_member", &[]);
        let mut clusters = ClusterTable::new();
        clusters
            .create_cluster(&mut objects, &types, other_root, &[other_member])
            .unwrap();

        let root = node(&mut objects, ty, "root", &[outside]);
        let member = node(&mut objects, ty, "member", &[root, other_root, other_member, outside]);
        link(&mut objects, root, member);
        let index = clusters
            .create_cluster(&mut objects, &types, root, &[member])
            .unwrap();

        let cluster = clusters.get(index).unwrap();
        let mutable: Vec<_> = cluster.mutable_objects().iter().map(RefSlot::get).collect();
        let referenced: Vec<_> = cluster.referenced_clusters().iter().map(RefSlot::get).collect();
        assert_eq!(mutable, vec![Some(outside), Some(other_member)]);
        assert_eq!(referenced, vec![Some(other_root)]);
        assert_eq!(objects.item(member).unwrap().owner_index(), Some(root));
        assert_eq!(objects.item(root).unwrap().cluster_index(), Some(index));
        assert!(objects.item(root).unwrap().has_any_flags(InternalFlags::CLUSTER_ROOT));
    }

    #[test]
    fn test_create_cluster_rejects_unsuitable_members() {
        let (mut objects, types, ty) = setup();
        let root = node(&mut objects, ty, "root", &[]);
        let rooted = node(&mut objects, ty, "rooted", &[]);
        let doomed = node(&mut objects, ty, "doomed", &[]);
        objects.item(rooted).unwrap().set_flags(InternalFlags::ROOT_SET);
        objects.item(doomed).unwrap().set_flags(InternalFlags::PENDING_KILL);
        let mut clusters = ClusterTable::new();

        assert!(matches!(
            clusters.create_cluster(&mut objects, &types, root, &[rooted]),
            Err(GcError::ClusterRejected { .. })
        ));
        assert!(matches!(
            clusters.create_cluster(&mut objects, &types, root, &[doomed]),
            Err(GcError::ClusterRejected { .. })
        ));
        assert!(clusters.is_empty());
        assert_eq!(objects.item(root).unwrap().membership(), ClusterMembership::None);
    }

    #[test]
    fn test_dissolve_resets_membership_and_recycles_slot() {
        let (mut objects, types, ty) = setup();
        let root = node(&mut objects, ty, "root", &[]);
        let a = node(&mut objects, ty, "a", &[]);
        let b = node(&mut objects, ty, "b", &[]);
        let mut clusters = ClusterTable::new();
        let index = clusters.create_cluster(&mut objects, &types, root, &[a, b]).unwrap();

        let dissolved = clusters.dissolve_cluster(&mut objects, index).unwrap();
        assert_eq!(dissolved.members, vec![a, b]);
        assert!(clusters.get(index).is_none());
        assert!(!objects.item(root).unwrap().has_any_flags(InternalFlags::CLUSTER_ROOT));
        assert_eq!(objects.item(a).unwrap().owner_index(), None);

        let again = clusters.create_cluster(&mut objects, &types, a, &[b]).unwrap();
        assert_eq!(again, index);
    }

    #[test]
    fn test_needs_dissolving_is_raised_once() {
        let (mut objects, types, ty) = setup();
        let root = node(&mut objects, ty, "root", &[]);
        let mut clusters = ClusterTable::new();
        let index = clusters.create_cluster(&mut objects, &types, root, &[]).unwrap();
        let cluster = clusters.get(index).unwrap();
        assert!(cluster.flag_for_dissolving());
        assert!(!cluster.flag_for_dissolving());
        assert_eq!(clusters.flagged_for_dissolving(), vec![index]);
    }
}
