//! Reference processor
//!
//! Decides, for every reference discovered during traversal, whether the
//! target becomes reachable and must be visited. The decision only touches
//! the target's atomic flag word (and, for clusters, the cluster's edge
//! entries), so any number of workers may run it concurrently against the
//! same shared tables.

use crate::cluster::{Cluster, ClusterIndex, ClusterTable};
use crate::error::{GcError, fatal};
use crate::flags::InternalFlags;
use crate::object::{ObjectIndex, RefSlot};
use crate::object_table::{ObjectItem, ObjectTable};
use crate::token_stream::{TokenVisitor, walk_references};
use crate::types::TypeRegistry;

/// Receives object references reported by token streams, container
/// referencers and native callbacks.
pub trait ReferenceCollector {
    /// Report one reference slot. The collector may null the slot.
    fn handle_reference(&mut self, slot: &RefSlot);

    /// Report a run of reference slots
    fn handle_references(&mut self, slots: &[RefSlot]) {
        for slot in slots {
            self.handle_reference(slot);
        }
    }

    /// Whether pending-kill targets may be nulled in the slots reported next.
    /// Native code holding references it cannot see cleared turns this off.
    fn allow_eliminating_references(&mut self, _allow: bool) {}
}

/// How flag transitions are applied during traversal.
pub trait MarkStrategy: Sync {
    /// Clear `UNREACHABLE` on a slot observed unreachable. Returns whether
    /// the caller owns the transition and must follow up.
    fn clear_unreachable(&self, item: &ObjectItem) -> bool;

    /// Set `REACHABLE_IN_CLUSTER` on a member observed without it. Returns
    /// whether the caller owns the transition.
    fn mark_reachable_in_cluster(&self, item: &ObjectItem) -> bool;

    /// Whether the strategy tolerates concurrent callers
    fn is_parallel(&self) -> bool;
}

/// Single-threaded traversal: plain load/store, the caller always wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequentialStrategy;

impl MarkStrategy for SequentialStrategy {
    #[inline]
    fn clear_unreachable(&self, item: &ObjectItem) -> bool {
        item.clear_flags(InternalFlags::UNREACHABLE);
        true
    }

    #[inline]
    fn mark_reachable_in_cluster(&self, item: &ObjectItem) -> bool {
        item.set_flags(InternalFlags::REACHABLE_IN_CLUSTER);
        true
    }

    fn is_parallel(&self) -> bool {
        false
    }
}

/// Multi-threaded traversal: atomic read-modify-write, only the thread that
/// flipped the bit wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct ParallelStrategy;

impl MarkStrategy for ParallelStrategy {
    #[inline]
    fn clear_unreachable(&self, item: &ObjectItem) -> bool {
        item.this_thread_atomically_cleared_flag(InternalFlags::UNREACHABLE)
    }

    #[inline]
    fn mark_reachable_in_cluster(&self, item: &ObjectItem) -> bool {
        item.this_thread_atomically_set_flag(InternalFlags::REACHABLE_IN_CLUSTER)
    }

    fn is_parallel(&self) -> bool {
        true
    }
}

/// Shared, read-only view used by every traversal worker.
pub struct ReferenceProcessor<'a> {
    objects: &'a ObjectTable,
    clusters: &'a ClusterTable,
    types: &'a TypeRegistry,
    strategy: &'a dyn MarkStrategy,
    object_checks: bool,
}

/// Where a reference was found, for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct ReferenceSite {
    /// Object holding the reference
    pub referencing: ObjectIndex,
    /// Token index, `None` for native references
    pub token_index: Option<usize>,
    /// Found in a cluster's outgoing edge lists rather than in the object
    pub cluster_edge: bool,
}

impl<'a> ReferenceProcessor<'a> {
    /// Processor over the given tables
    pub fn new(
        objects: &'a ObjectTable,
        clusters: &'a ClusterTable,
        types: &'a TypeRegistry,
        strategy: &'a dyn MarkStrategy,
        object_checks: bool,
    ) -> Self {
        Self {
            objects,
            clusters,
            types,
            strategy,
            object_checks,
        }
    }

    /// Object table being traversed
    pub fn objects(&self) -> &'a ObjectTable {
        self.objects
    }

    /// Whether the strategy is the parallel one
    pub fn is_parallel(&self) -> bool {
        self.strategy.is_parallel()
    }

    /// Visit every reference of `object`, appending newly reachable objects
    /// to `out`.
    pub fn process_object(&self, object: ObjectIndex, out: &mut Vec<ObjectIndex>) {
        let Some(instance) = self.objects.instance(object) else {
            return;
        };
        let Some(info) = self.types.get(instance.type_id()) else {
            fatal(GcError::UnknownType(instance.type_id()));
        };
        let mut collector = ProcessorCollector {
            processor: self,
            out,
            site: ReferenceSite {
                referencing: object,
                token_index: None,
                cluster_edge: false,
            },
            allow_elimination: true,
        };
        if let Err(error) =
            walk_references(info.token_stream(), info.name(), instance, &mut collector)
        {
            fatal(error);
        }
    }

    /// Apply the reachability rules to one reference.
    ///
    /// 1. Null or permanent targets are ignored.
    /// 2. Pending-kill targets are nulled in place when elimination is allowed.
    /// 3. Unreachable targets are cleared; plain objects are enqueued, cluster
    ///    roots mark their cluster.
    /// 4. Cluster members are flagged reachable-in-cluster and wake their
    ///    owning cluster if its root is still unreachable.
    pub fn handle_reference(
        &self,
        slot: &RefSlot,
        allow_elimination: bool,
        site: ReferenceSite,
        out: &mut Vec<ObjectIndex>,
    ) {
        let Some(target) = slot.get() else {
            return;
        };
        if self.objects.resides_in_permanent_pool(target) {
            return;
        }
        if self.object_checks && !self.objects.is_valid(target) {
            self.invalid_reference(target, site);
        }
        let item = self.objects.item_for_gc(target);
        if allow_elimination && item.is_pending_kill() {
            slot.clear();
        } else if item.is_unreachable() {
            if self.strategy.clear_unreachable(item) {
                match item.cluster_index() {
                    Some(cluster) => self.mark_cluster_reachable(cluster, out),
                    None => out.push(target),
                }
            }
        } else if let Some(owner) = item.owner_index()
            && !item.has_any_flags(InternalFlags::REACHABLE_IN_CLUSTER)
            && self.strategy.mark_reachable_in_cluster(item)
        {
            self.wake_owner(owner, out);
        }
    }

    fn wake_owner(&self, owner: ObjectIndex, out: &mut Vec<ObjectIndex>) {
        let root = self.objects.item_for_gc(owner);
        if root.is_unreachable()
            && self.strategy.clear_unreachable(root)
            && let Some(cluster) = root.cluster_index()
        {
            self.mark_cluster_reachable(cluster, out);
        }
    }

    /// Mark a cluster whose root was just reached.
    ///
    /// Visits the cluster's outgoing edges instead of its members. Clusters
    /// reached through `referenced_clusters` are processed from a local
    /// worklist. A pending-kill edge target is nulled and flags the cluster
    /// for dissolution, in which case all its objects are enqueued so their
    /// own references get traversed (and cleaned) individually.
    pub fn mark_cluster_reachable(&self, cluster: ClusterIndex, out: &mut Vec<ObjectIndex>) {
        let mut pending = vec![cluster];
        while let Some(index) = pending.pop() {
            let Some(cluster) = self.clusters.get(index) else {
                continue;
            };
            for slot in cluster
                .referenced_clusters()
                .iter()
                .chain(cluster.mutable_objects())
            {
                if let Some(target) = slot.get() {
                    self.handle_cluster_edge(slot, target, cluster, &mut pending, out);
                }
            }
            if cluster.needs_dissolving() {
                out.push(cluster.root());
                out.extend_from_slice(cluster.objects());
            }
        }
    }

    fn handle_cluster_edge(
        &self,
        slot: &RefSlot,
        target: ObjectIndex,
        cluster: &Cluster,
        pending: &mut Vec<ClusterIndex>,
        out: &mut Vec<ObjectIndex>,
    ) {
        if self.objects.resides_in_permanent_pool(target) {
            return;
        }
        if self.object_checks && !self.objects.is_valid(target) {
            self.invalid_reference(
                target,
                ReferenceSite {
                    referencing: cluster.root(),
                    token_index: None,
                    cluster_edge: true,
                },
            );
        }
        let item = self.objects.item_for_gc(target);
        if item.is_pending_kill() {
            slot.clear();
            cluster.flag_for_dissolving();
        } else if item.is_unreachable() {
            if self.strategy.clear_unreachable(item) {
                match item.cluster_index() {
                    Some(next) => pending.push(next),
                    None => out.push(target),
                }
            }
        } else if let Some(owner) = item.owner_index()
            && !item.has_any_flags(InternalFlags::REACHABLE_IN_CLUSTER)
            && self.strategy.mark_reachable_in_cluster(item)
        {
            let root = self.objects.item_for_gc(owner);
            if root.is_unreachable()
                && self.strategy.clear_unreachable(root)
                && let Some(next) = root.cluster_index()
            {
                pending.push(next);
            }
        }
    }

    #[cold]
    fn invalid_reference(&self, target: ObjectIndex, site: ReferenceSite) -> ! {
        let referencing = match self.objects.instance(site.referencing) {
            Some(instance) => format!(
                "{} {}",
                self.types.type_name(instance.type_id()),
                self.objects.path_name(site.referencing)
            ),
            None => format!("<invalid {}>", site.referencing),
        };
        let debug = site.token_index.and_then(|index| {
            let instance = self.objects.instance(site.referencing)?;
            self.types
                .get(instance.type_id())?
                .debug_map()
                .get(index)
                .cloned()
        });
        let field = match debug {
            Some(info) => format!("property: {} (offset {})", info.name, info.offset),
            None if site.cluster_edge => {
                "cluster edge (mutable objects or referenced clusters)".to_owned()
            }
            None => "native reference".to_owned(),
        };
        fatal(GcError::InvalidReference {
            target: target.0,
            referencing,
            field,
            token_index: site.token_index.map_or(-1, |index| index as i64),
        })
    }
}

struct ProcessorCollector<'p, 'a> {
    processor: &'p ReferenceProcessor<'a>,
    out: &'p mut Vec<ObjectIndex>,
    site: ReferenceSite,
    allow_elimination: bool,
}

impl ReferenceCollector for ProcessorCollector<'_, '_> {
    fn handle_reference(&mut self, slot: &RefSlot) {
        self.processor
            .handle_reference(slot, self.allow_elimination, self.site, self.out);
    }

    fn allow_eliminating_references(&mut self, allow: bool) {
        self.allow_elimination = allow;
    }
}

impl TokenVisitor for ProcessorCollector<'_, '_> {
    fn enter_token(&mut self, index: Option<usize>) {
        self.site.token_index = index;
        // Native callbacks start from the default and may opt out.
        self.allow_elimination = true;
    }
}
