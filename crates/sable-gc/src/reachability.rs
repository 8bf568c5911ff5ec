//! Reachability analysis
//!
//! One pass runs `MarkUnreachable -> Traverse -> ReconcileClusters ->
//! Finished` without interruption:
//!
//! - **MarkUnreachable**: clusters holding pending-kill objects are dissolved,
//!   kept objects seed the frontier, everything else outside clusters is
//!   flagged `UNREACHABLE`.
//! - **Traverse**: the graph collector drains the frontier.
//! - **ReconcileClusters**: clusters that found pending-kill references
//!   during traversal are dissolved.
//! - **Finished**: unreachable cluster roots take their unreached members
//!   down with them, and `begin_destroy` is routed to every unreachable
//!   object.

use std::time::{Duration, Instant};

use rayon::ThreadPool;
use rustc_hash::FxHashSet;

use crate::cluster::{ClusterIndex, ClusterTable, DissolvedCluster};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult};
use crate::flags::{InternalFlags, ObjectFlags};
use crate::graph::{GraphCollector, TraversalStats};
use crate::object::ObjectIndex;
use crate::object_table::{ClusterMembership, ObjectTable};
use crate::processor::{MarkStrategy, ParallelStrategy, ReferenceProcessor, SequentialStrategy};
use crate::token_stream::{TargetGatherer, walk_references};
use crate::types::TypeRegistry;

/// Phase of a reachability pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReachabilityPhase {
    /// Resetting flags and seeding the frontier
    #[default]
    MarkUnreachable,
    /// Draining the frontier
    Traverse,
    /// Dissolving clusters flagged during traversal
    ReconcileClusters,
    /// Unreachable set is final
    Finished,
}

/// Outcome of one reachability pass.
#[derive(Debug, Clone, Default)]
pub struct ReachabilityReport {
    /// Last phase the pass entered
    pub phase: ReachabilityPhase,
    /// Objects outside the permanent pool examined by the mark phase
    pub objects_considered: usize,
    /// Objects kept by the root set or keep flags
    pub seeded: usize,
    /// Final unreachable set, `begin_destroy` already routed
    pub unreachable: Vec<ObjectIndex>,
    /// Clusters dissolved because of pending-kill objects
    pub dissolved_clusters: Vec<DissolvedCluster>,
    /// Clusters torn down because their root was unreachable
    pub destroyed_clusters: usize,
    /// Graph traversal counters
    pub traversal: TraversalStats,
    /// Time spent flagging and seeding
    pub mark_time: Duration,
    /// Time spent draining the frontier
    pub traverse_time: Duration,
    /// Time spent dissolving and destroying clusters
    pub dissolve_time: Duration,
}

impl ReachabilityReport {
    fn enter(&mut self, phase: ReachabilityPhase) {
        tracing::trace!(target: "sable::gc", ?phase, "Reachability phase");
        self.phase = phase;
    }
}

/// Runs one reachability pass over the collector's tables.
pub struct ReachabilityEngine<'c> {
    objects: &'c mut ObjectTable,
    clusters: &'c mut ClusterTable,
    types: &'c TypeRegistry,
    config: &'c GcConfig,
    pool: Option<&'c ThreadPool>,
}

impl<'c> ReachabilityEngine<'c> {
    /// Engine over the given tables
    pub fn new(
        objects: &'c mut ObjectTable,
        clusters: &'c mut ClusterTable,
        types: &'c TypeRegistry,
        config: &'c GcConfig,
        pool: Option<&'c ThreadPool>,
    ) -> Self {
        Self {
            objects,
            clusters,
            types,
            config,
            pool,
        }
    }

    /// Run the pass. Objects whose instance flags intersect `keep_flags`
    /// are kept alive in addition to the root set.
    pub fn run(mut self, keep_flags: ObjectFlags) -> ReachabilityReport {
        let mut report = ReachabilityReport::default();

        report.enter(ReachabilityPhase::MarkUnreachable);
        let mark_start = Instant::now();
        self.dissolve_pending_kill_clusters(&mut report);

        let strategy: &dyn MarkStrategy = if self.config.allow_parallel {
            &ParallelStrategy
        } else {
            &SequentialStrategy
        };
        {
            let processor = ReferenceProcessor::new(
                self.objects,
                self.clusters,
                self.types,
                strategy,
                self.config.object_checks,
            );
            let frontier = mark_unreachable(&processor, self.objects, keep_flags, &mut report);
            report.mark_time = mark_start.elapsed();

            report.enter(ReachabilityPhase::Traverse);
            let traverse_start = Instant::now();
            report.traversal =
                GraphCollector::new(&processor, self.config.min_objects_per_task, self.pool)
                    .collect(frontier);
            report.traverse_time = traverse_start.elapsed();
        }

        report.enter(ReachabilityPhase::ReconcileClusters);
        let dissolve_start = Instant::now();
        for index in self.clusters.flagged_for_dissolving() {
            if let Some(dissolved) = self.clusters.dissolve_cluster(self.objects, index) {
                report.dissolved_clusters.push(dissolved);
            }
        }

        report.enter(ReachabilityPhase::Finished);
        report.destroyed_clusters = self.destroy_unreachable_clusters();
        report.dissolve_time = dissolve_start.elapsed();
        report.unreachable = self.begin_destroy_unreachable();

        tracing::debug!(
            target: "sable::gc",
            considered = report.objects_considered,
            seeded = report.seeded,
            unreachable = report.unreachable.len(),
            processed = report.traversal.objects_processed,
            parallel_rounds = report.traversal.parallel_rounds,
            dissolved_clusters = report.dissolved_clusters.len(),
            destroyed_clusters = report.destroyed_clusters,
            mark_us = report.mark_time.as_micros() as u64,
            traverse_us = report.traverse_time.as_micros() as u64,
            dissolve_us = report.dissolve_time.as_micros() as u64,
            "Reachability analysis complete"
        );
        report
    }

    /// A cluster whose root or any member is pending kill cannot be kept
    /// as a unit; it is dissolved before flags are assigned.
    fn dissolve_pending_kill_clusters(&mut self, report: &mut ReachabilityReport) {
        let objects = &*self.objects;
        let pending_kill =
            |index: ObjectIndex| objects.item(index).is_some_and(|i| i.is_pending_kill());
        let doomed: Vec<ClusterIndex> = self
            .clusters
            .iter()
            .filter(|(_, c)| {
                pending_kill(c.root()) || c.objects().iter().any(|&m| pending_kill(m))
            })
            .map(|(index, _)| index)
            .collect();
        for index in doomed {
            if let Some(dissolved) = self.clusters.dissolve_cluster(self.objects, index) {
                report.dissolved_clusters.push(dissolved);
            }
        }
    }

    fn destroy_unreachable_clusters(&mut self) -> usize {
        let objects = &*self.objects;
        let unreachable_roots: Vec<ClusterIndex> = self
            .clusters
            .iter()
            .filter(|(_, c)| objects.item(c.root()).is_some_and(|i| i.is_unreachable()))
            .map(|(index, _)| index)
            .collect();
        let mut destroyed = 0;
        for index in unreachable_roots {
            if self
                .clusters
                .destroy_unreachable_cluster(self.objects, index)
                .is_some()
            {
                destroyed += 1;
            }
        }
        destroyed
    }

    fn begin_destroy_unreachable(&mut self) -> Vec<ObjectIndex> {
        let unreachable: Vec<ObjectIndex> = self
            .objects
            .iter(true)
            .filter(|(_, item)| item.is_unreachable())
            .map(|(index, _)| index)
            .collect();
        for &index in &unreachable {
            if let Some(instance) = self.objects.instance_mut(index) {
                instance.conditional_begin_destroy();
            }
        }
        unreachable
    }
}

/// Flag every object and return the initial frontier.
fn mark_unreachable(
    processor: &ReferenceProcessor<'_>,
    objects: &ObjectTable,
    keep_flags: ObjectFlags,
    report: &mut ReachabilityReport,
) -> Vec<ObjectIndex> {
    let mut frontier = Vec::new();
    let mut kept_in_clusters = Vec::new();

    for (index, item) in objects.iter(true) {
        debug_assert!(
            !item.is_unreachable(),
            "object {index} is still unreachable from the previous pass; purge must finish first"
        );
        item.clear_flags(InternalFlags::REACHABLE_IN_CLUSTER);
        report.objects_considered += 1;

        let kept = !item.is_pending_kill()
            && (item.has_any_flags(InternalFlags::ROOT_SET | InternalFlags::GARBAGE_COLLECTION_KEEP)
                || item
                    .instance()
                    .is_some_and(|instance| instance.has_any_flags(keep_flags)));
        if kept {
            frontier.push(index);
            if item.membership() != ClusterMembership::None {
                kept_in_clusters.push(index);
            }
        } else if item.owner_index().is_none() {
            item.set_flags(InternalFlags::UNREACHABLE);
        }
    }
    report.seeded = frontier.len();

    let mut premarked = FxHashSet::default();
    let mut to_mark = Vec::new();
    for index in kept_in_clusters {
        let item = objects.item_for_gc(index);
        match item.membership() {
            ClusterMembership::Root(cluster) => {
                if premarked.insert(cluster) {
                    to_mark.push(cluster);
                }
            }
            ClusterMembership::Member(owner) => {
                item.set_flags(InternalFlags::REACHABLE_IN_CLUSTER);
                let root = objects.item_for_gc(owner);
                if let Some(cluster) = root.cluster_index() {
                    root.clear_flags(InternalFlags::UNREACHABLE);
                    if premarked.insert(cluster) {
                        to_mark.push(cluster);
                    }
                }
            }
            ClusterMembership::None => {}
        }
    }
    for cluster in to_mark {
        processor.mark_cluster_reachable(cluster, &mut frontier);
    }
    frontier
}

/// Check that permanent-pool objects only reference objects that can never
/// be collected: permanent, rooted, or clustered ones.
pub fn verify_disregard_for_gc_assumptions(
    objects: &ObjectTable,
    types: &TypeRegistry,
) -> GcResult<()> {
    let mut violations = 0;
    for index in (0..objects.permanent_count() as u32).map(ObjectIndex) {
        let Some(instance) = objects.instance(index) else {
            continue;
        };
        let Some(info) = types.get(instance.type_id()) else {
            return Err(GcError::UnknownType(instance.type_id()));
        };
        let mut gatherer = TargetGatherer::default();
        walk_references(info.token_stream(), info.name(), instance, &mut gatherer)?;

        let offending = gatherer.targets.iter().find(|&&target| {
            !objects.resides_in_permanent_pool(target)
                && !objects.item(target).is_some_and(|item| {
                    item.is_root_set() || item.membership() != ClusterMembership::None
                })
        });
        if let Some(target) = offending {
            violations += 1;
            tracing::warn!(
                target: "sable::gc",
                object = %objects.path_name(index),
                type_name = info.name(),
                referenced = %objects.path_name(*target),
                "Permanent object references a collectable object"
            );
        }
    }
    if violations > 0 {
        return Err(GcError::AssumptionViolation(violations));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Field, ObjectInstance, ObjectSpec};
    use crate::types::{Property, PropertyKind, TypeId, TypeInfo};

    struct World {
        objects: ObjectTable,
        clusters: ClusterTable,
        types: TypeRegistry,
        ty: TypeId,
        config: GcConfig,
    }

    impl World {
        fn new(allow_parallel: bool) -> Self {
            let mut types = TypeRegistry::new();
            let ty = types
                .register(TypeInfo::new("Node").property(Property::new(
                    "Links",
                    0,
                    PropertyKind::Array(Box::new(PropertyKind::Object)),
                )))
                .unwrap();
            types.assemble_token_stream(ty, false).unwrap();
            Self {
                objects: ObjectTable::new(),
                clusters: ClusterTable::new(),
                types,
                ty,
                config: GcConfig {
                    allow_parallel,
                    min_objects_per_task: 1,
                    ..GcConfig::default()
                },
            }
        }

        fn node(&mut self, name: &str, links: &[ObjectIndex]) -> ObjectIndex {
            self.objects.allocate(ObjectInstance::from_spec(
                ObjectSpec::new(self.ty, name)
                    .fields(vec![Field::references(links.iter().copied().map(Some))]),
            ))
        }

        fn run(&mut self, keep_flags: ObjectFlags) -> ReachabilityReport {
            ReachabilityEngine::new(
                &mut self.objects,
                &mut self.clusters,
                &self.types,
                &self.config,
                None,
            )
            .run(keep_flags)
        }
    }

    #[test]
    fn test_unreferenced_objects_are_unreachable() {
        let mut world = World::new(false);
        let child = world.node("child", &[]);
        let root = world.node("root", &[child]);
        let orphan = world.node("orphan", &[]);
        world.objects.item(root).unwrap().set_flags(InternalFlags::ROOT_SET);

        let report = world.run(ObjectFlags::NO_FLAGS);
        assert_eq!(report.unreachable, vec![orphan]);
        assert_eq!(report.seeded, 1);
        assert_eq!(report.phase, ReachabilityPhase::Finished);
        assert!(
            world
                .objects
                .instance(orphan)
                .unwrap()
                .has_any_flags(ObjectFlags::BEGIN_DESTROYED)
        );
    }

    #[test]
    fn test_keep_flags_and_internal_keep_bits_seed() {
        let mut world = World::new(true);
        let standalone = world.objects.allocate(ObjectInstance::from_spec(
            ObjectSpec::new(world.ty, "standalone")
                .flags(ObjectFlags::STANDALONE)
                .fields(vec![Field::references([])]),
        ));
        let native = world.node("native", &[]);
        let doomed_root = world.node("doomed_root", &[]);
        world.objects.item(native).unwrap().set_flags(InternalFlags::NATIVE);
        world
            .objects
            .item(doomed_root)
            .unwrap()
            .set_flags(InternalFlags::ROOT_SET | InternalFlags::PENDING_KILL);

        let report = world.run(ObjectFlags::STANDALONE);
        assert_eq!(report.unreachable, vec![doomed_root]);
        assert!(!world.objects.item(standalone).unwrap().is_unreachable());
        assert!(!world.objects.item(native).unwrap().is_unreachable());
    }

    #[test]
    fn test_unreachable_cluster_is_destroyed_with_members() {
        let mut world = World::new(false);
        let root = world.node("root", &[]);
        let member = world.node("member", &[]);
        world
            .clusters
            .create_cluster(&mut world.objects, &world.types, root, &[member])
            .unwrap();

        let report = world.run(ObjectFlags::NO_FLAGS);
        assert_eq!(report.destroyed_clusters, 1);
        assert_eq!(report.unreachable, vec![root, member]);
        assert!(world.clusters.is_empty());
        assert_eq!(world.objects.item(member).unwrap().owner_index(), None);
    }

    #[test]
    fn test_kept_member_keeps_its_cluster() {
        let mut world = World::new(false);
        let outside = world.node("outside", &[]);
        let root = world.node("root", &[]);
        let member = world.node("member", &[outside]);
        world
            .clusters
            .create_cluster(&mut world.objects, &world.types, root, &[member])
            .unwrap();
        world.objects.item(member).unwrap().set_flags(InternalFlags::NATIVE);

        let report = world.run(ObjectFlags::NO_FLAGS);
        assert!(report.unreachable.is_empty());
        assert_eq!(world.clusters.len(), 1);
    }

    #[test]
    fn test_permanent_objects_must_not_reference_collectable_objects() {
        let mut world = World::new(false);
        world.objects.open_disregard_for_gc();
        let permanent = world.node("permanent", &[]);
        world.objects.close_disregard_for_gc();
        let loose = world.node("loose", &[]);
        verify_disregard_for_gc_assumptions(&world.objects, &world.types).unwrap();

        world
            .objects
            .instance_mut(permanent)
            .unwrap()
            .field_mut(0)
            .and_then(Field::as_ref_array_mut)
            .unwrap()
            .push(crate::object::RefSlot::new(Some(loose)));
        assert!(matches!(
            verify_disregard_for_gc_assumptions(&world.objects, &world.types),
            Err(GcError::AssumptionViolation(1))
        ));

        world.objects.item(loose).unwrap().set_flags(InternalFlags::ROOT_SET);
        verify_disregard_for_gc_assumptions(&world.objects, &world.types).unwrap();
    }
}
