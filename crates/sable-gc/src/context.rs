//! Collector context
//!
//! [`CollectorContext`] owns every table of one collector instance and is
//! the embedder's entry point: allocation, rooting, clustering, collection
//! and incremental purging. It is passed explicitly; there is no global
//! collector. Other threads coordinate through the shared [`GcGate`].

use std::sync::Arc;
use std::time::{Duration, Instant};

use rayon::{ThreadPool, ThreadPoolBuilder};

use crate::cluster::{ClusterIndex, ClusterTable, DissolvedCluster};
use crate::config::GcConfig;
use crate::error::{GcError, GcResult, fatal};
use crate::flags::{InternalFlags, ObjectFlags};
use crate::gate::GcGate;
use crate::graph::TraversalStats;
use crate::object::{ObjectIndex, ObjectInstance, ObjectSpec};
use crate::object_table::{ObjectItem, ObjectTable};
use crate::purge::{IncrementalPurger, PurgePhase};
use crate::reachability::{ReachabilityEngine, verify_disregard_for_gc_assumptions};
use crate::types::{TypeId, TypeInfo, TypeRegistry};

/// Collector lifecycle notification.
#[derive(Debug)]
pub enum GcEvent<'a> {
    /// A collection is about to start; the gate is held
    PreCollect,
    /// Reachability analysis finished; `begin_destroy` has been routed
    PostReachabilityAnalysis {
        /// Final unreachable set
        unreachable: &'a [ObjectIndex],
    },
    /// The collection finished (a full purge, if requested, included)
    PostCollect(&'a CollectionReport),
}

/// Lifecycle callback registered with [`CollectorContext::on_gc_event`].
pub type GcCallback = Box<dyn FnMut(&GcEvent<'_>) + Send>;

/// Outcome of one collection.
#[derive(Debug, Clone, Default)]
pub struct CollectionReport {
    /// Sequence number, starting at 1
    pub collection: u64,
    /// Objects outside the permanent pool examined
    pub objects_considered: usize,
    /// Objects kept by the root set or keep flags
    pub seeded: usize,
    /// Objects found unreachable
    pub unreachable: usize,
    /// Clusters dissolved because of pending-kill objects
    pub dissolved_clusters: Vec<DissolvedCluster>,
    /// Clusters torn down with their unreachable root
    pub destroyed_clusters: usize,
    /// Traversal counters
    pub traversal: TraversalStats,
    /// Mark phase duration
    pub mark_time: Duration,
    /// Traverse phase duration
    pub traverse_time: Duration,
    /// Cluster reconciliation duration
    pub dissolve_time: Duration,
    /// Whole pause, purge included when it ran to completion inline
    pub pause_time: Duration,
    /// Whether the purge ran to completion inside the collection
    pub full_purge: bool,
}

/// Cumulative collector statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    /// Collections performed
    pub collections: u64,
    /// Collections forced after too many skipped attempts
    pub forced_collections: u64,
    /// `try_run_collection` calls that found the gate held
    pub skipped_attempts: u64,
    /// Objects freed by completed purges
    pub objects_purged: u64,
    /// Total pause time across all collections
    pub total_pause_time: Duration,
    /// Pause time of the last collection
    pub last_pause_time: Duration,
}

/// One garbage collector instance.
pub struct CollectorContext {
    config: GcConfig,
    objects: ObjectTable,
    clusters: ClusterTable,
    types: TypeRegistry,
    purger: IncrementalPurger,
    gate: Arc<GcGate>,
    pool: Option<ThreadPool>,
    stats: GcStats,
    last_collection: Option<CollectionReport>,
    consecutive_skips: u32,
    callbacks: Vec<GcCallback>,
}

impl CollectorContext {
    /// Create a collector. Builds a dedicated worker pool when
    /// `config.worker_threads` is set.
    pub fn new(config: GcConfig) -> GcResult<Self> {
        let pool = match config.worker_threads {
            Some(threads) => Some(
                ThreadPoolBuilder::new()
                    .num_threads(threads)
                    .thread_name(|i| format!("sable-gc-{i}"))
                    .build()?,
            ),
            None => None,
        };
        tracing::debug!(
            target: "sable::gc",
            allow_parallel = config.allow_parallel,
            min_objects_per_task = config.min_objects_per_task,
            worker_threads = ?config.worker_threads,
            "Collector created"
        );
        Ok(Self {
            purger: IncrementalPurger::new(
                config.finalize_poll_granularity,
                config.delete_poll_granularity,
                config.detailed_stats,
            ),
            config,
            objects: ObjectTable::new(),
            clusters: ClusterTable::new(),
            types: TypeRegistry::new(),
            gate: Arc::new(GcGate::new()),
            pool,
            stats: GcStats::default(),
            last_collection: None,
            consecutive_skips: 0,
            callbacks: Vec::new(),
        })
    }

    /// Active configuration
    pub fn config(&self) -> &GcConfig {
        &self.config
    }

    /// Gate shared with other threads
    pub fn gate(&self) -> Arc<GcGate> {
        Arc::clone(&self.gate)
    }

    /// Object table
    pub fn objects(&self) -> &ObjectTable {
        &self.objects
    }

    /// Cluster table
    pub fn clusters(&self) -> &ClusterTable {
        &self.clusters
    }

    /// Type registry
    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    // ---------------------------------------------------------------------
    // Types and allocation
    // ---------------------------------------------------------------------

    /// Register a type
    pub fn register_type(&mut self, info: TypeInfo) -> GcResult<TypeId> {
        self.types.register(info)
    }

    /// Registered type by name
    pub fn type_id(&self, name: &str) -> Option<TypeId> {
        self.types.lookup(name)
    }

    /// Build (or with `force`, rebuild) the token stream of `type_id`
    pub fn assemble_token_stream(&mut self, type_id: TypeId, force: bool) -> GcResult<()> {
        self.types.assemble_token_stream(type_id, force)
    }

    /// Allocate an object. The type's token stream is assembled on first use.
    pub fn allocate(&mut self, spec: ObjectSpec) -> GcResult<ObjectIndex> {
        let type_id = spec.type_id();
        let assembled = self
            .types
            .get(type_id)
            .ok_or(GcError::UnknownType(type_id))?
            .is_assembled();
        if !assembled {
            self.types.assemble_token_stream(type_id, false)?;
        }
        Ok(self.objects.allocate(ObjectInstance::from_spec(spec)))
    }

    /// Live object at `index`
    pub fn object(&self, index: ObjectIndex) -> Option<&ObjectInstance> {
        self.objects.instance(index)
    }

    /// Mutable live object at `index`
    pub fn object_mut(&mut self, index: ObjectIndex) -> Option<&mut ObjectInstance> {
        self.objects.instance_mut(index)
    }

    /// Start placing allocations into the permanent pool. Only possible
    /// before the first allocation.
    pub fn open_disregard_for_gc(&mut self) -> bool {
        self.objects.open_disregard_for_gc()
    }

    /// Seal the permanent pool
    pub fn close_disregard_for_gc(&mut self) {
        self.objects.close_disregard_for_gc();
    }

    // ---------------------------------------------------------------------
    // Reachability state
    // ---------------------------------------------------------------------

    /// Slot of an object whose reachability state may still change.
    fn mutable_item(&self, index: ObjectIndex) -> GcResult<&ObjectItem> {
        let item = self
            .objects
            .item(index)
            .filter(|item| item.is_live())
            .ok_or(GcError::InvalidObject(index))?;
        if item.is_unreachable() {
            return Err(GcError::PurgeInProgress(index));
        }
        Ok(item)
    }

    /// Pin `index` in the root set
    pub fn add_to_root(&mut self, index: ObjectIndex) -> GcResult<()> {
        self.mutable_item(index)?.set_flags(InternalFlags::ROOT_SET);
        Ok(())
    }

    /// Unpin `index`
    pub fn remove_from_root(&mut self, index: ObjectIndex) -> GcResult<()> {
        self.mutable_item(index)?.clear_flags(InternalFlags::ROOT_SET);
        Ok(())
    }

    /// Condemn `index`: the next collection nulls references to it and
    /// collects it regardless of keep flags.
    pub fn mark_pending_kill(&mut self, index: ObjectIndex) -> GcResult<()> {
        self.mutable_item(index)?.set_flags(InternalFlags::PENDING_KILL);
        Ok(())
    }

    /// Revoke a pending-kill mark
    pub fn clear_pending_kill(&mut self, index: ObjectIndex) -> GcResult<()> {
        self.mutable_item(index)?.clear_flags(InternalFlags::PENDING_KILL);
        Ok(())
    }

    /// Set or clear the always-keep bits (`NATIVE`, `ASYNC`). Other bits in
    /// `flags` are ignored.
    pub fn set_internal_flags(
        &mut self,
        index: ObjectIndex,
        flags: InternalFlags,
        set: bool,
    ) -> GcResult<()> {
        let flags = flags & InternalFlags::GARBAGE_COLLECTION_KEEP;
        let item = self.mutable_item(index)?;
        if set {
            item.set_flags(flags);
        } else {
            item.clear_flags(flags);
        }
        Ok(())
    }

    /// Whether `index` was found unreachable and awaits purge
    pub fn is_unreachable(&self, index: ObjectIndex) -> bool {
        self.objects.item(index).is_some_and(ObjectItem::is_unreachable)
    }

    /// Group objects into a cluster
    pub fn create_cluster(
        &mut self,
        root: ObjectIndex,
        members: &[ObjectIndex],
    ) -> GcResult<ClusterIndex> {
        for &object in std::iter::once(&root).chain(members) {
            self.mutable_item(object)?;
        }
        self.clusters
            .create_cluster(&mut self.objects, &self.types, root, members)
    }

    // ---------------------------------------------------------------------
    // Collection
    // ---------------------------------------------------------------------

    /// Whether reachability analysis is running
    pub fn is_collecting(&self) -> bool {
        self.gate.is_collecting()
    }

    /// Whether the last collection's purge is still in progress
    pub fn is_purge_pending(&self) -> bool {
        self.purger.is_pending()
    }

    /// Current purge phase
    pub fn purge_phase(&self) -> PurgePhase {
        self.purger.phase()
    }

    /// Collect garbage, waiting for every outstanding [`GcScopeGuard`](crate::GcScopeGuard).
    ///
    /// Objects whose instance flags intersect `keep_flags` are kept alive
    /// in addition to the root set. With `full_purge` the unreachable set
    /// is finalized and freed before returning; otherwise it is left to
    /// [`Self::tick_incremental_purge`].
    pub fn run_collection(&mut self, keep_flags: ObjectFlags, full_purge: bool) {
        let gate = Arc::clone(&self.gate);
        let _exclusive = gate.lock_exclusive();
        self.collect_locked(keep_flags, full_purge);
    }

    /// Collect garbage unless another thread holds a scope guard.
    ///
    /// Returns false when the attempt was skipped. Once more than
    /// `retries_before_forcing` consecutive attempts were skipped (and the
    /// setting is non-zero) the collection blocks instead.
    pub fn try_run_collection(&mut self, keep_flags: ObjectFlags, full_purge: bool) -> bool {
        let gate = Arc::clone(&self.gate);
        let exclusive = match gate.try_lock_exclusive() {
            Some(guard) => guard,
            None => {
                self.consecutive_skips += 1;
                self.stats.skipped_attempts += 1;
                let limit = self.config.retries_before_forcing;
                if limit == 0 || self.consecutive_skips <= limit {
                    tracing::debug!(
                        target: "sable::gc",
                        attempts = self.consecutive_skips,
                        "Skipping collection, gate is held"
                    );
                    return false;
                }
                tracing::warn!(
                    target: "sable::gc",
                    attempts = self.consecutive_skips,
                    "Forcing garbage collection after {} skipped attempts",
                    self.consecutive_skips
                );
                self.stats.forced_collections += 1;
                gate.lock_exclusive()
            }
        };
        self.consecutive_skips = 0;
        self.collect_locked(keep_flags, full_purge);
        drop(exclusive);
        true
    }

    fn collect_locked(&mut self, keep_flags: ObjectFlags, full_purge: bool) {
        let start = Instant::now();
        if self.purger.is_pending() {
            tracing::debug!(
                target: "sable::gc",
                phase = ?self.purger.phase(),
                "Finishing previous purge before collecting"
            );
            self.tick_purge(None);
        }

        self.gate.set_collecting(true);
        self.emit(&GcEvent::PreCollect);

        if self.config.verify_assumptions
            && self.objects.permanent_count() > 0
            && let Err(error) = verify_disregard_for_gc_assumptions(&self.objects, &self.types)
        {
            fatal(error);
        }

        let objects_before = self.objects.live_count_minus_permanent();
        let reachability = ReachabilityEngine::new(
            &mut self.objects,
            &mut self.clusters,
            &self.types,
            &self.config,
            self.pool.as_ref(),
        )
        .run(keep_flags);

        self.emit(&GcEvent::PostReachabilityAnalysis {
            unreachable: &reachability.unreachable,
        });

        let unreachable = reachability.unreachable.len();
        self.purger.start(reachability.unreachable, objects_before);
        self.gate.set_purge_phase(self.purger.phase());
        self.gate.set_collecting(false);
        self.gate.record_collection();

        if full_purge {
            self.tick_purge(None);
        }

        let pause = start.elapsed();
        self.stats.collections += 1;
        self.stats.total_pause_time += pause;
        self.stats.last_pause_time = pause;

        let report = CollectionReport {
            collection: self.stats.collections,
            objects_considered: reachability.objects_considered,
            seeded: reachability.seeded,
            unreachable,
            dissolved_clusters: reachability.dissolved_clusters,
            destroyed_clusters: reachability.destroyed_clusters,
            traversal: reachability.traversal,
            mark_time: reachability.mark_time,
            traverse_time: reachability.traverse_time,
            dissolve_time: reachability.dissolve_time,
            pause_time: pause,
            full_purge,
        };

        tracing::info!(
            target: "sable::gc",
            collection = report.collection,
            unreachable = report.unreachable,
            live_objects = self.objects.live_count(),
            clusters = self.clusters.len(),
            pause_us = pause.as_micros() as u64,
            full_purge,
            "GC cycle complete"
        );

        self.emit(&GcEvent::PostCollect(&report));
        self.last_collection = Some(report);
    }

    /// Advance the pending purge.
    ///
    /// With `use_time_limit` the slice stops after roughly
    /// `time_limit_seconds`; otherwise the purge runs to completion.
    /// Returns whether no purge is pending afterwards.
    pub fn tick_incremental_purge(
        &mut self,
        use_time_limit: bool,
        time_limit_seconds: f64,
    ) -> bool {
        if !self.purger.is_pending() {
            return true;
        }
        let limit = use_time_limit
            .then(|| Duration::try_from_secs_f64(time_limit_seconds).unwrap_or(Duration::ZERO));
        self.tick_purge(limit)
    }

    fn tick_purge(&mut self, limit: Option<Duration>) -> bool {
        let done = self.purger.tick(&mut self.objects, &self.types, limit);
        self.gate.set_purge_phase(self.purger.phase());
        if done && let Some(summary) = self.purger.last_summary() {
            self.stats.objects_purged += summary.purged as u64;
        }
        done
    }

    /// Check the permanent-pool invariants now
    pub fn verify_assumptions(&self) -> GcResult<()> {
        verify_disregard_for_gc_assumptions(&self.objects, &self.types)
    }

    /// Cumulative statistics
    pub fn stats(&self) -> GcStats {
        self.stats
    }

    /// Report of the most recent collection
    pub fn last_collection(&self) -> Option<&CollectionReport> {
        self.last_collection.as_ref()
    }

    /// Register a lifecycle callback
    pub fn on_gc_event(&mut self, callback: impl FnMut(&GcEvent<'_>) + Send + 'static) {
        self.callbacks.push(Box::new(callback));
    }

    fn emit(&mut self, event: &GcEvent<'_>) {
        for callback in &mut self.callbacks {
            callback(event);
        }
    }

    /// Tear the collector down: every object, the permanent pool included,
    /// is finalized and freed.
    pub fn shutdown(mut self) {
        let gate = Arc::clone(&self.gate);
        let _exclusive = gate.lock_exclusive();
        if self.purger.is_pending() {
            self.tick_purge(None);
        }

        let clusters: Vec<ClusterIndex> = self.clusters.iter().map(|(index, _)| index).collect();
        for index in clusters {
            self.clusters.dissolve_cluster(&mut self.objects, index);
        }
        self.objects.disable_disregard_for_gc();

        let everything: Vec<ObjectIndex> =
            self.objects.iter(false).map(|(index, _)| index).collect();
        for &index in &everything {
            self.objects.item_for_gc(index).set_flags(InternalFlags::UNREACHABLE);
            if let Some(instance) = self.objects.instance_mut(index) {
                instance.conditional_begin_destroy();
            }
        }
        let live = self.objects.live_count();
        self.purger.start(everything, live);
        self.tick_purge(None);
        tracing::info!(
            target: "sable::gc",
            collections = self.stats.collections,
            purged = self.stats.objects_purged,
            "Collector shut down"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::Field;
    use crate::types::{Property, PropertyKind};
    use parking_lot::Mutex;

    fn context() -> (CollectorContext, TypeId) {
        let mut ctx = CollectorContext::new(GcConfig {
            allow_parallel: false,
            ..GcConfig::default()
        })
        .unwrap();
        let ty = ctx
            .register_type(TypeInfo::new("Node").property(Property::new(
                "Next",
                0,
                PropertyKind::Object,
            )))
            .unwrap();
        (ctx, ty)
    }

    fn node(ctx: &mut CollectorContext, ty: TypeId, next: Option<ObjectIndex>) -> ObjectIndex {
        ctx.allocate(ObjectSpec::new(ty, "node").fields(vec![Field::reference(next)]))
            .unwrap()
    }

    #[test]
    fn test_allocate_assembles_token_stream_lazily() {
        let (mut ctx, ty) = context();
        assert!(!ctx.types().get(ty).unwrap().is_assembled());
        node(&mut ctx, ty, None);
        assert!(ctx.types().get(ty).unwrap().is_assembled());
        assert!(matches!(
            ctx.allocate(ObjectSpec::new(TypeId(42), "ghost")),
            Err(GcError::UnknownType(TypeId(42)))
        ));
    }

    #[test]
    fn test_purge_pending_objects_are_frozen() {
        let (mut ctx, ty) = context();
        let lost = node(&mut ctx, ty, None);
        ctx.run_collection(ObjectFlags::NO_FLAGS, false);

        assert!(ctx.is_purge_pending());
        assert!(ctx.is_unreachable(lost));
        assert!(matches!(ctx.add_to_root(lost), Err(GcError::PurgeInProgress(_))));
        assert!(matches!(ctx.mark_pending_kill(lost), Err(GcError::PurgeInProgress(_))));

        assert!(ctx.tick_incremental_purge(false, 0.0));
        assert!(!ctx.is_purge_pending());
        assert!(matches!(ctx.add_to_root(lost), Err(GcError::InvalidObject(_))));
    }

    #[test]
    fn test_collection_finishes_previous_purge_first() {
        let (mut ctx, ty) = context();
        node(&mut ctx, ty, None);
        ctx.run_collection(ObjectFlags::NO_FLAGS, false);
        assert!(ctx.is_purge_pending());

        ctx.run_collection(ObjectFlags::NO_FLAGS, false);
        assert_eq!(ctx.stats().objects_purged, 1);
        assert_eq!(ctx.objects().live_count(), 0);
    }

    #[test]
    fn test_set_internal_flags_only_touches_keep_bits() {
        let (mut ctx, ty) = context();
        let obj = node(&mut ctx, ty, None);
        ctx.set_internal_flags(obj, InternalFlags::ASYNC | InternalFlags::ROOT_SET, true)
            .unwrap();
        let flags = ctx.objects().item(obj).unwrap().flags();
        assert!(flags.contains(InternalFlags::ASYNC));
        assert!(!flags.contains(InternalFlags::ROOT_SET));

        ctx.run_collection(ObjectFlags::NO_FLAGS, true);
        assert!(ctx.object(obj).is_some());
        ctx.set_internal_flags(obj, InternalFlags::ASYNC, false).unwrap();
        ctx.run_collection(ObjectFlags::NO_FLAGS, true);
        assert!(ctx.object(obj).is_none());
    }

    #[test]
    fn test_events_fire_in_order() {
        let (mut ctx, ty) = context();
        node(&mut ctx, ty, None);
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        ctx.on_gc_event(move |event| {
            let entry = match event {
                GcEvent::PreCollect => "pre".to_owned(),
                GcEvent::PostReachabilityAnalysis { unreachable } => {
                    format!("reach:{}", unreachable.len())
                }
                GcEvent::PostCollect(report) => format!("post:{}", report.collection),
            };
            sink.lock().push(entry);
        });
        ctx.run_collection(ObjectFlags::NO_FLAGS, true);
        assert_eq!(*log.lock(), vec!["pre", "reach:1", "post:1"]);
    }

    #[test]
    fn test_shutdown_finalizes_permanent_pool() {
        use crate::object::NativeObject;
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Counted(Arc<AtomicUsize>);
        impl NativeObject for Counted {
            fn finish_destroy(&mut self) {
                self.0.fetch_add(1, Ordering::AcqRel);
            }
        }

        let (mut ctx, ty) = context();
        let finished = Arc::new(AtomicUsize::new(0));
        assert!(ctx.open_disregard_for_gc());
        ctx.allocate(
            ObjectSpec::new(ty, "permanent")
                .fields(vec![Field::reference(None)])
                .native(Counted(Arc::clone(&finished))),
        )
        .unwrap();
        ctx.close_disregard_for_gc();
        let kept = ctx
            .allocate(
                ObjectSpec::new(ty, "kept")
                    .fields(vec![Field::reference(None)])
                    .native(Counted(Arc::clone(&finished))),
            )
            .unwrap();
        ctx.add_to_root(kept).unwrap();

        ctx.run_collection(ObjectFlags::NO_FLAGS, true);
        assert_eq!(finished.load(Ordering::Acquire), 0);
        ctx.shutdown();
        assert_eq!(finished.load(Ordering::Acquire), 2);
    }
}
