//! Incremental purge
//!
//! Finalizes and frees the unreachable set of the last reachability pass in
//! time-bounded slices. The purger keeps its own cursors, so any number of
//! ticks may pass between slices and a tick may stop mid-phase.

use std::thread;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

use crate::flags::ObjectFlags;
use crate::object::ObjectIndex;
use crate::object_table::ObjectTable;
use crate::types::{TypeId, TypeRegistry};

/// Purge progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PurgePhase {
    /// Nothing left to purge
    #[default]
    Idle,
    /// Routing `finish_destroy` to objects that are ready
    DispatchFinalize,
    /// Waiting for asynchronous teardown to report ready
    AwaitFinalize,
    /// Freeing object slots
    Delete,
}

/// Counters of a finished purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeSummary {
    /// Objects freed
    pub purged: usize,
    /// Live objects (permanent pool excluded) when the purge started
    pub objects_before: usize,
    /// Live objects (permanent pool excluded) when the purge finished
    pub objects_after: usize,
}

/// Resumable finalize/free state machine.
#[derive(Debug)]
pub struct IncrementalPurger {
    phase: PurgePhase,
    unreachable: Vec<ObjectIndex>,
    cursor: usize,
    pending: Vec<ObjectIndex>,
    objects_before: usize,
    purged: usize,
    purged_per_type: FxHashMap<TypeId, usize>,
    finalize_poll_granularity: usize,
    delete_poll_granularity: usize,
    detailed_stats: bool,
    last_summary: Option<PurgeSummary>,
}

impl IncrementalPurger {
    /// Idle purger. Granularities are clamped to at least 1.
    pub fn new(
        finalize_poll_granularity: usize,
        delete_poll_granularity: usize,
        detailed_stats: bool,
    ) -> Self {
        Self {
            phase: PurgePhase::Idle,
            unreachable: Vec::new(),
            cursor: 0,
            pending: Vec::new(),
            objects_before: 0,
            purged: 0,
            purged_per_type: FxHashMap::default(),
            finalize_poll_granularity: finalize_poll_granularity.max(1),
            delete_poll_granularity: delete_poll_granularity.max(1),
            detailed_stats,
            last_summary: None,
        }
    }

    /// Current phase
    pub fn phase(&self) -> PurgePhase {
        self.phase
    }

    /// Whether a purge is in progress
    pub fn is_pending(&self) -> bool {
        self.phase != PurgePhase::Idle
    }

    /// Objects still waiting for asynchronous teardown
    pub fn pending_finalization(&self) -> usize {
        self.pending.len()
    }

    /// Whether `object` belongs to the purge in progress. Every live
    /// unreachable object is in the set until its slot is freed.
    pub fn contains(&self, objects: &ObjectTable, object: ObjectIndex) -> bool {
        self.is_pending() && objects.item(object).is_some_and(|item| item.is_unreachable())
    }

    /// Summary of the last completed purge
    pub fn last_summary(&self) -> Option<PurgeSummary> {
        self.last_summary
    }

    /// Begin purging `unreachable`; `begin_destroy` must already be routed.
    pub fn start(&mut self, unreachable: Vec<ObjectIndex>, objects_before: usize) {
        debug_assert!(!self.is_pending(), "purge started while another is in progress");
        self.unreachable = unreachable;
        self.cursor = 0;
        self.pending.clear();
        self.objects_before = objects_before;
        self.purged = 0;
        self.purged_per_type.clear();
        self.phase = PurgePhase::DispatchFinalize;
    }

    /// Run one slice. With `time_limit` the slice stops once the limit is
    /// reached (checked every few objects); without it the purge runs to
    /// completion. Returns whether the purge is complete.
    pub fn tick(
        &mut self,
        objects: &mut ObjectTable,
        types: &TypeRegistry,
        time_limit: Option<Duration>,
    ) -> bool {
        let start = Instant::now();
        let out_of_time = |start: Instant| time_limit.is_some_and(|limit| start.elapsed() >= limit);

        if self.phase == PurgePhase::DispatchFinalize {
            let mut since_poll = 0;
            while self.cursor < self.unreachable.len() {
                let index = self.unreachable[self.cursor];
                self.cursor += 1;
                if let Some(instance) = objects.instance_mut(index)
                    && !instance.has_any_flags(ObjectFlags::FINISH_DESTROYED)
                {
                    if instance.is_ready_for_finish_destroy() {
                        instance.conditional_finish_destroy();
                    } else {
                        self.pending.push(index);
                    }
                }
                since_poll += 1;
                if since_poll == self.finalize_poll_granularity {
                    since_poll = 0;
                    if out_of_time(start) {
                        return false;
                    }
                }
            }
            self.phase = PurgePhase::AwaitFinalize;
        }

        if self.phase == PurgePhase::AwaitFinalize {
            while !self.pending.is_empty() {
                let mut at = 0;
                while at < self.pending.len() {
                    let index = self.pending[at];
                    let Some(instance) = objects.instance_mut(index) else {
                        self.pending.swap_remove(at);
                        continue;
                    };
                    if instance.is_ready_for_finish_destroy() {
                        instance.conditional_finish_destroy();
                        self.pending.swap_remove(at);
                    } else {
                        at += 1;
                    }
                }
                if self.pending.is_empty() {
                    break;
                }
                if time_limit.is_some() {
                    tracing::trace!(
                        target: "sable::gc",
                        pending = self.pending.len(),
                        "Waiting for asynchronous finalization"
                    );
                    return false;
                }
                thread::yield_now();
            }
            self.cursor = 0;
            self.phase = PurgePhase::Delete;
            if out_of_time(start) {
                return false;
            }
        }

        if self.phase == PurgePhase::Delete {
            let mut since_poll = 0;
            while self.cursor < self.unreachable.len() {
                let index = self.unreachable[self.cursor];
                self.cursor += 1;
                if let Some(instance) = objects.free(index) {
                    debug_assert!(instance.has_any_flags(ObjectFlags::FINISH_DESTROYED));
                    self.purged += 1;
                    if self.detailed_stats {
                        *self.purged_per_type.entry(instance.type_id()).or_default() += 1;
                    }
                }
                since_poll += 1;
                if since_poll == self.delete_poll_granularity {
                    since_poll = 0;
                    if out_of_time(start) {
                        return false;
                    }
                }
            }
            self.finish(objects, types);
        }
        true
    }

    fn finish(&mut self, objects: &ObjectTable, types: &TypeRegistry) {
        let summary = PurgeSummary {
            purged: self.purged,
            objects_before: self.objects_before,
            objects_after: objects.live_count_minus_permanent(),
        };
        tracing::info!(
            target: "sable::gc",
            purged = summary.purged,
            before = summary.objects_before,
            after = summary.objects_after,
            "GC purged {} objects ({} -> {})",
            summary.purged,
            summary.objects_before,
            summary.objects_after
        );
        if self.detailed_stats && !self.purged_per_type.is_empty() {
            let mut per_type: Vec<(TypeId, usize)> = self.purged_per_type.drain().collect();
            per_type.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
            for (type_id, count) in per_type.into_iter().take(10) {
                tracing::info!(
                    target: "sable::gc",
                    type_name = types.type_name(type_id),
                    count,
                    "Purged objects by type"
                );
            }
        }

        self.last_summary = Some(summary);
        self.unreachable.clear();
        self.cursor = 0;
        self.phase = PurgePhase::Idle;
    }
}
