//! Parallel graph collector
//!
//! Drains the frontier of newly reachable objects to a fixed point. Large
//! frontiers are split into chunks processed by rayon tasks, each writing
//! to a private output buffer; the buffers are merged into the next round's
//! frontier once every task of the round has joined.

use rayon::ThreadPool;
use rayon::prelude::*;

use crate::object::ObjectIndex;
use crate::processor::ReferenceProcessor;

/// Traversal counters of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraversalStats {
    /// Objects whose references were visited
    pub objects_processed: usize,
    /// Parallel rounds run
    pub parallel_rounds: usize,
    /// Largest frontier seen
    pub peak_frontier: usize,
}

/// Drains frontiers through a [`ReferenceProcessor`].
pub struct GraphCollector<'p, 'a> {
    processor: &'p ReferenceProcessor<'a>,
    min_objects_per_task: usize,
    pool: Option<&'p ThreadPool>,
}

impl<'p, 'a> GraphCollector<'p, 'a> {
    /// Collector over `processor`. Parallel rounds only run when the
    /// processor uses the parallel strategy.
    pub fn new(
        processor: &'p ReferenceProcessor<'a>,
        min_objects_per_task: usize,
        pool: Option<&'p ThreadPool>,
    ) -> Self {
        Self {
            processor,
            min_objects_per_task: min_objects_per_task.max(1),
            pool,
        }
    }

    /// Process `frontier` and everything reachable from it.
    pub fn collect(&self, frontier: Vec<ObjectIndex>) -> TraversalStats {
        match self.pool {
            Some(pool) => pool.install(|| self.drain(frontier)),
            None => self.drain(frontier),
        }
    }

    fn drain(&self, mut frontier: Vec<ObjectIndex>) -> TraversalStats {
        let mut stats = TraversalStats::default();
        while !frontier.is_empty() {
            stats.peak_frontier = stats.peak_frontier.max(frontier.len());
            if !self.processor.is_parallel() || frontier.len() < self.min_objects_per_task {
                stats.objects_processed += self.drain_sequential(frontier);
                break;
            }
            stats.objects_processed += frontier.len();
            stats.parallel_rounds += 1;
            frontier = self.parallel_round(&frontier);
        }
        stats
    }

    fn parallel_round(&self, frontier: &[ObjectIndex]) -> Vec<ObjectIndex> {
        let workers = rayon::current_num_threads().max(1);
        let chunk = frontier.len().div_ceil(workers).max(self.min_objects_per_task);
        let outputs: Vec<Vec<ObjectIndex>> = frontier
            .par_chunks(chunk)
            .map(|objects| {
                let mut out = Vec::new();
                for &object in objects {
                    self.processor.process_object(object, &mut out);
                }
                out
            })
            .collect();
        outputs.concat()
    }

    /// Depth-first drain on the calling thread. Returns the number of
    /// objects processed.
    fn drain_sequential(&self, mut stack: Vec<ObjectIndex>) -> usize {
        let mut processed = 0;
        let mut out = Vec::new();
        while let Some(object) = stack.pop() {
            self.processor.process_object(object, &mut out);
            processed += 1;
            stack.append(&mut out);
        }
        processed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::ClusterTable;
    use crate::flags::InternalFlags;
    use crate::object::{Field, ObjectInstance, ObjectSpec};
    use crate::object_table::ObjectTable;
    use crate::processor::{MarkStrategy, ParallelStrategy, SequentialStrategy};
    use crate::types::{Property, PropertyKind, TypeInfo, TypeRegistry};

    /// Chain 0 -> 1 -> ... -> n-1 plus a fan-out from 0 to every node.
    fn chain_with_fanout(n: u32) -> (ObjectTable, TypeRegistry) {
        let mut types = TypeRegistry::new();
        let ty = types
            .register(TypeInfo::new("Node").property(Property::new(
                "Links",
                0,
                PropertyKind::Array(Box::new(PropertyKind::Object)),
            )))
            .unwrap();
        types.assemble_token_stream(ty, false).unwrap();

        let mut objects = ObjectTable::new();
        for i in 0..n {
            let mut links = vec![Some(ObjectIndex((i + 1) % n))];
            if i == 0 {
                links.extend((1..n).map(|j| Some(ObjectIndex(j))));
            }
            objects.allocate(ObjectInstance::from_spec(
                ObjectSpec::new(ty, format!("n{i}")).fields(vec![Field::references(links)]),
            ));
        }
        (objects, types)
    }

    fn run(strategy: &dyn MarkStrategy, min_per_task: usize) -> (TraversalStats, ObjectTable) {
        let (objects, types) = chain_with_fanout(1000);
        let clusters = ClusterTable::new();
        for (_, item) in objects.iter(false) {
            item.set_flags(InternalFlags::UNREACHABLE);
        }
        objects.item(ObjectIndex(0)).unwrap().clear_flags(InternalFlags::UNREACHABLE);

        let processor = ReferenceProcessor::new(&objects, &clusters, &types, strategy, true);
        let stats =
            GraphCollector::new(&processor, min_per_task, None).collect(vec![ObjectIndex(0)]);
        (stats, objects)
    }

    #[test]
    fn test_sequential_drain_reaches_everything() {
        let (stats, objects) = run(&SequentialStrategy, 128);
        assert_eq!(stats.objects_processed, 1000);
        assert_eq!(stats.parallel_rounds, 0);
        assert!(objects.iter(false).all(|(_, item)| !item.is_unreachable()));
    }

    #[test]
    fn test_parallel_rounds_visit_each_object_once() {
        let (stats, objects) = run(&ParallelStrategy, 1);
        assert_eq!(stats.objects_processed, 1000);
        assert_eq!(stats.parallel_rounds, 2);
        assert!(objects.iter(false).all(|(_, item)| !item.is_unreachable()));
    }
}
