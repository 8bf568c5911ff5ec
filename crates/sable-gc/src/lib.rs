//! # Sable Garbage Collector
//!
//! Tracing, non-moving, stop-the-world collector for a reflective object
//! system with incremental purging.
//!
//! ## Design
//!
//! - **Object table**: flat slot array; handles are indices, per-slot flags are atomic
//! - **Token streams**: per-type reference layouts interpreted by the tracer
//! - **Clusters**: groups of objects that live and die together, marked as one unit
//! - **Reachability**: mark unreachable, then a parallel frontier traversal clears it
//! - **Purge**: finalize and free the unreachable set in time-bounded slices
//!
//! Everything hangs off a [`CollectorContext`]; there is no global collector.

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cluster;
pub mod config;
pub mod context;
pub mod error;
pub mod flags;
pub mod gate;
pub mod graph;
pub mod object;
pub mod object_table;
pub mod processor;
pub mod purge;
pub mod reachability;
pub mod token_stream;
pub mod types;

pub use cluster::{Cluster, ClusterIndex, ClusterTable, DissolvedCluster};
pub use config::GcConfig;
pub use context::{CollectionReport, CollectorContext, GcCallback, GcEvent, GcStats};
pub use error::{GcError, GcResult};
pub use flags::{InternalFlags, ObjectFlags};
pub use gate::{GcGate, GcScopeGuard};
pub use graph::{GraphCollector, TraversalStats};
pub use object::{Field, NativeObject, ObjectIndex, ObjectInstance, ObjectSpec, RefSlot};
pub use object_table::{ClusterMembership, ObjectItem, ObjectTable};
pub use processor::{
    MarkStrategy, ParallelStrategy, ReferenceCollector, ReferenceProcessor, ReferenceSite,
    SequentialStrategy,
};
pub use purge::{IncrementalPurger, PurgePhase, PurgeSummary};
pub use reachability::{
    ReachabilityEngine, ReachabilityPhase, ReachabilityReport, verify_disregard_for_gc_assumptions,
};
pub use token_stream::{
    ContainerReferencer, DebugTokenInfo, DebugTokenMap, NativeReferencer, Token, TokenStream,
    TokenStreamBuilder, TokenVisitor, walk_references,
};
pub use types::{
    Property, PropertyKind, TypeId, TypeInfo, TypeRegistry, container_referencer,
    emit_reference_info, native_object_referencer,
};
