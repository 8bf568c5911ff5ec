//! Collector error types

use crate::object::ObjectIndex;
use crate::types::TypeId;
use thiserror::Error;

/// Result alias used throughout the collector
pub type GcResult<T> = Result<T, GcError>;

/// Collector errors
#[derive(Debug, Error)]
pub enum GcError {
    /// Type id was never registered
    #[error("unknown type id {0:?}")]
    UnknownType(TypeId),

    /// A type with this name is already registered
    #[error("type {0} is already registered")]
    DuplicateType(String),

    /// Handle does not refer to a live object slot
    #[error("invalid object handle {0}")]
    InvalidObject(ObjectIndex),

    /// Operation would change reachability state of an object awaiting purge
    #[error("object {0} is awaiting purge; its reachability state is frozen")]
    PurgeInProgress(ObjectIndex),

    /// Cluster creation refused an object
    #[error("cannot cluster object {object}: {reason}")]
    ClusterRejected {
        /// Offending object
        object: ObjectIndex,
        /// Why it was refused
        reason: &'static str,
    },

    /// A traced reference does not point at a live slot
    #[error(
        "invalid object reference in GC: target #{target}, referencing object: {referencing}, {field}, token index: {token_index}"
    )]
    InvalidReference {
        /// Raw target index found in the slot
        target: u32,
        /// Type and path of the referencing object
        referencing: String,
        /// Field name and offset, "native reference" or the cluster edge source
        field: String,
        /// Position in the type's token stream, -1 for native references
        token_index: i64,
    },

    /// Token stream and instance layout disagree
    #[error("token stream of {type_name} expects {expected} at field {offset}, found {found}")]
    LayoutMismatch {
        /// Type whose stream was walked
        type_name: String,
        /// Field offset
        offset: usize,
        /// Expected field kind
        expected: &'static str,
        /// Field kind actually present, "nothing" past the end
        found: &'static str,
    },

    /// Permanent-pool objects reference collectable objects
    #[error("{0} object(s) break the disregard-for-GC assumptions")]
    AssumptionViolation(usize),

    /// Dedicated worker pool could not be built
    #[error("failed to build GC worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Log a fatal collector condition and halt.
///
/// Heap corruption cannot be recovered from mid-traversal; the error is logged
/// with full context and the current thread panics (propagating out of worker
/// tasks to the orchestrating thread).
#[cold]
#[track_caller]
pub(crate) fn fatal(error: GcError) -> ! {
    tracing::error!(target: "sable::gc", error = %error, "fatal garbage collector error");
    panic!("{error}");
}
