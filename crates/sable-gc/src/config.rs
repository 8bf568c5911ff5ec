//! Collector configuration

use std::env;
use std::str::FromStr;

/// GC configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcConfig {
    /// Traverse the object graph on multiple threads (default: true)
    pub allow_parallel: bool,
    /// Smallest frontier slice handed to one worker task (default: 128)
    pub min_objects_per_task: usize,
    /// Dedicated worker pool size; `None` uses rayon's global pool
    pub worker_threads: Option<usize>,
    /// Failed `try_run_collection` attempts before a blocking collection is
    /// forced; 0 never forces (default: 0)
    pub retries_before_forcing: u32,
    /// Check that permanent-pool objects only reference rooted, permanent or
    /// clustered objects (default: debug builds)
    pub verify_assumptions: bool,
    /// Validate every traced reference before following it (default: true)
    pub object_checks: bool,
    /// Log per-type purge counts (default: false)
    pub detailed_stats: bool,
    /// Finalizations between time-limit polls (default: 10)
    pub finalize_poll_granularity: usize,
    /// Deletions between time-limit polls (default: 100)
    pub delete_poll_granularity: usize,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            allow_parallel: true,
            min_objects_per_task: 128,
            worker_threads: None,
            retries_before_forcing: 0,
            verify_assumptions: cfg!(debug_assertions),
            object_checks: true,
            detailed_stats: false,
            finalize_poll_granularity: 10,
            delete_poll_granularity: 100,
        }
    }
}

impl GcConfig {
    /// Defaults overlaid with `SABLE_GC_*` environment variables.
    ///
    /// Unset or unparsable variables keep the default.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        let flag = |key: &str, default: bool| -> bool {
            match lookup(key).as_deref().map(str::trim) {
                Some("1") | Some("true") | Some("on") => true,
                Some("0") | Some("false") | Some("off") => false,
                _ => default,
            }
        };
        config.allow_parallel = flag("SABLE_GC_ALLOW_PARALLEL", config.allow_parallel);
        config.verify_assumptions = flag("SABLE_GC_VERIFY_ASSUMPTIONS", config.verify_assumptions);
        config.object_checks = flag("SABLE_GC_OBJECT_CHECKS", config.object_checks);
        config.detailed_stats = flag("SABLE_GC_DETAILED_STATS", config.detailed_stats);

        if let Some(v) = parse(&lookup, "SABLE_GC_MIN_OBJECTS_PER_TASK") {
            config.min_objects_per_task = v;
        }
        if let Some(v) = parse::<usize>(&lookup, "SABLE_GC_WORKER_THREADS") {
            config.worker_threads = (v > 0).then_some(v);
        }
        if let Some(v) = parse(&lookup, "SABLE_GC_RETRIES_BEFORE_FORCING") {
            config.retries_before_forcing = v;
        }
        config
    }
}

fn parse<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(
                target: "sable::gc",
                key,
                value = %raw,
                "Ignoring unparsable GC setting"
            );
            None
        }
    }
}
