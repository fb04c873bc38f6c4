//! Run configuration.  The engine takes an explicit Config; flag parsing
//! and any defaulting beyond Default::default() live in the driver.

use crate::graph::Trigger;
use crate::hash::{Hashers, LongAlgo, ShortAlgo};
use crate::task::{CachingSite, ExternalJobs, LocalPool, ProcessPool, Registry};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheduler {
    /// Layer-by-layer with a barrier between layers.
    Staged,
    /// Work-stealing from a ready queue; no barriers.
    Dynamic,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Default dispatch backend name ("local", "processes", "jobs", or a
    /// registered custom backend).
    pub parallelism: String,
    /// Upper bound on concurrently building targets.
    pub max_parallel: usize,
    /// Trigger for targets that don't specify one.
    pub trigger_default: Trigger,
    pub cache_dir: PathBuf,
    /// Continue past target failures instead of aborting the run.
    pub keep_going: bool,
    /// Caching-site override; None defers to the backend's default.
    pub caching: Option<CachingSite>,
    /// Base seed mixed into every target's evaluation seed.
    pub root_seed: u64,
    pub short_hash: ShortAlgo,
    pub long_hash: LongAlgo,
    /// Unknown identifiers in commands become fatal instead of warnings.
    pub strict: bool,
    /// Keep a meta record (without value hash) for failed targets.
    pub record_failed_meta: bool,
    /// Per-target time budget.
    pub timeout: Option<Duration>,
    pub verbose: bool,
    pub scheduler: Scheduler,
    /// Hash file contents for fingerprints; mtime-only when false.
    pub hash_file_contents: bool,
    /// External-jobs backend: submit command and optional script template.
    pub job_submit: String,
    pub job_template: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            parallelism: "local".to_owned(),
            max_parallel: 1,
            trigger_default: Trigger::Any,
            cache_dir: PathBuf::from(".lathe"),
            keep_going: false,
            caching: None,
            root_seed: 0,
            short_hash: ShortAlgo::Fnv,
            long_hash: LongAlgo::Sha256,
            strict: false,
            record_failed_meta: false,
            timeout: None,
            verbose: false,
            scheduler: Scheduler::Dynamic,
            hash_file_contents: true,
            job_submit: "/bin/sh".to_owned(),
            job_template: None,
        }
    }
}

impl Config {
    pub fn hashers(&self) -> Hashers {
        Hashers {
            short: self.short_hash,
            long: self.long_hash,
        }
    }

    /// The stock backends, each capped at max_parallel.
    pub fn default_registry(&self) -> anyhow::Result<Registry> {
        let mut registry = Registry::new();
        registry.register(
            "local",
            Box::new(LocalPool {
                parallelism: self.max_parallel,
            }),
        );
        registry.register(
            "processes",
            Box::new(ProcessPool::new(self.max_parallel)?),
        );
        registry.register(
            "jobs",
            Box::new(ExternalJobs::new(
                self.max_parallel,
                self.job_submit.clone(),
                self.job_template.clone(),
            )?),
        );
        Ok(registry)
    }
}
