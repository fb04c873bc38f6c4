//! Build runner: walks the graph in dependency order, skips targets whose
//! cached results are still valid, and dispatches the rest to a backend
//! under the configured parallelism bound.
//!
//! The master (this module) is single threaded and owns the graph, the
//! ready queue and all scheduler state; workers only ever talk back over
//! the completion channel.  For any edge a -> b, a's meta record is
//! committed before b is dispatched.

use crate::analyze::DepSet;
use crate::config::{Config, Scheduler};
use crate::densemap::DenseMap;
use crate::env::Environment;
use crate::error::{EngineError, EngineResult};
use crate::graph::{self, Graph, NodeId, PlanGraph};
use crate::hash::Hashers;
use crate::parse::Plan;
use crate::progress::{Progress, TaskStatus};
use crate::signal::{self, Interrupt};
use crate::stale::Oracle;
use crate::store::{Meta, ProgressState, Store};
use crate::subdoc::FencedCodeExtractor;
use crate::task::{FinishedTask, Outcome, Registry, Runner, WorkItem};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Scheduler states.  Every target moves Pending -> Ready -> Building ->
/// {Built, Failed}; targets downstream of a failure jump straight to
/// Skipped.  Non-target nodes only ever go Pending -> Built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildState {
    Pending,
    Ready,
    Building,
    Built,
    Failed,
    Skipped,
}

const STATE_COUNT: usize = 6;

fn state_slot(state: BuildState) -> usize {
    match state {
        BuildState::Pending => 0,
        BuildState::Ready => 1,
        BuildState::Building => 2,
        BuildState::Built => 3,
        BuildState::Failed => 4,
        BuildState::Skipped => 5,
    }
}

/// Counts of targets per state, for progress display.
#[derive(Debug, Clone, Default)]
pub struct StateCounts {
    counts: [usize; STATE_COUNT],
}

impl StateCounts {
    pub fn get(&self, state: BuildState) -> usize {
        self.counts[state_slot(state)]
    }

    pub fn add(&mut self, state: BuildState, n: usize) {
        self.counts[state_slot(state)] += n;
    }

    pub fn shift(&mut self, from: BuildState, to: BuildState) {
        self.counts[state_slot(from)] -= 1;
        self.counts[state_slot(to)] += 1;
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }
}

/// What a run did, as reported to the caller.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    /// Targets evaluated this run.
    pub built: usize,
    /// Targets satisfied without evaluation: up to date, or skipped
    /// because a dependency failed.
    pub skipped: usize,
    /// Targets that failed (including timeouts).
    pub failed: usize,
}

pub struct Work<'a> {
    graph: &'a Graph,
    depsets: &'a HashMap<NodeId, DepSet>,
    env: &'a Environment,
    store: &'a Store,
    hashers: Hashers,
    config: &'a Config,
    progress: &'a mut dyn Progress,
    runner: Runner<'a>,
    states: DenseMap<NodeId, BuildState>,
    counts: StateCounts,
    pending: DenseMap<NodeId, usize>,
    wanted: HashSet<NodeId>,
    ready: VecDeque<NodeId>,
    /// Targets whose backend failed once already; the second failure is
    /// escalated as an eval error.
    retried: HashSet<NodeId>,
    deadlines: HashMap<NodeId, Instant>,
    /// Timed-out targets whose eventual completion must be ignored.
    abandoned: HashSet<NodeId>,
    summary: Summary,
}

impl<'a> Work<'a> {
    pub fn new(
        pg: &'a PlanGraph,
        env: &'a Environment,
        store: &'a Store,
        config: &'a Config,
        registry: &'a Registry,
        progress: &'a mut dyn Progress,
    ) -> Work<'a> {
        let graph = &pg.graph;
        Work {
            graph,
            depsets: &pg.depsets,
            env,
            store,
            hashers: config.hashers(),
            config,
            progress,
            runner: Runner::new(registry, &config.parallelism, config.max_parallel),
            states: DenseMap::new_sized(graph.len(), BuildState::Pending),
            counts: StateCounts::default(),
            pending: DenseMap::new_sized(graph.len(), 0),
            wanted: HashSet::new(),
            ready: VecDeque::new(),
            retried: HashSet::new(),
            deadlines: HashMap::new(),
            abandoned: HashSet::new(),
            summary: Summary::default(),
        }
    }

    fn oracle(&self) -> Oracle<'_> {
        Oracle {
            graph: self.graph,
            depsets: self.depsets,
            env: self.env,
            store: self.store,
            hashers: &self.hashers,
            hash_file_contents: self.config.hash_file_contents,
        }
    }

    /// Restrict the run to the named targets and their transitive
    /// dependencies; an empty list means everything.
    pub fn want(&mut self, targets: &[String]) -> EngineResult<()> {
        if targets.is_empty() {
            self.wanted = self.graph.ids().collect();
            return Ok(());
        }
        let mut stack = Vec::new();
        for name in targets {
            let id = self.graph.lookup(name).ok_or_else(|| {
                EngineError::Parse(format!("unknown target {:?}", name))
            })?;
            stack.push(id);
        }
        while let Some(id) = stack.pop() {
            if !self.wanted.insert(id) {
                continue;
            }
            stack.extend(self.graph.node(id).deps.iter().copied());
        }
        Ok(())
    }

    /// The outdated-node prediction for this run, for inspection (the
    /// staged scheduler's work list, and max_useful_parallelism).
    pub fn outdated(&self) -> EngineResult<HashSet<NodeId>> {
        self.oracle().outdated_set()
    }

    pub fn run(&mut self) -> EngineResult<Summary> {
        if self.wanted.is_empty() {
            self.want(&[])?;
        }
        self.store.clear_progress()?;
        for &id in &self.wanted {
            *self.pending.get_mut(id) = self
                .graph
                .node(id)
                .deps
                .iter()
                .filter(|dep| self.wanted.contains(dep))
                .count();
        }
        let mut roots: Vec<NodeId> = self
            .wanted
            .iter()
            .copied()
            .filter(|&id| *self.pending.get(id) == 0)
            .collect();
        roots.sort();
        self.ready.extend(roots);
        let target_count = self
            .wanted
            .iter()
            .filter(|&&id| self.graph.node(id).is_target())
            .count();
        self.counts.add(BuildState::Pending, target_count);
        self.progress.update(&self.counts);

        let result = match self.config.scheduler {
            Scheduler::Dynamic => self.run_dynamic(),
            Scheduler::Staged => self.run_staged(),
        };
        match result {
            Ok(()) => Ok(self.summary),
            Err(err) => {
                // Let outstanding workers finish so the cache stays
                // consistent, but commit nothing further.
                self.drain();
                Err(err)
            }
        }
    }

    // Dynamic strategy: dispatch as soon as any worker is free.

    fn run_dynamic(&mut self) -> EngineResult<()> {
        loop {
            if signal::pending() == Interrupt::Drain {
                return Err(EngineError::Cancelled);
            }

            while let Some(id) = self.ready.pop_front() {
                if *self.states.get(id) != BuildState::Pending {
                    continue;
                }
                if !self.graph.node(id).is_target() {
                    self.finish_instant(id);
                    continue;
                }
                self.set_state(id, BuildState::Ready);
                if !self.oracle().is_outdated(id)? {
                    self.finish_cached(id)?;
                    continue;
                }
                self.store
                    .set_progress(&self.graph.node(id).name, ProgressState::Queued)?;
                if self.runner.can_start_more() {
                    self.dispatch(id)?;
                } else {
                    self.set_state(id, BuildState::Pending);
                    self.ready.push_front(id);
                    break;
                }
            }

            if self.runner.is_running() {
                if let Some(task) = self.wait_one()? {
                    self.record_finished(task)?;
                }
                continue;
            }
            if self.ready.is_empty() {
                return Ok(());
            }
        }
    }

    // Staged strategy: the topological layering restricted to predicted
    // outdated targets, with a barrier after each layer.

    fn run_staged(&mut self) -> EngineResult<()> {
        let outdated = self.oracle().outdated_set()?;
        let stages: Vec<Vec<NodeId>> = self
            .graph
            .parallel_stages(&outdated)
            .into_iter()
            .map(|stage| {
                stage
                    .into_iter()
                    .filter(|id| self.wanted.contains(id))
                    .collect::<Vec<_>>()
            })
            .filter(|stage: &Vec<NodeId>| !stage.is_empty())
            .collect();

        for stage in stages {
            if signal::pending() == Interrupt::Drain {
                return Err(EngineError::Cancelled);
            }
            for id in stage {
                if *self.states.get(id) != BuildState::Pending {
                    continue;
                }
                if !self.staged_deps_ok(id, &outdated) {
                    self.skip_target(id);
                    continue;
                }
                self.set_state(id, BuildState::Ready);
                if !self.oracle().is_outdated(id)? {
                    self.finish_cached(id)?;
                    continue;
                }
                self.store
                    .set_progress(&self.graph.node(id).name, ProgressState::Queued)?;
                while !self.runner.can_start_more() {
                    if let Some(task) = self.wait_one()? {
                        self.record_finished(task)?;
                    }
                }
                self.dispatch(id)?;
            }
            // Barrier: the whole layer completes before the next starts.
            while self.runner.is_running() {
                if let Some(task) = self.wait_one()? {
                    self.record_finished(task)?;
                }
            }
        }

        // Whatever never entered a stage was already up to date.
        let remaining: Vec<NodeId> = self
            .wanted
            .iter()
            .copied()
            .filter(|&id| {
                self.graph.node(id).is_target() && *self.states.get(id) == BuildState::Pending
            })
            .collect();
        for id in remaining {
            self.finish_fresh_quietly(id);
        }
        Ok(())
    }

    /// In the staged walk there are no per-node pending counts; a target
    /// may run if every dependency is either rebuilt successfully or was
    /// never outdated (recursing through file and import nodes).
    fn staged_deps_ok(&self, id: NodeId, outdated: &HashSet<NodeId>) -> bool {
        for &dep in &self.graph.node(id).deps {
            let ok = match *self.states.get(dep) {
                BuildState::Built => true,
                BuildState::Failed | BuildState::Skipped => false,
                _ => {
                    if self.graph.node(dep).is_target() {
                        !outdated.contains(&dep)
                    } else {
                        self.staged_deps_ok(dep, outdated)
                    }
                }
            };
            if !ok {
                return false;
            }
        }
        true
    }

    // Shared machinery.

    fn set_state(&mut self, id: NodeId, to: BuildState) {
        let node = self.graph.node(id);
        let from = *self.states.get(id);
        *self.states.get_mut(id) = to;
        if node.is_target() {
            self.counts.shift(from, to);
            self.progress.update(&self.counts);
        }
    }

    fn dispatch(&mut self, id: NodeId) -> EngineResult<()> {
        let item = self.make_item(id)?;
        let name = self.graph.node(id).name.clone();
        self.store.set_progress(&name, ProgressState::Building)?;
        self.set_state(id, BuildState::Building);
        self.progress.task_started(&name);
        if let Some(timeout) = self.config.timeout {
            self.deadlines.insert(id, Instant::now() + timeout);
        }
        let evaluator = self.graph.node(id).evaluator.clone();
        self.runner.start(id, evaluator.as_deref(), item)
    }

    fn make_item(&self, id: NodeId) -> EngineResult<WorkItem> {
        let node = self.graph.node(id);
        let mut scope = crate::eval::Scope::new(0);
        self.env.fill_scope(&mut scope);
        let mut vars = scope.vars;
        let funcs = scope.funcs;
        let oracle = self.oracle();
        for &dep in &node.deps {
            let dep_node = self.graph.node(dep);
            if !dep_node.is_target() {
                continue;
            }
            let value = oracle.load_value(dep)?.ok_or_else(|| EngineError::Cache {
                path: self.store.root().to_owned(),
                message: format!(
                    "value of dependency {:?} missing from object store",
                    dep_node.name
                ),
            })?;
            vars.insert(dep_node.name.clone(), value);
        }
        let caching = self
            .config
            .caching
            .unwrap_or_else(|| self.runner.caching_site(node.evaluator.as_deref()));
        Ok(WorkItem {
            name: node.name.clone(),
            command: node.command.clone().expect("target has a command"),
            vars,
            funcs,
            seed: self.hashers.seed_for(self.config.root_seed, &node.name),
            caching,
            cache_dir: self.config.cache_dir.clone(),
            short_hash: self.config.short_hash,
            long_hash: self.config.long_hash,
            extra: node
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        })
    }

    /// Wait for one completion, mapping timer expiry to target timeouts.
    /// Completions of abandoned (timed-out) targets are absorbed and
    /// dropped here.
    fn wait_one(&mut self) -> EngineResult<Option<FinishedTask>> {
        let timeout = self
            .deadlines
            .values()
            .min()
            .map(|deadline| deadline.saturating_duration_since(Instant::now()));
        match self.runner.wait(timeout) {
            Some(task) => {
                self.deadlines.remove(&task.id);
                let was_abandoned = self.abandoned.remove(&task.id);
                self.runner.finish(&task, was_abandoned);
                if was_abandoned {
                    debug!(node = %self.graph.node(task.id).name, "late completion ignored");
                    return Ok(None);
                }
                Ok(Some(task))
            }
            None => {
                let now = Instant::now();
                let overdue: Vec<NodeId> = self
                    .deadlines
                    .iter()
                    .filter(|(_, &deadline)| deadline <= now)
                    .map(|(&id, _)| id)
                    .collect();
                for id in overdue {
                    self.deadlines.remove(&id);
                    self.abandoned.insert(id);
                    self.runner.abandon();
                    let seconds = self.config.timeout.unwrap_or(Duration::ZERO).as_secs();
                    let err = EngineError::TargetTimeout {
                        target: self.graph.node(id).name.clone(),
                        seconds,
                    };
                    self.fail_target(id, err.to_string())?;
                }
                Ok(None)
            }
        }
    }

    fn record_finished(&mut self, task: FinishedTask) -> EngineResult<()> {
        let id = task.id;
        match task.result {
            Err(message) => {
                if self.retried.insert(id) {
                    warn!(
                        node = %self.graph.node(id).name,
                        error = %message,
                        "backend failure; retrying once"
                    );
                    return self.dispatch_retry(id);
                }
                self.fail_target(id, format!("backend failed twice: {}", message))
            }
            Ok(Outcome::Error { message }) => self.fail_target(id, message),
            Ok(Outcome::Cached { value_hash }) => self.commit(id, value_hash, task.span, task.tid),
            Ok(Outcome::Value { value }) => {
                let value_hash = self.store.put_object(&self.hashers, &value)?;
                self.commit(id, value_hash, task.span, task.tid)
            }
        }
    }

    fn dispatch_retry(&mut self, id: NodeId) -> EngineResult<()> {
        let item = self.make_item(id)?;
        if let Some(timeout) = self.config.timeout {
            self.deadlines.insert(id, Instant::now() + timeout);
        }
        let evaluator = self.graph.node(id).evaluator.clone();
        self.runner.start(id, evaluator.as_deref(), item)
    }

    /// Value committed, then meta, then dependents unblocked, in that
    /// order: a dependent reading the meta is guaranteed to find the value.
    fn commit(
        &mut self,
        id: NodeId,
        value_hash: String,
        span: (Instant, Instant),
        tid: usize,
    ) -> EngineResult<()> {
        let name = self.graph.node(id).name.clone();
        crate::trace::span(&name, tid + 1, span.0, span.1);
        let command = self.graph.node(id).command.as_ref().expect("target command");
        let oracle = self.oracle();
        let depends_hash = oracle
            .current_depends_hash(id)?
            .expect("dependencies committed before dependent");
        let output_files = oracle.output_fingerprints(id)?;
        let elapsed_ms = span.1.duration_since(span.0).as_millis() as u64;
        let meta = Meta {
            command_hash: self.hashers.command_hash(command),
            depends_hash,
            value_hash: Some(value_hash),
            output_files,
            seed: self.hashers.seed_for(self.config.root_seed, &name),
            elapsed_ms,
            finished_at: Store::now_secs(),
            error: None,
        };
        self.store.put_meta(&name, &meta)?;
        self.store.set_progress(&name, ProgressState::Built)?;
        self.set_state(id, BuildState::Built);
        self.summary.built += 1;
        self.progress
            .task_finished(&name, &TaskStatus::Built { elapsed_ms });
        self.unblock_dependents(id);
        Ok(())
    }

    fn finish_cached(&mut self, id: NodeId) -> EngineResult<()> {
        let name = self.graph.node(id).name.clone();
        self.store.set_progress(&name, ProgressState::Built)?;
        self.set_state(id, BuildState::Built);
        self.summary.skipped += 1;
        self.progress.task_finished(&name, &TaskStatus::Cached);
        self.unblock_dependents(id);
        Ok(())
    }

    /// Staged-mode bookkeeping for targets that never entered a stage.
    fn finish_fresh_quietly(&mut self, id: NodeId) {
        self.set_state(id, BuildState::Built);
        self.summary.skipped += 1;
    }

    fn finish_instant(&mut self, id: NodeId) {
        self.set_state(id, BuildState::Built);
        self.unblock_dependents(id);
    }

    fn fail_target(&mut self, id: NodeId, message: String) -> EngineResult<()> {
        let name = self.graph.node(id).name.clone();
        self.store.set_progress(&name, ProgressState::Failed)?;
        if self.config.record_failed_meta {
            let command = self.graph.node(id).command.as_ref().expect("target command");
            let depends_hash = self.oracle().current_depends_hash(id)?.unwrap_or_default();
            let meta = Meta {
                command_hash: self.hashers.command_hash(command),
                depends_hash,
                value_hash: None,
                output_files: BTreeMap::new(),
                seed: self.hashers.seed_for(self.config.root_seed, &name),
                elapsed_ms: 0,
                finished_at: Store::now_secs(),
                error: Some(message.clone()),
            };
            self.store.put_meta(&name, &meta)?;
        }
        self.set_state(id, BuildState::Failed);
        self.summary.failed += 1;
        self.progress.task_finished(
            &name,
            &TaskStatus::Failed {
                message: message.clone(),
            },
        );
        self.skip_successors(id);
        if !self.config.keep_going {
            return Err(EngineError::Eval {
                target: name,
                message,
            });
        }
        Ok(())
    }

    fn skip_target(&mut self, id: NodeId) {
        let name = self.graph.node(id).name.clone();
        self.set_state(id, BuildState::Skipped);
        self.summary.skipped += 1;
        self.progress.task_finished(&name, &TaskStatus::Skipped);
    }

    /// A failure poisons everything downstream; successors never unblock.
    fn skip_successors(&mut self, id: NodeId) {
        let mut stack: Vec<NodeId> = self.graph.node(id).dependents.clone();
        while let Some(next) = stack.pop() {
            if !self.wanted.contains(&next) {
                continue;
            }
            match *self.states.get(next) {
                BuildState::Pending | BuildState::Ready => {}
                _ => continue,
            }
            if self.graph.node(next).is_target() {
                self.skip_target(next);
            } else {
                self.set_state(next, BuildState::Skipped);
            }
            stack.extend(self.graph.node(next).dependents.iter().copied());
        }
    }

    fn unblock_dependents(&mut self, id: NodeId) {
        let dependents = self.graph.node(id).dependents.clone();
        for dep in dependents {
            if !self.wanted.contains(&dep) || *self.states.get(dep) != BuildState::Pending {
                continue;
            }
            let pending = self.pending.get_mut(dep);
            *pending -= 1;
            if *pending == 0 {
                self.ready.push_back(dep);
            }
        }
    }

    /// Absorb outstanding completions without committing anything; used on
    /// the way out of a cancelled or aborted run.  Abandoned workers are
    /// not waited for.
    fn drain(&mut self) {
        while self.runner.is_running() {
            match self.runner.wait(Some(Duration::from_secs(60))) {
                Some(task) => {
                    let was_abandoned = self.abandoned.remove(&task.id);
                    self.runner.finish(&task, was_abandoned);
                }
                None => {
                    warn!("gave up draining outstanding work");
                    return;
                }
            }
        }
    }
}

/// One-call driver: analyze, open the cache, and run.
pub fn build(
    plan: &Plan,
    env: &Environment,
    config: &Config,
    registry: &Registry,
    progress: &mut dyn Progress,
    targets: &[String],
) -> EngineResult<Summary> {
    let pg = graph::build_graph(
        plan,
        env,
        &FencedCodeExtractor,
        config.trigger_default,
        config.strict,
    )?;
    let store = Store::open(&config.cache_dir, &config.hashers())?;
    let mut work = Work::new(&pg, env, &store, config, registry, progress);
    work.want(targets)?;
    work.run()
}
