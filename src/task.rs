//! Dispatch backends: run work items, potentially in parallel, and report
//! completions over a channel.  Unaware of the build graph or staleness;
//! just command execution.
//!
//! Four strategies share one contract:
//! - "local": an in-process worker pool sharing the parent's memory;
//! - "processes": isolated worker processes fed the work item over stdin;
//! - "jobs": an external submit command given a rendered job script, with
//!   completion signalled by a sentinel file;
//! - user-registered callables for arbitrary transports.

use crate::error::{EngineError, EngineResult};
use crate::eval::{self, Scope, Value};
use crate::graph::NodeId;
use crate::hash::{Hashers, LongAlgo, ShortAlgo};
use crate::parse::{Expr, Func};
use crate::store::Store;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Where a produced value gets written: by the worker that computed it, or
/// returned in-band for the master to cache (required when the object store
/// cannot take concurrent writers).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CachingSite {
    Worker,
    Master,
}

/// Everything a worker needs to evaluate one target, serializable so it can
/// cross a process boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    pub name: String,
    pub command: Expr,
    /// Evaluation scope: dependency values and imported values.
    pub vars: BTreeMap<String, Value>,
    /// Imported functions callable from the command.
    pub funcs: BTreeMap<String, Func>,
    pub seed: u64,
    pub caching: CachingSite,
    pub cache_dir: PathBuf,
    pub short_hash: ShortAlgo,
    pub long_hash: LongAlgo,
    /// Pass-through plan columns the engine doesn't interpret.
    pub extra: Vec<(String, String)>,
}

/// What a worker reports back.
#[derive(Debug, Serialize, Deserialize)]
pub enum Outcome {
    /// Worker wrote the value to the object store; only the hash returns.
    Cached { value_hash: String },
    /// Value returned in-band for the master to cache.
    Value { value: Value },
    /// The command failed; an eval error for the scheduler.
    Error { message: String },
}

pub struct FinishedTask {
    /// Claimed "thread id", used to assign trace tracks.
    pub tid: usize,
    pub id: NodeId,
    pub span: (Instant, Instant),
    /// Ok: the worker ran to a verdict.  Err: the backend itself broke
    /// (spawn failure, protocol garbage); retried once by the scheduler.
    pub result: Result<Outcome, String>,
}

/// Evaluate a work item.  This is the one function every backend ultimately
/// funnels into, in whatever process it happens to run.
pub fn execute(item: &WorkItem) -> Outcome {
    let mut scope = Scope::new(item.seed);
    scope.vars = item.vars.clone();
    scope.funcs = item.funcs.clone();
    let value = match eval::eval(&item.command, &scope) {
        Ok(value) => value,
        Err(err) => {
            return Outcome::Error {
                message: err.to_string(),
            }
        }
    };
    match item.caching {
        CachingSite::Master => Outcome::Value { value },
        CachingSite::Worker => {
            let hashers = Hashers {
                short: item.short_hash,
                long: item.long_hash,
            };
            match Store::open(&item.cache_dir, &hashers)
                .and_then(|store| store.put_object(&hashers, &value))
            {
                Ok(value_hash) => Outcome::Cached { value_hash },
                Err(err) => Outcome::Error {
                    message: format!("caching result: {}", err),
                },
            }
        }
    }
}

/// The common backend contract.
pub trait Dispatch: Send + Sync {
    /// Start one work item; completion arrives on `done`.  An Err here is a
    /// synchronous backend failure.
    fn dispatch(
        &self,
        id: NodeId,
        tid: usize,
        item: WorkItem,
        done: mpsc::Sender<FinishedTask>,
    ) -> anyhow::Result<()>;

    /// The most workers this backend can usefully run at once.
    fn max_parallel(&self) -> usize;

    fn caching_site_default(&self) -> CachingSite;
}

/// In-process pool: one thread per running item, sharing parent memory.
pub struct LocalPool {
    pub parallelism: usize,
}

impl Dispatch for LocalPool {
    fn dispatch(
        &self,
        id: NodeId,
        tid: usize,
        item: WorkItem,
        done: mpsc::Sender<FinishedTask>,
    ) -> anyhow::Result<()> {
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = Ok(execute(&item));
            // The send only fails if the receiver is gone, e.g. shutdown.
            let _ = done.send(FinishedTask {
                tid,
                id,
                span: (start, Instant::now()),
                result,
            });
        });
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.parallelism
    }

    fn caching_site_default(&self) -> CachingSite {
        CachingSite::Worker
    }
}

/// Isolated worker processes: this binary re-invoked in worker mode with
/// the work item on stdin and the outcome on stdout.  Cross-platform, at
/// the price of process setup per item.
pub struct ProcessPool {
    pub parallelism: usize,
    pub exe: PathBuf,
}

impl ProcessPool {
    pub fn new(parallelism: usize) -> anyhow::Result<Self> {
        Ok(ProcessPool {
            parallelism,
            exe: std::env::current_exe()?,
        })
    }

    fn run_child(exe: &PathBuf, item: &WorkItem) -> anyhow::Result<Outcome> {
        let mut child = std::process::Command::new(exe)
            .arg("--worker")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .spawn()?;
        let payload = serde_json::to_vec(item)?;
        child
            .stdin
            .take()
            .expect("piped stdin")
            .write_all(&payload)?;
        let mut out = Vec::new();
        child
            .stdout
            .take()
            .expect("piped stdout")
            .read_to_end(&mut out)?;
        let status = child.wait()?;
        if !status.success() {
            anyhow::bail!("worker exited with {}", status);
        }
        Ok(serde_json::from_slice(&out)?)
    }
}

impl Dispatch for ProcessPool {
    fn dispatch(
        &self,
        id: NodeId,
        tid: usize,
        item: WorkItem,
        done: mpsc::Sender<FinishedTask>,
    ) -> anyhow::Result<()> {
        let exe = self.exe.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = Self::run_child(&exe, &item).map_err(|err| err.to_string());
            let _ = done.send(FinishedTask {
                tid,
                id,
                span: (start, Instant::now()),
                result,
            });
        });
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.parallelism
    }

    fn caching_site_default(&self) -> CachingSite {
        CachingSite::Worker
    }
}

/// External jobs: write the work item and a rendered job script under the
/// cache, hand the script to a submit command (e.g. a cluster submission),
/// and wait for the worker's outcome file to appear as the job handle.
pub struct ExternalJobs {
    pub parallelism: usize,
    /// Submit command; receives the rendered script path as its argument.
    pub submit: String,
    /// Job script template, expanded with $worker_cmd, $target, $cache.
    pub template: String,
    pub exe: PathBuf,
}

pub const DEFAULT_JOB_TEMPLATE: &str = "#!/bin/sh\nexec $worker_cmd\n";

impl ExternalJobs {
    pub fn new(parallelism: usize, submit: String, template: Option<String>) -> anyhow::Result<Self> {
        Ok(ExternalJobs {
            parallelism,
            submit,
            template: template.unwrap_or_else(|| DEFAULT_JOB_TEMPLATE.to_owned()),
            exe: std::env::current_exe()?,
        })
    }

    fn submit_job(&self, item: &WorkItem) -> anyhow::Result<PathBuf> {
        let jobs_dir = item.cache_dir.join("jobs");
        std::fs::create_dir_all(&jobs_dir)?;
        let item_path = jobs_dir.join(format!("{}.json", item.name));
        let out_path = jobs_dir.join(format!("{}.out.json", item.name));
        let script_path = jobs_dir.join(format!("{}.sh", item.name));
        // A stale outcome file would read as an instant completion.
        match std::fs::remove_file(&out_path) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        std::fs::write(&item_path, serde_json::to_vec(item)?)?;

        let worker_cmd = format!(
            "{:?} --worker-item {:?} --worker-out {:?}",
            self.exe, item_path, out_path
        );
        let script = expand_template(
            &self.template,
            &[
                ("worker_cmd", worker_cmd.as_str()),
                ("target", item.name.as_str()),
                ("cache", &item.cache_dir.to_string_lossy()),
            ],
        );
        std::fs::write(&script_path, script)?;

        let status = std::process::Command::new(&self.submit)
            .arg(&script_path)
            .status()?;
        if !status.success() {
            anyhow::bail!("submit {:?} exited with {}", self.submit, status);
        }
        Ok(out_path)
    }
}

impl Dispatch for ExternalJobs {
    fn dispatch(
        &self,
        id: NodeId,
        tid: usize,
        item: WorkItem,
        done: mpsc::Sender<FinishedTask>,
    ) -> anyhow::Result<()> {
        let start = Instant::now();
        let out_path = self.submit_job(&item)?;
        std::thread::spawn(move || {
            // The sentinel file is the opaque job handle: poll until the
            // worker has renamed its outcome into place.
            let result = loop {
                match std::fs::read(&out_path) {
                    Ok(bytes) => match serde_json::from_slice(&bytes) {
                        Ok(outcome) => break Ok(outcome),
                        Err(err) => break Err(format!("bad outcome file: {}", err)),
                    },
                    Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                        std::thread::sleep(Duration::from_millis(25));
                    }
                    Err(err) => break Err(format!("awaiting job outcome: {}", err)),
                }
            };
            let _ = done.send(FinishedTask {
                tid,
                id,
                span: (start, Instant::now()),
                result,
            });
        });
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.parallelism
    }

    fn caching_site_default(&self) -> CachingSite {
        CachingSite::Worker
    }
}

/// User-provided backend: an opaque callable plus a completion signal,
/// enabling distribution over arbitrary transports.
pub struct CallableBackend {
    pub parallelism: usize,
    pub caching: CachingSite,
    pub call: Arc<dyn Fn(&WorkItem) -> Outcome + Send + Sync>,
}

impl Dispatch for CallableBackend {
    fn dispatch(
        &self,
        id: NodeId,
        tid: usize,
        item: WorkItem,
        done: mpsc::Sender<FinishedTask>,
    ) -> anyhow::Result<()> {
        let call = self.call.clone();
        std::thread::spawn(move || {
            let start = Instant::now();
            let result = Ok(call(&item));
            let _ = done.send(FinishedTask {
                tid,
                id,
                span: (start, Instant::now()),
                result,
            });
        });
        Ok(())
    }

    fn max_parallel(&self) -> usize {
        self.parallelism
    }

    fn caching_site_default(&self) -> CachingSite {
        self.caching
    }
}

/// Expand `$name` / `${name}` references in a job-script template; `$$`
/// escapes a literal dollar.
pub fn expand_template(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.char_indices().peekable();
    while let Some((_, c)) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some(&(_, '$')) => {
                chars.next();
                out.push('$');
            }
            Some(&(start, '{')) => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for (_, c) in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match vars.iter().find(|(k, _)| *k == name) {
                    Some((_, v)) if closed => out.push_str(v),
                    _ => {
                        out.push('$');
                        out.push_str(&template[start..start + 1 + name.len()]);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            _ => {
                let mut name = String::new();
                while let Some(&(_, c)) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match vars.iter().find(|(k, _)| *k == name) {
                    Some((_, v)) => out.push_str(v),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
        }
    }
    out
}

/// Named backends resolvable from plan rows' `evaluator` column.
pub struct Registry {
    backends: Vec<(String, Box<dyn Dispatch>)>,
}

impl Registry {
    pub fn new() -> Self {
        Registry {
            backends: Vec::new(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Box<dyn Dispatch>) {
        self.backends.push((name.into(), backend));
    }

    pub fn get(&self, name: &str) -> Option<&dyn Dispatch> {
        self.backends
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, b)| b.as_ref())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks faked "thread ids" -- integers assigned to running tasks so the
/// trace output can show parallelism as tracks.
#[derive(Default)]
struct ThreadIds {
    slots: Vec<bool>,
}

impl ThreadIds {
    fn claim(&mut self) -> usize {
        match self.slots.iter().position(|&used| !used) {
            Some(idx) => {
                self.slots[idx] = true;
                idx
            }
            None => {
                self.slots.push(true);
                self.slots.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) {
        self.slots[slot] = false;
    }
}

/// The scheduler's handle on in-flight work: dispatches through the
/// registry and funnels completions into one channel.
pub struct Runner<'a> {
    registry: &'a Registry,
    default_backend: &'a str,
    finished_send: mpsc::Sender<FinishedTask>,
    finished_recv: mpsc::Receiver<FinishedTask>,
    pub running: usize,
    tids: ThreadIds,
    max_parallel: usize,
}

impl<'a> Runner<'a> {
    pub fn new(registry: &'a Registry, default_backend: &'a str, max_parallel: usize) -> Self {
        let (tx, rx) = mpsc::channel();
        Runner {
            registry,
            default_backend,
            finished_send: tx,
            finished_recv: rx,
            running: 0,
            tids: ThreadIds::default(),
            max_parallel,
        }
    }

    pub fn can_start_more(&self) -> bool {
        self.running < self.max_parallel
    }

    pub fn is_running(&self) -> bool {
        self.running > 0
    }

    /// Resolve the backend (per-target override first) and dispatch.
    pub fn start(
        &mut self,
        id: NodeId,
        backend_override: Option<&str>,
        item: WorkItem,
    ) -> EngineResult<()> {
        let backend_name = backend_override.unwrap_or(self.default_backend);
        let backend = self
            .registry
            .get(backend_name)
            .ok_or_else(|| EngineError::Backend {
                backend: backend_name.to_owned(),
                target: item.name.clone(),
                message: "unknown backend".to_owned(),
            })?;
        let tid = self.tids.claim();
        debug!(node = %item.name, backend = backend_name, tid, "dispatch");
        let target = item.name.clone();
        match backend.dispatch(id, tid, item, self.finished_send.clone()) {
            Ok(()) => {
                self.running += 1;
                Ok(())
            }
            Err(err) => {
                self.tids.release(tid);
                Err(EngineError::Backend {
                    backend: backend_name.to_owned(),
                    target,
                    message: err.to_string(),
                })
            }
        }
    }

    /// Default caching site of a backend by name.
    pub fn caching_site(&self, backend_override: Option<&str>) -> CachingSite {
        let name = backend_override.unwrap_or(self.default_backend);
        self.registry
            .get(name)
            .map(|b| b.caching_site_default())
            .unwrap_or(CachingSite::Master)
    }

    /// Wait for a completion.  May block; returns None on timeout.  The
    /// caller must follow up with finish() for every received task.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Option<FinishedTask> {
        match timeout {
            Some(timeout) => self.finished_recv.recv_timeout(timeout).ok(),
            None => Some(self.finished_recv.recv().expect("runner channel open")),
        }
    }

    /// Bookkeeping for a received completion.  `was_abandoned` marks tasks
    /// whose slot was already released by abandon().
    pub fn finish(&mut self, task: &FinishedTask, was_abandoned: bool) {
        self.tids.release(task.tid);
        if !was_abandoned {
            self.running -= 1;
        }
    }

    /// Give up on an in-flight task (timeout): its slot is released for
    /// scheduling even though the worker may still be running.
    pub fn abandon(&mut self) {
        self.running -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_expansion() {
        let vars = [("target", "t1"), ("cache", "/c")];
        assert_eq!(
            expand_template("run $target in ${cache}", &vars),
            "run t1 in /c"
        );
        assert_eq!(expand_template("cost: $$5 for $unknown", &vars), "cost: $5 for $unknown");
    }

    #[test]
    fn execute_master_caching_returns_value_in_band() {
        let dir = tempfile::tempdir().unwrap();
        let item = WorkItem {
            name: "t".into(),
            command: crate::parse::parse_expr_text("2 + 3").unwrap(),
            vars: BTreeMap::new(),
            funcs: BTreeMap::new(),
            seed: 1,
            caching: CachingSite::Master,
            cache_dir: dir.path().join("cache"),
            short_hash: ShortAlgo::Fnv,
            long_hash: LongAlgo::Sha256,
            extra: Vec::new(),
        };
        match execute(&item) {
            Outcome::Value { value } => assert_eq!(value, Value::Int(5)),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn execute_worker_caching_stores_object() {
        let dir = tempfile::tempdir().unwrap();
        let cache = dir.path().join("cache");
        let item = WorkItem {
            name: "t".into(),
            command: crate::parse::parse_expr_text("\"abc\" + \"def\"").unwrap(),
            vars: BTreeMap::new(),
            funcs: BTreeMap::new(),
            seed: 1,
            caching: CachingSite::Worker,
            cache_dir: cache.clone(),
            short_hash: ShortAlgo::Fnv,
            long_hash: LongAlgo::Sha256,
            extra: Vec::new(),
        };
        let hash = match execute(&item) {
            Outcome::Cached { value_hash } => value_hash,
            other => panic!("unexpected outcome {:?}", other),
        };
        let store = Store::open(&cache, &Hashers::default()).unwrap();
        assert_eq!(
            store.get_object(&hash).unwrap(),
            Some(Value::Str("abcdef".into()))
        );
    }

    #[test]
    fn eval_errors_come_back_as_outcome_error() {
        let dir = tempfile::tempdir().unwrap();
        let item = WorkItem {
            name: "t".into(),
            command: crate::parse::parse_expr_text("missing + 1").unwrap(),
            vars: BTreeMap::new(),
            funcs: BTreeMap::new(),
            seed: 1,
            caching: CachingSite::Master,
            cache_dir: dir.path().join("cache"),
            short_hash: ShortAlgo::Fnv,
            long_hash: LongAlgo::Sha256,
            extra: Vec::new(),
        };
        match execute(&item) {
            Outcome::Error { message } => assert!(message.contains("missing")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn work_item_round_trips_over_the_wire() {
        let item = WorkItem {
            name: "t".into(),
            command: crate::parse::parse_expr_text("load(a) + 1").unwrap(),
            vars: [("a".to_string(), Value::Int(4))].into(),
            funcs: BTreeMap::new(),
            seed: 42,
            caching: CachingSite::Worker,
            cache_dir: PathBuf::from("/tmp/cache"),
            short_hash: ShortAlgo::Fnv,
            long_hash: LongAlgo::Sha256,
            extra: vec![("note".into(), "hi".into())],
        };
        let bytes = serde_json::to_vec(&item).unwrap();
        let back: WorkItem = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(back.command, item.command);
        assert_eq!(back.vars, item.vars);
        assert_eq!(back.seed, 42);
    }
}
