//! Library-level build scenarios: full plan -> graph -> schedule -> cache
//! round trips against a temporary cache directory.

use lathe::config::{Config, Scheduler};
use lathe::env::Environment;
use lathe::error::EngineError;
use lathe::eval::Value;
use lathe::graph;
use lathe::parse;
use lathe::progress::{Progress, QuietProgress, TaskStatus};
use lathe::stale::Oracle;
use lathe::store::Store;
use lathe::subdoc::FencedCodeExtractor;
use lathe::task::{CachingSite, Registry};
use lathe::work::{self, Summary};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A workspace with its own cache and working directory for file targets.
struct Space {
    dir: tempfile::TempDir,
    config: Config,
}

impl Space {
    fn new() -> Space {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache_dir = dir.path().join("cache");
        config.max_parallel = 2;
        Space { dir, config }
    }

    fn write(&self, path: &str, content: &str) {
        std::fs::write(self.dir.path().join(path), content).unwrap();
    }

    /// Plans reference relative paths; run each build with the workspace as
    /// the process working directory.  Serialized because cwd is global.
    fn build(&self, plan_text: &str) -> Result<Summary, EngineError> {
        self.build_with(plan_text, &mut QuietProgress)
    }

    fn build_with(
        &self,
        plan_text: &str,
        progress: &mut dyn Progress,
    ) -> Result<Summary, EngineError> {
        let _guard = cwd_lock().lock().unwrap();
        let prev = std::env::current_dir().unwrap();
        std::env::set_current_dir(self.dir.path()).unwrap();
        let result = (|| {
            let plan = parse::parse_plan(Path::new("plan"), plan_text)
                .map_err(EngineError::Parse)?;
            let env = Environment::from_decls(&plan.imports)?;
            let registry = self.config.default_registry().unwrap();
            work::build(&plan, &env, &self.config, &registry, progress, &[])
        })();
        std::env::set_current_dir(prev).unwrap();
        result
    }

    fn store(&self) -> Store {
        Store::open(&self.config.cache_dir, &self.config.hashers()).unwrap()
    }

    fn value_of(&self, name: &str) -> Value {
        let store = self.store();
        let meta = store
            .get_meta(name)
            .unwrap()
            .unwrap_or_else(|| panic!("no meta for {}", name));
        let hash = meta
            .value_hash
            .unwrap_or_else(|| panic!("no value hash for {}", name));
        store
            .get_object(&hash)
            .unwrap()
            .unwrap_or_else(|| panic!("no object for {}", name))
    }
}

fn cwd_lock() -> &'static Mutex<()> {
    static LOCK: Mutex<()> = Mutex::new(());
    &LOCK
}

/// Progress that records which targets were actually evaluated.
#[derive(Default)]
struct RecordingProgress {
    built: Vec<String>,
    failed: Vec<String>,
    skipped: Vec<String>,
}

impl Progress for RecordingProgress {
    fn update(&mut self, _counts: &lathe::work::StateCounts) {}
    fn task_started(&mut self, _name: &str) {}
    fn task_finished(&mut self, name: &str, status: &TaskStatus) {
        match status {
            TaskStatus::Built { .. } => self.built.push(name.to_owned()),
            TaskStatus::Failed { .. } => self.failed.push(name.to_owned()),
            TaskStatus::Skipped => self.skipped.push(name.to_owned()),
            TaskStatus::Cached => {}
        }
    }
    fn log(&mut self, _msg: &str) {}
}

const CHAIN: &str = "target a = 1\ntarget b = a + 1\ntarget c = b * 2\n";

#[test]
fn basic_chain_builds_and_caches() {
    let space = Space::new();
    let summary = space.build(CHAIN).unwrap();
    assert_eq!(
        summary,
        Summary {
            built: 3,
            skipped: 0,
            failed: 0
        }
    );
    assert_eq!(space.value_of("a"), Value::Int(1));
    assert_eq!(space.value_of("b"), Value::Int(2));
    assert_eq!(space.value_of("c"), Value::Int(4));
}

#[test]
fn empty_plan_succeeds() {
    let space = Space::new();
    let summary = space.build("# nothing here\n").unwrap();
    assert_eq!(summary, Summary::default());
}

#[test]
fn second_run_evaluates_nothing() {
    let space = Space::new();
    space.build(CHAIN).unwrap();
    let summary = space.build(CHAIN).unwrap();
    assert_eq!(summary.built, 0);
    assert_eq!(summary.skipped, 3);
}

#[test]
fn command_edit_invalidates_exactly_the_subtree() {
    let space = Space::new();
    space.build(CHAIN).unwrap();

    let edited = "target a = 1\ntarget b = a + 10\ntarget c = b * 2\n";
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(edited, &mut progress).unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(summary.skipped, 1);
    let built: BTreeSet<&str> = progress.built.iter().map(|s| s.as_str()).collect();
    assert_eq!(built, ["b", "c"].into_iter().collect());
    assert_eq!(space.value_of("c"), Value::Int(22));
}

#[test]
fn import_function_change_invalidates_user() {
    let space = Space::new();
    let v1 = "fn f(x) = x + 1\ntarget y = f(3)\ntarget z = 7\n";
    space.build(v1).unwrap();
    assert_eq!(space.value_of("y"), Value::Int(4));

    let v2 = "fn f(x) = x + 100\ntarget y = f(3)\ntarget z = 7\n";
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(v2, &mut progress).unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(progress.built, ["y"]);
    assert_eq!(space.value_of("y"), Value::Int(103));
}

#[test]
fn file_change_invalidates_readers() {
    let space = Space::new();
    space.write("in.txt", "hello");
    let plan = "target y = read_file(file_in(\"in.txt\"))\ntarget z = 1\n";
    space.build(plan).unwrap();
    assert_eq!(space.value_of("y"), Value::Str("hello".into()));

    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 0, "unchanged file should not rebuild");

    space.write("in.txt", "world");
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(plan, &mut progress).unwrap();
    assert_eq!(progress.built, ["y"]);
    assert_eq!(summary.built, 1);
    assert_eq!(space.value_of("y"), Value::Str("world".into()));
}

#[test]
fn always_trigger_rebuilds_every_run() {
    let space = Space::new();
    let plan = "target t = 5\n  trigger = always\ntarget u = 6\n";
    space.build(plan).unwrap();
    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 1);
    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 1);
}

#[test]
fn missing_trigger_only_rebuilds_on_eviction() {
    let space = Space::new();
    let plan = "target t = 5\n  trigger = missing\n";
    space.build(plan).unwrap();

    // A command edit is invisible under the missing trigger.
    let edited = "target t = 6\n  trigger = missing\n";
    let summary = space.build(edited).unwrap();
    assert_eq!(summary.built, 0);
    assert_eq!(space.value_of("t"), Value::Int(5));

    // Evicting the object forces a rebuild.
    let store = space.store();
    let hash = store.get_meta("t").unwrap().unwrap().value_hash.unwrap();
    std::fs::remove_file(space.config.cache_dir.join("objects").join(&hash)).unwrap();
    let summary = space.build(edited).unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(space.value_of("t"), Value::Int(6));
}

#[test]
fn ignore_blocks_hide_dependencies() {
    let space = Space::new();
    let plan = "let k = 5\ntarget t = 1 + ignore(k)\n";
    space.build(plan).unwrap();
    assert_eq!(space.value_of("t"), Value::Int(6));

    // Changing the ignored import must not invalidate the target.
    let changed = "let k = 50\ntarget t = 1 + ignore(k)\n";
    let summary = space.build(changed).unwrap();
    assert_eq!(summary.built, 0);
    assert_eq!(space.value_of("t"), Value::Int(6));
}

#[test]
fn import_value_change_invalidates() {
    let space = Space::new();
    space.build("let k = 5\ntarget t = 1 + k\n").unwrap();
    let summary = space.build("let k = 50\ntarget t = 1 + k\n").unwrap();
    assert_eq!(summary.built, 1);
    assert_eq!(space.value_of("t"), Value::Int(51));
}

#[test]
fn generated_file_links_producer_before_consumer() {
    let space = Space::new();
    let plan = "\
target w = write_file(file_out(\"gen.txt\"), 41 + 1)
target r = read_file(file_in(\"gen.txt\"))
";
    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 2);
    assert_eq!(space.value_of("r"), Value::Str("42".into()));

    // Deleting the generated file re-runs the producer; the consumer sees
    // identical content and is cut off early.
    std::fs::remove_file(space.dir.path().join("gen.txt")).unwrap();
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(plan, &mut progress).unwrap();
    assert_eq!(progress.built, ["w"]);
    assert_eq!(summary.built, 1);
}

#[test]
fn failure_skips_dependents_and_keeps_going() {
    let mut space = Space::new();
    space.config.keep_going = true;
    let plan = "\
target bad = 1 / 0
target child = bad + 1
target other = 10
";
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(plan, &mut progress).unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(progress.failed, ["bad"]);
    assert_eq!(progress.skipped, ["child"]);
    assert_eq!(progress.built, ["other"]);
}

#[test]
fn failure_aborts_without_keep_going() {
    let space = Space::new();
    let err = space.build("target bad = 1 / 0\n").unwrap_err();
    match err {
        EngineError::Eval { ref target, .. } => assert_eq!(target, "bad"),
        other => panic!("expected Eval error, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 1);
}

#[test]
fn cycles_are_fatal_with_the_cycle_named() {
    let space = Space::new();
    let err = space
        .build("target a = b + 1\ntarget b = c + 1\ntarget c = a + 1\n")
        .unwrap_err();
    match err {
        EngineError::CyclicPlan(ref cycle) => {
            assert!(cycle.contains(&"a".to_string()));
            assert!(cycle.contains(&"c".to_string()));
        }
        other => panic!("expected CyclicPlan, got {:?}", other),
    }
    assert_eq!(err.exit_code(), 2);
}

#[test]
fn staged_scheduler_matches_dynamic() {
    let mut space = Space::new();
    space.config.scheduler = Scheduler::Staged;
    let plan = "\
target a = 1
target b = a + 1
target c = a + 2
target d = b + c
";
    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 4);
    assert_eq!(space.value_of("d"), Value::Int(5));

    let summary = space.build(plan).unwrap();
    assert_eq!(summary.built, 0);
    assert_eq!(summary.skipped, 4);

    // Edit an inner target; only the affected subtree re-runs.
    let edited = "\
target a = 1
target b = a + 2
target c = a + 2
target d = b + c
";
    let mut progress = RecordingProgress::default();
    let summary = space.build_with(edited, &mut progress).unwrap();
    let built: BTreeSet<&str> = progress.built.iter().map(|s| s.as_str()).collect();
    assert_eq!(built, ["b", "d"].into_iter().collect());
    assert_eq!(summary.built, 2);
    assert_eq!(space.value_of("d"), Value::Int(6));
}

#[test]
fn master_caching_site_round_trips() {
    let mut space = Space::new();
    space.config.caching = Some(CachingSite::Master);
    space.build("target t = \"in\" + \"band\"\n").unwrap();
    assert_eq!(space.value_of("t"), Value::Str("inband".into()));
}

#[test]
fn seeded_rand_reproducible_across_runs() {
    let space = Space::new();
    let plan = "target t = rand()\n  trigger = always\n";
    space.build(plan).unwrap();
    let first = space.value_of("t");
    space.build(plan).unwrap();
    assert_eq!(space.value_of("t"), first);

    // A different root seed yields a different stream.
    let mut other = Space::new();
    other.config.root_seed = 99;
    other.build(plan).unwrap();
    assert_ne!(other.value_of("t"), first);
}

#[test]
fn subdoc_references_become_load_edges() {
    let space = Space::new();
    space.write(
        "report.md",
        "# Report\n\n```\nload(a)\n```\n",
    );
    let plan = "target a = 3\ntarget doc = subdoc_in(\"report.md\")\n";
    space.build(plan).unwrap();

    // Changing a's command re-renders the report target.
    let edited = "target a = 4\ntarget doc = subdoc_in(\"report.md\")\n";
    let mut progress = RecordingProgress::default();
    space.build_with(edited, &mut progress).unwrap();
    let built: BTreeSet<&str> = progress.built.iter().map(|s| s.as_str()).collect();
    assert_eq!(built, ["a", "doc"].into_iter().collect());
}

#[test]
fn parallel_width_is_reported() {
    let space = Space::new();
    let _guard = cwd_lock().lock().unwrap();
    let plan_text = "\
target a = 1
target b = 2
target c = 3
target d = 4
target e = a + b + c + d
";
    let plan = parse::parse_plan(Path::new("plan"), plan_text).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let pg = graph::build_graph(
        &plan,
        &env,
        &FencedCodeExtractor,
        lathe::graph::Trigger::Any,
        false,
    )
    .unwrap();
    let hashers = space.config.hashers();
    let store = Store::open(&space.config.cache_dir, &hashers).unwrap();
    let oracle = Oracle {
        graph: &pg.graph,
        depsets: &pg.depsets,
        env: &env,
        store: &store,
        hashers: &hashers,
        hash_file_contents: true,
    };
    let outdated = oracle.outdated_set().unwrap();
    assert_eq!(pg.graph.max_useful_parallelism(&outdated), 4);
    let stages = pg.graph.parallel_stages(&outdated);
    assert_eq!(stages.len(), 2);
    assert_eq!(stages[0].len(), 4);
    assert_eq!(stages[1].len(), 1);
}

#[test]
fn up_to_date_plan_has_no_stages() {
    let space = Space::new();
    space.build(CHAIN).unwrap();

    let _guard = cwd_lock().lock().unwrap();
    let plan = parse::parse_plan(Path::new("plan"), CHAIN).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let pg = graph::build_graph(
        &plan,
        &env,
        &FencedCodeExtractor,
        lathe::graph::Trigger::Any,
        false,
    )
    .unwrap();
    let hashers = space.config.hashers();
    let store = Store::open(&space.config.cache_dir, &hashers).unwrap();
    let oracle = Oracle {
        graph: &pg.graph,
        depsets: &pg.depsets,
        env: &env,
        store: &store,
        hashers: &hashers,
        hash_file_contents: true,
    };
    let outdated = oracle.outdated_set().unwrap();
    assert!(pg.graph.parallel_stages(&outdated).is_empty());
    assert_eq!(pg.graph.max_useful_parallelism(&outdated), 0);
}

#[test]
fn concurrent_building_never_exceeds_max_parallel() {
    use lathe::task::CallableBackend;

    let mut space = Space::new();
    space.config.max_parallel = 2;
    space.config.parallelism = "probe".to_owned();

    let current = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let (current2, peak2) = (current.clone(), peak.clone());

    let plan_text = "target a = 1\ntarget b = 2\ntarget c = 3\ntarget d = 4\n";
    let _guard = cwd_lock().lock().unwrap();
    let plan = parse::parse_plan(Path::new("plan"), plan_text).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let mut registry = Registry::new();
    registry.register(
        "probe",
        Box::new(CallableBackend {
            parallelism: 8,
            caching: CachingSite::Worker,
            call: Arc::new(move |item: &lathe::task::WorkItem| {
                let now = current2.fetch_add(1, Ordering::SeqCst) + 1;
                peak2.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(std::time::Duration::from_millis(30));
                current2.fetch_sub(1, Ordering::SeqCst);
                lathe::task::execute(item)
            }),
        }),
    );
    let summary = work::build(
        &plan,
        &env,
        &space.config,
        &registry,
        &mut QuietProgress,
        &[],
    )
    .unwrap();
    assert_eq!(summary.built, 4);
    assert!(
        peak.load(Ordering::SeqCst) <= 2,
        "observed {} concurrent builds",
        peak.load(Ordering::SeqCst)
    );
}

#[test]
fn per_target_timeout_fails_the_target() {
    use lathe::task::CallableBackend;

    let mut space = Space::new();
    space.config.parallelism = "slow".to_owned();
    space.config.timeout = Some(std::time::Duration::from_millis(50));
    space.config.keep_going = true;

    let plan_text = "target slowpoke = 1\ntarget fine = 2\n";
    let _guard = cwd_lock().lock().unwrap();
    let plan = parse::parse_plan(Path::new("plan"), plan_text).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let mut registry = Registry::new();
    registry.register(
        "slow",
        Box::new(CallableBackend {
            parallelism: 4,
            caching: CachingSite::Worker,
            call: Arc::new(|item: &lathe::task::WorkItem| {
                if item.name == "slowpoke" {
                    std::thread::sleep(std::time::Duration::from_millis(400));
                }
                lathe::task::execute(item)
            }),
        }),
    );
    let mut progress = RecordingProgress::default();
    let summary = work::build(
        &plan,
        &env,
        &space.config,
        &registry,
        &mut progress,
        &[],
    )
    .unwrap();
    assert_eq!(summary.failed, 1);
    assert_eq!(progress.failed, ["slowpoke"]);
    assert!(progress.built.contains(&"fine".to_string()));
}

#[test]
fn drain_request_cancels_the_run() {
    let space = Space::new();
    // Holding the build lock keeps the drain request from leaking into any
    // other test's run.
    let _guard = cwd_lock().lock().unwrap();
    let plan = parse::parse_plan(Path::new("plan"), CHAIN).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let registry = space.config.default_registry().unwrap();

    lathe::signal::request_drain();
    let err = work::build(
        &plan,
        &env,
        &space.config,
        &registry,
        &mut QuietProgress,
        &[],
    )
    .unwrap_err();
    lathe::signal::reset();
    assert!(matches!(err, EngineError::Cancelled));
    assert_eq!(err.exit_code(), 130);

    // Rearmed, the same plan builds normally.
    let summary = work::build(
        &plan,
        &env,
        &space.config,
        &registry,
        &mut QuietProgress,
        &[],
    )
    .unwrap();
    assert_eq!(summary.built, 3);
}

#[test]
fn requested_targets_limit_the_run() {
    let space = Space::new();
    let plan_text = "target a = 1\ntarget b = a + 1\ntarget unrelated = 9\n";
    let _guard = cwd_lock().lock().unwrap();
    let plan = parse::parse_plan(Path::new("plan"), plan_text).unwrap();
    let env = Environment::from_decls(&plan.imports).unwrap();
    let registry = space.config.default_registry().unwrap();
    let summary = work::build(
        &plan,
        &env,
        &space.config,
        &registry,
        &mut QuietProgress,
        &["b".to_string()],
    )
    .unwrap();
    assert_eq!(summary.built, 2, "only b and its dependency should run");
}
