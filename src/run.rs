//! Command-line driver: flag parsing, plan loading, progress selection,
//! exit codes.  Also hosts the hidden worker modes the process and job
//! backends re-invoke this binary in.

use crate::config::{Config, Scheduler};
use crate::env::Environment;
use crate::error::EngineError;
use crate::graph::{self, Trigger};
use crate::hash::{LongAlgo, ShortAlgo};
use crate::parse;
use crate::progress::{self, Console, DumbConsoleProgress, FancyConsoleProgress, Progress};
use crate::store::Store;
use crate::subdoc::FencedCodeExtractor;
use crate::task::{self, CachingSite, WorkItem};
use crate::{signal, trace, work};
use anyhow::{anyhow, bail, Context};
use std::io::{Read, Write};
use std::path::Path;
use std::str::FromStr;

#[derive(argh::FromArgs)] // this struct generates the flags and --help output
/// lathe, a reproducible workflow engine
struct Opts {
    /// chdir before running
    #[argh(option, short = 'C')]
    chdir: Option<String>,

    /// input plan file [default=plan.lathe]
    #[argh(option, short = 'f', default = "(\"plan.lathe\".into())")]
    plan_file: String,

    /// cache directory [default=.lathe]
    #[argh(option, default = "(\".lathe\".into())")]
    cache: String,

    /// dispatch backend: local, processes, jobs [default=local]
    #[argh(option, default = "(\"local\".into())")]
    backend: String,

    /// scheduling strategy: dynamic or staged [default=dynamic]
    #[argh(option, default = "(\"dynamic\".into())")]
    scheduler: String,

    /// parallelism [default uses system thread count]
    #[argh(option, short = 'j')]
    parallelism: Option<usize>,

    /// keep going after target failures
    #[argh(switch, short = 'k')]
    keep_going: bool,

    /// default trigger for targets that don't set one [default=any]
    #[argh(option)]
    trigger: Option<String>,

    /// caching site: worker or master [default: backend's choice]
    #[argh(option)]
    caching: Option<String>,

    /// base seed for reproducible evaluation [default=0]
    #[argh(option, default = "0")]
    seed: u64,

    /// short hash algorithm [default=fnv64]
    #[argh(option, default = "(\"fnv64\".into())")]
    short_hash: String,

    /// long hash algorithm [default=sha256]
    #[argh(option, default = "(\"sha256\".into())")]
    long_hash: String,

    /// treat unknown identifiers in commands as fatal
    #[argh(switch)]
    strict: bool,

    /// keep meta records for failed targets
    #[argh(switch)]
    record_failed_meta: bool,

    /// per-target timeout in seconds
    #[argh(option)]
    timeout: Option<u64>,

    /// submit command for the jobs backend [default=/bin/sh]
    #[argh(option)]
    job_submit: Option<String>,

    /// job script template file for the jobs backend
    #[argh(option)]
    job_template: Option<String>,

    /// clean cached state ("all" or a target name) and exit
    #[argh(option)]
    clean: Option<String>,

    /// print parallel stages and exit
    #[argh(switch)]
    stages: bool,

    /// print per-target progress
    #[argh(switch, short = 'v')]
    verbose: bool,

    /// debugging tools
    #[argh(option, short = 'd')]
    debug: Option<String>,

    /// run as a worker reading a work item from stdin (internal)
    #[argh(switch, hidden_help)]
    worker: bool,

    /// work item path for job workers (internal)
    #[argh(option, hidden_help)]
    worker_item: Option<String>,

    /// outcome path for job workers (internal)
    #[argh(option, hidden_help)]
    worker_out: Option<String>,

    /// targets to build [default: all]
    #[argh(positional)]
    targets: Vec<String>,
}

/// Worker mode for the process pool: item on stdin, outcome on stdout.
fn run_stdin_worker() -> anyhow::Result<i32> {
    let mut input = Vec::new();
    std::io::stdin().read_to_end(&mut input)?;
    let item: WorkItem = serde_json::from_slice(&input).context("parse work item")?;
    let outcome = task::execute(&item);
    let out = serde_json::to_vec(&outcome)?;
    std::io::stdout().write_all(&out)?;
    Ok(0)
}

/// Worker mode for external jobs: item and outcome as files.  The outcome
/// is staged and renamed so its appearance is atomic; the file itself is
/// the job's completion sentinel.
fn run_file_worker(item_path: &str, out_path: &str) -> anyhow::Result<i32> {
    let input = std::fs::read(item_path).with_context(|| format!("read {}", item_path))?;
    let item: WorkItem = serde_json::from_slice(&input).context("parse work item")?;
    let outcome = task::execute(&item);
    let staged = format!("{}.tmp{}", out_path, std::process::id());
    std::fs::write(&staged, serde_json::to_vec(&outcome)?)?;
    std::fs::rename(&staged, out_path)?;
    Ok(0)
}

fn config_from_opts(opts: &Opts) -> anyhow::Result<Config> {
    let parallelism = match opts.parallelism {
        Some(p) => p,
        None => usize::from(std::thread::available_parallelism()?),
    };
    let job_template = match &opts.job_template {
        Some(path) => {
            Some(std::fs::read_to_string(path).with_context(|| format!("read {}", path))?)
        }
        None => None,
    };
    Ok(Config {
        parallelism: opts.backend.clone(),
        max_parallel: parallelism,
        trigger_default: match &opts.trigger {
            Some(text) => Trigger::from_str(text).map_err(|err| anyhow!(err))?,
            None => Trigger::Any,
        },
        cache_dir: opts.cache.clone().into(),
        keep_going: opts.keep_going,
        caching: match opts.caching.as_deref() {
            None => None,
            Some("worker") => Some(CachingSite::Worker),
            Some("master") => Some(CachingSite::Master),
            Some(other) => bail!("unknown caching site {:?}", other),
        },
        root_seed: opts.seed,
        short_hash: ShortAlgo::from_str(&opts.short_hash).map_err(|err| anyhow!(err))?,
        long_hash: LongAlgo::from_str(&opts.long_hash).map_err(|err| anyhow!(err))?,
        strict: opts.strict,
        record_failed_meta: opts.record_failed_meta,
        timeout: opts.timeout.map(std::time::Duration::from_secs),
        verbose: opts.verbose,
        scheduler: match opts.scheduler.as_str() {
            "dynamic" => Scheduler::Dynamic,
            "staged" => Scheduler::Staged,
            other => bail!("unknown scheduler {:?}", other),
        },
        hash_file_contents: true,
        job_submit: opts.job_submit.clone().unwrap_or_else(|| "/bin/sh".into()),
        job_template,
    })
}

fn run_impl() -> anyhow::Result<i32> {
    let opts: Opts = argh::from_env();

    if opts.worker {
        return run_stdin_worker();
    }
    if let (Some(item), Some(out)) = (&opts.worker_item, &opts.worker_out) {
        return run_file_worker(item, out);
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    if let Some(dir) = &opts.chdir {
        std::env::set_current_dir(dir).map_err(|err| anyhow!("chdir {:?}: {}", dir, err))?;
    }

    if let Some(debug) = &opts.debug {
        match debug.as_str() {
            "list" => {
                println!("debug tools:");
                println!("  trace  generate json performance trace");
                return Ok(1);
            }
            "trace" => trace::open("trace.json")?,
            _ => bail!("unknown -d {:?}, use -d list to list", debug),
        }
    }

    let config = config_from_opts(&opts)?;

    if let Some(what) = &opts.clean {
        let store = Store::open(&config.cache_dir, &config.hashers())?;
        match what.as_str() {
            "all" => store.clean(None)?,
            name => store.clean(Some(name))?,
        }
        return Ok(0);
    }

    let plan_text = std::fs::read_to_string(&opts.plan_file)
        .map_err(|err| anyhow!("read {}: {}", opts.plan_file, err))?;
    let plan = trace::scope("load", || {
        parse::parse_plan(Path::new(&opts.plan_file), &plan_text)
    })
    .map_err(EngineError::Parse)?;
    let env = Environment::from_decls(&plan.imports)?;

    if opts.stages {
        return print_stages(&plan, &env, &config);
    }

    signal::install();
    let registry = config.default_registry()?;

    let mut dumb;
    let mut fancy;
    let progress: &mut dyn Progress = match progress::pick_console() {
        Console::Fancy => {
            fancy = FancyConsoleProgress::new(opts.verbose);
            &mut fancy
        }
        Console::Dumb => {
            dumb = DumbConsoleProgress::new(opts.verbose);
            &mut dumb
        }
    };

    let result = trace::scope("build", || {
        work::build(&plan, &env, &config, &registry, progress, &opts.targets)
    });
    match result {
        Ok(summary) => {
            if summary.failed > 0 {
                println!(
                    "lathe: {} failed, {} built, {} skipped",
                    summary.failed, summary.built, summary.skipped
                );
                return Ok(1);
            }
            if summary.built == 0 {
                // Special case: don't print numbers when no work was done.
                println!("lathe: no work to do");
            } else {
                println!(
                    "lathe: built {} target{}, {} up to date",
                    summary.built,
                    if summary.built == 1 { "" } else { "s" },
                    summary.skipped
                );
            }
            Ok(0)
        }
        Err(err) => {
            println!("lathe: {}", err);
            Ok(err.exit_code())
        }
    }
}

/// Inspection tool: the staged scheduler's view of the pending run.
fn print_stages(plan: &parse::Plan, env: &Environment, config: &Config) -> anyhow::Result<i32> {
    let pg = graph::build_graph(
        plan,
        env,
        &FencedCodeExtractor,
        config.trigger_default,
        config.strict,
    )?;
    let hashers = config.hashers();
    let store = Store::open(&config.cache_dir, &hashers)?;
    let oracle = crate::stale::Oracle {
        graph: &pg.graph,
        depsets: &pg.depsets,
        env,
        store: &store,
        hashers: &hashers,
        hash_file_contents: config.hash_file_contents,
    };
    let outdated = oracle.outdated_set()?;
    let stages = pg.graph.parallel_stages(&outdated);
    for (i, stage) in stages.iter().enumerate() {
        let names: Vec<&str> = stage
            .iter()
            .map(|&id| pg.graph.node(id).name.as_str())
            .collect();
        println!("stage {}: {}", i + 1, names.join(" "));
    }
    println!(
        "max useful parallelism: {}",
        pg.graph.max_useful_parallelism(&outdated)
    );
    Ok(0)
}

pub fn run() -> anyhow::Result<i32> {
    let res = run_impl();
    trace::close()?;
    res
}
