use crate::*;

#[test]
fn process_pool_builds_chain() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    let out = sandbox.lathe_ok(&["--backend", "processes"])?;
    assert_stdout(&out, "built 3 targets");

    let out = sandbox.lathe_ok(&["--backend", "processes"])?;
    assert_stdout(&out, "no work to do");
    Ok(())
}

#[test]
fn per_target_evaluator_override() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(
        "\
target a = 1
target b = a + 1
  evaluator = processes
",
    )?;
    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 2 targets");
    Ok(())
}

#[cfg(unix)]
#[test]
fn external_jobs_backend_round_trips() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    let out = sandbox.lathe_ok(&["--backend", "jobs", "--job-submit", "/bin/sh"])?;
    assert_stdout(&out, "built 3 targets");
    Ok(())
}

#[cfg(unix)]
#[test]
fn external_jobs_honor_a_custom_template() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target only = 11\n")?;
    sandbox.write(
        "job.tmpl",
        "#!/bin/sh\necho launching $target >> jobs.log\n$worker_cmd\n",
    )?;
    let out = sandbox.lathe_ok(&[
        "--backend",
        "jobs",
        "--job-submit",
        "/bin/sh",
        "--job-template",
        "job.tmpl",
    ])?;
    assert_stdout(&out, "built 1 target");
    let log = sandbox.read_to_string("jobs.log")?;
    assert!(log.contains("launching only"), "unexpected log: {}", log);
    Ok(())
}

#[test]
fn staged_scheduler_via_flag() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    let out = sandbox.lathe_ok(&["--scheduler", "staged"])?;
    assert_stdout(&out, "built 3 targets");
    let out = sandbox.lathe_ok(&["--scheduler", "staged"])?;
    assert_stdout(&out, "no work to do");
    Ok(())
}

#[test]
fn master_caching_flag() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    let out = sandbox.lathe_ok(&["--caching", "master"])?;
    assert_stdout(&out, "built 3 targets");
    Ok(())
}
