use crate::*;

#[test]
fn empty_plan() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("")?;
    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "no work to do");
    Ok(())
}

#[test]
fn chain_builds_then_caches() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;

    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 3 targets");

    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "no work to do");
    Ok(())
}

#[test]
fn verbose_logs_each_target() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    let out = sandbox.lathe_ok(&["-v"])?;
    assert_stdout(&out, "building a");
    assert_stdout(&out, "building c");
    Ok(())
}

#[test]
fn requested_target_limits_build() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = 1\ntarget lone = 5\n")?;
    let out = sandbox.lathe_ok(&["lone"])?;
    assert_stdout(&out, "built 1 target");
    Ok(())
}

#[test]
fn stages_tool_prints_layers() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = 1\ntarget b = 2\ntarget c = a + b\n")?;
    let out = sandbox.lathe_ok(&["--stages"])?;
    assert_stdout(&out, "stage 1: a b");
    assert_stdout(&out, "stage 2: c");
    assert_stdout(&out, "max useful parallelism: 2");
    Ok(())
}

#[test]
fn file_dependency_rebuilds_on_change() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target y = read_file(file_in(\"in.txt\"))\n")?;
    sandbox.write("in.txt", "hello")?;

    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 1 target");

    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "no work to do");

    sandbox.write("in.txt", "world")?;
    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 1 target");
    Ok(())
}

#[test]
fn clean_discards_cached_results() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(CHAIN_PLAN)?;
    sandbox.lathe_ok(&[])?;

    sandbox.lathe_ok(&["--clean", "all"])?;
    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 3 targets");
    Ok(())
}

#[test]
fn generated_file_flows_between_targets() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(
        "\
target w = write_file(file_out(\"gen.txt\"), \"payload\")
target r = read_file(file_in(\"gen.txt\"))
",
    )?;
    let out = sandbox.lathe_ok(&[])?;
    assert_stdout(&out, "built 2 targets");
    assert_eq!(sandbox.read_to_string("gen.txt")?, "payload");
    Ok(())
}
