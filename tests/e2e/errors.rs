use crate::*;

#[test]
fn cycle_aborts_with_exit_2() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = b\ntarget b = a\n")?;
    let out = sandbox.lathe(&[])?;
    assert_eq!(out.status.code(), Some(2));
    assert_stdout(&out, "cyclic plan");
    Ok(())
}

#[test]
fn duplicate_target_aborts_with_exit_2() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = 1\ntarget a = 2\n")?;
    let out = sandbox.lathe(&[])?;
    assert_eq!(out.status.code(), Some(2));
    assert_stdout(&out, "name collision");
    Ok(())
}

#[test]
fn parse_error_aborts() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target = oops\n")?;
    let out = sandbox.lathe(&[])?;
    assert_eq!(out.status.code(), Some(2));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(
        stderr.contains("parse error"),
        "unexpected stderr: {}",
        stderr
    );
    Ok(())
}

#[test]
fn failing_target_exits_1() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target bad = 1 / 0\n")?;
    let out = sandbox.lathe(&[])?;
    assert_eq!(out.status.code(), Some(1));
    assert_stdout(&out, "failed: bad");
    Ok(())
}

#[test]
fn keep_going_builds_whatever_it_can() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan(
        "\
target bad = 1 / 0
target child = bad + 1
target other = 10
",
    )?;
    let out = sandbox.lathe(&["-k"])?;
    assert_eq!(out.status.code(), Some(1));
    assert_stdout(&out, "failed: bad");
    assert_stdout(&out, "skipped: child");
    assert_stdout(&out, "1 failed, 1 built");
    Ok(())
}

#[test]
fn unknown_target_request_aborts() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = 1\n")?;
    let out = sandbox.lathe(&["nonesuch"])?;
    assert_eq!(out.status.code(), Some(2));
    Ok(())
}

#[test]
fn strict_mode_rejects_unknown_identifiers() -> anyhow::Result<()> {
    let sandbox = Sandbox::with_plan("target a = mystery + 1\n")?;
    let out = sandbox.lathe(&["--strict"])?;
    assert_eq!(out.status.code(), Some(2));

    // Without strict it's only a warning; the target then fails at eval
    // time because the identifier has no value.
    let out = sandbox.lathe(&[])?;
    assert_eq!(out.status.code(), Some(1));
    Ok(())
}
