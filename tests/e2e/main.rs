//! Support code for e2e tests: drive the lathe binary against real plan
//! files in throwaway directories.

mod backends;
mod basic;
mod errors;

use std::process::Output;

pub const CHAIN_PLAN: &str = "\
target a = 1
target b = a + 1
target c = b * 2
";

/// A scratch directory seeded with a plan file; every lathe invocation runs
/// with it as the working directory, so `plan.lathe`, input files and the
/// `.lathe` cache all live and die together.
pub struct Sandbox {
    dir: tempfile::TempDir,
}

impl Sandbox {
    pub fn with_plan(plan: &str) -> anyhow::Result<Sandbox> {
        let sandbox = Sandbox {
            dir: tempfile::tempdir()?,
        };
        sandbox.write("plan.lathe", plan)?;
        Ok(sandbox)
    }

    pub fn write(&self, path: &str, content: &str) -> std::io::Result<()> {
        std::fs::write(self.dir.path().join(path), content)
    }

    pub fn read_to_string(&self, path: &str) -> std::io::Result<String> {
        std::fs::read_to_string(self.dir.path().join(path))
    }

    /// Run the lathe binary with the given arguments.
    pub fn lathe(&self, args: &[&str]) -> std::io::Result<Output> {
        std::process::Command::new(binary_path())
            .args(args)
            .current_dir(self.dir.path())
            .output()
    }

    /// Run lathe and require success, echoing its output into the test log
    /// on failure so the build's own message shows up.
    pub fn lathe_ok(&self, args: &[&str]) -> anyhow::Result<Output> {
        let out = self.lathe(args)?;
        if !out.status.success() {
            // print! rather than raw stdout so the test framework captures it.
            print!("{}", String::from_utf8_lossy(&out.stdout));
            print!("{}", String::from_utf8_lossy(&out.stderr));
            anyhow::bail!("lathe {:?} failed with {}", args, out.status);
        }
        Ok(out)
    }
}

/// The binary sits two levels above the test executable
/// (target/debug/deps/e2e-* -> target/debug/lathe).
fn binary_path() -> std::path::PathBuf {
    let mut path = std::env::current_exe().expect("test binary path");
    path.pop();
    path.pop();
    path.join("lathe")
}

pub fn stdout_of(out: &Output) -> String {
    String::from_utf8_lossy(&out.stdout).into_owned()
}

pub fn assert_stdout(out: &Output, needle: &str) {
    let stdout = stdout_of(out);
    assert!(
        stdout.contains(needle),
        "expected {:?} in output:\n{}",
        needle,
        stdout
    );
}
