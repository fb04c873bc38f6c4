//! Build progress tracking and reporting, for display to the user.
//!
//! Every scheduler event (start, finish, skip, fail) lands here.  In
//! non-verbose mode only failures print; verbose mode logs every target.

use crate::work::{BuildState, StateCounts};
use std::collections::VecDeque;
use std::io::Write;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// The console style a run reports through, decided once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Console {
    /// Plain line-at-a-time output.
    Dumb,
    /// Overprinting status area with a progress bar.
    Fancy,
}

/// Overprinting needs stdout to be a terminal that isn't explicitly dumb.
pub fn pick_console() -> Console {
    if std::env::var_os("TERM").is_some_and(|term| term == "dumb") {
        return Console::Dumb;
    }
    if stdout_is_tty() {
        Console::Fancy
    } else {
        Console::Dumb
    }
}

#[cfg(unix)]
fn stdout_is_tty() -> bool {
    unsafe { libc::isatty(libc::STDOUT_FILENO) == 1 }
}

#[cfg(not(unix))]
fn stdout_is_tty() -> bool {
    false
}

/// Width of the console the progress area is drawn on (stdout), for
/// truncating status lines.  Unknown or absurdly narrow means None.
#[cfg(unix)]
fn console_width() -> Option<usize> {
    unsafe {
        let mut winsize = std::mem::zeroed::<libc::winsize>();
        if libc::ioctl(libc::STDOUT_FILENO, libc::TIOCGWINSZ, &mut winsize) != 0 {
            return None;
        }
        if winsize.ws_col < 10 {
            return None;
        }
        Some(winsize.ws_col as usize)
    }
}

#[cfg(not(unix))]
fn console_width() -> Option<usize> {
    None
}

/// How a target finished.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskStatus {
    /// Evaluated this run.
    Built { elapsed_ms: u64 },
    /// Cached result still valid; not evaluated.
    Cached,
    Failed { message: String },
    /// Not run because a dependency failed.
    Skipped,
}

/// Trait for build progress notifications.
pub trait Progress {
    /// Called as targets move through build states.
    fn update(&mut self, counts: &StateCounts);

    /// Called when a target starts evaluating.
    fn task_started(&mut self, name: &str);

    /// Called when a target reaches a terminal state.
    fn task_finished(&mut self, name: &str, status: &TaskStatus);

    /// Log a line of output without corrupting the progress display.
    fn log(&mut self, msg: &str);
}

/// Progress that swallows everything; library embedders that do their own
/// reporting start here.
#[derive(Default)]
pub struct QuietProgress;

impl Progress for QuietProgress {
    fn update(&mut self, _counts: &StateCounts) {}
    fn task_started(&mut self, _name: &str) {}
    fn task_finished(&mut self, _name: &str, _status: &TaskStatus) {}
    fn log(&mut self, _msg: &str) {}
}

/// Progress implementation for "dumb" consoles, without any overprinting.
#[derive(Default)]
pub struct DumbConsoleProgress {
    verbose: bool,
}

impl DumbConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        Self { verbose }
    }
}

impl Progress for DumbConsoleProgress {
    fn update(&mut self, _counts: &StateCounts) {
        // ignore
    }

    fn task_started(&mut self, name: &str) {
        if self.verbose {
            self.log(&format!("building {}", name));
        }
    }

    fn task_finished(&mut self, name: &str, status: &TaskStatus) {
        match status {
            TaskStatus::Built { elapsed_ms } => {
                if self.verbose {
                    self.log(&format!("built {} ({}ms)", name, elapsed_ms));
                }
            }
            TaskStatus::Cached => {
                if self.verbose {
                    self.log(&format!("up to date: {}", name));
                }
            }
            TaskStatus::Failed { message } => self.log(&format!("failed: {}: {}", name, message)),
            TaskStatus::Skipped => self.log(&format!("skipped: {} (dependency failed)", name)),
        }
    }

    fn log(&mut self, msg: &str) {
        println!("{}", msg);
    }
}

/// Progress implementation for consoles supporting overprinting: a status
/// area with a progress bar and the oldest running targets, redrawn in
/// place.  Each print clears from the cursor down, prints, then moves the
/// cursor back up.
pub struct FancyConsoleProgress {
    state: Arc<Mutex<FancyState>>,
    dirty_cond: Arc<Condvar>,
}

/// Screen updates happen after this delay, to batch rapid updates and
/// reduce terminal flicker.
const UPDATE_DELAY: Duration = Duration::from_millis(50);

impl FancyConsoleProgress {
    pub fn new(verbose: bool) -> Self {
        let dirty_cond = Arc::new(Condvar::new());
        let state = Arc::new(Mutex::new(FancyState {
            done: false,
            dirty: false,
            counts: StateCounts::default(),
            tasks: VecDeque::new(),
            verbose,
        }));

        // Debounce thread: waits for a dirty notification (or a 500ms tick
        // so long-running task timers advance), then repaints.
        std::thread::spawn({
            let state = state.clone();
            let dirty_cond = dirty_cond.clone();
            move || loop {
                {
                    let (state, _) = dirty_cond
                        .wait_timeout_while(
                            state.lock().unwrap(),
                            Duration::from_millis(500),
                            |state| !state.dirty,
                        )
                        .unwrap();
                    if state.done {
                        break;
                    }
                }
                std::thread::sleep(UPDATE_DELAY);
                state.lock().unwrap().print_progress();
            }
        });

        FancyConsoleProgress { state, dirty_cond }
    }

    fn with_state(&self, f: impl FnOnce(&mut FancyState)) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
        state.dirty = true;
        self.dirty_cond.notify_one();
    }
}

impl Progress for FancyConsoleProgress {
    fn update(&mut self, counts: &StateCounts) {
        let counts = counts.clone();
        self.with_state(move |state| state.counts = counts);
    }

    fn task_started(&mut self, name: &str) {
        let name = name.to_owned();
        self.with_state(move |state| {
            if state.verbose {
                state.log(&format!("building {}", name));
            }
            state.tasks.push_back(RunningTask {
                name,
                start: Instant::now(),
            });
        });
    }

    fn task_finished(&mut self, name: &str, status: &TaskStatus) {
        let name = name.to_owned();
        let status = status.clone();
        self.with_state(move |state| {
            if let Some(pos) = state.tasks.iter().position(|t| t.name == name) {
                state.tasks.remove(pos);
            }
            match status {
                TaskStatus::Built { .. } | TaskStatus::Cached => {
                    if state.verbose {
                        state.log(&format!("done {}", name));
                    }
                }
                TaskStatus::Failed { message } => {
                    state.log(&format!("failed: {}: {}", name, message))
                }
                TaskStatus::Skipped => {
                    state.log(&format!("skipped: {} (dependency failed)", name))
                }
            }
        });
    }

    fn log(&mut self, msg: &str) {
        let msg = msg.to_owned();
        self.with_state(move |state| state.log(&msg));
    }
}

impl Drop for FancyConsoleProgress {
    fn drop(&mut self) {
        self.with_state(|state| state.cleanup());
    }
}

struct RunningTask {
    name: String,
    start: Instant,
}

struct FancyState {
    done: bool,
    dirty: bool,
    counts: StateCounts,
    /// Currently evaluating targets, oldest first.
    tasks: VecDeque<RunningTask>,
    verbose: bool,
}

impl FancyState {
    fn log(&mut self, msg: &str) {
        self.clear_progress();
        println!("{}", msg);
    }

    fn cleanup(&mut self) {
        self.clear_progress();
        self.done = true;
    }

    fn clear_progress(&self) {
        // \r first: a ctrl-c may have left characters on the line.
        std::io::stdout().write_all(b"\r\x1b[J").unwrap();
    }

    fn print_progress(&mut self) {
        self.clear_progress();
        let done = self.counts.get(BuildState::Built) + self.counts.get(BuildState::Skipped);
        let failed = self.counts.get(BuildState::Failed);
        let mut line = format!(
            "[{}] {}/{} done, ",
            progress_bar(&self.counts, 40),
            done + failed,
            self.counts.total()
        );
        if failed > 0 {
            line.push_str(&format!("{} failed, ", failed));
        }
        line.push_str(&format!("{} running", self.tasks.len()));
        println!("{}", line);
        let mut lines = 1;

        let max_cols = console_width().unwrap_or(80);
        let max_tasks = 8;
        let now = Instant::now();
        for task in self.tasks.iter().take(max_tasks) {
            let delta = now.duration_since(task.start).as_secs() as usize;
            println!("{}", task_message(&task.name, delta, max_cols));
            lines += 1;
        }
        if self.tasks.len() > max_tasks {
            println!("...and {} more", self.tasks.len() - max_tasks);
            lines += 1;
        }

        // Move cursor back up for overprinting.
        print!("\x1b[{}A", lines);
        self.dirty = false;
    }
}

/// Format a task status line: elapsed time when it gets interesting,
/// truncated to the terminal width.
fn task_message(name: &str, seconds: usize, max_cols: usize) -> String {
    let time_note = if seconds > 2 {
        format!(" ({}s)", seconds)
    } else {
        "".into()
    };
    let mut out = name.to_owned();
    if out.len() + time_note.len() >= max_cols {
        out.truncate(max_cols - time_note.len() - 3);
        out.push_str("...");
    }
    out.push_str(&time_note);
    out
}

/// Render StateCounts as an ASCII progress bar.
fn progress_bar(counts: &StateCounts, bar_size: usize) -> String {
    let mut bar = String::with_capacity(bar_size);
    let mut sum: usize = 0;
    let total = counts.total();
    if total == 0 {
        return " ".repeat(bar_size);
    }
    for (count, ch) in [
        (
            counts.get(BuildState::Built)
                + counts.get(BuildState::Failed)
                + counts.get(BuildState::Skipped),
            '=',
        ),
        (
            counts.get(BuildState::Ready) + counts.get(BuildState::Building),
            '-',
        ),
        (counts.get(BuildState::Pending), ' '),
    ] {
        sum += count;
        let mut target_size = sum * bar_size / total;
        if count > 0 && target_size == bar.len() && target_size < bar_size {
            // Always give a non-zero count at least one tick.
            target_size += 1;
        }
        while bar.len() < target_size {
            bar.push(ch);
        }
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_rendering() {
        let mut counts = StateCounts::default();

        // Don't crash when showing progress before any tasks exist.
        assert_eq!(progress_bar(&counts, 10), "          ");

        counts.add(BuildState::Pending, 100);
        assert_eq!(progress_bar(&counts, 10), "          ");

        // Half pending -> ready.
        for _ in 0..50 {
            counts.shift(BuildState::Pending, BuildState::Ready);
        }
        assert_eq!(progress_bar(&counts, 10), "-----     ");

        // One ready -> built.
        counts.shift(BuildState::Ready, BuildState::Built);
        assert_eq!(progress_bar(&counts, 10), "=----     ");

        // All but one pending -> ready.
        for _ in 0..49 {
            counts.shift(BuildState::Pending, BuildState::Ready);
        }
        assert_eq!(progress_bar(&counts, 10), "=-------- ");

        // Last pending -> ready.
        counts.shift(BuildState::Pending, BuildState::Ready);
        assert_eq!(progress_bar(&counts, 10), "=---------");
    }

    #[test]
    fn task_rendering() {
        assert_eq!(task_message("building foo", 0, 80), "building foo");
        assert_eq!(task_message("building foo", 0, 10), "buildin...");
    }

    #[test]
    fn task_rendering_with_time() {
        assert_eq!(task_message("building foo", 5, 80), "building foo (5s)");
        assert_eq!(task_message("building foo", 5, 10), "bu... (5s)");
    }
}
