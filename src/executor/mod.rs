pub mod run;

use std::path::Path;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

pub use run::{run_command, CommandSpec, ExecStatus};

use crate::state::FeedMode;

/// Shared abort flag. Checked by every running subprocess loop.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

/// Command for one test case: whitespace-split arguments, or the input on
/// stdin with a trailing newline.
pub fn case_command(program: &Path, input: &str, feed: FeedMode, timeout: Duration) -> CommandSpec {
    let spec = CommandSpec::new(program.display().to_string(), timeout);

    match feed {
        FeedMode::Arguments => spec.args(input.split_whitespace()),
        FeedMode::Stdin => {
            let mut text = input.to_string();
            if !text.ends_with('\n') {
                text.push('\n');
            }
            spec.stdin(text)
        }
    }
}

/// Prefix `base` with `wrapper` (e.g. valgrind) and its flags.
pub fn wrap_command(wrapper: &str, flags: &[&str], base: CommandSpec, timeout: Duration) -> CommandSpec {
    let mut spec = CommandSpec::new(wrapper, timeout)
        .args(flags.iter().copied())
        .arg(base.program)
        .args(base.args);
    spec.stdin = base.stdin;
    spec.cwd = base.cwd;
    spec.env = base.env;
    spec
}
