// src/executor/run.rs
//
// Runs one subprocess: optional stdin, captured stdout/stderr, hard timeout.
// The exit status is classified here once; callers never scrape output to
// find out whether a process timed out or was cancelled.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::debug;

use super::CancelToken;
use crate::error::ExecError;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub stdin: Option<String>,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            stdin: None,
            env: Vec::new(),
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn display(&self) -> String {
        let mut s = self.program.clone();
        for a in &self.args {
            s.push(' ');
            s.push_str(a);
        }
        s
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecStatus {
    /// Exit code; -1 when terminated by a signal.
    Exited(i32),
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub status: ExecStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl ExecOutput {
    /// stdout then stderr, for diagnostics.
    pub fn combined(&self) -> String {
        let mut out = String::new();

        if !self.stdout.trim().is_empty() {
            out.push_str("=== STDOUT ===\n");
            out.push_str(self.stdout.trim());
            out.push('\n');
        }

        if !self.stderr.trim().is_empty() {
            out.push_str("=== STDERR ===\n");
            out.push_str(self.stderr.trim());
        }

        out
    }
}

/// Run `spec` to completion, killing the child on timeout or cancellation.
pub fn run_command(spec: &CommandSpec, cancel: &CancelToken) -> Result<ExecOutput, ExecError> {
    let started = Instant::now();

    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(if spec.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    if let Some(dir) = &spec.cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in &spec.env {
        cmd.env(k, v);
    }

    // Own process group, so a timeout also takes down grandchildren
    // (rustc under cargo, the program under valgrind).
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!(command = %spec.display(), "spawning");

    let mut child = cmd.spawn().map_err(|source| ExecError::Spawn {
        program: spec.program.clone(),
        source,
    })?;

    let writer = feed_stdin(&mut child, spec.stdin.clone());
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());

    let status = loop {
        if cancel.is_cancelled() {
            kill(&mut child);
            break ExecStatus::Cancelled;
        }

        match child.try_wait() {
            Ok(Some(status)) => break ExecStatus::Exited(status.code().unwrap_or(-1)),
            Ok(None) if started.elapsed() >= spec.timeout => {
                kill(&mut child);
                break ExecStatus::TimedOut;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                kill(&mut child);
                return Err(ExecError::Io {
                    program: spec.program.clone(),
                    source,
                });
            }
        }
    };

    let duration = started.elapsed();

    if let Some(w) = writer {
        if w.join().is_err() {
            debug!(command = %spec.program, "stdin writer panicked");
        }
    }

    Ok(ExecOutput {
        status,
        stdout: join_output(stdout),
        stderr: join_output(stderr),
        duration,
    })
}

fn feed_stdin(child: &mut Child, input: Option<String>) -> Option<JoinHandle<()>> {
    let input = input?;
    let mut pipe = child.stdin.take()?;

    Some(thread::spawn(move || {
        // A closed pipe just means the program stopped reading early.
        if let Err(e) = pipe.write_all(input.as_bytes()).and_then(|_| pipe.flush()) {
            debug!(error = %e, "stdin closed before all input was written");
        }
    }))
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<JoinHandle<Vec<u8>>> {
    let mut pipe = pipe?;
    Some(thread::spawn(move || {
        let mut buf = Vec::new();
        if let Err(e) = pipe.read_to_end(&mut buf) {
            debug!(error = %e, read = buf.len(), "output pipe read failed");
        }
        buf
    }))
}

fn join_output(handle: Option<JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        .unwrap_or_default()
}

fn kill(child: &mut Child) {
    #[cfg(unix)]
    {
        // Negative pid: the whole group created by `process_group(0)`.
        let pgid = child.id() as libc::pid_t;
        unsafe {
            if libc::kill(-pgid, libc::SIGKILL) != 0 {
                debug!(pgid, error = %std::io::Error::last_os_error(), "process group kill failed");
            }
        }
    }

    if let Err(e) = child.kill() {
        debug!(pid = child.id(), error = %e, "kill after group signal");
    }
    if let Err(e) = child.wait() {
        debug!(pid = child.id(), error = %e, "reaping killed child");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str, timeout: Duration) -> CommandSpec {
        CommandSpec::new("sh", timeout).arg("-c").arg(script)
    }

    #[test]
    fn captures_stdout_and_exit_code() {
        let out = run_command(&sh("echo hi; exit 3", Duration::from_secs(5)), &CancelToken::new())
            .unwrap();
        assert_eq!(out.status, ExecStatus::Exited(3));
        assert_eq!(out.stdout.trim(), "hi");
    }

    #[test]
    fn feeds_stdin() {
        let spec = CommandSpec::new("cat", Duration::from_secs(5)).stdin("5\n");
        let out = run_command(&spec, &CancelToken::new()).unwrap();
        assert_eq!(out.status, ExecStatus::Exited(0));
        assert_eq!(out.stdout, "5\n");
    }

    #[test]
    fn kills_on_timeout() {
        let out = run_command(&sh("exec sleep 5", Duration::from_millis(100)), &CancelToken::new())
            .unwrap();
        assert_eq!(out.status, ExecStatus::TimedOut);
        assert!(out.duration < Duration::from_secs(4));
    }

    #[test]
    fn cancelled_token_stops_process() {
        let cancel = CancelToken::new();
        cancel.cancel();
        let out = run_command(&sh("exec sleep 5", Duration::from_secs(10)), &cancel).unwrap();
        assert_eq!(out.status, ExecStatus::Cancelled);
    }

    #[test]
    fn cancel_mid_run_kills_child() {
        let cancel = CancelToken::new();
        let trigger = cancel.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });

        let out = run_command(&sh("echo started; exec sleep 30", Duration::from_secs(60)), &cancel)
            .unwrap();
        canceller.join().unwrap();

        assert_eq!(out.status, ExecStatus::Cancelled);
        assert!(out.duration < Duration::from_secs(10));
        assert_eq!(out.stdout.trim(), "started");
    }

    #[test]
    fn timeout_takes_down_grandchildren() {
        // The grandchild holds stdout open; output collection would hang
        // until it exits if only the direct child were killed.
        let started = Instant::now();
        let out = run_command(&sh("sleep 30 & wait", Duration::from_millis(200)), &CancelToken::new())
            .unwrap();
        assert_eq!(out.status, ExecStatus::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let spec = CommandSpec::new("osmoport-definitely-missing", Duration::from_secs(1));
        let err = run_command(&spec, &CancelToken::new()).unwrap_err();
        assert!(err.is_not_found());
    }
}
