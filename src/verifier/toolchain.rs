// src/verifier/toolchain.rs
//
// Everything the verifier needs from the outside world: cargo, clippy,
// the built binary and valgrind. Each call returns an already-classified
// result so the stage machine never looks at raw exit codes.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use tracing::debug;

use crate::combine::PACKAGE_NAME;
use crate::config::VerifierConfig;
use crate::error::ExecError;
use crate::executor::{case_command, run_command, wrap_command, CancelToken, CommandSpec, ExecStatus};
use crate::state::FeedMode;

pub const VALGRIND_FLAGS: [&str; 3] = ["--error-exitcode=1", "--leak-check=no", "--trace-children=yes"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutput {
    pub passed: bool,
    pub log: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LintReport {
    pub errors: usize,
    pub warnings: usize,
    pub log: String,
    /// clippy is not installed.
    pub skipped: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaseRun {
    /// Exit code is informational; only stdout is compared.
    Finished { exit: i32, stdout: String },
    TimedOut,
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemcheckRun {
    Clean,
    Errors(String),
    TimedOut,
    Unavailable,
    Cancelled,
}

pub trait Toolchain: Send + Sync {
    fn build(&self, package: &Path) -> Result<StepOutput, ExecError>;
    fn lint(&self, package: &Path) -> Result<LintReport, ExecError>;
    fn binary(&self, package: &Path) -> PathBuf;
    fn run_case(&self, binary: &Path, input: &str, feed: FeedMode) -> Result<CaseRun, ExecError>;
    fn memcheck(&self, binary: &Path, input: &str, feed: FeedMode) -> Result<MemcheckRun, ExecError>;
}

/* ============================================================
   cargo + valgrind
   ============================================================ */

pub struct CargoToolchain {
    cfg: VerifierConfig,
    cancel: CancelToken,
}

impl CargoToolchain {
    pub fn new(cfg: VerifierConfig, cancel: CancelToken) -> Self {
        Self { cfg, cancel }
    }

    fn cargo(&self, package: &Path, subcommand: &str) -> CommandSpec {
        CommandSpec::new(&self.cfg.cargo, self.cfg.build_timeout())
            .arg(subcommand)
            .arg("--message-format")
            .arg("short")
            .cwd(package)
            .env("CARGO_TERM_COLOR", "never")
    }
}

impl Toolchain for CargoToolchain {
    fn build(&self, package: &Path) -> Result<StepOutput, ExecError> {
        let out = run_command(&self.cargo(package, "build"), &self.cancel)?;
        debug!(package = %package.display(), status = ?out.status, "cargo build");

        Ok(match out.status {
            ExecStatus::Exited(0) => StepOutput {
                passed: true,
                log: out.stderr,
            },
            ExecStatus::Exited(_) => StepOutput {
                passed: false,
                log: out.combined(),
            },
            ExecStatus::TimedOut => StepOutput {
                passed: false,
                log: format!("cargo build timed out after {:?}", self.cfg.build_timeout()),
            },
            ExecStatus::Cancelled => StepOutput {
                passed: false,
                log: "cancelled".into(),
            },
        })
    }

    fn lint(&self, package: &Path) -> Result<LintReport, ExecError> {
        let out = run_command(&self.cargo(package, "clippy"), &self.cancel)?;

        if out.stderr.contains("no such command") {
            return Ok(LintReport {
                errors: 0,
                warnings: 0,
                log: out.stderr,
                skipped: true,
            });
        }

        let (errors, warnings) = count_diagnostics(&out.stderr);
        let errors = match out.status {
            // A failed run with nothing countable still fails the lint.
            ExecStatus::Exited(code) if code != 0 && errors == 0 => 1,
            ExecStatus::TimedOut => 1,
            _ => errors,
        };

        Ok(LintReport {
            errors,
            warnings,
            log: out.combined(),
            skipped: false,
        })
    }

    fn binary(&self, package: &Path) -> PathBuf {
        package.join("target").join("debug").join(PACKAGE_NAME)
    }

    fn run_case(&self, binary: &Path, input: &str, feed: FeedMode) -> Result<CaseRun, ExecError> {
        let spec = case_command(binary, input, feed, self.cfg.case_timeout());
        let out = run_command(&spec, &self.cancel)?;
        debug!(status = ?out.status, elapsed_ms = out.duration.as_millis() as u64, "test case ran");

        Ok(match out.status {
            ExecStatus::Exited(exit) => CaseRun::Finished {
                exit,
                stdout: out.stdout,
            },
            ExecStatus::TimedOut => CaseRun::TimedOut,
            ExecStatus::Cancelled => CaseRun::Cancelled,
        })
    }

    fn memcheck(&self, binary: &Path, input: &str, feed: FeedMode) -> Result<MemcheckRun, ExecError> {
        let base = case_command(binary, input, feed, self.cfg.memcheck_timeout());
        let spec = wrap_command(&self.cfg.valgrind, &VALGRIND_FLAGS, base, self.cfg.memcheck_timeout());

        let out = match run_command(&spec, &self.cancel) {
            Ok(out) => out,
            Err(e) if e.is_not_found() => return Ok(MemcheckRun::Unavailable),
            Err(e) => return Err(e),
        };

        Ok(match out.status {
            ExecStatus::TimedOut => MemcheckRun::TimedOut,
            ExecStatus::Cancelled => MemcheckRun::Cancelled,
            ExecStatus::Exited(_) if memcheck_errors(&out.stderr) > 0 => {
                MemcheckRun::Errors(out.stderr)
            }
            ExecStatus::Exited(_) => MemcheckRun::Clean,
        })
    }
}

/* ============================================================
   Output parsing
   ============================================================ */

/// (errors, warnings) in `cargo --message-format short` output. Summary
/// lines (`could not compile`, `generated N warnings`) are not counted.
pub fn count_diagnostics(output: &str) -> (usize, usize) {
    static ERR: OnceLock<Regex> = OnceLock::new();
    static WARN: OnceLock<Regex> = OnceLock::new();
    static SUMMARY: OnceLock<Regex> = OnceLock::new();

    let err = ERR.get_or_init(|| Regex::new(r"(?m)^(?:[^\s:]+:\d+:\d+: )?error(\[\w+\])?: ").expect("error pattern is valid"));
    let warn = WARN.get_or_init(|| Regex::new(r"(?m)^(?:[^\s:]+:\d+:\d+: )?warning(\[\w+\])?: ").expect("warning pattern is valid"));
    let summary = SUMMARY.get_or_init(|| {
        Regex::new(r"could not compile|generated \d+ warnings?|aborting due to").expect("summary pattern is valid")
    });

    let mut errors = 0;
    let mut warnings = 0;

    for line in output.lines() {
        if summary.is_match(line) {
            continue;
        }
        if err.is_match(line) {
            errors += 1;
        } else if warn.is_match(line) {
            warnings += 1;
        }
    }

    (errors, warnings)
}

/// Error count from valgrind's `ERROR SUMMARY` line(s).
pub fn memcheck_errors(stderr: &str) -> usize {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"ERROR SUMMARY:\s+(\d+) errors?").expect("summary pattern is valid"));

    let from_summary: usize = re
        .captures_iter(stderr)
        .filter_map(|c| c.get(1)?.as_str().parse::<usize>().ok())
        .sum();

    // No summary when valgrind itself was cut short.
    if from_summary == 0 && stderr.lines().any(|l| l.starts_with("==") && l.contains("Invalid")) {
        return 1;
    }
    from_summary
}
