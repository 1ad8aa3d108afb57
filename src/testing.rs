//! Scripted stand-ins for the model and the toolchain, shared by unit tests.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{ExecError, ProviderError};
use crate::llm::ModelClient;
use crate::state::FeedMode;
use crate::verifier::toolchain::{CaseRun, LintReport, MemcheckRun, StepOutput, Toolchain};

/* ============================================================
   Model
   ============================================================ */

pub enum Reply {
    Code(String),
    Quota,
    Fail(u16),
}

/// Replies in order; once the script runs out the last reply repeats.
pub struct ScriptedModel {
    name: String,
    script: Mutex<VecDeque<Reply>>,
    fallback: Mutex<Option<String>>,
    prompts: Mutex<Vec<String>>,
}

impl ScriptedModel {
    pub fn new(name: &str, replies: Vec<Reply>) -> Self {
        Self {
            name: name.to_string(),
            script: Mutex::new(replies.into()),
            fallback: Mutex::new(None),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Every call returns `code` in a fenced block.
    pub fn always(code: &str) -> Self {
        Self::new("scripted", vec![Reply::Code(code.to_string())])
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().unwrap().len()
    }
}

impl ModelClient for ScriptedModel {
    fn query(&self, _system: &str, user: &str) -> Result<String, ProviderError> {
        self.prompts.lock().unwrap().push(user.to_string());

        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(Reply::Code(code)) => {
                *self.fallback.lock().unwrap() = Some(code.clone());
                Ok(format!("```rust\n{}\n```", code))
            }
            Some(Reply::Quota) => Err(ProviderError::QuotaExceeded {
                backend: self.name.clone(),
                detail: "HTTP 429".into(),
            }),
            Some(Reply::Fail(status)) => Err(ProviderError::Status {
                backend: self.name.clone(),
                status,
                body: "boom".into(),
            }),
            None => match self.fallback.lock().unwrap().clone() {
                Some(code) => Ok(format!("```rust\n{}\n```", code)),
                None => Err(ProviderError::Malformed {
                    backend: self.name.clone(),
                    detail: "script exhausted".into(),
                }),
            },
        }
    }

    fn name(&self) -> String {
        self.name.clone()
    }
}

/* ============================================================
   Toolchain
   ============================================================ */

#[derive(Default)]
struct ToolState {
    broken_marker: Option<String>,
    overrides: HashMap<String, String>,
    timeouts: Vec<String>,
    memcheck: Option<MemcheckRun>,
    memcheck_calls: usize,
    lint_errors: usize,
    lint_warnings: usize,
    lint_skipped: bool,
    cases_run: Vec<String>,
    built: Vec<String>,
}

/// Builds succeed unless the source carries a marker; the "binary" echoes
/// its input unless told otherwise.
#[derive(Default)]
pub struct ScriptedToolchain {
    state: Mutex<ToolState>,
}

impl ScriptedToolchain {
    pub fn echo() -> Self {
        Self::default()
    }

    pub fn fail_builds_containing(&self, marker: &str) {
        self.state.lock().unwrap().broken_marker = Some(marker.to_string());
    }

    pub fn override_output(&self, input: &str, output: &str) {
        self.state
            .lock()
            .unwrap()
            .overrides
            .insert(input.to_string(), output.to_string());
    }

    pub fn time_out_on(&self, input: &str) {
        self.state.lock().unwrap().timeouts.push(input.to_string());
    }

    pub fn memcheck_reports(&self, report: &str) {
        self.memcheck_returns(MemcheckRun::Errors(report.to_string()));
    }

    pub fn memcheck_returns(&self, run: MemcheckRun) {
        self.state.lock().unwrap().memcheck = Some(run);
    }

    pub fn memcheck_calls(&self) -> usize {
        self.state.lock().unwrap().memcheck_calls
    }

    pub fn lint_errors(&self, n: usize) {
        self.state.lock().unwrap().lint_errors = n;
    }

    pub fn lint_warnings(&self, n: usize) {
        self.state.lock().unwrap().lint_warnings = n;
    }

    /// clippy reports itself missing.
    pub fn lint_unavailable(&self) {
        self.state.lock().unwrap().lint_skipped = true;
    }

    pub fn cases_run(&self) -> Vec<String> {
        self.state.lock().unwrap().cases_run.clone()
    }

    pub fn builds(&self) -> usize {
        self.state.lock().unwrap().built.len()
    }

    pub fn last_built(&self) -> Option<String> {
        self.state.lock().unwrap().built.last().cloned()
    }
}

impl Toolchain for ScriptedToolchain {
    fn build(&self, package: &Path) -> Result<StepOutput, ExecError> {
        let code = fs::read_to_string(package.join("src").join("main.rs")).unwrap_or_default();
        let mut st = self.state.lock().unwrap();
        st.built.push(code.clone());

        let broken = st
            .broken_marker
            .as_deref()
            .map(|m| code.contains(m))
            .unwrap_or(false);

        Ok(StepOutput {
            passed: !broken,
            log: if broken {
                "error[E0425]: cannot find value in this scope".into()
            } else {
                String::new()
            },
        })
    }

    fn lint(&self, _package: &Path) -> Result<LintReport, ExecError> {
        let st = self.state.lock().unwrap();
        if st.lint_skipped {
            return Ok(LintReport {
                errors: 0,
                warnings: 0,
                log: "error: no such command: `clippy`".into(),
                skipped: true,
            });
        }
        Ok(LintReport {
            errors: st.lint_errors,
            warnings: st.lint_warnings,
            log: format!("{} clippy errors, {} warnings", st.lint_errors, st.lint_warnings),
            skipped: false,
        })
    }

    fn binary(&self, package: &Path) -> PathBuf {
        package.join("scripted-bin")
    }

    fn run_case(&self, _binary: &Path, input: &str, _feed: FeedMode) -> Result<CaseRun, ExecError> {
        let mut st = self.state.lock().unwrap();
        st.cases_run.push(input.to_string());

        if st.timeouts.iter().any(|t| t == input) {
            return Ok(CaseRun::TimedOut);
        }

        let stdout = st
            .overrides
            .get(input)
            .cloned()
            .unwrap_or_else(|| format!("{}\n", input));
        Ok(CaseRun::Finished { exit: 0, stdout })
    }

    fn memcheck(&self, _binary: &Path, _input: &str, _feed: FeedMode) -> Result<MemcheckRun, ExecError> {
        let mut st = self.state.lock().unwrap();
        st.memcheck_calls += 1;
        Ok(st.memcheck.clone().unwrap_or(MemcheckRun::Clean))
    }
}
