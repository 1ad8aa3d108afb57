//! Verifier: staged checks over one candidate.
//!
//! build -> safety lint (idiomatic) -> functional tests -> memcheck
//! (unidiomatic). The first failing stage decides the outcome.

pub mod toolchain;

use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::combine::{assemble, package_sources, write_package};
use crate::config::VerifierConfig;
use crate::detectors::ast::find_unsafe;
use crate::error::VerifyError;
use crate::executor::CancelToken;
use crate::llm::prompt::DependencyCode;
use crate::state::{Candidate, Phase, TestSuite, VerificationOutcome};

pub use toolchain::{CargoToolchain, CaseRun, MemcheckRun, Toolchain};

pub struct VerificationRequest<'a> {
    pub candidate: &'a Candidate,
    /// Accepted translations the candidate builds against.
    pub dependencies: &'a [DependencyCode],
    /// Present for units that own the program entry point.
    pub suite: Option<&'a TestSuite>,
    pub build_dir: &'a Path,
}

pub struct Verifier {
    toolchain: Arc<dyn Toolchain>,
    cfg: VerifierConfig,
    cancel: CancelToken,
    memcheck_missing: AtomicBool,
}

impl Verifier {
    pub fn new(toolchain: Arc<dyn Toolchain>, cfg: VerifierConfig, cancel: CancelToken) -> Self {
        Self {
            toolchain,
            cfg,
            cancel,
            memcheck_missing: AtomicBool::new(false),
        }
    }

    pub fn verify(&self, req: &VerificationRequest<'_>) -> Result<VerificationOutcome, VerifyError> {
        let phase = req.candidate.phase;
        let unit = req.candidate.unit_id.as_str();
        let attempt = req.candidate.attempt;

        /* ---------- build ---------- */
        let mut parts: Vec<&str> = req.dependencies.iter().map(|d| d.code.as_str()).collect();
        parts.push(req.candidate.code.as_str());
        let code = assemble(&parts, req.suite.is_none());

        if req.build_dir.join("src").exists() {
            fs::remove_dir_all(req.build_dir.join("src"))?;
        }
        write_package(req.build_dir, &code, &self.cfg.edition)?;

        let built = self.toolchain.build(req.build_dir)?;
        self.check_cancel()?;
        if !built.passed {
            debug!(unit, %phase, attempt, "build failed");
            return Ok(VerificationOutcome::CompileError(built.log));
        }

        /* ---------- safety lint ---------- */
        if phase == Phase::Idiomatic {
            if let Some(outcome) = self.safety_lint(req.build_dir)? {
                return Ok(outcome);
            }
        }

        let Some(suite) = req.suite else {
            return Ok(VerificationOutcome::Success);
        };
        if !suite.is_resolved() {
            let index = suite
                .cases
                .iter()
                .position(|c| c.expected_output.is_none())
                .unwrap_or_default();
            return Err(VerifyError::UnresolvedCase { index });
        }
        let binary = self.toolchain.binary(req.build_dir);

        /* ---------- functional ---------- */
        for (index, case) in suite.cases.iter().enumerate() {
            let expected = case.expected_output.as_deref().unwrap_or_default().trim();

            match self.toolchain.run_case(&binary, &case.input, suite.feed)? {
                CaseRun::Finished { stdout, exit } => {
                    let actual = stdout.trim();
                    if actual != expected {
                        debug!(unit, %phase, attempt, index, exit, "output mismatch");
                        return Ok(VerificationOutcome::TestFailure {
                            index,
                            actual: actual.to_string(),
                            expected: expected.to_string(),
                        });
                    }
                }
                CaseRun::TimedOut => return Ok(VerificationOutcome::TestTimeout { index }),
                CaseRun::Cancelled => return Err(VerifyError::Cancelled),
            }
        }

        /* ---------- memcheck ---------- */
        if phase == Phase::Unidiomatic && self.cfg.memcheck {
            if let Some(outcome) = self.memcheck(&binary, suite)? {
                return Ok(outcome);
            }
        }

        info!(unit, %phase, attempt, cases = suite.len(), "candidate verified");
        Ok(VerificationOutcome::Success)
    }

    fn safety_lint(&self, package: &Path) -> Result<Option<VerificationOutcome>, VerifyError> {
        let mut sites = Vec::new();

        for file in package_sources(package) {
            let text = fs::read_to_string(&file)?;
            let found: Vec<(usize, String)> = match find_unsafe(&text) {
                Some(found) => found.into_iter().map(|s| (s.line, s.context)).collect(),
                None => text
                    .lines()
                    .enumerate()
                    .filter(|(_, l)| l.split(|c: char| !c.is_alphanumeric() && c != '_').any(|w| w == "unsafe"))
                    .map(|(i, _)| (i + 1, "unparsed".to_string()))
                    .collect(),
            };
            for (line, context) in found {
                sites.push(format!("{}:{}: `unsafe` in {}", file.display(), line, context));
            }
        }

        if !sites.is_empty() {
            return Ok(Some(VerificationOutcome::SafetyViolation(sites.join("\n"))));
        }

        let report = self.toolchain.lint(package)?;
        self.check_cancel()?;

        if report.skipped {
            warn!("clippy not installed; skipping lint");
            return Ok(None);
        }
        if report.warnings > 0 {
            info!(warnings = report.warnings, "clippy warnings");
        }
        if report.errors > 0 {
            return Ok(Some(VerificationOutcome::LintError(report.log)));
        }
        Ok(None)
    }

    fn memcheck(
        &self,
        binary: &Path,
        suite: &TestSuite,
    ) -> Result<Option<VerificationOutcome>, VerifyError> {
        if self.memcheck_missing.load(Ordering::Relaxed) {
            return Ok(None);
        }

        for (index, case) in suite.cases.iter().enumerate() {
            match self.toolchain.memcheck(binary, &case.input, suite.feed)? {
                MemcheckRun::Clean => {}
                MemcheckRun::Errors(report) => {
                    return Ok(Some(VerificationOutcome::MemorySafetyError(report)))
                }
                MemcheckRun::TimedOut => return Ok(Some(VerificationOutcome::TestTimeout { index })),
                MemcheckRun::Cancelled => return Err(VerifyError::Cancelled),
                MemcheckRun::Unavailable => {
                    if !self.memcheck_missing.swap(true, Ordering::Relaxed) {
                        warn!(tool = %self.cfg.valgrind, "memory checker not installed; skipping memcheck");
                    }
                    return Ok(None);
                }
            }
        }

        Ok(None)
    }

    fn check_cancel(&self) -> Result<(), VerifyError> {
        if self.cancel.is_cancelled() {
            return Err(VerifyError::Cancelled);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedToolchain;
    use crate::state::{FeedMode, TestCase};

    fn suite(n: usize) -> TestSuite {
        let mut s = TestSuite::new(FeedMode::Arguments);
        for i in 0..n {
            s.push(TestCase::resolved(i.to_string(), i.to_string()));
        }
        s
    }

    fn verifier(tc: Arc<ScriptedToolchain>) -> Verifier {
        Verifier::new(tc, VerifierConfig::default(), CancelToken::new())
    }

    fn try_verify(
        v: &Verifier,
        code: &str,
        phase: Phase,
        suite: Option<&TestSuite>,
    ) -> Result<VerificationOutcome, VerifyError> {
        let dir = tempfile::tempdir().unwrap();
        let cand = Candidate::new("p", phase, 0, code.to_string());
        v.verify(&VerificationRequest {
            candidate: &cand,
            dependencies: &[],
            suite,
            build_dir: dir.path(),
        })
    }

    fn verify(v: &Verifier, code: &str, phase: Phase, suite: Option<&TestSuite>) -> VerificationOutcome {
        try_verify(v, code, phase, suite).unwrap()
    }

    #[test]
    fn mismatch_stops_at_first_failing_case() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.override_output("2", "999");
        let v = verifier(tc.clone());
        let s = suite(5);

        let out = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s));

        assert_eq!(
            out,
            VerificationOutcome::TestFailure {
                index: 2,
                actual: "999".into(),
                expected: "2".into()
            }
        );
        assert_eq!(tc.cases_run(), vec!["0", "1", "2"]);
    }

    #[test]
    fn compile_failure_short_circuits() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.fail_builds_containing("BROKEN");
        let v = verifier(tc.clone());

        let out = verify(&v, "fn main() { BROKEN }", Phase::Unidiomatic, Some(&suite(3)));
        assert!(matches!(out, VerificationOutcome::CompileError(_)));
        assert!(tc.cases_run().is_empty());
    }

    #[test]
    fn idiomatic_rejects_unsafe_before_running_tests() {
        let tc = Arc::new(ScriptedToolchain::echo());
        let v = verifier(tc.clone());

        let out = verify(
            &v,
            "fn main() { let p = &1 as *const i32; unsafe { println!(\"{}\", *p); } }",
            Phase::Idiomatic,
            Some(&suite(2)),
        );
        match out {
            VerificationOutcome::SafetyViolation(msg) => assert!(msg.contains("unsafe_block")),
            other => panic!("unexpected {:?}", other),
        }
        assert!(tc.cases_run().is_empty());
    }

    #[test]
    fn unsafe_is_fine_in_unidiomatic_phase() {
        let tc = Arc::new(ScriptedToolchain::echo());
        let v = verifier(tc);
        let out = verify(&v, "fn main() { unsafe {} }", Phase::Unidiomatic, Some(&suite(2)));
        assert_eq!(out, VerificationOutcome::Success);
    }

    #[test]
    fn timeout_reports_case_index() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.time_out_on("1");
        let v = verifier(tc);
        let out = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&suite(3)));
        assert_eq!(out, VerificationOutcome::TestTimeout { index: 1 });
    }

    #[test]
    fn memcheck_only_gates_unidiomatic() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.memcheck_reports("Invalid read of size 4");
        let v = verifier(tc);

        let uni = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&suite(2)));
        assert!(matches!(uni, VerificationOutcome::MemorySafetyError(_)));

        let idio = verify(&v, "fn main() {}", Phase::Idiomatic, Some(&suite(2)));
        assert_eq!(idio, VerificationOutcome::Success);
    }

    #[test]
    fn clippy_errors_fail_idiomatic_lint() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.lint_errors(2);
        let v = verifier(tc);
        let out = verify(&v, "fn main() {}", Phase::Idiomatic, Some(&suite(1)));
        assert!(matches!(out, VerificationOutcome::LintError(_)));
    }

    #[test]
    fn non_entry_unit_builds_only() {
        let tc = Arc::new(ScriptedToolchain::echo());
        let v = verifier(tc.clone());
        let out = verify(&v, "pub fn helper() -> i32 { 1 }", Phase::Unidiomatic, None);
        assert_eq!(out, VerificationOutcome::Success);
        assert!(tc.cases_run().is_empty());
        assert!(tc.last_built().unwrap().contains("fn main() {}"));
    }

    #[test]
    fn same_candidate_same_outcome() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.override_output("1", "x");
        let v = verifier(tc);
        let s = suite(3);
        let a = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s));
        let b = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s));
        assert_eq!(a, b);
    }

    #[test]
    fn missing_memcheck_tool_is_skipped_once() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.memcheck_returns(MemcheckRun::Unavailable);
        let v = verifier(tc.clone());
        let s = suite(3);

        assert_eq!(verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s)), VerificationOutcome::Success);
        assert_eq!(verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s)), VerificationOutcome::Success);
        // First case only, first run only; later runs skip the stage.
        assert_eq!(tc.memcheck_calls(), 1);
    }

    #[test]
    fn memcheck_timeout_reports_case_index() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.memcheck_returns(MemcheckRun::TimedOut);
        let v = verifier(tc);
        let out = verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&suite(2)));
        assert_eq!(out, VerificationOutcome::TestTimeout { index: 0 });
    }

    #[test]
    fn lint_without_clippy_is_skipped() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.lint_errors(3);
        tc.lint_unavailable();
        let v = verifier(tc.clone());
        let out = verify(&v, "fn main() {}", Phase::Idiomatic, Some(&suite(2)));
        assert_eq!(out, VerificationOutcome::Success);
        assert_eq!(tc.cases_run(), vec!["0", "1"]);
    }

    #[test]
    fn clippy_warnings_alone_pass() {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.lint_warnings(4);
        let v = verifier(tc);
        let out = verify(&v, "fn main() {}", Phase::Idiomatic, Some(&suite(1)));
        assert_eq!(out, VerificationOutcome::Success);
    }

    #[test]
    fn unresolved_case_is_an_error_not_a_comparison() {
        let tc = Arc::new(ScriptedToolchain::echo());
        let v = verifier(tc.clone());
        let mut s = suite(2);
        s.push(TestCase {
            input: "".into(),
            expected_output: None,
        });

        let err = try_verify(&v, "fn main() {}", Phase::Unidiomatic, Some(&s)).unwrap_err();
        assert!(matches!(err, VerifyError::UnresolvedCase { index: 2 }));
        assert!(tc.cases_run().is_empty());
    }
}
