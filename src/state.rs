//! state.rs
//!
//! Pipeline data model: units, test suites, candidates, outcomes and the
//! per-unit translation session.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

/* ---------- phases ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Unidiomatic,
    Idiomatic,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Unidiomatic => "unidiomatic",
            Phase::Idiomatic => "idiomatic",
        }
    }

    fn slot(self) -> usize {
        match self {
            Phase::Unidiomatic => 0,
            Phase::Idiomatic => 1,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/* ---------- translation units ---------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
    /// The whole program as one unit.
    Program,
    Type,
    Function,
}

/// One piece of source input. Immutable once planned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslationUnit {
    pub id: String,
    pub kind: UnitKind,
    pub source: String,
    /// C declaration the translation must keep callable, when decomposed.
    pub signature: Option<String>,
    pub dependencies: Vec<String>,
    /// The unit holding `main`; functional tests run against it.
    pub entry: bool,
}

impl TranslationUnit {
    pub fn program(id: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: UnitKind::Program,
            source: source.into(),
            signature: None,
            dependencies: Vec::new(),
            entry: true,
        }
    }
}

/* ---------- tests ---------- */

/// How case input reaches the program. Fixed per program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedMode {
    Arguments,
    Stdin,
}

impl FeedMode {
    pub fn flag(self) -> &'static str {
        match self {
            FeedMode::Arguments => "--feed-as-args",
            FeedMode::Stdin => "--feed-as-stdin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    pub input: String,
    pub expected_output: Option<String>,
}

impl TestCase {
    pub fn resolved(input: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            input: input.into(),
            expected_output: Some(output.into()),
        }
    }
}

/// Ordered cases. Insertion order is execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSuite {
    pub feed: FeedMode,
    pub cases: Vec<TestCase>,
}

impl TestSuite {
    pub fn new(feed: FeedMode) -> Self {
        Self {
            feed,
            cases: Vec::new(),
        }
    }

    pub fn push(&mut self, case: TestCase) {
        self.cases.push(case);
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }

    pub fn is_resolved(&self) -> bool {
        self.cases.iter().all(|c| c.expected_output.is_some())
    }
}

/* ---------- candidates ---------- */

/// One model-produced translation attempt.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub unit_id: String,
    pub phase: Phase,
    pub attempt: u32,
    pub code: String,
}

impl Candidate {
    pub fn new(unit_id: &str, phase: Phase, attempt: u32, code: String) -> Self {
        Self {
            unit_id: unit_id.to_string(),
            phase,
            attempt,
            code,
        }
    }

    /// Content hash, used to spot the model repeating itself.
    pub fn fingerprint(&self) -> String {
        let mut h = Sha256::new();
        h.update(self.code.as_bytes());
        hex::encode(h.finalize())[..16].to_string()
    }
}

/* ---------- verification ---------- */

/// The single result of one verification run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerificationOutcome {
    Success,
    CompileError(String),
    LintError(String),
    SafetyViolation(String),
    TestFailure {
        index: usize,
        actual: String,
        expected: String,
    },
    TestTimeout {
        index: usize,
    },
    MemorySafetyError(String),
}

impl VerificationOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, VerificationOutcome::Success)
    }

    pub fn kind(&self) -> &'static str {
        match self {
            VerificationOutcome::Success => "success",
            VerificationOutcome::CompileError(_) => "compile_error",
            VerificationOutcome::LintError(_) => "lint_error",
            VerificationOutcome::SafetyViolation(_) => "safety_violation",
            VerificationOutcome::TestFailure { .. } => "test_failure",
            VerificationOutcome::TestTimeout { .. } => "test_timeout",
            VerificationOutcome::MemorySafetyError(_) => "memory_safety_error",
        }
    }

    /// Full diagnostic text, reported verbatim to the user.
    pub fn diagnostic(&self) -> String {
        match self {
            VerificationOutcome::Success => "all stages passed".into(),
            VerificationOutcome::CompileError(msg)
            | VerificationOutcome::LintError(msg)
            | VerificationOutcome::SafetyViolation(msg)
            | VerificationOutcome::MemorySafetyError(msg) => msg.clone(),
            VerificationOutcome::TestFailure {
                index,
                actual,
                expected,
            } => format!(
                "test case {} produced {:?}, expected {:?}",
                index, actual, expected
            ),
            VerificationOutcome::TestTimeout { index } => {
                format!("test case {} timed out", index)
            }
        }
    }
}

/// A failed verification kept in the session history.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub phase: Phase,
    pub attempt: u32,
    pub outcome: VerificationOutcome,
    pub at: DateTime<Utc>,
}

/* ---------- sessions ---------- */

/// Repair loop position. `Unidiomatic(n)` / `Idiomatic(n)` carry the
/// zero-based index of the attempt about to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unidiomatic(u32),
    Idiomatic(u32),
    Succeeded,
    ExhaustedAttempts,
    Aborted,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Succeeded | SessionState::ExhaustedAttempts | SessionState::Aborted
        )
    }

    pub fn status(self) -> Option<TerminalStatus> {
        match self {
            SessionState::Succeeded => Some(TerminalStatus::Succeeded),
            SessionState::ExhaustedAttempts => Some(TerminalStatus::ExhaustedAttempts),
            SessionState::Aborted => Some(TerminalStatus::Aborted),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Succeeded,
    ExhaustedAttempts,
    Aborted,
}

impl fmt::Display for TerminalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TerminalStatus::Succeeded => "succeeded",
            TerminalStatus::ExhaustedAttempts => "exhausted_attempts",
            TerminalStatus::Aborted => "aborted",
        })
    }
}

/// Unit of work for one translation unit. Mutated only by the orchestrator.
#[derive(Debug)]
pub struct TranslationSession {
    pub unit: TranslationUnit,
    pub state: SessionState,
    /// Last non-terminal state, so reports can name the failing phase.
    pub last_phase: Phase,
    attempts: [u32; 2],
    pub history: Vec<Diagnostic>,
    pub candidates: Vec<Candidate>,
    accepted: [Option<Candidate>; 2],
    pub abort_reason: Option<String>,
    pub started: Instant,
    workspace: TempDir,
}

impl TranslationSession {
    pub fn new(unit: TranslationUnit) -> std::io::Result<Self> {
        let workspace = tempfile::Builder::new()
            .prefix(&format!("osmoport-{}-", sanitize(&unit.id)))
            .tempdir()?;

        Ok(Self {
            unit,
            state: SessionState::Unidiomatic(0),
            last_phase: Phase::Unidiomatic,
            attempts: [0, 0],
            history: Vec::new(),
            candidates: Vec::new(),
            accepted: [None, None],
            abort_reason: None,
            started: Instant::now(),
            workspace,
        })
    }

    pub fn attempts(&self, phase: Phase) -> u32 {
        self.attempts[phase.slot()]
    }

    pub fn record_attempt(&mut self, candidate: Candidate) {
        self.attempts[candidate.phase.slot()] += 1;
        self.candidates.push(candidate);
    }

    pub fn record_failure(&mut self, phase: Phase, attempt: u32, outcome: VerificationOutcome) {
        self.history.push(Diagnostic {
            phase,
            attempt,
            outcome,
            at: Utc::now(),
        });
    }

    pub fn accept(&mut self, candidate: Candidate) {
        let slot = candidate.phase.slot();
        self.accepted[slot] = Some(candidate);
    }

    pub fn accepted(&self, phase: Phase) -> Option<&Candidate> {
        self.accepted[phase.slot()].as_ref()
    }

    /// Last failed outcome in `phase`, feeding the next repair prompt.
    pub fn last_failure(&self, phase: Phase) -> Option<&Diagnostic> {
        self.history.iter().rev().find(|d| d.phase == phase)
    }

    /// Build directory for one phase. Lives as long as the session.
    pub fn build_dir(&self, phase: Phase) -> PathBuf {
        self.workspace.path().join(phase.as_str())
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect()
}

/* ---------- reporting ---------- */

/// Structured record emitted after every terminal session state.
#[derive(Debug, Clone, Serialize)]
pub struct SessionRecord {
    pub unit_id: String,
    pub phase: Phase,
    pub outcome: TerminalStatus,
    pub attempts: u32,
    pub elapsed_ms: u128,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_starts_in_first_unidiomatic_attempt() {
        let s = TranslationSession::new(TranslationUnit::program("p1", "int main(){}")).unwrap();
        assert_eq!(s.state, SessionState::Unidiomatic(0));
        assert_eq!(s.attempts(Phase::Unidiomatic), 0);
        let dir = s.build_dir(Phase::Idiomatic);
        assert!(dir.ends_with("idiomatic"));
        assert!(dir.parent().unwrap().exists());
    }

    #[test]
    fn workspace_is_released_on_drop() {
        let s = TranslationSession::new(TranslationUnit::program("p/2", "")).unwrap();
        let dir = s.build_dir(Phase::Unidiomatic).parent().unwrap().to_path_buf();
        drop(s);
        assert!(!dir.exists());
    }

    #[test]
    fn last_failure_is_per_phase() {
        let mut s = TranslationSession::new(TranslationUnit::program("p", "")).unwrap();
        s.record_failure(Phase::Unidiomatic, 0, VerificationOutcome::CompileError("a".into()));
        s.record_failure(Phase::Idiomatic, 0, VerificationOutcome::LintError("b".into()));

        let last = s.last_failure(Phase::Unidiomatic).unwrap();
        assert_eq!(last.outcome, VerificationOutcome::CompileError("a".into()));
    }

    #[test]
    fn diagnostic_names_failing_case() {
        let o = VerificationOutcome::TestFailure {
            index: 2,
            actual: "4".into(),
            expected: "5".into(),
        };
        assert_eq!(o.kind(), "test_failure");
        assert!(o.diagnostic().contains("test case 2"));
    }

    #[test]
    fn suite_resolution_requires_every_case() {
        let mut suite = TestSuite::new(FeedMode::Stdin);
        suite.push(TestCase::resolved("1", "1"));
        assert!(suite.is_resolved());
        suite.push(TestCase {
            input: "2".into(),
            expected_output: None,
        });
        assert!(!suite.is_resolved());
    }
}
