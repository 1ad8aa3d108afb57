//! orchestrator.rs
//!
//! Drives one translation session through the two-phase repair loop:
//! prompt -> model -> extract -> verify -> transition, until terminal or
//! suspended on quota.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::RepairConfig;
use crate::error::VerifyError;
use crate::executor::CancelToken;
use crate::llm::extract::extract_code;
use crate::llm::prompt::{build_prompt, DependencyCode, PromptContext, RepairFeedback};
use crate::llm::ModelClient;
use crate::logger::ProgressSink;
use crate::machine::next_state;
use crate::state::{
    Candidate, Diagnostic, Phase, SessionRecord, SessionState, TerminalStatus, TestSuite,
    TranslationSession, TranslationUnit,
};
use crate::verifier::{VerificationRequest, Verifier};

/// What a session needs besides its own state.
#[derive(Debug, Clone, Default)]
pub struct SessionInputs {
    /// Present for the unit owning the entry point.
    pub suite: Option<Arc<TestSuite>>,
    pub unidiomatic_deps: Vec<DependencyCode>,
    pub idiomatic_deps: Vec<DependencyCode>,
}

impl SessionInputs {
    pub fn with_suite(suite: Arc<TestSuite>) -> Self {
        Self {
            suite: Some(suite),
            ..Self::default()
        }
    }

    pub fn dependencies(&self, phase: Phase) -> &[DependencyCode] {
        match phase {
            Phase::Unidiomatic => &self.unidiomatic_deps,
            Phase::Idiomatic => &self.idiomatic_deps,
        }
    }
}

/// Final account of one session.
#[derive(Debug, Clone)]
pub struct SessionReport {
    pub unit: TranslationUnit,
    pub status: TerminalStatus,
    /// Phase the session ended in.
    pub phase: Phase,
    /// Attempts consumed in `phase`.
    pub attempts: u32,
    pub history: Vec<Diagnostic>,
    pub unidiomatic: Option<Candidate>,
    pub idiomatic: Option<Candidate>,
    pub abort_reason: Option<String>,
    pub elapsed: Duration,
}

impl SessionReport {
    fn from_session(session: &TranslationSession, status: TerminalStatus) -> Self {
        Self {
            unit: session.unit.clone(),
            status,
            phase: session.last_phase,
            attempts: session.attempts(session.last_phase),
            history: session.history.clone(),
            unidiomatic: session.accepted(Phase::Unidiomatic).cloned(),
            idiomatic: session.accepted(Phase::Idiomatic).cloned(),
            abort_reason: session.abort_reason.clone(),
            elapsed: session.elapsed(),
        }
    }

    pub fn accepted(&self, phase: Phase) -> Option<&Candidate> {
        match phase {
            Phase::Unidiomatic => self.unidiomatic.as_ref(),
            Phase::Idiomatic => self.idiomatic.as_ref(),
        }
    }

    pub fn last_diagnostic(&self) -> Option<&Diagnostic> {
        self.history.last()
    }

    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            unit_id: self.unit.id.clone(),
            phase: self.phase,
            outcome: self.status,
            attempts: self.attempts,
            elapsed_ms: self.elapsed.as_millis(),
        }
    }

    /// Names unit, phase and attempt count, then the last diagnostic
    /// verbatim. `None` on success.
    pub fn failure_message(&self) -> Option<String> {
        match self.status {
            TerminalStatus::Succeeded => None,
            TerminalStatus::Aborted => Some(format!(
                "unit {} aborted in {} phase after {} attempt(s): {}",
                self.unit.id,
                self.phase,
                self.attempts,
                self.abort_reason.as_deref().unwrap_or("unknown reason")
            )),
            TerminalStatus::ExhaustedAttempts => {
                let last = self
                    .last_diagnostic()
                    .map(|d| format!("{}: {}", d.outcome.kind(), d.outcome.diagnostic()))
                    .unwrap_or_else(|| "no diagnostic recorded".into());
                Some(format!(
                    "unit {} exhausted {} attempt(s) in {} phase; last diagnostic:\n{}",
                    self.unit.id, self.attempts, self.phase, last
                ))
            }
        }
    }
}

#[derive(Debug)]
pub enum Drive {
    Terminal(SessionReport),
    /// Quota hit. The session is untouched; call `resume` with another
    /// backend.
    Suspended { unit_id: String, backend: String },
}

pub struct RepairController {
    model: RwLock<Arc<dyn ModelClient>>,
    verifier: Arc<Verifier>,
    cfg: RepairConfig,
    sink: Arc<dyn ProgressSink>,
    cancel: CancelToken,
}

impl RepairController {
    pub fn new(
        model: Arc<dyn ModelClient>,
        verifier: Arc<Verifier>,
        cfg: RepairConfig,
        sink: Arc<dyn ProgressSink>,
        cancel: CancelToken,
    ) -> Self {
        Self {
            model: RwLock::new(model),
            verifier,
            cfg,
            sink,
            cancel,
        }
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    pub fn model_name(&self) -> String {
        self.current_model().name()
    }

    pub fn current_model(&self) -> Arc<dyn ModelClient> {
        match self.model.read() {
            Ok(m) => m.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Account for a unit that never ran because a dependency failed.
    pub fn report_skipped(&self, unit: TranslationUnit, reason: String) -> SessionReport {
        let report = SessionReport {
            unit,
            status: TerminalStatus::Aborted,
            phase: Phase::Unidiomatic,
            attempts: 0,
            history: Vec::new(),
            unidiomatic: None,
            idiomatic: None,
            abort_reason: Some(reason),
            elapsed: Duration::ZERO,
        };
        self.sink.record(&report.record());
        report
    }

    /// Swap in a substitute backend and continue from the same state.
    pub fn resume(
        &self,
        session: &mut TranslationSession,
        inputs: &SessionInputs,
        client: Arc<dyn ModelClient>,
    ) -> Drive {
        info!(unit = %session.unit.id, backend = %client.name(), "resuming with substitute model");
        match self.model.write() {
            Ok(mut m) => *m = client,
            Err(poisoned) => *poisoned.into_inner() = client,
        }
        self.drive(session, inputs)
    }

    pub fn drive(&self, session: &mut TranslationSession, inputs: &SessionInputs) -> Drive {
        loop {
            if self.cancel.is_cancelled() && !session.state.is_terminal() {
                self.abort(session, "cancelled".into());
            }

            let (phase, attempt) = match session.state {
                SessionState::Unidiomatic(n) => (Phase::Unidiomatic, n),
                SessionState::Idiomatic(n) => (Phase::Idiomatic, n),
                terminal => return Drive::Terminal(self.finish(session, terminal)),
            };
            session.last_phase = phase;

            let model = self.current_model();
            let prompt = self.prompt_for(session, inputs, phase);

            debug!(unit = %session.unit.id, %phase, attempt, backend = %model.name(), "querying model");

            let reply = match model.query(&prompt.system, &prompt.user) {
                Ok(r) => r,
                Err(e) if e.is_quota() => {
                    warn!(unit = %session.unit.id, %phase, attempt, error = %e, "model quota exhausted; suspending");
                    return Drive::Suspended {
                        unit_id: session.unit.id.clone(),
                        backend: model.name(),
                    };
                }
                Err(e) => {
                    error!(unit = %session.unit.id, %phase, attempt, error = %e, "model request failed");
                    self.abort(session, e.to_string());
                    continue;
                }
            };

            let candidate = Candidate::new(&session.unit.id, phase, attempt, extract_code(&reply));
            self.warn_if_repeated(session, &candidate);
            session.record_attempt(candidate.clone());

            let build_dir = session.build_dir(phase);
            let request = VerificationRequest {
                candidate: &candidate,
                dependencies: inputs.dependencies(phase),
                suite: inputs.suite.as_deref(),
                build_dir: &build_dir,
            };

            let outcome = match self.verifier.verify(&request) {
                Ok(o) => o,
                Err(VerifyError::Cancelled) => {
                    self.abort(session, "cancelled".into());
                    continue;
                }
                Err(e) => {
                    error!(unit = %session.unit.id, %phase, attempt, error = %e, "verification could not run");
                    self.abort(session, e.to_string());
                    continue;
                }
            };

            info!(
                unit = %session.unit.id,
                %phase,
                attempt,
                outcome = outcome.kind(),
                "attempt verified"
            );

            let next = next_state(session.state, &outcome, &self.cfg);
            if outcome.is_success() {
                session.accept(candidate);
            } else {
                session.record_failure(phase, attempt, outcome);
            }
            session.state = next;
        }
    }

    fn prompt_for(
        &self,
        session: &TranslationSession,
        inputs: &SessionInputs,
        phase: Phase,
    ) -> crate::llm::LlmPrompt {
        let baseline = match phase {
            Phase::Idiomatic => session.accepted(Phase::Unidiomatic).map(|c| c.code.as_str()),
            Phase::Unidiomatic => None,
        };

        let previous = session.candidates.iter().rev().find(|c| c.phase == phase);
        let repair = match (session.last_failure(phase), previous) {
            (Some(diag), Some(prev)) => Some(RepairFeedback {
                attempt: diag.attempt,
                previous_code: prev.code.as_str(),
                outcome: &diag.outcome,
            }),
            _ => None,
        };

        build_prompt(&PromptContext {
            unit: &session.unit,
            phase,
            baseline,
            dependencies: inputs.dependencies(phase),
            suite: inputs.suite.as_deref(),
            repair,
        })
    }

    fn warn_if_repeated(&self, session: &TranslationSession, candidate: &Candidate) {
        let fp = candidate.fingerprint();
        if session
            .candidates
            .iter()
            .any(|c| c.phase == candidate.phase && c.fingerprint() == fp)
        {
            warn!(unit = %session.unit.id, phase = %candidate.phase, fingerprint = %fp, "model repeated an earlier candidate");
        }
    }

    fn abort(&self, session: &mut TranslationSession, reason: String) {
        session.abort_reason = Some(reason);
        session.state = SessionState::Aborted;
    }

    fn finish(&self, session: &TranslationSession, terminal: SessionState) -> SessionReport {
        let status = terminal.status().unwrap_or(TerminalStatus::Aborted);
        let report = SessionReport::from_session(session, status);
        self.sink.record(&report.record());

        if let Some(msg) = report.failure_message() {
            warn!("{}", msg);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VerifierConfig;
    use crate::logger::MemorySink;
    use crate::state::{FeedMode, TestCase, VerificationOutcome};
    use crate::testing::{Reply, ScriptedModel, ScriptedToolchain};

    const GOOD: &str = "fn main() { let v: Vec<String> = std::env::args().skip(1).collect(); println!(\"{}\", v.join(\" \")); }";
    const BROKEN: &str = "fn main() { BROKEN }";

    struct Rig {
        controller: RepairController,
        model: Arc<ScriptedModel>,
        sink: Arc<MemorySink>,
        inputs: SessionInputs,
    }

    fn rig(replies: Vec<Reply>, uni: u32, idio: u32, only: bool) -> Rig {
        let tc = Arc::new(ScriptedToolchain::echo());
        tc.fail_builds_containing("BROKEN");
        let cancel = CancelToken::new();
        let verifier = Arc::new(Verifier::new(tc, VerifierConfig::default(), cancel.clone()));
        let model = Arc::new(ScriptedModel::new("primary", replies));
        let sink = Arc::new(MemorySink::default());

        let cfg = RepairConfig {
            max_unidiomatic_attempts: uni,
            max_idiomatic_attempts: idio,
            unidiomatic_only: only,
            ..RepairConfig::default()
        };

        let mut suite = TestSuite::new(FeedMode::Arguments);
        suite.push(TestCase::resolved("5", "5"));

        Rig {
            controller: RepairController::new(model.clone(), verifier, cfg, sink.clone(), cancel),
            model,
            sink,
            inputs: SessionInputs::with_suite(Arc::new(suite)),
        }
    }

    fn session() -> TranslationSession {
        TranslationSession::new(TranslationUnit::program("p", "int main(int argc, char **argv){}")).unwrap()
    }

    fn terminal(d: Drive) -> SessionReport {
        match d {
            Drive::Terminal(r) => r,
            other => panic!("expected terminal, got {:?}", other),
        }
    }

    fn code(s: &str) -> Reply {
        Reply::Code(s.to_string())
    }

    #[test]
    fn first_candidate_passes_both_phases() {
        let r = rig(vec![code(GOOD), code(GOOD)], 6, 4, false);
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(s.attempts(Phase::Unidiomatic), 1);
        assert_eq!(s.attempts(Phase::Idiomatic), 1);
        assert!(report.history.is_empty());
        assert!(report.idiomatic.is_some());
        assert_eq!(r.sink.records().len(), 1);
    }

    #[test]
    fn repairs_after_two_compile_failures() {
        let r = rig(vec![code(BROKEN), code(BROKEN), code(GOOD), code(GOOD)], 5, 4, false);
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(s.attempts(Phase::Unidiomatic), 3);
        assert_eq!(report.history.len(), 2);
        assert!(report
            .history
            .iter()
            .all(|d| matches!(d.outcome, VerificationOutcome::CompileError(_))));

        // Repair prompts carry the previous failure.
        let prompts = r.model.prompts();
        assert!(!prompts[0].contains("PREVIOUS ATTEMPT"));
        assert!(prompts[1].contains("PREVIOUS ATTEMPT 1 FAILED: compile_error"));
        assert!(prompts[3].contains("VERIFIED RUST TRANSLATION"));
    }

    #[test]
    fn exhausts_after_ceiling() {
        let r = rig(vec![code(BROKEN)], 2, 4, false);
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::ExhaustedAttempts);
        assert_eq!(report.history.len(), 2);
        assert_eq!(report.attempts, 2);
        assert_eq!(r.model.calls(), 2);

        let msg = report.failure_message().unwrap();
        assert!(msg.contains("unit p"));
        assert!(msg.contains("unidiomatic"));
        assert!(msg.contains("error[E0425]"));
    }

    #[test]
    fn unidiomatic_only_never_enters_idiomatic() {
        let r = rig(vec![code(GOOD)], 6, 4, true);
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(s.attempts(Phase::Idiomatic), 0);
        assert!(report.idiomatic.is_none());
        assert_eq!(r.model.calls(), 1);
    }

    #[test]
    fn quota_suspends_without_consuming_attempt() {
        let r = rig(vec![code(BROKEN), Reply::Quota], 6, 4, true);
        let mut s = session();

        match r.controller.drive(&mut s, &r.inputs) {
            Drive::Suspended { unit_id, backend } => {
                assert_eq!(unit_id, "p");
                assert_eq!(backend, "primary");
            }
            other => panic!("expected suspension, got {:?}", other),
        }
        assert_eq!(s.state, SessionState::Unidiomatic(1));
        assert_eq!(s.attempts(Phase::Unidiomatic), 1);
        assert!(r.sink.records().is_empty());

        let backup = Arc::new(ScriptedModel::new("backup", vec![code(GOOD)]));
        let report = terminal(r.controller.resume(&mut s, &r.inputs, backup.clone()));
        assert_eq!(report.status, TerminalStatus::Succeeded);
        assert_eq!(s.attempts(Phase::Unidiomatic), 2);
        assert_eq!(backup.calls(), 1);
        // The substitute sees the same repair context.
        assert!(backup.prompts()[0].contains("PREVIOUS ATTEMPT 1 FAILED"));
    }

    #[test]
    fn other_provider_errors_abort() {
        let r = rig(vec![Reply::Fail(500)], 6, 4, false);
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::Aborted);
        assert!(report.abort_reason.unwrap().contains("500"));
        assert_eq!(s.attempts(Phase::Unidiomatic), 0);
    }

    #[test]
    fn cancelled_session_never_promotes() {
        let r = rig(vec![code(GOOD)], 6, 4, false);
        r.controller.cancel_token().cancel();
        let mut s = session();
        let report = terminal(r.controller.drive(&mut s, &r.inputs));

        assert_eq!(report.status, TerminalStatus::Aborted);
        assert!(report.unidiomatic.is_none());
        assert_eq!(r.model.calls(), 0);
    }
}
