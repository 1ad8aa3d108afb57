//! pipeline.rs
//!
//! Program-level flow: plan units, run sessions layer by layer on the
//! worker pool, rotate models on quota, combine and write results.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use crate::combine::{combine, write_artifact};
use crate::config::{LlmConfig, PipelineConfig};
use crate::detectors::units::{decompose, layers, PlanError};
use crate::error::PipelineError;
use crate::llm::prompt::DependencyCode;
use crate::llm::{LlmBackend, ModelClient};
use crate::orchestrator::{Drive, RepairController, SessionInputs, SessionReport};
use crate::pool::run_pool;
use crate::state::{Phase, TerminalStatus, TestSuite, TranslationSession, TranslationUnit};

/* ============================================================
   Model rotation
   ============================================================ */

/// Supplies a substitute backend after quota exhaustion.
pub trait ModelRotation: Send + Sync {
    fn substitute(&self, exhausted: &str) -> Option<Arc<dyn ModelClient>>;
}

pub struct NoRotation;

impl ModelRotation for NoRotation {
    fn substitute(&self, _exhausted: &str) -> Option<Arc<dyn ModelClient>> {
        None
    }
}

/// Walks `llm.fallback_models` in order, same provider and credentials.
pub struct FallbackModels {
    base: LlmConfig,
    remaining: Mutex<VecDeque<String>>,
}

impl FallbackModels {
    pub fn new(base: LlmConfig) -> Self {
        let remaining = base.fallback_models.iter().cloned().collect();
        Self {
            base,
            remaining: Mutex::new(remaining),
        }
    }
}

impl ModelRotation for FallbackModels {
    fn substitute(&self, exhausted: &str) -> Option<Arc<dyn ModelClient>> {
        let mut remaining = self.remaining.lock().ok()?;

        while let Some(model) = remaining.pop_front() {
            let cfg = LlmConfig {
                model: model.clone(),
                ..self.base.clone()
            };
            match LlmBackend::from_config(&cfg) {
                Ok(backend) => {
                    info!(from = %exhausted, to = %backend.name(), "switching model");
                    let client: Arc<dyn ModelClient> = Arc::new(backend);
                    return Some(client);
                }
                Err(e) => warn!(model = %model, error = %e, "fallback model unusable"),
            }
        }
        None
    }
}

/* ============================================================
   Program translation
   ============================================================ */

#[derive(Debug)]
pub struct ProgramReport {
    pub reports: Vec<SessionReport>,
    /// Written `translated_code_<phase>/` packages.
    pub artifacts: Vec<PathBuf>,
    /// Why the program as a whole failed, if it did.
    pub failure: Option<String>,
}

impl ProgramReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug)]
pub enum ProgramOutcome {
    Completed(ProgramReport),
    /// Quota exhausted and no substitute left.
    Suspended { unit_id: String, backend: String },
}

enum UnitResult {
    Done(SessionReport),
    Suspended { unit_id: String, backend: String },
}

pub struct Pipeline {
    cfg: Arc<PipelineConfig>,
    controller: Arc<RepairController>,
    rotation: Arc<dyn ModelRotation>,
}

impl Pipeline {
    pub fn new(
        cfg: Arc<PipelineConfig>,
        controller: Arc<RepairController>,
        rotation: Arc<dyn ModelRotation>,
    ) -> Self {
        Self {
            cfg,
            controller,
            rotation,
        }
    }

    /// Units for `program`: itself, or its decomposition when asked and
    /// possible.
    pub fn plan(&self, program: &TranslationUnit, split: bool) -> Vec<TranslationUnit> {
        if !split {
            return vec![program.clone()];
        }

        match decompose(&program.source) {
            Ok(units) if units.len() > 1 => {
                info!(units = units.len(), "decomposed program");
                units
            }
            Ok(_) => vec![program.clone()],
            Err(PlanError::Cyclic(ids)) => {
                warn!(units = %ids.join(", "), "mutually dependent units; translating whole program");
                vec![program.clone()]
            }
            Err(e) => {
                warn!(error = ?e, "cannot decompose; translating whole program");
                vec![program.clone()]
            }
        }
    }

    pub fn translate(
        &self,
        units: Vec<TranslationUnit>,
        suite: Arc<TestSuite>,
        result_dir: Option<&Path>,
    ) -> Result<ProgramOutcome, PipelineError> {
        let mut done: HashMap<String, SessionReport> = HashMap::new();
        let by_id: HashMap<String, TranslationUnit> =
            units.iter().map(|u| (u.id.clone(), u.clone())).collect();

        for (depth, layer) in layers(&units).into_iter().enumerate() {
            let jobs: Vec<(TranslationUnit, Result<SessionInputs, String>)> = layer
                .iter()
                .map(|&i| {
                    let unit = units[i].clone();
                    let inputs = self.inputs_for(&unit, &by_id, &done, &suite);
                    (unit, inputs)
                })
                .collect();

            info!(layer = depth, units = jobs.len(), "starting layer");

            let results = run_pool(self.cfg.pipeline.workers, jobs, |(unit, inputs)| {
                self.run_unit(unit, inputs)
            });

            for result in results {
                match result {
                    UnitResult::Done(report) => {
                        done.insert(report.unit.id.clone(), report);
                    }
                    UnitResult::Suspended { unit_id, backend } => {
                        return Ok(ProgramOutcome::Suspended { unit_id, backend })
                    }
                }
            }
        }

        let reports: Vec<SessionReport> = units
            .iter()
            .filter_map(|u| done.remove(&u.id))
            .collect();

        Ok(ProgramOutcome::Completed(self.finish(reports, result_dir)?))
    }

    fn run_unit(&self, unit: TranslationUnit, inputs: Result<SessionInputs, String>) -> UnitResult {
        let inputs = match inputs {
            Ok(i) => i,
            Err(reason) => return UnitResult::Done(self.controller.report_skipped(unit, reason)),
        };

        let mut session = match TranslationSession::new(unit.clone()) {
            Ok(s) => s,
            Err(e) => {
                return UnitResult::Done(
                    self.controller
                        .report_skipped(unit, format!("cannot create session workspace: {}", e)),
                )
            }
        };

        let mut drive = self.controller.drive(&mut session, &inputs);
        loop {
            match drive {
                Drive::Terminal(report) => return UnitResult::Done(report),
                Drive::Suspended { unit_id, backend } => {
                    // Another worker may already have rotated.
                    let current = self.controller.current_model();
                    let client = if current.name() != backend {
                        Some(current)
                    } else {
                        self.rotation.substitute(&backend)
                    };

                    match client {
                        Some(c) => drive = self.controller.resume(&mut session, &inputs, c),
                        None => return UnitResult::Suspended { unit_id, backend },
                    }
                }
            }
        }
    }

    /// Dependency code for both phases, in emission order. `Err` names the
    /// first dependency that did not succeed.
    fn inputs_for(
        &self,
        unit: &TranslationUnit,
        by_id: &HashMap<String, TranslationUnit>,
        done: &HashMap<String, SessionReport>,
        suite: &Arc<TestSuite>,
    ) -> Result<SessionInputs, String> {
        let mut inputs = if unit.entry {
            SessionInputs::with_suite(suite.clone())
        } else {
            SessionInputs::default()
        };

        for dep in transitive_deps(unit, by_id) {
            let report = done
                .get(&dep)
                .filter(|r| r.status == TerminalStatus::Succeeded)
                .ok_or_else(|| format!("dependency {} was not translated", dep))?;

            if let Some(c) = report.accepted(Phase::Unidiomatic) {
                inputs.unidiomatic_deps.push(DependencyCode {
                    unit_id: dep.clone(),
                    code: c.code.clone(),
                });
            }
            if let Some(c) = report.accepted(Phase::Idiomatic) {
                inputs.idiomatic_deps.push(DependencyCode {
                    unit_id: dep.clone(),
                    code: c.code.clone(),
                });
            }
        }

        Ok(inputs)
    }

    fn finish(
        &self,
        reports: Vec<SessionReport>,
        result_dir: Option<&Path>,
    ) -> Result<ProgramReport, PipelineError> {
        let mut phases = vec![Phase::Unidiomatic];
        if !self.cfg.pipeline.unidiomatic_only {
            phases.push(Phase::Idiomatic);
        }

        let mut artifacts = Vec::new();
        let mut failure = None;

        for phase in phases {
            match combine(&reports, phase) {
                Ok(artifact) => {
                    if let Some(dir) = result_dir {
                        artifacts.push(write_artifact(&artifact, dir, &self.cfg.verifier.edition)?);
                    }
                }
                Err(e) => {
                    let mut msg = e.to_string();
                    for r in &reports {
                        if let Some(m) = r.failure_message() {
                            msg.push('\n');
                            msg.push_str(&m);
                        }
                    }
                    failure = Some(msg);
                    break;
                }
            }
        }

        Ok(ProgramReport {
            reports,
            artifacts,
            failure,
        })
    }
}

/// Every unit `unit` reaches through dependencies, dependencies first.
fn transitive_deps(unit: &TranslationUnit, by_id: &HashMap<String, TranslationUnit>) -> Vec<String> {
    fn visit(
        id: &str,
        by_id: &HashMap<String, TranslationUnit>,
        seen: &mut HashSet<String>,
        out: &mut Vec<String>,
    ) {
        let Some(u) = by_id.get(id) else {
            return;
        };
        for dep in &u.dependencies {
            if seen.insert(dep.clone()) {
                visit(dep, by_id, seen, out);
                out.push(dep.clone());
            }
        }
    }

    let mut seen = HashSet::new();
    seen.insert(unit.id.clone());
    let mut out = Vec::new();
    visit(&unit.id, by_id, &mut seen, &mut out);
    out
}
