use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::orchestrator::SessionReport;
use crate::state::{Phase, SessionRecord, TerminalStatus};

pub const RUN_FILE: &str = "run.json";
pub const SESSIONS_FILE: &str = "sessions.json";
pub const FAILURES_DIR: &str = "failures";

/// Identity and outcome of one `translate` invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub run_id: String,
    pub source: PathBuf,
    pub model: String,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub units: usize,
}

impl RunManifest {
    pub fn start(source: &Path, model: String) -> Self {
        Self {
            run_id: Uuid::new_v4().to_string(),
            source: source.to_path_buf(),
            model,
            started_at: Utc::now(),
            finished_at: None,
            status: None,
            units: 0,
        }
    }

    pub fn finish(&mut self, status: &str, units: usize) {
        self.finished_at = Some(Utc::now());
        self.status = Some(status.to_string());
        self.units = units;
    }
}

#[derive(Serialize)]
struct FailedSession<'a> {
    unit_id: &'a str,
    outcome: TerminalStatus,
    phase: Phase,
    attempts: u32,
    abort_reason: Option<&'a str>,
    history: Vec<FailedAttempt<'a>>,
}

#[derive(Serialize)]
struct FailedAttempt<'a> {
    phase: Phase,
    attempt: u32,
    kind: &'a str,
    at: DateTime<Utc>,
    diagnostic: String,
}

pub fn save_manifest(dir: &Path, manifest: &RunManifest) -> Result<(), String> {
    write_json(&dir.join(RUN_FILE), manifest)
}

pub fn save_sessions(dir: &Path, records: &[SessionRecord]) -> Result<(), String> {
    write_json(&dir.join(SESSIONS_FILE), &records)
}

/// One JSON file per unsuccessful session with its full diagnostic history.
pub fn save_failures(dir: &Path, reports: &[SessionReport]) -> Result<usize, String> {
    let mut written = 0;

    for r in reports.iter().filter(|r| r.status != TerminalStatus::Succeeded) {
        let payload = FailedSession {
            unit_id: &r.unit.id,
            outcome: r.status,
            phase: r.phase,
            attempts: r.attempts,
            abort_reason: r.abort_reason.as_deref(),
            history: r
                .history
                .iter()
                .map(|d| FailedAttempt {
                    phase: d.phase,
                    attempt: d.attempt,
                    kind: d.outcome.kind(),
                    at: d.at,
                    diagnostic: d.outcome.diagnostic(),
                })
                .collect(),
        };

        let name = format!("{}.json", file_stem(&r.unit.id));
        write_json(&dir.join(FAILURES_DIR).join(name), &payload)?;
        written += 1;
    }

    Ok(written)
}

fn file_stem(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| e.to_string())?;
    }
    let json = serde_json::to_string_pretty(value).map_err(|e| e.to_string())?;
    fs::write(path, json).map_err(|e| format!("{}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{Diagnostic, TranslationUnit, VerificationOutcome};
    use std::time::Duration;

    #[test]
    fn manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut m = RunManifest::start(Path::new("prog.c"), "openai:gpt-4o".into());
        m.finish("succeeded", 3);
        save_manifest(dir.path(), &m).unwrap();

        let raw = fs::read_to_string(dir.path().join(RUN_FILE)).unwrap();
        let loaded: RunManifest = serde_json::from_str(&raw).unwrap();
        assert_eq!(loaded.run_id, m.run_id);
        assert_eq!(loaded.status.as_deref(), Some("succeeded"));
        assert_eq!(loaded.units, 3);
    }

    #[test]
    fn only_failed_sessions_are_dumped() {
        let dir = tempfile::tempdir().unwrap();
        let failed = SessionReport {
            unit: TranslationUnit::program("fn:main", ""),
            status: TerminalStatus::ExhaustedAttempts,
            phase: Phase::Unidiomatic,
            attempts: 2,
            history: vec![Diagnostic {
                phase: Phase::Unidiomatic,
                attempt: 1,
                outcome: VerificationOutcome::CompileError("error[E0308]".into()),
                at: Utc::now(),
            }],
            unidiomatic: None,
            idiomatic: None,
            abort_reason: None,
            elapsed: Duration::from_millis(1),
        };
        let mut ok = failed.clone();
        ok.status = TerminalStatus::Succeeded;
        ok.unit.id = "fn:ok".into();

        assert_eq!(save_failures(dir.path(), &[failed, ok]).unwrap(), 1);
        let text = fs::read_to_string(dir.path().join("failures/fn_main.json")).unwrap();
        assert!(text.contains("compile_error"));
        assert!(text.contains("error[E0308]"));
    }
}
