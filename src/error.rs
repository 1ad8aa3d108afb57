//! error.rs
//!
//! Error taxonomy for the translate/verify/repair pipeline.
//!
//! Verification failures are not errors: they are `VerificationOutcome`
//! variants recovered by the orchestrator. Everything here either needs a
//! different backend (`ProviderError`) or is fatal for a unit or program.

use std::path::PathBuf;

use thiserror::Error;

/// Model backend failures.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// Rate limit or credential exhaustion. Retryable by substitution only.
    #[error("quota exceeded on {backend}: {detail}")]
    QuotaExceeded { backend: String, detail: String },

    #[error("{backend} returned HTTP {status}: {body}")]
    Status {
        backend: String,
        status: u16,
        body: String,
    },

    #[error("transport error talking to {backend}: {detail}")]
    Transport { backend: String, detail: String },

    #[error("malformed response from {backend}: {detail}")]
    Malformed { backend: String, detail: String },

    #[error("provider misconfigured: {0}")]
    Config(String),
}

impl ProviderError {
    pub fn is_quota(&self) -> bool {
        matches!(self, ProviderError::QuotaExceeded { .. })
    }
}

/// Subprocess plumbing failures (not test failures).
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error while running `{program}`: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ExecError {
    /// True when the program itself is not installed.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ExecError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

/// Verification could not reach an outcome. Aborts the session.
#[derive(Debug, Error)]
pub enum VerifyError {
    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("cannot prepare build directory: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("verification cancelled")]
    Cancelled,

    #[error("test case {index} has no reference output")]
    UnresolvedCase { index: usize },
}

/// The oracle could not establish ground truth for a program.
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("reference build failed: {0}")]
    Build(String),

    #[error("only {resolved} of the required {required} test cases resolved")]
    InsufficientCases { resolved: usize, required: usize },

    #[error(transparent)]
    Exec(#[from] ExecError),

    #[error("oracle workspace error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Contract(#[from] ContractError),
}

/// Test contract / test task file problems.
#[derive(Debug, Error)]
pub enum ContractError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("test task {test_id} has an unrecognized command: {command}")]
    Command { test_id: usize, command: String },

    #[error("test task file is empty: {0}")]
    Empty(PathBuf),

    #[error("test id {id} is out of range ({len} cases)")]
    OutOfRange { id: usize, len: usize },
}

/// Combination-time failures. Fatal for the whole program.
#[derive(Debug, Error)]
pub enum CombineError {
    #[error("units not translated: {}", .0.join(", "))]
    IncompleteTranslation(Vec<String>),

    #[error("unit `{from}` references unknown unit `{to}`")]
    UnresolvedReference { from: String, to: String },

    #[error("dependency cycle through units: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("cannot write combined artifact: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// Top-level error surfaced to the caller of the pipeline.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Oracle(#[from] OracleError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Contract(#[from] ContractError),

    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("cannot read source {path}: {source}")]
    Source {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace error: {0}")]
    Io(#[from] std::io::Error),
}
