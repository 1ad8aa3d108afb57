//! Test oracle: ground truth from a trusted reference build of the C
//! program.

pub mod analysis;
pub mod contract;

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::OracleConfig;
use crate::error::OracleError;
use crate::executor::{case_command, run_command, CancelToken, CommandSpec, ExecStatus};
use crate::state::{FeedMode, TestCase, TestSuite, TranslationUnit};

pub use analysis::{analyze, synthesize};

pub trait Oracle: Send + Sync {
    /// Ordered, fully resolved cases for the program `unit` belongs to.
    fn generate(&self, unit: &TranslationUnit) -> Result<TestSuite, OracleError>;
}

pub struct ReferenceOracle {
    cfg: OracleConfig,
    cancel: CancelToken,
}

/// A compiled reference executable. Removed with its temp dir.
pub struct ReferenceBuild {
    _dir: tempfile::TempDir,
    pub binary: PathBuf,
}

impl ReferenceOracle {
    pub fn new(cfg: OracleConfig, cancel: CancelToken) -> Self {
        Self { cfg, cancel }
    }

    /// Compile `source` with the trusted C toolchain.
    pub fn build(&self, source: &str) -> Result<ReferenceBuild, OracleError> {
        let dir = tempfile::Builder::new().prefix("osmoport-ref-").tempdir()?;
        let src = dir.path().join("main.c");
        let binary = dir.path().join("reference");
        fs::write(&src, source)?;

        let spec = CommandSpec::new(&self.cfg.cc, self.cfg.build_timeout())
            .args(self.cfg.cflags.iter().cloned())
            .arg("-o")
            .arg(binary.display().to_string())
            .arg(src.display().to_string())
            .arg("-lm")
            .cwd(dir.path());

        let out = run_command(&spec, &self.cancel)?;
        match out.status {
            ExecStatus::Exited(0) => {}
            ExecStatus::Exited(code) => {
                return Err(OracleError::Build(format!(
                    "{} exited with {}\n{}",
                    self.cfg.cc,
                    code,
                    out.combined()
                )))
            }
            ExecStatus::TimedOut => {
                return Err(OracleError::Build(format!(
                    "{} timed out after {:?}",
                    self.cfg.cc,
                    self.cfg.build_timeout()
                )))
            }
            ExecStatus::Cancelled => return Err(OracleError::Build("cancelled".into())),
        }

        Ok(ReferenceBuild { _dir: dir, binary })
    }

    /// Execute the reference once per input. Non-zero exits, timeouts and
    /// non-UTF-8 output are dropped.
    pub fn resolve(
        &self,
        build: &ReferenceBuild,
        feed: FeedMode,
        inputs: &[String],
    ) -> Result<TestSuite, OracleError> {
        let mut suite = TestSuite::new(feed);

        for input in inputs {
            let spec = case_command(&build.binary, input, feed, self.cfg.case_timeout());
            let out = run_command(&spec, &self.cancel)?;

            match out.status {
                ExecStatus::Exited(0) if !out.stdout.contains('\u{FFFD}') => {
                    suite.push(TestCase::resolved(input.clone(), out.stdout.trim()));
                }
                ExecStatus::Cancelled => break,
                status => debug!(input = %input, ?status, "discarding case"),
            }
        }

        if suite.len() < self.cfg.min_cases {
            return Err(OracleError::InsufficientCases {
                resolved: suite.len(),
                required: self.cfg.min_cases,
            });
        }

        Ok(suite)
    }

    /// Full pipeline over a C program with `max_random` random inputs.
    pub fn generate_for_source(
        &self,
        source: &str,
        max_random: usize,
    ) -> Result<TestSuite, OracleError> {
        let shape = analyze(source);
        let seed = self.cfg.seed.unwrap_or_else(|| rand::rng().random());
        let inputs = synthesize(&shape, max_random, seed);

        info!(
            feed = ?shape.feed,
            slots = shape.slots.len(),
            inputs = inputs.len(),
            seed,
            "generating reference outputs"
        );

        let build = self.build(source)?;
        let suite = self.resolve(&build, shape.feed, &inputs)?;

        if suite.len() < inputs.len() {
            warn!(
                resolved = suite.len(),
                synthesized = inputs.len(),
                "some synthesized inputs were discarded"
            );
        }
        Ok(suite)
    }

    /// Write `test_samples.json` and `test_task.json` under `dir`.
    pub fn write_contract(dir: &Path, suite: &TestSuite) -> Result<(PathBuf, PathBuf), OracleError> {
        let samples = dir.join(contract::SAMPLES_FILE);
        let tasks = dir.join(contract::TASK_FILE);
        contract::write_samples(&samples, suite)?;
        contract::write_tasks(&tasks, &samples, suite)?;
        Ok((samples, tasks))
    }
}

impl Oracle for ReferenceOracle {
    fn generate(&self, unit: &TranslationUnit) -> Result<TestSuite, OracleError> {
        self.generate_for_source(&unit.source, self.cfg.max_random_cases)
    }
}

/// Oracle over a pre-existing contract, loaded through a task file.
pub struct ContractOracle {
    suite: TestSuite,
}

impl ContractOracle {
    pub fn load(task_file: &Path, min_cases: usize) -> Result<Self, OracleError> {
        let suite = contract::load_task(task_file)?;
        Self::from_suite(suite, min_cases)
    }

    /// Same floor as a generated suite: fewer than `min_cases` is an error.
    pub fn from_suite(suite: TestSuite, min_cases: usize) -> Result<Self, OracleError> {
        if suite.len() < min_cases {
            return Err(OracleError::InsufficientCases {
                resolved: suite.len(),
                required: min_cases,
            });
        }
        Ok(Self { suite })
    }
}

impl Oracle for ContractOracle {
    fn generate(&self, _unit: &TranslationUnit) -> Result<TestSuite, OracleError> {
        Ok(self.suite.clone())
    }
}
