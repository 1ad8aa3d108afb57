//! commands.rs
//!
//! CLI operations: translate, generate-tests, run-tests.
//!
//! Each handler turns parsed arguments into pipeline calls and returns the
//! process exit code. Errors are reported with context by `main`.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::Args;
use rand::Rng;
use tracing::{info, warn};

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::executor::{case_command, run_command, CancelToken, ExecStatus};
use crate::llm::prompt::output_diff;
use crate::llm::{LlmBackend, ModelClient};
use crate::logger::{MemorySink, ProgressSink};
use crate::oracle::analysis::FIXED_INPUTS;
use crate::oracle::contract::{read_samples, write_samples, write_tasks};
use crate::oracle::{analyze, synthesize, ContractOracle, Oracle, ReferenceOracle};
use crate::orchestrator::RepairController;
use crate::persistence::{save_failures, save_manifest, save_sessions, RunManifest};
use crate::pipeline::{FallbackModels, ModelRotation, NoRotation, Pipeline, ProgramOutcome};
use crate::state::{FeedMode, TerminalStatus, TestSuite, TranslationUnit};
use crate::verifier::{CargoToolchain, Verifier};

/// Exit status when the run stopped on quota with no substitute model.
pub const EXIT_SUSPENDED: u8 = 75;

/* ============================================================
   Shared flags
   ============================================================ */

#[derive(Args, Debug, Clone, Default)]
pub struct FeedArgs {
    #[arg(long, conflicts_with = "feed_as_stdin", help = "Pass case input as command-line arguments")]
    pub feed_as_args: bool,

    #[arg(long, help = "Pass case input on standard input")]
    pub feed_as_stdin: bool,
}

impl FeedArgs {
    pub fn mode(&self) -> Option<FeedMode> {
        match (self.feed_as_args, self.feed_as_stdin) {
            (true, _) => Some(FeedMode::Arguments),
            (_, true) => Some(FeedMode::Stdin),
            _ => None,
        }
    }
}

/// Ctrl-C trips `cancel`: the running subprocess is killed and every
/// session aborts at its next check.
fn cancel_on_interrupt(cancel: &CancelToken) {
    let token = cancel.clone();
    let installed = ctrlc::set_handler(move || {
        eprintln!("interrupted; stopping");
        token.cancel();
    });
    if let Err(e) = installed {
        warn!(error = %e, "cannot install Ctrl-C handler");
    }
}

fn check_kind(kind: &str) -> Result<()> {
    if kind != "bin" {
        bail!("unsupported target type `{}` (only `bin`)", kind);
    }
    Ok(())
}

/* ============================================================
   translate
   ============================================================ */

#[derive(Args, Debug, Clone)]
pub struct TranslateArgs {
    #[arg(help = "C source file to translate")]
    pub source: PathBuf,

    #[arg(long, help = "Existing test task file (skips test generation)")]
    pub test_task: Option<PathBuf>,

    #[arg(long, default_value_t = false, help = "Stop after the unidiomatic phase")]
    pub unidiomatic_only: bool,

    #[arg(long, help = "Where to write translations (default: ./osmoport-out/<name>)")]
    pub result_dir: Option<PathBuf>,

    #[arg(long = "type", default_value = "bin", help = "Target type")]
    pub kind: String,

    #[arg(long, default_value_t = false, help = "Translate per type/function instead of whole program")]
    pub decompose: bool,

    #[arg(long, help = "Worker threads for independent units")]
    pub workers: Option<usize>,

    #[arg(long, help = "Config file (default: <config dir>/osmoport/config.toml)")]
    pub config: Option<PathBuf>,
}

pub fn translate(args: TranslateArgs) -> Result<ExitCode> {
    check_kind(&args.kind)?;

    let mut cfg = PipelineConfig::load(args.config.as_deref())?;
    if args.unidiomatic_only {
        cfg.pipeline.unidiomatic_only = true;
    }
    if let Some(n) = args.workers {
        cfg.pipeline.workers = n;
    }
    cfg.validate()?;
    let cfg = Arc::new(cfg);

    let source = fs::read_to_string(&args.source).map_err(|source| PipelineError::Source {
        path: args.source.clone(),
        source,
    })?;
    let name = program_name(&args.source);
    let result_dir = args
        .result_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("osmoport-out").join(&name));
    fs::create_dir_all(&result_dir)
        .with_context(|| format!("creating result dir {}", result_dir.display()))?;

    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel);
    let program = TranslationUnit::program(name.clone(), source);

    /* ---------- ground truth ---------- */
    let suite = match &args.test_task {
        Some(task) => {
            let oracle = ContractOracle::load(task, cfg.oracle.min_cases)
                .with_context(|| format!("loading test task {}", task.display()))?;
            oracle.generate(&program)?
        }
        None => {
            let oracle = ReferenceOracle::new(cfg.oracle.clone(), cancel.clone());
            let suite = oracle
                .generate(&program)
                .with_context(|| format!("generating tests for {}", args.source.display()))?;
            let (samples, _) = ReferenceOracle::write_contract(&result_dir, &suite)?;
            info!(cases = suite.len(), contract = %samples.display(), "wrote test contract");
            suite
        }
    };
    let suite = Arc::new(suite);

    /* ---------- wiring ---------- */
    let model: Arc<dyn ModelClient> = Arc::new(LlmBackend::from_config(&cfg.llm)?);
    let toolchain = Arc::new(CargoToolchain::new(cfg.verifier.clone(), cancel.clone()));
    let verifier = Arc::new(Verifier::new(toolchain, cfg.verifier.clone(), cancel.clone()));
    let sink = Arc::new(MemorySink::default());
    let progress: Arc<dyn ProgressSink> = sink.clone();

    let mut manifest = RunManifest::start(&args.source, model.name());
    if let Err(e) = save_manifest(&result_dir, &manifest) {
        warn!(error = %e, "could not write run manifest");
    }

    let controller = Arc::new(RepairController::new(
        model,
        verifier,
        cfg.pipeline.clone(),
        progress,
        cancel,
    ));
    let rotation: Arc<dyn ModelRotation> = if cfg.llm.fallback_models.is_empty() {
        Arc::new(NoRotation)
    } else {
        Arc::new(FallbackModels::new(cfg.llm.clone()))
    };
    let pipeline = Pipeline::new(cfg.clone(), controller.clone(), rotation);

    /* ---------- run ---------- */
    let units = pipeline.plan(&program, args.decompose);
    let unit_count = units.len();
    info!(program = %name, units = unit_count, run = %manifest.run_id, "translating");

    let outcome = pipeline.translate(units, suite, Some(&result_dir))?;

    if let Err(e) = save_sessions(&result_dir, &sink.records()) {
        warn!(error = %e, "could not write session records");
    }
    // Rotation may have swapped the backend mid-run.
    manifest.model = controller.model_name();
    let interrupted = controller.cancel_token().is_cancelled();

    let code = match outcome {
        ProgramOutcome::Suspended { unit_id, backend } => {
            manifest.finish("suspended", unit_count);
            eprintln!(
                "suspended: model quota exhausted on {} while translating {}; no substitute configured",
                backend, unit_id
            );
            ExitCode::from(EXIT_SUSPENDED)
        }
        ProgramOutcome::Completed(report) => {
            if let Err(e) = save_failures(&result_dir, &report.reports) {
                warn!(error = %e, "could not write failure details");
            }

            for r in &report.reports {
                let mark = match r.status {
                    TerminalStatus::Succeeded => "ok",
                    TerminalStatus::ExhaustedAttempts => "exhausted",
                    TerminalStatus::Aborted => "aborted",
                };
                println!("{:<10} {:<24} {} attempt(s) in {}", mark, r.unit.id, r.attempts, r.phase);
            }

            if report.succeeded() {
                manifest.finish("succeeded", unit_count);
                for pkg in &report.artifacts {
                    println!("wrote {}", pkg.display());
                }
                ExitCode::SUCCESS
            } else {
                manifest.finish(if interrupted { "interrupted" } else { "failed" }, unit_count);
                if let Some(msg) = &report.failure {
                    eprintln!("{}", msg);
                }
                ExitCode::FAILURE
            }
        }
    };

    if let Err(e) = save_manifest(&result_dir, &manifest) {
        warn!(error = %e, "could not write run manifest");
    }
    Ok(code)
}

fn program_name(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "program".into())
}

/* ============================================================
   generate-tests
   ============================================================ */

#[derive(Args, Debug, Clone)]
pub struct GenerateTestsArgs {
    #[arg(help = "C source file")]
    pub source: PathBuf,

    #[arg(help = "Number of test cases to generate")]
    pub count: usize,

    #[arg(long = "type", default_value = "bin", help = "Target type")]
    pub kind: String,

    #[command(flatten)]
    pub feed: FeedArgs,

    #[arg(long, help = "Output path for test_samples.json")]
    pub out_test_sample_path: PathBuf,

    #[arg(long, help = "Output path for test_task.json")]
    pub out_test_task_path: PathBuf,

    #[arg(long, help = "Config file")]
    pub config: Option<PathBuf>,
}

pub fn generate_tests(args: GenerateTestsArgs) -> Result<ExitCode> {
    check_kind(&args.kind)?;
    if args.count == 0 {
        bail!("count must be at least 1");
    }

    let cfg = PipelineConfig::load(args.config.as_deref())?;
    let source = fs::read_to_string(&args.source)
        .with_context(|| format!("reading {}", args.source.display()))?;

    let mut shape = analyze(&source);
    if let Some(feed) = args.feed.mode() {
        shape.feed = feed;
    }

    let seed = cfg.oracle.seed.unwrap_or_else(|| rand::rng().random());
    let mut inputs = synthesize(&shape, args.count.saturating_sub(FIXED_INPUTS), seed);
    inputs.truncate(args.count);

    let mut oracle_cfg = cfg.oracle.clone();
    oracle_cfg.min_cases = oracle_cfg.min_cases.min(args.count);
    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel);
    let oracle = ReferenceOracle::new(oracle_cfg, cancel);

    let build = oracle
        .build(&source)
        .with_context(|| format!("compiling {}", args.source.display()))?;
    let suite: TestSuite = oracle.resolve(&build, shape.feed, &inputs)?;

    write_samples(&args.out_test_sample_path, &suite)?;
    write_tasks(&args.out_test_task_path, &args.out_test_sample_path, &suite)?;

    info!(
        cases = suite.len(),
        requested = args.count,
        feed = ?suite.feed,
        seed,
        "generated tests"
    );
    println!(
        "{} test cases -> {}, {}",
        suite.len(),
        args.out_test_sample_path.display(),
        args.out_test_task_path.display()
    );
    Ok(ExitCode::SUCCESS)
}

/* ============================================================
   run-tests
   ============================================================ */

#[derive(Args, Debug, Clone)]
pub struct RunTestsArgs {
    #[arg(long = "type", default_value = "bin", help = "Target type")]
    pub kind: String,

    #[arg(help = "Path to test_samples.json")]
    pub samples: PathBuf,

    #[arg(help = "Executable under test")]
    pub target: PathBuf,

    #[arg(help = "Index of the case to run")]
    pub test_id: usize,

    #[command(flatten)]
    pub feed: FeedArgs,

    #[arg(long, help = "Config file")]
    pub config: Option<PathBuf>,
}

pub fn run_tests(args: RunTestsArgs) -> Result<ExitCode> {
    check_kind(&args.kind)?;

    let cfg = PipelineConfig::load(args.config.as_deref())?;
    let feed = args.feed.mode().unwrap_or(FeedMode::Arguments);
    let suite = read_samples(&args.samples, feed)?;

    let Some(case) = suite.cases.get(args.test_id) else {
        bail!(
            "test id {} is out of range ({} cases in {})",
            args.test_id,
            suite.len(),
            args.samples.display()
        );
    };
    let expected = case.expected_output.as_deref().unwrap_or("").trim();

    let spec = case_command(&args.target, &case.input, feed, cfg.verifier.case_timeout());
    let cancel = CancelToken::new();
    cancel_on_interrupt(&cancel);
    let out = run_command(&spec, &cancel)
        .with_context(|| format!("running {}", args.target.display()))?;

    match out.status {
        ExecStatus::TimedOut => {
            eprintln!("test {} timed out after {:?}", args.test_id, cfg.verifier.case_timeout());
            return Ok(ExitCode::FAILURE);
        }
        ExecStatus::Cancelled => {
            eprintln!("test {} interrupted", args.test_id);
            return Ok(ExitCode::FAILURE);
        }
        _ => {}
    }

    let actual = out.stdout.trim();
    if actual == expected {
        return Ok(ExitCode::SUCCESS);
    }

    eprintln!("test {} failed (input {:?})", args.test_id, case.input);
    eprint!("{}", output_diff(expected, actual));
    Ok(ExitCode::FAILURE)
}
