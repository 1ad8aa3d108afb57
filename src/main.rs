mod combine;
mod commands;
mod config;
mod detectors;
mod error;
mod executor;
mod llm;
mod logger;
mod machine;
mod oracle;
mod orchestrator;
mod persistence;
mod pipeline;
mod pool;
mod state;
mod verifier;

#[cfg(test)]
mod testing;

use std::process::ExitCode;

use clap::{Parser, Subcommand};

use crate::commands::{GenerateTestsArgs, RunTestsArgs, TranslateArgs};

#[derive(Parser)]
#[command(
    name = "osmoport",
    version,
    about = "Translate C programs to Rust with an LLM, verified against the original's behaviour."
)]
struct Cli {
    #[arg(long, short, global = true, help = "Debug-level logs (overridden by OSMOPORT_LOG)")]
    verbose: bool,

    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Translate a C program: unidiomatic Rust first, then idiomatic
    Translate(TranslateArgs),
    /// Generate test_samples.json and test_task.json from a C program
    GenerateTests(GenerateTestsArgs),
    /// Run one test case from a contract against an executable
    RunTests(RunTestsArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let result = match cli.command {
        CliCommand::Translate(args) => commands::translate(args),
        CliCommand::GenerateTests(args) => commands::generate_tests(args),
        CliCommand::RunTests(args) => commands::run_tests(args),
    };

    match result {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
