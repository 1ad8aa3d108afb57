//! oracle/contract.rs
//!
//! On-disk test contracts.
//!
//! `test_samples.json`: `[{"input": "...", "output": "..."}]`
//! `test_task.json`:    `[{"command": "osmoport run-tests --type bin <samples> %t <id> --feed-as-args", "test_id": <id>}]`
//!
//! `%t` stands for the executable under test.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ContractError;
use crate::state::{FeedMode, TestCase, TestSuite};

pub const SAMPLES_FILE: &str = "test_samples.json";
pub const TASK_FILE: &str = "test_task.json";
pub const TARGET_PLACEHOLDER: &str = "%t";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Sample {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskEntry {
    pub command: String,
    pub test_id: usize,
}

/// A parsed task command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskCommand {
    pub samples: PathBuf,
    pub test_id: usize,
    pub feed: FeedMode,
}

/* ============================================================
   Samples
   ============================================================ */

pub fn write_samples(path: &Path, suite: &TestSuite) -> Result<(), ContractError> {
    let samples: Vec<Sample> = suite
        .cases
        .iter()
        .filter_map(|c| {
            Some(Sample {
                input: c.input.clone(),
                output: c.expected_output.clone()?,
            })
        })
        .collect();

    write_json(path, &samples)
}

pub fn read_samples(path: &Path, feed: FeedMode) -> Result<TestSuite, ContractError> {
    let samples: Vec<Sample> = read_json(path)?;
    if samples.is_empty() {
        return Err(ContractError::Empty(path.to_path_buf()));
    }

    let mut suite = TestSuite::new(feed);
    for s in samples {
        suite.push(TestCase::resolved(s.input, s.output.trim()));
    }
    Ok(suite)
}

/* ============================================================
   Task file
   ============================================================ */

pub fn task_command(samples: &Path, test_id: usize, feed: FeedMode) -> String {
    format!(
        "osmoport run-tests --type bin {} {} {} {}",
        samples.display(),
        TARGET_PLACEHOLDER,
        test_id,
        feed.flag()
    )
}

pub fn write_tasks(path: &Path, samples: &Path, suite: &TestSuite) -> Result<(), ContractError> {
    let tasks: Vec<TaskEntry> = (0..suite.len())
        .map(|id| TaskEntry {
            command: task_command(samples, id, suite.feed),
            test_id: id,
        })
        .collect();

    write_json(path, &tasks)
}

/// Parse a task command. Relative sample paths resolve against `base`.
pub fn parse_task_command(
    command: &str,
    test_id: usize,
    base: &Path,
) -> Result<TaskCommand, ContractError> {
    let bad = || ContractError::Command {
        test_id,
        command: command.to_string(),
    };

    let words: Vec<&str> = command.split_whitespace().collect();
    let at = words.iter().position(|w| *w == "run-tests").ok_or_else(bad)?;
    let rest = &words[at + 1..];

    let mut positional = Vec::new();
    let mut feed = FeedMode::Arguments;
    let mut i = 0;
    while i < rest.len() {
        match rest[i] {
            "--type" => i += 1,
            "--feed-as-args" => feed = FeedMode::Arguments,
            "--feed-as-stdin" => feed = FeedMode::Stdin,
            w if w.starts_with("--") => return Err(bad()),
            w => positional.push(w),
        }
        i += 1;
    }

    let [samples, target, id] = positional.as_slice() else {
        return Err(bad());
    };
    if *target != TARGET_PLACEHOLDER {
        return Err(bad());
    }
    let parsed: usize = id.parse().map_err(|_| bad())?;
    if parsed != test_id {
        return Err(bad());
    }

    let samples = PathBuf::from(*samples);
    let samples = if samples.is_relative() {
        base.join(samples)
    } else {
        samples
    };

    Ok(TaskCommand {
        samples,
        test_id,
        feed,
    })
}

/// Load the suite a task file points at. The first entry decides the
/// contract path and feed mode; every entry must agree and be in range.
pub fn load_task(path: &Path) -> Result<TestSuite, ContractError> {
    let tasks: Vec<TaskEntry> = read_json(path)?;
    let first = tasks.first().ok_or_else(|| ContractError::Empty(path.to_path_buf()))?;

    let base = path.parent().unwrap_or_else(|| Path::new("."));
    let head = parse_task_command(&first.command, first.test_id, base)?;

    let suite = read_samples(&head.samples, head.feed)?;

    for task in &tasks[1..] {
        let cmd = parse_task_command(&task.command, task.test_id, base)?;
        if cmd.samples != head.samples || cmd.feed != head.feed {
            return Err(ContractError::Command {
                test_id: task.test_id,
                command: task.command.clone(),
            });
        }
    }

    if let Some(bad) = tasks.iter().find(|t| t.test_id >= suite.len()) {
        return Err(ContractError::OutOfRange {
            id: bad.test_id,
            len: suite.len(),
        });
    }

    // Task order is the execution order.
    let mut ordered = TestSuite::new(suite.feed);
    for task in &tasks {
        ordered.push(suite.cases[task.test_id].clone());
    }
    Ok(ordered)
}

/* ============================================================
   JSON helpers
   ============================================================ */

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, ContractError> {
    let text = fs::read_to_string(path).map_err(|source| ContractError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ContractError::Json {
        path: path.to_path_buf(),
        source,
    })
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ContractError> {
    let json = serde_json::to_string_pretty(value).map_err(|source| ContractError::Json {
        path: path.to_path_buf(),
        source,
    })?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| ContractError::Write {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(path, json).map_err(|source| ContractError::Write {
        path: path.to_path_buf(),
        source,
    })
}
