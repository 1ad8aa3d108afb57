use std::sync::Mutex;

use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use crate::state::{SessionRecord, TerminalStatus};

pub const LOG_ENV: &str = "OSMOPORT_LOG";

/// Install the global subscriber. `OSMOPORT_LOG` wins over `RUST_LOG`;
/// `verbose` raises the default from `info` to `debug`.
pub fn init(verbose: bool) {
    let default = if verbose { "osmoport=debug,info" } else { "info" };

    let filter = EnvFilter::try_from_env(LOG_ENV)
        .or_else(|_| EnvFilter::try_from_default_env())
        .unwrap_or_else(|_| EnvFilter::new(default));

    // A second init (tests, embedding) keeps the first subscriber.
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

/// Receives one record per terminal session.
pub trait ProgressSink: Send + Sync {
    fn record(&self, record: &SessionRecord);
}

/// Default sink: one structured log line per record.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn record(&self, r: &SessionRecord) {
        match r.outcome {
            TerminalStatus::Succeeded => info!(
                unit = %r.unit_id,
                phase = %r.phase,
                attempts = r.attempts,
                elapsed_ms = r.elapsed_ms as u64,
                outcome = %r.outcome,
                "session finished"
            ),
            _ => warn!(
                unit = %r.unit_id,
                phase = %r.phase,
                attempts = r.attempts,
                elapsed_ms = r.elapsed_ms as u64,
                outcome = %r.outcome,
                "session finished"
            ),
        }
    }
}

/// Keeps records in memory; the CLI writes them out as `sessions.json`.
#[derive(Default)]
pub struct MemorySink {
    records: Mutex<Vec<SessionRecord>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<SessionRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

impl ProgressSink for MemorySink {
    fn record(&self, record: &SessionRecord) {
        TracingSink.record(record);
        if let Ok(mut r) = self.records.lock() {
            r.push(record.clone());
        }
    }
}
