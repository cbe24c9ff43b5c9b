//! Best-effort observable side files: per-step stall, per-checkpoint
//! overhead, and recovery-time CSVs. Presence/absence must not change
//! correctness, and a write failure must not affect training — so every
//! I/O error here is swallowed and logged rather than propagated.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Appends CSV rows to a file, logging (never propagating) any I/O
/// failure.
pub struct CsvSink {
    path: PathBuf,
}

impl CsvSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Writes one CSV row. `fields` are joined with commas verbatim; the
    /// caller is responsible for quoting/escaping if needed.
    pub fn record(&self, fields: &[&str]) {
        if let Err(err) = self.try_record(fields) {
            tracing::warn!(
                path = %self.path.display(),
                error = %err,
                "diagnostic CSV write failed, continuing"
            );
        }
    }

    fn try_record(&self, fields: &[&str]) -> std::io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", fields.join(","))
    }
}

/// Per-step stall CSV: one row per training step whose checkpoint
/// introduced wall-clock stall.
pub fn record_step_stall(sink: &CsvSink, step: u64, stall_secs: f64) {
    sink.record(&[&step.to_string(), &stall_secs.to_string()]);
}

/// Per-checkpoint overhead CSV: one row per completed checkpoint.
pub fn record_checkpoint_overhead(sink: &CsvSink, version: u64, overhead_secs: f64) {
    sink.record(&[&version.to_string(), &overhead_secs.to_string()]);
}

/// Recovery-time CSV: one row per `load` call on process restart.
pub fn record_recovery_time(sink: &CsvSink, path: &Path, recovery_secs: f64) {
    sink.record(&[&path.display().to_string(), &recovery_secs.to_string()]);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_appends_rows() {
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path().join("stall.csv"));
        record_step_stall(&sink, 1, 0.002);
        record_step_stall(&sink, 2, 0.0015);
        let contents = std::fs::read_to_string(dir.path().join("stall.csv")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn write_failure_does_not_panic() {
        // Pointing at a directory instead of a file makes every write fail;
        // `record` must swallow the error rather than propagate it.
        let dir = tempfile::tempdir().unwrap();
        let sink = CsvSink::new(dir.path());
        record_step_stall(&sink, 1, 0.1);
    }
}
