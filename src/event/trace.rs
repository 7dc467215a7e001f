//! NDJSON Trace Writer
//!
//! Writes events to newline-delimited JSON files for debugging.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{PlanError, Result};

use super::{Event, EventLog};

/// NDJSON trace writer
pub struct TraceWriter {
    writer: Arc<Mutex<BufWriter<File>>>,
    path: PathBuf,
}

impl TraceWriter {
    /// Create (or truncate) a trace file; parent directories are created
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(&path)?;

        tracing::info!(path = %path.display(), "Created trace file");

        Ok(Self {
            writer: Arc::new(Mutex::new(BufWriter::new(file))),
            path,
        })
    }

    pub fn write_event(&self, event: &Event) -> Result<()> {
        let json = serde_json::to_string(event).map_err(|e| PlanError::Execution(e.to_string()))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{}", json)?;
        Ok(())
    }

    /// Write all events from an EventLog and flush
    pub fn write_all(&self, event_log: &EventLog) -> Result<()> {
        event_log.with_events(|events| events.iter().try_for_each(|e| self.write_event(e)))?;
        self.writer.lock().flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Unique id for one apply
pub fn generate_generation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Template hash: `xxh3:XXXXXXXXXXXXXXXX`
pub fn calculate_template_hash(source: &str) -> String {
    format!("xxh3:{:016x}", xxh3_64(source.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    #[test]
    fn writes_one_line_per_event() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("trace.ndjson");

        let log = EventLog::new();
        log.emit(EventKind::NodeAbandoned {
            node: Arc::from("app"),
            cause: "dependency failed".to_string(),
        });
        log.emit(EventKind::ApplyFailed {
            error: "x".to_string(),
            failed_node: Some(Arc::from("cosmos")),
        });

        let writer = TraceWriter::create(&path).unwrap();
        writer.write_all(&log).unwrap();

        let content = fs::read_to_string(writer.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"]["type"], "node_abandoned");
    }

    #[test]
    fn template_hash_is_stable() {
        let a = calculate_template_hash("nodes: []");
        assert_eq!(a, calculate_template_hash("nodes: []"));
        assert_ne!(a, calculate_template_hash("nodes: [x]"));
        assert!(a.starts_with("xxh3:"));
        assert_eq!(a.len(), 5 + 16);
    }

    #[test]
    fn generation_ids_differ() {
        assert_ne!(generate_generation_id(), generate_generation_id());
    }
}
