use std::sync::{Arc, Mutex};
use tracing::info;

const PREFIX: &str = "[ssh-agent]";

/// Destination of build-log lines.
pub trait LogSink: Send + Sync {
    fn write_line(&self, line: &str);
}

/// Per-build log handed to providers and agents.
///
/// This is the user-facing build output, distinct from the process-wide
/// `tracing` diagnostics. Nothing secret may be written to it.
#[derive(Clone)]
pub struct BuildLog {
    sink: Arc<dyn LogSink>,
}

impl BuildLog {
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// A log that forwards every line to `tracing` at info level.
    pub fn tracing() -> Self {
        Self::new(Arc::new(TracingSink))
    }

    /// A log that keeps lines in memory, plus the sink to read them back.
    pub fn memory() -> (Self, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::default());
        (Self::new(sink.clone()), sink)
    }

    pub fn line(&self, msg: impl AsRef<str>) {
        self.sink.write_line(&format!("{} {}", PREFIX, msg.as_ref()));
    }

    pub fn warn(&self, msg: impl AsRef<str>) {
        self.sink.write_line(&format!("{} WARNING: {}", PREFIX, msg.as_ref()));
    }

    pub fn fatal(&self, msg: impl AsRef<str>) {
        self.sink.write_line(&format!("{} FATAL: {}", PREFIX, msg.as_ref()));
    }
}

impl std::fmt::Debug for BuildLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("BuildLog")
    }
}

pub struct TracingSink;

impl LogSink for TracingSink {
    fn write_line(&self, line: &str) {
        info!(target: "build", "{}", line);
    }
}

#[derive(Default)]
pub struct MemorySink {
    lines: Mutex<Vec<String>>,
}

impl MemorySink {
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn contents(&self) -> String {
        self.lines().join("\n")
    }

    pub fn contains(&self, needle: &str) -> bool {
        self.lines().iter().any(|l| l.contains(needle))
    }
}

impl LogSink for MemorySink {
    fn write_line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(line.to_string());
    }
}
