//! Run-scoped observability handles: the progress counter and the log
//! channel workers write to.
//!
//! Both live for one `run()` call. Workers never touch the global
//! subscriber directly; the orchestrator drains their records and re-emits
//! them through `tracing`.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex};

use serde::Serialize;

use super::error::VerificationError;
use super::traits::{Metrics, RunLogger};
use super::types::PrescriptionId;

// ═══════════════════════════════════════════
// Progress
// ═══════════════════════════════════════════

/// Lock-protected progress counter, one unit per checked prescription.
#[derive(Debug, Clone, Default)]
pub struct ProgressCounter {
    value: Arc<Mutex<u64>>,
}

impl ProgressCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_progress(&self) -> Result<u64, VerificationError> {
        self.value
            .lock()
            .map(|v| *v)
            .map_err(|e| VerificationError::LockPoisoned(e.to_string()))
    }

    fn increment(&self) -> Result<u64, VerificationError> {
        let mut guard = self
            .value
            .lock()
            .map_err(|e| VerificationError::LockPoisoned(e.to_string()))?;
        *guard += 1;
        Ok(*guard)
    }
}

impl Metrics for ProgressCounter {
    fn prescription_checked(&self, id: &PrescriptionId) {
        match self.increment() {
            Ok(value) => tracing::trace!(prescription = %id, progress = value, "Progress"),
            Err(e) => tracing::warn!(prescription = %id, error = %e, "Progress update lost"),
        }
    }

    fn progress(&self) -> u64 {
        self.try_progress().unwrap_or(0)
    }

    fn chunk_retried(&self, chunk: usize) {
        tracing::debug!(chunk, "Chunk retry recorded");
    }
}

// ═══════════════════════════════════════════
// Log records
// ═══════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// A log line produced inside a worker.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogRecord {
    pub level: LogLevel,
    pub prescription: Option<PrescriptionId>,
    pub message: String,
    pub fields: BTreeMap<String, String>,
}

impl LogRecord {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            prescription: None,
            message: message.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn for_prescription(mut self, id: &PrescriptionId) -> Self {
        self.prescription = Some(id.clone());
        self
    }

    pub fn field(mut self, key: &str, value: impl ToString) -> Self {
        self.fields.insert(key.to_string(), value.to_string());
        self
    }

    /// Re-emit through the global `tracing` subscriber.
    pub fn emit(&self) {
        let prescription = self
            .prescription
            .as_ref()
            .map(PrescriptionId::as_str)
            .unwrap_or("");
        let fields = render_fields(&self.fields);
        match self.level {
            LogLevel::Debug => tracing::debug!(prescription = %prescription, fields = %fields, "{}", self.message),
            LogLevel::Info => tracing::info!(prescription = %prescription, fields = %fields, "{}", self.message),
            LogLevel::Warn => tracing::warn!(prescription = %prescription, fields = %fields, "{}", self.message),
            LogLevel::Error => tracing::error!(prescription = %prescription, fields = %fields, "{}", self.message),
        }
    }
}

fn render_fields(fields: &BTreeMap<String, String>) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ")
}

// ═══════════════════════════════════════════
// Loggers
// ═══════════════════════════════════════════

/// Messages on the run's log channel.
#[derive(Debug, Clone, PartialEq)]
pub enum LogMessage {
    Record(LogRecord),
    /// Sent once at shutdown; the drain stops here.
    Stop,
}

/// Worker-side logger backed by a bounded channel.
///
/// A full channel falls back to emitting the record directly so workers
/// never block on logging.
#[derive(Debug, Clone)]
pub struct ChannelLogger {
    sender: SyncSender<LogMessage>,
}

impl ChannelLogger {
    /// Logger plus the receiving end the orchestrator drains.
    pub fn bounded(capacity: usize) -> (Self, Receiver<LogMessage>) {
        let (sender, receiver) = mpsc::sync_channel(capacity);
        (Self { sender }, receiver)
    }

    /// Enqueue the stop sentinel. Returns false if the channel is full or
    /// the receiver is gone; the drain then ends at the first empty read.
    pub fn stop(&self) -> bool {
        self.sender.try_send(LogMessage::Stop).is_ok()
    }
}

impl RunLogger for ChannelLogger {
    fn log(&self, record: LogRecord) {
        match self.sender.try_send(LogMessage::Record(record)) {
            Ok(()) => {}
            Err(TrySendError::Full(LogMessage::Record(record)))
            | Err(TrySendError::Disconnected(LogMessage::Record(record))) => record.emit(),
            Err(_) => {}
        }
    }
}

/// Drain records until `Stop` or until every sender is gone.
pub fn drain(receiver: &Receiver<LogMessage>) -> Vec<LogRecord> {
    let mut records = Vec::new();
    while let Ok(message) = receiver.try_recv() {
        match message {
            LogMessage::Record(record) => records.push(record),
            LogMessage::Stop => break,
        }
    }
    records
}

/// Logger that writes straight to `tracing`; used on the sequential path.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLogger;

impl RunLogger for TracingLogger {
    fn log(&self, record: LogRecord) {
        record.emit();
    }
}
