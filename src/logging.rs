//! Logging: the `tracing` console subscriber with a reloadable level filter,
//! and a JSONL request log kept in a bounded in-memory ring.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use crate::error::{ProxyError, Result};

const MAX_LOG_ENTRIES: usize = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
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
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    fn env_filter(&self) -> EnvFilter {
        EnvFilter::new(format!(
            "vertex_proxy={0},tower_http={0}",
            self.as_str()
        ))
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(ProxyError::malformed_request(format!(
                "Unknown log level '{other}'. Expected one of: debug, info, warn, error"
            ))),
        }
    }
}

/// Handle to the console subscriber's level filter.
#[derive(Clone)]
pub struct LevelHandle(reload::Handle<EnvFilter, Registry>);

impl LevelHandle {
    pub fn set(&self, level: LogLevel) -> Result<()> {
        self.0
            .reload(level.env_filter())
            .map_err(|e| ProxyError::config(format!("Failed to update log level: {e}")))
    }
}

/// Install the global `tracing` subscriber. `RUST_LOG` takes precedence over
/// `level` for the initial filter.
pub fn init_tracing(level: LogLevel) -> LevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| level.env_filter());
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    LevelHandle(handle)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub component: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
}

impl LogEntry {
    pub fn new(level: LogLevel, component: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            component: component.into(),
            message: message.into(),
            context: None,
        }
    }

    pub fn with_context(mut self, ctx: serde_json::Value) -> Self {
        self.context = Some(ctx);
        self
    }
}

/// Ring-buffer request log, optionally persisted as JSONL.
pub struct Logger {
    entries: VecDeque<LogEntry>,
    min_level: LogLevel,
    writer: Option<BufWriter<File>>,
}

impl Logger {
    /// Open (or create) a JSONL log file, replaying its tail into the ring.
    pub fn new(file_path: impl AsRef<Path>, min_level: LogLevel) -> std::io::Result<Self> {
        let file_path: PathBuf = file_path.as_ref().to_path_buf();

        if let Some(parent) = file_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let mut entries = VecDeque::with_capacity(MAX_LOG_ENTRIES);

        if file_path.exists() {
            let reader = BufReader::new(File::open(&file_path)?);
            for line in reader.lines().map_while(std::result::Result::ok) {
                if let Ok(entry) = serde_json::from_str::<LogEntry>(&line) {
                    if entries.len() >= MAX_LOG_ENTRIES {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&file_path)?;

        Ok(Self {
            entries,
            min_level,
            writer: Some(BufWriter::new(file)),
        })
    }

    pub fn in_memory(min_level: LogLevel) -> Self {
        Self {
            entries: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            min_level,
            writer: None,
        }
    }

    pub fn log(&mut self, entry: LogEntry) {
        if entry.level < self.min_level {
            return;
        }
        if let Some(ref mut writer) = self.writer {
            if let Ok(json) = serde_json::to_string(&entry) {
                let _ = writeln!(writer, "{}", json);
                let _ = writer.flush();
            }
        }
        if self.entries.len() >= MAX_LOG_ENTRIES {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.entries.iter().rev().take(limit).cloned().collect()
    }
}

/// Cloneable request logger carried in the application state.
#[derive(Clone)]
pub struct SharedLogger {
    inner: Arc<Mutex<Logger>>,
    console: Option<LevelHandle>,
}

impl SharedLogger {
    pub fn new(file_path: impl AsRef<Path>, min_level: LogLevel) -> std::io::Result<Self> {
        Ok(Self::from_logger(Logger::new(file_path, min_level)?))
    }

    pub fn in_memory(min_level: LogLevel) -> Self {
        Self::from_logger(Logger::in_memory(min_level))
    }

    fn from_logger(logger: Logger) -> Self {
        Self {
            inner: Arc::new(Mutex::new(logger)),
            console: None,
        }
    }

    /// Tie the console filter to this logger so `set_level` updates both.
    pub fn with_level_handle(mut self, handle: LevelHandle) -> Self {
        self.console = Some(handle);
        self
    }

    pub fn level(&self) -> LogLevel {
        self.inner
            .lock()
            .map(|l| l.min_level)
            .unwrap_or(LogLevel::Info)
    }

    pub fn set_level(&self, level: LogLevel) -> Result<()> {
        if let Some(ref handle) = self.console {
            handle.set(level)?;
        }
        if let Ok(mut logger) = self.inner.lock() {
            logger.min_level = level;
        }
        tracing::info!(level = %level, "Log level updated");
        Ok(())
    }

    pub fn log(&self, entry: LogEntry) {
        if let Ok(mut logger) = self.inner.lock() {
            logger.log(entry);
        }
    }

    pub fn info(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Info, component, message));
    }

    pub fn warn(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Warn, component, message));
    }

    pub fn error(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Error, component, message));
    }

    pub fn debug(&self, component: impl Into<String>, message: impl Into<String>) {
        self.log(LogEntry::new(LogLevel::Debug, component, message));
    }

    pub fn log_with_context(
        &self,
        level: LogLevel,
        component: impl Into<String>,
        message: impl Into<String>,
        context: serde_json::Value,
    ) {
        self.log(LogEntry::new(level, component, message).with_context(context));
    }

    pub fn recent(&self, limit: usize) -> Vec<LogEntry> {
        self.inner
            .lock()
            .map(|l| l.recent(limit))
            .unwrap_or_default()
    }
}
