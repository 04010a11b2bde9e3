//! `log` backend that forwards to `env_logger` and to observers handed in at
//! construction.

use chrono::{DateTime, Utc};
use log::{Level, Log, Metadata, Record};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub level: Level,
    pub target: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

pub trait LogObserver: Send + Sync {
    fn on_log_entry(&self, entry: &LogEntry);
}

impl<F> LogObserver for F
where
    F: Fn(&LogEntry) + Send + Sync,
{
    fn on_log_entry(&self, entry: &LogEntry) {
        self(entry)
    }
}

pub struct ObservedLogger {
    inner: env_logger::Logger,
    observers: Vec<Arc<dyn LogObserver>>,
}

impl ObservedLogger {
    pub fn new(inner: env_logger::Logger, observers: Vec<Arc<dyn LogObserver>>) -> Self {
        ObservedLogger { inner, observers }
    }

    /// Install as the global logger with the `env_logger` defaults (`info`,
    /// overridable through `RUST_LOG`).
    pub fn install(observers: Vec<Arc<dyn LogObserver>>) -> Result<(), log::SetLoggerError> {
        let inner = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).build();
        let max = inner.filter();
        log::set_boxed_logger(Box::new(ObservedLogger::new(inner, observers)))?;
        log::set_max_level(max);
        Ok(())
    }
}

impl Log for ObservedLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.inner.matches(record) {
            return;
        }
        self.inner.log(record);
        if self.observers.is_empty() {
            return;
        }
        let entry = LogEntry {
            level: record.level(),
            target: record.target().to_string(),
            message: record.args().to_string(),
            timestamp: Utc::now(),
        };
        for observer in &self.observers {
            observer.on_log_entry(&entry);
        }
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Keeps the most recent entries.
pub struct LogHistory {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogHistory {
    pub fn new(capacity: usize) -> Self {
        LogHistory {
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        match self.entries.lock() {
            Ok(guard) => guard.iter().cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Entries at warning level or worse.
    pub fn problems(&self) -> usize {
        self.snapshot().iter().filter(|e| e.level <= Level::Warn).count()
    }
}

impl LogObserver for LogHistory {
    fn on_log_entry(&self, entry: &LogEntry) {
        if let Ok(mut guard) = self.entries.lock() {
            if guard.len() == self.capacity {
                guard.pop_front();
            }
            guard.push_back(entry.clone());
        }
    }
}
