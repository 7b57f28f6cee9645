//! Structured event emission toward the embedder.

use std::io::Write;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

/// Verbosity of structured `log` events.
///
/// The numeric order matters: a level is emitted when it is less than or
/// equal to the configured one.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Quiet,
    Err,
    #[default]
    Warning,
    Info,
    Debug,
    Debug2,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Quiet => "QUIET",
            LogLevel::Err => "ERR",
            LogLevel::Warning => "WARNING",
            LogLevel::Info => "INFO",
            LogLevel::Debug => "DEBUG",
            LogLevel::Debug2 => "DEBUG2",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "QUIET" => Some(LogLevel::Quiet),
            "ERR" => Some(LogLevel::Err),
            "WARNING" => Some(LogLevel::Warning),
            "INFO" => Some(LogLevel::Info),
            "DEBUG" => Some(LogLevel::Debug),
            "DEBUG2" => Some(LogLevel::Debug2),
            _ => None,
        }
    }
}

/// Consumer of the structured event stream.
///
/// Sinks may be invoked from worker tasks; the emitter serializes calls, so
/// implementations do not need their own locking.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &Value);
}

/// Writes each event as a JSON line on stderr.
#[derive(Debug, Default)]
pub struct StderrSink;

impl EventSink for StderrSink {
    fn on_event(&mut self, event: &Value) {
        writeln!(std::io::stderr().lock(), "{event}").ok();
    }
}

/// Collects events into a shared vector so a run can be inspected after the
/// fact. Useful for embedders and tests.
#[derive(Debug, Clone, Default)]
pub struct CollectingSink {
    events: Arc<Mutex<Vec<Value>>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Value> {
        self.events.lock().expect("poisoned").clone()
    }
}

impl EventSink for CollectingSink {
    fn on_event(&mut self, event: &Value) {
        self.events.lock().expect("poisoned").push(event.clone());
    }
}

/// Cheap-to-clone handle wrapping values as `{key, value}` events and
/// forwarding them to the sink.
#[derive(Clone)]
pub struct Emitter {
    inner: Arc<Inner>,
}

struct Inner {
    sink: Mutex<Box<dyn EventSink>>,
    log_level: LogLevel,
}

impl Emitter {
    pub fn new(sink: Box<dyn EventSink>, log_level: LogLevel) -> Self {
        Self {
            inner: Arc::new(Inner {
                sink: Mutex::new(sink),
                log_level,
            }),
        }
    }

    pub fn log_level(&self) -> LogLevel {
        self.inner.log_level
    }

    /// Emit one event. `value` must be a JSON object. Emission is best
    /// effort: sink problems are swallowed.
    pub fn emit(&self, key: &str, value: Value) {
        debug_assert!(value.is_object());
        let event = json!({ "key": key, "value": value });
        if let Ok(mut sink) = self.inner.sink.lock() {
            sink.on_event(&event);
        }
    }

    /// Emit a structured `log` event when `level` is within the configured
    /// verbosity.
    pub fn log(&self, level: LogLevel, message: impl AsRef<str>) {
        if level == LogLevel::Quiet || self.inner.log_level < level {
            return;
        }
        self.emit(
            "log",
            json!({
                "log_level": level.as_str(),
                "message": message.as_ref(),
            }),
        );
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Warning, message);
    }

    pub fn info(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Info, message);
    }

    pub fn debug(&self, message: impl AsRef<str>) {
        self.log(LogLevel::Debug, message);
    }
}
