//! Diagnostic sink, named collaborator interface per §6.
//!
//! Mirrors the library's stance on timing: callers own logging policy, the
//! core only ever reports through this trait.

use std::fmt;

/// Severity of a logged event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Debug,
    Info,
    Warn,
    Error,
}

impl fmt::Display for Level {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Level::Debug => "debug",
            Level::Info => "info",
            Level::Warn => "warn",
            Level::Error => "error",
        };
        f.write_str(s)
    }
}

/// A diagnostic sink for the socket/channel/push/presence machinery.
pub trait Logger: Send + Sync + 'static {
    fn log(&self, level: Level, message: &str);

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }
}

/// Default production logger: discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLogger;

impl Logger for NoopLogger {
    fn log(&self, _level: Level, _message: &str) {}
}

/// A logger that writes to stderr, for examples and manual testing.
#[derive(Debug, Clone, Copy, Default)]
pub struct PrintLogger;

impl Logger for PrintLogger {
    fn log(&self, level: Level, message: &str) {
        eprintln!("[{level}] {message}");
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{Level, Logger};
    use std::sync::{Arc, Mutex};

    /// A logger that records every call for assertions.
    #[derive(Clone, Default)]
    pub struct RecordingLogger {
        pub entries: Arc<Mutex<Vec<(Level, String)>>>,
    }

    impl RecordingLogger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn contains(&self, level: Level, substring: &str) -> bool {
            self.entries
                .lock()
                .unwrap()
                .iter()
                .any(|(l, m)| *l == level && m.contains(substring))
        }
    }

    impl Logger for RecordingLogger {
        fn log(&self, level: Level, message: &str) {
            self.entries.lock().unwrap().push((level, message.to_string()));
        }
    }
}
