//! Diagnostic Records and Log Sinks

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use actix_web::http::StatusCode;

use super::recover::SourceLocation;

/// Severity of a [`Diagnostic`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Downstream service returned an error value
    Error,
    /// Configured error page could not be served
    Notice,
    /// Downstream service panicked
    Panic,
}

/// Single diagnostic line produced while intercepting a request.
///
/// The [`Display`](std::fmt::Display) implementation renders the
/// bracketed log format, for example `[ERROR 404 /index.html] not found`.
#[derive(Debug, Clone)]
pub struct Diagnostic {
    pub severity: Severity,
    /// Request path (errors) or full request uri (notices and panics)
    pub url: String,
    pub status: Option<StatusCode>,
    pub source: Option<SourceLocation>,
    pub detail: String,
}

impl Diagnostic {
    pub(crate) fn error(status: StatusCode, path: &str, detail: impl ToString) -> Self {
        Self {
            severity: Severity::Error,
            url: path.to_owned(),
            status: Some(status),
            source: None,
            detail: detail.to_string(),
        }
    }

    pub(crate) fn notice(status: StatusCode, url: String, detail: String) -> Self {
        Self {
            severity: Severity::Notice,
            url,
            status: Some(status),
            source: None,
            detail,
        }
    }

    pub(crate) fn panic(url: String, source: Option<SourceLocation>, detail: String) -> Self {
        Self {
            severity: Severity::Panic,
            url,
            status: None,
            source,
            detail,
        }
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self.status.map(|s| s.as_u16()).unwrap_or_default();
        match self.severity {
            Severity::Error => write!(f, "[ERROR {code} {}] {}", self.url, self.detail),
            Severity::Notice => write!(f, "[NOTICE {code} {}] {}", self.url, self.detail),
            Severity::Panic => {
                let (file, line) = match &self.source {
                    Some(src) => (src.file.as_str(), src.line),
                    None => ("", 0),
                };
                write!(f, "[PANIC {}] {file}:{line} - {}", self.url, self.detail)
            }
        }
    }
}

/// Destination for [`Diagnostic`] records.
///
/// Sinks are shared between every worker and request, and must
/// serialize their own writes.
pub trait LogSink: Send + Sync {
    fn log(&self, record: &Diagnostic);
}

/// Default [`LogSink`] forwarding records as [`tracing`] events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log(&self, record: &Diagnostic) {
        match record.severity {
            Severity::Error => tracing::error!(url = %record.url, "{record}"),
            Severity::Notice => tracing::warn!(url = %record.url, "{record}"),
            Severity::Panic => tracing::error!(
                url = %record.url,
                file = record.source.as_ref().map(|s| s.file.as_str()),
                line = record.source.as_ref().map(|s| s.line),
                "{record}"
            ),
        }
    }
}

/// Log rotation policy attached to a file destination.
///
/// Rotation is performed by external tooling; the policy is carried
/// alongside the sink so the host can hand it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRoller {
    /// Maximum size of the log file in megabytes before rotation
    pub max_size: u64,
    /// Maximum age of a rotated log in days
    pub max_age: u64,
    /// Maximum number of rotated logs kept
    pub max_backups: u64,
    /// Compress rotated logs
    pub compress: bool,
}

impl Default for LogRoller {
    fn default() -> Self {
        Self {
            max_size: 100,
            max_age: 14,
            max_backups: 10,
            compress: false,
        }
    }
}

impl LogRoller {
    /// Returns true if the sub-directive name configures log rotation.
    pub fn is_subdirective(name: &str) -> bool {
        matches!(
            name,
            "rotate_size" | "rotate_age" | "rotate_keep" | "rotate_compress"
        )
    }

    /// Apply a single rotation sub-directive to the policy.
    pub(crate) fn apply(&mut self, name: &str, args: &[String]) -> Result<(), String> {
        if name == "rotate_compress" {
            if !args.is_empty() {
                return Err(format!("{name} takes no arguments"));
            }
            self.compress = true;
            return Ok(());
        }
        let value = match args {
            [value] => value
                .parse::<u64>()
                .map_err(|_| format!("{name} expects a positive integer, got '{value}'"))?,
            _ => return Err(format!("{name} expects exactly one argument")),
        };
        match name {
            "rotate_size" => self.max_size = value,
            "rotate_age" => self.max_age = value,
            "rotate_keep" => self.max_backups = value,
            _ => return Err(format!("unknown rotation setting: {name}")),
        }
        Ok(())
    }
}

/// Where diagnostic lines are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogOutput {
    Stdout,
    Stderr,
    File(PathBuf),
}

/// Configured log destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogTarget {
    pub output: LogOutput,
    pub roller: Option<LogRoller>,
}

impl LogTarget {
    /// Open the configured destination as a shareable [`LogSink`].
    pub fn open(&self) -> io::Result<Arc<dyn LogSink>> {
        let sink = match &self.output {
            LogOutput::Stdout => WriterSink::new(Box::new(io::stdout())),
            LogOutput::Stderr => WriterSink::new(Box::new(io::stderr())),
            LogOutput::File(path) => {
                let file: File = OpenOptions::new().create(true).append(true).open(path)?;
                WriterSink::new(Box::new(file))
            }
        };
        Ok(Arc::new(sink.with_roller(self.roller.clone())))
    }
}

/// [`LogSink`] writing one line per record into any writer.
pub struct WriterSink {
    writer: Mutex<Box<dyn Write + Send>>,
    roller: Option<LogRoller>,
}

impl WriterSink {
    pub fn new(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
            roller: None,
        }
    }

    /// Attach a rotation policy to the sink.
    pub fn with_roller(mut self, roller: Option<LogRoller>) -> Self {
        self.roller = roller;
        self
    }

    /// Rotation policy configured for this sink, if any.
    pub fn roller(&self) -> Option<&LogRoller> {
        self.roller.as_ref()
    }
}

impl LogSink for WriterSink {
    fn log(&self, record: &Diagnostic) {
        let mut writer = match self.writer.lock() {
            Ok(writer) => writer,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Err(err) = writeln!(writer, "{record}").and_then(|_| writer.flush()) {
            tracing::error!("failed to write diagnostic: {err}");
        }
    }
}
