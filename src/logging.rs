//! Logging setup: a terminal logger combined with a background JSONL log
//! file that survives for post-mortem inspection of a failed staging
//! attempt. Both sit behind one fan-out dispatcher.

use std::{fs, fs::File, io::Write, path::Path, sync::Mutex};

use log::{LevelFilter, Log, Record};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
struct LogEntry {
    pub level: Level,
    pub message: String,
    pub target: String,
    pub module: String,
    pub file: String,
    pub line: u32,
}

#[derive(Debug, Serialize, Deserialize, Copy, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Level {
    Error = 1,
    Warn = 2,
    Info = 3,
    Debug = 4,
    Trace = 5,
}

impl From<log::Level> for Level {
    fn from(value: log::Level) -> Self {
        match value {
            log::Level::Error => Level::Error,
            log::Level::Warn => Level::Warn,
            log::Level::Info => Level::Info,
            log::Level::Debug => Level::Debug,
            log::Level::Trace => Level::Trace,
        }
    }
}

impl From<&Record<'_>> for LogEntry {
    fn from(value: &Record) -> Self {
        Self {
            level: value.level().into(),
            message: value.args().to_string(),
            target: value.target().to_string(),
            module: value.module_path().unwrap_or_default().to_string(),
            file: value.file().unwrap_or_default().to_string(),
            line: value.line().unwrap_or_default(),
        }
    }
}

pub struct BackgroundLog {
    target: Option<Mutex<File>>,
    max_level: LevelFilter,
}

impl BackgroundLog {
    pub fn new(target: impl AsRef<Path>) -> Self {
        let file = match Self::create_file(target.as_ref()) {
            Ok(f) => Some(Mutex::new(f)),
            Err(err) => {
                eprintln!(
                    "Logging setup error: failed to create background log file: {:?}",
                    err
                );
                None
            }
        };

        Self {
            max_level: LevelFilter::Trace,
            target: file,
        }
    }

    fn create_file(path: &Path) -> std::io::Result<File> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(path)
    }

    pub fn into_logger(self) -> Box<dyn Log> {
        Box::new(self)
    }

    /// Best effort attempt to write the log entry to the file
    fn write_entry(&self, record: &Record) -> Result<(), Box<dyn std::error::Error + '_>> {
        if let Some(file) = self.target.as_ref() {
            let mut serialized = serde_json::to_string(&LogEntry::from(record))?;
            serialized.push('\n');

            let mut file_lock = file.lock()?;
            file_lock.write_all(serialized.as_bytes())?;
            file_lock.flush()?;
        }

        Ok(())
    }
}

impl Log for BackgroundLog {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.target.is_some() && metadata.level() <= self.max_level
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        if let Err(err) = self.write_entry(record) {
            eprintln!("Failed to write log entry: {:?}", err);
        }
    }

    fn flush(&self) {}
}

pub struct MultiLogger {
    loggers: Vec<Box<dyn Log>>,
    max_level: LevelFilter,
}

impl Default for MultiLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl MultiLogger {
    pub fn new() -> Self {
        Self {
            loggers: Vec::new(),
            max_level: LevelFilter::Debug,
        }
    }

    pub fn with_logger(mut self, logger: Box<dyn Log>) -> Self {
        self.loggers.push(logger);
        self
    }

    pub fn with_max_level(mut self, max_level: LevelFilter) -> Self {
        self.max_level = max_level;
        self
    }

    pub fn init(self) -> Result<(), log::SetLoggerError> {
        log::set_max_level(self.max_level);
        log::set_boxed_logger(Box::new(self))
    }
}

impl Log for MultiLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.loggers.iter().any(|l| l.enabled(metadata))
    }

    fn log(&self, record: &log::Record) {
        self.loggers
            .iter()
            .filter(|l| l.enabled(record.metadata()))
            .for_each(|l| l.log(record));
    }

    fn flush(&self) {
        self.loggers.iter().for_each(|l| l.flush());
    }
}

/// Wire up terminal + background logging and the tracing subscriber that
/// carries metric events.
pub fn init(verbosity: LevelFilter, background_log: Option<&Path>) {
    let term = Box::new(
        env_logger::Builder::new()
            .filter_level(verbosity)
            .format_timestamp_millis()
            .build(),
    );

    let mut multilog = MultiLogger::new()
        .with_max_level(LevelFilter::Trace)
        .with_logger(term);
    if let Some(path) = background_log {
        multilog = multilog.with_logger(BackgroundLog::new(path).into_logger());
    }
    if let Err(e) = multilog.init() {
        eprintln!("Logging setup error: {e}");
    }

    let subscriber = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}
