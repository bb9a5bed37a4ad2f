//! Process wide logging. Every record lands in a rotating file inside the app
//! data folder; a screen can additionally follow the lines of one tracking
//! session (e.g. a debug overlay on the tracking screen).

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
    sync::{mpsc, LazyLock, Mutex, PoisonError},
    thread,
};

use anyhow::Result;
use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};
use itertools::Itertools;
use log::{Level, LevelFilter, Log};
use serde::{Deserialize, Serialize};
use simplelog::{ConfigBuilder, WriteLogger};
use uuid::Uuid;

pub const LOG_FILE_NAME: &str = "ecotrack.log";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// `error`, `warn`, `info`, `debug` or `trace`.
    pub level: String,
    pub max_files: usize,
    pub lines_per_file: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: "info".to_string(),
            max_files: 3,
            lines_per_file: 1000,
        }
    }
}

impl LogConfig {
    fn level_filter(&self) -> Result<LevelFilter> {
        LevelFilter::from_str(&self.level).map_err(|_| anyhow!("unknown log level: {}", self.level))
    }
}

/// One log record as handed to listeners.
#[derive(Clone, Debug, PartialEq)]
pub struct LogLine {
    pub level: Level,
    pub target: String,
    /// The tracking session the line is about, if it names one.
    pub session_id: Option<Uuid>,
    pub message: String,
}

impl LogLine {
    fn from_record(record: &log::Record) -> Self {
        let message = record.args().to_string();
        LogLine {
            level: record.level(),
            target: record.target().to_string(),
            session_id: find_session_id(&message),
            message,
        }
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.target)?;
        if let Some(session_id) = self.session_id {
            write!(f, " [{}]", session_id)?;
        }
        write!(f, " -- {}", self.message)
    }
}

// tracker lines read "... session <uuid> ..."
fn find_session_id(message: &str) -> Option<Uuid> {
    message
        .split_whitespace()
        .tuple_windows()
        .find_map(|(word, id)| {
            (word == "session")
                .then(|| Uuid::parse_str(id.trim_end_matches(':')))
                .and_then(Result::ok)
        })
}

pub type LogListener = Box<dyn Fn(&LogLine) + Send + Sync>;

struct Follower {
    // `None` follows every line
    session_id: Option<Uuid>,
    listener: LogListener,
}

impl Follower {
    fn wants(&self, line: &LogLine) -> bool {
        self.session_id.is_none() || self.session_id == line.session_id
    }
}

static FOLLOWER: LazyLock<Mutex<Option<Follower>>> = LazyLock::new(|| Mutex::new(None));

static LINES: LazyLock<Mutex<Option<mpsc::Sender<LogLine>>>> = LazyLock::new(|| Mutex::new(None));

struct FileLogger {
    file: Box<WriteLogger<FileRotate<AppendTimestamp>>>,
}

impl Log for FileLogger {
    fn enabled(&self, metadata: &log::Metadata) -> bool {
        self.file.enabled(metadata)
    }

    fn log(&self, record: &log::Record) {
        if !self.enabled(record.metadata()) {
            return;
        }
        self.file.log(record);
        // listeners run on the forwarding thread, the caller only pays for
        // the channel send
        if let Some(lines) = LINES.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
            let _ = lines.send(LogLine::from_record(record));
        }
    }

    fn flush(&self) {
        self.file.flush();
    }
}

pub fn init(log_dir: &Path) -> Result<PathBuf> {
    init_with_config(log_dir, &LogConfig::default())
}

/// Installs the process logger. Returns the path of the live log file; rotated
/// files sit next to it with a timestamp suffix. Fails if a logger is already
/// installed.
pub fn init_with_config(log_dir: &Path, config: &LogConfig) -> Result<PathBuf> {
    let level = config.level_filter()?;
    if config.max_files == 0 || config.lines_per_file == 0 {
        bail!("log rotation needs at least one file of at least one line");
    }

    let path = log_dir.join(LOG_FILE_NAME);
    let file = FileRotate::new(
        &path,
        AppendTimestamp::default(FileLimit::MaxFiles(config.max_files)),
        ContentLimit::Lines(config.lines_per_file),
        Compression::None,
        #[cfg(unix)]
        None,
    );
    let format = ConfigBuilder::new().set_time_format_rfc3339().build();
    log::set_boxed_logger(Box::new(FileLogger {
        file: WriteLogger::new(level, format, file),
    }))?;
    log::set_max_level(level);

    start_forwarding()?;
    info!("[logs] logging at {} to {}", level, path.display());
    Ok(path)
}

fn start_forwarding() -> Result<()> {
    let mut lines = LINES.lock().unwrap_or_else(PoisonError::into_inner);
    if lines.is_some() {
        return Ok(());
    }

    let (tx, rx) = mpsc::channel::<LogLine>();
    thread::Builder::new()
        .name("log-forwarder".to_string())
        .spawn(move || {
            for line in rx {
                let follower = FOLLOWER.lock().unwrap_or_else(PoisonError::into_inner);
                if let Some(follower) = follower.as_ref().filter(|f| f.wants(&line)) {
                    (follower.listener)(&line);
                }
            }
        })?;
    *lines = Some(tx);
    Ok(())
}

fn set_follower(follower: Option<Follower>) {
    *FOLLOWER.lock().unwrap_or_else(PoisonError::into_inner) = follower;
}

/// Follows every line. Replaces any previous listener.
pub fn set_listener(listener: LogListener) {
    set_follower(Some(Follower {
        session_id: None,
        listener,
    }));
}

/// Follows only the lines about `session_id`. Replaces any previous listener.
pub fn set_session_listener(session_id: Uuid, listener: LogListener) {
    set_follower(Some(Follower {
        session_id: Some(session_id),
        listener,
    }));
}

pub fn clear_listener() {
    set_follower(None);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_id_in_message() {
        let id = Uuid::new_v4();
        assert_eq!(
            find_session_id(&format!("[route_tracker] session {} stopped: 3 points", id)),
            Some(id)
        );
        assert_eq!(
            find_session_id(&format!("[route_tracker] session {}: watch failed", id)),
            Some(id)
        );
        assert_eq!(find_session_id("session started"), None);
        assert_eq!(find_session_id(&id.to_string()), None);
    }

    #[test]
    fn line_format() {
        let id = Uuid::new_v4();
        let line = LogLine {
            level: Level::Warn,
            target: "ecotrack_core::route_tracker".to_string(),
            session_id: Some(id),
            message: "gps lost".to_string(),
        };
        assert_eq!(
            line.to_string(),
            format!("WARN:ecotrack_core::route_tracker [{}] -- gps lost", id)
        );
        let line = LogLine {
            session_id: None,
            ..line
        };
        assert_eq!(line.to_string(), "WARN:ecotrack_core::route_tracker -- gps lost");
    }

    #[test]
    fn config_levels() {
        assert_eq!(LogConfig::default().level_filter().unwrap(), LevelFilter::Info);
        let config = LogConfig {
            level: "DEBUG".to_string(),
            ..LogConfig::default()
        };
        assert_eq!(config.level_filter().unwrap(), LevelFilter::Debug);
        let config = LogConfig {
            level: "chatty".to_string(),
            ..LogConfig::default()
        };
        assert!(config.level_filter().is_err());
    }
}
