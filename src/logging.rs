//! Log sink: `tracing` output into a daily-rotated file.
//!
//! Sync mode writes on the calling thread; async mode pushes formatted
//! records through a bounded [`BlockQueue`] drained by a dedicated writer
//! thread, so the reactor never blocks on disk. When the queue is full the
//! record is dropped.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use chrono::{Local, NaiveDate};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::{Config, LogMode};
use crate::error::{ServerError, ServerResult};
use crate::queue::BlockQueue;

const LOG_DIR: &str = "log";
const LOG_BASE: &str = "nocturne";
const LOG_QUEUE_CAP: usize = 800;

/// `2026_08_02`-style suffix for one day's file.
pub fn day_stamp(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

/// Append-only file that reopens itself when the calendar day changes.
pub struct RollingFile {
    dir: PathBuf,
    base: String,
    stamp: String,
    file: Option<File>,
}

impl RollingFile {
    pub fn new(dir: impl Into<PathBuf>, base: &str) -> Self {
        Self {
            dir: dir.into(),
            base: base.to_string(),
            stamp: String::new(),
            file: None,
        }
    }

    pub fn current_path(&self) -> PathBuf {
        self.dir.join(format!("{}.{}", self.base, self.stamp))
    }

    fn roll_to(&mut self, stamp: String) -> io::Result<()> {
        fs::create_dir_all(&self.dir)?;
        self.stamp = stamp;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.current_path())?;
        self.file = Some(file);
        Ok(())
    }

    pub fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        let today = day_stamp(Local::now().date_naive());
        if self.file.is_none() || today != self.stamp {
            self.roll_to(today)?;
        }
        self.file.as_mut().expect("file just opened").write_all(buf)
    }

    pub fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(f) => f.flush(),
            None => Ok(()),
        }
    }
}

enum SinkInner {
    Sync(Mutex<RollingFile>),
    Async {
        queue: Arc<BlockQueue<Vec<u8>>>,
        writer: Mutex<Option<JoinHandle<()>>>,
    },
}

/// Cloneable handle shared between every logging call site and the
/// subscriber. Writes route to the file (sync) or the queue (async).
#[derive(Clone)]
pub struct LogSink {
    inner: Arc<SinkInner>,
}

impl LogSink {
    pub fn new(dir: impl Into<PathBuf>, base: &str, mode: LogMode) -> ServerResult<Self> {
        let mut rolling = RollingFile::new(dir, base);
        // Open eagerly so a bad log directory fails startup, not the first write.
        rolling
            .write_all(b"")
            .map_err(|e| ServerError::LogInit(e.to_string()))?;

        let inner = match mode {
            LogMode::Sync => SinkInner::Sync(Mutex::new(rolling)),
            LogMode::Async => {
                let queue: Arc<BlockQueue<Vec<u8>>> = Arc::new(BlockQueue::new(LOG_QUEUE_CAP));
                let drain = Arc::clone(&queue);
                let handle = std::thread::Builder::new()
                    .name("nocturne-log".to_string())
                    .spawn(move || {
                        let mut rolling = rolling;
                        while let Some(record) = drain.pop() {
                            let _ = rolling.write_all(&record);
                        }
                        let _ = rolling.flush();
                    })
                    .map_err(|e| ServerError::LogInit(e.to_string()))?;
                SinkInner::Async {
                    queue,
                    writer: Mutex::new(Some(handle)),
                }
            }
        };

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Flush and stop the writer thread (async mode). Sync mode just flushes.
    pub fn shutdown(&self) {
        match &*self.inner {
            SinkInner::Sync(file) => {
                let _ = file.lock().unwrap().flush();
            }
            SinkInner::Async { queue, writer } => {
                queue.close();
                if let Some(handle) = writer.lock().unwrap().take() {
                    let _ = handle.join();
                }
            }
        }
    }
}

impl Write for LogSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &*self.inner {
            SinkInner::Sync(file) => file.lock().unwrap().write_all(buf)?,
            SinkInner::Async { queue, .. } => {
                // Full queue: drop the record rather than stall the caller.
                let _ = queue.push(buf.to_vec());
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        match &*self.inner {
            SinkInner::Sync(file) => file.lock().unwrap().flush(),
            SinkInner::Async { .. } => Ok(()),
        }
    }
}

/// Install the global subscriber per config. Returns the sink so `main` can
/// flush it on shutdown; `None` when logging is disabled.
pub fn init(cfg: &Config) -> ServerResult<Option<LogSink>> {
    if !cfg.log_enabled {
        tracing_subscriber::registry()
            .with(EnvFilter::new("off"))
            .init();
        return Ok(None);
    }

    let sink = LogSink::new(LOG_DIR, LOG_BASE, cfg.log_mode)?;
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let writer_sink = sink.clone();
    tracing_subscriber::registry()
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(move || writer_sink.clone()),
        )
        .init();

    Ok(Some(sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process;

    fn temp_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("nocturne-log-{}-{}", tag, process::id()));
        let _ = fs::remove_dir_all(&dir);
        dir
    }

    #[test]
    fn day_stamp_format() {
        let d = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(day_stamp(d), "2024_03_07");
    }

    #[test]
    fn rolling_file_writes_dated_file() {
        let dir = temp_dir("roll");
        let mut rolling = RollingFile::new(&dir, "test");
        rolling.write_all(b"hello\n").unwrap();
        let path = rolling.current_path();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("test."));
        assert_eq!(name.len(), "test.".len() + 10);
        assert_eq!(fs::read(&path).unwrap(), b"hello\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn rolling_file_reopens_on_new_stamp() {
        let dir = temp_dir("reopen");
        let mut rolling = RollingFile::new(&dir, "test");
        rolling.roll_to("1999_12_31".to_string()).unwrap();
        let old = rolling.current_path();
        rolling.write_all(b"x").unwrap();
        // write_all saw a stale stamp and rolled to today's file
        assert_ne!(rolling.current_path(), old);
        assert_eq!(fs::read(rolling.current_path()).unwrap(), b"x");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn sync_sink_appends() {
        let dir = temp_dir("sync");
        let mut sink = LogSink::new(&dir, "s", LogMode::Sync).unwrap();
        sink.write_all(b"one\n").unwrap();
        sink.write_all(b"two\n").unwrap();
        sink.shutdown();
        let path = match &*sink.inner {
            SinkInner::Sync(file) => file.lock().unwrap().current_path(),
            _ => unreachable!(),
        };
        assert_eq!(fs::read(path).unwrap(), b"one\ntwo\n");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn async_sink_drains_on_shutdown() {
        let dir = temp_dir("async");
        let mut sink = LogSink::new(&dir, "a", LogMode::Async).unwrap();
        for _ in 0..10 {
            sink.write_all(b"line\n").unwrap();
        }
        sink.shutdown();
        let entries: Vec<_> = fs::read_dir(&dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content = fs::read(entries[0].as_ref().unwrap().path()).unwrap();
        assert_eq!(content, b"line\n".repeat(10));
        let _ = fs::remove_dir_all(&dir);
    }
}
