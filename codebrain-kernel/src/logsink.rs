//! The daemon log sink
//!
//! Everything tracing emits flows through one sink with three outputs:
//! an append-only file with size-based rotation, a broadcast channel
//! feeding the SSE `/logs/stream` endpoint, and an EPIPE-safe mirror to
//! the original stderr. A write error on any output never propagates;
//! a dead log target must not take the daemon down.

use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Rotated files kept besides the live one
const MAX_ROTATED_FILES: usize = 5;
/// Rotation threshold
const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
/// SSE fan-out buffer; slow subscribers skip, they never block
const BROADCAST_CAPACITY: usize = 1024;

struct FileState {
    file: Option<File>,
    size: u64,
}

/// Shared log sink
pub struct LogSink {
    path: PathBuf,
    file_state: Mutex<FileState>,
    fanout: broadcast::Sender<String>,
    mirror_stderr: bool,
}

impl LogSink {
    /// Open (creating directories as needed) the sink at `path`
    ///
    /// # Errors
    ///
    /// Fails if the log file cannot be created.
    pub fn open(path: PathBuf, mirror_stderr: bool) -> std::io::Result<Arc<Self>> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let size = file.metadata()?.len();
        let (fanout, _) = broadcast::channel(BROADCAST_CAPACITY);

        Ok(Arc::new(Self {
            path,
            file_state: Mutex::new(FileState {
                file: Some(file),
                size,
            }),
            fanout,
            mirror_stderr,
        }))
    }

    /// Path of the live log file
    #[must_use]
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Subscribe to the line fan-out (SSE stream)
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.fanout.subscribe()
    }

    /// Write one line to all outputs; never fails
    pub fn write_line(&self, line: &str) {
        {
            let mut state = self.file_state.lock();
            if state.size + line.len() as u64 > MAX_FILE_SIZE {
                self.rotate(&mut state);
            }
            if let Some(file) = &mut state.file {
                if writeln!(file, "{line}").is_ok() {
                    let _ = file.flush();
                    state.size += line.len() as u64 + 1;
                }
            }
        }

        // No receivers is normal, not an error.
        let _ = self.fanout.send(line.to_string());

        if self.mirror_stderr {
            // EPIPE here means the parent terminal is gone; ignore.
            let _ = writeln!(std::io::stderr(), "{line}");
        }
    }

    /// Read the last `lines` lines from the live file
    #[must_use]
    pub fn tail(&self, lines: usize) -> (usize, Vec<String>) {
        let Ok(contents) = fs::read_to_string(&self.path) else {
            return (0, Vec::new());
        };
        let all: Vec<&str> = contents.lines().collect();
        let start = all.len().saturating_sub(lines);
        (all.len(), all[start..].iter().map(|s| (*s).to_string()).collect())
    }

    fn rotate(&self, state: &mut FileState) {
        state.file = None;

        let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
        let rotated = format!("{}.{timestamp}", self.path.display());
        let _ = fs::rename(&self.path, &rotated);

        self.cleanup_rotated();

        if let Ok(file) = OpenOptions::new().create(true).append(true).open(&self.path) {
            state.file = Some(file);
            state.size = 0;
        }
    }

    fn cleanup_rotated(&self) {
        let Some(parent) = self.path.parent() else {
            return;
        };
        let Some(base) = self.path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            return;
        };
        let Ok(entries) = fs::read_dir(parent) else {
            return;
        };

        let mut rotated: Vec<PathBuf> = entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy())
                    .is_some_and(|n| n.starts_with(&base) && n != base.as_str())
            })
            .collect();
        rotated.sort();

        while rotated.len() > MAX_ROTATED_FILES {
            let oldest = rotated.remove(0);
            let _ = fs::remove_file(oldest);
        }
    }
}

/// `MakeWriter` adapter so `tracing_subscriber::fmt` writes into the sink
pub struct SinkWriter {
    sink: Arc<LogSink>,
    buffer: Vec<u8>,
}

impl Write for SinkWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let text = String::from_utf8_lossy(&self.buffer);
            for line in text.lines() {
                self.sink.write_line(line);
            }
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for SinkWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogSinkMakeWriter {
    type Writer = SinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        SinkWriter {
            sink: Arc::clone(&self.0),
            buffer: Vec::new(),
        }
    }
}

/// Wrapper implementing `MakeWriter` over the shared sink
pub struct LogSinkMakeWriter(pub Arc<LogSink>);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_appends_and_tails() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::open(tmp.path().join("logs/daemon.log"), false).unwrap();

        sink.write_line("first");
        sink.write_line("second");
        sink.write_line("third");

        let (total, tail) = sink.tail(2);
        assert_eq!(total, 3);
        assert_eq!(tail, vec!["second".to_string(), "third".to_string()]);
    }

    #[tokio::test]
    async fn test_fanout_delivers_lines() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::open(tmp.path().join("daemon.log"), false).unwrap();

        let mut rx = sink.subscribe();
        sink.write_line("hello subscribers");
        assert_eq!(rx.recv().await.unwrap(), "hello subscribers");
    }

    #[test]
    fn test_write_survives_missing_receivers() {
        let tmp = tempfile::tempdir().unwrap();
        let sink = LogSink::open(tmp.path().join("daemon.log"), false).unwrap();
        // No subscribers at all; must not panic or error.
        sink.write_line("into the void");
        let (total, _) = sink.tail(10);
        assert_eq!(total, 1);
    }
}
