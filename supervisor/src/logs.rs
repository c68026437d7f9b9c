//! Per-service output capture: an append-only file plus a bounded in-memory tail.
//!
//! Every line is timestamped and buffered synchronously. The file side is owned by
//! one writer task per service, fed through a channel, so capture never waits on
//! disk I/O and truncation is ordered after every line written before it.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

/// Default cap on buffered line text per service.
pub const DEFAULT_BUFFER_CAPACITY: usize = 1024 * 1024;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Result of a log read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogTail {
    pub line_count: usize,
    pub lines: Vec<String>,
}

impl LogTail {
    fn new(lines: Vec<String>) -> Self {
        Self {
            line_count: lines.len(),
            lines,
        }
    }
}

enum LogCommand {
    Line(String),
    Truncate(oneshot::Sender<io::Result<()>>),
    Flush(oneshot::Sender<io::Result<()>>),
}

#[derive(Default)]
struct ServiceLog {
    lines: VecDeque<String>,
    bytes: usize,
    writer: Option<mpsc::UnboundedSender<LogCommand>>,
}

impl ServiceLog {
    fn push(&mut self, line: String, capacity: usize) {
        self.bytes += line.len();
        self.lines.push_back(line);

        if self.bytes > capacity {
            // Drop the oldest half; the file keeps everything.
            while self.bytes > capacity / 2 {
                match self.lines.pop_front() {
                    Some(dropped) => self.bytes -= dropped.len(),
                    None => break,
                }
            }
        }
    }

    fn clear(&mut self) {
        self.lines.clear();
        self.bytes = 0;
    }

    fn tail(&self, count: usize) -> Vec<String> {
        let skip = self.lines.len().saturating_sub(count);
        self.lines.iter().skip(skip).cloned().collect()
    }
}

/// Owns one service's log file. Lines are appended through a buffered writer that
/// is flushed whenever the queue runs dry.
struct LogWriter {
    name: String,
    directory: PathBuf,
    path: PathBuf,
    file: Option<BufWriter<File>>,
}

impl LogWriter {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<LogCommand>) {
        while let Some(command) = commands.recv().await {
            self.handle(command).await;
            while let Ok(command) = commands.try_recv() {
                self.handle(command).await;
            }
            if let Err(e) = self.flush().await {
                warn!(service = %self.name, "failed to flush log file: {}", e);
            }
        }
    }

    async fn handle(&mut self, command: LogCommand) {
        match command {
            LogCommand::Line(line) => {
                if let Err(e) = self.append(&line).await {
                    warn!(service = %self.name, "failed to write log file: {}", e);
                }
            }
            LogCommand::Truncate(done) => drop(done.send(self.truncate().await)),
            LogCommand::Flush(done) => drop(done.send(self.flush().await)),
        }
    }

    async fn open(&mut self) -> io::Result<&mut BufWriter<File>> {
        let file = match self.file.take() {
            Some(file) => file,
            None => {
                tokio::fs::create_dir_all(&self.directory).await?;
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&self.path)
                    .await?;
                BufWriter::new(file)
            }
        };
        Ok(self.file.insert(file))
    }

    async fn append(&mut self, line: &str) -> io::Result<()> {
        let file = self.open().await?;
        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await
    }

    async fn truncate(&mut self) -> io::Result<()> {
        let file = self.open().await?;
        file.flush().await?;
        file.get_ref().set_len(0).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        match self.file.as_mut() {
            Some(file) => file.flush().await,
            None => Ok(()),
        }
    }
}

pub struct LogSink {
    directory: PathBuf,
    capacity: usize,
    logs: Mutex<HashMap<String, ServiceLog>>,
}

impl LogSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self::with_capacity(directory, DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_capacity(directory: impl Into<PathBuf>, capacity: usize) -> Self {
        Self {
            directory: directory.into(),
            capacity,
            logs: Mutex::new(HashMap::new()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Location of a service's log file.
    pub fn path(&self, name: &str) -> PathBuf {
        self.directory.join(format!("{}.log", name))
    }

    /// Truncate both the file and the buffer, so the next run starts from an empty log.
    pub async fn reset(&self, name: &str) -> io::Result<()> {
        let (done, truncated) = oneshot::channel();
        {
            let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            let log = logs.entry(name.to_owned()).or_default();
            log.clear();
            self.send(log, name, LogCommand::Truncate(done));
        }
        truncated.await.unwrap_or_else(|_| Err(writer_gone()))
    }

    /// Reset every log the sink knows of, plus the given names.
    pub async fn reset_all<'a>(&self, names: impl IntoIterator<Item = &'a str>) -> io::Result<()> {
        let mut all: Vec<String> = {
            let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            logs.keys().cloned().collect()
        };
        all.extend(names.into_iter().map(str::to_owned));
        all.sort();
        all.dedup();

        for name in all {
            self.reset(&name).await?;
        }
        Ok(())
    }

    /// Timestamp `text`, buffer it, and queue it for the file. Never waits on disk I/O.
    pub fn write(&self, name: &str, stream: Stream, text: &str) {
        let line = format_line(stream, text);

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(name.to_owned()).or_default();
        log.push(line.clone(), self.capacity);
        self.send(log, name, LogCommand::Line(line));
    }

    /// Wait until every line written so far has reached the file.
    pub async fn flush(&self, name: &str) -> io::Result<()> {
        let (done, flushed) = oneshot::channel();
        {
            let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(log) = logs.get_mut(name) else {
                return Ok(());
            };
            self.send(log, name, LogCommand::Flush(done));
        }
        flushed.await.unwrap_or_else(|_| Err(writer_gone()))
    }

    /// Hydrate the buffer from the existing file, so a service left running by a
    /// previous session keeps its history. Returns the number of lines loaded.
    pub async fn load(&self, name: &str) -> io::Result<usize> {
        let lines = match read_lines(&self.path(name)).await {
            Ok(lines) => lines,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let count = lines.len();

        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        let log = logs.entry(name.to_owned()).or_default();
        log.clear();
        for line in lines {
            log.push(line, self.capacity);
        }

        Ok(count)
    }

    /// Last `tail` lines, from the buffer or, before anything was buffered, from the file.
    pub async fn read(&self, name: &str, tail: usize) -> io::Result<LogTail> {
        if let Some(lines) = self.buffered(name, tail) {
            return Ok(LogTail::new(lines));
        }

        match read_lines(&self.path(name)).await {
            Ok(lines) => {
                let skip = lines.len().saturating_sub(tail);
                Ok(LogTail::new(lines.into_iter().skip(skip).collect()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(LogTail::default()),
            Err(e) => Err(e),
        }
    }

    /// Drop the in-memory state of an unregistered service. The file stays on disk,
    /// and lines already queued for it are still written.
    pub fn forget(&self, name: &str) {
        let mut logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.remove(name);
    }

    fn buffered(&self, name: &str, tail: usize) -> Option<Vec<String>> {
        let logs = self.logs.lock().unwrap_or_else(PoisonError::into_inner);
        logs.get(name).map(|log| log.tail(tail))
    }

    /// Queue a command for the service's writer task, starting the task on first use.
    fn send(&self, log: &mut ServiceLog, name: &str, command: LogCommand) {
        let writer = log.writer.get_or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            let writer = LogWriter {
                name: name.to_owned(),
                directory: self.directory.clone(),
                path: self.path(name),
                file: None,
            };
            tokio::spawn(writer.run(rx));
            tx
        });
        // The writer only stops once every sender is gone.
        drop(writer.send(command));
    }
}

fn writer_gone() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "log writer stopped")
}

fn format_line(stream: Stream, text: &str) -> String {
    let timestamp = chrono::Local::now().format(TIMESTAMP_FORMAT);
    match stream {
        Stream::Stdout => format!("[{}] {}", timestamp, text),
        Stream::Stderr => format!("[{}] [stderr] {}", timestamp, text),
    }
}

async fn read_lines(path: &Path) -> io::Result<Vec<String>> {
    let contents = tokio::fs::read(path).await?;
    let contents = contents.strip_suffix(b"\n").unwrap_or(&contents);
    if contents.is_empty() {
        return Ok(Vec::new());
    }
    Ok(contents
        .split(|byte| *byte == b'\n')
        .map(|line| {
            String::from_utf8_lossy(line)
                .trim_end_matches('\r')
                .to_owned()
        })
        .collect())
}
