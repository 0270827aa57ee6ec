//! Worker log multiplexer
//!
//! Every worker gets two tasks: one follows the container output into an
//! in-memory pipe, the other reads that pipe line by line, flattens
//! structured lines and writes them either to `<log dir>/<worker>.log` or to
//! the console prefixed with the worker name.

use corral_core::domain::log::format_log_line;
use corral_core::domain::worker::WorkerInstance;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::runtime::ContainerRuntime;

const PIPE_CAPACITY: usize = 64 * 1024;

/// Where rendered worker lines go
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    Console,
    Directory(PathBuf),
}

impl LogTarget {
    pub fn from_path(log_path: Option<&Path>) -> Self {
        match log_path {
            Some(dir) => LogTarget::Directory(dir.to_path_buf()),
            None => LogTarget::Console,
        }
    }

    /// Path of the file receiving a worker's lines, if any
    pub fn file_for(&self, worker: &str) -> Option<PathBuf> {
        match self {
            LogTarget::Console => None,
            LogTarget::Directory(dir) => Some(dir.join(format!("{}.log", worker))),
        }
    }

    /// Writes one rendered line
    ///
    /// The file is reopened for every line so that everything written so far
    /// survives a crash of this process.
    async fn write(&self, worker: &str, line: &str) -> std::io::Result<()> {
        match self.file_for(worker) {
            None => write_prefixed(&mut std::io::stdout().lock(), worker, line),
            Some(path) => {
                let mut file = tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .await?;
                file.write_all(line.as_bytes()).await?;
                file.write_all(b"\n").await?;
                file.flush().await
            }
        }
    }
}

fn write_prefixed(out: &mut impl Write, worker: &str, line: &str) -> std::io::Result<()> {
    writeln!(out, "{}: {}", worker, line)?;
    out.flush()
}

/// Spawns the log tasks for fleet members
#[derive(Clone)]
pub struct LogMultiplexer {
    runtime: Arc<dyn ContainerRuntime>,
    target: LogTarget,
}

impl LogMultiplexer {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, target: LogTarget) -> Self {
        Self { runtime, target }
    }

    /// Starts following one worker's output
    ///
    /// Returns the reader task, which finishes once the stream closes. Errors
    /// end only this worker's tasks.
    pub fn attach(&self, worker: &WorkerInstance) -> JoinHandle<()> {
        let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);

        let runtime = self.runtime.clone();
        let id = worker.id.clone();
        let name = worker.name.clone();
        tokio::spawn(async move {
            if let Err(e) = runtime.stream_logs(&id, Box::new(writer)).await {
                debug!("Log stream for {} ended: {}", name, e);
            }
        });

        let target = self.target.clone();
        let name = worker.name.clone();
        tokio::spawn(async move {
            if let Err(e) = route_lines(&name, reader, &target).await {
                warn!("Stopped reading logs of {}: {}", name, e);
            }
        })
    }
}

/// Reads raw lines until end of stream, rendering and routing each one
///
/// A line that cannot be written is dropped; only a read error ends the loop.
async fn route_lines<R>(worker: &str, reader: R, target: &LogTarget) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            return Ok(());
        }
        let raw = String::from_utf8_lossy(&buf);
        let raw = raw.trim_end_matches(['\n', '\r']);
        if let Err(e) = target.write(worker, &format_log_line(raw)).await {
            warn!("Dropped a log line of {}: {}", worker, e);
        }
    }
}
