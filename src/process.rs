//! Subprocess supervision for the managed tools.
//!
//! Stdout and stderr are drained by one reader thread each into a shared
//! channel, so the consumer sees a single merged line stream. Lines from one
//! pipe keep their order; lines from different pipes interleave in arrival
//! order.

use crate::progress::{self, ProgressSample};
use crate::{cmd, EngineError, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;
use std::process::{Child, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL_MS: u64 = 200;
const TAIL_LINES: usize = 50;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Kill the process after this long; 0 disables the limit.
    pub timeout_secs: u64,
    pub cancel: Option<Arc<AtomicBool>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OutputLine {
    pub text: String,
    /// Set when the line is a progress report.
    pub progress: Option<ProgressSample>,
}

#[derive(Debug, Clone)]
pub struct ExitOutcome {
    pub tool: String,
    pub code: Option<i32>,
    pub success: bool,
    /// Last lines of merged output, oldest first.
    pub tail: Vec<String>,
}

impl ExitOutcome {
    /// Turns a non-zero exit into `ProcessExitedNonZero`.
    pub fn check(self) -> Result<Self> {
        if self.success {
            return Ok(self);
        }
        Err(EngineError::ProcessExitedNonZero {
            detail: failure_detail(&self.tail),
            tool: self.tool,
            code: self.code,
        })
    }
}

fn failure_detail(tail: &[String]) -> String {
    let errors: Vec<&str> = tail
        .iter()
        .map(String::as_str)
        .filter(|l| l.starts_with("ERROR:"))
        .collect();
    if !errors.is_empty() {
        return errors.join(" | ");
    }
    tail.iter()
        .rev()
        .find(|l| progress::parse(l).is_none())
        .cloned()
        .unwrap_or_else(|| "no output".to_string())
}

enum AbortReason {
    Canceled,
    TimedOut(u64),
}

impl From<AbortReason> for EngineError {
    fn from(reason: AbortReason) -> Self {
        match reason {
            AbortReason::Canceled => EngineError::Canceled,
            AbortReason::TimedOut(secs) => EngineError::TimedOut(secs),
        }
    }
}

/// A running tool. Iterate it for output lines, then call [`ProcessHandle::wait`].
pub struct ProcessHandle {
    tool: String,
    child: Child,
    lines: Receiver<String>,
    readers: Vec<JoinHandle<()>>,
    started: Instant,
    options: RunOptions,
    abort: Option<AbortReason>,
    tail: VecDeque<String>,
    done: bool,
    reaped: bool,
}

pub fn run(executable: &Path, args: &[String], options: RunOptions) -> Result<ProcessHandle> {
    let tool = tool_name(executable);
    debug!(tool = %tool, ?args, "spawning");

    let mut child = cmd::command(executable)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => EngineError::ToolMissing { tool: tool.clone() },
            _ => EngineError::ProcessLaunchFailed {
                tool: tool.clone(),
                source: e,
            },
        })?;

    let (tx, rx) = mpsc::channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        readers.push(spawn_reader(stdout, tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        readers.push(spawn_reader(stderr, tx.clone()));
    }
    drop(tx);

    Ok(ProcessHandle {
        tool,
        child,
        lines: rx,
        readers,
        started: Instant::now(),
        options,
        abort: None,
        tail: VecDeque::with_capacity(TAIL_LINES),
        done: false,
        reaped: false,
    })
}

impl ProcessHandle {
    /// Consumes any lines not yet read, then reaps the process.
    pub fn wait(mut self) -> Result<ExitOutcome> {
        while self.next().is_some() {}

        if let Some(reason) = self.abort.take() {
            let _ = self.child.wait();
            self.reaped = true;
            return Err(reason.into());
        }

        let status = self.child.wait()?;
        self.reaped = true;
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }

        debug!(tool = %self.tool, code = ?status.code(), "process exited");
        Ok(ExitOutcome {
            tool: self.tool.clone(),
            code: status.code(),
            success: status.success(),
            tail: self.tail.drain(..).collect(),
        })
    }

    fn check_abort(&mut self) {
        if self.abort.is_some() {
            return;
        }
        let canceled = self
            .options
            .cancel
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::SeqCst));
        let reason = if canceled {
            AbortReason::Canceled
        } else if self.options.timeout_secs > 0
            && self.started.elapsed() >= Duration::from_secs(self.options.timeout_secs)
        {
            AbortReason::TimedOut(self.options.timeout_secs)
        } else {
            return;
        };

        warn!(tool = %self.tool, "stopping process");
        kill_child_process_tree(&mut self.child);
        self.reaped = true;
        self.abort = Some(reason);
        // Grandchildren (ffmpeg) may still hold the pipes open; stop reading now.
        self.done = true;
    }

    fn remember(&mut self, line: &str) {
        if self.tail.len() == TAIL_LINES {
            self.tail.pop_front();
        }
        self.tail.push_back(line.to_string());
    }
}

impl Iterator for ProcessHandle {
    type Item = OutputLine;

    fn next(&mut self) -> Option<OutputLine> {
        loop {
            if self.done {
                return None;
            }
            self.check_abort();
            if self.done {
                return None;
            }
            match self
                .lines
                .recv_timeout(Duration::from_millis(POLL_INTERVAL_MS))
            {
                Ok(text) => {
                    let progress = progress::parse(&text);
                    if progress.is_none() {
                        debug!(tool = %self.tool, "{text}");
                    }
                    self.remember(&text);
                    return Some(OutputLine { text, progress });
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    self.done = true;
                }
            }
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.reaped {
            kill_child_process_tree(&mut self.child);
        }
    }
}

fn spawn_reader(stream: impl Read + Send + 'static, tx: Sender<String>) -> JoinHandle<()> {
    thread::spawn(move || {
        let reader = BufReader::new(stream);
        for segment in reader.split(b'\n') {
            let Ok(bytes) = segment else {
                break;
            };
            // Progress redraws use bare carriage returns.
            for piece in bytes.split(|b| *b == b'\r') {
                let text = decode_dropping_invalid(piece);
                let text = text.trim_end();
                if text.trim_start().is_empty() {
                    continue;
                }
                if tx.send(text.to_string()).is_err() {
                    return;
                }
            }
        }
    })
}

/// Keeps the valid UTF-8 runs of `bytes` and silently drops the rest.
pub fn decode_dropping_invalid(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        out.push_str(chunk.valid());
    }
    out
}

fn kill_child_process_tree(child: &mut Child) {
    #[cfg(windows)]
    {
        let pid = child.id().to_string();
        let _ = cmd::command("taskkill")
            .args(["/PID", &pid, "/T", "/F"])
            .status();
    }

    let _ = child.kill();
    let _ = child.wait();
}

fn tool_name(executable: &Path) -> String {
    executable
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| executable.to_string_lossy().to_string())
}
