//! Child process helpers shared by the ffmpeg-backed collaborators.

use crate::lock::lock_or_recover;
use crate::log_debug;
use anyhow::{anyhow, Context, Result};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const STDERR_TAIL_LINES: usize = 32;
pub(crate) const CHILD_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drains a child's stderr on a thread, logging each line and keeping the
/// last few non-progress lines for error messages.
pub(crate) struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl StderrTail {
    pub(crate) fn spawn(child: &mut Child, label: &'static str) -> Self {
        let lines: Arc<Mutex<VecDeque<String>>> = Arc::new(Mutex::new(VecDeque::new()));
        let lines_for_thread = Arc::clone(&lines);
        let handle = child.stderr.take().map(|stderr| {
            thread::spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(content) => {
                            let trimmed = content.trim();
                            if trimmed.is_empty() {
                                continue;
                            }
                            log_debug(&format!("[{label}] {trimmed}"));
                            if is_progress_line(trimmed) {
                                continue;
                            }
                            let mut tail = lock_or_recover(&lines_for_thread, "stderr tail");
                            if tail.len() == STDERR_TAIL_LINES {
                                tail.pop_front();
                            }
                            tail.push_back(trimmed.to_string());
                        }
                        Err(err) => {
                            tracing::warn!(label, "failed to read ffmpeg stderr: {err}");
                            break;
                        }
                    }
                }
            })
        });
        Self { lines, handle }
    }

    /// Wait for the reader to hit EOF and return the retained lines.
    pub(crate) fn finish(mut self) -> Vec<String> {
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                log_debug("stderr reader thread panicked");
            }
        }
        lock_or_recover(&self.lines, "stderr tail")
            .iter()
            .cloned()
            .collect()
    }
}

fn is_progress_line(line: &str) -> bool {
    line.starts_with("frame=") || line.starts_with("size=") || line.contains("speed=")
}

/// Last few stderr lines joined for an error message.
pub(crate) fn summarize_tail(lines: &[String]) -> String {
    let start = lines.len().saturating_sub(4);
    lines[start..].join(" | ")
}

/// Poll `try_wait` until the child exits or `timeout` passes.
pub(crate) fn wait_with_timeout(child: &mut Child, timeout: Duration) -> Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().context("failed to poll child process")? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(CHILD_POLL_INTERVAL);
    }
}

/// Kill a child that outlived its deadline and reap it.
pub(crate) fn force_kill(child: &mut Child, label: &str) {
    if let Err(err) = child.kill() {
        tracing::warn!(label, "failed to kill child process: {err}");
    }
    if let Err(err) = child.wait() {
        tracing::warn!(label, "failed to reap child process: {err}");
    }
}

/// Run a short-lived tool command to completion under a deadline. Non-zero
/// exit and timeouts become errors carrying the stderr tail.
pub(crate) fn run_with_deadline(
    mut command: Command,
    label: &'static str,
    timeout: Duration,
) -> Result<()> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    let mut child = command
        .spawn()
        .with_context(|| format!("failed to start {label}"))?;
    let tail = StderrTail::spawn(&mut child, label);
    let status = wait_with_timeout(&mut child, timeout)?;
    let status = match status {
        Some(status) => status,
        None => {
            force_kill(&mut child, label);
            let lines = tail.finish();
            return Err(anyhow!(
                "{label} timed out after {}s: {}",
                timeout.as_secs(),
                summarize_tail(&lines)
            ));
        }
    };
    let lines = tail.finish();
    if !status.success() {
        return Err(anyhow!("{label} exited with {status}: {}", summarize_tail(&lines)));
    }
    Ok(())
}
