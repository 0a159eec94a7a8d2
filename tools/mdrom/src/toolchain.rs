//! External toolchain invocation.
//!
//! One `Invocation` is one compiler/assembler/linker process run. The
//! argument vector is assembled up front from the build config, the process
//! is spawned directly (no shell), and stdout/stderr are captured on reader
//! threads while the coordinator polls for exit, cancellation, or timeout.
//! On anything but success the declared output file is removed, so a caller
//! can always tell "not built" from "built". Retries are not this layer's
//! business.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::config::BuildConfig;

/// Shared flag polled by in-flight invocations; raised to kill them.
pub type CancelFlag = Arc<AtomicBool>;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolStage {
    Compile,
    Assemble,
    Link,
}

/// A fully-assembled external process run.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub stage: ToolStage,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub output: PathBuf,
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone)]
pub enum InvokeOutcome {
    /// Exit code 0. Diagnostics hold any warnings the tool printed.
    Success { diagnostics: String },
    /// Nonzero exit code, with the captured stdout/stderr.
    ToolError { code: i32, diagnostics: String },
    /// The process could not run to completion: spawn failure, signal,
    /// timeout, or cancellation.
    FatalProcess { reason: String },
}

impl InvokeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, InvokeOutcome::Success { .. })
    }

    pub fn diagnostics(&self) -> &str {
        match self {
            InvokeOutcome::Success { diagnostics } => diagnostics,
            InvokeOutcome::ToolError { diagnostics, .. } => diagnostics,
            InvokeOutcome::FatalProcess { reason } => reason,
        }
    }
}

enum WaitEnd {
    Exited(ExitStatus),
    Fatal(String),
}

impl Invocation {
    pub fn compile(
        config: &BuildConfig,
        input: &Path,
        output: &Path,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            stage: ToolStage::Compile,
            program: config.cc_path(),
            args: config.compile_args(input, output),
            output: output.to_path_buf(),
            timeout,
        }
    }

    pub fn assemble(
        config: &BuildConfig,
        input: &Path,
        output: &Path,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            stage: ToolStage::Assemble,
            program: config.as_path(),
            args: config.assemble_args(input, output),
            output: output.to_path_buf(),
            timeout,
        }
    }

    pub fn link(
        config: &BuildConfig,
        objects: &[PathBuf],
        output: &Path,
        timeout: Option<Duration>,
    ) -> Self {
        Self {
            stage: ToolStage::Link,
            program: config.ld_path(),
            args: config.link_args(objects, output),
            output: output.to_path_buf(),
            timeout,
        }
    }

    /// The command line for logging and failure reports.
    pub fn command_line(&self) -> String {
        let mut line = self.program.display().to_string();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Runs the process to completion and classifies the result.
    pub fn run(&self, cancel: &CancelFlag) -> InvokeOutcome {
        debug!(command = %self.command_line(), "spawning");
        let mut child = match Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(err) => {
                return InvokeOutcome::FatalProcess {
                    reason: format!("failed to start {}: {}", self.program.display(), err),
                };
            }
        };

        let stdout = capture(child.stdout.take());
        let stderr = capture(child.stderr.take());

        let deadline = self.timeout.map(|t| Instant::now() + t);
        let end = loop {
            match child.try_wait() {
                Ok(Some(status)) => break WaitEnd::Exited(status),
                Ok(None) => {}
                Err(err) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    break WaitEnd::Fatal(format!("failed to wait for process: {err}"));
                }
            }
            if cancel.load(Ordering::Relaxed) {
                let _ = child.kill();
                let _ = child.wait();
                break WaitEnd::Fatal("cancelled".to_string());
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let _ = child.kill();
                    let _ = child.wait();
                    break WaitEnd::Fatal(format!(
                        "timed out after {:?}",
                        self.timeout.unwrap_or_default()
                    ));
                }
            }
            thread::sleep(POLL_INTERVAL);
        };

        let mut diagnostics = stdout.join().unwrap_or_default();
        let stderr_text = stderr.join().unwrap_or_default();
        if !diagnostics.is_empty() && !stderr_text.is_empty() {
            diagnostics.push('\n');
        }
        diagnostics.push_str(&stderr_text);

        let outcome = match end {
            WaitEnd::Exited(status) if status.success() => InvokeOutcome::Success { diagnostics },
            WaitEnd::Exited(status) => match status.code() {
                Some(code) => InvokeOutcome::ToolError { code, diagnostics },
                None => InvokeOutcome::FatalProcess {
                    reason: join_reason("terminated by signal", &diagnostics),
                },
            },
            WaitEnd::Fatal(reason) => InvokeOutcome::FatalProcess {
                reason: join_reason(&reason, &diagnostics),
            },
        };

        if !outcome.is_success() {
            let _ = std::fs::remove_file(&self.output);
        }
        outcome
    }
}

fn capture(stream: Option<impl Read + Send + 'static>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut text = String::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_string(&mut text);
        }
        text
    })
}

fn join_reason(reason: &str, diagnostics: &str) -> String {
    if diagnostics.trim().is_empty() {
        reason.to_string()
    } else {
        format!("{reason}\n{diagnostics}")
    }
}
