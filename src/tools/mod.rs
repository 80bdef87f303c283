//! External process execution.
//!
//! Every decoder and encoder that lives outside this binary (dcraw,
//! LibRaw's `dcraw_emu`, vips, ImageMagick, heif-convert) is driven through
//! the [`ToolRunner`] trait. Production uses [`SystemRunner`], which spawns
//! real child processes with a deadline and kills them on timeout or
//! cancellation. Tests substitute a scripted runner so every fallback path
//! can be exercised without the tools installed.
//!
//! A timeout is reported as [`ToolError::Timeout`]; callers treat it the
//! same as a non-zero exit.

pub mod probe;

use std::ffi::{OsStr, OsString};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

pub use probe::{Tool, ToolAvailability};

/// Poll interval while waiting on a child process.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Only the tail of a tool's stderr is kept for error messages.
const STDERR_TAIL_BYTES: usize = 2048;

#[derive(Error, Debug)]
pub enum ToolError {
    #[error("{program} is not installed")]
    NotFound { program: String },
    #[error("{program} failed to start: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} failed ({status}): {stderr}")]
    Exit {
        program: String,
        status: String,
        stderr: String,
    },
    #[error("{program} timed out after {}s", .after.as_secs())]
    Timeout { program: String, after: Duration },
    #[error("{program} was cancelled")]
    Cancelled { program: String },
    #[error("{program} produced no output at {}", .path.display())]
    MissingOutput { program: String, path: PathBuf },
}

/// A single external-process call.
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl Invocation {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn cwd(mut self, dir: &Path) -> Self {
        self.cwd = Some(dir.to_path_buf());
        self
    }

    /// Arguments as UTF-8 (lossy), for logging and test assertions.
    pub fn arg_strings(&self) -> Vec<String> {
        self.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    /// Shell-like one-line rendering for logs.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in self.arg_strings() {
            line.push(' ');
            line.push_str(&arg);
        }
        line
    }
}

/// Runs external programs to completion.
///
/// `Sync` so one runner can be shared by every worker in a parallel batch.
pub trait ToolRunner: Sync {
    /// Run to completion. `Ok` only on a zero exit status.
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError>;
}

/// The runner, the availability snapshot and the per-call timeout for one job.
///
/// Decode strategies and the PSD exporter address tools by [`Tool`]; the
/// toolbox maps that to the program name the prober found.
pub struct Toolbox<'a, R: ToolRunner> {
    pub runner: &'a R,
    pub availability: &'a ToolAvailability,
    pub timeout: Duration,
}

impl<'a, R: ToolRunner> Toolbox<'a, R> {
    pub fn new(runner: &'a R, availability: &'a ToolAvailability, timeout: Duration) -> Self {
        Self {
            runner,
            availability,
            timeout,
        }
    }

    pub fn has(&self, tool: Tool) -> bool {
        self.availability.is_available(tool)
    }

    /// Run `tool` with `args` inside `cwd`.
    pub fn run<I, S>(&self, tool: Tool, args: I, cwd: &Path) -> Result<(), ToolError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let program = self
            .availability
            .program(tool)
            .ok_or_else(|| ToolError::NotFound {
                program: tool.label().to_string(),
            })?;
        let invocation = Invocation::new(program, self.timeout).args(args).cwd(cwd);
        tracing::debug!(tool = %tool, command = %invocation.command_line(), "running tool");
        self.runner.run(&invocation)
    }
}

/// Shared flag that tells every running tool in a job to stop.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Spawns real child processes.
///
/// stdin and stdout are discarded; stderr is captured (tail only) for error
/// messages. The child is killed when its deadline passes or the cancel
/// token fires.
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    cancel: CancelToken,
}

impl SystemRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cancel(cancel: CancelToken) -> Self {
        Self { cancel }
    }
}

impl ToolRunner for SystemRunner {
    fn run(&self, invocation: &Invocation) -> Result<(), ToolError> {
        let program = invocation.program.clone();
        if self.cancel.is_cancelled() {
            return Err(ToolError::Cancelled { program });
        }
        let resolved = which::which(&invocation.program)
            .map_err(|_| ToolError::NotFound {
                program: program.clone(),
            })?;

        let mut command = Command::new(resolved);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());
        if let Some(dir) = &invocation.cwd {
            command.current_dir(dir);
        }

        let mut child = command.spawn().map_err(|source| ToolError::Spawn {
            program: program.clone(),
            source,
        })?;

        // Drain stderr off-thread so a chatty tool cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut pipe| {
            std::thread::spawn(move || {
                let mut buf = Vec::new();
                let _ = pipe.read_to_end(&mut buf);
                buf
            })
        });

        let started = Instant::now();
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => {}
                Err(source) => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ToolError::Spawn { program, source });
                }
            }
            if self.cancel.is_cancelled() {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Cancelled { program });
            }
            if started.elapsed() >= invocation.timeout {
                let _ = child.kill();
                let _ = child.wait();
                return Err(ToolError::Timeout {
                    program,
                    after: invocation.timeout,
                });
            }
            std::thread::sleep(POLL_INTERVAL);
        };

        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .map(|bytes| stderr_tail(&bytes))
            .unwrap_or_default();

        if status.success() {
            Ok(())
        } else {
            let status = match status.code() {
                Some(code) => format!("exit code {code}"),
                None => "killed by signal".to_string(),
            };
            Err(ToolError::Exit {
                program,
                status,
                stderr,
            })
        }
    }
}

fn stderr_tail(bytes: &[u8]) -> String {
    let start = bytes.len().saturating_sub(STDERR_TAIL_BYTES);
    String::from_utf8_lossy(&bytes[start..]).trim().to_string()
}
