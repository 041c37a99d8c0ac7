//! Resource-bounded external tool invocation.
//!
//! `ProcessExecutor::invoke` runs one external program, optionally wrapped
//! in the limit monitor, and returns an `ExecutionResult` or a `ToolError`
//! that says why the tool died.
//!
//! # Example
//!
//! ```ignore
//! use std::time::Duration;
//! use phasepool::process::{Invocation, MemoryLimit, ProcessExecutor, Timing};
//!
//! let executor = ProcessExecutor::new("/opt/bench/bin/timeout");
//! let result = executor
//!     .invoke(
//!         Invocation::new("pbes2bes")
//!             .args(["-s0", "-v", "input.pbes"])
//!             .timeout(Duration::from_secs(3600))
//!             .memlimit(MemoryLimit::from_gib(4))
//!             .timing(Timing::Native),
//!     )
//!     .await?;
//! println!("{}", result.timing);
//! ```

mod monitor;
mod timing;

pub use monitor::{detect, wrap, Breach, LimitReport, QUIET_FLAG};
pub use timing::Timing;

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;

use crate::error::{Error, ToolError};
use crate::{plog_debug, plog_trace, plog_warn};

/// Default name of the limit monitor binary.
pub const DEFAULT_MONITOR: &str = "timeout";

/// Default extra time granted to the monitor before the executor kills
/// the process tree itself.
pub const DEFAULT_GRACE_SECS: u64 = 5;

/// How long output is still drained after the tool's process group is gone.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// `--version` banner of GNU coreutils, whose `timeout` shares the default
/// monitor name but none of its options.
const COREUTILS_BANNER: &str = "GNU coreutils";

/// How long `verify_monitor` waits for the banner.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(5);

/// A memory ceiling in the monitor's native unit (kilobytes).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemoryLimit(u64);

impl MemoryLimit {
    pub fn from_kilobytes(kb: u64) -> Self {
        Self(kb)
    }

    /// Convert a byte count, rounding up to whole kilobytes.
    pub fn from_bytes(bytes: u64) -> Self {
        Self(bytes.div_ceil(1024))
    }

    pub fn from_mib(mib: u64) -> Self {
        Self(mib.saturating_mul(1024))
    }

    pub fn from_gib(gib: u64) -> Self {
        Self(gib.saturating_mul(1024 * 1024))
    }

    pub fn kilobytes(&self) -> u64 {
        self.0
    }
}

/// One external program call and the limits it runs under.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: String,
    args: Vec<String>,
    stdin: Option<Vec<u8>>,
    timeout: Option<Duration>,
    memlimit: Option<MemoryLimit>,
    timing: Timing,
    pattern: Option<Regex>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            stdin: None,
            timeout: None,
            memlimit: None,
            timing: Timing::None,
            pattern: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Bytes written to the tool's stdin; stdin is closed afterwards.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn maybe_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn memlimit(mut self, limit: MemoryLimit) -> Self {
        self.memlimit = Some(limit);
        self
    }

    pub fn maybe_memlimit(mut self, limit: Option<MemoryLimit>) -> Self {
        self.memlimit = limit;
        self
    }

    pub fn timing(mut self, timing: Timing) -> Self {
        self.timing = timing;
        self
    }

    /// Named groups of `pattern`, searched in stderr, become result fields.
    pub fn pattern(mut self, pattern: Regex) -> Self {
        self.pattern = Some(pattern);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// The tool command line, without monitor or timing flags.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Compile an output pattern the way tools print their statistics: `.`
/// also matches newlines.
pub fn output_pattern(pattern: &str) -> std::result::Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).dot_matches_new_line(true).build()
}

/// Outcome of a successful tool run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// The tool command line (monitor prefix not included).
    pub command: String,
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
    /// Wall-clock seconds from spawn to exit.
    pub elapsed: f64,
    /// Tool-defined timing structure, present when timing was requested.
    pub timing: Option<Value>,
    /// Fields extracted by the output pattern, present when one was given.
    pub fields: Option<BTreeMap<String, String>>,
}

impl ExecutionResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// Runs external tools under the limit monitor.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    monitor: PathBuf,
    grace: Duration,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_MONITOR)
    }
}

impl ProcessExecutor {
    pub fn new(monitor: impl Into<PathBuf>) -> Self {
        Self {
            monitor: monitor.into(),
            grace: Duration::from_secs(DEFAULT_GRACE_SECS),
        }
    }

    /// Extra time past the requested timeout before the executor stops
    /// waiting for the monitor and kills the process itself.
    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn monitor(&self) -> &std::path::Path {
        &self.monitor
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Check once, before any work is dispatched, that the monitor can be
    /// started and is not coreutils `timeout`.
    ///
    /// # Errors
    ///
    /// `Error::Config` when the monitor is missing or is the wrong program.
    pub async fn verify_monitor(&self) -> crate::Result<()> {
        let monitor = self.monitor.display().to_string();
        let mut cmd = Command::new(&self.monitor);
        cmd.arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = match tokio::time::timeout(VERIFY_TIMEOUT, cmd.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(Error::Config(format!(
                    "monitor {} cannot be started: {}; set `monitor` in the config",
                    monitor, e
                )));
            }
            Err(_) => {
                plog_debug!("Monitor {} did not answer --version, assuming it is fine", monitor);
                return Ok(());
            }
        };

        let banner = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );
        if banner.contains(COREUTILS_BANNER) {
            return Err(Error::Config(format!(
                "monitor {} is GNU coreutils timeout, which does not understand -t, -m or {}; \
                 set `monitor` in the config to the limit monitor",
                monitor, QUIET_FLAG
            )));
        }
        plog_debug!("Monitor {} accepted", monitor);
        Ok(())
    }

    /// Run `invocation` to completion.
    ///
    /// # Errors
    ///
    /// - `ToolError::Timeout` when the monitor reports a wall-clock breach
    ///   (or the grace period after the timeout runs out)
    /// - `ToolError::OutOfMemory` when the monitor reports a memory breach
    /// - `ToolError::Failed` for any other non-zero exit
    /// - `ToolError::Spawn` when the program cannot be started
    pub async fn invoke(&self, invocation: Invocation) -> Result<ExecutionResult, ToolError> {
        let command_line = invocation.command_line();

        let mut tool_cmd = Vec::with_capacity(invocation.args.len() + 2);
        tool_cmd.push(invocation.program.clone());

        // Kept alive until the timing file has been read back.
        let timing_file = match invocation.timing {
            Timing::Native => {
                let file = tempfile::Builder::new()
                    .prefix("timings")
                    .suffix(".yaml")
                    .tempfile()
                    .map_err(|source| ToolError::Io {
                        command: command_line.clone(),
                        source,
                    })?;
                tool_cmd.push(timing::timings_flag(file.path()));
                Some(file)
            }
            Timing::None | Timing::External => None,
        };
        tool_cmd.extend(invocation.args.iter().cloned());

        let full = wrap(
            &self.monitor.to_string_lossy(),
            invocation.timeout,
            invocation.memlimit.map(|m| m.kilobytes()),
            tool_cmd,
        );
        plog_debug!("Running {}", full.join(" "));

        let mut cmd = Command::new(&full[0]);
        cmd.args(&full[1..])
            .stdin(if invocation.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        // The monitor and everything it starts share one group, so the
        // whole tree can be signalled at once.
        #[cfg(unix)]
        cmd.process_group(0);

        let started = Instant::now();
        let mut child = cmd.spawn().map_err(|source| ToolError::Spawn {
            command: command_line.clone(),
            source,
        })?;
        // Dropped on every exit path, including cancellation of this future.
        let group = ProcessGroup::new(child.id());

        let stdin_pipe = child.stdin.take();
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let input = invocation.stdin.clone();

        let feed = async move {
            if let (Some(mut pipe), Some(bytes)) = (stdin_pipe, input) {
                // A tool may exit without draining stdin; that is its business.
                let _ = pipe.write_all(&bytes).await;
                let _ = pipe.shutdown().await;
            }
        };

        let deadline = invocation.timeout.map(|t| t + self.grace);
        let wait = async {
            match deadline {
                Some(limit) => match tokio::time::timeout(limit, child.wait()).await {
                    Ok(status) => status.map(Some),
                    Err(_) => {
                        plog_warn!(
                            "Monitor did not stop \"{}\" within {:?}, killing it",
                            command_line,
                            limit
                        );
                        group.kill();
                        child.kill().await?;
                        Ok::<_, std::io::Error>(None)
                    }
                },
                None => child.wait().await.map(Some),
            }
        };

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let status = {
            let exit = async { tokio::join!(feed, wait).1 };
            let drain = async {
                tokio::join!(
                    read_into(stdout_pipe, &mut stdout),
                    read_into(stderr_pipe, &mut stderr)
                );
            };
            tokio::pin!(exit);
            tokio::pin!(drain);

            let mut drained = false;
            let status = tokio::select! {
                status = &mut exit => status,
                () = &mut drain => {
                    drained = true;
                    exit.await
                }
            };
            if !drained {
                // The monitor is gone; anything left in its group is orphaned.
                group.kill();
                if tokio::time::timeout(DRAIN_TIMEOUT, &mut drain).await.is_err() {
                    plog_warn!(
                        "Output of \"{}\" still open {:?} after exit, keeping what arrived",
                        command_line,
                        DRAIN_TIMEOUT
                    );
                }
            }
            status
        };
        let elapsed = started.elapsed().as_secs_f64();

        let status = status.map_err(|source| ToolError::Io {
            command: command_line.clone(),
            source,
        })?;
        let stderr = String::from_utf8_lossy(&stderr).into_owned();
        plog_trace!("{} stderr:\n{}", command_line, stderr);

        let Some(status) = status else {
            return Err(ToolError::Timeout {
                command: command_line,
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr,
                report: LimitReport {
                    cpu: None,
                    mem: None,
                    maxmem: None,
                    stale: Some(elapsed),
                },
            });
        };

        if !status.success() {
            let stdout = String::from_utf8_lossy(&stdout).into_owned();
            return Err(match detect(&stderr) {
                Some((Breach::Timeout, report)) => ToolError::Timeout {
                    command: command_line,
                    stdout,
                    stderr,
                    report,
                },
                Some((Breach::Memory, report)) => ToolError::OutOfMemory {
                    command: command_line,
                    stdout,
                    stderr,
                    report,
                },
                None => ToolError::Failed {
                    command: command_line,
                    exit_code: status.code(),
                    stdout,
                    stderr,
                },
            });
        }

        let timing = match (invocation.timing, &timing_file) {
            (Timing::Native, Some(file)) => Some(timing::read_file(file.path()).await),
            (Timing::External, _) => Some(timing::synthesize(&invocation.program, elapsed)),
            _ => None,
        };
        drop(timing_file);

        let fields = invocation
            .pattern
            .as_ref()
            .map(|pattern| extract_fields(pattern, &stderr, &command_line));

        Ok(ExecutionResult {
            command: command_line,
            stdout,
            stderr,
            exit_code: status.code().unwrap_or(0),
            elapsed,
            timing,
            fields,
        })
    }
}

/// Named groups of the first match of `pattern` in `text`.
///
/// A missing match is logged and yields an empty map.
pub fn extract_fields(pattern: &Regex, text: &str, command: &str) -> BTreeMap<String, String> {
    let Some(caps) = pattern.captures(text) else {
        plog_warn!("No match for output pattern of \"{}\": {}", command, pattern.as_str());
        return BTreeMap::new();
    };
    pattern
        .capture_names()
        .flatten()
        .filter_map(|name| {
            caps.name(name)
                .map(|m| (name.to_string(), m.as_str().to_string()))
        })
        .collect()
}

/// Append everything readable from `pipe` to `buf`.
///
/// Each read lands in `buf` before the next one starts, so dropping this
/// future midway keeps what has arrived.
async fn read_into<R: AsyncRead + Unpin>(pipe: Option<R>, buf: &mut Vec<u8>) {
    let Some(mut pipe) = pipe else {
        return;
    };
    let mut chunk = [0u8; 8192];
    loop {
        match pipe.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
}

/// The process group a tool runs in. Dropping it kills every process left
/// in the group.
struct ProcessGroup {
    pgid: Option<u32>,
}

impl ProcessGroup {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn kill(&self) {
        if let Some(pgid) = self.pgid {
            kill_group(pgid);
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

#[cfg(unix)]
fn kill_group(pgid: u32) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // ESRCH just means the group is already gone.
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) {}
