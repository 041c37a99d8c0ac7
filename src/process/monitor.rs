//! Out-of-process limit monitor.
//!
//! The monitor is a wrapper program placed in front of the real command
//! line. It enforces a wall-clock limit (`-t <seconds>`) and a resident
//! memory ceiling (`-m <kbytes>`), and on a breach writes exactly one marker
//! line to stderr:
//!
//! ```text
//! TIMEOUT CPU 3601.02 MEM 10244 MAXMEM 20032 STALE 0
//! MEM CPU 12.20 MEM 4194400 MAXMEM 4194400 STALE 0
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Flag that keeps the monitor silent when the wrapped command stays
/// within its limits.
pub const QUIET_FLAG: &str = "--no-info-on-success";

/// Which limit the monitor reported as breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Breach {
    Timeout,
    Memory,
}

/// Numbers reported on a monitor marker line.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitReport {
    /// CPU seconds consumed.
    pub cpu: Option<f64>,
    /// Memory in use at the time of the breach, in kilobytes.
    pub mem: Option<u64>,
    /// Peak memory, in kilobytes.
    pub maxmem: Option<u64>,
    /// Seconds the process spent without making progress.
    pub stale: Option<f64>,
}

/// Prefix `command` with the monitor when any limit is requested.
///
/// Returns the command unchanged when neither limit is set.
pub fn wrap(
    monitor: &str,
    timeout: Option<Duration>,
    memlimit_kb: Option<u64>,
    command: Vec<String>,
) -> Vec<String> {
    if timeout.is_none() && memlimit_kb.is_none() {
        return command;
    }

    let mut wrapped = vec![monitor.to_string()];
    if let Some(t) = timeout {
        wrapped.push("-t".to_string());
        wrapped.push(timeout_secs(t).to_string());
    }
    if let Some(kb) = memlimit_kb {
        wrapped.push("-m".to_string());
        wrapped.push(kb.to_string());
    }
    wrapped.push(QUIET_FLAG.to_string());
    wrapped.push("--".to_string());
    wrapped.extend(command);
    wrapped
}

/// Whole seconds handed to the monitor, rounded up and at least one.
pub fn timeout_secs(timeout: Duration) -> u64 {
    let secs = timeout.as_secs_f64().ceil() as u64;
    secs.max(1)
}

/// Scan stderr for a breach marker.
///
/// The first marker line wins; a `TIMEOUT` line and a `MEM` line never
/// appear together for one run.
pub fn detect(stderr: &str) -> Option<(Breach, LimitReport)> {
    for line in stderr.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix("TIMEOUT ") {
            return Some((Breach::Timeout, parse_fields(rest)));
        }
        if let Some(rest) = line.strip_prefix("MEM ") {
            return Some((Breach::Memory, parse_fields(rest)));
        }
    }
    None
}

fn parse_fields(rest: &str) -> LimitReport {
    let mut report = LimitReport::default();
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    for pair in tokens.chunks(2) {
        let [key, value] = pair else {
            break;
        };
        match *key {
            "CPU" => report.cpu = value.parse().ok(),
            "MEM" => report.mem = value.parse().ok(),
            "MAXMEM" => report.maxmem = value.parse().ok(),
            "STALE" => report.stale = value.parse().ok(),
            _ => {}
        }
    }
    report
}
