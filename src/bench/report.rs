//! Case reports and the JSON-lines results file.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;

use crate::core::PhaseFailure;
use crate::error::ToolError;
use crate::process::{ExecutionResult, LimitReport};
use crate::{plog_debug, plog_warn, Result};

/// What happened to one tool run.
///
/// Limit breaches are recorded, not raised, so a case with a timed out
/// variant still produces a report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Outcome {
    Ok {
        elapsed: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timing: Option<Value>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        fields: BTreeMap<String, String>,
    },
    Timeout {
        report: LimitReport,
    },
    Memory {
        report: LimitReport,
    },
    Error {
        message: String,
    },
}

impl Outcome {
    pub fn from_result(result: &ExecutionResult) -> Self {
        Outcome::Ok {
            elapsed: result.elapsed,
            timing: result.timing.clone(),
            fields: result.fields.clone().unwrap_or_default(),
        }
    }

    pub fn from_error(error: &ToolError) -> Self {
        match error {
            ToolError::Timeout { report, .. } => Outcome::Timeout {
                report: report.clone(),
            },
            ToolError::OutOfMemory { report, .. } => Outcome::Memory {
                report: report.clone(),
            },
            other => Outcome::Error {
                message: other.to_string(),
            },
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, Outcome::Ok { .. })
    }

    /// Short status word, as used in summaries.
    pub fn status(&self) -> &'static str {
        match self {
            Outcome::Ok { .. } => "ok",
            Outcome::Timeout { .. } => "timeout",
            Outcome::Memory { .. } => "memory",
            Outcome::Error { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub tool: String,
    pub outcome: Outcome,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantRecord {
    pub variant: String,
    pub outcome: Outcome,
}

/// One line of the results file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseReport {
    pub case: String,
    #[serde(default)]
    pub prepare: Vec<StepRecord>,
    #[serde(default)]
    pub variants: Vec<VariantRecord>,
    /// Set when a phase of the case itself failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished: DateTime<Utc>,
}

impl CaseReport {
    pub fn new(case: impl Into<String>) -> Self {
        Self {
            case: case.into(),
            prepare: Vec::new(),
            variants: Vec::new(),
            error: None,
            finished: Utc::now(),
        }
    }

    /// Record that a phase of the case itself failed. Steps and variants
    /// recorded so far are kept.
    pub fn mark_failed(&mut self, failure: &PhaseFailure) {
        self.error = Some(failure.to_string());
        self.finished = Utc::now();
    }

    /// Every prepare step and every variant succeeded, and the case
    /// itself did not fail.
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
            && self.prepare.iter().all(|s| s.outcome.is_ok())
            && self.variants.iter().all(|v| v.outcome.is_ok())
    }

    /// One-line human summary, e.g. `buffer-2: -s0=ok -s1=timeout`.
    pub fn summary(&self) -> String {
        if let Some(error) = &self.error {
            return format!("{}: failed ({})", self.case, error);
        }
        if let Some(step) = self.prepare.iter().find(|s| !s.outcome.is_ok()) {
            return format!("{}: prepare {}={}", self.case, step.tool, step.outcome.status());
        }
        let variants: Vec<String> = self
            .variants
            .iter()
            .map(|v| {
                if v.variant.is_empty() {
                    v.outcome.status().to_string()
                } else {
                    format!("{}={}", v.variant, v.outcome.status())
                }
            })
            .collect();
        if variants.is_empty() {
            format!("{}: ok", self.case)
        } else {
            format!("{}: {}", self.case, variants.join(" "))
        }
    }
}

/// Append-only JSON-lines file of case reports.
#[derive(Debug, Clone)]
pub struct ResultsFile {
    path: PathBuf,
}

impl ResultsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Names of the cases already recorded. A missing file means none;
    /// unreadable lines are skipped with a warning.
    pub async fn load_completed(&self) -> Result<HashSet<String>> {
        let text = match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
            Err(e) => return Err(e.into()),
        };

        let mut done = HashSet::new();
        for (lineno, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CaseReport>(line) {
                Ok(report) => {
                    done.insert(report.case);
                }
                Err(e) => plog_warn!(
                    "{}:{}: skipping unreadable result: {}",
                    self.path.display(),
                    lineno + 1,
                    e
                ),
            }
        }
        plog_debug!("{} cases already recorded in {}", done.len(), self.path.display());
        Ok(done)
    }

    /// Append one report as a single line.
    pub async fn append(&self, report: &CaseReport) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let mut line = serde_json::to_string(report)?;
        line.push('\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
