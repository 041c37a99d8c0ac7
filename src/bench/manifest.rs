//! Benchmark manifest.
//!
//! A manifest is a TOML file with one `[[case]]` table per benchmark case:
//!
//! ```toml
//! [[case]]
//! name = "buffer-2"
//! variants = ["-s0", "-s1"]
//!
//! [[case.prepare]]
//! tool = "mcrl22lps"
//! stdin_file = "buffer.mcrl2"
//! timing = "native"
//!
//! [case.run]
//! tool = "pbes2bool"
//! args = ["{variant}", "{input}"]
//! timeout_secs = 600
//! memlimit_mb = 4096
//! pattern = "states: (?P<states>\\d+)"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::process::{output_pattern, Invocation, MemoryLimit, Timing};
use crate::{plog_debug, Error, Result};

/// Placeholder replaced by the variant argument.
pub const VARIANT_PLACEHOLDER: &str = "{variant}";
/// Placeholder replaced by the path of the prepared input.
pub const INPUT_PLACEHOLDER: &str = "{input}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(rename = "case", default)]
    pub cases: Vec<CaseSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseSpec {
    pub name: String,
    /// Pipeline whose final stdout is the case input.
    #[serde(default)]
    pub prepare: Vec<Step>,
    /// One `run` per entry, substituted for `{variant}`.
    #[serde(default)]
    pub variants: Vec<String>,
    pub run: Option<Step>,
}

/// One tool call in a manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// File fed to stdin. Only allowed on the first prepare step.
    pub stdin_file: Option<PathBuf>,
    pub timeout_secs: Option<u64>,
    pub memlimit_mb: Option<u64>,
    #[serde(default)]
    pub timing: Timing,
    pub pattern: Option<String>,
}

/// Limits applied to steps that set none of their own.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StepDefaults {
    pub timeout: Option<Duration>,
    pub memlimit: Option<MemoryLimit>,
}

impl StepDefaults {
    pub fn from_config(config: &Config) -> Self {
        Self {
            timeout: config.default_timeout(),
            memlimit: config.default_memlimit(),
        }
    }
}

impl Manifest {
    /// Read and validate a manifest. Relative `stdin_file` paths are taken
    /// relative to the manifest's directory.
    pub fn load(path: &Path) -> Result<Self> {
        plog_debug!("Manifest::load path={}", path.display());
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Manifest(format!("cannot read {}: {}", path.display(), e))
        })?;
        let mut manifest = Self::parse(&text)?;
        if let Some(base) = path.parent() {
            manifest.resolve_paths(base);
        }
        Ok(manifest)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let manifest: Self = toml::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Case names in manifest order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.cases.iter().map(|c| c.name.as_str())
    }

    /// Whether any step of any case needs the limit monitor.
    pub fn needs_monitor(&self, defaults: &StepDefaults) -> bool {
        self.cases.iter().any(|case| {
            case.prepare
                .iter()
                .chain(case.run.iter())
                .any(|step| step.is_limited(defaults))
        })
    }

    fn resolve_paths(&mut self, base: &Path) {
        for case in &mut self.cases {
            for step in case.prepare.iter_mut().chain(case.run.iter_mut()) {
                if let Some(file) = &step.stdin_file {
                    if file.is_relative() {
                        step.stdin_file = Some(base.join(file));
                    }
                }
            }
        }
    }

    fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for case in &self.cases {
            if case.name.trim().is_empty() {
                return Err(Error::Manifest("case with an empty name".to_string()));
            }
            if !seen.insert(case.name.as_str()) {
                return Err(Error::Manifest(format!("duplicate case {}", case.name)));
            }
            case.validate()?;
        }
        Ok(())
    }
}

impl CaseSpec {
    /// Variants to run: the declared ones, or a single unnamed one when a
    /// `run` step exists without variants.
    pub fn effective_variants(&self) -> Vec<String> {
        match (&self.run, self.variants.is_empty()) {
            (None, _) => Vec::new(),
            (Some(_), true) => vec![String::new()],
            (Some(_), false) => self.variants.clone(),
        }
    }

    fn validate(&self) -> Result<()> {
        if !self.variants.is_empty() && self.run.is_none() {
            return Err(Error::Manifest(format!(
                "case {} declares variants but no run step",
                self.name
            )));
        }
        for (i, step) in self.prepare.iter().enumerate() {
            if i > 0 && step.stdin_file.is_some() {
                return Err(Error::Manifest(format!(
                    "case {}: only the first prepare step may read stdin_file",
                    self.name
                )));
            }
            step.validate(&self.name)?;
        }
        if let Some(run) = &self.run {
            if run.stdin_file.is_some() {
                return Err(Error::Manifest(format!(
                    "case {}: the run step reads the prepared input, not stdin_file",
                    self.name
                )));
            }
            run.validate(&self.name)?;
        }
        Ok(())
    }
}

impl Step {
    /// Build the invocation, replacing `{variant}` and `{input}` in the
    /// arguments.
    pub fn invocation(
        &self,
        defaults: &StepDefaults,
        variant: &str,
        input: Option<&Path>,
    ) -> Result<Invocation> {
        let input = input.map(|p| p.display().to_string()).unwrap_or_default();
        let args = self.args.iter().map(|arg| {
            arg.replace(VARIANT_PLACEHOLDER, variant)
                .replace(INPUT_PLACEHOLDER, &input)
        });

        let mut invocation = Invocation::new(self.tool.as_str())
            .args(args)
            .maybe_timeout(self.timeout().or(defaults.timeout))
            .maybe_memlimit(self.memlimit().or(defaults.memlimit))
            .timing(self.timing);
        if let Some(pattern) = &self.pattern {
            invocation = invocation.pattern(compile(&self.tool, pattern)?);
        }
        Ok(invocation)
    }

    /// Whether the step runs under the limit monitor once defaults apply.
    pub fn is_limited(&self, defaults: &StepDefaults) -> bool {
        self.timeout().or(defaults.timeout).is_some()
            || self.memlimit().or(defaults.memlimit).is_some()
    }

    /// Whether some argument names the prepared input file.
    pub fn takes_input_arg(&self) -> bool {
        self.args.iter().any(|a| a.contains(INPUT_PLACEHOLDER))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn memlimit(&self) -> Option<MemoryLimit> {
        self.memlimit_mb.map(MemoryLimit::from_mib)
    }

    fn validate(&self, case: &str) -> Result<()> {
        if self.tool.trim().is_empty() {
            return Err(Error::Manifest(format!("case {}: step without a tool", case)));
        }
        if self.timeout_secs == Some(0) {
            return Err(Error::Manifest(format!(
                "case {}: {} has a zero timeout",
                case, self.tool
            )));
        }
        if let Some(pattern) = &self.pattern {
            compile(&self.tool, pattern)?;
        }
        Ok(())
    }
}

fn compile(tool: &str, pattern: &str) -> Result<regex::Regex> {
    output_pattern(pattern)
        .map_err(|e| Error::Manifest(format!("invalid pattern for {}: {}", tool, e)))
}
