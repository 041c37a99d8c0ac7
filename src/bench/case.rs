//! Manifest-driven benchmark tasks.
//!
//! A `BenchCase` prepares its input with a pipeline of tools, fans out one
//! `VariantRun` per variant, and folds their records into a `CaseReport`.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;

use crate::bench::manifest::{CaseSpec, Step, StepDefaults};
use crate::bench::report::{CaseReport, Outcome, StepRecord, VariantRecord};
use crate::core::{PhaseContext, PhaseFn, PhasedTask, Resolved};
use crate::{Error, Result};

pub struct BenchCase {
    spec: Arc<CaseSpec>,
    defaults: StepDefaults,
    /// Prepared input shared by the variant runs.
    input: Option<PathBuf>,
    report: CaseReport,
}

impl BenchCase {
    pub fn new(spec: CaseSpec, defaults: StepDefaults) -> Self {
        let report = CaseReport::new(spec.name.clone());
        Self {
            spec: Arc::new(spec),
            defaults,
            input: None,
            report,
        }
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn report(&self) -> &CaseReport {
        &self.report
    }

    pub fn into_report(self) -> CaseReport {
        self.report
    }

    /// The report for a resolved root. A failed case keeps whatever it
    /// recorded before the failure.
    pub fn report_for(resolved: Resolved) -> CaseReport {
        let failure = resolved.failure().cloned();
        let label = resolved.label.clone();
        let Some(case) = resolved.into_task::<BenchCase>() else {
            let mut report = CaseReport::new(label);
            report.error = Some("resolved task is not a benchmark case".to_string());
            return report;
        };
        let mut report = case.into_report();
        if let Some(failure) = failure {
            report.mark_failed(&failure);
        }
        report
    }

    fn prepare<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let spec = Arc::clone(&self.spec);
            let mut data: Option<Vec<u8>> = None;

            for step in &spec.prepare {
                if let Some(file) = &step.stdin_file {
                    let bytes = tokio::fs::read(file).await.map_err(|e| {
                        Error::Manifest(format!("cannot read {}: {}", file.display(), e))
                    })?;
                    data = Some(bytes);
                }
                let mut invocation = step.invocation(&self.defaults, "", None)?;
                if let Some(bytes) = data.take() {
                    invocation = invocation.stdin(bytes);
                }
                match ctx.invoke(invocation).await {
                    Ok(result) => {
                        self.report.prepare.push(StepRecord {
                            tool: step.tool.clone(),
                            outcome: Outcome::from_result(&result),
                        });
                        data = Some(result.stdout);
                    }
                    Err(e) => {
                        self.report.prepare.push(StepRecord {
                            tool: step.tool.clone(),
                            outcome: Outcome::from_error(&e),
                        });
                        ctx.warn(format!("preparation stopped at {}", step.tool));
                        return Ok(());
                    }
                }
            }

            let Some(run) = &spec.run else {
                return Ok(());
            };
            let temp = ctx.temp().clone();
            let input = ctx.blocking(move || Ok(temp.file("in", "")?)).await?;
            tokio::fs::write(&input, data.unwrap_or_default()).await?;
            self.input = Some(input.clone());

            let variants = spec.effective_variants();
            ctx.info(format!("prepared, running {} variant(s)", variants.len()));
            for variant in variants {
                ctx.spawn(VariantRun::new(
                    &spec.name,
                    variant,
                    run.clone(),
                    input.clone(),
                    self.defaults,
                ));
            }
            Ok(())
        })
    }

    fn collect<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut records: Vec<VariantRecord> = ctx
                .take_results()
                .into_iter()
                .map(VariantRun::record_for)
                .collect();

            // Children report in completion order; keep the declared order.
            let order = self.spec.effective_variants();
            records.sort_by_key(|r| {
                order
                    .iter()
                    .position(|v| *v == r.variant)
                    .unwrap_or(usize::MAX)
            });
            self.report.variants = records;
            self.report.finished = Utc::now();

            if let Some(input) = self.input.take() {
                if let Err(e) = tokio::fs::remove_file(&input).await {
                    ctx.debug(format!("could not remove {}: {}", input.display(), e));
                }
            }
            ctx.info(self.report.summary());
            Ok(())
        })
    }
}

impl PhasedTask for BenchCase {
    const PHASES: &'static [PhaseFn<Self>] = &[BenchCase::prepare, BenchCase::collect];

    fn label(&self) -> String {
        self.spec.name.clone()
    }
}

/// One run of a case's `run` step with a particular variant.
pub struct VariantRun {
    case: String,
    variant: String,
    step: Step,
    input: PathBuf,
    defaults: StepDefaults,
    outcome: Option<Outcome>,
}

impl VariantRun {
    pub fn new(
        case: &str,
        variant: String,
        step: Step,
        input: PathBuf,
        defaults: StepDefaults,
    ) -> Self {
        Self {
            case: case.to_string(),
            variant,
            step,
            input,
            defaults,
            outcome: None,
        }
    }

    pub fn variant(&self) -> &str {
        &self.variant
    }

    pub fn outcome(&self) -> Option<&Outcome> {
        self.outcome.as_ref()
    }

    /// Turn a resolved child into its record. Failed runs become `error`
    /// records so the case report always lists every variant.
    pub fn record_for(resolved: Resolved) -> VariantRecord {
        let variant = resolved
            .task::<VariantRun>()
            .map(|run| run.variant.clone())
            .unwrap_or_else(|| resolved.label.clone());
        let outcome = match (resolved.failure(), resolved.task::<VariantRun>()) {
            (Some(failure), _) => Outcome::Error {
                message: failure.message.clone(),
            },
            (None, Some(VariantRun {
                outcome: Some(outcome),
                ..
            })) => outcome.clone(),
            (None, _) => Outcome::Error {
                message: "variant produced no outcome".to_string(),
            },
        };
        VariantRecord { variant, outcome }
    }

    fn run<'a>(&'a mut self, ctx: &'a mut PhaseContext) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            let mut invocation =
                self.step
                    .invocation(&self.defaults, &self.variant, Some(&self.input))?;
            if !self.step.takes_input_arg() {
                invocation = invocation.stdin(tokio::fs::read(&self.input).await?);
            }
            let outcome = match ctx.invoke(invocation).await {
                Ok(result) => Outcome::from_result(&result),
                Err(e) => Outcome::from_error(&e),
            };
            ctx.debug(format!("{}", outcome.status()));
            self.outcome = Some(outcome);
            Ok(())
        })
    }
}

impl PhasedTask for VariantRun {
    const PHASES: &'static [PhaseFn<Self>] = &[VariantRun::run];

    fn label(&self) -> String {
        if self.variant.is_empty() {
            format!("{} run", self.case)
        } else {
            format!("{} [{}]", self.case, self.variant)
        }
    }
}
