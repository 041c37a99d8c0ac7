//! Manifest-driven benchmark cases.
//!
//! The CLI reads a manifest, turns each `[[case]]` into a `BenchCase` root
//! task, and appends one `CaseReport` per resolved case to a JSON-lines
//! results file.

pub mod case;
pub mod manifest;
pub mod report;

pub use case::{BenchCase, VariantRun};
pub use manifest::{CaseSpec, Manifest, Step, StepDefaults};
pub use report::{CaseReport, Outcome, ResultsFile, StepRecord, VariantRecord};
