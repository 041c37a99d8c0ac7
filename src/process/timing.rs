//! Timing side channel.
//!
//! Tools with native timing support accept `--timings=<file>` and write a
//! YAML document there. Its shape belongs to the tool, so it is kept as an
//! opaque `serde_json::Value`. Anything unreadable degrades to `{}`.

use std::path::Path;

use serde_json::{json, Map, Value};

use crate::plog_warn;

/// How an invocation should be timed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timing {
    /// No timing information.
    #[default]
    None,
    /// The tool writes its own timings to a side-channel file.
    Native,
    /// The executor measures wall-clock time around the tool.
    External,
}

/// Command-line flag pointing a tool at its timing file.
pub fn timings_flag(path: &Path) -> String {
    format!("--timings={}", path.display())
}

/// Parse a tool-written timing document.
pub fn parse_document(text: &str) -> Value {
    if text.trim().is_empty() {
        return empty();
    }
    match serde_yaml::from_str::<serde_yaml::Value>(text) {
        Ok(doc) => match serde_json::to_value(doc) {
            Ok(value) if !value.is_null() => value,
            Ok(_) => empty(),
            Err(e) => {
                plog_warn!("Timing document is not representable: {}", e);
                empty()
            }
        },
        Err(e) => {
            plog_warn!("Malformed timing document: {}", e);
            empty()
        }
    }
}

/// Read and parse the timing file a tool left behind.
pub async fn read_file(path: &Path) -> Value {
    match tokio::fs::read_to_string(path).await {
        Ok(text) => parse_document(&text),
        Err(e) => {
            plog_warn!("Timing file {} unreadable: {}", path.display(), e);
            empty()
        }
    }
}

/// Timing structure synthesized from an external wall-clock measurement.
pub fn synthesize(tool: &str, elapsed_secs: f64) -> Value {
    json!({ tool: { "total": elapsed_secs.max(0.0) } })
}

fn empty() -> Value {
    Value::Object(Map::new())
}
