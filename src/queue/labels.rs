//! The queue label grammar and embedded queue metadata.
//!
//! Labels are the authoritative queue: `queued` marks a pending task,
//! `queued:rig:<name>` names its target rig, and `queued:args:<json>`
//! optionally carries spawn arguments. Admission adds them, the dispatch
//! claim removes them, and a failed dispatch re-adds them. There is no
//! parallel in-memory queue structure anywhere in this crate.
//!
//! Larger submission metadata rides inside the bead description between
//! sentinel markers, so it survives stores that cap label length.

use serde::{Deserialize, Serialize};

use crate::types::RigName;

/// Marks a bead as pending in the work queue.
pub const LABEL_QUEUED: &str = "queued";

/// Prefix of the label naming the target rig.
pub const LABEL_RIG_PREFIX: &str = "queued:rig:";

/// Prefix of the label carrying encoded spawn arguments.
pub const LABEL_ARGS_PREFIX: &str = "queued:args:";

/// Start marker of the metadata block embedded in a description.
const META_OPEN: &str = "<!-- gastown:queue";

/// End marker of the metadata block.
const META_CLOSE: &str = "-->";

/// Extracts the target rig from a bead's labels.
pub fn queue_rig(labels: &[String]) -> Option<RigName> {
    labels
        .iter()
        .find_map(|l| l.strip_prefix(LABEL_RIG_PREFIX))
        .map(RigName::new)
}

/// Extracts the encoded spawn args from a bead's labels.
pub fn queue_args(labels: &[String]) -> Option<String> {
    labels
        .iter()
        .find_map(|l| l.strip_prefix(LABEL_ARGS_PREFIX))
        .map(|s| s.to_string())
}

/// The rig label for a target rig.
pub fn rig_label(rig: &RigName) -> String {
    format!("{LABEL_RIG_PREFIX}{rig}")
}

/// Returns true if the label is part of the queue grammar (and must be
/// removed by a claim).
pub fn is_queue_label(label: &str) -> bool {
    label == LABEL_QUEUED
        || label.starts_with(LABEL_RIG_PREFIX)
        || label.starts_with(LABEL_ARGS_PREFIX)
}

/// Submission metadata embedded in the bead description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_by: Option<String>,
}

/// Parses the metadata block out of a description, if present.
pub fn parse_metadata(description: &str) -> Option<QueueMetadata> {
    let start = description.find(META_OPEN)?;
    let rest = &description[start + META_OPEN.len()..];
    let end = rest.find(META_CLOSE)?;
    serde_json::from_str(rest[..end].trim()).ok()
}

/// Removes the metadata block from a description. Returns the input unchanged
/// when no block is present.
pub fn strip_metadata(description: &str) -> String {
    let Some(start) = description.find(META_OPEN) else {
        return description.to_string();
    };
    let rest = &description[start + META_OPEN.len()..];
    let Some(end) = rest.find(META_CLOSE) else {
        return description.to_string();
    };
    let mut out = String::with_capacity(description.len());
    out.push_str(description[..start].trim_end());
    let tail = rest[end + META_CLOSE.len()..].trim_start();
    if !out.is_empty() && !tail.is_empty() {
        out.push_str("\n\n");
    }
    out.push_str(tail);
    out
}

/// Renders a metadata block for embedding at submission time.
pub fn render_metadata(meta: &QueueMetadata) -> String {
    format!(
        "{META_OPEN}\n{}\n{META_CLOSE}",
        serde_json::to_string(meta).unwrap_or_else(|_| "{}".to_string())
    )
}
