//! Production store client that shells out to the `bd` CLI.
//!
//! Every operation runs `bd` with `--json` in the store's working directory
//! and parses the output with serde. Per-operation timeouts keep a wedged
//! store server from stalling a patrol loop: the loop logs the timeout and
//! retries on its next cadence.

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::types::{Bead, BeadId, ConvoyId, StoreEvent};

use super::client::{BeadPatch, ListFilter, Result, StoreClient, StoreError};

/// Default timeout for read operations.
const READ_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for mutations (the server may hold a single-writer lock).
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);

/// Cap on beads returned by ready/list queries.
const QUERY_LIMIT: usize = 100;

/// Store client backed by the `bd` command-line tool.
#[derive(Debug, Clone)]
pub struct BdClient {
    bd_path: PathBuf,
    /// Working directory for `bd` invocations; selects which store is hit.
    work_dir: PathBuf,
}

impl BdClient {
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        BdClient {
            bd_path: PathBuf::from("bd"),
            work_dir: work_dir.into(),
        }
    }

    /// Overrides the `bd` binary path (normally resolved via `$PATH`).
    pub fn with_bd_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.bd_path = path.into();
        self
    }

    /// Runs `bd` with the given args and returns trimmed stdout.
    async fn run(&self, op: &'static str, args: &[String], timeout: Duration) -> Result<String> {
        trace!(op, ?args, "running bd");
        let mut cmd = Command::new(&self.bd_path);
        cmd.args(args)
            .current_dir(&self.work_dir)
            .kill_on_drop(true);

        let output = tokio::time::timeout(timeout, cmd.output())
            .await
            .map_err(|_| StoreError::Timeout {
                op,
                secs: timeout.as_secs(),
            })?
            .map_err(|e| StoreError::Unavailable(format!("spawning bd: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            debug!(op, %stderr, "bd exited non-zero");
            // Callers that asked for a specific bead inspect the detail and
            // map "not found" to NotFound.
            return Err(StoreError::CommandFailed { op, detail: stderr });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

/// Wire shape of `bd create --json` output.
#[derive(Debug, Deserialize)]
struct CreatedIssue {
    id: String,
}

/// Wire shape of `bd events --latest --json` output.
#[derive(Debug, Deserialize)]
struct LatestEvent {
    at: DateTime<Utc>,
}

fn list_args(filter: &ListFilter) -> Vec<String> {
    let mut args = vec!["list".to_string(), "--json".to_string()];
    args.push(format!(
        "--limit={}",
        filter.limit.unwrap_or(QUERY_LIMIT)
    ));
    if let Some(label) = &filter.label {
        args.push(format!("--label={label}"));
    }
    if let Some(status) = filter.status {
        args.push(format!("--status={status}"));
    }
    if let Some(issue_type) = &filter.issue_type {
        args.push(format!("--type={issue_type}"));
    }
    args
}

fn update_args(id: &BeadId, patch: &BeadPatch) -> Vec<String> {
    let mut args = vec!["update".to_string(), id.to_string()];
    for label in &patch.add_labels {
        args.push(format!("--add-label={label}"));
    }
    for label in &patch.remove_labels {
        args.push(format!("--remove-label={label}"));
    }
    if let Some(desc) = &patch.description {
        args.push(format!("--description={desc}"));
    }
    if let Some(status) = patch.status {
        args.push(format!("--status={status}"));
    }
    if let Some(reason) = &patch.close_reason {
        args.push(format!("--reason={reason}"));
    }
    for (key, value) in &patch.fields {
        args.push(format!("--field={key}={value}"));
    }
    args
}

impl StoreClient for BdClient {
    async fn query_ready(&self, label: Option<&str>) -> Result<Vec<Bead>> {
        let mut args = vec![
            "ready".to_string(),
            "--json".to_string(),
            "-n".to_string(),
            QUERY_LIMIT.to_string(),
        ];
        if let Some(label) = label {
            args.push("--label".to_string());
            args.push(label.to_string());
        }
        let out = self.run("ready", &args, READ_TIMEOUT).await?;
        if out.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Bead>> {
        let out = self.run("list", &list_args(&filter), READ_TIMEOUT).await?;
        if out.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }

    async fn get(&self, id: &BeadId) -> Result<Bead> {
        let args = vec!["show".to_string(), id.to_string(), "--json".to_string()];
        let out = match self.run("show", &args, READ_TIMEOUT).await {
            Ok(out) => out,
            Err(StoreError::CommandFailed { detail, .. }) if detail.contains("not found") => {
                return Err(StoreError::NotFound(id.clone()));
            }
            Err(e) => return Err(e),
        };
        Ok(serde_json::from_str(&out)?)
    }

    async fn update(&self, id: &BeadId, patch: BeadPatch) -> Result<()> {
        if patch.is_empty() {
            return Ok(());
        }
        self.run("update", &update_args(id, &patch), WRITE_TIMEOUT)
            .await?;
        Ok(())
    }

    async fn create_convoy(&self, title: &str, members: &[BeadId]) -> Result<ConvoyId> {
        let args = vec![
            "create".to_string(),
            "--type=convoy".to_string(),
            format!("--title={title}"),
            "--json".to_string(),
        ];
        let out = self.run("create", &args, WRITE_TIMEOUT).await?;
        let created: CreatedIssue = serde_json::from_str(&out)?;
        let convoy = ConvoyId::new(created.id);

        // Track members via parent-child deps, in the supplied order. The
        // store keeps dependency insertion order, which is the dispatch order.
        for member in members {
            self.track_member(&convoy, member).await?;
        }

        Ok(convoy)
    }

    async fn track_member(&self, convoy: &ConvoyId, member: &BeadId) -> Result<()> {
        let args = vec![
            "dep".to_string(),
            "add".to_string(),
            convoy.to_string(),
            member.to_string(),
            "--type=parent-child".to_string(),
        ];
        self.run("dep-add", &args, WRITE_TIMEOUT).await?;
        Ok(())
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<StoreEvent>> {
        let args = vec![
            "events".to_string(),
            format!("--since={}", since.to_rfc3339_opts(SecondsFormat::Secs, true)),
            "--json".to_string(),
        ];
        let out = self.run("events", &args, READ_TIMEOUT).await?;
        if out.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&out)?)
    }

    async fn latest_event_at(&self) -> Result<Option<DateTime<Utc>>> {
        let args = vec![
            "events".to_string(),
            "--latest".to_string(),
            "--json".to_string(),
        ];
        let out = self.run("events", &args, READ_TIMEOUT).await?;
        if out.is_empty() || out == "null" {
            return Ok(None);
        }
        let latest: LatestEvent = serde_json::from_str(&out)?;
        Ok(Some(latest.at))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BeadStatus;

    #[test]
    fn list_args_include_filters() {
        let filter = ListFilter::default()
            .with_label("queued")
            .with_status(BeadStatus::Open)
            .with_limit(5);
        let args = list_args(&filter);
        assert!(args.contains(&"--label=queued".to_string()));
        assert!(args.contains(&"--status=open".to_string()));
        assert!(args.contains(&"--limit=5".to_string()));
    }

    #[test]
    fn list_args_default_limit_caps_query() {
        let args = list_args(&ListFilter::default());
        assert!(args.contains(&"--limit=100".to_string()));
    }

    #[test]
    fn update_args_cover_patch_parts() {
        let patch = BeadPatch::default()
            .add_label("queued")
            .remove_label("queued:rig:gastown")
            .with_status(BeadStatus::Hooked)
            .with_field("dispatcher", "daemon");
        let args = update_args(&BeadId::new("gt-abc"), &patch);
        assert_eq!(args[0], "update");
        assert_eq!(args[1], "gt-abc");
        assert!(args.contains(&"--add-label=queued".to_string()));
        assert!(args.contains(&"--remove-label=queued:rig:gastown".to_string()));
        assert!(args.contains(&"--status=hooked".to_string()));
        assert!(args.contains(&"--field=dispatcher=daemon".to_string()));
    }
}
