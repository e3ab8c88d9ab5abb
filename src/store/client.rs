//! The typed surface the core consumes from the external issue store.
//!
//! The store itself is a black box: a durable issue/dependency database with
//! its own readiness query, label mutation, and event stream. Everything the
//! coordination engine needs is expressed through the [`StoreClient`] trait so
//! the production subprocess client and the in-memory test store are
//! interchangeable.
//!
//! # Contract notes
//!
//! - `query_ready` returns beads not blocked by open dependencies of blocking
//!   kinds; the label filter lets the queue ask for `label=queued`.
//! - `update` is the only mutation primitive beyond convoy creation: label
//!   add/remove, description rewrite, status change, and close all go through
//!   a single [`BeadPatch`].
//! - `events_since` is the event-driven feed's input; event ordering follows
//!   the store's own timestamps.

use std::collections::BTreeMap;
use std::future::Future;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::types::{Bead, BeadId, BeadStatus, ConvoyId, StoreEvent};

/// Errors from store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store process could not be reached or spawned.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// The store command ran but reported failure.
    #[error("store command failed ({op}): {detail}")]
    CommandFailed { op: &'static str, detail: String },

    /// The store's JSON output did not parse.
    #[error("parsing store output: {0}")]
    Parse(#[from] serde_json::Error),

    /// A store operation exceeded its timeout.
    #[error("store operation {op} timed out after {secs}s")]
    Timeout { op: &'static str, secs: u64 },

    /// The requested bead does not exist.
    #[error("bead not found: {0}")]
    NotFound(BeadId),

    /// IO error talking to the store.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Filter for `list` queries.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub label: Option<String>,
    pub status: Option<BeadStatus>,
    pub issue_type: Option<String>,
    pub limit: Option<usize>,
}

impl ListFilter {
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn with_status(mut self, status: BeadStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_type(mut self, issue_type: impl Into<String>) -> Self {
        self.issue_type = Some(issue_type.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// A batched mutation applied to a single bead.
///
/// The store applies the parts in one update; an empty patch is a no-op.
#[derive(Debug, Clone, Default)]
pub struct BeadPatch {
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
    pub description: Option<String>,
    pub status: Option<BeadStatus>,
    pub close_reason: Option<String>,
    /// Ancillary key/value fields persisted on the bead (dispatcher identity,
    /// spawn args).
    pub fields: BTreeMap<String, String>,
}

impl BeadPatch {
    pub fn add_label(mut self, label: impl Into<String>) -> Self {
        self.add_labels.push(label.into());
        self
    }

    pub fn remove_label(mut self, label: impl Into<String>) -> Self {
        self.remove_labels.push(label.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_status(mut self, status: BeadStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Marks the bead closed, optionally with a reason.
    pub fn close(mut self, reason: Option<String>) -> Self {
        self.status = Some(BeadStatus::Closed);
        self.close_reason = reason;
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.add_labels.is_empty()
            && self.remove_labels.is_empty()
            && self.description.is_none()
            && self.status.is_none()
            && self.close_reason.is_none()
            && self.fields.is_empty()
    }
}

/// Typed operations over the external issue store.
///
/// Implementations: [`BdClient`](super::bd::BdClient) (production, shells out
/// to the `bd` CLI) and `MockStore` (tests, in-memory with injectable
/// failures).
pub trait StoreClient: Send + Sync {
    /// Issues not blocked by open blocking-kind dependencies, optionally
    /// restricted to a label. This is the store's own readiness query.
    fn query_ready(&self, label: Option<&str>) -> impl Future<Output = Result<Vec<Bead>>> + Send;

    /// Lists beads matching a filter.
    fn list(&self, filter: ListFilter) -> impl Future<Output = Result<Vec<Bead>>> + Send;

    /// Fetches a single bead.
    fn get(&self, id: &BeadId) -> impl Future<Output = Result<Bead>> + Send;

    /// Applies a batched mutation to a bead.
    fn update(&self, id: &BeadId, patch: BeadPatch) -> impl Future<Output = Result<()>> + Send;

    /// Creates a convoy tracking `members`, in the given order.
    fn create_convoy(
        &self,
        title: &str,
        members: &[BeadId],
    ) -> impl Future<Output = Result<ConvoyId>> + Send;

    /// Appends `member` to an existing convoy's tracked members.
    fn track_member(
        &self,
        convoy: &ConvoyId,
        member: &BeadId,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Events strictly after `since`, in store timestamp order.
    fn events_since(
        &self,
        since: DateTime<Utc>,
    ) -> impl Future<Output = Result<Vec<StoreEvent>>> + Send;

    /// Timestamp of the newest event in the stream, if any.
    ///
    /// Used by the warm-up cycle to seed the watermark without processing.
    fn latest_event_at(&self) -> impl Future<Output = Result<Option<DateTime<Utc>>>> + Send;
}

// Shared references forward, so loops can borrow one client.
impl<T: StoreClient> StoreClient for &T {
    async fn query_ready(&self, label: Option<&str>) -> Result<Vec<Bead>> {
        (**self).query_ready(label).await
    }

    async fn list(&self, filter: ListFilter) -> Result<Vec<Bead>> {
        (**self).list(filter).await
    }

    async fn get(&self, id: &BeadId) -> Result<Bead> {
        (**self).get(id).await
    }

    async fn update(&self, id: &BeadId, patch: BeadPatch) -> Result<()> {
        (**self).update(id, patch).await
    }

    async fn create_convoy(&self, title: &str, members: &[BeadId]) -> Result<ConvoyId> {
        (**self).create_convoy(title, members).await
    }

    async fn track_member(&self, convoy: &ConvoyId, member: &BeadId) -> Result<()> {
        (**self).track_member(convoy, member).await
    }

    async fn events_since(&self, since: DateTime<Utc>) -> Result<Vec<StoreEvent>> {
        (**self).events_since(since).await
    }

    async fn latest_event_at(&self) -> Result<Option<DateTime<Utc>>> {
        (**self).latest_event_at().await
    }
}
