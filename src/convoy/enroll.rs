//! Batch enrollment: turn a list of beads into exactly one tracking convoy.
//!
//! Enrollment validates, then creates; it never dispatches. Dispatch is the
//! convoy manager's job, driven by the feed paths. Every validation failure
//! carries enough detail for the operator to fix the invocation: per-bead rig
//! resolutions, the routing file path, or the conflicting convoy's members.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;
use tracing::{info, instrument};

use crate::store::{RoutingTable, StoreClient, StoreError};
use crate::types::{BeadId, BeadStatus, ConvoyId, RigName};

use super::manager::find_tracking_convoy;

/// Per-bead rig resolution, for error reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub bead: BeadId,
    pub rig: Option<RigName>,
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.rig {
            Some(rig) => write!(f, "{} → {}", self.bead, rig),
            None => write!(f, "{} → (unmapped)", self.bead),
        }
    }
}

/// Errors from batch enrollment.
#[derive(Debug, Error)]
pub enum EnrollError {
    /// No beads supplied.
    #[error("no beads to enroll")]
    Empty,

    /// A bead is already tracked by an open convoy. The whole batch is
    /// rejected; `batch` carries each supplied bead's status within the
    /// conflicting convoy ("n/a" for beads it does not track).
    #[error("{} already tracked by convoy {convoy}: {}", conflicting, format_batch(batch))]
    AlreadyTracked {
        convoy: ConvoyId,
        conflicting: BeadId,
        /// The conflicting convoy's full member list.
        members: Vec<BeadId>,
        /// Per supplied bead: its status if tracked by the convoy.
        batch: Vec<(BeadId, Option<BeadStatus>)>,
    },

    /// Prefixes resolve to different rigs; every resolution is listed.
    #[error("beads resolve to different rigs: {}; sling one rig at a time", format_resolutions(resolutions))]
    MixedRigs { resolutions: Vec<Resolution> },

    /// A prefix has no route; points at the routing file.
    #[error("no rig route for prefix {prefix:?} of {bead}; add a line to {}", routing_path.display())]
    UnmappedPrefix {
        bead: BeadId,
        prefix: String,
        routing_path: PathBuf,
    },

    /// Town-level beads (hq-) have no rig and cannot be enrolled for
    /// dispatch.
    #[error("{0} is town-level (hq) and has no target rig")]
    TownLevel(BeadId),

    /// Explicitly supplied rig disagrees with the prefixes.
    #[error("supplied rig {rig} does not match: {}", format_resolutions(resolutions))]
    RigMismatch {
        rig: RigName,
        resolutions: Vec<Resolution>,
    },

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

fn format_resolutions(resolutions: &[Resolution]) -> String {
    resolutions
        .iter()
        .map(|r| r.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_batch(batch: &[(BeadId, Option<BeadStatus>)]) -> String {
    batch
        .iter()
        .map(|(id, status)| match status {
            Some(s) => format!("{id}: {s}"),
            None => format!("{id}: n/a"),
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// A successful enrollment.
#[derive(Debug, Clone)]
pub struct EnrollOutcome {
    pub convoy: ConvoyId,
    pub rig: RigName,
    /// True when the rig came from the deprecated explicit argument; the CLI
    /// prints a deprecation notice.
    pub deprecated_rig_arg: bool,
}

/// Resolves the batch's target rig.
///
/// With an explicit rig, every bead's prefix must route to it. Without one,
/// every prefix must resolve, and to the same rig.
pub fn resolve_target_rig(
    routing: &RoutingTable,
    ids: &[BeadId],
    explicit: Option<&RigName>,
) -> Result<RigName, EnrollError> {
    if ids.is_empty() {
        return Err(EnrollError::Empty);
    }

    let resolutions: Vec<Resolution> = ids
        .iter()
        .map(|id| Resolution {
            bead: id.clone(),
            rig: routing.resolve(id.prefix()).cloned(),
        })
        .collect();

    if let Some(rig) = explicit {
        if resolutions.iter().all(|r| r.rig.as_ref() == Some(rig)) {
            return Ok(rig.clone());
        }
        return Err(EnrollError::RigMismatch {
            rig: rig.clone(),
            resolutions,
        });
    }

    for (id, resolution) in ids.iter().zip(&resolutions) {
        if id.is_town_level() {
            return Err(EnrollError::TownLevel(id.clone()));
        }
        if resolution.rig.is_none() {
            return Err(EnrollError::UnmappedPrefix {
                bead: id.clone(),
                prefix: id.prefix().to_string(),
                routing_path: routing.path().to_path_buf(),
            });
        }
    }

    match resolutions[0].rig.clone() {
        Some(first) if resolutions.iter().all(|r| r.rig.as_ref() == Some(&first)) => Ok(first),
        _ => Err(EnrollError::MixedRigs { resolutions }),
    }
}

/// Rejects the batch if any bead is already tracked by an open convoy.
async fn check_untracked<S: StoreClient>(store: &S, ids: &[BeadId]) -> Result<(), EnrollError> {
    for id in ids {
        if let Some(convoy) = find_tracking_convoy(store, id).await? {
            let convoy_bead = store.get(&convoy.as_bead()).await?;
            let members = convoy_bead.tracked_members();
            let mut batch = Vec::with_capacity(ids.len());
            for batch_id in ids {
                let status = if members.contains(batch_id) {
                    Some(store.get(batch_id).await?.status)
                } else {
                    None
                };
                batch.push((batch_id.clone(), status));
            }
            return Err(EnrollError::AlreadyTracked {
                convoy,
                conflicting: id.clone(),
                members,
                batch,
            });
        }
    }
    Ok(())
}

/// Enrolls a batch of beads into exactly one new convoy, members in input
/// order. Dispatches nothing.
#[instrument(skip(store, routing, title), fields(count = ids.len()))]
pub async fn enroll_batch<S: StoreClient>(
    store: &S,
    routing: &RoutingTable,
    ids: &[BeadId],
    explicit_rig: Option<&RigName>,
    title: Option<String>,
) -> Result<EnrollOutcome, EnrollError> {
    let rig = resolve_target_rig(routing, ids, explicit_rig)?;
    check_untracked(store, ids).await?;

    let title = title.unwrap_or_else(|| format!("Convoy: {} bead(s) → {rig}", ids.len()));
    let convoy = store.create_convoy(&title, ids).await?;
    info!(convoy = %convoy, rig = %rig, "enrolled batch");

    Ok(EnrollOutcome {
        convoy,
        rig,
        deprecated_rig_arg: explicit_rig.is_some(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bead, ids, test_routing, MockStore};

    #[test]
    fn resolves_uniform_batch() {
        let routing = test_routing();
        let rig = resolve_target_rig(&routing, &ids(&["gt-a", "gt-b"]), None).unwrap();
        assert_eq!(rig, RigName::new("gastown"));
    }

    #[test]
    fn mixed_prefixes_list_every_resolution() {
        let routing = test_routing();
        let err = resolve_target_rig(&routing, &ids(&["gt-a", "bd-b"]), None).unwrap_err();
        match err {
            EnrollError::MixedRigs { resolutions } => {
                assert_eq!(resolutions.len(), 2);
                assert_eq!(resolutions[0].rig, Some(RigName::new("gastown")));
                assert_eq!(resolutions[1].rig, Some(RigName::new("beads")));
            }
            other => panic!("expected MixedRigs, got {other}"),
        }
    }

    #[test]
    fn unmapped_prefix_cites_routing_file() {
        let routing = test_routing();
        let err = resolve_target_rig(&routing, &ids(&["zz-a"]), None).unwrap_err();
        match &err {
            EnrollError::UnmappedPrefix { prefix, .. } => assert_eq!(prefix, "zz"),
            other => panic!("expected UnmappedPrefix, got {other}"),
        }
        assert!(err.to_string().contains("routing.jsonl"));
    }

    #[test]
    fn town_level_beads_are_rejected() {
        let routing = test_routing();
        let err = resolve_target_rig(&routing, &ids(&["hq-a"]), None).unwrap_err();
        assert!(matches!(err, EnrollError::TownLevel(_)));
    }

    #[test]
    fn explicit_rig_must_match_all_prefixes() {
        let routing = test_routing();
        let rig = RigName::new("gastown");
        assert!(resolve_target_rig(&routing, &ids(&["gt-a"]), Some(&rig)).is_ok());
        let err = resolve_target_rig(&routing, &ids(&["bd-b"]), Some(&rig)).unwrap_err();
        assert!(matches!(err, EnrollError::RigMismatch { .. }));
    }

    #[tokio::test]
    async fn batch_produces_one_convoy_in_input_order() {
        let store = MockStore::new();
        for id in ["gt-a", "gt-b", "gt-c"] {
            store.insert(bead(id, "open"));
        }
        let routing = test_routing();

        let outcome = enroll_batch(&store, &routing, &ids(&["gt-c", "gt-a", "gt-b"]), None, None)
            .await
            .unwrap();

        assert_eq!(store.convoys_created(), 1);
        let convoy = store.get_sync(outcome.convoy.as_str());
        assert_eq!(convoy.tracked_members(), ids(&["gt-c", "gt-a", "gt-b"]));
        assert!(!outcome.deprecated_rig_arg);
    }

    #[tokio::test]
    async fn tracked_conflict_rejects_whole_batch() {
        let store = MockStore::new();
        store.insert(bead("gt-x", "open"));
        store.insert(bead("gt-y", "open"));
        store.insert(bead("gt-z", "open"));
        store.insert_convoy("hq-cv-1", &["gt-x"]);
        let routing = test_routing();

        let err = enroll_batch(&store, &routing, &ids(&["gt-x", "gt-y", "gt-z"]), None, None)
            .await
            .unwrap_err();

        match &err {
            EnrollError::AlreadyTracked {
                convoy,
                conflicting,
                members,
                batch,
            } => {
                assert_eq!(convoy, &ConvoyId::new("hq-cv-1"));
                assert_eq!(conflicting, &BeadId::new("gt-x"));
                assert_eq!(members, &ids(&["gt-x"]));
                assert_eq!(batch[0], (BeadId::new("gt-x"), Some(BeadStatus::Open)));
                assert_eq!(batch[1], (BeadId::new("gt-y"), None));
                assert_eq!(batch[2], (BeadId::new("gt-z"), None));
            }
            other => panic!("expected AlreadyTracked, got {other}"),
        }
        // No convoy created, no labels touched.
        assert_eq!(store.convoys_created(), 0);
        let rendered = err.to_string();
        assert!(rendered.contains("gt-x: open"));
        assert!(rendered.contains("gt-y: n/a"));
    }
}
