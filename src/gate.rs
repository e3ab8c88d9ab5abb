//! Dispatch gates: which beads may be handed to a worker, and when.
//!
//! Two independent checks guard every dispatch, on both convoy feed paths and
//! the queue path:
//!
//! - the **type gate** admits only leaf work units; aggregates (epics,
//!   convoys, decisions) must never spawn a session;
//! - the **block gate** holds back beads with open dependencies of blocking
//!   kinds.
//!
//! The block gate fails open: on a store error it reports "not blocked" and
//! lets the next cadence retry with fresh state. A transient store failure
//! must never permanently stall the queue or a convoy.

use tracing::warn;

use crate::store::{StoreClient, StoreError};
use crate::types::Bead;

/// Issue types that dispatch to workers.
///
/// The empty string is a legacy default meaning `task`; the normalisation
/// lives here at the gate, and the store is never mutated to fill it.
const DISPATCHABLE_TYPES: [&str; 5] = ["task", "bug", "feature", "chore", ""];

/// Returns true iff beads of this type are dispatchable leaves.
pub fn is_dispatchable_type(issue_type: &str) -> bool {
    DISPATCHABLE_TYPES.contains(&issue_type)
}

/// Returns true iff the bead is currently blocked by an open dependency of a
/// blocking kind (`blocks`, `conditional-blocks`, `waits-for`).
///
/// `parent-child` never blocks: a child task may proceed while its parent
/// epic is open, matching the store's own readiness query.
///
/// Fail-open: a store error while resolving a dependency target yields
/// `false`.
pub async fn is_blocked<S: StoreClient>(bead: &Bead, store: &S) -> bool {
    for dep in bead.blocking_deps() {
        match store.get(&dep.target).await {
            Ok(target) => {
                if !target.status.is_closed() {
                    return true;
                }
            }
            Err(StoreError::NotFound(_)) => {
                // A dangling edge cannot hold work back.
                continue;
            }
            Err(e) => {
                warn!(bead = %bead.id, dep = %dep.target, error = %e,
                    "block gate: store error, failing open");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{bead, bead_with_deps, MockStore};
    use crate::types::{DepKind, Dependency};
    use proptest::prelude::*;

    #[test]
    fn leaf_types_are_dispatchable() {
        for t in ["task", "bug", "feature", "chore", ""] {
            assert!(is_dispatchable_type(t), "{t:?} should dispatch");
        }
    }

    #[test]
    fn aggregate_types_are_not_dispatchable() {
        for t in ["epic", "sub-epic", "convoy", "decision", "wisp"] {
            assert!(!is_dispatchable_type(t), "{t:?} should not dispatch");
        }
    }

    proptest! {
        #[test]
        fn arbitrary_types_dispatch_only_from_the_leaf_set(t in "[a-z-]{0,12}") {
            let expected = matches!(t.as_str(), "task" | "bug" | "feature" | "chore" | "");
            prop_assert_eq!(is_dispatchable_type(&t), expected);
        }
    }

    #[tokio::test]
    async fn open_blocking_dep_blocks() {
        for kind in [DepKind::Blocks, DepKind::ConditionalBlocks, DepKind::WaitsFor] {
            let store = MockStore::new();
            store.insert(bead("gt-target", "open"));
            let b = bead_with_deps("gt-a", "open", vec![Dependency::new(kind, "gt-target")]);
            assert!(is_blocked(&b, &store).await, "{kind:?} should block");
        }
    }

    #[tokio::test]
    async fn closed_blocking_dep_does_not_block() {
        let store = MockStore::new();
        store.insert(bead("gt-target", "closed"));
        let b = bead_with_deps(
            "gt-a",
            "open",
            vec![Dependency::new(DepKind::Blocks, "gt-target")],
        );
        assert!(!is_blocked(&b, &store).await);
    }

    #[tokio::test]
    async fn parent_child_never_blocks() {
        let store = MockStore::new();
        store.insert(bead("gt-epic", "open"));
        let b = bead_with_deps(
            "gt-child",
            "open",
            vec![Dependency::new(DepKind::ParentChild, "gt-epic")],
        );
        assert!(!is_blocked(&b, &store).await);
    }

    #[tokio::test]
    async fn related_never_blocks() {
        let store = MockStore::new();
        store.insert(bead("gt-other", "open"));
        let b = bead_with_deps(
            "gt-a",
            "open",
            vec![Dependency::new(DepKind::Related, "gt-other")],
        );
        assert!(!is_blocked(&b, &store).await);
    }

    #[tokio::test]
    async fn store_error_fails_open() {
        let store = MockStore::new();
        store.fail_gets();
        let b = bead_with_deps(
            "gt-a",
            "open",
            vec![Dependency::new(DepKind::Blocks, "gt-target")],
        );
        assert!(!is_blocked(&b, &store).await);
    }

    #[tokio::test]
    async fn dangling_dep_target_does_not_block() {
        let store = MockStore::new();
        let b = bead_with_deps(
            "gt-a",
            "open",
            vec![Dependency::new(DepKind::Blocks, "gt-gone")],
        );
        assert!(!is_blocked(&b, &store).await);
    }
}
