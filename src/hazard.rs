//! Hazard-report upvoting.
//!
//! At-most-once-per-user toggle: upvoting adds the user to the report's
//! `upvoted_by` set and increments the counter; upvoting again removes and
//! decrements. Two calls by the same user always return the report to its
//! prior state.

use tracing::info;

use crate::backend::DocumentStore;
use crate::error::BackendError;

/// Toggle `user_id`'s upvote on a hazard report. Returns the new upvote
/// state: `true` when the vote was added, `false` when it was removed.
pub async fn toggle_upvote(
    store: &dyn DocumentStore,
    report_id: &str,
    user_id: &str,
) -> Result<bool, BackendError> {
    let report = store
        .get_hazard_report(report_id)
        .await?
        .ok_or_else(|| BackendError::NotFound(report_id.to_string()))?;

    let has_upvoted = report.upvoted_by.iter().any(|u| u == user_id);
    store.apply_upvote(report_id, user_id, !has_upvoted).await?;

    info!(report_id, user_id, added = !has_upvoted, "upvote toggled");
    Ok(!has_upvoted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{HazardReport, MemoryStore};

    fn seeded() -> MemoryStore {
        let store = MemoryStore::new();
        store.insert_hazard_report(HazardReport {
            id: "hz-1".to_string(),
            description: "poor lighting near block C".to_string(),
            upvotes: 3,
            upvoted_by: vec!["user-a".to_string()],
        });
        store
    }

    #[tokio::test]
    async fn test_toggle_adds_then_removes() {
        let store = seeded();

        assert!(toggle_upvote(&store, "hz-1", "user-b").await.unwrap());
        let report = store.get_hazard_report("hz-1").await.unwrap().unwrap();
        assert_eq!(report.upvotes, 4);
        assert!(report.upvoted_by.contains(&"user-b".to_string()));

        assert!(!toggle_upvote(&store, "hz-1", "user-b").await.unwrap());
        let report = store.get_hazard_report("hz-1").await.unwrap().unwrap();

        // Back to the original state
        assert_eq!(report.upvotes, 3);
        assert_eq!(report.upvoted_by, vec!["user-a".to_string()]);
    }

    #[tokio::test]
    async fn test_existing_voter_toggles_off_first() {
        let store = seeded();

        assert!(!toggle_upvote(&store, "hz-1", "user-a").await.unwrap());
        let report = store.get_hazard_report("hz-1").await.unwrap().unwrap();
        assert_eq!(report.upvotes, 2);
        assert!(report.upvoted_by.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_report_is_not_found() {
        let store = MemoryStore::new();
        let err = toggle_upvote(&store, "missing", "user-a").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }
}
