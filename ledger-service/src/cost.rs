//! Cost version resolution.

use std::sync::Arc;

use ledger_client::{
    domain::{CostScope, CostVersion},
    CostStore, StoreError,
};
use time::OffsetDateTime;

#[derive(thiserror::Error, Debug)]
pub enum CostError {
    #[error("no cost version effective at {at} for scope {scope}")]
    NoCostVersion { scope: CostScope, at: OffsetDateTime },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Picks the version in effect at `at`: only versions with
/// `effective_from <= at` are candidates, a classroom version beats the
/// global one, then the latest `effective_from` wins and ties go to the most
/// recently created (highest id).
pub fn select_version<'a>(
    versions: &'a [CostVersion],
    scope: &CostScope,
    at: OffsetDateTime,
) -> Option<&'a CostVersion> {
    versions
        .iter()
        .filter(|v| v.effective_from <= at)
        .filter(|v| v.scope == CostScope::Global || v.scope == *scope)
        .max_by_key(|v| (v.scope.specificity(), v.effective_from, v.id))
}

pub struct CostResolver {
    store: Arc<dyn CostStore>,
}

impl CostResolver {
    pub fn new(store: Arc<dyn CostStore>) -> Self {
        Self { store }
    }

    pub async fn resolve(&self, scope: &CostScope, at: OffsetDateTime) -> Result<CostVersion, CostError> {
        let versions = self.store.cost_versions().await?;
        select_version(&versions, scope, at)
            .cloned()
            .ok_or_else(|| CostError::NoCostVersion {
                scope: scope.clone(),
                at,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ledger_client::{domain::NewCostVersion, MemoryStore};
    use time::macros::datetime;

    fn version(id: i64, rate: f64, from: OffsetDateTime, scope: CostScope) -> CostVersion {
        CostVersion {
            id,
            cost_per_kwh: rate,
            effective_from: from,
            scope,
            notes: None,
            created_at: from,
        }
    }

    #[test]
    fn latest_effective_version_wins() {
        let versions = vec![
            version(1, 7.0, datetime!(2024-01-01 00:00 UTC), CostScope::Global),
            version(2, 8.0, datetime!(2024-03-01 00:00 UTC), CostScope::Global),
        ];
        let at = datetime!(2024-02-15 12:00 UTC);
        assert_eq!(select_version(&versions, &CostScope::Global, at).unwrap().id, 1);
        let later = datetime!(2024-03-01 00:00 UTC);
        assert_eq!(select_version(&versions, &CostScope::Global, later).unwrap().id, 2);
    }

    #[test]
    fn ties_go_to_the_newest_version() {
        let from = datetime!(2024-01-01 00:00 UTC);
        let versions = vec![
            version(3, 9.0, from, CostScope::Global),
            version(4, 9.5, from, CostScope::Global),
        ];
        assert_eq!(select_version(&versions, &CostScope::Global, from).unwrap().id, 4);
    }

    #[test]
    fn classroom_overrides_global_and_falls_back() {
        let room = CostScope::Classroom("room-101".to_string());
        let versions = vec![
            version(1, 7.0, datetime!(2024-01-01 00:00 UTC), CostScope::Global),
            version(2, 6.0, datetime!(2024-02-01 00:00 UTC), room.clone()),
            version(3, 7.2, datetime!(2024-03-01 00:00 UTC), CostScope::Global),
        ];

        let jan = datetime!(2024-01-15 00:00 UTC);
        assert_eq!(select_version(&versions, &room, jan).unwrap().id, 1);
        let mar = datetime!(2024-03-15 00:00 UTC);
        assert_eq!(select_version(&versions, &room, mar).unwrap().id, 2);
        let other = CostScope::Classroom("room-202".to_string());
        assert_eq!(select_version(&versions, &other, mar).unwrap().id, 3);
    }

    #[test]
    fn nothing_effective_yet() {
        let versions = vec![version(1, 7.0, datetime!(2024-06-01 00:00 UTC), CostScope::Global)];
        assert!(select_version(&versions, &CostScope::Global, datetime!(2024-05-01 00:00 UTC)).is_none());
    }

    #[tokio::test]
    async fn resolver_reports_missing_version() {
        let store = Arc::new(MemoryStore::new());
        let resolver = CostResolver::new(store.clone());
        let at = datetime!(2024-03-01 10:00 UTC);

        let err = resolver.resolve(&CostScope::Global, at).await.unwrap_err();
        assert!(matches!(err, CostError::NoCostVersion { .. }));

        store
            .insert_cost_version(NewCostVersion {
                cost_per_kwh: 7.5,
                effective_from: datetime!(2024-01-01 00:00 UTC),
                scope: CostScope::Global,
                notes: None,
            })
            .await
            .unwrap();
        assert_eq!(resolver.resolve(&CostScope::Global, at).await.unwrap().cost_per_kwh, 7.5);
    }
}
