use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{DomainError, DomainResult};
use crate::traits::CellLocationProvider;
use crate::types::{CellGeolocation, CellQuery};

/// Resolves cell tower identifiers to approximate positions through an
/// ordered provider chain, memoizing successful lookups for the process
/// lifetime.
///
/// Failures are never cached: a query that exhausted the chain is retried
/// in full on the next call. Concurrent misses for the same query may each
/// reach the providers; only the JIT-registration path carries in-flight
/// deduplication (see `DeviceRegistry`).
pub struct CellLocationResolver {
    providers: Vec<Arc<dyn CellLocationProvider>>,
    cache: Mutex<HashMap<CellQuery, CellGeolocation>>,
}

impl CellLocationResolver {
    pub fn new(providers: Vec<Arc<dyn CellLocationProvider>>) -> Self {
        Self {
            providers,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve a cell query, trying providers in order until one succeeds.
    pub async fn resolve(&self, query: &CellQuery) -> DomainResult<CellGeolocation> {
        if let Some(cached) = self.cache.lock().await.get(query) {
            debug!(cell = %query, "cell geolocation served from cache");
            return Ok(*cached);
        }

        let mut last_error = DomainError::CellLocation("no providers configured".to_string());
        for provider in &self.providers {
            match provider.locate(query).await {
                Ok(location) => {
                    info!(
                        cell = %query,
                        provider = provider.name(),
                        lat = location.lat,
                        lng = location.lng,
                        accuracy = location.accuracy,
                        "cell geolocation found"
                    );
                    self.cache.lock().await.insert(query.clone(), location);
                    return Ok(location);
                }
                Err(e) => {
                    warn!(
                        cell = %query,
                        provider = provider.name(),
                        error = %e,
                        "cell geolocation lookup failed"
                    );
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockCellLocationProvider;
    use chrono::Utc;

    fn query() -> CellQuery {
        CellQuery {
            mccmnc: 24201,
            area_code: 30401,
            cell_id: 2_182_716,
        }
    }

    fn location(lat: f64) -> CellGeolocation {
        CellGeolocation {
            lat,
            lng: 10.4,
            accuracy: 500.0,
            resolved_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn first_success_is_cached() {
        let mut provider = MockCellLocationProvider::new();
        provider.expect_name().return_const("primary");
        provider
            .expect_locate()
            .times(1)
            .returning(|_| Ok(location(63.4)));

        let resolver = CellLocationResolver::new(vec![Arc::new(provider)]);
        let first = resolver.resolve(&query()).await.unwrap();
        let second = resolver.resolve(&query()).await.unwrap();
        assert_eq!(first.lat, 63.4);
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn fallback_is_used_and_its_result_cached() {
        let mut primary = MockCellLocationProvider::new();
        primary.expect_name().return_const("primary");
        primary
            .expect_locate()
            .times(1)
            .returning(|q| Err(DomainError::CellLocationNotFound(q.to_string())));

        let mut fallback = MockCellLocationProvider::new();
        fallback.expect_name().return_const("fallback");
        fallback
            .expect_locate()
            .times(1)
            .returning(|_| Ok(location(59.9)));

        let resolver = CellLocationResolver::new(vec![Arc::new(primary), Arc::new(fallback)]);
        let first = resolver.resolve(&query()).await.unwrap();
        assert_eq!(first.lat, 59.9);

        // Second resolution hits the cache; neither provider is called again.
        let second = resolver.resolve(&query()).await.unwrap();
        assert_eq!(second.lat, 59.9);
    }

    #[tokio::test]
    async fn exhausted_chain_is_not_cached() {
        let mut provider = MockCellLocationProvider::new();
        provider.expect_name().return_const("primary");
        let mut seq = mockall::Sequence::new();
        provider
            .expect_locate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|q| Err(DomainError::CellLocationNotFound(q.to_string())));
        provider
            .expect_locate()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(location(63.4)));

        let resolver = CellLocationResolver::new(vec![Arc::new(provider)]);
        assert!(resolver.resolve(&query()).await.is_err());
        // The failure was not cached; the retry reaches the provider.
        assert_eq!(resolver.resolve(&query()).await.unwrap().lat, 63.4);
    }

    #[tokio::test]
    async fn distinct_queries_are_cached_separately() {
        let mut provider = MockCellLocationProvider::new();
        provider.expect_name().return_const("primary");
        provider
            .expect_locate()
            .times(2)
            .returning(|q| Ok(location(q.cell_id as f64)));

        let resolver = CellLocationResolver::new(vec![Arc::new(provider)]);
        let a = CellQuery {
            mccmnc: 24201,
            area_code: 1,
            cell_id: 1,
        };
        let b = CellQuery {
            mccmnc: 24201,
            area_code: 1,
            cell_id: 2,
        };
        assert_eq!(resolver.resolve(&a).await.unwrap().lat, 1.0);
        assert_eq!(resolver.resolve(&b).await.unwrap().lat, 2.0);
        assert_eq!(resolver.resolve(&a).await.unwrap().lat, 1.0);
    }
}
