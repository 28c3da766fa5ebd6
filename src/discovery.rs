use crate::cache::EndpointCache;
use crate::error::Result;
use crate::traits::ServerDirectory;
use crate::types::{Endpoint, Pool, Provider, REGION_MARKERS};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

/// Finds measurement servers for every provider, going to the upstream
/// directory only when the cache has nothing usable.
pub struct Discovery {
    cache: EndpointCache,
    directory: Arc<dyn ServerDirectory>,
}

impl Discovery {
    pub fn new(cache: EndpointCache, directory: Arc<dyn ServerDirectory>) -> Self {
        Self { cache, directory }
    }

    pub fn cache(&self) -> &EndpointCache {
        &self.cache
    }

    /// Returns an empty pool (every provider empty) when the directory query fails.
    pub async fn discover(&self) -> Pool {
        if let Some(cached) = self.cache.load().await {
            return cached;
        }

        info!("Discovering servers from upstream directory");
        match self.query().await {
            Ok(pool) => {
                info!(
                    etisalat = pool.get(Provider::Etisalat).len(),
                    du = pool.get(Provider::Du).len(),
                    "Discovery finished"
                );
                self.cache.save(&pool).await;
                pool
            }
            Err(e) => {
                warn!(error = %e, "Discovery failed");
                Pool::empty()
            }
        }
    }

    async fn query(&self) -> Result<Pool> {
        let records = self.directory.list_servers().await?;
        let mut pool = classify(&records);

        for provider in Provider::ALL {
            if pool.get(provider).is_empty() {
                let fallback = provider.fallback();
                info!(%provider, server = %fallback, "No servers matched, using fallback");
                pool.set(provider, vec![fallback]);
            }
        }
        Ok(pool)
    }
}

/// Buckets raw directory records by provider.
///
/// A record must be in the region and match a provider keyword in its sponsor
/// or name; everything else is dropped. Records without a numeric id are skipped.
pub fn classify(records: &[Value]) -> Pool {
    let mut pool = Pool::empty();
    let mut buckets: Vec<(Provider, Vec<Endpoint>)> =
        Provider::ALL.into_iter().map(|p| (p, Vec::new())).collect();

    for endpoint in records.iter().filter_map(Endpoint::from_record) {
        let country = endpoint.country.to_lowercase();
        if !REGION_MARKERS.iter().any(|m| country.contains(m)) {
            continue;
        }

        let sponsor = endpoint.sponsor.to_lowercase();
        let name = endpoint.name.to_lowercase();
        let matched = buckets.iter_mut().find(|(provider, _)| {
            provider
                .keywords()
                .iter()
                .any(|k| sponsor.contains(k) || name.contains(k))
        });
        if let Some((_, bucket)) = matched {
            bucket.push(endpoint);
        }
    }

    for (provider, endpoints) in buckets {
        pool.set(provider, endpoints);
    }
    pool
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::NetLoggerError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    /// Directory stub that counts how often it is queried.
    pub(crate) struct StubDirectory {
        pub records: Option<Vec<Value>>,
        pub calls: AtomicUsize,
    }

    impl StubDirectory {
        pub fn new(records: Vec<Value>) -> Self {
            Self { records: Some(records), calls: AtomicUsize::new(0) }
        }

        pub fn failing() -> Self {
            Self { records: None, calls: AtomicUsize::new(0) }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ServerDirectory for StubDirectory {
        async fn list_servers(&self) -> Result<Vec<Value>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.records
                .clone()
                .ok_or_else(|| NetLoggerError::Custom("directory unreachable".to_string()))
        }
    }

    pub(crate) fn server(id: u64, sponsor: &str, name: &str) -> Value {
        json!({"id": id.to_string(), "sponsor": sponsor, "name": name, "country": "United Arab Emirates"})
    }

    fn ids(endpoints: &[Endpoint]) -> Vec<u64> {
        endpoints.iter().map(|e| e.id).collect()
    }

    #[test]
    fn test_classify_uae_sponsors() {
        let records = vec![
            server(2001, "e& UAE", "Abu Dhabi"),
            server(2002, "du", "Sharjah"),
            server(2003, "du", "Al Ain"),
            server(2004, "Etisalat", "Fujairah"),
            server(2005, "Random ISP", "Ajman"),
        ];
        let pool = classify(&records);
        assert_eq!(ids(pool.get(Provider::Etisalat)), vec![2001, 2004]);
        assert_eq!(ids(pool.get(Provider::Du)), vec![2002, 2003]);
    }

    #[test]
    fn test_classify_region_and_malformed() {
        let records = vec![
            json!({"id": 3001, "sponsor": "du", "name": "Muscat", "country": "Oman"}),
            json!({"id": "??", "sponsor": "du", "name": "Sharjah", "country": "UAE"}),
            json!({"id": 3003, "sponsor": "EITC", "name": "Sharjah", "country": "U.A.E"}),
            json!({"id": 3004, "sponsor": "Emirates Telecommunications", "name": "x", "country": "uae"}),
        ];
        let pool = classify(&records);
        assert_eq!(ids(pool.get(Provider::Du)), vec![3003]);
        assert_eq!(ids(pool.get(Provider::Etisalat)), vec![3004]);
    }

    #[tokio::test]
    async fn test_discover_uses_fallback_and_caches() -> Result<()> {
        let dir = tempdir()?;
        let cache = EndpointCache::new(dir.path().join("servers.json"));
        let directory = Arc::new(StubDirectory::new(vec![server(2002, "du", "Sharjah")]));
        let discovery = Discovery::new(cache, directory.clone());

        let pool = discovery.discover().await;
        assert_eq!(pool.get(Provider::Etisalat), &[Provider::Etisalat.fallback()]);
        assert_eq!(ids(pool.get(Provider::Du)), vec![2002]);
        assert!(pool.is_complete());

        // Second call is served from the cache
        let again = discovery.discover().await;
        assert_eq!(again, pool);
        assert_eq!(directory.calls(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_discover_failure_returns_empty_pool() -> Result<()> {
        let dir = tempdir()?;
        let cache = EndpointCache::new(dir.path().join("servers.json"));
        let directory = Arc::new(StubDirectory::failing());
        let discovery = Discovery::new(cache, directory.clone());

        let pool = discovery.discover().await;
        assert_eq!(pool, Pool::empty());
        assert!(discovery.cache().load().await.is_none());

        // Nothing cached, so the directory is asked again
        discovery.discover().await;
        assert_eq!(directory.calls(), 2);
        Ok(())
    }
}
