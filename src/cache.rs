use crate::store::{self, Loaded};
use crate::types::{Endpoint, Pool, Provider};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// On-disk pool of discovered endpoints.
///
/// Reads are strict: the pool is only returned when every provider still has
/// at least one valid endpoint. Writes are best-effort and never fail the caller.
pub struct EndpointCache {
    path: PathBuf,
}

impl EndpointCache {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Option<Pool> {
        let data: Value = match store::read_json(&self.path).await {
            Loaded::Value(v) => v,
            Loaded::Absent => return None,
            Loaded::Corrupt(reason) => {
                debug!(path = ?self.path, %reason, "ignoring unreadable server cache");
                return None;
            }
        };

        let mut pool = Pool::empty();
        for provider in Provider::ALL {
            let entries = valid_entries(data.get(provider.key()));
            if entries.is_empty() {
                debug!(%provider, "server cache has no usable entries");
                return None;
            }
            pool.set(provider, entries);
        }
        Some(pool)
    }

    pub async fn save(&self, pool: &Pool) {
        if let Err(e) = store::write_json(&self.path, pool).await {
            warn!(path = ?self.path, error = %e, "could not write server cache");
        }
    }

    /// Empties every provider list so the next `load` misses.
    pub async fn invalidate(&self) {
        self.save(&Pool::empty()).await;
    }
}

fn valid_entries(list: Option<&Value>) -> Vec<Endpoint> {
    list.and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Endpoint::from_record)
                .filter(Endpoint::is_valid)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use serde_json::json;
    use tempfile::tempdir;
    use tokio::fs;

    fn full_pool() -> Pool {
        let mut pool = Pool::empty();
        pool.set(Provider::Etisalat, vec![Endpoint::new(2001, "e& UAE", "Dubai", "United Arab Emirates")]);
        pool.set(Provider::Du, vec![Endpoint::new(2002, "du", "Abu Dhabi", "United Arab Emirates")]);
        pool
    }

    #[tokio::test]
    async fn test_cache_flow() -> Result<()> {
        let dir = tempdir()?;
        let cache = EndpointCache::new(dir.path().join("servers.json"));

        // 1. Missing file
        assert!(cache.load().await.is_none());

        // 2. Save and reload
        cache.save(&full_pool()).await;
        assert_eq!(cache.load().await, Some(full_pool()));

        // 3. Invalidate twice, still absent
        cache.invalidate().await;
        assert!(cache.load().await.is_none());
        cache.invalidate().await;
        assert!(cache.load().await.is_none());

        let content = fs::read_to_string(cache.path()).await?;
        assert_eq!(content, r#"{"etisalat":[],"du":[]}"#);
        Ok(())
    }

    #[tokio::test]
    async fn test_invalid_entries_are_dropped() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");
        let cache = EndpointCache::new(path.clone());

        let data = json!({
            "etisalat": [
                {"id": "999", "sponsor": "e& UAE"},
                {"id": "junk"},
                {"id": "34239", "sponsor": "e& UAE", "name": "Alain", "country": "UAE"}
            ],
            "du": [{"id": 1692, "sponsor": "du", "name": "Abu Dhabi", "country": "UAE"}]
        });
        fs::write(&path, data.to_string()).await?;

        let pool = cache.load().await.expect("pool should load");
        assert_eq!(pool.get(Provider::Etisalat), &[Provider::Etisalat.fallback()]);
        assert_eq!(pool.get(Provider::Du), &[Provider::Du.fallback()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_provider_emptied_by_filtering_is_absent() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("servers.json");
        let cache = EndpointCache::new(path.clone());

        let data = json!({
            "etisalat": [{"id": 34239, "sponsor": "e& UAE"}],
            "du": [{"id": 12}, {"id": "x"}]
        });
        fs::write(&path, data.to_string()).await?;
        assert!(cache.load().await.is_none());

        // Missing key behaves the same
        fs::write(&path, json!({"etisalat": [{"id": 34239}]}).to_string()).await?;
        assert!(cache.load().await.is_none());

        // Garbage
        fs::write(&path, "[1, 2").await?;
        assert!(cache.load().await.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn test_save_into_unwritable_location_is_swallowed() -> Result<()> {
        let dir = tempdir()?;
        // A file where a directory is expected
        let blocker = dir.path().join("blocker");
        fs::write(&blocker, "x").await?;
        let cache = EndpointCache::new(blocker.join("servers.json"));

        cache.save(&full_pool()).await;
        assert!(cache.load().await.is_none());
        Ok(())
    }
}
