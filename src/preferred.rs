use crate::store::{self, Loaded};
use crate::types::{Endpoint, Provider};
use serde_json::{Map, Value};
use std::path::PathBuf;
use tracing::{debug, warn};

/// Remembers the last server that produced a successful test, per provider.
///
/// The whole record is rewritten on every update; concurrent writers lose
/// updates (last writer wins), which is acceptable for a hint.
pub struct PreferredStore {
    path: PathBuf,
}

impl PreferredStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub async fn get(&self, provider: Provider) -> Option<Endpoint> {
        self.load_all().await.get(provider.key()).and_then(Endpoint::from_record)
    }

    pub async fn set(&self, provider: Provider, endpoint: &Endpoint) {
        let mut data = self.load_all().await;
        match serde_json::to_value(endpoint) {
            Ok(v) => {
                data.insert(provider.key().to_string(), v);
            }
            Err(e) => {
                warn!(error = %e, "could not encode preferred server");
                return;
            }
        }
        if let Err(e) = store::write_json(&self.path, &data).await {
            warn!(path = ?self.path, error = %e, "could not write preferred server record");
        }
    }

    async fn load_all(&self) -> Map<String, Value> {
        match store::read_json(&self.path).await {
            Loaded::Value(Value::Object(map)) => map,
            Loaded::Value(_) | Loaded::Absent => Map::new(),
            Loaded::Corrupt(reason) => {
                debug!(path = ?self.path, %reason, "ignoring unreadable preferred server record");
                Map::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use tempfile::tempdir;
    use tokio::fs;

    #[tokio::test]
    async fn test_preferred_flow() -> Result<()> {
        let dir = tempdir()?;
        let store = PreferredStore::new(dir.path().join("last_good.json"));

        assert!(store.get(Provider::Du).await.is_none());

        let du = Endpoint::new(2002, "du", "Sharjah", "United Arab Emirates");
        store.set(Provider::Du, &du).await;
        assert_eq!(store.get(Provider::Du).await, Some(du.clone()));
        assert!(store.get(Provider::Etisalat).await.is_none());

        // Other providers are preserved on update
        let et = Provider::Etisalat.fallback();
        store.set(Provider::Etisalat, &et).await;
        assert_eq!(store.get(Provider::Du).await, Some(du));
        assert_eq!(store.get(Provider::Etisalat).await, Some(et));
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupt_record_reads_absent_and_is_replaced() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("last_good.json");
        fs::write(&path, "not json at all").await?;
        let store = PreferredStore::new(path);

        assert!(store.get(Provider::Du).await.is_none());

        let du = Provider::Du.fallback();
        store.set(Provider::Du, &du).await;
        assert_eq!(store.get(Provider::Du).await, Some(du));
        Ok(())
    }
}
