use crate::error::{NetLoggerError, Result};
use crate::traits::Forwarder;
use crate::types::LogRow;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

const PUSH_TIMEOUT: Duration = Duration::from_secs(15);

/// Inserts rows into a Supabase table through its REST endpoint.
pub struct SupabaseForwarder {
    client: Client,
    endpoint: String,
    anon_key: String,
}

impl SupabaseForwarder {
    pub fn new(base_url: &str, anon_key: &str, table: &str) -> Result<Self> {
        let client = Client::builder().timeout(PUSH_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: format!("{}/rest/v1/{}", base_url.trim_end_matches('/'), table),
            anon_key: anon_key.to_string(),
        })
    }
}

#[async_trait]
impl Forwarder for SupabaseForwarder {
    fn name(&self) -> &'static str {
        "supabase"
    }

    async fn forward(&self, row: &LogRow) -> Result<()> {
        let resp = self
            .client
            .post(&self.endpoint)
            .header("apikey", &self.anon_key)
            .bearer_auth(&self.anon_key)
            .header("Prefer", "return=representation")
            .json(row)
            .send()
            .await?;

        let status = resp.status();
        debug!(%status, "supabase insert");
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(NetLoggerError::Custom(format!(
                "supabase rejected row ({}): {}",
                status, body
            )));
        }
        Ok(())
    }
}
