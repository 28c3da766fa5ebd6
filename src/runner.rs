use crate::discovery::Discovery;
use crate::error::Result;
use crate::preferred::PreferredStore;
use crate::traits::SessionFactory;
use crate::types::{Endpoint, MeasurementResult, Provider};
use crate::utils::round2;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on servers tried per measurement; bounds worst-case cycle time.
pub const MAX_CANDIDATES: usize = 3;

#[derive(Debug, Clone)]
pub struct RunnerSettings {
    /// Parallel transfers during download and upload.
    pub concurrency: usize,
    /// Pause after every failed attempt.
    pub retry_backoff: Duration,
    /// Pause between forcing a cache reset and rediscovering.
    pub rediscovery_pause: Duration,
}

/// Turns a provider into one measurement, failing over across servers.
pub struct Runner {
    discovery: Discovery,
    preferred: PreferredStore,
    sessions: Arc<dyn SessionFactory>,
    settings: RunnerSettings,
    rng: Mutex<StdRng>,
}

impl Runner {
    pub fn new(
        discovery: Discovery,
        preferred: PreferredStore,
        sessions: Arc<dyn SessionFactory>,
        settings: RunnerSettings,
    ) -> Self {
        Self {
            discovery,
            preferred,
            sessions,
            settings,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replaces the generator that shuffles candidate order.
    #[cfg(test)]
    pub(crate) fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = Mutex::new(rng);
        self
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    /// Runs up to `max_retries` attempts on each of the first
    /// [`MAX_CANDIDATES`] servers and returns the first success.
    ///
    /// Total failure returns `None`. When at least `2 * max_retries` attempts
    /// failed the cache is reset and rediscovered so the next cycle starts fresh.
    pub async fn measure(&self, provider: Provider, max_retries: u32) -> Option<MeasurementResult> {
        let mut candidates = self.discovery.discover().await.get(provider).to_vec();
        if candidates.is_empty() {
            warn!(%provider, "No servers found, triggering rediscovery");
            self.discovery.cache().invalidate().await;
            tokio::time::sleep(self.settings.rediscovery_pause).await;
            candidates = self.discovery.discover().await.get(provider).to_vec();
        }

        let preferred = self.preferred.get(provider).await;
        if let Some(ref last_good) = preferred {
            info!(%provider, server = %last_good, "Trying last known good server first");
        }
        let ordered = {
            let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
            order_candidates(candidates, preferred, &mut *rng)
        };

        let mut failures = 0u32;
        for endpoint in ordered.iter().take(MAX_CANDIDATES) {
            for attempt in 1..=max_retries {
                info!(%provider, server = %endpoint, attempt, "Starting speed test");
                match self.attempt(provider, endpoint).await {
                    Ok(result) => {
                        info!(
                            %provider,
                            download_mbps = result.download_mbps,
                            upload_mbps = result.upload_mbps,
                            latency_ms = ?result.latency_ms,
                            duration_s = result.duration_s,
                            threads = result.concurrency_used,
                            "Speed test finished"
                        );
                        self.preferred.set(provider, endpoint).await;
                        return Some(result);
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(%provider, server_id = endpoint.id, attempt, error = %e, "Speed test attempt failed");
                        tokio::time::sleep(self.settings.retry_backoff).await;
                    }
                }
            }
        }

        error!(%provider, failures, "All speed test attempts failed");
        if failures >= max_retries.saturating_mul(2) {
            info!(%provider, "Re-discovering servers after repeated failures");
            self.discovery.cache().invalidate().await;
            self.discovery.discover().await;
        }
        None
    }

    async fn attempt(&self, provider: Provider, endpoint: &Endpoint) -> Result<MeasurementResult> {
        let concurrency = self.settings.concurrency;
        let mut session = self.sessions.open(endpoint).await?;
        let best = session.best_server().await?;
        debug!(%provider, server_id = best.id, latency_ms = ?best.latency_ms, "Server latency");

        let started = Instant::now();
        let download = session.download(concurrency).await? / 1e6;
        let upload = session.upload(concurrency).await? / 1e6;
        let duration = started.elapsed().as_secs_f64();

        Ok(MeasurementResult {
            test_id: Uuid::new_v4().to_string(),
            provider,
            speedtest_server: endpoint.name.clone(),
            speedtest_sponsor: endpoint.sponsor.clone(),
            speedtest_country: endpoint.country.clone(),
            server_id: endpoint.id,
            latency_ms: best.latency_ms.map(round2),
            download_mbps: round2(download),
            upload_mbps: round2(upload),
            duration_s: round2(duration),
            concurrency_used: concurrency,
        })
    }
}

/// Pins `preferred` at the front (dropping its duplicate) and shuffles the rest.
pub fn order_candidates<R: Rng + ?Sized>(
    candidates: Vec<Endpoint>,
    preferred: Option<Endpoint>,
    rng: &mut R,
) -> Vec<Endpoint> {
    let mut rest: Vec<Endpoint> = match &preferred {
        Some(p) => candidates.into_iter().filter(|c| c.id != p.id).collect(),
        None => candidates,
    };
    rest.shuffle(rng);
    preferred.into_iter().chain(rest).collect()
}
