use crate::ambient::AmbientProbe;
use crate::error::Result;
use crate::runner::Runner;
use crate::traits::{Forwarder, Recorder};
use crate::types::{LogRow, Provider};
use rand::Rng;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Clone)]
pub struct CycleSettings {
    pub device_id: String,
    pub hostname: String,
    pub retries: u32,
    pub interval: Duration,
    pub interval_jitter: Duration,
    pub provider_pause: Duration,
}

/// Drives measurement cycles until the cancellation token fires.
///
/// Providers are measured one after another, never concurrently. The token is
/// checked at cycle boundaries and during the interval sleep; a measurement in
/// flight always runs to completion.
pub struct Orchestrator {
    runner: Runner,
    ambient: AmbientProbe,
    recorder: Box<dyn Recorder>,
    forwarders: Vec<Box<dyn Forwarder>>,
    settings: CycleSettings,
    cancel: CancellationToken,
}

impl Orchestrator {
    pub fn new(
        runner: Runner,
        ambient: AmbientProbe,
        recorder: Box<dyn Recorder>,
        forwarders: Vec<Box<dyn Forwarder>>,
        settings: CycleSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            runner,
            ambient,
            recorder,
            forwarders,
            settings,
            cancel,
        }
    }

    pub async fn run(&mut self) {
        // Fresh discovery on every start
        self.runner.discovery().cache().invalidate().await;

        let mut cycle = 0u64;
        while !self.cancel.is_cancelled() {
            cycle += 1;
            info!(cycle, "Cycle started");
            match self.run_cycle().await {
                Ok(succeeded) => info!(cycle, succeeded, "Cycle finished"),
                Err(e) => error!(cycle, error = %e, "Cycle failed"),
            }
            self.sleep_interval().await;
        }
        info!("Shutdown requested, stopping");
    }

    /// One pass over all providers. Returns how many produced a result.
    pub async fn run_cycle(&mut self) -> Result<usize> {
        let ambient = self.ambient.collect().await;
        let mut succeeded = 0;

        for provider in Provider::ALL {
            let Some(result) = self.runner.measure(provider, self.settings.retries).await else {
                self.recorder.record_failure(&ambient.ts_iso, provider).await?;
                continue;
            };

            let row = LogRow::new(&self.settings.device_id, &self.settings.hostname, &ambient, result);
            self.recorder.record(&row).await?;
            for forwarder in &self.forwarders {
                if let Err(e) = forwarder.forward(&row).await {
                    warn!(forwarder = forwarder.name(), %provider, error = %e, "Forwarding failed");
                }
            }
            succeeded += 1;
            tokio::time::sleep(self.settings.provider_pause).await;
        }
        Ok(succeeded)
    }

    async fn sleep_interval(&self) {
        let secs = jittered_interval(
            self.settings.interval.as_secs(),
            self.settings.interval_jitter.as_secs(),
            &mut rand::thread_rng(),
        );
        info!(secs, "Sleeping until next cycle");
        tokio::select! {
            _ = self.cancel.cancelled() => {}
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
        }
    }
}

/// `base` shifted by a uniform offset in `[-jitter, +jitter]`, floored at zero.
pub fn jittered_interval<R: Rng + ?Sized>(base: u64, jitter: u64, rng: &mut R) -> u64 {
    let spread = i128::from(jitter);
    let offset = rng.gen_range(-spread..=spread);
    (i128::from(base) + offset).clamp(0, i128::from(u64::MAX)) as u64
}
