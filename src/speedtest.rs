use crate::error::{NetLoggerError, Result};
use crate::traits::{MeasurementSession, ServerDirectory, SessionFactory};
use crate::types::{Endpoint, ServerReport};
use crate::utils::round2;
use async_trait::async_trait;
use futures::{stream, StreamExt, TryStreamExt};
use reqwest::{Client, Url};
use serde_json::Value;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;

pub const DEFAULT_SERVERS_URL: &str =
    "https://www.speedtest.net/api/js/servers?engine=js&https_functional=true&limit=100&search=United%20Arab%20Emirates";

const LATENCY_SAMPLES: usize = 3;

/// Sizes and repeat counts of the transfers run by a session.
#[derive(Debug, Clone)]
pub struct TransferPlan {
    /// Image edge lengths; the server serves `random{N}x{N}.jpg`.
    pub download_sizes: Vec<u32>,
    pub download_repeat: usize,
    /// Upload payload sizes in bytes.
    pub upload_sizes: Vec<usize>,
    pub upload_repeat: usize,
}

impl Default for TransferPlan {
    fn default() -> Self {
        Self {
            download_sizes: vec![350, 500, 750, 1000, 1500, 2000, 2500, 3000, 3500, 4000],
            download_repeat: 4,
            upload_sizes: vec![262_144, 524_288, 1_048_576, 2_097_152],
            upload_repeat: 4,
        }
    }
}

/// Speedtest.net style backend: JSON server listing plus HTTP transfers.
///
/// The listing carries each server's upload URL; sessions resolve the
/// requested id against the last listing, refetching once when it is unknown.
pub struct SpeedtestClient {
    client: Client,
    servers_url: String,
    plan: TransferPlan,
    index: RwLock<HashMap<u64, Url>>,
}

impl SpeedtestClient {
    pub fn new(servers_url: &str, timeout: Duration, plan: TransferPlan) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("netlogger/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            servers_url: servers_url.to_string(),
            plan,
            index: RwLock::new(HashMap::new()),
        })
    }

    async fn fetch_listing(&self) -> Result<Vec<Value>> {
        let body: Value = self
            .client
            .get(&self.servers_url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let records = flatten_listing(body);

        let mut index = self.index.write().await;
        for record in &records {
            let url = record
                .get("url")
                .and_then(Value::as_str)
                .and_then(|u| Url::parse(u).ok());
            if let (Some(endpoint), Some(url)) = (Endpoint::from_record(record), url) {
                index.insert(endpoint.id, url);
            }
        }
        debug!(servers = records.len(), "fetched server listing");
        Ok(records)
    }

    async fn resolve(&self, id: u64) -> Result<Url> {
        if let Some(url) = self.index.read().await.get(&id) {
            return Ok(url.clone());
        }
        self.fetch_listing().await?;
        self.index
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(NetLoggerError::ServerNotFound(id))
    }
}

/// The listing may be a flat array or records grouped in nested arrays/objects.
fn flatten_listing(body: Value) -> Vec<Value> {
    match body {
        Value::Array(items) => items.into_iter().flat_map(flatten_group).collect(),
        Value::Object(groups) => groups.into_iter().flat_map(|(_, v)| flatten_group(v)).collect(),
        _ => Vec::new(),
    }
}

fn flatten_group(value: Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items,
        record @ Value::Object(_) => vec![record],
        _ => Vec::new(),
    }
}

#[async_trait]
impl ServerDirectory for SpeedtestClient {
    async fn list_servers(&self) -> Result<Vec<Value>> {
        self.fetch_listing().await
    }
}

#[async_trait]
impl SessionFactory for SpeedtestClient {
    async fn open(&self, endpoint: &Endpoint) -> Result<Box<dyn MeasurementSession>> {
        let upload_url = self.resolve(endpoint.id).await?;
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            server_id: endpoint.id,
            upload_url,
            plan: self.plan.clone(),
        }))
    }
}

struct HttpSession {
    client: Client,
    server_id: u64,
    upload_url: Url,
    plan: TransferPlan,
}

impl HttpSession {
    /// Sibling resource of the upload script (`.../upload.php` -> `.../name`).
    fn resource(&self, name: &str) -> Result<Url> {
        self.upload_url
            .join(name)
            .map_err(|e| NetLoggerError::Custom(format!("bad server url: {}", e)))
    }
}

#[async_trait]
impl MeasurementSession for HttpSession {
    async fn best_server(&mut self) -> Result<ServerReport> {
        let url = self.resource("latency.txt")?;
        let mut samples = Vec::with_capacity(LATENCY_SAMPLES);

        for _ in 0..LATENCY_SAMPLES {
            let start = Instant::now();
            let ok = match self.client.get(url.clone()).send().await {
                Ok(resp) if resp.status().is_success() => resp.bytes().await.is_ok(),
                _ => false,
            };
            if ok {
                samples.push(start.elapsed().as_secs_f64() * 1000.0);
            }
        }

        if samples.is_empty() {
            return Err(NetLoggerError::Measurement(format!(
                "server {} did not answer latency probes",
                self.server_id
            )));
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        Ok(ServerReport {
            id: self.server_id,
            latency_ms: Some(round2(mean)),
        })
    }

    async fn download(&mut self, concurrency: usize) -> Result<f64> {
        let mut urls = Vec::new();
        for size in &self.plan.download_sizes {
            let url = self.resource(&format!("random{}x{}.jpg", size, size))?;
            urls.extend(std::iter::repeat(url).take(self.plan.download_repeat));
        }

        let started = Instant::now();
        let received = stream::iter(urls)
            .map(|url| {
                let client = self.client.clone();
                async move {
                    let resp = client.get(url).send().await?.error_for_status()?;
                    Ok::<u64, NetLoggerError>(resp.bytes().await?.len() as u64)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        bits_per_second(received, started.elapsed())
    }

    async fn upload(&mut self, concurrency: usize) -> Result<f64> {
        let sizes: Vec<usize> = self
            .plan
            .upload_sizes
            .iter()
            .flat_map(|&s| std::iter::repeat(s).take(self.plan.upload_repeat))
            .collect();

        let started = Instant::now();
        let sent = stream::iter(sizes)
            .map(|size| {
                let client = self.client.clone();
                let url = self.upload_url.clone();
                async move {
                    client
                        .post(url)
                        .header("Content-Type", "application/x-www-form-urlencoded")
                        .body(upload_payload(size))
                        .send()
                        .await?
                        .error_for_status()?;
                    Ok::<u64, NetLoggerError>(size as u64)
                }
            })
            .buffer_unordered(concurrency.max(1))
            .try_fold(0u64, |total, n| async move { Ok(total + n) })
            .await?;

        bits_per_second(sent, started.elapsed())
    }
}

fn upload_payload(size: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"content1=";
    const CHARS: &[u8] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";
    let mut body = Vec::with_capacity(size.max(PREFIX.len()));
    body.extend_from_slice(PREFIX);
    while body.len() < size {
        body.push(CHARS[body.len() % CHARS.len()]);
    }
    body
}

fn bits_per_second(bytes: u64, elapsed: Duration) -> Result<f64> {
    if bytes == 0 {
        return Err(NetLoggerError::Measurement("no data transferred".to_string()));
    }
    let secs = elapsed.as_secs_f64().max(1e-6);
    Ok(bytes as f64 * 8.0 / secs)
}
