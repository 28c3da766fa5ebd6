use crate::error::Result;
use crate::types::{AmbientMetrics, GeoInfo};
use crate::utils::{self, mean_and_pstdev};
use chrono::{Local, SecondsFormat};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;
use std::sync::OnceLock;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::process::Command;
use tracing::{debug, warn};

const GEO_TTL: Duration = Duration::from_secs(1800);
const GEO_TIMEOUT: Duration = Duration::from_secs(6);
const HTTP_LOAD_TIMEOUT: Duration = Duration::from_secs(10);

static PING_TIME: OnceLock<Regex> = OnceLock::new();

#[derive(Debug, Clone)]
pub struct AmbientSettings {
    pub geo_url: String,
    pub http_probe_url: String,
    pub ping_host: String,
    pub ping_count: u32,
}

/// Collects the per-cycle context metrics.
///
/// Owns the geo lookup cache, so a single instance should live for the whole
/// run. Every probe degrades to `None` on failure.
pub struct AmbientProbe {
    client: Client,
    settings: AmbientSettings,
    geo_cache: Option<(Instant, GeoInfo)>,
}

#[derive(Debug, Deserialize)]
struct IpInfo {
    ip: Option<String>,
    city: Option<String>,
    region: Option<String>,
    country: Option<String>,
    loc: Option<String>,
    org: Option<String>,
}

impl From<IpInfo> for GeoInfo {
    fn from(info: IpInfo) -> Self {
        let (lat, lon) = match info.loc.as_deref().and_then(|l| l.split_once(',')) {
            Some((lat, lon)) => (Some(lat.trim().to_string()), Some(lon.trim().to_string())),
            None => (info.loc.clone(), None),
        };
        GeoInfo {
            public_ip: info.ip,
            city: info.city,
            region: info.region,
            country: info.country,
            lat,
            lon,
            isp: info.org,
        }
    }
}

impl AmbientProbe {
    pub fn new(settings: AmbientSettings) -> Result<Self> {
        let client = Client::builder().timeout(HTTP_LOAD_TIMEOUT).build()?;
        Ok(Self {
            client,
            settings,
            geo_cache: None,
        })
    }

    pub async fn collect(&mut self) -> AmbientMetrics {
        let ts_iso = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let local_ip = local_ip().await;
        let geo = self.geo().await;
        let (rtt_ms, jitter_ms) = match self.ping().await {
            Some((rtt, jitter)) => (Some(rtt), Some(jitter)),
            None => (None, None),
        };
        let http_load_s = utils::timed_get(&self.client, &self.settings.http_probe_url).await;

        AmbientMetrics {
            ts_iso,
            local_ip,
            geo,
            rtt_ms,
            jitter_ms,
            http_load_s,
        }
    }

    /// Geo lookup, served from memory for 30 minutes after a successful fetch.
    pub async fn geo(&mut self) -> GeoInfo {
        if let Some((fetched_at, info)) = &self.geo_cache {
            if fetched_at.elapsed() < GEO_TTL {
                return info.clone();
            }
        }
        match self.fetch_geo().await {
            Ok(info) => {
                self.geo_cache = Some((Instant::now(), info.clone()));
                info
            }
            Err(e) => {
                debug!(error = %e, "geo lookup failed");
                GeoInfo::default()
            }
        }
    }

    async fn fetch_geo(&self) -> Result<GeoInfo> {
        let info: IpInfo = self
            .client
            .get(&self.settings.geo_url)
            .timeout(GEO_TIMEOUT)
            .send()
            .await?
            .json()
            .await?;
        Ok(info.into())
    }

    async fn ping(&self) -> Option<(f64, f64)> {
        let count = self.settings.ping_count.to_string();
        let output = Command::new("ping")
            .args(["-n", "-c", count.as_str(), "-W", "1"])
            .arg(&self.settings.ping_host)
            .output()
            .await;
        match output {
            Ok(out) => parse_ping(&String::from_utf8_lossy(&out.stdout)),
            Err(e) => {
                debug!(error = %e, "ping could not be run");
                None
            }
        }
    }
}

/// Mean round-trip and jitter (population std-dev) from `ping` output.
pub fn parse_ping(stdout: &str) -> Option<(f64, f64)> {
    let re = match ping_time_pattern() {
        Ok(re) => re,
        Err(e) => {
            warn!(error = %e, "ping output pattern rejected");
            return None;
        }
    };
    let times: Vec<f64> = stdout
        .lines()
        .filter_map(|line| re.captures(line))
        .filter_map(|caps| caps[1].parse().ok())
        .collect();
    mean_and_pstdev(&times)
}

fn ping_time_pattern() -> Result<&'static Regex> {
    if let Some(re) = PING_TIME.get() {
        return Ok(re);
    }
    let re = Regex::new(r"time=([\d.]+)")?;
    Ok(PING_TIME.get_or_init(|| re))
}

/// Address of the interface used for outbound traffic. No packet is sent.
pub async fn local_ip() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").await.ok()?;
    socket.connect("8.8.8.8:80").await.ok()?;
    Some(socket.local_addr().ok()?.ip().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const PING_OUTPUT: &str = "\
PING 8.8.8.8 (8.8.8.8) 56(84) bytes of data.
64 bytes from 8.8.8.8: icmp_seq=1 ttl=117 time=10.0 ms
64 bytes from 8.8.8.8: icmp_seq=2 ttl=117 time=12.0 ms
64 bytes from 8.8.8.8: icmp_seq=3 ttl=117 time=14.0 ms

--- 8.8.8.8 ping statistics ---
3 packets transmitted, 3 received, 0% packet loss, time 2003ms
rtt min/avg/max/mdev = 10.000/12.000/14.000/1.633 ms
";

    #[test]
    fn test_parse_ping() {
        assert_eq!(parse_ping(PING_OUTPUT), Some((12.0, 1.63)));
        assert_eq!(parse_ping("ping: unknown host"), None);
    }

    #[test]
    fn test_ping_pattern_is_compiled_once() {
        let first = ping_time_pattern().unwrap();
        let second = ping_time_pattern().unwrap();
        assert!(std::ptr::eq(first, second));
        // Parsing again reuses the stored pattern
        assert_eq!(parse_ping("64 bytes: time=7.5 ms"), Some((7.5, 0.0)));
    }

    #[test]
    fn test_geo_from_ipinfo() {
        let info: IpInfo = serde_json::from_value(json!({
            "ip": "94.200.1.1", "city": "Dubai", "region": "Dubai",
            "country": "AE", "loc": "25.0657,55.1713", "org": "AS5384 Emirates Telecommunications"
        }))
        .unwrap();
        let geo = GeoInfo::from(info);
        assert_eq!(geo.lat.as_deref(), Some("25.0657"));
        assert_eq!(geo.lon.as_deref(), Some("55.1713"));
        assert_eq!(geo.isp.as_deref(), Some("AS5384 Emirates Telecommunications"));
    }

    #[tokio::test]
    async fn test_geo_is_cached() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ip": "1.2.3.4", "country": "AE"})))
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut probe = AmbientProbe::new(AmbientSettings {
            geo_url: format!("{}/json", mock_server.uri()),
            http_probe_url: mock_server.uri(),
            ping_host: "127.0.0.1".to_string(),
            ping_count: 1,
        })
        .unwrap();

        let first = probe.geo().await;
        let second = probe.geo().await;
        assert_eq!(first.public_ip.as_deref(), Some("1.2.3.4"));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_geo_failure_is_not_cached() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/json"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .expect(2)
            .mount(&mock_server)
            .await;

        let mut probe = AmbientProbe::new(AmbientSettings {
            geo_url: format!("{}/json", mock_server.uri()),
            http_probe_url: mock_server.uri(),
            ping_host: "127.0.0.1".to_string(),
            ping_count: 1,
        })
        .unwrap();

        assert_eq!(probe.geo().await, GeoInfo::default());
        assert_eq!(probe.geo().await, GeoInfo::default());
    }
}
