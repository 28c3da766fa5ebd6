use crate::error::{NetLoggerError, Result};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Smallest id accepted from the endpoint cache. Anything below is treated as junk.
pub const MIN_ENDPOINT_ID: u64 = 1000;

/// Country substrings that mark an endpoint as being in the measured region.
pub const REGION_MARKERS: &[&str] = &["united arab", "uae", "u.a.e"];

/// ISP being benchmarked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Etisalat,
    Du,
}

impl Provider {
    /// Measurement order within a cycle. Also the classification precedence.
    pub const ALL: [Provider; 2] = [Provider::Etisalat, Provider::Du];

    pub fn key(self) -> &'static str {
        match self {
            Provider::Etisalat => "etisalat",
            Provider::Du => "du",
        }
    }

    /// Label written to recorded rows ("Etisalat", "Du").
    pub fn label(self) -> &'static str {
        match self {
            Provider::Etisalat => "Etisalat",
            Provider::Du => "Du",
        }
    }

    /// Lowercase substrings matched against sponsor and name.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Provider::Etisalat => &["e&", "etisalat", "emirates tele"],
            Provider::Du => &["du", "eitc"],
        }
    }

    /// Known-good server used when discovery finds nothing for this provider.
    pub fn fallback(self) -> Endpoint {
        match self {
            Provider::Etisalat => Endpoint::new(34239, "e& UAE", "Alain", "UAE"),
            Provider::Du => Endpoint::new(1692, "du", "Abu Dhabi", "UAE"),
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl FromStr for Provider {
    type Err = NetLoggerError;

    fn from_str(s: &str) -> Result<Self> {
        Provider::ALL
            .into_iter()
            .find(|p| p.key().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| NetLoggerError::UnknownProvider(s.to_string()))
    }
}

/// A measurement server descriptor. Identity is `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub id: u64,
    pub sponsor: String,
    pub name: String,
    pub country: String,
}

impl Endpoint {
    pub fn new(id: u64, sponsor: &str, name: &str, country: &str) -> Self {
        Self {
            id,
            sponsor: sponsor.to_string(),
            name: name.to_string(),
            country: country.to_string(),
        }
    }

    /// Parses one loosely-typed record. The id may be a JSON number or a numeric
    /// string; anything else rejects the record. Missing text fields become empty.
    pub fn from_record(record: &Value) -> Option<Self> {
        let id = match record.get("id")? {
            Value::Number(n) => n.as_u64()?,
            Value::String(s) => s.trim().parse::<u64>().ok()?,
            _ => return None,
        };
        let text = |key: &str| {
            record
                .get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Some(Self {
            id,
            sponsor: text("sponsor"),
            name: text("name"),
            country: text("country"),
        })
    }

    pub fn is_valid(&self) -> bool {
        self.id >= MIN_ENDPOINT_ID
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}) [id={}]", self.name, self.sponsor, self.id)
    }
}

/// Per-provider endpoint lists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Pool(BTreeMap<Provider, Vec<Endpoint>>);

impl Pool {
    /// Every provider present with an empty list. Saved to force rediscovery.
    pub fn empty() -> Self {
        Self(Provider::ALL.into_iter().map(|p| (p, Vec::new())).collect())
    }

    pub fn get(&self, provider: Provider) -> &[Endpoint] {
        self.0.get(&provider).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn set(&mut self, provider: Provider, endpoints: Vec<Endpoint>) {
        self.0.insert(provider, endpoints);
    }

    /// True when every provider has at least one endpoint.
    pub fn is_complete(&self) -> bool {
        Provider::ALL.into_iter().all(|p| !self.get(p).is_empty())
    }
}

impl Default for Pool {
    fn default() -> Self {
        Self::empty()
    }
}

/// What a session reports about the server it is pinned to.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerReport {
    pub id: u64,
    pub latency_ms: Option<f64>,
}

/// One successful speed test.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MeasurementResult {
    pub test_id: String,
    #[serde(rename = "target_isp", serialize_with = "serialize_label")]
    pub provider: Provider,
    pub speedtest_server: String,
    pub speedtest_sponsor: String,
    pub speedtest_country: String,
    pub server_id: u64,
    pub latency_ms: Option<f64>,
    pub download_mbps: f64,
    pub upload_mbps: f64,
    pub duration_s: f64,
    #[serde(rename = "threads_used")]
    pub concurrency_used: usize,
}

fn serialize_label<S: Serializer>(provider: &Provider, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_str(provider.label())
}

/// Public address and location as reported by the geo lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GeoInfo {
    pub public_ip: Option<String>,
    pub city: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub lat: Option<String>,
    pub lon: Option<String>,
    pub isp: Option<String>,
}

/// Metrics gathered once per cycle and shared by every row of that cycle.
#[derive(Debug, Clone, Default)]
pub struct AmbientMetrics {
    pub ts_iso: String,
    pub local_ip: Option<String>,
    pub geo: GeoInfo,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub http_load_s: Option<f64>,
}

/// A recorded line: device context, ambient metrics and one measurement.
#[derive(Debug, Clone, Serialize)]
pub struct LogRow {
    pub ts_iso: String,
    pub device: String,
    pub hostname: String,
    pub local_ip: Option<String>,
    #[serde(flatten)]
    pub geo: GeoInfo,
    #[serde(flatten)]
    pub result: MeasurementResult,
    pub rtt_ms: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub http_load_s: Option<f64>,
}

/// Column order of the CSV recorder.
pub const LOG_COLUMNS: &[&str] = &[
    "ts_iso", "device", "hostname", "local_ip", "public_ip",
    "city", "region", "country", "lat", "lon", "isp",
    "test_id", "target_isp", "speedtest_server", "speedtest_sponsor",
    "speedtest_country", "server_id", "latency_ms",
    "download_mbps", "upload_mbps", "duration_s", "threads_used",
    "rtt_ms", "jitter_ms", "http_load_s",
];

impl LogRow {
    pub fn new(device: &str, hostname: &str, ambient: &AmbientMetrics, result: MeasurementResult) -> Self {
        Self {
            ts_iso: ambient.ts_iso.clone(),
            device: device.to_string(),
            hostname: hostname.to_string(),
            local_ip: ambient.local_ip.clone(),
            geo: ambient.geo.clone(),
            result,
            rtt_ms: ambient.rtt_ms,
            jitter_ms: ambient.jitter_ms,
            http_load_s: ambient.http_load_s,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_endpoint_from_record() {
        let e = Endpoint::from_record(&json!({"id": " 2001 ", "sponsor": "du", "name": "Dubai"}))
            .unwrap();
        assert_eq!(e.id, 2001);
        assert_eq!(e.country, "");

        assert_eq!(Endpoint::from_record(&json!({"id": 1692})).unwrap().id, 1692);
        assert!(Endpoint::from_record(&json!({"id": "abc"})).is_none());
        assert!(Endpoint::from_record(&json!({"id": -5})).is_none());
        assert!(Endpoint::from_record(&json!({"id": 12.5})).is_none());
        assert!(Endpoint::from_record(&json!({"sponsor": "du"})).is_none());
    }

    #[test]
    fn test_pool_completeness() {
        let mut pool = Pool::empty();
        assert!(!pool.is_complete());
        pool.set(Provider::Etisalat, vec![Provider::Etisalat.fallback()]);
        assert!(!pool.is_complete());
        pool.set(Provider::Du, vec![Provider::Du.fallback()]);
        assert!(pool.is_complete());

        let text = serde_json::to_string(&Pool::empty()).unwrap();
        assert_eq!(text, r#"{"etisalat":[],"du":[]}"#);
    }

    #[test]
    fn test_provider_parse() {
        assert_eq!("DU".parse::<Provider>().unwrap(), Provider::Du);
        assert_eq!("etisalat".parse::<Provider>().unwrap(), Provider::Etisalat);
        assert!("virgin".parse::<Provider>().is_err());
    }

    #[test]
    fn test_row_serializes_every_column() {
        let result = MeasurementResult {
            test_id: "t".into(),
            provider: Provider::Du,
            speedtest_server: "Dubai".into(),
            speedtest_sponsor: "du".into(),
            speedtest_country: "United Arab Emirates".into(),
            server_id: 2002,
            latency_ms: Some(4.5),
            download_mbps: 100.0,
            upload_mbps: 20.0,
            duration_s: 12.3,
            concurrency_used: 4,
        };
        let row = LogRow::new("dev", "host", &AmbientMetrics::default(), result);
        let value = serde_json::to_value(&row).unwrap();
        let map = value.as_object().unwrap();
        for col in LOG_COLUMNS {
            assert!(map.contains_key(*col), "missing column {}", col);
        }
        assert_eq!(map.len(), LOG_COLUMNS.len());
        assert_eq!(map["target_isp"], "Du");
        assert_eq!(map["threads_used"], 4);
    }
}
