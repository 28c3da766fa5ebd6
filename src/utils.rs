use reqwest::Client;
use std::time::Instant;

/// Rounds to two decimals, the precision every recorded metric uses.
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Mean and population standard deviation, both rounded. `None` for no samples.
pub fn mean_and_pstdev(samples: &[f64]) -> Option<(f64, f64)> {
    if samples.is_empty() {
        return None;
    }
    let n = samples.len() as f64;
    let mean = samples.iter().sum::<f64>() / n;
    let variance = samples.iter().map(|s| (s - mean).powi(2)).sum::<f64>() / n;
    Some((round2(mean), round2(variance.sqrt())))
}

/// Quotes a CSV field when it contains a separator, quote or line break.
pub fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}

/// Time until a complete successful GET of `url`, in seconds.
/// Connection errors and non-2xx statuses yield `None`.
pub async fn timed_get(client: &Client, url: &str) -> Option<f64> {
    let start = Instant::now();

    let resp = client.get(url).send().await.ok()?;
    if !resp.status().is_success() {
        return None;
    }
    // Load time includes the body, not just first byte
    resp.bytes().await.ok()?;

    Some(round2(start.elapsed().as_secs_f64()))
}
