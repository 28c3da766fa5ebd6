use crate::error::Result;
use crate::traits::Recorder;
use crate::types::{LogRow, Provider, LOG_COLUMNS};
use crate::utils::csv_field;
use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Per-day CSV of results plus a human readable text log.
///
/// Files: `logs_YYYY-MM-DD.csv` and `logs_YYYY-MM-DD.txt` in `dir`.
pub struct DailyLog {
    dir: PathBuf,
}

impl DailyLog {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn paths_on(&self, date: NaiveDate) -> (PathBuf, PathBuf) {
        let day = date.format("%Y-%m-%d");
        (
            self.dir.join(format!("logs_{}.csv", day)),
            self.dir.join(format!("logs_{}.txt", day)),
        )
    }

    fn today(&self) -> (PathBuf, PathBuf) {
        self.paths_on(Local::now().date_naive())
    }

    pub async fn write_row(&self, csv_path: &Path, row: &LogRow) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;

        let needs_header = match fs::metadata(csv_path).await {
            Ok(meta) => meta.len() == 0,
            Err(_) => true,
        };

        let mut out = String::new();
        if needs_header {
            out.push_str(&LOG_COLUMNS.join(","));
            out.push('\n');
        }
        out.push_str(&csv_line(row)?);
        out.push('\n');

        append(csv_path, &out).await
    }

    pub async fn write_line(&self, txt_path: &Path, message: &str) -> Result<()> {
        fs::create_dir_all(&self.dir).await?;
        append(txt_path, &format!("{}\n", message)).await
    }
}

#[async_trait]
impl Recorder for DailyLog {
    async fn record(&self, row: &LogRow) -> Result<()> {
        let (csv_path, txt_path) = self.today();
        self.write_row(&csv_path, row).await?;

        let r = &row.result;
        let message = format!(
            "[{}] OK {} down {} up {} Mbps (dur {} s)",
            row.ts_iso,
            r.provider.key().to_uppercase(),
            r.download_mbps,
            r.upload_mbps,
            r.duration_s
        );
        self.write_line(&txt_path, &message).await
    }

    async fn record_failure(&self, ts_iso: &str, provider: Provider) -> Result<()> {
        let (_, txt_path) = self.today();
        let message = format!("[{}] {} test failed", ts_iso, provider.key().to_uppercase());
        self.write_line(&txt_path, &message).await
    }
}

fn csv_line(row: &LogRow) -> Result<String> {
    let value = serde_json::to_value(row)?;
    let fields: Vec<String> = LOG_COLUMNS
        .iter()
        .map(|col| match value.get(*col) {
            None | Some(Value::Null) => String::new(),
            Some(Value::String(s)) => csv_field(s),
            Some(other) => csv_field(&other.to_string()),
        })
        .collect();
    Ok(fields.join(","))
}

async fn append(path: &Path, content: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}
