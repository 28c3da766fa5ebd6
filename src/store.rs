use crate::error::Result;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use tokio::fs;

/// Outcome of reading a best-effort JSON file.
#[derive(Debug)]
pub enum Loaded<T> {
    Value(T),
    Absent,
    Corrupt(String),
}

pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Loaded<T> {
    if !fs::try_exists(path).await.unwrap_or(false) {
        return Loaded::Absent;
    }
    let content = match fs::read_to_string(path).await {
        Ok(c) => c,
        Err(e) => return Loaded::Corrupt(e.to_string()),
    };
    match serde_json::from_str(&content) {
        Ok(v) => Loaded::Value(v),
        Err(e) => Loaded::Corrupt(e.to_string()),
    }
}

/// Writes to a sibling temp file then renames it over `path`,
/// so readers see either the old or the new document.
pub async fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent).await?;
        }
    }
    let file_name = path.file_name().unwrap_or_default().to_string_lossy();
    let tmp_path = path.with_file_name(format!("{}.tmp", file_name));

    fs::write(&tmp_path, serde_json::to_vec(value)?).await?;
    fs::rename(&tmp_path, path).await?;
    Ok(())
}
