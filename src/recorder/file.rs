//! JSONL result log for offline runs.

use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{ResultLog, ResultRow};
use crate::errors::RecordError;

/// Appends one JSON object per line. Location is `<path>#<line>`.
pub struct FileResultLog {
    path: PathBuf,
    /// Line count, loaded from disk on first append.
    lines: Mutex<Option<u64>>,
}

impl FileResultLog {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            lines: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn existing_lines(&self) -> anyhow::Result<u64> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().count() as u64),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to read result log: {}", self.path.display())),
        }
    }
}

#[async_trait]
impl ResultLog for FileResultLog {
    async fn append(&self, row: &ResultRow) -> Result<String, RecordError> {
        let mut lines = self.lines.lock().await;
        let count = match *lines {
            Some(n) => n,
            None => self.existing_lines().await?,
        };

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let mut line = serde_json::to_string(row).context("Failed to serialize result row")?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open result log: {}", self.path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append result row")?;
        file.flush().await.context("Failed to flush result log")?;

        let line_number = count + 1;
        *lines = Some(line_number);
        Ok(format!("{}#{}", self.path.display(), line_number))
    }

    async fn health_check(&self) -> bool {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                tokio::fs::create_dir_all(parent).await.is_ok()
            }
            _ => true,
        }
    }
}
