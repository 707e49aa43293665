//! JSON lines hit store
//!
//! Appends every reportable hit as one JSON object per line. The store is
//! what the CLI host uses for `save_hit`; other hosts bring their own
//! persistence.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::domain::hit::Hit;

#[derive(Debug)]
pub struct JsonlHitStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonlHitStore {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn append(&self, hit: &Hit) -> Result<()> {
        let mut line = serde_json::to_string(hit).context("Failed to serialize hit")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create directory: {:?}", parent))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .with_context(|| format!("Failed to open hit store {:?}", self.path))?;
        file.write_all(line.as_bytes())
            .await
            .context("Failed to append hit")?;
        file.flush().await.context("Failed to flush hit store")?;
        Ok(())
    }

    /// Every stored hit; a missing file means no hits yet
    pub async fn read_all(&self) -> Result<Vec<Hit>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("Failed to read hit store {:?}", self.path))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).context("Corrupted hit line"))
            .collect()
    }
}
