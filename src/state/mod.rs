//! Cluster state persistence
//!
//! The CLI keeps the coordination store and the run records in one JSON file
//! so consecutive invocations (`run`, then `monitor status`) see the same
//! cluster.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::models::{TestRun, UnitOutcome, UnitResult};
use crate::runs::MemoryRunStore;
use crate::store::{MemoryStore, StoreSnapshot};

/// Everything a CLI process needs to pick up where the last one stopped
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ClusterState {
    pub saved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub store: StoreSnapshot,
    #[serde(default)]
    pub runs: Vec<TestRun>,
}

impl ClusterState {
    pub async fn capture(store: &MemoryStore, runs: &MemoryRunStore) -> Result<Self> {
        Ok(Self {
            saved_at: Some(Utc::now()),
            store: store.snapshot().context("Failed to snapshot coordination store")?,
            runs: runs.snapshot().await,
        })
    }

    /// Load into live stores; TTLs keep running for the time since the save
    pub async fn install(self, store: &MemoryStore, runs: &MemoryRunStore) -> Result<()> {
        let elapsed = self
            .saved_at
            .and_then(|saved_at| (Utc::now() - saved_at).to_std().ok())
            .unwrap_or_default();
        store
            .restore(self.store, elapsed)
            .context("Failed to restore coordination store")?;
        runs.restore(self.runs).await;
        Ok(())
    }
}

/// JSON file backing a [`ClusterState`]
pub struct StateStorage {
    path: PathBuf,
}

impl StateStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Storage in the platform data directory
    pub fn default_location() -> Result<Self> {
        let base_dir = dirs::data_dir()
            .context("Could not determine data directory")?
            .join("suite-conductor");
        Ok(Self::new(base_dir.join("state.json")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load state; a missing file is an empty cluster
    pub fn load(&self) -> Result<ClusterState> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "no state file, starting empty");
            return Ok(ClusterState::default());
        }
        let file = File::open(&self.path)
            .with_context(|| format!("Failed to open state file: {}", self.path.display()))?;
        let reader = BufReader::new(file);
        serde_json::from_reader(reader)
            .with_context(|| format!("Failed to parse state file: {}", self.path.display()))
    }

    pub fn save(&self, state: &ClusterState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).context("Failed to create state directory")?;
            }
        }
        let file = File::create(&self.path).context("Failed to create state file")?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, state).context("Failed to write state")?;

        info!(
            path = %self.path.display(),
            runs = state.runs.len(),
            keys = state.store.entries.len(),
            "state saved"
        );
        Ok(())
    }
}

#[derive(Serialize)]
struct ResultRow<'a> {
    run_id: &'a str,
    unit_id: &'a str,
    test_id: &'a str,
    status: &'static str,
    kind: String,
    attempts: u32,
    duration_ms: u64,
    detail: String,
}

/// Write one CSV row per unit result of a run
pub fn export_results_csv<W: Write>(run_id: &str, results: &[UnitResult], out: W) -> Result<()> {
    let mut writer = csv::Writer::from_writer(out);
    for result in results {
        let (status, kind, detail) = match &result.outcome {
            UnitOutcome::Success { output } => ("success", String::new(), output.to_string()),
            UnitOutcome::Failure { error, kind } => ("failure", kind.to_string(), error.clone()),
        };
        writer.serialize(ResultRow {
            run_id,
            unit_id: &result.unit_id,
            test_id: &result.test_id,
            status,
            kind,
            attempts: result.attempts,
            duration_ms: result.duration_ms,
            detail,
        })?;
    }
    writer.flush()?;
    Ok(())
}
