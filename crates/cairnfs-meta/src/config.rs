//! Configuration for the metadata node: safe mode thresholds, edit log
//! replay pacing and node identity. Loadable from TOML or JSON.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{HaRole, MetaError, NodeId};

/// Safe mode thresholds.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafeModeConfig {
    /// Fraction of blocks that must be safe before safe mode can end (default: 0.999).
    /// Values <= 0 leave safe mode without an extension; values > 1 never leave.
    pub threshold_pct: f64,
    /// Hold time after the threshold is reached, in milliseconds (default: 30000).
    pub extension_ms: u64,
    /// Verified replicas a block needs to count as safe (default: 1).
    pub min_replication: usize,
}

impl Default for SafeModeConfig {
    fn default() -> Self {
        Self {
            threshold_pct: 0.999,
            extension_ms: 30_000,
            min_replication: 1,
        }
    }
}

impl SafeModeConfig {
    /// Checks that the values are usable.
    pub fn validate(&self) -> Result<(), MetaError> {
        if !self.threshold_pct.is_finite() {
            return Err(MetaError::Config(format!(
                "threshold_pct must be finite, got {}",
                self.threshold_pct
            )));
        }
        if self.min_replication == 0 {
            return Err(MetaError::Config(
                "min_replication must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Edit log replay pacing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    /// Sleep between polls of the shared edit log, in milliseconds (default: 60000).
    pub poll_interval_ms: u64,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 60_000,
        }
    }
}

/// Top-level configuration of a metadata node.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NamenodeConfig {
    /// This node's identifier.
    pub node_id: NodeId,
    /// Role the node starts in.
    pub initial_role: HaRole,
    /// Directory holding the shared edit log segments.
    pub shared_edits_dir: PathBuf,
    /// Namespace image loaded at startup (None = empty namespace).
    pub image_path: Option<PathBuf>,
    /// How often the binary logs the safe mode status, in milliseconds.
    pub status_interval_ms: u64,
    /// Safe mode thresholds.
    pub safe_mode: SafeModeConfig,
    /// Replay pacing.
    pub replay: ReplayConfig,
}

impl Default for NamenodeConfig {
    fn default() -> Self {
        Self {
            node_id: NodeId::new(1),
            initial_role: HaRole::Standby,
            shared_edits_dir: PathBuf::from("/var/lib/cairnfs/shared-edits"),
            image_path: None,
            status_interval_ms: 10_000,
            safe_mode: SafeModeConfig::default(),
            replay: ReplayConfig::default(),
        }
    }
}

impl NamenodeConfig {
    /// Loads the configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: NamenodeConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents)?,
            "json" => serde_json::from_str(&contents)?,
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        };
        config.safe_mode.validate()?;
        Ok(config)
    }
}
