use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{LfqError, Result};

/// Default seed for hash repartitioning and join/aggregate hash tables.
pub const DEFAULT_HASH_SEED: u64 = 0x5eed_1f9a_7c3b_44d1;

/// Engine-wide execution settings shared by planner and operators.
///
/// Every field has a default, so partial JSON documents are accepted by
/// [`EngineConfig::from_json_file`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Preferred rows per output batch for operators that re-chunk.
    pub batch_size_rows: usize,
    /// Bytes blocking operators may hold before spilling or failing.
    pub mem_budget_bytes: usize,
    /// Directory for external sort runs.
    pub spill_dir: String,
    /// Partition count used when the plan does not request one explicitly.
    pub target_partitions: usize,
    /// Seed mixed into every row hash.
    pub hash_seed: u64,
    /// Batches buffered per repartition output before producers yield.
    pub channel_capacity: usize,
    /// Upper bound on optimizer passes when no fixpoint is reached.
    pub optimizer_max_passes: usize,
    /// Tokio worker threads; `None` uses the runtime default.
    pub worker_threads: Option<usize>,
    /// Run the logical optimizer before physical planning.
    pub enable_optimizer: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            mem_budget_bytes: 512 * 1024 * 1024,
            spill_dir: std::env::temp_dir()
                .join("lfq_spill")
                .to_string_lossy()
                .into_owned(),
            target_partitions: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            hash_seed: DEFAULT_HASH_SEED,
            channel_capacity: 8,
            optimizer_max_passes: 3,
            worker_threads: None,
            enable_optimizer: true,
        }
    }
}

impl EngineConfig {
    /// Load a config from a JSON document; missing fields take defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let cfg: EngineConfig = serde_json::from_str(&raw).map_err(|e| {
            LfqError::InvalidConfig(format!("failed to parse '{}': {e}", path.display()))
        })?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply `LFQ_*` environment overrides on top of `self`.
    ///
    /// Recognized: `LFQ_TARGET_PARTITIONS`, `LFQ_BATCH_SIZE_ROWS`,
    /// `LFQ_MEM_BUDGET_BYTES`, `LFQ_SPILL_DIR`, `LFQ_HASH_SEED`.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Some(v) = env_usize("LFQ_TARGET_PARTITIONS")? {
            self.target_partitions = v;
        }
        if let Some(v) = env_usize("LFQ_BATCH_SIZE_ROWS")? {
            self.batch_size_rows = v;
        }
        if let Some(v) = env_usize("LFQ_MEM_BUDGET_BYTES")? {
            self.mem_budget_bytes = v;
        }
        if let Ok(dir) = std::env::var("LFQ_SPILL_DIR") {
            self.spill_dir = dir;
        }
        if let Ok(raw) = std::env::var("LFQ_HASH_SEED") {
            self.hash_seed = raw.trim().parse().map_err(|_| {
                LfqError::InvalidConfig(format!("LFQ_HASH_SEED must be a u64, got '{raw}'"))
            })?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings no operator can run with.
    pub fn validate(&self) -> Result<()> {
        if self.target_partitions == 0 {
            return Err(LfqError::InvalidConfig(
                "target_partitions must be > 0".to_string(),
            ));
        }
        if self.batch_size_rows == 0 {
            return Err(LfqError::InvalidConfig(
                "batch_size_rows must be > 0".to_string(),
            ));
        }
        if self.channel_capacity == 0 {
            return Err(LfqError::InvalidConfig(
                "channel_capacity must be > 0".to_string(),
            ));
        }
        if self.worker_threads == Some(0) {
            return Err(LfqError::InvalidConfig(
                "worker_threads must be > 0 when set".to_string(),
            ));
        }
        Ok(())
    }
}

fn env_usize(key: &str) -> Result<Option<usize>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|_| LfqError::InvalidConfig(format!("{key} must be an integer, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_path(name: &str) -> std::path::PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before epoch")
            .as_nanos();
        std::env::temp_dir().join(format!("lfq_{name}_{nanos}.json"))
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let path = unique_path("cfg");
        std::fs::write(&path, r#"{"target_partitions": 3, "batch_size_rows": 16}"#)
            .expect("write config");
        let cfg = EngineConfig::from_json_file(&path).expect("load");
        assert_eq!(cfg.target_partitions, 3);
        assert_eq!(cfg.batch_size_rows, 16);
        assert_eq!(cfg.hash_seed, DEFAULT_HASH_SEED);
        assert_eq!(cfg.optimizer_max_passes, 3);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn zero_partitions_is_rejected() {
        let cfg = EngineConfig {
            target_partitions: 0,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(LfqError::InvalidConfig(_))));
    }
}
