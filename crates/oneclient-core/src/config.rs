use crate::error::{ClientError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

/// Whether prefetch block synchronization awaits the provider's location
/// update or is fire-and-forget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrefetchMode {
    Sync,
    #[default]
    Async,
}

/// Global direct/proxy IO policy for the helper cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IoMode {
    #[default]
    Auto,
    ForceProxy,
    ForceDirect,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Identity of the mount root, assigned by the provider.
    pub root_uuid: String,
    /// Absolute path under which the tree is exposed to the kernel.
    pub mount_point: PathBuf,

    /// Soft target for the total number of cached metadata entries.
    pub metadata_cache_size: usize,
    /// Idle seconds after which an unopened directory subtree may be
    /// dropped from the cache. Zero disables pruning entirely.
    pub directory_cache_drop_after_secs: u64,

    pub provider_timeout_secs: u64,
    pub storage_timeout_secs: u64,

    pub prefetch_mode: PrefetchMode,
    /// Minimum width in bytes of a demand block synchronization request.
    pub min_prefetch_block_size: u64,
    /// Fraction of the file that, once mostly replicated, triggers a
    /// whole-file prefetch. Zero disables the shortcut.
    pub linear_read_prefetch_threshold: f64,
    /// Cluster prefetch window in bytes; negative means the whole file,
    /// zero disables cluster prefetch.
    pub cluster_window: i64,
    pub cluster_block_threshold: u32,
    pub cluster_window_grow_factor: f64,
    /// Draw the cluster block threshold uniformly from
    /// `[2, cluster_block_threshold]` on each evaluation.
    pub cluster_prefetch_threshold_random: bool,
    /// Minimum reads on a handle between prefetch planner evaluations.
    pub prefetch_evaluation_frequency: u32,
    /// Minimum seconds on a handle between prefetch planner evaluations.
    pub prefetch_evaluation_delay_secs: u64,

    pub show_only_full_replicas: bool,
    pub show_hard_link_count: bool,
    /// Resolve space-relative symlinks to space ids instead of names.
    pub show_space_ids: bool,

    pub io_trace_logger_enabled: bool,
    /// Directory receiving the I/O trace CSV files.
    pub log_dir_path: PathBuf,

    /// Extended attribute applied once per handle on file creation.
    pub tag_on_create: Option<(String, String)>,
    /// Extended attribute applied once per handle on first write.
    pub tag_on_modify: Option<(String, String)>,

    /// Per-storage parameter overrides merged over provider-supplied
    /// helper parameters (notably `mountPoint` and `skipStorageDetection`).
    pub helper_override_params: HashMap<String, HashMap<String, String>>,

    /// Non-zero makes statfs advertise this many bytes instead of
    /// provider-reported sizes.
    pub emulate_available_space: u64,

    pub io_mode: IoMode,
    /// Suppress FileRead event emission.
    pub read_events_disabled: bool,

    pub max_retries: u32,
    /// Per-attempt `(min_ms, max_ms)` retry delay ranges; the index clamps
    /// to the last entry.
    pub retry_delays_ms: Vec<(u64, u64)>,

    /// Directory entries fetched per provider round trip.
    pub readdir_prefetch_size: usize,

    /// Probe re-read attempts while test file content settles.
    pub storage_detection_attempts: u32,
    pub storage_detection_retry_delay_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            root_uuid: String::new(),
            mount_point: PathBuf::from("/mnt/oneclient"),
            metadata_cache_size: 5_000_000,
            directory_cache_drop_after_secs: 300,
            provider_timeout_secs: 120,
            storage_timeout_secs: 120,
            prefetch_mode: PrefetchMode::Async,
            min_prefetch_block_size: 0,
            linear_read_prefetch_threshold: 0.0,
            cluster_window: 0,
            cluster_block_threshold: 5,
            cluster_window_grow_factor: 0.0,
            cluster_prefetch_threshold_random: false,
            prefetch_evaluation_frequency: 50,
            prefetch_evaluation_delay_secs: 1,
            show_only_full_replicas: false,
            show_hard_link_count: false,
            show_space_ids: false,
            io_trace_logger_enabled: false,
            log_dir_path: PathBuf::from("/tmp"),
            tag_on_create: None,
            tag_on_modify: None,
            helper_override_params: HashMap::new(),
            emulate_available_space: 0,
            io_mode: IoMode::Auto,
            read_events_disabled: false,
            max_retries: 6,
            retry_delays_ms: vec![
                (4_000, 6_000),
                (5_000, 8_000),
                (6_000, 10_000),
                (8_000, 15_000),
                (9_000, 20_000),
                (10_000, 30_000),
            ],
            readdir_prefetch_size: 2_500,
            storage_detection_attempts: 5,
            storage_detection_retry_delay_secs: 5,
        }
    }
}

impl ClientConfig {
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }

    pub fn storage_timeout(&self) -> Duration {
        Duration::from_secs(self.storage_timeout_secs)
    }

    pub fn directory_cache_drop_after(&self) -> Option<Duration> {
        if self.directory_cache_drop_after_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.directory_cache_drop_after_secs))
        }
    }

    /// Retry delay range for a given number of remaining retries.
    pub fn retry_delay_range(&self, retries_left: u32) -> (u64, u64) {
        let attempt = self.max_retries.saturating_sub(retries_left) as usize;
        let index = attempt.min(self.retry_delays_ms.len().saturating_sub(1));
        self.retry_delays_ms[index]
    }

    /// Startup validation; failures here are fatal for the mount.
    pub fn validate(&self) -> Result<()> {
        if self.root_uuid.is_empty() {
            return Err(ClientError::InvalidConfiguration {
                msg: "root_uuid must not be empty".to_string(),
            });
        }
        if !self.mount_point.is_absolute() {
            return Err(ClientError::InvalidConfiguration {
                msg: format!(
                    "mount_point must be absolute, got {}",
                    self.mount_point.display()
                ),
            });
        }
        if !(0.0..=1.0).contains(&self.linear_read_prefetch_threshold) {
            return Err(ClientError::InvalidConfiguration {
                msg: format!(
                    "linear_read_prefetch_threshold must be within [0, 1], got {}",
                    self.linear_read_prefetch_threshold
                ),
            });
        }
        if self.cluster_window_grow_factor < 0.0 {
            return Err(ClientError::InvalidConfiguration {
                msg: "cluster_window_grow_factor must not be negative".to_string(),
            });
        }
        if self.retry_delays_ms.is_empty() {
            return Err(ClientError::InvalidConfiguration {
                msg: "retry_delays_ms must not be empty".to_string(),
            });
        }
        for (min, max) in &self.retry_delays_ms {
            if min > max {
                return Err(ClientError::InvalidConfiguration {
                    msg: format!("retry delay range ({min}, {max}) is inverted"),
                });
            }
        }
        if self.cluster_prefetch_threshold_random && self.cluster_block_threshold < 2 {
            return Err(ClientError::InvalidConfiguration {
                msg: "randomised cluster threshold requires cluster_block_threshold >= 2"
                    .to_string(),
            });
        }
        if self.readdir_prefetch_size == 0 {
            return Err(ClientError::InvalidConfiguration {
                msg: "readdir_prefetch_size must be positive".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_config() -> ClientConfig {
        ClientConfig {
            root_uuid: "root".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn default_config_validates_once_root_is_set() {
        assert!(valid_config().validate().is_ok());
    }

    #[test]
    fn empty_root_uuid_is_rejected() {
        let config = ClientConfig::default();
        assert!(matches!(
            config.validate(),
            Err(ClientError::InvalidConfiguration { .. })
        ));
    }

    #[test]
    fn relative_mount_point_is_rejected() {
        let config = ClientConfig {
            mount_point: PathBuf::from("mnt/oneclient"),
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn linear_threshold_out_of_range_is_rejected() {
        let config = ClientConfig {
            linear_read_prefetch_threshold: 1.5,
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn inverted_retry_range_is_rejected() {
        let config = ClientConfig {
            retry_delays_ms: vec![(5_000, 1_000)],
            ..valid_config()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn retry_delay_index_widens_and_clamps() {
        let config = valid_config();
        let first = config.retry_delay_range(config.max_retries);
        let last = config.retry_delay_range(0);
        assert_eq!(first, (4_000, 6_000));
        assert_eq!(last, (10_000, 30_000));
        // Far past the table end still yields the last entry.
        let clamped = config.retry_delay_range(0);
        assert_eq!(clamped, last);
    }

    #[test]
    fn zero_drop_after_disables_pruning() {
        let config = ClientConfig {
            directory_cache_drop_after_secs: 0,
            ..valid_config()
        };
        assert!(config.directory_cache_drop_after().is_none());
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let json = r#"{"root_uuid": "r1", "prefetch_mode": "sync", "cluster_window": 1048576}"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.root_uuid, "r1");
        assert_eq!(config.prefetch_mode, PrefetchMode::Sync);
        assert_eq!(config.cluster_window, 1_048_576);
        assert_eq!(config.max_retries, 6);
    }
}
