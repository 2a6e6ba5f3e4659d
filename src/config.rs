//! Experiment configuration.
//!
//! [`ExperimentConfig`] is the validated, transport-independent form of the
//! command line. Every participant builds the same configuration; checks
//! that depend on the actual group (enough ranks for the requested roles)
//! run again on each rank before the first barrier.

use crate::cli::{Args, SetupMode, StorageType, TransportKind};
use crate::coordinator::RoleAssignment;
use crate::defaults;
use crate::node::{ReaderConfig, WriterConfig};
use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Configuration problems that stop a participant before the first barrier
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("not enough nodes: {required} required, {available} available")]
    NotEnoughNodes { required: usize, available: usize },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings shared by every participant of one experiment
#[derive(Debug, Clone)]
pub struct ExperimentConfig {
    pub storage: StorageType,
    pub group_size: usize,
    pub roles: RoleAssignment,
    pub table_size: usize,
    pub write_count: usize,
    pub warmup_count: usize,
    pub write_rate: f64,
    pub interval: Duration,
    pub read_timeout: Duration,
    pub end_on_repeat: bool,
    pub setup_mode: SetupMode,
    pub propagation_delay: Duration,
    pub map_name: Option<String>,
    pub tag: Option<String>,
    pub log_dir: PathBuf,
    pub output_file: PathBuf,
    pub transport: TransportKind,
    pub host: String,
    pub port: u16,
    pub connect_timeout: Duration,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            storage: StorageType::ArpMergedMap,
            group_size: defaults::GROUP_SIZE,
            roles: RoleAssignment {
                maps: defaults::MAPS,
                readers_per_map: defaults::READERS_PER_MAP,
            },
            table_size: defaults::TABLE_SIZE,
            write_count: defaults::WRITE_COUNT,
            warmup_count: defaults::WARMUP_WRITES,
            write_rate: defaults::WRITE_RATE,
            interval: defaults::INTERVAL,
            read_timeout: defaults::READ_TIMEOUT,
            end_on_repeat: false,
            setup_mode: SetupMode::Throttled,
            propagation_delay: defaults::PROPAGATION_DELAY,
            map_name: None,
            tag: None,
            log_dir: PathBuf::from(defaults::LOG_DIR),
            output_file: PathBuf::from(defaults::OUTPUT_FILE),
            transport: TransportKind::Local,
            host: defaults::HOST.to_string(),
            port: 0,
            connect_timeout: defaults::CONNECT_TIMEOUT,
        }
    }
}

impl ExperimentConfig {
    /// Create the experiment configuration from CLI arguments
    ///
    /// ## Validation
    /// - Rates and intervals must yield at least one write per interval
    /// - At least one structure and one measured write are required
    /// - The group must be large enough for the requested roles
    pub fn from_args(args: &Args) -> Result<Self> {
        let config = Self {
            storage: args.storage,
            group_size: args.nodes,
            roles: RoleAssignment {
                maps: args.maps,
                readers_per_map: args.readers_per_map,
            },
            table_size: args.table_size,
            write_count: args.write_count,
            warmup_count: args.warmup_count,
            write_rate: args.write_rate,
            interval: args.interval,
            read_timeout: args.read_timeout,
            end_on_repeat: args.end_on_repeat,
            setup_mode: args.setup_mode,
            propagation_delay: args.propagation_delay,
            map_name: args.map_name.clone(),
            tag: args.tag.clone(),
            log_dir: args.log_dir.clone(),
            output_file: args.output_file.clone(),
            transport: args.transport,
            host: args.host.clone(),
            port: args.port,
            connect_timeout: args.connect_timeout,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.group_size == 0 {
            return Err(ConfigError::Invalid("the group needs at least one node".into()));
        }
        if self.roles.maps == 0 {
            return Err(ConfigError::Invalid("at least one map is required".into()));
        }
        if self.write_count == 0 {
            return Err(ConfigError::Invalid("write count must be positive".into()));
        }
        if !self.write_rate.is_finite() || self.write_rate <= 0.0 {
            return Err(ConfigError::Invalid(format!(
                "write rate must be positive, got {}",
                self.write_rate
            )));
        }
        if self.interval.is_zero() {
            return Err(ConfigError::Invalid("interval must be positive".into()));
        }
        if self.writer_config().writes_per_interval() == 0 {
            return Err(ConfigError::Invalid(format!(
                "{} writes/s over {:?} is less than one write per interval",
                self.write_rate, self.interval
            )));
        }
        if let Some(name) = &self.map_name {
            if name.is_empty() {
                return Err(ConfigError::Invalid("map name cannot be empty".into()));
            }
        }
        self.roles.validate(self.group_size)
    }

    pub fn writer_config(&self) -> WriterConfig {
        WriterConfig {
            write_count: self.write_count as u64,
            warmup_count: self.warmup_count as u64,
            write_rate: self.write_rate,
            interval: self.interval,
        }
    }

    pub fn reader_config(&self) -> ReaderConfig {
        ReaderConfig {
            write_count: self.write_count as u64,
            warmup_count: self.warmup_count as u64,
            read_timeout: self.read_timeout,
            end_on_repeat: self.end_on_repeat,
        }
    }

    /// Tag used when none was given, e.g. `arpmm-1m-2r-50w`.
    pub fn default_tag(&self) -> String {
        format!(
            "{}-{}m-{}r-{}w",
            self.storage.short_name(),
            self.roles.maps,
            self.roles.readers_per_map,
            self.write_count
        )
    }

    pub fn effective_tag(&self) -> String {
        self.tag.clone().unwrap_or_else(|| self.default_tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_from_default_args() {
        let args = Args::parse_from(["replica-bench"]);
        let config = ExperimentConfig::from_args(&args).unwrap();
        assert_eq!(config.group_size, defaults::GROUP_SIZE);
        assert_eq!(config.writer_config().writes_per_interval(), 1);
        assert_eq!(config.effective_tag(), "arpmm-1m-2r-50w");
    }

    #[test]
    fn test_not_enough_nodes() {
        let args = Args::parse_from(["replica-bench", "-n", "5", "--maps", "2"]);
        let err = ExperimentConfig::from_args(&args).unwrap_err();
        assert_eq!(
            err.downcast_ref::<ConfigError>(),
            Some(&ConfigError::NotEnoughNodes {
                required: 6,
                available: 5
            })
        );
    }

    #[test]
    fn test_rate_too_low_for_interval() {
        let config = ExperimentConfig {
            write_rate: 1.0,
            interval: Duration::from_millis(100),
            ..ExperimentConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_empty_workload() {
        let config = ExperimentConfig {
            write_count: 0,
            ..ExperimentConfig::default()
        };
        assert!(config.validate().is_err());

        let config = ExperimentConfig {
            write_rate: f64::NAN,
            ..ExperimentConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_explicit_tag_wins() {
        let config = ExperimentConfig {
            tag: Some("nightly".to_string()),
            ..ExperimentConfig::default()
        };
        assert_eq!(config.effective_tag(), "nightly");
    }
}
