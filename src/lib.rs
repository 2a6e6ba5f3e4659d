//! # Replica Bench Library
//!
//! A distributed benchmark harness for replicated data structures. A group
//! of cooperating participants (ranks) splits into writers, readers and idle
//! ranks; writers publish timestamped versions into a replicated structure
//! at a controlled rate and readers measure how long each version takes to
//! reach them. Results are gathered on the root rank and summarized.
//!
//! ## Architecture Overview
//!
//! - `distribution`: block partitioning of a global index range over ranks
//! - `group`: process-group collectives over pluggable transports
//! - `store`: replicated map/set adapters and the probe channels on top
//! - `watcher`: latched change notification between store and reader
//! - `node`: writer, reader and dummy workloads
//! - `coordinator`: the phased, barrier-synchronized test cycle
//! - `aggregate`: group-wide latency statistics on the root
//! - `experiment`: wiring of one benchmark run on one rank
//! - `bookkeeper` and `results`: per-participant logs and the JSON report
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use replica_bench::config::ExperimentConfig;
//! use replica_bench::experiment::LatencyExperiment;
//! use replica_bench::group::{LocalTransport, ProcessGroup};
//! use replica_bench::store::{InMemoryStoreHub, StoreProvider};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ExperimentConfig::default();
//!     let provider: Arc<dyn StoreProvider> =
//!         Arc::new(InMemoryStoreHub::new(Duration::from_millis(1)));
//!
//!     let mut handles = Vec::new();
//!     for transport in LocalTransport::group(config.group_size) {
//!         let experiment = LatencyExperiment::new(config.clone(), Arc::clone(&provider));
//!         handles.push(tokio::spawn(async move {
//!             let mut group = ProcessGroup::new(Box::new(transport), "localhost");
//!             experiment.run(&mut group).await
//!         }));
//!     }
//!     for handle in handles {
//!         let outcome = handle.await??;
//!         if let Some(report) = outcome.aggregate {
//!             println!("{:?}", report.latency);
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Clocks
//!
//! Latency is the reader's wall-clock observation time minus the writer's
//! wall-clock send time. Numbers are only meaningful when all participants
//! share a clock, as the in-process launcher does, or run on hosts with
//! synchronized clocks.

/// Group-wide statistics and the root's aggregate report
pub mod aggregate;

/// Per-participant text logs
pub mod bookkeeper;

/// Command-line interface
///
/// Argument parsing using clap, with human-readable durations
/// (e.g. "100ms", "2m") and the storage, setup and transport selections.
pub mod cli;

/// Validated experiment configuration
pub mod config;

/// Test-cycle protocol and role assignment
pub mod coordinator;

pub mod distribution;

/// One benchmark run on one rank
pub mod experiment;

/// Process-group runtime
///
/// Collective operations (barrier, broadcast, gather, all-gather, reductions)
/// over an in-process channel transport or TCP connections through the root.
pub mod group;

/// Console and file logging setup
pub mod logging;

/// HDR histograms and throughput measurement
pub mod metrics;

/// Writer, reader and dummy workloads
pub mod node;

/// JSON run report
pub mod results;

/// Replicated-store adapters
///
/// Typed map and set interfaces, an in-memory implementation with simulated
/// propagation delay, and the probe channels that carry versioned write
/// times through each storage type.
pub mod store;

pub mod utils;

pub mod watcher;

pub use cli::{Args, StorageType};
pub use config::ExperimentConfig;
pub use coordinator::{CycleOutcome, TestCycleCoordinator};
pub use experiment::LatencyExperiment;
pub use group::{ProcessGroup, ProcessIdentity};
pub use results::{ResultsManager, RunReport};

/// The current version of the benchmark harness
///
/// Populated from Cargo.toml and recorded in every run report.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
pub mod defaults {
    use std::time::Duration;

    /// Participants started by the local launcher
    ///
    /// Four ranks fit one writer, two readers and one idle rank, which
    /// exercises every role with the default role assignment.
    pub const GROUP_SIZE: usize = 4;

    /// Replicated structures, each with its own writer
    pub const MAPS: usize = 1;

    pub const READERS_PER_MAP: usize = 2;

    /// Background entries loaded into each structure before warmup
    pub const TABLE_SIZE: usize = 100;

    /// Measured writes per writer
    pub const WRITE_COUNT: usize = 50;

    /// Warmup writes per writer
    ///
    /// Readers discard these; they let the store reach steady state before
    /// measurement starts.
    pub const WARMUP_WRITES: usize = 10;

    /// Writes per second per writer
    pub const WRITE_RATE: f64 = 10.0;

    /// Rate-control interval
    pub const INTERVAL: Duration = Duration::from_millis(100);

    /// Silence after which a reader assumes its writer has finished
    pub const READ_TIMEOUT: Duration = Duration::from_secs(120);

    /// Simulated propagation delay of the in-memory store
    pub const PROPAGATION_DELAY: Duration = Duration::from_millis(1);

    /// Consecutive store failures tolerated before a node gives up
    pub const MAX_CONSECUTIVE_FAILURES: u32 = 20;

    /// Base backoff between store retries, multiplied by the attempt number
    pub const RETRY_BACKOFF: Duration = Duration::from_millis(10);

    pub const LOG_DIR: &str = "replica-bench-logs";

    /// Results are written in JSON format for easy parsing by external tools.
    pub const OUTPUT_FILE: &str = "replica_bench_results.json";

    pub const HOST: &str = "127.0.0.1";

    /// Socket send/receive buffer size for the TCP transport
    pub const SOCKET_BUFFER_SIZE: usize = 256 * 1024;

    /// Time the whole group may take to connect
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

    /// Pause between connection attempts to the root
    pub const CONNECTION_RETRY_DELAY_MS: u64 = 200;
}
