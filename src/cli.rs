use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Replica Bench - latency and churn benchmark for replicated data structures
#[derive(Parser, Debug, Clone)]
#[clap(version, about, long_about = None)]
pub struct Args {
    /// Number of participants (ranks) in the process group
    #[clap(short = 'n', long, default_value_t = crate::defaults::GROUP_SIZE, help_heading = "Core Options")]
    pub nodes: usize,

    /// Replicated data structure under test
    #[clap(short = 't', long, value_enum, default_value_t = StorageType::ArpMergedMap, help_heading = "Core Options")]
    pub storage: StorageType,

    /// Number of independent structures, each with one writer
    #[clap(long, default_value_t = crate::defaults::MAPS, help_heading = "Core Options")]
    pub maps: usize,

    /// Readers attached to each structure
    #[clap(long, default_value_t = crate::defaults::READERS_PER_MAP, help_heading = "Core Options")]
    pub readers_per_map: usize,

    /// Background entries loaded into each structure before warmup
    #[clap(long, default_value_t = crate::defaults::TABLE_SIZE, help_heading = "Workload")]
    pub table_size: usize,

    /// Measured writes per writer
    #[clap(short = 'w', long, default_value_t = crate::defaults::WRITE_COUNT, help_heading = "Workload")]
    pub write_count: usize,

    /// Warmup writes per writer (discarded by readers)
    #[clap(long, default_value_t = crate::defaults::WARMUP_WRITES, help_heading = "Workload")]
    pub warmup_count: usize,

    /// Target write rate per writer, in writes per second
    #[clap(short = 'r', long, default_value_t = crate::defaults::WRITE_RATE, help_heading = "Workload")]
    pub write_rate: f64,

    /// Rate-control interval (e.g. "100ms")
    #[clap(long, value_parser = parse_duration, default_value = "100ms", help_heading = "Workload")]
    pub interval: Duration,

    /// Reader wait for the next update before assuming the stream ended ("0" waits forever)
    #[clap(long, value_parser = parse_duration, default_value = "120s", help_heading = "Workload")]
    pub read_timeout: Duration,

    /// Also end a reader's run when the same version is observed twice in a row
    #[clap(long, default_value_t = false, help_heading = "Workload")]
    pub end_on_repeat: bool,

    /// How participants run their setup step
    #[clap(long, value_enum, default_value_t = SetupMode::Throttled, help_heading = "Workload")]
    pub setup_mode: SetupMode,

    /// Simulated propagation delay of the in-memory store
    #[clap(long, value_parser = parse_duration, default_value = "1ms", help_heading = "Store")]
    pub propagation_delay: Duration,

    /// Base name of the replicated structures (generated by the root when omitted)
    #[clap(long, help_heading = "Store")]
    pub map_name: Option<String>,

    /// Transport connecting the participants
    #[clap(long, value_enum, default_value_t = TransportKind::Local, help_heading = "Transport")]
    pub transport: TransportKind,

    /// Host address of the root for TCP transport
    #[clap(long, default_value = "127.0.0.1", help_heading = "Transport")]
    pub host: String,

    /// Port of the root for TCP transport (0 picks a free port)
    #[clap(long, default_value_t = 0, help_heading = "Transport")]
    pub port: u16,

    /// How long the group may take to connect
    #[clap(long, value_parser = parse_duration, default_value = "30s", help_heading = "Transport")]
    pub connect_timeout: Duration,

    /// Experiment tag used as the log directory name
    #[clap(long, help_heading = "Output")]
    pub tag: Option<String>,

    /// Base directory for per-participant log files
    #[clap(long, default_value = crate::defaults::LOG_DIR, help_heading = "Output")]
    pub log_dir: PathBuf,

    /// Output file for the aggregate results (JSON format)
    #[clap(short = 'o', long, default_value = crate::defaults::OUTPUT_FILE, help_heading = "Output")]
    pub output_file: PathBuf,

    /// Also write tracing output to this file
    #[clap(long, help_heading = "Output")]
    pub log_file: Option<PathBuf>,

    /// Verbose output
    #[clap(short = 'v', long, default_value_t = false)]
    pub verbose: bool,
}

/// Replicated data structures the benchmark can drive
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, ValueEnum, Serialize, Deserialize)]
pub enum StorageType {
    /// MAC address table
    #[clap(name = "mac-table")]
    MacTable,

    /// ARP table
    #[clap(name = "arp-table")]
    ArpTable,

    /// Routing table (replicated set)
    #[clap(name = "routing-table")]
    RoutingTable,

    /// ARP table carried by a merged map
    #[clap(name = "arp-merged-map")]
    ArpMergedMap,
}

impl std::fmt::Display for StorageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageType::MacTable => write!(f, "MAC Table"),
            StorageType::ArpTable => write!(f, "ARP Table"),
            StorageType::RoutingTable => write!(f, "Routing Table"),
            StorageType::ArpMergedMap => write!(f, "ARP Merged Map"),
        }
    }
}

impl StorageType {
    /// Short label used in experiment tags and structure names
    pub fn short_name(&self) -> &'static str {
        match self {
            StorageType::MacTable => "mac",
            StorageType::ArpTable => "arp",
            StorageType::RoutingTable => "route",
            StorageType::ArpMergedMap => "arpmm",
        }
    }
}

/// How the setup phase is scheduled across participants
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum SetupMode {
    /// One participant at a time, in rank order
    Throttled,
    /// Everybody at once
    Parallel,
}

/// Transport connecting the local participants
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, Serialize, Deserialize)]
pub enum TransportKind {
    /// In-process channels
    Local,
    /// Loopback TCP connections through the root
    Tcp,
}

/// Parse duration from string (e.g., "10s", "5m", "1h")
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();

    if s.is_empty() {
        return Err("Duration cannot be empty".to_string());
    }

    let (num_str, unit) = if let Some(stripped) = s.strip_suffix("ms") {
        (stripped, "ms")
    } else if let Some(stripped) = s.strip_suffix('s') {
        (stripped, "s")
    } else if let Some(stripped) = s.strip_suffix('m') {
        (stripped, "m")
    } else if let Some(stripped) = s.strip_suffix('h') {
        (stripped, "h")
    } else {
        (s, "s") // Default to seconds
    };

    let num: f64 = num_str
        .parse()
        .map_err(|_| format!("Invalid number in duration: {}", num_str))?;
    if !num.is_finite() || num < 0.0 {
        return Err(format!("Duration must be a non-negative number: {}", s));
    }

    let nanos_per_unit = match unit {
        "ms" => 1e6,
        "s" => 1e9,
        "m" => 60e9,
        "h" => 3600e9,
        _ => return Err(format!("Invalid duration unit: {}", unit)),
    };

    Ok(Duration::from_nanos((num * nanos_per_unit).round() as u64))
}
