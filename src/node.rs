//! # Workload Nodes
//!
//! Each participant plays one role for the duration of a test cycle:
//!
//! - **Writer**: populates its replicated structure with the distributed key
//!   set, warms it up, then publishes `write_count` probe versions at a
//!   configured rate, embedding its wall-clock send time in each value.
//! - **Reader**: subscribes a [`ChangeWatcher`] to the same structure,
//!   drains the warmup versions and then records one propagation latency
//!   sample per measured version it observes.
//! - **Dummy**: takes part in every collective step and does nothing else.
//!
//! Nodes are driven by the coordinator through the [`WorkloadNode`] phases.
//! [`NodeLifecycle`] tracks which phase a node is in so each phase is entered
//! exactly once and in order.
//!
//! ## Versions
//!
//! Warmup versions are `1..=warmup_count`; measured versions are
//! `warmup_count + 1..=warmup_count + write_count`. Version 0 is never
//! published, so an unset probe cannot be mistaken for a write.

use crate::aggregate::LatencyStats;
use crate::bookkeeper::Bookkeeper;
use crate::defaults::{MAX_CONSECUTIVE_FAILURES, RETRY_BACKOFF};
use crate::metrics::{LatencyCollector, ThroughputCalculator, ThroughputMetrics};
use crate::store::{ChangeListener, ListenerId, ProbeChannel, ProbeSample};
use crate::utils::{current_timestamp_ns, format_duration, format_latency_ns, format_rate};
use crate::watcher::{ChangeWatcher, WaitOutcome};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{sleep, sleep_until, Instant};
use tracing::{debug, info, warn};

/// Role of one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Idle,
    Writer { map_id: usize },
    Reader { map_id: usize },
}

impl Role {
    pub fn map_id(&self) -> Option<usize> {
        match self {
            Role::Idle => None,
            Role::Writer { map_id } | Role::Reader { map_id } => Some(*map_id),
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Idle => write!(f, "idle"),
            Role::Writer { map_id } => write!(f, "writer (map {})", map_id),
            Role::Reader { map_id } => write!(f, "reader (map {})", map_id),
        }
    }
}

/// Measurements a node hands to result aggregation
#[derive(Debug, Clone, PartialEq)]
pub struct NodeOutcome {
    pub role: Role,
    /// Propagation latencies, readers only
    pub latencies_ns: Vec<u64>,
    /// One slot per measured version: send time (writer) or first
    /// observation time (reader); 0 when missing
    pub version_times_ns: Vec<u64>,
    pub start_ns: Option<u64>,
    pub end_ns: Option<u64>,
    pub invalid_samples: u64,
    pub missed_versions: u64,
    pub store_failures: u64,
}

impl NodeOutcome {
    pub fn idle() -> Self {
        Self {
            role: Role::Idle,
            latencies_ns: Vec::new(),
            version_times_ns: Vec::new(),
            start_ns: None,
            end_ns: None,
            invalid_samples: 0,
            missed_versions: 0,
            store_failures: 0,
        }
    }
}

/// Phases of a node, in the only order they may be entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum NodeState {
    Created,
    ReadyForMeasurement,
    Measured,
    Closed,
    Done,
}

impl NodeState {
    fn next(self) -> Option<NodeState> {
        match self {
            NodeState::Created => Some(NodeState::ReadyForMeasurement),
            NodeState::ReadyForMeasurement => Some(NodeState::Measured),
            NodeState::Measured => Some(NodeState::Closed),
            NodeState::Closed => Some(NodeState::Done),
            NodeState::Done => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LifecycleError {
    #[error("cannot enter {to:?} from {from:?}")]
    OutOfOrder { from: NodeState, to: NodeState },
}

/// Tracks the phase a node is in
#[derive(Debug, Clone)]
pub struct NodeLifecycle {
    state: NodeState,
}

impl Default for NodeLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeLifecycle {
    pub fn new() -> Self {
        Self {
            state: NodeState::Created,
        }
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    /// Enter `to`, which must directly follow the current state. Whether the
    /// work of the previous phase succeeded does not matter.
    pub fn advance(&mut self, to: NodeState) -> Result<(), LifecycleError> {
        if self.state.next() != Some(to) {
            return Err(LifecycleError::OutOfOrder {
                from: self.state,
                to,
            });
        }
        self.state = to;
        Ok(())
    }
}

/// One participant's behaviour in each phase of a test cycle
#[async_trait]
pub trait WorkloadNode: Send {
    fn role(&self) -> Role;

    /// Prepare for measurement: populate, warm up, drain.
    async fn setup(&mut self) -> Result<()>;

    /// The measured part of the cycle.
    async fn run(&mut self) -> Result<()>;

    /// Release store subscriptions and other resources.
    async fn shutdown(&mut self) -> Result<()>;

    /// Write this node's logs.
    fn report(&self, bookkeeper: &Bookkeeper) -> Result<()>;

    fn outcome(&self) -> NodeOutcome;
}

/// Wall-clock start and end of a phase
#[derive(Debug, Clone, Copy, Default)]
struct Window {
    start_ns: Option<u64>,
    end_ns: Option<u64>,
}

impl Window {
    fn open(&mut self) {
        self.start_ns = Some(current_timestamp_ns());
    }

    fn close(&mut self) {
        self.end_ns = Some(current_timestamp_ns());
    }
}

fn write_timestamps(w: &mut dyn Write, warmup: Window, measure: Window) -> std::io::Result<()> {
    let entries = [
        ("startwarmup", warmup.start_ns),
        ("endwarmup", warmup.end_ns),
        ("startbenchmark", measure.start_ns),
        ("endbenchmark", measure.end_ns),
    ];
    for (name, value) in entries {
        match value {
            Some(ns) => writeln!(w, "{} {}", name, ns)?,
            None => writeln!(w, "{} -", name)?,
        }
    }
    Ok(())
}

/// Settings of a writer
#[derive(Debug, Clone)]
pub struct WriterConfig {
    pub write_count: u64,
    pub warmup_count: u64,
    /// Target writes per second
    pub write_rate: f64,
    /// Burst period
    pub interval: Duration,
}

impl WriterConfig {
    /// `round(rate * interval_us / 1e6)`.
    pub fn writes_per_interval(&self) -> u64 {
        let per_interval = self.write_rate * self.interval.as_micros() as f64 / 1_000_000.0;
        per_interval.round().max(0.0) as u64
    }

    fn warmup_versions(&self) -> RangeInclusive<u64> {
        1..=self.warmup_count
    }

    fn measured_versions(&self) -> RangeInclusive<u64> {
        self.warmup_count + 1..=self.warmup_count + self.write_count
    }
}

/// Publishes probe versions into one replicated structure
pub struct WriterNode {
    map_id: usize,
    probe: Arc<dyn ProbeChannel>,
    keys: Arc<Vec<i64>>,
    config: WriterConfig,
    populated: usize,
    version_times_ns: Vec<u64>,
    warmup: Window,
    measure: Window,
    skipped_sleeps: u64,
    failed_writes: u64,
    throughput: Option<ThroughputMetrics>,
}

impl WriterNode {
    pub fn new(
        map_id: usize,
        probe: Arc<dyn ProbeChannel>,
        keys: Arc<Vec<i64>>,
        config: WriterConfig,
    ) -> Self {
        let slots = config.write_count as usize;
        Self {
            map_id,
            probe,
            keys,
            config,
            populated: 0,
            version_times_ns: vec![0; slots],
            warmup: Window::default(),
            measure: Window::default(),
            skipped_sleeps: 0,
            failed_writes: 0,
            throughput: None,
        }
    }

    pub fn skipped_sleeps(&self) -> u64 {
        self.skipped_sleeps
    }

    pub fn failed_writes(&self) -> u64 {
        self.failed_writes
    }

    /// Publish `version`, retrying the same version on store errors.
    /// Returns the embedded send time.
    async fn publish_with_retry(&mut self, version: u64) -> Result<u64> {
        let mut failures = 0u32;
        loop {
            let written_at_ns = current_timestamp_ns();
            let sample = ProbeSample {
                version,
                written_at_ns,
            };
            match self.probe.publish(sample) {
                Ok(()) => return Ok(written_at_ns),
                Err(e) => {
                    failures += 1;
                    self.failed_writes += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e).with_context(|| {
                            format!(
                                "Giving up on version {} after {} consecutive failures",
                                version, failures
                            )
                        });
                    }
                    warn!("Write of version {} failed ({}), retrying", version, e);
                    sleep(RETRY_BACKOFF * failures).await;
                }
            }
        }
    }

    /// Publish `versions` in bursts of `writes_per_interval`, sleeping to an
    /// absolute anchor between bursts.
    async fn write_versions(
        &mut self,
        versions: RangeInclusive<u64>,
        record: bool,
    ) -> Result<ThroughputMetrics> {
        let per_interval = self.config.writes_per_interval();
        if per_interval == 0 {
            return Err(anyhow!(
                "write rate {} over interval {} rounds to zero writes",
                self.config.write_rate,
                format_duration(self.config.interval)
            ));
        }

        let first_measured = self.config.warmup_count + 1;
        let last = *versions.end();
        let mut throughput = ThroughputCalculator::new();
        let mut anchor = Instant::now();
        let mut in_burst = 0u64;

        for version in versions {
            let written_at_ns = self.publish_with_retry(version).await?;
            if record {
                let slot = (version - first_measured) as usize;
                if let Some(entry) = self.version_times_ns.get_mut(slot) {
                    *entry = written_at_ns;
                }
            }
            throughput.record_operation();

            in_burst += 1;
            if in_burst < per_interval || version == last {
                continue;
            }
            in_burst = 0;
            anchor += self.config.interval;
            let now = Instant::now();
            if anchor > now {
                sleep_until(anchor).await;
            } else {
                self.skipped_sleeps += 1;
                anchor = now;
            }
        }

        throughput.stop();
        Ok(throughput.metrics())
    }
}

#[async_trait]
impl WorkloadNode for WriterNode {
    fn role(&self) -> Role {
        Role::Writer {
            map_id: self.map_id,
        }
    }

    async fn setup(&mut self) -> Result<()> {
        let probe = Arc::clone(&self.probe);
        let keys = Arc::clone(&self.keys);
        self.populated = tokio::task::spawn_blocking(move || probe.populate(&keys))
            .await
            .context("Population task panicked")?
            .with_context(|| format!("Failed to populate {}", self.probe.name()))?;
        debug!("Populated {} with {} entries", self.probe.name(), self.populated);

        let probe = Arc::clone(&self.probe);
        let operations = self.config.warmup_count as usize;
        let churned = tokio::task::spawn_blocking(move || probe.churn(operations))
            .await
            .context("Churn task panicked")?
            .with_context(|| format!("Failed to churn {}", self.probe.name()))?;
        if churned > 0 {
            debug!("Applied {} churn operations to {}", churned, self.probe.name());
        }

        self.warmup.open();
        if self.config.warmup_count > 0 {
            self.write_versions(self.config.warmup_versions(), false)
                .await
                .context("Warmup writes failed")?;
        }
        self.warmup.close();
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.measure.open();
        let result = self
            .write_versions(self.config.measured_versions(), true)
            .await;
        self.measure.close();

        let metrics = result?;
        info!(
            "Wrote {} versions to {} at {} ({} skipped sleeps)",
            metrics.total_operations,
            self.probe.name(),
            format_rate(metrics.operations_per_second),
            self.skipped_sleeps
        );
        self.throughput = Some(metrics);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        debug!(
            "Writer for {} done, {} entries in store",
            self.probe.name(),
            self.probe.entry_count()
        );
        Ok(())
    }

    fn report(&self, bookkeeper: &Bookkeeper) -> Result<()> {
        let (warmup, measure) = (self.warmup, self.measure);
        bookkeeper.with_log("timestamps", |w| write_timestamps(w, warmup, measure))?;

        let (writes, rate) = self
            .throughput
            .as_ref()
            .map_or((0, 0.0), |m| (m.total_operations, m.operations_per_second));
        bookkeeper.with_log("write-summary", |w| {
            writeln!(w, "writes {}", writes)?;
            writeln!(w, "skippedsleep {}", self.skipped_sleeps)?;
            writeln!(w, "avgwriterate {:.3}", rate)?;
            writeln!(w, "failedwrites {}", self.failed_writes)
        })?;
        Ok(())
    }

    fn outcome(&self) -> NodeOutcome {
        NodeOutcome {
            role: self.role(),
            version_times_ns: self.version_times_ns.clone(),
            start_ns: self.measure.start_ns,
            end_ns: self.measure.end_ns,
            store_failures: self.failed_writes,
            ..NodeOutcome::idle()
        }
    }
}

/// Settings of a reader
#[derive(Debug, Clone)]
pub struct ReaderConfig {
    pub write_count: u64,
    pub warmup_count: u64,
    /// Silence after which the writer is assumed finished; zero waits forever
    pub read_timeout: Duration,
    /// Stop on the first repeated observation
    pub end_on_repeat: bool,
}

/// Observes probe versions and records propagation latency
pub struct ReaderNode {
    map_id: usize,
    probe: Arc<dyn ProbeChannel>,
    watcher: Arc<ChangeWatcher>,
    listener: Option<ListenerId>,
    config: ReaderConfig,
    last_version: u64,
    latencies_ns: Vec<u64>,
    version_times_ns: Vec<u64>,
    repeats: u64,
    missed_versions: u64,
    invalid_samples: u64,
    read_failures: u64,
    timed_out: bool,
    warmup: Window,
    measure: Window,
}

impl ReaderNode {
    /// Create the reader and subscribe its watcher to `probe`.
    pub fn new(map_id: usize, probe: Arc<dyn ProbeChannel>, config: ReaderConfig) -> Self {
        let watcher = Arc::new(ChangeWatcher::new());
        let listener: Arc<dyn ChangeListener> = watcher.clone();
        let listener = probe.subscribe(listener);
        let slots = config.write_count as usize;
        Self {
            map_id,
            probe,
            watcher,
            listener: Some(listener),
            config,
            last_version: 0,
            latencies_ns: Vec::with_capacity(slots),
            version_times_ns: vec![0; slots],
            repeats: 0,
            missed_versions: 0,
            invalid_samples: 0,
            read_failures: 0,
            timed_out: false,
            warmup: Window::default(),
            measure: Window::default(),
        }
    }

    pub fn latencies_ns(&self) -> &[u64] {
        &self.latencies_ns
    }

    pub fn repeats(&self) -> u64 {
        self.repeats
    }

    pub fn timed_out(&self) -> bool {
        self.timed_out
    }

    async fn observe_with_retry(&mut self) -> Result<Option<ProbeSample>> {
        let mut failures = 0u32;
        loop {
            match self.probe.observe() {
                Ok(sample) => return Ok(sample),
                Err(e) => {
                    failures += 1;
                    self.read_failures += 1;
                    if failures >= MAX_CONSECUTIVE_FAILURES {
                        return Err(e).with_context(|| {
                            format!("Giving up after {} consecutive read failures", failures)
                        });
                    }
                    warn!("Read of {} failed ({}), retrying", self.probe.name(), e);
                    sleep(RETRY_BACKOFF * failures).await;
                }
            }
        }
    }

    /// Account for one observation taken at `observed_at_ns`. Returns true
    /// when the run should stop.
    fn record(&mut self, sample: ProbeSample, observed_at_ns: u64) -> bool {
        let warmup = self.config.warmup_count;
        let last = warmup + self.config.write_count;

        if sample.version <= self.last_version {
            self.repeats += 1;
            debug!("Repeated observation of version {}", sample.version);
            return self.config.end_on_repeat && self.last_version > warmup;
        }
        if sample.version <= warmup {
            self.last_version = sample.version;
            return false;
        }

        let expected = self.last_version.max(warmup) + 1;
        if sample.version > expected {
            self.missed_versions += sample.version - expected;
        }
        self.last_version = sample.version;

        if observed_at_ns < sample.written_at_ns {
            self.invalid_samples += 1;
            warn!(
                "Version {} observed {}ns before it was written, discarding",
                sample.version,
                sample.written_at_ns - observed_at_ns
            );
        } else {
            self.latencies_ns.push(observed_at_ns - sample.written_at_ns);
            let slot = (sample.version - warmup - 1) as usize;
            if let Some(entry) = self.version_times_ns.get_mut(slot) {
                *entry = observed_at_ns;
            }
        }

        sample.version >= last || self.latencies_ns.len() as u64 >= self.config.write_count
    }
}

#[async_trait]
impl WorkloadNode for ReaderNode {
    fn role(&self) -> Role {
        Role::Reader {
            map_id: self.map_id,
        }
    }

    async fn setup(&mut self) -> Result<()> {
        self.warmup.open();
        let warmup = self.config.warmup_count;
        while self.last_version < warmup {
            if let Some(sample) = self.observe_with_retry().await? {
                self.last_version = self.last_version.max(sample.version);
                if self.last_version >= warmup {
                    break;
                }
            }
            if self.watcher.wait_for_update(self.config.read_timeout).await
                == WaitOutcome::TimedOut
            {
                warn!(
                    "Warmup drain of {} timed out at version {} of {}",
                    self.probe.name(),
                    self.last_version,
                    warmup
                );
                break;
            }
        }
        self.warmup.close();
        debug!("Reader drained warmup up to version {}", self.last_version);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        self.measure.open();
        let result = async {
            while (self.latencies_ns.len() as u64) < self.config.write_count {
                if self.watcher.wait_for_update(self.config.read_timeout).await
                    == WaitOutcome::TimedOut
                {
                    self.timed_out = true;
                    warn!(
                        "No update on {} for {}, assuming the writer finished",
                        self.probe.name(),
                        format_duration(self.config.read_timeout)
                    );
                    break;
                }
                let Some(sample) = self.observe_with_retry().await? else {
                    continue;
                };
                let observed_at_ns = current_timestamp_ns();
                if self.record(sample, observed_at_ns) {
                    break;
                }
            }
            Ok::<(), anyhow::Error>(())
        }
        .await;
        self.measure.close();

        info!(
            "Recorded {} samples from {} ({} missed, {} repeated, {} invalid)",
            self.latencies_ns.len(),
            self.probe.name(),
            self.missed_versions,
            self.repeats,
            self.invalid_samples
        );
        result
    }

    async fn shutdown(&mut self) -> Result<()> {
        if let Some(id) = self.listener.take() {
            if !self.probe.unsubscribe(id) {
                warn!("Listener {} was not registered on {}", id, self.probe.name());
            }
        }
        Ok(())
    }

    fn report(&self, bookkeeper: &Bookkeeper) -> Result<()> {
        let (warmup, measure) = (self.warmup, self.measure);
        bookkeeper.with_log("timestamps", |w| write_timestamps(w, warmup, measure))?;

        bookkeeper.with_headerless_log("raw-latency-data", |w| {
            for latency in &self.latencies_ns {
                writeln!(w, "{}", latency)?;
            }
            Ok(())
        })?;

        let stats = LatencyStats::from_samples(self.latencies_ns.clone()).ok();
        let mut histogram = LatencyCollector::new()?;
        for &latency in &self.latencies_ns {
            histogram.record_ns(latency)?;
        }
        let hdr = histogram.summary(&[50.0, 90.0, 95.0, 99.0, 99.99]);

        bookkeeper.with_log("summary", |w| {
            writeln!(w, "samples {}", self.latencies_ns.len())?;
            match &stats {
                Some(stats) => {
                    let at = |p: f64| stats.percentile(p).unwrap_or_else(|_| stats.max());
                    writeln!(w, "mean {}", format_latency_ns(stats.mean()))?;
                    writeln!(w, "stdev {}", format_latency_ns(stats.std_dev()))?;
                    writeln!(w, "p90 {}", at(0.90))?;
                    writeln!(w, "p95 {}", at(0.95))?;
                    writeln!(w, "p99 {}", at(0.99))?;
                    writeln!(w, "p99.99 {}", at(0.9999))?;
                }
                None => writeln!(w, "no samples recorded")?,
            }
            writeln!(w, "missed {}", self.missed_versions)?;
            writeln!(w, "repeated {}", self.repeats)?;
            writeln!(w, "invalid {}", self.invalid_samples)?;
            writeln!(w, "readfailures {}", self.read_failures)?;
            writeln!(w, "changes {}", self.watcher.change_count())?;
            if !histogram.is_empty() {
                writeln!(
                    w,
                    "hdr min {} max {} mean {:.1} stdev {:.1}",
                    hdr.min_ns, hdr.max_ns, hdr.mean_ns, hdr.std_dev_ns
                )?;
                for p in &hdr.percentiles {
                    writeln!(w, "hdr p{} {}", p.percentile, p.value_ns)?;
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    fn outcome(&self) -> NodeOutcome {
        NodeOutcome {
            role: self.role(),
            latencies_ns: self.latencies_ns.clone(),
            version_times_ns: self.version_times_ns.clone(),
            start_ns: self.measure.start_ns,
            end_ns: self.measure.end_ns,
            invalid_samples: self.invalid_samples,
            missed_versions: self.missed_versions,
            store_failures: self.read_failures,
        }
    }
}

impl Drop for ReaderNode {
    fn drop(&mut self) {
        if let Some(id) = self.listener.take() {
            self.probe.unsubscribe(id);
        }
    }
}

/// Participant without a role; joins every collective step and nothing else
#[derive(Debug, Default)]
pub struct DummyNode;

#[async_trait]
impl WorkloadNode for DummyNode {
    fn role(&self) -> Role {
        Role::Idle
    }

    async fn setup(&mut self) -> Result<()> {
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<()> {
        Ok(())
    }

    fn report(&self, _bookkeeper: &Bookkeeper) -> Result<()> {
        Ok(())
    }

    fn outcome(&self) -> NodeOutcome {
        NodeOutcome::idle()
    }
}
