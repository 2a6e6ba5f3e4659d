//! # Result Aggregation
//!
//! Collects per-participant measurements on the root rank and turns them
//! into group-wide statistics.
//!
//! ## Protocol
//!
//! Every rank runs [`ResultAggregator::collect`] with its own
//! [`NodeOutcome`]; the sequence of collectives is identical on all ranks:
//!
//! 1. `reduce_max` of the local sample count, broadcast back from the root,
//!    gives the common padded length
//! 2. `gather` of `(sample count, role, map id)` triples
//! 3. `gather` of the padded latency samples
//! 4. `gather` of the per-version timestamp slots
//! 5. `reduce_min` of start times, `reduce_max` of end times
//! 6. `reduce_sum` of invalid samples, missed versions and store failures
//!
//! Only the root computes the report. Padding is removed using the gathered
//! sample counts, walking ranks in increasing order.
//!
//! ## Statistics
//!
//! [`LatencyStats`] computes the mean, the population standard deviation and
//! nearest-rank percentiles: sort ascending and pick index `floor(n * p)`,
//! clamped to `n - 1`. An empty sample set is an error, never a silent zero.

use crate::group::{GroupError, ProcessGroup, ROOT_RANK};
use crate::node::{NodeOutcome, Role};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors raised by [`LatencyStats`]
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StatsError {
    #[error("cannot compute statistics over an empty sample set")]
    EmptySampleSet,

    #[error("percentile {0} is outside [0, 1]")]
    InvalidPercentile(f64),
}

/// Sorted latency samples, in nanoseconds
#[derive(Debug, Clone)]
pub struct LatencyStats {
    sorted: Vec<u64>,
}

impl LatencyStats {
    pub fn from_samples(mut samples: Vec<u64>) -> Result<Self, StatsError> {
        if samples.is_empty() {
            return Err(StatsError::EmptySampleSet);
        }
        samples.sort_unstable();
        Ok(Self { sorted: samples })
    }

    pub fn count(&self) -> usize {
        self.sorted.len()
    }

    pub fn mean(&self) -> f64 {
        let sum: u128 = self.sorted.iter().map(|&v| u128::from(v)).sum();
        sum as f64 / self.sorted.len() as f64
    }

    /// Population standard deviation.
    pub fn std_dev(&self) -> f64 {
        let mean = self.mean();
        let variance = self
            .sorted
            .iter()
            .map(|&v| (v as f64 - mean).powi(2))
            .sum::<f64>()
            / self.sorted.len() as f64;
        variance.sqrt()
    }

    /// Nearest-rank percentile, `p` in `[0, 1]`.
    pub fn percentile(&self, p: f64) -> Result<u64, StatsError> {
        if !(0.0..=1.0).contains(&p) {
            return Err(StatsError::InvalidPercentile(p));
        }
        let n = self.sorted.len();
        let index = ((n as f64 * p).floor() as usize).min(n - 1);
        Ok(self.sorted[index])
    }

    pub fn min(&self) -> u64 {
        self.sorted[0]
    }

    pub fn max(&self) -> u64 {
        self.sorted[self.sorted.len() - 1]
    }

    pub fn samples(&self) -> &[u64] {
        &self.sorted
    }

    pub fn summary(&self) -> LatencySummary {
        // Percentiles below are all within [0, 1].
        let at = |p: f64| self.percentile(p).unwrap_or_else(|_| self.max());
        LatencySummary {
            count: self.count(),
            mean_ns: self.mean(),
            std_dev_ns: self.std_dev(),
            min_ns: self.min(),
            max_ns: self.max(),
            p50_ns: at(0.50),
            p90_ns: at(0.90),
            p95_ns: at(0.95),
            p99_ns: at(0.99),
            p9999_ns: at(0.9999),
        }
    }
}

/// Summary statistics of a latency sample set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub count: usize,
    pub mean_ns: f64,
    pub std_dev_ns: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p95_ns: u64,
    pub p99_ns: u64,
    pub p9999_ns: u64,
}

/// How measured versions of one structure reached its readers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapPropagation {
    pub map_id: usize,
    pub readers: usize,
    pub versions_written: usize,
    /// Number of readers that saw a version -> number of such versions
    pub delivery_histogram: BTreeMap<usize, usize>,
    /// Time from the write until the last reader saw it, for versions seen
    /// by every reader
    pub full_delivery: Option<LatencySummary>,
}

/// Group-wide results, available on the root only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateReport {
    pub participants: usize,
    pub samples_per_rank: Vec<usize>,
    pub latency: Option<LatencySummary>,
    pub propagation: Vec<MapPropagation>,
    /// From the earliest measurement start to the latest measurement end
    pub wall_clock_ns: Option<u64>,
    pub invalid_samples: u64,
    pub missed_versions: u64,
    pub store_failures: u64,
}

const ROLE_IDLE: i64 = 0;
const ROLE_WRITER: i64 = 1;
const ROLE_READER: i64 = 2;

fn encode_role(role: Role) -> [i64; 2] {
    match role {
        Role::Idle => [ROLE_IDLE, -1],
        Role::Writer { map_id } => [ROLE_WRITER, map_id as i64],
        Role::Reader { map_id } => [ROLE_READER, map_id as i64],
    }
}

fn decode_role(code: i64, map_id: i64) -> Role {
    match (code, usize::try_from(map_id)) {
        (ROLE_WRITER, Ok(map_id)) => Role::Writer { map_id },
        (ROLE_READER, Ok(map_id)) => Role::Reader { map_id },
        _ => Role::Idle,
    }
}

/// Gathers node outcomes onto the root and computes the aggregate report
#[derive(Debug, Clone)]
pub struct ResultAggregator {
    version_slots: usize,
}

impl ResultAggregator {
    /// `version_slots` is the number of measured versions per writer; it must
    /// be the same on every rank.
    pub fn new(version_slots: usize) -> Self {
        Self { version_slots }
    }

    /// Run the aggregation collectives. Returns the report on the root and
    /// `None` elsewhere.
    pub async fn collect(
        &self,
        group: &mut ProcessGroup,
        outcome: &NodeOutcome,
    ) -> Result<Option<AggregateReport>, GroupError> {
        let size = group.size();
        let local_count = outcome.latencies_ns.len();

        let max_count = group.reduce_max(local_count as i64, ROOT_RANK).await?;
        let common = group.broadcast_value(max_count, ROOT_RANK).await?;
        let common = usize::try_from(common)
            .map_err(|_| GroupError::Collective(format!("invalid sample length {}", common)))?;
        debug!("Aggregating {} local samples, padded to {}", local_count, common);

        let [role_code, map_id] = encode_role(outcome.role);
        let header = group
            .gather(&[local_count as i64, role_code, map_id], ROOT_RANK)
            .await?;

        let mut padded: Vec<i64> = outcome.latencies_ns.iter().map(|&v| v as i64).collect();
        padded.resize(common, 0);
        let samples = group.gather(&padded, ROOT_RANK).await?;

        let mut slots: Vec<i64> = outcome.version_times_ns.iter().map(|&v| v as i64).collect();
        slots.resize(self.version_slots, 0);
        let times = group.gather(&slots, ROOT_RANK).await?;

        let start = outcome.start_ns.map_or(i64::MAX, |v| v as i64);
        let end = outcome.end_ns.map_or(0, |v| v as i64);
        let earliest = group.reduce_min(start, ROOT_RANK).await?;
        let latest = group.reduce_max(end, ROOT_RANK).await?;

        let invalid = group
            .reduce_sum(outcome.invalid_samples as i64, ROOT_RANK)
            .await?;
        let missed = group
            .reduce_sum(outcome.missed_versions as i64, ROOT_RANK)
            .await?;
        let failures = group
            .reduce_sum(outcome.store_failures as i64, ROOT_RANK)
            .await?;

        let (Some(header), Some(samples), Some(times)) = (header, samples, times) else {
            return Ok(None);
        };

        let mut counts = Vec::with_capacity(size);
        let mut roles = Vec::with_capacity(size);
        for triple in header.chunks_exact(3) {
            counts.push(usize::try_from(triple[0]).unwrap_or(0).min(common));
            roles.push(decode_role(triple[1], triple[2]));
        }

        let mut dense = Vec::with_capacity(counts.iter().sum());
        for (rank, &count) in counts.iter().enumerate() {
            let start = rank * common;
            dense.extend(samples[start..start + count].iter().map(|&v| v as u64));
        }

        let latency = match LatencyStats::from_samples(dense) {
            Ok(stats) => Some(stats.summary()),
            Err(e) => {
                warn!("No latency statistics: {}", e);
                None
            }
        };

        let per_rank_times: Vec<&[i64]> = times.chunks(self.version_slots.max(1)).collect();
        let propagation = propagation_report(&roles, &per_rank_times, self.version_slots);

        let wall_clock_ns = if earliest != i64::MAX && latest > earliest {
            Some((latest - earliest) as u64)
        } else {
            None
        };

        Ok(Some(AggregateReport {
            participants: size,
            samples_per_rank: counts,
            latency,
            propagation,
            wall_clock_ns,
            invalid_samples: invalid.max(0) as u64,
            missed_versions: missed.max(0) as u64,
            store_failures: failures.max(0) as u64,
        }))
    }
}

/// Per-structure delivery analysis from gathered version timestamps.
///
/// A zero slot means the version was not written (writer) or not seen
/// (reader).
fn propagation_report(roles: &[Role], times: &[&[i64]], slots: usize) -> Vec<MapPropagation> {
    let mut report = Vec::new();
    for (writer_rank, role) in roles.iter().enumerate() {
        let Role::Writer { map_id } = *role else {
            continue;
        };
        let Some(writer_times) = times.get(writer_rank) else {
            continue;
        };
        let readers: Vec<&[i64]> = roles
            .iter()
            .enumerate()
            .filter(|(_, r)| **r == Role::Reader { map_id })
            .filter_map(|(rank, _)| times.get(rank).copied())
            .collect();

        let mut histogram = BTreeMap::new();
        let mut full_delivery = Vec::new();
        let mut written = 0;
        for slot in 0..slots.min(writer_times.len()) {
            let sent = writer_times[slot];
            if sent == 0 {
                continue;
            }
            written += 1;
            let received: Vec<i64> = readers
                .iter()
                .filter_map(|r| r.get(slot).copied())
                .filter(|&t| t != 0)
                .collect();
            *histogram.entry(received.len()).or_insert(0) += 1;
            if !readers.is_empty() && received.len() == readers.len() {
                if let Some(last) = received.iter().max() {
                    if *last >= sent {
                        full_delivery.push((*last - sent) as u64);
                    }
                }
            }
        }

        report.push(MapPropagation {
            map_id,
            readers: readers.len(),
            versions_written: written,
            delivery_histogram: histogram,
            full_delivery: LatencyStats::from_samples(full_delivery)
                .ok()
                .map(|s| s.summary()),
        });
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::LocalTransport;

    #[test]
    fn test_percentile_nearest_rank() {
        let stats = LatencyStats::from_samples(vec![10, 20, 30, 40, 50]).unwrap();
        assert_eq!(stats.percentile(0.9).unwrap(), 50);
        assert_eq!(stats.percentile(0.0).unwrap(), 10);
        assert_eq!(stats.percentile(0.5).unwrap(), 30);
        assert_eq!(stats.percentile(1.0).unwrap(), 50);
        assert!(stats.percentile(1.5).is_err());
    }

    #[test]
    fn test_mean_and_population_std_dev() {
        let stats = LatencyStats::from_samples(vec![5, 1, 4, 2, 3]).unwrap();
        assert_eq!(stats.samples(), &[1, 2, 3, 4, 5]);
        assert_eq!(stats.mean(), 3.0);
        assert!((stats.std_dev() - 2f64.sqrt()).abs() < 1e-9);
        assert_eq!(stats.min(), 1);
        assert_eq!(stats.max(), 5);
    }

    #[test]
    fn test_summary_percentiles() {
        let summary = LatencyStats::from_samples((1..=100).collect()).unwrap().summary();
        assert_eq!(summary.count, 100);
        assert_eq!(summary.p50_ns, 51);
        assert_eq!(summary.p90_ns, 91);
        assert_eq!(summary.p95_ns, 96);
        assert_eq!(summary.p99_ns, 100);
        assert_eq!(summary.p9999_ns, 100);
    }

    #[test]
    fn test_empty_sample_set_is_an_error() {
        assert_eq!(
            LatencyStats::from_samples(Vec::new()).unwrap_err(),
            StatsError::EmptySampleSet
        );
    }

    #[test]
    fn test_propagation_report_histogram() {
        let roles = vec![
            Role::Writer { map_id: 0 },
            Role::Reader { map_id: 0 },
            Role::Reader { map_id: 0 },
            Role::Idle,
        ];
        let writer = [100, 200, 300];
        let first = [150, 260, 0];
        let second = [120, 0, 0];
        let idle = [0, 0, 0];
        let times: Vec<&[i64]> = vec![&writer, &first, &second, &idle];

        let report = propagation_report(&roles, &times, 3);
        assert_eq!(report.len(), 1);
        let map = &report[0];
        assert_eq!(map.readers, 2);
        assert_eq!(map.versions_written, 3);
        assert_eq!(map.delivery_histogram.get(&2), Some(&1));
        assert_eq!(map.delivery_histogram.get(&1), Some(&1));
        assert_eq!(map.delivery_histogram.get(&0), Some(&1));
        assert_eq!(map.full_delivery.as_ref().map(|s| s.max_ns), Some(50));
    }

    /// Uneven per-rank sample counts are padded, gathered and compacted
    #[tokio::test]
    async fn test_collect_compacts_uneven_samples() {
        let handles: Vec<_> = LocalTransport::group(3)
            .into_iter()
            .map(|transport| {
                tokio::spawn(async move {
                    let mut group = ProcessGroup::new(Box::new(transport), "localhost");
                    let rank = group.rank();
                    let outcome = match rank {
                        0 => NodeOutcome {
                            role: Role::Writer { map_id: 0 },
                            version_times_ns: vec![1_000, 2_000],
                            start_ns: Some(1_000),
                            end_ns: Some(2_000),
                            ..NodeOutcome::idle()
                        },
                        1 => NodeOutcome {
                            role: Role::Reader { map_id: 0 },
                            latencies_ns: vec![10, 30],
                            version_times_ns: vec![1_010, 2_030],
                            start_ns: Some(900),
                            end_ns: Some(2_100),
                            ..NodeOutcome::idle()
                        },
                        _ => NodeOutcome {
                            role: Role::Reader { map_id: 0 },
                            latencies_ns: vec![20],
                            version_times_ns: vec![1_020],
                            invalid_samples: 1,
                            missed_versions: 1,
                            ..NodeOutcome::idle()
                        },
                    };
                    ResultAggregator::new(2).collect(&mut group, &outcome).await
                })
            })
            .collect();

        let mut reports = Vec::new();
        for handle in handles {
            reports.push(handle.await.unwrap().unwrap());
        }
        assert!(reports[1].is_none());
        assert!(reports[2].is_none());

        let report = reports[0].clone().unwrap();
        assert_eq!(report.samples_per_rank, vec![0, 2, 1]);
        let latency = report.latency.unwrap();
        assert_eq!(latency.count, 3);
        assert_eq!(latency.mean_ns, 20.0);
        assert_eq!(report.wall_clock_ns, Some(1_200));
        assert_eq!(report.invalid_samples, 1);
        assert_eq!(report.missed_versions, 1);
        assert_eq!(report.propagation[0].delivery_histogram.get(&2), Some(&1));
        assert_eq!(report.propagation[0].delivery_histogram.get(&1), Some(&1));
    }
}
