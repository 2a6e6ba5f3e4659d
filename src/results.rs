use crate::aggregate::{AggregateReport, LatencySummary};
use crate::config::ExperimentConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::info;

/// Value of a named metric
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetricValue {
    Integer(i64),
    Real(f64),
    Text(String),
}

impl std::fmt::Display for MetricValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetricValue::Integer(v) => write!(f, "{}", v),
            MetricValue::Real(v) => write!(f, "{:.3}", v),
            MetricValue::Text(v) => write!(f, "{}", v),
        }
    }
}

/// One named metric attached to a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub name: String,
    pub value: MetricValue,
}

/// Ordered metrics of one benchmark run, as written by the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub tag: String,
    pub version: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub degraded: bool,
    pub metrics: Vec<MetricRecord>,
    pub aggregate: Option<AggregateReport>,
}

impl RunReport {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            version: crate::VERSION.to_string(),
            timestamp: chrono::Utc::now(),
            degraded: false,
            metrics: Vec::new(),
            aggregate: None,
        }
    }

    pub fn push(&mut self, name: impl Into<String>, value: MetricValue) {
        self.metrics.push(MetricRecord {
            name: name.into(),
            value,
        });
    }

    pub fn integer(&mut self, name: impl Into<String>, value: i64) {
        self.push(name, MetricValue::Integer(value));
    }

    pub fn real(&mut self, name: impl Into<String>, value: f64) {
        self.push(name, MetricValue::Real(value));
    }

    pub fn text(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.push(name, MetricValue::Text(value.into()));
    }

    /// First metric called `name`.
    pub fn get(&self, name: &str) -> Option<&MetricValue> {
        self.metrics.iter().find(|m| m.name == name).map(|m| &m.value)
    }

    /// Build the root's report from the configuration and aggregate results.
    pub fn from_aggregate(
        tag: &str,
        config: &ExperimentConfig,
        aggregate: Option<AggregateReport>,
        degraded: bool,
    ) -> Self {
        let mut report = Self::new(tag);
        report.degraded = degraded;
        report.text("storage", config.storage.to_string());
        report.integer("group_size", config.group_size as i64);
        report.integer("maps", config.roles.maps as i64);
        report.integer("readers_per_map", config.roles.readers_per_map as i64);
        report.integer("table_size", config.table_size as i64);
        report.integer("write_count", config.write_count as i64);
        report.real("write_rate", config.write_rate);

        if let Some(aggregate) = &aggregate {
            report.integer("participants", aggregate.participants as i64);
            report.integer(
                "total_samples",
                aggregate.samples_per_rank.iter().sum::<usize>() as i64,
            );
            if let Some(latency) = &aggregate.latency {
                push_latency(&mut report, "latency", latency);
            }
            if let Some(wall) = aggregate.wall_clock_ns {
                report.integer("wall_clock_ns", wall as i64);
            }
            report.integer("invalid_samples", aggregate.invalid_samples as i64);
            report.integer("missed_versions", aggregate.missed_versions as i64);
            report.integer("store_failures", aggregate.store_failures as i64);
            for map in &aggregate.propagation {
                if let Some(full) = &map.full_delivery {
                    push_latency(&mut report, &format!("map{}_full_delivery", map.map_id), full);
                }
            }
        }
        report.aggregate = aggregate;
        report
    }
}

fn push_latency(report: &mut RunReport, prefix: &str, latency: &LatencySummary) {
    report.integer(format!("{}_count", prefix), latency.count as i64);
    report.real(format!("{}_mean_ns", prefix), latency.mean_ns);
    report.real(format!("{}_stdev_ns", prefix), latency.std_dev_ns);
    report.integer(format!("{}_p90_ns", prefix), latency.p90_ns as i64);
    report.integer(format!("{}_p95_ns", prefix), latency.p95_ns as i64);
    report.integer(format!("{}_p99_ns", prefix), latency.p99_ns as i64);
    report.integer(format!("{}_p9999_ns", prefix), latency.p9999_ns as i64);
}

/// Writes run reports to the JSON output file
pub struct ResultsManager {
    output_file: PathBuf,
}

impl ResultsManager {
    /// Create a new results manager
    pub fn new(output_file: &Path) -> Result<Self> {
        Ok(Self {
            output_file: output_file.to_path_buf(),
        })
    }

    /// Write `report` as pretty-printed JSON.
    pub fn write(&self, report: &RunReport) -> Result<()> {
        if let Some(parent) = self.output_file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create output directory {}", parent.display())
                })?;
            }
        }
        let json = serde_json::to_string_pretty(report)?;
        let mut file = File::create(&self.output_file).with_context(|| {
            format!("Failed to create output file {}", self.output_file.display())
        })?;
        file.write_all(json.as_bytes())?;
        info!("Results written to {}", self.output_file.display());
        Ok(())
    }

    /// Log the report's metrics, one per line.
    pub fn print_summary(&self, report: &RunReport) {
        info!("=== Results for {} ===", report.tag);
        if report.degraded {
            info!("Run was degraded: some participants reported phase failures");
        }
        for metric in &report.metrics {
            info!("  {:<28} {}", metric.name, metric.value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_keep_insertion_order() {
        let mut report = RunReport::new("tag");
        report.integer("b", 2);
        report.real("a", 1.5);
        report.text("c", "x");
        let names: Vec<&str> = report.metrics.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, vec!["b", "a", "c"]);
        assert_eq!(report.get("a"), Some(&MetricValue::Real(1.5)));
        assert_eq!(report.get("missing"), None);
    }

    #[test]
    fn test_write_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out/results.json");
        let mut report = RunReport::new("tag");
        report.integer("samples", 50);

        ResultsManager::new(&path).unwrap().write(&report).unwrap();

        let parsed: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(parsed["tag"], "tag");
        assert_eq!(parsed["metrics"][0]["name"], "samples");
        assert_eq!(parsed["metrics"][0]["value"], 50);
    }

    #[test]
    fn test_from_aggregate_without_results() {
        let config = ExperimentConfig::default();
        let report = RunReport::from_aggregate("tag", &config, None, true);
        assert!(report.degraded);
        assert!(report.get("latency_mean_ns").is_none());
        assert_eq!(
            report.get("storage"),
            Some(&MetricValue::Text(config.storage.to_string()))
        );
    }
}
