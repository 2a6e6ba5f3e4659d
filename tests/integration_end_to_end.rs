use anyhow::{anyhow, Result};
use replica_bench::{
    cli::{SetupMode, StorageType},
    config::ExperimentConfig,
    coordinator::{CycleOutcome, RoleAssignment},
    experiment::LatencyExperiment,
    group::{LocalTransport, ProcessGroup},
    node::Role,
    store::{InMemoryStoreHub, StoreProvider},
};
use std::sync::Arc;
use std::time::Duration;

async fn run_local(config: ExperimentConfig) -> Result<Vec<CycleOutcome>> {
    let provider: Arc<dyn StoreProvider> =
        Arc::new(InMemoryStoreHub::new(config.propagation_delay));
    let handles: Vec<_> = LocalTransport::group(config.group_size)
        .into_iter()
        .map(|transport| {
            let experiment = LatencyExperiment::new(config.clone(), Arc::clone(&provider));
            tokio::spawn(async move {
                let mut group = ProcessGroup::new(Box::new(transport), "testhost");
                experiment.run(&mut group).await
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    Ok(outcomes)
}

/// One writer, two readers and one idle rank over an ARP merged map.
///
/// Writes are 100ms apart and the store delays by 1ms, so every measured
/// version reaches both readers and each reader records exactly one sample
/// per write.
#[tokio::test]
async fn four_rank_latency_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ExperimentConfig {
        storage: StorageType::ArpMergedMap,
        group_size: 4,
        roles: RoleAssignment {
            maps: 1,
            readers_per_map: 2,
        },
        table_size: 100,
        write_count: 50,
        warmup_count: 3,
        write_rate: 10.0,
        interval: Duration::from_millis(100),
        read_timeout: Duration::from_secs(5),
        setup_mode: SetupMode::Throttled,
        propagation_delay: Duration::from_millis(1),
        map_name: Some("e2e".to_string()),
        tag: Some("e2e".to_string()),
        log_dir: dir.path().join("logs"),
        output_file: dir.path().join("results.json"),
        ..ExperimentConfig::default()
    };

    let outcomes = run_local(config.clone()).await?;
    assert_eq!(outcomes.len(), 4);
    for outcome in &outcomes {
        assert!(!outcome.degraded(), "failures: {:?}", outcome.failures);
    }

    let roles: Vec<Role> = outcomes.iter().map(|o| o.node.role).collect();
    assert_eq!(
        roles,
        vec![
            Role::Writer { map_id: 0 },
            Role::Reader { map_id: 0 },
            Role::Reader { map_id: 0 },
            Role::Idle
        ]
    );
    for reader in &outcomes[1..3] {
        assert_eq!(reader.node.latencies_ns.len(), 50);
        assert_eq!(reader.node.missed_versions, 0);
        assert_eq!(reader.node.invalid_samples, 0);
    }
    assert!(outcomes[3].node.latencies_ns.is_empty());

    let report = outcomes[0]
        .aggregate
        .clone()
        .ok_or_else(|| anyhow!("root produced no aggregate report"))?;
    assert!(outcomes[1..].iter().all(|o| o.aggregate.is_none()));
    assert_eq!(report.samples_per_rank, vec![0, 50, 50, 0]);
    assert_eq!(report.invalid_samples, 0);

    let latency = report
        .latency
        .ok_or_else(|| anyhow!("no latency statistics"))?;
    let wall_clock = report
        .wall_clock_ns
        .ok_or_else(|| anyhow!("no wall-clock time"))?;
    assert_eq!(latency.count, 100);
    assert!(latency.mean_ns > 0.0);
    assert!(latency.mean_ns < wall_clock as f64);
    assert!(latency.min_ns <= latency.p50_ns && latency.p50_ns <= latency.max_ns);

    let propagation = &report.propagation[0];
    assert_eq!(propagation.versions_written, 50);
    assert_eq!(propagation.delivery_histogram.get(&2), Some(&50));

    let results: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&config.output_file)?)?;
    assert_eq!(results["tag"], "e2e");
    assert_eq!(results["degraded"], false);
    let summaries = results["metrics"]
        .as_array()
        .and_then(|metrics| metrics.iter().find(|m| m["name"] == "reader_summaries"))
        .ok_or_else(|| anyhow!("no reader_summaries metric"))?;
    assert_eq!(summaries["value"], 2);

    let raw = std::fs::read_to_string(dir.path().join("logs/e2e/testhost-1/raw-latency-data"))?;
    assert_eq!(raw.lines().count(), 50);
    let summary = std::fs::read_to_string(dir.path().join("logs/e2e/testhost-2/summary"))?;
    assert!(summary.starts_with("HOST: testhost DATE: "));
    assert!(dir
        .path()
        .join("logs/e2e/testhost-0/write-summary")
        .is_file());
    Ok(())
}

/// Two structures set up in parallel; every structure gets its own writer.
#[tokio::test]
async fn two_maps_parallel_setup() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ExperimentConfig {
        storage: StorageType::MacTable,
        group_size: 4,
        roles: RoleAssignment {
            maps: 2,
            readers_per_map: 1,
        },
        table_size: 20,
        write_count: 10,
        warmup_count: 2,
        write_rate: 50.0,
        interval: Duration::from_millis(20),
        read_timeout: Duration::from_secs(5),
        setup_mode: SetupMode::Parallel,
        propagation_delay: Duration::ZERO,
        log_dir: dir.path().join("logs"),
        output_file: dir.path().join("results.json"),
        ..ExperimentConfig::default()
    };

    let outcomes = run_local(config).await?;
    let report = outcomes[0]
        .aggregate
        .clone()
        .ok_or_else(|| anyhow!("root produced no aggregate report"))?;
    assert_eq!(report.propagation.len(), 2);
    for (map_id, map) in report.propagation.iter().enumerate() {
        assert_eq!(map.map_id, map_id);
        assert_eq!(map.readers, 1);
        assert_eq!(map.versions_written, 10);
    }
    for reader in [&outcomes[1], &outcomes[3]] {
        let seen = reader.node.latencies_ns.len() as u64 + reader.node.missed_versions;
        assert_eq!(seen, 10);
    }
    Ok(())
}
