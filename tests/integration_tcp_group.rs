use anyhow::{anyhow, Result};
use replica_bench::{
    cli::{StorageType, TransportKind},
    config::ExperimentConfig,
    coordinator::RoleAssignment,
    experiment::LatencyExperiment,
    group::{tcp::TcpOptions, GroupTransport, ProcessGroup, TcpTransport},
    store::{InMemoryStoreHub, StoreProvider},
};
use std::sync::Arc;
use std::time::Duration;

async fn loopback_group(size: usize) -> Result<Vec<Box<dyn GroupTransport>>> {
    let options = TcpOptions {
        connect_timeout: Duration::from_secs(5),
        ..TcpOptions::default()
    };
    let listener = TcpTransport::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;

    let root = {
        let options = options.clone();
        tokio::spawn(async move { TcpTransport::accept(listener, size, &options).await })
    };
    let mut peers = Vec::new();
    for rank in 1..size {
        let options = options.clone();
        peers.push(tokio::spawn(async move {
            TcpTransport::connect(addr, rank, size, &options).await
        }));
    }

    let mut transports: Vec<Box<dyn GroupTransport>> = vec![Box::new(root.await??)];
    for peer in peers {
        transports.push(Box::new(peer.await??));
    }
    Ok(transports)
}

/// Collectives work across loopback TCP connections
#[tokio::test]
async fn tcp_collectives_smoke() -> Result<()> {
    let handles: Vec<_> = loopback_group(3)
        .await?
        .into_iter()
        .map(|transport| {
            tokio::spawn(async move {
                let mut group = ProcessGroup::new(transport, "tcphost");
                let rank = group.rank() as i64;
                group.barrier().await?;
                let shared = group.broadcast_value(42, 0).await?;
                let everyone = group.all_gather(&[rank, rank * 10]).await?;
                let total = group.reduce_sum(rank, 0).await?;
                group.close().await?;
                Ok::<_, anyhow::Error>((shared, everyone, total))
            })
        })
        .collect();

    for (rank, handle) in handles.into_iter().enumerate() {
        let (shared, everyone, total) = handle.await??;
        assert_eq!(shared, 42);
        assert_eq!(everyone, vec![0, 0, 1, 10, 2, 20]);
        if rank == 0 {
            assert_eq!(total, 3);
        }
    }
    Ok(())
}

/// A full latency run over the TCP transport
#[tokio::test]
async fn tcp_latency_run() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let config = ExperimentConfig {
        storage: StorageType::RoutingTable,
        transport: TransportKind::Tcp,
        group_size: 3,
        roles: RoleAssignment {
            maps: 1,
            readers_per_map: 1,
        },
        table_size: 30,
        write_count: 10,
        warmup_count: 2,
        write_rate: 50.0,
        interval: Duration::from_millis(20),
        read_timeout: Duration::from_secs(5),
        propagation_delay: Duration::from_millis(1),
        log_dir: dir.path().join("logs"),
        output_file: dir.path().join("results.json"),
        ..ExperimentConfig::default()
    };
    let provider: Arc<dyn StoreProvider> =
        Arc::new(InMemoryStoreHub::new(config.propagation_delay));

    let handles: Vec<_> = loopback_group(config.group_size)
        .await?
        .into_iter()
        .map(|transport| {
            let experiment = LatencyExperiment::new(config.clone(), Arc::clone(&provider));
            tokio::spawn(async move {
                let mut group = ProcessGroup::new(transport, "tcphost");
                let outcome = experiment.run(&mut group).await;
                group.close().await?;
                outcome
            })
        })
        .collect();

    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await??);
    }
    let report = outcomes[0]
        .aggregate
        .clone()
        .ok_or_else(|| anyhow!("root produced no aggregate report"))?;
    assert_eq!(report.participants, 3);
    assert_eq!(report.samples_per_rank[0], 0);
    assert_eq!(report.samples_per_rank[2], 0);
    assert_eq!(
        report.samples_per_rank[1] as u64 + report.missed_versions,
        10
    );
    assert!(config.output_file.is_file());
    Ok(())
}
