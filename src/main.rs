//! # Replica Bench - Main Entry Point
//!
//! Launches every participant of one benchmark run inside this process:
//!
//! 1. **Initialize logging**: colorized console output, optional log file
//! 2. **Parse arguments**: command line into a validated configuration
//! 3. **Connect the group**: in-process channels or loopback TCP
//! 4. **Run the ranks**: one task per rank, each inside a `rank` span,
//!    all sharing one in-memory store
//! 5. **Report**: the root writes the aggregate JSON report; every rank
//!    writes its own logs under the log directory
//!
//! ## Error Handling
//!
//! Configuration errors stop the run before any rank starts. Failures inside
//! a test cycle are recorded per rank and reported at the end; the process
//! exits with an error when any rank could not complete its cycle.

use anyhow::{anyhow, Result};
use clap::Parser;
use replica_bench::{
    cli::{Args, TransportKind},
    config::ExperimentConfig,
    experiment::LatencyExperiment,
    group::{tcp::TcpOptions, GroupTransport, LocalTransport, ProcessGroup, TcpTransport},
    logging::init_logging,
    store::{InMemoryStoreHub, StoreProvider},
    utils::host_name,
    VERSION,
};
use std::sync::Arc;
use tracing::{debug, error, info, info_span, warn, Instrument};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    // Keep the guard alive so the file appender flushes on exit.
    let _log_guard = init_logging(args.verbose, args.log_file.as_deref())?;

    info!("Starting Replica Bench {}", VERSION);
    debug!("Configuration: {:?}", args);

    let config = ExperimentConfig::from_args(&args)?;
    info!(
        "{} ranks ({} CPUs available): {} with {} map(s) x {} reader(s), {} writes at {}/s",
        config.group_size,
        num_cpus::get(),
        config.storage,
        config.roles.maps,
        config.roles.readers_per_map,
        config.write_count,
        config.write_rate
    );

    let provider: Arc<dyn StoreProvider> =
        Arc::new(InMemoryStoreHub::new(config.propagation_delay));
    let transports = connect_group(&config).await?;

    let host = host_name();
    let mut handles = Vec::with_capacity(transports.len());
    for transport in transports {
        let rank = transport.rank();
        let experiment = LatencyExperiment::new(config.clone(), Arc::clone(&provider));
        let host = host.clone();
        let task = async move {
            let mut group = ProcessGroup::new(transport, host);
            let outcome = experiment.run(&mut group).await;
            if let Err(e) = group.close().await {
                warn!("Failed to close group transport: {}", e);
            }
            outcome
        };
        handles.push((rank, tokio::spawn(task.instrument(info_span!("rank", rank)))));
    }

    let mut failed = 0;
    let mut degraded = 0;
    for (rank, handle) in handles {
        match handle.await {
            Ok(Ok(outcome)) => {
                if outcome.degraded() {
                    degraded += 1;
                    for failure in &outcome.failures {
                        warn!("Rank {} {} phase: {}", rank, failure.phase, failure.message);
                    }
                }
            }
            Ok(Err(e)) => {
                failed += 1;
                error!("Rank {} failed: {:#}", rank, e);
            }
            Err(e) => {
                failed += 1;
                error!("Rank {} task panicked: {}", rank, e);
            }
        }
    }

    info!(
        "Per-participant logs are under {}",
        config.log_dir.join(config.effective_tag()).display()
    );
    if failed > 0 {
        return Err(anyhow!("{} of {} ranks failed", failed, config.group_size));
    }
    if degraded > 0 {
        warn!("{} of {} ranks completed with phase failures", degraded, config.group_size);
    }
    info!("Replica Bench completed");
    Ok(())
}

/// Build one transport per rank, in rank order.
async fn connect_group(config: &ExperimentConfig) -> Result<Vec<Box<dyn GroupTransport>>> {
    let size = config.group_size;
    match config.transport {
        TransportKind::Local => Ok(LocalTransport::group(size)
            .into_iter()
            .map(|t| Box::new(t) as Box<dyn GroupTransport>)
            .collect()),
        TransportKind::Tcp => {
            let options = TcpOptions {
                connect_timeout: config.connect_timeout,
                ..TcpOptions::default()
            };
            let listener = TcpTransport::bind(&format!("{}:{}", config.host, config.port)).await?;
            let addr = listener.local_addr()?;
            info!("Root listening on {}", addr);

            let root = {
                let options = options.clone();
                tokio::spawn(async move { TcpTransport::accept(listener, size, &options).await })
            };
            let peers: Vec<_> = (1..size)
                .map(|rank| {
                    let options = options.clone();
                    tokio::spawn(async move { TcpTransport::connect(addr, rank, size, &options).await })
                })
                .collect();

            let mut transports: Vec<Box<dyn GroupTransport>> = Vec::with_capacity(size);
            transports.push(Box::new(root.await??));
            for peer in peers {
                transports.push(Box::new(peer.await??));
            }
            Ok(transports)
        }
    }
}
