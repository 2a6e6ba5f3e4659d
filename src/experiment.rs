//! # Latency Experiment
//!
//! Wires the pieces of one benchmark run together on a single rank:
//!
//! 1. check the role assignment against the actual group
//! 2. agree on the base name of the replicated structures
//! 3. generate the background key set cooperatively and share it
//! 4. open the probe channels, writers first, and build the node
//! 5. run the test cycle
//! 6. on the root, write the aggregate report
//!
//! Steps 2 to 4 use collectives, so every rank runs them in the same order.

use crate::aggregate::ResultAggregator;
use crate::bookkeeper::{read_log, Bookkeeper};
use crate::config::ExperimentConfig;
use crate::coordinator::{CycleOutcome, CyclePhase, PhaseFailure, TestCycleCoordinator};
use crate::distribution::BlockDistribution;
use crate::group::{ProcessGroup, ROOT_RANK};
use crate::node::{DummyNode, ReaderNode, Role, WorkloadNode, WriterNode};
use crate::results::{ResultsManager, RunReport};
use crate::store::{open_probe, ProbeChannel, StoreError, StoreProvider};
use crate::utils::current_timestamp_ms;
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// One latency benchmark over a shared store provider
pub struct LatencyExperiment {
    config: ExperimentConfig,
    provider: Arc<dyn StoreProvider>,
}

impl LatencyExperiment {
    pub fn new(config: ExperimentConfig, provider: Arc<dyn StoreProvider>) -> Self {
        Self { config, provider }
    }

    pub fn config(&self) -> &ExperimentConfig {
        &self.config
    }

    /// Run the experiment as this rank.
    ///
    /// Configuration errors are returned before any collective runs. After
    /// that, failures are recorded in the returned outcome instead.
    pub async fn run(&self, group: &mut ProcessGroup) -> Result<CycleOutcome> {
        self.config
            .roles
            .validate(group.size())
            .context("Role assignment does not fit the group")?;
        let role = self.config.roles.role_for(group.rank());
        debug!("Assigned role {}", role);

        let base_name = self.base_name(group).await?;
        let keys = self.distribute_keys(group).await?;
        let (mut node, open_failure) = self.build_node(group, role, &base_name, keys).await?;

        let bookkeeper = Bookkeeper::new(
            &self.config.log_dir,
            self.config.effective_tag(),
            group.identity(),
        );
        let coordinator = TestCycleCoordinator::new(
            self.config.setup_mode,
            ResultAggregator::new(self.config.write_count),
        );
        let mut outcome = coordinator
            .run_cycle(group, node.as_mut(), &bookkeeper)
            .await;
        if let Some(failure) = open_failure {
            outcome.failures.insert(0, failure);
        }

        let degraded = i64::from(outcome.degraded());
        let degraded_ranks = match group.reduce_sum(degraded, ROOT_RANK).await {
            Ok(count) => count,
            Err(e) => {
                warn!("Could not count degraded ranks: {}", e);
                degraded
            }
        };

        if group.is_root() {
            let mut report = RunReport::from_aggregate(
                bookkeeper.tag(),
                &self.config,
                outcome.aggregate.clone(),
                degraded_ranks > 0,
            );
            report.text("structure_base_name", base_name.as_str());
            report.integer("degraded_ranks", degraded_ranks);
            match log_reader_summaries(&bookkeeper) {
                Ok(count) => report.integer("reader_summaries", count as i64),
                Err(e) => warn!("Could not collect reader summaries: {:#}", e),
            }
            let manager = ResultsManager::new(&self.config.output_file)?;
            manager.print_summary(&report);
            manager.write(&report)?;
        }
        Ok(outcome)
    }

    /// Configured base name, or one generated by the root from its clock.
    async fn base_name(&self, group: &mut ProcessGroup) -> Result<String> {
        if let Some(name) = &self.config.map_name {
            return Ok(name.clone());
        }
        let stamp = current_timestamp_ms() as i64;
        let stamp = group
            .broadcast_value(stamp, ROOT_RANK)
            .await
            .context("Failed to agree on a structure name")?;
        Ok(format!("auto{}", stamp))
    }

    /// Every rank generates its share of the background keys; the shares are
    /// exchanged so all ranks hold the full key set.
    async fn distribute_keys(&self, group: &mut ProcessGroup) -> Result<Arc<Vec<i64>>> {
        let distribution =
            BlockDistribution::new(self.config.table_size, group.size(), group.rank())?;
        let local = distribution.generate_local_keys(&mut rand::thread_rng());
        let global = group
            .all_gather(&local)
            .await
            .context("Failed to exchange background keys")?;
        let keys = distribution.compacted(&global)?;
        debug!(
            "Generated {} of {} background keys",
            distribution.local_count(),
            keys.len()
        );
        Ok(Arc::new(keys))
    }

    /// Writers open their structures before readers subscribe to them.
    async fn build_node(
        &self,
        group: &mut ProcessGroup,
        role: Role,
        base_name: &str,
        keys: Arc<Vec<i64>>,
    ) -> Result<(Box<dyn WorkloadNode>, Option<PhaseFailure>)> {
        let writer_probe = match role {
            Role::Writer { map_id } => Some(self.open(base_name, map_id)),
            _ => None,
        };
        group
            .barrier()
            .await
            .context("Failed to synchronize after opening writer structures")?;
        let reader_probe = match role {
            Role::Reader { map_id } => Some(self.open(base_name, map_id)),
            _ => None,
        };

        let node: Box<dyn WorkloadNode> = match (role, writer_probe.or(reader_probe)) {
            (Role::Writer { map_id }, Some(Ok(probe))) => Box::new(WriterNode::new(
                map_id,
                probe,
                keys,
                self.config.writer_config(),
            )),
            (Role::Reader { map_id }, Some(Ok(probe))) => {
                Box::new(ReaderNode::new(map_id, probe, self.config.reader_config()))
            }
            (_, Some(Err(e))) => {
                error!("Failed to open structure for {}: {}", role, e);
                let failure = PhaseFailure {
                    phase: CyclePhase::Start,
                    message: format!("open structure failed: {}", e),
                };
                let placeholder: Box<dyn WorkloadNode> = Box::new(DummyNode);
                return Ok((placeholder, Some(failure)));
            }
            _ => Box::new(DummyNode),
        };
        if role != Role::Idle {
            info!("Participating as {}", role);
        }
        Ok((node, None))
    }

    fn open(&self, base_name: &str, map_id: usize) -> Result<Arc<dyn ProbeChannel>, StoreError> {
        let name = format!("{}-{}", base_name, map_id);
        open_probe(self.provider.as_ref(), self.config.storage, &name)
    }
}

/// Log the headline of every reader's `summary` log. The final barrier of
/// the cycle has passed, so every participant sharing this log directory has
/// written its logs by now.
fn log_reader_summaries(bookkeeper: &Bookkeeper) -> Result<usize> {
    let paths = bookkeeper.paths_to_all_logs("summary")?;
    for path in &paths {
        let participant = path
            .parent()
            .and_then(|dir| dir.file_name())
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        let contents = read_log(path)?;
        let headline: Vec<&str> = contents
            .lines()
            .skip(1)
            .filter(|line| !line.starts_with("hdr "))
            .collect();
        info!("{}: {}", participant, headline.join(", "));
    }
    Ok(paths.len())
}
