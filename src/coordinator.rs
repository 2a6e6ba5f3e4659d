//! # Test Cycle Coordinator
//!
//! Drives one participant through a test cycle in lock step with the rest of
//! the group:
//!
//! ```text
//! Start -> barrier -> Setup -> barrier -> Measurement -> barrier
//!       -> Shutdown -> Report -> ResultAggregation -> barrier -> Finished
//! ```
//!
//! Every rank executes the same sequence of collectives, including ranks
//! whose node failed. A failing step is logged and recorded as a
//! [`PhaseFailure`]; the cycle keeps going so the other ranks are not left
//! waiting in a barrier. A collective that never completes (a peer died
//! without closing its connection) still blocks forever.
//!
//! ## Throttled setup
//!
//! Populating many replicated structures at once can swamp the store, so by
//! default participants set up one at a time: a counter starts at 0, the
//! rank equal to the counter runs its setup, everybody meets at a barrier and
//! the root broadcasts the incremented counter.

use crate::aggregate::{AggregateReport, ResultAggregator};
use crate::bookkeeper::Bookkeeper;
use crate::cli::SetupMode;
use crate::config::ConfigError;
use crate::group::{ProcessGroup, ROOT_RANK};
use crate::node::{NodeLifecycle, NodeOutcome, NodeState, Role, WorkloadNode};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use tracing::{debug, error, info};

/// How ranks are mapped to writers and readers
///
/// Ranks come in blocks of `1 + readers_per_map`, one block per structure:
/// the first rank of a block writes, the others read. Ranks past the last
/// block are idle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleAssignment {
    pub maps: usize,
    pub readers_per_map: usize,
}

impl RoleAssignment {
    fn block(&self) -> usize {
        1 + self.readers_per_map
    }

    /// Ranks needed to fill every role.
    pub fn required(&self) -> usize {
        self.maps * self.block()
    }

    pub fn validate(&self, group_size: usize) -> Result<(), ConfigError> {
        if self.required() > group_size {
            return Err(ConfigError::NotEnoughNodes {
                required: self.required(),
                available: group_size,
            });
        }
        Ok(())
    }

    pub fn role_for(&self, rank: usize) -> Role {
        if rank >= self.required() {
            return Role::Idle;
        }
        let map_id = rank / self.block();
        if rank % self.block() == 0 {
            Role::Writer { map_id }
        } else {
            Role::Reader { map_id }
        }
    }
}

/// Steps of a test cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CyclePhase {
    Start,
    Setup,
    Measurement,
    Shutdown,
    Report,
    ResultAggregation,
    Finished,
}

impl std::fmt::Display for CyclePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CyclePhase::Start => "start",
            CyclePhase::Setup => "setup",
            CyclePhase::Measurement => "measurement",
            CyclePhase::Shutdown => "shutdown",
            CyclePhase::Report => "report",
            CyclePhase::ResultAggregation => "result aggregation",
            CyclePhase::Finished => "finish",
        };
        f.write_str(name)
    }
}

/// A step that failed on this rank
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseFailure {
    pub phase: CyclePhase,
    pub message: String,
}

/// What one rank got out of a test cycle
#[derive(Debug, Clone)]
pub struct CycleOutcome {
    pub failures: Vec<PhaseFailure>,
    /// Present on the root when aggregation succeeded
    pub aggregate: Option<AggregateReport>,
    pub node: NodeOutcome,
}

impl CycleOutcome {
    /// Whether any step failed on this rank.
    pub fn degraded(&self) -> bool {
        !self.failures.is_empty()
    }
}

pub struct TestCycleCoordinator {
    setup_mode: SetupMode,
    aggregator: ResultAggregator,
    lifecycle: NodeLifecycle,
    failures: Vec<PhaseFailure>,
}

impl TestCycleCoordinator {
    pub fn new(setup_mode: SetupMode, aggregator: ResultAggregator) -> Self {
        Self {
            setup_mode,
            aggregator,
            lifecycle: NodeLifecycle::new(),
            failures: Vec::new(),
        }
    }

    /// Run the full cycle for `node`. Never returns early: failures end up
    /// in [`CycleOutcome::failures`].
    pub async fn run_cycle(
        mut self,
        group: &mut ProcessGroup,
        node: &mut dyn WorkloadNode,
        bookkeeper: &Bookkeeper,
    ) -> CycleOutcome {
        status(group, &format!("Starting test cycle as {}", node.role()));
        let result = group.barrier().await;
        self.check(CyclePhase::Start, "start barrier", result);

        self.enter(CyclePhase::Setup, NodeState::ReadyForMeasurement);
        match self.setup_mode {
            SetupMode::Parallel => {
                status(group, "Setting up");
                let result = node.setup().await;
                self.check(CyclePhase::Setup, "node setup", result);
            }
            SetupMode::Throttled => self.throttled_setup(group, node).await,
        }
        let result = group.barrier().await;
        self.check(CyclePhase::Setup, "setup barrier", result);

        status(group, "Starting measurement");
        self.enter(CyclePhase::Measurement, NodeState::Measured);
        let result = node.run().await;
        self.check(CyclePhase::Measurement, "node run", result);
        let result = group.barrier().await;
        self.check(CyclePhase::Measurement, "measurement barrier", result);

        status(group, "Shutting down");
        self.enter(CyclePhase::Shutdown, NodeState::Closed);
        let result = node.shutdown().await;
        self.check(CyclePhase::Shutdown, "node shutdown", result);

        self.enter(CyclePhase::Report, NodeState::Done);
        let result = node.report(bookkeeper);
        self.check(CyclePhase::Report, "node report", result);

        status(group, "Aggregating results");
        let outcome = node.outcome();
        let result = self.aggregator.collect(group, &outcome).await;
        let aggregate = self
            .check(CyclePhase::ResultAggregation, "result aggregation", result)
            .flatten();

        let result = group.barrier().await;
        self.check(CyclePhase::Finished, "final barrier", result);
        status(group, &format!("Finished on {}", group.identity()));

        CycleOutcome {
            failures: self.failures,
            aggregate,
            node: outcome,
        }
    }

    async fn throttled_setup(&mut self, group: &mut ProcessGroup, node: &mut dyn WorkloadNode) {
        let mut counter = 0usize;
        while counter < group.size() {
            if counter == group.rank() {
                debug!("Setting up ({} of {})", counter + 1, group.size());
                let result = node.setup().await;
                self.check(CyclePhase::Setup, "node setup", result);
            }
            let result = group.barrier().await;
            self.check(CyclePhase::Setup, "throttle barrier", result);

            let next = counter as i64 + 1;
            let result = group.broadcast_value(next, ROOT_RANK).await;
            counter = match self.check(CyclePhase::Setup, "throttle broadcast", result) {
                Some(value) => usize::try_from(value).unwrap_or(counter + 1),
                None => counter + 1,
            };
            if group.is_root() {
                info!(target: "status", "Setup {} of {} done", counter, group.size());
            }
        }
    }

    fn enter(&mut self, phase: CyclePhase, state: NodeState) {
        let result = self.lifecycle.advance(state);
        self.check(phase, "lifecycle", result);
    }

    fn check<T, E: Display>(&mut self, phase: CyclePhase, step: &str, result: Result<T, E>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                let message = format!("{} failed: {:#}", step, e);
                error!("{} phase: {}", phase, message);
                self.failures.push(PhaseFailure { phase, message });
                None
            }
        }
    }
}

/// Every rank logs status at debug level; the root also reports it.
fn status(group: &ProcessGroup, message: &str) {
    debug!("{}", message);
    if group.is_root() {
        info!(target: "status", "{}", message);
    }
}
