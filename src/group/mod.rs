//! # Process Group Collectives
//!
//! This module provides the collective operations every other layer of the
//! harness is built on: barrier, broadcast, gather, all-gather and typed
//! min/max/sum reductions, plus identifier variants for 128-bit UUIDs.
//!
//! ## Architecture
//!
//! Collectives are expressed on top of a small point-to-point abstraction,
//! the [`GroupTransport`] trait, so the same protocol runs over an in-process
//! channel mesh ([`LocalTransport`]) or TCP connections ([`TcpTransport`]).
//!
//! Every collective is a star exchange through the root rank (rank 0):
//!
//! 1. Each non-root rank sends one [`Frame`] carrying its contribution.
//! 2. The root collects the contributions in rank order and checks that all of
//!    them name the same operation and sequence number.
//! 3. The root combines the contributions and sends each rank its reply.
//!
//! Sequence numbers advance by one per collective on every rank, so a rank
//! that skipped or repeated a collective is detected as out of step instead
//! of silently mixing data from two different operations.
//!
//! ## Failure Semantics
//!
//! A transport failure surfaces as a [`GroupError`]. The caller decides what
//! to do with it; the test-cycle coordinator logs it and keeps walking to the
//! next barrier. There is no cancellation: a peer that never arrives stalls
//! every other rank in the collective until the process is killed.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::{debug, trace, warn};
use uuid::Uuid;

pub mod local;
pub mod tcp;

pub use local::LocalTransport;
pub use tcp::TcpTransport;

/// Rank that coordinates every collective and owns aggregate results.
pub const ROOT_RANK: usize = 0;

/// Errors raised by collectives and transports
#[derive(Debug, Error)]
pub enum GroupError {
    #[error("peer {0} disconnected")]
    Disconnected(usize),

    #[error("rank {rank} is out of step: expected {expected}, got {actual}")]
    OutOfStep {
        rank: usize,
        expected: String,
        actual: String,
    },

    #[error("collective failed: {0}")]
    Collective(String),

    #[error("invalid rank {rank} for a group of {size}")]
    InvalidRank { rank: usize, size: usize },

    #[error("frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("timed out: {0}")]
    Timeout(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
}

/// Identity of one participant in the group, fixed for the run's lifetime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIdentity {
    pub rank: usize,
    pub group_size: usize,
    pub host_name: String,
}

impl ProcessIdentity {
    pub fn is_root(&self) -> bool {
        self.rank == ROOT_RANK
    }

    /// Label used for per-participant log directories, e.g. `node7-3`.
    pub fn host_label(&self) -> String {
        format!("{}-{}", self.host_name, self.rank)
    }
}

impl fmt::Display for ProcessIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({},{})", self.host_name, self.rank, self.group_size)
    }
}

/// Collective operation a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveOp {
    /// Connection handshake, carries the sender's rank
    Hello,
    Barrier,
    Broadcast,
    Gather,
    AllGather,
    ReduceMin,
    ReduceMax,
    ReduceSum,
}

/// Data carried by a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    Empty,
    Words(Vec<i64>),
    Reals(Vec<f64>),
    /// The root could not complete the collective
    Failure(String),
}

impl Payload {
    fn kind(&self) -> &'static str {
        match self {
            Payload::Empty => "empty",
            Payload::Words(_) => "words",
            Payload::Reals(_) => "reals",
            Payload::Failure(_) => "failure",
        }
    }
}

/// Unit of exchange between two ranks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub op: CollectiveOp,
    pub sequence: u64,
    pub payload: Payload,
}

impl Frame {
    pub fn new(op: CollectiveOp, sequence: u64, payload: Payload) -> Self {
        Self {
            op,
            sequence,
            payload,
        }
    }

    /// Serialize the frame to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>, GroupError> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize bytes to a frame
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GroupError> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Point-to-point transport underneath the collectives
///
/// Implementations deliver frames between a fixed set of ranks established
/// at construction. Frames between a given pair of ranks must arrive in the
/// order they were sent.
#[async_trait]
pub trait GroupTransport: Send + Sync {
    /// Rank of the local participant
    fn rank(&self) -> usize;

    /// Number of participants
    fn size(&self) -> usize;

    /// Send a frame to `peer`
    async fn send(&mut self, peer: usize, frame: &Frame) -> Result<(), GroupError>;

    /// Receive the next frame sent by `peer`
    async fn receive(&mut self, peer: usize) -> Result<Frame, GroupError>;

    /// Close the transport
    async fn close(&mut self) -> Result<(), GroupError>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;
}

/// Collective operations over a [`GroupTransport`]
pub struct ProcessGroup {
    transport: Box<dyn GroupTransport>,
    identity: ProcessIdentity,
    sequence: u64,
}

impl ProcessGroup {
    /// Wrap a connected transport. Rank and size are read once here.
    pub fn new(transport: Box<dyn GroupTransport>, host_name: impl Into<String>) -> Self {
        let identity = ProcessIdentity {
            rank: transport.rank(),
            group_size: transport.size(),
            host_name: host_name.into(),
        };
        debug!(
            "Process group ready over {}: {}",
            transport.name(),
            identity
        );
        Self {
            transport,
            identity,
            sequence: 0,
        }
    }

    pub fn identity(&self) -> &ProcessIdentity {
        &self.identity
    }

    pub fn rank(&self) -> usize {
        self.identity.rank
    }

    pub fn size(&self) -> usize {
        self.identity.group_size
    }

    pub fn is_root(&self) -> bool {
        self.identity.is_root()
    }

    pub fn transport_name(&self) -> &'static str {
        self.transport.name()
    }

    /// Block until every rank has entered the barrier.
    pub async fn barrier(&mut self) -> Result<(), GroupError> {
        let size = self.size();
        self.exchange(CollectiveOp::Barrier, Payload::Empty, move |_| {
            Ok(vec![Payload::Empty; size])
        })
        .await?;
        Ok(())
    }

    /// Distribute `source`'s values to every rank.
    ///
    /// Non-source ranks pass a placeholder (typically an empty slice) and
    /// receive the source's values.
    pub async fn broadcast(&mut self, values: &[i64], source: usize) -> Result<Vec<i64>, GroupError> {
        self.check_rank(source)?;
        let size = self.size();
        let contribution = if self.rank() == source {
            Payload::Words(values.to_vec())
        } else {
            Payload::Empty
        };
        let reply = self
            .exchange(CollectiveOp::Broadcast, contribution, move |mut contributions| {
                match std::mem::replace(&mut contributions[source], Payload::Empty) {
                    Payload::Words(words) => Ok(vec![Payload::Words(words); size]),
                    other => Err(format!(
                        "broadcast source {} contributed {}",
                        source,
                        other.kind()
                    )),
                }
            })
            .await?;
        words(reply)
    }

    /// Broadcast a single value.
    pub async fn broadcast_value(&mut self, value: i64, source: usize) -> Result<i64, GroupError> {
        let values = self.broadcast(&[value], source).await?;
        values
            .first()
            .copied()
            .ok_or_else(|| GroupError::Collective("broadcast returned no value".to_string()))
    }

    /// Concatenate every rank's values, in rank order, on `target`.
    ///
    /// All ranks must contribute the same number of values; padding is the
    /// caller's responsibility. Ranks other than `target` receive `None`.
    pub async fn gather(
        &mut self,
        values: &[i64],
        target: usize,
    ) -> Result<Option<Vec<i64>>, GroupError> {
        self.check_rank(target)?;
        let size = self.size();
        let reply = self
            .exchange(
                CollectiveOp::Gather,
                Payload::Words(values.to_vec()),
                move |contributions| {
                    let joined = concat_words(contributions)?;
                    let mut replies = vec![Payload::Empty; size];
                    replies[target] = Payload::Words(joined);
                    Ok(replies)
                },
            )
            .await?;
        if self.rank() == target {
            words(reply).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Concatenate every rank's floating-point values on `target`.
    pub async fn gather_reals(
        &mut self,
        values: &[f64],
        target: usize,
    ) -> Result<Option<Vec<f64>>, GroupError> {
        self.check_rank(target)?;
        let size = self.size();
        let reply = self
            .exchange(
                CollectiveOp::Gather,
                Payload::Reals(values.to_vec()),
                move |contributions| {
                    let mut expected = None;
                    let mut joined = Vec::new();
                    for (rank, payload) in contributions.into_iter().enumerate() {
                        let reals = match payload {
                            Payload::Reals(reals) => reals,
                            other => {
                                return Err(format!("rank {} contributed {}", rank, other.kind()))
                            }
                        };
                        check_length(&mut expected, rank, reals.len())?;
                        joined.extend(reals);
                    }
                    let mut replies = vec![Payload::Empty; size];
                    replies[target] = Payload::Reals(joined);
                    Ok(replies)
                },
            )
            .await?;
        match reply {
            Payload::Reals(reals) if self.rank() == target => Ok(Some(reals)),
            Payload::Empty if self.rank() != target => Ok(None),
            other => Err(GroupError::Collective(format!(
                "unexpected {} reply to gather",
                other.kind()
            ))),
        }
    }

    /// Concatenate every rank's values, in rank order, on every rank.
    pub async fn all_gather(&mut self, values: &[i64]) -> Result<Vec<i64>, GroupError> {
        let size = self.size();
        let reply = self
            .exchange(
                CollectiveOp::AllGather,
                Payload::Words(values.to_vec()),
                move |contributions| {
                    let joined = concat_words(contributions)?;
                    Ok(vec![Payload::Words(joined); size])
                },
            )
            .await?;
        words(reply)
    }

    /// Minimum over all ranks, meaningful on `target` only.
    ///
    /// Every other rank gets its own `value` back and must not read the
    /// result as an aggregate.
    pub async fn reduce_min(&mut self, value: i64, target: usize) -> Result<i64, GroupError> {
        self.reduce(CollectiveOp::ReduceMin, value, target).await
    }

    /// Maximum over all ranks, meaningful on `target` only.
    pub async fn reduce_max(&mut self, value: i64, target: usize) -> Result<i64, GroupError> {
        self.reduce(CollectiveOp::ReduceMax, value, target).await
    }

    /// Sum over all ranks, meaningful on `target` only.
    pub async fn reduce_sum(&mut self, value: i64, target: usize) -> Result<i64, GroupError> {
        self.reduce(CollectiveOp::ReduceSum, value, target).await
    }

    /// Broadcast an optional identifier from `source`.
    ///
    /// Identifiers travel as two 64-bit halves and `None` is encoded as the
    /// nil UUID, so a real all-zero identifier arrives as `None`.
    pub async fn broadcast_identifier(
        &mut self,
        id: Option<Uuid>,
        source: usize,
    ) -> Result<Option<Uuid>, GroupError> {
        let halves = encode_identifier(id);
        let received = self.broadcast(&halves, source).await?;
        decode_identifiers(&received)
            .into_iter()
            .next()
            .ok_or_else(|| GroupError::Collective("identifier broadcast was empty".to_string()))
    }

    /// Gather one optional identifier per rank on `target`.
    pub async fn gather_identifiers(
        &mut self,
        id: Option<Uuid>,
        target: usize,
    ) -> Result<Option<Vec<Option<Uuid>>>, GroupError> {
        let gathered = self.gather(&encode_identifier(id), target).await?;
        Ok(gathered.map(|words| decode_identifiers(&words)))
    }

    /// Gather one optional identifier per rank on every rank.
    pub async fn all_gather_identifiers(
        &mut self,
        id: Option<Uuid>,
    ) -> Result<Vec<Option<Uuid>>, GroupError> {
        let gathered = self.all_gather(&encode_identifier(id)).await?;
        Ok(decode_identifiers(&gathered))
    }

    /// Close the underlying transport.
    pub async fn close(&mut self) -> Result<(), GroupError> {
        self.transport.close().await
    }

    async fn reduce(
        &mut self,
        op: CollectiveOp,
        value: i64,
        target: usize,
    ) -> Result<i64, GroupError> {
        self.check_rank(target)?;
        let size = self.size();
        let reply = self
            .exchange(op, Payload::Words(vec![value]), move |contributions| {
                let mut values = Vec::with_capacity(contributions.len());
                for (rank, payload) in contributions.into_iter().enumerate() {
                    match payload {
                        Payload::Words(words) if words.len() == 1 => values.push(words[0]),
                        other => {
                            return Err(format!("rank {} contributed {}", rank, other.kind()))
                        }
                    }
                }
                let reduced = match op {
                    CollectiveOp::ReduceMin => values.iter().copied().min(),
                    CollectiveOp::ReduceMax => values.iter().copied().max(),
                    _ => Some(values.iter().fold(0i64, |acc, v| acc.saturating_add(*v))),
                }
                .ok_or_else(|| "reduction over an empty group".to_string())?;
                let mut replies = vec![Payload::Empty; size];
                replies[target] = Payload::Words(vec![reduced]);
                Ok(replies)
            })
            .await?;
        if self.rank() == target {
            words(reply)?
                .first()
                .copied()
                .ok_or_else(|| GroupError::Collective("reduction returned no value".to_string()))
        } else {
            Ok(value)
        }
    }

    /// Run one star-shaped collective.
    ///
    /// `combine` runs on the root only. It receives the contributions indexed
    /// by rank and returns one reply per rank.
    async fn exchange<F>(
        &mut self,
        op: CollectiveOp,
        contribution: Payload,
        combine: F,
    ) -> Result<Payload, GroupError>
    where
        F: FnOnce(Vec<Payload>) -> Result<Vec<Payload>, String> + Send,
    {
        self.sequence += 1;
        let sequence = self.sequence;
        let rank = self.rank();
        let size = self.size();
        trace!("rank {} enters {:?} #{}", rank, op, sequence);

        if rank != ROOT_RANK {
            self.transport
                .send(ROOT_RANK, &Frame::new(op, sequence, contribution))
                .await?;
            let reply = self.transport.receive(ROOT_RANK).await?;
            check_step(ROOT_RANK, op, sequence, &reply)?;
            return match reply.payload {
                Payload::Failure(reason) => Err(GroupError::Collective(reason)),
                payload => Ok(payload),
            };
        }

        let mut contributions = Vec::with_capacity(size);
        contributions.push(contribution);
        // Keep draining the other peers after a failure so every rank that did
        // contribute gets a reply for this sequence.
        let mut step_error = None;
        for peer in 1..size {
            let checked = match self.transport.receive(peer).await {
                Ok(frame) => check_step(peer, op, sequence, &frame).map(|_| frame.payload),
                Err(e) => Err(e),
            };
            match checked {
                Ok(payload) => contributions.push(payload),
                Err(e) => {
                    step_error.get_or_insert(e);
                    contributions.push(Payload::Empty);
                }
            }
        }

        let outcome = match step_error {
            Some(e) => Err(e),
            None => combine(contributions).map_err(GroupError::Collective),
        };

        match outcome {
            Ok(mut replies) if replies.len() == size => {
                for peer in (1..size).rev() {
                    let reply = replies.pop().unwrap_or(Payload::Empty);
                    self.transport
                        .send(peer, &Frame::new(op, sequence, reply))
                        .await?;
                }
                Ok(replies.pop().unwrap_or(Payload::Empty))
            }
            Ok(replies) => {
                let e = GroupError::Collective(format!(
                    "{} replies for a group of {}",
                    replies.len(),
                    size
                ));
                self.fail_peers(op, sequence, &e).await;
                Err(e)
            }
            Err(e) => {
                self.fail_peers(op, sequence, &e).await;
                Err(e)
            }
        }
    }

    /// Tell every peer the current collective failed so nobody waits forever
    /// for a reply.
    async fn fail_peers(&mut self, op: CollectiveOp, sequence: u64, error: &GroupError) {
        warn!("{:?} #{} failed on root: {}", op, sequence, error);
        for peer in 1..self.size() {
            let frame = Frame::new(op, sequence, Payload::Failure(error.to_string()));
            if let Err(e) = self.transport.send(peer, &frame).await {
                warn!("Could not report failure to rank {}: {}", peer, e);
            }
        }
    }

    fn check_rank(&self, rank: usize) -> Result<(), GroupError> {
        if rank >= self.size() {
            return Err(GroupError::InvalidRank {
                rank,
                size: self.size(),
            });
        }
        Ok(())
    }
}

fn check_step(peer: usize, op: CollectiveOp, sequence: u64, frame: &Frame) -> Result<(), GroupError> {
    if frame.op != op || frame.sequence != sequence {
        return Err(GroupError::OutOfStep {
            rank: peer,
            expected: format!("{:?} #{}", op, sequence),
            actual: format!("{:?} #{}", frame.op, frame.sequence),
        });
    }
    Ok(())
}

fn check_length(expected: &mut Option<usize>, rank: usize, len: usize) -> Result<(), String> {
    match *expected {
        None => {
            *expected = Some(len);
            Ok(())
        }
        Some(n) if n == len => Ok(()),
        Some(n) => Err(format!(
            "rank {} contributed {} values, rank 0 contributed {}",
            rank, len, n
        )),
    }
}

fn concat_words(contributions: Vec<Payload>) -> Result<Vec<i64>, String> {
    let mut expected = None;
    let mut joined = Vec::new();
    for (rank, payload) in contributions.into_iter().enumerate() {
        let words = match payload {
            Payload::Words(words) => words,
            other => return Err(format!("rank {} contributed {}", rank, other.kind())),
        };
        check_length(&mut expected, rank, words.len())?;
        joined.extend(words);
    }
    Ok(joined)
}

fn words(payload: Payload) -> Result<Vec<i64>, GroupError> {
    match payload {
        Payload::Words(words) => Ok(words),
        other => Err(GroupError::Collective(format!(
            "expected words, got {}",
            other.kind()
        ))),
    }
}

fn encode_identifier(id: Option<Uuid>) -> [i64; 2] {
    let (high, low) = id.unwrap_or_else(Uuid::nil).as_u64_pair();
    [high as i64, low as i64]
}

fn decode_identifiers(words: &[i64]) -> Vec<Option<Uuid>> {
    words
        .chunks_exact(2)
        .map(|pair| {
            let id = Uuid::from_u64_pair(pair[0] as u64, pair[1] as u64);
            if id.is_nil() {
                None
            } else {
                Some(id)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn run_group<F, Fut, T>(size: usize, body: F) -> Vec<T>
    where
        F: Fn(ProcessGroup) -> Fut,
        Fut: std::future::Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let handles: Vec<_> = LocalTransport::group(size)
            .into_iter()
            .map(|t| tokio::spawn(body(ProcessGroup::new(Box::new(t), "localhost"))))
            .collect();
        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[test]
    fn test_frame_serialization() {
        let frame = Frame::new(CollectiveOp::Gather, 42, Payload::Words(vec![1, -2, 3]));
        let bytes = frame.to_bytes().unwrap();
        assert_eq!(Frame::from_bytes(&bytes).unwrap(), frame);
    }

    #[test]
    fn test_identifier_encoding_maps_nil_to_none() {
        let id = Uuid::from_u64_pair(0x1234, 0x5678);
        let mut words = encode_identifier(Some(id)).to_vec();
        words.extend(encode_identifier(None));
        assert_eq!(decode_identifiers(&words), vec![Some(id), None]);
        // A genuinely nil identifier cannot be told apart from "no identifier".
        assert_eq!(decode_identifiers(&encode_identifier(Some(Uuid::nil()))), vec![None]);
    }

    #[tokio::test]
    async fn test_broadcast_from_non_root_source() {
        let results = run_group(4, |mut group| async move {
            let mine = vec![group.rank() as i64 * 10, 7];
            group.broadcast(&mine, 2).await.unwrap()
        })
        .await;
        assert!(results.iter().all(|r| r == &vec![20, 7]));
    }

    /// Only the target rank receives the concatenation, ordered by rank
    #[tokio::test]
    async fn test_gather_orders_by_rank() {
        let results = run_group(3, |mut group| async move {
            let rank = group.rank() as i64;
            group.gather(&[rank, rank + 100], 1).await.unwrap()
        })
        .await;
        assert_eq!(results[0], None);
        assert_eq!(results[1], Some(vec![0, 100, 1, 101, 2, 102]));
        assert_eq!(results[2], None);
    }

    #[tokio::test]
    async fn test_gather_rejects_unequal_lengths() {
        let results = run_group(3, |mut group| async move {
            let values = vec![1; group.rank() + 1];
            group.gather(&values, 0).await.is_err()
        })
        .await;
        assert!(results.iter().all(|failed| *failed));
    }

    #[tokio::test]
    async fn test_reductions_only_meaningful_on_target() {
        let results = run_group(4, |mut group| async move {
            let value = (group.rank() as i64 + 1) * 3;
            let min = group.reduce_min(value, 0).await.unwrap();
            let max = group.reduce_max(value, 0).await.unwrap();
            let sum = group.reduce_sum(value, 3).await.unwrap();
            (min, max, sum)
        })
        .await;
        assert_eq!(results[0].0, 3);
        assert_eq!(results[0].1, 12);
        assert_eq!(results[3].2, 30);
        // Non-target ranks get their own input back.
        assert_eq!(results[1], (6, 6, 6));
        assert_eq!(results[3].0, 12);
    }

    #[tokio::test]
    async fn test_all_gather_and_identifiers() {
        let results = run_group(3, |mut group| async move {
            let rank = group.rank();
            let words = group.all_gather(&[rank as i64]).await.unwrap();
            let id = if rank == 1 { None } else { Some(Uuid::from_u64_pair(9, rank as u64 + 1)) };
            let ids = group.all_gather_identifiers(id).await.unwrap();
            let root_id = group
                .broadcast_identifier(Some(Uuid::from_u64_pair(1, 2)), 0)
                .await
                .unwrap();
            (words, ids, root_id)
        })
        .await;
        for (words, ids, root_id) in results {
            assert_eq!(words, vec![0, 1, 2]);
            assert_eq!(ids[1], None);
            assert_eq!(ids[2], Some(Uuid::from_u64_pair(9, 3)));
            assert_eq!(root_id, Some(Uuid::from_u64_pair(1, 2)));
        }
    }

    #[tokio::test]
    async fn test_gather_reals() {
        let results = run_group(2, |mut group| async move {
            let rank = group.rank() as f64;
            group.gather_reals(&[rank + 0.5], 0).await.unwrap()
        })
        .await;
        assert_eq!(results[0], Some(vec![0.5, 1.5]));
        assert_eq!(results[1], None);
    }

    /// A rank that skips a collective is reported instead of mixing data
    #[tokio::test]
    async fn test_out_of_step_detection() {
        let results = run_group(2, |mut group| async move {
            if group.rank() == 1 {
                group.barrier().await.err().map(|e| e.to_string())
            } else {
                group.all_gather(&[1]).await.err().map(|e| e.to_string())
            }
        })
        .await;
        assert!(results[0].as_deref().unwrap_or_default().contains("out of step"));
        assert!(results[1].is_some());
    }

    /// A vanished rank fails the collective for everyone, and the survivors
    /// stay in step for the next one
    #[tokio::test]
    async fn test_disconnected_peer_fails_survivors() {
        let results = run_group(3, |mut group| async move {
            if group.rank() == 1 {
                group.close().await.unwrap();
                return Vec::new();
            }
            let first = group.barrier().await.unwrap_err();
            let second = group.barrier().await.unwrap_err();
            vec![first, second]
        })
        .await;
        assert!(results[0]
            .iter()
            .all(|e| matches!(e, GroupError::Disconnected(1))));
        assert_eq!(results[2].len(), 2);
        for error in &results[2] {
            assert!(
                matches!(error, GroupError::Collective(reason) if reason.contains("peer 1 disconnected")),
                "unexpected error: {}",
                error
            );
        }
    }

    #[tokio::test]
    async fn test_single_rank_group() {
        let results = run_group(1, |mut group| async move {
            group.barrier().await.unwrap();
            let b = group.broadcast_value(5, 0).await.unwrap();
            let g = group.gather(&[1, 2], 0).await.unwrap();
            (b, g)
        })
        .await;
        assert_eq!(results[0], (5, Some(vec![1, 2])));
    }

    #[tokio::test]
    async fn test_invalid_target_rank() {
        let results = run_group(2, |mut group| async move {
            matches!(
                group.reduce_sum(1, 5).await,
                Err(GroupError::InvalidRank { rank: 5, size: 2 })
            )
        })
        .await;
        assert!(results.iter().all(|ok| *ok));
    }
}
