//! In-process group transport.
//!
//! Every pair of ranks is connected by an unbounded tokio channel, so a
//! group of `n` ranks can run as `n` tasks inside one runtime. This is the
//! transport used by the local launcher and by most tests.

use super::{Frame, GroupError, GroupTransport};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;

/// Channel-mesh transport for one rank of an in-process group
pub struct LocalTransport {
    rank: usize,
    size: usize,
    /// `outgoing[peer]` delivers frames to `peer`
    outgoing: Vec<Option<mpsc::UnboundedSender<Frame>>>,
    /// `incoming[peer]` yields frames sent by `peer`
    incoming: Vec<Option<mpsc::UnboundedReceiver<Frame>>>,
}

impl LocalTransport {
    /// Build a fully connected group of `size` transports, indexed by rank.
    pub fn group(size: usize) -> Vec<LocalTransport> {
        let mut transports: Vec<LocalTransport> = (0..size)
            .map(|rank| LocalTransport {
                rank,
                size,
                outgoing: (0..size).map(|_| None).collect(),
                incoming: (0..size).map(|_| None).collect(),
            })
            .collect();

        for from in 0..size {
            for to in 0..size {
                if from == to {
                    continue;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                transports[from].outgoing[to] = Some(tx);
                transports[to].incoming[from] = Some(rx);
            }
        }
        debug!("Created in-process group of {} ranks", size);
        transports
    }

    fn check_peer(&self, peer: usize) -> Result<(), GroupError> {
        if peer >= self.size || peer == self.rank {
            return Err(GroupError::InvalidRank {
                rank: peer,
                size: self.size,
            });
        }
        Ok(())
    }
}

#[async_trait]
impl GroupTransport for LocalTransport {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    async fn send(&mut self, peer: usize, frame: &Frame) -> Result<(), GroupError> {
        self.check_peer(peer)?;
        let sender = self.outgoing[peer]
            .as_ref()
            .ok_or(GroupError::Disconnected(peer))?;
        sender
            .send(frame.clone())
            .map_err(|_| GroupError::Disconnected(peer))
    }

    async fn receive(&mut self, peer: usize) -> Result<Frame, GroupError> {
        self.check_peer(peer)?;
        let receiver = self.incoming[peer]
            .as_mut()
            .ok_or(GroupError::Disconnected(peer))?;
        receiver.recv().await.ok_or(GroupError::Disconnected(peer))
    }

    async fn close(&mut self) -> Result<(), GroupError> {
        debug!("Closing in-process transport for rank {}", self.rank);
        self.outgoing.iter_mut().for_each(|tx| *tx = None);
        self.incoming.iter_mut().for_each(|rx| *rx = None);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-process"
    }
}
