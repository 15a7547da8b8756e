//! Point-to-point message passing between domains.
//!
//! Every domain talks to the others through a [`Communicator`]. The protocol
//! is synchronous relative to the calling step: receives block, every send is
//! matched by exactly one receive, and all ranks issue their operations in the
//! same order. Each message carries a [`Tag`]; receiving a tag other than the
//! one expected means the ranks have diverged and is reported as
//! [`CommError::ProtocolMismatch`].

use super::error::CommError;
use byteorder::{ByteOrder, LittleEndian};
use crossbeam_channel::{Receiver, Sender, unbounded};

pub type Tag = u32;

/// Message tags used by the decomposition protocol.
pub mod tags {
    use super::Tag;

    pub const ATOM_DISTRIBUTION: Tag = 1;
    pub const ATOM_COLLECTION: Tag = 2;
    pub const MIGRATION: Tag = 3;
    pub const GHOSTS: Tag = 4;
    pub const GHOST_UPDATE: Tag = 5;
    pub const REVERSE_FORCE: Tag = 6;
    pub const GATHER: Tag = 7;
    pub const BROADCAST: Tag = 8;

    pub const fn group_distribution(arity: usize) -> Tag {
        10 + arity as Tag
    }

    pub const fn group_collection(arity: usize) -> Tag {
        20 + arity as Tag
    }
}

/// A tagged message travelling between two ranks.
#[derive(Debug, Clone)]
pub struct Message {
    pub tag: Tag,
    pub payload: Vec<u8>,
}

/// Rank-addressed message passing with blocking receives.
///
/// Implementors provide the four point-to-point primitives; the collectives
/// are built on top of them and funnel through rank 0 (the master).
pub trait Communicator: Send {
    /// Rank of this endpoint, in `0..size()`.
    fn rank(&self) -> usize;

    /// Number of ranks.
    fn size(&self) -> usize;

    /// Sends `payload` to `dest`. Never blocks.
    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), CommError>;

    /// Blocks until the next message from `source` arrives and checks its tag.
    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError>;

    fn is_master(&self) -> bool {
        self.rank() == 0
    }

    /// Collects one payload per rank on the master, in rank order.
    ///
    /// # Return
    ///
    /// `Some(payloads)` on the master, `None` on every other rank.
    fn gather(&self, payload: Vec<u8>) -> Result<Option<Vec<Vec<u8>>>, CommError> {
        if self.is_master() {
            let mut all = Vec::with_capacity(self.size());
            all.push(payload);
            for source in 1..self.size() {
                all.push(self.recv(source, tags::GATHER)?);
            }
            Ok(Some(all))
        } else {
            self.send(0, tags::GATHER, payload)?;
            Ok(None)
        }
    }

    /// Sends the master's payload to every rank. The payload passed on other
    /// ranks is ignored.
    fn broadcast(&self, payload: Vec<u8>) -> Result<Vec<u8>, CommError> {
        if self.is_master() {
            for dest in 1..self.size() {
                self.send(dest, tags::BROADCAST, payload.clone())?;
            }
            Ok(payload)
        } else {
            self.recv(0, tags::BROADCAST)
        }
    }

    /// Sum of `value` over all ranks, returned on every rank.
    fn all_reduce_sum(&self, value: u64) -> Result<u64, CommError> {
        let total = match self.gather(value.to_le_bytes().to_vec())? {
            Some(parts) => parts
                .iter()
                .map(|bytes| decode_u64(bytes))
                .sum::<Result<u64, CommError>>()?,
            None => 0,
        };
        decode_u64(&self.broadcast(total.to_le_bytes().to_vec())?)
    }

    /// Maximum of `value` over all ranks, returned on every rank.
    fn all_reduce_max(&self, value: f64) -> Result<f64, CommError> {
        let max = match self.gather(value.to_le_bytes().to_vec())? {
            Some(parts) => parts
                .iter()
                .map(|bytes| decode_f64(bytes))
                .try_fold(f64::NEG_INFINITY, |acc, v| v.map(|v| acc.max(v)))?,
            None => 0.0,
        };
        decode_f64(&self.broadcast(max.to_le_bytes().to_vec())?)
    }

    /// Returns once every rank has entered the barrier.
    fn barrier(&self) -> Result<(), CommError> {
        self.all_reduce_sum(0).map(|_| ())
    }
}

pub(crate) fn decode_u64(bytes: &[u8]) -> Result<u64, CommError> {
    if bytes.len() != 8 {
        return Err(CommError::Malformed(format!(
            "expected an 8-byte integer, got {} bytes",
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_u64(bytes))
}

pub(crate) fn decode_f64(bytes: &[u8]) -> Result<f64, CommError> {
    if bytes.len() != 8 {
        return Err(CommError::Malformed(format!(
            "expected an 8-byte float, got {} bytes",
            bytes.len()
        )));
    }
    Ok(LittleEndian::read_f64(bytes))
}

/// An in-process communicator endpoint backed by `crossbeam-channel`.
///
/// [`ChannelCommunicator::mesh`] creates one unbounded FIFO channel for every
/// ordered pair of ranks, so messages between two ranks are delivered in the
/// order they were sent. Dropping an endpoint disconnects its channels and
/// peers waiting on it receive [`CommError::Disconnected`].
#[derive(Debug)]
pub struct ChannelCommunicator {
    rank: usize,
    /// Indexed by destination rank.
    senders: Vec<Sender<Message>>,
    /// Indexed by source rank.
    receivers: Vec<Receiver<Message>>,
}

impl ChannelCommunicator {
    /// Creates `size` fully connected endpoints, one per rank, in rank order.
    pub fn mesh(size: usize) -> Vec<Self> {
        let channels: Vec<Vec<(Sender<Message>, Receiver<Message>)>> = (0..size)
            .map(|_| (0..size).map(|_| unbounded()).collect())
            .collect();
        (0..size)
            .map(|rank| ChannelCommunicator {
                rank,
                senders: (0..size).map(|dest| channels[rank][dest].0.clone()).collect(),
                receivers: (0..size)
                    .map(|source| channels[source][rank].1.clone())
                    .collect(),
            })
            .collect()
    }

    fn check_rank(&self, rank: usize) -> Result<(), CommError> {
        if rank >= self.senders.len() {
            return Err(CommError::InvalidRank {
                rank,
                size: self.senders.len(),
            });
        }
        Ok(())
    }
}

impl Communicator for ChannelCommunicator {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.senders.len()
    }

    fn send(&self, dest: usize, tag: Tag, payload: Vec<u8>) -> Result<(), CommError> {
        self.check_rank(dest)?;
        self.senders[dest]
            .send(Message { tag, payload })
            .map_err(|_| CommError::Disconnected { peer: dest })
    }

    fn recv(&self, source: usize, tag: Tag) -> Result<Vec<u8>, CommError> {
        self.check_rank(source)?;
        let message = self.receivers[source]
            .recv()
            .map_err(|_| CommError::Disconnected { peer: source })?;
        if message.tag != tag {
            return Err(CommError::ProtocolMismatch {
                from_rank: source,
                expected: tag,
                found: message.tag,
            });
        }
        Ok(message.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn point_to_point_messages_arrive_in_order() {
        let mut mesh = ChannelCommunicator::mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();
        a.send(1, tags::MIGRATION, vec![1]).unwrap();
        a.send(1, tags::MIGRATION, vec![2]).unwrap();
        assert_eq!(b.recv(0, tags::MIGRATION).unwrap(), vec![1]);
        assert_eq!(b.recv(0, tags::MIGRATION).unwrap(), vec![2]);
    }

    #[test]
    fn unexpected_tag_is_protocol_mismatch() {
        let mut mesh = ChannelCommunicator::mesh(2);
        let b = mesh.pop().unwrap();
        let a = mesh.pop().unwrap();
        a.send(1, tags::GHOSTS, vec![]).unwrap();
        assert!(matches!(
            b.recv(0, tags::MIGRATION),
            Err(CommError::ProtocolMismatch {
                from_rank: 0,
                expected: tags::MIGRATION,
                found: tags::GHOSTS
            })
        ));
    }

    #[test]
    fn dropped_peer_is_disconnected() {
        let mut mesh = ChannelCommunicator::mesh(2);
        let b = mesh.pop().unwrap();
        drop(mesh);
        assert!(matches!(
            b.recv(0, tags::MIGRATION),
            Err(CommError::Disconnected { peer: 0 })
        ));
        assert!(matches!(
            b.send(0, tags::MIGRATION, vec![]),
            Err(CommError::Disconnected { peer: 0 })
        ));
    }

    #[test]
    fn out_of_range_rank_is_rejected() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        assert!(matches!(
            comm.send(3, tags::MIGRATION, vec![]),
            Err(CommError::InvalidRank { rank: 3, size: 1 })
        ));
    }

    #[test]
    fn single_rank_collectives_are_identity() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        assert_eq!(comm.all_reduce_sum(5).unwrap(), 5);
        assert_eq!(comm.all_reduce_max(2.5).unwrap(), 2.5);
        assert_eq!(comm.broadcast(vec![9]).unwrap(), vec![9]);
        comm.barrier().unwrap();
    }

    #[test]
    fn collectives_agree_across_threads() {
        let mesh = ChannelCommunicator::mesh(4);
        let results: Vec<(u64, f64, Vec<u8>)> = thread::scope(|scope| {
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|comm| {
                    scope.spawn(move || {
                        let rank = comm.rank();
                        let sum = comm.all_reduce_sum(rank as u64 + 1).unwrap();
                        let max = comm.all_reduce_max(rank as f64 * 0.5).unwrap();
                        let data = comm.broadcast(vec![rank as u8; 2]).unwrap();
                        comm.barrier().unwrap();
                        (sum, max, data)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        for (sum, max, data) in results {
            assert_eq!(sum, 10);
            assert_eq!(max, 1.5);
            assert_eq!(data, vec![0, 0]);
        }
    }

    #[test]
    fn gather_is_rank_ordered_on_master() {
        let mesh = ChannelCommunicator::mesh(3);
        let gathered = thread::scope(|scope| {
            let handles: Vec<_> = mesh
                .into_iter()
                .map(|comm| scope.spawn(move || comm.gather(vec![comm.rank() as u8]).unwrap()))
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap())
                .collect::<Vec<_>>()
        });
        assert_eq!(gathered[0], Some(vec![vec![0], vec![1], vec![2]]));
        assert_eq!(gathered[1], None);
        assert_eq!(gathered[2], None);
    }
}
