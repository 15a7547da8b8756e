use crate::comm::buffer::{BlockKind, Buffer};
use crate::comm::communicator::{Communicator, tags};
use crate::comm::context::DomainContext;
use crate::comm::distributor::{require_master, require_worker};
use crate::comm::error::CommError;
use crate::core::models::group::Group;
use crate::core::storage::{AtomStorage, GroupStorage};
use tracing::debug;

/// Gathers every group of arity `N` onto the master exactly once.
///
/// A group held by several domains is sent only by its authoritative holder,
/// the owner of its first member.
pub struct GroupCollector<'a, C: Communicator, const N: usize> {
    ctx: DomainContext<'a, C>,
    atoms: &'a AtomStorage,
    groups: &'a GroupStorage<N>,
    buffer: &'a mut Buffer,
    cache_capacity: usize,
}

impl<'a, C: Communicator, const N: usize> GroupCollector<'a, C, N> {
    pub fn new(
        ctx: DomainContext<'a, C>,
        atoms: &'a AtomStorage,
        groups: &'a GroupStorage<N>,
        buffer: &'a mut Buffer,
        cache_capacity: usize,
    ) -> Result<Self, CommError> {
        if cache_capacity == 0 {
            return Err(CommError::Configuration(format!(
                "{} collection cache capacity must be positive",
                Group::<N>::kind_name()
            )));
        }
        Ok(Self {
            ctx,
            atoms,
            groups,
            buffer,
            cache_capacity,
        })
    }

    fn authoritative(&self) -> Vec<Group<N>> {
        self.groups
            .iter()
            .filter(|group| self.groups.is_authoritative(group, self.atoms))
            .copied()
            .collect()
    }

    /// Streams this rank's authoritative groups to the master.
    pub fn send(mut self) -> Result<usize, CommError> {
        require_worker(&self.ctx, "GroupCollector::send")?;
        let groups = self.authoritative();
        let tag = tags::group_collection(N);
        let mut chunks = groups.chunks(self.cache_capacity).peekable();
        if chunks.peek().is_none() {
            self.buffer.begin_send_block(BlockKind::Group(N))?;
            self.buffer.end_send_block(true)?;
            self.buffer.send(self.ctx.comm, 0, tag)?;
            return Ok(0);
        }
        while let Some(chunk) = chunks.next() {
            self.buffer.begin_send_block(BlockKind::Group(N))?;
            for group in chunk {
                self.buffer.pack_group(group)?;
            }
            self.buffer.end_send_block(chunks.peek().is_none())?;
            self.buffer.send(self.ctx.comm, 0, tag)?;
        }
        Ok(groups.len())
    }

    /// Gathers all groups on the master: its own authoritative groups first,
    /// then each rank's in rank order.
    pub fn collect(mut self) -> Result<Vec<Group<N>>, CommError> {
        require_master(&self.ctx, "GroupCollector::collect")?;
        let mut groups = self.authoritative();
        let tag = tags::group_collection(N);
        for source in 0..self.ctx.n_procs() {
            if source == self.ctx.rank() {
                continue;
            }
            loop {
                self.buffer.recv(self.ctx.comm, source, tag)?;
                let (kind, count, is_complete) = self.buffer.begin_recv_block()?;
                if kind != BlockKind::Group(N) {
                    return Err(CommError::BlockMismatch {
                        expected: BlockKind::Group(N),
                        found: kind.to_string(),
                    });
                }
                for _ in 0..count {
                    groups.push(self.buffer.unpack_group()?);
                }
                self.buffer.end_recv_block()?;
                if is_complete {
                    break;
                }
            }
        }
        debug!(
            kind = Group::<N>::kind_name(),
            groups = groups.len(),
            "Group collection complete"
        );
        Ok(groups)
    }
}
