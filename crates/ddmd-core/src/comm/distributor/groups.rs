use super::atoms::AtomOwnership;
use super::{check_global_count, require_master, require_worker};
use crate::comm::buffer::{BlockKind, Buffer};
use crate::comm::communicator::{Communicator, tags};
use crate::comm::context::DomainContext;
use crate::comm::error::CommError;
use crate::core::models::group::Group;
use crate::core::storage::{AtomStorage, GroupStorage};
use tracing::{debug, info};

/// Scatters groups of arity `N` from the master to every domain that owns
/// one of their members.
///
/// Atom distribution must be complete first: the master routes groups with
/// the [`AtomOwnership`] returned by
/// [`AtomDistributor::send`](super::AtomDistributor::send), and receivers
/// check membership against their atom storage.
pub struct GroupDistributor<'a, C: Communicator, const N: usize> {
    ctx: DomainContext<'a, C>,
    atoms: &'a AtomStorage,
    groups: &'a mut GroupStorage<N>,
    buffer: &'a mut Buffer,
    cache_capacity: usize,
    caches: Vec<Vec<Group<N>>>,
    n_added: usize,
    n_copies: usize,
}

impl<'a, C: Communicator, const N: usize> GroupDistributor<'a, C, N> {
    pub fn new(
        ctx: DomainContext<'a, C>,
        atoms: &'a AtomStorage,
        groups: &'a mut GroupStorage<N>,
        buffer: &'a mut Buffer,
        cache_capacity: usize,
    ) -> Result<Self, CommError> {
        if cache_capacity == 0 {
            return Err(CommError::Configuration(format!(
                "{} distribution cache capacity must be positive",
                Group::<N>::kind_name()
            )));
        }
        let n_procs = ctx.n_procs();
        Ok(Self {
            ctx,
            atoms,
            groups,
            buffer,
            cache_capacity,
            caches: vec![Vec::new(); n_procs],
            n_added: 0,
            n_copies: 0,
        })
    }

    /// Adds one group on the master and pushes a copy to each distinct owner
    /// of its members.
    ///
    /// # Return
    ///
    /// The number of copies made, one per distinct owner rank.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::UnknownAtom`] if a member was never distributed.
    pub fn add_group(&mut self, group: Group<N>, ownership: &AtomOwnership) -> Result<usize, CommError> {
        require_master(&self.ctx, "GroupDistributor::add_group")?;
        let mut owners: Vec<usize> = Vec::with_capacity(N);
        for atom_id in &group.atom_ids {
            let owner = *ownership
                .get(atom_id)
                .ok_or(CommError::UnknownAtom(*atom_id))?;
            if !owners.contains(&owner) {
                owners.push(owner);
            }
        }
        for owner in &owners {
            if *owner == self.ctx.rank() {
                self.groups.add(group)?;
            } else {
                self.caches[*owner].push(group);
                if self.caches[*owner].len() >= self.cache_capacity {
                    self.flush(*owner, false)?;
                }
            }
        }
        self.n_added += 1;
        self.n_copies += owners.len();
        Ok(owners.len())
    }

    fn flush(&mut self, dest: usize, is_complete: bool) -> Result<(), CommError> {
        let cache = std::mem::take(&mut self.caches[dest]);
        self.ship(dest, &cache, is_complete)
            .map_err(|e| self.ctx.distribution_error(e))
    }

    fn ship(&mut self, dest: usize, cache: &[Group<N>], is_complete: bool) -> Result<(), CommError> {
        self.buffer.begin_send_block(BlockKind::Group(N))?;
        for group in cache {
            self.buffer.pack_group(group)?;
        }
        self.buffer.end_send_block(is_complete)?;
        self.buffer
            .send(self.ctx.comm, dest, tags::group_distribution(N))
    }

    /// Flushes every cache on the master and checks the global count of
    /// authoritative groups.
    pub fn send(mut self) -> Result<usize, CommError> {
        require_master(&self.ctx, "GroupDistributor::send")?;
        for dest in 0..self.ctx.n_procs() {
            if dest != self.ctx.rank() {
                self.flush(dest, true)?;
            }
        }
        let total = check_global_count(
            &self.ctx,
            self.groups.n_authoritative(self.atoms),
            self.n_added,
            Group::<N>::kind_name(),
        )?;
        info!(
            kind = Group::<N>::kind_name(),
            groups = total,
            copies = self.n_copies,
            "Group distribution complete"
        );
        Ok(total)
    }

    /// Receives this rank's groups from the master.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::OwnershipInconsistency`] if a received group has no
    /// member owned by this domain.
    pub fn receive(mut self) -> Result<usize, CommError> {
        require_worker(&self.ctx, "GroupDistributor::receive")?;
        let mut received = 0;
        loop {
            self.buffer
                .recv(self.ctx.comm, 0, tags::group_distribution(N))?;
            let (kind, count, is_complete) = self.buffer.begin_recv_block()?;
            if kind != BlockKind::Group(N) {
                return Err(CommError::BlockMismatch {
                    expected: BlockKind::Group(N),
                    found: kind.to_string(),
                });
            }
            for _ in 0..count {
                let group: Group<N> = self.buffer.unpack_group()?;
                if !group.atom_ids.iter().any(|id| self.atoms.is_owned(*id)) {
                    return Err(self.ctx.inconsistency(format!(
                        "received {} {} but owns none of its atoms {:?}",
                        Group::<N>::kind_name(),
                        group.id,
                        group.atom_ids
                    )));
                }
                self.groups.add(group)?;
            }
            self.buffer.end_recv_block()?;
            received += count;
            if is_complete {
                break;
            }
        }
        check_global_count(
            &self.ctx,
            self.groups.n_authoritative(self.atoms),
            0,
            Group::<N>::kind_name(),
        )?;
        debug!(
            rank = self.ctx.rank(),
            kind = Group::<N>::kind_name(),
            groups = received,
            "Received distributed groups"
        );
        Ok(received)
    }
}
