use super::{DEFAULT_WRAP_TOLERANCE, check_global_count, require_master, require_worker};
use crate::comm::buffer::{BlockKind, Buffer};
use crate::comm::communicator::{Communicator, tags};
use crate::comm::context::DomainContext;
use crate::comm::error::CommError;
use crate::core::boundary::{DIMENSION, wrap_unit};
use crate::core::models::atom::Atom;
use crate::core::models::ids::AtomId;
use crate::core::storage::{AtomStorage, StorageError};
use std::collections::HashMap;
use tracing::{debug, info};

/// Owner rank of every distributed atom, as recorded by the master.
pub type AtomOwnership = HashMap<AtomId, usize>;

/// Scatters atoms from the master to the domains that own them.
///
/// On the master, call [`add_atom`](Self::add_atom) for every atom and then
/// [`send`](Self::send). On every other rank, call [`receive`](Self::receive).
/// The storages must hold scaled coordinates.
pub struct AtomDistributor<'a, C: Communicator> {
    ctx: DomainContext<'a, C>,
    storage: &'a mut AtomStorage,
    buffer: &'a mut Buffer,
    cache_capacity: usize,
    wrap_tolerance: f64,
    caches: Vec<Vec<Atom>>,
    ownership: AtomOwnership,
    n_sent: usize,
}

impl<'a, C: Communicator> AtomDistributor<'a, C> {
    /// Creates a distributor over this rank's storage and buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] for a zero cache capacity and
    /// [`StorageError::CoordinateMode`] if the storage is in Cartesian mode.
    pub fn new(
        ctx: DomainContext<'a, C>,
        storage: &'a mut AtomStorage,
        buffer: &'a mut Buffer,
        cache_capacity: usize,
    ) -> Result<Self, CommError> {
        if cache_capacity == 0 {
            return Err(CommError::Configuration(
                "atom distribution cache capacity must be positive".into(),
            ));
        }
        if storage.is_cartesian() {
            return Err(StorageError::CoordinateMode { expected: "scaled" }.into());
        }
        let n_procs = ctx.n_procs();
        Ok(Self {
            ctx,
            storage,
            buffer,
            cache_capacity,
            wrap_tolerance: DEFAULT_WRAP_TOLERANCE,
            caches: vec![Vec::new(); n_procs],
            ownership: AtomOwnership::new(),
            n_sent: 0,
        })
    }

    /// Sets how far outside [0, 1) an input coordinate may lie and still be
    /// wrapped into the primary cell.
    pub fn with_wrap_tolerance(mut self, wrap_tolerance: f64) -> Self {
        self.wrap_tolerance = wrap_tolerance;
        self
    }

    /// Number of atoms added so far.
    pub fn n_added(&self) -> usize {
        self.ownership.len()
    }

    fn map_into_cell(&self, atom: &mut Atom) -> Result<(), CommError> {
        let unmappable = || CommError::UnmappablePosition {
            id: atom.id,
            position: [atom.position.x, atom.position.y, atom.position.z],
        };
        let mut position = atom.position;
        for axis in 0..DIMENSION {
            let s = position[axis];
            if !s.is_finite() || s < -self.wrap_tolerance || s >= 1.0 + self.wrap_tolerance {
                return Err(unmappable());
            }
            position[axis] = wrap_unit(s);
        }
        atom.position = position;
        Ok(())
    }

    /// Adds one atom on the master and routes it to its owner.
    ///
    /// Positions within the wrap tolerance of the cell are wrapped into
    /// [0, 1). Atoms owned by the master are stored immediately; others are
    /// cached and sent once the destination's cache is full.
    ///
    /// # Return
    ///
    /// The rank that owns the atom.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::UnmappablePosition`] for positions that cannot be
    /// mapped into the cell and [`StorageError::DuplicateAtom`] for an id that
    /// was already added.
    pub fn add_atom(&mut self, mut atom: Atom) -> Result<usize, CommError> {
        require_master(&self.ctx, "AtomDistributor::add_atom")?;
        if self.ownership.contains_key(&atom.id) {
            return Err(StorageError::DuplicateAtom(atom.id).into());
        }
        self.map_into_cell(&mut atom)?;
        let owner = self
            .ctx
            .domain
            .owner_rank(&atom.position)
            .ok_or(CommError::UnmappablePosition {
                id: atom.id,
                position: [atom.position.x, atom.position.y, atom.position.z],
            })?;
        let id = atom.id;
        if owner == self.ctx.rank() {
            self.storage.add_atom(atom)?;
        } else {
            self.caches[owner].push(atom);
            if self.caches[owner].len() >= self.cache_capacity {
                self.flush(owner, false)?;
            }
        }
        self.ownership.insert(id, owner);
        Ok(owner)
    }

    /// Ships the cache for `dest`. Failures are attributed to this rank.
    fn flush(&mut self, dest: usize, is_complete: bool) -> Result<(), CommError> {
        let cache = std::mem::take(&mut self.caches[dest]);
        self.ship(dest, &cache, is_complete)
            .map_err(|e| self.ctx.distribution_error(e))?;
        self.n_sent += cache.len();
        debug!(dest, atoms = cache.len(), is_complete, "Sent atom distribution block");
        Ok(())
    }

    fn ship(&mut self, dest: usize, cache: &[Atom], is_complete: bool) -> Result<(), CommError> {
        self.buffer.begin_send_block(BlockKind::Atom)?;
        for atom in cache {
            self.buffer.pack_atom(atom)?;
        }
        self.buffer.end_send_block(is_complete)?;
        self.buffer.send(self.ctx.comm, dest, tags::ATOM_DISTRIBUTION)
    }

    /// Flushes every cache on the master, closes distribution and checks the
    /// global atom count.
    ///
    /// # Return
    ///
    /// The owner rank of every distributed atom.
    pub fn send(mut self) -> Result<AtomOwnership, CommError> {
        require_master(&self.ctx, "AtomDistributor::send")?;
        for dest in 0..self.ctx.n_procs() {
            if dest != self.ctx.rank() {
                self.flush(dest, true)?;
            }
        }
        let total = check_global_count(&self.ctx, self.storage.n_atoms(), self.n_added(), "atoms")?;
        info!(
            atoms = total,
            sent = self.n_sent,
            domains = self.ctx.n_procs(),
            "Atom distribution complete"
        );
        Ok(self.ownership)
    }

    /// Receives this rank's atoms from the master and checks the global atom
    /// count.
    ///
    /// # Return
    ///
    /// The number of atoms received.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::OwnershipInconsistency`] if the master sent an atom
    /// that does not lie in this domain.
    pub fn receive(mut self) -> Result<usize, CommError> {
        require_worker(&self.ctx, "AtomDistributor::receive")?;
        let mut received = 0;
        loop {
            self.buffer.recv(self.ctx.comm, 0, tags::ATOM_DISTRIBUTION)?;
            let (kind, count, is_complete) = self.buffer.begin_recv_block()?;
            if kind != BlockKind::Atom {
                return Err(CommError::BlockMismatch {
                    expected: BlockKind::Atom,
                    found: kind.to_string(),
                });
            }
            for _ in 0..count {
                let atom = self.buffer.unpack_atom()?;
                if !self.ctx.domain.is_in_domain(&atom.position) {
                    return Err(self.ctx.inconsistency(format!(
                        "received atom {} at {:?}, outside this domain",
                        atom.id,
                        atom.position.as_slice()
                    )));
                }
                self.storage.add_atom(atom)?;
            }
            self.buffer.end_recv_block()?;
            received += count;
            if is_complete {
                break;
            }
        }
        check_global_count(&self.ctx, self.storage.n_atoms(), 0, "atoms")?;
        debug!(rank = self.ctx.rank(), atoms = received, "Received distributed atoms");
        Ok(received)
    }
}
