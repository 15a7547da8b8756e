use crate::comm::buffer::{BlockKind, Buffer};
use crate::comm::communicator::{Communicator, tags};
use crate::comm::context::DomainContext;
use crate::comm::distributor::{require_master, require_worker};
use crate::comm::error::CommError;
use crate::core::models::atom::Atom;
use crate::core::storage::AtomStorage;
use tracing::{debug, info};

/// Gathers every owned atom onto the master.
///
/// Ghosts are never collected. On the master call [`collect`](Self::collect);
/// on every other rank call [`send`](Self::send).
pub struct AtomCollector<'a, C: Communicator> {
    ctx: DomainContext<'a, C>,
    storage: &'a AtomStorage,
    buffer: &'a mut Buffer,
    cache_capacity: usize,
}

impl<'a, C: Communicator> AtomCollector<'a, C> {
    pub fn new(
        ctx: DomainContext<'a, C>,
        storage: &'a AtomStorage,
        buffer: &'a mut Buffer,
        cache_capacity: usize,
    ) -> Result<Self, CommError> {
        if cache_capacity == 0 {
            return Err(CommError::Configuration(
                "atom collection cache capacity must be positive".into(),
            ));
        }
        Ok(Self {
            ctx,
            storage,
            buffer,
            cache_capacity,
        })
    }

    /// Streams this rank's owned atoms to the master.
    ///
    /// # Return
    ///
    /// The number of atoms sent.
    pub fn send(mut self) -> Result<usize, CommError> {
        require_worker(&self.ctx, "AtomCollector::send")?;
        let atoms: Vec<&Atom> = self.storage.owned_atoms().collect();
        let mut chunks = atoms.chunks(self.cache_capacity).peekable();
        if chunks.peek().is_none() {
            self.buffer.begin_send_block(BlockKind::Atom)?;
            self.buffer.end_send_block(true)?;
            self.buffer.send(self.ctx.comm, 0, tags::ATOM_COLLECTION)?;
            return Ok(0);
        }
        while let Some(chunk) = chunks.next() {
            self.buffer.begin_send_block(BlockKind::Atom)?;
            for atom in chunk {
                self.buffer.pack_atom(atom)?;
            }
            self.buffer.end_send_block(chunks.peek().is_none())?;
            self.buffer.send(self.ctx.comm, 0, tags::ATOM_COLLECTION)?;
        }
        debug!(rank = self.ctx.rank(), atoms = atoms.len(), "Sent atoms for collection");
        Ok(atoms.len())
    }

    /// Gathers all owned atoms on the master: the master's own first, then
    /// each rank's in rank order. Collected atoms are never ghosts and carry
    /// zero force.
    pub fn collect(mut self) -> Result<Vec<Atom>, CommError> {
        require_master(&self.ctx, "AtomCollector::collect")?;
        let mut atoms: Vec<Atom> = self
            .storage
            .owned_atoms()
            .map(|atom| {
                let mut atom = atom.clone();
                atom.force = nalgebra::Vector3::zeros();
                atom
            })
            .collect();
        for source in 0..self.ctx.n_procs() {
            if source == self.ctx.rank() {
                continue;
            }
            loop {
                self.buffer.recv(self.ctx.comm, source, tags::ATOM_COLLECTION)?;
                let (kind, count, is_complete) = self.buffer.begin_recv_block()?;
                if kind != BlockKind::Atom {
                    return Err(CommError::BlockMismatch {
                        expected: BlockKind::Atom,
                        found: kind.to_string(),
                    });
                }
                for _ in 0..count {
                    atoms.push(self.buffer.unpack_atom()?);
                }
                self.buffer.end_recv_block()?;
                if is_complete {
                    break;
                }
            }
        }
        info!(atoms = atoms.len(), "Atom collection complete");
        Ok(atoms)
    }
}
