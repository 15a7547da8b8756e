use super::communicator::{Communicator, Tag};
use super::error::CommError;
use crate::core::models::atom::Atom;
use crate::core::models::group::Group;
use crate::core::models::mask::{MASK_CAPACITY, Mask};
use byteorder::{ByteOrder, LittleEndian};
use nalgebra::Vector3;
use std::fmt;

/// Block header: kind code (u8), group arity (u8), record count (u32),
/// completion flag (u8).
pub const HEADER_SIZE: usize = 7;
/// id, type, position, velocity, mask size, mask partners.
pub const ATOM_RECORD_SIZE: usize = 4 + 4 + 24 + 24 + 1 + 4 * MASK_CAPACITY;
/// id, type, position.
pub const GHOST_RECORD_SIZE: usize = 4 + 4 + 24;
pub const UPDATE_RECORD_SIZE: usize = 24;
pub const FORCE_RECORD_SIZE: usize = 24;

/// Headers reserved on top of the record space by [`Buffer::for_capacities`].
const HEADER_SLACK: usize = 8;

/// Size in bytes of one record of a group with `arity` members.
pub const fn group_record_size(arity: usize) -> usize {
    4 + 4 + 4 * arity
}

/// The record type carried by one block of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// Complete atom state, used for distribution, collection and migration.
    Atom,
    /// Id, type and position, used when building ghosts.
    Ghost,
    /// Position only, used when refreshing ghosts.
    Update,
    /// Force only, used for reverse communication.
    Force,
    /// A bonded group with the given number of members.
    Group(usize),
}

impl BlockKind {
    pub fn record_size(self) -> usize {
        match self {
            BlockKind::Atom => ATOM_RECORD_SIZE,
            BlockKind::Ghost => GHOST_RECORD_SIZE,
            BlockKind::Update => UPDATE_RECORD_SIZE,
            BlockKind::Force => FORCE_RECORD_SIZE,
            BlockKind::Group(arity) => group_record_size(arity),
        }
    }

    fn code(self) -> (u8, u8) {
        match self {
            BlockKind::Atom => (1, 0),
            BlockKind::Ghost => (2, 0),
            BlockKind::Update => (3, 0),
            BlockKind::Force => (4, 0),
            BlockKind::Group(arity) => (5, arity as u8),
        }
    }

    fn from_code(code: u8, arity: u8) -> Option<Self> {
        match code {
            1 => Some(BlockKind::Atom),
            2 => Some(BlockKind::Ghost),
            3 => Some(BlockKind::Update),
            4 => Some(BlockKind::Force),
            5 if arity > 0 => Some(BlockKind::Group(arity as usize)),
            _ => None,
        }
    }
}

impl fmt::Display for BlockKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKind::Atom => write!(f, "atom"),
            BlockKind::Ghost => write!(f, "ghost"),
            BlockKind::Update => write!(f, "position update"),
            BlockKind::Force => write!(f, "force"),
            BlockKind::Group(arity) => write!(
                f,
                "{}",
                crate::core::models::group::group_kind_name(*arity)
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct OpenSendBlock {
    kind: BlockKind,
    header_pos: usize,
    count: usize,
}

#[derive(Debug, Clone, Copy)]
struct OpenRecvBlock {
    kind: BlockKind,
    remaining: usize,
}

/// A fixed-capacity message buffer for one domain.
///
/// A message is a sequence of blocks, each a header followed by records of a
/// single [`BlockKind`]. The send side is filled with `begin_send_block`,
/// `pack_*` and `end_send_block`, then handed to the communicator with
/// [`send`](Self::send). The receive side is read back in the same order with
/// `begin_recv_block`, `unpack_*` and `end_recv_block`.
///
/// The capacity bounds the size of every outgoing message and never grows.
/// Packing a record that does not fit fails with
/// [`CommError::BufferOverflow`] and leaves what was already packed intact.
#[derive(Debug)]
pub struct Buffer {
    capacity: usize,
    send: Vec<u8>,
    send_block: Option<OpenSendBlock>,
    recv: Vec<u8>,
    recv_pos: usize,
    recv_block: Option<OpenRecvBlock>,
    max_send_size: usize,
}

impl Buffer {
    /// Creates a buffer whose messages hold at most `capacity` bytes.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] if `capacity` cannot hold a single
    /// block header.
    pub fn new(capacity: usize) -> Result<Self, CommError> {
        if capacity < HEADER_SIZE {
            return Err(CommError::Configuration(format!(
                "buffer capacity of {} bytes cannot hold a block header",
                capacity
            )));
        }
        Ok(Self {
            capacity,
            send: Vec::with_capacity(capacity),
            send_block: None,
            recv: Vec::new(),
            recv_pos: 0,
            recv_block: None,
            max_send_size: 0,
        })
    }

    /// Creates a buffer large enough to send every owned atom or every ghost
    /// of a storage in one message.
    pub fn for_capacities(atom_capacity: usize, ghost_capacity: usize) -> Result<Self, CommError> {
        let records = (atom_capacity * ATOM_RECORD_SIZE).max(ghost_capacity * GHOST_RECORD_SIZE);
        Self::new(records + HEADER_SLACK * HEADER_SIZE)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Largest message sent so far, in bytes.
    pub fn max_send_size(&self) -> usize {
        self.max_send_size
    }

    /// Bytes currently packed on the send side.
    pub fn send_size(&self) -> usize {
        self.send.len()
    }

    /// Discards everything packed on the send side.
    pub fn clear_send(&mut self) {
        self.send.clear();
        self.send_block = None;
    }

    // --- Send side ---

    /// Opens a new block of `kind` on the send side.
    pub fn begin_send_block(&mut self, kind: BlockKind) -> Result<(), CommError> {
        if self.send_block.is_some() {
            return Err(CommError::BufferState("a send block is already open"));
        }
        if self.send.len() + HEADER_SIZE > self.capacity {
            return Err(CommError::BufferOverflow {
                kind,
                elements: 0,
                needed: self.send.len() + HEADER_SIZE,
                capacity: self.capacity,
            });
        }
        let header_pos = self.send.len();
        let (code, arity) = kind.code();
        self.send.extend_from_slice(&[code, arity, 0, 0, 0, 0, 0]);
        self.send_block = Some(OpenSendBlock {
            kind,
            header_pos,
            count: 0,
        });
        Ok(())
    }

    /// Closes the open send block, recording its record count and whether it
    /// is the last block the receiver should expect.
    pub fn end_send_block(&mut self, is_complete: bool) -> Result<(), CommError> {
        let block = self
            .send_block
            .take()
            .ok_or(CommError::BufferState("no send block is open"))?;
        let pos = block.header_pos;
        LittleEndian::write_u32(&mut self.send[pos + 2..pos + 6], block.count as u32);
        self.send[pos + 6] = is_complete as u8;
        Ok(())
    }

    /// Checks that one more record of `kind` fits and counts it.
    fn reserve(&mut self, kind: BlockKind) -> Result<(), CommError> {
        let block = self
            .send_block
            .as_mut()
            .ok_or(CommError::BufferState("no send block is open"))?;
        if block.kind != kind {
            return Err(CommError::BlockMismatch {
                expected: kind,
                found: block.kind.to_string(),
            });
        }
        let needed = self.send.len() + kind.record_size();
        if needed > self.capacity {
            return Err(CommError::BufferOverflow {
                kind,
                elements: block.count + 1,
                needed,
                capacity: self.capacity,
            });
        }
        block.count += 1;
        Ok(())
    }

    fn put_u32(&mut self, value: u32) {
        let start = self.send.len();
        self.send.resize(start + 4, 0);
        LittleEndian::write_u32(&mut self.send[start..], value);
    }

    fn put_vector(&mut self, value: &Vector3<f64>) {
        let start = self.send.len();
        self.send.resize(start + 24, 0);
        LittleEndian::write_f64_into(value.as_slice(), &mut self.send[start..]);
    }

    pub fn pack_atom(&mut self, atom: &Atom) -> Result<(), CommError> {
        self.reserve(BlockKind::Atom)?;
        self.put_u32(atom.id);
        self.put_u32(atom.type_id);
        self.put_vector(&atom.position);
        self.put_vector(&atom.velocity);
        self.send.push(atom.mask.size() as u8);
        let mut partners = [0u32; MASK_CAPACITY];
        partners[..atom.mask.size()].copy_from_slice(atom.mask.as_slice());
        for partner in partners {
            self.put_u32(partner);
        }
        Ok(())
    }

    /// Packs the id, type and given position of a ghost. The position is
    /// passed separately so that periodic image shifts need not touch the atom.
    pub fn pack_ghost(&mut self, atom: &Atom, position: &Vector3<f64>) -> Result<(), CommError> {
        self.reserve(BlockKind::Ghost)?;
        self.put_u32(atom.id);
        self.put_u32(atom.type_id);
        self.put_vector(position);
        Ok(())
    }

    pub fn pack_update(&mut self, position: &Vector3<f64>) -> Result<(), CommError> {
        self.reserve(BlockKind::Update)?;
        self.put_vector(position);
        Ok(())
    }

    pub fn pack_force(&mut self, force: &Vector3<f64>) -> Result<(), CommError> {
        self.reserve(BlockKind::Force)?;
        self.put_vector(force);
        Ok(())
    }

    pub fn pack_group<const N: usize>(&mut self, group: &Group<N>) -> Result<(), CommError> {
        self.reserve(BlockKind::Group(N))?;
        self.put_u32(group.id);
        self.put_u32(group.type_id);
        for atom_id in &group.atom_ids {
            self.put_u32(*atom_id);
        }
        Ok(())
    }

    /// Sends the packed message to `dest` and empties the send side.
    pub fn send<C: Communicator>(&mut self, comm: &C, dest: usize, tag: Tag) -> Result<(), CommError> {
        if self.send_block.is_some() {
            return Err(CommError::BufferState("cannot send while a block is open"));
        }
        self.max_send_size = self.max_send_size.max(self.send.len());
        let payload = std::mem::replace(&mut self.send, Vec::with_capacity(self.capacity));
        comm.send(dest, tag, payload)
    }

    /// Receives the next message from `source`, replacing the receive side.
    pub fn recv<C: Communicator>(&mut self, comm: &C, source: usize, tag: Tag) -> Result<(), CommError> {
        self.recv = comm.recv(source, tag)?;
        self.recv_pos = 0;
        self.recv_block = None;
        Ok(())
    }

    /// Sends the packed message to `dest`, then receives from `source`.
    ///
    /// Sends never block, so every rank can call this in the same order
    /// without deadlock.
    pub fn send_recv<C: Communicator>(
        &mut self,
        comm: &C,
        dest: usize,
        source: usize,
        tag: Tag,
    ) -> Result<(), CommError> {
        self.send(comm, dest, tag)?;
        self.recv(comm, source, tag)
    }

    // --- Receive side ---

    /// Returns `true` if the received message has another block to read.
    pub fn has_recv_block(&self) -> bool {
        self.recv_block.is_none() && self.recv_pos < self.recv.len()
    }

    /// Opens the next block of the received message.
    ///
    /// # Return
    ///
    /// The block kind, its record count, and its completion flag.
    pub fn begin_recv_block(&mut self) -> Result<(BlockKind, usize, bool), CommError> {
        if self.recv_block.is_some() {
            return Err(CommError::BufferState("a receive block is already open"));
        }
        let header = self.take(HEADER_SIZE)?;
        let (code, arity) = (header[0], header[1]);
        let count = LittleEndian::read_u32(&header[2..6]) as usize;
        let is_complete = header[6] != 0;
        let kind = BlockKind::from_code(code, arity).ok_or_else(|| {
            CommError::Malformed(format!("unknown block kind code {} (arity {})", code, arity))
        })?;
        let remaining_bytes = self.recv.len() - self.recv_pos;
        if count * kind.record_size() > remaining_bytes {
            return Err(CommError::Malformed(format!(
                "{} block announces {} records but only {} bytes remain",
                kind, count, remaining_bytes
            )));
        }
        self.recv_block = Some(OpenRecvBlock {
            kind,
            remaining: count,
        });
        Ok((kind, count, is_complete))
    }

    /// Closes the open receive block. Every record must have been unpacked.
    pub fn end_recv_block(&mut self) -> Result<(), CommError> {
        let block = self
            .recv_block
            .take()
            .ok_or(CommError::BufferState("no receive block is open"))?;
        if block.remaining != 0 {
            return Err(CommError::BufferState("receive block closed with unread records"));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&[u8], CommError> {
        let end = self.recv_pos + len;
        if end > self.recv.len() {
            return Err(CommError::BufferUnderflow(format!(
                "need {} bytes at offset {} of a {}-byte message",
                len,
                self.recv_pos,
                self.recv.len()
            )));
        }
        let bytes = &self.recv[self.recv_pos..end];
        self.recv_pos = end;
        Ok(bytes)
    }

    fn next_record(&mut self, kind: BlockKind) -> Result<&[u8], CommError> {
        let block = self
            .recv_block
            .as_mut()
            .ok_or(CommError::BufferState("no receive block is open"))?;
        if block.kind != kind {
            return Err(CommError::BlockMismatch {
                expected: kind,
                found: block.kind.to_string(),
            });
        }
        if block.remaining == 0 {
            return Err(CommError::BufferUnderflow(format!(
                "no {} records left in the current block",
                kind
            )));
        }
        block.remaining -= 1;
        self.take(kind.record_size())
    }

    pub fn unpack_atom(&mut self) -> Result<Atom, CommError> {
        let record = self.next_record(BlockKind::Atom)?;
        let id = LittleEndian::read_u32(&record[0..4]);
        let type_id = LittleEndian::read_u32(&record[4..8]);
        let position = read_vector(&record[8..32]);
        let velocity = read_vector(&record[32..56]);
        let mask_size = record[56] as usize;
        if mask_size > MASK_CAPACITY {
            return Err(CommError::Malformed(format!(
                "atom {} carries a mask of size {}",
                id, mask_size
            )));
        }
        let mut mask = Mask::new();
        for i in 0..mask_size {
            let start = 57 + 4 * i;
            let partner = LittleEndian::read_u32(&record[start..start + 4]);
            mask.append(partner)
                .map_err(|e| CommError::Malformed(e.to_string()))?;
        }
        let mut atom = Atom::new(id, type_id, position).with_velocity(velocity);
        atom.mask = mask;
        Ok(atom)
    }

    /// Unpacks a ghost record into a new ghost atom with zero velocity.
    pub fn unpack_ghost(&mut self) -> Result<Atom, CommError> {
        let record = self.next_record(BlockKind::Ghost)?;
        let id = LittleEndian::read_u32(&record[0..4]);
        let type_id = LittleEndian::read_u32(&record[4..8]);
        let position = read_vector(&record[8..32]);
        let mut atom = Atom::new(id, type_id, position);
        atom.is_ghost = true;
        Ok(atom)
    }

    pub fn unpack_update(&mut self) -> Result<Vector3<f64>, CommError> {
        let record = self.next_record(BlockKind::Update)?;
        Ok(read_vector(record))
    }

    pub fn unpack_force(&mut self) -> Result<Vector3<f64>, CommError> {
        let record = self.next_record(BlockKind::Force)?;
        Ok(read_vector(record))
    }

    pub fn unpack_group<const N: usize>(&mut self) -> Result<Group<N>, CommError> {
        let record = self.next_record(BlockKind::Group(N))?;
        let id = LittleEndian::read_u32(&record[0..4]);
        let type_id = LittleEndian::read_u32(&record[4..8]);
        let mut atom_ids = [0; N];
        LittleEndian::read_u32_into(&record[8..8 + 4 * N], &mut atom_ids);
        Ok(Group::new(id, type_id, atom_ids))
    }
}

fn read_vector(bytes: &[u8]) -> Vector3<f64> {
    let mut components = [0.0; 3];
    LittleEndian::read_f64_into(&bytes[..24], &mut components);
    Vector3::from(components)
}
