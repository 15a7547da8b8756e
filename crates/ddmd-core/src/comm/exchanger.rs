use super::buffer::{BlockKind, Buffer};
use super::communicator::{Communicator, tags};
use super::context::DomainContext;
use super::error::CommError;
use crate::core::boundary::{Boundary, DIMENSION, wrap_unit};
use crate::core::models::ids::{AtomId, AtomSlot};
use crate::core::storage::{AtomStorage, BondedStorage, GroupStorage, StorageError};
use std::collections::HashSet;
use tracing::{debug, trace};

/// Scaled distance within which a converted position still counts as inside
/// its domain.
const ROUND_OFF: f64 = 1e-12;

/// Cutoffs that decide how deep the ghost layer is.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExchangeConfig {
    /// Maximum range of the pair potential, in Cartesian units.
    pub pair_cutoff: f64,
    /// Extra margin that lets atoms move between full exchanges.
    pub skin: f64,
    /// Whether ghost forces are sent back to their owners.
    pub reverse_update: bool,
}

impl ExchangeConfig {
    /// Depth of the ghost layer, in Cartesian units.
    pub fn ghost_width(&self) -> f64 {
        self.pair_cutoff + self.skin
    }
}

/// Where the exchanger is in its cycle.
///
/// A full exchange moves through `Migrating` and `RebuildingGhosts` back to
/// `Settled`; moving atoms marks `NeedsGhostUpdate` until the ghosts are
/// refreshed. `BufferOverflow` and `Failed` are terminal: the first is entered
/// by any overflow, the second by any other error that interrupts a full
/// exchange after it started moving atoms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeState {
    Settled,
    NeedsGhostUpdate,
    Migrating,
    RebuildingGhosts,
    BufferOverflow,
    Failed,
}

/// Running totals kept by an [`Exchanger`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeStatistics {
    pub exchanges: u64,
    pub updates: u64,
    pub reverse_updates: u64,
    pub atoms_migrated: u64,
    pub ghosts_created: u64,
    pub max_send_size: usize,
}

/// Expected global totals, used by [`Exchanger::validate`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCounts {
    pub atoms: usize,
    pub bonds: usize,
    pub angles: usize,
    pub dihedrals: usize,
}

/// One recorded ghost communication: what was sent to `dest` and which
/// ghost slots were filled from `source`.
#[derive(Debug, Clone)]
struct PlanStep {
    axis: usize,
    dest: usize,
    source: usize,
    /// Periodic image shift applied to sent positions, in scaled units.
    shift: f64,
    sends: Vec<AtomSlot>,
    received: Vec<AtomSlot>,
}

/// Moves atoms between neighbouring domains and maintains ghost layers.
///
/// A full [`exchange`](Self::exchange) migrates atoms to their owners, then
/// rebuilds the ghosts and records the communication as a plan. Between
/// full exchanges, [`update`](Self::update) replays the plan with positions
/// only and [`reverse_update`](Self::reverse_update) replays it backwards
/// with forces. Every rank must make the same sequence of calls.
pub struct Exchanger<'a, C: Communicator> {
    ctx: DomainContext<'a, C>,
    config: ExchangeConfig,
    buffer: Buffer,
    state: ExchangeState,
    /// Message of the error that made the state terminal.
    failure: Option<String>,
    plan: Vec<PlanStep>,
    has_plan: bool,
    statistics: ExchangeStatistics,
    step: u64,
}

impl<'a, C: Communicator> Exchanger<'a, C> {
    /// Creates an exchanger that owns `buffer` for all of its messages.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] if the cutoff is not positive or
    /// the skin is negative.
    pub fn new(ctx: DomainContext<'a, C>, config: ExchangeConfig, buffer: Buffer) -> Result<Self, CommError> {
        if !(config.pair_cutoff.is_finite() && config.pair_cutoff > 0.0) {
            return Err(CommError::Configuration(format!(
                "pair cutoff must be positive, got {}",
                config.pair_cutoff
            )));
        }
        if !(config.skin.is_finite() && config.skin >= 0.0) {
            return Err(CommError::Configuration(format!(
                "skin must be non-negative, got {}",
                config.skin
            )));
        }
        Ok(Self {
            ctx,
            config,
            buffer,
            state: ExchangeState::Settled,
            failure: None,
            plan: Vec::new(),
            has_plan: false,
            statistics: ExchangeStatistics::default(),
            step: 0,
        })
    }

    pub fn config(&self) -> &ExchangeConfig {
        &self.config
    }

    pub fn state(&self) -> ExchangeState {
        self.state
    }

    pub fn statistics(&self) -> ExchangeStatistics {
        ExchangeStatistics {
            max_send_size: self.buffer.max_send_size(),
            ..self.statistics
        }
    }

    /// The buffer is shared with distribution and collection, which run
    /// while no exchange is in progress.
    pub fn buffer_mut(&mut self) -> &mut Buffer {
        &mut self.buffer
    }

    /// Records that positions have advanced since the last ghost refresh.
    pub fn mark_moved(&mut self) {
        if self.state == ExchangeState::Settled {
            self.state = ExchangeState::NeedsGhostUpdate;
        }
    }

    fn begin(&mut self) -> Result<(), CommError> {
        match self.state {
            ExchangeState::Settled | ExchangeState::NeedsGhostUpdate => {
                self.step += 1;
                Ok(())
            }
            _ => Err(CommError::ExchangerFailed {
                cause: self
                    .failure
                    .clone()
                    .unwrap_or_else(|| format!("interrupted while {:?}", self.state)),
            }),
        }
    }

    /// Wraps an error with this rank and step. Overflows, and errors that
    /// leave a full exchange half done, move the exchanger to a terminal state.
    fn finish<T>(&mut self, result: Result<T, CommError>) -> Result<T, CommError> {
        result.map_err(|error| {
            let terminal = if error.is_overflow() {
                Some(ExchangeState::BufferOverflow)
            } else if matches!(
                self.state,
                ExchangeState::Migrating | ExchangeState::RebuildingGhosts
            ) {
                Some(ExchangeState::Failed)
            } else {
                None
            };
            let error = CommError::Step {
                rank: self.ctx.rank(),
                step: self.step,
                source: Box::new(error),
            };
            if let Some(state) = terminal {
                self.state = state;
                self.failure = Some(error.to_string());
            }
            error
        })
    }

    /// Performs a full exchange: migration of atoms to their owners, pruning
    /// of groups, and a complete rebuild of the ghost layer.
    ///
    /// # Arguments
    ///
    /// * `atoms` - This domain's atoms, in scaled coordinates.
    /// * `groups` - This domain's bonded groups.
    /// * `boundary` - The current periodic cell.
    ///
    /// # Errors
    ///
    /// Errors are wrapped in [`CommError::Step`]. A buffer overflow leaves the
    /// exchanger in the terminal [`ExchangeState::BufferOverflow`] state, and
    /// any other error raised after migration began leaves it
    /// [`ExchangeState::Failed`]. Later calls then return
    /// [`CommError::ExchangerFailed`] carrying the original message.
    pub fn exchange(
        &mut self,
        atoms: &mut AtomStorage,
        groups: &mut BondedStorage,
        boundary: &Boundary,
    ) -> Result<(), CommError> {
        self.begin()?;
        let result = self.run_exchange(atoms, groups, boundary);
        self.finish(result)
    }

    fn ghost_widths(&self, boundary: &Boundary) -> Result<[f64; DIMENSION], CommError> {
        let mut widths = [0.0; DIMENSION];
        for (axis, width) in widths.iter_mut().enumerate() {
            *width = boundary.scaled_width(axis, self.config.ghost_width());
            let domain_width = self.ctx.domain.domain_width(axis);
            if *width >= domain_width {
                return Err(CommError::Configuration(format!(
                    "ghost width {:.4} (cutoff + skin, scaled) is not smaller than the domain width {:.4} along axis {}",
                    width, domain_width, axis
                )));
            }
        }
        Ok(widths)
    }

    fn run_exchange(
        &mut self,
        atoms: &mut AtomStorage,
        groups: &mut BondedStorage,
        boundary: &Boundary,
    ) -> Result<(), CommError> {
        if atoms.is_cartesian() {
            return Err(StorageError::CoordinateMode { expected: "scaled" }.into());
        }
        let widths = self.ghost_widths(boundary)?;

        self.state = ExchangeState::Migrating;
        self.has_plan = false;
        self.plan.clear();
        atoms.clear_ghosts();

        let mut migrated = 0;
        for axis in 0..DIMENSION {
            migrated += self.migrate_axis(axis, atoms, groups)?;
        }
        let pruned = groups.prune_unowned(atoms);

        self.state = ExchangeState::RebuildingGhosts;
        for (axis, width) in widths.iter().enumerate() {
            let ghost_start = atoms.n_ghosts();
            for direction in 0..2 {
                self.build_ghosts(axis, direction, *width, ghost_start, atoms)?;
            }
        }

        atoms.make_snapshot(boundary);
        self.has_plan = true;
        self.state = ExchangeState::Settled;

        self.statistics.exchanges += 1;
        self.statistics.atoms_migrated += migrated as u64;
        self.statistics.ghosts_created += atoms.n_ghosts() as u64;
        debug!(
            rank = self.ctx.rank(),
            step = self.step,
            atoms = atoms.n_atoms(),
            ghosts = atoms.n_ghosts(),
            migrated,
            pruned,
            "Exchange complete"
        );
        Ok(())
    }

    /// Decides which direction, if any, an owned atom leaves along `axis`.
    fn departure(&self, axis: usize, s: f64) -> Result<Option<usize>, CommError> {
        let domain = self.ctx.domain;
        let p = domain.grid_dimension(axis);
        let c = domain.coordinate()[axis];
        let cell = domain.axis_cell(axis, wrap_unit(s));
        if cell == c {
            return Ok(None);
        }
        if p == 2 {
            return Ok(Some(if s < domain.domain_bound(axis, 0) { 0 } else { 1 }));
        }
        if cell == (c + p - 1) % p {
            Ok(Some(0))
        } else if cell == (c + 1) % p {
            Ok(Some(1))
        } else {
            Err(self.ctx.inconsistency(format!(
                "atom at scaled coordinate {:.6} along axis {} moved further than one domain",
                s, axis
            )))
        }
    }

    fn migrate_axis(
        &mut self,
        axis: usize,
        atoms: &mut AtomStorage,
        groups: &mut BondedStorage,
    ) -> Result<usize, CommError> {
        if self.ctx.domain.grid_dimension(axis) == 1 {
            for atom in atoms.owned_atoms_mut() {
                atom.position[axis] = wrap_unit(atom.position[axis]);
            }
            return Ok(0);
        }
        let mut migrated = 0;
        for direction in 0..2 {
            let mut leaving: Vec<AtomId> = Vec::new();
            let mut staying: Vec<AtomSlot> = Vec::new();
            for slot in atoms.owned_slots() {
                let Some(atom) = atoms.atom(slot) else {
                    continue;
                };
                match self.departure(axis, atom.position[axis])? {
                    Some(d) if d == direction => leaving.push(atom.id),
                    Some(_) => {}
                    None => staying.push(slot),
                }
            }
            for slot in staying {
                if let Some(atom) = atoms.atom_mut(slot) {
                    atom.position[axis] = wrap_unit(atom.position[axis]);
                }
            }

            self.buffer.begin_send_block(BlockKind::Atom)?;
            for id in &leaving {
                let slot = atoms.find_owned(*id).ok_or(StorageError::UnknownAtom(*id))?;
                if let Some(atom) = atoms.atom(slot) {
                    let mut atom = atom.clone();
                    atom.position[axis] = wrap_unit(atom.position[axis]);
                    self.buffer.pack_atom(&atom)?;
                }
            }
            self.buffer.end_send_block(false)?;
            let departing: HashSet<AtomId> = leaving.iter().copied().collect();
            pack_departing_groups(&mut self.buffer, &groups.bonds, &departing, false)?;
            pack_departing_groups(&mut self.buffer, &groups.angles, &departing, false)?;
            pack_departing_groups(&mut self.buffer, &groups.dihedrals, &departing, true)?;
            for id in &leaving {
                atoms.remove_atom(*id)?;
            }

            let dest = self.ctx.domain.neighbor_rank(axis, direction);
            let source = self.ctx.domain.neighbor_rank(axis, 1 - direction);
            self.buffer
                .send_recv(self.ctx.comm, dest, source, tags::MIGRATION)?;

            let (kind, count, _) = self.buffer.begin_recv_block()?;
            if kind != BlockKind::Atom {
                return Err(CommError::BlockMismatch {
                    expected: BlockKind::Atom,
                    found: kind.to_string(),
                });
            }
            let c = self.ctx.domain.coordinate()[axis];
            for _ in 0..count {
                let atom = self.buffer.unpack_atom()?;
                let s = atom.position[axis];
                if self.ctx.domain.axis_cell(axis, s) != c {
                    return Err(self.ctx.inconsistency(format!(
                        "atom {} arrived from rank {} at scaled coordinate {:.6} along axis {}, outside this domain",
                        atom.id, source, s, axis
                    )));
                }
                atoms.add_atom(atom)?;
            }
            self.buffer.end_recv_block()?;
            unpack_groups(&mut self.buffer, &mut groups.bonds)?;
            unpack_groups(&mut self.buffer, &mut groups.angles)?;
            unpack_groups(&mut self.buffer, &mut groups.dihedrals)?;

            trace!(
                rank = self.ctx.rank(),
                axis,
                direction,
                sent = leaving.len(),
                received = count,
                "Migration step"
            );
            migrated += leaving.len();
        }
        Ok(migrated)
    }

    fn build_ghosts(
        &mut self,
        axis: usize,
        direction: usize,
        width: f64,
        ghost_start: usize,
        atoms: &mut AtomStorage,
    ) -> Result<(), CommError> {
        let domain = self.ctx.domain;
        let p = domain.grid_dimension(axis);
        let c = domain.coordinate()[axis];
        let (shift, bound) = if direction == 0 {
            (if c == 0 { 1.0 } else { 0.0 }, domain.domain_bound(axis, 0) + width)
        } else {
            (if c == p - 1 { -1.0 } else { 0.0 }, domain.domain_bound(axis, 1) - width)
        };

        let mut candidates = atoms.owned_slots();
        candidates.extend_from_slice(&atoms.ghost_slots()[..ghost_start]);

        let mut sends = Vec::new();
        self.buffer.begin_send_block(BlockKind::Ghost)?;
        for slot in candidates {
            let Some(atom) = atoms.atom(slot) else {
                continue;
            };
            let s = atom.position[axis];
            let in_layer = if direction == 0 { s < bound } else { s >= bound };
            if in_layer {
                let mut image = atom.position;
                image[axis] += shift;
                self.buffer.pack_ghost(atom, &image)?;
                sends.push(slot);
            }
        }
        self.buffer.end_send_block(true)?;

        let dest = domain.neighbor_rank(axis, direction);
        let source = domain.neighbor_rank(axis, 1 - direction);
        self.buffer
            .send_recv(self.ctx.comm, dest, source, tags::GHOSTS)?;

        let (kind, count, _) = self.buffer.begin_recv_block()?;
        if kind != BlockKind::Ghost {
            return Err(CommError::BlockMismatch {
                expected: BlockKind::Ghost,
                found: kind.to_string(),
            });
        }
        let mut received = Vec::with_capacity(count);
        for _ in 0..count {
            let ghost = self.buffer.unpack_ghost()?;
            received.push(atoms.add_ghost(ghost)?);
        }
        self.buffer.end_recv_block()?;

        trace!(
            rank = self.ctx.rank(),
            axis,
            direction,
            sent = sends.len(),
            received = received.len(),
            "Ghost step"
        );
        self.plan.push(PlanStep {
            axis,
            dest,
            source,
            shift,
            sends,
            received,
        });
        Ok(())
    }

    /// Refreshes ghost positions by replaying the plan of the last full
    /// exchange. Works in either coordinate mode.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::NoGhostPlan`] (wrapped in [`CommError::Step`]) if
    /// no full exchange has completed.
    pub fn update(&mut self, atoms: &mut AtomStorage, boundary: &Boundary) -> Result<(), CommError> {
        self.begin()?;
        let result = self.run_update(atoms, boundary);
        self.finish(result)
    }

    fn run_update(&mut self, atoms: &mut AtomStorage, boundary: &Boundary) -> Result<(), CommError> {
        if !self.has_plan {
            return Err(CommError::NoGhostPlan);
        }
        let cartesian = atoms.is_cartesian();
        for step in &self.plan {
            let shift = if cartesian {
                step.shift * boundary.length(step.axis)
            } else {
                step.shift
            };
            self.buffer.begin_send_block(BlockKind::Update)?;
            for slot in &step.sends {
                let atom = atoms.atom(*slot).ok_or_else(stale_plan)?;
                let mut position = atom.position;
                position[step.axis] += shift;
                self.buffer.pack_update(&position)?;
            }
            self.buffer.end_send_block(true)?;
            self.buffer
                .send_recv(self.ctx.comm, step.dest, step.source, tags::GHOST_UPDATE)?;

            let (kind, count, _) = self.buffer.begin_recv_block()?;
            if kind != BlockKind::Update || count != step.received.len() {
                return Err(CommError::Malformed(format!(
                    "expected {} position updates from rank {}, got a {} block of {}",
                    step.received.len(),
                    step.source,
                    kind,
                    count
                )));
            }
            for slot in &step.received {
                let position = self.buffer.unpack_update()?;
                atoms.atom_mut(*slot).ok_or_else(stale_plan)?.position = position;
            }
            self.buffer.end_recv_block()?;
        }
        self.state = ExchangeState::Settled;
        self.statistics.updates += 1;
        Ok(())
    }

    /// Sends the forces accumulated on ghosts back to the domains that
    /// supplied them and adds them to the source atoms. Ghost forces are zero
    /// afterwards.
    ///
    /// The plan is replayed in reverse, so forces on ghosts that were
    /// themselves forwarded as ghosts travel all the way back to the owner.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] if reverse communication is
    /// disabled, and [`CommError::NoGhostPlan`] if no full exchange has run.
    pub fn reverse_update(&mut self, atoms: &mut AtomStorage) -> Result<(), CommError> {
        if !self.config.reverse_update {
            return Err(CommError::Configuration(
                "reverse force communication is disabled".into(),
            ));
        }
        self.begin()?;
        let result = self.run_reverse_update(atoms);
        self.finish(result)
    }

    fn run_reverse_update(&mut self, atoms: &mut AtomStorage) -> Result<(), CommError> {
        if !self.has_plan {
            return Err(CommError::NoGhostPlan);
        }
        for step in self.plan.iter().rev() {
            self.buffer.begin_send_block(BlockKind::Force)?;
            for slot in &step.received {
                let atom = atoms.atom(*slot).ok_or_else(stale_plan)?;
                self.buffer.pack_force(&atom.force)?;
            }
            self.buffer.end_send_block(true)?;
            self.buffer
                .send_recv(self.ctx.comm, step.source, step.dest, tags::REVERSE_FORCE)?;

            let (kind, count, _) = self.buffer.begin_recv_block()?;
            if kind != BlockKind::Force || count != step.sends.len() {
                return Err(CommError::Malformed(format!(
                    "expected {} ghost forces from rank {}, got a {} block of {}",
                    step.sends.len(),
                    step.dest,
                    kind,
                    count
                )));
            }
            for slot in &step.sends {
                let force = self.buffer.unpack_force()?;
                atoms.atom_mut(*slot).ok_or_else(stale_plan)?.force += force;
            }
            self.buffer.end_recv_block()?;
        }
        atoms.zero_ghost_forces();
        self.statistics.reverse_updates += 1;
        Ok(())
    }

    /// Returns `true` on every rank if any owned atom has moved more than half
    /// the skin since the last full exchange. Collective.
    pub fn needs_exchange(&self, atoms: &AtomStorage, boundary: &Boundary) -> Result<bool, CommError> {
        let local = atoms.max_sq_displacement(boundary);
        let global = self.ctx.comm.all_reduce_max(local)?;
        let half_skin = 0.5 * self.config.skin;
        Ok(global > half_skin * half_skin)
    }

    /// Checks local storage consistency and global conservation. Collective.
    ///
    /// Every owned atom must lie in this domain, the global owned-atom count
    /// and authoritative group counts must match `expected`, and no atom id
    /// may be owned by two domains. Atoms drift across faces between full
    /// exchanges, so the ownership check only holds right after one.
    /// Cartesian storages are checked with a round-off allowance.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::OwnershipInconsistency`] describing the first
    /// violation found, or a storage error for local corruption.
    pub fn validate(
        &self,
        atoms: &AtomStorage,
        groups: &BondedStorage,
        boundary: &Boundary,
        expected: &GlobalCounts,
    ) -> Result<(), CommError> {
        atoms.is_valid()?;
        groups.is_valid(atoms)?;
        for atom in atoms.owned_atoms() {
            // Cartesian positions are products of the stored scaled ones, so
            // converting back may land a few ulps across a domain face.
            let (s, inside) = if atoms.is_cartesian() {
                let s = boundary.transform_cart_to_gen(&atom.position);
                (s, self.ctx.domain.is_near_domain(&s, ROUND_OFF))
            } else {
                (atom.position, self.ctx.domain.is_in_domain(&atom.position))
            };
            if !inside {
                return Err(self.ctx.inconsistency(format!(
                    "owned atom {} at scaled position {:?} lies outside this domain",
                    atom.id,
                    s.as_slice()
                )));
            }
        }

        let comm = self.ctx.comm;
        let [bonds, angles, dihedrals] = groups.authoritative_counts(atoms);
        let totals = [
            ("atoms", comm.all_reduce_sum(atoms.n_atoms() as u64)?, expected.atoms),
            ("bonds", comm.all_reduce_sum(bonds as u64)?, expected.bonds),
            ("angles", comm.all_reduce_sum(angles as u64)?, expected.angles),
            ("dihedrals", comm.all_reduce_sum(dihedrals as u64)?, expected.dihedrals),
        ];

        let mut ids = Vec::with_capacity(4 * atoms.n_atoms());
        for atom in atoms.owned_atoms() {
            ids.extend_from_slice(&atom.id.to_le_bytes());
        }
        let duplicate = match comm.gather(ids)? {
            Some(all) => {
                let mut seen = HashSet::new();
                all.iter()
                    .flat_map(|bytes| bytes.chunks_exact(4))
                    .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
                    .find(|id| !seen.insert(*id))
            }
            None => None,
        };
        let flag = comm.broadcast(duplicate.map_or(Vec::new(), |id| id.to_le_bytes().to_vec()))?;

        for (what, total, expected) in totals {
            if total as usize != expected {
                return Err(self.ctx.inconsistency(format!(
                    "{} {} held across domains, expected {}",
                    total, what, expected
                )));
            }
        }
        if flag.len() == 4 {
            let id = u32::from_le_bytes([flag[0], flag[1], flag[2], flag[3]]);
            return Err(self.ctx.inconsistency(format!(
                "atom {} is owned by more than one domain",
                id
            )));
        }
        Ok(())
    }
}

fn stale_plan() -> CommError {
    CommError::Storage(StorageError::Inconsistent(
        "ghost plan refers to a slot that no longer exists".into(),
    ))
}

fn pack_departing_groups<const N: usize>(
    buffer: &mut Buffer,
    groups: &GroupStorage<N>,
    departing: &HashSet<AtomId>,
    is_last: bool,
) -> Result<(), CommError> {
    buffer.begin_send_block(BlockKind::Group(N))?;
    for group in groups.iter() {
        if group.atom_ids.iter().any(|id| departing.contains(id)) {
            buffer.pack_group(group)?;
        }
    }
    buffer.end_send_block(is_last)
}

fn unpack_groups<const N: usize>(buffer: &mut Buffer, groups: &mut GroupStorage<N>) -> Result<usize, CommError> {
    let (kind, count, _) = buffer.begin_recv_block()?;
    if kind != BlockKind::Group(N) {
        return Err(CommError::BlockMismatch {
            expected: BlockKind::Group(N),
            found: kind.to_string(),
        });
    }
    let mut added = 0;
    for _ in 0..count {
        let group = buffer.unpack_group::<N>()?;
        if !groups.contains(group.id) {
            groups.add(group)?;
            added += 1;
        }
    }
    buffer.end_recv_block()?;
    Ok(added)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::ChannelCommunicator;
    use crate::comm::domain::Domain;
    use crate::core::models::atom::Atom;
    use crate::core::models::group::Bond;
    use nalgebra::Vector3;

    fn config() -> ExchangeConfig {
        ExchangeConfig {
            pair_cutoff: 1.0,
            skin: 0.5,
            reverse_update: true,
        }
    }

    #[test]
    fn new_rejects_bad_cutoffs() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let bad = ExchangeConfig {
            pair_cutoff: 0.0,
            ..config()
        };
        assert!(Exchanger::new(ctx, bad, Buffer::new(1024).unwrap()).is_err());
        let bad = ExchangeConfig { skin: -1.0, ..config() };
        assert!(Exchanger::new(ctx, bad, Buffer::new(1024).unwrap()).is_err());
    }

    #[test]
    fn single_domain_builds_periodic_images_and_wraps_atoms() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1 << 16).unwrap()).unwrap();

        let mut atoms = AtomStorage::new(8, 64).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();
        atoms.add_atom(Atom::new(0, 0, Vector3::new(0.05, 0.5, 0.5))).unwrap();
        atoms.add_atom(Atom::new(1, 0, Vector3::new(1.02, 0.5, 0.5))).unwrap();
        groups.bonds.add(Bond::new(0, 0, [0, 1])).unwrap();

        exchanger.exchange(&mut atoms, &mut groups, &boundary).unwrap();

        let one = atoms.atom(atoms.find_owned(1).unwrap()).unwrap();
        assert!((one.position.x - 0.02).abs() < 1e-12);
        // Both atoms lie within 0.15 of the x = 0 face, so each gets one
        // image at x + 1 and nothing else.
        assert_eq!(atoms.n_ghosts(), 2);
        assert!(atoms.ghost_atoms().all(|g| g.position.x > 1.0));
        assert_eq!(groups.bonds.len(), 1);
        assert_eq!(exchanger.state(), ExchangeState::Settled);
        atoms.is_valid().unwrap();
    }

    #[test]
    fn update_before_exchange_has_no_plan() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1024).unwrap()).unwrap();
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        let err = exchanger.update(&mut atoms, &boundary).unwrap_err();
        assert!(matches!(
            err,
            CommError::Step { ref source, .. } if matches!(**source, CommError::NoGhostPlan)
        ));
    }

    #[test]
    fn cartesian_storage_and_wide_ghost_layer_are_rejected() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1024).unwrap()).unwrap();
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();

        let tiny = Boundary::cubic(1.0).unwrap();
        assert!(exchanger.exchange(&mut atoms, &mut groups, &tiny).is_err());

        let boundary = Boundary::cubic(10.0).unwrap();
        atoms.transform_gen_to_cart(&boundary).unwrap();
        assert!(exchanger.exchange(&mut atoms, &mut groups, &boundary).is_err());
    }

    #[test]
    fn overflow_is_terminal() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(64).unwrap()).unwrap();
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();
        for id in 0..4 {
            atoms
                .add_atom(Atom::new(id, 0, Vector3::new(0.01, 0.5, 0.5)))
                .unwrap();
        }
        let err = exchanger.exchange(&mut atoms, &mut groups, &boundary).unwrap_err();
        assert!(err.is_overflow());
        assert!(matches!(err, CommError::Step { rank: 0, step: 1, .. }));
        assert_eq!(exchanger.state(), ExchangeState::BufferOverflow);
        match exchanger.exchange(&mut atoms, &mut groups, &boundary) {
            Err(CommError::ExchangerFailed { cause }) => assert!(cause.contains("Buffer overflow")),
            other => panic!("expected ExchangerFailed, got {:?}", other),
        }
    }

    #[test]
    fn interrupted_exchange_reports_its_own_cause() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1 << 16).unwrap()).unwrap();
        // Both atoms need an image across the x = 0 face, but only one fits.
        let mut atoms = AtomStorage::new(8, 1).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();
        atoms.add_atom(Atom::new(0, 0, Vector3::new(0.05, 0.5, 0.5))).unwrap();
        atoms.add_atom(Atom::new(1, 0, Vector3::new(0.06, 0.5, 0.5))).unwrap();

        let err = exchanger.exchange(&mut atoms, &mut groups, &boundary).unwrap_err();
        assert!(!err.is_overflow());
        assert!(matches!(
            err,
            CommError::Step { ref source, .. }
                if matches!(**source, CommError::Storage(StorageError::GhostCapacityExceeded { capacity: 1 }))
        ));
        assert_eq!(exchanger.state(), ExchangeState::Failed);

        for _ in 0..2 {
            match exchanger.exchange(&mut atoms, &mut groups, &boundary) {
                Err(CommError::ExchangerFailed { cause }) => {
                    assert_eq!(cause, err.to_string());
                    assert!(!cause.contains("overflow"));
                }
                other => panic!("expected ExchangerFailed, got {:?}", other),
            }
        }
        assert!(matches!(
            exchanger.update(&mut atoms, &boundary),
            Err(CommError::ExchangerFailed { .. })
        ));
    }

    #[test]
    fn rejected_call_leaves_exchanger_usable() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1 << 16).unwrap()).unwrap();
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();

        assert!(exchanger.update(&mut atoms, &boundary).is_err());
        assert_eq!(exchanger.state(), ExchangeState::Settled);
        exchanger.exchange(&mut atoms, &mut groups, &boundary).unwrap();
    }

    #[test]
    fn mark_moved_and_update_cycle_state() {
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new([1, 1, 1], 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut exchanger = Exchanger::new(ctx, config(), Buffer::new(1 << 16).unwrap()).unwrap();
        let mut atoms = AtomStorage::new(8, 64).unwrap();
        let mut groups = BondedStorage::new(4, 4, 4).unwrap();
        let slot = atoms
            .add_atom(Atom::new(0, 0, Vector3::new(0.05, 0.5, 0.5)))
            .unwrap();
        exchanger.exchange(&mut atoms, &mut groups, &boundary).unwrap();

        atoms.atom_mut(slot).unwrap().position.x = 0.06;
        exchanger.mark_moved();
        assert_eq!(exchanger.state(), ExchangeState::NeedsGhostUpdate);
        exchanger.update(&mut atoms, &boundary).unwrap();
        assert_eq!(exchanger.state(), ExchangeState::Settled);
        let ghost = atoms.ghost_atoms().next().unwrap();
        assert!((ghost.position.x - 1.06).abs() < 1e-12);
        assert!(!exchanger.needs_exchange(&atoms, &boundary).unwrap());

        atoms.atom_mut(slot).unwrap().position.x = 0.1;
        assert!(exchanger.needs_exchange(&atoms, &boundary).unwrap());
        assert_eq!(exchanger.statistics().exchanges, 1);
        assert_eq!(exchanger.statistics().updates, 1);
    }
}
