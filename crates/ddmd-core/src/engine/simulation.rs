use super::config::SimulationConfig;
use super::error::EngineError;
use super::forces::HarmonicBond;
use super::motion::MotionModel;
use crate::comm::buffer::Buffer;
use crate::comm::collector::{AtomCollector, GroupCollector};
use crate::comm::communicator::Communicator;
use crate::comm::context::DomainContext;
use crate::comm::distributor::{AtomDistributor, AtomOwnership, GroupDistributor};
use crate::comm::domain::Domain;
use crate::comm::error::CommError;
use crate::comm::exchanger::{ExchangeState, ExchangeStatistics, Exchanger, GlobalCounts};
use crate::core::boundary::{Boundary, DIMENSION};
use crate::core::io::archive::{ArchiveError, IArchive, OArchive};
use crate::core::models::configuration::Configuration;
use crate::core::models::atom::Atom;
use crate::core::models::group::{Angle, Bond, Dihedral, Group};
use crate::core::storage::{AtomStorage, BondedStorage, GroupStorage};
use byteorder::{ByteOrder, LittleEndian};
use nalgebra::Vector3;
use std::io::{Read, Write};
use tracing::{debug, info, instrument};

const DOMAIN_SECTION: &[u8; 4] = b"DOMN";

type Collected = (Vec<Atom>, Vec<Bond>, Vec<Angle>, Vec<Dihedral>);

/// The complete state of one domain: its cell, storages and exchanger.
///
/// Every method that communicates is collective; all ranks must call it in
/// the same order. Between full exchanges the atom storage holds Cartesian
/// coordinates, so motion and force models work in physical units.
pub struct DomainSimulation<'a, C: Communicator> {
    ctx: DomainContext<'a, C>,
    config: &'a SimulationConfig,
    boundary: Boundary,
    atoms: AtomStorage,
    groups: BondedStorage,
    exchanger: Exchanger<'a, C>,
    counts: GlobalCounts,
    steps_since_exchange: u64,
}

impl<'a, C: Communicator> DomainSimulation<'a, C> {
    /// Creates empty storages and an exchanger sized from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the storage capacities or the buffer size are
    /// invalid, or if the exchange cutoffs are rejected.
    pub fn new(ctx: DomainContext<'a, C>, config: &'a SimulationConfig) -> Result<Self, EngineError> {
        let storage = &config.storage;
        let atoms = AtomStorage::new(storage.atom_capacity, storage.ghost_capacity)?;
        let groups = BondedStorage::new(
            storage.bond_capacity,
            storage.angle_capacity,
            storage.dihedral_capacity,
        )?;
        let buffer = config.make_buffer()?;
        let exchanger = Exchanger::new(ctx, config.exchange, buffer)?;
        Ok(Self {
            ctx,
            config,
            boundary: Boundary::default(),
            atoms,
            groups,
            exchanger,
            counts: GlobalCounts::default(),
            steps_since_exchange: 0,
        })
    }

    pub fn domain(&self) -> &Domain {
        self.ctx.domain
    }

    pub fn rank(&self) -> usize {
        self.ctx.rank()
    }

    pub fn boundary(&self) -> &Boundary {
        &self.boundary
    }

    pub fn atoms(&self) -> &AtomStorage {
        &self.atoms
    }

    pub fn groups(&self) -> &BondedStorage {
        &self.groups
    }

    /// Global totals established by distribution.
    pub fn counts(&self) -> GlobalCounts {
        self.counts
    }

    pub fn statistics(&self) -> ExchangeStatistics {
        self.exchanger.statistics()
    }

    pub fn exchange_state(&self) -> ExchangeState {
        self.exchanger.state()
    }

    /// Scatters a configuration from the master to the owning domains.
    ///
    /// The master passes `Some(configuration)`; other ranks pass `None`.
    /// The cell is broadcast, atoms go to the domain containing them, and
    /// each group is copied to every domain that owns one of its members.
    /// Masks are then built according to the configured policy.
    ///
    /// # Return
    ///
    /// The global atom and group counts.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if the master has no configuration,
    /// and any distribution error, including a global count mismatch.
    #[instrument(skip_all, name = "distribute", fields(rank = self.ctx.rank()))]
    pub fn distribute(&mut self, configuration: Option<&Configuration>) -> Result<GlobalCounts, EngineError> {
        let input = if self.ctx.is_master() {
            Some(configuration.ok_or_else(|| {
                EngineError::Internal("the master rank needs a configuration to distribute".into())
            })?)
        } else {
            None
        };

        let lengths = self.broadcast_lengths(input.map(|c| c.boundary.lengths()))?;
        self.boundary = Boundary::new(lengths)?;
        self.atoms.clear();
        self.groups.clear();

        let ctx = self.ctx;
        let caches = self.config.caches;
        let mut distributor = AtomDistributor::new(
            ctx,
            &mut self.atoms,
            self.exchanger.buffer_mut(),
            caches.atom_cache_capacity,
        )?
        .with_wrap_tolerance(self.config.wrap_tolerance);
        let ownership = match input {
            Some(configuration) => {
                for atom in &configuration.atoms {
                    distributor.add_atom(atom.clone())?;
                }
                Some(distributor.send()?)
            }
            None => {
                distributor.receive()?;
                None
            }
        };

        let buffer = self.exchanger.buffer_mut();
        let cache = caches.group_cache_capacity;
        let sources = input.zip(ownership.as_ref());
        distribute_groups(
            ctx,
            &self.atoms,
            &mut self.groups.bonds,
            buffer,
            cache,
            sources.map(|(c, o)| (c.bonds.as_slice(), o)),
        )?;
        distribute_groups(
            ctx,
            &self.atoms,
            &mut self.groups.angles,
            buffer,
            cache,
            sources.map(|(c, o)| (c.angles.as_slice(), o)),
        )?;
        distribute_groups(
            ctx,
            &self.atoms,
            &mut self.groups.dihedrals,
            buffer,
            cache,
            sources.map(|(c, o)| (c.dihedrals.as_slice(), o)),
        )?;

        self.atoms.set_masks(self.config.mask_policy, &self.groups.bonds)?;
        self.counts = self.count_globally()?;
        self.steps_since_exchange = 0;
        info!(
            atoms = self.atoms.n_atoms(),
            bonds = self.groups.bonds.len(),
            "Domain populated"
        );
        Ok(self.counts)
    }

    fn broadcast_lengths(&self, lengths: Option<&Vector3<f64>>) -> Result<Vector3<f64>, CommError> {
        let mut payload = vec![0u8; 8 * DIMENSION];
        if let Some(lengths) = lengths {
            LittleEndian::write_f64_into(lengths.as_slice(), &mut payload);
        }
        let received = self.ctx.comm.broadcast(payload)?;
        if received.len() != 8 * DIMENSION {
            return Err(CommError::Malformed(format!(
                "cell broadcast carried {} bytes, expected {}",
                received.len(),
                8 * DIMENSION
            )));
        }
        let mut values = [0.0; DIMENSION];
        LittleEndian::read_f64_into(&received, &mut values);
        Ok(Vector3::from(values))
    }

    fn count_globally(&self) -> Result<GlobalCounts, CommError> {
        let comm = self.ctx.comm;
        let [bonds, angles, dihedrals] = self.groups.authoritative_counts(&self.atoms);
        Ok(GlobalCounts {
            atoms: comm.all_reduce_sum(self.atoms.n_atoms() as u64)? as usize,
            bonds: comm.all_reduce_sum(bonds as u64)? as usize,
            angles: comm.all_reduce_sum(angles as u64)? as usize,
            dihedrals: comm.all_reduce_sum(dihedrals as u64)? as usize,
        })
    }

    /// Switches the atom storage to Cartesian coordinates if it is not
    /// already.
    pub fn to_cartesian(&mut self) -> Result<(), EngineError> {
        if !self.atoms.is_cartesian() {
            self.atoms.transform_gen_to_cart(&self.boundary)?;
        }
        Ok(())
    }

    /// Switches the atom storage to scaled coordinates if it is not already.
    pub fn to_scaled(&mut self) -> Result<(), EngineError> {
        if self.atoms.is_cartesian() {
            self.atoms.transform_cart_to_gen(&self.boundary)?;
        }
        Ok(())
    }

    /// Full exchange: migration, group pruning and a new ghost layer.
    ///
    /// The coordinate mode of the storage is preserved.
    pub fn exchange(&mut self) -> Result<(), EngineError> {
        let cartesian = self.atoms.is_cartesian();
        self.to_scaled()?;
        self.exchanger
            .exchange(&mut self.atoms, &mut self.groups, &self.boundary)?;
        if cartesian {
            self.to_cartesian()?;
        }
        self.steps_since_exchange = 0;
        Ok(())
    }

    /// Refreshes ghost positions from their owners.
    pub fn update(&mut self) -> Result<(), EngineError> {
        self.exchanger.update(&mut self.atoms, &self.boundary)?;
        Ok(())
    }

    /// Sends ghost forces back to their owners and clears them.
    pub fn reverse_update_forces(&mut self) -> Result<(), EngineError> {
        self.exchanger.reverse_update(&mut self.atoms)?;
        Ok(())
    }

    /// Moves owned atoms once and brings ghosts up to date.
    ///
    /// A full exchange happens when any atom anywhere has moved more than
    /// half the skin, or when the configured exchange interval has elapsed;
    /// otherwise only ghost positions are refreshed.
    ///
    /// # Return
    ///
    /// `true` if a full exchange was performed.
    pub fn step(&mut self, motion: &mut dyn MotionModel) -> Result<bool, EngineError> {
        motion.advance(&mut self.atoms, &self.boundary);
        self.exchanger.mark_moved();
        self.steps_since_exchange += 1;

        let interval_elapsed = self
            .config
            .exchange_interval
            .is_some_and(|interval| self.steps_since_exchange >= interval);
        let moved_too_far = self.exchanger.needs_exchange(&self.atoms, &self.boundary)?;
        if interval_elapsed || moved_too_far {
            debug!(interval_elapsed, moved_too_far, "Full exchange");
            self.exchange()?;
            Ok(true)
        } else {
            self.update()?;
            Ok(false)
        }
    }

    /// Evaluates bonded forces on this domain.
    ///
    /// With reverse communication enabled, ghost forces are sent back to
    /// their owners afterwards, so every owned atom ends up with its full
    /// force either way.
    ///
    /// # Return
    ///
    /// The bond energy this domain is authoritative for.
    pub fn compute_forces(&mut self, potential: &HarmonicBond) -> Result<f64, EngineError> {
        let reverse = self.config.exchange.reverse_update;
        let energy = potential.compute(&mut self.atoms, &self.groups.bonds, &self.boundary, reverse)?;
        if reverse {
            self.reverse_update_forces()?;
        }
        Ok(energy)
    }

    /// Deforms the periodic cell and redistributes atoms accordingly.
    ///
    /// Scaled positions are kept, so atoms follow the deformation. A full
    /// exchange always follows because ownership and ghost depths change with
    /// the cell.
    pub fn set_boundary(&mut self, lengths: Vector3<f64>) -> Result<(), EngineError> {
        let cartesian = self.atoms.is_cartesian();
        self.to_scaled()?;
        self.boundary.set_lengths(lengths)?;
        info!(lengths = ?lengths.as_slice(), "Cell deformed");
        self.exchange()?;
        if cartesian {
            self.to_cartesian()?;
        }
        Ok(())
    }

    /// Checks local consistency and global conservation against the counts
    /// established by distribution. Collective.
    ///
    /// Owned atoms must lie inside this domain, which is only guaranteed
    /// right after [`exchange`](Self::exchange); between exchanges they may
    /// sit up to half the skin past a face.
    pub fn validate(&self) -> Result<(), EngineError> {
        self.exchanger
            .validate(&self.atoms, &self.groups, &self.boundary, &self.counts)?;
        Ok(())
    }

    /// Gathers every domain's atoms and authoritative groups on the master.
    ///
    /// # Return
    ///
    /// `Some(configuration)` on the master with positions wrapped into the
    /// primary cell and everything sorted by id, `None` elsewhere.
    #[instrument(skip_all, name = "collect", fields(rank = self.ctx.rank()))]
    pub fn collect(&mut self) -> Result<Option<Configuration>, EngineError> {
        let cartesian = self.atoms.is_cartesian();
        self.to_scaled()?;
        let result = self.collect_scaled();
        if cartesian {
            self.to_cartesian()?;
        }
        let Some((atoms, bonds, angles, dihedrals)) = result? else {
            return Ok(None);
        };
        let mut configuration = Configuration::new(self.boundary);
        configuration.atoms = atoms
            .into_iter()
            .map(|mut atom| {
                atom.position = self.boundary.shift_gen(&atom.position);
                atom
            })
            .collect();
        configuration.bonds = bonds;
        configuration.angles = angles;
        configuration.dihedrals = dihedrals;
        configuration.sort_by_id();
        info!(atoms = configuration.atoms.len(), "Configuration collected");
        Ok(Some(configuration))
    }

    fn collect_scaled(&mut self) -> Result<Option<Collected>, EngineError> {
        let ctx = self.ctx;
        let caches = self.config.caches;
        let buffer = self.exchanger.buffer_mut();
        let collector = AtomCollector::new(ctx, &self.atoms, buffer, caches.atom_cache_capacity)?;
        let atoms = if ctx.is_master() {
            Some(collector.collect()?)
        } else {
            collector.send()?;
            None
        };
        let cache = caches.group_cache_capacity;
        let bonds = collect_groups(ctx, &self.atoms, &self.groups.bonds, buffer, cache)?;
        let angles = collect_groups(ctx, &self.atoms, &self.groups.angles, buffer, cache)?;
        let dihedrals = collect_groups(ctx, &self.atoms, &self.groups.dihedrals, buffer, cache)?;
        Ok(match (atoms, bonds, angles, dihedrals) {
            (Some(a), Some(b), Some(c), Some(d)) => Some((a, b, c, d)),
            _ => None,
        })
    }

    /// Writes this domain's state: cell, owned atoms, groups and the global
    /// counts. Ghosts are not written.
    pub fn save_checkpoint<W: Write>(&self, writer: W) -> Result<(), EngineError> {
        let mut ar = OArchive::new(writer)?;
        ar.write_section(DOMAIN_SECTION)?;
        ar.write_u32(self.ctx.rank() as u32)?;
        for dim in self.ctx.domain.grid() {
            ar.write_u32(dim as u32)?;
        }
        ar.save(&self.boundary)?;
        self.atoms.save(&mut ar)?;
        self.groups.save(&mut ar)?;
        for count in [
            self.counts.atoms,
            self.counts.bonds,
            self.counts.angles,
            self.counts.dihedrals,
        ] {
            ar.write_u64(count as u64)?;
        }
        ar.flush()?;
        Ok(())
    }

    /// Restores state written by [`save_checkpoint`](Self::save_checkpoint)
    /// on the same rank of the same grid, then rebuilds the ghost layer and
    /// validates the result. Collective.
    ///
    /// # Errors
    ///
    /// Returns [`ArchiveError::InvalidValue`] if the checkpoint belongs to a
    /// different rank or grid.
    pub fn load_checkpoint<R: Read>(&mut self, reader: R) -> Result<(), EngineError> {
        let mut ar = IArchive::new(reader)?;
        ar.expect_section(DOMAIN_SECTION)?;
        let rank = ar.read_u32()? as usize;
        let mut grid = [0usize; DIMENSION];
        for dim in grid.iter_mut() {
            *dim = ar.read_u32()? as usize;
        }
        if rank != self.ctx.rank() || grid != self.ctx.domain.grid() {
            return Err(ArchiveError::InvalidValue(format!(
                "checkpoint of rank {} on grid {:?} cannot be loaded by rank {} on grid {:?}",
                rank,
                grid,
                self.ctx.rank(),
                self.ctx.domain.grid()
            ))
            .into());
        }
        self.boundary = ar.load()?;
        self.atoms.load(&mut ar)?;
        self.groups.load(&mut ar)?;
        self.counts = GlobalCounts {
            atoms: ar.read_u64()? as usize,
            bonds: ar.read_u64()? as usize,
            angles: ar.read_u64()? as usize,
            dihedrals: ar.read_u64()? as usize,
        };
        self.atoms.set_masks(self.config.mask_policy, &self.groups.bonds)?;
        self.exchange()?;
        self.validate()?;
        info!(atoms = self.atoms.n_atoms(), "Checkpoint restored");
        Ok(())
    }
}

fn distribute_groups<C: Communicator, const N: usize>(
    ctx: DomainContext<'_, C>,
    atoms: &AtomStorage,
    groups: &mut GroupStorage<N>,
    buffer: &mut Buffer,
    cache_capacity: usize,
    input: Option<(&[Group<N>], &AtomOwnership)>,
) -> Result<usize, CommError> {
    let mut distributor = GroupDistributor::new(ctx, atoms, groups, buffer, cache_capacity)?;
    match input {
        Some((list, ownership)) => {
            for group in list {
                distributor.add_group(*group, ownership)?;
            }
            distributor.send()
        }
        None => distributor.receive(),
    }
}

fn collect_groups<C: Communicator, const N: usize>(
    ctx: DomainContext<'_, C>,
    atoms: &AtomStorage,
    groups: &GroupStorage<N>,
    buffer: &mut Buffer,
    cache_capacity: usize,
) -> Result<Option<Vec<Group<N>>>, CommError> {
    let collector = GroupCollector::new(ctx, atoms, groups, buffer, cache_capacity)?;
    if ctx.is_master() {
        collector.collect().map(Some)
    } else {
        collector.send()?;
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::ChannelCommunicator;
    use crate::engine::config::SimulationConfigBuilder;
    use crate::engine::motion::RandomWalk;
    use std::io::Cursor;

    fn config() -> SimulationConfig {
        SimulationConfigBuilder::new()
            .grid([1, 1, 1])
            .atom_capacity(64)
            .ghost_capacity(256)
            .bond_capacity(64)
            .angle_capacity(64)
            .dihedral_capacity(64)
            .pair_cutoff(1.0)
            .skin(0.5)
            .reverse_update(true)
            .build()
            .unwrap()
    }

    fn configuration() -> Configuration {
        let mut configuration = Configuration::new(Boundary::cubic(10.0).unwrap());
        for id in 0..4u32 {
            let x = 0.1 + 0.2 * id as f64;
            configuration
                .atoms
                .push(Atom::new(id, 0, Vector3::new(x, 0.5, 0.5)));
        }
        configuration.bonds = vec![Bond::new(0, 0, [0, 1]), Bond::new(1, 0, [1, 2])];
        configuration.angles = vec![Angle::new(0, 0, [0, 1, 2])];
        configuration
    }

    #[test]
    fn single_domain_distribute_step_and_collect() {
        let config = config();
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new(config.grid, 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let mut sim = DomainSimulation::new(ctx, &config).unwrap();

        let input = configuration();
        let counts = sim.distribute(Some(&input)).unwrap();
        assert_eq!(counts.atoms, 4);
        assert_eq!(counts.bonds, 2);
        assert_eq!(counts.angles, 1);

        sim.exchange().unwrap();
        sim.validate().unwrap();
        sim.to_cartesian().unwrap();
        let mut walk = RandomWalk::new(0.05, 11, 0);
        for _ in 0..5 {
            sim.step(&mut walk).unwrap();
        }
        sim.validate().unwrap();

        let output = sim.collect().unwrap().unwrap();
        assert!(sim.atoms().is_cartesian());
        assert_eq!(output.atoms.len(), 4);
        assert_eq!(output.bonds, input.bonds);
        assert_eq!(output.angles, input.angles);
        for atom in &output.atoms {
            assert!(atom.position.iter().all(|s| (0.0..1.0).contains(s)));
        }
    }

    #[test]
    fn master_without_configuration_is_an_error() {
        let config = config();
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new(config.grid, 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let mut sim = DomainSimulation::new(ctx, &config).unwrap();
        assert!(matches!(sim.distribute(None), Err(EngineError::Internal(_))));
    }

    #[test]
    fn checkpoint_restores_atoms_and_counts() {
        let config = config();
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new(config.grid, 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();

        let mut sim = DomainSimulation::new(ctx, &config).unwrap();
        sim.distribute(Some(&configuration())).unwrap();
        sim.exchange().unwrap();
        let mut bytes = Vec::new();
        sim.save_checkpoint(&mut bytes).unwrap();

        let mut restored = DomainSimulation::new(ctx, &config).unwrap();
        restored.load_checkpoint(Cursor::new(bytes)).unwrap();
        assert_eq!(restored.counts(), sim.counts());
        assert_eq!(restored.boundary(), sim.boundary());
        assert_eq!(restored.atoms().n_atoms(), 4);
        assert_eq!(restored.groups().counts(), [2, 1, 0]);
    }

    #[test]
    fn set_boundary_keeps_scaled_positions() {
        let config = config();
        let comm = ChannelCommunicator::mesh(1).pop().unwrap();
        let domain = Domain::new(config.grid, 0, 1).unwrap();
        let ctx = DomainContext::new(&domain, &comm).unwrap();
        let mut sim = DomainSimulation::new(ctx, &config).unwrap();
        sim.distribute(Some(&configuration())).unwrap();
        sim.exchange().unwrap();

        sim.set_boundary(Vector3::new(12.0, 10.0, 10.0)).unwrap();
        assert_eq!(sim.boundary().length(0), 12.0);
        let output = sim.collect().unwrap().unwrap();
        assert!((output.atoms[1].position.x - 0.3).abs() < 1e-12);
        sim.validate().unwrap();
    }
}
