use super::StorageError;
use super::groups::BondStorage;
use crate::core::boundary::Boundary;
use crate::core::io::archive::{ArchiveError, IArchive, OArchive};
use crate::core::models::atom::Atom;
use crate::core::models::ids::{AtomId, AtomSlot};
use crate::core::models::mask::MaskPolicy;
use nalgebra::Vector3;
use slotmap::{SecondaryMap, SlotMap};
use std::collections::HashMap;
use std::io::{Read, Write};

const ATOM_SECTION: &[u8; 4] = b"ATOM";

/// Local atoms and ghosts of one domain.
///
/// Owned atoms are addressed by their global id; there is at most one owned
/// copy of an id per domain. Ghosts are replicas received from neighbouring
/// domains, and several periodic images of the same id may coexist, so
/// ghosts are addressed by slot and only the first image is reachable by id.
///
/// All positions in one storage share a coordinate system, either scaled or
/// Cartesian, tracked by [`is_cartesian`](Self::is_cartesian). A new storage
/// starts in scaled mode, which is what distribution and exchange require.
#[derive(Debug, Clone)]
pub struct AtomStorage {
    /// Slot storage for owned atoms and ghosts alike.
    atoms: SlotMap<AtomSlot, Atom>,
    /// Global id to slot, owned atoms only.
    owned: HashMap<AtomId, AtomSlot>,
    /// Ghost slots in the order they were received.
    ghosts: Vec<AtomSlot>,
    /// Global id to the first ghost image with that id.
    ghost_map: HashMap<AtomId, AtomSlot>,
    atom_capacity: usize,
    ghost_capacity: usize,
    is_cartesian: bool,
    /// Cartesian positions of owned atoms at the last snapshot.
    snapshot: SecondaryMap<AtomSlot, Vector3<f64>>,
}

impl AtomStorage {
    /// Creates an empty storage in scaled-coordinate mode.
    ///
    /// # Arguments
    ///
    /// * `atom_capacity` - Maximum number of owned atoms.
    /// * `ghost_capacity` - Maximum number of ghost atoms.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ZeroCapacity`] if either capacity is zero.
    pub fn new(atom_capacity: usize, ghost_capacity: usize) -> Result<Self, StorageError> {
        if atom_capacity == 0 {
            return Err(StorageError::ZeroCapacity { what: "atoms" });
        }
        if ghost_capacity == 0 {
            return Err(StorageError::ZeroCapacity { what: "ghosts" });
        }
        Ok(Self {
            atoms: SlotMap::with_capacity_and_key(atom_capacity + ghost_capacity),
            owned: HashMap::with_capacity(atom_capacity),
            ghosts: Vec::with_capacity(ghost_capacity),
            ghost_map: HashMap::with_capacity(ghost_capacity),
            atom_capacity,
            ghost_capacity,
            is_cartesian: false,
            snapshot: SecondaryMap::new(),
        })
    }

    /// Adds an owned atom.
    ///
    /// The ghost flag of `atom` is cleared.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateAtom`] if the id is already owned here, or
    /// [`StorageError::AtomCapacityExceeded`] if the storage is full.
    pub fn add_atom(&mut self, mut atom: Atom) -> Result<AtomSlot, StorageError> {
        if self.owned.contains_key(&atom.id) {
            return Err(StorageError::DuplicateAtom(atom.id));
        }
        if self.owned.len() >= self.atom_capacity {
            return Err(StorageError::AtomCapacityExceeded {
                capacity: self.atom_capacity,
            });
        }
        atom.is_ghost = false;
        let id = atom.id;
        let slot = self.atoms.insert(atom);
        self.owned.insert(id, slot);
        Ok(slot)
    }

    /// Adds a ghost atom. Ghost forces start at zero.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::GhostCapacityExceeded`] if the ghost list is full.
    pub fn add_ghost(&mut self, mut atom: Atom) -> Result<AtomSlot, StorageError> {
        if self.ghosts.len() >= self.ghost_capacity {
            return Err(StorageError::GhostCapacityExceeded {
                capacity: self.ghost_capacity,
            });
        }
        atom.is_ghost = true;
        atom.force = Vector3::zeros();
        let id = atom.id;
        let slot = self.atoms.insert(atom);
        self.ghosts.push(slot);
        self.ghost_map.entry(id).or_insert(slot);
        Ok(slot)
    }

    /// Removes an owned atom and returns it.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::UnknownAtom`] if the id is not owned here.
    pub fn remove_atom(&mut self, id: AtomId) -> Result<Atom, StorageError> {
        let slot = self.owned.remove(&id).ok_or(StorageError::UnknownAtom(id))?;
        self.snapshot.remove(slot);
        self.atoms
            .remove(slot)
            .ok_or_else(|| StorageError::Inconsistent(format!("slot of atom {} is empty", id)))
    }

    /// Removes every ghost.
    pub fn clear_ghosts(&mut self) {
        for slot in self.ghosts.drain(..) {
            self.atoms.remove(slot);
        }
        self.ghost_map.clear();
    }

    /// Removes every atom, owned and ghost. The coordinate mode is kept.
    pub fn clear(&mut self) {
        self.atoms.clear();
        self.owned.clear();
        self.ghosts.clear();
        self.ghost_map.clear();
        self.snapshot.clear();
    }

    /// Finds an atom by global id.
    ///
    /// # Return
    ///
    /// The owned slot if this domain owns the id, else the slot of the first
    /// ghost image, else `None`.
    pub fn find(&self, id: AtomId) -> Option<AtomSlot> {
        self.owned
            .get(&id)
            .or_else(|| self.ghost_map.get(&id))
            .copied()
    }

    pub fn find_owned(&self, id: AtomId) -> Option<AtomSlot> {
        self.owned.get(&id).copied()
    }

    pub fn is_owned(&self, id: AtomId) -> bool {
        self.owned.contains_key(&id)
    }

    pub fn atom(&self, slot: AtomSlot) -> Option<&Atom> {
        self.atoms.get(slot)
    }

    pub fn atom_mut(&mut self, slot: AtomSlot) -> Option<&mut Atom> {
        self.atoms.get_mut(slot)
    }

    /// Iterates over owned atoms in slot order.
    pub fn owned_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.values().filter(|atom| !atom.is_ghost)
    }

    pub fn owned_atoms_mut(&mut self) -> impl Iterator<Item = &mut Atom> {
        self.atoms.values_mut().filter(|atom| !atom.is_ghost)
    }

    /// Slots of owned atoms, in slot order.
    pub fn owned_slots(&self) -> Vec<AtomSlot> {
        self.atoms
            .iter()
            .filter(|(_, atom)| !atom.is_ghost)
            .map(|(slot, _)| slot)
            .collect()
    }

    /// Iterates over ghosts in the order they were received.
    pub fn ghost_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.ghosts.iter().filter_map(|slot| self.atoms.get(*slot))
    }

    pub fn ghost_slots(&self) -> &[AtomSlot] {
        &self.ghosts
    }

    /// Iterates over every atom, owned and ghost.
    pub fn all_atoms(&self) -> impl Iterator<Item = &Atom> {
        self.atoms.values()
    }

    pub fn n_atoms(&self) -> usize {
        self.owned.len()
    }

    pub fn n_ghosts(&self) -> usize {
        self.ghosts.len()
    }

    pub fn atom_capacity(&self) -> usize {
        self.atom_capacity
    }

    pub fn ghost_capacity(&self) -> usize {
        self.ghost_capacity
    }

    pub fn is_cartesian(&self) -> bool {
        self.is_cartesian
    }

    /// Zeroes the force on every ghost.
    pub fn zero_ghost_forces(&mut self) {
        for slot in &self.ghosts {
            if let Some(atom) = self.atoms.get_mut(*slot) {
                atom.force = Vector3::zeros();
            }
        }
    }

    /// Converts every position (owned and ghost) from Cartesian to scaled form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CoordinateMode`] if the storage already holds
    /// scaled coordinates.
    pub fn transform_cart_to_gen(&mut self, boundary: &Boundary) -> Result<(), StorageError> {
        if !self.is_cartesian {
            return Err(StorageError::CoordinateMode {
                expected: "Cartesian",
            });
        }
        for atom in self.atoms.values_mut() {
            atom.position = boundary.transform_cart_to_gen(&atom.position);
        }
        self.is_cartesian = false;
        Ok(())
    }

    /// Converts every position (owned and ghost) from scaled to Cartesian form.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CoordinateMode`] if the storage already holds
    /// Cartesian coordinates.
    pub fn transform_gen_to_cart(&mut self, boundary: &Boundary) -> Result<(), StorageError> {
        if self.is_cartesian {
            return Err(StorageError::CoordinateMode { expected: "scaled" });
        }
        for atom in self.atoms.values_mut() {
            atom.position = boundary.transform_gen_to_cart(&atom.position);
        }
        self.is_cartesian = true;
        Ok(())
    }

    fn cartesian_position(&self, atom: &Atom, boundary: &Boundary) -> Vector3<f64> {
        if self.is_cartesian {
            atom.position
        } else {
            boundary.transform_gen_to_cart(&atom.position)
        }
    }

    /// Records the Cartesian position of every owned atom.
    pub fn make_snapshot(&mut self, boundary: &Boundary) {
        self.snapshot.clear();
        for (slot, atom) in self.atoms.iter() {
            if !atom.is_ghost {
                let position = self.cartesian_position(atom, boundary);
                self.snapshot.insert(slot, position);
            }
        }
    }

    /// Largest squared Cartesian displacement of an owned atom since the
    /// last snapshot. Atoms added after the snapshot are ignored.
    pub fn max_sq_displacement(&self, boundary: &Boundary) -> f64 {
        self.snapshot
            .iter()
            .filter_map(|(slot, old)| {
                self.atoms
                    .get(slot)
                    .map(|atom| (self.cartesian_position(atom, boundary) - old).norm_squared())
            })
            .fold(0.0, f64::max)
    }

    /// Recomputes the exclusion masks of every owned atom.
    ///
    /// With [`MaskPolicy::MaskBonded`] each owned atom masks every partner it
    /// shares a locally held bond with. Masks of ghosts are left untouched;
    /// they arrive with the ghost from the owning domain when needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Mask`] if an atom has more bonded partners than
    /// a mask can hold.
    pub fn set_masks(&mut self, policy: MaskPolicy, bonds: &BondStorage) -> Result<(), StorageError> {
        for atom in self.owned_atoms_mut() {
            atom.mask.clear();
        }
        if policy == MaskPolicy::MaskNone {
            return Ok(());
        }
        for bond in bonds.iter() {
            let [a, b] = bond.atom_ids;
            for (this, other) in [(a, b), (b, a)] {
                if let Some(slot) = self.owned.get(&this) {
                    if let Some(atom) = self.atoms.get_mut(*slot) {
                        atom.mask
                            .append(other)
                            .map_err(|source| StorageError::Mask { atom_id: this, source })?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Checks the internal consistency of the storage.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Inconsistent`] describing the first problem found.
    pub fn is_valid(&self) -> Result<(), StorageError> {
        if self.owned.len() > self.atom_capacity || self.ghosts.len() > self.ghost_capacity {
            return Err(StorageError::Inconsistent("capacity exceeded".into()));
        }
        if self.owned.len() + self.ghosts.len() != self.atoms.len() {
            return Err(StorageError::Inconsistent(format!(
                "{} owned + {} ghosts != {} slots",
                self.owned.len(),
                self.ghosts.len(),
                self.atoms.len()
            )));
        }
        for (id, slot) in &self.owned {
            match self.atoms.get(*slot) {
                Some(atom) if atom.id == *id && !atom.is_ghost => {}
                _ => {
                    return Err(StorageError::Inconsistent(format!(
                        "owned atom {} does not resolve to a matching local atom",
                        id
                    )));
                }
            }
        }
        for slot in &self.ghosts {
            match self.atoms.get(*slot) {
                Some(atom) if atom.is_ghost => {}
                _ => return Err(StorageError::Inconsistent("ghost list entry is not a ghost".into())),
            }
        }
        for (id, slot) in &self.ghost_map {
            match self.atoms.get(*slot) {
                Some(atom) if atom.id == *id && atom.is_ghost => {}
                _ => {
                    return Err(StorageError::Inconsistent(format!(
                        "ghost map entry for atom {} is stale",
                        id
                    )));
                }
            }
        }
        Ok(())
    }

    /// Writes the coordinate mode and every owned atom, sorted by id.
    /// Ghosts are not saved; they are rebuilt by the next exchange.
    pub fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_section(ATOM_SECTION)?;
        ar.write_u8(self.is_cartesian as u8)?;
        let mut atoms: Vec<&Atom> = self.owned_atoms().collect();
        atoms.sort_by_key(|atom| atom.id);
        ar.write_all(atoms.into_iter())
    }

    /// Replaces the contents of the storage with atoms read from `ar`.
    /// Capacities are those of this storage, not of the one that was saved.
    pub fn load<R: Read>(&mut self, ar: &mut IArchive<R>) -> Result<(), ArchiveError> {
        ar.expect_section(ATOM_SECTION)?;
        let is_cartesian = ar.read_u8()? != 0;
        let atoms: Vec<Atom> = ar.read_all()?;
        self.clear();
        self.is_cartesian = is_cartesian;
        for atom in atoms {
            self.add_atom(atom)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::group::Bond;
    use crate::core::storage::groups::GroupStorage;
    use std::io::Cursor;

    fn atom(id: AtomId, x: f64) -> Atom {
        Atom::new(id, 0, Vector3::new(x, 0.5, 0.5))
    }

    #[test]
    fn zero_capacity_is_rejected() {
        assert!(matches!(
            AtomStorage::new(0, 10),
            Err(StorageError::ZeroCapacity { what: "atoms" })
        ));
        assert!(matches!(
            AtomStorage::new(10, 0),
            Err(StorageError::ZeroCapacity { what: "ghosts" })
        ));
    }

    #[test]
    fn add_find_and_remove_owned_atoms() {
        let mut storage = AtomStorage::new(4, 4).unwrap();
        let slot = storage.add_atom(atom(7, 0.1)).unwrap();
        assert_eq!(storage.find(7), Some(slot));
        assert_eq!(storage.find_owned(7), Some(slot));
        assert_eq!(storage.n_atoms(), 1);

        let removed = storage.remove_atom(7).unwrap();
        assert_eq!(removed.id, 7);
        assert_eq!(storage.find(7), None);
        assert_eq!(storage.n_atoms(), 0);
        assert!(matches!(storage.remove_atom(7), Err(StorageError::UnknownAtom(7))));
    }

    #[test]
    fn duplicate_and_overflow_are_errors() {
        let mut storage = AtomStorage::new(2, 1).unwrap();
        storage.add_atom(atom(1, 0.1)).unwrap();
        assert_eq!(
            storage.add_atom(atom(1, 0.2)),
            Err(StorageError::DuplicateAtom(1))
        );
        storage.add_atom(atom(2, 0.2)).unwrap();
        assert_eq!(
            storage.add_atom(atom(3, 0.3)),
            Err(StorageError::AtomCapacityExceeded { capacity: 2 })
        );
        storage.add_ghost(atom(9, 0.9)).unwrap();
        assert_eq!(
            storage.add_ghost(atom(10, 0.9)),
            Err(StorageError::GhostCapacityExceeded { capacity: 1 })
        );
    }

    #[test]
    fn ghost_images_coexist_and_find_prefers_owned() {
        let mut storage = AtomStorage::new(4, 4).unwrap();
        let first = storage.add_ghost(atom(5, 0.0)).unwrap();
        let second = storage.add_ghost(atom(5, 1.0)).unwrap();
        assert_ne!(first, second);
        assert_eq!(storage.n_ghosts(), 2);
        assert_eq!(storage.find(5), Some(first));
        assert!(storage.atom(second).unwrap().is_ghost);

        let owned = storage.add_atom(atom(5, 0.5)).unwrap();
        assert_eq!(storage.find(5), Some(owned));
        storage.is_valid().unwrap();
    }

    #[test]
    fn clear_ghosts_keeps_owned_atoms() {
        let mut storage = AtomStorage::new(4, 4).unwrap();
        storage.add_atom(atom(1, 0.1)).unwrap();
        storage.add_ghost(atom(2, 0.2)).unwrap();
        storage.add_ghost(atom(3, 0.3)).unwrap();
        storage.clear_ghosts();
        assert_eq!(storage.n_ghosts(), 0);
        assert_eq!(storage.n_atoms(), 1);
        assert_eq!(storage.find(2), None);
        assert_eq!(storage.ghost_atoms().count(), 0);
        storage.is_valid().unwrap();
    }

    #[test]
    fn coordinate_transforms_switch_mode_and_reject_repeats() {
        let boundary = Boundary::new(Vector3::new(10.0, 20.0, 30.0)).unwrap();
        let mut storage = AtomStorage::new(4, 4).unwrap();
        storage.add_atom(atom(1, 0.5)).unwrap();
        storage.add_ghost(atom(2, 0.25)).unwrap();

        assert!(storage.transform_cart_to_gen(&boundary).is_err());
        storage.transform_gen_to_cart(&boundary).unwrap();
        assert!(storage.is_cartesian());
        let owned = storage.atom(storage.find(1).unwrap()).unwrap();
        assert_eq!(owned.position, Vector3::new(5.0, 10.0, 15.0));
        let ghost = storage.ghost_atoms().next().unwrap();
        assert_eq!(ghost.position.x, 2.5);

        assert!(storage.transform_gen_to_cart(&boundary).is_err());
        storage.transform_cart_to_gen(&boundary).unwrap();
        assert!(!storage.is_cartesian());
    }

    #[test]
    fn snapshot_tracks_largest_cartesian_displacement() {
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut storage = AtomStorage::new(4, 4).unwrap();
        let a = storage.add_atom(atom(1, 0.1)).unwrap();
        let b = storage.add_atom(atom(2, 0.2)).unwrap();
        storage.make_snapshot(&boundary);
        assert_eq!(storage.max_sq_displacement(&boundary), 0.0);

        storage.atom_mut(a).unwrap().position.x += 0.01;
        storage.atom_mut(b).unwrap().position.y -= 0.03;
        let max = storage.max_sq_displacement(&boundary);
        assert!((max - 0.09).abs() < 1e-12);

        storage.transform_gen_to_cart(&boundary).unwrap();
        let max_cart = storage.max_sq_displacement(&boundary);
        assert!((max_cart - 0.09).abs() < 1e-12);
    }

    #[test]
    fn bonded_masks_cover_owned_partners_only() {
        let mut storage = AtomStorage::new(4, 4).unwrap();
        storage.add_atom(atom(0, 0.1)).unwrap();
        storage.add_atom(atom(1, 0.2)).unwrap();
        storage.add_ghost(atom(2, 0.9)).unwrap();
        let mut bonds: BondStorage = GroupStorage::new(4).unwrap();
        bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        bonds.add(Bond::new(1, 0, [1, 2])).unwrap();

        storage.set_masks(MaskPolicy::MaskBonded, &bonds).unwrap();
        let one = storage.atom(storage.find(1).unwrap()).unwrap();
        assert!(one.mask.is_masked(0) && one.mask.is_masked(2));
        let ghost = storage.atom(storage.find(2).unwrap()).unwrap();
        assert!(ghost.mask.is_empty());

        storage.set_masks(MaskPolicy::MaskNone, &bonds).unwrap();
        assert!(storage.owned_atoms().all(|a| a.mask.is_empty()));
    }

    #[test]
    fn save_and_load_restore_owned_atoms_and_drop_ghosts() {
        let mut storage = AtomStorage::new(4, 4).unwrap();
        storage.add_atom(atom(3, 0.3).with_velocity(Vector3::new(1.0, 2.0, 3.0))).unwrap();
        storage.add_atom(atom(1, 0.1)).unwrap();
        storage.add_ghost(atom(8, 0.8)).unwrap();

        let mut ar = OArchive::new(Vec::new()).unwrap();
        storage.save(&mut ar).unwrap();
        let mut input = IArchive::new(Cursor::new(ar.into_inner())).unwrap();

        let mut restored = AtomStorage::new(8, 8).unwrap();
        restored.load(&mut input).unwrap();
        assert_eq!(restored.n_atoms(), 2);
        assert_eq!(restored.n_ghosts(), 0);
        let three = restored.atom(restored.find(3).unwrap()).unwrap();
        assert_eq!(three.velocity, Vector3::new(1.0, 2.0, 3.0));
        restored.is_valid().unwrap();
    }
}
