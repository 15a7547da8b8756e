use super::StorageError;
use super::atoms::AtomStorage;
use crate::core::io::archive::{ArchiveError, IArchive, OArchive};
use crate::core::models::group::{Group, group_kind_name};
use crate::core::models::ids::{GroupId, GroupSlot};
use slotmap::SlotMap;
use std::collections::HashMap;
use std::io::{Read, Write};

/// Bonded groups of arity `N` held by one domain.
///
/// A domain holds every group that has at least one member it owns, so a
/// group whose members are owned by k domains is held k times in total.
/// Exactly one of those holders is *authoritative*: the owner of
/// `atom_ids[0]`. Collection and global counts only consider authoritative
/// copies.
#[derive(Debug, Clone)]
pub struct GroupStorage<const N: usize> {
    groups: SlotMap<GroupSlot, Group<N>>,
    index: HashMap<GroupId, GroupSlot>,
    capacity: usize,
}

pub type BondStorage = GroupStorage<2>;
pub type AngleStorage = GroupStorage<3>;
pub type DihedralStorage = GroupStorage<4>;

impl<const N: usize> GroupStorage<N> {
    /// Creates an empty storage holding at most `capacity` groups.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::ZeroCapacity`] if `capacity` is zero.
    pub fn new(capacity: usize) -> Result<Self, StorageError> {
        if capacity == 0 {
            return Err(StorageError::ZeroCapacity {
                what: group_kind_name(N),
            });
        }
        Ok(Self {
            groups: SlotMap::with_capacity_and_key(capacity),
            index: HashMap::with_capacity(capacity),
            capacity,
        })
    }

    /// Adds a group.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::DuplicateGroup`] if a group with the same id is
    /// already held, or [`StorageError::GroupCapacityExceeded`] if the storage is full.
    pub fn add(&mut self, group: Group<N>) -> Result<GroupSlot, StorageError> {
        if self.index.contains_key(&group.id) {
            return Err(StorageError::DuplicateGroup { arity: N, id: group.id });
        }
        if self.groups.len() >= self.capacity {
            return Err(StorageError::GroupCapacityExceeded {
                arity: N,
                capacity: self.capacity,
            });
        }
        let id = group.id;
        let slot = self.groups.insert(group);
        self.index.insert(id, slot);
        Ok(slot)
    }

    /// Removes a group by id and returns it.
    pub fn remove(&mut self, id: GroupId) -> Result<Group<N>, StorageError> {
        let slot = self
            .index
            .remove(&id)
            .ok_or(StorageError::UnknownGroup { arity: N, id })?;
        self.groups
            .remove(slot)
            .ok_or_else(|| StorageError::Inconsistent(format!("slot of group {} is empty", id)))
    }

    pub fn find(&self, id: GroupId) -> Option<&Group<N>> {
        self.index.get(&id).and_then(|slot| self.groups.get(*slot))
    }

    pub fn contains(&self, id: GroupId) -> bool {
        self.index.contains_key(&id)
    }

    /// Iterates over held groups in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &Group<N>> {
        self.groups.values()
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.groups.clear();
        self.index.clear();
    }

    /// Returns `true` if every member of the group resolves to a local atom,
    /// owned or ghost. Unknown group ids are never complete.
    ///
    /// An incomplete group is not an error: it only means the ghost layer does
    /// not reach far enough to evaluate this group here.
    pub fn is_complete(&self, id: GroupId, atoms: &AtomStorage) -> bool {
        self.find(id)
            .is_some_and(|group| group.atom_ids.iter().all(|a| atoms.find(*a).is_some()))
    }

    pub fn is_authoritative(&self, group: &Group<N>, atoms: &AtomStorage) -> bool {
        atoms.is_owned(group.atom_ids[0])
    }

    fn has_owned_member(group: &Group<N>, atoms: &AtomStorage) -> bool {
        group.atom_ids.iter().any(|id| atoms.is_owned(*id))
    }

    /// Number of held groups for which this domain is authoritative.
    pub fn n_authoritative(&self, atoms: &AtomStorage) -> usize {
        self.iter()
            .filter(|group| self.is_authoritative(group, atoms))
            .count()
    }

    /// Drops every group with no owned member and returns how many were dropped.
    pub fn prune_unowned(&mut self, atoms: &AtomStorage) -> usize {
        let stale: Vec<GroupId> = self
            .iter()
            .filter(|group| !Self::has_owned_member(group, atoms))
            .map(|group| group.id)
            .collect();
        for id in &stale {
            if let Some(slot) = self.index.remove(id) {
                self.groups.remove(slot);
            }
        }
        stale.len()
    }

    /// Checks that the index agrees with the slots and that every held group
    /// has at least one owned member.
    pub fn is_valid(&self, atoms: &AtomStorage) -> Result<(), StorageError> {
        if self.index.len() != self.groups.len() {
            return Err(StorageError::Inconsistent(format!(
                "{} index size {} != {} groups",
                group_kind_name(N),
                self.index.len(),
                self.groups.len()
            )));
        }
        for (id, slot) in &self.index {
            if self.groups.get(*slot).map(|group| group.id) != Some(*id) {
                return Err(StorageError::Inconsistent(format!(
                    "{} {} does not resolve to its slot",
                    group_kind_name(N),
                    id
                )));
            }
        }
        if let Some(group) = self.iter().find(|group| !Self::has_owned_member(group, atoms)) {
            return Err(StorageError::Inconsistent(format!(
                "{} {} has no member owned by this domain",
                group_kind_name(N),
                group.id
            )));
        }
        Ok(())
    }

    fn section_tag() -> [u8; 4] {
        [b'G', b'R', b'P', b'0' + N as u8]
    }

    /// Writes every held group, sorted by id.
    pub fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        ar.write_section(&Self::section_tag())?;
        let mut groups: Vec<&Group<N>> = self.iter().collect();
        groups.sort_by_key(|group| group.id);
        ar.write_all(groups.into_iter())
    }

    /// Replaces the contents of the storage with groups read from `ar`.
    pub fn load<R: Read>(&mut self, ar: &mut IArchive<R>) -> Result<(), ArchiveError> {
        ar.expect_section(&Self::section_tag())?;
        let groups: Vec<Group<N>> = ar.read_all()?;
        self.clear();
        for group in groups {
            self.add(group)?;
        }
        Ok(())
    }
}

/// The bond, angle and dihedral storages of one domain.
#[derive(Debug, Clone)]
pub struct BondedStorage {
    pub bonds: BondStorage,
    pub angles: AngleStorage,
    pub dihedrals: DihedralStorage,
}

impl BondedStorage {
    pub fn new(
        bond_capacity: usize,
        angle_capacity: usize,
        dihedral_capacity: usize,
    ) -> Result<Self, StorageError> {
        Ok(Self {
            bonds: GroupStorage::new(bond_capacity)?,
            angles: GroupStorage::new(angle_capacity)?,
            dihedrals: GroupStorage::new(dihedral_capacity)?,
        })
    }

    pub fn clear(&mut self) {
        self.bonds.clear();
        self.angles.clear();
        self.dihedrals.clear();
    }

    /// Held group counts, as `[bonds, angles, dihedrals]`.
    pub fn counts(&self) -> [usize; 3] {
        [self.bonds.len(), self.angles.len(), self.dihedrals.len()]
    }

    /// Authoritative group counts, as `[bonds, angles, dihedrals]`.
    pub fn authoritative_counts(&self, atoms: &AtomStorage) -> [usize; 3] {
        [
            self.bonds.n_authoritative(atoms),
            self.angles.n_authoritative(atoms),
            self.dihedrals.n_authoritative(atoms),
        ]
    }

    pub fn prune_unowned(&mut self, atoms: &AtomStorage) -> usize {
        self.bonds.prune_unowned(atoms)
            + self.angles.prune_unowned(atoms)
            + self.dihedrals.prune_unowned(atoms)
    }

    pub fn is_valid(&self, atoms: &AtomStorage) -> Result<(), StorageError> {
        self.bonds.is_valid(atoms)?;
        self.angles.is_valid(atoms)?;
        self.dihedrals.is_valid(atoms)
    }

    pub fn save<W: Write>(&self, ar: &mut OArchive<W>) -> Result<(), ArchiveError> {
        self.bonds.save(ar)?;
        self.angles.save(ar)?;
        self.dihedrals.save(ar)
    }

    pub fn load<R: Read>(&mut self, ar: &mut IArchive<R>) -> Result<(), ArchiveError> {
        self.bonds.load(ar)?;
        self.angles.load(ar)?;
        self.dihedrals.load(ar)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::group::{Angle, Bond};
    use nalgebra::Vector3;
    use std::io::Cursor;

    fn storage_owning(ids: &[u32], ghosts: &[u32]) -> AtomStorage {
        let mut atoms = AtomStorage::new(16, 16).unwrap();
        for id in ids {
            atoms.add_atom(Atom::new(*id, 0, Vector3::zeros())).unwrap();
        }
        for id in ghosts {
            atoms.add_ghost(Atom::new(*id, 0, Vector3::zeros())).unwrap();
        }
        atoms
    }

    #[test]
    fn add_remove_and_capacity() {
        let mut bonds: BondStorage = GroupStorage::new(2).unwrap();
        bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        assert!(matches!(
            bonds.add(Bond::new(0, 1, [2, 3])),
            Err(StorageError::DuplicateGroup { arity: 2, id: 0 })
        ));
        bonds.add(Bond::new(1, 0, [1, 2])).unwrap();
        assert!(matches!(
            bonds.add(Bond::new(2, 0, [2, 3])),
            Err(StorageError::GroupCapacityExceeded { arity: 2, capacity: 2 })
        ));
        assert_eq!(bonds.remove(0).unwrap().atom_ids, [0, 1]);
        assert!(!bonds.contains(0));
        assert!(matches!(
            bonds.remove(0),
            Err(StorageError::UnknownGroup { arity: 2, id: 0 })
        ));
        assert_eq!(bonds.len(), 1);
    }

    #[test]
    fn zero_capacity_names_the_group_kind() {
        assert!(matches!(
            AngleStorage::new(0),
            Err(StorageError::ZeroCapacity { what: "angle" })
        ));
    }

    #[test]
    fn completeness_accepts_ghost_members() {
        let atoms = storage_owning(&[0], &[1]);
        let mut angles: AngleStorage = GroupStorage::new(4).unwrap();
        angles.add(Angle::new(0, 0, [0, 1, 2])).unwrap();
        angles.add(Angle::new(1, 0, [2, 0, 1])).unwrap();
        assert!(!angles.is_complete(0, &atoms));
        assert!(!angles.is_complete(7, &atoms));

        let atoms = storage_owning(&[0], &[1, 2]);
        assert!(angles.is_complete(0, &atoms));
        assert!(angles.is_complete(1, &atoms));
    }

    #[test]
    fn authority_follows_first_member() {
        let atoms = storage_owning(&[0], &[1]);
        let mut bonds: BondStorage = GroupStorage::new(4).unwrap();
        bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        bonds.add(Bond::new(1, 0, [1, 0])).unwrap();
        assert!(bonds.is_authoritative(bonds.find(0).unwrap(), &atoms));
        assert!(!bonds.is_authoritative(bonds.find(1).unwrap(), &atoms));
        assert_eq!(bonds.n_authoritative(&atoms), 1);
    }

    #[test]
    fn prune_drops_groups_without_owned_members() {
        let atoms = storage_owning(&[0, 1], &[5]);
        let mut bonds: BondStorage = GroupStorage::new(4).unwrap();
        bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        bonds.add(Bond::new(1, 0, [1, 5])).unwrap();
        bonds.add(Bond::new(2, 0, [5, 6])).unwrap();
        assert!(bonds.is_valid(&atoms).is_err());
        assert_eq!(bonds.prune_unowned(&atoms), 1);
        assert!(bonds.contains(1));
        assert!(!bonds.contains(2));
        bonds.is_valid(&atoms).unwrap();
    }

    #[test]
    fn bonded_storage_save_and_load() {
        let atoms = storage_owning(&[0, 1, 2, 3], &[]);
        let mut bonded = BondedStorage::new(4, 4, 4).unwrap();
        bonded.bonds.add(Bond::new(1, 0, [1, 2])).unwrap();
        bonded.bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        bonded.angles.add(Angle::new(0, 2, [0, 1, 2])).unwrap();
        bonded.dihedrals.add(Group::new(0, 3, [0, 1, 2, 3])).unwrap();

        let mut ar = OArchive::new(Vec::new()).unwrap();
        bonded.save(&mut ar).unwrap();
        let mut input = IArchive::new(Cursor::new(ar.into_inner())).unwrap();
        let mut restored = BondedStorage::new(8, 8, 8).unwrap();
        restored.load(&mut input).unwrap();

        assert_eq!(restored.counts(), [2, 1, 1]);
        assert_eq!(restored.authoritative_counts(&atoms), [2, 1, 1]);
        assert_eq!(restored.angles.find(0).unwrap().type_id, 2);
    }
}
