use super::atom::Atom;
use super::group::{Angle, Bond, Dihedral};
use super::ids::AtomId;
use crate::core::boundary::Boundary;
use std::collections::HashSet;

/// A complete system configuration held by a single process.
///
/// This is the form in which configuration readers hand a system to the
/// distributors and in which collectors hand it back to writers. Atom
/// positions are in scaled coordinates.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Configuration {
    pub boundary: Boundary,
    pub atoms: Vec<Atom>,
    pub bonds: Vec<Bond>,
    pub angles: Vec<Angle>,
    pub dihedrals: Vec<Dihedral>,
}

impl Configuration {
    pub fn new(boundary: Boundary) -> Self {
        Self {
            boundary,
            ..Self::default()
        }
    }

    /// Sorts atoms and every group list by id.
    ///
    /// Collectors do not preserve input order, so writers that need a stable
    /// layout call this before writing.
    pub fn sort_by_id(&mut self) {
        self.atoms.sort_by_key(|atom| atom.id);
        self.bonds.sort_by_key(|group| group.id);
        self.angles.sort_by_key(|group| group.id);
        self.dihedrals.sort_by_key(|group| group.id);
    }

    /// Returns the first atom id that appears more than once, if any.
    pub fn find_duplicate_atom(&self) -> Option<AtomId> {
        let mut seen = HashSet::with_capacity(self.atoms.len());
        self.atoms
            .iter()
            .map(|atom| atom.id)
            .find(|id| !seen.insert(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Vector3;

    #[test]
    fn sort_by_id_orders_atoms_and_groups() {
        let mut config = Configuration::new(Boundary::default());
        config.atoms = vec![
            Atom::new(2, 0, Vector3::zeros()),
            Atom::new(0, 0, Vector3::zeros()),
            Atom::new(1, 0, Vector3::zeros()),
        ];
        config.bonds = vec![Bond::new(1, 0, [1, 2]), Bond::new(0, 0, [0, 1])];
        config.sort_by_id();
        let ids: Vec<_> = config.atoms.iter().map(|a| a.id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
        assert_eq!(config.bonds[0].id, 0);
    }

    #[test]
    fn find_duplicate_atom_reports_repeated_id() {
        let mut config = Configuration::default();
        config.atoms = vec![
            Atom::new(4, 0, Vector3::zeros()),
            Atom::new(5, 0, Vector3::zeros()),
        ];
        assert_eq!(config.find_duplicate_atom(), None);
        config.atoms.push(Atom::new(4, 1, Vector3::zeros()));
        assert_eq!(config.find_duplicate_atom(), Some(4));
    }
}
