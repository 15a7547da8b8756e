use crate::core::boundary::Boundary;
use crate::core::storage::{AtomStorage, BondStorage, StorageError};
use tracing::warn;

/// A harmonic bond potential, `E = k/2 (r - r0)^2`.
///
/// This is the bonded force collaborator used by the run workflow. It reads
/// the domain's storages and writes forces, and shows how group authority and
/// reverse communication fit together:
///
/// - With reverse communication, only the authoritative holder of a bond
///   evaluates it and adds the force to both members, owned or ghost. Ghost
///   forces are then sent back to their owners.
/// - Without it, every holder evaluates the bond and applies the force only
///   to the members it owns.
///
/// In both modes the energy of a bond is counted once, by its authoritative
/// holder.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HarmonicBond {
    pub stiffness: f64,
    pub rest_length: f64,
}

impl HarmonicBond {
    /// Zeroes all forces and accumulates bond forces.
    ///
    /// # Return
    ///
    /// The bond energy this domain is authoritative for.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::CoordinateMode`] unless the storage holds
    /// Cartesian coordinates.
    pub fn compute(
        &self,
        atoms: &mut AtomStorage,
        bonds: &BondStorage,
        boundary: &Boundary,
        reverse: bool,
    ) -> Result<f64, StorageError> {
        if !atoms.is_cartesian() {
            return Err(StorageError::CoordinateMode {
                expected: "Cartesian",
            });
        }
        for atom in atoms.owned_atoms_mut() {
            atom.force.fill(0.0);
        }
        atoms.zero_ghost_forces();

        let mut energy = 0.0;
        let mut incomplete = 0;
        for bond in bonds.iter() {
            let authoritative = bonds.is_authoritative(bond, atoms);
            if reverse && !authoritative {
                continue;
            }
            let [a, b] = bond.atom_ids;
            let (Some(slot_a), Some(slot_b)) = (atoms.find(a), atoms.find(b)) else {
                incomplete += 1;
                continue;
            };
            let (Some(atom_a), Some(atom_b)) = (atoms.atom(slot_a), atoms.atom(slot_b)) else {
                incomplete += 1;
                continue;
            };
            let dr = boundary.min_image_vector(&atom_a.position, &atom_b.position);
            let r = dr.norm();
            if r == 0.0 {
                continue;
            }
            let stretch = r - self.rest_length;
            let force_on_a = dr * (-self.stiffness * stretch / r);
            let (apply_a, apply_b) = if reverse {
                (true, true)
            } else {
                (atoms.is_owned(a), atoms.is_owned(b))
            };
            if apply_a {
                if let Some(atom) = atoms.atom_mut(slot_a) {
                    atom.force += force_on_a;
                }
            }
            if apply_b {
                if let Some(atom) = atoms.atom_mut(slot_b) {
                    atom.force -= force_on_a;
                }
            }
            if authoritative {
                energy += 0.5 * self.stiffness * stretch * stretch;
            }
        }
        if incomplete > 0 {
            warn!(
                incomplete,
                "Bonds with members outside the ghost layer were skipped"
            );
        }
        Ok(energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;
    use crate::core::models::group::Bond;
    use crate::core::storage::GroupStorage;
    use nalgebra::Vector3;

    fn setup() -> (AtomStorage, BondStorage, Boundary) {
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut atoms = AtomStorage::new(4, 4).unwrap();
        atoms.add_atom(Atom::new(0, 0, Vector3::new(0.1, 0.5, 0.5))).unwrap();
        atoms.add_ghost(Atom::new(1, 0, Vector3::new(0.25, 0.5, 0.5))).unwrap();
        atoms.transform_gen_to_cart(&boundary).unwrap();
        let mut bonds: BondStorage = GroupStorage::new(4).unwrap();
        bonds.add(Bond::new(0, 0, [0, 1])).unwrap();
        (atoms, bonds, boundary)
    }

    #[test]
    fn stretched_bond_pulls_members_together() {
        let (mut atoms, bonds, boundary) = setup();
        let potential = HarmonicBond {
            stiffness: 2.0,
            rest_length: 1.0,
        };
        let energy = potential.compute(&mut atoms, &bonds, &boundary, true).unwrap();
        assert!((energy - 0.25).abs() < 1e-12);
        let owned = atoms.atom(atoms.find(0).unwrap()).unwrap();
        assert!((owned.force.x - 1.0).abs() < 1e-12);
        let ghost = atoms.atom(atoms.find(1).unwrap()).unwrap();
        assert!((ghost.force.x + 1.0).abs() < 1e-12);
    }

    #[test]
    fn without_reverse_only_owned_members_receive_force() {
        let (mut atoms, bonds, boundary) = setup();
        let potential = HarmonicBond {
            stiffness: 2.0,
            rest_length: 1.0,
        };
        potential.compute(&mut atoms, &bonds, &boundary, false).unwrap();
        let ghost = atoms.atom(atoms.find(1).unwrap()).unwrap();
        assert_eq!(ghost.force, Vector3::zeros());
        let owned = atoms.atom(atoms.find(0).unwrap()).unwrap();
        assert!((owned.force.x - 1.0).abs() < 1e-12);
    }

    #[test]
    fn scaled_storage_is_rejected() {
        let (mut atoms, bonds, boundary) = setup();
        atoms.transform_cart_to_gen(&boundary).unwrap();
        let potential = HarmonicBond {
            stiffness: 1.0,
            rest_length: 1.0,
        };
        assert!(potential.compute(&mut atoms, &bonds, &boundary, true).is_err());
    }
}
