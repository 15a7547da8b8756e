use crate::core::boundary::Boundary;
use crate::core::storage::AtomStorage;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Advances the positions of owned atoms by one step.
///
/// Implementations must only touch owned atoms; ghosts are refreshed by the
/// exchanger afterwards.
pub trait MotionModel {
    fn advance(&mut self, atoms: &mut AtomStorage, boundary: &Boundary);
}

/// Moves every owned atom by an independent uniform displacement of at most
/// `max_step` (Cartesian units) along each axis.
#[derive(Debug, Clone)]
pub struct RandomWalk {
    max_step: f64,
    rng: StdRng,
}

impl RandomWalk {
    /// Creates a walk whose random stream depends on both `seed` and `rank`,
    /// so that domains draw independent displacements.
    pub fn new(max_step: f64, seed: u64, rank: usize) -> Self {
        Self {
            max_step,
            rng: StdRng::seed_from_u64(seed.wrapping_add(rank as u64)),
        }
    }

    pub fn max_step(&self) -> f64 {
        self.max_step
    }
}

impl MotionModel for RandomWalk {
    fn advance(&mut self, atoms: &mut AtomStorage, boundary: &Boundary) {
        if self.max_step <= 0.0 {
            return;
        }
        let cartesian = atoms.is_cartesian();
        for atom in atoms.owned_atoms_mut() {
            let step = Vector3::from_fn(|_, _| self.rng.gen_range(-self.max_step..=self.max_step));
            atom.position += if cartesian {
                step
            } else {
                boundary.transform_cart_to_gen(&step)
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::models::atom::Atom;

    fn storage() -> AtomStorage {
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        for id in 0..4 {
            atoms
                .add_atom(Atom::new(id, 0, Vector3::new(0.5, 0.5, 0.5)))
                .unwrap();
        }
        atoms
    }

    #[test]
    fn steps_are_bounded_in_cartesian_units() {
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut atoms = storage();
        atoms.make_snapshot(&boundary);
        let mut walk = RandomWalk::new(0.2, 7, 0);
        walk.advance(&mut atoms, &boundary);
        let max = atoms.max_sq_displacement(&boundary);
        assert!(max > 0.0);
        assert!(max <= 3.0 * 0.2 * 0.2 + 1e-12);
    }

    #[test]
    fn same_seed_and_rank_repeat_the_walk() {
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut a = storage();
        let mut b = storage();
        RandomWalk::new(0.1, 3, 1).advance(&mut a, &boundary);
        RandomWalk::new(0.1, 3, 1).advance(&mut b, &boundary);
        let pa: Vec<_> = a.owned_atoms().map(|atom| atom.position).collect();
        let pb: Vec<_> = b.owned_atoms().map(|atom| atom.position).collect();
        assert_eq!(pa, pb);
    }

    #[test]
    fn ghosts_are_not_moved() {
        let boundary = Boundary::cubic(10.0).unwrap();
        let mut atoms = AtomStorage::new(8, 8).unwrap();
        atoms
            .add_ghost(Atom::new(9, 0, Vector3::new(0.5, 0.5, 0.5)))
            .unwrap();
        RandomWalk::new(0.5, 1, 0).advance(&mut atoms, &boundary);
        assert_eq!(
            atoms.ghost_atoms().next().unwrap().position,
            Vector3::new(0.5, 0.5, 0.5)
        );
    }
}
