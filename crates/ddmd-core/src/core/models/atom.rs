use super::ids::AtomId;
use super::mask::Mask;
use nalgebra::Vector3;

/// A point particle as seen by one domain.
///
/// Whether `position` is Cartesian or scaled is not stored per atom; it is a
/// property of the [`AtomStorage`](crate::core::storage::atoms::AtomStorage)
/// that holds the atom. Ghost atoms are read-only replicas of atoms owned by
/// another domain (or periodic images of local atoms).
#[derive(Debug, Clone, PartialEq)]
pub struct Atom {
    /// Global identifier, stable for the whole run.
    pub id: AtomId,
    /// Index of the atom type.
    pub type_id: u32,
    /// Position, in the coordinate system of the owning storage.
    pub position: Vector3<f64>,
    pub velocity: Vector3<f64>,
    pub force: Vector3<f64>,
    /// Partners excluded from pair interactions.
    pub mask: Mask,
    /// `true` for ghost replicas.
    pub is_ghost: bool,
}

impl Atom {
    /// Creates a non-ghost atom at rest with an empty mask.
    ///
    /// # Arguments
    ///
    /// * `id` - The global atom id.
    /// * `type_id` - The atom type index.
    /// * `position` - The position, usually in scaled coordinates.
    pub fn new(id: AtomId, type_id: u32, position: Vector3<f64>) -> Self {
        Self {
            id,
            type_id,
            position,
            velocity: Vector3::zeros(),
            force: Vector3::zeros(),
            mask: Mask::default(),
            is_ghost: false,
        }
    }

    pub fn with_velocity(mut self, velocity: Vector3<f64>) -> Self {
        self.velocity = velocity;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_atom_is_owned_at_rest_with_empty_mask() {
        let atom = Atom::new(12, 3, Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(atom.id, 12);
        assert_eq!(atom.type_id, 3);
        assert_eq!(atom.position, Vector3::new(0.1, 0.2, 0.3));
        assert_eq!(atom.velocity, Vector3::zeros());
        assert_eq!(atom.force, Vector3::zeros());
        assert!(atom.mask.is_empty());
        assert!(!atom.is_ghost);
    }

    #[test]
    fn with_velocity_sets_velocity_only() {
        let atom = Atom::new(1, 0, Vector3::zeros()).with_velocity(Vector3::new(1.0, -1.0, 0.5));
        assert_eq!(atom.velocity, Vector3::new(1.0, -1.0, 0.5));
        assert_eq!(atom.position, Vector3::zeros());
    }
}
