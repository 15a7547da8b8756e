use super::ids::{AtomId, GroupId};

/// A bonded interaction between `N` atoms.
///
/// Groups are identified by id within one arity. The member list is ordered;
/// the domain that owns the first member is the authoritative holder of the
/// group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Group<const N: usize> {
    pub id: GroupId,
    pub type_id: u32,
    pub atom_ids: [AtomId; N],
}

pub type Bond = Group<2>;
pub type Angle = Group<3>;
pub type Dihedral = Group<4>;

impl<const N: usize> Group<N> {
    pub fn new(id: GroupId, type_id: u32, atom_ids: [AtomId; N]) -> Self {
        Self {
            id,
            type_id,
            atom_ids,
        }
    }

    pub fn contains(&self, atom_id: AtomId) -> bool {
        self.atom_ids.contains(&atom_id)
    }

    /// Human-readable name of the group kind, used in diagnostics.
    pub fn kind_name() -> &'static str {
        group_kind_name(N)
    }
}

pub(crate) fn group_kind_name(arity: usize) -> &'static str {
    match arity {
        2 => "bond",
        3 => "angle",
        4 => "dihedral",
        _ => "group",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_checks_every_member() {
        let angle = Angle::new(5, 1, [10, 11, 12]);
        assert!(angle.contains(10));
        assert!(angle.contains(12));
        assert!(!angle.contains(13));
    }

    #[test]
    fn kind_names_follow_arity() {
        assert_eq!(Bond::kind_name(), "bond");
        assert_eq!(Angle::kind_name(), "angle");
        assert_eq!(Dihedral::kind_name(), "dihedral");
        assert_eq!(Group::<5>::kind_name(), "group");
    }
}
