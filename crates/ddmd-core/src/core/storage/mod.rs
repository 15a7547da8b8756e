//! Per-domain containers for atoms and bonded groups.
//!
//! Each domain owns one [`atoms::AtomStorage`] and one [`groups::BondedStorage`].
//! Storages are mutated only by their own domain; the communication layer
//! moves data between storages by packing records into message buffers.

pub mod atoms;
pub mod groups;

pub use atoms::AtomStorage;
pub use groups::{AngleStorage, BondStorage, BondedStorage, DihedralStorage, GroupStorage};

use crate::core::models::ids::{AtomId, GroupId};
use crate::core::models::mask::MaskOverflow;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum StorageError {
    #[error("Storage capacity for {what} must be greater than zero")]
    ZeroCapacity { what: &'static str },

    #[error("Atom {0} is already owned by this domain")]
    DuplicateAtom(AtomId),

    #[error("Atom capacity of {capacity} exceeded")]
    AtomCapacityExceeded { capacity: usize },

    #[error("Ghost capacity of {capacity} exceeded")]
    GhostCapacityExceeded { capacity: usize },

    #[error("Atom {0} is not held by this domain")]
    UnknownAtom(AtomId),

    #[error("Duplicate {kind} id {id}", kind = crate::core::models::group::group_kind_name(*arity))]
    DuplicateGroup { arity: usize, id: GroupId },

    #[error("Capacity of {capacity} exceeded for {kind} groups", kind = crate::core::models::group::group_kind_name(*arity))]
    GroupCapacityExceeded { arity: usize, capacity: usize },

    #[error("Unknown {kind} id {id}", kind = crate::core::models::group::group_kind_name(*arity))]
    UnknownGroup { arity: usize, id: GroupId },

    #[error("Atom storage must hold {expected} coordinates for this operation")]
    CoordinateMode { expected: &'static str },

    #[error("Cannot mask partners of atom {atom_id}: {source}")]
    Mask {
        atom_id: AtomId,
        #[source]
        source: MaskOverflow,
    },

    #[error("Storage is internally inconsistent: {0}")]
    Inconsistent(String),
}
