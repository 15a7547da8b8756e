use super::ids::AtomId;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Maximum number of partners a single atom can exclude from pair interactions.
pub const MASK_CAPACITY: usize = 4;

/// Decides which atom pairs are excluded from pair-potential evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MaskPolicy {
    /// No pairs are excluded.
    #[default]
    MaskNone,
    /// Pairs of atoms that share a bond are excluded.
    MaskBonded,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("Unknown mask policy '{0}'. Expected 'none' or 'bonded'.")]
pub struct ParseMaskPolicyError(pub String);

impl FromStr for MaskPolicy {
    type Err = ParseMaskPolicyError;

    /// Parses a mask policy name, ignoring case.
    ///
    /// Both the short forms (`none`, `bonded`) and the long forms
    /// (`MaskNone`, `MaskBonded`) are accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "none" | "masknone" | "mask-none" => Ok(MaskPolicy::MaskNone),
            "bonded" | "maskbonded" | "mask-bonded" => Ok(MaskPolicy::MaskBonded),
            _ => Err(ParseMaskPolicyError(s.to_string())),
        }
    }
}

impl fmt::Display for MaskPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaskNone => write!(f, "none"),
            Self::MaskBonded => write!(f, "bonded"),
        }
    }
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("Mask capacity of {capacity} exceeded while adding partner {partner}", capacity = MASK_CAPACITY)]
pub struct MaskOverflow {
    pub partner: AtomId,
}

/// The set of partner atoms excluded from pair interactions with one atom.
///
/// The set has a fixed capacity so that masks can travel with their atom
/// inside fixed-size message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Mask {
    partners: [AtomId; MASK_CAPACITY],
    size: usize,
}

impl Mask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a partner id. Adding an id that is already present is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`MaskOverflow`] if the mask already holds [`MASK_CAPACITY`] partners.
    pub fn append(&mut self, partner: AtomId) -> Result<(), MaskOverflow> {
        if self.is_masked(partner) {
            return Ok(());
        }
        if self.size == MASK_CAPACITY {
            return Err(MaskOverflow { partner });
        }
        self.partners[self.size] = partner;
        self.size += 1;
        Ok(())
    }

    pub fn is_masked(&self, id: AtomId) -> bool {
        self.as_slice().contains(&id)
    }

    pub fn clear(&mut self) {
        self.partners = [0; MASK_CAPACITY];
        self.size = 0;
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn as_slice(&self) -> &[AtomId] {
        &self.partners[..self.size]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_ignores_duplicates_and_tracks_size() {
        let mut mask = Mask::new();
        mask.append(7).unwrap();
        mask.append(3).unwrap();
        mask.append(7).unwrap();
        assert_eq!(mask.size(), 2);
        assert!(mask.is_masked(3));
        assert!(mask.is_masked(7));
        assert!(!mask.is_masked(0));
        assert_eq!(mask.as_slice(), &[7, 3]);
    }

    #[test]
    fn append_past_capacity_is_an_error() {
        let mut mask = Mask::new();
        for id in 0..MASK_CAPACITY as AtomId {
            mask.append(id).unwrap();
        }
        assert_eq!(mask.append(99), Err(MaskOverflow { partner: 99 }));
        assert_eq!(mask.size(), MASK_CAPACITY);
    }

    #[test]
    fn clear_empties_mask() {
        let mut mask = Mask::new();
        mask.append(1).unwrap();
        mask.clear();
        assert!(mask.is_empty());
        assert!(!mask.is_masked(1));
        assert_eq!(mask, Mask::default());
    }

    #[test]
    fn mask_policy_parses_short_and_long_names() {
        assert_eq!("none".parse::<MaskPolicy>(), Ok(MaskPolicy::MaskNone));
        assert_eq!("Bonded".parse::<MaskPolicy>(), Ok(MaskPolicy::MaskBonded));
        assert_eq!("MaskBonded".parse::<MaskPolicy>(), Ok(MaskPolicy::MaskBonded));
        assert_eq!("mask-none".parse::<MaskPolicy>(), Ok(MaskPolicy::MaskNone));
        assert!("angles".parse::<MaskPolicy>().is_err());
    }

    #[test]
    fn mask_policy_display_round_trips_through_from_str() {
        for policy in [MaskPolicy::MaskNone, MaskPolicy::MaskBonded] {
            assert_eq!(policy.to_string().parse::<MaskPolicy>(), Ok(policy));
        }
        assert_eq!(MaskPolicy::default(), MaskPolicy::MaskNone);
    }
}
