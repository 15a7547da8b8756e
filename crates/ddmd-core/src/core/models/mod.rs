//! # Core Models Module
//!
//! Plain data types shared by every layer of the decomposition: atoms, bonded
//! groups, exclusion masks, identifiers, and the whole-system configuration
//! exchanged with configuration readers and writers.
//!
//! ## Key Components
//!
//! - [`atom`] - A particle with position, velocity, force, mask and ghost flag
//! - [`group`] - `Group<N>` bonded interactions (`Bond`, `Angle`, `Dihedral`)
//! - [`mask`] - Fixed-capacity exclusion masks and the [`mask::MaskPolicy`]
//! - [`ids`] - Global ids and local slot keys
//! - [`configuration`] - A complete system held by one process
//!
//! ## Usage
//!
//! ```ignore
//! use ddmd::core::models::{atom::Atom, group::Bond};
//! use nalgebra::Vector3;
//!
//! let atom = Atom::new(0, 0, Vector3::new(0.25, 0.5, 0.75));
//! let bond = Bond::new(0, 0, [0, 1]);
//! ```

pub mod atom;
pub mod configuration;
pub mod group;
pub mod ids;
pub mod mask;
