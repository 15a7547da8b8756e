//! # DDMD Core Library
//!
//! Domain decomposition for particle simulations: a periodic cell is split
//! into a grid of domains, each owning the atoms inside it, and neighbouring
//! domains trade atoms, ghost copies and forces as the system evolves.
//!
//! ## Architectural Philosophy
//!
//! The library is organized in layers, each depending only on those below it.
//!
//! - **[`core`]: The Foundation.** Plain data models (`Atom`, `Group`,
//!   `Configuration`), the periodic `Boundary`, per-domain storages and the
//!   checkpoint archive format.
//!
//! - **[`comm`]: The Plumbing.** Domains, communicators, message buffers,
//!   distributors, collectors and the exchanger that migrates atoms and
//!   maintains ghost layers.
//!
//! - **[`engine`]: The Logic Core.** A stateful per-domain simulation that
//!   drives the plumbing, with pluggable motion and force models.
//!
//! - **[`workflows`]: The Public API.** Complete runs over a grid of
//!   in-process domains, plus generators for input systems.

pub mod comm;
pub mod core;
pub mod engine;
pub mod workflows;
