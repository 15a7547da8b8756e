//! # Engine Module
//!
//! The per-domain simulation layer built on top of [`crate::comm`].
//!
//! ## Overview
//!
//! A [`simulation::DomainSimulation`] owns everything one rank needs: the
//! periodic cell, the atom and group storages, and an exchanger that keeps
//! them consistent with the neighbouring domains. Motion and force models
//! plug into it through narrow interfaces and only ever see local storage.
//!
//! ## Architecture
//!
//! - **Configuration** ([`config`]) - Validated capacities, cutoffs and policies for a run
//! - **Simulation** ([`simulation`]) - Distribution, stepping, exchange, collection and checkpoints
//! - **Motion** ([`motion`]) - Models that advance owned atoms
//! - **Forces** ([`forces`]) - Bonded force evaluation with optional reverse communication
//! - **Progress Monitoring** ([`progress`]) - Progress reporting for long runs
//! - **Error Handling** ([`error`]) - Engine-level error type wrapping every lower layer

pub mod config;
pub mod error;
pub mod forces;
pub mod motion;
pub mod progress;
pub mod simulation;
