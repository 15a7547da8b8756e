//! # Core Module
//!
//! Data structures that live inside a single domain and never communicate on
//! their own.
//!
//! ## Overview
//!
//! - **Periodic cell** ([`boundary`]) - Orthorhombic boundary and the mapping
//!   between Cartesian and scaled coordinates
//! - **Models** ([`models`]) - Atoms, bonded groups, masks and whole-system
//!   configurations
//! - **Storage** ([`storage`]) - Per-domain atom and group containers with
//!   capacity limits, ghost bookkeeping and consistency checks
//! - **Checkpoints** ([`io`]) - Little-endian binary archives
//!
//! Everything that crosses a domain boundary is handled by [`crate::comm`],
//! which packs records from these storages into message buffers.

pub mod boundary;
pub mod io;
pub mod models;
pub mod storage;
