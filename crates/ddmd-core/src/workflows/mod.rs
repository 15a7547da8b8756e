//! # Workflows Module
//!
//! High-level entry points that tie [`crate::engine`] and [`crate::comm`]
//! together.
//!
//! - **Run Workflow** ([`run`]) - Distributes a configuration over a grid of in-process
//!   domains, advances it with a random walk and collects the result
//! - **Melt Generation** ([`melt`]) - Builds homopolymer melts to feed the run workflow

pub mod melt;
pub mod run;
