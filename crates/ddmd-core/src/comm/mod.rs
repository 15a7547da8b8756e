//! # Communication Module
//!
//! Everything that moves atoms and groups between domains.
//!
//! ## Overview
//!
//! The periodic cell is cut into a regular grid of domains ([`domain`]), one
//! per rank. Ranks exchange tagged byte messages through a [`communicator`];
//! messages are built and parsed block by block with a fixed-capacity
//! [`buffer`].
//!
//! - **Distribution** ([`distributor`]) - The master scatters a configuration to the owning domains
//! - **Collection** ([`collector`]) - The domains gather their atoms and groups back to the master
//! - **Exchange** ([`exchanger`]) - Migration of atoms that left their domain, ghost
//!   layers, position refresh and reverse force communication
//!
//! All operations are collective in the sense that every rank must issue the
//! same sequence of calls; a rank that fails drops its endpoint and its peers
//! observe [`error::CommError::Disconnected`].

pub mod buffer;
pub mod collector;
pub mod communicator;
pub mod context;
pub mod distributor;
pub mod domain;
pub mod error;
pub mod exchanger;
