//! Gather of the distributed system back onto the master.
//!
//! Every non-master rank streams its records to the master in blocks of at
//! most `cache_capacity` records, the last block flagged complete. The master
//! keeps its own records first and then appends each rank's in rank order,
//! so output order differs from input order.

pub mod atoms;
pub mod groups;

pub use atoms::AtomCollector;
pub use groups::GroupCollector;
