//! Scatter of a configuration held by the master to the owning domains.
//!
//! The master reads the whole system, then adds atoms one by one to an
//! [`AtomDistributor`] and groups to one [`GroupDistributor`] per arity.
//! Records destined for another rank are cached and shipped in blocks of at
//! most `cache_capacity` records. Every other rank calls `receive` on the
//! matching distributor. Both sides finish with a global count check.

pub mod atoms;
pub mod groups;

pub use atoms::{AtomDistributor, AtomOwnership};
pub use groups::GroupDistributor;

use super::communicator::{Communicator, decode_u64};
use super::context::DomainContext;
use super::error::CommError;

/// Default number of records cached per destination before a block is sent.
pub const DEFAULT_CACHE_CAPACITY: usize = 100;

/// Default distance, in scaled units, by which an input position may lie
/// outside the primary cell and still be wrapped back into it.
pub const DEFAULT_WRAP_TOLERANCE: f64 = 0.5;

pub(crate) fn require_master<C: Communicator>(
    ctx: &DomainContext<'_, C>,
    operation: &'static str,
) -> Result<(), CommError> {
    if !ctx.is_master() {
        return Err(CommError::Configuration(format!(
            "{} may only be called on the master rank (called on rank {})",
            operation,
            ctx.rank()
        )));
    }
    Ok(())
}

pub(crate) fn require_worker<C: Communicator>(
    ctx: &DomainContext<'_, C>,
    operation: &'static str,
) -> Result<(), CommError> {
    if ctx.is_master() {
        return Err(CommError::Configuration(format!(
            "{} may not be called on the master rank",
            operation
        )));
    }
    Ok(())
}

/// Sums `local` over all ranks and compares it with the count the master
/// distributed. Collective: every rank must call it.
///
/// # Return
///
/// The global total, on every rank.
pub(crate) fn check_global_count<C: Communicator>(
    ctx: &DomainContext<'_, C>,
    local: usize,
    expected_on_master: usize,
    what: &str,
) -> Result<usize, CommError> {
    let total = ctx.comm.all_reduce_sum(local as u64)? as usize;
    let expected = ctx
        .comm
        .broadcast((expected_on_master as u64).to_le_bytes().to_vec())?;
    let expected = decode_u64(&expected)? as usize;
    if total != expected {
        return Err(ctx.inconsistency(format!(
            "{} {} were distributed but domains hold {}",
            expected, what, total
        )));
    }
    Ok(total)
}
