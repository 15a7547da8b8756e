use super::communicator::Communicator;
use super::domain::Domain;
use super::error::CommError;

/// The fixed per-rank context shared by every communicating component: the
/// domain description and the communicator endpoint.
///
/// Both are created once per run and only borrowed afterwards. The periodic
/// boundary is not part of the context because the cell may deform between
/// calls; it is passed to each operation instead.
#[derive(Debug)]
pub struct DomainContext<'a, C: Communicator> {
    pub domain: &'a Domain,
    pub comm: &'a C,
}

impl<C: Communicator> Clone for DomainContext<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C: Communicator> Copy for DomainContext<'_, C> {}

impl<'a, C: Communicator> DomainContext<'a, C> {
    /// Bundles a domain with its communicator.
    ///
    /// # Errors
    ///
    /// Returns [`CommError::Configuration`] if the communicator's rank or size
    /// disagree with the domain.
    pub fn new(domain: &'a Domain, comm: &'a C) -> Result<Self, CommError> {
        if domain.rank() != comm.rank() || domain.n_procs() != comm.size() {
            return Err(CommError::Configuration(format!(
                "domain is rank {} of {} but communicator is rank {} of {}",
                domain.rank(),
                domain.n_procs(),
                comm.rank(),
                comm.size()
            )));
        }
        Ok(Self { domain, comm })
    }

    pub fn rank(&self) -> usize {
        self.domain.rank()
    }

    pub fn is_master(&self) -> bool {
        self.domain.is_master()
    }

    pub fn n_procs(&self) -> usize {
        self.domain.n_procs()
    }

    /// Attributes an error raised while scattering records to this rank.
    pub(crate) fn distribution_error(&self, source: CommError) -> CommError {
        CommError::Distribution {
            rank: self.rank(),
            source: Box::new(source),
        }
    }

    /// Builds an [`CommError::OwnershipInconsistency`] for this rank.
    pub(crate) fn inconsistency(&self, message: impl Into<String>) -> CommError {
        CommError::OwnershipInconsistency {
            rank: self.rank(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::communicator::ChannelCommunicator;

    #[test]
    fn mismatched_rank_or_size_is_rejected() {
        let mesh = ChannelCommunicator::mesh(2);
        let domain = Domain::new([2, 1, 1], 0, 2).unwrap();
        assert!(DomainContext::new(&domain, &mesh[0]).is_ok());
        assert!(DomainContext::new(&domain, &mesh[1]).is_err());

        let single = Domain::new([1, 1, 1], 0, 1).unwrap();
        assert!(DomainContext::new(&single, &mesh[0]).is_err());
    }
}
