use crate::comm::buffer::{ATOM_RECORD_SIZE, Buffer, HEADER_SIZE};
use crate::comm::distributor::{DEFAULT_CACHE_CAPACITY, DEFAULT_WRAP_TOLERANCE};
use crate::comm::error::CommError;
use crate::comm::exchanger::ExchangeConfig;
use crate::core::boundary::DIMENSION;
use crate::core::models::mask::MaskPolicy;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("Missing required parameter: {0}")]
    MissingParameter(&'static str),

    #[error("Invalid value for parameter '{name}': {reason}")]
    InvalidParameter { name: &'static str, reason: String },
}

/// Per-domain storage capacities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageConfig {
    pub atom_capacity: usize,
    pub ghost_capacity: usize,
    pub bond_capacity: usize,
    pub angle_capacity: usize,
    pub dihedral_capacity: usize,
}

/// Number of records cached per destination during distribution and
/// collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub atom_cache_capacity: usize,
    pub group_cache_capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            atom_cache_capacity: DEFAULT_CACHE_CAPACITY,
            group_cache_capacity: DEFAULT_CACHE_CAPACITY,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    /// Number of domains along x, y and z.
    pub grid: [usize; DIMENSION],
    pub storage: StorageConfig,
    pub caches: CacheConfig,
    /// Message buffer capacity in bytes. `None` sizes the buffer from the
    /// storage capacities.
    pub buffer_capacity: Option<usize>,
    pub exchange: ExchangeConfig,
    pub mask_policy: MaskPolicy,
    /// How far outside the cell, in scaled units, an input position may lie
    /// and still be wrapped on distribution.
    pub wrap_tolerance: f64,
    /// Force a full exchange at least every this many steps, in addition to
    /// the skin criterion.
    pub exchange_interval: Option<u64>,
}

impl SimulationConfig {
    pub fn n_procs(&self) -> usize {
        self.grid.iter().product()
    }

    /// Creates the message buffer for one domain.
    pub fn make_buffer(&self) -> Result<Buffer, CommError> {
        match self.buffer_capacity {
            Some(bytes) => Buffer::new(bytes),
            None => Buffer::for_capacities(self.storage.atom_capacity, self.storage.ghost_capacity),
        }
    }
}

#[derive(Default)]
pub struct SimulationConfigBuilder {
    grid: Option<[usize; DIMENSION]>,
    atom_capacity: Option<usize>,
    ghost_capacity: Option<usize>,
    bond_capacity: Option<usize>,
    angle_capacity: Option<usize>,
    dihedral_capacity: Option<usize>,
    atom_cache_capacity: Option<usize>,
    group_cache_capacity: Option<usize>,
    buffer_capacity: Option<usize>,
    pair_cutoff: Option<f64>,
    skin: Option<f64>,
    reverse_update: bool,
    mask_policy: MaskPolicy,
    wrap_tolerance: Option<f64>,
    exchange_interval: Option<u64>,
}

impl SimulationConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn grid(mut self, grid: [usize; DIMENSION]) -> Self {
        self.grid = Some(grid);
        self
    }
    pub fn atom_capacity(mut self, capacity: usize) -> Self {
        self.atom_capacity = Some(capacity);
        self
    }
    pub fn ghost_capacity(mut self, capacity: usize) -> Self {
        self.ghost_capacity = Some(capacity);
        self
    }
    pub fn bond_capacity(mut self, capacity: usize) -> Self {
        self.bond_capacity = Some(capacity);
        self
    }
    pub fn angle_capacity(mut self, capacity: usize) -> Self {
        self.angle_capacity = Some(capacity);
        self
    }
    pub fn dihedral_capacity(mut self, capacity: usize) -> Self {
        self.dihedral_capacity = Some(capacity);
        self
    }
    pub fn atom_cache_capacity(mut self, capacity: usize) -> Self {
        self.atom_cache_capacity = Some(capacity);
        self
    }
    pub fn group_cache_capacity(mut self, capacity: usize) -> Self {
        self.group_cache_capacity = Some(capacity);
        self
    }
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.buffer_capacity = Some(bytes);
        self
    }
    pub fn pair_cutoff(mut self, cutoff: f64) -> Self {
        self.pair_cutoff = Some(cutoff);
        self
    }
    pub fn skin(mut self, skin: f64) -> Self {
        self.skin = Some(skin);
        self
    }
    pub fn reverse_update(mut self, enabled: bool) -> Self {
        self.reverse_update = enabled;
        self
    }
    pub fn mask_policy(mut self, policy: MaskPolicy) -> Self {
        self.mask_policy = policy;
        self
    }
    pub fn wrap_tolerance(mut self, tolerance: f64) -> Self {
        self.wrap_tolerance = Some(tolerance);
        self
    }
    pub fn exchange_interval(mut self, interval: u64) -> Self {
        self.exchange_interval = Some(interval);
        self
    }

    pub fn build(self) -> Result<SimulationConfig, ConfigError> {
        let grid = self.grid.ok_or(ConfigError::MissingParameter("grid"))?;
        if grid.contains(&0) {
            return Err(ConfigError::InvalidParameter {
                name: "grid",
                reason: format!("every dimension must be positive, got {:?}", grid),
            });
        }

        let storage = StorageConfig {
            atom_capacity: positive(
                "atom_capacity",
                self.atom_capacity
                    .ok_or(ConfigError::MissingParameter("atom_capacity"))?,
            )?,
            ghost_capacity: positive(
                "ghost_capacity",
                self.ghost_capacity
                    .ok_or(ConfigError::MissingParameter("ghost_capacity"))?,
            )?,
            bond_capacity: positive(
                "bond_capacity",
                self.bond_capacity
                    .ok_or(ConfigError::MissingParameter("bond_capacity"))?,
            )?,
            angle_capacity: positive(
                "angle_capacity",
                self.angle_capacity
                    .ok_or(ConfigError::MissingParameter("angle_capacity"))?,
            )?,
            dihedral_capacity: positive(
                "dihedral_capacity",
                self.dihedral_capacity
                    .ok_or(ConfigError::MissingParameter("dihedral_capacity"))?,
            )?,
        };

        let defaults = CacheConfig::default();
        let caches = CacheConfig {
            atom_cache_capacity: positive(
                "atom_cache_capacity",
                self.atom_cache_capacity.unwrap_or(defaults.atom_cache_capacity),
            )?,
            group_cache_capacity: positive(
                "group_cache_capacity",
                self.group_cache_capacity.unwrap_or(defaults.group_cache_capacity),
            )?,
        };

        if let Some(bytes) = self.buffer_capacity {
            let needed = HEADER_SIZE + caches.atom_cache_capacity * ATOM_RECORD_SIZE;
            if bytes < needed {
                return Err(ConfigError::InvalidParameter {
                    name: "buffer_capacity",
                    reason: format!(
                        "{} bytes cannot hold one cache of {} atoms ({} bytes)",
                        bytes, caches.atom_cache_capacity, needed
                    ),
                });
            }
        }

        let pair_cutoff = self
            .pair_cutoff
            .ok_or(ConfigError::MissingParameter("pair_cutoff"))?;
        if !(pair_cutoff.is_finite() && pair_cutoff > 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "pair_cutoff",
                reason: format!("must be positive, got {}", pair_cutoff),
            });
        }
        let skin = self.skin.ok_or(ConfigError::MissingParameter("skin"))?;
        if !(skin.is_finite() && skin >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "skin",
                reason: format!("must be non-negative, got {}", skin),
            });
        }

        let wrap_tolerance = self.wrap_tolerance.unwrap_or(DEFAULT_WRAP_TOLERANCE);
        if !(wrap_tolerance.is_finite() && wrap_tolerance >= 0.0) {
            return Err(ConfigError::InvalidParameter {
                name: "wrap_tolerance",
                reason: format!("must be non-negative, got {}", wrap_tolerance),
            });
        }
        if self.exchange_interval == Some(0) {
            return Err(ConfigError::InvalidParameter {
                name: "exchange_interval",
                reason: "must be at least 1".into(),
            });
        }

        Ok(SimulationConfig {
            grid,
            storage,
            caches,
            buffer_capacity: self.buffer_capacity,
            exchange: ExchangeConfig {
                pair_cutoff,
                skin,
                reverse_update: self.reverse_update,
            },
            mask_policy: self.mask_policy,
            wrap_tolerance,
            exchange_interval: self.exchange_interval,
        })
    }
}

fn positive(name: &'static str, value: usize) -> Result<usize, ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidParameter {
            name,
            reason: "must be greater than zero".into(),
        });
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn complete() -> SimulationConfigBuilder {
        SimulationConfigBuilder::new()
            .grid([2, 1, 1])
            .atom_capacity(100)
            .ghost_capacity(100)
            .bond_capacity(100)
            .angle_capacity(100)
            .dihedral_capacity(100)
            .pair_cutoff(1.0)
            .skin(0.3)
    }

    #[test]
    fn build_applies_defaults() {
        let config = complete().build().unwrap();
        assert_eq!(config.n_procs(), 2);
        assert_eq!(config.caches, CacheConfig::default());
        assert_eq!(config.caches.atom_cache_capacity, 100);
        assert_eq!(config.wrap_tolerance, 0.5);
        assert_eq!(config.mask_policy, MaskPolicy::MaskNone);
        assert!(!config.exchange.reverse_update);
        assert!((config.exchange.ghost_width() - 1.3).abs() < 1e-12);
    }

    #[test]
    fn missing_parameters_are_named() {
        let err = SimulationConfigBuilder::new().build().unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("grid"));
        let err = SimulationConfigBuilder::new()
            .grid([1, 1, 1])
            .atom_capacity(10)
            .build()
            .unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("ghost_capacity"));
        let err = SimulationConfigBuilder {
            skin: None,
            ..complete()
        }
        .build()
        .unwrap_err();
        assert_eq!(err, ConfigError::MissingParameter("skin"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(matches!(
            complete().grid([0, 1, 1]).build(),
            Err(ConfigError::InvalidParameter { name: "grid", .. })
        ));
        assert!(matches!(
            complete().atom_capacity(0).build(),
            Err(ConfigError::InvalidParameter { name: "atom_capacity", .. })
        ));
        assert!(matches!(
            complete().pair_cutoff(-1.0).build(),
            Err(ConfigError::InvalidParameter { name: "pair_cutoff", .. })
        ));
        assert!(matches!(
            complete().buffer_capacity(64).build(),
            Err(ConfigError::InvalidParameter { name: "buffer_capacity", .. })
        ));
        assert!(matches!(
            complete().exchange_interval(0).build(),
            Err(ConfigError::InvalidParameter { name: "exchange_interval", .. })
        ));
    }

    #[test]
    fn buffer_is_sized_from_capacities_unless_given() {
        let config = complete().build().unwrap();
        assert!(config.make_buffer().unwrap().capacity() >= 100 * ATOM_RECORD_SIZE);
        let config = complete().buffer_capacity(100_000).build().unwrap();
        assert_eq!(config.make_buffer().unwrap().capacity(), 100_000);
    }
}
