pub mod defaults;

use crate::cli::Overrides;
use crate::error::{CliError, Result};
use crate::utils::parser;
use ddmd::core::models::mask::MaskPolicy;
use ddmd::engine::config::{SimulationConfig, SimulationConfigBuilder};
use ddmd::engine::forces::HarmonicBond;
use ddmd::workflows::melt::MeltParameters;
use ddmd::workflows::run::RunParameters;
use defaults::DefaultsConfig;
use nalgebra::Vector3;
use serde::Deserialize;
use std::path::Path;
use std::str::FromStr;
use tracing::debug;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialCellConfig {
    lengths: Option<[f64; 3]>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialStorageConfig {
    atom_capacity: Option<usize>,
    ghost_capacity: Option<usize>,
    bond_capacity: Option<usize>,
    angle_capacity: Option<usize>,
    dihedral_capacity: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialCacheConfig {
    atom: Option<usize>,
    group: Option<usize>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialExchangeConfig {
    pair_cutoff: Option<f64>,
    skin: Option<f64>,
    reverse_update: Option<bool>,
    buffer_capacity: Option<usize>,
    interval: Option<u64>,
    wrap_tolerance: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialChemistryConfig {
    mask_policy: Option<String>,
    bond_stiffness: Option<f64>,
    bond_rest_length: Option<f64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialRunSection {
    steps: Option<u64>,
    max_displacement: Option<f64>,
    seed: Option<u64>,
}

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
struct PartialMeltConfig {
    chains: Option<usize>,
    chain_length: Option<usize>,
    bond_length: Option<f64>,
}

/// A run configuration as read from TOML, before defaults and overrides.
#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct PartialRunConfig {
    grid: Option<[usize; 3]>,
    cell: Option<PartialCellConfig>,
    storage: Option<PartialStorageConfig>,
    cache: Option<PartialCacheConfig>,
    exchange: Option<PartialExchangeConfig>,
    chemistry: Option<PartialChemistryConfig>,
    run: Option<PartialRunSection>,
    melt: Option<PartialMeltConfig>,
}

/// Everything a run needs, fully resolved.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub simulation: SimulationConfig,
    pub run: RunParameters,
    pub melt: MeltParameters,
}

impl PartialRunConfig {
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from file: {:?}", path);
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content).map_err(|e| CliError::FileParsing {
            path: path.to_path_buf(),
            source: e.into(),
        })
    }

    /// Applies `-S` assignments and command-line overrides, fills in
    /// defaults and validates the result.
    pub fn merge_with_cli(mut self, overrides: &Overrides) -> Result<AppConfig> {
        self.apply_set_values(&overrides.set_values)?;
        let defaults = DefaultsConfig::default();

        let grid = overrides.grid.or(self.grid).unwrap_or(defaults.grid);
        let cell = self.cell.take().unwrap_or_default();
        let storage = self.storage.take().unwrap_or_default();
        let cache = self.cache.take().unwrap_or_default();
        let exchange = self.exchange.take().unwrap_or_default();
        let chemistry = self.chemistry.take().unwrap_or_default();
        let run = self.run.take().unwrap_or_default();
        let melt = self.melt.take().unwrap_or_default();

        let lengths = cell.lengths.unwrap_or([defaults.cell_length; 3]);
        let pair_cutoff = exchange.pair_cutoff.ok_or_else(|| {
            CliError::Config("`exchange.pair-cutoff` is required.".to_string())
        })?;
        let skin = exchange.skin.unwrap_or(defaults.skin);
        Self::check_ghost_width(grid, lengths, pair_cutoff + skin)?;

        let mask_policy = MaskPolicy::from_str(
            chemistry
                .mask_policy
                .as_deref()
                .unwrap_or(defaults.mask_policy),
        )
        .map_err(|e| CliError::Config(e.to_string()))?;

        let mut builder = SimulationConfigBuilder::new()
            .grid(grid)
            .atom_capacity(storage.atom_capacity.unwrap_or(defaults.atom_capacity))
            .ghost_capacity(storage.ghost_capacity.unwrap_or(defaults.ghost_capacity))
            .bond_capacity(storage.bond_capacity.unwrap_or(defaults.group_capacity))
            .angle_capacity(storage.angle_capacity.unwrap_or(defaults.group_capacity))
            .dihedral_capacity(storage.dihedral_capacity.unwrap_or(defaults.group_capacity))
            .pair_cutoff(pair_cutoff)
            .skin(skin)
            .reverse_update(overrides.reverse_update || exchange.reverse_update.unwrap_or(false))
            .mask_policy(mask_policy);
        if let Some(capacity) = cache.atom {
            builder = builder.atom_cache_capacity(capacity);
        }
        if let Some(capacity) = cache.group {
            builder = builder.group_cache_capacity(capacity);
        }
        if let Some(bytes) = exchange.buffer_capacity {
            builder = builder.buffer_capacity(bytes);
        }
        if let Some(interval) = exchange.interval {
            builder = builder.exchange_interval(interval);
        }
        if let Some(tolerance) = exchange.wrap_tolerance {
            builder = builder.wrap_tolerance(tolerance);
        }
        let simulation = builder
            .build()
            .map_err(|e| CliError::Config(e.to_string()))?;

        let bond_length = melt.bond_length.unwrap_or(defaults.bond_length);
        let melt = MeltParameters {
            chains: overrides.chains.or(melt.chains).unwrap_or(defaults.chains),
            chain_length: overrides
                .chain_length
                .or(melt.chain_length)
                .unwrap_or(defaults.chain_length),
            lengths: Vector3::from(lengths),
            bond_length,
            seed: overrides.seed.or(run.seed).unwrap_or(defaults.seed),
        };
        if bond_length >= pair_cutoff + skin {
            return Err(CliError::Config(format!(
                "`melt.bond-length` ({}) must be shorter than the ghost width ({})",
                bond_length,
                pair_cutoff + skin
            )));
        }

        let bond_potential = chemistry.bond_stiffness.map(|stiffness| HarmonicBond {
            stiffness,
            rest_length: chemistry.bond_rest_length.unwrap_or(bond_length),
        });
        let max_displacement = run.max_displacement.unwrap_or(defaults.max_displacement);
        if !(max_displacement.is_finite() && max_displacement >= 0.0) {
            return Err(CliError::Config(format!(
                "`run.max-displacement` must be non-negative, got {}",
                max_displacement
            )));
        }
        let run = RunParameters {
            steps: overrides.steps.or(run.steps).unwrap_or(defaults.steps),
            max_displacement,
            seed: melt.seed,
            bond_potential,
        };

        Ok(AppConfig {
            simulation,
            run,
            melt,
        })
    }

    fn check_ghost_width(grid: [usize; 3], lengths: [f64; 3], width: f64) -> Result<()> {
        for axis in 0..3 {
            if !(lengths[axis].is_finite() && lengths[axis] > 0.0) {
                return Err(CliError::Config(format!(
                    "`cell.lengths` must be positive, got {:?}",
                    lengths
                )));
            }
            let domain_length = lengths[axis] / grid[axis] as f64;
            if width >= domain_length {
                return Err(CliError::Config(format!(
                    "Ghost width {} (pair cutoff + skin) must be smaller than the domain length {} along axis {}",
                    width, domain_length, axis
                )));
            }
        }
        Ok(())
    }

    fn apply_set_values(&mut self, set_values: &[String]) -> Result<()> {
        for kv_pair in set_values {
            let (key, value) =
                parser::parse_assignment(kv_pair).map_err(|e| CliError::Config(e.to_string()))?;
            match key {
                "grid" => {
                    self.grid =
                        Some(parser::parse_grid(value).map_err(|e| CliError::Config(e.to_string()))?);
                }
                "storage.atom-capacity" => {
                    self.storage_mut().atom_capacity = Some(parse_value(key, value)?);
                }
                "storage.ghost-capacity" => {
                    self.storage_mut().ghost_capacity = Some(parse_value(key, value)?);
                }
                "storage.bond-capacity" => {
                    self.storage_mut().bond_capacity = Some(parse_value(key, value)?);
                }
                "storage.angle-capacity" => {
                    self.storage_mut().angle_capacity = Some(parse_value(key, value)?);
                }
                "storage.dihedral-capacity" => {
                    self.storage_mut().dihedral_capacity = Some(parse_value(key, value)?);
                }
                "cache.atom" => {
                    self.cache.get_or_insert_with(Default::default).atom = Some(parse_value(key, value)?);
                }
                "cache.group" => {
                    self.cache.get_or_insert_with(Default::default).group = Some(parse_value(key, value)?);
                }
                "exchange.pair-cutoff" => {
                    self.exchange_mut().pair_cutoff = Some(parse_value(key, value)?);
                }
                "exchange.skin" => {
                    self.exchange_mut().skin = Some(parse_value(key, value)?);
                }
                "exchange.reverse-update" => {
                    self.exchange_mut().reverse_update = Some(parse_value(key, value)?);
                }
                "exchange.buffer-capacity" => {
                    self.exchange_mut().buffer_capacity = Some(parse_value(key, value)?);
                }
                "exchange.interval" => {
                    self.exchange_mut().interval = Some(parse_value(key, value)?);
                }
                "exchange.wrap-tolerance" => {
                    self.exchange_mut().wrap_tolerance = Some(parse_value(key, value)?);
                }
                "chemistry.mask-policy" => {
                    self.chemistry_mut().mask_policy = Some(value.to_string());
                }
                "chemistry.bond-stiffness" => {
                    self.chemistry_mut().bond_stiffness = Some(parse_value(key, value)?);
                }
                "chemistry.bond-rest-length" => {
                    self.chemistry_mut().bond_rest_length = Some(parse_value(key, value)?);
                }
                "run.steps" => {
                    self.run_mut().steps = Some(parse_value(key, value)?);
                }
                "run.max-displacement" => {
                    self.run_mut().max_displacement = Some(parse_value(key, value)?);
                }
                "run.seed" => {
                    self.run_mut().seed = Some(parse_value(key, value)?);
                }
                "melt.chains" => {
                    self.melt_mut().chains = Some(parse_value(key, value)?);
                }
                "melt.chain-length" => {
                    self.melt_mut().chain_length = Some(parse_value(key, value)?);
                }
                "melt.bond-length" => {
                    self.melt_mut().bond_length = Some(parse_value(key, value)?);
                }
                _ => {
                    return Err(CliError::Config(format!(
                        "Unsupported configuration key for --set: '{}'",
                        key
                    )));
                }
            }
        }
        Ok(())
    }

    fn storage_mut(&mut self) -> &mut PartialStorageConfig {
        self.storage.get_or_insert_with(Default::default)
    }

    fn exchange_mut(&mut self) -> &mut PartialExchangeConfig {
        self.exchange.get_or_insert_with(Default::default)
    }

    fn chemistry_mut(&mut self) -> &mut PartialChemistryConfig {
        self.chemistry.get_or_insert_with(Default::default)
    }

    fn run_mut(&mut self) -> &mut PartialRunSection {
        self.run.get_or_insert_with(Default::default)
    }

    fn melt_mut(&mut self) -> &mut PartialMeltConfig {
        self.melt.get_or_insert_with(Default::default)
    }
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value.parse().map_err(|_| {
        CliError::Config(format!("Invalid value for {}: {}", key, value))
    })
}
