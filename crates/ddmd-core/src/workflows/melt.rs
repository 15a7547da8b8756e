use crate::core::boundary::Boundary;
use crate::core::models::atom::Atom;
use crate::core::models::configuration::Configuration;
use crate::core::models::group::{Angle, Bond, Dihedral};
use crate::engine::config::ConfigError;
use crate::engine::error::EngineError;
use nalgebra::Vector3;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::info;

/// Shape of a generated homopolymer melt.
#[derive(Debug, Clone, PartialEq)]
pub struct MeltParameters {
    pub chains: usize,
    /// Atoms per chain.
    pub chain_length: usize,
    /// Edge lengths of the periodic cell.
    pub lengths: Vector3<f64>,
    pub bond_length: f64,
    pub seed: u64,
}

/// Builds a melt of linear chains grown as random walks with a fixed bond
/// length.
///
/// Atoms are numbered chain by chain. Every pair of consecutive atoms in a
/// chain is bonded, every triple forms an angle and every quadruple a
/// dihedral; group ids are sequential per kind. Positions are returned in
/// scaled coordinates wrapped into the primary cell.
///
/// # Errors
///
/// Returns [`EngineError::Config`] for an empty melt or a non-positive bond
/// length, and [`EngineError::Boundary`] for an invalid cell.
pub fn build_melt(params: &MeltParameters) -> Result<Configuration, EngineError> {
    if params.chains == 0 || params.chain_length == 0 {
        return Err(ConfigError::InvalidParameter {
            name: "melt",
            reason: "needs at least one chain of at least one atom".into(),
        }
        .into());
    }
    if !(params.bond_length.is_finite() && params.bond_length > 0.0) {
        return Err(ConfigError::InvalidParameter {
            name: "bond_length",
            reason: format!("must be positive, got {}", params.bond_length),
        }
        .into());
    }
    let boundary = Boundary::new(params.lengths)?;
    let mut rng = StdRng::seed_from_u64(params.seed);
    let mut configuration = Configuration::new(boundary);

    let mut next_id = 0u32;
    for _ in 0..params.chains {
        let first = next_id;
        let mut position = Vector3::from_fn(|axis, _| rng.gen_range(0.0..params.lengths[axis]));
        for index in 0..params.chain_length {
            if index > 0 {
                position += random_direction(&mut rng) * params.bond_length;
            }
            let scaled = boundary.shift_gen(&boundary.transform_cart_to_gen(&position));
            configuration.atoms.push(Atom::new(next_id, 0, scaled));
            next_id += 1;
        }

        let ids: Vec<u32> = (first..next_id).collect();
        for pair in ids.windows(2) {
            let id = configuration.bonds.len() as u32;
            configuration.bonds.push(Bond::new(id, 0, [pair[0], pair[1]]));
        }
        for triple in ids.windows(3) {
            let id = configuration.angles.len() as u32;
            configuration
                .angles
                .push(Angle::new(id, 0, [triple[0], triple[1], triple[2]]));
        }
        for quad in ids.windows(4) {
            let id = configuration.dihedrals.len() as u32;
            configuration
                .dihedrals
                .push(Dihedral::new(id, 0, [quad[0], quad[1], quad[2], quad[3]]));
        }
    }

    info!(
        atoms = configuration.atoms.len(),
        bonds = configuration.bonds.len(),
        angles = configuration.angles.len(),
        dihedrals = configuration.dihedrals.len(),
        "Melt generated."
    );
    Ok(configuration)
}

fn random_direction(rng: &mut impl Rng) -> Vector3<f64> {
    loop {
        let v = Vector3::new(
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
            rng.gen_range(-1.0..=1.0),
        );
        let norm_sq: f64 = v.norm_squared();
        if norm_sq > 1e-6 && norm_sq <= 1.0 {
            return v / norm_sq.sqrt();
        }
    }
}
