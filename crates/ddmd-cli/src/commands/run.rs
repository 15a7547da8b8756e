use crate::cli::{Overrides, RunArgs};
use crate::config::{AppConfig, PartialRunConfig};
use crate::error::{CliError, Result};
use crate::utils::progress::CliProgressHandler;
use ddmd::core::models::configuration::Configuration;
use ddmd::engine::progress::ProgressReporter;
use ddmd::workflows::{self, run::RunResult};
use serde::Serialize;
use std::path::Path;
use tracing::info;

/// One row of the output CSV. Positions are Cartesian.
#[derive(Debug, Serialize)]
struct AtomRecord {
    id: u32,
    #[serde(rename = "type")]
    type_id: u32,
    x: f64,
    y: f64,
    z: f64,
}

pub fn run(args: RunArgs) -> Result<()> {
    let partial_config = PartialRunConfig::from_file(&args.config)?;
    info!("Merging configuration from file and CLI arguments...");
    let AppConfig {
        simulation,
        run: params,
        melt,
    } = partial_config.merge_with_cli(&Overrides::from(&args))?;

    info!(
        chains = melt.chains,
        chain_length = melt.chain_length,
        "Building polymer melt..."
    );
    let configuration = workflows::melt::build_melt(&melt)?;

    let progress_handler = CliProgressHandler::new();
    let reporter = ProgressReporter::with_callback(progress_handler.get_callback());

    println!(
        "Running {} steps on a {}x{}x{} domain grid...",
        params.steps, simulation.grid[0], simulation.grid[1], simulation.grid[2]
    );
    let result = workflows::run::run(&configuration, &simulation, &params, &reporter)?;

    print_summary(&result);

    if let Some(path) = &args.output {
        write_configuration(&result.configuration, path)?;
        println!("✓ Final configuration written to: {}", path.display());
    }

    Ok(())
}

fn print_summary(result: &RunResult) {
    let counts = result.counts;
    println!(
        "Atoms: {}  Bonds: {}  Angles: {}  Dihedrals: {}",
        counts.atoms, counts.bonds, counts.angles, counts.dihedrals
    );
    println!(
        "Exchanges: {}  Atoms migrated: {}",
        result.exchanges(),
        result.atoms_migrated()
    );
    for report in &result.domains {
        println!(
            "  Domain {:>3}: {:>6} owned, {:>6} ghosts, largest message {} bytes",
            report.rank, report.owned_atoms, report.ghost_atoms, report.statistics.max_send_size
        );
    }
    if let Some(energy) = result.bond_energy {
        println!("Bond energy: {:.6}", energy);
    }
}

fn write_configuration(configuration: &Configuration, path: &Path) -> Result<()> {
    let output_error = |source| CliError::Output {
        path: path.to_path_buf(),
        source,
    };
    let mut writer = csv::Writer::from_path(path).map_err(output_error)?;
    for atom in &configuration.atoms {
        let r = configuration.boundary.transform_gen_to_cart(&atom.position);
        writer
            .serialize(AtomRecord {
                id: atom.id,
                type_id: atom.type_id,
                x: r.x,
                y: r.y,
                z: r.z,
            })
            .map_err(output_error)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ddmd::core::boundary::Boundary;
    use ddmd::core::models::atom::Atom;
    use nalgebra::Vector3;
    use std::fs;

    #[test]
    fn configuration_is_written_as_cartesian_csv() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("final.csv");
        let mut configuration = Configuration::new(Boundary::cubic(10.0).unwrap());
        configuration
            .atoms
            .push(Atom::new(0, 1, Vector3::new(0.5, 0.25, 0.0)));
        configuration
            .atoms
            .push(Atom::new(1, 2, Vector3::new(0.1, 0.2, 0.3)));

        write_configuration(&configuration, &path).unwrap();

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines[0], "id,type,x,y,z");
        assert_eq!(lines[1], "0,1,5.0,2.5,0.0");
        assert_eq!(lines.len(), 3);
    }

    #[test]
    fn unwritable_output_reports_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing").join("final.csv");
        let configuration = Configuration::new(Boundary::cubic(10.0).unwrap());
        let result = write_configuration(&configuration, &path);
        assert!(matches!(result, Err(CliError::Output { path: p, .. }) if p == path));
    }
}
