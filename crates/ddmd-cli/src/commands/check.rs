use crate::cli::{CheckArgs, Overrides};
use crate::config::{AppConfig, PartialRunConfig};
use crate::error::Result;
use tracing::info;

pub fn run(args: CheckArgs) -> Result<()> {
    let config = PartialRunConfig::from_file(&args.config)?.merge_with_cli(&Overrides::from(&args))?;
    info!("Configuration {:?} is valid.", &args.config);
    for line in describe(&config) {
        println!("{}", line);
    }
    Ok(())
}

fn describe(config: &AppConfig) -> Vec<String> {
    let sim = &config.simulation;
    let mut lines = vec![
        format!(
            "Grid:            {}x{}x{} ({} domains)",
            sim.grid[0],
            sim.grid[1],
            sim.grid[2],
            sim.n_procs()
        ),
        format!(
            "Cell:            {} x {} x {}",
            config.melt.lengths.x, config.melt.lengths.y, config.melt.lengths.z
        ),
        format!(
            "Ghost width:     {} (cutoff {} + skin {})",
            sim.exchange.ghost_width(),
            sim.exchange.pair_cutoff,
            sim.exchange.skin
        ),
        format!("Reverse update:  {}", sim.exchange.reverse_update),
        format!("Mask policy:     {}", sim.mask_policy),
        format!(
            "Capacities:      {} atoms, {} ghosts, {}/{}/{} bonds/angles/dihedrals",
            sim.storage.atom_capacity,
            sim.storage.ghost_capacity,
            sim.storage.bond_capacity,
            sim.storage.angle_capacity,
            sim.storage.dihedral_capacity
        ),
        format!(
            "Melt:            {} chains of {} atoms, bond length {}",
            config.melt.chains, config.melt.chain_length, config.melt.bond_length
        ),
        format!(
            "Run:             {} steps, max displacement {}, seed {}",
            config.run.steps, config.run.max_displacement, config.run.seed
        ),
    ];
    if let Some(interval) = sim.exchange_interval {
        lines.push(format!("Exchange every:  {} steps", interval));
    }
    if let Some(bond) = &config.run.bond_potential {
        lines.push(format!(
            "Bond potential:  k = {}, r0 = {}",
            bond.stiffness, bond.rest_length
        ));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn description_lists_resolved_settings() {
        let overrides = Overrides {
            grid: Some([2, 2, 1]),
            set_values: vec![
                "exchange.pair-cutoff=1.0".to_string(),
                "chemistry.bond-stiffness=3.0".to_string(),
                "exchange.interval=10".to_string(),
            ],
            ..Overrides::default()
        };
        let config = PartialRunConfig::default()
            .merge_with_cli(&overrides)
            .unwrap();
        let lines = describe(&config);
        assert!(lines[0].contains("2x2x1 (4 domains)"));
        assert!(lines.iter().any(|l| l.contains("Mask policy:     none")));
        assert!(lines.iter().any(|l| l.starts_with("Exchange every:  10")));
        assert!(lines.iter().any(|l| l.contains("k = 3, r0 = 1")));
    }
}
