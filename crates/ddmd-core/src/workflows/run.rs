use crate::comm::communicator::ChannelCommunicator;
use crate::comm::context::DomainContext;
use crate::comm::domain::Domain;
use crate::comm::exchanger::{ExchangeStatistics, GlobalCounts};
use crate::core::models::configuration::Configuration;
use crate::engine::config::SimulationConfig;
use crate::engine::error::EngineError;
use crate::engine::forces::HarmonicBond;
use crate::engine::motion::RandomWalk;
use crate::engine::progress::{Progress, ProgressReporter};
use crate::engine::simulation::DomainSimulation;
use std::thread;
use tracing::{error, info, instrument, warn};

/// Parameters of a random-walk run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunParameters {
    pub steps: u64,
    /// Largest displacement per axis per step, in Cartesian units.
    pub max_displacement: f64,
    pub seed: u64,
    /// Bonded forces evaluated after every step, if any.
    pub bond_potential: Option<HarmonicBond>,
}

impl Default for RunParameters {
    fn default() -> Self {
        Self {
            steps: 100,
            max_displacement: 0.05,
            seed: 0,
            bond_potential: None,
        }
    }
}

/// What one domain did during a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DomainReport {
    pub rank: usize,
    pub owned_atoms: usize,
    pub ghost_atoms: usize,
    pub statistics: ExchangeStatistics,
}

#[derive(Debug, Clone)]
pub struct RunResult {
    /// The final configuration, collected on the master and sorted by id.
    pub configuration: Configuration,
    pub counts: GlobalCounts,
    /// Total bond energy after the last step, if a bond potential was used.
    pub bond_energy: Option<f64>,
    /// One entry per rank, in rank order.
    pub domains: Vec<DomainReport>,
}

impl RunResult {
    /// Number of full exchanges, identical on every rank.
    pub fn exchanges(&self) -> u64 {
        self.domains
            .first()
            .map_or(0, |report| report.statistics.exchanges)
    }

    pub fn atoms_migrated(&self) -> u64 {
        self.domains
            .iter()
            .map(|report| report.statistics.atoms_migrated)
            .sum()
    }
}

struct DomainOutcome {
    report: DomainReport,
    bond_energy: f64,
    configuration: Option<Configuration>,
    counts: GlobalCounts,
}

/// Runs a decomposed random-walk simulation of `configuration`.
///
/// One thread is started per domain of `config.grid`, connected through an
/// in-process channel mesh. The configuration is distributed, stepped
/// `params.steps` times with full exchanges whenever an atom moves more than
/// half the skin, and collected back. Conservation is validated after every
/// full exchange, including the one that settles ownership before collection.
///
/// # Errors
///
/// The first root-cause error from any domain. Peers of a failed domain only
/// observe a disconnect, so disconnects are reported only when nothing more
/// specific is available.
#[instrument(skip_all, name = "run_workflow")]
pub fn run(
    configuration: &Configuration,
    config: &SimulationConfig,
    params: &RunParameters,
    reporter: &ProgressReporter,
) -> Result<RunResult, EngineError> {
    let n_procs = config.n_procs();
    info!(
        grid = ?config.grid,
        atoms = configuration.atoms.len(),
        steps = params.steps,
        "Starting decomposed run."
    );

    let endpoints = ChannelCommunicator::mesh(n_procs);
    let outcomes: Vec<Result<DomainOutcome, EngineError>> = thread::scope(|scope| {
        let handles: Vec<_> = endpoints
            .into_iter()
            .enumerate()
            .map(|(rank, comm)| {
                let input = (rank == 0).then_some(configuration);
                scope.spawn(move || run_domain(rank, comm, input, config, params, reporter))
            })
            .collect();
        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().unwrap_or_else(|_| {
                    Err(EngineError::Worker {
                        rank,
                        message: "domain thread panicked".into(),
                    })
                })
            })
            .collect()
    });

    let mut first_error: Option<EngineError> = None;
    let mut outcomes_ok = Vec::with_capacity(n_procs);
    for outcome in outcomes {
        match outcome {
            Ok(outcome) => outcomes_ok.push(outcome),
            Err(e) => {
                let replace = match &first_error {
                    None => true,
                    Some(existing) => existing.is_disconnect() && !e.is_disconnect(),
                };
                if replace {
                    first_error = Some(e);
                }
            }
        }
    }
    if let Some(e) = first_error {
        error!(error = %e, "Decomposed run failed.");
        return Err(e);
    }

    let mut collected = None;
    let mut counts = GlobalCounts::default();
    let mut energy = 0.0;
    let mut domains = Vec::with_capacity(n_procs);
    for outcome in outcomes_ok {
        if outcome.report.rank == 0 {
            collected = outcome.configuration;
            counts = outcome.counts;
        }
        energy += outcome.bond_energy;
        domains.push(outcome.report);
    }
    let configuration = collected
        .ok_or_else(|| EngineError::Internal("the master returned no configuration".into()))?;

    let result = RunResult {
        configuration,
        counts,
        bond_energy: params.bond_potential.map(|_| energy),
        domains,
    };
    info!(
        exchanges = result.exchanges(),
        migrated = result.atoms_migrated(),
        "Decomposed run finished."
    );
    Ok(result)
}

fn run_domain(
    rank: usize,
    comm: ChannelCommunicator,
    configuration: Option<&Configuration>,
    config: &SimulationConfig,
    params: &RunParameters,
    reporter: &ProgressReporter,
) -> Result<DomainOutcome, EngineError> {
    let result = drive_domain(rank, &comm, configuration, config, params, reporter);
    if let Err(e) = &result {
        if e.is_disconnect() {
            warn!(rank, error = %e, "Domain stopped after a peer failed.");
        } else {
            error!(rank, error = %e, "Domain failed.");
        }
    }
    result
}

fn drive_domain(
    rank: usize,
    comm: &ChannelCommunicator,
    configuration: Option<&Configuration>,
    config: &SimulationConfig,
    params: &RunParameters,
    reporter: &ProgressReporter,
) -> Result<DomainOutcome, EngineError> {
    let master = rank == 0;
    let report = |event: Progress| {
        if master {
            reporter.report(event);
        }
    };

    let domain = Domain::new(config.grid, rank, config.n_procs())?;
    let ctx = DomainContext::new(&domain, comm)?;
    let mut sim = DomainSimulation::new(ctx, config)?;

    report(Progress::PhaseStart {
        name: "Distribution",
    });
    let counts = sim.distribute(configuration)?;
    sim.exchange()?;
    sim.validate()?;
    report(Progress::PhaseFinish);

    sim.to_cartesian()?;
    let mut motion = RandomWalk::new(params.max_displacement, params.seed, rank);
    let mut bond_energy = 0.0;

    report(Progress::StepsStart {
        total_steps: params.steps,
    });
    for step in 1..=params.steps {
        let exchanged = sim.step(&mut motion)?;
        if exchanged {
            sim.validate()?;
        }
        if let Some(potential) = &params.bond_potential {
            bond_energy = sim.compute_forces(potential)?;
        }
        report(Progress::StepComplete { step, exchanged });
    }
    report(Progress::StepsFinish);

    report(Progress::PhaseStart { name: "Collection" });
    sim.exchange()?;
    sim.validate()?;
    let collected = sim.collect()?;
    report(Progress::PhaseFinish);

    Ok(DomainOutcome {
        report: DomainReport {
            rank,
            owned_atoms: sim.atoms().n_atoms(),
            ghost_atoms: sim.atoms().n_ghosts(),
            statistics: sim.statistics(),
        },
        bond_energy,
        configuration: collected,
        counts,
    })
}
