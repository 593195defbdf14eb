use std::{error::Error, path};

use clap::Parser;
use cosmo_tasks::{Communicator, Engine, EngineConfig, InitialConditions, SphPhysics};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
pub struct Cli {
    /// The path to the config file to read
    #[clap(parse(from_os_str))]
    pub config: path::PathBuf,
    /// The number of ranks to decompose the simulation over. Under MPI the
    /// ranks are the processes started by `mpirun` instead.
    #[clap(long, default_value_t = 1)]
    pub ranks: usize,
}

fn run_rank(config: EngineConfig, comm: Box<dyn Communicator>) -> Result<(), Box<dyn Error + Send + Sync>> {
    let ics = InitialConditions::new(&config.initial_conditions)?;
    let physics = SphPhysics::parse(&config.physics)?;
    let mut engine = Engine::new(config, ics, Box::new(physics), comm)?;
    engine.run();
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    // A fatal error on any rank ends the whole run.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        std::process::abort();
    }));

    // parse command line parameters
    let args = Cli::parse();
    let config = EngineConfig::from_file(&args.config)?;
    if args.ranks == 0 {
        return Err("At least one rank is needed".into());
    }

    launch(config, args.ranks)?;

    println!("Done!");
    Ok(())
}

/// One process per rank, started by `mpirun`.
#[cfg(feature = "mpi")]
fn launch(config: EngineConfig, ranks: usize) -> Result<(), Box<dyn Error>> {
    if ranks > 1 {
        return Err("With MPI, start one process per rank with mpirun instead of passing --ranks".into());
    }
    let comm = cosmo_tasks::MpiComm::init()?;
    let rank = comm.rank();
    let _span = tracing::info_span!("rank", rank).entered();
    run_rank(config, Box::new(comm)).map_err(|e| -> Box<dyn Error> { e })
}

/// One thread per rank, each driving its own engine.
#[cfg(not(feature = "mpi"))]
fn launch(config: EngineConfig, ranks: usize) -> Result<(), Box<dyn Error>> {
    let handles: Vec<_> = cosmo_tasks::LocalComm::world(ranks)
        .into_iter()
        .enumerate()
        .map(|(rank, comm)| {
            let config = config.clone();
            std::thread::Builder::new()
                .name(format!("rank-{rank}"))
                .spawn(move || {
                    let _span = tracing::info_span!("rank", rank).entered();
                    run_rank(config, Box::new(comm))
                })
        })
        .collect::<Result<_, _>>()?;

    for handle in handles {
        match handle.join() {
            Ok(result) => result.map_err(|e| -> Box<dyn Error> { e })?,
            Err(_) => return Err("A rank panicked".into()),
        }
    }
    Ok(())
}
