#![allow(dead_code)]

use cosmo_tasks::{Communicator, Engine, EngineConfig, InitialConditions, LocalComm, NullPhysics, SphPhysics};
use glam::DVec3;

/// Two top-level cells side by side in a non-periodic box, with hydro and
/// self gravity.
pub const TWO_CELLS_CONFIG: &str = r###"
time_integration:
  time_end: 1.
  dt_min: 1e-10
  dt_max: 1e-2
scheduler:
  nr_threads: 2
domain:
  repartition: "none"
policy:
  hydro: true
  self_gravity: true
space:
  periodic: false
  max_top_level_cells: [2, 1, 1]
"###;

/// Periodic unit box with random gas particles and gravity partners.
pub const RANDOM_BOX_CONFIG: &str = r###"
time_integration:
  time_end: 1.
  dt_min: 1e-10
  dt_max: 1e-2
scheduler:
  nr_threads: 2
  reweight_frequency: 3
domain:
  repartition: "particle_counts"
policy:
  hydro: true
space:
  periodic: true
  max_top_level_cells: 4
initial_conditions:
  type: "random"
  box_size: [1., 1., 1.]
  num_part: 1000
  smoothing_length: 0.05
  gravity: true
  seed: 7
physics:
  kernel: "cubic_spline"
"###;

pub fn config(source: &str) -> EngineConfig {
    EngineConfig::load_from_str(source).unwrap()
}

/// Ten particles in each of the two cells of [`TWO_CELLS_CONFIG`].
pub fn two_cell_positions() -> Vec<DVec3> {
    (0..20)
        .map(|i| {
            let offset = if i < 10 { 0.1 } else { 1.1 };
            DVec3::new(offset + 0.08 * (i % 10) as f64, 0.5, 0.5)
        })
        .collect()
}

/// A single-rank engine with null physics over gas particles with gravity
/// partners at `positions`.
pub fn single_rank_engine(source: &str, box_size: DVec3, positions: &[DVec3]) -> Engine {
    let config = config(source);
    let ics = InitialConditions::from_positions(box_size, positions, 1., 0.05, 1., true);
    let comm = LocalComm::world(1).pop().unwrap();
    Engine::new(config, ics, Box::new(NullPhysics), Box::new(comm)).unwrap()
}

/// Run `body` on one engine per rank, each on its own thread.
pub fn on_ranks<T: Send>(source: &str, nr_ranks: usize, body: impl Fn(Engine) -> T + Sync) -> Vec<T> {
    let config = config(source);
    std::thread::scope(|s| {
        let handles: Vec<_> = LocalComm::world(nr_ranks)
            .into_iter()
            .map(|comm| {
                let config = config.clone();
                let body = &body;
                s.spawn(move || {
                    assert!(comm.rank() < nr_ranks);
                    let ics = InitialConditions::new(&config.initial_conditions).unwrap();
                    let physics = SphPhysics::parse(&config.physics).unwrap();
                    body(Engine::new(config, ics, Box::new(physics), Box::new(comm)).unwrap())
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}
