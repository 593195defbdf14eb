//! The engine owns the space, the task graph and the runners of one rank,
//! and drives the time integration of the whole run.

use std::{sync::atomic::Ordering, time::Instant};

use rayon::prelude::*;

use crate::{
    cell::{Cell, CellId},
    comm::{CommExt, Communicator},
    config::EngineConfig,
    errors::ConfigError,
    initial_conditions::InitialConditions,
    io::{Snapshot, SnapshotWriter, TextSnapshotWriter},
    link::LinkTable,
    macros::{fatal, timed},
    partition::{cells_per_node, GridPartitioner, Partitioner, RepartitionKind},
    physics::{Physics, StepInfo},
    proxy::Proxy,
    runner::{hierarchical, runner_main, RunnerContext, RunnerPool},
    scheduler::Scheduler,
    space::Space,
    statistics::{Statistics, StatisticsLog},
    task::TASK_TYPE_COUNT,
    timeline::{IntegerTime, TimeLine, MAX_NR_TIMESTEPS},
};

mod maketasks;
mod marktasks;
mod proxies;
mod redistribute;

pub use marktasks::{mark_tasks, needs_rebuild, skip_drift_and_kick2, skip_force_and_kick};
pub use proxies::make_proxies;

pub struct Engine {
    config: EngineConfig,
    space: Space,
    sched: Scheduler,
    links: LinkTable,
    proxies: Vec<Proxy>,
    physics: Box<dyn Physics>,
    comm: Box<dyn Communicator>,
    partitioner: Box<dyn Partitioner>,
    writer: Box<dyn SnapshotWriter>,
    pool: RunnerPool,
    timeline: TimeLine,
    rank: usize,
    nr_nodes: usize,
    ti_current: IntegerTime,
    /// Earliest end of step over all ranks, the target of the next step.
    ti_end_min: IntegerTime,
    step: usize,
    /// Particles of each species updated in the last step, over all ranks.
    updates: [u64; 3],
    total_counts: [u64; 3],
    forcerebuild: bool,
    forcerepart: bool,
    /// The particles were redistributed since the last rebuild, so the cell
    /// offsets no longer match the particle arrays.
    cells_stale: bool,
    initialised: bool,
    /// Wall-clock seconds of the last launch, for the imbalance check.
    launch_time: f64,
    snapshot_index: usize,
    ti_next_snapshot: Option<IntegerTime>,
    stats_index: usize,
    ti_next_stats: Option<IntegerTime>,
    stats_log: Option<StatisticsLog>,
}

impl Engine {
    /// Set up an engine for the rank of `comm`. Every rank passes the full
    /// initial conditions and keeps its share of them.
    pub fn new(
        config: EngineConfig,
        initial_conditions: InitialConditions,
        physics: Box<dyn Physics>,
        comm: Box<dyn Communicator>,
    ) -> Result<Self, ConfigError> {
        let (rank, nr_nodes) = (comm.rank(), comm.size());
        let mut space = Space::from_ic(initial_conditions, &config.space)?;
        if nr_nodes > 1 {
            let block = space.take_particles();
            let share = InitialConditions::from_block(space.dim, block).into_rank_share(rank, nr_nodes);
            space.set_particles(share.into_block());
        }

        let timeline = TimeLine::new(config.time_integration.time_begin, config.time_integration.time_end);
        let sched = Scheduler::new(config.scheduler.nr_queues, config.scheduler.steal);
        let pool = RunnerPool::new(config.scheduler.nr_threads, rank);
        let writer = Box::new(TextSnapshotWriter::new(config.snapshots.basename.clone()));
        let stats_log = (rank == 0 && config.statistics.delta_time.is_some())
            .then(|| StatisticsLog::new(&config.statistics.basename));
        tracing::info!(
            "[{:04}] Engine set up with {} runners and {} queues over {} top-level cells.",
            rank,
            config.scheduler.nr_threads,
            config.scheduler.nr_queues,
            space.nr_cells
        );

        let mut engine = Self {
            config,
            space,
            sched,
            links: LinkTable::new(0),
            proxies: vec![],
            physics,
            comm,
            partitioner: Box::new(GridPartitioner),
            writer,
            pool,
            timeline,
            rank,
            nr_nodes,
            ti_current: 0,
            ti_end_min: 0,
            step: 0,
            updates: [0; 3],
            total_counts: [0; 3],
            forcerebuild: false,
            forcerepart: false,
            cells_stale: false,
            initialised: false,
            launch_time: 0.,
            snapshot_index: 0,
            ti_next_snapshot: None,
            stats_index: 0,
            ti_next_stats: None,
            stats_log,
        };
        engine.ti_next_snapshot = engine.snapshot_tick(0);
        engine.ti_next_stats = engine.stats_tick(0);
        Ok(engine)
    }

    pub fn with_partitioner(mut self, partitioner: Box<dyn Partitioner>) -> Self {
        self.partitioner = partitioner;
        self
    }

    pub fn with_snapshot_writer(mut self, writer: Box<dyn SnapshotWriter>) -> Self {
        self.writer = writer;
        self
    }

    pub fn space(&self) -> &Space {
        &self.space
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn links(&self) -> &LinkTable {
        &self.links
    }

    pub fn proxies(&self) -> &[Proxy] {
        &self.proxies
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn ti_current(&self) -> IntegerTime {
        self.ti_current
    }

    pub fn ti_end_min(&self) -> IntegerTime {
        self.ti_end_min
    }

    pub fn time(&self) -> f64 {
        self.timeline.time(self.ti_current)
    }

    pub fn step_count(&self) -> usize {
        self.step
    }

    /// Particles of each species updated in the last step, over all ranks.
    pub fn updates(&self) -> [u64; 3] {
        self.updates
    }

    pub fn is_done(&self) -> bool {
        self.ti_current >= MAX_NR_TIMESTEPS
    }

    pub fn print_task_counts(&self) -> [usize; TASK_TYPE_COUNT] {
        self.sched.print_task_counts(self.rank)
    }

    fn step_info(&self, ti_current: IntegerTime) -> StepInfo {
        StepInfo {
            ti_current,
            timeline: self.timeline,
            rank: self.rank,
        }
    }

    fn output_tick(&self, time_first: f64, delta_time: Option<f64>, index: usize) -> Option<IntegerTime> {
        let time = time_first + index as f64 * delta_time?;
        (time < self.timeline.time_end).then(|| self.timeline.integer_time(time))
    }

    fn snapshot_tick(&self, index: usize) -> Option<IntegerTime> {
        let cfg = &self.config.snapshots;
        let first = cfg.time_first.unwrap_or(self.timeline.time_begin);
        self.output_tick(first, cfg.delta_time, index)
    }

    fn stats_tick(&self, index: usize) -> Option<IntegerTime> {
        self.output_tick(self.timeline.time_begin, self.config.statistics.delta_time, index)
    }

    /// Initial domain decomposition: assign the top-level cells and move the
    /// particles to their owners.
    fn decompose(&mut self) {
        let assignment = self.partitioner.initial(&self.space, self.comm.as_ref());
        self.apply_partition(&assignment);
        if self.nr_nodes > 1 {
            timed!(
                "Redistribution",
                redistribute::redistribute(&mut self.space, self.comm.as_ref())
            );
        }
        // No hierarchy has been built over the particles yet.
        self.cells_stale = true;
    }

    fn apply_partition(&mut self, assignment: &[usize]) {
        for (cell, &node) in self.space.cells.iter_mut().zip(assignment) {
            cell.node_id = node;
        }
        self.proxies = make_proxies(&mut self.space, self.rank, self.nr_nodes);
        tracing::info!(
            "[{:04}] Top-level cells per rank: {:?}, {} proxies.",
            self.rank,
            cells_per_node(assignment, self.nr_nodes),
            self.proxies.len()
        );
    }

    /// Run every unskipped task of the graph once.
    fn launch(&mut self) {
        let tic = Instant::now();
        let info = self.step_info(self.ti_current);
        let dt_bounds = (self.config.time_integration.dt_min, self.config.time_integration.dt_max);
        let nr_queues = self.sched.nr_queues();
        self.sched.start();
        {
            let ctx = RunnerContext::new(
                &self.sched,
                &mut self.space,
                self.physics.as_ref(),
                self.comm.as_ref(),
                info,
                dt_bounds,
            );
            self.pool.launch(&|id| runner_main(&ctx, id % nr_queues));
        }
        self.launch_time = tic.elapsed().as_secs_f64();
        tracing::debug!("[{:04}] Launch took {:.3} ms.", self.rank, self.launch_time * 1e3);
    }

    /// Decide which tasks run at the current time. Returns whether the cells
    /// have moved too far for the task graph to stay valid.
    pub fn marktasks(&self) -> bool {
        mark_tasks(&self.space, &self.sched, &self.links, self.ti_current, self.rank)
    }

    /// Bring every local particle to `ti`, outside of any launch.
    pub fn drift_all(&mut self, ti: IntegerTime) {
        let roots = drift_roots(&self.space, self.rank);
        let info = self.step_info(ti);
        let dt_bounds = (self.config.time_integration.dt_min, self.config.time_integration.dt_max);
        let ctx = RunnerContext::new(
            &self.sched,
            &mut self.space,
            self.physics.as_ref(),
            self.comm.as_ref(),
            info,
            dt_bounds,
        );
        // SAFETY: the roots are disjoint subtrees and no launch is running.
        roots.par_iter().for_each(|&cid| unsafe { hierarchical::drift(&ctx, cid) });
    }

    /// Rebuild the cells and the task graph around the current particle
    /// positions.
    pub fn rebuild(&mut self) {
        let tic = Instant::now();
        if !self.cells_stale {
            self.drift_all(self.ti_current);
        }
        timed!(
            "Stray exchange",
            redistribute::exchange_strays(&mut self.space, &mut self.proxies, self.comm.as_ref())
        );
        timed!(
            "Space rebuild",
            self.space.rebuild(self.rank, self.sched.nr_queues(), self.ti_current)
        );
        self.cells_stale = false;
        timed!(
            "Cell exchange",
            proxies::exchange_cells(&mut self.space, &self.proxies, self.comm.as_ref())
        );
        timed!("Task construction", self.maketasks());
        if self.marktasks() {
            tracing::warn!("[{:04}] Cells still need a rebuild right after rebuilding.", self.rank);
        }
        self.forcerebuild = false;

        let counts = self.space.nr_particles().iter().map(|&n| n as u64).collect();
        let totals = self.comm.all_reduce_sum(counts);
        self.total_counts = [totals[0], totals[1], totals[2]];
        self.print_task_counts();
        tracing::info!(
            "[{:04}] Rebuild took {:.3} ms.",
            self.rank,
            tic.elapsed().as_secs_f64() * 1e3
        );
    }

    /// Move the top-level cells between ranks according to the partitioner.
    pub fn repartition(&mut self) {
        let kind = match self.config.domain.repartition {
            RepartitionKind::None => RepartitionKind::ParticleCounts,
            kind => kind,
        };
        let assignment = self
            .partitioner
            .repartition(kind, &self.space, &self.sched, self.comm.as_ref());
        self.apply_partition(&assignment);
        redistribute::redistribute(&mut self.space, self.comm.as_ref());
        self.cells_stale = true;
        self.forcerebuild = true;
        self.forcerepart = false;
    }

    /// Earliest end of step over all ranks and the update counts of the last
    /// launch.
    fn collect_timestep(&mut self) {
        let cells = &self.space.cells;
        let mut ti_end_min = MAX_NR_TIMESTEPS;
        let mut updates = [0u64; 3];
        for cid in 0..self.space.nr_cells {
            if cells[cid].node_id != self.rank {
                continue;
            }
            let (min, _) = reduce_times(cells, cid);
            ti_end_min = ti_end_min.min(min);
            collect_updates(cells, cid, &mut updates);
        }
        self.ti_end_min = self.comm.all_reduce_min(ti_end_min);
        let totals = self.comm.all_reduce_sum(updates.to_vec());
        self.updates = [totals[0], totals[1], totals[2]];
    }

    /// Compute the particle densities and the first time-steps.
    pub fn init_particles(&mut self) {
        let tic = Instant::now();
        self.decompose();
        self.ti_current = 0;
        self.rebuild();

        skip_force_and_kick(&self.sched);
        self.launch();
        self.marktasks();
        skip_drift_and_kick2(&self.sched);
        self.launch();

        self.collect_timestep();
        self.initialised = true;
        tracing::info!(
            "[{:04}] Initialisation took {:.3} ms, first step ends at t={:.6e}.",
            self.rank,
            tic.elapsed().as_secs_f64() * 1e3,
            self.timeline.time(self.ti_end_min)
        );
    }

    /// Raise `forcerepart` on every rank if the last step updated a whole
    /// species and the runtimes of the ranks diverged too much.
    fn check_imbalance(&mut self) {
        let times = self.comm.all_gather(self.launch_time);
        let all_updated = (0..3).any(|k| self.total_counts[k] > 0 && self.updates[k] == self.total_counts[k]);
        let (min, max) = times
            .iter()
            .fold((f64::MAX, 0f64), |(lo, hi), &t| (lo.min(t), hi.max(t)));
        let imbalanced = all_updated && max > 0. && (max - min) / max > self.config.domain.fractional_time;
        self.forcerepart = self.comm.broadcast(0, imbalanced);
        if self.forcerepart {
            tracing::info!(
                "[{:04}] Launch times between {:.3} and {:.3} ms, repartitioning.",
                self.rank,
                min * 1e3,
                max * 1e3
            );
        }
    }

    /// Advance the system by one step, to the earliest end of step.
    pub fn step(&mut self) {
        if !self.initialised {
            self.init_particles();
        }
        let tic = Instant::now();

        if self.nr_nodes > 1 && self.config.domain.repartition != RepartitionKind::None {
            self.check_imbalance();
        }

        while let Some(ti_snap) = self.ti_next_snapshot {
            if ti_snap > self.ti_end_min {
                break;
            }
            self.drift_all(ti_snap);
            self.write_snapshot(ti_snap);
        }

        self.ti_current = self.ti_end_min;
        self.step += 1;

        if self.forcerepart || self.config.policy.drift_all {
            self.drift_all(self.ti_current);
        }
        if self.forcerepart {
            self.repartition();
        }

        if !self.forcerebuild {
            self.forcerebuild = self.marktasks();
        }
        let rebuild_frequency = self.config.domain.rebuild_frequency;
        if rebuild_frequency > 0 && self.step % rebuild_frequency == 0 {
            self.forcerebuild = true;
        }
        if self.comm.all_reduce_or(self.forcerebuild) {
            self.rebuild();
        } else {
            let reweight_frequency = self.config.scheduler.reweight_frequency;
            if reweight_frequency > 0 && self.step % reweight_frequency == 0 {
                self.sched.rank_tasks();
                self.sched.reweight(&self.space.cells);
            }
        }

        self.launch();
        self.collect_timestep();
        self.report_statistics();

        tracing::info!(
            "[{:04}] Step {:6} t={:.6e} dt={:.6e} updates=[{} {} {}] took {:.3} ms",
            self.rank,
            self.step,
            self.time(),
            self.timeline.time(self.ti_end_min) - self.time(),
            self.updates[0],
            self.updates[1],
            self.updates[2],
            tic.elapsed().as_secs_f64() * 1e3
        );
    }

    /// Integrate until the end of the timeline and write a final snapshot.
    pub fn run(&mut self) {
        if !self.initialised {
            self.init_particles();
        }
        while !self.is_done() {
            self.step();
        }
        self.drift_all(self.ti_current);
        self.write_snapshot(self.ti_current);
        tracing::info!("[{:04}] Done after {} steps.", self.rank, self.step);
    }

    fn write_snapshot(&mut self, ti: IntegerTime) {
        let snapshot = Snapshot {
            index: self.snapshot_index,
            time: self.timeline.time(ti),
            parts: &self.space.parts,
            gparts: &self.space.gparts,
            sparts: &self.space.sparts,
        };
        if let Err(e) = self.writer.write(&snapshot, self.rank, self.nr_nodes) {
            fatal!("Failed to write snapshot {}: {}", self.snapshot_index, e);
        }
        self.snapshot_index += 1;
        self.ti_next_snapshot = self.snapshot_tick(self.snapshot_index);
    }

    fn report_statistics(&mut self) {
        while let Some(ti) = self.ti_next_stats {
            if ti > self.ti_current {
                break;
            }
            let stats = Statistics::collect(&self.space.parts, &self.space.gparts, &self.space.sparts)
                .all_reduce(self.comm.as_ref());
            if let Some(log) = self.stats_log.as_mut() {
                if let Err(e) = log.append(self.step, self.timeline.time(self.ti_current), &stats) {
                    fatal!("Failed to write statistics: {}", e);
                }
            }
            self.stats_index += 1;
            self.ti_next_stats = self.stats_tick(self.stats_index);
        }
    }
}

/// Cells whose subtrees share one drift state: the super cells, or the
/// leaves before any task graph exists.
fn drift_roots(space: &Space, rank: usize) -> Vec<CellId> {
    fn collect(space: &Space, cid: CellId, out: &mut Vec<CellId>) {
        let cell = &space.cells[cid];
        if cell.super_cell == Some(cid) || !cell.split {
            out.push(cid);
        } else {
            for child in cell.progeny_ids() {
                collect(space, child, out);
            }
        }
    }
    let mut roots = vec![];
    for cid in space.local_top_cells(rank) {
        collect(space, cid, &mut roots);
    }
    roots
}

/// Recompute the end-of-step bounds of split cells from their leaves, which
/// the timestep tasks keep up to date.
fn reduce_times(cells: &[Cell], cid: CellId) -> (IntegerTime, IntegerTime) {
    let cell = &cells[cid];
    if !cell.split {
        return (
            cell.ti_end_min.load(Ordering::Acquire),
            cell.ti_end_max.load(Ordering::Acquire),
        );
    }
    let (mut min, mut max) = (MAX_NR_TIMESTEPS, 0);
    for child in cell.progeny_ids() {
        let (cmin, cmax) = reduce_times(cells, child);
        min = min.min(cmin);
        max = max.max(cmax);
    }
    cell.ti_end_min.store(min, Ordering::Release);
    cell.ti_end_max.store(max, Ordering::Release);
    (min, max)
}

fn collect_updates(cells: &[Cell], cid: CellId, updates: &mut [u64; 3]) {
    let cell = &cells[cid];
    updates[0] += cell.updated.swap(0, Ordering::AcqRel) as u64;
    updates[1] += cell.g_updated.swap(0, Ordering::AcqRel) as u64;
    updates[2] += cell.s_updated.swap(0, Ordering::AcqRel) as u64;
    for child in cell.progeny_ids() {
        collect_updates(cells, child, updates);
    }
}
