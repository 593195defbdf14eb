use std::{collections::HashMap, sync::atomic::Ordering};

use cosmo_tasks::{mark_tasks, Engine, TaskSubtype, TaskType};
use glam::DVec3;
use proptest::prelude::*;

mod common;

use common::{single_rank_engine, two_cell_positions, TWO_CELLS_CONFIG};

const TREE_CONFIG: &str = r###"
time_integration:
  time_end: 1.
  dt_min: 1e-10
  dt_max: 1e-2
scheduler:
  nr_threads: 2
  nr_queues: 2
domain:
  repartition: "none"
policy:
  hydro: true
  hydro_scheme: "three_loop"
space:
  periodic: true
  max_top_level_cells: 3
  split_size: 8
"###;

fn task_counts(engine: &Engine) -> HashMap<(TaskType, TaskSubtype), usize> {
    let mut counts = HashMap::new();
    for task in engine.scheduler().tasks.iter().filter(|t| t.ty != TaskType::None) {
        *counts.entry((task.ty, task.subtype)).or_insert(0) += 1;
    }
    counts
}

fn active_tasks(engine: &Engine) -> Vec<bool> {
    engine.scheduler().tasks.iter().map(|t| !t.is_skipped()).collect()
}

#[test]
fn test_two_cell_task_counts() {
    let mut engine = single_rank_engine(TWO_CELLS_CONFIG, DVec3::new(2., 1., 1.), &two_cell_positions());
    engine.init_particles();
    assert_eq!(engine.space().nr_cells, 2);
    assert!(engine.space().cells.iter().all(|c| !c.split));

    let counts = task_counts(&engine);
    let count = |ty, subtype| counts.get(&(ty, subtype)).copied().unwrap_or(0);
    assert_eq!(count(TaskType::SelfInteraction, TaskSubtype::Density), 2);
    assert_eq!(count(TaskType::Pair, TaskSubtype::Density), 1);
    assert_eq!(count(TaskType::SelfInteraction, TaskSubtype::Force), 2);
    assert_eq!(count(TaskType::Pair, TaskSubtype::Force), 1);
    assert_eq!(count(TaskType::SelfInteraction, TaskSubtype::Gradient), 0);
    assert_eq!(count(TaskType::SelfInteraction, TaskSubtype::Grav), 2);
    assert_eq!(count(TaskType::Pair, TaskSubtype::Grav), 1);
    assert_eq!(count(TaskType::GravMm, TaskSubtype::None), 2);
    for ty in [
        TaskType::Init,
        TaskType::Drift,
        TaskType::Kick1,
        TaskType::Kick2,
        TaskType::Timestep,
        TaskType::Ghost,
        TaskType::GravUp,
        TaskType::Sort,
    ] {
        assert_eq!(count(ty, TaskSubtype::None), 2, "{:?}", ty);
    }
    assert_eq!(count(TaskType::GravGatherM, TaskSubtype::None), 1);
    assert_eq!(count(TaskType::GravFft, TaskSubtype::None), 1);
    assert!(counts.keys().all(|(ty, _)| !matches!(ty, TaskType::Send | TaskType::Recv)));
    assert!(engine.proxies().is_empty());
    // Both hydro and gravity pairs take part in the rebuild check.
    let pairs: Vec<_> = engine.scheduler().tasks.iter().filter(|t| t.ty == TaskType::Pair).collect();
    assert_eq!(pairs.len(), 3);
    assert!(pairs.iter().all(|t| t.tight));
}

#[test]
fn test_rebuild_flag() {
    let mut engine = single_rank_engine(TWO_CELLS_CONFIG, DVec3::new(2., 1., 1.), &two_cell_positions());
    engine.init_particles();
    let ti_current = engine.ti_current();
    let cells = &engine.space().cells;

    // Activate both cells without moving anything.
    for cell in cells.iter() {
        cell.ti_end_min.store(ti_current, Ordering::Relaxed);
        cell.dx_max.store(0.);
    }
    assert!(!engine.marktasks());

    // Smoothing length growth plus drift beyond the cell separation.
    cells[0].h_max.store(cells[0].dmin * 0.9);
    cells[1].dx_max.store(cells[1].dmin * 0.2);
    assert!(engine.marktasks());

    // The pair still flags its growth when neither cell is active.
    for cell in cells.iter() {
        cell.ti_end_min.store(ti_current + 1000, Ordering::Relaxed);
    }
    assert!(engine.marktasks());

    cells[0].h_max.store(cells[0].dmin * 0.05);
    cells[1].dx_max.store(0.);
    assert!(!engine.marktasks());
}

#[test]
fn test_sorts_are_skipped_while_lists_are_valid() {
    let mut engine = single_rank_engine(TWO_CELLS_CONFIG, DVec3::new(2., 1., 1.), &two_cell_positions());
    engine.init_particles();
    let ti_current = engine.ti_current();
    let sched = engine.scheduler();
    let cells = &engine.space().cells;
    let Some(pair) = sched.tasks.iter().find(|t| t.ty == TaskType::Pair && t.subtype == TaskSubtype::Density) else {
        panic!("no density pair");
    };
    let bit = 1 << pair.flags();
    let sorts: Vec<_> = cells.iter().map(|c| c.tasks.sorts.unwrap()).collect();

    for cell in cells.iter() {
        cell.ti_end_min.store(ti_current, Ordering::Relaxed);
        cell.ti_old.store(ti_current, Ordering::Relaxed);
        cell.sorted.store(bit, Ordering::Relaxed);
    }
    engine.marktasks();
    assert!(sorts.iter().all(|&s| sched.tasks[s].is_skipped()));

    // A cell drifted since its last sort needs a new list.
    cells[1].ti_old.store(ti_current + 1, Ordering::Relaxed);
    engine.marktasks();
    assert!(sched.tasks[sorts[0]].is_skipped());
    assert!(!sched.tasks[sorts[1]].is_skipped());
    assert!(sched.tasks[sorts[1]].flags() & bit != 0);

    // Same for a cell that lost its list.
    cells[1].ti_old.store(ti_current, Ordering::Relaxed);
    cells[0].sorted.store(0, Ordering::Relaxed);
    engine.marktasks();
    assert!(!sched.tasks[sorts[0]].is_skipped());
    assert!(sched.tasks[sorts[1]].is_skipped());
}

#[test]
fn test_first_step_runs_every_marked_task_once() {
    let positions: Vec<DVec3> = (0..60)
        .map(|i| DVec3::new((i % 4) as f64 * 0.25 + 0.1, (i / 4 % 5) as f64 * 0.2 + 0.05, (i / 20) as f64 * 0.3 + 0.1))
        .collect();
    let mut engine = single_rank_engine(TREE_CONFIG, DVec3::ONE, &positions);
    engine.init_particles();

    let sched = engine.scheduler();
    let needs_rebuild = mark_tasks(engine.space(), sched, engine.links(), engine.ti_end_min(), 0);
    assert!(!needs_rebuild);
    let expected = active_tasks(&engine);
    assert!(expected.iter().any(|&active| active));
    let before: Vec<u32> = sched.tasks.iter().map(|t| t.executions.load(Ordering::Relaxed)).collect();

    engine.step();
    let sched = engine.scheduler();
    assert_eq!(sched.nr_tasks(), expected.len());
    for (tid, task) in sched.tasks.iter().enumerate() {
        let runs = task.executions.load(Ordering::Relaxed) - before[tid];
        assert_eq!(runs, u32::from(expected[tid]), "task {} ({})", tid, task.label());
        assert_eq!(task.wait.load(Ordering::Relaxed), 0);
        assert!(task.is_skipped());
    }
    assert_eq!(engine.step_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(12))]

    #[test]
    fn prop_task_graph_is_acyclic(positions in prop::collection::vec((0.0..1.0f64, 0.0..1.0f64, 0.0..1.0f64), 1..150)) {
        let positions: Vec<DVec3> = positions.into_iter().map(|(x, y, z)| DVec3::new(x, y, z)).collect();
        let mut engine = single_rank_engine(TREE_CONFIG, DVec3::ONE, &positions);
        engine.init_particles();

        let sched = engine.scheduler();
        prop_assert_eq!(sched.ranked().len(), sched.nr_tasks());
        for (tid, task) in sched.tasks.iter().enumerate() {
            for &succ in sched.unlocks(tid) {
                prop_assert!(task.rank < sched.tasks[succ].rank);
            }
        }
        // Each hierarchical task set lives on exactly one cell of every
        // branch holding particles.
        let cells = &engine.space().cells;
        for cell in cells.iter().filter(|c| c.count > 0) {
            let super_cell = cell.super_cell.expect("cell without super cell");
            prop_assert!(cells[super_cell].tasks.drift.is_some());
        }
    }

    #[test]
    fn prop_unskip_is_idempotent(positions in prop::collection::vec((0.0..1.0f64, 0.0..1.0f64, 0.0..1.0f64), 1..150)) {
        let positions: Vec<DVec3> = positions.into_iter().map(|(x, y, z)| DVec3::new(x, y, z)).collect();
        let mut engine = single_rank_engine(TREE_CONFIG, DVec3::ONE, &positions);
        engine.init_particles();

        let ti = engine.ti_end_min();
        let first = mark_tasks(engine.space(), engine.scheduler(), engine.links(), ti, 0);
        let active = active_tasks(&engine);
        let second = mark_tasks(engine.space(), engine.scheduler(), engine.links(), ti, 0);
        prop_assert_eq!(first, second);
        prop_assert_eq!(active, active_tasks(&engine));
    }
}
