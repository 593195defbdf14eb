use cosmo_tasks::part::check_links;

mod common;

use common::{on_ranks, RANDOM_BOX_CONFIG};

#[test]
fn test_initial_redistribution() {
    let results = on_ranks(RANDOM_BOX_CONFIG, 2, |mut engine| {
        engine.init_particles();
        let rank = engine.rank();
        let space = engine.space();
        let misplaced = space
            .parts
            .iter()
            .map(|p| p.x)
            .chain(space.gparts.iter().map(|g| g.x))
            .filter(|&x| space.cells[space.cell_index(x)].node_id != rank)
            .count();
        check_links(&space.parts, &space.gparts, &space.sparts).unwrap();
        (space.parts.len(), space.gparts.len(), misplaced)
    });

    let parts: usize = results.iter().map(|r| r.0).sum();
    let gparts: usize = results.iter().map(|r| r.1).sum();
    assert_eq!(parts, 1000);
    assert_eq!(gparts, 1000);
    for (nr_parts, _, misplaced) in results {
        assert_eq!(misplaced, 0);
        // The grid split balances the particle counts.
        assert!(nr_parts > 300 && nr_parts < 700, "{} particles", nr_parts);
    }
}

#[test]
fn test_steps_conserve_particles() {
    let results = on_ranks(RANDOM_BOX_CONFIG, 2, |mut engine| {
        for _ in 0..4 {
            engine.step();
        }
        let space = engine.space();
        check_links(&space.parts, &space.gparts, &space.sparts).unwrap();
        let mut ids: Vec<u64> = space.parts.iter().map(|p| p.id).collect();
        ids.sort_unstable();
        (engine.step_count(), engine.ti_current(), ids)
    });

    assert_eq!(results[0].0, 4);
    assert_eq!(results[0].1, results[1].1);
    assert!(results[0].1 > 0);
    let mut ids: Vec<u64> = results.into_iter().flat_map(|r| r.2).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..1000).collect::<Vec<u64>>());
}
