use cosmo_tasks::{make_proxies, InitialConditions, Proxy, Space};
use glam::DVec3;
use proptest::prelude::*;
use yaml_rust::YamlLoader;

fn space(cdim: usize, assignment: &[usize]) -> Space {
    let cfg = format!("max_top_level_cells: {}\nperiodic: true", cdim);
    let cfg = &YamlLoader::load_from_str(&cfg).unwrap()[0];
    let ics = InitialConditions::from_positions(DVec3::ONE, &[DVec3::splat(0.5)], 1., 0.01, 1., false);
    let mut space = Space::from_ic(ics, cfg).unwrap();
    for (cell, &node) in space.cells.iter_mut().zip(assignment) {
        cell.node_id = node;
    }
    space
}

fn sendto_masks(space: &Space) -> Vec<u64> {
    space.cells[..space.nr_cells].iter().map(|c| c.sendto).collect()
}

fn lists(proxies: &[Proxy]) -> Vec<(usize, Vec<usize>, Vec<usize>)> {
    proxies
        .iter()
        .map(|p| (p.node_id, p.cells_in.clone(), p.cells_out.clone()))
        .collect()
}

proptest! {
    #[test]
    fn prop_proxies_are_deterministic_and_symmetric(assignment in prop::collection::vec(0..3usize, 64)) {
        let nr_nodes = 3;
        let mut per_rank = vec![];
        for rank in 0..nr_nodes {
            let mut first = space(4, &assignment);
            let mut second = space(4, &assignment);
            let proxies = make_proxies(&mut first, rank, nr_nodes);
            let again = make_proxies(&mut second, rank, nr_nodes);
            prop_assert_eq!(lists(&proxies), lists(&again));
            prop_assert_eq!(sendto_masks(&first), sendto_masks(&second));

            for (pid, proxy) in proxies.iter().enumerate() {
                prop_assert_ne!(proxy.node_id, rank);
                for &cid in proxy.cells_out.iter() {
                    prop_assert_eq!(first.cells[cid].node_id, rank);
                    prop_assert!(first.cells[cid].sendto & (1 << pid) != 0);
                }
                for &cid in proxy.cells_in.iter() {
                    prop_assert_eq!(first.cells[cid].node_id, proxy.node_id);
                }
            }
            per_rank.push(proxies);
        }

        // What one rank sends is exactly what the other one expects.
        for (rank, proxies) in per_rank.iter().enumerate() {
            for proxy in proxies {
                let Some(back) = per_rank[proxy.node_id].iter().find(|p| p.node_id == rank) else {
                    return Err(TestCaseError::fail("proxy without counterpart"));
                };
                prop_assert_eq!(&proxy.cells_out, &back.cells_in);
                prop_assert_eq!(&proxy.cells_in, &back.cells_out);
            }
        }
    }
}

#[test]
fn test_single_rank_has_no_proxies() {
    let mut space = space(3, &[0; 27]);
    assert!(make_proxies(&mut space, 0, 1).is_empty());
    assert!(sendto_masks(&space).iter().all(|&m| m == 0));
}
