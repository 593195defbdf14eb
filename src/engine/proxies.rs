//! Proxies to the neighbouring ranks and the exchange of cell structure.

use std::collections::HashMap;

use crate::{
    cell::{CellId, PCell},
    comm::Communicator,
    macros::fatal,
    proxy::Proxy,
    space::{cell_getid, stencil, Space},
};

/// Create one proxy per rank owning a top-level cell adjacent to a local
/// one. Every local cell with a foreign neighbour gets the bit of that
/// proxy set in its `sendto` mask.
///
/// The cells are visited in grid order, so the same partition always yields
/// the same proxies, lists and masks.
pub fn make_proxies(space: &mut Space, rank: usize, nr_nodes: usize) -> Vec<Proxy> {
    let mut proxies: Vec<Proxy> = vec![];
    let mut proxy_index: Vec<Option<usize>> = vec![None; nr_nodes];

    let cdim = space.cdim;
    for i in 0..cdim[0] {
        for j in 0..cdim[1] {
            for k in 0..cdim[2] {
                let cid = cell_getid(cdim, i, j, k);
                if space.cells[cid].node_id != rank {
                    continue;
                }
                for offset in stencil() {
                    let Some(cjd) = space.neighbour(cid, offset) else {
                        continue;
                    };
                    let node = space.cells[cjd].node_id;
                    if node == rank {
                        continue;
                    }
                    let pid = *proxy_index[node].get_or_insert_with(|| {
                        proxies.push(Proxy::new(rank, node));
                        proxies.len() - 1
                    });
                    if pid >= 64 {
                        fatal!("Rank {} has more than 64 proxies.", rank);
                    }
                    proxies[pid].add_cell_in(cjd);
                    proxies[pid].add_cell_out(cid);
                }
            }
        }
    }

    for proxy in proxies.iter_mut() {
        proxy.finalize();
    }
    proxies.sort_by_key(|p| p.node_id);
    apply_sendto(space, &proxies);
    proxies
}

/// Recompute the `sendto` masks from the proxy lists, after the top-level
/// cells were reset.
fn apply_sendto(space: &mut Space, proxies: &[Proxy]) {
    for cid in 0..space.nr_cells {
        space.cells[cid].sendto = 0;
    }
    for (pid, proxy) in proxies.iter().enumerate() {
        for &cid in proxy.cells_out.iter() {
            space.cells[cid].sendto |= 1 << pid;
        }
    }
}

/// Send the structure of the local boundary cells to the neighbouring ranks
/// and graft the structure received from them onto the foreign cells.
///
/// Each local cell is packed once, so every rank receiving it sees the same
/// message tags.
pub(super) fn exchange_cells(space: &mut Space, proxies: &[Proxy], comm: &dyn Communicator) {
    apply_sendto(space, proxies);

    let mut out: Vec<CellId> = proxies.iter().flat_map(|p| p.cells_out.iter().copied()).collect();
    out.sort_unstable();
    out.dedup();
    let mut next_tag = 0u64;
    let mut packed: HashMap<CellId, Vec<PCell>> = HashMap::with_capacity(out.len());
    for cid in out {
        let mut pcells = vec![];
        space.pack_cell(cid, &mut pcells, &mut next_tag);
        packed.insert(cid, pcells);
    }

    for proxy in proxies.iter() {
        let pcells_out = proxy
            .cells_out
            .iter()
            .map(|cid| match packed.get(cid) {
                Some(pcells) => pcells.clone(),
                None => fatal!("Cell {} was not packed.", cid),
            })
            .collect();
        proxy.send_cells(comm, pcells_out);
    }

    let mut foreign = vec![];
    for proxy in proxies.iter() {
        let pcells_in = proxy.recv_cells(comm);
        for (&cid, pcells) in proxy.cells_in.iter().zip(pcells_in.iter()) {
            space.unpack_cell(cid, pcells, 0);
            foreign.push(cid);
        }
    }
    foreign.sort_unstable();
    space.allocate_foreign(&foreign);
    tracing::debug!(
        "Exchanged {} cell trees, {} foreign top-level cells.",
        packed.len(),
        foreign.len()
    );
}

#[cfg(test)]
mod test {
    use yaml_rust::YamlLoader;

    use rand::{rngs::StdRng, Rng, SeedableRng};

    use super::*;
    use crate::{comm::LocalComm, initial_conditions::InitialConditions};

    fn space(cdim: usize) -> Space {
        let cfg = format!("max_top_level_cells: {}\nperiodic: true", cdim);
        let cfg = &YamlLoader::load_from_str(&cfg).unwrap()[0];
        let ics = InitialConditions::from_positions(glam::DVec3::ONE, &[glam::DVec3::splat(0.5)], 1., 0.01, 1., false);
        Space::from_ic(ics, cfg).unwrap()
    }

    #[test]
    fn test_make_proxies_slab() {
        let mut space = space(4);
        // Two slabs along x.
        for cid in 0..space.nr_cells {
            space.cells[cid].node_id = usize::from(space.cell_coords(cid)[0] >= 2);
        }
        let proxies = make_proxies(&mut space, 0, 2);
        assert_eq!(proxies.len(), 1);
        let proxy = &proxies[0];
        assert_eq!(proxy.node_id, 1);
        // Both faces of the periodic slab touch the other rank.
        assert_eq!(proxy.cells_out.len(), 32);
        assert_eq!(proxy.cells_in.len(), 32);
        for cid in 0..space.nr_cells {
            let boundary = space.cells[cid].node_id == 0;
            assert_eq!(space.cells[cid].sendto, u64::from(boundary));
        }
    }

    /// Tags of the subtree of `cid`, depth first.
    fn subtree_tags(space: &Space, cid: CellId, out: &mut Vec<u64>) {
        out.push(space.cells[cid].tag);
        for child in space.cells[cid].progeny_ids() {
            subtree_tags(space, child, out);
        }
    }

    /// Rebuild the local cells of a two-slab split of the box and exchange
    /// the boundary trees, returning the tags of every top-level tree.
    fn slab_tags(space: &mut Space, proxies: &[Proxy], comm: &LocalComm) -> Vec<Vec<u64>> {
        space.rebuild(comm.rank(), 1, 0);
        exchange_cells(space, proxies, comm);
        (0..space.nr_cells)
            .map(|cid| {
                let mut tags = vec![];
                subtree_tags(space, cid, &mut tags);
                tags
            })
            .collect()
    }

    #[test]
    fn test_cell_tags_are_deterministic_and_shared() {
        let world = LocalComm::world(2);
        let results: Vec<(Vec<Vec<u64>>, Vec<Proxy>, Vec<usize>)> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let rank = comm.rank();
                        let mut rng = StdRng::seed_from_u64(11);
                        let positions: Vec<glam::DVec3> = (0..2000)
                            .map(|_| glam::DVec3::new(rng.gen(), rng.gen(), rng.gen()))
                            .filter(|x: &glam::DVec3| (x.x >= 0.5) == (rank == 1))
                            .collect();
                        let cfg = "max_top_level_cells: 4\nperiodic: true\nsplit_size: 8";
                        let cfg = &YamlLoader::load_from_str(cfg).unwrap()[0];
                        let ics = InitialConditions::from_positions(glam::DVec3::ONE, &positions, 1., 0.01, 1., false);
                        let mut space = Space::from_ic(ics, cfg).unwrap();
                        for cid in 0..space.nr_cells {
                            space.cells[cid].node_id = usize::from(space.cell_coords(cid)[0] >= 2);
                        }
                        let proxies = make_proxies(&mut space, rank, 2);

                        let first = slab_tags(&mut space, &proxies, &comm);
                        let second = slab_tags(&mut space, &proxies, &comm);
                        assert_eq!(first, second);
                        let nodes = (0..space.nr_cells).map(|cid| space.cells[cid].node_id).collect();
                        (first, proxies, nodes)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let mut compared = 0;
        for (rank, (tags, proxies, nodes)) in results.iter().enumerate() {
            for proxy in proxies {
                let (sender_tags, _, _) = &results[proxy.node_id];
                for &cid in proxy.cells_in.iter() {
                    assert_ne!(nodes[cid], rank);
                    // The receiver rebuilt the sender's tree with its tags.
                    assert_eq!(tags[cid], sender_tags[cid]);
                    compared += usize::from(tags[cid].len() > 1);
                }
            }
        }
        assert!(compared > 0, "no split boundary cell was exchanged");
    }
}
