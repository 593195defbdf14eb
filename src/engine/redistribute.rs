//! Moving particles to the ranks owning their top-level cells.

use crate::{
    comm::{CommExt, Communicator, MsgContext},
    macros::fatal,
    part::{check_links, GPart, Part, ParticleBlock, SPart},
    partition::has_strays,
    proxy::{exchange_tag, Proxy},
    space::Space,
};

/// Growth margin of the particle arrays when particles arrive.
const REALLOC_MARGIN: f64 = 1.05;

/// Collective all-to-all move of every particle to the rank owning its
/// top-level cell. Particles arriving from each rank are appended in rank
/// order, keeping their relative order, with their partner links fixed up.
pub(super) fn redistribute(space: &mut Space, comm: &dyn Communicator) {
    let (rank, nr_nodes) = (comm.rank(), comm.size());
    space.wrap_particles();
    let destinations = space.destinations();
    let blocks = space.take_particles().split_by_destination(&destinations, nr_nodes);

    // counts[3 * (src * nr_nodes + dst) + species]
    let mut counts = vec![0u64; 3 * nr_nodes * nr_nodes];
    for (node, block) in blocks.iter().enumerate() {
        for (k, &n) in block.counts().iter().enumerate() {
            counts[3 * (rank * nr_nodes + node) + k] = n as u64;
        }
    }
    let counts = comm.all_reduce_sum(counts);
    let incoming = |src: usize| -> [usize; 3] {
        let base = 3 * (src * nr_nodes + rank);
        [counts[base] as usize, counts[base + 1] as usize, counts[base + 2] as usize]
    };

    let mut kept = None;
    for (node, block) in blocks.into_iter().enumerate() {
        if node == rank {
            kept = Some(block);
            continue;
        }
        let tag = |channel| exchange_tag(rank, node, nr_nodes, channel);
        comm.send_vec(node, MsgContext::Redistribute, tag(0), block.parts);
        comm.send_vec(node, MsgContext::Redistribute, tag(1), block.gparts);
        comm.send_vec(node, MsgContext::Redistribute, tag(2), block.sparts);
    }

    let mut total = [0usize; 3];
    for src in 0..nr_nodes {
        for (k, n) in incoming(src).iter().enumerate() {
            total[k] += n;
        }
    }
    let mut result = ParticleBlock::default();
    result.reserve_with_margin(total, REALLOC_MARGIN);
    for src in 0..nr_nodes {
        let block = if src == rank {
            kept.take().unwrap_or_default()
        } else {
            let tag = |channel| exchange_tag(src, rank, nr_nodes, channel);
            let parts: Vec<Part> = comm.recv_vec(src, MsgContext::Redistribute, tag(0));
            let gparts: Vec<GPart> = comm.recv_vec(src, MsgContext::Redistribute, tag(1));
            let sparts: Vec<SPart> = comm.recv_vec(src, MsgContext::Redistribute, tag(2));
            ParticleBlock { parts, gparts, sparts }
        };
        if block.counts() != incoming(src) {
            fatal!(
                "Received {:?} particles from rank {}, expected {:?}.",
                block.counts(),
                src,
                incoming(src)
            );
        }
        result.append(block);
    }

    tracing::info!(
        "[{:04}] Redistributed particles, now holding {:?}.",
        rank,
        result.counts()
    );
    space.set_particles(result);

    if cfg!(debug_assertions) {
        if let Err(e) = check_links(&space.parts, &space.gparts, &space.sparts) {
            fatal!("Broken particle links after redistribution: {}", e);
        }
        if has_strays(space, rank) {
            fatal!("Rank {} holds particles of foreign cells after redistribution.", rank);
        }
    }
}

/// Send the particles that left the local cells to the neighbouring ranks
/// now owning them and append the ones arriving from there.
pub(super) fn exchange_strays(space: &mut Space, proxies: &mut [Proxy], comm: &dyn Communicator) {
    let (rank, nr_nodes) = (comm.rank(), comm.size());
    space.wrap_particles();
    let destinations = space.destinations();
    let blocks = space.take_particles().split_by_destination(&destinations, nr_nodes);

    let mut local = ParticleBlock::default();
    let mut nr_strays = [0usize; 3];
    for (node, block) in blocks.into_iter().enumerate() {
        if node == rank {
            // Resolves the partner links of the particles that stay.
            local.append(block);
            continue;
        }
        if block.is_empty() {
            continue;
        }
        for (k, n) in block.counts().iter().enumerate() {
            nr_strays[k] += n;
        }
        match proxies.iter_mut().find(|p| p.node_id == node) {
            Some(proxy) => proxy.parts_load(block),
            None => fatal!(
                "Rank {} holds {:?} particles for rank {} which is not a neighbour.",
                rank,
                block.counts(),
                node
            ),
        }
    }

    for proxy in proxies.iter_mut() {
        proxy.send_parts(comm);
    }
    let received: Vec<ParticleBlock> = proxies.iter().map(|p| p.recv_parts(comm)).collect();

    let mut extra = [0usize; 3];
    for block in received.iter() {
        for (k, n) in block.counts().iter().enumerate() {
            extra[k] += n;
        }
    }
    local.reserve_with_margin(extra, REALLOC_MARGIN);
    for block in received {
        local.append(block);
    }
    tracing::debug!(
        "[{:04}] Sent {:?} stray particles, received {:?}.",
        rank,
        nr_strays,
        extra
    );
    space.set_particles(local);

    if cfg!(debug_assertions) {
        if let Err(e) = check_links(&space.parts, &space.gparts, &space.sparts) {
            fatal!("Broken particle links after the stray exchange: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    use glam::DVec3;
    use yaml_rust::YamlLoader;

    use super::*;
    use crate::{comm::LocalComm, initial_conditions::InitialConditions};

    fn space(positions: &[DVec3]) -> Space {
        let cfg = &YamlLoader::load_from_str("max_top_level_cells: 4\nperiodic: true").unwrap()[0];
        let ics = InitialConditions::from_positions(DVec3::ONE, positions, 1., 0.01, 1., true);
        Space::from_ic(ics, cfg).unwrap()
    }

    #[test]
    fn test_redistribute_two_ranks() {
        let world = LocalComm::world(2);
        let results: Vec<(usize, Vec<u64>)> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .into_iter()
                .map(|comm| {
                    s.spawn(move || {
                        let rank = comm.rank();
                        // Every rank starts with particles on both halves of the box.
                        let positions: Vec<DVec3> = (0..8)
                            .map(|i| DVec3::new(0.05 + 0.12 * i as f64, 0.3 + 0.1 * rank as f64, 0.5))
                            .collect();
                        let mut space = space(&positions);
                        for cid in 0..space.nr_cells {
                            space.cells[cid].node_id = usize::from(space.cell_coords(cid)[0] >= 2);
                        }
                        redistribute(&mut space, &comm);
                        assert!(space.parts.iter().all(|p| (p.x.x >= 0.5) == (rank == 1)));
                        check_links(&space.parts, &space.gparts, &space.sparts).unwrap();
                        (rank, space.parts.iter().map(|p| p.id).collect())
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        let total: usize = results.iter().map(|(_, ids)| ids.len()).sum();
        assert_eq!(total, 16);
        for (rank, ids) in results {
            assert_eq!(ids.len(), 8, "rank {}", rank);
        }
    }

    #[test]
    fn test_exchange_strays_single_rank_keeps_links() {
        let comm = LocalComm::world(1).pop().unwrap();
        let positions: Vec<DVec3> = (0..12).map(|i| DVec3::new(0.08 * i as f64 + 0.01, 0.2, 0.7)).collect();
        let mut space = space(&positions);
        // A particle that drifted out of the box comes back wrapped.
        space.parts[3].x.x += 1.;
        let gi = space.parts[3].gpart.unwrap();
        space.gparts[gi].x = space.parts[3].x;
        exchange_strays(&mut space, &mut [], &comm);

        assert_eq!(space.parts.len(), 12);
        assert_eq!(space.gparts.len(), 12);
        check_links(&space.parts, &space.gparts, &space.sparts).unwrap();
        assert!(space.parts.iter().all(|p| p.gpart.is_some()));
        assert!(space.parts.iter().all(|p| p.x.x >= 0. && p.x.x < 1.));
    }
}
