//! Assignment of the top-level cells to ranks.

use rayon::prelude::*;

use crate::{
    cell::CellId,
    comm::{CommExt, Communicator},
    scheduler::Scheduler,
    space::Space,
};

/// What the weights of a repartition are derived from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepartitionKind {
    None,
    ParticleCounts,
    TaskCosts,
}

/// Maps every top-level cell to its owning rank. All ranks call both
/// methods collectively and get the same answer.
pub trait Partitioner: Send + Sync {
    /// Partition for the particles as initially read.
    fn initial(&self, space: &Space, comm: &dyn Communicator) -> Vec<usize>;

    /// New partition from the state of the previous steps.
    fn repartition(&self, kind: RepartitionKind, space: &Space, sched: &Scheduler, comm: &dyn Communicator) -> Vec<usize>;
}

/// Split the top-level cells in grid order into contiguous runs of roughly
/// equal weight.
#[derive(Debug, Clone, Copy, Default)]
pub struct GridPartitioner;

fn particle_weights(space: &Space) -> Vec<u64> {
    let mut weights = vec![0u64; space.nr_cells];
    let cells: Vec<CellId> = space
        .parts
        .par_iter()
        .map(|p| space.cell_index(p.x))
        .chain(space.gparts.par_iter().map(|g| space.cell_index(g.x)))
        .chain(space.sparts.par_iter().map(|s| space.cell_index(s.x)))
        .collect();
    for cid in cells {
        weights[cid] += 1;
    }
    weights
}

fn top_level_ancestor(space: &Space, mut cid: CellId) -> CellId {
    while let Some(parent) = space.cells[cid].parent {
        cid = parent;
    }
    cid
}

fn task_weights(space: &Space, sched: &Scheduler) -> Vec<u64> {
    let mut weights = vec![0u64; space.nr_cells];
    for task in sched.tasks.iter() {
        let Some(ci) = task.ci else {
            continue;
        };
        let top = top_level_ancestor(space, ci);
        // Split the cost of pairs between both cells.
        match task.cj.map(|cj| top_level_ancestor(space, cj)) {
            Some(tj) => {
                weights[top] += task.cost.max(0) as u64 / 2;
                weights[tj] += task.cost.max(0) as u64 / 2;
            }
            None => weights[top] += task.cost.max(0) as u64,
        }
    }
    weights
}

/// Contiguous split of `weights` (in cell order) into `nr_nodes` runs.
pub fn split_weights(weights: &[u64], nr_nodes: usize) -> Vec<usize> {
    let nr_nodes = nr_nodes.max(1);
    let total: u64 = weights.iter().sum();
    if total == 0 {
        return (0..weights.len()).map(|c| c * nr_nodes / weights.len().max(1)).collect();
    }
    let mut before = 0u64;
    weights
        .iter()
        .map(|&w| {
            // Place every cell by the centre of its weight interval.
            let centre = before as f64 + 0.5 * w as f64;
            before += w;
            ((centre * nr_nodes as f64 / total as f64) as usize).min(nr_nodes - 1)
        })
        .collect()
}

impl Partitioner for GridPartitioner {
    fn initial(&self, space: &Space, comm: &dyn Communicator) -> Vec<usize> {
        let weights = comm.all_reduce_sum(particle_weights(space));
        split_weights(&weights, comm.size())
    }

    fn repartition(&self, kind: RepartitionKind, space: &Space, sched: &Scheduler, comm: &dyn Communicator) -> Vec<usize> {
        let current = || (0..space.nr_cells).map(|c| space.cells[c].node_id).collect();
        let weights = match kind {
            RepartitionKind::None => return current(),
            RepartitionKind::ParticleCounts => particle_weights(space),
            RepartitionKind::TaskCosts => task_weights(space, sched),
        };
        let weights = comm.all_reduce_sum(weights);
        if weights.iter().all(|&w| w == 0) {
            tracing::warn!("All repartition weights are zero, keeping the current partition.");
            return current();
        }
        split_weights(&weights, comm.size())
    }
}

/// Number of top-level cells per rank, for logging.
pub fn cells_per_node(assignment: &[usize], nr_nodes: usize) -> Vec<usize> {
    let mut counts = vec![0; nr_nodes];
    for &node in assignment {
        counts[node] += 1;
    }
    counts
}

/// Whether a space has particles in top-level cells owned by other ranks.
pub fn has_strays(space: &Space, rank: usize) -> bool {
    let foreign = |x| space.cells[space.cell_index(x)].node_id != rank;
    space.parts.par_iter().any(|p| foreign(p.x))
        || space.gparts.par_iter().any(|g| foreign(g.x))
        || space.sparts.par_iter().any(|s| foreign(s.x))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_split_weights() {
        assert_eq!(split_weights(&[1, 1, 1, 1], 2), vec![0, 0, 1, 1]);
        assert_eq!(split_weights(&[10, 0, 0, 10], 2), vec![0, 1, 1, 1]);
        assert_eq!(split_weights(&[0, 0, 0], 3), vec![0, 1, 2]);
        let split = split_weights(&[5, 1, 1, 1, 1, 1], 2);
        assert_eq!(split[0], 0);
        assert_eq!(*split.last().unwrap(), 1);
        assert!(split.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn test_cells_per_node() {
        assert_eq!(cells_per_node(&[0, 1, 1, 2], 3), vec![1, 2, 1]);
    }
}
