use crate::{
    cell::{CellId, PCell},
    comm::{CommExt, Communicator, MsgContext},
    macros::fatal,
    part::{GPart, Part, ParticleBlock, SPart},
};

/// Tag of a bulk exchange message from `src` to `dst`.
pub fn exchange_tag(src: usize, dst: usize, nr_nodes: usize, channel: u64) -> u64 {
    4 * (src * nr_nodes + dst) as u64 + channel
}

/// Everything this rank exchanges with one remote rank: the local cells the
/// remote rank needs, the remote cells this rank needs, and the staging
/// buffer for outgoing stray particles.
#[derive(Debug)]
pub struct Proxy {
    pub my_node: usize,
    pub node_id: usize,
    pub cells_in: Vec<CellId>,
    pub cells_out: Vec<CellId>,
    parts_out: ParticleBlock,
}

impl Proxy {
    pub fn new(my_node: usize, node_id: usize) -> Self {
        Self {
            my_node,
            node_id,
            cells_in: vec![],
            cells_out: vec![],
            parts_out: ParticleBlock::default(),
        }
    }

    pub fn add_cell_in(&mut self, cid: CellId) {
        if !self.cells_in.contains(&cid) {
            self.cells_in.push(cid);
        }
    }

    pub fn add_cell_out(&mut self, cid: CellId) {
        if !self.cells_out.contains(&cid) {
            self.cells_out.push(cid);
        }
    }

    /// Order both cell lists by cell id, so that the outgoing list of one
    /// rank matches the incoming list of the other.
    pub fn finalize(&mut self) {
        self.cells_in.sort_unstable();
        self.cells_out.sort_unstable();
    }

    /// Send the packed trees of `cells_out`, in the order of the list.
    pub fn send_cells<C: Communicator + ?Sized>(&self, comm: &C, pcells_out: Vec<Vec<PCell>>) {
        if pcells_out.len() != self.cells_out.len() {
            fatal!(
                "Packed {} cells for rank {}, expected {}.",
                pcells_out.len(),
                self.node_id,
                self.cells_out.len()
            );
        }
        let tag = exchange_tag(self.my_node, self.node_id, comm.size(), 0);
        comm.send_vec(self.node_id, MsgContext::Cells, tag, pcells_out);
    }

    /// Receive the packed trees of `cells_in`.
    pub fn recv_cells<C: Communicator + ?Sized>(&self, comm: &C) -> Vec<Vec<PCell>> {
        let tag = exchange_tag(self.node_id, self.my_node, comm.size(), 0);
        let pcells_in: Vec<Vec<PCell>> = comm.recv_vec(self.node_id, MsgContext::Cells, tag);
        if pcells_in.len() != self.cells_in.len() {
            fatal!(
                "Rank {} sent {} cells, expected {}.",
                self.node_id,
                pcells_in.len(),
                self.cells_in.len()
            );
        }
        pcells_in
    }

    /// Stage stray particles for the remote rank.
    pub fn parts_load(&mut self, block: ParticleBlock) {
        self.parts_out.append(block);
    }

    pub fn nr_parts_out(&self) -> [usize; 3] {
        self.parts_out.counts()
    }

    /// Send the staged strays, possibly none, one message per species.
    pub fn send_parts<C: Communicator + ?Sized>(&mut self, comm: &C) {
        let out = std::mem::take(&mut self.parts_out);
        let tag = |channel| exchange_tag(self.my_node, self.node_id, comm.size(), channel);
        comm.send_vec(self.node_id, MsgContext::Strays, tag(0), out.parts);
        comm.send_vec(self.node_id, MsgContext::Strays, tag(1), out.gparts);
        comm.send_vec(self.node_id, MsgContext::Strays, tag(2), out.sparts);
    }

    /// Receive the strays of the remote rank. Their partner links are still
    /// pending and get resolved when the block is appended.
    pub fn recv_parts<C: Communicator + ?Sized>(&self, comm: &C) -> ParticleBlock {
        let tag = |channel| exchange_tag(self.node_id, self.my_node, comm.size(), channel);
        let parts: Vec<Part> = comm.recv_vec(self.node_id, MsgContext::Strays, tag(0));
        let gparts: Vec<GPart> = comm.recv_vec(self.node_id, MsgContext::Strays, tag(1));
        let sparts: Vec<SPart> = comm.recv_vec(self.node_id, MsgContext::Strays, tag(2));
        ParticleBlock { parts, gparts, sparts }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::comm::LocalComm;

    #[test]
    fn test_cell_lists() {
        let mut proxy = Proxy::new(0, 1);
        for cid in [5, 2, 5, 9] {
            proxy.add_cell_in(cid);
            proxy.add_cell_out(cid + 1);
        }
        proxy.finalize();
        assert_eq!(proxy.cells_in, vec![2, 5, 9]);
        assert_eq!(proxy.cells_out, vec![3, 6, 10]);
    }

    #[test]
    fn test_exchange_parts() {
        let world = LocalComm::world(2);
        let received: Vec<_> = std::thread::scope(|s| {
            let handles: Vec<_> = world
                .iter()
                .map(|comm| {
                    s.spawn(move || {
                        let rank = comm.rank();
                        let mut proxy = Proxy::new(rank, 1 - rank);
                        let mut block = ParticleBlock::default();
                        for id in 0..(rank + 1) {
                            block.parts.push(Part { id: id as u64, ..Default::default() });
                        }
                        proxy.parts_load(block);
                        assert_eq!(proxy.nr_parts_out(), [rank + 1, 0, 0]);
                        proxy.send_parts(comm);
                        assert_eq!(proxy.nr_parts_out(), [0, 0, 0]);
                        proxy.recv_parts(comm)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert_eq!(received[0].parts.len(), 2);
        assert_eq!(received[1].parts.len(), 1);
    }
}
