use std::{mem, ops::Range, sync::atomic::Ordering};

use glam::DVec3;
use rayon::prelude::*;
use yaml_rust::Yaml;

use crate::{
    cell::{sort_id, Cell, CellId, PCell},
    errors::ConfigError,
    initial_conditions::InitialConditions,
    macros::fatal,
    part::{
        check_links, sort_by_key_stable, Destinations, GPart, Part, Particle, ParticleBlock, ParticleKind,
        PartnerLink, SPart,
    },
    timeline::{IntegerTime, MAX_NR_TIMESTEPS},
    utils::{box_wrap, contains},
};

/// Top-level cells are at least this factor larger than the largest
/// smoothing length.
const SPACE_STRETCH: f64 = 1.10;
/// Cells are never split beyond this depth.
const SPACE_MAX_DEPTH: u32 = 20;

fn parse_cdim(yaml: &Yaml) -> Result<[usize; 3], ConfigError> {
    match yaml {
        Yaml::Integer(n) if *n > 0 => Ok([*n as usize; 3]),
        Yaml::BadValue => Ok([12; 3]),
        Yaml::Array(v) if v.len() == 3 => {
            let mut cdim = [0; 3];
            for (k, n) in v.iter().enumerate() {
                cdim[k] = match n.as_i64() {
                    Some(n) if n > 0 => n as usize,
                    _ => {
                        return Err(ConfigError::InvalidValue(
                            "space:max_top_level_cells".to_string(),
                            format!("{:?}", n),
                        ))
                    }
                };
            }
            Ok(cdim)
        }
        other => Err(ConfigError::InvalidValue(
            "space:max_top_level_cells".to_string(),
            format!("{:?}", other),
        )),
    }
}

/// Flat index of the top-level cell at grid coordinates `(i, j, k)`.
pub fn cell_getid(cdim: [usize; 3], i: usize, j: usize, k: usize) -> CellId {
    (i * cdim[1] + j) * cdim[2] + k
}

/// The 26 offsets of the 3x3x3 neighbour stencil, in grid order.
pub fn stencil() -> impl Iterator<Item = [isize; 3]> {
    (-1..=1)
        .flat_map(|i| (-1..=1).flat_map(move |j| (-1..=1).map(move |k| [i, j, k])))
        .filter(|offset| *offset != [0, 0, 0])
}

/// Owner of the top-level cell grid, the cell arena and all particle arrays.
#[derive(Debug)]
pub struct Space {
    pub dim: DVec3,
    pub periodic: bool,
    pub cdim: [usize; 3],
    pub width: DVec3,
    iwidth: DVec3,
    /// Number of top-level cells; they occupy the start of `cells`.
    pub nr_cells: usize,
    pub cells: Vec<Cell>,
    pub parts: Vec<Part>,
    pub gparts: Vec<GPart>,
    pub sparts: Vec<SPart>,
    pub parts_foreign: Vec<Part>,
    pub gparts_foreign: Vec<GPart>,
    pub sparts_foreign: Vec<SPart>,
    pub split_size: usize,
    pub sub_size_self: usize,
    pub sub_size_pair: usize,
    pub max_relative_dx: f64,
}

impl Space {
    /// Constructs a space from the initial conditions and the `space`
    /// configuration section.
    pub fn from_ic(initial_conditions: InitialConditions, space_cfg: &Yaml) -> Result<Self, ConfigError> {
        let dim = initial_conditions.box_size();
        let periodic = space_cfg["periodic"].as_bool().unwrap_or(true);
        let max_top_level_cells = parse_cdim(&space_cfg["max_top_level_cells"])?;
        let split_size = space_cfg["split_size"].as_i64().unwrap_or(400) as usize;
        let sub_size_self = space_cfg["sub_size_self"].as_i64().unwrap_or(64_000_000) as usize;
        let sub_size_pair = space_cfg["sub_size_pair"].as_i64().unwrap_or(64_000_000) as usize;
        let max_relative_dx = space_cfg["max_relative_dx"].as_f64().unwrap_or(0.1);
        if split_size == 0 {
            return Err(ConfigError::InvalidValue("space:split_size".to_string(), "0".to_string()));
        }

        let mut block = initial_conditions.into_block();
        let h_max = block.parts.iter().map(|p| p.h).fold(0., f64::max);
        let mut cdim = max_top_level_cells;
        if h_max > 0. {
            for k in 0..3 {
                let fit = (dim[k] / (h_max * SPACE_STRETCH)).floor() as usize;
                cdim[k] = cdim[k].min(fit).max(1);
            }
        }
        if periodic && cdim.iter().any(|&n| n < 3) {
            return Err(ConfigError::TooFewTopLevelCells(cdim));
        }

        for x in block
            .parts
            .iter_mut()
            .map(|p| &mut p.x)
            .chain(block.gparts.iter_mut().map(|g| &mut g.x))
            .chain(block.sparts.iter_mut().map(|s| &mut s.x))
        {
            if periodic {
                box_wrap(dim, x);
            } else if !contains(dim, *x) {
                return Err(ConfigError::InvalidValue(
                    "initial_conditions".to_string(),
                    format!("particle at {} lies outside of the non-periodic box", x),
                ));
            }
        }

        let width = dim / DVec3::new(cdim[0] as f64, cdim[1] as f64, cdim[2] as f64);
        let mut space = Space {
            dim,
            periodic,
            cdim,
            width,
            iwidth: 1. / width,
            nr_cells: cdim.iter().product(),
            cells: vec![],
            parts: block.parts,
            gparts: block.gparts,
            sparts: block.sparts,
            parts_foreign: vec![],
            gparts_foreign: vec![],
            sparts_foreign: vec![],
            split_size,
            sub_size_self,
            sub_size_pair,
            max_relative_dx,
        };
        space.make_top_cells();
        tracing::info!("Top-level cell grid is {:?} with cell width {}.", cdim, width);
        Ok(space)
    }

    fn make_top_cells(&mut self) {
        self.cells.clear();
        for i in 0..self.cdim[0] {
            for j in 0..self.cdim[1] {
                for k in 0..self.cdim[2] {
                    let loc = DVec3::new(i as f64, j as f64, k as f64) * self.width;
                    self.cells.push(Cell::new(loc, self.width, 0, None));
                }
            }
        }
        debug_assert_eq!(self.cells.len(), self.nr_cells);
    }

    /// Grid coordinates of a top-level cell.
    pub fn cell_coords(&self, cid: CellId) -> [usize; 3] {
        let k = cid % self.cdim[2];
        let j = (cid / self.cdim[2]) % self.cdim[1];
        let i = cid / (self.cdim[1] * self.cdim[2]);
        [i, j, k]
    }

    /// Top-level cell containing position `x`.
    pub fn cell_index(&self, x: DVec3) -> CellId {
        let mut ind = [0; 3];
        for k in 0..3 {
            let i = (x[k] * self.iwidth[k]).floor();
            ind[k] = (i.max(0.) as usize).min(self.cdim[k] - 1);
        }
        cell_getid(self.cdim, ind[0], ind[1], ind[2])
    }

    /// Top-level neighbour of `cid` at offset `(di, dj, dk)`, respecting the
    /// periodic wrap.
    pub fn neighbour(&self, cid: CellId, offset: [isize; 3]) -> Option<CellId> {
        let coords = self.cell_coords(cid);
        let mut ind = [0; 3];
        for k in 0..3 {
            let n = self.cdim[k] as isize;
            let mut c = coords[k] as isize + offset[k];
            if self.periodic {
                c = c.rem_euclid(n);
            } else if c < 0 || c >= n {
                return None;
            }
            ind[k] = c as usize;
        }
        Some(cell_getid(self.cdim, ind[0], ind[1], ind[2]))
    }

    /// Sort direction of the pair `(ci, cj)` and the periodic shift to add to
    /// positions in `cj` to bring them next to `ci`.
    pub fn pair_geometry(&self, ci: CellId, cj: CellId) -> (usize, DVec3) {
        let (cell_i, cell_j) = (&self.cells[ci], &self.cells[cj]);
        let mut shift = DVec3::ZERO;
        let dx = cell_j.centre() - cell_i.centre();
        if self.periodic {
            for k in 0..3 {
                if dx[k] < -0.5 * self.dim[k] {
                    shift[k] = self.dim[k];
                } else if dx[k] > 0.5 * self.dim[k] {
                    shift[k] = -self.dim[k];
                }
            }
        }
        (sort_id(dx + shift, 1e-6 * cell_i.width.min_element()), shift)
    }

    pub fn local_top_cells(&self, rank: usize) -> Vec<CellId> {
        (0..self.nr_cells).filter(|&c| self.cells[c].node_id == rank).collect()
    }

    /// Put every particle back into the box, or abort if a particle left a
    /// non-periodic box.
    pub fn wrap_particles(&mut self) {
        let (dim, periodic) = (self.dim, self.periodic);
        let wrap = move |x: &mut DVec3| {
            if periodic {
                box_wrap(dim, x);
            } else if !contains(dim, *x) {
                fatal!("Particle at {} left the non-periodic box.", x);
            }
        };
        self.parts.par_iter_mut().for_each(|p| wrap(&mut p.x));
        self.gparts.par_iter_mut().for_each(|g| wrap(&mut g.x));
        self.sparts.par_iter_mut().for_each(|s| wrap(&mut s.x));
    }

    /// Rank owning the top-level cell of every local particle.
    pub fn destinations(&self) -> Destinations {
        let node = |x: DVec3| self.cells[self.cell_index(x)].node_id;
        Destinations {
            parts: self.parts.par_iter().map(|p| node(p.x)).collect(),
            gparts: self.gparts.par_iter().map(|g| node(g.x)).collect(),
            sparts: self.sparts.par_iter().map(|s| node(s.x)).collect(),
        }
    }

    pub fn take_particles(&mut self) -> ParticleBlock {
        ParticleBlock {
            parts: mem::take(&mut self.parts),
            gparts: mem::take(&mut self.gparts),
            sparts: mem::take(&mut self.sparts),
        }
    }

    pub fn set_particles(&mut self, block: ParticleBlock) {
        self.parts = block.parts;
        self.gparts = block.gparts;
        self.sparts = block.sparts;
    }

    pub fn nr_particles(&self) -> [usize; 3] {
        [self.parts.len(), self.gparts.len(), self.sparts.len()]
    }

    /// Rebuild the cell hierarchy over the local particles: sort them by
    /// top-level cell, split crowded cells and recompute the cell
    /// aggregates. Foreign cells lose their progeny until the next cell
    /// exchange.
    pub fn rebuild(&mut self, rank: usize, nr_queues: usize, ti_current: IntegerTime) {
        self.cells.truncate(self.nr_cells);
        for cid in 0..self.nr_cells {
            let node_id = self.cells[cid].node_id;
            let cell = &mut self.cells[cid];
            *cell = Cell::new(cell.loc, self.width, 0, None);
            cell.node_id = node_id;
            cell.foreign = node_id != rank;
            cell.owner = cid * nr_queues.max(1) / self.nr_cells;
        }
        self.parts_foreign.clear();
        self.gparts_foreign.clear();
        self.sparts_foreign.clear();

        // Sort by top-level cell.
        let part_keys: Vec<usize> = self.parts.par_iter().map(|p| self.cell_index(p.x)).collect();
        let gpart_keys: Vec<usize> = self.gparts.par_iter().map(|g| self.cell_index(g.x)).collect();
        let spart_keys: Vec<usize> = self.sparts.par_iter().map(|s| self.cell_index(s.x)).collect();
        if cfg!(debug_assertions) {
            for &cid in part_keys.iter().chain(gpart_keys.iter()).chain(spart_keys.iter()) {
                if self.cells[cid].node_id != rank {
                    fatal!("Particle in top-level cell {} which is not local to rank {}.", cid, rank);
                }
            }
        }
        self.reorder_parts(0..self.parts.len(), &part_keys);
        self.reorder_sparts(0..self.sparts.len(), &spart_keys);
        self.reorder_gparts(0..self.gparts.len(), &gpart_keys);

        let mut counts = vec![[0usize; 3]; self.nr_cells];
        for &c in part_keys.iter() {
            counts[c][0] += 1;
        }
        for &c in gpart_keys.iter() {
            counts[c][1] += 1;
        }
        for &c in spart_keys.iter() {
            counts[c][2] += 1;
        }
        let mut offsets = [0usize; 3];
        for (cid, count) in counts.iter().enumerate() {
            let cell = &mut self.cells[cid];
            cell.part_offset = offsets[0];
            cell.count = count[0];
            cell.gpart_offset = offsets[1];
            cell.gcount = count[1];
            cell.spart_offset = offsets[2];
            cell.scount = count[2];
            for k in 0..3 {
                offsets[k] += count[k];
            }
        }

        for cid in 0..self.nr_cells {
            if self.cells[cid].node_id == rank {
                self.split(cid);
            }
        }

        for p in self.parts.iter_mut() {
            p.x_diff = DVec3::ZERO;
        }
        for g in self.gparts.iter_mut() {
            g.x_diff = DVec3::ZERO;
        }
        for s in self.sparts.iter_mut() {
            s.x_diff = DVec3::ZERO;
        }
        for cid in 0..self.nr_cells {
            if self.cells[cid].node_id == rank {
                self.compute_aggregates(cid, ti_current);
            }
        }

        if cfg!(debug_assertions) {
            if let Err(msg) = self.check(rank) {
                fatal!("Inconsistent space after rebuild: {}", msg);
            }
        }
    }

    fn reorder_parts(&mut self, range: Range<usize>, keys: &[usize]) {
        let mut slice = self.parts[range.clone()].to_vec();
        sort_by_key_stable(&mut slice, keys);
        for (k, part) in slice.into_iter().enumerate() {
            let i = range.start + k;
            if let Some(gi) = part.gpart {
                self.gparts[gi].partner = PartnerLink::Local(i);
            }
            self.parts[i] = part;
        }
    }

    fn reorder_sparts(&mut self, range: Range<usize>, keys: &[usize]) {
        let mut slice = self.sparts[range.clone()].to_vec();
        sort_by_key_stable(&mut slice, keys);
        for (k, spart) in slice.into_iter().enumerate() {
            let i = range.start + k;
            if let Some(gi) = spart.gpart {
                self.gparts[gi].partner = PartnerLink::Local(i);
            }
            self.sparts[i] = spart;
        }
    }

    fn reorder_gparts(&mut self, range: Range<usize>, keys: &[usize]) {
        let mut slice = self.gparts[range.clone()].to_vec();
        sort_by_key_stable(&mut slice, keys);
        for (k, gpart) in slice.into_iter().enumerate() {
            let gi = range.start + k;
            match (gpart.kind, gpart.partner) {
                (ParticleKind::Gas, PartnerLink::Local(i)) => self.parts[i].gpart = Some(gi),
                (ParticleKind::Star, PartnerLink::Local(i)) => self.sparts[i].gpart = Some(gi),
                _ => {}
            }
            self.gparts[gi] = gpart;
        }
    }

    /// Recursively split `cid` into octants while it holds too many particles.
    fn split(&mut self, cid: CellId) {
        let cell = &self.cells[cid];
        let crowded = cell.count.max(cell.gcount).max(cell.scount) > self.split_size;
        if !crowded {
            return;
        }
        if cell.depth >= SPACE_MAX_DEPTH {
            tracing::warn!("Cell {} reached the maximal depth with {} particles.", cid, cell.total_count());
            return;
        }

        let (loc, half, depth, node_id, foreign, owner) =
            (cell.loc, 0.5 * cell.width, cell.depth, cell.node_id, cell.foreign, cell.owner);
        let mid = loc + half;
        let octant = |x: DVec3| -> usize {
            (usize::from(x.x >= mid.x) << 2) | (usize::from(x.y >= mid.y) << 1) | usize::from(x.z >= mid.z)
        };
        let (part_range, gpart_range, spart_range) = (cell.part_range(), cell.gpart_range(), cell.spart_range());
        let part_keys: Vec<usize> = self.parts[part_range.clone()].iter().map(|p| octant(p.x)).collect();
        let gpart_keys: Vec<usize> = self.gparts[gpart_range.clone()].iter().map(|g| octant(g.x)).collect();
        let spart_keys: Vec<usize> = self.sparts[spart_range.clone()].iter().map(|s| octant(s.x)).collect();
        self.reorder_parts(part_range.clone(), &part_keys);
        self.reorder_sparts(spart_range.clone(), &spart_keys);
        self.reorder_gparts(gpart_range.clone(), &gpart_keys);

        let mut counts = [[0usize; 3]; 8];
        for &k in part_keys.iter() {
            counts[k][0] += 1;
        }
        for &k in gpart_keys.iter() {
            counts[k][1] += 1;
        }
        for &k in spart_keys.iter() {
            counts[k][2] += 1;
        }

        let mut offsets = [part_range.start, gpart_range.start, spart_range.start];
        let mut progeny = [None; 8];
        for (k, count) in counts.iter().enumerate() {
            if count.iter().sum::<usize>() > 0 {
                let corner = DVec3::new(((k >> 2) & 1) as f64, ((k >> 1) & 1) as f64, (k & 1) as f64);
                let mut child = Cell::new(loc + corner * half, half, depth + 1, Some(cid));
                child.node_id = node_id;
                child.foreign = foreign;
                child.owner = owner;
                child.part_offset = offsets[0];
                child.count = count[0];
                child.gpart_offset = offsets[1];
                child.gcount = count[1];
                child.spart_offset = offsets[2];
                child.scount = count[2];
                self.cells.push(child);
                progeny[k] = Some(self.cells.len() - 1);
            }
            for s in 0..3 {
                offsets[s] += count[s];
            }
        }
        self.cells[cid].progeny = progeny;
        self.cells[cid].split = true;
        for child in progeny.into_iter().flatten() {
            self.split(child);
        }
    }

    /// Set `h_max`, `ti_end_min`, `ti_end_max` and reset the displacement
    /// state of the subtree rooted at `cid`.
    fn compute_aggregates(&self, cid: CellId, ti_current: IntegerTime) -> (f64, IntegerTime, IntegerTime) {
        let cell = &self.cells[cid];
        let (mut h_max, mut ti_end_min, mut ti_end_max) = (0f64, MAX_NR_TIMESTEPS, 0);
        if cell.split {
            for child in cell.progeny_ids() {
                let (h, min, max) = self.compute_aggregates(child, ti_current);
                h_max = h_max.max(h);
                ti_end_min = ti_end_min.min(min);
                ti_end_max = ti_end_max.max(max);
            }
        } else {
            for part in self.parts[cell.part_range()].iter() {
                h_max = h_max.max(part.h);
            }
            let ends = self.parts[cell.part_range()]
                .iter()
                .map(|p| p.ti_end(ti_current))
                .chain(self.gparts[cell.gpart_range()].iter().map(|g| g.ti_end(ti_current)))
                .chain(self.sparts[cell.spart_range()].iter().map(|s| s.ti_end(ti_current)));
            for ti_end in ends {
                ti_end_min = ti_end_min.min(ti_end);
                ti_end_max = ti_end_max.max(ti_end);
            }
        }
        cell.h_max.store(h_max);
        cell.dx_max.store(0.);
        cell.ti_end_min.store(ti_end_min, Ordering::Release);
        cell.ti_end_max.store(ti_end_max, Ordering::Release);
        cell.ti_old.store(ti_current, Ordering::Release);
        (h_max, ti_end_min, ti_end_max)
    }

    /// Flatten the subtree of `cid` into `out`, assigning fresh tags from
    /// `next_tag` in depth-first order.
    pub fn pack_cell(&mut self, cid: CellId, out: &mut Vec<PCell>, next_tag: &mut u64) -> usize {
        let index = out.len();
        let cell = &mut self.cells[cid];
        cell.tag = *next_tag;
        *next_tag += 1;
        out.push(PCell {
            h_max: cell.h_max.load(),
            dx_max: cell.dx_max.load(),
            ti_end_min: cell.ti_end_min.load(Ordering::Acquire),
            ti_end_max: cell.ti_end_max.load(Ordering::Acquire),
            count: cell.count,
            gcount: cell.gcount,
            scount: cell.scount,
            tag: cell.tag,
            progeny: [None; 8],
        });
        let progeny = cell.progeny;
        for (k, child) in progeny.iter().enumerate() {
            if let Some(child) = child {
                let child_index = self.pack_cell(*child, out, next_tag);
                out[index].progeny[k] = Some(child_index - index);
            }
        }
        index
    }

    /// Rebuild the subtree of the foreign cell `cid` from its packed form.
    /// Returns the number of cells created.
    pub fn unpack_cell(&mut self, cid: CellId, pcells: &[PCell], index: usize) -> usize {
        let pc = &pcells[index];
        let cell = &mut self.cells[cid];
        cell.h_max.store(pc.h_max);
        cell.dx_max.store(pc.dx_max);
        cell.ti_end_min.store(pc.ti_end_min, Ordering::Release);
        cell.ti_end_max.store(pc.ti_end_max, Ordering::Release);
        cell.count = pc.count;
        cell.gcount = pc.gcount;
        cell.scount = pc.scount;
        cell.tag = pc.tag;
        cell.foreign = true;
        let (loc, half, depth, node_id) = (cell.loc, 0.5 * cell.width, cell.depth, cell.node_id);

        let mut created = 0;
        let mut progeny = [None; 8];
        for (k, rel) in pc.progeny.iter().enumerate() {
            if let Some(rel) = rel {
                let corner = DVec3::new(((k >> 2) & 1) as f64, ((k >> 1) & 1) as f64, (k & 1) as f64);
                let mut child = Cell::new(loc + corner * half, half, depth + 1, Some(cid));
                child.node_id = node_id;
                child.foreign = true;
                self.cells.push(child);
                let child_id = self.cells.len() - 1;
                progeny[k] = Some(child_id);
                created += 1 + self.unpack_cell(child_id, pcells, index + rel);
            }
        }
        self.cells[cid].progeny = progeny;
        self.cells[cid].split = progeny.iter().any(Option::is_some);
        created
    }

    /// Give every foreign cell in `foreign_cells` (and its progeny) a slice
    /// of the foreign particle arrays.
    pub fn allocate_foreign(&mut self, foreign_cells: &[CellId]) {
        let mut offsets = [0usize; 3];
        for &cid in foreign_cells {
            self.set_foreign_offsets(cid, offsets);
            let cell = &self.cells[cid];
            offsets[0] += cell.count;
            offsets[1] += cell.gcount;
            offsets[2] += cell.scount;
        }
        self.parts_foreign = vec![Part::default(); offsets[0]];
        self.gparts_foreign = vec![GPart::default(); offsets[1]];
        self.sparts_foreign = vec![SPart::default(); offsets[2]];
        tracing::debug!(
            "Allocated {} foreign parts, {} foreign gparts and {} foreign sparts.",
            offsets[0],
            offsets[1],
            offsets[2]
        );
    }

    fn set_foreign_offsets(&mut self, cid: CellId, mut offsets: [usize; 3]) {
        let cell = &mut self.cells[cid];
        cell.part_offset = offsets[0];
        cell.gpart_offset = offsets[1];
        cell.spart_offset = offsets[2];
        let progeny = cell.progeny;
        for child in progeny.into_iter().flatten() {
            self.set_foreign_offsets(child, offsets);
            let child = &self.cells[child];
            offsets[0] += child.count;
            offsets[1] += child.gcount;
            offsets[2] += child.scount;
        }
    }

    /// Check the structural invariants of the local part of the hierarchy.
    pub fn check(&self, rank: usize) -> Result<(), String> {
        check_links(&self.parts, &self.gparts, &self.sparts)?;
        for (cid, cell) in self.cells.iter().enumerate() {
            if cell.node_id != rank {
                continue;
            }
            if cell.split != cell.progeny.iter().any(Option::is_some) {
                return Err(format!("cell {} is split without progeny (or vice versa)", cid));
            }
            if cell.split {
                let sum = cell
                    .progeny_ids()
                    .map(|c| self.cells[c].total_count())
                    .sum::<usize>();
                if sum != cell.total_count() {
                    return Err(format!("progeny of cell {} hold {} particles instead of {}", cid, sum, cell.total_count()));
                }
                continue;
            }
            let upper = cell.loc + cell.width;
            let inside = |x: DVec3| (0..3).all(|k| x[k] >= cell.loc[k] && x[k] <= upper[k]);
            let positions = self.parts[cell.part_range()]
                .iter()
                .map(|p| p.x)
                .chain(self.gparts[cell.gpart_range()].iter().map(|g| g.x))
                .chain(self.sparts[cell.spart_range()].iter().map(|s| s.x));
            for x in positions {
                if !inside(x) {
                    return Err(format!("particle at {} lies outside of cell {}", x, cid));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;
    use yaml_rust::YamlLoader;

    use super::*;

    const SPACE_CFG: &str = r###"periodic: true
max_top_level_cells: 3
split_size: 10"###;

    fn space(num_per_axis: usize) -> Space {
        let mut positions = vec![];
        for i in 0..num_per_axis {
            for j in 0..num_per_axis {
                for k in 0..num_per_axis {
                    positions.push((DVec3::new(i as f64, j as f64, k as f64) + 0.5) / num_per_axis as f64);
                }
            }
        }
        let ics = InitialConditions::from_positions(DVec3::ONE, &positions, 1., 0.01, 1., true);
        let cfg = &YamlLoader::load_from_str(SPACE_CFG).unwrap()[0];
        Space::from_ic(ics, cfg).expect("Config should be valid!")
    }

    #[test]
    fn test_rebuild_sorts_and_splits() {
        let mut space = space(6);
        assert_eq!(space.cdim, [3, 3, 3]);
        space.rebuild(0, 4, 0);
        assert!(space.check(0).is_ok());
        // 8 particles per top cell, below the split size.
        assert!(space.cells[..space.nr_cells].iter().all(|c| c.count == 8 && !c.split));
        assert_approx_eq!(f64, space.cells[0].h_max.load(), 0.01);
        assert_eq!(space.cells[0].ti_end_min.load(Ordering::Acquire), 0);
        assert_eq!(space.cells[26].owner, 3);

        let mut space = self::space(12);
        space.rebuild(0, 1, 0);
        assert!(space.check(0).is_ok());
        assert!(space.cells.len() > space.nr_cells);
        assert!(space.cells[0].split);
        assert_eq!(space.cells[0].progeny_ids().count(), 8);
    }

    #[test]
    fn test_too_few_cells() {
        let ics = InitialConditions::from_positions(DVec3::ONE, &[DVec3::splat(0.5)], 1., 0.4, 1., false);
        let cfg = &YamlLoader::load_from_str(SPACE_CFG).unwrap()[0];
        assert!(matches!(Space::from_ic(ics, cfg), Err(ConfigError::TooFewTopLevelCells(_))));
    }

    #[test]
    fn test_neighbours_and_geometry() {
        let space = space(3);
        let corner = cell_getid(space.cdim, 0, 0, 0);
        let wrapped = space.neighbour(corner, [-1, 0, 0]).unwrap();
        assert_eq!(wrapped, cell_getid(space.cdim, 2, 0, 0));
        let (sid, shift) = space.pair_geometry(corner, wrapped);
        assert_eq!(sid, crate::cell::SORT_LIST_ID[1 + 3 * (1 + 3 * 0)]);
        assert_approx_eq!(f64, shift.x, -1.);
    }

    #[test]
    fn test_pack_unpack() {
        let mut space = space(12);
        space.rebuild(0, 1, 0);
        let mut pcells = vec![];
        let mut tag = 0;
        space.pack_cell(0, &mut pcells, &mut tag);
        assert_eq!(pcells.len() as u64, tag);

        let mut other = self::space(12);
        other.set_particles(ParticleBlock::default());
        other.cells[0].node_id = 1;
        other.rebuild(0, 1, 0);
        let created = other.unpack_cell(0, &pcells, 0);
        assert_eq!(created + 1, pcells.len());
        assert_eq!(other.cells[0].count, space.cells[0].count);
        other.allocate_foreign(&[0]);
        assert_eq!(other.parts_foreign.len(), space.cells[0].count);
    }
}
