//! Selection of the tasks that run in the coming launch.

use std::sync::atomic::{AtomicBool, Ordering};

use rayon::prelude::*;

use crate::{
    cell::{Cell, CellId},
    link::{LinkHead, LinkTable},
    macros::fatal,
    scheduler::Scheduler,
    space::Space,
    task::{Task, TaskId, TaskSubtype, TaskType},
    timeline::IntegerTime,
};

/// Whether a pair of cells drifted or grew so much that their interaction
/// may miss neighbours.
pub fn needs_rebuild(ci: &Cell, cj: &Cell, max_relative_dx: f64) -> bool {
    let (h_i, h_j) = (ci.h_max.load(), cj.h_max.load());
    let (dx_i, dx_j) = (ci.dx_max.load(), cj.dx_max.load());
    h_i.max(h_j) + dx_i + dx_j > ci.dmin.min(cj.dmin)
        || dx_i > max_relative_dx * h_i
        || dx_j > max_relative_dx * h_j
}

struct Marker<'a> {
    space: &'a Space,
    sched: &'a Scheduler,
    links: &'a LinkTable,
    ti_current: IntegerTime,
    rank: usize,
}

/// Skip every task, then unskip the ones needed at `ti_current`. Returns
/// whether any active pair needs a rebuild. Running it twice gives the same
/// result.
pub fn mark_tasks(space: &Space, sched: &Scheduler, links: &LinkTable, ti_current: IntegerTime, rank: usize) -> bool {
    sched.tasks.par_iter().for_each(|task| {
        task.skip.store(true, Ordering::Release);
        if task.ty == TaskType::Sort {
            task.flags.store(0, Ordering::Release);
        }
    });

    let marker = Marker {
        space,
        sched,
        links,
        ti_current,
        rank,
    };
    let rebuild = AtomicBool::new(false);
    (0..sched.tasks.len()).into_par_iter().for_each(|tid| {
        if marker.mark(tid) {
            rebuild.store(true, Ordering::Relaxed);
        }
    });
    rebuild.into_inner()
}

impl Marker<'_> {
    fn cells(&self) -> &[Cell] {
        &self.space.cells
    }

    fn is_active(&self, cid: Option<CellId>) -> bool {
        cid.map_or(false, |c| self.cells()[c].is_active(self.ti_current))
    }

    /// Returns true if the task needs a rebuild.
    fn mark(&self, tid: TaskId) -> bool {
        let task = &self.sched.tasks[tid];
        match task.ty {
            TaskType::None | TaskType::GravDown | TaskType::Sort | TaskType::Send | TaskType::Recv => false,
            TaskType::GravGatherM | TaskType::GravFft => {
                self.sched.activate(tid);
                false
            }
            TaskType::GravUp => {
                self.sched.activate(tid);
                if let Some(ci) = task.ci {
                    self.activate_drift(ci);
                }
                false
            }
            ty if ty.is_self_like() => {
                if self.is_active(task.ci) {
                    self.sched.activate(tid);
                }
                false
            }
            ty if ty.is_pair_like() => self.mark_pair(tid, task),
            // Hierarchical tasks live on local super cells.
            _ => {
                if self.is_active(task.ci) {
                    self.sched.activate(tid);
                }
                false
            }
        }
    }

    fn mark_pair(&self, tid: TaskId, task: &Task) -> bool {
        let (Some(ci), Some(cj)) = (task.ci, task.cj) else {
            fatal!("Pair task {} without two cells.", tid);
        };
        let cells = self.cells();
        // Movement is checked whether or not the pair runs this step.
        let rebuild = task.tight && needs_rebuild(&cells[ci], &cells[cj], self.space.max_relative_dx);
        if !(self.is_active(Some(ci)) || self.is_active(Some(cj))) {
            return rebuild;
        }
        self.sched.activate(tid);
        let (local_i, local_j) = (cells[ci].is_local(self.rank), cells[cj].is_local(self.rank));
        for (c, local) in [(ci, local_i), (cj, local_j)] {
            if local {
                self.activate_drift(c);
            }
        }
        if task.subtype != TaskSubtype::Density {
            return rebuild;
        }

        if task.ty == TaskType::Pair {
            let bit = 1 << task.flags();
            self.activate_sorts(ci, bit);
            self.activate_sorts(cj, bit);
        }
        match (local_i, local_j) {
            (true, false) => self.activate_comms(ci, cj),
            (false, true) => self.activate_comms(cj, ci),
            _ => {}
        }
        rebuild
    }

    fn activate_drift(&self, cid: CellId) {
        let cells = self.cells();
        if let Some(drift) = cells[cid].super_cell.and_then(|s| cells[s].tasks.drift) {
            self.sched.activate(drift);
        }
    }

    /// Activate the drifts of all super cells in the subtree of `cid`.
    fn activate_drifts_below(&self, cid: CellId) {
        let cell = &self.cells()[cid];
        if cell.super_cell == Some(cid) {
            if let Some(drift) = cell.tasks.drift {
                self.sched.activate(drift);
            }
            return;
        }
        for child in cell.progeny_ids() {
            self.activate_drifts_below(child);
        }
    }

    /// Request the sort direction `bit` on `cid` and all sorts below it,
    /// unless the cell already holds that order for its current positions.
    fn activate_sorts(&self, cid: CellId, bit: u32) {
        let cell = &self.cells()[cid];
        if let Some(sort) = cell.tasks.sorts {
            let fresh = cell.is_local(self.rank)
                && cell.ti_old.load(Ordering::Acquire) == self.ti_current
                && cell.sorted.load(Ordering::Acquire) & bit != 0;
            if !fresh {
                self.sched.tasks[sort].flags.fetch_or(bit, Ordering::AcqRel);
                self.sched.activate(sort);
            }
        }
        for child in cell.progeny_ids() {
            if self.cells()[child].tasks.sorts.is_some() {
                self.activate_sorts(child, bit);
            }
        }
    }

    /// An active pair across ranks needs the foreign data received and the
    /// local data sent to the other rank.
    fn activate_comms(&self, local: CellId, foreign: CellId) {
        let cells = self.cells();
        let ftop = top_level(cells, foreign);
        let recv = &cells[ftop].tasks;
        let Some(recv_xv) = recv.recv_xv else {
            fatal!("Foreign cell {} has no receive tasks.", ftop);
        };
        for tid in [Some(recv_xv), recv.recv_rho, recv.recv_gradient, recv.recv_ti]
            .into_iter()
            .flatten()
        {
            self.sched.activate(tid);
        }

        let ltop = top_level(cells, local);
        let node = cells[ftop].node_id;
        let lcell = &cells[ltop];
        let mut found = false;
        for head in [&lcell.links.send_xv, &lcell.links.send_rho, &lcell.links.send_gradient, &lcell.links.send_ti] {
            found |= self.activate_sends_to(head, node);
        }
        if !found {
            fatal!("Local cell {} has no send tasks to rank {}.", ltop, node);
        }
        self.activate_drifts_below(ltop);
    }

    fn activate_sends_to(&self, head: &LinkHead, node: usize) -> bool {
        let mut found = false;
        for tid in self.links.iter(head) {
            let dest = self.sched.tasks[tid].cj.map(|cj| self.cells()[cj].node_id);
            if dest == Some(node) {
                self.sched.activate(tid);
                found = true;
            }
        }
        found
    }
}

fn top_level(cells: &[Cell], mut cid: CellId) -> CellId {
    while let Some(parent) = cells[cid].parent {
        cid = parent;
    }
    cid
}

fn skip_if(sched: &Scheduler, predicate: impl Fn(&Task) -> bool + Sync) {
    sched.tasks.par_iter().filter(|t| predicate(t)).for_each(|t| {
        t.skip.store(true, Ordering::Release);
    });
}

/// Restrict a launch to drifting, sorting and the density loop.
pub fn skip_force_and_kick(sched: &Scheduler) {
    skip_if(sched, |task| {
        matches!(
            task.ty,
            TaskType::Kick1
                | TaskType::Kick2
                | TaskType::Timestep
                | TaskType::ExtraGhost
                | TaskType::Cooling
                | TaskType::SourceTerms
                | TaskType::GravUp
                | TaskType::GravDown
                | TaskType::GravMm
                | TaskType::GravGatherM
                | TaskType::GravFft
        ) || matches!(
            task.subtype,
            TaskSubtype::Gradient
                | TaskSubtype::Force
                | TaskSubtype::Grav
                | TaskSubtype::ExternalGrav
                | TaskSubtype::Rho
                | TaskSubtype::GradientComm
                | TaskSubtype::Tend
        )
    });
}

/// Run everything but the drift and the second half kick, to get the first
/// time-steps of freshly initialised particles.
pub fn skip_drift_and_kick2(sched: &Scheduler) {
    skip_if(sched, |task| matches!(task.ty, TaskType::Drift | TaskType::Kick2));
}

#[cfg(test)]
mod test {
    use glam::DVec3;

    use super::*;

    fn cell(x: f64, h_max: f64, dx_max: f64) -> Cell {
        let cell = Cell::new(DVec3::new(x, 0., 0.), DVec3::ONE, 0, None);
        cell.h_max.store(h_max);
        cell.dx_max.store(dx_max);
        cell
    }

    #[test]
    fn test_needs_rebuild() {
        assert!(!needs_rebuild(&cell(0., 0.3, 0.), &cell(1., 0.2, 0.), 0.1));
        // Smoothing length plus drift beyond the cell extent.
        assert!(needs_rebuild(&cell(0., 0.9, 0.02), &cell(1., 0.2, 0.09), 0.5));
        // Drift large compared to the smoothing length.
        assert!(needs_rebuild(&cell(0., 0.3, 0.05), &cell(1., 0.3, 0.), 0.1));
    }

    #[test]
    fn test_skip_filters() {
        let mut sched = Scheduler::new(1, false);
        sched.reset(8);
        let drift = sched.add_task(TaskType::Drift, TaskSubtype::None, 0, 0, Some(0), None, false);
        let density = sched.add_task(TaskType::SelfInteraction, TaskSubtype::Density, 0, 0, Some(0), None, false);
        let force = sched.add_task(TaskType::SelfInteraction, TaskSubtype::Force, 0, 0, Some(0), None, false);
        let kick2 = sched.add_task(TaskType::Kick2, TaskSubtype::None, 0, 0, Some(0), None, false);
        let kick1 = sched.add_task(TaskType::Kick1, TaskSubtype::None, 0, 0, Some(0), None, false);
        let activate_all = |sched: &Scheduler| (0..sched.nr_tasks()).for_each(|t| sched.activate(t));

        activate_all(&sched);
        skip_force_and_kick(&sched);
        let active = |t: TaskId| !sched.tasks[t].is_skipped();
        assert!(active(drift) && active(density));
        assert!(!active(force) && !active(kick2) && !active(kick1));

        activate_all(&sched);
        skip_drift_and_kick2(&sched);
        assert!(!active(drift) && !active(kick2));
        assert!(active(density) && active(force) && active(kick1));
    }
}
