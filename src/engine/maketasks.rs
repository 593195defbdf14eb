//! Construction of the task graph over the current cell hierarchy.

use crate::{
    cell::{Cell, CellId, CellTasks},
    config::Policy,
    link::LinkTable,
    macros::fatal,
    proxy::Proxy,
    scheduler::Scheduler,
    space::{stencil, Space},
    task::{TaskId, TaskSubtype, TaskType},
};

use super::Engine;

impl Engine {
    /// Rebuild the task graph from scratch: interactions, hierarchical
    /// tasks, sorts and the communication with the neighbouring ranks.
    pub(super) fn maketasks(&mut self) {
        let three_loop = self.config.policy.hydro_scheme.has_gradient_loop();
        let nr_cells = self.space.cells.len();
        let nr_sends: usize = self.proxies.iter().map(|p| p.cells_out.len()).sum();
        let links = LinkTable::new(LinkTable::required_size(nr_cells, three_loop) + 4 * nr_sends);
        self.sched.reset(self.config.scheduler.max_tasks_per_cell * nr_cells);
        for cell in self.space.cells.iter_mut() {
            cell.clear_tasks();
        }

        let mut builder = TaskBuilder {
            space: &mut self.space,
            sched: &mut self.sched,
            links: &links,
            policy: self.config.policy,
            rank: self.rank,
            gather: None,
            fft: None,
        };
        builder.build(&self.proxies);
        self.links = links;

        self.sched.set_unlocks();
        self.sched.rank_tasks();
        self.sched.reweight(&self.space.cells);
        self.sched.set_owners(&self.space.cells);
        tracing::info!(
            "[{:04}] Created {} tasks, {} dependencies and {} links.",
            self.rank,
            self.sched.nr_tasks(),
            self.sched.nr_unlocks(),
            self.links.len()
        );
    }
}

struct TaskBuilder<'a> {
    space: &'a mut Space,
    sched: &'a mut Scheduler,
    links: &'a LinkTable,
    policy: Policy,
    rank: usize,
    gather: Option<TaskId>,
    fft: Option<TaskId>,
}

/// Ids of all cells in the subtree of `cid`, depth first.
fn subtree(cells: &[Cell], cid: CellId, out: &mut Vec<CellId>) {
    out.push(cid);
    for child in cells[cid].progeny_ids() {
        subtree(cells, child, out);
    }
}

/// Super cells with hierarchical tasks in the subtree of `cid`.
fn supers_below(cells: &[Cell], cid: CellId, out: &mut Vec<CellId>) {
    if cells[cid].super_cell == Some(cid) {
        if cells[cid].tasks.drift.is_some() {
            out.push(cid);
        }
        return;
    }
    for child in cells[cid].progeny_ids() {
        supers_below(cells, child, out);
    }
}

/// The super cell of a subtree is the first cell on the way down that holds
/// density tasks, or its leaf. With gravity all hierarchical tasks live on
/// the top-level cells.
fn set_super_cell(cells: &mut [Cell], cid: CellId, mut super_cell: Option<CellId>, force_here: bool) {
    if super_cell.is_none() && (force_here || !cells[cid].split || !cells[cid].links.density.is_empty()) {
        super_cell = Some(cid);
    }
    cells[cid].super_cell = super_cell;
    let progeny = cells[cid].progeny;
    for child in progeny.into_iter().flatten() {
        set_super_cell(cells, child, super_cell, false);
    }
}

impl TaskBuilder<'_> {
    fn build(&mut self, proxies: &[Proxy]) {
        if self.policy.hydro {
            self.make_hydro_tasks();
        }
        if self.policy.self_gravity {
            self.make_gravity_tasks();
        }
        if self.policy.external_gravity {
            self.make_external_gravity_tasks();
        }
        self.sched.split_tasks(self.space);
        self.link_interactions();

        for cid in 0..self.space.nr_cells {
            set_super_cell(&mut self.space.cells, cid, None, self.policy.gravity());
        }
        self.make_hierarchical_tasks();
        if self.policy.hydro {
            self.make_sort_tasks();
            self.wire_hydro();
        }
        self.wire_gravity();
        if self.policy.hydro {
            self.make_comm_tasks(proxies);
        }
        self.check_interactions();
    }

    fn is_local(&self, cid: CellId) -> bool {
        self.space.cells[cid].node_id == self.rank
    }

    fn add(&mut self, ty: TaskType, subtype: TaskSubtype, ci: CellId) -> TaskId {
        self.sched.add_task(ty, subtype, 0, 0, Some(ci), None, false)
    }

    fn unlock(&mut self, ta: Option<TaskId>, tb: Option<TaskId>) {
        if let (Some(ta), Some(tb)) = (ta, tb) {
            self.sched.add_unlock(ta, tb);
        }
    }

    fn super_tasks(&self, cid: CellId) -> CellTasks {
        match self.space.cells[cid].super_cell {
            Some(s) => self.space.cells[s].tasks.clone(),
            None => fatal!("Cell {} has no super cell.", cid),
        }
    }

    /// One self task per local top-level cell and one pair task per
    /// neighbouring pair with at least one local side.
    fn make_hydro_tasks(&mut self) {
        for cid in 0..self.space.nr_cells {
            if self.space.cells[cid].count == 0 {
                continue;
            }
            let local_i = self.is_local(cid);
            if local_i {
                self.add(TaskType::SelfInteraction, TaskSubtype::Density, cid);
            }
            for offset in stencil() {
                let Some(cjd) = self.space.neighbour(cid, offset) else {
                    continue;
                };
                if cjd <= cid || self.space.cells[cjd].count == 0 || !(local_i || self.is_local(cjd)) {
                    continue;
                }
                let (sid, _) = self.space.pair_geometry(cid, cjd);
                self.sched.add_task(
                    TaskType::Pair,
                    TaskSubtype::Density,
                    sid as u32,
                    0,
                    Some(cid),
                    Some(cjd),
                    true,
                );
            }
        }
    }

    /// Direct gravity between local neighbours, the long-range multipole
    /// interaction and the global gather and mesh tasks.
    fn make_gravity_tasks(&mut self) {
        let gather = self
            .sched
            .add_task(TaskType::GravGatherM, TaskSubtype::None, 0, 0, None, None, false);
        let fft = self
            .sched
            .add_task(TaskType::GravFft, TaskSubtype::None, 0, 0, None, None, false);
        self.sched.add_unlock(gather, fft);
        self.gather = Some(gather);
        self.fft = Some(fft);

        for cid in 0..self.space.nr_cells {
            if !self.is_local(cid) || self.space.cells[cid].gcount == 0 {
                continue;
            }
            self.add(TaskType::SelfInteraction, TaskSubtype::Grav, cid);
            self.add(TaskType::GravMm, TaskSubtype::None, cid);
            for offset in stencil() {
                let Some(cjd) = self.space.neighbour(cid, offset) else {
                    continue;
                };
                if cjd <= cid || !self.is_local(cjd) || self.space.cells[cjd].gcount == 0 {
                    continue;
                }
                let (sid, _) = self.space.pair_geometry(cid, cjd);
                self.sched.add_task(
                    TaskType::Pair,
                    TaskSubtype::Grav,
                    sid as u32,
                    0,
                    Some(cid),
                    Some(cjd),
                    true,
                );
            }
        }
    }

    fn make_external_gravity_tasks(&mut self) {
        for cid in 0..self.space.nr_cells {
            if self.is_local(cid) && self.space.cells[cid].gcount > 0 {
                self.add(TaskType::SelfInteraction, TaskSubtype::ExternalGrav, cid);
            }
        }
    }

    fn link_interactions(&mut self) {
        let cells = &self.space.cells;
        for (tid, task) in self.sched.tasks.iter().enumerate() {
            if task.ty == TaskType::None {
                continue;
            }
            for cid in [task.ci, task.cj].into_iter().flatten() {
                match task.subtype {
                    TaskSubtype::Density => self.links.add(&cells[cid].links.density, tid),
                    TaskSubtype::Grav => self.links.add(&cells[cid].links.grav, tid),
                    _ => {}
                }
            }
        }
    }

    /// Init, drift, kicks and time-step on every local super cell, plus the
    /// ghosts and the optional physics of the configuration.
    fn make_hierarchical_tasks(&mut self) {
        let three_loop = self.policy.hydro_scheme.has_gradient_loop();
        for cid in 0..self.space.cells.len() {
            let cell = &self.space.cells[cid];
            if cell.super_cell != Some(cid) || !self.is_local(cid) || cell.total_count() == 0 {
                continue;
            }
            let (count, gcount, top_level) = (cell.count, cell.gcount, cell.parent.is_none());

            let mut tasks = CellTasks {
                init: Some(self.add(TaskType::Init, TaskSubtype::None, cid)),
                drift: Some(self.add(TaskType::Drift, TaskSubtype::None, cid)),
                kick2: Some(self.add(TaskType::Kick2, TaskSubtype::None, cid)),
                timestep: Some(self.add(TaskType::Timestep, TaskSubtype::None, cid)),
                kick1: Some(self.add(TaskType::Kick1, TaskSubtype::None, cid)),
                ..Default::default()
            };
            self.unlock(tasks.init, tasks.drift);
            self.unlock(tasks.drift, tasks.kick2);
            self.unlock(tasks.kick2, tasks.timestep);
            self.unlock(tasks.timestep, tasks.kick1);

            if self.policy.hydro && count > 0 {
                tasks.ghost = Some(self.add(TaskType::Ghost, TaskSubtype::None, cid));
                self.unlock(tasks.drift, tasks.ghost);
                let last_ghost = if three_loop {
                    tasks.extra_ghost = Some(self.add(TaskType::ExtraGhost, TaskSubtype::None, cid));
                    self.unlock(tasks.ghost, tasks.extra_ghost);
                    tasks.extra_ghost
                } else {
                    tasks.ghost
                };
                if self.policy.cooling {
                    tasks.cooling = Some(self.add(TaskType::Cooling, TaskSubtype::None, cid));
                    self.unlock(last_ghost, tasks.cooling);
                    self.unlock(tasks.cooling, tasks.kick2);
                } else {
                    self.unlock(last_ghost, tasks.kick2);
                }
            }
            if self.policy.source_terms {
                tasks.sourceterms = Some(self.add(TaskType::SourceTerms, TaskSubtype::None, cid));
                self.unlock(tasks.drift, tasks.sourceterms);
                self.unlock(tasks.sourceterms, tasks.kick2);
            }
            if self.policy.self_gravity && top_level && gcount > 0 {
                tasks.grav_up = Some(self.add(TaskType::GravUp, TaskSubtype::None, cid));
                self.unlock(tasks.init, tasks.grav_up);
                self.unlock(tasks.drift, tasks.grav_up);
                self.unlock(tasks.grav_up, self.gather);
            }
            self.space.cells[cid].tasks = tasks;
        }
    }

    /// Sort tasks for both cells of every density pair.
    fn make_sort_tasks(&mut self) {
        let pairs: Vec<(TaskId, CellId, CellId, u32)> = self
            .sched
            .tasks
            .iter()
            .enumerate()
            .filter(|(_, t)| t.ty == TaskType::Pair && t.subtype == TaskSubtype::Density)
            .filter_map(|(tid, t)| Some((tid, t.ci?, t.cj?, t.flags())))
            .collect();
        for (tid, ci, cj, sid) in pairs {
            let si = self.add_sort(ci, 1 << sid);
            let sj = self.add_sort(cj, 1 << sid);
            self.sched.add_unlock(si, tid);
            self.sched.add_unlock(sj, tid);
        }

        // Local sorts run on drifted particles.
        for cid in 0..self.space.cells.len() {
            let Some(sort) = self.space.cells[cid].tasks.sorts else {
                continue;
            };
            if self.is_local(cid) {
                let drift = self.super_tasks(cid).drift;
                self.unlock(drift, Some(sort));
            }
        }
    }

    /// The sort task of `cid`, created with the sorts of its progeny on
    /// first use.
    fn add_sort(&mut self, cid: CellId, flags: u32) -> TaskId {
        if let Some(sort) = self.space.cells[cid].tasks.sorts {
            self.sched.tasks[sort]
                .flags
                .fetch_or(flags, std::sync::atomic::Ordering::Relaxed);
            return sort;
        }
        let sort = self.sched.add_task(TaskType::Sort, TaskSubtype::None, flags, 0, Some(cid), None, false);
        self.space.cells[cid].tasks.sorts = Some(sort);
        let progeny = self.space.cells[cid].progeny;
        for child in progeny.into_iter().flatten() {
            if self.space.cells[child].count > 0 {
                let child_sort = self.add_sort(child, flags);
                self.sched.add_unlock(child_sort, sort);
            }
        }
        sort
    }

    /// Duplicate the density tasks into the gradient and force loops and tie
    /// all loops to the hierarchical tasks of the local super cells.
    fn wire_hydro(&mut self) {
        let three_loop = self.policy.hydro_scheme.has_gradient_loop();
        let density: Vec<TaskId> = (0..self.sched.nr_tasks())
            .filter(|&t| {
                let task = &self.sched.tasks[t];
                task.subtype == TaskSubtype::Density && task.ty != TaskType::None
            })
            .collect();

        for tid in density {
            let task = &self.sched.tasks[tid];
            let (ty, ci, cj, flags, tight) = (task.ty, task.ci, task.cj, task.flags(), task.tight);
            let gradient = three_loop.then(|| {
                self.sched
                    .add_task(ty, TaskSubtype::Gradient, flags, 0, ci, cj, tight)
            });
            let force = self.sched.add_task(ty, TaskSubtype::Force, flags, 0, ci, cj, tight);

            for cid in [ci, cj].into_iter().flatten() {
                let cell = &self.space.cells[cid];
                if let Some(g) = gradient {
                    self.links.add(&cell.links.gradient, g);
                }
                self.links.add(&cell.links.force, force);
                if !self.is_local(cid) {
                    continue;
                }
                let st = self.super_tasks(cid);
                if st.ghost.is_none() {
                    fatal!("Super cell of cell {} has no ghost task.", cid);
                }
                self.unlock(st.drift, Some(tid));
                self.unlock(Some(tid), st.ghost);
                match gradient {
                    Some(g) => {
                        self.unlock(st.ghost, Some(g));
                        self.unlock(Some(g), st.extra_ghost);
                        self.unlock(st.extra_ghost, Some(force));
                    }
                    None => self.unlock(st.ghost, Some(force)),
                }
                match st.cooling {
                    Some(cooling) => self.sched.add_unlock(force, cooling),
                    None => self.unlock(Some(force), st.kick2),
                }
            }
        }
    }

    fn wire_gravity(&mut self) {
        for tid in 0..self.sched.nr_tasks() {
            let task = &self.sched.tasks[tid];
            let (ty, subtype, ci, cj) = (task.ty, task.subtype, task.ci, task.cj);
            match (ty, subtype) {
                (TaskType::SelfInteraction | TaskType::Pair, TaskSubtype::Grav) => {
                    for cid in [ci, cj].into_iter().flatten() {
                        let st = self.super_tasks(cid);
                        self.unlock(st.grav_up, Some(tid));
                        self.unlock(Some(tid), st.kick2);
                    }
                }
                (TaskType::GravMm, _) => {
                    let Some(cid) = ci else {
                        fatal!("Multipole task {} without a cell.", tid);
                    };
                    let st = self.super_tasks(cid);
                    self.unlock(st.grav_up, Some(tid));
                    self.unlock(self.gather, Some(tid));
                    self.unlock(self.fft, Some(tid));
                    self.unlock(Some(tid), st.kick2);
                }
                (TaskType::SelfInteraction, TaskSubtype::ExternalGrav) => {
                    let Some(cid) = ci else {
                        fatal!("External gravity task {} without a cell.", tid);
                    };
                    let st = self.super_tasks(cid);
                    self.unlock(st.init, Some(tid));
                    self.unlock(st.drift, Some(tid));
                    self.unlock(Some(tid), st.kick2);
                }
                _ => {}
            }
        }
    }

    fn make_comm_tasks(&mut self, proxies: &[Proxy]) {
        for proxy in proxies {
            let Some(&remote) = proxy.cells_in.first() else {
                fatal!("Proxy to rank {} has no foreign cells.", proxy.node_id);
            };
            for &cid in proxy.cells_out.iter() {
                self.add_send_tasks(cid, remote);
            }
            for &cid in proxy.cells_in.iter() {
                self.add_recv_tasks(cid);
            }
        }
    }

    /// Send tasks of the local cell `cid` to the rank owning `remote`.
    fn add_send_tasks(&mut self, cid: CellId, remote: CellId) {
        let three_loop = self.policy.hydro_scheme.has_gradient_loop();
        let tag = 4 * self.space.cells[cid].tag;
        let send = |builder: &mut Self, subtype: TaskSubtype| {
            builder
                .sched
                .add_task(TaskType::Send, subtype, 0, tag + subtype.channel(), Some(cid), Some(remote), false)
        };
        let xv = send(self, TaskSubtype::Xv);
        let rho = send(self, TaskSubtype::Rho);
        let gradient = three_loop.then(|| send(self, TaskSubtype::GradientComm));
        let ti = send(self, TaskSubtype::Tend);

        let links = &self.space.cells[cid].links;
        self.links.add(&links.send_xv, xv);
        self.links.add(&links.send_rho, rho);
        if let Some(g) = gradient {
            self.links.add(&links.send_gradient, g);
        }
        self.links.add(&links.send_ti, ti);

        self.sched.add_unlock(xv, rho);
        match gradient {
            Some(g) => {
                self.sched.add_unlock(rho, g);
                self.sched.add_unlock(g, ti);
            }
            None => self.sched.add_unlock(rho, ti),
        }

        let mut supers = vec![];
        supers_below(&self.space.cells, cid, &mut supers);
        for s in supers {
            let st = self.space.cells[s].tasks.clone();
            self.unlock(st.drift, Some(xv));
            self.unlock(st.ghost, Some(rho));
            self.unlock(st.extra_ghost, gradient);
            self.unlock(st.timestep, Some(ti));
            // The particles leave before the kick changes them.
            self.unlock(Some(xv), st.kick2);
            self.unlock(Some(rho), st.kick2);
            self.unlock(gradient, st.kick2);
        }
    }

    /// Receive tasks of the foreign cell `cid`, ordered around the
    /// interactions of its subtree.
    fn add_recv_tasks(&mut self, cid: CellId) {
        let three_loop = self.policy.hydro_scheme.has_gradient_loop();
        let tag = 4 * self.space.cells[cid].tag;
        let recv = |builder: &mut Self, subtype: TaskSubtype| {
            builder
                .sched
                .add_task(TaskType::Recv, subtype, 0, tag + subtype.channel(), Some(cid), None, false)
        };
        let xv = recv(self, TaskSubtype::Xv);
        let rho = recv(self, TaskSubtype::Rho);
        let gradient = three_loop.then(|| recv(self, TaskSubtype::GradientComm));
        let ti = recv(self, TaskSubtype::Tend);
        let tasks = &mut self.space.cells[cid].tasks;
        tasks.recv_xv = Some(xv);
        tasks.recv_rho = Some(rho);
        tasks.recv_gradient = gradient;
        tasks.recv_ti = Some(ti);

        self.sched.add_unlock(xv, rho);
        match gradient {
            Some(g) => {
                self.sched.add_unlock(rho, g);
                self.sched.add_unlock(g, ti);
            }
            None => self.sched.add_unlock(rho, ti),
        }

        let mut cells = vec![];
        subtree(&self.space.cells, cid, &mut cells);
        let force_after = gradient.unwrap_or(rho);
        for c in cells {
            let cell = &self.space.cells[c];
            if let Some(sort) = cell.tasks.sorts {
                self.sched.add_unlock(xv, sort);
            }
            let density: Vec<TaskId> = self.links.iter(&cell.links.density).collect();
            let gradients: Vec<TaskId> = self.links.iter(&cell.links.gradient).collect();
            let forces: Vec<TaskId> = self.links.iter(&cell.links.force).collect();
            for t in density {
                self.sched.add_unlock(xv, t);
                self.sched.add_unlock(t, rho);
            }
            for t in gradients {
                self.sched.add_unlock(rho, t);
                self.unlock(Some(t), gradient);
            }
            for t in forces {
                self.sched.add_unlock(force_after, t);
                self.sched.add_unlock(t, ti);
            }
        }
    }

    fn check_interactions(&self) {
        let has = |subtype: TaskSubtype| {
            self.sched
                .tasks
                .iter()
                .any(|t| t.subtype == subtype && t.ty != TaskType::None)
        };
        if self.policy.hydro && !self.space.parts.is_empty() && !has(TaskSubtype::Density) {
            fatal!("Rank {} holds gas particles but has no hydro tasks.", self.rank);
        }
        if self.policy.self_gravity && !self.space.gparts.is_empty() && !has(TaskSubtype::Grav) {
            fatal!("Rank {} holds gravity particles but has no gravity tasks.", self.rank);
        }
    }
}
