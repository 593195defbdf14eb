use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
    time::Duration,
};

use parking_lot::{Condvar, Mutex};
use rand::seq::SliceRandom;

use crate::{
    cell::{try_lock_tree, unlock_tree, Cell, CellId, LockKind},
    macros::fatal,
    queue::Queue,
    space::Space,
    task::{Task, TaskId, TaskSubtype, TaskType, TASK_TYPE_COUNT},
};

/// Owner of the flat task array and the ready queues.
///
/// Construction (`add_task`, `add_unlock`, `set_unlocks`, `rank_tasks`,
/// `split_tasks`) needs exclusive access and happens between launches.
/// Execution (`start`, `get_task`, `done`) works through shared references.
#[derive(Debug)]
pub struct Scheduler {
    pub tasks: Vec<Task>,
    edges: Vec<(TaskId, TaskId)>,
    unlocks: Vec<TaskId>,
    /// Task ids in topological rank order.
    tasks_ind: Vec<TaskId>,
    queues: Vec<Queue>,
    waiting: AtomicUsize,
    next_queue: AtomicUsize,
    sleep_mutex: Mutex<()>,
    sleep_cond: Condvar,
    size: usize,
    steal: bool,
}

impl Scheduler {
    pub fn new(nr_queues: usize, steal: bool) -> Self {
        Self {
            tasks: vec![],
            edges: vec![],
            unlocks: vec![],
            tasks_ind: vec![],
            queues: (0..nr_queues.max(1)).map(|_| Queue::default()).collect(),
            waiting: AtomicUsize::new(0),
            next_queue: AtomicUsize::new(0),
            sleep_mutex: Mutex::new(()),
            sleep_cond: Condvar::new(),
            size: 0,
            steal,
        }
    }

    pub fn nr_queues(&self) -> usize {
        self.queues.len()
    }

    pub fn nr_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Drop all tasks and allow at most `size` new ones.
    pub fn reset(&mut self, size: usize) {
        self.tasks.clear();
        self.edges.clear();
        self.unlocks.clear();
        self.tasks_ind.clear();
        for queue in self.queues.iter() {
            queue.clear();
        }
        self.waiting.store(0, Ordering::Release);
        self.size = size;
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_task(
        &mut self,
        ty: TaskType,
        subtype: TaskSubtype,
        flags: u32,
        tag: u64,
        ci: Option<CellId>,
        cj: Option<CellId>,
        tight: bool,
    ) -> TaskId {
        if self.tasks.len() >= self.size {
            fatal!("Task table overflow (size {}).", self.size);
        }
        self.tasks.push(Task::new(ty, subtype, flags, tag, ci, cj, tight));
        self.tasks.len() - 1
    }

    /// Record that `tb` may only run once `ta` has completed.
    pub fn add_unlock(&mut self, ta: TaskId, tb: TaskId) {
        debug_assert!(ta < self.tasks.len() && tb < self.tasks.len());
        self.edges.push((ta, tb));
    }

    /// Pack the collected edges into per-task successor ranges.
    pub fn set_unlocks(&mut self) {
        let mut counts = vec![0usize; self.tasks.len() + 1];
        for &(ta, _) in self.edges.iter() {
            counts[ta + 1] += 1;
        }
        for k in 1..counts.len() {
            counts[k] += counts[k - 1];
        }
        let mut fill = counts.clone();
        self.unlocks = vec![0; self.edges.len()];
        for &(ta, tb) in self.edges.iter() {
            self.unlocks[fill[ta]] = tb;
            fill[ta] += 1;
        }
        for (tid, task) in self.tasks.iter_mut().enumerate() {
            task.unlocks = counts[tid]..counts[tid + 1];
        }
    }

    pub fn unlocks(&self, tid: TaskId) -> &[TaskId] {
        &self.unlocks[self.tasks[tid].unlocks.clone()]
    }

    pub fn nr_unlocks(&self) -> usize {
        self.unlocks.len()
    }

    /// Topologically rank the tasks (Kahn's algorithm). Tasks of rank `r`
    /// only depend on tasks of rank `< r`.
    pub fn rank_tasks(&mut self) {
        let nr_tasks = self.tasks.len();
        let mut wait = vec![0usize; nr_tasks];
        for &tb in self.unlocks.iter() {
            wait[tb] += 1;
        }
        let mut ready: VecDeque<TaskId> = (0..nr_tasks).filter(|&t| wait[t] == 0).collect();
        let mut ranks = vec![0usize; nr_tasks];
        let mut order = Vec::with_capacity(nr_tasks);
        while let Some(tid) = ready.pop_front() {
            order.push(tid);
            for k in self.tasks[tid].unlocks.clone() {
                let tb = self.unlocks[k];
                ranks[tb] = ranks[tb].max(ranks[tid] + 1);
                wait[tb] -= 1;
                if wait[tb] == 0 {
                    ready.push_back(tb);
                }
            }
        }
        if order.len() < nr_tasks {
            fatal!(
                "Unsatisfiable task dependencies detected ({} of {} tasks ranked).",
                order.len(),
                nr_tasks
            );
        }
        for (task, rank) in self.tasks.iter_mut().zip(ranks.into_iter()) {
            task.rank = rank;
        }
        order.sort_by_key(|&tid| self.tasks[tid].rank);
        self.tasks_ind = order;
    }

    /// Task ids in rank order.
    pub fn ranked(&self) -> &[TaskId] {
        &self.tasks_ind
    }

    /// Estimate the cost of every task and set its weight to the cost of the
    /// most expensive dependency chain starting at it.
    pub fn reweight(&mut self, cells: &[Cell]) {
        let nr_cells = cells.len() as i64;
        for task in self.tasks.iter_mut() {
            task.cost = task_cost(task, cells, nr_cells);
        }
        for k in (0..self.tasks_ind.len()).rev() {
            let tid = self.tasks_ind[k];
            let max_unlocked = self.tasks[tid]
                .unlocks
                .clone()
                .map(|u| self.tasks[self.unlocks[u]].weight)
                .max()
                .unwrap_or(0);
            self.tasks[tid].weight = self.tasks[tid].cost + max_unlocked;
        }
    }

    /// Break up self and pair tasks on split cells into finer tasks or mark
    /// them as sub tasks. Tasks that end up with nothing to do become
    /// [`TaskType::None`].
    pub fn split_tasks(&mut self, space: &Space) {
        let mut tid = 0;
        while tid < self.tasks.len() {
            if !self.split_task(tid, space) {
                tid += 1;
            }
        }
    }

    /// Returns true if `tid` was changed in place and must be looked at again.
    fn split_task(&mut self, tid: TaskId, space: &Space) -> bool {
        let cells = &space.cells;
        let (ty, subtype) = (self.tasks[tid].ty, self.tasks[tid].subtype);
        if subtype != TaskSubtype::Density {
            // Gravity interactions stay at the level they were created.
            if subtype == TaskSubtype::Grav && ty.is_self_like() {
                if let Some(ci) = self.tasks[tid].ci {
                    if cells[ci].gcount == 0 {
                        self.tasks[tid].ty = TaskType::None;
                    }
                }
            }
            return false;
        }

        match ty {
            TaskType::SelfInteraction => {
                let Some(ci) = self.tasks[tid].ci else {
                    return false;
                };
                let cell = &cells[ci];
                if cell.count == 0 {
                    self.tasks[tid].ty = TaskType::None;
                    return false;
                }
                if !cell.split {
                    return false;
                }
                if cell.count * cell.count < space.sub_size_self {
                    self.tasks[tid].ty = TaskType::SubSelf;
                    return false;
                }

                let progeny: Vec<CellId> = cell.progeny_ids().filter(|&p| cells[p].count > 0).collect();
                let Some((&first, rest)) = progeny.split_first() else {
                    self.tasks[tid].ty = TaskType::None;
                    return false;
                };
                self.tasks[tid].ci = Some(first);
                for &p in rest {
                    self.add_task(TaskType::SelfInteraction, subtype, 0, 0, Some(p), None, false);
                }
                for (j, &pj) in progeny.iter().enumerate() {
                    for &pk in progeny[j + 1..].iter() {
                        let (sid, _) = space.pair_geometry(pj, pk);
                        self.add_task(TaskType::Pair, subtype, sid as u32, 0, Some(pj), Some(pk), true);
                    }
                }
                true
            }
            TaskType::Pair => {
                let (Some(ci), Some(cj)) = (self.tasks[tid].ci, self.tasks[tid].cj) else {
                    return false;
                };
                let (cell_i, cell_j) = (&cells[ci], &cells[cj]);
                if cell_i.count == 0 || cell_j.count == 0 {
                    self.tasks[tid].ty = TaskType::None;
                    return false;
                }
                if !(cell_i.split && cell_j.split && can_split_pair(cell_i, cell_j)) {
                    return false;
                }
                if cell_i.count * cell_j.count < space.sub_size_pair {
                    self.tasks[tid].ty = TaskType::SubPair;
                    return false;
                }

                let mut pairs = vec![];
                for pi in cell_i.progeny_ids().filter(|&p| cells[p].count > 0) {
                    for pj in cell_j.progeny_ids().filter(|&p| cells[p].count > 0) {
                        if cells[pi].is_neighbour(&cells[pj], space.dim, space.periodic) {
                            pairs.push((pi, pj));
                        }
                    }
                }
                let Some((&(first_i, first_j), rest)) = pairs.split_first() else {
                    self.tasks[tid].ty = TaskType::None;
                    return false;
                };
                let (sid, _) = space.pair_geometry(first_i, first_j);
                let task = &mut self.tasks[tid];
                task.ci = Some(first_i);
                task.cj = Some(first_j);
                task.flags.store(sid as u32, Ordering::Relaxed);
                for &(pi, pj) in rest {
                    let (sid, _) = space.pair_geometry(pi, pj);
                    self.add_task(TaskType::Pair, subtype, sid as u32, 0, Some(pi), Some(pj), true);
                }
                true
            }
            _ => false,
        }
    }

    /// Mark a task as active for the coming launch.
    pub fn activate(&self, tid: TaskId) {
        self.tasks[tid].skip.store(false, Ordering::Release);
    }

    /// Number of tasks of the current launch that have not completed yet.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    /// Prepare a launch: derive the wait counters from the unskipped tasks
    /// and enqueue every task without pending predecessors.
    pub fn start(&self) {
        for task in self.tasks.iter() {
            task.wait.store(0, Ordering::Relaxed);
        }
        let mut nr_active = 0;
        for (tid, task) in self.tasks.iter().enumerate() {
            if task.is_skipped() {
                continue;
            }
            nr_active += 1;
            for &tb in self.unlocks(tid) {
                self.tasks[tb].wait.fetch_add(1, Ordering::AcqRel);
            }
        }
        self.waiting.store(nr_active, Ordering::Release);
        for &tid in self.tasks_ind.iter() {
            let task = &self.tasks[tid];
            if !task.is_skipped() && task.wait.load(Ordering::Acquire) == 0 {
                self.enqueue(tid);
            }
        }
    }

    fn enqueue(&self, tid: TaskId) {
        let task = &self.tasks[tid];
        let nr_queues = self.queues.len();
        let qid = match (task.ty, task.ci) {
            (TaskType::Send | TaskType::Recv | TaskType::GravGatherM | TaskType::GravFft, _) | (_, None) => {
                self.next_queue.fetch_add(1, Ordering::Relaxed) % nr_queues
            }
            (_, Some(_)) => task.owner % nr_queues,
        };
        tracing::trace!("Enqueueing task {} ({}) on queue {}.", tid, task.label(), qid);
        self.queues[qid].insert(tid, task.weight);
    }

    /// Fetch a runnable task for the worker of queue `qid`. A task is only
    /// handed out if `ready` accepts it and its cells can be locked.
    pub fn get_task(&self, qid: usize, cells: &[Cell], ready: impl Fn(TaskId) -> bool) -> Option<TaskId> {
        let try_take = |tid: TaskId| ready(tid) && self.try_lock_task(tid, cells);
        let qid = qid % self.queues.len();
        if let Some(tid) = self.queues[qid].get_task(try_take) {
            return Some(tid);
        }
        if !self.steal {
            return None;
        }
        let mut victims: Vec<usize> = (0..self.queues.len()).filter(|&q| q != qid).collect();
        victims.shuffle(&mut rand::thread_rng());
        for victim in victims {
            if let Some(tid) = self.queues[victim].get_task(try_take) {
                tracing::trace!("Queue {} stole task {} from queue {}.", qid, tid, victim);
                return Some(tid);
            }
        }
        None
    }

    /// Block the calling worker briefly until new work may be available.
    pub fn sleep(&self) {
        let mut guard = self.sleep_mutex.lock();
        if self.waiting() > 0 {
            self.sleep_cond.wait_for(&mut guard, Duration::from_millis(1));
        }
    }

    /// Complete `tid`: release its cells, re-skip it and enqueue every
    /// successor that has no pending predecessors left.
    pub fn done(&self, tid: TaskId, cells: &[Cell]) {
        self.unlock_task(tid, cells);
        let task = &self.tasks[tid];
        task.skip.store(true, Ordering::Release);
        for &tb in self.unlocks(tid) {
            let successor = &self.tasks[tb];
            if successor.wait.fetch_sub(1, Ordering::AcqRel) == 1 && !successor.is_skipped() {
                self.enqueue(tb);
            }
        }
        self.waiting.fetch_sub(1, Ordering::AcqRel);
        let _guard = self.sleep_mutex.lock();
        self.sleep_cond.notify_all();
    }

    fn try_lock_task(&self, tid: TaskId, cells: &[Cell]) -> bool {
        let task = &self.tasks[tid];
        match lock_kinds(task) {
            [] => true,
            kinds => {
                let mut taken: Vec<(CellId, LockKind)> = vec![];
                for &kind in kinds {
                    for cid in lock_targets(task).iter().flatten() {
                        if try_lock_tree(cells, *cid, kind) {
                            taken.push((*cid, kind));
                        } else {
                            for &(c, k) in taken.iter() {
                                unlock_tree(cells, c, k);
                            }
                            return false;
                        }
                    }
                }
                true
            }
        }
    }

    fn unlock_task(&self, tid: TaskId, cells: &[Cell]) {
        let task = &self.tasks[tid];
        for &kind in lock_kinds(task) {
            for cid in lock_targets(task).iter().flatten() {
                unlock_tree(cells, *cid, kind);
            }
        }
    }

    /// Log the number of tasks per type and how many of them are skipped.
    pub fn print_task_counts(&self, rank: usize) -> [usize; TASK_TYPE_COUNT] {
        let mut counts = [0usize; TASK_TYPE_COUNT];
        let mut skipped = 0;
        for task in self.tasks.iter() {
            if task.is_skipped() {
                skipped += 1;
            } else {
                counts[usize::from(task.ty)] += 1;
            }
        }
        let summary: Vec<String> = counts
            .iter()
            .enumerate()
            .filter(|(_, &c)| c > 0)
            .map(|(ty, c)| format!("{}={}", crate::task::TASK_TYPE_NAMES[ty], c))
            .collect();
        tracing::info!(
            "[{:04}] task counts are [ {} ] (skipped={})",
            rank,
            summary.join(" "),
            skipped
        );
        counts
    }

    /// Set the queue owner of every task from its first cell.
    pub fn set_owners(&mut self, cells: &[Cell]) {
        for task in self.tasks.iter_mut() {
            task.owner = task.ci.map_or(0, |ci| cells[cells[ci].super_cell.unwrap_or(ci)].owner);
        }
    }
}

/// Progeny of two split cells can interact on their own only if the
/// interaction range fits inside half of the smaller cell.
pub fn can_split_pair(ci: &Cell, cj: &Cell) -> bool {
    let h_max = ci.h_max.load().max(cj.h_max.load());
    2. * h_max < 0.5 * ci.dmin.min(cj.dmin)
}

fn lock_kinds(task: &Task) -> &'static [LockKind] {
    use TaskType::*;
    match task.ty {
        SelfInteraction | SubSelf | Pair | SubPair => {
            if task.subtype.is_gravity() {
                &[LockKind::Gravity]
            } else {
                &[LockKind::Hydro]
            }
        }
        Sort | Ghost | ExtraGhost | Cooling | SourceTerms => &[LockKind::Hydro],
        Send | Recv if task.subtype != TaskSubtype::Tend => &[LockKind::Hydro],
        GravUp | GravMm => &[LockKind::Gravity],
        Init | Drift | Kick1 | Kick2 | Timestep => &[LockKind::Hydro, LockKind::Gravity],
        _ => &[],
    }
}

/// Communication tasks only touch their own cell, the second cell merely
/// names the remote rank.
fn lock_targets(task: &Task) -> [Option<CellId>; 2] {
    match task.ty {
        TaskType::Send | TaskType::Recv => [task.ci, None],
        _ => [task.ci, task.cj],
    }
}

fn task_cost(task: &Task, cells: &[Cell], nr_cells: i64) -> i64 {
    let count = |cid: Option<CellId>| -> i64 {
        cid.map_or(0, |c| {
            let cell = &cells[c];
            if task.subtype.is_gravity() || matches!(task.ty, TaskType::GravUp | TaskType::GravMm) {
                cell.gcount as i64
            } else {
                cell.count as i64
            }
        })
    };
    let ci = count(task.ci);
    match task.ty {
        TaskType::SelfInteraction | TaskType::SubSelf => ci * ci,
        TaskType::Pair | TaskType::SubPair => ci * count(task.cj),
        TaskType::Sort => (ci as f64 * (ci.max(1) as f64).ln()) as i64 + 1,
        TaskType::Send | TaskType::Recv => 10 * ci,
        TaskType::GravGatherM | TaskType::GravFft => nr_cells,
        TaskType::None => 0,
        _ => ci + 1,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn chain(sched: &mut Scheduler, n: usize) -> Vec<TaskId> {
        let ids: Vec<_> = (0..n)
            .map(|_| sched.add_task(TaskType::Init, TaskSubtype::None, 0, 0, None, None, false))
            .collect();
        for w in ids.windows(2) {
            sched.add_unlock(w[0], w[1]);
        }
        ids
    }

    #[test]
    fn test_rank_and_unlocks() {
        let mut sched = Scheduler::new(2, true);
        sched.reset(10);
        let ids = chain(&mut sched, 3);
        let extra = sched.add_task(TaskType::Ghost, TaskSubtype::None, 0, 0, None, None, false);
        sched.add_unlock(ids[0], extra);
        sched.set_unlocks();
        sched.rank_tasks();
        assert_eq!(sched.unlocks(ids[0]).len(), 2);
        assert_eq!(sched.tasks[ids[2]].rank, 2);
        assert_eq!(sched.tasks[extra].rank, 1);
        assert_eq!(sched.ranked()[0], ids[0]);
    }

    #[test]
    #[should_panic]
    fn test_cycle_is_fatal() {
        let mut sched = Scheduler::new(1, false);
        sched.reset(10);
        let ids = chain(&mut sched, 3);
        sched.add_unlock(ids[2], ids[0]);
        sched.set_unlocks();
        sched.rank_tasks();
    }

    #[test]
    #[should_panic]
    fn test_task_overflow_is_fatal() {
        let mut sched = Scheduler::new(1, false);
        sched.reset(2);
        chain(&mut sched, 3);
    }

    #[test]
    fn test_execution_honours_dependencies() {
        let mut sched = Scheduler::new(2, true);
        sched.reset(10);
        let ids = chain(&mut sched, 4);
        let skipped = sched.add_task(TaskType::Ghost, TaskSubtype::None, 0, 0, None, None, false);
        sched.add_unlock(ids[1], skipped);
        sched.set_unlocks();
        sched.rank_tasks();
        sched.reweight(&[]);
        assert!(sched.tasks[ids[0]].weight > sched.tasks[ids[3]].weight);

        for &tid in ids.iter() {
            sched.activate(tid);
        }
        sched.start();
        assert_eq!(sched.waiting(), 4);
        let mut order = vec![];
        while sched.waiting() > 0 {
            let tid = sched.get_task(0, &[], |_| true).expect("a ready task");
            assert_eq!(sched.tasks[tid].wait.load(Ordering::Acquire), 0);
            order.push(tid);
            sched.done(tid, &[]);
        }
        assert_eq!(order, ids);
        assert!(sched.tasks.iter().all(|t| t.is_skipped()));
    }
}
