//! Worker threads and the execution of individual tasks.

use std::{
    any::Any,
    collections::HashMap,
    marker::PhantomData,
    ops::Range,
    panic::{catch_unwind, resume_unwind, AssertUnwindSafe},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::JoinHandle,
};

use glam::DVec3;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    cell::{sort_id, Cell, CellId, SORT_DIRECTIONS},
    comm::{Communicator, MsgContext},
    gravity::Multipole,
    macros::fatal,
    part::{GPart, Part, SPart},
    physics::{Physics, SortedPair, StepInfo},
    scheduler::Scheduler,
    space::Space,
    task::{TaskId, TaskSubtype, TaskType},
    utils::nearest_image,
};

pub mod comms;
pub mod hierarchical;

type Job = dyn Fn(usize) + Sync;

#[derive(Default)]
struct PoolState {
    /// Job of the current launch, with its lifetime erased. Only valid while
    /// `launch` blocks.
    job: Option<&'static Job>,
    generation: u64,
    running: usize,
    shutdown: bool,
    panic: Option<Box<dyn Any + Send>>,
}

struct PoolShared {
    state: Mutex<PoolState>,
    launch_cond: Condvar,
    done_cond: Condvar,
}

/// Fixed pool of long-lived worker threads, parked between launches.
pub struct RunnerPool {
    shared: Arc<PoolShared>,
    handles: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for RunnerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunnerPool").field("nr_runners", &self.handles.len()).finish()
    }
}

impl RunnerPool {
    pub fn new(nr_runners: usize, rank: usize) -> Self {
        let shared = Arc::new(PoolShared {
            state: Mutex::new(PoolState::default()),
            launch_cond: Condvar::new(),
            done_cond: Condvar::new(),
        });
        let handles = (0..nr_runners.max(1))
            .map(|id| {
                let shared = Arc::clone(&shared);
                std::thread::Builder::new()
                    .name(format!("runner-{}-{}", rank, id))
                    .spawn(move || runner_thread(&shared, id))
                    .unwrap_or_else(|e| fatal!("Failed to create runner thread: {}", e))
            })
            .collect();
        Self { shared, handles }
    }

    pub fn nr_runners(&self) -> usize {
        self.handles.len()
    }

    /// Release every runner on `job` (called with the runner id) and block
    /// until all of them are parked again. A panic in a runner is re-raised
    /// on the calling thread.
    pub fn launch(&self, job: &(dyn Fn(usize) + Sync)) {
        // SAFETY: the reference is dropped from the shared state before this
        // function returns, and no runner touches it after decrementing
        // `running`, which we wait for below.
        let job: &'static Job = unsafe { std::mem::transmute::<&(dyn Fn(usize) + Sync), &'static Job>(job) };
        let mut state = self.shared.state.lock();
        state.job = Some(job);
        state.generation += 1;
        state.running = self.handles.len();
        self.shared.launch_cond.notify_all();
        while state.running > 0 {
            self.shared.done_cond.wait(&mut state);
        }
        state.job = None;
        if let Some(payload) = state.panic.take() {
            drop(state);
            resume_unwind(payload);
        }
    }
}

impl Drop for RunnerPool {
    fn drop(&mut self) {
        self.shared.state.lock().shutdown = true;
        self.shared.launch_cond.notify_all();
        for handle in self.handles.drain(..) {
            let _ = handle.join();
        }
    }
}

fn runner_thread(shared: &PoolShared, id: usize) {
    let mut seen = 0;
    loop {
        let job = {
            let mut state = shared.state.lock();
            while state.generation == seen && !state.shutdown {
                shared.launch_cond.wait(&mut state);
            }
            if state.shutdown {
                return;
            }
            seen = state.generation;
            state.job
        };
        let result = match job {
            Some(job) => catch_unwind(AssertUnwindSafe(|| job(id))),
            None => Ok(()),
        };
        let mut state = shared.state.lock();
        if let Err(payload) = result {
            state.panic.get_or_insert(payload);
        }
        state.running -= 1;
        if state.running == 0 {
            shared.done_cond.notify_all();
        }
    }
}

/// A mutable slice shared between runners. Runners only ever take disjoint
/// ranges, which the cell locks guarantee.
pub struct SharedSlice<'a, T> {
    ptr: *mut T,
    len: usize,
    _marker: PhantomData<&'a mut [T]>,
}

unsafe impl<T: Send> Send for SharedSlice<'_, T> {}
unsafe impl<T: Send> Sync for SharedSlice<'_, T> {}

impl<'a, T> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        Self {
            ptr: slice.as_mut_ptr(),
            len: slice.len(),
            _marker: PhantomData,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Safety
    /// No other reference to an element of `range` may be alive while the
    /// returned slice is in use.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn range_mut(&self, range: Range<usize>) -> &mut [T] {
        if range.start > range.end || range.end > self.len {
            fatal!("Range {:?} out of bounds for a shared slice of length {}.", range, self.len);
        }
        std::slice::from_raw_parts_mut(self.ptr.add(range.start), range.len())
    }
}

/// Particle arrays of one species, local and foreign.
pub struct Species<'a, T> {
    pub local: SharedSlice<'a, T>,
    pub foreign: SharedSlice<'a, T>,
}

impl<'a, T> Species<'a, T> {
    fn new(local: &'a mut [T], foreign: &'a mut [T]) -> Self {
        Self {
            local: SharedSlice::new(local),
            foreign: SharedSlice::new(foreign),
        }
    }
}

/// Everything the runners of one launch share.
pub struct RunnerContext<'a> {
    pub sched: &'a Scheduler,
    pub cells: &'a [Cell],
    pub parts: Species<'a, Part>,
    pub gparts: Species<'a, GPart>,
    pub sparts: Species<'a, SPart>,
    pub physics: &'a dyn Physics,
    pub comm: &'a dyn Communicator,
    pub info: StepInfo,
    pub dt_min: f64,
    pub dt_max: f64,
    pub dim: DVec3,
    pub periodic: bool,
    pub nr_top_cells: usize,
    /// Top-level multipoles collected by the gather task.
    pub multipoles: RwLock<Vec<Multipole>>,
    /// Messages of receive tasks that arrived before their cells could be locked.
    inbox: Mutex<HashMap<TaskId, Vec<u8>>>,
    abort: AtomicBool,
}

impl<'a> RunnerContext<'a> {
    pub fn new(
        sched: &'a Scheduler,
        space: &'a mut Space,
        physics: &'a dyn Physics,
        comm: &'a dyn Communicator,
        info: StepInfo,
        dt_bounds: (f64, f64),
    ) -> Self {
        let Space {
            dim,
            periodic,
            nr_cells,
            cells,
            parts,
            gparts,
            sparts,
            parts_foreign,
            gparts_foreign,
            sparts_foreign,
            ..
        } = space;
        Self {
            sched,
            cells,
            parts: Species::new(parts, parts_foreign),
            gparts: Species::new(gparts, gparts_foreign),
            sparts: Species::new(sparts, sparts_foreign),
            physics,
            comm,
            info,
            dt_min: dt_bounds.0,
            dt_max: dt_bounds.1,
            dim: *dim,
            periodic: *periodic,
            nr_top_cells: *nr_cells,
            multipoles: RwLock::new(vec![Multipole::default(); *nr_cells]),
            inbox: Mutex::new(HashMap::new()),
            abort: AtomicBool::new(false),
        }
    }

    /// # Safety
    /// The caller holds the hydro lock of `cid`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn parts_of(&self, cid: CellId) -> &mut [Part] {
        let cell = &self.cells[cid];
        let species = if cell.foreign { &self.parts.foreign } else { &self.parts.local };
        species.range_mut(cell.part_range())
    }

    /// # Safety
    /// The caller holds the gravity lock of `cid`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn gparts_of(&self, cid: CellId) -> &mut [GPart] {
        let cell = &self.cells[cid];
        let species = if cell.foreign { &self.gparts.foreign } else { &self.gparts.local };
        species.range_mut(cell.gpart_range())
    }

    /// # Safety
    /// The caller holds the hydro lock of `cid`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn sparts_of(&self, cid: CellId) -> &mut [SPart] {
        let cell = &self.cells[cid];
        let species = if cell.foreign { &self.sparts.foreign } else { &self.sparts.local };
        species.range_mut(cell.spart_range())
    }

    /// Periodic shift to add to positions in `cj` to bring them next to `ci`.
    pub fn shift(&self, ci: CellId, cj: CellId) -> DVec3 {
        if !self.periodic {
            return DVec3::ZERO;
        }
        let dx = self.cells[cj].centre() - self.cells[ci].centre();
        nearest_image(dx, self.dim) - dx
    }

    pub fn aborted(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Whether a queued task may be handed out. Receive tasks wait for their
    /// message.
    fn is_ready(&self, tid: TaskId) -> bool {
        let task = &self.sched.tasks[tid];
        if task.ty != TaskType::Recv {
            return true;
        }
        let mut inbox = self.inbox.lock();
        if inbox.contains_key(&tid) {
            return true;
        }
        let Some(ci) = task.ci else {
            fatal!("Receive task {} without a cell.", tid);
        };
        let source = self.cells[ci].node_id;
        match self.comm.try_recv(source, MsgContext::Tasks, task.tag) {
            Ok(Some(bytes)) => {
                inbox.insert(tid, bytes);
                true
            }
            Ok(None) => false,
            Err(e) => fatal!("Failed to test for message from rank {} (tag {}): {}", source, task.tag, e),
        }
    }

    fn take_message(&self, tid: TaskId) -> Vec<u8> {
        match self.inbox.lock().remove(&tid) {
            Some(bytes) => bytes,
            None => fatal!("Receive task {} ran without a message.", tid),
        }
    }
}

/// Main loop of one runner: fetch, execute and complete tasks until none are
/// left in this launch.
pub fn runner_main(ctx: &RunnerContext, qid: usize) {
    let sched = ctx.sched;
    while sched.waiting() > 0 && !ctx.aborted() {
        match sched.get_task(qid, ctx.cells, |tid| ctx.is_ready(tid)) {
            Some(tid) => {
                if let Err(payload) = catch_unwind(AssertUnwindSafe(|| run_task(ctx, tid))) {
                    ctx.abort.store(true, Ordering::Release);
                    resume_unwind(payload);
                }
                sched.tasks[tid].executions.fetch_add(1, Ordering::Relaxed);
                sched.done(tid, ctx.cells);
            }
            None => sched.sleep(),
        }
    }
}

fn run_task(ctx: &RunnerContext, tid: TaskId) {
    let task = &ctx.sched.tasks[tid];
    tracing::trace!("Running task {} ({}).", tid, task.label());
    let info = &ctx.info;
    let physics = ctx.physics;
    let ci = task.ci;

    // SAFETY: the scheduler only hands out a task once it holds the locks
    // that `lock_kinds` assigns to its type, which cover every particle
    // range accessed below.
    unsafe {
        match (task.ty, ci) {
            (TaskType::None | TaskType::GravDown, _) => {}
            (TaskType::SelfInteraction | TaskType::SubSelf, Some(ci)) => match task.subtype {
                s if s.is_hydro_loop() => dosub_self_hydro(ctx, s, ci),
                TaskSubtype::Grav => physics.self_gravity(ctx.gparts_of(ci), info),
                TaskSubtype::ExternalGrav => physics.external_gravity(ctx.gparts_of(ci), info),
                s => fatal!("Unexpected subtype {:?} for a self task.", s),
            },
            (TaskType::Pair | TaskType::SubPair, Some(ci)) => {
                let Some(cj) = task.cj else {
                    fatal!("Pair task {} without a second cell.", tid);
                };
                match task.subtype {
                    s if s.is_hydro_loop() => dosub_pair_hydro(ctx, s, ci, cj),
                    TaskSubtype::Grav => {
                        physics.pair_gravity(ctx.gparts_of(ci), ctx.gparts_of(cj), ctx.shift(ci, cj), info)
                    }
                    s => fatal!("Unexpected subtype {:?} for a pair task.", s),
                }
            }
            (TaskType::Sort, Some(ci)) => hierarchical::sort(ctx, ci, task.flags()),
            (TaskType::Init, Some(ci)) => hierarchical::init(ctx, ci),
            (TaskType::Ghost, Some(ci)) => physics.ghost(ctx.parts_of(ci), info),
            (TaskType::ExtraGhost, Some(ci)) => physics.extra_ghost(ctx.parts_of(ci), info),
            (TaskType::Drift, Some(ci)) => hierarchical::drift(ctx, ci),
            (TaskType::Kick1 | TaskType::Kick2, Some(ci)) => hierarchical::kick(ctx, ci),
            (TaskType::Timestep, Some(ci)) => hierarchical::timestep(ctx, ci),
            (TaskType::Cooling, Some(ci)) => physics.cooling(ctx.parts_of(ci), info),
            (TaskType::SourceTerms, Some(ci)) => physics.source_terms(ctx.parts_of(ci), ctx.sparts_of(ci), info),
            (TaskType::GravUp, Some(ci)) => {
                hierarchical::grav_up(ctx, ci);
            }
            (TaskType::GravMm, Some(ci)) => hierarchical::grav_mm(ctx, ci),
            (TaskType::GravGatherM, _) => hierarchical::gather_multipoles(ctx),
            (TaskType::GravFft, _) => physics.mesh_gravity(&ctx.multipoles.read(), info),
            (TaskType::Send, Some(ci)) => comms::send(ctx, task, ci),
            (TaskType::Recv, Some(ci)) => comms::recv(ctx, task, ci, ctx.take_message(tid)),
            (ty, None) => fatal!("Task {} of type {:?} has no cell.", tid, ty),
        }
    }
}

/// Self interaction over the subtree of `ci`, recursing into the progeny of
/// split cells.
///
/// # Safety
/// The caller holds the hydro lock of `ci`.
unsafe fn dosub_self_hydro(ctx: &RunnerContext, stage: TaskSubtype, ci: CellId) {
    let cell = &ctx.cells[ci];
    if cell.count == 0 {
        return;
    }
    if !cell.split {
        ctx.physics.self_hydro(stage, ctx.parts_of(ci), &ctx.info);
        return;
    }
    let progeny: Vec<CellId> = cell.progeny_ids().filter(|&p| ctx.cells[p].count > 0).collect();
    for (k, &pj) in progeny.iter().enumerate() {
        dosub_self_hydro(ctx, stage, pj);
        for &pk in progeny[k + 1..].iter() {
            dosub_pair_hydro(ctx, stage, pj, pk);
        }
    }
}

/// Pair interaction between the subtrees of `ci` and `cj`, recursing into
/// neighbouring progeny while the smoothing lengths allow it.
///
/// # Safety
/// The caller holds the hydro locks of `ci` and `cj`.
unsafe fn dosub_pair_hydro(ctx: &RunnerContext, stage: TaskSubtype, ci: CellId, cj: CellId) {
    let (cell_i, cell_j) = (&ctx.cells[ci], &ctx.cells[cj]);
    if cell_i.count == 0 || cell_j.count == 0 {
        return;
    }
    if cell_i.split && cell_j.split && crate::scheduler::can_split_pair(cell_i, cell_j) {
        for pi in cell_i.progeny_ids() {
            for pj in cell_j.progeny_ids() {
                if ctx.cells[pi].is_neighbour(&ctx.cells[pj], ctx.dim, ctx.periodic) {
                    dosub_pair_hydro(ctx, stage, pi, pj);
                }
            }
        }
        return;
    }
    let shift = ctx.shift(ci, cj);
    let sid = sort_id(cell_j.centre() + shift - cell_i.centre(), 1e-6 * cell_i.width.min_element());
    let bit = 1 << sid;
    if cell_i.sorted.load(Ordering::Acquire) & bit != 0 && cell_j.sorted.load(Ordering::Acquire) & bit != 0 {
        let (sort_i, sort_j) = (cell_i.sort.read(), cell_j.sort.read());
        let sorted = SortedPair {
            axis: DVec3::from_array(SORT_DIRECTIONS[sid]).normalize(),
            sort_i: &sort_i[sid],
            sort_j: &sort_j[sid],
        };
        ctx.physics
            .pair_hydro_sorted(stage, ctx.parts_of(ci), ctx.parts_of(cj), &sorted, shift, &ctx.info);
        return;
    }
    ctx.physics
        .pair_hydro(stage, ctx.parts_of(ci), ctx.parts_of(cj), shift, &ctx.info);
}
