use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use glam::DVec3;
use parking_lot::{Mutex, RwLock};

use crate::{
    gravity::Multipole,
    link::LinkHead,
    task::TaskId,
    timeline::{IntegerTime, MAX_NR_TIMESTEPS},
    utils::AtomicF64,
};

pub type CellId = usize;

/// Number of distinct pair orientations in the 3x3x3 neighbour stencil.
pub const NUM_SORT_DIRECTIONS: usize = 13;

/// Maps a neighbour offset `(ii, jj, kk)` in `{-1, 0, 1}^3`, flattened as
/// `(kk + 1) + 3 * ((jj + 1) + 3 * (ii + 1))`, onto its sort direction.
/// Opposite offsets share a direction.
pub const SORT_LIST_ID: [usize; 27] = [
    0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 0, 12, 11, 10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0,
];

/// Unit offsets of the 13 sort directions, in units of the cell width.
pub const SORT_DIRECTIONS: [[f64; 3]; NUM_SORT_DIRECTIONS] = [
    [-1., -1., -1.],
    [-1., -1., 0.],
    [-1., -1., 1.],
    [-1., 0., -1.],
    [-1., 0., 0.],
    [-1., 0., 1.],
    [-1., 1., -1.],
    [-1., 1., 0.],
    [-1., 1., 1.],
    [0., -1., -1.],
    [0., -1., 0.],
    [0., -1., 1.],
    [0., 0., -1.],
];

/// Sort direction of a neighbour at the (periodically wrapped) separation
/// `dx` of the cell centres.
pub fn sort_id(dx: DVec3, tolerance: f64) -> usize {
    let ind = dx.to_array().map(|d| {
        if d < -tolerance {
            0
        } else if d > tolerance {
            2
        } else {
            1
        }
    });
    SORT_LIST_ID[ind[2] + 3 * (ind[1] + 3 * ind[0])]
}

/// Which particle arrays a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    Hydro,
    Gravity,
}

#[derive(Debug, Clone, Copy)]
pub struct SortEntry {
    pub index: usize,
    pub d: f64,
}

/// Handles to the hierarchical and communication tasks attached to a cell.
#[derive(Debug, Default, Clone)]
pub struct CellTasks {
    pub init: Option<TaskId>,
    pub drift: Option<TaskId>,
    pub kick1: Option<TaskId>,
    pub kick2: Option<TaskId>,
    pub timestep: Option<TaskId>,
    pub ghost: Option<TaskId>,
    pub extra_ghost: Option<TaskId>,
    pub cooling: Option<TaskId>,
    pub sourceterms: Option<TaskId>,
    pub sorts: Option<TaskId>,
    pub grav_up: Option<TaskId>,
    pub recv_xv: Option<TaskId>,
    pub recv_rho: Option<TaskId>,
    pub recv_gradient: Option<TaskId>,
    pub recv_ti: Option<TaskId>,
}

/// Heads of the per-cell task lists in the link table.
#[derive(Debug, Default)]
pub struct CellLinks {
    pub density: LinkHead,
    pub gradient: LinkHead,
    pub force: LinkHead,
    pub grav: LinkHead,
    pub send_xv: LinkHead,
    pub send_rho: LinkHead,
    pub send_gradient: LinkHead,
    pub send_ti: LinkHead,
}

/// A node of the octree over the simulation volume.
///
/// Cells only reference contiguous slices of the particle arrays owned by
/// the space. Fields that tasks update while workers run are atomics.
#[derive(Debug)]
pub struct Cell {
    pub loc: DVec3,
    pub width: DVec3,
    pub depth: u32,
    pub parent: Option<CellId>,
    pub progeny: [Option<CellId>; 8],
    pub split: bool,
    pub super_cell: Option<CellId>,
    pub node_id: usize,
    /// Particles of this cell live in the foreign shadow arrays.
    pub foreign: bool,
    pub part_offset: usize,
    pub count: usize,
    pub gpart_offset: usize,
    pub gcount: usize,
    pub spart_offset: usize,
    pub scount: usize,
    /// Minimal extent of the cell, the safety distance for pair interactions.
    pub dmin: f64,
    pub owner: usize,
    pub tag: u64,
    pub sendto: u64,
    pub tasks: CellTasks,
    pub links: CellLinks,
    pub nr_tasks: AtomicUsize,
    pub h_max: AtomicF64,
    pub dx_max: AtomicF64,
    pub ti_end_min: AtomicU64,
    pub ti_end_max: AtomicU64,
    pub ti_old: AtomicU64,
    pub sorted: AtomicU32,
    pub updated: AtomicUsize,
    pub g_updated: AtomicUsize,
    pub s_updated: AtomicUsize,
    pub sort: RwLock<Vec<Vec<SortEntry>>>,
    pub multipole: Mutex<Multipole>,
    lock: AtomicBool,
    hold: AtomicU32,
    glock: AtomicBool,
    ghold: AtomicU32,
}

impl Cell {
    pub fn new(loc: DVec3, width: DVec3, depth: u32, parent: Option<CellId>) -> Self {
        Self {
            loc,
            width,
            depth,
            parent,
            progeny: [None; 8],
            split: false,
            super_cell: None,
            node_id: 0,
            foreign: false,
            part_offset: 0,
            count: 0,
            gpart_offset: 0,
            gcount: 0,
            spart_offset: 0,
            scount: 0,
            dmin: width.min_element(),
            owner: 0,
            tag: 0,
            sendto: 0,
            tasks: CellTasks::default(),
            links: CellLinks::default(),
            nr_tasks: AtomicUsize::new(0),
            h_max: AtomicF64::new(0.),
            dx_max: AtomicF64::new(0.),
            ti_end_min: AtomicU64::new(MAX_NR_TIMESTEPS),
            ti_end_max: AtomicU64::new(0),
            ti_old: AtomicU64::new(0),
            sorted: AtomicU32::new(0),
            updated: AtomicUsize::new(0),
            g_updated: AtomicUsize::new(0),
            s_updated: AtomicUsize::new(0),
            sort: RwLock::new(vec![vec![]; NUM_SORT_DIRECTIONS]),
            multipole: Mutex::new(Multipole::default()),
            lock: AtomicBool::new(false),
            hold: AtomicU32::new(0),
            glock: AtomicBool::new(false),
            ghold: AtomicU32::new(0),
        }
    }

    pub fn centre(&self) -> DVec3 {
        self.loc + 0.5 * self.width
    }

    /// A cell is active when its earliest particle time-step ends now.
    pub fn is_active(&self, ti_current: IntegerTime) -> bool {
        self.ti_end_min.load(Ordering::Acquire) == ti_current
    }

    pub fn is_local(&self, rank: usize) -> bool {
        self.node_id == rank
    }

    pub fn total_count(&self) -> usize {
        self.count + self.gcount + self.scount
    }

    pub fn part_range(&self) -> std::ops::Range<usize> {
        self.part_offset..self.part_offset + self.count
    }

    pub fn gpart_range(&self) -> std::ops::Range<usize> {
        self.gpart_offset..self.gpart_offset + self.gcount
    }

    pub fn spart_range(&self) -> std::ops::Range<usize> {
        self.spart_offset..self.spart_offset + self.scount
    }

    pub fn progeny_ids(&self) -> impl Iterator<Item = CellId> + '_ {
        self.progeny.iter().flatten().copied()
    }

    /// Whether `other` touches this cell, possibly through a periodic boundary.
    pub fn is_neighbour(&self, other: &Cell, box_size: DVec3, periodic: bool) -> bool {
        for k in 0..3 {
            let mut dx = (self.centre()[k] - other.centre()[k]).abs();
            if periodic {
                dx = dx.min(box_size[k] - dx);
            }
            let touch = 0.5 * (self.width[k] + other.width[k]);
            if dx > touch * (1. + 1e-9) {
                return false;
            }
        }
        true
    }

    fn lock_flags(&self, kind: LockKind) -> (&AtomicBool, &AtomicU32) {
        match kind {
            LockKind::Hydro => (&self.lock, &self.hold),
            LockKind::Gravity => (&self.glock, &self.ghold),
        }
    }

    /// Reset the per-rebuild state that tasks accumulate on this cell.
    pub fn clear_tasks(&mut self) {
        self.tasks = CellTasks::default();
        self.links = CellLinks::default();
        self.nr_tasks.store(0, Ordering::Relaxed);
    }
}

/// Try to lock the subtree rooted at `id` for exclusive access to its
/// particles. Fails if the cell or an ancestor is locked, or if a
/// descendant holds a lock.
pub fn try_lock_tree(cells: &[Cell], id: CellId, kind: LockKind) -> bool {
    let cell = &cells[id];
    let (lock, hold) = cell.lock_flags(kind);
    if hold.load(Ordering::SeqCst) > 0 {
        return false;
    }
    if lock
        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
        .is_err()
    {
        return false;
    }
    if hold.load(Ordering::SeqCst) > 0 {
        lock.store(false, Ordering::SeqCst);
        return false;
    }

    // Mark all ancestors as held, backing off if one of them is locked.
    let mut finger = cell.parent;
    while let Some(pid) = finger {
        let (plock, phold) = cells[pid].lock_flags(kind);
        phold.fetch_add(1, Ordering::SeqCst);
        if plock.load(Ordering::SeqCst) {
            release_holds(cells, cell.parent, Some(pid), kind);
            phold.fetch_sub(1, Ordering::SeqCst);
            lock.store(false, Ordering::SeqCst);
            return false;
        }
        finger = cells[pid].parent;
    }
    true
}

pub fn unlock_tree(cells: &[Cell], id: CellId, kind: LockKind) {
    let cell = &cells[id];
    let (lock, _) = cell.lock_flags(kind);
    debug_assert!(lock.load(Ordering::SeqCst), "Unlocking a cell that is not locked");
    lock.store(false, Ordering::SeqCst);
    release_holds(cells, cell.parent, None, kind);
}

/// Drop one hold from every ancestor from `from` up to (not including) `until`.
fn release_holds(cells: &[Cell], from: Option<CellId>, until: Option<CellId>, kind: LockKind) {
    let mut finger = from;
    while let Some(pid) = finger {
        if Some(pid) == until {
            break;
        }
        cells[pid].lock_flags(kind).1.fetch_sub(1, Ordering::SeqCst);
        finger = cells[pid].parent;
    }
}

/// Flat description of a cell and its subtree, exchanged between ranks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PCell {
    pub h_max: f64,
    pub dx_max: f64,
    pub ti_end_min: IntegerTime,
    pub ti_end_max: IntegerTime,
    pub count: usize,
    pub gcount: usize,
    pub scount: usize,
    pub tag: u64,
    /// Position of each child in the packed array relative to this entry.
    pub progeny: [Option<usize>; 8],
}

/// Time-step summary of a cell sent after its timestep task.
#[derive(Debug, Clone, Copy, Default)]
pub struct CellTimeInfo {
    pub ti_end_min: IntegerTime,
    pub ti_end_max: IntegerTime,
    pub h_max: f64,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_sort_id_is_shared_by_opposite_offsets() {
        for (k, direction) in SORT_DIRECTIONS.iter().enumerate() {
            let dx = DVec3::from_array(*direction);
            assert_eq!(sort_id(dx, 1e-6), k);
            assert_eq!(sort_id(-dx, 1e-6), k);
        }
    }

    fn tree() -> Vec<Cell> {
        let mut root = Cell::new(DVec3::ZERO, DVec3::ONE, 0, None);
        root.split = true;
        root.progeny[0] = Some(1);
        root.progeny[1] = Some(2);
        vec![
            root,
            Cell::new(DVec3::ZERO, DVec3::splat(0.5), 1, Some(0)),
            Cell::new(DVec3::new(0.5, 0., 0.), DVec3::splat(0.5), 1, Some(0)),
        ]
    }

    #[test]
    fn test_lock_tree() {
        let cells = tree();
        assert!(try_lock_tree(&cells, 1, LockKind::Hydro));
        // Siblings are independent, the parent is held.
        assert!(try_lock_tree(&cells, 2, LockKind::Hydro));
        assert!(!try_lock_tree(&cells, 0, LockKind::Hydro));
        // Gravity locks are separate.
        assert!(try_lock_tree(&cells, 0, LockKind::Gravity));
        assert!(!try_lock_tree(&cells, 1, LockKind::Gravity));
        unlock_tree(&cells, 1, LockKind::Hydro);
        unlock_tree(&cells, 2, LockKind::Hydro);
        assert!(try_lock_tree(&cells, 0, LockKind::Hydro));
        assert!(!try_lock_tree(&cells, 2, LockKind::Hydro));
    }

    #[test]
    fn test_neighbours() {
        let cells = tree();
        assert!(cells[1].is_neighbour(&cells[2], DVec3::ONE, false));
        let far = Cell::new(DVec3::new(2., 0., 0.), DVec3::splat(0.5), 1, None);
        assert!(!cells[1].is_neighbour(&far, DVec3::splat(4.), false));
        let wrapped = Cell::new(DVec3::new(3.5, 0., 0.), DVec3::splat(0.5), 1, None);
        assert!(cells[1].is_neighbour(&wrapped, DVec3::splat(4.), true));
    }
}
