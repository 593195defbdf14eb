//! Bodies of the send and receive tasks.
//!
//! Both sides of a transfer walk the same subtree: the foreign copy of a
//! cell has the exact layout of the local cell it shadows, so particle data
//! travels as a flat copy and cell data in depth-first order.

use std::sync::atomic::Ordering;

use crate::{
    cell::{CellId, CellTimeInfo},
    comm::{wire, CommExt, MsgContext},
    macros::fatal,
    part::Part,
    task::{Task, TaskSubtype},
    timeline::MAX_NR_TIMESTEPS,
};

use super::RunnerContext;

/// Depth-first times of a subtree. Only leaves are guaranteed fresh, cells
/// above the super cell get the reduction of their progeny.
fn collect_times(ctx: &RunnerContext, cid: CellId, out: &mut Vec<CellTimeInfo>) -> CellTimeInfo {
    let cell = &ctx.cells[cid];
    let index = out.len();
    out.push(CellTimeInfo::default());
    let info = if cell.split {
        let mut info = CellTimeInfo {
            ti_end_min: MAX_NR_TIMESTEPS,
            ti_end_max: 0,
            h_max: 0.,
        };
        for child in cell.progeny_ids() {
            let c = collect_times(ctx, child, out);
            info.ti_end_min = info.ti_end_min.min(c.ti_end_min);
            info.ti_end_max = info.ti_end_max.max(c.ti_end_max);
            info.h_max = info.h_max.max(c.h_max);
        }
        info
    } else {
        CellTimeInfo {
            ti_end_min: cell.ti_end_min.load(Ordering::Acquire),
            ti_end_max: cell.ti_end_max.load(Ordering::Acquire),
            h_max: cell.h_max.load(),
        }
    };
    out[index] = info;
    info
}

fn apply_times(ctx: &RunnerContext, cid: CellId, times: &mut impl Iterator<Item = CellTimeInfo>) {
    let cell = &ctx.cells[cid];
    let Some(info) = times.next() else {
        fatal!("Time-step message too short for the subtree of cell {}.", cid);
    };
    cell.ti_end_min.store(info.ti_end_min, Ordering::Release);
    cell.ti_end_max.store(info.ti_end_max, Ordering::Release);
    cell.h_max.store(info.h_max);
    for child in cell.progeny_ids() {
        apply_times(ctx, child, times);
    }
}

/// Refresh `h_max` and `dx_max` of a foreign subtree from freshly received
/// particles.
fn refresh_foreign(ctx: &RunnerContext, cid: CellId, parts: &[Part], base: usize) -> (f64, f64) {
    let cell = &ctx.cells[cid];
    let (mut h_max, mut dx_max) = (0f64, 0f64);
    if cell.split {
        for child in cell.progeny_ids() {
            let (h, dx) = refresh_foreign(ctx, child, parts, base);
            h_max = h_max.max(h);
            dx_max = dx_max.max(dx);
        }
    } else {
        let start = cell.part_offset - base;
        for part in parts[start..start + cell.count].iter() {
            h_max = h_max.max(part.h);
            dx_max = dx_max.max(part.x_diff.length());
        }
    }
    cell.h_max.store(h_max);
    cell.dx_max.store(dx_max);
    cell.sorted.store(0, Ordering::Release);
    (h_max, dx_max)
}

/// Ship the data of the local cell `ci` to the rank owning `task.cj`.
///
/// # Safety
/// The caller holds the hydro lock of `ci`.
pub unsafe fn send(ctx: &RunnerContext, task: &Task, ci: CellId) {
    let Some(cj) = task.cj else {
        fatal!("Send task for cell {} without a destination cell.", ci);
    };
    let dest = ctx.cells[cj].node_id;
    match task.subtype {
        TaskSubtype::Xv | TaskSubtype::Rho | TaskSubtype::GradientComm => {
            let parts = ctx.parts_of(ci).to_vec();
            tracing::trace!("Sending {} particles of cell {} to rank {} (tag {}).", parts.len(), ci, dest, task.tag);
            ctx.comm.send_vec(dest, MsgContext::Tasks, task.tag, parts);
        }
        TaskSubtype::Tend => {
            let mut times = vec![];
            collect_times(ctx, ci, &mut times);
            ctx.comm.send_vec(dest, MsgContext::Tasks, task.tag, times);
        }
        s => fatal!("Unexpected subtype {:?} for a send task.", s),
    }
}

/// Unpack a received message into the foreign cell `ci`.
///
/// # Safety
/// The caller holds the hydro lock of `ci`.
pub unsafe fn recv(ctx: &RunnerContext, task: &Task, ci: CellId, bytes: Vec<u8>) {
    let cell = &ctx.cells[ci];
    if !cell.foreign {
        fatal!("Receive task on local cell {}.", ci);
    }
    match task.subtype {
        TaskSubtype::Xv | TaskSubtype::Rho | TaskSubtype::GradientComm => {
            let Some(received) = wire::decode::<Vec<Part>>(&bytes) else {
                fatal!("Malformed particle message for receive task of cell {}.", ci);
            };
            let parts = ctx.parts_of(ci);
            if received.len() != parts.len() {
                fatal!(
                    "Received {} particles for foreign cell {} holding {}.",
                    received.len(),
                    ci,
                    parts.len()
                );
            }
            parts.clone_from_slice(&received);
            // Partner indices refer to the arrays of the sending rank.
            for part in parts.iter_mut() {
                part.gpart = None;
            }
            refresh_foreign(ctx, ci, parts, cell.part_offset);
            cell.ti_old.store(ctx.info.ti_current, Ordering::Release);
        }
        TaskSubtype::Tend => {
            let Some(times) = wire::decode::<Vec<CellTimeInfo>>(&bytes) else {
                fatal!("Malformed time-step message for receive task of cell {}.", ci);
            };
            apply_times(ctx, ci, &mut times.into_iter());
        }
        s => fatal!("Unexpected subtype {:?} for a receive task.", s),
    }
}
