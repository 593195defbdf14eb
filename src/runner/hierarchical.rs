//! Bodies of the tasks attached to super-cells, and of the gravity tasks
//! working on cell multipoles.
//!
//! Every function here takes the particle slices of its cell through
//! [`RunnerContext`] and requires the locks the scheduler takes for the
//! corresponding task type.

use std::sync::atomic::Ordering;

use crate::{
    cell::{CellId, SortEntry, SORT_DIRECTIONS},
    gravity::Multipole,
    macros::fatal,
    part::{GPart, Part, Particle, ParticleKind, PartnerLink, SPart},
    timeline::{get_integer_time_end, get_integer_timestep, get_time_bin, make_integer_timestep, IntegerTime, MAX_NR_TIMESTEPS},
    utils::nearest_image,
};

use super::RunnerContext;

/// Index of the gravity partner of a gas or star particle within a slice
/// starting at `base`.
fn local_index(global: usize, base: usize, len: usize) -> usize {
    match global.checked_sub(base) {
        Some(i) if i < len => i,
        _ => fatal!("Gravity partner {} lies outside of its cell ({}..{}).", global, base, base + len),
    }
}

/// Sort the particles of `ci` along every direction flagged in `flags` that
/// is not sorted yet.
///
/// # Safety
/// The caller holds the hydro lock of `ci`.
pub unsafe fn sort(ctx: &RunnerContext, ci: CellId, flags: u32) {
    let cell = &ctx.cells[ci];
    let parts = ctx.parts_of(ci);
    let todo = flags & !cell.sorted.load(Ordering::Acquire);
    if todo == 0 {
        return;
    }
    let mut sort = cell.sort.write();
    for (sid, direction) in SORT_DIRECTIONS.iter().enumerate() {
        if todo & (1 << sid) == 0 {
            continue;
        }
        let axis = glam::DVec3::from_array(*direction).normalize();
        let mut entries: Vec<SortEntry> = parts
            .iter()
            .enumerate()
            .map(|(index, p)| SortEntry { index, d: p.x.dot(axis) })
            .collect();
        entries.sort_by(|a, b| a.d.total_cmp(&b.d));
        sort[sid] = entries;
    }
    cell.sorted.fetch_or(todo, Ordering::AcqRel);
}

/// Reset the accumulators of the active particles of `ci`.
///
/// # Safety
/// The caller holds both locks of `ci`.
pub unsafe fn init(ctx: &RunnerContext, ci: CellId) {
    let ti_current = ctx.info.ti_current;
    for part in ctx.parts_of(ci).iter_mut().filter(|p| p.is_active(ti_current)) {
        part.rho = 0.;
        part.a_hydro = glam::DVec3::ZERO;
        part.u_dt = 0.;
    }
    for gpart in ctx.gparts_of(ci).iter_mut().filter(|g| g.is_active(ti_current)) {
        gpart.a_grav = glam::DVec3::ZERO;
    }
}

/// Move all particles of the subtree of `ci` to the current time.
///
/// # Safety
/// The caller holds both locks of `ci`.
pub unsafe fn drift(ctx: &RunnerContext, ci: CellId) {
    let cell = &ctx.cells[ci];
    let ti_old = cell.ti_old.load(Ordering::Acquire);
    let ti_current = ctx.info.ti_current;
    if ti_old > ti_current {
        fatal!("Cell {} was drifted to {} which lies in the future of {}.", ci, ti_old, ti_current);
    }
    let dt = ctx.info.timeline.dt(ti_current - ti_old);
    let (parts, gparts, sparts) = (ctx.parts_of(ci), ctx.gparts_of(ci), ctx.sparts_of(ci));
    let base = [cell.part_offset, cell.gpart_offset, cell.spart_offset];

    if dt > 0. {
        for part in parts.iter_mut() {
            part.drift(dt);
        }
        for spart in sparts.iter_mut() {
            spart.drift(dt);
        }
    }
    // Gravity partners follow their gas or star particle.
    for gpart in gparts.iter_mut() {
        match (gpart.kind, gpart.partner) {
            (ParticleKind::Gas, PartnerLink::Local(i)) => {
                let part = &parts[local_index(i, base[0], parts.len())];
                gpart.x = part.x;
                gpart.x_diff = part.x_diff;
            }
            (ParticleKind::Star, PartnerLink::Local(i)) => {
                let spart = &sparts[local_index(i, base[2], sparts.len())];
                gpart.x = spart.x;
                gpart.x_diff = spart.x_diff;
            }
            _ if dt > 0. => gpart.drift(dt),
            _ => {}
        }
    }
    drift_aggregates(ctx, ci, parts, base[0], ti_current);
}

/// Refresh `h_max`, `dx_max` and the drift time of the subtree of `cid`.
fn drift_aggregates(ctx: &RunnerContext, cid: CellId, parts: &[Part], base: usize, ti_current: IntegerTime) -> (f64, f64) {
    let cell = &ctx.cells[cid];
    let (mut h_max, mut dx_max) = (0f64, 0f64);
    if cell.split {
        for child in cell.progeny_ids() {
            let (h, dx) = drift_aggregates(ctx, child, parts, base, ti_current);
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
    // Sort lists stay valid as long as nothing moved.
    if cell.ti_old.swap(ti_current, Ordering::AcqRel) != ti_current {
        cell.sorted.store(0, Ordering::Release);
    }
    (h_max, dx_max)
}

/// Half kick of the active particles of `ci`, over half of their current
/// time-step.
///
/// # Safety
/// The caller holds both locks of `ci`.
pub unsafe fn kick(ctx: &RunnerContext, ci: CellId) {
    let cell = &ctx.cells[ci];
    let ti_current = ctx.info.ti_current;
    let half_dt = |bin| 0.5 * ctx.info.timeline.dt(get_integer_timestep(bin));
    let (parts, gparts, sparts) = (ctx.parts_of(ci), ctx.gparts_of(ci), ctx.sparts_of(ci));
    let gbase = cell.gpart_offset;
    let nr_gparts = gparts.len();

    for part in parts.iter_mut().filter(|p| p.is_active(ti_current)) {
        let dt = half_dt(part.time_bin);
        let mut a = part.a_hydro;
        let gpart = match part.gpart {
            Some(gi) => Some(&mut gparts[local_index(gi, gbase, nr_gparts)]),
            None => None,
        };
        if let Some(gpart) = &gpart {
            a += gpart.a_grav;
        }
        part.v += a * dt;
        part.u = (part.u + part.u_dt * dt).max(0.);
        if let Some(gpart) = gpart {
            gpart.v = part.v;
        }
    }
    for spart in sparts.iter_mut().filter(|s| s.is_active(ti_current)) {
        let dt = half_dt(spart.time_bin);
        if let Some(gi) = spart.gpart {
            let gpart = &mut gparts[local_index(gi, gbase, nr_gparts)];
            spart.v += gpart.a_grav * dt;
            gpart.v = spart.v;
        }
    }
    for gpart in gparts.iter_mut().filter(|g| !g.has_partner() && g.is_active(ti_current)) {
        let dt = half_dt(gpart.time_bin);
        gpart.v += gpart.a_grav * dt;
    }
}

/// Give the active particles of `ci` new time-steps and update the time
/// bounds of its subtree.
///
/// # Safety
/// The caller holds both locks of `ci`.
pub unsafe fn timestep(ctx: &RunnerContext, ci: CellId) {
    let cell = &ctx.cells[ci];
    let info = &ctx.info;
    let ti_current = info.ti_current;
    let (parts, gparts, sparts) = (ctx.parts_of(ci), ctx.gparts_of(ci), ctx.sparts_of(ci));
    let gbase = cell.gpart_offset;
    let nr_gparts = gparts.len();
    let new_bin = |dt: f64, old_bin| {
        let dt = dt.min(ctx.dt_max);
        if dt < ctx.dt_min {
            fatal!("Time-step {} is smaller than the minimal time-step {}.", dt, ctx.dt_min);
        }
        let dti = make_integer_timestep(dt, old_bin, ti_current, info.timeline.time_base_inv);
        if dti == 0 || dti > MAX_NR_TIMESTEPS {
            fatal!("Invalid integer time-step {} for dt = {}.", dti, dt);
        }
        get_time_bin(dti)
    };

    let (mut updated, mut g_updated, mut s_updated) = (0, 0, 0);
    for part in parts.iter_mut().filter(|p| p.is_active(ti_current)) {
        let mut dt = ctx.physics.part_timestep(part, info);
        let gpart = match part.gpart {
            Some(gi) => Some(&mut gparts[local_index(gi, gbase, nr_gparts)]),
            None => None,
        };
        if let Some(gpart) = &gpart {
            dt = dt.min(ctx.physics.gpart_timestep(gpart, info));
        }
        part.time_bin = new_bin(dt, part.time_bin);
        if let Some(gpart) = gpart {
            gpart.time_bin = part.time_bin;
            g_updated += 1;
        }
        updated += 1;
    }
    for spart in sparts.iter_mut().filter(|s| s.is_active(ti_current)) {
        let mut dt = ctx.physics.spart_timestep(spart, info);
        if let Some(gi) = spart.gpart {
            let gpart = &mut gparts[local_index(gi, gbase, nr_gparts)];
            dt = dt.min(ctx.physics.gpart_timestep(gpart, info));
            spart.time_bin = new_bin(dt, spart.time_bin);
            gpart.time_bin = spart.time_bin;
            g_updated += 1;
        } else {
            spart.time_bin = new_bin(dt, spart.time_bin);
        }
        s_updated += 1;
    }
    for gpart in gparts.iter_mut().filter(|g| !g.has_partner() && g.is_active(ti_current)) {
        let dt = ctx.physics.gpart_timestep(gpart, info);
        gpart.time_bin = new_bin(dt, gpart.time_bin);
        g_updated += 1;
    }

    cell.updated.store(updated, Ordering::Release);
    cell.g_updated.store(g_updated, Ordering::Release);
    cell.s_updated.store(s_updated, Ordering::Release);
    let base = [cell.part_offset, cell.gpart_offset, cell.spart_offset];
    time_aggregates(ctx, ci, (parts, gparts, sparts), base, ti_current);
}

/// Recompute `ti_end_min` and `ti_end_max` of the subtree of `cid`.
fn time_aggregates(
    ctx: &RunnerContext,
    cid: CellId,
    slices: (&[Part], &[GPart], &[SPart]),
    base: [usize; 3],
    ti_current: IntegerTime,
) -> (IntegerTime, IntegerTime) {
    let cell = &ctx.cells[cid];
    let (mut ti_end_min, mut ti_end_max) = (MAX_NR_TIMESTEPS, 0);
    if cell.split {
        for child in cell.progeny_ids() {
            let (min, max) = time_aggregates(ctx, child, slices, base, ti_current);
            ti_end_min = ti_end_min.min(min);
            ti_end_max = ti_end_max.max(max);
        }
    } else {
        let (parts, gparts, sparts) = slices;
        let (p, g, s) = (cell.part_offset - base[0], cell.gpart_offset - base[1], cell.spart_offset - base[2]);
        // Particles that just got a new step end one step after now.
        let end = |bin| get_integer_time_end(ti_current + 1, bin);
        let ends = parts[p..p + cell.count]
            .iter()
            .map(|x| end(x.time_bin))
            .chain(gparts[g..g + cell.gcount].iter().map(|x| end(x.time_bin)))
            .chain(sparts[s..s + cell.scount].iter().map(|x| end(x.time_bin)));
        for ti_end in ends {
            ti_end_min = ti_end_min.min(ti_end);
            ti_end_max = ti_end_max.max(ti_end);
        }
    }
    cell.ti_end_min.store(ti_end_min, Ordering::Release);
    cell.ti_end_max.store(ti_end_max, Ordering::Release);
    (ti_end_min, ti_end_max)
}

/// Build the multipoles of the subtree of `ci` bottom-up.
///
/// # Safety
/// The caller holds the gravity lock of `ci`.
pub unsafe fn grav_up(ctx: &RunnerContext, ci: CellId) -> Multipole {
    let gparts = ctx.gparts_of(ci);
    multipole_up(ctx, ci, gparts, ctx.cells[ci].gpart_offset)
}

fn multipole_up(ctx: &RunnerContext, cid: CellId, gparts: &[GPart], base: usize) -> Multipole {
    let cell = &ctx.cells[cid];
    let multipole = if cell.split {
        let children: Vec<Multipole> = cell
            .progeny_ids()
            .map(|child| multipole_up(ctx, child, gparts, base))
            .collect();
        Multipole::combine(children.into_iter())
    } else {
        let start = cell.gpart_offset - base;
        Multipole::from_gparts(&gparts[start..start + cell.gcount])
    };
    *cell.multipole.lock() = multipole;
    multipole
}

/// Collect the multipoles of the local top-level cells.
pub fn gather_multipoles(ctx: &RunnerContext) {
    let mut multipoles = ctx.multipoles.write();
    for (cid, multipole) in multipoles.iter_mut().enumerate().take(ctx.nr_top_cells) {
        let cell = &ctx.cells[cid];
        *multipole = if cell.foreign {
            Multipole::default()
        } else {
            *cell.multipole.lock()
        };
    }
}

/// Long-range gravity on the top-level cell `ci` from all top-level cells
/// that do not touch it.
///
/// # Safety
/// The caller holds the gravity lock of `ci`.
pub unsafe fn grav_mm(ctx: &RunnerContext, ci: CellId) {
    if ci >= ctx.nr_top_cells {
        fatal!("Multipole task on cell {} which is not a top-level cell.", ci);
    }
    let cell = &ctx.cells[ci];
    let centre = cell.centre();
    let field: Vec<Multipole> = ctx
        .multipoles
        .read()
        .iter()
        .enumerate()
        .filter(|&(cj, m)| cj != ci && m.mass > 0. && !cell.is_neighbour(&ctx.cells[cj], ctx.dim, ctx.periodic))
        .map(|(_, m)| {
            let mut dx = m.com - centre;
            if ctx.periodic {
                dx = nearest_image(dx, ctx.dim);
            }
            Multipole { mass: m.mass, com: centre + dx }
        })
        .collect();
    ctx.physics.long_range_gravity(ctx.gparts_of(ci), &field, &ctx.info);
}
