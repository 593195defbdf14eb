use glam::DVec3;

use crate::{
    macros::fatal,
    timeline::{get_integer_time_end, IntegerTime, Timebin},
};

/// State of the link from a gravity particle to its gas or star partner.
///
/// Links are `Local` indices into the partner array of the same rank. While
/// particles are in flight between ranks (or between a staging buffer and
/// the final array) the link is `Pending`, an offset relative to the start
/// of the partner's block; a relink pass turns it back into `Local`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PartnerLink {
    #[default]
    None,
    Local(usize),
    Pending(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParticleKind {
    #[default]
    DarkMatter,
    Gas,
    Star,
}

/// Common accessors used by the space and the engine for all species.
pub trait Particle: Clone + Send + Sync {
    fn x(&self) -> DVec3;
    fn x_mut(&mut self) -> &mut DVec3;
    fn v(&self) -> DVec3;
    fn time_bin(&self) -> Timebin;
    fn x_diff(&self) -> DVec3;
    fn set_x_diff(&mut self, x_diff: DVec3);

    fn drift(&mut self, dt: f64) {
        let dx = self.v() * dt;
        *self.x_mut() += dx;
        self.set_x_diff(self.x_diff() + dx);
    }

    fn ti_end(&self, ti_current: IntegerTime) -> IntegerTime {
        get_integer_time_end(ti_current, self.time_bin())
    }

    fn is_active(&self, ti_current: IntegerTime) -> bool {
        self.ti_end(ti_current) == ti_current
    }
}

macro_rules! impl_particle {
    ($ty:ty) => {
        impl Particle for $ty {
            fn x(&self) -> DVec3 {
                self.x
            }
            fn x_mut(&mut self) -> &mut DVec3 {
                &mut self.x
            }
            fn v(&self) -> DVec3 {
                self.v
            }
            fn time_bin(&self) -> Timebin {
                self.time_bin
            }
            fn x_diff(&self) -> DVec3 {
                self.x_diff
            }
            fn set_x_diff(&mut self, x_diff: DVec3) {
                self.x_diff = x_diff;
            }
        }
    };
}

/// Gas particle.
#[derive(Default, Debug, Clone)]
pub struct Part {
    pub id: u64,
    pub x: DVec3,
    pub v: DVec3,
    pub a_hydro: DVec3,
    pub mass: f64,
    pub h: f64,
    pub rho: f64,
    pub u: f64,
    pub u_dt: f64,
    pub time_bin: Timebin,
    pub x_diff: DVec3,
    pub gpart: Option<usize>,
}

/// Gravity particle: dark matter, or the gravity half of a gas or star particle.
#[derive(Default, Debug, Clone)]
pub struct GPart {
    pub id: u64,
    pub x: DVec3,
    pub v: DVec3,
    pub a_grav: DVec3,
    pub mass: f64,
    pub time_bin: Timebin,
    pub x_diff: DVec3,
    pub kind: ParticleKind,
    pub partner: PartnerLink,
}

#[derive(Default, Debug, Clone)]
pub struct SPart {
    pub id: u64,
    pub x: DVec3,
    pub v: DVec3,
    pub mass: f64,
    pub time_bin: Timebin,
    pub x_diff: DVec3,
    pub gpart: Option<usize>,
}

impl_particle!(Part);
impl_particle!(GPart);
impl_particle!(SPart);

impl Part {
    pub fn kinetic_energy(&self) -> f64 {
        0.5 * self.mass * self.v.length_squared()
    }
}

impl GPart {
    pub fn has_partner(&self) -> bool {
        !matches!(self.kind, ParticleKind::DarkMatter)
    }
}

/// Stable reorder of `items` by `keys`. Returns the old index of every new
/// position.
pub fn sort_by_key_stable<T: Clone>(items: &mut Vec<T>, keys: &[usize]) -> Vec<usize> {
    debug_assert_eq!(items.len(), keys.len());
    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| keys[i]);
    *items = order.iter().map(|&i| items[i].clone()).collect();
    order
}

/// Point the gravity partners of `parts` and `sparts` back at their owners.
pub fn relink_gparts(parts: &[Part], sparts: &[SPart], gparts: &mut [GPart]) {
    for (i, part) in parts.iter().enumerate() {
        if let Some(gi) = part.gpart {
            gparts[gi].partner = PartnerLink::Local(i);
        }
    }
    for (i, spart) in sparts.iter().enumerate() {
        if let Some(gi) = spart.gpart {
            gparts[gi].partner = PartnerLink::Local(i);
        }
    }
}

/// Point gas and star particles at their gravity partners after the
/// gravity particles were reordered.
pub fn relink_partners(gparts: &[GPart], parts: &mut [Part], sparts: &mut [SPart]) {
    for (gi, gpart) in gparts.iter().enumerate() {
        if let PartnerLink::Local(i) = gpart.partner {
            match gpart.kind {
                ParticleKind::Gas => parts[i].gpart = Some(gi),
                ParticleKind::Star => sparts[i].gpart = Some(gi),
                ParticleKind::DarkMatter => {}
            }
        }
    }
}

/// Resolve the pending links of `gparts[g_range]`, which were received as
/// one block together with gas particles starting at `part_offset` and star
/// particles starting at `spart_offset`.
pub fn resolve_pending(
    gparts: &mut [GPart],
    g_range: std::ops::Range<usize>,
    parts: &mut [Part],
    part_offset: usize,
    sparts: &mut [SPart],
    spart_offset: usize,
) {
    for gi in g_range {
        let gpart = &mut gparts[gi];
        if let PartnerLink::Pending(offset) = gpart.partner {
            match gpart.kind {
                ParticleKind::Gas => {
                    let i = part_offset + offset;
                    gpart.partner = PartnerLink::Local(i);
                    parts[i].gpart = Some(gi);
                }
                ParticleKind::Star => {
                    let i = spart_offset + offset;
                    gpart.partner = PartnerLink::Local(i);
                    sparts[i].gpart = Some(gi);
                }
                ParticleKind::DarkMatter => gpart.partner = PartnerLink::None,
            }
        }
    }
}

/// Check that every partner link resolves to a particle of the right
/// species that points back.
pub fn check_links(parts: &[Part], gparts: &[GPart], sparts: &[SPart]) -> Result<(), String> {
    for (i, part) in parts.iter().enumerate() {
        if let Some(gi) = part.gpart {
            let gpart = gparts
                .get(gi)
                .ok_or_else(|| format!("part {} links to missing gpart {}", part.id, gi))?;
            if gpart.kind != ParticleKind::Gas || gpart.partner != PartnerLink::Local(i) {
                return Err(format!("Linking problem between part {} and gpart {}", part.id, gpart.id));
            }
            if gpart.x != part.x {
                return Err(format!("part {} and its gpart are not at the same position", part.id));
            }
        }
    }
    for (i, spart) in sparts.iter().enumerate() {
        if let Some(gi) = spart.gpart {
            let gpart = gparts
                .get(gi)
                .ok_or_else(|| format!("spart {} links to missing gpart {}", spart.id, gi))?;
            if gpart.kind != ParticleKind::Star || gpart.partner != PartnerLink::Local(i) {
                return Err(format!("Linking problem between spart {} and gpart {}", spart.id, gpart.id));
            }
        }
    }
    for (gi, gpart) in gparts.iter().enumerate() {
        let back = match (gpart.kind, gpart.partner) {
            (ParticleKind::DarkMatter, PartnerLink::None) => continue,
            (ParticleKind::Gas, PartnerLink::Local(i)) => parts.get(i).and_then(|p| p.gpart),
            (ParticleKind::Star, PartnerLink::Local(i)) => sparts.get(i).and_then(|s| s.gpart),
            (kind, link) => {
                return Err(format!("gpart {} of kind {:?} has link {:?}", gpart.id, kind, link))
            }
        };
        if back != Some(gi) {
            return Err(format!("gpart {} is not linked back by its partner", gpart.id));
        }
    }
    Ok(())
}

/// Destination rank of every particle of a [`ParticleBlock`], per species.
#[derive(Debug, Clone, Default)]
pub struct Destinations {
    pub parts: Vec<usize>,
    pub gparts: Vec<usize>,
    pub sparts: Vec<usize>,
}

/// A set of particles of all three species with consistent partner links.
#[derive(Debug, Clone, Default)]
pub struct ParticleBlock {
    pub parts: Vec<Part>,
    pub gparts: Vec<GPart>,
    pub sparts: Vec<SPart>,
}

impl ParticleBlock {
    pub fn counts(&self) -> [usize; 3] {
        [self.parts.len(), self.gparts.len(), self.sparts.len()]
    }

    pub fn is_empty(&self) -> bool {
        self.counts() == [0, 0, 0]
    }

    /// Split the block into one block per destination rank, preserving the
    /// relative order of the particles. Partner links are encoded as
    /// offsets into the destination block of the partner.
    pub fn split_by_destination(self, dest: &Destinations, nr_nodes: usize) -> Vec<ParticleBlock> {
        debug_assert_eq!(dest.parts.len(), self.parts.len());
        debug_assert_eq!(dest.gparts.len(), self.gparts.len());
        debug_assert_eq!(dest.sparts.len(), self.sparts.len());

        let mut blocks = vec![ParticleBlock::default(); nr_nodes];
        let mut part_pos = Vec::with_capacity(self.parts.len());
        for (i, mut part) in self.parts.into_iter().enumerate() {
            let block = &mut blocks[dest.parts[i]];
            part_pos.push(block.parts.len());
            part.gpart = None;
            block.parts.push(part);
        }
        let mut spart_pos = Vec::with_capacity(self.sparts.len());
        for (i, mut spart) in self.sparts.into_iter().enumerate() {
            let block = &mut blocks[dest.sparts[i]];
            spart_pos.push(block.sparts.len());
            spart.gpart = None;
            block.sparts.push(spart);
        }
        for (gi, mut gpart) in self.gparts.into_iter().enumerate() {
            let node = dest.gparts[gi];
            gpart.partner = match (gpart.kind, gpart.partner) {
                (ParticleKind::Gas, PartnerLink::Local(i)) => {
                    if dest.parts[i] != node {
                        fatal!("gpart {} and its gas partner are sent to different ranks.", gpart.id);
                    }
                    PartnerLink::Pending(part_pos[i])
                }
                (ParticleKind::Star, PartnerLink::Local(i)) => {
                    if dest.sparts[i] != node {
                        fatal!("gpart {} and its star partner are sent to different ranks.", gpart.id);
                    }
                    PartnerLink::Pending(spart_pos[i])
                }
                (ParticleKind::DarkMatter, _) => PartnerLink::None,
                (kind, link) => fatal!("gpart {} of kind {:?} has an unresolved link {:?}.", gpart.id, kind, link),
            };
            blocks[node].gparts.push(gpart);
        }
        blocks
    }

    /// Append a block produced by [`ParticleBlock::split_by_destination`],
    /// resolving its pending links against the newly appended slice only.
    pub fn append(&mut self, other: ParticleBlock) {
        let part_offset = self.parts.len();
        let spart_offset = self.sparts.len();
        let gpart_offset = self.gparts.len();
        self.parts.extend(other.parts);
        self.sparts.extend(other.sparts);
        self.gparts.extend(other.gparts);
        let g_range = gpart_offset..self.gparts.len();
        resolve_pending(&mut self.gparts, g_range, &mut self.parts, part_offset, &mut self.sparts, spart_offset);
    }

    /// Make room for `extra` more particles of each species, growing the
    /// arrays by `margin` when they are too small.
    pub fn reserve_with_margin(&mut self, extra: [usize; 3], margin: f64) {
        fn grow<T>(v: &mut Vec<T>, extra: usize, margin: f64, name: &str) {
            let needed = v.len() + extra;
            if needed > v.capacity() {
                let target = (needed as f64 * margin).ceil() as usize;
                tracing::warn!("Re-allocating {} array to {} entries.", name, target);
                v.reserve_exact(target - v.len());
            }
        }
        grow(&mut self.parts, extra[0], margin, "parts");
        grow(&mut self.gparts, extra[1], margin, "gparts");
        grow(&mut self.sparts, extra[2], margin, "sparts");
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn linked_pair(id: u64, x: f64) -> (Part, GPart) {
        let pos = DVec3::splat(x);
        let part = Part { id, x: pos, ..Default::default() };
        let gpart = GPart { id, x: pos, kind: ParticleKind::Gas, ..Default::default() };
        (part, gpart)
    }

    #[test]
    fn test_sort_and_relink() {
        let mut parts = vec![];
        let mut gparts = vec![GPart { id: 100, ..Default::default() }];
        for (id, x) in [(0, 0.9), (1, 0.1), (2, 0.5)] {
            let (mut part, gpart) = linked_pair(id, x);
            part.gpart = Some(gparts.len());
            gparts.push(gpart);
            parts.push(part);
        }
        relink_gparts(&parts, &[], &mut gparts);
        assert!(check_links(&parts, &gparts, &[]).is_ok());

        let keys: Vec<usize> = parts.iter().map(|p| (p.x.x * 10.) as usize).collect();
        let order = sort_by_key_stable(&mut parts, &keys);
        assert_eq!(order, vec![1, 2, 0]);
        assert!(check_links(&parts, &gparts, &[]).is_err());
        relink_gparts(&parts, &[], &mut gparts);
        assert!(check_links(&parts, &gparts, &[]).is_ok());

        // Now reorder the gravity side
        let keys: Vec<usize> = (0..gparts.len()).rev().collect();
        sort_by_key_stable(&mut gparts, &keys);
        relink_partners(&gparts, &mut parts, &mut []);
        assert!(check_links(&parts, &gparts, &[]).is_ok());
    }

    #[test]
    fn test_resolve_pending() {
        let (part, mut gpart) = linked_pair(7, 0.3);
        gpart.partner = PartnerLink::Pending(0);
        let mut parts = vec![Part::default(), part];
        let mut gparts = vec![GPart::default(), gpart];
        resolve_pending(&mut gparts, 1..2, &mut parts, 1, &mut [], 0);
        assert_eq!(gparts[1].partner, PartnerLink::Local(1));
        assert_eq!(parts[1].gpart, Some(1));
    }

    #[test]
    fn test_split_and_append_keeps_links() {
        let mut block = ParticleBlock::default();
        for (id, x) in [(0, 0.1), (1, 0.8), (2, 0.2), (3, 0.9)] {
            let (mut part, gpart) = linked_pair(id, x);
            part.gpart = Some(block.gparts.len());
            block.gparts.push(gpart);
            block.parts.push(part);
        }
        block.gparts.push(GPart { id: 10, x: DVec3::splat(0.7), ..Default::default() });
        relink_gparts(&block.parts, &block.sparts, &mut block.gparts);

        let node = |x: DVec3| usize::from(x.x > 0.5);
        let dest = Destinations {
            parts: block.parts.iter().map(|p| node(p.x)).collect(),
            gparts: block.gparts.iter().map(|g| node(g.x)).collect(),
            sparts: vec![],
        };
        let blocks = block.split_by_destination(&dest, 2);
        assert_eq!(blocks[0].counts(), [2, 2, 0]);
        assert_eq!(blocks[1].counts(), [2, 3, 0]);

        let mut merged = ParticleBlock::default();
        for b in blocks.into_iter().rev() {
            merged.append(b);
        }
        assert_eq!(merged.counts(), [4, 5, 0]);
        assert!(check_links(&merged.parts, &merged.gparts, &merged.sparts).is_ok());
    }
}
