use glam::DVec3;

use crate::part::GPart;

/// Monopole summary of the mass in a cell.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Multipole {
    pub mass: f64,
    pub com: DVec3,
}

impl Multipole {
    pub fn from_gparts(gparts: &[GPart]) -> Self {
        let mass: f64 = gparts.iter().map(|g| g.mass).sum();
        if mass == 0. {
            return Self::default();
        }
        let com = gparts.iter().map(|g| g.mass * g.x).sum::<DVec3>() / mass;
        Self { mass, com }
    }

    /// Combine the multipoles of a cell's progeny.
    pub fn combine(multipoles: impl Iterator<Item = Multipole>) -> Self {
        let mut mass = 0.;
        let mut weighted = DVec3::ZERO;
        for m in multipoles {
            mass += m.mass;
            weighted += m.mass * m.com;
        }
        if mass == 0. {
            return Self::default();
        }
        Self {
            mass,
            com: weighted / mass,
        }
    }

    /// Acceleration exerted by this multipole on a point at `x`.
    pub fn acceleration(&self, x: DVec3, softening_length: f64) -> DVec3 {
        let dx = self.com - x;
        let r2 = dx.length_squared() + softening_length * softening_length;
        self.mass * dx / (r2 * r2.sqrt())
    }
}

/// Softened direct summation between all particles of one slice.
pub fn self_gravity(gparts: &mut [GPart], softening_length: f64) {
    let eps2 = softening_length * softening_length;
    for i in 0..gparts.len() {
        for j in (i + 1)..gparts.len() {
            let dx = gparts[j].x - gparts[i].x;
            let r2 = dx.length_squared() + eps2;
            let f = dx / (r2 * r2.sqrt());
            let (mi, mj) = (gparts[i].mass, gparts[j].mass);
            gparts[i].a_grav += mj * f;
            gparts[j].a_grav -= mi * f;
        }
    }
}

/// Softened direct summation between two slices, `shift` is added to the
/// positions of `gparts_j` to account for periodic images.
pub fn pair_gravity(gparts_i: &mut [GPart], gparts_j: &mut [GPart], shift: DVec3, softening_length: f64) {
    let eps2 = softening_length * softening_length;
    for gi in gparts_i.iter_mut() {
        for gj in gparts_j.iter_mut() {
            let dx = gj.x + shift - gi.x;
            let r2 = dx.length_squared() + eps2;
            let f = dx / (r2 * r2.sqrt());
            gi.a_grav += gj.mass * f;
            gj.a_grav -= gi.mass * f;
        }
    }
}

/// External potentials acting on every gravity particle.
#[derive(Debug, Clone, Copy)]
pub enum Potential {
    Constant { acceleration: DVec3 },
    PointMass { position: DVec3, mass: f64, softening_length: f64 },
}

impl Potential {
    pub fn acceleration(&self, position: DVec3) -> DVec3 {
        match self {
            Self::Constant { acceleration } => *acceleration,
            Self::PointMass {
                position: centre,
                mass,
                softening_length,
            } => {
                let dx = position - *centre;
                let r2 = dx.length_squared() + softening_length * softening_length;
                -mass * dx / (r2 * r2.sqrt())
            }
        }
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;

    use super::*;

    #[test]
    fn test_multipole_combine() {
        let gparts = vec![
            GPart { x: DVec3::ZERO, mass: 1., ..Default::default() },
            GPart { x: DVec3::X, mass: 3., ..Default::default() },
        ];
        let full = Multipole::from_gparts(&gparts);
        let combined = Multipole::combine(
            [Multipole::from_gparts(&gparts[..1]), Multipole::from_gparts(&gparts[1..])].into_iter(),
        );
        assert_approx_eq!(f64, full.mass, 4.);
        assert_approx_eq!(f64, full.com.x, 0.75);
        assert_approx_eq!(f64, combined.com.x, full.com.x);
    }

    #[test]
    fn test_momentum_conservation() {
        let mut a = vec![GPart { x: DVec3::ZERO, mass: 2., ..Default::default() }];
        let mut b = vec![GPart { x: DVec3::new(0.5, 0.2, 0.), mass: 1., ..Default::default() }];
        pair_gravity(&mut a, &mut b, DVec3::ZERO, 0.01);
        let p = a[0].mass * a[0].a_grav + b[0].mass * b[0].a_grav;
        assert_approx_eq!(f64, p.length(), 0., epsilon = 1e-12);
    }
}
