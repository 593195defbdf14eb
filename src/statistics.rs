//! Conserved quantities of the whole run.

use std::{
    fs::OpenOptions,
    io::{BufWriter, Write},
    path::PathBuf,
};

use glam::DVec3;

use crate::{
    comm::{CommExt, Communicator},
    part::{GPart, Part, SPart},
};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Statistics {
    pub mass: f64,
    pub kinetic_energy: f64,
    pub internal_energy: f64,
    pub momentum: DVec3,
    pub angular_momentum: DVec3,
}

impl Statistics {
    /// Totals over the particles of one rank. Gravity particles with a gas or
    /// star partner are counted through their partner.
    pub fn collect(parts: &[Part], gparts: &[GPart], sparts: &[SPart]) -> Self {
        let mut stats = Self::default();
        let mut add = |mass: f64, x: DVec3, v: DVec3| {
            stats.mass += mass;
            stats.kinetic_energy += 0.5 * mass * v.length_squared();
            stats.momentum += mass * v;
            stats.angular_momentum += x.cross(mass * v);
        };
        for part in parts.iter() {
            add(part.mass, part.x, part.v);
        }
        for gpart in gparts.iter().filter(|g| !g.has_partner()) {
            add(gpart.mass, gpart.x, gpart.v);
        }
        for spart in sparts.iter() {
            add(spart.mass, spart.x, spart.v);
        }
        stats.internal_energy = parts.iter().map(|p| p.mass * p.u).sum();
        stats
    }

    /// Sum over all ranks.
    pub fn all_reduce<C: Communicator + ?Sized>(&self, comm: &C) -> Self {
        let values = vec![
            self.mass,
            self.kinetic_energy,
            self.internal_energy,
            self.momentum.x,
            self.momentum.y,
            self.momentum.z,
            self.angular_momentum.x,
            self.angular_momentum.y,
            self.angular_momentum.z,
        ];
        let v = comm.all_reduce_sum_f64(values);
        Self {
            mass: v[0],
            kinetic_energy: v[1],
            internal_energy: v[2],
            momentum: DVec3::new(v[3], v[4], v[5]),
            angular_momentum: DVec3::new(v[6], v[7], v[8]),
        }
    }

    pub fn total_energy(&self) -> f64 {
        self.kinetic_energy + self.internal_energy
    }
}

/// Appends one line per report to `{basename}_statistics.txt`.
#[derive(Debug)]
pub struct StatisticsLog {
    filename: PathBuf,
    header_written: bool,
}

impl StatisticsLog {
    pub fn new(basename: &str) -> Self {
        Self {
            filename: PathBuf::from(format!("{}_statistics.txt", basename)),
            header_written: false,
        }
    }

    pub fn append(&mut self, step: usize, time: f64, stats: &Statistics) -> std::io::Result<()> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.header_written)
            .truncate(!self.header_written)
            .open(&self.filename)?;
        let mut f = BufWriter::new(file);
        if !self.header_written {
            writeln!(f, "# step\ttime\tmass\te_kin\te_int\tp_x\tp_y\tp_z\tL_x\tL_y\tL_z")?;
            self.header_written = true;
        }
        writeln!(
            f,
            "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
            step,
            time,
            stats.mass,
            stats.kinetic_energy,
            stats.internal_energy,
            stats.momentum.x,
            stats.momentum.y,
            stats.momentum.z,
            stats.angular_momentum.x,
            stats.angular_momentum.y,
            stats.angular_momentum.z
        )?;
        f.flush()?;
        tracing::info!(
            "Step {}: mass={:.6e} E_kin={:.6e} E_int={:.6e} |p|={:.6e}",
            step,
            stats.mass,
            stats.kinetic_energy,
            stats.internal_energy,
            stats.momentum.length()
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;

    use super::*;
    use crate::part::ParticleKind;

    #[test]
    fn test_collect() {
        let parts = vec![Part {
            mass: 2.,
            x: DVec3::X,
            v: DVec3::Y,
            u: 3.,
            gpart: Some(0),
            ..Default::default()
        }];
        let gparts = vec![
            GPart {
                mass: 2.,
                kind: ParticleKind::Gas,
                ..Default::default()
            },
            GPart {
                mass: 1.,
                v: -DVec3::Y,
                ..Default::default()
            },
        ];
        let stats = Statistics::collect(&parts, &gparts, &[]);
        assert_approx_eq!(f64, stats.mass, 3.);
        assert_approx_eq!(f64, stats.kinetic_energy, 1.5);
        assert_approx_eq!(f64, stats.internal_energy, 6.);
        assert_approx_eq!(f64, stats.momentum.y, 1.);
        assert_approx_eq!(f64, stats.angular_momentum.z, 2.);
        assert_approx_eq!(f64, stats.total_energy(), 7.5);
    }
}
