//! Physics kernels, as seen by the task runner.
//!
//! The engine never looks inside a kernel: interaction tasks hand the
//! particle slices of their cells to a [`Physics`] implementation. Kernels
//! only update particles that are active at the current tick.

use glam::DVec3;
use yaml_rust::Yaml;

use crate::{
    cell::SortEntry,
    equation_of_state::EquationOfState,
    errors::ConfigError,
    gravity::{self, Multipole, Potential},
    kernels::{Kernel, KernelKind},
    part::{GPart, Part, Particle, SPart},
    task::TaskSubtype,
    timeline::{IntegerTime, TimeLine},
};

/// What a kernel knows about the step it is running in.
#[derive(Debug, Clone, Copy)]
pub struct StepInfo {
    pub ti_current: IntegerTime,
    pub timeline: TimeLine,
    pub rank: usize,
}

impl StepInfo {
    pub fn time(&self) -> f64 {
        self.timeline.time(self.ti_current)
    }
}

/// The sort lists of both cells of a pair along their common axis. Entries
/// index into the particle slices handed over with them.
#[derive(Debug, Clone, Copy)]
pub struct SortedPair<'a> {
    pub axis: DVec3,
    pub sort_i: &'a [SortEntry],
    pub sort_j: &'a [SortEntry],
}

/// Physics callbacks invoked by the tasks. Every method defaults to doing
/// nothing, so an implementation only provides the loops it needs.
#[allow(unused_variables)]
pub trait Physics: Send + Sync {
    fn label(&self) -> &str;

    /// Interaction loop (`Density`, `Gradient` or `Force`) within one cell.
    fn self_hydro(&self, stage: TaskSubtype, parts: &mut [Part], info: &StepInfo) {}

    /// Interaction loop between two cells. `shift` is added to the positions
    /// of `parts_j` to bring them next to `parts_i`.
    fn pair_hydro(&self, stage: TaskSubtype, parts_i: &mut [Part], parts_j: &mut [Part], shift: DVec3, info: &StepInfo) {}

    /// Same as [`Physics::pair_hydro`], for cells that are both sorted along
    /// the axis joining them.
    fn pair_hydro_sorted(
        &self,
        stage: TaskSubtype,
        parts_i: &mut [Part],
        parts_j: &mut [Part],
        sorted: &SortedPair,
        shift: DVec3,
        info: &StepInfo,
    ) {
        self.pair_hydro(stage, parts_i, parts_j, shift, info)
    }

    /// Finish the density loop.
    fn ghost(&self, parts: &mut [Part], info: &StepInfo) {}

    /// Finish the gradient loop.
    fn extra_ghost(&self, parts: &mut [Part], info: &StepInfo) {}

    fn cooling(&self, parts: &mut [Part], info: &StepInfo) {}

    fn source_terms(&self, parts: &mut [Part], sparts: &mut [SPart], info: &StepInfo) {}

    fn self_gravity(&self, gparts: &mut [GPart], info: &StepInfo) {}

    fn pair_gravity(&self, gparts_i: &mut [GPart], gparts_j: &mut [GPart], shift: DVec3, info: &StepInfo) {}

    /// Contribution of the distant top-level cells, given as multipoles at
    /// their nearest periodic image.
    fn long_range_gravity(&self, gparts: &mut [GPart], field: &[Multipole], info: &StepInfo) {}

    /// Global mesh step over the gathered top-level multipoles.
    fn mesh_gravity(&self, multipoles: &[Multipole], info: &StepInfo) {}

    fn external_gravity(&self, gparts: &mut [GPart], info: &StepInfo) {}

    fn part_timestep(&self, part: &Part, info: &StepInfo) -> f64 {
        f64::INFINITY
    }

    fn gpart_timestep(&self, gpart: &GPart, info: &StepInfo) -> f64 {
        f64::INFINITY
    }

    fn spart_timestep(&self, spart: &SPart, info: &StepInfo) -> f64 {
        f64::INFINITY
    }
}

/// Kernels that do nothing, for exercising the engine on its own.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPhysics;

impl Physics for NullPhysics {
    fn label(&self) -> &str {
        "null"
    }
}

/// Minimal SPH with direct-summation gravity.
#[derive(Debug, Clone)]
pub struct SphPhysics {
    kernel: KernelKind,
    eos: EquationOfState,
    cfl: f64,
    softening_length: f64,
    eta: f64,
    cooling_time: Option<f64>,
    potential: Option<Potential>,
}

impl SphPhysics {
    pub fn new(kernel: KernelKind, eos: EquationOfState, cfl: f64, softening_length: f64) -> Self {
        Self {
            kernel,
            eos,
            cfl,
            softening_length,
            eta: 0.025,
            cooling_time: None,
            potential: None,
        }
    }

    pub fn with_potential(mut self, potential: Potential) -> Self {
        self.potential = Some(potential);
        self
    }

    pub fn with_cooling_time(mut self, cooling_time: f64) -> Self {
        self.cooling_time = Some(cooling_time);
        self
    }

    /// Read the `physics` section of the configuration.
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let kernel = match yaml["kernel"].as_str().unwrap_or("cubic_spline") {
            "cubic_spline" => KernelKind::CubicSpline,
            "wendland_c2" => KernelKind::WendlandC2,
            other => return Err(ConfigError::InvalidValue("physics:kernel".to_string(), other.to_string())),
        };
        let gamma = yaml["gamma"].as_f64().unwrap_or(5. / 3.);
        let eos = match yaml["equation_of_state"].as_str().unwrap_or("ideal") {
            "ideal" => EquationOfState::Ideal { gamma },
            "isothermal" => EquationOfState::Isothermal {
                internal_energy: yaml["isothermal_internal_energy"].as_f64().ok_or(ConfigError::MissingParameter(
                    "physics:isothermal_internal_energy".to_string(),
                ))?,
                gamma,
            },
            other => {
                return Err(ConfigError::InvalidValue(
                    "physics:equation_of_state".to_string(),
                    other.to_string(),
                ))
            }
        };
        let cfl = yaml["cfl_criterion"].as_f64().unwrap_or(0.1);
        let softening_length = yaml["softening_length"].as_f64().unwrap_or(1e-2);
        let mut physics = Self::new(kernel, eos, cfl, softening_length);
        if let Some(cooling_time) = yaml["cooling_time"].as_f64() {
            physics = physics.with_cooling_time(cooling_time);
        }
        let potential = &yaml["potential"];
        if !potential.is_badvalue() {
            let vec3 = |key: &str| -> Result<DVec3, ConfigError> {
                let name = format!("physics:potential:{}", key);
                let values = potential[key]
                    .as_vec()
                    .ok_or_else(|| ConfigError::MissingParameter(name.clone()))?;
                let values: Vec<f64> = values.iter().filter_map(|v| v.as_f64()).collect();
                match values[..] {
                    [x, y, z] => Ok(DVec3::new(x, y, z)),
                    _ => Err(ConfigError::InvalidValue(name, format!("{:?}", values))),
                }
            };
            let potential = match potential["kind"].as_str().unwrap_or("constant") {
                "constant" => Potential::Constant {
                    acceleration: vec3("acceleration")?,
                },
                "point_mass" => Potential::PointMass {
                    position: vec3("position")?,
                    mass: potential["mass"].as_f64().unwrap_or(1.),
                    softening_length,
                },
                other => {
                    return Err(ConfigError::InvalidValue(
                        "physics:potential:kind".to_string(),
                        other.to_string(),
                    ))
                }
            };
            physics = physics.with_potential(potential);
        }
        Ok(physics)
    }

    fn pressure(&self, part: &Part) -> f64 {
        self.eos.pressure(part.rho, part.u)
    }

    /// Accumulate the contribution of `pj` (at separation `dx = x_i - x_j`)
    /// onto `pi` for one interaction stage.
    fn interact(&self, stage: TaskSubtype, pi: &mut Part, pj: &Part, dx: DVec3) {
        let r2 = dx.length_squared();
        match stage {
            TaskSubtype::Density => {
                if r2 < pi.h * pi.h {
                    pi.rho += pj.mass * self.kernel.kernel(r2.sqrt(), pi.h);
                }
            }
            TaskSubtype::Force => {
                let h = pi.h.max(pj.h);
                if r2 >= h * h || r2 == 0. || pi.rho <= 0. || pj.rho <= 0. {
                    return;
                }
                let r = r2.sqrt();
                let dir = dx / r;
                let term_i = self.pressure(pi) / (pi.rho * pi.rho) * self.kernel.derivative(r, pi.h);
                let term_j = self.pressure(pj) / (pj.rho * pj.rho) * self.kernel.derivative(r, pj.h);
                pi.a_hydro -= pj.mass * (term_i + term_j) * dir;
                pi.u_dt += pj.mass * term_i * (pi.v - pj.v).dot(dir);
            }
            _ => {}
        }
    }
}

impl Physics for SphPhysics {
    fn label(&self) -> &str {
        "sph"
    }

    fn self_hydro(&self, stage: TaskSubtype, parts: &mut [Part], info: &StepInfo) {
        for i in 0..parts.len() {
            if !parts[i].is_active(info.ti_current) {
                continue;
            }
            for j in 0..parts.len() {
                if i == j {
                    continue;
                }
                let pj = parts[j].clone();
                let dx = parts[i].x - pj.x;
                self.interact(stage, &mut parts[i], &pj, dx);
            }
        }
    }

    fn pair_hydro(&self, stage: TaskSubtype, parts_i: &mut [Part], parts_j: &mut [Part], shift: DVec3, info: &StepInfo) {
        for pi in parts_i.iter_mut() {
            let active_i = pi.is_active(info.ti_current);
            for pj in parts_j.iter_mut() {
                let dx = pi.x - (pj.x + shift);
                if active_i {
                    self.interact(stage, pi, pj, dx);
                }
                if pj.is_active(info.ti_current) {
                    self.interact(stage, pj, pi, -dx);
                }
            }
        }
    }

    /// Sweep along the sort axis: only particles of `parts_j` whose
    /// projection lies within the largest smoothing length of a particle of
    /// `parts_i` can interact with it.
    fn pair_hydro_sorted(
        &self,
        stage: TaskSubtype,
        parts_i: &mut [Part],
        parts_j: &mut [Part],
        sorted: &SortedPair,
        shift: DVec3,
        info: &StepInfo,
    ) {
        let h_max = parts_i.iter().chain(parts_j.iter()).fold(0f64, |h, p| h.max(p.h));
        let reach = h_max * (1. + 1e-9);
        let offset = shift.dot(sorted.axis);
        for entry_i in sorted.sort_i.iter() {
            let first = sorted.sort_j.partition_point(|e| e.d + offset < entry_i.d - reach);
            let pi = &mut parts_i[entry_i.index];
            let active_i = pi.is_active(info.ti_current);
            for entry_j in sorted.sort_j[first..]
                .iter()
                .take_while(|e| e.d + offset <= entry_i.d + reach)
            {
                let pj = &mut parts_j[entry_j.index];
                let dx = pi.x - (pj.x + shift);
                if active_i {
                    self.interact(stage, pi, pj, dx);
                }
                if pj.is_active(info.ti_current) {
                    self.interact(stage, pj, pi, -dx);
                }
            }
        }
    }

    fn ghost(&self, parts: &mut [Part], info: &StepInfo) {
        for part in parts.iter_mut().filter(|p| p.is_active(info.ti_current)) {
            part.rho += part.mass * self.kernel.kernel(0., part.h);
        }
    }

    fn cooling(&self, parts: &mut [Part], info: &StepInfo) {
        if let Some(cooling_time) = self.cooling_time {
            for part in parts.iter_mut().filter(|p| p.is_active(info.ti_current)) {
                part.u_dt -= part.u / cooling_time;
            }
        }
    }

    fn self_gravity(&self, gparts: &mut [GPart], _info: &StepInfo) {
        gravity::self_gravity(gparts, self.softening_length);
    }

    fn pair_gravity(&self, gparts_i: &mut [GPart], gparts_j: &mut [GPart], shift: DVec3, _info: &StepInfo) {
        gravity::pair_gravity(gparts_i, gparts_j, shift, self.softening_length);
    }

    fn long_range_gravity(&self, gparts: &mut [GPart], field: &[Multipole], info: &StepInfo) {
        for gpart in gparts.iter_mut().filter(|g| g.is_active(info.ti_current)) {
            for multipole in field {
                gpart.a_grav += multipole.acceleration(gpart.x, self.softening_length);
            }
        }
    }

    fn external_gravity(&self, gparts: &mut [GPart], info: &StepInfo) {
        if let Some(potential) = &self.potential {
            for gpart in gparts.iter_mut().filter(|g| g.is_active(info.ti_current)) {
                gpart.a_grav += potential.acceleration(gpart.x);
            }
        }
    }

    fn part_timestep(&self, part: &Part, _info: &StepInfo) -> f64 {
        let c_s = self.eos.sound_speed(part.rho, part.u);
        let signal = c_s + part.v.length();
        if signal > 0. {
            self.cfl * part.h / signal
        } else {
            f64::INFINITY
        }
    }

    fn gpart_timestep(&self, gpart: &GPart, _info: &StepInfo) -> f64 {
        let a = gpart.a_grav.length();
        if a > 0. {
            (2. * self.eta * self.softening_length / a).sqrt()
        } else {
            f64::INFINITY
        }
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;
    use yaml_rust::YamlLoader;

    use super::*;

    /// Particles without a time bin are active at tick 0.
    fn info() -> StepInfo {
        StepInfo {
            ti_current: 0,
            timeline: TimeLine::new(0., 1.),
            rank: 0,
        }
    }

    fn part(x: f64) -> Part {
        Part {
            x: DVec3::new(x, 0.5, 0.5),
            mass: 1.,
            h: 0.3,
            u: 1.,
            ..Default::default()
        }
    }

    #[test]
    fn test_pair_matches_self() {
        let physics = SphPhysics::new(KernelKind::CubicSpline, EquationOfState::Ideal { gamma: 5. / 3. }, 0.1, 0.01);
        let mut joint = vec![part(0.4), part(0.5), part(0.6)];
        physics.self_hydro(TaskSubtype::Density, &mut joint, &info());

        let (mut left, mut right) = (vec![part(0.4), part(0.5)], vec![part(0.6)]);
        physics.self_hydro(TaskSubtype::Density, &mut left, &info());
        physics.self_hydro(TaskSubtype::Density, &mut right, &info());
        physics.pair_hydro(TaskSubtype::Density, &mut left, &mut right, DVec3::ZERO, &info());
        for (a, b) in joint.iter().zip(left.iter().chain(right.iter())) {
            assert_approx_eq!(f64, a.rho, b.rho);
        }
        assert!(joint[1].rho > joint[0].rho);
    }

    fn sort_along(parts: &[Part], axis: DVec3) -> Vec<SortEntry> {
        let mut entries: Vec<SortEntry> =
            parts.iter().enumerate().map(|(index, p)| SortEntry { index, d: p.x.dot(axis) }).collect();
        entries.sort_by(|a, b| a.d.total_cmp(&b.d));
        entries
    }

    #[test]
    fn test_sorted_pair_matches_direct_pair() {
        let physics = SphPhysics::new(KernelKind::CubicSpline, EquationOfState::Ideal { gamma: 5. / 3. }, 0.1, 0.01);
        let scatter = |x0: f64, k: usize| -> Vec<Part> {
            (0..k)
                .map(|i| Part {
                    x: DVec3::new(x0 + 0.045 * i as f64, 0.3 + 0.07 * (i % 5) as f64, 0.5 - 0.05 * (i % 3) as f64),
                    h: 0.1 + 0.01 * (i % 4) as f64,
                    ..part(0.)
                })
                .collect()
        };
        // The right cell sits across the periodic boundary.
        let shift = DVec3::new(1., 0., 0.);
        let (left, right) = (scatter(0.55, 10), scatter(0.0, 10));
        let axis = DVec3::new(1., 0., 0.);

        let (mut direct_i, mut direct_j) = (left.clone(), right.clone());
        physics.pair_hydro(TaskSubtype::Density, &mut direct_i, &mut direct_j, shift, &info());

        let (mut swept_i, mut swept_j) = (left.clone(), right.clone());
        let (sort_i, sort_j) = (sort_along(&left, axis), sort_along(&right, axis));
        let sorted = SortedPair { axis, sort_i: &sort_i, sort_j: &sort_j };
        physics.pair_hydro_sorted(TaskSubtype::Density, &mut swept_i, &mut swept_j, &sorted, shift, &info());

        for (a, b) in direct_i.iter().chain(direct_j.iter()).zip(swept_i.iter().chain(swept_j.iter())) {
            assert_approx_eq!(f64, a.rho, b.rho);
        }
        assert!(direct_i.iter().any(|p| p.rho > 0.));
    }

    #[test]
    fn test_force_is_antisymmetric() {
        let physics = SphPhysics::new(KernelKind::WendlandC2, EquationOfState::Ideal { gamma: 5. / 3. }, 0.1, 0.01);
        let mut parts = vec![part(0.45), part(0.55)];
        physics.self_hydro(TaskSubtype::Density, &mut parts, &info());
        physics.ghost(&mut parts, &info());
        physics.self_hydro(TaskSubtype::Force, &mut parts, &info());
        let momentum = parts[0].a_hydro + parts[1].a_hydro;
        assert_approx_eq!(f64, momentum.length(), 0., epsilon = 1e-10);
        assert!(parts[0].a_hydro.x < 0.);
    }

    #[test]
    fn test_parse() {
        let yaml = YamlLoader::load_from_str(
            "kernel: \"wendland_c2\"\ncooling_time: 2.\npotential:\n  kind: \"constant\"\n  acceleration: [0., 0., -1.]",
        )
        .unwrap();
        let physics = SphPhysics::parse(&yaml[0]).unwrap();
        let mut gparts = vec![GPart::default()];
        physics.external_gravity(&mut gparts, &info());
        assert_approx_eq!(f64, gparts[0].a_grav.z, -1.);
        assert!(physics.gpart_timestep(&gparts[0], &info()).is_finite());

        let yaml = YamlLoader::load_from_str("kernel: \"gaussian\"").unwrap();
        assert!(SphPhysics::parse(&yaml[0]).is_err());
    }
}
