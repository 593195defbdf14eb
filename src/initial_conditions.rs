use glam::DVec3;
use rand::{rngs::StdRng, Rng, SeedableRng};
use yaml_rust::Yaml;

use crate::{
    errors::ConfigError,
    part::{relink_gparts, Destinations, GPart, Part, ParticleBlock, ParticleKind, PartnerLink, SPart},
};

fn parse_vec3(yaml: &Yaml, name: &str) -> Result<DVec3, ConfigError> {
    match yaml.as_vec() {
        Some(v) if v.len() == 3 => {
            let mut out = DVec3::ZERO;
            for (k, value) in v.iter().enumerate() {
                out[k] = value
                    .as_f64()
                    .or_else(|| value.as_i64().map(|i| i as f64))
                    .ok_or_else(|| ConfigError::InvalidValue(name.to_string(), format!("{:?}", value)))?;
            }
            Ok(out)
        }
        Some(_) => Err(ConfigError::InvalidValue(name.to_string(), "expected 3 values".to_string())),
        None => Err(ConfigError::MissingParameter(name.to_string())),
    }
}

/// Particle layouts that can be generated from the configuration.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Layout {
    /// Regular grid with `per_axis` particles along each axis.
    Lattice { per_axis: [usize; 3] },
    /// Uniformly random positions.
    Random { num_part: usize },
}

/// The particles a run starts from, together with the box they live in.
#[derive(Debug, Clone)]
pub struct InitialConditions {
    box_size: DVec3,
    block: ParticleBlock,
}

impl InitialConditions {
    pub fn new(ic_cfg: &Yaml) -> Result<Self, ConfigError> {
        let kind = ic_cfg["type"]
            .as_str()
            .ok_or(ConfigError::MissingParameter("initial_conditions:type".to_string()))?
            .to_string();
        let box_size = parse_vec3(&ic_cfg["box_size"], "initial_conditions:box_size")?;
        if kind == "config" {
            return Self::from_config(ic_cfg, box_size);
        }

        let layout = match kind.as_str() {
            "lattice" => {
                let per_axis = match &ic_cfg["per_axis"] {
                    Yaml::Integer(n) => [*n as usize; 3],
                    Yaml::BadValue => [10; 3],
                    other => {
                        let v = parse_vec3(other, "initial_conditions:per_axis")?;
                        [v.x as usize, v.y as usize, v.z as usize]
                    }
                };
                Layout::Lattice { per_axis }
            }
            "random" => Layout::Random {
                num_part: ic_cfg["num_part"].as_i64().unwrap_or(1000) as usize,
            },
            _ => return Err(ConfigError::UnknownICs(kind)),
        };
        let mass = ic_cfg["mass"].as_f64().unwrap_or(1.);
        let smoothing_length = ic_cfg["smoothing_length"].as_f64().unwrap_or(0.05);
        let internal_energy = ic_cfg["internal_energy"].as_f64().unwrap_or(1.);
        let velocity_dispersion = ic_cfg["velocity_dispersion"].as_f64().unwrap_or(0.);
        let gravity = ic_cfg["gravity"].as_bool().unwrap_or(false);
        let num_dm = ic_cfg["num_dm"].as_i64().unwrap_or(0) as usize;
        let num_stars = ic_cfg["num_stars"].as_i64().unwrap_or(0) as usize;
        let seed = ic_cfg["seed"].as_i64().unwrap_or(0) as u64;
        let mut rng = StdRng::seed_from_u64(seed);

        let positions: Vec<DVec3> = match layout {
            Layout::Lattice { per_axis } => {
                let spacing = box_size / DVec3::new(per_axis[0] as f64, per_axis[1] as f64, per_axis[2] as f64);
                let mut positions = Vec::with_capacity(per_axis.iter().product());
                for i in 0..per_axis[0] {
                    for j in 0..per_axis[1] {
                        for k in 0..per_axis[2] {
                            positions.push((DVec3::new(i as f64, j as f64, k as f64) + 0.5) * spacing);
                        }
                    }
                }
                positions
            }
            Layout::Random { num_part } => (0..num_part).map(|_| random_position(&mut rng, box_size)).collect(),
        };

        let mut ics = Self::from_positions(box_size, &positions, mass, smoothing_length, internal_energy, gravity);
        for part in ics.block.parts.iter_mut() {
            part.v = velocity_dispersion * DVec3::new(rng.gen_range(-1. ..1.), rng.gen_range(-1. ..1.), rng.gen_range(-1. ..1.));
        }
        for gpart in ics.block.gparts.iter_mut() {
            if let PartnerLink::Local(i) = gpart.partner {
                gpart.v = ics.block.parts[i].v;
            }
        }
        let mut next_id = positions.len() as u64;
        for _ in 0..num_dm {
            ics.block.gparts.push(GPart {
                id: next_id,
                x: random_position(&mut rng, box_size),
                mass,
                kind: ParticleKind::DarkMatter,
                ..Default::default()
            });
            next_id += 1;
        }
        for _ in 0..num_stars {
            let x = random_position(&mut rng, box_size);
            ics.block.sparts.push(SPart {
                id: next_id,
                x,
                mass,
                gpart: Some(ics.block.gparts.len()),
                ..Default::default()
            });
            ics.block.gparts.push(GPart {
                id: next_id,
                x,
                mass,
                kind: ParticleKind::Star,
                ..Default::default()
            });
            next_id += 1;
        }
        relink_gparts(&ics.block.parts, &ics.block.sparts, &mut ics.block.gparts);
        Ok(ics)
    }

    /// Explicit list of gas particles (`particles: {x: [[..], ..], ...}`).
    fn from_config(ic_cfg: &Yaml, box_size: DVec3) -> Result<Self, ConfigError> {
        let particles = &ic_cfg["particles"];
        let positions = particles["x"]
            .as_vec()
            .ok_or(ConfigError::MissingParameter("initial_conditions:particles:x".to_string()))?
            .iter()
            .map(|x| parse_vec3(x, "initial_conditions:particles:x"))
            .collect::<Result<Vec<_>, _>>()?;
        let read_scalars = |name: &str, default: f64| -> Vec<f64> {
            match particles[name].as_vec() {
                Some(values) => values.iter().map(|v| v.as_f64().unwrap_or(default)).collect(),
                None => vec![default; positions.len()],
            }
        };
        let masses = read_scalars("mass", 1.);
        let smoothing_lengths = read_scalars("smoothing_length", 0.05);
        let internal_energies = read_scalars("internal_energy", 1.);
        if masses.len() != positions.len() || smoothing_lengths.len() != positions.len() {
            return Err(ConfigError::InvalidValue(
                "initial_conditions:particles".to_string(),
                "all particle properties need one value per particle".to_string(),
            ));
        }
        let gravity = ic_cfg["gravity"].as_bool().unwrap_or(false);
        let mut ics = Self::from_positions(box_size, &positions, 1., 0.05, 1., gravity);
        for (k, part) in ics.block.parts.iter_mut().enumerate() {
            part.mass = masses[k];
            part.h = smoothing_lengths[k];
            part.u = internal_energies.get(k).copied().unwrap_or(1.);
        }
        for gpart in ics.block.gparts.iter_mut() {
            if let PartnerLink::Local(i) = gpart.partner {
                gpart.mass = ics.block.parts[i].mass;
            }
        }
        Ok(ics)
    }

    /// Gas particles at `positions`, each with a gravity partner if `gravity` is set.
    pub fn from_positions(
        box_size: DVec3,
        positions: &[DVec3],
        mass: f64,
        smoothing_length: f64,
        internal_energy: f64,
        gravity: bool,
    ) -> Self {
        let mut block = ParticleBlock::default();
        for (id, &x) in positions.iter().enumerate() {
            let gpart = if gravity {
                block.gparts.push(GPart {
                    id: id as u64,
                    x,
                    mass,
                    kind: ParticleKind::Gas,
                    ..Default::default()
                });
                Some(block.gparts.len() - 1)
            } else {
                None
            };
            block.parts.push(Part {
                id: id as u64,
                x,
                mass,
                h: smoothing_length,
                u: internal_energy,
                gpart,
                ..Default::default()
            });
        }
        relink_gparts(&block.parts, &block.sparts, &mut block.gparts);
        Self { box_size, block }
    }

    pub fn from_block(box_size: DVec3, block: ParticleBlock) -> Self {
        Self { box_size, block }
    }

    pub fn box_size(&self) -> DVec3 {
        self.box_size
    }

    pub fn block(&self) -> &ParticleBlock {
        &self.block
    }

    /// Keep the contiguous share of the particles that rank `rank` of
    /// `nr_nodes` reads, as if every rank read its own slice of a file.
    pub fn into_rank_share(self, rank: usize, nr_nodes: usize) -> Self {
        if nr_nodes <= 1 {
            return self;
        }
        let share = |n: usize| -> Vec<usize> { (0..n).map(|i| i * nr_nodes / n.max(1)).collect() };
        let mut dest = Destinations {
            parts: share(self.block.parts.len()),
            gparts: vec![],
            sparts: share(self.block.sparts.len()),
        };
        // Gravity partners follow their owner, dark matter is shared out on its own.
        let dm = share(self.block.gparts.len());
        dest.gparts = self
            .block
            .gparts
            .iter()
            .enumerate()
            .map(|(gi, g)| match (g.kind, g.partner) {
                (ParticleKind::Gas, PartnerLink::Local(i)) => dest.parts[i],
                (ParticleKind::Star, PartnerLink::Local(i)) => dest.sparts[i],
                _ => dm[gi],
            })
            .collect();
        let blocks = self.block.split_by_destination(&dest, nr_nodes);
        let mut block = ParticleBlock::default();
        if let Some(mine) = blocks.into_iter().nth(rank) {
            block.append(mine);
        }
        Self {
            box_size: self.box_size,
            block,
        }
    }

    pub fn into_block(self) -> ParticleBlock {
        self.block
    }
}

fn random_position(rng: &mut StdRng, box_size: DVec3) -> DVec3 {
    DVec3::new(
        rng.gen_range(0. ..box_size.x),
        rng.gen_range(0. ..box_size.y),
        rng.gen_range(0. ..box_size.z),
    )
}

#[cfg(test)]
mod test {
    use yaml_rust::YamlLoader;

    use super::*;
    use crate::part::check_links;

    const IC_CFG: &str = r###"type: "lattice"
box_size: [1., 1., 1.]
per_axis: 4
gravity: true
num_dm: 5
num_stars: 3"###;

    #[test]
    fn test_lattice() {
        let cfg = &YamlLoader::load_from_str(IC_CFG).unwrap()[0];
        let ics = InitialConditions::new(cfg).unwrap();
        assert_eq!(ics.block().counts(), [64, 72, 3]);
        let block = ics.block();
        assert!(check_links(&block.parts, &block.gparts, &block.sparts).is_ok());
    }

    #[test]
    fn test_rank_share() {
        let cfg = &YamlLoader::load_from_str(IC_CFG).unwrap()[0];
        let ics = InitialConditions::new(cfg).unwrap();
        let shares: Vec<_> = (0..2).map(|r| ics.clone().into_rank_share(r, 2)).collect();
        let total: usize = shares.iter().map(|s| s.block().parts.len()).sum();
        assert_eq!(total, 64);
        for share in shares.iter() {
            let b = share.block();
            assert!(check_links(&b.parts, &b.gparts, &b.sparts).is_ok());
        }
    }

    #[test]
    fn test_unknown_type() {
        let cfg = &YamlLoader::load_from_str("type: \"sodshock\"\nbox_size: [1., 1., 1.]").unwrap()[0];
        assert!(matches!(InitialConditions::new(cfg), Err(ConfigError::UnknownICs(_))));
    }
}
