//! Run-time parameters of the engine, read from the YAML configuration.

use std::{fs, path::Path};

use yaml_rust::{Yaml, YamlLoader};

use crate::{errors::ConfigError, partition::RepartitionKind};

fn required_f64(yaml: &Yaml, name: &str) -> Result<f64, ConfigError> {
    match yaml {
        Yaml::Real(_) => yaml.as_f64().ok_or_else(|| ConfigError::InvalidValue(name.to_string(), format!("{:?}", yaml))),
        Yaml::Integer(i) => Ok(*i as f64),
        Yaml::BadValue => Err(ConfigError::MissingParameter(name.to_string())),
        other => Err(ConfigError::InvalidValue(name.to_string(), format!("{:?}", other))),
    }
}

fn optional_f64(yaml: &Yaml, name: &str) -> Result<Option<f64>, ConfigError> {
    match yaml {
        Yaml::BadValue => Ok(None),
        other => required_f64(other, name).map(Some),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TimeIntegrationCfg {
    pub time_begin: f64,
    pub time_end: f64,
    pub dt_min: f64,
    pub dt_max: f64,
}

impl TimeIntegrationCfg {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let time_begin = optional_f64(&yaml["time_begin"], "time_integration:time_begin")?.unwrap_or(0.);
        let time_end = required_f64(&yaml["time_end"], "time_integration:time_end")?;
        let dt_min = required_f64(&yaml["dt_min"], "time_integration:dt_min")?;
        let dt_max = required_f64(&yaml["dt_max"], "time_integration:dt_max")?;
        if time_end <= time_begin {
            return Err(ConfigError::InvalidValue(
                "time_integration:time_end".to_string(),
                format!("{} is not after time_begin {}", time_end, time_begin),
            ));
        }
        if dt_min <= 0. {
            return Err(ConfigError::InvalidValue("time_integration:dt_min".to_string(), dt_min.to_string()));
        }
        if dt_min > dt_max {
            return Err(ConfigError::InvertedTimestepBounds { dt_min, dt_max });
        }
        Ok(Self {
            time_begin,
            time_end,
            dt_min,
            dt_max,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerCfg {
    pub nr_threads: usize,
    pub nr_queues: usize,
    pub steal: bool,
    pub max_tasks_per_cell: usize,
    /// Re-rank and reweight the tasks every this many steps (0 disables).
    pub reweight_frequency: usize,
}

impl SchedulerCfg {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let nr_threads = yaml["nr_threads"].as_i64().unwrap_or(1);
        if nr_threads <= 0 {
            return Err(ConfigError::InvalidValue("scheduler:nr_threads".to_string(), nr_threads.to_string()));
        }
        let nr_queues = yaml["nr_queues"].as_i64().unwrap_or(nr_threads);
        if nr_queues <= 0 {
            return Err(ConfigError::InvalidValue("scheduler:nr_queues".to_string(), nr_queues.to_string()));
        }
        Ok(Self {
            nr_threads: nr_threads as usize,
            nr_queues: nr_queues as usize,
            steal: yaml["steal"].as_bool().unwrap_or(true),
            max_tasks_per_cell: yaml["max_tasks_per_cell"].as_i64().unwrap_or(96).max(1) as usize,
            reweight_frequency: yaml["reweight_frequency"].as_i64().unwrap_or(10).max(0) as usize,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DomainCfg {
    pub repartition: RepartitionKind,
    /// Relative spread of the step times across ranks that triggers a
    /// repartition.
    pub fractional_time: f64,
    /// Force a rebuild every this many steps (0 disables).
    pub rebuild_frequency: usize,
}

impl DomainCfg {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let repartition = match yaml["repartition"].as_str().unwrap_or("task_costs") {
            "none" => RepartitionKind::None,
            "particle_counts" => RepartitionKind::ParticleCounts,
            "task_costs" => RepartitionKind::TaskCosts,
            other => return Err(ConfigError::UnknownRepartition(other.to_string())),
        };
        let fractional_time = optional_f64(&yaml["fractional_time"], "domain:fractional_time")?.unwrap_or(0.1);
        if fractional_time <= 0. {
            return Err(ConfigError::InvalidValue(
                "domain:fractional_time".to_string(),
                fractional_time.to_string(),
            ));
        }
        Ok(Self {
            repartition,
            fractional_time,
            rebuild_frequency: yaml["rebuild_frequency"].as_i64().unwrap_or(0).max(0) as usize,
        })
    }
}

/// Number of interaction loops of the hydro scheme.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HydroScheme {
    /// Density and force loops.
    TwoLoop,
    /// Density, gradient and force loops.
    ThreeLoop,
}

impl HydroScheme {
    pub fn has_gradient_loop(self) -> bool {
        matches!(self, HydroScheme::ThreeLoop)
    }
}

/// Which parts of the task graph are built.
#[derive(Debug, Clone, Copy)]
pub struct Policy {
    pub hydro: bool,
    pub hydro_scheme: HydroScheme,
    pub self_gravity: bool,
    pub external_gravity: bool,
    pub cooling: bool,
    pub source_terms: bool,
    /// Drift every particle at every step, not just the active ones.
    pub drift_all: bool,
}

impl Default for Policy {
    fn default() -> Self {
        Self {
            hydro: true,
            hydro_scheme: HydroScheme::TwoLoop,
            self_gravity: false,
            external_gravity: false,
            cooling: false,
            source_terms: false,
            drift_all: false,
        }
    }
}

impl Policy {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let default = Self::default();
        let hydro_scheme = match yaml["hydro_scheme"].as_str().unwrap_or("two_loop") {
            "two_loop" => HydroScheme::TwoLoop,
            "three_loop" => HydroScheme::ThreeLoop,
            other => return Err(ConfigError::UnknownHydroScheme(other.to_string())),
        };
        Ok(Self {
            hydro: yaml["hydro"].as_bool().unwrap_or(default.hydro),
            hydro_scheme,
            self_gravity: yaml["self_gravity"].as_bool().unwrap_or(default.self_gravity),
            external_gravity: yaml["external_gravity"].as_bool().unwrap_or(default.external_gravity),
            cooling: yaml["cooling"].as_bool().unwrap_or(default.cooling),
            source_terms: yaml["source_terms"].as_bool().unwrap_or(default.source_terms),
            drift_all: yaml["drift_all"].as_bool().unwrap_or(default.drift_all),
        })
    }

    pub fn gravity(&self) -> bool {
        self.self_gravity || self.external_gravity
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotCfg {
    pub basename: String,
    pub time_first: Option<f64>,
    /// No snapshots are written during the run without an interval.
    pub delta_time: Option<f64>,
}

impl SnapshotCfg {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let delta_time = optional_f64(&yaml["delta_time"], "snapshots:delta_time")?;
        if let Some(dt) = delta_time {
            if dt <= 0. {
                return Err(ConfigError::InvalidValue("snapshots:delta_time".to_string(), dt.to_string()));
            }
        }
        Ok(Self {
            basename: yaml["basename"].as_str().unwrap_or("snapshot").to_string(),
            time_first: optional_f64(&yaml["time_first"], "snapshots:time_first")?,
            delta_time,
        })
    }
}

#[derive(Debug, Clone)]
pub struct StatisticsCfg {
    pub basename: String,
    pub delta_time: Option<f64>,
}

impl StatisticsCfg {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        let delta_time = optional_f64(&yaml["delta_time"], "statistics:delta_time")?;
        if let Some(dt) = delta_time {
            if dt <= 0. {
                return Err(ConfigError::InvalidValue("statistics:delta_time".to_string(), dt.to_string()));
            }
        }
        Ok(Self {
            basename: yaml["basename"].as_str().unwrap_or("run").to_string(),
            delta_time,
        })
    }
}

/// Complete engine configuration. The `space`, `initial_conditions` and
/// `physics` sections are kept as YAML and read by their own modules.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub time_integration: TimeIntegrationCfg,
    pub scheduler: SchedulerCfg,
    pub domain: DomainCfg,
    pub policy: Policy,
    pub snapshots: SnapshotCfg,
    pub statistics: StatisticsCfg,
    pub space: Yaml,
    pub initial_conditions: Yaml,
    pub physics: Yaml,
}

impl EngineConfig {
    pub fn parse(yaml: &Yaml) -> Result<Self, ConfigError> {
        Ok(Self {
            time_integration: TimeIntegrationCfg::parse(&yaml["time_integration"])?,
            scheduler: SchedulerCfg::parse(&yaml["scheduler"])?,
            domain: DomainCfg::parse(&yaml["domain"])?,
            policy: Policy::parse(&yaml["policy"])?,
            snapshots: SnapshotCfg::parse(&yaml["snapshots"])?,
            statistics: StatisticsCfg::parse(&yaml["statistics"])?,
            space: yaml["space"].clone(),
            initial_conditions: yaml["initial_conditions"].clone(),
            physics: yaml["physics"].clone(),
        })
    }

    pub fn load_from_str(source: &str) -> Result<Self, ConfigError> {
        let docs = YamlLoader::load_from_str(source)?;
        match docs.first() {
            Some(doc) => Self::parse(doc),
            None => Err(ConfigError::MissingParameter("time_integration".to_string())),
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        Self::load_from_str(&fs::read_to_string(path)?)
    }
}

#[cfg(test)]
mod test {
    use float_cmp::assert_approx_eq;
    use yaml_rust::YamlLoader;

    use super::*;

    const CONFIG: &str = r###"
time_integration:
  time_end: 1.
  dt_min: 1e-8
  dt_max: 1e-2
scheduler:
  nr_threads: 3
domain:
  repartition: "particle_counts"
policy:
  hydro_scheme: "three_loop"
  self_gravity: true
snapshots:
  delta_time: 0.25
"###;

    #[test]
    fn test_parse() {
        let config = EngineConfig::load_from_str(CONFIG).unwrap();
        assert_approx_eq!(f64, config.time_integration.time_begin, 0.);
        assert_eq!(config.scheduler.nr_queues, 3);
        assert!(config.scheduler.steal);
        assert_eq!(config.domain.repartition, RepartitionKind::ParticleCounts);
        assert_approx_eq!(f64, config.domain.fractional_time, 0.1);
        assert!(config.policy.hydro_scheme.has_gradient_loop());
        assert!(config.policy.gravity());
        assert_eq!(config.snapshots.basename, "snapshot");
        assert!(config.statistics.delta_time.is_none());
    }

    #[test]
    fn test_invalid_values() {
        let yaml = &YamlLoader::load_from_str("time_end: 1.\ndt_min: 1e-2\ndt_max: 1e-3").unwrap()[0];
        assert!(matches!(
            TimeIntegrationCfg::parse(yaml),
            Err(ConfigError::InvertedTimestepBounds { .. })
        ));
        let yaml = &YamlLoader::load_from_str("time_end: 1.\ndt_max: 1e-3").unwrap()[0];
        assert!(matches!(TimeIntegrationCfg::parse(yaml), Err(ConfigError::MissingParameter(_))));
        let yaml = &YamlLoader::load_from_str("nr_threads: 0").unwrap()[0];
        assert!(SchedulerCfg::parse(yaml).is_err());
        let yaml = &YamlLoader::load_from_str("repartition: \"metis\"").unwrap()[0];
        assert!(matches!(DomainCfg::parse(yaml), Err(ConfigError::UnknownRepartition(_))));
        let yaml = &YamlLoader::load_from_str("hydro_scheme: \"four_loop\"").unwrap()[0];
        assert!(matches!(Policy::parse(yaml), Err(ConfigError::UnknownHydroScheme(_))));
    }
}
