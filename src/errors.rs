use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required parameter in configuration: {0}")]
    MissingParameter(String),
    #[error("Invalid value for parameter {0}: {1}")]
    InvalidValue(String, String),
    #[error("Unknown type of initial conditions configured: {0}")]
    UnknownICs(String),
    #[error("Unknown repartition kind configured: {0}")]
    UnknownRepartition(String),
    #[error("Unknown hydro scheme configured: {0}")]
    UnknownHydroScheme(String),
    #[error("Minimal timestep ({dt_min}) larger than maximal timestep ({dt_max})")]
    InvertedTimestepBounds { dt_min: f64, dt_max: f64 },
    #[error("Periodic boxes need at least 3 top-level cells along each axis, got {0:?}")]
    TooFewTopLevelCells([usize; 3]),
    #[error("Error reading configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Error parsing configuration: {0}")]
    Yaml(#[from] yaml_rust::ScanError),
}

/// Failure status of the inter-rank transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("rank {0} is no longer reachable")]
    Disconnected(usize),
    #[error("malformed message (source {source_rank}, tag {tag})")]
    Malformed { source_rank: usize, tag: u64 },
    #[error("invalid destination rank {0}")]
    InvalidRank(usize),
    #[error("message tag {0} does not fit the transport")]
    TagOverflow(u64),
    #[error("MPI could not be initialised")]
    MpiInit,
    #[error("MPI provides thread support {0}, at least serialized calls are needed")]
    ThreadingLevel(String),
}
