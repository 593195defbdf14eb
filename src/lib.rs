//! Task-based parallel engine for particle hydrodynamics and gravity
//! simulations, distributed over several ranks.
//!
//! The simulation volume is decomposed in a grid of top-level cells, each
//! refined into an octree. Every step, the [`Engine`] activates the tasks of
//! the cells whose particles reach the end of their time-step and runs them
//! through a work-stealing [`Scheduler`] with dependencies and cell locks.
//! Particles that cross rank boundaries are exchanged through [`Proxy`]
//! objects over a [`Communicator`].

pub use cell::{Cell, CellId};
#[cfg(feature = "mpi")]
pub use comm::MpiComm;
pub use comm::{CommExt, Communicator, LocalComm, MsgContext};
pub use config::{EngineConfig, HydroScheme, Policy};
pub use engine::{make_proxies, mark_tasks, needs_rebuild, skip_drift_and_kick2, skip_force_and_kick, Engine};
pub use errors::{ConfigError, TransportError};
pub use initial_conditions::InitialConditions;
pub use link::LinkTable;
pub use part::{GPart, Part, ParticleBlock, SPart};
pub use partition::{GridPartitioner, Partitioner, RepartitionKind};
pub use physics::{NullPhysics, Physics, SphPhysics, StepInfo};
pub use proxy::Proxy;
pub use scheduler::Scheduler;
pub use space::Space;
pub use task::{Task, TaskId, TaskSubtype, TaskType};
pub use timeline::{IntegerTime, TimeLine};

pub mod cell;
pub mod comm;
pub mod config;
mod engine;
mod equation_of_state;
mod errors;
pub mod gravity;
mod initial_conditions;
pub mod io;
mod kernels;
pub mod link;
mod macros;
pub mod part;
pub mod partition;
pub mod physics;
pub mod proxy;
mod queue;
pub mod runner;
pub mod scheduler;
pub mod space;
pub mod statistics;
pub mod task;
pub mod timeline;
mod utils;

pub use equation_of_state::EquationOfState;
pub use kernels::KernelKind;
