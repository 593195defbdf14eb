use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};

use crate::{cell::CellId, macros::fatal};

pub type TaskId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(usize)]
pub enum TaskType {
    None = 0,
    Sort,
    SelfInteraction,
    Pair,
    SubSelf,
    SubPair,
    Init,
    Ghost,
    ExtraGhost,
    Drift,
    Kick1,
    Kick2,
    Timestep,
    Send,
    Recv,
    GravUp,
    GravDown,
    GravMm,
    GravGatherM,
    GravFft,
    Cooling,
    SourceTerms,
}

pub const TASK_TYPE_COUNT: usize = 22;

pub const TASK_TYPE_NAMES: [&str; TASK_TYPE_COUNT] = [
    "none",
    "sort",
    "self",
    "pair",
    "sub_self",
    "sub_pair",
    "init",
    "ghost",
    "extra_ghost",
    "drift",
    "kick1",
    "kick2",
    "timestep",
    "send",
    "recv",
    "grav_up",
    "grav_down",
    "grav_mm",
    "grav_gather_m",
    "grav_fft",
    "cooling",
    "sourceterms",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::IntoPrimitive, num_enum::TryFromPrimitive)]
#[repr(usize)]
pub enum TaskSubtype {
    None = 0,
    Density,
    Gradient,
    Force,
    Grav,
    ExternalGrav,
    Tend,
    Xv,
    Rho,
    GradientComm,
}

pub const TASK_SUBTYPE_NAMES: [&str; 10] = [
    "none", "density", "gradient", "force", "grav", "external_grav", "tend", "xv", "rho", "gradient_comm",
];

impl TaskType {
    pub fn name(self) -> &'static str {
        TASK_TYPE_NAMES[usize::from(self)]
    }

    pub fn is_pair_like(self) -> bool {
        matches!(self, TaskType::Pair | TaskType::SubPair)
    }

    pub fn is_self_like(self) -> bool {
        matches!(self, TaskType::SelfInteraction | TaskType::SubSelf)
    }
}

impl TaskSubtype {
    pub fn name(self) -> &'static str {
        TASK_SUBTYPE_NAMES[usize::from(self)]
    }

    pub fn is_hydro_loop(self) -> bool {
        matches!(self, TaskSubtype::Density | TaskSubtype::Gradient | TaskSubtype::Force)
    }

    pub fn is_gravity(self) -> bool {
        matches!(self, TaskSubtype::Grav | TaskSubtype::ExternalGrav)
    }

    /// Message channel of a communication subtype, used to derive tags.
    pub fn channel(self) -> u64 {
        match self {
            TaskSubtype::Xv => 0,
            TaskSubtype::Rho => 1,
            TaskSubtype::Tend => 2,
            TaskSubtype::GradientComm => 3,
            _ => fatal!("Subtype {:?} is not a communication subtype", self),
        }
    }
}

/// A unit of work in the task graph.
///
/// The graph structure (`unlocks`, cells, type) is immutable between
/// rebuilds; the per-step state (`skip`, `wait`, `flags`) is atomic so that
/// the unskip pass and the workers can update it through shared references.
#[derive(Debug)]
pub struct Task {
    pub ty: TaskType,
    pub subtype: TaskSubtype,
    pub ci: Option<CellId>,
    pub cj: Option<CellId>,
    /// Sort direction for pairs, requested sort directions for sorts.
    pub flags: AtomicU32,
    /// Message tag for send and receive tasks.
    pub tag: u64,
    /// Pair tasks whose cells must stay close enough for the interaction to
    /// remain valid without a rebuild.
    pub tight: bool,
    /// Queue the task is enqueued on.
    pub owner: usize,
    pub skip: AtomicBool,
    pub wait: AtomicI32,
    pub weight: i64,
    pub cost: i64,
    pub rank: usize,
    pub unlocks: std::ops::Range<usize>,
    pub executions: AtomicU32,
}

impl Task {
    pub fn new(ty: TaskType, subtype: TaskSubtype, flags: u32, tag: u64, ci: Option<CellId>, cj: Option<CellId>, tight: bool) -> Self {
        Self {
            ty,
            subtype,
            ci,
            cj,
            flags: AtomicU32::new(flags),
            tag,
            tight,
            owner: 0,
            skip: AtomicBool::new(true),
            wait: AtomicI32::new(0),
            weight: 0,
            cost: 0,
            rank: 0,
            unlocks: 0..0,
            executions: AtomicU32::new(0),
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip.load(Ordering::Acquire)
    }

    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Acquire)
    }

    pub fn label(&self) -> String {
        format!("{}/{}", self.ty.name(), self.subtype.name())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_names_match_discriminants() {
        for k in 0..TASK_TYPE_COUNT {
            let ty = TaskType::try_from(k).expect("valid discriminant");
            assert_eq!(ty.name(), TASK_TYPE_NAMES[k]);
        }
        assert_eq!(TaskType::SourceTerms.name(), "sourceterms");
        assert_eq!(TaskSubtype::Rho.name(), "rho");
        assert!(TaskType::try_from(TASK_TYPE_COUNT).is_err());
    }

    #[test]
    fn test_channels() {
        assert_eq!(TaskSubtype::Xv.channel(), 0);
        assert_eq!(TaskSubtype::GradientComm.channel(), 3);
    }
}
