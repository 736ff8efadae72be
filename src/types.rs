//! Newtype wrappers and type aliases for domain concepts.
//!
//! Every long-lived object of a simulation lives in an arena owned by the
//! [`System`](crate::system::System) and is referenced by one of the small
//! copyable ids below. Cross references are id lookups, never pointers.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Simulated time in ticks.
pub type Tick = u64;

/// Task identifier (index into the task arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct TaskId(pub u32);

/// CBS server identifier (index into the server arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct ServerId(pub u32);

/// CPU identifier (index into the CPU arena).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct CpuId(pub u32);

/// Island (frequency domain) identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct IslandId(pub u32);

impl TaskId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl ServerId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl CpuId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

impl IslandId {
    pub fn idx(self) -> usize {
        self.0 as usize
    }
}

/// Anything a per-core scheduler can order and a CPU can run: a plain task
/// or a CBS server enveloping tasks.
///
/// The derived ordering (tasks before servers, then by numeric id) is the
/// final tie-break of every scheduling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Entity {
    Task(TaskId),
    Server(ServerId),
}

impl Entity {
    pub fn task(self) -> Option<TaskId> {
        match self {
            Entity::Task(t) => Some(t),
            Entity::Server(_) => None,
        }
    }

    pub fn server(self) -> Option<ServerId> {
        match self {
            Entity::Server(s) => Some(s),
            Entity::Task(_) => None,
        }
    }

    pub fn is_server(self) -> bool {
        matches!(self, Entity::Server(_))
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entity::Task(t) => write!(f, "T{}", t.0),
            Entity::Server(s) => write!(f, "S{}", s.0),
        }
    }
}

impl From<TaskId> for Entity {
    fn from(t: TaskId) -> Self {
        Entity::Task(t)
    }
}

impl From<ServerId> for Entity {
    fn from(s: ServerId) -> Self {
        Entity::Server(s)
    }
}

/// Workload tag of a task or CPU. Power models use it to pick per-workload
/// speed and power coefficients (e.g. `bzip2`, `hash`, `cachekiller`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Workload(pub String);

impl Workload {
    pub const IDLE: &'static str = "idle";
    pub const DEFAULT: &'static str = "default";

    pub fn new(name: &str) -> Self {
        Workload(name.to_string())
    }

    /// The tag carried by a CPU with nothing to run.
    pub fn idle() -> Self {
        Workload(Self::IDLE.to_string())
    }

    pub fn is_idle(&self) -> bool {
        self.0 == Self::IDLE
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for Workload {
    fn default() -> Self {
        Workload(Self::DEFAULT.to_string())
    }
}

impl fmt::Display for Workload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Tolerance used by every utilization comparison against 1.0.
pub const UTIL_EPSILON: f64 = 1e-9;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_order_is_tasks_then_servers_by_id() {
        let mut v = vec![
            Entity::Server(ServerId(0)),
            Entity::Task(TaskId(3)),
            Entity::Task(TaskId(1)),
        ];
        v.sort();
        assert_eq!(
            v,
            vec![
                Entity::Task(TaskId(1)),
                Entity::Task(TaskId(3)),
                Entity::Server(ServerId(0)),
            ]
        );
    }

    #[test]
    fn entity_display() {
        assert_eq!(Entity::Task(TaskId(4)).to_string(), "T4");
        assert_eq!(Entity::Server(ServerId(2)).to_string(), "S2");
    }
}
