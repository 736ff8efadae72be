//! Recoverable error taxonomy.
//!
//! Programming-error class failures (a CBS server entering a state the model
//! declares unreachable, killing an already-killed server, a migration race
//! that recurs after its single retry) are not represented here: they abort
//! the run through [`invariant!`](crate::invariant).

use std::fmt;

use crate::types::{CpuId, Entity, ServerId, Tick};

/// Errors returned by scheduler, server and kernel operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SimError {
    /// The entity is already present in the scheduler.
    DuplicateTask(Entity),
    /// The entity was never added to the scheduler.
    UnknownTask(Entity),
    /// No server with this id exists.
    UnknownServer(ServerId),
    /// No CPU with this id exists.
    UnknownCpu(CpuId),
    /// A CBS budget outside `(0, P]`.
    InvalidBudget { budget: Tick, period: Tick },
    /// A dispatch policy whose flags contradict each other.
    InvalidPolicy(String),
    /// A scenario that cannot be turned into a simulation.
    InvalidScenario(String),
}

impl fmt::Display for SimError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SimError::DuplicateTask(e) => write!(f, "{e} is already present in the scheduler"),
            SimError::UnknownTask(e) => write!(f, "{e} was never added to the scheduler"),
            SimError::UnknownServer(s) => write!(f, "unknown server S{}", s.0),
            SimError::UnknownCpu(c) => write!(f, "unknown cpu {}", c.0),
            SimError::InvalidBudget { budget, period } => {
                write!(f, "invalid budget {budget} for period {period}")
            }
            SimError::InvalidPolicy(msg) => write!(f, "invalid dispatch policy: {msg}"),
            SimError::InvalidScenario(msg) => write!(f, "invalid scenario: {msg}"),
        }
    }
}

impl std::error::Error for SimError {}

/// Abort the run on a broken model invariant.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        assert!($cond, "invariant violation: {}", format_args!($($arg)+))
    };
}
