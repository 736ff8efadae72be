//! rtsim - Deterministic discrete-event simulator for energy-aware real-time
//! scheduling on heterogeneous multiprocessors.
//!
//! Periodic and sporadic tasks, optionally enveloped in Constant Bandwidth
//! Servers, are placed by an energy-aware kernel on the CPUs of a
//! big.LITTLE-style platform. Each island runs at one shared operating
//! point; the kernel picks the (core, OPP) pair that raises power the least
//! while keeping every core EDF-schedulable, and idle cores pull work from
//! their neighbours.
//!
//! # Architecture
//!
//! - **Engine**: event loop, energy meter, observers
//! - **Kernel**: batch placement, migration, CBS event handling
//! - **MultiCoresScheds**: per-core ready queues and context switches
//! - **CbServer**: the CBS state machine
//! - **Scheduler**: EDF / FIFO / fixed-priority / round-robin ready queues
//! - **Power**: CMOS and table-driven speed/power models
//!
//! # Usage
//!
//! ```rust,no_run
//! use rtsim::*;
//!
//! let scenario = Scenario::builder()
//!     .platform(Platform::big_little(2, 2))
//!     .task(TaskDef::periodic("control", 100, 20))
//!     .task(TaskDef::periodic("video", 40, 10).with_workload("hash"))
//!     .duration(10_000)
//!     .build();
//!
//! let mut sim = Simulator::new(scenario).unwrap();
//! sim.run().unwrap();
//! println!("{}", sim.report());
//! ```

pub mod cbs;
pub mod cpu;
pub mod engine;
pub mod error;
pub mod event;
pub mod fmt;
pub mod history;
pub mod kernel;
pub mod multi;
pub mod platform;
pub mod policy;
pub mod power;
pub mod scenario;
pub mod sched;
pub mod stats;
pub mod system;
pub mod task;
pub mod taskgen;
pub mod trace;
pub mod types;

// Re-export the main public types for convenience.
pub use cbs::{CbServer, IdlePolicy, ServerDef, ServerStatus};
pub use engine::{Observer, Simulator};
pub use error::SimError;
pub use event::{sim_clock, sim_cpu};
pub use fmt::{FmtTs, SimFormat};
pub use kernel::{EnergyMrtKernel, Placement};
pub use platform::Platform;
pub use policy::DispatchPolicy;
pub use power::{CmosModel, Opp, PowerModel, TableModel};
pub use scenario::Scenario;
pub use sched::{SchedParams, SchedPolicy, Scheduler};
pub use task::{Activation, TaskDef};
pub use trace::{Trace, TraceEvent, TraceKind};
pub use types::{CpuId, Entity, IslandId, ServerId, TaskId, Tick, Workload};
