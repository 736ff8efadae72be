//! Simulated CPUs and frequency islands.
//!
//! An island groups CPUs that share one operating point (big.LITTLE
//! clusters). The OPP index is stored once, on the island; CPUs only carry a
//! cached copy that [`System::set_island_opp`](crate::system::System) keeps
//! in lock-step.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::power::{Opp, PowerModel};
use crate::types::{CpuId, IslandId, Workload};

/// Kind of the cores of an island.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoreKind {
    Big,
    Little,
}

impl fmt::Display for CoreKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoreKind::Big => f.write_str("big"),
            CoreKind::Little => f.write_str("LITTLE"),
        }
    }
}

/// A simulated CPU.
#[derive(Debug, Clone)]
pub struct Cpu {
    pub id: CpuId,
    pub island: IslandId,
    /// Copy of the island's OPP index.
    pub opp: usize,
    /// Workload of the entity currently running here, `idle` otherwise.
    pub workload: Workload,
    /// Whether an entity is committed as running on this CPU.
    pub busy: bool,
    /// Disabled CPUs never receive placements or migrations.
    pub disabled: bool,
}

impl Cpu {
    pub fn new(id: CpuId, island: IslandId, opp: usize) -> Self {
        Cpu {
            id,
            island,
            opp,
            workload: Workload::idle(),
            busy: false,
            disabled: false,
        }
    }

    pub fn is_idle(&self) -> bool {
        !self.busy
    }
}

/// A group of CPUs running at one shared operating point.
#[derive(Debug, Clone)]
pub struct Island {
    pub id: IslandId,
    pub name: String,
    pub kind: CoreKind,
    /// Operating points in ascending frequency order.
    pub opps: Vec<Opp>,
    pub model: Arc<dyn PowerModel>,
    pub cpus: Vec<CpuId>,
    opp: usize,
}

impl Island {
    /// Build an island at its lowest operating point.
    ///
    /// # Panics
    /// Panics if `opps` is empty or not sorted by ascending frequency.
    pub fn new(
        id: IslandId,
        name: &str,
        kind: CoreKind,
        opps: Vec<Opp>,
        model: Arc<dyn PowerModel>,
    ) -> Self {
        assert!(!opps.is_empty(), "island {name} has no operating points");
        assert!(
            opps.windows(2).all(|w| w[0].freq_mhz < w[1].freq_mhz),
            "island {name}: operating points must be sorted by ascending frequency"
        );
        Island {
            id,
            name: name.to_string(),
            kind,
            opps,
            model,
            cpus: Vec::new(),
            opp: 0,
        }
    }

    /// Current OPP index.
    pub fn opp_index(&self) -> usize {
        self.opp
    }

    pub fn current_opp(&self) -> &Opp {
        &self.opps[self.opp]
    }

    pub fn max_opp_index(&self) -> usize {
        self.opps.len() - 1
    }

    pub fn freq_mhz(&self) -> u32 {
        self.current_opp().freq_mhz
    }

    /// Speed of a member CPU at OPP `idx` for `workload`.
    pub fn speed_at(&self, idx: usize, workload: &Workload) -> f64 {
        self.model.speed(&self.opps[idx], workload)
    }

    /// Power of one member CPU at OPP `idx` for `workload`.
    pub fn power_at(&self, idx: usize, workload: &Workload) -> f64 {
        self.model.power(&self.opps[idx], workload)
    }

    pub fn speed(&self, workload: &Workload) -> f64 {
        self.speed_at(self.opp, workload)
    }

    /// Move the island to OPP `idx`, fanning the change out to `cpus`.
    /// Returns the previous index.
    pub(crate) fn set_opp(&mut self, idx: usize, cpus: &mut [Cpu]) -> usize {
        assert!(
            idx < self.opps.len(),
            "island {}: OPP index {idx} out of range",
            self.name
        );
        let old = self.opp;
        self.opp = idx;
        for cpu in &self.cpus {
            cpus[cpu.idx()].opp = idx;
        }
        old
    }
}
