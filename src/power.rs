//! CPU speed and power models.
//!
//! The kernel never computes speed or power itself: it asks the island's
//! [`PowerModel`] for `speed(opp, workload)` and `power(opp, workload)`, both
//! pure functions of the operating point and the workload tag. Speed is
//! relative to the reference core (1.0 = the speed WCETs are expressed at).

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::types::Workload;

/// An operating point: a frequency/voltage pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Opp {
    pub freq_mhz: u32,
    pub volt: f64,
}

impl Opp {
    pub fn new(freq_mhz: u32, volt: f64) -> Self {
        Opp { freq_mhz, volt }
    }

    pub fn freq_ghz(&self) -> f64 {
        self.freq_mhz as f64 / 1000.0
    }
}

impl fmt::Display for Opp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}MHz@{:.4}V", self.freq_mhz, self.volt)
    }
}

/// Speed and power lookup for one kind of core.
pub trait PowerModel: fmt::Debug + Send + Sync {
    /// Relative speed of a core at `opp` running `workload`.
    fn speed(&self, opp: &Opp, workload: &Workload) -> f64;
    /// Power drawn (watts) by a core at `opp` running `workload`.
    fn power(&self, opp: &Opp, workload: &Workload) -> f64;
}

/// Per-workload coefficients of [`CmosModel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WorkloadCoeffs {
    /// Instructions-per-cycle factor relative to the default workload.
    pub ipc: f64,
    /// Switching-activity factor scaling the dynamic power.
    pub activity: f64,
}

impl Default for WorkloadCoeffs {
    fn default() -> Self {
        WorkloadCoeffs {
            ipc: 1.0,
            activity: 1.0,
        }
    }
}

/// Analytic CMOS model.
///
/// `speed = capacity * f / f_ref * ipc(workload)` and
/// `power = P_static + C_eff * activity(workload) * V^2 * f[GHz]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmosModel {
    /// Frequency at which `capacity` is measured.
    pub ref_freq_mhz: u32,
    /// Speed at `ref_freq_mhz` for the default workload.
    pub capacity: f64,
    /// Effective switched capacitance (W / (V^2 * GHz)).
    pub ceff: f64,
    /// Leakage, drawn whatever the workload.
    pub static_w: f64,
    #[serde(default)]
    pub workloads: BTreeMap<String, WorkloadCoeffs>,
}

impl CmosModel {
    pub fn new(ref_freq_mhz: u32, capacity: f64, ceff: f64, static_w: f64) -> Self {
        CmosModel {
            ref_freq_mhz,
            capacity,
            ceff,
            static_w,
            workloads: BTreeMap::new(),
        }
        .with_standard_workloads()
    }

    /// Register (or replace) the coefficients of a workload.
    pub fn workload(mut self, name: &str, ipc: f64, activity: f64) -> Self {
        self.workloads
            .insert(name.to_string(), WorkloadCoeffs { ipc, activity });
        self
    }

    /// Coefficients of the workloads shipped with the reference platform.
    fn with_standard_workloads(self) -> Self {
        self.workload(Workload::DEFAULT, 1.0, 1.0)
            .workload("bzip2", 1.0, 1.0)
            .workload("hash", 1.1, 1.05)
            .workload("encrypt", 0.95, 1.1)
            .workload("decrypt", 0.95, 1.1)
            .workload("cachekiller", 0.6, 0.8)
            .workload(Workload::IDLE, 1.0, 0.05)
    }

    fn coeffs(&self, workload: &Workload) -> WorkloadCoeffs {
        self.workloads
            .get(workload.as_str())
            .or_else(|| self.workloads.get(Workload::DEFAULT))
            .copied()
            .unwrap_or_default()
    }
}

impl PowerModel for CmosModel {
    fn speed(&self, opp: &Opp, workload: &Workload) -> f64 {
        let c = self.coeffs(workload);
        self.capacity * (opp.freq_mhz as f64 / self.ref_freq_mhz as f64) * c.ipc
    }

    fn power(&self, opp: &Opp, workload: &Workload) -> f64 {
        let c = self.coeffs(workload);
        self.static_w + self.ceff * c.activity * opp.volt * opp.volt * opp.freq_ghz()
    }
}

/// One row of a [`TableModel`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    pub speed: f64,
    pub power: f64,
}

/// Explicit per-(frequency, workload) measurements.
///
/// Lookups for a workload without a row fall back to the `default` workload;
/// a frequency without any row is a configuration error reported as speed 0
/// (which makes every placement at that OPP inadmissible).
#[derive(Debug, Clone, Default)]
pub struct TableModel {
    entries: BTreeMap<(u32, String), TableEntry>,
}

impl TableModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry(mut self, freq_mhz: u32, workload: &str, speed: f64, power: f64) -> Self {
        self.entries
            .insert((freq_mhz, workload.to_string()), TableEntry { speed, power });
        self
    }

    fn lookup(&self, opp: &Opp, workload: &Workload) -> Option<&TableEntry> {
        self.entries
            .get(&(opp.freq_mhz, workload.0.clone()))
            .or_else(|| {
                self.entries
                    .get(&(opp.freq_mhz, Workload::DEFAULT.to_string()))
            })
    }
}

impl PowerModel for TableModel {
    fn speed(&self, opp: &Opp, workload: &Workload) -> f64 {
        self.lookup(opp, workload).map_or(0.0, |e| e.speed)
    }

    fn power(&self, opp: &Opp, workload: &Workload) -> f64 {
        self.lookup(opp, workload).map_or(0.0, |e| e.power)
    }
}
