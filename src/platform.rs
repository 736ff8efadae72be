//! Platform descriptions: which islands exist, their OPP tables and power
//! models, and how many CPUs each one holds.
//!
//! [`Platform::big_little`] builds the reference heterogeneous board used by
//! the test-suite: a big cluster scaling 200–2000 MHz whose top OPP runs the
//! default workload at speed 1.0, and a LITTLE cluster scaling 200–1400 MHz
//! with roughly a third of the big core's top speed but far lower power.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::cpu::CoreKind;
use crate::power::{CmosModel, Opp, PowerModel, TableEntry, TableModel};

/// Power model of an island, as written in a scenario file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ModelDef {
    Cmos(CmosModel),
    Table { rows: Vec<TableRow> },
}

/// One measurement of a table model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableRow {
    pub freq_mhz: u32,
    #[serde(default = "default_workload_name")]
    pub workload: String,
    #[serde(flatten)]
    pub entry: TableEntry,
}

fn default_workload_name() -> String {
    crate::types::Workload::DEFAULT.to_string()
}

impl ModelDef {
    pub fn build(&self) -> Arc<dyn PowerModel> {
        match self {
            ModelDef::Cmos(m) => Arc::new(m.clone()),
            ModelDef::Table { rows } => {
                let model = rows.iter().fold(TableModel::new(), |m, r| {
                    m.entry(r.freq_mhz, &r.workload, r.entry.speed, r.entry.power)
                });
                Arc::new(model)
            }
        }
    }
}

/// One frequency island.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IslandDef {
    pub name: String,
    pub kind: CoreKind,
    pub cpus: u32,
    pub opps: Vec<Opp>,
    pub model: ModelDef,
}

/// A full platform. CPU ids are assigned island by island, in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Platform {
    pub islands: Vec<IslandDef>,
    /// CPUs that are present but switched off.
    #[serde(default)]
    pub disabled_cpus: Vec<u32>,
}

/// Round a voltage to the 12.5 mV regulator step.
fn regulator_step(v: f64) -> f64 {
    (v / 0.0125).round() * 0.0125
}

/// Evenly spaced OPPs from `lo_mhz` to `hi_mhz` with voltages interpolated
/// linearly between `lo_v` and `hi_v`.
pub fn opp_ladder(lo_mhz: u32, hi_mhz: u32, step_mhz: u32, lo_v: f64, hi_v: f64) -> Vec<Opp> {
    assert!(step_mhz > 0 && hi_mhz >= lo_mhz, "bad OPP ladder bounds");
    let n = (hi_mhz - lo_mhz) / step_mhz;
    (0..=n)
        .map(|i| {
            let f = lo_mhz + i * step_mhz;
            let frac = if n == 0 { 0.0 } else { i as f64 / n as f64 };
            Opp::new(f, regulator_step(lo_v + frac * (hi_v - lo_v)))
        })
        .collect()
}

impl Platform {
    /// Reference big.LITTLE board (`n_big` big CPUs first, then `n_little`).
    pub fn big_little(n_big: u32, n_little: u32) -> Self {
        let mut islands = Vec::new();
        if n_big > 0 {
            islands.push(IslandDef {
                name: "big".into(),
                kind: CoreKind::Big,
                cpus: n_big,
                opps: opp_ladder(200, 2000, 100, 0.9, 1.3625),
                model: ModelDef::Cmos(CmosModel::new(2000, 1.0, 1.6, 0.15)),
            });
        }
        if n_little > 0 {
            islands.push(IslandDef {
                name: "little".into(),
                kind: CoreKind::Little,
                cpus: n_little,
                opps: opp_ladder(200, 1400, 100, 0.9, 1.25),
                model: ModelDef::Cmos(CmosModel::new(1400, 0.35, 0.3, 0.03)),
            });
        }
        Platform {
            islands,
            disabled_cpus: Vec::new(),
        }
    }

    /// A single island of `n` identical CPUs.
    pub fn symmetric(n: u32, opps: Vec<Opp>, model: ModelDef) -> Self {
        Platform {
            islands: vec![IslandDef {
                name: "cluster".into(),
                kind: CoreKind::Big,
                cpus: n,
                opps,
                model,
            }],
            disabled_cpus: Vec::new(),
        }
    }

    /// `n` identical CPUs with a single 1000 MHz OPP running every workload
    /// at speed 1.0 for 1 W.
    pub fn flat(n: u32) -> Self {
        Self::symmetric(
            n,
            vec![Opp::new(1000, 1.0)],
            ModelDef::Table {
                rows: vec![TableRow {
                    freq_mhz: 1000,
                    workload: default_workload_name(),
                    entry: TableEntry {
                        speed: 1.0,
                        power: 1.0,
                    },
                }],
            },
        )
    }

    /// A single flat CPU. Handy for scheduler-level tests where frequency
    /// selection is irrelevant.
    pub fn uniprocessor() -> Self {
        Self::flat(1)
    }

    pub fn disable_cpu(mut self, cpu: u32) -> Self {
        self.disabled_cpus.push(cpu);
        self
    }

    pub fn nr_cpus(&self) -> u32 {
        self.islands.iter().map(|i| i.cpus).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Workload;

    #[test]
    fn ladder_spans_bounds() {
        let opps = opp_ladder(200, 2000, 100, 0.9, 1.3625);
        assert_eq!(opps.len(), 19);
        assert_eq!(opps[0].freq_mhz, 200);
        assert_eq!(opps[18].freq_mhz, 2000);
        assert!((opps[0].volt - 0.9).abs() < 1e-9);
        assert!((opps[18].volt - 1.3625).abs() < 1e-9);
        assert!(opps.windows(2).all(|w| w[0].volt <= w[1].volt));
    }

    #[test]
    fn reference_board_speeds() {
        let p = Platform::big_little(4, 4);
        assert_eq!(p.nr_cpus(), 8);
        let big = p.islands[0].model.build();
        let little = p.islands[1].model.build();
        let w = Workload::default();
        let top_big = *p.islands[0].opps.last().unwrap();
        let top_little = *p.islands[1].opps.last().unwrap();
        assert!((big.speed(&top_big, &w) - 1.0).abs() < 1e-12);
        assert!(little.speed(&top_little, &w) < 0.5);
        // LITTLE is the more efficient cluster per unit of work.
        let big_eff = big.power(&top_big, &w) / big.speed(&top_big, &w);
        let little_eff = little.power(&top_little, &w) / little.speed(&top_little, &w);
        assert!(little_eff < big_eff);
    }

    #[test]
    fn model_def_round_trips_through_json() {
        let json = r#"{"type":"table","rows":[{"freq_mhz":1000,"speed":0.5,"power":2.0}]}"#;
        let def: ModelDef = serde_json::from_str(json).unwrap();
        let m = def.build();
        let opp = Opp::new(1000, 1.0);
        assert_eq!(m.speed(&opp, &Workload::new("hash")), 0.5);
        assert_eq!(m.power(&opp, &Workload::default()), 2.0);
    }
}
