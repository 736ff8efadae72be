//! Energy accounting and end-of-run statistics.
//!
//! [`EnergyMeter`] integrates the power of every CPU over simulated time:
//! a busy CPU draws `power(opp, workload)`, an idle one `power(opp, idle)`.
//! The state of the platform only changes at event instants, so the
//! integral is exact if the meter is advanced before each event is handled.
//!
//! [`Report`] summarises a run: per-task response times, per-CPU busy time
//! and energy.

use std::fmt;

use crate::system::System;
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, TaskId, Tick};

/// Response times of one task's completed instances.
///
/// Samples are kept so that percentiles are exact; a run produces one
/// sample per completed instance.
#[derive(Debug, Clone, Default)]
pub struct ResponseTimes {
    samples: Vec<Tick>,
    sorted: bool,
}

impl ResponseTimes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, response: Tick) {
        self.samples.push(response);
        self.sorted = false;
    }

    fn sort(&mut self) {
        if !self.sorted {
            self.samples.sort_unstable();
            self.sorted = true;
        }
    }

    pub fn count(&self) -> usize {
        self.samples.len()
    }

    /// Worst observed response time, 0 without samples.
    pub fn max(&self) -> Tick {
        self.samples.iter().copied().max().unwrap_or(0)
    }

    pub fn min(&self) -> Tick {
        self.samples.iter().copied().min().unwrap_or(0)
    }

    pub fn mean(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        self.samples.iter().sum::<Tick>() as f64 / self.samples.len() as f64
    }

    /// Spread between the slowest and the fastest instance.
    pub fn jitter(&self) -> Tick {
        self.max() - self.min()
    }

    /// Nearest-rank percentile, `pct` in `[0, 100]`. 0 without samples.
    pub fn percentile(&mut self, pct: f64) -> Tick {
        if self.samples.is_empty() {
            return 0;
        }
        self.sort();
        let rank = (pct.clamp(0.0, 100.0) * self.samples.len() as f64 / 100.0).ceil() as usize;
        self.samples[rank.saturating_sub(1).min(self.samples.len() - 1)]
    }
}

/// Per-CPU energy integrator.
#[derive(Debug, Clone, Default)]
pub struct EnergyMeter {
    last: Tick,
    energy: Vec<f64>,
    busy: Vec<Tick>,
}

impl EnergyMeter {
    pub fn new(nr_cpus: usize) -> Self {
        EnergyMeter {
            last: 0,
            energy: vec![0.0; nr_cpus],
            busy: vec![0; nr_cpus],
        }
    }

    /// Charge every CPU for the interval since the previous call, in the
    /// state the platform was in during that interval.
    pub fn advance(&mut self, now: Tick, sys: &System) {
        if now <= self.last {
            return;
        }
        let dt = now - self.last;
        for cpu in &sys.cpus {
            if cpu.disabled {
                continue;
            }
            let island = sys.island(cpu.island);
            let power = island.power_at(island.opp_index(), &cpu.workload);
            self.energy[cpu.id.idx()] += power * dt as f64;
            if cpu.busy {
                self.busy[cpu.id.idx()] += dt;
            }
        }
        self.last = now;
    }

    /// Energy consumed by `cpu` so far (power units × ticks).
    pub fn energy(&self, cpu: CpuId) -> f64 {
        self.energy[cpu.idx()]
    }

    pub fn total_energy(&self) -> f64 {
        self.energy.iter().sum()
    }

    /// Ticks `cpu` spent running something.
    pub fn busy_time(&self, cpu: CpuId) -> Tick {
        self.busy[cpu.idx()]
    }
}

#[derive(Debug, Clone)]
pub struct TaskReport {
    pub id: TaskId,
    pub name: String,
    pub instances: u64,
    pub completed: u64,
    pub missed: u64,
    pub killed: u64,
    pub discarded: u64,
    pub response: ResponseTimes,
    /// 95th percentile of `response`.
    pub p95: Tick,
}

#[derive(Debug, Clone)]
pub struct CpuReport {
    pub id: CpuId,
    pub island: String,
    pub busy: Tick,
    pub energy: f64,
}

/// End-of-run summary.
#[derive(Debug, Clone)]
pub struct Report {
    pub duration: Tick,
    pub tasks: Vec<TaskReport>,
    pub cpus: Vec<CpuReport>,
    pub total_energy: f64,
    pub migrations: usize,
}

impl Report {
    pub fn new(duration: Tick, sys: &System, trace: &Trace, meter: &EnergyMeter) -> Self {
        let mut tasks: Vec<TaskReport> = sys
            .tasks
            .iter()
            .map(|t| TaskReport {
                id: t.id,
                name: t.name.clone(),
                instances: t.stats.instances,
                completed: t.stats.completed,
                missed: t.stats.missed,
                killed: t.stats.killed,
                discarded: t.stats.discarded,
                response: ResponseTimes::new(),
                p95: 0,
            })
            .collect();
        let mut migrations = 0;
        for ev in trace.events() {
            match ev.kind {
                TraceKind::TaskCompleted { task, response } => {
                    tasks[task.idx()].response.record(response);
                }
                TraceKind::Migrated { .. } => migrations += 1,
                _ => {}
            }
        }
        for t in &mut tasks {
            t.p95 = t.response.percentile(95.0);
        }
        let cpus = sys
            .cpus
            .iter()
            .map(|c| CpuReport {
                id: c.id,
                island: sys.island(c.island).name.clone(),
                busy: meter.busy_time(c.id),
                energy: meter.energy(c.id),
            })
            .collect();
        Report {
            duration,
            tasks,
            cpus,
            total_energy: meter.total_energy(),
            migrations,
        }
    }

    pub fn total_misses(&self) -> u64 {
        self.tasks.iter().map(|t| t.missed).sum()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Simulation report ({} ticks) ===", self.duration)?;
        writeln!(
            f,
            "{:<16} {:>6} {:>6} {:>6} {:>6} {:>6} {:>10} {:>8} {:>8}",
            "task", "inst", "done", "miss", "kill", "drop", "mean_resp", "p95_resp", "max_resp"
        )?;
        for t in &self.tasks {
            writeln!(
                f,
                "{:<16} {:>6} {:>6} {:>6} {:>6} {:>6} {:>10.1} {:>8} {:>8}",
                t.name,
                t.instances,
                t.completed,
                t.missed,
                t.killed,
                t.discarded,
                t.response.mean(),
                t.p95,
                t.response.max()
            )?;
        }
        writeln!(f)?;
        writeln!(f, "{:<5} {:<10} {:>8} {:>14}", "cpu", "island", "busy%", "energy")?;
        for c in &self.cpus {
            let busy = if self.duration == 0 {
                0.0
            } else {
                100.0 * c.busy as f64 / self.duration as f64
            };
            writeln!(
                f,
                "{:<5} {:<10} {:>7.1}% {:>14.3}",
                c.id.0, c.island, busy, c.energy
            )?;
        }
        writeln!(f)?;
        writeln!(f, "migrations: {}", self.migrations)?;
        write!(f, "total energy: {:.3}", self.total_energy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;
    use crate::types::Workload;

    #[test]
    fn response_percentiles() {
        let mut r = ResponseTimes::new();
        assert_eq!(r.percentile(95.0), 0);
        assert_eq!(r.mean(), 0.0);
        for v in [9, 2, 7, 4, 5, 4, 5, 4, 3, 6] {
            r.record(v);
        }
        assert_eq!(r.count(), 10);
        assert_eq!(r.min(), 2);
        assert_eq!(r.max(), 9);
        assert_eq!(r.jitter(), 7);
        assert!((r.mean() - 4.9).abs() < 1e-12);
        assert_eq!(r.percentile(50.0), 4);
        assert_eq!(r.percentile(90.0), 7);
        assert_eq!(r.percentile(95.0), 9);
        assert_eq!(r.percentile(0.0), 2);
        // Late samples are taken into account.
        r.record(1);
        assert_eq!(r.percentile(0.0), 1);
    }

    #[test]
    fn meter_integrates_busy_and_idle_power() {
        let mut sys = System::new(&Platform::uniprocessor()).unwrap();
        let mut meter = EnergyMeter::new(sys.nr_cpus());
        let idle_power = sys.island(sys.cpus[0].island).power_at(0, &Workload::idle());

        meter.advance(10, &sys);
        assert!((meter.energy(CpuId(0)) - 10.0 * idle_power).abs() < 1e-9);
        assert_eq!(meter.busy_time(CpuId(0)), 0);

        sys.cpus[0].busy = true;
        sys.cpus[0].workload = Workload::default();
        meter.advance(15, &sys);
        assert!((meter.energy(CpuId(0)) - (10.0 * idle_power + 5.0)).abs() < 1e-9);
        assert_eq!(meter.busy_time(CpuId(0)), 5);

        // Going backwards charges nothing.
        meter.advance(12, &sys);
        assert_eq!(meter.busy_time(CpuId(0)), 5);
    }
}
