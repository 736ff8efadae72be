//! Trace event recording for the simulator.
//!
//! Every scheduling action (instance released, scheduled, preempted,
//! completed, killed, discarded, placement decisions, migrations, OPP
//! changes) is recorded as a `TraceEvent` with a simulated timestamp and,
//! where it applies, the CPU it happened on.

use crate::cbs::ServerStatus;
use crate::types::{CpuId, Entity, IslandId, ServerId, TaskId, Tick};

/// A single trace event produced by the simulator.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEvent {
    pub time: Tick,
    pub cpu: Option<CpuId>,
    pub kind: TraceKind,
}

/// The type of scheduling event recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceKind {
    /// A task released a new instance.
    TaskArrived { task: TaskId },
    /// A task arrived while its previous instance was still active.
    TaskBuffered { task: TaskId },
    /// A task started executing.
    TaskScheduled { task: TaskId, speed: f64 },
    /// A task stopped executing with work left.
    TaskPreempted { task: TaskId },
    /// A task instance finished.
    TaskCompleted { task: TaskId, response: Tick },
    /// A task instance was aborted.
    TaskKilled { task: TaskId },
    /// A task instance found no admissible core.
    TaskDiscarded { task: TaskId },
    /// A task instance is still active at its absolute deadline.
    DeadlineMiss { task: TaskId },
    /// The kernel placed an entity on a core at an OPP.
    Dispatched { entity: Entity, opp: usize, freq_mhz: u32 },
    /// An entity moved to another core.
    Migrated {
        entity: Entity,
        from: CpuId,
        to: CpuId,
        temporary: bool,
    },
    /// A CBS server changed status.
    Server { server: ServerId, status: ServerStatus },
    /// An island changed operating point.
    OppChanged { island: IslandId, opp: usize, freq_mhz: u32 },
    /// The CPU has nothing left to run.
    CpuIdle,
}

/// A complete simulation trace, containing all events in chronological order.
#[derive(Debug, Clone, Default)]
pub struct Trace {
    events: Vec<TraceEvent>,
}

impl Trace {
    pub(crate) fn new() -> Self {
        Self { events: Vec::new() }
    }

    pub(crate) fn record(&mut self, time: Tick, cpu: Option<CpuId>, kind: TraceKind) {
        self.events.push(TraceEvent { time, cpu, kind });
    }

    /// Get all events in chronological order.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total ticks a task spent executing.
    ///
    /// Sums the intervals between `TaskScheduled` and the next
    /// `TaskPreempted`/`TaskCompleted`/`TaskKilled` for that task.
    pub fn total_runtime(&self, task: TaskId) -> Tick {
        let mut total: Tick = 0;
        let mut running_since: Option<Tick> = None;

        for event in &self.events {
            match &event.kind {
                TraceKind::TaskScheduled { task: t, .. } if *t == task => {
                    running_since = Some(event.time);
                }
                TraceKind::TaskPreempted { task: t }
                | TraceKind::TaskCompleted { task: t, .. }
                | TraceKind::TaskKilled { task: t }
                    if *t == task =>
                {
                    if let Some(start) = running_since.take() {
                        total += event.time - start;
                    }
                }
                _ => {}
            }
        }

        total
    }

    /// Count the number of times a task was scheduled.
    pub fn schedule_count(&self, task: TaskId) -> usize {
        self.count(|k| matches!(k, TraceKind::TaskScheduled { task: t, .. } if *t == task))
    }

    pub fn completions(&self, task: TaskId) -> usize {
        self.count(|k| matches!(k, TraceKind::TaskCompleted { task: t, .. } if *t == task))
    }

    pub fn misses(&self, task: TaskId) -> usize {
        self.count(|k| matches!(k, TraceKind::DeadlineMiss { task: t } if *t == task))
    }

    /// CPUs a task executed on, in first-use order.
    pub fn cpus_used(&self, task: TaskId) -> Vec<CpuId> {
        let mut cpus = Vec::new();
        for e in &self.events {
            if let (TraceKind::TaskScheduled { task: t, .. }, Some(cpu)) = (&e.kind, e.cpu) {
                if *t == task && !cpus.contains(&cpu) {
                    cpus.push(cpu);
                }
            }
        }
        cpus
    }

    /// Count the number of times a CPU went idle.
    pub fn idle_count(&self, cpu: CpuId) -> usize {
        self.events
            .iter()
            .filter(|e| e.cpu == Some(cpu) && matches!(e.kind, TraceKind::CpuIdle))
            .count()
    }

    fn count(&self, pred: impl Fn(&TraceKind) -> bool) -> usize {
        self.events.iter().filter(|e| pred(&e.kind)).count()
    }

    /// Pretty-print the trace for debugging.
    pub fn dump(&self) {
        for event in &self.events {
            let desc = match &event.kind {
                TraceKind::TaskArrived { task } => format!("ARRIVE   T{}", task.0),
                TraceKind::TaskBuffered { task } => format!("BUFFER   T{}", task.0),
                TraceKind::TaskScheduled { task, speed } => {
                    format!("SCHED    T{} speed={speed:.3}", task.0)
                }
                TraceKind::TaskPreempted { task } => format!("PREEMPT  T{}", task.0),
                TraceKind::TaskCompleted { task, response } => {
                    format!("COMPLETE T{} response={response}", task.0)
                }
                TraceKind::TaskKilled { task } => format!("KILL     T{}", task.0),
                TraceKind::TaskDiscarded { task } => format!("DISCARD  T{}", task.0),
                TraceKind::DeadlineMiss { task } => format!("MISS     T{}", task.0),
                TraceKind::Dispatched {
                    entity,
                    opp,
                    freq_mhz,
                } => format!("DISPATCH {entity} opp={opp} ({freq_mhz}MHz)"),
                TraceKind::Migrated {
                    entity,
                    from,
                    to,
                    temporary,
                } => format!(
                    "MIGRATE  {entity} {}->{}{}",
                    from.0,
                    to.0,
                    if *temporary { " (temporary)" } else { "" }
                ),
                TraceKind::Server { server, status } => format!("CBS      S{} {status}", server.0),
                TraceKind::OppChanged {
                    island,
                    opp,
                    freq_mhz,
                } => format!("OPP      island={} opp={opp} ({freq_mhz}MHz)", island.0),
                TraceKind::CpuIdle => "IDLE".to_string(),
            };
            let cpu = event
                .cpu
                .map(|c| c.0.to_string())
                .unwrap_or_else(|| "-".into());
            eprintln!("[{:>10}] cpu={:<3} {}", event.time, cpu, desc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runtime_sums_stints() {
        let mut tr = Trace::new();
        let t = TaskId(1);
        tr.record(0, Some(CpuId(0)), TraceKind::TaskScheduled { task: t, speed: 1.0 });
        tr.record(4, Some(CpuId(0)), TraceKind::TaskPreempted { task: t });
        tr.record(6, Some(CpuId(1)), TraceKind::TaskScheduled { task: t, speed: 1.0 });
        tr.record(9, Some(CpuId(1)), TraceKind::TaskCompleted { task: t, response: 9 });
        assert_eq!(tr.total_runtime(t), 7);
        assert_eq!(tr.schedule_count(t), 2);
        assert_eq!(tr.completions(t), 1);
        assert_eq!(tr.cpus_used(t), vec![CpuId(0), CpuId(1)]);
        assert_eq!(tr.total_runtime(TaskId(2)), 0);
    }
}
