//! Task model for the simulator.
//!
//! A task releases instances (jobs) according to its [`Activation`]. Each
//! instance carries `wcet` units of reference work; running at relative speed
//! `s` it burns `s` units per tick, so its execution time is the
//! capacity-scaled WCET `ceil(wcet / s)`.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::event::{EventHandle, EventKind, EventQueue};
use crate::sched::SchedParams;
use crate::types::{CpuId, ServerId, TaskId, Tick, Workload};

/// When a task releases instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Activation {
    /// One instance every `period` ticks, starting at the task offset.
    Periodic { period: Tick },
    /// A single instance at the task offset.
    OneShot,
    /// Instances at the given absolute times.
    Explicit { arrivals: Vec<Tick> },
}

/// Activation state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// No pending instance.
    Idle,
    /// An instance is released and waiting for (or between) CPU time.
    Active,
    /// The current instance is executing on a CPU.
    Executing,
}

/// Definition of a task for scenario creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDef {
    pub name: String,
    pub activation: Activation,
    /// Release time of the first instance (periodic and one-shot tasks).
    #[serde(default)]
    pub offset: Tick,
    /// Worst-case execution time at speed 1.0.
    pub wcet: Tick,
    /// Relative deadline; defaults to the period (or the WCET for one-shot
    /// tasks without a period).
    #[serde(default)]
    pub deadline: Option<Tick>,
    #[serde(default)]
    pub workload: Workload,
    /// Name of the CBS server enveloping this task, if any.
    #[serde(default)]
    pub server: Option<String>,
    /// Priority and slice on the per-core queues.
    #[serde(default)]
    pub params: SchedParams,
}

impl TaskDef {
    pub fn periodic(name: &str, period: Tick, wcet: Tick) -> Self {
        TaskDef {
            name: name.to_string(),
            activation: Activation::Periodic { period },
            offset: 0,
            wcet,
            deadline: None,
            workload: Workload::default(),
            server: None,
            params: SchedParams::default(),
        }
    }

    pub fn one_shot(name: &str, at: Tick, wcet: Tick, deadline: Tick) -> Self {
        TaskDef {
            name: name.to_string(),
            activation: Activation::OneShot,
            offset: at,
            wcet,
            deadline: Some(deadline),
            workload: Workload::default(),
            server: None,
            params: SchedParams::default(),
        }
    }

    pub fn explicit(name: &str, arrivals: Vec<Tick>, wcet: Tick, deadline: Tick) -> Self {
        TaskDef {
            name: name.to_string(),
            activation: Activation::Explicit { arrivals },
            offset: 0,
            wcet,
            deadline: Some(deadline),
            workload: Workload::default(),
            server: None,
            params: SchedParams::default(),
        }
    }

    pub fn with_deadline(mut self, deadline: Tick) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_offset(mut self, offset: Tick) -> Self {
        self.offset = offset;
        self
    }

    pub fn with_workload(mut self, workload: &str) -> Self {
        self.workload = Workload::new(workload);
        self
    }

    pub fn with_params(mut self, params: SchedParams) -> Self {
        self.params = params;
        self
    }

    pub fn in_server(mut self, server: &str) -> Self {
        self.server = Some(server.to_string());
        self
    }

    /// Relative deadline after applying defaults.
    pub fn relative_deadline(&self) -> Tick {
        match (self.deadline, &self.activation) {
            (Some(d), _) => d,
            (None, Activation::Periodic { period }) => *period,
            (None, _) => self.wcet,
        }
    }
}

/// Per-task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskStats {
    /// Instances released (including buffered ones once they start).
    pub instances: u64,
    pub completed: u64,
    pub missed: u64,
    pub killed: u64,
    /// Instances dropped because no core could admit them.
    pub discarded: u64,
    /// Arrivals that found the previous instance still active.
    pub buffered: u64,
    pub max_response: Tick,
    pub total_response: Tick,
}

/// A simulated task at runtime.
#[derive(Debug, Clone)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    pub activation: Activation,
    pub offset: Tick,
    /// Reference WCET (speed 1.0).
    pub wcet: Tick,
    pub rel_deadline: Tick,
    pub workload: Workload,
    /// CBS server enveloping this task.
    pub server: Option<ServerId>,
    pub params: SchedParams,
    pub stats: TaskStats,

    state: TaskState,
    instance: u64,
    arrival: Tick,
    abs_deadline: Tick,
    /// Reference work left in the current instance.
    remaining: f64,
    /// Ticks spent executing, across all instances.
    exec_time: Tick,
    last_start: Tick,
    speed: f64,
    cpu: Option<CpuId>,
    end_evt: Option<EventHandle>,
    deadline_evt: Option<EventHandle>,
    /// Arrivals that must start as soon as the current instance is over.
    pending: u32,
    /// Index of the next explicit arrival to post.
    next_explicit: usize,
    last_end: Option<Tick>,
}

impl Task {
    pub fn new(id: TaskId, def: &TaskDef, server: Option<ServerId>) -> Self {
        Task {
            id,
            name: def.name.clone(),
            activation: def.activation.clone(),
            offset: def.offset,
            wcet: def.wcet,
            rel_deadline: def.relative_deadline(),
            workload: def.workload.clone(),
            server,
            params: def.params,
            stats: TaskStats::default(),
            state: TaskState::Idle,
            instance: 0,
            arrival: 0,
            abs_deadline: 0,
            remaining: 0.0,
            exec_time: 0,
            last_start: 0,
            speed: 0.0,
            cpu: None,
            end_evt: None,
            deadline_evt: None,
            pending: 0,
            next_explicit: 0,
            last_end: None,
        }
    }

    pub fn is_periodic(&self) -> bool {
        matches!(self.activation, Activation::Periodic { .. })
    }

    pub fn period(&self) -> Option<Tick> {
        match self.activation {
            Activation::Periodic { period } => Some(period),
            _ => None,
        }
    }

    /// Interval utilization is measured against: the period, or the
    /// relative deadline for non-periodic tasks.
    pub fn util_interval(&self) -> Tick {
        self.period().unwrap_or(self.rel_deadline).max(1)
    }

    /// Capacity-scaled WCET at relative speed `speed`.
    pub fn wcet_at(&self, speed: f64) -> Tick {
        if speed <= 0.0 {
            return Tick::MAX;
        }
        ((self.wcet as f64 / speed) - 1e-9).ceil().max(0.0) as Tick
    }

    /// Utilization of the task on a core running at `speed`.
    pub fn utilization_at(&self, speed: f64) -> f64 {
        let wcet = self.wcet_at(speed);
        if wcet == Tick::MAX {
            return f64::INFINITY;
        }
        wcet as f64 / self.util_interval() as f64
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn is_active(&self) -> bool {
        self.state != TaskState::Idle
    }

    pub fn is_executing(&self) -> bool {
        self.state == TaskState::Executing
    }

    /// CPU the task is executing on.
    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    pub fn instance(&self) -> u64 {
        self.instance
    }

    pub fn arrival(&self) -> Tick {
        self.arrival
    }

    pub fn abs_deadline(&self) -> Tick {
        self.abs_deadline
    }

    pub fn remaining(&self) -> f64 {
        self.remaining
    }

    /// Instant the last instance completed.
    pub fn last_end(&self) -> Option<Tick> {
        self.last_end
    }

    pub fn pending_arrivals(&self) -> u32 {
        self.pending
    }

    /// Total executed ticks, including the running stint up to `now`.
    pub fn exec_time_at(&self, now: Tick) -> Tick {
        match self.state {
            TaskState::Executing => self.exec_time + (now - self.last_start),
            _ => self.exec_time,
        }
    }

    /// Post the first arrival of the task.
    pub fn post_first_arrival(&mut self, events: &mut EventQueue) {
        let first = match &self.activation {
            Activation::Periodic { .. } | Activation::OneShot => Some(self.offset),
            Activation::Explicit { arrivals } => arrivals.first().copied(),
        };
        if let Some(at) = first {
            self.next_explicit = 1;
            events.post(at, EventKind::TaskArrival { task: self.id });
        }
    }

    /// Post the arrival following the one firing at `now`.
    pub fn post_next_arrival(&mut self, now: Tick, events: &mut EventQueue) {
        let next = match &self.activation {
            Activation::Periodic { period } => Some(now + period),
            Activation::OneShot => None,
            Activation::Explicit { arrivals } => {
                let next = arrivals.get(self.next_explicit).copied();
                self.next_explicit += 1;
                next
            }
        };
        if let Some(at) = next {
            events.post(at.max(now), EventKind::TaskArrival { task: self.id });
        }
    }

    /// Release a new instance at `now`. If the previous instance is still
    /// active the arrival is buffered and `false` is returned.
    pub fn release(&mut self, now: Tick, events: &mut EventQueue) -> bool {
        if self.state != TaskState::Idle {
            self.pending += 1;
            self.stats.buffered += 1;
            debug!(task = self.id.0, pending = self.pending, "arrival buffered");
            return false;
        }
        self.instance += 1;
        self.stats.instances += 1;
        self.arrival = now;
        self.abs_deadline = now + self.rel_deadline;
        self.remaining = self.wcet as f64;
        self.state = TaskState::Active;
        self.deadline_evt = Some(events.post(
            self.abs_deadline,
            EventKind::DeadlineCheck {
                task: self.id,
                instance: self.instance,
            },
        ));
        true
    }

    /// Consume one buffered arrival, if any.
    pub fn take_pending(&mut self) -> bool {
        if self.pending > 0 {
            self.pending -= 1;
            true
        } else {
            false
        }
    }

    /// Start (or resume) executing on `cpu` at relative speed `speed`.
    pub fn schedule(&mut self, now: Tick, cpu: CpuId, speed: f64, events: &mut EventQueue) {
        assert!(
            self.state == TaskState::Active,
            "task {} scheduled while {:?}",
            self.id.0,
            self.state
        );
        assert!(speed > 0.0, "task {} scheduled at speed {speed}", self.id.0);
        self.state = TaskState::Executing;
        self.cpu = Some(cpu);
        self.speed = speed;
        self.last_start = now;
        self.post_end(now, events);
    }

    /// Stop executing; the instance stays active.
    pub fn deschedule(&mut self, now: Tick, events: &mut EventQueue) {
        if self.state != TaskState::Executing {
            return;
        }
        self.consume(now);
        events.cancel_slot(&mut self.end_evt);
        self.state = TaskState::Active;
        self.cpu = None;
    }

    /// The core this task executes on changed speed.
    pub fn rebase(&mut self, now: Tick, speed: f64, events: &mut EventQueue) {
        if self.state != TaskState::Executing || (speed - self.speed).abs() < f64::EPSILON {
            return;
        }
        self.consume(now);
        self.speed = speed;
        events.cancel_slot(&mut self.end_evt);
        self.post_end(now, events);
    }

    /// Finish the current instance. Returns its response time.
    pub fn complete(&mut self, now: Tick, events: &mut EventQueue) -> Tick {
        self.consume(now);
        self.remaining = 0.0;
        self.finish(now, events);
        self.last_end = Some(now);
        self.stats.completed += 1;
        let response = now - self.arrival;
        self.stats.max_response = self.stats.max_response.max(response);
        self.stats.total_response += response;
        response
    }

    /// Abort the current instance. Returns `false` if there was none.
    pub fn kill_instance(&mut self, now: Tick, events: &mut EventQueue) -> bool {
        if self.state == TaskState::Idle {
            return false;
        }
        self.consume(now);
        self.finish(now, events);
        self.stats.killed += 1;
        true
    }

    /// Drop the current instance because no core could admit it.
    pub fn discard_instance(&mut self, now: Tick, events: &mut EventQueue) -> bool {
        if self.state == TaskState::Idle {
            return false;
        }
        self.consume(now);
        self.finish(now, events);
        self.stats.discarded += 1;
        true
    }

    /// Handle the deadline check of `instance`. Returns `true` on a miss.
    pub fn check_deadline(&mut self, instance: u64) -> bool {
        if instance != self.instance {
            return false;
        }
        self.deadline_evt = None;
        if self.state == TaskState::Idle {
            return false;
        }
        self.stats.missed += 1;
        true
    }

    fn finish(&mut self, _now: Tick, events: &mut EventQueue) {
        events.cancel_slot(&mut self.end_evt);
        events.cancel_slot(&mut self.deadline_evt);
        self.state = TaskState::Idle;
        self.cpu = None;
    }

    fn consume(&mut self, now: Tick) {
        if self.state != TaskState::Executing {
            return;
        }
        let dt = now - self.last_start;
        self.remaining = (self.remaining - dt as f64 * self.speed).max(0.0);
        self.exec_time += dt;
        self.last_start = now;
    }

    fn post_end(&mut self, now: Tick, events: &mut EventQueue) {
        let left = ((self.remaining / self.speed) - 1e-9).ceil().max(0.0) as Tick;
        self.end_evt = Some(events.post(now + left, EventKind::TaskEnd { task: self.id }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(def: &TaskDef) -> Task {
        Task::new(TaskId(0), def, None)
    }

    #[test]
    fn wcet_scales_with_speed() {
        let t = task(&TaskDef::periodic("t", 500, 500));
        assert_eq!(t.wcet_at(1.0), 500);
        assert_eq!(t.wcet_at(0.5), 1000);
        assert_eq!(t.wcet_at(3.0), 167);
        assert_eq!(t.wcet_at(0.0), Tick::MAX);
        assert!((t.utilization_at(1.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn default_deadline_is_period() {
        let d = TaskDef::periodic("t", 100, 10);
        assert_eq!(d.relative_deadline(), 100);
        assert_eq!(d.with_deadline(50).relative_deadline(), 50);
    }

    #[test]
    fn execution_consumes_work_at_speed() {
        let mut q = EventQueue::new();
        let mut t = task(&TaskDef::periodic("t", 100, 10));
        assert!(t.release(0, &mut q));
        t.schedule(0, CpuId(0), 0.5, &mut q);
        // 20 ticks at half speed; deadline check at 100 is also pending.
        assert_eq!(q.peek_time(), Some(20));

        q.advance_to(8);
        t.deschedule(8, &mut q);
        assert!((t.remaining() - 6.0).abs() < 1e-9);
        assert_eq!(t.exec_time_at(8), 8);

        t.schedule(8, CpuId(1), 1.0, &mut q);
        q.advance_to(10);
        t.rebase(10, 2.0, &mut q);
        // 4 units left at speed 2.
        let end = q.pop().unwrap();
        assert_eq!(end.time, 12);
        assert_eq!(end.kind, EventKind::TaskEnd { task: TaskId(0) });
        assert_eq!(t.complete(12, &mut q), 12);
        assert_eq!(t.state(), TaskState::Idle);
        // The deadline check was cancelled by completion.
        assert!(q.is_empty());
    }

    #[test]
    fn arrivals_while_active_are_buffered() {
        let mut q = EventQueue::new();
        let mut t = task(&TaskDef::periodic("t", 10, 50));
        assert!(t.release(0, &mut q));
        assert!(!t.release(10, &mut q));
        assert_eq!(t.pending_arrivals(), 1);
        assert!(t.take_pending());
        assert!(!t.take_pending());
        assert_eq!(t.stats.buffered, 1);
    }

    #[test]
    fn deadline_miss_only_for_live_instance() {
        let mut q = EventQueue::new();
        let mut t = task(&TaskDef::periodic("t", 10, 5));
        t.release(0, &mut q);
        assert!(t.check_deadline(1));
        assert!(!t.check_deadline(7));
        assert_eq!(t.stats.missed, 1);
        t.kill_instance(10, &mut q);
        assert!(!t.check_deadline(1));
        assert_eq!(t.stats.killed, 1);
    }

    #[test]
    fn explicit_arrivals_follow_list() {
        let mut q = EventQueue::new();
        let mut t = task(&TaskDef::explicit("a", vec![3, 9], 1, 5));
        t.post_first_arrival(&mut q);
        let e = q.pop().unwrap();
        assert_eq!(e.time, 3);
        t.post_next_arrival(3, &mut q);
        assert_eq!(q.pop().unwrap().time, 9);
        t.post_next_arrival(9, &mut q);
        assert!(q.is_empty());
    }
}
