//! Constant Bandwidth Server.
//!
//! A [`CbServer`] envelopes one or more tasks behind a `(Q, P)` reservation:
//! while executing it consumes its capacity `cap` and advances its virtual
//! time at rate `P / Q`. Running out of capacity either postpones the
//! deadline at once (soft server) or suspends the server until its old
//! deadline (hard server).
//!
//! The server does not know about cores or the kernel. Every method returns
//! an outcome the kernel reacts to, and every event the server posts is held
//! in a handle slot that is cancelled before it is superseded.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::SimError;
use crate::event::{EventHandle, EventKind, EventQueue};
use crate::invariant;
use crate::sched::{SchedParams, SchedPolicy, Scheduler};
use crate::task::Task;
use crate::types::{CpuId, Entity, ServerId, TaskId, Tick};

/// Server status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerStatus {
    Idle,
    Ready,
    Executing,
    /// Out of work, waiting for the virtual time to catch up with the clock.
    Releasing,
    /// Out of budget (hard server), waiting for the replenishment.
    Recharging,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerStatus::Idle => "IDLE",
            ServerStatus::Ready => "READY",
            ServerStatus::Executing => "EXECUTING",
            ServerStatus::Releasing => "RELEASING",
            ServerStatus::Recharging => "RECHARGING",
        };
        f.write_str(s)
    }
}

/// Whether a transition is part of the server model.
fn is_legal(from: ServerStatus, to: ServerStatus) -> bool {
    use ServerStatus::*;
    matches!(
        (from, to),
        (Idle, Ready)
            | (Releasing, Ready)
            | (Recharging, Ready)
            | (Ready, Executing)
            | (Executing, Ready)
            | (Executing, Releasing)
            | (Executing, Idle)
            | (Executing, Recharging)
            | (Ready, Releasing)
            | (Ready, Idle)
            | (Releasing, Idle)
            | (Recharging, Releasing)
    )
}

/// How a server that wakes up from `Idle` picks its capacity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdlePolicy {
    /// Always start over with a full budget and a fresh deadline.
    #[default]
    Original,
    /// Keep the old deadline if it is still ahead, with the capacity that
    /// preserves the reserved bandwidth until then.
    ReuseDline,
}

/// Definition of a server for scenario creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDef {
    pub name: String,
    pub budget: Tick,
    pub period: Tick,
    #[serde(default)]
    pub hard: bool,
    #[serde(default)]
    pub idle_policy: IdlePolicy,
    /// Ordering of the enveloped tasks.
    #[serde(default = "default_inner_policy")]
    pub policy: SchedPolicy,
    /// Priority and slice of the server on the per-core queues.
    #[serde(default)]
    pub params: SchedParams,
}

fn default_inner_policy() -> SchedPolicy {
    SchedPolicy::Fifo
}

impl ServerDef {
    pub fn new(name: &str, budget: Tick, period: Tick) -> Self {
        ServerDef {
            name: name.to_string(),
            budget,
            period,
            hard: false,
            idle_policy: IdlePolicy::Original,
            policy: default_inner_policy(),
            params: SchedParams::default(),
        }
    }

    pub fn hard(mut self) -> Self {
        self.hard = true;
        self
    }

    pub fn reuse_deadline(mut self) -> Self {
        self.idle_policy = IdlePolicy::ReuseDline;
        self
    }
}

/// Result of new work reaching a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkArrival {
    /// The server was dormant and is now ready to contend for a core.
    BecameReady,
    /// The server already contends (or waits for a replenishment).
    Queued,
}

/// Result of an enveloped task finishing (or being removed).
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorkFinished {
    /// Another enveloped task is ready; the server keeps executing.
    MoreWork,
    /// No work left, virtual time ahead of the clock.
    Releasing { vtime: f64 },
    /// No work left, virtual time already elapsed.
    Idle,
    /// No work left while waiting for a replenishment.
    Recharging,
}

/// Result of a budget exhaustion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exhaustion {
    /// Soft server: refilled on the spot with a postponed deadline.
    Postponed { deadline: Tick },
    /// Hard server: suspended until `replenish_at`.
    Suspended { replenish_at: Tick },
}

/// Server counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub replenishments: u64,
    pub exhaustions: u64,
    pub kills: u64,
    /// Ticks spent executing.
    pub executed: Tick,
}

/// A Constant Bandwidth Server.
#[derive(Debug, Clone)]
pub struct CbServer {
    pub id: ServerId,
    pub name: String,
    pub params: SchedParams,
    pub hard: bool,
    pub idle_policy: IdlePolicy,
    pub stats: ServerStats,
    q: Tick,
    p: Tick,
    d: Tick,
    cap: Tick,
    last_time: Tick,
    vtime: f64,
    status: ServerStatus,
    sched: Scheduler,
    tasks: Vec<TaskId>,
    cpu: Option<CpuId>,
    budget_evt: Option<EventHandle>,
    idle_evt: Option<EventHandle>,
    replenish_evt: Option<EventHandle>,
    killed: bool,
}

impl CbServer {
    pub fn new(id: ServerId, def: &ServerDef) -> Result<Self, SimError> {
        if def.budget == 0 || def.budget > def.period {
            return Err(SimError::InvalidBudget {
                budget: def.budget,
                period: def.period,
            });
        }
        Ok(CbServer {
            id,
            name: def.name.clone(),
            params: def.params,
            hard: def.hard,
            idle_policy: def.idle_policy,
            stats: ServerStats::default(),
            q: def.budget,
            p: def.period,
            d: 0,
            cap: 0,
            last_time: 0,
            vtime: 0.0,
            status: ServerStatus::Idle,
            sched: Scheduler::new(def.policy),
            tasks: Vec::new(),
            cpu: None,
            budget_evt: None,
            idle_evt: None,
            replenish_evt: None,
            killed: false,
        })
    }

    /// Envelope a task.
    pub fn add_task(&mut self, task: TaskId) -> Result<(), SimError> {
        self.sched
            .add_task(Entity::Task(task), SchedParams::default())?;
        self.tasks.push(task);
        Ok(())
    }

    pub fn tasks(&self) -> &[TaskId] {
        &self.tasks
    }

    pub fn budget(&self) -> Tick {
        self.q
    }

    pub fn period(&self) -> Tick {
        self.p
    }

    pub fn deadline(&self) -> Tick {
        self.d
    }

    pub fn status(&self) -> ServerStatus {
        self.status
    }

    pub fn vtime(&self) -> f64 {
        self.vtime
    }

    pub fn is_killed(&self) -> bool {
        self.killed
    }

    /// Reserved bandwidth `Q / P`.
    pub fn bandwidth(&self) -> f64 {
        self.q as f64 / self.p as f64
    }

    /// Capacity left, as of the last transition.
    pub fn cap(&self) -> Tick {
        self.cap
    }

    /// Capacity left at `now`, including the running stint.
    pub fn cap_at(&self, now: Tick) -> Tick {
        match self.status {
            ServerStatus::Executing => self.cap.saturating_sub(now - self.last_time),
            _ => self.cap,
        }
    }

    pub fn cpu(&self) -> Option<CpuId> {
        self.cpu
    }

    /// Whether an enveloped task is ready.
    pub fn has_work(&self) -> bool {
        !self.sched.is_empty()
    }

    /// Enveloped task that runs when the server executes.
    pub fn current_task(&self) -> Option<TaskId> {
        self.sched.get_first().and_then(Entity::task)
    }

    /// Ready enveloped tasks in order.
    pub fn ready_tasks(&self) -> Vec<TaskId> {
        self.sched.iter().filter_map(Entity::task).collect()
    }

    /// Whether the server contends for a core (ready or executing).
    pub fn is_contending(&self) -> bool {
        matches!(self.status, ServerStatus::Ready | ServerStatus::Executing)
    }

    /// Whether the server has voluntarily given up the core: nothing left to
    /// run. Such a server must never be made running.
    pub fn has_yielded(&self) -> bool {
        !self.has_work() || !self.is_contending()
    }

    fn set_status(&mut self, to: ServerStatus) {
        invariant!(
            is_legal(self.status, to),
            "server {} ({}) cannot go {} -> {}",
            self.id.0,
            self.name,
            self.status,
            to
        );
        trace!(server = self.id.0, from = %self.status, to = %to, "cbs transition");
        self.status = to;
    }

    /// Charge the time executed since `last_time`.
    fn account(&mut self, now: Tick) {
        let elapsed = now - self.last_time;
        invariant!(
            elapsed <= self.cap,
            "server {} executed {elapsed} with only {} capacity left",
            self.id.0,
            self.cap
        );
        self.cap -= elapsed;
        self.vtime += elapsed as f64 * self.p as f64 / self.q as f64;
        self.stats.executed += elapsed;
        self.last_time = now;
    }

    fn post_idle(&mut self, at: Tick, events: &mut EventQueue) {
        events.cancel_slot(&mut self.idle_evt);
        self.idle_evt = Some(events.post(at, EventKind::ServerIdle { server: self.id }));
    }

    fn idle_instant(&self, now: Tick) -> Tick {
        (self.vtime.ceil() as Tick).max(now)
    }

    /// A task of this server released an instance (ordered by its own
    /// absolute deadline).
    pub fn on_work_arrival(
        &mut self,
        task: TaskId,
        now: Tick,
        task_deadline: Tick,
        events: &mut EventQueue,
    ) -> Result<WorkArrival, SimError> {
        let e = Entity::Task(task);
        if !self.sched.is_enqueued(e) {
            self.sched.insert(e, now, task_deadline)?;
        }
        match self.status {
            ServerStatus::Idle => {
                let reused = match self.idle_policy {
                    IdlePolicy::ReuseDline if now < self.d => (self.d - now) * self.q / self.p,
                    _ => 0,
                };
                if reused > 0 {
                    self.cap = reused.min(self.q);
                } else {
                    self.cap = self.q;
                    self.d = now + self.p;
                }
                self.vtime = now as f64;
                self.killed = false;
                self.set_status(ServerStatus::Ready);
                debug!(server = self.id.0, cap = self.cap, deadline = self.d, "cbs wakes up");
                Ok(WorkArrival::BecameReady)
            }
            ServerStatus::Releasing => {
                events.cancel_slot(&mut self.idle_evt);
                self.killed = false;
                self.set_status(ServerStatus::Ready);
                debug!(server = self.id.0, cap = self.cap, deadline = self.d, "cbs resumes");
                Ok(WorkArrival::BecameReady)
            }
            ServerStatus::Ready | ServerStatus::Executing | ServerStatus::Recharging => {
                Ok(WorkArrival::Queued)
            }
        }
    }

    /// The server was dispatched on `cpu`. Returns the task to run.
    pub fn schedule(&mut self, now: Tick, cpu: CpuId, events: &mut EventQueue) -> Option<TaskId> {
        self.set_status(ServerStatus::Executing);
        self.last_time = now;
        self.cpu = Some(cpu);
        events.cancel_slot(&mut self.budget_evt);
        self.budget_evt = Some(events.post(
            now + self.cap,
            EventKind::BudgetExhausted { server: self.id },
        ));
        self.current_task()
    }

    /// The server was preempted.
    pub fn deschedule(&mut self, now: Tick, events: &mut EventQueue) {
        self.account(now);
        events.cancel_slot(&mut self.budget_evt);
        self.cpu = None;
        self.set_status(ServerStatus::Ready);
    }

    /// An enveloped task finished its instance (or was removed). The server
    /// releases itself when nothing else is ready.
    pub fn on_work_finished(
        &mut self,
        task: TaskId,
        now: Tick,
        events: &mut EventQueue,
    ) -> Result<WorkFinished, SimError> {
        self.sched.extract(Entity::Task(task))?;
        if self.has_work() {
            return Ok(WorkFinished::MoreWork);
        }
        match self.status {
            ServerStatus::Executing => {
                self.account(now);
                events.cancel_slot(&mut self.budget_evt);
                self.cpu = None;
            }
            ServerStatus::Ready => {}
            // The pending replenishment settles the server.
            ServerStatus::Recharging => return Ok(WorkFinished::Recharging),
            ServerStatus::Idle | ServerStatus::Releasing => return Ok(WorkFinished::Idle),
        }
        if self.vtime <= now as f64 {
            self.set_status(ServerStatus::Idle);
            debug!(server = self.id.0, "cbs idle");
            Ok(WorkFinished::Idle)
        } else {
            self.set_status(ServerStatus::Releasing);
            let at = self.idle_instant(now);
            self.post_idle(at, events);
            debug!(server = self.id.0, vtime = self.vtime, "cbs releasing");
            Ok(WorkFinished::Releasing { vtime: self.vtime })
        }
    }

    /// A new instance of `task` arrived right as its previous one finished
    /// while the server executed: put it back in line without releasing the
    /// server.
    pub fn requeue_task(&mut self, task: TaskId, now: Tick, deadline: Tick) -> Result<(), SimError> {
        self.sched.requeue(Entity::Task(task), now, deadline)
    }

    /// The idle event fired.
    pub fn on_idle_event(&mut self) {
        self.idle_evt = None;
        self.set_status(ServerStatus::Idle);
        debug!(server = self.id.0, "cbs idle");
    }

    /// The exhaustion event fired.
    pub fn on_budget_exhausted(&mut self, now: Tick, events: &mut EventQueue) -> Exhaustion {
        self.budget_evt = None;
        self.account(now);
        self.stats.exhaustions += 1;
        self.cpu = None;
        self.set_status(ServerStatus::Recharging);
        if self.hard {
            let replenish_at = self.d.max(now);
            events.cancel_slot(&mut self.replenish_evt);
            self.replenish_evt =
                Some(events.post(replenish_at, EventKind::Replenish { server: self.id }));
            self.d += self.p;
            debug!(server = self.id.0, replenish_at, "cbs budget exhausted, recharging");
            Exhaustion::Suspended { replenish_at }
        } else {
            self.cap = self.q;
            self.d += self.p;
            self.stats.replenishments += 1;
            self.set_status(ServerStatus::Ready);
            debug!(server = self.id.0, deadline = self.d, "cbs budget exhausted, postponed");
            Exhaustion::Postponed { deadline: self.d }
        }
    }

    /// The replenishment event fired.
    pub fn on_replenish(&mut self, now: Tick, events: &mut EventQueue) -> WorkFinished {
        self.replenish_evt = None;
        self.cap = self.q;
        self.stats.replenishments += 1;
        if self.has_work() {
            if self.status != ServerStatus::Ready {
                self.set_status(ServerStatus::Ready);
            }
            debug!(server = self.id.0, deadline = self.d, "cbs replenished");
            return WorkFinished::MoreWork;
        }
        match self.status {
            ServerStatus::Recharging | ServerStatus::Releasing => {
                // Never straight from recharging to idle.
                if self.status == ServerStatus::Recharging {
                    self.set_status(ServerStatus::Releasing);
                }
                let at = self.idle_instant(now);
                self.post_idle(at, events);
                WorkFinished::Releasing { vtime: self.vtime }
            }
            _ => WorkFinished::Idle,
        }
    }

    /// Resize the budget.
    pub fn change_budget(
        &mut self,
        new_q: Tick,
        now: Tick,
        events: &mut EventQueue,
    ) -> Result<(), SimError> {
        if new_q == 0 || new_q > self.p {
            return Err(SimError::InvalidBudget {
                budget: new_q,
                period: self.p,
            });
        }
        if new_q == self.q {
            return Ok(());
        }
        let executing = self.status == ServerStatus::Executing;
        if executing {
            self.account(now);
        }
        let cap = self.cap as i64 + new_q as i64 - self.q as i64;
        self.cap = cap.clamp(0, new_q as i64) as Tick;
        debug!(server = self.id.0, old = self.q, new = new_q, cap = self.cap, "cbs budget changed");
        self.q = new_q;
        if executing {
            events.cancel_slot(&mut self.budget_evt);
            self.budget_evt = Some(events.post(
                now + self.cap,
                EventKind::BudgetExhausted { server: self.id },
            ));
        }
        Ok(())
    }

    /// Sum of the scaled WCETs of the enveloped tasks that still matter at
    /// `now`: tasks that ended exactly now are left out, as are non-periodic
    /// tasks that are inactive or past their deadline.
    pub fn get_wcet(&self, speed: f64, now: Tick, tasks: &[Task]) -> Tick {
        self.tasks
            .iter()
            .map(|t| &tasks[t.idx()])
            .filter(|t| !(t.last_end() == Some(now) && !t.is_active()))
            .filter(|t| t.is_periodic() || (t.is_active() && t.abs_deadline() >= now))
            .map(|t| t.wcet_at(speed))
            .fold(0, Tick::saturating_add)
    }

    /// Abort the current instance. Returns the ready enveloped tasks, whose
    /// instances the caller must kill too.
    ///
    /// The server keeps counting against its core until its virtual time
    /// elapses, so a killed server with virtual time ahead of the clock goes
    /// through `Releasing`.
    pub fn kill_instance(&mut self, now: Tick, events: &mut EventQueue) -> Vec<TaskId> {
        invariant!(!self.killed, "server {} killed twice", self.id.0);
        if self.status == ServerStatus::Executing {
            self.account(now);
        }
        events.cancel_slot(&mut self.budget_evt);
        events.cancel_slot(&mut self.replenish_evt);
        events.cancel_slot(&mut self.idle_evt);
        let victims = self.ready_tasks();
        for t in &victims {
            let extracted = self.sched.extract(Entity::Task(*t));
            invariant!(
                matches!(extracted, Ok(true)),
                "server {}: ready task {} missing from its queue",
                self.id.0,
                t.0
            );
        }
        self.killed = true;
        self.cpu = None;
        self.stats.kills += 1;
        let to = if self.vtime > now as f64 || self.status == ServerStatus::Recharging {
            ServerStatus::Releasing
        } else {
            ServerStatus::Idle
        };
        trace!(server = self.id.0, from = %self.status, to = %to, "cbs killed");
        self.status = to;
        if to == ServerStatus::Releasing {
            let at = self.idle_instant(now);
            self.post_idle(at, events);
        }
        debug!(server = self.id.0, victims = victims.len(), "cbs instance killed");
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskDef;

    fn server(q: Tick, p: Tick) -> CbServer {
        let mut s = CbServer::new(ServerId(0), &ServerDef::new("s", q, p)).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s
    }

    #[test]
    fn rejects_bad_budget() {
        assert!(CbServer::new(ServerId(0), &ServerDef::new("s", 0, 10)).is_err());
        assert!(CbServer::new(ServerId(0), &ServerDef::new("s", 11, 10)).is_err());
    }

    #[test]
    fn round_trip() {
        let mut q = EventQueue::new();
        let mut s = server(2, 10);
        assert_eq!(
            s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap(),
            WorkArrival::BecameReady
        );
        assert_eq!(s.deadline(), 10);
        assert_eq!(s.schedule(0, CpuId(0), &mut q), Some(TaskId(0)));
        assert_eq!(s.status(), ServerStatus::Executing);

        q.advance_to(2);
        let r = s.on_work_finished(TaskId(0), 2, &mut q).unwrap();
        assert_eq!(r, WorkFinished::Releasing { vtime: 10.0 });
        assert_eq!(s.cap(), 0);

        // Only the idle event is left: the exhaustion event was cancelled.
        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 10);
        assert_eq!(ev.kind, EventKind::ServerIdle { server: ServerId(0) });
        assert!(q.is_empty());
        s.on_idle_event();
        assert_eq!(s.status(), ServerStatus::Idle);

        s.on_work_arrival(TaskId(0), 10, 20, &mut q).unwrap();
        assert_eq!(s.cap(), 2);
        assert_eq!(s.deadline(), 20);
    }

    #[test]
    fn soft_exhaustion_postpones_now() {
        let mut q = EventQueue::new();
        let mut s = server(3, 10);
        s.on_work_arrival(TaskId(0), 0, 100, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 3);
        assert_eq!(
            s.on_budget_exhausted(3, &mut q),
            Exhaustion::Postponed { deadline: 20 }
        );
        assert_eq!(s.status(), ServerStatus::Ready);
        assert_eq!(s.cap(), 3);
        assert_eq!(s.stats.replenishments, 1);
        assert!(q.is_empty());
    }

    #[test]
    fn hard_exhaustion_waits_for_old_deadline() {
        let mut q = EventQueue::new();
        let mut s = CbServer::new(ServerId(0), &ServerDef::new("h", 3, 10).hard()).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s.on_work_arrival(TaskId(0), 0, 100, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.pop();
        assert_eq!(
            s.on_budget_exhausted(3, &mut q),
            Exhaustion::Suspended { replenish_at: 10 }
        );
        assert_eq!(s.status(), ServerStatus::Recharging);
        assert_eq!(s.cap(), 0);
        assert_eq!(s.deadline(), 20);

        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 10);
        assert_eq!(ev.kind, EventKind::Replenish { server: ServerId(0) });
        assert_eq!(s.on_replenish(10, &mut q), WorkFinished::MoreWork);
        assert_eq!(s.status(), ServerStatus::Ready);
        assert_eq!(s.cap(), 3);
    }

    #[test]
    fn recharging_without_work_passes_through_releasing() {
        let mut q = EventQueue::new();
        let mut s = CbServer::new(ServerId(0), &ServerDef::new("h", 5, 10).hard()).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s.on_work_arrival(TaskId(0), 0, 100, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.pop();
        s.on_budget_exhausted(5, &mut q);
        // The task is gone by the time the budget comes back.
        assert_eq!(
            s.on_work_finished(TaskId(0), 5, &mut q).unwrap(),
            WorkFinished::Recharging
        );
        q.advance_to(10);
        let r = s.on_replenish(10, &mut q);
        assert_eq!(r, WorkFinished::Releasing { vtime: 10.0 });
        assert_eq!(s.status(), ServerStatus::Releasing);
        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 10);
        s.on_idle_event();
        assert_eq!(s.status(), ServerStatus::Idle);
    }

    #[test]
    fn preemption_accounts_capacity() {
        let mut q = EventQueue::new();
        let mut s = server(4, 8);
        s.on_work_arrival(TaskId(0), 0, 8, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.advance_to(1);
        s.deschedule(1, &mut q);
        assert_eq!(s.cap(), 3);
        assert!((s.vtime() - 2.0).abs() < 1e-12);
        assert!(q.is_empty());
    }

    #[test]
    fn reuse_deadline_keeps_bandwidth() {
        let mut q = EventQueue::new();
        let def = ServerDef::new("r", 4, 10).reuse_deadline();
        let mut s = CbServer::new(ServerId(0), &def).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.advance_to(1);
        // vtime = 2.5, so the server releases until 3.
        s.on_work_finished(TaskId(0), 1, &mut q).unwrap();
        q.pop();
        s.on_idle_event();
        q.advance_to(5);
        s.on_work_arrival(TaskId(0), 5, 15, &mut q).unwrap();
        assert_eq!(s.deadline(), 10);
        assert_eq!(s.cap(), 2);

        // Too close to the old deadline: start over.
        let mut s = CbServer::new(ServerId(1), &def).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap();
        s.schedule(5, CpuId(0), &mut q);
        assert_eq!(
            s.on_work_finished(TaskId(0), 6, &mut q).unwrap(),
            WorkFinished::Idle
        );
        q.advance_to(9);
        s.on_work_arrival(TaskId(0), 9, 19, &mut q).unwrap();
        assert_eq!(s.cap(), 4);
        assert_eq!(s.deadline(), 19);
    }

    #[test]
    fn change_budget_reposts_exhaustion() {
        let mut q = EventQueue::new();
        let mut s = server(4, 10);
        s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.advance_to(1);
        assert!(s.change_budget(0, 1, &mut q).is_err());
        assert!(s.change_budget(11, 1, &mut q).is_err());
        s.change_budget(4, 1, &mut q).unwrap();
        s.change_budget(2, 1, &mut q).unwrap();
        assert_eq!(s.budget(), 2);
        assert_eq!(s.cap(), 1);
        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 2);
        assert!(q.is_empty());
    }

    #[test]
    fn wcet_of_relevant_tasks() {
        let defs = [
            TaskDef::periodic("p", 100, 10),
            TaskDef::one_shot("a", 0, 20, 50),
        ];
        let mut tasks: Vec<Task> = defs
            .iter()
            .enumerate()
            .map(|(i, d)| Task::new(TaskId(i as u32), d, Some(ServerId(0))))
            .collect();
        let mut s = CbServer::new(ServerId(0), &ServerDef::new("s", 5, 10)).unwrap();
        s.add_task(TaskId(0)).unwrap();
        s.add_task(TaskId(1)).unwrap();
        let mut q = EventQueue::new();

        // The aperiodic task is inactive.
        assert_eq!(s.get_wcet(0.5, 0, &tasks), 20);
        tasks[1].release(0, &mut q);
        assert_eq!(s.get_wcet(0.5, 0, &tasks), 60);
        // Past its deadline.
        assert_eq!(s.get_wcet(0.5, 51, &tasks), 20);
        // A task that ended exactly now does not count.
        tasks[0].release(0, &mut q);
        tasks[0].schedule(0, CpuId(0), 1.0, &mut q);
        q.advance_to(10);
        tasks[0].complete(10, &mut q);
        assert_eq!(s.get_wcet(1.0, 10, &tasks), 20);
        assert_eq!(s.get_wcet(1.0, 11, &tasks), 30);
    }

    #[test]
    fn kill_keeps_releasing_until_vtime() {
        let mut q = EventQueue::new();
        let mut s = server(2, 10);
        s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap();
        s.schedule(0, CpuId(0), &mut q);
        q.advance_to(1);
        assert_eq!(s.kill_instance(1, &mut q), vec![TaskId(0)]);
        assert!(s.is_killed());
        assert_eq!(s.status(), ServerStatus::Releasing);
        let ev = q.pop().unwrap();
        assert_eq!(ev.time, 5);
        s.on_idle_event();
        s.on_work_arrival(TaskId(0), 5, 15, &mut q).unwrap();
        assert!(!s.is_killed());
    }

    #[test]
    #[should_panic(expected = "killed twice")]
    fn double_kill_is_fatal() {
        let mut q = EventQueue::new();
        let mut s = server(2, 10);
        s.on_work_arrival(TaskId(0), 0, 10, &mut q).unwrap();
        s.kill_instance(0, &mut q);
        s.kill_instance(0, &mut q);
    }
}
