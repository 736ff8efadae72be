//! Energy-aware multiprocessor real-time kernel.
//!
//! The kernel owns the per-core queues and reacts to every event the
//! simulation produces. Newly arrived entities are batched and placed by
//! [`EnergyMrtKernel::dispatch`] on the (core, OPP) pair that raises the
//! island power the least while keeping every core schedulable. Cores that
//! run dry pull waiting work from their neighbours (see `migrate`).
//!
//! Ownership: the kernel never stores references into the [`System`]
//! arena. Every handler receives `&mut System` and a [`SimCtx`] carrying
//! the event queue and the recorders.

mod dispatch;
mod migrate;

use std::collections::BTreeMap;

use tracing::{debug, info, warn};

use crate::cbs::{Exhaustion, ServerStatus, WorkArrival, WorkFinished};
use crate::error::SimError;
use crate::event::{EventHandle, EventKind, EventQueue};
use crate::history::{HistoryKind, MigrationLog};
use crate::invariant;
use crate::multi::MultiCoresScheds;
use crate::policy::DispatchPolicy;
use crate::system::System;
use crate::trace::{Trace, TraceKind};
use crate::types::{CpuId, Entity, ServerId, TaskId, Tick, Workload};

/// Event queue plus the recorders every handler writes to.
#[derive(Debug, Default)]
pub struct SimCtx {
    pub events: EventQueue,
    pub trace: Trace,
    pub history: MigrationLog,
}

impl SimCtx {
    pub fn new() -> Self {
        SimCtx {
            events: EventQueue::new(),
            trace: Trace::new(),
            history: MigrationLog::new(),
        }
    }

    pub fn now(&self) -> Tick {
        self.events.now()
    }
}

/// Where the kernel decided to run an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Placement {
    pub cpu: CpuId,
    pub opp: usize,
}

/// Why a core ran out of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeTrigger {
    /// An instance ended, was killed, or a hard server got suspended.
    End,
    /// A released CBS server reached its virtual time.
    VirtualTime,
}

#[derive(Debug, Clone, Copy)]
struct TempMigration {
    origin: CpuId,
    dest: CpuId,
}

/// The energy-aware kernel.
#[derive(Debug)]
pub struct EnergyMrtKernel {
    policy: DispatchPolicy,
    mcs: MultiCoresScheds,
    /// Entities placed and still being switched in on their core. A record
    /// goes away at end-dispatch, or as soon as the core picks another entity.
    dispatching: BTreeMap<Entity, Placement>,
    /// Entities waiting for the next batch placement.
    arrivals: Vec<Entity>,
    dispatch_evt: Option<EventHandle>,
    temp_migrations: BTreeMap<Entity, TempMigration>,
}

impl EnergyMrtKernel {
    pub fn new(policy: DispatchPolicy, sys: &System) -> Result<Self, SimError> {
        policy.validate()?;
        if let Some(&c) = policy
            .reserved_cpus
            .iter()
            .find(|&&c| c as usize >= sys.nr_cpus())
        {
            return Err(SimError::UnknownCpu(CpuId(c)));
        }
        let mut mcs = MultiCoresScheds::new(
            sys.nr_cpus(),
            policy.core_policy,
            policy.context_switch_overhead,
        );
        for e in sys.entities() {
            mcs.register(e, sys.params(e))?;
        }
        info!(
            cpus = sys.nr_cpus(),
            islands = sys.islands.len(),
            entities = sys.entities().len(),
            "kernel ready"
        );
        Ok(EnergyMrtKernel {
            policy,
            mcs,
            dispatching: BTreeMap::new(),
            arrivals: Vec::new(),
            dispatch_evt: None,
            temp_migrations: BTreeMap::new(),
        })
    }

    pub fn policy(&self) -> &DispatchPolicy {
        &self.policy
    }

    pub fn scheds(&self) -> &MultiCoresScheds {
        &self.mcs
    }

    /// React to one event.
    pub fn handle(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        kind: EventKind,
    ) -> Result<(), SimError> {
        match kind {
            EventKind::TaskArrival { task } => self.on_task_arrival(sys, ctx, task),
            EventKind::KernelDispatch => {
                self.dispatch_evt = None;
                self.dispatch(sys, ctx)
            }
            EventKind::BeginDispatch { cpu, entity } => {
                self.mcs
                    .on_begin_dispatch_finished(cpu, entity, ctx.now(), &mut ctx.events);
                Ok(())
            }
            EventKind::EndDispatch { cpu, entity } => self.on_end_dispatch(sys, ctx, cpu, entity),
            EventKind::TaskEnd { task } => self.on_task_end(sys, ctx, task),
            EventKind::BudgetExhausted { server } => self.on_budget_exhausted(sys, ctx, server),
            EventKind::Replenish { server } => self.on_replenish(sys, ctx, server),
            EventKind::ServerIdle { server } => self.on_server_idle(sys, ctx, server),
            EventKind::RoundExpired { cpu, entity } => self.on_round_expired(sys, ctx, cpu, entity),
            EventKind::DeadlineCheck { task, instance } => {
                self.on_deadline_check(sys, ctx, task, instance)
            }
        }
    }

    // ---------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------

    /// Core `e` is committed as running on.
    pub fn get_processor(&self, e: Entity) -> Option<CpuId> {
        self.mcs.get_processor(e)
    }

    /// Core `e` is queued on, running or not.
    pub fn get_processor_ready(&self, e: Entity) -> Option<CpuId> {
        self.mcs.find_core(e)
    }

    /// Bandwidth of the servers queued on `cpu` that are contending or
    /// still releasing, plus the bandwidth servers that left the core
    /// charge to it until their virtual time.
    pub fn utilization_active(&self, sys: &System, cpu: CpuId) -> f64 {
        let queued: f64 = self
            .mcs
            .queue(cpu)
            .iter()
            .filter_map(Entity::server)
            .map(|s| sys.server(s))
            .filter(|s| s.is_contending() || s.status() == ServerStatus::Releasing)
            .map(|s| s.bandwidth())
            .sum();
        queued + self.mcs.utilization_active(cpu)
    }

    /// Utilization charged to `cpu` at its current OPP.
    pub fn cpu_utilization(&self, sys: &System, cpu: CpuId) -> f64 {
        let opp = sys.island_of(cpu).opp_index();
        self.core_util(sys, cpu, opp, None)
    }

    /// Whether `e` runs on `cpu` only until its origin core frees up.
    pub fn is_task_temporarily_migrated(&self, e: Entity, cpu: CpuId) -> bool {
        self.temp_migrations.get(&e).is_some_and(|m| m.dest == cpu)
    }

    /// Placement of an entity whose context switch is still in flight.
    pub fn dispatch_record(&self, e: Entity) -> Option<Placement> {
        self.dispatching.get(&e).copied()
    }

    // ---------------------------------------------------------------
    // Arrivals
    // ---------------------------------------------------------------

    fn on_task_arrival(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        t: TaskId,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        sys.task_mut(t).post_next_arrival(now, &mut ctx.events);
        if sys.task_mut(t).release(now, &mut ctx.events) {
            ctx.trace.record(now, None, TraceKind::TaskArrived { task: t });
            self.activate(sys, ctx, t)
        } else {
            ctx.trace.record(now, None, TraceKind::TaskBuffered { task: t });
            Ok(())
        }
    }

    /// Start a buffered arrival of `t` if its last instance left one behind.
    fn release_pending(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        t: TaskId,
    ) -> Result<(), SimError> {
        if !sys.task_mut(t).take_pending() {
            return Ok(());
        }
        let now = ctx.now();
        sys.task_mut(t).release(now, &mut ctx.events);
        ctx.trace.record(now, None, TraceKind::TaskArrived { task: t });
        self.activate(sys, ctx, t)
    }

    /// A fresh instance of `t` needs CPU time.
    fn activate(&mut self, sys: &mut System, ctx: &mut SimCtx, t: TaskId) -> Result<(), SimError> {
        let Some(s) = sys.task(t).server else {
            self.enqueue_arrival(ctx, Entity::Task(t));
            return Ok(());
        };
        let now = ctx.now();
        let deadline = sys.task(t).abs_deadline();
        match sys
            .server_mut(s)
            .on_work_arrival(t, now, deadline, &mut ctx.events)?
        {
            WorkArrival::BecameReady => {
                self.trace_server(sys, ctx, s);
                self.mcs.forget_u_active(s);
                let e = Entity::Server(s);
                match self.mcs.find_core(e) {
                    // Still queued from before it released.
                    Some(cpu) => {
                        let d = sys.server(s).deadline();
                        self.mcs.queue_mut(cpu).requeue(e, now, d)?;
                        self.reschedule_core(sys, ctx, cpu)
                    }
                    None => {
                        self.enqueue_arrival(ctx, e);
                        Ok(())
                    }
                }
            }
            WorkArrival::Queued => self.refresh_server_inner(sys, ctx, s),
        }
    }

    fn enqueue_arrival(&mut self, ctx: &mut SimCtx, e: Entity) {
        if !self.arrivals.contains(&e) {
            self.arrivals.push(e);
        }
        if self.dispatch_evt.is_none() {
            let now = ctx.now();
            self.dispatch_evt = Some(ctx.events.post(now, EventKind::KernelDispatch));
        }
    }

    // ---------------------------------------------------------------
    // Running entities
    // ---------------------------------------------------------------

    fn on_end_dispatch(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
        e: Entity,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        self.mcs.on_end_dispatch_finished(cpu, e, now);
        self.dispatching.remove(&e);
        if !sys.should_schedule(e) {
            debug!(cpu = cpu.0, entity = %e, "lost its work during the switch");
            self.mcs.make_ready(cpu, &mut ctx.events);
            return self.reschedule_core(sys, ctx, cpu);
        }
        match e {
            Entity::Task(t) => self.start_task(sys, ctx, t, cpu),
            Entity::Server(s) => {
                let inner = sys.server_mut(s).schedule(now, cpu, &mut ctx.events);
                self.trace_server(sys, ctx, s);
                if let Some(t) = inner {
                    self.start_task(sys, ctx, t, cpu);
                }
            }
        }
        if let Some(left) = self.mcs.queue(cpu).round_remaining(e) {
            let handle = ctx
                .events
                .post(now + left, EventKind::RoundExpired { cpu, entity: e });
            self.mcs.set_round_timer(cpu, handle);
        }
        Ok(())
    }

    /// Put task `t` on `cpu` at the island's current speed.
    fn start_task(&mut self, sys: &mut System, ctx: &mut SimCtx, t: TaskId, cpu: CpuId) {
        let now = ctx.now();
        let workload = sys.task(t).workload.clone();
        let speed = sys.speed(cpu, &workload);
        let freq_mhz = sys.island_of(cpu).freq_mhz();
        let owner = match sys.task(t).server {
            Some(s) => Entity::Server(s),
            None => Entity::Task(t),
        };
        if sys.cpu(cpu).workload != workload {
            ctx.history.record(
                owner,
                now,
                HistoryKind::WorkloadChange {
                    cpu,
                    workload: workload.clone(),
                },
            );
        }
        let c = &mut sys.cpus[cpu.idx()];
        c.busy = true;
        c.workload = workload;
        sys.task_mut(t).schedule(now, cpu, speed, &mut ctx.events);
        ctx.trace
            .record(now, Some(cpu), TraceKind::TaskScheduled { task: t, speed });
        ctx.history
            .record(Entity::Task(t), now, HistoryKind::Schedule { cpu, freq_mhz });
    }

    fn idle_cpu(sys: &mut System, cpu: CpuId) {
        let c = &mut sys.cpus[cpu.idx()];
        c.busy = false;
        c.workload = Workload::idle();
    }

    /// Enveloped task of `e` executing right now.
    fn executing_task(sys: &System, e: Entity) -> Option<TaskId> {
        match e {
            Entity::Task(t) => sys.task(t).is_executing().then_some(t),
            Entity::Server(s) => sys
                .server(s)
                .tasks()
                .iter()
                .copied()
                .find(|t| sys.task(*t).is_executing()),
        }
    }

    /// Make an executing server run the task it should be running, after
    /// its internal queue changed.
    fn refresh_server_inner(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        s: ServerId,
    ) -> Result<(), SimError> {
        let Some(cpu) = self.mcs.get_processor(Entity::Server(s)) else {
            return Ok(());
        };
        if sys.server(s).status() != ServerStatus::Executing {
            return Ok(());
        }
        let want = sys.server(s).current_task();
        let running = Self::executing_task(sys, Entity::Server(s));
        if want == running {
            return Ok(());
        }
        let now = ctx.now();
        if let Some(r) = running {
            sys.task_mut(r).deschedule(now, &mut ctx.events);
            ctx.trace
                .record(now, Some(cpu), TraceKind::TaskPreempted { task: r });
        }
        if let Some(w) = want {
            self.start_task(sys, ctx, w, cpu);
        }
        Ok(())
    }

    /// Stop the committed running entity of `cpu`, charging its round.
    fn stop_entity(&mut self, sys: &mut System, ctx: &mut SimCtx, cpu: CpuId, e: Entity) {
        let now = ctx.now();
        let ran = now - self.mcs.running_since(cpu);
        self.mcs.queue_mut(cpu).charge(e, ran);
        if let Some(t) = Self::executing_task(sys, e) {
            sys.task_mut(t).deschedule(now, &mut ctx.events);
            ctx.trace
                .record(now, Some(cpu), TraceKind::TaskPreempted { task: t });
        }
        if let Entity::Server(s) = e {
            if sys.server(s).status() == ServerStatus::Executing {
                sys.server_mut(s).deschedule(now, &mut ctx.events);
                self.trace_server(sys, ctx, s);
            }
        }
        ctx.history.record(e, now, HistoryKind::Deschedule { cpu });
        Self::idle_cpu(sys, cpu);
    }

    /// Take whatever runs on (or is being switched to) `cpu` off it.
    fn preempt(&mut self, sys: &mut System, ctx: &mut SimCtx, cpu: CpuId) {
        if let Some(e) = self.mcs.running(cpu) {
            self.stop_entity(sys, ctx, cpu, e);
        }
        self.mcs.make_ready(cpu, &mut ctx.events);
    }

    /// Make the highest-priority schedulable entity of `cpu` the running
    /// one, preempting the current one if needed.
    pub(crate) fn reschedule_core(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
    ) -> Result<(), SimError> {
        let first = self.mcs.first_schedulable(cpu, |e| sys.should_schedule(e));
        let current = self.mcs.current(cpu);
        let went_idle = first.is_none() && current.is_some();
        if first != current {
            if current.is_some() {
                self.preempt(sys, ctx, cpu);
            }
            match first {
                Some(e) => self.mcs.make_running(e, cpu, ctx.now(), &mut ctx.events),
                None => {
                    let now = ctx.now();
                    ctx.trace.record(now, Some(cpu), TraceKind::CpuIdle);
                }
            }
        }
        self.settle_dispatch_records(cpu);
        if went_idle {
            self.maybe_reset_island(sys, ctx, cpu);
        }
        Ok(())
    }

    /// Only the entity `cpu` is switching to keeps its placement record.
    /// Entities placed behind another one are plain waiting work from now on.
    fn settle_dispatch_records(&mut self, cpu: CpuId) {
        let incoming = self.mcs.switching(cpu).map(|(e, _)| e);
        self.dispatching.retain(|e, p| p.cpu != cpu || Some(*e) == incoming);
    }

    // ---------------------------------------------------------------
    // Ends
    // ---------------------------------------------------------------

    fn on_task_end(&mut self, sys: &mut System, ctx: &mut SimCtx, t: TaskId) -> Result<(), SimError> {
        let now = ctx.now();
        let cpu = sys.task(t).cpu();
        let response = sys.task_mut(t).complete(now, &mut ctx.events);
        ctx.trace
            .record(now, cpu, TraceKind::TaskCompleted { task: t, response });
        ctx.history
            .record(Entity::Task(t), now, HistoryKind::End { cpu });
        debug!(task = t.0, response, "instance completed");
        invariant!(cpu.is_some(), "task {} ended without a cpu", t.0);
        let Some(cpu) = cpu else {
            return Ok(());
        };
        match sys.task(t).server {
            Some(s) => self.on_server_task_end(sys, ctx, s, t, cpu),
            None => self.on_plain_task_end(sys, ctx, t, cpu),
        }
    }

    fn on_plain_task_end(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        t: TaskId,
        cpu: CpuId,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        let e = Entity::Task(t);
        self.mcs.make_ready(cpu, &mut ctx.events);
        Self::idle_cpu(sys, cpu);
        if sys.task_mut(t).take_pending() {
            // The backlog keeps its core.
            sys.task_mut(t).release(now, &mut ctx.events);
            ctx.trace.record(now, None, TraceKind::TaskArrived { task: t });
            let d = sys.task(t).abs_deadline();
            self.mcs.queue_mut(cpu).requeue(e, now, d)?;
            return self.reschedule_core(sys, ctx, cpu);
        }
        self.mcs.remove_from_queue(cpu, e)?;
        self.temp_migrations.remove(&e);
        self.reschedule_core(sys, ctx, cpu)?;
        self.on_core_freed(sys, ctx, cpu, FreeTrigger::End)
    }

    fn on_server_task_end(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        s: ServerId,
        t: TaskId,
        cpu: CpuId,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        if sys.task_mut(t).take_pending() {
            sys.task_mut(t).release(now, &mut ctx.events);
            ctx.trace.record(now, None, TraceKind::TaskArrived { task: t });
            let d = sys.task(t).abs_deadline();
            sys.server_mut(s).requeue_task(t, now, d)?;
            return self.refresh_server_inner(sys, ctx, s);
        }
        let finished = sys.server_mut(s).on_work_finished(t, now, &mut ctx.events)?;
        self.trace_server(sys, ctx, s);
        match finished {
            WorkFinished::MoreWork => self.refresh_server_inner(sys, ctx, s),
            WorkFinished::Releasing { vtime } => self.release_server(sys, ctx, s, cpu, Some(vtime)),
            WorkFinished::Idle => self.release_server(sys, ctx, s, cpu, None),
            WorkFinished::Recharging => Ok(()),
        }
    }

    /// A server ran out of enveloped work on `cpu`. With a virtual time
    /// ahead of the clock its bandwidth stays charged to the core.
    fn release_server(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        s: ServerId,
        cpu: CpuId,
        vtime: Option<f64>,
    ) -> Result<(), SimError> {
        let e = Entity::Server(s);
        let now = ctx.now();
        self.mcs.make_ready(cpu, &mut ctx.events);
        ctx.history.record(e, now, HistoryKind::Deschedule { cpu });
        Self::idle_cpu(sys, cpu);
        let keep_queued = !self.policy.cbs_yield && vtime.is_some();
        if !keep_queued {
            self.mcs.remove_from_queue(cpu, e)?;
            self.temp_migrations.remove(&e);
            if let Some(v) = vtime {
                self.mcs
                    .save_u_active(cpu, s, v, sys.server(s).bandwidth());
            }
        }
        self.reschedule_core(sys, ctx, cpu)?;
        self.on_core_freed(sys, ctx, cpu, FreeTrigger::End)
    }

    // ---------------------------------------------------------------
    // CBS events
    // ---------------------------------------------------------------

    fn on_budget_exhausted(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        s: ServerId,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        let e = Entity::Server(s);
        let cpu = sys.server(s).cpu();
        invariant!(cpu.is_some(), "server {} exhausted its budget off-cpu", s.0);
        let Some(cpu) = cpu else {
            return Ok(());
        };
        if let Some(t) = Self::executing_task(sys, e) {
            sys.task_mut(t).deschedule(now, &mut ctx.events);
            ctx.trace
                .record(now, Some(cpu), TraceKind::TaskPreempted { task: t });
        }
        let ran = now - self.mcs.running_since(cpu);
        self.mcs.queue_mut(cpu).charge(e, ran);
        let outcome = sys.server_mut(s).on_budget_exhausted(now, &mut ctx.events);
        self.trace_server(sys, ctx, s);
        self.mcs.make_ready(cpu, &mut ctx.events);
        Self::idle_cpu(sys, cpu);
        match outcome {
            Exhaustion::Postponed { deadline } => {
                ctx.history.record(e, now, HistoryKind::Deschedule { cpu });
                self.mcs.queue_mut(cpu).requeue(e, now, deadline)?;
                self.reschedule_core(sys, ctx, cpu)
            }
            Exhaustion::Suspended { replenish_at } => {
                debug!(server = s.0, replenish_at, "server suspended");
                ctx.history.record(e, now, HistoryKind::Suspend { cpu });
                self.mcs.remove_from_queue(cpu, e)?;
                self.temp_migrations.remove(&e);
                let vtime = sys.server(s).vtime();
                if vtime > now as f64 {
                    self.mcs
                        .save_u_active(cpu, s, vtime, sys.server(s).bandwidth());
                }
                self.reschedule_core(sys, ctx, cpu)?;
                self.on_core_freed(sys, ctx, cpu, FreeTrigger::End)
            }
        }
    }

    fn on_replenish(&mut self, sys: &mut System, ctx: &mut SimCtx, s: ServerId) -> Result<(), SimError> {
        let now = ctx.now();
        let outcome = sys.server_mut(s).on_replenish(now, &mut ctx.events);
        self.trace_server(sys, ctx, s);
        match outcome {
            WorkFinished::MoreWork => {
                self.mcs.forget_u_active(s);
                self.enqueue_arrival(ctx, Entity::Server(s));
            }
            // Charged until the idle event.
            WorkFinished::Releasing { .. } => {}
            WorkFinished::Idle | WorkFinished::Recharging => {
                self.mcs.forget_u_active(s);
            }
        }
        Ok(())
    }

    fn on_server_idle(&mut self, sys: &mut System, ctx: &mut SimCtx, s: ServerId) -> Result<(), SimError> {
        sys.server_mut(s).on_idle_event();
        self.trace_server(sys, ctx, s);
        let e = Entity::Server(s);
        let mut freed = self
            .mcs
            .u_active_records()
            .iter()
            .find(|r| r.server == s)
            .map(|r| r.cpu);
        self.mcs.forget_u_active(s);
        if let Some(cpu) = self.mcs.find_core(e) {
            self.mcs.remove_from_queue(cpu, e)?;
            self.reschedule_core(sys, ctx, cpu)?;
            freed = Some(cpu);
        }
        match freed {
            Some(cpu) => self.on_core_freed(sys, ctx, cpu, FreeTrigger::VirtualTime),
            None => Ok(()),
        }
    }

    // ---------------------------------------------------------------
    // Round-robin and deadlines
    // ---------------------------------------------------------------

    fn on_round_expired(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
        e: Entity,
    ) -> Result<(), SimError> {
        self.mcs.clear_round_timer(cpu);
        if self.mcs.running(cpu) != Some(e) {
            return Ok(());
        }
        let now = ctx.now();
        debug!(cpu = cpu.0, entity = %e, "round expired");
        self.preempt(sys, ctx, cpu);
        let d = sys.deadline(e);
        self.mcs.queue_mut(cpu).requeue(e, now, d)?;
        self.reschedule_core(sys, ctx, cpu)
    }

    fn on_deadline_check(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        t: TaskId,
        instance: u64,
    ) -> Result<(), SimError> {
        if !sys.task_mut(t).check_deadline(instance) {
            return Ok(());
        }
        let now = ctx.now();
        let cpu = sys.task(t).cpu();
        ctx.trace.record(now, cpu, TraceKind::DeadlineMiss { task: t });
        warn!(task = t.0, name = %sys.task(t).name, instance, "deadline miss");
        if self.policy.kill_on_miss {
            self.kill_instance(sys, ctx, t)?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------
    // Kills and discards
    // ---------------------------------------------------------------

    /// Abort the current instance of `t` (the whole server instance for an
    /// enveloped task). Returns false when `t` has no live instance.
    pub fn kill_instance(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        t: TaskId,
    ) -> Result<bool, SimError> {
        if !sys.task(t).is_active() {
            return Ok(false);
        }
        match sys.task(t).server {
            Some(s) => self.kill_server(sys, ctx, s)?,
            None => self.kill_task(sys, ctx, t)?,
        }
        Ok(true)
    }

    fn kill_task(&mut self, sys: &mut System, ctx: &mut SimCtx, t: TaskId) -> Result<(), SimError> {
        let now = ctx.now();
        let e = Entity::Task(t);
        let core = self.mcs.find_core(e);
        if let Some(cpu) = core {
            if self.mcs.current(cpu) == Some(e) {
                self.preempt(sys, ctx, cpu);
            }
        }
        sys.task_mut(t).kill_instance(now, &mut ctx.events);
        ctx.trace.record(now, core, TraceKind::TaskKilled { task: t });
        ctx.history.record(e, now, HistoryKind::Kill);
        info!(task = t.0, "instance killed");
        self.forget_entity(e);
        if let Some(cpu) = core {
            self.mcs.remove_from_queue(cpu, e)?;
            self.reschedule_core(sys, ctx, cpu)?;
            self.on_core_freed(sys, ctx, cpu, FreeTrigger::End)?;
        }
        self.release_pending(sys, ctx, t)
    }

    fn kill_server(&mut self, sys: &mut System, ctx: &mut SimCtx, s: ServerId) -> Result<(), SimError> {
        let now = ctx.now();
        let e = Entity::Server(s);
        let core = self.mcs.find_core(e);
        if let Some(cpu) = core {
            if self.mcs.current(cpu) == Some(e) {
                self.preempt(sys, ctx, cpu);
            }
        }
        let victims = sys.server_mut(s).kill_instance(now, &mut ctx.events);
        self.trace_server(sys, ctx, s);
        ctx.history.record(e, now, HistoryKind::Kill);
        for &v in &victims {
            sys.task_mut(v).kill_instance(now, &mut ctx.events);
            ctx.trace.record(now, core, TraceKind::TaskKilled { task: v });
            ctx.history.record(Entity::Task(v), now, HistoryKind::Kill);
        }
        info!(server = s.0, victims = victims.len(), "server instance killed");
        self.forget_entity(e);
        if let Some(cpu) = core {
            self.mcs.remove_from_queue(cpu, e)?;
            if sys.server(s).status() == ServerStatus::Releasing {
                let srv = sys.server(s);
                self.mcs.save_u_active(cpu, s, srv.vtime(), srv.bandwidth());
            }
            self.reschedule_core(sys, ctx, cpu)?;
            self.on_core_freed(sys, ctx, cpu, FreeTrigger::End)?;
        }
        for v in victims {
            self.release_pending(sys, ctx, v)?;
        }
        Ok(())
    }

    /// No core admits `e`: drop its instance. Buffered arrivals get
    /// another chance.
    fn discard(&mut self, sys: &mut System, ctx: &mut SimCtx, e: Entity) -> Result<(), SimError> {
        let now = ctx.now();
        warn!(entity = %e, "no admissible core, instance discarded");
        let victims = match e {
            Entity::Task(t) => vec![t],
            Entity::Server(s) => {
                let victims = sys.server_mut(s).kill_instance(now, &mut ctx.events);
                self.trace_server(sys, ctx, s);
                victims
            }
        };
        for &v in &victims {
            if sys.task_mut(v).discard_instance(now, &mut ctx.events) {
                ctx.trace.record(now, None, TraceKind::TaskDiscarded { task: v });
            }
        }
        self.forget_entity(e);
        for v in victims {
            self.release_pending(sys, ctx, v)?;
        }
        Ok(())
    }

    fn forget_entity(&mut self, e: Entity) {
        self.dispatching.remove(&e);
        self.arrivals.retain(|x| *x != e);
        self.temp_migrations.remove(&e);
    }

    fn trace_server(&self, sys: &System, ctx: &mut SimCtx, s: ServerId) {
        let srv = sys.server(s);
        let now = ctx.now();
        ctx.trace.record(
            now,
            srv.cpu(),
            TraceKind::Server {
                server: s,
                status: srv.status(),
            },
        );
    }
}

