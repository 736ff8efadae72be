//! Core simulation engine: the event loop.
//!
//! [`Simulator`] owns the arena, the event queue, the kernel and the
//! energy meter. Each step pops the next live event, publishes the clock to
//! the log formatter, charges energy for the elapsed interval and lets the
//! kernel react. Observers see arrivals, ends and kills after every step.

use tracing::info;

use crate::error::SimError;
use crate::event::set_sim_context;
use crate::history::MigrationLog;
use crate::kernel::{EnergyMrtKernel, SimCtx};
use crate::scenario::Scenario;
use crate::stats::{EnergyMeter, Report};
use crate::system::System;
use crate::trace::{Trace, TraceKind};
use crate::types::{Entity, ServerId, TaskId, Tick};

/// Callbacks for task life-cycle events.
///
/// Implement this to collect per-instance data while a simulation runs.
/// Every method defaults to doing nothing.
pub trait Observer {
    /// A task released an instance.
    fn on_arrival(&mut self, _time: Tick, _task: TaskId) {}
    /// A task instance completed.
    fn on_end(&mut self, _time: Tick, _task: TaskId) {}
    /// A task instance was killed or discarded.
    fn on_kill(&mut self, _time: Tick, _task: TaskId) {}
}

/// A running simulation.
pub struct Simulator {
    sys: System,
    ctx: SimCtx,
    kernel: EnergyMrtKernel,
    meter: EnergyMeter,
    observers: Vec<Box<dyn Observer>>,
    /// Trace records already shown to the observers.
    observed: usize,
    duration: Tick,
}

impl Simulator {
    /// Instantiate `scenario` and post the first arrival of every task.
    pub fn new(scenario: Scenario) -> Result<Self, SimError> {
        let mut sys = System::new(&scenario.platform)?;
        for s in &scenario.servers {
            sys.add_server(s)?;
        }
        for t in &scenario.tasks {
            sys.add_task(t)?;
        }
        let kernel = EnergyMrtKernel::new(scenario.policy, &sys)?;
        let mut ctx = SimCtx::new();
        for task in &mut sys.tasks {
            task.post_first_arrival(&mut ctx.events);
        }
        let meter = EnergyMeter::new(sys.nr_cpus());
        info!(
            tasks = sys.tasks.len(),
            servers = sys.servers.len(),
            duration = scenario.duration,
            "simulation created"
        );
        Ok(Simulator {
            sys,
            ctx,
            kernel,
            meter,
            observers: Vec::new(),
            observed: 0,
            duration: scenario.duration,
        })
    }

    pub fn add_observer(&mut self, observer: Box<dyn Observer>) {
        self.observers.push(observer);
    }

    /// Run to the scenario's duration.
    pub fn run(&mut self) -> Result<(), SimError> {
        self.run_until(self.duration)
    }

    /// Handle every event up to and including `horizon`, then leave the
    /// clock at `horizon`.
    pub fn run_until(&mut self, horizon: Tick) -> Result<(), SimError> {
        while self
            .ctx
            .events
            .peek_time()
            .is_some_and(|t| t <= horizon)
        {
            self.step()?;
        }
        if horizon > self.ctx.now() {
            set_sim_context(horizon, None);
            self.meter.advance(horizon, &self.sys);
            self.ctx.events.advance_to(horizon);
        }
        Ok(())
    }

    /// Handle the next event. Returns its time, or `None` when nothing is
    /// left to simulate.
    pub fn step(&mut self) -> Result<Option<Tick>, SimError> {
        let Some(event) = self.ctx.events.pop() else {
            return Ok(None);
        };
        set_sim_context(event.time, event.kind.cpu());
        self.meter.advance(event.time, &self.sys);
        self.kernel
            .handle(&mut self.sys, &mut self.ctx, event.kind)?;
        self.notify_observers();
        Ok(Some(event.time))
    }

    /// Abort the live instance of `task` now. Returns false when it has
    /// none.
    pub fn kill_instance(&mut self, task: TaskId) -> Result<bool, SimError> {
        if task.idx() >= self.sys.tasks.len() {
            return Err(SimError::UnknownTask(Entity::Task(task)));
        }
        set_sim_context(self.ctx.now(), None);
        let killed = self
            .kernel
            .kill_instance(&mut self.sys, &mut self.ctx, task)?;
        self.notify_observers();
        Ok(killed)
    }

    /// Resize the budget of `server` now.
    pub fn change_budget(&mut self, server: ServerId, budget: Tick) -> Result<(), SimError> {
        if server.idx() >= self.sys.servers.len() {
            return Err(SimError::UnknownServer(server));
        }
        let now = self.ctx.now();
        self.sys
            .server_mut(server)
            .change_budget(budget, now, &mut self.ctx.events)
    }

    fn notify_observers(&mut self) {
        let events = &self.ctx.trace.events()[self.observed..];
        if !self.observers.is_empty() {
            for ev in events {
                for obs in &mut self.observers {
                    match ev.kind {
                        TraceKind::TaskArrived { task } => obs.on_arrival(ev.time, task),
                        TraceKind::TaskCompleted { task, .. } => obs.on_end(ev.time, task),
                        TraceKind::TaskKilled { task } | TraceKind::TaskDiscarded { task } => {
                            obs.on_kill(ev.time, task)
                        }
                        _ => {}
                    }
                }
            }
        }
        self.observed = self.ctx.trace.len();
    }

    pub fn now(&self) -> Tick {
        self.ctx.now()
    }

    pub fn system(&self) -> &System {
        &self.sys
    }

    pub fn kernel(&self) -> &EnergyMrtKernel {
        &self.kernel
    }

    pub fn trace(&self) -> &Trace {
        &self.ctx.trace
    }

    pub fn history(&self) -> &MigrationLog {
        &self.ctx.history
    }

    pub fn energy(&self) -> &EnergyMeter {
        &self.meter
    }

    pub fn task_id(&self, name: &str) -> Option<TaskId> {
        self.sys.task_by_name(name)
    }

    pub fn server_id(&self, name: &str) -> Option<ServerId> {
        self.sys.server_by_name(name)
    }

    /// Summary of the run so far.
    pub fn report(&self) -> Report {
        Report::new(self.now(), &self.sys, &self.ctx.trace, &self.meter)
    }
}
