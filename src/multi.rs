//! Per-core ready queues and context-switch choreography.
//!
//! Each core owns a [`Scheduler`]. The entity running on a core stays in
//! that core's queue; "running" is tracked separately. Turning a queued
//! entity into the running one takes two events: a begin-dispatch at the
//! time the core is free to switch, then an end-dispatch once the context
//! switch overhead has elapsed. Switches never overlap on one core.

use tracing::{debug, trace};

use crate::error::SimError;
use crate::event::{EventHandle, EventKind, EventQueue};
use crate::invariant;
use crate::sched::{SchedParams, SchedPolicy, Scheduler};
use crate::types::{CpuId, Entity, ServerId, Tick};

/// Phase of an in-flight context switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchPhase {
    /// Waiting for the begin-dispatch event.
    Begin,
    /// Switch in progress, waiting for the end-dispatch event.
    End,
}

#[derive(Debug, Clone, Copy)]
struct Switch {
    entity: Entity,
    phase: SwitchPhase,
    handle: EventHandle,
}

#[derive(Debug, Clone)]
struct Core {
    queue: Scheduler,
    running: Option<Entity>,
    switching: Option<Switch>,
    /// End of the context switch in progress.
    busy_until: Tick,
    running_since: Tick,
    round_evt: Option<EventHandle>,
}

/// Utilization a stopped CBS server still charges to a core until its
/// virtual time elapses.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActiveUtil {
    pub cpu: CpuId,
    pub server: ServerId,
    pub vtime: f64,
    pub util: f64,
}

/// One scheduler per core plus running/switching bookkeeping.
#[derive(Debug, Clone)]
pub struct MultiCoresScheds {
    cores: Vec<Core>,
    u_active: Vec<ActiveUtil>,
    overhead: Tick,
}

impl MultiCoresScheds {
    pub fn new(nr_cpus: usize, policy: SchedPolicy, overhead: Tick) -> Self {
        let cores = (0..nr_cpus)
            .map(|_| Core {
                queue: Scheduler::new(policy),
                running: None,
                switching: None,
                busy_until: 0,
                running_since: 0,
                round_evt: None,
            })
            .collect();
        MultiCoresScheds {
            cores,
            u_active: Vec::new(),
            overhead,
        }
    }

    pub fn nr_cpus(&self) -> usize {
        self.cores.len()
    }

    pub fn overhead(&self) -> Tick {
        self.overhead
    }

    /// Make an entity known to every core, so it can be queued anywhere.
    pub fn register(&mut self, e: Entity, params: SchedParams) -> Result<(), SimError> {
        for core in &mut self.cores {
            core.queue.add_task(e, params)?;
        }
        Ok(())
    }

    pub fn queue(&self, cpu: CpuId) -> &Scheduler {
        &self.cores[cpu.idx()].queue
    }

    pub fn queue_mut(&mut self, cpu: CpuId) -> &mut Scheduler {
        &mut self.cores[cpu.idx()].queue
    }

    pub fn insert_task(
        &mut self,
        e: Entity,
        cpu: CpuId,
        now: Tick,
        deadline: Tick,
    ) -> Result<(), SimError> {
        trace!(cpu = cpu.0, entity = %e, "enqueue");
        self.cores[cpu.idx()].queue.insert(e, now, deadline)
    }

    pub fn remove_from_queue(&mut self, cpu: CpuId, e: Entity) -> Result<bool, SimError> {
        trace!(cpu = cpu.0, entity = %e, "dequeue");
        self.cores[cpu.idx()].queue.extract(e)
    }

    /// Core whose queue holds the entity.
    pub fn find_core(&self, e: Entity) -> Option<CpuId> {
        self.cores
            .iter()
            .position(|c| c.queue.is_enqueued(e))
            .map(|i| CpuId(i as u32))
    }

    /// Core the entity is committed as running on.
    pub fn get_processor(&self, e: Entity) -> Option<CpuId> {
        self.cores
            .iter()
            .position(|c| c.running == Some(e))
            .map(|i| CpuId(i as u32))
    }

    pub fn running(&self, cpu: CpuId) -> Option<Entity> {
        self.cores[cpu.idx()].running
    }

    pub fn switching(&self, cpu: CpuId) -> Option<(Entity, SwitchPhase)> {
        self.cores[cpu.idx()].switching.map(|s| (s.entity, s.phase))
    }

    /// Entity running on, or being switched to, `cpu`.
    pub fn current(&self, cpu: CpuId) -> Option<Entity> {
        let core = &self.cores[cpu.idx()];
        core.running.or(core.switching.map(|s| s.entity))
    }

    pub fn running_since(&self, cpu: CpuId) -> Tick {
        self.cores[cpu.idx()].running_since
    }

    /// A core with nothing queued, running or switching.
    pub fn is_free(&self, cpu: CpuId) -> bool {
        let core = &self.cores[cpu.idx()];
        core.queue.is_empty() && core.running.is_none() && core.switching.is_none()
    }

    /// Highest-priority queued entity that passes `should_schedule`.
    pub fn first_schedulable(
        &self,
        cpu: CpuId,
        should_schedule: impl Fn(Entity) -> bool,
    ) -> Option<Entity> {
        self.cores[cpu.idx()].queue.iter().find(|e| should_schedule(*e))
    }

    /// Start switching `cpu` to `e`: drop the pending switch event of the
    /// core, then post a begin-dispatch once the current switch (if any) is
    /// over.
    pub fn make_running(&mut self, e: Entity, cpu: CpuId, now: Tick, events: &mut EventQueue) {
        let core = &mut self.cores[cpu.idx()];
        invariant!(
            core.running.is_none(),
            "cpu {} switching to {e} while {} still runs",
            cpu.0,
            core.running.map(|r| r.to_string()).unwrap_or_default()
        );
        if let Some(sw) = core.switching.take() {
            events.cancel(sw.handle);
        }
        let at = now.max(core.busy_until);
        let handle = events.post(at, EventKind::BeginDispatch { cpu, entity: e });
        core.switching = Some(Switch {
            entity: e,
            phase: SwitchPhase::Begin,
            handle,
        });
        debug!(cpu = cpu.0, entity = %e, at, "make running");
    }

    /// Take the running (or incoming) entity off `cpu`. Its pending
    /// switch event, if any, is dropped. Returns the committed running
    /// entity.
    pub fn make_ready(&mut self, cpu: CpuId, events: &mut EventQueue) -> Option<Entity> {
        let core = &mut self.cores[cpu.idx()];
        if let Some(sw) = core.switching.take() {
            events.cancel(sw.handle);
        }
        events.cancel_slot(&mut core.round_evt);
        let prev = core.running.take();
        if let Some(e) = prev {
            debug!(cpu = cpu.0, entity = %e, "make ready");
        }
        prev
    }

    /// The begin-dispatch event fired: the switch takes `overhead` ticks.
    pub fn on_begin_dispatch_finished(
        &mut self,
        cpu: CpuId,
        e: Entity,
        now: Tick,
        events: &mut EventQueue,
    ) {
        let overhead = self.overhead;
        let core = &mut self.cores[cpu.idx()];
        invariant!(
            core.switching.is_some_and(|s| s.entity == e && s.phase == SwitchPhase::Begin),
            "cpu {}: unexpected begin dispatch of {e}",
            cpu.0
        );
        core.busy_until = now + overhead;
        let handle = events.post(now + overhead, EventKind::EndDispatch { cpu, entity: e });
        core.switching = Some(Switch {
            entity: e,
            phase: SwitchPhase::End,
            handle,
        });
    }

    /// The end-dispatch event fired: `e` is now the running entity.
    pub fn on_end_dispatch_finished(&mut self, cpu: CpuId, e: Entity, now: Tick) {
        let core = &mut self.cores[cpu.idx()];
        invariant!(
            core.switching.is_some_and(|s| s.entity == e && s.phase == SwitchPhase::End),
            "cpu {}: unexpected end dispatch of {e}",
            cpu.0
        );
        core.switching = None;
        core.running = Some(e);
        core.running_since = now;
        debug!(cpu = cpu.0, entity = %e, "running");
    }

    /// Move `e` from `from`'s queue to `to`'s and start switching `to` to it.
    /// A duplicate insertion on `to` is retried once after extracting the
    /// stale entry; a second failure is fatal.
    pub fn on_migration_finished(
        &mut self,
        e: Entity,
        from: CpuId,
        to: CpuId,
        now: Tick,
        deadline: Tick,
        events: &mut EventQueue,
    ) -> Result<(), SimError> {
        self.remove_from_queue(from, e)?;
        match self.insert_task(e, to, now, deadline) {
            Ok(()) => {}
            Err(SimError::DuplicateTask(_)) => {
                debug!(entity = %e, cpu = to.0, "migration raced, retrying");
                self.remove_from_queue(to, e)?;
                let retry = self.insert_task(e, to, now, deadline);
                invariant!(
                    retry.is_ok(),
                    "migration of {e} to cpu {} failed twice: {retry:?}",
                    to.0
                );
            }
            Err(err) => return Err(err),
        }
        debug!(entity = %e, from = from.0, to = to.0, "migrated");
        self.make_running(e, to, now, events);
        Ok(())
    }

    pub fn set_round_timer(&mut self, cpu: CpuId, handle: EventHandle) {
        self.cores[cpu.idx()].round_evt = Some(handle);
    }

    pub fn clear_round_timer(&mut self, cpu: CpuId) {
        self.cores[cpu.idx()].round_evt = None;
    }

    /// Record the utilization a stopped server keeps charging to `cpu`.
    pub fn save_u_active(&mut self, cpu: CpuId, server: ServerId, vtime: f64, util: f64) {
        self.forget_u_active(server);
        debug!(cpu = cpu.0, server = server.0, vtime, util, "save U_active");
        self.u_active.push(ActiveUtil {
            cpu,
            server,
            vtime,
            util,
        });
    }

    /// Drop the record of `server`. Returns whether there was one.
    pub fn forget_u_active(&mut self, server: ServerId) -> bool {
        let before = self.u_active.len();
        self.u_active.retain(|r| r.server != server);
        let dropped = self.u_active.len() != before;
        if dropped {
            debug!(server = server.0, "forget U_active");
        }
        dropped
    }

    /// Sum of the live active-utilization records of `cpu`.
    pub fn utilization_active(&self, cpu: CpuId) -> f64 {
        self.u_active
            .iter()
            .filter(|r| r.cpu == cpu)
            .map(|r| r.util)
            .sum()
    }

    pub fn u_active_records(&self) -> &[ActiveUtil] {
        &self.u_active
    }
}
