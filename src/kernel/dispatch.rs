//! Energy-aware placement of newly arrived entities.

use tracing::{debug, trace};

use super::{EnergyMrtKernel, Placement, SimCtx};
use crate::error::SimError;
use crate::system::System;
use crate::trace::TraceKind;
use crate::types::{CpuId, Entity, IslandId, Tick, Workload};

/// Power deltas closer than this are a tie.
const POWER_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub(super) struct Candidate {
    pub placement: Placement,
    /// Island power increase caused by the placement.
    pub delta: f64,
    /// The core already has something queued or running.
    pub busy: bool,
    pub freq_mhz: u32,
}

impl EnergyMrtKernel {
    /// Place every entity of the arrival batch.
    pub(crate) fn dispatch(&mut self, sys: &mut System, ctx: &mut SimCtx) -> Result<(), SimError> {
        let batch = std::mem::take(&mut self.arrivals);
        debug!(entities = batch.len(), "dispatch");
        for e in batch {
            // Killed, or re-queued on its old core, since it arrived.
            if !sys.is_active(e) || self.mcs.find_core(e).is_some() {
                continue;
            }
            match self.find_placement(sys, e, ctx.now()) {
                Some(c) => {
                    debug!(
                        entity = %e,
                        cpu = c.placement.cpu.0,
                        opp = c.placement.opp,
                        delta = c.delta,
                        "placed"
                    );
                    self.place(sys, ctx, e, c.placement)?;
                }
                None => self.discard(sys, ctx, e)?,
            }
        }
        Ok(())
    }

    /// Cheapest admissible (core, OPP) pair for `e`, or `None` when no
    /// core can take it.
    pub(super) fn find_placement(&self, sys: &System, e: Entity, now: Tick) -> Option<Candidate> {
        let w = sys.workload(e);
        let mut best: Option<Candidate> = None;
        for cpu in sys.cpus.iter() {
            if cpu.disabled || self.policy.is_reserved(cpu.id.0) {
                continue;
            }
            let island = sys.island(cpu.island);
            let cur = island.opp_index();
            let base = self.island_power(sys, cpu.island, cur, Some(e));
            for opp in cur..island.opps.len() {
                let speed = island.speed_at(opp, &w);
                if speed <= 0.0 {
                    continue;
                }
                let util = sys.candidate_util(e, speed, now);
                let existing = self.core_util(sys, cpu.id, opp, Some(e));
                if !self.mcs.queue(cpu.id).is_admissible(existing, util) {
                    trace!(entity = %e, cpu = cpu.id.0, opp, existing, util, "inadmissible");
                    continue;
                }
                let with = self.island_power(sys, cpu.island, opp, Some(e))
                    + util * island.power_at(opp, &w);
                let cand = Candidate {
                    placement: Placement { cpu: cpu.id, opp },
                    delta: with - base,
                    busy: !self.mcs.is_free(cpu.id),
                    freq_mhz: island.opps[opp].freq_mhz,
                };
                trace!(entity = %e, cpu = cpu.id.0, opp, delta = cand.delta, "candidate");
                if self.beats(&cand, best.as_ref()) {
                    best = Some(cand);
                }
            }
        }
        best
    }

    fn beats(&self, cand: &Candidate, best: Option<&Candidate>) -> bool {
        let Some(b) = best else {
            return true;
        };
        if cand.delta < b.delta - POWER_EPSILON {
            return true;
        }
        if cand.delta > b.delta + POWER_EPSILON {
            return false;
        }
        if self.policy.prefer_idle_on_tie && cand.busy != b.busy {
            return !cand.busy;
        }
        (cand.freq_mhz, cand.placement.cpu) < (b.freq_mhz, b.placement.cpu)
    }

    /// Utilization queued on `cpu` (plus its active utilization) if its
    /// island ran at `opp`, leaving `exclude` out.
    pub(super) fn core_util(
        &self,
        sys: &System,
        cpu: CpuId,
        opp: usize,
        exclude: Option<Entity>,
    ) -> f64 {
        let island = sys.island_of(cpu);
        let queued: f64 = self
            .mcs
            .queue(cpu)
            .iter()
            .filter(|x| Some(*x) != exclude)
            .map(|x| sys.placed_util(x, island.speed_at(opp, &sys.workload(x))))
            .sum();
        queued + self.mcs.utilization_active(cpu)
    }

    /// Power the island would draw at `opp` for everything placed on it,
    /// leaving `exclude` out.
    pub(super) fn island_power(
        &self,
        sys: &System,
        island: IslandId,
        opp: usize,
        exclude: Option<Entity>,
    ) -> f64 {
        let isl = sys.island(island);
        let default = Workload::default();
        isl.cpus
            .iter()
            .map(|&cpu| {
                let queued: f64 = self
                    .mcs
                    .queue(cpu)
                    .iter()
                    .filter(|x| Some(*x) != exclude)
                    .map(|x| {
                        let w = sys.workload(x);
                        sys.placed_util(x, isl.speed_at(opp, &w)) * isl.power_at(opp, &w)
                    })
                    .sum();
                queued + self.mcs.utilization_active(cpu) * isl.power_at(opp, &default)
            })
            .sum()
    }

    /// Commit a placement: raise the island, resize a server, queue the
    /// entity and let the core pick.
    fn place(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        e: Entity,
        p: Placement,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        self.dispatching.insert(e, p);
        let island = sys.cpu(p.cpu).island;
        self.raise_island(sys, ctx, island, p.opp);
        self.fit_server_budget(sys, ctx, e, p.cpu)?;
        let d = sys.deadline(e);
        self.mcs.insert_task(e, p.cpu, now, d)?;
        ctx.trace.record(
            now,
            Some(p.cpu),
            TraceKind::Dispatched {
                entity: e,
                opp: p.opp,
                freq_mhz: sys.island(island).freq_mhz(),
            },
        );
        self.reschedule_core(sys, ctx, p.cpu)
    }

    /// Size a server's budget to its enveloped work at the speed of `cpu`.
    pub(super) fn fit_server_budget(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        e: Entity,
        cpu: CpuId,
    ) -> Result<(), SimError> {
        let Entity::Server(s) = e else {
            return Ok(());
        };
        let now = ctx.now();
        let speed = sys.speed(cpu, &sys.workload(e));
        let srv = sys.server(s);
        let wcet = srv.get_wcet(speed, now, &sys.tasks);
        if wcet == 0 || wcet == Tick::MAX {
            return Ok(());
        }
        let q = wcet.min(srv.period());
        sys.server_mut(s).change_budget(q, now, &mut ctx.events)
    }

    /// Move `island` up to `opp` if it runs lower. Executing tasks on the
    /// island are re-timed at their new speed.
    pub(super) fn raise_island(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        island: IslandId,
        opp: usize,
    ) {
        if opp <= sys.island(island).opp_index() {
            return;
        }
        self.set_opp(sys, ctx, island, opp);
    }

    pub(super) fn set_opp(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        island: IslandId,
        opp: usize,
    ) {
        let now = ctx.now();
        sys.set_island_opp(island, opp);
        ctx.trace.record(
            now,
            None,
            TraceKind::OppChanged {
                island,
                opp,
                freq_mhz: sys.island(island).freq_mhz(),
            },
        );
        let cpus = sys.island(island).cpus.clone();
        for cpu in cpus {
            let Some(t) = self
                .mcs
                .running(cpu)
                .and_then(|e| Self::executing_task(sys, e))
            else {
                continue;
            };
            let speed = sys.speed(cpu, &sys.task(t).workload);
            sys.task_mut(t).rebase(now, speed, &mut ctx.events);
        }
    }
}
