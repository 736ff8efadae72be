//! Work pulling onto freed cores.
//!
//! A core that runs dry first takes back entities it lent out through
//! temporary migrations, then (if the trigger is enabled) pulls the most
//! urgent waiting entity of another core that passes the admission test on
//! this core. Islands whose cores all went quiet drop to their lowest OPP.

use tracing::{debug, info};

use super::{EnergyMrtKernel, FreeTrigger, SimCtx, TempMigration};
use crate::error::SimError;
use crate::history::HistoryKind;
use crate::system::System;
use crate::trace::TraceKind;
use crate::types::{CpuId, Entity, Tick};

impl EnergyMrtKernel {
    /// `cpu` has nothing queued, running or switching any more.
    pub(crate) fn on_core_freed(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
        trigger: FreeTrigger,
    ) -> Result<(), SimError> {
        if !self.mcs.is_free(cpu) {
            return Ok(());
        }
        if self.return_temporary(sys, ctx, cpu)? {
            return Ok(());
        }
        let enabled = self.policy.migrate_enabled
            && match trigger {
                FreeTrigger::End => self.policy.migrate_after_end,
                FreeTrigger::VirtualTime => self.policy.migrate_after_vtime,
            };
        if enabled && self.pull(sys, ctx, cpu, trigger)? {
            return Ok(());
        }
        self.maybe_reset_island(sys, ctx, cpu);
        Ok(())
    }

    /// Bring back one entity that `cpu` lent out. An entity that no longer
    /// fits on its origin stays where it is for good. Returns whether one
    /// came back.
    fn return_temporary(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
    ) -> Result<bool, SimError> {
        let lent: Vec<Entity> = self
            .temp_migrations
            .iter()
            .filter(|(_, m)| m.origin == cpu)
            .map(|(e, _)| *e)
            .collect();
        for e in lent {
            self.temp_migrations.remove(&e);
            let Some(from) = self.mcs.find_core(e) else {
                continue;
            };
            let switching_in = self.mcs.switching(from).is_some_and(|(x, _)| x == e);
            if from == cpu || switching_in {
                continue;
            }
            match self.advanced_check(sys, e, cpu, ctx.now()) {
                Some(opp) => {
                    debug!(entity = %e, from = from.0, to = cpu.0, "temporary migration returns");
                    self.migrate(sys, ctx, e, from, cpu, opp, false)?;
                    return Ok(true);
                }
                None => {
                    debug!(entity = %e, cpu = from.0, "temporary migration made permanent");
                }
            }
        }
        Ok(false)
    }

    /// Pull the most urgent waiting entity of another core onto `cpu`.
    fn pull(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        cpu: CpuId,
        trigger: FreeTrigger,
    ) -> Result<bool, SimError> {
        if sys.cpu(cpu).disabled || self.policy.is_reserved(cpu.0) {
            return Ok(false);
        }
        let mut waiting: Vec<(Tick, Entity, CpuId)> = Vec::new();
        for o in 0..self.mcs.nr_cpus() {
            let other = CpuId(o as u32);
            if other == cpu {
                continue;
            }
            // Running or being switched in: not waiting.
            let current = self.mcs.current(other);
            for e in self.mcs.queue(other).iter() {
                if Some(e) == current || !sys.should_schedule(e) {
                    continue;
                }
                waiting.push((sys.deadline(e), e, other));
            }
        }
        waiting.sort();
        let now = ctx.now();
        for (_, e, from) in waiting {
            let Some(opp) = self.advanced_check(sys, e, cpu, now) else {
                continue;
            };
            let temporary = match trigger {
                FreeTrigger::End => self.policy.temporary_migration_end,
                FreeTrigger::VirtualTime => self.policy.temporary_migration_vtime,
            } && self.mcs.current(from).is_some();
            self.migrate(sys, ctx, e, from, cpu, opp, temporary)?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Lowest OPP of `cpu`'s island, from the current one upward, at which
    /// `cpu` admits `e` next to what it already holds.
    pub(super) fn advanced_check(
        &self,
        sys: &System,
        e: Entity,
        cpu: CpuId,
        now: Tick,
    ) -> Option<usize> {
        let c = sys.cpu(cpu);
        if c.disabled || self.policy.is_reserved(cpu.0) {
            return None;
        }
        let island = sys.island(c.island);
        let w = sys.workload(e);
        (island.opp_index()..island.opps.len()).find(|&opp| {
            let speed = island.speed_at(opp, &w);
            speed > 0.0
                && self.mcs.queue(cpu).is_admissible(
                    self.core_util(sys, cpu, opp, Some(e)),
                    sys.candidate_util(e, speed, now),
                )
        })
    }

    /// Move waiting (or preempted) `e` from `from` to the free core `to`.
    #[allow(clippy::too_many_arguments)]
    fn migrate(
        &mut self,
        sys: &mut System,
        ctx: &mut SimCtx,
        e: Entity,
        from: CpuId,
        to: CpuId,
        opp: usize,
        temporary: bool,
    ) -> Result<(), SimError> {
        let now = ctx.now();
        if self.mcs.current(from) == Some(e) {
            self.preempt(sys, ctx, from);
        }
        let island = sys.cpu(to).island;
        self.raise_island(sys, ctx, island, opp);
        self.fit_server_budget(sys, ctx, e, to)?;
        let d = sys.deadline(e);
        self.mcs
            .on_migration_finished(e, from, to, now, d, &mut ctx.events)?;
        if temporary {
            self.temp_migrations
                .insert(e, TempMigration { origin: from, dest: to });
        } else {
            self.temp_migrations.remove(&e);
        }
        ctx.trace.record(
            now,
            Some(to),
            TraceKind::Migrated {
                entity: e,
                from,
                to,
                temporary,
            },
        );
        ctx.history
            .record(e, now, HistoryKind::Migrate { from, to, temporary });
        info!(entity = %e, from = from.0, to = to.0, temporary, "migration");
        self.reschedule_core(sys, ctx, from)?;
        self.on_core_freed(sys, ctx, from, FreeTrigger::End)
    }

    /// Drop the island of `cpu` to its lowest OPP once none of its cores
    /// holds or charges anything.
    pub(super) fn maybe_reset_island(&mut self, sys: &mut System, ctx: &mut SimCtx, cpu: CpuId) {
        if !self.policy.reset_opp_on_idle {
            return;
        }
        let island = sys.cpu(cpu).island;
        let isl = sys.island(island);
        if isl.opp_index() == 0 {
            return;
        }
        let quiet = isl.cpus.iter().all(|&c| {
            self.mcs.is_free(c)
                && self.mcs.utilization_active(c) <= 0.0
                && !self.dispatching.values().any(|p| p.cpu == c)
        });
        if quiet {
            self.set_opp(sys, ctx, island, 0);
        }
    }
}
