//! The arena owning every long-lived simulation object.
//!
//! Tasks, servers, CPUs and islands live in plain vectors indexed by their
//! ids. Nothing else owns any of them; cross references are ids.

use std::collections::BTreeMap;

use tracing::debug;

use crate::cbs::{CbServer, ServerDef};
use crate::cpu::{Cpu, Island};
use crate::error::SimError;
use crate::platform::Platform;
use crate::sched::SchedParams;
use crate::task::{Task, TaskDef};
use crate::types::{CpuId, Entity, IslandId, ServerId, TaskId, Tick, Workload};

/// Owning arena of a simulation.
#[derive(Debug)]
pub struct System {
    pub tasks: Vec<Task>,
    pub servers: Vec<CbServer>,
    pub cpus: Vec<Cpu>,
    pub islands: Vec<Island>,
    server_names: BTreeMap<String, ServerId>,
}

impl System {
    /// Instantiate the CPUs and islands of `platform`, every island at its
    /// lowest operating point.
    pub fn new(platform: &Platform) -> Result<Self, SimError> {
        let mut cpus = Vec::new();
        let mut islands = Vec::new();
        for (i, def) in platform.islands.iter().enumerate() {
            if def.opps.is_empty() {
                return Err(SimError::InvalidScenario(format!(
                    "island {} has no operating points",
                    def.name
                )));
            }
            if !def.opps.windows(2).all(|w| w[0].freq_mhz < w[1].freq_mhz) {
                return Err(SimError::InvalidScenario(format!(
                    "island {}: operating points must be sorted by ascending frequency",
                    def.name
                )));
            }
            let id = IslandId(i as u32);
            let mut island = Island::new(id, &def.name, def.kind, def.opps.clone(), def.model.build());
            for _ in 0..def.cpus {
                let cpu = Cpu::new(CpuId(cpus.len() as u32), id, 0);
                island.cpus.push(cpu.id);
                cpus.push(cpu);
            }
            islands.push(island);
        }
        if cpus.is_empty() {
            return Err(SimError::InvalidScenario("platform has no CPUs".into()));
        }
        for &c in &platform.disabled_cpus {
            let cpu = cpus
                .get_mut(c as usize)
                .ok_or(SimError::UnknownCpu(CpuId(c)))?;
            cpu.disabled = true;
        }
        Ok(System {
            tasks: Vec::new(),
            servers: Vec::new(),
            cpus,
            islands,
            server_names: BTreeMap::new(),
        })
    }

    pub fn add_server(&mut self, def: &ServerDef) -> Result<ServerId, SimError> {
        if self.server_names.contains_key(&def.name) {
            return Err(SimError::InvalidScenario(format!(
                "duplicate server name {}",
                def.name
            )));
        }
        let id = ServerId(self.servers.len() as u32);
        self.servers.push(CbServer::new(id, def)?);
        self.server_names.insert(def.name.clone(), id);
        debug!(server = id.0, name = %def.name, q = def.budget, p = def.period, "server added");
        Ok(id)
    }

    pub fn add_task(&mut self, def: &TaskDef) -> Result<TaskId, SimError> {
        if def.wcet == 0 {
            return Err(SimError::InvalidScenario(format!(
                "task {} has a zero WCET",
                def.name
            )));
        }
        if def.relative_deadline() == 0 {
            return Err(SimError::InvalidScenario(format!(
                "task {} has a zero deadline",
                def.name
            )));
        }
        let server = match &def.server {
            Some(name) => Some(*self.server_names.get(name).ok_or_else(|| {
                SimError::InvalidScenario(format!("task {} refers to unknown server {name}", def.name))
            })?),
            None => None,
        };
        let id = TaskId(self.tasks.len() as u32);
        self.tasks.push(Task::new(id, def, server));
        if let Some(s) = server {
            self.servers[s.idx()].add_task(id)?;
        }
        debug!(task = id.0, name = %def.name, wcet = def.wcet, "task added");
        Ok(id)
    }

    pub fn server_by_name(&self, name: &str) -> Option<ServerId> {
        self.server_names.get(name).copied()
    }

    pub fn task_by_name(&self, name: &str) -> Option<TaskId> {
        self.tasks.iter().find(|t| t.name == name).map(|t| t.id)
    }

    pub fn task(&self, id: TaskId) -> &Task {
        &self.tasks[id.idx()]
    }

    pub fn task_mut(&mut self, id: TaskId) -> &mut Task {
        &mut self.tasks[id.idx()]
    }

    pub fn server(&self, id: ServerId) -> &CbServer {
        &self.servers[id.idx()]
    }

    pub fn server_mut(&mut self, id: ServerId) -> &mut CbServer {
        &mut self.servers[id.idx()]
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        &self.cpus[id.idx()]
    }

    pub fn island(&self, id: IslandId) -> &Island {
        &self.islands[id.idx()]
    }

    pub fn island_of(&self, cpu: CpuId) -> &Island {
        self.island(self.cpu(cpu).island)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Top-level entities: servers and tasks outside any server.
    pub fn entities(&self) -> Vec<Entity> {
        let tasks = self
            .tasks
            .iter()
            .filter(|t| t.server.is_none())
            .map(|t| Entity::Task(t.id));
        let servers = self.servers.iter().map(|s| Entity::Server(s.id));
        tasks.chain(servers).collect()
    }

    /// Workload an entity runs: its own tag for a task, the tag of the
    /// enveloped task that would run for a server.
    pub fn workload(&self, e: Entity) -> Workload {
        match e {
            Entity::Task(t) => self.task(t).workload.clone(),
            Entity::Server(s) => {
                let srv = self.server(s);
                srv.current_task()
                    .or_else(|| srv.tasks().first().copied())
                    .map(|t| self.task(t).workload.clone())
                    .unwrap_or_default()
            }
        }
    }

    /// Per-core queue parameters of an entity.
    pub fn params(&self, e: Entity) -> SchedParams {
        match e {
            Entity::Task(t) => self.task(t).params,
            Entity::Server(s) => self.server(s).params,
        }
    }

    /// EDF ordering value of an entity.
    pub fn deadline(&self, e: Entity) -> Tick {
        match e {
            Entity::Task(t) => self.task(t).abs_deadline(),
            Entity::Server(s) => self.server(s).deadline(),
        }
    }

    /// Speed of `cpu` at its current OPP for `workload`.
    pub fn speed(&self, cpu: CpuId, workload: &Workload) -> f64 {
        self.island_of(cpu).speed(workload)
    }

    /// Speed of `cpu` at OPP `opp` for `workload`.
    pub fn speed_at(&self, cpu: CpuId, opp: usize, workload: &Workload) -> f64 {
        self.island_of(cpu).speed_at(opp, workload)
    }

    /// Utilization an entity already placed on a core charges at `speed`: the
    /// scaled WCET ratio for a task, the reserved bandwidth for a server.
    pub fn placed_util(&self, e: Entity, speed: f64) -> f64 {
        match e {
            Entity::Task(t) => self.task(t).utilization_at(speed),
            Entity::Server(s) => self.server(s).bandwidth(),
        }
    }

    /// Utilization a candidate would charge at `speed`. A server is sized by
    /// the WCET of its enveloped work at that speed, falling back to its
    /// current bandwidth when none of it is relevant.
    pub fn candidate_util(&self, e: Entity, speed: f64, now: Tick) -> f64 {
        match e {
            Entity::Task(t) => self.task(t).utilization_at(speed),
            Entity::Server(s) => {
                let srv = self.server(s);
                let wcet = srv.get_wcet(speed, now, &self.tasks);
                if wcet == 0 {
                    srv.bandwidth()
                } else if wcet == Tick::MAX {
                    f64::INFINITY
                } else {
                    wcet as f64 / srv.period() as f64
                }
            }
        }
    }

    /// Move an island to OPP `idx`. Returns the previous index.
    pub fn set_island_opp(&mut self, island: IslandId, idx: usize) -> usize {
        let old = self.islands[island.idx()].set_opp(idx, &mut self.cpus);
        if old != idx {
            debug!(
                island = %self.islands[island.idx()].name,
                from = old,
                to = idx,
                mhz = self.islands[island.idx()].freq_mhz(),
                "opp change"
            );
        }
        old
    }

    /// Whether the entity may be made running: a server that yielded (no
    /// enveloped work, or not contending) never is.
    pub fn should_schedule(&self, e: Entity) -> bool {
        match e {
            Entity::Task(t) => self.task(t).is_active(),
            Entity::Server(s) => !self.server(s).has_yielded(),
        }
    }

    /// Whether the entity has a live instance.
    pub fn is_active(&self, e: Entity) -> bool {
        match e {
            Entity::Task(t) => self.task(t).is_active(),
            Entity::Server(s) => self.server(s).is_contending(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::Platform;

    #[test]
    fn builds_big_little_arena() {
        let sys = System::new(&Platform::big_little(2, 3).disable_cpu(4)).unwrap();
        assert_eq!(sys.nr_cpus(), 5);
        assert_eq!(sys.islands.len(), 2);
        assert_eq!(sys.island_of(CpuId(1)).name, "big");
        assert_eq!(sys.island_of(CpuId(2)).name, "little");
        assert!(sys.cpu(CpuId(4)).disabled);
        assert!(sys.cpus.iter().all(|c| c.opp == 0));
    }

    #[test]
    fn unknown_server_is_rejected() {
        let mut sys = System::new(&Platform::uniprocessor()).unwrap();
        let def = TaskDef::periodic("t", 10, 1).in_server("nope");
        assert!(matches!(
            sys.add_task(&def),
            Err(SimError::InvalidScenario(_))
        ));
    }

    #[test]
    fn server_utilization() {
        let mut sys = System::new(&Platform::uniprocessor()).unwrap();
        let s = sys.add_server(&ServerDef::new("s", 2, 10)).unwrap();
        sys.add_task(&TaskDef::periodic("t", 10, 4).in_server("s"))
            .unwrap();
        let e = Entity::Server(s);
        assert!((sys.placed_util(e, 1.0) - 0.2).abs() < 1e-12);
        assert!((sys.candidate_util(e, 1.0, 0) - 0.4).abs() < 1e-12);
        assert!((sys.candidate_util(e, 0.5, 0) - 0.8).abs() < 1e-12);
        assert_eq!(sys.entities(), vec![e]);
    }

    #[test]
    fn island_opp_is_shared() {
        let mut sys = System::new(&Platform::big_little(2, 0)).unwrap();
        sys.set_island_opp(IslandId(0), 18);
        assert!(sys.cpus.iter().all(|c| c.opp == 18));
        let w = Workload::default();
        assert!((sys.speed(CpuId(1), &w) - 1.0).abs() < 1e-12);
    }
}
