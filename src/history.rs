//! Per-entity history log.
//!
//! An append-only record of what happened to each entity, kept for
//! inspection and tests. Control flow never reads it.

use std::collections::BTreeMap;

use crate::types::{CpuId, Entity, Tick, Workload};

#[derive(Debug, Clone, PartialEq)]
pub enum HistoryKind {
    Schedule { cpu: CpuId, freq_mhz: u32 },
    Deschedule { cpu: CpuId },
    WorkloadChange { cpu: CpuId, workload: Workload },
    /// A hard CBS server ran out of budget.
    Suspend { cpu: CpuId },
    End { cpu: Option<CpuId> },
    Migrate { from: CpuId, to: CpuId, temporary: bool },
    Kill,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HistoryRecord {
    pub time: Tick,
    pub kind: HistoryKind,
}

#[derive(Debug, Clone, Default)]
pub struct MigrationLog {
    records: BTreeMap<Entity, Vec<HistoryRecord>>,
}

impl MigrationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, entity: Entity, time: Tick, kind: HistoryKind) {
        self.records
            .entry(entity)
            .or_default()
            .push(HistoryRecord { time, kind });
    }

    pub fn of(&self, entity: Entity) -> &[HistoryRecord] {
        self.records.get(&entity).map_or(&[], |v| v.as_slice())
    }

    pub fn last(&self, entity: Entity) -> Option<&HistoryRecord> {
        self.of(entity).last()
    }

    pub fn migrations(&self, entity: Entity) -> usize {
        self.of(entity)
            .iter()
            .filter(|r| matches!(r.kind, HistoryKind::Migrate { .. }))
            .count()
    }

    /// Every record of every entity, in entity order.
    pub fn iter(&self) -> impl Iterator<Item = (Entity, &HistoryRecord)> + '_ {
        self.records
            .iter()
            .flat_map(|(e, v)| v.iter().map(move |r| (*e, r)))
    }
}
