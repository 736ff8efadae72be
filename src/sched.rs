//! Ready-queue abstraction shared by per-core schedulers and CBS servers.
//!
//! A [`Scheduler`] keeps an at-most-once membership of entities. An entity
//! must be *added* (which creates its [`TaskModel`]) before it can be
//! *inserted* into the ready ordering; extracting it leaves the model in
//! place so it can be re-inserted later.
//!
//! The ordering is a `BTreeSet` keyed by [`QueueKey`], the same way the vtime
//! DSQs order their entries by `(vtime, insertion_order)`.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::types::{Entity, Tick, UTIL_EPSILON};

/// Ordering policy of a scheduler.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SchedPolicy {
    /// Insertion order.
    Fifo,
    /// Earliest absolute deadline first.
    #[default]
    Edf,
    /// Lower static priority value first.
    FixedPriority,
    /// FIFO with a per-entity time slice.
    RoundRobin { default_slice: Tick },
}

/// Per-entity scheduling parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedParams {
    /// Static priority (fixed-priority policy only, lower runs first).
    #[serde(default)]
    pub priority: u32,
    /// Round-robin slice; the policy default when absent.
    #[serde(default)]
    pub slice: Option<Tick>,
}

impl SchedParams {
    pub fn priority(priority: u32) -> Self {
        SchedParams {
            priority,
            slice: None,
        }
    }

    pub fn slice(slice: Tick) -> Self {
        SchedParams {
            priority: 0,
            slice: Some(slice),
        }
    }
}

/// Position of an entity in the ready ordering.
///
/// Field order is comparison order: policy value, insertion time, insertion
/// sequence, then the entity itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct QueueKey {
    primary: u64,
    inserted_at: Tick,
    seq: u64,
    entity: Entity,
}

/// Scheduler-internal wrapper of one entity.
#[derive(Debug, Clone)]
pub struct TaskModel {
    pub params: SchedParams,
    key: Option<QueueKey>,
    /// Execution charged against the current round-robin slice.
    round_used: Tick,
}

impl TaskModel {
    fn new(params: SchedParams) -> Self {
        TaskModel {
            params,
            key: None,
            round_used: 0,
        }
    }

    /// Whether the entity sits in the ready ordering.
    pub fn is_active(&self) -> bool {
        self.key.is_some()
    }

    pub fn inserted_at(&self) -> Option<Tick> {
        self.key.map(|k| k.inserted_at)
    }
}

/// An ordered, at-most-once collection of entities.
#[derive(Debug, Clone)]
pub struct Scheduler {
    policy: SchedPolicy,
    models: BTreeMap<Entity, TaskModel>,
    queue: BTreeSet<QueueKey>,
    seq: u64,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new(SchedPolicy::default())
    }
}

impl Scheduler {
    pub fn new(policy: SchedPolicy) -> Self {
        Scheduler {
            policy,
            models: BTreeMap::new(),
            queue: BTreeSet::new(),
            seq: 0,
        }
    }

    pub fn edf() -> Self {
        Self::new(SchedPolicy::Edf)
    }

    pub fn fifo() -> Self {
        Self::new(SchedPolicy::Fifo)
    }

    pub fn policy(&self) -> SchedPolicy {
        self.policy
    }

    /// Create the entity's model.
    pub fn add_task(&mut self, entity: Entity, params: SchedParams) -> Result<(), SimError> {
        if self.models.contains_key(&entity) {
            return Err(SimError::DuplicateTask(entity));
        }
        self.models.insert(entity, TaskModel::new(params));
        Ok(())
    }

    /// Destroy the entity's model, extracting it first if enqueued.
    pub fn remove_task(&mut self, entity: Entity) -> Result<(), SimError> {
        let model = self
            .models
            .remove(&entity)
            .ok_or(SimError::UnknownTask(entity))?;
        if let Some(key) = model.key {
            self.queue.remove(&key);
        }
        Ok(())
    }

    pub fn contains(&self, entity: Entity) -> bool {
        self.models.contains_key(&entity)
    }

    pub fn model(&self, entity: Entity) -> Option<&TaskModel> {
        self.models.get(&entity)
    }

    /// Move an added entity into the ready ordering, stamping `now` as its
    /// insertion time. `deadline` is the ordering value under EDF and is
    /// ignored by the other policies.
    pub fn insert(&mut self, entity: Entity, now: Tick, deadline: Tick) -> Result<(), SimError> {
        let seq = self.seq;
        let policy = self.policy;
        let model = self
            .models
            .get_mut(&entity)
            .ok_or(SimError::UnknownTask(entity))?;
        if model.key.is_some() {
            return Err(SimError::DuplicateTask(entity));
        }
        let key = match policy {
            SchedPolicy::Edf => QueueKey {
                primary: deadline,
                inserted_at: now,
                seq: 0,
                entity,
            },
            SchedPolicy::FixedPriority => QueueKey {
                primary: model.params.priority as u64,
                inserted_at: now,
                seq: 0,
                entity,
            },
            SchedPolicy::Fifo | SchedPolicy::RoundRobin { .. } => QueueKey {
                primary: 0,
                inserted_at: now,
                seq,
                entity,
            },
        };
        model.key = Some(key);
        model.round_used = 0;
        self.seq += 1;
        self.queue.insert(key);
        Ok(())
    }

    /// Remove an entity from the ready ordering, keeping its model. Returns
    /// whether it was enqueued.
    pub fn extract(&mut self, entity: Entity) -> Result<bool, SimError> {
        let model = self
            .models
            .get_mut(&entity)
            .ok_or(SimError::UnknownTask(entity))?;
        match model.key.take() {
            Some(key) => {
                self.queue.remove(&key);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn is_enqueued(&self, entity: Entity) -> bool {
        self.models.get(&entity).is_some_and(|m| m.is_active())
    }

    pub fn get_first(&self) -> Option<Entity> {
        self.queue.first().map(|k| k.entity)
    }

    pub fn get_task_n(&self, n: usize) -> Option<Entity> {
        self.queue.iter().nth(n).map(|k| k.entity)
    }

    /// Enqueued entities in priority order.
    pub fn iter(&self) -> impl Iterator<Item = Entity> + '_ {
        self.queue.iter().map(|k| k.entity)
    }

    pub fn ordered(&self) -> Vec<Entity> {
        self.iter().collect()
    }

    /// Number of enqueued entities.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Admission test for placing a candidate next to `existing` utilization.
    /// Always true except under EDF, which admits while the total stays
    /// within 1.0.
    pub fn is_admissible(&self, existing: f64, candidate: f64) -> bool {
        match self.policy {
            SchedPolicy::Edf => {
                existing <= 1.0 + UTIL_EPSILON && existing + candidate <= 1.0 + UTIL_EPSILON
            }
            _ => true,
        }
    }

    /// Round-robin slice of the entity, if the policy has slices.
    pub fn slice(&self, entity: Entity) -> Option<Tick> {
        match self.policy {
            SchedPolicy::RoundRobin { default_slice } => Some(
                self.models
                    .get(&entity)
                    .and_then(|m| m.params.slice)
                    .unwrap_or(default_slice),
            ),
            _ => None,
        }
    }

    /// Account `ran` ticks of execution against the entity's slice.
    pub fn charge(&mut self, entity: Entity, ran: Tick) {
        if let Some(m) = self.models.get_mut(&entity) {
            m.round_used += ran;
        }
    }

    /// Slice left in the current round.
    pub fn round_remaining(&self, entity: Entity) -> Option<Tick> {
        let slice = self.slice(entity)?;
        let used = self.models.get(&entity).map_or(0, |m| m.round_used);
        Some(slice.saturating_sub(used))
    }

    /// Whether the entity used up its slice since its last (re)insertion.
    pub fn is_round_expired(&self, entity: Entity) -> bool {
        self.round_remaining(entity) == Some(0)
    }

    /// Put the entity at the back of its priority bucket with a fresh
    /// insertion time and a fresh round.
    pub fn requeue(&mut self, entity: Entity, now: Tick, deadline: Tick) -> Result<(), SimError> {
        self.extract(entity)?;
        self.insert(entity, now, deadline)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ServerId, TaskId};

    fn t(n: u32) -> Entity {
        Entity::Task(TaskId(n))
    }

    #[test]
    fn edf_total_order() {
        let mut s = Scheduler::edf();
        for n in 0..4 {
            s.add_task(t(n), SchedParams::default()).unwrap();
        }
        s.insert(t(0), 5, 100).unwrap();
        s.insert(t(1), 6, 200).unwrap();
        // Same deadline and insertion time: lower id first.
        s.insert(t(3), 7, 200).unwrap();
        s.insert(t(2), 7, 200).unwrap();
        assert_eq!(s.ordered(), vec![t(0), t(1), t(2), t(3)]);
        assert_eq!(s.get_first(), Some(t(0)));
        assert_eq!(s.get_task_n(2), Some(t(2)));
        assert_eq!(s.get_task_n(4), None);
    }

    #[test]
    fn membership_errors() {
        let mut s = Scheduler::edf();
        assert_eq!(s.insert(t(1), 0, 10), Err(SimError::UnknownTask(t(1))));
        s.add_task(t(1), SchedParams::default()).unwrap();
        assert_eq!(
            s.add_task(t(1), SchedParams::default()),
            Err(SimError::DuplicateTask(t(1)))
        );
        s.insert(t(1), 0, 10).unwrap();
        assert_eq!(s.insert(t(1), 0, 10), Err(SimError::DuplicateTask(t(1))));
        assert_eq!(s.extract(t(1)), Ok(true));
        assert_eq!(s.extract(t(1)), Ok(false));
        assert!(s.contains(t(1)));
        s.remove_task(t(1)).unwrap();
        assert_eq!(s.remove_task(t(1)), Err(SimError::UnknownTask(t(1))));
    }

    #[test]
    fn remove_drops_queued_entry() {
        let mut s = Scheduler::fifo();
        s.add_task(t(0), SchedParams::default()).unwrap();
        s.insert(t(0), 0, 0).unwrap();
        s.remove_task(t(0)).unwrap();
        assert!(s.is_empty());
    }

    #[test]
    fn fifo_keeps_insertion_order() {
        let mut s = Scheduler::fifo();
        let srv = Entity::Server(ServerId(0));
        for e in [t(5), srv, t(1)] {
            s.add_task(e, SchedParams::default()).unwrap();
            s.insert(e, 3, 0).unwrap();
        }
        assert_eq!(s.ordered(), vec![t(5), srv, t(1)]);
    }

    #[test]
    fn fixed_priority_orders_by_value() {
        let mut s = Scheduler::new(SchedPolicy::FixedPriority);
        s.add_task(t(0), SchedParams::priority(5)).unwrap();
        s.add_task(t(1), SchedParams::priority(1)).unwrap();
        s.insert(t(0), 0, 0).unwrap();
        s.insert(t(1), 4, 0).unwrap();
        assert_eq!(s.ordered(), vec![t(1), t(0)]);
    }

    #[test]
    fn edf_admission() {
        let s = Scheduler::edf();
        assert!(s.is_admissible(0.5, 0.5));
        assert!(!s.is_admissible(0.5, 0.51));
        assert!(!s.is_admissible(1.1, 0.0));
        assert!(Scheduler::fifo().is_admissible(3.0, 3.0));
    }

    #[test]
    fn round_robin_rounds() {
        let mut s = Scheduler::new(SchedPolicy::RoundRobin { default_slice: 10 });
        s.add_task(t(0), SchedParams::default()).unwrap();
        s.add_task(t(1), SchedParams::slice(4)).unwrap();
        s.insert(t(0), 0, 0).unwrap();
        s.insert(t(1), 0, 0).unwrap();
        assert_eq!(s.round_remaining(t(1)), Some(4));

        s.charge(t(0), 6);
        assert!(!s.is_round_expired(t(0)));
        s.charge(t(0), 4);
        assert!(s.is_round_expired(t(0)));

        s.requeue(t(0), 10, 0).unwrap();
        assert_eq!(s.ordered(), vec![t(1), t(0)]);
        assert_eq!(s.round_remaining(t(0)), Some(10));
        assert_eq!(s.model(t(0)).and_then(|m| m.inserted_at()), Some(10));
        assert_eq!(Scheduler::edf().slice(t(0)), None);
    }
}
