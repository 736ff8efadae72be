//! Discrete-event queue and simulated clock.
//!
//! Events are ordered by `(time, priority, sequence)`. The priority is fixed
//! per event kind so that simultaneous events always resolve in the same
//! order (an instance ending at `t` is processed before the deadline check at
//! `t`, and every arrival at `t` is queued before the batch dispatch at `t`).
//!
//! [`EventQueue::post`] hands back an [`EventHandle`]. Cancelling the handle
//! guarantees the event never fires; a state transition that supersedes a
//! pending event must cancel it before posting its replacement.

use std::cell::Cell;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};

use tracing::trace;

use crate::types::{CpuId, Entity, ServerId, TaskId, Tick};

thread_local! {
    static SIM_CLOCK: Cell<Tick> = const { Cell::new(0) };
    static SIM_CPU: Cell<Option<CpuId>> = const { Cell::new(None) };
}

/// Simulated time of the event being processed on this thread.
///
/// Read by the log formatter; outside a simulation it is the time of the
/// last processed event (or 0).
pub fn sim_clock() -> Tick {
    SIM_CLOCK.with(|c| c.get())
}

/// CPU the event being processed belongs to, if any.
pub fn sim_cpu() -> Option<CpuId> {
    SIM_CPU.with(|c| c.get())
}

pub(crate) fn set_sim_context(now: Tick, cpu: Option<CpuId>) {
    SIM_CLOCK.with(|c| c.set(now));
    SIM_CPU.with(|c| c.set(cpu));
}

/// What happens when an event fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// The current instance of a task has executed all its work.
    TaskEnd { task: TaskId },
    /// A CBS server ran out of capacity.
    BudgetExhausted { server: ServerId },
    /// A CBS server's budget is refilled.
    Replenish { server: ServerId },
    /// A releasing CBS server reached its virtual time.
    ServerIdle { server: ServerId },
    /// A context switch completes; the entity becomes the running one.
    EndDispatch { cpu: CpuId, entity: Entity },
    /// A round-robin entity consumed its slice.
    RoundExpired { cpu: CpuId, entity: Entity },
    /// A new instance of a task is released.
    TaskArrival { task: TaskId },
    /// Absolute deadline of instance `instance` of a task.
    DeadlineCheck { task: TaskId, instance: u64 },
    /// A context switch towards the entity starts.
    BeginDispatch { cpu: CpuId, entity: Entity },
    /// Place every entity that arrived at this instant.
    KernelDispatch,
}

impl EventKind {
    /// Tiebreak among events at the same instant (lower fires first).
    pub fn priority(&self) -> u8 {
        match self {
            EventKind::TaskEnd { .. } => 0,
            EventKind::BudgetExhausted { .. } => 1,
            EventKind::Replenish { .. } => 2,
            EventKind::ServerIdle { .. } => 3,
            EventKind::EndDispatch { .. } => 4,
            EventKind::RoundExpired { .. } => 5,
            EventKind::TaskArrival { .. } => 6,
            EventKind::DeadlineCheck { .. } => 7,
            EventKind::BeginDispatch { .. } => 8,
            EventKind::KernelDispatch => 9,
        }
    }

    /// CPU the event is bound to, for log context.
    pub fn cpu(&self) -> Option<CpuId> {
        match self {
            EventKind::EndDispatch { cpu, .. }
            | EventKind::RoundExpired { cpu, .. }
            | EventKind::BeginDispatch { cpu, .. } => Some(*cpu),
            _ => None,
        }
    }
}

/// A pending event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub time: Tick,
    pub priority: u8,
    /// Posting order; also the identity behind [`EventHandle`].
    pub seq: u64,
    pub kind: EventKind,
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.time
            .cmp(&other.time)
            .then_with(|| self.priority.cmp(&other.priority))
            .then_with(|| self.seq.cmp(&other.seq))
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Cancellation token for a posted event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EventHandle(u64);

/// The simulation event queue and clock.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Reverse<Event>>,
    /// Sequence numbers of events that were posted and neither fired nor
    /// cancelled.
    live: HashSet<u64>,
    seq: u64,
    now: Tick,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current simulated time.
    pub fn now(&self) -> Tick {
        self.now
    }

    /// Post `kind` to fire at `time`.
    ///
    /// # Panics
    /// Panics if `time` lies in the past.
    pub fn post(&mut self, time: Tick, kind: EventKind) -> EventHandle {
        assert!(
            time >= self.now,
            "cannot post {kind:?} at {time}, clock is already at {}",
            self.now
        );
        let seq = self.seq;
        self.seq += 1;
        self.live.insert(seq);
        self.heap.push(Reverse(Event {
            time,
            priority: kind.priority(),
            seq,
            kind,
        }));
        trace!(at = time, seq, ?kind, "post");
        EventHandle(seq)
    }

    /// Drop a pending event. Cancelling an event that already fired (or was
    /// already cancelled) is a no-op.
    pub fn cancel(&mut self, handle: EventHandle) {
        if self.live.remove(&handle.0) {
            trace!(seq = handle.0, "drop");
        }
    }

    /// Cancel the event behind `slot`, if any, leaving the slot empty.
    pub fn cancel_slot(&mut self, slot: &mut Option<EventHandle>) {
        if let Some(h) = slot.take() {
            self.cancel(h);
        }
    }

    /// Whether the event has neither fired nor been cancelled.
    pub fn is_pending(&self, handle: EventHandle) -> bool {
        self.live.contains(&handle.0)
    }

    /// Time of the next live event.
    pub fn peek_time(&mut self) -> Option<Tick> {
        self.skip_dead();
        self.heap.peek().map(|Reverse(e)| e.time)
    }

    /// Remove the next live event and advance the clock to it.
    pub fn pop(&mut self) -> Option<Event> {
        self.skip_dead();
        let Reverse(event) = self.heap.pop()?;
        self.live.remove(&event.seq);
        self.now = event.time;
        Some(event)
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Advance the clock without firing anything (used when a run stops at a
    /// horizon that lies between two events).
    pub fn advance_to(&mut self, time: Tick) {
        if time > self.now {
            self.now = time;
        }
    }

    fn skip_dead(&mut self) {
        while let Some(Reverse(e)) = self.heap.peek() {
            if self.live.contains(&e.seq) {
                break;
            }
            self.heap.pop();
        }
    }
}
