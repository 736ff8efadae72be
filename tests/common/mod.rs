#![allow(dead_code)]

use rtsim::*;

/// Initialize tracing from `RUST_LOG`.
///
/// `try_init()` is idempotent: first call in the process succeeds,
/// subsequent calls are silently ignored. The simulated clock is
/// thread-local, so tests need no lock.
pub fn setup_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .event_format(SimFormat)
        .with_test_writer()
        .try_init();
}

/// Times at which instances of `task` completed.
pub fn completion_times(trace: &Trace, task: TaskId) -> Vec<Tick> {
    trace
        .events()
        .iter()
        .filter_map(|e| match e.kind {
            TraceKind::TaskCompleted { task: t, .. } if t == task => Some(e.time),
            _ => None,
        })
        .collect()
}

/// Status changes of `server`, with repeated statuses collapsed.
pub fn server_statuses(trace: &Trace, server: ServerId) -> Vec<(Tick, ServerStatus)> {
    let mut out: Vec<(Tick, ServerStatus)> = Vec::new();
    for e in trace.events() {
        if let TraceKind::Server { server: s, status } = e.kind {
            if s == server && out.last().map(|(_, st)| *st) != Some(status) {
                out.push((e.time, status));
            }
        }
    }
    out
}

/// Migrations of `entity` as (time, from, to, temporary).
pub fn migrations(trace: &Trace, entity: Entity) -> Vec<(Tick, CpuId, CpuId, bool)> {
    trace
        .events()
        .iter()
        .filter_map(|e| match e.kind {
            TraceKind::Migrated {
                entity: x,
                from,
                to,
                temporary,
            } if x == entity => Some((e.time, from, to, temporary)),
            _ => None,
        })
        .collect()
}

/// First placement of `entity` as (cpu, freq_mhz).
pub fn first_dispatch(trace: &Trace, entity: Entity) -> Option<(CpuId, u32)> {
    trace.events().iter().find_map(|e| match e.kind {
        TraceKind::Dispatched {
            entity: x,
            freq_mhz,
            ..
        } if x == entity => e.cpu.map(|c| (c, freq_mhz)),
        _ => None,
    })
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}
