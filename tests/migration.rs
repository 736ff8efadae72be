use rtsim::*;

mod common;
use common::{completion_times, migrations};

/// t0 and t2 share cpu0, t1 gets cpu1 alone and finishes first.
fn three_tasks(policy: DispatchPolicy) -> Simulator {
    let scenario = Scenario::builder()
        .platform(Platform::flat(2))
        .task(TaskDef::one_shot("t0", 0, 2, 10))
        .task(TaskDef::one_shot("t1", 0, 1, 20))
        .task(TaskDef::one_shot("t2", 0, 8, 40))
        .policy(policy)
        .duration(50)
        .build();
    Simulator::new(scenario).unwrap()
}

#[test]
fn test_initial_placement() {
    common::setup_test();
    let mut sim = three_tasks(DispatchPolicy::default());
    sim.run_until(0).unwrap();
    let k = sim.kernel();
    assert_eq!(k.get_processor_ready(Entity::Task(TaskId(0))), Some(CpuId(0)));
    assert_eq!(k.get_processor_ready(Entity::Task(TaskId(1))), Some(CpuId(1)));
    assert_eq!(k.get_processor_ready(Entity::Task(TaskId(2))), Some(CpuId(0)));
    assert_eq!(k.get_processor(Entity::Task(TaskId(0))), Some(CpuId(0)));
    assert_eq!(k.get_processor(Entity::Task(TaskId(2))), None);
    // Queued behind t0: a plain waiting task, not a switch in flight.
    assert_eq!(k.dispatch_record(Entity::Task(TaskId(2))), None);
    assert_eq!(k.dispatch_record(Entity::Task(TaskId(0))), None);
}

/// While the switch is in flight the placement is on record; once the
/// entity runs, or loses the core to another one, it is not.
#[test]
fn test_dispatch_record_follows_switch() {
    common::setup_test();
    let mut sim = three_tasks(DispatchPolicy {
        context_switch_overhead: 1,
        ..DispatchPolicy::default()
    });
    let t0 = Entity::Task(TaskId(0));
    let t2 = Entity::Task(TaskId(2));

    sim.run_until(0).unwrap();
    assert_eq!(
        sim.kernel().dispatch_record(t0),
        Some(Placement { cpu: CpuId(0), opp: 0 })
    );
    assert_eq!(sim.kernel().dispatch_record(t2), None);

    sim.run_until(1).unwrap();
    assert_eq!(sim.kernel().get_processor(t0), Some(CpuId(0)));
    assert_eq!(sim.kernel().dispatch_record(t0), None);
}

/// The freed core pulls the waiting task for good.
#[test]
fn test_pull_after_end() {
    common::setup_test();
    let mut sim = three_tasks(DispatchPolicy::default());
    sim.run().unwrap();
    let t2 = TaskId(2);

    assert_eq!(
        migrations(sim.trace(), Entity::Task(t2)),
        vec![(1, CpuId(0), CpuId(1), false)]
    );
    assert_eq!(completion_times(sim.trace(), t2), vec![9]);
    assert_eq!(completion_times(sim.trace(), TaskId(0)), vec![2]);
    assert_eq!(sim.history().migrations(Entity::Task(t2)), 1);
    assert_eq!(sim.trace().cpus_used(t2), vec![CpuId(1)]);
    assert_eq!(sim.report().migrations, 1);
}

/// A temporary migration goes back to its origin as soon as it frees up.
#[test]
fn test_temporary_migration_returns() {
    common::setup_test();
    let mut sim = three_tasks(DispatchPolicy {
        temporary_migration_end: true,
        ..DispatchPolicy::default()
    });
    let t2 = Entity::Task(TaskId(2));

    sim.run_until(1).unwrap();
    assert!(sim.kernel().is_task_temporarily_migrated(t2, CpuId(1)));
    assert!(!sim.kernel().is_task_temporarily_migrated(t2, CpuId(0)));

    sim.run().unwrap();
    assert_eq!(
        migrations(sim.trace(), t2),
        vec![(1, CpuId(0), CpuId(1), true), (2, CpuId(1), CpuId(0), false)]
    );
    assert!(!sim.kernel().is_task_temporarily_migrated(t2, CpuId(1)));
    assert_eq!(completion_times(sim.trace(), TaskId(2)), vec![9]);
    assert_eq!(sim.trace().cpus_used(TaskId(2)), vec![CpuId(1), CpuId(0)]);
    assert_eq!(sim.history().migrations(t2), 2);
}

#[test]
fn test_no_migration_keeps_tasks_in_place() {
    common::setup_test();
    let mut sim = three_tasks(DispatchPolicy::no_migration());
    sim.run().unwrap();
    assert!(migrations(sim.trace(), Entity::Task(TaskId(2))).is_empty());
    assert_eq!(completion_times(sim.trace(), TaskId(2)), vec![10]);
    assert_eq!(sim.trace().cpus_used(TaskId(2)), vec![CpuId(0)]);
}

/// cpu1 holds a server whose virtual time runs until 10. With `cbs_yield`
/// off the server stays queued until then, and the waiting task of cpu0 is
/// only pulled once the virtual time elapses.
fn server_then_waiting(policy: DispatchPolicy) -> Simulator {
    let scenario = Scenario::builder()
        .platform(Platform::flat(2))
        .server(ServerDef::new("s", 2, 10))
        .task(TaskDef::one_shot("long", 0, 12, 40))
        .task(TaskDef::one_shot("ts", 0, 2, 10).in_server("s"))
        .task(TaskDef::one_shot("w", 0, 3, 50))
        .policy(DispatchPolicy {
            cbs_yield: false,
            ..policy
        })
        .duration(60)
        .build();
    Simulator::new(scenario).unwrap()
}

#[test]
fn test_pull_when_virtual_time_elapses() {
    common::setup_test();
    let mut sim = server_then_waiting(DispatchPolicy::default());
    let s = sim.server_id("s").unwrap();
    let w = sim.task_id("w").unwrap();

    sim.run_until(9).unwrap();
    assert_eq!(sim.system().server(s).status(), ServerStatus::Releasing);
    assert_eq!(
        sim.kernel().get_processor_ready(Entity::Server(s)),
        Some(CpuId(1))
    );
    assert_eq!(sim.kernel().get_processor_ready(Entity::Task(w)), Some(CpuId(0)));
    assert!(migrations(sim.trace(), Entity::Task(w)).is_empty());

    sim.run().unwrap();
    assert_eq!(
        migrations(sim.trace(), Entity::Task(w)),
        vec![(10, CpuId(0), CpuId(1), false)]
    );
    assert_eq!(completion_times(sim.trace(), sim.task_id("ts").unwrap()), vec![2]);
    assert_eq!(completion_times(sim.trace(), sim.task_id("long").unwrap()), vec![12]);
    assert_eq!(completion_times(sim.trace(), w), vec![13]);
    assert_eq!(sim.trace().cpus_used(w), vec![CpuId(1)]);
}

#[test]
fn test_temporary_vtime_migration_returns() {
    common::setup_test();
    let mut sim = server_then_waiting(DispatchPolicy {
        temporary_migration_vtime: true,
        ..DispatchPolicy::default()
    });
    let w = sim.task_id("w").unwrap();

    sim.run_until(10).unwrap();
    assert!(sim
        .kernel()
        .is_task_temporarily_migrated(Entity::Task(w), CpuId(1)));

    sim.run().unwrap();
    assert_eq!(
        migrations(sim.trace(), Entity::Task(w)),
        vec![(10, CpuId(0), CpuId(1), true), (12, CpuId(1), CpuId(0), false)]
    );
    assert_eq!(completion_times(sim.trace(), w), vec![13]);
    assert_eq!(sim.trace().cpus_used(w), vec![CpuId(1), CpuId(0)]);
}

/// A waiting server moves like a task and keeps charging its new core
/// after it releases.
#[test]
fn test_server_is_pulled() {
    common::setup_test();
    let scenario = Scenario::builder()
        .platform(Platform::flat(2))
        .server(ServerDef::new("s", 2, 50))
        .task(TaskDef::one_shot("long", 0, 12, 40))
        .task(TaskDef::one_shot("short", 0, 1, 20))
        .task(TaskDef::one_shot("ts", 0, 2, 50).in_server("s"))
        .duration(60)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let s = sim.server_id("s").unwrap();
    let ts = sim.task_id("ts").unwrap();

    sim.run_until(0).unwrap();
    assert_eq!(
        sim.kernel().get_processor_ready(Entity::Server(s)),
        Some(CpuId(0))
    );

    sim.run_until(5).unwrap();
    assert_eq!(
        migrations(sim.trace(), Entity::Server(s)),
        vec![(1, CpuId(0), CpuId(1), false)]
    );
    assert_eq!(completion_times(sim.trace(), ts), vec![3]);
    assert_eq!(sim.trace().cpus_used(ts), vec![CpuId(1)]);
    assert_eq!(sim.history().migrations(Entity::Server(s)), 1);
    assert_eq!(sim.system().server(s).status(), ServerStatus::Releasing);
    let u = sim.kernel().utilization_active(sim.system(), CpuId(1));
    assert!((u - 0.04).abs() < 1e-9, "U_active on cpu1 = {u}");
    assert_eq!(sim.kernel().utilization_active(sim.system(), CpuId(0)), 0.0);
}

/// When a temporary migration goes home, the core it leaves empty pulls
/// the next waiting entity.
#[test]
fn test_core_left_by_return_pulls() {
    common::setup_test();
    let scenario = Scenario::builder()
        .platform(Platform::flat(3))
        .task(TaskDef::one_shot("t0", 0, 2, 10))
        // Fills cpu1 until it ends at 1.
        .task(TaskDef::one_shot("t1", 0, 1, 1))
        .task(TaskDef::one_shot("a", 0, 20, 25))
        .task(TaskDef::one_shot("t2", 0, 8, 11))
        .task(TaskDef::one_shot("b", 0, 3, 30))
        .policy(DispatchPolicy {
            temporary_migration_end: true,
            ..DispatchPolicy::default()
        })
        .duration(40)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let t2 = sim.task_id("t2").unwrap();
    let b = sim.task_id("b").unwrap();

    sim.run_until(0).unwrap();
    let k = sim.kernel();
    assert_eq!(k.get_processor_ready(Entity::Task(t2)), Some(CpuId(0)));
    assert_eq!(k.get_processor_ready(Entity::Task(b)), Some(CpuId(2)));

    sim.run().unwrap();
    assert_eq!(
        migrations(sim.trace(), Entity::Task(t2)),
        vec![(1, CpuId(0), CpuId(1), true), (2, CpuId(1), CpuId(0), false)]
    );
    assert_eq!(
        migrations(sim.trace(), Entity::Task(b)),
        vec![(2, CpuId(2), CpuId(1), true)]
    );
    assert_eq!(completion_times(sim.trace(), t2), vec![9]);
    assert_eq!(completion_times(sim.trace(), b), vec![5]);
    assert_eq!(completion_times(sim.trace(), sim.task_id("a").unwrap()), vec![20]);
    assert_eq!(sim.report().total_misses(), 0);
}
