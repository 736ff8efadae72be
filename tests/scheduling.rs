use rtsim::*;

mod common;
use common::{approx, completion_times};

/// Periodic task alone on a flat CPU: every instance completes and energy
/// is charged for the whole run.
#[test]
fn test_periodic_task() {
    common::setup_test();
    let scenario = Scenario::builder()
        .task(TaskDef::periodic("p", 10, 3))
        .duration(35)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let t = sim.task_id("p").unwrap();
    sim.run().unwrap();

    assert_eq!(completion_times(sim.trace(), t), vec![3, 13, 23, 33]);
    assert_eq!(sim.system().task(t).stats.completed, 4);
    assert_eq!(sim.trace().total_runtime(t), 12);
    assert_eq!(sim.energy().busy_time(CpuId(0)), 12);
    assert!(approx(sim.energy().total_energy(), 35.0));

    let report = sim.report();
    assert_eq!(report.total_misses(), 0);
    assert_eq!(report.tasks[0].response.max(), 3);
    assert_eq!(report.tasks[0].p95, 3);
}

/// EDF runs the earlier deadline first and preempts on arrival.
#[test]
fn test_edf_preemption() {
    common::setup_test();
    let scenario = Scenario::builder()
        .task(TaskDef::one_shot("late", 0, 4, 50))
        .task(TaskDef::one_shot("urgent", 1, 2, 5))
        .duration(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run().unwrap();
    let late = sim.task_id("late").unwrap();
    let urgent = sim.task_id("urgent").unwrap();

    assert_eq!(completion_times(sim.trace(), urgent), vec![3]);
    assert_eq!(completion_times(sim.trace(), late), vec![6]);
    assert_eq!(sim.trace().schedule_count(late), 2);
    assert!(sim
        .trace()
        .events()
        .iter()
        .any(|e| e.time == 1 && e.kind == TraceKind::TaskPreempted { task: late }));
}

#[test]
fn test_fixed_priority() {
    common::setup_test();
    let scenario = Scenario::builder()
        .task(TaskDef::one_shot("lo", 0, 4, 50).with_params(SchedParams::priority(5)))
        .task(TaskDef::one_shot("hi", 1, 2, 50).with_params(SchedParams::priority(1)))
        .policy(DispatchPolicy {
            core_policy: SchedPolicy::FixedPriority,
            ..DispatchPolicy::default()
        })
        .duration(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run().unwrap();

    assert_eq!(completion_times(sim.trace(), TaskId(1)), vec![3]);
    assert_eq!(completion_times(sim.trace(), TaskId(0)), vec![6]);
}

/// Two equal tasks alternate in slices of two ticks.
#[test]
fn test_round_robin_slices() {
    common::setup_test();
    let scenario = Scenario::builder()
        .task(TaskDef::one_shot("a", 0, 3, 100))
        .task(TaskDef::one_shot("b", 0, 3, 100))
        .policy(DispatchPolicy {
            core_policy: SchedPolicy::RoundRobin { default_slice: 2 },
            ..DispatchPolicy::default()
        })
        .duration(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    sim.run().unwrap();

    assert_eq!(completion_times(sim.trace(), TaskId(0)), vec![5]);
    assert_eq!(completion_times(sim.trace(), TaskId(1)), vec![6]);
    assert_eq!(sim.trace().schedule_count(TaskId(0)), 2);
    assert_eq!(sim.trace().schedule_count(TaskId(1)), 2);
}

/// An arrival while the previous instance is still running waits for it.
#[test]
fn test_buffered_arrival() {
    common::setup_test();
    let scenario = Scenario::builder()
        .task(TaskDef::explicit("burst", vec![0, 2], 3, 10))
        .duration(20)
        .build();
    let mut sim = Simulator::new(scenario).unwrap();
    let t = sim.task_id("burst").unwrap();
    sim.run().unwrap();

    assert!(sim
        .trace()
        .events()
        .iter()
        .any(|e| e.time == 2 && e.kind == TraceKind::TaskBuffered { task: t }));
    assert_eq!(completion_times(sim.trace(), t), vec![3, 6]);
    assert_eq!(sim.trace().cpus_used(t), vec![CpuId(0)]);
}

fn late_task(kill_on_miss: bool) -> Simulator {
    let scenario = Scenario::builder()
        .task(TaskDef::one_shot("t", 0, 10, 10))
        .policy(DispatchPolicy {
            context_switch_overhead: 3,
            kill_on_miss,
            ..DispatchPolicy::default()
        })
        .duration(30)
        .build();
    Simulator::new(scenario).unwrap()
}

/// The context switch pushes the task past its deadline.
#[test]
fn test_deadline_miss_slips() {
    common::setup_test();
    let mut sim = late_task(false);
    sim.run().unwrap();
    let t = TaskId(0);

    assert_eq!(completion_times(sim.trace(), t), vec![13]);
    assert_eq!(sim.trace().misses(t), 1);
    assert_eq!(sim.system().task(t).stats.missed, 1);
    assert_eq!(sim.system().task(t).stats.killed, 0);
}

#[test]
fn test_kill_on_miss() {
    common::setup_test();
    let mut sim = late_task(true);
    sim.run().unwrap();
    let t = TaskId(0);

    assert!(completion_times(sim.trace(), t).is_empty());
    let at_ten: Vec<&TraceKind> = sim
        .trace()
        .events()
        .iter()
        .filter(|e| e.time == 10)
        .map(|e| &e.kind)
        .collect();
    assert!(at_ten.contains(&&TraceKind::DeadlineMiss { task: t }));
    assert!(at_ten.contains(&&TraceKind::TaskKilled { task: t }));
    let stats = &sim.system().task(t).stats;
    assert_eq!(stats.missed, 1);
    assert_eq!(stats.killed, 1);
    assert_eq!(sim.report().total_misses(), 1);
}

/// Two identical runs produce identical traces.
#[test]
fn test_determinism() {
    common::setup_test();
    let run = || {
        let scenario = Scenario::builder()
            .platform(Platform::big_little(2, 2))
            .tasks(rtsim::taskgen::random_taskset(3, 8, 1.5, &[100, 200, 400]))
            .duration(2000)
            .build();
        let mut sim = Simulator::new(scenario).unwrap();
        sim.run().unwrap();
        (sim.trace().events().to_vec(), sim.energy().total_energy())
    };
    let (a, ea) = run();
    let (b, eb) = run();
    assert_eq!(a, b);
    assert_eq!(ea, eb);
}
