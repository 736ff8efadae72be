//! Random periodic task sets.
//!
//! [`uunifast`] splits a total utilization into `n` shares drawn uniformly
//! from the simplex (Bini & Buttazzo). [`random_taskset`] turns the shares
//! into periodic [`TaskDef`]s. Everything is driven by a seeded
//! [`SmallRng`], so a seed always yields the same set.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::task::TaskDef;
use crate::types::Tick;

/// `n` utilizations summing to `total`.
pub fn uunifast(rng: &mut SmallRng, n: usize, total: f64) -> Vec<f64> {
    let mut shares = Vec::with_capacity(n);
    let mut sum = total;
    for i in 1..n {
        let next = sum * rng.gen::<f64>().powf(1.0 / (n - i) as f64);
        shares.push(sum - next);
        sum = next;
    }
    if n > 0 {
        shares.push(sum);
    }
    shares
}

/// `n` periodic tasks with total utilization `total` at speed 1.0. Periods
/// are drawn from `periods`; WCETs are rounded down and never below one
/// tick, so the realised utilization can only drift by rounding.
pub fn random_taskset(seed: u64, n: usize, total: f64, periods: &[Tick]) -> Vec<TaskDef> {
    assert!(!periods.is_empty(), "need at least one period to draw from");
    let mut rng = SmallRng::seed_from_u64(seed);
    uunifast(&mut rng, n, total)
        .into_iter()
        .enumerate()
        .map(|(i, u)| {
            let period = periods[rng.gen_range(0..periods.len())];
            let wcet = ((u * period as f64).floor() as Tick).clamp(1, period);
            TaskDef::periodic(&format!("t{i}"), period, wcet)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shares_sum_to_total() {
        let mut rng = SmallRng::seed_from_u64(7);
        let u = uunifast(&mut rng, 8, 2.5);
        assert_eq!(u.len(), 8);
        assert!(u.iter().all(|x| *x >= 0.0));
        assert!((u.iter().sum::<f64>() - 2.5).abs() < 1e-9);
        assert!(uunifast(&mut rng, 0, 1.0).is_empty());
    }

    #[test]
    fn same_seed_same_set() {
        let a = random_taskset(42, 5, 1.2, &[100, 200, 400]);
        let b = random_taskset(42, 5, 1.2, &[100, 200, 400]);
        let key = |s: &[TaskDef]| s.iter().map(|t| (t.wcet, t.activation.clone())).collect::<Vec<_>>();
        assert_eq!(key(&a), key(&b));
        assert!(a.iter().all(|t| t.wcet >= 1));
    }
}
