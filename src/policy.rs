//! Kernel dispatch policy.
//!
//! All feature switches of the energy-aware kernel live in one immutable
//! [`DispatchPolicy`], validated once when the kernel is built. Dependent
//! switches (e.g. migrating after an end requires migration to be enabled)
//! are rejected rather than silently fixed up.

use serde::{Deserialize, Serialize};

use crate::error::SimError;
use crate::sched::SchedPolicy;
use crate::types::Tick;

/// Feature switches of the kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchPolicy {
    /// Ordering of every per-core ready queue.
    pub core_policy: SchedPolicy,
    /// Master switch for pulling waiting entities onto freed cores.
    pub migrate_enabled: bool,
    /// Pull when a core frees up because an instance ended.
    pub migrate_after_end: bool,
    /// Pull when a core frees up because a CBS server's virtual time elapsed.
    pub migrate_after_vtime: bool,
    /// Migrations triggered by an end return to their origin core once it
    /// frees up.
    pub temporary_migration_end: bool,
    /// Same as `temporary_migration_end` for virtual-time triggers.
    pub temporary_migration_vtime: bool,
    /// A CBS server out of enveloped work leaves its core's queue instead of
    /// staying queued until its virtual time elapses.
    pub cbs_yield: bool,
    /// Abort an instance at its deadline instead of letting it slip.
    pub kill_on_miss: bool,
    /// Duration of every context switch.
    pub context_switch_overhead: Tick,
    /// Among placements of equal power cost, prefer a core with nothing
    /// running.
    pub prefer_idle_on_tie: bool,
    /// Drop an island back to its lowest OPP once all its cores are idle.
    pub reset_opp_on_idle: bool,
    /// CPUs that never receive placements or migrations.
    pub reserved_cpus: Vec<u32>,
}

impl Default for DispatchPolicy {
    fn default() -> Self {
        DispatchPolicy {
            core_policy: SchedPolicy::Edf,
            migrate_enabled: true,
            migrate_after_end: true,
            migrate_after_vtime: true,
            temporary_migration_end: false,
            temporary_migration_vtime: false,
            cbs_yield: true,
            kill_on_miss: false,
            context_switch_overhead: 0,
            prefer_idle_on_tie: true,
            reset_opp_on_idle: true,
            reserved_cpus: Vec::new(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    match std::env::var(name).ok().as_deref() {
        Some("1") | Some("true") => Some(true),
        Some("0") | Some("false") => Some(false),
        _ => None,
    }
}

impl DispatchPolicy {
    /// A policy that never migrates.
    pub fn no_migration() -> Self {
        let mut p = Self::default();
        p.disable_migration();
        p
    }

    /// Turn off the master switch along with every switch that depends on it.
    pub fn disable_migration(&mut self) {
        self.migrate_enabled = false;
        self.migrate_after_end = false;
        self.migrate_after_vtime = false;
        self.temporary_migration_end = false;
        self.temporary_migration_vtime = false;
    }

    /// Defaults overridden by `RTSIM_*` environment variables.
    ///
    /// - `RTSIM_MIGRATE=0|1` sets the migration master switch; turning it off
    ///   also turns off both triggers.
    /// - `RTSIM_MIGRATE_AFTER_END`, `RTSIM_MIGRATE_AFTER_VTIME`,
    ///   `RTSIM_TEMP_MIGRATION_END`, `RTSIM_TEMP_MIGRATION_VTIME`,
    ///   `RTSIM_CBS_YIELD`, `RTSIM_KILL_ON_MISS`, `RTSIM_RESET_OPP` take
    ///   `0|1`.
    /// - `RTSIM_CSW_OVERHEAD` is the context switch length in ticks.
    pub fn from_env() -> Self {
        Self::default().with_env_overrides()
    }

    /// Apply the `RTSIM_*` overrides of [`DispatchPolicy::from_env`].
    pub fn with_env_overrides(mut self) -> Self {
        match env_flag("RTSIM_MIGRATE") {
            Some(true) => self.migrate_enabled = true,
            Some(false) => self.disable_migration(),
            None => {}
        }
        let flags: [(&str, &mut bool); 7] = [
            ("RTSIM_MIGRATE_AFTER_END", &mut self.migrate_after_end),
            ("RTSIM_MIGRATE_AFTER_VTIME", &mut self.migrate_after_vtime),
            ("RTSIM_TEMP_MIGRATION_END", &mut self.temporary_migration_end),
            ("RTSIM_TEMP_MIGRATION_VTIME", &mut self.temporary_migration_vtime),
            ("RTSIM_CBS_YIELD", &mut self.cbs_yield),
            ("RTSIM_KILL_ON_MISS", &mut self.kill_on_miss),
            ("RTSIM_RESET_OPP", &mut self.reset_opp_on_idle),
        ];
        for (name, slot) in flags {
            if let Some(v) = env_flag(name) {
                *slot = v;
            }
        }
        if let Some(v) = std::env::var("RTSIM_CSW_OVERHEAD")
            .ok()
            .and_then(|s| s.parse::<Tick>().ok())
        {
            self.context_switch_overhead = v;
        }
        self
    }

    /// Check the dependencies between switches.
    pub fn validate(&self) -> Result<(), SimError> {
        if (self.migrate_after_end || self.migrate_after_vtime) && !self.migrate_enabled {
            return Err(SimError::InvalidPolicy(
                "a migration trigger is set but migration is disabled".into(),
            ));
        }
        if self.temporary_migration_end && !self.migrate_after_end {
            return Err(SimError::InvalidPolicy(
                "temporary migration after end requires migrate_after_end".into(),
            ));
        }
        if self.temporary_migration_vtime && !self.migrate_after_vtime {
            return Err(SimError::InvalidPolicy(
                "temporary migration after virtual time requires migrate_after_vtime".into(),
            ));
        }
        if let SchedPolicy::RoundRobin { default_slice: 0 } = self.core_policy {
            return Err(SimError::InvalidPolicy(
                "round-robin slice must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn is_reserved(&self, cpu: u32) -> bool {
        self.reserved_cpus.contains(&cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        DispatchPolicy::default().validate().unwrap();
        DispatchPolicy::no_migration().validate().unwrap();
    }

    #[test]
    fn dependent_switches_are_checked() {
        let p = DispatchPolicy {
            migrate_enabled: false,
            ..DispatchPolicy::default()
        };
        assert!(matches!(p.validate(), Err(SimError::InvalidPolicy(_))));

        let p = DispatchPolicy {
            migrate_after_end: false,
            temporary_migration_end: true,
            ..DispatchPolicy::default()
        };
        assert!(p.validate().is_err());

        let p = DispatchPolicy {
            core_policy: SchedPolicy::RoundRobin { default_slice: 0 },
            ..DispatchPolicy::default()
        };
        assert!(p.validate().is_err());
    }

    #[test]
    fn disabling_migration_clears_triggers() {
        let mut p = DispatchPolicy {
            temporary_migration_end: true,
            temporary_migration_vtime: true,
            kill_on_miss: true,
            ..DispatchPolicy::default()
        };
        p.disable_migration();
        p.validate().unwrap();
        assert!(!p.migrate_enabled && !p.migrate_after_end && !p.migrate_after_vtime);
        assert!(!p.temporary_migration_end && !p.temporary_migration_vtime);
        assert!(p.kill_on_miss);
        assert!(!DispatchPolicy::no_migration().migrate_enabled);
    }

    #[test]
    fn env_overrides_keep_other_fields() {
        std::env::set_var("RTSIM_MIGRATE", "0");
        std::env::set_var("RTSIM_CSW_OVERHEAD", "7");
        let p = DispatchPolicy {
            kill_on_miss: true,
            reserved_cpus: vec![2],
            ..DispatchPolicy::default()
        }
        .with_env_overrides();
        std::env::remove_var("RTSIM_MIGRATE");
        std::env::remove_var("RTSIM_CSW_OVERHEAD");

        assert!(!p.migrate_enabled);
        assert!(!p.migrate_after_end);
        assert_eq!(p.context_switch_overhead, 7);
        assert!(p.kill_on_miss);
        assert!(p.is_reserved(2));
        p.validate().unwrap();
    }

    #[test]
    fn deserializes_partial_json() {
        let p: DispatchPolicy =
            serde_json::from_str(r#"{"kill_on_miss": true, "reserved_cpus": [3]}"#).unwrap();
        assert!(p.kill_on_miss);
        assert!(p.migrate_enabled);
        assert!(p.is_reserved(3));
        assert!(!p.is_reserved(0));
    }
}
