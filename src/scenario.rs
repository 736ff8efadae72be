//! Scenario definition, builder API and JSON loader.

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cbs::ServerDef;
use crate::platform::Platform;
use crate::policy::DispatchPolicy;
use crate::task::TaskDef;
use crate::types::Tick;

/// A complete simulation scenario: platform, servers, tasks, kernel
/// policy and duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    pub platform: Platform,
    #[serde(default)]
    pub servers: Vec<ServerDef>,
    pub tasks: Vec<TaskDef>,
    #[serde(default)]
    pub policy: DispatchPolicy,
    pub duration: Tick,
}

/// Builder for constructing scenarios.
pub struct ScenarioBuilder {
    platform: Platform,
    servers: Vec<ServerDef>,
    tasks: Vec<TaskDef>,
    policy: DispatchPolicy,
    duration: Tick,
}

impl Scenario {
    pub fn builder() -> ScenarioBuilder {
        ScenarioBuilder {
            platform: Platform::uniprocessor(),
            servers: Vec::new(),
            tasks: Vec::new(),
            policy: DispatchPolicy::default(),
            duration: 1_000,
        }
    }
}

impl ScenarioBuilder {
    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    /// Add a CBS server. Tasks refer to it by name.
    pub fn server(mut self, def: ServerDef) -> Self {
        self.servers.push(def);
        self
    }

    pub fn task(mut self, def: TaskDef) -> Self {
        self.tasks.push(def);
        self
    }

    pub fn tasks(mut self, defs: impl IntoIterator<Item = TaskDef>) -> Self {
        self.tasks.extend(defs);
        self
    }

    pub fn policy(mut self, policy: DispatchPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the simulation duration in ticks.
    pub fn duration(mut self, ticks: Tick) -> Self {
        self.duration = ticks;
        self
    }

    /// Build the scenario.
    pub fn build(self) -> Scenario {
        assert!(
            !self.tasks.is_empty(),
            "scenario must have at least one task"
        );
        assert!(self.duration > 0, "scenario must last at least one tick");
        Scenario {
            platform: self.platform,
            servers: self.servers,
            tasks: self.tasks,
            policy: self.policy,
            duration: self.duration,
        }
    }
}

/// Parse a scenario from JSON text.
pub fn from_json_str(json: &str) -> Result<Scenario> {
    let scenario: Scenario = serde_json::from_str(json).context("malformed scenario JSON")?;
    if scenario.tasks.is_empty() {
        anyhow::bail!("scenario has no tasks");
    }
    Ok(scenario)
}

/// Load a scenario from a JSON file.
pub fn load_json(path: &Path) -> Result<Scenario> {
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    from_json_str(&json).with_context(|| format!("failed to load {}", path.display()))
}
