//! Sample shared environments for the coordinator.

mod meteor;
mod trivial;

use std::path::Path;
use std::str::FromStr;

use anyhow::{Context, Result, anyhow};
use serde::de::DeserializeOwned;

use demac_kernel::{AgentId, EnvironmentAdapter};

pub use meteor::{MeteorConfig, MeteorEnv};
pub use trivial::{TrivialConfig, TrivialEnv};

/// Which sample environment to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvKind {
    Trivial,
    Meteor,
}

impl EnvKind {
    pub fn all() -> Vec<Self> {
        vec![Self::Trivial, Self::Meteor]
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Trivial => "trivial",
            Self::Meteor => "meteor",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Trivial => "constant observations, episodes end at random",
            Self::Meteor => "dodge meteors falling onto a shared bottom row",
        }
    }

    /// Build the environment for `num_agents` agents.
    ///
    /// `config` is an optional JSON file holding this environment's settings;
    /// missing fields keep their defaults.
    pub fn build(
        &self,
        num_agents: usize,
        seed: u64,
        config: Option<&Path>,
    ) -> Result<Box<dyn EnvironmentAdapter>> {
        Ok(match self {
            Self::Trivial => {
                let config: TrivialConfig = load_config(config)?;
                Box::new(TrivialEnv::new(config, num_agents, seed))
            }
            Self::Meteor => {
                let config: MeteorConfig = load_config(config)?;
                Box::new(MeteorEnv::new(config, num_agents, seed)?)
            }
        })
    }
}

impl FromStr for EnvKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::all()
            .into_iter()
            .find(|kind| kind.name() == s.to_lowercase())
            .ok_or_else(|| anyhow!("unknown environment: {s}"))
    }
}

impl std::fmt::Display for EnvKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Agent ids "0".."n-1", the naming every sample environment uses.
pub fn agent_names(num_agents: usize) -> Vec<AgentId> {
    (0..num_agents).map(AgentId::from).collect()
}

fn load_config<T: DeserializeOwned + Default>(path: Option<&Path>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading environment config {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("parsing environment config {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_names_round_trip() {
        for kind in EnvKind::all() {
            assert_eq!(kind.name().parse::<EnvKind>().unwrap(), kind);
        }
        assert!("gridnav".parse::<EnvKind>().is_err());
    }

    #[test]
    fn test_built_env_declares_its_agents() {
        let env = EnvKind::Meteor.build(3, 0, None).unwrap();
        assert_eq!(env.agent_ids(), Some(agent_names(3)));
    }

    #[test]
    fn test_config_file_overrides_defaults() {
        let path = std::env::temp_dir().join("demac-meteor-config-test.json");
        std::fs::write(&path, r#"{ "grid_size": 4 }"#).unwrap();

        let env = EnvKind::Meteor.build(2, 0, Some(&path)).unwrap();
        let obs = env.observation_space(&AgentId::from("0"));
        assert_eq!(
            obs,
            Some(demac_kernel::Space::Box {
                low: 0.0,
                high: 4.0,
                shape: vec![2 * 4 + 4],
            })
        );

        let _ = std::fs::remove_file(&path);
    }
}
