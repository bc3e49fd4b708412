//! Sample environments and a random-policy harness for the DEMAC coordinator.
//!
//! Each run spawns one coordinator session over a shared environment and one
//! tokio task per agent. Agents only see their own `AgentEnvWrapper`; the
//! coordinator turns their independent step/reset calls into synchronized
//! batch rounds.

pub mod envs;
pub mod experiment;
pub mod observer;
pub mod results;
