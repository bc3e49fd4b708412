//! DEMAC Kernel: barrier-synchronized coordination of many agents over one
//! shared environment.
//!
//! Each agent submits one request at a time. The coordinator buffers them
//! until every registered agent has contributed, resolves the round's kind
//! (a single reset forces the whole round to reset), calls the environment
//! once, and routes each agent's slice of the batched response back to it.

pub mod actors;
pub mod agent;
pub mod channel;
pub mod config;
pub mod environment;
pub mod error;
pub mod messages;
pub mod session;
pub mod wire;
pub mod wrapper;

pub use agent::{
    ActionValue, AgentId, BatchKind, Info, Observation, Request, RequestKind, Response,
};
pub use channel::AgentChannel;
pub use config::CoordinatorConfig;
pub use environment::{EnvironmentAdapter, Space};
pub use error::CoordinatorError;
pub use messages::{Phase, RoundComplete, RoundOutcome, RoundSummary, SessionSnapshot};
pub use session::Session;
pub use wire::{AgentMessage, WireError};
pub use wrapper::{AgentEnvWrapper, EpisodeStats, Transition};
