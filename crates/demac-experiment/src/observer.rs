//! Round observer actor for receiving RoundComplete from the coordinator.
//!
//! Bridges the coordinator's actor-based round reporting with the harness by
//! forwarding every round summary to an mpsc channel.

use acton_reactive::prelude::*;
use tokio::sync::mpsc;

use demac_kernel::{RoundComplete, RoundSummary};

/// State for the round observer actor.
#[derive(Default, Clone)]
pub struct RoundObserverState {
    /// Channel sender for forwarding round summaries
    pub tx: Option<mpsc::Sender<RoundSummary>>,
}

impl std::fmt::Debug for RoundObserverState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoundObserverState")
            .field("has_tx", &self.tx.is_some())
            .finish()
    }
}

/// Actor that receives RoundComplete messages and forwards them to a channel.
///
/// Register it with `Session::observe_rounds`; the harness drains the
/// receiving end after the run.
pub struct RoundObserver {
    tx: mpsc::Sender<RoundSummary>,
}

impl RoundObserver {
    pub fn new(tx: mpsc::Sender<RoundSummary>) -> Self {
        Self { tx }
    }

    /// Spawn the actor in the runtime.
    pub async fn spawn(self, runtime: &mut ActorRuntime) -> ActorHandle {
        let mut actor =
            runtime.new_actor_with_name::<RoundObserverState>("RoundObserver".to_string());

        actor.model.tx = Some(self.tx);

        actor.act_on::<RoundComplete>(|actor, context| {
            let summary = context.message().summary.clone();
            let tx = actor.model.tx.clone();

            Reply::pending(async move {
                if let Some(tx) = tx {
                    // Receiver may already be gone at shutdown
                    let _ = tx.send(summary).await;
                }
            })
        });

        actor.start().await
    }
}
