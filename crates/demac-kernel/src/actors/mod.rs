//! Acton-reactive actors for the coordination kernel.
//!
//! ```text
//! Session::register → RegisterAgent → Coordinator
//! AgentChannel::send → SubmitRequest (ReplySlot) → Coordinator
//!   ├─ BarrierDeadline ← deadline task (when a timeout is configured)
//!   ├─ EnvironmentAdapter::batch_apply once the barrier is full
//!   ├─ ReplySlot::send per agent (demultiplexed response or round error)
//!   └─ RoundComplete → round observer
//! ```

mod coordinator;

pub use coordinator::Coordinator;
