//! Core engine: the agent tick loop and the order lifecycle.
//!
//! `scheduler` owns one timer task per agent; each tick goes through
//! `tick` (snapshot, strategy, risk), then `executor`, which drives
//! `lifecycle` against the ledger.

pub mod executor;
pub mod lifecycle;
pub mod scheduler;
pub mod tick;

pub use executor::{ExecutionReport, IntentExecutor};
pub use lifecycle::OrderLifecycleManager;
pub use scheduler::AgentScheduler;
pub use tick::{TickConfig, TickReport, TickRunner};
