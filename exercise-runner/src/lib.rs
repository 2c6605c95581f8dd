//! Exercise runner - drives a red/blue exercise over the cyber range brokers.
//!
//! # Architecture
//!
//! ```text
//!   Coordinator ──command──▶ team broker ──▶ agent client
//!        ▲                                      │
//!        │                              TaskExecutor
//!        │                                      │
//!        └──────────response──── team broker ◀──┘
//! ```
//!
//! The [`coordinator::Coordinator`] owns the brokers, the agents and the
//! simulation state. It walks a fixed phase table, dispatching commands to
//! the agents a phase calls for, and folds their responses into the attack
//! and defense timelines. Agents answer commands by running a
//! [`executor::TaskExecutor`]; the executor is the only pluggable seam.

pub mod agent;
pub mod coordinator;
pub mod executor;
pub mod narrative;
pub mod settings;

pub use agent::{AgentRole, ExerciseAgent, Team};
pub use coordinator::{Coordinator, SimulationPhase, StatusSnapshot};
pub use executor::{TaskExecutor, TaskOutcome};
pub use settings::RunnerConfig;
