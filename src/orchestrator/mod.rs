//! Task orchestration: the workflow loop and the policies it applies.

pub mod control;
pub mod gate;
pub mod policy;
pub mod runner;

pub use control::{ControlHandle, ControlReceiver, ControlSignal};
pub use gate::GateDecision;
pub use runner::{Delivery, Orchestrator, RunOutcome};
