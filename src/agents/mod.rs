//! Per-agent lifecycle tracking

mod fsm;
mod registry;

pub use fsm::{AgentRecord, AgentState, FsmError};
pub use registry::{AgentFsm, AgentFsmHandle};
