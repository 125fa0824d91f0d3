//! Operational endpoints exposed by the agent.

pub mod health;
