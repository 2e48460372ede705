//! AI Delegate: renders nested agent and tool calls live to every attached
//! target, one job at a time.

pub mod agent;
pub mod bus;
pub mod channels;
pub mod config;
pub mod error;
pub mod llm;
pub mod markup;
pub mod node;
pub mod queue;
pub mod render;
pub mod server;
pub mod tools;
pub mod worker;
