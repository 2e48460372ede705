//! Tool abstraction for agent capabilities.

pub mod builtin;
pub mod registry;
pub mod tool;

pub use builtin::register_builtin_tools;
pub use registry::ToolRegistry;
pub use tool::*;
