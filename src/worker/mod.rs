//! Worker: connects the job queue to the agent runtime and the renderers.
//!
//! `handler`: the [`JobHandler`](crate::queue::JobHandler) that runs a
//! job's root agent while rendering its tree to the job's channel and to
//! every observer.

pub mod handler;

pub use handler::RenderJobHandler;
