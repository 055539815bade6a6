//! Shared types for the Smasher workspace: errors, data model, progress math,
//! the per-requester task registry and the daemon control protocol.

pub mod errors;
pub mod ipc_protocol;
pub mod models;
pub mod progress;
pub mod task_registry;
