//! freshd keeps a declared set of containers running the image currently
//! published under their tag, replacing and rolling back one container at a
//! time.

pub mod config;
pub mod error;
pub mod executor;
pub mod inspector;
pub mod notify;
pub mod orchestrator;
pub mod planner;
pub mod registry;
pub mod runtime;
pub mod types;
