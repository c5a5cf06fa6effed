//! # sandpit-core
//!
//! Per-session container sandboxes for an online code playground.
//!
//! This crate provides the lifecycle and execution machinery:
//! - one Docker container per session, created lazily and reused
//! - code injection as single-archive uploads
//! - runs under a caller-side deadline that kills the process tree
//! - a per-session lock so runs never overlap inside one sandbox
//! - splitting output into an HTML document block and plain text
//! - an idle reaper reclaiming sandboxes past their TTL

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod injector;
pub mod locks;
pub mod manager;
pub mod protocol;
pub mod reaper;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod separator;
pub mod session;
pub mod testing;

pub use config::{ManagerConfig, SandboxConfig};
pub use error::{ErrorKind, SandpitError};
pub use manager::SandboxManager;
pub use reaper::IdleReaper;
pub use result::{ExecutionOutput, LintReport, RunOutput};
pub use session::SessionKey;

/// Crate-level result type
pub type Result<T> = std::result::Result<T, SandpitError>;
