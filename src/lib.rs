//! taskwarden: process supervisor with service-managed lifecycle.
//!
//! taskwarden wraps a child command (or an in-process callback), registers a
//! Task Execution with a remote Task Management service, supervises the run
//! with heartbeats, retries, and timeouts, resolves secrets into the
//! environment first, and reports exactly one terminal outcome.

pub mod api;
pub mod config;
pub mod error;
pub mod logtail;
pub mod process;
pub mod resolve;
pub mod runtime;
pub mod status;
pub mod supervisor;
pub mod task;

pub use config::{ApiSettings, Config, IoSettings, LogSettings, ProcessSettings, ShellMode, UpdateSettings};
pub use error::{Error, Result};
pub use supervisor::{RunOutcome, Supervisor};
pub use task::{ExecutionStatus, StatusCounters, TaskExecution, TaskIdentity};

// Re-export resolution types for embedding callers
pub use resolve::format::ValueFormat;
pub use resolve::merge::MergeStrategy;
pub use resolve::providers::{FetchedData, MemorySource, SecretSource, SourceRegistry};
pub use resolve::{ConfigResolver, ResolvedConfig, ResolverSettings};

// Re-export the status surface used by wrapped applications
pub use status::{StatusSnapshot, StatusTracker};
