//! A3S CRI Test Core - Foundational Types
//!
//! Types shared by the CRI conformance harness: the error taxonomy,
//! harness configuration, resource name tokens, container log parsing
//! and exec/streaming session types.

pub mod config;
pub mod error;
pub mod exec;
pub mod id;
pub mod log;
pub mod stream;

// Re-export commonly used types
pub use config::{CriTestConfig, LogLevel};
pub use error::{CriTestError, Result};
pub use exec::{ExecSession, ExecSyncOutput, SessionKind};
pub use id::IdGenerator;
pub use log::{LogRecord, StreamType};

/// Harness version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
