//! A3S CRI Test - conformance harness for Container Runtime Interface runtimes.
//!
//! Drives a CRI v1 runtime over gRPC through a fixed capability interface:
//! - `service` defines the RuntimeService / ImageService capabilities
//! - `remote` implements them over a gRPC channel, `fake` in memory
//! - `framework` orchestrates sandbox and container lifecycles on top
//! - `streaming` bridges exec/attach sessions to local stdio
//! - `tls` builds the client config for `https` streaming URLs
//! - `validate` holds the conformance scenarios and suite runner

pub mod commands;
pub mod cri_api;
pub mod error;
pub mod fake;
pub mod framework;
pub mod remote;
pub mod service;
pub mod streaming;
pub mod tls;
pub mod validate;

pub use fake::FakeRuntime;
pub use framework::Framework;
pub use service::{ImageManagerService, RuntimeService};
