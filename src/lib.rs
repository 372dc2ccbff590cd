//! Bootstrap for running a Docker daemon inside a privileged container.

pub mod bootstrap;
pub mod cgroups;
pub mod config;
pub mod daemon;
pub mod error;
pub mod fds;
pub mod host;
pub mod network;
pub mod storage;
pub mod subnet;

pub use error::BootstrapError;
