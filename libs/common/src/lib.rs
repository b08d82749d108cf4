//! `VoltageEMS` basic library
//!
//! Provides the plumbing shared by all services:
//! - logging setup
//! - graceful shutdown
//! - startup arguments and banner

pub mod bootstrap_args;
pub mod logging;
pub mod service_bootstrap;
pub mod shutdown;

pub use bootstrap_args::ServiceArgs;
pub use service_bootstrap::ServiceInfo;
