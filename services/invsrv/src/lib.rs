//! Inverter Service (invsrv)
//!
//! Polls a Deye hybrid inverter through its Solarman data logger, decodes the
//! holding registers into named measurements and hands each snapshot to two
//! independent consumers: a Prometheus scrape endpoint and an MQTT publisher.
//!
//! ```text
//! ┌───────────┐   ┌──────────────┐   ┌────────────┐   ┌─────────────┐
//! │ transport │──►│ session      │──►│ decode     │──►│ distributor │
//! │ (V5/TCP)  │   │ (chunks +    │   │ (catalog + │   │ (latest     │
//! └───────────┘   │  retries)    │   │  tables)   │   │  wins)      │
//!                 └──────────────┘   └────────────┘   └──────┬──────┘
//!                                                ┌──────────┴──────────┐
//!                                                ▼                     ▼
//!                                         ┌─────────────┐      ┌─────────────┐
//!                                         │ exporter    │      │ publisher   │
//!                                         │ (/metrics)  │      │ (MQTT)      │
//!                                         └─────────────┘      └─────────────┘
//! ```

pub mod bootstrap;
pub mod catalog;
pub mod clock;
pub mod collector;
pub mod config;
pub mod decode;
pub mod distributor;
pub mod error;
pub mod exporter;
pub mod publisher;
pub mod runtime;
pub mod session;
pub mod snapshot;
pub mod test_utils;
pub mod transport;

pub use error::{InvSrvError, Result};
