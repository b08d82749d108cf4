//! Device transport capability
//!
//! A transport opens sessions to the inverter's data logger; a session reads
//! holding registers. The chunked reader only depends on these traits, so
//! the wire protocol can be swapped or scripted in tests.

pub mod solarman;

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest register count one read-holding-registers request may carry
pub const MODBUS_MAX_READ_REGISTERS: u16 = 125;

/// Where and what to talk to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Logger host name or IP address
    pub address: String,
    pub port: u16,
    /// Logger serial number, used as the device identifier
    pub serial: u32,
    /// Modbus slave id behind the logger
    pub slave_id: u8,
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (serial {})", self.address, self.port, self.serial)
    }
}

/// Transport failure kinds
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// No route, refused/reset connection, or no answer in time
    #[error("Device unreachable: {0}")]
    Unreachable(String),

    /// Malformed or unexpected response
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the read may succeed on a fresh session
    pub fn is_transient(&self) -> bool {
        matches!(self, TransportError::Unreachable(_))
    }
}

/// An open conversation with the device
#[async_trait]
pub trait RegisterSession: Send {
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError>;
}

/// Factory for sessions
#[async_trait]
pub trait Transport: Send + Sync {
    type Session: RegisterSession;

    async fn open(&self, endpoint: &Endpoint) -> Result<Self::Session, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(TransportError::Unreachable("refused".into()).is_transient());
        assert!(!TransportError::Protocol("bad crc".into()).is_transient());
    }

    #[test]
    fn test_endpoint_display() {
        let endpoint = Endpoint {
            address: "192.168.1.50".into(),
            port: 8899,
            serial: 2_712_345_678,
            slave_id: 1,
        };
        assert_eq!(endpoint.to_string(), "192.168.1.50:8899 (serial 2712345678)");
    }
}
