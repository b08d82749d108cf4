//! Solarman V5 transport
//!
//! Wi-Fi data-logging sticks expose the inverter's Modbus RTU bus on TCP port
//! 8899, wrapped in V5 frames:
//!
//! ```text
//! A5 | len u16 | control u16 | seq u16 | serial u32 | payload | checksum | 15
//! ```
//!
//! All multi-byte header fields are little-endian. The Modbus frame inside
//! the payload keeps its own big-endian layout and CRC.

use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::{Endpoint, RegisterSession, Transport, TransportError, MODBUS_MAX_READ_REGISTERS};

const START: u8 = 0xA5;
const END: u8 = 0x15;
const HEADER_LEN: usize = 11;
const TRAILER_LEN: usize = 2;
const CONTROL_REQUEST: u16 = 0x4510;
const CONTROL_RESPONSE: u16 = 0x1510;
const CONTROL_HEARTBEAT: u16 = 0x4710;
const FRAME_TYPE_INVERTER: u8 = 0x02;
/// Frame type, status and three u32 time fields
const RESPONSE_PAYLOAD_PREFIX: usize = 14;
/// Guard against garbage length fields
const MAX_PAYLOAD_LEN: usize = 1024;

const READ_HOLDING_REGISTERS: u8 = 0x03;

/// CRC-16/MODBUS (poly 0xA001 reflected, init 0xFFFF)
pub fn crc16_modbus(data: &[u8]) -> u16 {
    let mut crc: u16 = 0xFFFF;
    for byte in data {
        crc ^= u16::from(*byte);
        for _ in 0..8 {
            if crc & 0x0001 != 0 {
                crc = (crc >> 1) ^ 0xA001;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}

fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Modbus RTU read-holding-registers request, CRC included
pub fn encode_read_request(slave_id: u8, start: u16, count: u16) -> BytesMut {
    let mut frame = BytesMut::with_capacity(8);
    frame.put_u8(slave_id);
    frame.put_u8(READ_HOLDING_REGISTERS);
    frame.put_u16(start);
    frame.put_u16(count);
    let crc = crc16_modbus(&frame);
    frame.put_u16_le(crc);
    frame
}

/// Wrap a Modbus RTU frame in a V5 request frame
pub fn encode_v5_request(serial: u32, sequence: u16, modbus: &[u8]) -> BytesMut {
    let payload_len = 15 + modbus.len();
    let mut frame = BytesMut::with_capacity(HEADER_LEN + payload_len + TRAILER_LEN);

    frame.put_u8(START);
    frame.put_u16_le(payload_len as u16);
    frame.put_u16_le(CONTROL_REQUEST);
    frame.put_u16_le(sequence);
    frame.put_u32_le(serial);

    frame.put_u8(FRAME_TYPE_INVERTER);
    frame.put_u16_le(0); // sensor type
    frame.put_u32_le(0); // total working time
    frame.put_u32_le(0); // power on time
    frame.put_u32_le(0); // offset time
    frame.put_slice(modbus);

    let sum = checksum(&frame[1..]);
    frame.put_u8(sum);
    frame.put_u8(END);
    frame
}

/// Validate a complete V5 response frame and return its Modbus RTU frame
pub fn decode_v5_response(frame: &[u8], sequence: u16) -> Result<&[u8], TransportError> {
    let protocol = |msg: String| TransportError::Protocol(msg);

    if frame.len() < HEADER_LEN + RESPONSE_PAYLOAD_PREFIX + TRAILER_LEN {
        return Err(protocol(format!("V5 frame too short: {} bytes", frame.len())));
    }
    if frame[0] != START || frame[frame.len() - 1] != END {
        return Err(protocol("V5 frame has bad start/end markers".to_string()));
    }

    let mut header = &frame[1..HEADER_LEN];
    let payload_len = usize::from(header.get_u16_le());
    let control = header.get_u16_le();
    let response_sequence = header.get_u16_le();

    if payload_len != frame.len() - HEADER_LEN - TRAILER_LEN {
        return Err(protocol(format!(
            "V5 length field {} does not match frame of {} bytes",
            payload_len,
            frame.len()
        )));
    }

    let expected = checksum(&frame[1..frame.len() - 2]);
    if frame[frame.len() - 2] != expected {
        return Err(protocol(format!(
            "V5 checksum mismatch: got {:02X}, expected {:02X}",
            frame[frame.len() - 2],
            expected
        )));
    }
    if control != CONTROL_RESPONSE {
        return Err(protocol(format!("unexpected V5 control code {:04X}", control)));
    }
    // Loggers only echo the low byte reliably
    if response_sequence & 0xFF != sequence & 0xFF {
        return Err(protocol(format!(
            "V5 sequence mismatch: sent {:04X}, got {:04X}",
            sequence, response_sequence
        )));
    }

    Ok(&frame[HEADER_LEN + RESPONSE_PAYLOAD_PREFIX..frame.len() - TRAILER_LEN])
}

/// Parse a Modbus RTU read-holding-registers response
pub fn decode_read_response(
    modbus: &[u8],
    slave_id: u8,
    count: u16,
) -> Result<Vec<u16>, TransportError> {
    let protocol = |msg: String| TransportError::Protocol(msg);

    if modbus.len() < 5 {
        return Err(protocol(format!("Modbus frame too short: {} bytes", modbus.len())));
    }

    let (body, crc_bytes) = modbus.split_at(modbus.len() - 2);
    let received_crc = u16::from_le_bytes([crc_bytes[0], crc_bytes[1]]);
    let expected_crc = crc16_modbus(body);
    if received_crc != expected_crc {
        return Err(protocol(format!(
            "Modbus CRC mismatch: got {:04X}, expected {:04X}",
            received_crc, expected_crc
        )));
    }

    if body[0] != slave_id {
        return Err(protocol(format!(
            "response from slave {}, expected {}",
            body[0], slave_id
        )));
    }

    let function = body[1];
    if function == READ_HOLDING_REGISTERS | 0x80 {
        return Err(protocol(format!("Modbus exception code {:02X}", body[2])));
    }
    if function != READ_HOLDING_REGISTERS {
        return Err(protocol(format!("unexpected function code {:02X}", function)));
    }

    let byte_count = usize::from(body[2]);
    let data = &body[3..];
    if byte_count != usize::from(count) * 2 || data.len() != byte_count {
        return Err(protocol(format!(
            "expected {} register bytes, got {} (byte count field {})",
            usize::from(count) * 2,
            data.len(),
            byte_count
        )));
    }

    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

/// Opens TCP sessions to a Solarman logger
#[derive(Debug, Clone)]
pub struct SolarmanTransport {
    connect_timeout: Duration,
    read_timeout: Duration,
}

impl SolarmanTransport {
    pub fn new(connect_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            read_timeout,
        }
    }
}

#[async_trait]
impl Transport for SolarmanTransport {
    type Session = SolarmanSession;

    async fn open(&self, endpoint: &Endpoint) -> Result<SolarmanSession, TransportError> {
        debug!("Connecting to logger {}", endpoint);

        let connect = TcpStream::connect((endpoint.address.as_str(), endpoint.port));
        let stream = match tokio::time::timeout(self.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::Unreachable(format!("{}: {}", endpoint, e)));
            },
            Err(_) => {
                return Err(TransportError::Unreachable(format!(
                    "{}: connect timed out after {:?}",
                    endpoint, self.connect_timeout
                )));
            },
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle on {}: {}", endpoint, e);
        }

        Ok(SolarmanSession {
            stream,
            serial: endpoint.serial,
            slave_id: endpoint.slave_id,
            sequence: 0,
            read_timeout: self.read_timeout,
        })
    }
}

/// One TCP connection to the logger; dropped (and closed) after each attempt
#[derive(Debug)]
pub struct SolarmanSession {
    stream: TcpStream,
    serial: u32,
    slave_id: u8,
    sequence: u16,
    read_timeout: Duration,
}

impl SolarmanSession {
    fn next_sequence(&mut self) -> u16 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    async fn read_frame(&mut self) -> Result<Vec<u8>, TransportError> {
        let io_err = |e: std::io::Error| TransportError::Unreachable(format!("read failed: {}", e));

        let mut frame = vec![0u8; HEADER_LEN];
        self.stream.read_exact(&mut frame).await.map_err(io_err)?;
        if frame[0] != START {
            return Err(TransportError::Protocol(format!(
                "bad V5 start byte {:02X}",
                frame[0]
            )));
        }

        let payload_len = usize::from(u16::from_le_bytes([frame[1], frame[2]]));
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(TransportError::Protocol(format!(
                "V5 payload length {} exceeds {}",
                payload_len, MAX_PAYLOAD_LEN
            )));
        }

        frame.resize(HEADER_LEN + payload_len + TRAILER_LEN, 0);
        self.stream
            .read_exact(&mut frame[HEADER_LEN..])
            .await
            .map_err(io_err)?;
        trace!("V5 frame received: {:02X?}", frame);
        Ok(frame)
    }

    async fn exchange(&mut self, request: &[u8]) -> Result<Vec<u8>, TransportError> {
        self.stream
            .write_all(request)
            .await
            .map_err(|e| TransportError::Unreachable(format!("write failed: {}", e)))?;

        loop {
            let frame = self.read_frame().await?;
            let control = u16::from_le_bytes([frame[3], frame[4]]);
            if control == CONTROL_HEARTBEAT {
                debug!("Skipping logger heartbeat frame");
                continue;
            }
            return Ok(frame);
        }
    }
}

#[async_trait]
impl RegisterSession for SolarmanSession {
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        if count == 0 || count > MODBUS_MAX_READ_REGISTERS {
            return Err(TransportError::Protocol(format!(
                "register count {} outside 1..={}",
                count, MODBUS_MAX_READ_REGISTERS
            )));
        }

        let sequence = self.next_sequence();
        let modbus = encode_read_request(self.slave_id, start, count);
        let request = encode_v5_request(self.serial, sequence, &modbus);
        debug!("Reading {} registers from {} (seq {})", count, start, sequence);

        let timeout = self.read_timeout;
        let frame = tokio::time::timeout(timeout, self.exchange(&request))
            .await
            .map_err(|_| {
                TransportError::Unreachable(format!("no response within {:?}", timeout))
            })??;

        let modbus = decode_v5_response(&frame, sequence)?;
        decode_read_response(modbus, self.slave_id, count)
    }
}
