//! Test utilities for invsrv
//!
//! Scripted doubles for the device transport and the clock, plus a loopback
//! Solarman logger, shared by the unit tests and the integration tests
//! under `tests/`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, TimeZone, Utc};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::clock::{Clock, Stamp};
use crate::transport::solarman::crc16_modbus;
use crate::transport::{Endpoint, RegisterSession, Transport, TransportError};

// ==================== Clock ====================

/// Clock whose time only moves when something sleeps on it or a test
/// advances it
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
    elapsed: Arc<Mutex<Duration>>,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
            elapsed: Arc::new(Mutex::new(Duration::ZERO)),
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Clock starting at 2026-01-01T00:00:00Z
    pub fn at_start() -> Self {
        Self::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default())
    }

    /// Let time pass: both readings move forward
    pub fn advance(&self, duration: Duration) {
        *self.elapsed.lock() += duration;
        let mut now = self.now.lock();
        *now += chrono::Duration::from_std(duration).unwrap_or_default();
    }

    /// Step the wall clock (NTP correction); the monotonic reading stays
    pub fn step_wall(&self, delta: chrono::Duration) {
        *self.now.lock() += delta;
    }

    /// Every duration passed to `sleep`, in call order
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }

    fn monotonic(&self) -> Duration {
        *self.elapsed.lock()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// Stamp `secs` seconds into a run that started at 2026-01-01T00:00:00Z
pub fn stamp_at(secs: u64) -> Stamp {
    let start = Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap_or_default();
    Stamp {
        wall: start + chrono::Duration::seconds(secs as i64),
        monotonic: Duration::from_secs(secs),
    }
}

// ==================== Transport ====================

/// Outcome of one session (one collection attempt)
#[derive(Debug, Clone)]
pub enum Attempt {
    /// Every chunk read succeeds
    Succeed,
    /// Opening the session fails
    RefuseConnect(TransportError),
    /// The chunk read with this index fails
    FailChunk { index: usize, error: TransportError },
    /// Chunk reads never complete
    Hang,
}

#[derive(Debug)]
struct Script {
    steps: VecDeque<Attempt>,
    fallback: Attempt,
}

/// In-memory device serving a fixed register image
///
/// Each `open` consumes the next scripted [`Attempt`]; once the script is
/// exhausted the fallback applies (`Succeed` unless changed). Registers past
/// the end of the image read as zero.
#[derive(Debug, Clone)]
pub struct ScriptedTransport {
    image: Arc<Mutex<Vec<u16>>>,
    script: Arc<Mutex<Script>>,
    opens: Arc<AtomicU32>,
    reads: Arc<Mutex<Vec<(u16, u16)>>>,
}

impl ScriptedTransport {
    pub fn new(image: Vec<u16>) -> Self {
        Self {
            image: Arc::new(Mutex::new(image)),
            script: Arc::new(Mutex::new(Script {
                steps: VecDeque::new(),
                fallback: Attempt::Succeed,
            })),
            opens: Arc::new(AtomicU32::new(0)),
            reads: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Image with the given `(address, value)` pairs set, zero elsewhere
    pub fn with_registers(values: &[(u16, u16)]) -> Self {
        let len = values
            .iter()
            .map(|(addr, _)| usize::from(*addr) + 1)
            .max()
            .unwrap_or(0);
        let mut image = vec![0u16; len];
        for (addr, value) in values {
            image[usize::from(*addr)] = *value;
        }
        Self::new(image)
    }

    /// Queue the outcome of the next unscripted session
    pub fn then(self, attempt: Attempt) -> Self {
        self.script.lock().steps.push_back(attempt);
        self
    }

    /// Outcome once the queued steps are used up
    pub fn otherwise(self, attempt: Attempt) -> Self {
        self.script.lock().fallback = attempt;
        self
    }

    pub fn set_register(&self, addr: u16, value: u16) {
        let mut image = self.image.lock();
        let idx = usize::from(addr);
        if image.len() <= idx {
            image.resize(idx + 1, 0);
        }
        image[idx] = value;
    }

    /// Number of sessions opened (including refused ones)
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }

    /// `(start, count)` of every chunk read that was served
    pub fn reads(&self) -> Vec<(u16, u16)> {
        self.reads.lock().clone()
    }

    fn next_attempt(&self) -> Attempt {
        let mut script = self.script.lock();
        match script.steps.pop_front() {
            Some(step) => step,
            None => script.fallback.clone(),
        }
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    type Session = ScriptedSession;

    async fn open(&self, _endpoint: &Endpoint) -> Result<ScriptedSession, TransportError> {
        self.opens.fetch_add(1, Ordering::SeqCst);
        let attempt = self.next_attempt();
        if let Attempt::RefuseConnect(error) = attempt {
            return Err(error);
        }
        Ok(ScriptedSession {
            device: self.clone(),
            attempt,
            chunk: 0,
        })
    }
}

/// Session handed out by [`ScriptedTransport`]
#[derive(Debug)]
pub struct ScriptedSession {
    device: ScriptedTransport,
    attempt: Attempt,
    chunk: usize,
}

#[async_trait]
impl RegisterSession for ScriptedSession {
    async fn read_holding_registers(
        &mut self,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, TransportError> {
        let index = self.chunk;
        self.chunk += 1;

        match &self.attempt {
            Attempt::Hang => std::future::pending::<()>().await,
            Attempt::FailChunk { index: failing, error } if *failing == index => {
                return Err(error.clone());
            },
            _ => {},
        }

        self.device.reads.lock().push((start, count));
        let image = self.device.image.lock();
        Ok((0..count)
            .map(|i| {
                image
                    .get(usize::from(start) + usize::from(i))
                    .copied()
                    .unwrap_or(0)
            })
            .collect())
    }
}

/// Endpoint pointing nowhere, for scripted transports
pub fn test_endpoint() -> Endpoint {
    Endpoint {
        address: "127.0.0.1".to_string(),
        port: 8899,
        serial: 1234567890,
        slave_id: 1,
    }
}

// ==================== Solarman logger ====================

/// Modbus RTU read-holding-registers response carrying `words`
pub fn modbus_read_response(slave_id: u8, words: &[u16]) -> Vec<u8> {
    let mut frame = BytesMut::new();
    frame.put_u8(slave_id);
    frame.put_u8(0x03);
    frame.put_u8((words.len() * 2) as u8);
    for w in words {
        frame.put_u16(*w);
    }
    let crc = crc16_modbus(&frame);
    frame.put_u16_le(crc);
    frame.to_vec()
}

/// V5 response frame (control 0x1510) wrapping a Modbus RTU frame
pub fn v5_response(serial: u32, sequence: u16, modbus: &[u8]) -> Vec<u8> {
    let mut frame = BytesMut::new();
    frame.put_u8(0xA5);
    frame.put_u16_le((14 + modbus.len()) as u16);
    frame.put_u16_le(0x1510);
    frame.put_u16_le(sequence);
    frame.put_u32_le(serial);
    frame.put_u8(0x02); // frame type: inverter
    frame.put_u8(0x01); // status
    frame.put_u32_le(0);
    frame.put_u32_le(0);
    frame.put_u32_le(0);
    frame.put_slice(modbus);
    let sum = frame[1..].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    frame.put_u8(sum);
    frame.put_u8(0x15);
    frame.to_vec()
}

/// Solarman data logger on a loopback port, answering every read request
/// from a fixed register map (unset registers read as zero)
#[derive(Debug)]
pub struct FakeLogger {
    port: u16,
    server: JoinHandle<()>,
}

impl FakeLogger {
    pub async fn start(serial: u32, registers: &[(u16, u16)]) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let registers: Arc<HashMap<u16, u16>> = Arc::new(registers.iter().copied().collect());

        let server = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(serve_connection(socket, serial, registers.clone()));
            }
        });
        Ok(Self { port, server })
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for FakeLogger {
    fn drop(&mut self) {
        self.server.abort();
    }
}

async fn serve_connection(mut socket: TcpStream, serial: u32, registers: Arc<HashMap<u16, u16>>) {
    loop {
        let mut request = vec![0u8; 11];
        if socket.read_exact(&mut request).await.is_err() {
            return;
        }
        let payload_len = usize::from(u16::from_le_bytes([request[1], request[2]]));
        request.resize(11 + payload_len + 2, 0);
        if socket.read_exact(&mut request[11..]).await.is_err() || request.len() < 34 {
            return;
        }

        let sequence = u16::from_le_bytes([request[5], request[6]]);
        let slave_id = request[26];
        let start = u16::from_be_bytes([request[28], request[29]]);
        let count = u16::from_be_bytes([request[30], request[31]]);
        debug!("Fake logger serving {} registers from {}", count, start);

        let words: Vec<u16> = (0..count)
            .map(|i| registers.get(&start.wrapping_add(i)).copied().unwrap_or(0))
            .collect();
        let reply = v5_response(serial, sequence, &modbus_read_response(slave_id, &words));
        if socket.write_all(&reply).await.is_err() {
            return;
        }
    }
}
