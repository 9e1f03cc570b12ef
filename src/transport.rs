//! Transport adapter over the command/result queue pair.
//!
//! The channel talks to the host through two queues: "get command" carries
//! one receive slot the host fills, "return result" carries fully built
//! response frames. Queue-pair creation and feature negotiation belong to
//! the backend behind [`QueueBackend`]; this module owns the blocking
//! submit/kick/await-ack discipline on top of it.
//!
//! Acknowledgments are edge-triggered wakes through a [`Doorbell`]: the
//! waiter records the ack epoch before arming and re-evaluates the same
//! condition after queuing, so an ack is released exactly once and never
//! missed. Waits accept cancellation (device removal) and a configurable
//! timeout, so a missing ack surfaces as an error rather than a permanent
//! hang.

use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hostlink_protocol::{CommandRecord, ResponseRecord, COMMAND_RECORD_LEN};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

// ============================================================================
// Doorbell
// ============================================================================

struct BellState {
    epoch: u64,
    cancelled: bool,
}

/// Edge-triggered acknowledgment signal, one per queue.
///
/// `ring()` runs in the backend's completion context and does nothing but
/// wake waiters; all real work happens on the task that was waiting.
pub struct Doorbell {
    state: Mutex<BellState>,
    wakeup: Condvar,
}

impl Default for Doorbell {
    fn default() -> Self {
        Self::new()
    }
}

impl Doorbell {
    /// A doorbell nobody has rung.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BellState {
                epoch: 0,
                cancelled: false,
            }),
            wakeup: Condvar::new(),
        }
    }

    /// The current ack epoch. Record this before arming a submit.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    /// Deliver one acknowledgment: advance the epoch and wake waiters.
    pub fn ring(&self) {
        let mut state = self.state.lock();
        state.epoch += 1;
        self.wakeup.notify_all();
    }

    /// Cancel all current and future waits. Idempotent.
    pub fn cancel(&self) {
        let mut state = self.state.lock();
        state.cancelled = true;
        self.wakeup.notify_all();
    }

    /// Block until the epoch moves past `seen`, the bell is cancelled, or
    /// `timeout` elapses. The wait condition is re-evaluated after every
    /// wake, including the final timeout check.
    pub fn wait_past(&self, seen: u64, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if state.cancelled {
                return Err(Error::Detached);
            }
            if state.epoch > seen {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                        if state.cancelled {
                            return Err(Error::Detached);
                        }
                        if state.epoch > seen {
                            return Ok(());
                        }
                        let timeout_ms =
                            timeout.map(|t| t.as_millis() as u64).unwrap_or_default();
                        return Err(Error::AckTimeout { timeout_ms });
                    }
                }
                None => self.wakeup.wait(&mut state),
            }
        }
    }
}

// ============================================================================
// Backend interface
// ============================================================================

/// The raw queue pair, provided by whatever created the device.
///
/// The backend delivers acknowledgments by ringing the doorbells handed to
/// it at attach time: the command bell once per delivered command frame,
/// the response bell once per consumed response frame.
pub trait QueueBackend: Send + Sync {
    /// Wire the per-queue acknowledgment doorbells. Called once at attach.
    fn install_acks(&self, command_ack: Arc<Doorbell>, response_ack: Arc<Doorbell>);

    /// Arm the command queue with one empty receive slot and kick the host.
    fn arm_receive(&self) -> Result<()>;

    /// Take the command frame the host delivered into the armed slot.
    fn take_received(&self) -> Result<Vec<u8>>;

    /// Push a fully built response frame on the result queue and kick.
    fn push_response(&self, frame: &[u8]) -> Result<()>;
}

/// Round-trip counters. Advisory diagnostics, not correctness-bearing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Commands received and acknowledged.
    pub commands_received: u64,
    /// Responses sent and acknowledged.
    pub responses_sent: u64,
}

// ============================================================================
// Transport
// ============================================================================

/// Blocking submit interface over a [`QueueBackend`].
pub struct Transport {
    backend: Arc<dyn QueueBackend>,
    command_ack: Arc<Doorbell>,
    response_ack: Arc<Doorbell>,
    ack_timeout: Option<Duration>,
    received: AtomicU64,
    sent: AtomicU64,
}

impl Transport {
    /// Attach to a backend, wiring the acknowledgment doorbells.
    pub fn attach(backend: Arc<dyn QueueBackend>, ack_timeout: Option<Duration>) -> Self {
        let command_ack = Arc::new(Doorbell::new());
        let response_ack = Arc::new(Doorbell::new());
        backend.install_acks(Arc::clone(&command_ack), Arc::clone(&response_ack));
        Self {
            backend,
            command_ack,
            response_ack,
            ack_timeout,
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
        }
    }

    /// Arm the command queue with one receive slot and block until the host
    /// delivers a command record into it.
    pub fn submit_for_receive(&self) -> Result<CommandRecord> {
        let seen = self.command_ack.epoch();
        self.backend.arm_receive()?;
        self.command_ack.wait_past(seen, self.ack_timeout)?;
        let frame = self.backend.take_received()?;
        let record = CommandRecord::decode(&frame)?;
        self.received.fetch_add(1, Ordering::Relaxed);
        debug!(id = record.id, "command received");
        Ok(record)
    }

    /// Push a fully built response record and block until the host
    /// acknowledges it.
    pub fn submit_for_send(&self, response: &ResponseRecord) -> Result<()> {
        let seen = self.response_ack.epoch();
        self.backend.push_response(&response.encode())?;
        self.response_ack.wait_past(seen, self.ack_timeout)?;
        self.sent.fetch_add(1, Ordering::Relaxed);
        debug!(id = response.id, "response acknowledged");
        Ok(())
    }

    /// Cancel any pending submission. Device-removal path; idempotent.
    pub fn cancel(&self) {
        self.command_ack.cancel();
        self.response_ack.cancel();
    }

    /// Snapshot the round-trip counters.
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            commands_received: self.received.load(Ordering::Relaxed),
            responses_sent: self.sent.load(Ordering::Relaxed),
        }
    }
}

// ============================================================================
// Loopback backend
// ============================================================================

/// How long the in-process host waits for the guest before giving up.
const LOOPBACK_HOST_TIMEOUT: Duration = Duration::from_secs(10);

struct LoopState {
    armed: bool,
    delivered: Option<Vec<u8>>,
    responses: VecDeque<Vec<u8>>,
}

struct Acks {
    command_ack: Option<Arc<Doorbell>>,
    response_ack: Option<Arc<Doorbell>>,
}

/// In-memory queue pair for tests and in-process hosts.
pub struct LoopbackBackend {
    state: Mutex<LoopState>,
    host_wakeup: Condvar,
    acks: Mutex<Acks>,
}

/// Create a connected in-memory queue pair: the backend half attaches to a
/// [`Transport`], the [`HostHandle`] half drives it like the host would.
pub fn loopback() -> (Arc<LoopbackBackend>, HostHandle) {
    let backend = Arc::new(LoopbackBackend {
        state: Mutex::new(LoopState {
            armed: false,
            delivered: None,
            responses: VecDeque::new(),
        }),
        host_wakeup: Condvar::new(),
        acks: Mutex::new(Acks {
            command_ack: None,
            response_ack: None,
        }),
    });
    let host = HostHandle {
        backend: Arc::clone(&backend),
    };
    (backend, host)
}

impl LoopbackBackend {
    fn ring_command_ack(&self) {
        if let Some(bell) = &self.acks.lock().command_ack {
            bell.ring();
        }
    }

    fn ring_response_ack(&self) {
        if let Some(bell) = &self.acks.lock().response_ack {
            bell.ring();
        }
    }
}

impl QueueBackend for LoopbackBackend {
    fn install_acks(&self, command_ack: Arc<Doorbell>, response_ack: Arc<Doorbell>) {
        let mut acks = self.acks.lock();
        acks.command_ack = Some(command_ack);
        acks.response_ack = Some(response_ack);
    }

    fn arm_receive(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.armed = true;
        self.host_wakeup.notify_all();
        Ok(())
    }

    fn take_received(&self) -> Result<Vec<u8>> {
        self.state
            .lock()
            .delivered
            .take()
            .ok_or_else(|| Error::Backend("no delivered frame in armed slot".into()))
    }

    fn push_response(&self, frame: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.responses.push_back(frame.to_vec());
        self.host_wakeup.notify_all();
        Ok(())
    }
}

/// The host half of a loopback pair.
pub struct HostHandle {
    backend: Arc<LoopbackBackend>,
}

impl HostHandle {
    /// Deliver one command into the guest's armed receive slot, blocking
    /// until the guest arms one.
    pub fn send_command(&self, record: &CommandRecord) -> Result<()> {
        let deadline = Instant::now() + LOOPBACK_HOST_TIMEOUT;
        {
            let mut state = self.backend.state.lock();
            while !state.armed {
                if self
                    .backend
                    .host_wakeup
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    return Err(Error::Backend("guest never armed a receive slot".into()));
                }
            }
            state.armed = false;
            state.delivered = Some(record.encode().to_vec());
        }
        self.backend.ring_command_ack();
        Ok(())
    }

    /// Consume one response from the result queue, acknowledging it.
    pub fn recv_response(&self) -> Result<ResponseRecord> {
        let deadline = Instant::now() + LOOPBACK_HOST_TIMEOUT;
        let frame = {
            let mut state = self.backend.state.lock();
            loop {
                if let Some(frame) = state.responses.pop_front() {
                    break frame;
                }
                if self
                    .backend
                    .host_wakeup
                    .wait_until(&mut state, deadline)
                    .timed_out()
                {
                    return Err(Error::Backend("guest never pushed a response".into()));
                }
            }
        };
        self.backend.ring_response_ack();
        Ok(ResponseRecord::decode(&frame)?)
    }

    /// Whether the guest currently has a receive slot armed.
    pub fn is_armed(&self) -> bool {
        self.backend.state.lock().armed
    }
}

// ============================================================================
// Stream backend
// ============================================================================

/// Queue pair framed over a byte stream: the host writes fixed-width
/// command frames, the guest writes fixed-width response frames. Write
/// completion stands in for the result-queue ack; a reader thread turns
/// arriving frames into command-queue acks. End of stream cancels both
/// doorbells, which is the device-removal path.
pub struct StreamBackend {
    writer: Mutex<Box<dyn Write + Send>>,
    inbox: Mutex<VecDeque<Vec<u8>>>,
    acks: Mutex<Acks>,
    closed: Mutex<bool>,
    closed_wakeup: Condvar,
}

impl StreamBackend {
    /// Wrap a stream pair and start the reader thread.
    pub fn spawn(
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> Arc<Self> {
        let backend = Arc::new(Self {
            writer: Mutex::new(Box::new(writer)),
            inbox: Mutex::new(VecDeque::new()),
            acks: Mutex::new(Acks {
                command_ack: None,
                response_ack: None,
            }),
            closed: Mutex::new(false),
            closed_wakeup: Condvar::new(),
        });

        let thread_backend = Arc::clone(&backend);
        std::thread::spawn(move || thread_backend.read_loop(reader));
        backend
    }

    fn read_loop(&self, mut reader: impl Read) {
        let mut frame = [0u8; COMMAND_RECORD_LEN];
        loop {
            match reader.read_exact(&mut frame) {
                Ok(()) => {
                    self.inbox.lock().push_back(frame.to_vec());
                    if let Some(bell) = &self.acks.lock().command_ack {
                        bell.ring();
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    info!("command stream closed by host");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "command stream read failed");
                    break;
                }
            }
        }
        // Device removal: mark the stream closed first so a late attach
        // observes it, then cancel pending submissions and wake waiters.
        *self.closed.lock() = true;
        let acks = self.acks.lock();
        if let Some(bell) = &acks.command_ack {
            bell.cancel();
        }
        if let Some(bell) = &acks.response_ack {
            bell.cancel();
        }
        drop(acks);
        self.closed_wakeup.notify_all();
    }

    /// Block until the stream ends.
    pub fn wait_until_closed(&self) {
        let mut closed = self.closed.lock();
        while !*closed {
            self.closed_wakeup.wait(&mut closed);
        }
    }
}

impl QueueBackend for StreamBackend {
    fn install_acks(&self, command_ack: Arc<Doorbell>, response_ack: Arc<Doorbell>) {
        {
            let mut acks = self.acks.lock();
            acks.command_ack = Some(Arc::clone(&command_ack));
            acks.response_ack = Some(Arc::clone(&response_ack));
        }
        // The stream may have ended before the transport attached; that
        // cancel must not be missed.
        if *self.closed.lock() {
            command_ack.cancel();
            response_ack.cancel();
        }
    }

    fn arm_receive(&self) -> Result<()> {
        // A stream host pushes without waiting for the slot, so a frame may
        // already be waiting; ring for it so the ack is not missed.
        if !self.inbox.lock().is_empty() {
            if let Some(bell) = &self.acks.lock().command_ack {
                bell.ring();
            }
        }
        Ok(())
    }

    fn take_received(&self) -> Result<Vec<u8>> {
        self.inbox
            .lock()
            .pop_front()
            .ok_or_else(|| Error::Backend("no frame waiting in command stream".into()))
    }

    fn push_response(&self, frame: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock();
        writer
            .write_all(frame)
            .and_then(|()| writer.flush())
            .map_err(|e| Error::Backend(format!("response stream write failed: {e}")))?;
        drop(writer);
        // Flush completion is the stream's delivery acknowledgment.
        if let Some(bell) = &self.acks.lock().response_ack {
            bell.ring();
        }
        Ok(())
    }
}
