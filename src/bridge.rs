//! Userspace bridge ring and control endpoint.
//!
//! The bridge exposes the channel to a local process. The command processor
//! injects line commands into the ring; the local consumer reads the current
//! record through the control endpoint, acts on it, and writes a record back.
//! A written record whose status field is [`STATUS_PENDING`] carries a
//! command string that is forwarded to the run-command interface; anything
//! else is treated as rejected input and discarded.
//!
//! Records are fixed-width: a 4-byte little-endian status followed by a
//! zero-terminated text field. All slots start out with a pending status so
//! a reader never consumes a slot nothing has filled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use hostlink_protocol::ProtocolError;
use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::completion::RingFull;
use crate::error::{Error, Result};
use crate::events::{EventBus, EventKind};

/// Raw width of one bridge record.
pub const BRIDGE_RECORD_LEN: usize = 1024;

/// Width of the text field inside a record (record minus the status word).
pub const BRIDGE_TEXT_LEN: usize = BRIDGE_RECORD_LEN - 4;

/// Number of records the bridge ring holds.
pub const BRIDGE_CAPACITY: usize = 512;

/// Status value: the record carries input still to be acted on.
pub const STATUS_PENDING: u32 = 1;

/// Status value: the record is filled and consumable by a reader.
pub const STATUS_READY: u32 = 0;

/// Build a record from its parts, rejecting oversized text.
pub fn record_from_parts(status: u32, text: &[u8]) -> Result<[u8; BRIDGE_RECORD_LEN]> {
    if text.len() > BRIDGE_TEXT_LEN {
        return Err(Error::Protocol(ProtocolError::PayloadTooLong {
            len: text.len(),
            max: BRIDGE_TEXT_LEN,
        }));
    }
    let mut record = [0u8; BRIDGE_RECORD_LEN];
    record[..4].copy_from_slice(&status.to_le_bytes());
    record[4..4 + text.len()].copy_from_slice(text);
    Ok(record)
}

fn record_status(record: &[u8]) -> u32 {
    u32::from_le_bytes(record[..4].try_into().expect("4-byte slice"))
}

fn record_text(record: &[u8]) -> &[u8] {
    let field = &record[4..];
    let end = field.iter().position(|&b| b == 0).unwrap_or(field.len());
    &field[..end]
}

struct BridgeInner {
    slots: Vec<[u8; BRIDGE_RECORD_LEN]>,
    start: usize,
    end: usize,
}

/// Bounded ring of fixed-width records between the channel and a local
/// consumer. One reader-writer lock guards the ring: readers may run
/// concurrently, writers and the injection path are exclusive.
pub struct BridgeRing {
    inner: RwLock<BridgeInner>,
    bus: Arc<EventBus>,
    held_open: AtomicBool,
}

impl BridgeRing {
    /// An empty ring forwarding pending records through `bus`.
    pub fn new(bus: Arc<EventBus>) -> Self {
        let mut blank = [0u8; BRIDGE_RECORD_LEN];
        blank[..4].copy_from_slice(&STATUS_PENDING.to_le_bytes());
        Self {
            inner: RwLock::new(BridgeInner {
                slots: vec![blank; BRIDGE_CAPACITY],
                start: 0,
                end: 0,
            }),
            bus,
            held_open: AtomicBool::new(false),
        }
    }

    /// Command-processor injection path: store `text` as a ready record at
    /// the producer cursor. Reports [`RingFull`] when the producer catches
    /// the consumer; the entry is still stored (overflow is detected, not
    /// prevented).
    pub fn inject(&self, text: &[u8]) -> std::result::Result<(), RingFull> {
        let record = match record_from_parts(STATUS_READY, text) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "bridge injection rejected");
                return Ok(());
            }
        };
        let mut inner = self.inner.write();
        let end = inner.end;
        inner.slots[end] = record;
        inner.end = (end + 1) % BRIDGE_CAPACITY;
        if inner.end == inner.start {
            return Err(RingFull);
        }
        Ok(())
    }

    /// Store `bytes` into the current record under exclusive access, then
    /// interpret it: a pending status forwards the embedded command string
    /// to the run-command interface; anything else is rejected input. The
    /// ring advances either way. Returns the number of bytes stored.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        if bytes.len() > BRIDGE_RECORD_LEN {
            return Err(Error::Protocol(ProtocolError::PayloadTooLong {
                len: bytes.len(),
                max: BRIDGE_RECORD_LEN,
            }));
        }

        let forwarded = {
            let mut inner = self.inner.write();
            let start = inner.start;
            inner.slots[start][..bytes.len()].copy_from_slice(bytes);
            let record = &inner.slots[start];
            let forwarded = if record_status(record) == STATUS_PENDING {
                Some(String::from_utf8_lossy(record_text(record)).into_owned())
            } else {
                None
            };
            inner.start = (start + 1) % BRIDGE_CAPACITY;
            forwarded
        };

        match forwarded {
            Some(command) => {
                self.bus.publish(EventKind::RunLineCommand, &command);
            }
            None => debug!("bridge write without pending status, discarded"),
        }
        Ok(bytes.len())
    }

    /// Copy bytes from the current record into `buf` under shared access,
    /// starting at `*offset`. Returns 0 and resets the offset once the
    /// requested length is exceeded (per-record end of stream).
    pub fn read(&self, buf: &mut [u8], offset: &mut u64) -> usize {
        if *offset >= buf.len() as u64 || *offset >= BRIDGE_RECORD_LEN as u64 {
            *offset = 0;
            return 0;
        }
        let inner = self.inner.read();
        let at = *offset as usize;
        let n = buf.len().min(BRIDGE_RECORD_LEN - at);
        buf[..n].copy_from_slice(&inner.slots[inner.start][at..at + n]);
        *offset += n as u64;
        n
    }
}

/// Control endpoint over a [`BridgeRing`]: POSIX-style open/read/write plus
/// the `SET_MSG`/`GET_MSG` record operations.
pub struct ControlFile {
    bridge: Arc<BridgeRing>,
}

impl ControlFile {
    /// Expose `bridge` through a control endpoint.
    pub fn new(bridge: Arc<BridgeRing>) -> Self {
        Self { bridge }
    }

    /// Open the endpoint. Only one consumer may hold it at a time; a
    /// concurrent open is rejected [`Error::Busy`] and the caller retries.
    pub fn open(&self) -> Result<ControlHandle> {
        if self
            .bridge
            .held_open
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }
        debug!("control endpoint opened");
        Ok(ControlHandle {
            bridge: Arc::clone(&self.bridge),
            offset: 0,
        })
    }
}

/// An exclusive open of the control endpoint. Dropping the handle releases
/// the endpoint for the next consumer.
pub struct ControlHandle {
    bridge: Arc<BridgeRing>,
    offset: u64,
}

impl ControlHandle {
    /// Read from the current record at the handle's file offset.
    pub fn read(&mut self, buf: &mut [u8]) -> usize {
        self.bridge.read(buf, &mut self.offset)
    }

    /// Write bytes into the current record.
    pub fn write(&self, bytes: &[u8]) -> Result<usize> {
        self.bridge.write(bytes)
    }

    /// `SET_MSG`: write one fixed-width record. Sugar over [`Self::write`].
    pub fn set_msg(&self, record: &[u8; BRIDGE_RECORD_LEN]) -> Result<usize> {
        self.bridge.write(record)
    }

    /// `GET_MSG`: read one fixed-width record from offset zero. Sugar over
    /// [`Self::read`] with its own offset.
    pub fn get_msg(&self, record: &mut [u8; BRIDGE_RECORD_LEN]) -> usize {
        let mut offset = 0;
        self.bridge.read(record, &mut offset)
    }
}

impl Drop for ControlHandle {
    fn drop(&mut self) {
        self.bridge.held_open.store(false, Ordering::Release);
        debug!("control endpoint released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn counting_bus() -> (Arc<EventBus>, Arc<Mutex<Vec<String>>>) {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        bus.subscribe(EventKind::RunLineCommand, move |payload| {
            seen_clone.lock().push(payload.to_string());
        });
        (bus, seen)
    }

    #[test]
    fn test_write_pending_forwards_once() {
        let (bus, seen) = counting_bus();
        let bridge = BridgeRing::new(bus);
        let record = record_from_parts(STATUS_PENDING, b"uname -a").expect("fits");

        bridge.write(&record).expect("write succeeds");
        assert_eq!(*seen.lock(), vec!["uname -a".to_string()]);
    }

    #[test]
    fn test_write_ready_does_not_forward() {
        let (bus, seen) = counting_bus();
        let bridge = BridgeRing::new(bus);
        let record = record_from_parts(STATUS_READY, b"discarded").expect("fits");

        bridge.write(&record).expect("write succeeds");
        assert!(seen.lock().is_empty());
    }

    #[test]
    fn test_write_oversized_rejected() {
        let (bus, _) = counting_bus();
        let bridge = BridgeRing::new(bus);
        let err = bridge.write(&[0u8; BRIDGE_RECORD_LEN + 1]).unwrap_err();
        assert!(matches!(
            err,
            Error::Protocol(ProtocolError::PayloadTooLong { .. })
        ));
    }

    #[test]
    fn test_read_reflects_written_slot() {
        let (bus, _) = counting_bus();
        let bridge = BridgeRing::new(bus);
        bridge.inject(b"run this").expect("ring not full");

        // The injected record sits at the consumer cursor.
        let mut buf = [0u8; 32];
        let mut offset = 0;
        let n = bridge.read(&mut buf, &mut offset);
        assert_eq!(n, 32);
        assert_eq!(record_status(&buf), STATUS_READY);
        assert_eq!(record_text(&buf[..]), b"run this");
        assert_eq!(offset, 32);
    }

    #[test]
    fn test_read_returns_zero_past_requested_length() {
        let (bus, _) = counting_bus();
        let bridge = BridgeRing::new(bus);

        let mut buf = [0u8; 16];
        let mut offset = 16;
        assert_eq!(bridge.read(&mut buf, &mut offset), 0);
        // End of stream resets the offset for the next read.
        assert_eq!(offset, 0);
        assert_eq!(bridge.read(&mut buf, &mut offset), 16);
    }

    #[test]
    fn test_inject_reports_full_when_producer_catches_consumer() {
        let (bus, _) = counting_bus();
        let bridge = BridgeRing::new(bus);
        for i in 0..BRIDGE_CAPACITY - 1 {
            bridge
                .inject(format!("cmd-{i}").as_bytes())
                .unwrap_or_else(|_| panic!("inject {i} must fit"));
        }
        assert_eq!(bridge.inject(b"one too many"), Err(RingFull));
    }

    #[test]
    fn test_inject_oversized_is_dropped_not_fatal() {
        let (bus, _) = counting_bus();
        let bridge = BridgeRing::new(bus);
        let oversized = vec![b'x'; BRIDGE_TEXT_LEN + 1];
        // Logged and dropped; the ring does not advance.
        bridge.inject(&oversized).expect("not a ring error");

        let mut buf = [0u8; 4];
        let mut offset = 0;
        bridge.read(&mut buf, &mut offset);
        assert_eq!(record_status(&buf), STATUS_PENDING);
    }

    #[test]
    fn test_exclusive_open() {
        let (bus, _) = counting_bus();
        let control = ControlFile::new(Arc::new(BridgeRing::new(bus)));

        let handle = control.open().expect("first open succeeds");
        assert!(matches!(control.open(), Err(Error::Busy)));
        drop(handle);
        control.open().expect("open after release succeeds");
    }

    #[test]
    fn test_set_get_msg_roundtrip() {
        let (bus, seen) = counting_bus();
        let control = ControlFile::new(Arc::new(BridgeRing::new(bus)));
        let mut handle = control.open().expect("open succeeds");

        let record = record_from_parts(STATUS_PENDING, b"echo hi").expect("fits");
        handle.set_msg(&record).expect("set_msg succeeds");
        assert_eq!(*seen.lock(), vec!["echo hi".to_string()]);

        // get_msg reads the record now at the consumer cursor in full.
        let mut out = [0u8; BRIDGE_RECORD_LEN];
        assert_eq!(handle.get_msg(&mut out), BRIDGE_RECORD_LEN);

        // The plain read path honors the handle's own offset.
        let mut buf = [0u8; 8];
        assert_eq!(handle.read(&mut buf), 8);
    }
}
