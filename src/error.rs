//! Error types for hostlink.
//!
//! Error messages are lowercase and follow the `<operation> failed: <reason>`
//! form so log lines compose cleanly. Only transport attach failures are
//! fatal to a channel instance; everything else is local and recoverable.

use hostlink_protocol::ProtocolError;
use thiserror::Error;

/// Result type alias using hostlink's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in hostlink operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Queue-pair setup or feature negotiation failed at attach time.
    /// Fatal to the channel instance; surfaced to the caller, never retried.
    #[error("channel attach failed: {0}")]
    Attach(String),

    /// The queue backend reported a failure while arming, taking, or
    /// pushing a frame.
    #[error("queue backend failed: {0}")]
    Backend(String),

    /// A blocking submit was not acknowledged within the configured window.
    #[error("acknowledgment wait failed: timed out after {timeout_ms} ms")]
    AckTimeout {
        /// The configured wait window, in milliseconds.
        timeout_ms: u64,
    },

    /// The channel was detached while a submit was waiting for its ack.
    #[error("acknowledgment wait failed: channel detached")]
    Detached,

    /// A plugin slot index outside the slot table was addressed.
    #[error("plugin slot {slot} out of range (table holds {capacity})")]
    SlotOutOfRange {
        /// The offending slot index.
        slot: usize,
        /// Number of slots in the table.
        capacity: usize,
    },

    /// The control endpoint is already held open by another consumer.
    #[error("control endpoint busy")]
    Busy,

    /// A wire record failed to encode or decode.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
