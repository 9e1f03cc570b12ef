//! hostlink - guest-side host-to-guest command channel
//!
//! hostlink is the guest half of a bidirectional command/control channel: a
//! privileged host submits fixed-width command records over a queue pair and
//! the guest answers with typed responses, one outstanding request at a
//! time.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────┐
//! │  host (out of scope)                             │
//! ├──────────────────────────────────────────────────┤
//! │  queue pair: "get command" / "return result"     │
//! ├──────────────────────────────────────────────────┤
//! │  Transport (submit / kick / await-ack)           │
//! ├──────────────────────────────────────────────────┤
//! │  Channel: receive task → dispatch task           │
//! │    ├─ plugin registry (slots 0 and 1)            │
//! │    ├─ completion ring (host polls, command 3)    │
//! │    └─ bridge ring ⇄ control endpoint             │
//! └──────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use hostlink::{Channel, ChannelConfig, ControlFile};
//!
//! let (backend, _host) = hostlink::transport::loopback();
//! let config = ChannelConfig::default();
//! let channel = Channel::attach_production(&config, backend);
//!
//! // A local consumer talks to the channel through the control endpoint.
//! let control = ControlFile::new(channel.bridge());
//! let handle = control.open().unwrap();
//! drop(handle);
//! channel.detach();
//! ```

pub mod bridge;
pub mod channel;
pub mod completion;
pub mod config;
pub mod error;
pub mod events;
pub mod exec;
pub mod memory;
pub mod registry;
pub mod transport;
pub mod worker;

pub use bridge::{BridgeRing, ControlFile, ControlHandle};
pub use channel::{Channel, Collaborators};
pub use completion::CompletionRing;
pub use config::ChannelConfig;
pub use error::{Error, Result};
pub use events::{EventBus, EventKind};
pub use registry::PluginRegistry;
pub use transport::{QueueBackend, Transport, TransportStats};

/// Crate version, for startup diagnostics.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
