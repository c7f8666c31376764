//! # PeerBridge Transport
//!
//! Peer transport abstraction for PeerBridge.
//!
//! The peer transport is the platform layer that advertises a service,
//! browses for peers offering it, opens a bidirectional byte-stream session
//! with a discovered peer, and carries small out-of-band signals. It has no
//! notion of TCP ports; bridging that gap is the job of `peerbridge-core`.
//!
//! This crate provides:
//! - The [`PeerTransport`] capability trait and its event types
//! - [`TransportSession`], the per-link event stream and close handle
//! - [`memory::MemoryNetwork`], an in-process transport used by tests and the
//!   CLI demo, with support for asymmetric dialing and link severing

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod memory;
pub mod transport;

pub use memory::{MemoryNetwork, MemoryTransport};
pub use transport::{
    AdvertiseEvent, BrowseEvent, InputStream, LinkControl, LinkState, OutputStream, PeerHandle,
    PeerTransport, SessionEvent, StreamPair, TransportError, TransportResult, TransportSession,
};

/// Default in-memory stream buffer (matches a typical platform socket buffer)
pub const DEFAULT_STREAM_BUFFER: usize = 64 * 1024;
