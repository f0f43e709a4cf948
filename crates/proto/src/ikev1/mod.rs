//! IKEv1 protocol engine (RFC 2409)
//!
//! A table-driven state machine for ISAKMP Phase 1 (Main and
//! Aggressive Mode), Phase 2 (Quick Mode), Informational exchanges,
//! and the XAUTH / Mode Config side channels.
//!
//! # Architecture
//!
//! ```text
//! UDP datagram
//!   ├── demux        header classification, SA lookup/creation
//!   ├── fragment     reassembly of fragmented messages
//!   ├── hash         decryption, IV chain, HASH(1/2/3) verification
//!   ├── decoder      payload walk against the microcode masks
//!   ├── handlers     per-transition processing
//!   └── dispatch     state advance, timers, replies, teardown
//! ```
//!
//! The [`engine::Engine`] owns all of it, single-threaded: packets,
//! timer firings, and crypto helper completions are fed in by the
//! caller, outbound datagrams are drained from an outbox. The only
//! collaborators are the platform traits (Diffie-Hellman, signatures,
//! kernel SA installation, admin progress).
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use oakley_proto::ikev1::connection::Connection;
//! use oakley_proto::ikev1::crypto::XorDhBackend;
//! use oakley_proto::ikev1::engine::{Engine, EngineConfig};
//! use oakley_platform::{ChildSaInstall, IpsecInstaller, OakleyResult};
//! use std::time::Instant;
//!
//! struct NullKernel;
//! impl IpsecInstaller for NullKernel {
//!     fn install(&mut self, _sa: &ChildSaInstall) -> OakleyResult<()> { Ok(()) }
//!     fn remove(&mut self, _spi: u32, _protocol: u8) -> OakleyResult<()> { Ok(()) }
//! }
//!
//! let mut engine = Engine::new(
//!     EngineConfig::default(),
//!     Box::new(XorDhBackend::new()),
//!     Box::new(NullKernel),
//! );
//! let conn = engine.add_connection(
//!     Connection::builder("peer")
//!         .with_psk(b"secret")
//!         .with_peer_addr("192.0.2.1:500".parse().unwrap())
//!         .build()
//!         .unwrap(),
//! );
//! engine.initiate(Instant::now(), conn).unwrap();
//! for dgram in engine.drain_outbox() {
//!     // hand dgram.bytes to the UDP socket
//!     let _ = dgram;
//! }
//! ```

pub mod connection;
pub mod constants;
pub mod crypto;
pub mod decoder;
pub mod demux;
pub mod dispatch;
pub mod dpd;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod handlers;
pub mod hash;
pub mod ident;
pub mod informational;
pub mod message;
pub mod microcode;
pub mod payload;
pub mod proposal;
pub mod sa;
pub mod service;
pub mod state;

pub use connection::{Connection, ConnectionId};
pub use engine::{Datagram, Engine, EngineConfig, EventKind};
pub use error::{Error, Result};
pub use sa::SerialNo;
pub use state::State;
