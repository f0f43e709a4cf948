//! Protocol implementations for the Oakley VPN engine.
//!
//! This crate provides the IKEv1 (Internet Key Exchange version 1)
//! protocol engine:
//!
//! - **Phase 1** - Main Mode and Aggressive Mode ISAKMP SA negotiation
//! - **Phase 2** - Quick Mode IPsec SA negotiation
//! - **Phase 1.5** - XAUTH and Mode Config side channels
//! - **Informational** - Delete, DPD, and notification processing
//!
//! # Example
//!
//! ```rust
//! use oakley_proto::ikev1::message::IsakmpHeader;
//!
//! // Parse an ISAKMP header from the wire
//! let mut raw = vec![0u8; 28];
//! raw[0] = 0x01; // initiator cookie
//! raw[17] = 0x10; // IKEv1
//! raw[18] = 2; // Main Mode
//! raw[24..28].copy_from_slice(&28u32.to_be_bytes());
//! let hdr = IsakmpHeader::from_bytes(&raw).unwrap();
//! assert_eq!(hdr.message_id, 0);
//! ```
//!
//! # Security
//!
//! - All cryptographic operations use vetted libraries (RustCrypto)
//! - Constant-time HASH comparison via `subtle`
//! - Secure memory handling with `zeroize`
//! - Protocol violations on encrypted input are dropped silently,
//!   never answered
//!
//! # References
//!
//! - [RFC 2408](https://datatracker.ietf.org/doc/html/rfc2408) - ISAKMP
//! - [RFC 2409](https://datatracker.ietf.org/doc/html/rfc2409) - The Internet Key Exchange (IKE)
//! - [RFC 3706](https://datatracker.ietf.org/doc/html/rfc3706) - Dead Peer Detection
//! - [RFC 3947](https://datatracker.ietf.org/doc/html/rfc3947) - NAT-T Negotiation

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod ikev1;
