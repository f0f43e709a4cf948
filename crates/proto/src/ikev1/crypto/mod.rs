//! Cryptographic building blocks for the IKEv1 engine
//!
//! PRF and SKEYID derivation (RFC 2409 Section 5), CBC bulk
//! encryption (RFC 2409 Appendix B), and the Diffie-Hellman backend
//! seam. Real public-key primitives live behind the platform traits;
//! only the symmetric parts the state machine cannot do without are
//! implemented here.

pub mod cipher;
pub mod dh;
pub mod prf;

pub use cipher::CipherAlgorithm;
pub use dh::{DeferredDhBackend, DhGroup, XorDhBackend};
pub use prf::{skeyid_psk, skeyid_sig, KeyMaterial, PrfAlgorithm};
