//! Collaborator traits for the Oakley protocol core
//!
//! The IKEv1 engine delegates everything that is not protocol state to
//! these traits: Diffie-Hellman and signature computation (which may run
//! on helper threads), kernel IPsec SA installation, and progress
//! reporting towards the admin channel. Implementations post completions
//! back to the engine's event loop; they never touch SA state directly.

use crate::OakleyResult;
use std::net::SocketAddr;

/// Outcome of a Diffie-Hellman agreement request.
///
/// `Pending` means the backend has queued the computation on a helper;
/// the engine suspends the transition and resumes when the completion
/// is delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DhOutcome {
    /// Shared secret is available now
    Ready(Vec<u8>),
    /// Computation queued; completion will be posted later
    Pending,
}

/// Diffie-Hellman backend
///
/// `token` identifies the owning IKE SA (its serial number); a backend
/// keeps at most one keypair per token, matching the engine's invariant
/// of one in-flight helper per SA.
pub trait DhBackend: Send {
    /// Generate a keypair for the given MODP group, returning the public value
    ///
    /// # Errors
    ///
    /// Returns an error if the group is unsupported.
    fn generate(&mut self, group: u16, token: u64) -> OakleyResult<Vec<u8>>;

    /// Combine the keypair identified by `token` with the peer's public value
    ///
    /// # Errors
    ///
    /// Returns an error if no keypair exists for `token` or the peer
    /// value is malformed.
    fn agree(&mut self, token: u64, peer_public: &[u8]) -> OakleyResult<DhOutcome>;

    /// Drop any keypair held for `token` (SA deleted, helper cancelled)
    fn cancel(&mut self, token: u64);
}

/// Outcome of a signature generation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SigOutcome {
    /// Signature bytes are available now
    Ready(Vec<u8>),
    /// Computation queued; completion will be posted later
    Pending,
}

/// Outcome of a signature verification request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyOutcome {
    /// Signature is valid
    Valid,
    /// Signature is invalid
    Invalid,
    /// Computation queued; completion will be posted later
    Pending,
}

/// Signature backend for digital-signature authentication
pub trait SigBackend: Send {
    /// Sign `data` with the local private key for the SA `token`
    ///
    /// # Errors
    ///
    /// Returns an error if no usable key is configured.
    fn sign(&mut self, token: u64, data: &[u8]) -> OakleyResult<SigOutcome>;

    /// Verify `sig` over `data` against the peer credentials for `token`
    ///
    /// # Errors
    ///
    /// Returns an error if peer credentials are unavailable.
    fn verify(&mut self, token: u64, data: &[u8], sig: &[u8]) -> OakleyResult<VerifyOutcome>;

    /// Drop any pending work for `token`
    fn cancel(&mut self, token: u64);
}

/// Parameters for one direction of a negotiated IPsec SA
///
/// Produced by Quick Mode; consumed by the kernel driver.
#[derive(Debug, Clone)]
pub struct ChildSaInstall {
    /// Security Parameter Index
    pub spi: u32,
    /// IPsec protocol (50 = ESP, 51 = AH)
    pub protocol: u8,
    /// True for the inbound SA
    pub inbound: bool,
    /// Local tunnel endpoint
    pub local: SocketAddr,
    /// Remote tunnel endpoint
    pub peer: SocketAddr,
    /// Keying material for the SA
    pub keymat: Vec<u8>,
    /// Negotiated lifetime in seconds
    pub lifetime_seconds: u64,
}

/// Kernel IPsec SA installation interface
pub trait IpsecInstaller: Send {
    /// Install one direction of an IPsec SA
    ///
    /// # Errors
    ///
    /// Returns an error if the kernel rejects the SA.
    fn install(&mut self, sa: &ChildSaInstall) -> OakleyResult<()>;

    /// Remove an installed SA by SPI and protocol
    ///
    /// # Errors
    ///
    /// Returns an error if the SA cannot be removed.
    fn remove(&mut self, spi: u32, protocol: u8) -> OakleyResult<()>;
}

/// Progress reporting towards the admin channel
///
/// Codes follow the 3-digit scheme of the admin interface: values below
/// 100 are progress/error classes, 100-199 encode new-state progress,
/// 200 and up carry notification codes.
pub trait EventSink: Send {
    /// Report progress for the SA identified by `serial`
    fn progress(&mut self, serial: u64, code: u16, message: &str);
}

/// No-op sink for deployments without an admin channel
impl EventSink for () {
    fn progress(&mut self, _serial: u64, _code: u16, _message: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    struct RecordingSink(Vec<(u64, u16, String)>);

    impl EventSink for RecordingSink {
        fn progress(&mut self, serial: u64, code: u16, message: &str) {
            self.0.push((serial, code, message.to_string()));
        }
    }

    #[test]
    fn test_event_sink() {
        let mut sink = RecordingSink(Vec::new());
        sink.progress(1, 120, "STATE_MAIN_R1");
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].1, 120);
    }

    #[test]
    fn test_null_sink() {
        let mut sink = ();
        sink.progress(7, 200, "notification");
    }

    #[test]
    fn test_dh_outcome() {
        let ready = DhOutcome::Ready(vec![1, 2, 3]);
        assert_ne!(ready, DhOutcome::Pending);
    }
}
