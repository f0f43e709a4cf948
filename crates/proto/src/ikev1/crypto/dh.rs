//! Diffie-Hellman group bookkeeping and loopback backends
//!
//! The engine never exponentiates; it hands group and public values to
//! a [`DhBackend`] and suspends when the backend answers `Pending`.
//! Two loopback backends live here for tests and examples: one that
//! completes inline and one that parks every agreement so suspension
//! and resumption can be driven explicitly.

use oakley_platform::{DhBackend, DhOutcome, OakleyError, OakleyResult};
use rand::RngCore;
use std::collections::HashMap;

/// Oakley MODP groups (RFC 2409 Section 6, RFC 3526)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DhGroup {
    /// Group 2: 1024-bit MODP
    Modp1024,
    /// Group 5: 1536-bit MODP
    Modp1536,
    /// Group 14: 2048-bit MODP
    Modp2048,
}

impl DhGroup {
    /// Convert from the Oakley group description number
    pub fn from_group_number(value: u16) -> Option<Self> {
        match value {
            2 => Some(DhGroup::Modp1024),
            5 => Some(DhGroup::Modp1536),
            14 => Some(DhGroup::Modp2048),
            _ => None,
        }
    }

    /// The Oakley group description number
    pub fn group_number(self) -> u16 {
        match self {
            DhGroup::Modp1024 => 2,
            DhGroup::Modp1536 => 5,
            DhGroup::Modp2048 => 14,
        }
    }

    /// Public value length in bytes
    pub fn public_len(self) -> usize {
        match self {
            DhGroup::Modp1024 => 128,
            DhGroup::Modp1536 => 192,
            DhGroup::Modp2048 => 256,
        }
    }
}

/// Loopback backend: both peers derive the shared value by XORing the
/// two public values, so agreement is symmetric and deterministic.
///
/// Provides no security whatsoever; for tests and wiring examples
/// only.
#[derive(Debug, Default)]
pub struct XorDhBackend {
    publics: HashMap<u64, Vec<u8>>,
}

impl XorDhBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }
}

fn xor_shared(ours: &[u8], theirs: &[u8]) -> OakleyResult<Vec<u8>> {
    if ours.len() != theirs.len() {
        return Err(OakleyError::Protocol(format!(
            "peer public value is {} bytes, ours is {}",
            theirs.len(),
            ours.len()
        )));
    }
    Ok(ours.iter().zip(theirs).map(|(a, b)| a ^ b).collect())
}

impl DhBackend for XorDhBackend {
    fn generate(&mut self, group: u16, token: u64) -> OakleyResult<Vec<u8>> {
        let group = DhGroup::from_group_number(group)
            .ok_or_else(|| OakleyError::NotImplemented(format!("DH group {}", group)))?;
        let mut public = vec![0u8; group.public_len()];
        rand::thread_rng().fill_bytes(&mut public);
        self.publics.insert(token, public.clone());
        Ok(public)
    }

    fn agree(&mut self, token: u64, peer_public: &[u8]) -> OakleyResult<DhOutcome> {
        let ours = self
            .publics
            .get(&token)
            .ok_or_else(|| OakleyError::Protocol(format!("no DH keypair for token {}", token)))?;
        Ok(DhOutcome::Ready(xor_shared(ours, peer_public)?))
    }

    fn cancel(&mut self, token: u64) {
        self.publics.remove(&token);
    }
}

/// Loopback backend that never completes inline
///
/// Every agreement is parked; `complete_next` pops the oldest one and
/// returns the token and shared secret for delivery to the engine.
#[derive(Debug, Default)]
pub struct DeferredDhBackend {
    inner: XorDhBackend,
    queued: Vec<(u64, Vec<u8>)>,
}

impl DeferredDhBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete the oldest parked agreement
    pub fn complete_next(&mut self) -> Option<(u64, Vec<u8>)> {
        if self.queued.is_empty() {
            return None;
        }
        let (token, peer_public) = self.queued.remove(0);
        let ours = self.inner.publics.get(&token)?;
        let shared = xor_shared(ours, &peer_public).ok()?;
        Some((token, shared))
    }

    /// Number of parked agreements
    pub fn pending(&self) -> usize {
        self.queued.len()
    }
}

impl DhBackend for DeferredDhBackend {
    fn generate(&mut self, group: u16, token: u64) -> OakleyResult<Vec<u8>> {
        self.inner.generate(group, token)
    }

    fn agree(&mut self, token: u64, peer_public: &[u8]) -> OakleyResult<DhOutcome> {
        if !self.inner.publics.contains_key(&token) {
            return Err(OakleyError::Protocol(format!(
                "no DH keypair for token {}",
                token
            )));
        }
        // drop any older request for the same SA; the newest wins
        self.queued.retain(|(t, _)| *t != token);
        self.queued.push((token, peer_public.to_vec()));
        Ok(DhOutcome::Pending)
    }

    fn cancel(&mut self, token: u64) {
        self.inner.cancel(token);
        self.queued.retain(|(t, _)| *t != token);
    }
}
