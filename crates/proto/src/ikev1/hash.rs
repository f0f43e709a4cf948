//! The integrity gate: decryption, IV chains, and HASH verification
//!
//! Encrypted inbound bodies are decrypted in place under the IV chain
//! of RFC 2409 Appendix B; messages protected by HASH(1/2/3) are
//! verified against SKEYID_a before any state advances. A mismatch is
//! a silent drop, never a notification.

use super::crypto::PrfAlgorithm;
use super::error::{Error, Result};
use super::microcode::HashType;
use super::payload::MessageDigest;
use super::sa::IkeSa;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

/// Derive the initial Phase 2 IV for a message id
///
/// ```text
/// IV = hash(last Phase 1 IV | M-ID)
/// ```
/// truncated to the cipher block size.
pub fn phase2_iv(prf: PrfAlgorithm, phase1_iv: &[u8], msgid: u32, block_size: usize) -> Vec<u8> {
    let mut iv = prf.digest(&[phase1_iv, &msgid.to_be_bytes()]);
    iv.truncate(block_size);
    iv
}

/// Derive the initial Phase 1 IV once the DH publics are known
///
/// ```text
/// IV = hash(g^xi | g^xr)
/// ```
pub fn phase1_initial_iv(prf: PrfAlgorithm, g_xi: &[u8], g_xr: &[u8], block_size: usize) -> Vec<u8> {
    let mut iv = prf.digest(&[g_xi, g_xr]);
    iv.truncate(block_size);
    iv
}

/// Decrypt an encrypted inbound message body in place
///
/// Selects the working IV (`new_iv` when freshly seeded for a Phase 2
/// message id, the saved `iv` otherwise), decrypts, and leaves the
/// last ciphertext block in `new_iv` so the chain carries forward.
///
/// # Errors
///
/// Returns error when keying material is missing or the body is not a
/// multiple of the cipher block size; both mean the packet is dropped.
pub fn decrypt_inbound(sa: &mut IkeSa, md: &mut MessageDigest) -> Result<()> {
    if md.encrypted {
        return Ok(()); // resumed; already decrypted
    }

    let oakley = sa
        .oakley
        .as_ref()
        .ok_or_else(|| Error::CryptoError("no negotiated cipher".to_string()))?;
    let keymat = sa
        .keymat
        .as_ref()
        .ok_or_else(|| Error::CryptoError("keying material not yet negotiated".to_string()))?;

    let cipher = oakley.cipher;
    let bs = cipher.block_size();

    if md.body.is_empty() || md.body.len() % bs != 0 {
        return Err(Error::CryptoError(format!(
            "message body of {} bytes is not a multiple of the {}-byte blocksize",
            md.body.len(),
            bs
        )));
    }

    if !md.new_iv_set {
        if sa.iv.is_empty() {
            // Phase 2 message id whose IV was not seeded by the
            // demultiplexer (continuation on a fresh child)
            sa.new_iv = phase2_iv(oakley.prf, &sa.phase1_iv, md.hdr.message_id, bs);
        } else {
            sa.new_iv = sa.iv.clone();
        }
    }

    let last_block = md.body[md.body.len() - bs..].to_vec();

    debug!(
        bytes = md.body.len(),
        sa = %sa.serial,
        "decrypting message body"
    );
    cipher.decrypt_in_place(&keymat.enc_key, &sa.new_iv, &mut md.body)?;

    sa.new_iv = last_block;
    md.encrypted = true;
    Ok(())
}

/// Verify the HASH protection a transition declares
///
/// Returns false on mismatch; the caller drops the packet silently.
pub fn check_hash(hash_type: HashType, sa: &IkeSa, md: &MessageDigest) -> bool {
    if hash_type == HashType::None {
        return true;
    }

    let (prf, skeyid_a) = match (sa.prf(), sa.keymat.as_ref()) {
        (Some(prf), Some(km)) => (prf, &km.skeyid_a),
        _ => {
            warn!(sa = %sa.serial, "HASH required but no keying material");
            return false;
        }
    };

    let hash_pd = match md.chain_first(super::constants::PayloadType::Hash) {
        Some(pd) => pd,
        None => return false,
    };
    let received = md.payload_bytes(hash_pd);
    let msgid = md.hdr.message_id.to_be_bytes();

    let expected = match hash_type {
        HashType::None => unreachable!(),
        // HASH(1) = prf(SKEYID_a, M-ID | rest-after-HASH)
        HashType::Hash1 => prf.compute_parts(skeyid_a, &[&msgid, md.bytes_after(hash_pd)]),
        // HASH(2) = prf(SKEYID_a, M-ID | Ni_b | rest-after-HASH)
        HashType::Hash2 => {
            prf.compute_parts(skeyid_a, &[&msgid, &sa.ni, md.bytes_after(hash_pd)])
        }
        // HASH(3) = prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)
        HashType::Hash3 => prf.compute_parts(skeyid_a, &[&[0u8], &msgid, &sa.ni, &sa.nr]),
    };

    if received.len() != expected.len() {
        warn!(
            sa = %sa.serial,
            received = received.len(),
            expected = expected.len(),
            "HASH payload has the wrong length"
        );
        return false;
    }
    if expected.ct_eq(received).into() {
        true
    } else {
        warn!(sa = %sa.serial, "HASH mismatch, dropping message");
        false
    }
}

/// Compute the outbound HASH payload body for a Quick Mode or
/// protected informational message
///
/// `rest` is the serialized payload chain that will follow the HASH
/// payload.
pub fn outbound_hash(
    hash_type: HashType,
    prf: PrfAlgorithm,
    skeyid_a: &[u8],
    msgid: u32,
    ni: &[u8],
    nr: &[u8],
    rest: &[u8],
) -> Vec<u8> {
    let msgid = msgid.to_be_bytes();
    match hash_type {
        HashType::None => Vec::new(),
        HashType::Hash1 => prf.compute_parts(skeyid_a, &[&msgid, rest]),
        HashType::Hash2 => prf.compute_parts(skeyid_a, &[&msgid, ni, rest]),
        HashType::Hash3 => prf.compute_parts(skeyid_a, &[&[0u8], &msgid, ni, nr]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::connection::ConnectionId;
    use crate::ikev1::constants::{ExchangeType, PayloadType};
    use crate::ikev1::crypto::{CipherAlgorithm, DhGroup, KeyMaterial};
    use crate::ikev1::message::{IsakmpHeader, MessageBuilder};
    use crate::ikev1::payload::{MessageDigest, PayloadDigest};
    use crate::ikev1::sa::{IkeSa, OakleyParams, Role, SerialNo};
    use crate::ikev1::state::State;

    fn test_sa() -> IkeSa {
        let mut sa = IkeSa::new(
            SerialNo(1),
            Role::Responder,
            [1; 8],
            [2; 8],
            State::MainR2,
            ConnectionId(0),
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
        );
        let prf = PrfAlgorithm::HmacSha1;
        sa.oakley = Some(OakleyParams {
            auth: crate::ikev1::constants::AuthMethod::PreSharedKey,
            auth_wire: 1,
            cipher: CipherAlgorithm::Aes128Cbc,
            prf,
            group: DhGroup::Modp2048,
            life_seconds: 28800,
            doing_xauth: false,
        });
        let skeyid = crate::ikev1::crypto::skeyid_psk(prf, b"secret", b"ni", b"nr");
        sa.keymat =
            Some(KeyMaterial::derive(prf, skeyid, b"shared", &[1; 8], &[2; 8], 16).unwrap());
        sa.iv = vec![0x33; 16];
        sa
    }

    fn digest_for(packet: Vec<u8>) -> MessageDigest {
        let hdr = IsakmpHeader::from_bytes(&packet).unwrap();
        MessageDigest::new(
            packet,
            hdr,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
        )
    }

    #[test]
    fn test_phase2_iv_is_block_sized_and_keyed_by_msgid() {
        let prf = PrfAlgorithm::HmacSha1;
        let a = phase2_iv(prf, &[0x11; 16], 1, 16);
        let b = phase2_iv(prf, &[0x11; 16], 2, 16);
        assert_eq!(a.len(), 16);
        assert_ne!(a, b);
    }

    #[test]
    fn test_phase1_initial_iv() {
        let prf = PrfAlgorithm::HmacSha1;
        let iv = phase1_initial_iv(prf, b"gxi", b"gxr", 16);
        assert_eq!(iv.len(), 16);
        assert_eq!(iv, prf.digest(&[b"gxi", b"gxr"])[..16].to_vec());
    }

    #[test]
    fn test_decrypt_roundtrip_and_chain() {
        let mut sa = test_sa();
        let enc_key = sa.keymat.as_ref().unwrap().enc_key.clone();

        // build an encrypted message the way a peer would
        let mut peer_iv = sa.iv.clone();
        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::IdProt, 0);
        builder.add_payload(PayloadType::VendorId, vec![0xAB; 12]);
        let packet = builder
            .build_encrypted(CipherAlgorithm::Aes128Cbc, &enc_key, &mut peer_iv)
            .unwrap();

        let mut md = digest_for(packet);
        let cipher_last = md.body[md.body.len() - 16..].to_vec();

        decrypt_inbound(&mut sa, &mut md).unwrap();
        assert!(md.encrypted);
        // first payload is our vendor ID
        assert_eq!(md.body[0], 0);
        assert_eq!(&md.body[4..16], &[0xAB; 12]);
        // chain advanced to the last ciphertext block on both ends
        assert_eq!(sa.new_iv, cipher_last);
        assert_eq!(peer_iv, cipher_last);
    }

    #[test]
    fn test_decrypt_rejects_unaligned_body() {
        let mut sa = test_sa();
        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::IdProt, 0);
        builder.add_payload(PayloadType::VendorId, vec![0xAB; 12]);
        let mut packet = builder.build();
        // declare one stray byte
        let len = (packet.len() + 1) as u32;
        packet.extend_from_slice(&[0]);
        packet[24..28].copy_from_slice(&len.to_be_bytes());

        let mut md = digest_for(packet);
        assert!(decrypt_inbound(&mut sa, &mut md).is_err());
    }

    #[test]
    fn test_decrypt_requires_keymat() {
        let mut sa = test_sa();
        sa.keymat = None;
        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::IdProt, 0);
        builder.add_payload(PayloadType::VendorId, vec![0xAB; 12]);
        let mut md = digest_for(builder.build());
        assert!(decrypt_inbound(&mut sa, &mut md).is_err());
    }

    #[test]
    fn test_hash1_verification() {
        let mut sa = test_sa();
        sa.state = State::InfoProtected;
        let prf = sa.prf().unwrap();
        let skeyid_a = sa.keymat.as_ref().unwrap().skeyid_a.clone();
        let msgid = 0x00000777u32;

        // notification payload after the HASH
        let notify_body = vec![0xEE; 12];
        let rest = {
            let mut b = Vec::new();
            b.push(0);
            b.push(0);
            b.extend_from_slice(&((notify_body.len() + 4) as u16).to_be_bytes());
            b.extend_from_slice(&notify_body);
            b
        };
        let hash = outbound_hash(HashType::Hash1, prf, &skeyid_a, msgid, &[], &[], &rest);

        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Informational, msgid);
        builder.add_payload(PayloadType::Hash, hash.clone());
        builder.add_payload(PayloadType::Notification, notify_body);
        let packet = builder.build();
        let mut md = digest_for(packet);

        // hand-index the two payloads
        let hash_len = hash.len();
        md.push_payload(PayloadDigest {
            payload_type: PayloadType::Hash,
            start: 0,
            body: 4..4 + hash_len,
        })
        .unwrap();
        let n_start = 4 + hash_len;
        md.push_payload(PayloadDigest {
            payload_type: PayloadType::Notification,
            start: n_start,
            body: n_start + 4..n_start + 16,
        })
        .unwrap();

        assert!(check_hash(HashType::Hash1, &sa, &md));

        // flip one byte of the notification: the hash no longer covers it
        md.body[n_start + 5] ^= 0xFF;
        assert!(!check_hash(HashType::Hash1, &sa, &md));
    }

    #[test]
    fn test_hash3_uses_both_nonces() {
        let mut sa = test_sa();
        sa.ni = vec![0x01; 16];
        sa.nr = vec![0x02; 16];
        let prf = sa.prf().unwrap();
        let skeyid_a = sa.keymat.as_ref().unwrap().skeyid_a.clone();
        let msgid = 0xAABBCCDDu32;

        let hash = outbound_hash(
            HashType::Hash3,
            prf,
            &skeyid_a,
            msgid,
            &sa.ni,
            &sa.nr,
            &[],
        );

        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, msgid);
        builder.add_payload(PayloadType::Hash, hash.clone());
        let packet = builder.build();
        let mut md = digest_for(packet);
        md.push_payload(PayloadDigest {
            payload_type: PayloadType::Hash,
            start: 0,
            body: 4..4 + hash.len(),
        })
        .unwrap();

        assert!(check_hash(HashType::Hash3, &sa, &md));

        // a different responder nonce invalidates it
        sa.nr = vec![0x03; 16];
        assert!(!check_hash(HashType::Hash3, &sa, &md));
    }

    #[test]
    fn test_missing_hash_payload_fails() {
        let sa = test_sa();
        let mut builder = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, 7);
        builder.add_payload(PayloadType::Nonce, vec![1; 16]);
        let md = digest_for(builder.build());
        assert!(!check_hash(HashType::Hash1, &sa, &md));
    }
}
