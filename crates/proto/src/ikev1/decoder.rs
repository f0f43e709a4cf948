//! Payload decoder
//!
//! Walks the linked next-payload chain of a message body against the
//! selected transition's required/optional payload sets, validates
//! each payload against its descriptor, chains same-typed payloads in
//! arrival order, and enforces the RFC 2409 ordering constraints:
//! SA first in Phase 1, HASH first and SA contiguous in Quick Mode,
//! and Quick Mode identities in adjacent pairs.

use super::constants::{NotifyType, PayloadType};
use super::microcode::{PayloadSet, SmfFlags, Transition};
use super::payload::{descriptor, MessageDigest, PayloadDigest, PayloadHeader};
use super::state::State;
use tracing::{debug, warn};

/// How a rejected message is reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    /// Send this notification (plaintext messages only; the caller
    /// suppresses it for encrypted input)
    Notify(NotifyType),
}

/// Payload types acceptable in any message regardless of the
/// transition's masks
fn always_acceptable() -> PayloadSet {
    PayloadSet::of(&[
        PayloadType::VendorId,
        PayloadType::Notification,
        PayloadType::Delete,
        PayloadType::CertRequest,
        PayloadType::Certificate,
    ])
}

/// Walk and validate the payload chain
///
/// `nat_t_active` gates the NAT-D / NAT-OA payloads: they are only
/// acceptable once the SA has negotiated the RFC NAT-T method, and
/// never in Aggressive Mode.
///
/// # Errors
///
/// Returns the notification that describes the rejection; the caller
/// drops silently instead when the message was encrypted.
pub fn decode_payloads(
    md: &mut MessageDigest,
    transition: &'static Transition,
    from_state: State,
    nat_t_active: bool,
) -> Result<(), DecodeError> {
    if md.parsed {
        return Ok(()); // resumed transition; the walk already ran
    }

    let mut np = md.hdr.next_payload;
    let mut cursor = 0usize;
    let mut needed = transition.required;
    let acceptable = transition
        .required
        .union(transition.optional)
        .union(always_acceptable());

    // A garbled first encrypted input under PSK usually means the
    // secrets disagree; say so instead of a bare parse error.
    let mut excuse = if transition.has(SmfFlags::FIRST_ENCRYPTED_INPUT)
        && transition.auth.matches(super::constants::AuthMethod::PreSharedKey)
    {
        "probable authentication failure (mismatch of preshared secrets?): "
    } else {
        ""
    };

    while np != 0 {
        let mut payload_type = match PayloadType::from_u8(np) {
            Some(t) => t,
            None => {
                warn!(
                    "{}message ignored because it contains an unknown payload type ({}) at the outermost level",
                    excuse, np
                );
                return Err(DecodeError::Notify(NotifyType::InvalidPayloadType));
            }
        };

        // Draft NAT payload numbers share the RFC wire format; rewrite
        // and carry on.
        payload_type = match payload_type {
            PayloadType::NatDDrafts => PayloadType::NatD,
            PayloadType::NatOaDrafts => PayloadType::NatOa,
            t => t,
        };

        // Group-DOI SAK, abused by ancient NAT drafts: skip, do not
        // reject.
        if payload_type == PayloadType::Sak {
            let rest = &md.body[cursor..];
            let hdr = PayloadHeader::from_bytes(rest).map_err(|_| {
                warn!("{}malformed payload in packet", excuse);
                DecodeError::Notify(NotifyType::PayloadMalformed)
            })?;
            if hdr.length as usize > rest.len() {
                warn!("{}malformed payload in packet", excuse);
                return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
            }
            warn!("message with unsupported SAK payload ignored");
            np = hdr.next_payload;
            cursor += hdr.length as usize;
            continue;
        }

        if matches!(payload_type, PayloadType::NatD | PayloadType::NatOa) && !nat_t_active {
            warn!(
                "{}message ignored because it contains a NAT payload but RFC NAT-T was not negotiated",
                excuse
            );
            return Err(DecodeError::Notify(NotifyType::InvalidPayloadType));
        }

        let desc = match descriptor(payload_type) {
            Some(d) => d,
            None => {
                warn!(
                    "{}message ignored because it contains an unexpected payload type ({:?}) at the outermost level",
                    excuse, payload_type
                );
                return Err(DecodeError::Notify(NotifyType::InvalidPayloadType));
            }
        };

        if !acceptable.contains(payload_type) {
            warn!(
                "{}message ignored because it contains a payload type ({}) unexpected by state {}",
                excuse,
                desc.name,
                from_state.name()
            );
            return Err(DecodeError::Notify(NotifyType::InvalidPayloadType));
        }

        let rest = &md.body[cursor..];
        let hdr = PayloadHeader::from_bytes(rest).map_err(|_| {
            warn!("{}malformed payload in packet", excuse);
            DecodeError::Notify(NotifyType::PayloadMalformed)
        })?;
        let len = hdr.length as usize;
        if len > rest.len() || len < 4 + desc.min_len {
            warn!("{}malformed payload in packet", excuse);
            return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
        }

        debug!(payload = desc.name, len, "got payload");
        needed.remove(payload_type);

        let pd = PayloadDigest {
            payload_type,
            start: cursor,
            body: cursor + 4..cursor + len,
        };
        md.push_payload(pd).map_err(|_| {
            warn!("too many payloads in message; ignored");
            DecodeError::Notify(NotifyType::PayloadMalformed)
        })?;

        np = hdr.next_payload;
        cursor += len;

        // one payload digested fine, so decryption evidently worked
        excuse = "";
    }

    if cursor < md.body.len() {
        debug!(bytes = md.body.len() - cursor, "removing padding");
    }
    md.parsed_len = cursor;

    if !needed.is_empty() {
        warn!(
            state = from_state.name(),
            missing = ?needed.names(),
            "message is missing required payloads"
        );
        return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
    }

    check_ordering(md, from_state)?;

    md.parsed = true;
    Ok(())
}

/// RFC 2409 payload ordering constraints, applied after the walk
fn check_ordering(md: &MessageDigest, from_state: State) -> Result<(), DecodeError> {
    if from_state.is_phase1() || from_state.is_phase15() {
        // "The SA payload MUST precede all other payloads in a phase 1
        //  exchange."
        if md.chain_first(PayloadType::Sa).is_some()
            && md.hdr.next_payload != PayloadType::Sa.to_u8()
        {
            warn!("malformed Phase 1 message: does not start with an SA payload");
            return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
        }
    } else if from_state.is_quick() {
        // "a HASH payload MUST immediately follow the ISAKMP header
        //  and a SA payload MUST immediately follow the HASH"
        if md.hdr.next_payload != PayloadType::Hash.to_u8() {
            warn!("malformed Quick Mode message: does not start with a HASH payload");
            return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
        }

        for (i, &pos) in md.positions(PayloadType::Sa).iter().enumerate() {
            if pos != i + 1 {
                warn!("malformed Quick Mode message: SA payload is in wrong position");
                return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
            }
        }

        // "the identities of the parties MUST be passed as IDci and
        //  then IDcr" -- none, or exactly two adjacent
        let ids = md.positions(PayloadType::Identification);
        if !ids.is_empty() {
            if ids.len() != 2 {
                warn!(
                    "malformed Quick Mode message: if any ID payload is present, there must be exactly two"
                );
                return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
            }
            if ids[1] != ids[0] + 1 {
                warn!("malformed Quick Mode message: the ID payloads are not adjacent");
                return Err(DecodeError::Notify(NotifyType::PayloadMalformed));
            }
        }
    }
    Ok(())
}

// Vendor IDs recognized in Phase 1 exchanges. Matching is by prefix so
// versioned VIDs (DPD carries major/minor in the tail) still hit.

/// draft-ietf-ipsec-dpd-04 vendor ID (first 12 bytes; tail is version)
const VID_DPD: [u8; 12] = [
    0xaf, 0xca, 0xd7, 0x13, 0x68, 0xa1, 0xf1, 0xc9, 0x6b, 0x86, 0x96, 0xfc,
];

/// IKE fragmentation vendor ID
const VID_FRAGMENTATION: [u8; 16] = [
    0x40, 0x48, 0xb7, 0xd5, 0x6e, 0xbc, 0xe8, 0x85, 0x25, 0xe7, 0xde, 0x7f, 0x00, 0xd6, 0xc2,
    0xd3,
];

/// MD5("RFC 3947"), the NAT-T RFC vendor ID
const VID_NATT_RFC: [u8; 16] = [
    0x4a, 0x13, 0x1c, 0x81, 0x07, 0x03, 0x58, 0x45, 0x5c, 0x57, 0x28, 0xf2, 0x0e, 0x95, 0x45,
    0x2f,
];

/// Nortel Contivity client marker
const VID_NORTEL: [u8; 4] = [0x42, 0x4e, 0x45, 0x53]; // "BNES"

/// Recognize vendor ID payloads and latch the peer capability flags
/// on the digest; the dispatcher imports them into the SA only when
/// the transition commits.
pub fn scan_vendor_ids(md: &mut MessageDigest) {
    let mut fragvid = false;
    let mut dpd = false;
    let mut natt = false;
    let mut nortel = false;
    for pd in md.chain(PayloadType::VendorId) {
        let bytes = md.payload_bytes(pd);
        if bytes.starts_with(&VID_DPD) {
            dpd = true;
        } else if bytes.starts_with(&VID_FRAGMENTATION) {
            fragvid = true;
        } else if bytes.starts_with(&VID_NATT_RFC) {
            natt = true;
        } else if bytes.starts_with(&VID_NORTEL) {
            nortel = true;
        } else {
            debug!(vid = %hex::encode(&bytes[..bytes.len().min(16)]), "ignoring unknown vendor ID");
        }
    }
    md.dpd_vid |= dpd;
    md.fragvid |= fragvid;
    md.natt_rfc_vid |= natt;
    md.nortel_vid |= nortel;
}

/// Serialized bodies of the vendor IDs we announce
pub fn our_vendor_ids(fragmentation: bool, nat_t: bool) -> Vec<Vec<u8>> {
    let mut out = Vec::new();
    let mut dpd = VID_DPD.to_vec();
    dpd.extend_from_slice(&[0x77, 0x57, 0x01, 0x00]);
    out.push(dpd);
    if fragmentation {
        out.push(VID_FRAGMENTATION.to_vec());
    }
    if nat_t {
        out.push(VID_NATT_RFC.to_vec());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::constants::ExchangeType;
    use crate::ikev1::message::{IsakmpHeader, MessageBuilder};
    use crate::ikev1::microcode::select;

    fn digest(builder: MessageBuilder) -> MessageDigest {
        let packet = builder.build();
        let hdr = IsakmpHeader::from_bytes(&packet).unwrap();
        MessageDigest::new(
            packet,
            hdr,
            "192.0.2.1:500".parse().unwrap(),
            "192.0.2.2:500".parse().unwrap(),
        )
    }

    fn main_r0_digest(payloads: &[(PayloadType, Vec<u8>)]) -> MessageDigest {
        let mut b = MessageBuilder::new([1; 8], [0; 8], ExchangeType::IdProt, 0);
        for (t, body) in payloads {
            b.add_payload(*t, body.clone());
        }
        digest(b)
    }

    #[test]
    fn test_accepts_required_and_optional() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[
            (PayloadType::Sa, vec![0; 8]),
            (PayloadType::VendorId, vec![1; 8]),
        ]);
        decode_payloads(&mut md, t, State::MainR0, false).unwrap();
        assert!(md.parsed);
        assert_eq!(md.chain_len(PayloadType::Sa), 1);
        assert_eq!(md.chain_len(PayloadType::VendorId), 1);
    }

    #[test]
    fn test_missing_required_payload() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[(PayloadType::VendorId, vec![1; 8])]);
        let err = decode_payloads(&mut md, t, State::MainR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));
    }

    #[test]
    fn test_unknown_payload_type() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[(PayloadType::Sa, vec![0; 8])]);
        md.hdr.next_payload = 250;
        let err = decode_payloads(&mut md, t, State::MainR0, false);
        assert_eq!(
            err,
            Err(DecodeError::Notify(NotifyType::InvalidPayloadType))
        );
    }

    #[test]
    fn test_unexpected_payload_type() {
        let t = select(State::MainR0, None).unwrap();
        // Hash is neither required nor optional for MAIN_R0 and not
        // in the always-acceptable set
        let mut md = main_r0_digest(&[
            (PayloadType::Sa, vec![0; 8]),
            (PayloadType::Hash, vec![1; 20]),
        ]);
        let err = decode_payloads(&mut md, t, State::MainR0, false);
        assert_eq!(
            err,
            Err(DecodeError::Notify(NotifyType::InvalidPayloadType))
        );
    }

    #[test]
    fn test_nat_d_requires_negotiated_nat_t() {
        let t = select(State::MainR1, Some(crate::ikev1::constants::AuthMethod::PreSharedKey))
            .unwrap();
        let payloads = [
            (PayloadType::KeyExchange, vec![0; 16]),
            (PayloadType::Nonce, vec![0; 16]),
            (PayloadType::NatD, vec![0; 20]),
        ];
        let mut md = main_r0_digest(&payloads);
        let err = decode_payloads(&mut md, t, State::MainR1, false);
        assert_eq!(
            err,
            Err(DecodeError::Notify(NotifyType::InvalidPayloadType))
        );

        let mut md = main_r0_digest(&payloads);
        decode_payloads(&mut md, t, State::MainR1, true).unwrap();
        assert_eq!(md.chain_len(PayloadType::NatD), 1);
    }

    #[test]
    fn test_draft_nat_numbers_are_remapped() {
        let t = select(State::MainR1, Some(crate::ikev1::constants::AuthMethod::PreSharedKey))
            .unwrap();
        let mut md = main_r0_digest(&[
            (PayloadType::KeyExchange, vec![0; 16]),
            (PayloadType::Nonce, vec![0; 16]),
            (PayloadType::NatDDrafts, vec![0; 20]),
        ]);
        decode_payloads(&mut md, t, State::MainR1, true).unwrap();
        assert_eq!(md.chain_len(PayloadType::NatD), 1);
        assert_eq!(md.chain_len(PayloadType::NatDDrafts), 0);
    }

    #[test]
    fn test_sak_payload_is_skipped() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[
            (PayloadType::Sa, vec![0; 8]),
            (PayloadType::Sak, vec![0xAA; 8]),
            (PayloadType::VendorId, vec![1; 4]),
        ]);
        decode_payloads(&mut md, t, State::MainR0, false).unwrap();
        assert_eq!(md.chain_len(PayloadType::VendorId), 1);
        assert_eq!(md.payloads().len(), 2); // SAK not kept
    }

    #[test]
    fn test_phase1_sa_must_come_first() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[
            (PayloadType::VendorId, vec![1; 8]),
            (PayloadType::Sa, vec![0; 8]),
        ]);
        let err = decode_payloads(&mut md, t, State::MainR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));
    }

    #[test]
    fn test_quick_mode_must_start_with_hash() {
        let t = select(State::QuickR0, None).unwrap();
        let mut b = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, 7);
        b.add_payload(PayloadType::Sa, vec![0; 8]);
        b.add_payload(PayloadType::Hash, vec![0; 20]);
        b.add_payload(PayloadType::Nonce, vec![0; 16]);
        let mut md = digest(b);
        let err = decode_payloads(&mut md, t, State::QuickR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));
    }

    #[test]
    fn test_quick_mode_id_pair_rules() {
        let t = select(State::QuickR0, None).unwrap();

        // exactly two adjacent IDs are fine
        let mut b = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, 7);
        b.add_payload(PayloadType::Hash, vec![0; 20]);
        b.add_payload(PayloadType::Sa, vec![0; 8]);
        b.add_payload(PayloadType::Nonce, vec![0; 16]);
        b.add_payload(PayloadType::Identification, vec![4, 0, 0, 0, 1, 2, 3, 4]);
        b.add_payload(PayloadType::Identification, vec![4, 0, 0, 0, 5, 6, 7, 8]);
        let mut md = digest(b);
        decode_payloads(&mut md, t, State::QuickR0, false).unwrap();

        // a single ID is malformed
        let mut b = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, 7);
        b.add_payload(PayloadType::Hash, vec![0; 20]);
        b.add_payload(PayloadType::Sa, vec![0; 8]);
        b.add_payload(PayloadType::Nonce, vec![0; 16]);
        b.add_payload(PayloadType::Identification, vec![4, 0, 0, 0, 1, 2, 3, 4]);
        let mut md = digest(b);
        let err = decode_payloads(&mut md, t, State::QuickR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));

        // separated IDs are malformed
        let mut b = MessageBuilder::new([1; 8], [2; 8], ExchangeType::Quick, 7);
        b.add_payload(PayloadType::Hash, vec![0; 20]);
        b.add_payload(PayloadType::Sa, vec![0; 8]);
        b.add_payload(PayloadType::Identification, vec![4, 0, 0, 0, 1, 2, 3, 4]);
        b.add_payload(PayloadType::Nonce, vec![0; 16]);
        b.add_payload(PayloadType::Identification, vec![4, 0, 0, 0, 5, 6, 7, 8]);
        let mut md = digest(b);
        let err = decode_payloads(&mut md, t, State::QuickR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let t = select(State::MainR0, None).unwrap();
        let mut md = main_r0_digest(&[(PayloadType::Sa, vec![0; 8])]);
        // lie about the SA payload length
        md.body[2] = 0xFF;
        md.body[3] = 0xFF;
        let err = decode_payloads(&mut md, t, State::MainR0, false);
        assert_eq!(err, Err(DecodeError::Notify(NotifyType::PayloadMalformed)));
    }

    #[test]
    fn test_vendor_id_scan() {
        let t = select(State::MainR0, None).unwrap();
        let mut vids = our_vendor_ids(true, true);
        vids.push(b"unknown-vendor".to_vec());
        let mut b = MessageBuilder::new([1; 8], [0; 8], ExchangeType::IdProt, 0);
        b.add_payload(PayloadType::Sa, vec![0; 8]);
        for vid in vids {
            b.add_payload(PayloadType::VendorId, vid);
        }
        let mut md = digest(b);
        decode_payloads(&mut md, t, State::MainR0, false).unwrap();
        scan_vendor_ids(&mut md);
        assert!(md.dpd_vid);
        assert!(md.fragvid);
        assert!(md.natt_rfc_vid);
        assert!(!md.nortel_vid);
    }
}
