//! ISAKMP payload structures and the message digest
//!
//! Payloads share a 4-byte generic header (RFC 2408 Section 3.2):
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! | Next Payload  |   RESERVED    |         Payload Length        |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The [`MessageDigest`] is the transient per-packet record: the raw
//! bytes, the (possibly decrypted) body, and one chain per payload type
//! into a shared pool of payload digests, preserving arrival order.

use super::constants::{IsakmpFlags, NotifyType, PayloadType, PAYLOAD_CHAIN_SLOTS};
use super::error::{Error, Result};
use super::message::IsakmpHeader;
use super::microcode::Transition;
use super::sa::SerialNo;
use super::state::State;
use std::net::SocketAddr;
use std::ops::Range;

/// Generic payload header size
pub const GENERIC_HEADER_SIZE: usize = 4;

/// Hard cap on payloads per message (size of the digest pool)
pub const MAX_PAYLOADS: usize = 40;

/// Generic payload header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadHeader {
    /// Next payload type (raw octet)
    pub next_payload: u8,
    /// Total payload length including the generic header
    pub length: u16,
}

impl PayloadHeader {
    /// Parse a generic payload header
    ///
    /// # Errors
    ///
    /// Returns error if the buffer is too short or the length field is
    /// smaller than the header itself.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < GENERIC_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: GENERIC_HEADER_SIZE,
                available: data.len(),
            });
        }
        let length = u16::from_be_bytes([data[2], data[3]]);
        if (length as usize) < GENERIC_HEADER_SIZE {
            return Err(Error::InvalidLength {
                expected: GENERIC_HEADER_SIZE,
                actual: length as usize,
            });
        }
        Ok(PayloadHeader {
            next_payload: data[0],
            length,
        })
    }
}

/// Wire-shape description of one payload type
#[derive(Debug, Clone, Copy)]
pub struct PayloadDescriptor {
    /// Payload name, as logged
    pub name: &'static str,
    /// Minimum body length (after the generic header)
    pub min_len: usize,
}

/// Look up the descriptor for a payload type at the outermost level
///
/// Returns `None` for types that cannot appear at the outer level
/// (Proposal and Transform live inside SA payloads) or that need
/// special handling before this point (the fragmentation payload, the
/// abused SAK number, the draft NAT types before remapping).
pub fn descriptor(payload_type: PayloadType) -> Option<PayloadDescriptor> {
    let d = match payload_type {
        PayloadType::Sa => PayloadDescriptor {
            name: "ISAKMP_NEXT_SA",
            min_len: 8,
        },
        PayloadType::KeyExchange => PayloadDescriptor {
            name: "ISAKMP_NEXT_KE",
            min_len: 1,
        },
        PayloadType::Identification => PayloadDescriptor {
            name: "ISAKMP_NEXT_ID",
            min_len: 4,
        },
        PayloadType::Certificate => PayloadDescriptor {
            name: "ISAKMP_NEXT_CERT",
            min_len: 1,
        },
        PayloadType::CertRequest => PayloadDescriptor {
            name: "ISAKMP_NEXT_CR",
            min_len: 1,
        },
        PayloadType::Hash => PayloadDescriptor {
            name: "ISAKMP_NEXT_HASH",
            min_len: 1,
        },
        PayloadType::Signature => PayloadDescriptor {
            name: "ISAKMP_NEXT_SIG",
            min_len: 1,
        },
        PayloadType::Nonce => PayloadDescriptor {
            name: "ISAKMP_NEXT_NONCE",
            min_len: 1,
        },
        PayloadType::Notification => PayloadDescriptor {
            name: "ISAKMP_NEXT_N",
            min_len: 8,
        },
        PayloadType::Delete => PayloadDescriptor {
            name: "ISAKMP_NEXT_D",
            min_len: 8,
        },
        PayloadType::VendorId => PayloadDescriptor {
            name: "ISAKMP_NEXT_VID",
            min_len: 1,
        },
        PayloadType::ModeCfgAttr => PayloadDescriptor {
            name: "ISAKMP_NEXT_MCFG_ATTR",
            min_len: 4,
        },
        PayloadType::NatD => PayloadDescriptor {
            name: "ISAKMP_NEXT_NATD_RFC",
            min_len: 1,
        },
        PayloadType::NatOa => PayloadDescriptor {
            name: "ISAKMP_NEXT_NATOA_RFC",
            min_len: 8,
        },
        _ => return None,
    };
    Some(d)
}

/// One parsed payload: its canonical type and where its body sits in
/// the message body
#[derive(Debug, Clone)]
pub struct PayloadDigest {
    /// Canonical payload type (draft NAT numbers already remapped)
    pub payload_type: PayloadType,
    /// Offset of the generic header within the message body
    pub start: usize,
    /// Byte range of the payload body within the message body
    pub body: Range<usize>,
}

impl PayloadDigest {
    /// Offset one past the end of this payload (start of the next one)
    pub fn end(&self) -> usize {
        self.body.end
    }
}

/// Transient per-packet record
///
/// Owns the raw packet and the (decrypted) body so it can be parked on
/// an SA while a cryptographic helper completes.
#[derive(Debug, Clone)]
pub struct MessageDigest {
    /// Raw datagram as received (non-ESP marker already stripped)
    pub packet: Vec<u8>,
    /// Parsed ISAKMP header
    pub hdr: IsakmpHeader,
    /// Message body after the header; decrypted in place when the
    /// encryption flag was set
    pub body: Vec<u8>,
    /// Body length after trailing padding removal (set by the decoder)
    pub parsed_len: usize,
    /// Body was encrypted on the wire
    pub encrypted: bool,
    /// Phase 2 IV was freshly initialized for this message
    pub new_iv_set: bool,
    /// State the transition starts from
    pub from_state: Option<State>,
    /// Selected microcode entry
    pub transition: Option<&'static Transition>,
    /// Owning SA, once resolved
    pub sa: Option<SerialNo>,
    /// Peer endpoint
    pub sender: SocketAddr,
    /// Local endpoint
    pub local: SocketAddr,
    /// Notification to send on failure
    pub note: Option<NotifyType>,
    /// Peer announced IKE fragmentation support
    pub fragvid: bool,
    /// Peer announced DPD support
    pub dpd_vid: bool,
    /// Peer announced Nortel Contivity mode
    pub nortel_vid: bool,
    /// Peer announced RFC 3947 NAT-T support
    pub natt_rfc_vid: bool,
    /// Payload walk has completed (resume guard)
    pub parsed: bool,
    /// HASH protection has been verified (resume guard)
    pub hash_checked: bool,
    /// Reply built by the handler, transmitted by the dispatcher
    pub reply: Option<Vec<u8>>,
    digests: Vec<PayloadDigest>,
    chains: [Vec<usize>; PAYLOAD_CHAIN_SLOTS],
}

impl MessageDigest {
    /// Create a digest for a received datagram
    ///
    /// The body is everything between the header and the header's
    /// declared length; the demultiplexer has already validated that
    /// the declared length fits the datagram.
    pub fn new(packet: Vec<u8>, hdr: IsakmpHeader, sender: SocketAddr, local: SocketAddr) -> Self {
        let body = packet[super::constants::ISAKMP_HEADER_SIZE..hdr.length as usize].to_vec();
        let parsed_len = body.len();
        MessageDigest {
            packet,
            hdr,
            body,
            parsed_len,
            encrypted: false,
            new_iv_set: false,
            from_state: None,
            transition: None,
            sa: None,
            sender,
            local,
            note: None,
            fragvid: false,
            dpd_vid: false,
            nortel_vid: false,
            natt_rfc_vid: false,
            parsed: false,
            hash_checked: false,
            reply: None,
            digests: Vec::new(),
            chains: Default::default(),
        }
    }

    /// Whether the wire header had the encryption flag
    pub fn wire_encrypted(&self) -> bool {
        self.hdr.flags.value() & IsakmpFlags::ENCRYPTION != 0
    }

    /// Append a parsed payload to the pool and its type chain
    ///
    /// # Errors
    ///
    /// Returns error when the pool cap is reached or the type has no
    /// chain slot.
    pub fn push_payload(&mut self, pd: PayloadDigest) -> Result<()> {
        if self.digests.len() >= MAX_PAYLOADS {
            return Err(Error::InvalidMessage(format!(
                "more than {} payloads in message",
                MAX_PAYLOADS
            )));
        }
        let slot = pd
            .payload_type
            .chain_index()
            .ok_or_else(|| Error::Internal(format!("{:?} has no chain slot", pd.payload_type)))?;
        self.chains[slot].push(self.digests.len());
        self.digests.push(pd);
        Ok(())
    }

    /// All payloads in arrival order
    pub fn payloads(&self) -> &[PayloadDigest] {
        &self.digests
    }

    /// Payloads of one type, in arrival order
    pub fn chain(&self, payload_type: PayloadType) -> impl Iterator<Item = &PayloadDigest> {
        let slot = payload_type.chain_index();
        let indices: &[usize] = match slot {
            Some(s) => &self.chains[s],
            None => &[],
        };
        indices.iter().map(move |&i| &self.digests[i])
    }

    /// First payload of one type
    pub fn chain_first(&self, payload_type: PayloadType) -> Option<&PayloadDigest> {
        self.chain(payload_type).next()
    }

    /// Number of payloads of one type
    pub fn chain_len(&self, payload_type: PayloadType) -> usize {
        self.chain(payload_type).count()
    }

    /// Pool index of a payload digest (its arrival position)
    pub fn position_of(&self, payload_type: PayloadType) -> Option<usize> {
        match payload_type.chain_index() {
            Some(s) => self.chains[s].first().copied(),
            None => None,
        }
    }

    /// Pool indices of a payload type's chain
    pub fn positions(&self, payload_type: PayloadType) -> &[usize] {
        match payload_type.chain_index() {
            Some(s) => &self.chains[s],
            None => &[],
        }
    }

    /// Body bytes of a payload
    pub fn payload_bytes(&self, pd: &PayloadDigest) -> &[u8] {
        &self.body[pd.body.clone()]
    }

    /// Message bytes from the end of `pd` to the end of the parsed body
    ///
    /// This is the "rest" input of the Quick Mode HASH computations.
    pub fn bytes_after(&self, pd: &PayloadDigest) -> &[u8] {
        &self.body[pd.end()..self.parsed_len]
    }
}

/// Parsed Notification payload (RFC 2408 Section 3.14)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationView {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol ID the notification concerns
    pub protocol_id: u8,
    /// SPI carried by the notification
    pub spi: Vec<u8>,
    /// Notification code (raw; may be outside the known set)
    pub notify_type: u16,
    /// Notification data
    pub data: Vec<u8>,
}

impl NotificationView {
    /// Parse a notification payload body
    ///
    /// # Errors
    ///
    /// Returns error if the fixed part is truncated or the SPI size
    /// overruns the body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: body.len(),
            });
        }
        let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let protocol_id = body[4];
        let spi_size = body[5] as usize;
        let notify_type = u16::from_be_bytes([body[6], body[7]]);
        if body.len() < 8 + spi_size {
            return Err(Error::InvalidPayload(format!(
                "notification SPI size {} overruns payload",
                spi_size
            )));
        }
        Ok(NotificationView {
            doi,
            protocol_id,
            spi: body[8..8 + spi_size].to_vec(),
            notify_type,
            data: body[8 + spi_size..].to_vec(),
        })
    }

    /// Decoded notification code, when known
    pub fn kind(&self) -> Option<NotifyType> {
        NotifyType::from_u16(self.notify_type)
    }

    /// Serialize a notification payload body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(8 + self.spi.len() + self.data.len());
        out.extend_from_slice(&self.doi.to_be_bytes());
        out.push(self.protocol_id);
        out.push(self.spi.len() as u8);
        out.extend_from_slice(&self.notify_type.to_be_bytes());
        out.extend_from_slice(&self.spi);
        out.extend_from_slice(&self.data);
        out
    }
}

/// Parsed Delete payload (RFC 2408 Section 3.15)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteView {
    /// Domain of interpretation
    pub doi: u32,
    /// Protocol the SPIs belong to
    pub protocol_id: u8,
    /// SPIs being deleted
    pub spis: Vec<Vec<u8>>,
}

impl DeleteView {
    /// Parse a delete payload body
    ///
    /// # Errors
    ///
    /// Returns error on a truncated fixed part or an SPI count that
    /// does not match the body length.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 8 {
            return Err(Error::BufferTooShort {
                required: 8,
                available: body.len(),
            });
        }
        let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let protocol_id = body[4];
        let spi_size = body[5] as usize;
        let count = u16::from_be_bytes([body[6], body[7]]) as usize;
        if body.len() != 8 + spi_size * count {
            return Err(Error::InvalidPayload(format!(
                "delete payload declares {} SPIs of {} bytes but has {} bytes of data",
                count,
                spi_size,
                body.len() - 8
            )));
        }
        let mut spis = Vec::with_capacity(count);
        for i in 0..count {
            let off = 8 + i * spi_size;
            spis.push(body[off..off + spi_size].to_vec());
        }
        Ok(DeleteView {
            doi,
            protocol_id,
            spis,
        })
    }

    /// Serialize a delete payload body
    pub fn to_bytes(&self) -> Vec<u8> {
        let spi_size = self.spis.first().map(|s| s.len()).unwrap_or(0);
        let mut out = Vec::new();
        out.extend_from_slice(&self.doi.to_be_bytes());
        out.push(self.protocol_id);
        out.push(spi_size as u8);
        out.extend_from_slice(&(self.spis.len() as u16).to_be_bytes());
        for spi in &self.spis {
            out.extend_from_slice(spi);
        }
        out
    }
}

/// Parsed Identification payload
///
/// Phase 1 and Phase 2 share the wire layout; Phase 2 (IPsec DOI)
/// additionally gives the protocol/port fields client-selector
/// meaning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdView {
    /// Identification type (raw octet)
    pub id_type: u8,
    /// Protocol ID (Phase 1: DOI-specific A)
    pub protocol_id: u8,
    /// Port (Phase 1: DOI-specific B)
    pub port: u16,
    /// Identification data
    pub data: Vec<u8>,
}

impl IdView {
    /// Parse an identification payload body
    ///
    /// # Errors
    ///
    /// Returns error on a truncated fixed part.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: body.len(),
            });
        }
        Ok(IdView {
            id_type: body[0],
            protocol_id: body[1],
            port: u16::from_be_bytes([body[2], body[3]]),
            data: body[4..].to_vec(),
        })
    }

    /// Serialize an identification payload body
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(4 + self.data.len());
        out.push(self.id_type);
        out.push(self.protocol_id);
        out.extend_from_slice(&self.port.to_be_bytes());
        out.extend_from_slice(&self.data);
        out
    }
}

/// Parsed Mode Config / XAUTH attribute payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgView {
    /// Message type (request/reply/set/ack, raw octet)
    pub cfg_type: u8,
    /// Transaction identifier
    pub id: u16,
    /// Attributes as (type, value) pairs; basic attributes carry their
    /// two-byte value directly
    pub attributes: Vec<(u16, Vec<u8>)>,
}

impl CfgView {
    /// Parse a Mode Config payload body
    ///
    /// # Errors
    ///
    /// Returns error on truncation or an attribute overrunning the
    /// body.
    pub fn parse(body: &[u8]) -> Result<Self> {
        if body.len() < 4 {
            return Err(Error::BufferTooShort {
                required: 4,
                available: body.len(),
            });
        }
        let cfg_type = body[0];
        let id = u16::from_be_bytes([body[2], body[3]]);

        let mut attributes = Vec::new();
        let mut cur = 4;
        while cur < body.len() {
            if cur + 4 > body.len() {
                return Err(Error::InvalidPayload(
                    "truncated Mode Config attribute".to_string(),
                ));
            }
            let raw_type = u16::from_be_bytes([body[cur], body[cur + 1]]);
            let lv = u16::from_be_bytes([body[cur + 2], body[cur + 3]]);
            cur += 4;
            if raw_type & 0x8000 != 0 {
                // basic attribute: the length field is the value
                attributes.push((raw_type & 0x7fff, lv.to_be_bytes().to_vec()));
            } else {
                let len = lv as usize;
                if cur + len > body.len() {
                    return Err(Error::InvalidPayload(format!(
                        "Mode Config attribute length {} overruns payload",
                        len
                    )));
                }
                attributes.push((raw_type, body[cur..cur + len].to_vec()));
                cur += len;
            }
        }

        Ok(CfgView {
            cfg_type,
            id,
            attributes,
        })
    }

    /// Serialize a Mode Config payload body
    ///
    /// Attributes with a two-byte value are emitted in basic form.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.push(self.cfg_type);
        out.push(0); // reserved
        out.extend_from_slice(&self.id.to_be_bytes());
        for (attr_type, value) in &self.attributes {
            if value.len() == 2 {
                out.extend_from_slice(&(attr_type | 0x8000).to_be_bytes());
                out.extend_from_slice(value);
            } else {
                out.extend_from_slice(&attr_type.to_be_bytes());
                out.extend_from_slice(&(value.len() as u16).to_be_bytes());
                out.extend_from_slice(value);
            }
        }
        out
    }

    /// Value of the first attribute with the given type
    pub fn attribute(&self, attr_type: u16) -> Option<&[u8]> {
        self.attributes
            .iter()
            .find(|(t, _)| *t == attr_type)
            .map(|(_, v)| v.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ikev1::constants::ExchangeType;

    fn test_md(payload_chunks: &[(PayloadType, &[u8])]) -> MessageDigest {
        let mut builder =
            super::super::message::MessageBuilder::new([1; 8], [2; 8], ExchangeType::IdProt, 0);
        for (t, body) in payload_chunks {
            builder.add_payload(*t, body.to_vec());
        }
        let packet = builder.build();
        let hdr = IsakmpHeader::from_bytes(&packet).unwrap();
        let sender: SocketAddr = "192.0.2.1:500".parse().unwrap();
        let local: SocketAddr = "192.0.2.2:500".parse().unwrap();
        MessageDigest::new(packet, hdr, sender, local)
    }

    #[test]
    fn test_payload_header_parse() {
        let data = [11u8, 0, 0, 50];
        let header = PayloadHeader::from_bytes(&data).unwrap();
        assert_eq!(header.next_payload, 11);
        assert_eq!(header.length, 50);
    }

    #[test]
    fn test_payload_header_too_short() {
        let result = PayloadHeader::from_bytes(&[1, 2]);
        assert!(matches!(result, Err(Error::BufferTooShort { .. })));
    }

    #[test]
    fn test_payload_header_bad_length() {
        let result = PayloadHeader::from_bytes(&[1, 0, 0, 2]);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_descriptor_lookup() {
        assert!(descriptor(PayloadType::Sa).is_some());
        assert!(descriptor(PayloadType::Hash).is_some());
        // inner-only and special types have no outer descriptor
        assert!(descriptor(PayloadType::Proposal).is_none());
        assert!(descriptor(PayloadType::Transform).is_none());
        assert!(descriptor(PayloadType::Sak).is_none());
        assert!(descriptor(PayloadType::Fragment).is_none());
        assert!(descriptor(PayloadType::NatDDrafts).is_none());
    }

    #[test]
    fn test_digest_chains_preserve_arrival_order() {
        let mut md = test_md(&[]);
        for (i, t) in [PayloadType::VendorId, PayloadType::Nonce, PayloadType::VendorId]
            .iter()
            .enumerate()
        {
            md.push_payload(PayloadDigest {
                payload_type: *t,
                start: i * 10,
                body: i * 10 + 4..i * 10 + 8,
            })
            .unwrap();
        }

        let vids: Vec<usize> = md.chain(PayloadType::VendorId).map(|p| p.start).collect();
        assert_eq!(vids, vec![0, 20]);
        assert_eq!(md.chain_len(PayloadType::Nonce), 1);
        assert_eq!(md.chain_len(PayloadType::Hash), 0);
        assert_eq!(md.positions(PayloadType::VendorId), &[0, 2]);
    }

    #[test]
    fn test_digest_pool_cap() {
        let mut md = test_md(&[]);
        for _ in 0..MAX_PAYLOADS {
            md.push_payload(PayloadDigest {
                payload_type: PayloadType::VendorId,
                start: 0,
                body: 0..0,
            })
            .unwrap();
        }
        let overflow = md.push_payload(PayloadDigest {
            payload_type: PayloadType::VendorId,
            start: 0,
            body: 0..0,
        });
        assert!(overflow.is_err());
    }

    #[test]
    fn test_notification_roundtrip() {
        let n = NotificationView {
            doi: 1,
            protocol_id: 1,
            spi: vec![0xAA; 16],
            notify_type: NotifyType::RUThere.to_u16(),
            data: vec![0, 0, 0, 7],
        };
        let bytes = n.to_bytes();
        let parsed = NotificationView::parse(&bytes).unwrap();
        assert_eq!(parsed, n);
        assert_eq!(parsed.kind(), Some(NotifyType::RUThere));
    }

    #[test]
    fn test_notification_unknown_code() {
        let n = NotificationView {
            doi: 1,
            protocol_id: 1,
            spi: Vec::new(),
            notify_type: 31337,
            data: Vec::new(),
        };
        let parsed = NotificationView::parse(&n.to_bytes()).unwrap();
        assert_eq!(parsed.kind(), None);
    }

    #[test]
    fn test_notification_spi_overrun() {
        let mut bytes = NotificationView {
            doi: 1,
            protocol_id: 1,
            spi: Vec::new(),
            notify_type: 16,
            data: Vec::new(),
        }
        .to_bytes();
        bytes[5] = 4; // claims 4 SPI bytes that are not there
        assert!(NotificationView::parse(&bytes).is_err());
    }

    #[test]
    fn test_delete_roundtrip() {
        let d = DeleteView {
            doi: 1,
            protocol_id: 3,
            spis: vec![vec![0, 0, 0, 1], vec![0, 0, 0, 2]],
        };
        let parsed = DeleteView::parse(&d.to_bytes()).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn test_delete_count_mismatch() {
        let mut bytes = DeleteView {
            doi: 1,
            protocol_id: 3,
            spis: vec![vec![0, 0, 0, 1]],
        }
        .to_bytes();
        bytes[7] = 3; // claims 3 SPIs
        assert!(DeleteView::parse(&bytes).is_err());
    }

    #[test]
    fn test_id_roundtrip() {
        let id = IdView {
            id_type: 1,
            protocol_id: 17,
            port: 500,
            data: vec![192, 0, 2, 1],
        };
        let parsed = IdView::parse(&id.to_bytes()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_cfg_attributes() {
        let cfg = CfgView {
            cfg_type: 1,
            id: 42,
            attributes: vec![
                (super::super::constants::cfg_attr::XAUTH_TYPE, vec![0, 0]),
                (
                    super::super::constants::cfg_attr::XAUTH_USER_NAME,
                    b"alice".to_vec(),
                ),
            ],
        };
        let parsed = CfgView::parse(&cfg.to_bytes()).unwrap();
        assert_eq!(parsed.cfg_type, 1);
        assert_eq!(parsed.id, 42);
        assert_eq!(
            parsed.attribute(super::super::constants::cfg_attr::XAUTH_USER_NAME),
            Some(&b"alice"[..])
        );
        // basic attribute came back with its two-byte value
        assert_eq!(
            parsed.attribute(super::super::constants::cfg_attr::XAUTH_TYPE),
            Some(&[0u8, 0][..])
        );
    }

    #[test]
    fn test_cfg_truncated_attribute() {
        let mut bytes = CfgView {
            cfg_type: 2,
            id: 1,
            attributes: vec![(1, vec![10, 0, 0, 1])],
        }
        .to_bytes();
        bytes.truncate(bytes.len() - 2);
        assert!(CfgView::parse(&bytes).is_err());
    }
}
