//! ISAKMP message header and reply assembly
//!
//! Implements the fixed header defined in RFC 2408 Section 3.1.
//!
//! ```text
//!  0                   1                   2                   3
//!  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Initiator                            |
//! |                            Cookie                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Responder                            |
//! |                            Cookie                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |  Next Payload | MjVer | MnVer | Exchange Type |     Flags     |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                          Message ID                           |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! |                            Length                             |
//! +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//! ```
//!
//! The next-payload and exchange-type octets are kept raw: an unknown
//! exchange type must still reach the demultiplexer so it can answer
//! with UNSUPPORTED-EXCHANGE-TYPE, and an unknown leading payload must
//! reach the decoder so it can answer with INVALID-PAYLOAD-TYPE.

use super::constants::{
    ExchangeType, IsakmpFlags, PayloadType, IKEV1_VERSION, ISAKMP_HEADER_SIZE,
    MAX_ISAKMP_MESSAGE_SIZE, NON_ESP_MARKER,
};
use super::error::{Error, Result};

/// ISAKMP message header (28 bytes)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsakmpHeader {
    /// Initiator cookie / SPI (8 bytes)
    pub initiator_spi: [u8; 8],

    /// Responder cookie / SPI (8 bytes, zero until the responder picks one)
    pub responder_spi: [u8; 8],

    /// Next payload type (raw octet)
    pub next_payload: u8,

    /// Protocol version (must be 0x10 for IKEv1)
    pub version: u8,

    /// Exchange type (raw octet)
    pub exchange_type: u8,

    /// Message flags
    pub flags: IsakmpFlags,

    /// Message ID (zero for Phase 1)
    pub message_id: u32,

    /// Total message length in bytes (including header)
    pub length: u32,
}

impl IsakmpHeader {
    /// Parse an ISAKMP header from bytes
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Buffer is too short (< 28 bytes)
    /// - Protocol version is not 0x10
    /// - Message length is out of range
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < ISAKMP_HEADER_SIZE {
            return Err(Error::BufferTooShort {
                required: ISAKMP_HEADER_SIZE,
                available: data.len(),
            });
        }

        let mut initiator_spi = [0u8; 8];
        let mut responder_spi = [0u8; 8];
        initiator_spi.copy_from_slice(&data[0..8]);
        responder_spi.copy_from_slice(&data[8..16]);

        let next_payload = data[16];

        let version = data[17];
        if version != IKEV1_VERSION {
            return Err(Error::UnsupportedVersion(version));
        }

        let exchange_type = data[18];
        let flags = IsakmpFlags::new(data[19]);

        let message_id = u32::from_be_bytes([data[20], data[21], data[22], data[23]]);
        let length = u32::from_be_bytes([data[24], data[25], data[26], data[27]]);

        if length > MAX_ISAKMP_MESSAGE_SIZE {
            return Err(Error::MessageTooLarge(length));
        }
        if (length as usize) < ISAKMP_HEADER_SIZE {
            return Err(Error::InvalidLength {
                expected: ISAKMP_HEADER_SIZE,
                actual: length as usize,
            });
        }

        Ok(IsakmpHeader {
            initiator_spi,
            responder_spi,
            next_payload,
            version,
            exchange_type,
            flags,
            message_id,
            length,
        })
    }

    /// Serialize the header to bytes
    pub fn to_bytes(&self) -> [u8; ISAKMP_HEADER_SIZE] {
        let mut bytes = [0u8; ISAKMP_HEADER_SIZE];

        bytes[0..8].copy_from_slice(&self.initiator_spi);
        bytes[8..16].copy_from_slice(&self.responder_spi);
        bytes[16] = self.next_payload;
        bytes[17] = self.version;
        bytes[18] = self.exchange_type;
        bytes[19] = self.flags.value();
        bytes[20..24].copy_from_slice(&self.message_id.to_be_bytes());
        bytes[24..28].copy_from_slice(&self.length.to_be_bytes());

        bytes
    }

    /// Decode the exchange-type octet
    pub fn exchange(&self) -> Option<ExchangeType> {
        ExchangeType::from_u8(self.exchange_type)
    }

    /// Check whether the initiator cookie is all zero
    pub fn initiator_spi_is_zero(&self) -> bool {
        self.initiator_spi == [0u8; 8]
    }

    /// Check whether the responder cookie is all zero
    pub fn responder_spi_is_zero(&self) -> bool {
        self.responder_spi == [0u8; 8]
    }
}

/// Strip the 4-byte non-ESP marker from a NAT-T (UDP/4500) frame
///
/// Returns `None` when the marker is absent, which on the NAT-T port
/// means the frame is ESP-in-UDP and not ours.
pub fn strip_non_esp_marker(data: &[u8]) -> Option<&[u8]> {
    if data.len() >= NON_ESP_MARKER.len() && data[..NON_ESP_MARKER.len()] == NON_ESP_MARKER {
        Some(&data[NON_ESP_MARKER.len()..])
    } else {
        None
    }
}

/// Serialize a payload chain: generic headers with next-payload links,
/// terminated by NONE
///
/// This is exactly the byte sequence a built message carries after its
/// leading payload, which is what the outbound HASH computations need.
pub(crate) fn assemble_chain(payloads: &[(PayloadType, Vec<u8>)]) -> Vec<u8> {
    let mut body = Vec::new();
    for (i, (_, payload)) in payloads.iter().enumerate() {
        let next = payloads.get(i + 1).map(|(t, _)| t.to_u8()).unwrap_or(0);
        body.push(next);
        body.push(0); // reserved
        let len = (payload.len() + 4) as u16;
        body.extend_from_slice(&len.to_be_bytes());
        body.extend_from_slice(payload);
    }
    body
}

/// Outgoing ISAKMP message assembler
///
/// Collects payloads, then fixes up the next-payload chain and all
/// length fields at build time. Replies echo the inbound header with
/// the flags zeroed (plus the encryption bit when the body is
/// encrypted).
#[derive(Debug, Clone)]
pub struct MessageBuilder {
    hdr: IsakmpHeader,
    payloads: Vec<(PayloadType, Vec<u8>)>,
}

impl MessageBuilder {
    /// Start a fresh message
    pub fn new(
        initiator_spi: [u8; 8],
        responder_spi: [u8; 8],
        exchange_type: ExchangeType,
        message_id: u32,
    ) -> Self {
        MessageBuilder {
            hdr: IsakmpHeader {
                initiator_spi,
                responder_spi,
                next_payload: 0,
                version: IKEV1_VERSION,
                exchange_type: exchange_type.to_u8(),
                flags: IsakmpFlags::empty(),
                message_id,
                length: 0,
            },
            payloads: Vec::new(),
        }
    }

    /// Start a reply as a replica of the inbound header
    ///
    /// All flags are zeroed; the encryption bit is set when `encrypted`.
    pub fn echo_reply(hdr: &IsakmpHeader, encrypted: bool) -> Self {
        let flags = if encrypted {
            IsakmpFlags::encrypted()
        } else {
            IsakmpFlags::empty()
        };
        MessageBuilder {
            hdr: IsakmpHeader {
                initiator_spi: hdr.initiator_spi,
                responder_spi: hdr.responder_spi,
                next_payload: 0,
                version: IKEV1_VERSION,
                exchange_type: hdr.exchange_type,
                flags,
                message_id: hdr.message_id,
                length: 0,
            },
            payloads: Vec::new(),
        }
    }

    /// Override the responder SPI (the responder's first reply introduces it)
    pub fn set_responder_spi(&mut self, spi: [u8; 8]) -> &mut Self {
        self.hdr.responder_spi = spi;
        self
    }

    /// Add a raw flag bit to the header (bogus-flag impairment)
    pub fn set_flag(&mut self, bit: u8) -> &mut Self {
        self.hdr.flags = self.hdr.flags.with(bit);
        self
    }

    /// Append a payload body (without its generic header)
    pub fn add_payload(&mut self, payload_type: PayloadType, body: Vec<u8>) -> &mut Self {
        self.payloads.push((payload_type, body));
        self
    }

    /// Serialized body (generic headers + payloads), without encryption
    fn assemble_body(&self) -> Vec<u8> {
        assemble_chain(&self.payloads)
    }

    /// Build the message without encryption
    pub fn build(mut self) -> Vec<u8> {
        let body = self.assemble_body();
        self.finish(body)
    }

    /// Build the message with the body encrypted in CBC mode
    ///
    /// Pads the body with zeros to the cipher block size, encrypts it
    /// with `iv`, and leaves the last ciphertext block in `iv` so the
    /// caller can carry the chain forward.
    ///
    /// # Errors
    ///
    /// Returns error if the cipher rejects the key.
    pub fn build_encrypted(
        mut self,
        cipher: super::crypto::CipherAlgorithm,
        key: &[u8],
        iv: &mut Vec<u8>,
    ) -> Result<Vec<u8>> {
        let mut body = self.assemble_body();

        let bs = cipher.block_size();
        let pad = (bs - body.len() % bs) % bs;
        body.resize(body.len() + pad, 0);

        cipher.encrypt_in_place(key, iv, &mut body)?;

        // CBC chain: next message's IV is the last ciphertext block
        iv.clear();
        iv.extend_from_slice(&body[body.len() - bs..]);

        self.hdr.flags = self.hdr.flags.with(IsakmpFlags::ENCRYPTION);
        Ok(self.finish(body))
    }

    fn finish(&mut self, body: Vec<u8>) -> Vec<u8> {
        self.hdr.next_payload = self.payloads.first().map(|(t, _)| t.to_u8()).unwrap_or(0);
        self.hdr.length = (ISAKMP_HEADER_SIZE + body.len()) as u32;

        let mut out = Vec::with_capacity(self.hdr.length as usize);
        out.extend_from_slice(&self.hdr.to_bytes());
        out.extend_from_slice(&body);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_header_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 28];
        data[0..8].copy_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8]);
        data[8..16].copy_from_slice(&[9, 10, 11, 12, 13, 14, 15, 16]);
        data[16] = 1; // SA
        data[17] = 0x10;
        data[18] = 2; // IDPROT
        data[19] = 0;
        data[20..24].copy_from_slice(&0u32.to_be_bytes());
        data[24..28].copy_from_slice(&100u32.to_be_bytes());
        data
    }

    #[test]
    fn test_header_parse() {
        let header = IsakmpHeader::from_bytes(&sample_header_bytes()).unwrap();

        assert_eq!(header.initiator_spi, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(header.responder_spi, [9, 10, 11, 12, 13, 14, 15, 16]);
        assert_eq!(header.next_payload, 1);
        assert_eq!(header.version, 0x10);
        assert_eq!(header.exchange(), Some(ExchangeType::IdProt));
        assert_eq!(header.message_id, 0);
        assert_eq!(header.length, 100);
        assert!(!header.initiator_spi_is_zero());
        assert!(!header.responder_spi_is_zero());
    }

    #[test]
    fn test_header_roundtrip() {
        let header = IsakmpHeader::from_bytes(&sample_header_bytes()).unwrap();
        let bytes = header.to_bytes();
        let parsed = IsakmpHeader::from_bytes(&bytes).unwrap();
        assert_eq!(header, parsed);
    }

    #[test]
    fn test_buffer_too_short() {
        let data = vec![0u8; 27];
        let result = IsakmpHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::BufferTooShort { .. })));
    }

    #[test]
    fn test_invalid_version() {
        let mut data = sample_header_bytes();
        data[17] = 0x20; // IKEv2
        let result = IsakmpHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::UnsupportedVersion(0x20))));
    }

    #[test]
    fn test_unknown_exchange_type_is_kept_raw() {
        let mut data = sample_header_bytes();
        data[18] = 99;
        let header = IsakmpHeader::from_bytes(&data).unwrap();
        assert_eq!(header.exchange_type, 99);
        assert_eq!(header.exchange(), None);
    }

    #[test]
    fn test_length_too_small() {
        let mut data = sample_header_bytes();
        data[24..28].copy_from_slice(&20u32.to_be_bytes());
        let result = IsakmpHeader::from_bytes(&data);
        assert!(matches!(result, Err(Error::InvalidLength { .. })));
    }

    #[test]
    fn test_non_esp_marker() {
        let framed = [0u8, 0, 0, 0, 0xAA, 0xBB];
        assert_eq!(strip_non_esp_marker(&framed), Some(&framed[4..]));

        let esp = [0x11u8, 0, 0, 0, 0xAA];
        assert_eq!(strip_non_esp_marker(&esp), None);

        let short = [0u8, 0];
        assert_eq!(strip_non_esp_marker(&short), None);
    }

    #[test]
    fn test_builder_chains_payloads() {
        let mut b = MessageBuilder::new([1; 8], [0; 8], ExchangeType::IdProt, 0);
        b.add_payload(PayloadType::Sa, vec![0xAA; 10]);
        b.add_payload(PayloadType::VendorId, vec![0xBB; 4]);
        let msg = b.build();

        let hdr = IsakmpHeader::from_bytes(&msg).unwrap();
        assert_eq!(hdr.next_payload, PayloadType::Sa.to_u8());
        assert_eq!(hdr.length as usize, msg.len());

        // first generic header points at the vendor ID payload
        assert_eq!(msg[28], PayloadType::VendorId.to_u8());
        assert_eq!(u16::from_be_bytes([msg[30], msg[31]]), 14);

        // last generic header terminates the chain
        let vid_off = 28 + 14;
        assert_eq!(msg[vid_off], 0);
        assert_eq!(u16::from_be_bytes([msg[vid_off + 2], msg[vid_off + 3]]), 8);
    }

    #[test]
    fn test_echo_reply_zeroes_flags() {
        let mut data = sample_header_bytes();
        data[19] = IsakmpFlags::COMMIT | IsakmpFlags::ENCRYPTION;
        let hdr = IsakmpHeader::from_bytes(&data).unwrap();

        let reply = MessageBuilder::echo_reply(&hdr, false).build();
        let reply_hdr = IsakmpHeader::from_bytes(&reply).unwrap();
        assert_eq!(reply_hdr.flags.value(), 0);
        assert_eq!(reply_hdr.message_id, hdr.message_id);
        assert_eq!(reply_hdr.exchange_type, hdr.exchange_type);
    }
}
