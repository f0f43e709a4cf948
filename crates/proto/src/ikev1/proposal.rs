//! SA payload parsing, emission, and proposal selection
//!
//! Phase 1 negotiates Oakley parameters inside an ISAKMP proposal;
//! Phase 2 negotiates IPsec (ESP) transforms carrying an SPI. Both use
//! the Proposal/Transform nesting of RFC 2408 Section 3.5 with the
//! attribute formats of RFC 2409 Appendix A / RFC 2407 Section 4.5.

use super::constants::{AuthMethod, ProtocolId, IPSEC_DOI, SIT_IDENTITY_ONLY};
use super::crypto::{CipherAlgorithm, DhGroup, PrfAlgorithm};
use super::error::{Error, Result};

/// Oakley attribute types (RFC 2409 Appendix A)
pub mod oakley_attr {
    /// Encryption algorithm
    pub const ENCRYPTION_ALGORITHM: u16 = 1;
    /// Hash algorithm
    pub const HASH_ALGORITHM: u16 = 2;
    /// Authentication method
    pub const AUTHENTICATION_METHOD: u16 = 3;
    /// Diffie-Hellman group description
    pub const GROUP_DESCRIPTION: u16 = 4;
    /// Life type (1 = seconds)
    pub const LIFE_TYPE: u16 = 11;
    /// Life duration
    pub const LIFE_DURATION: u16 = 12;
    /// Key length in bits
    pub const KEY_LENGTH: u16 = 14;

    /// OAKLEY_3DES_CBC
    pub const ENC_3DES_CBC: u16 = 5;
    /// OAKLEY_AES_CBC
    pub const ENC_AES_CBC: u16 = 7;
    /// OAKLEY_SHA1
    pub const HASH_SHA1: u16 = 2;
    /// OAKLEY_SHA2_256
    pub const HASH_SHA2_256: u16 = 4;
    /// SA life in seconds
    pub const LIFE_TYPE_SECONDS: u16 = 1;
}

/// IPsec DOI attribute types (RFC 2407 Section 4.5)
pub mod ipsec_attr {
    /// SA life type (1 = seconds)
    pub const SA_LIFE_TYPE: u16 = 1;
    /// SA life duration
    pub const SA_LIFE_DURATION: u16 = 2;
    /// PFS group description
    pub const GROUP_DESCRIPTION: u16 = 3;
    /// Encapsulation mode (1 = tunnel, 2 = transport)
    pub const ENCAPSULATION_MODE: u16 = 4;
    /// Authentication algorithm
    pub const AUTH_ALGORITHM: u16 = 5;
    /// Key length in bits
    pub const KEY_LENGTH: u16 = 6;

    /// ESP_3DES
    pub const ESP_3DES: u8 = 3;
    /// ESP_AES
    pub const ESP_AES: u8 = 12;
    /// HMAC-SHA1 authentication
    pub const AUTH_HMAC_SHA1: u16 = 2;
    /// Tunnel mode
    pub const ENCAPS_TUNNEL: u16 = 1;
    /// Life in seconds
    pub const LIFE_TYPE_SECONDS: u16 = 1;
}

/// Default Phase 1 lifetime when the peer offers none (8 hours)
pub const OAKLEY_DEFAULT_LIFE_SECONDS: u32 = 28800;

/// One Phase 1 transform, as offered or accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OakleyProposal {
    /// Encryption algorithm (Oakley number)
    pub encrypt: u16,
    /// Cipher key length in bits (0 = algorithm default)
    pub key_len_bits: u16,
    /// Hash algorithm (Oakley number)
    pub hash: u16,
    /// Authentication method, raw wire value (may be an XAUTH variant)
    pub auth_wire: u16,
    /// Diffie-Hellman group description
    pub group: u16,
    /// Lifetime in seconds
    pub life_seconds: u32,
}

impl OakleyProposal {
    /// A conventional AES/SHA1/MODP-2048 offer
    pub fn aes_sha1_modp2048(auth_wire: u16, key_len_bits: u16, life_seconds: u32) -> Self {
        OakleyProposal {
            encrypt: oakley_attr::ENC_AES_CBC,
            key_len_bits,
            hash: oakley_attr::HASH_SHA1,
            auth_wire,
            group: 14,
            life_seconds,
        }
    }

    /// Negotiated cipher, if the transform is supported
    pub fn cipher(&self) -> Option<CipherAlgorithm> {
        match self.encrypt {
            oakley_attr::ENC_AES_CBC => {
                let bits = if self.key_len_bits == 0 {
                    128
                } else {
                    self.key_len_bits
                };
                CipherAlgorithm::aes_for_key_len(bits)
            }
            _ => None,
        }
    }

    /// Negotiated PRF, if the hash is supported
    pub fn prf(&self) -> Option<PrfAlgorithm> {
        match self.hash {
            oakley_attr::HASH_SHA1 => Some(PrfAlgorithm::HmacSha1),
            oakley_attr::HASH_SHA2_256 => Some(PrfAlgorithm::HmacSha256),
            _ => None,
        }
    }

    /// Base authentication method, if recognized
    pub fn auth(&self) -> Option<AuthMethod> {
        AuthMethod::from_wire(self.auth_wire)
    }

    /// Whether the wire auth value is an XAUTH variant
    pub fn is_xauth(&self) -> bool {
        (65001..=65010).contains(&self.auth_wire)
    }

    /// Negotiated group, if supported
    pub fn dh_group(&self) -> Option<DhGroup> {
        DhGroup::from_group_number(self.group)
    }
}

/// One Phase 2 (ESP) transform, as offered or accepted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpsecProposal {
    /// IPsec protocol (only ESP is negotiated here)
    pub protocol: ProtocolId,
    /// Sender's inbound SPI
    pub spi: u32,
    /// ESP transform number
    pub transform_id: u8,
    /// Cipher key length in bits (0 = algorithm default)
    pub key_len_bits: u16,
    /// Authentication algorithm
    pub auth_alg: u16,
    /// Encapsulation mode
    pub encaps_mode: u16,
    /// Lifetime in seconds
    pub life_seconds: u32,
    /// PFS group, when present
    pub group: Option<u16>,
}

impl IpsecProposal {
    /// A conventional ESP/AES/SHA1 tunnel offer
    pub fn esp_aes_sha1(spi: u32, key_len_bits: u16, life_seconds: u32) -> Self {
        IpsecProposal {
            protocol: ProtocolId::Esp,
            spi,
            transform_id: ipsec_attr::ESP_AES,
            key_len_bits,
            auth_alg: ipsec_attr::AUTH_HMAC_SHA1,
            encaps_mode: ipsec_attr::ENCAPS_TUNNEL,
            life_seconds,
            group: None,
        }
    }
}

// Attribute wire helpers

fn push_basic_attr(out: &mut Vec<u8>, attr_type: u16, value: u16) {
    out.extend_from_slice(&(attr_type | 0x8000).to_be_bytes());
    out.extend_from_slice(&value.to_be_bytes());
}

fn push_long_attr(out: &mut Vec<u8>, attr_type: u16, value: &[u8]) {
    out.extend_from_slice(&attr_type.to_be_bytes());
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

/// Parse data attributes into (type, numeric value) pairs
///
/// Long attributes wider than four bytes are rejected; nothing in
/// either DOI needs them.
fn parse_attrs(data: &[u8]) -> Result<Vec<(u16, u32)>> {
    let mut attrs = Vec::new();
    let mut cur = 0;
    while cur < data.len() {
        if cur + 4 > data.len() {
            return Err(Error::InvalidPayload("truncated SA attribute".to_string()));
        }
        let raw_type = u16::from_be_bytes([data[cur], data[cur + 1]]);
        let lv = u16::from_be_bytes([data[cur + 2], data[cur + 3]]);
        cur += 4;
        if raw_type & 0x8000 != 0 {
            attrs.push((raw_type & 0x7fff, lv as u32));
        } else {
            let len = lv as usize;
            if len > 4 || cur + len > data.len() {
                return Err(Error::InvalidPayload(format!(
                    "SA attribute {} has unusable length {}",
                    raw_type, len
                )));
            }
            let mut value = 0u32;
            for &b in &data[cur..cur + len] {
                value = (value << 8) | b as u32;
            }
            attrs.push((raw_type, value));
            cur += len;
        }
    }
    Ok(attrs)
}

struct RawTransform {
    transform_id: u8,
    attrs: Vec<(u16, u32)>,
}

struct RawProposal {
    protocol_id: u8,
    spi: Vec<u8>,
    transforms: Vec<RawTransform>,
}

/// Parse the DOI/situation prefix and the proposal list of an SA body
fn parse_sa_body(body: &[u8]) -> Result<Vec<RawProposal>> {
    if body.len() < 8 {
        return Err(Error::BufferTooShort {
            required: 8,
            available: body.len(),
        });
    }
    let doi = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
    if doi != IPSEC_DOI {
        return Err(Error::InvalidPayload(format!("unsupported DOI {}", doi)));
    }
    let situation = u32::from_be_bytes([body[4], body[5], body[6], body[7]]);
    if situation != SIT_IDENTITY_ONLY {
        return Err(Error::InvalidPayload(format!(
            "unsupported situation {:#x}",
            situation
        )));
    }

    let mut proposals = Vec::new();
    let mut cur = 8;
    loop {
        if cur + 8 > body.len() {
            return Err(Error::InvalidPayload("truncated proposal".to_string()));
        }
        let next = body[cur];
        let length = u16::from_be_bytes([body[cur + 2], body[cur + 3]]) as usize;
        if length < 8 || cur + length > body.len() {
            return Err(Error::InvalidPayload("bad proposal length".to_string()));
        }
        let protocol_id = body[cur + 5];
        let spi_size = body[cur + 6] as usize;
        let num_transforms = body[cur + 7] as usize;

        let mut t_cur = cur + 8;
        if t_cur + spi_size > cur + length {
            return Err(Error::InvalidPayload("proposal SPI overrun".to_string()));
        }
        let spi = body[t_cur..t_cur + spi_size].to_vec();
        t_cur += spi_size;

        let mut transforms = Vec::new();
        for _ in 0..num_transforms {
            if t_cur + 8 > cur + length {
                return Err(Error::InvalidPayload("truncated transform".to_string()));
            }
            let t_len = u16::from_be_bytes([body[t_cur + 2], body[t_cur + 3]]) as usize;
            if t_len < 8 || t_cur + t_len > cur + length {
                return Err(Error::InvalidPayload("bad transform length".to_string()));
            }
            let transform_id = body[t_cur + 5];
            let attrs = parse_attrs(&body[t_cur + 8..t_cur + t_len])?;
            transforms.push(RawTransform {
                transform_id,
                attrs,
            });
            t_cur += t_len;
        }

        proposals.push(RawProposal {
            protocol_id,
            spi,
            transforms,
        });

        cur += length;
        if next == 0 {
            break;
        }
    }
    Ok(proposals)
}

/// Parse a Phase 1 SA payload body into the offered Oakley transforms
///
/// # Errors
///
/// Returns error on malformed nesting, a non-IPsec DOI, or a
/// non-ISAKMP proposal.
pub fn parse_oakley_sa(body: &[u8]) -> Result<Vec<OakleyProposal>> {
    let proposals = parse_sa_body(body)?;
    let mut offers = Vec::new();
    for prop in proposals {
        if prop.protocol_id != ProtocolId::Isakmp.to_u8() {
            return Err(Error::InvalidPayload(format!(
                "Phase 1 proposal for protocol {}, expected ISAKMP",
                prop.protocol_id
            )));
        }
        for t in prop.transforms {
            let mut offer = OakleyProposal {
                encrypt: 0,
                key_len_bits: 0,
                hash: 0,
                auth_wire: 0,
                group: 0,
                life_seconds: OAKLEY_DEFAULT_LIFE_SECONDS,
            };
            let mut life_type = oakley_attr::LIFE_TYPE_SECONDS as u32;
            for (attr, value) in t.attrs {
                match attr {
                    oakley_attr::ENCRYPTION_ALGORITHM => offer.encrypt = value as u16,
                    oakley_attr::HASH_ALGORITHM => offer.hash = value as u16,
                    oakley_attr::AUTHENTICATION_METHOD => offer.auth_wire = value as u16,
                    oakley_attr::GROUP_DESCRIPTION => offer.group = value as u16,
                    oakley_attr::KEY_LENGTH => offer.key_len_bits = value as u16,
                    oakley_attr::LIFE_TYPE => life_type = value,
                    oakley_attr::LIFE_DURATION => {
                        if life_type == oakley_attr::LIFE_TYPE_SECONDS as u32 {
                            offer.life_seconds = value;
                        }
                    }
                    _ => {} // unknown attributes are carried, not fatal
                }
            }
            offers.push(offer);
        }
    }
    Ok(offers)
}

/// Serialize a Phase 1 SA payload body
pub fn emit_oakley_sa(offers: &[OakleyProposal]) -> Vec<u8> {
    let mut transforms = Vec::new();
    for (i, offer) in offers.iter().enumerate() {
        let mut attrs = Vec::new();
        push_basic_attr(&mut attrs, oakley_attr::ENCRYPTION_ALGORITHM, offer.encrypt);
        if offer.key_len_bits != 0 {
            push_basic_attr(&mut attrs, oakley_attr::KEY_LENGTH, offer.key_len_bits);
        }
        push_basic_attr(&mut attrs, oakley_attr::HASH_ALGORITHM, offer.hash);
        push_basic_attr(
            &mut attrs,
            oakley_attr::AUTHENTICATION_METHOD,
            offer.auth_wire,
        );
        push_basic_attr(&mut attrs, oakley_attr::GROUP_DESCRIPTION, offer.group);
        push_basic_attr(
            &mut attrs,
            oakley_attr::LIFE_TYPE,
            oakley_attr::LIFE_TYPE_SECONDS,
        );
        push_long_attr(
            &mut attrs,
            oakley_attr::LIFE_DURATION,
            &offer.life_seconds.to_be_bytes(),
        );

        let last = i == offers.len() - 1;
        transforms.push(encode_transform(i as u8, 1 /* KEY_IKE */, &attrs, last));
    }
    encode_sa_body(ProtocolId::Isakmp, &[], &transforms)
}

/// Parse a Phase 2 SA payload body into the offered IPsec transforms
///
/// # Errors
///
/// Returns error on malformed nesting or a proposal without the
/// 4-byte SPI the IPsec DOI requires.
pub fn parse_ipsec_sa(body: &[u8]) -> Result<Vec<IpsecProposal>> {
    let proposals = parse_sa_body(body)?;
    let mut offers = Vec::new();
    for prop in proposals {
        let protocol = ProtocolId::from_u8(prop.protocol_id).ok_or_else(|| {
            Error::InvalidPayload(format!("unknown IPsec protocol {}", prop.protocol_id))
        })?;
        if prop.spi.len() != 4 {
            return Err(Error::InvalidPayload(format!(
                "IPsec proposal SPI is {} bytes, expected 4",
                prop.spi.len()
            )));
        }
        let spi = u32::from_be_bytes([prop.spi[0], prop.spi[1], prop.spi[2], prop.spi[3]]);
        for t in prop.transforms {
            let mut offer = IpsecProposal {
                protocol,
                spi,
                transform_id: t.transform_id,
                key_len_bits: 0,
                auth_alg: 0,
                encaps_mode: ipsec_attr::ENCAPS_TUNNEL,
                life_seconds: 3600,
                group: None,
            };
            let mut life_type = ipsec_attr::LIFE_TYPE_SECONDS as u32;
            for (attr, value) in t.attrs {
                match attr {
                    ipsec_attr::SA_LIFE_TYPE => life_type = value,
                    ipsec_attr::SA_LIFE_DURATION => {
                        if life_type == ipsec_attr::LIFE_TYPE_SECONDS as u32 {
                            offer.life_seconds = value;
                        }
                    }
                    ipsec_attr::GROUP_DESCRIPTION => offer.group = Some(value as u16),
                    ipsec_attr::ENCAPSULATION_MODE => offer.encaps_mode = value as u16,
                    ipsec_attr::AUTH_ALGORITHM => offer.auth_alg = value as u16,
                    ipsec_attr::KEY_LENGTH => offer.key_len_bits = value as u16,
                    _ => {}
                }
            }
            offers.push(offer);
        }
    }
    Ok(offers)
}

/// Serialize a Phase 2 SA payload body
pub fn emit_ipsec_sa(offers: &[IpsecProposal]) -> Vec<u8> {
    let spi = offers.first().map(|o| o.spi).unwrap_or(0);
    let protocol = offers
        .first()
        .map(|o| o.protocol)
        .unwrap_or(ProtocolId::Esp);

    let mut transforms = Vec::new();
    for (i, offer) in offers.iter().enumerate() {
        let mut attrs = Vec::new();
        push_basic_attr(
            &mut attrs,
            ipsec_attr::SA_LIFE_TYPE,
            ipsec_attr::LIFE_TYPE_SECONDS,
        );
        push_long_attr(
            &mut attrs,
            ipsec_attr::SA_LIFE_DURATION,
            &offer.life_seconds.to_be_bytes(),
        );
        push_basic_attr(&mut attrs, ipsec_attr::ENCAPSULATION_MODE, offer.encaps_mode);
        push_basic_attr(&mut attrs, ipsec_attr::AUTH_ALGORITHM, offer.auth_alg);
        if offer.key_len_bits != 0 {
            push_basic_attr(&mut attrs, ipsec_attr::KEY_LENGTH, offer.key_len_bits);
        }
        if let Some(group) = offer.group {
            push_basic_attr(&mut attrs, ipsec_attr::GROUP_DESCRIPTION, group);
        }

        let last = i == offers.len() - 1;
        transforms.push(encode_transform(i as u8, offer.transform_id, &attrs, last));
    }
    encode_sa_body(protocol, &spi.to_be_bytes(), &transforms)
}

fn encode_transform(number: u8, transform_id: u8, attrs: &[u8], last: bool) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + attrs.len());
    out.push(if last { 0 } else { 3 }); // next payload: Transform
    out.push(0);
    out.extend_from_slice(&((8 + attrs.len()) as u16).to_be_bytes());
    out.push(number);
    out.push(transform_id);
    out.extend_from_slice(&[0, 0]);
    out.extend_from_slice(attrs);
    out
}

fn encode_sa_body(protocol: ProtocolId, spi: &[u8], transforms: &[Vec<u8>]) -> Vec<u8> {
    let t_total: usize = transforms.iter().map(|t| t.len()).sum();
    let prop_len = 8 + spi.len() + t_total;

    let mut out = Vec::with_capacity(8 + prop_len);
    out.extend_from_slice(&IPSEC_DOI.to_be_bytes());
    out.extend_from_slice(&SIT_IDENTITY_ONLY.to_be_bytes());
    out.push(0); // last (only) proposal
    out.push(0);
    out.extend_from_slice(&(prop_len as u16).to_be_bytes());
    out.push(0); // proposal number
    out.push(protocol.to_u8());
    out.push(spi.len() as u8);
    out.push(transforms.len() as u8);
    out.extend_from_slice(spi);
    for t in transforms {
        out.extend_from_slice(t);
    }
    out
}

/// Select the first acceptable Phase 1 offer
///
/// Acceptable means: a cipher, PRF, and group this engine implements,
/// and a base authentication method the connection allows.
pub fn select_oakley(
    offers: &[OakleyProposal],
    allowed_auth: &[AuthMethod],
) -> Option<OakleyProposal> {
    offers
        .iter()
        .find(|o| {
            o.cipher().is_some()
                && o.prf().is_some()
                && o.dh_group().is_some()
                && o.auth()
                    .map(|a| allowed_auth.contains(&a))
                    .unwrap_or(false)
        })
        .cloned()
}

/// Select the first acceptable Phase 2 offer (ESP/AES with HMAC-SHA1)
pub fn select_ipsec(offers: &[IpsecProposal]) -> Option<IpsecProposal> {
    offers
        .iter()
        .find(|o| {
            o.protocol == ProtocolId::Esp
                && o.transform_id == ipsec_attr::ESP_AES
                && o.auth_alg == ipsec_attr::AUTH_HMAC_SHA1
        })
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oakley_roundtrip() {
        let offer = OakleyProposal::aes_sha1_modp2048(1, 256, 28800);
        let body = emit_oakley_sa(&[offer.clone()]);
        let parsed = parse_oakley_sa(&body).unwrap();
        assert_eq!(parsed, vec![offer]);
    }

    #[test]
    fn test_oakley_multiple_transforms() {
        let a = OakleyProposal::aes_sha1_modp2048(1, 256, 28800);
        let b = OakleyProposal::aes_sha1_modp2048(3, 128, 3600);
        let body = emit_oakley_sa(&[a.clone(), b.clone()]);
        let parsed = parse_oakley_sa(&body).unwrap();
        assert_eq!(parsed, vec![a, b]);
    }

    #[test]
    fn test_oakley_mapping() {
        let offer = OakleyProposal::aes_sha1_modp2048(1, 256, 28800);
        assert_eq!(offer.cipher(), Some(CipherAlgorithm::Aes256Cbc));
        assert_eq!(offer.prf(), Some(PrfAlgorithm::HmacSha1));
        assert_eq!(offer.auth(), Some(AuthMethod::PreSharedKey));
        assert_eq!(offer.dh_group(), Some(DhGroup::Modp2048));
        assert!(!offer.is_xauth());

        let xauth = OakleyProposal::aes_sha1_modp2048(65001, 128, 28800);
        assert!(xauth.is_xauth());
        assert_eq!(xauth.auth(), Some(AuthMethod::PreSharedKey));
    }

    #[test]
    fn test_oakley_default_key_length() {
        let mut offer = OakleyProposal::aes_sha1_modp2048(1, 0, 28800);
        offer.key_len_bits = 0;
        assert_eq!(offer.cipher(), Some(CipherAlgorithm::Aes128Cbc));
    }

    #[test]
    fn test_select_oakley_respects_auth_policy() {
        let psk = OakleyProposal::aes_sha1_modp2048(1, 128, 28800);
        let sig = OakleyProposal::aes_sha1_modp2048(3, 128, 28800);

        let chosen = select_oakley(
            &[psk.clone(), sig.clone()],
            &[AuthMethod::RsaSignature],
        );
        assert_eq!(chosen, Some(sig));

        let none = select_oakley(&[psk], &[AuthMethod::RsaSignature]);
        assert_eq!(none, None);
    }

    #[test]
    fn test_select_oakley_skips_unsupported_cipher() {
        let mut des = OakleyProposal::aes_sha1_modp2048(1, 0, 28800);
        des.encrypt = 1; // OAKLEY_DES_CBC
        let aes = OakleyProposal::aes_sha1_modp2048(1, 128, 28800);

        let chosen = select_oakley(&[des, aes.clone()], &[AuthMethod::PreSharedKey]);
        assert_eq!(chosen, Some(aes));
    }

    #[test]
    fn test_ipsec_roundtrip() {
        let offer = IpsecProposal::esp_aes_sha1(0x11223344, 128, 3600);
        let body = emit_ipsec_sa(&[offer.clone()]);
        let parsed = parse_ipsec_sa(&body).unwrap();
        assert_eq!(parsed, vec![offer]);
    }

    #[test]
    fn test_ipsec_selection() {
        let mut des = IpsecProposal::esp_aes_sha1(1, 0, 3600);
        des.transform_id = ipsec_attr::ESP_3DES;
        let aes = IpsecProposal::esp_aes_sha1(2, 128, 3600);

        assert_eq!(select_ipsec(&[des.clone(), aes.clone()]), Some(aes));
        assert_eq!(select_ipsec(&[des]), None);
    }

    #[test]
    fn test_bad_doi_rejected() {
        let mut body = emit_oakley_sa(&[OakleyProposal::aes_sha1_modp2048(1, 128, 28800)]);
        body[3] = 9; // corrupt the DOI
        assert!(parse_oakley_sa(&body).is_err());
    }

    #[test]
    fn test_truncated_transform_rejected() {
        let mut body = emit_oakley_sa(&[OakleyProposal::aes_sha1_modp2048(1, 128, 28800)]);
        body.truncate(body.len() - 3);
        assert!(parse_oakley_sa(&body).is_err());
    }

    #[test]
    fn test_phase2_proposal_needs_4_byte_spi() {
        // a Phase 1 body has no SPI; feeding it to the Phase 2 parser fails
        let body = emit_oakley_sa(&[OakleyProposal::aes_sha1_modp2048(1, 128, 28800)]);
        assert!(parse_ipsec_sa(&body).is_err());
    }
}
