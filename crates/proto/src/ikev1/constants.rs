//! IKEv1 protocol constants from RFC 2408 / RFC 2409

/// IKE version 1 (major version = 1, minor version = 0)
pub const IKEV1_VERSION: u8 = 0x10;

/// ISAKMP header size (28 bytes)
pub const ISAKMP_HEADER_SIZE: usize = 28;

/// Maximum ISAKMP message size (64KB - 1)
pub const MAX_ISAKMP_MESSAGE_SIZE: u32 = 65535;

/// Non-ESP marker prefixed to IKE packets on the NAT-T port (RFC 3948)
pub const NON_ESP_MARKER: [u8; 4] = [0, 0, 0, 0];

/// Message ID of all Phase 1 exchanges
pub const MAINMODE_MSGID: u32 = 0;

/// Highest fragment index accepted in an IKE fragmentation payload
pub const MAX_FRAGMENT_INDEX: u8 = 16;

/// How many byte-identical duplicates of a packet we answer with a
/// retransmit before dropping them
pub const MAX_ACCEPTED_DUPLICATES: u32 = 2;

/// IPsec DOI (RFC 2407)
pub const IPSEC_DOI: u32 = 1;

/// SIT_IDENTITY_ONLY situation (RFC 2407 Section 4.2)
pub const SIT_IDENTITY_ONLY: u32 = 1;

/// Exchange Types (RFC 2408 Section 3.1, RFC 2409)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExchangeType {
    /// Base exchange (1)
    Base = 1,
    /// Identity Protection - Main Mode (2)
    IdProt = 2,
    /// Authentication Only (3)
    AuthOnly = 3,
    /// Aggressive Mode (4)
    Aggressive = 4,
    /// Informational (5)
    Informational = 5,
    /// Transaction - Mode Config / XAUTH (6)
    ModeCfg = 6,
    /// Quick Mode (32)
    Quick = 32,
    /// New Group Mode (33)
    NewGroup = 33,
}

impl ExchangeType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ExchangeType::Base),
            2 => Some(ExchangeType::IdProt),
            3 => Some(ExchangeType::AuthOnly),
            4 => Some(ExchangeType::Aggressive),
            5 => Some(ExchangeType::Informational),
            6 => Some(ExchangeType::ModeCfg),
            32 => Some(ExchangeType::Quick),
            33 => Some(ExchangeType::NewGroup),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// ISAKMP header flags (RFC 2408 Section 3.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IsakmpFlags(u8);

impl IsakmpFlags {
    /// Encryption bit (bit 0): the message body is encrypted
    pub const ENCRYPTION: u8 = 0x01;
    /// Commit bit (bit 1): ignored with a warning, never honored
    pub const COMMIT: u8 = 0x02;
    /// Authentication Only bit (bit 2)
    pub const AUTH_ONLY: u8 = 0x04;
    /// Reserved bit 5, settable only by the bogus-flag impairment
    pub const RESERVED_BOGUS: u8 = 0x20;

    /// Create flags from a raw header byte
    pub fn new(value: u8) -> Self {
        IsakmpFlags(value)
    }

    /// Empty flag set
    pub fn empty() -> Self {
        IsakmpFlags(0)
    }

    /// Flags for an encrypted message
    pub fn encrypted() -> Self {
        IsakmpFlags(Self::ENCRYPTION)
    }

    /// Check the encryption bit
    pub fn is_encrypted(self) -> bool {
        (self.0 & Self::ENCRYPTION) != 0
    }

    /// Check the commit bit
    pub fn is_commit(self) -> bool {
        (self.0 & Self::COMMIT) != 0
    }

    /// Check the authentication-only bit
    pub fn is_auth_only(self) -> bool {
        (self.0 & Self::AUTH_ONLY) != 0
    }

    /// Set a flag bit
    pub fn with(self, bit: u8) -> Self {
        IsakmpFlags(self.0 | bit)
    }

    /// Get raw value
    pub fn value(self) -> u8 {
        self.0
    }
}

/// Payload Types (RFC 2408 Section 3.1; drafts and private-use additions)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PayloadType {
    /// No next payload (0)
    None = 0,
    /// Security Association (1)
    Sa = 1,
    /// Proposal (2), only inside SA payloads
    Proposal = 2,
    /// Transform (3), only inside Proposal payloads
    Transform = 3,
    /// Key Exchange (4)
    KeyExchange = 4,
    /// Identification (5)
    Identification = 5,
    /// Certificate (6)
    Certificate = 6,
    /// Certificate Request (7)
    CertRequest = 7,
    /// Hash (8)
    Hash = 8,
    /// Signature (9)
    Signature = 9,
    /// Nonce (10)
    Nonce = 10,
    /// Notification (11)
    Notification = 11,
    /// Delete (12)
    Delete = 12,
    /// Vendor ID (13)
    VendorId = 13,
    /// Mode Config attributes (14, RFC draft "isakmp-mode-cfg")
    ModeCfgAttr = 14,
    /// SA KEK payload from the Group DOI (15); ancient Cisco NAT drafts
    /// abused this number, so it is skipped rather than rejected
    Sak = 15,
    /// NAT Discovery (20, RFC 3947)
    NatD = 20,
    /// NAT Original Address (21, RFC 3947)
    NatOa = 21,
    /// NAT Discovery from the pre-RFC drafts (130, private use)
    NatDDrafts = 130,
    /// NAT Original Address from the pre-RFC drafts (131, private use)
    NatOaDrafts = 131,
    /// IKE fragmentation (132, private use)
    Fragment = 132,
}

/// Number of chain slots in a message digest (canonical payload types
/// after draft remapping all fit below this)
pub const PAYLOAD_CHAIN_SLOTS: usize = 22;

impl PayloadType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(PayloadType::None),
            1 => Some(PayloadType::Sa),
            2 => Some(PayloadType::Proposal),
            3 => Some(PayloadType::Transform),
            4 => Some(PayloadType::KeyExchange),
            5 => Some(PayloadType::Identification),
            6 => Some(PayloadType::Certificate),
            7 => Some(PayloadType::CertRequest),
            8 => Some(PayloadType::Hash),
            9 => Some(PayloadType::Signature),
            10 => Some(PayloadType::Nonce),
            11 => Some(PayloadType::Notification),
            12 => Some(PayloadType::Delete),
            13 => Some(PayloadType::VendorId),
            14 => Some(PayloadType::ModeCfgAttr),
            15 => Some(PayloadType::Sak),
            20 => Some(PayloadType::NatD),
            21 => Some(PayloadType::NatOa),
            130 => Some(PayloadType::NatDDrafts),
            131 => Some(PayloadType::NatOaDrafts),
            132 => Some(PayloadType::Fragment),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Chain slot for this payload type, if it can appear in a digest
    ///
    /// Draft NAT payloads are remapped to their RFC numbers before
    /// chaining; the fragmentation payload never reaches the decoder.
    pub fn chain_index(self) -> Option<usize> {
        let n = self.to_u8() as usize;
        if (1..PAYLOAD_CHAIN_SLOTS).contains(&n) {
            Some(n)
        } else {
            None
        }
    }
}

/// IPsec DOI protocol identifiers (RFC 2407 Section 4.4.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProtocolId {
    /// ISAKMP (1)
    Isakmp = 1,
    /// IPsec AH (2)
    Ah = 2,
    /// IPsec ESP (3)
    Esp = 3,
    /// IP compression (4)
    IpComp = 4,
}

impl ProtocolId {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ProtocolId::Isakmp),
            2 => Some(ProtocolId::Ah),
            3 => Some(ProtocolId::Esp),
            4 => Some(ProtocolId::IpComp),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Notification codes (RFC 2408 Section 3.14.1 plus DOI and vendor ranges)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum NotifyType {
    /// INVALID-PAYLOAD-TYPE (1)
    InvalidPayloadType = 1,
    /// DOI-NOT-SUPPORTED (2)
    DoiNotSupported = 2,
    /// SITUATION-NOT-SUPPORTED (3)
    SituationNotSupported = 3,
    /// INVALID-COOKIE (4)
    InvalidCookie = 4,
    /// INVALID-MAJOR-VERSION (5)
    InvalidMajorVersion = 5,
    /// INVALID-MINOR-VERSION (6)
    InvalidMinorVersion = 6,
    /// INVALID-EXCHANGE-TYPE (7)
    InvalidExchangeType = 7,
    /// INVALID-FLAGS (8)
    InvalidFlags = 8,
    /// INVALID-MESSAGE-ID (9)
    InvalidMessageId = 9,
    /// INVALID-PROTOCOL-ID (10)
    InvalidProtocolId = 10,
    /// INVALID-SPI (11)
    InvalidSpi = 11,
    /// INVALID-TRANSFORM-ID (12)
    InvalidTransformId = 12,
    /// ATTRIBUTES-NOT-SUPPORTED (13)
    AttributesNotSupported = 13,
    /// NO-PROPOSAL-CHOSEN (14)
    NoProposalChosen = 14,
    /// BAD-PROPOSAL-SYNTAX (15)
    BadProposalSyntax = 15,
    /// PAYLOAD-MALFORMED (16)
    PayloadMalformed = 16,
    /// INVALID-KEY-INFORMATION (17)
    InvalidKeyInformation = 17,
    /// INVALID-ID-INFORMATION (18)
    InvalidIdInformation = 18,
    /// INVALID-CERT-ENCODING (19)
    InvalidCertEncoding = 19,
    /// INVALID-CERTIFICATE (20)
    InvalidCertificate = 20,
    /// CERT-TYPE-UNSUPPORTED (21)
    CertTypeUnsupported = 21,
    /// INVALID-CERT-AUTHORITY (22)
    InvalidCertAuthority = 22,
    /// INVALID-HASH-INFORMATION (23)
    InvalidHashInformation = 23,
    /// AUTHENTICATION-FAILED (24)
    AuthenticationFailed = 24,
    /// INVALID-SIGNATURE (25)
    InvalidSignature = 25,
    /// ADDRESS-NOTIFICATION (26)
    AddressNotification = 26,
    /// NOTIFY-SA-LIFETIME (27)
    NotifySaLifetime = 27,
    /// CERTIFICATE-UNAVAILABLE (28)
    CertificateUnavailable = 28,
    /// UNSUPPORTED-EXCHANGE-TYPE (29)
    UnsupportedExchangeType = 29,
    /// UNEQUAL-PAYLOAD-LENGTHS (30)
    UnequalPayloadLengths = 30,
    /// RESPONDER-LIFETIME (24576, RFC 2407)
    IpsecResponderLifetime = 24576,
    /// REPLAY-STATUS (24577, RFC 2407)
    IpsecReplayStatus = 24577,
    /// INITIAL-CONTACT (24578, RFC 2407)
    IpsecInitialContact = 24578,
    /// R-U-THERE (36136, RFC 3706 DPD)
    RUThere = 36136,
    /// R-U-THERE-ACK (36137, RFC 3706 DPD)
    RUThereAck = 36137,
    /// Cisco load-balance redirect (40501, vendor private)
    CiscoLoadBalance = 40501,
}

impl NotifyType {
    /// Convert from u16
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            1 => Some(NotifyType::InvalidPayloadType),
            2 => Some(NotifyType::DoiNotSupported),
            3 => Some(NotifyType::SituationNotSupported),
            4 => Some(NotifyType::InvalidCookie),
            5 => Some(NotifyType::InvalidMajorVersion),
            6 => Some(NotifyType::InvalidMinorVersion),
            7 => Some(NotifyType::InvalidExchangeType),
            8 => Some(NotifyType::InvalidFlags),
            9 => Some(NotifyType::InvalidMessageId),
            10 => Some(NotifyType::InvalidProtocolId),
            11 => Some(NotifyType::InvalidSpi),
            12 => Some(NotifyType::InvalidTransformId),
            13 => Some(NotifyType::AttributesNotSupported),
            14 => Some(NotifyType::NoProposalChosen),
            15 => Some(NotifyType::BadProposalSyntax),
            16 => Some(NotifyType::PayloadMalformed),
            17 => Some(NotifyType::InvalidKeyInformation),
            18 => Some(NotifyType::InvalidIdInformation),
            19 => Some(NotifyType::InvalidCertEncoding),
            20 => Some(NotifyType::InvalidCertificate),
            21 => Some(NotifyType::CertTypeUnsupported),
            22 => Some(NotifyType::InvalidCertAuthority),
            23 => Some(NotifyType::InvalidHashInformation),
            24 => Some(NotifyType::AuthenticationFailed),
            25 => Some(NotifyType::InvalidSignature),
            26 => Some(NotifyType::AddressNotification),
            27 => Some(NotifyType::NotifySaLifetime),
            28 => Some(NotifyType::CertificateUnavailable),
            29 => Some(NotifyType::UnsupportedExchangeType),
            30 => Some(NotifyType::UnequalPayloadLengths),
            24576 => Some(NotifyType::IpsecResponderLifetime),
            24577 => Some(NotifyType::IpsecReplayStatus),
            24578 => Some(NotifyType::IpsecInitialContact),
            36136 => Some(NotifyType::RUThere),
            36137 => Some(NotifyType::RUThereAck),
            40501 => Some(NotifyType::CiscoLoadBalance),
            _ => None,
        }
    }

    /// Convert to u16
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Oakley authentication methods (RFC 2409 Appendix A), with the XAUTH
/// hybrid values folded onto their base methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum AuthMethod {
    /// Pre-shared key (1)
    PreSharedKey = 1,
    /// DSS signatures (2)
    DssSignature = 2,
    /// RSA signatures (3)
    RsaSignature = 3,
    /// Encryption with RSA (4); recognized but not processed
    RsaEncryption = 4,
    /// Revised encryption with RSA (5); recognized but not processed
    RsaRevisedEncryption = 5,
}

impl AuthMethod {
    /// Convert a wire value to its base method
    ///
    /// The XAUTH draft allocates 65001..=65010 as initiator/responder
    /// pairs layered over the five base methods; they authenticate the
    /// same way, so the state machine only cares about the base.
    pub fn from_wire(value: u16) -> Option<Self> {
        let base = match value {
            65001..=65010 => (value - 65001) / 2 + 1,
            v => v,
        };
        match base {
            1 => Some(AuthMethod::PreSharedKey),
            2 => Some(AuthMethod::DssSignature),
            3 => Some(AuthMethod::RsaSignature),
            4 => Some(AuthMethod::RsaEncryption),
            5 => Some(AuthMethod::RsaRevisedEncryption),
            _ => None,
        }
    }

    /// Convert to the base wire value
    pub fn to_u16(self) -> u16 {
        self as u16
    }
}

/// Identification types from the IPsec DOI (RFC 2407 Section 4.6.2.1)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum IdType {
    /// ID_IPV4_ADDR (1)
    Ipv4Addr = 1,
    /// ID_FQDN (2)
    Fqdn = 2,
    /// ID_USER_FQDN (3)
    UserFqdn = 3,
    /// ID_IPV4_ADDR_SUBNET (4)
    Ipv4Subnet = 4,
    /// ID_IPV6_ADDR (5)
    Ipv6Addr = 5,
    /// ID_IPV6_ADDR_SUBNET (6)
    Ipv6Subnet = 6,
    /// ID_DER_ASN1_DN (9)
    DerAsn1Dn = 9,
    /// ID_KEY_ID (11)
    KeyId = 11,
}

impl IdType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(IdType::Ipv4Addr),
            2 => Some(IdType::Fqdn),
            3 => Some(IdType::UserFqdn),
            4 => Some(IdType::Ipv4Subnet),
            5 => Some(IdType::Ipv6Addr),
            6 => Some(IdType::Ipv6Subnet),
            9 => Some(IdType::DerAsn1Dn),
            11 => Some(IdType::KeyId),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Mode Config message types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModeCfgType {
    /// ISAKMP_CFG_REQUEST (1)
    Request = 1,
    /// ISAKMP_CFG_REPLY (2)
    Reply = 2,
    /// ISAKMP_CFG_SET (3)
    Set = 3,
    /// ISAKMP_CFG_ACK (4)
    Ack = 4,
}

impl ModeCfgType {
    /// Convert from u8
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(ModeCfgType::Request),
            2 => Some(ModeCfgType::Reply),
            3 => Some(ModeCfgType::Set),
            4 => Some(ModeCfgType::Ack),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

/// Mode Config / XAUTH attribute types
pub mod cfg_attr {
    /// INTERNAL_IP4_ADDRESS
    pub const INTERNAL_IP4_ADDRESS: u16 = 1;
    /// INTERNAL_IP4_NETMASK
    pub const INTERNAL_IP4_NETMASK: u16 = 2;
    /// INTERNAL_IP4_DNS
    pub const INTERNAL_IP4_DNS: u16 = 3;
    /// XAUTH_TYPE
    pub const XAUTH_TYPE: u16 = 16520;
    /// XAUTH_USER_NAME
    pub const XAUTH_USER_NAME: u16 = 16521;
    /// XAUTH_USER_PASSWORD
    pub const XAUTH_USER_PASSWORD: u16 = 16522;
    /// XAUTH_MESSAGE
    pub const XAUTH_MESSAGE: u16 = 16526;
    /// XAUTH_STATUS
    pub const XAUTH_STATUS: u16 = 16527;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_conversion() {
        assert_eq!(ExchangeType::from_u8(2), Some(ExchangeType::IdProt));
        assert_eq!(ExchangeType::from_u8(4), Some(ExchangeType::Aggressive));
        assert_eq!(ExchangeType::from_u8(5), Some(ExchangeType::Informational));
        assert_eq!(ExchangeType::from_u8(32), Some(ExchangeType::Quick));
        assert_eq!(ExchangeType::from_u8(250), None);

        assert_eq!(ExchangeType::Quick.to_u8(), 32);
        assert_eq!(ExchangeType::ModeCfg.to_u8(), 6);
    }

    #[test]
    fn test_isakmp_flags() {
        let flags = IsakmpFlags::encrypted();
        assert!(flags.is_encrypted());
        assert!(!flags.is_commit());

        let flags = IsakmpFlags::new(IsakmpFlags::ENCRYPTION | IsakmpFlags::COMMIT);
        assert!(flags.is_encrypted());
        assert!(flags.is_commit());

        let flags = IsakmpFlags::empty().with(IsakmpFlags::RESERVED_BOGUS);
        assert_eq!(flags.value(), 0x20);
    }

    #[test]
    fn test_payload_type_conversion() {
        assert_eq!(PayloadType::from_u8(1), Some(PayloadType::Sa));
        assert_eq!(PayloadType::from_u8(8), Some(PayloadType::Hash));
        assert_eq!(PayloadType::from_u8(130), Some(PayloadType::NatDDrafts));
        assert_eq!(PayloadType::from_u8(132), Some(PayloadType::Fragment));
        assert_eq!(PayloadType::from_u8(250), None);

        assert_eq!(PayloadType::Sa.to_u8(), 1);
        assert_eq!(PayloadType::NatD.to_u8(), 20);
    }

    #[test]
    fn test_payload_chain_index() {
        assert_eq!(PayloadType::Sa.chain_index(), Some(1));
        assert_eq!(PayloadType::NatOa.chain_index(), Some(21));
        assert_eq!(PayloadType::None.chain_index(), None);
        assert_eq!(PayloadType::Fragment.chain_index(), None);
        assert_eq!(PayloadType::NatDDrafts.chain_index(), None);
    }

    #[test]
    fn test_notify_type_conversion() {
        assert_eq!(NotifyType::from_u16(16), Some(NotifyType::PayloadMalformed));
        assert_eq!(NotifyType::from_u16(36136), Some(NotifyType::RUThere));
        assert_eq!(
            NotifyType::from_u16(40501),
            Some(NotifyType::CiscoLoadBalance)
        );
        assert_eq!(NotifyType::from_u16(31), None);

        assert_eq!(NotifyType::UnsupportedExchangeType.to_u16(), 29);
        assert_eq!(NotifyType::RUThereAck.to_u16(), 36137);
    }

    #[test]
    fn test_auth_method_base_folding() {
        assert_eq!(AuthMethod::from_wire(1), Some(AuthMethod::PreSharedKey));
        assert_eq!(AuthMethod::from_wire(3), Some(AuthMethod::RsaSignature));

        // XAUTH initiator/responder pairs fold onto the base method
        assert_eq!(AuthMethod::from_wire(65001), Some(AuthMethod::PreSharedKey));
        assert_eq!(AuthMethod::from_wire(65002), Some(AuthMethod::PreSharedKey));
        assert_eq!(AuthMethod::from_wire(65005), Some(AuthMethod::RsaSignature));
        assert_eq!(
            AuthMethod::from_wire(65010),
            Some(AuthMethod::RsaRevisedEncryption)
        );

        assert_eq!(AuthMethod::from_wire(0), None);
        assert_eq!(AuthMethod::from_wire(65011), None);
    }

    #[test]
    fn test_id_type_conversion() {
        assert_eq!(IdType::from_u8(1), Some(IdType::Ipv4Addr));
        assert_eq!(IdType::from_u8(4), Some(IdType::Ipv4Subnet));
        assert_eq!(IdType::from_u8(7), None);
    }

    #[test]
    fn test_mode_cfg_type() {
        assert_eq!(ModeCfgType::from_u8(1), Some(ModeCfgType::Request));
        assert_eq!(ModeCfgType::from_u8(4), Some(ModeCfgType::Ack));
        assert_eq!(ModeCfgType::from_u8(5), None);
    }
}
