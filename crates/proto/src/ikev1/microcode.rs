//! The IKEv1 state transition table
//!
//! Each entry parameterizes the centralized processing of one packet:
//! which payloads are expected, whether the message must be encrypted,
//! which HASH protects it, which handler runs, and what happens after.
//! The entry is selected primarily by the state; in Phase 1 the payload
//! structure also depends on the negotiated authentication method, so
//! that too plays a part.
//!
//! Entries for one state are contiguous and the dispatcher linearly
//! scans them for an authentication-class match. States where auth
//! does not apply carry `AuthClass::ALL` on their first entry so the
//! scan always terminates there.

use super::constants::{AuthMethod, PayloadType};
use super::state::State;

/// Set of payload types, one bit per canonical wire number
///
/// Canonical numbers all sit below 22, so a u32 is plenty; the draft
/// NAT payloads are remapped before any set membership test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PayloadSet(u32);

impl PayloadSet {
    /// The empty set
    pub const EMPTY: PayloadSet = PayloadSet(0);

    /// Set containing the given payload types
    pub const fn of(types: &[PayloadType]) -> PayloadSet {
        let mut bits = 0u32;
        let mut i = 0;
        while i < types.len() {
            bits |= 1 << (types[i] as u32);
            i += 1;
        }
        PayloadSet(bits)
    }

    /// Union of two sets
    pub const fn union(self, other: PayloadSet) -> PayloadSet {
        PayloadSet(self.0 | other.0)
    }

    /// Membership test
    pub fn contains(self, payload_type: PayloadType) -> bool {
        self.0 & (1 << (payload_type.to_u8() as u32)) != 0
    }

    /// Remove a payload type
    pub fn remove(&mut self, payload_type: PayloadType) {
        self.0 &= !(1 << (payload_type.to_u8() as u32));
    }

    /// True when no payload types remain
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Names of the member types, for diagnostics
    pub fn names(self) -> Vec<&'static str> {
        let mut out = Vec::new();
        for n in 0..32u8 {
            if self.0 & (1 << n) != 0 {
                if let Some(pt) = PayloadType::from_u8(n) {
                    if let Some(d) = super::payload::descriptor(pt) {
                        out.push(d.name);
                    }
                }
            }
        }
        out
    }
}

/// Authentication classes a transition applies to
///
/// `DS` covers both signature methods; `ALL` matches any method and
/// also matches when no method has been negotiated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthClass(u8);

impl AuthClass {
    /// Pre-shared key
    pub const PSK: AuthClass = AuthClass(0b00001);
    /// Digital signatures (DSS and RSA)
    pub const DS: AuthClass = AuthClass(0b00110);
    /// Encryption with RSA
    pub const PKE: AuthClass = AuthClass(0b01000);
    /// Revised encryption with RSA
    pub const RPKE: AuthClass = AuthClass(0b10000);
    /// All authentication classes
    pub const ALL: AuthClass = AuthClass(0b11111);
    /// No authentication classes (fold seed for coverage checks)
    pub const NONE: AuthClass = AuthClass(0);

    /// Union of two classes
    pub const fn union(self, other: AuthClass) -> AuthClass {
        AuthClass(self.0 | other.0)
    }

    /// Whether this class covers the given method
    pub fn matches(self, method: AuthMethod) -> bool {
        let bit = match method {
            AuthMethod::PreSharedKey => 0b00001,
            AuthMethod::DssSignature => 0b00010,
            AuthMethod::RsaSignature => 0b00100,
            AuthMethod::RsaEncryption => 0b01000,
            AuthMethod::RsaRevisedEncryption => 0b10000,
        };
        self.0 & bit != 0
    }
}

/// State microcode flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmfFlags(u16);

impl SmfFlags {
    /// This transition runs on the initiator
    pub const INITIATOR: u16 = 1 << 0;
    /// The input carries the authentication itself, so it is exempt
    /// from the HASH-protection requirement
    pub const FIRST_ENCRYPTED_INPUT: u16 = 1 << 1;
    /// The input message must be encrypted
    pub const INPUT_ENCRYPTED: u16 = 1 << 2;
    /// The output message must be encrypted
    pub const OUTPUT_ENCRYPTED: u16 = 1 << 3;
    /// A duplicate of the packet that drove this state may trigger a
    /// retransmit of our reply
    pub const RETRANSMIT_ON_DUPLICATE: u16 = 1 << 4;
    /// This transition generates a reply message
    pub const REPLY: u16 = 1 << 5;
    /// This transition completes Phase 1; queued Phase 2 negotiations
    /// should fire
    pub const RELEASE_PENDING_P2: u16 = 1 << 6;
    /// Authentication was canonicalized from XAUTH
    pub const XAUTH_AUTH: u16 = 1 << 7;

    /// Input and output encrypted
    pub const ENCRYPTED: u16 = Self::INPUT_ENCRYPTED | Self::OUTPUT_ENCRYPTED;

    /// Create from raw bits
    pub const fn new(bits: u16) -> Self {
        SmfFlags(bits)
    }

    /// No flags
    pub const fn empty() -> Self {
        SmfFlags(0)
    }

    /// Test for a flag bit
    pub fn has(self, bit: u16) -> bool {
        self.0 & bit != 0
    }
}

/// Post-transition timer event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Retransmit our last message on a short cycle
    Retransmit,
    /// Replace (rekey) or expire the SA when its lifetime runs down
    SaReplace,
    /// Discard the half-open SA if the exchange does not progress
    SoDiscard,
    /// No timer (terminal packet-loss states)
    Null,
}

/// Which Quick Mode / Informational HASH protects the message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashType {
    /// No hash protection
    None,
    /// HASH(1) = prf(SKEYID_a, M-ID | rest)
    Hash1,
    /// HASH(2) = prf(SKEYID_a, M-ID | Ni_b | rest)
    Hash2,
    /// HASH(3) = prf(SKEYID_a, 0 | M-ID | Ni_b | Nr_b)
    Hash3,
}

/// Transition handler identifier
///
/// Dispatched by `handlers::run`; an enum rather than a function
/// pointer so transitions stay plain data and tests can name them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    /// Log and ignore a message no transition expects
    Unexpected,
    /// Informational exchange processing
    Informational,
    /// Main Mode R0: HDR, SA --> HDR, SA
    MainInI1OutR1,
    /// Main Mode I1: HDR, SA --> HDR, KE, Ni
    MainInR1OutI2,
    /// Main Mode R1: HDR, KE, Ni --> HDR, KE, Nr
    MainInI2OutR2,
    /// Main Mode I2: HDR, KE, Nr --> HDR*, IDi1, HASH_I/SIG_I
    MainInR2OutI3,
    /// Main Mode R2: HDR*, IDi1, HASH_I --> HDR*, IDr1, HASH_R
    MainInI3OutR3,
    /// Main Mode I3: HDR*, IDr1, HASH_R --> done
    MainInR3,
    /// Aggressive R0: HDR, SA, KE, Ni, IDii --> full reply
    AggrInI1OutR1,
    /// Aggressive I1: reply --> HDR*, HASH_I/SIG_I
    AggrInR1OutI2,
    /// Aggressive R1: HDR*, HASH_I --> done
    AggrInI2,
    /// Quick R0: HASH(1), SA, Ni [...] --> HASH(2) reply
    QuickInI1OutR1,
    /// Quick I1: HASH(2) reply --> HASH(3)
    QuickInR1OutI2,
    /// Quick R1: HASH(3) --> done
    QuickInI2,
    /// XAUTH server: challenge reply received
    XauthInR0,
    /// XAUTH server: status ack received
    XauthInR1,
    /// Mode Config server: request received (pull)
    ModeCfgInR0,
    /// Mode Config server: ack received (push)
    ModeCfgInR1,
    /// XAUTH client: challenge received
    XauthInI0,
    /// XAUTH client: status received
    XauthInI1,
}

/// One microcode entry
///
/// `to == from` is an explicit stay-in-state loop (the original table
/// wrote these as UNDEFINED next-states).
#[derive(Debug)]
pub struct Transition {
    /// State this entry applies to
    pub from: State,
    /// State entered on success
    pub to: State,
    /// Authentication classes this entry applies to
    pub auth: AuthClass,
    /// Microcode flags
    pub flags: SmfFlags,
    /// Required payloads (each exactly once)
    pub required: PayloadSet,
    /// Optional payloads (any number)
    pub optional: PayloadSet,
    /// Timer armed after the transition commits
    pub timeout: EventType,
    /// Handler that processes the message
    pub handler: Handler,
    /// Handler name, as logged
    pub name: &'static str,
    /// HASH protection of the input message
    pub hash: HashType,
}

impl Transition {
    /// Test for a microcode flag
    pub fn has(&self, bit: u16) -> bool {
        self.flags.has(bit)
    }
}

use PayloadType::{
    CertRequest as CR, Certificate as CERT, Hash as HASH, Identification as ID,
    KeyExchange as KE, ModeCfgAttr as MCFG, NatD as NATD, NatOa as NATOA, Nonce as NONCE,
    Sa as SA, Signature as SIG, VendorId as VID,
};

const NONE: PayloadSet = PayloadSet::EMPTY;

macro_rules! entry {
    ($from:ident -> $to:ident, $auth:expr, $flags:expr,
     req $req:expr, opt $opt:expr, $timeout:ident, $handler:ident, $hash:ident) => {
        Transition {
            from: State::$from,
            to: State::$to,
            auth: $auth,
            flags: SmfFlags::new($flags),
            required: $req,
            optional: $opt,
            timeout: EventType::$timeout,
            handler: Handler::$handler,
            name: stringify!($handler),
            hash: HashType::$hash,
        }
    };
}

/// The state transition table
///
/// Entries must be grouped by from-state; `validate_table` checks this
/// and the structural invariants.
pub static TRANSITIONS: &[Transition] = &[
    /***** Phase 1 Main Mode *****/

    // MAIN_R0: I1 --> R1.  HDR, SA --> HDR, SA
    entry!(MainR0 -> MainR1, AuthClass::ALL, SmfFlags::REPLY,
        req PayloadSet::of(&[SA]), opt PayloadSet::of(&[VID, CR]),
        SoDiscard, MainInI1OutR1, None),

    // MAIN_I1: R1 --> I2.  Auth is not known yet, so one entry serves all.
    entry!(MainI1 -> MainI2, AuthClass::ALL, SmfFlags::INITIATOR | SmfFlags::REPLY,
        req PayloadSet::of(&[SA]), opt PayloadSet::of(&[VID, CR]),
        Retransmit, MainInR1OutI2, None),

    // MAIN_R1: I2 --> R2.  HDR, KE, Ni --> HDR, KE, Nr
    entry!(MainR1 -> MainR2, AuthClass::PSK.union(AuthClass::DS),
        SmfFlags::REPLY | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req PayloadSet::of(&[KE, NONCE]), opt PayloadSet::of(&[VID, CR, NATD]),
        Retransmit, MainInI2OutR2, None),
    entry!(MainR1 -> MainR1, AuthClass::PKE,
        SmfFlags::REPLY | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req PayloadSet::of(&[KE, ID, NONCE]), opt PayloadSet::of(&[VID, CR, HASH]),
        Retransmit, Unexpected, None),
    entry!(MainR1 -> MainR1, AuthClass::RPKE,
        SmfFlags::REPLY | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req PayloadSet::of(&[NONCE, KE, ID]), opt PayloadSet::of(&[VID, CR, HASH, CERT]),
        Retransmit, Unexpected, None),

    // Output must be encrypted from here on.
    // MAIN_I2: R2 --> I3.  HDR, KE, Nr --> HDR*, IDi1, HASH_I / SIG_I
    entry!(MainI2 -> MainI3, AuthClass::PSK.union(AuthClass::DS),
        SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[KE, NONCE]), opt PayloadSet::of(&[VID, CR, NATD]),
        Retransmit, MainInR2OutI3, None),
    entry!(MainI2 -> MainI2, AuthClass::PKE,
        SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[KE, ID, NONCE]), opt PayloadSet::of(&[VID, CR]),
        Retransmit, Unexpected, None),
    entry!(MainI2 -> MainI2, AuthClass::ALL,
        SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[NONCE, KE, ID]), opt PayloadSet::of(&[VID, CR]),
        Retransmit, Unexpected, None),

    // Input must be encrypted from here on.
    // MAIN_R2: I3 --> R3.  HDR*, IDi1, HASH_I --> HDR*, IDr1, HASH_R
    entry!(MainR2 -> MainR3, AuthClass::PSK,
        SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[ID, HASH]), opt PayloadSet::of(&[VID, CR]),
        SaReplace, MainInI3OutR3, None),
    entry!(MainR2 -> MainR3, AuthClass::DS,
        SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[ID, SIG]), opt PayloadSet::of(&[VID, CR, CERT]),
        SaReplace, MainInI3OutR3, None),
    entry!(MainR2 -> MainR2, AuthClass::PKE.union(AuthClass::RPKE),
        SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[HASH]), opt PayloadSet::of(&[VID, CR]),
        SaReplace, Unexpected, None),

    // MAIN_I3: R3 --> done.  HDR*, IDr1, HASH_R --> done
    entry!(MainI3 -> MainI4, AuthClass::PSK,
        SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[ID, HASH]), opt PayloadSet::of(&[VID, CR]),
        SaReplace, MainInR3, None),
    entry!(MainI3 -> MainI4, AuthClass::DS,
        SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[ID, SIG]), opt PayloadSet::of(&[VID, CR, CERT]),
        SaReplace, MainInR3, None),
    entry!(MainI3 -> MainI3, AuthClass::PKE.union(AuthClass::RPKE),
        SmfFlags::INITIATOR | SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::ENCRYPTED
            | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[HASH]), opt PayloadSet::of(&[VID, CR]),
        SaReplace, Unexpected, None),

    // MAIN_R3 / MAIN_I4: only reachable again through packet loss
    entry!(MainR3 -> MainR3, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req NONE, opt NONE, Null, Unexpected, None),
    entry!(MainI4 -> MainI4, AuthClass::ALL,
        SmfFlags::INITIATOR | SmfFlags::ENCRYPTED,
        req NONE, opt NONE, Null, Unexpected, None),

    /***** Phase 1 Aggressive Mode *****/

    // AGGR_R0: HDR, SA, KE, Ni, IDii --> HDR, SA, KE, Nr, IDir, HASH_R / SIG_R
    entry!(AggrR0 -> AggrR1, AuthClass::PSK.union(AuthClass::DS), SmfFlags::REPLY,
        req PayloadSet::of(&[SA, KE, NONCE, ID]), opt PayloadSet::of(&[VID, NATD]),
        SoDiscard, AggrInI1OutR1, None),

    // AGGR_I1: reply --> HDR*, HASH_I / SIG_I
    entry!(AggrI1 -> AggrI2, AuthClass::PSK,
        SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY
            | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[SA, KE, NONCE, ID, HASH]), opt PayloadSet::of(&[VID, NATD]),
        SaReplace, AggrInR1OutI2, None),
    entry!(AggrI1 -> AggrI2, AuthClass::DS,
        SmfFlags::INITIATOR | SmfFlags::OUTPUT_ENCRYPTED | SmfFlags::REPLY
            | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[SA, KE, NONCE, ID, SIG]), opt PayloadSet::of(&[VID, NATD]),
        SaReplace, AggrInR1OutI2, None),

    // AGGR_R1: HDR*, HASH_I / SIG_I --> done
    entry!(AggrR1 -> AggrR2, AuthClass::PSK,
        SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::OUTPUT_ENCRYPTED
            | SmfFlags::RELEASE_PENDING_P2 | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req PayloadSet::of(&[HASH]), opt PayloadSet::of(&[VID, NATD]),
        SaReplace, AggrInI2, None),
    entry!(AggrR1 -> AggrR2, AuthClass::DS,
        SmfFlags::FIRST_ENCRYPTED_INPUT | SmfFlags::OUTPUT_ENCRYPTED
            | SmfFlags::RELEASE_PENDING_P2 | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req PayloadSet::of(&[SIG]), opt PayloadSet::of(&[VID, NATD]),
        SaReplace, AggrInI2, None),

    // AGGR_I2 / AGGR_R2: only reachable again through packet loss
    entry!(AggrI2 -> AggrI2, AuthClass::ALL,
        SmfFlags::INITIATOR | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req NONE, opt NONE, Null, Unexpected, None),
    entry!(AggrR2 -> AggrR2, AuthClass::ALL, 0,
        req NONE, opt NONE, Null, Unexpected, None),

    /***** Phase 2 Quick Mode *****/

    // QUICK_R0: HDR*, HASH(1), SA, Ni [, KE ] [, IDci, IDcr ] -->
    //           HDR*, HASH(2), SA, Nr [, KE ] [, IDci, IDcr ]
    entry!(QuickR0 -> QuickR1, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[HASH, SA, NONCE]), opt PayloadSet::of(&[KE, ID, NATOA]),
        Retransmit, QuickInI1OutR1, Hash1),

    // QUICK_I1: HDR*, HASH(2), SA, Nr [...] --> HDR*, HASH(3)
    entry!(QuickI1 -> QuickI2, AuthClass::ALL,
        SmfFlags::INITIATOR | SmfFlags::ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[HASH, SA, NONCE]), opt PayloadSet::of(&[KE, ID, NATOA]),
        SaReplace, QuickInR1OutI2, Hash2),

    // QUICK_R1: HDR*, HASH(3) --> done
    entry!(QuickR1 -> QuickR2, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req PayloadSet::of(&[HASH]), opt NONE,
        SaReplace, QuickInI2, Hash3),

    // QUICK_I2 / QUICK_R2: only reachable again through packet loss
    entry!(QuickI2 -> QuickI2, AuthClass::ALL,
        SmfFlags::INITIATOR | SmfFlags::ENCRYPTED | SmfFlags::RETRANSMIT_ON_DUPLICATE,
        req NONE, opt NONE, Null, Unexpected, None),
    entry!(QuickR2 -> QuickR2, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req NONE, opt NONE, Null, Unexpected, None),

    /***** Informational exchanges *****/

    // HDR N/D, unencrypted; must not occur once keying material exists
    entry!(Info -> Info, AuthClass::ALL, 0,
        req NONE, opt NONE, Null, Informational, None),

    // HDR* N/D
    entry!(InfoProtected -> InfoProtected, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req PayloadSet::of(&[HASH]), opt NONE,
        Null, Informational, Hash1),

    /***** XAUTH server *****/

    entry!(XauthR0 -> XauthR1, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        Null, XauthInR0, Hash1),
    entry!(XauthR1 -> MainR3, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        SaReplace, XauthInR1, Hash1),

    /***** Mode Config *****/

    entry!(ModeCfgR0 -> ModeCfgR1, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::REPLY,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        SaReplace, ModeCfgInR0, Hash1),
    entry!(ModeCfgR1 -> ModeCfgR2, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        SaReplace, ModeCfgInR1, Hash1),
    entry!(ModeCfgR2 -> ModeCfgR2, AuthClass::ALL, SmfFlags::ENCRYPTED,
        req NONE, opt NONE, Null, Unexpected, None),
    entry!(ModeCfgI1 -> MainI4, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        SaReplace, ModeCfgInR1, Hash1),

    /***** XAUTH client *****/

    entry!(XauthI0 -> XauthI1, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        Retransmit, XauthInI0, Hash1),
    entry!(XauthI1 -> MainI4, AuthClass::ALL,
        SmfFlags::ENCRYPTED | SmfFlags::REPLY | SmfFlags::RELEASE_PENDING_P2,
        req PayloadSet::of(&[MCFG, HASH]), opt PayloadSet::of(&[VID]),
        Retransmit, XauthInI1, Hash1),
];

/// All entries for a from-state, in table order
pub fn transitions_for(state: State) -> impl Iterator<Item = &'static Transition> {
    TRANSITIONS.iter().filter(move |t| t.from == state)
}

/// Select the microcode entry for a state
///
/// With a negotiated auth method, scans the state's entries for an
/// auth-class match; without one (initial messages), the first entry
/// is used. Returns `None` when the state has no matching entry, which
/// the dispatcher treats as an internal error.
pub fn select(state: State, auth: Option<AuthMethod>) -> Option<&'static Transition> {
    let mut entries = transitions_for(state);
    match auth {
        None => entries.next(),
        Some(method) => entries.find(|t| t.auth.matches(method)),
    }
}

/// Structural validation of the transition table
///
/// Enforced once at engine construction:
/// - entries for one state are contiguous
/// - every state's entries either start with an ALL-auth entry or
///   cover their expected authentication classes
/// - every encrypted non-first input with a real handler requires a
///   HASH payload and declares a hash type
///
/// # Panics
///
/// Panics with a description of the offending entry. The table is
/// static, so this can only fire on a broken build.
pub fn validate_table() {
    // contiguity: all entries of one state follow each other
    for (i, t) in TRANSITIONS.iter().enumerate() {
        if i > 0 && TRANSITIONS[i - 1].from != t.from {
            assert!(
                !TRANSITIONS[..i - 1].iter().any(|p| p.from == t.from),
                "transition table entries for {} are not contiguous",
                t.from
            );
        }
    }

    let mut seen: Vec<State> = Vec::new();
    for t in TRANSITIONS {
        if seen.contains(&t.from) {
            continue;
        }
        seen.push(t.from);

        let first = transitions_for(t.from).next().unwrap();
        if first.auth == AuthClass::ALL {
            continue;
        }

        // auth-sensitive state: check class coverage
        let covered =
            transitions_for(t.from).fold(AuthClass::NONE, |acc, e| acc.union(e.auth));
        let expected = match t.from {
            State::MainR1 | State::MainI2 | State::MainR2 | State::MainI3 => AuthClass::ALL,
            // Aggressive Mode only implements PSK and signatures
            State::AggrR0 | State::AggrI1 | State::AggrR1 => {
                AuthClass::PSK.union(AuthClass::DS)
            }
            s => panic!("state {} has auth-split entries but no coverage rule", s),
        };
        assert!(
            covered == expected,
            "state {} covers the wrong auth classes",
            t.from
        );
    }

    for t in TRANSITIONS {
        let encrypted_followup = t.has(SmfFlags::INPUT_ENCRYPTED)
            && !t.has(SmfFlags::FIRST_ENCRYPTED_INPUT)
            && t.handler != Handler::Unexpected;
        if encrypted_followup {
            assert!(
                t.required.contains(PayloadType::Hash),
                "transition {} -> {} ({}) missing HASH payload",
                t.from,
                t.to,
                t.name
            );
            assert!(
                t.hash != HashType::None,
                "transition {} -> {} ({}) missing HASH protection",
                t.from,
                t.to,
                t.name
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_set() {
        let set = PayloadSet::of(&[PayloadType::Sa, PayloadType::Hash]);
        assert!(set.contains(PayloadType::Sa));
        assert!(set.contains(PayloadType::Hash));
        assert!(!set.contains(PayloadType::Nonce));
        assert!(!set.is_empty());

        let mut set = set;
        set.remove(PayloadType::Sa);
        set.remove(PayloadType::Hash);
        assert!(set.is_empty());
    }

    #[test]
    fn test_payload_set_names() {
        let set = PayloadSet::of(&[PayloadType::KeyExchange, PayloadType::Nonce]);
        let names = set.names();
        assert!(names.contains(&"ISAKMP_NEXT_KE"));
        assert!(names.contains(&"ISAKMP_NEXT_NONCE"));
    }

    #[test]
    fn test_auth_class_matching() {
        assert!(AuthClass::ALL.matches(AuthMethod::PreSharedKey));
        assert!(AuthClass::ALL.matches(AuthMethod::RsaRevisedEncryption));
        assert!(AuthClass::PSK.matches(AuthMethod::PreSharedKey));
        assert!(!AuthClass::PSK.matches(AuthMethod::RsaSignature));
        assert!(AuthClass::DS.matches(AuthMethod::RsaSignature));
        assert!(AuthClass::DS.matches(AuthMethod::DssSignature));
        assert!(!AuthClass::DS.matches(AuthMethod::RsaEncryption));
    }

    #[test]
    fn test_table_is_valid() {
        validate_table();
    }

    #[test]
    fn test_select_initial_message_uses_first_entry() {
        let t = select(State::MainR0, None).unwrap();
        assert_eq!(t.handler, Handler::MainInI1OutR1);
        assert_eq!(t.to, State::MainR1);
        assert_eq!(t.timeout, EventType::SoDiscard);
    }

    #[test]
    fn test_select_by_auth_class() {
        let psk = select(State::MainR2, Some(AuthMethod::PreSharedKey)).unwrap();
        assert!(psk.required.contains(PayloadType::Hash));

        let sig = select(State::MainR2, Some(AuthMethod::RsaSignature)).unwrap();
        assert!(sig.required.contains(PayloadType::Signature));
        assert_eq!(sig.handler, Handler::MainInI3OutR3);

        let pke = select(State::MainR2, Some(AuthMethod::RsaEncryption)).unwrap();
        assert_eq!(pke.handler, Handler::Unexpected);
    }

    #[test]
    fn test_quick_mode_entries_declare_hashes() {
        assert_eq!(select(State::QuickR0, None).unwrap().hash, HashType::Hash1);
        assert_eq!(select(State::QuickI1, None).unwrap().hash, HashType::Hash2);
        assert_eq!(select(State::QuickR1, None).unwrap().hash, HashType::Hash3);
    }

    #[test]
    fn test_terminal_states_stay_put() {
        let t = select(State::MainR3, Some(AuthMethod::PreSharedKey)).unwrap();
        assert_eq!(t.to, State::MainR3);
        assert_eq!(t.handler, Handler::Unexpected);
        assert_eq!(t.timeout, EventType::Null);
        assert!(t.has(SmfFlags::RETRANSMIT_ON_DUPLICATE));
    }

    #[test]
    fn test_aggressive_has_no_pke_entries() {
        assert!(select(State::AggrR0, Some(AuthMethod::RsaEncryption)).is_none());
        assert!(select(State::AggrR0, Some(AuthMethod::PreSharedKey)).is_some());
    }

    #[test]
    fn test_xauth_completion_lands_in_main_mode() {
        assert_eq!(select(State::XauthR1, None).unwrap().to, State::MainR3);
        assert_eq!(select(State::XauthI1, None).unwrap().to, State::MainI4);
        assert_eq!(select(State::ModeCfgI1, None).unwrap().to, State::MainI4);
    }
}
