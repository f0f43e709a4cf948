//! IKE SA records and the SA table
//!
//! An [`IkeSa`] is one Phase 1 security association in progress or
//! established, or a Phase 2 child keyed by its Quick Mode message id.
//! The table indexes SAs by serial number; cookie-pair lookups scan,
//! which keeps the index maps from going stale when the responder
//! cookie is introduced mid-exchange.

use super::connection::ConnectionId;
use super::constants::AuthMethod;
use super::crypto::{CipherAlgorithm, DhGroup, KeyMaterial, PrfAlgorithm};
use super::dpd::DpdState;
use super::fragment::FragmentSet;
use super::microcode::Transition;
use super::payload::MessageDigest;
use super::proposal::IpsecProposal;
use super::state::State;
use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;

/// SA serial number, unique for the lifetime of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SerialNo(pub u64);

impl fmt::Display for SerialNo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Which end of the exchange this SA is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We initiated
    Initiator,
    /// The peer initiated
    Responder,
}

/// Negotiated Oakley (Phase 1) parameters
#[derive(Debug, Clone)]
pub struct OakleyParams {
    /// Base authentication method
    pub auth: AuthMethod,
    /// Raw wire authentication value (keeps the XAUTH variant)
    pub auth_wire: u16,
    /// Bulk cipher
    pub cipher: CipherAlgorithm,
    /// PRF / hash pairing
    pub prf: PrfAlgorithm,
    /// Diffie-Hellman group
    pub group: DhGroup,
    /// Negotiated lifetime in seconds
    pub life_seconds: u32,
    /// An XAUTH exchange is still pending on this SA
    pub doing_xauth: bool,
}

/// Flags and counters that do not drive the state machine directly
#[derive(Debug, Clone, Default)]
pub struct HiddenVariables {
    /// XAUTH client authentication finished
    pub xauth_client_done: bool,
    /// Mode Config exchange was started
    pub modecfg_started: bool,
    /// Mode Config variables were received / acknowledged
    pub modecfg_vars_set: bool,
    /// SKEYID and friends have been computed
    pub skeyid_calculated: bool,
    /// PAYLOAD-MALFORMED notifications we sent
    pub malformed_sent: u32,
    /// PAYLOAD-MALFORMED notifications we received
    pub malformed_received: u32,
    /// Peer announced DPD support
    pub peer_supports_dpd: bool,
    /// RFC NAT-T negotiated on this SA
    pub nat_traversal: bool,
}

/// Message-id bookkeeping for a Phase 1 SA
#[derive(Debug, Clone, Default)]
pub struct MsgidBook {
    used: Vec<u32>,
    /// Message id of the running Phase 1.5 exchange, when any
    pub phase15: u32,
}

impl MsgidBook {
    /// Whether a message id has never been seen on this SA
    pub fn unique(&self, msgid: u32) -> bool {
        !self.used.contains(&msgid)
    }

    /// Record a message id as used
    pub fn reserve(&mut self, msgid: u32) {
        if !self.used.contains(&msgid) {
            self.used.push(msgid);
        }
    }
}

/// One IKE security association
#[derive(Debug, Clone)]
pub struct IkeSa {
    /// Serial number
    pub serial: SerialNo,
    /// Initiator cookie
    pub icookie: [u8; 8],
    /// Responder cookie (zero until the responder picks one)
    pub rcookie: [u8; 8],
    /// Our role
    pub role: Role,
    /// Current state
    pub state: State,
    /// Owning connection
    pub connection: ConnectionId,
    /// Peer endpoint
    pub remote: SocketAddr,
    /// Local endpoint
    pub local: SocketAddr,
    /// Message id (zero for Phase 1 SAs, the Quick Mode id for
    /// children)
    pub msgid: u32,
    /// Parent Phase 1 SA, for children
    pub parent: Option<SerialNo>,
    /// Negotiated Oakley parameters
    pub oakley: Option<OakleyParams>,
    /// Phase 1 keying material
    pub keymat: Option<KeyMaterial>,

    /// Saved IV (last ciphertext block of the previous message)
    pub iv: Vec<u8>,
    /// Working IV for the message in flight
    pub new_iv: Vec<u8>,
    /// IV at the end of Phase 1, seed for Phase 2 IVs
    pub phase1_iv: Vec<u8>,

    /// Last fully processed inbound packet (duplicate detection)
    pub rpacket: Vec<u8>,
    /// Last sent packet (retransmission)
    pub tpacket: Vec<u8>,
    /// The transition last committed on this SA
    pub last_transition: Option<&'static Transition>,

    /// Initiator nonce of the active exchange
    pub ni: Vec<u8>,
    /// Responder nonce of the active exchange
    pub nr: Vec<u8>,
    /// Initiator DH public value
    pub g_xi: Vec<u8>,
    /// Responder DH public value
    pub g_xr: Vec<u8>,
    /// DH shared secret, once computed
    pub g_xy: Vec<u8>,
    /// Body of the initiator's Phase 1 SA payload (for the auth
    /// hashes)
    pub p1_sa_body: Vec<u8>,
    /// Body of our ID payload
    pub my_id_body: Vec<u8>,
    /// Body of the peer's ID payload
    pub peer_id_body: Vec<u8>,

    /// Accepted Phase 2 proposal (children only)
    pub p2_proposal: Option<IpsecProposal>,
    /// Our inbound IPsec SPI (children only)
    pub p2_local_spi: u32,
    /// Peer's inbound IPsec SPI (children only)
    pub p2_peer_spi: u32,

    /// Hidden variables
    pub hidden: HiddenVariables,
    /// Message-id book (Phase 1 SAs)
    pub msgids: MsgidBook,
    /// Buffered inbound fragments
    pub fragments: FragmentSet,
    /// Parked message waiting for a crypto helper
    pub suspended: Option<Box<MessageDigest>>,
    /// A helper request is in flight for this SA
    pub helper_in_flight: bool,
    /// Byte-identical duplicates answered so far
    pub dup_count: u32,
    /// Retransmissions sent so far
    pub retransmit_count: u32,
    /// DPD sequence state
    pub dpd: DpdState,

    /// Peer announced IKE fragmentation support
    pub seen_fragvid: bool,
    /// Peer actually sent us fragments
    pub seen_fragments: bool,
    /// Peer announced Nortel Contivity mode
    pub seen_nortel: bool,
}

impl IkeSa {
    /// Create a fresh SA
    pub fn new(
        serial: SerialNo,
        role: Role,
        icookie: [u8; 8],
        rcookie: [u8; 8],
        state: State,
        connection: ConnectionId,
        remote: SocketAddr,
        local: SocketAddr,
    ) -> Self {
        IkeSa {
            serial,
            icookie,
            rcookie,
            role,
            state,
            connection,
            remote,
            local,
            msgid: 0,
            parent: None,
            oakley: None,
            keymat: None,
            iv: Vec::new(),
            new_iv: Vec::new(),
            phase1_iv: Vec::new(),
            rpacket: Vec::new(),
            tpacket: Vec::new(),
            last_transition: None,
            ni: Vec::new(),
            nr: Vec::new(),
            g_xi: Vec::new(),
            g_xr: Vec::new(),
            g_xy: Vec::new(),
            p1_sa_body: Vec::new(),
            my_id_body: Vec::new(),
            peer_id_body: Vec::new(),
            p2_proposal: None,
            p2_local_spi: 0,
            p2_peer_spi: 0,
            hidden: HiddenVariables::default(),
            msgids: MsgidBook::default(),
            fragments: FragmentSet::new(),
            suspended: None,
            helper_in_flight: false,
            dup_count: 0,
            retransmit_count: 0,
            dpd: DpdState::default(),
            seen_fragvid: false,
            seen_fragments: false,
            seen_nortel: false,
        }
    }

    /// Spawn a Phase 2 child, sharing the parent's keying material
    pub fn spawn_child(&self, serial: SerialNo, role: Role, msgid: u32) -> IkeSa {
        let mut child = IkeSa::new(
            serial,
            role,
            self.icookie,
            self.rcookie,
            match role {
                Role::Initiator => State::QuickI1,
                Role::Responder => State::QuickR0,
            },
            self.connection,
            self.remote,
            self.local,
        );
        child.msgid = msgid;
        child.parent = Some(self.serial);
        child.oakley = self.oakley.clone();
        child.keymat = self.keymat.clone();
        child.phase1_iv = self.phase1_iv.clone();
        child.hidden.skeyid_calculated = self.hidden.skeyid_calculated;
        child.hidden.nat_traversal = self.hidden.nat_traversal;
        child
    }

    /// Whether this is a Phase 2 child
    pub fn is_child(&self) -> bool {
        self.parent.is_some()
    }

    /// Negotiated cipher, once Oakley parameters exist
    pub fn cipher(&self) -> Option<CipherAlgorithm> {
        self.oakley.as_ref().map(|o| o.cipher)
    }

    /// Negotiated cipher block size
    pub fn block_size(&self) -> Option<usize> {
        self.cipher().map(|c| c.block_size())
    }

    /// Negotiated PRF
    pub fn prf(&self) -> Option<PrfAlgorithm> {
        self.oakley.as_ref().map(|o| o.prf)
    }

    /// Token identifying this SA towards crypto helper backends
    pub fn helper_token(&self) -> u64 {
        self.serial.0
    }
}

/// The SA table
#[derive(Debug, Default)]
pub struct SaTable {
    sas: HashMap<u64, IkeSa>,
    next_serial: u64,
}

impl SaTable {
    /// Create an empty table
    pub fn new() -> Self {
        SaTable {
            sas: HashMap::new(),
            next_serial: 1,
        }
    }

    /// Allocate the next serial number
    pub fn next_serial(&mut self) -> SerialNo {
        let serial = SerialNo(self.next_serial);
        self.next_serial += 1;
        serial
    }

    /// Insert an SA (new or put back after processing)
    pub fn put(&mut self, sa: IkeSa) {
        self.sas.insert(sa.serial.0, sa);
    }

    /// Remove an SA for exclusive processing; put it back with `put`
    pub fn take(&mut self, serial: SerialNo) -> Option<IkeSa> {
        self.sas.remove(&serial.0)
    }

    /// Remove an SA permanently
    pub fn remove(&mut self, serial: SerialNo) -> Option<IkeSa> {
        self.sas.remove(&serial.0)
    }

    /// Borrow an SA
    pub fn get(&self, serial: SerialNo) -> Option<&IkeSa> {
        self.sas.get(&serial.0)
    }

    /// Borrow an SA mutably
    pub fn get_mut(&mut self, serial: SerialNo) -> Option<&mut IkeSa> {
        self.sas.get_mut(&serial.0)
    }

    /// Number of live SAs
    pub fn len(&self) -> usize {
        self.sas.len()
    }

    /// True when no SAs exist
    pub fn is_empty(&self) -> bool {
        self.sas.is_empty()
    }

    /// All serial numbers, unordered
    pub fn serials(&self) -> Vec<SerialNo> {
        self.sas.keys().map(|&k| SerialNo(k)).collect()
    }

    /// Find by initiator cookie and message id, ignoring the
    /// responder cookie (initial exchanges, replies introducing the
    /// responder cookie)
    pub fn find_init(&self, icookie: &[u8; 8], msgid: u32) -> Option<SerialNo> {
        self.sas
            .values()
            .filter(|sa| sa.icookie == *icookie && sa.msgid == msgid)
            .map(|sa| sa.serial)
            .min() // oldest wins, deterministically
    }

    /// Find by full cookie pair and message id
    pub fn find_full(&self, icookie: &[u8; 8], rcookie: &[u8; 8], msgid: u32) -> Option<SerialNo> {
        self.sas
            .values()
            .filter(|sa| sa.icookie == *icookie && sa.rcookie == *rcookie && sa.msgid == msgid)
            .map(|sa| sa.serial)
            .min()
    }

    /// Find the IPsec child owning an inbound SPI
    pub fn find_by_ipsec_spi(&self, spi: u32) -> Option<SerialNo> {
        self.sas
            .values()
            .filter(|sa| sa.is_child() && (sa.p2_local_spi == spi || sa.p2_peer_spi == spi))
            .map(|sa| sa.serial)
            .min()
    }

    /// All children of a Phase 1 SA
    pub fn children_of(&self, parent: SerialNo) -> Vec<SerialNo> {
        self.sas
            .values()
            .filter(|sa| sa.parent == Some(parent))
            .map(|sa| sa.serial)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn new_sa(table: &mut SaTable, icookie: [u8; 8], rcookie: [u8; 8], msgid: u32) -> SerialNo {
        let serial = table.next_serial();
        let mut sa = IkeSa::new(
            serial,
            Role::Responder,
            icookie,
            rcookie,
            State::MainR0,
            ConnectionId(0),
            addr("192.0.2.1:500"),
            addr("192.0.2.2:500"),
        );
        sa.msgid = msgid;
        table.put(sa);
        serial
    }

    #[test]
    fn test_serial_allocation() {
        let mut table = SaTable::new();
        let a = table.next_serial();
        let b = table.next_serial();
        assert!(b > a);
        assert_eq!(a.to_string(), "#1");
    }

    #[test]
    fn test_find_init_ignores_rcookie() {
        let mut table = SaTable::new();
        let serial = new_sa(&mut table, [1; 8], [0; 8], 0);

        assert_eq!(table.find_init(&[1; 8], 0), Some(serial));
        assert_eq!(table.find_init(&[2; 8], 0), None);
        assert_eq!(table.find_init(&[1; 8], 77), None);

        // rcookie gets introduced later; init lookup still works
        table.get_mut(serial).unwrap().rcookie = [9; 8];
        assert_eq!(table.find_init(&[1; 8], 0), Some(serial));
    }

    #[test]
    fn test_find_full_needs_both_cookies() {
        let mut table = SaTable::new();
        let serial = new_sa(&mut table, [1; 8], [2; 8], 0);

        assert_eq!(table.find_full(&[1; 8], &[2; 8], 0), Some(serial));
        assert_eq!(table.find_full(&[1; 8], &[0; 8], 0), None);
    }

    #[test]
    fn test_take_and_put() {
        let mut table = SaTable::new();
        let serial = new_sa(&mut table, [1; 8], [0; 8], 0);

        let sa = table.take(serial).unwrap();
        assert!(table.get(serial).is_none());
        table.put(sa);
        assert!(table.get(serial).is_some());
    }

    #[test]
    fn test_msgid_book() {
        let mut book = MsgidBook::default();
        assert!(book.unique(0xAABBCCDD));
        book.reserve(0xAABBCCDD);
        assert!(!book.unique(0xAABBCCDD));
        assert!(book.unique(0x11223344));
    }

    #[test]
    fn test_spawn_child_inherits_keys() {
        let mut table = SaTable::new();
        let serial = new_sa(&mut table, [1; 8], [2; 8], 0);
        {
            let sa = table.get_mut(serial).unwrap();
            sa.phase1_iv = vec![0x55; 16];
            sa.hidden.skeyid_calculated = true;
        }

        let child_serial = table.next_serial();
        let child = table
            .get(serial)
            .unwrap()
            .spawn_child(child_serial, Role::Initiator, 0xAABBCCDD);

        assert_eq!(child.parent, Some(serial));
        assert_eq!(child.msgid, 0xAABBCCDD);
        assert_eq!(child.state, State::QuickI1);
        assert_eq!(child.phase1_iv, vec![0x55; 16]);
        assert!(child.hidden.skeyid_calculated);
        assert!(child.is_child());

        table.put(child);
        assert_eq!(table.children_of(serial), vec![child_serial]);
        assert_eq!(
            table.find_full(&[1; 8], &[2; 8], 0xAABBCCDD),
            Some(child_serial)
        );
    }

    #[test]
    fn test_find_by_ipsec_spi() {
        let mut table = SaTable::new();
        let parent = new_sa(&mut table, [1; 8], [2; 8], 0);
        let child_serial = table.next_serial();
        let mut child = table
            .get(parent)
            .unwrap()
            .spawn_child(child_serial, Role::Responder, 5);
        child.p2_local_spi = 0x1111;
        child.p2_peer_spi = 0x2222;
        table.put(child);

        assert_eq!(table.find_by_ipsec_spi(0x1111), Some(child_serial));
        assert_eq!(table.find_by_ipsec_spi(0x2222), Some(child_serial));
        assert_eq!(table.find_by_ipsec_spi(0x3333), None);
    }
}
