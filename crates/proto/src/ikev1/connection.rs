//! Connection policy records
//!
//! A connection describes one configured peering: who the peer claims
//! to be, how it authenticates, lifetimes and rekey policy, and which
//! XAUTH / Mode Config roles each side plays. The engine treats
//! connections as read-mostly; identity refinement and the Cisco
//! load-balance redirect are the only mutations.

use super::constants::{AuthMethod, IdType};
use super::dpd::DpdConfig;
use super::error::{Error, Result};
use std::net::{IpAddr, SocketAddr};

/// Index of a connection in the [`ConnectionTable`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub usize);

/// An identity: type plus raw identification data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdSpec {
    /// Identification type
    pub id_type: IdType,
    /// Identification data (address bytes, FQDN, ...)
    pub data: Vec<u8>,
}

impl IdSpec {
    /// FQDN identity
    pub fn fqdn(name: &str) -> Self {
        IdSpec {
            id_type: IdType::Fqdn,
            data: name.as_bytes().to_vec(),
        }
    }

    /// IPv4 address identity
    pub fn ipv4(addr: [u8; 4]) -> Self {
        IdSpec {
            id_type: IdType::Ipv4Addr,
            data: addr.to_vec(),
        }
    }
}

/// One configured peering
#[derive(Debug, Clone)]
pub struct Connection {
    /// Connection name, as logged
    pub name: String,
    /// Our identity
    pub local_id: IdSpec,
    /// Expected peer identity; `None` accepts any (wildcard),
    /// concretized on the first authenticated ID
    pub peer_id: Option<IdSpec>,
    /// Authentication methods this connection accepts
    pub auth: Vec<AuthMethod>,
    /// Pre-shared secret, when PSK authentication is allowed
    pub psk: Option<Vec<u8>>,
    /// Our endpoint
    pub local_addr: SocketAddr,
    /// Peer endpoint
    pub peer_addr: SocketAddr,
    /// Next-hop gateway, when routed
    pub nexthop: Option<IpAddr>,
    /// Source address override for tunnel traffic
    pub srcip: Option<IpAddr>,
    /// Peer client address, when the peer proxies for a host
    pub client_addr: Option<IpAddr>,
    /// ISAKMP SA lifetime in seconds
    pub ike_life_seconds: u32,
    /// IPsec SA lifetime in seconds
    pub ipsec_life_seconds: u32,
    /// Margin before expiry at which rekeying starts
    pub rekey_margin_seconds: u32,
    /// Random spread added to the initiator's rekey margin, percent
    pub rekey_fuzz_percent: u32,
    /// Never initiate rekeying; let SAs expire or the peer rekey
    pub dont_rekey: bool,
    /// DPD policy, when enabled
    pub dpd: Option<DpdConfig>,
    /// Use Aggressive Mode when initiating; also disables NAT-T
    /// payload acceptance and connection switching as a responder
    pub aggressive: bool,
    /// Accept inbound IKE fragments
    pub allow_fragmentation: bool,
    /// RFC NAT-T negotiation enabled
    pub nat_t: bool,
    /// We challenge the peer with XAUTH
    pub xauth_server: bool,
    /// We answer XAUTH challenges
    pub xauth_client: bool,
    /// We hand out Mode Config attributes
    pub modecfg_server: bool,
    /// We request Mode Config attributes
    pub modecfg_client: bool,
    /// Client pulls configuration (request/reply) instead of
    /// server push (set/ack)
    pub modecfg_pull: bool,
    /// Defer Quick Mode until Mode Config completes (SoftRemote
    /// interop)
    pub quick_requires_modecfg: bool,
    /// XAUTH username/password for the client role
    pub xauth_credentials: Option<(String, String)>,
    /// Address handed out by the Mode Config server role
    pub modecfg_pool: Option<[u8; 4]>,
    /// Our client subnet for Quick Mode selectors (address, mask)
    pub local_subnet: Option<[u8; 8]>,
    /// Peer client subnet for Quick Mode selectors (address, mask)
    pub peer_subnet: Option<[u8; 8]>,
}

impl Connection {
    /// Create a builder
    pub fn builder(name: &str) -> ConnectionBuilder {
        ConnectionBuilder::new(name)
    }

    /// Whether this connection accepts the given base auth method
    pub fn allows_auth(&self, method: AuthMethod) -> bool {
        self.auth.contains(&method)
    }

    /// Whether the claimed peer identity matches this connection
    ///
    /// A wildcard (no configured peer id) matches anything.
    pub fn matches_peer_id(&self, claimed: &IdSpec) -> bool {
        match &self.peer_id {
            None => true,
            Some(expected) => expected == claimed,
        }
    }
}

/// Builder for [`Connection`]
#[derive(Debug)]
pub struct ConnectionBuilder {
    conn: Connection,
}

impl ConnectionBuilder {
    fn new(name: &str) -> Self {
        let unset: SocketAddr = "0.0.0.0:500".parse().expect("static address");
        ConnectionBuilder {
            conn: Connection {
                name: name.to_string(),
                local_id: IdSpec::fqdn("local"),
                peer_id: None,
                auth: vec![AuthMethod::PreSharedKey],
                psk: None,
                local_addr: unset,
                peer_addr: unset,
                nexthop: None,
                srcip: None,
                client_addr: None,
                ike_life_seconds: 28800,
                ipsec_life_seconds: 3600,
                rekey_margin_seconds: 540,
                rekey_fuzz_percent: 100,
                dont_rekey: false,
                dpd: None,
                aggressive: false,
                allow_fragmentation: true,
                nat_t: false,
                xauth_server: false,
                xauth_client: false,
                modecfg_server: false,
                modecfg_client: false,
                modecfg_pull: true,
                quick_requires_modecfg: false,
                xauth_credentials: None,
                modecfg_pool: None,
                local_subnet: None,
                peer_subnet: None,
            },
        }
    }

    /// Set our identity
    pub fn with_local_id(mut self, id: IdSpec) -> Self {
        self.conn.local_id = id;
        self
    }

    /// Set the expected peer identity
    pub fn with_peer_id(mut self, id: IdSpec) -> Self {
        self.conn.peer_id = Some(id);
        self
    }

    /// Set the pre-shared key
    pub fn with_psk(mut self, psk: &[u8]) -> Self {
        self.conn.psk = Some(psk.to_vec());
        self
    }

    /// Set the allowed authentication methods
    pub fn with_auth(mut self, auth: Vec<AuthMethod>) -> Self {
        self.conn.auth = auth;
        self
    }

    /// Set our endpoint
    pub fn with_local_addr(mut self, addr: SocketAddr) -> Self {
        self.conn.local_addr = addr;
        self
    }

    /// Set the peer endpoint
    pub fn with_peer_addr(mut self, addr: SocketAddr) -> Self {
        self.conn.peer_addr = addr;
        self
    }

    /// Set SA lifetimes
    pub fn with_lifetimes(mut self, ike_seconds: u32, ipsec_seconds: u32) -> Self {
        self.conn.ike_life_seconds = ike_seconds;
        self.conn.ipsec_life_seconds = ipsec_seconds;
        self
    }

    /// Set rekey margin and fuzz
    pub fn with_rekey_margin(mut self, margin_seconds: u32, fuzz_percent: u32) -> Self {
        self.conn.rekey_margin_seconds = margin_seconds;
        self.conn.rekey_fuzz_percent = fuzz_percent;
        self
    }

    /// Disable active rekeying
    pub fn with_dont_rekey(mut self) -> Self {
        self.conn.dont_rekey = true;
        self
    }

    /// Enable DPD
    pub fn with_dpd(mut self, config: DpdConfig) -> Self {
        self.conn.dpd = Some(config);
        self
    }

    /// Use Aggressive Mode
    pub fn with_aggressive(mut self) -> Self {
        self.conn.aggressive = true;
        self
    }

    /// Forbid inbound IKE fragments
    pub fn without_fragmentation(mut self) -> Self {
        self.conn.allow_fragmentation = false;
        self
    }

    /// Enable RFC NAT-T negotiation
    pub fn with_nat_t(mut self) -> Self {
        self.conn.nat_t = true;
        self
    }

    /// Set XAUTH roles
    pub fn with_xauth(mut self, server: bool, client: bool) -> Self {
        self.conn.xauth_server = server;
        self.conn.xauth_client = client;
        self
    }

    /// Set Mode Config roles
    pub fn with_modecfg(mut self, server: bool, client: bool) -> Self {
        self.conn.modecfg_server = server;
        self.conn.modecfg_client = client;
        self
    }

    /// Set XAUTH client credentials
    pub fn with_xauth_credentials(mut self, username: &str, password: &str) -> Self {
        self.conn.xauth_credentials = Some((username.to_string(), password.to_string()));
        self
    }

    /// Set the Mode Config address pool (single address)
    pub fn with_modecfg_pool(mut self, addr: [u8; 4]) -> Self {
        self.conn.modecfg_pool = Some(addr);
        self
    }

    /// Defer Quick Mode until Mode Config completes
    pub fn with_quick_requires_modecfg(mut self) -> Self {
        self.conn.quick_requires_modecfg = true;
        self
    }

    /// Set the Quick Mode client subnets (address, mask)
    pub fn with_subnets(mut self, local: [u8; 8], peer: [u8; 8]) -> Self {
        self.conn.local_subnet = Some(local);
        self.conn.peer_subnet = Some(peer);
        self
    }

    /// Validate and build
    ///
    /// # Errors
    ///
    /// Returns error when the policy is inconsistent (PSK auth without
    /// a key, XAUTH client without credentials, no auth method).
    pub fn build(self) -> Result<Connection> {
        let conn = self.conn;
        if conn.auth.is_empty() {
            return Err(Error::InvalidParameter(
                "at least one authentication method required".to_string(),
            ));
        }
        if conn.allows_auth(AuthMethod::PreSharedKey) && conn.psk.is_none() {
            return Err(Error::InvalidParameter(
                "PSK authentication requires a pre-shared key".to_string(),
            ));
        }
        if conn.xauth_client && conn.xauth_credentials.is_none() {
            return Err(Error::InvalidParameter(
                "XAUTH client role requires credentials".to_string(),
            ));
        }
        if conn.xauth_server && conn.xauth_client {
            return Err(Error::InvalidParameter(
                "cannot be both XAUTH server and client".to_string(),
            ));
        }
        if conn.modecfg_server && conn.modecfg_pool.is_none() {
            return Err(Error::InvalidParameter(
                "Mode Config server role requires an address pool".to_string(),
            ));
        }
        Ok(conn)
    }
}

/// The local connection table
#[derive(Debug, Default)]
pub struct ConnectionTable {
    items: Vec<Connection>,
}

impl ConnectionTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection
    pub fn add(&mut self, conn: Connection) -> ConnectionId {
        self.items.push(conn);
        ConnectionId(self.items.len() - 1)
    }

    /// Look up a connection
    pub fn get(&self, id: ConnectionId) -> Option<&Connection> {
        self.items.get(id.0)
    }

    /// Look up a connection mutably
    pub fn get_mut(&mut self, id: ConnectionId) -> Option<&mut Connection> {
        self.items.get_mut(id.0)
    }

    /// Find the connection responsible for an inbound peer
    ///
    /// An exact peer-address match wins; otherwise the first
    /// connection with an unspecified peer address serves as the
    /// catch-all.
    pub fn find_for_peer(&self, peer: SocketAddr) -> Option<ConnectionId> {
        if let Some(pos) = self.items.iter().position(|c| c.peer_addr == peer) {
            return Some(ConnectionId(pos));
        }
        if let Some(pos) = self
            .items
            .iter()
            .position(|c| c.peer_addr.ip() == peer.ip())
        {
            return Some(ConnectionId(pos));
        }
        self.items
            .iter()
            .position(|c| c.peer_addr.ip().is_unspecified())
            .map(ConnectionId)
    }

    /// Find a connection by name
    pub fn find_by_name(&self, name: &str) -> Option<ConnectionId> {
        self.items
            .iter()
            .position(|c| c.name == name)
            .map(ConnectionId)
    }

    /// Refine the connection choice for an authenticated peer identity
    ///
    /// Returns the best match for (claimed identity, auth method):
    /// an exact peer-id match wins over a wildcard, and the current
    /// connection wins ties so established choices are sticky.
    pub fn refine(
        &self,
        claimed: &super::connection::IdSpec,
        auth: AuthMethod,
        current: ConnectionId,
    ) -> Option<ConnectionId> {
        let exact = |c: &Connection| c.peer_id.as_ref() == Some(claimed) && c.allows_auth(auth);
        let wildcard = |c: &Connection| c.peer_id.is_none() && c.allows_auth(auth);

        if self.get(current).map(exact).unwrap_or(false) {
            return Some(current);
        }
        if let Some(pos) = self.items.iter().position(exact) {
            return Some(ConnectionId(pos));
        }
        if self.get(current).map(wildcard).unwrap_or(false) {
            return Some(current);
        }
        self.items.iter().position(wildcard).map(ConnectionId)
    }
}
