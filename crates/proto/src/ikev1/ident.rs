//! Phase 1 identity decoding and connection refinement
//!
//! The first authenticated Phase 1 message carries the peer's claimed
//! identity. The initiator holds the peer to the identity it was
//! configured with; a Main Mode responder may instead discover that a
//! different connection matches the claim better and rebind the SA to
//! it, redoing the decode exactly once. Aggressive Mode responders
//! cannot switch: the SA offer was already accepted under the original
//! connection.

use super::connection::IdSpec;
use super::constants::{IdType, PayloadType};
use super::engine::Engine;
use super::payload::{IdView, MessageDigest};
use super::sa::IkeSa;
use tracing::{debug, info, warn};

/// UDP protocol number, the only one legal in a Phase 1 ID
const IPPROTO_UDP: u8 = 17;

/// IKE port
const IKE_PORT: u16 = 500;

/// NAT-T port
const NATT_PORT: u16 = 4500;

/// Outcome of certificate payload processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertOutcome {
    /// No certificate payloads present
    None,
    /// Certificate bogus or revoked
    Bad,
    /// Certificate valid but does not match the claimed identity
    MismatchedId,
    /// Certificate matches the claimed identity
    IdOk,
}

/// Process certificate payloads
///
/// Certificate validation itself is a collaborator concern; payloads
/// are recognized and counted here so the refinement logic can branch
/// on the outcome shape.
fn process_certs(md: &MessageDigest) -> CertOutcome {
    if md.chain_first(PayloadType::Certificate).is_none() {
        debug!("no CERT payloads to process");
        CertOutcome::None
    } else {
        debug!(
            count = md.chain_len(PayloadType::Certificate),
            "CERT payloads present; deferring validation to the trust anchor store"
        );
        CertOutcome::IdOk
    }
}

/// Decode certificate request payloads (logged, answered by policy)
fn decode_cert_requests(md: &MessageDigest) {
    let n = md.chain_len(PayloadType::CertRequest);
    if n > 0 {
        debug!(count = n, "peer sent certificate requests");
    }
}

/// Decode the peer's Phase 1 identity and settle the connection
///
/// Returns false when the identity is unacceptable; the caller fails
/// the transition. May rebind `sa.connection` when called as a Main
/// Mode responder.
pub(crate) fn decode_peer_id(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &MessageDigest,
    initiator: bool,
    aggrmode: bool,
) -> bool {
    decode_peer_id_inner(engine, sa, md, initiator, aggrmode, 0)
}

fn decode_peer_id_inner(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &MessageDigest,
    initiator: bool,
    aggrmode: bool,
    depth: u8,
) -> bool {
    let id_pd = match md.chain_first(PayloadType::Identification) {
        Some(pd) => pd,
        None => {
            warn!(sa = %sa.serial, "no ID payload where one is required");
            return false;
        }
    };
    let id = match IdView::parse(md.payload_bytes(id_pd)) {
        Ok(id) => id,
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "malformed ID payload");
            return false;
        }
    };

    // RFC 2407 4.6.2 talks about protocol and port fields, but in
    // Phase 1 there is no good reason for them to be anything but 0/0
    // or UDP/500. Warn and continue; several vendors get this wrong.
    let port_ok = (id.protocol_id == 0 && id.port == 0)
        || (id.protocol_id == IPPROTO_UDP && id.port == IKE_PORT);
    let natt_ok = sa.hidden.nat_traversal
        && id.protocol_id == IPPROTO_UDP
        && (id.port == 0 || id.port == NATT_PORT);
    if natt_ok {
        debug!(
            protocol = id.protocol_id,
            port = id.port,
            "Phase 1 ID protocol/port accepted with port-floating NAT-T"
        );
    } else if !port_ok {
        warn!(
            protocol = id.protocol_id,
            port = id.port,
            "protocol/port in Phase 1 ID payload should be 0/0 or 17/500 (attempting to continue)"
        );
    }

    let claimed = match IdType::from_u8(id.id_type) {
        Some(id_type) => IdSpec {
            id_type,
            data: id.data.clone(),
        },
        None => {
            warn!(sa = %sa.serial, id_type = id.id_type, "unknown ID type");
            return false;
        }
    };

    sa.peer_id_body = md.payload_bytes(id_pd).to_vec();

    info!(
        sa = %sa.serial,
        id_type = ?claimed.id_type,
        id = %String::from_utf8_lossy(&claimed.data),
        "peer ID decoded"
    );

    match process_certs(md) {
        CertOutcome::None | CertOutcome::IdOk => {}
        CertOutcome::Bad => {
            warn!(sa = %sa.serial, "CERT payload bogus or revoked");
            return false;
        }
        CertOutcome::MismatchedId => {
            warn!(sa = %sa.serial, "CERT payload does not match connection ID");
            if initiator || aggrmode {
                // cannot switch connection, so fail
                return false;
            }
        }
    }

    decode_cert_requests(md);

    let auth = match sa.oakley.as_ref().map(|o| o.auth) {
        Some(a) => a,
        None => {
            warn!(sa = %sa.serial, "ID decode before auth negotiation");
            return false;
        }
    };

    if initiator {
        // We chose the peer; it must be who we configured.
        let conn = match engine.connections.get(sa.connection) {
            Some(c) => c,
            None => return false,
        };
        if !conn.matches_peer_id(&claimed) {
            warn!(
                sa = %sa.serial,
                connection = %conn.name,
                "we require the peer to have the configured ID, but it declares another"
            );
            return false;
        }
        // a wildcard is concretized by the authenticated claim
        if conn.peer_id.is_none() {
            if let Some(c) = engine.connections.get_mut(sa.connection) {
                c.peer_id = Some(claimed);
            }
        }
        return true;
    }

    if aggrmode {
        // Aggressive Mode responders are stuck with their connection.
        let conn = match engine.connections.get(sa.connection) {
            Some(c) => c,
            None => return false,
        };
        if !conn.matches_peer_id(&claimed) {
            warn!(sa = %sa.serial, "peer ID mismatch on aggressive mode connection");
            return false;
        }
        return true;
    }

    // Main Mode responder: look for a better-matching connection.
    match engine.connections.refine(&claimed, auth, sa.connection) {
        None => {
            warn!(sa = %sa.serial, "no suitable connection for peer");
            false
        }
        Some(better) if better != sa.connection => {
            let old = engine
                .connections
                .get(sa.connection)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            let new = engine
                .connections
                .get(better)
                .map(|c| c.name.clone())
                .unwrap_or_default();
            info!(sa = %sa.serial, from = %old, to = %new, "switched connection");
            sa.connection = better;
            if depth >= 1 {
                warn!(sa = %sa.serial, "connection refinement recursed; stopping");
                return false;
            }
            // redo from scratch so CERT payloads are re-checked
            // against the new connection; bounded to one level
            decode_peer_id_inner(engine, sa, md, false, false, depth + 1)
        }
        Some(same) => {
            let conn = engine.connections.get_mut(same);
            if let Some(conn) = conn {
                if conn.peer_id.is_none() {
                    conn.peer_id = Some(claimed);
                }
            }
            true
        }
    }
}
