//! Informational exchange processing
//!
//! RFC 2408 Section 4.8: an informational message carries Notification
//! or Delete payloads. DPD probes are answered, malformed-payload
//! counters are tracked (too many kill the SA), the Cisco
//! load-balance redirect rewrites the connection and re-initiates,
//! and everything unknown is logged and ignored.

use super::constants::{NotifyType, PayloadType, ProtocolId, IPSEC_DOI};
use super::dispatch::HandlerResult;
use super::dpd;
use super::engine::Engine;
use super::payload::{DeleteView, MessageDigest, NotificationView};
use super::sa::IkeSa;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Process an informational exchange
///
/// Mirrors the table: both the plaintext and HASH(1)-protected entries
/// land here. Deletion side effects happen through the engine; the
/// current SA may be consumed (Cisco load balance, malformed
/// overflow).
pub(crate) fn informational(
    engine: &mut Engine,
    now: Instant,
    sa_opt: &mut Option<IkeSa>,
    md: &MessageDigest,
) -> HandlerResult {
    let n_pld = match md.chain_first(PayloadType::Notification) {
        Some(pd) => pd,
        None => {
            // warn if there was neither a Notify nor a Delete payload
            if md.chain_first(PayloadType::Delete).is_none() {
                warn!("received and ignored empty informational notification payload");
            }
            return HandlerResult::Ignore;
        }
    };

    let n = match NotificationView::parse(md.payload_bytes(n_pld)) {
        Ok(n) => n,
        Err(e) => {
            warn!(error = %e, "malformed notification payload in informational exchange");
            return HandlerResult::Ignore;
        }
    };

    debug!(notify = n.notify_type, kind = ?n.kind(), "processing informational");

    match n.kind() {
        // We answer DPD probes even if the peer claimed not to support
        // DPD; we would have to send something to stop a retransmit
        // anyway.
        Some(NotifyType::RUThere) => {
            let sa = match sa_opt.as_mut() {
                Some(sa) => sa,
                None => {
                    warn!("received bogus R_U_THERE informational message");
                    return HandlerResult::Ignore;
                }
            };
            let seqno = match dpd::parse_seqno(&n.data) {
                Some(s) => s,
                None => {
                    warn!(sa = %sa.serial, "R_U_THERE without a 4-byte sequence number");
                    return HandlerResult::Ignore;
                }
            };
            if sa.dpd.recv_r_u_there(seqno) {
                let ack = NotificationView {
                    doi: IPSEC_DOI,
                    protocol_id: ProtocolId::Isakmp.to_u8(),
                    spi: cookie_spi(sa),
                    notify_type: NotifyType::RUThereAck.to_u16(),
                    data: dpd::seqno_data(seqno),
                };
                engine.send_protected_info(
                    sa,
                    vec![(PayloadType::Notification, ack.to_bytes())],
                );
                // the peer is demonstrably alive
                engine.reschedule_dpd(sa, now);
            }
            HandlerResult::Ignore
        }

        Some(NotifyType::RUThereAck) => {
            let sa = match sa_opt.as_mut() {
                Some(sa) => sa,
                None => {
                    warn!("received bogus R_U_THERE_ACK informational message");
                    return HandlerResult::Ignore;
                }
            };
            if let Some(seqno) = dpd::parse_seqno(&n.data) {
                if sa.dpd.recv_ack(seqno) {
                    engine.reschedule_dpd(sa, now);
                }
            }
            HandlerResult::Ignore
        }

        Some(NotifyType::PayloadMalformed) => {
            let max = engine.config.max_malformed_notifies;
            let overflowed = match sa_opt.as_mut() {
                Some(sa) => {
                    sa.hidden.malformed_received += 1;
                    info!(
                        sa = %sa.serial,
                        received = sa.hidden.malformed_received,
                        "received malformed payload notify"
                    );
                    sa.hidden.malformed_sent > max / 2
                        && sa.hidden.malformed_sent + sa.hidden.malformed_received > max
                }
                None => false,
            };
            if overflowed {
                let dead = sa_opt.take().unwrap();
                warn!(
                    sa = %dead.serial,
                    sent = dead.hidden.malformed_sent,
                    received = dead.hidden.malformed_received,
                    "too many malformed payloads, deleting SA"
                );
                engine.cleanup_sa(dead);
            }
            HandlerResult::Ignore
        }

        Some(NotifyType::CiscoLoadBalance) => {
            cisco_load_balance(engine, now, sa_opt, &n);
            HandlerResult::Ignore
        }

        Some(NotifyType::IpsecResponderLifetime) | Some(NotifyType::InvalidMessageId) => {
            // meaningful inside Quick Mode processing; here just noted
            info!(notify = ?n.kind(), "notification logged and ignored");
            HandlerResult::Ignore
        }

        _ => {
            warn!(
                notify = n.notify_type,
                "received and ignored notification payload"
            );
            HandlerResult::Ignore
        }
    }
}

/// The SPI field of ISAKMP-protocol notifications: both cookies
fn cookie_spi(sa: &IkeSa) -> Vec<u8> {
    let mut spi = Vec::with_capacity(16);
    spi.extend_from_slice(&sa.icookie);
    spi.extend_from_slice(&sa.rcookie);
    spi
}

/// The Cisco load-balance redirect: the last four octets of the
/// notification are the new gateway address. The connection's host
/// addresses (and whatever else pointed at the old gateway) are
/// rewritten, the current SA is torn down, and a fresh initiation
/// goes to the new peer.
fn cisco_load_balance(
    engine: &mut Engine,
    now: Instant,
    sa_opt: &mut Option<IkeSa>,
    n: &NotificationView,
) {
    let (conn_id, old_port, old_addr) = match sa_opt.as_ref() {
        Some(sa) if sa.state.is_established() => {
            (sa.connection, sa.remote.port(), sa.remote.ip())
        }
        _ => {
            warn!("ignoring ISAKMP_N_CISCO_LOAD_BALANCE for unestablished state");
            return;
        }
    };
    if n.data.len() < 4 {
        warn!("ignoring ISAKMP_N_CISCO_LOAD_BALANCE without IPv4 address");
        return;
    }
    let tail = &n.data[n.data.len() - 4..];
    let new_peer = Ipv4Addr::new(tail[0], tail[1], tail[2], tail[3]);
    if new_peer.is_unspecified() {
        warn!("ignoring ISAKMP_N_CISCO_LOAD_BALANCE with invalid IPv4 address 0.0.0.0");
        return;
    }

    info!(%new_peer, %old_addr, "load-balance redirect, moving connection");

    if let Some(conn) = engine.connections.get_mut(conn_id) {
        // preserve the existing port; the notification has no port
        conn.peer_addr = SocketAddr::new(IpAddr::V4(new_peer), old_port);
        if conn.nexthop == Some(old_addr) {
            conn.nexthop = Some(IpAddr::V4(new_peer));
        }
        if conn.srcip == Some(old_addr) {
            conn.srcip = Some(IpAddr::V4(new_peer));
        }
        if conn.client_addr == Some(old_addr) {
            conn.client_addr = Some(IpAddr::V4(new_peer));
        }
    }

    // delete the ISAKMP SA with the current peer, then re-initiate
    let dead = sa_opt.take().unwrap();
    engine.cleanup_sa(dead);
    if let Err(e) = engine.initiate(now, conn_id) {
        warn!(error = %e, "re-initiation to redirected peer failed");
    }
}

/// Process Delete payloads before the handler runs
///
/// Returns true when the current SA deleted itself; the caller must
/// not touch it afterwards. Deletes arriving unprotected are ignored.
pub(crate) fn accept_deletes(
    engine: &mut Engine,
    sa_opt: &mut Option<IkeSa>,
    md: &MessageDigest,
) -> bool {
    let mut self_delete = false;

    let deletes: Vec<DeleteView> = md
        .chain(PayloadType::Delete)
        .filter_map(|pd| {
            if !md.encrypted {
                warn!("ignoring Delete SA payload: not encrypted");
                return None;
            }
            match DeleteView::parse(md.payload_bytes(pd)) {
                Ok(d) => Some(d),
                Err(e) => {
                    warn!(error = %e, "malformed Delete payload");
                    None
                }
            }
        })
        .collect();

    for d in deletes {
        if d.doi != IPSEC_DOI {
            warn!(doi = d.doi, "ignoring Delete SA payload with unknown DOI");
            continue;
        }
        match ProtocolId::from_u8(d.protocol_id) {
            Some(ProtocolId::Isakmp) => {
                for spi in &d.spis {
                    if spi.len() != 16 {
                        warn!(len = spi.len(), "ISAKMP Delete SPI has bad length");
                        continue;
                    }
                    let mut icookie = [0u8; 8];
                    let mut rcookie = [0u8; 8];
                    icookie.copy_from_slice(&spi[..8]);
                    rcookie.copy_from_slice(&spi[8..]);

                    if let Some(sa) = sa_opt.as_ref() {
                        if sa.icookie == icookie && sa.rcookie == rcookie {
                            info!(sa = %sa.serial, "received Delete for the present ISAKMP SA");
                            self_delete = true;
                            continue;
                        }
                    }
                    if let Some(serial) = engine.sas.find_full(&icookie, &rcookie, 0) {
                        info!(sa = %serial, "deleting ISAKMP SA per peer request");
                        engine.delete_sa(serial);
                    } else {
                        debug!("Delete for an unknown (expired?) ISAKMP SA");
                    }
                }
            }
            Some(ProtocolId::Esp) | Some(ProtocolId::Ah) => {
                for spi in &d.spis {
                    if spi.len() != 4 {
                        warn!(len = spi.len(), "IPsec Delete SPI has bad length");
                        continue;
                    }
                    let spi = u32::from_be_bytes([spi[0], spi[1], spi[2], spi[3]]);
                    if let Some(serial) = engine.sas.find_by_ipsec_spi(spi) {
                        info!(sa = %serial, spi, "deleting IPsec SA per peer request");
                        engine.delete_sa(serial);
                    } else {
                        debug!(spi, "Delete for an unknown IPsec SPI");
                    }
                }
            }
            _ => {
                warn!(
                    protocol = d.protocol_id,
                    "ignoring Delete SA payload for unsupported protocol"
                );
            }
        }
    }

    if self_delete {
        if let Some(dead) = sa_opt.take() {
            engine.cleanup_sa(dead);
        }
    }
    self_delete
}
