//! Transition dispatcher
//!
//! Handlers return a single result code; everything that follows —
//! advancing state, arming exactly one timer, remembering packets,
//! sending the reply, firing queued Phase 2 work, tearing the SA down
//! on failure — happens here and only here.

use super::connection::Connection;
use super::engine::{Engine, EventKind};
use super::constants::{NotifyType, MAX_ACCEPTED_DUPLICATES};
use super::microcode::{transitions_for, EventType, SmfFlags};
use super::payload::MessageDigest;
use super::sa::IkeSa;
use super::state::State;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Result of a state transition handler
///
/// Handlers never advance state or schedule timers themselves; they
/// report one of these and the dispatcher owns the side effects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerResult {
    /// Transition succeeded; commit it
    Ok,
    /// A cryptographic helper is in flight; park the message
    Suspend,
    /// Drop silently, no state change
    Ignore,
    /// Transition failed; emit the notification if any
    Fail(Option<NotifyType>),
    /// Unrecoverable; delete the SA
    Fatal,
    /// A bug, not a peer problem; keep the SA to avoid cascading
    InternalError,
}

/// Recognize and, if appropriate, answer a byte-identical duplicate
///
/// Returns true when the packet was a duplicate and has been fully
/// handled (replayed or dropped).
pub(crate) fn check_duplicate(engine: &mut Engine, sa: &mut IkeSa, packet: &[u8]) -> bool {
    if sa.rpacket.is_empty() || sa.rpacket != packet {
        return false;
    }

    // Only re-transmit when the transition this packet drove the
    // first time produced a reply, and the current state wants
    // duplicates answered.
    let replied = sa
        .last_transition
        .map(|t| t.has(SmfFlags::REPLY))
        .unwrap_or(false);
    let retransmit_on_duplicate =
        transitions_for(sa.state).any(|t| t.has(SmfFlags::RETRANSMIT_ON_DUPLICATE));

    if replied && retransmit_on_duplicate {
        // Half-open transitions always answer re-transmits; everything
        // else is capped.
        let half_open = sa
            .last_transition
            .map(|t| t.timeout == EventType::SoDiscard)
            .unwrap_or(false);
        if half_open || sa.dup_count < MAX_ACCEPTED_DUPLICATES {
            if !half_open {
                sa.dup_count += 1;
            }
            info!(
                sa = %sa.serial,
                state = sa.state.name(),
                "retransmitting in response to duplicate packet"
            );
            let reply = sa.tpacket.clone();
            engine.send_to(sa.remote, sa.local, reply);
        } else {
            warn!(
                sa = %sa.serial,
                state = sa.state.name(),
                "discarding duplicate packet -- exhausted retransmission"
            );
        }
    } else {
        debug!(
            sa = %sa.serial,
            state = sa.state.name(),
            replied,
            retransmit_on_duplicate,
            "discarding duplicate packet"
        );
    }
    true
}

/// Complete the job a transition handler started
///
/// `sa` is taken out of the table for the duration of processing; this
/// function consumes it on deletion (leaving `None`) and otherwise
/// leaves it for the caller to put back.
pub(crate) fn complete_state_transition(
    engine: &mut Engine,
    now: Instant,
    sa_opt: &mut Option<IkeSa>,
    mut md: MessageDigest,
    result: HandlerResult,
) {
    match result {
        HandlerResult::Suspend => {
            if let Some(sa) = sa_opt.as_mut() {
                debug!(sa = %sa.serial, "transition suspended awaiting crypto helper");
                md.reply = None;
                sa.suspended = Some(Box::new(md));
                sa.helper_in_flight = true;
            }
        }
        HandlerResult::Ignore => {}
        HandlerResult::Ok => {
            let sa = match sa_opt.as_mut() {
                Some(sa) => sa,
                None => {
                    error!("transition succeeded without a state object");
                    return;
                }
            };
            commit_transition(engine, now, sa, &md);
        }
        HandlerResult::Fail(note) => {
            let note = note.or(md.note);
            match sa_opt.as_mut() {
                Some(sa) => {
                    warn!(
                        sa = %sa.serial,
                        state = sa.state.name(),
                        notify = ?note,
                        "state transition failed"
                    );
                    if let Some(n) = note {
                        engine.send_notification_from_state(sa, n);
                    }
                }
                None => {
                    warn!(notify = ?note, "state transition failed with no state object");
                    if let Some(n) = note {
                        engine.send_notification_from_md(&md, n);
                    }
                }
            }
            // Quick Mode children are discarded; Phase 1 SAs stay for
            // the peer's retransmit. An SA that never advanced past
            // its initial state has nothing to retransmit.
            let discard = sa_opt
                .as_ref()
                .map(|sa| {
                    sa.state.is_quick() || matches!(sa.state, State::MainR0 | State::AggrR0)
                })
                .unwrap_or(false);
            if discard {
                let dead = sa_opt.take().unwrap();
                engine.cleanup_sa(dead);
            }
        }
        HandlerResult::Fatal => {
            if let Some(mut sa) = sa_opt.take() {
                remember_received_packet(&mut sa, &md);
                error!(sa = %sa.serial, state = sa.state.name(), "encountered fatal error");
                engine.cleanup_sa(sa);
            }
        }
        HandlerResult::InternalError => {
            if let Some(sa) = sa_opt.as_mut() {
                remember_received_packet(sa, &md);
                error!(
                    sa = %sa.serial,
                    state = sa.state.name(),
                    "state transition function had internal error"
                );
            }
        }
    }
}

/// Replace the previous received packet with the latest
///
/// Important even for failing and suspended transitions: the sender
/// may well retransmit. Idempotent, since crypto helper logic can
/// re-enter with the same message.
fn remember_received_packet(sa: &mut IkeSa, md: &MessageDigest) {
    sa.rpacket = md.packet.clone();
    sa.dup_count = 0;
}

fn commit_transition(engine: &mut Engine, now: Instant, sa: &mut IkeSa, md: &MessageDigest) {
    let t = match md.transition {
        Some(t) => t,
        None => {
            error!(sa = %sa.serial, "transition commit without microcode entry");
            return;
        }
    };
    let conn = match engine.connections.get(sa.connection).cloned() {
        Some(c) => c,
        None => {
            error!(sa = %sa.serial, "transition commit without connection");
            return;
        }
    };
    let from_state = sa.state;

    // accept info from VIDs because we accept this message
    if md.fragvid {
        debug!(sa = %sa.serial, "peer supports fragmentation");
        sa.seen_fragvid = true;
    }
    if md.dpd_vid {
        debug!(sa = %sa.serial, "peer supports DPD");
        sa.hidden.peer_supports_dpd = true;
    }
    if md.nortel_vid {
        debug!(sa = %sa.serial, "peer requires Nortel Contivity workaround");
        sa.seen_nortel = true;
    }
    if md.natt_rfc_vid && conn.nat_t {
        sa.hidden.nat_traversal = true;
    }

    // Phase 2 exchanges reserve their message id on the parent
    if sa.is_child() && sa.msgid != 0 {
        if let Some(parent) = sa.parent.and_then(|p| engine.sas.get_mut(p)) {
            parent.msgids.reserve(sa.msgid);
        }
    }

    info!(
        sa = %sa.serial,
        state_from = from_state.name(),
        state_to = t.to.name(),
        "IKEv1 state transition"
    );
    sa.state = t.to;

    // XAUTH without ModeCFG cannot follow the regular table: the CFG
    // status ack looks identical whether or not ModeCFG follows. Jump
    // to the established state so Quick Mode can proceed.
    if conn.xauth_client
        && sa.hidden.xauth_client_done
        && !conn.modecfg_client
        && sa.state == State::XauthI1
    {
        info!(sa = %sa.serial, "XAUTH completed; ModeCFG skipped as per configuration");
        sa.state = if conn.aggressive {
            State::AggrI2
        } else {
            State::MainI4
        };
        sa.msgids.phase15 = 0;
    }

    // the previous timer is always replaced
    engine.clear_timers(sa.serial);

    sa.fragments.clear();

    remember_received_packet(sa, md);
    sa.last_transition = Some(t);

    if t.has(SmfFlags::REPLY) {
        match &md.reply {
            Some(reply) => {
                debug!(sa = %sa.serial, to = %sa.remote, "sending reply packet");
                sa.tpacket = reply.clone();
                sa.retransmit_count = 0;
                engine.send_to(sa.remote, sa.local, reply.clone());
            }
            None => error!(sa = %sa.serial, "transition wants a reply but none was built"),
        }
    }

    // carry the CBC chain forward; the last Phase 1 block seeds
    // Phase 2 IVs
    if !sa.new_iv.is_empty() {
        sa.iv = sa.new_iv.clone();
        if md.hdr.message_id == 0 {
            sa.phase1_iv = sa.iv.clone();
        }
    }

    // After the ad hoc jump above, the entry's RETRANSMIT timer makes
    // no sense for a finished exchange; the SA lives on its lifetime.
    let mut timeout = t.timeout;
    if conn.xauth_client
        && sa.hidden.xauth_client_done
        && !conn.modecfg_client
        && matches!(sa.state, State::MainI4 | State::AggrI2)
        && timeout == EventType::Retransmit
    {
        debug!(sa = %sa.serial, "fixup XAUTH without ModeCFG event to SA replacement");
        timeout = EventType::SaReplace;
    }
    schedule_timeout(engine, now, sa, &conn, timeout, t.has(SmfFlags::INITIATOR));

    let established = sa.state.is_established();
    let code = if established || sa.state.is_quick() {
        2 // success class
    } else {
        100 + sa.state.index()
    };
    engine.events.progress(sa.serial.0, code, sa.state.name());

    // a new established ISAKMP SA gets its DPD probe cycle
    if established && conn.dpd.is_some() && sa.hidden.peer_supports_dpd {
        let interval = conn.dpd.unwrap().interval;
        engine.schedule(sa.serial, EventKind::DpdCheck, now + interval);
    }

    // XAUTH server: challenge the peer once the ISAKMP SA stands
    if conn.xauth_server {
        let doing_xauth = sa.oakley.as_ref().map(|o| o.doing_xauth).unwrap_or(false);
        if doing_xauth && established {
            debug!(sa = %sa.serial, "XAUTH: scheduling login/password request");
            engine.schedule(sa.serial, EventKind::SendXauth, now);
            return;
        }
    }

    // XAUTH client: stay here and let the server query us
    if !sa.state.is_quick() && conn.xauth_client && !sa.hidden.xauth_client_done {
        debug!(sa = %sa.serial, "XAUTH client is not yet authenticated");
        return;
    }

    // ModeCFG client in pull mode initiates the request
    if conn.modecfg_client
        && established
        && conn.modecfg_pull
        && !sa.hidden.modecfg_started
    {
        debug!(sa = %sa.serial, "modecfg client is starting");
        super::handlers::modecfg_send_request(engine, sa, now);
        return;
    }

    // ModeCFG server in push mode sets the peer's address unasked
    if conn.modecfg_server
        && established
        && !sa.hidden.modecfg_vars_set
        && !conn.modecfg_pull
    {
        info!(sa = %sa.serial, "sending MODE CONFIG set");
        sa.state = State::ModeCfgR1;
        super::handlers::modecfg_send_set(engine, sa, now);
        return;
    }

    // Nortel Contivity clients expect the responder to start Quick
    // Mode once ModeCFG is done
    if !t.has(SmfFlags::INITIATOR) && sa.state.is_mode_cfg_established() && sa.seen_nortel {
        info!(sa = %sa.serial, "Nortel 'Contivity Mode' detected, starting Quick Mode");
        sa.state = State::MainR3;
        engine.queue_quick(sa.connection);
        engine.defer_release(sa.connection);
        return;
    }

    // ModeCFG client still waiting for its variables
    if conn.modecfg_client && established && !sa.hidden.modecfg_vars_set {
        debug!(sa = %sa.serial, "waiting for modecfg set from server");
        return;
    }

    if t.has(SmfFlags::RELEASE_PENDING_P2) {
        debug!(sa = %sa.serial, "phase 1 is done, looking for phase 2 to unpend");
        engine.defer_release(sa.connection);
    }
}

/// Arm the declared post-transition timer
///
/// SA_REPLACE runs the rekey-margin computation: the delay is the
/// negotiated lifetime (the smaller of ours and theirs when we agreed
/// to be dictated to), minus the rekey margin. The initiator adds
/// randomized fuzz to its margin so both ends do not rekey in
/// lockstep; the responder halves it. When the margin does not fit,
/// or rekeying is disabled and the time was dictated, the SA expires
/// instead.
fn schedule_timeout(
    engine: &mut Engine,
    now: Instant,
    sa: &IkeSa,
    conn: &Connection,
    timeout: EventType,
    initiator: bool,
) {
    match timeout {
        EventType::Retransmit => {
            engine.schedule(
                sa.serial,
                EventKind::Retransmit,
                now + engine.config.retransmit_interval,
            );
        }
        EventType::SoDiscard => {
            engine.schedule(
                sa.serial,
                EventKind::SoDiscard,
                now + engine.config.so_discard_timeout,
            );
        }
        EventType::SaReplace => {
            let mut agreed_time = false;
            let mut delay = if sa.state.is_phase1() || sa.state.is_phase15() {
                let mut d = u64::from(conn.ike_life_seconds);
                let negotiated =
                    u64::from(sa.oakley.as_ref().map(|o| o.life_seconds).unwrap_or(0));
                if negotiated != 0 && (conn.dont_rekey || d >= negotiated) {
                    agreed_time = true;
                    d = negotiated;
                }
                d
            } else {
                let mut d = u64::from(conn.ipsec_life_seconds);
                if let Some(p) = &sa.p2_proposal {
                    if u64::from(p.life_seconds) <= d {
                        agreed_time = true;
                        d = u64::from(p.life_seconds);
                    }
                }
                d
            };

            let mut kind = EventKind::SaReplace;
            if agreed_time && conn.dont_rekey {
                // the peer dictated the time; without rekeying the only
                // way to honor it is to expire
                kind = if initiator {
                    EventKind::SaReplace
                } else {
                    EventKind::SaExpire
                };
            }
            if kind != EventKind::SaExpire {
                let mut margin = u64::from(conn.rekey_margin_seconds);
                if initiator {
                    let fuzz = rand::random::<f64>() * f64::from(conn.rekey_fuzz_percent) / 100.0;
                    margin += (margin as f64 * fuzz) as u64;
                } else {
                    margin /= 2;
                }
                if delay > margin {
                    delay -= margin;
                } else {
                    kind = EventKind::SaExpire;
                }
            }
            engine.schedule(sa.serial, kind, now + Duration::from_secs(delay));
        }
        EventType::Null => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handler_result_variants() {
        assert_ne!(HandlerResult::Ok, HandlerResult::Ignore);
        assert_eq!(
            HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
            HandlerResult::Fail(Some(NotifyType::PayloadMalformed))
        );
    }
}
