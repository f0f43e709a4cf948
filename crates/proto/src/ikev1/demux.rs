//! Packet demultiplexer
//!
//! Classifies a parsed ISAKMP header by exchange type and message id,
//! locates or creates the owning SA, and resolves the `from_state`
//! that selects the microcode. Fragmented messages detour through the
//! reassembler and re-enter here whole.

use super::constants::{ExchangeType, NotifyType, PayloadType, MAINMODE_MSGID};
use super::dispatch::check_duplicate;
use super::engine::Engine;
use super::fragment::parse_fragment;
use super::hash::phase2_iv;
use super::microcode;
use super::payload::MessageDigest;
use super::sa::{IkeSa, Role, SerialNo};
use super::state::State;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Route one inbound message
pub(crate) fn process_packet(engine: &mut Engine, now: Instant, mut md: MessageDigest) {
    let hdr = md.hdr.clone();
    let icookie = hdr.initiator_spi;
    let rcookie = hdr.responder_spi;
    let msgid = hdr.message_id;

    let mut serial: Option<SerialNo> = None;
    let from_state: State;

    match hdr.exchange() {
        Some(ExchangeType::IdProt) | Some(ExchangeType::Aggressive) => {
            if msgid != MAINMODE_MSGID {
                warn!(msgid = format_args!("{:#010x}", msgid), "message ID should be zero in phase 1");
                engine.send_notification_from_md(&md, NotifyType::InvalidMessageId);
                return;
            }
            if hdr.initiator_spi_is_zero() {
                warn!("initiator cookie must not be zero in phase 1 message");
                engine.send_notification_from_md(&md, NotifyType::InvalidCookie);
                return;
            }

            if hdr.responder_spi_is_zero() {
                // initial message from an initiator
                if md.wire_encrypted() {
                    warn!("initial phase 1 message is invalid: its Encrypted Flag is on");
                    engine.send_notification_from_md(&md, NotifyType::InvalidFlags);
                    return;
                }

                // an existing state with this cookie means some sort
                // of re-transmit
                if let Some(existing) = engine.sas.find_init(&icookie, MAINMODE_MSGID) {
                    if let Some(mut sa) = engine.sas.take(existing) {
                        if !check_duplicate(engine, &mut sa, &md.packet) {
                            info!(
                                sa = %sa.serial,
                                state = sa.state.name(),
                                "discarding initial packet; already past it"
                            );
                        }
                        engine.sas.put(sa);
                    }
                    return;
                }

                let conn = match engine.connections.find_for_peer(md.sender) {
                    Some(c) => c,
                    None => {
                        warn!(peer = %md.sender, "initial message from a peer no connection covers");
                        return;
                    }
                };
                let initial = if hdr.exchange() == Some(ExchangeType::IdProt) {
                    State::MainR0
                } else {
                    State::AggrR0
                };
                let new_serial = engine.sas.next_serial();
                let sa = IkeSa::new(
                    new_serial,
                    Role::Responder,
                    icookie,
                    [0u8; 8],
                    initial,
                    conn,
                    md.sender,
                    md.local,
                );
                engine.sas.put(sa);
                serial = Some(new_serial);
                from_state = initial;
            } else {
                // not an initial message; perhaps the responder's
                // first reply, introducing its cookie
                let found = engine
                    .sas
                    .find_full(&icookie, &rcookie, MAINMODE_MSGID)
                    .or_else(|| engine.sas.find_init(&icookie, MAINMODE_MSGID));
                match found {
                    Some(s) => {
                        serial = Some(s);
                        from_state = engine.sas.get(s).map(|sa| sa.state).unwrap_or(State::Info);
                    }
                    None => {
                        warn!("phase 1 message is part of an unknown exchange");
                        return;
                    }
                }
            }
        }

        Some(ExchangeType::Informational) => {
            serial = engine
                .sas
                .find_full(&icookie, &rcookie, MAINMODE_MSGID)
                .or_else(|| engine.sas.find_init(&icookie, MAINMODE_MSGID));

            if md.wire_encrypted() {
                let s = match serial {
                    Some(s) => s,
                    None => {
                        debug!(
                            msgid = format_args!("{:#010x}", msgid),
                            "informational exchange for an unknown (expired?) SA"
                        );
                        return;
                    }
                };
                let sa = match engine.sas.get_mut(s) {
                    Some(sa) => sa,
                    None => return,
                };
                if !sa.state.has_keymat() {
                    warn!(
                        sa = %sa.serial,
                        "encrypted informational exchange message is invalid because no key is known"
                    );
                    return;
                }
                if msgid == MAINMODE_MSGID {
                    warn!("informational exchange message is invalid because it has a Message ID of 0");
                    return;
                }
                if !sa.msgids.unique(msgid) {
                    warn!(
                        msgid = format_args!("{:#010x}", msgid),
                        "informational exchange message has a previously used Message ID"
                    );
                    return;
                }
                sa.msgids.reserve(msgid);

                if let (Some(prf), Some(bs)) = (sa.prf(), sa.block_size()) {
                    sa.new_iv = phase2_iv(prf, &sa.phase1_iv, msgid, bs);
                    md.new_iv_set = true;
                }
                from_state = State::InfoProtected;
            } else {
                if let Some(sa) = serial.and_then(|s| engine.sas.get(s)) {
                    if sa.state.is_authenticated() {
                        warn!(sa = %sa.serial, "informational exchange message must be encrypted");
                        return;
                    }
                }
                from_state = State::Info;
            }
        }

        Some(ExchangeType::Quick) => {
            if hdr.initiator_spi_is_zero() || hdr.responder_spi_is_zero() {
                debug!("Quick Mode message has a zero cookie");
                engine.send_notification_from_md(&md, NotifyType::InvalidCookie);
                return;
            }
            if msgid == MAINMODE_MSGID {
                debug!("Quick Mode message has a Message ID of 0");
                engine.send_notification_from_md(&md, NotifyType::InvalidMessageId);
                return;
            }

            if let Some(child) = engine.sas.find_full(&icookie, &rcookie, msgid) {
                // continuation of a negotiation in progress
                let sa = engine.sas.get(child).expect("serial just found");
                if sa.oakley.as_ref().map(|o| o.doing_xauth).unwrap_or(false) {
                    info!("cannot do Quick Mode until XAUTH done");
                    return;
                }
                serial = Some(child);
                from_state = sa.state;
            } else {
                let parent_serial =
                    match engine.sas.find_full(&icookie, &rcookie, MAINMODE_MSGID) {
                        Some(p) => p,
                        None => {
                            debug!("Quick Mode message is for a non-existent (expired?) ISAKMP SA");
                            return;
                        }
                    };
                let conn = {
                    let parent = engine.sas.get_mut(parent_serial).expect("serial just found");
                    if parent
                        .oakley
                        .as_ref()
                        .map(|o| o.doing_xauth)
                        .unwrap_or(false)
                    {
                        info!("cannot do Quick Mode until XAUTH done");
                        return;
                    }
                    // the peer got its address; ISAKMP is up
                    if parent.state == State::ModeCfgR2 {
                        parent.state = State::MainR3;
                    }
                    parent.connection
                };

                let quick_requires_modecfg = engine
                    .connections
                    .get(conn)
                    .map(|c| c.quick_requires_modecfg)
                    .unwrap_or(false);

                let parent = engine.sas.get_mut(parent_serial).expect("serial just found");
                if quick_requires_modecfg && parent.state == State::ModeCfgR1 {
                    info!("SoftRemote workaround: cannot do Quick Mode until MODECFG done");
                    return;
                }
                let settled = parent.state.is_established()
                    || matches!(parent.state, State::ModeCfgR1 | State::ModeCfgR2);
                if !settled {
                    warn!(
                        sa = %parent.serial,
                        state = parent.state.name(),
                        "Quick Mode message is unacceptable because it is for an incomplete ISAKMP SA"
                    );
                    engine.send_notification_from_md(&md, NotifyType::PayloadMalformed);
                    return;
                }
                if !parent.msgids.unique(msgid) {
                    warn!(
                        msgid = format_args!("{:#010x}", msgid),
                        "Quick Mode I1 message uses a previously used Message ID (perhaps a duplicated packet)"
                    );
                    engine.send_notification_from_md(&md, NotifyType::InvalidMessageId);
                    return;
                }
                parent.msgids.reserve(msgid);

                // Quick Mode initial IV, and a child to carry the
                // negotiation
                let child_serial = engine.sas.next_serial();
                let mut child = engine
                    .sas
                    .get(parent_serial)
                    .expect("serial just found")
                    .spawn_child(child_serial, Role::Responder, msgid);
                child.state = State::QuickR0;
                if let (Some(prf), Some(bs)) = (child.prf(), child.block_size()) {
                    child.new_iv = phase2_iv(prf, &child.phase1_iv, msgid, bs);
                    md.new_iv_set = true;
                }
                engine.sas.put(child);
                serial = Some(child_serial);
                from_state = State::QuickR0;
            }
        }

        Some(ExchangeType::ModeCfg) => {
            if hdr.initiator_spi_is_zero() || hdr.responder_spi_is_zero() {
                debug!("Mode Config message has a zero cookie");
                return;
            }
            if msgid == 0 {
                debug!("Mode Config message has a Message ID of 0");
                return;
            }

            let s = match engine.sas.find_full(&icookie, &rcookie, MAINMODE_MSGID) {
                Some(s) => s,
                None => {
                    debug!("Mode Config message is for a non-existent (expired?) ISAKMP SA");
                    return;
                }
            };
            let conn_id = match engine.sas.get(s) {
                Some(sa) => sa.connection,
                None => return,
            };
            let conn = match engine.connections.get(conn_id) {
                Some(c) => c.clone(),
                None => return,
            };
            let sa = engine.sas.get_mut(s).expect("serial just found");
            serial = Some(s);

            if sa.msgids.phase15 == msgid {
                // continuation of the running Phase 1.5 exchange
                if conn.xauth_server && sa.state.is_phase1() {
                    debug!(sa = %sa.serial, "phase 1 with a config message; moving to XAUTH_R0");
                    sa.state = State::XauthR0;
                }
                from_state = sa.state;
            } else {
                let settled = sa.state.is_established() || sa.state.is_phase15();
                if !settled {
                    debug!(
                        sa = %sa.serial,
                        state = sa.state.name(),
                        "Mode Config message is unacceptable because it is for an incomplete ISAKMP SA"
                    );
                    return;
                }
                if let (Some(prf), Some(bs)) = (sa.prf(), sa.block_size()) {
                    sa.new_iv = phase2_iv(prf, &sa.phase1_iv, msgid, bs);
                    md.new_iv_set = true;
                }

                // A fresh message id: figure out whether this is an
                // XAUTH conversation (and which side we are) or a
                // MODECFG one. We cannot be both server and client;
                // policy says which.
                if conn.xauth_server && sa.state == State::XauthR1 {
                    // a reply to our challenge under a restarted msgid
                    from_state = State::XauthR1;
                } else if conn.xauth_client
                    && (sa.state.is_phase1() || sa.state.is_established())
                {
                    from_state = State::XauthI0;
                } else if conn.xauth_client && sa.state == State::XauthI1 {
                    // a new challenge after I0; the server wants to
                    // start over
                    from_state = State::XauthI0;
                } else if conn.modecfg_server
                    && (sa.state.is_phase1() || sa.state.is_established())
                {
                    from_state = State::ModeCfgR0;
                } else if conn.modecfg_client
                    && (sa.state.is_phase1() || sa.state.is_established())
                {
                    from_state = State::ModeCfgR1;
                } else {
                    warn!(
                        sa = %sa.serial,
                        state = sa.state.name(),
                        "Mode Config message does not fit any configured role"
                    );
                    engine.send_notification_from_md(&md, NotifyType::UnsupportedExchangeType);
                    return;
                }
            }
        }

        _ => {
            warn!(
                exchange = hdr.exchange_type,
                "unsupported exchange type in message"
            );
            engine.send_notification_from_md(&md, NotifyType::UnsupportedExchangeType);
            return;
        }
    }

    // The Commit flag is unprotected; honoring it invites DoS. Ignore
    // it with a warning.
    if hdr.flags.is_commit() {
        warn!("IKE message has the Commit Flag set; ignoring flag");
    }

    // fragmented messages detour through the reassembler
    if hdr.next_payload == PayloadType::Fragment.to_u8() {
        handle_fragment(engine, now, serial, md);
        return;
    }

    // select the microcode entry
    let auth = serial
        .and_then(|s| engine.sas.get(s))
        .and_then(|sa| sa.oakley.as_ref())
        .map(|o| o.auth);
    let transition = match microcode::select(from_state, auth) {
        Some(t) => t,
        None => {
            warn!(
                state = from_state.name(),
                ?auth,
                "no microcode entry matches this state and auth method"
            );
            return;
        }
    };
    md.from_state = Some(from_state);
    md.transition = Some(transition);
    md.sa = serial;

    if let Some(s) = serial {
        let mut sa = match engine.sas.take(s) {
            Some(sa) => sa,
            None => return,
        };

        if check_duplicate(engine, &mut sa, &md.packet) {
            engine.sas.put(sa);
            return;
        }

        // Encrypted traffic cannot be handled until the helper
        // delivers SKEYID; park the digest, newest wins.
        if md.wire_encrypted() && !sa.hidden.skeyid_calculated {
            debug!(
                sa = %sa.serial,
                "received encrypted packet but exponentiation still in progress"
            );
            if sa.suspended.is_some() {
                debug!(sa = %sa.serial, "releasing previously suspended message");
            }
            sa.suspended = Some(Box::new(md));
            engine.sas.put(sa);
            return;
        }

        // helper busy on something else: the peer's retransmit will
        // drive the retry
        if sa.helper_in_flight {
            debug!(sa = %sa.serial, "state is busy with a crypto helper; discarding packet");
            engine.sas.put(sa);
            return;
        }

        engine.sas.put(sa);
    }

    engine.process_tail(now, serial, md);
}

/// Buffer one fragment; feed the reassembled message back through the
/// demultiplexer once complete
fn handle_fragment(
    engine: &mut Engine,
    now: Instant,
    serial: Option<SerialNo>,
    md: MessageDigest,
) {
    let serial = match serial {
        Some(s) => s,
        None => {
            debug!("received IKE fragment, but have no state; ignoring packet");
            return;
        }
    };
    let conn_id = engine.sas.get(serial).map(|sa| sa.connection);
    let allow = conn_id
        .and_then(|c| engine.connections.get(c))
        .map(|c| c.allow_fragmentation)
        .unwrap_or(false);
    if !allow {
        debug!("discarding IKE fragment packet - fragmentation not allowed by local policy");
        return;
    }

    let parsed = match parse_fragment(&md.body) {
        Ok(p) => p,
        Err(e) => {
            warn!(error = %e, "malformed IKE fragment");
            engine.send_notification_from_md(&md, NotifyType::PayloadMalformed);
            return;
        }
    };
    debug!(
        id = parsed.id,
        index = parsed.fragment.index,
        last = parsed.fragment.last,
        "received IKE fragment"
    );

    let whole = {
        let sa = match engine.sas.get_mut(serial) {
            Some(sa) => sa,
            None => return,
        };
        sa.fragments.insert(parsed.fragment);
        let whole = sa.fragments.reassemble();
        if whole.is_some() {
            sa.fragments.clear();
            // respond using fragments too, without waiting for
            // re-transmits
            sa.seen_fragments = true;
        }
        whole
    };

    if let Some(buffer) = whole {
        debug!(bytes = buffer.len(), "reassembled fragmented message");
        engine.process_raw(now, md.sender, md.local, &buffer);
    }
}
