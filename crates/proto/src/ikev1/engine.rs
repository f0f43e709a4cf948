//! The IKEv1 engine
//!
//! A single-threaded, event-loop-owned core: it ingests datagrams,
//! timer firings, and crypto helper completions, and emits datagrams
//! into an outbox the caller drains. All SA and connection state is
//! owned here; helper backends post completions back through
//! [`Engine::complete_dh`] and never touch SA state themselves.
//!
//! ```text
//! bytes --> demux --> (reassembly) --> integrity gate --> decoder
//!                                            |
//!   outbox <-- dispatcher <-- handler <------+
//! ```

use super::connection::{Connection, ConnectionId, ConnectionTable};
use super::constants::{
    ExchangeType, NotifyType, PayloadType, ProtocolId, IPSEC_DOI, MAINMODE_MSGID,
};
use super::decoder::{self, DecodeError};
use super::demux;
use super::dispatch;
use super::error::{Error, Result};
use super::handlers;
use super::hash;
use super::informational;
use super::message::{strip_non_esp_marker, IsakmpHeader, MessageBuilder};
use super::microcode::{self, HashType, SmfFlags};
use super::payload::{MessageDigest, NotificationView};
use super::sa::{IkeSa, Role, SaTable, SerialNo};
use super::state::State;
use oakley_platform::{DhBackend, EventSink, IpsecInstaller, SigBackend};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Engine tunables
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Combined sent+received PAYLOAD-MALFORMED threshold beyond which
    /// an SA is torn down
    pub max_malformed_notifies: u32,
    /// Base retransmission interval (doubles per attempt)
    pub retransmit_interval: Duration,
    /// Retransmissions before a non-responding exchange is abandoned
    pub max_retransmits: u32,
    /// How long a half-open responder SA is kept
    pub so_discard_timeout: Duration,
    /// Set the reserved header bit 5 on replies (interop testing)
    pub impair_bogus_flag: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            max_malformed_notifies: 16,
            retransmit_interval: Duration::from_millis(500),
            max_retransmits: 5,
            so_discard_timeout: Duration::from_secs(10),
            impair_bogus_flag: false,
        }
    }
}

/// One outbound datagram
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Destination
    pub to: SocketAddr,
    /// Source to send from
    pub from: SocketAddr,
    /// Wire bytes
    pub bytes: Vec<u8>,
}

/// Timer event kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    /// Retransmit the last sent packet
    Retransmit,
    /// Rekey the SA before it expires
    SaReplace,
    /// Expire the SA without rekeying
    SaExpire,
    /// Abandon a half-open SA
    SoDiscard,
    /// Send or give up on a DPD probe
    DpdCheck,
    /// XAUTH server: send the credential request
    SendXauth,
}

#[derive(Debug, Clone)]
struct TimerEntry {
    at: Instant,
    sa: SerialNo,
    kind: EventKind,
}

/// The protocol engine
pub struct Engine {
    pub(crate) config: EngineConfig,
    pub(crate) connections: ConnectionTable,
    pub(crate) sas: SaTable,
    timers: Vec<TimerEntry>,
    pending_p2: Vec<ConnectionId>,
    deferred_release: Vec<ConnectionId>,
    outbox: Vec<Datagram>,
    pub(crate) dh: Box<dyn DhBackend>,
    pub(crate) sig: Option<Box<dyn SigBackend>>,
    pub(crate) installer: Box<dyn IpsecInstaller>,
    pub(crate) events: Box<dyn EventSink>,
}

impl Engine {
    /// Create an engine with the given collaborators
    ///
    /// Validates the transition table once; a broken table is a build
    /// defect and panics immediately.
    pub fn new(
        config: EngineConfig,
        dh: Box<dyn DhBackend>,
        installer: Box<dyn IpsecInstaller>,
    ) -> Self {
        microcode::validate_table();
        Engine {
            config,
            connections: ConnectionTable::new(),
            sas: SaTable::new(),
            timers: Vec::new(),
            pending_p2: Vec::new(),
            deferred_release: Vec::new(),
            outbox: Vec::new(),
            dh,
            sig: None,
            installer,
            events: Box::new(()),
        }
    }

    /// Attach a signature backend for DSS/RSA authentication
    pub fn with_sig_backend(mut self, sig: Box<dyn SigBackend>) -> Self {
        self.sig = Some(sig);
        self
    }

    /// Attach an admin progress sink
    pub fn with_event_sink(mut self, events: Box<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Register a connection
    pub fn add_connection(&mut self, conn: Connection) -> ConnectionId {
        self.connections.add(conn)
    }

    /// Borrow a connection
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(id)
    }

    /// Borrow the SA table (introspection, tests)
    pub fn sas(&self) -> &SaTable {
        &self.sas
    }

    /// Datagrams waiting to be sent
    pub fn drain_outbox(&mut self) -> Vec<Datagram> {
        std::mem::take(&mut self.outbox)
    }

    /// Earliest pending timer deadline
    pub fn next_timeout(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.at).min()
    }

    /// Timer kinds currently armed for an SA (introspection, tests)
    pub fn timer_kinds(&self, sa: SerialNo) -> Vec<EventKind> {
        self.timers
            .iter()
            .filter(|t| t.sa == sa)
            .map(|t| t.kind)
            .collect()
    }

    // ---- inbound path ----

    /// Ingest one UDP datagram
    ///
    /// Frames received on the NAT-T port carry a non-ESP marker; a
    /// frame without one is ESP-in-UDP and not ours.
    pub fn handle_datagram(&mut self, now: Instant, from: SocketAddr, local: SocketAddr, data: &[u8]) {
        let data = if local.port() == 4500 {
            match strip_non_esp_marker(data) {
                Some(d) => d,
                None => {
                    debug!(%from, "frame on NAT-T port without non-ESP marker; not IKE");
                    return;
                }
            }
        } else {
            data
        };
        self.process_raw(now, from, local, data);
    }

    /// Process a datagram whose framing has been dealt with
    pub(crate) fn process_raw(
        &mut self,
        now: Instant,
        from: SocketAddr,
        local: SocketAddr,
        data: &[u8],
    ) {
        let hdr = match IsakmpHeader::from_bytes(data) {
            Ok(h) => h,
            Err(e) => {
                debug!(%from, error = %e, "dropping unparseable datagram");
                return;
            }
        };
        if hdr.length as usize > data.len() {
            warn!(
                %from,
                declared = hdr.length,
                actual = data.len(),
                "dropping datagram shorter than its declared length"
            );
            return;
        }
        let packet = data[..hdr.length as usize].to_vec();
        let md = MessageDigest::new(packet, hdr, from, local);
        demux::process_packet(self, now, md);
    }

    /// The dispatcher tail: integrity gate, payload decode, HASH
    /// check, informational pre-scans, handler, post-processing
    ///
    /// Re-entered with a previously suspended digest when a helper
    /// completes; the `parsed`/`hash_checked` guards make that cheap.
    pub(crate) fn process_tail(
        &mut self,
        now: Instant,
        serial: Option<SerialNo>,
        mut md: MessageDigest,
    ) {
        let mut sa_opt = serial.and_then(|s| self.sas.take(s));

        let transition = match md.transition {
            Some(t) => t,
            None => {
                if let Some(sa) = sa_opt {
                    self.sas.put(sa);
                }
                return;
            }
        };
        let from_state = md.from_state.unwrap_or(State::Info);

        if md.wire_encrypted() {
            let decrypted = match sa_opt.as_mut() {
                Some(sa) => match hash::decrypt_inbound(sa, &mut md) {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(sa = %sa.serial, error = %e, "discarding encrypted message");
                        false
                    }
                },
                None => {
                    warn!("discarding encrypted message for an unknown ISAKMP SA");
                    return;
                }
            };
            if !decrypted {
                if let Some(sa) = sa_opt {
                    self.sas.put(sa);
                }
                return;
            }
        } else if transition.has(SmfFlags::INPUT_ENCRYPTED) {
            warn!("packet rejected: should have been encrypted");
            match sa_opt.as_mut() {
                Some(sa) => self.send_notification_from_state(sa, NotifyType::InvalidFlags),
                None => self.send_notification_from_md(&md, NotifyType::InvalidFlags),
            }
            if let Some(sa) = sa_opt {
                self.sas.put(sa);
            }
            return;
        }

        // NAT payloads need the RFC method negotiated, Main Mode only
        let nat_ok = match (&sa_opt, sa_opt.as_ref().map(|sa| sa.connection)) {
            (Some(sa), Some(conn_id)) => {
                sa.hidden.nat_traversal
                    && !self
                        .connections
                        .get(conn_id)
                        .map(|c| c.aggressive)
                        .unwrap_or(false)
            }
            _ => false,
        };

        if let Err(DecodeError::Notify(note)) =
            decoder::decode_payloads(&mut md, transition, from_state, nat_ok)
        {
            if !md.encrypted {
                match sa_opt.as_mut() {
                    Some(sa) => self.send_notification_from_state(sa, note),
                    None => self.send_notification_from_md(&md, note),
                }
            }
            if let Some(sa) = sa_opt {
                // an SA synthesized for an initial message that never
                // parsed is not worth keeping
                if matches!(sa.state, State::MainR0 | State::AggrR0)
                    && sa.last_transition.is_none()
                {
                    self.cleanup_sa(sa);
                } else {
                    self.sas.put(sa);
                }
            }
            return;
        }

        // HASH protection; a mismatch is a silent drop
        if !md.hash_checked {
            let ok = match sa_opt.as_ref() {
                Some(sa) => hash::check_hash(transition.hash, sa, &md),
                None => transition.hash == HashType::None,
            };
            if !ok {
                if let Some(sa) = sa_opt {
                    self.sas.put(sa);
                }
                return;
            }
            md.hash_checked = true;
        }

        decoder::scan_vendor_ids(&mut md);

        // Notifications outside an informational exchange are noted
        // and otherwise left alone.
        if md.hdr.exchange() != Some(ExchangeType::Informational) {
            for pd in md.chain(PayloadType::Notification) {
                if let Ok(n) = NotificationView::parse(md.payload_bytes(pd)) {
                    info!(
                        notify = n.notify_type,
                        msgid = format_args!("{:#010x}", md.hdr.message_id),
                        "ignoring informational payload"
                    );
                }
            }
        }

        // Delete payloads act before the handler; the current SA may
        // delete itself.
        informational::accept_deletes(self, &mut sa_opt, &md);

        let result = handlers::run(transition.handler, self, now, &mut sa_opt, &mut md);
        dispatch::complete_state_transition(self, now, &mut sa_opt, md, result);

        if let Some(sa) = sa_opt {
            self.sas.put(sa);
        }

        self.flush_deferred(now);
    }

    // ---- outbound initiations ----

    /// Start a Phase 1 exchange on a connection
    ///
    /// # Errors
    ///
    /// Returns error for an unknown connection or when the first
    /// packet cannot be built.
    pub fn initiate(&mut self, now: Instant, conn_id: ConnectionId) -> Result<SerialNo> {
        let conn = self
            .connections
            .get(conn_id)
            .cloned()
            .ok_or_else(|| Error::InvalidParameter("no such connection".to_string()))?;

        let serial = self.sas.next_serial();
        let state = if conn.aggressive {
            State::AggrI1
        } else {
            State::MainI1
        };
        let mut sa = IkeSa::new(
            serial,
            Role::Initiator,
            handlers::fresh_cookie(),
            [0u8; 8],
            state,
            conn_id,
            conn.peer_addr,
            conn.local_addr,
        );

        let packet = if conn.aggressive {
            handlers::aggr_mode_initiate(self, &mut sa, &conn)
        } else {
            handlers::main_mode_initiate(self, &mut sa, &conn)
        }
        .map_err(|r| Error::Internal(format!("initiation failed: {:?}", r)))?;

        info!(sa = %serial, connection = %conn.name, state = state.name(), "initiating");
        sa.tpacket = packet.clone();
        self.send_to(sa.remote, sa.local, packet);
        self.schedule(serial, EventKind::Retransmit, now + self.config.retransmit_interval);
        self.events
            .progress(serial.0, 100 + state.index(), state.name());
        self.sas.put(sa);
        Ok(serial)
    }

    /// Start (or queue) a Quick Mode exchange on a connection
    ///
    /// With no established Phase 1 SA yet, the request is queued and
    /// fires when one completes.
    ///
    /// # Errors
    ///
    /// Returns error for an unknown connection.
    pub fn initiate_quick(
        &mut self,
        now: Instant,
        conn_id: ConnectionId,
    ) -> Result<Option<SerialNo>> {
        if self.connections.get(conn_id).is_none() {
            return Err(Error::InvalidParameter("no such connection".to_string()));
        }
        let parent = self
            .sas
            .serials()
            .into_iter()
            .filter_map(|s| self.sas.get(s))
            .find(|sa| {
                !sa.is_child() && sa.connection == conn_id && sa.state.is_established()
            })
            .map(|sa| sa.serial);

        match parent {
            Some(p) => Ok(self.start_quick(now, p)),
            None => {
                debug!("no established ISAKMP SA yet; queueing Quick Mode initiation");
                self.pending_p2.push(conn_id);
                Ok(None)
            }
        }
    }

    fn start_quick(&mut self, now: Instant, parent_serial: SerialNo) -> Option<SerialNo> {
        let conn_id = self.sas.get(parent_serial)?.connection;
        let conn = self.connections.get(conn_id)?.clone();

        let msgid = loop {
            let m = rand::random::<u32>();
            if m != 0
                && self
                    .sas
                    .get(parent_serial)
                    .map(|p| p.msgids.unique(m))
                    .unwrap_or(false)
            {
                break m;
            }
        };
        self.sas
            .get_mut(parent_serial)?
            .msgids
            .reserve(msgid);

        let child_serial = self.sas.next_serial();
        let mut child = self
            .sas
            .get(parent_serial)?
            .spawn_child(child_serial, Role::Initiator, msgid);

        let packet = match handlers::quick_mode_initiate(&mut child, &conn) {
            Ok(p) => p,
            Err(r) => {
                warn!(sa = %child_serial, result = ?r, "Quick Mode initiation failed");
                self.dh.cancel(child.helper_token());
                return None;
            }
        };
        info!(
            sa = %child_serial,
            parent = %parent_serial,
            msgid = format_args!("{:#010x}", msgid),
            "initiating Quick Mode"
        );
        child.tpacket = packet.clone();
        self.send_to(child.remote, child.local, packet);
        self.schedule(
            child_serial,
            EventKind::Retransmit,
            now + self.config.retransmit_interval,
        );
        self.sas.put(child);
        Some(child_serial)
    }

    // ---- helper completions ----

    /// Deliver a completed Diffie-Hellman agreement
    ///
    /// Resumes the suspended transition, if any.
    pub fn complete_dh(&mut self, now: Instant, token: u64, shared: Vec<u8>) {
        let serial = SerialNo(token);
        let suspended = match self.sas.get_mut(serial) {
            Some(sa) => {
                if sa.g_xy.is_empty() {
                    sa.g_xy = shared;
                }
                sa.helper_in_flight = false;
                sa.suspended.take()
            }
            None => {
                debug!(token, "helper completion for a deleted SA; dropping result");
                return;
            }
        };
        if let Some(md) = suspended {
            debug!(sa = %serial, "resuming suspended transition");
            self.process_tail(now, Some(serial), *md);
        }
    }

    // ---- timers ----

    pub(crate) fn schedule(&mut self, sa: SerialNo, kind: EventKind, at: Instant) {
        self.timers.push(TimerEntry { at, sa, kind });
    }

    pub(crate) fn clear_timers(&mut self, sa: SerialNo) {
        self.timers.retain(|t| t.sa != sa);
    }

    pub(crate) fn reschedule_dpd(&mut self, sa: &IkeSa, now: Instant) {
        let interval = match self
            .connections
            .get(sa.connection)
            .and_then(|c| c.dpd)
        {
            Some(d) => d.interval,
            None => return,
        };
        self.timers
            .retain(|t| !(t.sa == sa.serial && t.kind == EventKind::DpdCheck));
        self.schedule(sa.serial, EventKind::DpdCheck, now + interval);
    }

    /// Fire every timer that is due
    pub fn handle_timeout(&mut self, now: Instant) {
        loop {
            let due = self
                .timers
                .iter()
                .position(|t| t.at <= now);
            let entry = match due {
                Some(i) => self.timers.remove(i),
                None => break,
            };
            self.fire_timer(now, entry);
        }
        self.flush_deferred(now);
    }

    fn fire_timer(&mut self, now: Instant, entry: TimerEntry) {
        match entry.kind {
            EventKind::Retransmit => {
                let (packet, remote, local, attempt) = match self.sas.get_mut(entry.sa) {
                    Some(sa) => {
                        if sa.tpacket.is_empty() {
                            return;
                        }
                        sa.retransmit_count += 1;
                        (
                            sa.tpacket.clone(),
                            sa.remote,
                            sa.local,
                            sa.retransmit_count,
                        )
                    }
                    None => return,
                };
                if attempt > self.config.max_retransmits {
                    warn!(sa = %entry.sa, "max number of retransmissions reached; deleting SA");
                    self.delete_sa(entry.sa);
                    return;
                }
                debug!(sa = %entry.sa, attempt, "retransmitting");
                self.send_to(remote, local, packet);
                let backoff = self.config.retransmit_interval * 2u32.pow(attempt.min(16));
                self.schedule(entry.sa, EventKind::Retransmit, now + backoff);
            }
            EventKind::SoDiscard => {
                debug!(sa = %entry.sa, "discarding half-open SA");
                self.delete_sa(entry.sa);
            }
            EventKind::SaExpire => {
                info!(sa = %entry.sa, "SA lifetime expired");
                self.delete_sa(entry.sa);
            }
            EventKind::SaReplace => {
                let replacement = self.sas.get(entry.sa).map(|sa| {
                    (
                        sa.is_child(),
                        sa.role,
                        sa.connection,
                        sa.parent,
                    )
                });
                if let Some((is_child, role, conn, _parent)) = replacement {
                    info!(sa = %entry.sa, "replacing SA");
                    if role == Role::Initiator {
                        let dont_rekey = self
                            .connections
                            .get(conn)
                            .map(|c| c.dont_rekey)
                            .unwrap_or(false);
                        if !dont_rekey {
                            if is_child {
                                let _ = self.initiate_quick(now, conn);
                            } else {
                                let _ = self.initiate(now, conn);
                            }
                        }
                    }
                    self.delete_sa(entry.sa);
                }
            }
            EventKind::DpdCheck => {
                let probe = match self.sas.get_mut(entry.sa) {
                    Some(sa) => {
                        if sa.dpd.probe_outstanding() {
                            None // no answer since the last probe
                        } else {
                            Some(sa.dpd.next_probe())
                        }
                    }
                    None => return,
                };
                match probe {
                    None => {
                        warn!(sa = %entry.sa, "DPD: peer is dead, deleting SA");
                        self.delete_sa(entry.sa);
                    }
                    Some(seqno) => {
                        if let Some(mut sa) = self.sas.take(entry.sa) {
                            let probe = NotificationView {
                                doi: IPSEC_DOI,
                                protocol_id: ProtocolId::Isakmp.to_u8(),
                                spi: {
                                    let mut spi = Vec::with_capacity(16);
                                    spi.extend_from_slice(&sa.icookie);
                                    spi.extend_from_slice(&sa.rcookie);
                                    spi
                                },
                                notify_type: NotifyType::RUThere.to_u16(),
                                data: super::dpd::seqno_data(seqno),
                            };
                            debug!(sa = %sa.serial, seqno, "DPD: sending R_U_THERE");
                            self.send_protected_info(
                                &mut sa,
                                vec![(PayloadType::Notification, probe.to_bytes())],
                            );
                            self.reschedule_dpd(&sa, now);
                            self.sas.put(sa);
                        }
                    }
                }
            }
            EventKind::SendXauth => {
                if let Some(mut sa) = self.sas.take(entry.sa) {
                    handlers::xauth_send_request(self, &mut sa, now);
                    self.sas.put(sa);
                }
            }
        }
    }

    // ---- notifications ----

    /// Queue a datagram for transmission
    pub(crate) fn send_to(&mut self, to: SocketAddr, from: SocketAddr, bytes: Vec<u8>) {
        self.outbox.push(Datagram { to, from, bytes });
    }

    fn notification_body(
        icookie: &[u8; 8],
        rcookie: &[u8; 8],
        notify: NotifyType,
    ) -> Vec<u8> {
        let mut spi = Vec::with_capacity(16);
        spi.extend_from_slice(icookie);
        spi.extend_from_slice(rcookie);
        NotificationView {
            doi: IPSEC_DOI,
            protocol_id: ProtocolId::Isakmp.to_u8(),
            spi,
            notify_type: notify.to_u16(),
            data: Vec::new(),
        }
        .to_bytes()
    }

    /// Send a plaintext notification answering a message with no SA
    pub(crate) fn send_notification_from_md(&mut self, md: &MessageDigest, notify: NotifyType) {
        debug!(?notify, to = %md.sender, "sending notification");
        let mut builder = MessageBuilder::new(
            md.hdr.initiator_spi,
            md.hdr.responder_spi,
            ExchangeType::Informational,
            MAINMODE_MSGID,
        );
        builder.add_payload(
            PayloadType::Notification,
            Self::notification_body(&md.hdr.initiator_spi, &md.hdr.responder_spi, notify),
        );
        let bytes = builder.build();
        self.send_to(md.sender, md.local, bytes);
    }

    /// Send a notification on an SA, protected once keys exist
    pub(crate) fn send_notification_from_state(&mut self, sa: &mut IkeSa, notify: NotifyType) {
        if notify == NotifyType::PayloadMalformed {
            sa.hidden.malformed_sent += 1;
        }
        debug!(sa = %sa.serial, ?notify, "sending notification");
        let body = Self::notification_body(&sa.icookie, &sa.rcookie, notify);
        if sa.keymat.is_some() && sa.state.has_keymat() {
            self.send_protected_info(sa, vec![(PayloadType::Notification, body)]);
        } else {
            let mut builder = MessageBuilder::new(
                sa.icookie,
                sa.rcookie,
                ExchangeType::Informational,
                MAINMODE_MSGID,
            );
            builder.add_payload(PayloadType::Notification, body);
            let bytes = builder.build();
            self.send_to(sa.remote, sa.local, bytes);
        }
    }

    /// Send a HASH(1)-protected informational message on an SA
    ///
    /// Picks a fresh message id and seeds its one-shot IV; the SA's
    /// committed Phase 1 chain is untouched.
    pub(crate) fn send_protected_info(
        &mut self,
        sa: &mut IkeSa,
        payloads: Vec<(PayloadType, Vec<u8>)>,
    ) {
        let msgid = loop {
            let m = rand::random::<u32>();
            if m != 0 && sa.msgids.unique(m) {
                break m;
            }
        };
        sa.msgids.reserve(msgid);
        match handlers::build_hashed_message(
            sa,
            ExchangeType::Informational,
            msgid,
            HashType::Hash1,
            payloads,
            true,
        ) {
            Ok(bytes) => self.send_to(sa.remote, sa.local, bytes),
            Err(r) => {
                warn!(sa = %sa.serial, result = ?r, "failed to build protected informational")
            }
        }
    }

    // ---- SA lifecycle ----

    /// Delete an SA in the table, with all its side effects
    pub fn delete_sa(&mut self, serial: SerialNo) {
        if let Some(sa) = self.sas.take(serial) {
            self.cleanup_sa(sa);
        }
    }

    /// Delete an SA and tell the peer with a Delete payload
    ///
    /// Phase 1 SAs announce their cookie pair; children announce
    /// their IPsec SPIs.
    pub fn delete_sa_with_notify(&mut self, serial: SerialNo) {
        let mut sa = match self.sas.take(serial) {
            Some(sa) => sa,
            None => return,
        };
        if sa.keymat.is_some() && sa.state.has_keymat() {
            let delete = if sa.is_child() {
                super::payload::DeleteView {
                    doi: IPSEC_DOI,
                    protocol_id: ProtocolId::Esp.to_u8(),
                    spis: vec![sa.p2_local_spi.to_be_bytes().to_vec()],
                }
            } else {
                let mut spi = Vec::with_capacity(16);
                spi.extend_from_slice(&sa.icookie);
                spi.extend_from_slice(&sa.rcookie);
                super::payload::DeleteView {
                    doi: IPSEC_DOI,
                    protocol_id: ProtocolId::Isakmp.to_u8(),
                    spis: vec![spi],
                }
            };
            self.send_protected_info(&mut sa, vec![(PayloadType::Delete, delete.to_bytes())]);
        }
        self.cleanup_sa(sa);
    }

    /// Tear down an SA that is already out of the table: cancel
    /// helpers and timers, drop the suspended digest, remove installed
    /// IPsec SAs, and take the children down too
    pub(crate) fn cleanup_sa(&mut self, sa: IkeSa) {
        info!(sa = %sa.serial, state = sa.state.name(), "deleting SA");
        self.clear_timers(sa.serial);
        self.dh.cancel(sa.helper_token());
        if let Some(sig) = self.sig.as_mut() {
            sig.cancel(sa.serial.0);
        }

        if sa.is_child() {
            for spi in [sa.p2_local_spi, sa.p2_peer_spi] {
                if spi != 0 {
                    if let Err(e) = self.installer.remove(spi, 50) {
                        debug!(spi, error = %e, "kernel SA removal failed");
                    }
                }
            }
        } else {
            for child in self.sas.children_of(sa.serial) {
                self.delete_sa(child);
            }
        }
        // suspended digest and keying material drop with the SA
    }

    // ---- pending Phase 2 ----

    /// Note that a connection's Phase 1 committed; queued Phase 2
    /// initiations fire after the transition is fully processed
    pub(crate) fn defer_release(&mut self, conn: ConnectionId) {
        self.deferred_release.push(conn);
    }

    /// Queue a Phase 2 initiation explicitly (Nortel workaround)
    pub(crate) fn queue_quick(&mut self, conn: ConnectionId) {
        self.pending_p2.push(conn);
    }

    fn flush_deferred(&mut self, now: Instant) {
        let released = std::mem::take(&mut self.deferred_release);
        for conn in released {
            while let Some(pos) = self.pending_p2.iter().position(|&c| c == conn) {
                self.pending_p2.remove(pos);
                debug!(connection = conn.0, "firing pending Quick Mode initiation");
                let _ = self.initiate_quick(now, conn);
            }
        }
    }
}
