//! IKEv1 Integration Tests
//!
//! End-to-end exchanges between two in-process engines wired back to
//! back: Main Mode, Quick Mode with IPsec SA installation, duplicate
//! handling, malformed-payload rejection, fragmentation reassembly,
//! DPD, XAUTH + Mode Config, and crypto helper suspension.

use oakley_platform::{ChildSaInstall, DhBackend, DhOutcome, IpsecInstaller, OakleyResult};
use oakley_proto::ikev1::connection::{Connection, IdSpec};
use oakley_proto::ikev1::constants::{ExchangeType, NotifyType, PayloadType};
use oakley_proto::ikev1::crypto::{DeferredDhBackend, XorDhBackend};
use oakley_proto::ikev1::dpd::DpdConfig;
use oakley_proto::ikev1::engine::{Datagram, Engine, EngineConfig, EventKind};
use oakley_proto::ikev1::fragment::emit_fragment;
use oakley_proto::ikev1::message::IsakmpHeader;
use oakley_proto::ikev1::payload::NotificationView;
use oakley_proto::ikev1::{SerialNo, State};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const INITIATOR_ADDR: &str = "192.0.2.1:500";
const RESPONDER_ADDR: &str = "192.0.2.2:500";

/// Kernel stand-in that records every install/remove
#[derive(Clone, Default)]
struct RecordingKernel {
    installs: Arc<Mutex<Vec<ChildSaInstall>>>,
    removals: Arc<Mutex<Vec<u32>>>,
}

impl IpsecInstaller for RecordingKernel {
    fn install(&mut self, sa: &ChildSaInstall) -> OakleyResult<()> {
        self.installs.lock().unwrap().push(sa.clone());
        Ok(())
    }

    fn remove(&mut self, spi: u32, _protocol: u8) -> OakleyResult<()> {
        self.removals.lock().unwrap().push(spi);
        Ok(())
    }
}

impl RecordingKernel {
    fn install_count(&self) -> usize {
        self.installs.lock().unwrap().len()
    }
}

/// Shareable handle around the deferring DH backend
#[derive(Clone)]
struct SharedDh(Arc<Mutex<DeferredDhBackend>>);

impl DhBackend for SharedDh {
    fn generate(&mut self, group: u16, token: u64) -> OakleyResult<Vec<u8>> {
        self.0.lock().unwrap().generate(group, token)
    }

    fn agree(&mut self, token: u64, peer_public: &[u8]) -> OakleyResult<DhOutcome> {
        self.0.lock().unwrap().agree(token, peer_public)
    }

    fn cancel(&mut self, token: u64) {
        self.0.lock().unwrap().cancel(token)
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Opt-in log output: `RUST_LOG=oakley_proto=debug cargo test`
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

fn initiator_conn() -> Connection {
    Connection::builder("east")
        .with_local_id(IdSpec::fqdn("east.example.org"))
        .with_peer_id(IdSpec::fqdn("west.example.org"))
        .with_psk(b"oakley-test-psk")
        .with_local_addr(addr(INITIATOR_ADDR))
        .with_peer_addr(addr(RESPONDER_ADDR))
        .with_lifetimes(28800, 3600)
        .with_subnets([192, 0, 1, 0, 255, 255, 255, 0], [192, 0, 2, 0, 255, 255, 255, 0])
        .with_dpd(DpdConfig::default())
        .build()
        .unwrap()
}

fn responder_conn() -> Connection {
    Connection::builder("west")
        .with_local_id(IdSpec::fqdn("west.example.org"))
        .with_peer_id(IdSpec::fqdn("east.example.org"))
        .with_psk(b"oakley-test-psk")
        .with_local_addr(addr(RESPONDER_ADDR))
        .with_peer_addr(addr(INITIATOR_ADDR))
        .with_lifetimes(28800, 3600)
        .with_subnets([192, 0, 2, 0, 255, 255, 255, 0], [192, 0, 1, 0, 255, 255, 255, 0])
        .with_dpd(DpdConfig::default())
        .build()
        .unwrap()
}

fn engine_with(kernel: RecordingKernel) -> Engine {
    Engine::new(
        EngineConfig::default(),
        Box::new(XorDhBackend::new()),
        Box::new(kernel),
    )
}

/// Ferry datagrams between the two engines until both go quiet,
/// returning everything that crossed the wire in order
fn pump(now: Instant, east: &mut Engine, west: &mut Engine) -> Vec<Datagram> {
    let mut log = Vec::new();
    loop {
        let mut progressed = false;
        for d in east.drain_outbox() {
            west.handle_datagram(now, d.from, d.to, &d.bytes);
            log.push(d);
            progressed = true;
        }
        for d in west.drain_outbox() {
            east.handle_datagram(now, d.from, d.to, &d.bytes);
            log.push(d);
            progressed = true;
        }
        if !progressed {
            return log;
        }
    }
}

/// The single Phase 1 SA of an engine
fn phase1_sa(engine: &Engine) -> SerialNo {
    let mut serials: Vec<SerialNo> = engine
        .sas()
        .serials()
        .into_iter()
        .filter(|&s| !engine.sas().get(s).unwrap().is_child())
        .collect();
    serials.sort();
    assert_eq!(serials.len(), 1, "expected exactly one phase 1 SA");
    serials[0]
}

fn sa_state(engine: &Engine, serial: SerialNo) -> State {
    engine.sas().get(serial).unwrap().state
}

/// Run a full Main Mode handshake, returning (east, west, east serial,
/// west serial, wire log)
fn establish_main_mode() -> (Engine, Engine, SerialNo, SerialNo, Vec<Datagram>) {
    init_tracing();
    let now = Instant::now();
    let mut east = engine_with(RecordingKernel::default());
    let mut west = engine_with(RecordingKernel::default());
    let east_conn = east.add_connection(initiator_conn());
    west.add_connection(responder_conn());

    let east_serial = east.initiate(now, east_conn).unwrap();
    let log = pump(now, &mut east, &mut west);

    let west_serial = phase1_sa(&west);
    (east, west, east_serial, west_serial, log)
}

//
// Scenario: Main Mode PSK happy path
//

#[test]
fn test_main_mode_psk_happy_path() {
    let (east, west, east_serial, west_serial, log) = establish_main_mode();

    assert_eq!(sa_state(&east, east_serial), State::MainI4);
    assert_eq!(sa_state(&west, west_serial), State::MainR3);

    // six messages: SA, SA, KE+Ni, KE+Nr, IDi+HASH_I, IDr+HASH_R
    assert_eq!(log.len(), 6);

    // no notifications were emitted
    for d in &log {
        let hdr = IsakmpHeader::from_bytes(&d.bytes).unwrap();
        assert_ne!(hdr.exchange(), Some(ExchangeType::Informational));
    }

    // the last two messages were encrypted
    for d in &log[4..] {
        let hdr = IsakmpHeader::from_bytes(&d.bytes).unwrap();
        assert!(hdr.flags.is_encrypted());
    }

    // DPD was initialized on both established SAs
    assert!(east
        .timer_kinds(east_serial)
        .contains(&EventKind::DpdCheck));
    assert!(west
        .timer_kinds(west_serial)
        .contains(&EventKind::DpdCheck));

    // exactly one rekey timer is armed besides DPD
    assert!(east
        .timer_kinds(east_serial)
        .contains(&EventKind::SaReplace));
}

//
// Scenario: Quick Mode SA install
//

#[test]
fn test_quick_mode_installs_ipsec_sas() {
    let now = Instant::now();
    let east_kernel = RecordingKernel::default();
    let west_kernel = RecordingKernel::default();

    let mut east = engine_with(east_kernel.clone());
    let mut west = engine_with(west_kernel.clone());
    let east_conn = east.add_connection(initiator_conn());
    west.add_connection(responder_conn());

    east.initiate(now, east_conn).unwrap();
    pump(now, &mut east, &mut west);

    let child = east.initiate_quick(now, east_conn).unwrap().unwrap();
    pump(now, &mut east, &mut west);

    assert_eq!(sa_state(&east, child), State::QuickI2);

    let west_child = west
        .sas()
        .serials()
        .into_iter()
        .find(|&s| west.sas().get(s).unwrap().is_child())
        .expect("responder should have a child SA");
    assert_eq!(sa_state(&west, west_child), State::QuickR2);

    // each end installed an inbound and an outbound IPsec SA
    assert_eq!(east_kernel.install_count(), 2);
    assert_eq!(west_kernel.install_count(), 2);

    let installs = west_kernel.installs.lock().unwrap();
    assert!(installs.iter().any(|i| i.inbound));
    assert!(installs.iter().any(|i| !i.inbound));
    for i in installs.iter() {
        assert_eq!(i.protocol, 50);
        assert!(i.spi >= 0x100);
        assert_eq!(i.keymat.len(), 16 + 20); // AES-128 + HMAC-SHA1
        assert_eq!(i.lifetime_seconds, 3600);
    }

    // the SPIs agree across the two ends
    let east_installs = east_kernel.installs.lock().unwrap();
    let east_spis: Vec<u32> = east_installs.iter().map(|i| i.spi).collect();
    let west_spis: Vec<u32> = installs.iter().map(|i| i.spi).collect();
    for spi in east_spis {
        assert!(west_spis.contains(&spi));
    }
}

//
// Scenario: duplicate retransmit
//

#[test]
fn test_duplicate_triggers_bounded_retransmit() {
    let now = Instant::now();
    let (_east, mut west, _east_serial, west_serial, log) = establish_main_mode();

    // the initiator's final message (HDR*, IDi, HASH_I) is the last
    // east -> west datagram
    let i3 = log
        .iter()
        .rev()
        .find(|d| d.to == addr(RESPONDER_ADDR))
        .unwrap()
        .clone();
    // and the responder's stored reply is the last west -> east one
    let r3 = log
        .iter()
        .rev()
        .find(|d| d.to == addr(INITIATOR_ADDR))
        .unwrap()
        .clone();

    // first and second byte-identical replays are answered with the
    // stored reply
    for _ in 0..2 {
        west.handle_datagram(now, i3.from, i3.to, &i3.bytes);
        let out = west.drain_outbox();
        assert_eq!(out.len(), 1, "duplicate should be answered");
        assert_eq!(out[0].bytes, r3.bytes, "reply must be the stored bytes");
        assert_eq!(sa_state(&west, west_serial), State::MainR3);
    }

    // past the cap the duplicate is dropped
    west.handle_datagram(now, i3.from, i3.to, &i3.bytes);
    assert!(west.drain_outbox().is_empty(), "cap exhausted, must drop");
    assert_eq!(sa_state(&west, west_serial), State::MainR3);
}

//
// Scenario: malformed payload in plaintext
//

#[test]
fn test_unknown_payload_type_yields_notification() {
    let now = Instant::now();
    let mut west = engine_with(RecordingKernel::default());
    west.add_connection(responder_conn());

    // a Main Mode I1 whose header chains an unknown payload type
    let mut packet = vec![0u8; 28];
    packet[0..8].copy_from_slice(&[7; 8]); // initiator cookie
    packet[16] = 250; // unknown next payload
    packet[17] = 0x10;
    packet[18] = ExchangeType::IdProt.to_u8();
    packet.extend_from_slice(&[250, 0, 0, 8, 1, 2, 3, 4]); // nonsense payload
    let len = (packet.len() as u32).to_be_bytes();
    packet[24..28].copy_from_slice(&len);

    west.handle_datagram(now, addr(INITIATOR_ADDR), addr(RESPONDER_ADDR), &packet);

    let out = west.drain_outbox();
    assert_eq!(out.len(), 1);
    let hdr = IsakmpHeader::from_bytes(&out[0].bytes).unwrap();
    assert_eq!(hdr.exchange(), Some(ExchangeType::Informational));
    assert_eq!(hdr.next_payload, PayloadType::Notification.to_u8());

    let n = NotificationView::parse(&out[0].bytes[32..]).unwrap();
    assert_eq!(n.kind(), Some(NotifyType::InvalidPayloadType));

    // no SA survived the rejected initial message
    assert!(west.sas().is_empty());
}

//
// Scenario: fragment reassembly
//

#[test]
fn test_fragmented_message_is_reassembled() {
    let now = Instant::now();
    let mut east = engine_with(RecordingKernel::default());
    let mut west = engine_with(RecordingKernel::default());
    let east_conn = east.add_connection(initiator_conn());
    west.add_connection(responder_conn());

    // run the first round trip: I1 -> R1
    east.initiate(now, east_conn).unwrap();
    let i1 = east.drain_outbox().remove(0);
    west.handle_datagram(now, i1.from, i1.to, &i1.bytes);
    let r1 = west.drain_outbox().remove(0);
    east.handle_datagram(now, r1.from, r1.to, &r1.bytes);

    // capture I2 (KE, Ni) and deliver it as four fragments,
    // interleaved {2, 4, 1, 3}
    let i2 = east.drain_outbox().remove(0);
    let hdr = IsakmpHeader::from_bytes(&i2.bytes).unwrap();
    let quarter = i2.bytes.len() / 4;
    let pieces = [
        &i2.bytes[..quarter],
        &i2.bytes[quarter..2 * quarter],
        &i2.bytes[2 * quarter..3 * quarter],
        &i2.bytes[3 * quarter..],
    ];

    let frag_packet = |index: u8, last: bool, data: &[u8]| -> Vec<u8> {
        let payload = emit_fragment(1, index, last, data);
        let mut fh = hdr.clone();
        fh.next_payload = PayloadType::Fragment.to_u8();
        fh.length = (28 + payload.len()) as u32;
        let mut bytes = fh.to_bytes().to_vec();
        bytes.extend_from_slice(&payload);
        bytes
    };

    for (index, last) in [(2u8, false), (4, true), (1, false), (3, false)] {
        let bytes = frag_packet(index, last, pieces[index as usize - 1]);
        west.handle_datagram(now, i2.from, i2.to, &bytes);
    }

    // the reassembled I2 was processed as a single packet: the
    // responder advanced and replied with R2
    let west_serial = phase1_sa(&west);
    assert_eq!(sa_state(&west, west_serial), State::MainR2);
    let r2 = west.drain_outbox();
    assert_eq!(r2.len(), 1);

    // and the rest of the exchange still completes
    east.handle_datagram(now, r2[0].from, r2[0].to, &r2[0].bytes);
    pump(now, &mut east, &mut west);
    assert_eq!(sa_state(&west, west_serial), State::MainR3);
}

//
// Scenario: DPD probe and ACK
//

#[test]
fn test_dpd_probe_is_acknowledged() {
    let (mut east, mut west, east_serial, west_serial, _) = establish_main_mode();

    // fire the initiator's DPD check
    let later = Instant::now() + DpdConfig::default().interval + Duration::from_secs(1);
    east.handle_timeout(later);

    let probes = east.drain_outbox();
    assert_eq!(probes.len(), 1, "R_U_THERE expected");
    let hdr = IsakmpHeader::from_bytes(&probes[0].bytes).unwrap();
    assert_eq!(hdr.exchange(), Some(ExchangeType::Informational));
    assert!(hdr.flags.is_encrypted());
    assert!(east
        .sas()
        .get(east_serial)
        .unwrap()
        .dpd
        .probe_outstanding());

    // the responder answers with an ACK, state unchanged
    west.handle_datagram(later, probes[0].from, probes[0].to, &probes[0].bytes);
    let acks = west.drain_outbox();
    assert_eq!(acks.len(), 1, "R_U_THERE_ACK expected");
    assert_eq!(sa_state(&west, west_serial), State::MainR3);

    // the ACK settles the probe
    east.handle_datagram(later, acks[0].from, acks[0].to, &acks[0].bytes);
    assert!(!east
        .sas()
        .get(east_serial)
        .unwrap()
        .dpd
        .probe_outstanding());
    assert_eq!(sa_state(&east, east_serial), State::MainI4);
}

//
// Scenario: XAUTH + Mode Config, then Quick Mode
//

#[test]
fn test_xauth_modecfg_then_quick_mode() {
    let now = Instant::now();
    let east_kernel = RecordingKernel::default();
    let west_kernel = RecordingKernel::default();
    let mut east = engine_with(east_kernel.clone());
    let mut west = engine_with(west_kernel.clone());

    let east_conn = east.add_connection(
        Connection::builder("road-warrior")
            .with_local_id(IdSpec::fqdn("east.example.org"))
            .with_peer_id(IdSpec::fqdn("west.example.org"))
            .with_psk(b"oakley-test-psk")
            .with_local_addr(addr(INITIATOR_ADDR))
            .with_peer_addr(addr(RESPONDER_ADDR))
            .with_xauth(false, true)
            .with_xauth_credentials("alice", "hunter2")
            .with_modecfg(false, true)
            .with_subnets(
                [192, 0, 1, 0, 255, 255, 255, 0],
                [192, 0, 2, 0, 255, 255, 255, 0],
            )
            .build()
            .unwrap(),
    );
    west.add_connection(
        Connection::builder("gateway")
            .with_local_id(IdSpec::fqdn("west.example.org"))
            .with_peer_id(IdSpec::fqdn("east.example.org"))
            .with_psk(b"oakley-test-psk")
            .with_local_addr(addr(RESPONDER_ADDR))
            .with_peer_addr(addr(INITIATOR_ADDR))
            .with_xauth(true, false)
            .with_xauth_credentials("alice", "hunter2")
            .with_modecfg(true, false)
            .with_modecfg_pool([10, 99, 0, 5])
            .with_subnets(
                [192, 0, 2, 0, 255, 255, 255, 0],
                [192, 0, 1, 0, 255, 255, 255, 0],
            )
            .build()
            .unwrap(),
    );

    let east_serial = east.initiate(now, east_conn).unwrap();
    pump(now, &mut east, &mut west);
    let west_serial = phase1_sa(&west);

    // phase 1 is up, but XAUTH is pending on the server
    west.handle_timeout(now); // fires SendXauth
    pump(now, &mut east, &mut west);

    {
        let east_sa = east.sas().get(east_serial).unwrap();
        assert!(east_sa.hidden.xauth_client_done);
        assert!(east_sa.hidden.modecfg_vars_set);
        assert_eq!(east_sa.state, State::MainI4);
    }
    {
        let west_sa = west.sas().get(west_serial).unwrap();
        assert!(!west_sa.oakley.as_ref().unwrap().doing_xauth);
        // pull-mode server answered the config request
        assert!(west_sa.hidden.modecfg_vars_set);
    }

    // Quick Mode proceeds now that XAUTH is done
    let child = east.initiate_quick(now, east_conn).unwrap().unwrap();
    pump(now, &mut east, &mut west);
    assert_eq!(sa_state(&east, child), State::QuickI2);
    assert_eq!(east_kernel.install_count(), 2);
    assert_eq!(west_kernel.install_count(), 2);
}

//
// Scenario: crypto helper suspension and resumption
//

#[test]
fn test_responder_suspends_and_resumes_on_deferred_dh() {
    let now = Instant::now();
    let deferred = Arc::new(Mutex::new(DeferredDhBackend::new()));

    let mut east = engine_with(RecordingKernel::default());
    let mut west = Engine::new(
        EngineConfig::default(),
        Box::new(SharedDh(deferred.clone())),
        Box::new(RecordingKernel::default()),
    );
    let east_conn = east.add_connection(initiator_conn());
    west.add_connection(responder_conn());

    east.initiate(now, east_conn).unwrap();
    pump(now, &mut east, &mut west);

    // the responder parked the I2 transition waiting for the helper
    let west_serial = phase1_sa(&west);
    {
        let west_sa = west.sas().get(west_serial).unwrap();
        assert_eq!(west_sa.state, State::MainR1);
        assert!(west_sa.helper_in_flight);
        assert!(west_sa.suspended.is_some());
    }
    assert_eq!(deferred.lock().unwrap().pending(), 1);

    // deliver the helper completion; the transition resumes and the
    // exchange runs to the end
    let (token, shared) = deferred.lock().unwrap().complete_next().unwrap();
    west.complete_dh(now, token, shared);
    pump(now, &mut east, &mut west);

    assert_eq!(sa_state(&west, west_serial), State::MainR3);
    let east_serial = phase1_sa(&east);
    assert_eq!(sa_state(&east, east_serial), State::MainI4);
}

//
// Scenario: peer-initiated delete
//

#[test]
fn test_delete_payload_tears_down_the_sa() {
    let now = Instant::now();
    let (mut east, mut west, east_serial, west_serial, _) = establish_main_mode();

    assert_eq!(west.sas().len(), 1);
    east.delete_sa_with_notify(east_serial);
    assert!(east.sas().get(east_serial).is_none());

    let out = east.drain_outbox();
    assert_eq!(out.len(), 1);
    west.handle_datagram(now, out[0].from, out[0].to, &out[0].bytes);

    assert!(west.sas().get(west_serial).is_none());
    assert!(west.sas().is_empty());
}
