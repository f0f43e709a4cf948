//! State transition handlers
//!
//! One function per microcode processor. Handlers validate the
//! decoded payloads, drive the crypto backends (suspending when a
//! helper defers), stash negotiation results on the SA, and build the
//! reply the dispatcher will transmit. They never advance state,
//! schedule timers, or delete SAs — the dispatcher owns all of that.

use super::connection::Connection;
use super::constants::{
    cfg_attr, AuthMethod, ExchangeType, ModeCfgType, NotifyType, PayloadType,
};
use super::crypto::{skeyid_psk, skeyid_sig, KeyMaterial, PrfAlgorithm};
use super::dispatch::HandlerResult;
use super::engine::{Engine, EventKind};
use super::hash::{outbound_hash, phase1_initial_iv, phase2_iv};
use super::ident;
use super::informational;
use super::message::{assemble_chain, MessageBuilder};
use super::microcode::{Handler, HashType};
use super::payload::{CfgView, IdView, MessageDigest};
use super::proposal::{
    emit_ipsec_sa, emit_oakley_sa, parse_ipsec_sa, parse_oakley_sa, select_ipsec, select_oakley,
    IpsecProposal, OakleyProposal,
};
use super::sa::{IkeSa, OakleyParams};
use super::state::State;
use oakley_platform::{ChildSaInstall, DhOutcome, SigOutcome, VerifyOutcome};
use rand::RngCore;
use std::time::Instant;
use subtle::ConstantTimeEq;
use tracing::{debug, info, warn};

/// ESP protocol number for kernel installs
const ESP_PROTO: u8 = 50;

macro_rules! need_sa {
    ($sa_opt:expr) => {
        match $sa_opt.as_mut() {
            Some(sa) => sa,
            None => return HandlerResult::InternalError,
        }
    };
}

/// Dispatch a microcode handler
pub(crate) fn run(
    handler: Handler,
    engine: &mut Engine,
    now: Instant,
    sa_opt: &mut Option<IkeSa>,
    md: &mut MessageDigest,
) -> HandlerResult {
    match handler {
        Handler::Unexpected => {
            let state = sa_opt
                .as_ref()
                .map(|sa| sa.state.name())
                .unwrap_or("no state");
            warn!(state, "unexpected message received");
            HandlerResult::Ignore
        }
        Handler::Informational => informational::informational(engine, now, sa_opt, md),
        Handler::MainInI1OutR1 => main_in_i1_out_r1(engine, need_sa!(sa_opt), md),
        Handler::MainInR1OutI2 => main_in_r1_out_i2(engine, need_sa!(sa_opt), md),
        Handler::MainInI2OutR2 => main_in_i2_out_r2(engine, need_sa!(sa_opt), md),
        Handler::MainInR2OutI3 => main_in_r2_out_i3(engine, need_sa!(sa_opt), md),
        Handler::MainInI3OutR3 => main_in_i3_out_r3(engine, need_sa!(sa_opt), md),
        Handler::MainInR3 => main_in_r3(engine, need_sa!(sa_opt), md),
        Handler::AggrInI1OutR1 => aggr_in_i1_out_r1(engine, need_sa!(sa_opt), md),
        Handler::AggrInR1OutI2 => aggr_in_r1_out_i2(engine, need_sa!(sa_opt), md),
        Handler::AggrInI2 => aggr_in_i2(engine, need_sa!(sa_opt), md),
        Handler::QuickInI1OutR1 => quick_in_i1_out_r1(engine, need_sa!(sa_opt), md),
        Handler::QuickInR1OutI2 => quick_in_r1_out_i2(engine, need_sa!(sa_opt), md),
        Handler::QuickInI2 => quick_in_i2(engine, need_sa!(sa_opt), md),
        Handler::XauthInR0 => xauth_in_r0(engine, need_sa!(sa_opt), md),
        Handler::XauthInR1 => xauth_in_r1(engine, need_sa!(sa_opt), md),
        Handler::ModeCfgInR0 => modecfg_in_r0(engine, need_sa!(sa_opt), md),
        Handler::ModeCfgInR1 => modecfg_in_r1(engine, need_sa!(sa_opt), md),
        Handler::XauthInI0 => xauth_in_i0(engine, need_sa!(sa_opt), md),
        Handler::XauthInI1 => xauth_in_i1(engine, need_sa!(sa_opt), md),
    }
}

// ---- common helpers ----

fn fresh_nonce() -> Vec<u8> {
    let mut nonce = vec![0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    nonce
}

pub(crate) fn fresh_cookie() -> [u8; 8] {
    loop {
        let mut cookie = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut cookie);
        if cookie != [0u8; 8] {
            return cookie;
        }
    }
}

fn fresh_spi() -> u32 {
    loop {
        let spi = rand::random::<u32>();
        // SPIs below 256 are reserved
        if spi >= 0x100 {
            return spi;
        }
    }
}

fn connection_of(engine: &Engine, sa: &IkeSa) -> Option<Connection> {
    engine.connections.get(sa.connection).cloned()
}

fn first_payload_bytes(md: &MessageDigest, t: PayloadType) -> Option<Vec<u8>> {
    md.chain_first(t).map(|pd| md.payload_bytes(pd).to_vec())
}

/// Our Phase 1 ID payload body
fn local_id_body(conn: &Connection) -> Vec<u8> {
    IdView {
        id_type: conn.local_id.id_type.to_u8(),
        protocol_id: 17, // UDP
        port: 500,
        data: conn.local_id.data.clone(),
    }
    .to_bytes()
}

/// Map an accepted Oakley offer onto the SA
fn accept_oakley(sa: &mut IkeSa, offer: &OakleyProposal) -> Result<(), HandlerResult> {
    let (cipher, prf, group, auth) = match (
        offer.cipher(),
        offer.prf(),
        offer.dh_group(),
        offer.auth(),
    ) {
        (Some(c), Some(p), Some(g), Some(a)) => (c, p, g, a),
        _ => return Err(HandlerResult::Fail(Some(NotifyType::NoProposalChosen))),
    };
    sa.oakley = Some(OakleyParams {
        auth,
        auth_wire: offer.auth_wire,
        cipher,
        prf,
        group,
        life_seconds: offer.life_seconds,
        doing_xauth: offer.is_xauth(),
    });
    Ok(())
}

/// Run the DH agreement, suspending when the backend defers
///
/// Idempotent: a resumed transition finds the shared secret already
/// delivered and falls through.
fn dh_agree_or_suspend(
    engine: &mut Engine,
    sa: &mut IkeSa,
    peer_public: &[u8],
) -> Result<(), HandlerResult> {
    if !sa.g_xy.is_empty() {
        return Ok(());
    }
    match engine.dh.agree(sa.helper_token(), peer_public) {
        Ok(DhOutcome::Ready(shared)) => {
            sa.g_xy = shared;
            sa.helper_in_flight = false;
            Ok(())
        }
        Ok(DhOutcome::Pending) => Err(HandlerResult::Suspend),
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "DH agreement failed");
            Err(HandlerResult::Fail(Some(NotifyType::InvalidKeyInformation)))
        }
    }
}

/// Compute SKEYID and the derived keys once the shared secret exists
fn compute_phase1_keys(sa: &mut IkeSa, conn: &Connection) -> Result<(), HandlerResult> {
    if sa.keymat.is_some() {
        return Ok(());
    }
    let oakley = match sa.oakley.as_ref() {
        Some(o) => o.clone(),
        None => return Err(HandlerResult::InternalError),
    };
    let prf = oakley.prf;

    let skeyid = match oakley.auth {
        AuthMethod::PreSharedKey => {
            let psk = match &conn.psk {
                Some(p) => p.clone(),
                None => {
                    warn!(sa = %sa.serial, "PSK negotiated but none configured");
                    return Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)));
                }
            };
            skeyid_psk(prf, &psk, &sa.ni, &sa.nr)
        }
        AuthMethod::DssSignature | AuthMethod::RsaSignature => {
            skeyid_sig(prf, &sa.ni, &sa.nr, &sa.g_xy)
        }
        _ => return Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed))),
    };

    let keymat = KeyMaterial::derive(
        prf,
        skeyid,
        &sa.g_xy,
        &sa.icookie,
        &sa.rcookie,
        oakley.cipher.key_len(),
    )
    .map_err(|e| {
        warn!(sa = %sa.serial, error = %e, "key derivation failed");
        HandlerResult::Fatal
    })?;

    let bs = oakley.cipher.block_size();
    let initial_iv = phase1_initial_iv(prf, &sa.g_xi, &sa.g_xr, bs);
    sa.iv = initial_iv.clone();
    sa.new_iv = initial_iv.clone();
    sa.phase1_iv = initial_iv;
    sa.keymat = Some(keymat);
    sa.hidden.skeyid_calculated = true;
    debug!(sa = %sa.serial, "phase 1 keying material computed");
    Ok(())
}

/// The Phase 1 authentication hash for one side
fn phase1_auth_hash(sa: &IkeSa, of_initiator: bool, id_body: &[u8]) -> Option<Vec<u8>> {
    let prf = sa.prf()?;
    let skeyid = &sa.keymat.as_ref()?.skeyid;
    Some(super::crypto::prf::main_mode_hash(
        prf,
        skeyid,
        of_initiator,
        &sa.g_xi,
        &sa.g_xr,
        &sa.icookie,
        &sa.rcookie,
        &sa.p1_sa_body,
        id_body,
    ))
}

/// Build the authenticator we send: HASH under PSK, SIG under
/// signature methods
fn build_own_auth(
    engine: &mut Engine,
    sa: &mut IkeSa,
    of_initiator: bool,
) -> Result<(PayloadType, Vec<u8>), HandlerResult> {
    let id_body = sa.my_id_body.clone();
    let hash = match phase1_auth_hash(sa, of_initiator, &id_body) {
        Some(h) => h,
        None => return Err(HandlerResult::InternalError),
    };
    let auth = sa.oakley.as_ref().map(|o| o.auth);
    match auth {
        Some(AuthMethod::PreSharedKey) => Ok((PayloadType::Hash, hash)),
        Some(AuthMethod::DssSignature) | Some(AuthMethod::RsaSignature) => {
            let sig = match engine.sig.as_mut() {
                Some(s) => s,
                None => {
                    warn!(sa = %sa.serial, "signature auth negotiated but no signer configured");
                    return Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)));
                }
            };
            match sig.sign(sa.serial.0, &hash) {
                Ok(SigOutcome::Ready(sig)) => Ok((PayloadType::Signature, sig)),
                Ok(SigOutcome::Pending) => Err(HandlerResult::Suspend),
                Err(e) => {
                    warn!(sa = %sa.serial, error = %e, "signing failed");
                    Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)))
                }
            }
        }
        _ => Err(HandlerResult::InternalError),
    }
}

/// Verify the authenticator the peer sent
fn verify_peer_auth(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &MessageDigest,
    peer_is_initiator: bool,
) -> Result<(), HandlerResult> {
    let id_body = sa.peer_id_body.clone();
    let expected = match phase1_auth_hash(sa, peer_is_initiator, &id_body) {
        Some(h) => h,
        None => return Err(HandlerResult::InternalError),
    };
    let auth = sa.oakley.as_ref().map(|o| o.auth);
    match auth {
        Some(AuthMethod::PreSharedKey) => {
            let received = match first_payload_bytes(md, PayloadType::Hash) {
                Some(h) => h,
                None => return Err(HandlerResult::Fail(Some(NotifyType::PayloadMalformed))),
            };
            let ok: bool = received.len() == expected.len()
                && bool::from(expected.ct_eq(&received));
            if ok {
                Ok(())
            } else {
                warn!(sa = %sa.serial, "phase 1 authentication hash mismatch");
                Err(HandlerResult::Fail(Some(
                    NotifyType::InvalidHashInformation,
                )))
            }
        }
        Some(AuthMethod::DssSignature) | Some(AuthMethod::RsaSignature) => {
            let received = match first_payload_bytes(md, PayloadType::Signature) {
                Some(s) => s,
                None => return Err(HandlerResult::Fail(Some(NotifyType::PayloadMalformed))),
            };
            let sig = match engine.sig.as_mut() {
                Some(s) => s,
                None => {
                    warn!(sa = %sa.serial, "signature auth negotiated but no verifier configured");
                    return Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)));
                }
            };
            match sig.verify(sa.serial.0, &expected, &received) {
                Ok(VerifyOutcome::Valid) => Ok(()),
                Ok(VerifyOutcome::Invalid) => {
                    warn!(sa = %sa.serial, "peer signature did not verify");
                    Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)))
                }
                Ok(VerifyOutcome::Pending) => Err(HandlerResult::Suspend),
                Err(e) => {
                    warn!(sa = %sa.serial, error = %e, "signature verification failed");
                    Err(HandlerResult::Fail(Some(NotifyType::AuthenticationFailed)))
                }
            }
        }
        _ => Err(HandlerResult::InternalError),
    }
}

/// Encrypt a reply continuing the SA's IV chain
fn encrypt_reply(sa: &mut IkeSa, builder: MessageBuilder) -> Result<Vec<u8>, HandlerResult> {
    let cipher = match sa.cipher() {
        Some(c) => c,
        None => return Err(HandlerResult::InternalError),
    };
    let key = match sa.keymat.as_ref() {
        Some(km) => km.enc_key.clone(),
        None => return Err(HandlerResult::InternalError),
    };
    if sa.new_iv.is_empty() {
        // first encrypted output on this SA
        sa.new_iv = sa.iv.clone();
    }
    builder
        .build_encrypted(cipher, &key, &mut sa.new_iv)
        .map_err(|e| {
            warn!(sa = %sa.serial, error = %e, "reply encryption failed");
            HandlerResult::Fatal
        })
}

/// Build a HASH-protected encrypted message (Quick Mode, Mode Config,
/// protected informational)
///
/// With `fresh_iv`, seeds the IV chain for a message id we picked
/// ourselves; replies keep the chain the inbound message advanced.
pub(crate) fn build_hashed_message(
    sa: &mut IkeSa,
    exchange: ExchangeType,
    msgid: u32,
    hash_type: HashType,
    payloads: Vec<(PayloadType, Vec<u8>)>,
    fresh_iv: bool,
) -> Result<Vec<u8>, HandlerResult> {
    let (prf, skeyid_a) = match (sa.prf(), sa.keymat.as_ref()) {
        (Some(p), Some(km)) => (p, km.skeyid_a.clone()),
        _ => return Err(HandlerResult::InternalError),
    };
    let bs = match sa.block_size() {
        Some(b) => b,
        None => return Err(HandlerResult::InternalError),
    };

    let rest = assemble_chain(&payloads);
    let hash = outbound_hash(hash_type, prf, &skeyid_a, msgid, &sa.ni, &sa.nr, &rest);

    let mut builder = MessageBuilder::new(sa.icookie, sa.rcookie, exchange, msgid);
    builder.add_payload(PayloadType::Hash, hash);
    for (t, body) in payloads {
        builder.add_payload(t, body);
    }

    if fresh_iv {
        sa.new_iv = phase2_iv(prf, &sa.phase1_iv, msgid, bs);
    }
    encrypt_reply(sa, builder)
}

/// Quick Mode keying material for one IPsec SA direction
///
/// ```text
/// KEYMAT = prf(SKEYID_d, protocol | SPI | Ni_b | Nr_b)
/// ```
/// iterated (`K1 | K2 | ...`) until enough bits exist.
fn quick_keymat(
    prf: PrfAlgorithm,
    skeyid_d: &[u8],
    protocol: u8,
    spi: u32,
    ni: &[u8],
    nr: &[u8],
    len: usize,
) -> Vec<u8> {
    let spi = spi.to_be_bytes();
    let mut out = Vec::with_capacity(len + prf.output_len());
    let mut block = prf.compute_parts(skeyid_d, &[&[protocol], &spi, ni, nr]);
    while out.len() < len {
        out.extend_from_slice(&block);
        block = prf.compute_parts(skeyid_d, &[&block, &[protocol], &spi, ni, nr]);
    }
    out.truncate(len);
    out
}

/// Bytes of keying material an ESP/AES+HMAC-SHA1 SA consumes
fn esp_keymat_len(proposal: &IpsecProposal) -> usize {
    let enc = if proposal.key_len_bits == 0 {
        16
    } else {
        proposal.key_len_bits as usize / 8
    };
    enc + 20 // HMAC-SHA1 key
}

fn install_ipsec_sa(
    engine: &mut Engine,
    sa: &IkeSa,
    proposal: &IpsecProposal,
    spi: u32,
    inbound: bool,
) -> Result<(), HandlerResult> {
    let (prf, skeyid_d) = match (sa.prf(), sa.keymat.as_ref()) {
        (Some(p), Some(km)) => (p, km.skeyid_d.clone()),
        _ => return Err(HandlerResult::InternalError),
    };
    let keymat = quick_keymat(
        prf,
        &skeyid_d,
        proposal.protocol.to_u8(),
        spi,
        &sa.ni,
        &sa.nr,
        esp_keymat_len(proposal),
    );
    let install = ChildSaInstall {
        spi,
        protocol: ESP_PROTO,
        inbound,
        local: sa.local,
        peer: sa.remote,
        keymat,
        lifetime_seconds: u64::from(proposal.life_seconds),
    };
    engine.installer.install(&install).map_err(|e| {
        warn!(sa = %sa.serial, error = %e, "kernel rejected IPsec SA");
        HandlerResult::Fatal
    })
}

// ---- Main Mode ----

/// MAIN_R0: HDR, SA --> HDR, SA
fn main_in_i1_out_r1(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_oakley_sa(&sa_body) {
        Ok(o) => o,
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "unparseable SA payload");
            return HandlerResult::Fail(Some(NotifyType::PayloadMalformed));
        }
    };
    let accepted = match select_oakley(&offers, &conn.auth) {
        Some(a) => a,
        None => {
            warn!(sa = %sa.serial, "no acceptable Oakley proposal");
            return HandlerResult::Fail(Some(NotifyType::NoProposalChosen));
        }
    };
    if let Err(r) = accept_oakley(sa, &accepted) {
        return r;
    }
    sa.p1_sa_body = sa_body;

    if sa.rcookie == [0u8; 8] {
        sa.rcookie = fresh_cookie();
    }

    let mut builder = MessageBuilder::echo_reply(&md.hdr, false);
    builder.set_responder_spi(sa.rcookie);
    builder.add_payload(PayloadType::Sa, emit_oakley_sa(&[accepted]));
    for vid in super::decoder::our_vendor_ids(conn.allow_fragmentation, conn.nat_t) {
        builder.add_payload(PayloadType::VendorId, vid);
    }
    if engine.config.impair_bogus_flag {
        builder.set_flag(super::constants::IsakmpFlags::RESERVED_BOGUS);
    }
    md.reply = Some(builder.build());
    HandlerResult::Ok
}

/// MAIN_I1: HDR, SA --> HDR, KE, Ni
fn main_in_r1_out_i2(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_oakley_sa(&sa_body) {
        Ok(o) => o,
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "unparseable SA reply");
            return HandlerResult::Fail(Some(NotifyType::PayloadMalformed));
        }
    };
    // the responder must have chosen one of our offers
    let accepted = match select_oakley(&offers, &conn.auth) {
        Some(a) => a,
        None => {
            warn!(sa = %sa.serial, "responder chose a proposal we cannot accept");
            return HandlerResult::Fail(Some(NotifyType::NoProposalChosen));
        }
    };
    if let Err(r) = accept_oakley(sa, &accepted) {
        return r;
    }
    sa.rcookie = md.hdr.responder_spi;

    if sa.g_xi.is_empty() {
        let group = accepted.group;
        sa.g_xi = match engine.dh.generate(group, sa.helper_token()) {
            Ok(public) => public,
            Err(e) => {
                warn!(sa = %sa.serial, error = %e, "DH keypair generation failed");
                return HandlerResult::Fail(Some(NotifyType::InvalidKeyInformation));
            }
        };
        sa.ni = fresh_nonce();
    }

    let mut builder = MessageBuilder::echo_reply(&md.hdr, false);
    builder.add_payload(PayloadType::KeyExchange, sa.g_xi.clone());
    builder.add_payload(PayloadType::Nonce, sa.ni.clone());
    md.reply = Some(builder.build());
    HandlerResult::Ok
}

/// MAIN_R1: HDR, KE, Ni --> HDR, KE, Nr
fn main_in_i2_out_r2(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    sa.g_xi = match first_payload_bytes(md, PayloadType::KeyExchange) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.ni = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };

    if sa.g_xr.is_empty() {
        let group = match sa.oakley.as_ref() {
            Some(o) => o.group.group_number(),
            None => return HandlerResult::InternalError,
        };
        sa.g_xr = match engine.dh.generate(group, sa.helper_token()) {
            Ok(public) => public,
            Err(e) => {
                warn!(sa = %sa.serial, error = %e, "DH keypair generation failed");
                return HandlerResult::Fail(Some(NotifyType::InvalidKeyInformation));
            }
        };
        sa.nr = fresh_nonce();
    }

    let peer_public = sa.g_xi.clone();
    if let Err(r) = dh_agree_or_suspend(engine, sa, &peer_public) {
        return r;
    }
    if let Err(r) = compute_phase1_keys(sa, &conn) {
        return r;
    }

    let mut builder = MessageBuilder::echo_reply(&md.hdr, false);
    builder.add_payload(PayloadType::KeyExchange, sa.g_xr.clone());
    builder.add_payload(PayloadType::Nonce, sa.nr.clone());
    md.reply = Some(builder.build());
    HandlerResult::Ok
}

/// MAIN_I2: HDR, KE, Nr --> HDR*, IDi1, HASH_I / SIG_I
fn main_in_r2_out_i3(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    sa.g_xr = match first_payload_bytes(md, PayloadType::KeyExchange) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.nr = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };

    let peer_public = sa.g_xr.clone();
    if let Err(r) = dh_agree_or_suspend(engine, sa, &peer_public) {
        return r;
    }
    if let Err(r) = compute_phase1_keys(sa, &conn) {
        return r;
    }

    sa.my_id_body = local_id_body(&conn);
    let (auth_type, auth_body) = match build_own_auth(engine, sa, true) {
        Ok(a) => a,
        Err(r) => return r,
    };

    let mut builder = MessageBuilder::echo_reply(&md.hdr, true);
    builder.add_payload(PayloadType::Identification, sa.my_id_body.clone());
    builder.add_payload(auth_type, auth_body);
    match encrypt_reply(sa, builder) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// MAIN_R2: HDR*, IDi1, HASH_I --> HDR*, IDr1, HASH_R
fn main_in_i3_out_r3(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    if !ident_decode(engine, sa, md, false, false) {
        return HandlerResult::Fail(Some(NotifyType::InvalidIdInformation));
    }
    if let Err(r) = verify_peer_auth(engine, sa, md, true) {
        return r;
    }

    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    sa.my_id_body = local_id_body(&conn);
    let (auth_type, auth_body) = match build_own_auth(engine, sa, false) {
        Ok(a) => a,
        Err(r) => return r,
    };

    let mut builder = MessageBuilder::echo_reply(&md.hdr, true);
    builder.add_payload(PayloadType::Identification, sa.my_id_body.clone());
    builder.add_payload(auth_type, auth_body);
    match encrypt_reply(sa, builder) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// MAIN_I3: HDR*, IDr1, HASH_R --> done
fn main_in_r3(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    if !ident_decode(engine, sa, md, true, false) {
        return HandlerResult::Fail(Some(NotifyType::InvalidIdInformation));
    }
    match verify_peer_auth(engine, sa, md, false) {
        Ok(()) => HandlerResult::Ok,
        Err(r) => r,
    }
}

fn ident_decode(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &MessageDigest,
    initiator: bool,
    aggrmode: bool,
) -> bool {
    ident::decode_peer_id(engine, sa, md, initiator, aggrmode)
}

// ---- Aggressive Mode ----

/// AGGR_R0: HDR, SA, KE, Ni, IDii --> HDR, SA, KE, Nr, IDir, HASH_R
fn aggr_in_i1_out_r1(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_oakley_sa(&sa_body) {
        Ok(o) => o,
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "unparseable SA payload");
            return HandlerResult::Fail(Some(NotifyType::PayloadMalformed));
        }
    };
    let accepted = match select_oakley(&offers, &conn.auth) {
        Some(a) => a,
        None => return HandlerResult::Fail(Some(NotifyType::NoProposalChosen)),
    };
    if let Err(r) = accept_oakley(sa, &accepted) {
        return r;
    }
    sa.p1_sa_body = sa_body;

    sa.g_xi = match first_payload_bytes(md, PayloadType::KeyExchange) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.ni = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if !ident_decode(engine, sa, md, false, true) {
        return HandlerResult::Fail(Some(NotifyType::InvalidIdInformation));
    }

    if sa.rcookie == [0u8; 8] {
        sa.rcookie = fresh_cookie();
    }
    if sa.g_xr.is_empty() {
        let group = accepted.group;
        sa.g_xr = match engine.dh.generate(group, sa.helper_token()) {
            Ok(public) => public,
            Err(e) => {
                warn!(sa = %sa.serial, error = %e, "DH keypair generation failed");
                return HandlerResult::Fail(Some(NotifyType::InvalidKeyInformation));
            }
        };
        sa.nr = fresh_nonce();
    }

    let peer_public = sa.g_xi.clone();
    if let Err(r) = dh_agree_or_suspend(engine, sa, &peer_public) {
        return r;
    }
    if let Err(r) = compute_phase1_keys(sa, &conn) {
        return r;
    }

    sa.my_id_body = local_id_body(&conn);
    let (auth_type, auth_body) = match build_own_auth(engine, sa, false) {
        Ok(a) => a,
        Err(r) => return r,
    };

    let mut builder = MessageBuilder::echo_reply(&md.hdr, false);
    builder.set_responder_spi(sa.rcookie);
    builder.add_payload(PayloadType::Sa, emit_oakley_sa(&[accepted]));
    builder.add_payload(PayloadType::KeyExchange, sa.g_xr.clone());
    builder.add_payload(PayloadType::Nonce, sa.nr.clone());
    builder.add_payload(PayloadType::Identification, sa.my_id_body.clone());
    builder.add_payload(auth_type, auth_body);
    for vid in super::decoder::our_vendor_ids(conn.allow_fragmentation, conn.nat_t) {
        builder.add_payload(PayloadType::VendorId, vid);
    }
    md.reply = Some(builder.build());
    HandlerResult::Ok
}

/// AGGR_I1: reply --> HDR*, HASH_I / SIG_I
fn aggr_in_r1_out_i2(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_oakley_sa(&sa_body) {
        Ok(o) => o,
        Err(_) => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let accepted = match select_oakley(&offers, &conn.auth) {
        Some(a) => a,
        None => return HandlerResult::Fail(Some(NotifyType::NoProposalChosen)),
    };
    if let Err(r) = accept_oakley(sa, &accepted) {
        return r;
    }

    sa.rcookie = md.hdr.responder_spi;
    sa.g_xr = match first_payload_bytes(md, PayloadType::KeyExchange) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.nr = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if !ident_decode(engine, sa, md, true, true) {
        return HandlerResult::Fail(Some(NotifyType::InvalidIdInformation));
    }

    let peer_public = sa.g_xr.clone();
    if let Err(r) = dh_agree_or_suspend(engine, sa, &peer_public) {
        return r;
    }
    if let Err(r) = compute_phase1_keys(sa, &conn) {
        return r;
    }
    if let Err(r) = verify_peer_auth(engine, sa, md, false) {
        return r;
    }

    let (auth_type, auth_body) = match build_own_auth(engine, sa, true) {
        Ok(a) => a,
        Err(r) => return r,
    };
    let mut builder = MessageBuilder::echo_reply(&md.hdr, true);
    builder.add_payload(auth_type, auth_body);
    match encrypt_reply(sa, builder) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// AGGR_R1: HDR*, HASH_I / SIG_I --> done
fn aggr_in_i2(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    match verify_peer_auth(engine, sa, md, true) {
        Ok(()) => HandlerResult::Ok,
        Err(r) => r,
    }
}

// ---- Quick Mode ----

/// QUICK_R0: HASH(1), SA, Ni [, KE ] [, IDci, IDcr ] -->
///           HASH(2), SA, Nr [, KE ] [, IDci, IDcr ]
///
/// Installs the inbound IPsec SA.
fn quick_in_i1_out_r1(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_ipsec_sa(&sa_body) {
        Ok(o) => o,
        Err(e) => {
            warn!(sa = %sa.serial, error = %e, "unparseable Quick Mode SA payload");
            return HandlerResult::Fail(Some(NotifyType::BadProposalSyntax));
        }
    };
    let accepted = match select_ipsec(&offers) {
        Some(a) => a,
        None => {
            warn!(sa = %sa.serial, "no acceptable IPsec proposal");
            return HandlerResult::Fail(Some(NotifyType::NoProposalChosen));
        }
    };

    sa.ni = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.nr = fresh_nonce();
    sa.p2_peer_spi = accepted.spi;
    if sa.p2_local_spi == 0 {
        sa.p2_local_spi = fresh_spi();
    }

    // client identities, echoed verbatim in the reply
    let ids: Vec<Vec<u8>> = md
        .chain(PayloadType::Identification)
        .map(|pd| md.payload_bytes(pd).to_vec())
        .collect();
    if let Some(idci) = ids.first() {
        sa.peer_id_body = idci.clone();
    }
    if let Some(idcr) = ids.get(1) {
        sa.my_id_body = idcr.clone();
    }

    let mut ours = accepted.clone();
    ours.spi = sa.p2_local_spi;
    sa.p2_proposal = Some(ours.clone());

    let local_spi = sa.p2_local_spi;
    if let Err(r) = install_ipsec_sa(engine, sa, &ours, local_spi, true) {
        return r;
    }

    let mut payloads: Vec<(PayloadType, Vec<u8>)> =
        vec![(PayloadType::Sa, emit_ipsec_sa(&[ours]))];
    payloads.push((PayloadType::Nonce, sa.nr.clone()));
    for id in &ids {
        payloads.push((PayloadType::Identification, id.clone()));
    }

    match build_hashed_message(
        sa,
        ExchangeType::Quick,
        md.hdr.message_id,
        HashType::Hash2,
        payloads,
        false,
    ) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// QUICK_I1: HASH(2), SA, Nr [...] --> HASH(3)
///
/// Installs both IPsec SAs.
fn quick_in_r1_out_i2(
    engine: &mut Engine,
    sa: &mut IkeSa,
    md: &mut MessageDigest,
) -> HandlerResult {
    let sa_body = match first_payload_bytes(md, PayloadType::Sa) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let offers = match parse_ipsec_sa(&sa_body) {
        Ok(o) => o,
        Err(_) => return HandlerResult::Fail(Some(NotifyType::BadProposalSyntax)),
    };
    let accepted = match select_ipsec(&offers) {
        Some(a) => a,
        None => return HandlerResult::Fail(Some(NotifyType::NoProposalChosen)),
    };
    sa.nr = match first_payload_bytes(md, PayloadType::Nonce) {
        Some(b) => b,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    sa.p2_peer_spi = accepted.spi;
    sa.p2_proposal = Some(accepted.clone());

    let (local_spi, peer_spi) = (sa.p2_local_spi, sa.p2_peer_spi);
    if let Err(r) = install_ipsec_sa(engine, sa, &accepted, local_spi, true) {
        return r;
    }
    if let Err(r) = install_ipsec_sa(engine, sa, &accepted, peer_spi, false) {
        return r;
    }

    match build_hashed_message(
        sa,
        ExchangeType::Quick,
        md.hdr.message_id,
        HashType::Hash3,
        Vec::new(),
        false,
    ) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// QUICK_R1: HASH(3) --> done
///
/// Installs the outbound IPsec SA.
fn quick_in_i2(engine: &mut Engine, sa: &mut IkeSa, _md: &mut MessageDigest) -> HandlerResult {
    let proposal = match sa.p2_proposal.clone() {
        Some(p) => p,
        None => return HandlerResult::InternalError,
    };
    let peer_spi = sa.p2_peer_spi;
    match install_ipsec_sa(engine, sa, &proposal, peer_spi, false) {
        Ok(()) => HandlerResult::Ok,
        Err(r) => r,
    }
}

// ---- XAUTH ----

fn parse_cfg(md: &MessageDigest) -> Option<CfgView> {
    let body = first_payload_bytes(md, PayloadType::ModeCfgAttr)?;
    CfgView::parse(&body).ok()
}

/// XAUTH server: send the login/password challenge
pub(crate) fn xauth_send_request(engine: &mut Engine, sa: &mut IkeSa, now: Instant) {
    let msgid = fresh_spi(); // any nonzero value works
    sa.msgids.phase15 = msgid;
    sa.state = State::XauthR0;

    let cfg = CfgView {
        cfg_type: ModeCfgType::Request.to_u8(),
        id: (msgid & 0xffff) as u16,
        attributes: vec![
            (cfg_attr::XAUTH_TYPE, vec![0, 0]), // Generic
            (cfg_attr::XAUTH_USER_NAME, Vec::new()),
            (cfg_attr::XAUTH_USER_PASSWORD, Vec::new()),
        ],
    };
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, cfg.to_bytes())],
        true,
    ) {
        Ok(bytes) => {
            sa.iv = sa.new_iv.clone();
            sa.tpacket = bytes.clone();
            sa.retransmit_count = 0;
            engine.send_to(sa.remote, sa.local, bytes);
            engine.schedule(
                sa.serial,
                EventKind::Retransmit,
                now + engine.config.retransmit_interval,
            );
            info!(sa = %sa.serial, "XAUTH: login/password request sent");
        }
        Err(_) => warn!(sa = %sa.serial, "failed to build XAUTH request"),
    }
}

/// XAUTH_R0: credentials received
fn xauth_in_r0(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if cfg.cfg_type != ModeCfgType::Reply.to_u8() {
        warn!(sa = %sa.serial, cfg_type = cfg.cfg_type, "expected XAUTH reply");
        return HandlerResult::Ignore;
    }
    let username = cfg
        .attribute(cfg_attr::XAUTH_USER_NAME)
        .map(|v| String::from_utf8_lossy(v).to_string())
        .unwrap_or_default();
    let password = cfg
        .attribute(cfg_attr::XAUTH_USER_PASSWORD)
        .map(|v| String::from_utf8_lossy(v).to_string())
        .unwrap_or_default();

    let ok = match &conn.xauth_credentials {
        Some((u, p)) => *u == username && *p == password,
        None => !username.is_empty() && !password.is_empty(),
    };

    let status = CfgView {
        cfg_type: ModeCfgType::Set.to_u8(),
        id: cfg.id,
        attributes: vec![(cfg_attr::XAUTH_STATUS, vec![0, u8::from(ok)])],
    };
    let msgid = md.hdr.message_id;
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, status.to_bytes())],
        false,
    ) {
        Ok(bytes) => {
            sa.tpacket = bytes.clone();
            engine.send_to(sa.remote, sa.local, bytes);
        }
        Err(r) => return r,
    }

    if ok {
        info!(sa = %sa.serial, user = %username, "XAUTH: user authenticated");
        HandlerResult::Ok
    } else {
        warn!(sa = %sa.serial, user = %username, "XAUTH: authentication failed");
        HandlerResult::Fail(Some(NotifyType::AuthenticationFailed))
    }
}

/// XAUTH_R1: status acknowledged
fn xauth_in_r1(_engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if cfg.cfg_type != ModeCfgType::Ack.to_u8() {
        return HandlerResult::Ignore;
    }
    if let Some(oakley) = sa.oakley.as_mut() {
        oakley.doing_xauth = false;
    }
    info!(sa = %sa.serial, "XAUTH: exchange complete");
    HandlerResult::Ok
}

/// XAUTH_I0: challenge received, answer with credentials
fn xauth_in_i0(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if cfg.cfg_type != ModeCfgType::Request.to_u8() {
        return HandlerResult::Ignore;
    }
    let (username, password) = match &conn.xauth_credentials {
        Some(c) => c.clone(),
        None => {
            warn!(sa = %sa.serial, "XAUTH challenge but no credentials configured");
            return HandlerResult::Fail(Some(NotifyType::AuthenticationFailed));
        }
    };

    let msgid = md.hdr.message_id;
    sa.msgids.phase15 = msgid;

    let reply = CfgView {
        cfg_type: ModeCfgType::Reply.to_u8(),
        id: cfg.id,
        attributes: vec![
            (cfg_attr::XAUTH_TYPE, vec![0, 0]),
            (cfg_attr::XAUTH_USER_NAME, username.into_bytes()),
            (cfg_attr::XAUTH_USER_PASSWORD, password.into_bytes()),
        ],
    };
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, reply.to_bytes())],
        false,
    ) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// XAUTH_I1: status received, acknowledge it
fn xauth_in_i1(_engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    let status = cfg
        .attribute(cfg_attr::XAUTH_STATUS)
        .map(|v| v.last().copied().unwrap_or(0))
        .unwrap_or(0);
    if status != 1 {
        warn!(sa = %sa.serial, "XAUTH: server rejected our credentials");
        return HandlerResult::Fail(Some(NotifyType::AuthenticationFailed));
    }

    let ack = CfgView {
        cfg_type: ModeCfgType::Ack.to_u8(),
        id: cfg.id,
        attributes: vec![(cfg_attr::XAUTH_STATUS, vec![0, 1])],
    };
    let msgid = md.hdr.message_id;
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, ack.to_bytes())],
        false,
    ) {
        Ok(bytes) => {
            sa.hidden.xauth_client_done = true;
            info!(sa = %sa.serial, "XAUTH: authenticated to server");
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

// ---- Mode Config ----

/// Client pull: ask the server for our configuration
pub(crate) fn modecfg_send_request(engine: &mut Engine, sa: &mut IkeSa, now: Instant) {
    let msgid = fresh_spi();
    sa.msgids.phase15 = msgid;
    sa.state = State::ModeCfgI1;
    sa.hidden.modecfg_started = true;

    let cfg = CfgView {
        cfg_type: ModeCfgType::Request.to_u8(),
        id: (msgid & 0xffff) as u16,
        attributes: vec![
            (cfg_attr::INTERNAL_IP4_ADDRESS, Vec::new()),
            (cfg_attr::INTERNAL_IP4_DNS, Vec::new()),
        ],
    };
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, cfg.to_bytes())],
        true,
    ) {
        Ok(bytes) => {
            sa.iv = sa.new_iv.clone();
            sa.tpacket = bytes.clone();
            sa.retransmit_count = 0;
            engine.send_to(sa.remote, sa.local, bytes);
            engine.schedule(
                sa.serial,
                EventKind::Retransmit,
                now + engine.config.retransmit_interval,
            );
            info!(sa = %sa.serial, "modecfg: configuration request sent");
        }
        Err(_) => warn!(sa = %sa.serial, "failed to build modecfg request"),
    }
}

/// Server push: set the peer's address unasked
pub(crate) fn modecfg_send_set(engine: &mut Engine, sa: &mut IkeSa, now: Instant) {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return,
    };
    let pool = match conn.modecfg_pool {
        Some(p) => p,
        None => return,
    };
    let msgid = fresh_spi();
    sa.msgids.phase15 = msgid;

    let cfg = CfgView {
        cfg_type: ModeCfgType::Set.to_u8(),
        id: (msgid & 0xffff) as u16,
        attributes: vec![(cfg_attr::INTERNAL_IP4_ADDRESS, pool.to_vec())],
    };
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        msgid,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, cfg.to_bytes())],
        true,
    ) {
        Ok(bytes) => {
            sa.iv = sa.new_iv.clone();
            sa.tpacket = bytes.clone();
            sa.retransmit_count = 0;
            engine.send_to(sa.remote, sa.local, bytes);
            engine.schedule(
                sa.serial,
                EventKind::Retransmit,
                now + engine.config.retransmit_interval,
            );
        }
        Err(_) => warn!(sa = %sa.serial, "failed to build modecfg set"),
    }
}

/// MODE_CFG_R0: configuration request received (pull server)
fn modecfg_in_r0(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let conn = match connection_of(engine, sa) {
        Some(c) => c,
        None => return HandlerResult::InternalError,
    };
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    if cfg.cfg_type != ModeCfgType::Request.to_u8() {
        return HandlerResult::Ignore;
    }
    let pool = match conn.modecfg_pool {
        Some(p) => p,
        None => {
            warn!(sa = %sa.serial, "modecfg request but no address pool configured");
            return HandlerResult::Fail(Some(NotifyType::AttributesNotSupported));
        }
    };

    sa.msgids.phase15 = md.hdr.message_id;
    sa.hidden.modecfg_vars_set = true;

    let reply = CfgView {
        cfg_type: ModeCfgType::Reply.to_u8(),
        id: cfg.id,
        attributes: vec![(cfg_attr::INTERNAL_IP4_ADDRESS, pool.to_vec())],
    };
    match build_hashed_message(
        sa,
        ExchangeType::ModeCfg,
        md.hdr.message_id,
        HashType::Hash1,
        vec![(PayloadType::ModeCfgAttr, reply.to_bytes())],
        false,
    ) {
        Ok(bytes) => {
            md.reply = Some(bytes);
            HandlerResult::Ok
        }
        Err(r) => r,
    }
}

/// Shared by three table entries: the pull client's reply, the push
/// client's set, and the push server's ack
fn modecfg_in_r1(engine: &mut Engine, sa: &mut IkeSa, md: &mut MessageDigest) -> HandlerResult {
    let cfg = match parse_cfg(md) {
        Some(c) => c,
        None => return HandlerResult::Fail(Some(NotifyType::PayloadMalformed)),
    };
    match ModeCfgType::from_u8(cfg.cfg_type) {
        Some(ModeCfgType::Reply) => {
            // pull client: our configuration arrived
            if let Some(addr) = cfg.attribute(cfg_attr::INTERNAL_IP4_ADDRESS) {
                info!(
                    sa = %sa.serial,
                    addr = %hex::encode(addr),
                    "modecfg: received internal address"
                );
            }
            sa.hidden.modecfg_vars_set = true;
            HandlerResult::Ok
        }
        Some(ModeCfgType::Set) => {
            // push client: acknowledge the assignment
            sa.hidden.modecfg_vars_set = true;
            sa.msgids.phase15 = md.hdr.message_id;
            let ack = CfgView {
                cfg_type: ModeCfgType::Ack.to_u8(),
                id: cfg.id,
                attributes: Vec::new(),
            };
            match build_hashed_message(
                sa,
                ExchangeType::ModeCfg,
                md.hdr.message_id,
                HashType::Hash1,
                vec![(PayloadType::ModeCfgAttr, ack.to_bytes())],
                false,
            ) {
                Ok(bytes) => {
                    sa.iv = sa.new_iv.clone();
                    sa.tpacket = bytes.clone();
                    engine.send_to(sa.remote, sa.local, bytes);
                    HandlerResult::Ok
                }
                Err(r) => r,
            }
        }
        Some(ModeCfgType::Ack) => {
            // push server: assignment confirmed
            sa.hidden.modecfg_vars_set = true;
            HandlerResult::Ok
        }
        _ => HandlerResult::Ignore,
    }
}

// ---- outbound initiations ----

/// Wire auth value for a base method when XAUTH is in play
fn xauth_wire(method: AuthMethod) -> u16 {
    65001 + (method.to_u16() - 1) * 2
}

/// Build and send the first Main Mode packet (HDR, SA)
pub(crate) fn main_mode_initiate(
    engine: &mut Engine,
    sa: &mut IkeSa,
    conn: &Connection,
) -> Result<Vec<u8>, HandlerResult> {
    let xauth = conn.xauth_client || conn.xauth_server;
    let offers: Vec<OakleyProposal> = conn
        .auth
        .iter()
        .map(|a| {
            let wire = if xauth { xauth_wire(*a) } else { a.to_u16() };
            OakleyProposal::aes_sha1_modp2048(wire, 256, conn.ike_life_seconds)
        })
        .collect();
    let sa_body = emit_oakley_sa(&offers);
    sa.p1_sa_body = sa_body.clone();

    let mut builder = MessageBuilder::new(sa.icookie, [0; 8], ExchangeType::IdProt, 0);
    builder.add_payload(PayloadType::Sa, sa_body);
    for vid in super::decoder::our_vendor_ids(conn.allow_fragmentation, conn.nat_t) {
        builder.add_payload(PayloadType::VendorId, vid);
    }
    if engine.config.impair_bogus_flag {
        builder.set_flag(super::constants::IsakmpFlags::RESERVED_BOGUS);
    }
    Ok(builder.build())
}

/// Build and send the first Aggressive Mode packet
/// (HDR, SA, KE, Ni, IDii)
pub(crate) fn aggr_mode_initiate(
    engine: &mut Engine,
    sa: &mut IkeSa,
    conn: &Connection,
) -> Result<Vec<u8>, HandlerResult> {
    let auth = conn.auth.first().copied().unwrap_or(AuthMethod::PreSharedKey);
    let offer = OakleyProposal::aes_sha1_modp2048(auth.to_u16(), 256, conn.ike_life_seconds);
    let group = offer.group;
    let sa_body = emit_oakley_sa(&[offer]);
    sa.p1_sa_body = sa_body.clone();

    sa.g_xi = engine
        .dh
        .generate(group, sa.helper_token())
        .map_err(|e| {
            warn!(sa = %sa.serial, error = %e, "DH keypair generation failed");
            HandlerResult::Fail(Some(NotifyType::InvalidKeyInformation))
        })?;
    sa.ni = fresh_nonce();
    sa.my_id_body = local_id_body(conn);

    let mut builder = MessageBuilder::new(sa.icookie, [0; 8], ExchangeType::Aggressive, 0);
    builder.add_payload(PayloadType::Sa, sa_body);
    builder.add_payload(PayloadType::KeyExchange, sa.g_xi.clone());
    builder.add_payload(PayloadType::Nonce, sa.ni.clone());
    builder.add_payload(PayloadType::Identification, sa.my_id_body.clone());
    for vid in super::decoder::our_vendor_ids(conn.allow_fragmentation, conn.nat_t) {
        builder.add_payload(PayloadType::VendorId, vid);
    }
    Ok(builder.build())
}

/// Build and send the first Quick Mode packet on a fresh child
/// (HDR*, HASH(1), SA, Ni [, IDci, IDcr ])
pub(crate) fn quick_mode_initiate(
    sa: &mut IkeSa,
    conn: &Connection,
) -> Result<Vec<u8>, HandlerResult> {
    sa.ni = fresh_nonce();
    sa.p2_local_spi = fresh_spi();
    let offer = IpsecProposal::esp_aes_sha1(sa.p2_local_spi, 128, conn.ipsec_life_seconds);
    sa.p2_proposal = Some(offer.clone());

    let mut payloads: Vec<(PayloadType, Vec<u8>)> =
        vec![(PayloadType::Sa, emit_ipsec_sa(&[offer]))];
    payloads.push((PayloadType::Nonce, sa.ni.clone()));
    if let (Some(local), Some(peer)) = (conn.local_subnet, conn.peer_subnet) {
        let idci = IdView {
            id_type: super::constants::IdType::Ipv4Subnet.to_u8(),
            protocol_id: 0,
            port: 0,
            data: local.to_vec(),
        };
        let idcr = IdView {
            id_type: super::constants::IdType::Ipv4Subnet.to_u8(),
            protocol_id: 0,
            port: 0,
            data: peer.to_vec(),
        };
        sa.my_id_body = idci.to_bytes();
        sa.peer_id_body = idcr.to_bytes();
        payloads.push((PayloadType::Identification, sa.my_id_body.clone()));
        payloads.push((PayloadType::Identification, sa.peer_id_body.clone()));
    }

    let msgid = sa.msgid;
    let bytes = build_hashed_message(
        sa,
        ExchangeType::Quick,
        msgid,
        HashType::Hash1,
        payloads,
        true,
    )?;
    sa.iv = sa.new_iv.clone();
    Ok(bytes)
}
