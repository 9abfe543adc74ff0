//! Per-BMC session state: login handshake (IPMI 1.5 and RMCP+/RAKP),
//! command dispatch with retry/taboo bookkeeping, and the optional SOL
//! channel layered on top.

pub mod login;
pub mod sol;

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use rand::RngCore;

use crate::app::auth::{AuthType, PrivilegeLevel};
use crate::codec::rakp::{self, DerivedKeys};
use crate::codec::{v1_5, v2_0};
use crate::connection::{CompletionCode, Message, NetFn};
use crate::transport::Transport;

pub use login::{
    ConfidentialityAlgorithm, IntegrityAlgorithm, IpmiVersion, LoginError, LoginParams,
    LoginState, RakpContext,
};
use sol::SolChannel;
pub use sol::SolSink;

const INITIAL_LOCAL_SESSION_ID: u32 = 2_017_673_555;
const RETRY_CEILING: Duration = Duration::from_secs(5);
const KEEPALIVE_BASE: Duration = Duration::from_secs(25);

/// The result of a completed `raw_command`/`raw_command_async` exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandResponse {
    pub netfn: NetFn,
    pub command: u8,
    pub code: u8,
    pub data: Vec<u8>,
}

/// Why a command exchange did not complete successfully. Failures reported
/// by the BMC itself (a non-zero completion code) are *not* an error here —
/// they arrive as a normal [`CommandResponse`] with `code != 0`; it is up to
/// the caller to interpret the code. This type covers the cases where no
/// `CommandResponse` could be produced at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// The per-retry timeout was exceeded without a reply.
    Timeout,
    /// The session is not established (login still in progress, or it
    /// failed and will never retry).
    NotEstablished,
}

type ResultCallback = Box<dyn FnMut(Result<CommandResponse, CommandError>)>;
type LoginCallback = Box<dyn FnMut(Result<(), LoginError>)>;

struct QueuedCommand {
    netfn: NetFn,
    cmd: u8,
    data: Vec<u8>,
    retry: bool,
    callback: ResultCallback,
}

struct InFlight {
    netfn_raw: u8,
    cmd: u8,
    seq_lun: u8,
    retry: bool,
    resent: bool,
    callback: ResultCallback,
}

struct RetryTimer {
    deadline: Instant,
    current_timeout: Duration,
}

/// Which wire payload was sent out last, so a retransmit can reproduce it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum PayloadKind {
    GetChannelAuthCap,
    SessionChallenge,
    ActivateSession,
    SetPrivilege,
    OpenSessionRequest,
    Rakp1,
    Rakp3,
    Core,
}

struct SessionInner {
    peer: SocketAddr,
    userid: Vec<u8>,
    password: Vec<u8>,
    kg: Vec<u8>,
    requested_privilege: PrivilegeLevel,
    allow_ipmi15: bool,
    used_ipmi15_probe: bool,

    ipmi_version: Option<IpmiVersion>,
    confidentiality: ConfidentialityAlgorithm,
    integrity: IntegrityAlgorithm,
    auth_type: AuthType,

    sik: Option<[u8; 20]>,
    k1: Option<[u8; 20]>,
    k2: Option<[u8; 20]>,

    local_session_id: u32,
    pending_session_id: u32,
    session_id: u32,
    sequence_number: u32,
    remote_sequence_number: u32,
    seq_lun: u8,

    login_state: LoginState,
    rakp: RakpContext,
    login_waiters: Vec<LoginCallback>,

    last_payload: Option<Vec<u8>>,
    last_payload_kind: Option<PayloadKind>,
    retry: Option<RetryTimer>,

    in_command: Option<InFlight>,
    queue: VecDeque<QueuedCommand>,
    taboo: HashMap<(u8, u8, u8), u8>,

    keepalive_deadline: Option<Instant>,
    sol: Option<SolChannel>,
}

impl SessionInner {
    fn next_tag(&mut self) -> u8 {
        let mut buf = [0u8; 1];
        rand::thread_rng().fill_bytes(&mut buf);
        buf[0]
    }

    fn is_established(&self) -> bool {
        self.login_state.is_established()
    }
}

/// A single BMC session. Cheap to clone (an `Rc` handle); clones refer to
/// the same underlying session.
#[derive(Clone)]
pub struct Session {
    inner: Rc<RefCell<SessionInner>>,
}

/// The tuple that identifies whether two `Session::new` calls refer to the
/// same logical session, for [`crate::SessionManager`]'s dedupe registry.
pub type SessionKey = (SocketAddr, Vec<u8>, Vec<u8>, Vec<u8>);

impl Session {
    pub(crate) fn create(
        peer: SocketAddr,
        userid: Vec<u8>,
        password: Vec<u8>,
        kg: Vec<u8>,
        params: LoginParams,
    ) -> Self {
        let inner = SessionInner {
            peer,
            userid,
            password,
            kg,
            requested_privilege: params.privilege,
            allow_ipmi15: params.allow_ipmi15,
            used_ipmi15_probe: false,
            ipmi_version: None,
            confidentiality: ConfidentialityAlgorithm::None,
            integrity: IntegrityAlgorithm::None,
            auth_type: AuthType::None,
            sik: None,
            k1: None,
            k2: None,
            local_session_id: INITIAL_LOCAL_SESSION_ID,
            pending_session_id: 0,
            session_id: 0,
            sequence_number: 0,
            remote_sequence_number: 0,
            seq_lun: 0,
            login_state: LoginState::Init,
            rakp: RakpContext::default(),
            login_waiters: Vec::new(),
            last_payload: None,
            last_payload_kind: None,
            retry: None,
            in_command: None,
            queue: VecDeque::new(),
            taboo: HashMap::new(),
            keepalive_deadline: None,
            sol: None,
        };
        Session {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.inner.borrow().peer
    }

    pub fn dedupe_key(&self) -> SessionKey {
        let inner = self.inner.borrow();
        (
            inner.peer,
            inner.userid.clone(),
            inner.password.clone(),
            inner.kg.clone(),
        )
    }

    pub fn is_established(&self) -> bool {
        self.inner.borrow().is_established()
    }

    pub fn is_failed(&self) -> bool {
        self.inner.borrow().login_state.is_failed()
    }

    /// Kick off the login handshake. Idempotent no-op if already past
    /// `Init`.
    pub(crate) fn start_login(&self, transport: &Transport) {
        let mut inner = self.inner.borrow_mut();
        if inner.login_state != LoginState::Init {
            return;
        }
        drop(inner);
        self.send_channel_auth_cap_probe(transport, 0x8E);
        inner = self.inner.borrow_mut();
        inner.used_ipmi15_probe = false;
    }

    pub(crate) fn register_login_waiter(&self, cb: LoginCallback) {
        self.inner.borrow_mut().login_waiters.push(cb);
    }

    /// Like [`Self::register_login_waiter`], but fires immediately (instead
    /// of queuing) if the session has already reached `Established` or
    /// `Failed` — the case of [`crate::SessionManager::session`] deduping
    /// onto an already-settled session.
    pub(crate) fn on_login(&self, mut cb: LoginCallback) {
        let state = self.inner.borrow().login_state;
        match state {
            LoginState::Established => cb(Ok(())),
            LoginState::Failed => {
                cb(Err(LoginError::Protocol("session previously failed to log in")))
            }
            _ => self.register_login_waiter(cb),
        }
    }

    fn notify_login_waiters(&self, result: Result<(), LoginError>) {
        let mut waiters = std::mem::take(&mut self.inner.borrow_mut().login_waiters);
        for mut cb in waiters.drain(..) {
            cb(result.clone());
        }
    }

    fn fail_login(&self, err: LoginError) {
        log::error!("session login failed: {err}");
        self.inner.borrow_mut().login_state = LoginState::Failed;
        self.inner.borrow_mut().retry = None;
        self.notify_login_waiters(Err(err));
    }

    fn establish(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.login_state = LoginState::Established;
        inner.retry = None;
        inner.keepalive_deadline = Some(next_keepalive_deadline());
        drop(inner);
        log::debug!("session established");
        self.notify_login_waiters(Ok(()));
    }

    // ---- outbound framing -------------------------------------------------

    fn send_v1_5(&self, transport: &Transport, core: &[u8], kind: PayloadKind) {
        let mut inner = self.inner.borrow_mut();
        let auth_type: u8 = match inner.auth_type {
            AuthType::None => 0,
            _ => 2, // MD5 is the only non-none auth type this crate negotiates
        };

        let auth_code = if auth_type != 0 {
            let password = v1_5::pad16(&inner.password).unwrap_or([0u8; 16]);
            Some(v1_5::md5_auth_code(
                &password,
                inner.session_id,
                core,
                inner.sequence_number,
            ))
        } else {
            None
        };

        let frame = v1_5::build_frame(&v1_5::Frame {
            auth_type,
            sequence: inner.sequence_number,
            session_id: inner.session_id,
            auth_code,
            payload: core,
        });

        inner.sequence_number = inner.sequence_number.wrapping_add(1);
        inner.last_payload = Some(core.to_vec());
        inner.last_payload_kind = Some(kind);
        let peer = inner.peer;
        drop(inner);

        if let Err(e) = transport.send_to(peer, &frame) {
            log::warn!("failed to send IPMI 1.5 frame: {e}");
        }
        self.arm_retry_timer();
    }

    fn send_v2_unprotected(
        &self,
        transport: &Transport,
        payload_type: v2_0::PayloadType,
        payload: &[u8],
        kind: PayloadKind,
    ) {
        let mut inner = self.inner.borrow_mut();
        let session_id = if payload_type == v2_0::PayloadType::OpenSessionRequest {
            0
        } else {
            inner.session_id
        };
        let frame = v2_0::build_frame(&v2_0::BuildParams {
            payload_type,
            session_id,
            sequence: inner.sequence_number,
            payload,
            confidentiality_key: None,
            iv: None,
            integrity_key: None,
        });
        inner.sequence_number = inner.sequence_number.wrapping_add(1);
        inner.last_payload = Some(payload.to_vec());
        inner.last_payload_kind = Some(kind);
        let peer = inner.peer;
        drop(inner);

        if let Err(e) = transport.send_to(peer, &frame) {
            log::warn!("failed to send RMCP+ handshake frame: {e}");
        }
        self.arm_retry_timer();
    }

    fn send_v2_protected(
        &self,
        transport: &Transport,
        payload_type: v2_0::PayloadType,
        payload: &[u8],
        kind: PayloadKind,
    ) {
        let mut inner = self.inner.borrow_mut();
        let aes_key = inner.k2.map(|k2| {
            let arr: [u8; 16] = k2[..16].try_into().unwrap();
            arr
        });
        let mut iv = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut iv);

        let confidentiality_key = if inner.confidentiality == ConfidentialityAlgorithm::AesCbc128
        {
            aes_key.as_ref()
        } else {
            None
        };
        let integrity_key: Option<Vec<u8>> =
            if inner.integrity == IntegrityAlgorithm::HmacSha1_96 {
                inner.k1.map(|k1| k1.to_vec())
            } else {
                None
            };

        let frame = v2_0::build_frame(&v2_0::BuildParams {
            payload_type,
            session_id: inner.session_id,
            sequence: inner.sequence_number,
            payload,
            confidentiality_key,
            iv: Some(iv),
            integrity_key: integrity_key.as_deref(),
        });

        inner.sequence_number = inner.sequence_number.wrapping_add(1);
        inner.last_payload = Some(payload.to_vec());
        inner.last_payload_kind = Some(kind);
        let peer = inner.peer;
        drop(inner);

        if let Err(e) = transport.send_to(peer, &frame) {
            log::warn!("failed to send RMCP+ frame: {e}");
        }
        self.arm_retry_timer();
    }

    /// Send a core IPMI payload using whichever framing the session has
    /// negotiated (or IPMI 1.5 unauthenticated, pre-negotiation).
    fn send_core_frame(&self, transport: &Transport, core: &[u8], kind: PayloadKind) {
        let version = self.inner.borrow().ipmi_version;
        match version {
            Some(IpmiVersion::V2_0) if self.inner.borrow().is_established() => {
                self.send_v2_protected(transport, v2_0::PayloadType::Ipmi, core, kind)
            }
            Some(IpmiVersion::V2_0) => {
                self.send_v2_unprotected(transport, v2_0::PayloadType::Ipmi, core, kind)
            }
            _ => self.send_v1_5(transport, core, kind),
        }
    }

    fn resend_last_payload(&self, transport: &Transport) {
        let (payload, kind, payload_type) = {
            let inner = self.inner.borrow();
            let Some(payload) = inner.last_payload.clone() else {
                return;
            };
            let kind = inner.last_payload_kind.unwrap_or(PayloadKind::Core);
            let payload_type = match kind {
                PayloadKind::Rakp1 => Some(v2_0::PayloadType::Rakp1),
                PayloadKind::Rakp3 => Some(v2_0::PayloadType::Rakp3),
                PayloadKind::OpenSessionRequest => Some(v2_0::PayloadType::OpenSessionRequest),
                _ => None,
            };
            (payload, kind, payload_type)
        };

        if let Some(ty) = payload_type {
            self.send_v2_unprotected(transport, ty, &payload, kind);
            return;
        }

        if let Some(mut inflight) = self.inner.borrow_mut().in_command.take() {
            inflight.resent = true;
            self.inner.borrow_mut().in_command = Some(inflight);
        }
        self.send_core_frame(transport, &payload, kind);
    }

    // ---- login: probing / IPMI 1.5 branch ---------------------------------

    fn send_channel_auth_cap_probe(&self, transport: &Transport, probe_byte: u8) {
        let privilege = self.inner.borrow().requested_privilege;
        let message = Message::new_request(NetFn::App, 0x38, vec![probe_byte, privilege.into()]);
        self.send_v1_5(
            transport,
            &core_payload_for(&message),
            PayloadKind::GetChannelAuthCap,
        );
    }

    fn send_session_challenge(&self, transport: &Transport) {
        use crate::app::auth::GetSessionChallenge;
        let (auth_type, userid) = {
            let inner = self.inner.borrow();
            (inner.auth_type, inner.userid.clone())
        };
        let username = core::str::from_utf8(&userid).unwrap_or("");
        let Some(cmd) = GetSessionChallenge::new(auth_type, Some(username)) else {
            self.fail_login(LoginError::Protocol("username too long for IPMI 1.5"));
            return;
        };
        let message: Message = cmd.into();
        self.send_v1_5(
            transport,
            &core_payload_for(&message),
            PayloadKind::SessionChallenge,
        );
    }

    fn send_activate_session(&self, transport: &Transport, challenge: [u8; 16]) {
        use crate::app::auth::ActivateSession;
        let (auth_type, privilege) = {
            let inner = self.inner.borrow();
            (inner.auth_type, inner.requested_privilege)
        };
        let message: Message = ActivateSession {
            auth_type,
            maxiumum_privilege_level: privilege,
            challenge_string: challenge,
            initial_sequence_number: 1,
        }
        .into();
        self.send_v1_5(
            transport,
            &core_payload_for(&message),
            PayloadKind::ActivateSession,
        );
    }

    fn send_set_privilege(&self, transport: &Transport) {
        use crate::app::auth::SetSessionPrivilegeLevel;
        let privilege = self.inner.borrow().requested_privilege;
        let message: Message = SetSessionPrivilegeLevel::new(privilege).into();
        self.send_core_frame(
            transport,
            &core_payload_for(&message),
            PayloadKind::SetPrivilege,
        );
    }

    // ---- login: RMCP+ / RAKP branch ---------------------------------------

    fn send_open_session_request(&self, transport: &Transport) {
        let (tag, local_sid, privilege) = {
            let mut inner = self.inner.borrow_mut();
            let tag = inner.next_tag();
            inner.rakp.tag = tag;
            inner.login_state = LoginState::OpenSession;
            (tag, inner.local_session_id, inner.requested_privilege)
        };
        let payload = rakp::build_open_session_request(tag, privilege.into(), local_sid);
        self.send_v2_unprotected(
            transport,
            v2_0::PayloadType::OpenSessionRequest,
            &payload,
            PayloadKind::OpenSessionRequest,
        );
    }

    fn send_rakp1(&self, transport: &Transport) {
        let (tag, pending_sid, random_local, privilege, userid) = {
            let mut inner = self.inner.borrow_mut();
            let mut random_local = [0u8; 16];
            rand::thread_rng().fill_bytes(&mut random_local);
            inner.rakp.random_local = random_local;
            inner.login_state = LoginState::ExpectingRakp2;
            (
                inner.rakp.tag,
                inner.pending_session_id,
                random_local,
                inner.requested_privilege,
                inner.userid.clone(),
            )
        };
        let payload = rakp::build_rakp1(tag, pending_sid, random_local, privilege.into(), &userid);
        self.send_v2_unprotected(transport, v2_0::PayloadType::Rakp1, &payload, PayloadKind::Rakp1);
    }

    fn send_rakp3(&self, transport: &Transport) {
        let (tag, pending_sid, password, random_remote, local_sid, privilege, userid) = {
            let mut inner = self.inner.borrow_mut();
            inner.login_state = LoginState::ExpectingRakp4;
            (
                inner.rakp.tag,
                inner.pending_session_id,
                inner.password.clone(),
                inner.rakp.random_remote,
                inner.local_session_id,
                inner.requested_privilege,
                inner.userid.clone(),
            )
        };
        let payload = rakp::build_rakp3(
            tag,
            pending_sid,
            &password,
            &random_remote,
            local_sid,
            privilege.into(),
            &userid,
        );
        self.send_v2_unprotected(transport, v2_0::PayloadType::Rakp3, &payload, PayloadKind::Rakp3);
    }

    fn relog(&self, transport: &Transport) {
        log::debug!("restarting login after lost RAKP exchange");
        self.inner.borrow_mut().login_state = LoginState::Init;
        self.start_login(transport);
    }

    // ---- inbound ------------------------------------------------------------

    pub(crate) fn handle_packet(&self, raw: &[u8], transport: &Transport) {
        if raw.len() < 5 || raw[0..4] != crate::codec::RMCP_HEADER {
            log::trace!("dropping non-RMCP/IPMI datagram");
            return;
        }

        match raw[4] {
            0x06 => self.handle_v2_packet(raw, transport),
            0 | 2 => self.handle_v1_5_packet(raw, transport),
            other => log::trace!("dropping datagram with unsupported authtype 0x{other:02X}"),
        }
    }

    fn handle_v1_5_packet(&self, raw: &[u8], transport: &Transport) {
        let parsed = match v1_5::parse_frame(raw) {
            Ok(p) => p,
            Err(e) => {
                log::trace!("dropping unparseable IPMI 1.5 frame: {e:?}");
                return;
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            if inner.is_established() && parsed.session_id != inner.session_id {
                log::trace!("dropping IPMI 1.5 frame with mismatched session id");
                return;
            }
            if parsed.sequence != 0 && parsed.sequence < inner.remote_sequence_number {
                log::trace!("dropping out-of-order IPMI 1.5 frame");
                return;
            }
            inner.remote_sequence_number = parsed.sequence;
        }

        match crate::codec::parse_core_payload(&parsed.payload) {
            Ok(core) => self.on_core_response(core.netfn, core.seq_lun, core.cmd, &core.data, transport),
            Err(e) => log::trace!("dropping malformed core payload: {e:?}"),
        }
    }

    fn handle_v2_packet(&self, raw: &[u8], transport: &Transport) {
        let (integrity_key, confidentiality_key) = {
            let inner = self.inner.borrow();
            let ik = inner.k1.filter(|_| inner.integrity == IntegrityAlgorithm::HmacSha1_96);
            let ck = inner.k2.filter(|_| inner.confidentiality == ConfidentialityAlgorithm::AesCbc128)
                .map(|k2| -> [u8; 16] { k2[..16].try_into().unwrap() });
            (ik, ck)
        };

        let parsed = match v2_0::parse_frame(
            raw,
            integrity_key.as_ref().map(|k| k.as_slice()),
            confidentiality_key.as_ref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                log::trace!("dropping unparseable RMCP+ frame: {e:?}");
                return;
            }
        };

        let requires_auth = self.inner.borrow().is_established();
        if requires_auth && !parsed.authenticated {
            log::warn!("dropping unauthenticated RMCP+ frame on an authenticated session");
            return;
        }

        {
            let mut inner = self.inner.borrow_mut();
            if inner.is_established() {
                if parsed.session_id != inner.session_id {
                    log::trace!("dropping RMCP+ frame with mismatched session id");
                    return;
                }
                if parsed.sequence != 0
                    && parsed.sequence < inner.remote_sequence_number
                    && inner.remote_sequence_number != u32::MAX
                {
                    log::trace!("dropping out-of-order RMCP+ frame");
                    return;
                }
                inner.remote_sequence_number = parsed.sequence;
            }
        }

        match parsed.payload_type {
            v2_0::PayloadType::OpenSessionResponse => self.on_open_session_response(&parsed.payload, transport),
            v2_0::PayloadType::Rakp2 => self.on_rakp2(&parsed.payload, transport),
            v2_0::PayloadType::Rakp4 => self.on_rakp4(&parsed.payload, transport),
            v2_0::PayloadType::Ipmi => match crate::codec::parse_core_payload(&parsed.payload) {
                Ok(core) => self.on_core_response(core.netfn, core.seq_lun, core.cmd, &core.data, transport),
                Err(e) => log::trace!("dropping malformed core payload: {e:?}"),
            },
            v2_0::PayloadType::Sol => self.on_sol_packet(&parsed.payload, transport),
            other => log::trace!("dropping unexpected payload type {other:?}"),
        }
    }

    fn on_open_session_response(&self, payload: &[u8], transport: &Transport) {
        if self.inner.borrow().login_state != LoginState::OpenSession {
            return;
        }
        let resp = match rakp::parse_open_session_response(payload) {
            Ok(r) => r,
            Err(_) => return,
        };
        if resp.status_code != 0 {
            self.fail_login(LoginError::Protocol("BMC rejected RMCP+ open session request"));
            return;
        }
        self.inner.borrow_mut().pending_session_id = resp.remote_session_id;
        self.send_rakp1(transport);
    }

    fn on_rakp2(&self, payload: &[u8], transport: &Transport) {
        if self.inner.borrow().login_state != LoginState::ExpectingRakp2 {
            return;
        }
        let rakp2 = match rakp::parse_rakp2(payload) {
            Ok(r) => r,
            Err(_) => return,
        };
        if rakp2.status_code != 0 {
            self.fail_login(LoginError::Protocol("BMC rejected RAKP1"));
            return;
        }

        let (password, local_sid, pending_sid, random_local, privilege, userid) = {
            let inner = self.inner.borrow();
            (
                inner.password.clone(),
                inner.local_session_id,
                inner.pending_session_id,
                inner.rakp.random_local,
                inner.requested_privilege,
                inner.userid.clone(),
            )
        };

        let expected = rakp::rakp2_expected_auth_code(
            &password,
            local_sid,
            pending_sid,
            &random_local,
            &rakp2.random_remote,
            &rakp2.remote_guid,
            privilege.into(),
            &userid,
        );

        if expected != rakp2.key_exchange_auth_code {
            self.fail_login(LoginError::IncorrectPassword);
            return;
        }

        let kg = {
            let mut inner = self.inner.borrow_mut();
            inner.rakp.random_remote = rakp2.random_remote;
            inner.rakp.remote_guid = rakp2.remote_guid;
            inner.kg.clone()
        };

        let DerivedKeys { sik, k1, k2 } =
            rakp::derive_keys(&kg, &random_local, &rakp2.random_remote, privilege.into(), &userid);

        {
            let mut inner = self.inner.borrow_mut();
            inner.sik = Some(sik);
            inner.k1 = Some(k1);
            inner.k2 = Some(k2);
            inner.confidentiality = ConfidentialityAlgorithm::AesCbc128;
            inner.integrity = IntegrityAlgorithm::HmacSha1_96;
        }

        self.send_rakp3(transport);
    }

    fn on_rakp4(&self, payload: &[u8], transport: &Transport) {
        if self.inner.borrow().login_state != LoginState::ExpectingRakp4 {
            return;
        }
        let rakp4 = match rakp::parse_rakp4(payload) {
            Ok(r) => r,
            Err(_) => return,
        };
        if rakp4.status_code != 0 {
            self.fail_login(LoginError::Protocol("BMC rejected RAKP3"));
            return;
        }

        let (sik, random_local, pending_sid, remote_guid) = {
            let inner = self.inner.borrow();
            (
                inner.sik.expect("sik derived before RAKP4"),
                inner.rakp.random_local,
                inner.pending_session_id,
                inner.rakp.remote_guid,
            )
        };
        let expected = rakp::rakp4_expected_icv(&sik, &random_local, pending_sid, &remote_guid);
        if rakp4.integrity_check_value.len() < 12 || expected != rakp4.integrity_check_value[..12] {
            self.fail_login(LoginError::InvalidRakp4IntegrityCode);
            return;
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.session_id = inner.pending_session_id;
            inner.ipmi_version = Some(IpmiVersion::V2_0);
            inner.login_state = LoginState::AwaitingPrivilegeLevel;
        }
        self.send_set_privilege(transport);
    }

    fn on_sol_packet(&self, payload: &[u8], transport: &Transport) {
        let to_send = {
            let mut inner = self.inner.borrow_mut();
            let Some(sol) = inner.sol.as_mut() else {
                return;
            };
            match sol.handle_inbound(payload) {
                Ok(packets) => packets,
                Err(_) => return,
            }
        };
        for packet in to_send {
            self.send_v2_protected(transport, v2_0::PayloadType::Sol, &packet, PayloadKind::Core);
        }
    }

    /// Dispatch a core (netfn/cmd) App response, driving either the login
    /// state machine or a completed `raw_command`.
    fn on_core_response(&self, netfn: u8, seq_lun: u8, cmd: u8, data: &[u8], transport: &Transport) {
        let state = self.inner.borrow().login_state;
        match state {
            LoginState::Init => self.on_auth_cap_response(netfn, cmd, data, transport),
            LoginState::AwaitingSessionChallenge => self.on_session_challenge_response(netfn, cmd, data, transport),
            LoginState::AwaitingActivateSession => self.on_activate_session_response(netfn, cmd, data, transport),
            LoginState::AwaitingPrivilegeLevel => self.on_privilege_response(netfn, cmd, data),
            LoginState::Established => self.on_command_response(netfn, seq_lun, cmd, data, transport),
            _ => {}
        }
    }

    fn on_auth_cap_response(&self, netfn: u8, cmd: u8, data: &[u8], transport: &Transport) {
        if netfn != NetFn::App.response_value() || cmd != 0x38 || data.is_empty() {
            return;
        }
        let code = data[0];
        let rest = &data[1..];

        if code == 0xCC {
            let (allow, already_fell_back) = {
                let inner = self.inner.borrow();
                (inner.allow_ipmi15, inner.used_ipmi15_probe)
            };
            if allow && !already_fell_back {
                self.inner.borrow_mut().used_ipmi15_probe = true;
                self.send_channel_auth_cap_probe(transport, 0x0E);
                return;
            }
            self.fail_login(LoginError::Protocol("BMC rejected both IPMI 2.0 and 1.5 probes"));
            return;
        }
        if code != 0 {
            self.fail_login(LoginError::Protocol("Get Channel Authentication Capabilities failed"));
            return;
        }

        use crate::app::auth::GetChannelAuthenticationCapabilities;
        let caps = match GetChannelAuthenticationCapabilities::parse_success_response(rest) {
            Ok(c) => c,
            Err(_) => {
                self.fail_login(LoginError::Protocol("malformed channel auth capabilities response"));
                return;
            }
        };

        if caps.ipmi2_connections_supported {
            self.inner.borrow_mut().ipmi_version = Some(IpmiVersion::V2_0);
            self.send_open_session_request(transport);
            return;
        }

        let Some(best) = caps.best_auth() else {
            self.fail_login(LoginError::NoSupportedAuthType);
            return;
        };
        if best != AuthType::MD5 {
            self.fail_login(LoginError::NoSupportedAuthType);
            return;
        }

        {
            let mut inner = self.inner.borrow_mut();
            inner.ipmi_version = Some(IpmiVersion::V1_5);
            inner.auth_type = AuthType::None;
            inner.login_state = LoginState::AwaitingSessionChallenge;
        }
        self.send_session_challenge(transport);
    }

    fn on_session_challenge_response(&self, netfn: u8, cmd: u8, data: &[u8], transport: &Transport) {
        if netfn != NetFn::App.response_value() || cmd != 0x39 || data.is_empty() {
            return;
        }
        if data[0] != 0 {
            self.fail_login(LoginError::Protocol("Get Session Challenge failed"));
            return;
        }
        use crate::app::auth::GetSessionChallenge;
        let challenge = match GetSessionChallenge::parse_success_response(&data[1..]) {
            Ok(c) => c,
            Err(_) => {
                self.fail_login(LoginError::Protocol("malformed session challenge response"));
                return;
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.session_id = challenge.temporary_session_id.get();
            inner.auth_type = AuthType::MD5;
            inner.login_state = LoginState::AwaitingActivateSession;
        }
        self.send_activate_session(transport, challenge.challenge_string);
    }

    fn on_activate_session_response(&self, netfn: u8, cmd: u8, data: &[u8], transport: &Transport) {
        if netfn != NetFn::App.response_value() || cmd != 0x3A || data.is_empty() {
            return;
        }
        if data[0] != 0 {
            self.fail_login(LoginError::Protocol("Activate Session failed"));
            return;
        }
        use crate::app::auth::ActivateSession;
        let info = match ActivateSession::parse_success_response(&data[1..]) {
            Ok(i) => i,
            Err(_) => {
                self.fail_login(LoginError::Protocol("malformed activate session response"));
                return;
            }
        };

        {
            let mut inner = self.inner.borrow_mut();
            inner.session_id = info.session_id.get();
            inner.sequence_number = info.initial_sequence_number;
            inner.login_state = LoginState::AwaitingPrivilegeLevel;
        }
        self.send_set_privilege(transport);
    }

    fn on_privilege_response(&self, netfn: u8, cmd: u8, data: &[u8]) {
        if netfn != NetFn::App.response_value() || cmd != 0x3B || data.is_empty() {
            return;
        }
        if data[0] != 0 {
            self.fail_login(LoginError::Protocol("Set Session Privilege Level failed"));
            return;
        }
        self.establish();
    }

    fn on_command_response(&self, netfn: u8, seq_lun: u8, cmd: u8, data: &[u8], transport: &Transport) {
        let mut inner = self.inner.borrow_mut();
        let Some(inflight) = inner.in_command.as_ref() else {
            return;
        };
        let expected_netfn = NetFn::from(inflight.netfn_raw).response_value();
        if netfn != expected_netfn || cmd != inflight.cmd || seq_lun != inflight.seq_lun {
            log::trace!("dropping reply that doesn't match the in-flight command");
            return;
        }
        if data.is_empty() {
            log::trace!("dropping empty command response");
            return;
        }

        let inflight = inner.in_command.take().unwrap();
        inner.retry = None;
        if inflight.resent {
            inner
                .taboo
                .insert((inflight.netfn_raw, inflight.cmd, inflight.seq_lun), 16);
        }
        drop(inner);

        let response = CommandResponse {
            netfn: NetFn::from(netfn),
            command: cmd,
            code: data[0],
            data: data[1..].to_vec(),
        };
        let mut callback = inflight.callback;
        callback(Ok(response));

        self.dequeue_next(transport);
    }

    fn dequeue_next(&self, transport: &Transport) {
        let next = self.inner.borrow_mut().queue.pop_front();
        if let Some(queued) = next {
            self.dispatch(queued.netfn, queued.cmd, queued.data, queued.retry, queued.callback, transport);
        }
    }

    // ---- timers -------------------------------------------------------------

    fn arm_retry_timer(&self) {
        let mut inner = self.inner.borrow_mut();
        let timeout = match &inner.retry {
            Some(r) => r.current_timeout,
            None => initial_retry_timeout(),
        };
        inner.retry = Some(RetryTimer {
            deadline: Instant::now() + timeout,
            current_timeout: timeout,
        });
    }

    /// Deadline this session next needs attention at (retry or keepalive),
    /// whichever is sooner.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        let inner = self.inner.borrow();
        match (inner.retry.as_ref().map(|r| r.deadline), inner.keepalive_deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, Some(b)) => Some(b),
            (None, None) => None,
        }
    }

    pub(crate) fn is_waiting(&self) -> bool {
        let inner = self.inner.borrow();
        inner.in_command.is_some() || !matches!(inner.login_state, LoginState::Established | LoginState::Failed)
    }

    pub(crate) fn on_timer(&self, transport: &Transport) {
        let retry_due = self
            .inner
            .borrow()
            .retry
            .as_ref()
            .is_some_and(|r| Instant::now() >= r.deadline);
        if retry_due {
            self.on_retry_timeout(transport);
        }

        let keepalive_due = self
            .inner
            .borrow()
            .keepalive_deadline
            .is_some_and(|d| Instant::now() >= d);
        if keepalive_due {
            self.on_keepalive_due(transport);
        }
    }

    fn on_retry_timeout(&self, transport: &Transport) {
        if self.inner.borrow().last_payload.is_none() {
            self.inner.borrow_mut().retry = None;
            return;
        }

        let exceeded = {
            let mut inner = self.inner.borrow_mut();
            let Some(retry) = inner.retry.as_mut() else {
                return;
            };
            retry.current_timeout += Duration::from_secs(1);
            let exceeded = retry.current_timeout > RETRY_CEILING;
            if !exceeded {
                retry.deadline = Instant::now() + retry.current_timeout;
            }
            exceeded
        };

        if exceeded {
            self.inner.borrow_mut().retry = None;
            let state = self.inner.borrow().login_state;
            if state == LoginState::Established {
                self.fail_in_flight(transport);
            } else {
                self.fail_login(LoginError::Timeout);
            }
            return;
        }

        let state = self.inner.borrow().login_state;
        match state {
            LoginState::OpenSession => {
                self.inner.borrow_mut().local_session_id =
                    self.inner.borrow().local_session_id.wrapping_add(1);
                self.send_open_session_request(transport);
            }
            LoginState::ExpectingRakp2 | LoginState::ExpectingRakp4 => self.relog(transport),
            _ => self.resend_last_payload(transport),
        }
    }

    fn fail_in_flight(&self, transport: &Transport) {
        let inflight = self.inner.borrow_mut().in_command.take();
        if let Some(mut inflight) = inflight {
            inflight.callback.as_mut()(Err(CommandError::Timeout));
        }
        self.dequeue_next(transport);
    }

    fn on_keepalive_due(&self, transport: &Transport) {
        let busy = self.inner.borrow().in_command.is_some();
        self.inner.borrow_mut().keepalive_deadline = Some(next_keepalive_deadline());
        if busy {
            return;
        }
        self.raw_command_async(NetFn::App, 0x01, Vec::new(), false, |_| {}, transport);
    }

    // ---- public command API --------------------------------------------------

    pub fn raw_command(
        &self,
        manager: &crate::SessionManager,
        netfn: NetFn,
        cmd: u8,
        data: Vec<u8>,
        retry: bool,
    ) -> Result<CommandResponse, CommandError> {
        let slot: Rc<RefCell<Option<Result<CommandResponse, CommandError>>>> =
            Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        self.raw_command_async(
            netfn,
            cmd,
            data,
            retry,
            move |result| {
                *slot2.borrow_mut() = Some(result);
            },
            manager.transport(),
        );

        loop {
            if let Some(result) = slot.borrow_mut().take() {
                return result;
            }
            manager.wait_for_response(Duration::from_millis(250));
        }
    }

    pub fn raw_command_async(
        &self,
        netfn: NetFn,
        cmd: u8,
        data: Vec<u8>,
        retry: bool,
        callback: impl FnMut(Result<CommandResponse, CommandError>) + 'static,
        transport: &Transport,
    ) {
        if !self.is_established() {
            let mut callback = callback;
            callback(Err(CommandError::NotEstablished));
            return;
        }
        self.dispatch(netfn, cmd, data, retry, Box::new(callback), transport);
    }

    fn dispatch(
        &self,
        netfn: NetFn,
        cmd: u8,
        data: Vec<u8>,
        retry: bool,
        callback: ResultCallback,
        transport: &Transport,
    ) {
        if self.inner.borrow().in_command.is_some() {
            self.inner.borrow_mut().queue.push_back(QueuedCommand {
                netfn,
                cmd,
                data,
                retry,
                callback,
            });
            return;
        }

        let netfn_raw = netfn.request_value();
        let mut seq_lun = self.inner.borrow().seq_lun;
        for _ in 0..7 {
            if !self.check_and_age_taboo((netfn_raw, cmd, seq_lun)) {
                break;
            }
            seq_lun = seq_lun.wrapping_add(4);
        }
        self.inner.borrow_mut().seq_lun = seq_lun.wrapping_add(4);

        self.inner.borrow_mut().in_command = Some(InFlight {
            netfn_raw,
            cmd,
            seq_lun,
            retry,
            resent: false,
            callback,
        });

        let core = crate::codec::build_core_payload(netfn_raw, seq_lun, cmd, &data);
        self.send_core_frame(transport, &core, PayloadKind::Core);
    }

    fn check_and_age_taboo(&self, key: (u8, u8, u8)) -> bool {
        let mut inner = self.inner.borrow_mut();
        match inner.taboo.get_mut(&key) {
            None => false,
            Some(count) if *count == 0 => {
                inner.taboo.remove(&key);
                false
            }
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    inner.taboo.remove(&key);
                }
                true
            }
        }
    }

    /// Activate Serial-Over-LAN on this (already established) session. See
    /// [`crate::Console`] for the higher-level wrapper most callers
    /// should use instead of calling this directly.
    pub(crate) fn activate_sol(
        &self,
        manager: &crate::SessionManager,
        sink: SolSink,
        force: bool,
    ) -> Result<(), LoginError> {
        use crate::app::activate_payload::{ActivatePayload, PayloadType as ApPayloadType};
        use crate::connection::{CompletionCode as CC, IpmiCommand};

        let mut retried = false;
        loop {
            let result = self.raw_command(
                manager,
                NetFn::App,
                0x48,
                ActivatePayload::new(ApPayloadType::Sol, 1).into().into_data(),
                true,
            );

            let response = match result {
                Ok(r) => r,
                Err(_) => return Err(LoginError::Timeout),
            };

            if response.code == 0 {
                let activated = ActivatePayload::parse_success_response(&response.data)
                    .map_err(|_| LoginError::Protocol("malformed SOL activation response"))?;
                if activated.payload_udp_port != 623 {
                    return Err(LoginError::Protocol("Non-standard SOL Port Number"));
                }
                let max_outbound = activated.max_outbound_payload_size.max(1) as usize;
                self.inner.borrow_mut().sol = Some(SolChannel::new(max_outbound, sink));
                return Ok(());
            }

            if response.code == 0x80 && force && !retried {
                retried = true;
                let _ = self.raw_command(
                    manager,
                    NetFn::App,
                    0x49,
                    crate::app::activate_payload::DeactivatePayload::new(ApPayloadType::Sol, 1)
                        .into()
                        .into_data(),
                    false,
                );
                continue;
            }

            let message = match CC::try_from(response.code) {
                Ok(CC::CommandSpecific(0x81)) => "SOL disabled",
                Ok(CC::CommandSpecific(0x82)) => "maximum number of SOL sessions reached",
                Ok(CC::CommandSpecific(0x83)) => "SOL payload encryption mismatch",
                Ok(CC::CommandSpecific(0x84)) => "SOL payload authentication mismatch",
                _ => "SOL activation rejected",
            };
            return Err(LoginError::Protocol(message));
        }
    }

    pub(crate) fn queue_sol_output(&self, data: &[u8]) {
        if let Some(sol) = self.inner.borrow_mut().sol.as_mut() {
            sol.queue_output(data);
        }
    }

    pub(crate) fn pump_sol(&self, transport: &Transport) {
        let packet = {
            let mut inner = self.inner.borrow_mut();
            inner.sol.as_mut().and_then(|s| s.try_send())
        };
        if let Some(packet) = packet {
            self.send_v2_protected(transport, v2_0::PayloadType::Sol, &packet, PayloadKind::Core);
        }
    }

    pub fn logout(&self, manager: &crate::SessionManager) {
        if !self.is_established() {
            return;
        }
        let session_id = self.inner.borrow().session_id;
        if let Ok(session_id) = std::num::NonZeroU32::try_from(session_id) {
            let _ = self.raw_command(
                manager,
                NetFn::App,
                0x3C,
                crate::app::CloseSession::new(session_id).into().into_data(),
                false,
            );
        }
        self.inner.borrow_mut().login_state = LoginState::Failed;
    }
}

fn core_payload_for(message: &Message) -> Vec<u8> {
    crate::codec::build_core_payload(message.netfn_raw(), 0, message.cmd(), message.data())
}

fn initial_retry_timeout() -> Duration {
    Duration::from_secs_f64(0.5 + rand::random::<f64>() * 0.5)
}

fn next_keepalive_deadline() -> Instant {
    Instant::now() + KEEPALIVE_BASE + Duration::from_secs_f64(rand::random::<f64>() * 4.9)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_session() -> Session {
        Session::create(
            "127.0.0.1:623".parse().unwrap(),
            b"admin".to_vec(),
            b"password".to_vec(),
            b"password".to_vec(),
            LoginParams::default(),
        )
    }

    #[test]
    fn taboo_counter_ages_out() {
        let session = new_session();
        session
            .inner
            .borrow_mut()
            .taboo
            .insert((0x06, 0x01, 0x04), 2);

        assert!(session.check_and_age_taboo((0x06, 0x01, 0x04)));
        assert!(session.check_and_age_taboo((0x06, 0x01, 0x04)));
        assert!(!session.check_and_age_taboo((0x06, 0x01, 0x04)));
        assert!(!session.inner.borrow().taboo.contains_key(&(0x06, 0x01, 0x04)));
    }

    #[test]
    fn seq_lun_wraps_modulo_256() {
        let session = new_session();
        session.inner.borrow_mut().seq_lun = 0xFC;
        let next = session.inner.borrow().seq_lun.wrapping_add(4);
        assert_eq!(next, 0x00);
    }

    #[test]
    fn retry_timeout_grows_and_eventually_exceeds_ceiling() {
        let mut timeout = Duration::from_secs_f64(0.6);
        let mut attempts = 0;
        while timeout <= RETRY_CEILING {
            timeout += Duration::from_secs(1);
            attempts += 1;
        }
        assert!(attempts >= 4);
    }

    #[test]
    fn fresh_session_is_not_established() {
        let session = new_session();
        assert!(!session.is_established());
        assert!(!session.is_failed());
    }
}
