//! Process-wide shared state: the single UDP socket, the session/handle
//! registries, and the single-threaded cooperative dispatcher loop that is
//! this crate's only source of progress (login handshakes, command
//! retries, keepalives, SOL pumping).

use std::cell::RefCell;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::rc::Rc;
use std::time::{Duration, Instant};

use nix::poll::{poll, PollFd, PollFlags};

use crate::app::auth::PrivilegeLevel;
use crate::error::{ConfigurationError, IpmiError};
use crate::session::{LoginError, LoginParams, Session, SessionKey, SolSink};
use crate::transport::Transport;

type HandleCallback = Box<dyn FnMut()>;

struct ManagerState {
    sessions_by_key: HashMap<SessionKey, Session>,
    sessions_by_peer: HashMap<SocketAddr, Session>,
    handles: HashMap<RawFd, HandleCallback>,
}

/// Owns the single UDP socket and the registries shared by every
/// [`Session`] created through it, and drives the cooperative dispatcher
/// loop ([`SessionManager::wait_for_response`]).
///
/// Not `Sync`: its registries are plain `HashMap`s, mutated only from
/// inside [`Self::wait_for_response`] and the session-creation/logout
/// paths, all of which run on the single thread that owns this value.
pub struct SessionManager {
    transport: Transport,
    state: RefCell<ManagerState>,
}

impl SessionManager {
    /// Bind a fresh dual-stack UDP socket on `port` (use `0` for an
    /// ephemeral port) and create an empty manager.
    pub fn new(port: u16) -> std::io::Result<Self> {
        Ok(Self {
            transport: Transport::bind(port)?,
            state: RefCell::new(ManagerState {
                sessions_by_key: HashMap::new(),
                sessions_by_peer: HashMap::new(),
                handles: HashMap::new(),
            }),
        })
    }

    pub(crate) fn transport(&self) -> &Transport {
        &self.transport
    }

    /// A capacity hint, derived from the socket's receive buffer, for how
    /// many asynchronous submissions a caller issuing a bulk of
    /// [`Session::raw_command_async`] calls across many sessions should let
    /// build up before re-entering [`Self::wait_for_response`] to let
    /// replies drain. Each session only ever has one request in flight on
    /// the wire, so this matters for fleets of many sessions rather than a
    /// single BMC.
    pub fn max_pending(&self) -> usize {
        self.transport.max_pending()
    }

    /// Register (or look up) the session for `(bmc, userid, password, kg)`,
    /// starting its login handshake if it is newly created. Returns
    /// immediately; use [`Self::session`] to block until login completes,
    /// or poll [`Session::is_established`]/[`Session::is_failed`] yourself
    /// while driving [`Self::wait_for_response`].
    #[allow(clippy::too_many_arguments)]
    pub fn open_session(
        &self,
        bmc: &str,
        userid: &str,
        password: &str,
        kg: Option<&str>,
        port: u16,
        privilege: PrivilegeLevel,
        allow_ipmi15: bool,
    ) -> Result<Session, IpmiError> {
        let userid = userid.as_bytes().to_vec();
        let password = password.as_bytes().to_vec();
        let kg = kg.map(|k| k.as_bytes().to_vec()).unwrap_or_else(|| password.clone());

        if userid.len() > 16 {
            return Err(IpmiError::Configuration(ConfigurationError::UsernameTooLong));
        }
        if password.len() > 20 || kg.len() > 20 {
            return Err(IpmiError::Configuration(ConfigurationError::PasswordTooLong));
        }

        let peer = Transport::resolve(bmc, port).map_err(|e| IpmiError::Transport(e.kind()))?;
        let key: SessionKey = (peer, userid.clone(), password.clone(), kg.clone());

        let mut state = self.state.borrow_mut();
        if let Some(existing) = state.sessions_by_key.get(&key) {
            return Ok(existing.clone());
        }

        let params = LoginParams {
            privilege,
            allow_ipmi15,
        };
        let session = Session::create(peer, userid, password, kg, params);
        state.sessions_by_key.insert(key, session.clone());
        state.sessions_by_peer.insert(peer, session.clone());
        drop(state);

        session.start_login(&self.transport);
        Ok(session)
    }

    /// Open (or reuse) a session and block until its login handshake
    /// completes or fails.
    #[allow(clippy::too_many_arguments)]
    pub fn session(
        &self,
        bmc: &str,
        userid: &str,
        password: &str,
        kg: Option<&str>,
        port: u16,
        privilege: PrivilegeLevel,
        allow_ipmi15: bool,
    ) -> Result<Session, IpmiError> {
        let session = self.open_session(bmc, userid, password, kg, port, privilege, allow_ipmi15)?;

        let slot: Rc<RefCell<Option<Result<(), LoginError>>>> = Rc::new(RefCell::new(None));
        let slot2 = slot.clone();
        session.on_login(Box::new(move |result| {
            *slot2.borrow_mut() = Some(result);
        }));

        loop {
            if let Some(result) = slot.borrow_mut().take() {
                return result.map(|()| session).map_err(IpmiError::from);
            }
            self.wait_for_response(Duration::from_millis(250));
        }
    }

    /// Register a file descriptor the dispatcher should additionally poll
    /// for readability (e.g. a console's stdin). `callback` is invoked, with
    /// no arguments, whenever the descriptor is readable; it is the
    /// callback's job to actually read and act on the data.
    pub fn register_handle_callback(&self, fd: RawFd, callback: impl FnMut() + 'static) {
        self.state.borrow_mut().handles.insert(fd, Box::new(callback));
    }

    pub fn unregister_handle(&self, fd: RawFd) {
        self.state.borrow_mut().handles.remove(&fd);
    }

    pub(crate) fn sessions(&self) -> Vec<Session> {
        self.state.borrow().sessions_by_key.values().cloned().collect()
    }

    /// One iteration of the dispatcher: poll for at most `timeout`, drain
    /// and route every pending datagram, fire any ready external-handle
    /// callbacks, and advance every session's retry/keepalive timers that
    /// have come due. Returns the number of sessions still waiting on a
    /// reply (in-flight command, or login not yet complete/failed) —
    /// callers loop on this to implement a blocking `raw_command`.
    pub fn wait_for_response(&self, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let wait = self.poll_timeout(deadline);
        self.poll_once(wait);
        self.drain_socket();
        self.fire_handles();
        self.advance_timers();

        self.state
            .borrow()
            .sessions_by_peer
            .values()
            .filter(|s| s.is_waiting())
            .count()
    }

    fn poll_timeout(&self, caller_deadline: Instant) -> Duration {
        let mut nearest = caller_deadline;
        for session in self.sessions() {
            if let Some(d) = session.next_deadline() {
                nearest = nearest.min(d);
            }
        }
        nearest.saturating_duration_since(Instant::now())
    }

    fn poll_once(&self, timeout: Duration) {
        let socket_fd = self.transport.raw_fd();
        let handle_fds: Vec<RawFd> = self.state.borrow().handles.keys().copied().collect();

        let mut fds: Vec<PollFd> = Vec::with_capacity(1 + handle_fds.len());
        fds.push(PollFd::new(socket_fd, PollFlags::POLLIN));
        for fd in &handle_fds {
            fds.push(PollFd::new(*fd, PollFlags::POLLIN));
        }

        let millis = timeout.as_millis().min(i32::MAX as u128) as i32;
        if let Err(e) = poll(&mut fds, millis) {
            log::warn!("poll() failed: {e}");
        }
    }

    /// Drain the socket eagerly: read every datagram currently queued,
    /// routing each to its owning session as we go and re-checking the
    /// socket between reads, so the OS receive buffer never has a chance to
    /// fill up while we're busy parsing.
    fn drain_socket(&self) {
        loop {
            let received = match self.transport.try_recv() {
                Ok(Some(packet)) => packet,
                Ok(None) => break,
                Err(e) => {
                    log::warn!("error receiving from socket: {e}");
                    break;
                }
            };
            self.route_packet(received.0, received.1);
        }
    }

    fn route_packet(&self, raw: Vec<u8>, peer: SocketAddr) {
        let session = self.state.borrow().sessions_by_peer.get(&peer).cloned();
        match session {
            Some(session) => session.handle_packet(&raw, &self.transport),
            None => log::trace!("dropping datagram from unknown peer {peer}"),
        }
    }

    fn fire_handles(&self) {
        let fds: Vec<RawFd> = self.state.borrow().handles.keys().copied().collect();
        for fd in fds {
            let readable = {
                let mut pfd = [PollFd::new(fd, PollFlags::POLLIN)];
                matches!(poll(&mut pfd, 0), Ok(n) if n > 0)
            };
            if !readable {
                continue;
            }
            let mut callback = self.state.borrow_mut().handles.remove(&fd);
            if let Some(cb) = callback.as_mut() {
                cb();
            }
            if let Some(cb) = callback {
                self.state.borrow_mut().handles.insert(fd, cb);
            }
        }
    }

    fn advance_timers(&self) {
        for session in self.sessions() {
            session.on_timer(&self.transport);
            session.pump_sol(&self.transport);
        }
    }

    /// Best-effort logout of every live session. Consumers that want this
    /// run automatically on process exit should register it with their own
    /// exit hook (e.g. `libc::atexit` via a `once_cell`, or simply calling
    /// it before the final `drop`); this crate does not install a global
    /// hook itself.
    pub fn close_all(&self) {
        for session in self.sessions() {
            session.logout(self);
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.close_all();
    }
}

/// A higher-level SOL console built on top of an established [`Session`].
///
/// Mirrors the `Console` wrapper this crate's design is modeled on: it owns
/// the payload-activation sequence and hands inbound bytes to a
/// caller-supplied [`SolSink`], while outbound bytes queued with
/// [`Console::send_data`] are drained by the same dispatcher loop that
/// drives everything else.
pub struct Console<'a> {
    manager: &'a SessionManager,
    session: Session,
}

impl<'a> Console<'a> {
    /// Establish (or reuse) a session to `bmc` and activate SOL on it.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        manager: &'a SessionManager,
        bmc: &str,
        userid: &str,
        password: &str,
        sink: SolSink,
        port: u16,
        force: bool,
        kg: Option<&str>,
    ) -> Result<Self, IpmiError> {
        let session = manager.session(
            bmc,
            userid,
            password,
            kg,
            port,
            PrivilegeLevel::Administrator,
            true,
        )?;
        session
            .activate_sol(manager, sink, force)
            .map_err(IpmiError::from)?;
        Ok(Self { manager, session })
    }

    /// Queue bytes to be written to the BMC's serial stream. Actual
    /// transmission happens inside [`Self::wait_for_response`]/
    /// [`Self::main_loop`].
    pub fn send_data(&self, data: &[u8]) {
        self.session.queue_sol_output(data);
    }

    /// Re-enter the dispatcher for up to `timeout`.
    pub fn wait_for_response(&self, timeout: Duration) -> usize {
        self.manager.wait_for_response(timeout)
    }

    /// Drive the dispatcher indefinitely (in practice: until the caller's
    /// registered handle callback, e.g. a terminal-closed signal, decides to
    /// stop calling this).
    pub fn main_loop(&self) {
        loop {
            self.wait_for_response(Duration::from_secs(1));
        }
    }
}
