use std::collections::HashMap;
use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::ctx::{CtxShared, PeerOpts};
use crate::dealer::Dealer;
use crate::error::{Error, Result};
use crate::mailbox::{Command, Mailbox, MailboxSender};
use crate::msg::{Msg, IDENTITY, MORE};
use crate::pipe::{pipe_pair, Blob, Pipe, PipeId};
use crate::poll::PollFlags;
use crate::rep::Rep;
use crate::req::Req;
use crate::router::Router;

/// The socket patterns provided by this crate
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum SocketType {
    /// Load-balanced send, fair-queued receive, no envelope
    Dealer,
    /// Identity-prefixed routing to named peers
    Router,
    /// Strict request/reply client over DEALER
    Req,
    /// Strict request/reply service over ROUTER
    Rep,
}

/// Flags accepted by [`Socket::send`] and [`Socket::recv`]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct Flags(u8);

impl Flags {
    /// No special behavior
    pub const NONE: Flags = Flags(0);
    /// Fail with [`Error::WouldBlock`] instead of suspending
    pub const DONT_WAIT: Flags = Flags(1);
    /// This frame is not the last of its message
    pub const SEND_MORE: Flags = Flags(2);

    #[inline]
    pub fn contains(self, other: Flags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Flags;
    #[inline]
    fn bitor(self, rhs: Flags) -> Flags {
        Flags(self.0 | rhs.0)
    }
}

// Socket options shared between the base and the patterns
pub(crate) struct Options {
    pub type_: SocketType,
    pub sndhwm: u32,
    pub rcvhwm: u32,
    pub identity: Blob,
    pub linger: i32,
    pub sndtimeo: i64,
    pub rcvtimeo: i64,
    pub conflate: bool,
    // Peers must announce their identity on connect; set for the
    // ROUTER-based patterns
    pub recv_identity: bool,
}

impl Options {
    fn new(type_: SocketType) -> Self {
        Self {
            type_,
            sndhwm: 1000,
            rcvhwm: 1000,
            identity: Blob::new(),
            linger: -1,
            sndtimeo: -1,
            rcvtimeo: -1,
            conflate: false,
            recv_identity: matches!(type_, SocketType::Router | SocketType::Rep),
        }
    }
}

// State shared between the socket base and its pattern: the pipes and
// everything the pattern hooks need to reach
pub(crate) struct Core {
    pub pipes: HashMap<PipeId, Pipe>,
    pub opts: Options,
    pub mailbox: Mailbox,
    ctx: Arc<CtxShared>,
    token: u64,
    next_pipe_id: u32,
    rcvmore: bool,
    terminating: bool,
    closed: bool,
    has_hups: bool,
    bound: Vec<String>,
    connections: Vec<(String, PipeId)>,
}

impl Core {
    /// Immediately tear down a pipe end, discarding anything queued.
    /// Pattern bookkeeping is the caller's job.
    pub fn kill_pipe(&mut self, id: PipeId) {
        if let Some(mut pipe) = self.pipes.remove(&id) {
            pipe.terminate(false);
        }
        self.connections.retain(|(_, pid)| *pid != id);
    }
}

// The hooks every pattern implements; the socket base routes API
// calls and mailbox commands through these
pub(crate) trait Pattern {
    fn xattach(&mut self, core: &mut Core, id: PipeId);
    fn xsend(&mut self, core: &mut Core, msg: &mut Msg) -> Result<()>;
    fn xrecv(&mut self, core: &mut Core) -> Result<Msg>;
    fn xhas_in(&mut self, core: &mut Core) -> bool;
    fn xhas_out(&mut self, core: &mut Core) -> bool;
    fn xread_activated(&mut self, core: &mut Core, id: PipeId);
    fn xwrite_activated(&mut self, core: &mut Core, id: PipeId);
    fn xpipe_terminated(&mut self, core: &mut Core, id: PipeId);
}

enum PatternKind {
    Dealer(Dealer),
    Router(Router),
    Req(Req),
    Rep(Rep),
}

impl PatternKind {
    fn as_pattern(&mut self) -> &mut dyn Pattern {
        match self {
            PatternKind::Dealer(p) => p,
            PatternKind::Router(p) => p,
            PatternKind::Req(p) => p,
            PatternKind::Rep(p) => p,
        }
    }
}

/// A messaging socket
///
/// A socket is a logical endpoint: it may be bound to several inproc
/// names and connected to many peers at once, with one bidirectional
/// pipe per peer.  Which peers a message goes to, and in what order
/// incoming messages surface, is decided by the socket's pattern
/// ([`SocketType`]).
///
/// A socket is owned by one thread at a time.  It is `Send` but not
/// `Sync`: hand it to another thread whole, never share it.
///
/// Blocking happens only in [`Socket::send`], [`Socket::recv`] and
/// [`poll`](crate::poll()); everything underneath is non-blocking and
/// reports refusals as [`Error::WouldBlock`].
pub struct Socket {
    core: Core,
    pattern: PatternKind,
}

impl Socket {
    pub(crate) fn new(ctx: Arc<CtxShared>, type_: SocketType, token: u64) -> Result<Socket> {
        let pattern = match type_ {
            SocketType::Dealer => PatternKind::Dealer(Dealer::new()),
            SocketType::Router => PatternKind::Router(Router::new()),
            SocketType::Req => PatternKind::Req(Req::new()),
            SocketType::Rep => PatternKind::Rep(Rep::new()),
        };
        Ok(Socket {
            core: Core {
                pipes: HashMap::new(),
                opts: Options::new(type_),
                mailbox: Mailbox::new()?,
                ctx,
                token,
                next_pipe_id: 0,
                rcvmore: false,
                terminating: false,
                closed: false,
                has_hups: false,
                bound: Vec::new(),
                connections: Vec::new(),
            },
            pattern,
        })
    }

    pub(crate) fn mailbox_sender(&self) -> MailboxSender {
        self.core.mailbox.sender()
    }

    /// The pattern this socket speaks
    #[inline]
    pub fn socket_type(&self) -> SocketType {
        self.core.opts.type_
    }

    /// Whether the last received frame had more frames following it
    /// in the same message
    #[inline]
    pub fn rcvmore(&self) -> bool {
        self.core.rcvmore
    }

    /// File descriptor that becomes readable when the socket needs
    /// attention.  Edge-like: after waking, consult
    /// [`Socket::events`] to learn actual readiness.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.core.mailbox.fd()
    }

    /// Current readiness: would a `recv` or a `send` succeed without
    /// blocking right now?
    pub fn events(&mut self) -> Result<PollFlags> {
        self.check_open()?;
        self.process_commands()?;
        let mut flags = PollFlags::NONE;
        if self.pattern.as_pattern().xhas_out(&mut self.core) {
            flags = flags | PollFlags::OUT;
        }
        if self.pattern.as_pattern().xhas_in(&mut self.core) {
            flags = flags | PollFlags::IN;
        }
        Ok(flags)
    }

    /// Register an inproc endpoint name for peers to connect to
    pub fn bind(&mut self, endpoint: &str) -> Result<()> {
        self.check_open()?;
        self.process_commands()?;
        let name = parse_inproc(endpoint)?;
        let peer_opts = self.snapshot_opts();
        self.core
            .ctx
            .register_endpoint(name, self.core.mailbox.sender(), peer_opts)?;
        self.core.bound.push(endpoint.to_string());
        debug!("socket bound to {}", endpoint);
        Ok(())
    }

    /// Connect to a bound inproc endpoint, creating the per-peer pipe
    /// pair.  Fails with [`Error::ConnectionRefused`] if nothing is
    /// bound to the name yet.
    pub fn connect(&mut self, endpoint: &str) -> Result<()> {
        self.check_open()?;
        self.process_commands()?;
        let name = parse_inproc(endpoint)?;
        let peer = self
            .core
            .ctx
            .find_endpoint(&name)
            .ok_or(Error::ConnectionRefused)?;

        let hwm_out = combine_hwm(self.core.opts.sndhwm, peer.opts.rcvhwm);
        let hwm_in = combine_hwm(peer.opts.sndhwm, self.core.opts.rcvhwm);
        let conflate = self.core.opts.conflate || peer.opts.conflate;
        let (mut local, mut remote) = pipe_pair(hwm_out, hwm_in, conflate);

        // Connection-time identity exchange: each side that expects a
        // peer identity gets one as the first frame in its pipe, here
        // fabricated from the option snapshots since neither session
        // ever touches the wire
        if peer.opts.recv_identity {
            let mut id = Msg::from(self.core.opts.identity.clone());
            id.set_flags(IDENTITY);
            local.write(&mut id);
            local.flush();
        }
        if self.core.opts.recv_identity {
            let mut id = Msg::from(peer.opts.identity.clone());
            id.set_flags(IDENTITY);
            remote.write(&mut id);
            remote.flush();
        }

        let id = self.attach_pipe(local);
        self.core.connections.push((endpoint.to_string(), id));
        peer.mailbox.post(Command::Attach(remote));
        debug!("socket connected to {}", endpoint);
        Ok(())
    }

    /// Remove a previously bound endpoint name
    pub fn unbind(&mut self, endpoint: &str) -> Result<()> {
        self.check_open()?;
        let pos = self
            .core
            .bound
            .iter()
            .position(|e| e == endpoint)
            .ok_or(Error::InvalidInput("endpoint not bound"))?;
        self.core.bound.remove(pos);
        let name = parse_inproc(endpoint)?;
        self.core.ctx.unregister_endpoint(&name);
        Ok(())
    }

    /// Tear down the connection(s) made to an endpoint
    pub fn disconnect(&mut self, endpoint: &str) -> Result<()> {
        self.check_open()?;
        let ids: Vec<PipeId> = self
            .core
            .connections
            .iter()
            .filter(|(e, _)| e == endpoint)
            .map(|(_, id)| *id)
            .collect();
        if ids.is_empty() {
            return Err(Error::InvalidInput("endpoint not connected"));
        }
        let defer = self.core.opts.linger != 0;
        for id in ids {
            if let Some(mut pipe) = self.core.pipes.remove(&id) {
                pipe.terminate(defer);
            }
            self.pattern.as_pattern().xpipe_terminated(&mut self.core, id);
        }
        self.core.connections.retain(|(e, _)| e != endpoint);
        Ok(())
    }

    /// Send one frame.  [`Flags::SEND_MORE`] marks it as non-final;
    /// [`Flags::DONT_WAIT`] returns [`Error::WouldBlock`] instead of
    /// suspending when no pipe can take it.
    pub fn send(&mut self, msg: Msg, flags: Flags) -> Result<()> {
        self.check_open()?;
        self.process_commands()?;
        let mut msg = msg;
        if flags.contains(Flags::SEND_MORE) {
            msg.set_flags(MORE);
        }
        let deadline = deadline_of(self.core.opts.sndtimeo);
        loop {
            match self.pattern.as_pattern().xsend(&mut self.core, &mut msg) {
                Ok(()) => return Ok(()),
                Err(Error::WouldBlock) => (),
                Err(e) => return Err(e),
            }
            self.park(flags, self.core.opts.sndtimeo, deadline)?;
        }
    }

    /// Convenience wrapper building the frame from a byte slice
    pub fn send_bytes(&mut self, data: &[u8], flags: Flags) -> Result<()> {
        self.send(Msg::from_bytes(data), flags)
    }

    /// Receive one frame.  After it returns, [`Socket::rcvmore`]
    /// tells whether more frames of the same message follow.
    pub fn recv(&mut self, flags: Flags) -> Result<Msg> {
        self.check_open()?;
        self.process_commands()?;
        let deadline = deadline_of(self.core.opts.rcvtimeo);
        loop {
            match self.pattern.as_pattern().xrecv(&mut self.core) {
                Ok(msg) => {
                    self.core.rcvmore = msg.more();
                    self.reap_hups();
                    return Ok(msg);
                }
                Err(Error::WouldBlock) => (),
                Err(e) => return Err(e),
            }
            self.park(flags, self.core.opts.rcvtimeo, deadline)?;
        }
    }

    /// Close the socket: peers are notified and may drain what was
    /// already flushed to them, bound names are released, the context
    /// slot is freed.  Called automatically on drop.
    pub fn close(&mut self) {
        if self.core.closed {
            return;
        }
        self.core.closed = true;
        let defer = self.core.opts.linger != 0;
        for (_, mut pipe) in self.core.pipes.drain() {
            pipe.terminate(defer);
        }
        for endpoint in std::mem::take(&mut self.core.bound) {
            if let Ok(name) = parse_inproc(&endpoint) {
                self.core.ctx.unregister_endpoint(&name);
            }
        }
        self.core.ctx.socket_closed(self.core.token);
        debug!("socket closed");
    }

    // ---- option setters / getters --------------------------------

    pub fn set_sndhwm(&mut self, hwm: u32) {
        self.core.opts.sndhwm = hwm;
    }

    pub fn sndhwm(&self) -> u32 {
        self.core.opts.sndhwm
    }

    pub fn set_rcvhwm(&mut self, hwm: u32) {
        self.core.opts.rcvhwm = hwm;
    }

    pub fn rcvhwm(&self) -> u32 {
        self.core.opts.rcvhwm
    }

    /// Identity announced to ROUTER peers on connect.  Must be 1-255
    /// bytes and must not start with a zero byte, which is reserved
    /// for synthesized identities.
    pub fn set_identity(&mut self, identity: &[u8]) -> Result<()> {
        if identity.is_empty() || identity.len() > 255 || identity[0] == 0 {
            return Err(Error::InvalidInput("identity must be 1-255 bytes, not NUL-led"));
        }
        self.core.opts.identity = identity.to_vec();
        Ok(())
    }

    pub fn identity(&self) -> &[u8] {
        &self.core.opts.identity
    }

    pub fn set_linger(&mut self, linger: i32) {
        self.core.opts.linger = linger;
    }

    /// Send timeout in milliseconds: -1 blocks forever, 0 never
    /// blocks, > 0 gives up with [`Error::WouldBlock`] after that long
    pub fn set_sndtimeo(&mut self, timeout_ms: i64) {
        self.core.opts.sndtimeo = timeout_ms;
    }

    /// Receive timeout; same convention as [`Socket::set_sndtimeo`]
    pub fn set_rcvtimeo(&mut self, timeout_ms: i64) {
        self.core.opts.rcvtimeo = timeout_ms;
    }

    /// Keep only the most recent message on each pipe (lossy).  Only
    /// meaningful for patterns without envelopes; DEALER here.
    pub fn set_conflate(&mut self, conflate: bool) -> Result<()> {
        if self.core.opts.type_ != SocketType::Dealer {
            return Err(Error::Unsupported);
        }
        self.core.opts.conflate = conflate;
        Ok(())
    }

    /// Announce this socket to ROUTER peers with an empty probe frame
    /// as soon as a connection comes up
    pub fn set_probe_router(&mut self, probe: bool) -> Result<()> {
        match &mut self.pattern {
            PatternKind::Dealer(d) => d.probe_router = probe,
            PatternKind::Router(r) => r.probe_router = probe,
            PatternKind::Req(q) => q.dealer.probe_router = probe,
            PatternKind::Rep(_) => return Err(Error::Unsupported),
        }
        Ok(())
    }

    /// Fail sends to unknown or congested identities instead of
    /// silently dropping them
    pub fn set_router_mandatory(&mut self, mandatory: bool) -> Result<()> {
        match &mut self.pattern {
            PatternKind::Router(r) => r.mandatory = mandatory,
            PatternKind::Rep(p) => p.router.mandatory = mandatory,
            _ => return Err(Error::Unsupported),
        }
        Ok(())
    }

    /// Raw mode: identities are always synthesized, no identity
    /// exchange is expected from peers, and a zero-length frame sent
    /// to a peer closes that peer's pipe
    pub fn set_router_raw(&mut self, raw: bool) -> Result<()> {
        match &mut self.pattern {
            PatternKind::Router(r) => {
                r.raw_sock = raw;
                if raw {
                    self.core.opts.recv_identity = false;
                }
            }
            _ => return Err(Error::Unsupported),
        }
        Ok(())
    }

    /// Relaxed REQ: a new request may be sent without waiting for the
    /// reply to the previous one (the old request is abandoned)
    pub fn set_req_relaxed(&mut self, relaxed: bool) -> Result<()> {
        match &mut self.pattern {
            PatternKind::Req(q) => q.strict = !relaxed,
            _ => return Err(Error::Unsupported),
        }
        Ok(())
    }

    /// Prefix requests with a correlation id frame and drop replies
    /// that do not echo the current id
    pub fn set_req_correlate(&mut self, correlate: bool) -> Result<()> {
        match &mut self.pattern {
            PatternKind::Req(q) => q.request_id_frames_enabled = correlate,
            _ => return Err(Error::Unsupported),
        }
        Ok(())
    }

    // ---- internals -----------------------------------------------

    fn check_open(&self) -> Result<()> {
        if self.core.closed {
            Err(Error::InvalidSocket)
        } else {
            Ok(())
        }
    }

    fn snapshot_opts(&self) -> PeerOpts {
        PeerOpts {
            sndhwm: self.core.opts.sndhwm,
            rcvhwm: self.core.opts.rcvhwm,
            identity: self.core.opts.identity.clone(),
            recv_identity: self.core.opts.recv_identity,
            conflate: self.core.opts.conflate,
        }
    }

    fn attach_pipe(&mut self, pipe: Pipe) -> PipeId {
        let id = PipeId(self.core.next_pipe_id);
        self.core.next_pipe_id += 1;
        pipe.register(self.core.mailbox.sender(), id);
        self.core.pipes.insert(id, pipe);
        trace!("pipe {:?} attached", id);
        self.pattern.as_pattern().xattach(&mut self.core, id);
        id
    }

    // Drain the mailbox, applying peer activations and hangups
    fn process_commands(&mut self) -> Result<()> {
        self.core.mailbox.drain_signal();
        while let Some(cmd) = self.core.mailbox.try_recv() {
            match cmd {
                Command::Attach(pipe) => {
                    self.attach_pipe(pipe);
                }
                Command::ActivateRead(id) => {
                    if self.core.pipes.contains_key(&id) {
                        self.pattern.as_pattern().xread_activated(&mut self.core, id);
                    }
                }
                Command::ActivateWrite(id) => {
                    if self.core.pipes.contains_key(&id) {
                        self.pattern.as_pattern().xwrite_activated(&mut self.core, id);
                    }
                }
                Command::Hup(id) => self.handle_hup(id),
                Command::Stop => self.core.terminating = true,
            }
        }
        self.reap_hups();
        if self.core.terminating || self.core.ctx.is_terminating() {
            return Err(Error::Term);
        }
        Ok(())
    }

    // A peer hung up: terminate now if its backlog is gone, otherwise
    // keep the pipe readable until it drains
    fn handle_hup(&mut self, id: PipeId) {
        let Some(pipe) = self.core.pipes.get_mut(&id) else {
            return;
        };
        if pipe.in_queue_empty() {
            self.pattern.as_pattern().xpipe_terminated(&mut self.core, id);
            self.core.pipes.remove(&id);
            self.core.connections.retain(|(_, pid)| *pid != id);
        } else {
            pipe.set_hup_pending();
            self.core.has_hups = true;
        }
    }

    fn reap_hups(&mut self) {
        if !self.core.has_hups {
            return;
        }
        let drained: Vec<PipeId> = self
            .core
            .pipes
            .iter()
            .filter(|(_, p)| p.hup_pending() && p.in_queue_empty())
            .map(|(id, _)| *id)
            .collect();
        for id in drained {
            self.pattern.as_pattern().xpipe_terminated(&mut self.core, id);
            self.core.pipes.remove(&id);
            self.core.connections.retain(|(_, pid)| *pid != id);
        }
        self.core.has_hups = self.core.pipes.values().any(|p| p.hup_pending());
    }

    // Suspend until a command arrives or the operation's deadline
    // passes, then reprocess commands
    fn park(&mut self, flags: Flags, timeout: i64, deadline: Option<Instant>) -> Result<()> {
        if flags.contains(Flags::DONT_WAIT) || timeout == 0 {
            return Err(Error::WouldBlock);
        }
        let wait_ms = match deadline {
            Some(d) => {
                let left = d.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(Error::WouldBlock);
                }
                left.as_millis().max(1) as i64
            }
            None => -1,
        };
        self.core.mailbox.wait(wait_ms)?;
        self.process_commands()
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn deadline_of(timeout_ms: i64) -> Option<Instant> {
    if timeout_ms > 0 {
        Some(Instant::now() + Duration::from_millis(timeout_ms as u64))
    } else {
        None
    }
}

fn combine_hwm(snd: u32, rcv: u32) -> u64 {
    if snd == 0 || rcv == 0 {
        0
    } else {
        snd as u64 + rcv as u64
    }
}

fn parse_inproc(endpoint: &str) -> Result<String> {
    let Some((scheme, name)) = endpoint.split_once("://") else {
        return Err(Error::InvalidInput("endpoint must be <scheme>://<address>"));
    };
    match scheme {
        "inproc" => {
            if name.is_empty() {
                Err(Error::InvalidInput("empty inproc name"))
            } else {
                Ok(name.to_string())
            }
        }
        // Wire transports plug in externally; the core only routes
        // between sockets in one process
        "tcp" | "ipc" | "pgm" | "epgm" => Err(Error::Unsupported),
        _ => Err(Error::InvalidInput("unknown endpoint scheme")),
    }
}
