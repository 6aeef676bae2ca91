use std::collections::{HashMap, HashSet};

use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::error::{Error, Result};
use crate::fq::Fq;
use crate::msg::{Msg, MORE};
use crate::pipe::{Blob, PipeId, ReadResult};
use crate::socket::{Core, Pattern};

struct Outpipe {
    id: PipeId,
    active: bool,
}

/// ROUTER: explicit routing to peers named by identity
///
/// Incoming messages surface as `⟨peer-identity⟩ ⟨frames…⟩`; outgoing
/// messages name their destination in the first frame, which is
/// consumed.  Peers announce an identity when they attach (or get a
/// synthesized one), and the identity→pipe table drives the outbound
/// side.
///
/// Delivery of the identity prefix and the first body frame has to be
/// atomic from the caller's point of view, so the first body frame is
/// prefetched and parked while the identity frame is handed out.
pub(crate) struct Router {
    fq: Fq,
    prefetched_id: Msg,
    prefetched_msg: Msg,
    prefetched: bool,
    identity_sent: bool,
    more_in: bool,
    current_out: Option<PipeId>,
    more_out: bool,
    next_peer_id: u32,
    pub mandatory: bool,
    pub raw_sock: bool,
    pub probe_router: bool,
    // Pipes that failed identification (duplicate identity), parked
    // until their next read activation
    anonymous: HashSet<PipeId>,
    outpipes: HashMap<Blob, Outpipe>,
}

impl Router {
    pub fn new() -> Self {
        Self {
            fq: Fq::new(),
            prefetched_id: Msg::new(),
            prefetched_msg: Msg::new(),
            prefetched: false,
            identity_sent: false,
            more_in: false,
            current_out: None,
            more_out: false,
            next_peer_id: rand::random(),
            mandatory: false,
            raw_sock: false,
            probe_router: false,
            anonymous: HashSet::new(),
            outpipes: HashMap::new(),
        }
    }

    /// Discard whatever has been written to the current outbound pipe
    /// since its last flush, abandoning the partial message
    pub fn rollback(&mut self, core: &mut Core) {
        if let Some(id) = self.current_out.take() {
            if let Some(pipe) = core.pipes.get_mut(&id) {
                pipe.rollback();
            }
            self.more_out = false;
        }
    }

    fn synthesize_identity(&mut self) -> Blob {
        let mut buf = vec![0u8; 5];
        BigEndian::write_u32(&mut buf[1..], self.next_peer_id);
        self.next_peer_id = self.next_peer_id.wrapping_add(1);
        buf
    }

    // Establish the peer's identity for a freshly attached or
    // re-activated pipe.  Returns false if the pipe cannot be
    // identified yet (nothing to read, or a duplicate identity).
    fn identify_peer(&mut self, core: &mut Core, id: PipeId) -> bool {
        let identity = if self.raw_sock {
            self.synthesize_identity()
        } else {
            let Some(pipe) = core.pipes.get_mut(&id) else {
                return false;
            };
            let msg = match pipe.read() {
                ReadResult::Frame(msg) => msg,
                _ => return false,
            };
            if msg.size() == 0 {
                self.synthesize_identity()
            } else {
                let identity = msg.data().to_vec();
                if self.outpipes.contains_key(&identity) {
                    debug!("dropping pipe with duplicate identity");
                    return false;
                }
                identity
            }
        };

        if let Some(pipe) = core.pipes.get_mut(&id) {
            pipe.set_identity(identity.clone());
        }
        self.outpipes.insert(identity, Outpipe { id, active: true });
        true
    }

    // Drop a raw-mode peer whose pipe was closed by a zero-length
    // frame: mirror the cleanup a terminated pipe would get
    fn drop_pipe(&mut self, core: &mut Core, id: PipeId) {
        let identity = core
            .pipes
            .get(&id)
            .map(|p| p.identity().to_vec())
            .unwrap_or_default();
        core.kill_pipe(id);
        self.outpipes.remove(&identity);
        self.fq.pipe_terminated(id);
        if self.current_out == Some(id) {
            self.current_out = None;
        }
    }
}

impl Pattern for Router {
    fn xattach(&mut self, core: &mut Core, id: PipeId) {
        if self.probe_router {
            if let Some(pipe) = core.pipes.get_mut(&id) {
                let mut probe = Msg::new();
                pipe.write(&mut probe);
                pipe.flush();
            }
        }
        if self.identify_peer(core, id) {
            self.fq.attach(id);
        } else {
            self.anonymous.insert(id);
        }
    }

    fn xsend(&mut self, core: &mut Core, msg: &mut Msg) -> Result<()> {
        // The first frame of a message is the destination identity;
        // it is consumed here, never forwarded
        if !self.more_out {
            debug_assert!(self.current_out.is_none());

            // A lone frame with no subsequent message is malformed;
            // consume it silently
            if msg.more() {
                self.more_out = true;

                match self.outpipes.get_mut(msg.data()) {
                    Some(out) => {
                        self.current_out = Some(out.id);
                        let writable = core
                            .pipes
                            .get(&out.id)
                            .map(|p| p.check_write())
                            .unwrap_or(false);
                        if !writable {
                            out.active = false;
                            self.current_out = None;
                            if self.mandatory {
                                self.more_out = false;
                                return Err(Error::WouldBlock);
                            }
                        }
                    }
                    None => {
                        if self.mandatory {
                            self.more_out = false;
                            return Err(Error::HostUnreachable);
                        }
                        debug!("dropping message for unknown identity");
                    }
                }
            }

            let _ = msg.take();
            return Ok(());
        }

        // Raw peers see plain frames, never MORE continuation
        if self.raw_sock {
            msg.reset_flags(MORE);
        }

        self.more_out = msg.more();

        if let Some(id) = self.current_out {
            // In raw mode a zero-length frame is the close request
            // for that peer
            if self.raw_sock && msg.size() == 0 {
                let _ = msg.take();
                self.drop_pipe(core, id);
                self.current_out = None;
                return Ok(());
            }

            let more = self.more_out;
            let ok = core
                .pipes
                .get_mut(&id)
                .map(|p| p.write(msg))
                .unwrap_or(false);
            if !ok {
                // The pipe filled up (or died) mid-message; the rest
                // of this message is dropped
                self.current_out = None;
                let _ = msg.take();
            } else if !more {
                if let Some(pipe) = core.pipes.get_mut(&id) {
                    pipe.flush();
                }
                self.current_out = None;
            }
        } else {
            let _ = msg.take();
        }

        Ok(())
    }

    fn xrecv(&mut self, core: &mut Core) -> Result<Msg> {
        if self.prefetched {
            let msg = if !self.identity_sent {
                self.identity_sent = true;
                self.prefetched_id.take()
            } else {
                self.prefetched = false;
                self.prefetched_msg.take()
            };
            self.more_in = msg.more();
            return Ok(msg);
        }

        let (mut msg, mut pipe) = self.fq.recv_pipe(&mut core.pipes)?;

        // Identity announcements arriving after a reconnect are not
        // application data
        while msg.is_identity() {
            let next = self.fq.recv_pipe(&mut core.pipes)?;
            msg = next.0;
            pipe = next.1;
        }

        if self.more_in {
            // Mid-message: pass the frame straight through
            self.more_in = msg.more();
            return Ok(msg);
        }

        // Start of a message: park the body frame and emit the
        // originating peer's identity first
        self.prefetched_msg = msg;
        self.prefetched = true;

        let identity = core
            .pipes
            .get(&pipe)
            .map(|p| p.identity().to_vec())
            .unwrap_or_default();
        let mut id_msg = Msg::from(identity);
        id_msg.set_flags(MORE);
        self.identity_sent = true;
        Ok(id_msg)
    }

    fn xhas_in(&mut self, core: &mut Core) -> bool {
        // Mid-message, or already prefetched: yes
        if self.more_in || self.prefetched {
            return true;
        }

        // Answering accurately requires actually reading ahead; the
        // frame is kept in the prefetch slots
        let (msg, pipe) = loop {
            match self.fq.recv_pipe(&mut core.pipes) {
                Ok((msg, pipe)) => {
                    if !msg.is_identity() {
                        break (msg, pipe);
                    }
                }
                Err(_) => return false,
            }
        };

        let identity = core
            .pipes
            .get(&pipe)
            .map(|p| p.identity().to_vec())
            .unwrap_or_default();
        self.prefetched_msg = msg;
        self.prefetched_id = Msg::from(identity);
        self.prefetched_id.set_flags(MORE);
        self.prefetched = true;
        self.identity_sent = false;
        true
    }

    fn xhas_out(&mut self, _core: &mut Core) -> bool {
        // A ROUTER is nominally always writable; only the per-frame
        // write against the routed pipe tells the truth
        true
    }

    fn xread_activated(&mut self, core: &mut Core, id: PipeId) {
        if !self.anonymous.contains(&id) {
            self.fq.activated(id);
        } else if self.identify_peer(core, id) {
            self.anonymous.remove(&id);
            self.fq.attach(id);
        }
    }

    fn xwrite_activated(&mut self, _core: &mut Core, id: PipeId) {
        for out in self.outpipes.values_mut() {
            if out.id == id {
                debug_assert!(!out.active);
                out.active = true;
                return;
            }
        }
    }

    fn xpipe_terminated(&mut self, core: &mut Core, id: PipeId) {
        if self.anonymous.remove(&id) {
            return;
        }
        let identity = core
            .pipes
            .get(&id)
            .map(|p| p.identity().to_vec())
            .unwrap_or_default();
        self.outpipes.remove(&identity);
        self.fq.pipe_terminated(id);
        if self.current_out == Some(id) {
            self.current_out = None;
        }
    }
}
