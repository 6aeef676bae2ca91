use byteorder::{BigEndian, ByteOrder};
use log::debug;

use crate::dealer::Dealer;
use crate::error::{Error, Result};
use crate::msg::{Msg, MORE};
use crate::pipe::PipeId;
use crate::socket::{Core, Pattern};

/// REQ: strict request/reply client
///
/// A two-state machine layered on DEALER: every request must be
/// followed by exactly one reply before the next request may be sent
/// (unless relaxed).  On the wire a request is
/// `⟨empty frame (MORE)⟩ ⟨body…⟩` — the empty bottom frame is the
/// marker a REP peer echoes back so replies can be matched up — with
/// an optional correlation-id frame in front when enabled.
///
/// The pipe the request went out on is pinned; reply frames arriving
/// on any other pipe are stale responses to abandoned requests and
/// are discarded.
pub(crate) struct Req {
    pub dealer: Dealer,
    receiving_reply: bool,
    message_begins: bool,
    reply_pipe: Option<PipeId>,
    pub request_id_frames_enabled: bool,
    request_id: u32,
    pub strict: bool,
}

impl Req {
    pub fn new() -> Self {
        Self {
            dealer: Dealer::new(),
            receiving_reply: false,
            message_begins: true,
            reply_pipe: None,
            request_id_frames_enabled: false,
            request_id: rand::random(),
            strict: true,
        }
    }

    // Read the next reply frame, discarding frames from pipes other
    // than the one the request was sent on
    fn recv_reply_pipe(&mut self, core: &mut Core) -> Result<Msg> {
        loop {
            let (msg, pipe) = self.dealer.recv_pipe(core)?;
            if self.reply_pipe.is_none() || self.reply_pipe == Some(pipe) {
                return Ok(msg);
            }
            debug!("discarding reply frame from a stale pipe");
        }
    }

    // Consume the rest of the message whose first frame was `msg`
    fn skip_message(&mut self, core: &mut Core, mut msg: Msg) -> Result<()> {
        while msg.more() {
            msg = self.recv_reply_pipe(core)?;
        }
        Ok(())
    }
}

impl Pattern for Req {
    fn xattach(&mut self, core: &mut Core, id: PipeId) {
        self.dealer.xattach(core, id);
    }

    fn xsend(&mut self, core: &mut Core, msg: &mut Msg) -> Result<()> {
        // A request is in flight: strict sockets refuse, relaxed ones
        // abandon it along with its pipe
        if self.receiving_reply {
            if self.strict {
                return Err(Error::Fsm);
            }
            if let Some(id) = self.reply_pipe.take() {
                core.kill_pipe(id);
                self.dealer.xpipe_terminated(core, id);
            }
            self.receiving_reply = false;
            self.message_begins = true;
        }

        if self.message_begins {
            self.reply_pipe = None;

            if self.request_id_frames_enabled {
                self.request_id = self.request_id.wrapping_add(1);
                let mut id_frame = Msg::with_size(4);
                BigEndian::write_u32(id_frame.data_mut(), self.request_id);
                id_frame.set_flags(MORE);
                self.reply_pipe = self.dealer.send_pipe(core, &mut id_frame)?;
            }

            let mut bottom = Msg::new();
            bottom.set_flags(MORE);
            let pipe = self.dealer.send_pipe(core, &mut bottom)?;
            if self.reply_pipe.is_none() {
                self.reply_pipe = pipe;
            }

            self.message_begins = false;

            // Eat stale replies now so an old response cannot be
            // mistaken for the answer to this request
            while let Ok(stale) = self.dealer.xrecv(core) {
                let _ = stale;
            }
        }

        let more = msg.more();
        self.dealer.xsend(core, msg)?;

        if !more {
            self.receiving_reply = true;
            self.message_begins = true;
        }
        Ok(())
    }

    fn xrecv(&mut self, core: &mut Core) -> Result<Msg> {
        if !self.receiving_reply {
            return Err(Error::Fsm);
        }

        // Skip messages until one with the right envelope turns up
        while self.message_begins {
            if self.request_id_frames_enabled {
                let msg = self.recv_reply_pipe(core)?;
                let matches = msg.more()
                    && msg.size() == 4
                    && BigEndian::read_u32(msg.data()) == self.request_id;
                if !matches {
                    debug!("skipping reply with wrong correlation id");
                    self.skip_message(core, msg)?;
                    continue;
                }
            }

            // The next frame must be the empty bottom delimiter
            let msg = self.recv_reply_pipe(core)?;
            if !msg.more() || msg.size() != 0 {
                debug!("skipping malformed reply");
                self.skip_message(core, msg)?;
                continue;
            }

            self.message_begins = false;
        }

        let msg = self.recv_reply_pipe(core)?;

        if !msg.more() {
            self.receiving_reply = false;
            self.message_begins = true;
        }
        Ok(msg)
    }

    fn xhas_in(&mut self, core: &mut Core) -> bool {
        if !self.receiving_reply {
            return false;
        }
        self.dealer.xhas_in(core)
    }

    fn xhas_out(&mut self, core: &mut Core) -> bool {
        if self.receiving_reply {
            return false;
        }
        self.dealer.xhas_out(core)
    }

    fn xread_activated(&mut self, core: &mut Core, id: PipeId) {
        self.dealer.xread_activated(core, id);
    }

    fn xwrite_activated(&mut self, core: &mut Core, id: PipeId) {
        self.dealer.xwrite_activated(core, id);
    }

    fn xpipe_terminated(&mut self, core: &mut Core, id: PipeId) {
        if self.reply_pipe == Some(id) {
            self.reply_pipe = None;
        }
        self.dealer.xpipe_terminated(core, id);
    }
}

/// State of the incoming-frame validator for a REQ session
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
enum GateState {
    Bottom,
    Body,
}

/// Wire-side envelope validator for REQ traffic
///
/// A transport session feeding frames toward a REQ socket runs each
/// one through this gate first.  Only an empty frame with the MORE
/// flag may open a message; body frames must keep MORE set until a
/// clean final frame returns the gate to its starting state.  A
/// violation yields [`Error::Fault`], on which the transport is
/// expected to drop the connection.
///
/// The core's inproc path never constructs malformed envelopes, so
/// this type exists for external transport implementations.
pub struct ReqEnvelopeGate {
    state: GateState,
}

impl ReqEnvelopeGate {
    pub fn new() -> Self {
        Self {
            state: GateState::Bottom,
        }
    }

    /// Validate one inbound frame
    pub fn push(&mut self, msg: &Msg) -> Result<()> {
        match self.state {
            GateState::Bottom => {
                if msg.flags() == MORE && msg.size() == 0 {
                    self.state = GateState::Body;
                    return Ok(());
                }
            }
            GateState::Body => {
                if msg.flags() == MORE {
                    return Ok(());
                }
                if msg.flags() == 0 {
                    self.state = GateState::Bottom;
                    return Ok(());
                }
            }
        }
        Err(Error::Fault)
    }

    /// Reset to the initial state, e.g. after a reconnect
    pub fn reset(&mut self) {
        self.state = GateState::Bottom;
    }
}

impl Default for ReqEnvelopeGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::ReqEnvelopeGate;
    use crate::error::Error;
    use crate::msg::{Msg, MORE};

    fn frame(size: usize, flags: u8) -> Msg {
        let mut m = Msg::with_size(size);
        m.set_flags(flags);
        m
    }

    #[test]
    fn accepts_well_formed_envelope() {
        let mut gate = ReqEnvelopeGate::new();
        gate.push(&frame(0, MORE)).unwrap();
        gate.push(&frame(5, MORE)).unwrap();
        gate.push(&frame(3, 0)).unwrap();
        // Back at bottom: the next message starts over
        gate.push(&frame(0, MORE)).unwrap();
    }

    #[test]
    fn rejects_nonempty_bottom() {
        let mut gate = ReqEnvelopeGate::new();
        assert_eq!(gate.push(&frame(1, MORE)), Err(Error::Fault));
    }

    #[test]
    fn rejects_missing_more_at_bottom() {
        let mut gate = ReqEnvelopeGate::new();
        assert_eq!(gate.push(&frame(0, 0)), Err(Error::Fault));
    }

    #[test]
    fn reset_recovers_from_fault() {
        let mut gate = ReqEnvelopeGate::new();
        gate.push(&frame(0, MORE)).unwrap();
        gate.push(&frame(2, MORE)).unwrap();
        gate.reset();
        gate.push(&frame(0, MORE)).unwrap();
    }
}
