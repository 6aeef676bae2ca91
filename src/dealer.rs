use crate::error::Result;
use crate::fq::Fq;
use crate::lb::Lb;
use crate::msg::Msg;
use crate::pipe::PipeId;
use crate::socket::{Core, Pattern};

/// DEALER: symmetric load-balanced send and fair-queued receive
///
/// The simplest pattern — no envelope, no state machine.  Every
/// attached pipe joins both the input fair-queue and the output
/// load-balancer, and readiness changes promote pipes back into the
/// respective active sets.
pub(crate) struct Dealer {
    fq: Fq,
    lb: Lb,
    pub probe_router: bool,
}

impl Dealer {
    pub fn new() -> Self {
        Self {
            fq: Fq::new(),
            lb: Lb::new(),
            probe_router: false,
        }
    }

    // REQ layers on these to learn which pipe a request went to and
    // which pipe a reply came from
    pub fn send_pipe(&mut self, core: &mut Core, msg: &mut Msg) -> Result<Option<PipeId>> {
        self.lb.send_pipe(&mut core.pipes, msg)
    }

    pub fn recv_pipe(&mut self, core: &mut Core) -> Result<(Msg, PipeId)> {
        self.fq.recv_pipe(&mut core.pipes)
    }
}

impl Pattern for Dealer {
    fn xattach(&mut self, core: &mut Core, id: PipeId) {
        if self.probe_router {
            if let Some(pipe) = core.pipes.get_mut(&id) {
                // An empty probe tells the peer ROUTER who we are
                // before any real traffic flows
                let mut probe = Msg::new();
                pipe.write(&mut probe);
                pipe.flush();
            }
        }
        self.fq.attach(id);
        self.lb.attach(id);
    }

    fn xsend(&mut self, core: &mut Core, msg: &mut Msg) -> Result<()> {
        self.lb.send(&mut core.pipes, msg)
    }

    fn xrecv(&mut self, core: &mut Core) -> Result<Msg> {
        self.fq.recv(&mut core.pipes)
    }

    fn xhas_in(&mut self, core: &mut Core) -> bool {
        self.fq.has_in(&core.pipes)
    }

    fn xhas_out(&mut self, core: &mut Core) -> bool {
        self.lb.has_out(&core.pipes)
    }

    fn xread_activated(&mut self, _core: &mut Core, id: PipeId) {
        self.fq.activated(id);
    }

    fn xwrite_activated(&mut self, _core: &mut Core, id: PipeId) {
        self.lb.activated(id);
    }

    fn xpipe_terminated(&mut self, _core: &mut Core, id: PipeId) {
        self.fq.pipe_terminated(id);
        self.lb.pipe_terminated(id);
    }
}
