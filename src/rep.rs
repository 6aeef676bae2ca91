use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::pipe::PipeId;
use crate::router::Router;
use crate::socket::{Core, Pattern};

/// REP: strict request/reply service
///
/// The mirror of REQ, layered on ROUTER.  While a request is being
/// received, its routing prefix — every frame up to and including the
/// empty delimiter — is copied straight to the outbound side of the
/// same ROUTER, so when the application sends its reply the envelope
/// is already in place and the reply finds its way back through
/// however many hops the request took.
pub(crate) struct Rep {
    pub router: Router,
    sending_reply: bool,
    request_begins: bool,
}

impl Rep {
    pub fn new() -> Self {
        Self {
            router: Router::new(),
            sending_reply: false,
            request_begins: true,
        }
    }
}

impl Pattern for Rep {
    fn xattach(&mut self, core: &mut Core, id: PipeId) {
        self.router.xattach(core, id);
    }

    fn xsend(&mut self, core: &mut Core, msg: &mut Msg) -> Result<()> {
        // Mid-request there is nothing to reply to yet
        if !self.sending_reply {
            return Err(Error::Fsm);
        }

        let more = msg.more();
        self.router.xsend(core, msg)?;

        if !more {
            self.sending_reply = false;
        }
        Ok(())
    }

    fn xrecv(&mut self, core: &mut Core) -> Result<Msg> {
        if self.sending_reply {
            return Err(Error::Fsm);
        }

        // First copy the traceback stack to the reply pipe unchanged
        if self.request_begins {
            loop {
                let mut msg = self.router.xrecv(core)?;

                if msg.more() {
                    // The empty frame delimits the traceback stack
                    let bottom = msg.size() == 0;
                    self.router.xsend(core, &mut msg)?;
                    if bottom {
                        break;
                    }
                } else {
                    // Malformed traceback: drop whatever was already
                    // copied and start over on the next message
                    self.router.rollback(core);
                }
            }
            self.request_begins = false;
        }

        let msg = self.router.xrecv(core)?;

        if !msg.more() {
            self.sending_reply = true;
            self.request_begins = true;
        }
        Ok(msg)
    }

    fn xhas_in(&mut self, core: &mut Core) -> bool {
        if self.sending_reply {
            return false;
        }
        self.router.xhas_in(core)
    }

    fn xhas_out(&mut self, core: &mut Core) -> bool {
        if !self.sending_reply {
            return false;
        }
        self.router.xhas_out(core)
    }

    fn xread_activated(&mut self, core: &mut Core, id: PipeId) {
        self.router.xread_activated(core, id);
    }

    fn xwrite_activated(&mut self, core: &mut Core, id: PipeId) {
        self.router.xwrite_activated(core, id);
    }

    fn xpipe_terminated(&mut self, core: &mut Core, id: PipeId) {
        self.router.xpipe_terminated(core, id);
    }
}
