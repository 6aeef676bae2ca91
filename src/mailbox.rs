use std::collections::VecDeque;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex};

use crate::error::Result;
use crate::pipe::{Pipe, PipeId};
use crate::signaler::Signaler;

/// Commands posted to a socket by its peers and by the context
///
/// All cross-thread coordination reaches a socket this way: pipe ends
/// post activation notices when readiness changes, the connecting
/// socket posts the far pipe end at connect time, and the context
/// posts `Stop` when it shuts down.  The owning socket drains its
/// mailbox at every public API entry.
pub(crate) enum Command {
    /// A new pipe end for this socket; attach it to the pattern
    Attach(Pipe),
    /// A previously-empty pipe has flushed messages; promote it
    ActivateRead(PipeId),
    /// A previously-full pipe has drained below the low watermark
    ActivateWrite(PipeId),
    /// The peer hung up; drain what is queued, then terminate
    Hup(PipeId),
    /// The context is terminating
    Stop,
}

struct Shared {
    q: Mutex<VecDeque<Command>>,
    signaler: Signaler,
}

/// Cloneable posting handle to a socket's mailbox
#[derive(Clone)]
pub(crate) struct MailboxSender {
    shared: Arc<Shared>,
}

impl MailboxSender {
    pub fn post(&self, cmd: Command) {
        self.shared.q.lock().unwrap().push_back(cmd);
        self.shared.signaler.send();
    }
}

/// Receiving side, owned by exactly one socket
pub(crate) struct Mailbox {
    shared: Arc<Shared>,
}

impl Mailbox {
    pub fn new() -> Result<Self> {
        Ok(Self {
            shared: Arc::new(Shared {
                q: Mutex::new(VecDeque::new()),
                signaler: Signaler::new()?,
            }),
        })
    }

    pub fn sender(&self) -> MailboxSender {
        MailboxSender {
            shared: self.shared.clone(),
        }
    }

    /// The fd that becomes readable when a command arrives.  Exposed
    /// through `Socket::fd()` for external polling.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.shared.signaler.fd()
    }

    /// Non-blocking drain of one command
    pub fn try_recv(&self) -> Option<Command> {
        self.shared.q.lock().unwrap().pop_front()
    }

    /// Clear the wakeup fd.  Called before draining the queue so a
    /// command posted in between leaves at worst a spurious wakeup,
    /// never a lost one.
    pub fn drain_signal(&self) {
        self.shared.signaler.drain();
    }

    /// Park until a command may be available or the timeout elapses.
    /// Negative timeout waits indefinitely.  Returns `true` on wakeup.
    pub fn wait(&self, timeout_ms: i64) -> Result<bool> {
        if !self.shared.q.lock().unwrap().is_empty() {
            return Ok(true);
        }
        self.shared.signaler.wait(timeout_ms)
    }
}
