use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use log::debug;

use crate::error::{Error, Result};
use crate::mailbox::{Command, MailboxSender};
use crate::pipe::Blob;
use crate::reactor::Reactor;
use crate::socket::{Socket, SocketType};

// Option snapshot a binder leaves in the endpoint registry; the
// connector reads it to size the pipe pair and fabricate identity
// frames
#[derive(Clone)]
pub(crate) struct PeerOpts {
    pub sndhwm: u32,
    pub rcvhwm: u32,
    pub identity: Blob,
    pub recv_identity: bool,
    pub conflate: bool,
}

#[derive(Clone)]
pub(crate) struct EndpointRecord {
    pub mailbox: MailboxSender,
    pub opts: PeerOpts,
}

pub(crate) struct CtxShared {
    endpoints: Mutex<HashMap<String, EndpointRecord>>,
    sockets: Mutex<HashMap<u64, MailboxSender>>,
    terminating: AtomicBool,
    started: AtomicBool,
    next_token: AtomicU64,
    opts: Mutex<CtxOpts>,
    reactors: Mutex<Vec<Reactor>>,
}

struct CtxOpts {
    io_threads: usize,
    max_sockets: usize,
}

impl CtxShared {
    pub fn register_endpoint(
        &self,
        name: String,
        mailbox: MailboxSender,
        opts: PeerOpts,
    ) -> Result<()> {
        let mut endpoints = self.endpoints.lock().unwrap();
        if endpoints.contains_key(&name) {
            return Err(Error::AddrInUse);
        }
        endpoints.insert(name, EndpointRecord { mailbox, opts });
        Ok(())
    }

    pub fn unregister_endpoint(&self, name: &str) {
        self.endpoints.lock().unwrap().remove(name);
    }

    pub fn find_endpoint(&self, name: &str) -> Option<EndpointRecord> {
        self.endpoints.lock().unwrap().get(name).cloned()
    }

    pub fn socket_closed(&self, token: u64) {
        self.sockets.lock().unwrap().remove(&token);
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }
}

/// The library context: socket factory and process-wide state
///
/// A context owns the inproc endpoint registry, the socket slots and
/// the pool of I/O reactor threads that wire transports run on.
/// Sockets stay tied to the context that created them but are
/// otherwise independent values that can move between threads.
///
/// Termination is two-phase: [`Ctx::shutdown`] wakes every socket and
/// makes further blocking calls fail with [`Error::Term`], without
/// waiting for anything; [`Ctx::term`] additionally stops the reactor
/// threads.  Dropping the context performs `term` best-effort.
pub struct Ctx {
    shared: Arc<CtxShared>,
}

impl Ctx {
    /// Create a context with default options (one I/O thread, at most
    /// 1024 sockets)
    pub fn new() -> Ctx {
        Ctx {
            shared: Arc::new(CtxShared {
                endpoints: Mutex::new(HashMap::new()),
                sockets: Mutex::new(HashMap::new()),
                terminating: AtomicBool::new(false),
                started: AtomicBool::new(false),
                next_token: AtomicU64::new(0),
                opts: Mutex::new(CtxOpts {
                    io_threads: 1,
                    max_sockets: 1024,
                }),
                reactors: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Size of the reactor thread pool.  May be zero for a purely
    /// inproc process.  Only settable before the first socket is
    /// created.
    pub fn set_io_threads(&self, n: usize) -> Result<()> {
        if self.shared.started.load(Ordering::SeqCst) {
            return Err(Error::InvalidInput("io_threads is fixed once sockets exist"));
        }
        self.shared.opts.lock().unwrap().io_threads = n;
        Ok(())
    }

    pub fn io_threads(&self) -> usize {
        self.shared.opts.lock().unwrap().io_threads
    }

    /// Cap on concurrently open sockets
    pub fn set_max_sockets(&self, n: usize) {
        self.shared.opts.lock().unwrap().max_sockets = n;
    }

    pub fn max_sockets(&self) -> usize {
        self.shared.opts.lock().unwrap().max_sockets
    }

    /// Create a socket of the given pattern
    pub fn socket(&self, type_: SocketType) -> Result<Socket> {
        if self.shared.is_terminating() {
            return Err(Error::Term);
        }
        self.start_reactors()?;

        let token = self.shared.next_token.fetch_add(1, Ordering::SeqCst);
        let socket = Socket::new(self.shared.clone(), type_, token)?;
        {
            let mut sockets = self.shared.sockets.lock().unwrap();
            if sockets.len() >= self.shared.opts.lock().unwrap().max_sockets {
                return Err(Error::SocketLimit);
            }
            sockets.insert(token, socket.mailbox_sender());
        }
        debug!("created {:?} socket", type_);
        Ok(socket)
    }

    /// Begin termination: all sockets wake and their blocking calls
    /// fail with [`Error::Term`] from now on.  Does not wait.
    pub fn shutdown(&self) {
        if self.shared.terminating.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("context shutting down");
        for sender in self.shared.sockets.lock().unwrap().values() {
            sender.post(Command::Stop);
        }
    }

    /// Shut down and stop the reactor threads
    pub fn term(&self) {
        self.shutdown();
        let mut reactors = self.shared.reactors.lock().unwrap();
        for reactor in reactors.iter_mut() {
            reactor.stop();
        }
        reactors.clear();
    }

    // The reactor pool spins up when the first socket appears, so
    // io_threads can still be configured before that
    fn start_reactors(&self) -> Result<()> {
        if self.shared.started.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let n = self.shared.opts.lock().unwrap().io_threads;
        let mut reactors = self.shared.reactors.lock().unwrap();
        for _ in 0..n {
            let mut reactor = Reactor::new()?;
            reactor.start();
            reactors.push(reactor);
        }
        debug!("started {} reactor thread(s)", n);
        Ok(())
    }
}

impl Default for Ctx {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        self.term();
    }
}
