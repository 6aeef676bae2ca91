use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use log::trace;

use crate::error::Result;
use crate::signaler::Signaler;

/// Callbacks invoked by a [`Reactor`] when a registered file
/// descriptor becomes ready or a timer expires
///
/// Handlers are shared with the reactor thread, so readiness state
/// they mutate needs interior synchronization (atomics in practice).
pub trait PollEvents: Send + Sync {
    /// The fd is ready for reading (or hit EOF/error)
    fn in_event(&self);

    /// The fd is ready for writing
    fn out_event(&self);

    /// A timer registered with this handler expired
    fn timer_event(&self, id: u32) {
        let _ = id;
    }
}

/// Registration handle returned by [`Reactor::add_fd`]
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct Handle(usize);

const WAKE_TOKEN: usize = usize::MAX;
const MAX_IO_EVENTS: usize = 256;

struct Entry {
    fd: RawFd,
    handler: Arc<dyn PollEvents>,
    pollin: bool,
    pollout: bool,
    retired: bool,
}

struct Timer {
    id: u32,
    handler: Arc<dyn PollEvents>,
}

struct State {
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    // Slots removed during the current dispatch iteration; freed in
    // bulk once the iteration completes so in-flight events cannot
    // reach a recycled slot
    retired: Vec<usize>,
    timers: BTreeMap<(Instant, u64), Timer>,
    timer_seq: u64,
}

struct Inner {
    selector: sys::Selector,
    state: Mutex<State>,
    stopping: AtomicBool,
    wake: Signaler,
}

/// I/O reactor: one worker thread demultiplexing fd readiness and
/// timer expirations to registered [`PollEvents`] handlers
///
/// Wraps the platform facility — epoll on Linux, kqueue on the BSDs
/// and macOS, `poll(2)` elsewhere — behind one interface.  The
/// context runs one reactor per configured I/O thread; transports
/// register their descriptors here.
///
/// Removal is deferred: [`Reactor::rm_fd`] marks the slot retired and
/// the record is only freed after the current dispatch iteration, as
/// handlers are routinely removed while their own events are being
/// processed.  A retired handler receives no further callbacks.
pub struct Reactor {
    inner: Arc<Inner>,
    worker: Option<thread::JoinHandle<()>>,
}

impl Reactor {
    pub fn new() -> Result<Reactor> {
        Ok(Reactor {
            inner: Arc::new(Inner {
                selector: sys::Selector::new()?,
                state: Mutex::new(State {
                    entries: Vec::new(),
                    free: Vec::new(),
                    retired: Vec::new(),
                    timers: BTreeMap::new(),
                    timer_seq: 0,
                }),
                stopping: AtomicBool::new(false),
                wake: Signaler::new()?,
            }),
            worker: None,
        })
    }

    /// Register a descriptor.  No events are delivered until
    /// [`Reactor::set_pollin`] / [`Reactor::set_pollout`].
    pub fn add_fd(&self, fd: RawFd, handler: Arc<dyn PollEvents>) -> Handle {
        let mut state = self.inner.state.lock().unwrap();
        let slot = state.free.pop().unwrap_or_else(|| {
            state.entries.push(None);
            state.entries.len() - 1
        });
        state.entries[slot] = Some(Entry {
            fd,
            handler,
            pollin: false,
            pollout: false,
            retired: false,
        });
        self.inner.selector.register(fd, slot);
        drop(state);
        self.inner.wake.send();
        Handle(slot)
    }

    /// Retire a registration.  The handler gets no callbacks from the
    /// point this returns; the record itself is freed at the end of
    /// the current dispatch iteration.
    pub fn rm_fd(&self, handle: Handle) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries[handle.0].as_mut() {
            self.inner
                .selector
                .deregister(entry.fd, entry.pollin, entry.pollout);
            entry.retired = true;
            entry.fd = -1;
            state.retired.push(handle.0);
        }
        drop(state);
        self.inner.wake.send();
    }

    pub fn set_pollin(&self, handle: Handle) {
        self.update(handle, |e| e.pollin = true);
    }

    pub fn reset_pollin(&self, handle: Handle) {
        self.update(handle, |e| e.pollin = false);
    }

    pub fn set_pollout(&self, handle: Handle) {
        self.update(handle, |e| e.pollout = true);
    }

    pub fn reset_pollout(&self, handle: Handle) {
        self.update(handle, |e| e.pollout = false);
    }

    fn update(&self, handle: Handle, f: impl FnOnce(&mut Entry)) {
        let mut state = self.inner.state.lock().unwrap();
        if let Some(entry) = state.entries[handle.0].as_mut() {
            if entry.retired {
                return;
            }
            let before = (entry.pollin, entry.pollout);
            f(entry);
            self.inner
                .selector
                .update(entry.fd, handle.0, before, (entry.pollin, entry.pollout));
        }
        drop(state);
        self.inner.wake.send();
    }

    /// Arm a timer; after `delay_ms` the handler's
    /// [`PollEvents::timer_event`] fires once with `id`
    pub fn add_timer(&self, delay_ms: u64, handler: Arc<dyn PollEvents>, id: u32) {
        let mut state = self.inner.state.lock().unwrap();
        let seq = state.timer_seq;
        state.timer_seq += 1;
        let deadline = Instant::now() + Duration::from_millis(delay_ms);
        state.timers.insert((deadline, seq), Timer { id, handler });
        drop(state);
        self.inner.wake.send();
    }

    /// Disarm all timers with the given id registered for this
    /// handler
    pub fn cancel_timer(&self, handler: &Arc<dyn PollEvents>, id: u32) {
        let mut state = self.inner.state.lock().unwrap();
        state
            .timers
            .retain(|_, t| !(t.id == id && Arc::ptr_eq(&t.handler, handler)));
    }

    /// Start the worker thread
    pub fn start(&mut self) {
        let inner = self.inner.clone();
        trace!("reactor starting");
        self.worker = Some(
            thread::Builder::new()
                .name("msgmux-reactor".into())
                .spawn(move || run(inner))
                .expect("failed to spawn reactor thread"),
        );
    }

    /// Stop and join the worker thread
    pub fn stop(&mut self) {
        self.inner.stopping.store(true, Ordering::SeqCst);
        self.inner.wake.send();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        trace!("reactor stopped");
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(inner: Arc<Inner>) {
    let mut events = Vec::with_capacity(MAX_IO_EVENTS);

    while !inner.stopping.load(Ordering::SeqCst) {
        let timeout = execute_timers(&inner);

        // Interest snapshot for the poll-based backend; the epoll and
        // kqueue backends track interest kernel-side and ignore it
        let interest: Vec<sys::Interest> = {
            let state = inner.state.lock().unwrap();
            let mut v: Vec<sys::Interest> = state
                .entries
                .iter()
                .enumerate()
                .filter_map(|(token, e)| {
                    e.as_ref().filter(|e| !e.retired).map(|e| sys::Interest {
                        fd: e.fd,
                        token,
                        pollin: e.pollin,
                        pollout: e.pollout,
                    })
                })
                .collect();
            v.push(sys::Interest {
                fd: inner.wake.fd(),
                token: WAKE_TOKEN,
                pollin: true,
                pollout: false,
            });
            v
        };

        events.clear();
        if inner.selector.wait(&interest, timeout, &mut events).is_err() {
            continue;
        }

        for ev in &events {
            if ev.token == WAKE_TOKEN {
                inner.wake.drain();
                continue;
            }

            // Re-check liveness before every callback: the previous
            // callback may have retired this very entry
            if ev.readable {
                if let Some(handler) = live_handler(&inner, ev.token) {
                    handler.in_event();
                }
            }
            if ev.writable {
                if let Some(handler) = live_handler(&inner, ev.token) {
                    handler.out_event();
                }
            }
        }

        // Free retired registrations in bulk
        let mut state = inner.state.lock().unwrap();
        let retired = std::mem::take(&mut state.retired);
        for slot in retired {
            state.entries[slot] = None;
            state.free.push(slot);
        }
    }
}

fn live_handler(inner: &Inner, token: usize) -> Option<Arc<dyn PollEvents>> {
    let state = inner.state.lock().unwrap();
    state
        .entries
        .get(token)?
        .as_ref()
        .filter(|e| !e.retired)
        .map(|e| e.handler.clone())
}

// Fire due timers and compute the wait for the next one (-1 = none)
fn execute_timers(inner: &Inner) -> i64 {
    let now = Instant::now();
    let due: Vec<Timer> = {
        let mut state = inner.state.lock().unwrap();
        let mut due = Vec::new();
        while let Some(entry) = state.timers.first_entry() {
            if entry.key().0 > now {
                break;
            }
            due.push(entry.remove());
        }
        due
    };
    for timer in due {
        timer.handler.timer_event(timer.id);
    }

    let state = inner.state.lock().unwrap();
    match state.timers.keys().next() {
        Some((deadline, _)) => {
            let left = deadline.saturating_duration_since(Instant::now());
            left.as_millis().max(1) as i64
        }
        None => -1,
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
mod sys {
    use super::MAX_IO_EVENTS;
    use crate::error::{Error, Result};
    use std::os::unix::io::RawFd;

    pub struct Interest {
        pub fd: RawFd,
        pub token: usize,
        pub pollin: bool,
        pub pollout: bool,
    }

    pub struct Event {
        pub token: usize,
        pub readable: bool,
        pub writable: bool,
    }

    pub struct Selector {
        epfd: RawFd,
    }

    impl Selector {
        pub fn new() -> Result<Selector> {
            let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
            if epfd == -1 {
                return Err(Error::last_os());
            }
            Ok(Selector { epfd })
        }

        fn ctl(&self, op: libc::c_int, fd: RawFd, token: usize, pollin: bool, pollout: bool) {
            let mut ev = libc::epoll_event {
                events: (if pollin { libc::EPOLLIN as u32 } else { 0 })
                    | (if pollout { libc::EPOLLOUT as u32 } else { 0 }),
                u64: token as u64,
            };
            unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        }

        pub fn register(&self, fd: RawFd, token: usize) {
            self.ctl(libc::EPOLL_CTL_ADD, fd, token, false, false);
        }

        pub fn update(&self, fd: RawFd, token: usize, _before: (bool, bool), after: (bool, bool)) {
            self.ctl(libc::EPOLL_CTL_MOD, fd, token, after.0, after.1);
        }

        pub fn deregister(&self, fd: RawFd, _pollin: bool, _pollout: bool) {
            unsafe {
                libc::epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }

        pub fn wait(
            &self,
            _interest: &[Interest],
            timeout_ms: i64,
            events: &mut Vec<Event>,
        ) -> Result<()> {
            let mut buf: [libc::epoll_event; MAX_IO_EVENTS] =
                unsafe { std::mem::zeroed() };
            let timeout = if timeout_ms < 0 {
                -1
            } else {
                timeout_ms.min(i32::MAX as i64) as i32
            };
            let n = unsafe {
                libc::epoll_wait(self.epfd, buf.as_mut_ptr(), MAX_IO_EVENTS as i32, timeout)
            };
            if n == -1 {
                return Err(Error::last_os());
            }
            for ev in buf.iter().take(n as usize) {
                let err = ev.events & (libc::EPOLLERR as u32 | libc::EPOLLHUP as u32) != 0;
                events.push(Event {
                    token: ev.u64 as usize,
                    // Errors and hangups surface as input events, the
                    // same way kqueue's EV_EOF does
                    readable: err || ev.events & libc::EPOLLIN as u32 != 0,
                    writable: ev.events & libc::EPOLLOUT as u32 != 0,
                });
            }
            Ok(())
        }
    }

    impl Drop for Selector {
        fn drop(&mut self) {
            unsafe { libc::close(self.epfd) };
        }
    }
}

#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
mod sys {
    use super::MAX_IO_EVENTS;
    use crate::error::{Error, Result};
    use std::os::unix::io::RawFd;

    pub struct Interest {
        pub fd: RawFd,
        pub token: usize,
        pub pollin: bool,
        pub pollout: bool,
    }

    pub struct Event {
        pub token: usize,
        pub readable: bool,
        pub writable: bool,
    }

    pub struct Selector {
        kq: RawFd,
    }

    impl Selector {
        pub fn new() -> Result<Selector> {
            let kq = unsafe { libc::kqueue() };
            if kq == -1 {
                return Err(Error::last_os());
            }
            Ok(Selector { kq })
        }

        fn change(&self, fd: RawFd, filter: i16, flags: u16, token: usize) {
            let ev = libc::kevent {
                ident: fd as libc::uintptr_t,
                filter,
                flags,
                fflags: 0,
                data: 0,
                udata: token as _,
            };
            unsafe {
                libc::kevent(self.kq, &ev, 1, std::ptr::null_mut(), 0, std::ptr::null());
            }
        }

        pub fn register(&self, _fd: RawFd, _token: usize) {
            // Filters are added when interest is set
        }

        pub fn update(&self, fd: RawFd, token: usize, before: (bool, bool), after: (bool, bool)) {
            if after.0 != before.0 {
                let flags = if after.0 { libc::EV_ADD } else { libc::EV_DELETE };
                self.change(fd, libc::EVFILT_READ, flags, token);
            }
            if after.1 != before.1 {
                let flags = if after.1 { libc::EV_ADD } else { libc::EV_DELETE };
                self.change(fd, libc::EVFILT_WRITE, flags, token);
            }
        }

        pub fn deregister(&self, fd: RawFd, pollin: bool, pollout: bool) {
            if pollin {
                self.change(fd, libc::EVFILT_READ, libc::EV_DELETE, 0);
            }
            if pollout {
                self.change(fd, libc::EVFILT_WRITE, libc::EV_DELETE, 0);
            }
        }

        pub fn wait(
            &self,
            _interest: &[Interest],
            timeout_ms: i64,
            events: &mut Vec<Event>,
        ) -> Result<()> {
            let mut buf: [libc::kevent; MAX_IO_EVENTS] = unsafe { std::mem::zeroed() };
            let ts = libc::timespec {
                tv_sec: (timeout_ms.max(0) / 1000) as libc::time_t,
                tv_nsec: ((timeout_ms.max(0) % 1000) * 1_000_000) as libc::c_long,
            };
            let n = unsafe {
                libc::kevent(
                    self.kq,
                    std::ptr::null(),
                    0,
                    buf.as_mut_ptr(),
                    MAX_IO_EVENTS as libc::c_int,
                    if timeout_ms < 0 { std::ptr::null() } else { &ts },
                )
            };
            if n == -1 {
                return Err(Error::last_os());
            }
            for ev in buf.iter().take(n as usize) {
                let eof = ev.flags & libc::EV_EOF != 0;
                events.push(Event {
                    token: ev.udata as usize,
                    readable: eof || ev.filter == libc::EVFILT_READ,
                    writable: ev.filter == libc::EVFILT_WRITE,
                });
            }
            Ok(())
        }
    }

    impl Drop for Selector {
        fn drop(&mut self) {
            unsafe { libc::close(self.kq) };
        }
    }
}

#[cfg(all(
    unix,
    not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios",
        target_os = "freebsd",
        target_os = "netbsd",
        target_os = "openbsd",
        target_os = "dragonfly"
    ))
))]
mod sys {
    use crate::error::{Error, Result};
    use std::os::unix::io::RawFd;

    pub struct Interest {
        pub fd: RawFd,
        pub token: usize,
        pub pollin: bool,
        pub pollout: bool,
    }

    pub struct Event {
        pub token: usize,
        pub readable: bool,
        pub writable: bool,
    }

    // Interest lives entirely in the reactor's state; every wait
    // rebuilds the pollfd set from the snapshot it is handed
    pub struct Selector;

    impl Selector {
        pub fn new() -> Result<Selector> {
            Ok(Selector)
        }

        pub fn register(&self, _fd: RawFd, _token: usize) {}

        pub fn update(&self, _fd: RawFd, _t: usize, _b: (bool, bool), _a: (bool, bool)) {}

        pub fn deregister(&self, _fd: RawFd, _pollin: bool, _pollout: bool) {}

        pub fn wait(
            &self,
            interest: &[Interest],
            timeout_ms: i64,
            events: &mut Vec<Event>,
        ) -> Result<()> {
            let mut pollfds: Vec<libc::pollfd> = interest
                .iter()
                .map(|i| libc::pollfd {
                    fd: i.fd,
                    events: (if i.pollin { libc::POLLIN } else { 0 })
                        | (if i.pollout { libc::POLLOUT } else { 0 }),
                    revents: 0,
                })
                .collect();
            let timeout = if timeout_ms < 0 {
                -1
            } else {
                timeout_ms.min(i32::MAX as i64) as i32
            };
            let n = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout) };
            if n == -1 {
                return Err(Error::last_os());
            }
            for (pfd, i) in pollfds.iter().zip(interest) {
                if pfd.revents == 0 {
                    continue;
                }
                let err = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
                events.push(Event {
                    token: i.token,
                    readable: err || pfd.revents & libc::POLLIN != 0,
                    writable: pfd.revents & libc::POLLOUT != 0,
                });
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct Counter {
        ins: AtomicUsize,
        outs: AtomicUsize,
        timers: Mutex<Vec<u32>>,
    }

    impl Counter {
        fn new() -> Arc<Counter> {
            Arc::new(Counter {
                ins: AtomicUsize::new(0),
                outs: AtomicUsize::new(0),
                timers: Mutex::new(Vec::new()),
            })
        }
    }

    impl PollEvents for Counter {
        fn in_event(&self) {
            self.ins.fetch_add(1, Ordering::SeqCst);
        }
        fn out_event(&self) {
            self.outs.fetch_add(1, Ordering::SeqCst);
        }
        fn timer_event(&self, id: u32) {
            self.timers.lock().unwrap().push(id);
        }
    }

    fn os_pipe() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    fn wait_until(cond: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "timed out waiting for reactor");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn delivers_read_events() {
        let (r, w) = os_pipe();
        let counter = Counter::new();
        let mut reactor = Reactor::new().unwrap();
        reactor.start();

        let handle = reactor.add_fd(r, counter.clone());
        reactor.set_pollin(handle);

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        wait_until(|| counter.ins.load(Ordering::SeqCst) > 0);

        reactor.rm_fd(handle);
        reactor.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn delivers_write_events() {
        let (r, w) = os_pipe();
        let counter = Counter::new();
        let mut reactor = Reactor::new().unwrap();
        reactor.start();

        // An empty pipe is immediately writable
        let handle = reactor.add_fd(w, counter.clone());
        reactor.set_pollout(handle);
        wait_until(|| counter.outs.load(Ordering::SeqCst) > 0);

        reactor.rm_fd(handle);
        reactor.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn retired_handler_gets_no_callbacks() {
        let (r, w) = os_pipe();
        let counter = Counter::new();
        let mut reactor = Reactor::new().unwrap();
        let handle = reactor.add_fd(r, counter.clone());
        reactor.set_pollin(handle);
        reactor.rm_fd(handle);
        reactor.start();

        assert_eq!(unsafe { libc::write(w, b"x".as_ptr() as *const _, 1) }, 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(counter.ins.load(Ordering::SeqCst), 0);

        reactor.stop();
        unsafe {
            libc::close(r);
            libc::close(w);
        }
    }

    #[test]
    fn timers_fire_in_order() {
        let counter = Counter::new();
        let mut reactor = Reactor::new().unwrap();
        reactor.start();

        reactor.add_timer(40, counter.clone(), 2);
        reactor.add_timer(10, counter.clone(), 1);
        wait_until(|| counter.timers.lock().unwrap().len() == 2);
        assert_eq!(*counter.timers.lock().unwrap(), vec![1, 2]);

        reactor.stop();
    }

    #[test]
    fn cancelled_timer_does_not_fire() {
        let counter = Counter::new();
        let mut reactor = Reactor::new().unwrap();
        reactor.start();

        reactor.add_timer(30, counter.clone(), 7);
        let as_events: Arc<dyn PollEvents> = counter.clone();
        reactor.cancel_timer(&as_events, 7);
        thread::sleep(Duration::from_millis(80));
        assert!(counter.timers.lock().unwrap().is_empty());

        reactor.stop();
    }
}
