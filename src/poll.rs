use std::ops::BitOr;
use std::os::unix::io::RawFd;
use std::time::{Duration, Instant};

use crate::error::{Error, Result};
use crate::socket::Socket;

/// Readiness flags for [`poll`] and [`Socket::events`]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub struct PollFlags(u8);

impl PollFlags {
    pub const NONE: PollFlags = PollFlags(0);
    /// A message can be received without blocking
    pub const IN: PollFlags = PollFlags(1);
    /// A message can be sent without blocking
    pub const OUT: PollFlags = PollFlags(2);
    /// Error condition on a raw file descriptor
    pub const ERR: PollFlags = PollFlags(4);

    #[inline]
    pub fn contains(self, other: PollFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for PollFlags {
    type Output = PollFlags;
    #[inline]
    fn bitor(self, rhs: PollFlags) -> PollFlags {
        PollFlags(self.0 | rhs.0)
    }
}

enum Target<'a> {
    Socket(&'a mut Socket),
    Fd(RawFd),
}

/// One entry in a [`poll`] set: a socket or a raw file descriptor
/// plus the events of interest
pub struct PollItem<'a> {
    target: Target<'a>,
    events: PollFlags,
    revents: PollFlags,
}

impl<'a> PollItem<'a> {
    /// Watch a socket for the given readiness
    pub fn socket(socket: &'a mut Socket, events: PollFlags) -> PollItem<'a> {
        PollItem {
            target: Target::Socket(socket),
            events,
            revents: PollFlags::NONE,
        }
    }

    /// Watch a raw file descriptor
    pub fn fd(fd: RawFd, events: PollFlags) -> PollItem<'a> {
        PollItem {
            target: Target::Fd(fd),
            events,
            revents: PollFlags::NONE,
        }
    }

    /// Events that were ready when the last [`poll`] returned
    #[inline]
    pub fn revents(&self) -> PollFlags {
        self.revents
    }

    /// Shorthand for `revents().contains(PollFlags::IN)`
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.revents.contains(PollFlags::IN)
    }

    /// Shorthand for `revents().contains(PollFlags::OUT)`
    #[inline]
    pub fn is_writable(&self) -> bool {
        self.revents.contains(PollFlags::OUT)
    }
}

/// Wait until any item in the set is ready, or the timeout passes
///
/// Returns the number of ready items; their [`PollItem::revents`] are
/// filled in.  A negative timeout waits indefinitely, zero checks
/// once and returns.
///
/// Socket items contribute their wakeup descriptor to the underlying
/// `poll(2)` call, and actual readiness is re-read from
/// [`Socket::events`] after every wake — the descriptor becoming
/// readable is only a hint, so edge noise never reports a socket as
/// ready when it is not.
pub fn poll(items: &mut [PollItem<'_>], timeout_ms: i64) -> Result<usize> {
    if items.is_empty() {
        if timeout_ms > 0 {
            std::thread::sleep(Duration::from_millis(timeout_ms as u64));
        }
        return Ok(0);
    }

    let mut pollfds: Vec<libc::pollfd> = items
        .iter()
        .map(|item| match &item.target {
            // Sockets are watched through their mailbox fd; any
            // interest maps to POLLIN on it
            Target::Socket(s) => libc::pollfd {
                fd: s.fd(),
                events: if item.events.is_empty() { 0 } else { libc::POLLIN },
                revents: 0,
            },
            Target::Fd(fd) => libc::pollfd {
                fd: *fd,
                events: (if item.events.contains(PollFlags::IN) {
                    libc::POLLIN
                } else {
                    0
                }) | (if item.events.contains(PollFlags::OUT) {
                    libc::POLLOUT
                } else {
                    0
                }),
                revents: 0,
            },
        })
        .collect();

    let mut first_pass = true;
    let mut nevents = 0usize;
    let mut deadline: Option<Instant> = None;

    loop {
        // The first pass never sleeps: pending readiness must be
        // reported without touching the clock
        let timeout: i64 = if first_pass {
            0
        } else if timeout_ms < 0 {
            -1
        } else {
            let left = deadline
                .expect("deadline set after first pass")
                .saturating_duration_since(Instant::now());
            left.as_millis() as i64
        };

        let rc = unsafe {
            libc::poll(
                pollfds.as_mut_ptr(),
                pollfds.len() as libc::nfds_t,
                timeout.min(i32::MAX as i64) as i32,
            )
        };
        if rc == -1 {
            return Err(Error::last_os());
        }

        for (item, pfd) in items.iter_mut().zip(pollfds.iter()) {
            item.revents = PollFlags::NONE;
            match &mut item.target {
                Target::Socket(s) => {
                    // Consult the socket regardless of what poll(2)
                    // said; the fd is only a wakeup channel
                    let ready = s.events()?;
                    if item.events.contains(PollFlags::IN) && ready.contains(PollFlags::IN) {
                        item.revents = item.revents | PollFlags::IN;
                    }
                    if item.events.contains(PollFlags::OUT) && ready.contains(PollFlags::OUT) {
                        item.revents = item.revents | PollFlags::OUT;
                    }
                }
                Target::Fd(_) => {
                    if pfd.revents & libc::POLLIN != 0 {
                        item.revents = item.revents | PollFlags::IN;
                    }
                    if pfd.revents & libc::POLLOUT != 0 {
                        item.revents = item.revents | PollFlags::OUT;
                    }
                    if pfd.revents & !(libc::POLLIN | libc::POLLOUT) != 0 {
                        item.revents = item.revents | PollFlags::ERR;
                    }
                }
            }
            if !item.revents.is_empty() {
                nevents += 1;
            }
        }

        if timeout_ms == 0 || nevents > 0 {
            break;
        }

        if timeout_ms < 0 {
            first_pass = false;
            continue;
        }

        if first_pass {
            let now = Instant::now();
            deadline = Some(now + Duration::from_millis(timeout_ms as u64));
            first_pass = false;
            continue;
        }

        if Instant::now() >= deadline.expect("deadline set after first pass") {
            break;
        }
    }

    Ok(nevents)
}
