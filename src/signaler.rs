use std::os::unix::io::RawFd;

use crate::error::{Error, Result};

/// Cross-thread wakeup primitive backed by a real file descriptor
///
/// Every socket mailbox owns one of these.  The read end is what a
/// socket's `fd()` exposes, so callers can feed it to `poll(2)` — or
/// to this crate's [`poll`](crate::poll()) — and be woken when a
/// command arrives.  The wakeup is edge-like: a reader that wakes must
/// re-check actual readiness, because the signal only means "something
/// changed since you last looked".
///
/// On Linux this is an eventfd; elsewhere a non-blocking pipe pair.
pub struct Signaler {
    r: RawFd,
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    w: RawFd,
}

impl Signaler {
    pub fn new() -> Result<Self> {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        {
            let fd = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
            if fd == -1 {
                return Err(Error::last_os());
            }
            Ok(Self { r: fd })
        }
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        {
            let mut fds = [0 as RawFd; 2];
            let rc = unsafe { libc::pipe(fds.as_mut_ptr()) };
            if rc == -1 {
                return Err(Error::last_os());
            }
            for fd in fds {
                unsafe {
                    libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK);
                    libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC);
                }
            }
            Ok(Self { r: fds[0], w: fds[1] })
        }
    }

    /// File descriptor that becomes readable when signaled
    #[inline(always)]
    pub fn fd(&self) -> RawFd {
        self.r
    }

    /// Post a wakeup.  Safe from any thread; coalesces with wakeups
    /// not yet consumed.
    pub fn send(&self) {
        #[cfg(any(target_os = "linux", target_os = "android"))]
        let (fd, buf) = (self.r, 1u64.to_ne_bytes());
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        let (fd, buf) = (self.w, [1u8]);

        loop {
            let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
            if n >= 0 {
                return;
            }
            let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
            // A full pipe still wakes the reader; nothing to do
            if err == libc::EAGAIN || err == libc::EWOULDBLOCK {
                return;
            }
            if err != libc::EINTR {
                return;
            }
        }
    }

    /// Consume all pending wakeups so the fd goes quiet again
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.r, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n < 0 {
                let err = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
                if err == libc::EINTR {
                    continue;
                }
            }
            // eventfd returns everything in one read; for a pipe keep
            // reading until it runs dry
            #[cfg(any(target_os = "linux", target_os = "android"))]
            return;
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            if n < buf.len() as isize {
                return;
            }
        }
    }

    /// Block until signaled or until `timeout_ms` elapses.  A negative
    /// timeout waits indefinitely.  Returns `true` if signaled.
    pub fn wait(&self, timeout_ms: i64) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.r,
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout = if timeout_ms < 0 {
            -1
        } else {
            timeout_ms.min(i32::MAX as i64) as i32
        };
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if rc == -1 {
            return Err(Error::last_os());
        }
        Ok(rc > 0)
    }
}

impl Drop for Signaler {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.r);
            #[cfg(not(any(target_os = "linux", target_os = "android")))]
            libc::close(self.w);
        }
    }
}

#[cfg(test)]
mod test {
    use super::Signaler;

    #[test]
    fn send_wait_drain() {
        let s = Signaler::new().unwrap();
        assert!(!s.wait(0).unwrap());
        s.send();
        s.send();
        assert!(s.wait(100).unwrap());
        s.drain();
        assert!(!s.wait(0).unwrap());
    }

    #[test]
    fn wakes_across_threads() {
        let s = std::sync::Arc::new(Signaler::new().unwrap());
        let s2 = s.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(20));
            s2.send();
        });
        assert!(s.wait(2_000).unwrap());
        t.join().unwrap();
    }
}
