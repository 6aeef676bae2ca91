use std::collections::HashMap;

use crate::array::IndexedArray;
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::pipe::{Pipe, PipeId, ReadResult};

/// Fair-queued input over a set of pipes
///
/// The pipes are partitioned into an active prefix and an inactive
/// suffix of the array; a cursor walks the prefix round-robin.  A pipe
/// that refuses a read is demoted by swapping it past the shrunk
/// prefix boundary — O(1), and the relative round-robin order of the
/// stable pipes is untouched.  Re-activation swaps it back in.
///
/// Once the first frame of a multi-part message has been read from a
/// pipe, the cursor stays on that pipe until the final frame is
/// delivered, regardless of readiness elsewhere.  A mid-message read
/// can never be refused: flushes publish whole messages at once.
pub(crate) struct Fq {
    pipes: IndexedArray<PipeId>,
    active: usize,
    current: usize,
    more: bool,
}

impl Fq {
    pub fn new() -> Self {
        Self {
            pipes: IndexedArray::new(),
            active: 0,
            current: 0,
            more: false,
        }
    }

    pub fn attach(&mut self, id: PipeId) {
        self.pipes.push_back(id);
        self.activated(id);
    }

    pub fn activated(&mut self, id: PipeId) {
        // Move the pipe into the active prefix
        if let Some(i) = self.pipes.index(&id) {
            self.pipes.swap(i, self.active);
            self.active += 1;
        }
    }

    pub fn pipe_terminated(&mut self, id: PipeId) {
        let Some(index) = self.pipes.index(&id) else {
            return;
        };
        if index < self.active {
            self.active -= 1;
            self.pipes.swap(index, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        self.pipes.erase(&id);
    }

    pub fn recv(&mut self, pipes: &mut HashMap<PipeId, Pipe>) -> Result<Msg> {
        self.recv_pipe(pipes).map(|(msg, _)| msg)
    }

    pub fn recv_pipe(&mut self, pipes: &mut HashMap<PipeId, Pipe>) -> Result<(Msg, PipeId)> {
        // Round-robin over the active pipes for the next frame
        while self.active > 0 {
            let id = *self.pipes.get(self.current);
            match pipes.get_mut(&id).map(|p| p.read()) {
                Some(ReadResult::Frame(msg)) => {
                    self.more = msg.more();
                    if !self.more {
                        self.current = (self.current + 1) % self.active;
                    }
                    return Ok((msg, id));
                }
                _ => {
                    // If part of a message was already read, the rest
                    // must be immediately available
                    debug_assert!(!self.more);

                    self.active -= 1;
                    self.pipes.swap(self.current, self.active);
                    if self.current == self.active {
                        self.current = 0;
                    }
                }
            }
        }
        Err(Error::WouldBlock)
    }

    pub fn has_in(&mut self, pipes: &HashMap<PipeId, Pipe>) -> bool {
        // The rest of a partly-read message is always available
        if self.more {
            return true;
        }

        // Probing doesn't break fairness: if nothing is available the
        // cursor comes back to where it started, otherwise it lands on
        // the first pipe with something to read
        while self.active > 0 {
            let id = *self.pipes.get(self.current);
            if pipes.get(&id).map(|p| p.check_read()).unwrap_or(false) {
                return true;
            }
            self.active -= 1;
            self.pipes.swap(self.current, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        false
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mailbox::Mailbox;
    use crate::msg::MORE;
    use crate::pipe::pipe_pair;

    struct Rig {
        fq: Fq,
        pipes: HashMap<PipeId, Pipe>,
        far: Vec<Pipe>,
        _mailbox: Mailbox,
    }

    fn rig(n: u32) -> Rig {
        let mailbox = Mailbox::new().unwrap();
        let mut pipes = HashMap::new();
        let mut far = Vec::new();
        let mut fq = Fq::new();
        for i in 0..n {
            let (near, far_end) = pipe_pair(0, 0, false);
            let id = PipeId(i);
            near.register(mailbox.sender(), id);
            pipes.insert(id, near);
            far.push(far_end);
            fq.attach(id);
        }
        Rig {
            fq,
            pipes,
            far,
            _mailbox: mailbox,
        }
    }

    fn push(far: &mut Pipe, frames: &[(&[u8], bool)]) {
        for (data, more) in frames {
            let mut m = Msg::from_bytes(data);
            if *more {
                m.set_flags(MORE);
            }
            assert!(far.write(&mut m));
        }
        far.flush();
    }

    #[test]
    fn round_robin_across_pipes() {
        let mut r = rig(3);
        for (i, far) in r.far.iter_mut().enumerate() {
            push(far, &[(format!("m{}", i).as_bytes(), false)]);
        }
        // Delivered in round-robin order of the active prefix
        let a = r.fq.recv(&mut r.pipes).unwrap();
        let b = r.fq.recv(&mut r.pipes).unwrap();
        let c = r.fq.recv(&mut r.pipes).unwrap();
        let mut got = vec![a.data().to_vec(), b.data().to_vec(), c.data().to_vec()];
        got.sort();
        assert_eq!(got, vec![b"m0".to_vec(), b"m1".to_vec(), b"m2".to_vec()]);
        assert!(matches!(r.fq.recv(&mut r.pipes), Err(Error::WouldBlock)));
    }

    #[test]
    fn multipart_affinity() {
        let mut r = rig(2);
        push(&mut r.far[0], &[(b"a1", true), (b"a2", false)]);
        push(&mut r.far[1], &[(b"b1", false)]);

        let (first, first_pipe) = r.fq.recv_pipe(&mut r.pipes).unwrap();
        assert!(first.more());
        // The second frame must come from the same pipe even though
        // the other pipe is ready
        let (second, second_pipe) = r.fq.recv_pipe(&mut r.pipes).unwrap();
        assert_eq!(first_pipe, second_pipe);
        assert!(!second.more());
        assert_eq!(first.data()[0], second.data()[0]);

        let (third, third_pipe) = r.fq.recv_pipe(&mut r.pipes).unwrap();
        assert_ne!(third_pipe, first_pipe);
        assert!(!third.more());
    }

    #[test]
    fn empty_pipes_are_demoted_and_reactivated() {
        let mut r = rig(2);
        assert!(matches!(r.fq.recv(&mut r.pipes), Err(Error::WouldBlock)));
        assert_eq!(r.fq.active, 0);

        push(&mut r.far[0], &[(b"x", false)]);
        // The flush posted an activation; the socket would deliver it
        r.fq.activated(PipeId(0));
        assert_eq!(r.fq.recv(&mut r.pipes).unwrap().data(), b"x");
    }

    #[test]
    fn has_in_probes_without_losing_messages() {
        let mut r = rig(3);
        assert!(!r.fq.has_in(&r.pipes));
        push(&mut r.far[2], &[(b"z", false)]);
        r.fq.activated(PipeId(2));
        assert!(r.fq.has_in(&r.pipes));
        assert_eq!(r.fq.recv(&mut r.pipes).unwrap().data(), b"z");
    }

    #[test]
    fn termination_mid_set() {
        let mut r = rig(3);
        for far in r.far.iter_mut() {
            push(far, &[(b"m", false)]);
        }
        r.fq.pipe_terminated(PipeId(1));
        r.pipes.remove(&PipeId(1));
        assert!(r.fq.recv(&mut r.pipes).is_ok());
        assert!(r.fq.recv(&mut r.pipes).is_ok());
        assert!(matches!(r.fq.recv(&mut r.pipes), Err(Error::WouldBlock)));
    }
}
