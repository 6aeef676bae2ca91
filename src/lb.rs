use std::collections::HashMap;

use crate::array::IndexedArray;
use crate::error::{Error, Result};
use crate::msg::Msg;
use crate::pipe::{Pipe, PipeId};

/// Load-balanced output over a set of pipes
///
/// The write-side mirror of [`Fq`](crate::fq::Fq): active prefix,
/// round-robin cursor, O(1) demotion of pipes that refuse a write.
/// All frames of one message go to the pipe chosen for its first
/// frame; the cursor only advances — and the pipe is only flushed —
/// when the final frame has been written.
///
/// If the chosen pipe disappears mid-message the remainder of that
/// message is consumed and dropped (`dropping`), so a fresh message
/// starts on a fresh pipe with framing intact.
pub(crate) struct Lb {
    pipes: IndexedArray<PipeId>,
    active: usize,
    current: usize,
    more: bool,
    dropping: bool,
}

impl Lb {
    pub fn new() -> Self {
        Self {
            pipes: IndexedArray::new(),
            active: 0,
            current: 0,
            more: false,
            dropping: false,
        }
    }

    pub fn attach(&mut self, id: PipeId) {
        self.pipes.push_back(id);
        self.activated(id);
    }

    pub fn activated(&mut self, id: PipeId) {
        if let Some(i) = self.pipes.index(&id) {
            self.pipes.swap(i, self.active);
            self.active += 1;
        }
    }

    pub fn pipe_terminated(&mut self, id: PipeId) {
        let Some(index) = self.pipes.index(&id) else {
            return;
        };

        // Losing the current pipe mid-message means the rest of that
        // message has nowhere to go
        if index == self.current && self.more {
            self.dropping = true;
        }

        if index < self.active {
            self.active -= 1;
            self.pipes.swap(index, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        self.pipes.erase(&id);
    }

    pub fn send(&mut self, pipes: &mut HashMap<PipeId, Pipe>, msg: &mut Msg) -> Result<()> {
        self.send_pipe(pipes, msg).map(|_| ())
    }

    /// Write one frame, returning the pipe that took it.  On success
    /// the frame is taken from `msg`; on `WouldBlock` it is left
    /// intact for the caller to retry.
    pub fn send_pipe(
        &mut self,
        pipes: &mut HashMap<PipeId, Pipe>,
        msg: &mut Msg,
    ) -> Result<Option<PipeId>> {
        // Drop the remainder of a message whose pipe disappeared; at
        // the final frame switch back to normal operation
        if self.dropping {
            self.more = msg.more();
            self.dropping = self.more;
            let _ = msg.take();
            return Ok(None);
        }

        let more = msg.more();
        let mut chosen = None;
        while self.active > 0 {
            let id = *self.pipes.get(self.current);
            let ok = pipes.get_mut(&id).map(|p| p.write(msg)).unwrap_or(false);
            if ok {
                chosen = Some(id);
                break;
            }

            // A write is only ever refused at a message boundary
            debug_assert!(!self.more);

            self.active -= 1;
            if self.current < self.active {
                self.pipes.swap(self.current, self.active);
            } else {
                self.current = 0;
            }
        }

        if self.active == 0 {
            return Err(Error::WouldBlock);
        }

        // The final frame flushes the message downstream and moves the
        // cursor on to the next active pipe
        self.more = more;
        if !self.more {
            if let Some(id) = chosen {
                if let Some(p) = pipes.get_mut(&id) {
                    p.flush();
                }
            }
            self.current = (self.current + 1) % self.active;
        }

        Ok(chosen)
    }

    pub fn has_out(&mut self, pipes: &HashMap<PipeId, Pipe>) -> bool {
        // Mid-message the rest can definitely be written
        if self.more {
            return true;
        }

        while self.active > 0 {
            let id = *self.pipes.get(self.current);
            if pipes.get(&id).map(|p| p.check_write()).unwrap_or(false) {
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
    use crate::pipe::{pipe_pair, ReadResult};

    struct Rig {
        lb: Lb,
        pipes: HashMap<PipeId, Pipe>,
        far: Vec<Pipe>,
        _mailbox: Mailbox,
    }

    fn rig(n: u32, hwm: u64) -> Rig {
        let mailbox = Mailbox::new().unwrap();
        let mut pipes = HashMap::new();
        let mut far = Vec::new();
        let mut lb = Lb::new();
        for i in 0..n {
            let (near, far_end) = pipe_pair(hwm, hwm, false);
            let id = PipeId(i);
            near.register(mailbox.sender(), id);
            pipes.insert(id, near);
            far.push(far_end);
            lb.attach(id);
        }
        Rig {
            lb,
            pipes,
            far,
            _mailbox: mailbox,
        }
    }

    fn frame(data: &[u8], more: bool) -> Msg {
        let mut m = Msg::from_bytes(data);
        if more {
            m.set_flags(MORE);
        }
        m
    }

    fn drain(far: &mut Pipe) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let ReadResult::Frame(m) = far.read() {
            out.push(m.data().to_vec());
        }
        out
    }

    #[test]
    fn round_robins_whole_messages() {
        let mut r = rig(2, 0);
        for i in 0..4u8 {
            let mut m = frame(&[i], false);
            r.lb.send(&mut r.pipes, &mut m).unwrap();
        }
        assert_eq!(drain(&mut r.far[0]), vec![vec![0], vec![2]]);
        assert_eq!(drain(&mut r.far[1]), vec![vec![1], vec![3]]);
    }

    #[test]
    fn multipart_stays_on_one_pipe() {
        let mut r = rig(2, 0);
        let mut m1 = frame(b"p1", true);
        let mut m2 = frame(b"p2", false);
        r.lb.send(&mut r.pipes, &mut m1).unwrap();
        r.lb.send(&mut r.pipes, &mut m2).unwrap();
        assert_eq!(drain(&mut r.far[0]), vec![b"p1".to_vec(), b"p2".to_vec()]);
        assert_eq!(drain(&mut r.far[1]), Vec::<Vec<u8>>::new());
    }

    #[test]
    fn full_pipe_is_demoted_transparently() {
        let mut r = rig(2, 1);
        // Fill pipe 0 to its watermark
        let mut m = frame(b"fill", false);
        assert_eq!(r.lb.send_pipe(&mut r.pipes, &mut m).unwrap(), Some(PipeId(0)));
        // Cursor now points at pipe 1; fill it too
        let mut m = frame(b"fill", false);
        assert_eq!(r.lb.send_pipe(&mut r.pipes, &mut m).unwrap(), Some(PipeId(1)));
        // Both full again at pipe 0: drain pipe 1 so only it has room;
        // the send must demote pipe 0 and land on pipe 1
        drain(&mut r.far[1]);
        let mut m = frame(b"next", false);
        assert_eq!(r.lb.send_pipe(&mut r.pipes, &mut m).unwrap(), Some(PipeId(1)));
    }

    #[test]
    fn no_active_pipes_blocks() {
        let mut r = rig(1, 1);
        let mut m = frame(b"one", false);
        r.lb.send(&mut r.pipes, &mut m).unwrap();
        let mut m = frame(b"two", false);
        assert!(matches!(
            r.lb.send(&mut r.pipes, &mut m),
            Err(Error::WouldBlock)
        ));
        // The refused frame is left with the caller
        assert_eq!(m.data(), b"two");
        assert!(!r.lb.has_out(&r.pipes));
    }

    #[test]
    fn dropping_consumes_rest_of_message() {
        let mut r = rig(1, 0);
        let mut m1 = frame(b"p1", true);
        r.lb.send(&mut r.pipes, &mut m1).unwrap();
        // The chosen pipe dies mid-message
        r.lb.pipe_terminated(PipeId(0));
        r.pipes.remove(&PipeId(0));

        let mut m2 = frame(b"p2", true);
        let mut m3 = frame(b"p3", false);
        r.lb.send(&mut r.pipes, &mut m2).unwrap();
        r.lb.send(&mut r.pipes, &mut m3).unwrap();
        assert!(!r.lb.dropping);
        // A fresh message with no pipes attached blocks
        let mut m4 = frame(b"p4", false);
        assert!(matches!(
            r.lb.send(&mut r.pipes, &mut m4),
            Err(Error::WouldBlock)
        ));
    }
}
