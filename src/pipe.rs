use std::collections::VecDeque;
use std::sync::{Arc, Mutex, OnceLock};

use log::trace;

use crate::dbuffer::DBuffer;
use crate::mailbox::{Command, MailboxSender};
use crate::msg::Msg;

/// Peer identity blob, immutable once assigned
pub(crate) type Blob = Vec<u8>;

/// Socket-local handle to an attached pipe end
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub(crate) struct PipeId(pub u32);

/// Outcome of a read attempt on a pipe end
pub(crate) enum ReadResult {
    /// A frame was delivered
    Frame(Msg),
    /// Nothing queued right now; the reader has been marked asleep and
    /// will be re-activated when the writer next flushes
    Empty,
    /// The writer hung up and everything queued has been delivered
    Dead,
}

// One direction of the channel.  `hwm` counts whole messages, bumped
// when the final frame of a message is written, which is what makes a
// mid-message write refusal impossible.  `lwm` is where the reader
// re-activates a blocked writer.
struct Direction {
    meta: Mutex<Meta>,
    conflate: Option<DBuffer>,
    hwm: u64,
    lwm: u64,
}

struct Meta {
    queue: VecDeque<Msg>,
    msgs_written: u64,
    msgs_read: u64,
    reader_asleep: bool,
    writer_blocked: bool,
    closed: bool,
    discard: bool,
}

impl Direction {
    fn new(hwm: u64, conflate: bool) -> Self {
        Self {
            meta: Mutex::new(Meta {
                queue: VecDeque::new(),
                msgs_written: 0,
                msgs_read: 0,
                reader_asleep: false,
                writer_blocked: false,
                closed: false,
                discard: false,
            }),
            conflate: if conflate { Some(DBuffer::new()) } else { None },
            hwm,
            lwm: (hwm + 1) / 2,
        }
    }
}

struct Shared {
    // Direction written by end A and read by end B, and vice versa
    ab: Direction,
    ba: Direction,
    // Filled in when the respective end attaches to its socket; used
    // by the opposite end to post activation commands
    info_a: OnceLock<EndInfo>,
    info_b: OnceLock<EndInfo>,
}

struct EndInfo {
    mailbox: MailboxSender,
    id: PipeId,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum End {
    A,
    B,
}

/// One end of a bidirectional bounded frame channel between two
/// sockets
///
/// Writes buffer locally until [`Pipe::flush`] makes them visible to
/// the peer in one step, which is what keeps multi-part messages
/// atomic; [`Pipe::rollback`] discards everything written since the
/// last flush.  Reads pop frames the peer has flushed.  All methods
/// are called only from the owning socket's thread; the shared state
/// between the two ends is internally synchronized.
pub(crate) struct Pipe {
    shared: Arc<Shared>,
    end: End,
    unflushed: Vec<Msg>,
    identity: Blob,
    hup_pending: bool,
}

/// Create a connected pair of pipe ends.  `hwm_ab`/`hwm_ba` bound the
/// two directions in whole messages (0 = unlimited); `conflate` swaps
/// the queues for lossy single-slot double-buffers.
pub(crate) fn pipe_pair(hwm_ab: u64, hwm_ba: u64, conflate: bool) -> (Pipe, Pipe) {
    let shared = Arc::new(Shared {
        ab: Direction::new(hwm_ab, conflate),
        ba: Direction::new(hwm_ba, conflate),
        info_a: OnceLock::new(),
        info_b: OnceLock::new(),
    });
    (
        Pipe {
            shared: shared.clone(),
            end: End::A,
            unflushed: Vec::new(),
            identity: Blob::new(),
            hup_pending: false,
        },
        Pipe {
            shared,
            end: End::B,
            unflushed: Vec::new(),
            identity: Blob::new(),
            hup_pending: false,
        },
    )
}

impl Pipe {
    fn out_dir(&self) -> &Direction {
        match self.end {
            End::A => &self.shared.ab,
            End::B => &self.shared.ba,
        }
    }

    fn in_dir(&self) -> &Direction {
        match self.end {
            End::A => &self.shared.ba,
            End::B => &self.shared.ab,
        }
    }

    fn peer_info(&self) -> Option<&EndInfo> {
        match self.end {
            End::A => self.shared.info_b.get(),
            End::B => self.shared.info_a.get(),
        }
    }

    /// Record the owning socket's mailbox and the id it assigned to
    /// this end, so the peer can post activation commands.  Called
    /// once at attach.
    pub fn register(&self, mailbox: MailboxSender, id: PipeId) {
        let info = EndInfo { mailbox, id };
        let cell = match self.end {
            End::A => &self.shared.info_a,
            End::B => &self.shared.info_b,
        };
        let _ = cell.set(info);
    }

    /// Peer identity, empty until assigned
    #[inline]
    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Assign the peer identity.  Set at most once, after attach.
    pub fn set_identity(&mut self, identity: Blob) {
        debug_assert!(self.identity.is_empty());
        self.identity = identity;
    }

    /// Queue a frame for the peer.  The frame stays invisible until
    /// [`Pipe::flush`].  On success the frame is taken (left empty);
    /// on refusal — the high watermark is reached — it is left intact
    /// for the caller to retry elsewhere.
    pub fn write(&mut self, msg: &mut Msg) -> bool {
        let dir = self.out_dir();
        if let Some(db) = &dir.conflate {
            db.write(msg.take());
            return true;
        }
        let mut meta = dir.meta.lock().unwrap();
        if dir.hwm > 0 && meta.msgs_written - meta.msgs_read >= dir.hwm {
            meta.writer_blocked = true;
            return false;
        }
        if !msg.more() {
            meta.msgs_written += 1;
        }
        drop(meta);
        self.unflushed.push(msg.take());
        true
    }

    /// Would a write of a message-starting frame succeed right now?
    pub fn check_write(&self) -> bool {
        let dir = self.out_dir();
        if dir.conflate.is_some() {
            return true;
        }
        let mut meta = dir.meta.lock().unwrap();
        if dir.hwm > 0 && meta.msgs_written - meta.msgs_read >= dir.hwm {
            meta.writer_blocked = true;
            return false;
        }
        true
    }

    /// Make everything written since the last flush visible to the
    /// peer in one step, waking the peer socket if its reader went to
    /// sleep on an empty queue
    pub fn flush(&mut self) {
        // Borrow the shared state and the local buffer separately so
        // frames can move between them under the lock
        let shared = &self.shared;
        let dir = match self.end {
            End::A => &shared.ab,
            End::B => &shared.ba,
        };
        let wake = if dir.conflate.is_some() {
            let mut meta = dir.meta.lock().unwrap();
            std::mem::replace(&mut meta.reader_asleep, false)
        } else {
            if self.unflushed.is_empty() {
                return;
            }
            let mut meta = dir.meta.lock().unwrap();
            for m in self.unflushed.drain(..) {
                meta.queue.push_back(m);
            }
            std::mem::replace(&mut meta.reader_asleep, false)
        };
        if wake {
            if let Some(info) = self.peer_info() {
                info.mailbox.post(Command::ActivateRead(info.id));
            }
        }
    }

    /// Discard frames written since the last flush
    pub fn rollback(&mut self) {
        if self.unflushed.is_empty() {
            return;
        }
        // The message counter only moves on final frames; a rolled
        // back partial message never completed, but a complete
        // unflushed message must be un-counted
        let complete = self.unflushed.iter().filter(|m| !m.more()).count() as u64;
        if complete > 0 {
            let dir = self.out_dir();
            dir.meta.lock().unwrap().msgs_written -= complete;
        }
        self.unflushed.clear();
    }

    /// Pop the next frame the peer has flushed
    pub fn read(&mut self) -> ReadResult {
        let dir = self.in_dir();
        let mut meta = dir.meta.lock().unwrap();
        if meta.discard {
            meta.queue.clear();
            return ReadResult::Dead;
        }
        let popped = if let Some(db) = &dir.conflate {
            db.read()
        } else {
            meta.queue.pop_front()
        };
        match popped {
            Some(msg) => {
                meta.reader_asleep = false;
                let mut wake_writer = false;
                if !msg.more() {
                    meta.msgs_read += 1;
                    if meta.writer_blocked && meta.msgs_written - meta.msgs_read < dir.lwm {
                        meta.writer_blocked = false;
                        wake_writer = true;
                    }
                }
                drop(meta);
                if wake_writer {
                    if let Some(info) = self.peer_info() {
                        info.mailbox.post(Command::ActivateWrite(info.id));
                    }
                }
                ReadResult::Frame(msg)
            }
            None => {
                if meta.closed {
                    ReadResult::Dead
                } else {
                    meta.reader_asleep = true;
                    ReadResult::Empty
                }
            }
        }
    }

    /// Would a read succeed right now?  On an empty queue this marks
    /// the reader asleep, exactly like a failed read, so the next
    /// flush wakes the socket.
    pub fn check_read(&self) -> bool {
        let dir = self.in_dir();
        let mut meta = dir.meta.lock().unwrap();
        if meta.discard {
            return false;
        }
        let readable = if let Some(db) = &dir.conflate {
            db.check_read()
        } else {
            !meta.queue.is_empty()
        };
        if !readable && !meta.closed {
            meta.reader_asleep = true;
        }
        readable
    }

    /// Non-sleeping probe used when deciding whether a hung-up pipe
    /// has drained
    pub fn in_queue_empty(&self) -> bool {
        let dir = self.in_dir();
        let meta = dir.meta.lock().unwrap();
        if meta.discard {
            return true;
        }
        if let Some(db) = &dir.conflate {
            !db.check_read()
        } else {
            meta.queue.is_empty()
        }
    }

    /// Whether the peer hung up and this end is draining the tail
    #[inline]
    pub fn hup_pending(&self) -> bool {
        self.hup_pending
    }

    pub fn set_hup_pending(&mut self) {
        self.hup_pending = true;
    }

    /// Tear down this end.  With `defer` the peer may drain what was
    /// already flushed; without it pending frames are discarded.  The
    /// peer socket is notified through its mailbox.
    pub fn terminate(&mut self, defer: bool) {
        trace!("pipe terminating (defer={})", defer);
        self.rollback();
        {
            let mut out = self.out_dir().meta.lock().unwrap();
            out.closed = true;
            if !defer {
                out.discard = true;
            }
        }
        {
            let mut inp = self.in_dir().meta.lock().unwrap();
            inp.discard = true;
        }
        if let Some(info) = self.peer_info() {
            info.mailbox.post(Command::Hup(info.id));
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mailbox::Mailbox;

    fn pair_with_mailboxes(hwm: u64) -> (Pipe, Pipe, Mailbox, Mailbox) {
        let (a, b) = pipe_pair(hwm, hwm, false);
        let ma = Mailbox::new().unwrap();
        let mb = Mailbox::new().unwrap();
        a.register(ma.sender(), PipeId(1));
        b.register(mb.sender(), PipeId(2));
        (a, b, ma, mb)
    }

    fn frame(data: &[u8], more: bool) -> Msg {
        let mut m = Msg::from_bytes(data);
        if more {
            m.set_flags(crate::msg::MORE);
        }
        m
    }

    #[test]
    fn writes_invisible_until_flush() {
        let (mut a, mut b, _ma, _mb) = pair_with_mailboxes(0);
        let mut m = frame(b"x", false);
        assert!(a.write(&mut m));
        assert!(matches!(b.read(), ReadResult::Empty));
        a.flush();
        match b.read() {
            ReadResult::Frame(m) => assert_eq!(m.data(), b"x"),
            _ => panic!("expected frame"),
        }
        assert!(matches!(b.read(), ReadResult::Empty));
    }

    #[test]
    fn rollback_discards_unflushed() {
        let (mut a, mut b, _ma, _mb) = pair_with_mailboxes(0);
        let mut m1 = frame(b"keep", false);
        assert!(a.write(&mut m1));
        a.flush();
        let mut m2 = frame(b"drop1", true);
        let mut m3 = frame(b"drop2", false);
        assert!(a.write(&mut m2));
        assert!(a.write(&mut m3));
        a.rollback();
        a.flush();
        match b.read() {
            ReadResult::Frame(m) => assert_eq!(m.data(), b"keep"),
            _ => panic!("expected frame"),
        }
        assert!(matches!(b.read(), ReadResult::Empty));
    }

    #[test]
    fn hwm_counts_messages_not_frames() {
        let (mut a, _b, _ma, _mb) = pair_with_mailboxes(1);
        // A two-frame message through a hwm of one: the second frame
        // must not be refused
        let mut m1 = frame(b"p1", true);
        let mut m2 = frame(b"p2", false);
        assert!(a.write(&mut m1));
        assert!(a.write(&mut m2));
        a.flush();
        // Next message start is refused
        let mut m3 = frame(b"p3", false);
        assert!(!a.write(&mut m3));
        assert_eq!(m3.data(), b"p3");
        assert!(!a.check_write());
    }

    #[test]
    fn reader_reactivates_blocked_writer() {
        let (mut a, mut b, ma, _mb) = pair_with_mailboxes(2);
        for _ in 0..2 {
            let mut m = frame(b"m", false);
            assert!(a.write(&mut m));
        }
        a.flush();
        let mut refused = frame(b"over", false);
        assert!(!a.write(&mut refused));

        // Draining below lwm (= 1) posts ActivateWrite to the writer
        for _ in 0..2 {
            assert!(matches!(b.read(), ReadResult::Frame(_)));
        }
        match ma.try_recv() {
            Some(Command::ActivateWrite(PipeId(1))) => (),
            _ => panic!("expected write activation for the blocked writer"),
        }
        assert!(a.write(&mut refused));
    }

    #[test]
    fn flush_wakes_sleeping_reader() {
        let (mut a, mut b, _ma, mb) = pair_with_mailboxes(0);
        assert!(matches!(b.read(), ReadResult::Empty));
        let mut m = frame(b"x", false);
        a.write(&mut m);
        a.flush();
        match mb.try_recv() {
            Some(Command::ActivateRead(PipeId(2))) => (),
            _ => panic!("expected read activation"),
        }
        assert!(matches!(b.read(), ReadResult::Frame(_)));
    }

    #[test]
    fn terminate_defer_lets_reader_drain() {
        let (mut a, mut b, _ma, mb) = pair_with_mailboxes(0);
        let mut m = frame(b"tail", false);
        a.write(&mut m);
        a.flush();
        a.terminate(true);
        match mb.try_recv() {
            Some(Command::Hup(PipeId(2))) => (),
            _ => panic!("expected hup"),
        }
        match b.read() {
            ReadResult::Frame(m) => assert_eq!(m.data(), b"tail"),
            _ => panic!("expected the queued tail"),
        }
        assert!(matches!(b.read(), ReadResult::Dead));
    }

    #[test]
    fn terminate_immediate_discards() {
        let (mut a, mut b, _ma, _mb) = pair_with_mailboxes(0);
        let mut m = frame(b"lost", false);
        a.write(&mut m);
        a.flush();
        a.terminate(false);
        assert!(matches!(b.read(), ReadResult::Dead));
    }

    #[test]
    fn conflating_pipe_keeps_latest() {
        let (mut a, mut b) = pipe_pair(0, 0, true);
        let ma = Mailbox::new().unwrap();
        let mb = Mailbox::new().unwrap();
        a.register(ma.sender(), PipeId(1));
        b.register(mb.sender(), PipeId(2));

        for i in 0..5u8 {
            let mut m = frame(&[i], false);
            assert!(a.write(&mut m));
            a.flush();
        }
        match b.read() {
            ReadResult::Frame(m) => assert_eq!(m.data(), &[4]),
            _ => panic!("expected latest value"),
        }
        assert!(matches!(b.read(), ReadResult::Empty));
    }
}
