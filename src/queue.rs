//! Growable byte buffers with a per-role consumption discipline.
//!
//! A connection owns five queues: raw read, raw write, decoded messages,
//! and the two compressed-side staging queues. Read-side queues are FIFO
//! (consumption advances the start offset), write-side queues are LIFO
//! (consumption truncates the tail) so a partially built, failed request
//! can be rolled back without disturbing earlier requests.
//!
//! Each queue keeps a `start` offset, a used `len` and its backing
//! storage, with the invariant `start + len <= capacity`. Growth
//! reallocates to `(capacity + needed + 40) * 5/4`, amortizing repeated
//! small appends; compaction (resetting `start` to zero) is tried first
//! whenever the existing capacity would suffice. Callers address queue
//! contents through logical offsets into [`Queue::view`], which survive
//! both compaction and reallocation.

use log::trace;

/// How many extra slack bytes the growth policy adds before scaling.
const GROW_SLACK: usize = 40;

/// Alignment kept for entries in the message queue, so typed views of
/// relocated event payloads stay aligned.
pub const MSG_ALIGN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    Write,
    Msg,
    CompressedRead,
    CompressedWrite,
}

impl Role {
    /// FIFO roles consume from the front; LIFO roles from the tail.
    pub fn is_fifo(self) -> bool {
        matches!(self, Role::Read | Role::Msg | Role::CompressedRead)
    }
}

#[derive(Debug)]
pub struct Queue {
    role: Role,
    buf: Vec<u8>,
    start: usize,
    len: usize,
}

impl Queue {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            buf: Vec::new(),
            start: 0,
            len: 0,
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Readable span, in queue order.
    pub fn view(&self) -> &[u8] {
        &self.buf[self.start..self.start + self.len]
    }

    pub fn view_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.start + self.len]
    }

    /// Makes room so `extra` more bytes can be appended contiguously.
    /// Compacts in place when the capacity already suffices, otherwise
    /// grows the backing storage.
    pub fn reserve(&mut self, extra: usize) {
        if self.start + self.len + extra <= self.capacity() {
            return;
        }
        if self.start > 0 {
            self.buf.copy_within(self.start..self.start + self.len, 0);
            self.start = 0;
        }
        if self.len + extra > self.capacity() {
            let target = (self.capacity() + extra + GROW_SLACK) * 5 / 4;
            trace!(
                "queue {:?}: grow {} -> {} (need {})",
                self.role,
                self.capacity(),
                target,
                extra
            );
            self.buf.resize(target, 0);
        }
    }

    pub fn append(&mut self, data: &[u8]) {
        self.reserve(data.len());
        let at = self.start + self.len;
        self.buf[at..at + data.len()].copy_from_slice(data);
        self.len += data.len();
    }

    /// Appends `n` zero bytes (message-queue alignment padding).
    pub fn append_padding(&mut self, n: usize) {
        self.reserve(n);
        let at = self.start + self.len;
        self.buf[at..at + n].fill(0);
        self.len += n;
    }

    /// Marks `n` more bytes used and hands out the freshly appended span
    /// for the caller to fill (codec output, for instance). Pair with
    /// [`Queue::truncate_tail`] to give back whatever stays unused.
    pub fn extend_for_fill(&mut self, n: usize) -> &mut [u8] {
        self.reserve(n);
        let at = self.start + self.len;
        self.len += n;
        &mut self.buf[at..at + n]
    }

    /// Gives back `n` bytes from the tail, clamped to the used length.
    pub fn truncate_tail(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        self.len -= n;
        if self.len == 0 {
            self.start = 0;
        }
        n
    }

    fn consume_from_front(&mut self, n: usize) -> usize {
        let n = n.min(self.len);
        if n == self.len {
            self.start = 0;
            self.len = 0;
        } else {
            self.start += n;
            self.len -= n;
        }
        n
    }

    /// Removes `n` bytes following the queue's discipline: front for FIFO
    /// roles, tail for LIFO roles. Clamped to the available length;
    /// returns how many bytes were actually removed.
    pub fn consume(&mut self, n: usize) -> usize {
        if self.role.is_fifo() {
            self.consume_from_front(n)
        } else {
            self.truncate_tail(n)
        }
    }

    /// Front-removal regardless of role. Flushing a write queue consumes
    /// the bytes that actually reached the transport from the front, even
    /// though the role's rollback discipline is LIFO.
    pub fn consume_front(&mut self, n: usize) -> usize {
        self.consume_from_front(n)
    }

    /// Removes the span at logical offset `offset` (an index into
    /// [`Queue::view`]), shifting whichever side of the queue is smaller.
    pub fn remove_span(&mut self, offset: usize, n: usize) {
        debug_assert!(offset + n <= self.len);
        if offset == 0 {
            self.consume_from_front(n);
            return;
        }
        let before = offset;
        let after = self.len - offset - n;
        if after == 0 {
            self.len -= n;
            return;
        }
        if before <= after {
            self.buf
                .copy_within(self.start..self.start + before, self.start + n);
            self.start += n;
        } else {
            let from = self.start + offset + n;
            self.buf.copy_within(from..from + after, self.start + offset);
        }
        self.len -= n;
    }

    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}

/// The five queues of one connection, with split-borrow accessors for the
/// operations that move bytes between two of them.
#[derive(Debug)]
pub struct QueueSet {
    read: Queue,
    write: Queue,
    msg: Queue,
    zread: Queue,
    zwrite: Queue,
}

impl QueueSet {
    pub fn new() -> Self {
        Self {
            read: Queue::new(Role::Read),
            write: Queue::new(Role::Write),
            msg: Queue::new(Role::Msg),
            zread: Queue::new(Role::CompressedRead),
            zwrite: Queue::new(Role::CompressedWrite),
        }
    }

    pub fn get(&self, role: Role) -> &Queue {
        match role {
            Role::Read => &self.read,
            Role::Write => &self.write,
            Role::Msg => &self.msg,
            Role::CompressedRead => &self.zread,
            Role::CompressedWrite => &self.zwrite,
        }
    }

    pub fn get_mut(&mut self, role: Role) -> &mut Queue {
        match role {
            Role::Read => &mut self.read,
            Role::Write => &mut self.write,
            Role::Msg => &mut self.msg,
            Role::CompressedRead => &mut self.zread,
            Role::CompressedWrite => &mut self.zwrite,
        }
    }

    /// (read, msg): reply parsing relocates message frames.
    pub fn read_msg_mut(&mut self) -> (&mut Queue, &mut Queue) {
        (&mut self.read, &mut self.msg)
    }

    /// (write, compressed-write): outgoing compression.
    pub fn write_pair_mut(&mut self) -> (&mut Queue, &mut Queue) {
        (&mut self.write, &mut self.zwrite)
    }

    /// (compressed-read, read): incoming decompression.
    pub fn read_pair_mut(&mut self) -> (&mut Queue, &mut Queue) {
        (&mut self.zread, &mut self.read)
    }

    pub fn clear_all(&mut self) {
        self.read.clear();
        self.write.clear();
        self.msg.clear();
        self.zread.clear();
        self.zwrite.clear();
    }
}

impl Default for QueueSet {
    fn default() -> Self {
        Self::new()
    }
}
