//! Frame assembly and the incoming frame scanner.
//!
//! Outgoing requests are built in place at the tail of the write queue
//! through [`RequestBuilder`]: a header-sized placeholder is appended
//! first, payload fields after it, and `finish` patches the header once
//! the total size is known. A builder that is dropped via `abort` rolls
//! the partial frame back off the tail, which is exactly what the write
//! queue's LIFO discipline exists for.
//!
//! Incoming bytes are scanned by [`parse_replies`]: complete frames
//! carrying the message marker serial are validated and relocated to the
//! message queue (8-aligned, prefixed with their total length), malformed
//! frames are dropped, replies stay in the read queue until the caller
//! that owns their serial collects them with [`find_reply`].

use log::warn;

use crate::event;
use crate::queue::{Queue, MSG_ALIGN};

use super::{MSG_SERIAL, WORD};

/// Request header: length word, serial word, opcode word.
pub const REQUEST_HEADER: usize = 3 * WORD;

/// Reply header: length word, serial word.
pub const REPLY_HEADER: usize = 2 * WORD;

fn word_at(view: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([view[off], view[off + 1], view[off + 2], view[off + 3]])
}

pub struct RequestBuilder<'a> {
    q: &'a mut Queue,
    base: usize,
}

impl<'a> RequestBuilder<'a> {
    /// Starts a frame at the current tail of `q`. `base` is a logical
    /// offset into the queue view, so it survives compaction and growth
    /// while payload fields are appended.
    pub fn new(q: &'a mut Queue) -> Self {
        let base = q.len();
        q.append_padding(REQUEST_HEADER);
        Self { q, base }
    }

    pub fn put_u8(&mut self, v: u8) {
        self.q.append(&[v]);
    }

    pub fn put_u16(&mut self, v: u16) {
        self.q.append(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.q.append(&v.to_le_bytes());
    }

    /// Variable-length field: word-sized byte count, then the bytes.
    pub fn put_bytes(&mut self, data: &[u8]) {
        self.put_u32(data.len() as u32);
        self.q.append(data);
    }

    /// Fixed-shape byte run, no length prefix.
    pub fn put_raw(&mut self, data: &[u8]) {
        self.q.append(data);
    }

    /// Patches the header; the frame is complete and flushable afterwards.
    pub fn finish(self, serial: u32, opcode: u32) {
        let length = (self.q.len() - self.base - WORD) as u32;
        let base = self.base;
        let view = self.q.view_mut();
        view[base..base + WORD].copy_from_slice(&length.to_le_bytes());
        view[base + WORD..base + 2 * WORD].copy_from_slice(&serial.to_le_bytes());
        view[base + 2 * WORD..base + 3 * WORD].copy_from_slice(&opcode.to_le_bytes());
    }

    /// Rolls the partially built frame back off the queue tail.
    pub fn abort(self) {
        let n = self.q.len() - self.base;
        self.q.consume(n);
    }
}

/// Scans the read queue front-to-back. Complete message frames are moved
/// to the message queue, malformed frames are discarded, replies are left
/// where they are. An incomplete frame at the tail stops the scan; its
/// bytes stay for the next round of reading.
pub fn parse_replies(read: &mut Queue, msg: &mut Queue) {
    let mut off = 0;
    loop {
        let view = read.view();
        if view.len() < off + WORD {
            break;
        }
        let rlen = word_at(view, off) as usize;
        if view.len() < off + WORD + rlen {
            break;
        }
        if rlen + WORD >= REPLY_HEADER && word_at(view, off + WORD) != MSG_SERIAL {
            off += WORD + rlen;
            continue;
        }
        if rlen + WORD < REPLY_HEADER + WORD
            || !relocate_msg(msg, &view[off + REPLY_HEADER..off + WORD + rlen])
        {
            warn!("discarding malformed message frame ({rlen} payload bytes)");
        }
        read.remove_span(off, WORD + rlen);
    }
}

/// Validates one message payload (`[mtype][event body]`) and appends it
/// to the message queue as `[total][mtype][event body]` plus alignment
/// padding. Returns false when the payload fails the structural check.
fn relocate_msg(msg: &mut Queue, payload: &[u8]) -> bool {
    let mtype = word_at(payload, 0);
    if !event::frame_body_ok(mtype, &payload[WORD..]) {
        return false;
    }
    let total = WORD + payload.len();
    msg.append(&(total as u32).to_le_bytes());
    msg.append(payload);
    msg.append_padding(total.next_multiple_of(MSG_ALIGN) - total);
    true
}

/// Offset and total size (including the length word) of the complete
/// reply frame carrying `serial`, if one is present in the read queue.
/// Run [`parse_replies`] first so message frames do not sit in the way.
pub fn find_reply(read: &Queue, serial: u32) -> Option<(usize, usize)> {
    let view = read.view();
    let mut off = 0;
    while view.len() >= off + REPLY_HEADER {
        let rlen = word_at(view, off) as usize;
        if view.len() < off + WORD + rlen {
            break;
        }
        if rlen + WORD >= REPLY_HEADER && word_at(view, off + WORD) == serial {
            return Some((off, WORD + rlen));
        }
        off += WORD + rlen;
    }
    None
}

/// First entry of the message queue: message type, event body, and the
/// padded entry size to consume once the entry has been dealt with.
pub fn peek_msg(msg: &Queue) -> Option<(u32, &[u8], usize)> {
    let view = msg.view();
    if view.len() < 2 * WORD {
        return None;
    }
    let total = word_at(view, 0) as usize;
    if total < 2 * WORD || total > view.len() {
        return None;
    }
    let mtype = word_at(view, WORD);
    let padded = total.next_multiple_of(MSG_ALIGN).min(view.len());
    Some((mtype, &view[2 * WORD..total], padded))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::msg_type;
    use crate::queue::Role;

    fn frame(serial: u32, payload: &[u8]) -> Vec<u8> {
        let mut f = Vec::new();
        f.extend_from_slice(&((WORD + payload.len()) as u32).to_le_bytes());
        f.extend_from_slice(&serial.to_le_bytes());
        f.extend_from_slice(payload);
        f
    }

    fn gadget_msg() -> Vec<u8> {
        let mut p = Vec::new();
        p.extend_from_slice(&msg_type::GADGET.to_le_bytes());
        p.extend_from_slice(&7u32.to_le_bytes()); // widget
        p.extend_from_slice(&3u16.to_le_bytes()); // code
        p.extend_from_slice(&0u16.to_le_bytes()); // flags
        p
    }

    #[test]
    fn builder_emits_header_then_payload() {
        let mut q = Queue::new(Role::Write);
        let mut b = RequestBuilder::new(&mut q);
        b.put_u32(0xAABBCCDD);
        b.put_u16(0x1122);
        b.put_bytes(b"xy");
        b.finish(5, 9);

        let v = q.view();
        // length covers everything after the length word itself
        assert_eq!(word_at(v, 0) as usize, v.len() - WORD);
        assert_eq!(word_at(v, WORD), 5);
        assert_eq!(word_at(v, 2 * WORD), 9);
        assert_eq!(word_at(v, 3 * WORD), 0xAABBCCDD);
        assert_eq!(&v[3 * WORD + 4..3 * WORD + 6], &0x1122u16.to_le_bytes());
        assert_eq!(word_at(v, 3 * WORD + 6), 2);
        assert_eq!(&v[v.len() - 2..], b"xy");
    }

    #[test]
    fn abort_rolls_back_only_the_unfinished_frame() {
        let mut q = Queue::new(Role::Write);
        let mut b = RequestBuilder::new(&mut q);
        b.put_u32(1);
        b.finish(1, 1);
        let committed = q.len();

        let mut b = RequestBuilder::new(&mut q);
        b.put_u32(2);
        b.put_bytes(&[0u8; 200]);
        b.abort();
        assert_eq!(q.len(), committed);
    }

    #[test]
    fn scan_separates_replies_and_messages() {
        let mut read = Queue::new(Role::Read);
        let mut msg = Queue::new(Role::Msg);

        read.append(&frame(3, b"\x01\x00\x00\x00reply-three"));
        read.append(&frame(MSG_SERIAL, &gadget_msg()));
        read.append(&frame(8, b"\x00\x00\x00\x00"));
        // incomplete tail: length word promises more than is present
        read.append(&20u32.to_le_bytes());
        read.append(&[0u8; 6]);

        parse_replies(&mut read, &mut msg);

        // message relocated, replies and the incomplete tail retained
        let (mtype, body, padded) = peek_msg(&msg).unwrap();
        assert_eq!(mtype, msg_type::GADGET);
        assert_eq!(body.len(), 8);
        assert_eq!(padded % MSG_ALIGN, 0);

        assert!(find_reply(&read, 3).is_some());
        assert!(find_reply(&read, 8).is_some());
        assert!(find_reply(&read, MSG_SERIAL).is_none());
        assert_eq!(read.view().len(), frame(3, b"\x01\x00\x00\x00reply-three").len()
            + frame(8, b"\x00\x00\x00\x00").len() + WORD + 6);
    }

    #[test]
    fn malformed_message_frames_are_dropped() {
        let mut read = Queue::new(Role::Read);
        let mut msg = Queue::new(Role::Msg);

        // declared gadget but body one byte short of the fixed part
        let mut bad = Vec::new();
        bad.extend_from_slice(&msg_type::GADGET.to_le_bytes());
        bad.extend_from_slice(&[0u8; 7]);
        read.append(&frame(MSG_SERIAL, &bad));
        // marker frame with no room for even a type word
        read.append(&frame(MSG_SERIAL, b""));
        read.append(&frame(11, b"tail"));

        parse_replies(&mut read, &mut msg);
        assert!(msg.is_empty());
        assert_eq!(find_reply(&read, 11), Some((0, frame(11, b"tail").len())));
    }

    #[test]
    fn find_reply_skips_foreign_serials() {
        let mut read = Queue::new(Role::Read);
        read.append(&frame(4, b"aaaa"));
        read.append(&frame(5, b"bbbbbbbb"));
        let (off, total) = find_reply(&read, 5).unwrap();
        assert_eq!(off, frame(4, b"aaaa").len());
        assert_eq!(total, frame(5, b"bbbbbbbb").len());
        assert!(find_reply(&read, 6).is_none());
    }

    #[test]
    fn message_entries_are_aligned() {
        let mut read = Queue::new(Role::Read);
        let mut msg = Queue::new(Role::Msg);
        read.append(&frame(MSG_SERIAL, &gadget_msg()));
        read.append(&frame(MSG_SERIAL, &gadget_msg()));
        parse_replies(&mut read, &mut msg);

        let (_, _, padded) = peek_msg(&msg).unwrap();
        msg.consume(padded);
        let (mtype, body, _) = peek_msg(&msg).unwrap();
        assert_eq!(mtype, msg_type::GADGET);
        assert_eq!(body.len(), 8);
    }
}
