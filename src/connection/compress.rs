//! Transparent zlib stream compression.
//!
//! Once negotiated, every byte after the negotiation point travels
//! compressed: the plain write queue is deflated into the compressed
//! write queue before hitting the socket, and socket bytes land in the
//! compressed read queue and are inflated into the plain read queue. Both
//! directions are long-lived streams flushed at frame-batch granularity
//! (sync flush), never finished until the connection dies.
//!
//! Output sizing starts from stream-specific guesses (compressed output
//! is assumed no larger than input plus a small header margin; inflated
//! output is assumed within five times the input) and retries with a
//! doubled buffer when the codec reports it ran out of room.

use flate2::{Compress, Compression, Decompress, FlushCompress, FlushDecompress, Status};
use log::trace;

use crate::error::Fatal;
use crate::queue::Queue;

const HEADROOM: usize = 12;

pub struct GzipState {
    deflate: Compress,
    inflate: Decompress,
}

impl GzipState {
    pub fn new() -> Self {
        Self {
            deflate: Compress::new(Compression::best(), true),
            inflate: Decompress::new(true),
        }
    }

    /// Deflates the whole content of `src` onto the tail of `dst`.
    /// Consumes `src` on success.
    pub fn deflate_queue(&mut self, src: &mut Queue, dst: &mut Queue) -> Result<(), Fatal> {
        if src.is_empty() {
            return Ok(());
        }
        let mut out_guess = src.len() + HEADROOM;
        loop {
            let in_before = self.deflate.total_in();
            let out_before = self.deflate.total_out();
            let span = dst.extend_for_fill(out_guess);
            let status = self
                .deflate
                .compress(src.view(), span, FlushCompress::Sync)
                .map_err(|_| Fatal::Compression)?;
            let produced = (self.deflate.total_out() - out_before) as usize;
            let consumed = (self.deflate.total_in() - in_before) as usize;
            dst.truncate_tail(out_guess - produced);
            src.consume_front(consumed);
            match status {
                // a full output span can hide pending flush bytes, so
                // success also requires leftover room
                Status::Ok if src.is_empty() && produced < out_guess => {
                    trace!("deflate: {consumed} -> {produced} bytes");
                    return Ok(());
                }
                Status::Ok | Status::BufError => {
                    out_guess *= 2;
                }
                Status::StreamEnd => return Err(Fatal::Compression),
            }
        }
    }

    /// Inflates the whole content of `src` onto the tail of `dst`.
    /// Consumes `src` on success. Corrupt input from the peer is a
    /// connection-fatal protocol violation.
    pub fn inflate_queue(&mut self, src: &mut Queue, dst: &mut Queue) -> Result<(), Fatal> {
        if src.is_empty() {
            return Ok(());
        }
        let mut out_guess = 5 * src.len() + HEADROOM;
        loop {
            let in_before = self.inflate.total_in();
            let out_before = self.inflate.total_out();
            let span = dst.extend_for_fill(out_guess);
            let status = self
                .inflate
                .decompress(src.view(), span, FlushDecompress::Sync)
                .map_err(|_| Fatal::BadCompressedData)?;
            let produced = (self.inflate.total_out() - out_before) as usize;
            let consumed = (self.inflate.total_in() - in_before) as usize;
            dst.truncate_tail(out_guess - produced);
            src.consume_front(consumed);
            match status {
                Status::Ok | Status::StreamEnd if src.is_empty() && produced < out_guess => {
                    trace!("inflate: {consumed} -> {produced} bytes");
                    return Ok(());
                }
                Status::Ok | Status::BufError => {
                    out_guess *= 2;
                }
                // the stream must outlive the connection; trailing bytes
                // after an end-of-stream are a peer violation
                Status::StreamEnd if produced == out_guess => {
                    out_guess *= 2;
                }
                Status::StreamEnd => return Err(Fatal::BadCompressedData),
            }
        }
    }
}
