//! Delta generation against a loaded signature.
//!
//! Delta layout, big-endian:
//!
//! ```text
//! magic:u32 | command* | END
//! COPY    = 0x01 offset:u64 len:u32      (bytes from the basis)
//! LITERAL = 0x02 len:u32 data[len]       (new bytes)
//! END     = 0x00
//! ```

use super::job::{Buffers, Job, JobStatus, Pending};
use super::rollsum::Rollsum;
use super::signature::Signature;
use super::{OP_COPY, OP_END, OP_LITERAL, DELTA_MAGIC};
use crate::error::DeltaError;
use bytes::BufMut;
use std::sync::Arc;

/// Unmatched bytes are sent once this many have piled up.
const LITERAL_FLUSH: usize = 32 * 1024;

pub struct DeltaJob {
    signature: Arc<Signature>,
    block_len: usize,
    /// Bytes read but not yet described by a command
    buf: Vec<u8>,
    /// Start of the match window in `buf`; everything before is literal
    pos: usize,
    sum: Option<Rollsum>,
    copy: Option<(u64, u64)>,
    header_sent: bool,
    finished: bool,
    pending: Pending,
}

impl DeltaJob {
    /// `signature` must have had its hash table built.
    pub fn new(signature: Arc<Signature>) -> Self {
        let block_len = signature.params.block_len as usize;
        Self {
            signature,
            block_len,
            buf: Vec::new(),
            pos: 0,
            sum: None,
            copy: None,
            header_sent: false,
            finished: false,
            pending: Pending::default(),
        }
    }

    fn flush_copy(&mut self) {
        if let Some((offset, len)) = self.copy.take() {
            let out = self.pending.buf_mut();
            out.put_u8(OP_COPY);
            out.put_u64(offset);
            out.put_u32(len as u32);
        }
    }

    fn emit_copy(&mut self, offset: u64, len: u64) {
        if let Some((start, run)) = self.copy.as_mut() {
            if *start + *run == offset && *run + len <= u32::MAX as u64 {
                *run += len;
                return;
            }
        }
        self.flush_copy();
        self.copy = Some((offset, len));
    }

    /// Emit `buf[..len]` as a literal and drop it from the buffer.
    fn emit_literal(&mut self, len: usize) {
        if len == 0 {
            return;
        }
        self.flush_copy();
        let out = self.pending.buf_mut();
        out.put_u8(OP_LITERAL);
        out.put_u32(len as u32);
        out.put_slice(&self.buf[..len]);
        self.buf.drain(..len);
        self.pos -= len.min(self.pos);
    }

    /// Match as far as the buffered data allows.
    fn scan(&mut self) {
        if self.signature.is_empty() {
            self.pos = self.buf.len();
            if self.pos >= LITERAL_FLUSH {
                self.emit_literal(self.pos);
            }
            return;
        }

        while self.buf.len() - self.pos >= self.block_len {
            let window = &self.buf[self.pos..self.pos + self.block_len];
            let sum = *self.sum.get_or_insert_with(|| Rollsum::of(window));

            if let Some(i) = self.signature.find(sum.digest(), window) {
                let offset = self.signature.block_offset(i);
                self.emit_literal(self.pos);
                self.emit_copy(offset, self.block_len as u64);
                self.buf.drain(..self.block_len);
                self.pos = 0;
                self.sum = None;
                continue;
            }

            if self.buf.len() - self.pos == self.block_len {
                // Need the next byte before the window can slide
                break;
            }
            let out = self.buf[self.pos];
            let inb = self.buf[self.pos + self.block_len];
            if let Some(s) = self.sum.as_mut() {
                s.rotate(out, inb);
            }
            self.pos += 1;

            if self.pos >= LITERAL_FLUSH {
                self.emit_literal(self.pos);
            }
        }
    }

    /// Input is exhausted: try the basis's short last block, then emit the rest.
    fn finish(&mut self) {
        let tail = &self.buf[self.pos..];
        if !tail.is_empty() && tail.len() < self.block_len {
            let weak = Rollsum::of(tail).digest();
            if let Some(i) = self.signature.find(weak, tail) {
                let offset = self.signature.block_offset(i);
                let len = tail.len() as u64;
                self.emit_literal(self.pos);
                self.emit_copy(offset, len);
                self.buf.clear();
                self.pos = 0;
            }
        }
        self.emit_literal(self.buf.len());
        self.flush_copy();
        self.pending.buf_mut().put_u8(OP_END);
        self.finished = true;
    }
}

impl Job for DeltaJob {
    fn iterate(&mut self, bufs: &mut Buffers) -> Result<JobStatus, DeltaError> {
        if bufs.out_capacity() == 0 {
            return Err(DeltaError::NoOutputSpace);
        }
        loop {
            if !self.pending.drain_into(bufs) {
                return Ok(JobStatus::Blocked);
            }
            if self.finished {
                return Ok(JobStatus::Done);
            }
            if !self.header_sent {
                self.pending.buf_mut().put_u32(DELTA_MAGIC);
                self.header_sent = true;
                continue;
            }

            let n = bufs.avail_in();
            if n > 0 {
                self.buf.extend_from_slice(bufs.input());
                bufs.consume(n);
                self.scan();
                continue;
            }

            if bufs.eof_in() {
                self.finish();
                continue;
            }
            return Ok(JobStatus::Blocked);
        }
    }
}
