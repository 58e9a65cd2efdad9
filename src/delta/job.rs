//! Job plumbing shared by every delta operation.
//!
//! A job is a resumable state machine. The caller fills the input side of a
//! [`Buffers`], calls [`Job::iterate`], drains whatever appeared on the output
//! side and repeats until the job reports [`JobStatus::Done`]. Jobs never do
//! I/O on the stream themselves, so the same job runs over files, sockets
//! and in-memory slices.

use crate::error::DeltaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    /// Finished; all output has been placed in the buffers.
    Done,
    /// Needs more input or more output space.
    Blocked,
}

pub trait Job {
    fn iterate(&mut self, bufs: &mut Buffers) -> Result<JobStatus, DeltaError>;
}

/// Paired input/output buffers for one job.
///
/// Input is a fixed-capacity window. Bytes a job has not consumed yet stay
/// in place and are moved to the front before the next fill.
#[derive(Debug)]
pub struct Buffers {
    input: Vec<u8>,
    start: usize,
    end: usize,
    eof_in: bool,
    output: Vec<u8>,
    out_capacity: usize,
}

impl Buffers {
    pub fn new(in_capacity: usize, out_capacity: usize) -> Self {
        Self {
            input: vec![0u8; in_capacity],
            start: 0,
            end: 0,
            eof_in: false,
            output: Vec::with_capacity(out_capacity),
            out_capacity,
        }
    }

    pub fn in_capacity(&self) -> usize {
        self.input.len()
    }

    /// Unconsumed input.
    pub fn input(&self) -> &[u8] {
        &self.input[self.start..self.end]
    }

    pub fn avail_in(&self) -> usize {
        self.end - self.start
    }

    pub fn consume(&mut self, n: usize) {
        debug_assert!(n <= self.avail_in());
        self.start += n.min(self.avail_in());
        if self.start == self.end {
            self.start = 0;
            self.end = 0;
        }
    }

    /// Move leftovers to the front and expose the free tail for filling.
    pub fn spare_in(&mut self) -> &mut [u8] {
        if self.start > 0 {
            self.input.copy_within(self.start..self.end, 0);
            self.end -= self.start;
            self.start = 0;
        }
        &mut self.input[self.end..]
    }

    /// Record `n` bytes written into the slice returned by [`spare_in`](Self::spare_in).
    pub fn commit_in(&mut self, n: usize) {
        self.end = (self.end + n).min(self.input.len());
    }

    /// Copy `data` into the input window. Returns how much fit.
    pub fn fill_in(&mut self, data: &[u8]) -> usize {
        let spare = self.spare_in();
        let n = spare.len().min(data.len());
        spare[..n].copy_from_slice(&data[..n]);
        self.commit_in(n);
        n
    }

    pub fn set_eof_in(&mut self) {
        self.eof_in = true;
    }

    pub fn eof_in(&self) -> bool {
        self.eof_in
    }

    pub fn out_capacity(&self) -> usize {
        self.out_capacity
    }

    pub fn avail_out(&self) -> usize {
        self.out_capacity - self.output.len()
    }

    /// Append as much of `data` as fits. Returns the count written.
    pub fn put_out(&mut self, data: &[u8]) -> usize {
        let n = self.avail_out().min(data.len());
        self.output.extend_from_slice(&data[..n]);
        n
    }

    pub fn output(&self) -> &[u8] {
        &self.output
    }

    pub fn clear_output(&mut self) {
        self.output.clear();
    }
}

/// Encoded bytes a job produced but could not place in the output yet.
#[derive(Debug, Default)]
pub(crate) struct Pending {
    buf: Vec<u8>,
    pos: usize,
}

impl Pending {
    #[cfg(test)]
    pub(crate) fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub(crate) fn buf_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    /// Copy out as much as fits. Returns whether everything went out.
    pub(crate) fn drain_into(&mut self, bufs: &mut Buffers) -> bool {
        self.pos += bufs.put_out(&self.buf[self.pos..]);
        if self.pos == self.buf.len() {
            self.buf.clear();
            self.pos = 0;
            return true;
        }
        false
    }
}
