//! Applying a delta to a basis.

use super::job::{Buffers, Job, JobStatus};
use super::{DELTA_MAGIC, OP_COPY, OP_END, OP_LITERAL};
use crate::error::DeltaError;
use bytes::Buf;
use std::io::{self, Read, Seek, SeekFrom};

/// Largest basis read per copy step.
const COPY_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Header,
    Command,
    Literal { remaining: u64 },
    Copy { offset: u64, remaining: u64 },
    Done,
}

/// Rebuilds the new file from a delta stream (input) and the basis it was
/// computed against. Output is the reconstructed content.
pub struct PatchJob<B> {
    basis: B,
    state: State,
    scratch: Vec<u8>,
}

impl<B: Read + Seek> PatchJob<B> {
    pub fn new(basis: B) -> Self {
        Self {
            basis,
            state: State::Header,
            scratch: Vec::new(),
        }
    }

    pub fn into_basis(self) -> B {
        self.basis
    }

    fn copy_from_basis(
        &mut self,
        offset: u64,
        remaining: u64,
        bufs: &mut Buffers,
    ) -> Result<u64, DeltaError> {
        let n = (remaining as usize).min(bufs.avail_out()).min(COPY_CHUNK);
        self.scratch.resize(n, 0);
        self.basis
            .seek(SeekFrom::Start(offset))
            .map_err(DeltaError::Basis)?;
        self.basis
            .read_exact(&mut self.scratch)
            .map_err(|e| match e.kind() {
                io::ErrorKind::UnexpectedEof => DeltaError::CopyOutOfRange {
                    offset,
                    len: remaining,
                },
                _ => DeltaError::Basis(e),
            })?;
        bufs.put_out(&self.scratch);
        Ok(n as u64)
    }

    /// Bytes still needed before the current step can run.
    fn need(&self, bufs: &Buffers) -> Option<&'static str> {
        let have = bufs.avail_in();
        match self.state {
            State::Header if have < 4 => Some("delta header"),
            State::Command => match bufs.input().first() {
                None => Some("delta command"),
                Some(&OP_COPY) if have < 13 => Some("copy command"),
                Some(&OP_LITERAL) if have < 5 => Some("literal command"),
                _ => None,
            },
            State::Literal { remaining } if remaining > 0 && have == 0 => Some("literal"),
            _ => None,
        }
    }
}

impl<B: Read + Seek> Job for PatchJob<B> {
    fn iterate(&mut self, bufs: &mut Buffers) -> Result<JobStatus, DeltaError> {
        if bufs.out_capacity() == 0 {
            return Err(DeltaError::NoOutputSpace);
        }
        loop {
            if let Some(what) = self.need(bufs) {
                if bufs.eof_in() {
                    return Err(DeltaError::Truncated(what));
                }
                return Ok(JobStatus::Blocked);
            }

            match self.state {
                State::Header => {
                    let mut header = bufs.input();
                    let magic = header.get_u32();
                    if magic != DELTA_MAGIC {
                        return Err(DeltaError::BadMagic {
                            expected: DELTA_MAGIC,
                            found: magic,
                        });
                    }
                    bufs.consume(4);
                    self.state = State::Command;
                }
                State::Command => {
                    let mut cmd = bufs.input();
                    let op = cmd.get_u8();
                    self.state = match op {
                        OP_END => {
                            bufs.consume(1);
                            State::Done
                        }
                        OP_COPY => {
                            let offset = cmd.get_u64();
                            let len = cmd.get_u32() as u64;
                            bufs.consume(13);
                            State::Copy {
                                offset,
                                remaining: len,
                            }
                        }
                        OP_LITERAL => {
                            let len = cmd.get_u32() as u64;
                            bufs.consume(5);
                            State::Literal { remaining: len }
                        }
                        other => return Err(DeltaError::UnknownCommand(other)),
                    };
                }
                State::Literal { remaining: 0 } | State::Copy { remaining: 0, .. } => {
                    self.state = State::Command;
                }
                State::Literal { remaining } => {
                    if bufs.avail_out() == 0 {
                        return Ok(JobStatus::Blocked);
                    }
                    let n = (remaining as usize).min(bufs.avail_in()).min(bufs.avail_out());
                    let chunk = bufs.input()[..n].to_vec();
                    bufs.put_out(&chunk);
                    bufs.consume(n);
                    self.state = State::Literal {
                        remaining: remaining - n as u64,
                    };
                }
                State::Copy { offset, remaining } => {
                    if bufs.avail_out() == 0 {
                        return Ok(JobStatus::Blocked);
                    }
                    let n = self.copy_from_basis(offset, remaining, bufs)?;
                    self.state = State::Copy {
                        offset: offset + n,
                        remaining: remaining - n,
                    };
                }
                State::Done => return Ok(JobStatus::Done),
            }
        }
    }
}
