//! Block signatures of a basis file.
//!
//! Wire layout, big-endian:
//!
//! ```text
//! magic:u32 | block_len:u32 | strong_len:u32 | { weak:u32 | len:u32 | strong[strong_len] }*
//! ```

use super::job::{Buffers, Job, JobStatus, Pending};
use super::rollsum::Rollsum;
use super::SIGNATURE_MAGIC;
use crate::error::DeltaError;
use bytes::{Buf, BufMut};
use std::collections::HashMap;

/// Longest strong checksum (a full BLAKE3 digest).
pub const MAX_STRONG_LEN: u32 = 32;

pub const DEFAULT_BLOCK_LEN: u32 = 2048;

const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignatureParams {
    pub block_len: u32,
    pub strong_len: u32,
}

impl SignatureParams {
    fn validate(&self) -> Result<(), DeltaError> {
        if self.block_len == 0 || self.strong_len == 0 || self.strong_len > MAX_STRONG_LEN {
            return Err(DeltaError::InvalidParams {
                block_len: self.block_len,
                strong_len: self.strong_len,
            });
        }
        Ok(())
    }

    fn entry_len(&self) -> usize {
        8 + self.strong_len as usize
    }
}

/// Recommended parameters for a basis of `file_size` bytes. An unknown size
/// gets the defaults.
pub fn sig_args(file_size: Option<u64>) -> SignatureParams {
    let size = match file_size {
        Some(size) => size,
        None => {
            return SignatureParams {
                block_len: DEFAULT_BLOCK_LEN,
                strong_len: MAX_STRONG_LEN,
            }
        }
    };

    let block_len = if size <= 256 * 256 {
        256
    } else {
        ((size as f64).sqrt() as u64 & !127).min(1 << 30) as u32
    };

    // Enough bits to make an accidental strong match unlikely for this many blocks
    let bits = log2(size + (1 << 24)) + log2(size / block_len as u64 + 1);
    let strong_len = (2 + (bits + 7) / 8).min(MAX_STRONG_LEN);

    SignatureParams {
        block_len,
        strong_len,
    }
}

fn log2(v: u64) -> u32 {
    63 - v.max(1).leading_zeros()
}

pub fn strong_sum(block: &[u8], strong_len: u32) -> Vec<u8> {
    blake3::hash(block).as_bytes()[..strong_len as usize].to_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSignature {
    pub weak: u32,
    pub len: u32,
    pub strong: Vec<u8>,
}

/// A loaded signature, indexed by weak checksum once
/// [`build_hash_table`](Self::build_hash_table) has run.
#[derive(Debug, Clone)]
pub struct Signature {
    pub params: SignatureParams,
    pub blocks: Vec<BlockSignature>,
    index: HashMap<u32, Vec<usize>>,
}

impl Signature {
    pub fn new(params: SignatureParams) -> Self {
        Self {
            params,
            blocks: Vec::new(),
            index: HashMap::new(),
        }
    }

    pub fn build_hash_table(&mut self) {
        self.index.clear();
        for (i, block) in self.blocks.iter().enumerate() {
            self.index.entry(block.weak).or_default().push(i);
        }
    }

    /// Block whose content is `data`, given its precomputed weak sum.
    pub fn find(&self, weak: u32, data: &[u8]) -> Option<usize> {
        let candidates = self.index.get(&weak)?;
        let mut strong: Option<Vec<u8>> = None;
        for &i in candidates {
            let block = &self.blocks[i];
            if block.len as usize != data.len() {
                continue;
            }
            let sum = strong.get_or_insert_with(|| strong_sum(data, self.params.strong_len));
            if *sum == block.strong {
                return Some(i);
            }
        }
        None
    }

    /// Offset of block `i` in the basis.
    pub fn block_offset(&self, i: usize) -> u64 {
        i as u64 * self.params.block_len as u64
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

/// Generates a signature from basis bytes fed as input.
pub struct SignatureJob {
    params: SignatureParams,
    header_sent: bool,
    block: Vec<u8>,
    pending: Pending,
}

impl SignatureJob {
    pub fn new(params: SignatureParams) -> Result<Self, DeltaError> {
        params.validate()?;
        Ok(Self {
            params,
            header_sent: false,
            block: Vec::with_capacity(params.block_len as usize),
            pending: Pending::default(),
        })
    }

    fn emit_block(&mut self) {
        let weak = Rollsum::of(&self.block).digest();
        let strong = strong_sum(&self.block, self.params.strong_len);
        let out = self.pending.buf_mut();
        out.put_u32(weak);
        out.put_u32(self.block.len() as u32);
        out.put_slice(&strong);
        self.block.clear();
    }
}

impl Job for SignatureJob {
    fn iterate(&mut self, bufs: &mut Buffers) -> Result<JobStatus, DeltaError> {
        if bufs.out_capacity() == 0 {
            return Err(DeltaError::NoOutputSpace);
        }
        loop {
            if !self.pending.drain_into(bufs) {
                return Ok(JobStatus::Blocked);
            }

            if !self.header_sent {
                let out = self.pending.buf_mut();
                out.put_u32(SIGNATURE_MAGIC);
                out.put_u32(self.params.block_len);
                out.put_u32(self.params.strong_len);
                self.header_sent = true;
                continue;
            }

            let want = self.params.block_len as usize - self.block.len();
            let take = want.min(bufs.avail_in());
            if take > 0 {
                self.block.extend_from_slice(&bufs.input()[..take]);
                bufs.consume(take);
            }

            if self.block.len() == self.params.block_len as usize {
                self.emit_block();
                continue;
            }

            if !bufs.eof_in() {
                return Ok(JobStatus::Blocked);
            }
            if !self.block.is_empty() {
                self.emit_block();
                continue;
            }
            return Ok(JobStatus::Done);
        }
    }
}

/// Parses a signature stream.
pub struct LoadSignatureJob {
    signature: Option<Signature>,
}

impl Default for LoadSignatureJob {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSignatureJob {
    pub fn new() -> Self {
        Self { signature: None }
    }

    /// The signature loaded so far.
    pub fn into_signature(self) -> Option<Signature> {
        self.signature
    }
}

impl Job for LoadSignatureJob {
    fn iterate(&mut self, bufs: &mut Buffers) -> Result<JobStatus, DeltaError> {
        if self.signature.is_none() {
            if bufs.avail_in() < HEADER_LEN {
                if bufs.eof_in() {
                    return Err(DeltaError::Truncated("signature header"));
                }
                return Ok(JobStatus::Blocked);
            }
            let mut header = &bufs.input()[..HEADER_LEN];
            let magic = header.get_u32();
            if magic != SIGNATURE_MAGIC {
                return Err(DeltaError::BadMagic {
                    expected: SIGNATURE_MAGIC,
                    found: magic,
                });
            }
            let params = SignatureParams {
                block_len: header.get_u32(),
                strong_len: header.get_u32(),
            };
            params.validate()?;
            bufs.consume(HEADER_LEN);
            self.signature = Some(Signature::new(params));
        }

        let signature = match self.signature.as_mut() {
            Some(sig) => sig,
            None => return Ok(JobStatus::Blocked),
        };

        let entry_len = signature.params.entry_len();
        let strong_len = signature.params.strong_len as usize;
        while bufs.avail_in() >= entry_len {
            let mut entry = &bufs.input()[..entry_len];
            let weak = entry.get_u32();
            let len = entry.get_u32();
            if len == 0 || len > signature.params.block_len {
                return Err(DeltaError::InvalidParams {
                    block_len: len,
                    strong_len: signature.params.strong_len,
                });
            }
            let strong = entry[..strong_len].to_vec();
            signature.blocks.push(BlockSignature { weak, len, strong });
            bufs.consume(entry_len);
        }

        if !bufs.eof_in() {
            return Ok(JobStatus::Blocked);
        }
        if bufs.avail_in() > 0 {
            return Err(DeltaError::Truncated("signature block"));
        }
        Ok(JobStatus::Done)
    }
}
