//! Delta transfer library: signatures, delta generation and patching.
//!
//! Every operation is a [`Job`] driven over a pair of [`Buffers`], so the
//! file stream roles can push bytes through it a frame at a time.

pub mod generate;
pub mod job;
pub mod patch;
pub mod rollsum;
pub mod signature;

pub use generate::DeltaJob;
pub use job::{Buffers, Job, JobStatus};
pub use patch::PatchJob;
pub use rollsum::Rollsum;
pub use signature::{sig_args, LoadSignatureJob, Signature, SignatureJob, SignatureParams};

use crate::error::DeltaError;

pub const SIGNATURE_MAGIC: u32 = 0x6366_7301;
pub const DELTA_MAGIC: u32 = 0x6366_7302;

pub const OP_END: u8 = 0x00;
pub const OP_COPY: u8 = 0x01;
pub const OP_LITERAL: u8 = 0x02;

/// Run `job` to completion over an in-memory input, collecting its output.
///
/// Input is fed in windows of `in_cap` bytes and output drained every
/// `out_cap` bytes, which exercises the same resumption paths a streamed
/// transfer does.
pub fn run_job<J: Job + ?Sized>(
    job: &mut J,
    input: &[u8],
    in_cap: usize,
    out_cap: usize,
) -> Result<Vec<u8>, DeltaError> {
    let mut bufs = Buffers::new(in_cap, out_cap);
    let mut fed = 0;
    let mut out = Vec::new();

    loop {
        fed += bufs.fill_in(&input[fed..]);
        if fed == input.len() {
            bufs.set_eof_in();
        }

        let before = (bufs.avail_in(), fed, out.len());
        let status = job.iterate(&mut bufs)?;
        out.extend_from_slice(bufs.output());
        let produced = !bufs.output().is_empty();
        bufs.clear_output();

        if status == JobStatus::Done {
            return Ok(out);
        }
        // Blocked with a full input window, nothing consumed and nothing produced
        if !produced && (bufs.avail_in(), fed, out.len()) == before && bufs.spare_in().is_empty() {
            return Err(DeltaError::Truncated("stalled job input"));
        }
    }
}

/// Deterministic pseudo-random bytes (xorshift64).
#[cfg(test)]
pub(crate) fn noise(n: usize, seed: u64) -> Vec<u8> {
    let mut x = seed.wrapping_mul(0x9E37_79B9_7F4A_7C15) | 1;
    (0..n)
        .map(|_| {
            x ^= x << 13;
            x ^= x >> 7;
            x ^= x << 17;
            (x >> 24) as u8
        })
        .collect()
}
