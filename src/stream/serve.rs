//! Server side of a file stream: holds the up-to-date source file.
//!
//! 1. Load the client's signature of its basis, frame by frame.
//! 2. Index it.
//! 3. Stream a delta of the source file against it, ending with an EOF frame.
//!
//! Any failure sends one error frame and aborts.

use super::frame::{FrameChannel, ERROR_INTERNAL_SERVER};
use crate::delta::{Buffers, DeltaJob, Job, JobStatus, LoadSignatureJob, Signature};
use crate::error::{DeltaError, StreamError};
use std::path::Path;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error};

/// Serve `source` to the client on the other end of `chan`.
pub async fn serve<R, W>(chan: &mut FrameChannel<R, W>, source: &Path) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    debug!(
        "Receiving and loading signature into memory for file '{}'",
        source.display()
    );
    let mut signature = recv_signature(chan).await?;
    signature.build_hash_table();

    debug!("Computing and sending delta for file '{}'", source.display());
    send_delta(chan, signature, source).await
}

async fn recv_signature<R, W>(chan: &mut FrameChannel<R, W>) -> Result<Signature, StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let message_size = chan.message_size();
    // Room for a whole frame plus whatever the job left unconsumed
    let mut bufs = Buffers::new(message_size * 2, message_size);
    let mut job = LoadSignatureJob::new();

    loop {
        // Receive only when a whole frame fits behind the leftovers
        if !bufs.eof_in() && bufs.in_capacity() - bufs.avail_in() >= message_size {
            let (n, eof) = chan.recv_into(bufs.spare_in()).await?;
            bufs.commit_in(n);
            if eof {
                bufs.set_eof_in();
            }
        }

        let before = bufs.avail_in();
        match job.iterate(&mut bufs) {
            Ok(JobStatus::Done) => break,
            Ok(JobStatus::Blocked) => {}
            Err(e) => {
                error!("Failed to iterate job for loading signature: {}", e);
                let _ = chan.send_error(!bufs.eof_in(), ERROR_INTERNAL_SERVER).await;
                return Err(e.into());
            }
        }

        let available = bufs.in_capacity() - bufs.avail_in();
        if bufs.avail_in() == before && (bufs.eof_in() || available < message_size) {
            error!(
                "Insufficient buffer capacity to receive file stream signature: {} of {} bytes available, but {} bytes is required to fit another message",
                available,
                bufs.in_capacity(),
                message_size
            );
            let _ = chan.send_error(!bufs.eof_in(), ERROR_INTERNAL_SERVER).await;
            return Err(StreamError::Capacity {
                available,
                capacity: bufs.in_capacity(),
                required: message_size,
            });
        }
    }

    match job.into_signature() {
        Some(signature) => Ok(signature),
        None => {
            let _ = chan.send_error(false, ERROR_INTERNAL_SERVER).await;
            Err(DeltaError::Truncated("signature header").into())
        }
    }
}

async fn send_delta<R, W>(
    chan: &mut FrameChannel<R, W>,
    signature: Signature,
    source: &Path,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut file = match File::open(source).await {
        Ok(file) => file,
        Err(e) => {
            error!(
                "Failed to open the source file '{}' for computing delta during file stream: {}",
                source.display(),
                e
            );
            let _ = chan.send_error(false, ERROR_INTERNAL_SERVER).await;
            return Err(StreamError::file("open", source, e));
        }
    };

    let message_size = chan.message_size();
    let mut bufs = Buffers::new(message_size, message_size);
    let mut job = DeltaJob::new(Arc::new(signature));

    loop {
        // A full window means the job is still draining output it owes
        if !bufs.eof_in() && bufs.avail_in() < bufs.in_capacity() {
            let n = match file.read(bufs.spare_in()).await {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        "Failed to read the source file '{}' during file stream: {}",
                        source.display(),
                        e
                    );
                    let _ = chan.send_error(false, ERROR_INTERNAL_SERVER).await;
                    return Err(StreamError::file("read", source, e));
                }
            };
            if n == 0 {
                bufs.set_eof_in();
            }
            bufs.commit_in(n);
        }

        let before = bufs.avail_in();
        let status = match job.iterate(&mut bufs) {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to iterate job for generating delta: {}", e);
                let _ = chan.send_error(false, ERROR_INTERNAL_SERVER).await;
                return Err(e.into());
            }
        };

        let done = status == JobStatus::Done;
        let progressed = bufs.avail_in() != before || !bufs.output().is_empty();
        if !bufs.output().is_empty() {
            chan.send_frame(bufs.output(), done).await?;
            bufs.clear_output();
        } else if done {
            chan.send_frame(&[], true).await?;
        }

        if done {
            return Ok(());
        }
        if !progressed && (bufs.eof_in() || bufs.avail_in() >= bufs.in_capacity()) {
            error!(
                "Insufficient buffer capacity to compute delta: {} of {} bytes available",
                bufs.in_capacity() - bufs.avail_in(),
                bufs.in_capacity()
            );
            let _ = chan.send_error(false, ERROR_INTERNAL_SERVER).await;
            return Err(StreamError::Capacity {
                available: bufs.in_capacity() - bufs.avail_in(),
                capacity: bufs.in_capacity(),
                required: 1,
            });
        }
    }
}
