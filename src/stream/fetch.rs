//! Client side of a file stream: holds an outdated basis and wants the
//! up-to-date file written to a destination path.

use super::frame::{FrameChannel, ERROR_INTERNAL_CLIENT};
use super::sparse::SparseWriter;
use crate::delta::{sig_args, Buffers, Job, JobStatus, PatchJob, SignatureJob};
use crate::error::StreamError;
use std::io;
use std::path::Path;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite};
use tracing::{debug, error};

/// Fetch the server's file into `dest`, using `basis` as the delta basis.
///
/// A missing basis is created empty. `dest` is replaced: unlinked, then
/// created exclusively with permissions `mode`. On failure it is removed.
pub async fn fetch<R, W>(
    chan: &mut FrameChannel<R, W>,
    basis: &Path,
    dest: &Path,
    mode: u32,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Existing content is left alone
    if let Err(e) = open_options(mode).write(true).create(true).open(basis).await {
        debug!("Could not create basis file '{}': {}", basis.display(), e);
    }

    debug!(
        "Computing and sending signature of file '{}'",
        basis.display()
    );
    send_signature(chan, basis).await?;

    debug!(
        "Receiving delta and applying patch to file '{}'",
        dest.display()
    );
    let result = recv_delta(chan, basis, dest, mode).await;
    if result.is_err() {
        if let Err(e) = tokio::fs::remove_file(dest).await {
            if e.kind() != io::ErrorKind::NotFound {
                debug!(
                    "Failed to remove partial destination '{}': {}",
                    dest.display(),
                    e
                );
            }
        }
    }
    result
}

fn open_options(mode: u32) -> OpenOptions {
    let mut options = OpenOptions::new();
    #[cfg(unix)]
    options.mode(mode);
    #[cfg(not(unix))]
    let _ = mode;
    options
}

async fn send_signature<R, W>(chan: &mut FrameChannel<R, W>, basis: &Path) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut file = match File::open(basis).await {
        Ok(file) => file,
        Err(e) => {
            error!(
                "Failed to open the basis file '{}' for computing delta during file stream: {}",
                basis.display(),
                e
            );
            let _ = chan.send_error(false, ERROR_INTERNAL_CLIENT).await;
            return Err(StreamError::file("open", basis, e));
        }
    };

    // Unknown sizes (pipes, devices) get the default parameters
    let size = match file.metadata().await {
        Ok(meta) if meta.is_file() => Some(meta.len()),
        _ => None,
    };
    let mut job = match SignatureJob::new(sig_args(size)) {
        Ok(job) => job,
        Err(e) => {
            error!("Failed to begin job for generating signature: {}", e);
            let _ = chan.send_error(false, ERROR_INTERNAL_CLIENT).await;
            return Err(e.into());
        }
    };

    let message_size = chan.message_size();
    let mut bufs = Buffers::new(message_size, message_size);

    loop {
        // A full window means the job is still draining output it owes
        if !bufs.eof_in() && bufs.avail_in() < bufs.in_capacity() {
            let n = match file.read(bufs.spare_in()).await {
                Ok(n) => n,
                Err(e) => {
                    error!(
                        "Failed to read the basis file '{}' during file stream: {}",
                        basis.display(),
                        e
                    );
                    let _ = chan.send_error(false, ERROR_INTERNAL_CLIENT).await;
                    return Err(StreamError::file("read", basis, e));
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
                error!("Failed to iterate job for generating signature: {}", e);
                let _ = chan.send_error(false, ERROR_INTERNAL_CLIENT).await;
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
                "Insufficient buffer capacity to compute signature: {} of {} bytes available",
                bufs.in_capacity() - bufs.avail_in(),
                bufs.in_capacity()
            );
            let _ = chan.send_error(false, ERROR_INTERNAL_CLIENT).await;
            return Err(StreamError::Capacity {
                available: bufs.in_capacity() - bufs.avail_in(),
                capacity: bufs.in_capacity(),
                required: 1,
            });
        }
    }
}

async fn recv_delta<R, W>(
    chan: &mut FrameChannel<R, W>,
    basis: &Path,
    dest: &Path,
    mode: u32,
) -> Result<(), StreamError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // The server is only sending from here on, so local failures drain
    // its stream instead of answering with an error frame.
    if let Err(e) = tokio::fs::remove_file(dest).await {
        if e.kind() != io::ErrorKind::NotFound {
            debug!("Failed to unlink '{}' before fetch: {}", dest.display(), e);
        }
    }
    let file = match open_options(mode).write(true).create_new(true).open(dest).await {
        Ok(file) => file,
        Err(e) => {
            error!(
                "Failed to open/create destination file '{}': {}",
                dest.display(),
                e
            );
            let _ = chan.flush_stream().await;
            return Err(StreamError::file("create", dest, e));
        }
    };

    // Copy commands seek around the basis; the patch job reads it synchronously
    let old = match std::fs::File::open(basis) {
        Ok(old) => old,
        Err(e) => {
            error!("Failed to open basis file '{}': {}", basis.display(), e);
            let _ = chan.flush_stream().await;
            return Err(StreamError::file("open", basis, e));
        }
    };

    let message_size = chan.message_size();
    let mut bufs = Buffers::new(message_size * 2, message_size);
    let mut job = PatchJob::new(old);
    let mut out = SparseWriter::new(file);

    loop {
        // Receive only when a whole frame fits behind the leftovers
        if !bufs.eof_in() && bufs.in_capacity() - bufs.avail_in() >= message_size {
            // Connection is unusable after a failed receive: no flush
            let (n, eof) = chan.recv_into(bufs.spare_in()).await?;
            bufs.commit_in(n);
            if eof {
                bufs.set_eof_in();
            }
        }

        let before = bufs.avail_in();
        let status = match job.iterate(&mut bufs) {
            Ok(status) => status,
            Err(e) => {
                error!("Failed to iterate job for patching: {}", e);
                if !bufs.eof_in() {
                    let _ = chan.flush_stream().await;
                }
                return Err(e.into());
            }
        };

        let progressed = bufs.avail_in() != before || !bufs.output().is_empty();
        if !bufs.output().is_empty() {
            if let Err(e) = out.write(bufs.output()).await {
                error!(
                    "Failed to write to destination file '{}' during file stream: {}",
                    dest.display(),
                    e
                );
                if !bufs.eof_in() {
                    let _ = chan.flush_stream().await;
                }
                return Err(StreamError::file("write", dest, e));
            }
            bufs.clear_output();
        }

        if status == JobStatus::Done {
            break;
        }

        let available = bufs.in_capacity() - bufs.avail_in();
        if !progressed && (bufs.eof_in() || available < message_size) {
            error!(
                "Insufficient buffer capacity to receive file stream delta: {} of {} bytes available, but {} bytes is required to fit another message",
                available,
                bufs.in_capacity(),
                message_size
            );
            if !bufs.eof_in() {
                let _ = chan.flush_stream().await;
            }
            return Err(StreamError::Capacity {
                available,
                capacity: bufs.in_capacity(),
                required: message_size,
            });
        }
    }

    out.close()
        .await
        .map_err(|e| StreamError::file("close", dest, e))
}
