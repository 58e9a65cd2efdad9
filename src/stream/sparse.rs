//! Writer that turns runs of zeros into holes.

use std::io::{self, SeekFrom};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Wraps a freshly created file. All-zero chunks are skipped with a seek,
/// so on filesystems that support it they never get allocated.
pub struct SparseWriter {
    file: File,
    pos: u64,
    trailing_hole: bool,
}

impl SparseWriter {
    pub fn new(file: File) -> Self {
        Self {
            file,
            pos: 0,
            trailing_hole: false,
        }
    }

    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        if chunk.iter().all(|&b| b == 0) {
            self.file
                .seek(SeekFrom::Current(chunk.len() as i64))
                .await?;
            self.trailing_hole = true;
        } else {
            self.file.write_all(chunk).await?;
            self.trailing_hole = false;
        }
        self.pos += chunk.len() as u64;
        Ok(())
    }

    /// Bytes logically written so far.
    pub fn len(&self) -> u64 {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.pos == 0
    }

    /// Flush and close. A hole at the end only moved the offset, so the
    /// file is extended to its full length first.
    pub async fn close(mut self) -> io::Result<()> {
        if self.trailing_hole {
            self.file.set_len(self.pos).await?;
        }
        self.file.flush().await?;
        self.file.sync_all().await
    }
}
