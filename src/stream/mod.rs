//! File stream protocol: delta transfer of one file over a framed channel.
//!
//! The client ([`fetch`]) sends a signature of its basis, the server
//! ([`serve`]) answers with a delta against its source, and the client
//! patches the basis into a fresh destination file.

pub mod fetch;
pub mod frame;
pub mod serve;
pub mod sparse;

pub use fetch::fetch;
pub use frame::{message_size, Frame, FrameChannel, FrameFlags};
pub use serve::serve;
pub use sparse::SparseWriter;

#[cfg(test)]
use frame::{decode_header, encode_header};

/// Encode `payload` as data frames of at most `chunk` bytes, the last one
/// carrying EOF.
#[cfg(test)]
pub(crate) fn encode_frames(payload: &[u8], chunk: usize) -> Vec<u8> {
    let mut out = Vec::new();
    let mut parts = payload.chunks(chunk).peekable();
    if parts.peek().is_none() {
        out.extend_from_slice(&encode_header(0, FrameFlags::EOF));
    }
    while let Some(part) = parts.next() {
        let flags = if parts.peek().is_none() {
            FrameFlags::EOF
        } else {
            FrameFlags::empty()
        };
        out.extend_from_slice(&encode_header(part.len(), flags));
        out.extend_from_slice(part);
    }
    out
}

#[cfg(test)]
pub(crate) fn encode_error_frame(msg: &str) -> Vec<u8> {
    let mut out = encode_header(msg.len(), FrameFlags::ERR).to_vec();
    out.extend_from_slice(msg.as_bytes());
    out
}

/// Split raw bytes back into `(flags, payload)` frames.
#[cfg(test)]
pub(crate) fn parse_frames(mut raw: &[u8]) -> Vec<(FrameFlags, Vec<u8>)> {
    let mut out = Vec::new();
    while raw.len() >= 2 {
        let (len, flags) = decode_header([raw[0], raw[1]]);
        out.push((flags, raw[2..2 + len].to_vec()));
        raw = &raw[2 + len..];
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::delta::noise;
    use tempfile::TempDir;
    use tokio::io::duplex;

    /// Run a full transfer over an in-memory pipe and return the fetched bytes.
    async fn transfer(basis: &[u8], source: &[u8], max_buffer: usize) -> Vec<u8> {
        let tmp = TempDir::new().unwrap();
        let basis_path = tmp.path().join("basis");
        let source_path = tmp.path().join("source");
        let dest_path = tmp.path().join("dest");
        std::fs::write(&basis_path, basis).unwrap();
        std::fs::write(&source_path, source).unwrap();

        let (client_io, server_io) = duplex(8 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let mut client = FrameChannel::new(cr, cw, max_buffer);
        let mut server = FrameChannel::new(sr, sw, max_buffer);

        let (served, fetched) = tokio::join!(
            serve(&mut server, &source_path),
            fetch(&mut client, &basis_path, &dest_path, 0o644)
        );
        served.unwrap();
        fetched.unwrap();
        std::fs::read(&dest_path).unwrap()
    }

    #[tokio::test]
    async fn test_transfer_edge_cases() {
        let basis = noise(20_000, 11);
        let other = noise(9_000, 12);
        let mut superset = other.clone();
        superset.extend_from_slice(&basis);

        let subset = basis[3_000..15_000].to_vec();
        let empty: &[u8] = &[];
        let cases: Vec<(&[u8], &[u8])> = vec![
            (empty, empty),
            (empty, other.as_slice()),
            (basis.as_slice(), empty),
            (basis.as_slice(), basis.as_slice()),
            (basis.as_slice(), other.as_slice()),
            (basis.as_slice(), superset.as_slice()),
            (basis.as_slice(), subset.as_slice()),
        ];
        for (b, s) in cases {
            assert_eq!(transfer(b, s, 4096).await, s);
        }
    }

    #[tokio::test]
    async fn test_transfer_small_frames() {
        let basis = noise(5_000, 21);
        let mut source = basis.clone();
        source.splice(2_500..2_500, b"patched in".iter().copied());
        assert_eq!(transfer(&basis, &source, 64).await, source);
    }

    #[tokio::test]
    async fn test_transfer_sparse_source() {
        let mut source = vec![0u8; 100_000];
        source[..5].copy_from_slice(b"start");
        assert_eq!(transfer(b"", &source, 4096).await, source);
    }

    #[tokio::test]
    async fn test_refused_fetch_fails() {
        let tmp = TempDir::new().unwrap();
        let (client_io, server_io) = duplex(8 * 1024);
        let (cr, cw) = tokio::io::split(client_io);
        let (sr, sw) = tokio::io::split(server_io);
        let mut client = FrameChannel::new(cr, cw, 4096);
        let mut server = FrameChannel::new(sr, sw, 4096);

        let refuse = async {
            server.flush_stream().await.unwrap();
            server.refuse().await.unwrap();
        };
        let basis = tmp.path().join("basis");
        let dest = tmp.path().join("dest");
        let (_, fetched) = tokio::join!(refuse, fetch(&mut client, &basis, &dest, 0o600));
        assert!(matches!(
            fetched,
            Err(crate::error::StreamError::Remote(ref m)) if m == frame::ERROR_UNSPECIFIED_REFUSAL
        ));
        assert!(!dest.exists());
    }
}
