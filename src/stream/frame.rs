//! Frame layer of the file stream protocol.
//!
//! Wire format: a 2-byte big-endian header followed by `len` payload bytes.
//!
//! ```text
//!  15            4   3   2   1     0
//! +---------------+-------+-----+-----+
//! |      len      |  rsv  | EOF | ERR |
//! +---------------+-------+-----+-----+
//! ```
//!
//! An ERR frame carries a human-readable message and always fails the
//! receive. No version or magic: the enclosing session negotiates that.

use crate::error::StreamError;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{error, trace, warn};

pub const HEADER_SIZE: usize = 2;

/// Largest payload the 12-bit length field can carry.
pub const MAX_PAYLOAD: usize = 4095;

pub const ERROR_UNSPECIFIED_REFUSAL: &str = "Unspecified server refusal";
pub const ERROR_INTERNAL_SERVER: &str = "Internal server error";
pub const ERROR_INTERNAL_CLIENT: &str = "Internal client error";

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u16 {
        const ERR = 1 << 0;
        const EOF = 1 << 1;
    }
}

/// Payload cap for a transport whose buffers hold `max_buffer_size` bytes.
pub fn message_size(max_buffer_size: usize) -> usize {
    max_buffer_size.saturating_sub(1).min(MAX_PAYLOAD)
}

pub fn encode_header(len: usize, flags: FrameFlags) -> [u8; HEADER_SIZE] {
    assert!(len <= MAX_PAYLOAD, "frame payload of {} bytes", len);
    (((len as u16) << 4) | flags.bits()).to_be_bytes()
}

/// Returns `(len, flags)`. Reserved bits are ignored.
pub fn decode_header(header: [u8; HEADER_SIZE]) -> (usize, FrameFlags) {
    let raw = u16::from_be_bytes(header);
    ((raw >> 4) as usize, FrameFlags::from_bits_truncate(raw))
}

/// A received data frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub payload: Bytes,
    pub eof: bool,
}

/// Framed, flow-controlled view of a bidirectional byte stream.
pub struct FrameChannel<R, W> {
    reader: R,
    writer: W,
    message_size: usize,
    scratch: Vec<u8>,
}

impl<R, W> FrameChannel<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    pub fn new(reader: R, writer: W, max_buffer_size: usize) -> Self {
        let message_size = message_size(max_buffer_size);
        Self {
            reader,
            writer,
            message_size,
            scratch: vec![0u8; message_size],
        }
    }

    pub fn message_size(&self) -> usize {
        self.message_size
    }

    pub fn into_inner(self) -> (R, W) {
        (self.reader, self.writer)
    }

    async fn send_raw(&mut self, payload: &[u8], flags: FrameFlags) -> Result<(), StreamError> {
        assert!(
            payload.len() <= self.message_size,
            "frame payload of {} bytes exceeds message size {}",
            payload.len(),
            self.message_size
        );

        let header = encode_header(payload.len(), flags);
        let sent = write_full(&mut self.writer, &header).await?;
        if sent != HEADER_SIZE {
            error!(
                "Failed to send message header during file stream: expected {} bytes, sent {}",
                HEADER_SIZE, sent
            );
            return Err(StreamError::Short {
                what: "frame header",
                expected: HEADER_SIZE,
                actual: sent,
            });
        }

        if !payload.is_empty() {
            let sent = write_full(&mut self.writer, payload).await?;
            if sent != payload.len() {
                error!(
                    "Failed to send message payload during file stream: expected {} bytes, sent {}",
                    payload.len(),
                    sent
                );
                return Err(StreamError::Short {
                    what: "frame payload",
                    expected: payload.len(),
                    actual: sent,
                });
            }
        }

        self.writer.flush().await.map_err(StreamError::Transport)?;
        trace!(len = payload.len(), ?flags, "sent frame");
        Ok(())
    }

    /// Send a data frame. `eof` marks the last frame of a transaction.
    pub async fn send_frame(&mut self, payload: &[u8], eof: bool) -> Result<(), StreamError> {
        let flags = if eof {
            FrameFlags::EOF
        } else {
            FrameFlags::empty()
        };
        self.send_raw(payload, flags).await
    }

    /// Receive one frame into `buf`, returning `(len, eof)`.
    ///
    /// An error frame from the peer is logged and returned as
    /// [`StreamError::Remote`] whatever its EOF flag says.
    pub async fn recv_into(&mut self, buf: &mut [u8]) -> Result<(usize, bool), StreamError> {
        let mut header = [0u8; HEADER_SIZE];
        let got = read_full(&mut self.reader, &mut header).await?;
        if got != HEADER_SIZE {
            error!(
                "Failed to receive message header during file stream: expected {} bytes, received {}",
                HEADER_SIZE, got
            );
            return Err(StreamError::Short {
                what: "frame header",
                expected: HEADER_SIZE,
                actual: got,
            });
        }

        let (len, flags) = decode_header(header);
        if len > self.message_size {
            error!(
                "Received frame of {} bytes, but maximum message size is {}",
                len, self.message_size
            );
            return Err(StreamError::FrameTooLarge {
                len,
                max: self.message_size,
            });
        }

        let payload = &mut self.scratch[..len];
        let got = read_full(&mut self.reader, payload).await?;
        if got != len {
            error!(
                "Failed to receive message payload during file stream: expected {} bytes, received {}",
                len, got
            );
            return Err(StreamError::Short {
                what: "frame payload",
                expected: len,
                actual: got,
            });
        }

        if flags.contains(FrameFlags::ERR) {
            let msg = String::from_utf8_lossy(payload).into_owned();
            error!("Remote file stream error: {}", msg);
            return Err(StreamError::Remote(msg));
        }

        if buf.len() < len {
            return Err(StreamError::Capacity {
                available: buf.len(),
                capacity: buf.len(),
                required: len,
            });
        }
        buf[..len].copy_from_slice(payload);

        let eof = flags.contains(FrameFlags::EOF);
        trace!(len, eof, "received frame");
        Ok((len, eof))
    }

    pub async fn recv_frame(&mut self) -> Result<Frame, StreamError> {
        let mut buf = BytesMut::zeroed(self.message_size);
        let (len, eof) = self.recv_into(&mut buf).await?;
        buf.truncate(len);
        Ok(Frame {
            payload: buf.freeze(),
            eof,
        })
    }

    /// Drain the peer's frames up to and including the EOF frame.
    ///
    /// Used before sending our own error so a peer blocked on writing can
    /// finish and go on to read it.
    pub async fn flush_stream(&mut self) -> Result<(), StreamError> {
        let mut sink = vec![0u8; self.message_size];
        loop {
            let (_, eof) = self.recv_into(&mut sink).await?;
            if eof {
                return Ok(());
            }
        }
    }

    /// Send an error frame, first draining the peer's stream when `flush`
    /// is set. Messages longer than the message size are cut and end in `...`.
    pub async fn send_error(&mut self, flush: bool, msg: &str) -> Result<(), StreamError> {
        let mut payload = msg.as_bytes().to_vec();
        if payload.len() > self.message_size {
            warn!(
                "Error message truncated during file stream: message is {} bytes, but maximum message size is {} bytes",
                payload.len(),
                self.message_size
            );
            payload.truncate(self.message_size);
            let dots = self.message_size.min(3);
            let at = self.message_size - dots;
            payload[at..].fill(b'.');
        }

        if flush {
            // Already logged; the error frame is still worth sending
            let _ = self.flush_stream().await;
        }

        self.send_raw(&payload, FrameFlags::ERR).await
    }

    /// Refuse a transfer without further explanation.
    pub async fn refuse(&mut self) -> Result<(), StreamError> {
        self.send_error(false, ERROR_UNSPECIFIED_REFUSAL).await
    }
}

/// Read until `buf` is full or the stream ends. Returns the count read.
async fn read_full<R: AsyncRead + Unpin>(reader: &mut R, buf: &mut [u8]) -> Result<usize, StreamError> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader
            .read(&mut buf[filled..])
            .await
            .map_err(StreamError::Transport)?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

async fn write_full<W: AsyncWrite + Unpin>(writer: &mut W, buf: &[u8]) -> Result<usize, StreamError> {
    let mut sent = 0;
    while sent < buf.len() {
        let n = writer
            .write(&buf[sent..])
            .await
            .map_err(StreamError::Transport)?;
        if n == 0 {
            break;
        }
        sent += n;
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;
    use tokio::io::{duplex, DuplexStream, ReadHalf, WriteHalf};

    type Half = FrameChannel<ReadHalf<DuplexStream>, WriteHalf<DuplexStream>>;

    fn pair(max_buffer: usize) -> (Half, Half) {
        let (a, b) = duplex(64 * 1024);
        let (ar, aw) = tokio::io::split(a);
        let (br, bw) = tokio::io::split(b);
        (
            FrameChannel::new(ar, aw, max_buffer),
            FrameChannel::new(br, bw, max_buffer),
        )
    }

    #[test]
    fn test_header_layout() {
        assert_eq!(encode_header(0, FrameFlags::EOF), [0x00, 0x02]);
        assert_eq!(encode_header(1, FrameFlags::ERR), [0x00, 0x11]);
        assert_eq!(
            encode_header(MAX_PAYLOAD, FrameFlags::ERR | FrameFlags::EOF),
            [0xff, 0xf3]
        );
        assert_eq!(decode_header([0x01, 0x0e]), (16, FrameFlags::EOF));
    }

    #[test]
    fn test_message_size() {
        assert_eq!(message_size(4096), 4095);
        assert_eq!(message_size(1 << 20), MAX_PAYLOAD);
        assert_eq!(message_size(100), 99);
    }

    #[tokio::test]
    async fn test_error_frame_fails_receive() {
        let (mut a, mut b) = pair(4096);
        a.send_raw(b"boom", FrameFlags::ERR | FrameFlags::EOF)
            .await
            .unwrap();
        match b.recv_frame().await {
            Err(StreamError::Remote(msg)) => assert_eq!(msg, "boom"),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (x, y) = duplex(1024);
        let (_xr, mut xw) = tokio::io::split(x);
        let (yr, yw) = tokio::io::split(y);
        xw.write_all(&encode_header(100, FrameFlags::empty()))
            .await
            .unwrap();
        xw.write_all(&[7u8; 100]).await.unwrap();

        let mut rx = FrameChannel::new(yr, yw, 16);
        assert!(matches!(
            rx.recv_frame().await,
            Err(StreamError::FrameTooLarge { len: 100, max: 15 })
        ));
    }

    #[tokio::test]
    async fn test_short_header() {
        let (x, y) = duplex(16);
        let (_, mut xw) = tokio::io::split(x);
        let (yr, yw) = tokio::io::split(y);
        xw.write_all(&[0x00]).await.unwrap();
        drop(xw);

        let mut rx = FrameChannel::new(yr, yw, 4096);
        assert!(matches!(
            rx.recv_frame().await,
            Err(StreamError::Short {
                what: "frame header",
                actual: 1,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_error_message_truncated() {
        let (mut a, mut b) = pair(11);
        a.send_error(false, "a very long error message").await.unwrap();
        match b.recv_frame().await {
            Err(StreamError::Remote(msg)) => assert_eq!(msg, "a very ..."),
            other => panic!("expected remote error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_refuse() {
        let (mut a, mut b) = pair(4096);
        a.refuse().await.unwrap();
        match b.recv_frame().await {
            Err(StreamError::Remote(msg)) => assert_eq!(msg, ERROR_UNSPECIFIED_REFUSAL),
            other => panic!("expected refusal, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_flush_before_error() {
        // The peer still has a transaction in flight, then starts another
        let mut incoming = Vec::new();
        for i in 0..5u8 {
            incoming.extend_from_slice(&encode_header(100, FrameFlags::empty()));
            incoming.extend_from_slice(&[i; 100]);
        }
        incoming.extend_from_slice(&encode_header(0, FrameFlags::EOF));
        let flushed = incoming.len();
        incoming.extend_from_slice(&encode_header(3, FrameFlags::empty()));
        incoming.extend_from_slice(b"new");

        let mut chan = FrameChannel::new(Cursor::new(incoming), Vec::new(), 4096);
        chan.send_error(true, "local failure").await.unwrap();

        let (reader, written) = chan.into_inner();
        assert_eq!(reader.position() as usize, flushed);
        let mut expected = encode_header(13, FrameFlags::ERR).to_vec();
        expected.extend_from_slice(b"local failure");
        assert_eq!(written, expected);
    }

    #[tokio::test]
    async fn test_error_without_flush_reads_nothing() {
        let incoming = [encode_header(0, FrameFlags::EOF).to_vec()].concat();
        let mut chan = FrameChannel::new(Cursor::new(incoming), Vec::new(), 4096);
        chan.send_error(false, "x").await.unwrap();
        let (reader, _) = chan.into_inner();
        assert_eq!(reader.position(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_frame_roundtrip(
            payload in proptest::collection::vec(any::<u8>(), 0..=MAX_PAYLOAD),
            eof in any::<bool>(),
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let got = rt.block_on(async {
                let (mut a, mut b) = pair(8192);
                a.send_frame(&payload, eof).await.unwrap();
                b.recv_frame().await.unwrap()
            });
            prop_assert_eq!(got.payload.as_ref(), payload.as_slice());
            prop_assert_eq!(got.eof, eof);
        }
    }
}
