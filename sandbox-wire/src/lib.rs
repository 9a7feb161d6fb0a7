//! The on-the-wire framing used between a manager and its workers.
//!
//! A frame is exactly:
//!
//! ```text
//!  kind  : u8           message kind, meaning defined by the layer above
//!  id    : u64 LE       correlation id, 0 for frames that never expect a reply
//!  body  : opaque       caller-defined payload bytes
//!  bound : 10 bytes     fixed delimiter, see [`DELIMITER`]
//! ```
//!
//! The delimiter is a resynchronization marker, not a length prefix: a
//! [`FrameReader`] always scans forward for it, so a body that failed to
//! parse one layer up still leaves the stream positioned at the next frame
//! boundary. This crate only deals in raw bytes; it does not know what a
//! `kind` byte means or how to interpret a body.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tracing::trace;

/// Fixed 10-byte marker appended after every frame body, in either direction.
pub const DELIMITER: [u8; 10] = [0x79, 0x8E, 0x8E, 0xF5, 0x6E, 0x9B, 0x2E, 0x97, 0xD5, 0x7D];

/// Size of the user-space write buffer used to coalesce the small writes a
/// typical serializer emits (header, body, delimiter) into fewer syscalls.
const WRITE_BUF_CAPACITY: usize = 64 * 1024;

/// Chunk size used when pulling more bytes off the stream while scanning for
/// the next frame boundary.
const READ_CHUNK: usize = 4096;

/// Outcome of a single [`FrameReader::read_frame`] call.
#[derive(Debug)]
pub enum ReadOutcome {
    /// A complete frame was read and the delimiter consumed.
    Frame {
        kind: u8,
        id: u64,
        body: Vec<u8>,
    },
    /// The stream closed cleanly before any bytes of a new frame arrived.
    Closed,
}

/// Reads frames off a byte stream.
///
/// Not `Clone`/`Send`-shareable by design: per §5 of the protocol, exactly
/// one task ever owns the read half of a worker's connection.
pub struct FrameReader<R> {
    inner: R,
    /// Bytes read off the wire that have not yet been attributed to a frame.
    buf: Vec<u8>,
}

impl<R> FrameReader<R>
where
    R: AsyncRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            buf: Vec::new(),
        }
    }

    /// Pull more bytes from the stream into `self.buf`. Returns the number of
    /// bytes read, which is zero only on a clean EOF.
    async fn fill_more(&mut self) -> io::Result<usize> {
        let mut scratch = [0u8; READ_CHUNK];
        let n = self.inner.read(&mut scratch).await?;
        self.buf.extend_from_slice(&scratch[..n]);
        Ok(n)
    }

    /// Read a single frame.
    ///
    /// Phase 1 (kind) treats a zero-byte read as a clean close. Phase 2 (id)
    /// and phase 3 (body+delimiter) treat a zero-byte read as a fatal,
    /// mid-frame protocol error, since the peer committed to sending a full
    /// frame once it wrote the kind byte.
    pub async fn read_frame(&mut self) -> io::Result<ReadOutcome> {
        while self.buf.is_empty() {
            if self.fill_more().await? == 0 {
                return Ok(ReadOutcome::Closed);
            }
        }

        while self.buf.len() < 9 {
            if self.fill_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-header after kind byte was read",
                ));
            }
        }

        let kind = self.buf[0];
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(&self.buf[1..9]);
        let id = u64::from_le_bytes(id_bytes);

        loop {
            if let Some(pos) = find_delimiter(&self.buf[9..]) {
                let body_end = 9 + pos;
                let body = self.buf[9..body_end].to_vec();
                let consumed = body_end + DELIMITER.len();
                self.buf.drain(0..consumed);
                trace!(kind, id, body_len = body.len(), "read frame");
                return Ok(ReadOutcome::Frame { kind, id, body });
            }

            if self.fill_more().await? == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid-body, before the delimiter was found",
                ));
            }
        }
    }
}

fn find_delimiter(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(DELIMITER.len())
        .position(|w| w == DELIMITER)
}

/// Writes frames to a byte stream.
///
/// Wraps the stream in a user-space buffer so the several small writes that
/// make up one frame (header, body, delimiter) become one syscall on flush.
/// Callers are responsible for serializing concurrent writers (see
/// `sandbox-manager`'s worker handle, which holds this behind a lock so that
/// frame bytes from distinct requests never interleave).
pub struct FrameWriter<W> {
    inner: BufWriter<W>,
}

impl<W> FrameWriter<W>
where
    W: AsyncWrite + Unpin,
{
    pub fn new(inner: W) -> Self {
        Self {
            inner: BufWriter::with_capacity(WRITE_BUF_CAPACITY, inner),
        }
    }

    /// Write one frame and flush it to the underlying stream.
    pub async fn write_frame(&mut self, kind: u8, id: u64, body: &[u8]) -> io::Result<()> {
        self.inner.write_u8(kind).await?;
        self.inner.write_all(&id.to_le_bytes()).await?;
        self.inner.write_all(body).await?;
        self.inner.write_all(&DELIMITER).await?;
        self.inner.flush().await?;
        trace!(kind, id, body_len = body.len(), "wrote frame");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn round_trips_a_frame() {
        let (client, server) = duplex(4096);
        let (_rx_c, tx_c) = tokio::io::split(client);
        let (rx_s, _tx_s) = tokio::io::split(server);

        let mut writer = FrameWriter::new(tx_c);
        let mut reader = FrameReader::new(rx_s);

        writer.write_frame(0x01, 42, b"hello world").await.unwrap();

        match reader.read_frame().await.unwrap() {
            ReadOutcome::Frame { kind, id, body } => {
                assert_eq!(kind, 0x01);
                assert_eq!(id, 42);
                assert_eq!(body, b"hello world");
            }
            ReadOutcome::Closed => panic!("expected a frame"),
        }
    }

    #[tokio::test]
    async fn reads_several_frames_from_one_stream() {
        let (client, server) = duplex(4096);
        let (_rx_c, tx_c) = tokio::io::split(client);
        let (rx_s, _tx_s) = tokio::io::split(server);

        let mut writer = FrameWriter::new(tx_c);
        let mut reader = FrameReader::new(rx_s);

        for i in 0..5u64 {
            writer.write_frame(0x50, i, &i.to_le_bytes()).await.unwrap();
        }

        for i in 0..5u64 {
            match reader.read_frame().await.unwrap() {
                ReadOutcome::Frame { kind, id, body } => {
                    assert_eq!(kind, 0x50);
                    assert_eq!(id, i);
                    assert_eq!(body, i.to_le_bytes());
                }
                ReadOutcome::Closed => panic!("expected a frame"),
            }
        }
    }

    #[tokio::test]
    async fn resyncs_after_a_body_that_happens_to_contain_no_delimiter() {
        // The codec doesn't validate bodies; it only guarantees it can find
        // the next delimiter. Bodies containing arbitrary (non-delimiter)
        // bytes, including ones a higher layer will fail to deserialize,
        // must not desync subsequent reads.
        let (client, server) = duplex(4096);
        let (_rx_c, tx_c) = tokio::io::split(client);
        let (rx_s, _tx_s) = tokio::io::split(server);

        let mut writer = FrameWriter::new(tx_c);
        let mut reader = FrameReader::new(rx_s);

        writer.write_frame(0x51, 1, b"\x00\x01garbage-not-a-real-payload").await.unwrap();
        writer.write_frame(0x50, 2, b"ok").await.unwrap();

        let ReadOutcome::Frame { id, body, .. } = reader.read_frame().await.unwrap() else {
            panic!("expected frame 1");
        };
        assert_eq!(id, 1);
        assert_eq!(body, b"\x00\x01garbage-not-a-real-payload");

        let ReadOutcome::Frame { id, body, .. } = reader.read_frame().await.unwrap() else {
            panic!("expected frame 2");
        };
        assert_eq!(id, 2);
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn clean_close_before_any_frame() {
        let (client, server) = duplex(4096);
        drop(client);
        let (rx_s, _tx_s) = tokio::io::split(server);
        let mut reader = FrameReader::new(rx_s);
        match reader.read_frame().await.unwrap() {
            ReadOutcome::Closed => {}
            ReadOutcome::Frame { .. } => panic!("expected a clean close"),
        }
    }

    #[tokio::test]
    async fn mid_frame_close_is_fatal() {
        let (client, server) = duplex(4096);
        let (_rx_c, mut tx_c) = tokio::io::split(client);
        let (rx_s, _tx_s) = tokio::io::split(server);
        tx_c.write_all(&[0x01]).await.unwrap();
        tx_c.shutdown().await.unwrap();
        drop(tx_c);

        let mut reader = FrameReader::new(rx_s);
        let err = reader.read_frame().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
