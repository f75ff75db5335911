// ABOUTME: Framed Stream (C2) - size-prefixed reads and writes over a single TCP connection
// ABOUTME: Serializes writes and performs the two-phase (size, then body) inbound read

use crate::codec::{self, Payload, HEADER_SIZE};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Default cap on a declared body size; guards against a malicious or
/// corrupt size header causing an unbounded allocation.
pub const DEFAULT_MAX_PAYLOAD_SIZE: u64 = 1024 * 1024;

/// Errors from the framed read/write path.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The underlying socket reported an I/O failure.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection mid-frame (a partial read).
    #[error("connection reset mid-frame")]
    ResetMidFrame,

    /// A declared body size exceeded the configured cap.
    #[error("declared payload size {declared} exceeds cap {cap}")]
    PayloadTooLarge { declared: u64, cap: u64 },
}

/// Split a connected socket into a read half and a write half, each
/// independently driveable by the session's reader and writer tasks.
pub fn split(socket: TcpStream) -> (FrameReader, FrameWriter) {
    split_with_max_payload_size(socket, DEFAULT_MAX_PAYLOAD_SIZE)
}

/// Like [`split`], with an explicit payload size cap on the reader.
pub fn split_with_max_payload_size(
    socket: TcpStream,
    max_payload_size: u64,
) -> (FrameReader, FrameWriter) {
    let (read_half, write_half) = socket.into_split();
    (
        FrameReader {
            stream: read_half,
            max_payload_size,
        },
        FrameWriter {
            stream: BufWriter::new(write_half),
        },
    )
}

/// Owns the read half of a session's socket. At most one `read_size`/
/// `read_body` call is outstanding at a time, enforced structurally by the
/// session's single inbound loop task owning this value.
#[derive(Debug)]
pub struct FrameReader {
    stream: OwnedReadHalf,
    max_payload_size: u64,
}

impl FrameReader {
    /// Read exactly [`HEADER_SIZE`] bytes and decode the declared body size.
    ///
    /// Returns `Ok(None)` if the peer closed the connection cleanly before
    /// any header bytes arrived; a partial header is [`FrameError::ResetMidFrame`].
    pub async fn read_size(&mut self) -> Result<Option<u64>, FrameError> {
        let mut header = [0u8; HEADER_SIZE];
        match read_exact_or_eof(&mut self.stream, &mut header).await? {
            ReadOutcome::Eof => Ok(None),
            ReadOutcome::PartialEof => Err(FrameError::ResetMidFrame),
            ReadOutcome::Full => {
                let size = codec::decode_header(&header);
                if size > self.max_payload_size {
                    return Err(FrameError::PayloadTooLarge {
                        declared: size,
                        cap: self.max_payload_size,
                    });
                }
                Ok(Some(size))
            }
        }
    }

    /// Read exactly `n` bytes and construct a [`Payload`] from them.
    pub async fn read_body(&mut self, n: u64) -> Result<Payload, FrameError> {
        let mut body = vec![0u8; n as usize];
        self.stream.read_exact(&mut body).await?;
        Ok(Payload::from_bytes(body))
    }
}

/// Owns the write half of a session's socket. All writes are strictly
/// serialized: the session's single writer task is the only caller.
#[derive(Debug)]
pub struct FrameWriter {
    stream: BufWriter<OwnedWriteHalf>,
}

impl FrameWriter {
    /// Write `encode_header(payload.size()) || payload.raw_view()` and flush.
    pub async fn write_frame(&mut self, payload: &Payload) -> Result<(), FrameError> {
        let header = codec::encode_header(payload.size() as u64);
        self.stream.write_all(&header).await?;
        self.stream.write_all(payload.raw_view()).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Shut down the write half of the underlying socket.
    pub async fn shutdown(&mut self) -> Result<(), FrameError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

enum ReadOutcome {
    Full,
    Eof,
    PartialEof,
}

/// Like `AsyncReadExt::read_exact`, but distinguishes "closed before any
/// bytes" (clean EOF between frames) from "closed after some bytes" (a
/// peer that died mid-frame), matching §4.2's failure semantics.
async fn read_exact_or_eof<R: AsyncRead + Unpin>(
    stream: &mut R,
    buf: &mut [u8],
) -> Result<ReadOutcome, io::Error> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = stream.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Ok(if filled == 0 {
                ReadOutcome::Eof
            } else {
                ReadOutcome::PartialEof
            });
        }
        filled += n;
    }
    Ok(ReadOutcome::Full)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::{TcpListener, TcpStream};

    async fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn write_then_read_round_trips_a_frame() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (_server_reader, mut server_writer) = split(server_sock);
        let (mut client_reader, _client_writer) = split(client_sock);

        let mut payload = Payload::new();
        payload.push_str("hello");

        server_writer.write_frame(&payload).await.unwrap();

        let size = client_reader.read_size().await.unwrap().unwrap();
        let mut body = client_reader.read_body(size).await.unwrap();
        assert_eq!(body.pop_string().unwrap(), "hello");
    }

    #[tokio::test]
    async fn clean_close_between_frames_is_none() {
        let (server_sock, client_sock) = loopback_pair().await;
        drop(server_sock);
        let (mut client_reader, _client_writer) = split(client_sock);
        assert!(client_reader.read_size().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn oversized_declared_length_is_rejected() {
        let (server_sock, client_sock) = loopback_pair().await;
        let (_server_reader, mut server_writer) = split(server_sock);
        let (mut client_reader, _client_writer) = split(client_sock);

        let oversized = Payload::from_bytes(vec![0u8; 0]);
        // Write a header only, declaring more bytes than the cap allows.
        use tokio::io::AsyncWriteExt;
        server_writer
            .stream
            .write_all(&codec::encode_header(DEFAULT_MAX_PAYLOAD_SIZE + 1))
            .await
            .unwrap();
        server_writer.stream.flush().await.unwrap();
        let _ = oversized;

        let err = client_reader.read_size().await.unwrap_err();
        assert!(matches!(err, FrameError::PayloadTooLarge { .. }));
    }
}
