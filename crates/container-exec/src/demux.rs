//! Framing of combined stdout/stderr streams
//!
//! Without a terminal, a backend delivers stdout and stderr over a single
//! attached stream. How the two are told apart is backend specific, so the
//! decoder is a [`Demultiplexer`] chosen by the backend.
//!
//! [`StdCopy`] decodes the Docker convention: every frame starts with an
//! 8 byte header `[stream, 0, 0, 0, len (u32, big endian)]` followed by `len`
//! bytes of payload.

use std::io;

use async_trait::async_trait;
use futures::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a frame header
pub const FRAME_HEADER_LEN: usize = 8;

/// The stream a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StreamType {
    /// Echoed stdin, delivered to stdout
    Stdin = 0,
    /// Standard output
    Stdout = 1,
    /// Standard error
    Stderr = 2,
    /// An error reported by the backend itself
    SystemErr = 3,
}

impl TryFrom<u8> for StreamType {
    type Error = io::Error;

    fn try_from(value: u8) -> io::Result<Self> {
        match value {
            0 => Ok(StreamType::Stdin),
            1 => Ok(StreamType::Stdout),
            2 => Ok(StreamType::Stderr),
            3 => Ok(StreamType::SystemErr),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unrecognized stream: {}", other),
            )),
        }
    }
}

/// Splits a combined stream into stdout and stderr
#[async_trait]
pub trait Demultiplexer: Send + Sync {
    /// Copy `src` to `stdout` and `stderr` until EOF.
    ///
    /// Returns the number of payload bytes written.
    async fn demux(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> io::Result<u64>;
}

/// Decoder for Docker's multiplexed stream format
#[derive(Debug, Clone, Copy, Default)]
pub struct StdCopy;

#[async_trait]
impl Demultiplexer for StdCopy {
    async fn demux(
        &self,
        src: &mut (dyn AsyncRead + Send + Unpin),
        stdout: &mut (dyn AsyncWrite + Send + Unpin),
        stderr: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> io::Result<u64> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        let mut written = 0u64;

        while read_header(src, &mut header).await? {
            let stream = StreamType::try_from(header[0])?;
            let len = u64::from(u32::from_be_bytes([header[4], header[5], header[6], header[7]]));
            // The header's length is untrusted; payloads are streamed, never preallocated.
            let mut payload = (&mut *src).take(len);

            let copied = match stream {
                StreamType::Stdin | StreamType::Stdout => futures::io::copy(&mut payload, &mut *stdout).await?,
                StreamType::Stderr => futures::io::copy(&mut payload, &mut *stderr).await?,
                StreamType::SystemErr => {
                    let mut message = Vec::new();
                    payload.read_to_end(&mut message).await?;
                    return Err(io::Error::other(format!(
                        "error from daemon in stream: {}",
                        String::from_utf8_lossy(&message)
                    )));
                }
            };
            if copied < len {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame payload",
                ));
            }
            written += copied;
        }
        Ok(written)
    }
}

/// Fill `header`, returning false on EOF before the first byte.
async fn read_header(
    src: &mut (dyn AsyncRead + Send + Unpin),
    header: &mut [u8; FRAME_HEADER_LEN],
) -> io::Result<bool> {
    let mut filled = 0;
    while filled < FRAME_HEADER_LEN {
        match src.read(&mut header[filled..]).await {
            Ok(0) if filled == 0 => return Ok(false),
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "stream ended inside a frame header",
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(true)
}

/// Append one frame carrying `payload` on `stream` to `out`
pub fn encode_frame(stream: StreamType, payload: &[u8], out: &mut Vec<u8>) {
    let len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    out.push(stream as u8);
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&len.to_be_bytes());
    out.extend_from_slice(&payload[..len as usize]);
}
