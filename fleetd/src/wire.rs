//! Framing of a single duplex socket
//!
//! Every frame is a header line terminated by the entry delimiter,
//! followed by exactly as many payload bytes as the header announces.
use std::io;
use std::sync::Arc;

use convi::ExpectFrom;
use fleetd_api::{Delimiters, HeaderError, RequestHeader, Response, MAX_HEADER_LEN};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

#[derive(Error, Debug)]
pub enum ConnectionError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("timeout")]
    Timeout,
    #[error("invalid response: {0}")]
    Invalid(#[from] HeaderError),
    #[error("io: {0}")]
    IO(#[from] io::Error),
}

impl From<tokio::time::error::Elapsed> for ConnectionError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        ConnectionError::Timeout
    }
}

pub type ConnectionResult<T> = std::result::Result<T, ConnectionError>;

/// A decoded request frame
#[derive(Debug, Clone)]
pub struct Request {
    pub code: String,
    pub client: String,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum ReadResult {
    Request(Request),
    /// The header was unusable; the frame was skipped, the connection is fine
    Rejected(HeaderError),
    /// End of stream, possibly in the middle of a frame
    Disconnected,
}

/// Split a connected socket into its reading and writing sides
pub fn split(stream: TcpStream, delimiters: Delimiters) -> io::Result<(WireConnection, FrameWriter)> {
    // We always prepare exact buffers to be sent immediately
    stream.set_nodelay(true)?;
    let (read, write) = stream.into_split();
    Ok((
        WireConnection {
            reader: BufReader::new(read),
            delimiters,
        },
        FrameWriter {
            delimiters,
            inner: Arc::new(Mutex::new(write)),
        },
    ))
}

/// Reading side of a connection
pub struct WireConnection {
    reader: BufReader<OwnedReadHalf>,
    delimiters: Delimiters,
}

impl WireConnection {
    /// Wait until there's something to read
    ///
    /// Returns `false` on end of stream. Does not consume anything, so it can
    /// be safely cancelled, e.g. by a timeout.
    pub async fn has_data(&mut self) -> io::Result<bool> {
        Ok(!self.reader.fill_buf().await?.is_empty())
    }

    /// Read one header line, scanning at most `MAX_HEADER_LEN` bytes into memory
    ///
    /// Over-long headers are still consumed up to their terminator, so the
    /// next frame can be read.
    async fn read_header(&mut self) -> io::Result<Option<Result<String, HeaderError>>> {
        let entry = self.delimiters.entry;
        let mut line = vec![];
        let mut too_long = false;

        loop {
            let (consumed, found) = {
                let buf = self.reader.fill_buf().await?;
                if buf.is_empty() {
                    return Ok(None);
                }
                match buf.iter().position(|b| *b == entry) {
                    Some(i) => {
                        if !too_long {
                            line.extend_from_slice(&buf[..i]);
                        }
                        (i + 1, true)
                    }
                    None => {
                        if !too_long {
                            line.extend_from_slice(buf);
                        }
                        (buf.len(), false)
                    }
                }
            };
            self.reader.consume(consumed);

            if MAX_HEADER_LEN < line.len() {
                too_long = true;
                line.clear();
            }
            if found {
                break;
            }
        }

        if too_long {
            return Ok(Some(Err(HeaderError::TooLong)));
        }
        Ok(Some(
            String::from_utf8(line).map_err(|_| HeaderError::NotUtf8),
        ))
    }

    async fn read_payload(&mut self, len: usize) -> io::Result<Option<Vec<u8>>> {
        let mut payload = Vec::with_capacity(len.min(64 * 1024));
        (&mut self.reader)
            .take(u64::expect_from(len))
            .read_to_end(&mut payload)
            .await?;

        // short read means the stream ended
        Ok((payload.len() == len).then_some(payload))
    }

    pub async fn read_request(&mut self) -> ConnectionResult<ReadResult> {
        let header = match self.read_header().await? {
            None => return Ok(ReadResult::Disconnected),
            Some(Err(e)) => return Ok(ReadResult::Rejected(e)),
            Some(Ok(header)) => header,
        };

        let header = match RequestHeader::parse(&header, &self.delimiters) {
            Ok(header) => header,
            Err(e) => return Ok(ReadResult::Rejected(e)),
        };

        let Some(body) = self.read_payload(header.body_len).await? else {
            return Ok(ReadResult::Disconnected);
        };

        Ok(ReadResult::Request(Request {
            code: header.code,
            client: header.client,
            body,
        }))
    }

    /// Read one response frame; `None` on end of stream
    pub async fn read_response(&mut self) -> ConnectionResult<Option<Response>> {
        let header = match self.read_header().await? {
            None => return Ok(None),
            Some(header) => header?,
        };
        let (status, len) = Response::parse_header(&header, &self.delimiters)?;

        Ok(self
            .read_payload(len)
            .await?
            .map(|message| Response { status, message }))
    }
}

/// Writing side of a connection
///
/// Cloneable; writes of whole frames never interleave.
#[derive(Clone)]
pub struct FrameWriter {
    delimiters: Delimiters,
    inner: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameWriter {
    pub async fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.inner.lock().await.write_all(frame).await
    }

    pub async fn write_response(&self, response: &Response) -> io::Result<()> {
        self.write_frame(&response.encode(&self.delimiters)).await
    }

    /// Exclusive access to the socket, e.g. to write a frame only after some
    /// bookkeeping that must not race with other writers
    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, OwnedWriteHalf> {
        self.inner.lock().await
    }

    pub fn is_same(&self, other: &FrameWriter) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}
