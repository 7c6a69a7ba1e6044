//! Connection pipeline
//!
//! One side of an HTTP/1.1 exchange bound to a byte stream, split into an
//! owned reader and an owned writer so the two directions of a proxied
//! exchange can run as separate tasks. The server side reads requests and
//! writes responses; the client side writes requests and reads responses.
//!
//! Body framing advances through an explicit state machine instead of
//! re-deriving the framing from headers on every read:
//!
//! `Idle -> (Length | Eof | ChunkSize <-> ChunkData -> ChunkEnd) ->
//! Trailers -> Idle`

use crate::http::headers::{parse_form, Headers, Kind};
use crate::http::stream::{HttpReader, MAX_NUM_HEADERS};
use crate::{Error, Result};
use bytes::{Bytes, BytesMut};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Which side of an exchange a writer serves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Server,
    Client,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyState {
    /// No body, or the previous body is fully consumed
    Idle,
    /// Content-Length body with a byte count left to read
    Length { remaining: u64 },
    /// Body delimited by connection close
    Eof,
    /// Expecting a chunk-size line
    ChunkSize,
    /// Inside chunk data
    ChunkData { remaining: u64 },
    /// Expecting the CRLF that terminates a chunk
    ChunkEnd,
    /// Inside the trailer section after the zero-size chunk
    Trailers,
}

/// Reading half of a pipeline side
pub struct MessageReader<R> {
    reader: HttpReader<R>,
    body: BodyState,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(reader: R) -> Self {
        MessageReader {
            reader: HttpReader::new(reader),
            body: BodyState::Idle,
        }
    }

    /// Collect the head lines up to the blank line, capped at
    /// `MAX_NUM_HEADERS`
    async fn read_head_lines(&mut self, skip_leading_blank: bool) -> Result<Vec<String>> {
        let mut line = self.reader.read_line().await?;
        if skip_leading_blank {
            // Tolerate stray CRLFs between requests
            while line.is_empty() {
                line = self.reader.read_line().await?;
            }
        }
        let mut lines = Vec::new();
        for _ in 0..MAX_NUM_HEADERS {
            lines.push(line);
            line = self.reader.read_line().await?;
            if line.is_empty() {
                return Ok(lines);
            }
        }
        Err(Error::syntax("Too many headers"))
    }

    /// Read one request head and prime the body state from its framing
    pub async fn read_request(&mut self) -> Result<Headers> {
        let lines = self.read_head_lines(true).await?;
        let headers = Headers::parse(Kind::Request, &lines)?;

        self.body = if headers.chunked()? {
            BodyState::ChunkSize
        } else if let Some(n) = headers.content_length()? {
            BodyState::Length { remaining: n }
        } else {
            BodyState::Idle
        };
        Ok(headers)
    }

    /// Read one response head; `sent_method` is the method this side sent
    /// for the exchange, which decides whether a body follows at all
    pub async fn read_response(&mut self, sent_method: &str) -> Result<Headers> {
        let lines = self.read_head_lines(false).await?;
        let headers = Headers::parse(Kind::Response, &lines)?;

        let code = headers.code();
        let suppressed = sent_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&code)
            || code == 204
            || code == 304;

        self.body = if suppressed {
            BodyState::Idle
        } else if headers.chunked()? {
            BodyState::ChunkSize
        } else if let Some(n) = headers.content_length()? {
            BodyState::Length { remaining: n }
        } else {
            BodyState::Eof
        };
        Ok(headers)
    }

    /// Whether the current body has no framing and runs to connection
    /// close
    pub fn body_delimited_by_eof(&self) -> bool {
        matches!(self.body, BodyState::Eof)
    }

    /// Pull the next body chunk, or None once the body is fully read.
    ///
    /// With `raw` set, chunked bodies come back byte-exact: chunk-size
    /// lines, chunk CRLFs, and the trailer section included, so the bytes
    /// can be forwarded without re-framing.
    pub async fn next_body_chunk(&mut self, raw: bool) -> Result<Option<Bytes>> {
        loop {
            match self.body {
                BodyState::Idle => return Ok(None),

                BodyState::Length { remaining } => {
                    if remaining == 0 {
                        self.body = BodyState::Idle;
                        return Ok(None);
                    }
                    let piece = self.reader.read_piece(remaining).await?;
                    let left = remaining - piece.len() as u64;
                    self.body = BodyState::Length { remaining: left };
                    return Ok(Some(piece));
                }

                BodyState::Eof => match self.reader.read_piece_to_eof().await? {
                    Some(piece) => return Ok(Some(piece)),
                    None => {
                        self.body = BodyState::Idle;
                        return Ok(None);
                    }
                },

                BodyState::ChunkSize => {
                    let line = self.reader.read_line_bytes().await?;
                    let size = parse_chunk_size(&line)?;
                    self.body = if size > 0 {
                        BodyState::ChunkData { remaining: size }
                    } else {
                        BodyState::Trailers
                    };
                    if raw {
                        return Ok(Some(with_crlf(&line)));
                    }
                }

                BodyState::ChunkData { remaining } => {
                    let piece = self.reader.read_piece(remaining).await?;
                    let left = remaining - piece.len() as u64;
                    self.body = if left == 0 {
                        BodyState::ChunkEnd
                    } else {
                        BodyState::ChunkData { remaining: left }
                    };
                    return Ok(Some(piece));
                }

                BodyState::ChunkEnd => {
                    let line = self.reader.read_line_bytes().await?;
                    if !line.is_empty() {
                        return Err(Error::syntax("Chunk does not match chunk size"));
                    }
                    self.body = BodyState::ChunkSize;
                    if raw {
                        return Ok(Some(Bytes::from_static(b"\r\n")));
                    }
                }

                BodyState::Trailers => {
                    let line = self.reader.read_line_bytes().await?;
                    if line.is_empty() {
                        self.body = BodyState::Idle;
                        if raw {
                            return Ok(Some(Bytes::from_static(b"\r\n")));
                        }
                    } else if raw {
                        return Ok(Some(with_crlf(&line)));
                    }
                }
            }
        }
    }

    /// Collect the whole body into memory (internal handlers only)
    pub async fn collect_body(&mut self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        while let Some(piece) = self.next_body_chunk(false).await? {
            body.extend_from_slice(&piece);
        }
        Ok(body)
    }

    /// Decode a form-encoded request body
    pub async fn read_form_body(
        &mut self,
        headers: &Headers,
    ) -> Result<HashMap<String, Vec<String>>> {
        match headers.get_single("Content-Type")?.as_deref() {
            Some("application/x-www-form-urlencoded") => {
                let body = self.collect_body().await?;
                Ok(parse_form(&body))
            }
            other => Err(Error::not_implemented(format!(
                "form body with media type {:?}",
                other
            ))),
        }
    }
}

fn parse_chunk_size(line: &[u8]) -> Result<u64> {
    let text = std::str::from_utf8(line).map_err(|_| Error::syntax("Invalid chunk size"))?;
    let size_field = text.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_field, 16).map_err(|_| Error::syntax("Invalid chunk size"))
}

fn with_crlf(line: &[u8]) -> Bytes {
    let mut out = BytesMut::with_capacity(line.len() + 2);
    out.extend_from_slice(line);
    out.extend_from_slice(b"\r\n");
    out.freeze()
}

/// Writing half of a pipeline side
pub struct MessageWriter<W> {
    writer: W,
    side: Side,
    headers_sent: bool,
    sent_chunked: bool,
    sent_method: Option<String>,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(writer: W, side: Side) -> Self {
        MessageWriter {
            writer,
            side,
            headers_sent: false,
            sent_chunked: false,
            sent_method: None,
        }
    }

    /// The method of the last request sent through this writer
    pub fn sent_method(&self) -> &str {
        self.sent_method.as_deref().unwrap_or("")
    }

    pub async fn send_headers(&mut self, headers: &Headers) -> Result<()> {
        let chunked = headers.chunked()?;
        self.writer.write_all(&headers.to_bytes()).await?;
        self.writer.flush().await?;
        self.headers_sent = true;
        self.sent_chunked = chunked;
        if headers.kind() == Kind::Request {
            self.sent_method = Some(headers.method().to_string());
        }
        Ok(())
    }

    /// Write body bytes. Re-framing a chunked body is not supported:
    /// callers on a chunked pipeline must pass raw pass-through bytes.
    pub async fn send_body(&mut self, data: &[u8], raw: bool) -> Result<()> {
        if !raw && self.sent_chunked {
            return Err(Error::not_implemented("re-framing a chunked body"));
        }
        self.writer.write_all(data).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Mark the current exchange complete; the next `error_close` may
    /// emit a fresh status line again
    pub fn finish_body(&mut self) {
        self.headers_sent = false;
    }

    /// Abort the connection. On the server side a 500 goes out first if
    /// this exchange has not sent its response head yet.
    pub async fn error_close(&mut self) {
        if self.side == Side::Server && !self.headers_sent {
            let mut response = Headers::response(500);
            response.set("Connection", "close");
            let _ = self.send_headers(&response).await;
        }
        let _ = self.writer.shutdown().await;
    }

    pub async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
