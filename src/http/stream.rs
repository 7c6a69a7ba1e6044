//! Buffered reading over a byte stream
//!
//! Line- and count-oriented reads used by the connection pipeline, over
//! any `AsyncRead` half (TCP, UNIX socket, or an in-memory pair). Every
//! underlying read is bounded by the receive deadline.

use crate::{Error, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;

pub const MAX_LINE_LENGTH: usize = 8192;
pub const MAX_NUM_HEADERS: usize = 100;
pub const RECV_BUFFER_SIZE: usize = 4096;
pub const RECV_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// A read half with an intermediate buffer
pub struct HttpReader<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: AsyncRead + Unpin> HttpReader<R> {
    pub fn new(reader: R) -> Self {
        HttpReader {
            reader,
            buf: BytesMut::with_capacity(RECV_BUFFER_SIZE),
        }
    }

    /// One timed read into the buffer; EOF is a closed connection
    async fn fill(&mut self) -> Result<()> {
        let mut tmp = [0u8; RECV_BUFFER_SIZE];
        let n = timeout(RECV_TIMEOUT, self.reader.read(&mut tmp)).await??;
        if n == 0 {
            return Err(Error::ConnectionClosed);
        }
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(())
    }

    fn find_crlf(&self) -> Option<usize> {
        self.buf.windows(2).position(|w| w == b"\r\n")
    }

    /// Bytes up to the next CRLF; the CRLF is consumed but not returned
    pub async fn read_line_bytes(&mut self) -> Result<Bytes> {
        loop {
            if let Some(i) = self.find_crlf() {
                let line = self.buf.split_to(i).freeze();
                self.buf.advance(2);
                return Ok(line);
            }
            if self.buf.len() > MAX_LINE_LENGTH {
                return Err(Error::syntax("Line too long"));
            }
            self.fill().await?;
        }
    }

    /// A CRLF-terminated line decoded as text
    pub async fn read_line(&mut self) -> Result<String> {
        let line = self.read_line_bytes().await?;
        String::from_utf8(line.to_vec()).map_err(|_| Error::syntax("Invalid header encoding"))
    }

    /// The next piece of an exact-count read, at most `max` bytes.
    ///
    /// Never empty; a short EOF surfaces as a closed connection.
    pub async fn read_piece(&mut self, max: u64) -> Result<Bytes> {
        if self.buf.is_empty() {
            self.fill().await?;
        }
        let take = (self.buf.len() as u64).min(max) as usize;
        Ok(self.buf.split_to(take).freeze())
    }

    /// The next piece of an EOF-delimited read; None at EOF
    pub async fn read_piece_to_eof(&mut self) -> Result<Option<Bytes>> {
        if !self.buf.is_empty() {
            let len = self.buf.len();
            return Ok(Some(self.buf.split_to(len).freeze()));
        }
        match self.fill().await {
            Ok(()) => {
                let len = self.buf.len();
                Ok(Some(self.buf.split_to(len).freeze()))
            }
            Err(Error::ConnectionClosed) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_read_line_consumes_crlf() {
        let mut reader = HttpReader::new(Cursor::new(b"GET / HTTP/1.1\r\nHost: a\r\n".to_vec()));
        assert_eq!(reader.read_line().await.unwrap(), "GET / HTTP/1.1");
        assert_eq!(reader.read_line().await.unwrap(), "Host: a");
        assert!(matches!(
            reader.read_line().await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_line_too_long() {
        let mut data = vec![b'a'; MAX_LINE_LENGTH + 1];
        data.extend_from_slice(b"\r\n");
        let mut reader = HttpReader::new(Cursor::new(data));
        assert!(matches!(reader.read_line().await, Err(Error::Syntax(_))));
    }

    #[tokio::test]
    async fn test_read_piece_bounded() {
        let mut reader = HttpReader::new(Cursor::new(b"hello world".to_vec()));
        let piece = reader.read_piece(5).await.unwrap();
        assert_eq!(&piece[..], b"hello");
        let piece = reader.read_piece(100).await.unwrap();
        assert_eq!(&piece[..], b" world");
        assert!(matches!(
            reader.read_piece(1).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_read_to_eof() {
        let mut reader = HttpReader::new(Cursor::new(b"tail".to_vec()));
        assert_eq!(&reader.read_piece_to_eof().await.unwrap().unwrap()[..], b"tail");
        assert!(reader.read_piece_to_eof().await.unwrap().is_none());
    }
}
