//! In-memory socket pair
//!
//! A bidirectional byte transport with a bounded buffer per direction,
//! used to plug internal handlers behind the same framing code as a real
//! backend socket. Writes park when the peer's buffer is full and resume
//! when the peer reads; closing either endpoint closes the whole pair,
//! but readers still drain whatever was buffered before seeing EOF.

use parking_lot::Mutex;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

pub const PAIR_BUFFER_SIZE: usize = 8192;

#[derive(Default)]
struct Direction {
    buf: Vec<u8>,
    closed: bool,
    read_waker: Option<Waker>,
    write_waker: Option<Waker>,
}

impl Direction {
    fn close(&mut self) {
        self.closed = true;
        if let Some(w) = self.read_waker.take() {
            w.wake();
        }
        if let Some(w) = self.write_waker.take() {
            w.wake();
        }
    }
}

/// One endpoint of an in-memory duplex pair
pub struct PairStream {
    incoming: Arc<Mutex<Direction>>,
    outgoing: Arc<Mutex<Direction>>,
}

/// Create a connected `(client, server)` pair: what the client writes,
/// the server reads, and vice versa.
pub fn pair() -> (PairStream, PairStream) {
    let a = Arc::new(Mutex::new(Direction::default()));
    let b = Arc::new(Mutex::new(Direction::default()));
    (
        PairStream {
            incoming: a.clone(),
            outgoing: b.clone(),
        },
        PairStream {
            incoming: b,
            outgoing: a,
        },
    )
}

impl AsyncRead for PairStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut dir = self.incoming.lock();
        if !dir.buf.is_empty() {
            let n = dir.buf.len().min(buf.remaining());
            buf.put_slice(&dir.buf[..n]);
            dir.buf.drain(..n);
            if let Some(w) = dir.write_waker.take() {
                w.wake();
            }
            return Poll::Ready(Ok(()));
        }
        if dir.closed {
            return Poll::Ready(Ok(()));
        }
        dir.read_waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

impl AsyncWrite for PairStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut dir = self.outgoing.lock();
        if dir.closed {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "socket pair closed",
            )));
        }
        if dir.buf.len() >= PAIR_BUFFER_SIZE {
            dir.write_waker = Some(cx.waker().clone());
            return Poll::Pending;
        }
        let n = data.len().min(PAIR_BUFFER_SIZE - dir.buf.len());
        dir.buf.extend_from_slice(&data[..n]);
        if let Some(w) = dir.read_waker.take() {
            w.wake();
        }
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.incoming.lock().close();
        self.outgoing.lock().close();
        Poll::Ready(Ok(()))
    }
}

impl Drop for PairStream {
    fn drop(&mut self) {
        self.incoming.lock().close();
        self.outgoing.lock().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_pair_roundtrip() {
        let (mut client, mut server) = pair();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn test_writer_blocks_until_reader_drains() {
        let (mut client, mut server) = pair();
        let payload = vec![0x5au8; PAIR_BUFFER_SIZE * 3];
        let expected = payload.clone();

        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client.shutdown().await.unwrap();
        });

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, expected);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_eof() {
        let (mut client, mut server) = pair();
        client.write_all(b"last words").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        server.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"last words");
    }

    #[tokio::test]
    async fn test_write_after_close_fails() {
        let (mut client, server) = pair();
        drop(server);
        assert!(client.write_all(b"x").await.is_err());
    }
}
