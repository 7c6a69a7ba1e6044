//! HTTP/1.1 connection plumbing
//!
//! The framing codec, buffered stream reading, the in-memory socket
//! pair, and the per-side connection pipeline the proxy engine couples
//! back-to-back.

pub mod headers;
pub mod pair;
pub mod pipeline;
pub mod stream;

pub use headers::{Expiry, Headers, Kind};
pub use pair::{pair, PairStream};
pub use pipeline::{MessageReader, MessageWriter, Side};

use tokio::io::{AsyncRead, AsyncWrite};

/// Any bidirectional byte transport a pipeline can sit on: a TCP or
/// UNIX-domain socket, or one endpoint of an in-memory pair.
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> ByteStream for T {}

/// Boxed transport handed out by backends
pub type BoxStream = Box<dyn ByteStream>;
