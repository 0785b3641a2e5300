use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// The byte-stream transports a bridged connection can run over: plain TCP,
/// or the TLS client layer wrapped around it after an upgrade.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl AsyncStream for TcpStream {}

impl<S: AsyncStream> AsyncStream for tokio_rustls::client::TlsStream<S> {}

impl<T: ?Sized + AsyncStream + Unpin> AsyncStream for Box<T> {}
