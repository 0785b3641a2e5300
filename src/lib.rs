//! A websocket gateway in front of NATS servers.
//!
//! Each accepted websocket session is paired with a fresh connection to the
//! configured NATS server: the server's INFO greeting is consumed (and, by
//! default, forwarded to the websocket peer, which is expected to do the
//! CONNECT itself), the NATS connection is optionally upgraded to TLS, and
//! protocol commands are then relayed in both directions until either side
//! goes away. Command payloads are opaque; the gateway only understands the
//! protocol's framing.

pub mod async_stream;
pub mod command_reader;
pub mod config;
pub mod gateway;
pub mod rustls_util;
pub mod server;
pub mod upstream;
