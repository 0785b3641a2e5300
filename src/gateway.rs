use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use log::{debug, error};
use tokio::io::{AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{Request, Response};
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_hdr_async_with_config, WebSocketStream};

use crate::async_stream::AsyncStream;
use crate::command_reader::CommandReader;
use crate::config::{default_ws_config, Settings};
use crate::upstream::{init_session, UpstreamSession};

pub type WsStream = WebSocketStream<TcpStream>;

/// Framing used for commands relayed to the websocket peer. Fixed for the
/// whole bridged connection, selected from the upgrade request.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageKind {
    Text,
    Binary,
}

/// Context of the upgrade request that opened the bridged connection.
pub struct ConnectRequest {
    pub uri: Uri,
}

/// Pluggable connect and error behavior, injected at gateway construction.
#[async_trait]
pub trait GatewayHooks: Send + Sync {
    /// Runs after the greeting exchange (and TLS upgrade, when enabled) and
    /// before the relay workers start. An error aborts the bridged
    /// connection and the partially built session is discarded.
    async fn handle_connect(
        &self,
        session: &mut UpstreamSession,
        request: &ConnectRequest,
        ws: &mut WsStream,
    ) -> io::Result<()>;

    fn on_error(&self, err: &io::Error);
}

/// Default behavior: forward the INFO command and let the client on the
/// other side do the CONNECT itself; errors go to the log.
pub struct DefaultHooks {
    trace: bool,
}

impl DefaultHooks {
    pub fn new(trace: bool) -> Self {
        Self { trace }
    }
}

#[async_trait]
impl GatewayHooks for DefaultHooks {
    async fn handle_connect(
        &self,
        session: &mut UpstreamSession,
        _request: &ConnectRequest,
        ws: &mut WsStream,
    ) -> io::Result<()> {
        let info_cmd = format!("INFO {}\r\n", session.server_info);
        if self.trace {
            debug!("<-- {}", info_cmd.trim_end());
        }
        ws.send(Message::text(info_cmd))
            .await
            .map_err(io::Error::other)
    }

    fn on_error(&self, err: &io::Error) {
        error!("{}", err);
    }
}

/// Bridges accepted websocket sessions to fresh NATS connections, one
/// bridged connection per call to `handle_connection`.
pub struct Gateway {
    settings: Settings,
    hooks: Arc<dyn GatewayHooks>,
}

impl Gateway {
    pub fn new(settings: Settings, hooks: Option<Arc<dyn GatewayHooks>>) -> Self {
        let hooks = hooks.unwrap_or_else(|| Arc::new(DefaultHooks::new(settings.trace)));
        Self { settings, hooks }
    }

    /// Runs one bridged connection to completion: websocket upgrade, NATS
    /// session setup, both relay directions, teardown. Failures are reported
    /// through the error hook; the websocket peer only ever observes its
    /// session closing.
    pub async fn handle_connection(&self, stream: TcpStream) {
        let ws_config = self.settings.ws_config.clone().unwrap_or_else(default_ws_config);

        let mut request_uri: Option<Uri> = None;
        let accept_result = accept_hdr_async_with_config(
            stream,
            |request: &Request, response: Response| {
                request_uri = Some(request.uri().clone());
                Ok(response)
            },
            Some(ws_config),
        )
        .await;
        let mut ws = match accept_result {
            Ok(ws) => ws,
            Err(e) => {
                self.hooks.on_error(&io::Error::other(e));
                return;
            }
        };

        let request = ConnectRequest {
            uri: request_uri.unwrap_or_default(),
        };
        let kind = message_kind_from_query(request.uri.query());

        let session =
            match init_session(&self.settings, self.hooks.as_ref(), &request, &mut ws).await {
                Ok(session) => session,
                Err(e) => {
                    self.hooks.on_error(&e);
                    return;
                }
            };

        self.bridge(ws, session, kind).await;
    }

    /// Runs both relay directions until either stops, then tears down both
    /// sides symmetrically.
    async fn bridge(&self, ws: WsStream, session: UpstreamSession, kind: MessageKind) {
        let UpstreamSession { stream, reader, .. } = session;
        let (upstream_read, upstream_write) = tokio::io::split(stream);
        let (ws_sink, ws_source) = ws.split();

        // Each worker signals completion exactly once, success or error. The
        // first signal stops the other direction; the second one means no
        // worker references the transports anymore.
        let (done_tx, mut done_rx) = mpsc::channel::<()>(2);
        let (stop_tx, stop_rx) = watch::channel(());

        let outbound = tokio::spawn(upstream_to_ws_worker(
            kind,
            reader,
            upstream_read,
            ws_sink,
            self.settings.trace,
            self.hooks.clone(),
            stop_rx.clone(),
            done_tx.clone(),
        ));
        let inbound = tokio::spawn(ws_to_upstream_worker(
            ws_source,
            upstream_write,
            self.settings.trace,
            self.hooks.clone(),
            stop_rx,
            done_tx,
        ));

        let _ = done_rx.recv().await;
        let _ = stop_tx.send(());
        let _ = done_rx.recv().await;

        // Both workers have exited and handed their halves back; close each
        // transport exactly once. Errors here mean the peer is already gone.
        if let (Ok((upstream_read, ws_sink)), Ok((ws_source, upstream_write))) =
            (outbound.await, inbound.await)
        {
            let mut upstream = upstream_read.unsplit(upstream_write);
            let _ = upstream.shutdown().await;
            if let Ok(mut ws) = ws_sink.reunite(ws_source) {
                let _ = ws.close(None).await;
            }
        }
        debug!("bridged connection closed");
    }
}

/// Query hint selecting the websocket framing: `mode=binary` selects binary
/// frames, anything else (or no query at all) selects text frames.
fn message_kind_from_query(query: Option<&str>) -> MessageKind {
    let query = match query {
        Some(query) => query,
        None => return MessageKind::Text,
    };
    for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
        if key == "mode" && value == "binary" {
            return MessageKind::Binary;
        }
    }
    MessageKind::Text
}

async fn upstream_to_ws_worker(
    kind: MessageKind,
    mut reader: CommandReader,
    mut upstream: ReadHalf<Box<dyn AsyncStream>>,
    mut ws_sink: SplitSink<WsStream, Message>,
    trace: bool,
    hooks: Arc<dyn GatewayHooks>,
    mut stop_rx: watch::Receiver<()>,
    done_tx: mpsc::Sender<()>,
) -> (ReadHalf<Box<dyn AsyncStream>>, SplitSink<WsStream, Message>) {
    loop {
        let keep_going = tokio::select! {
            biased;
            _ = stop_rx.changed() => false,
            keep_going = relay_upstream_command(
                kind,
                &mut reader,
                &mut upstream,
                &mut ws_sink,
                trace,
                hooks.as_ref(),
            ) => keep_going,
        };
        if !keep_going {
            break;
        }
    }
    let _ = done_tx.send(()).await;
    (upstream, ws_sink)
}

/// Relays one upstream command to the websocket peer. Returns false when
/// this direction is finished.
async fn relay_upstream_command(
    kind: MessageKind,
    reader: &mut CommandReader,
    upstream: &mut ReadHalf<Box<dyn AsyncStream>>,
    ws_sink: &mut SplitSink<WsStream, Message>,
    trace: bool,
    hooks: &dyn GatewayHooks,
) -> bool {
    let cmd = match reader.next_command(upstream).await {
        Ok(Some(cmd)) => cmd,
        // keepalive artifact, nothing to forward
        Ok(None) => return true,
        Err(e) => {
            hooks.on_error(&e);
            return false;
        }
    };
    if trace {
        debug!("<-- {}", String::from_utf8_lossy(&cmd));
    }
    let message = match kind {
        MessageKind::Binary => Message::binary(cmd),
        MessageKind::Text => match String::from_utf8(cmd) {
            Ok(text) => Message::text(text),
            Err(e) => {
                hooks.on_error(&io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("command does not fit a text frame: {}", e),
                ));
                return false;
            }
        },
    };
    match ws_sink.send(message).await {
        Ok(()) => true,
        Err(e) => {
            hooks.on_error(&io::Error::other(e));
            false
        }
    }
}

async fn ws_to_upstream_worker(
    mut ws_source: SplitStream<WsStream>,
    mut upstream: WriteHalf<Box<dyn AsyncStream>>,
    trace: bool,
    hooks: Arc<dyn GatewayHooks>,
    mut stop_rx: watch::Receiver<()>,
    done_tx: mpsc::Sender<()>,
) -> (SplitStream<WsStream>, WriteHalf<Box<dyn AsyncStream>>) {
    loop {
        let keep_going = tokio::select! {
            biased;
            _ = stop_rx.changed() => false,
            keep_going = relay_ws_message(
                &mut ws_source,
                &mut upstream,
                trace,
                hooks.as_ref(),
            ) => keep_going,
        };
        if !keep_going {
            break;
        }
    }
    let _ = done_tx.send(()).await;
    (ws_source, upstream)
}

/// Relays one websocket message to the upstream connection. Returns false
/// when this direction is finished.
async fn relay_ws_message(
    ws_source: &mut SplitStream<WsStream>,
    upstream: &mut WriteHalf<Box<dyn AsyncStream>>,
    trace: bool,
    hooks: &dyn GatewayHooks,
) -> bool {
    let message = match ws_source.next().await {
        Some(Ok(message)) => message,
        Some(Err(e)) => {
            hooks.on_error(&io::Error::other(e));
            return false;
        }
        None => return false,
    };
    let data = match message {
        Message::Text(_) | Message::Binary(_) => message.into_data(),
        Message::Close(_) => return false,
        // ping/pong and raw frames carry no protocol bytes
        _ => return true,
    };
    if trace {
        debug!("--> {}", String::from_utf8_lossy(&data));
    }
    match write_full(upstream, &data).await {
        Ok(()) => true,
        Err(e) => {
            hooks.on_error(&e);
            false
        }
    }
}

// A zero-length write surfaces as WriteZero, the short-write condition.
async fn write_full<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    writer.write_all(data).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_kind_defaults_to_text() {
        assert_eq!(message_kind_from_query(None), MessageKind::Text);
        assert_eq!(message_kind_from_query(Some("")), MessageKind::Text);
        assert_eq!(
            message_kind_from_query(Some("mode=text")),
            MessageKind::Text
        );
        assert_eq!(
            message_kind_from_query(Some("mode=BINARY")),
            MessageKind::Text
        );
    }

    #[test]
    fn message_kind_binary_hint() {
        assert_eq!(
            message_kind_from_query(Some("mode=binary")),
            MessageKind::Binary
        );
        assert_eq!(
            message_kind_from_query(Some("a=b&mode=binary")),
            MessageKind::Binary
        );
    }
}
