use std::sync::Arc;

use log::debug;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;

use crate::async_stream::AsyncStream;
use crate::command_reader::CommandReader;
use crate::config::Settings;
use crate::gateway::{ConnectRequest, GatewayHooks, WsStream};
use crate::rustls_util::{create_client_config, server_name};

/// One NATS-side session: the byte stream, the command reader used with it,
/// and the server greeting. `stream` and `reader` are only ever replaced
/// together (TLS upgrade), so the reader's buffered bytes can never outlive
/// the transport they were read from.
pub struct UpstreamSession {
    pub stream: Box<dyn AsyncStream>,
    pub reader: CommandReader,
    pub server_info: String,
}

/// Extracts the greeting payload from the server's first command. The line
/// must be `INFO `, the opaque payload, then CRLF; anything else - including
/// lines too short to hold that shape - is a protocol violation.
pub fn parse_info(cmd: &[u8]) -> std::io::Result<String> {
    if cmd.len() < 7 || !cmd.starts_with(b"INFO ") || !cmd.ends_with(b"\r\n") {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid INFO command: {}", String::from_utf8_lossy(cmd)),
        ));
    }
    std::str::from_utf8(&cmd[5..cmd.len() - 2])
        .map(str::to_string)
        .map_err(|e| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("INFO payload is not utf8: {}", e),
            )
        })
}

/// Dials the NATS server, consumes the INFO greeting, optionally upgrades
/// the connection to TLS, and runs the connect handshake. The session is
/// ready for relaying on return; on error the caller drops whatever was
/// built, which closes the connection.
pub async fn init_session(
    settings: &Settings,
    hooks: &dyn GatewayHooks,
    request: &ConnectRequest,
    ws: &mut WsStream,
) -> std::io::Result<UpstreamSession> {
    let tcp_stream = TcpStream::connect(&settings.nats_addr).await?;
    let mut stream: Box<dyn AsyncStream> = Box::new(tcp_stream);
    let mut reader = CommandReader::new();

    let greeting = match reader.next_command(&mut stream).await? {
        Some(cmd) => cmd,
        None => {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "empty line instead of INFO greeting",
            ));
        }
    };
    let server_info = parse_info(&greeting)?;
    debug!("upstream greeting: {}", server_info);

    if settings.enable_tls {
        let client_config = settings
            .tls_config
            .clone()
            .unwrap_or_else(|| Arc::new(create_client_config(false)));
        let connector = TlsConnector::from(client_config);
        let tls_stream = connector
            .connect(server_name(&settings.nats_addr), stream)
            .await?;
        // The plaintext pair is gone: the connection moved into the TLS
        // layer, and the old reader's buffered bytes go with it.
        stream = Box::new(tls_stream);
        reader = CommandReader::new();
    }

    let mut session = UpstreamSession {
        stream,
        reader,
        server_info,
    };

    hooks.handle_connect(&mut session, request, ws).await?;

    Ok(session)
}
