use std::sync::Arc;

use log::{debug, error, info};
use tokio::net::TcpListener;

use crate::gateway::Gateway;

/// Accepts websocket clients and runs one bridged connection per socket.
pub async fn run_server(listen_addr: &str, gateway: Gateway) -> std::io::Result<()> {
    let listener = TcpListener::bind(listen_addr).await?;
    info!("listening on {}", listener.local_addr()?);

    let gateway = Arc::new(gateway);
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(v) => v,
            Err(e) => {
                error!("accept failed: {:?}", e);
                continue;
            }
        };

        let gateway = gateway.clone();
        tokio::spawn(async move {
            debug!("{}:{} connected", addr.ip(), addr.port());
            gateway.handle_connection(stream).await;
            debug!("{}:{} finished", addr.ip(), addr.port());
        });
    }
}
