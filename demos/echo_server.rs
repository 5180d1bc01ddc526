//! Echo server, also usable as an Autobahn fuzzingclient target
//!
//! Run with: cargo run --release --example echo_server
//! Set RUST_LOG=ws_engine=debug to watch handshakes and close codes.

use std::net::SocketAddr;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use ws_engine::prelude::*;

struct Echo;

impl Handler for Echo {
    async fn on_open(&self, conn: &ConnectionHandle) -> anyhow::Result<()> {
        tracing::info!(
            id = %conn.id(),
            target = conn.target(),
            extensions = ?conn.extensions(),
            "client connected"
        );
        Ok(())
    }

    async fn on_text(&self, conn: &ConnectionHandle, text: String) -> anyhow::Result<()> {
        conn.send_text(text).await?.await.into_result()?;
        Ok(())
    }

    async fn on_binary(&self, conn: &ConnectionHandle, data: Bytes) -> anyhow::Result<()> {
        conn.send_binary(data).await?.await.into_result()?;
        Ok(())
    }

    async fn on_close(&self, conn: &ConnectionHandle, reason: CloseReason) -> anyhow::Result<()> {
        tracing::info!(
            id = %conn.id(),
            code = %reason.code,
            reason = %reason.reason,
            "client gone"
        );
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let addr: SocketAddr = std::env::var("ECHO_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:9001".to_string())
        .parse()?;

    let config = server_config();
    let policy = ServerPolicy::from_config(&config);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, ?policy, "echo server listening");

    loop {
        let (stream, peer) = listener.accept().await?;
        stream.set_nodelay(true).ok();

        let config = config.clone();
        let policy = policy.clone();
        tokio::spawn(async move {
            if let Err(err) = serve(stream, &policy, config).await {
                tracing::warn!(%peer, error = %err, "upgrade failed");
            }
        });
    }
}

async fn serve(stream: TcpStream, policy: &ServerPolicy, config: Config) -> ws_engine::Result<()> {
    let connection = ws_engine::accept(stream, policy, config, Echo).await?;
    connection.run().await;
    Ok(())
}

fn server_config() -> Config {
    let builder = Config::builder()
        .max_payload_length(16 * 1024 * 1024)
        .idle_timeout(None);
    #[cfg(feature = "permessage-deflate")]
    let builder = builder.compression(ws_engine::DeflateConfig::default());
    builder.build()
}
