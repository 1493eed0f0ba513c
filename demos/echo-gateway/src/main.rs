use std::time::Duration;

use arcgate::prelude::*;
use arcgate::telemetry;
use tokio::net::TcpStream;

type ServerConn = WebSocketConn<TcpStream>;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

/// Accepts tokens of the form `player:<name>`.
struct TokenAuth;

impl Authenticator for TokenAuth {
    async fn authenticate(&self, token: &str, _extensions: &[u8]) -> Result<UserId, SessionError> {
        match token.strip_prefix("player:") {
            Some(name) if !name.is_empty() => Ok(UserId(name.to_string())),
            _ => Err(SessionError::AuthFailed("token must be player:<name>".into())),
        }
    }
}

// ---------------------------------------------------------------------------
// Gateway
// ---------------------------------------------------------------------------

fn echo_gateway(config: GatewayConfig) -> Gateway<ServerConn, TokenAuth> {
    Gateway::builder()
        .config(config)
        .on_data(|session: &Session<ServerConn>, data| {
            tracing::debug!(session = %session.id(), len = data.len(), "echo");
            session.send_data(data)?;
            Ok(())
        })
        .watch(state_watcher(|id, old, new| {
            tracing::info!(session = %id, from = ?old, to = ?new, "session state");
            Ok(())
        }))
        .build(TokenAuth)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    telemetry::init_tracing(telemetry::DEFAULT_FILTER);

    let config = match std::env::args().nth(1) {
        Some(path) => GatewayConfig::from_json_file(path)?,
        None => GatewayConfig::default(),
    };
    let transport = WebSocketTransport::bind(&config.bind_addr).await?;
    let gateway = echo_gateway(config);

    let serving = gateway.clone();
    let server = tokio::spawn(async move { serving.serve(transport).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");
    if !gateway.shutdown(SHUTDOWN_GRACE).await {
        tracing::warn!(remaining = gateway.session_count(), "sessions left behind");
    }
    server.await??;
    Ok(())
}
