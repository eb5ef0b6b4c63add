//! Realtime sync server binary.
//!
//! Configuration comes from the environment: `WS_JWT_ISSUER`,
//! `WS_JWT_AUDIENCE`, `WS_JWT_SECRET`, `ALLOWED_ORIGINS`, and
//! `REALTIME_BIND_ADDR` or `PORT`. Log filtering follows `RUST_LOG`.

use latest_realtime::server::{BoxError, RealtimeServer, ServerConfig};
use log::info;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!("Starting realtime server on {}...", config.bind_addr);

    // Missing auth settings are logged once here; the server still starts
    // and answers every upgrade with 500 until it is reconfigured.
    let server = RealtimeServer::new(config);
    server.run().await
}
