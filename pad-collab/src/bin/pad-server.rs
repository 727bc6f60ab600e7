//! Standalone sequencing server.
//!
//! Usage: `pad-server [BIND_ADDR]` (default `127.0.0.1:9090`).
//! Log level comes from `RUST_LOG`.

use pad_collab::server::{ServerConfig, SyncServer};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let mut config = ServerConfig::default();
    if let Some(addr) = std::env::args().nth(1) {
        config.bind_addr = addr;
    }

    SyncServer::new(config).run().await
}
