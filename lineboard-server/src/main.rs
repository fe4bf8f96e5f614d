//! Lineboard relay server.
//!
//! Serves every board under `/board/{id}/socket` (sync) and
//! `/board/{id}/line` (line creation and deletion). Configuration comes
//! from `LINEBOARD_*` environment variables; logging from `RUST_LOG`
//! (default `info`).
//!
//! ```text
//! lineboard-server [BOARD_ID SEED.json]
//! ```
//!
//! With arguments, the board is created up front from a JSON array of
//! `{value, contentType}` objects, the same format the board exports.

use std::error::Error;

use lineboard_collab::lineboard_core::ContentSnapshot;
use lineboard_collab::{ServerConfig, SyncServer};
use log::info;

type BoxError = Box<dyn Error + Send + Sync>;

fn read_seed(path: &str) -> Result<Vec<ContentSnapshot>, BoxError> {
    let text = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&text)?)
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    info!(
        "Starting lineboard relay on {} (broadcast capacity {}, {} connections per board)",
        config.bind_addr, config.broadcast_capacity, config.max_connections_per_board
    );
    let server = SyncServer::new(config);

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.as_slice() {
        [] => {}
        [board, seed] => {
            let snapshots = read_seed(seed)?;
            server.load_board(board.as_str(), snapshots).await?;
        }
        _ => {
            return Err("usage: lineboard-server [BOARD_ID SEED.json]".into());
        }
    }

    server.run().await
}
