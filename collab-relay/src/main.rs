//! collab-relay binary: serves rooms on `PORT` (default 1234) until Ctrl-C.

use collab_relay::{RelayConfig, RelayServer};
use log::error;

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("{e}");
            std::process::exit(2);
        }
    };

    let server = RelayServer::new(config);
    if let Err(e) = server.run().await {
        error!("Relay stopped: {e}");
        std::process::exit(1);
    }
}
