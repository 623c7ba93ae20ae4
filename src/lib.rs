pub mod authenticator;
pub mod config;
pub mod observer;
pub mod relay;
pub mod server;
pub mod statistics;

use std::sync::Arc;

use config::Config;

/// In order to let the integration tests use the crate and start the
/// server directly, a function is opened to replace the main function.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    server::run(config).await
}
