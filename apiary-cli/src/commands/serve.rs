//! Serve command: run the apiary server in the foreground

use anyhow::Result;
use apiary_server::ApiaryServer;
use clap::Args;
use tracing::info;

use crate::config::{ApiaryConfig, ConfigLoader};

/// Arguments for the serve command
#[derive(Debug, Args)]
pub struct ServeArgs {
    /// Port to listen on (overrides config and APIARY_ADDR)
    #[arg(short, long)]
    pub port: Option<u16>,

    /// Host to bind to (overrides config and APIARY_ADDR)
    #[arg(long)]
    pub host: Option<String>,

    /// Idle seconds before a reserved tab is rolled back
    #[arg(long)]
    pub transaction_timeout: Option<u64>,
}

impl ServeArgs {
    /// Flags are the last configuration layer
    fn apply(&self, config: &mut ApiaryConfig) {
        if let Some(host) = &self.host {
            config.server.host = host.clone();
        }
        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(secs) = self.transaction_timeout {
            config.server.session.transaction_timeout_secs = secs;
        }
    }
}

/// Run the serve command
pub async fn run(args: ServeArgs) -> Result<()> {
    let mut config = ConfigLoader::load()?;
    args.apply(&mut config);

    info!("Starting apiary server on {}", config.server.addr());
    let server = ApiaryServer::new(config.server);

    tokio::select! {
        result = server.run() => result.map_err(Into::into),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}
