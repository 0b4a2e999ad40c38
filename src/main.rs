//! Convert Relay - Main Binary

use anyhow::Result;
use clap::Parser;
use convert_relay::cli::{client_io_timeout, CliArgs, Command};
use convert_relay::{DispatchTable, InteractiveClient, RelayServer};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    args.setup_logging()?;
    let config = args.load_config().await?;

    match &args.command {
        Command::Serve(_) => {
            println!("🚀 {} v{}", convert_relay::APP_NAME, convert_relay::VERSION);
            println!("   Socket file-conversion relay");
            println!();

            let server = RelayServer::from_config(&config)?;
            if let Some(addr) = server.public_addr() {
                info!("Public listener on {}", addr);
            }
            if config.server.enable_admin {
                info!("Admin socket at {}", config.server.admin_socket.display());
            }
            server.serve().await?;
            info!("Server stopped");
        }
        Command::Client(client) => {
            let endpoint = client.endpoint(&config);
            InteractiveClient::new(endpoint, client_io_timeout(&config))
                .run()
                .await?;
        }
        Command::Menu { extension } => {
            let table = DispatchTable::standard(&config.engines)?;
            print!("{}", table.menu(extension));
        }
    }

    Ok(())
}
